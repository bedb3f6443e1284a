//! Typed CCSDS CFDP (727.0-B-5) PDU definitions and their byte encoding and
//! decoding.
//!
//! This crate plays the same role for `cfdp-core` that `spacepackets` plays
//! for `satrs-core`'s PUS/TC handling: it owns the wire format so the
//! handler state machines can work exclusively with typed values.

pub mod ack;
pub mod eof;
pub mod error;
pub mod file_data;
pub mod finished;
pub mod header;
pub mod keepalive;
pub mod metadata;
pub mod nak;
pub mod prompt;
pub mod tlv;

pub use ack::{AckPdu, TransactionStatus};
pub use eof::EofPdu;
pub use error::{PduError, SizeMismatch};
pub use file_data::FileDataPdu;
pub use finished::{DeliveryCode, FileStatus, FinishedPdu};
pub use header::{
    ChecksumType, CommonPduConfig, ConditionCode, CrcFlag, Direction, EntityId, FileDirectiveType,
    LargeFileFlag, PduHeader, PduType, SegmentationControl, TransactionSeqNum, TransmissionMode,
};
pub use keepalive::KeepAlivePdu;
pub use metadata::{MetadataGenericParams, MetadataPdu};
pub use nak::{NakPdu, SegmentRequest};
pub use prompt::{PromptPdu, PromptResponseRequired};
pub use tlv::{
    FilestoreAction, FilestoreRequest, FilestoreResponse, FilestoreResponseStatus, MessageToUser,
    Tlv, TlvType,
};

/// Every PDU this core's handlers can consume or emit, decoded into its
/// concrete typed form. `Pdu::from_bytes` is the single entry point transport
/// layers use to hand a received datagram to either handler's `state_machine`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Metadata(MetadataPdu),
    FileData(FileDataPdu),
    Eof(EofPdu),
    Finished(FinishedPdu),
    Ack(AckPdu),
    Nak(NakPdu),
    Prompt(PromptPdu),
    KeepAlive(KeepAlivePdu),
}

impl Pdu {
    /// Peeks the common header to determine the PDU kind, then fully decodes
    /// it using the matching typed constructor.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, idx) = PduHeader::from_bytes(buf)?;
        if header.pdu_type == PduType::FileData {
            return Ok(Pdu::FileData(FileDataPdu::from_bytes(buf)?));
        }
        if buf.len() <= idx {
            return Err(PduError::RawDataTooShort(buf.len()));
        }
        let directive = FileDirectiveType::from_code(buf[idx])?;
        Ok(match directive {
            FileDirectiveType::MetadataPdu => Pdu::Metadata(MetadataPdu::from_bytes(buf)?),
            FileDirectiveType::EofPdu => Pdu::Eof(EofPdu::from_bytes(buf)?),
            FileDirectiveType::FinishedPdu => Pdu::Finished(FinishedPdu::from_bytes(buf)?),
            FileDirectiveType::AckPdu => Pdu::Ack(AckPdu::from_bytes(buf)?),
            FileDirectiveType::NakPdu => Pdu::Nak(NakPdu::from_bytes(buf)?),
            FileDirectiveType::PromptPdu => Pdu::Prompt(PromptPdu::from_bytes(buf)?),
            FileDirectiveType::KeepAlivePdu => Pdu::KeepAlive(KeepAlivePdu::from_bytes(buf)?),
        })
    }

    pub fn common_config(&self) -> CommonPduConfig {
        match self {
            Pdu::Metadata(p) => p.header().common_config(),
            Pdu::FileData(p) => p.header().common_config(),
            Pdu::Eof(p) => p.header().common_config(),
            Pdu::Finished(p) => p.header().common_config(),
            Pdu::Ack(p) => p.header().common_config(),
            Pdu::Nak(p) => p.header().common_config(),
            Pdu::Prompt(p) => p.header().common_config(),
            Pdu::KeepAlive(p) => p.header().common_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{EntityId, TransmissionMode};

    #[test]
    fn dispatch_round_trip() {
        let common = CommonPduConfig::new(
            EntityId::new_minimal(1),
            EntityId::new_minimal(2),
            EntityId::new_minimal(3),
            TransmissionMode::Acknowledged,
            false,
        );
        let pdu = FileDataPdu::new(common, 0, vec![1, 2, 3], false);
        let mut buf = [0u8; 64];
        let written = pdu.write_to_bytes(&mut buf).unwrap();
        let decoded = Pdu::from_bytes(&buf[..written]).unwrap();
        assert!(matches!(decoded, Pdu::FileData(_)));
    }
}
