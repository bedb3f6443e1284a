//! The common CFDP PDU header (CCSDS 727.0-B-5, section 5.1) and the small
//! enumerations every PDU kind is built out of.
use crate::error::{PduError, SizeMismatch};

/// A CFDP entity ID. The standard allows 1, 2, 4 or 8 byte wide entity IDs on
/// the wire; we keep the value itself widened to a `u64` in memory and only
/// care about the wire width when encoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EntityId {
    value: u64,
    /// Encoded width in bytes: one of 1, 2, 4, 8.
    width: u8,
}

impl EntityId {
    pub fn new(width: u8, value: u64) -> PduResultEntity {
        if ![1, 2, 4, 8].contains(&width) {
            return Err(PduError::InvalidEntityIdLength(width));
        }
        Ok(Self { value, width })
    }

    /// Smallest legal width which can hold `value`.
    pub fn new_minimal(value: u64) -> Self {
        let width = if value <= u8::MAX as u64 {
            1
        } else if value <= u16::MAX as u64 {
            2
        } else if value <= u32::MAX as u64 {
            4
        } else {
            8
        };
        Self { value, width }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        let width = self.width as usize;
        if buf.len() < width {
            return Err(PduError::ByteConversion(SizeMismatch {
                expected: width,
                found: buf.len(),
            }));
        }
        let be = self.value.to_be_bytes();
        buf[..width].copy_from_slice(&be[8 - width..]);
        Ok(width)
    }

    pub fn from_bytes(width: u8, buf: &[u8]) -> Result<Self, PduError> {
        let w = width as usize;
        if ![1, 2, 4, 8].contains(&width) {
            return Err(PduError::InvalidEntityIdLength(width));
        }
        if buf.len() < w {
            return Err(PduError::ByteConversion(SizeMismatch {
                expected: w,
                found: buf.len(),
            }));
        }
        let mut raw = [0u8; 8];
        raw[8 - w..].copy_from_slice(&buf[..w]);
        Ok(Self {
            value: u64::from_be_bytes(raw),
            width,
        })
    }
}

type PduResultEntity = Result<EntityId, PduError>;

/// The sequence number which, together with the source/destination entity
/// IDs, names a transaction. Shares the same variable-width encoding rules
/// as [`EntityId`].
pub type TransactionSeqNum = EntityId;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PduType {
    FileDirective,
    FileData,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    TowardFileReceiver,
    TowardFileSender,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransmissionMode {
    Acknowledged,
    Unacknowledged,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrcFlag {
    NotPresent,
    Present,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LargeFileFlag {
    Normal,
    Large,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SegmentationControl {
    NoRecordBoundaryPreservation,
    WithRecordBoundaryPreservation,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SegmentMetadataFlag {
    NotPresent,
    Present,
}

/// File directive codes (Table 5-5 of the Blue Book).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileDirectiveType {
    EofPdu,
    FinishedPdu,
    AckPdu,
    MetadataPdu,
    NakPdu,
    PromptPdu,
    KeepAlivePdu,
}

impl FileDirectiveType {
    pub fn code(&self) -> u8 {
        match self {
            Self::EofPdu => 0x04,
            Self::FinishedPdu => 0x05,
            Self::AckPdu => 0x06,
            Self::MetadataPdu => 0x07,
            Self::NakPdu => 0x08,
            Self::PromptPdu => 0x09,
            Self::KeepAlivePdu => 0x0c,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, PduError> {
        Ok(match code {
            0x04 => Self::EofPdu,
            0x05 => Self::FinishedPdu,
            0x06 => Self::AckPdu,
            0x07 => Self::MetadataPdu,
            0x08 => Self::NakPdu,
            0x09 => Self::PromptPdu,
            0x0c => Self::KeepAlivePdu,
            other => return Err(PduError::UnknownDirective(other)),
        })
    }
}

/// CFDP condition codes (Table 5-6).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConditionCode {
    NoError,
    PositiveAckLimitReached,
    KeepAliveLimitReached,
    InvalidTransmissionMode,
    FilestoreRejection,
    FileChecksumFailure,
    FileSizeError,
    NakLimitReached,
    InactivityDetected,
    InvalidFileStructure,
    CheckLimitReached,
    UnsupportedChecksumType,
    SuspendRequestReceived,
    CancelRequestReceived,
    Reserved(u8),
}

impl ConditionCode {
    pub fn code(&self) -> u8 {
        match self {
            Self::NoError => 0b0000,
            Self::PositiveAckLimitReached => 0b0001,
            Self::KeepAliveLimitReached => 0b0010,
            Self::InvalidTransmissionMode => 0b0011,
            Self::FilestoreRejection => 0b0100,
            Self::FileChecksumFailure => 0b0101,
            Self::FileSizeError => 0b0110,
            Self::NakLimitReached => 0b0111,
            Self::InactivityDetected => 0b1000,
            Self::InvalidFileStructure => 0b1001,
            Self::CheckLimitReached => 0b1010,
            Self::UnsupportedChecksumType => 0b1011,
            Self::SuspendRequestReceived => 0b1110,
            Self::CancelRequestReceived => 0b1111,
            Self::Reserved(v) => *v,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code & 0b1111 {
            0b0000 => Self::NoError,
            0b0001 => Self::PositiveAckLimitReached,
            0b0010 => Self::KeepAliveLimitReached,
            0b0011 => Self::InvalidTransmissionMode,
            0b0100 => Self::FilestoreRejection,
            0b0101 => Self::FileChecksumFailure,
            0b0110 => Self::FileSizeError,
            0b0111 => Self::NakLimitReached,
            0b1000 => Self::InactivityDetected,
            0b1001 => Self::InvalidFileStructure,
            0b1010 => Self::CheckLimitReached,
            0b1011 => Self::UnsupportedChecksumType,
            0b1110 => Self::SuspendRequestReceived,
            0b1111 => Self::CancelRequestReceived,
            other => Self::Reserved(other),
        }
    }
}

/// Checksum algorithm identifier carried in the Metadata PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChecksumType {
    Modular,
    Crc32,
    Null,
}

impl ChecksumType {
    pub fn code(&self) -> u8 {
        match self {
            Self::Modular => 0,
            Self::Crc32 => 3,
            Self::Null => 15,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, PduError> {
        Ok(match code {
            0 => Self::Modular,
            3 => Self::Crc32,
            15 => Self::Null,
            other => return Err(PduError::UnknownChecksumType(other)),
        })
    }
}

/// Fields that are the same for every PDU of a transaction: the two entity
/// IDs, the transaction sequence number, and the transmission-mode bits.
/// Constructed once per transaction and cheaply copied into each PDU
/// constructor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommonPduConfig {
    pub source_entity_id: EntityId,
    pub dest_entity_id: EntityId,
    pub transaction_seq_num: TransactionSeqNum,
    pub trans_mode: TransmissionMode,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub crc_flag: CrcFlagSerde,
}

/// `CrcFlag` has no meaningful default serialization (it is re-derived from
/// the MIB's CRC-on-transmission setting at PDU build time), so we keep a
/// small local newtype instead of deriving serde directly on the enum.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct CrcFlagSerde(pub bool);

impl CommonPduConfig {
    pub fn new(
        source_entity_id: EntityId,
        dest_entity_id: EntityId,
        transaction_seq_num: TransactionSeqNum,
        trans_mode: TransmissionMode,
        crc_on_transmission: bool,
    ) -> Self {
        Self {
            source_entity_id,
            dest_entity_id,
            transaction_seq_num,
            trans_mode,
            crc_flag: CrcFlagSerde(crc_on_transmission),
        }
    }

    pub fn crc_flag(&self) -> CrcFlag {
        if self.crc_flag.0 {
            CrcFlag::Present
        } else {
            CrcFlag::NotPresent
        }
    }
}

/// The fully decoded fixed + variable header of one PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub pdu_type: PduType,
    pub direction: Direction,
    pub trans_mode: TransmissionMode,
    pub crc_flag: CrcFlag,
    pub large_file: LargeFileFlag,
    pub pdu_data_field_len: u16,
    pub segmentation_control: SegmentationControl,
    pub segment_metadata_flag: SegmentMetadataFlag,
    pub source_entity_id: EntityId,
    pub transaction_seq_num: TransactionSeqNum,
    pub dest_entity_id: EntityId,
}

const CFDP_VERSION: u8 = 0b001;

impl PduHeader {
    pub fn new(
        pdu_type: PduType,
        direction: Direction,
        common: &CommonPduConfig,
        large_file: LargeFileFlag,
        pdu_data_field_len: u16,
        segmentation_control: SegmentationControl,
    ) -> Self {
        Self {
            pdu_type,
            direction,
            trans_mode: common.trans_mode,
            crc_flag: common.crc_flag(),
            large_file,
            pdu_data_field_len,
            segmentation_control,
            segment_metadata_flag: SegmentMetadataFlag::NotPresent,
            source_entity_id: common.source_entity_id,
            transaction_seq_num: common.transaction_seq_num,
            dest_entity_id: common.dest_entity_id,
        }
    }

    /// Size in bytes of the fixed 4-octet header plus the three variable
    /// width identifier fields.
    pub fn header_len(&self) -> usize {
        4 + self.source_entity_id.width() as usize
            + self.transaction_seq_num.width() as usize
            + self.dest_entity_id.width() as usize
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        let len = self.header_len();
        if buf.len() < len {
            return Err(PduError::ByteConversion(SizeMismatch {
                expected: len,
                found: buf.len(),
            }));
        }
        let mut octet1 = CFDP_VERSION << 5;
        if matches!(self.pdu_type, PduType::FileData) {
            octet1 |= 1 << 4;
        }
        if matches!(self.direction, Direction::TowardFileSender) {
            octet1 |= 1 << 3;
        }
        if matches!(self.trans_mode, TransmissionMode::Unacknowledged) {
            octet1 |= 1 << 2;
        }
        if matches!(self.crc_flag, CrcFlag::Present) {
            octet1 |= 1 << 1;
        }
        if matches!(self.large_file, LargeFileFlag::Large) {
            octet1 |= 1;
        }
        buf[0] = octet1;
        buf[1..3].copy_from_slice(&self.pdu_data_field_len.to_be_bytes());

        let mut octet4 = 0u8;
        if matches!(
            self.segmentation_control,
            SegmentationControl::WithRecordBoundaryPreservation
        ) {
            octet4 |= 1 << 7;
        }
        octet4 |= (self.source_entity_id.width() - 1) << 4;
        if matches!(self.segment_metadata_flag, SegmentMetadataFlag::Present) {
            octet4 |= 1 << 3;
        }
        octet4 |= self.transaction_seq_num.width() - 1;
        buf[3] = octet4;

        let mut idx = 4;
        idx += self.source_entity_id.write_to_bytes(&mut buf[idx..])?;
        idx += self.transaction_seq_num.write_to_bytes(&mut buf[idx..])?;
        idx += self.dest_entity_id.write_to_bytes(&mut buf[idx..])?;
        Ok(idx)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize), PduError> {
        if buf.len() < 4 {
            return Err(PduError::RawDataTooShort(buf.len()));
        }
        let octet1 = buf[0];
        let pdu_type = if octet1 & (1 << 4) != 0 {
            PduType::FileData
        } else {
            PduType::FileDirective
        };
        let direction = if octet1 & (1 << 3) != 0 {
            Direction::TowardFileSender
        } else {
            Direction::TowardFileReceiver
        };
        let trans_mode = if octet1 & (1 << 2) != 0 {
            TransmissionMode::Unacknowledged
        } else {
            TransmissionMode::Acknowledged
        };
        let crc_flag = if octet1 & (1 << 1) != 0 {
            CrcFlag::Present
        } else {
            CrcFlag::NotPresent
        };
        let large_file = if octet1 & 1 != 0 {
            LargeFileFlag::Large
        } else {
            LargeFileFlag::Normal
        };
        let pdu_data_field_len = u16::from_be_bytes([buf[1], buf[2]]);
        let octet4 = buf[3];
        let segmentation_control = if octet4 & (1 << 7) != 0 {
            SegmentationControl::WithRecordBoundaryPreservation
        } else {
            SegmentationControl::NoRecordBoundaryPreservation
        };
        let entity_id_width = ((octet4 >> 4) & 0b111) + 1;
        let segment_metadata_flag = if octet4 & (1 << 3) != 0 {
            SegmentMetadataFlag::Present
        } else {
            SegmentMetadataFlag::NotPresent
        };
        let seq_num_width = (octet4 & 0b111) + 1;

        let mut idx = 4;
        let source_entity_id = EntityId::from_bytes(entity_id_width, &buf[idx..])?;
        idx += entity_id_width as usize;
        let transaction_seq_num = EntityId::from_bytes(seq_num_width, &buf[idx..])?;
        idx += seq_num_width as usize;
        let dest_entity_id = EntityId::from_bytes(entity_id_width, &buf[idx..])?;
        idx += entity_id_width as usize;

        Ok((
            Self {
                pdu_type,
                direction,
                trans_mode,
                crc_flag,
                large_file,
                pdu_data_field_len,
                segmentation_control,
                segment_metadata_flag,
                source_entity_id,
                transaction_seq_num,
                dest_entity_id,
            },
            idx,
        ))
    }

    pub fn common_config(&self) -> CommonPduConfig {
        CommonPduConfig::new(
            self.source_entity_id,
            self.dest_entity_id,
            self.transaction_seq_num,
            self.trans_mode,
            matches!(self.crc_flag, CrcFlag::Present),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_round_trip() {
        let id = EntityId::new(2, 0x1234).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(id.write_to_bytes(&mut buf).unwrap(), 2);
        assert_eq!(buf, [0x12, 0x34]);
        let back = EntityId::from_bytes(2, &buf).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn header_round_trip() {
        let common = CommonPduConfig::new(
            EntityId::new_minimal(1),
            EntityId::new_minimal(2),
            EntityId::new_minimal(42),
            TransmissionMode::Acknowledged,
            false,
        );
        let header = PduHeader::new(
            PduType::FileDirective,
            Direction::TowardFileReceiver,
            &common,
            LargeFileFlag::Normal,
            10,
            SegmentationControl::NoRecordBoundaryPreservation,
        );
        let mut buf = [0u8; 64];
        let written = header.write_to_bytes(&mut buf).unwrap();
        let (decoded, consumed) = PduHeader::from_bytes(&buf).unwrap();
        assert_eq!(written, consumed);
        assert_eq!(decoded, header);
    }
}
