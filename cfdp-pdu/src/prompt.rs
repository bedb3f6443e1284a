use crate::error::{PduError, SizeMismatch};
use crate::header::{
    CommonPduConfig, Direction, FileDirectiveType, LargeFileFlag, PduHeader, PduType,
    SegmentationControl,
};

/// What the Prompt PDU is asking the receiver to do. Neither generating nor
/// reacting to a Prompt PDU is implemented by this core; the
/// type exists so the packet library's PDU set stays complete and so a
/// caller-supplied transport can still decode one without erroring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PromptResponseRequired {
    Nak,
    KeepAlive,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PromptPdu {
    header: PduHeader,
    response_required: PromptResponseRequired,
}

impl PromptPdu {
    pub fn new(common: CommonPduConfig, response_required: PromptResponseRequired) -> Self {
        let mut pdu = Self {
            header: PduHeader::new(
                PduType::FileDirective,
                Direction::TowardFileReceiver,
                &common,
                LargeFileFlag::Normal,
                0,
                SegmentationControl::NoRecordBoundaryPreservation,
            ),
            response_required,
        };
        pdu.header.pdu_data_field_len = 2;
        pdu
    }

    pub fn response_required(&self) -> PromptResponseRequired {
        self.response_required
    }

    pub fn header(&self) -> &PduHeader {
        &self.header
    }

    pub fn written_len(&self) -> usize {
        self.header.header_len() + 2
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        let total = self.written_len();
        if buf.len() < total {
            return Err(PduError::ByteConversion(SizeMismatch {
                expected: total,
                found: buf.len(),
            }));
        }
        let mut idx = self.header.write_to_bytes(buf)?;
        buf[idx] = FileDirectiveType::PromptPdu.code();
        idx += 1;
        buf[idx] = match self.response_required {
            PromptResponseRequired::Nak => 0,
            PromptResponseRequired::KeepAlive => 1 << 7,
        };
        idx += 1;
        Ok(idx)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, mut idx) = PduHeader::from_bytes(buf)?;
        let directive = FileDirectiveType::from_code(buf[idx])?;
        if directive != FileDirectiveType::PromptPdu {
            return Err(PduError::WrongDirective(directive));
        }
        idx += 1;
        let response_required = if buf[idx] & (1 << 7) != 0 {
            PromptResponseRequired::KeepAlive
        } else {
            PromptResponseRequired::Nak
        };
        Ok(Self {
            header,
            response_required,
        })
    }
}
