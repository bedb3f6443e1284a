use crate::error::{PduError, SizeMismatch};
use crate::header::{
    CommonPduConfig, Direction, FileDirectiveType, LargeFileFlag, PduHeader, PduType,
    SegmentationControl,
};

/// Reports the receiver's current file-data progress. Like [`crate::prompt::PromptPdu`],
/// generating or handling this PDU is out of scope for this core;
/// it is defined only so the PDU set this packet library exposes is complete.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeepAlivePdu {
    header: PduHeader,
    progress: u64,
}

impl KeepAlivePdu {
    pub fn new(common: CommonPduConfig, progress: u64) -> Self {
        let large_file = if progress > u32::MAX as u64 {
            LargeFileFlag::Large
        } else {
            LargeFileFlag::Normal
        };
        let mut pdu = Self {
            header: PduHeader::new(
                PduType::FileDirective,
                Direction::TowardFileSender,
                &common,
                large_file,
                0,
                SegmentationControl::NoRecordBoundaryPreservation,
            ),
            progress,
        };
        let field_len = if large_file == LargeFileFlag::Large { 8 } else { 4 };
        pdu.header.pdu_data_field_len = (1 + field_len) as u16;
        pdu
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }

    pub fn header(&self) -> &PduHeader {
        &self.header
    }

    fn field_len(&self) -> usize {
        if matches!(self.header.large_file, LargeFileFlag::Large) {
            8
        } else {
            4
        }
    }

    pub fn written_len(&self) -> usize {
        self.header.header_len() + 1 + self.field_len()
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
        buf[idx] = FileDirectiveType::KeepAlivePdu.code();
        idx += 1;
        if self.field_len() == 8 {
            buf[idx..idx + 8].copy_from_slice(&self.progress.to_be_bytes());
            idx += 8;
        } else {
            buf[idx..idx + 4].copy_from_slice(&(self.progress as u32).to_be_bytes());
            idx += 4;
        }
        Ok(idx)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, mut idx) = PduHeader::from_bytes(buf)?;
        let directive = FileDirectiveType::from_code(buf[idx])?;
        if directive != FileDirectiveType::KeepAlivePdu {
            return Err(PduError::WrongDirective(directive));
        }
        idx += 1;
        let progress = if matches!(header.large_file, LargeFileFlag::Large) {
            let v = u64::from_be_bytes(buf[idx..idx + 8].try_into().unwrap());
            idx += 8;
            v
        } else {
            let v = u32::from_be_bytes(buf[idx..idx + 4].try_into().unwrap()) as u64;
            idx += 4;
            v
        };
        let _ = idx;
        Ok(Self { header, progress })
    }
}
