use crate::error::{PduError, SizeMismatch};
use crate::header::{
    CommonPduConfig, Direction, FileDirectiveType, LargeFileFlag, PduHeader, PduType,
    SegmentationControl,
};

/// One missing byte range, `[start_offset, end_offset)`. The special value
/// `(0, 0)` means "retransmit the Metadata PDU".
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub start_offset: u64,
    pub end_offset: u64,
}

impl SegmentRequest {
    pub fn new(start_offset: u64, end_offset: u64) -> Self {
        Self {
            start_offset,
            end_offset,
        }
    }

    pub fn metadata_request() -> Self {
        Self::new(0, 0)
    }

    pub fn is_metadata_request(&self) -> bool {
        self.start_offset == 0 && self.end_offset == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakPdu {
    header: PduHeader,
    start_of_scope: u64,
    end_of_scope: u64,
    segment_requests: Vec<SegmentRequest>,
}

impl NakPdu {
    pub fn new(
        common: CommonPduConfig,
        start_of_scope: u64,
        end_of_scope: u64,
        segment_requests: Vec<SegmentRequest>,
    ) -> Self {
        let large_file = if end_of_scope > u32::MAX as u64 {
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
            start_of_scope,
            end_of_scope,
            segment_requests,
        };
        pdu.header.pdu_data_field_len = pdu.data_field_len() as u16;
        pdu
    }

    pub fn start_of_scope(&self) -> u64 {
        self.start_of_scope
    }

    pub fn end_of_scope(&self) -> u64 {
        self.end_of_scope
    }

    pub fn segment_requests(&self) -> &[SegmentRequest] {
        &self.segment_requests
    }

    pub fn header(&self) -> &PduHeader {
        &self.header
    }

    fn scope_field_len(&self) -> usize {
        if matches!(self.header.large_file, LargeFileFlag::Large) {
            8
        } else {
            4
        }
    }

    fn data_field_len(&self) -> usize {
        1 + 2 * self.scope_field_len() + self.segment_requests.len() * 2 * self.scope_field_len()
    }

    pub fn written_len(&self) -> usize {
        self.header.header_len() + self.data_field_len()
    }

    fn write_scope_value(&self, buf: &mut [u8], value: u64) -> usize {
        if self.scope_field_len() == 8 {
            buf[..8].copy_from_slice(&value.to_be_bytes());
            8
        } else {
            buf[..4].copy_from_slice(&(value as u32).to_be_bytes());
            4
        }
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
        buf[idx] = FileDirectiveType::NakPdu.code();
        idx += 1;
        idx += self.write_scope_value(&mut buf[idx..], self.start_of_scope);
        idx += self.write_scope_value(&mut buf[idx..], self.end_of_scope);
        for req in &self.segment_requests {
            idx += self.write_scope_value(&mut buf[idx..], req.start_offset);
            idx += self.write_scope_value(&mut buf[idx..], req.end_offset);
        }
        Ok(idx)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, mut idx) = PduHeader::from_bytes(buf)?;
        let directive = FileDirectiveType::from_code(buf[idx])?;
        if directive != FileDirectiveType::NakPdu {
            return Err(PduError::WrongDirective(directive));
        }
        idx += 1;
        let field_len = if matches!(header.large_file, LargeFileFlag::Large) {
            8
        } else {
            4
        };
        let read_val = |b: &[u8]| -> u64 {
            if field_len == 8 {
                u64::from_be_bytes(b[..8].try_into().unwrap())
            } else {
                u32::from_be_bytes(b[..4].try_into().unwrap()) as u64
            }
        };
        let start_of_scope = read_val(&buf[idx..]);
        idx += field_len;
        let end_of_scope = read_val(&buf[idx..]);
        idx += field_len;
        let mut segment_requests = Vec::new();
        while idx + 2 * field_len <= buf.len() {
            let start = read_val(&buf[idx..]);
            idx += field_len;
            let end = read_val(&buf[idx..]);
            idx += field_len;
            segment_requests.push(SegmentRequest::new(start, end));
        }
        Ok(Self {
            header,
            start_of_scope,
            end_of_scope,
            segment_requests,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{EntityId, TransmissionMode};

    #[test]
    fn round_trip_with_gaps() {
        let common = CommonPduConfig::new(
            EntityId::new_minimal(2),
            EntityId::new_minimal(1),
            EntityId::new_minimal(5),
            TransmissionMode::Acknowledged,
            false,
        );
        let pdu = NakPdu::new(
            common,
            0,
            5120,
            vec![
                SegmentRequest::new(2048, 3072),
                SegmentRequest::new(4096, 5120),
            ],
        );
        let mut buf = [0u8; 64];
        let written = pdu.write_to_bytes(&mut buf).unwrap();
        let decoded = NakPdu::from_bytes(&buf[..written]).unwrap();
        assert_eq!(decoded, pdu);
    }
}
