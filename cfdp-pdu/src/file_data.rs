use crate::error::{PduError, SizeMismatch};
use crate::header::{CommonPduConfig, Direction, LargeFileFlag, PduHeader, PduType, SegmentationControl};

/// A File Data PDU: an offset plus a slice of file content. Segment metadata
/// (record boundaries) is not supported by this core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDataPdu {
    header: PduHeader,
    offset: u64,
    data: Vec<u8>,
}

impl FileDataPdu {
    pub fn new(common: CommonPduConfig, offset: u64, data: Vec<u8>, large_file: bool) -> Self {
        let large_file = if large_file || offset + data.len() as u64 > u32::MAX as u64 {
            LargeFileFlag::Large
        } else {
            LargeFileFlag::Normal
        };
        let mut pdu = Self {
            header: PduHeader::new(
                PduType::FileData,
                Direction::TowardFileReceiver,
                &common,
                large_file,
                0,
                SegmentationControl::NoRecordBoundaryPreservation,
            ),
            offset,
            data,
        };
        pdu.header.pdu_data_field_len = pdu.data_field_len() as u16;
        pdu
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn header(&self) -> &PduHeader {
        &self.header
    }

    fn offset_field_len(&self) -> usize {
        if matches!(self.header.large_file, LargeFileFlag::Large) {
            8
        } else {
            4
        }
    }

    fn data_field_len(&self) -> usize {
        self.offset_field_len() + self.data.len()
    }

    pub fn written_len(&self) -> usize {
        self.header.header_len() + self.data_field_len()
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
        if self.offset_field_len() == 8 {
            buf[idx..idx + 8].copy_from_slice(&self.offset.to_be_bytes());
            idx += 8;
        } else {
            buf[idx..idx + 4].copy_from_slice(&(self.offset as u32).to_be_bytes());
            idx += 4;
        }
        buf[idx..idx + self.data.len()].copy_from_slice(&self.data);
        idx += self.data.len();
        Ok(idx)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, mut idx) = PduHeader::from_bytes(buf)?;
        if header.pdu_type != PduType::FileData {
            return Err(PduError::NotFileData);
        }
        let offset = if matches!(header.large_file, LargeFileFlag::Large) {
            let v = u64::from_be_bytes(
                buf.get(idx..idx + 8)
                    .ok_or(PduError::RawDataTooShort(buf.len()))?
                    .try_into()
                    .unwrap(),
            );
            idx += 8;
            v
        } else {
            let v = u32::from_be_bytes(
                buf.get(idx..idx + 4)
                    .ok_or(PduError::RawDataTooShort(buf.len()))?
                    .try_into()
                    .unwrap(),
            ) as u64;
            idx += 4;
            v
        };
        let data = buf[idx..].to_vec();
        Ok(Self {
            header,
            offset,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{EntityId, TransmissionMode};

    #[test]
    fn round_trip() {
        let common = CommonPduConfig::new(
            EntityId::new_minimal(1),
            EntityId::new_minimal(2),
            EntityId::new_minimal(9),
            TransmissionMode::Acknowledged,
            false,
        );
        let pdu = FileDataPdu::new(common, 1024, vec![1, 2, 3, 4], false);
        let mut buf = [0u8; 64];
        let written = pdu.write_to_bytes(&mut buf).unwrap();
        let decoded = FileDataPdu::from_bytes(&buf[..written]).unwrap();
        assert_eq!(decoded, pdu);
        assert_eq!(decoded.offset(), 1024);
        assert_eq!(decoded.data(), &[1, 2, 3, 4]);
    }
}
