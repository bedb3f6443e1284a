use crate::error::{PduError, SizeMismatch};
use crate::header::{
    ChecksumType, CommonPduConfig, ConditionCode, Direction, EntityId, FileDirectiveType,
    LargeFileFlag, PduHeader, PduType, SegmentationControl,
};

/// The End-of-File directive. `fault_location` is only meaningful when
/// `condition_code` is not [`ConditionCode::NoError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EofPdu {
    header: PduHeader,
    condition_code: ConditionCode,
    file_checksum: u32,
    file_size: u64,
    fault_location: Option<EntityId>,
}

impl EofPdu {
    pub fn new(
        common: CommonPduConfig,
        condition_code: ConditionCode,
        file_checksum: u32,
        file_size: u64,
        fault_location: Option<EntityId>,
    ) -> Self {
        let large_file = if file_size > u32::MAX as u64 {
            LargeFileFlag::Large
        } else {
            LargeFileFlag::Normal
        };
        let mut pdu = Self {
            header: PduHeader::new(
                PduType::FileDirective,
                Direction::TowardFileReceiver,
                &common,
                large_file,
                0,
                SegmentationControl::NoRecordBoundaryPreservation,
            ),
            condition_code,
            file_checksum,
            file_size,
            fault_location,
        };
        pdu.header.pdu_data_field_len = pdu.data_field_len() as u16;
        pdu
    }

    pub fn condition_code(&self) -> ConditionCode {
        self.condition_code
    }

    pub fn file_checksum(&self) -> u32 {
        self.file_checksum
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn fault_location(&self) -> Option<EntityId> {
        self.fault_location
    }

    pub fn header(&self) -> &PduHeader {
        &self.header
    }

    fn file_size_field_len(&self) -> usize {
        if matches!(self.header.large_file, LargeFileFlag::Large) {
            8
        } else {
            4
        }
    }

    fn data_field_len(&self) -> usize {
        let mut len = 1 + 1 + 4 + self.file_size_field_len();
        if let Some(id) = self.fault_location {
            len += 2 + id.width() as usize;
        }
        len
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
        buf[idx] = FileDirectiveType::EofPdu.code();
        idx += 1;
        buf[idx] = self.condition_code.code() << 4;
        idx += 1;
        buf[idx..idx + 4].copy_from_slice(&self.file_checksum.to_be_bytes());
        idx += 4;
        if self.file_size_field_len() == 8 {
            buf[idx..idx + 8].copy_from_slice(&self.file_size.to_be_bytes());
            idx += 8;
        } else {
            buf[idx..idx + 4].copy_from_slice(&(self.file_size as u32).to_be_bytes());
            idx += 4;
        }
        if let Some(id) = self.fault_location {
            buf[idx] = crate::tlv::TlvType::EntityId.code();
            idx += 1;
            buf[idx] = id.width();
            idx += 1;
            idx += id.write_to_bytes(&mut buf[idx..])?;
        }
        Ok(idx)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, mut idx) = PduHeader::from_bytes(buf)?;
        let directive = FileDirectiveType::from_code(buf[idx])?;
        if directive != FileDirectiveType::EofPdu {
            return Err(PduError::WrongDirective(directive));
        }
        idx += 1;
        let condition_code = ConditionCode::from_code(buf[idx] >> 4);
        idx += 1;
        let file_checksum = u32::from_be_bytes(buf[idx..idx + 4].try_into().unwrap());
        idx += 4;
        let file_size = if matches!(header.large_file, LargeFileFlag::Large) {
            let v = u64::from_be_bytes(buf[idx..idx + 8].try_into().unwrap());
            idx += 8;
            v
        } else {
            let v = u32::from_be_bytes(buf[idx..idx + 4].try_into().unwrap()) as u64;
            idx += 4;
            v
        };
        let fault_location = if idx < buf.len() {
            // skip the TLV type byte, the width byte carries the entity ID's width
            idx += 1;
            let width = buf[idx];
            idx += 1;
            let id = EntityId::from_bytes(width, &buf[idx..])?;
            idx += width as usize;
            Some(id)
        } else {
            None
        };
        Ok(Self {
            header,
            condition_code,
            file_checksum,
            file_size,
            fault_location,
        })
    }
}
