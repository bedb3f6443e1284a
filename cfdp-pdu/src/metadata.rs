use crate::error::{PduError, SizeMismatch};
use crate::header::{
    ChecksumType, CommonPduConfig, Direction, FileDirectiveType, LargeFileFlag, PduHeader,
    PduType, SegmentationControl,
};
use crate::tlv::{FilestoreRequest, MessageToUser, Tlv};

/// The fixed-format part of the Metadata PDU that sits ahead of the two LV
/// file name fields and the TLV list (section 5.2.5 of the Blue Book).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetadataGenericParams {
    pub closure_requested: bool,
    pub checksum_type: ChecksumType,
    pub file_size: u64,
}

impl MetadataGenericParams {
    pub fn new(closure_requested: bool, checksum_type: ChecksumType, file_size: u64) -> Self {
        Self {
            closure_requested,
            checksum_type,
            file_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPdu {
    header: PduHeader,
    params: MetadataGenericParams,
    src_file_name: String,
    dest_file_name: String,
    options: Vec<Tlv>,
}

impl MetadataPdu {
    pub fn new(
        common: CommonPduConfig,
        params: MetadataGenericParams,
        src_file_name: String,
        dest_file_name: String,
        messages_to_user: &[MessageToUser],
        filestore_requests: &[FilestoreRequest],
    ) -> Self {
        let mut options: Vec<Tlv> = filestore_requests.iter().map(|r| r.to_tlv()).collect();
        options.extend(messages_to_user.iter().map(|m| m.to_tlv()));
        let large_file = if params.file_size > u32::MAX as u64 {
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
            params,
            src_file_name,
            dest_file_name,
            options,
        };
        pdu.header.pdu_data_field_len = pdu.data_field_len() as u16;
        pdu
    }

    pub fn metadata_params(&self) -> &MetadataGenericParams {
        &self.params
    }

    pub fn src_file_name(&self) -> &str {
        &self.src_file_name
    }

    pub fn dest_file_name(&self) -> &str {
        &self.dest_file_name
    }

    pub fn options(&self) -> &[Tlv] {
        &self.options
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
        let mut len = 1 + 1 + self.file_size_field_len();
        len += 1 + self.src_file_name.len();
        len += 1 + self.dest_file_name.len();
        len += self.options.iter().map(|t| t.len_full()).sum::<usize>();
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
        buf[idx] = FileDirectiveType::MetadataPdu.code();
        idx += 1;
        buf[idx] = (self.params.closure_requested as u8) << 6 | self.params.checksum_type.code();
        idx += 1;
        if self.file_size_field_len() == 8 {
            buf[idx..idx + 8].copy_from_slice(&self.params.file_size.to_be_bytes());
            idx += 8;
        } else {
            buf[idx..idx + 4].copy_from_slice(&(self.params.file_size as u32).to_be_bytes());
            idx += 4;
        }
        buf[idx] = self.src_file_name.len() as u8;
        idx += 1;
        buf[idx..idx + self.src_file_name.len()].copy_from_slice(self.src_file_name.as_bytes());
        idx += self.src_file_name.len();
        buf[idx] = self.dest_file_name.len() as u8;
        idx += 1;
        buf[idx..idx + self.dest_file_name.len()].copy_from_slice(self.dest_file_name.as_bytes());
        idx += self.dest_file_name.len();
        for tlv in &self.options {
            idx += tlv.write_to_bytes(&mut buf[idx..])?;
        }
        Ok(idx)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, mut idx) = PduHeader::from_bytes(buf)?;
        if buf.len() <= idx {
            return Err(PduError::RawDataTooShort(buf.len()));
        }
        let directive = FileDirectiveType::from_code(buf[idx])?;
        if directive != FileDirectiveType::MetadataPdu {
            return Err(PduError::WrongDirective(directive));
        }
        idx += 1;
        let flags = buf[idx];
        idx += 1;
        let closure_requested = flags & (1 << 6) != 0;
        let checksum_type = ChecksumType::from_code(flags & 0b1111)?;
        let file_size = if matches!(header.large_file, LargeFileFlag::Large) {
            let v = u64::from_be_bytes(buf[idx..idx + 8].try_into().unwrap());
            idx += 8;
            v
        } else {
            let v = u32::from_be_bytes(buf[idx..idx + 4].try_into().unwrap()) as u64;
            idx += 4;
            v
        };
        let src_len = buf[idx] as usize;
        idx += 1;
        let src_file_name = String::from_utf8_lossy(&buf[idx..idx + src_len]).into_owned();
        idx += src_len;
        let dest_len = buf[idx] as usize;
        idx += 1;
        let dest_file_name = String::from_utf8_lossy(&buf[idx..idx + dest_len]).into_owned();
        idx += dest_len;
        let mut options = Vec::new();
        while idx < buf.len() {
            let (tlv, consumed) = Tlv::from_bytes(&buf[idx..])?;
            idx += consumed;
            options.push(tlv);
        }
        Ok(Self {
            header,
            params: MetadataGenericParams::new(closure_requested, checksum_type, file_size),
            src_file_name,
            dest_file_name,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{EntityId, TransmissionMode};

    fn common() -> CommonPduConfig {
        CommonPduConfig::new(
            EntityId::new_minimal(1),
            EntityId::new_minimal(2),
            EntityId::new_minimal(7),
            TransmissionMode::Acknowledged,
            false,
        )
    }

    #[test]
    fn round_trip() {
        let pdu = MetadataPdu::new(
            common(),
            MetadataGenericParams::new(true, ChecksumType::Crc32, 4096),
            "src.bin".into(),
            "dest.bin".into(),
            &[],
            &[],
        );
        let mut buf = [0u8; 128];
        let written = pdu.write_to_bytes(&mut buf).unwrap();
        let decoded = MetadataPdu::from_bytes(&buf[..written]).unwrap();
        assert_eq!(decoded, pdu);
    }
}
