use crate::error::{PduError, SizeMismatch};
use crate::header::{
    CommonPduConfig, ConditionCode, Direction, EntityId, FileDirectiveType, LargeFileFlag,
    PduHeader, PduType, SegmentationControl,
};
use crate::tlv::Tlv;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeliveryCode {
    Complete,
    Incomplete,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FileStatus {
    DiscardedFilestoreRejection,
    DiscardedFileSizeError,
    Retained,
    Unreported,
}

impl FileStatus {
    fn code(self) -> u8 {
        match self {
            Self::DiscardedFilestoreRejection => 0b00,
            Self::DiscardedFileSizeError => 0b01,
            Self::Retained => 0b10,
            Self::Unreported => 0b11,
        }
    }

    fn from_code(code: u8) -> Self {
        match code & 0b11 {
            0b00 => Self::DiscardedFilestoreRejection,
            0b01 => Self::DiscardedFileSizeError,
            0b10 => Self::Retained,
            _ => Self::Unreported,
        }
    }
}

/// The receiver's closing directive. `filestore_responses` and
/// `fault_location` are carried as raw TLVs at the byte level; `cfdp-core`
/// decodes `FilestoreResponse`s out of the former when it needs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedPdu {
    header: PduHeader,
    condition_code: ConditionCode,
    delivery_code: DeliveryCode,
    file_status: FileStatus,
    filestore_responses: Vec<Tlv>,
    fault_location: Option<EntityId>,
}

impl FinishedPdu {
    pub fn new(
        common: CommonPduConfig,
        condition_code: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
        filestore_responses: Vec<Tlv>,
        fault_location: Option<EntityId>,
    ) -> Self {
        let mut pdu = Self {
            header: PduHeader::new(
                PduType::FileDirective,
                Direction::TowardFileSender,
                &common,
                LargeFileFlag::Normal,
                0,
                SegmentationControl::NoRecordBoundaryPreservation,
            ),
            condition_code,
            delivery_code,
            file_status,
            filestore_responses,
            fault_location,
        };
        pdu.header.pdu_data_field_len = pdu.data_field_len() as u16;
        pdu
    }

    pub fn condition_code(&self) -> ConditionCode {
        self.condition_code
    }

    pub fn delivery_code(&self) -> DeliveryCode {
        self.delivery_code
    }

    pub fn file_status(&self) -> FileStatus {
        self.file_status
    }

    pub fn filestore_responses(&self) -> &[Tlv] {
        &self.filestore_responses
    }

    pub fn fault_location(&self) -> Option<EntityId> {
        self.fault_location
    }

    pub fn header(&self) -> &PduHeader {
        &self.header
    }

    fn data_field_len(&self) -> usize {
        let mut len = 1;
        len += self
            .filestore_responses
            .iter()
            .map(|t| t.len_full())
            .sum::<usize>();
        if let Some(id) = self.fault_location {
            len += 2 + id.width() as usize;
        }
        len
    }

    pub fn written_len(&self) -> usize {
        self.header.header_len() + 1 + self.data_field_len()
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
        buf[idx] = FileDirectiveType::FinishedPdu.code();
        idx += 1;
        let mut octet = self.condition_code.code() << 4;
        octet |= (matches!(self.delivery_code, DeliveryCode::Incomplete) as u8) << 2;
        octet |= self.file_status.code();
        buf[idx] = octet;
        idx += 1;
        for tlv in &self.filestore_responses {
            idx += tlv.write_to_bytes(&mut buf[idx..])?;
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
        if directive != FileDirectiveType::FinishedPdu {
            return Err(PduError::WrongDirective(directive));
        }
        idx += 1;
        let octet = buf[idx];
        idx += 1;
        let condition_code = ConditionCode::from_code(octet >> 4);
        let delivery_code = if octet & (1 << 2) != 0 {
            DeliveryCode::Incomplete
        } else {
            DeliveryCode::Complete
        };
        let file_status = FileStatus::from_code(octet);

        // Everything remaining is either filestore-response TLVs or, at the
        // very end, a fault-location TLV. A fault-location TLV is the only
        // kind with type code 0x05, so we can tell them apart while scanning.
        let mut filestore_responses = Vec::new();
        let mut fault_location = None;
        while idx < buf.len() {
            let tlv_type = buf[idx];
            if tlv_type == crate::tlv::TlvType::EntityId.code() {
                idx += 1;
                let width = buf[idx];
                idx += 1;
                fault_location = Some(EntityId::from_bytes(width, &buf[idx..])?);
                idx += width as usize;
            } else {
                let (tlv, consumed) = Tlv::from_bytes(&buf[idx..])?;
                idx += consumed;
                filestore_responses.push(tlv);
            }
        }
        Ok(Self {
            header,
            condition_code,
            delivery_code,
            file_status,
            filestore_responses,
            fault_location,
        })
    }
}
