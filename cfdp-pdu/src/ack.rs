use crate::error::{PduError, SizeMismatch};
use crate::header::{
    CommonPduConfig, ConditionCode, Direction, FileDirectiveType, LargeFileFlag, PduHeader,
    PduType, SegmentationControl,
};

/// Transaction status as carried in an ACK PDU (Table 5-9); this core only
/// ever reports `Active` or `Terminated`, the other two values exist for
/// protocol completeness on the decode side.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    Undefined,
    Active,
    Terminated,
    Unrecognized,
}

impl TransactionStatus {
    fn code(self) -> u8 {
        match self {
            Self::Undefined => 0b00,
            Self::Active => 0b01,
            Self::Terminated => 0b10,
            Self::Unrecognized => 0b11,
        }
    }

    fn from_code(code: u8) -> Self {
        match code & 0b11 {
            0b00 => Self::Undefined,
            0b01 => Self::Active,
            0b10 => Self::Terminated,
            _ => Self::Unrecognized,
        }
    }
}

/// ACK of either the EOF or the Finished directive. Which one is acked is
/// named explicitly rather than inferred, mirroring how the Blue Book packs
/// the acked directive code into its own nibble.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AckPdu {
    header: PduHeader,
    directive_acked: FileDirectiveType,
    condition_code: ConditionCode,
    transaction_status: TransactionStatus,
}

impl AckPdu {
    pub fn new(
        common: CommonPduConfig,
        directive_acked: FileDirectiveType,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Self {
        let mut pdu = Self {
            header: PduHeader::new(
                PduType::FileDirective,
                Direction::TowardFileReceiver,
                &common,
                LargeFileFlag::Normal,
                0,
                SegmentationControl::NoRecordBoundaryPreservation,
            ),
            directive_acked,
            condition_code,
            transaction_status,
        };
        pdu.header.pdu_data_field_len = 3;
        pdu
    }

    pub fn directive_acked(&self) -> FileDirectiveType {
        self.directive_acked
    }

    pub fn condition_code(&self) -> ConditionCode {
        self.condition_code
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn header(&self) -> &PduHeader {
        &self.header
    }

    pub fn written_len(&self) -> usize {
        self.header.header_len() + 3
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
        buf[idx] = FileDirectiveType::AckPdu.code();
        idx += 1;
        // high nibble: directive code being acked; low nibble: directive subtype
        // (0 for EOF, 1 for Finished, as defined by the standard).
        let subtype = match self.directive_acked {
            FileDirectiveType::FinishedPdu => 1,
            _ => 0,
        };
        buf[idx] = (self.directive_acked.code() << 4) | subtype;
        idx += 1;
        buf[idx] = (self.condition_code.code() << 4) | self.transaction_status.code();
        idx += 1;
        Ok(idx)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, mut idx) = PduHeader::from_bytes(buf)?;
        let directive = FileDirectiveType::from_code(buf[idx])?;
        if directive != FileDirectiveType::AckPdu {
            return Err(PduError::WrongDirective(directive));
        }
        idx += 1;
        let directive_acked = FileDirectiveType::from_code(buf[idx] >> 4)?;
        idx += 1;
        let condition_code = ConditionCode::from_code(buf[idx] >> 4);
        let transaction_status = TransactionStatus::from_code(buf[idx]);
        idx += 1;
        Ok(Self {
            header,
            directive_acked,
            condition_code,
            transaction_status,
        })
    }
}
