use core::fmt;

/// Mirrors the `expected`/`found` pair `spacepackets::SizeMissmatch` uses for
/// every "buffer too small" style error in the packet library.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SizeMismatch {
    pub expected: usize,
    pub found: usize,
}

impl fmt::Display for SizeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected at least {} bytes, found {}", self.expected, self.found)
    }
}

/// Errors which can occur while encoding or decoding a CFDP PDU.
#[derive(Debug, thiserror::Error, Copy, Clone, PartialEq, Eq)]
pub enum PduError {
    #[error("buffer too small to hold encoded PDU: {0}")]
    ByteConversion(SizeMismatch),
    #[error("raw data too short to contain a valid PDU header: {0} bytes")]
    RawDataTooShort(usize),
    #[error("entity ID length {0} is not one of the 4 CFDP-legal widths (1, 2, 4, 8)")]
    InvalidEntityIdLength(u8),
    #[error("transaction sequence number length {0} is not one of the 4 CFDP-legal widths (1, 2, 4, 8)")]
    InvalidSeqNumLength(u8),
    #[error("unknown file directive code {0:#04x}")]
    UnknownDirective(u8),
    #[error("file directive expected but PDU is a file data PDU")]
    NotAFileDirective,
    #[error("file data PDU expected but a file directive PDU was found")]
    NotFileData,
    #[error("unknown condition code {0:#06b}")]
    UnknownConditionCode(u8),
    #[error("unknown checksum type {0}")]
    UnknownChecksumType(u8),
    #[error("unknown TLV type {0:#04x}")]
    UnknownTlvType(u8),
    #[error("wrong file directive {0:?} for this PDU kind")]
    WrongDirective(crate::header::FileDirectiveType),
}

pub type PduResult<T> = Result<T, PduError>;
