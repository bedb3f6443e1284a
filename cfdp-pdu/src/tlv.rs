//! TLV (type-length-value) fields used inside Metadata and Finished PDUs:
//! filestore requests/responses, messages to user, and fault-location.
use crate::error::{PduError, SizeMismatch};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TlvType {
    FilestoreRequest,
    FilestoreResponse,
    MessageToUser,
    FaultHandlerOverride,
    FlowLabel,
    EntityId,
}

impl TlvType {
    pub fn code(&self) -> u8 {
        match self {
            Self::FilestoreRequest => 0x00,
            Self::FilestoreResponse => 0x01,
            Self::MessageToUser => 0x02,
            Self::FaultHandlerOverride => 0x03,
            Self::FlowLabel => 0x04,
            Self::EntityId => 0x05,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, PduError> {
        Ok(match code {
            0x00 => Self::FilestoreRequest,
            0x01 => Self::FilestoreResponse,
            0x02 => Self::MessageToUser,
            0x03 => Self::FaultHandlerOverride,
            0x04 => Self::FlowLabel,
            0x05 => Self::EntityId,
            other => return Err(PduError::UnknownTlvType(other)),
        })
    }
}

/// A raw, generic TLV. Higher level helpers (filestore requests, messages to
/// user) are built on top of this the same way `spacepackets` layers typed
/// wrappers on top of a raw zero-copy header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: TlvType,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tlv_type: TlvType, value: Vec<u8>) -> Self {
        Self { tlv_type, value }
    }

    pub fn len_full(&self) -> usize {
        2 + self.value.len()
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        let len = self.len_full();
        if buf.len() < len {
            return Err(PduError::ByteConversion(SizeMismatch {
                expected: len,
                found: buf.len(),
            }));
        }
        buf[0] = self.tlv_type.code();
        buf[1] = self.value.len() as u8;
        buf[2..len].copy_from_slice(&self.value);
        Ok(len)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize), PduError> {
        if buf.len() < 2 {
            return Err(PduError::RawDataTooShort(buf.len()));
        }
        let tlv_type = TlvType::from_code(buf[0])?;
        let len = buf[1] as usize;
        if buf.len() < 2 + len {
            return Err(PduError::RawDataTooShort(buf.len()));
        }
        Ok((
            Self {
                tlv_type,
                value: buf[2..2 + len].to_vec(),
            },
            2 + len,
        ))
    }
}

/// Action codes for a CFDP filestore request/response (Table 5-18).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FilestoreAction {
    CreateFile,
    DeleteFile,
    RenameFile,
    AppendFile,
    ReplaceFile,
    CreateDirectory,
    RemoveDirectory,
    DenyFile,
    DenyDirectory,
}

impl FilestoreAction {
    pub fn code(&self) -> u8 {
        match self {
            Self::CreateFile => 0,
            Self::DeleteFile => 1,
            Self::RenameFile => 2,
            Self::AppendFile => 3,
            Self::ReplaceFile => 4,
            Self::CreateDirectory => 5,
            Self::RemoveDirectory => 6,
            Self::DenyFile => 7,
            Self::DenyDirectory => 8,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, PduError> {
        Ok(match code {
            0 => Self::CreateFile,
            1 => Self::DeleteFile,
            2 => Self::RenameFile,
            3 => Self::AppendFile,
            4 => Self::ReplaceFile,
            5 => Self::CreateDirectory,
            6 => Self::RemoveDirectory,
            7 => Self::DenyFile,
            8 => Self::DenyDirectory,
            other => return Err(PduError::UnknownTlvType(other)),
        })
    }
}

/// One filestore request as carried in the Metadata PDU's TLV list.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FilestoreRequest {
    pub action: FilestoreAction,
    pub first_name: String,
    pub second_name: Option<String>,
}

impl FilestoreRequest {
    pub fn to_tlv(&self) -> Tlv {
        let mut value = Vec::new();
        value.push(self.action.code() << 4);
        value.push(self.first_name.len() as u8);
        value.extend_from_slice(self.first_name.as_bytes());
        if let Some(second) = &self.second_name {
            value.push(second.len() as u8);
            value.extend_from_slice(second.as_bytes());
        } else {
            value.push(0);
        }
        Tlv::new(TlvType::FilestoreRequest, value)
    }

    pub fn from_tlv(tlv: &Tlv) -> Result<Self, PduError> {
        if tlv.tlv_type != TlvType::FilestoreRequest {
            return Err(PduError::UnknownTlvType(tlv.tlv_type.code()));
        }
        let v = &tlv.value;
        if v.is_empty() {
            return Err(PduError::RawDataTooShort(0));
        }
        let action = FilestoreAction::from_code(v[0] >> 4)?;
        let mut idx = 1;
        let first_len = *v.get(idx).ok_or(PduError::RawDataTooShort(v.len()))? as usize;
        idx += 1;
        let first_name = String::from_utf8_lossy(
            v.get(idx..idx + first_len)
                .ok_or(PduError::RawDataTooShort(v.len()))?,
        )
        .into_owned();
        idx += first_len;
        let second_len = *v.get(idx).unwrap_or(&0) as usize;
        idx += 1;
        let second_name = if second_len > 0 {
            Some(
                String::from_utf8_lossy(
                    v.get(idx..idx + second_len)
                        .ok_or(PduError::RawDataTooShort(v.len()))?,
                )
                .into_owned(),
            )
        } else {
            None
        };
        Ok(Self {
            action,
            first_name,
            second_name,
        })
    }
}

/// The status a Finished PDU reports back for each requested filestore
/// action (Table 5-19). `Successful` covers the various per-action
/// "successful" status codes defined by the standard; the finer-grained
/// failure reasons are not needed by this core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FilestoreResponseStatus {
    Successful,
    NotPerformed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FilestoreResponse {
    pub action: FilestoreAction,
    pub status: FilestoreResponseStatus,
    pub first_name: String,
    pub second_name: Option<String>,
}

impl FilestoreResponse {
    fn status_code(&self) -> u8 {
        match self.status {
            FilestoreResponseStatus::Successful => 0b00,
            FilestoreResponseStatus::NotPerformed => 0b01,
            FilestoreResponseStatus::Rejected => 0b10,
        }
    }

    pub fn to_tlv(&self) -> Tlv {
        let mut value = Vec::new();
        value.push((self.action.code() << 4) | self.status_code());
        value.push(self.first_name.len() as u8);
        value.extend_from_slice(self.first_name.as_bytes());
        if let Some(second) = &self.second_name {
            value.push(second.len() as u8);
            value.extend_from_slice(second.as_bytes());
        } else {
            value.push(0);
        }
        Tlv::new(TlvType::FilestoreResponse, value)
    }
}

/// A free-form message-to-user entry; this core treats the payload as an
/// opaque byte string and leaves interpretation to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageToUser {
    pub data: Vec<u8>,
}

impl MessageToUser {
    pub fn to_tlv(&self) -> Tlv {
        Tlv::new(TlvType::MessageToUser, self.data.clone())
    }

    pub fn from_tlv(tlv: &Tlv) -> Result<Self, PduError> {
        if tlv.tlv_type != TlvType::MessageToUser {
            return Err(PduError::UnknownTlvType(tlv.tlv_type.code()));
        }
        Ok(Self {
            data: tlv.value.clone(),
        })
    }
}
