//! Inputs the caller hands to a Source Handler: the Put Request that starts
//! a transaction, and the Cancel Request that ends one early.

use cfdp_pdu::{ChecksumType, EntityId, FilestoreRequest, MessageToUser, SegmentationControl, TransmissionMode};

use crate::mib::FaultHandlerOverrideMap;
use crate::transaction::TransactionId;

/// Starts a new transfer. Optional fields are explicit "present/absent"
/// markers — `None` means "fall back to the MIB default
/// for this remote entity", not "use some hardcoded value".
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PutRequest {
    pub destination_id: EntityId,
    /// `None` for a metadata-only transfer (no File Data PDUs are sent).
    pub source_file_name: Option<String>,
    pub dest_file_name: Option<String>,
    pub transmission_mode: Option<TransmissionMode>,
    pub closure_requested: Option<bool>,
    pub checksum_type: Option<ChecksumType>,
    pub seg_ctrl: SegmentationControl,
    pub fault_handler_overrides: FaultHandlerOverrideMap,
    pub flow_label: Option<Vec<u8>>,
    pub messages_to_user: Vec<MessageToUser>,
    pub filestore_requests: Vec<FilestoreRequest>,
}

impl PutRequest {
    pub fn new(destination_id: EntityId) -> Self {
        Self {
            destination_id,
            source_file_name: None,
            dest_file_name: None,
            transmission_mode: None,
            closure_requested: None,
            checksum_type: None,
            seg_ctrl: SegmentationControl::NoRecordBoundaryPreservation,
            fault_handler_overrides: FaultHandlerOverrideMap::new(),
            flow_label: None,
            messages_to_user: Vec::new(),
            filestore_requests: Vec::new(),
        }
    }

    pub fn with_file_transfer(
        mut self,
        source_file_name: impl Into<String>,
        dest_file_name: impl Into<String>,
    ) -> Self {
        self.source_file_name = Some(source_file_name.into());
        self.dest_file_name = Some(dest_file_name.into());
        self
    }
}

/// Requests cancellation of a transaction already in progress. `None`
/// targets whichever transaction the handler currently owns, since each
/// handler instance drives one transaction at a time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct CancelRequest {
    pub transaction_id: Option<TransactionId>,
}

impl CancelRequest {
    pub fn current() -> Self {
        Self { transaction_id: None }
    }

    pub fn for_transaction(id: TransactionId) -> Self {
        Self {
            transaction_id: Some(id),
        }
    }
}
