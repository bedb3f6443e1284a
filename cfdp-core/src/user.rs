//! The user/indication callback surface a caller implements to
//! observe transaction milestones. Every method is invoked synchronously
//! from inside `state_machine`.

use cfdp_pdu::{ConditionCode, DeliveryCode, FileStatus};

use crate::transaction::TransactionId;

/// Metadata captured from an incoming Metadata PDU, handed to
/// [`CfdpUser::metadata_recv_indication`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMetadata {
    pub src_file_name: String,
    pub dest_file_name: String,
    pub file_size: u64,
}

/// Summary of how a transaction ended, handed to
/// [`CfdpUser::transaction_finished_indication`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishedReport {
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
}

/// The callback surface both handlers invoke. Ordering guarantees:
/// `transaction_indication` fires before the first outbound PDU;
/// `metadata_recv_indication` fires before any `file_segment_recv_indication`;
/// `transaction_finished_indication` fires exactly once per transaction;
/// `fault_indication` fires at most once per transaction, before
/// `transaction_finished_indication`.
pub trait CfdpUser {
    fn transaction_indication(&mut self, id: TransactionId);

    fn eof_sent_indication(&mut self, id: TransactionId);

    fn metadata_recv_indication(&mut self, id: TransactionId, metadata: &ReceivedMetadata);

    fn file_segment_recv_indication(&mut self, id: TransactionId, offset: u64, len: usize);

    fn transaction_finished_indication(&mut self, id: TransactionId, report: FinishedReport);

    fn fault_indication(&mut self, id: TransactionId, condition_code: ConditionCode, progress: u64);

    /// Fired instead of `transaction_finished_indication` when the fault
    /// handler policy for the declared condition code is `Abandon` — the
    /// transaction is dropped without a closing PDU.
    fn abandoned_indication(
        &mut self,
        id: TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    );

    /// Named here for completeness with the standard's
    /// suspend/resume feature; this core never calls it, since suspend is a
    /// Non-goal for this core.
    fn resumed_indication(&mut self, _id: TransactionId, _progress: u64) {}
}

/// A [`CfdpUser`] that ignores every indication. Useful as a default or in
/// tests that only care about PDU traffic, not callbacks.
#[derive(Debug, Default)]
pub struct NullCfdpUser;

impl CfdpUser for NullCfdpUser {
    fn transaction_indication(&mut self, _id: TransactionId) {}
    fn eof_sent_indication(&mut self, _id: TransactionId) {}
    fn metadata_recv_indication(&mut self, _id: TransactionId, _metadata: &ReceivedMetadata) {}
    fn file_segment_recv_indication(&mut self, _id: TransactionId, _offset: u64, _len: usize) {}
    fn transaction_finished_indication(&mut self, _id: TransactionId, _report: FinishedReport) {}
    fn fault_indication(
        &mut self,
        _id: TransactionId,
        _condition_code: ConditionCode,
        _progress: u64,
    ) {
    }
    fn abandoned_indication(
        &mut self,
        _id: TransactionId,
        _condition_code: ConditionCode,
        _progress: u64,
    ) {
    }
}

/// A recording [`CfdpUser`] used by this crate's own tests to assert on the
/// order and content of fired indications.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingCfdpUser {
    pub events: Vec<String>,
    pub finished_reports: Vec<FinishedReport>,
}

#[cfg(test)]
impl CfdpUser for RecordingCfdpUser {
    fn transaction_indication(&mut self, id: TransactionId) {
        self.events.push(format!("transaction_indication({id})"));
    }

    fn eof_sent_indication(&mut self, id: TransactionId) {
        self.events.push(format!("eof_sent_indication({id})"));
    }

    fn metadata_recv_indication(&mut self, id: TransactionId, _metadata: &ReceivedMetadata) {
        self.events.push(format!("metadata_recv_indication({id})"));
    }

    fn file_segment_recv_indication(&mut self, id: TransactionId, offset: u64, len: usize) {
        self.events
            .push(format!("file_segment_recv_indication({id}, {offset}, {len})"));
    }

    fn transaction_finished_indication(&mut self, id: TransactionId, report: FinishedReport) {
        self.events
            .push(format!("transaction_finished_indication({id})"));
        self.finished_reports.push(report);
    }

    fn fault_indication(&mut self, id: TransactionId, condition_code: ConditionCode, progress: u64) {
        self.events
            .push(format!("fault_indication({id}, {condition_code:?}, {progress})"));
    }

    fn abandoned_indication(
        &mut self,
        id: TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    ) {
        self.events
            .push(format!("abandoned_indication({id}, {condition_code:?}, {progress})"));
    }
}
