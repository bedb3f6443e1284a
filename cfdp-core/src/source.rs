//! The Source Handler state machine: drives one transaction from a
//! Put Request to completion, emitting Metadata, File Data and EOF PDUs and,
//! in Class 2, processing NAK/Finished/ACK PDUs from the receiver.

use std::collections::VecDeque;
use std::path::Path;

use cfdp_pdu::{
    AckPdu, CommonPduConfig, ConditionCode, EntityId, EofPdu, FileDataPdu, FileDirectiveType,
    MetadataGenericParams, MetadataPdu, Pdu, TransactionStatus, TransmissionMode,
};

use crate::filestore::{FileHandle, FilestoreError, VirtualFilestore};
use crate::mib::{EffectiveFaultAction, Mib, RemoteEntityConfig};
use crate::request::{CancelRequest, PutRequest};
use crate::timer::{CountdownTimer, TimerCreator, Timestamp};
use crate::transaction::{SequenceNumberGenerator, TransactionId};
use crate::user::{CfdpUser, FinishedReport};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source handler is busy with another transaction")]
    Busy,
    #[error("no active transaction on this source handler")]
    NoActiveTransaction,
    #[error("transaction {0} is not the one this source handler is driving")]
    UnknownTransaction(TransactionId),
    #[error("no MIB entry for remote entity {0:?}")]
    UnknownRemoteEntity(EntityId),
    #[error(transparent)]
    Filestore(#[from] FilestoreError),
    #[error(transparent)]
    Pdu(#[from] cfdp_pdu::PduError),
}

/// Whether the handler is idle or driving a transaction in a given
/// transmission mode. A tagged variant rather than a class hierarchy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Busy(TransmissionMode),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionStep {
    Idle,
    TransactionStart,
    CrcProcedure,
    SendingMetadata,
    SendingFileData,
    Retransmitting,
    SendingEof,
    WaitingForEofAck,
    WaitingForFinished,
    SendingAckOfFinished,
    NoticeOfCompletion,
}

/// The result of one `state_machine` call: the step the handler landed on,
/// whether at least one outbound PDU is queued, and how many PDUs this
/// particular call queued.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SourceFsmResult {
    pub step: TransactionStep,
    pub packet_ready: bool,
    pub packets_sent_count: u32,
}

struct SourceTransaction {
    id: TransactionId,
    remote_config: RemoteEntityConfig,
    common: CommonPduConfig,
    trans_mode: TransmissionMode,
    closure_requested: bool,
    checksum_type: cfdp_pdu::ChecksumType,
    src_file_name: Option<String>,
    dest_file_name: Option<String>,
    messages_to_user: Vec<cfdp_pdu::MessageToUser>,
    filestore_requests: Vec<cfdp_pdu::FilestoreRequest>,
    file_handle: Option<FileHandle>,
    file_size: u64,
    offset: u64,
    checksum: u32,
    condition_code: ConditionCode,
    fault_location: Option<EntityId>,
    nak_queue: VecDeque<cfdp_pdu::SegmentRequest>,
    ack_eof_timer: Option<Box<dyn CountdownTimer>>,
    finished_timer: Option<Box<dyn CountdownTimer>>,
    ack_counter: u32,
    cancel_requested: bool,
}

/// Drives one Source transaction at a time; owns a single
/// `SourceTransaction` rather than a transaction table.
pub struct SourceHandler<FS: VirtualFilestore, TC: TimerCreator> {
    local_entity_id: EntityId,
    filestore: FS,
    timer_creator: TC,
    mib: Mib,
    seq_gen: SequenceNumberGenerator,
    state: State,
    step: TransactionStep,
    transaction: Option<SourceTransaction>,
    outbound: VecDeque<Pdu>,
    finished_report: Option<FinishedReport>,
    last_abandoned: Option<(TransactionId, ConditionCode, u64)>,
}

impl<FS: VirtualFilestore, TC: TimerCreator> SourceHandler<FS, TC> {
    pub fn new(local_entity_id: EntityId, filestore: FS, timer_creator: TC, mib: Mib) -> Self {
        Self {
            local_entity_id,
            filestore,
            timer_creator,
            mib,
            seq_gen: SequenceNumberGenerator::new(),
            state: State::Idle,
            step: TransactionStep::Idle,
            transaction: None,
            outbound: VecDeque::new(),
            finished_report: None,
            last_abandoned: None,
        }
    }

    /// The most recent transaction this handler abandoned (ABANDON fault
    /// handler policy), if any. Cleared once read.
    pub fn take_last_abandoned(&mut self) -> Option<(TransactionId, ConditionCode, u64)> {
        self.last_abandoned.take()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn step(&self) -> TransactionStep {
        self.step
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(|t| t.id)
    }

    pub fn file_size(&self) -> Option<u64> {
        self.transaction.as_ref().map(|t| t.file_size)
    }

    pub fn progress(&self) -> u64 {
        self.transaction.as_ref().map(|t| t.offset).unwrap_or(0)
    }

    pub fn get_next_pdu(&mut self) -> Option<Pdu> {
        self.outbound.pop_front()
    }

    pub fn put_request(
        &mut self,
        req: PutRequest,
        user: &mut impl CfdpUser,
    ) -> Result<TransactionId, SourceError> {
        if !matches!(self.state, State::Idle) {
            return Err(SourceError::Busy);
        }
        let remote_config = self
            .mib
            .config_for(req.destination_id)
            .cloned()
            .ok_or(SourceError::UnknownRemoteEntity(req.destination_id))?;

        let trans_mode = req
            .transmission_mode
            .unwrap_or(remote_config.default_transmission_mode);
        let checksum_type = req.checksum_type.unwrap_or(remote_config.default_checksum_type);
        let closure_requested = req
            .closure_requested
            .unwrap_or(remote_config.closure_requested);

        let seq_num = self.seq_gen.next();
        let id = TransactionId::new(self.local_entity_id, req.destination_id, seq_num);
        let common = CommonPduConfig::new(
            self.local_entity_id,
            req.destination_id,
            EntityId::new_minimal(seq_num),
            trans_mode,
            remote_config.crc_on_transmission,
        );

        let file_handle = match &req.source_file_name {
            Some(path) => Some(self.filestore.open_read(Path::new(path))?),
            None => None,
        };
        let file_size = match &req.source_file_name {
            Some(path) => self.filestore.file_size(Path::new(path))?,
            None => 0,
        };

        self.transaction = Some(SourceTransaction {
            id,
            remote_config,
            common,
            trans_mode,
            closure_requested,
            checksum_type,
            src_file_name: req.source_file_name,
            dest_file_name: req.dest_file_name,
            messages_to_user: req.messages_to_user,
            filestore_requests: req.filestore_requests,
            file_handle,
            file_size,
            offset: 0,
            checksum: 0,
            condition_code: ConditionCode::NoError,
            fault_location: None,
            nak_queue: VecDeque::new(),
            ack_eof_timer: None,
            finished_timer: None,
            ack_counter: 0,
            cancel_requested: false,
        });
        self.state = State::Busy(trans_mode);
        self.step = TransactionStep::TransactionStart;
        user.transaction_indication(id);
        log::info!("source: transaction {id} started");
        Ok(id)
    }

    pub fn cancel_request(&mut self, req: CancelRequest) -> Result<(), SourceError> {
        let txn = self
            .transaction
            .as_mut()
            .ok_or(SourceError::NoActiveTransaction)?;
        if let Some(target) = req.transaction_id {
            if target != txn.id {
                return Err(SourceError::UnknownTransaction(target));
            }
        }
        txn.cancel_requested = true;
        Ok(())
    }

    pub fn state_machine(
        &mut self,
        now: Timestamp,
        packet: Option<Pdu>,
        user: &mut impl CfdpUser,
    ) -> Result<SourceFsmResult, SourceError> {
        let before = self.outbound.len();

        let cancellation_pending = self
            .transaction
            .as_ref()
            .map(|t| t.cancel_requested)
            .unwrap_or(false)
            && !matches!(
                self.step,
                TransactionStep::Idle | TransactionStep::NoticeOfCompletion
            );
        if cancellation_pending {
            self.begin_cancellation(now)?;
        } else {
            match self.step {
                TransactionStep::Idle => {}
                TransactionStep::TransactionStart => {
                    self.step = TransactionStep::CrcProcedure;
                }
                TransactionStep::CrcProcedure => self.run_crc_procedure()?,
                TransactionStep::SendingMetadata => self.send_metadata()?,
                TransactionStep::SendingFileData => self.send_file_data()?,
                TransactionStep::Retransmitting => self.retransmit()?,
                TransactionStep::SendingEof => self.send_eof(now, user)?,
                TransactionStep::WaitingForEofAck => self.handle_eof_ack_wait(now, packet, user)?,
                TransactionStep::WaitingForFinished => {
                    self.handle_waiting_for_finished(now, packet, user)?
                }
                TransactionStep::SendingAckOfFinished => self.send_ack_of_finished()?,
                TransactionStep::NoticeOfCompletion => self.notice_of_completion(user)?,
            }
        }

        let sent = self.outbound.len() - before;
        Ok(SourceFsmResult {
            step: self.step,
            packet_ready: !self.outbound.is_empty(),
            packets_sent_count: sent as u32,
        })
    }

    fn run_crc_procedure(&mut self) -> Result<(), SourceError> {
        let txn = self.transaction.as_ref().unwrap();
        let checksum = match &txn.src_file_name {
            Some(path) => self.filestore.calculate_checksum(
                txn.checksum_type,
                Path::new(path),
                0,
                txn.file_size,
            )?,
            None => crate::filestore::checksum_over_reader(txn.checksum_type, &[][..], 0)
                .expect("checksum over zero bytes cannot fail"),
        };
        let txn = self.transaction.as_mut().unwrap();
        txn.checksum = checksum;
        self.step = TransactionStep::SendingMetadata;
        Ok(())
    }

    fn send_metadata(&mut self) -> Result<(), SourceError> {
        let txn = self.transaction.as_ref().unwrap();
        let params = MetadataGenericParams::new(txn.closure_requested, txn.checksum_type, txn.file_size);
        let pdu = MetadataPdu::new(
            txn.common,
            params,
            txn.src_file_name.clone().unwrap_or_default(),
            txn.dest_file_name.clone().unwrap_or_default(),
            &txn.messages_to_user,
            &txn.filestore_requests,
        );
        self.outbound.push_back(Pdu::Metadata(pdu));
        self.step = if txn.file_size == 0 {
            TransactionStep::SendingEof
        } else {
            TransactionStep::SendingFileData
        };
        Ok(())
    }

    fn send_file_data(&mut self) -> Result<(), SourceError> {
        let txn = self.transaction.as_mut().unwrap();
        if txn.offset >= txn.file_size {
            self.step = TransactionStep::SendingEof;
            return Ok(());
        }
        let segment_len = txn
            .remote_config
            .max_file_segment_len
            .min((txn.file_size - txn.offset) as usize);
        let handle = txn.file_handle.expect("file handle present for non-empty file");
        let data = self.filestore.read(handle, txn.offset, segment_len)?;
        let txn = self.transaction.as_mut().unwrap();
        let large_file = txn.file_size > u32::MAX as u64;
        let pdu = FileDataPdu::new(txn.common, txn.offset, data, large_file);
        txn.offset += segment_len as u64;
        self.outbound.push_back(Pdu::FileData(pdu));
        if txn.offset >= txn.file_size {
            self.step = TransactionStep::SendingEof;
        }
        Ok(())
    }

    fn retransmit(&mut self) -> Result<(), SourceError> {
        let txn = self.transaction.as_mut().unwrap();
        let Some(request) = txn.nak_queue.pop_front() else {
            self.step = TransactionStep::WaitingForFinished;
            return Ok(());
        };
        if request.is_metadata_request() {
            // `send_metadata` leaves `self.step` pointing at the normal
            // post-metadata step; we are mid-retransmission, so restore it.
            self.send_metadata()?;
            self.step = TransactionStep::Retransmitting;
            return Ok(());
        }
        let mut offset = request.start_offset;
        let end = request.end_offset;
        let txn = self.transaction.as_ref().unwrap();
        let max_segment = txn.remote_config.max_file_segment_len as u64;
        let handle = txn.file_handle.expect("file handle present for retransmission");
        let common = txn.common;
        let large_file = txn.file_size > u32::MAX as u64;
        while offset < end {
            let chunk = max_segment.min(end - offset) as usize;
            let data = self.filestore.read(handle, offset, chunk)?;
            let pdu = FileDataPdu::new(common, offset, data, large_file);
            self.outbound.push_back(Pdu::FileData(pdu));
            offset += chunk as u64;
        }
        self.step = TransactionStep::Retransmitting;
        Ok(())
    }

    fn send_eof(&mut self, now: Timestamp, user: &mut impl CfdpUser) -> Result<(), SourceError> {
        let txn = self.transaction.as_ref().unwrap();
        let eof = EofPdu::new(
            txn.common,
            txn.condition_code,
            txn.checksum,
            txn.file_size,
            txn.fault_location,
        );
        self.outbound.push_back(Pdu::Eof(eof));
        user.eof_sent_indication(txn.id);
        let trans_mode = txn.trans_mode;
        let closure_requested = txn.closure_requested;
        match trans_mode {
            TransmissionMode::Unacknowledged => {
                if closure_requested {
                    let interval = txn.remote_config.check_timer_interval_ms;
                    let timer = self.timer_creator.build(now, interval);
                    self.transaction.as_mut().unwrap().finished_timer = Some(timer);
                    self.step = TransactionStep::WaitingForFinished;
                } else {
                    self.step = TransactionStep::NoticeOfCompletion;
                }
            }
            TransmissionMode::Acknowledged => {
                let interval = txn.remote_config.positive_ack_timer_interval_ms;
                let timer = self.timer_creator.build(now, interval);
                self.transaction.as_mut().unwrap().ack_eof_timer = Some(timer);
                self.step = TransactionStep::WaitingForEofAck;
            }
        }
        Ok(())
    }

    fn handle_eof_ack_wait(
        &mut self,
        now: Timestamp,
        packet: Option<Pdu>,
        user: &mut impl CfdpUser,
    ) -> Result<(), SourceError> {
        if let Some(Pdu::Ack(ack)) = &packet {
            if ack.directive_acked() == FileDirectiveType::EofPdu {
                let txn = self.transaction.as_mut().unwrap();
                txn.ack_eof_timer = None;
                txn.ack_counter = 0;
                self.step = TransactionStep::WaitingForFinished;
                return Ok(());
            }
        }
        if let Some(Pdu::Nak(nak)) = packet {
            self.merge_nak(&nak);
        }
        let expired = self
            .transaction
            .as_ref()
            .unwrap()
            .ack_eof_timer
            .as_ref()
            .map(|t| t.has_expired(now))
            .unwrap_or(false);
        if expired {
            self.on_ack_timer_expiry(now, user)?;
        }
        Ok(())
    }

    fn on_ack_timer_expiry(
        &mut self,
        now: Timestamp,
        user: &mut impl CfdpUser,
    ) -> Result<(), SourceError> {
        let txn = self.transaction.as_mut().unwrap();
        txn.ack_counter += 1;
        if txn.ack_counter > txn.remote_config.positive_ack_timer_expiration_limit {
            self.declare_fault(ConditionCode::PositiveAckLimitReached, now, user)?;
        } else {
            let txn = self.transaction.as_ref().unwrap();
            let eof = EofPdu::new(
                txn.common,
                txn.condition_code,
                txn.checksum,
                txn.file_size,
                txn.fault_location,
            );
            self.outbound.push_back(Pdu::Eof(eof));
            let interval = txn.remote_config.positive_ack_timer_interval_ms;
            let timer = self.timer_creator.build(now, interval);
            self.transaction.as_mut().unwrap().ack_eof_timer = Some(timer);
        }
        Ok(())
    }

    fn handle_waiting_for_finished(
        &mut self,
        now: Timestamp,
        packet: Option<Pdu>,
        user: &mut impl CfdpUser,
    ) -> Result<(), SourceError> {
        match packet {
            Some(Pdu::Nak(nak)) => {
                self.merge_nak(&nak);
                self.step = TransactionStep::Retransmitting;
            }
            Some(Pdu::Finished(finished)) => {
                let txn = self.transaction.as_mut().unwrap();
                txn.condition_code = finished.condition_code();
                txn.finished_timer = None;
                self.finished_report = Some(FinishedReport {
                    condition_code: finished.condition_code(),
                    delivery_code: finished.delivery_code(),
                    file_status: finished.file_status(),
                });
                self.step = TransactionStep::SendingAckOfFinished;
            }
            _ => {
                let expired = self
                    .transaction
                    .as_ref()
                    .unwrap()
                    .finished_timer
                    .as_ref()
                    .map(|t| t.has_expired(now))
                    .unwrap_or(false);
                if expired {
                    self.declare_fault(ConditionCode::CheckLimitReached, now, user)?;
                }
            }
        }
        Ok(())
    }

    fn merge_nak(&mut self, nak: &cfdp_pdu::NakPdu) {
        let txn = self.transaction.as_mut().unwrap();
        for request in nak.segment_requests() {
            txn.nak_queue.push_back(*request);
        }
    }

    fn send_ack_of_finished(&mut self) -> Result<(), SourceError> {
        let txn = self.transaction.as_ref().unwrap();
        let ack = AckPdu::new(
            txn.common,
            FileDirectiveType::FinishedPdu,
            txn.condition_code,
            TransactionStatus::Active,
        );
        self.outbound.push_back(Pdu::Ack(ack));
        self.step = TransactionStep::NoticeOfCompletion;
        Ok(())
    }

    fn notice_of_completion(&mut self, user: &mut impl CfdpUser) -> Result<(), SourceError> {
        let txn = self.transaction.take().unwrap();
        if let Some(handle) = txn.file_handle {
            self.filestore.close(handle)?;
        }
        let report = self.finished_report.take().unwrap_or(FinishedReport {
            condition_code: txn.condition_code,
            delivery_code: if txn.condition_code == ConditionCode::NoError {
                cfdp_pdu::DeliveryCode::Complete
            } else {
                cfdp_pdu::DeliveryCode::Incomplete
            },
            file_status: cfdp_pdu::FileStatus::Retained,
        });
        user.transaction_finished_indication(txn.id, report);
        log::info!("source: transaction {} complete: {:?}", txn.id, report.condition_code);
        self.state = State::Idle;
        self.step = TransactionStep::Idle;
        Ok(())
    }

    /// Looks up the fault handler policy for `condition_code` and acts on
    /// it: `Ignore` keeps the transaction running, `Cancel` starts the
    /// cancellation closure path, `Abandon` drops the transaction without a
    /// closing PDU.
    fn declare_fault(
        &mut self,
        condition_code: ConditionCode,
        now: Timestamp,
        user: &mut impl CfdpUser,
    ) -> Result<(), SourceError> {
        let txn = self.transaction.as_ref().unwrap();
        let action = txn
            .remote_config
            .fault_handler_overrides
            .action_for(condition_code)
            .as_effective();
        let id = txn.id;
        let progress = txn.offset;
        log::warn!("source: fault {condition_code:?} on transaction {id} -> {action:?}");
        user.fault_indication(id, condition_code, progress);
        match action {
            EffectiveFaultAction::Ignore => Ok(()),
            EffectiveFaultAction::Cancel => {
                self.transaction.as_mut().unwrap().condition_code = condition_code;
                self.transaction.as_mut().unwrap().cancel_requested = true;
                self.begin_cancellation(now)
            }
            EffectiveFaultAction::Abandon => {
                let txn = self.transaction.take().unwrap();
                if let Some(handle) = txn.file_handle {
                    let _ = self.filestore.close(handle);
                }
                self.last_abandoned = Some((txn.id, condition_code, txn.offset));
                user.abandoned_indication(txn.id, condition_code, txn.offset);
                self.state = State::Idle;
                self.step = TransactionStep::Idle;
                Ok(())
            }
        }
    }

    fn begin_cancellation(&mut self, now: Timestamp) -> Result<(), SourceError> {
        let txn = self.transaction.as_ref().unwrap();
        let checksum = match &txn.src_file_name {
            Some(path) => {
                self.filestore
                    .calculate_checksum(txn.checksum_type, Path::new(path), 0, txn.offset)?
            }
            None => crate::filestore::checksum_over_reader(txn.checksum_type, &[][..], 0)
                .expect("checksum over zero bytes cannot fail"),
        };

        let txn = self.transaction.as_mut().unwrap();
        if txn.condition_code == ConditionCode::NoError {
            txn.condition_code = ConditionCode::CancelRequestReceived;
        }
        txn.fault_location = Some(self.local_entity_id);
        txn.cancel_requested = false;
        txn.checksum = checksum;
        let eof = EofPdu::new(
            txn.common,
            txn.condition_code,
            txn.checksum,
            txn.offset,
            txn.fault_location,
        );
        self.outbound.push_back(Pdu::Eof(eof));
        let trans_mode = txn.trans_mode;
        match trans_mode {
            TransmissionMode::Unacknowledged => {
                self.step = TransactionStep::NoticeOfCompletion;
            }
            TransmissionMode::Acknowledged => {
                let interval = txn.remote_config.positive_ack_timer_interval_ms;
                let timer = self.timer_creator.build(now, interval);
                self.transaction.as_mut().unwrap().ack_eof_timer = Some(timer);
                self.step = TransactionStep::WaitingForEofAck;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestore::InMemoryFilestore;
    use crate::mib::RemoteEntityConfig;
    use crate::timer::StdTimerCreator;
    use crate::user::{NullCfdpUser, RecordingCfdpUser};
    use cfdp_pdu::EntityId;

    const LOCAL: u64 = 1;
    const REMOTE: u64 = 2;

    fn handler(mode: TransmissionMode, max_segment: usize) -> SourceHandler<InMemoryFilestore, StdTimerCreator> {
        let mut mib = Mib::new();
        let mut cfg = RemoteEntityConfig::new_with_defaults(EntityId::new_minimal(REMOTE));
        cfg.default_transmission_mode = mode;
        cfg.max_file_segment_len = max_segment;
        cfg.positive_ack_timer_expiration_limit = 2;
        cfg.check_timer_expiration_limit = 2;
        mib.insert(cfg);
        SourceHandler::new(
            EntityId::new_minimal(LOCAL),
            InMemoryFilestore::new(),
            StdTimerCreator,
            mib,
        )
    }

    fn drive_until_outbound(
        h: &mut SourceHandler<InMemoryFilestore, StdTimerCreator>,
        user: &mut impl CfdpUser,
    ) {
        for _ in 0..8 {
            let res = h.state_machine(0, None, user).unwrap();
            if res.packet_ready || matches!(h.step(), TransactionStep::Idle) {
                return;
            }
        }
    }

    #[test]
    fn empty_file_class1_no_closure_sends_metadata_then_eof() {
        let mut h = handler(TransmissionMode::Unacknowledged, 1024);
        let mut user = RecordingCfdpUser::default();
        h.filestore.seed("src.bin", Vec::new());
        let req = PutRequest::new(EntityId::new_minimal(REMOTE))
            .with_file_transfer("src.bin", "dest.bin");
        h.put_request(req, &mut user).unwrap();

        drive_until_outbound(&mut h, &mut user); // CRC_PROCEDURE -> SENDING_METADATA
        assert!(matches!(h.get_next_pdu(), Some(Pdu::Metadata(_))));

        drive_until_outbound(&mut h, &mut user); // straight to SENDING_EOF for an empty file
        let eof = match h.get_next_pdu() {
            Some(Pdu::Eof(eof)) => eof,
            other => panic!("expected EOF, got {other:?}"),
        };
        assert_eq!(eof.file_size(), 0);
        assert_eq!(eof.condition_code(), ConditionCode::NoError);

        h.state_machine(0, None, &mut user).unwrap(); // NOTICE_OF_COMPLETION -> IDLE
        assert_eq!(h.step(), TransactionStep::Idle);
        assert_eq!(
            user.finished_reports[0].condition_code,
            ConditionCode::NoError
        );
    }

    #[test]
    fn file_data_segments_advance_offsets_monotonically() {
        let mut h = handler(TransmissionMode::Unacknowledged, 4);
        let mut user = NullCfdpUser;
        h.filestore.seed("src.bin", b"0123456789ab".to_vec()); // 12 bytes / 4-byte segments = 3 PDUs
        let req = PutRequest::new(EntityId::new_minimal(REMOTE))
            .with_file_transfer("src.bin", "dest.bin");
        h.put_request(req, &mut user).unwrap();

        drive_until_outbound(&mut h, &mut user); // metadata
        assert!(matches!(h.get_next_pdu(), Some(Pdu::Metadata(_))));

        let mut offsets = Vec::new();
        loop {
            let res = h.state_machine(0, None, &mut user).unwrap();
            while let Some(pdu) = h.get_next_pdu() {
                match pdu {
                    Pdu::FileData(fd) => offsets.push(fd.offset()),
                    Pdu::Eof(_) => {
                        assert_eq!(offsets, vec![0, 4, 8]);
                        return;
                    }
                    other => panic!("unexpected pdu {other:?}"),
                }
            }
            if matches!(res.step, TransactionStep::Idle) {
                panic!("reached idle before EOF");
            }
        }
    }

    #[test]
    fn class2_full_round_trip_without_loss() {
        let mut h = handler(TransmissionMode::Acknowledged, 1024);
        let mut user = NullCfdpUser;
        h.filestore.seed("src.bin", vec![7u8; 10]);
        let req = PutRequest::new(EntityId::new_minimal(REMOTE))
            .with_file_transfer("src.bin", "dest.bin");
        let id = h.put_request(req, &mut user).unwrap();

        drive_until_outbound(&mut h, &mut user);
        assert!(matches!(h.get_next_pdu(), Some(Pdu::Metadata(_))));
        drive_until_outbound(&mut h, &mut user);
        assert!(matches!(h.get_next_pdu(), Some(Pdu::FileData(_))));
        drive_until_outbound(&mut h, &mut user);
        let eof = match h.get_next_pdu() {
            Some(Pdu::Eof(eof)) => eof,
            other => panic!("expected EOF, got {other:?}"),
        };
        assert_eq!(h.step(), TransactionStep::WaitingForEofAck);

        let common = eof_common(&h);
        let ack_eof = AckPdu::new(
            common,
            FileDirectiveType::EofPdu,
            ConditionCode::NoError,
            TransactionStatus::Active,
        );
        h.state_machine(0, Some(Pdu::Ack(ack_eof)), &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::WaitingForFinished);

        let finished = cfdp_pdu::FinishedPdu::new(
            common,
            ConditionCode::NoError,
            cfdp_pdu::DeliveryCode::Complete,
            cfdp_pdu::FileStatus::Retained,
            Vec::new(),
            None,
        );
        h.state_machine(0, Some(Pdu::Finished(finished)), &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::SendingAckOfFinished);

        h.state_machine(0, None, &mut user).unwrap();
        assert!(matches!(h.get_next_pdu(), Some(Pdu::Ack(_))));
        assert_eq!(h.step(), TransactionStep::NoticeOfCompletion);
        h.state_machine(0, None, &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::Idle);
        assert_eq!(h.transaction_id(), None);
        let _ = id;
    }

    #[test]
    fn nak_triggers_retransmission_of_requested_range_only() {
        let mut h = handler(TransmissionMode::Acknowledged, 1024);
        let mut user = NullCfdpUser;
        h.filestore.seed("src.bin", vec![9u8; 5120]);
        let req = PutRequest::new(EntityId::new_minimal(REMOTE))
            .with_file_transfer("src.bin", "dest.bin");
        h.put_request(req, &mut user).unwrap();

        // Drain metadata + all 5 file-data segments + EOF.
        loop {
            h.state_machine(0, None, &mut user).unwrap();
            let mut saw_eof = false;
            while let Some(pdu) = h.get_next_pdu() {
                if matches!(pdu, Pdu::Eof(_)) {
                    saw_eof = true;
                }
            }
            if saw_eof {
                break;
            }
        }
        assert_eq!(h.step(), TransactionStep::WaitingForEofAck);

        let common = eof_common(&h);
        let ack_eof = AckPdu::new(
            common,
            FileDirectiveType::EofPdu,
            ConditionCode::NoError,
            TransactionStatus::Active,
        );
        h.state_machine(0, Some(Pdu::Ack(ack_eof)), &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::WaitingForFinished);

        let nak = cfdp_pdu::NakPdu::new(
            common,
            0,
            5120,
            vec![cfdp_pdu::SegmentRequest::new(2048, 3072)],
        );
        h.state_machine(0, Some(Pdu::Nak(nak)), &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::Retransmitting);

        h.state_machine(0, None, &mut user).unwrap();
        let mut retransmitted = Vec::new();
        while let Some(pdu) = h.get_next_pdu() {
            match pdu {
                Pdu::FileData(fd) => retransmitted.push(fd.offset()),
                other => panic!("unexpected pdu during retransmit: {other:?}"),
            }
        }
        assert_eq!(retransmitted, vec![2048]);
        assert_eq!(h.step(), TransactionStep::Retransmitting);

        // The NAK queue is now drained; the next tick returns to waiting
        // for Finished without re-sending EOF.
        h.state_machine(0, None, &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::WaitingForFinished);
        assert!(h.get_next_pdu().is_none());
    }

    #[test]
    fn cancellation_emits_eof_cancel_with_canceller_fault_location() {
        let mut h = handler(TransmissionMode::Unacknowledged, 1024);
        let mut user = NullCfdpUser;
        h.filestore.seed("src.bin", vec![1u8; 4096]);
        let req = PutRequest::new(EntityId::new_minimal(REMOTE))
            .with_file_transfer("src.bin", "dest.bin");
        h.put_request(req, &mut user).unwrap();

        drive_until_outbound(&mut h, &mut user);
        h.get_next_pdu(); // metadata
        drive_until_outbound(&mut h, &mut user);
        h.get_next_pdu(); // one file-data segment

        h.cancel_request(CancelRequest::current()).unwrap();
        h.state_machine(0, None, &mut user).unwrap();
        let eof = match h.get_next_pdu() {
            Some(Pdu::Eof(eof)) => eof,
            other => panic!("expected cancel EOF, got {other:?}"),
        };
        assert_eq!(eof.condition_code(), ConditionCode::CancelRequestReceived);
        assert_eq!(eof.fault_location(), Some(EntityId::new_minimal(LOCAL)));
        assert_eq!(h.step(), TransactionStep::NoticeOfCompletion);
    }

    #[test]
    fn put_request_while_busy_is_rejected() {
        let mut h = handler(TransmissionMode::Unacknowledged, 1024);
        let mut user = NullCfdpUser;
        h.filestore.seed("src.bin", Vec::new());
        let req = PutRequest::new(EntityId::new_minimal(REMOTE))
            .with_file_transfer("src.bin", "dest.bin");
        h.put_request(req.clone(), &mut user).unwrap();
        let err = h.put_request(req, &mut user).unwrap_err();
        assert!(matches!(err, SourceError::Busy));
    }

    fn eof_common(h: &SourceHandler<InMemoryFilestore, StdTimerCreator>) -> CommonPduConfig {
        let id = h.transaction_id().unwrap();
        CommonPduConfig::new(
            id.source_entity_id,
            id.dest_entity_id,
            EntityId::new_minimal(id.seq_num),
            TransmissionMode::Acknowledged,
            false,
        )
    }
}
