//! The Destination Handler state machine: reassembles a file
//! transfer from incoming Metadata/File Data/EOF PDUs, writes through the
//! virtual filestore, and in Class 2 drives NAK-based retransmission and
//! the Finished/ACK closure handshake.

use std::collections::VecDeque;
use std::path::Path;

use cfdp_pdu::{
    AckPdu, ChecksumType, CommonPduConfig, ConditionCode, DeliveryCode, EntityId, FileDirectiveType,
    FileStatus, FilestoreAction, FilestoreRequest, FilestoreResponse, FilestoreResponseStatus,
    FinishedPdu, Pdu, SegmentRequest, Tlv, TransactionStatus, TransmissionMode,
};

use crate::filestore::{checksum_over_reader, FileHandle, FilestoreError, VirtualFilestore};
use crate::mib::{EffectiveFaultAction, Mib, RemoteEntityConfig};
use crate::request::CancelRequest;
use crate::timer::{CountdownTimer, TimerCreator, Timestamp};
use crate::transaction::{ByteRangeSet, TransactionId};
use crate::user::{CfdpUser, FinishedReport, ReceivedMetadata};

#[derive(Debug, thiserror::Error)]
pub enum DestError {
    #[error("destination handler has no active transaction")]
    NoActiveTransaction,
    #[error("transaction {0} is not the one this destination handler is driving")]
    UnknownTransaction(TransactionId),
    #[error("no MIB entry for remote entity {0:?}")]
    UnknownRemoteEntity(EntityId),
    #[error(transparent)]
    Filestore(#[from] FilestoreError),
    #[error(transparent)]
    Pdu(#[from] cfdp_pdu::PduError),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Busy(TransmissionMode),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionStep {
    Idle,
    TransactionStart,
    ReceivingFileData,
    SendingNaks,
    WaitingForMissingData,
    TransferCompletion,
    SendingFinished,
    WaitingForFinishedAck,
    NoticeOfCompletion,
}

/// The result of one `state_machine` call, mirroring [`crate::source::SourceFsmResult`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DestFsmResult {
    pub step: TransactionStep,
    pub packet_ready: bool,
    pub packets_sent_count: u32,
}

struct DestTransaction {
    id: TransactionId,
    remote_config: RemoteEntityConfig,
    common: CommonPduConfig,
    trans_mode: TransmissionMode,
    metadata_received: bool,
    closure_requested: bool,
    checksum_type: ChecksumType,
    src_file_name: Option<String>,
    dest_file_name: Option<String>,
    filestore_requests: Vec<FilestoreRequest>,
    file_handle: Option<FileHandle>,
    /// File Data received before the Metadata PDU arrived, staged in memory
    /// until a destination path exists to write into.
    pending_segments: Vec<(u64, Vec<u8>)>,
    file_size: Option<u64>,
    received_ranges: ByteRangeSet,
    sender_checksum: Option<u32>,
    eof_received: bool,
    condition_code: ConditionCode,
    fault_location: Option<EntityId>,
    delivery_code: DeliveryCode,
    file_status: FileStatus,
    filestore_response_tlvs: Vec<Tlv>,
    check_timer: Option<Box<dyn CountdownTimer>>,
    nak_timer: Option<Box<dyn CountdownTimer>>,
    finished_ack_timer: Option<Box<dyn CountdownTimer>>,
    nak_counter: u32,
    check_counter: u32,
    ack_counter: u32,
    cancel_requested: bool,
}

/// Drives one Destination transaction at a time; owns a single
/// `DestTransaction` rather than a transaction table.
pub struct DestinationHandler<FS: VirtualFilestore, TC: TimerCreator> {
    local_entity_id: EntityId,
    filestore: FS,
    timer_creator: TC,
    mib: Mib,
    state: State,
    step: TransactionStep,
    transaction: Option<DestTransaction>,
    outbound: VecDeque<Pdu>,
    last_abandoned: Option<(TransactionId, ConditionCode, u64)>,
}

impl<FS: VirtualFilestore, TC: TimerCreator> DestinationHandler<FS, TC> {
    pub fn new(local_entity_id: EntityId, filestore: FS, timer_creator: TC, mib: Mib) -> Self {
        Self {
            local_entity_id,
            filestore,
            timer_creator,
            mib,
            state: State::Idle,
            step: TransactionStep::Idle,
            transaction: None,
            outbound: VecDeque::new(),
            last_abandoned: None,
        }
    }

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
        self.transaction.as_ref().and_then(|t| t.file_size)
    }

    pub fn progress(&self) -> u64 {
        self.transaction
            .as_ref()
            .map(|t| t.received_ranges.received_len())
            .unwrap_or(0)
    }

    pub fn get_next_pdu(&mut self) -> Option<Pdu> {
        self.outbound.pop_front()
    }

    pub fn cancel_request(&mut self, req: CancelRequest) -> Result<(), DestError> {
        let txn = self
            .transaction
            .as_mut()
            .ok_or(DestError::NoActiveTransaction)?;
        if let Some(target) = req.transaction_id {
            if target != txn.id {
                return Err(DestError::UnknownTransaction(target));
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
    ) -> Result<DestFsmResult, DestError> {
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
            self.begin_cancellation(user)?;
        } else {
            match self.step {
                TransactionStep::Idle => {
                    if let Some(pdu) = packet {
                        self.adopt_and_process(pdu, now, user)?;
                    }
                }
                TransactionStep::TransactionStart => {
                    // Reached only if a caller drives `state_machine` with
                    // no packet before the one that started the transaction
                    // has been processed; `adopt_and_process` normally moves
                    // past this step itself.
                    self.step = TransactionStep::ReceivingFileData;
                }
                TransactionStep::ReceivingFileData => {
                    if let Some(pdu) = packet {
                        self.handle_packet(pdu, now, user)?;
                    }
                    self.maybe_enter_transfer_completion();
                }
                TransactionStep::SendingNaks => self.send_naks(now)?,
                TransactionStep::WaitingForMissingData => {
                    if let Some(pdu) = packet {
                        self.handle_packet(pdu, now, user)?;
                    }
                    self.maybe_enter_transfer_completion();
                    if matches!(self.step, TransactionStep::WaitingForMissingData) {
                        self.check_nak_timer(now, user)?;
                    }
                }
                TransactionStep::TransferCompletion => self.run_transfer_completion(now)?,
                TransactionStep::SendingFinished => self.send_finished(now)?,
                TransactionStep::WaitingForFinishedAck => {
                    self.handle_finished_ack_wait(now, packet, user)?
                }
                TransactionStep::NoticeOfCompletion => self.notice_of_completion(user)?,
            }
        }

        let sent = self.outbound.len() - before;
        Ok(DestFsmResult {
            step: self.step,
            packet_ready: !self.outbound.is_empty(),
            packets_sent_count: sent as u32,
        })
    }

    /// Adopts a transaction named by `pdu` if it targets us and
    /// is not already known, then immediately processes `pdu`'s content —
    /// Metadata need not precede File Data.
    fn adopt_and_process(
        &mut self,
        pdu: Pdu,
        now: Timestamp,
        user: &mut impl CfdpUser,
    ) -> Result<(), DestError> {
        let common = pdu.common_config();
        if common.dest_entity_id != self.local_entity_id {
            // Not addressed to us; entity-ID validation happens only
            // against the destination entity ID.
            return Ok(());
        }
        let remote_config = self
            .mib
            .config_for(common.source_entity_id)
            .cloned()
            .ok_or(DestError::UnknownRemoteEntity(common.source_entity_id))?;
        let id = TransactionId::new(
            common.source_entity_id,
            common.dest_entity_id,
            common.transaction_seq_num.value(),
        );
        let checksum_type = remote_config.default_checksum_type;
        let closure_requested = remote_config.closure_requested;
        self.transaction = Some(DestTransaction {
            id,
            remote_config,
            common,
            trans_mode: common.trans_mode,
            metadata_received: false,
            closure_requested,
            checksum_type,
            src_file_name: None,
            dest_file_name: None,
            filestore_requests: Vec::new(),
            file_handle: None,
            pending_segments: Vec::new(),
            file_size: None,
            received_ranges: ByteRangeSet::new(),
            sender_checksum: None,
            eof_received: false,
            condition_code: ConditionCode::NoError,
            fault_location: None,
            delivery_code: DeliveryCode::Complete,
            file_status: FileStatus::Unreported,
            filestore_response_tlvs: Vec::new(),
            check_timer: None,
            nak_timer: None,
            finished_ack_timer: None,
            nak_counter: 0,
            check_counter: 0,
            ack_counter: 0,
            cancel_requested: false,
        });
        self.state = State::Busy(common.trans_mode);
        self.step = TransactionStep::TransactionStart;
        user.transaction_indication(id);
        log::info!("dest: transaction {id} started");
        self.handle_packet(pdu, now, user)?;
        // `handle_packet` may have already moved the step on (EOF jumps
        // straight to `TransferCompletion`, a declared fault to
        // `SendingFinished`); only fill in the ordinary case.
        if matches!(self.step, TransactionStep::TransactionStart) {
            self.step = TransactionStep::ReceivingFileData;
        }
        self.maybe_enter_transfer_completion();
        Ok(())
    }

    fn handle_packet(
        &mut self,
        pdu: Pdu,
        now: Timestamp,
        user: &mut impl CfdpUser,
    ) -> Result<(), DestError> {
        match pdu {
            Pdu::Metadata(m) => self.on_metadata(m, user),
            Pdu::FileData(fd) => self.on_file_data(fd, now, user),
            Pdu::Eof(eof) => self.on_eof(eof, user),
            Pdu::Ack(_) => Ok(()), // handled explicitly in WaitingForFinishedAck
            Pdu::Nak(_) | Pdu::Prompt(_) | Pdu::KeepAlive(_) => Ok(()),
        }
    }

    fn on_metadata(&mut self, m: cfdp_pdu::MetadataPdu, user: &mut impl CfdpUser) -> Result<(), DestError> {
        let txn = self.transaction.as_ref().unwrap();
        if txn.metadata_received {
            let unchanged = txn.src_file_name.as_deref() == Some(m.src_file_name())
                && txn.dest_file_name.as_deref() == Some(m.dest_file_name())
                && txn.file_size == Some(m.metadata_params().file_size);
            if !unchanged {
                return self.declare_fault(ConditionCode::InvalidFileStructure, user);
            }
            return Ok(());
        }

        let id = txn.id;
        let dest_file_name = m.dest_file_name().to_string();
        let filestore_requests: Vec<FilestoreRequest> = m
            .options()
            .iter()
            .filter_map(|tlv| FilestoreRequest::from_tlv(tlv).ok())
            .collect();

        let txn = self.transaction.as_mut().unwrap();
        txn.metadata_received = true;
        txn.src_file_name = Some(m.src_file_name().to_string());
        txn.dest_file_name = Some(dest_file_name.clone());
        txn.file_size.get_or_insert(m.metadata_params().file_size);
        txn.checksum_type = m.metadata_params().checksum_type;
        txn.closure_requested = m.metadata_params().closure_requested;
        txn.filestore_requests = filestore_requests;

        if !dest_file_name.is_empty() {
            let path = Path::new(&dest_file_name);
            match self
                .filestore
                .create_file(path)
                .and_then(|_| self.filestore.open_write(path, false))
            {
                Ok(handle) => {
                    let pending = std::mem::take(&mut self.transaction.as_mut().unwrap().pending_segments);
                    for (offset, data) in pending {
                        self.filestore.write(handle, offset, &data)?;
                    }
                    self.transaction.as_mut().unwrap().file_handle = Some(handle);
                }
                Err(_) => {
                    return self.declare_fault(ConditionCode::FilestoreRejection, user);
                }
            }
        }

        let metadata = ReceivedMetadata {
            src_file_name: self.transaction.as_ref().unwrap().src_file_name.clone().unwrap_or_default(),
            dest_file_name,
            file_size: self.transaction.as_ref().unwrap().file_size.unwrap_or(0),
        };
        user.metadata_recv_indication(id, &metadata);
        log::debug!("dest: transaction {id} received metadata");
        Ok(())
    }

    fn on_file_data(
        &mut self,
        fd: cfdp_pdu::FileDataPdu,
        _now: Timestamp,
        user: &mut impl CfdpUser,
    ) -> Result<(), DestError> {
        let offset = fd.offset();
        let len = fd.data().len();
        let txn = self.transaction.as_ref().unwrap();
        if let Some(size) = txn.file_size {
            if offset + len as u64 > size {
                return self.declare_fault(ConditionCode::FileSizeError, user);
            }
        }
        let id = txn.id;
        let data = fd.into_data();
        match self.transaction.as_ref().unwrap().file_handle {
            Some(handle) => self.filestore.write(handle, offset, &data)?,
            None => self
                .transaction
                .as_mut()
                .unwrap()
                .pending_segments
                .push((offset, data)),
        }
        let txn = self.transaction.as_mut().unwrap();
        txn.received_ranges.insert(offset, offset + len as u64);
        user.file_segment_recv_indication(id, offset, len);
        Ok(())
    }

    fn on_eof(&mut self, eof: cfdp_pdu::EofPdu, user: &mut impl CfdpUser) -> Result<(), DestError> {
        let txn = self.transaction.as_mut().unwrap();
        txn.eof_received = true;
        txn.sender_checksum = Some(eof.file_checksum());
        txn.file_size.get_or_insert(eof.file_size());
        if eof.condition_code() != ConditionCode::NoError && txn.condition_code == ConditionCode::NoError {
            txn.condition_code = eof.condition_code();
            txn.fault_location = eof.fault_location().or(Some(txn.id.source_entity_id));
        }
        let trans_mode = txn.trans_mode;
        let common = txn.common;
        if matches!(trans_mode, TransmissionMode::Acknowledged) {
            let ack = AckPdu::new(
                common,
                FileDirectiveType::EofPdu,
                txn.condition_code,
                TransactionStatus::Active,
            );
            self.outbound.push_back(Pdu::Ack(ack));
        }
        log::debug!("dest: transaction {} received EOF, checksum 0x{:08x}", txn.id, eof.file_checksum());
        self.step = TransactionStep::TransferCompletion;
        Ok(())
    }

    /// After handling an inbound packet while receiving data, advances to
    /// `TransferCompletion` once EOF has been seen — completion is always
    /// gated on EOF, never inferred purely from byte coverage.
    fn maybe_enter_transfer_completion(&mut self) {
        if matches!(
            self.step,
            TransactionStep::ReceivingFileData | TransactionStep::WaitingForMissingData
        ) {
            if let Some(txn) = &self.transaction {
                if txn.eof_received {
                    if let Some(timer_holder) = self.transaction.as_mut() {
                        timer_holder.nak_timer = None;
                    }
                    self.step = TransactionStep::TransferCompletion;
                }
            }
        }
    }

    fn gaps(&self) -> Vec<(u64, u64)> {
        let txn = self.transaction.as_ref().unwrap();
        let file_size = txn.file_size.unwrap_or(0);
        let mut gaps = txn.received_ranges.missing_ranges(file_size);
        if !txn.metadata_received {
            gaps.insert(0, (0, 0));
        }
        gaps
    }

    fn run_transfer_completion(&mut self, now: Timestamp) -> Result<(), DestError> {
        let gaps = self.gaps();
        if gaps.is_empty() {
            let txn = self.transaction.as_ref().unwrap();
            let file_size = txn.file_size.unwrap_or(0);
            let checksum = match &txn.dest_file_name {
                Some(path) if file_size > 0 => {
                    self.filestore
                        .calculate_checksum(txn.checksum_type, Path::new(path), 0, file_size)?
                }
                _ => checksum_over_reader(txn.checksum_type, &[][..], 0)
                    .expect("checksum over zero bytes cannot fail"),
            };
            let txn = self.transaction.as_mut().unwrap();
            if txn.condition_code == ConditionCode::NoError && Some(checksum) != txn.sender_checksum {
                txn.condition_code = ConditionCode::FileChecksumFailure;
            }
            self.step = TransactionStep::SendingFinished;
            return Ok(());
        }

        let txn = self.transaction.as_mut().unwrap();
        match txn.trans_mode {
            TransmissionMode::Unacknowledged => {
                let expired = txn
                    .check_timer
                    .as_ref()
                    .map(|t| t.has_expired(now))
                    .unwrap_or(false);
                if txn.check_timer.is_none() {
                    let interval = txn.remote_config.check_timer_interval_ms;
                    txn.check_timer = Some(self.timer_creator.build(now, interval));
                } else if expired {
                    txn.check_counter += 1;
                    if txn.check_counter > txn.remote_config.check_timer_expiration_limit {
                        txn.condition_code = ConditionCode::CheckLimitReached;
                        self.step = TransactionStep::SendingFinished;
                    } else {
                        let interval = txn.remote_config.check_timer_interval_ms;
                        txn.check_timer = Some(self.timer_creator.build(now, interval));
                    }
                }
            }
            TransmissionMode::Acknowledged => {
                self.step = TransactionStep::SendingNaks;
            }
        }
        Ok(())
    }

    fn send_naks(&mut self, now: Timestamp) -> Result<(), DestError> {
        let gaps = self.gaps();
        let txn = self.transaction.as_ref().unwrap();
        let file_size = txn.file_size.unwrap_or(0);
        let requests: Vec<SegmentRequest> = gaps
            .iter()
            .map(|&(s, e)| {
                if (s, e) == (0, 0) {
                    SegmentRequest::metadata_request()
                } else {
                    SegmentRequest::new(s, e)
                }
            })
            .collect();
        let nak = cfdp_pdu::NakPdu::new(txn.common, 0, file_size, requests);
        self.outbound.push_back(Pdu::Nak(nak));
        let interval = txn.remote_config.nak_timer_interval_ms;
        let timer = self.timer_creator.build(now, interval);
        let txn = self.transaction.as_mut().unwrap();
        txn.nak_timer = Some(timer);
        self.step = TransactionStep::WaitingForMissingData;
        Ok(())
    }

    fn check_nak_timer(&mut self, now: Timestamp, user: &mut impl CfdpUser) -> Result<(), DestError> {
        let expired = self
            .transaction
            .as_ref()
            .unwrap()
            .nak_timer
            .as_ref()
            .map(|t| t.has_expired(now))
            .unwrap_or(false);
        if !expired {
            return Ok(());
        }
        let txn = self.transaction.as_mut().unwrap();
        txn.nak_counter += 1;
        if txn.nak_counter > txn.remote_config.nak_timer_expiration_limit {
            return self.declare_fault(ConditionCode::NakLimitReached, user);
        }
        let gaps = self.gaps();
        let txn = self.transaction.as_ref().unwrap();
        let file_size = txn.file_size.unwrap_or(0);
        let requests: Vec<SegmentRequest> = gaps
            .iter()
            .map(|&(s, e)| {
                if (s, e) == (0, 0) {
                    SegmentRequest::metadata_request()
                } else {
                    SegmentRequest::new(s, e)
                }
            })
            .collect();
        let nak = cfdp_pdu::NakPdu::new(txn.common, 0, file_size, requests);
        self.outbound.push_back(Pdu::Nak(nak));
        let interval = txn.remote_config.nak_timer_interval_ms;
        let timer = self.timer_creator.build(now, interval);
        self.transaction.as_mut().unwrap().nak_timer = Some(timer);
        Ok(())
    }

    /// Applies filestore requests in order, stopping at the
    /// first rejection, then emits Finished (or skips it for Class 1
    /// without closure).
    fn send_finished(&mut self, now: Timestamp) -> Result<(), DestError> {
        let requests = self.transaction.as_ref().unwrap().filestore_requests.clone();
        let mut responses = Vec::with_capacity(requests.len());
        let mut rejected = false;
        for req in &requests {
            if rejected {
                responses.push(FilestoreResponse {
                    action: req.action,
                    status: FilestoreResponseStatus::NotPerformed,
                    first_name: req.first_name.clone(),
                    second_name: req.second_name.clone(),
                });
                continue;
            }
            let outcome = self.apply_filestore_request(req);
            let status = match outcome {
                Ok(()) => FilestoreResponseStatus::Successful,
                Err(_) => {
                    rejected = true;
                    FilestoreResponseStatus::Rejected
                }
            };
            responses.push(FilestoreResponse {
                action: req.action,
                status,
                first_name: req.first_name.clone(),
                second_name: req.second_name.clone(),
            });
        }
        let txn = self.transaction.as_mut().unwrap();
        if rejected && txn.condition_code == ConditionCode::NoError {
            txn.condition_code = ConditionCode::FilestoreRejection;
        }

        let gaps = self.gaps();
        let complete = gaps.is_empty() && txn.condition_code == ConditionCode::NoError;
        txn.delivery_code = if complete {
            DeliveryCode::Complete
        } else {
            DeliveryCode::Incomplete
        };
        txn.file_status = match txn.condition_code {
            ConditionCode::FilestoreRejection => FileStatus::DiscardedFilestoreRejection,
            ConditionCode::FileSizeError => FileStatus::DiscardedFileSizeError,
            _ => FileStatus::Retained,
        };
        txn.filestore_response_tlvs = responses.iter().map(|r| r.to_tlv()).collect();
        if txn.condition_code != ConditionCode::NoError {
            txn.fault_location.get_or_insert(self.local_entity_id);
        }

        let finished = self.build_finished_pdu();
        let trans_mode = self.transaction.as_ref().unwrap().trans_mode;
        let closure_requested = self.transaction.as_ref().unwrap().closure_requested;
        if matches!(trans_mode, TransmissionMode::Unacknowledged) && !closure_requested {
            self.step = TransactionStep::NoticeOfCompletion;
            return Ok(());
        }
        self.outbound.push_back(Pdu::Finished(finished));
        match trans_mode {
            TransmissionMode::Unacknowledged => {
                self.step = TransactionStep::NoticeOfCompletion;
            }
            TransmissionMode::Acknowledged => {
                let txn = self.transaction.as_mut().unwrap();
                let interval = txn.remote_config.positive_ack_timer_interval_ms;
                txn.finished_ack_timer = Some(self.timer_creator.build(now, interval));
                self.step = TransactionStep::WaitingForFinishedAck;
            }
        }
        Ok(())
    }

    fn apply_filestore_request(&self, req: &FilestoreRequest) -> Result<(), FilestoreError> {
        let first = Path::new(&req.first_name);
        match req.action {
            FilestoreAction::CreateFile => self.filestore.create_file(first),
            FilestoreAction::DeleteFile => self.filestore.delete_file(first),
            FilestoreAction::RenameFile => {
                let second = req.second_name.as_deref().unwrap_or_default();
                self.filestore.rename(first, Path::new(second))
            }
            FilestoreAction::AppendFile => {
                let second = req.second_name.as_deref().unwrap_or_default();
                self.filestore.append(first, Path::new(second))
            }
            FilestoreAction::ReplaceFile => {
                let second = req.second_name.as_deref().unwrap_or_default();
                self.filestore.replace(first, Path::new(second))
            }
            FilestoreAction::CreateDirectory => self.filestore.create_directory(first),
            FilestoreAction::RemoveDirectory => self.filestore.remove_directory(first),
            FilestoreAction::DenyFile => self.filestore.delete_file(first).or(Ok(())),
            FilestoreAction::DenyDirectory => self.filestore.remove_directory(first).or(Ok(())),
        }
    }

    fn build_finished_pdu(&self) -> FinishedPdu {
        let txn = self.transaction.as_ref().unwrap();
        FinishedPdu::new(
            txn.common,
            txn.condition_code,
            txn.delivery_code,
            txn.file_status,
            txn.filestore_response_tlvs.clone(),
            txn.fault_location,
        )
    }

    fn handle_finished_ack_wait(
        &mut self,
        now: Timestamp,
        packet: Option<Pdu>,
        user: &mut impl CfdpUser,
    ) -> Result<(), DestError> {
        if let Some(Pdu::Ack(ack)) = &packet {
            if ack.directive_acked() == FileDirectiveType::FinishedPdu {
                let txn = self.transaction.as_mut().unwrap();
                txn.finished_ack_timer = None;
                self.step = TransactionStep::NoticeOfCompletion;
                return Ok(());
            }
        }
        let expired = self
            .transaction
            .as_ref()
            .unwrap()
            .finished_ack_timer
            .as_ref()
            .map(|t| t.has_expired(now))
            .unwrap_or(false);
        if !expired {
            return Ok(());
        }
        let txn = self.transaction.as_mut().unwrap();
        txn.ack_counter += 1;
        if txn.ack_counter > txn.remote_config.positive_ack_timer_expiration_limit {
            let id = txn.id;
            let progress = self.progress();
            txn.condition_code = ConditionCode::PositiveAckLimitReached;
            log::warn!("dest: transaction {id} positive ack limit reached on Finished");
            user.fault_indication(id, ConditionCode::PositiveAckLimitReached, progress);
            self.step = TransactionStep::NoticeOfCompletion;
        } else {
            let finished = self.build_finished_pdu();
            self.outbound.push_back(Pdu::Finished(finished));
            let txn = self.transaction.as_mut().unwrap();
            let interval = txn.remote_config.positive_ack_timer_interval_ms;
            txn.finished_ack_timer = Some(self.timer_creator.build(now, interval));
        }
        Ok(())
    }

    fn notice_of_completion(&mut self, user: &mut impl CfdpUser) -> Result<(), DestError> {
        let txn = self.transaction.take().unwrap();
        if let Some(handle) = txn.file_handle {
            self.filestore.close(handle)?;
        }
        let report = FinishedReport {
            condition_code: txn.condition_code,
            delivery_code: txn.delivery_code,
            file_status: txn.file_status,
        };
        user.transaction_finished_indication(txn.id, report);
        log::info!("dest: transaction {} complete: {:?}", txn.id, report.condition_code);
        self.state = State::Idle;
        self.step = TransactionStep::Idle;
        Ok(())
    }

    /// Looks up the fault handler policy for `condition_code` and acts on
    /// it, mirroring [`crate::source::SourceHandler`]'s `declare_fault`
    /// and the fault handler policy.
    fn declare_fault(
        &mut self,
        condition_code: ConditionCode,
        user: &mut impl CfdpUser,
    ) -> Result<(), DestError> {
        let txn = self.transaction.as_ref().unwrap();
        let action = txn
            .remote_config
            .fault_handler_overrides
            .action_for(condition_code)
            .as_effective();
        let id = txn.id;
        let progress = self.progress();
        log::warn!("dest: fault {condition_code:?} on transaction {id} -> {action:?}");
        user.fault_indication(id, condition_code, progress);
        match action {
            EffectiveFaultAction::Ignore => Ok(()),
            EffectiveFaultAction::Cancel => {
                let txn = self.transaction.as_mut().unwrap();
                txn.condition_code = condition_code;
                txn.cancel_requested = true;
                self.begin_cancellation(user)
            }
            EffectiveFaultAction::Abandon => {
                let txn = self.transaction.take().unwrap();
                if let Some(handle) = txn.file_handle {
                    let _ = self.filestore.close(handle);
                }
                let progress = txn.received_ranges.received_len();
                self.last_abandoned = Some((txn.id, condition_code, progress));
                user.abandoned_indication(txn.id, condition_code, progress);
                self.state = State::Idle;
                self.step = TransactionStep::Idle;
                Ok(())
            }
        }
    }

    fn begin_cancellation(&mut self, _user: &mut impl CfdpUser) -> Result<(), DestError> {
        let txn = self.transaction.as_mut().unwrap();
        if txn.condition_code == ConditionCode::NoError {
            txn.condition_code = ConditionCode::CancelRequestReceived;
        }
        txn.fault_location = Some(self.local_entity_id);
        txn.cancel_requested = false;
        self.step = TransactionStep::SendingFinished;
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
    use cfdp_pdu::{EntityId, FileDataPdu, MetadataGenericParams, MetadataPdu};

    const LOCAL: u64 = 2;
    const REMOTE: u64 = 1;

    fn handler(mode: TransmissionMode) -> DestinationHandler<InMemoryFilestore, StdTimerCreator> {
        let mut mib = Mib::new();
        let mut cfg = RemoteEntityConfig::new_with_defaults(EntityId::new_minimal(REMOTE));
        cfg.default_transmission_mode = mode;
        cfg.nak_timer_expiration_limit = 2;
        cfg.check_timer_expiration_limit = 2;
        cfg.positive_ack_timer_expiration_limit = 2;
        mib.insert(cfg);
        DestinationHandler::new(
            EntityId::new_minimal(LOCAL),
            InMemoryFilestore::new(),
            StdTimerCreator,
            mib,
        )
    }

    fn common(mode: TransmissionMode) -> CommonPduConfig {
        CommonPduConfig::new(
            EntityId::new_minimal(REMOTE),
            EntityId::new_minimal(LOCAL),
            EntityId::new_minimal(7),
            mode,
            false,
        )
    }

    #[test]
    fn empty_file_class1_no_closure_completes() {
        let mut h = handler(TransmissionMode::Unacknowledged);
        let mut user = RecordingCfdpUser::default();
        let common = common(TransmissionMode::Unacknowledged);

        let metadata = MetadataPdu::new(
            common,
            MetadataGenericParams::new(false, ChecksumType::Crc32, 0),
            "src.bin".into(),
            "dest.bin".into(),
            &[],
            &[],
        );
        h.state_machine(0, Some(Pdu::Metadata(metadata)), &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::ReceivingFileData);

        let eof = cfdp_pdu::EofPdu::new(common, ConditionCode::NoError, 0, 0, None);
        let res = h.state_machine(0, Some(Pdu::Eof(eof)), &mut user).unwrap();
        assert_eq!(res.step, TransactionStep::TransferCompletion);

        h.state_machine(0, None, &mut user).unwrap(); // TransferCompletion -> SendingFinished
        assert_eq!(h.step(), TransactionStep::SendingFinished);
        h.state_machine(0, None, &mut user).unwrap(); // SendingFinished: no closure -> NoticeOfCompletion
        assert_eq!(h.step(), TransactionStep::NoticeOfCompletion);
        assert!(h.get_next_pdu().is_none());
        h.state_machine(0, None, &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::Idle);
        assert_eq!(
            user.finished_reports[0].condition_code,
            ConditionCode::NoError
        );
        assert_eq!(user.finished_reports[0].delivery_code, DeliveryCode::Complete);
    }

    #[test]
    fn complete_transfer_reports_matching_checksum() {
        let mut h = handler(TransmissionMode::Unacknowledged);
        let mut user = RecordingCfdpUser::default();
        let common = common(TransmissionMode::Unacknowledged);
        let data = b"hello cfdp world!".to_vec();
        let checksum = {
            let fs = InMemoryFilestore::new();
            fs.seed("probe.bin", data.clone());
            fs.calculate_checksum(ChecksumType::Crc32, Path::new("probe.bin"), 0, data.len() as u64)
                .unwrap()
        };

        let metadata = MetadataPdu::new(
            common,
            MetadataGenericParams::new(false, ChecksumType::Crc32, data.len() as u64),
            "src.bin".into(),
            "dest.bin".into(),
            &[],
            &[],
        );
        h.state_machine(0, Some(Pdu::Metadata(metadata)), &mut user).unwrap();

        let fdp = FileDataPdu::new(common, 0, data.clone(), false);
        h.state_machine(0, Some(Pdu::FileData(fdp)), &mut user).unwrap();

        let eof = cfdp_pdu::EofPdu::new(common, ConditionCode::NoError, checksum, data.len() as u64, None);
        h.state_machine(0, Some(Pdu::Eof(eof)), &mut user).unwrap();
        h.state_machine(0, None, &mut user).unwrap(); // TransferCompletion -> SendingFinished
        h.state_machine(0, None, &mut user).unwrap(); // SendingFinished -> NoticeOfCompletion
        h.state_machine(0, None, &mut user).unwrap(); // NoticeOfCompletion -> Idle, fires indication

        assert_eq!(
            user.finished_reports[0].condition_code,
            ConditionCode::NoError
        );
        assert_eq!(user.finished_reports[0].delivery_code, DeliveryCode::Complete);
    }

    #[test]
    fn checksum_mismatch_is_reported_as_failure() {
        let mut h = handler(TransmissionMode::Unacknowledged);
        let mut user = RecordingCfdpUser::default();
        let common = common(TransmissionMode::Unacknowledged);
        let data = b"some bytes".to_vec();

        let metadata = MetadataPdu::new(
            common,
            MetadataGenericParams::new(false, ChecksumType::Crc32, data.len() as u64),
            "src.bin".into(),
            "dest.bin".into(),
            &[],
            &[],
        );
        h.state_machine(0, Some(Pdu::Metadata(metadata)), &mut user).unwrap();
        let fdp = FileDataPdu::new(common, 0, data.clone(), false);
        h.state_machine(0, Some(Pdu::FileData(fdp)), &mut user).unwrap();
        let eof = cfdp_pdu::EofPdu::new(common, ConditionCode::NoError, 0xdeadbeef, data.len() as u64, None);
        h.state_machine(0, Some(Pdu::Eof(eof)), &mut user).unwrap();
        h.state_machine(0, None, &mut user).unwrap(); // TransferCompletion -> SendingFinished
        h.state_machine(0, None, &mut user).unwrap(); // SendingFinished -> NoticeOfCompletion
        h.state_machine(0, None, &mut user).unwrap(); // NoticeOfCompletion -> Idle, fires indication

        assert_eq!(
            user.finished_reports[0].condition_code,
            ConditionCode::FileChecksumFailure
        );
    }

    #[test]
    fn class2_gap_triggers_nak_then_completes() {
        let mut h = handler(TransmissionMode::Acknowledged);
        let mut user = RecordingCfdpUser::default();
        let common = common(TransmissionMode::Acknowledged);
        let total = 3072u64;

        let metadata = MetadataPdu::new(
            common,
            MetadataGenericParams::new(true, ChecksumType::Crc32, total),
            "src.bin".into(),
            "dest.bin".into(),
            &[],
            &[],
        );
        h.state_machine(0, Some(Pdu::Metadata(metadata)), &mut user).unwrap();

        // Only the first and third thirds arrive; [1024,2048) is missing.
        let seg0 = FileDataPdu::new(common, 0, vec![1u8; 1024], false);
        h.state_machine(0, Some(Pdu::FileData(seg0)), &mut user).unwrap();
        let seg2 = FileDataPdu::new(common, 2048, vec![3u8; 1024], false);
        h.state_machine(0, Some(Pdu::FileData(seg2)), &mut user).unwrap();

        let checksum = {
            let probe = InMemoryFilestore::new();
            let mut full = vec![1u8; 1024];
            full.extend(vec![2u8; 1024]);
            full.extend(vec![3u8; 1024]);
            probe.seed("probe.bin", full);
            probe
                .calculate_checksum(ChecksumType::Crc32, Path::new("probe.bin"), 0, total)
                .unwrap()
        };
        let eof = cfdp_pdu::EofPdu::new(common, ConditionCode::NoError, checksum, total, None);
        let res = h.state_machine(0, Some(Pdu::Eof(eof)), &mut user).unwrap();
        assert_eq!(res.step, TransactionStep::TransferCompletion);
        assert!(matches!(h.get_next_pdu(), Some(Pdu::Ack(_))));

        h.state_machine(0, None, &mut user).unwrap(); // TransferCompletion -> SendingNaks
        assert_eq!(h.step(), TransactionStep::SendingNaks);
        h.state_machine(0, None, &mut user).unwrap(); // SendingNaks -> WaitingForMissingData
        assert_eq!(h.step(), TransactionStep::WaitingForMissingData);
        let nak = match h.get_next_pdu() {
            Some(Pdu::Nak(nak)) => nak,
            other => panic!("expected NAK, got {other:?}"),
        };
        assert_eq!(
            nak.segment_requests(),
            &[SegmentRequest::new(1024, 2048)]
        );

        let seg1 = FileDataPdu::new(common, 1024, vec![2u8; 1024], false);
        h.state_machine(0, Some(Pdu::FileData(seg1)), &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::TransferCompletion);
        h.state_machine(0, None, &mut user).unwrap(); // -> SendingFinished
        h.state_machine(0, None, &mut user).unwrap(); // emits Finished, -> WaitingForFinishedAck
        assert_eq!(h.step(), TransactionStep::WaitingForFinishedAck);
        let finished = match h.get_next_pdu() {
            Some(Pdu::Finished(f)) => f,
            other => panic!("expected Finished, got {other:?}"),
        };
        assert_eq!(finished.condition_code(), ConditionCode::NoError);
        assert_eq!(finished.delivery_code(), DeliveryCode::Complete);

        let ack = AckPdu::new(
            common,
            FileDirectiveType::FinishedPdu,
            ConditionCode::NoError,
            TransactionStatus::Active,
        );
        h.state_machine(0, Some(Pdu::Ack(ack)), &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::NoticeOfCompletion);
        h.state_machine(0, None, &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::Idle);
    }

    #[test]
    fn restricted_filestore_rejection_marks_incomplete() {
        use crate::filestore::RestrictedFilestore;
        let mut mib = Mib::new();
        mib.insert(RemoteEntityConfig::new_with_defaults(EntityId::new_minimal(REMOTE)));
        let mut h = DestinationHandler::new(
            EntityId::new_minimal(LOCAL),
            RestrictedFilestore::new("/sandbox", InMemoryFilestore::new()),
            StdTimerCreator,
            mib,
        );
        let mut user = RecordingCfdpUser::default();
        let common = common(TransmissionMode::Unacknowledged);
        let metadata = MetadataPdu::new(
            common,
            MetadataGenericParams::new(false, ChecksumType::Crc32, 0),
            "src.bin".into(),
            "../escape.bin".into(),
            &[],
            &[],
        );
        h.state_machine(0, Some(Pdu::Metadata(metadata)), &mut user).unwrap();
        assert_eq!(
            user.events.iter().any(|e| e.contains("fault_indication")),
            true
        );
        let eof = cfdp_pdu::EofPdu::new(common, ConditionCode::NoError, 0, 0, None);
        h.state_machine(0, Some(Pdu::Eof(eof)), &mut user).unwrap();
        h.state_machine(0, None, &mut user).unwrap();
        h.state_machine(0, None, &mut user).unwrap();
        assert_eq!(
            user.finished_reports[0].delivery_code,
            DeliveryCode::Incomplete
        );
        assert_eq!(
            user.finished_reports[0].file_status,
            FileStatus::DiscardedFilestoreRejection
        );
    }

    #[test]
    fn cancel_request_closes_with_cancel_condition() {
        let mut h = handler(TransmissionMode::Unacknowledged);
        let mut user = NullCfdpUser;
        let common = common(TransmissionMode::Unacknowledged);
        let metadata = MetadataPdu::new(
            common,
            MetadataGenericParams::new(true, ChecksumType::Crc32, 4096),
            "src.bin".into(),
            "dest.bin".into(),
            &[],
            &[],
        );
        h.state_machine(0, Some(Pdu::Metadata(metadata)), &mut user).unwrap();
        h.cancel_request(CancelRequest::current()).unwrap();
        h.state_machine(0, None, &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::SendingFinished);
        h.state_machine(0, None, &mut user).unwrap();
        let finished = match h.get_next_pdu() {
            Some(Pdu::Finished(f)) => f,
            other => panic!("expected Finished, got {other:?}"),
        };
        assert_eq!(finished.condition_code(), ConditionCode::CancelRequestReceived);
        assert_eq!(finished.fault_location(), Some(EntityId::new_minimal(LOCAL)));
    }

    #[test]
    fn unknown_destination_entity_is_ignored() {
        let mut h = handler(TransmissionMode::Unacknowledged);
        let mut user = NullCfdpUser;
        let foreign_common = CommonPduConfig::new(
            EntityId::new_minimal(REMOTE),
            EntityId::new_minimal(99),
            EntityId::new_minimal(1),
            TransmissionMode::Unacknowledged,
            false,
        );
        let metadata = MetadataPdu::new(
            foreign_common,
            MetadataGenericParams::new(false, ChecksumType::Null, 0),
            "src.bin".into(),
            "dest.bin".into(),
            &[],
            &[],
        );
        h.state_machine(0, Some(Pdu::Metadata(metadata)), &mut user).unwrap();
        assert_eq!(h.step(), TransactionStep::Idle);
        assert_eq!(h.state(), State::Idle);
    }
}
