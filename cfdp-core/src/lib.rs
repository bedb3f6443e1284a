//! Sender and receiver state machines for the CCSDS File Delivery Protocol
//! (CFDP, Blue Book 727.0-B-5).
//!
//! This crate owns the protocol logic only: the [`source::SourceHandler`]
//! and [`dest::DestinationHandler`] state machines, the [`filestore`]
//! capability interface they drive, the [`mib`] they read configuration
//! from, and the [`user`] callback surface they invoke. PDU byte encoding
//! lives in the sibling `cfdp-pdu` crate; network transport and timer wall
//! time belong to the caller.

pub mod dest;
pub mod filestore;
pub mod mib;
pub mod request;
pub mod source;
pub mod timer;
pub mod transaction;
pub mod user;

pub use dest::{DestError, DestFsmResult, DestinationHandler, TransactionStep as DestTransactionStep};
pub use filestore::{FilestoreError, FilestoreResult, InMemoryFilestore, NativeFilestore, RestrictedFilestore, VirtualFilestore};
pub use mib::{EffectiveFaultAction, FaultHandlerAction, FaultHandlerOverrideMap, Mib, RemoteEntityConfig};
pub use request::{CancelRequest, PutRequest};
pub use source::{SourceError, SourceFsmResult, SourceHandler, State, TransactionStep as SourceTransactionStep};
pub use timer::{CountdownTimer, StdTimerCreator, TimerCreator, Timestamp};
pub use transaction::{ByteRangeSet, SequenceNumberGenerator, TransactionId};
pub use user::{CfdpUser, FinishedReport, NullCfdpUser, ReceivedMetadata};
