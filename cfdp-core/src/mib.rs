//! The Management Information Base: per-remote-entity configuration
//! that the handlers consult for timer intervals, counter limits, the
//! default checksum type, and the fault handler policy table.

use std::collections::HashMap;

use cfdp_pdu::{ChecksumType, ConditionCode, EntityId, TransmissionMode};

/// What a handler does when a given condition code is declared as a fault.
/// `Suspend` is accepted as a configuration value — the wire format and the
/// standard both name it — but this core treats it identically to `Cancel`
/// since suspend/resume itself is out of scope for this core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FaultHandlerAction {
    Ignore,
    Cancel,
    Suspend,
    Abandon,
}

impl FaultHandlerAction {
    /// Collapses `Suspend` into `Cancel`, which is the only distinction
    /// `cfdp-core`'s handlers act on.
    pub fn as_effective(self) -> EffectiveFaultAction {
        match self {
            Self::Ignore => EffectiveFaultAction::Ignore,
            Self::Cancel | Self::Suspend => EffectiveFaultAction::Cancel,
            Self::Abandon => EffectiveFaultAction::Abandon,
        }
    }
}

/// The two outcomes a handler actually implements for a declared fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EffectiveFaultAction {
    Ignore,
    Cancel,
    Abandon,
}

/// Per-condition-code fault handler overrides. Any condition code absent
/// from the map falls back to [`FaultHandlerAction::Cancel`], the default
/// the standard specifies.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FaultHandlerOverrideMap {
    overrides: HashMap<u8, FaultHandlerAction>,
}

impl FaultHandlerOverrideMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, condition_code: ConditionCode, action: FaultHandlerAction) {
        self.overrides.insert(condition_code.code(), action);
    }

    pub fn action_for(&self, condition_code: ConditionCode) -> FaultHandlerAction {
        self.overrides
            .get(&condition_code.code())
            .copied()
            .unwrap_or(FaultHandlerAction::Cancel)
    }
}

/// Configuration for one remote CFDP entity, keyed by [`EntityId`] in
/// [`Mib`]. Every field the Source/Destination Handlers need that is not
/// carried by an individual Put Request lives here.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RemoteEntityConfig {
    pub entity_id: EntityId,
    pub default_transmission_mode: TransmissionMode,
    pub positive_ack_timer_interval_ms: u64,
    pub positive_ack_timer_expiration_limit: u32,
    pub nak_timer_interval_ms: u64,
    pub nak_timer_expiration_limit: u32,
    pub check_timer_interval_ms: u64,
    pub check_timer_expiration_limit: u32,
    pub default_checksum_type: ChecksumType,
    pub max_file_segment_len: usize,
    pub closure_requested: bool,
    pub crc_on_transmission: bool,
    pub fault_handler_overrides: FaultHandlerOverrideMap,
}

impl RemoteEntityConfig {
    /// A reasonable default configuration: Class 1, a 1024 byte segment
    /// length, CRC32 checksums, no closure, no CRC on transmission. Callers
    /// typically load real values from a config file via `serde`.
    pub fn new_with_defaults(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            default_transmission_mode: TransmissionMode::Unacknowledged,
            positive_ack_timer_interval_ms: 10_000,
            positive_ack_timer_expiration_limit: 3,
            nak_timer_interval_ms: 10_000,
            nak_timer_expiration_limit: 3,
            check_timer_interval_ms: 30_000,
            check_timer_expiration_limit: 3,
            default_checksum_type: ChecksumType::Crc32,
            max_file_segment_len: 1024,
            closure_requested: false,
            crc_on_transmission: false,
            fault_handler_overrides: FaultHandlerOverrideMap::new(),
        }
    }
}

/// The MIB: a lookup table from remote entity ID to its configuration.
#[derive(Debug, Clone, Default)]
pub struct Mib {
    entries: HashMap<EntityId, RemoteEntityConfig>,
}

impl Mib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, config: RemoteEntityConfig) {
        self.entries.insert(config.entity_id, config);
    }

    pub fn config_for(&self, remote_id: EntityId) -> Option<&RemoteEntityConfig> {
        self.entries.get(&remote_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_handler_defaults_to_cancel() {
        let overrides = FaultHandlerOverrideMap::new();
        assert_eq!(
            overrides
                .action_for(ConditionCode::FileChecksumFailure)
                .as_effective(),
            EffectiveFaultAction::Cancel
        );
    }

    #[test]
    fn suspend_override_collapses_to_cancel() {
        let mut overrides = FaultHandlerOverrideMap::new();
        overrides.set(ConditionCode::NakLimitReached, FaultHandlerAction::Suspend);
        assert_eq!(
            overrides.action_for(ConditionCode::NakLimitReached).as_effective(),
            EffectiveFaultAction::Cancel
        );
    }

    #[test]
    fn mib_lookup_by_entity_id() {
        let mut mib = Mib::new();
        let id = EntityId::new_minimal(7);
        mib.insert(RemoteEntityConfig::new_with_defaults(id));
        assert!(mib.config_for(id).is_some());
        assert!(mib.config_for(EntityId::new_minimal(8)).is_none());
    }
}
