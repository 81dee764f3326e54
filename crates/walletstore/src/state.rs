use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Controller slot that holds the encrypted keyring vault.
pub const KEYRING_SLOT: &str = "keyring";
/// Controller slot that tracks onboarding progress.
pub const ONBOARDING_SLOT: &str = "onboarding";
/// Controller slot for UI-facing flags the storage layer may set out-of-band.
pub const UI_SLOT: &str = "ui";

/// Key inside [`KEYRING_SLOT`] holding the vault material.
pub const VAULT_KEY: &str = "vault";
/// Key inside [`KEYRING_SLOT`] marking a vault injected from the redundant backup.
pub const RESTORED_FROM_BACKUP_KEY: &str = "restored_from_backup";
/// Key inside [`ONBOARDING_SLOT`] marking onboarding as finished.
pub const COMPLETED_ONBOARDING_KEY: &str = "completed_onboarding";
/// Key inside [`UI_SLOT`] instructing the UI to show the corruption-recovery prompt.
pub const CORRUPTION_PROMPT_KEY: &str = "show_state_corruption_recovery";

/// Migration bookkeeping persisted next to the state tree.
///
/// `version` records which migrations have been applied; it is set exclusively
/// by the migrator-owning caller, never by the stores themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub version: u64,
}

impl StateMetadata {
    pub const fn new(version: u64) -> Self {
        Self { version }
    }
}

/// The top-level persisted record: the opaque controller-state map under
/// `data`, and the migration metadata under `meta`.
///
/// A record with neither key (the serialized `{}`) is the empty sentinel:
/// "nothing was ever persisted", as opposed to "persisted state exists but is
/// unreadable". Healthy writes always carry both keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<StateMetadata>,
}

impl PersistedState {
    pub const fn new(data: Value, meta: StateMetadata) -> Self {
        Self {
            data: Some(data),
            meta: Some(meta),
        }
    }

    /// The empty sentinel.
    pub const fn empty() -> Self {
        Self {
            data: None,
            meta: None,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.data.is_none() && self.meta.is_none()
    }

    /// Insert `key = value` into the named controller slot, creating the slot
    /// (and the `data` map itself) if absent. Non-object slots are replaced.
    pub fn insert_into_slot(&mut self, slot: &str, key: &str, value: Value) {
        let data = self
            .data
            .get_or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !data.is_object() {
            *data = Value::Object(serde_json::Map::new());
        }
        if let Some(map) = data.as_object_mut() {
            let entry = map
                .entry(slot.to_owned())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(serde_json::Map::new());
            }
            if let Some(slot_map) = entry.as_object_mut() {
                slot_map.insert(key.to_owned(), value);
            }
        }
    }

    /// Read `key` out of the named controller slot, if present.
    pub fn slot_value(&self, slot: &str, key: &str) -> Option<&Value> {
        self.data.as_ref()?.get(slot)?.get(key)
    }
}
