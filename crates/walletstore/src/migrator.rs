use crate::state::{PersistedState, StateMetadata};
use serde_json::{json, Value};

/// Version of the state tree before any registered migration has run.
pub const BASE_STATE_VERSION: u64 = 0;

/// A single state-tree migration. `migrate` receives the full `data` map and
/// returns the rewritten map; the migrator stamps `version` afterwards.
pub struct Migration {
    pub version: u64,
    pub migrate: fn(Value) -> eyre::Result<Value>,
}

/// Produces versioned initial state trees and upgrades persisted records to
/// the current version by running the registered migrations in order.
#[derive(Default)]
pub struct Migrator {
    migrations: Vec<Migration>,
}

impl Migrator {
    /// Migrations must be strictly ascending by version.
    pub fn new(migrations: Vec<Migration>) -> eyre::Result<Self> {
        for pair in migrations.windows(2) {
            if let [a, b] = pair {
                if b.version <= a.version {
                    eyre::bail!(
                        "migrations out of order: version {} follows {}",
                        b.version,
                        a.version
                    );
                }
            }
        }
        Ok(Self { migrations })
    }

    /// The version a fully migrated state tree carries.
    pub fn current_version(&self) -> u64 {
        self.migrations
            .last()
            .map_or(BASE_STATE_VERSION, |m| m.version)
    }

    /// Wrap a seed `data` map into a record stamped with the current version.
    ///
    /// Infallible: a fresh seed needs no migrating, only stamping.
    pub fn generate_initial_state(&self, seed: Value) -> PersistedState {
        PersistedState::new(seed, StateMetadata::new(self.current_version()))
    }

    /// Run every migration newer than the record's version, in order, and
    /// stamp the result. Records without `meta` are treated as base-version.
    pub fn migrate(&self, record: PersistedState) -> eyre::Result<PersistedState> {
        let from = record.meta.map_or(BASE_STATE_VERSION, |m| m.version);
        let mut data = record.data.unwrap_or_else(|| json!({}));
        let mut version = from;
        for m in &self.migrations {
            if m.version > from {
                data = (m.migrate)(data)?;
                version = m.version;
            }
        }
        Ok(PersistedState::new(data, StateMetadata::new(version)))
    }
}

/// The hard-coded seed every fresh install and recovery fallback starts from.
pub fn first_time_seed() -> Value {
    json!({
        "config": {},
    })
}
