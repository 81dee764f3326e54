//! Injected persistence capabilities.
//!
//! The persistent store talks to two independent surfaces: the primary
//! record store and a small resilience-marker store. They are separate traits
//! so the corruption-recovery path can be exercised with independent fakes,
//! and separate media in production so vault material survives corruption of
//! the primary store.

pub mod file;
pub mod memory;

use crate::state::PersistedState;

/// Async key-value surface holding the full persisted record.
#[expect(
    async_fn_in_trait,
    reason = "backends are injected concretely, never boxed"
)]
pub trait PrimaryStateStore {
    /// Capability probe, evaluated once by the owning store at construction.
    fn is_available(&self) -> bool;

    /// Read the current record. "Nothing persisted" is the empty sentinel,
    /// not an error; an error means the record exists but is unreadable.
    async fn read(&self) -> eyre::Result<PersistedState>;

    async fn write(&self, record: &PersistedState) -> eyre::Result<()>;
}

/// Small, independent marker surface backing the corruption-recovery path.
///
/// Boolean reads are best-effort: an unreadable marker store must never take
/// down wallet boot, so implementations degrade to `false` and log.
pub trait ResilienceMarkerStore {
    /// Whether real state has ever been persisted for this install.
    fn has_state_existed(&self) -> bool;

    fn record_state_existence(&self) -> eyre::Result<()>;

    /// Whether the user opted into restoring from the vault backup on the
    /// next load. One-shot; cleared by the recovery path.
    fn has_user_opted_into_restore(&self) -> bool;

    fn set_user_opted_into_restore(&self, opted: bool) -> eyre::Result<()>;

    /// The redundantly cached vault blob, if one was ever recorded.
    fn cached_vault(&self) -> Option<String>;

    /// Refresh the redundant vault copy (typically on successful unlock).
    fn cache_vault(&self, blob: &str) -> eyre::Result<()>;
}
