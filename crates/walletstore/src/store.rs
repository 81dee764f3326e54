use crate::{
    migrator::{first_time_seed, Migrator},
    state::{PersistedState, StateMetadata},
};
use serde_json::Value;

/// Health of a store instance. Replaces a pair of independent sticky booleans
/// with explicit, testable transitions:
///
/// - `Healthy -> WriteFailing` on the first failed write (reported once per
///   failure streak), back to `Healthy` on the next successful write.
/// - any state `-> CorruptionDetected` when a read fails or returns the empty
///   sentinel despite recorded prior existence.
/// - `CorruptionDetected -> Healthy` only through the opted-in recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreHealth {
    Healthy,
    WriteFailing,
    CorruptionDetected,
}

/// What actually happened to a `set` call that passed its preconditions.
///
/// Writes never fail loudly: a dropped or suppressed write is normal operation
/// for a degraded store, and the caller keeps running on in-memory state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The record reached the backend.
    Written,
    /// Corruption is unresolved and the user has not opted into recovery;
    /// the write was intentionally not attempted.
    Suppressed,
    /// The backend write failed; the record was dropped.
    Dropped,
}

/// The uniform contract every concrete store honors.
///
/// Stores are constructed once at process start and injected into whatever
/// owns the state tree; they are used concretely, never as trait objects.
#[expect(
    async_fn_in_trait,
    reason = "stores are used concretely, never spawned or boxed"
)]
pub trait StateStore {
    /// Whether the environment provides the persistence capability. Probed
    /// once at construction, fixed for the life of the instance.
    fn is_supported(&self) -> bool;

    fn health(&self) -> StoreHealth;

    /// The last metadata passed to [`Self::set_metadata`], if any. No
    /// validation happens here; concrete stores validate at `set`-time.
    fn metadata(&self) -> Option<StateMetadata>;

    fn set_metadata(&self, meta: StateMetadata);

    /// The most recent successfully retrieved record, or `None` if the last
    /// read found nothing (or nothing has been read yet).
    fn most_recent_retrieved_state(&self) -> Option<PersistedState>;

    fn migrator(&self) -> &Migrator;

    /// The deterministic state tree used for fresh installs and as the base
    /// of every recovery fallback.
    fn generate_first_time_state(&self) -> PersistedState {
        self.migrator().generate_initial_state(first_time_seed())
    }

    /// Persist the controller-state map together with the current metadata.
    ///
    /// Errors only on failed preconditions (unsupported environment, missing
    /// state, metadata never set); backend failures are absorbed and show up
    /// in the returned [`PersistOutcome`] and in [`Self::health`].
    async fn set(&self, state: Value) -> eyre::Result<PersistOutcome>;

    /// Retrieve the state tree. Infallible: degraded stores return a fallback
    /// tree rather than erroring, so boot never blocks on storage.
    async fn get(&self) -> PersistedState;

    /// Whether nothing has ever been persisted for this install. Must not
    /// mutate [`Self::most_recent_retrieved_state`].
    async fn is_first_time_install(&self) -> eyre::Result<bool>;
}
