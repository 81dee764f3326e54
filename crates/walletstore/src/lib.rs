//! Resilient wallet state persistence.
//!
//! The wallet's entire controller-state tree is persisted as one versioned
//! record and read back at boot. This crate owns that boundary: the
//! [`store::StateStore`] contract, a [`persistent::PersistentStore`] backed
//! by the local medium with corruption detection and vault-backup recovery,
//! and a [`network::ReadOnlyNetworkStore`] that seeds deterministic state
//! from a fixture endpoint in test environments.
//!
//! Design rule throughout: reads never fail. A store that cannot produce the
//! real tree produces a usable fallback, and degradation is surfaced through
//! [`store::StoreHealth`], [`store::PersistOutcome`], and the injected
//! [`report::ErrorReporter`] rather than through boot-blocking errors.

pub mod backend;
pub mod errors;
pub mod fsutil;
pub mod migrator;
pub mod network;
pub mod paths;
pub mod persistent;
pub mod report;
pub mod state;
pub mod store;

pub use errors::StorageError;
pub use migrator::{Migration, Migrator};
pub use network::ReadOnlyNetworkStore;
pub use persistent::PersistentStore;
pub use report::{ErrorReporter, TracingReporter};
pub use state::{PersistedState, StateMetadata};
pub use store::{PersistOutcome, StateStore, StoreHealth};
