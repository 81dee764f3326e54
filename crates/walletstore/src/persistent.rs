use crate::{
    backend::{
        file::{FileMarkerStore, FileStateBackend},
        PrimaryStateStore, ResilienceMarkerStore,
    },
    errors::StorageError,
    migrator::Migrator,
    paths::StorePaths,
    report::{ErrorReporter, TracingReporter},
    state::{
        PersistedState, StateMetadata, COMPLETED_ONBOARDING_KEY, CORRUPTION_PROMPT_KEY,
        KEYRING_SLOT, ONBOARDING_SLOT, RESTORED_FROM_BACKUP_KEY, UI_SLOT, VAULT_KEY,
    },
    store::{PersistOutcome, StateStore, StoreHealth},
};
use serde_json::{json, Value};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct OpState {
    health: StoreHealth,
    most_recent: Option<PersistedState>,
}

/// Store backed by the local persistent medium. Owns corruption detection and
/// the recovery-fallback path.
///
/// `get` never fails: a store that cannot produce the real state tree
/// produces a usable fallback instead, so wallet boot is never blocked on
/// storage. The price is that `set` can quietly drop or suppress a write;
/// both cases are visible in the returned [`PersistOutcome`] and in
/// [`StateStore::health`].
pub struct PersistentStore<P, M, R = TracingReporter> {
    backend: P,
    markers: M,
    reporter: R,
    migrator: Migrator,
    supported: bool,
    metadata: Mutex<Option<StateMetadata>>,
    state: Mutex<OpState>,
    // Serializes get/set so interleaved operations cannot observe (or leave
    // behind) half-applied health transitions.
    op_gate: tokio::sync::Mutex<()>,
}

impl<P, M> PersistentStore<P, M, TracingReporter>
where
    P: PrimaryStateStore,
    M: ResilienceMarkerStore,
{
    pub fn new(backend: P, markers: M, migrator: Migrator) -> Self {
        Self::with_reporter(backend, markers, migrator, TracingReporter)
    }
}

impl PersistentStore<FileStateBackend, FileMarkerStore, TracingReporter> {
    /// Open the on-disk store rooted at `paths`.
    pub fn open(paths: &StorePaths, migrator: Migrator) -> Self {
        Self::new(
            FileStateBackend::open(paths),
            FileMarkerStore::open(paths),
            migrator,
        )
    }
}

impl<P, M, R> PersistentStore<P, M, R>
where
    P: PrimaryStateStore,
    M: ResilienceMarkerStore,
    R: ErrorReporter,
{
    pub fn with_reporter(backend: P, markers: M, migrator: Migrator, reporter: R) -> Self {
        let supported = backend.is_available();
        Self {
            backend,
            markers,
            reporter,
            migrator,
            supported,
            metadata: Mutex::new(None),
            state: Mutex::new(OpState {
                health: StoreHealth::Healthy,
                most_recent: None,
            }),
            op_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &P {
        &self.backend
    }

    /// The resilience-marker surface, exposed so the embedder can cache the
    /// vault on unlock and record the user's restore decision.
    pub fn markers(&self) -> &M {
        &self.markers
    }

    fn set_health(&self, health: StoreHealth) {
        lock(&self.state).health = health;
    }

    fn set_most_recent(&self, record: Option<PersistedState>) {
        lock(&self.state).most_recent = record;
    }

    /// Build the state tree returned when the primary record is corrupted.
    ///
    /// Always starts from first-time state. The cached vault lives in the
    /// marker store, a medium independent of the primary record, precisely so
    /// it survives when the primary record is the thing that broke.
    fn corrupted_fallback(&self) -> PersistedState {
        let mut fallback = self.generate_first_time_state();

        if !self.markers.has_user_opted_into_restore() {
            // No decision from the user yet: keep blocking writes, surface a
            // recovery prompt through the returned tree, and report.
            fallback.insert_into_slot(UI_SLOT, CORRUPTION_PROMPT_KEY, json!(true));
            self.reporter
                .capture_message("wallet state corrupted and unrecoverable without user opt-in");
            return fallback;
        }

        if let Some(blob) = self.markers.cached_vault() {
            match serde_json::from_str::<Value>(&blob) {
                Ok(vault) => {
                    fallback.insert_into_slot(KEYRING_SLOT, VAULT_KEY, vault);
                    fallback.insert_into_slot(KEYRING_SLOT, RESTORED_FROM_BACKUP_KEY, json!(true));
                    // The restored user already onboarded once; without this
                    // they would unlock straight into the onboarding flow.
                    fallback.insert_into_slot(ONBOARDING_SLOT, COMPLETED_ONBOARDING_KEY, json!(true));
                }
                Err(e) => {
                    warn!(error = %e, "cached vault unreadable; resetting to first-time state");
                }
            }
        } else {
            warn!("restore requested but no cached vault; resetting to first-time state");
        }

        // The opt-in is one-shot, and recovery (or the silent reset) makes
        // the store writable again.
        if let Err(e) = self.markers.set_user_opted_into_restore(false) {
            warn!(error = %e, "failed to clear restore opt-in");
        }
        self.set_health(StoreHealth::Healthy);
        fallback
    }
}

impl<P, M, R> StateStore for PersistentStore<P, M, R>
where
    P: PrimaryStateStore,
    M: ResilienceMarkerStore,
    R: ErrorReporter,
{
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn health(&self) -> StoreHealth {
        lock(&self.state).health
    }

    fn metadata(&self) -> Option<StateMetadata> {
        *lock(&self.metadata)
    }

    fn set_metadata(&self, meta: StateMetadata) {
        *lock(&self.metadata) = Some(meta);
    }

    fn most_recent_retrieved_state(&self) -> Option<PersistedState> {
        lock(&self.state).most_recent.clone()
    }

    fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    async fn set(&self, state: Value) -> eyre::Result<PersistOutcome> {
        let _gate = self.op_gate.lock().await;

        if !self.supported {
            return Err(StorageError::Unsupported.into());
        }
        if state.is_null() || state.as_object().is_some_and(serde_json::Map::is_empty) {
            return Err(StorageError::MissingState.into());
        }
        let meta = self.metadata().ok_or(StorageError::MetadataNotSet)?;

        if self.health() == StoreHealth::CorruptionDetected
            && !self.markers.has_user_opted_into_restore()
        {
            // An unresolved corruption must not be papered over with a fresh
            // tree; drop writes until the user chooses recovery or reset.
            warn!("corruption unresolved; suppressing state write");
            return Ok(PersistOutcome::Suppressed);
        }

        let record = PersistedState::new(state, meta);
        match self.backend.write(&record).await {
            Ok(()) => {
                self.set_health(StoreHealth::Healthy);
                Ok(PersistOutcome::Written)
            }
            Err(e) => {
                // Report once per failure streak, not once per dropped write.
                if self.health() == StoreHealth::Healthy {
                    self.reporter.capture_error(&e);
                }
                if self.health() != StoreHealth::CorruptionDetected {
                    self.set_health(StoreHealth::WriteFailing);
                }
                warn!(error = %e, "state write failed; record dropped");
                Ok(PersistOutcome::Dropped)
            }
        }
    }

    async fn get(&self) -> PersistedState {
        let _gate = self.op_gate.lock().await;

        if !self.supported {
            return self.generate_first_time_state();
        }

        match self.backend.read().await {
            Err(e) => {
                warn!(error = %e, "state read failed; treating as corrupted");
                self.set_health(StoreHealth::CorruptionDetected);
                self.corrupted_fallback()
            }
            Ok(record) if record.is_empty() => {
                self.set_most_recent(None);
                if self.markers.has_state_existed() {
                    warn!("state missing despite recorded existence; treating as corrupted");
                    self.set_health(StoreHealth::CorruptionDetected);
                    self.corrupted_fallback()
                } else {
                    // Fresh install: nothing was ever persisted here.
                    self.generate_first_time_state()
                }
            }
            Ok(record) => {
                if !self.markers.has_state_existed() {
                    if let Err(e) = self.markers.record_state_existence() {
                        warn!(error = %e, "failed to record state existence");
                    }
                }
                self.set_most_recent(Some(record.clone()));
                record
            }
        }
    }

    async fn is_first_time_install(&self) -> eyre::Result<bool> {
        let _gate = self.op_gate.lock().await;

        if !self.supported {
            return Ok(false);
        }
        // Raw read on purpose: this must not disturb most_recent_retrieved_state.
        let record = self.backend.read().await?;
        Ok(record.is_empty() && !self.markers.has_state_existed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryMarkerStore, MemoryStateBackend};
    use crate::migrator::first_time_seed;
    use eyre::ContextCompat as _;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct CountingReporter {
        errors: AtomicUsize,
        messages: AtomicUsize,
    }

    impl ErrorReporter for Arc<CountingReporter> {
        fn capture_error(&self, _error: &eyre::Report) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn capture_message(&self, _message: &str) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
    }

    type TestStore = PersistentStore<MemoryStateBackend, MemoryMarkerStore, Arc<CountingReporter>>;

    fn store_with(
        backend: MemoryStateBackend,
        markers: MemoryMarkerStore,
    ) -> (TestStore, Arc<CountingReporter>) {
        let reporter = Arc::new(CountingReporter::default());
        let store = PersistentStore::with_reporter(
            backend,
            markers,
            Migrator::default(),
            Arc::clone(&reporter),
        );
        (store, reporter)
    }

    fn healthy_store() -> (TestStore, Arc<CountingReporter>) {
        store_with(MemoryStateBackend::new(), MemoryMarkerStore::new())
    }

    fn sample_state() -> Value {
        json!({"app_state": {"foo": 1}})
    }

    #[tokio::test]
    async fn happy_path_round_trips_data_and_meta() -> eyre::Result<()> {
        let (store, _) = healthy_store();
        store.set_metadata(StateMetadata::new(42));

        let outcome = store.set(sample_state()).await?;
        assert_eq!(outcome, PersistOutcome::Written);

        let got = store.get().await;
        assert_eq!(got.data, Some(sample_state()));
        assert_eq!(got.meta, Some(StateMetadata::new(42)));
        assert_eq!(store.most_recent_retrieved_state(), Some(got));
        assert_eq!(store.health(), StoreHealth::Healthy);
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_store_fails_set_and_degrades_get() -> eyre::Result<()> {
        let (store, _) = store_with(MemoryStateBackend::unavailable(), MemoryMarkerStore::new());
        store.set_metadata(StateMetadata::new(1));

        for _ in 0_u8..2 {
            let err = store
                .set(sample_state())
                .await
                .err()
                .context("set must fail when unsupported")?;
            assert_eq!(err.downcast::<StorageError>()?, StorageError::Unsupported);
            assert_eq!(store.get().await, store.generate_first_time_state());
        }
        Ok(())
    }

    #[tokio::test]
    async fn null_and_empty_state_are_rejected_before_the_backend() -> eyre::Result<()> {
        let (store, _) = healthy_store();
        store.set_metadata(StateMetadata::new(1));

        for bad in [Value::Null, json!({})] {
            let err = store
                .set(bad)
                .await
                .err()
                .context("missing state must be rejected")?;
            assert_eq!(err.downcast::<StorageError>()?, StorageError::MissingState);
        }
        assert_eq!(store.backend().write_attempts(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn set_without_metadata_is_rejected() -> eyre::Result<()> {
        let (store, _) = healthy_store();
        let err = store
            .set(sample_state())
            .await
            .err()
            .context("set before metadata must fail")?;
        assert_eq!(err.downcast::<StorageError>()?, StorageError::MetadataNotSet);
        assert_eq!(store.backend().write_attempts(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn empty_read_without_existence_marker_is_a_fresh_install() -> eyre::Result<()> {
        let (store, _) = healthy_store();

        assert!(store.is_first_time_install().await?);
        let got = store.get().await;
        assert_eq!(
            got,
            Migrator::default().generate_initial_state(first_time_seed())
        );
        assert_eq!(store.health(), StoreHealth::Healthy);
        assert_eq!(store.most_recent_retrieved_state(), None);
        Ok(())
    }

    #[tokio::test]
    async fn normal_boot_returns_record_verbatim_and_records_existence() -> eyre::Result<()> {
        let record = PersistedState::new(json!({"app_state": {"foo": 1}}), StateMetadata::new(9));
        let (store, _) = store_with(
            MemoryStateBackend::with_record(record.clone()),
            MemoryMarkerStore::new(),
        );

        assert!(!store.is_first_time_install().await.unwrap_or(true));
        let got = store.get().await;
        assert_eq!(got, record);
        assert_eq!(store.most_recent_retrieved_state(), Some(record));
        assert!(store.markers().has_state_existed());
        Ok(())
    }

    #[tokio::test]
    async fn empty_read_with_existence_marker_flags_corruption() -> eyre::Result<()> {
        let (store, reporter) = store_with(
            MemoryStateBackend::new(),
            MemoryMarkerStore::with_state_existed(),
        );

        let got = store.get().await;
        assert_eq!(store.health(), StoreHealth::CorruptionDetected);
        assert_eq!(
            got.slot_value(UI_SLOT, CORRUPTION_PROMPT_KEY),
            Some(&json!(true))
        );
        assert_eq!(reporter.messages.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn read_failure_flags_corruption() {
        let backend = MemoryStateBackend::new();
        backend.set_fail_reads(true);
        let (store, _) = store_with(backend, MemoryMarkerStore::new());

        let got = store.get().await;
        assert_eq!(store.health(), StoreHealth::CorruptionDetected);
        assert_eq!(
            got.slot_value(UI_SLOT, CORRUPTION_PROMPT_KEY),
            Some(&json!(true))
        );
    }

    #[tokio::test]
    async fn corruption_without_opt_in_suppresses_writes() -> eyre::Result<()> {
        let (store, _) = store_with(
            MemoryStateBackend::new(),
            MemoryMarkerStore::with_state_existed(),
        );
        store.set_metadata(StateMetadata::new(3));

        drop(store.get().await);
        assert_eq!(store.health(), StoreHealth::CorruptionDetected);

        let outcome = store.set(sample_state()).await?;
        assert_eq!(outcome, PersistOutcome::Suppressed);
        assert_eq!(store.backend().write_attempts(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn opted_in_recovery_injects_vault_and_reopens_writes() -> eyre::Result<()> {
        let markers = MemoryMarkerStore::with_state_existed();
        markers.set_user_opted_into_restore(true)?;
        markers.cache_vault("{\"foo\":\"bar\"}")?;
        let (store, reporter) = store_with(MemoryStateBackend::new(), markers);
        store.set_metadata(StateMetadata::new(3));

        let got = store.get().await;
        assert_eq!(
            got.slot_value(KEYRING_SLOT, VAULT_KEY),
            Some(&json!({"foo": "bar"}))
        );
        assert_eq!(
            got.slot_value(KEYRING_SLOT, RESTORED_FROM_BACKUP_KEY),
            Some(&json!(true))
        );
        assert_eq!(
            got.slot_value(ONBOARDING_SLOT, COMPLETED_ONBOARDING_KEY),
            Some(&json!(true))
        );
        // Recovery is one-shot and unblocks persistence again.
        assert!(!store.markers().has_user_opted_into_restore());
        assert_eq!(store.health(), StoreHealth::Healthy);
        assert_eq!(reporter.messages.load(Ordering::SeqCst), 0);

        let outcome = store.set(sample_state()).await?;
        assert_eq!(outcome, PersistOutcome::Written);
        assert_eq!(store.backend().write_attempts(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn opted_in_recovery_without_vault_is_a_silent_reset() -> eyre::Result<()> {
        let markers = MemoryMarkerStore::with_state_existed();
        markers.set_user_opted_into_restore(true)?;
        let (store, _) = store_with(MemoryStateBackend::new(), markers);

        let got = store.get().await;
        assert_eq!(got.slot_value(KEYRING_SLOT, VAULT_KEY), None);
        assert_eq!(got.slot_value(UI_SLOT, CORRUPTION_PROMPT_KEY), None);
        assert_eq!(store.health(), StoreHealth::Healthy);
        assert!(!store.markers().has_user_opted_into_restore());
        Ok(())
    }

    #[tokio::test]
    async fn write_failures_report_once_per_streak_and_recover() -> eyre::Result<()> {
        let (store, reporter) = healthy_store();
        store.set_metadata(StateMetadata::new(1));
        store.backend().set_fail_writes(true);

        assert_eq!(store.set(sample_state()).await?, PersistOutcome::Dropped);
        assert_eq!(store.health(), StoreHealth::WriteFailing);
        assert_eq!(store.set(sample_state()).await?, PersistOutcome::Dropped);
        // Second drop in the same streak must not re-report.
        assert_eq!(reporter.errors.load(Ordering::SeqCst), 1);

        store.backend().set_fail_writes(false);
        assert_eq!(store.set(sample_state()).await?, PersistOutcome::Written);
        assert_eq!(store.health(), StoreHealth::Healthy);

        // A fresh streak reports again.
        store.backend().set_fail_writes(true);
        assert_eq!(store.set(sample_state()).await?, PersistOutcome::Dropped);
        assert_eq!(reporter.errors.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn is_first_time_install_does_not_touch_most_recent() -> eyre::Result<()> {
        let record = PersistedState::new(json!({"app_state": {}}), StateMetadata::new(1));
        let (store, _) = store_with(
            MemoryStateBackend::with_record(record.clone()),
            MemoryMarkerStore::new(),
        );

        let got = store.get().await;
        assert_eq!(got, record);
        assert!(!store.is_first_time_install().await?);
        assert_eq!(store.most_recent_retrieved_state(), Some(record));
        Ok(())
    }

    #[tokio::test]
    async fn is_first_time_install_propagates_read_errors() {
        let backend = MemoryStateBackend::new();
        backend.set_fail_reads(true);
        let (store, _) = store_with(backend, MemoryMarkerStore::new());
        assert!(store.is_first_time_install().await.is_err());
    }
}
