use crate::{
    errors::StorageError,
    migrator::Migrator,
    state::{PersistedState, StateMetadata},
    store::{PersistOutcome, StateStore, StoreHealth},
};
use serde_json::Value;
use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tracing::debug;

/// Port the fixture server listens on in test environments.
pub const FIXTURE_SERVER_PORT: u16 = 12345;

/// Bound on the one-shot initialization fetch.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
enum InitState {
    Uninitialized,
    /// Fetched (or overwritten via `set`); `None` means nothing persisted.
    Ready(Option<PersistedState>),
}

/// Fixture-backed store for test environments with no real persistent medium.
///
/// Fetches initial state once from a loopback endpoint; every fetch failure
/// (refused, timeout, non-2xx, bad body) is simply "nothing persisted yet" —
/// there is no medium here to corrupt. `set` overwrites the in-memory record
/// only; nothing is written back to the network, so each test run starts from
/// the fixture again.
pub struct ReadOnlyNetworkStore {
    client: reqwest::Client,
    url: String,
    fetch_timeout: Duration,
    migrator: Migrator,
    metadata: Mutex<Option<StateMetadata>>,
    most_recent: Mutex<Option<PersistedState>>,
    record: tokio::sync::Mutex<InitState>,
}

impl ReadOnlyNetworkStore {
    pub fn new(migrator: Migrator) -> Self {
        Self::with_endpoint(
            format!("http://localhost:{FIXTURE_SERVER_PORT}/state.json"),
            FETCH_TIMEOUT,
            migrator,
        )
    }

    pub fn with_endpoint(url: String, fetch_timeout: Duration, migrator: Migrator) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            fetch_timeout,
            migrator,
            metadata: Mutex::new(None),
            most_recent: Mutex::new(None),
            record: tokio::sync::Mutex::new(InitState::Uninitialized),
        }
    }

    async fn fetch_initial_state(&self) -> Option<PersistedState> {
        let fetch = async {
            self.client
                .get(&self.url)
                .send()
                .await?
                .error_for_status()?
                .json::<PersistedState>()
                .await
        };
        match tokio::time::timeout(self.fetch_timeout, fetch).await {
            Ok(Ok(record)) if !record.is_empty() => Some(record),
            Ok(Ok(_)) => {
                debug!(url = %self.url, "fixture returned the empty sentinel");
                None
            }
            Ok(Err(e)) => {
                debug!(url = %self.url, error = %e, "fixture fetch failed");
                None
            }
            Err(_) => {
                debug!(url = %self.url, "fixture fetch timed out");
                None
            }
        }
    }

    /// One-shot initialization: the first caller fetches, everyone after
    /// observes the already-resolved result. Never re-fetches.
    async fn ensure_init(&self) -> tokio::sync::MutexGuard<'_, InitState> {
        let mut guard = self.record.lock().await;
        if matches!(*guard, InitState::Uninitialized) {
            *guard = InitState::Ready(self.fetch_initial_state().await);
        }
        guard
    }
}

impl StateStore for ReadOnlyNetworkStore {
    fn is_supported(&self) -> bool {
        true
    }

    fn health(&self) -> StoreHealth {
        StoreHealth::Healthy
    }

    fn metadata(&self) -> Option<StateMetadata> {
        *lock(&self.metadata)
    }

    fn set_metadata(&self, meta: StateMetadata) {
        *lock(&self.metadata) = Some(meta);
    }

    fn most_recent_retrieved_state(&self) -> Option<PersistedState> {
        lock(&self.most_recent).clone()
    }

    fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    async fn set(&self, state: Value) -> eyre::Result<PersistOutcome> {
        let mut guard = self.ensure_init().await;

        if state.is_null() || state.as_object().is_some_and(serde_json::Map::is_empty) {
            return Err(StorageError::MissingState.into());
        }
        let meta = self.metadata().ok_or(StorageError::MetadataNotSet)?;

        *guard = InitState::Ready(Some(PersistedState::new(state, meta)));
        Ok(PersistOutcome::Written)
    }

    async fn get(&self) -> PersistedState {
        let guard = self.ensure_init().await;
        match &*guard {
            InitState::Ready(Some(record)) => {
                let mut most_recent = lock(&self.most_recent);
                if most_recent.is_none() {
                    // Lazily on first successful read, matching the timing of
                    // the persistent store.
                    *most_recent = Some(record.clone());
                }
                record.clone()
            }
            InitState::Ready(None) | InitState::Uninitialized => self.generate_first_time_state(),
        }
    }

    async fn is_first_time_install(&self) -> eyre::Result<bool> {
        let guard = self.ensure_init().await;
        Ok(matches!(*guard, InitState::Ready(None)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrator::first_time_seed;
    use eyre::ContextCompat as _;
    use serde_json::json;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    /// Unroutable-enough endpoint: connections to the discard port are
    /// refused on CI hosts, and the short timeout bounds the slow case.
    fn dead_store() -> ReadOnlyNetworkStore {
        ReadOnlyNetworkStore::with_endpoint(
            "http://127.0.0.1:9/state.json".to_owned(),
            Duration::from_millis(250),
            Migrator::default(),
        )
    }

    /// Serve `record` once over plain HTTP/1.1 and return the endpoint URL.
    async fn serve_once(record: PersistedState) -> eyre::Result<String> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let body = match serde_json::to_string(&record) {
                Ok(b) => b,
                Err(_) => return,
            };
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0_u8; 1024];
                drop(sock.read(&mut buf).await);
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len(),
                );
                drop(sock.write_all(resp.as_bytes()).await);
                drop(sock.shutdown().await);
            }
        });
        Ok(format!("http://{addr}/state.json"))
    }

    #[tokio::test]
    async fn fetch_failure_is_treated_as_nothing_persisted() -> eyre::Result<()> {
        let store = dead_store();
        assert!(store.is_first_time_install().await?);
        let got = store.get().await;
        assert_eq!(
            got,
            Migrator::default().generate_initial_state(first_time_seed())
        );
        assert_eq!(store.most_recent_retrieved_state(), None);
        assert_eq!(store.health(), StoreHealth::Healthy);
        Ok(())
    }

    #[tokio::test]
    async fn fixture_state_is_fetched_once_and_cached() -> eyre::Result<()> {
        let record = PersistedState::new(json!({"app_state": {"foo": 1}}), StateMetadata::new(4));
        let url = serve_once(record.clone()).await?;
        let store =
            ReadOnlyNetworkStore::with_endpoint(url, Duration::from_secs(2), Migrator::default());

        assert!(!store.is_first_time_install().await?);
        assert_eq!(store.get().await, record);
        assert_eq!(store.most_recent_retrieved_state(), Some(record.clone()));
        // The server only answers once; a second get must hit the cache.
        assert_eq!(store.get().await, record);
        Ok(())
    }

    #[tokio::test]
    async fn set_preconditions_match_the_persistent_store() -> eyre::Result<()> {
        let store = dead_store();

        let err = store
            .set(json!({"a": 1}))
            .await
            .err()
            .context("set before metadata must fail")?;
        assert_eq!(err.downcast::<StorageError>()?, StorageError::MetadataNotSet);

        store.set_metadata(StateMetadata::new(2));
        for bad in [Value::Null, json!({})] {
            let err = store
                .set(bad)
                .await
                .err()
                .context("missing state must be rejected")?;
            assert_eq!(err.downcast::<StorageError>()?, StorageError::MissingState);
        }
        Ok(())
    }

    #[tokio::test]
    async fn set_overwrites_the_in_memory_record_only() -> eyre::Result<()> {
        let store = dead_store();
        store.set_metadata(StateMetadata::new(2));

        assert_eq!(
            store.set(json!({"app_state": {"x": true}})).await?,
            PersistOutcome::Written
        );
        let got = store.get().await;
        assert_eq!(got.data, Some(json!({"app_state": {"x": true}})));
        assert_eq!(got.meta, Some(StateMetadata::new(2)));
        // Seeded in memory now, so no longer a first-time install.
        assert!(!store.is_first_time_install().await?);
        Ok(())
    }
}
