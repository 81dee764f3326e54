//! In-memory backends with failure injection, for unit tests and embedder
//! test harnesses.

use crate::{
    backend::{PrimaryStateStore, ResilienceMarkerStore},
    state::PersistedState,
};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex, PoisonError,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct MemoryStateBackend {
    record: Mutex<PersistedState>,
    available: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_attempts: AtomicUsize,
}

impl Default for MemoryStateBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self {
            record: Mutex::new(PersistedState::empty()),
            available: AtomicBool::new(true),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            write_attempts: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        let backend = Self::new();
        backend.available.store(false, Ordering::SeqCst);
        backend
    }

    /// Seed the backend with an existing record.
    pub fn with_record(record: PersistedState) -> Self {
        let backend = Self::new();
        *lock(&backend.record) = record;
        backend
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `write` calls that reached this backend, including injected
    /// failures. Suppressed writes never count.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> PersistedState {
        lock(&self.record).clone()
    }
}

impl PrimaryStateStore for MemoryStateBackend {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn read(&self) -> eyre::Result<PersistedState> {
        if self.fail_reads.load(Ordering::SeqCst) {
            eyre::bail!("injected read failure");
        }
        Ok(lock(&self.record).clone())
    }

    async fn write(&self, record: &PersistedState) -> eyre::Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            eyre::bail!("injected write failure");
        }
        *lock(&self.record) = record.clone();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryMarkers {
    state_existed: bool,
    restore_on_next_load: bool,
    cached_vault: Option<String>,
}

#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
    inner: Mutex<MemoryMarkers>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state_existed() -> Self {
        let markers = Self::new();
        lock(&markers.inner).state_existed = true;
        markers
    }
}

impl ResilienceMarkerStore for MemoryMarkerStore {
    fn has_state_existed(&self) -> bool {
        lock(&self.inner).state_existed
    }

    fn record_state_existence(&self) -> eyre::Result<()> {
        lock(&self.inner).state_existed = true;
        Ok(())
    }

    fn has_user_opted_into_restore(&self) -> bool {
        lock(&self.inner).restore_on_next_load
    }

    fn set_user_opted_into_restore(&self, opted: bool) -> eyre::Result<()> {
        lock(&self.inner).restore_on_next_load = opted;
        Ok(())
    }

    fn cached_vault(&self) -> Option<String> {
        lock(&self.inner).cached_vault.clone()
    }

    fn cache_vault(&self, blob: &str) -> eyre::Result<()> {
        lock(&self.inner).cached_vault = Some(blob.to_owned());
        Ok(())
    }
}
