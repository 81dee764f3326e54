use crate::{
    backend::{PrimaryStateStore, ResilienceMarkerStore},
    fsutil,
    paths::StorePaths,
    state::PersistedState,
};
use eyre::Context as _;
use fs2::FileExt as _;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File, OpenOptions},
    path::PathBuf,
    sync::Mutex,
};
use tracing::warn;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt as _;

/// Primary record as a single JSON file, written atomically and guarded by an
/// advisory lock so two wallet processes cannot interleave writes.
#[derive(Debug)]
pub struct FileStateBackend {
    path: PathBuf,
    /// Held for the life of the backend; `None` means the probe failed and
    /// the backend reports itself unavailable.
    lock: Option<File>,
}

fn acquire_lock(paths: &StorePaths) -> eyre::Result<File> {
    paths.ensure_private_dirs()?;
    let lock_path = paths.lock_file();
    let mut oo = OpenOptions::new();
    oo.create(true).write(true).truncate(false);
    #[cfg(unix)]
    {
        oo.mode(fsutil::MODE_FILE_PRIVATE);
    }
    let f = oo
        .open(&lock_path)
        .with_context(|| format!("open lock {}", lock_path.display()))?;
    f.try_lock_exclusive()
        .with_context(|| format!("lock {}", lock_path.display()))?;
    Ok(f)
}

impl FileStateBackend {
    /// Probe the environment once: create the data directory and take the
    /// process lock. A failed probe yields an *unavailable* backend, not an
    /// error, mirroring the capability-detection lifecycle of the stores.
    pub fn open(paths: &StorePaths) -> Self {
        let lock = match acquire_lock(paths) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(error = %e, "persistent storage unavailable");
                None
            }
        };
        Self {
            path: paths.state_file(),
            lock,
        }
    }
}

impl PrimaryStateStore for FileStateBackend {
    fn is_available(&self) -> bool {
        self.lock.is_some()
    }

    async fn read(&self) -> eyre::Result<PersistedState> {
        if !self.path.exists() {
            return Ok(PersistedState::empty());
        }
        let s = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let record: PersistedState =
            serde_json::from_str(&s).with_context(|| format!("parse {}", self.path.display()))?;
        Ok(record)
    }

    async fn write(&self, record: &PersistedState) -> eyre::Result<()> {
        let bytes = serde_json::to_vec(record).context("serialize state record")?;
        fsutil::write_private_atomic(&self.path, &bytes)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Markers {
    #[serde(default)]
    state_existed: bool,
    #[serde(default)]
    restore_on_next_load: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cached_vault: Option<String>,
}

/// Resilience markers as a small JSON file, independent of the primary
/// record. Reads are best-effort: a missing or unreadable marker file reads
/// as defaults, never as a boot failure.
#[derive(Debug)]
pub struct FileMarkerStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_guard: Mutex<()>,
}

impl FileMarkerStore {
    pub fn open(paths: &StorePaths) -> Self {
        Self {
            path: paths.markers_file(),
            write_guard: Mutex::new(()),
        }
    }

    fn load(&self) -> Markers {
        if !self.path.exists() {
            return Markers::default();
        }
        match fs::read_to_string(&self.path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                warn!(error = %e, path = %self.path.display(), "unreadable marker file; using defaults");
                Markers::default()
            }),
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "failed to read marker file; using defaults");
                Markers::default()
            }
        }
    }

    fn update(&self, apply: impl FnOnce(&mut Markers)) -> eyre::Result<()> {
        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut markers = self.load();
        apply(&mut markers);
        let bytes = serde_json::to_vec(&markers).context("serialize markers")?;
        fsutil::write_private_atomic(&self.path, &bytes)
    }
}

impl ResilienceMarkerStore for FileMarkerStore {
    fn has_state_existed(&self) -> bool {
        self.load().state_existed
    }

    fn record_state_existence(&self) -> eyre::Result<()> {
        self.update(|m| m.state_existed = true)
    }

    fn has_user_opted_into_restore(&self) -> bool {
        self.load().restore_on_next_load
    }

    fn set_user_opted_into_restore(&self, opted: bool) -> eyre::Result<()> {
        self.update(|m| m.restore_on_next_load = opted)
    }

    fn cached_vault(&self) -> Option<String> {
        self.load().cached_vault
    }

    fn cache_vault(&self, blob: &str) -> eyre::Result<()> {
        self.update(|m| m.cached_vault = Some(blob.to_owned()))
    }
}
