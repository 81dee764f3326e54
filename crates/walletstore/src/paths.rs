use directories::ProjectDirs;
use eyre::ContextCompat as _;
use std::path::PathBuf;

/// On-disk layout for a store instance: one private data directory holding
/// the primary record, the resilience markers, and the process lock.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub data_dir: PathBuf,
}

impl StorePaths {
    /// Resolve the platform data directory, honoring the `WALLETSTORE_DATA_DIR`
    /// override used by tests and CI.
    pub fn discover() -> eyre::Result<Self> {
        if let Ok(dir) = std::env::var("WALLETSTORE_DATA_DIR") {
            if !dir.trim().is_empty() {
                return Ok(Self {
                    data_dir: PathBuf::from(dir),
                });
            }
        }

        let proj =
            ProjectDirs::from("", "", "walletstore").context("failed to resolve project dirs")?;
        Ok(Self {
            data_dir: proj.data_dir().to_path_buf(),
        })
    }

    pub const fn at(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// The primary persisted record.
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    /// The independent resilience-marker surface. Deliberately a separate
    /// file from the primary record so vault material survives primary-store
    /// corruption.
    pub fn markers_file(&self) -> PathBuf {
        self.data_dir.join("recovery_markers.json")
    }

    /// Advisory lock guarding the data directory against a second process.
    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join("walletstore.lock")
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_private_dir(&self.data_dir)
    }
}
