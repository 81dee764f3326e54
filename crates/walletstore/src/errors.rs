use thiserror::Error;

/// Precondition and capability errors surfaced by the stores.
///
/// Transient backend failures are deliberately *not* represented here: failed
/// writes are absorbed and reported out-of-band (see `PersistOutcome`), and
/// reads degrade to a usable fallback tree instead of erroring.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("persistent storage is not supported in this environment")]
    Unsupported,

    #[error("state is missing")]
    MissingState,

    #[error("metadata is not set")]
    MetadataNotSet,
}
