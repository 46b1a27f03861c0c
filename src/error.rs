use thiserror::Error;

/// The photo index could not be opened or read.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Access was revoked or the backing store went away.
    #[error("photo index unavailable: {0}")]
    Unavailable(String),

    /// A cursor was asked to seek past its last row.
    #[error("seek to row {row} beyond {rows} rows")]
    SeekOutOfRange { row: usize, rows: usize },
}

/// Failure to turn a locator into a raster. Always absorbed per item.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("image dimensions are zero")]
    ZeroDimensions,

    #[error("failed to resize image: {0}")]
    Resize(String),

    #[error("decode task aborted: {0}")]
    Aborted(String),
}

/// Detection backend could not be brought up.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load detection model {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("hardware delegate {0} is not supported by this backend")]
    UnsupportedDelegate(&'static str),
}

/// A single detection call failed.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detect called while the engine is not in image mode")]
    WrongRunningMode,

    #[error("detection backend failed: {0:#}")]
    Backend(anyhow::Error),
}

/// Fatal-to-scan failure surfaced from the outcome stream.
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("scan worker failed: {0}")]
    Worker(String),
}
