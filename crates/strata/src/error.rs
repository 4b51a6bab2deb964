//! Error types for the strata library.
//!
//! All fallible operations return a [`Result<T>`], an alias for
//! `Result<T, StorageError>`.
//!
//! # Error Categories
//!
//! - **Layer errors**: [`LayerNotFound`], [`LayerNotRetained`],
//!   [`MaxDepthExceeded`]
//! - **Mount errors**: [`MountNotFound`], [`MountNameConflict`]
//! - **Platform errors**: [`InvalidPlatform`]
//! - **Collaborator errors**: [`Driver`], [`Metadata`]
//! - **Diff reconstruction**: [`TarSplit`]
//!
//! [`LayerNotFound`]: StorageError::LayerNotFound
//! [`LayerNotRetained`]: StorageError::LayerNotRetained
//! [`MaxDepthExceeded`]: StorageError::MaxDepthExceeded
//! [`MountNotFound`]: StorageError::MountNotFound
//! [`MountNameConflict`]: StorageError::MountNameConflict
//! [`InvalidPlatform`]: StorageError::InvalidPlatform
//! [`Driver`]: StorageError::Driver
//! [`Metadata`]: StorageError::Metadata
//! [`TarSplit`]: StorageError::TarSplit
//!
//! Backend and metadata failures that occur partway through a compound
//! operation (register, mount creation) are surfaced after best-effort
//! compensating cleanup of whatever was partially created; a cleanup failure
//! is logged and the original error is still the one returned. Invariant
//! violations in the in-memory graph (releasing a layer whose reference
//! count is already zero, removing a layer that still has children) are not
//! representable here: they panic, because they mean the graph has diverged
//! from reality and must not be papered over.

use crate::driver::DriverError;
use crate::metadata::MetadataError;

/// Result type alias for operations that may return a [`StorageError`].
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error types for layer store operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested chain id is not registered.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// A release was attempted with a handle that does not correspond to a
    /// retained layer.
    #[error("layer not retained: {0}")]
    LayerNotRetained(String),

    /// Registering the layer would exceed the backend's stacking limit.
    #[error("max depth exceeded: layer chains are limited to {0} ancestors")]
    MaxDepthExceeded(usize),

    /// No mount is registered under the given name.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// A mount with the given name already exists.
    #[error("mount name conflict: {0}")]
    MountNameConflict(String),

    /// The OS tag is unsupported, or conflicts with the parent layer's tag,
    /// or has no registered backend driver.
    #[error("invalid platform: {0}")]
    InvalidPlatform(String),

    /// A backend driver operation failed.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// A metadata store operation failed.
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// The tar-split structural index is missing or malformed.
    #[error("tar-split error: {0}")]
    TarSplit(String),

    /// I/O error while streaming a diff.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
