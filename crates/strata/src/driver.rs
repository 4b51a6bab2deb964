//! Backend driver contract and per-OS dispatch.
//!
//! A [`Driver`] owns the physical on-disk representation of layers: it
//! creates and removes private per-layer state, applies and (optionally)
//! reproduces diff streams, and mounts writable layers at real paths. The
//! layer store never touches layer content except through this contract.
//!
//! Each unit of driver state is addressed by an opaque id that the store
//! generates randomly at registration time; the id is a pure handle and
//! never derived from content. Every opaque id is exclusively owned by
//! exactly one read-only layer or one mount at a time.
//!
//! # Exact-diff capability
//!
//! Some backends can reproduce the exact byte stream that was applied to a
//! layer ([`Driver::exact_diff`] returns `true` and [`Driver::diff`] works).
//! Others normalize or reorder their on-disk representation, making a
//! literal re-diff non-deterministic; for those, the store records a
//! tar-split structural index at registration time and reassembles diffs
//! from it, reading individual file contents back through
//! [`Driver::file_reader`]. The capability is queried once, when the driver
//! is registered, and cached in the [`DriverRegistry`].

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// Error type for backend driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// I/O error inside the backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The driver does not support the requested operation.
    #[error("unsupported driver operation: {0}")]
    Unsupported(&'static str),

    /// Any other backend failure.
    #[error("{0}")]
    Backend(String),
}

/// The backend storage contract consumed by the layer store.
///
/// Implementations must be safe for concurrent use; the store invokes
/// driver operations outside of its index locks wherever the ordering
/// guarantees permit.
pub trait Driver: Send + Sync {
    /// Short identifier for diagnostics (e.g. `"overlay"`).
    fn name(&self) -> &str;

    /// Whether [`Driver::diff`] reproduces the applied stream byte for byte.
    fn exact_diff(&self) -> bool;

    /// Create private on-disk state for `id`, stacked on `parent` if given.
    fn create(&self, id: &str, parent: Option<&str>) -> Result<(), DriverError>;

    /// Remove the on-disk state for `id`.
    ///
    /// Removing an id that does not exist must succeed as a no-op, so that a
    /// release retried after a partial failure converges.
    fn remove(&self, id: &str) -> Result<(), DriverError>;

    /// Apply an uncompressed tar diff stream to `id`. Returns the number of
    /// bytes the backend consumed; the store measures the authoritative
    /// layer size itself while draining the stream.
    fn apply_diff(
        &self,
        id: &str,
        parent: Option<&str>,
        diff: &mut dyn Read,
    ) -> Result<u64, DriverError>;

    /// Produce the diff of `id` against `parent`.
    ///
    /// Only meaningful for exact-diff capable drivers; others keep the
    /// default, which reports the operation as unsupported.
    fn diff(&self, _id: &str, _parent: Option<&str>) -> Result<Box<dyn Read + Send>, DriverError> {
        Err(DriverError::Unsupported(
            "driver cannot reproduce diff streams",
        ))
    }

    /// Size in bytes of the content of `id` relative to `parent`.
    fn diff_size(&self, id: &str, parent: Option<&str>) -> Result<u64, DriverError>;

    /// Mount the layer `id` read-write and return the mount point.
    fn mount(&self, id: &str, label: &str) -> Result<PathBuf, DriverError>;

    /// Unmount the layer `id`.
    fn unmount(&self, id: &str) -> Result<(), DriverError>;

    /// Open a single file inside the private state of `id`, by path relative
    /// to the layer root. Used to splice live content into reassembled
    /// diffs for drivers without the exact-diff capability.
    fn file_reader(&self, id: &str, path: &str) -> Result<Box<dyn Read + Send>, DriverError>;

    /// Diagnostic key/value pairs describing the backend.
    fn status(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

struct DriverEntry {
    driver: Arc<dyn Driver>,
    exact_diff: bool,
}

/// Capability-keyed table of backend drivers, one per OS tag.
///
/// The store holds one driver per supported OS and dispatches every
/// operation by the owning layer's OS tag. The exact-diff capability is
/// resolved once at insertion time rather than re-queried per operation.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, DriverEntry>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` for `os`, replacing any previous driver for that
    /// tag, and cache its exact-diff capability.
    pub fn insert(&mut self, os: impl Into<String>, driver: Arc<dyn Driver>) {
        let exact_diff = driver.exact_diff();
        self.drivers
            .insert(os.into(), DriverEntry { driver, exact_diff });
    }

    /// Whether a driver is registered for `os`.
    pub fn contains(&self, os: &str) -> bool {
        self.drivers.contains_key(os)
    }

    /// The driver for `os`, if registered.
    pub fn driver(&self, os: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(os).map(|e| e.driver.clone())
    }

    /// The cached exact-diff capability of the driver for `os`.
    pub fn exact_diff(&self, os: &str) -> Option<bool> {
        self.drivers.get(os).map(|e| e.exact_diff)
    }
}
