//! Durable layer and mount metadata.
//!
//! The layer store persists everything it needs to rebuild its in-memory
//! indexes through the narrow [`MetadataStore`] contract: per-layer records
//! written under a transaction that commits atomically against a chain id,
//! per-mount records written directly, point reads for each attribute, and
//! an enumeration used at startup.
//!
//! [`FsMetadataStore`] is the file-backed implementation. All file access
//! goes through cap-std [`Dir`] handles, so no operation can escape the
//! metadata root regardless of what appears in a chain id or mount name.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/
//! ├── layers/
//! │   ├── sha256/<hex>/          # one directory per committed chain id
//! │   │   ├── diff               # diff id
//! │   │   ├── parent             # parent chain id (absent for base layers)
//! │   │   ├── size               # decimal byte count
//! │   │   ├── cache-id           # opaque backend id
//! │   │   ├── os                 # OS tag
//! │   │   ├── created            # RFC3339 timestamp
//! │   │   ├── descriptor         # optional provenance JSON
//! │   │   └── tar-split.json.gz  # optional structural index
//! │   └── tmp/<token>/           # open transactions
//! └── mounts/<name>/
//!     ├── mount-id
//!     ├── init-id                # optional
//!     ├── parent                 # optional
//!     └── os
//! ```
//!
//! A transaction stages its record in `layers/tmp/<token>` and commits by
//! renaming the directory to its final `layers/sha256/<hex>` location, which
//! is atomic on POSIX filesystems. Transactions left behind by a crashed
//! process are swept the next time the store is opened.

use std::io::Read;
use std::path::Path;

use cap_std::ambient_authority;
use cap_std::fs::Dir;

use crate::digest::{ChainId, DiffId};
use crate::layer::{Provenance, generate_opaque_id};

/// Error type for metadata store operations.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// I/O error during metadata access.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted JSON record could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A persisted record could not be interpreted.
    #[error("corrupt metadata: {0}")]
    Corrupt(String),
}

type Result<T> = std::result::Result<T, MetadataError>;

/// An open per-layer write transaction.
///
/// Setters stage values; nothing becomes visible to reads or [`list`] until
/// [`commit`] succeeds. [`cancel`] discards the staged record.
///
/// [`list`]: MetadataStore::list
/// [`commit`]: MetadataTransaction::commit
/// [`cancel`]: MetadataTransaction::cancel
pub trait MetadataTransaction {
    /// Stage the layer's diff id.
    fn set_diff_id(&mut self, diff: &DiffId) -> Result<()>;

    /// Stage the layer's size in bytes.
    fn set_size(&mut self, size: u64) -> Result<()>;

    /// Stage the parent chain id.
    fn set_parent(&mut self, parent: &ChainId) -> Result<()>;

    /// Stage the opaque backend id.
    fn set_cache_id(&mut self, cache_id: &str) -> Result<()>;

    /// Stage the OS tag.
    fn set_os(&mut self, os: &str) -> Result<()>;

    /// Stage the distribution provenance descriptor.
    fn set_provenance(&mut self, provenance: &Provenance) -> Result<()>;

    /// Stage the tar-split structural index (already framed and compressed).
    fn set_tar_split_index(&mut self, index: &[u8]) -> Result<()>;

    /// Durably publish the staged record under `chain`.
    fn commit(self: Box<Self>, chain: &ChainId) -> Result<()>;

    /// Discard the staged record.
    fn cancel(self: Box<Self>) -> Result<()>;
}

/// The durable persistence contract consumed by the layer store.
pub trait MetadataStore: Send + Sync {
    /// Open a write transaction for a new layer record.
    fn begin(&self) -> Result<Box<dyn MetadataTransaction + '_>>;

    /// The layer's diff id.
    fn diff_id(&self, chain: &ChainId) -> Result<DiffId>;

    /// The layer's size in bytes.
    fn size(&self, chain: &ChainId) -> Result<u64>;

    /// The layer's parent chain id, if any.
    fn parent(&self, chain: &ChainId) -> Result<Option<ChainId>>;

    /// The layer's opaque backend id.
    fn cache_id(&self, chain: &ChainId) -> Result<String>;

    /// The layer's OS tag.
    fn os(&self, chain: &ChainId) -> Result<String>;

    /// The layer's provenance descriptor, if one was recorded.
    fn provenance(&self, chain: &ChainId) -> Result<Option<Provenance>>;

    /// A reader over the layer's tar-split index, if one was recorded.
    fn tar_split_reader(&self, chain: &ChainId) -> Result<Option<Box<dyn Read + Send>>>;

    /// Remove the layer record. Removing an absent record is a no-op.
    fn remove(&self, chain: &ChainId) -> Result<()>;

    /// Record a mount's opaque backend id.
    fn set_mount_id(&self, name: &str, id: &str) -> Result<()>;

    /// Record a mount's init-layer opaque id.
    fn set_init_id(&self, name: &str, id: &str) -> Result<()>;

    /// Record a mount's parent chain id.
    fn set_mount_parent(&self, name: &str, parent: &ChainId) -> Result<()>;

    /// Record a mount's OS tag.
    fn set_mount_os(&self, name: &str, os: &str) -> Result<()>;

    /// The mount's opaque backend id.
    fn mount_id(&self, name: &str) -> Result<String>;

    /// The mount's init-layer opaque id, if any.
    fn init_id(&self, name: &str) -> Result<Option<String>>;

    /// The mount's parent chain id, if any.
    fn mount_parent(&self, name: &str) -> Result<Option<ChainId>>;

    /// The mount's OS tag.
    fn mount_os(&self, name: &str) -> Result<String>;

    /// Remove the mount record. Removing an absent record is a no-op.
    fn remove_mount(&self, name: &str) -> Result<()>;

    /// All committed chain ids and all mount names, for startup rebuild.
    fn list(&self) -> Result<(Vec<ChainId>, Vec<String>)>;
}

/// File-backed metadata store rooted at a directory.
#[derive(Debug)]
pub struct FsMetadataStore {
    layers: Dir,
    mounts: Dir,
}

impl FsMetadataStore {
    /// Open (or initialize) a metadata store at `root`.
    ///
    /// Creates the directory layout if missing and sweeps any transaction
    /// directories left behind by a crashed process.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = Dir::open_ambient_dir(root.as_ref(), ambient_authority())?;
        root.create_dir_all("layers/sha256")?;
        root.create_dir_all("layers/tmp")?;
        root.create_dir_all("mounts")?;

        let layers = root.open_dir("layers")?;
        let mounts = root.open_dir("mounts")?;

        // Sweep stale transactions.
        let tmp = layers.open_dir("tmp")?;
        for entry in tmp.entries()? {
            let name = entry?.file_name();
            tracing::debug!(token = ?name, "sweeping stale metadata transaction");
            tmp.remove_dir_all(&name)?;
        }

        Ok(Self { layers, mounts })
    }

    fn layer_dir(&self, chain: &ChainId) -> Result<Dir> {
        Ok(self.layers.open_dir(format!("sha256/{}", chain.encoded()))?)
    }

    fn read_value(&self, chain: &ChainId, file: &str) -> Result<String> {
        let dir = self.layer_dir(chain)?;
        Ok(dir.read_to_string(file)?.trim().to_string())
    }

    fn mount_value(&self, name: &str, file: &str) -> Result<String> {
        let dir = self.mounts.open_dir(name)?;
        Ok(dir.read_to_string(file)?.trim().to_string())
    }

    fn write_mount_value(&self, name: &str, file: &str, value: &str) -> Result<()> {
        self.mounts.create_dir_all(name)?;
        let dir = self.mounts.open_dir(name)?;
        dir.write(file, value.as_bytes())?;
        Ok(())
    }
}

/// A transaction staged under `layers/tmp/<token>`.
struct FsTransaction<'a> {
    layers: &'a Dir,
    token: String,
    dir: Dir,
    done: bool,
}

impl MetadataTransaction for FsTransaction<'_> {
    fn set_diff_id(&mut self, diff: &DiffId) -> Result<()> {
        self.dir.write("diff", diff.as_str().as_bytes())?;
        Ok(())
    }

    fn set_size(&mut self, size: u64) -> Result<()> {
        self.dir.write("size", size.to_string().as_bytes())?;
        Ok(())
    }

    fn set_parent(&mut self, parent: &ChainId) -> Result<()> {
        self.dir.write("parent", parent.as_str().as_bytes())?;
        Ok(())
    }

    fn set_cache_id(&mut self, cache_id: &str) -> Result<()> {
        self.dir.write("cache-id", cache_id.as_bytes())?;
        Ok(())
    }

    fn set_os(&mut self, os: &str) -> Result<()> {
        self.dir.write("os", os.as_bytes())?;
        Ok(())
    }

    fn set_provenance(&mut self, provenance: &Provenance) -> Result<()> {
        self.dir
            .write("descriptor", serde_json::to_vec(provenance)?)?;
        Ok(())
    }

    fn set_tar_split_index(&mut self, index: &[u8]) -> Result<()> {
        self.dir.write("tar-split.json.gz", index)?;
        Ok(())
    }

    fn commit(mut self: Box<Self>, chain: &ChainId) -> Result<()> {
        self.dir
            .write("created", chrono::Utc::now().to_rfc3339().as_bytes())?;
        self.layers.rename(
            format!("tmp/{}", self.token),
            self.layers,
            format!("sha256/{}", chain.encoded()),
        )?;
        self.done = true;
        Ok(())
    }

    fn cancel(mut self: Box<Self>) -> Result<()> {
        self.layers.remove_dir_all(format!("tmp/{}", self.token))?;
        self.done = true;
        Ok(())
    }
}

impl Drop for FsTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            // Dropped without commit or cancel; the sweep on the next open
            // would also reclaim it.
            let _ = self.layers.remove_dir_all(format!("tmp/{}", self.token));
        }
    }
}

impl MetadataStore for FsMetadataStore {
    fn begin(&self) -> Result<Box<dyn MetadataTransaction + '_>> {
        let token = generate_opaque_id();
        self.layers.create_dir(format!("tmp/{token}"))?;
        let dir = self.layers.open_dir(format!("tmp/{token}"))?;
        Ok(Box::new(FsTransaction {
            layers: &self.layers,
            token,
            dir,
            done: false,
        }))
    }

    fn diff_id(&self, chain: &ChainId) -> Result<DiffId> {
        let value = self.read_value(chain, "diff")?;
        value
            .parse()
            .map_err(|_| MetadataError::Corrupt(format!("bad diff id for {chain}: {value}")))
    }

    fn size(&self, chain: &ChainId) -> Result<u64> {
        let value = self.read_value(chain, "size")?;
        value
            .parse()
            .map_err(|_| MetadataError::Corrupt(format!("bad size for {chain}: {value}")))
    }

    fn parent(&self, chain: &ChainId) -> Result<Option<ChainId>> {
        let dir = self.layer_dir(chain)?;
        if !dir.try_exists("parent")? {
            return Ok(None);
        }
        let value = dir.read_to_string("parent")?.trim().to_string();
        let parent = value
            .parse()
            .map_err(|_| MetadataError::Corrupt(format!("bad parent for {chain}: {value}")))?;
        Ok(Some(parent))
    }

    fn cache_id(&self, chain: &ChainId) -> Result<String> {
        self.read_value(chain, "cache-id")
    }

    fn os(&self, chain: &ChainId) -> Result<String> {
        self.read_value(chain, "os")
    }

    fn provenance(&self, chain: &ChainId) -> Result<Option<Provenance>> {
        let dir = self.layer_dir(chain)?;
        if !dir.try_exists("descriptor")? {
            return Ok(None);
        }
        let bytes = dir.read("descriptor")?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn tar_split_reader(&self, chain: &ChainId) -> Result<Option<Box<dyn Read + Send>>> {
        let dir = self.layer_dir(chain)?;
        if !dir.try_exists("tar-split.json.gz")? {
            return Ok(None);
        }
        let file = dir.open("tar-split.json.gz")?;
        Ok(Some(Box::new(file)))
    }

    fn remove(&self, chain: &ChainId) -> Result<()> {
        match self
            .layers
            .remove_dir_all(format!("sha256/{}", chain.encoded()))
        {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn set_mount_id(&self, name: &str, id: &str) -> Result<()> {
        self.write_mount_value(name, "mount-id", id)
    }

    fn set_init_id(&self, name: &str, id: &str) -> Result<()> {
        self.write_mount_value(name, "init-id", id)
    }

    fn set_mount_parent(&self, name: &str, parent: &ChainId) -> Result<()> {
        self.write_mount_value(name, "parent", parent.as_str())
    }

    fn set_mount_os(&self, name: &str, os: &str) -> Result<()> {
        self.write_mount_value(name, "os", os)
    }

    fn mount_id(&self, name: &str) -> Result<String> {
        self.mount_value(name, "mount-id")
    }

    fn init_id(&self, name: &str) -> Result<Option<String>> {
        let dir = self.mounts.open_dir(name)?;
        if !dir.try_exists("init-id")? {
            return Ok(None);
        }
        Ok(Some(dir.read_to_string("init-id")?.trim().to_string()))
    }

    fn mount_parent(&self, name: &str) -> Result<Option<ChainId>> {
        let dir = self.mounts.open_dir(name)?;
        if !dir.try_exists("parent")? {
            return Ok(None);
        }
        let value = dir.read_to_string("parent")?.trim().to_string();
        let parent = value
            .parse()
            .map_err(|_| MetadataError::Corrupt(format!("bad parent for mount {name}: {value}")))?;
        Ok(Some(parent))
    }

    fn mount_os(&self, name: &str) -> Result<String> {
        self.mount_value(name, "os")
    }

    fn remove_mount(&self, name: &str) -> Result<()> {
        match self.mounts.remove_dir_all(name) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<(Vec<ChainId>, Vec<String>)> {
        let mut chains = Vec::new();
        let by_chain = self.layers.open_dir("sha256")?;
        for entry in by_chain.entries()? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            let chain = format!("sha256:{name}")
                .parse()
                .map_err(|_| MetadataError::Corrupt(format!("bad layer directory: {name}")))?;
            chains.push(chain);
        }

        let mut names = Vec::new();
        for entry in self.mounts.entries()? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }

        chains.sort();
        names.sort();
        Ok((chains, names))
    }
}
