#![forbid(unsafe_code)]
//! Layered filesystem storage engine for container root filesystems.
//!
//! strata turns a sequence of filesystem diffs into addressable, shareable,
//! reference-counted root filesystems. Read-only layers are content
//! addressed: a diff's identity is the digest of its uncompressed bytes, and
//! a layer's identity folds that digest together with its ancestry, so
//! identical content registered under identical parents is stored exactly
//! once. Writable mounts stack a container's root on top of a read-only
//! chain, optionally seeded through an immutable init layer.
//!
//! # Overview
//!
//! The [`LayerStore`] is the single entry point. It consumes two narrow
//! contracts from its collaborators:
//!
//! - a [`Driver`] per OS tag, which owns the physical layer representation
//!   (create, remove, apply diff, mount), registered in a [`DriverRegistry`];
//! - a [`MetadataStore`] for durable records, with the file-backed
//!   [`FsMetadataStore`] provided in-crate.
//!
//! Layers whose driver cannot reproduce applied diffs byte for byte get a
//! structural index recorded at registration time; [`LayerStore::diff`]
//! later reassembles the exact original stream from that index plus live
//! file content. See [`tar_split`] for the mechanism.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata::{DriverRegistry, FsMetadataStore, LayerStore};
//!
//! # fn open_driver() -> Arc<dyn strata::Driver> { unimplemented!() }
//! let mut drivers = DriverRegistry::new();
//! drivers.insert("linux", open_driver());
//!
//! let metadata = FsMetadataStore::open("/var/lib/strata/layerdb")?;
//! let store = LayerStore::open(Box::new(metadata), drivers)?;
//!
//! let layer = store.register(std::io::empty(), None, None)?;
//! println!("registered {}", layer.chain_id());
//! # Ok::<(), strata::StorageError>(())
//! ```

// Identity and digesting
pub mod digest;

// Collaborator contracts
pub mod driver;
pub mod metadata;

// Core store
pub mod error;
pub mod layer;
pub mod store;

// Byte-exact diff reconstruction
pub mod tar_split;

pub use digest::{ChainId, DIGEST_ALGORITHM, DiffId, DigestingReader, InvalidDigest};
pub use driver::{Driver, DriverError, DriverRegistry};
pub use error::{Result, StorageError};
pub use layer::{
    Layer, LayerMetadata, MAX_LAYER_DEPTH, Mount, MountInit, Provenance, SUPPORTED_PLATFORMS,
    generate_opaque_id,
};
pub use metadata::{FsMetadataStore, MetadataError, MetadataStore, MetadataTransaction};
pub use store::LayerStore;
pub use tar_split::{AssembledDiff, TarSplitItem, TarSplitPacker, TarSplitStream};
