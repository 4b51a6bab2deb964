//! Layer and mount node types, handles, and identity generation.

use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::digest::{ChainId, DiffId};

/// Maximum number of ancestors a layer chain may have.
///
/// Backends stack at most 127 layers; two slots are reserved for the
/// writable layer and its init layer, leaving 125 for read-only ancestry.
pub const MAX_LAYER_DEPTH: usize = 125;

/// OS tags the store accepts, named as [`std::env::consts::OS`] names them.
pub const SUPPORTED_PLATFORMS: &[&str] = &["linux", "windows", "macos", "freebsd"];

/// Generate a random 64-character hex opaque id.
///
/// Opaque ids address backend-private state and metadata transaction
/// staging. They carry no content information; content identity lives in
/// [`DiffId`] and [`ChainId`] exclusively.
pub fn generate_opaque_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Distribution provenance of a layer's diff, as advertised by whatever
/// source delivered it (e.g. a registry blob descriptor). Opaque to the
/// store; recorded at registration and handed back on lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Media type of the distributed blob.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Digest of the distributed (possibly compressed) blob.
    pub digest: String,
    /// Size in bytes of the distributed blob.
    pub size: u64,
}

/// A read-only layer node as held in the layer graph.
///
/// Nodes are owned exclusively by the graph map; parents are referenced by
/// chain id and resolved through the map, never by pointer, so removal can
/// never leave a dangling reference.
#[derive(Debug)]
pub(crate) struct LayerNode {
    pub(crate) chain_id: ChainId,
    pub(crate) diff_id: DiffId,
    pub(crate) parent: Option<ChainId>,
    pub(crate) cache_id: String,
    pub(crate) size: u64,
    pub(crate) os: String,
    pub(crate) provenance: Option<Provenance>,
    /// Outstanding holds: issued handles, child layers, and mounts.
    pub(crate) references: usize,
}

/// A writable-mount node as held in the mount registry.
#[derive(Debug)]
pub(crate) struct MountNode {
    pub(crate) name: String,
    pub(crate) mount_id: String,
    pub(crate) init_id: Option<String>,
    pub(crate) parent: Option<ChainId>,
    pub(crate) os: String,
    /// Outstanding handles on this mount.
    pub(crate) holders: usize,
}

impl MountNode {
    /// The opaque id the writable layer is stacked on: the init layer if one
    /// was seeded, otherwise the parent layer's backend state.
    pub(crate) fn base_id(&self, parent_cache: Option<&str>) -> Option<String> {
        self.init_id
            .clone()
            .or_else(|| parent_cache.map(String::from))
    }
}

/// A counted handle on a registered read-only layer.
///
/// Obtained from registration or lookup; each handle accounts for one
/// reference on the layer and must be given back through release. The
/// handle carries a snapshot of the layer's immutable attributes.
#[derive(Debug)]
pub struct Layer {
    chain_id: ChainId,
    diff_id: DiffId,
    parent: Option<ChainId>,
    size: u64,
    os: String,
    provenance: Option<Provenance>,
}

impl Layer {
    pub(crate) fn from_node(node: &LayerNode) -> Self {
        Self {
            chain_id: node.chain_id.clone(),
            diff_id: node.diff_id.clone(),
            parent: node.parent.clone(),
            size: node.size,
            os: node.os.clone(),
            provenance: node.provenance.clone(),
        }
    }

    /// Content-and-ancestry identity of this layer.
    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    /// Content identity of this layer's own diff.
    pub fn diff_id(&self) -> &DiffId {
        &self.diff_id
    }

    /// Chain id of the parent layer, if any.
    pub fn parent(&self) -> Option<&ChainId> {
        self.parent.as_ref()
    }

    /// Size in bytes of this layer's own diff, parent excluded.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// OS tag of this layer.
    pub fn os(&self) -> &str {
        &self.os
    }

    /// Distribution provenance recorded at registration, if any.
    pub fn provenance(&self) -> Option<&Provenance> {
        self.provenance.as_ref()
    }
}

/// A counted handle on a writable mount.
#[derive(Debug)]
pub struct Mount {
    name: String,
    parent: Option<ChainId>,
    os: String,
}

impl Mount {
    pub(crate) fn from_node(node: &MountNode) -> Self {
        Self {
            name: node.name.clone(),
            parent: node.parent.clone(),
            os: node.os.clone(),
        }
    }

    /// The caller-chosen unique name of this mount.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Chain id of the read-only parent chain, if any.
    pub fn parent(&self) -> Option<&ChainId> {
        self.parent.as_ref()
    }

    /// OS tag of this mount.
    pub fn os(&self) -> &str {
        &self.os
    }
}

/// Final identity and size of a layer removed by a release cascade.
///
/// Returned so callers can report reclaimed space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerMetadata {
    /// Chain id the layer was registered under.
    pub chain_id: ChainId,
    /// Content identity of the layer's diff.
    pub diff_id: DiffId,
    /// Size in bytes of the layer's own diff.
    pub size: u64,
}

/// The initializer callback invoked against a freshly created init layer's
/// mount point, before any container writes occur.
pub type MountInit<'a> = &'a dyn Fn(&Path) -> std::io::Result<()>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_opaque_id_format() {
        let id = generate_opaque_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_opaque_id());
    }

    #[test]
    fn test_mount_base_id_prefers_init_layer() {
        let node = MountNode {
            name: "c1".to_string(),
            mount_id: "m".to_string(),
            init_id: Some("m-init".to_string()),
            parent: None,
            os: "linux".to_string(),
            holders: 1,
        };
        assert_eq!(node.base_id(Some("p")).as_deref(), Some("m-init"));

        let node = MountNode {
            init_id: None,
            ..node
        };
        assert_eq!(node.base_id(Some("p")).as_deref(), Some("p"));
        assert_eq!(node.base_id(None), None);
    }
}
