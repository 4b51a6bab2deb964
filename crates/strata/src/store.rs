//! The layer store: registration, lookup, release, and writable mounts.
//!
//! [`LayerStore`] is the single entry point of the engine. It composes the
//! content digester, the backend driver registry, and the metadata store to
//! expose reference-counted read-only layers keyed by chain id and writable
//! mounts keyed by name.
//!
//! # Concurrency
//!
//! Two independent critical sections exist: one guarding the layer graph
//! (chain id → node, including reference counts) and one guarding the mount
//! registry (name → slot). Operations touching both acquire the mount
//! registry first and the layer graph second, never the reverse. Backend and
//! metadata IO runs outside both locks: mount creation and teardown reserve
//! the name in the registry, drop the lock, and do the slow work before
//! activating or vacating the slot, so mounts with different names proceed
//! fully in parallel. Two deliberate exceptions hold a lock across IO: the
//! registration endgame, where the dedup existence check, the winner's
//! reference increment, and the commit-and-insert share a single critical
//! section so that a concurrent release of the winner can never observe a
//! half-registered layer; and the release cascade, where removal at count
//! zero keeps the graph lock so a concurrent lookup can never resurrect a
//! layer whose backend state is already coming down.
//!
//! # Failure semantics
//!
//! Multi-step operations compensate on failure: partially created backend
//! state is removed, open metadata transactions are cancelled, and
//! provisionally retained parent references are given back before the error
//! surfaces. A failing compensation is logged and the original error is
//! still the one returned. The store never retries; retry policy belongs to
//! the caller.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::digest::{ChainId, DiffId, DigestingReader};
use crate::driver::{Driver, DriverRegistry};
use crate::error::{Result, StorageError};
use crate::layer::{
    Layer, LayerMetadata, LayerNode, MAX_LAYER_DEPTH, Mount, MountInit, MountNode, Provenance,
    SUPPORTED_PLATFORMS, generate_opaque_id,
};
use crate::metadata::{MetadataStore, MetadataTransaction};
use crate::tar_split::{AssembledDiff, TarSplitPacker};

/// A mount-registry slot.
///
/// A name is reserved while its backend state is being materialized or torn
/// down, so the slow IO runs outside the registry lock without the name ever
/// being claimable twice.
enum MountSlot {
    Reserved,
    Active(MountNode),
}

/// Reference-counted store of read-only layers and writable mounts.
pub struct LayerStore {
    metadata: Box<dyn MetadataStore>,
    drivers: DriverRegistry,
    layers: Mutex<HashMap<ChainId, LayerNode>>,
    mounts: Mutex<HashMap<String, MountSlot>>,
}

impl LayerStore {
    /// Open a store over durable metadata, rebuilding the in-memory indexes.
    ///
    /// Every persisted layer is loaded parent-first (memoized, so shared
    /// ancestors load once) and re-counted exactly as registration would
    /// have: one base reference per layer, plus one per child and one per
    /// referencing mount. Mounts are re-attached with one base holder each.
    pub fn open(metadata: Box<dyn MetadataStore>, drivers: DriverRegistry) -> Result<Self> {
        let (chains, mount_names) = metadata.list()?;

        let mut layers = HashMap::new();
        for chain in &chains {
            Self::load_layer(metadata.as_ref(), &drivers, chain, &mut layers)?;
        }

        let mut mounts = HashMap::new();
        for name in mount_names {
            let mount_id = metadata.mount_id(&name)?;
            let init_id = metadata.init_id(&name)?;
            let parent = metadata.mount_parent(&name)?;
            let os = metadata.mount_os(&name)?;
            if !drivers.contains(&os) {
                return Err(StorageError::InvalidPlatform(os));
            }
            if let Some(parent) = &parent {
                layers
                    .get_mut(parent)
                    .ok_or_else(|| StorageError::LayerNotFound(parent.to_string()))?
                    .references += 1;
            }
            mounts.insert(
                name.clone(),
                MountSlot::Active(MountNode {
                    name,
                    mount_id,
                    init_id,
                    parent,
                    os,
                    holders: 1,
                }),
            );
        }

        tracing::debug!(
            layers = layers.len(),
            mounts = mounts.len(),
            "rebuilt indexes from metadata"
        );
        Ok(Self {
            metadata,
            drivers,
            layers: Mutex::new(layers),
            mounts: Mutex::new(mounts),
        })
    }

    fn load_layer(
        metadata: &dyn MetadataStore,
        drivers: &DriverRegistry,
        chain: &ChainId,
        layers: &mut HashMap<ChainId, LayerNode>,
    ) -> Result<()> {
        if layers.contains_key(chain) {
            return Ok(());
        }
        let diff_id = metadata.diff_id(chain)?;
        let parent = metadata.parent(chain)?;
        let size = metadata.size(chain)?;
        let cache_id = metadata.cache_id(chain)?;
        let os = metadata.os(chain)?;
        let provenance = metadata.provenance(chain)?;
        if !drivers.contains(&os) {
            return Err(StorageError::InvalidPlatform(os));
        }
        if let Some(parent) = &parent {
            // Recursion is bounded by the depth ceiling.
            Self::load_layer(metadata, drivers, parent, layers)?;
            layers
                .get_mut(parent)
                .expect("parent just loaded")
                .references += 1;
        }
        layers.insert(
            chain.clone(),
            LayerNode {
                chain_id: chain.clone(),
                diff_id,
                parent,
                cache_id,
                size,
                os,
                provenance,
                references: 1,
            },
        );
        Ok(())
    }

    fn resolve_os(&self, os: Option<&str>) -> Result<String> {
        let os = os.unwrap_or(std::env::consts::OS);
        if !SUPPORTED_PLATFORMS.contains(&os) {
            return Err(StorageError::InvalidPlatform(os.to_string()));
        }
        Ok(os.to_string())
    }

    fn driver_for(&self, os: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .driver(os)
            .ok_or_else(|| StorageError::InvalidPlatform(os.to_string()))
    }

    /// Register a diff stream as a new read-only layer.
    ///
    /// The stream must be an uncompressed tar diff. `parent`, if given, must
    /// already be registered. `os` defaults to the host OS and must match
    /// the parent's tag. Returns a counted handle; registering content that
    /// already exists under the same ancestry returns a handle on the
    /// existing layer instead of storing a second copy.
    pub fn register(
        &self,
        diff: impl Read,
        parent: Option<&ChainId>,
        os: Option<&str>,
    ) -> Result<Layer> {
        self.register_with_provenance(diff, parent, os, None)
    }

    /// [`register`], additionally recording where the diff came from (e.g. a
    /// registry blob descriptor) for later inspection.
    ///
    /// [`register`]: LayerStore::register
    pub fn register_with_provenance(
        &self,
        diff: impl Read,
        parent: Option<&ChainId>,
        os: Option<&str>,
        provenance: Option<Provenance>,
    ) -> Result<Layer> {
        let os = self.resolve_os(os)?;
        let driver = self.driver_for(&os)?;
        let exact = self.drivers.exact_diff(&os).unwrap_or(false);

        // Resolve the parent, check the depth ceiling, and take a
        // provisional reference, given back on any failure below.
        let parent_info = match parent {
            Some(parent) => {
                let mut layers = self.layers.lock().expect("layer graph poisoned");
                let node = layers
                    .get(parent)
                    .ok_or_else(|| StorageError::LayerNotFound(parent.to_string()))?;
                if node.os != os {
                    return Err(StorageError::InvalidPlatform(format!(
                        "parent layer {parent} is {}, diff is {os}",
                        node.os
                    )));
                }
                if Self::depth_locked(&layers, parent) >= MAX_LAYER_DEPTH {
                    return Err(StorageError::MaxDepthExceeded(MAX_LAYER_DEPTH));
                }
                let cache_id = node.cache_id.clone();
                layers.get_mut(parent).expect("present").references += 1;
                Some((parent.clone(), cache_id))
            }
            None => None,
        };

        match self.register_diff(diff, parent_info.as_ref(), &os, provenance, &driver, exact) {
            Ok((layer, deduplicated)) => {
                if deduplicated {
                    // The existing layer already holds its own parent edge.
                    self.release_provisional_parent(parent_info.as_ref());
                }
                Ok(layer)
            }
            Err(e) => {
                self.release_provisional_parent(parent_info.as_ref());
                Err(e)
            }
        }
    }

    fn register_diff(
        &self,
        diff: impl Read,
        parent: Option<&(ChainId, String)>,
        os: &str,
        provenance: Option<Provenance>,
        driver: &Arc<dyn Driver>,
        exact: bool,
    ) -> Result<(Layer, bool)> {
        let cache_id = generate_opaque_id();
        let parent_chain = parent.map(|(chain, _)| chain);
        let parent_cache = parent.map(|(_, cache)| cache.as_str());

        driver.create(&cache_id, parent_cache)?;

        let (diff_id, size, index) =
            match self.apply_and_digest(diff, &cache_id, parent_cache, driver, exact) {
                Ok(applied) => applied,
                Err(e) => {
                    self.remove_backend_state(driver, &cache_id);
                    return Err(e);
                }
            };

        let chain_id = ChainId::derive(parent_chain, &diff_id);

        let txn = match self.stage_record(
            &diff_id,
            size,
            parent_chain,
            &cache_id,
            os,
            provenance.as_ref(),
            &index,
        ) {
            Ok(txn) => txn,
            Err(e) => {
                self.remove_backend_state(driver, &cache_id);
                return Err(e);
            }
        };

        // Single critical section spanning the dedup existence check and
        // either the winner's increment or the commit-and-insert.
        let mut layers = self.layers.lock().expect("layer graph poisoned");
        if let Some(existing) = layers.get_mut(&chain_id) {
            existing.references += 1;
            let layer = Layer::from_node(existing);
            drop(layers);
            tracing::debug!(layer = %chain_id, "deduplicated concurrent registration");
            if let Err(e) = txn.cancel() {
                tracing::warn!(layer = %chain_id, error = %e, "failed to cancel metadata transaction");
            }
            self.remove_backend_state(driver, &cache_id);
            return Ok((layer, true));
        }
        if let Err(e) = txn.commit(&chain_id) {
            drop(layers);
            self.remove_backend_state(driver, &cache_id);
            return Err(e.into());
        }
        let node = LayerNode {
            chain_id: chain_id.clone(),
            diff_id,
            parent: parent_chain.cloned(),
            cache_id,
            size,
            os: os.to_string(),
            provenance,
            references: 1,
        };
        let layer = Layer::from_node(&node);
        layers.insert(chain_id.clone(), node);
        drop(layers);
        tracing::debug!(layer = %chain_id, size, "registered layer");
        Ok((layer, false))
    }

    fn apply_and_digest(
        &self,
        diff: impl Read,
        cache_id: &str,
        parent_cache: Option<&str>,
        driver: &Arc<dyn Driver>,
        exact: bool,
    ) -> Result<(DiffId, u64, Option<Vec<u8>>)> {
        let digester = DigestingReader::new(diff);
        if exact {
            let mut digester = digester;
            driver.apply_diff(cache_id, parent_cache, &mut digester)?;
            // Drain whatever the backend left unread so the digest covers
            // the whole logical diff and the producer is never left blocked.
            io::copy(&mut digester, &mut io::sink())?;
            let (diff_id, size) = digester.finalize();
            Ok((diff_id, size, None))
        } else {
            let mut packer = TarSplitPacker::new(digester);
            driver.apply_diff(cache_id, parent_cache, &mut packer)?;
            io::copy(&mut packer, &mut io::sink())?;
            let (digester, index) = packer.finish()?;
            let (diff_id, size) = digester.finalize();
            Ok((diff_id, size, Some(index)))
        }
    }

    fn stage_record(
        &self,
        diff_id: &DiffId,
        size: u64,
        parent: Option<&ChainId>,
        cache_id: &str,
        os: &str,
        provenance: Option<&Provenance>,
        index: &Option<Vec<u8>>,
    ) -> Result<Box<dyn MetadataTransaction + '_>> {
        let mut txn = self.metadata.begin()?;
        let staged = (|| -> Result<()> {
            txn.set_diff_id(diff_id)?;
            txn.set_size(size)?;
            if let Some(parent) = parent {
                txn.set_parent(parent)?;
            }
            txn.set_cache_id(cache_id)?;
            txn.set_os(os)?;
            if let Some(provenance) = provenance {
                txn.set_provenance(provenance)?;
            }
            if let Some(index) = index {
                txn.set_tar_split_index(index)?;
            }
            Ok(())
        })();
        if let Err(e) = staged {
            if let Err(cancel_err) = txn.cancel() {
                tracing::warn!(error = %cancel_err, "failed to cancel metadata transaction");
            }
            return Err(e);
        }
        Ok(txn)
    }

    fn remove_backend_state(&self, driver: &Arc<dyn Driver>, cache_id: &str) {
        if let Err(e) = driver.remove(cache_id) {
            tracing::warn!(cache_id, error = %e, "failed to remove partially created backend state");
        }
    }

    fn release_provisional_parent(&self, parent: Option<&(ChainId, String)>) {
        if let Some((parent, _)) = parent {
            if let Err(e) = self.release_reference(parent) {
                tracing::warn!(layer = %parent, error = %e, "failed to release provisional parent reference");
            }
        }
    }

    fn release_reference(&self, chain: &ChainId) -> Result<Vec<LayerMetadata>> {
        let mut layers = self.layers.lock().expect("layer graph poisoned");
        self.release_locked(&mut layers, chain)
    }

    fn depth_locked(layers: &HashMap<ChainId, LayerNode>, chain: &ChainId) -> usize {
        let mut depth = 0;
        let mut current = Some(chain.clone());
        while let Some(chain) = current {
            let node = layers
                .get(&chain)
                .unwrap_or_else(|| panic!("layer graph corrupt: missing ancestor {chain}"));
            depth += 1;
            current = node.parent.clone();
        }
        depth
    }

    /// Look up a registered layer, retaining one reference on it.
    pub fn get(&self, chain: &ChainId) -> Result<Layer> {
        let mut layers = self.layers.lock().expect("layer graph poisoned");
        let node = layers
            .get_mut(chain)
            .ok_or_else(|| StorageError::LayerNotFound(chain.to_string()))?;
        node.references += 1;
        Ok(Layer::from_node(node))
    }

    /// Give back a handle obtained from registration or lookup.
    ///
    /// Decrements the layer's reference count; a layer reaching zero is
    /// removed (backend state, metadata, graph entry) and the release
    /// cascades to its parent. Returns the removed layers, leaf first, so
    /// callers can report reclaimed space.
    pub fn release(&self, layer: &Layer) -> Result<Vec<LayerMetadata>> {
        let mut layers = self.layers.lock().expect("layer graph poisoned");
        if !layers.contains_key(layer.chain_id()) {
            return Err(StorageError::LayerNotRetained(layer.chain_id().to_string()));
        }
        self.release_locked(&mut layers, layer.chain_id())
    }

    fn release_locked(
        &self,
        layers: &mut HashMap<ChainId, LayerNode>,
        chain: &ChainId,
    ) -> Result<Vec<LayerMetadata>> {
        let mut removed = Vec::new();
        let mut current = chain.clone();
        loop {
            let node = layers
                .get_mut(&current)
                .unwrap_or_else(|| panic!("layer graph corrupt: {current} missing during release"));
            if node.references == 0 {
                panic!("layer graph corrupt: layer {current} present with zero reference count");
            }
            node.references -= 1;
            if node.references > 0 {
                return Ok(removed);
            }

            if layers
                .values()
                .any(|other| other.parent.as_ref() == Some(&current))
            {
                panic!("layer graph corrupt: removing layer {current} while a child references it");
            }

            let (cache_id, os, parent, diff_id, size) = {
                let node = layers.get(&current).expect("checked above");
                (
                    node.cache_id.clone(),
                    node.os.clone(),
                    node.parent.clone(),
                    node.diff_id.clone(),
                    node.size,
                )
            };

            // Removal failures restore the count so the release can be
            // retried cleanly; drivers treat re-removal as a no-op.
            let driver = match self.driver_for(&os) {
                Ok(driver) => driver,
                Err(e) => {
                    layers.get_mut(&current).expect("present").references = 1;
                    return Err(e);
                }
            };
            if let Err(e) = driver.remove(&cache_id) {
                layers.get_mut(&current).expect("present").references = 1;
                return Err(e.into());
            }
            if let Err(e) = self.metadata.remove(&current) {
                layers.get_mut(&current).expect("present").references = 1;
                return Err(e.into());
            }

            layers.remove(&current);
            tracing::debug!(layer = %current, size, "removed layer");
            removed.push(LayerMetadata {
                chain_id: current.clone(),
                diff_id,
                size,
            });
            match parent {
                Some(parent) => current = parent,
                None => return Ok(removed),
            }
        }
    }

    /// Create a writable mount named `name` on top of `parent`.
    ///
    /// With an `init` callback, an immutable init layer is materialized
    /// between the parent and the writable layer first: it is mounted,
    /// seeded by the callback, unmounted, and the writable layer is stacked
    /// on it. A parented mount inherits the parent's OS tag.
    pub fn create_mount(
        &self,
        name: &str,
        parent: Option<&ChainId>,
        os: Option<&str>,
        init: Option<MountInit<'_>>,
    ) -> Result<Mount> {
        {
            let mut mounts = self.mounts.lock().expect("mount registry poisoned");
            if mounts.contains_key(name) {
                return Err(StorageError::MountNameConflict(name.to_string()));
            }
            mounts.insert(name.to_string(), MountSlot::Reserved);
        }

        match self.materialize_mount(name, parent, os, init) {
            Ok(node) => {
                let mount = Mount::from_node(&node);
                self.mounts
                    .lock()
                    .expect("mount registry poisoned")
                    .insert(name.to_string(), MountSlot::Active(node));
                tracing::debug!(mount = name, "created mount");
                Ok(mount)
            }
            Err(e) => {
                self.mounts
                    .lock()
                    .expect("mount registry poisoned")
                    .remove(name);
                Err(e)
            }
        }
    }

    fn materialize_mount(
        &self,
        name: &str,
        parent: Option<&ChainId>,
        os: Option<&str>,
        init: Option<MountInit<'_>>,
    ) -> Result<MountNode> {
        let (os, parent_info) = match parent {
            Some(parent) => {
                let mut layers = self.layers.lock().expect("layer graph poisoned");
                let node = layers
                    .get(parent)
                    .ok_or_else(|| StorageError::LayerNotFound(parent.to_string()))?;
                let parent_os = node.os.clone();
                if let Some(requested) = os {
                    if requested != parent_os {
                        return Err(StorageError::InvalidPlatform(format!(
                            "parent layer {parent} is {parent_os}, mount requested {requested}"
                        )));
                    }
                }
                let cache_id = node.cache_id.clone();
                layers.get_mut(parent).expect("present").references += 1;
                (parent_os, Some((parent.clone(), cache_id)))
            }
            None => (self.resolve_os(os)?, None),
        };

        let driver = match self.driver_for(&os) {
            Ok(driver) => driver,
            Err(e) => {
                self.release_provisional_parent(parent_info.as_ref());
                return Err(e);
            }
        };

        let parent_cache = parent_info.as_ref().map(|(_, cache)| cache.as_str());
        let (mount_id, init_id) = match self.create_mount_backend(&driver, parent_cache, init) {
            Ok(ids) => ids,
            Err(e) => {
                self.release_provisional_parent(parent_info.as_ref());
                return Err(e);
            }
        };

        let persisted = (|| -> Result<()> {
            self.metadata.set_mount_id(name, &mount_id)?;
            if let Some(init_id) = &init_id {
                self.metadata.set_init_id(name, init_id)?;
            }
            if let Some((parent, _)) = &parent_info {
                self.metadata.set_mount_parent(name, parent)?;
            }
            self.metadata.set_mount_os(name, &os)?;
            Ok(())
        })();
        if let Err(e) = persisted {
            if let Err(cleanup) = self.metadata.remove_mount(name) {
                tracing::warn!(mount = name, error = %cleanup, "failed to remove partial mount record");
            }
            self.remove_backend_state(&driver, &mount_id);
            if let Some(init_id) = &init_id {
                self.remove_backend_state(&driver, init_id);
            }
            self.release_provisional_parent(parent_info.as_ref());
            return Err(e);
        }

        Ok(MountNode {
            name: name.to_string(),
            mount_id,
            init_id,
            parent: parent_info.map(|(parent, _)| parent),
            os,
            holders: 1,
        })
    }

    fn create_mount_backend(
        &self,
        driver: &Arc<dyn Driver>,
        parent_cache: Option<&str>,
        init: Option<MountInit<'_>>,
    ) -> Result<(String, Option<String>)> {
        let mount_id = generate_opaque_id();

        let init_id = match init {
            Some(init) => {
                let init_id = format!("{mount_id}-init");
                driver.create(&init_id, parent_cache)?;
                let seeded = (|| -> Result<()> {
                    let path = driver.mount(&init_id, "")?;
                    let result = init(&path).map_err(StorageError::Io);
                    if let Err(e) = driver.unmount(&init_id) {
                        tracing::warn!(error = %e, "failed to unmount init layer");
                    }
                    result
                })();
                if let Err(e) = seeded {
                    self.remove_backend_state(driver, &init_id);
                    return Err(e);
                }
                Some(init_id)
            }
            None => None,
        };

        let base = init_id.as_deref().or(parent_cache);
        if let Err(e) = driver.create(&mount_id, base) {
            if let Some(init_id) = &init_id {
                self.remove_backend_state(driver, init_id);
            }
            return Err(e.into());
        }
        Ok((mount_id, init_id))
    }

    /// Look up a mount by name, retaining one holder on it.
    pub fn get_mount(&self, name: &str) -> Result<Mount> {
        let mut mounts = self.mounts.lock().expect("mount registry poisoned");
        match mounts.get_mut(name) {
            Some(MountSlot::Active(node)) => {
                node.holders += 1;
                Ok(Mount::from_node(node))
            }
            _ => Err(StorageError::MountNotFound(name.to_string())),
        }
    }

    /// Give back a mount handle.
    ///
    /// While other holders remain this is a no-op. Releasing the last
    /// holder removes the writable backend state, the init layer state, the
    /// persisted record, and the registry entry, then releases the
    /// reference on the parent chain, cascading as in [`release`]. If
    /// backend removal fails, the holder count is restored and the error
    /// surfaces; the mount stays registered so the release can be retried.
    ///
    /// [`release`]: LayerStore::release
    pub fn release_mount(&self, mount: &Mount) -> Result<Vec<LayerMetadata>> {
        let node = {
            let mut mounts = self.mounts.lock().expect("mount registry poisoned");
            let node = match mounts.get_mut(mount.name()) {
                Some(MountSlot::Active(node)) => node,
                _ => return Err(StorageError::MountNotFound(mount.name().to_string())),
            };
            node.holders -= 1;
            if node.holders > 0 {
                return Ok(Vec::new());
            }
            // Keep the name reserved while the backend state comes down, so
            // the slow IO runs outside the registry lock but the name cannot
            // be claimed or resolved mid-teardown.
            match std::mem::replace(
                mounts.get_mut(mount.name()).expect("present"),
                MountSlot::Reserved,
            ) {
                MountSlot::Active(node) => node,
                MountSlot::Reserved => unreachable!("slot was active above"),
            }
        };
        let parent = node.parent.clone();

        let torn_down = (|| -> Result<()> {
            let driver = self.driver_for(&node.os)?;
            driver.remove(&node.mount_id)?;
            if let Some(init_id) = &node.init_id {
                driver.remove(init_id)?;
            }
            self.metadata.remove_mount(&node.name)?;
            Ok(())
        })();
        if let Err(e) = torn_down {
            // The release is treated as not having happened; the mount stays
            // registered so it can be retried cleanly.
            let mut node = node;
            node.holders = 1;
            self.mounts
                .lock()
                .expect("mount registry poisoned")
                .insert(node.name.clone(), MountSlot::Active(node));
            return Err(e);
        }

        self.mounts
            .lock()
            .expect("mount registry poisoned")
            .remove(mount.name());
        tracing::debug!(mount = mount.name(), "released mount");

        match parent {
            Some(parent) => {
                let mut layers = self.layers.lock().expect("layer graph poisoned");
                if !layers.contains_key(&parent) {
                    panic!("layer graph corrupt: mount parent {parent} missing");
                }
                self.release_locked(&mut layers, &parent)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Mount the writable layer and return its mount point.
    pub fn mount(&self, mount: &Mount, label: &str) -> Result<PathBuf> {
        let mount_id = self.mount_node_id(mount.name())?;
        let driver = self.driver_for(mount.os())?;
        Ok(driver.mount(&mount_id, label)?)
    }

    /// Unmount the writable layer.
    pub fn unmount(&self, mount: &Mount) -> Result<()> {
        let mount_id = self.mount_node_id(mount.name())?;
        let driver = self.driver_for(mount.os())?;
        Ok(driver.unmount(&mount_id)?)
    }

    /// Bytes consumed by the writable layer itself, base layers excluded.
    pub fn mount_size(&self, mount: &Mount) -> Result<u64> {
        let (mount_id, base) = {
            let mounts = self.mounts.lock().expect("mount registry poisoned");
            let node = match mounts.get(mount.name()) {
                Some(MountSlot::Active(node)) => node,
                _ => return Err(StorageError::MountNotFound(mount.name().to_string())),
            };
            let parent_cache = match &node.parent {
                Some(parent) => {
                    let layers = self.layers.lock().expect("layer graph poisoned");
                    let parent_node = layers
                        .get(parent)
                        .unwrap_or_else(|| panic!("layer graph corrupt: mount parent {parent} missing"));
                    Some(parent_node.cache_id.clone())
                }
                None => None,
            };
            (node.mount_id.clone(), node.base_id(parent_cache.as_deref()))
        };
        let driver = self.driver_for(mount.os())?;
        Ok(driver.diff_size(&mount_id, base.as_deref())?)
    }

    fn mount_node_id(&self, name: &str) -> Result<String> {
        let mounts = self.mounts.lock().expect("mount registry poisoned");
        match mounts.get(name) {
            Some(MountSlot::Active(node)) => Ok(node.mount_id.clone()),
            _ => Err(StorageError::MountNotFound(name.to_string())),
        }
    }

    /// Stream the layer's own diff content, parent excluded.
    ///
    /// Exact-diff capable drivers produce the stream directly; for others it
    /// is reassembled from the structural index recorded at registration,
    /// byte-identical to the diff originally applied.
    pub fn diff(&self, chain: &ChainId) -> Result<Box<dyn Read + Send>> {
        let (cache_id, parent_cache, os) = {
            let layers = self.layers.lock().expect("layer graph poisoned");
            let node = layers
                .get(chain)
                .ok_or_else(|| StorageError::LayerNotFound(chain.to_string()))?;
            let parent_cache = node.parent.as_ref().map(|parent| {
                layers
                    .get(parent)
                    .unwrap_or_else(|| panic!("layer graph corrupt: missing ancestor {parent}"))
                    .cache_id
                    .clone()
            });
            (node.cache_id.clone(), parent_cache, node.os.clone())
        };

        let driver = self.driver_for(&os)?;
        if self.drivers.exact_diff(&os).unwrap_or(false) {
            return Ok(driver.diff(&cache_id, parent_cache.as_deref())?);
        }
        let index = self
            .metadata
            .tar_split_reader(chain)?
            .ok_or_else(|| StorageError::TarSplit(format!("layer {chain} has no structural index")))?;
        Ok(Box::new(AssembledDiff::new(index, driver, cache_id)))
    }

    /// Size in bytes of the layer's own diff, parent excluded.
    pub fn diff_size(&self, chain: &ChainId) -> Result<u64> {
        let layers = self.layers.lock().expect("layer graph poisoned");
        let node = layers
            .get(chain)
            .ok_or_else(|| StorageError::LayerNotFound(chain.to_string()))?;
        Ok(node.size)
    }

    /// Snapshot of all currently registered chain ids, sorted.
    pub fn chain_ids(&self) -> Vec<ChainId> {
        let layers = self.layers.lock().expect("layer graph poisoned");
        let mut chains: Vec<ChainId> = layers.keys().cloned().collect();
        chains.sort();
        chains
    }

    /// Name of the backend driver serving `os`.
    pub fn driver_name(&self, os: Option<&str>) -> Result<String> {
        let os = self.resolve_os(os)?;
        Ok(self.driver_for(&os)?.name().to_string())
    }

    /// Diagnostic status of the backend driver serving `os`.
    pub fn driver_status(&self, os: Option<&str>) -> Result<Vec<(String, String)>> {
        let os = self.resolve_os(os)?;
        Ok(self.driver_for(&os)?.status())
    }
}
