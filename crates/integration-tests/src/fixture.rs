//! Test fixtures: isolated stores backed by an in-memory tar driver.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use strata::{Driver, DriverError, DriverRegistry, FsMetadataStore, LayerStore};

/// An in-memory backend without the exact-diff capability.
///
/// Applying a diff unpacks it into a per-layer file map, discarding tar
/// framing, ordering, and non-file entries entirely, so a literal re-diff is
/// impossible and the store must take the tar-split reassembly path.
/// Mounting materializes the union of a layer chain under a scratch
/// directory; unmounting folds changes back into the layer's file map.
pub struct MemoryDriver {
    root: PathBuf,
    layers: Mutex<HashMap<String, LayerState>>,
    active_mounts: Mutex<HashMap<String, MountState>>,
    create_count: AtomicUsize,
    fail_removals: AtomicBool,
}

struct LayerState {
    parent: Option<String>,
    files: BTreeMap<String, Vec<u8>>,
}

struct MountState {
    path: PathBuf,
    snapshot: BTreeMap<String, Vec<u8>>,
}

impl MemoryDriver {
    /// Create a driver with scratch space for mount points under `root`.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            layers: Mutex::new(HashMap::new()),
            active_mounts: Mutex::new(HashMap::new()),
            create_count: AtomicUsize::new(0),
            fail_removals: AtomicBool::new(false),
        }
    }

    /// Make subsequent `remove` calls fail until cleared, for exercising
    /// the store's restore-on-failure paths.
    pub fn fail_removals(&self, fail: bool) {
        self.fail_removals.store(fail, Ordering::SeqCst);
    }

    /// Number of `create` calls observed.
    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    /// Number of layers currently allocated.
    pub fn layer_count(&self) -> usize {
        self.layers.lock().unwrap().len()
    }

    fn union_of(&self, id: &str) -> Result<BTreeMap<String, Vec<u8>>, DriverError> {
        let layers = self.layers.lock().unwrap();
        let mut chain = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(id) = current {
            let layer = layers
                .get(&id)
                .ok_or_else(|| DriverError::Backend(format!("unknown layer: {id}")))?;
            current = layer.parent.clone();
            chain.push(id);
        }
        let mut union = BTreeMap::new();
        for id in chain.iter().rev() {
            for (path, data) in &layers[id].files {
                union.insert(path.clone(), data.clone());
            }
        }
        Ok(union)
    }

    fn collect_files(
        base: &Path,
        dir: &Path,
        out: &mut BTreeMap<String, Vec<u8>>,
    ) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::collect_files(base, &path, out)?;
            } else {
                let rel = path
                    .strip_prefix(base)
                    .expect("walk stays under base")
                    .to_string_lossy()
                    .into_owned();
                out.insert(rel, std::fs::read(&path)?);
            }
        }
        Ok(())
    }
}

fn normalize(path: &str) -> String {
    path.strip_prefix("./")
        .unwrap_or(path)
        .trim_end_matches('/')
        .to_string()
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn exact_diff(&self) -> bool {
        false
    }

    fn create(&self, id: &str, parent: Option<&str>) -> Result<(), DriverError> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        self.layers.lock().unwrap().insert(
            id.to_string(),
            LayerState {
                parent: parent.map(String::from),
                files: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), DriverError> {
        if self.fail_removals.load(Ordering::SeqCst) {
            return Err(DriverError::Backend("removal failure injected".to_string()));
        }
        self.layers.lock().unwrap().remove(id);
        if let Some(mount) = self.active_mounts.lock().unwrap().remove(id) {
            let _ = std::fs::remove_dir_all(mount.path);
        }
        Ok(())
    }

    fn apply_diff(
        &self,
        id: &str,
        _parent: Option<&str>,
        diff: &mut dyn Read,
    ) -> Result<u64, DriverError> {
        let mut archive = tar::Archive::new(diff);
        let mut applied = 0u64;
        let mut files = Vec::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = normalize(&entry.path()?.to_string_lossy());
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            applied += data.len() as u64;
            files.push((path, data));
        }

        let mut layers = self.layers.lock().unwrap();
        let layer = layers
            .get_mut(id)
            .ok_or_else(|| DriverError::Backend(format!("unknown layer: {id}")))?;
        for (path, data) in files {
            layer.files.insert(path, data);
        }
        Ok(applied)
    }

    fn diff_size(&self, id: &str, _parent: Option<&str>) -> Result<u64, DriverError> {
        let layers = self.layers.lock().unwrap();
        let layer = layers
            .get(id)
            .ok_or_else(|| DriverError::Backend(format!("unknown layer: {id}")))?;
        Ok(layer.files.values().map(|data| data.len() as u64).sum())
    }

    fn mount(&self, id: &str, _label: &str) -> Result<PathBuf, DriverError> {
        let union = self.union_of(id)?;
        let path = self.root.join("mnt").join(id);
        std::fs::create_dir_all(&path)?;
        for (rel, data) in &union {
            let target = path.join(rel);
            if let Some(dir) = target.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&target, data)?;
        }
        self.active_mounts.lock().unwrap().insert(
            id.to_string(),
            MountState {
                path: path.clone(),
                snapshot: union,
            },
        );
        Ok(path)
    }

    fn unmount(&self, id: &str) -> Result<(), DriverError> {
        let mount = self
            .active_mounts
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| DriverError::Backend(format!("layer not mounted: {id}")))?;

        let mut found = BTreeMap::new();
        Self::collect_files(&mount.path, &mount.path, &mut found)?;

        let mut layers = self.layers.lock().unwrap();
        let layer = layers
            .get_mut(id)
            .ok_or_else(|| DriverError::Backend(format!("unknown layer: {id}")))?;
        for (rel, data) in found {
            if mount.snapshot.get(&rel) != Some(&data) {
                layer.files.insert(rel, data);
            }
        }
        drop(layers);

        std::fs::remove_dir_all(&mount.path)?;
        Ok(())
    }

    fn file_reader(&self, id: &str, path: &str) -> Result<Box<dyn Read + Send>, DriverError> {
        let layers = self.layers.lock().unwrap();
        let layer = layers
            .get(id)
            .ok_or_else(|| DriverError::Backend(format!("unknown layer: {id}")))?;
        let data = layer
            .files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| DriverError::Backend(format!("no such file in layer {id}: {path}")))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn status(&self) -> Vec<(String, String)> {
        vec![(
            "Allocated Layers".to_string(),
            self.layer_count().to_string(),
        )]
    }
}

/// An isolated store over a tempdir, with its driver exposed for
/// introspection. Metadata survives [`reopen`]; driver state lives as long
/// as the fixture.
///
/// [`reopen`]: TestStore::reopen
pub struct TestStore {
    _temp_dir: TempDir,
    metadata_root: PathBuf,
    driver: Arc<MemoryDriver>,
    store: LayerStore,
}

impl TestStore {
    /// Create a fresh isolated store.
    pub fn new() -> color_eyre::Result<Self> {
        let temp_dir = TempDir::new()?;
        let metadata_root = temp_dir.path().join("layerdb");
        let driver = Arc::new(MemoryDriver::new(temp_dir.path().join("driver")));
        let store = Self::open_store(&metadata_root, &driver)?;
        Ok(Self {
            _temp_dir: temp_dir,
            metadata_root,
            driver,
            store,
        })
    }

    fn open_store(
        metadata_root: &Path,
        driver: &Arc<MemoryDriver>,
    ) -> color_eyre::Result<LayerStore> {
        let mut drivers = DriverRegistry::new();
        drivers.insert(std::env::consts::OS, driver.clone());
        let metadata = FsMetadataStore::open(metadata_root)?;
        Ok(LayerStore::open(Box::new(metadata), drivers)?)
    }

    /// Drop the store and rebuild it from the same durable metadata and the
    /// same driver state, as a process restart would.
    pub fn reopen(self) -> color_eyre::Result<Self> {
        let Self {
            _temp_dir,
            metadata_root,
            driver,
            store,
        } = self;
        drop(store);
        let store = Self::open_store(&metadata_root, &driver)?;
        Ok(Self {
            _temp_dir,
            metadata_root,
            driver,
            store,
        })
    }

    /// The store under test.
    pub fn store(&self) -> &LayerStore {
        &self.store
    }

    /// The backing driver, for allocation assertions.
    pub fn driver(&self) -> &MemoryDriver {
        &self.driver
    }
}

impl std::fmt::Debug for TestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestStore")
            .field("metadata_root", &self.metadata_root)
            .finish()
    }
}

/// Build an uncompressed tar diff from `(path, content)` pairs.
pub fn tar_diff(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, path, *content)
            .expect("in-memory tar write");
    }
    builder.into_inner().expect("in-memory tar finish")
}

/// `sha256:<hex>` digest of a byte slice, for comparing against diff ids.
pub fn sha256_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
