//! End-to-end tests of the public surface against an exact-diff backend.
//!
//! The driver here keeps each layer's applied diff verbatim in memory, so
//! it can reproduce diffs natively and the store takes the exact-diff path
//! throughout (no structural index is recorded). The inexact path is
//! exercised by the integration-tests crate.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use strata::{
    Driver, DriverError, DriverRegistry, FsMetadataStore, LayerStore, StorageError,
};

/// Keeps applied diff bytes verbatim, keyed by opaque id.
struct ExactMemoryDriver {
    state: Mutex<HashMap<String, Vec<u8>>>,
    create_count: AtomicUsize,
}

impl ExactMemoryDriver {
    fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            create_count: AtomicUsize::new(0),
        }
    }

    fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    fn layer_count(&self) -> usize {
        self.state.lock().unwrap().len()
    }
}

impl Driver for ExactMemoryDriver {
    fn name(&self) -> &str {
        "exact-memory"
    }

    fn exact_diff(&self) -> bool {
        true
    }

    fn create(&self, id: &str, _parent: Option<&str>) -> Result<(), DriverError> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().insert(id.to_string(), Vec::new());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), DriverError> {
        self.state.lock().unwrap().remove(id);
        Ok(())
    }

    fn apply_diff(
        &self,
        id: &str,
        _parent: Option<&str>,
        diff: &mut dyn Read,
    ) -> Result<u64, DriverError> {
        let mut bytes = Vec::new();
        diff.read_to_end(&mut bytes)?;
        let len = bytes.len() as u64;
        self.state
            .lock()
            .unwrap()
            .insert(id.to_string(), bytes);
        Ok(len)
    }

    fn diff(&self, id: &str, _parent: Option<&str>) -> Result<Box<dyn Read + Send>, DriverError> {
        let bytes = self
            .state
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| DriverError::Backend(format!("unknown layer: {id}")))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn diff_size(&self, id: &str, _parent: Option<&str>) -> Result<u64, DriverError> {
        let state = self.state.lock().unwrap();
        let bytes = state
            .get(id)
            .ok_or_else(|| DriverError::Backend(format!("unknown layer: {id}")))?;
        Ok(bytes.len() as u64)
    }

    fn mount(&self, _id: &str, _label: &str) -> Result<PathBuf, DriverError> {
        Err(DriverError::Unsupported("mounting not backed by this driver"))
    }

    fn unmount(&self, _id: &str) -> Result<(), DriverError> {
        Ok(())
    }

    fn file_reader(&self, _id: &str, _path: &str) -> Result<Box<dyn Read + Send>, DriverError> {
        Err(DriverError::Unsupported("per-file access not needed"))
    }
}

struct Harness {
    _temp: tempfile::TempDir,
    driver: Arc<ExactMemoryDriver>,
    store: LayerStore,
}

fn harness() -> Harness {
    let temp = tempfile::tempdir().unwrap();
    let driver = Arc::new(ExactMemoryDriver::new());
    let mut drivers = DriverRegistry::new();
    drivers.insert(std::env::consts::OS, driver.clone());
    let metadata = FsMetadataStore::open(temp.path().join("layerdb")).unwrap();
    let store = LayerStore::open(Box::new(metadata), drivers).unwrap();
    Harness {
        _temp: temp,
        driver,
        store,
    }
}

fn tar_diff(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        header.set_cksum();
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

fn sha256_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[test]
fn register_computes_content_identity() {
    let h = harness();
    let diff = tar_diff(&[("etc/hosts", b"127.0.0.1 localhost\n")]);

    let layer = h.store.register(Cursor::new(diff.clone()), None, None).unwrap();

    assert_eq!(layer.diff_id().as_str(), sha256_of(&diff));
    // A base layer's chain id is its diff id.
    assert_eq!(layer.chain_id().as_str(), layer.diff_id().as_str());
    assert_eq!(layer.size(), diff.len() as u64);
    assert!(layer.parent().is_none());
    assert_eq!(h.store.diff_size(layer.chain_id()).unwrap(), diff.len() as u64);
}

#[test]
fn child_layer_identity_folds_in_ancestry() {
    let h = harness();
    let diff_a = tar_diff(&[("a.txt", b"a")]);
    let diff_b = tar_diff(&[("b.txt", b"b")]);

    let l1 = h.store.register(Cursor::new(diff_a), None, None).unwrap();
    let l2 = h
        .store
        .register(Cursor::new(diff_b.clone()), Some(l1.chain_id()), None)
        .unwrap();

    assert_eq!(l2.parent(), Some(l1.chain_id()));
    assert_eq!(l2.diff_id().as_str(), sha256_of(&diff_b));
    assert_ne!(l2.chain_id().as_str(), l2.diff_id().as_str());
}

#[test]
fn exact_driver_reproduces_diff_natively() {
    let h = harness();
    let diff = tar_diff(&[("bin/sh", b"#!/bin/sh\n"), ("etc/motd", b"welcome\n")]);

    let layer = h.store.register(Cursor::new(diff.clone()), None, None).unwrap();

    let mut reproduced = Vec::new();
    h.store
        .diff(layer.chain_id())
        .unwrap()
        .read_to_end(&mut reproduced)
        .unwrap();
    assert_eq!(reproduced, diff);
}

#[test]
fn duplicate_registration_converges_on_one_layer() {
    let h = harness();
    let diff = tar_diff(&[("same.txt", b"same content")]);

    let first = h.store.register(Cursor::new(diff.clone()), None, None).unwrap();
    let second = h.store.register(Cursor::new(diff), None, None).unwrap();

    assert_eq!(first.chain_id(), second.chain_id());
    // The loser's backend allocation was rolled back.
    assert_eq!(h.driver.layer_count(), 1);
    assert_eq!(h.driver.create_count(), 2);

    // Two handles, two releases: the second one removes the layer.
    assert!(h.store.release(&first).unwrap().is_empty());
    let removed = h.store.release(&second).unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(&removed[0].chain_id, first.chain_id());
    assert_eq!(h.driver.layer_count(), 0);
}

#[test]
fn release_without_retained_reference_fails() {
    let h = harness();
    let diff = tar_diff(&[("f", b"x")]);

    let layer = h.store.register(Cursor::new(diff), None, None).unwrap();
    h.store.release(&layer).unwrap();

    let err = h.store.release(&layer).unwrap_err();
    assert!(matches!(err, StorageError::LayerNotRetained(_)), "{err}");
}

#[test]
fn unknown_parent_is_rejected() {
    let h = harness();
    let ghost: strata::ChainId =
        "sha256:0000000000000000000000000000000000000000000000000000000000000000"
            .parse()
            .unwrap();
    let err = h
        .store
        .register(Cursor::new(tar_diff(&[])), Some(&ghost), None)
        .unwrap_err();
    assert!(matches!(err, StorageError::LayerNotFound(_)), "{err}");
}

#[test]
fn unsupported_platform_is_rejected() {
    let h = harness();
    let err = h
        .store
        .register(Cursor::new(tar_diff(&[])), None, Some("plan9"))
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidPlatform(_)), "{err}");
}

#[test]
fn store_reopens_from_durable_metadata() {
    let temp = tempfile::tempdir().unwrap();
    let driver = Arc::new(ExactMemoryDriver::new());
    let diff_a = tar_diff(&[("a", b"a")]);
    let diff_b = tar_diff(&[("b", b"b")]);

    let (chain_a, chain_b) = {
        let mut drivers = DriverRegistry::new();
        drivers.insert(std::env::consts::OS, driver.clone());
        let metadata = FsMetadataStore::open(temp.path().join("layerdb")).unwrap();
        let store = LayerStore::open(Box::new(metadata), drivers).unwrap();
        let l1 = store.register(Cursor::new(diff_a), None, None).unwrap();
        let l2 = store
            .register(Cursor::new(diff_b.clone()), Some(l1.chain_id()), None)
            .unwrap();
        (l1.chain_id().clone(), l2.chain_id().clone())
    };

    let mut drivers = DriverRegistry::new();
    drivers.insert(std::env::consts::OS, driver.clone());
    let metadata = FsMetadataStore::open(temp.path().join("layerdb")).unwrap();
    let store = LayerStore::open(Box::new(metadata), drivers).unwrap();

    assert_eq!(store.chain_ids().len(), 2);
    let l2 = store.get(&chain_b).unwrap();
    assert_eq!(l2.parent(), Some(&chain_a));
    assert_eq!(l2.diff_id().as_str(), sha256_of(&diff_b));

    let mut reproduced = Vec::new();
    store
        .diff(&chain_b)
        .unwrap()
        .read_to_end(&mut reproduced)
        .unwrap();
    assert_eq!(reproduced, diff_b);
}

#[test]
fn provenance_survives_registration_and_reopen() {
    let temp = tempfile::tempdir().unwrap();
    let driver = Arc::new(ExactMemoryDriver::new());
    let diff = tar_diff(&[("f", b"x")]);
    let provenance = strata::Provenance {
        media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
        digest: "sha256:cafef00d".to_string(),
        size: 512,
    };

    let chain = {
        let mut drivers = DriverRegistry::new();
        drivers.insert(std::env::consts::OS, driver.clone());
        let metadata = FsMetadataStore::open(temp.path().join("layerdb")).unwrap();
        let store = LayerStore::open(Box::new(metadata), drivers).unwrap();
        let layer = store
            .register_with_provenance(Cursor::new(diff), None, None, Some(provenance.clone()))
            .unwrap();
        assert_eq!(layer.provenance(), Some(&provenance));
        layer.chain_id().clone()
    };

    let mut drivers = DriverRegistry::new();
    drivers.insert(std::env::consts::OS, driver);
    let metadata = FsMetadataStore::open(temp.path().join("layerdb")).unwrap();
    let store = LayerStore::open(Box::new(metadata), drivers).unwrap();
    assert_eq!(store.get(&chain).unwrap().provenance(), Some(&provenance));
}

#[test]
fn driver_diagnostics_pass_through() {
    let h = harness();
    assert_eq!(h.store.driver_name(None).unwrap(), "exact-memory");
    assert!(h.store.driver_status(None).unwrap().is_empty());
}
