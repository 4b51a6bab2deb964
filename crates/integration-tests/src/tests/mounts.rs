//! Writable mounts: naming, holders, init-layer seeding, release cascades.

use std::io::Cursor;

use crate::fixture::{TestStore, tar_diff};
use crate::integration_test;
use strata::StorageError;

integration_test!(test_mount_names_are_unique_until_released, || {
    let fix = TestStore::new()?;
    let mount = fix.store().create_mount("c1", None, None, None)?;

    let err = fix
        .store()
        .create_mount("c1", None, None, None)
        .unwrap_err();
    assert!(matches!(err, StorageError::MountNameConflict(_)), "{err}");

    fix.store().release_mount(&mount)?;

    // The name is free again once fully released.
    let mount = fix.store().create_mount("c1", None, None, None)?;
    fix.store().release_mount(&mount)?;

    Ok(())
});

integration_test!(test_mount_holders_delay_removal, || {
    let fix = TestStore::new()?;
    let base = tar_diff(&[("base", b"b")]);
    let layer = fix.store().register(Cursor::new(base), None, None)?;

    let created = fix
        .store()
        .create_mount("c1", Some(layer.chain_id()), None, None)?;
    let held = fix.store().get_mount("c1")?;

    // Two holders: the first release is a no-op.
    assert!(fix.store().release_mount(&created)?.is_empty());

    // Still registered; probing takes and gives back another holder.
    let probe = fix.store().get_mount("c1")?;
    assert!(fix.store().release_mount(&probe)?.is_empty());

    // The last holder takes the mount down.
    fix.store().release_mount(&held)?;
    let err = fix.store().get_mount("c1").unwrap_err();
    assert!(matches!(err, StorageError::MountNotFound(_)), "{err}");

    Ok(())
});

integration_test!(test_get_mount_of_unknown_name_fails, || {
    let fix = TestStore::new()?;
    let err = fix.store().get_mount("nope").unwrap_err();
    assert!(matches!(err, StorageError::MountNotFound(_)), "{err}");
    Ok(())
});

integration_test!(test_init_layer_seeds_the_container_root, || {
    let fix = TestStore::new()?;
    let base = tar_diff(&[("etc/hosts", b"127.0.0.1 localhost\n")]);
    let layer = fix.store().register(Cursor::new(base), None, None)?;

    let seed = |path: &std::path::Path| {
        std::fs::create_dir_all(path.join("etc"))?;
        std::fs::write(path.join("etc/resolv.conf"), b"nameserver 10.0.0.1\n")
    };
    let mount = fix
        .store()
        .create_mount("c1", Some(layer.chain_id()), None, Some(&seed))?;

    // The mounted root unions parent, init layer, and the writable layer.
    let root = fix.store().mount(&mount, "")?;
    assert_eq!(
        std::fs::read(root.join("etc/hosts"))?,
        b"127.0.0.1 localhost\n"
    );
    assert_eq!(
        std::fs::read(root.join("etc/resolv.conf"))?,
        b"nameserver 10.0.0.1\n"
    );

    // Container-side writes land in the writable layer only.
    std::fs::write(root.join("added.txt"), b"written by container")?;
    fix.store().unmount(&mount)?;
    assert_eq!(
        fix.store().mount_size(&mount)?,
        b"written by container".len() as u64
    );

    // Releasing the mount removes the writable and init state; the parent
    // layer remains.
    fix.store().release_mount(&mount)?;
    assert_eq!(fix.driver().layer_count(), 1);
    assert!(fix.store().chain_ids().contains(layer.chain_id()));

    Ok(())
});

integration_test!(test_mount_with_empty_base, || {
    let fix = TestStore::new()?;
    let mount = fix.store().create_mount("scratch", None, None, None)?;

    let root = fix.store().mount(&mount, "")?;
    assert!(std::fs::read_dir(&root)?.next().is_none());
    std::fs::write(root.join("only.txt"), b"lonely")?;
    fix.store().unmount(&mount)?;

    assert_eq!(fix.store().mount_size(&mount)?, 6);
    assert!(fix.store().release_mount(&mount)?.is_empty());
    assert_eq!(fix.driver().layer_count(), 0);

    Ok(())
});

integration_test!(test_failed_release_keeps_the_mount_retryable, || {
    let fix = TestStore::new()?;
    let base = tar_diff(&[("base", b"b")]);
    let layer = fix.store().register(Cursor::new(base), None, None)?;
    let mount = fix
        .store()
        .create_mount("c1", Some(layer.chain_id()), None, None)?;
    fix.store().release(&layer)?;

    fix.driver().fail_removals(true);
    let err = fix.store().release_mount(&mount).unwrap_err();
    assert!(matches!(err, StorageError::Driver(_)), "{err}");

    // The release did not happen: the mount is still resolvable and its
    // chain is still alive.
    let held = fix.store().get_mount("c1")?;
    assert_eq!(fix.store().chain_ids().len(), 1);
    assert!(fix.store().release_mount(&held)?.is_empty());

    // With the backend healthy again the retry goes through and cascades.
    fix.driver().fail_removals(false);
    let removed = fix.store().release_mount(&mount)?;
    assert_eq!(removed.len(), 1);
    assert_eq!(&removed[0].chain_id, layer.chain_id());
    assert_eq!(fix.driver().layer_count(), 0);

    Ok(())
});

integration_test!(test_release_mount_cascades_into_parent_chain, || {
    let fix = TestStore::new()?;
    let diff_a = tar_diff(&[("a", b"a")]);
    let diff_b = tar_diff(&[("b", b"b")]);

    let l1 = fix.store().register(Cursor::new(diff_a), None, None)?;
    let l2 = fix
        .store()
        .register(Cursor::new(diff_b), Some(l1.chain_id()), None)?;
    let mount = fix.store().create_mount("c1", Some(l2.chain_id()), None, None)?;

    // Hand back both layer registration references; the mount keeps the
    // whole chain alive.
    assert!(fix.store().release(&l2)?.is_empty());
    assert!(fix.store().release(&l1)?.is_empty());
    assert_eq!(fix.store().chain_ids().len(), 2);

    // Releasing the mount removes the now-unreferenced chain, leaf first.
    let removed = fix.store().release_mount(&mount)?;
    assert_eq!(removed.len(), 2);
    assert_eq!(&removed[0].chain_id, l2.chain_id());
    assert_eq!(&removed[1].chain_id, l1.chain_id());
    assert!(fix.store().chain_ids().is_empty());
    assert_eq!(fix.driver().layer_count(), 0);

    Ok(())
});
