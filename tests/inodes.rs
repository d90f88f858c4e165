//! Inode model scenarios: the file state machine, directory mutations,
//! unload/reload, and takeover

mod common;

use common::{mount_at, read_path, root_names, test_config, write_root_file};
use revfs::checkout::CheckoutMode;
use revfs::error::Error;
use revfs::inode::file::{DesiredAttr, ReadLinkCache};
use revfs::inode::InodeNumber;
use revfs::mount::RevMount;
use revfs::store::{content_sha1, EntryKind, MemoryStore};
use std::sync::Arc;

#[tokio::test]
async fn written_bytes_read_back_until_next_write() {
    let fx = mount_at(&[("a", "0123456789")]).await;
    let inode = fx.mount.root().get_or_load_child("a").await.unwrap();
    let file = inode.as_file().unwrap();

    // Overwrite the middle; the rest of the blob content survives the
    // transition to the overlay.
    file.write(3, b"XYZ").await.unwrap();
    assert_eq!(&file.read(0, 100).await.unwrap()[..], b"012XYZ6789");
    assert_eq!(&file.read(3, 3).await.unwrap()[..], b"XYZ");

    file.write(8, b"!!!!").await.unwrap();
    assert_eq!(&file.read(0, 100).await.unwrap()[..], b"012XYZ67!!!!");

    // Past-EOF reads return empty.
    assert!(file.read(100, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn truncate_to_zero_skips_the_blob_fetch() {
    let fx = mount_at(&[("a", "content")]).await;
    let inode = fx.mount.root().get_or_load_child("a").await.unwrap();
    let file = inode.as_file().unwrap();

    let attr = file
        .set_attr(DesiredAttr {
            size: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(attr.size, 0);
    assert!(file.is_materialized());
    assert!(file.read(0, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn sha1_cache_tracks_writes() {
    let fx = mount_at(&[("a", "hello")]).await;
    let inode = fx.mount.root().get_or_load_child("a").await.unwrap();
    let file = inode.as_file().unwrap();

    // Unmaterialized: the store's digest for the blob.
    assert_eq!(file.get_sha1().await.unwrap(), content_sha1(b"hello"));

    file.write(0, b"jello").await.unwrap();
    assert_eq!(file.get_sha1().await.unwrap(), content_sha1(b"jello"));

    // is_same_as against the old blob flips with content.
    let blob_hash = fx.store.add_blob("hello");
    assert!(!file
        .is_same_as(blob_hash, EntryKind::RegularFile)
        .await
        .unwrap());
    file.write(0, b"hello").await.unwrap();
    assert!(file
        .is_same_as(blob_hash, EntryKind::RegularFile)
        .await
        .unwrap());
    // A kind mismatch is never "same".
    assert!(!file
        .is_same_as(blob_hash, EntryKind::ExecutableFile)
        .await
        .unwrap());
}

#[tokio::test]
async fn symlink_content_is_its_target() {
    let fx = mount_at(&[]).await;
    fx.mount
        .root()
        .symlink("link", "target/path")
        .await
        .unwrap();

    let inode = fx.mount.root().get_or_load_child("link").await.unwrap();
    let file = inode.as_file().unwrap();
    assert_eq!(file.kind(), EntryKind::Symlink);
    assert_eq!(
        &file.read_link(ReadLinkCache::Keep).await.unwrap()[..],
        b"target/path"
    );

    // A regular file is not a symlink.
    fx.mount
        .root()
        .create("plain", EntryKind::RegularFile.initial_mode(), b"x")
        .await
        .unwrap();
    let plain = fx.mount.root().get_or_load_child("plain").await.unwrap();
    assert!(matches!(
        plain.as_file().unwrap().read_link(ReadLinkCache::Keep).await,
        Err(Error::NotASymlink(_))
    ));
}

#[tokio::test]
async fn unlink_drops_overlay_data() {
    let fx = mount_at(&[("a", "1")]).await;
    write_root_file(&fx, "a", b"dirty").await;

    let ino = fx
        .mount
        .root()
        .readdir(0)
        .into_iter()
        .find(|e| e.name == "a")
        .unwrap()
        .ino;
    assert!(fx.mount.context().overlay.has_data(ino));

    fx.mount.root().unlink("a").await.unwrap();
    assert!(root_names(&fx).is_empty());
    assert!(!fx.mount.context().overlay.has_data(ino));

    assert!(matches!(
        fx.mount.root().unlink("a").await,
        Err(Error::NoEntry(_))
    ));
}

#[tokio::test]
async fn rmdir_requires_empty_directory() {
    let fx = mount_at(&[("d/x", "1")]).await;

    assert!(matches!(
        fx.mount.root().rmdir("d").await,
        Err(Error::NotEmpty(_))
    ));
    assert!(matches!(
        fx.mount.root().rmdir("missing").await,
        Err(Error::NoEntry(_))
    ));
    // rmdir on a file and unlink on a dir are type errors.
    fx.mount
        .root()
        .create("f", EntryKind::RegularFile.initial_mode(), b"")
        .await
        .unwrap();
    assert!(matches!(
        fx.mount.root().rmdir("f").await,
        Err(Error::NotADirectory(_))
    ));
    assert!(matches!(
        fx.mount.root().unlink("d").await,
        Err(Error::IsADirectory(_))
    ));

    let d = fx.mount.root().get_or_load_child("d").await.unwrap();
    d.as_tree().unwrap().unlink("x").await.unwrap();
    fx.mount.root().rmdir("d").await.unwrap();
    assert_eq!(root_names(&fx), ["f"]);
}

#[tokio::test]
async fn rename_moves_entries_across_directories() {
    let fx = mount_at(&[("a", "1"), ("d/x", "2")]).await;
    let root = fx.mount.root().clone();
    let d = root
        .get_or_load_child("d")
        .await
        .unwrap()
        .as_tree()
        .unwrap()
        .clone();

    // Same-directory rename.
    root.rename("a", &root, "a2").await.unwrap();
    assert_eq!(root_names(&fx), ["a2", "d"]);
    assert_eq!(read_path(&fx, "a2").await, b"1");

    // Cross-directory move.
    root.rename("a2", &d, "moved").await.unwrap();
    assert_eq!(root_names(&fx), ["d"]);
    assert_eq!(read_path(&fx, "d/moved").await, b"1");

    // Replacing an existing file destination.
    d.rename("moved", &d, "x").await.unwrap();
    assert_eq!(read_path(&fx, "d/x").await, b"1");

    // A directory destination must be empty.
    root.mkdir("sub", EntryKind::Tree.initial_mode()).await.unwrap();
    assert!(matches!(
        root.rename("sub", &root, "d").await,
        Err(Error::NotEmpty(_))
    ));
}

#[tokio::test]
async fn mkdir_then_create_materializes_up_to_root() {
    let fx = mount_at(&[("keep", "k")]).await;
    let root = fx.mount.root().clone();

    let sub = root
        .mkdir("sub", EntryKind::Tree.initial_mode())
        .await
        .unwrap();
    let sub = sub.as_tree().unwrap();
    sub.create("f", EntryKind::RegularFile.initial_mode(), b"data")
        .await
        .unwrap();

    // Both directories have overlay rows now.
    let overlay = &fx.mount.context().overlay;
    assert!(overlay.has_data(root.ino()));
    assert!(overlay.has_data(sub.ino()));
    assert_eq!(read_path(&fx, "sub/f").await, b"data");

    assert!(matches!(
        root.mkdir("sub", EntryKind::Tree.initial_mode()).await,
        Err(Error::EntryExists(_))
    ));
}

#[tokio::test]
async fn materialized_state_survives_remount() {
    let state;
    let store = Arc::new(MemoryStore::new());
    let commit = store.commit_from_files(&[("a", "1"), ("d/x", "2")]);
    {
        let fx_state = tempfile::TempDir::new().unwrap();
        let config = test_config(&fx_state);
        let mount = RevMount::new(&config, store.clone())
            .await
            .unwrap();
        mount.start().unwrap();
        mount.checkout(commit, CheckoutMode::Normal).await.unwrap();

        // Dirty one file, then shut down cleanly.
        let a = mount.root().get_or_load_child("a").await.unwrap();
        a.as_file().unwrap().write(0, b"X").await.unwrap();
        mount.shutdown(false).await.unwrap();
        state = fx_state;
    }

    let config = test_config(&state);
    let mount = RevMount::new(&config, store.clone())
        .await
        .unwrap();
    mount.start().unwrap();

    assert_eq!(mount.parent_commits().await, vec![commit]);
    let a = mount.root().get_or_load_child("a").await.unwrap();
    assert_eq!(&a.as_file().unwrap().read(0, 10).await.unwrap()[..], b"X");
    // The untouched subtree is still served from the store.
    let d = mount.root().get_or_load_child("d").await.unwrap();
    let x = d.as_tree().unwrap().get_or_load_child("x").await.unwrap();
    assert_eq!(&x.as_file().unwrap().read(0, 10).await.unwrap()[..], b"2");

    mount.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn takeover_preserves_inode_numbers_and_lookup_counts() {
    let state = tempfile::TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let commit = store.commit_from_files(&[("a", "1"), ("d/x", "2")]);

    let config = test_config(&state);
    let mount = RevMount::new(&config, store.clone())
        .await
        .unwrap();
    mount.start().unwrap();
    mount.checkout(commit, CheckoutMode::Normal).await.unwrap();

    let a = mount.root().get_or_load_child("a").await.unwrap();
    let a_ino = a.ino();
    mount.context().map.inc_lookup(a_ino, 2);
    drop(a);

    let takeover = mount.shutdown(true).await.unwrap().unwrap();

    let mount = RevMount::new_from_takeover(&config, store.clone(), &takeover)
        .await
        .unwrap();
    mount.start().unwrap();

    // The inherited number resolves to the same file.
    assert_eq!(mount.context().map.lookup_count(a_ino), 2);
    let resolved = mount.context().lookup_inode(a_ino).await.unwrap();
    assert_eq!(resolved.ino(), a_ino);
    assert_eq!(
        &resolved.as_file().unwrap().read(0, 10).await.unwrap()[..],
        b"1"
    );

    // Allocations continue above everything handed over.
    let next = mount.context().overlay.allocate_inode_number();
    assert!(next > a_ino);

    mount.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn forget_drops_unloaded_descriptors() {
    let fx = mount_at(&[("a", "1")]).await;
    let map = &fx.mount.context().map;

    let a = fx.mount.root().get_or_load_child("a").await.unwrap();
    let ino = a.ino();
    map.inc_lookup(ino, 3);
    assert_eq!(map.lookup_count(ino), 3);

    map.forget(ino, 2);
    assert_eq!(map.lookup_count(ino), 1);
    map.forget(ino, 1);
    assert_eq!(map.lookup_count(ino), 0);

    // Unload is lazy: the inode is still resolvable until an unload pass.
    drop(a);
    assert!(map.get_loaded(ino).is_some());
    fx.mount.root().unload_unreferenced();
    assert!(map.get_loaded(ino).is_none());

    // The entry itself still resolves by name and gets the same number
    // back from its parent entry.
    let again = fx.mount.root().get_or_load_child("a").await.unwrap();
    assert_eq!(again.ino(), ino);
}

#[tokio::test]
async fn case_insensitive_lookup_is_opt_in() {
    let state = tempfile::TempDir::new().unwrap();
    let mut config = test_config(&state);
    config.overlay.case_sensitive = false;

    let store = Arc::new(MemoryStore::new());
    let commit = store.commit_from_files(&[("README", "r")]);
    let mount = RevMount::new(&config, store.clone())
        .await
        .unwrap();
    mount.start().unwrap();
    mount.checkout(commit, CheckoutMode::Normal).await.unwrap();

    let inode = mount.root().get_or_load_child("readme").await.unwrap();
    assert_eq!(&inode.as_file().unwrap().read(0, 4).await.unwrap()[..], b"r");
    assert!(matches!(
        mount.root().create("Readme", 0o100644, b"x").await,
        Err(Error::EntryExists(_))
    ));

    mount.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn rename_onto_itself_is_a_noop() {
    let fx = mount_at(&[("a", "1"), ("d/x", "2")]).await;
    let root = fx.mount.root().clone();

    // Dirty the file first so it has overlay data to lose.
    write_root_file(&fx, "a", b"dirty").await;
    let a_ino = root
        .readdir(0)
        .into_iter()
        .find(|e| e.name == "a")
        .unwrap()
        .ino;

    root.rename("a", &root, "a").await.unwrap();
    assert!(fx.mount.context().overlay.has_data(a_ino));
    assert_eq!(read_path(&fx, "a").await, b"dirty");

    // A populated directory renamed onto its own name succeeds too,
    // rather than failing with ENOTEMPTY against itself.
    root.rename("d", &root, "d").await.unwrap();
    assert_eq!(read_path(&fx, "d/x").await, b"2");
    assert_eq!(root_names(&fx), ["a", "d"]);
}

#[tokio::test]
async fn case_variant_rename_onto_itself_keeps_content() {
    let state = tempfile::TempDir::new().unwrap();
    let mut config = test_config(&state);
    config.overlay.case_sensitive = false;

    let store = Arc::new(MemoryStore::new());
    let commit = store.commit_from_files(&[("README", "r")]);
    let mount = RevMount::new(&config, store.clone()).await.unwrap();
    mount.start().unwrap();
    mount.checkout(commit, CheckoutMode::Normal).await.unwrap();

    let root = mount.root().clone();
    let file = root.get_or_load_child("README").await.unwrap();
    file.as_file().unwrap().write(0, b"R").await.unwrap();
    let ino = file.ino();
    assert!(mount.context().overlay.has_data(ino));

    // Under the case-insensitive opt-in both names resolve to the same
    // entry; the rename must not retire its overlay data.
    root.rename("readme", &root, "Readme").await.unwrap();
    assert!(mount.context().overlay.has_data(ino));
    let again = root.get_or_load_child("readme").await.unwrap();
    assert_eq!(&again.as_file().unwrap().read(0, 4).await.unwrap()[..], b"R");

    mount.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn concurrent_loads_share_one_fetch() {
    let fx = mount_at(&[("d/x", "1")]).await;
    let root = fx.mount.root().clone();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let root = root.clone();
        handles.push(tokio::spawn(async move {
            root.get_or_load_child("d").await.unwrap().ino()
        }));
    }
    let mut inos: Vec<InodeNumber> = Vec::new();
    for h in handles {
        inos.push(h.await.unwrap());
    }
    inos.dedup();
    assert_eq!(inos.len(), 1, "all loads resolved the same inode");
}

#[tokio::test]
async fn corrupt_overlay_data_surfaces_as_eio_but_stays_resolvable() {
    let fx = mount_at(&[("a", "1")]).await;
    write_root_file(&fx, "a", b"dirty").await;

    let ino = fx
        .mount
        .root()
        .readdir(0)
        .into_iter()
        .find(|e| e.name == "a")
        .unwrap()
        .ino;

    // Unload, then corrupt the overlay file behind the inode's back.
    fx.mount.root().unload_unreferenced();
    std::fs::write(fx.mount.context().overlay.path_for(ino), b"garbage").unwrap();

    let err = fx.mount.root().get_or_load_child("a").await.unwrap_err();
    assert!(matches!(err, Error::CorruptOverlay { .. }));
    assert_eq!(err.errno(), libc::EIO);

    // The entry is still there, so removal paths keep working.
    fx.mount.root().unlink("a").await.unwrap();
    assert!(root_names(&fx).is_empty());
}
