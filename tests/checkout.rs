//! End-to-end checkout scenarios

mod common;

use common::{mount_at, read_path, root_names, same_tree_commit, write_root_file};
use revfs::checkout::{CheckoutMode, ConflictType};
use revfs::error::Error;
use revfs::store::EntryKind;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn clean_checkout_applies_diff_without_conflicts() {
    // S = {a:"1", b:"2"}  ->  T = {a:"1", c:"3"}
    let fx = mount_at(&[("a", "1"), ("b", "2")]).await;
    let target = fx.store.commit_from_files(&[("a", "1"), ("c", "3")]);

    let result = fx
        .mount
        .checkout(target, CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty(), "{:?}", result.conflicts);

    assert_eq!(root_names(&fx), ["a", "c"]);
    assert_eq!(read_path(&fx, "c").await, b"3");

    // `c` stays backed by its source-control blob: no overlay data.
    let c_ino = fx
        .mount
        .root()
        .readdir(0)
        .into_iter()
        .find(|e| e.name == "c")
        .unwrap()
        .ino;
    assert!(!fx.mount.context().overlay.has_data(c_ino));
}

#[tokio::test]
async fn modified_file_conflicts_then_force_overwrites() {
    let fx = mount_at(&[("a", "1")]).await;
    write_root_file(&fx, "a", b"X").await;
    assert_eq!(read_path(&fx, "a").await, b"X");

    let target = same_tree_commit(&fx).await;

    // NORMAL: one MODIFIED conflict, content untouched.
    let result = fx
        .mount
        .checkout(target, CheckoutMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].path, "a");
    assert_eq!(result.conflicts[0].kind, ConflictType::Modified);
    assert_eq!(read_path(&fx, "a").await, b"X");

    // FORCE: same conflict, but the working copy is overwritten.
    let target2 = same_tree_commit(&fx).await;
    let result = fx
        .mount
        .checkout(target2, CheckoutMode::Force)
        .await
        .unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].kind, ConflictType::Modified);
    assert_eq!(read_path(&fx, "a").await, b"1");
}

#[tokio::test]
async fn dry_run_reports_but_commits_nothing() {
    let fx = mount_at(&[("a", "1"), ("b", "2")]).await;
    let target = fx.store.commit_from_files(&[("a", "1")]);

    let result = fx
        .mount
        .checkout(target, CheckoutMode::DryRun)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty());

    // The tree and the parent commit are unchanged.
    assert_eq!(root_names(&fx), ["a", "b"]);
    assert_eq!(fx.mount.parent_commits().await, vec![fx.commit]);
    assert_eq!(fx.mount.journal().latest_seq(), 1);
}

#[tokio::test]
async fn directory_replaced_by_file() {
    // S = {d/x:"1"}  ->  T = {d:"file"}
    let fx = mount_at(&[("d/x", "1")]).await;
    // Load the subtree first so the walk has to descend rather than swap
    // the entry wholesale.
    assert_eq!(read_path(&fx, "d/x").await, b"1");

    let target = fx
        .store
        .commit_from_entries(&[("d", "file", EntryKind::RegularFile)]);
    let result = fx
        .mount
        .checkout(target, CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty(), "{:?}", result.conflicts);

    assert_eq!(root_names(&fx), ["d"]);
    assert_eq!(read_path(&fx, "d").await, b"file");
}

#[tokio::test]
async fn directory_replaced_by_file_blocks_on_modified_child() {
    let fx = mount_at(&[("d/x", "1")]).await;
    write_root_file_in(&fx, "d", "x", b"local").await;

    let target = fx
        .store
        .commit_from_entries(&[("d", "file", EntryKind::RegularFile)]);
    let result = fx
        .mount
        .checkout(target, CheckoutMode::Normal)
        .await
        .unwrap();

    let kinds: Vec<_> = result.conflicts.iter().map(|c| (c.path.as_str(), c.kind)).collect();
    assert!(kinds.contains(&("d/x", ConflictType::Modified)), "{:?}", kinds);
    assert!(
        kinds.contains(&("d", ConflictType::DirectoryNotEmpty)),
        "{:?}",
        kinds
    );
    // The modified file survives.
    assert_eq!(read_path(&fx, "d/x").await, b"local");
}

#[tokio::test]
async fn untracked_file_conflicts_and_force_removes() {
    // S = T = {}
    let fx = mount_at(&[]).await;
    fx.mount
        .root()
        .create("u", EntryKind::RegularFile.initial_mode(), b"u")
        .await
        .unwrap();

    let empty2 = same_tree_commit(&fx).await;
    let result = fx
        .mount
        .checkout(empty2, CheckoutMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].path, "u");
    assert_eq!(result.conflicts[0].kind, ConflictType::UntrackedAdded);
    assert_eq!(root_names(&fx), ["u"]);

    let empty3 = same_tree_commit(&fx).await;
    let result = fx
        .mount
        .checkout(empty3, CheckoutMode::Force)
        .await
        .unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert!(root_names(&fx).is_empty());
}

#[tokio::test]
async fn checkout_then_diff_is_clean() {
    let fx = mount_at(&[("a", "1"), ("d/x", "2"), ("d/y", "3")]).await;
    let target = fx
        .store
        .commit_from_files(&[("a", "changed"), ("d/x", "2"), ("e/z", "4")]);

    let result = fx
        .mount
        .checkout(target, CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty(), "{:?}", result.conflicts);

    let status = fx.mount.diff(target, false, true).await.unwrap();
    assert!(status.is_clean(), "{:?}", status);
    assert_eq!(read_path(&fx, "a").await, b"changed");
    assert_eq!(read_path(&fx, "e/z").await, b"4");
}

#[tokio::test]
async fn force_checkout_restores_everything() {
    let fx = mount_at(&[("a", "1"), ("d/x", "2")]).await;

    // Local damage: modify one file, add an untracked one, delete another.
    write_root_file(&fx, "a", b"dirty").await;
    fx.mount
        .root()
        .create("junk", EntryKind::RegularFile.initial_mode(), b"j")
        .await
        .unwrap();
    let d = fx
        .mount
        .root()
        .get_or_load_child("d")
        .await
        .unwrap();
    d.as_tree().unwrap().unlink("x").await.unwrap();

    let target = fx.store.commit_from_files(&[("a", "1"), ("d/x", "2")]);
    fx.mount
        .checkout(target, CheckoutMode::Force)
        .await
        .unwrap();

    let status = fx.mount.diff(target, false, true).await.unwrap();
    assert!(status.is_clean(), "{:?}", status);
    assert_eq!(read_path(&fx, "a").await, b"1");
    assert_eq!(read_path(&fx, "d/x").await, b"2");
    assert_eq!(root_names(&fx), ["a", "d"]);
}

#[tokio::test]
async fn concurrent_checkout_fails_with_checkout_in_progress() {
    let fx = mount_at(&[("a", "1")]).await;
    let target = fx.store.commit_from_files(&[("a", "2")]);

    // Park the first checkout inside the walk, while it holds the
    // parent-commit lock.
    let blocker = fx.mount.context().faults.block("inodeCheckout");

    let mount = Arc::clone(&fx.mount);
    let first = tokio::spawn(async move { mount.checkout(target, CheckoutMode::Normal).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = fx.mount.checkout(target, CheckoutMode::Normal).await;
    assert!(matches!(second, Err(Error::CheckoutInProgress)));

    fx.mount.context().faults.clear("inodeCheckout");
    blocker.release();
    let result = first.await.unwrap().unwrap();
    assert!(result.conflicts.is_empty());
    assert_eq!(read_path(&fx, "a").await, b"2");
}

#[tokio::test]
async fn diff_rejects_out_of_date_parent_when_enforced() {
    let fx = mount_at(&[("a", "1")]).await;
    let other = fx.store.commit_from_files(&[("a", "2")]);

    let err = fx.mount.diff(other, false, true).await.unwrap_err();
    assert!(matches!(err, Error::OutOfDateParent { .. }));

    // Without enforcement the same diff succeeds.
    let status = fx.mount.diff(other, false, false).await.unwrap();
    assert_eq!(status.modified, ["a"]);
}

#[tokio::test]
async fn diff_reports_untracked_modified_removed_and_ignored() {
    let fx = mount_at(&[(".gitignore", "*.log\n"), ("a", "1"), ("d/x", "2")]).await;

    write_root_file(&fx, "a", b"X").await;
    fx.mount
        .root()
        .create("new.txt", EntryKind::RegularFile.initial_mode(), b"n")
        .await
        .unwrap();
    fx.mount
        .root()
        .create("trace.log", EntryKind::RegularFile.initial_mode(), b"l")
        .await
        .unwrap();
    let d = fx.mount.root().get_or_load_child("d").await.unwrap();
    d.as_tree().unwrap().unlink("x").await.unwrap();

    let status = fx.mount.diff(fx.commit, true, true).await.unwrap();
    assert_eq!(status.modified, ["a"]);
    assert_eq!(status.untracked, ["new.txt"]);
    assert_eq!(status.removed, ["d/x"]);
    assert_eq!(status.ignored, ["trace.log"]);

    // Ignored files are skipped entirely unless asked for.
    let quiet = fx.mount.diff(fx.commit, false, true).await.unwrap();
    assert!(quiet.ignored.is_empty());
}

#[tokio::test]
async fn journal_records_checkout_transitions() {
    let fx = mount_at(&[("a", "1")]).await;
    write_root_file(&fx, "a", b"X").await;

    let target = fx.store.commit_from_files(&[("a", "1"), ("b", "2")]);
    let mut watch = fx.mount.journal().subscribe();

    fx.mount
        .checkout(target, CheckoutMode::Force)
        .await
        .unwrap();

    watch.changed().await.unwrap();
    let deltas = fx.mount.journal().deltas_since(1);
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].from, Some(fx.commit));
    assert_eq!(deltas[0].to, target);
    assert!(deltas[0].changed_paths.contains(&"b".to_string()));
    assert!(deltas[0].unclean_paths.contains(&"a".to_string()));
}

/// Write into a file one level below the root
async fn write_root_file_in(fx: &common::Fixture, dir: &str, name: &str, data: &[u8]) {
    let d = fx.mount.root().get_or_load_child(dir).await.unwrap();
    let f = d
        .as_tree()
        .unwrap()
        .get_or_load_child(name)
        .await
        .unwrap();
    let f = f.as_file().unwrap();
    f.set_attr(revfs::inode::file::DesiredAttr {
        size: Some(0),
        ..Default::default()
    })
    .await
    .unwrap();
    f.write(0, data).await.unwrap();
}
