//! Shared fixtures for integration tests
#![allow(dead_code)]

use revfs::checkout::CheckoutMode;
use revfs::mount::RevMount;
use revfs::store::{Hash, MemoryStore};
use revfs::Config;
use std::sync::Arc;
use tempfile::TempDir;

/// A mount over a fresh overlay with its working copy at `commit`
pub struct Fixture {
    pub mount: Arc<RevMount>,
    pub store: Arc<MemoryStore>,
    pub commit: Hash,
    pub state: TempDir,
}

pub fn test_config(state: &TempDir) -> Config {
    let mut config = Config::default();
    config.state_dir = state.path().to_path_buf();
    // Keep lock-timeout failures fast in tests.
    config.checkout.lock_timeout_ms = 200;
    config
}

/// Mount an empty overlay and check out a commit built from `files`
pub async fn mount_at(files: &[(&str, &str)]) -> Fixture {
    let state = TempDir::new().unwrap();
    let config = test_config(&state);

    let store = Arc::new(MemoryStore::new());
    let commit = store.commit_from_files(files);

    let mount = RevMount::new(&config, store.clone())
        .await
        .unwrap();
    mount.start().unwrap();
    let result = mount.checkout(commit, CheckoutMode::Normal).await.unwrap();
    assert!(
        result.conflicts.is_empty(),
        "initial checkout conflicted: {:?}",
        result.conflicts
    );

    Fixture {
        mount,
        store,
        commit,
        state,
    }
}

/// A fresh commit sharing the working copy's current root tree
pub async fn same_tree_commit(fixture: &Fixture) -> Hash {
    use revfs::store::ObjectStore;
    let root = fixture
        .store
        .get_commit_root(fixture.commit)
        .await
        .unwrap();
    fixture.store.add_commit(root)
}

/// Names in the root directory, sorted
pub fn root_names(fixture: &Fixture) -> Vec<String> {
    fixture
        .mount
        .root()
        .readdir(0)
        .into_iter()
        .map(|e| e.name)
        .collect()
}

/// Read a file's full content through the inode layer
pub async fn read_path(fixture: &Fixture, path: &str) -> Vec<u8> {
    let mut inode = revfs::inode::Inode::Tree(fixture.mount.root().clone());
    for part in path.split('/') {
        let tree = inode.as_tree().unwrap().clone();
        inode = tree.get_or_load_child(part).await.unwrap();
    }
    inode
        .as_file()
        .unwrap()
        .read(0, usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

/// Write bytes at offset 0 of a root-level file
pub async fn write_root_file(fixture: &Fixture, name: &str, data: &[u8]) {
    let inode = fixture
        .mount
        .root()
        .get_or_load_child(name)
        .await
        .unwrap();
    let file = inode.as_file().unwrap();
    file.set_attr(revfs::inode::file::DesiredAttr {
        size: Some(0),
        ..Default::default()
    })
    .await
    .unwrap();
    file.write(0, data).await.unwrap();
}
