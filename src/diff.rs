//! Working-tree status walk
//!
//! Compares the live inode tree against a source-control tree and reports
//! added/removed/modified/ignored events to a callback. Unmaterialized
//! subtrees whose hash still matches are skipped without loading anything.

use crate::checkout::join_path;
use crate::error::Result;
use crate::inode::{DirEntry, EntryState, Inode, InodeContext, TreeInode};
use crate::store::{Tree, TreeEntry};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Receives one event per differing path
pub trait DiffCallback: Send + Sync {
    fn on_added(&self, path: &str);
    fn on_removed(&self, path: &str);
    fn on_modified(&self, path: &str);
    fn on_ignored(&self, path: &str);
}

/// Bucketed status result, as returned over the RPC surface
///
/// Locally-created paths land in `untracked`; the `added` bucket is
/// reserved for dirstate integration, which lives outside this crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffResult {
    pub untracked: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub ignored: Vec<String>,
}

impl DiffResult {
    pub fn is_clean(&self) -> bool {
        self.untracked.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
    }

    fn sort_all(&mut self) {
        self.untracked.sort();
        self.added.sort();
        self.removed.sort();
        self.modified.sort();
        self.ignored.sort();
    }
}

/// Collects callback events into a `DiffResult`
#[derive(Default)]
pub struct DiffCollector {
    result: Mutex<DiffResult>,
}

impl DiffCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(DiffCollector::default())
    }

    pub fn into_result(self: Arc<Self>) -> DiffResult {
        let mut result = std::mem::take(&mut *self.result.lock());
        result.sort_all();
        result
    }
}

impl DiffCallback for DiffCollector {
    fn on_added(&self, path: &str) {
        self.result.lock().untracked.push(path.to_string());
    }

    fn on_removed(&self, path: &str) {
        self.result.lock().removed.push(path.to_string());
    }

    fn on_modified(&self, path: &str) {
        self.result.lock().modified.push(path.to_string());
    }

    fn on_ignored(&self, path: &str) {
        self.result.lock().ignored.push(path.to_string());
    }
}

/// One parsed ignore pattern
#[derive(Debug, Clone)]
enum IgnorePattern {
    /// Matches a basename anywhere below the ignore file
    Name(String),
    /// Anchored to the ignore file's directory (leading `/`)
    Anchored(String),
    /// `*.ext`-style suffix match on the basename
    Suffix(String),
}

/// Patterns from one ignore file
#[derive(Debug, Clone, Default)]
pub struct IgnoreFile {
    patterns: Vec<IgnorePattern>,
    /// Directory the file lives in, repo-relative
    base: String,
}

impl IgnoreFile {
    /// Parse ignore-file text: one pattern per line, `#` comments
    pub fn parse(base: &str, text: &str) -> Self {
        let mut patterns = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_suffix('/').unwrap_or(line);
            if let Some(anchored) = line.strip_prefix('/') {
                patterns.push(IgnorePattern::Anchored(anchored.to_string()));
            } else if let Some(suffix) = line.strip_prefix('*') {
                patterns.push(IgnorePattern::Suffix(suffix.to_string()));
            } else {
                patterns.push(IgnorePattern::Name(line.to_string()));
            }
        }
        IgnoreFile {
            patterns,
            base: base.to_string(),
        }
    }

    fn matches(&self, path: &str, name: &str) -> bool {
        self.patterns.iter().any(|p| match p {
            IgnorePattern::Name(n) => n == name,
            IgnorePattern::Suffix(s) => name.ends_with(s.as_str()),
            IgnorePattern::Anchored(rel) => {
                let anchored = join_path(&self.base, rel);
                anchored == path
            }
        })
    }
}

/// Stack of ignore files from the root down to the current directory
#[derive(Debug, Clone, Default)]
pub struct IgnoreStack {
    files: Vec<IgnoreFile>,
}

impl IgnoreStack {
    pub fn new() -> Self {
        IgnoreStack::default()
    }

    pub fn push(&mut self, file: IgnoreFile) {
        self.files.push(file);
    }

    pub fn is_ignored(&self, path: &str, name: &str) -> bool {
        self.files.iter().any(|f| f.matches(path, name))
    }
}

/// Shared state of one status walk
pub struct DiffContext {
    pub callback: Arc<dyn DiffCallback>,
    pub inode_ctx: Arc<InodeContext>,
    /// Report ignored paths instead of silently skipping them
    pub list_ignored: bool,
}

const IGNORE_FILE_NAME: &str = ".gitignore";

impl TreeInode {
    /// Drive the status walk over this directory
    ///
    /// `is_ignored` marks that an ancestor directory already matched an
    /// ignore pattern; tracked entries are still diffed underneath it.
    pub fn diff(
        self: &Arc<TreeInode>,
        ctx: &Arc<DiffContext>,
        path: String,
        source: Option<Arc<Tree>>,
        ignore: IgnoreStack,
        is_ignored: bool,
    ) -> BoxFuture<'static, Result<()>> {
        let this = Arc::clone(self);
        let ctx = Arc::clone(ctx);
        Box::pin(async move {
            // An unmaterialized tree matching the source has no changes.
            if let Some(tree) = &source {
                if this.source_hash() == Some(tree.hash) {
                    return Ok(());
                }
            }

            let live = this.with_contents(|c| c.entries.clone());

            // Extend the ignore stack with this directory's ignore file.
            let mut ignore = ignore;
            if let Some(entry) = live.get(IGNORE_FILE_NAME) {
                if !entry.is_tree() {
                    match this.read_entry_bytes(IGNORE_FILE_NAME, entry).await {
                        Ok(text) => ignore.push(IgnoreFile::parse(
                            &path,
                            &String::from_utf8_lossy(&text),
                        )),
                        Err(e) => debug!("unreadable ignore file in {}: {}", path, e),
                    }
                }
            }

            let mut names: Vec<String> = live.keys().cloned().collect();
            if let Some(tree) = &source {
                for e in &tree.entries {
                    if !live.contains_key(&e.name) {
                        names.push(e.name.clone());
                    }
                }
                names.sort();
            }

            for name in names {
                let entry_path = join_path(&path, &name);
                let source_e = source.as_ref().and_then(|t| t.find(&name)).cloned();
                let live_e = live.get(&name).cloned();
                this.diff_one_entry(
                    &ctx,
                    &entry_path,
                    &name,
                    source_e,
                    live_e,
                    &ignore,
                    is_ignored,
                )
                .await?;
            }
            Ok(())
        })
    }

    async fn diff_one_entry(
        self: &Arc<TreeInode>,
        ctx: &Arc<DiffContext>,
        path: &str,
        name: &str,
        source_e: Option<TreeEntry>,
        live_e: Option<DirEntry>,
        ignore: &IgnoreStack,
        parent_ignored: bool,
    ) -> Result<()> {
        match (source_e, live_e) {
            (None, None) => Ok(()),
            (Some(_), None) => {
                ctx.callback.on_removed(path);
                Ok(())
            }
            (None, Some(live)) => {
                let ignored = parent_ignored || ignore.is_ignored(path, name);
                self.report_local_only(ctx, path, name, &live, ignore, ignored)
                    .await
            }
            (Some(source), Some(live)) => {
                match (source.kind.is_tree(), live.is_tree()) {
                    (true, true) => {
                        // Skip untouched subtrees without loading them.
                        if live.source_hash() == Some(source.hash) {
                            return Ok(());
                        }
                        let child = match self.get_or_load_child(name).await? {
                            Inode::Tree(t) => t,
                            Inode::File(_) => {
                                ctx.callback.on_modified(path);
                                return Ok(());
                            }
                        };
                        let sub = ctx.inode_ctx.store.get_tree(source.hash).await?;
                        child
                            .diff(ctx, path.to_string(), Some(sub), ignore.clone(), parent_ignored)
                            .await
                    }
                    (false, false) => {
                        let modified = match &live.state {
                            EntryState::ByHash(h) => {
                                *h != source.hash || live.kind() != source.kind
                            }
                            EntryState::Loaded(Inode::File(f)) => {
                                !f.is_same_as(source.hash, source.kind).await?
                            }
                            EntryState::Loaded(Inode::Tree(_)) => true,
                            EntryState::Materialized => {
                                match self.get_or_load_child(name).await? {
                                    Inode::File(f) => {
                                        !f.is_same_as(source.hash, source.kind).await?
                                    }
                                    Inode::Tree(_) => true,
                                }
                            }
                        };
                        if modified {
                            ctx.callback.on_modified(path);
                        }
                        Ok(())
                    }
                    // A local type swap reads as one modified path.
                    _ => {
                        ctx.callback.on_modified(path);
                        Ok(())
                    }
                }
            }
        }
    }

    /// An entry with no source counterpart: added, ignored, or (for a
    /// directory) a subtree of such entries
    fn report_local_only(
        self: &Arc<TreeInode>,
        ctx: &Arc<DiffContext>,
        path: &str,
        name: &str,
        live: &DirEntry,
        ignore: &IgnoreStack,
        ignored: bool,
    ) -> BoxFuture<'static, Result<()>> {
        let this = Arc::clone(self);
        let ctx = Arc::clone(ctx);
        let path = path.to_string();
        let name = name.to_string();
        let live = live.clone();
        let ignore = ignore.clone();
        Box::pin(async move {
            if !live.is_tree() {
                if ignored {
                    if ctx.list_ignored {
                        ctx.callback.on_ignored(&path);
                    }
                } else {
                    ctx.callback.on_added(&path);
                }
                return Ok(());
            }

            if ignored && !ctx.list_ignored {
                // Nothing under an ignored directory can surface.
                return Ok(());
            }

            let child = match this.get_or_load_child(&name).await? {
                Inode::Tree(t) => t,
                Inode::File(_) => {
                    ctx.callback.on_added(&path);
                    return Ok(());
                }
            };
            child
                .diff(&ctx, path, None, ignore, ignored)
                .await
        })
    }

    /// Read a child file entry's full content without keeping it loaded
    async fn read_entry_bytes(
        self: &Arc<TreeInode>,
        name: &str,
        entry: &DirEntry,
    ) -> Result<bytes::Bytes> {
        if let Some(hash) = entry.source_hash() {
            if entry.loaded_inode().is_none() {
                let blob = self.context().store.get_blob(hash).await?;
                return Ok(blob.bytes.clone());
            }
        }
        match self.get_or_load_child(name).await? {
            Inode::File(f) => f.read(0, usize::MAX).await,
            Inode::Tree(_) => Ok(bytes::Bytes::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_file_parsing_and_matching() {
        let f = IgnoreFile::parse("sub", "# comment\n*.log\nbuild/\n/anchored.txt\nnode_modules\n");
        assert!(f.matches("sub/x.log", "x.log"));
        assert!(f.matches("sub/deep/y.log", "y.log"));
        assert!(f.matches("sub/build", "build"));
        assert!(f.matches("sub/anchored.txt", "anchored.txt"));
        assert!(!f.matches("sub/deep/anchored.txt", "anchored.txt"));
        assert!(f.matches("sub/node_modules", "node_modules"));
        assert!(!f.matches("sub/src", "src"));
    }

    #[test]
    fn test_ignore_stack_layers() {
        let mut stack = IgnoreStack::new();
        stack.push(IgnoreFile::parse("", "*.tmp\n"));
        stack.push(IgnoreFile::parse("sub", "local\n"));
        assert!(stack.is_ignored("a.tmp", "a.tmp"));
        assert!(stack.is_ignored("sub/local", "local"));
        assert!(!stack.is_ignored("other", "other"));
    }

    #[test]
    fn test_diff_result_clean() {
        let mut r = DiffResult::default();
        assert!(r.is_clean());
        r.modified.push("a".into());
        assert!(!r.is_clean());
    }
}
