//! Directory state and path-based tree operations.
//!
//! Paths are resolved component by component from a starting node: `.` and
//! empty components are skipped, `..` follows the parent back-reference, and
//! anything else is a child-map lookup. All structural changes to a
//! directory happen under its write lock, taken before any child lock.
//!
//! These operations take the node as an explicit `&Arc` because they mint
//! new references: children keep a weak pointer to their parent, and handles
//! keep a strong one to their inode.

use crate::blob::BlobBackend;
use crate::utils::path;
use crate::vfs::error::FsError;
use crate::vfs::flags::{
    O_ACCMODE, O_APPEND, O_CREATE, O_EXCL, O_RDONLY, O_RDWR, O_SYNC, O_TRUNC, O_WRONLY,
};
use crate::vfs::handle::Handle;
use crate::vfs::info::{FileInfo, MODE_DIR};
use crate::vfs::node::{Node, NodeKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Mutable state of a directory node. `info.size` counts direct children.
pub(crate) struct DirState<B: BlobBackend> {
    pub(crate) info: FileInfo,
    pub(crate) inodes: HashMap<String, Arc<Node<B>>>,
}

impl<B: BlobBackend> Node<B> {
    /// Walk a slash-separated path from `start`. Returns `None` when any
    /// step misses or descends into a non-directory.
    pub(crate) async fn lookup_path(
        start: &Arc<Node<B>>,
        path: &str,
    ) -> Option<Arc<Node<B>>> {
        let mut node = Arc::clone(start);
        for name in path.split('/') {
            let dir = match &node.kind {
                NodeKind::Dir(d) => Arc::clone(d),
                NodeKind::File(_) => return None,
            };
            if name == "." || name.is_empty() {
                continue;
            }
            if name == ".." {
                node = node.parent()?;
                continue;
            }
            match dir.read().await.inodes.get(name) {
                Some(child) => node = Arc::clone(child),
                None => return None,
            }
        }
        Some(node)
    }

    /// Open (and possibly create) the file or directory at `name`, relative
    /// to `dn`.
    pub(crate) async fn open_file(
        dn: &Arc<Node<B>>,
        name: &str,
        flags: u32,
        mode: u32,
    ) -> Result<Handle<B>, FsError> {
        if flags & O_SYNC != 0 {
            return Err(FsError::SyncNotSupported);
        }
        let (dirname, base) = path::split(name);
        let dnode = match Node::lookup_path(dn, dirname).await {
            Some(n) if n.is_dir() => n,
            _ => return Err(FsError::NotFound { path: name.into() }),
        };
        let (readable, writable) = match flags & O_ACCMODE {
            O_RDWR => (true, true),
            O_RDONLY => (true, false),
            O_WRONLY => (false, true),
            _ => return Err(FsError::InvalidFlags { flags }),
        };
        if !writable {
            // A directory can be opened via "foo/", "foo/." or "foo/..".
            match base {
                "." | "" => return Ok(Handle::new(dnode, readable, writable, false)),
                ".." => {
                    let parent = dnode
                        .parent()
                        .ok_or(FsError::NotFound { path: name.into() })?;
                    return Ok(Handle::new(parent, readable, writable, false));
                }
                _ => {}
            }
        }
        let ds = match &dnode.kind {
            NodeKind::Dir(d) => Arc::clone(d),
            NodeKind::File(_) => unreachable!("looked-up parent is a directory"),
        };
        let node = if flags & O_CREATE != 0 {
            let mut g = ds.write().await;
            match g.inodes.get(base) {
                Some(n) => {
                    if flags & O_EXCL != 0 {
                        return Err(FsError::AlreadyExists { path: name.into() });
                    }
                    Arc::clone(n)
                }
                None => {
                    let n = if mode & MODE_DIR != 0 {
                        Node::new_dir(&dnode, base)
                    } else {
                        Node::new_file(&dnode, base)
                    };
                    g.inodes.insert(base.to_string(), Arc::clone(&n));
                    g.info.size += 1;
                    tracing::debug!(name = %base, dir = mode & MODE_DIR != 0, "created inode");
                    n
                }
            }
        } else {
            let g = ds.read().await;
            match g.inodes.get(base) {
                Some(n) => {
                    if flags & O_EXCL != 0 {
                        return Err(FsError::AlreadyExists { path: name.into() });
                    }
                    Arc::clone(n)
                }
                None => return Err(FsError::NotFound { path: name.into() }),
            }
        };
        if flags & O_TRUNC != 0 && writable {
            if let NodeKind::File(state) = &node.kind {
                state.write().await.truncate(0)?;
            }
        }
        Ok(Handle::new(node, readable, writable, flags & O_APPEND != 0))
    }

    /// Remove the file or empty directory at `name`, relative to `dn`.
    pub(crate) async fn remove(dn: &Arc<Node<B>>, name: &str) -> Result<(), FsError> {
        let (dirname, base) = path::split(name);
        if base.is_empty() || base == "." || base == ".." {
            return Err(FsError::InvalidOperation);
        }
        let dnode = match Node::lookup_path(dn, dirname).await {
            Some(n) if n.is_dir() => n,
            _ => return Err(FsError::NotFound { path: name.into() }),
        };
        let ds = match &dnode.kind {
            NodeKind::Dir(d) => Arc::clone(d),
            NodeKind::File(_) => unreachable!(),
        };
        let mut g = ds.write().await;
        let child = match g.inodes.get(base) {
            Some(c) => Arc::clone(c),
            None => return Err(FsError::NotFound { path: name.into() }),
        };
        // Hold the child's lock through the unlink so a non-empty directory
        // cannot gain or lose entries mid-check.
        let child_guard = match &child.kind {
            NodeKind::Dir(cds) => {
                let cg = cds.read().await;
                if !cg.inodes.is_empty() {
                    return Err(FsError::DirectoryNotEmpty { path: name.into() });
                }
                Some(cg)
            }
            NodeKind::File(_) => None,
        };
        g.inodes.remove(base);
        g.info.size -= 1;
        drop(child_guard);
        tracing::debug!(name = %base, "removed inode");
        Ok(())
    }

    /// Snapshot of the children's metadata, sorted by name.
    pub(crate) async fn readdir(&self) -> Result<Vec<FileInfo>, FsError> {
        let ds = match &self.kind {
            NodeKind::Dir(d) => d,
            NodeKind::File(_) => return Err(FsError::InvalidOperation),
        };
        let g = ds.read().await;
        let mut out = Vec::with_capacity(g.inodes.len());
        for child in g.inodes.values() {
            out.push(child.stat().await);
        }
        out.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(out)
    }

    /// Create every ancestor directory of `name` (itself excluded), erroring
    /// when an intermediate component already exists as a file.
    pub(crate) async fn make_parent_dirs(root: &Arc<Node<B>>, name: &str) -> Result<(), FsError> {
        let mut dn = Arc::clone(root);
        let parts: Vec<&str> = name.split('/').collect();
        for part in &parts[..parts.len() - 1] {
            let f = Node::open_file(&dn, part, O_CREATE, MODE_DIR | 0o755).await?;
            let node = f.node_arc();
            if !node.is_dir() {
                return Err(FsError::AlreadyExists { path: (*part).into() });
            }
            dn = node;
        }
        Ok(())
    }

    /// Size and byte-accounting sums for a file node; test support for
    /// invariant checks.
    #[cfg(test)]
    pub(crate) async fn file_sums(&self) -> Option<(i64, i64, i64)> {
        match &self.kind {
            NodeKind::File(state) => {
                let g = state.read().await;
                let total: i64 = g.extents.iter().map(|e| e.len() as i64).sum();
                let mem: i64 = g
                    .extents
                    .iter()
                    .filter(|e| e.is_mem())
                    .map(|e| e.len() as i64)
                    .sum();
                Some((g.info.size, total, mem))
            }
            NodeKind::Dir(_) => None,
        }
    }
}
