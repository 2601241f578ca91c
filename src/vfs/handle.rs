//! Open-file handles.
//!
//! A handle binds an inode to a file pointer plus the access mode it was
//! opened with. Handles are independent: each keeps its own position, and
//! dropping one never destroys the inode.

use crate::blob::BlobBackend;
use crate::vfs::error::FsError;
use crate::vfs::info::FileInfo;
use crate::vfs::node::{FilePointer, Node, NodeKind};
use std::io::SeekFrom;
use std::sync::Arc;

pub struct Handle<B: BlobBackend> {
    node: Arc<Node<B>>,
    ptr: FilePointer,
    readable: bool,
    writable: bool,
    append: bool,
    /// Remaining snapshot for chunked readdir, captured on first use.
    unreaddirs: Option<Vec<FileInfo>>,
}

impl<B: BlobBackend> Handle<B> {
    pub(crate) fn new(node: Arc<Node<B>>, readable: bool, writable: bool, append: bool) -> Self {
        Self {
            node,
            ptr: FilePointer::start(),
            readable,
            writable,
            append,
            unreaddirs: None,
        }
    }

    pub(crate) fn node_arc(&self) -> Arc<Node<B>> {
        Arc::clone(&self.node)
    }

    /// Read at the current position, advancing it. Returns `Ok(0)` at end of
    /// data.
    pub async fn read(&mut self, p: &mut [u8]) -> Result<usize, FsError> {
        if !self.readable {
            return Err(FsError::WriteOnlyFile);
        }
        match &self.node.kind {
            NodeKind::Dir(_) => Err(FsError::InvalidOperation),
            NodeKind::File(state) => {
                let g = state.read().await;
                let (n, ptr) = g.read(p, self.ptr).await?;
                self.ptr = ptr;
                Ok(n)
            }
        }
    }

    /// Write at the current position, advancing it. With `O_APPEND` the
    /// position first snaps to end of file under the write lock, so
    /// concurrent appenders serialize without interleaving.
    pub async fn write(&mut self, p: &[u8]) -> Result<usize, FsError> {
        if !self.writable {
            return Err(FsError::ReadOnlyFile);
        }
        match &self.node.kind {
            NodeKind::Dir(_) => Err(FsError::InvalidOperation),
            NodeKind::File(state) => {
                let mut g = state.write().await;
                if self.append {
                    self.ptr = FilePointer {
                        off: g.info.size,
                        extent_idx: g.extents.len(),
                        extent_off: 0,
                        repacked: g.repacked,
                    };
                }
                let (n, ptr) = g.write(p, self.ptr, &self.node.blob).await?;
                self.ptr = ptr;
                Ok(n)
            }
        }
    }

    /// Reposition the handle. The resulting offset is clamped to the current
    /// size; a negative result is an error and leaves the position alone.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<i64, FsError> {
        let size = self.node.size().await;
        let off = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(delta) => self.ptr.off + delta,
            SeekFrom::End(delta) => size + delta,
        };
        if off < 0 {
            return Err(FsError::NegativeOffset);
        }
        let off = off.min(size);
        if off != self.ptr.off {
            // Force the extent coordinates to be recomputed on next use.
            self.ptr = FilePointer::at(off);
        }
        Ok(self.ptr.off)
    }

    pub async fn truncate(&self, size: i64) -> Result<(), FsError> {
        match &self.node.kind {
            NodeKind::Dir(_) => Err(FsError::InvalidOperation),
            NodeKind::File(state) => state.write().await.truncate(size),
        }
    }

    pub async fn stat(&self) -> FileInfo {
        self.node.stat().await
    }

    pub async fn size(&self) -> i64 {
        self.node.size().await
    }

    /// List directory entries. `count <= 0` returns the whole current
    /// snapshot; a positive count drains a snapshot captured on the first
    /// chunked call, and an empty result signals end of data.
    pub async fn readdir(&mut self, count: isize) -> Result<Vec<FileInfo>, FsError> {
        if !self.node.is_dir() {
            return Err(FsError::InvalidOperation);
        }
        if count <= 0 {
            return self.node.readdir().await;
        }
        if self.unreaddirs.is_none() {
            self.unreaddirs = Some(self.node.readdir().await?);
        }
        let remaining = self.unreaddirs.as_mut().expect("snapshot just captured");
        if remaining.is_empty() {
            return Ok(Vec::new());
        }
        let take = (count as usize).min(remaining.len());
        Ok(remaining.drain(..take).collect())
    }
}
