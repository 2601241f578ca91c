//! Inode tree: file and directory nodes plus the file data plane.
//!
//! A [`Node`] is either a file or a directory. The tree owns children
//! strongly (via the directory map) and points back at parents weakly; the
//! root is its own parent. Each node's mutable state sits behind its own
//! `RwLock`, and the lock is always taken parent before child.
//!
//! File contents live in an ordered extent list. The write path rewrites
//! that list in place (splitting stored extents, growing or inserting memory
//! extents) and bumps a generation counter whenever the list's indexing
//! changes so that cached file pointers know to recompute themselves.

use crate::blob::{BlobBackend, BlobClient};
use crate::extent::{Extent, MAX_BLOCK_SIZE, MemExtent, StoredExtent};
use crate::vfs::dir::DirState;
use crate::vfs::error::FsError;
use crate::vfs::info::FileInfo;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// An offset into a file that is (usually) cheap to seek to: while
/// `repacked` matches the node's generation, `extent_idx`/`extent_off` name
/// the exact byte for `off`; otherwise they must be recomputed by scanning
/// the extent list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FilePointer {
    pub(crate) off: i64,
    pub(crate) extent_idx: usize,
    pub(crate) extent_off: usize,
    pub(crate) repacked: i64,
}

impl FilePointer {
    pub(crate) fn start() -> Self {
        Self {
            off: 0,
            extent_idx: 0,
            extent_off: 0,
            repacked: 0,
        }
    }

    /// A pointer at `off` whose extent coordinates are unknown and will be
    /// recomputed on next use.
    pub(crate) fn at(off: i64) -> Self {
        Self {
            off,
            extent_idx: 0,
            extent_off: 0,
            repacked: -1,
        }
    }
}

pub(crate) enum NodeKind<B: BlobBackend> {
    File(Arc<RwLock<FileState<B>>>),
    Dir(Arc<RwLock<DirState<B>>>),
}

/// One inode. `parent` never changes after creation; the blob handle is the
/// same client shared by the whole filesystem.
pub(crate) struct Node<B: BlobBackend> {
    pub(crate) parent: Weak<Node<B>>,
    pub(crate) blob: BlobClient<B>,
    pub(crate) kind: NodeKind<B>,
}

impl<B: BlobBackend> Node<B> {
    pub(crate) fn new_root(blob: BlobClient<B>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Node {
            parent: weak.clone(),
            blob,
            kind: NodeKind::Dir(Arc::new(RwLock::new(DirState {
                info: FileInfo::new_dir("."),
                inodes: HashMap::new(),
            }))),
        })
    }

    pub(crate) fn new_file(parent: &Arc<Node<B>>, name: &str) -> Arc<Self> {
        Arc::new(Node {
            parent: Arc::downgrade(parent),
            blob: parent.blob.clone(),
            kind: NodeKind::File(Arc::new(RwLock::new(FileState::new(name)))),
        })
    }

    pub(crate) fn new_dir(parent: &Arc<Node<B>>, name: &str) -> Arc<Self> {
        Arc::new(Node {
            parent: Arc::downgrade(parent),
            blob: parent.blob.clone(),
            kind: NodeKind::Dir(Arc::new(RwLock::new(DirState {
                info: FileInfo::new_dir(name),
                inodes: HashMap::new(),
            }))),
        })
    }

    pub(crate) fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir(_))
    }

    pub(crate) fn parent(&self) -> Option<Arc<Node<B>>> {
        self.parent.upgrade()
    }

    pub(crate) async fn stat(&self) -> FileInfo {
        match &self.kind {
            NodeKind::File(state) => state.read().await.info.clone(),
            NodeKind::Dir(state) => state.read().await.info.clone(),
        }
    }

    pub(crate) async fn size(&self) -> i64 {
        match &self.kind {
            NodeKind::File(state) => state.read().await.info.size,
            NodeKind::Dir(state) => state.read().await.info.size,
        }
    }

    /// Append a stored extent, extending the file. Used when materializing a
    /// file from its manifest segments.
    pub(crate) async fn append_extent(&self, se: StoredExtent<B>) {
        match &self.kind {
            NodeKind::File(state) => {
                let mut g = state.write().await;
                g.info.size += se.len() as i64;
                g.extents.push(Extent::Stored(se));
            }
            NodeKind::Dir(_) => panic!("append_extent on a directory"),
        }
    }
}

/// Mutable state of a file node. Callers hold the node's lock; these methods
/// never lock by themselves.
pub(crate) struct FileState<B: BlobBackend> {
    pub(crate) info: FileInfo,
    pub(crate) extents: Vec<Extent<B>>,
    /// Bytes currently held in memory extents.
    pub(crate) memsize: i64,
    /// Generation counter, bumped whenever extent indexing changes.
    pub(crate) repacked: i64,
}

impl<B: BlobBackend> FileState<B> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            info: FileInfo::new_file(name),
            extents: Vec::new(),
            memsize: 0,
            repacked: 0,
        }
    }

    /// Normalize `start` against the current extent list.
    ///
    /// A pointer past the end of the file clamps to exactly the end. After
    /// seeking, either `extent_idx == extents.len()` (end of file) or
    /// `extents[extent_idx].len() > extent_off`.
    pub(crate) fn seek(&self, start: FilePointer) -> FilePointer {
        let mut ptr = start;
        if ptr.off < 0 {
            // Meaningless; the caller reports the error.
            return ptr;
        }
        if ptr.off >= self.info.size {
            ptr.off = self.info.size;
            ptr.extent_idx = self.extents.len();
            ptr.extent_off = 0;
            ptr.repacked = self.repacked;
            return ptr;
        }
        if ptr.repacked == self.repacked {
            // extent_idx/extent_off still reflect off, but may have fallen
            // off the end of their extent.
            if ptr.extent_off >= self.extents[ptr.extent_idx].len() {
                ptr.extent_idx += 1;
                ptr.extent_off = 0;
            }
            return ptr;
        }
        // Recompute extent coordinates. 0 <= off < size is established
        // above, and size always equals the sum of extent lengths, so the
        // scan cannot run off the end.
        let mut off: i64 = 0;
        ptr.extent_idx = 0;
        ptr.extent_off = 0;
        while off < ptr.off {
            let ext_len = self.extents[ptr.extent_idx].len() as i64;
            if off + ext_len > ptr.off {
                ptr.extent_off = (ptr.off - off) as usize;
                break;
            }
            off += ext_len;
            ptr.extent_idx += 1;
        }
        ptr.repacked = self.repacked;
        ptr
    }

    /// Read from the pointer's position. `Ok(0)` with a non-empty buffer
    /// means end of data.
    pub(crate) async fn read(
        &self,
        p: &mut [u8],
        start: FilePointer,
    ) -> Result<(usize, FilePointer), FsError> {
        let mut ptr = self.seek(start);
        if ptr.off < 0 {
            return Err(FsError::NegativeOffset);
        }
        if ptr.extent_idx >= self.extents.len() {
            return Ok((0, ptr));
        }
        let (n, _at_end) = self.extents[ptr.extent_idx]
            .read_at(p, ptr.extent_off)
            .await?;
        if n > 0 {
            ptr.off += n as i64;
            ptr.extent_off += n;
            if ptr.extent_off == self.extents[ptr.extent_idx].len() {
                ptr.extent_idx += 1;
                ptr.extent_off = 0;
            }
        }
        Ok((n, ptr))
    }

    /// Write `p` at the pointer's position, restructuring the extent list as
    /// needed. Returns the bytes written (all of `p` unless an error stops
    /// the loop) and the advanced pointer.
    pub(crate) async fn write(
        &mut self,
        p: &[u8],
        start: FilePointer,
        blob: &BlobClient<B>,
    ) -> Result<(usize, FilePointer), FsError> {
        let mut ptr = self.seek(start);
        if ptr.off < 0 {
            return Err(FsError::NegativeOffset);
        }
        let mut written = 0usize;
        let mut rest = p;
        while !rest.is_empty() {
            let mut cando = rest.len().min(MAX_BLOCK_SIZE);
            // Rearrange/grow the extent list (shrinking cando if needed) so
            // that cando bytes can land in extents[ptr.extent_idx] at
            // ptr.extent_off.
            let cur = ptr.extent_idx;
            let cur_writable = cur < self.extents.len() && self.extents[cur].is_mem();
            let prev_appendable = cur > 0
                && self.extents[cur - 1].len() < MAX_BLOCK_SIZE
                && self.extents[cur - 1].is_mem();
            if ptr.extent_off > 0 && !cur_writable {
                // Split a stored extent.
                let max = self.extents[cur].len() - ptr.extent_off;
                if max <= cando {
                    // The write swallows the rest of cur: truncate it and
                    // put a fresh memory extent after it.
                    cando = max;
                    let left = self.extents[cur].slice(0, ptr.extent_off as isize);
                    self.extents[cur] = left;
                    let mut e = MemExtent::default();
                    e.truncate(cando);
                    self.memsize += cando as i64;
                    self.extents.insert(cur + 1, Extent::Mem(e));
                } else {
                    // The write ends inside cur: keep the left part, insert
                    // the memory extent, then the remainder of cur.
                    let right = self.extents[cur].slice(ptr.extent_off + cando, -1);
                    let left = self.extents[cur].slice(0, ptr.extent_off as isize);
                    self.extents[cur] = left;
                    let mut e = MemExtent::default();
                    e.truncate(cando);
                    self.memsize += cando as i64;
                    self.extents.insert(cur + 1, Extent::Mem(e));
                    self.extents.insert(cur + 2, right);
                }
                ptr.extent_idx += 1;
                ptr.extent_off = 0;
                self.repacked += 1;
                ptr.repacked += 1;
            } else if cur_writable {
                let fit = self.extents[cur].len() - ptr.extent_off;
                if fit < cando {
                    cando = fit;
                }
            } else {
                if prev_appendable {
                    // Shrink cando to what still fits in the previous extent.
                    let cangrow = MAX_BLOCK_SIZE - self.extents[cur - 1].len();
                    if cangrow < cando {
                        cando = cangrow;
                    }
                }

                if cur == self.extents.len() {
                    // Pointer is at EOF; the file grows.
                    self.info.size += cando as i64;
                } else {
                    let el = self.extents[cur].len();
                    if el <= cando {
                        // cando covers cur exactly; shrinking cando keeps
                        // every later extent at its effective position.
                        cando = el;
                        self.extents.remove(cur);
                    } else {
                        // Shrink cur by the bytes about to be written before
                        // it.
                        let s = self.extents[cur].slice(cando, -1);
                        self.extents[cur] = s;
                    }
                }

                if prev_appendable {
                    // Grow the previous extent and step the pointer back
                    // onto it.
                    let prev = cur - 1;
                    ptr.extent_idx -= 1;
                    let m = match &mut self.extents[prev] {
                        Extent::Mem(m) => m,
                        Extent::Stored(_) => unreachable!("appendable extent is stored"),
                    };
                    ptr.extent_off = m.len();
                    m.truncate(ptr.extent_off + cando);
                    self.memsize += cando as i64;
                    ptr.repacked += 1;
                    self.repacked += 1;
                } else {
                    let mut e = MemExtent::default();
                    e.truncate(cando);
                    self.memsize += cando as i64;
                    self.extents.insert(cur, Extent::Mem(e));
                    ptr.repacked += 1;
                    self.repacked += 1;
                }
            }

            // Copy the payload into the now-writable extent.
            match &mut self.extents[ptr.extent_idx] {
                Extent::Mem(m) => m.write_at(&rest[..cando], ptr.extent_off),
                Extent::Stored(_) => panic!("write target extent is not writable"),
            }
            written += cando;
            rest = &rest[cando..];

            ptr.off += cando as i64;
            ptr.extent_off += cando;
            if ptr.extent_off >= MAX_BLOCK_SIZE {
                self.prune_mem_extents(blob).await;
            }
            if self.extents[ptr.extent_idx].len() == ptr.extent_off {
                ptr.extent_off = 0;
                ptr.extent_idx += 1;
            }
        }
        self.info.touch();
        Ok((written, ptr))
    }

    /// Resize the file. Shrinking discards or narrows trailing extents;
    /// growing extends the last memory extent or appends fresh ones, zero
    /// filled.
    pub(crate) fn truncate(&mut self, size: i64) -> Result<(), FsError> {
        if size < 0 {
            return Err(FsError::NegativeOffset);
        }
        if size < self.info.size {
            let ptr = self.seek(FilePointer {
                off: size,
                extent_idx: 0,
                extent_off: 0,
                repacked: self.repacked - 1,
            });
            for e in &self.extents[ptr.extent_idx..] {
                if let Extent::Mem(m) = e {
                    self.memsize -= m.len() as i64;
                }
            }
            if ptr.extent_off == 0 {
                self.extents.truncate(ptr.extent_idx);
            } else {
                self.extents.truncate(ptr.extent_idx + 1);
                match &mut self.extents[ptr.extent_idx] {
                    Extent::Mem(m) => {
                        m.truncate(ptr.extent_off);
                        self.memsize += m.len() as i64;
                    }
                    stored => {
                        let s = stored.slice(0, ptr.extent_off as isize);
                        *stored = s;
                    }
                }
            }
            self.info.size = size;
            self.repacked += 1;
            self.info.touch();
            return Ok(());
        }
        while size > self.info.size {
            let mut grow = size - self.info.size;
            let last_growable = matches!(
                self.extents.last(),
                Some(Extent::Mem(m)) if m.len() < MAX_BLOCK_SIZE
            );
            if last_growable {
                // Growing in place changes the last extent's length, which
                // invalidates end-of-file pointers.
                self.repacked += 1;
            } else {
                self.extents.push(Extent::Mem(MemExtent::default()));
            }
            let m = match self.extents.last_mut() {
                Some(Extent::Mem(m)) => m,
                _ => unreachable!("last extent is growable"),
            };
            let maxgrow = (MAX_BLOCK_SIZE - m.len()) as i64;
            if maxgrow < grow {
                grow = maxgrow;
            }
            m.truncate(m.len() + grow as usize);
            self.info.size += grow;
            self.memsize += grow;
        }
        self.info.touch();
        Ok(())
    }

    /// Upload any memory extent that has reached the block size limit and
    /// swap it for a stored extent. Best effort: a failed upload keeps the
    /// extent buffered for a later attempt.
    pub(crate) async fn prune_mem_extents(&mut self, blob: &BlobClient<B>) {
        for idx in 0..self.extents.len() {
            let len = match &self.extents[idx] {
                Extent::Mem(m) if m.len() >= MAX_BLOCK_SIZE => m.len(),
                _ => continue,
            };
            let buf = match &mut self.extents[idx] {
                Extent::Mem(m) => std::mem::take(&mut m.buf),
                Extent::Stored(_) => unreachable!(),
            };
            match blob.put_block(&buf).await {
                Ok((locator, _replicas)) => {
                    tracing::trace!(locator = %locator, len, "pruned full memory extent");
                    self.memsize -= len as i64;
                    self.extents[idx] = Extent::Stored(StoredExtent::new(
                        blob.clone(),
                        locator,
                        len,
                        0,
                        len,
                    ));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "block upload failed; keeping extent in memory");
                    match &mut self.extents[idx] {
                        Extent::Mem(m) => m.buf = buf,
                        Extent::Stored(_) => unreachable!(),
                    }
                }
            }
        }
    }
}
