//! Pack/flush engine: converts buffered memory extents into stored extents.
//!
//! Before a directory serializes, every memory extent in its direct files
//! must become a window into an uploaded block. Large buffers ship alone;
//! small ones from any number of files pack together into one block so a
//! directory of tiny files does not produce a block per file. Extent lengths
//! and positions never change here, so cached file pointers stay valid.

use crate::blob::{BlobBackend, BlobClient};
use crate::extent::{Extent, MAX_BLOCK_SIZE, StoredExtent};
use crate::vfs::dir::DirState;
use crate::vfs::error::FsError;
use crate::vfs::node::{FileState, NodeKind};
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;

/// One buffered extent awaiting upload, addressed by file index within the
/// locked set and extent index within that file.
struct ShortBlock {
    file: usize,
    idx: usize,
}

/// Flush all buffered data in the files directly under `dir`. The caller
/// holds the directory lock; every file lock is taken (in sorted name order)
/// and held until the sync completes, so no reader observes a half-rewritten
/// extent list.
pub(crate) async fn sync_dir<B: BlobBackend>(
    dir: &DirState<B>,
    blob: &BlobClient<B>,
) -> Result<(), FsError> {
    let mut names: Vec<&String> = dir.inodes.keys().collect();
    names.sort();
    let mut files: Vec<OwnedRwLockWriteGuard<FileState<B>>> = Vec::new();
    for name in names {
        if let NodeKind::File(state) = &dir.inodes[name].kind {
            files.push(Arc::clone(state).write_owned().await);
        }
    }

    let mut pending: Vec<ShortBlock> = Vec::new();
    let mut pending_len = 0usize;
    for file in 0..files.len() {
        for idx in 0..files[file].extents.len() {
            let len = match &files[file].extents[idx] {
                Extent::Mem(m) => m.len(),
                Extent::Stored(_) => continue,
            };
            if len > MAX_BLOCK_SIZE / 2 {
                // Big enough to be its own block.
                flush(&mut files, &[ShortBlock { file, idx }], blob).await?;
                continue;
            }
            if pending_len + len > MAX_BLOCK_SIZE {
                flush(&mut files, &pending, blob).await?;
                pending.clear();
                pending_len = 0;
            }
            pending.push(ShortBlock { file, idx });
            pending_len += len;
        }
    }
    flush(&mut files, &pending, blob).await
}

/// Upload one packed block made of the batch's buffers (in order) and point
/// each contributing extent at its window of that block.
async fn flush<B: BlobBackend>(
    files: &mut [OwnedRwLockWriteGuard<FileState<B>>],
    batch: &[ShortBlock],
    blob: &BlobClient<B>,
) -> Result<(), FsError> {
    if batch.is_empty() {
        return Ok(());
    }
    let total: usize = batch
        .iter()
        .map(|sb| files[sb.file].extents[sb.idx].len())
        .sum();
    let mut block: Vec<u8> = Vec::with_capacity(total);
    for sb in batch {
        match &files[sb.file].extents[sb.idx] {
            Extent::Mem(m) => block.extend_from_slice(&m.buf),
            Extent::Stored(_) => panic!("flush batch entry is not a memory extent"),
        }
    }
    let (locator, _replicas) = blob.put_block(&block).await.map_err(FsError::BlobIo)?;
    tracing::trace!(locator = %locator, len = block.len(), extents = batch.len(), "flushed packed block");
    let mut off = 0usize;
    for sb in batch {
        let state = &mut files[sb.file];
        let len = state.extents[sb.idx].len();
        state.extents[sb.idx] = Extent::Stored(StoredExtent::new(
            blob.clone(),
            locator.clone(),
            block.len(),
            off,
            len,
        ));
        off += len;
        state.memsize -= len as i64;
    }
    Ok(())
}
