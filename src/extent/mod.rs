//! Extent model: the byte ranges a file is made of.
//!
//! A file is an ordered list of extents of two kinds:
//! - [`MemExtent`]: a growable buffer holding bytes that have been written
//!   but not yet uploaded.
//! - [`StoredExtent`]: an immutable window into a block held by the blob
//!   store, addressed as (locator, block size, offset, length).
//!
//! Both kinds answer `len`, `read_at`, and `slice`; only the memory kind can
//! be written or resized. The write and flush paths dispatch on the variant,
//! so the distinction stays a plain enum rather than a trait object.

use crate::blob::{BlobBackend, BlobClient};
use crate::vfs::error::FsError;

/// Largest block the store accepts, and therefore the largest buffer a
/// memory extent is allowed to grow to (64 MiB).
pub const MAX_BLOCK_SIZE: usize = 1 << 26;

/// Initial capacity for memory-extent buffers; growth quadruples from here.
const MEM_EXTENT_SEED: usize = 1024;

/// One contiguous byte range of a file.
pub(crate) enum Extent<B: BlobBackend> {
    Mem(MemExtent),
    Stored(StoredExtent<B>),
}

impl<B: BlobBackend> Extent<B> {
    pub(crate) fn len(&self) -> usize {
        match self {
            Extent::Mem(m) => m.len(),
            Extent::Stored(s) => s.len(),
        }
    }

    pub(crate) fn is_mem(&self) -> bool {
        matches!(self, Extent::Mem(_))
    }

    /// Narrow to a sub-range starting at `off`. A negative `len` means
    /// everything from `off` to the end.
    pub(crate) fn slice(&self, off: usize, len: isize) -> Extent<B> {
        match self {
            Extent::Mem(m) => Extent::Mem(m.slice(off, len)),
            Extent::Stored(s) => Extent::Stored(s.slice(off, len)),
        }
    }

    /// Read into `p` starting at `off` within this extent. Returns the byte
    /// count and whether the read ran into the end of the extent.
    pub(crate) async fn read_at(
        &self,
        p: &mut [u8],
        off: usize,
    ) -> Result<(usize, bool), FsError> {
        match self {
            Extent::Mem(m) => Ok(m.read_at(p, off)),
            Extent::Stored(s) => s.read_at(p, off).await,
        }
    }
}

/// Mutable in-memory extent.
#[derive(Default)]
pub(crate) struct MemExtent {
    pub(crate) buf: Vec<u8>,
}

impl MemExtent {
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn slice(&self, off: usize, len: isize) -> MemExtent {
        let length = if len < 0 {
            self.buf.len() - off
        } else {
            len as usize
        };
        let mut buf = vec![0u8; length];
        let n = self.buf.len().saturating_sub(off).min(length);
        buf[..n].copy_from_slice(&self.buf[off..off + n]);
        MemExtent { buf }
    }

    /// Resize the visible length to `n`.
    ///
    /// Growing past the current capacity reallocates to the next
    /// power-of-four step; shrinking zeroes the vacated tail so a later
    /// regrowth exposes zero bytes, never stale data.
    pub(crate) fn truncate(&mut self, n: usize) {
        if n > self.buf.capacity() {
            let mut newsize = MEM_EXTENT_SEED;
            while newsize < n {
                newsize <<= 2;
            }
            let mut newbuf = Vec::with_capacity(newsize);
            newbuf.extend_from_slice(&self.buf);
            newbuf.resize(n, 0);
            self.buf = newbuf;
        } else if n <= self.buf.len() {
            for b in &mut self.buf[n..] {
                *b = 0;
            }
            self.buf.truncate(n);
        } else {
            self.buf.resize(n, 0);
        }
    }

    /// Copy `p` into the buffer at `off`. The buffer must already be large
    /// enough; callers grow it first.
    pub(crate) fn write_at(&mut self, p: &[u8], off: usize) {
        if off + p.len() > self.buf.len() {
            panic!("overflowed extent");
        }
        self.buf[off..off + p.len()].copy_from_slice(p);
    }

    pub(crate) fn read_at(&self, p: &mut [u8], off: usize) -> (usize, bool) {
        if off > self.buf.len() {
            return (0, true);
        }
        let n = (self.buf.len() - off).min(p.len());
        p[..n].copy_from_slice(&self.buf[off..off + n]);
        (n, n < p.len())
    }
}

/// Immutable window into a stored block.
pub(crate) struct StoredExtent<B: BlobBackend> {
    pub(crate) client: BlobClient<B>,
    /// Full locator token, hints and all.
    pub(crate) locator: String,
    /// Total size of the underlying block.
    pub(crate) size: usize,
    /// Start of this window within the block.
    pub(crate) offset: usize,
    /// Window length.
    pub(crate) length: usize,
}

impl<B: BlobBackend> Clone for StoredExtent<B> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            locator: self.locator.clone(),
            size: self.size,
            offset: self.offset,
            length: self.length,
        }
    }
}

impl<B: BlobBackend> StoredExtent<B> {
    pub(crate) fn new(
        client: BlobClient<B>,
        locator: String,
        size: usize,
        offset: usize,
        length: usize,
    ) -> Self {
        Self {
            client,
            locator,
            size,
            offset,
            length,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.length
    }

    /// Narrow the window: advance the start by `n` and optionally clamp the
    /// length to `len` (negative keeps the remainder). The block itself is
    /// untouched.
    pub(crate) fn slice(&self, n: usize, len: isize) -> StoredExtent<B> {
        let mut se = self.clone();
        se.offset += n;
        se.length -= n;
        if len >= 0 && se.length > len as usize {
            se.length = len as usize;
        }
        se
    }

    pub(crate) async fn read_at(
        &self,
        p: &mut [u8],
        off: usize,
    ) -> Result<(usize, bool), FsError> {
        if off > self.length {
            return Ok((0, true));
        }
        let maxlen = self.length - off;
        if p.len() > maxlen {
            // Request runs past the window: satisfy what fits and report
            // end-of-data.
            let n = self
                .client
                .read_at(&self.locator, &mut p[..maxlen], off + self.offset)
                .await
                .map_err(FsError::BlobIo)?;
            Ok((n, true))
        } else {
            let n = self
                .client
                .read_at(&self.locator, p, off + self.offset)
                .await
                .map_err(FsError::BlobIo)?;
            Ok((n, false))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[test]
    fn test_mem_truncate_grows_zeroed() {
        let mut m = MemExtent::default();
        m.truncate(5);
        assert_eq!(m.len(), 5);
        assert!(m.buf.iter().all(|&b| b == 0));
        assert!(m.buf.capacity() >= MEM_EXTENT_SEED);
    }

    #[test]
    fn test_mem_truncate_zeroes_tail_on_shrink() {
        let mut m = MemExtent::default();
        m.truncate(4);
        m.write_at(b"abcd", 0);
        m.truncate(2);
        m.truncate(4);
        assert_eq!(&m.buf, &[b'a', b'b', 0, 0]);
    }

    #[test]
    fn test_mem_growth_steps_power_of_four() {
        let mut m = MemExtent::default();
        m.truncate(MEM_EXTENT_SEED + 1);
        assert!(m.buf.capacity() >= MEM_EXTENT_SEED * 4);
    }

    #[test]
    #[should_panic(expected = "overflowed extent")]
    fn test_mem_write_past_end_panics() {
        let mut m = MemExtent::default();
        m.truncate(2);
        m.write_at(b"abc", 0);
    }

    #[test]
    fn test_mem_read_at() {
        let mut m = MemExtent::default();
        m.truncate(3);
        m.write_at(b"xyz", 0);
        let mut buf = [0u8; 8];
        let (n, eof) = m.read_at(&mut buf, 1);
        assert_eq!((n, eof), (2, true));
        assert_eq!(&buf[..2], b"yz");

        let (n, eof) = m.read_at(&mut buf[..2], 0);
        assert_eq!((n, eof), (2, false));
    }

    #[tokio::test]
    async fn test_stored_slice_and_read() {
        let client = BlobClient::new(MemoryBlobStore::new());
        let (locator, _) = client.put_block(b"hello world").await.unwrap();
        let se = StoredExtent::new(client, locator, 11, 0, 11);

        let narrowed = se.slice(6, -1);
        assert_eq!(narrowed.offset, 6);
        assert_eq!(narrowed.len(), 5);

        let clamped = se.slice(2, 3);
        assert_eq!(clamped.offset, 2);
        assert_eq!(clamped.len(), 3);

        let mut buf = [0u8; 5];
        let (n, eof) = narrowed.read_at(&mut buf, 0).await.unwrap();
        assert_eq!((n, eof), (5, false));
        assert_eq!(&buf, b"world");

        // Reading past the window clamps and reports end-of-data.
        let mut big = [0u8; 16];
        let (n, eof) = narrowed.read_at(&mut big, 1).await.unwrap();
        assert_eq!((n, eof), (4, true));
        assert_eq!(&big[..4], b"orld");
    }
}
