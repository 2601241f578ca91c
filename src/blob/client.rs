//! Client wrapper over pluggable blob backends.

use async_trait::async_trait;
use std::sync::Arc;

/// Storage backend for immutable content-addressed blocks.
///
/// Locators have the form `<hex-md5>+<size>[+hint]*`. Only the `+<size>`
/// field is ever interpreted by this crate; any trailing hints are opaque and
/// must be preserved by the backend.
#[async_trait]
pub trait BlobBackend: Send + Sync + 'static {
    /// Upload one block, returning its locator and the number of replicas
    /// written.
    async fn put_block(&self, data: &[u8]) -> anyhow::Result<(String, usize)>;

    /// Read into `buf` starting at `offset` within the block named by
    /// `locator`. Returns the number of bytes read.
    async fn read_at(
        &self,
        locator: &str,
        buf: &mut [u8],
        offset: usize,
    ) -> anyhow::Result<usize>;
}

/// Cheaply cloneable handle to a backend, shared by every node and stored
/// extent of one filesystem.
pub struct BlobClient<B> {
    backend: Arc<B>,
}

impl<B> Clone for BlobClient<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: BlobBackend> BlobClient<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub async fn put_block(&self, data: &[u8]) -> anyhow::Result<(String, usize)> {
        self.backend.put_block(data).await
    }

    pub async fn read_at(
        &self,
        locator: &str,
        buf: &mut [u8],
        offset: usize,
    ) -> anyhow::Result<usize> {
        self.backend.read_at(locator, buf, offset).await
    }
}

/// Extract the `+<size>` field of a locator. Returns `None` when the field is
/// missing, negative, or does not fit 32 bits; the rest of the token is not
/// validated.
pub fn locator_size(locator: &str) -> Option<u64> {
    let mut parts = locator.splitn(3, '+');
    parts.next()?;
    let size = parts.next()?;
    match size.parse::<i32>() {
        Ok(v) if v >= 0 => Some(v as u64),
        _ => None,
    }
}
