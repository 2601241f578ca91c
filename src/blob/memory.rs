//! In-memory blob backend for tests and local development.

use super::client::BlobBackend;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Content-addressed block store kept entirely in memory. Locators are
/// `hex(md5(data)) + "+" + len`, the same shape a real store hands back.
#[derive(Default)]
pub struct MemoryBlobStore {
    blocks: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Number of distinct blocks currently stored.
    pub async fn block_count(&self) -> usize {
        self.blocks.read().await.len()
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobStore {
    async fn put_block(&self, data: &[u8]) -> anyhow::Result<(String, usize)> {
        let locator = format!("{}+{}", hex::encode(Md5::digest(data)), data.len());
        self.blocks
            .write()
            .await
            .insert(locator.clone(), Bytes::copy_from_slice(data));
        Ok((locator, 1))
    }

    async fn read_at(
        &self,
        locator: &str,
        buf: &mut [u8],
        offset: usize,
    ) -> anyhow::Result<usize> {
        let guard = self.blocks.read().await;
        let block = guard
            .get(locator)
            .with_context(|| format!("block not found: {locator}"))?;
        if offset > block.len() {
            anyhow::bail!("offset {offset} beyond block {locator}");
        }
        let n = (block.len() - offset).min(buf.len());
        buf[..n].copy_from_slice(&block[offset..offset + n]);
        Ok(n)
    }
}
