//! Blob store boundary.
//!
//! The filesystem only ever asks two things of its store: write a whole block
//! and get back a content-addressed locator, or read a byte range out of a
//! previously stored block. Everything else (replication, hints, transport)
//! stays behind the [`client::BlobBackend`] trait.

pub mod client;
pub mod memory;

pub use client::{BlobBackend, BlobClient, locator_size};
pub use memory::MemoryBlobStore;
