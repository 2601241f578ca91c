//! Path-based filesystem facade.

use crate::blob::{BlobBackend, BlobClient};
use crate::manifest::codec;
use crate::utils::path;
use crate::vfs::error::FsError;
use crate::vfs::flags::{O_CREATE, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC};
use crate::vfs::handle::Handle;
use crate::vfs::info::{FileInfo, MODE_DIR};
use crate::vfs::node::{Node, NodeKind};
use std::sync::Arc;

/// One collection's worth of files, loaded from a manifest and writable in
/// memory until the next [`CollectionFs::marshal_manifest`].
pub struct CollectionFs<B: BlobBackend> {
    root: Arc<Node<B>>,
}

impl<B: BlobBackend> CollectionFs<B> {
    /// Build a filesystem from manifest text. A parse error discards the
    /// partially built tree, so the caller either gets a complete
    /// filesystem or none at all.
    pub async fn new(client: BlobClient<B>, manifest_text: &str) -> Result<Self, FsError> {
        let root = Node::new_root(client);
        codec::load(&root, manifest_text).await?;
        Ok(Self { root })
    }

    /// Open with explicit flags and mode, as `open(2)` would.
    pub async fn open_file(
        &self,
        name: &str,
        flags: u32,
        mode: u32,
    ) -> Result<Handle<B>, FsError> {
        Node::open_file(&self.root, &path::clean(name), flags, mode).await
    }

    /// Read-only open, the shape an HTTP file server wants.
    pub async fn open(&self, name: &str) -> Result<Handle<B>, FsError> {
        Node::open_file(&self.root, &path::clean(name), O_RDONLY, 0).await
    }

    /// Create (or truncate) a file and open it read-write.
    pub async fn create(&self, name: &str) -> Result<Handle<B>, FsError> {
        Node::open_file(&self.root, &path::clean(name), O_CREATE | O_RDWR | O_TRUNC, 0).await
    }

    pub async fn stat(&self, name: &str) -> Result<FileInfo, FsError> {
        let f = self.open(name).await?;
        Ok(f.stat().await)
    }

    pub async fn mkdir(&self, name: &str) -> Result<(), FsError> {
        Node::open_file(&self.root, name, O_CREATE | O_EXCL, MODE_DIR | 0o755)
            .await
            .map(drop)
    }

    pub async fn remove(&self, name: &str) -> Result<(), FsError> {
        Node::remove(&self.root, name).await
    }

    /// Flush buffered data bottom-up and serialize the whole tree as
    /// manifest text. `prefix` names the root stream (conventionally `"."`).
    pub async fn marshal_manifest(&self, prefix: &str) -> Result<String, FsError> {
        tracing::debug!(prefix = %prefix, "marshalling manifest");
        let ds = match &self.root.kind {
            NodeKind::Dir(d) => Arc::clone(d),
            NodeKind::File(_) => unreachable!("root is a directory"),
        };
        let guard = ds.write_owned().await;
        codec::marshal_dir(&guard, prefix.to_string(), &self.root.blob).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::vfs::flags::{O_APPEND, O_SYNC, O_WRONLY};
    use std::io::SeekFrom;

    async fn empty_fs() -> CollectionFs<MemoryBlobStore> {
        CollectionFs::new(BlobClient::new(MemoryBlobStore::new()), "")
            .await
            .unwrap()
    }

    async fn read_to_end(f: &mut Handle<MemoryBlobStore>) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut buf = [0u8; 16];
            let n = f.read(&mut buf).await.unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_open_flag_validation() {
        let fs = empty_fs().await;
        assert!(matches!(
            fs.open_file("x", O_RDWR | O_WRONLY, 0).await,
            Err(FsError::InvalidFlags { .. })
        ));
        assert!(matches!(
            fs.open_file("x", O_SYNC | O_RDONLY, 0).await,
            Err(FsError::SyncNotSupported)
        ));
        assert!(matches!(
            fs.open("missing").await,
            Err(FsError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_excl_on_existing() {
        let fs = empty_fs().await;
        fs.create("/f").await.unwrap();
        assert!(matches!(
            fs.open_file("/f", O_CREATE | O_EXCL | O_RDWR, 0).await,
            Err(FsError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_handle_mode_enforcement() {
        let fs = empty_fs().await;
        let mut w = fs
            .open_file("/f", O_CREATE | O_WRONLY, 0)
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            w.read(&mut buf).await,
            Err(FsError::WriteOnlyFile)
        ));
        w.write(b"data").await.unwrap();

        let mut r = fs.open("/f").await.unwrap();
        assert!(matches!(r.write(b"no").await, Err(FsError::ReadOnlyFile)));
        assert_eq!(read_to_end(&mut r).await, b"data");
    }

    #[tokio::test]
    async fn test_open_directory_via_dots() {
        let fs = empty_fs().await;
        fs.mkdir("/d").await.unwrap();
        for name in ["/d/", "/d/.", "/d/.."] {
            let f = fs.open(name).await.unwrap();
            assert!(f.stat().await.is_dir());
        }
        let root = fs.open("/").await.unwrap();
        assert_eq!(root.stat().await.name(), ".");
    }

    #[tokio::test]
    async fn test_mkdir_and_remove_semantics() {
        let fs = empty_fs().await;
        fs.mkdir("/d").await.unwrap();
        assert!(matches!(
            fs.mkdir("/d").await,
            Err(FsError::AlreadyExists { .. })
        ));
        fs.create("/d/f").await.unwrap();
        assert!(matches!(
            fs.remove("/d").await,
            Err(FsError::DirectoryNotEmpty { .. })
        ));
        fs.remove("/d/f").await.unwrap();
        fs.remove("/d").await.unwrap();
        assert!(matches!(
            fs.remove("/d").await,
            Err(FsError::NotFound { .. })
        ));
        assert!(matches!(
            fs.remove("/.").await,
            Err(FsError::InvalidOperation)
        ));
    }

    #[tokio::test]
    async fn test_directory_size_counts_children() {
        let fs = empty_fs().await;
        fs.mkdir("/d").await.unwrap();
        fs.create("/d/a").await.unwrap();
        fs.create("/d/b").await.unwrap();
        assert_eq!(fs.stat("/d").await.unwrap().size(), 2);
        fs.remove("/d/a").await.unwrap();
        assert_eq!(fs.stat("/d").await.unwrap().size(), 1);
    }

    #[tokio::test]
    async fn test_truncate_on_open() {
        let fs = empty_fs().await;
        let mut f = fs.create("/f").await.unwrap();
        f.write(b"content").await.unwrap();
        let mut again = fs.create("/f").await.unwrap();
        assert_eq!(again.size().await, 0);
        assert_eq!(read_to_end(&mut again).await, b"");
    }

    #[tokio::test]
    async fn test_seek_whence() {
        let fs = empty_fs().await;
        let mut f = fs.create("/f").await.unwrap();
        f.write(b"0123456789").await.unwrap();

        assert_eq!(f.seek(SeekFrom::Start(4)).await.unwrap(), 4);
        assert_eq!(f.seek(SeekFrom::Current(2)).await.unwrap(), 6);
        assert_eq!(f.seek(SeekFrom::End(-3)).await.unwrap(), 7);
        // Past-the-end clamps; before-the-start errors without moving.
        assert_eq!(f.seek(SeekFrom::Start(99)).await.unwrap(), 10);
        assert!(matches!(
            f.seek(SeekFrom::Current(-99)).await,
            Err(FsError::NegativeOffset)
        ));
        assert_eq!(f.seek(SeekFrom::Current(0)).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_append_mode_snaps_to_eof() {
        let fs = empty_fs().await;
        let mut f = fs.create("/f").await.unwrap();
        f.write(b"base").await.unwrap();

        let mut a = fs
            .open_file("/f", O_WRONLY | O_APPEND, 0)
            .await
            .unwrap();
        a.seek(SeekFrom::Start(0)).await.unwrap();
        a.write(b"+tail").await.unwrap();

        let mut r = fs.open("/f").await.unwrap();
        assert_eq!(read_to_end(&mut r).await, b"base+tail");
    }

    #[tokio::test]
    async fn test_readdir_chunked() {
        let fs = empty_fs().await;
        for name in ["a", "b", "c"] {
            fs.create(name).await.unwrap();
        }
        let mut d = fs.open("/").await.unwrap();
        let all = d.readdir(0).await.unwrap();
        assert_eq!(
            all.iter().map(|fi| fi.name()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        let first = d.readdir(2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = d.readdir(2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(d.readdir(2).await.unwrap().is_empty());

        let mut f = fs.open("/a").await.unwrap();
        assert!(matches!(f.readdir(1).await, Err(FsError::InvalidOperation)));
    }

    #[tokio::test]
    async fn test_stat_and_modes() {
        let fs = empty_fs().await;
        fs.create("/f").await.unwrap();
        fs.mkdir("/d").await.unwrap();
        let f = fs.stat("/f").await.unwrap();
        assert!(!f.is_dir());
        assert_eq!(f.mode() & 0o777, 0o755);
        let d = fs.stat("/d").await.unwrap();
        assert!(d.is_dir());
    }

    #[tokio::test]
    async fn test_size_invariants_hold_through_edits() {
        let fs = empty_fs().await;
        let mut f = fs.create("/f").await.unwrap();
        f.write(b"0123456789").await.unwrap();
        f.seek(SeekFrom::Start(4)).await.unwrap();
        f.write(b"xx").await.unwrap();
        f.truncate(7).await.unwrap();

        let node = f.node_arc();
        let (size, total, mem) = node.file_sums().await.unwrap();
        assert_eq!(size, 7);
        assert_eq!(size, total);
        assert_eq!(mem, total, "nothing flushed yet");

        fs.marshal_manifest(".").await.unwrap();
        let (size, total, mem) = node.file_sums().await.unwrap();
        assert_eq!((size, total, mem), (7, 7, 0));
    }

    #[tokio::test]
    async fn test_write_to_directory_rejected() {
        let fs = empty_fs().await;
        fs.mkdir("/d").await.unwrap();
        let mut d = fs.open_file("/d", O_RDWR, 0).await.unwrap();
        assert!(matches!(d.write(b"x").await, Err(FsError::InvalidOperation)));
        assert!(matches!(
            d.truncate(0).await,
            Err(FsError::InvalidOperation)
        ));
    }
}
