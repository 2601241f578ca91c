//! Manifest parsing and serialization.
//!
//! Each stream line is `dirname locator... segment...` where a locator is
//! `<hex-md5>+<size>[+hint]*` and a segment is `offset:length:name` in the
//! coordinate space of the stream (the concatenation of the line's blocks).
//! Parsing materializes stored extents; serialization walks the tree bottom
//! up after flushing buffered data, emitting the exact canonical form:
//! sorted names, deduplicated adjacent locators, merged contiguous segments,
//! and a sentinel block for streams with only empty files.

use crate::blob::{BlobBackend, BlobClient, locator_size};
use crate::extent::{Extent, StoredExtent};
use crate::manifest::escape::{escape, unescape};
use crate::utils::path;
use crate::vfs::dir::DirState;
use crate::vfs::error::FsError;
use crate::vfs::flags::{O_APPEND, O_CREATE, O_WRONLY};
use crate::vfs::flush;
use crate::vfs::node::{Node, NodeKind};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::OwnedRwLockWriteGuard;

/// Locator of the zero-byte block, emitted for streams whose segments are
/// all empty.
pub(crate) const EMPTY_BLOCK_LOCATOR: &str = "d41d8cd98f00b204e9800998ecf8427e+0";

fn parse_err(line: usize, msg: impl Into<String>) -> FsError {
    FsError::ManifestParse {
        line,
        msg: msg.into(),
    }
}

/// Populate the tree under `root` from manifest text. Any error leaves the
/// caller to discard the partially built tree.
pub(crate) async fn load<B: BlobBackend>(root: &Arc<Node<B>>, text: &str) -> Result<(), FsError> {
    let blob = root.blob.clone();
    let streams: Vec<&str> = text.split('\n').collect();
    if streams[streams.len() - 1] != "" {
        return Err(parse_err(streams.len(), "no trailing newline"));
    }
    tracing::debug!(lines = streams.len() - 1, "loading manifest");
    for (i, stream) in streams[..streams.len() - 1].iter().enumerate() {
        let lineno = i + 1;
        let mut dirname = String::new();
        // Blocks named so far on this line, as (locator, size).
        let mut blocks: Vec<(String, i64)> = Vec::new();
        let mut any_file_tokens = false;
        for (ti, token) in stream.split(' ').enumerate() {
            if ti == 0 {
                dirname = unescape(token);
                continue;
            }
            if !token.contains(':') {
                if any_file_tokens {
                    return Err(parse_err(lineno, format!("bad file segment {token:?}")));
                }
                match locator_size(token) {
                    Some(size) => blocks.push((token.to_string(), size as i64)),
                    None => return Err(parse_err(lineno, format!("bad locator {token:?}"))),
                }
                continue;
            } else if blocks.is_empty() {
                return Err(parse_err(lineno, format!("bad locator {token:?}")));
            }

            let toks: Vec<&str> = token.split(':').collect();
            if toks.len() != 3 {
                return Err(parse_err(lineno, format!("bad file segment {token:?}")));
            }
            any_file_tokens = true;

            let offset = match toks[0].parse::<i64>() {
                Ok(v) if v >= 0 => v,
                _ => return Err(parse_err(lineno, format!("bad file segment {token:?}"))),
            };
            let length = match toks[1].parse::<i64>() {
                Ok(v) if v >= 0 => v,
                _ => return Err(parse_err(lineno, format!("bad file segment {token:?}"))),
            };
            let name = path::clean(&format!("{}/{}", dirname, unescape(toks[2])));
            Node::make_parent_dirs(root, &name)
                .await
                .map_err(|err| parse_err(lineno, format!("cannot use path {name:?}: {err}")))?;
            let f = Node::open_file(root, &name, O_CREATE | O_WRONLY | O_APPEND, 0o700)
                .await
                .map_err(|err| parse_err(lineno, format!("cannot append to {name:?}: {err}")))?;
            let node = f.node_arc();
            if node.is_dir() {
                return Err(parse_err(
                    lineno,
                    format!("cannot append to {name:?}: is a directory"),
                ));
            }
            // Map the segment's stream coordinates onto block coordinates
            // and append the covered block windows.
            let mut pos: i64 = 0;
            for (locator, size) in &blocks {
                let next = pos + size;
                if next < offset {
                    pos = next;
                    continue;
                }
                if pos > offset + length {
                    break;
                }
                let blk_off = if pos < offset { offset - pos } else { 0 };
                let mut blk_len = size - blk_off;
                if pos + blk_off + blk_len > offset + length {
                    blk_len = offset + length - pos - blk_off;
                }
                node.append_extent(StoredExtent::new(
                    blob.clone(),
                    locator.clone(),
                    *size as usize,
                    blk_off as usize,
                    blk_len as usize,
                ))
                .await;
                pos = next;
            }
            if pos < offset + length {
                return Err(parse_err(
                    lineno,
                    format!("invalid segment in {pos}-byte stream: {token:?}"),
                ));
            }
        }
        if !any_file_tokens {
            return Err(parse_err(lineno, "no file segments"));
        } else if blocks.is_empty() {
            return Err(parse_err(lineno, "no locators"));
        } else if dirname.is_empty() {
            return Err(parse_err(lineno, "no stream name"));
        }
    }
    Ok(())
}

struct Segment {
    name: String,
    offset: i64,
    length: i64,
}

enum ChildGuard<B: BlobBackend> {
    File(OwnedRwLockWriteGuard<crate::vfs::node::FileState<B>>),
    Dir(OwnedRwLockWriteGuard<DirState<B>>),
}

/// Serialize the tree rooted at `dn` (whose lock the caller holds) as
/// manifest text, flushing buffered data first. `prefix` names the stream
/// for this directory; subdirectories extend it with `/<name>`.
pub(crate) fn marshal_dir<'a, B: BlobBackend>(
    dn: &'a DirState<B>,
    prefix: String,
    blob: &'a BlobClient<B>,
) -> Pin<Box<dyn Future<Output = Result<String, FsError>> + Send + 'a>> {
    Box::pin(async move {
        let mut stream_len: i64 = 0;
        let mut segments: Vec<Segment> = Vec::new();
        let mut blocks: Vec<String> = Vec::new();
        let mut subdirs = String::new();

        flush::sync_dir(dn, blob).await?;

        let mut names: Vec<&String> = dn.inodes.keys().collect();
        names.sort();
        // Lock every child (parent before child) and keep the guards until
        // this stream and all substreams are emitted.
        let mut children: Vec<(String, ChildGuard<B>)> = Vec::new();
        for name in names {
            let guard = match &dn.inodes[name].kind {
                NodeKind::File(state) => ChildGuard::File(Arc::clone(state).write_owned().await),
                NodeKind::Dir(state) => ChildGuard::Dir(Arc::clone(state).write_owned().await),
            };
            children.push((name.clone(), guard));
        }

        for (name, guard) in &children {
            match guard {
                ChildGuard::Dir(child) => {
                    subdirs
                        .push_str(&marshal_dir(&**child, format!("{prefix}/{name}"), blob).await?);
                }
                ChildGuard::File(state) => {
                    if state.extents.is_empty() {
                        segments.push(Segment {
                            name: name.clone(),
                            offset: 0,
                            length: 0,
                        });
                        continue;
                    }
                    for e in &state.extents {
                        let se = match e {
                            Extent::Stored(se) => se,
                            // sync_dir just ran under these locks.
                            Extent::Mem(_) => panic!("cannot marshal in-memory extent"),
                        };
                        if blocks.last().map(String::as_str) == Some(se.locator.as_str()) {
                            stream_len -= se.size as i64;
                        } else {
                            blocks.push(se.locator.clone());
                        }
                        let next = Segment {
                            name: name.clone(),
                            offset: stream_len + se.offset as i64,
                            length: se.length as i64,
                        };
                        match segments.last_mut() {
                            Some(prev)
                                if prev.name == next.name
                                    && prev.offset + prev.length == next.offset =>
                            {
                                prev.length += next.length;
                            }
                            _ => segments.push(next),
                        }
                        stream_len += se.size as i64;
                    }
                }
            }
        }

        let filetokens: Vec<String> = segments
            .iter()
            .map(|s| format!("{}:{}:{}", s.offset, s.length, escape(&s.name)))
            .collect();
        if filetokens.is_empty() {
            return Ok(subdirs);
        }
        if blocks.is_empty() {
            blocks.push(EMPTY_BLOCK_LOCATOR.to_string());
        }
        Ok(format!(
            "{} {} {}\n{}",
            escape(&prefix),
            blocks.join(" "),
            filetokens.join(" "),
            subdirs
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::vfs::fs::CollectionFs;

    async fn fs_from(manifest: &str) -> Result<CollectionFs<MemoryBlobStore>, FsError> {
        CollectionFs::new(BlobClient::new(MemoryBlobStore::new()), manifest).await
    }

    fn parse_line(err: FsError) -> (usize, String) {
        match err {
            FsError::ManifestParse { line, msg } => (line, msg),
            other => panic!("expected manifest parse error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_manifest_roundtrip() {
        let fs = fs_from("").await.unwrap();
        assert_eq!(fs.marshal_manifest(".").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_single_small_file() {
        let fs = fs_from("").await.unwrap();
        let mut f = fs.create("/hello.txt").await.unwrap();
        f.write(b"foo").await.unwrap();
        assert_eq!(
            fs.marshal_manifest(".").await.unwrap(),
            ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:hello.txt\n"
        );
    }

    #[tokio::test]
    async fn test_empty_file_gets_sentinel_block() {
        let fs = fs_from("").await.unwrap();
        fs.create("/empty").await.unwrap();
        assert_eq!(
            fs.marshal_manifest(".").await.unwrap(),
            format!(". {EMPTY_BLOCK_LOCATOR} 0:0:empty\n")
        );
    }

    #[tokio::test]
    async fn test_missing_trailing_newline() {
        let err = fs_from(". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:f").await;
        let (line, msg) = parse_line(err.err().unwrap());
        assert_eq!(line, 1);
        assert_eq!(msg, "no trailing newline");
    }

    #[tokio::test]
    async fn test_bad_locator() {
        let err = fs_from(". nosize 0:0:f\n").await.err().unwrap();
        let (line, msg) = parse_line(err);
        assert_eq!(line, 1);
        assert_eq!(msg, "bad locator \"nosize\"");
    }

    #[tokio::test]
    async fn test_segment_before_any_locator() {
        let err = fs_from(". 0:0:f\n").await.err().unwrap();
        let (_, msg) = parse_line(err);
        assert_eq!(msg, "bad locator \"0:0:f\"");
    }

    #[tokio::test]
    async fn test_locator_after_segments() {
        let manifest = ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:f aaaa+4\n";
        let err = fs_from(manifest).await.err().unwrap();
        let (_, msg) = parse_line(err);
        assert_eq!(msg, "bad file segment \"aaaa+4\"");
    }

    #[tokio::test]
    async fn test_stream_without_segments() {
        let err = fs_from(". acbd18db4cc2f85cedef654fccc4a4d8+3\n")
            .await
            .err()
            .unwrap();
        let (_, msg) = parse_line(err);
        assert_eq!(msg, "no file segments");
    }

    #[tokio::test]
    async fn test_error_carries_line_number() {
        let manifest = ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:a\n./d bogus 0:0:b\n";
        let err = fs_from(manifest).await.err().unwrap();
        let (line, msg) = parse_line(err);
        assert_eq!(line, 2);
        assert_eq!(msg, "bad locator \"bogus\"");
    }

    #[tokio::test]
    async fn test_segment_past_stream_end() {
        let err = fs_from(". acbd18db4cc2f85cedef654fccc4a4d8+3 0:9:f\n")
            .await
            .err()
            .unwrap();
        let (_, msg) = parse_line(err);
        assert_eq!(msg, "invalid segment in 3-byte stream: \"0:9:f\"");
    }

    #[tokio::test]
    async fn test_idempotent_reserialization() {
        let manifest = concat!(
            ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:hello.txt\n",
            "./sub 37b51d194a7513e45b56f6524f2d51f2+3 0:3:bar\n",
        );
        let fs = fs_from(manifest).await.unwrap();
        assert_eq!(fs.marshal_manifest(".").await.unwrap(), manifest);
    }

    #[tokio::test]
    async fn test_duplicate_locator_listed_once() {
        let manifest = ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:a 0:3:b\n";
        let fs = fs_from(manifest).await.unwrap();
        let out = fs.marshal_manifest(".").await.unwrap();
        assert_eq!(out, manifest);
        assert_eq!(out.matches("acbd").count(), 1);
    }

    #[tokio::test]
    async fn test_escaped_names_roundtrip() {
        let fs = fs_from("").await.unwrap();
        let mut f = fs.create("/has space").await.unwrap();
        f.write(b"foo").await.unwrap();
        let out = fs.marshal_manifest(".").await.unwrap();
        assert_eq!(
            out,
            ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:has\\040space\n"
        );

        let client = BlobClient::new(MemoryBlobStore::new());
        client.put_block(b"foo").await.unwrap();
        let reloaded = CollectionFs::new(client, &out).await.unwrap();
        let mut h = reloaded.open("/has space").await.unwrap();
        let mut buf = [0u8; 8];
        let n = h.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"foo");
    }

    #[tokio::test]
    async fn test_segment_spanning_multiple_locators() {
        // Stream of two blocks; one segment covers the tail of the first
        // and the head of the second.
        let client = BlobClient::new(MemoryBlobStore::new());
        let (l1, _) = client.put_block(b"abcde").await.unwrap();
        let (l2, _) = client.put_block(b"fghij").await.unwrap();
        let manifest = format!(". {l1} {l2} 3:4:f\n");
        let fs = CollectionFs::new(client, &manifest).await.unwrap();
        let mut h = fs.open("/f").await.unwrap();
        let mut buf = [0u8; 8];
        let mut out = Vec::new();
        loop {
            let n = h.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"defg");
    }

    #[tokio::test]
    async fn test_pack_small_writes_into_one_block() {
        let fs = fs_from("").await.unwrap();
        for name in ["a", "b", "c"] {
            let mut f = fs.create(name).await.unwrap();
            f.write(&[b'x'; 10]).await.unwrap();
        }
        let out = fs.marshal_manifest(".").await.unwrap();
        let line = out.strip_suffix('\n').unwrap();
        let tokens: Vec<&str> = line.split(' ').collect();
        // One stream name, one packed locator, three segments.
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[0], ".");
        assert_eq!(locator_size(tokens[1]), Some(30));
        assert_eq!(tokens[2], "0:10:a");
        assert_eq!(tokens[3], "10:10:b");
        assert_eq!(tokens[4], "20:10:c");
    }

    #[tokio::test]
    async fn test_contiguous_appends_emit_one_segment() {
        let fs = fs_from("").await.unwrap();
        let mut f = fs.create("/f").await.unwrap();
        f.write(b"AAA").await.unwrap();
        f.seek(std::io::SeekFrom::End(0)).await.unwrap();
        f.write(b"BBB").await.unwrap();
        let out = fs.marshal_manifest(".").await.unwrap();
        assert!(out.ends_with(" 0:6:f\n"), "expected one merged segment: {out}");
    }

    #[tokio::test]
    async fn test_subdirectory_streams_sorted() {
        let fs = fs_from("").await.unwrap();
        fs.mkdir("/z").await.unwrap();
        fs.mkdir("/a").await.unwrap();
        let mut f = fs.create("/z/f").await.unwrap();
        f.write(b"foo").await.unwrap();
        let mut g = fs.create("/a/g").await.unwrap();
        g.write(b"bar").await.unwrap();
        let out = fs.marshal_manifest(".").await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        // Root has no direct files, so only the subdirectory streams appear,
        // sorted by name.
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("./a "));
        assert!(lines[1].starts_with("./z "));
    }
}
