//! Content hashing utilities
//!
//! The wire protocol identifies file content by its MD5 digest. MD5 is kept
//! for compatibility with existing peers, not for integrity against tampering.

use anyhow::{Context as _, Result};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::protocol::{HASH_LEN, IO_CHUNK};

/// 16-byte MD5 digest of a file's full content
pub type ContentHash = [u8; HASH_LEN];

/// Digest of an in-memory buffer
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    md5::compute(data).0
}

/// Hash everything a reader yields, returning the digest and byte count
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(ContentHash, u64)> {
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; IO_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        ctx.consume(&buf[..n]);
        total += n as u64;
    }
    Ok((ctx.compute().0, total))
}

/// Hash a file on disk, returning the digest and its size
pub fn hash_file(path: &Path) -> Result<(ContentHash, u64)> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    hash_reader(file).with_context(|| format!("hash {}", path.display()))
}

/// Lowercase hex rendering for logs and the CLI
pub fn to_hex(hash: &ContentHash) -> String {
    format!("{:x}", md5::Digest(*hash))
}

/// Writer adapter that hashes and counts everything passed through it
pub struct HashingWriter<W> {
    inner: W,
    ctx: md5::Context,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            ctx: md5::Context::new(),
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finish hashing and hand back the inner writer
    pub fn finish(self) -> (W, ContentHash, u64) {
        (self.inner, self.ctx.compute().0, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.ctx.consume(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_of_hello() {
        assert_eq!(to_hex(&hash_bytes(b"hello")), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn md5_of_empty() {
        assert_eq!(to_hex(&hash_bytes(b"")), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn hashing_writer_matches_one_shot() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut w = HashingWriter::new(Vec::new());
        for chunk in data.chunks(7_777) {
            w.write_all(chunk).unwrap();
        }
        let (inner, hash, n) = w.finish();
        assert_eq!(inner, data);
        assert_eq!(n, data.len() as u64);
        assert_eq!(hash, hash_bytes(&data));
    }

    #[test]
    fn hash_file_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.bin");
        std::fs::write(&p, b"hello").unwrap();
        let (hash, size) = hash_file(&p).unwrap();
        assert_eq!(size, 5);
        assert_eq!(hash, hash_bytes(b"hello"));
    }
}
