//! Fixed-size chunking with per-block and whole-file SHA-256.
//!
//! Blocks are handed to a sink as soon as they are read, so a file is never
//! held in memory beyond one block.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use crate::utils::errors::Result;

/// Lowercase hex SHA-256 of a byte slice
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// What the chunker learned about one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSummary {
    /// Block hashes in file order
    pub blocks: Vec<String>,
    /// Hash of the whole content, computed over the same read pass
    pub checksum: String,
    /// Bytes read
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    block_size: usize,
}

impl Chunker {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Split a reader into blocks, calling `sink(hash, bytes)` for each one.
    ///
    /// An error from the sink stops chunking and is returned as-is.
    pub fn chunk_reader<R, F>(&self, mut reader: R, mut sink: F) -> Result<ChunkSummary>
    where
        R: Read,
        F: FnMut(&str, &[u8]) -> Result<()>,
    {
        let mut buf = vec![0u8; self.block_size];
        let mut file_hasher = Sha256::new();
        let mut blocks = Vec::new();
        let mut size = 0u64;

        loop {
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            let data = &buf[..n];
            file_hasher.update(data);
            let hash = hash_bytes(data);
            sink(&hash, data)?;
            blocks.push(hash);
            size += n as u64;
            if n < self.block_size {
                break;
            }
        }

        Ok(ChunkSummary {
            blocks,
            checksum: hex::encode(file_hasher.finalize()),
            size,
        })
    }

    pub fn chunk_file<F>(&self, path: &Path, sink: F) -> Result<ChunkSummary>
    where
        F: FnMut(&str, &[u8]) -> Result<()>,
    {
        let file = File::open(path)?;
        self.chunk_reader(file, sink)
    }
}

/// Read until `buf` is full or the reader is exhausted
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
