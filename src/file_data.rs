//! Per-inode file content store: one mmap'd blob per regular file,
//! optionally zstd-compressed.

use std::fs::{File, OpenOptions};
use std::path::Path;

use log::debug;
use memmap2::MmapMut;

use crate::error::{RazorError, Result};

const BLOB_MAGIC: u32 = 0x52465442; // "RFTB"
const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 1;

/// Compression kicks in only once logical size clears this.
pub const COMPRESSION_MIN_SIZE: usize = 512;
/// A compressed copy is kept only if stored size <= ratio * logical size.
pub const COMPRESSION_RATIO: f32 = 0.9;

struct BlobHeader {
    inode: u32,
    logical_size: u64,
    stored_size: u64,
    compressed: bool,
}

impl BlobHeader {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&BLOB_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.inode.to_le_bytes());
        buf[8..16].copy_from_slice(&self.logical_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.stored_size.to_le_bytes());
        buf[24] = self.compressed as u8;
        buf
    }

    fn decode(buf: &[u8]) -> Result<BlobHeader> {
        if buf.len() < HEADER_LEN {
            return Err(RazorError::Corruption("file blob header truncated".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != BLOB_MAGIC {
            return Err(RazorError::Corruption("bad file blob magic".into()));
        }
        Ok(BlobHeader {
            inode: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            logical_size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            stored_size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            compressed: buf[24] != 0,
        })
    }
}

/// Reads the full logical content of an inode's blob file, decompressing if needed.
pub fn read_blob(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    if mmap.len() < HEADER_LEN {
        return Err(RazorError::Corruption("file blob shorter than header".into()));
    }
    let header = BlobHeader::decode(&mmap[..HEADER_LEN])?;
    let body = &mmap[HEADER_LEN..HEADER_LEN + header.stored_size as usize];
    if header.compressed {
        let decoded = zstd::decode_all(body).map_err(|e| RazorError::CompressionError(e.to_string()))?;
        if decoded.len() as u64 != header.logical_size {
            return Err(RazorError::Corruption("decompressed length mismatch".into()));
        }
        Ok(decoded)
    } else {
        Ok(body.to_vec())
    }
}

/// Reads `length` bytes starting at `offset` from a stored inode blob.
pub fn read_range(path: &Path, offset: u64, length: usize) -> Result<Vec<u8>> {
    let full = read_blob(path)?;
    let start = (offset as usize).min(full.len());
    let end = (start + length).min(full.len());
    Ok(full[start..end].to_vec())
}

/// Writes `data` at `offset` into the inode's blob, growing it with
/// zero bytes if `offset` starts past the current logical end, then
/// rewrites the whole blob applying the compression policy.
pub fn write_range(path: &Path, offset: u64, data: &[u8], inode: u32) -> Result<u64> {
    let mut content = if path.exists() { read_blob(path)? } else { Vec::new() };
    let end = offset as usize + data.len();
    if content.len() < end {
        content.resize(end, 0);
    }
    content[offset as usize..end].copy_from_slice(data);
    let new_len = content.len() as u64;
    write_blob(path, &content, inode)?;
    Ok(new_len)
}

pub fn truncate_blob(path: &Path, new_len: u64, inode: u32) -> Result<()> {
    let mut content = if path.exists() { read_blob(path)? } else { Vec::new() };
    content.resize(new_len as usize, 0);
    write_blob(path, &content, inode)
}

pub fn remove_blob(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

fn write_blob(path: &Path, content: &[u8], inode: u32) -> Result<()> {
    let logical_size = content.len() as u64;
    let (stored, compressed) = if content.len() >= COMPRESSION_MIN_SIZE {
        let z = zstd::encode_all(content, 0).map_err(|e| RazorError::CompressionError(e.to_string()))?;
        if (z.len() as f32) <= (content.len() as f32) * COMPRESSION_RATIO {
            (z, true)
        } else {
            (content.to_vec(), false)
        }
    } else {
        (content.to_vec(), false)
    };

    let header = BlobHeader {
        inode,
        logical_size,
        stored_size: stored.len() as u64,
        compressed,
    };

    let total_len = HEADER_LEN + stored.len();
    let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
    file.set_len(total_len as u64)?;
    let mut mmap = unsafe { MmapMut::map_mut(&file)? };
    mmap[..HEADER_LEN].copy_from_slice(&header.encode());
    mmap[HEADER_LEN..total_len].copy_from_slice(&stored);
    mmap.flush()?;
    debug!("file_data: wrote blob {} ({} logical, {} stored, compressed={})", path.display(), logical_size, stored.len(), compressed);
    Ok(())
}

/// Durability barrier for one inode's blob (part of `fsync` semantics).
pub fn fsync_blob(path: &Path) -> Result<()> {
    if path.exists() {
        let file = File::open(path)?;
        file.sync_all()?;
    }
    Ok(())
}
