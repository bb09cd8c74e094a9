//! Fixed-size block splitting and hashing
//!
//! Files are cut into equal blocks whose size follows a schedule derived
//! from the file size, so both ends of a transfer agree on boundaries
//! without negotiation. Each block carries a strong SHA-256 hash and a weak
//! CRC32 used for cheap first-pass matching.

use std::io::Read;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Smallest block size in the schedule.
pub const BLOCK_SIZE_MIN: u32 = 128 << 10;

/// Largest block size in the schedule.
pub const BLOCK_SIZE_MAX: u32 = 16 << 20;

/// The schedule doubles the block size until a file fits in roughly this
/// many blocks.
pub const DESIRED_BLOCKS_PER_FILE: u64 = 2000;

/// A contiguous range of a file, identified by its content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Byte offset in the file
    pub offset: u64,
    /// Length of this block in bytes
    pub size: u32,
    /// SHA-256 of the block content
    pub hash: [u8; 32],
    /// CRC32 of the block content, for cheap candidate matching
    pub weak_hash: u32,
}

/// Pick the block size for a file of the given length.
///
/// Starts at 128 KiB and doubles per size class up to 16 MiB, targeting at
/// most [`DESIRED_BLOCKS_PER_FILE`] blocks. The chosen size is recorded in
/// the file's metadata so peers use identical boundaries.
#[must_use]
pub fn block_size(file_size: u64) -> u32 {
    let mut size = u64::from(BLOCK_SIZE_MIN);
    while size < u64::from(BLOCK_SIZE_MAX) && file_size / size > DESIRED_BLOCKS_PER_FILE {
        size *= 2;
    }
    size as u32
}

/// Hash a single block's content.
#[must_use]
pub fn hash_block(data: &[u8]) -> BlockInfo {
    let digest = Sha256::digest(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    BlockInfo {
        offset: 0,
        size: data.len() as u32,
        hash,
        weak_hash: crc32fast::hash(data),
    }
}

/// Split a stream into blocks of `block_size` and hash each one.
///
/// A zero-length stream yields no blocks; reconstructing an empty block
/// list produces an empty file.
///
/// # Errors
/// Returns an error if reading fails.
pub fn hash_blocks<R: Read>(mut reader: R, block_size: u32) -> std::io::Result<Vec<BlockInfo>> {
    let mut blocks = Vec::new();
    let mut buf = vec![0u8; block_size as usize];
    let mut offset = 0u64;

    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }

        let mut block = hash_block(&buf[..filled]);
        block.offset = offset;
        offset += filled as u64;
        blocks.push(block);

        if filled < buf.len() {
            break; // short read: end of stream
        }
    }

    Ok(blocks)
}

/// Verify that `data` matches the expected block hash.
#[must_use]
pub fn verify_block(data: &[u8], expected: &[u8; 32]) -> bool {
    let digest = Sha256::digest(data);
    digest.as_slice() == expected
}
