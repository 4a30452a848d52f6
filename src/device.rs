//! The storage seam: everything below the core talks to physical media
//! only through [`BlockDevice`].
//!
//! This mirrors the teacher's `JournalDevice` trait
//! (`journal/device.rs`), generalized from "journal blocks only" to every
//! block the core touches (superblock, GDT, bitmaps, inode table, extent
//! metadata, journal). A caller outside this crate supplies the
//! implementation — a raw disk file, a loopback image, or in tests an
//! in-memory buffer.

use crate::error::Result;
use crate::types::BlockNumber;

/// Fixed-size block-addressed storage. All reads/writes are whole blocks;
/// the core never does sub-block I/O (ext4 itself never does either).
pub trait BlockDevice: Send + Sync {
    /// Block size in bytes, fixed for the lifetime of the device.
    fn block_size(&self) -> u32;

    /// Total number of blocks addressable on the device.
    fn block_count(&self) -> BlockNumber;

    /// Read exactly one block into `buf`. `buf.len()` must equal
    /// `block_size()`.
    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<()>;

    /// Write exactly one block from `buf`. `buf.len()` must equal
    /// `block_size()`.
    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<()>;

    /// Flush any buffered writes to stable storage (barrier point).
    fn sync(&self) -> Result<()>;
}

/// Quota accounting hook. The core calls this at allocation/free time but
/// implements no quota policy itself (spec Non-goals).
pub trait QuotaHook: Send + Sync {
    /// Returns `Ok(())` if `inode` may consume `blocks` more blocks / 1 more
    /// inode, else an error (typically `CoreError::Quota`).
    fn reserve_blocks(&self, inode: u32, blocks: u64) -> Result<()>;
    fn release_blocks(&self, inode: u32, blocks: u64);
    fn reserve_inode(&self, uid: u32, gid: u32) -> Result<()>;
    fn release_inode(&self, uid: u32, gid: u32);
}

/// A no-op quota hook for configurations without quota enforcement.
pub struct NoQuota;

impl QuotaHook for NoQuota {
    fn reserve_blocks(&self, _inode: u32, _blocks: u64) -> Result<()> {
        Ok(())
    }
    fn release_blocks(&self, _inode: u32, _blocks: u64) {}
    fn reserve_inode(&self, _uid: u32, _gid: u32) -> Result<()> {
        Ok(())
    }
    fn release_inode(&self, _uid: u32, _gid: u32) {}
}
