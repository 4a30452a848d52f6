//! Mount-time configuration (spec §4.1, §4.5, §7).

use crate::types::{DataMode, ErrorPolicy};

/// Parameters fixed for the lifetime of a mount, mirroring what the
/// teacher's `FilesystemParams` carries for format-time but extended with
/// the runtime knobs a mounted driver needs (error policy, data mode,
/// barriers, runtime reservation) — grounded on
/// `formatters/ext4_native/core/types.rs::FilesystemParams`.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Block size in bytes, read from the superblock at mount.
    pub block_size: u32,
    /// On-disk inode record size.
    pub inode_size: u16,
    /// What to do when `handle_error` fires (spec §7).
    pub error_policy: ErrorPolicy,
    /// Journal data-ordering mode (spec §4.5).
    pub data_mode: DataMode,
    /// Whether to issue write barriers / cache flushes around journal
    /// commits.
    pub barrier: bool,
    /// Extra blocks reserved at runtime on top of `s_r_blocks_count`,
    /// analogous to `s_resv_blocks_counter` in the original (spec §4.2.1).
    pub runtime_reserve: u64,
    /// Maximum ENOSPC retries before an allocation gives up (spec §4.2.1).
    pub max_alloc_retries: u32,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            block_size: crate::constants::DEFAULT_BLOCK_SIZE,
            inode_size: crate::constants::DEFAULT_INODE_SIZE,
            error_policy: ErrorPolicy::default(),
            data_mode: DataMode::default(),
            barrier: true,
            runtime_reserve: 0,
            max_alloc_retries: crate::constants::MAX_ALLOC_RETRIES,
        }
    }
}
