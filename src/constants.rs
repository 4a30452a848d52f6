//! On-disk magic numbers, feature bits and limits (spec §3, §6).

// Magic numbers -------------------------------------------------------------
pub const SB_MAGIC: u16 = 0xEF53;
pub const EXTENT_MAGIC: u16 = 0xF30A;

// Superblock byte offset (spec §6): the superblock always starts 1024 bytes
// into the device, regardless of block size.
pub const SB_OFFSET: u64 = 1024;
pub const SB_SIZE: usize = 1024;

// Block sizes -----------------------------------------------------------------
pub const MIN_BLOCK_SIZE: u32 = 1024;
pub const MAX_BLOCK_SIZE: u32 = 65536;

// Reserved inode numbers (spec §3 Inode, §4.6.3) -----------------------------
pub const BAD_BLOCKS_INO: u32 = 1;
pub const ROOT_INO: u32 = 2;
pub const ACL_IDX_INO: u32 = 3;
pub const ACL_DATA_INO: u32 = 4;
pub const BOOT_LOADER_INO: u32 = 5;
pub const UNDEL_DIR_INO: u32 = 6;
pub const RESIZE_INO: u32 = 7;
pub const JOURNAL_INO: u32 = 8;
pub const EXCLUDE_INO: u32 = 9;
pub const REPLICA_INO: u32 = 10;
pub const FIRST_INO: u32 = 11;
pub const LOST_AND_FOUND_INO: u32 = 11;

// Feature flags: COMPAT -------------------------------------------------------
pub const FEATURE_COMPAT_DIR_PREALLOC: u32 = 0x0001;
pub const FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;
pub const FEATURE_COMPAT_EXT_ATTR: u32 = 0x0008;
pub const FEATURE_COMPAT_RESIZE_INODE: u32 = 0x0010;
pub const FEATURE_COMPAT_DIR_INDEX: u32 = 0x0020;

// Feature flags: INCOMPAT -----------------------------------------------------
pub const FEATURE_INCOMPAT_COMPRESSION: u32 = 0x0001;
pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const FEATURE_INCOMPAT_RECOVER: u32 = 0x0004;
pub const FEATURE_INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
pub const FEATURE_INCOMPAT_META_BG: u32 = 0x0010;
pub const FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;
pub const FEATURE_INCOMPAT_64BIT: u32 = 0x0080;
pub const FEATURE_INCOMPAT_MMP: u32 = 0x0100;
pub const FEATURE_INCOMPAT_FLEX_BG: u32 = 0x0200;
pub const FEATURE_INCOMPAT_EA_INODE: u32 = 0x0400;
pub const FEATURE_INCOMPAT_CSUM_SEED: u32 = 0x2000;
pub const FEATURE_INCOMPAT_LARGEDIR: u32 = 0x4000;
pub const FEATURE_INCOMPAT_INLINE_DATA: u32 = 0x8000;

/// Known incompat features; anything else fails mount (spec §4.1, §7).
pub const KNOWN_INCOMPAT: u32 = FEATURE_INCOMPAT_COMPRESSION
    | FEATURE_INCOMPAT_FILETYPE
    | FEATURE_INCOMPAT_RECOVER
    | FEATURE_INCOMPAT_JOURNAL_DEV
    | FEATURE_INCOMPAT_META_BG
    | FEATURE_INCOMPAT_EXTENTS
    | FEATURE_INCOMPAT_64BIT
    | FEATURE_INCOMPAT_MMP
    | FEATURE_INCOMPAT_FLEX_BG
    | FEATURE_INCOMPAT_EA_INODE
    | FEATURE_INCOMPAT_CSUM_SEED
    | FEATURE_INCOMPAT_LARGEDIR
    | FEATURE_INCOMPAT_INLINE_DATA;

// Feature flags: RO_COMPAT -----------------------------------------------------
pub const FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;
pub const FEATURE_RO_COMPAT_HUGE_FILE: u32 = 0x0008;
pub const FEATURE_RO_COMPAT_GDT_CSUM: u32 = 0x0010;
pub const FEATURE_RO_COMPAT_DIR_NLINK: u32 = 0x0020;
pub const FEATURE_RO_COMPAT_EXTRA_ISIZE: u32 = 0x0040;
pub const FEATURE_RO_COMPAT_QUOTA: u32 = 0x0100;
pub const FEATURE_RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

/// Known ro-compat features; anything else mounts read-only (spec §4.1, §7).
pub const KNOWN_RO_COMPAT: u32 = FEATURE_RO_COMPAT_SPARSE_SUPER
    | FEATURE_RO_COMPAT_LARGE_FILE
    | FEATURE_RO_COMPAT_HUGE_FILE
    | FEATURE_RO_COMPAT_GDT_CSUM
    | FEATURE_RO_COMPAT_DIR_NLINK
    | FEATURE_RO_COMPAT_EXTRA_ISIZE
    | FEATURE_RO_COMPAT_QUOTA
    | FEATURE_RO_COMPAT_METADATA_CSUM;

// Filesystem state (SB.state) --------------------------------------------------
pub const VALID_FS: u16 = 0x0001;
pub const ERROR_FS: u16 = 0x0002;
pub const ORPHAN_FS: u16 = 0x0004;

// Block group flags (spec §3 Group Descriptor) ---------------------------------
pub const BG_INODE_UNINIT: u16 = 0x0001;
pub const BG_BLOCK_UNINIT: u16 = 0x0002;
pub const BG_INODE_ZEROED: u16 = 0x0004;

// Inode flags (spec §3 Inode) ---------------------------------------------------
pub const INODE_SECRM_FL: u32 = 0x0000_0001;
pub const INODE_IMMUTABLE_FL: u32 = 0x0000_0010;
pub const INODE_APPEND_FL: u32 = 0x0000_0020;
pub const INODE_JOURNAL_DATA_FL: u32 = 0x0000_4000;
pub const INODE_TOPDIR_FL: u32 = 0x0002_0000;
pub const INODE_HUGE_FILE_FL: u32 = 0x0004_0000;
pub const INODE_EXTENTS_FL: u32 = 0x0008_0000;
pub const INODE_EA_INODE_FL: u32 = 0x0020_0000;
pub const INODE_EOFBLOCKS_FL: u32 = 0x0040_0000;

// Inode mode bits ------------------------------------------------------------
pub const S_IFMT: u16 = 0xF000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFDIR: u16 = 0x4000;

// Extent length encoding (spec §3 Extent Tree, resolved against
// ldiskfs_extents.h: EXT_INIT_MAX_LEN = 1<<15, EXT_UNINIT_MAX_LEN = that - 1).
pub const EXT_INIT_MAX_LEN: u32 = 1 << 15; // 32768
pub const EXT_UNINIT_MAX_LEN: u32 = EXT_INIT_MAX_LEN - 1; // 32767

/// Short-extent threshold for direct zero-out during uninit->init
/// conversion (spec §4.4.4): extents of at most 2*ZERO_LEN blocks are
/// zeroed in place rather than split.
pub const ZERO_LEN: u32 = 7;

// Default geometry -------------------------------------------------------------
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_INODE_SIZE: u16 = 256;
pub const GOOD_OLD_INODE_SIZE: u16 = 128;
pub const DEFAULT_RESERVED_PERCENT: u32 = 5;

/// Error-handling behaviours encoded in SB.errors (spec §4.1).
pub const ERRORS_CONTINUE: u16 = 1;
pub const ERRORS_RO: u16 = 2;
pub const ERRORS_PANIC: u16 = 3;

/// Maximum retries for an allocation before giving up on ENOSPC
/// (spec §4.2.1 `should_retry`).
pub const MAX_ALLOC_RETRIES: u32 = 3;
