//! Group descriptor record (spec §3 GD, §6): 32 bytes legacy, 64 bytes
//! with the 64BIT feature.

use static_assertions::assert_eq_size;

use crate::checksum;
use crate::constants::*;
use crate::types::BlockNumber;

use super::as_bytes;
use super::superblock::Superblock;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GroupDesc {
    /* 0x00 */ pub block_bitmap_lo: u32,
    /* 0x04 */ pub inode_bitmap_lo: u32,
    /* 0x08 */ pub inode_table_lo: u32,
    /* 0x0C */ pub free_blocks_count_lo: u16,
    /* 0x0E */ pub free_inodes_count_lo: u16,
    /* 0x10 */ pub used_dirs_count_lo: u16,
    /* 0x12 */ pub flags: u16,
    /* 0x14 */ pub exclude_bitmap_lo: u32,
    /* 0x18 */ pub block_bitmap_csum_lo: u16,
    /* 0x1A */ pub inode_bitmap_csum_lo: u16,
    /* 0x1C */ pub itable_unused_lo: u16,
    /* 0x1E */ pub checksum: u16,
    /* 0x20 */ pub block_bitmap_hi: u32,
    /* 0x24 */ pub inode_bitmap_hi: u32,
    /* 0x28 */ pub inode_table_hi: u32,
    /* 0x2C */ pub free_blocks_count_hi: u16,
    /* 0x2E */ pub free_inodes_count_hi: u16,
    /* 0x30 */ pub used_dirs_count_hi: u16,
    /* 0x32 */ pub itable_unused_hi: u16,
    /* 0x34 */ pub exclude_bitmap_hi: u32,
    /* 0x38 */ pub block_bitmap_csum_hi: u16,
    /* 0x3A */ pub inode_bitmap_csum_hi: u16,
    /* 0x3C */ pub reserved: u32,
}

assert_eq_size!(GroupDesc, [u8; 64]);

impl GroupDesc {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn block_bitmap(&self) -> BlockNumber {
        (self.block_bitmap_lo as u64) | ((self.block_bitmap_hi as u64) << 32)
    }

    pub fn set_block_bitmap(&mut self, block: BlockNumber) {
        self.block_bitmap_lo = block as u32;
        self.block_bitmap_hi = (block >> 32) as u32;
    }

    pub fn inode_bitmap(&self) -> BlockNumber {
        (self.inode_bitmap_lo as u64) | ((self.inode_bitmap_hi as u64) << 32)
    }

    pub fn set_inode_bitmap(&mut self, block: BlockNumber) {
        self.inode_bitmap_lo = block as u32;
        self.inode_bitmap_hi = (block >> 32) as u32;
    }

    pub fn inode_table(&self) -> BlockNumber {
        (self.inode_table_lo as u64) | ((self.inode_table_hi as u64) << 32)
    }

    pub fn set_inode_table(&mut self, block: BlockNumber) {
        self.inode_table_lo = block as u32;
        self.inode_table_hi = (block >> 32) as u32;
    }

    pub fn free_blocks_count(&self) -> u32 {
        (self.free_blocks_count_lo as u32) | ((self.free_blocks_count_hi as u32) << 16)
    }

    pub fn set_free_blocks_count(&mut self, count: u32) {
        self.free_blocks_count_lo = count as u16;
        self.free_blocks_count_hi = (count >> 16) as u16;
    }

    pub fn free_inodes_count(&self) -> u32 {
        (self.free_inodes_count_lo as u32) | ((self.free_inodes_count_hi as u32) << 16)
    }

    pub fn set_free_inodes_count(&mut self, count: u32) {
        self.free_inodes_count_lo = count as u16;
        self.free_inodes_count_hi = (count >> 16) as u16;
    }

    pub fn used_dirs_count(&self) -> u32 {
        (self.used_dirs_count_lo as u32) | ((self.used_dirs_count_hi as u32) << 16)
    }

    pub fn set_used_dirs_count(&mut self, count: u32) {
        self.used_dirs_count_lo = count as u16;
        self.used_dirs_count_hi = (count >> 16) as u16;
    }

    pub fn itable_unused(&self) -> u32 {
        (self.itable_unused_lo as u32) | ((self.itable_unused_hi as u32) << 16)
    }

    pub fn set_itable_unused(&mut self, count: u32) {
        self.itable_unused_lo = count as u16;
        self.itable_unused_hi = (count >> 16) as u16;
    }

    pub fn block_uninit(&self) -> bool {
        self.flags & BG_BLOCK_UNINIT != 0
    }

    pub fn inode_uninit(&self) -> bool {
        self.flags & BG_INODE_UNINIT != 0
    }

    pub fn inode_zeroed(&self) -> bool {
        self.flags & BG_INODE_ZEROED != 0
    }

    pub fn clear_block_uninit(&mut self) {
        self.flags &= !BG_BLOCK_UNINIT;
    }

    pub fn clear_inode_uninit(&mut self) {
        self.flags &= !BG_INODE_UNINIT;
    }

    pub fn set_inode_zeroed(&mut self) {
        self.flags |= BG_INODE_ZEROED;
    }

    /// Recomputes and stores the checksum (spec §3 GD, §6): CRC16 seeded
    /// `~0` over `uuid ∥ group_index_le32 ∥ descriptor_bytes` with the
    /// checksum field zeroed, or CRC32c of the same span under
    /// METADATA_CSUM.
    pub fn update_checksum(&mut self, group: u32, sb: &Superblock) {
        if !sb.has_gdt_csum() && !sb.has_metadata_csum() {
            return;
        }
        self.checksum = 0;
        let desc_size = sb.desc_size() as usize;
        let bytes = &as_bytes(self)[..desc_size];
        self.checksum = if sb.has_metadata_csum() {
            let seed = checksum::checksum_seed(&sb.uuid, Some(sb.checksum_seed));
            checksum::group_desc_checksum_crc32c(bytes, seed, group, desc_size)
        } else {
            checksum::group_desc_checksum_crc16(bytes, &sb.uuid, group, desc_size)
        };
    }

    /// Verifies the stored checksum (spec I3). Corruption here marks the
    /// whole group read-only for allocation (spec §3 GD invariant).
    pub fn verify_checksum(&self, group: u32, sb: &Superblock) -> bool {
        if !sb.has_gdt_csum() && !sb.has_metadata_csum() {
            return true;
        }
        let mut copy = *self;
        let stored = copy.checksum;
        copy.update_checksum(group, sb);
        copy.checksum == stored
    }
}

impl Default for GroupDesc {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structures::superblock::Superblock;

    fn sb_with_csum() -> Superblock {
        let mut sb = Superblock::zeroed();
        sb.magic = SB_MAGIC;
        sb.feature_ro_compat = FEATURE_RO_COMPAT_GDT_CSUM;
        sb.uuid = [7u8; 16];
        sb
    }

    #[test]
    fn checksum_round_trips() {
        let sb = sb_with_csum();
        let mut gd = GroupDesc::zeroed();
        gd.set_block_bitmap(10);
        gd.set_inode_bitmap(11);
        gd.set_inode_table(12);
        gd.update_checksum(0, &sb);
        assert!(gd.verify_checksum(0, &sb));
    }

    #[test]
    fn checksum_changes_with_group_index() {
        let sb = sb_with_csum();
        let mut gd = GroupDesc::zeroed();
        gd.update_checksum(0, &sb);
        let csum_g0 = gd.checksum;
        gd.update_checksum(1, &sb);
        assert_ne!(gd.checksum, csum_g0);
    }

    #[test]
    fn uninit_flags_round_trip() {
        let mut gd = GroupDesc::zeroed();
        gd.flags = BG_BLOCK_UNINIT | BG_INODE_UNINIT;
        assert!(gd.block_uninit());
        assert!(gd.inode_uninit());
        gd.clear_block_uninit();
        assert!(!gd.block_uninit());
        assert!(gd.inode_uninit());
    }
}
