//! Superblock record (spec §3 SB, §6): 1024 bytes at byte offset 1024 of
//! the device, independent of block size.

use static_assertions::assert_eq_size;

use crate::checksum;
use crate::constants::*;
use crate::error::{CoreError, Result};

use super::{as_bytes, as_bytes_mut};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    /* 0x000 */ pub inodes_count: u32,
    /* 0x004 */ pub blocks_count_lo: u32,
    /* 0x008 */ pub r_blocks_count_lo: u32,
    /* 0x00C */ pub free_blocks_count_lo: u32,
    /* 0x010 */ pub free_inodes_count: u32,
    /* 0x014 */ pub first_data_block: u32,
    /* 0x018 */ pub log_block_size: u32,
    /* 0x01C */ pub log_cluster_size: u32,
    /* 0x020 */ pub blocks_per_group: u32,
    /* 0x024 */ pub clusters_per_group: u32,
    /* 0x028 */ pub inodes_per_group: u32,
    /* 0x02C */ pub mtime: u32,
    /* 0x030 */ pub wtime: u32,
    /* 0x034 */ pub mnt_count: u16,
    /* 0x036 */ pub max_mnt_count: u16,
    /* 0x038 */ pub magic: u16,
    /* 0x03A */ pub state: u16,
    /* 0x03C */ pub errors: u16,
    /* 0x03E */ pub minor_rev_level: u16,
    /* 0x040 */ pub lastcheck: u32,
    /* 0x044 */ pub checkinterval: u32,
    /* 0x048 */ pub creator_os: u32,
    /* 0x04C */ pub rev_level: u32,
    /* 0x050 */ pub def_resuid: u16,
    /* 0x052 */ pub def_resgid: u16,
    /* 0x054 */ pub first_ino: u32,
    /* 0x058 */ pub inode_size: u16,
    /* 0x05A */ pub block_group_nr: u16,
    /* 0x05C */ pub feature_compat: u32,
    /* 0x060 */ pub feature_incompat: u32,
    /* 0x064 */ pub feature_ro_compat: u32,
    /* 0x068 */ pub uuid: [u8; 16],
    /* 0x078 */ pub volume_name: [u8; 16],
    /* 0x088 */ pub last_mounted: [u8; 64],
    /* 0x0C8 */ pub algorithm_usage_bitmap: u32,
    /* 0x0CC */ pub prealloc_blocks: u8,
    /* 0x0CD */ pub prealloc_dir_blocks: u8,
    /* 0x0CE */ pub reserved_gdt_blocks: u16,
    /* 0x0D0 */ pub journal_uuid: [u8; 16],
    /* 0x0E0 */ pub journal_inum: u32,
    /* 0x0E4 */ pub journal_dev: u32,
    /* 0x0E8 */ pub last_orphan: u32,
    /* 0x0EC */ pub hash_seed: [u32; 4],
    /* 0x0FC */ pub def_hash_version: u8,
    /* 0x0FD */ pub jnl_backup_type: u8,
    /* 0x0FE */ pub desc_size: u16,
    /* 0x100 */ pub default_mount_opts: u32,
    /* 0x104 */ pub first_meta_bg: u32,
    /* 0x108 */ pub mkfs_time: u32,
    /* 0x10C */ pub jnl_blocks: [u32; 17],
    /* 0x150 */ pub blocks_count_hi: u32,
    /* 0x154 */ pub r_blocks_count_hi: u32,
    /* 0x158 */ pub free_blocks_count_hi: u32,
    /* 0x15C */ pub min_extra_isize: u16,
    /* 0x15E */ pub want_extra_isize: u16,
    /* 0x160 */ pub flags: u32,
    /* 0x164 */ pub raid_stride: u16,
    /* 0x166 */ pub mmp_interval: u16,
    /* 0x168 */ pub mmp_block: u64,
    /* 0x170 */ pub raid_stripe_width: u32,
    /* 0x174 */ pub log_groups_per_flex: u8,
    /* 0x175 */ pub checksum_type: u8,
    /* 0x176 */ pub reserved_pad: u16,
    /* 0x178 */ pub kbytes_written: u64,
    /* 0x180 */ pub snapshot_inum: u32,
    /* 0x184 */ pub snapshot_id: u32,
    /* 0x188 */ pub snapshot_r_blocks_count: u64,
    /* 0x190 */ pub snapshot_list: u32,
    /* 0x194 */ pub error_count: u32,
    /* 0x198 */ pub first_error_time: u32,
    /* 0x19C */ pub first_error_ino: u32,
    /* 0x1A0 */ pub first_error_block: u64,
    /* 0x1A8 */ pub first_error_func: [u8; 32],
    /* 0x1C8 */ pub first_error_line: u32,
    /* 0x1CC */ pub last_error_time: u32,
    /* 0x1D0 */ pub last_error_ino: u32,
    /* 0x1D4 */ pub last_error_line: u32,
    /* 0x1D8 */ pub last_error_block: u64,
    /* 0x1E0 */ pub last_error_func: [u8; 32],
    /* 0x200 */ pub mount_opts: [u8; 64],
    /* 0x240 */ pub usr_quota_inum: u32,
    /* 0x244 */ pub grp_quota_inum: u32,
    /* 0x248 */ pub overhead_blocks: u32,
    /* 0x24C */ pub backup_bgs: [u32; 2],
    /* 0x254 */ pub encrypt_algos: [u8; 4],
    /* 0x258 */ pub encrypt_pw_salt: [u8; 16],
    /* 0x268 */ pub lpf_ino: u32,
    /* 0x26C */ pub prj_quota_inum: u32,
    /* 0x270 */ pub checksum_seed: u32,
    /* 0x274 */ pub reserved: [u32; 98],
    /* 0x3FC */ pub checksum: u32,
}

assert_eq_size!(Superblock, [u8; 1024]);

impl Superblock {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size
    }

    pub fn blocks_count(&self) -> u64 {
        (self.blocks_count_lo as u64) | ((self.blocks_count_hi as u64) << 32)
    }

    pub fn set_blocks_count(&mut self, count: u64) {
        self.blocks_count_lo = count as u32;
        self.blocks_count_hi = (count >> 32) as u32;
    }

    pub fn free_blocks_count(&self) -> u64 {
        (self.free_blocks_count_lo as u64) | ((self.free_blocks_count_hi as u64) << 32)
    }

    pub fn set_free_blocks_count(&mut self, count: u64) {
        self.free_blocks_count_lo = count as u32;
        self.free_blocks_count_hi = (count >> 32) as u32;
    }

    pub fn reserved_blocks_count(&self) -> u64 {
        (self.r_blocks_count_lo as u64) | ((self.r_blocks_count_hi as u64) << 32)
    }

    pub fn has_64bit(&self) -> bool {
        self.feature_incompat & FEATURE_INCOMPAT_64BIT != 0
    }

    pub fn has_gdt_csum(&self) -> bool {
        self.feature_ro_compat & FEATURE_RO_COMPAT_GDT_CSUM != 0
    }

    pub fn has_metadata_csum(&self) -> bool {
        self.feature_ro_compat & FEATURE_RO_COMPAT_METADATA_CSUM != 0
    }

    pub fn groups_count(&self) -> Result<u32> {
        let total = self.blocks_count() - self.first_data_block as u64;
        let bpg = self.blocks_per_group as u64;
        if bpg == 0 {
            return Err(CoreError::Corrupt("blocks_per_group is zero".into()));
        }
        let groups = (total + bpg - 1) / bpg;
        if groups > u32::MAX as u64 {
            return Err(CoreError::Corrupt("groups_count overflows 32 bits".into()));
        }
        Ok(groups as u32)
    }

    pub fn desc_size(&self) -> u16 {
        if self.has_64bit() && self.desc_size > 32 {
            self.desc_size
        } else {
            32
        }
    }

    /// Validates magic, revision, geometry per spec §4.1's `mount` contract.
    /// Does not apply the RO_COMPAT/INCOMPAT feature-gating rule — that
    /// decision (fail vs. mount-RO) belongs to the caller in `mount.rs`,
    /// which needs to know *which* bits are unknown.
    pub fn validate(&self) -> Result<()> {
        if self.magic != SB_MAGIC {
            return Err(CoreError::Corrupt(format!(
                "bad superblock magic 0x{:04x}",
                self.magic
            )));
        }
        let bs = self.block_size();
        if bs < MIN_BLOCK_SIZE || bs > MAX_BLOCK_SIZE || !bs.is_power_of_two() {
            return Err(CoreError::Corrupt(format!("bad block size {}", bs)));
        }
        if self.first_data_block as u64 >= self.blocks_count() {
            return Err(CoreError::Corrupt(
                "first_data_block >= blocks_count".into(),
            ));
        }
        self.groups_count()?;
        if self.inodes_per_group as u64 > 8 * bs as u64 {
            return Err(CoreError::Corrupt("inodes_per_group too large".into()));
        }
        if self.blocks_per_group as u64 > 8 * bs as u64 {
            return Err(CoreError::Corrupt("blocks_per_group too large".into()));
        }
        Ok(())
    }

    fn csum_seed(&self) -> u32 {
        checksum::checksum_seed(
            &self.uuid,
            self.has_metadata_csum().then_some(self.checksum_seed),
        )
    }

    pub fn update_checksum(&mut self) {
        if !self.has_gdt_csum() && !self.has_metadata_csum() {
            return;
        }
        let seed = self.csum_seed();
        let bytes = as_bytes(self);
        self.checksum = checksum::superblock_checksum(bytes, seed);
    }

    pub fn verify_checksum(&self) -> bool {
        if !self.has_gdt_csum() && !self.has_metadata_csum() {
            return true;
        }
        let seed = self.csum_seed();
        let bytes = as_bytes(self);
        checksum::superblock_checksum(bytes, seed) == self.checksum
    }

    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < 1024 {
            return Err(CoreError::IoError("superblock buffer too short".into()));
        }
        Ok(super::from_bytes(&buf[0..1024]))
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < 1024 {
            return Err(CoreError::IoError("superblock buffer too short".into()));
        }
        buf[0..1024].copy_from_slice(as_bytes(self));
        Ok(())
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_sb() -> Superblock {
        let mut sb = Superblock::zeroed();
        sb.magic = SB_MAGIC;
        sb.log_block_size = 2; // 4096
        sb.blocks_count_lo = 100_000;
        sb.blocks_per_group = 32768;
        sb.inodes_per_group = 8192;
        sb.first_data_block = 0;
        sb.feature_ro_compat = FEATURE_RO_COMPAT_GDT_CSUM;
        sb
    }

    #[test]
    fn validates_well_formed_superblock() {
        assert!(minimal_sb().validate().is_ok());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut sb = minimal_sb();
        sb.magic = 0;
        assert!(sb.validate().is_err());
    }

    #[test]
    fn groups_count_rounds_up() {
        let sb = minimal_sb();
        assert_eq!(sb.groups_count().unwrap(), 4);
    }

    #[test]
    fn checksum_round_trips_through_buffer() {
        let mut sb = minimal_sb();
        sb.update_checksum();
        let mut buf = [0u8; 1024];
        sb.write_to(&mut buf).unwrap();
        let back = Superblock::read_from(&buf).unwrap();
        assert!(back.verify_checksum());
    }

    #[test]
    fn as_bytes_mut_allows_in_place_poke() {
        let mut sb = minimal_sb();
        as_bytes_mut(&mut sb)[0x3A] = 0xAB;
        assert_eq!(sb.state & 0xFF, 0xAB);
    }
}
