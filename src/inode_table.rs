//! Inode table component (spec §4.3): inode record read/write, orphan
//! chain enqueue/dequeue, and the lazy inode-table zeroing worker.
//! Grounded on `core/inode_allocator.rs`'s `InodeTable` location math,
//! generalized to the crate's journal façade instead of direct device
//! writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::constants::*;
use crate::error::{CoreError, Result};
use crate::journal::TransactionHandle;
use crate::mount::Filesystem;
use crate::structures::{Inode, Superblock};
use crate::types::{GroupNumber, InodeNumber};

const ZEROING_MIN_BACKOFF_MS: u64 = 50;
const ZEROING_MAX_BACKOFF_MS: u64 = 5_000;

/// `inode_location(ino)` (spec §4.3): resolves an inode number to the
/// group owning it, the device block holding its record, and the byte
/// offset of that record within the block.
pub fn inode_location(fs: &Filesystem, sb: &Superblock, ino: InodeNumber) -> Result<(GroupNumber, u64, usize)> {
    if ino == 0 || ino as u64 > sb.inodes_count as u64 {
        return Err(CoreError::Corrupt(format!("inode number {} out of range", ino)));
    }
    let index = (ino - 1) as u64;
    let group = (index / sb.inodes_per_group as u64) as GroupNumber;
    let index_in_group = index % sb.inodes_per_group as u64;
    let inodes_per_block = fs.inodes_per_block(sb);
    let block_in_table = index_in_group / inodes_per_block;
    let offset = (index_in_group % inodes_per_block) as usize * sb.inode_size as usize;
    let gd = fs.read_gd(group)?;
    Ok((group, gd.inode_table() + block_in_table, offset))
}

fn verify_inode_checksum(inode: &Inode, ino: InodeNumber, sb: &Superblock) -> bool {
    if !sb.has_metadata_csum() {
        return true;
    }
    let mut copy = *inode;
    let (lo, hi) = (copy.checksum_lo, copy.checksum_hi);
    copy.update_checksum(ino, sb);
    copy.checksum_lo == lo && copy.checksum_hi == hi
}

/// `read_inode(ino)` (spec §4.3). Checksum failure under METADATA_CSUM
/// is corruption, not a missing record (spec I3).
pub fn read_inode(fs: &Filesystem, ino: InodeNumber) -> Result<Inode> {
    let sb = *fs.sb.read().unwrap();
    let (group, block, offset) = inode_location(fs, &sb, ino)?;
    let _lock = fs.group_locks[group as usize].lock().unwrap();
    let buf = fs.read_block_cached(block)?;
    let size = sb.inode_size as usize;
    let end = (offset + size).min(buf.len());
    let inode = Inode::read_from(&buf[offset..end]);
    if !verify_inode_checksum(&inode, ino, &sb) {
        return Err(CoreError::Corrupt(format!("inode {} failed checksum verification", ino)));
    }
    Ok(inode)
}

/// `write_inode(ino, buf)` (spec §4.3): read-modify-write through the
/// journal under the owning group's lock.
pub fn write_inode(fs: &Filesystem, handle: &mut TransactionHandle, ino: InodeNumber, inode: &mut Inode) -> Result<()> {
    let sb = *fs.sb.read().unwrap();
    let (group, block, offset) = inode_location(fs, &sb, ino)?;
    inode.update_checksum(ino, &sb);
    let _lock = fs.group_locks[group as usize].lock().unwrap();
    let mut buf = fs.read_block_cached(block)?;
    let size = sb.inode_size as usize;
    let end = (offset + size).min(buf.len());
    inode.write_to(&mut buf[offset..end]);
    handle.get_write_access(block);
    fs.journal.dirty_metadata(handle, block, &buf)
}

/// Orphan enqueue (spec §4.3, §4.6.3): links `ino` at the head of
/// `SB.last_orphan` under the orphan mutex, then commits the
/// superblock write within the caller's transaction.
pub fn orphan_add(fs: &Filesystem, handle: &mut TransactionHandle, ino: InodeNumber) -> Result<()> {
    let _guard = fs.orphan_mutex.lock().unwrap();
    let mut inode = read_inode(fs, ino)?;
    let head = fs.sb.read().unwrap().last_orphan;
    inode.set_orphan_next(head);
    write_inode(fs, handle, ino, &mut inode)?;
    {
        let mut sb = fs.sb.write().unwrap();
        sb.last_orphan = ino;
        sb.state |= ORPHAN_FS;
    }
    fs.commit_super(handle)
}

/// Orphan dequeue (spec §4.3, §4.6.3): removes `ino` from the chain by
/// pointer-patching, from the head or the middle.
pub fn orphan_del(fs: &Filesystem, handle: &mut TransactionHandle, ino: InodeNumber) -> Result<()> {
    let _guard = fs.orphan_mutex.lock().unwrap();
    let head = fs.sb.read().unwrap().last_orphan;
    if head == 0 {
        return Ok(());
    }

    if head == ino {
        let mut inode = read_inode(fs, ino)?;
        let next = inode.orphan_next();
        inode.set_orphan_next(0);
        write_inode(fs, handle, ino, &mut inode)?;
        {
            let mut sb = fs.sb.write().unwrap();
            sb.last_orphan = next;
            if next == 0 {
                sb.state &= !ORPHAN_FS;
            }
        }
        return fs.commit_super(handle);
    }

    let mut prev = head;
    loop {
        let mut prev_inode = read_inode(fs, prev)?;
        let next = prev_inode.orphan_next();
        if next == 0 {
            return Err(CoreError::Corrupt(format!(
                "orphan {} not found walking chain from {}",
                ino, head
            )));
        }
        if next == ino {
            let mut target = read_inode(fs, ino)?;
            let after = target.orphan_next();
            prev_inode.set_orphan_next(after);
            write_inode(fs, handle, prev, &mut prev_inode)?;
            target.set_orphan_next(0);
            write_inode(fs, handle, ino, &mut target)?;
            return fs.commit_super(handle);
        }
        prev = next;
    }
}

/// Scans for one group with `INODE_UNINIT` cleared but `INODE_ZEROED`
/// unset, zero-fills the still-unused tail of its inode table under
/// the group's alloc-semaphore, and sets `INODE_ZEROED` under the
/// group lock (spec §4.3). Returns `Ok(true)` if a group was zeroed.
pub fn zero_one_uninitialized_group(fs: &Filesystem) -> Result<bool> {
    let groups = fs.gdt.read().unwrap().len() as GroupNumber;
    for group in 0..groups {
        let gd = fs.read_gd(group)?;
        if gd.inode_uninit() || gd.inode_zeroed() {
            continue;
        }
        let _alloc_guard = fs.alloc_sems[group as usize].write().unwrap();
        let gd = fs.read_gd(group)?;
        if gd.inode_uninit() || gd.inode_zeroed() {
            continue;
        }

        let sb = *fs.sb.read().unwrap();
        let itb_per_group = fs.itb_per_group(&sb);
        let unused_inodes = gd.itable_unused() as u64;
        let used_inodes = (sb.inodes_per_group as u64).saturating_sub(unused_inodes);
        let inodes_per_block = fs.inodes_per_block(&sb);
        let used_blocks = (used_inodes + inodes_per_block - 1) / inodes_per_block;

        let bs = fs.block_size() as usize;
        let zero_buf = vec![0u8; bs];
        let to_zero = itb_per_group.saturating_sub(used_blocks);
        let mut handle = fs.journal.start(to_zero.max(1) as u32 + 1)?;
        for b in used_blocks..itb_per_group {
            let block = gd.inode_table() + b;
            handle.get_write_access(block);
            fs.journal.dirty_metadata(&mut handle, block, &zero_buf)?;
        }
        fs.update_gd(&mut handle, group, |g| g.set_inode_zeroed())?;
        fs.commit(handle)?;
        log::debug!("lazily zeroed {} inode table blocks in group {}", to_zero, group);
        return Ok(true);
    }
    Ok(false)
}

/// Runs the lazy inode-table zeroing worker until `stop` is set: picks
/// the next uninitialized group, sleeps a randomized duration, and
/// backs off multiplicatively when a scan finds nothing to do (spec
/// §4.3).
pub fn run_lazy_zeroing_worker(fs: &Filesystem, stop: &AtomicBool) {
    let mut backoff_ms = ZEROING_MIN_BACKOFF_MS;
    while !stop.load(Ordering::SeqCst) {
        match zero_one_uninitialized_group(fs) {
            Ok(true) => backoff_ms = ZEROING_MIN_BACKOFF_MS,
            Ok(false) => backoff_ms = (backoff_ms * 2).min(ZEROING_MAX_BACKOFF_MS),
            Err(e) => {
                log::warn!("lazy inode-table zeroing worker error: {}", e);
                backoff_ms = (backoff_ms * 2).min(ZEROING_MAX_BACKOFF_MS);
            }
        }
        let jitter = rand::thread_rng().gen_range(0..backoff_ms.max(1));
        std::thread::sleep(Duration::from_millis(backoff_ms + jitter));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::device::test_support::MemDevice;
    use crate::structures::{as_bytes, GroupDesc};
    use std::sync::Arc;

    fn minimal_fs(inodes_per_group: u32) -> Filesystem {
        let block_size = 4096u32;
        let blocks_per_group = 1024u32;
        let groups = 1u32;
        let total_blocks = blocks_per_group as u64 * groups as u64;
        let dev = MemDevice::new(block_size, total_blocks);

        let mut sb = Superblock::zeroed();
        sb.magic = SB_MAGIC;
        sb.log_block_size = 2;
        sb.first_data_block = 0;
        sb.set_blocks_count(total_blocks);
        sb.blocks_per_group = blocks_per_group;
        sb.inodes_per_group = inodes_per_group;
        sb.inode_size = 256;
        sb.inodes_count = inodes_per_group * groups;
        sb.feature_ro_compat = FEATURE_RO_COMPAT_GDT_CSUM;
        sb.feature_incompat = FEATURE_INCOMPAT_EXTENTS;
        sb.desc_size = 32;
        sb.uuid = [5u8; 16];

        let desc_size = 32usize;
        let per_block = block_size as usize / desc_size;
        let gdt_blocks = (groups as usize + per_block - 1) / per_block;
        let itb_per_group = (inodes_per_group as u64 * 256 + block_size as u64 - 1) / block_size as u64;

        let bitmap_b = 1 + gdt_blocks as u64;
        let ibitmap_b = bitmap_b + 1;
        let itable_b = ibitmap_b + 1;
        let used = 1 + gdt_blocks as u64 + 2 + itb_per_group;

        let mut gd = GroupDesc::zeroed();
        gd.set_block_bitmap(bitmap_b);
        gd.set_inode_bitmap(ibitmap_b);
        gd.set_inode_table(itable_b);
        gd.set_free_blocks_count((blocks_per_group as u64 - used) as u32);
        gd.set_free_inodes_count(inodes_per_group);
        gd.set_itable_unused(inodes_per_group);
        gd.update_checksum(0, &sb);

        sb.set_free_blocks_count(blocks_per_group as u64 - used);
        sb.free_inodes_count = inodes_per_group;
        sb.update_checksum();

        let mut buf = vec![0u8; block_size as usize];
        sb.write_to(&mut buf[1024..]).unwrap();
        dev.write_block(0, &buf).unwrap();

        let mut block_buf = vec![0u8; block_size as usize];
        block_buf[0..desc_size].copy_from_slice(as_bytes(&gd));
        dev.write_block(1, &block_buf).unwrap();

        let mut bm = crate::bitmap::Bitmap::new(blocks_per_group);
        bm.set_range(0, used as u32);
        let mut bmbuf = vec![0u8; block_size as usize];
        bm.write_into(&mut bmbuf);
        dev.write_block(bitmap_b, &bmbuf).unwrap();

        crate::mount::mount(Arc::new(dev), MountConfig::default()).unwrap()
    }

    #[test]
    fn write_then_read_inode_round_trips() {
        let fs = minimal_fs(64);
        let mut h = fs.journal.start(4).unwrap();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        inode.set_size(12345);
        write_inode(&fs, &mut h, 12, &mut inode).unwrap();
        fs.commit(h).unwrap();

        let back = read_inode(&fs, 12).unwrap();
        assert_eq!(back.size(), 12345);
        assert_eq!(back.mode, S_IFREG);
    }

    #[test]
    fn inode_location_rejects_out_of_range_numbers() {
        let fs = minimal_fs(64);
        let sb = *fs.sb.read().unwrap();
        assert!(inode_location(&fs, &sb, 0).is_err());
        assert!(inode_location(&fs, &sb, 65).is_err());
        assert!(inode_location(&fs, &sb, 64).is_ok());
    }

    #[test]
    fn orphan_add_then_del_from_head_clears_chain() {
        let fs = minimal_fs(64);
        let mut h = fs.journal.start(8).unwrap();
        orphan_add(&fs, &mut h, 10).unwrap();
        fs.commit(h).unwrap();
        assert_eq!(fs.sb.read().unwrap().last_orphan, 10);

        let mut h = fs.journal.start(8).unwrap();
        orphan_del(&fs, &mut h, 10).unwrap();
        fs.commit(h).unwrap();
        assert_eq!(fs.sb.read().unwrap().last_orphan, 0);
        assert_eq!(fs.sb.read().unwrap().state & ORPHAN_FS, 0);
    }

    #[test]
    fn orphan_del_from_middle_patches_chain() {
        let fs = minimal_fs(64);
        let mut h = fs.journal.start(8).unwrap();
        orphan_add(&fs, &mut h, 10).unwrap();
        orphan_add(&fs, &mut h, 11).unwrap();
        orphan_add(&fs, &mut h, 12).unwrap();
        fs.commit(h).unwrap();
        // chain head is 12 -> 11 -> 10 -> 0
        assert_eq!(fs.sb.read().unwrap().last_orphan, 12);

        let mut h = fs.journal.start(8).unwrap();
        orphan_del(&fs, &mut h, 11).unwrap();
        fs.commit(h).unwrap();

        let head = read_inode(&fs, 12).unwrap();
        assert_eq!(head.orphan_next(), 10);
    }

    #[test]
    fn zeroing_worker_sets_flag_once_and_skips_already_zeroed_groups() {
        let fs = minimal_fs(64);
        assert!(zero_one_uninitialized_group(&fs).unwrap());
        assert!(fs.read_gd(0).unwrap().inode_zeroed());
        assert!(!zero_one_uninitialized_group(&fs).unwrap());
    }
}
