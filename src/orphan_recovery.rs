//! Orphan inode recovery (spec §4.6.3), run once at mount when
//! `SB.last_orphan` is nonzero or `FEATURE_INCOMPAT_RECOVER` is set.
//! Grounded on `inode_table.rs`'s orphan chain (enqueue/dequeue) and
//! `extent_tree.rs`'s `remove_space`, generalized from "an unmount-time
//! command" to "a mount-time replay pass".
//!
//! Each entry in the chain is either a fully unlinked inode
//! (`links_count == 0`, freed outright) or one caught mid-truncate
//! (`links_count > 0`, trimmed back to its recorded size). Both cases
//! reduce to the same extent-tree unmap primitive.

use std::sync::atomic::Ordering;

use crate::bitmap::Bitmap;
use crate::error::Result;
use crate::extent_tree;
use crate::journal::TransactionHandle;
use crate::mount::Filesystem;
use crate::structures::Inode;
use crate::types::InodeNumber;

const RECOVERY_CREDITS: u32 = 64;

fn free_orphan_inode(fs: &Filesystem, handle: &mut TransactionHandle, ino: InodeNumber, mut inode: Inode) -> Result<()> {
    let was_dir = inode.is_dir();
    inode.mode = 0;
    inode.links_count = 0;
    inode.set_size(0);
    inode.set_blocks(0);
    let freed = extent_tree::remove_space(fs, handle, ino, &mut inode, 0, u32::MAX)?;
    log::info!("orphan recovery: deleted inode {}, freed {} blocks", ino, freed);
    free_inode_slot(fs, handle, ino, was_dir)
}

fn truncate_orphan_inode(fs: &Filesystem, handle: &mut TransactionHandle, ino: InodeNumber, mut inode: Inode) -> Result<()> {
    let bs = fs.block_size() as u64;
    let keep_blocks = ((inode.size() + bs - 1) / bs) as u32;
    let freed = extent_tree::remove_space(fs, handle, ino, &mut inode, keep_blocks, u32::MAX)?;
    log::info!("orphan recovery: truncated inode {} to {} blocks, freed {}", ino, keep_blocks, freed);
    Ok(())
}

/// Clears `ino`'s bit in its group's inode bitmap and rolls the
/// free-inode/used-dirs counters back, mirroring `inode_allocator::claim_inode`
/// in reverse.
fn free_inode_slot(fs: &Filesystem, handle: &mut TransactionHandle, ino: InodeNumber, was_dir: bool) -> Result<()> {
    let sb = *fs.sb.read().unwrap();
    let (group, _, _) = crate::inode_table::inode_location(fs, &sb, ino)?;
    let index = ((ino - 1) as u64 % sb.inodes_per_group as u64) as u32;

    let _lock = fs.group_locks[group as usize].lock().unwrap();
    let gd = fs.read_gd(group)?;
    let mut buf = fs.read_block_cached(gd.inode_bitmap())?;
    let mut bm = Bitmap::from_block(&buf, sb.inodes_per_group);
    bm.clear_range(index, 1);
    bm.write_into(&mut buf);
    handle.get_write_access(gd.inode_bitmap());
    fs.journal.dirty_metadata(handle, gd.inode_bitmap(), &buf)?;

    fs.update_gd(handle, group, |g| {
        g.set_free_inodes_count(g.free_inodes_count() + 1);
        if was_dir {
            g.set_used_dirs_count(g.used_dirs_count().saturating_sub(1));
        }
    })?;

    fs.counters.free_inodes.fetch_add(1, Ordering::SeqCst);
    if was_dir {
        fs.counters.used_dirs.fetch_sub(1, Ordering::SeqCst);
    }
    let flex = fs.flex_group_of(&sb, group);
    if let Some(fc) = fs.flex_counters.get(flex) {
        fc.free_inodes.fetch_add(1, Ordering::SeqCst);
        if was_dir {
            fc.used_dirs.fetch_sub(1, Ordering::SeqCst);
        }
    }
    Ok(())
}

/// `recover(fs)` (spec §4.6.3): walks the `SB.last_orphan` chain head to
/// tail, deleting or truncating each inode, dequeuing it as it goes. A
/// no-op when mounted read-only or the journal is already aborted —
/// the next writable mount retries.
pub fn recover(fs: &Filesystem) -> Result<()> {
    if fs.is_readonly() {
        return Ok(());
    }
    let head = fs.sb.read().unwrap().last_orphan;
    if head == 0 {
        return Ok(());
    }
    log::info!("replaying orphan inode list starting at inode {}", head);

    let mut ino = head;
    let mut processed = 0u32;
    while ino != 0 {
        let inode = crate::inode_table::read_inode(fs, ino)?;
        let next = inode.orphan_next();

        let mut handle = fs.journal.start(RECOVERY_CREDITS)?;
        if inode.links_count == 0 {
            free_orphan_inode(fs, &mut handle, ino, inode)?;
        } else {
            truncate_orphan_inode(fs, &mut handle, ino, inode)?;
        }
        crate::inode_table::orphan_del(fs, &mut handle, ino)?;
        fs.commit(handle)?;

        processed += 1;
        ino = next;
    }
    log::info!("orphan recovery complete: {} inode(s) processed", processed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::constants::*;
    use crate::device::test_support::MemDevice;
    use crate::extent_tree::insert_extent;
    use crate::structures::{as_bytes, ExtentLeaf, GroupDesc, Superblock};
    use std::sync::Arc;

    fn minimal_fs() -> Filesystem {
        let block_size = 4096u32;
        let blocks_per_group = 4096u32;
        let total_blocks = blocks_per_group as u64;
        let dev = MemDevice::new(block_size, total_blocks);

        let mut sb = Superblock::zeroed();
        sb.magic = SB_MAGIC;
        sb.log_block_size = 2;
        sb.first_data_block = 0;
        sb.set_blocks_count(total_blocks);
        sb.blocks_per_group = blocks_per_group;
        sb.inodes_per_group = 64;
        sb.inode_size = 256;
        sb.inodes_count = 64;
        sb.feature_ro_compat = FEATURE_RO_COMPAT_GDT_CSUM;
        sb.feature_incompat = FEATURE_INCOMPAT_EXTENTS;
        sb.desc_size = 32;
        sb.uuid = [31u8; 16];

        let desc_size = 32usize;
        let per_block = block_size as usize / desc_size;
        let gdt_blocks = 1usize;
        let itb_per_group = (64u64 * 256 + block_size as u64 - 1) / block_size as u64;

        let bitmap_b = 1 + gdt_blocks as u64;
        let ibitmap_b = bitmap_b + 1;
        let itable_b = ibitmap_b + 1;
        let used = 1 + gdt_blocks as u64 + 2 + itb_per_group;

        let mut gd = GroupDesc::zeroed();
        gd.set_block_bitmap(bitmap_b);
        gd.set_inode_bitmap(ibitmap_b);
        gd.set_inode_table(itable_b);
        gd.set_free_blocks_count((blocks_per_group as u64 - used) as u32);
        gd.set_free_inodes_count(63);
        gd.update_checksum(0, &sb);

        sb.set_free_blocks_count(blocks_per_group as u64 - used);
        sb.free_inodes_count = 63;
        sb.update_checksum();

        let mut buf = vec![0u8; block_size as usize];
        sb.write_to(&mut buf[1024..]).unwrap();
        dev.write_block(0, &buf).unwrap();

        let mut block_buf = vec![0u8; block_size as usize];
        block_buf[0..desc_size].copy_from_slice(as_bytes(&gd));
        dev.write_block(1, &block_buf).unwrap();

        let mut bm_blocks = Bitmap::new(blocks_per_group);
        bm_blocks.set_range(0, used as u32);
        let mut bmbuf = vec![0u8; block_size as usize];
        bm_blocks.write_into(&mut bmbuf);
        dev.write_block(bitmap_b, &bmbuf).unwrap();

        let mut bm_inodes = Bitmap::new(64);
        bm_inodes.set_range(0, 1);
        let mut ibmbuf = vec![0u8; block_size as usize];
        bm_inodes.write_into(&mut ibmbuf);
        dev.write_block(ibitmap_b, &ibmbuf).unwrap();

        let _ = per_block;
        crate::mount::mount(Arc::new(dev), MountConfig::default()).unwrap()
    }

    #[test]
    fn recover_deletes_unlinked_orphan_and_frees_its_blocks() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        inode.links_count = 0;
        let mut h = fs.journal.start(16).unwrap();
        insert_extent(&fs, &mut h, 10, &mut inode, ExtentLeaf::new(0, 5, false, 2000)).unwrap();
        crate::inode_table::orphan_add(&fs, &mut h, 10).unwrap();
        fs.commit(h).unwrap();
        assert_eq!(fs.sb.read().unwrap().last_orphan, 10);

        let before_free_blocks = fs.counters.free_blocks.load(Ordering::SeqCst);
        let before_free_inodes = fs.counters.free_inodes.load(Ordering::SeqCst);
        recover(&fs).unwrap();

        assert_eq!(fs.sb.read().unwrap().last_orphan, 0);
        assert_eq!(fs.counters.free_blocks.load(Ordering::SeqCst), before_free_blocks + 5);
        assert_eq!(fs.counters.free_inodes.load(Ordering::SeqCst), before_free_inodes + 1);
        let after = crate::inode_table::read_inode(&fs, 10).unwrap();
        assert_eq!(after.mode, 0);
    }

    #[test]
    fn recover_truncates_still_linked_orphan_to_recorded_size() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        inode.links_count = 1;
        inode.set_size(2 * 4096);
        let mut h = fs.journal.start(16).unwrap();
        insert_extent(&fs, &mut h, 11, &mut inode, ExtentLeaf::new(0, 10, false, 2100)).unwrap();
        crate::inode_table::orphan_add(&fs, &mut h, 11).unwrap();
        fs.commit(h).unwrap();

        recover(&fs).unwrap();

        assert_eq!(fs.sb.read().unwrap().last_orphan, 0);
        let leaves = extent_tree::walk(&fs, &crate::inode_table::read_inode(&fs, 11).unwrap()).unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].len(), 2);
    }

    #[test]
    fn recover_is_noop_when_no_orphans_pending() {
        let fs = minimal_fs();
        assert_eq!(fs.sb.read().unwrap().last_orphan, 0);
        recover(&fs).unwrap();
    }
}
