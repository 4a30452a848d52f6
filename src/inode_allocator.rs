//! Inode allocation (spec §4.3 supplemented feature: "NEW_INODE"),
//! grounded on the same `core/inode_allocator.rs` as `inode_table.rs`'s
//! location math, generalized from its fixed-layout group choice to a
//! goal/Orlov-simplified placement policy across flex-groups.

use std::sync::atomic::Ordering;

use crate::bitmap::Bitmap;
use crate::constants::*;
use crate::error::{CoreError, Result};
use crate::journal::TransactionHandle;
use crate::mount::Filesystem;
use crate::structures::{Inode, Superblock};
use crate::types::{GroupNumber, InodeNumber};

/// Directory placement (spec §4.3 "Orlov, simplified per flex-group"):
/// among the groups in the parent's flex-group, pick the one with the
/// most free inodes (a proxy for "least loaded"), falling back to any
/// group in the filesystem with a free inode.
fn choose_dir_group(fs: &Filesystem, sb: &Superblock, parent_group: GroupNumber) -> Result<GroupNumber> {
    let groups = sb.groups_count()?;
    let gpf = fs.groups_per_flex(sb);
    let flex = fs.flex_group_of(sb, parent_group) as u32;
    let start = flex * gpf;
    let end = ((flex + 1) * gpf).min(groups);

    let mut best: Option<(GroupNumber, u32)> = None;
    for g in start..end {
        let gd = fs.read_gd(g)?;
        if gd.free_inodes_count() == 0 {
            continue;
        }
        let score = gd.free_inodes_count();
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((g, score));
        }
    }
    if let Some((g, _)) = best {
        return Ok(g);
    }
    for g in 0..groups {
        if fs.read_gd(g)?.free_inodes_count() > 0 {
            return Ok(g);
        }
    }
    Err(CoreError::NoSpace)
}

/// Non-directory placement (spec §4.3 "Other": parent's own group,
/// falling back to a linear scan).
fn choose_file_group(fs: &Filesystem, sb: &Superblock, parent_group: GroupNumber) -> Result<GroupNumber> {
    if fs.read_gd(parent_group)?.free_inodes_count() > 0 {
        return Ok(parent_group);
    }
    let groups = sb.groups_count()?;
    for g in 0..groups {
        if fs.read_gd(g)?.free_inodes_count() > 0 {
            return Ok(g);
        }
    }
    Err(CoreError::NoSpace)
}

fn load_or_init_inode_bitmap(fs: &Filesystem, handle: &mut TransactionHandle, group: GroupNumber) -> Result<Bitmap> {
    let sb = *fs.sb.read().unwrap();
    let gd = fs.read_gd(group)?;
    if gd.inode_uninit() {
        log::debug!("lazily fabricating inode bitmap for group {}", group);
        let bm = Bitmap::new(sb.inodes_per_group);
        let mut buf = vec![0u8; fs.block_size() as usize];
        bm.write_into(&mut buf);
        let block = gd.inode_bitmap();
        handle.get_write_access(block);
        fs.journal.dirty_metadata(handle, block, &buf)?;
        Ok(bm)
    } else {
        let buf = fs.read_block_cached(gd.inode_bitmap())?;
        Ok(Bitmap::from_block(&buf, sb.inodes_per_group))
    }
}

/// `claim_inode(group, is_dir)` (spec §4.3): finds the first clear bit
/// in `group`'s inode bitmap, marks it used, shrinks `itable_unused` to
/// cover it if needed, and returns the 1-based inode number.
pub fn claim_inode(fs: &Filesystem, handle: &mut TransactionHandle, group: GroupNumber, is_dir: bool) -> Result<InodeNumber> {
    let sb = *fs.sb.read().unwrap();
    let _lock = fs.group_locks[group as usize].lock().unwrap();
    let mut bm = load_or_init_inode_bitmap(fs, handle, group)?;
    let idx = bm
        .find_contiguous_clear(0, 1)
        .ok_or(CoreError::NoSpace)?;
    bm.set_range(idx, 1);

    let mut buf = vec![0u8; fs.block_size() as usize];
    bm.write_into(&mut buf);
    let gd = fs.read_gd(group)?;
    handle.get_write_access(gd.inode_bitmap());
    fs.journal.dirty_metadata(handle, gd.inode_bitmap(), &buf)?;

    let remaining_after = sb.inodes_per_group.saturating_sub(idx + 1);
    fs.update_gd(handle, group, |g| {
        let f = g.free_inodes_count();
        g.set_free_inodes_count(f.saturating_sub(1));
        if is_dir {
            g.set_used_dirs_count(g.used_dirs_count() + 1);
        }
        g.clear_inode_uninit();
        if g.itable_unused() > remaining_after {
            g.set_itable_unused(remaining_after);
        }
    })?;

    fs.counters.free_inodes.fetch_sub(1, Ordering::SeqCst);
    if is_dir {
        fs.counters.used_dirs.fetch_add(1, Ordering::SeqCst);
    }
    let flex = fs.flex_group_of(&sb, group);
    if let Some(fc) = fs.flex_counters.get(flex) {
        fc.free_inodes.fetch_sub(1, Ordering::SeqCst);
        if is_dir {
            fc.used_dirs.fetch_add(1, Ordering::SeqCst);
        }
    }

    Ok(group as u64 as InodeNumber * sb.inodes_per_group + idx + 1)
}

/// `new_inode(parent, mode)` (spec §4.3): chooses a placement group via
/// the Orlov-simplified policy for directories or the "Other" policy
/// for files, claims an inode number there, and writes a freshly
/// zeroed record with `mode`/`links_count` set. Returns the claimed
/// number and the record as written.
pub fn new_inode(
    fs: &Filesystem,
    handle: &mut TransactionHandle,
    parent_ino: InodeNumber,
    mode: u16,
) -> Result<(InodeNumber, Inode)> {
    if fs.is_readonly() {
        return Err(CoreError::Readonly);
    }
    let sb = *fs.sb.read().unwrap();
    let is_dir = mode & S_IFMT == S_IFDIR;
    let (parent_group, _, _) = crate::inode_table::inode_location(fs, &sb, parent_ino)?;
    let group = if is_dir {
        choose_dir_group(fs, &sb, parent_group)?
    } else {
        choose_file_group(fs, &sb, parent_group)?
    };
    let ino = claim_inode(fs, handle, group, is_dir)?;

    let mut inode = Inode::zeroed();
    inode.mode = mode;
    inode.links_count = if is_dir { 2 } else { 1 };
    crate::inode_table::write_inode(fs, handle, ino, &mut inode)?;
    Ok((ino, inode))
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
        sb.uuid = [13u8; 16];

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

        let mut bm = Bitmap::new(blocks_per_group);
        bm.set_range(0, used as u32);
        let mut bmbuf = vec![0u8; block_size as usize];
        bm.write_into(&mut bmbuf);
        dev.write_block(bitmap_b, &bmbuf).unwrap();

        crate::mount::mount(Arc::new(dev), MountConfig::default()).unwrap()
    }

    #[test]
    fn new_file_inode_claims_parents_group_and_updates_counters() {
        let fs = minimal_fs(64);
        let before_free = fs.read_gd(0).unwrap().free_inodes_count();
        let mut h = fs.journal.start(8).unwrap();
        let (ino, inode) = new_inode(&fs, &mut h, ROOT_INO, S_IFREG).unwrap();
        fs.commit(h).unwrap();

        assert!(ino > 0);
        assert_eq!(inode.mode, S_IFREG);
        assert_eq!(inode.links_count, 1);
        assert_eq!(fs.read_gd(0).unwrap().free_inodes_count(), before_free - 1);
        assert_eq!(
            fs.counters.free_inodes.load(Ordering::SeqCst),
            (before_free - 1) as u32
        );
    }

    #[test]
    fn new_dir_inode_bumps_used_dirs_and_links_count() {
        let fs = minimal_fs(64);
        let mut h = fs.journal.start(8).unwrap();
        let (_ino, inode) = new_inode(&fs, &mut h, ROOT_INO, S_IFDIR).unwrap();
        fs.commit(h).unwrap();

        assert_eq!(inode.links_count, 2);
        assert_eq!(fs.read_gd(0).unwrap().used_dirs_count(), 1);
        assert_eq!(fs.counters.used_dirs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn claim_inode_shrinks_itable_unused_to_cover_claimed_index() {
        let fs = minimal_fs(64);
        let mut h = fs.journal.start(8).unwrap();
        let ino = claim_inode(&fs, &mut h, 0, false).unwrap();
        fs.commit(h).unwrap();

        let idx = ino - 1;
        let gd = fs.read_gd(0).unwrap();
        assert_eq!(gd.itable_unused(), 64 - (idx + 1));
    }

    #[test]
    fn exhausting_free_inodes_returns_no_space() {
        let fs = minimal_fs(4);
        let mut h = fs.journal.start(32).unwrap();
        for _ in 0..4 {
            claim_inode(&fs, &mut h, 0, false).unwrap();
        }
        assert!(matches!(claim_inode(&fs, &mut h, 0, false), Err(CoreError::NoSpace)));
        fs.commit(h).unwrap();
    }
}
