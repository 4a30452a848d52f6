//! Extent tree component (spec §4.4): logical-to-physical block mapping
//! stored as a small B+tree rooted inline in the inode's 60-byte block
//! region. Grounded on `writer/extent_tree_ops.rs`'s `ExtentTreeOps`
//! (`find_extent`/`insert_extent`/`merge_extents`/`split_node`),
//! reworked to decode/encode each entry through
//! [`crate::structures::from_bytes`]/`as_bytes` (safe under
//! `read_unaligned`) instead of aliasing the node buffer as a typed
//! slice, and to operate against the journal/block-allocator seams of
//! this crate instead of a single in-memory formatting pass.

use crate::block_allocator::{self, AllocCaller};
use crate::constants::*;
use crate::error::{CoreError, Result};
use crate::journal::TransactionHandle;
use crate::mount::Filesystem;
use crate::structures::inode::BLOCK_REGION_LEN;
use crate::structures::{self, ExtentIndex, ExtentLeaf, ExtentNodeHeader, Inode, Superblock};
use crate::types::{AllocFlags, BlockNumber, GroupNumber, InodeNumber};

/// Flags accepted by [`get_blocks`] (spec §4.4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct GetBlocksFlags {
    /// Allocate and map a hole instead of reporting it as unmapped.
    pub create: bool,
    /// The extent inserted for a `create` allocation is marked uninitialized
    /// (preallocation) rather than initialized.
    pub uninit: bool,
}

const HEADER_SIZE: usize = 12;
const ENTRY_SIZE: usize = 12;

fn root_capacity() -> u16 {
    ((BLOCK_REGION_LEN - HEADER_SIZE) / ENTRY_SIZE) as u16
}

fn block_capacity(fs: &Filesystem) -> u16 {
    ((fs.block_size() as usize - HEADER_SIZE) / ENTRY_SIZE) as u16
}

#[derive(Debug, Clone)]
struct ExtentNode {
    header: ExtentNodeHeader,
    leaves: Vec<ExtentLeaf>,
    indexes: Vec<ExtentIndex>,
}

fn decode_node(buf: &[u8]) -> Result<ExtentNode> {
    if buf.len() < HEADER_SIZE {
        return Err(CoreError::Corrupt("extent node buffer too short".into()));
    }
    let header: ExtentNodeHeader = structures::from_bytes(&buf[0..HEADER_SIZE]);
    if header.magic != EXTENT_MAGIC {
        return Err(CoreError::Corrupt(format!("bad extent node magic 0x{:04x}", header.magic)));
    }
    let mut leaves = Vec::new();
    let mut indexes = Vec::new();
    for i in 0..header.entries as usize {
        let off = HEADER_SIZE + i * ENTRY_SIZE;
        if off + ENTRY_SIZE > buf.len() {
            return Err(CoreError::Corrupt("extent node entry count exceeds buffer".into()));
        }
        if header.is_leaf() {
            leaves.push(structures::from_bytes::<ExtentLeaf>(&buf[off..off + ENTRY_SIZE]));
        } else {
            indexes.push(structures::from_bytes::<ExtentIndex>(&buf[off..off + ENTRY_SIZE]));
        }
    }
    Ok(ExtentNode { header, leaves, indexes })
}

fn encode_node(node: &ExtentNode, buf: &mut [u8]) {
    buf.fill(0);
    buf[0..HEADER_SIZE].copy_from_slice(structures::as_bytes(&node.header));
    if node.header.is_leaf() {
        for (i, e) in node.leaves.iter().enumerate() {
            let off = HEADER_SIZE + i * ENTRY_SIZE;
            buf[off..off + ENTRY_SIZE].copy_from_slice(structures::as_bytes(e));
        }
    } else {
        for (i, e) in node.indexes.iter().enumerate() {
            let off = HEADER_SIZE + i * ENTRY_SIZE;
            buf[off..off + ENTRY_SIZE].copy_from_slice(structures::as_bytes(e));
        }
    }
}

fn ensure_extent_root(inode: &mut Inode) {
    if inode.uses_extents() {
        return;
    }
    inode.flags |= INODE_EXTENTS_FL;
    let node = ExtentNode {
        header: ExtentNodeHeader::new(0, root_capacity()),
        leaves: Vec::new(),
        indexes: Vec::new(),
    };
    encode_node(&node, inode.block_region_mut());
}

fn read_node(fs: &Filesystem, inode: &Inode, block: Option<BlockNumber>) -> Result<ExtentNode> {
    match block {
        None => decode_node(inode.block_region()),
        Some(b) => decode_node(&fs.read_block_cached(b)?),
    }
}

fn write_node(
    fs: &Filesystem,
    handle: &mut TransactionHandle,
    inode: &mut Inode,
    block: Option<BlockNumber>,
    node: &ExtentNode,
) -> Result<()> {
    match block {
        None => {
            encode_node(node, inode.block_region_mut());
            Ok(())
        }
        Some(b) => {
            let bs = fs.block_size() as usize;
            let mut buf = vec![0u8; bs];
            encode_node(node, &mut buf);
            handle.get_write_access(b);
            fs.journal.dirty_metadata(handle, b, &buf)
        }
    }
}

struct PathLevel {
    block: Option<BlockNumber>,
    node: ExtentNode,
    slot: usize,
}

fn search_slot_leaf(leaves: &[ExtentLeaf], logical: u32) -> usize {
    let mut slot = 0usize;
    for (i, e) in leaves.iter().enumerate() {
        if e.first_logical <= logical {
            slot = i;
        } else {
            break;
        }
    }
    slot
}

fn search_slot_index(indexes: &[ExtentIndex], logical: u32) -> usize {
    let mut slot = 0usize;
    for (i, e) in indexes.iter().enumerate() {
        if e.first_logical <= logical {
            slot = i;
        } else {
            break;
        }
    }
    slot
}

/// `find_extent`-style path walk (spec §4.4.1): returns the chain of
/// nodes visited from the root down to the leaf that would contain
/// `logical`, one [`PathLevel`] per depth.
fn find_path(fs: &Filesystem, inode: &Inode, logical: u32) -> Result<Vec<PathLevel>> {
    let mut path = Vec::new();
    let mut block: Option<BlockNumber> = None;
    loop {
        let node = read_node(fs, inode, block)?;
        let is_leaf = node.header.is_leaf();
        if is_leaf {
            let slot = search_slot_leaf(&node.leaves, logical);
            path.push(PathLevel { block, node, slot });
            break;
        }
        let slot = search_slot_index(&node.indexes, logical);
        if node.indexes.is_empty() {
            path.push(PathLevel { block, node, slot });
            break;
        }
        let child = node.indexes[slot].child();
        path.push(PathLevel { block, node, slot });
        block = Some(child);
    }
    Ok(path)
}

fn allocate_metadata_block(fs: &Filesystem, handle: &mut TransactionHandle, inode_num: InodeNumber) -> Result<BlockNumber> {
    let sb = *fs.sb.read().unwrap();
    let group = ((inode_num - 1) / sb.inodes_per_group.max(1)) as GroupNumber;
    let caller = AllocCaller::default();
    let flags = AllocFlags {
        metadata_nofail: true,
        ..Default::default()
    };
    let (phys, _count) = block_allocator::allocate_blocks(fs, handle, &caller, group, 0, 1, flags)?;
    Ok(phys)
}

/// Maps an absolute physical block to the `(group, offset-in-group)` pair
/// `block_allocator::allocate_blocks` takes as a goal hint.
fn group_and_offset(sb: &Superblock, phys: u64) -> (GroupNumber, u32) {
    let rel = phys.saturating_sub(sb.first_data_block as u64);
    let bpg = sb.blocks_per_group.max(1) as u64;
    ((rel / bpg) as GroupNumber, (rel % bpg) as u32)
}

/// `ext4_ext_find_goal` (spec §4.4.6): the physical continuation of the
/// predecessor extent when one is known (`ex.phys + (iblock - ex.first)`),
/// else a deterministic seed inside the inode's own block group.
fn find_goal(sb: &Superblock, inode_num: InodeNumber, path: &[PathLevel], logical: u32) -> (GroupNumber, u32) {
    let leaf_level = path.last().unwrap();
    if !leaf_level.node.leaves.is_empty() {
        let candidate = leaf_level.node.leaves[leaf_level.slot];
        if candidate.first_logical <= logical {
            let phys = candidate.physical() + (logical - candidate.first_logical) as u64;
            return group_and_offset(sb, phys);
        }
    }
    let group = ((inode_num - 1) / sb.inodes_per_group.max(1)) as GroupNumber;
    let offset = (inode_num as u64 % sb.blocks_per_group.max(1) as u64) as u32;
    (group, offset)
}

/// The smallest leaf with `first_logical > logical`, i.e. the extent
/// immediately to the right of a hole at `logical`.
fn right_neighbor(leaves: &[ExtentLeaf], logical: u32) -> Option<ExtentLeaf> {
    let pos = leaves.partition_point(|e| e.first_logical <= logical);
    leaves.get(pos).copied()
}

/// `ext4_ext_check_overlap` (spec §4.4.2): a new extent must not overlap
/// an existing one. A start that lands inside an existing extent is a
/// caller bug (rejected); a tail that runs into the next extent is
/// clipped by truncating `new_leaf`'s length, matching the spec's
/// "truncates newext.length to avoid the overlap" precondition handling.
fn check_overlap(leaves: &[ExtentLeaf], mut new_leaf: ExtentLeaf) -> Result<ExtentLeaf> {
    let pos = leaves.partition_point(|e| e.first_logical < new_leaf.first_logical);
    if pos > 0 {
        let left = leaves[pos - 1];
        if left.last_logical() >= new_leaf.first_logical {
            return Err(CoreError::Corrupt(
                "insert_extent: new extent starts inside an existing extent".into(),
            ));
        }
    }
    if pos < leaves.len() {
        let right = leaves[pos];
        if new_leaf.last_logical() >= right.first_logical {
            let clipped = right.first_logical - new_leaf.first_logical;
            if clipped == 0 {
                return Err(CoreError::Corrupt(
                    "insert_extent: new extent is fully covered by an existing extent".into(),
                ));
            }
            new_leaf.set_len(clipped);
        }
    }
    Ok(new_leaf)
}

/// `get_blocks(handle, inode, iblock, max_blocks, flags)` (spec §4.4.6):
/// resolves the mapping covering `logical`. With `flags.create` unset,
/// an unmapped range reports `None` (a hole); with it set, a hole is
/// allocated via `find_goal`/`block_allocator::allocate_blocks`, capped
/// by `EXT_INIT_MAX_LEN`/`EXT_UNINIT_MAX_LEN`, clipped against the next
/// extent, and inserted — freeing the allocation back out if the insert
/// fails. `uninit` is reported so callers can treat the range as
/// logically zero.
pub fn get_blocks(
    fs: &Filesystem,
    handle: &mut TransactionHandle,
    inode_num: InodeNumber,
    inode: &mut Inode,
    logical: u32,
    max_blocks: u32,
    flags: GetBlocksFlags,
) -> Result<Option<(u64, u32, bool)>> {
    if !inode.uses_extents() {
        if !inode.block_region().iter().all(|&b| b == 0) {
            return Err(CoreError::Unsupported("legacy indirect-block mapping is not supported".into()));
        }
        if !flags.create {
            return Ok(None);
        }
        ensure_extent_root(inode);
    }

    let path = find_path(fs, inode, logical)?;
    let leaf_level = path.last().unwrap();
    if !leaf_level.node.leaves.is_empty() {
        let e = leaf_level.node.leaves[leaf_level.slot];
        if e.covers(logical) {
            let delta = logical - e.first_logical;
            return Ok(Some((e.physical() + delta as u64, e.len() - delta, e.is_uninit())));
        }
    }

    if !flags.create {
        return Ok(None);
    }

    let max_len = ExtentLeaf::max_len(flags.uninit);
    let mut want = max_blocks.max(1).min(max_len);
    if let Some(right) = right_neighbor(&leaf_level.node.leaves, logical) {
        want = want.min(right.first_logical - logical);
    }

    let sb = *fs.sb.read().unwrap();
    let (goal_group, goal_offset) = find_goal(&sb, inode_num, &path, logical);
    let caller = AllocCaller::default();
    let (phys, got) = block_allocator::allocate_blocks(fs, handle, &caller, goal_group, goal_offset, want, AllocFlags::default())?;

    let new_leaf = ExtentLeaf::new(logical, got, flags.uninit, phys);
    if let Err(err) = insert_extent(fs, handle, inode_num, inode, new_leaf) {
        block_allocator::free_blocks(fs, handle, phys, got)?;
        return Err(err);
    }
    Ok(Some((phys, got, flags.uninit)))
}

fn mergeable(a: &ExtentLeaf, b: &ExtentLeaf) -> bool {
    a.is_uninit() == b.is_uninit()
        && a.last_logical().checked_add(1) == Some(b.first_logical)
        && a.physical() + a.len() as u64 == b.physical()
        && a.len() + b.len() <= ExtentLeaf::max_len(a.is_uninit())
}

enum MergeOutcome {
    MergedAt(usize, ExtentLeaf),
    Insert(usize),
}

/// `try_to_merge` (spec §4.4.2 supplemented feature): attempts to widen
/// the left or right sorted neighbor of `new_leaf` rather than adding a
/// fresh entry.
fn try_merge_adjacent(leaves: &[ExtentLeaf], new_leaf: ExtentLeaf) -> MergeOutcome {
    let pos = leaves.partition_point(|e| e.first_logical < new_leaf.first_logical);
    if pos > 0 {
        let left = leaves[pos - 1];
        if mergeable(&left, &new_leaf) {
            let mut merged = left;
            merged.set_len(left.len() + new_leaf.len());
            return MergeOutcome::MergedAt(pos - 1, merged);
        }
    }
    if pos < leaves.len() {
        let right = leaves[pos];
        if mergeable(&new_leaf, &right) {
            let mut merged = new_leaf;
            merged.set_len(new_leaf.len() + right.len());
            return MergeOutcome::MergedAt(pos, merged);
        }
    }
    MergeOutcome::Insert(pos)
}

/// `insert_extent(inode, extent)` (spec §4.4.2): maps a logical range
/// that is not currently mapped (a hole). A tail that runs into the next
/// extent is clipped by `check_overlap` rather than trusted to the
/// caller; a start landing inside an existing extent is rejected as
/// corrupt state.
pub fn insert_extent(
    fs: &Filesystem,
    handle: &mut TransactionHandle,
    inode_num: InodeNumber,
    inode: &mut Inode,
    new_leaf: ExtentLeaf,
) -> Result<()> {
    if !inode.uses_extents() {
        ensure_extent_root(inode);
    }
    let mut path = find_path(fs, inode, new_leaf.first_logical)?;
    let level = path.len() - 1;
    let new_leaf = check_overlap(&path[level].node.leaves, new_leaf)?;

    match try_merge_adjacent(&path[level].node.leaves, new_leaf) {
        MergeOutcome::MergedAt(idx, merged) => {
            let mut node = path[level].node.clone();
            node.leaves[idx] = merged;
            write_node(fs, handle, inode, path[level].block, &node)?;
        }
        MergeOutcome::Insert(at) => {
            let node = &path[level].node;
            if (node.leaves.len() as u16) < node.header.max {
                let mut node = node.clone();
                node.leaves.insert(at, new_leaf);
                node.header.entries = node.leaves.len() as u16;
                write_node(fs, handle, inode, path[level].block, &node)?;
            } else {
                split_full_leaf_and_insert(fs, handle, inode_num, inode, &mut path, level, at, new_leaf)?;
            }
        }
    }
    crate::inode_table::write_inode(fs, handle, inode_num, inode)
}

/// Splits a full leaf (spec §4.4.2 "split on insert"): at the inline
/// root, this is a one-step depth growth (a single block-sized leaf
/// always has room for the old root's 4 entries plus the new one); at
/// a block-sized leaf deeper in the tree, it is an ordinary half-split
/// with the new right sibling's first key pushed into the parent
/// index, recursing upward through [`insert_index_into_ancestor`].
fn split_full_leaf_and_insert(
    fs: &Filesystem,
    handle: &mut TransactionHandle,
    inode_num: InodeNumber,
    inode: &mut Inode,
    path: &mut Vec<PathLevel>,
    level: usize,
    at: usize,
    new_leaf: ExtentLeaf,
) -> Result<()> {
    let mut combined = path[level].node.leaves.clone();
    combined.insert(at, new_leaf);

    if level == 0 {
        let cap = block_capacity(fs);
        debug_assert!(combined.len() as u16 <= cap, "root leaf + 1 must fit a block leaf");
        let new_block = allocate_metadata_block(fs, handle, inode_num)?;
        let leaf_node = ExtentNode {
            header: ExtentNodeHeader {
                magic: EXTENT_MAGIC,
                entries: combined.len() as u16,
                max: cap,
                depth: 0,
                generation: 0,
            },
            leaves: combined,
            indexes: Vec::new(),
        };
        write_node(fs, handle, inode, Some(new_block), &leaf_node)?;
        let root_index = ExtentIndex::new(leaf_node.leaves[0].first_logical, new_block);
        let new_root = ExtentNode {
            header: ExtentNodeHeader {
                magic: EXTENT_MAGIC,
                entries: 1,
                max: root_capacity(),
                depth: 1,
                generation: 0,
            },
            leaves: Vec::new(),
            indexes: vec![root_index],
        };
        write_node(fs, handle, inode, None, &new_root)?;
        return Ok(());
    }

    let mid = combined.len() / 2;
    let (left, right) = combined.split_at(mid);
    let max = path[level].node.header.max;
    let left_node = ExtentNode {
        header: ExtentNodeHeader { magic: EXTENT_MAGIC, entries: left.len() as u16, max, depth: 0, generation: 0 },
        leaves: left.to_vec(),
        indexes: Vec::new(),
    };
    let right_node = ExtentNode {
        header: ExtentNodeHeader { magic: EXTENT_MAGIC, entries: right.len() as u16, max, depth: 0, generation: 0 },
        leaves: right.to_vec(),
        indexes: Vec::new(),
    };
    let this_block = path[level].block.expect("non-root leaf always has a block");
    write_node(fs, handle, inode, Some(this_block), &left_node)?;
    let new_block = allocate_metadata_block(fs, handle, inode_num)?;
    write_node(fs, handle, inode, Some(new_block), &right_node)?;
    let new_index = ExtentIndex::new(right_node.leaves[0].first_logical, new_block);
    insert_index_into_ancestor(fs, handle, inode_num, inode, path, level - 1, new_index)
}

/// Inserts an index entry produced by a child split into the node at
/// `level`, splitting (and recursing upward, or growing the tree's
/// depth at the root) if that node is itself full.
fn insert_index_into_ancestor(
    fs: &Filesystem,
    handle: &mut TransactionHandle,
    inode_num: InodeNumber,
    inode: &mut Inode,
    path: &mut Vec<PathLevel>,
    level: usize,
    new_index: ExtentIndex,
) -> Result<()> {
    let node = path[level].node.clone();
    let pos = node.indexes.partition_point(|e| e.first_logical < new_index.first_logical);

    if (node.indexes.len() as u16) < node.header.max {
        let mut node = node;
        node.indexes.insert(pos, new_index);
        node.header.entries = node.indexes.len() as u16;
        return write_node(fs, handle, inode, path[level].block, &node);
    }

    let mut combined = node.indexes.clone();
    combined.insert(pos, new_index);

    if level == 0 {
        let cap = block_capacity(fs);
        debug_assert!(combined.len() as u16 <= cap, "root index + 1 must fit a block index node");
        let new_block = allocate_metadata_block(fs, handle, inode_num)?;
        let idx_node = ExtentNode {
            header: ExtentNodeHeader {
                magic: EXTENT_MAGIC,
                entries: combined.len() as u16,
                max: cap,
                depth: node.header.depth,
                generation: 0,
            },
            leaves: Vec::new(),
            indexes: combined,
        };
        write_node(fs, handle, inode, Some(new_block), &idx_node)?;
        let root_index = ExtentIndex::new(idx_node.indexes[0].first_logical, new_block);
        let new_root = ExtentNode {
            header: ExtentNodeHeader {
                magic: EXTENT_MAGIC,
                entries: 1,
                max: root_capacity(),
                depth: node.header.depth + 1,
                generation: 0,
            },
            leaves: Vec::new(),
            indexes: vec![root_index],
        };
        return write_node(fs, handle, inode, None, &new_root);
    }

    let mid = combined.len() / 2;
    let (left, right) = combined.split_at(mid);
    let max = node.header.max;
    let depth = node.header.depth;
    let left_node = ExtentNode {
        header: ExtentNodeHeader { magic: EXTENT_MAGIC, entries: left.len() as u16, max, depth, generation: 0 },
        leaves: Vec::new(),
        indexes: left.to_vec(),
    };
    let right_node = ExtentNode {
        header: ExtentNodeHeader { magic: EXTENT_MAGIC, entries: right.len() as u16, max, depth, generation: 0 },
        leaves: Vec::new(),
        indexes: right.to_vec(),
    };
    let this_block = path[level].block.expect("non-root index always has a block");
    write_node(fs, handle, inode, Some(this_block), &left_node)?;
    let new_block = allocate_metadata_block(fs, handle, inode_num)?;
    write_node(fs, handle, inode, Some(new_block), &right_node)?;
    let parent_index = ExtentIndex::new(right_node.indexes[0].first_logical, new_block);
    insert_index_into_ancestor(fs, handle, inode_num, inode, path, level - 1, parent_index)
}

/// `convert_to_initialized(inode, logical, len)` (spec §4.4.4): marks a
/// sub-range of a single uninitialized extent as initialized, splitting
/// off the uninit remainder(s). Below `2*ZERO_LEN` blocks the whole
/// extent converts in place rather than splitting (spec §4.4.4 short
/// extent fast path).
pub fn convert_to_initialized(
    fs: &Filesystem,
    handle: &mut TransactionHandle,
    inode_num: InodeNumber,
    inode: &mut Inode,
    start_logical: u32,
    len: u32,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let end_logical = start_logical + len - 1;
    let path = find_path(fs, inode, start_logical)?;
    let level = path.len() - 1;
    let mut node = path[level].node.clone();

    let idx = node
        .leaves
        .iter()
        .position(|e| e.covers(start_logical))
        .ok_or_else(|| CoreError::Corrupt("convert_to_initialized: no extent covers range start".into()))?;
    let e = node.leaves[idx];
    if !e.is_uninit() {
        return Ok(());
    }
    if end_logical > e.last_logical() {
        return Err(CoreError::Corrupt(
            "convert_to_initialized: requested range crosses an extent boundary".into(),
        ));
    }

    if e.len() <= 2 * ZERO_LEN {
        let mut whole = e;
        whole.mark_initialized();
        node.leaves[idx] = whole;
        write_node(fs, handle, inode, path[level].block, &node)?;
        return crate::inode_table::write_inode(fs, handle, inode_num, inode);
    }

    let mut pieces = Vec::with_capacity(3);
    if e.first_logical < start_logical {
        pieces.push(ExtentLeaf::new(e.first_logical, start_logical - e.first_logical, true, e.physical()));
    }
    pieces.push(ExtentLeaf::new(
        start_logical,
        len,
        false,
        e.physical() + (start_logical - e.first_logical) as u64,
    ));
    if end_logical < e.last_logical() {
        let tail_first = end_logical + 1;
        let tail_len = e.last_logical() - end_logical;
        pieces.push(ExtentLeaf::new(tail_first, tail_len, true, e.physical() + (tail_first - e.first_logical) as u64));
    }

    if node.leaves.len() - 1 + pieces.len() > node.header.max as usize {
        return Err(CoreError::Corrupt(
            "convert_to_initialized: splitting this extent would overflow its node's capacity".into(),
        ));
    }

    node.leaves.remove(idx);
    for (i, piece) in pieces.into_iter().enumerate() {
        node.leaves.insert(idx + i, piece);
    }
    node.header.entries = node.leaves.len() as u16;
    write_node(fs, handle, inode, path[level].block, &node)?;
    crate::inode_table::write_inode(fs, handle, inode_num, inode)
}

/// Removes `[start_logical, end_logical]` from a single node already in
/// hand (root or block-backed), recursing into child nodes right to
/// left when `node` is an index. Returns whether `node` ended up with
/// zero entries, so the caller can `rm_idx` it: free its backing block
/// and drop the parent's index entry.
fn remove_from_node(
    fs: &Filesystem,
    handle: &mut TransactionHandle,
    inode_num: InodeNumber,
    inode: &mut Inode,
    block: Option<BlockNumber>,
    start_logical: u32,
    end_logical: u32,
    freed: &mut u64,
) -> Result<bool> {
    let mut node = read_node(fs, inode, block)?;

    if node.header.is_leaf() {
        let mut i = node.leaves.len();
        while i > 0 {
            i -= 1;
            let e = node.leaves[i];
            if e.last_logical() < start_logical {
                break;
            }
            if e.first_logical > end_logical {
                continue;
            }

            if e.first_logical >= start_logical && e.last_logical() <= end_logical {
                block_allocator::free_blocks(fs, handle, e.physical(), e.len())?;
                *freed += e.len() as u64;
                node.leaves.remove(i);
            } else if e.first_logical < start_logical && e.last_logical() > end_logical {
                let left_len = start_logical - e.first_logical;
                let right_first = end_logical + 1;
                let right_len = e.last_logical() - end_logical;
                let mid_len = e.len() - left_len - right_len;
                let mid_first_phys = e.physical() + left_len as u64;
                block_allocator::free_blocks(fs, handle, mid_first_phys, mid_len)?;
                *freed += mid_len as u64;
                let left_leaf = ExtentLeaf::new(e.first_logical, left_len, e.is_uninit(), e.physical());
                let right_leaf =
                    ExtentLeaf::new(right_first, right_len, e.is_uninit(), mid_first_phys + mid_len as u64);
                if node.leaves.len() + 1 > node.header.max as usize {
                    return Err(CoreError::Corrupt(
                        "remove_space: punching a hole in the middle of this extent would overflow its node's capacity"
                            .into(),
                    ));
                }
                node.leaves[i] = left_leaf;
                node.leaves.insert(i + 1, right_leaf);
            } else if e.first_logical < start_logical {
                let keep_len = start_logical - e.first_logical;
                let free_len = e.len() - keep_len;
                block_allocator::free_blocks(fs, handle, e.physical() + keep_len as u64, free_len)?;
                *freed += free_len as u64;
                let mut kept = e;
                kept.set_len(keep_len);
                node.leaves[i] = kept;
            } else {
                let new_first = end_logical + 1;
                let drop_len = new_first - e.first_logical;
                let keep_len = e.len() - drop_len;
                block_allocator::free_blocks(fs, handle, e.physical(), drop_len)?;
                *freed += drop_len as u64;
                let kept = ExtentLeaf::new(new_first, keep_len, e.is_uninit(), e.physical() + drop_len as u64);
                node.leaves[i] = kept;
            }
        }
        node.header.entries = node.leaves.len() as u16;
        write_node(fs, handle, inode, block, &node)?;
        return Ok(node.leaves.is_empty());
    }

    let mut i = node.indexes.len();
    while i > 0 {
        i -= 1;
        let idx_entry = node.indexes[i];
        let child_end = if i + 1 < node.indexes.len() {
            node.indexes[i + 1].first_logical - 1
        } else {
            u32::MAX
        };
        if child_end < start_logical {
            break;
        }
        if idx_entry.first_logical > end_logical {
            continue;
        }
        let child_block = idx_entry.child();
        let child_empty =
            remove_from_node(fs, handle, inode_num, inode, Some(child_block), start_logical, end_logical, freed)?;
        if child_empty {
            block_allocator::free_blocks(fs, handle, child_block, 1)?;
            node.indexes.remove(i);
        }
    }
    node.header.entries = node.indexes.len() as u16;
    write_node(fs, handle, inode, block, &node)?;
    Ok(node.indexes.is_empty())
}

/// `remove_space(inode, start, end)` (spec §4.4.5, truncate/punch):
/// unmaps `[start_logical, end_logical]` inclusive, walking every leaf
/// that intersects the range right to left, depth-first, freeing the
/// underlying physical blocks through [`block_allocator::free_blocks`].
/// A leaf or index node left with zero entries is itself `rm_idx`'d: its
/// backing block is freed and its parent's index entry dropped,
/// cascading up the path. If the whole tree empties, the root collapses
/// back to `depth = 0`, `entries = 0`, `max = root_capacity()`. Returns
/// the number of physical blocks freed.
///
/// Underfull nodes left behind by a partial removal are not rebalanced
/// against siblings (documented simplification: correctness does not
/// require it, only some slack in worst-case tree depth).
pub fn remove_space(
    fs: &Filesystem,
    handle: &mut TransactionHandle,
    inode_num: InodeNumber,
    inode: &mut Inode,
    start_logical: u32,
    end_logical: u32,
) -> Result<u64> {
    if !inode.uses_extents() {
        return Ok(0);
    }
    let mut freed = 0u64;
    remove_from_node(fs, handle, inode_num, inode, None, start_logical, end_logical, &mut freed)?;

    let root = decode_node(inode.block_region())?;
    let root_empty = if root.header.is_leaf() {
        root.leaves.is_empty()
    } else {
        root.indexes.is_empty()
    };
    if root_empty {
        let empty_root = ExtentNode {
            header: ExtentNodeHeader::new(0, root_capacity()),
            leaves: Vec::new(),
            indexes: Vec::new(),
        };
        encode_node(&empty_root, inode.block_region_mut());
    }

    crate::inode_table::write_inode(fs, handle, inode_num, inode)?;
    Ok(freed)
}

/// Collects every mapped leaf extent in logical order (spec §4.4.6
/// FIEMAP walk).
pub fn walk(fs: &Filesystem, inode: &Inode) -> Result<Vec<ExtentLeaf>> {
    if !inode.uses_extents() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    walk_node(fs, inode, None, &mut out)?;
    Ok(out)
}

fn walk_node(fs: &Filesystem, inode: &Inode, block: Option<BlockNumber>, out: &mut Vec<ExtentLeaf>) -> Result<()> {
    let node = read_node(fs, inode, block)?;
    if node.header.is_leaf() {
        out.extend(node.leaves.iter().copied());
    } else {
        for idx in &node.indexes {
            walk_node(fs, inode, Some(idx.child()), out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::device::test_support::MemDevice;
    use crate::structures::{as_bytes, GroupDesc, Superblock};
    use std::sync::Arc;

    fn minimal_fs() -> Filesystem {
        let block_size = 4096u32;
        let blocks_per_group = 4096u32;
        let groups = 1u32;
        let total_blocks = blocks_per_group as u64 * groups as u64;
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
        sb.uuid = [11u8; 16];

        let desc_size = 32usize;
        let per_block = block_size as usize / desc_size;
        let gdt_blocks = (groups as usize + per_block - 1) / per_block;
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
        gd.set_free_inodes_count(64);
        gd.update_checksum(0, &sb);

        sb.set_free_blocks_count(blocks_per_group as u64 - used);
        sb.free_inodes_count = 64;
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
    fn insert_then_get_blocks_round_trips() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let mut h = fs.journal.start(8).unwrap();
        insert_extent(&fs, &mut h, 20, &mut inode, ExtentLeaf::new(0, 10, false, 500)).unwrap();
        fs.commit(h).unwrap();

        let mut h = fs.journal.start(8).unwrap();
        let (phys, len, uninit) = get_blocks(&fs, &mut h, 20, &mut inode, 5, 10, GetBlocksFlags::default())
            .unwrap()
            .unwrap();
        assert_eq!(phys, 505);
        assert_eq!(len, 5);
        assert!(!uninit);
        assert!(get_blocks(&fs, &mut h, 20, &mut inode, 10, 10, GetBlocksFlags::default())
            .unwrap()
            .is_none());
        fs.commit(h).unwrap();
    }

    #[test]
    fn adjacent_inserts_merge_into_one_extent() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let mut h = fs.journal.start(8).unwrap();
        insert_extent(&fs, &mut h, 21, &mut inode, ExtentLeaf::new(0, 10, false, 1000)).unwrap();
        insert_extent(&fs, &mut h, 21, &mut inode, ExtentLeaf::new(10, 5, false, 1010)).unwrap();
        fs.commit(h).unwrap();

        let leaves = walk(&fs, &inode).unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].len(), 15);
    }

    #[test]
    fn fifth_disjoint_insert_grows_depth_and_preserves_mappings() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let mut h = fs.journal.start(32).unwrap();
        for i in 0..5u32 {
            let logical = i * 100;
            insert_extent(&fs, &mut h, 22, &mut inode, ExtentLeaf::new(logical, 10, false, 2000 + (i * 10) as u64))
                .unwrap();
        }
        fs.commit(h).unwrap();

        let root = decode_node(inode.block_region()).unwrap();
        assert_eq!(root.header.depth, 1);
        assert_eq!(root.indexes.len(), 1);

        let mut h = fs.journal.start(8).unwrap();
        for i in 0..5u32 {
            let logical = i * 100;
            let (phys, _, _) = get_blocks(&fs, &mut h, 22, &mut inode, logical, 10, GetBlocksFlags::default())
                .unwrap()
                .unwrap();
            assert_eq!(phys, 2000 + (i * 10) as u64);
        }
        fs.commit(h).unwrap();
    }

    #[test]
    fn convert_to_initialized_splits_long_uninit_extent() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let mut h = fs.journal.start(8).unwrap();
        insert_extent(&fs, &mut h, 23, &mut inode, ExtentLeaf::new(0, 100, true, 3000)).unwrap();
        convert_to_initialized(&fs, &mut h, 23, &mut inode, 40, 10).unwrap();
        fs.commit(h).unwrap();

        let leaves = walk(&fs, &inode).unwrap();
        assert_eq!(leaves.len(), 3);
        assert!(leaves[0].is_uninit());
        assert!(!leaves[1].is_uninit());
        assert_eq!(leaves[1].first_logical, 40);
        assert_eq!(leaves[1].len(), 10);
        assert!(leaves[2].is_uninit());
    }

    #[test]
    fn convert_to_initialized_short_extent_converts_in_place() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let mut h = fs.journal.start(8).unwrap();
        insert_extent(&fs, &mut h, 24, &mut inode, ExtentLeaf::new(0, 5, true, 3100)).unwrap();
        convert_to_initialized(&fs, &mut h, 24, &mut inode, 0, 5).unwrap();
        fs.commit(h).unwrap();

        let leaves = walk(&fs, &inode).unwrap();
        assert_eq!(leaves.len(), 1);
        assert!(!leaves[0].is_uninit());
    }

    #[test]
    fn remove_space_trims_tail_and_frees_blocks() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let mut h = fs.journal.start(8).unwrap();
        insert_extent(&fs, &mut h, 25, &mut inode, ExtentLeaf::new(0, 10, false, 4000)).unwrap();
        fs.commit(h).unwrap();

        let before = fs.counters.free_blocks.load(std::sync::atomic::Ordering::SeqCst);
        let mut h = fs.journal.start(8).unwrap();
        let freed = remove_space(&fs, &mut h, 25, &mut inode, 5, 9).unwrap();
        fs.commit(h).unwrap();

        assert_eq!(freed, 5);
        assert_eq!(
            fs.counters.free_blocks.load(std::sync::atomic::Ordering::SeqCst),
            before + 5
        );
        let leaves = walk(&fs, &inode).unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].len(), 5);
        let mut h = fs.journal.start(8).unwrap();
        assert!(get_blocks(&fs, &mut h, 25, &mut inode, 5, 1, GetBlocksFlags::default())
            .unwrap()
            .is_none());
        fs.commit(h).unwrap();
    }

    #[test]
    fn remove_space_whole_extent_clears_mapping() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let mut h = fs.journal.start(8).unwrap();
        insert_extent(&fs, &mut h, 26, &mut inode, ExtentLeaf::new(0, 10, false, 4100)).unwrap();
        fs.commit(h).unwrap();

        let mut h = fs.journal.start(8).unwrap();
        let freed = remove_space(&fs, &mut h, 26, &mut inode, 0, 9).unwrap();
        fs.commit(h).unwrap();

        assert_eq!(freed, 10);
        assert!(walk(&fs, &inode).unwrap().is_empty());
    }

    #[test]
    fn get_blocks_create_allocates_and_is_stable_on_reread() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let mut h = fs.journal.start(8).unwrap();

        let create = GetBlocksFlags { create: true, uninit: false };
        let (phys, len, uninit) = get_blocks(&fs, &mut h, 27, &mut inode, 0, 10, create).unwrap().unwrap();
        assert_eq!(len, 10);
        assert!(!uninit);

        let (phys2, len2, uninit2) =
            get_blocks(&fs, &mut h, 27, &mut inode, 0, 10, GetBlocksFlags::default()).unwrap().unwrap();
        fs.commit(h).unwrap();

        assert_eq!(phys, phys2);
        assert_eq!(len, len2);
        assert_eq!(uninit, uninit2);
    }

    #[test]
    fn get_blocks_create_clips_against_next_extent() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let mut h = fs.journal.start(16).unwrap();
        insert_extent(&fs, &mut h, 28, &mut inode, ExtentLeaf::new(20, 10, false, 9000)).unwrap();

        let create = GetBlocksFlags { create: true, uninit: false };
        let (_phys, len, _uninit) = get_blocks(&fs, &mut h, 28, &mut inode, 10, 100, create).unwrap().unwrap();
        fs.commit(h).unwrap();

        // logical 10..20 is the only gap before the existing [20, 29] extent.
        assert_eq!(len, 10);
        let leaves = walk(&fs, &inode).unwrap();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].first_logical, 10);
        assert_eq!(leaves[0].last_logical(), 19);
        assert_eq!(leaves[1].first_logical, 20);
    }

    #[test]
    fn insert_extent_check_overlap_truncates_tail_into_next_extent() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let mut h = fs.journal.start(16).unwrap();
        insert_extent(&fs, &mut h, 29, &mut inode, ExtentLeaf::new(20, 10, false, 9100)).unwrap();
        // overlaps the [20, 29] extent's start by 5 blocks; must clip to [10, 19].
        insert_extent(&fs, &mut h, 29, &mut inode, ExtentLeaf::new(10, 15, false, 9200)).unwrap();
        fs.commit(h).unwrap();

        let leaves = walk(&fs, &inode).unwrap();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].first_logical, 10);
        assert_eq!(leaves[0].len(), 10);
        assert_eq!(leaves[1].first_logical, 20);
    }

    #[test]
    fn insert_extent_check_overlap_rejects_start_inside_existing_extent() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let mut h = fs.journal.start(16).unwrap();
        insert_extent(&fs, &mut h, 30, &mut inode, ExtentLeaf::new(20, 10, false, 9300)).unwrap();
        let err = insert_extent(&fs, &mut h, 30, &mut inode, ExtentLeaf::new(25, 5, false, 9400));
        assert!(err.is_err());
    }

    #[test]
    fn remove_space_frees_the_leaf_block_allocated_by_a_split() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let before = fs.counters.free_blocks.load(std::sync::atomic::Ordering::SeqCst);

        let mut h = fs.journal.start(64).unwrap();
        for i in 0..5u32 {
            let logical = i * 100;
            insert_extent(&fs, &mut h, 31, &mut inode, ExtentLeaf::new(logical, 10, false, 5000 + (i * 10) as u64))
                .unwrap();
        }
        fs.commit(h).unwrap();

        let root = decode_node(inode.block_region()).unwrap();
        assert_eq!(root.header.depth, 1);
        let after_insert = fs.counters.free_blocks.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(after_insert, before - 1, "the 5th insert's split allocates one leaf block");

        let mut h = fs.journal.start(64).unwrap();
        let freed = remove_space(&fs, &mut h, 31, &mut inode, 0, u32::MAX).unwrap();
        fs.commit(h).unwrap();

        assert_eq!(freed, 50);
        assert!(walk(&fs, &inode).unwrap().is_empty());
        let root = decode_node(inode.block_region()).unwrap();
        assert_eq!(root.header.depth, 0);
        assert_eq!(root.header.entries, 0);
        assert_eq!(root.header.max, root_capacity());

        let after_remove = fs.counters.free_blocks.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(after_remove, before + 50, "the leaf block's own freeing must also be reflected");
    }

    #[test]
    fn remove_space_visits_every_sibling_leaf_after_a_leaf_split() {
        let fs = minimal_fs();
        let mut inode = Inode::zeroed();
        inode.mode = S_IFREG;
        let count = 400u32;
        let mut h = fs.journal.start(count + 16).unwrap();
        for i in 0..count {
            let logical = i * 10;
            insert_extent(&fs, &mut h, 32, &mut inode, ExtentLeaf::new(logical, 5, false, 20000 + (i * 5) as u64))
                .unwrap();
        }
        fs.commit(h).unwrap();

        let root = decode_node(inode.block_region()).unwrap();
        assert_eq!(root.header.depth, 1);
        assert!(
            root.indexes.len() >= 2,
            "400 disjoint extents must have split the sole leaf into siblings"
        );

        let mut h = fs.journal.start(count + 16).unwrap();
        let freed = remove_space(&fs, &mut h, 32, &mut inode, 0, u32::MAX).unwrap();
        fs.commit(h).unwrap();

        assert_eq!(freed, (count * 5) as u64);
        assert!(walk(&fs, &inode).unwrap().is_empty());
        let root = decode_node(inode.block_region()).unwrap();
        assert_eq!(root.header.depth, 0);
        assert_eq!(root.header.entries, 0);
        assert_eq!(root.header.max, root_capacity());
    }
}
