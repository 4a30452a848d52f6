//! On-disk byte layouts (spec §3, §6): superblock, group descriptor,
//! inode, and extent-tree node records. Every struct here is `repr(C)`
//! and pinned to its on-disk size with `assert_eq_size!`, the way the
//! teacher's `core/structures.rs` does it — plain byte copies into
//! aligned buffers, no `byteorder` cursors, little-endian hosts only.

pub mod extent;
pub mod group_desc;
pub mod inode;
pub mod superblock;

pub use extent::{ExtentIndex, ExtentLeaf, ExtentNodeHeader};
pub use group_desc::GroupDesc;
pub use inode::Inode;
pub use superblock::Superblock;

/// Reinterpret a `repr(C)` struct as its constituent bytes. Safe because
/// every struct wrapped here is `repr(C)`, `Copy`, and contains no
/// padding that crosses the asserted size (checked by `assert_eq_size!`
/// next to each definition).
pub(crate) fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>()) }
}

pub(crate) fn as_bytes_mut<T: Copy>(value: &mut T) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(value as *mut T as *mut u8, std::mem::size_of::<T>()) }
}

pub(crate) fn from_bytes<T: Copy>(bytes: &[u8]) -> T {
    debug_assert_eq!(bytes.len(), std::mem::size_of::<T>());
    unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) }
}
