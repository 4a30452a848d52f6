//! Journalled, extent-mapped block-and-inode storage engine.
//!
//! This crate implements the on-disk storage core of an ext4-derived
//! filesystem driver: superblock/group-descriptor handling, the block and
//! inode bitmap allocators, the inode table, the extent-tree index, a
//! JBD2-style journal façade, and resize/orphan-recovery logic. It does not
//! implement a VFS/POSIX layer, ACL/xattr semantics, quota accounting, or any
//! distributed locking — those live above this crate behind the
//! [`device::BlockDevice`] and [`device::QuotaHook`] seams.

pub mod bitmap;
pub mod block_allocator;
pub mod checksum;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod extent_tree;
pub mod inode_allocator;
pub mod inode_table;
pub mod journal;
pub mod mount;
pub mod orphan_recovery;
pub mod resize;
pub mod structures;
pub mod types;

pub use error::{CoreError, Result};
