//! Transaction handle and buffer-access guard (spec §4.5; design notes:
//! "every `get_write_access` is a scoped commitment ... model as a guard
//! type that enforces one of [commit/abandon] on drop").

use std::collections::HashSet;

use crate::error::{CoreError, Result};
use crate::types::BlockNumber;

/// A journal transaction in progress. Every metadata mutation against a
/// mounted filesystem happens inside one of these (spec §4.5).
pub struct TransactionHandle {
    tid: u64,
    credits_total: u32,
    credits_used: u32,
    access: HashSet<BlockNumber>,
    dirty: HashSet<BlockNumber>,
    aborted: bool,
}

impl TransactionHandle {
    pub(crate) fn new(tid: u64, credits: u32) -> Self {
        Self {
            tid,
            credits_total: credits,
            credits_used: 0,
            access: HashSet::new(),
            dirty: HashSet::new(),
            aborted: false,
        }
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Credits left before the caller must `extend` or `restart` (spec
    /// §4.4.2, §4.4.5: callers compute a worst-case credit bound up
    /// front and extend/restart when it runs out).
    pub fn credits_remaining(&self) -> u32 {
        self.credits_total.saturating_sub(self.credits_used)
    }

    /// `extend(h, more)` (spec §4.5): grows the credit reservation of an
    /// in-flight handle without a restart.
    pub fn extend(&mut self, more: u32) {
        self.credits_total += more;
    }

    /// `get_write_access(h, buf)` (spec §4.5): records intent to modify
    /// an existing `block` within this transaction. Must precede
    /// `dirty_metadata`/`mark_dirty`.
    pub fn get_write_access(&mut self, block: BlockNumber) {
        self.access.insert(block);
    }

    /// `get_create_access(h, buf)` (spec §4.5): same bookkeeping as
    /// `get_write_access` for a block that was just allocated and has no
    /// prior on-disk content worth preserving.
    pub fn get_create_access(&mut self, block: BlockNumber) {
        self.access.insert(block);
    }

    /// `forget(h, buf)` (spec §4.5): releases write access without
    /// dirtying — the buffer turned out not to need a change, or is
    /// being freed before the transaction that allocated it commits.
    pub fn forget(&mut self, block: BlockNumber) {
        self.access.remove(&block);
        self.dirty.remove(&block);
    }

    pub(crate) fn mark_dirty(&mut self, block: BlockNumber) -> Result<()> {
        if !self.access.contains(&block) {
            return Err(CoreError::Corrupt(format!(
                "dirty_metadata on block {} without prior get_write_access",
                block
            )));
        }
        if !self.dirty.contains(&block) {
            self.credits_used += 1;
        }
        self.dirty.insert(block);
        Ok(())
    }

    pub(crate) fn dirty_blocks(&self) -> Vec<BlockNumber> {
        self.dirty.iter().copied().collect()
    }

    pub(crate) fn abort(&mut self) {
        self.aborted = true;
    }
}

/// RAII commitment for a single buffer touched inside a transaction.
/// `commit` hands the buffer to [`super::Journal::dirty_metadata`];
/// `abandon` calls `forget`. Dropping without either logs an error —
/// every code path through this crate is expected to consume the guard
/// explicitly.
pub struct BufferGuard {
    block: BlockNumber,
    resolved: bool,
}

impl BufferGuard {
    pub fn new(handle: &mut TransactionHandle, block: BlockNumber) -> Self {
        handle.get_write_access(block);
        Self {
            block,
            resolved: false,
        }
    }

    pub fn block(&self) -> BlockNumber {
        self.block
    }

    pub fn commit(mut self, journal: &super::Journal, handle: &mut TransactionHandle, buf: &[u8]) -> Result<()> {
        self.resolved = true;
        journal.dirty_metadata(handle, self.block, buf)
    }

    pub fn abandon(mut self, handle: &mut TransactionHandle) {
        self.resolved = true;
        handle.forget(self.block);
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        if !self.resolved {
            log::error!(
                "buffer guard for block {} dropped without commit or abandon",
                self.block
            );
        }
    }
}
