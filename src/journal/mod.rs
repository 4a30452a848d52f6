//! JBD2-style transaction façade (spec §4.5).
//!
//! Every metadata mutation in this crate goes through a
//! [`TransactionHandle`]: `get_write_access` before mutating a buffer,
//! `dirty_metadata` after. The façade never writes to the device itself —
//! it only tracks which blocks are dirty and hands them back to the
//! caller (`mount.rs`'s commit loop) to flush through the
//! [`crate::device::BlockDevice`] seam, grounded on
//! `journal/jbd2.rs`'s `Jbd2Journal`/`TransactionHandle` split, simplified
//! to a single in-process transaction at a time (no concurrent
//! transaction pipeline) since the core's concurrency model (spec §5)
//! puts that above this façade.

pub mod handle;
pub mod nojournal;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{CoreError, Result};
use crate::types::BlockNumber;

pub use handle::{BufferGuard, TransactionHandle};

/// Callback invoked after a transaction commits, with `(aborted_error)`
/// (spec §4.5 `callback_add`). Run with no locks held, in whatever
/// thread called `Journal::commit`.
pub type CommitCallback = Box<dyn FnOnce(Option<&CoreError>) + Send>;

struct Inner {
    next_tid: u64,
    aborted: bool,
    dirty: HashMap<BlockNumber, Vec<u8>>,
    callbacks: Vec<CommitCallback>,
}

/// Transaction façade. One instance per mounted filesystem.
pub struct Journal {
    inner: Mutex<Inner>,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_tid: 1,
                aborted: false,
                dirty: HashMap::new(),
                callbacks: Vec::new(),
            }),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().unwrap().aborted
    }

    /// `start(sb, nblocks)` (spec §4.5): reserves `nblocks` metadata-write
    /// credits and returns a handle.
    pub fn start(&self, credits: u32) -> Result<TransactionHandle> {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted {
            return Err(CoreError::JournalAborted);
        }
        let tid = inner.next_tid;
        inner.next_tid += 1;
        Ok(TransactionHandle::new(tid, credits))
    }

    /// Marks the journal aborted; every subsequent `start` and every
    /// in-flight handle's `dirty_metadata` fails with `JournalAborted`
    /// (spec §7: "after JournalAborted, every subsequent mutating call
    /// returns Readonly until remount").
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = true;
        log::error!("journal aborted, no further metadata writes accepted");
    }

    /// `dirty_metadata(h, inode, buf)` (spec §4.5): records `buf` as
    /// dirty for this transaction. The handle must already have called
    /// `get_write_access` or `get_create_access` on `block`.
    pub fn dirty_metadata(&self, handle: &mut TransactionHandle, block: BlockNumber, buf: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted {
            handle.abort();
            return Err(CoreError::JournalAborted);
        }
        handle.mark_dirty(block)?;
        inner.dirty.insert(block, buf.to_vec());
        Ok(())
    }

    /// Reads `block` through the transaction's dirty-buffer cache: a
    /// block written by `dirty_metadata` earlier in this or any other
    /// still-open transaction must be visible to a later read before it
    /// lands on disk (spec §4.5 write ordering: get-write-access →
    /// mutate → dirty-metadata, readable throughout by anyone sharing
    /// the device).
    pub fn read_cached(&self, device: &dyn crate::device::BlockDevice, block: BlockNumber) -> Result<Vec<u8>> {
        if let Some(buf) = self.inner.lock().unwrap().dirty.get(&block) {
            return Ok(buf.clone());
        }
        let mut buf = vec![0u8; device.block_size() as usize];
        device.read_block(block, &mut buf)?;
        Ok(buf)
    }

    /// `revoke(h, block, buf)` (spec §4.5): cancels a pending dirty write
    /// for `block` within this transaction (used when a freed metadata
    /// block must not be replayed over newly allocated data on
    /// recovery).
    pub fn revoke(&self, handle: &mut TransactionHandle, block: BlockNumber) {
        handle.forget(block);
        self.inner.lock().unwrap().dirty.remove(&block);
    }

    pub fn callback_add(&self, cb: CommitCallback) {
        self.inner.lock().unwrap().callbacks.push(cb);
    }

    /// `stop(h)` (spec §4.5): commits the handle's dirty buffers,
    /// draining them for the caller to flush, then runs post-commit
    /// callbacks with no locks held.
    pub fn stop(&self, handle: TransactionHandle) -> Result<Vec<(BlockNumber, Vec<u8>)>> {
        if handle.is_aborted() {
            return Err(CoreError::JournalAborted);
        }
        let (drained, callbacks) = {
            let mut inner = self.inner.lock().unwrap();
            let mut drained = Vec::new();
            for block in handle.dirty_blocks() {
                if let Some(data) = inner.dirty.remove(&block) {
                    drained.push((block, data));
                }
            }
            (drained, std::mem::take(&mut inner.callbacks))
        };
        log::debug!("transaction {} committed, {} blocks", handle.tid(), drained.len());
        for cb in callbacks {
            cb(None);
        }
        Ok(drained)
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_stop_drains_dirty_blocks() {
        let j = Journal::new();
        let mut h = j.start(4).unwrap();
        h.get_write_access(10);
        j.dirty_metadata(&mut h, 10, b"hello").unwrap();
        let drained = j.stop(h).unwrap();
        assert_eq!(drained, vec![(10, b"hello".to_vec())]);
    }

    #[test]
    fn abort_fails_new_starts() {
        let j = Journal::new();
        j.abort();
        assert!(j.start(1).is_err());
    }

    #[test]
    fn revoke_removes_pending_dirty_write() {
        let j = Journal::new();
        let mut h = j.start(4).unwrap();
        h.get_write_access(10);
        j.dirty_metadata(&mut h, 10, b"hello").unwrap();
        j.revoke(&mut h, 10);
        let drained = j.stop(h).unwrap();
        assert!(drained.is_empty());
    }

    #[test]
    fn read_cached_sees_uncommitted_dirty_write() {
        use crate::device::test_support::MemDevice;
        let dev = MemDevice::new(512, 4);
        let j = Journal::new();
        let mut h = j.start(4).unwrap();
        h.get_write_access(2);
        j.dirty_metadata(&mut h, 2, &[0xAAu8; 512]).unwrap();
        let seen = j.read_cached(&dev, 2).unwrap();
        assert_eq!(seen, vec![0xAAu8; 512]);
        j.stop(h).unwrap();
    }

    #[test]
    fn callbacks_run_on_stop() {
        let j = Journal::new();
        let h = j.start(1).unwrap();
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        j.callback_add(Box::new(move |_| ran2.store(true, std::sync::atomic::Ordering::SeqCst)));
        j.stop(h).unwrap();
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
