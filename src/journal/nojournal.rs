//! "nojournal" mode (spec §4.5): when a filesystem has no journal
//! inode/device configured, metadata writes bypass commit/replay
//! entirely. Handles are fake — a process-local counter bumped on
//! start/stop — and `dirty_metadata` becomes a synchronous
//! [`BlockDevice::write_block`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::BlockDevice;
use crate::error::{CoreError, Result};
use crate::types::BlockNumber;

/// Reference-counted fake transaction handle for nojournal mode.
pub struct NoJournalHandle {
    id: u64,
}

impl NoJournalHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Process-local handle counter plus synchronous write path, used in
/// place of [`super::Journal`] when the filesystem has no journal
/// inode/device (spec §4.5).
pub struct NoJournal {
    next_id: AtomicU64,
    open_handles: AtomicU64,
}

impl NoJournal {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            open_handles: AtomicU64::new(0),
        }
    }

    pub fn start(&self) -> NoJournalHandle {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        NoJournalHandle { id }
    }

    pub fn stop(&self, _handle: NoJournalHandle) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn open_handles(&self) -> u64 {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Writes `buf` directly to `block`, synthesizing an `EIO`-equivalent
    /// [`CoreError::IoError`] on a failed sync (spec §4.5).
    pub fn dirty_metadata(&self, device: &dyn BlockDevice, block: BlockNumber, buf: &[u8]) -> Result<()> {
        device.write_block(block, buf).map_err(|e| match e {
            CoreError::IoError(msg) => CoreError::IoError(format!("nojournal sync write failed: {}", msg)),
            other => other,
        })
    }
}

impl Default for NoJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::MemDevice;

    #[test]
    fn start_stop_tracks_open_handle_count() {
        let nj = NoJournal::new();
        let h = nj.start();
        assert_eq!(nj.open_handles(), 1);
        nj.stop(h);
        assert_eq!(nj.open_handles(), 0);
    }

    #[test]
    fn dirty_metadata_writes_synchronously() {
        let nj = NoJournal::new();
        let dev = MemDevice::new(1024, 4);
        let buf = vec![0xABu8; 1024];
        nj.dirty_metadata(&dev, 1, &buf).unwrap();
        let mut read = vec![0u8; 1024];
        dev.read_block(1, &mut read).unwrap();
        assert_eq!(read, buf);
    }
}
