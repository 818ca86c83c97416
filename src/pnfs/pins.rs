//! Per-object layout reservations.
//!
//! Each I/O mode keeps a count of granted layouts. The backend is asked for
//! a hold only on the 0 -> 1 transition and the hold is given back on
//! 1 -> 0; everything in between coalesces onto that one hold. Callers
//! must hold the owning handle's state lock across every call here.

use tracing::{debug, warn};

use crate::backend::{Backend, IoMode, RecallHook, VInode};
use crate::error::{FsalError, Result};

#[derive(Debug, Default, Clone, Copy)]
struct ModePins {
    count: u32,
    serial: u64,
}

#[derive(Default)]
pub struct LayoutPinState {
    read: ModePins,
    write: ModePins,
    write_bound: Option<u64>,
}

impl LayoutPinState {
    fn slot(&mut self, mode: IoMode) -> &mut ModePins {
        match mode {
            IoMode::Read => &mut self.read,
            IoMode::ReadWrite => &mut self.write,
        }
    }

    pub fn count(&self, mode: IoMode) -> u32 {
        match mode {
            IoMode::Read => self.read.count,
            IoMode::ReadWrite => self.write.count,
        }
    }

    /// Writable span limit reported with the current WRITE hold.
    pub fn write_bound(&self) -> Option<u64> {
        self.write_bound
    }

    /// Add one pin for `mode`. Returns true when this pin took the backend
    /// hold. On a backend failure nothing changes.
    pub fn pin(
        &mut self,
        backend: &dyn Backend,
        vino: VInode,
        mode: IoMode,
        recall: &RecallHook,
    ) -> Result<bool> {
        let current = self.count(mode);
        let next = current
            .checked_add(1)
            .ok_or_else(|| FsalError::ServerFault("layout pin counter overflow".into()))?;
        let first = current == 0;
        if first {
            let hold = backend.hold(vino, mode, recall.clone())?;
            debug!("hold {} taken for inode {} ({:?})", hold.serial, vino.ino, mode);
            self.slot(mode).serial = hold.serial;
            if mode.is_write() {
                self.write_bound = hold.max_len;
            }
        }
        self.slot(mode).count = next;
        Ok(first)
    }

    /// Drop one pin for `mode`, returning the backend hold with the last one.
    pub fn unpin(&mut self, backend: &dyn Backend, vino: VInode, mode: IoMode) -> Result<()> {
        let slot = self.slot(mode);
        slot.count = slot.count.checked_sub(1).ok_or(FsalError::NoMatchingLayout)?;
        if slot.count > 0 {
            return Ok(());
        }
        let serial = std::mem::take(&mut slot.serial);
        backend.release_hold(vino, serial);
        debug!("hold {} returned for inode {} ({:?})", serial, vino.ino, mode);
        if mode.is_write() {
            self.write_bound = None;
        }
        Ok(())
    }

    /// Give back every hold still taken, whatever the pin counts. Returns
    /// the number of holds released.
    pub fn release_all(&mut self, backend: &dyn Backend, vino: VInode) -> usize {
        let mut released = 0;
        for mode in [IoMode::Read, IoMode::ReadWrite] {
            let slot = std::mem::take(self.slot(mode));
            if slot.count == 0 {
                continue;
            }
            warn!(
                "inode {} released with {} {:?} pins outstanding",
                vino.ino, slot.count, mode
            );
            backend.release_hold(vino, slot.serial);
            released += 1;
        }
        self.write_bound = None;
        released
    }
}
