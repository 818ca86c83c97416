//! Object handles.
//!
//! An [`ObjectHandle`] owns exactly one backend reference, taken when it is
//! built and returned when it is dropped. It cannot be cloned, so the
//! reference cannot be returned twice.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::debug;

use crate::backend::{
    AttrUpdate, Attrs, Backend, DirEntry, FileKind, Inode, IoMode, ReadResult, Stability, VInode,
};
use crate::error::{FsalError, Result};
use crate::export::ExportShared;
use crate::pnfs::pins::LayoutPinState;
use crate::wire::WireKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum OpenState {
    #[default]
    Closed,
    Read,
    Write,
    ReadWrite,
}

impl OpenState {
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    fn merge(self, other: Self) -> Self {
        match (self.can_read() || other.can_read(), self.can_write() || other.can_write()) {
            (true, true) => Self::ReadWrite,
            (true, false) => Self::Read,
            (false, true) => Self::Write,
            (false, false) => Self::Closed,
        }
    }
}

#[derive(Default)]
pub(crate) struct HandleState {
    pub(crate) open: OpenState,
    pub(crate) pins: LayoutPinState,
}

pub struct ObjectHandle {
    key: WireKey,
    inode: Inode,
    kind: FileKind,
    export: Weak<ExportShared>,
    backend: Arc<dyn Backend>,
    state: Mutex<HandleState>,
    // Serializes LAYOUTCOMMIT's read-modify-write of size and mtime.
    commit_lock: Mutex<()>,
}

impl ObjectHandle {
    pub(crate) fn new(export: &Arc<ExportShared>, inode: Inode, attrs: &Attrs) -> Self {
        let backend = Arc::clone(export.backend());
        let vino = inode.vino();
        Self {
            key: WireKey::new(vino.ino, vino.snap, backend.fsid()),
            inode,
            kind: attrs.kind,
            export: Arc::downgrade(export),
            backend,
            state: Mutex::new(HandleState::default()),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn vino(&self) -> VInode {
        self.inode.vino()
    }

    pub(crate) fn inode(&self) -> &Inode {
        &self.inode
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub(crate) fn export(&self) -> Result<Arc<ExportShared>> {
        self.export.upgrade().ok_or(FsalError::StaleExport)
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock()
    }

    pub(crate) fn lock_commit(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// The key clients use to name this object.
    pub fn handle_to_key(&self) -> WireKey {
        self.key
    }

    /// Write the wire handle into `out`, returning its length.
    pub fn handle_to_wire(&self, out: &mut [u8]) -> Result<usize> {
        self.key.encode(out)
    }

    /// Give the backend reference back. Equivalent to dropping the handle.
    pub fn release(self) {}

    pub fn lookup(&self, name: &str) -> Result<ObjectHandle> {
        let export = self.export()?;
        let (inode, attrs) = self.backend.lookup(&self.inode, name)?;
        Ok(ObjectHandle::new(&export, inode, &attrs))
    }

    pub fn create(&self, name: &str, mode: u32) -> Result<ObjectHandle> {
        let export = self.export()?;
        let (inode, attrs) = self.backend.create(&self.inode, name, mode)?;
        Ok(ObjectHandle::new(&export, inode, &attrs))
    }

    pub fn mkdir(&self, name: &str, mode: u32) -> Result<ObjectHandle> {
        let export = self.export()?;
        let (inode, attrs) = self.backend.mkdir(&self.inode, name, mode)?;
        Ok(ObjectHandle::new(&export, inode, &attrs))
    }

    pub fn symlink(&self, name: &str, target: &str) -> Result<ObjectHandle> {
        let export = self.export()?;
        let (inode, attrs) = self.backend.symlink(&self.inode, name, target)?;
        Ok(ObjectHandle::new(&export, inode, &attrs))
    }

    pub fn readlink(&self) -> Result<String> {
        if self.kind != FileKind::Symlink {
            return Err(crate::error::BackendError::Invalid.into());
        }
        Ok(self.backend.readlink(&self.inode)?)
    }

    pub fn unlink(&self, name: &str) -> Result<()> {
        Ok(self.backend.unlink(&self.inode, name)?)
    }

    pub fn readdir(&self) -> Result<Vec<DirEntry>> {
        Ok(self.backend.readdir(&self.inode)?)
    }

    pub fn getattr(&self) -> Result<Attrs> {
        Ok(self.backend.getattr(&self.inode)?)
    }

    pub fn setattr(&self, update: &AttrUpdate) -> Result<Attrs> {
        if update.is_empty() {
            return self.getattr();
        }
        Ok(self.backend.setattr(&self.inode, update)?)
    }

    pub fn open_state(&self) -> OpenState {
        self.state.lock().open
    }

    /// Open for `mode`, widening any access already granted.
    pub fn open(&self, mode: OpenState) -> Result<OpenState> {
        if self.kind != FileKind::Regular {
            return Err(FsalError::NotRegularFile);
        }
        if mode == OpenState::Closed {
            return Err(crate::error::BackendError::Invalid.into());
        }
        let mut state = self.state.lock();
        state.open = state.open.merge(mode);
        debug!("inode {} open {:?}", self.key.inode, state.open);
        Ok(state.open)
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.open == OpenState::Closed {
            return Err(FsalError::NotOpen);
        }
        state.open = OpenState::Closed;
        Ok(())
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<ReadResult> {
        if !self.open_state().can_read() {
            return Err(FsalError::NotOpen);
        }
        Ok(self.backend.read(&self.inode, offset, buf)?)
    }

    pub fn write(&self, offset: u64, data: &[u8], stability: Stability) -> Result<(usize, Stability)> {
        if !self.open_state().can_write() {
            return Err(FsalError::NotOpen);
        }
        Ok(self.backend.write(&self.inode, offset, data, stability)?)
    }

    /// Layouts of `mode` currently granted on this object.
    pub fn layout_pins(&self, mode: IoMode) -> u32 {
        self.state.lock().pins.count(mode)
    }

    pub fn write_bound(&self) -> Option<u64> {
        self.state.lock().pins.write_bound()
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        let vino = self.inode.vino();
        self.state.get_mut().pins.release_all(&*self.backend, vino);
        let placeholder = Inode::new(vino);
        let inode = std::mem::replace(&mut self.inode, placeholder);
        debug!("releasing handle for inode {}", inode.ino());
        self.backend.put(inode);
    }
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish()
    }
}
