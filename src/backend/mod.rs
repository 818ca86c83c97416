//! The contract every storage backend implements.
//!
//! A backend is reached through a [`Connector`], which opens one shared
//! connection per distinct [`MountParams`](crate::config::MountParams). All
//! per-object work goes through the returned [`Backend`].

pub mod local;
pub mod memory;
pub mod passthrough;

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::MountParams;
use crate::error::{BackendError, BackendResult};

/// Backend identity of an object: inode number plus snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct VInode {
    pub ino: u64,
    pub snap: u64,
}

impl VInode {
    pub fn new(ino: u64, snap: u64) -> Self {
        Self { ino, snap }
    }
}

/// One counted backend reference to an inode.
///
/// Not `Clone`: each value stands for exactly one reference, returned by
/// handing it back to [`Backend::put`].
#[derive(Debug)]
pub struct Inode {
    vino: VInode,
}

impl Inode {
    pub fn new(vino: VInode) -> Self {
        Self { vino }
    }

    pub fn vino(&self) -> VInode {
        self.vino
    }

    pub fn ino(&self) -> u64 {
        self.vino.ino
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// Seconds and nanoseconds since the epoch, ordered chronologically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NfsTime {
    pub seconds: i64,
    pub nseconds: u32,
}

impl NfsTime {
    pub fn new(seconds: i64, nseconds: u32) -> Self {
        Self { seconds, nseconds }
    }

    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            seconds: now.timestamp(),
            nseconds: now.timestamp_subsec_nanos(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attrs {
    pub fileid: u64,
    pub kind: FileKind,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: NfsTime,
    pub mtime: NfsTime,
    pub ctime: NfsTime,
}

/// Attribute changes applied in one backend call. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrUpdate {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub mtime: Option<NfsTime>,
}

impl AttrUpdate {
    pub fn is_empty(&self) -> bool {
        self.size.is_none() && self.mode.is_none() && self.mtime.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult {
    pub len: usize,
    pub eof: bool,
}

/// Layout I/O mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum IoMode {
    Read = 1,
    ReadWrite = 2,
}

impl IoMode {
    pub fn is_write(self) -> bool {
        matches!(self, IoMode::ReadWrite)
    }
}

/// Write stability levels, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum Stability {
    Unstable = 0,
    DataSync = 1,
    FileSync = 2,
}

/// Fixed-size description of how a file is striped across storage nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StripeLayout {
    pub stripe_unit: u32,
    pub stripe_count: u32,
    pub object_size: u32,
    pub pool_id: u32,
}

impl StripeLayout {
    pub const ENCODED_LEN: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.stripe_unit.to_le_bytes());
        buf[4..8].copy_from_slice(&self.stripe_count.to_le_bytes());
        buf[8..12].copy_from_slice(&self.object_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.pool_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::ENCODED_LEN]) -> Self {
        use crate::wire::read_u32;
        Self {
            stripe_unit: read_u32(buf, 0),
            stripe_count: read_u32(buf, 4),
            object_size: read_u32(buf, 8),
            pool_id: read_u32(buf, 12),
        }
    }
}

/// A backend-side reservation taken for a layout mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hold {
    pub serial: u64,
    /// Highest byte offset writable through the layout, if the backend limits it.
    pub max_len: Option<u64>,
}

/// Invoked by the backend, from a thread of its own, when it wants a held
/// layout back. Returns whether the recall was accepted for delivery.
pub type RecallHook = Arc<dyn Fn(IoMode) -> bool + Send + Sync>;

/// Opens backend connections.
pub trait Connector: Send + Sync {
    fn connect(&self, params: &MountParams) -> BackendResult<Arc<dyn Backend>>;
}

/// A live backend connection. Calls are expected to be thread-safe.
pub trait Backend: Send + Sync {
    fn fsid(&self) -> i64;

    fn root(&self) -> BackendResult<(Inode, Attrs)>;

    /// Take a reference to an inode known only by its identity.
    fn get_inode(&self, vino: VInode) -> BackendResult<(Inode, Attrs)>;

    fn lookup(&self, dir: &Inode, name: &str) -> BackendResult<(Inode, Attrs)>;

    /// Return the reference held by `inode`.
    fn put(&self, inode: Inode);

    fn getattr(&self, inode: &Inode) -> BackendResult<Attrs>;

    fn setattr(&self, inode: &Inode, update: &AttrUpdate) -> BackendResult<Attrs>;

    fn create(&self, dir: &Inode, name: &str, mode: u32) -> BackendResult<(Inode, Attrs)>;

    fn mkdir(&self, dir: &Inode, name: &str, mode: u32) -> BackendResult<(Inode, Attrs)>;

    fn symlink(&self, dir: &Inode, name: &str, target: &str) -> BackendResult<(Inode, Attrs)>;

    fn readlink(&self, inode: &Inode) -> BackendResult<String>;

    fn unlink(&self, dir: &Inode, name: &str) -> BackendResult<()>;

    fn readdir(&self, dir: &Inode) -> BackendResult<Vec<DirEntry>>;

    fn read(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> BackendResult<ReadResult>;

    fn write(
        &self,
        inode: &Inode,
        offset: u64,
        data: &[u8],
        stability: Stability,
    ) -> BackendResult<(usize, Stability)>;

    /// Tear the connection down. Called once, when the last export using it goes.
    fn disconnect(&self) {}

    fn supports_pnfs(&self) -> bool {
        false
    }

    fn file_layout(&self, _vino: VInode) -> BackendResult<StripeLayout> {
        Err(BackendError::NotSupported)
    }

    /// Storage node holding `stripe` of the object. Must be a pure function
    /// of its arguments for a fixed cluster map.
    fn stripe_owner(&self, _vino: VInode, _stripe: u64, _layout: &StripeLayout) -> BackendResult<u32> {
        Err(BackendError::NotSupported)
    }

    fn node_count(&self) -> u32 {
        0
    }

    fn node_addr(&self, _node: u32) -> BackendResult<SocketAddr> {
        Err(BackendError::NotSupported)
    }

    /// The storage node this server process runs beside, if any.
    fn local_node(&self) -> Option<u32> {
        None
    }

    fn snap_seq(&self, _vino: VInode) -> BackendResult<u64> {
        Err(BackendError::NotSupported)
    }

    fn hold(&self, _vino: VInode, _mode: IoMode, _recall: RecallHook) -> BackendResult<Hold> {
        Err(BackendError::NotSupported)
    }

    fn release_hold(&self, _vino: VInode, _serial: u64) {}

    fn read_stripe(
        &self,
        _vino: VInode,
        _layout: &StripeLayout,
        _snap_seq: u64,
        _offset: u64,
        _buf: &mut [u8],
    ) -> BackendResult<ReadResult> {
        Err(BackendError::NotSupported)
    }

    fn write_stripe(
        &self,
        _vino: VInode,
        _layout: &StripeLayout,
        _snap_seq: u64,
        _offset: u64,
        _data: &[u8],
        _stability: Stability,
    ) -> BackendResult<(usize, Stability)> {
        Err(BackendError::NotSupported)
    }

    fn sync(&self, _vino: VInode) -> BackendResult<()> {
        Ok(())
    }
}
