//! An in-process striped cluster.
//!
//! Stands in for a distributed filesystem: a namespace of objects, a set of
//! storage nodes with deterministic stripe placement, layout holds with
//! recall, and counters plus fault injection so callers can observe exactly
//! which backend primitives ran.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info};
use xxhash_rust::xxh3::xxh3_64;

use super::{
    AttrUpdate, Attrs, Backend, Connector, DirEntry, FileKind, Hold, Inode, IoMode, NfsTime,
    ReadResult, RecallHook, Stability, StripeLayout, VInode,
};
use crate::config::{BackendKind, MountParams, DEFAULT_STRIPE_UNIT};
use crate::error::{BackendError, BackendResult};
use crate::wire::NO_SNAPSHOT;

pub const ROOT_INO: u64 = 1;

/// Port storage nodes serve NFS on.
pub const DS_PORT: u16 = 2049;

/// Largest file the simulated cluster will store.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1 << 30;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub fsid: i64,
    pub stripe_unit: u32,
    pub object_size: u32,
    pub pool_id: u32,
    pub nodes: Vec<SocketAddr>,
    /// Node co-located with this server.
    pub local_node: Option<u32>,
    /// Limit on the writable span of a WRITE layout.
    pub write_bound: Option<u64>,
    /// Sizes and write ends past this fail with `NoSpace`.
    pub max_file_size: u64,
}

impl ClusterConfig {
    pub fn with_nodes(count: u32) -> Self {
        let nodes = (0..count)
            .map(|i| {
                let ip = Ipv4Addr::new(10, 0, (i / 250) as u8, (i % 250 + 1) as u8);
                SocketAddr::new(IpAddr::V4(ip), DS_PORT)
            })
            .collect();
        Self {
            fsid: 1,
            stripe_unit: DEFAULT_STRIPE_UNIT,
            object_size: DEFAULT_STRIPE_UNIT,
            pool_id: 1,
            nodes,
            local_node: Some(0),
            write_bound: None,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::with_nodes(4)
    }
}

/// Backend primitives that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Hold,
    Getattr,
    Setattr,
    FileLayout,
    StripeOwner,
    NodeAddr,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterStats {
    pub holds: u64,
    pub releases: u64,
    pub active_holds: usize,
    pub setattrs: u64,
    pub outstanding_refs: u64,
    pub disconnected: bool,
}

struct Object {
    attrs: Attrs,
    data: Vec<u8>,
    children: BTreeMap<String, u64>,
    target: Option<String>,
}

struct HoldRecord {
    ino: u64,
    mode: IoMode,
    recall: RecallHook,
}

pub struct MemoryCluster {
    config: ClusterConfig,
    objects: RwLock<HashMap<u64, Object>>,
    refs: DashMap<u64, u32>,
    holds: Mutex<HashMap<u64, HoldRecord>>,
    faults: Mutex<HashMap<Fault, BackendError>>,
    next_ino: AtomicU64,
    next_serial: AtomicU64,
    hold_calls: AtomicU64,
    release_calls: AtomicU64,
    setattr_calls: AtomicU64,
    disconnected: AtomicBool,
}

impl MemoryCluster {
    pub fn new(config: ClusterConfig) -> Self {
        let mut objects = HashMap::new();
        objects.insert(
            ROOT_INO,
            Object {
                attrs: new_attrs(ROOT_INO, FileKind::Directory, 0o755),
                data: Vec::new(),
                children: BTreeMap::new(),
                target: None,
            },
        );
        Self {
            config,
            objects: RwLock::new(objects),
            refs: DashMap::new(),
            holds: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            next_serial: AtomicU64::new(1),
            hold_calls: AtomicU64::new(0),
            release_calls: AtomicU64::new(0),
            setattr_calls: AtomicU64::new(0),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Make `fault` fail with `err` until cleared.
    pub fn inject(&self, fault: Fault, err: BackendError) {
        self.faults.lock().insert(fault, err);
    }

    pub fn clear(&self, fault: Fault) {
        self.faults.lock().remove(&fault);
    }

    fn check(&self, fault: Fault) -> BackendResult<()> {
        match self.faults.lock().get(&fault) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Create a regular file at `path`, making parent directories as needed.
    /// Takes no references. Returns the file's inode number.
    pub fn seed_file(&self, path: &str, data: &[u8]) -> BackendResult<u64> {
        let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let name = parts.pop().ok_or(BackendError::Invalid)?;
        let mut dir = ROOT_INO;
        for part in parts {
            let existing = self.child_of(dir, part)?;
            dir = match existing {
                Some(ino) => ino,
                None => self.link_child(dir, part, FileKind::Directory, 0o755, None)?,
            };
        }
        let ino = self.link_child(dir, name, FileKind::Regular, 0o644, None)?;
        let mut objects = self.objects.write();
        if let Some(obj) = objects.get_mut(&ino) {
            obj.data = data.to_vec();
            obj.attrs.size = data.len() as u64;
        }
        Ok(ino)
    }

    /// Bytes stored for `ino`, including any not yet reflected in its size.
    pub fn data(&self, ino: u64) -> Option<Vec<u8>> {
        self.objects.read().get(&ino).map(|o| o.data.clone())
    }

    pub fn attrs_of(&self, ino: u64) -> Option<Attrs> {
        self.objects.read().get(&ino).map(|o| o.attrs.clone())
    }

    /// Set the modification time directly, as another client would.
    pub fn touch(&self, ino: u64, mtime: NfsTime) {
        if let Some(obj) = self.objects.write().get_mut(&ino) {
            obj.attrs.mtime = mtime;
        }
    }

    pub fn refs(&self, ino: u64) -> u32 {
        self.refs.get(&ino).map(|r| *r).unwrap_or(0)
    }

    pub fn outstanding_refs(&self) -> u64 {
        self.refs.iter().map(|r| *r.value() as u64).sum()
    }

    pub fn active_holds(&self, ino: u64, mode: IoMode) -> usize {
        self.holds
            .lock()
            .values()
            .filter(|h| h.ino == ino && h.mode == mode)
            .count()
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            holds: self.hold_calls.load(Ordering::SeqCst),
            releases: self.release_calls.load(Ordering::SeqCst),
            active_holds: self.holds.lock().len(),
            setattrs: self.setattr_calls.load(Ordering::SeqCst),
            outstanding_refs: self.outstanding_refs(),
            disconnected: self.disconnected.load(Ordering::SeqCst),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Ask every holder of a `mode` layout on `ino` to give it back. The hooks
    /// run on a separate thread, as a cluster callback would. Returns how
    /// many hooks accepted the recall.
    pub fn recall(&self, ino: u64, mode: IoMode) -> usize {
        let hooks: Vec<RecallHook> = self
            .holds
            .lock()
            .values()
            .filter(|h| h.ino == ino && h.mode == mode)
            .map(|h| Arc::clone(&h.recall))
            .collect();
        debug!("recalling {} {:?} hold(s) on inode {}", hooks.len(), mode, ino);
        let worker = std::thread::Builder::new()
            .name("cluster-recall".to_string())
            .spawn(move || hooks.iter().filter(|hook| hook(mode)).count());
        match worker {
            Ok(handle) => handle.join().unwrap_or(0),
            Err(e) => {
                error!("failed to spawn recall thread: {}", e);
                0
            }
        }
    }

    fn child_of(&self, dir: u64, name: &str) -> BackendResult<Option<u64>> {
        let objects = self.objects.read();
        let parent = objects.get(&dir).ok_or(BackendError::Stale)?;
        if parent.attrs.kind != FileKind::Directory {
            return Err(BackendError::NotDir);
        }
        Ok(parent.children.get(name).copied())
    }

    fn link_child(
        &self,
        dir: u64,
        name: &str,
        kind: FileKind,
        mode: u32,
        target: Option<String>,
    ) -> BackendResult<u64> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(BackendError::Invalid);
        }
        let mut objects = self.objects.write();
        let parent = objects.get(&dir).ok_or(BackendError::Stale)?;
        if parent.attrs.kind != FileKind::Directory {
            return Err(BackendError::NotDir);
        }
        if parent.children.contains_key(name) {
            return Err(BackendError::Exists);
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let mut attrs = new_attrs(ino, kind, mode);
        if let Some(ref t) = target {
            attrs.size = t.len() as u64;
        }
        objects.insert(
            ino,
            Object {
                attrs,
                data: Vec::new(),
                children: BTreeMap::new(),
                target,
            },
        );
        if let Some(parent) = objects.get_mut(&dir) {
            parent.children.insert(name.to_string(), ino);
            let now = NfsTime::now();
            parent.attrs.mtime = now;
            parent.attrs.ctime = now;
            if kind == FileKind::Directory {
                parent.attrs.nlink += 1;
            }
        }
        Ok(ino)
    }

    fn take_ref(&self, ino: u64) -> Inode {
        *self.refs.entry(ino).or_insert(0) += 1;
        Inode::new(VInode::new(ino, NO_SNAPSHOT))
    }

    fn referenced(&self, ino: u64) -> BackendResult<(Inode, Attrs)> {
        let attrs = self.attrs_of(ino).ok_or(BackendError::Stale)?;
        Ok((self.take_ref(ino), attrs))
    }

    fn placement(&self, ino: u64, stripe: u64, layout: &StripeLayout) -> BackendResult<u32> {
        let nodes = self.config.nodes.len() as u64;
        if nodes == 0 {
            return Err(BackendError::Invalid);
        }
        let mut key = [0u8; 20];
        key[0..8].copy_from_slice(&ino.to_le_bytes());
        key[8..16].copy_from_slice(&stripe.to_le_bytes());
        key[16..20].copy_from_slice(&layout.pool_id.to_le_bytes());
        Ok((xxh3_64(&key) % nodes) as u32)
    }
}

fn new_attrs(ino: u64, kind: FileKind, mode: u32) -> Attrs {
    let now = NfsTime::now();
    Attrs {
        fileid: ino,
        kind,
        mode: mode & 0o7777,
        nlink: if kind == FileKind::Directory { 2 } else { 1 },
        uid: 0,
        gid: 0,
        size: 0,
        atime: now,
        mtime: now,
        ctime: now,
    }
}

fn copy_out(data: &[u8], limit: u64, offset: u64, buf: &mut [u8]) -> ReadResult {
    let end = (data.len() as u64).min(limit);
    if offset >= end {
        return ReadResult { len: 0, eof: true };
    }
    let start = offset as usize;
    let len = buf.len().min((end - offset) as usize);
    buf[..len].copy_from_slice(&data[start..start + len]);
    ReadResult {
        len,
        eof: offset + len as u64 >= end,
    }
}

/// Byte length of a file of `size`, if the cluster can hold it.
fn storable(size: u64, limit: u64) -> BackendResult<usize> {
    if size > limit {
        return Err(BackendError::NoSpace);
    }
    usize::try_from(size).map_err(|_| BackendError::NoSpace)
}

/// Store `bytes` at `offset`, returning the end of the written range.
fn copy_in(data: &mut Vec<u8>, limit: u64, offset: u64, bytes: &[u8]) -> BackendResult<u64> {
    let end = offset
        .checked_add(bytes.len() as u64)
        .ok_or(BackendError::NoSpace)?;
    let stop = storable(end, limit)?;
    let start = stop - bytes.len();
    if data.len() < stop {
        data.resize(stop, 0);
    }
    data[start..stop].copy_from_slice(bytes);
    Ok(end)
}

impl Backend for MemoryCluster {
    fn fsid(&self) -> i64 {
        self.config.fsid
    }

    fn root(&self) -> BackendResult<(Inode, Attrs)> {
        self.referenced(ROOT_INO)
    }

    fn get_inode(&self, vino: VInode) -> BackendResult<(Inode, Attrs)> {
        self.referenced(vino.ino)
    }

    fn lookup(&self, dir: &Inode, name: &str) -> BackendResult<(Inode, Attrs)> {
        match self.child_of(dir.ino(), name)? {
            Some(ino) => self.referenced(ino),
            None => Err(BackendError::NotFound),
        }
    }

    fn put(&self, inode: Inode) {
        let ino = inode.ino();
        let remove = match self.refs.get_mut(&ino) {
            Some(mut count) => {
                *count -= 1;
                *count == 0
            }
            None => {
                error!("put of unreferenced inode {}", ino);
                false
            }
        };
        if remove {
            self.refs.remove_if(&ino, |_, c| *c == 0);
        }
    }

    fn getattr(&self, inode: &Inode) -> BackendResult<Attrs> {
        self.check(Fault::Getattr)?;
        self.attrs_of(inode.ino()).ok_or(BackendError::Stale)
    }

    fn setattr(&self, inode: &Inode, update: &AttrUpdate) -> BackendResult<Attrs> {
        self.check(Fault::Setattr)?;
        self.setattr_calls.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&inode.ino()).ok_or(BackendError::Stale)?;
        if let Some(size) = update.size {
            if obj.attrs.kind != FileKind::Regular {
                return Err(BackendError::Invalid);
            }
            obj.data.resize(storable(size, self.config.max_file_size)?, 0);
            obj.attrs.size = size;
        }
        if let Some(mode) = update.mode {
            obj.attrs.mode = mode & 0o7777;
        }
        if let Some(mtime) = update.mtime {
            obj.attrs.mtime = mtime;
        }
        obj.attrs.ctime = NfsTime::now();
        Ok(obj.attrs.clone())
    }

    fn create(&self, dir: &Inode, name: &str, mode: u32) -> BackendResult<(Inode, Attrs)> {
        let ino = self.link_child(dir.ino(), name, FileKind::Regular, mode, None)?;
        self.referenced(ino)
    }

    fn mkdir(&self, dir: &Inode, name: &str, mode: u32) -> BackendResult<(Inode, Attrs)> {
        let ino = self.link_child(dir.ino(), name, FileKind::Directory, mode, None)?;
        self.referenced(ino)
    }

    fn symlink(&self, dir: &Inode, name: &str, target: &str) -> BackendResult<(Inode, Attrs)> {
        let ino = self.link_child(
            dir.ino(),
            name,
            FileKind::Symlink,
            0o777,
            Some(target.to_string()),
        )?;
        self.referenced(ino)
    }

    fn readlink(&self, inode: &Inode) -> BackendResult<String> {
        let objects = self.objects.read();
        let obj = objects.get(&inode.ino()).ok_or(BackendError::Stale)?;
        obj.target.clone().ok_or(BackendError::Invalid)
    }

    fn unlink(&self, dir: &Inode, name: &str) -> BackendResult<()> {
        let mut objects = self.objects.write();
        let child = objects
            .get(&dir.ino())
            .ok_or(BackendError::Stale)?
            .children
            .get(name)
            .copied()
            .ok_or(BackendError::NotFound)?;
        let is_dir = match objects.get(&child) {
            Some(obj) if obj.attrs.kind == FileKind::Directory => {
                if !obj.children.is_empty() {
                    return Err(BackendError::NotEmpty);
                }
                true
            }
            _ => false,
        };
        if let Some(parent) = objects.get_mut(&dir.ino()) {
            parent.children.remove(name);
            parent.attrs.mtime = NfsTime::now();
            if is_dir {
                parent.attrs.nlink -= 1;
            }
        }
        if let Some(obj) = objects.get_mut(&child) {
            obj.attrs.nlink = obj.attrs.nlink.saturating_sub(1);
        }
        Ok(())
    }

    fn readdir(&self, dir: &Inode) -> BackendResult<Vec<DirEntry>> {
        let objects = self.objects.read();
        let obj = objects.get(&dir.ino()).ok_or(BackendError::Stale)?;
        if obj.attrs.kind != FileKind::Directory {
            return Err(BackendError::NotDir);
        }
        Ok(obj
            .children
            .iter()
            .map(|(name, ino)| DirEntry {
                name: name.clone(),
                ino: *ino,
                kind: objects
                    .get(ino)
                    .map(|o| o.attrs.kind)
                    .unwrap_or(FileKind::Other),
            })
            .collect())
    }

    fn read(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> BackendResult<ReadResult> {
        let objects = self.objects.read();
        let obj = objects.get(&inode.ino()).ok_or(BackendError::Stale)?;
        if obj.attrs.kind == FileKind::Directory {
            return Err(BackendError::IsDir);
        }
        Ok(copy_out(&obj.data, obj.attrs.size, offset, buf))
    }

    fn write(
        &self,
        inode: &Inode,
        offset: u64,
        data: &[u8],
        stability: Stability,
    ) -> BackendResult<(usize, Stability)> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&inode.ino()).ok_or(BackendError::Stale)?;
        if obj.attrs.kind != FileKind::Regular {
            return Err(BackendError::IsDir);
        }
        let end = copy_in(&mut obj.data, self.config.max_file_size, offset, data)?;
        obj.attrs.size = obj.attrs.size.max(end);
        let now = NfsTime::now();
        obj.attrs.mtime = obj.attrs.mtime.max(now);
        obj.attrs.ctime = now;
        Ok((data.len(), stability))
    }

    fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            error!("cluster connection closed twice");
            return;
        }
        info!("cluster connection closed, fsid={}", self.config.fsid);
    }

    fn supports_pnfs(&self) -> bool {
        true
    }

    fn file_layout(&self, vino: VInode) -> BackendResult<StripeLayout> {
        self.check(Fault::FileLayout)?;
        if !self.objects.read().contains_key(&vino.ino) {
            return Err(BackendError::Stale);
        }
        Ok(StripeLayout {
            stripe_unit: self.config.stripe_unit,
            stripe_count: 1,
            object_size: self.config.object_size,
            pool_id: self.config.pool_id,
        })
    }

    fn stripe_owner(&self, vino: VInode, stripe: u64, layout: &StripeLayout) -> BackendResult<u32> {
        self.check(Fault::StripeOwner)?;
        self.placement(vino.ino, stripe, layout)
    }

    fn node_count(&self) -> u32 {
        self.config.nodes.len() as u32
    }

    fn node_addr(&self, node: u32) -> BackendResult<SocketAddr> {
        self.check(Fault::NodeAddr)?;
        self.config
            .nodes
            .get(node as usize)
            .copied()
            .ok_or(BackendError::Invalid)
    }

    fn local_node(&self) -> Option<u32> {
        self.config.local_node
    }

    fn snap_seq(&self, vino: VInode) -> BackendResult<u64> {
        if self.objects.read().contains_key(&vino.ino) {
            Ok(1)
        } else {
            Err(BackendError::Stale)
        }
    }

    fn hold(&self, vino: VInode, mode: IoMode, recall: RecallHook) -> BackendResult<Hold> {
        self.check(Fault::Hold)?;
        self.hold_calls.fetch_add(1, Ordering::SeqCst);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        self.holds.lock().insert(
            serial,
            HoldRecord {
                ino: vino.ino,
                mode,
                recall,
            },
        );
        debug!("hold {} taken on inode {} ({:?})", serial, vino.ino, mode);
        Ok(Hold {
            serial,
            max_len: if mode.is_write() {
                self.config.write_bound
            } else {
                None
            },
        })
    }

    fn release_hold(&self, vino: VInode, serial: u64) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        if self.holds.lock().remove(&serial).is_none() {
            error!("release of unknown hold {} on inode {}", serial, vino.ino);
        }
    }

    fn read_stripe(
        &self,
        vino: VInode,
        _layout: &StripeLayout,
        _snap_seq: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> BackendResult<ReadResult> {
        let objects = self.objects.read();
        let obj = objects.get(&vino.ino).ok_or(BackendError::Stale)?;
        Ok(copy_out(&obj.data, u64::MAX, offset, buf))
    }

    fn write_stripe(
        &self,
        vino: VInode,
        _layout: &StripeLayout,
        _snap_seq: u64,
        offset: u64,
        data: &[u8],
        stability: Stability,
    ) -> BackendResult<(usize, Stability)> {
        let mut objects = self.objects.write();
        let obj = objects.get_mut(&vino.ino).ok_or(BackendError::Stale)?;
        copy_in(&mut obj.data, self.config.max_file_size, offset, data)?;
        Ok((data.len(), stability.max(Stability::DataSync)))
    }
}

/// Opens a fresh [`MemoryCluster`] per connection and keeps them for inspection.
pub struct ClusterConnector {
    config: ClusterConfig,
    clusters: Mutex<Vec<Arc<MemoryCluster>>>,
    refuse: Mutex<Option<String>>,
}

impl ClusterConnector {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            clusters: Mutex::new(Vec::new()),
            refuse: Mutex::new(None),
        }
    }

    /// Make subsequent connects fail with `reason` (or succeed again on `None`).
    pub fn refuse(&self, reason: Option<&str>) {
        *self.refuse.lock() = reason.map(str::to_string);
    }

    pub fn connects(&self) -> usize {
        self.clusters.lock().len()
    }

    pub fn disconnects(&self) -> usize {
        self.clusters
            .lock()
            .iter()
            .filter(|c| c.is_disconnected())
            .count()
    }

    pub fn latest(&self) -> Option<Arc<MemoryCluster>> {
        self.clusters.lock().last().cloned()
    }
}

impl Default for ClusterConnector {
    fn default() -> Self {
        Self::new(ClusterConfig::default())
    }
}

impl Connector for ClusterConnector {
    fn connect(&self, params: &MountParams) -> BackendResult<Arc<dyn Backend>> {
        if params.backend != BackendKind::Cluster {
            return Err(BackendError::Connect(format!(
                "cluster connector cannot open {:?} backends",
                params.backend
            )));
        }
        if let Some(reason) = self.refuse.lock().clone() {
            return Err(BackendError::Connect(reason));
        }
        let cluster = Arc::new(MemoryCluster::new(self.config.clone()));
        self.clusters.lock().push(Arc::clone(&cluster));
        info!("cluster connection opened for {}", params.target);
        Ok(cluster)
    }
}
