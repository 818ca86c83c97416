//! Exports: one configured share over a mounted backend.

use std::ops::Deref;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{Backend, VInode};
use crate::config::{ExportConfig, Identity, PnfsConfig};
use crate::error::{BackendError, Result};
use crate::handle::ObjectHandle;
use crate::mount::{Mount, MountRegistry};
use crate::pnfs::ds::DsHandle;
use crate::pnfs::{DeviceList, LayoutType};
use crate::recall::RecallSender;
use crate::wire::WireKey;

/// State every handle of an export can reach through a weak reference.
pub(crate) struct ExportShared {
    pub(crate) id: u16,
    pub(crate) mount: Arc<Mount>,
    pub(crate) identity: Identity,
    pub(crate) pnfs: PnfsConfig,
    pub(crate) recall: Option<RecallSender>,
}

impl ExportShared {
    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        self.mount.backend()
    }
}

/// One registry reference, given back when dropped.
struct MountLease {
    registry: Arc<MountRegistry>,
    mount: Arc<Mount>,
    export_id: u16,
}

impl Drop for MountLease {
    fn drop(&mut self) {
        self.mount.detach(self.export_id);
        self.registry.release(Arc::clone(&self.mount));
    }
}

/// Result of [`Export::lookup_path`]. The export root is lent out rather
/// than referenced a second time.
pub enum PathHandle<'a> {
    Root(&'a ObjectHandle),
    Owned(ObjectHandle),
}

impl PathHandle<'_> {
    pub fn is_root(&self) -> bool {
        matches!(self, PathHandle::Root(_))
    }
}

impl Deref for PathHandle<'_> {
    type Target = ObjectHandle;

    fn deref(&self) -> &ObjectHandle {
        match self {
            PathHandle::Root(h) => h,
            PathHandle::Owned(h) => h,
        }
    }
}

pub struct Export {
    // Drop order matters: the root goes before the mount is released.
    root: ObjectHandle,
    lease: MountLease,
    shared: Arc<ExportShared>,
    sub_path: String,
}

impl Export {
    /// Mount (or share) the backend named by `config` and resolve its
    /// sub-path to the export root.
    pub fn create(
        registry: &Arc<MountRegistry>,
        config: &ExportConfig,
        recall: Option<RecallSender>,
    ) -> Result<Export> {
        let mount = registry.acquire(&config.mount)?;
        mount.attach(config.export_id);
        let lease = MountLease {
            registry: Arc::clone(registry),
            mount: Arc::clone(&mount),
            export_id: config.export_id,
        };
        let shared = Arc::new(ExportShared {
            id: config.export_id,
            mount,
            identity: config.identity.clone(),
            pnfs: config.pnfs.clone(),
            recall,
        });

        // On failure the lease drops here and the mount reference goes with it.
        let root = resolve(&shared, &config.sub_path)?;

        info!(
            "export {} created on {}:{}",
            config.export_id, config.mount.target, config.sub_path
        );
        Ok(Export {
            root,
            lease,
            shared,
            sub_path: normalize(&config.sub_path).to_string(),
        })
    }

    /// Release the root handle, then the mount reference.
    pub fn destroy(self) {
        info!("export {} released", self.shared.id);
    }

    pub fn id(&self) -> u16 {
        self.shared.id
    }

    pub fn root(&self) -> &ObjectHandle {
        &self.root
    }

    pub fn sub_path(&self) -> &str {
        &self.sub_path
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.lease.mount
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        self.shared.backend()
    }

    /// Resolve `path` below the export root. Accepts `host:/path` as well
    /// as plain absolute paths; a leading copy of the export's own sub-path
    /// is ignored.
    pub fn lookup_path(&self, path: &str) -> Result<PathHandle<'_>> {
        // Only a path that is not already absolute may carry a `host:` prefix.
        let path = if path.starts_with('/') {
            path
        } else {
            match path.split_once(':') {
                Some((_, rest)) if rest.starts_with('/') => rest,
                _ => return Err(BackendError::Invalid.into()),
            }
        };
        let path = normalize(path);
        let relative: &str = if self.sub_path == "/" {
            path
        } else if path == self.sub_path {
            ""
        } else {
            match path.strip_prefix(self.sub_path.as_str()) {
                Some(rest) if rest.starts_with('/') => rest,
                _ => path,
            }
        };

        let mut current: Option<ObjectHandle> = None;
        for name in components(relative) {
            let next = match current {
                Some(ref dir) => dir.lookup(name)?,
                None => self.root.lookup(name)?,
            };
            current = Some(next);
        }
        debug!("export {} resolved {}", self.shared.id, path);
        Ok(match current {
            Some(h) => PathHandle::Owned(h),
            None => PathHandle::Root(&self.root),
        })
    }

    /// Turn a client's wire handle back into an object handle.
    pub fn create_handle(&self, wire: &[u8]) -> Result<ObjectHandle> {
        let key = WireKey::decode(wire)?;
        let (inode, attrs) = self
            .backend()
            .get_inode(VInode::new(key.inode, key.snapshot_id))?;
        Ok(ObjectHandle::new(&self.shared, inode, &attrs))
    }

    /// Validate a wire handle and report the length of its key.
    pub fn extract_handle(&self, wire: &[u8]) -> Result<usize> {
        WireKey::decode(wire)?;
        Ok(wire.len())
    }

    /// Build a data-server handle from the payload embedded in a layout.
    pub fn create_ds_handle(&self, payload: &[u8]) -> Result<DsHandle> {
        DsHandle::from_payload(Arc::clone(self.backend()), payload)
    }

    pub fn layout_types(&self) -> &'static [LayoutType] {
        &[LayoutType::Files]
    }

    pub fn layout_blocksize(&self) -> u32 {
        self.shared.pnfs.layout_blocksize
    }

    pub fn maximum_segments(&self) -> u32 {
        self.shared.pnfs.maximum_segments
    }

    pub fn loc_body_size(&self) -> usize {
        self.shared.pnfs.loc_body_size
    }

    pub fn da_addr_size(&self) -> usize {
        self.shared.pnfs.da_addr_size
    }

    /// Device ids are derived from inodes, so there is nothing to list.
    pub fn getdevicelist(&self, layout_type: u32) -> Result<DeviceList> {
        LayoutType::from_wire(layout_type)?;
        Ok(DeviceList {
            devices: Vec::new(),
            cookie: 0,
            eof: true,
        })
    }
}

fn resolve(shared: &Arc<ExportShared>, sub_path: &str) -> Result<ObjectHandle> {
    let (inode, attrs) = shared.backend().root()?;
    let mut current = ObjectHandle::new(shared, inode, &attrs);
    for name in components(normalize(sub_path)) {
        current = current.lookup(name)?;
    }
    Ok(current)
}

fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}
