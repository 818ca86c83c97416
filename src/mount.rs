//! Shared backend connections.
//!
//! Every export names the connection it needs through [`MountParams`].
//! Exports with equal parameters share one [`Mount`]; the connection is
//! opened by the first of them and closed after the last lets go.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::backend::{Backend, Connector};
use crate::config::MountParams;
use crate::error::{FsalError, Result};

/// One open backend connection.
pub struct Mount {
    params: MountParams,
    backend: Arc<dyn Backend>,
    exports: Mutex<BTreeSet<u16>>,
}

impl Mount {
    pub fn params(&self) -> &MountParams {
        &self.params
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Ids of the exports currently using this connection.
    pub fn owning_exports(&self) -> Vec<u16> {
        self.exports.lock().iter().copied().collect()
    }

    pub(crate) fn attach(&self, export_id: u16) {
        self.exports.lock().insert(export_id);
    }

    pub(crate) fn detach(&self, export_id: u16) {
        self.exports.lock().remove(&export_id);
    }
}

struct Entry {
    mount: Arc<Mount>,
    refs: u32,
}

pub struct MountRegistry {
    connector: Arc<dyn Connector>,
    mounts: RwLock<HashMap<MountParams, Entry>>,
}

impl MountRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            mounts: RwLock::new(HashMap::new()),
        }
    }

    /// Take a reference to the mount for `params`, connecting if none exists.
    pub fn acquire(&self, params: &MountParams) -> Result<Arc<Mount>> {
        let mut mounts = self.mounts.write();
        if let Some(entry) = mounts.get_mut(params) {
            entry.refs += 1;
            debug!("reusing mount {} (refs={})", params.target, entry.refs);
            return Ok(Arc::clone(&entry.mount));
        }

        let backend = self
            .connector
            .connect(params)
            .map_err(FsalError::BackendInit)?;
        let mount = Arc::new(Mount {
            params: params.clone(),
            backend,
            exports: Mutex::new(BTreeSet::new()),
        });
        mounts.insert(
            params.clone(),
            Entry {
                mount: Arc::clone(&mount),
                refs: 1,
            },
        );
        info!("mounted {} ({:?})", params.target, params.backend);
        Ok(mount)
    }

    /// Give back a reference taken by [`acquire`](Self::acquire). The last
    /// release removes the mount and closes its connection.
    pub fn release(&self, mount: Arc<Mount>) {
        let mut mounts = self.mounts.write();
        let last = match mounts.get_mut(&mount.params) {
            Some(entry) if Arc::ptr_eq(&entry.mount, &mount) => {
                entry.refs -= 1;
                entry.refs == 0
            }
            _ => {
                error!("release of unregistered mount {}", mount.params.target);
                return;
            }
        };
        if last {
            mounts.remove(&mount.params);
            mount.backend.disconnect();
            info!("unmounted {}", mount.params.target);
        }
    }

    /// Number of distinct live mounts.
    pub fn len(&self) -> usize {
        self.mounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.read().is_empty()
    }

    /// Outstanding references on the mount for `params`, 0 if absent.
    pub fn refs(&self, params: &MountParams) -> u32 {
        self.mounts.read().get(params).map(|e| e.refs).unwrap_or(0)
    }
}
