//! Data-server handles.
//!
//! A [`DsHandle`] is built from the payload a layout carries and talks to
//! the stripes directly. It never goes through the object handle cache and
//! only takes a full backend reference when a FILE_SYNC write needs the
//! metadata path.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::stripe::{owning_node, stripe_index, stripe_remaining};
use crate::backend::{Backend, Inode, ReadResult, Stability, StripeLayout, VInode};
use crate::error::{FsalError, Result};
use crate::wire::{read_u64, WireKey, WIRE_KEY_LEN};

pub const DS_PAYLOAD_LEN: usize = WIRE_KEY_LEN + StripeLayout::ENCODED_LEN + 8;

/// Write verifier. Commit state is not tracked per range, so it never changes.
pub const ZERO_VERIFIER: [u8; 8] = [0u8; 8];

/// `wire key | stripe layout | snapshot sequence`, little-endian.
pub fn encode_payload(key: &WireKey, layout: &StripeLayout, snap_seq: u64) -> [u8; DS_PAYLOAD_LEN] {
    let mut out = [0u8; DS_PAYLOAD_LEN];
    out[..WIRE_KEY_LEN].copy_from_slice(&key.to_bytes());
    out[WIRE_KEY_LEN..WIRE_KEY_LEN + StripeLayout::ENCODED_LEN].copy_from_slice(&layout.to_bytes());
    out[DS_PAYLOAD_LEN - 8..].copy_from_slice(&snap_seq.to_le_bytes());
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DsWriteResult {
    pub written: usize,
    pub stability: Stability,
    pub verifier: [u8; 8],
}

pub struct DsHandle {
    key: WireKey,
    layout: StripeLayout,
    snap_seq: u64,
    backend: Arc<dyn Backend>,
    connected: Mutex<Option<Inode>>,
}

impl DsHandle {
    pub(crate) fn from_payload(backend: Arc<dyn Backend>, payload: &[u8]) -> Result<Self> {
        if payload.len() != DS_PAYLOAD_LEN {
            return Err(FsalError::BadHandle { len: payload.len() });
        }
        let key = WireKey::decode(&payload[..WIRE_KEY_LEN])?;
        let mut raw = [0u8; StripeLayout::ENCODED_LEN];
        raw.copy_from_slice(&payload[WIRE_KEY_LEN..WIRE_KEY_LEN + StripeLayout::ENCODED_LEN]);
        let layout = StripeLayout::from_bytes(&raw);
        if layout.stripe_unit == 0 {
            return Err(FsalError::BadHandle { len: payload.len() });
        }
        Ok(Self {
            key,
            layout,
            snap_seq: read_u64(payload, DS_PAYLOAD_LEN - 8),
            backend,
            connected: Mutex::new(None),
        })
    }

    pub fn key(&self) -> WireKey {
        self.key
    }

    pub fn layout(&self) -> &StripeLayout {
        &self.layout
    }

    pub fn snap_seq(&self) -> u64 {
        self.snap_seq
    }

    pub fn is_connected(&self) -> bool {
        self.connected.lock().is_some()
    }

    fn vino(&self) -> VInode {
        VInode::new(self.key.inode, self.key.snapshot_id)
    }

    /// Fail with PNFS_IO_HOLE unless this node stores the stripe at `offset`.
    fn check_local(&self, offset: u64) -> Result<()> {
        let stripe = stripe_index(offset, self.layout.stripe_unit);
        let owner = owning_node(&*self.backend, self.vino(), stripe, &self.layout)?;
        match self.backend.local_node() {
            Some(local) if local == owner => Ok(()),
            _ => {
                debug!(
                    "stripe {} of inode {} lives on node {}",
                    stripe, self.key.inode, owner
                );
                Err(FsalError::PnfsIoHole { offset })
            }
        }
    }

    fn clamp(&self, offset: u64, len: usize) -> usize {
        let room = stripe_remaining(offset, self.layout.stripe_unit);
        len.min(usize::try_from(room).unwrap_or(usize::MAX))
    }

    /// Read from one stripe. Never crosses a stripe boundary.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<ReadResult> {
        self.check_local(offset)?;
        let len = self.clamp(offset, buf.len());
        Ok(self
            .backend
            .read_stripe(self.vino(), &self.layout, self.snap_seq, offset, &mut buf[..len])?)
    }

    pub fn write(&self, offset: u64, data: &[u8], stability: Stability) -> Result<DsWriteResult> {
        self.check_local(offset)?;
        let data = &data[..self.clamp(offset, data.len())];

        let (written, mut achieved) = if stability == Stability::FileSync {
            // FILE_SYNC must update size and mtime, which only the
            // metadata path does.
            let mut connected = self.connected.lock();
            if connected.is_none() {
                let (inode, _) = self.backend.get_inode(self.vino())?;
                debug!("data server handle for inode {} connected", self.key.inode);
                *connected = Some(inode);
            }
            match connected.as_ref() {
                Some(inode) => self.backend.write(inode, offset, data, stability)?,
                None => return Err(FsalError::ServerFault("connect failed".into())),
            }
        } else {
            self.backend.write_stripe(
                self.vino(),
                &self.layout,
                self.snap_seq,
                offset,
                data,
                stability,
            )?
        };

        if achieved < stability {
            self.backend.sync(self.vino())?;
            achieved = Stability::FileSync;
        }
        Ok(DsWriteResult {
            written,
            stability: achieved,
            verifier: ZERO_VERIFIER,
        })
    }

    /// Flush whatever the backend buffers for this object.
    pub fn commit(&self, offset: u64, count: u64) -> Result<[u8; 8]> {
        if let Err(e) = self.backend.sync(self.vino()) {
            warn!(
                "commit of inode {} [{}, +{}) failed: {}",
                self.key.inode, offset, count, e
            );
        }
        Ok(ZERO_VERIFIER)
    }
}

impl Drop for DsHandle {
    fn drop(&mut self) {
        if let Some(inode) = self.connected.get_mut().take() {
            self.backend.put(inode);
        }
    }
}
