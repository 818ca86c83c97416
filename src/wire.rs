//! Client-visible handle encoding.
//!
//! A [`WireKey`] is the only per-object state that leaves the server. Its
//! layout is fixed little-endian and must stay bit-exact across restarts,
//! because clients cache handles indefinitely.
//!
//! ```text
//! 0        8             16              24
//! | inode  | snapshot_id | filesystem_id |
//! ```
//!
//! The 8-byte short form carries the inode only; snapshot and filesystem id
//! are implied zero.

use serde::Serialize;

use crate::error::{FsalError, Result};

/// Length of the full wire form.
pub const WIRE_KEY_LEN: usize = 24;

/// Length of the inode-only short form.
pub const SHORT_WIRE_KEY_LEN: usize = 8;

/// Snapshot id of the live (non-snapshot) view of an object.
pub const NO_SNAPSHOT: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WireKey {
    pub inode: u64,
    pub snapshot_id: u64,
    pub filesystem_id: i64,
}

impl WireKey {
    pub fn new(inode: u64, snapshot_id: u64, filesystem_id: i64) -> Self {
        Self {
            inode,
            snapshot_id,
            filesystem_id,
        }
    }

    /// Write the full form into `out`. Nothing is written if `out` is short.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        if out.len() < WIRE_KEY_LEN {
            return Err(FsalError::TooSmall {
                need: WIRE_KEY_LEN,
                have: out.len(),
            });
        }
        out[0..8].copy_from_slice(&self.inode.to_le_bytes());
        out[8..16].copy_from_slice(&self.snapshot_id.to_le_bytes());
        out[16..24].copy_from_slice(&self.filesystem_id.to_le_bytes());
        Ok(WIRE_KEY_LEN)
    }

    pub fn to_bytes(&self) -> [u8; WIRE_KEY_LEN] {
        let mut buf = [0u8; WIRE_KEY_LEN];
        buf[0..8].copy_from_slice(&self.inode.to_le_bytes());
        buf[8..16].copy_from_slice(&self.snapshot_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.filesystem_id.to_le_bytes());
        buf
    }

    /// Parse either the short or the full form.
    pub fn decode(input: &[u8]) -> Result<Self> {
        match input.len() {
            SHORT_WIRE_KEY_LEN => Ok(Self {
                inode: read_u64(input, 0),
                snapshot_id: NO_SNAPSHOT,
                filesystem_id: 0,
            }),
            WIRE_KEY_LEN => Ok(Self {
                inode: read_u64(input, 0),
                snapshot_id: read_u64(input, 8),
                filesystem_id: read_u64(input, 16) as i64,
            }),
            len => Err(FsalError::BadHandle { len }),
        }
    }

    pub fn hex(&self) -> String {
        self.to_bytes().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}
