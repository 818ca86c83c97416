//! pNFS files-layout support: layout grant, return and commit, device
//! information, the striping calculator and data-server handles.

pub mod device;
pub mod ds;
pub mod layout;
pub mod pins;
pub mod stripe;
pub mod xdr;

use serde::Serialize;

use crate::backend::{IoMode, NfsTime};
use crate::error::{FsalError, Result};

/// Number of stripes in the one pattern every layout uses. The pattern
/// never repeats, so it also bounds the span reachable through pNFS.
pub const BIGGEST_PATTERN: u32 = 1024;

/// Bits of the files-layout utility word that carry the stripe unit.
pub const STRIPE_UNIT_SIZE_MASK: u32 = 0xFFFF_FFC0;

pub const DEVICE_ID_LEN: usize = 16;

/// Tag in the first byte of every device id minted here.
pub const DEVICE_ID_TAG: u8 = 0x0c;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum LayoutType {
    /// LAYOUT4_NFSV4_1_FILES
    Files = 1,
}

impl LayoutType {
    pub fn from_wire(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(Self::Files),
            other => Err(FsalError::UnknownLayoutType(other)),
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// A byte range of a file under one I/O mode. A length of `u64::MAX`
/// extends to the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub io_mode: IoMode,
    pub offset: u64,
    pub length: u64,
}

impl Segment {
    pub fn new(io_mode: IoMode, offset: u64, length: u64) -> Self {
        Self {
            io_mode,
            offset,
            length,
        }
    }

    pub fn whole_file(io_mode: IoMode) -> Self {
        Self::new(io_mode, 0, u64::MAX)
    }

    pub fn is_whole_file(&self) -> bool {
        self.offset == 0 && self.length == u64::MAX
    }

    /// Exclusive end offset, `u64::MAX` standing for unbounded.
    pub fn end(&self) -> u64 {
        if self.length == u64::MAX {
            u64::MAX
        } else {
            self.offset.saturating_add(self.length)
        }
    }

    /// Whether the two ranges share at least one byte. Empty segments
    /// overlap nothing.
    pub fn overlaps(&self, other: &Segment) -> bool {
        if self.length == 0 || other.length == 0 {
            return false;
        }
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Device ids are never stored: the serial is the inode number, so the
/// device address list can be rebuilt from the id alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceId {
    pub export_id: u16,
    pub device_serial: u64,
}

impl DeviceId {
    pub fn to_bytes(&self) -> [u8; DEVICE_ID_LEN] {
        let mut out = [0u8; DEVICE_ID_LEN];
        out[0] = DEVICE_ID_TAG;
        out[2..4].copy_from_slice(&self.export_id.to_be_bytes());
        out[8..16].copy_from_slice(&self.device_serial.to_be_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != DEVICE_ID_LEN || raw[0] != DEVICE_ID_TAG {
            return Err(FsalError::BadHandle { len: raw.len() });
        }
        let mut serial = [0u8; 8];
        serial.copy_from_slice(&raw[8..16]);
        Ok(Self {
            export_id: u16::from_be_bytes([raw[2], raw[3]]),
            device_serial: u64::from_be_bytes(serial),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LayoutGetArgs {
    pub layout_type: u32,
    /// Range and mode the client asked for.
    pub segment: Segment,
    /// Shortest length starting at `segment.offset` the client will accept.
    pub min_length: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayoutGetResult {
    pub segment: Segment,
    pub device_id: DeviceId,
    /// XDR `nfsv4_1_file_layout4`.
    #[serde(skip)]
    pub body: Vec<u8>,
    pub return_on_close: bool,
    pub last_segment: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LayoutReturnArgs {
    pub layout_type: u32,
    pub segment: Segment,
    /// Whether the client is giving up the whole layout for this mode.
    pub dispose: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LayoutCommitArgs {
    pub layout_type: u32,
    pub segment: Segment,
    /// Offset of the last byte the client wrote, if it reports one.
    pub last_write: Option<u64>,
    pub new_time: Option<NfsTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LayoutCommitResult {
    pub size_supplied: bool,
    pub new_size: u64,
    pub commit_done: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceList {
    pub devices: Vec<DeviceId>,
    pub cookie: u64,
    pub eof: bool,
}
