//! GETDEVICEINFO: the `nfsv4_1_file_layout_ds_addr4` for a device id.
//!
//! Nothing is stored per device. The id carries the inode, and the stripe
//! map and node addresses are recomputed from the backend on every call.

use std::net::{IpAddr, SocketAddr};

use serde::Serialize;
use tracing::error;

use super::stripe::owning_node;
use super::xdr::{XdrReader, XdrWriter};
use super::{DeviceId, LayoutType, BIGGEST_PATTERN, DEVICE_ID_LEN};
use crate::backend::VInode;
use crate::error::{FsalError, Result};
use crate::export::Export;
use crate::wire::NO_SNAPSHOT;

/// One `netaddr4`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetAddr {
    pub netid: String,
    pub uaddr: String,
}

impl NetAddr {
    pub fn from_socket(addr: SocketAddr) -> Self {
        let port = addr.port();
        let (netid, host) = match addr.ip() {
            IpAddr::V4(ip) => ("tcp", ip.to_string()),
            IpAddr::V6(ip) => ("tcp6", ip.to_string()),
        };
        Self {
            netid: netid.to_string(),
            uaddr: format!("{}.{}.{}", host, port >> 8, port & 0xff),
        }
    }

    /// Parse the universal address back into a socket address.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let mut parts = self.uaddr.rsplitn(3, '.');
        let lo: u16 = parts.next()?.parse().ok()?;
        let hi: u16 = parts.next()?.parse().ok()?;
        let ip: IpAddr = parts.next()?.parse().ok()?;
        Some(SocketAddr::new(ip, (hi << 8) | lo))
    }
}

/// Decoded device address body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAddr {
    pub stripe_indices: Vec<u32>,
    pub multipath: Vec<Vec<NetAddr>>,
}

pub fn decode_device_addr(body: &[u8]) -> Result<DeviceAddr> {
    let mut r = XdrReader::new(body);
    let stripes = r.get_u32()? as usize;
    let mut stripe_indices = Vec::with_capacity(stripes.min(BIGGEST_PATTERN as usize));
    for _ in 0..stripes {
        stripe_indices.push(r.get_u32()?);
    }
    let lists = r.get_u32()? as usize;
    let mut multipath = Vec::with_capacity(lists.min(256));
    for _ in 0..lists {
        let members = r.get_u32()? as usize;
        let mut list = Vec::with_capacity(members.min(16));
        for _ in 0..members {
            let netid = r.get_string()?;
            let uaddr = r.get_string()?;
            list.push(NetAddr { netid, uaddr });
        }
        multipath.push(list);
    }
    Ok(DeviceAddr {
        stripe_indices,
        multipath,
    })
}

impl Export {
    pub fn getdeviceinfo(&self, layout_type: u32, device_id: &DeviceId) -> Result<Vec<u8>> {
        LayoutType::from_wire(layout_type).map_err(|e| {
            error!("unsupported layout type: {:#x}", layout_type);
            e
        })?;
        if device_id.export_id != self.id() {
            error!(
                "device id of export {} presented to export {}",
                device_id.export_id,
                self.id()
            );
            return Err(FsalError::BadHandle { len: DEVICE_ID_LEN });
        }
        let backend = self.backend();
        let vino = VInode::new(device_id.device_serial, NO_SNAPSHOT);
        let layout = backend.file_layout(vino).map_err(|e| {
            error!("failed to get layout for inode {}: {}", vino.ino, e);
            FsalError::ServerFault(format!("no layout for inode {}", vino.ino))
        })?;

        let mut w = XdrWriter::with_limit(self.da_addr_size());

        // The pattern never repeats, so there is one index per stripe.
        w.put_u32(BIGGEST_PATTERN)?;
        for stripe in 0..BIGGEST_PATTERN as u64 {
            let node = owning_node(&**backend, vino, stripe, &layout).map_err(|e| {
                error!(
                    "failed to retrieve node for stripe {} of inode {}: {}",
                    stripe, vino.ino, e
                );
                FsalError::ServerFault(format!("no owner for stripe {}", stripe))
            })?;
            w.put_u32(node)?;
        }

        // Index i of the stripe map is node i, one address per list.
        let nodes = backend.node_count();
        w.put_u32(nodes)?;
        for node in 0..nodes {
            let addr = backend.node_addr(node).map_err(|e| {
                error!("unable to get address of node {}: {}", node, e);
                FsalError::ServerFault(format!("no address for node {}", node))
            })?;
            let netaddr = NetAddr::from_socket(addr);
            w.put_u32(1)?;
            w.put_string(&netaddr.netid)?;
            w.put_string(&netaddr.uaddr)?;
        }
        Ok(w.into_bytes())
    }
}
