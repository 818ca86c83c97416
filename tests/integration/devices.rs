use fsal::backend::memory::{ClusterConfig, Fault};
use fsal::backend::{Backend, IoMode, VInode};
use fsal::config::PnfsConfig;
use fsal::error::BackendError;
use fsal::pnfs::device::decode_device_addr;
use fsal::pnfs::{DeviceId, BIGGEST_PATTERN};
use fsal::{FsalError, NfsStatus};

use crate::helpers::{whole, TestExport, FILES};

/// Test 1: The device address lists one node index per stripe and one
/// address per storage node.
#[test]
fn test_device_info_matches_cluster() {
    let t = TestExport::new();
    let file = t.file("/f", b"");
    let grant = file.layoutget(&whole(IoMode::Read)).unwrap();

    let body = t.export.getdeviceinfo(FILES, &grant.device_id).unwrap();
    assert!(body.len() <= t.export.da_addr_size());
    let addr = decode_device_addr(&body).unwrap();

    assert_eq!(addr.stripe_indices.len(), BIGGEST_PATTERN as usize);
    let vino = VInode::new(file.vino().ino, 0);
    let layout = t.cluster.file_layout(vino).unwrap();
    for (stripe, node) in addr.stripe_indices.iter().enumerate() {
        let owner = t.cluster.stripe_owner(vino, stripe as u64, &layout).unwrap();
        assert_eq!(*node, owner, "stripe {}", stripe);
    }

    let nodes = &t.cluster.config().nodes;
    assert_eq!(addr.multipath.len(), nodes.len());
    for (list, expected) in addr.multipath.iter().zip(nodes) {
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].netid, "tcp");
        assert_eq!(list[0].socket_addr(), Some(*expected));
    }
    for node in 0..nodes.len() as u32 {
        assert!(addr.stripe_indices.contains(&node), "node {} unused", node);
    }
}

/// Test 2: Device info is recomputed, not stored, and is the same every time.
#[test]
fn test_device_info_is_deterministic() {
    let t = TestExport::new();
    let file = t.file("/f", b"");
    let id = DeviceId {
        export_id: t.export.id(),
        device_serial: file.vino().ino,
    };
    let first = t.export.getdeviceinfo(FILES, &id).unwrap();
    drop(file);
    let second = t.export.getdeviceinfo(FILES, &id).unwrap();
    assert_eq!(first, second);

    let other = t.file("/g", b"");
    let id2 = DeviceId {
        export_id: t.export.id(),
        device_serial: other.vino().ino,
    };
    let third = t.export.getdeviceinfo(FILES, &id2).unwrap();
    assert_ne!(
        decode_device_addr(&first).unwrap().stripe_indices,
        decode_device_addr(&third).unwrap().stripe_indices
    );
}

/// Test 3: A single-node cluster maps every stripe to node 0.
#[test]
fn test_single_node_cluster() {
    let t = TestExport::with_cluster(ClusterConfig::with_nodes(1));
    let file = t.file("/f", b"");
    let grant = file.layoutget(&whole(IoMode::Read)).unwrap();
    let addr = decode_device_addr(&t.export.getdeviceinfo(FILES, &grant.device_id).unwrap()).unwrap();
    assert!(addr.stripe_indices.iter().all(|&n| n == 0));
    assert_eq!(addr.multipath.len(), 1);
}

/// Test 4: Backend lookup failures are reported as server faults.
#[test]
fn test_lookup_failures_are_server_faults() {
    let t = TestExport::new();
    let file = t.file("/f", b"");
    let id = DeviceId {
        export_id: t.export.id(),
        device_serial: file.vino().ino,
    };
    for fault in [Fault::FileLayout, Fault::StripeOwner, Fault::NodeAddr] {
        t.cluster.inject(fault, BackendError::Io { errno: 5 });
        let err = t.export.getdeviceinfo(FILES, &id).unwrap_err();
        assert!(matches!(err, FsalError::ServerFault(_)), "{:?}", fault);
        assert_eq!(err.status(), NfsStatus::Serverfault);
        t.cluster.clear(fault);
    }

    let missing = DeviceId {
        export_id: t.export.id(),
        device_serial: 424_242,
    };
    assert_eq!(
        t.export.getdeviceinfo(FILES, &missing).unwrap_err().status(),
        NfsStatus::Serverfault
    );
}

/// Test 5: A reply buffer too small for the address body fails TOOSMALL.
#[test]
fn test_small_reply_buffer() {
    let pnfs = PnfsConfig {
        da_addr_size: 512,
        ..PnfsConfig::default()
    };
    let t = TestExport::with(ClusterConfig::default(), pnfs);
    let file = t.file("/f", b"");
    let id = DeviceId {
        export_id: t.export.id(),
        device_serial: file.vino().ino,
    };
    let err = t.export.getdeviceinfo(FILES, &id).unwrap_err();
    assert!(matches!(err, FsalError::TooSmall { .. }));
    assert_eq!(err.status(), NfsStatus::Toosmall);
}

/// Test 6: Only the files layout type has devices.
#[test]
fn test_device_info_checks_layout_type() {
    let t = TestExport::new();
    let id = DeviceId {
        export_id: t.export.id(),
        device_serial: 1,
    };
    assert!(matches!(
        t.export.getdeviceinfo(5, &id),
        Err(FsalError::UnknownLayoutType(5))
    ));
}

/// Test 7: A device id minted by another export is refused.
#[test]
fn test_device_id_from_other_export() {
    let t = TestExport::new();
    let file = t.file("/f", b"");
    let grant = file.layoutget(&whole(IoMode::Read)).unwrap();
    let foreign = DeviceId {
        export_id: t.export.id() + 1,
        ..grant.device_id
    };
    let err = t.export.getdeviceinfo(FILES, &foreign).unwrap_err();
    assert!(matches!(err, FsalError::BadHandle { .. }));
    assert_eq!(err.status(), NfsStatus::Badhandle);
    assert!(t.export.getdeviceinfo(FILES, &grant.device_id).is_ok());
}
