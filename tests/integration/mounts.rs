use std::sync::Arc;

use rand::Rng;

use fsal::backend::memory::{ClusterConfig, ClusterConnector};
use fsal::backend::Connector;
use fsal::config::{ExportConfig, MountParams};
use fsal::{Export, FsalError, MountRegistry, NfsStatus};

use crate::helpers::{cluster_registry, export_config};

/// Test 1: Two exports with the same parameters share one connection.
#[test]
fn test_exports_share_one_mount() {
    let (connector, registry) = cluster_registry(ClusterConfig::default());
    let params = MountParams::cluster("c1");

    let a = Export::create(&registry, &export_config(1, params.clone()), None).unwrap();
    let b = Export::create(&registry, &export_config(2, params.clone()), None).unwrap();
    assert_eq!(connector.connects(), 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.refs(&params), 2);
    assert!(Arc::ptr_eq(a.mount(), b.mount()));
    assert_eq!(a.mount().owning_exports(), vec![1, 2]);

    a.destroy();
    assert_eq!(connector.disconnects(), 0);
    assert_eq!(registry.refs(&params), 1);
    assert_eq!(b.mount().owning_exports(), vec![2]);

    b.destroy();
    assert_eq!(connector.disconnects(), 1);
    assert!(registry.is_empty());
}

/// Test 2: Destroying an export returns every backend reference it held.
#[test]
fn test_destroy_releases_root_before_mount() {
    let (connector, registry) = cluster_registry(ClusterConfig::default());
    let export = Export::create(&registry, &export_config(1, MountParams::cluster("c")), None).unwrap();
    let cluster = connector.latest().unwrap();
    assert_eq!(cluster.outstanding_refs(), 1);
    export.destroy();
    assert_eq!(cluster.outstanding_refs(), 0);
    assert!(cluster.is_disconnected());
}

/// Test 3: Distinct parameters get distinct connections.
#[test]
fn test_distinct_params_get_distinct_mounts() {
    let (connector, registry) = cluster_registry(ClusterConfig::default());
    let mut admin = MountParams::cluster("c");
    admin.user_id = Some("admin".into());
    let a = Export::create(&registry, &export_config(1, MountParams::cluster("c")), None).unwrap();
    let b = Export::create(&registry, &export_config(2, admin), None).unwrap();
    assert_eq!(connector.connects(), 2);
    assert_eq!(registry.len(), 2);
    assert!(!Arc::ptr_eq(a.mount(), b.mount()));
}

/// Test 4: A refused connection surfaces as a backend init failure and
/// leaves nothing registered.
#[test]
fn test_connect_failure_is_backend_init() {
    let (connector, registry) = cluster_registry(ClusterConfig::default());
    connector.refuse(Some("monitor unreachable"));
    let err = Export::create(&registry, &export_config(1, MountParams::cluster("c")), None)
        .err()
        .unwrap();
    assert!(matches!(err, FsalError::BackendInit(_)));
    assert_eq!(err.status(), NfsStatus::Serverfault);
    assert!(registry.is_empty());

    connector.refuse(None);
    assert!(Export::create(&registry, &export_config(1, MountParams::cluster("c")), None).is_ok());
}

/// Test 5: A sub-path that does not resolve gives the mount reference back.
#[test]
fn test_bad_sub_path_releases_mount() {
    let (connector, registry) = cluster_registry(ClusterConfig::default());
    let config = ExportConfig {
        sub_path: "/no/such/dir".into(),
        ..export_config(1, MountParams::cluster("c"))
    };
    let err = Export::create(&registry, &config, None).err().unwrap();
    assert_eq!(err.status(), NfsStatus::Noent);
    assert!(registry.is_empty());
    assert_eq!(connector.connects(), 1);
    assert_eq!(connector.disconnects(), 1);
    assert_eq!(connector.latest().unwrap().outstanding_refs(), 0);
}

/// Test 6: A failed sub-path on a shared mount only drops its own reference.
#[test]
fn test_bad_sub_path_on_shared_mount_keeps_others() {
    let (connector, registry) = cluster_registry(ClusterConfig::default());
    let params = MountParams::cluster("c");
    let good = Export::create(&registry, &export_config(1, params.clone()), None).unwrap();
    let config = ExportConfig {
        sub_path: "/missing".into(),
        ..export_config(2, params.clone())
    };
    assert!(Export::create(&registry, &config, None).is_err());
    assert_eq!(registry.refs(&params), 1);
    assert_eq!(connector.disconnects(), 0);
    assert_eq!(good.mount().owning_exports(), vec![1]);
}

/// Test 7: Random acquire/release sequences open and close the connection
/// exactly once per busy period.
#[test]
fn test_random_acquire_release_sequences() {
    let connector = Arc::new(ClusterConnector::default());
    let registry = MountRegistry::new(connector.clone() as Arc<dyn Connector>);
    let params = MountParams::cluster("shared");
    let mut rng = rand::thread_rng();
    let mut held = Vec::new();
    let mut busy_periods = 0;

    for _ in 0..2000 {
        if held.is_empty() || rng.gen_bool(0.55) {
            if held.is_empty() {
                busy_periods += 1;
            }
            held.push(registry.acquire(&params).unwrap());
        } else {
            let idx = rng.gen_range(0..held.len());
            registry.release(held.swap_remove(idx));
        }
        assert_eq!(registry.refs(&params) as usize, held.len());
        assert_eq!(connector.connects(), busy_periods);
        let closed = if held.is_empty() { busy_periods } else { busy_periods - 1 };
        assert_eq!(connector.disconnects(), closed);
    }
    for m in held.drain(..) {
        registry.release(m);
    }
    assert_eq!(connector.disconnects(), connector.connects());
}

/// Test 8: Concurrent acquires while the mount is held never reconnect.
#[test]
fn test_concurrent_acquire_connects_once() {
    let (connector, registry) = cluster_registry(ClusterConfig::default());
    let params = MountParams::cluster("c");
    let anchor = registry.acquire(&params).unwrap();
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..100 {
                    let m = registry.acquire(&params).unwrap();
                    registry.release(m);
                }
            });
        }
    });
    assert_eq!(connector.connects(), 1);
    assert_eq!(registry.refs(&params), 1);
    registry.release(anchor);
    assert_eq!(connector.disconnects(), 1);
}
