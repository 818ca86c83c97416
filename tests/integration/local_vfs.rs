use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use fsal::backend::local::{LocalConnector, LocalVfs};
use fsal::backend::{AttrUpdate, Backend, Connector, FileKind, IoMode, NfsTime, Stability};
use fsal::config::{ExportConfig, MountParams};
use fsal::error::BackendResult;
use fsal::{Export, MountRegistry, NfsStatus, OpenState, WireKey};

use crate::helpers::{export_config, whole};

/// Hands out one pre-opened directory backend so tests can inspect it.
struct SharedVfs(Arc<LocalVfs>);

impl Connector for SharedVfs {
    fn connect(&self, _params: &MountParams) -> BackendResult<Arc<dyn Backend>> {
        Ok(self.0.clone())
    }
}

fn setup() -> (TempDir, Arc<LocalVfs>, Arc<MountRegistry>) {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("share/sub")).unwrap();
    fs::write(dir.path().join("share/sub/hello.txt"), b"hello world").unwrap();
    let vfs = Arc::new(LocalVfs::open(dir.path()).unwrap());
    let registry = Arc::new(MountRegistry::new(Arc::new(SharedVfs(vfs.clone()))));
    (dir, vfs, registry)
}

fn local_config(root: &Path, id: u16) -> ExportConfig {
    export_config(id, MountParams::local(root.to_string_lossy()))
}

/// Test 1: Paths resolve to the real files under the exported directory.
#[test]
fn test_lookup_real_files() {
    let (dir, vfs, registry) = setup();
    assert_eq!(vfs.root_path(), fs::canonicalize(dir.path()).unwrap());
    let export = Export::create(&registry, &local_config(dir.path(), 1), None).unwrap();

    let h = export.lookup_path("/share/sub/hello.txt").unwrap();
    assert_eq!(h.kind(), FileKind::Regular);
    let attrs = h.getattr().unwrap();
    assert_eq!(attrs.size, 11);

    let meta = fs::metadata(dir.path().join("share/sub/hello.txt")).unwrap();
    use std::os::unix::fs::MetadataExt;
    assert_eq!(h.vino().ino, meta.ino());
    assert_eq!(h.handle_to_key().filesystem_id, meta.dev() as i64);
}

/// Test 2: A sub-path export is rooted at that directory.
#[test]
fn test_sub_path_export() {
    let (dir, _vfs, registry) = setup();
    let config = ExportConfig {
        sub_path: "/share".into(),
        ..local_config(dir.path(), 2)
    };
    let export = Export::create(&registry, &config, None).unwrap();
    assert_eq!(export.root().kind(), FileKind::Directory);
    let h = export.lookup_path("/sub/hello.txt").unwrap();
    assert_eq!(h.getattr().unwrap().size, 11);
    assert!(export.lookup_path("/share").unwrap().is_root());
}

/// Test 3: Files created through the export exist on disk and round-trip data.
#[test]
fn test_create_write_read() {
    let (dir, _vfs, registry) = setup();
    let export = Export::create(&registry, &local_config(dir.path(), 1), None).unwrap();
    let share = export.lookup_path("/share").unwrap();

    let file = share.create("new.bin", 0o640).unwrap();
    file.open(OpenState::ReadWrite).unwrap();
    let (n, stable) = file.write(0, b"0123456789", Stability::FileSync).unwrap();
    assert_eq!((n, stable), (10, Stability::FileSync));
    assert_eq!(fs::read(dir.path().join("share/new.bin")).unwrap(), b"0123456789");

    let mut buf = [0u8; 32];
    let r = file.read(4, &mut buf).unwrap();
    assert_eq!(&buf[..r.len], b"456789");
    assert!(r.eof);

    let sub = share.mkdir("made", 0o755).unwrap();
    assert!(dir.path().join("share/made").is_dir());
    let link = sub.symlink("to-new", "../new.bin").unwrap();
    assert_eq!(link.readlink().unwrap(), "../new.bin");

    let names: Vec<_> = share.readdir().unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["made", "new.bin", "sub"]);

    sub.unlink("to-new").unwrap();
    share.unlink("made").unwrap();
    assert!(!dir.path().join("share/made").exists());
}

/// Test 4: setattr truncates and sets mtime on the backing file.
#[test]
fn test_setattr_on_disk() {
    let (dir, _vfs, registry) = setup();
    let export = Export::create(&registry, &local_config(dir.path(), 1), None).unwrap();
    let h = export.lookup_path("/share/sub/hello.txt").unwrap();
    let when = NfsTime::new(1_500_000_000, 250);
    let attrs = h
        .setattr(&AttrUpdate {
            size: Some(5),
            mode: Some(0o600),
            mtime: Some(when),
        })
        .unwrap();
    assert_eq!(attrs.size, 5);
    assert_eq!(attrs.mtime, when);
    assert_eq!(attrs.mode, 0o600);
    assert_eq!(fs::read(dir.path().join("share/sub/hello.txt")).unwrap(), b"hello");
}

/// Test 5: Every handle returns its reference, and the wire form resolves
/// back to the same file.
#[test]
fn test_references_balance() {
    let (dir, vfs, registry) = setup();
    let export = Export::create(&registry, &local_config(dir.path(), 1), None).unwrap();
    let root_ino = export.root().vino().ino;
    assert_eq!(vfs.refs(root_ino), 1);

    let (ino, key) = {
        let h = export.lookup_path("/share/sub/hello.txt").unwrap();
        let ino = h.vino().ino;
        assert_eq!(vfs.refs(ino), 1);
        let key = h.handle_to_key();
        let again = export.create_handle(&key.to_bytes()).unwrap();
        assert_eq!(vfs.refs(ino), 2);
        assert_eq!(again.getattr().unwrap().size, 11);
        (ino, key)
    };
    assert_eq!(vfs.refs(ino), 0);

    // Once the file is replaced, its old handle is stale.
    fs::remove_file(dir.path().join("share/sub/hello.txt")).unwrap();
    fs::write(dir.path().join("share/sub/hello.txt"), b"replacement!").unwrap();
    let fresh = export.lookup_path("/share/sub/hello.txt").unwrap();
    if fresh.vino().ino != key.inode {
        let err = export.create_handle(&WireKey::new(ino, 0, key.filesystem_id).to_bytes());
        assert_eq!(err.err().unwrap().status(), NfsStatus::Stale);
    }
    drop(fresh);

    export.destroy();
    assert_eq!(vfs.refs(root_ino), 0);
    assert!(registry.is_empty());
}

/// Test 6: Directory backends have no layouts.
#[test]
fn test_layouts_unavailable() {
    let (dir, _vfs, registry) = setup();
    let export = Export::create(&registry, &local_config(dir.path(), 1), None).unwrap();
    let h = export.lookup_path("/share/sub/hello.txt").unwrap();
    let err = h.layoutget(&whole(IoMode::Read)).unwrap_err();
    assert_eq!(err.status(), NfsStatus::LayoutUnavailable);
}

/// Test 7: The stock connector opens real directories and refuses the rest.
#[test]
fn test_local_connector() {
    let dir = TempDir::new().unwrap();
    let connector = LocalConnector;
    let backend = connector
        .connect(&MountParams::local(dir.path().to_string_lossy()))
        .unwrap();
    assert!(!backend.supports_pnfs());
    assert!(connector.connect(&MountParams::cluster("c")).is_err());
    assert!(connector
        .connect(&MountParams::local(dir.path().join("missing").to_string_lossy()))
        .is_err());

    // A missing sub-path leaves nothing registered.
    let registry = Arc::new(MountRegistry::new(Arc::new(LocalConnector)));
    let config = ExportConfig {
        sub_path: "/nope".into(),
        ..local_config(dir.path(), 1)
    };
    assert!(Export::create(&registry, &config, None).is_err());
    assert!(registry.is_empty());
}
