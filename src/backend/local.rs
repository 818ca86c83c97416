//! A backend serving a directory of the local filesystem.
//!
//! Inodes are the real inode numbers from `lstat()`. A path table maps them
//! back to paths so that wire handles can be turned into references again.
//! This backend has no striping and offers no layouts.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use super::passthrough::{lstat, set_mtime, stat_to_attrs};
use super::{
    AttrUpdate, Attrs, Backend, Connector, DirEntry, Inode, ReadResult, Stability, VInode,
};
use crate::config::{BackendKind, MountParams};
use crate::error::{BackendError, BackendResult};
use crate::wire::NO_SNAPSHOT;

/// Two-way map between inode numbers and paths relative to the export root.
struct PathTable {
    by_ino: DashMap<u64, PathBuf>,
    by_path: DashMap<PathBuf, u64>,
}

impl PathTable {
    fn new() -> Self {
        Self {
            by_ino: DashMap::new(),
            by_path: DashMap::new(),
        }
    }

    /// Record that `rel` currently names `ino`, dropping stale entries on
    /// either side.
    fn record(&self, ino: u64, rel: PathBuf) {
        if let Some((_, old)) = self.by_ino.remove(&ino) {
            self.by_path.remove(&old);
        }
        if let Some((_, previous)) = self.by_path.remove(&rel) {
            if previous != ino {
                self.by_ino.remove(&previous);
            }
        }
        self.by_ino.insert(ino, rel.clone());
        self.by_path.insert(rel, ino);
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.by_ino.get(&ino).map(|r| r.value().clone())
    }

    fn forget(&self, rel: &Path) {
        if let Some((_, ino)) = self.by_path.remove(rel) {
            self.by_ino.remove(&ino);
        }
    }
}

pub struct LocalVfs {
    root: PathBuf,
    fsid: i64,
    paths: PathTable,
    refs: DashMap<u64, u32>,
}

impl LocalVfs {
    pub fn open(root: impl Into<PathBuf>) -> BackendResult<Self> {
        let root: PathBuf = root.into();
        let root = fs::canonicalize(&root)?;
        let st = lstat(&root)?;
        let attrs = stat_to_attrs(&st);
        if attrs.kind != super::FileKind::Directory {
            return Err(BackendError::NotDir);
        }
        let paths = PathTable::new();
        paths.record(attrs.fileid, PathBuf::new());
        Ok(Self {
            root,
            fsid: st.st_dev as i64,
            paths,
            refs: DashMap::new(),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Number of references currently held on `ino`.
    pub fn refs(&self, ino: u64) -> u32 {
        self.refs.get(&ino).map(|r| *r).unwrap_or(0)
    }

    fn backing_path(&self, inode: &Inode) -> BackendResult<PathBuf> {
        let rel = self.paths.path_of(inode.ino()).ok_or(BackendError::Stale)?;
        Ok(self.root.join(rel))
    }

    fn child_rel(&self, dir: &Inode, name: &str) -> BackendResult<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(BackendError::Invalid);
        }
        let parent = self.paths.path_of(dir.ino()).ok_or(BackendError::Stale)?;
        Ok(parent.join(name))
    }

    /// Stat a relative path, register it and take a reference.
    fn register(&self, rel: &Path) -> BackendResult<(Inode, Attrs)> {
        let st = lstat(&self.root.join(rel))?;
        let attrs = stat_to_attrs(&st);
        self.paths.record(attrs.fileid, rel.to_path_buf());
        Ok((self.take_ref(attrs.fileid), attrs))
    }

    fn take_ref(&self, ino: u64) -> Inode {
        *self.refs.entry(ino).or_insert(0) += 1;
        Inode::new(VInode::new(ino, NO_SNAPSHOT))
    }
}

impl Backend for LocalVfs {
    fn fsid(&self) -> i64 {
        self.fsid
    }

    fn root(&self) -> BackendResult<(Inode, Attrs)> {
        self.register(Path::new(""))
    }

    fn get_inode(&self, vino: VInode) -> BackendResult<(Inode, Attrs)> {
        let rel = self.paths.path_of(vino.ino).ok_or(BackendError::Stale)?;
        let (inode, attrs) = self.register(&rel)?;
        if attrs.fileid != vino.ino {
            // The path now names a different object.
            self.put(inode);
            return Err(BackendError::Stale);
        }
        Ok((inode, attrs))
    }

    fn lookup(&self, dir: &Inode, name: &str) -> BackendResult<(Inode, Attrs)> {
        let rel = self.child_rel(dir, name)?;
        debug!("local lookup {}", rel.display());
        self.register(&rel)
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
        let st = lstat(&self.backing_path(inode)?)?;
        Ok(stat_to_attrs(&st))
    }

    fn setattr(&self, inode: &Inode, update: &AttrUpdate) -> BackendResult<Attrs> {
        let path = self.backing_path(inode)?;
        if let Some(size) = update.size {
            OpenOptions::new().write(true).open(&path)?.set_len(size)?;
        }
        if let Some(mode) = update.mode {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        if let Some(mtime) = update.mtime {
            set_mtime(&path, mtime)?;
        }
        self.getattr(inode)
    }

    fn create(&self, dir: &Inode, name: &str, mode: u32) -> BackendResult<(Inode, Attrs)> {
        let rel = self.child_rel(dir, name)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(self.root.join(&rel))?;
        self.register(&rel)
    }

    fn mkdir(&self, dir: &Inode, name: &str, mode: u32) -> BackendResult<(Inode, Attrs)> {
        let rel = self.child_rel(dir, name)?;
        fs::DirBuilder::new()
            .mode(mode & 0o7777)
            .create(self.root.join(&rel))?;
        self.register(&rel)
    }

    fn symlink(&self, dir: &Inode, name: &str, target: &str) -> BackendResult<(Inode, Attrs)> {
        let rel = self.child_rel(dir, name)?;
        std::os::unix::fs::symlink(target, self.root.join(&rel))?;
        self.register(&rel)
    }

    fn readlink(&self, inode: &Inode) -> BackendResult<String> {
        let target = fs::read_link(self.backing_path(inode)?)?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn unlink(&self, dir: &Inode, name: &str) -> BackendResult<()> {
        let rel = self.child_rel(dir, name)?;
        let full = self.root.join(&rel);
        let attrs = stat_to_attrs(&lstat(&full)?);
        if attrs.kind == super::FileKind::Directory {
            fs::remove_dir(&full)?;
        } else {
            fs::remove_file(&full)?;
        }
        self.paths.forget(&rel);
        Ok(())
    }

    fn readdir(&self, dir: &Inode) -> BackendResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.backing_path(dir)?)? {
            let entry = entry?;
            let st = lstat(&entry.path())?;
            let attrs = stat_to_attrs(&st);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                ino: attrs.fileid,
                kind: attrs.kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> BackendResult<ReadResult> {
        let path = self.backing_path(inode)?;
        let file = fs::File::open(&path)?;
        let size = file.metadata()?.len();
        let len = file.read_at(buf, offset)?;
        Ok(ReadResult {
            len,
            eof: offset + len as u64 >= size,
        })
    }

    fn write(
        &self,
        inode: &Inode,
        offset: u64,
        data: &[u8],
        stability: Stability,
    ) -> BackendResult<(usize, Stability)> {
        let path = self.backing_path(inode)?;
        let file = OpenOptions::new().write(true).open(&path)?;
        file.write_all_at(data, offset)?;
        match stability {
            Stability::Unstable => {}
            Stability::DataSync => file.sync_data()?,
            Stability::FileSync => file.sync_all()?,
        }
        Ok((data.len(), stability))
    }
}

/// Opens [`LocalVfs`] backends for `BackendKind::Local` parameters.
#[derive(Default)]
pub struct LocalConnector;

impl Connector for LocalConnector {
    fn connect(&self, params: &MountParams) -> BackendResult<Arc<dyn Backend>> {
        if params.backend != BackendKind::Local {
            return Err(BackendError::Connect(format!(
                "local connector cannot open {:?} backends",
                params.backend
            )));
        }
        let vfs = LocalVfs::open(&params.target)
            .map_err(|e| BackendError::Connect(format!("{}: {}", params.target, e)))?;
        Ok(Arc::new(vfs))
    }
}
