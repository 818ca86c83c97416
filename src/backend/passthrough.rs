/// Passthrough helpers for the local VFS backend.
/// These convert between system types and backend types.
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::{Attrs, FileKind, NfsTime};

/// Convert libc::stat to backend attributes.
pub fn stat_to_attrs(st: &libc::stat) -> Attrs {
    Attrs {
        fileid: st.st_ino as u64,
        kind: mode_to_kind(st.st_mode as u32),
        mode: st.st_mode as u32 & 0o7777,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        size: st.st_size as u64,
        atime: time_from_parts(st.st_atime, st.st_atime_nsec),
        mtime: time_from_parts(st.st_mtime, st.st_mtime_nsec),
        ctime: time_from_parts(st.st_ctime, st.st_ctime_nsec),
    }
}

fn time_from_parts(sec: i64, nsec: i64) -> NfsTime {
    if sec >= 0 {
        NfsTime::new(sec, nsec as u32)
    } else {
        NfsTime::default()
    }
}

pub fn mode_to_kind(mode: u32) -> FileKind {
    let fmt = mode & (libc::S_IFMT as u32);
    match fmt {
        x if x == libc::S_IFREG as u32 => FileKind::Regular,
        x if x == libc::S_IFDIR as u32 => FileKind::Directory,
        x if x == libc::S_IFLNK as u32 => FileKind::Symlink,
        _ => FileKind::Other,
    }
}

/// Perform lstat() on a path.
pub fn lstat(path: &Path) -> std::io::Result<libc::stat> {
    let c_path = path_to_cstring(path)?;
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        if libc::lstat(c_path.as_ptr(), &mut st) == 0 {
            Ok(st)
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

/// Set the modification time of a path, leaving atime alone.
pub fn set_mtime(path: &Path, mtime: NfsTime) -> std::io::Result<()> {
    let c_path = path_to_cstring(path)?;
    let times = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        libc::timespec {
            tv_sec: mtime.seconds as libc::time_t,
            tv_nsec: mtime.nseconds as libc::c_long,
        },
    ];
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn path_to_cstring(path: &Path) -> std::io::Result<std::ffi::CString> {
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains null byte"))
}
