use std::fmt;

use thiserror::Error;

/// NFSv4.1 status codes surfaced by this layer (RFC 5661 values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NfsStatus {
    Ok = 0,
    Perm = 1,
    Noent = 2,
    Io = 5,
    Access = 13,
    Exist = 17,
    Notdir = 20,
    Isdir = 21,
    Inval = 22,
    Nospc = 28,
    Notempty = 66,
    Stale = 70,
    Badhandle = 10001,
    Notsupp = 10004,
    Toosmall = 10005,
    Serverfault = 10006,
    Delay = 10008,
    Openmode = 10038,
    Badlayout = 10050,
    LayoutUnavailable = 10059,
    NoMatchingLayout = 10060,
    UnknownLayoutType = 10062,
    PnfsIoHole = 10069,
}

impl NfsStatus {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for NfsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Failures reported by a storage backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("no such object")]
    NotFound,

    #[error("object exists")]
    Exists,

    #[error("not a directory")]
    NotDir,

    #[error("is a directory")]
    IsDir,

    #[error("directory not empty")]
    NotEmpty,

    #[error("stale backend reference")]
    Stale,

    #[error("permission denied")]
    Access,

    #[error("no space left on backend")]
    NoSpace,

    #[error("invalid argument")]
    Invalid,

    #[error("backend busy")]
    Busy,

    #[error("operation not supported by backend")]
    NotSupported,

    #[error("I/O error (errno {errno})")]
    Io { errno: i32 },

    #[error("connection failed: {0}")]
    Connect(String),
}

impl BackendError {
    /// Translate a raw errno value (either sign) into a backend error.
    pub fn from_errno(errno: i32) -> Self {
        match errno.abs() {
            libc::ENOENT => Self::NotFound,
            libc::EEXIST => Self::Exists,
            libc::ENOTDIR => Self::NotDir,
            libc::EISDIR => Self::IsDir,
            libc::ENOTEMPTY => Self::NotEmpty,
            libc::ESTALE => Self::Stale,
            libc::EACCES | libc::EPERM => Self::Access,
            libc::ENOSPC | libc::EDQUOT => Self::NoSpace,
            libc::EINVAL | libc::ENAMETOOLONG => Self::Invalid,
            libc::EBUSY | libc::EAGAIN => Self::Busy,
            libc::ENOTSUP | libc::ENOSYS => Self::NotSupported,
            e => Self::Io { errno: e },
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Self::from_errno(errno),
            None => match e.kind() {
                std::io::ErrorKind::NotFound => Self::NotFound,
                std::io::ErrorKind::AlreadyExists => Self::Exists,
                std::io::ErrorKind::PermissionDenied => Self::Access,
                std::io::ErrorKind::InvalidInput => Self::Invalid,
                _ => Self::Io { errno: libc::EIO },
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum FsalError {
    #[error("unsupported layout type {0}")]
    UnknownLayoutType(u32),

    #[error("requested layout [{offset}, +{min_length}) extends beyond the pNFS-accessible region")]
    BadLayout { offset: u64, min_length: u64 },

    #[error("malformed handle of {len} bytes")]
    BadHandle { len: usize },

    #[error("buffer too small: need {need} bytes, have {have}")]
    TooSmall { need: usize, have: usize },

    #[error("server fault: {0}")]
    ServerFault(String),

    #[error("offset {offset} is not served by this data server")]
    PnfsIoHole { offset: u64 },

    #[error("layouts are not available on this export")]
    LayoutUnavailable,

    #[error("no outstanding layout to return")]
    NoMatchingLayout,

    #[error("object is not a regular file")]
    NotRegularFile,

    #[error("object is not open for the requested access")]
    NotOpen,

    #[error("export has been released")]
    StaleExport,

    #[error("backend initialisation failed: {0}")]
    BackendInit(BackendError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl FsalError {
    /// The protocol status reported to the client for this error.
    pub fn status(&self) -> NfsStatus {
        match self {
            Self::UnknownLayoutType(_) => NfsStatus::UnknownLayoutType,
            Self::BadLayout { .. } => NfsStatus::Badlayout,
            Self::BadHandle { .. } => NfsStatus::Badhandle,
            Self::TooSmall { .. } => NfsStatus::Toosmall,
            Self::ServerFault(_) => NfsStatus::Serverfault,
            Self::PnfsIoHole { .. } => NfsStatus::PnfsIoHole,
            Self::LayoutUnavailable => NfsStatus::LayoutUnavailable,
            Self::NoMatchingLayout => NfsStatus::NoMatchingLayout,
            Self::NotRegularFile => NfsStatus::Inval,
            Self::NotOpen => NfsStatus::Openmode,
            Self::StaleExport => NfsStatus::Stale,
            Self::BackendInit(_) => NfsStatus::Serverfault,
            Self::Backend(e) => backend_status(e),
        }
    }
}

fn backend_status(e: &BackendError) -> NfsStatus {
    match e {
        BackendError::NotFound => NfsStatus::Noent,
        BackendError::Exists => NfsStatus::Exist,
        BackendError::NotDir => NfsStatus::Notdir,
        BackendError::IsDir => NfsStatus::Isdir,
        BackendError::NotEmpty => NfsStatus::Notempty,
        BackendError::Stale => NfsStatus::Stale,
        BackendError::Access => NfsStatus::Access,
        BackendError::NoSpace => NfsStatus::Nospc,
        BackendError::Invalid => NfsStatus::Inval,
        BackendError::Busy => NfsStatus::Delay,
        BackendError::NotSupported => NfsStatus::Notsupp,
        BackendError::Io { .. } => NfsStatus::Io,
        BackendError::Connect(_) => NfsStatus::Serverfault,
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;
pub type Result<T> = std::result::Result<T, FsalError>;
