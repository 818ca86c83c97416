pub mod backend;
pub mod config;
pub mod error;
pub mod export;
pub mod handle;
pub mod mount;
pub mod pnfs;
pub mod recall;
pub mod wire;

pub use error::{FsalError, NfsStatus, Result};
pub use export::{Export, PathHandle};
pub use handle::{ObjectHandle, OpenState};
pub use mount::{Mount, MountRegistry};
pub use wire::WireKey;
