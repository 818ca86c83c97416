#[path = "../helpers/mod.rs"]
mod helpers;

mod codec;
mod commit;
mod devices;
mod local_vfs;
mod mounts;
