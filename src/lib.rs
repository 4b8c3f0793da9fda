//! FrozenFS — an embeddable, journaling ext2/3/4 filesystem library.
//!
//! The host supplies a block device (anything implementing
//! [`blockdev::BlockDevice`]); the library provides POSIX-style file
//! and directory operations on top of it, with JBD2-compatible
//! journaling for crash consistency. On-disk images interoperate with
//! mainline Linux `mkfs.ext4` / `mount`.
//!
//! ```no_run
//! use frozenfs::{FileSystem, MountOptions, OpenFlags};
//!
//! # fn host_device() -> Box<dyn frozenfs::BlockDevice> { unimplemented!() }
//! let fs = FileSystem::mount(host_device(), MountOptions::default()).unwrap();
//!
//! let mut file = fs
//!     .open("/logs/boot.txt", OpenFlags::CREAT | OpenFlags::RDWR)
//!     .unwrap();
//! fs.write(&mut file, b"hello from the bootloader").unwrap();
//! fs.unmount().unwrap();
//! ```
//!
//! The core is single-threaded and cooperative: the mount handle
//! serializes callers, and the only suspension points are the host's
//! block I/O calls.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bcache;
pub mod blockdev;
pub mod config;
pub mod errors;
pub mod fs;

#[cfg(test)]
mod tests;

pub use blockdev::{BdevGeometry, BlockDevice};
pub use config::MountOptions;
pub use errors::{CanFail, Ext4Error, FsResult};
pub use fs::ext4::mkfs::{mkfs, MkfsOptions};
pub use fs::{DirEntry, Ext4Dir, Ext4File, FileSystem, OpenFlags, Seek, Stat};
