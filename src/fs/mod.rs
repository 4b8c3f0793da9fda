//! Filesystem facade.
//!
//! [`FileSystem`] is the host-facing surface: mount/unmount, POSIX-style
//! file and directory operations, extended attributes and stat. Every
//! mutating operation brackets its work in a journal transaction:
//! opened on entry, committed before returning success, aborted on
//! error. Callers are serialized through the mount lock, matching the
//! single-threaded cooperative model of the core.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

use crate::blockdev::BlockDevice;
use crate::config::{MountOptions, MAX_TRUNCATE_SIZE};
use crate::errors::{CanFail, Ext4Error, FsResult};

pub mod ext4;

pub use ext4::dir::DirEntry;
pub use ext4::file::{Ext4File, OpenFlags};
use ext4::file::Ext4File as File;
use ext4::inode::{InodeFileMode, InodeType};
use ext4::Ext4Fs;

/// Cursor movement for [`FileSystem::seek`].
#[derive(Clone, Copy, Debug)]
pub enum Seek {
    /// Absolute position.
    Set(u64),

    /// Relative to the current position.
    Cur(i64),

    /// Relative to the end of the file.
    End(i64),
}

/// File metadata returned by [`FileSystem::stat`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stat {
    pub inode: u32,
    pub size: u64,
    pub blocks: u64,
    pub links: u16,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub is_dir: bool,
}

/// An open directory iterator.
#[derive(Clone, Debug)]
pub struct Ext4Dir {
    inode: u32,
    pos: u64,
}

/// A mounted filesystem.
///
/// The lock serializes every public operation, implementing the host
/// `lock()/unlock()` contract of the block device interface.
pub struct FileSystem {
    inner: Mutex<Ext4Fs>,
}

fn with_trans<R>(fs: &mut Ext4Fs, op: impl FnOnce(&mut Ext4Fs) -> FsResult<R>) -> FsResult<R> {
    fs.trans_start()?;
    match op(fs) {
        Ok(v) => {
            fs.trans_stop()?;
            Ok(v)
        }
        Err(e) => {
            fs.trans_abort();
            Err(e)
        }
    }
}

impl FileSystem {
    /// Mounts the filesystem found on `dev`, replaying the journal when
    /// the on-disk state requires recovery.
    pub fn mount(dev: Box<dyn BlockDevice>, opts: MountOptions) -> FsResult<Self> {
        Ok(Self {
            inner: Mutex::new(Ext4Fs::mount(dev, opts)?),
        })
    }

    /// Unmounts: flushes every cache, marks the journal clean and
    /// releases the device.
    pub fn unmount(self) -> CanFail<Ext4Error> {
        self.inner.into_inner().unmount()
    }

    /// Opens a file. `CREAT` creates it when missing, `EXCL` demands
    /// that creation happens, `TRUNC` empties it, `APPEND` moves every
    /// write to the end.
    pub fn open(&self, path: &str, flags: OpenFlags) -> FsResult<File> {
        let mut fs = self.inner.lock();

        let ino = match fs.resolve_path(path) {
            Ok(ino) => {
                if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
                    return Err(Ext4Error::AlreadyExists);
                }
                ino
            }
            Err(Ext4Error::NotFound) if flags.contains(OpenFlags::CREAT) => {
                with_trans(&mut *fs, |fs| {
                    fs.create_node(
                        path,
                        InodeFileMode(
                            InodeFileMode::S_IFREG.0 | InodeFileMode::DEFAULT_FILE_PERM.0,
                        ),
                    )
                })?
            }
            Err(e) => return Err(e),
        };

        let iref = fs.get_inode_ref(ino)?;
        let itype = iref.inode.inode_type();
        let size = iref.inode.size();
        fs.put_inode_ref(iref)?;

        if itype == InodeType::Directory {
            return Err(Ext4Error::IsADirectory);
        }

        let mut file = File {
            inode: ino,
            flags,
            fsize: size,
            fpos: 0,
        };

        if flags.contains(OpenFlags::TRUNC) && flags.writable() && size > 0 {
            drop(fs);
            self.truncate(&mut file, 0)?;
        }

        Ok(file)
    }

    /// Opens a file with a C-library style mode string (`"r"`, `"w+"`,
    /// `"ab"`, ...).
    pub fn open_with_mode(&self, path: &str, mode: &str) -> FsResult<File> {
        self.open(path, OpenFlags::from_mode_str(mode)?)
    }

    /// Closes a file handle. Handles carry no kernel-side state, but
    /// the symmetry keeps host bindings straightforward.
    pub fn close(&self, _file: File) {}

    /// Reads from the file cursor. Returns the number of bytes read; 0
    /// at end of file.
    pub fn read(&self, file: &mut File, buf: &mut [u8]) -> FsResult<usize> {
        self.inner.lock().file_read(file, buf)
    }

    /// Writes at the file cursor (at the end of the file with
    /// `APPEND`), growing the file as needed.
    pub fn write(&self, file: &mut File, buf: &[u8]) -> FsResult<usize> {
        let mut fs = self.inner.lock();
        with_trans(&mut *fs, |fs| fs.file_write(file, buf))
    }

    /// Moves the file cursor.
    pub fn seek(&self, file: &mut File, pos: Seek) -> FsResult<u64> {
        let new_pos = match pos {
            Seek::Set(p) => p,
            Seek::Cur(d) => file
                .fpos
                .checked_add_signed(d)
                .ok_or(Ext4Error::InvalidArgument)?,
            Seek::End(d) => file
                .fsize
                .checked_add_signed(d)
                .ok_or(Ext4Error::InvalidArgument)?,
        };
        file.fpos = new_pos;
        Ok(new_pos)
    }

    /// Truncates (or sparsely extends) the file to `size` bytes.
    ///
    /// Shrinking is chunked into transactions bounded by
    /// [`MAX_TRUNCATE_SIZE`], so a crash mid-truncate leaves a
    /// consistent, partially truncated file.
    pub fn truncate(&self, file: &mut File, size: u64) -> CanFail<Ext4Error> {
        if !file.flags.writable() {
            return Err(Ext4Error::NotPermitted);
        }

        let mut fs = self.inner.lock();
        loop {
            let iref = fs.get_inode_ref(file.inode)?;
            let cur = iref.inode.size();
            fs.put_inode_ref(iref)?;

            if cur <= size {
                if cur < size {
                    with_trans(&mut *fs, |fs| {
                        let mut iref = fs.get_inode_ref(file.inode)?;
                        let r = fs.truncate_inode(&mut iref, size);
                        fs.put_inode_ref(iref)?;
                        r
                    })?;
                }
                break;
            }

            let target = size.max(cur.saturating_sub(MAX_TRUNCATE_SIZE));
            with_trans(&mut *fs, |fs| {
                let mut iref = fs.get_inode_ref(file.inode)?;
                let r = fs.truncate_inode(&mut iref, target);
                fs.put_inode_ref(iref)?;
                r
            })?;

            if target == size {
                break;
            }
        }

        file.fsize = size;
        file.fpos = file.fpos.min(size);
        Ok(())
    }

    /// Punches a hole: `[offset, offset + len)` reads back as zeroes
    /// and fully covered blocks return to the allocator.
    pub fn punch_hole(&self, file: &File, offset: u64, len: u64) -> CanFail<Ext4Error> {
        if !file.flags.writable() {
            return Err(Ext4Error::NotPermitted);
        }
        let mut fs = self.inner.lock();
        with_trans(&mut *fs, |fs| fs.file_punch_hole(file, offset, len))
    }

    /// Removes a file (or any non-directory object). Large files are
    /// truncated in bounded transactions first.
    pub fn remove(&self, path: &str) -> CanFail<Ext4Error> {
        let mut fs = self.inner.lock();
        let ino = fs.resolve_path(path)?;

        // shrink the file chunk by chunk so no single transaction
        // releases more than MAX_TRUNCATE_SIZE bytes
        loop {
            let iref = fs.get_inode_ref(ino)?;
            let cur = iref.inode.size();
            let links = iref.inode.links_count();
            fs.put_inode_ref(iref)?;

            if cur == 0 || links > 1 {
                break;
            }

            let target = cur.saturating_sub(MAX_TRUNCATE_SIZE);
            with_trans(&mut *fs, |fs| {
                let mut iref = fs.get_inode_ref(ino)?;
                let r = fs.truncate_inode(&mut iref, target);
                fs.put_inode_ref(iref)?;
                r
            })?;

            if target == 0 {
                break;
            }
        }

        with_trans(&mut *fs, |fs| fs.unlink_node(path, false))
    }

    /// Creates a directory.
    pub fn mkdir(&self, path: &str) -> CanFail<Ext4Error> {
        let mut fs = self.inner.lock();
        with_trans(&mut *fs, |fs| {
            fs.create_node(
                path,
                InodeFileMode(InodeFileMode::S_IFDIR.0 | InodeFileMode::DEFAULT_DIR_PERM.0),
            )
            .map(|_| ())
        })
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> CanFail<Ext4Error> {
        let mut fs = self.inner.lock();
        with_trans(&mut *fs, |fs| fs.unlink_node(path, true))
    }

    /// Renames `old_path` to `new_path`, replacing an existing
    /// non-directory target.
    pub fn rename(&self, old_path: &str, new_path: &str) -> CanFail<Ext4Error> {
        let mut fs = self.inner.lock();
        with_trans(&mut *fs, |fs| fs.rename_node(old_path, new_path))
    }

    /// Opens a directory for iteration.
    pub fn dir_open(&self, path: &str) -> FsResult<Ext4Dir> {
        let mut fs = self.inner.lock();
        let ino = fs.resolve_path(path)?;

        let iref = fs.get_inode_ref(ino)?;
        let is_dir = iref.inode.inode_type() == InodeType::Directory;
        fs.put_inode_ref(iref)?;

        if !is_dir {
            return Err(Ext4Error::NotADirectory);
        }
        Ok(Ext4Dir { inode: ino, pos: 0 })
    }

    /// Returns the next entry of an open directory, `None` at the end.
    pub fn dir_next(&self, dir: &mut Ext4Dir) -> FsResult<Option<DirEntry>> {
        let mut fs = self.inner.lock();
        let iref = fs.get_inode_ref(dir.inode)?;
        let result = ext4::dir::dir_entry_next(&mut *fs, &iref, dir.pos);
        fs.put_inode_ref(iref)?;

        Ok(result?.map(|(entry, next)| {
            dir.pos = next;
            entry
        }))
    }

    /// File metadata.
    pub fn stat(&self, path: &str) -> FsResult<Stat> {
        let mut fs = self.inner.lock();
        let ino = fs.resolve_path(path)?;
        let iref = fs.get_inode_ref(ino)?;

        let stat = Stat {
            inode: ino,
            size: iref.inode.size(),
            blocks: iref.inode.blocks_count(),
            links: iref.inode.links_count(),
            mode: iref.inode.mode().0,
            uid: iref.inode.uid(),
            gid: iref.inode.gid(),
            atime: u32::from_le(iref.inode.atime),
            mtime: u32::from_le(iref.inode.mtime),
            ctime: u32::from_le(iref.inode.ctime),
            is_dir: iref.inode.inode_type() == InodeType::Directory,
        };
        fs.put_inode_ref(iref)?;
        Ok(stat)
    }

    /// Retrieves an extended attribute value.
    pub fn getxattr(&self, path: &str, name: &str) -> FsResult<Vec<u8>> {
        let mut fs = self.inner.lock();
        let ino = fs.resolve_path(path)?;
        let iref = fs.get_inode_ref(ino)?;
        let r = ext4::xattr::xattr_get(&mut *fs, &iref, name.as_bytes());
        fs.put_inode_ref(iref)?;
        r
    }

    /// Sets (or replaces) an extended attribute.
    pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> CanFail<Ext4Error> {
        let mut fs = self.inner.lock();
        let ino = fs.resolve_path(path)?;
        with_trans(&mut *fs, |fs| {
            let mut iref = fs.get_inode_ref(ino)?;
            let r = ext4::xattr::xattr_set(fs, &mut iref, name.as_bytes(), value);
            iref.dirty = true;
            fs.put_inode_ref(iref)?;
            r
        })
    }

    /// Removes an extended attribute.
    pub fn removexattr(&self, path: &str, name: &str) -> CanFail<Ext4Error> {
        let mut fs = self.inner.lock();
        let ino = fs.resolve_path(path)?;
        with_trans(&mut *fs, |fs| {
            let mut iref = fs.get_inode_ref(ino)?;
            let r = ext4::xattr::xattr_remove(fs, &mut iref, name.as_bytes());
            iref.dirty = true;
            fs.put_inode_ref(iref)?;
            r
        })
    }

    /// Lists the extended attribute names of a file.
    pub fn listxattr(&self, path: &str) -> FsResult<Vec<String>> {
        let mut fs = self.inner.lock();
        let ino = fs.resolve_path(path)?;
        let iref = fs.get_inode_ref(ino)?;
        let names = ext4::xattr::xattr_list(&mut *fs, &iref);
        fs.put_inode_ref(iref)?;

        Ok(names?
            .into_iter()
            .map(|n| String::from_utf8_lossy(&n).into_owned())
            .collect())
    }

    /// Whether a journal is active on this mount.
    pub fn journal_enabled(&self) -> bool {
        self.inner.lock().journal.is_some()
    }

    /// Device statistics: `(reads, writes)` issued since mount.
    pub fn device_stats(&self) -> (u64, u64) {
        let fs = self.inner.lock();
        (fs.bdev.bread_count(), fs.bdev.bwrite_count())
    }

    /// Direct access to the core, for consistency checks.
    #[cfg(test)]
    pub(crate) fn with_fs_mut<R>(&self, f: impl FnOnce(&mut Ext4Fs) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }
}
