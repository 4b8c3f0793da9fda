//! File data path.
//!
//! Reads and writes dispatch each logical block through the inode's
//! mapping (extent tree or indirect blocks). Whole blocks transfer
//! directly between the caller's buffer and the device; the block
//! cache only ever holds metadata. Holes and unwritten extents read as
//! zeroes; writing into a hole allocates on the fly.

use alloc::vec;
use log::error;

use crate::errors::{CanFail, Ext4Error, FsResult};
use crate::fs::ext4::extent;
use crate::fs::ext4::inode::{self, InodeFlags, InodeRef, InodeType};
use crate::fs::ext4::Ext4Fs;

/// Open flags of a file handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags(pub(crate) u32);

impl OpenFlags {
    pub const RDONLY: Self = Self(0o0);
    pub const WRONLY: Self = Self(0o1);
    pub const RDWR: Self = Self(0o2);
    pub const CREAT: Self = Self(0o100);
    pub const EXCL: Self = Self(0o200);
    pub const TRUNC: Self = Self(0o1000);
    pub const APPEND: Self = Self(0o2000);

    pub(crate) fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn writable(self) -> bool {
        self.contains(Self::WRONLY) || self.contains(Self::RDWR)
    }

    pub(crate) fn readable(self) -> bool {
        !self.contains(Self::WRONLY)
    }

    /// Maps the C-library style mode strings onto flag sets:
    ///
    /// | mode                  | flags                     |
    /// |-----------------------|---------------------------|
    /// | `r`, `rb`             | RDONLY                    |
    /// | `w`, `wb`             | WRONLY \| CREAT \| TRUNC  |
    /// | `a`, `ab`             | WRONLY \| CREAT \| APPEND |
    /// | `r+`, `rb+`, `r+b`    | RDWR                      |
    /// | `w+`, `wb+`, `w+b`    | RDWR \| CREAT \| TRUNC    |
    /// | `a+`, `ab+`, `a+b`    | RDWR \| CREAT \| APPEND   |
    pub fn from_mode_str(mode: &str) -> FsResult<Self> {
        let plus = mode.contains('+');
        let base = mode.chars().next().ok_or(Ext4Error::InvalidArgument)?;

        Ok(match (base, plus) {
            ('r', false) => Self::RDONLY,
            ('r', true) => Self::RDWR,
            ('w', false) => Self(Self::WRONLY.0 | Self::CREAT.0 | Self::TRUNC.0),
            ('w', true) => Self(Self::RDWR.0 | Self::CREAT.0 | Self::TRUNC.0),
            ('a', false) => Self(Self::WRONLY.0 | Self::CREAT.0 | Self::APPEND.0),
            ('a', true) => Self(Self::RDWR.0 | Self::CREAT.0 | Self::APPEND.0),
            _ => return Err(Ext4Error::InvalidArgument),
        })
    }
}

impl core::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// An open file handle.
#[derive(Clone, Debug)]
pub struct Ext4File {
    /// Inode number of the file.
    pub(crate) inode: u32,

    pub(crate) flags: OpenFlags,

    /// Cached file size.
    pub(crate) fsize: u64,

    /// Cursor position.
    pub(crate) fpos: u64,
}

impl Ext4File {
    pub fn size(&self) -> u64 {
        self.fsize
    }

    pub fn tell(&self) -> u64 {
        self.fpos
    }
}

impl Ext4Fs {
    /// Reads up to `buf.len()` bytes from the file's cursor position.
    pub(crate) fn file_read(&mut self, f: &mut Ext4File, buf: &mut [u8]) -> FsResult<usize> {
        if !f.flags.readable() {
            return Err(Ext4Error::NotPermitted);
        }

        let iref = self.get_inode_ref(f.inode)?;
        let size = iref.inode.size();
        f.fsize = size;

        if f.fpos >= size || buf.is_empty() {
            self.put_inode_ref(iref)?;
            return Ok(0);
        }

        let count = (buf.len() as u64).min(size - f.fpos) as usize;
        let result = self.read_inode_data(&iref, f.fpos, &mut buf[..count]);
        self.put_inode_ref(iref)?;
        result?;

        f.fpos += count as u64;
        Ok(count)
    }

    fn read_inode_data(
        &mut self,
        iref: &InodeRef,
        offset: u64,
        buf: &mut [u8],
    ) -> CanFail<Ext4Error> {
        if iref.inode.has_inline_data() {
            let inline = &iref.inode.block;
            for (i, b) in buf.iter_mut().enumerate() {
                let src = offset as usize + i;
                *b = if src < inline.len() { inline[src] } else { 0 };
            }
            return Ok(());
        }

        let bsize = u64::from(self.sb.blk_size());
        let mut pos = offset;
        let mut filled = 0usize;
        let mut tmp = vec![0u8; bsize as usize];

        while filled < buf.len() {
            let lblk = (pos / bsize) as u32;
            let in_blk = (pos % bsize) as usize;
            let chunk = (buf.len() - filled).min(bsize as usize - in_blk);

            match self.inode_block(iref, lblk)? {
                Some(lba) if in_blk == 0 && chunk == bsize as usize => {
                    self.bdev
                        .blocks_read_direct(lba, 1, &mut buf[filled..filled + chunk])?;
                }
                Some(lba) => {
                    self.bdev.blocks_read_direct(lba, 1, &mut tmp)?;
                    buf[filled..filled + chunk].copy_from_slice(&tmp[in_blk..in_blk + chunk]);
                }
                None => {
                    buf[filled..filled + chunk].fill(0);
                }
            }

            pos += chunk as u64;
            filled += chunk;
        }
        Ok(())
    }

    /// Writes `buf` at the file's cursor position, allocating blocks as
    /// needed and growing the file.
    pub(crate) fn file_write(&mut self, f: &mut Ext4File, buf: &[u8]) -> FsResult<usize> {
        if !f.flags.writable() {
            return Err(Ext4Error::NotPermitted);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut iref = self.get_inode_ref(f.inode)?;
        if f.flags.contains(OpenFlags::APPEND) {
            f.fpos = iref.inode.size();
        }

        if f.fpos + buf.len() as u64 > u64::from(u32::MAX) && !inode::has_large_file(&self.sb) {
            self.put_inode_ref(iref)?;
            return Err(Ext4Error::TooBig);
        }

        if iref.inode.has_inline_data() {
            if let Err(e) = self.uninline_data(&mut iref) {
                self.put_inode_ref(iref)?;
                return Err(e);
            }
        }

        let result = self.write_inode_data(&mut iref, f.fpos, buf);

        match result {
            Ok(()) => {
                let end = f.fpos + buf.len() as u64;
                if end > iref.inode.size() {
                    iref.inode.set_size(end);
                }
                iref.inode.mtime = self.now().to_le();
                iref.dirty = true;
                f.fsize = iref.inode.size();
                f.fpos = end;
                self.put_inode_ref(iref)?;
                Ok(buf.len())
            }
            Err(e) => {
                self.put_inode_ref(iref)?;
                Err(e)
            }
        }
    }

    fn write_inode_data(
        &mut self,
        iref: &mut InodeRef,
        offset: u64,
        buf: &[u8],
    ) -> CanFail<Ext4Error> {
        let bsize = u64::from(self.sb.blk_size());
        let mut pos = offset;
        let mut written = 0usize;
        let mut tmp = vec![0u8; bsize as usize];

        while written < buf.len() {
            let lblk = (pos / bsize) as u32;
            let in_blk = (pos % bsize) as usize;
            let chunk = (buf.len() - written).min(bsize as usize - in_blk);

            let (lba, fresh) = self.inode_block_create(iref, lblk)?;

            if in_blk == 0 && chunk == bsize as usize {
                self.bdev
                    .blocks_write_direct(lba, 1, &buf[written..written + chunk])?;
            } else {
                if fresh {
                    tmp.fill(0);
                } else {
                    self.bdev.blocks_read_direct(lba, 1, &mut tmp)?;
                }
                tmp[in_blk..in_blk + chunk].copy_from_slice(&buf[written..written + chunk]);
                self.bdev.blocks_write_direct(lba, 1, &tmp)?;
            }

            pos += chunk as u64;
            written += chunk;
        }
        Ok(())
    }

    /// Converts an inline-data file into a block-mapped one, preserving
    /// its content.
    fn uninline_data(&mut self, iref: &mut InodeRef) -> CanFail<Ext4Error> {
        let size = iref.inode.size() as usize;
        if size > iref.inode.block.len() {
            error!(target: "ext4", "inline file larger than its inline area (inode {})", iref.index);
            return Err(Ext4Error::Corrupted);
        }
        let content: alloc::vec::Vec<u8> = iref.inode.block[..size].to_vec();

        let mut flags = iref.inode.flags();
        flags.0 &= !InodeFlags::INLINE_DATA_FL.0;
        iref.inode.set_flags(flags);
        iref.inode.block = [0u8; 60];

        if self
            .sb
            .feature_incompat()
            .includes(crate::fs::ext4::sb::IncompatibleFeatureSet::EXTENTS)
        {
            let mut f = iref.inode.flags();
            f.extend_from_set(InodeFlags::EXTENTS_FL);
            iref.inode.set_flags(f);
            extent::extent_tree_init(iref);
        }
        iref.dirty = true;

        if !content.is_empty() {
            self.write_inode_data(iref, 0, &content)?;
        }
        Ok(())
    }

    /// Punches a hole: the byte range reads back as zeroes and the
    /// fully covered blocks are given back to the allocator.
    pub(crate) fn file_punch_hole(
        &mut self,
        f: &Ext4File,
        offset: u64,
        len: u64,
    ) -> CanFail<Ext4Error> {
        if len == 0 {
            return Ok(());
        }

        let mut iref = self.get_inode_ref(f.inode)?;
        if iref.inode.inode_type() != InodeType::Regular {
            self.put_inode_ref(iref)?;
            return Err(Ext4Error::NotPermitted);
        }

        let result = (|| -> CanFail<Ext4Error> {
            let bsize = u64::from(self.sb.blk_size());
            let size = iref.inode.size();
            let end = (offset + len).min(size);
            if offset >= end {
                return Ok(());
            }

            // zero the partial edges in place
            let first_full = (offset + bsize - 1) / bsize;
            let last_full = end / bsize;

            let zero_range =
                |fs: &mut Ext4Fs, iref: &mut InodeRef, from: u64, to: u64| -> CanFail<Ext4Error> {
                    if from >= to {
                        return Ok(());
                    }
                    let lblk = (from / bsize) as u32;
                    if let Some(lba) = fs.inode_block(iref, lblk)? {
                        let mut tmp = vec![0u8; bsize as usize];
                        fs.bdev.blocks_read_direct(lba, 1, &mut tmp)?;
                        let a = (from % bsize) as usize;
                        let b = a + (to - from) as usize;
                        tmp[a..b].fill(0);
                        fs.bdev.blocks_write_direct(lba, 1, &tmp)?;
                    }
                    Ok(())
                };

            zero_range(self, &mut iref, offset, (first_full * bsize).min(end))?;
            zero_range(self, &mut iref, (last_full * bsize).max(offset), end)?;

            if first_full < last_full {
                if iref.inode.uses_extents() {
                    extent::extent_remove_space(
                        self,
                        &mut iref,
                        first_full as u32,
                        (last_full - 1) as u32,
                    )?;
                } else {
                    // the legacy mapping has no cheap middle punch;
                    // drop the blocks one by one
                    for lblk in first_full..last_full {
                        if let Some(lba) = self.inode_block(&iref, lblk as u32)? {
                            crate::fs::ext4::indirect::indirect_unmap_block(
                                self, &mut iref, lblk as u32, lba,
                            )?;
                        }
                    }
                }
            }

            iref.inode.mtime = self.now().to_le();
            iref.dirty = true;
            Ok(())
        })();

        self.put_inode_ref(iref)?;
        result
    }
}
