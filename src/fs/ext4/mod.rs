//! Core of the `ext4` filesystem implementation.
//!
//! [`Ext4Fs`] ties the pieces together: the superblock and descriptor
//! table, the allocators, the inode store, the per-inode block mapping
//! (extent tree or legacy indirect blocks), directories and the
//! journal. The public POSIX-style surface lives one level up, in
//! [`crate::fs::FileSystem`].

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use bytemuck::{bytes_of, Zeroable};
use log::{error, info};

use crate::blockdev::{BlockDevice, Blockdev};
use crate::config::MountOptions;
use crate::errors::{CanFail, Ext4Error, FsResult};

pub(crate) mod balloc;
pub(crate) mod bitmap;
pub(crate) mod block_grp;
pub(crate) mod checksum;
pub(crate) mod dir;
pub(crate) mod dir_idx;
pub(crate) mod extent;
pub(crate) mod file;
pub(crate) mod ialloc;
pub(crate) mod indirect;
pub(crate) mod inode;
pub(crate) mod journal;
pub mod mkfs;
pub(crate) mod sb;
pub(crate) mod trans;
pub(crate) mod xattr;

use inode::{Ext4Inode, InodeFileMode, InodeFlags, InodeRef, InodeType};
use journal::{jbd_recover, JbdFs, JbdJournal, JbdTrans};
use sb::{CompatibleFeatureSet, IncompatibleFeatureSet, Superblock};

/// A mounted ext2/3/4 filesystem.
pub struct Ext4Fs {
    pub(crate) bdev: Blockdev,
    pub(crate) sb: Superblock,

    pub(crate) read_only: bool,

    /// The in-memory superblock counters diverged from disk and must be
    /// written back with the next transaction.
    pub(crate) sb_dirty: bool,

    /// Round-robin hint for inode allocation.
    pub(crate) last_inode_bg: u32,

    /// Generation counter handed to fresh inodes, so metadata checksum
    /// seeds are never all-zero.
    next_generation: u32,

    clock: Option<fn() -> u32>,

    pub(crate) journal: Option<JbdJournal>,
    pub(crate) curr_trans: Option<JbdTrans>,
}

impl Ext4Fs {
    /// Mounts the filesystem found on `dev`.
    ///
    /// Validates the superblock, binds the cache, replays the journal
    /// when the filesystem needs recovery, and starts the journal for
    /// subsequent transactions.
    pub fn mount(dev: Box<dyn BlockDevice>, opts: MountOptions) -> FsResult<Self> {
        let mut bdev = Blockdev::new(dev, opts.cache_size)?;

        let sb = Superblock::load(&mut bdev)?;
        bdev.set_lg_bsize(sb.blk_size());
        if opts.cache_write_back {
            bdev.cache_write_back(true)?;
        }

        let mut fs = Self {
            bdev,
            sb,
            read_only: opts.read_only,
            sb_dirty: false,
            last_inode_bg: 0,
            next_generation: 1,
            clock: opts.clock,
            journal: None,
            curr_trans: None,
        };

        let has_journal = fs
            .sb
            .feature_compat()
            .includes(CompatibleFeatureSet::HAS_JOURNAL)
            && fs.sb.journal_inum() != 0;
        let needs_recovery = fs
            .sb
            .feature_incompat()
            .includes(IncompatibleFeatureSet::RECOVER);

        if has_journal && opts.journal {
            let map = fs.journal_block_map()?;
            let mut jbd_fs = JbdFs::load(&mut fs.bdev, map)?;

            if needs_recovery {
                if fs.read_only {
                    error!(target: "ext4", "filesystem needs recovery, cannot mount read-only");
                    return Err(Ext4Error::ReadOnly);
                }

                jbd_recover(&mut jbd_fs, &mut fs.bdev)?;

                // the replay may have rewritten any metadata block, the
                // superblock and journal mapping included
                fs.sb = Superblock::load(&mut fs.bdev)?;
                let cleared =
                    fs.sb.feature_incompat().0 & !IncompatibleFeatureSet::RECOVER.0;
                fs.sb.feature_incompat = cleared.to_le();
                fs.sb.save(&mut fs.bdev)?;

                let map = fs.journal_block_map()?;
                jbd_fs = JbdFs::load(&mut fs.bdev, map)?;
            }

            fs.journal = Some(JbdJournal::start(jbd_fs)?);

            // a crash from here on must trigger recovery on the next
            // mount; the flag is cleared again by a clean unmount
            if !fs.read_only {
                let flagged = fs.sb.feature_incompat().0 | IncompatibleFeatureSet::RECOVER.0;
                fs.sb.feature_incompat = flagged.to_le();
                fs.sb.save(&mut fs.bdev)?;
                fs.bdev.flush_barrier()?;
            }
        } else if needs_recovery && !fs.read_only {
            error!(target: "ext4", "filesystem needs recovery but journaling is disabled");
            return Err(Ext4Error::Unsupported);
        }

        info!(
            target: "ext4",
            "mounted: label = {}    inodes = {}    blocks = {}    features = {:#x}",
            String::from_utf8_lossy(&fs.sb.volume_name).trim_end_matches('\0'),
            fs.sb.inodes_count(),
            fs.sb.blk_count(),
            fs.sb.feature_incompat().0,
        );
        Ok(fs)
    }

    /// Unmounts: flushes everything, stops the journal and releases the
    /// device.
    pub fn unmount(mut self) -> CanFail<Ext4Error> {
        debug_assert!(self.curr_trans.is_none());

        if let Some(journal) = self.journal.take() {
            journal.stop(&mut self.bdev)?;

            if !self.read_only {
                // the log is clean: the next mount needs no recovery
                let cleared = self.sb.feature_incompat().0 & !IncompatibleFeatureSet::RECOVER.0;
                self.sb.feature_incompat = cleared.to_le();
                self.sb_dirty = true;
            }
        }
        if self.sb_dirty {
            self.sb.save(&mut self.bdev)?;
        }
        self.bdev.close()
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.map(|f| f()).unwrap_or(0)
    }

    /// Physical blocks of the journal inode, in file order.
    fn journal_block_map(&mut self) -> FsResult<Vec<u64>> {
        let iref = self.get_inode_ref(inode::JOURNAL_INO)?;
        let bsize = u64::from(self.sb.blk_size());
        let blocks = (iref.inode.size() + bsize - 1) / bsize;

        let mut lbas = Vec::with_capacity(blocks as usize);
        for lblk in 0..blocks as u32 {
            match self.inode_block(&iref, lblk)? {
                Some(lba) => lbas.push(lba),
                None => {
                    error!(target: "ext4", "journal inode has holes");
                    self.put_inode_ref(iref)?;
                    return Err(Ext4Error::Corrupted);
                }
            }
        }
        self.put_inode_ref(iref)?;
        Ok(lbas)
    }

    // -----------------------------------------------------------------
    // inode store
    // -----------------------------------------------------------------

    fn inode_ref_internal(&mut self, ino: u32, fresh: bool) -> FsResult<InodeRef> {
        if ino == 0 || ino > self.sb.inodes_count() {
            return Err(Ext4Error::NotFound);
        }

        let ipg = self.sb.inodes_per_group();
        let bg = (ino - 1) / ipg;
        let idx = (ino - 1) % ipg;

        let bgref = self.get_bg_ref(bg)?;
        let itable = bgref.desc.inode_table(&self.sb);
        self.put_bg_ref(bgref)?;

        let inode_size = u64::from(self.sb.inode_size());
        let byte = u64::from(idx) * inode_size;
        let blk = itable + byte / u64::from(self.sb.blk_size());
        let offset = (byte % u64::from(self.sb.blk_size())) as usize;

        let block = self.trans_block_get(blk)?;

        let inode = {
            let mut data = block.data_mut();
            let record = &mut data[offset..offset + inode_size as usize];

            if fresh {
                record.fill(0);
            } else if !inode::verify_inode_csum(&self.sb, ino, record) {
                error!(target: "ext4", "invalid inode checksum (inode {ino})");
                drop(data);
                self.block_put(block)?;
                return Err(Ext4Error::Corrupted);
            }

            let n = (inode_size as usize).min(inode::INODE_STRUCT_SIZE);
            let mut image = Ext4Inode::zeroed();
            bytemuck::bytes_of_mut(&mut image)[..n].copy_from_slice(&record[..n]);
            image
        };

        Ok(InodeRef {
            index: ino,
            inode,
            block,
            offset,
            dirty: fresh,
        })
    }

    /// Acquires a pinned reference to inode `ino`.
    pub(crate) fn get_inode_ref(&mut self, ino: u32) -> FsResult<InodeRef> {
        self.inode_ref_internal(ino, false)
    }

    /// Returns an inode reference to the cache, serializing the copy
    /// back (checksum refreshed, buffer journaled) when it was
    /// modified.
    pub(crate) fn put_inode_ref(&mut self, mut iref: InodeRef) -> CanFail<Ext4Error> {
        if iref.dirty {
            let inode_size = usize::from(self.sb.inode_size());
            // only the live part of the record belongs to the image;
            // anything past `extra_isize` is inline xattr space
            let live = (128 + usize::from(iref.inode.extra_isize()))
                .clamp(128, inode::INODE_STRUCT_SIZE)
                .min(inode_size);
            {
                let mut data = iref.block.data_mut();
                let record = &mut data[iref.offset..iref.offset + inode_size];
                record[..live].copy_from_slice(&bytes_of(&iref.inode)[..live]);
                inode::set_inode_csum(&self.sb, iref.index, iref.inode.generation(), record);
            }
            let block = iref.block.clone();
            self.trans_set_dirty(&block)?;
            iref.dirty = false;
        }
        self.block_put(iref.block)
    }

    /// Allocates and initializes a fresh inode of the given type.
    pub(crate) fn alloc_inode(&mut self, mode: InodeFileMode) -> FsResult<InodeRef> {
        let is_dir = InodeType::from(mode) == InodeType::Directory;
        let ino = self.ialloc_alloc_inode(is_dir)?;

        let mut iref = self.inode_ref_internal(ino, true)?;
        iref.inode.set_mode(mode);
        iref.inode.set_links_count(0);
        iref.inode.set_size(0);
        iref.inode.set_generation(self.next_generation);
        self.next_generation = self.next_generation.wrapping_add(1).max(1);

        if self.sb.inode_size() > 128 {
            iref.inode.extra_isize = 32u16.to_le();
        }

        let now = self.now();
        iref.inode.set_times(now);
        iref.inode.crtime = now.to_le();

        if self
            .sb
            .feature_incompat()
            .includes(IncompatibleFeatureSet::EXTENTS)
            && !maps_no_blocks(mode)
        {
            let mut flags = iref.inode.flags();
            flags.extend_from_set(InodeFlags::EXTENTS_FL);
            iref.inode.set_flags(flags);
            extent::extent_tree_init(&mut iref);
        }

        iref.dirty = true;
        Ok(iref)
    }

    /// Releases an inode's storage and returns it to the free pool.
    pub(crate) fn free_inode(&mut self, mut iref: InodeRef) -> CanFail<Ext4Error> {
        let is_dir = iref.inode.inode_type() == InodeType::Directory;

        self.truncate_inode(&mut iref, 0)?;
        xattr::xattr_release(self, &mut iref)?;

        let ino = iref.index;
        iref.inode.dtime = self.now().to_le();
        iref.inode.set_links_count(0);
        iref.dirty = true;
        self.put_inode_ref(iref)?;

        self.ialloc_free_inode(ino, is_dir)
    }

    // -----------------------------------------------------------------
    // per-inode block mapping
    // -----------------------------------------------------------------

    /// Logical-to-physical translation. `None` for holes and unwritten
    /// extents (both read as zeroes).
    pub(crate) fn inode_block(&mut self, iref: &InodeRef, lblk: u32) -> FsResult<Option<u64>> {
        if iref.inode.uses_extents() {
            Ok(extent::extent_lookup(self, iref, lblk)?
                .filter(|m| m.written)
                .map(|m| m.phys))
        } else {
            indirect::indirect_lookup(self, iref, lblk)
        }
    }

    /// Logical-to-physical translation, allocating on a hole.
    pub(crate) fn inode_block_create(
        &mut self,
        iref: &mut InodeRef,
        lblk: u32,
    ) -> FsResult<(u64, bool)> {
        if iref.inode.uses_extents() {
            extent::extent_get_block_create(self, iref, lblk)
        } else {
            indirect::indirect_get_block_create(self, iref, lblk)
        }
    }

    /// Allocation goal for an inode's blocks: the start of its block
    /// group.
    pub(crate) fn inode_goal(&self, ino: u32) -> u64 {
        let bg = (ino.saturating_sub(1)) / self.sb.inodes_per_group();
        self.sb.bg_first_block(bg.min(self.sb.bg_count() - 1))
    }

    /// Shrinks (or sparsely extends) an inode to `new_size` bytes,
    /// releasing the mappings past the end.
    pub(crate) fn truncate_inode(
        &mut self,
        iref: &mut InodeRef,
        new_size: u64,
    ) -> CanFail<Ext4Error> {
        let old_size = iref.inode.size();
        if new_size >= old_size {
            if new_size != old_size {
                iref.inode.set_size(new_size);
                iref.dirty = true;
            }
            return Ok(());
        }

        if iref.inode.has_inline_data() {
            let from = new_size as usize;
            iref.inode.block[from.min(60)..].fill(0);
            iref.inode.set_size(new_size);
            iref.dirty = true;
            return Ok(());
        }

        let bsize = u64::from(self.sb.blk_size());
        let first_gone = ((new_size + bsize - 1) / bsize) as u32;
        let last_old = ((old_size + bsize - 1) / bsize) as u32;

        if last_old > first_gone {
            if iref.inode.uses_extents() {
                extent::extent_remove_space(self, iref, first_gone, last_old - 1)?;
            } else {
                indirect::indirect_release_from(self, iref, first_gone)?;
            }
        }

        iref.inode.set_size(new_size);
        iref.inode.mtime = self.now().to_le();
        iref.dirty = true;
        Ok(())
    }

    // -----------------------------------------------------------------
    // namespace
    // -----------------------------------------------------------------

    /// Resolves a path to an inode number. Paths split on `/`; symbolic
    /// links are not followed.
    pub(crate) fn resolve_path(&mut self, path: &str) -> FsResult<u32> {
        let mut cur = inode::ROOT_INO;

        for comp in path.split('/').filter(|c| !c.is_empty()) {
            let iref = self.get_inode_ref(cur)?;
            if iref.inode.inode_type() != InodeType::Directory {
                self.put_inode_ref(iref)?;
                return Err(Ext4Error::NotADirectory);
            }

            let found = dir::dir_find_entry(self, &iref, comp.as_bytes());
            self.put_inode_ref(iref)?;

            match found? {
                Some(entry) => cur = entry.inode,
                None => return Err(Ext4Error::NotFound),
            }
        }
        Ok(cur)
    }

    /// Resolves everything but the last component. Returns the parent
    /// inode number and the final name.
    pub(crate) fn resolve_parent<'p>(&mut self, path: &'p str) -> FsResult<(u32, &'p str)> {
        let trimmed = path.trim_end_matches('/');
        let (dir_part, name) = match trimmed.rfind('/') {
            Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
            None => ("", trimmed),
        };

        if name.is_empty() {
            return Err(Ext4Error::InvalidArgument);
        }
        Ok((self.resolve_path(dir_part)?, name))
    }

    /// Creates a filesystem object and links it under its parent.
    pub(crate) fn create_node(&mut self, path: &str, mode: InodeFileMode) -> FsResult<u32> {
        let (parent_ino, name) = self.resolve_parent(path)?;
        let is_dir = InodeType::from(mode) == InodeType::Directory;

        let mut parent = self.get_inode_ref(parent_ino)?;
        if parent.inode.inode_type() != InodeType::Directory {
            self.put_inode_ref(parent)?;
            return Err(Ext4Error::NotADirectory);
        }
        if is_dir
            && parent.inode.links_count() >= 65000
            && !self
                .sb
                .feature_ro_compat()
                .includes(sb::ReadOnlyCompatibleFeatureSet::DIR_NLINK)
        {
            self.put_inode_ref(parent)?;
            return Err(Ext4Error::TooManyLinks);
        }
        if dir::dir_find_entry(self, &parent, name.as_bytes())?.is_some() {
            self.put_inode_ref(parent)?;
            return Err(Ext4Error::AlreadyExists);
        }

        let mut child = match self.alloc_inode(mode) {
            Ok(c) => c,
            Err(e) => {
                self.put_inode_ref(parent)?;
                return Err(e);
            }
        };
        let child_ino = child.index;

        let result = (|| -> CanFail<Ext4Error> {
            if is_dir {
                dir::dir_init(self, &mut child, parent_ino)?;
                child.inode.set_links_count(2); // `.` and the parent entry
            } else {
                child.inode.set_links_count(1);
            }

            dir::dir_add_entry(
                self,
                &mut parent,
                name.as_bytes(),
                child_ino,
                mode_to_ftype(mode),
            )?;

            if is_dir {
                // `..` of the child links the parent
                let links = parent.inode.links_count() + 1;
                parent.inode.set_links_count(links);
                parent.dirty = true;
            }
            Ok(())
        })();

        child.dirty = true;
        self.put_inode_ref(child)?;
        self.put_inode_ref(parent)?;
        result.map(|()| child_ino)
    }

    /// Unlinks `path`. `rmdir` selects directory semantics (the target
    /// must be an empty directory); otherwise the target must not be a
    /// directory.
    pub(crate) fn unlink_node(&mut self, path: &str, rmdir: bool) -> CanFail<Ext4Error> {
        let (parent_ino, name) = self.resolve_parent(path)?;
        if name == "." || name == ".." {
            return Err(Ext4Error::InvalidArgument);
        }

        let mut parent = self.get_inode_ref(parent_ino)?;
        let entry = match dir::dir_find_entry(self, &parent, name.as_bytes())? {
            Some(e) => e,
            None => {
                self.put_inode_ref(parent)?;
                return Err(Ext4Error::NotFound);
            }
        };

        let mut child = self.get_inode_ref(entry.inode)?;
        let is_dir = child.inode.inode_type() == InodeType::Directory;

        let precheck = if rmdir && !is_dir {
            Err(Ext4Error::NotADirectory)
        } else if !rmdir && is_dir {
            Err(Ext4Error::IsADirectory)
        } else if rmdir && !dir::dir_is_empty(self, &child)? {
            Err(Ext4Error::NotEmpty)
        } else {
            Ok(())
        };
        if let Err(e) = precheck {
            self.put_inode_ref(child)?;
            self.put_inode_ref(parent)?;
            return Err(e);
        }

        dir::dir_remove_entry(self, &mut parent, name.as_bytes())?;

        if is_dir {
            // the removed directory's `..` no longer links the parent
            let links = parent.inode.links_count().saturating_sub(1);
            parent.inode.set_links_count(links);
            parent.dirty = true;
            self.put_inode_ref(parent)?;
            self.free_inode(child)?;
        } else {
            let links = child.inode.links_count().saturating_sub(1);
            child.inode.set_links_count(links);
            child.inode.ctime = self.now().to_le();
            child.dirty = true;
            self.put_inode_ref(parent)?;
            if links == 0 {
                self.free_inode(child)?;
            } else {
                self.put_inode_ref(child)?;
            }
        }
        Ok(())
    }

    /// Renames `old_path` to `new_path`, replacing a non-directory
    /// target when one exists.
    pub(crate) fn rename_node(&mut self, old_path: &str, new_path: &str) -> CanFail<Ext4Error> {
        let (old_parent_ino, old_name) = self.resolve_parent(old_path)?;
        let (new_parent_ino, new_name) = self.resolve_parent(new_path)?;
        let new_name_owned = String::from(new_name);
        let old_name_owned = String::from(old_name);

        let mut old_parent = self.get_inode_ref(old_parent_ino)?;
        let entry = match dir::dir_find_entry(self, &old_parent, old_name_owned.as_bytes())? {
            Some(e) => e,
            None => {
                self.put_inode_ref(old_parent)?;
                return Err(Ext4Error::NotFound);
            }
        };
        self.put_inode_ref(old_parent)?;
        let is_dir = entry.file_type == dir::file_type::DIRECTORY;

        // an existing target is replaced
        match self.unlink_node(new_path, is_dir) {
            Ok(()) | Err(Ext4Error::NotFound) => {}
            Err(e) => return Err(e),
        }

        let mut new_parent = self.get_inode_ref(new_parent_ino)?;
        dir::dir_add_entry(
            self,
            &mut new_parent,
            new_name_owned.as_bytes(),
            entry.inode,
            entry.file_type,
        )?;
        if is_dir && new_parent_ino != old_parent_ino {
            let links = new_parent.inode.links_count() + 1;
            new_parent.inode.set_links_count(links);
            new_parent.dirty = true;
        }
        self.put_inode_ref(new_parent)?;

        let mut old_parent = self.get_inode_ref(old_parent_ino)?;
        dir::dir_remove_entry(self, &mut old_parent, old_name_owned.as_bytes())?;
        if is_dir && new_parent_ino != old_parent_ino {
            let links = old_parent.inode.links_count().saturating_sub(1);
            old_parent.inode.set_links_count(links);
            old_parent.dirty = true;
        }
        self.put_inode_ref(old_parent)?;

        // a moved directory's `..` must point at its new parent
        if is_dir && new_parent_ino != old_parent_ino {
            let mut child = self.get_inode_ref(entry.inode)?;
            let r = dir::dir_set_parent(self, &mut child, new_parent_ino);
            self.put_inode_ref(child)?;
            r?;
        }
        Ok(())
    }
}

fn mode_to_ftype(mode: InodeFileMode) -> u8 {
    match InodeType::from(mode) {
        InodeType::Regular => dir::file_type::REGULAR,
        InodeType::Directory => dir::file_type::DIRECTORY,
        InodeType::CharacterDevice => dir::file_type::CHARDEV,
        InodeType::BlockDevice => dir::file_type::BLOCKDEV,
        InodeType::Fifo => dir::file_type::FIFO,
        InodeType::Socket => dir::file_type::SOCKET,
        InodeType::SymbolicLink => dir::file_type::SYMLINK,
    }
}

/// Device nodes, fifos and sockets map no data blocks; short symlink
/// targets are stored raw inside `i_block`. None of them carries an
/// extent tree.
fn maps_no_blocks(mode: InodeFileMode) -> bool {
    matches!(
        InodeType::from(mode),
        InodeType::CharacterDevice
            | InodeType::BlockDevice
            | InodeType::Fifo
            | InodeType::Socket
            | InodeType::SymbolicLink
    )
}
