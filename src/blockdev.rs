//! Block device interface.
//!
//! The host supplies an implementation of [`BlockDevice`]; the library
//! layers [`Blockdev`] on top of it, which owns the block cache, the
//! partition offset arithmetic, the byte-granular accessors and the
//! release policy for cached buffers.

use alloc::boxed::Box;
use alloc::vec;

use crate::bcache::{Block, BlockCache, BufFlags};
use crate::errors::{CanFail, Ext4Error, FsResult};

/// Geometry reported by a backend when it is opened.
#[derive(Clone, Copy, Debug)]
pub struct BdevGeometry {
    /// Physical block size in bytes. Must be a power of two in
    /// `[512, 4096]`.
    pub block_size: u32,

    /// Total number of physical blocks.
    pub block_count: u64,

    /// Offset of the partition holding the filesystem, in bytes from the
    /// start of the device. Must be a multiple of the physical block
    /// size.
    pub part_offset: u64,
}

/// Backend capability set consumed by the core.
///
/// The backend may block on I/O; that is the only suspension point the
/// core contains. `lock`/`unlock` are optional serialization hooks for
/// hosts that share the device between the filesystem and other users.
pub trait BlockDevice {
    /// Opens the device and reports its geometry.
    fn open(&mut self) -> FsResult<BdevGeometry>;

    /// Fills `buf` with `cnt` consecutive physical blocks starting at
    /// `lba`. Fails with [`Ext4Error::IO`] on any hardware error; short
    /// reads are not allowed.
    fn bread(&mut self, buf: &mut [u8], lba: u64, cnt: u32) -> CanFail<Ext4Error>;

    /// Persists `buf` as `cnt` consecutive physical blocks starting at
    /// `lba`. No short writes.
    fn bwrite(&mut self, buf: &[u8], lba: u64, cnt: u32) -> CanFail<Ext4Error>;

    /// Releases the handle.
    fn close(&mut self) -> CanFail<Ext4Error>;

    /// Write barrier: returns once every previously written block is
    /// durable. The default is a no-op for backends with no volatile
    /// write cache.
    fn flush(&mut self) -> CanFail<Ext4Error> {
        Ok(())
    }

    fn lock(&mut self) {}

    fn unlock(&mut self) {}
}

/// A block device bound to a block cache.
///
/// Exposes the filesystem-facing operations: cached logical-block access
/// (`block_get` / `block_get_noread` / `block_set`), uncached bulk data
/// transfers, and byte-granular accessors performing read-modify-write of
/// one physical block per misaligned edge.
pub struct Blockdev {
    dev: Box<dyn BlockDevice>,

    ph_bsize: u32,
    ph_bcnt: u64,
    part_offset_blocks: u64,

    /// Logical (filesystem) block size; set at mount time.
    lg_bsize: u32,
    lg_bcnt: u64,

    pub(crate) bc: BlockCache,

    /// Write-back reference counter. While non-zero, dirty buffers
    /// released with no remaining references are queued on the dirty
    /// list instead of being flushed synchronously.
    cache_write_back: u32,

    bread_ctr: u64,
    bwrite_ctr: u64,
}

impl Blockdev {
    /// Opens the backend and binds a cache of `cache_size` buffers to it.
    pub fn new(mut dev: Box<dyn BlockDevice>, cache_size: u32) -> FsResult<Self> {
        let geo = dev.open()?;

        if !geo.block_size.is_power_of_two()
            || !(512..=4096).contains(&geo.block_size)
            || geo.part_offset % u64::from(geo.block_size) != 0
        {
            return Err(Ext4Error::InvalidArgument);
        }

        let part_offset_blocks = geo.part_offset / u64::from(geo.block_size);
        if part_offset_blocks >= geo.block_count {
            return Err(Ext4Error::InvalidArgument);
        }

        Ok(Self {
            dev,
            ph_bsize: geo.block_size,
            ph_bcnt: geo.block_count,
            part_offset_blocks,
            lg_bsize: geo.block_size,
            lg_bcnt: geo.block_count - part_offset_blocks,
            bc: BlockCache::new(cache_size, geo.block_size),
            cache_write_back: 0,
            bread_ctr: 0,
            bwrite_ctr: 0,
        })
    }

    /// Sets the logical block size. Called once at mount time, after the
    /// superblock has been parsed and before any cached access.
    pub(crate) fn set_lg_bsize(&mut self, lg_bsize: u32) {
        debug_assert!(lg_bsize % self.ph_bsize == 0);
        self.lg_bsize = lg_bsize;
        self.lg_bcnt =
            (self.ph_bcnt - self.part_offset_blocks) * u64::from(self.ph_bsize) / u64::from(lg_bsize);
        self.bc.set_itemsize(lg_bsize);
    }

    pub(crate) fn lg_bsize(&self) -> u32 {
        self.lg_bsize
    }

    pub(crate) fn lg_bcnt(&self) -> u64 {
        self.lg_bcnt
    }

    /// Number of device reads issued since the device was opened.
    pub fn bread_count(&self) -> u64 {
        self.bread_ctr
    }

    /// Number of device writes issued since the device was opened.
    pub fn bwrite_count(&self) -> u64 {
        self.bwrite_ctr
    }

    fn lg_to_ph(&self, lba: u64) -> u64 {
        self.part_offset_blocks + lba * u64::from(self.lg_bsize / self.ph_bsize)
    }

    /// Reads `buf.len()` bytes starting at byte offset `off` from the
    /// partition start.
    pub(crate) fn read_bytes(&mut self, off: u64, buf: &mut [u8]) -> CanFail<Ext4Error> {
        let ph_bsize = u64::from(self.ph_bsize);
        let mut lba = self.part_offset_blocks + off / ph_bsize;
        let mut in_blk = (off % ph_bsize) as usize;
        let mut filled = 0usize;

        let mut scratch = vec![0u8; self.ph_bsize as usize];
        while filled < buf.len() {
            let left = buf.len() - filled;
            if in_blk == 0 && left >= self.ph_bsize as usize {
                // aligned middle: read as many whole blocks as fit
                let cnt = (left / self.ph_bsize as usize) as u32;
                let bytes = cnt as usize * self.ph_bsize as usize;
                self.dev.bread(&mut buf[filled..filled + bytes], lba, cnt)?;
                self.bread_ctr += 1;
                lba += u64::from(cnt);
                filled += bytes;
            } else {
                let chunk = core::cmp::min(left, self.ph_bsize as usize - in_blk);
                self.dev.bread(&mut scratch, lba, 1)?;
                self.bread_ctr += 1;
                buf[filled..filled + chunk].copy_from_slice(&scratch[in_blk..in_blk + chunk]);
                lba += 1;
                in_blk = 0;
                filled += chunk;
            }
        }
        Ok(())
    }

    /// Writes `buf` starting at byte offset `off` from the partition
    /// start, performing read-modify-write of one physical block per
    /// misaligned edge.
    pub(crate) fn write_bytes(&mut self, off: u64, buf: &[u8]) -> CanFail<Ext4Error> {
        let ph_bsize = u64::from(self.ph_bsize);
        let mut lba = self.part_offset_blocks + off / ph_bsize;
        let mut in_blk = (off % ph_bsize) as usize;
        let mut written = 0usize;

        let mut scratch = vec![0u8; self.ph_bsize as usize];
        while written < buf.len() {
            let left = buf.len() - written;
            if in_blk == 0 && left >= self.ph_bsize as usize {
                let cnt = (left / self.ph_bsize as usize) as u32;
                let bytes = cnt as usize * self.ph_bsize as usize;
                self.dev.bwrite(&buf[written..written + bytes], lba, cnt)?;
                self.bwrite_ctr += 1;
                lba += u64::from(cnt);
                written += bytes;
            } else {
                let chunk = core::cmp::min(left, self.ph_bsize as usize - in_blk);
                self.dev.bread(&mut scratch, lba, 1)?;
                self.bread_ctr += 1;
                scratch[in_blk..in_blk + chunk].copy_from_slice(&buf[written..written + chunk]);
                self.dev.bwrite(&scratch, lba, 1)?;
                self.bwrite_ctr += 1;
                lba += 1;
                in_blk = 0;
                written += chunk;
            }
        }
        Ok(())
    }

    /// Uncached read of `cnt` consecutive logical blocks. Used by the
    /// file data path, which has no reason to pollute the metadata cache.
    pub(crate) fn blocks_read_direct(
        &mut self,
        lba: u64,
        cnt: u32,
        buf: &mut [u8],
    ) -> CanFail<Ext4Error> {
        let ph_per_lg = self.lg_bsize / self.ph_bsize;
        let ph_lba = self.lg_to_ph(lba);
        self.dev.bread(buf, ph_lba, cnt * ph_per_lg)?;
        self.bread_ctr += 1;
        Ok(())
    }

    /// Uncached write of `cnt` consecutive logical blocks.
    pub(crate) fn blocks_write_direct(
        &mut self,
        lba: u64,
        cnt: u32,
        buf: &[u8],
    ) -> CanFail<Ext4Error> {
        let ph_per_lg = self.lg_bsize / self.ph_bsize;
        let ph_lba = self.lg_to_ph(lba);
        self.dev.bwrite(buf, ph_lba, cnt * ph_per_lg)?;
        self.bwrite_ctr += 1;
        Ok(())
    }

    /// Returns a pinned buffer for logical block `lba` without reading
    /// it: the caller will fill the buffer before marking it up to date.
    pub(crate) fn block_get_noread(&mut self, lba: u64) -> FsResult<Block> {
        if lba >= self.lg_bcnt {
            return Err(Ext4Error::InvalidArgument);
        }

        // make room: evict the least recently used unreferenced buffer,
        // flushing it first when dirty
        while self.bc.is_full() && !self.bc.dont_shake {
            let Some(victim) = self.bc.lowest_lru() else {
                break;
            };
            self.block_flush_lba(victim)?;
            self.bc.drop_buf(victim);
        }

        let (block, _is_new) = self.bc.alloc(lba);
        Ok(block)
    }

    /// Returns a pinned, up-to-date buffer for logical block `lba`,
    /// reading it from the device on a cache miss.
    pub(crate) fn block_get(&mut self, lba: u64) -> FsResult<Block> {
        let block = self.block_get_noread(lba)?;

        if !block.is_uptodate() {
            let ph_per_lg = self.lg_bsize / self.ph_bsize;
            let ph_lba = self.lg_to_ph(lba);
            let r = {
                let mut data = block.data_mut();
                self.dev.bread(&mut data, ph_lba, ph_per_lg)
            };
            self.bread_ctr += 1;
            if let Err(e) = r {
                // not up to date: block_set drops the buffer
                self.block_set(block)?;
                return Err(e);
            }
            block.set_flag(BufFlags::UPTODATE);
        }
        Ok(block)
    }

    /// Releases a buffer reference.
    ///
    /// When the last reference goes away the buffer becomes an eviction
    /// candidate; a dirty, up-to-date buffer is queued on the dirty list
    /// in write-back mode (unless FLUSH or TMP demand otherwise) or
    /// flushed synchronously; a buffer that never became up to date, or
    /// is marked TMP, is dropped entirely.
    pub(crate) fn block_set(&mut self, block: Block) -> CanFail<Ext4Error> {
        let refctr = self.bc.dec_ref(&block);
        if refctr > 0 {
            return Ok(());
        }

        let flags = block.flags();
        let lba = block.lba();
        let mut r = Ok(());

        if flags.contains(BufFlags::DIRTY) && flags.contains(BufFlags::UPTODATE) {
            if self.cache_write_back > 0
                && !flags.contains(BufFlags::FLUSH)
                && !flags.contains(BufFlags::TMP)
            {
                self.bc.insert_dirty_node(&block);
            } else {
                r = self.block_flush_lba(lba);
                block.clear_flag(BufFlags::FLUSH);
            }
        }

        let flags = block.flags();
        if !flags.contains(BufFlags::UPTODATE) || flags.contains(BufFlags::TMP) {
            drop(block);
            self.bc.drop_buf(lba);
        }

        r
    }

    /// Writes the buffer cached for `lba` to its home location, when it
    /// is dirty, and clears its dirty state.
    pub(crate) fn block_flush_lba(&mut self, lba: u64) -> CanFail<Ext4Error> {
        let Some(rc) = self.bc.get_rc(lba) else {
            return Ok(());
        };
        let dirty = {
            let buf = rc.borrow();
            buf.flags.contains(BufFlags::DIRTY) && buf.flags.contains(BufFlags::UPTODATE)
        };
        if dirty {
            let ph_per_lg = self.lg_bsize / self.ph_bsize;
            let ph_lba = self.lg_to_ph(lba);
            {
                let buf = rc.borrow();
                self.dev.bwrite(&buf.data, ph_lba, ph_per_lg)?;
            }
            self.bwrite_ctr += 1;
            rc.borrow_mut().flags.remove(BufFlags::DIRTY);
            self.bc.remove_dirty_node(lba);
        }
        Ok(())
    }

    /// Flushes the whole dirty list.
    pub(crate) fn cache_flush(&mut self) -> CanFail<Ext4Error> {
        for lba in self.bc.dirty_lbas() {
            self.block_flush_lba(lba)?;
        }
        Ok(())
    }

    /// Enables or disables write-back caching. Calls nest; the final
    /// disable flushes the dirty list.
    pub(crate) fn cache_write_back(&mut self, enable: bool) -> CanFail<Ext4Error> {
        if enable {
            self.cache_write_back += 1;
            return Ok(());
        }
        if self.cache_write_back > 0 {
            self.cache_write_back -= 1;
        }
        if self.cache_write_back == 0 {
            self.cache_flush()?;
        }
        Ok(())
    }

    /// Issues a write barrier on the backend.
    pub(crate) fn flush_barrier(&mut self) -> CanFail<Ext4Error> {
        self.dev.flush()
    }

    /// Flushes and drops every cached buffer, then closes the backend.
    pub(crate) fn close(&mut self) -> CanFail<Ext4Error> {
        for lba in self.bc.resident_lbas() {
            self.block_flush_lba(lba)?;
            self.bc.drop_buf(lba);
        }
        self.dev.close()
    }

    pub(crate) fn lock(&mut self) {
        self.dev.lock();
    }

    pub(crate) fn unlock(&mut self) {
        self.dev.unlock();
    }
}

impl core::fmt::Debug for Blockdev {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Blockdev")
            .field("ph_bsize", &self.ph_bsize)
            .field("ph_bcnt", &self.ph_bcnt)
            .field("lg_bsize", &self.lg_bsize)
            .field("lg_bcnt", &self.lg_bcnt)
            .field("bread_ctr", &self.bread_ctr)
            .field("bwrite_ctr", &self.bwrite_ctr)
            .finish()
    }
}
