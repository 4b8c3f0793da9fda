//! Block cache.
//!
//! The cache maps a physical LBA to a single canonical buffer: at most one
//! buffer per LBA exists at any instant. Buffers are indexed twice, by LBA
//! (all buffers) and by LRU id (only unreferenced buffers), with a
//! separate list tracking dirty buffers that are ready to be written out.
//! Referenced buffers only live in the LBA index.
//!
//! This is the only path through which on-disk data is read or mutated:
//! the superblock, descriptor tables, bitmaps, inode tables, directory
//! blocks and extent nodes all travel through [`Block`] handles. The
//! policy half of buffer release (write-back queuing, synchronous flush,
//! eviction) lives in [`crate::blockdev::Blockdev`], which owns both the
//! cache and the device.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::{Ref, RefCell, RefMut};

/// Buffer state flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BufFlags(u8);

impl BufFlags {
    /// Buffer contains valid data.
    pub(crate) const UPTODATE: Self = Self(1 << 0);

    /// Buffer content differs from the on-disk block.
    pub(crate) const DIRTY: Self = Self(1 << 1);

    /// Buffer will be flushed synchronously as soon as no one references
    /// it, bypassing the write-back dirty list.
    pub(crate) const FLUSH: Self = Self(1 << 2);

    /// Buffer will be dropped once its reference count reaches zero.
    pub(crate) const TMP: Self = Self(1 << 3);

    pub(crate) fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// A single cached buffer, sized to one filesystem block.
#[derive(Debug)]
pub(crate) struct Buf {
    /// Physical block address of the cached block.
    pub(crate) lba: u64,

    /// Block-sized data buffer.
    pub(crate) data: Vec<u8>,

    pub(crate) flags: BufFlags,

    /// LRU sequence number, assigned on every acquisition.
    pub(crate) lru_id: u32,

    /// Number of live [`Block`] handles over this buffer.
    pub(crate) refctr: u32,

    /// Whether the buffer currently sits on the dirty list.
    pub(crate) on_dirty_list: bool,
}

/// A reference-counted handle over a cached buffer.
///
/// Holding a `Block` pins the buffer in the cache: it cannot be evicted
/// and will not be handed to the LRU index until every handle has been
/// returned through [`crate::blockdev::Blockdev::block_set`]. Cloning the
/// handle is how a journal transaction pins the buffers it owns.
#[derive(Clone, Debug)]
pub struct Block {
    pub(crate) buf: Rc<RefCell<Buf>>,
}

impl Block {
    /// Physical block address of the underlying buffer.
    pub fn lba(&self) -> u64 {
        self.buf.borrow().lba
    }

    /// Immutable view of the block data.
    pub fn data(&self) -> Ref<'_, [u8]> {
        Ref::map(self.buf.borrow(), |b| b.data.as_slice())
    }

    /// Mutable view of the block data.
    ///
    /// Mutating the data does not mark the buffer dirty; callers go
    /// through the transaction layer for that.
    pub fn data_mut(&self) -> RefMut<'_, [u8]> {
        RefMut::map(self.buf.borrow_mut(), |b| b.data.as_mut_slice())
    }

    pub(crate) fn flags(&self) -> BufFlags {
        self.buf.borrow().flags
    }

    pub(crate) fn set_flag(&self, f: BufFlags) {
        self.buf.borrow_mut().flags.insert(f);
    }

    pub(crate) fn clear_flag(&self, f: BufFlags) {
        self.buf.borrow_mut().flags.remove(f);
    }

    /// Marks the buffer as holding valid, modified data.
    pub(crate) fn set_dirty(&self) {
        let mut b = self.buf.borrow_mut();
        b.flags.insert(BufFlags::UPTODATE);
        b.flags.insert(BufFlags::DIRTY);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.flags().contains(BufFlags::DIRTY)
    }

    pub(crate) fn is_uptodate(&self) -> bool {
        self.flags().contains(BufFlags::UPTODATE)
    }
}

/// Block cache descriptor.
#[derive(Debug, Default)]
pub(crate) struct BlockCache {
    /// Buffer capacity.
    pub(crate) cnt: u32,

    /// Size of a single buffer, in bytes.
    pub(crate) itemsize: u32,

    /// Last-recently-used counter.
    pub(crate) lru_ctr: u32,

    /// Buffers currently resident.
    pub(crate) ref_blocks: u32,

    /// High-water mark of resident buffers.
    pub(crate) max_ref_blocks: u32,

    /// When set, the cache must not be shaken: eviction is disabled for
    /// the duration of a critical section (journal recovery).
    pub(crate) dont_shake: bool,

    /// All resident buffers, keyed by LBA.
    lba_root: BTreeMap<u64, Rc<RefCell<Buf>>>,

    /// Unreferenced buffers, keyed by LRU id.
    lru_root: BTreeMap<u32, u64>,

    /// Dirty buffers ready to be written out.
    dirty_list: BTreeSet<u64>,
}

impl BlockCache {
    pub(crate) fn new(cnt: u32, itemsize: u32) -> Self {
        Self {
            cnt,
            itemsize,
            ..Default::default()
        }
    }

    /// Changes the buffer size. Only legal while the cache is empty
    /// (mount time, before any block has been read).
    pub(crate) fn set_itemsize(&mut self, itemsize: u32) {
        debug_assert!(self.lba_root.is_empty());
        self.itemsize = itemsize;
    }

    pub(crate) fn is_full(&self) -> bool {
        self.ref_blocks >= self.cnt
    }

    /// Looks a buffer up without allocating. On a hit the reference count
    /// is incremented and the buffer leaves the LRU index and the dirty
    /// list.
    pub(crate) fn find_get(&mut self, lba: u64) -> Option<Block> {
        let rc = self.lba_root.get(&lba)?.clone();
        {
            let mut buf = rc.borrow_mut();
            if buf.refctr == 0 {
                self.lru_root.remove(&buf.lru_id);
                self.lru_ctr += 1;
                buf.lru_id = self.lru_ctr;
                if buf.flags.contains(BufFlags::DIRTY) && buf.on_dirty_list {
                    self.dirty_list.remove(&lba);
                    buf.on_dirty_list = false;
                }
            }
            buf.refctr += 1;
        }
        Some(Block { buf: rc })
    }

    /// Allocates a buffer for `lba`, or returns the existing one. The
    /// boolean is true when the buffer is new and must be filled by the
    /// caller. The caller is responsible for making room first; exceeding
    /// the configured capacity is tolerated while every buffer is pinned.
    pub(crate) fn alloc(&mut self, lba: u64) -> (Block, bool) {
        if let Some(b) = self.find_get(lba) {
            return (b, false);
        }

        self.lru_ctr += 1;
        let buf = Rc::new(RefCell::new(Buf {
            lba,
            data: vec![0u8; self.itemsize as usize],
            flags: BufFlags::default(),
            lru_id: self.lru_ctr,
            refctr: 1,
            on_dirty_list: false,
        }));

        self.lba_root.insert(lba, buf.clone());
        self.ref_blocks += 1;
        if self.max_ref_blocks < self.ref_blocks {
            self.max_ref_blocks = self.ref_blocks;
        }

        (Block { buf }, true)
    }

    /// Takes an additional reference on an already pinned buffer.
    /// Used when a transaction clones a block handle to pin it past the
    /// acquirer's release.
    pub(crate) fn inc_ref(&mut self, block: &Block) {
        let mut buf = block.buf.borrow_mut();
        debug_assert!(buf.refctr > 0);
        buf.refctr += 1;
    }

    /// Decrements the reference count of the buffer behind `block` and
    /// consumes the handle. When the count reaches zero the buffer is
    /// reinserted into the LRU index and the new count (0) is returned;
    /// the caller then applies the release policy.
    pub(crate) fn dec_ref(&mut self, block: &Block) -> u32 {
        let mut buf = block.buf.borrow_mut();
        debug_assert!(buf.refctr > 0);
        buf.refctr -= 1;
        if buf.refctr == 0 {
            self.lru_root.insert(buf.lru_id, buf.lba);
        }
        buf.refctr
    }

    /// Buffer with the lowest LRU sequence, eviction candidate.
    pub(crate) fn lowest_lru(&self) -> Option<u64> {
        self.lru_root.values().next().copied()
    }

    /// Drops an unreferenced buffer from the cache.
    pub(crate) fn drop_buf(&mut self, lba: u64) {
        let Some(rc) = self.lba_root.get(&lba) else {
            return;
        };
        {
            let buf = rc.borrow();
            if buf.refctr != 0 {
                log::warn!(
                    target: "ext4-bcache",
                    "buffer is still referenced, lba = {}, refctr = {}",
                    buf.lba,
                    buf.refctr
                );
            } else {
                self.lru_root.remove(&buf.lru_id);
            }
            if buf.flags.contains(BufFlags::DIRTY) && buf.on_dirty_list {
                self.dirty_list.remove(&lba);
            }
        }
        self.lba_root.remove(&lba);
        self.ref_blocks -= 1;
    }

    /// Clears the DIRTY and UPTODATE flags of a single buffer, so that
    /// its stale content can never be written back.
    pub(crate) fn invalidate_buf(&mut self, lba: u64) {
        if let Some(rc) = self.lba_root.get(&lba) {
            let mut buf = rc.borrow_mut();
            if buf.flags.contains(BufFlags::DIRTY) && buf.on_dirty_list {
                self.dirty_list.remove(&lba);
                buf.on_dirty_list = false;
            }
            buf.flags.remove(BufFlags::DIRTY);
            buf.flags.remove(BufFlags::UPTODATE);
        }
    }

    /// Invalidates every buffer whose LBA lies in `[from, from + cnt)`.
    ///
    /// Used when freeing on-disk blocks: they may be reallocated at any
    /// point, and a stale cached copy must not overwrite the new content.
    pub(crate) fn invalidate_range(&mut self, from: u64, cnt: u64) {
        let lbas: Vec<u64> = self
            .lba_root
            .range(from..from + cnt)
            .map(|(&l, _)| l)
            .collect();
        for lba in lbas {
            self.invalidate_buf(lba);
        }
    }

    pub(crate) fn insert_dirty_node(&mut self, block: &Block) {
        let mut buf = block.buf.borrow_mut();
        if !buf.on_dirty_list {
            self.dirty_list.insert(buf.lba);
            buf.on_dirty_list = true;
        }
    }

    pub(crate) fn remove_dirty_node(&mut self, lba: u64) {
        if let Some(rc) = self.lba_root.get(&lba) {
            let mut buf = rc.borrow_mut();
            if buf.on_dirty_list {
                self.dirty_list.remove(&lba);
                buf.on_dirty_list = false;
            }
        }
    }

    /// Snapshot of the dirty list, in LBA order.
    pub(crate) fn dirty_lbas(&self) -> Vec<u64> {
        self.dirty_list.iter().copied().collect()
    }

    /// Every resident LBA, in order. Used by the unmount path.
    pub(crate) fn resident_lbas(&self) -> Vec<u64> {
        self.lba_root.keys().copied().collect()
    }

    pub(crate) fn get_rc(&self, lba: u64) -> Option<Rc<RefCell<Buf>>> {
        self.lba_root.get(&lba).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(bc: &mut BlockCache, lba: u64) -> Block {
        let (b, _) = bc.alloc(lba);
        b
    }

    fn put(bc: &mut BlockCache, b: Block) {
        bc.dec_ref(&b);
        drop(b);
    }

    #[test]
    fn one_buffer_per_lba() {
        let mut bc = BlockCache::new(4, 512);
        let a = get(&mut bc, 7);
        let b = get(&mut bc, 7);
        assert!(Rc::ptr_eq(&a.buf, &b.buf));
        assert_eq!(bc.ref_blocks, 1);
        assert_eq!(a.buf.borrow().refctr, 2);
        put(&mut bc, a);
        put(&mut bc, b);
    }

    #[test]
    fn lru_orders_unreferenced_buffers() {
        let mut bc = BlockCache::new(4, 512);
        let a = get(&mut bc, 1);
        let b = get(&mut bc, 2);
        let c = get(&mut bc, 3);
        put(&mut bc, b);
        put(&mut bc, a);
        put(&mut bc, c);
        // LRU ids are assigned at acquisition: buffer 1 came first
        assert_eq!(bc.lowest_lru(), Some(1));
        // touching it reassigns its id and moves it to the back
        let a = bc.find_get(1).unwrap();
        put(&mut bc, a);
        assert_eq!(bc.lowest_lru(), Some(2));
    }

    #[test]
    fn referenced_buffers_are_not_eviction_candidates() {
        let mut bc = BlockCache::new(2, 512);
        let a = get(&mut bc, 1);
        assert_eq!(bc.lowest_lru(), None);
        put(&mut bc, a);
        assert_eq!(bc.lowest_lru(), Some(1));
    }

    #[test]
    fn invalidate_range_clears_state() {
        let mut bc = BlockCache::new(8, 512);
        for lba in [5u64, 6, 7, 20] {
            let b = get(&mut bc, lba);
            b.set_dirty();
            bc.insert_dirty_node(&b);
            put(&mut bc, b);
        }
        bc.invalidate_range(5, 3);
        for lba in [5u64, 6, 7] {
            let rc = bc.get_rc(lba).unwrap();
            assert_eq!(rc.borrow().flags, BufFlags::default());
        }
        // the out-of-range buffer is untouched
        let rc = bc.get_rc(20).unwrap();
        assert!(rc.borrow().flags.contains(BufFlags::DIRTY));
        assert_eq!(bc.dirty_lbas(), alloc::vec![20]);
    }

    #[test]
    fn drop_removes_dirty_node() {
        let mut bc = BlockCache::new(2, 512);
        let a = get(&mut bc, 9);
        a.set_dirty();
        bc.insert_dirty_node(&a);
        put(&mut bc, a);
        bc.drop_buf(9);
        assert!(bc.dirty_lbas().is_empty());
        assert_eq!(bc.ref_blocks, 0);
    }
}
