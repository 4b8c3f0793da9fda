//! ext4 extent-tree implementation.
//!
//! The extent tree replaces the indirect logical block map of `ext2` and
//! `ext3`. The root node is embedded in the 60-byte `i_block` area of
//! the inode; interior and leaf nodes each occupy a single block.
//!
//! Every node begins with an [`ExtentHeader`]. If the node is a leaf
//! (depth 0) the header is followed by [`Ext4Extent`] entries mapping
//! logical block runs to physical blocks; otherwise it is followed by
//! [`Ext4ExtentIdx`] entries pointing to child nodes one level lower.
//! Entries within a node are strictly ordered by their first logical
//! block and do not overlap; every leaf lives at the same depth.
//!
//! The general structure of an on-disk extent block is:
//!
//! ┌─────────────┬────────────────────┬─────────────────────┬──────────────────────────┐
//! │Extent header│ Index node /       │         ...         │       Extent tail        │
//! │             │ Extent (leaf node) │                     │ (checksum of the block)  │
//! └─────────────┴────────────────────┴─────────────────────┴──────────────────────────┘
//!
//! The tail checksum is `crc32c(fs_seed + inode + generation + block)`;
//! the root carried inside the inode is covered by the inode checksum
//! and has no tail.

use alloc::vec::Vec;
use bytemuck::{bytes_of, from_bytes, Pod, Zeroable};
use log::error;

use crate::bcache::Block;
use crate::errors::{CanFail, Ext4Error, FsResult};
use crate::fs::ext4::checksum::crc32c_calc;
use crate::fs::ext4::inode::InodeRef;
use crate::fs::ext4::sb::Superblock;
use crate::fs::ext4::Ext4Fs;

/// Magic number carried by every extent node header.
pub(crate) const EXTENT_MAGIC: u16 = 0xF30A;

/// Maximum number of blocks a single written extent may cover.
pub(crate) const EXT_INIT_MAX_LEN: u16 = 32768;

/// Size of the extent-tree root area inside the inode.
const ROOT_SIZE: usize = 60;

const HDR_SIZE: usize = 12;
const ENTRY_SIZE: usize = 12;

/// Maximum depth of an extent tree.
const MAX_DEPTH: u16 = 5;

/// Header contained in each node of the `ext4` extent tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct ExtentHeader {
    /// Magic number (must be `0xF30A`)
    pub(crate) magic: u16,

    /// Number of valid entries following the header
    pub(crate) entries: u16,

    /// Maximum number of entries that could follow the header
    pub(crate) max: u16,

    /// Depth of this node in the extent tree.
    ///
    /// If `depth == 0`, the entries point to data blocks.
    pub(crate) depth: u16,

    /// Generation of the tree
    pub(crate) generation: u32,
}

const _: () = assert!(core::mem::size_of::<ExtentHeader>() == HDR_SIZE);

impl ExtentHeader {
    pub(crate) fn entries(&self) -> u16 {
        u16::from_le(self.entries)
    }

    pub(crate) fn max(&self) -> u16 {
        u16::from_le(self.max)
    }

    pub(crate) fn depth(&self) -> u16 {
        u16::from_le(self.depth)
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.depth() == 0
    }

    pub(crate) fn is_valid(&self) -> bool {
        u16::from_le(self.magic) == EXTENT_MAGIC && self.depth() <= MAX_DEPTH
    }

    fn new(entries: u16, max: u16, depth: u16) -> Self {
        Self {
            magic: EXTENT_MAGIC.to_le(),
            entries: entries.to_le(),
            max: max.to_le(),
            depth: depth.to_le(),
            generation: 0,
        }
    }
}

/// A leaf node entry: a contiguous run of physical blocks backing a
/// contiguous range of logical file blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct Ext4Extent {
    /// First file block number that this extent covers
    pub(crate) first_block: u32,

    /// Number of blocks covered by the extent.
    ///
    /// If `len > 32768`, the extent is unwritten and the actual length
    /// is `len - 32768`.
    pub(crate) len: u16,

    /// High 16-bits of the block number to which this extent points
    pub(crate) start_hi: u16,

    /// Low 32-bits of the block number to which this extent points
    pub(crate) start_lo: u32,
}

const _: () = assert!(core::mem::size_of::<Ext4Extent>() == ENTRY_SIZE);

impl Ext4Extent {
    pub(crate) fn new(first_block: u32, start: u64, len: u16) -> Self {
        Self {
            first_block: first_block.to_le(),
            len: len.to_le(),
            start_hi: ((start >> 32) as u16).to_le(),
            start_lo: (start as u32).to_le(),
        }
    }

    pub(crate) fn first_block(&self) -> u32 {
        u32::from_le(self.first_block)
    }

    pub(crate) fn set_first_block(&mut self, block: u32) {
        self.first_block = block.to_le();
    }

    /// Number of blocks covered, whether the extent is written or not.
    pub(crate) fn block_count(&self) -> u16 {
        let raw = u16::from_le(self.len);
        if raw <= EXT_INIT_MAX_LEN {
            raw
        } else {
            raw - EXT_INIT_MAX_LEN
        }
    }

    pub(crate) fn set_block_count(&mut self, count: u16) {
        let unwritten = !self.is_written();
        let raw = if unwritten {
            count + EXT_INIT_MAX_LEN
        } else {
            count
        };
        self.len = raw.to_le();
    }

    pub(crate) fn is_written(&self) -> bool {
        u16::from_le(self.len) <= EXT_INIT_MAX_LEN
    }

    /// First physical block of the extent.
    pub(crate) fn start(&self) -> u64 {
        u64::from(u32::from_le(self.start_lo)) | (u64::from(u16::from_le(self.start_hi)) << 32)
    }

    pub(crate) fn set_start(&mut self, start: u64) {
        self.start_lo = (start as u32).to_le();
        self.start_hi = ((start >> 32) as u16).to_le();
    }

    /// Last logical block covered by the extent.
    pub(crate) fn last_block(&self) -> u32 {
        self.first_block() + u32::from(self.block_count()) - 1
    }

    pub(crate) fn contains(&self, lblk: u32) -> bool {
        self.block_count() != 0 && self.first_block() <= lblk && lblk <= self.last_block()
    }
}

/// An interior node entry, pointing to a child node one level lower.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct Ext4ExtentIdx {
    /// This index node covers file blocks from `first_block` onward
    pub(crate) first_block: u32,

    /// Low 32-bits of the block number of the child node
    pub(crate) leaf_lo: u32,

    /// High 16-bits of the block number of the child node
    pub(crate) leaf_hi: u16,

    unused: u16,
}

const _: () = assert!(core::mem::size_of::<Ext4ExtentIdx>() == ENTRY_SIZE);

impl Ext4ExtentIdx {
    fn new(first_block: u32, leaf: u64) -> Self {
        Self {
            first_block: first_block.to_le(),
            leaf_lo: (leaf as u32).to_le(),
            leaf_hi: ((leaf >> 32) as u16).to_le(),
            unused: 0,
        }
    }

    pub(crate) fn first_block(&self) -> u32 {
        u32::from_le(self.first_block)
    }

    pub(crate) fn leaf(&self) -> u64 {
        u64::from(u32::from_le(self.leaf_lo)) | (u64::from(u16::from_le(self.leaf_hi)) << 32)
    }
}

// raw node accessors: every node (the in-inode root included) is a byte
// slice starting with a header followed by 12-byte entries

pub(crate) fn node_header(data: &[u8]) -> ExtentHeader {
    *from_bytes(&data[..HDR_SIZE])
}

fn write_node_header(data: &mut [u8], hdr: ExtentHeader) {
    data[..HDR_SIZE].copy_from_slice(bytes_of(&hdr));
}

pub(crate) fn extent_at(data: &[u8], i: usize) -> Ext4Extent {
    let off = HDR_SIZE + i * ENTRY_SIZE;
    *from_bytes(&data[off..off + ENTRY_SIZE])
}

fn write_extent_at(data: &mut [u8], i: usize, ext: Ext4Extent) {
    let off = HDR_SIZE + i * ENTRY_SIZE;
    data[off..off + ENTRY_SIZE].copy_from_slice(bytes_of(&ext));
}

fn idx_at(data: &[u8], i: usize) -> Ext4ExtentIdx {
    let off = HDR_SIZE + i * ENTRY_SIZE;
    *from_bytes(&data[off..off + ENTRY_SIZE])
}

fn write_idx_at(data: &mut [u8], i: usize, idx: Ext4ExtentIdx) {
    let off = HDR_SIZE + i * ENTRY_SIZE;
    data[off..off + ENTRY_SIZE].copy_from_slice(bytes_of(&idx));
}

/// Shifts entries `[i, entries)` one slot right to make room at `i`.
fn open_entry_slot(data: &mut [u8], i: usize, entries: usize) {
    let from = HDR_SIZE + i * ENTRY_SIZE;
    let to = HDR_SIZE + entries * ENTRY_SIZE;
    data.copy_within(from..to, from + ENTRY_SIZE);
}

/// Shifts entries `[i + 1, entries)` one slot left, dropping entry `i`.
fn close_entry_slot(data: &mut [u8], i: usize, entries: usize) {
    let from = HDR_SIZE + (i + 1) * ENTRY_SIZE;
    let to = HDR_SIZE + entries * ENTRY_SIZE;
    data.copy_within(from..to, from - ENTRY_SIZE);
}

/// First-block key of entry `i` (leaf and index entries share the
/// layout of their first four bytes).
fn key_at(data: &[u8], i: usize) -> u32 {
    let off = HDR_SIZE + i * ENTRY_SIZE;
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

/// Binary search for the last entry with `first_block <= lblk`.
///
/// Returns `None` when every entry key is greater than `lblk` (or the
/// node is empty).
fn search_node(data: &[u8], entries: usize, lblk: u32) -> Option<usize> {
    if entries == 0 || key_at(data, 0) > lblk {
        return None;
    }

    let (mut lo, mut hi) = (0usize, entries - 1);
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if key_at(data, mid) <= lblk {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Some(lo)
}

/// Number of entries fitting in a single-block node, keeping room for
/// the tail checksum when metadata checksumming is on.
fn block_node_max(sb: &Superblock) -> u16 {
    let mut space = sb.blk_size() as usize - HDR_SIZE;
    if sb.has_metadata_csum() {
        space -= 4;
    }
    (space / ENTRY_SIZE) as u16
}

const ROOT_MAX: u16 = ((ROOT_SIZE - HDR_SIZE) / ENTRY_SIZE) as u16;

/// Checksum seed of an inode's metadata blocks:
/// `crc32c(crc32c(fs_seed, inode), generation)`.
fn inode_seed(sb: &Superblock, ino: u32, generation: u32) -> u32 {
    let crc = crc32c_calc(sb.csum_seed(), &ino.to_le_bytes());
    crc32c_calc(crc, &generation.to_le_bytes())
}

fn tail_offset(hdr: &ExtentHeader) -> usize {
    HDR_SIZE + usize::from(hdr.max()) * ENTRY_SIZE
}

fn set_node_csum(sb: &Superblock, ino: u32, generation: u32, data: &mut [u8]) {
    if !sb.has_metadata_csum() {
        return;
    }
    let hdr = node_header(data);
    let off = tail_offset(&hdr);
    let csum = crc32c_calc(inode_seed(sb, ino, generation), &data[..off]);
    data[off..off + 4].copy_from_slice(&csum.to_le_bytes());
}

fn verify_node_csum(sb: &Superblock, ino: u32, generation: u32, data: &[u8]) -> bool {
    if !sb.has_metadata_csum() {
        return true;
    }
    let hdr = node_header(data);
    let off = tail_offset(&hdr);
    if off + 4 > data.len() {
        return false;
    }
    let stored = u32::from_le_bytes(data[off..off + 4].try_into().unwrap());
    crc32c_calc(inode_seed(sb, ino, generation), &data[..off]) == stored
}

/// One level of a root-to-leaf path. `block` is `None` for the root
/// node embedded in the inode.
struct ExtPathItem {
    block: Option<Block>,
    hdr: ExtentHeader,
    /// Entry followed during the descent (last entry with
    /// `first_block <= target`); `None` when the target lies before
    /// every entry of the node.
    pos: Option<usize>,
}

impl ExtPathItem {
    fn with_data<R>(&self, iref: &InodeRef, f: impl FnOnce(&[u8]) -> R) -> R {
        match &self.block {
            None => f(&iref.inode.block),
            Some(b) => f(&b.data()),
        }
    }

    fn with_data_mut<R>(&self, iref: &mut InodeRef, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match &self.block {
            None => f(&mut iref.inode.block),
            Some(b) => f(&mut b.data_mut()),
        }
    }
}

/// Result of a logical-to-physical translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ExtentMapping {
    pub(crate) phys: u64,

    /// Number of mapped blocks from the queried one to the end of the
    /// extent.
    pub(crate) count: u32,

    /// Clear for an unwritten extent: the blocks are allocated but read
    /// as zeroes.
    pub(crate) written: bool,
}

/// Initializes an empty extent tree root inside the inode.
pub(crate) fn extent_tree_init(iref: &mut InodeRef) {
    iref.inode.block = [0u8; 60];
    write_node_header(&mut iref.inode.block, ExtentHeader::new(0, ROOT_MAX, 0));
    iref.dirty = true;
}

/// Marks the node's buffer dirty through the journal, or the inode when
/// the node is the root.
fn dirty_node(fs: &mut Ext4Fs, iref: &mut InodeRef, item: &ExtPathItem) -> CanFail<Ext4Error> {
    match &item.block {
        None => {
            iref.dirty = true;
            Ok(())
        }
        Some(b) => {
            let gen = iref.inode.generation();
            {
                let mut data = b.data_mut();
                set_node_csum(&fs.sb, iref.index, gen, &mut data);
            }
            fs.trans_set_dirty(b)
        }
    }
}

fn put_path(fs: &mut Ext4Fs, path: Vec<ExtPathItem>) -> CanFail<Ext4Error> {
    for item in path {
        if let Some(b) = item.block {
            fs.block_put(b)?;
        }
    }
    Ok(())
}

/// Descends from the root towards `lblk`, validating magic, depth and
/// tail checksums along the way.
fn find_path(fs: &mut Ext4Fs, iref: &InodeRef, lblk: u32) -> FsResult<Vec<ExtPathItem>> {
    let mut path = Vec::new();

    let root_hdr = node_header(&iref.inode.block);
    if !root_hdr.is_valid() {
        error!(target: "ext4", "invalid extent root (inode {})", iref.index);
        return Err(Ext4Error::Corrupted);
    }

    let root_pos = search_node(&iref.inode.block, usize::from(root_hdr.entries()), lblk);
    path.push(ExtPathItem {
        block: None,
        hdr: root_hdr,
        pos: root_pos,
    });

    let mut depth = root_hdr.depth();
    while depth > 0 {
        let (child, parent_hdr) = {
            let item = path.last().unwrap();
            // descend through the leftmost child when the target lies
            // before every key
            let pos = item.pos.unwrap_or(0);
            if item.hdr.entries() == 0 {
                error!(target: "ext4", "empty interior extent node (inode {})", iref.index);
                return Err(Ext4Error::Corrupted);
            }
            let idx = item.with_data(iref, |d| idx_at(d, pos));
            (idx.leaf(), item.hdr)
        };

        let block = fs.trans_block_get(child)?;
        let (hdr, pos, csum_ok) = {
            let data = block.data();
            let hdr = node_header(&data);
            let pos = search_node(&data, usize::from(hdr.entries()), lblk);
            let csum_ok =
                verify_node_csum(&fs.sb, iref.index, iref.inode.generation(), &data);
            (hdr, pos, csum_ok)
        };

        if !csum_ok || !hdr.is_valid() || hdr.depth() != parent_hdr.depth() - 1 {
            error!(
                target: "ext4",
                "corrupted extent node at block {} (inode {})",
                child,
                iref.index
            );
            fs.block_put(block)?;
            put_path(fs, path)?;
            return Err(Ext4Error::Corrupted);
        }

        path.push(ExtPathItem {
            block: Some(block),
            hdr,
            pos,
        });
        depth -= 1;
    }

    Ok(path)
}

/// Translates logical block `lblk`; `None` when it falls in a hole.
pub(crate) fn extent_lookup(
    fs: &mut Ext4Fs,
    iref: &InodeRef,
    lblk: u32,
) -> FsResult<Option<ExtentMapping>> {
    let path = find_path(fs, iref, lblk)?;

    let leaf = path.last().unwrap();
    let mapping = match leaf.pos {
        Some(pos) if leaf.hdr.entries() > 0 => {
            let ext = leaf.with_data(iref, |d| extent_at(d, pos));
            if ext.contains(lblk) {
                let delta = lblk - ext.first_block();
                Some(ExtentMapping {
                    phys: ext.start() + u64::from(delta),
                    count: u32::from(ext.block_count()) - delta,
                    written: ext.is_written(),
                })
            } else {
                None
            }
        }
        _ => None,
    };

    put_path(fs, path)?;
    Ok(mapping)
}

/// Grows the tree by one level: the root's content moves into a fresh
/// block, and the root becomes an index node with a single entry.
fn grow_root(fs: &mut Ext4Fs, iref: &mut InodeRef, goal: u64) -> CanFail<Ext4Error> {
    if node_header(&iref.inode.block).depth() >= MAX_DEPTH {
        return Err(Ext4Error::TooBig);
    }

    let new_block = fs.balloc_alloc_block(goal)?;
    let block = fs.trans_block_get_noread(new_block)?;

    let root_hdr = node_header(&iref.inode.block);
    {
        let mut data = block.data_mut();
        data.fill(0);
        data[..ROOT_SIZE].copy_from_slice(&iref.inode.block);
        let mut hdr = node_header(&data);
        hdr.max = block_node_max(&fs.sb).to_le();
        write_node_header(&mut data, hdr);
        set_node_csum(&fs.sb, iref.index, iref.inode.generation(), &mut data);
    }
    fs.trans_set_dirty(&block)?;

    let first_key = if root_hdr.entries() > 0 {
        key_at(&iref.inode.block, 0)
    } else {
        0
    };

    write_node_header(
        &mut iref.inode.block,
        ExtentHeader::new(1, ROOT_MAX, root_hdr.depth() + 1),
    );
    write_idx_at(
        &mut iref.inode.block,
        0,
        Ext4ExtentIdx::new(first_key, new_block),
    );
    iref.dirty = true;
    iref.inode.adjust_blocks_count(&fs.sb, 1);

    fs.block_put(block)
}

/// Splits the full child node pointed by entry `parent_pos` of
/// `parent`, moving the upper half of its entries into a fresh block.
/// The parent is guaranteed to have room for the new index entry.
fn split_child(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    parent: &ExtPathItem,
    parent_pos: usize,
    child_block: &Block,
    goal: u64,
) -> CanFail<Ext4Error> {
    let new_lba = fs.balloc_alloc_block(goal)?;
    let new_block = fs.trans_block_get_noread(new_lba)?;

    let split_key;
    {
        let mut old = child_block.data_mut();
        let mut new = new_block.data_mut();
        new.fill(0);

        let hdr = node_header(&old);
        let entries = usize::from(hdr.entries());
        let keep = entries / 2;
        let moved = entries - keep;
        split_key = key_at(&old, keep);

        let from = HDR_SIZE + keep * ENTRY_SIZE;
        let to = HDR_SIZE + entries * ENTRY_SIZE;
        new[HDR_SIZE..HDR_SIZE + moved * ENTRY_SIZE].copy_from_slice(&old[from..to]);
        old[from..to].fill(0);

        write_node_header(
            &mut new,
            ExtentHeader::new(moved as u16, hdr.max(), hdr.depth()),
        );
        let mut old_hdr = hdr;
        old_hdr.entries = (keep as u16).to_le();
        write_node_header(&mut old, old_hdr);
    }

    let gen = iref.inode.generation();
    {
        let mut old = child_block.data_mut();
        set_node_csum(&fs.sb, iref.index, gen, &mut old);
    }
    {
        let mut new = new_block.data_mut();
        set_node_csum(&fs.sb, iref.index, gen, &mut new);
    }
    fs.trans_set_dirty(child_block)?;
    fs.trans_set_dirty(&new_block)?;

    // hook the new node into the parent, right after the split child
    parent.with_data_mut(iref, |data| {
        let mut hdr = node_header(data);
        let entries = usize::from(hdr.entries());
        open_entry_slot(data, parent_pos + 1, entries);
        write_idx_at(data, parent_pos + 1, Ext4ExtentIdx::new(split_key, new_lba));
        hdr.entries = (entries as u16 + 1).to_le();
        write_node_header(data, hdr);
    });
    dirty_node(fs, iref, parent)?;
    iref.inode.adjust_blocks_count(&fs.sb, 1);

    fs.block_put(new_block)
}

/// Descends towards `lblk` splitting the shallowest full node on the
/// way (growing the tree when that node is the root), so that the
/// returned leaf always has room for one more entry and every split
/// lands in a parent with a free slot.
fn prepare_insert_path(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    lblk: u32,
    goal: u64,
) -> FsResult<Vec<ExtPathItem>> {
    loop {
        let path = find_path(fs, iref, lblk)?;

        let full_level = (0..path.len())
            .find(|&l| path[l].hdr.entries() >= path[l].hdr.max());

        match full_level {
            None => return Ok(path),
            Some(0) => {
                put_path(fs, path)?;
                grow_root(fs, iref, goal)?;
            }
            Some(l) => {
                let parent_pos = path[l - 1].pos.unwrap_or(0);
                let child = path[l].block.as_ref().unwrap().clone();
                split_child(fs, iref, &path[l - 1], parent_pos, &child, goal)?;
                put_path(fs, path)?;
            }
        }
    }
}

/// Propagates a smaller leftmost key up the path after an insertion at
/// position 0 of the leaf.
fn fixup_first_keys(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    path: &[ExtPathItem],
    lblk: u32,
) -> CanFail<Ext4Error> {
    for level in (0..path.len().saturating_sub(1)).rev() {
        let pos = path[level].pos.unwrap_or(0);
        let key = path[level].with_data(iref, |d| key_at(d, pos));
        if key <= lblk {
            break;
        }
        path[level].with_data_mut(iref, |d| {
            let mut idx = idx_at(d, pos);
            idx.first_block = lblk.to_le();
            write_idx_at(d, pos, idx);
        });
        dirty_node(fs, iref, &path[level])?;
    }
    Ok(())
}

/// Inserts an extent record, merging into the preceding extent when it
/// is logically and physically contiguous and shares the written
/// state.
fn insert_extent(fs: &mut Ext4Fs, iref: &mut InodeRef, new_ext: Ext4Extent) -> CanFail<Ext4Error> {
    let lblk = new_ext.first_block();
    let path = prepare_insert_path(fs, iref, lblk, new_ext.start())?;
    let leaf = path.last().unwrap();

    // try to extend the preceding extent first
    if let Some(pos) = leaf.pos {
        let ext = leaf.with_data(iref, |d| extent_at(d, pos));
        if ext.is_written() == new_ext.is_written()
            && u32::from(ext.block_count()) + u32::from(new_ext.block_count())
                <= u32::from(EXT_INIT_MAX_LEN)
            && ext.first_block() + u32::from(ext.block_count()) == lblk
            && ext.start() + u64::from(ext.block_count()) == new_ext.start()
        {
            leaf.with_data_mut(iref, |d| {
                let mut ext = extent_at(d, pos);
                ext.set_block_count(ext.block_count() + new_ext.block_count());
                write_extent_at(d, pos, ext);
            });
            dirty_node(fs, iref, leaf)?;
            return put_path(fs, path);
        }
    }

    let insert_at = leaf.pos.map_or(0, |p| p + 1);
    leaf.with_data_mut(iref, |d| {
        let mut hdr = node_header(d);
        let entries = usize::from(hdr.entries());
        open_entry_slot(d, insert_at, entries);
        write_extent_at(d, insert_at, new_ext);
        hdr.entries = (entries as u16 + 1).to_le();
        write_node_header(d, hdr);
    });
    dirty_node(fs, iref, leaf)?;

    if insert_at == 0 {
        fixup_first_keys(fs, iref, &path, lblk)?;
    }

    put_path(fs, path)
}

/// Maps `lblk`, allocating a fresh physical block when it falls in a
/// hole. Returns the physical block and whether it was newly allocated.
pub(crate) fn extent_get_block_create(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    lblk: u32,
) -> FsResult<(u64, bool)> {
    if let Some(mapping) = extent_lookup(fs, iref, lblk)? {
        if mapping.written {
            return Ok((mapping.phys, false));
        }
        // an unwritten extent reads as zeroes; carve the target block
        // out of it and fall through to a fresh written allocation, so
        // the remainder keeps reading as zeroes
        extent_remove_space(fs, iref, lblk, lblk)?;
    }

    // goal-directed allocation: right after the closest mapped
    // predecessor when there is one, otherwise near the inode's group
    let goal = {
        let path = find_path(fs, iref, lblk)?;
        let leaf = path.last().unwrap();
        let goal = match leaf.pos {
            Some(pos) if leaf.hdr.entries() > 0 => {
                let ext = leaf.with_data(iref, |d| extent_at(d, pos));
                ext.start() + u64::from(lblk - ext.first_block())
            }
            _ => fs.inode_goal(iref.index),
        };
        put_path(fs, path)?;
        goal
    };

    let phys = fs.balloc_alloc_block(goal)?;
    if let Err(e) = insert_extent(fs, iref, Ext4Extent::new(lblk, phys, 1)) {
        fs.balloc_free_blocks(phys, 1)?;
        return Err(e);
    }

    iref.inode.adjust_blocks_count(&fs.sb, 1);
    iref.dirty = true;
    Ok((phys, true))
}

/// Removes every mapping in the logical range `[from, to]`, freeing the
/// physical blocks. Interior nodes left empty are unlinked and freed;
/// the tree depth shrinks when the root is left with a single child.
pub(crate) fn extent_remove_space(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    from: u32,
    to: u32,
) -> CanFail<Ext4Error> {
    let root_hdr = node_header(&iref.inode.block);
    if !root_hdr.is_valid() {
        return Err(Ext4Error::Corrupted);
    }

    // a strict middle punch splits one extent in two; the right part is
    // re-inserted after the main pass, keeping its written state
    let mut reinsert: Option<Ext4Extent> = None;
    let mut end = to;

    loop {
        let path = find_path(fs, iref, end)?;
        let leaf = path.last().unwrap();

        let Some(mut pos) = leaf.pos else {
            // range lies before every mapping of this leaf
            put_path(fs, path)?;
            break;
        };

        // the smallest key the leaf held before processing bounds the
        // next iteration: every remaining intersecting mapping lies
        // strictly below it
        let min_before = leaf.with_data(iref, |d| {
            let hdr = node_header(d);
            if hdr.entries() > 0 {
                Some(key_at(d, 0))
            } else {
                None
            }
        });

        let mut leaf_exhausted = false;
        loop {
            let entries = leaf.with_data(iref, |d| usize::from(node_header(d).entries()));
            if entries == 0 {
                break;
            }
            let ext = leaf.with_data(iref, |d| extent_at(d, pos));
            let a = ext.first_block();
            let b = ext.last_block();

            if b < from {
                // predecessor of the range: the whole range is done
                leaf_exhausted = true;
                break;
            }

            if a >= from && b <= end {
                // fully covered: free and drop the entry
                fs.balloc_free_blocks(ext.start(), u64::from(ext.block_count()))?;
                leaf.with_data_mut(iref, |d| {
                    let mut hdr = node_header(d);
                    close_entry_slot(d, pos, usize::from(hdr.entries()));
                    hdr.entries = (hdr.entries() - 1).to_le();
                    write_node_header(d, hdr);
                });
                dirty_node(fs, iref, leaf)?;
                iref.inode.adjust_blocks_count(&fs.sb, -i64::from(ext.block_count()));
            } else if a < from && b <= end {
                // tail truncation
                let keep = from - a;
                fs.balloc_free_blocks(
                    ext.start() + u64::from(keep),
                    u64::from(ext.block_count()) - u64::from(keep),
                )?;
                leaf.with_data_mut(iref, |d| {
                    let mut ext = extent_at(d, pos);
                    ext.set_block_count(keep as u16);
                    write_extent_at(d, pos, ext);
                });
                dirty_node(fs, iref, leaf)?;
                iref.inode
                    .adjust_blocks_count(&fs.sb, -(i64::from(ext.block_count()) - i64::from(keep)));
                leaf_exhausted = true;
            } else if a >= from && b > end {
                // head cut
                let cut = end - a + 1;
                fs.balloc_free_blocks(ext.start(), u64::from(cut))?;
                leaf.with_data_mut(iref, |d| {
                    let mut ext = extent_at(d, pos);
                    ext.set_first_block(end + 1);
                    ext.set_start(ext.start() + u64::from(cut));
                    ext.set_block_count(ext.block_count() - cut as u16);
                    write_extent_at(d, pos, ext);
                });
                dirty_node(fs, iref, leaf)?;
                fixup_first_keys(fs, iref, &path, end + 1)?;
                iref.inode.adjust_blocks_count(&fs.sb, -i64::from(cut));
            } else {
                // strict middle punch: keep [a, from - 1], free
                // [from, end], re-insert [end + 1, b] afterwards. The
                // fragment keeps the original's unwritten encoding.
                let middle = end - from + 1;
                let mut right = ext;
                right.set_first_block(end + 1);
                right.set_start(ext.start() + u64::from(end + 1 - a));
                right.set_block_count((b - end) as u16);
                reinsert = Some(right);
                fs.balloc_free_blocks(ext.start() + u64::from(from - a), u64::from(middle))?;
                leaf.with_data_mut(iref, |d| {
                    let mut ext = extent_at(d, pos);
                    ext.set_block_count((from - a) as u16);
                    write_extent_at(d, pos, ext);
                });
                dirty_node(fs, iref, leaf)?;
                iref.inode.adjust_blocks_count(&fs.sb, -i64::from(middle));
                leaf_exhausted = true;
            }

            if pos == 0 {
                break;
            }
            pos -= 1;
        }

        put_path(fs, path)?;
        prune_empty_nodes(fs, iref)?;

        if leaf_exhausted {
            break;
        }
        match min_before {
            Some(k) if k > from && k > 0 => end = k - 1,
            _ => break,
        }
    }

    if let Some(right) = reinsert {
        // the punch split an extent: restore its right part as a single
        // record; the blocks stay allocated, so the inode's block count
        // is unchanged
        insert_extent(fs, iref, right)?;
    }

    shrink_root(fs, iref)
}

/// Walks the tree and unlinks interior/leaf blocks left without
/// entries.
fn prune_empty_nodes(fs: &mut Ext4Fs, iref: &mut InodeRef) -> CanFail<Ext4Error> {
    loop {
        let mut freed_any = false;

        // find a path to some empty non-root node by walking down the
        // leftmost chain of each entry; a linear scan is enough, trees
        // are shallow
        let root_hdr = node_header(&iref.inode.block);
        if root_hdr.depth() == 0 {
            return Ok(());
        }

        let mut entry = 0usize;
        while entry < usize::from(node_header(&iref.inode.block).entries()) {
            let idx = idx_at(&iref.inode.block, entry);
            let freed = prune_subtree(fs, iref, idx.leaf(), root_hdr.depth() - 1)?;
            if freed {
                let entries = usize::from(node_header(&iref.inode.block).entries());
                close_entry_slot(&mut iref.inode.block, entry, entries);
                let mut hdr = node_header(&iref.inode.block);
                hdr.entries = (hdr.entries() - 1).to_le();
                write_node_header(&mut iref.inode.block, hdr);
                iref.dirty = true;
                freed_any = true;
            } else {
                entry += 1;
            }
        }

        if !freed_any {
            return Ok(());
        }
    }
}

/// Frees the subtree rooted at `lba` when it contains no mappings.
/// Returns whether the node was freed (and must be unlinked by the
/// caller).
fn prune_subtree(fs: &mut Ext4Fs, iref: &mut InodeRef, lba: u64, depth: u16) -> FsResult<bool> {
    let block = fs.trans_block_get(lba)?;
    let hdr = {
        let data = block.data();
        node_header(&data)
    };

    if !hdr.is_valid() || hdr.depth() != depth {
        fs.block_put(block)?;
        return Err(Ext4Error::Corrupted);
    }

    if depth > 0 {
        let mut entry = 0usize;
        while entry < usize::from(node_header(&block.data()).entries()) {
            let idx = {
                let data = block.data();
                idx_at(&data, entry)
            };
            if prune_subtree(fs, iref, idx.leaf(), depth - 1)? {
                {
                    let mut data = block.data_mut();
                    let mut hdr = node_header(&data);
                    close_entry_slot(&mut data, entry, usize::from(hdr.entries()));
                    hdr.entries = (hdr.entries() - 1).to_le();
                    write_node_header(&mut data, hdr);
                    let gen = iref.inode.generation();
                    set_node_csum(&fs.sb, iref.index, gen, &mut data);
                }
                fs.trans_set_dirty(&block)?;
            } else {
                entry += 1;
            }
        }
    }

    let empty = {
        let data = block.data();
        node_header(&data).entries() == 0
    };

    fs.block_put(block)?;

    if empty {
        fs.balloc_free_blocks(lba, 1)?;
        iref.inode.adjust_blocks_count(&fs.sb, -1);
        iref.dirty = true;
    }
    Ok(empty)
}

/// Decreases the tree depth while the root holds a single child whose
/// content fits in the inode.
fn shrink_root(fs: &mut Ext4Fs, iref: &mut InodeRef) -> CanFail<Ext4Error> {
    loop {
        let root_hdr = node_header(&iref.inode.block);
        if root_hdr.depth() == 0 || root_hdr.entries() != 1 {
            return Ok(());
        }

        let child_lba = idx_at(&iref.inode.block, 0).leaf();
        let block = fs.trans_block_get(child_lba)?;
        let child_hdr = {
            let data = block.data();
            node_header(&data)
        };

        if child_hdr.entries() > ROOT_MAX {
            fs.block_put(block)?;
            return Ok(());
        }

        {
            let data = block.data();
            let used = HDR_SIZE + usize::from(child_hdr.entries()) * ENTRY_SIZE;
            iref.inode.block[..used].copy_from_slice(&data[..used]);
            iref.inode.block[used..].fill(0);
        }
        let mut hdr = child_hdr;
        hdr.max = ROOT_MAX.to_le();
        write_node_header(&mut iref.inode.block, hdr);
        iref.dirty = true;

        fs.block_put(block)?;
        fs.balloc_free_blocks(child_lba, 1)?;
        iref.inode.adjust_blocks_count(&fs.sb, -1);
    }
}

/// Walks every leaf extent of the tree in logical order. Exposed for
/// consistency checking.
pub(crate) fn extent_walk(fs: &mut Ext4Fs, iref: &InodeRef) -> FsResult<Vec<Ext4Extent>> {
    let mut extents = Vec::new();
    let root_hdr = node_header(&iref.inode.block);
    if !root_hdr.is_valid() {
        return Err(Ext4Error::Corrupted);
    }
    walk_node(fs, iref, None, root_hdr.depth(), &mut extents)?;
    Ok(extents)
}

fn walk_node(
    fs: &mut Ext4Fs,
    iref: &InodeRef,
    lba: Option<u64>,
    depth: u16,
    out: &mut Vec<Ext4Extent>,
) -> CanFail<Ext4Error> {
    let block = match lba {
        None => None,
        Some(lba) => Some(fs.trans_block_get(lba)?),
    };

    let read_node = |f: &mut dyn FnMut(&[u8])| match &block {
        None => f(&iref.inode.block),
        Some(b) => f(&b.data()),
    };

    let mut children = Vec::new();
    let mut read = |data: &[u8]| {
        let hdr = node_header(data);
        for i in 0..usize::from(hdr.entries()) {
            if depth == 0 {
                out.push(extent_at(data, i));
            } else {
                children.push(idx_at(data, i).leaf());
            }
        }
    };
    read_node(&mut read);

    if let Some(b) = block {
        fs.block_put(b)?;
    }

    for child in children {
        walk_node(fs, iref, Some(child), depth - 1, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let hdr = ExtentHeader::new(3, 4, 0);
        let raw: [u8; 12] = bytes_of(&hdr).try_into().unwrap();
        assert_eq!(u16::from_le_bytes([raw[0], raw[1]]), EXTENT_MAGIC);
        assert_eq!(u16::from_le_bytes([raw[2], raw[3]]), 3);
    }

    #[test]
    fn extent_unwritten_length() {
        let mut ext = Ext4Extent::new(0, 100, 10);
        assert!(ext.is_written());
        assert_eq!(ext.block_count(), 10);

        ext.len = (EXT_INIT_MAX_LEN + 7).to_le();
        assert!(!ext.is_written());
        assert_eq!(ext.block_count(), 7);

        // resizing keeps the unwritten encoding, so a split fragment
        // inherits the state of the extent it came from
        ext.set_block_count(3);
        assert!(!ext.is_written());
        assert_eq!(ext.block_count(), 3);
    }

    #[test]
    fn node_search_is_last_leq() {
        let mut data = [0u8; 60];
        write_node_header(&mut data, ExtentHeader::new(3, 4, 0));
        write_extent_at(&mut data, 0, Ext4Extent::new(10, 1000, 5));
        write_extent_at(&mut data, 1, Ext4Extent::new(20, 2000, 5));
        write_extent_at(&mut data, 2, Ext4Extent::new(30, 3000, 5));

        assert_eq!(search_node(&data, 3, 5), None);
        assert_eq!(search_node(&data, 3, 10), Some(0));
        assert_eq!(search_node(&data, 3, 19), Some(0));
        assert_eq!(search_node(&data, 3, 25), Some(1));
        assert_eq!(search_node(&data, 3, 90), Some(2));
    }

    #[test]
    fn entry_slot_shifts() {
        let mut data = [0u8; 60];
        write_node_header(&mut data, ExtentHeader::new(2, 4, 0));
        write_extent_at(&mut data, 0, Ext4Extent::new(0, 100, 1));
        write_extent_at(&mut data, 1, Ext4Extent::new(8, 200, 1));

        open_entry_slot(&mut data, 1, 2);
        write_extent_at(&mut data, 1, Ext4Extent::new(4, 150, 1));
        assert_eq!(extent_at(&data, 0).first_block(), 0);
        assert_eq!(extent_at(&data, 1).first_block(), 4);
        assert_eq!(extent_at(&data, 2).first_block(), 8);

        close_entry_slot(&mut data, 1, 3);
        assert_eq!(extent_at(&data, 1).first_block(), 8);
    }
}
