//! `ext4` directory handling (linear layout).
//!
//! A directory inode contains a sequence of variable-length records
//! packed into blocks; `rec_len` chains the records within one block and
//! trailing free space is absorbed by the preceding entry. Hash-indexed
//! directories keep the same record format in their leaf blocks and are
//! handled by [`crate::fs::ext4::dir_idx`] on top of this module.

use alloc::vec::Vec;
use log::error;

use crate::errors::{CanFail, Ext4Error, FsResult};
use crate::fs::ext4::checksum::crc32c_calc;
use crate::fs::ext4::dir_idx;
use crate::fs::ext4::inode::{InodeFlags, InodeRef};
use crate::fs::ext4::sb::{CompatibleFeatureSet, Superblock};
use crate::fs::ext4::Ext4Fs;

/// File type codes stored in directory entries.
pub mod file_type {
    pub const UNKNOWN: u8 = 0;
    pub const REGULAR: u8 = 1;
    pub const DIRECTORY: u8 = 2;
    pub const CHARDEV: u8 = 3;
    pub const BLOCKDEV: u8 = 4;
    pub const FIFO: u8 = 5;
    pub const SOCKET: u8 = 6;
    pub const SYMLINK: u8 = 7;
}

/// Fixed part of a directory entry record.
pub(crate) const DE_HEADER: usize = 8;

/// Size of the checksum tail record closing each directory block.
pub(crate) const DE_TAIL: usize = 12;

/// Marker stored in the `file_type` slot of the tail record.
const DE_TAIL_FT: u8 = 0xDE;

/// Longest permitted file name.
pub(crate) const MAX_NAME_LEN: usize = 255;

/// A directory entry surfaced to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub file_type: u8,
    pub name: Vec<u8>,
}

/// On-disk footprint of an entry holding a `name_len`-byte name.
pub(crate) fn required_len(name_len: usize) -> usize {
    (DE_HEADER + name_len + 3) & !3
}

pub(crate) fn entry_inode(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

pub(crate) fn entry_rec_len(data: &[u8], off: usize) -> usize {
    u16::from_le_bytes(data[off + 4..off + 6].try_into().unwrap()) as usize
}

pub(crate) fn entry_name_len(data: &[u8], off: usize) -> usize {
    data[off + 6] as usize
}

pub(crate) fn entry_file_type(data: &[u8], off: usize) -> u8 {
    data[off + 7]
}

pub(crate) fn entry_name<'d>(data: &'d [u8], off: usize) -> &'d [u8] {
    &data[off + DE_HEADER..off + DE_HEADER + entry_name_len(data, off)]
}

pub(crate) fn write_entry(
    data: &mut [u8],
    off: usize,
    inode: u32,
    rec_len: usize,
    name: &[u8],
    ftype: u8,
) {
    data[off..off + 4].copy_from_slice(&inode.to_le_bytes());
    data[off + 4..off + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
    data[off + 6] = name.len() as u8;
    data[off + 7] = ftype;
    data[off + DE_HEADER..off + DE_HEADER + name.len()].copy_from_slice(name);
}

fn set_entry_inode(data: &mut [u8], off: usize, inode: u32) {
    data[off..off + 4].copy_from_slice(&inode.to_le_bytes());
}

fn set_entry_rec_len(data: &mut [u8], off: usize, rec_len: usize) {
    data[off + 4..off + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
}

/// Usable payload length of a directory block (the checksum tail is
/// reserved when metadata checksums are on).
pub(crate) fn usable_block_len(sb: &Superblock) -> usize {
    let bsize = sb.blk_size() as usize;
    if sb.has_metadata_csum() {
        bsize - DE_TAIL
    } else {
        bsize
    }
}

/// Whether the block ends with a checksum tail record.
fn has_tail(data: &[u8]) -> bool {
    let off = data.len() - DE_TAIL;
    entry_inode(data, off) == 0
        && entry_rec_len(data, off) == DE_TAIL
        && data[off + 7] == DE_TAIL_FT
}

/// Directory-block checksum: `crc32c(inode_seed, block without tail)`.
fn dir_block_csum(sb: &Superblock, ino: u32, generation: u32, data: &[u8]) -> u32 {
    let mut seed = crc32c_calc(sb.csum_seed(), &ino.to_le_bytes());
    seed = crc32c_calc(seed, &generation.to_le_bytes());
    crc32c_calc(seed, &data[..data.len() - DE_TAIL])
}

/// Installs (or refreshes) the checksum tail of a linear directory
/// block.
pub(crate) fn set_dir_block_csum(sb: &Superblock, ino: u32, generation: u32, data: &mut [u8]) {
    if !sb.has_metadata_csum() {
        return;
    }

    let len = data.len();
    let tail = len - DE_TAIL;
    data[tail..tail + 4].fill(0);
    set_entry_rec_len(data, tail, DE_TAIL);
    data[tail + 6] = 0;
    data[tail + 7] = DE_TAIL_FT;

    let csum = dir_block_csum(sb, ino, generation, data);
    data[len - 4..].copy_from_slice(&csum.to_le_bytes());
}

/// Validates the checksum tail of a directory block, when present.
pub(crate) fn verify_dir_block_csum(
    sb: &Superblock,
    ino: u32,
    generation: u32,
    data: &[u8],
) -> CanFail<Ext4Error> {
    if !sb.has_metadata_csum() || !has_tail(data) {
        return Ok(());
    }

    let stored = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
    if dir_block_csum(sb, ino, generation, data) != stored {
        error!(target: "ext4", "invalid directory block checksum (inode {})", ino);
        return Err(Ext4Error::Corrupted);
    }
    Ok(())
}

/// Scans one block for `name`. Returns the entry offset.
pub(crate) fn find_in_block(data: &[u8], usable: usize, name: &[u8]) -> Option<usize> {
    let mut off = 0;
    while off + DE_HEADER <= usable {
        let rec_len = entry_rec_len(data, off);
        if rec_len < DE_HEADER
            || off + rec_len > usable
            || DE_HEADER + entry_name_len(data, off) > rec_len
        {
            return None;
        }
        if entry_inode(data, off) != 0 && entry_name(data, off) == name {
            return Some(off);
        }
        off += rec_len;
    }
    None
}

/// Inserts an entry into one block, splitting the first record with
/// enough trailing free space. Returns false when the block is full.
pub(crate) fn add_to_block(
    data: &mut [u8],
    usable: usize,
    name: &[u8],
    ino: u32,
    ftype: u8,
) -> bool {
    let needed = required_len(name.len());
    let mut off = 0;

    while off + DE_HEADER <= usable {
        let rec_len = entry_rec_len(data, off);
        if rec_len < DE_HEADER || off + rec_len > usable {
            return false;
        }

        let inode = entry_inode(data, off);
        let used = if inode == 0 {
            0
        } else {
            required_len(entry_name_len(data, off))
        };

        if rec_len - used >= needed {
            if inode == 0 {
                // reuse the free record in place
                write_entry(data, off, ino, rec_len, name, ftype);
            } else {
                // split: the existing entry shrinks to its real
                // footprint, the remainder becomes the new entry
                set_entry_rec_len(data, off, used);
                write_entry(data, off + used, ino, rec_len - used, name, ftype);
            }
            return true;
        }

        off += rec_len;
    }
    false
}

/// Removes `name` from one block by coalescing its record into the
/// previous one. Returns false when the name is not there.
pub(crate) fn remove_from_block(data: &mut [u8], usable: usize, name: &[u8]) -> bool {
    let mut off = 0;
    let mut prev: Option<usize> = None;

    while off + DE_HEADER <= usable {
        let rec_len = entry_rec_len(data, off);
        if rec_len < DE_HEADER || off + rec_len > usable {
            return false;
        }

        if entry_inode(data, off) != 0 && entry_name(data, off) == name {
            match prev {
                Some(p) => {
                    let merged = entry_rec_len(data, p) + rec_len;
                    set_entry_rec_len(data, p, merged);
                }
                None => set_entry_inode(data, off, 0),
            }
            return true;
        }

        prev = Some(off);
        off += rec_len;
    }
    false
}

/// Lays out a fresh directory block holding a single free record
/// covering the whole usable area.
pub(crate) fn init_free_block(data: &mut [u8], usable: usize) {
    data.fill(0);
    set_entry_rec_len(data, 0, usable);
}

/// Number of blocks a directory currently occupies.
pub(crate) fn dir_block_count(fs: &Ext4Fs, iref: &InodeRef) -> u32 {
    let bsize = u64::from(fs.sb.blk_size());
    ((iref.inode.size() + bsize - 1) / bsize) as u32
}

/// Initializes a fresh directory with its `.` and `..` entries.
pub(crate) fn dir_init(fs: &mut Ext4Fs, iref: &mut InodeRef, parent_ino: u32) -> CanFail<Ext4Error> {
    let usable = usable_block_len(&fs.sb);
    let bsize = fs.sb.blk_size();

    let (lba, _) = fs.inode_block_create(iref, 0)?;
    let block = fs.trans_block_get_noread(lba)?;
    {
        let mut data = block.data_mut();
        init_free_block(&mut data, usable);

        let dot_len = required_len(1);
        write_entry(&mut data, 0, iref.index, dot_len, b".", file_type::DIRECTORY);
        write_entry(
            &mut data,
            dot_len,
            parent_ino,
            usable - dot_len,
            b"..",
            file_type::DIRECTORY,
        );
        let gen = iref.inode.generation();
        set_dir_block_csum(&fs.sb, iref.index, gen, &mut data);
    }
    fs.trans_set_dirty(&block)?;
    fs.block_put(block)?;

    iref.inode.set_size(u64::from(bsize));
    iref.dirty = true;
    Ok(())
}

/// Looks `name` up in the directory, through the hash index when the
/// directory carries one.
pub(crate) fn dir_find_entry(
    fs: &mut Ext4Fs,
    iref: &InodeRef,
    name: &[u8],
) -> FsResult<Option<DirEntry>> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Ext4Error::InvalidArgument);
    }

    if iref.inode.flags().includes(InodeFlags::INDEX_FL) {
        // `.` and `..` live in the index root, outside the hash range
        if name == b"." || name == b".." {
            let Some(lba) = fs.inode_block(iref, 0)? else {
                return Err(Ext4Error::Corrupted);
            };
            let block = fs.trans_block_get(lba)?;
            let inode = {
                let data = block.data();
                if name == b"." {
                    entry_inode(&data, 0)
                } else {
                    entry_inode(&data, entry_rec_len(&data, 0))
                }
            };
            fs.block_put(block)?;
            return Ok(Some(DirEntry {
                inode,
                file_type: file_type::DIRECTORY,
                name: name.to_vec(),
            }));
        }

        return Ok(dir_idx::dx_find_entry(fs, iref, name)?.map(|(entry, _)| entry));
    }

    let usable = usable_block_len(&fs.sb);
    for lblk in 0..dir_block_count(fs, iref) {
        let Some(lba) = fs.inode_block(iref, lblk)? else {
            continue;
        };
        let block = fs.trans_block_get(lba)?;
        let found = {
            let data = block.data();
            verify_dir_block_csum(&fs.sb, iref.index, iref.inode.generation(), &data)?;
            find_in_block(&data, usable, name).map(|off| DirEntry {
                inode: entry_inode(&data, off),
                file_type: entry_file_type(&data, off),
                name: name.to_vec(),
            })
        };
        fs.block_put(block)?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

/// Adds an entry to the directory.
///
/// Existing blocks are scanned for trailing free space first; a
/// directory outgrowing its single linear block is converted to an
/// HTree when the feature allows it, and a fresh block is appended
/// otherwise.
pub(crate) fn dir_add_entry(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    name: &[u8],
    ino: u32,
    ftype: u8,
) -> CanFail<Ext4Error> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Ext4Error::InvalidArgument);
    }

    if iref.inode.flags().includes(InodeFlags::INDEX_FL) {
        return dir_idx::dx_add_entry(fs, iref, name, ino, ftype);
    }

    let usable = usable_block_len(&fs.sb);
    let blocks = dir_block_count(fs, iref);

    for lblk in 0..blocks {
        let Some(lba) = fs.inode_block(iref, lblk)? else {
            continue;
        };
        let block = fs.trans_block_get(lba)?;
        let added = {
            let mut data = block.data_mut();
            let added = add_to_block(&mut data, usable, name, ino, ftype);
            if added {
                let gen = iref.inode.generation();
                set_dir_block_csum(&fs.sb, iref.index, gen, &mut data);
            }
            added
        };
        if added {
            fs.trans_set_dirty(&block)?;
        }
        fs.block_put(block)?;
        if added {
            return Ok(());
        }
    }

    // no room anywhere: index the directory when possible
    if blocks == 1
        && fs
            .sb
            .feature_compat()
            .includes(CompatibleFeatureSet::DIR_INDEX)
    {
        return dir_idx::dx_init(fs, iref, name, ino, ftype);
    }

    // append a new block holding the single new entry
    let (lba, _) = fs.inode_block_create(iref, blocks)?;
    let block = fs.trans_block_get_noread(lba)?;
    {
        let mut data = block.data_mut();
        init_free_block(&mut data, usable);
        write_entry(&mut data, 0, ino, usable, name, ftype);
        let gen = iref.inode.generation();
        set_dir_block_csum(&fs.sb, iref.index, gen, &mut data);
    }
    fs.trans_set_dirty(&block)?;
    fs.block_put(block)?;

    iref.inode
        .set_size(u64::from(blocks + 1) * u64::from(fs.sb.blk_size()));
    iref.dirty = true;
    Ok(())
}

/// Removes an entry from the directory. The vacated record coalesces
/// with its predecessor; blocks are never given back.
pub(crate) fn dir_remove_entry(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    name: &[u8],
) -> FsResult<DirEntry> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Ext4Error::InvalidArgument);
    }

    let usable = usable_block_len(&fs.sb);

    // on an indexed directory the hash tells us the leaf block to edit
    let target_block = if iref.inode.flags().includes(InodeFlags::INDEX_FL) {
        match dir_idx::dx_find_entry(fs, iref, name)? {
            Some((_, lblk)) => Some(lblk),
            None => return Err(Ext4Error::NotFound),
        }
    } else {
        None
    };

    let blocks = dir_block_count(fs, iref);
    let candidates: Vec<u32> = match target_block {
        Some(b) => alloc::vec![b],
        None => (0..blocks).collect(),
    };

    for lblk in candidates {
        let Some(lba) = fs.inode_block(iref, lblk)? else {
            continue;
        };
        let block = fs.trans_block_get(lba)?;
        let removed = {
            let mut data = block.data_mut();
            let found = find_in_block(&data, usable, name).map(|off| DirEntry {
                inode: entry_inode(&data, off),
                file_type: entry_file_type(&data, off),
                name: name.to_vec(),
            });
            if found.is_some() {
                remove_from_block(&mut data, usable, name);
                let gen = iref.inode.generation();
                set_dir_block_csum(&fs.sb, iref.index, gen, &mut data);
            }
            found
        };
        if removed.is_some() {
            fs.trans_set_dirty(&block)?;
        }
        fs.block_put(block)?;
        if let Some(entry) = removed {
            return Ok(entry);
        }
    }

    Err(Ext4Error::NotFound)
}

/// Returns the entry at directory byte position `pos` (skipping unused
/// records, index nodes and checksum tails), along with the position of
/// the next record.
pub(crate) fn dir_entry_next(
    fs: &mut Ext4Fs,
    iref: &InodeRef,
    mut pos: u64,
) -> FsResult<Option<(DirEntry, u64)>> {
    let bsize = u64::from(fs.sb.blk_size());
    let size = iref.inode.size();

    while pos + DE_HEADER as u64 <= size {
        let lblk = (pos / bsize) as u32;
        let Some(lba) = fs.inode_block(iref, lblk)? else {
            pos = (u64::from(lblk) + 1) * bsize;
            continue;
        };

        let block = fs.trans_block_get(lba)?;
        let result = {
            let data = block.data();
            let mut off = (pos % bsize) as usize;
            let mut found = None;

            while off + DE_HEADER <= data.len() {
                let rec_len = entry_rec_len(&data, off);
                if rec_len < DE_HEADER
                    || off + rec_len > data.len()
                    || DE_HEADER + entry_name_len(&data, off) > rec_len
                {
                    // ran off the record chain (index node interior);
                    // skip to the next block
                    break;
                }
                let inode = entry_inode(&data, off);
                if inode != 0 {
                    found = Some((
                        DirEntry {
                            inode,
                            file_type: entry_file_type(&data, off),
                            name: entry_name(&data, off).to_vec(),
                        },
                        u64::from(lblk) * bsize + (off + rec_len) as u64,
                    ));
                    break;
                }
                off += rec_len;
            }
            found
        };
        fs.block_put(block)?;

        if result.is_some() {
            return Ok(result);
        }
        pos = (u64::from(lblk) + 1) * bsize;
    }

    Ok(None)
}

/// Repoints the `..` entry of a moved directory at its new parent.
pub(crate) fn dir_set_parent(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    parent_ino: u32,
) -> CanFail<Ext4Error> {
    let Some(lba) = fs.inode_block(iref, 0)? else {
        return Err(Ext4Error::Corrupted);
    };
    let block = fs.trans_block_get(lba)?;
    let found = {
        let mut data = block.data_mut();
        // `..` is always the second record of block 0
        let dot_len = entry_rec_len(&data, 0);
        let ok = dot_len >= DE_HEADER && entry_name(&data, dot_len) == b"..";
        if ok {
            data[dot_len..dot_len + 4].copy_from_slice(&parent_ino.to_le_bytes());
            if iref.inode.flags().includes(InodeFlags::INDEX_FL) {
                dir_idx::refresh_root_csum(fs, iref, &mut data);
            } else {
                let gen = iref.inode.generation();
                set_dir_block_csum(&fs.sb, iref.index, gen, &mut data);
            }
        }
        ok
    };
    if found {
        fs.trans_set_dirty(&block)?;
        fs.block_put(block)?;
        Ok(())
    } else {
        fs.block_put(block)?;
        Err(Ext4Error::Corrupted)
    }
}

/// Whether the directory holds anything besides `.` and `..`.
pub(crate) fn dir_is_empty(fs: &mut Ext4Fs, iref: &InodeRef) -> FsResult<bool> {
    let mut pos = 0;
    while let Some((entry, next)) = dir_entry_next(fs, iref, pos)? {
        if entry.name.as_slice() != b"." && entry.name.as_slice() != b".." {
            return Ok(false);
        }
        pos = next;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_block(usable: usize) -> alloc::vec::Vec<u8> {
        let mut data = alloc::vec![0u8; 1024];
        init_free_block(&mut data, usable);
        data
    }

    #[test]
    fn add_and_find() {
        let mut data = fresh_block(1024);
        assert!(add_to_block(&mut data, 1024, b"hello", 12, file_type::REGULAR));
        assert!(add_to_block(&mut data, 1024, b"world", 13, file_type::DIRECTORY));

        let off = find_in_block(&data, 1024, b"world").unwrap();
        assert_eq!(entry_inode(&data, off), 13);
        assert_eq!(entry_file_type(&data, off), file_type::DIRECTORY);
        assert!(find_in_block(&data, 1024, b"nope").is_none());
    }

    #[test]
    fn remove_coalesces_into_previous() {
        let mut data = fresh_block(1024);
        add_to_block(&mut data, 1024, b"a", 1, file_type::REGULAR);
        add_to_block(&mut data, 1024, b"b", 2, file_type::REGULAR);
        add_to_block(&mut data, 1024, b"c", 3, file_type::REGULAR);

        let off_a = find_in_block(&data, 1024, b"a").unwrap();
        let before = entry_rec_len(&data, off_a);
        assert!(remove_from_block(&mut data, 1024, b"b"));
        assert!(find_in_block(&data, 1024, b"b").is_none());
        // the freed record was folded into its predecessor
        assert!(entry_rec_len(&data, off_a) > before);
        assert!(find_in_block(&data, 1024, b"c").is_some());
    }

    #[test]
    fn remove_first_entry_keeps_record() {
        let mut data = fresh_block(1024);
        add_to_block(&mut data, 1024, b"only", 9, file_type::REGULAR);
        assert!(remove_from_block(&mut data, 1024, b"only"));
        assert!(find_in_block(&data, 1024, b"only").is_none());
        // the slot is reusable
        assert!(add_to_block(&mut data, 1024, b"again", 10, file_type::REGULAR));
        assert!(find_in_block(&data, 1024, b"again").is_some());
    }

    #[test]
    fn block_fills_up() {
        let mut data = fresh_block(64);
        assert!(add_to_block(&mut data, 64, b"first", 1, file_type::REGULAR));
        assert!(add_to_block(&mut data, 64, b"second", 2, file_type::REGULAR));
        assert!(!add_to_block(
            &mut data,
            64,
            b"this-name-does-not-fit-in-64",
            3,
            file_type::REGULAR
        ));
    }
}
