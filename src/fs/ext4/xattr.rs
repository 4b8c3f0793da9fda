//! Extended attributes.
//!
//! Attributes live in two places: the spare tail of a large inode
//! record (the "ibody", after `i_extra_isize`), and at most one
//! external attribute block referenced by `i_file_acl`. In both
//! layouts, entry descriptors grow downward from the top of the region
//! while values grow upward from its end.

use alloc::vec::Vec;
use log::error;

use crate::errors::{CanFail, Ext4Error, FsResult};
use crate::fs::ext4::checksum::crc32c_calc;
use crate::fs::ext4::inode::{InodeRef, GOOD_OLD_INODE_SIZE};
use crate::fs::ext4::Ext4Fs;

/// Magic opening both the ibody area and the external block.
const XATTR_MAGIC: u32 = 0xEA02_0000;

/// Size of the external block header.
const BLOCK_HEADER: usize = 32;

/// Fixed part of an entry descriptor.
const ENTRY_HEADER: usize = 16;

/// Well-known name prefixes, stored as a one-byte index.
const PREFIXES: &[(u8, &[u8])] = &[
    (1, b"user."),
    (4, b"trusted."),
    (6, b"security."),
    (7, b"system."),
];

fn split_name(full: &[u8]) -> (u8, &[u8]) {
    for (index, prefix) in PREFIXES {
        if full.starts_with(prefix) {
            return (*index, &full[prefix.len()..]);
        }
    }
    (0, full)
}

fn join_name(index: u8, suffix: &[u8]) -> Vec<u8> {
    let mut name = Vec::new();
    for (idx, prefix) in PREFIXES {
        if *idx == index {
            name.extend_from_slice(prefix);
            break;
        }
    }
    name.extend_from_slice(suffix);
    name
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Hash of a single entry, mixing the suffix and the value.
fn entry_hash(suffix: &[u8], value: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &c in suffix {
        hash = (hash << 5) ^ (hash >> 27) ^ u32::from(c);
    }
    let mut i = 0;
    while i < value.len() {
        let mut word = [0u8; 4];
        let n = (value.len() - i).min(4);
        word[..n].copy_from_slice(&value[i..i + n]);
        hash = (hash << 16) ^ (hash >> 16) ^ u32::from_le_bytes(word);
        i += 4;
    }
    hash
}

/// A decoded attribute entry.
#[derive(Clone, Debug)]
struct XattrEntry {
    index: u8,
    suffix: Vec<u8>,
    value: Vec<u8>,
}

/// Walks the entry descriptors of a region. `entries_off` is the first
/// descriptor offset, `value_base` the offset the stored `value_offs`
/// fields are relative to.
fn parse_region(
    data: &[u8],
    entries_off: usize,
    value_base: usize,
    region_end: usize,
) -> FsResult<Vec<XattrEntry>> {
    let mut out = Vec::new();
    let mut off = entries_off;

    loop {
        if off + 4 > region_end {
            return Err(Ext4Error::Corrupted);
        }
        if data[off..off + 4] == [0, 0, 0, 0] {
            return Ok(out);
        }
        if off + ENTRY_HEADER > region_end {
            return Err(Ext4Error::Corrupted);
        }

        let name_len = data[off] as usize;
        let index = data[off + 1];
        let value_offs =
            u16::from_le_bytes(data[off + 2..off + 4].try_into().unwrap()) as usize;
        let value_size =
            u32::from_le_bytes(data[off + 8..off + 12].try_into().unwrap()) as usize;

        if off + ENTRY_HEADER + name_len > region_end {
            return Err(Ext4Error::Corrupted);
        }
        let suffix = data[off + ENTRY_HEADER..off + ENTRY_HEADER + name_len].to_vec();

        let vstart = value_base + value_offs;
        if vstart + value_size > region_end {
            return Err(Ext4Error::Corrupted);
        }
        let value = data[vstart..vstart + value_size].to_vec();

        out.push(XattrEntry {
            index,
            suffix,
            value,
        });
        off += ENTRY_HEADER + padded(name_len);
    }
}

/// Serializes a full entry set into a region. Fails with `NoSpace`
/// when descriptors and values would collide.
fn write_region(
    data: &mut [u8],
    entries_off: usize,
    value_base: usize,
    region_end: usize,
    entries: &[XattrEntry],
) -> CanFail<Ext4Error> {
    data[entries_off..region_end].fill(0);

    let mut off = entries_off;
    let mut value_top = region_end;

    for e in entries {
        let desc_len = ENTRY_HEADER + padded(e.suffix.len());
        if value_top < padded(e.value.len()) {
            return Err(Ext4Error::NoSpace);
        }
        value_top -= padded(e.value.len());
        // descriptors need a terminating zero word after the last one
        if off + desc_len + 4 > value_top {
            return Err(Ext4Error::NoSpace);
        }

        data[off] = e.suffix.len() as u8;
        data[off + 1] = e.index;
        data[off + 2..off + 4]
            .copy_from_slice(&((value_top - value_base) as u16).to_le_bytes());
        // value_inum stays zero: values always live in this region
        data[off + 4..off + 8].fill(0);
        data[off + 8..off + 12].copy_from_slice(&(e.value.len() as u32).to_le_bytes());
        data[off + 12..off + 16]
            .copy_from_slice(&entry_hash(&e.suffix, &e.value).to_le_bytes());
        data[off + ENTRY_HEADER..off + ENTRY_HEADER + e.suffix.len()]
            .copy_from_slice(&e.suffix);

        data[value_top..value_top + e.value.len()].copy_from_slice(&e.value);
        off += desc_len;
    }

    Ok(())
}

/// Byte range of the ibody attribute area inside the raw inode record,
/// magic included. `None` when the inode is too small to carry one.
fn ibody_region(fs: &Ext4Fs, iref: &InodeRef) -> Option<(usize, usize)> {
    let inode_size = usize::from(fs.sb.inode_size());
    if inode_size <= usize::from(GOOD_OLD_INODE_SIZE) {
        return None;
    }

    let start = usize::from(GOOD_OLD_INODE_SIZE) + usize::from(iref.inode.extra_isize());
    if start + 4 + ENTRY_HEADER >= inode_size {
        return None;
    }
    Some((start, inode_size))
}

fn read_ibody_entries(fs: &mut Ext4Fs, iref: &InodeRef) -> FsResult<Vec<XattrEntry>> {
    let Some((start, end)) = ibody_region(fs, iref) else {
        return Ok(Vec::new());
    };

    let data = iref.block.data();
    let raw = &data[iref.offset..iref.offset + end];

    let magic = u32::from_le_bytes(raw[start..start + 4].try_into().unwrap());
    if magic != XATTR_MAGIC {
        return Ok(Vec::new());
    }

    parse_region(raw, start + 4, start + 4, end)
}

fn write_ibody_entries(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    entries: &[XattrEntry],
) -> CanFail<Ext4Error> {
    let Some((start, end)) = ibody_region(fs, iref) else {
        return Err(Ext4Error::NoSpace);
    };

    {
        let mut data = iref.block.data_mut();
        let raw = &mut data[iref.offset..iref.offset + end];

        if entries.is_empty() {
            raw[start..end].fill(0);
        } else {
            raw[start..start + 4].copy_from_slice(&XATTR_MAGIC.to_le_bytes());
            write_region(raw, start + 4, start + 4, end, entries)?;
        }
    }

    // the record changed beyond the copied image: reserialize through
    // the normal put path so the checksum covers the new content
    iref.dirty = true;
    let block = iref.block.clone();
    fs.trans_set_dirty(&block)
}

/// EA block checksum, seeded by the block number.
fn ea_block_csum(fs: &Ext4Fs, lba: u64, data: &[u8]) -> u32 {
    let seed = crc32c_calc(fs.sb.csum_seed(), &lba.to_le_bytes());
    let mut copy = data.to_vec();
    copy[16..20].fill(0);
    crc32c_calc(seed, &copy)
}

fn read_block_entries(fs: &mut Ext4Fs, iref: &InodeRef) -> FsResult<Vec<XattrEntry>> {
    let lba = iref.inode.file_acl();
    if lba == 0 {
        return Ok(Vec::new());
    }

    let block = fs.trans_block_get(lba)?;
    let result = {
        let data = block.data();
        let magic = u32::from_le_bytes(data[..4].try_into().unwrap());
        if magic != XATTR_MAGIC {
            error!(target: "ext4", "invalid xattr block magic (inode {})", iref.index);
            Err(Ext4Error::Corrupted)
        } else if fs.sb.has_metadata_csum()
            && ea_block_csum(fs, lba, &data)
                != u32::from_le_bytes(data[16..20].try_into().unwrap())
        {
            error!(target: "ext4", "invalid xattr block checksum (inode {})", iref.index);
            Err(Ext4Error::Corrupted)
        } else {
            parse_region(&data, BLOCK_HEADER, 0, data.len())
        }
    };
    fs.block_put(block)?;
    result
}

fn write_block_entries(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    entries: &[XattrEntry],
) -> CanFail<Ext4Error> {
    let mut lba = iref.inode.file_acl();

    if entries.is_empty() {
        if lba != 0 {
            fs.balloc_free_blocks(lba, 1)?;
            iref.inode.set_file_acl(0);
            iref.inode.adjust_blocks_count(&fs.sb, -1);
            iref.dirty = true;
        }
        return Ok(());
    }

    if lba == 0 {
        lba = fs.balloc_alloc_block(fs.inode_goal(iref.index))?;
        iref.inode.set_file_acl(lba);
        iref.inode.adjust_blocks_count(&fs.sb, 1);
        iref.dirty = true;
    }

    let block = fs.trans_block_get_noread(lba)?;
    {
        let mut data = block.data_mut();
        data.fill(0);
        data[..4].copy_from_slice(&XATTR_MAGIC.to_le_bytes());
        data[4..8].copy_from_slice(&1u32.to_le_bytes()); // refcount
        data[8..12].copy_from_slice(&1u32.to_le_bytes()); // blocks

        let len = data.len();
        write_region(&mut data, BLOCK_HEADER, 0, len, entries)?;

        // header hash folds the entry hashes together
        let mut hash = 0u32;
        for e in entries {
            hash = (hash << 16) ^ (hash >> 16) ^ entry_hash(&e.suffix, &e.value);
        }
        data[12..16].copy_from_slice(&hash.to_le_bytes());

        if fs.sb.has_metadata_csum() {
            let csum = ea_block_csum(fs, lba, &data);
            data[16..20].copy_from_slice(&csum.to_le_bytes());
        }
    }
    fs.trans_set_dirty(&block)?;
    fs.block_put(block)
}

/// Retrieves the value of attribute `name`.
pub(crate) fn xattr_get(fs: &mut Ext4Fs, iref: &InodeRef, name: &[u8]) -> FsResult<Vec<u8>> {
    let (index, suffix) = split_name(name);

    for e in read_ibody_entries(fs, iref)? {
        if e.index == index && e.suffix == suffix {
            return Ok(e.value);
        }
    }
    for e in read_block_entries(fs, iref)? {
        if e.index == index && e.suffix == suffix {
            return Ok(e.value);
        }
    }
    Err(Ext4Error::NoData)
}

/// Sets (or replaces) attribute `name`, preferring the in-inode area
/// and falling back to the external block.
pub(crate) fn xattr_set(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    name: &[u8],
    value: &[u8],
) -> CanFail<Ext4Error> {
    if name.is_empty() || name.len() > 255 {
        return Err(Ext4Error::InvalidArgument);
    }

    let (index, suffix) = split_name(name);
    let mut ibody = read_ibody_entries(fs, iref)?;
    let mut external = read_block_entries(fs, iref)?;

    ibody.retain(|e| !(e.index == index && e.suffix == suffix));
    external.retain(|e| !(e.index == index && e.suffix == suffix));

    let entry = XattrEntry {
        index,
        suffix: suffix.to_vec(),
        value: value.to_vec(),
    };

    // try the ibody first
    ibody.push(entry.clone());
    match write_ibody_entries(fs, iref, &ibody) {
        Ok(()) => return write_block_entries(fs, iref, &external),
        Err(Ext4Error::NoSpace) => {
            ibody.pop();
            if !ibody.is_empty() || ibody_region(fs, iref).is_some() {
                write_ibody_entries(fs, iref, &ibody)?;
            }
        }
        Err(e) => return Err(e),
    }

    external.push(entry);
    write_block_entries(fs, iref, &external)
}

/// Removes attribute `name`.
pub(crate) fn xattr_remove(fs: &mut Ext4Fs, iref: &mut InodeRef, name: &[u8]) -> CanFail<Ext4Error> {
    let (index, suffix) = split_name(name);

    let mut ibody = read_ibody_entries(fs, iref)?;
    let mut external = read_block_entries(fs, iref)?;
    let before = ibody.len() + external.len();

    ibody.retain(|e| !(e.index == index && e.suffix == suffix));
    external.retain(|e| !(e.index == index && e.suffix == suffix));

    if ibody.len() + external.len() == before {
        return Err(Ext4Error::NoData);
    }

    write_ibody_entries(fs, iref, &ibody).or_else(|e| {
        if e == Ext4Error::NoSpace && ibody.is_empty() {
            Ok(())
        } else {
            Err(e)
        }
    })?;
    write_block_entries(fs, iref, &external)
}

/// Lists every attribute name carried by the inode.
pub(crate) fn xattr_list(fs: &mut Ext4Fs, iref: &InodeRef) -> FsResult<Vec<Vec<u8>>> {
    let mut names = Vec::new();
    for e in read_ibody_entries(fs, iref)? {
        names.push(join_name(e.index, &e.suffix));
    }
    for e in read_block_entries(fs, iref)? {
        names.push(join_name(e.index, &e.suffix));
    }
    Ok(names)
}

/// Drops the external attribute block, if any. Called when the inode
/// is freed.
pub(crate) fn xattr_release(fs: &mut Ext4Fs, iref: &mut InodeRef) -> CanFail<Ext4Error> {
    write_block_entries(fs, iref, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_prefix_split() {
        assert_eq!(split_name(b"user.comment"), (1, b"comment".as_slice()));
        assert_eq!(split_name(b"security.selinux"), (6, b"selinux".as_slice()));
        assert_eq!(split_name(b"oddball"), (0, b"oddball".as_slice()));
        assert_eq!(join_name(1, b"comment"), b"user.comment".to_vec());
    }

    #[test]
    fn region_roundtrip() {
        let mut data = alloc::vec![0u8; 256];
        let entries = alloc::vec![
            XattrEntry {
                index: 1,
                suffix: b"alpha".to_vec(),
                value: b"12345".to_vec(),
            },
            XattrEntry {
                index: 7,
                suffix: b"beta".to_vec(),
                value: b"x".to_vec(),
            },
        ];

        write_region(&mut data, 4, 4, 256, &entries).unwrap();
        let parsed = parse_region(&data, 4, 4, 256).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].suffix, b"alpha");
        assert_eq!(parsed[0].value, b"12345");
        assert_eq!(parsed[1].index, 7);
        assert_eq!(parsed[1].value, b"x");
    }

    #[test]
    fn region_overflows_cleanly() {
        let mut data = alloc::vec![0u8; 64];
        let entries = alloc::vec![XattrEntry {
            index: 1,
            suffix: b"big".to_vec(),
            value: alloc::vec![7u8; 64],
        }];
        assert_eq!(
            write_region(&mut data, 4, 4, 64, &entries),
            Err(Ext4Error::NoSpace)
        );
    }
}
