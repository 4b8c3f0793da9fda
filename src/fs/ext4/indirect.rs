//! Legacy indirect block mapping.
//!
//! Inodes without the extents flag map their logical blocks through the
//! historical ext2 scheme: 12 direct pointers followed by single,
//! double and triple indirect pointer blocks. The module offers the
//! same contract as the extent tree: lookup, allocate-on-write and
//! range release.

use bytemuck::from_bytes;

use crate::bcache::Block;
use crate::errors::{CanFail, Ext4Error, FsResult};
use crate::fs::ext4::inode::InodeRef;
use crate::fs::ext4::Ext4Fs;

/// Number of direct block pointers in the inode.
const DIRECT_BLOCKS: u32 = 12;

fn ptr_at(data: &[u8], i: usize) -> u64 {
    let raw: u32 = *from_bytes(&data[i * 4..i * 4 + 4]);
    u64::from(u32::from_le(raw))
}

fn set_ptr_at(data: &mut [u8], i: usize, ptr: u64) {
    data[i * 4..i * 4 + 4].copy_from_slice(&(ptr as u32).to_le_bytes());
}

/// Pointers per indirect block.
fn ppb(fs: &Ext4Fs) -> u64 {
    u64::from(fs.sb.blk_size() / 4)
}

/// Decomposes a logical block into the indirection level (0 = direct)
/// and the per-level offsets.
fn block_path(fs: &Ext4Fs, lblk: u32) -> FsResult<(usize, [u64; 3])> {
    let ppb = ppb(fs);
    let mut left = u64::from(lblk);

    if left < u64::from(DIRECT_BLOCKS) {
        return Ok((0, [left, 0, 0]));
    }
    left -= u64::from(DIRECT_BLOCKS);

    if left < ppb {
        return Ok((1, [left, 0, 0]));
    }
    left -= ppb;

    if left < ppb * ppb {
        return Ok((2, [left / ppb, left % ppb, 0]));
    }
    left -= ppb * ppb;

    if left < ppb * ppb * ppb {
        return Ok((3, [left / (ppb * ppb), (left / ppb) % ppb, left % ppb]));
    }

    Err(Ext4Error::TooBig)
}

/// Translates logical block `lblk`; `None` when it is unmapped.
pub(crate) fn indirect_lookup(
    fs: &mut Ext4Fs,
    iref: &InodeRef,
    lblk: u32,
) -> FsResult<Option<u64>> {
    let (level, offsets) = block_path(fs, lblk)?;

    let mut ptr = if level == 0 {
        ptr_at(&iref.inode.block, offsets[0] as usize)
    } else {
        // indirect roots sit right after the 12 direct pointers
        ptr_at(&iref.inode.block, 11 + level)
    };

    for step in 0..level {
        if ptr == 0 {
            return Ok(None);
        }
        let block = fs.trans_block_get(ptr)?;
        ptr = {
            let data = block.data();
            ptr_at(&data, offsets[step] as usize)
        };
        fs.block_put(block)?;
    }

    Ok(if ptr == 0 { None } else { Some(ptr) })
}

/// Allocates a zero-filled block to hold pointers, journaled.
fn alloc_ptr_block(fs: &mut Ext4Fs, iref: &mut InodeRef, goal: u64) -> FsResult<(u64, Block)> {
    let lba = fs.balloc_alloc_block(goal)?;
    let block = fs.trans_block_get_noread(lba)?;
    block.data_mut().fill(0);
    fs.trans_set_dirty(&block)?;
    iref.inode.adjust_blocks_count(&fs.sb, 1);
    iref.dirty = true;
    Ok((lba, block))
}

/// Maps `lblk`, allocating the data block (and any missing indirect
/// blocks) when it is unmapped. Returns the physical block and whether
/// it was newly allocated.
pub(crate) fn indirect_get_block_create(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    lblk: u32,
) -> FsResult<(u64, bool)> {
    let (level, offsets) = block_path(fs, lblk)?;
    let goal = fs.inode_goal(iref.index);

    if level == 0 {
        let slot = offsets[0] as usize;
        let ptr = ptr_at(&iref.inode.block, slot);
        if ptr != 0 {
            return Ok((ptr, false));
        }
        let lba = fs.balloc_alloc_block(goal)?;
        set_ptr_at(&mut iref.inode.block, slot, lba);
        iref.inode.adjust_blocks_count(&fs.sb, 1);
        iref.dirty = true;
        return Ok((lba, true));
    }

    // make sure the chain of indirect blocks exists
    let root_slot = 11 + level;
    let mut ptr = ptr_at(&iref.inode.block, root_slot);
    if ptr == 0 {
        let (lba, block) = alloc_ptr_block(fs, iref, goal)?;
        fs.block_put(block)?;
        set_ptr_at(&mut iref.inode.block, root_slot, lba);
        ptr = lba;
    }

    for step in 0..level {
        let block = fs.trans_block_get(ptr)?;
        let slot = offsets[step] as usize;
        let mut next = {
            let data = block.data();
            ptr_at(&data, slot)
        };
        let last_step = step == level - 1;

        if next == 0 {
            let (lba, child) = if last_step {
                (fs.balloc_alloc_block(goal)?, None)
            } else {
                let (lba, child) = alloc_ptr_block(fs, iref, goal)?;
                (lba, Some(child))
            };
            {
                let mut data = block.data_mut();
                set_ptr_at(&mut data, slot, lba);
            }
            fs.trans_set_dirty(&block)?;
            if let Some(child) = child {
                fs.block_put(child)?;
            }
            next = lba;
            if last_step {
                iref.inode.adjust_blocks_count(&fs.sb, 1);
                iref.dirty = true;
                fs.block_put(block)?;
                return Ok((next, true));
            }
        } else if last_step {
            fs.block_put(block)?;
            return Ok((next, false));
        }

        fs.block_put(block)?;
        ptr = next;
    }

    Ok((ptr, false))
}

/// Unmaps a single logical block, freeing its data block. Pointer
/// blocks along the way stay allocated (subsequent writes reuse them).
pub(crate) fn indirect_unmap_block(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    lblk: u32,
    lba: u64,
) -> CanFail<Ext4Error> {
    let (level, offsets) = block_path(fs, lblk)?;

    if level == 0 {
        set_ptr_at(&mut iref.inode.block, offsets[0] as usize, 0);
    } else {
        let mut ptr = ptr_at(&iref.inode.block, 11 + level);
        for step in 0..level {
            if ptr == 0 {
                return Ok(());
            }
            let block = fs.trans_block_get(ptr)?;
            let slot = offsets[step] as usize;
            if step == level - 1 {
                {
                    let mut data = block.data_mut();
                    set_ptr_at(&mut data, slot, 0);
                }
                fs.trans_set_dirty(&block)?;
                fs.block_put(block)?;
                break;
            }
            ptr = {
                let data = block.data();
                ptr_at(&data, slot)
            };
            fs.block_put(block)?;
        }
    }

    fs.balloc_free_blocks(lba, 1)?;
    iref.inode.adjust_blocks_count(&fs.sb, -1);
    iref.dirty = true;
    Ok(())
}

/// Frees the whole subtree rooted at `lba`, `level` pointer levels
/// deep (level 0 frees a data block).
fn free_subtree(fs: &mut Ext4Fs, iref: &mut InodeRef, lba: u64, level: usize) -> CanFail<Ext4Error> {
    if level > 0 {
        let block = fs.trans_block_get(lba)?;
        let ptrs: alloc::vec::Vec<u64> = {
            let data = block.data();
            (0..ppb(fs) as usize)
                .map(|i| ptr_at(&data, i))
                .filter(|&p| p != 0)
                .collect()
        };
        fs.block_put(block)?;

        for ptr in ptrs {
            free_subtree(fs, iref, ptr, level - 1)?;
        }
    }

    fs.balloc_free_blocks(lba, 1)?;
    iref.inode.adjust_blocks_count(&fs.sb, -1);
    iref.dirty = true;
    Ok(())
}

/// Frees entries covering logical blocks `>= start` within the pointer
/// block `lba`; `start > 0`, so the block itself survives.
fn partial_free(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    lba: u64,
    level: usize,
    start: u64,
) -> CanFail<Ext4Error> {
    let ppb = ppb(fs);
    let span = ppb.pow(level as u32 - 1);
    let first_entry = (start / span) as usize;
    let inner = start % span;

    let block = fs.trans_block_get(lba)?;
    let entries: alloc::vec::Vec<(usize, u64)> = {
        let data = block.data();
        (first_entry..ppb as usize)
            .map(|i| (i, ptr_at(&data, i)))
            .filter(|&(_, p)| p != 0)
            .collect()
    };

    let mut cleared = alloc::vec::Vec::new();
    for (i, ptr) in entries {
        if level == 1 || i > first_entry || inner == 0 {
            free_subtree(fs, iref, ptr, level - 1)?;
            cleared.push(i);
        } else {
            partial_free(fs, iref, ptr, level - 1, inner)?;
        }
    }

    if !cleared.is_empty() {
        {
            let mut data = block.data_mut();
            for i in &cleared {
                set_ptr_at(&mut data, *i, 0);
            }
        }
        fs.trans_set_dirty(&block)?;
    }
    fs.block_put(block)
}

/// Unmaps and frees every logical block `>= from`.
pub(crate) fn indirect_release_from(
    fs: &mut Ext4Fs,
    iref: &mut InodeRef,
    from: u32,
) -> CanFail<Ext4Error> {
    let ppb = ppb(fs);
    let from = u64::from(from);

    // direct pointers
    for i in from.min(u64::from(DIRECT_BLOCKS))..u64::from(DIRECT_BLOCKS) {
        let ptr = ptr_at(&iref.inode.block, i as usize);
        if ptr != 0 {
            fs.balloc_free_blocks(ptr, 1)?;
            set_ptr_at(&mut iref.inode.block, i as usize, 0);
            iref.inode.adjust_blocks_count(&fs.sb, -1);
            iref.dirty = true;
        }
    }

    // indirect levels: [base, base + span) of the logical space each
    let mut base = u64::from(DIRECT_BLOCKS);
    for level in 1..=3usize {
        let span = ppb.pow(level as u32);
        let slot = 11 + level;
        let ptr = ptr_at(&iref.inode.block, slot);

        if ptr != 0 && from < base + span {
            if from <= base {
                free_subtree(fs, iref, ptr, level)?;
                set_ptr_at(&mut iref.inode.block, slot, 0);
                iref.dirty = true;
            } else {
                partial_free(fs, iref, ptr, level, from - base)?;
            }
        }
        base += span;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_codec() {
        let mut data = [0u8; 32];
        set_ptr_at(&mut data, 3, 0xAABB);
        assert_eq!(ptr_at(&data, 3), 0xAABB);
        assert_eq!(ptr_at(&data, 2), 0);
    }
}
