//! Physical block allocation.
//!
//! Allocation is goal-directed: the caller supplies a preferred block
//! (usually right after the last block of the file, or the first block
//! of the inode's group); the allocator tests the exact goal bit, then
//! scans the goal group forward, then walks the remaining groups round
//! robin.

use log::error;

use crate::bcache::Block;
use crate::errors::{CanFail, Ext4Error, FsResult};
use crate::fs::ext4::bitmap;
use crate::fs::ext4::block_grp::{desc_block_of, BlockGroupRef, Ext4GroupDescriptor, GroupDescriptorFlags};
use crate::fs::ext4::Ext4Fs;

impl Ext4Fs {
    /// Loads (and pins) the descriptor of block group `bg`.
    pub(crate) fn get_bg_ref(&mut self, bg: u32) -> FsResult<BlockGroupRef> {
        if bg >= self.sb.bg_count() {
            return Err(Ext4Error::InvalidArgument);
        }

        let (blk, offset) = desc_block_of(&self.sb, bg);
        let block = self.trans_block_get(blk)?;

        let desc = {
            let data = block.data();
            let desc_size = usize::from(self.sb.desc_size());
            let mut raw = [0u8; 64];
            raw[..desc_size].copy_from_slice(&data[offset..offset + desc_size]);
            *bytemuck::from_bytes::<Ext4GroupDescriptor>(&raw)
        };

        if !desc.verify_chksum(&self.sb, bg) {
            error!(target: "ext4", "invalid group descriptor checksum (bg {bg})");
            self.block_put(block)?;
            return Err(Ext4Error::Corrupted);
        }

        Ok(BlockGroupRef {
            bg,
            desc,
            block,
            offset,
            dirty: false,
        })
    }

    /// Writes a descriptor back (checksum refreshed, buffer journaled)
    /// and releases it.
    pub(crate) fn put_bg_ref(&mut self, mut bgref: BlockGroupRef) -> CanFail<Ext4Error> {
        if bgref.dirty {
            bgref.desc.update_chksum(&self.sb, bgref.bg);
            {
                let mut data = bgref.block.data_mut();
                let desc_size = usize::from(self.sb.desc_size());
                let raw = bytemuck::bytes_of(&bgref.desc);
                data[bgref.offset..bgref.offset + desc_size].copy_from_slice(&raw[..desc_size]);
            }
            let block = bgref.block.clone();
            self.trans_set_dirty(&block)?;
        }
        self.block_put(bgref.block)
    }

    /// Loads the block bitmap of a group, initializing it on first use
    /// when the group carries `BLOCK_UNINIT`.
    fn get_block_bitmap(&mut self, bgref: &mut BlockGroupRef) -> FsResult<Block> {
        let bitmap_lba = bgref.desc.block_bitmap(&self.sb);

        if !bgref
            .desc
            .flags()
            .includes(GroupDescriptorFlags::BLOCK_UNINIT)
        {
            let block = self.trans_block_get(bitmap_lba)?;
            {
                let data = block.data();
                let bits = self.sb.blocks_per_group();
                let stored = bgref.desc.block_bitmap_csum(&self.sb);
                if let Err(e) =
                    bitmap::verify_bitmap_csum(&self.sb, &data[..(bits as usize + 7) / 8], stored)
                {
                    drop(data);
                    self.block_put(block)?;
                    return Err(e);
                }
            }
            return Ok(block);
        }

        // lazily materialize the bitmap: mark the metadata blocks that
        // live inside this group (replica + descriptor table, bitmaps,
        // inode tables of any group, group padding)
        let block = self.trans_block_get_noread(bitmap_lba)?;
        {
            let mut data = block.data_mut();
            data.fill(0);

            let first = self.sb.bg_first_block(bgref.bg);
            let in_group = self.sb.blocks_in_group(bgref.bg);
            let end = first + u64::from(in_group);

            let mut mark = |lba: u64| {
                if (first..end).contains(&lba) {
                    bitmap::bit_set(&mut data, (lba - first) as u32);
                }
            };

            if self.sb.bg_has_super(bgref.bg) {
                mark(first);
                let desc_size = u64::from(self.sb.desc_size());
                let per_block = u64::from(self.sb.blk_size()) / desc_size;
                let gdt_blocks =
                    (u64::from(self.sb.bg_count()) + per_block - 1) / per_block;
                let reserved = u64::from(u16::from_le(self.sb.reserved_gdt_blocks));
                for i in 0..gdt_blocks + reserved {
                    mark(first + 1 + i);
                }
            }

            let itable_span = {
                let ipg = u64::from(self.sb.inodes_per_group());
                let isize = u64::from(self.sb.inode_size());
                (ipg * isize + u64::from(self.sb.blk_size()) - 1) / u64::from(self.sb.blk_size())
            };
            for other in 0..self.sb.bg_count() {
                let odesc = if other == bgref.bg {
                    bgref.desc
                } else {
                    let r = self.get_bg_ref(other)?;
                    let d = r.desc;
                    self.put_bg_ref(r)?;
                    d
                };
                mark(odesc.block_bitmap(&self.sb));
                mark(odesc.inode_bitmap(&self.sb));
                let itable = odesc.inode_table(&self.sb);
                for i in 0..itable_span {
                    mark(itable + i);
                }
            }

            // pad the tail of the last (short) group
            for bit in in_group..self.sb.blocks_per_group() {
                bitmap::bit_set(&mut data, bit);
            }
        }

        block.set_dirty();
        bgref.desc.clear_flag(GroupDescriptorFlags::BLOCK_UNINIT);
        if self.sb.has_metadata_csum() {
            let csum = {
                let data = block.data();
                let bits = self.sb.blocks_per_group();
                bitmap::bitmap_csum(&self.sb, &data[..(bits as usize + 7) / 8])
            };
            bgref.desc.set_block_bitmap_csum(&self.sb, csum);
        }
        bgref.dirty = true;

        Ok(block)
    }

    /// Writes an updated bitmap back: refreshes the descriptor's bitmap
    /// checksum and journals the buffer.
    fn put_block_bitmap(&mut self, bgref: &mut BlockGroupRef, block: Block) -> CanFail<Ext4Error> {
        if self.sb.has_metadata_csum() {
            let csum = {
                let data = block.data();
                let bits = self.sb.blocks_per_group();
                bitmap::bitmap_csum(&self.sb, &data[..(bits as usize + 7) / 8])
            };
            bgref.desc.set_block_bitmap_csum(&self.sb, csum);
            bgref.dirty = true;
        }
        self.trans_set_dirty(&block)?;
        self.block_put(block)
    }

    /// Allocates one block, preferring `goal`.
    pub(crate) fn balloc_alloc_block(&mut self, goal: u64) -> FsResult<u64> {
        let first_data = u64::from(self.sb.first_data_block());
        let goal = goal.clamp(first_data, self.sb.blk_count() - 1);

        let goal_bg = self.sb.bg_of_block(goal);
        let bg_count = self.sb.bg_count();

        for i in 0..bg_count {
            let bg = (goal_bg + i) % bg_count;
            let mut bgref = self.get_bg_ref(bg)?;

            if bgref.desc.free_blocks_count(&self.sb) == 0
                && !bgref
                    .desc
                    .flags()
                    .includes(GroupDescriptorFlags::BLOCK_UNINIT)
            {
                self.put_bg_ref(bgref)?;
                continue;
            }

            let bitmap_block = self.get_block_bitmap(&mut bgref)?;
            let in_group = self.sb.blocks_in_group(bg);
            let start_bit = if bg == goal_bg {
                (goal - self.sb.bg_first_block(bg)) as u32
            } else {
                0
            };

            let found = {
                let data = bitmap_block.data();
                // the exact goal first, then the rest of the group,
                // then the blocks before the goal
                if bg == goal_bg && bitmap::is_bit_clr(&data, start_bit) {
                    Ok(start_bit)
                } else {
                    bitmap::bit_find_clr(&data, start_bit, in_group)
                        .or_else(|_| bitmap::bit_find_clr(&data, 0, start_bit))
                }
            };

            match found {
                Ok(bit) => {
                    {
                        let mut data = bitmap_block.data_mut();
                        bitmap::bit_set(&mut data, bit);
                    }
                    self.put_block_bitmap(&mut bgref, bitmap_block)?;

                    let free = bgref.desc.free_blocks_count(&self.sb) - 1;
                    bgref.desc.set_free_blocks_count(&self.sb, free);
                    bgref.dirty = true;
                    self.put_bg_ref(bgref)?;

                    self.sb.set_free_blk_count(self.sb.free_blk_count() - 1);
                    self.sb_dirty = true;

                    return Ok(self.sb.bg_first_block(bg) + u64::from(bit));
                }
                Err(_) => {
                    self.block_put(bitmap_block)?;
                    self.put_bg_ref(bgref)?;
                }
            }
        }

        error!(target: "ext4", "out of blocks");
        Err(Ext4Error::NoSpace)
    }

    /// Frees `count` consecutive blocks starting at `first`.
    ///
    /// Freed blocks are revoked in the running transaction and their
    /// cached buffers invalidated, so stale metadata is never written
    /// over a reallocated block.
    pub(crate) fn balloc_free_blocks(&mut self, first: u64, count: u64) -> CanFail<Ext4Error> {
        if count == 0 {
            return Ok(());
        }
        if first < u64::from(self.sb.first_data_block())
            || first + count > self.sb.blk_count()
        {
            return Err(Ext4Error::Corrupted);
        }

        for lba in first..first + count {
            self.trans_try_revoke(lba)?;
        }
        self.bdev.bc.invalidate_range(first, count);

        let mut lba = first;
        let mut left = count;
        while left > 0 {
            let bg = self.sb.bg_of_block(lba);
            let bit = (lba - self.sb.bg_first_block(bg)) as u32;
            let in_group = self.sb.blocks_in_group(bg);
            let chunk = u64::from(in_group - bit).min(left);

            let mut bgref = self.get_bg_ref(bg)?;
            let bitmap_block = self.get_block_bitmap(&mut bgref)?;
            {
                let mut data = bitmap_block.data_mut();
                bitmap::bits_free(&mut data, bit, chunk as u32);
            }
            self.put_block_bitmap(&mut bgref, bitmap_block)?;

            let free = bgref.desc.free_blocks_count(&self.sb) + chunk as u32;
            bgref.desc.set_free_blocks_count(&self.sb, free);
            bgref.dirty = true;
            self.put_bg_ref(bgref)?;

            self.sb.set_free_blk_count(self.sb.free_blk_count() + chunk);
            self.sb_dirty = true;

            lba += chunk;
            left -= chunk;
        }

        Ok(())
    }

    /// Free-block count recomputed from the bitmaps. Consistency
    /// checking helper.
    #[cfg(test)]
    pub(crate) fn count_free_blocks_from_bitmaps(&mut self) -> FsResult<u64> {
        let mut total = 0u64;
        for bg in 0..self.sb.bg_count() {
            let mut bgref = self.get_bg_ref(bg)?;
            let bitmap_block = self.get_block_bitmap(&mut bgref)?;
            {
                let data = bitmap_block.data();
                total += u64::from(bitmap::count_clr(&data, self.sb.blocks_in_group(bg)));
            }
            self.block_put(bitmap_block)?;
            self.put_bg_ref(bgref)?;
        }
        Ok(total)
    }
}
