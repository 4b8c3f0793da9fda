//! Inode allocation.
//!
//! Regular inodes are allocated close to their parent directory, round
//! robin across groups. Directory inodes are spread out instead: among
//! the groups whose free-inode and free-block counts beat the per-group
//! average, the one with the fewest directories wins, which keeps
//! subtrees from piling into one group.

use log::error;

use crate::bcache::Block;
use crate::errors::{CanFail, Ext4Error, FsResult};
use crate::fs::ext4::bitmap;
use crate::fs::ext4::block_grp::{BlockGroupRef, GroupDescriptorFlags};
use crate::fs::ext4::Ext4Fs;

impl Ext4Fs {
    /// Loads the inode bitmap of a group, materializing it on first use
    /// when the group carries `INODE_UNINIT`.
    fn get_inode_bitmap(&mut self, bgref: &mut BlockGroupRef) -> FsResult<Block> {
        let bitmap_lba = bgref.desc.inode_bitmap(&self.sb);

        if !bgref
            .desc
            .flags()
            .includes(GroupDescriptorFlags::INODE_UNINIT)
        {
            let block = self.trans_block_get(bitmap_lba)?;
            {
                let data = block.data();
                let bits = self.sb.inodes_per_group();
                let stored = bgref.desc.inode_bitmap_csum(&self.sb);
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

        let block = self.trans_block_get_noread(bitmap_lba)?;
        {
            let mut data = block.data_mut();
            data.fill(0);
            // pad bits past the per-group inode count
            let ipg = self.sb.inodes_per_group();
            let total_bits = (data.len() * 8) as u32;
            bitmap::bits_set(&mut data, ipg, total_bits - ipg);
        }
        block.set_dirty();
        bgref.desc.clear_flag(GroupDescriptorFlags::INODE_UNINIT);
        if self.sb.has_metadata_csum() {
            let csum = {
                let data = block.data();
                let bits = self.sb.inodes_per_group();
                bitmap::bitmap_csum(&self.sb, &data[..(bits as usize + 7) / 8])
            };
            bgref.desc.set_inode_bitmap_csum(&self.sb, csum);
        }
        bgref.dirty = true;

        Ok(block)
    }

    fn put_inode_bitmap(&mut self, bgref: &mut BlockGroupRef, block: Block) -> CanFail<Ext4Error> {
        if self.sb.has_metadata_csum() {
            let csum = {
                let data = block.data();
                let bits = self.sb.inodes_per_group();
                bitmap::bitmap_csum(&self.sb, &data[..(bits as usize + 7) / 8])
            };
            bgref.desc.set_inode_bitmap_csum(&self.sb, csum);
            bgref.dirty = true;
        }
        self.trans_set_dirty(&block)?;
        self.block_put(block)
    }

    /// Picks the block group for a new directory inode.
    fn pick_dir_group(&mut self) -> FsResult<u32> {
        let bg_count = self.sb.bg_count();
        let avg_free_inodes = self.sb.free_inodes_count() / bg_count;
        let avg_free_blocks = (self.sb.free_blk_count() / u64::from(bg_count)) as u32;

        let mut best: Option<(u32, u32)> = None;
        for bg in 0..bg_count {
            let bgref = self.get_bg_ref(bg)?;
            let free_inodes = bgref.desc.free_inodes_count(&self.sb);
            let free_blocks = bgref.desc.free_blocks_count(&self.sb);
            let dirs = bgref.desc.used_dirs_count(&self.sb);
            self.put_bg_ref(bgref)?;

            if free_inodes >= avg_free_inodes && free_blocks >= avg_free_blocks {
                match best {
                    Some((_, best_dirs)) if dirs >= best_dirs => {}
                    _ => best = Some((bg, dirs)),
                }
            }
        }

        Ok(best.map(|(bg, _)| bg).unwrap_or(self.last_inode_bg))
    }

    /// Allocates an inode. Returns its number.
    pub(crate) fn ialloc_alloc_inode(&mut self, is_dir: bool) -> FsResult<u32> {
        let bg_count = self.sb.bg_count();
        let start_bg = if is_dir {
            self.pick_dir_group()?
        } else {
            self.last_inode_bg
        };

        let ipg = self.sb.inodes_per_group();
        for i in 0..bg_count {
            let bg = (start_bg + i) % bg_count;
            let mut bgref = self.get_bg_ref(bg)?;

            if bgref.desc.free_inodes_count(&self.sb) == 0
                && !bgref
                    .desc
                    .flags()
                    .includes(GroupDescriptorFlags::INODE_UNINIT)
            {
                self.put_bg_ref(bgref)?;
                continue;
            }

            let bitmap_block = self.get_inode_bitmap(&mut bgref)?;

            // keep the reserved inodes of group 0 out of reach
            let first_bit = if bg == 0 {
                self.sb.first_ino().saturating_sub(1)
            } else {
                0
            };

            let found = {
                let data = bitmap_block.data();
                bitmap::bit_find_clr(&data, first_bit, ipg)
            };

            match found {
                Ok(bit) => {
                    {
                        let mut data = bitmap_block.data_mut();
                        bitmap::bit_set(&mut data, bit);
                    }
                    self.put_inode_bitmap(&mut bgref, bitmap_block)?;

                    let free = bgref.desc.free_inodes_count(&self.sb) - 1;
                    bgref.desc.set_free_inodes_count(&self.sb, free);
                    if is_dir {
                        let dirs = bgref.desc.used_dirs_count(&self.sb) + 1;
                        bgref.desc.set_used_dirs_count(&self.sb, dirs);
                    }
                    // shrink the untouched tail of the inode table
                    let unused = bgref.desc.itable_unused(&self.sb);
                    if ipg - unused <= bit {
                        bgref.desc.set_itable_unused(&self.sb, ipg - bit - 1);
                    }
                    bgref.dirty = true;
                    self.put_bg_ref(bgref)?;

                    self.sb
                        .set_free_inodes_count(self.sb.free_inodes_count() - 1);
                    self.sb_dirty = true;
                    self.last_inode_bg = bg;

                    return Ok(bg * ipg + bit + 1);
                }
                Err(_) => {
                    self.block_put(bitmap_block)?;
                    self.put_bg_ref(bgref)?;
                }
            }
        }

        error!(target: "ext4", "out of inodes");
        Err(Ext4Error::NoSpace)
    }

    /// Returns inode `ino` to the free pool.
    pub(crate) fn ialloc_free_inode(&mut self, ino: u32, is_dir: bool) -> CanFail<Ext4Error> {
        if ino == 0 || ino > self.sb.inodes_count() {
            return Err(Ext4Error::Corrupted);
        }

        let ipg = self.sb.inodes_per_group();
        let bg = (ino - 1) / ipg;
        let bit = (ino - 1) % ipg;

        let mut bgref = self.get_bg_ref(bg)?;
        let bitmap_block = self.get_inode_bitmap(&mut bgref)?;
        {
            let mut data = bitmap_block.data_mut();
            bitmap::bit_clr(&mut data, bit);
        }
        self.put_inode_bitmap(&mut bgref, bitmap_block)?;

        let free = bgref.desc.free_inodes_count(&self.sb) + 1;
        bgref.desc.set_free_inodes_count(&self.sb, free);
        if is_dir {
            let dirs = bgref.desc.used_dirs_count(&self.sb).saturating_sub(1);
            bgref.desc.set_used_dirs_count(&self.sb, dirs);
        }
        bgref.dirty = true;
        self.put_bg_ref(bgref)?;

        self.sb
            .set_free_inodes_count(self.sb.free_inodes_count() + 1);
        self.sb_dirty = true;
        Ok(())
    }
}
