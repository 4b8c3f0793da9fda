//! ext4 block group related structures.
//!
//! Block groups are a logical grouping of contiguous blocks on disk,
//! each carrying its own block bitmap, inode bitmap, inode table slice
//! and data blocks. One descriptor per group lives in the block group
//! descriptor table immediately after the superblock (replicated in
//! sparse groups).

use bytemuck::{Pod, Zeroable};

use crate::bcache::Block;
use crate::fs::ext4::checksum::{crc16_calc, crc32c_calc};
use crate::fs::ext4::sb::{IncompatibleFeatureSet, Superblock};

crate::ext4_flag_field!(GroupDescriptorFlags, u16, "Block group state flags.");

impl GroupDescriptorFlags {
    /// Inode table and bitmap are not initialized.
    pub(crate) const INODE_UNINIT: Self = Self(0x0001);

    /// Block bitmap is not initialized.
    pub(crate) const BLOCK_UNINIT: Self = Self(0x0002);

    /// Inode table is zeroed.
    #[allow(dead_code)]
    pub(crate) const INODE_ZEROED: Self = Self(0x0004);
}

/// Byte offset of the `checksum` field inside the descriptor.
const DESC_CSUM_OFFSET: usize = 0x1E;

/// Each block group on the file system has an `Ext4GroupDescriptor`
/// associated with it.
///
/// The first 32 bytes are the whole descriptor on filesystems without
/// the 64-bit feature; the upper half holds the high bits of every
/// split field.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct Ext4GroupDescriptor {
    /// Lower 32-bits of location of block bitmap
    pub(crate) block_bitmap_lo: u32,

    /// Lower 32-bits of location of inode bitmap
    pub(crate) inode_bitmap_lo: u32,

    /// Lower 32-bits of location of inode table
    pub(crate) inode_table_lo: u32,

    /// Lower 16-bits of free block count
    pub(crate) free_blocks_count_lo: u16,

    /// Lower 16-bits of free inode count
    pub(crate) free_inodes_count_lo: u16,

    /// Lower 16-bits of directory count
    pub(crate) used_dirs_count_lo: u16,

    /// Block group flags
    pub(crate) flags: u16,

    /// Lower 32-bits of location of snapshot exclusion bitmap
    pub(crate) exclude_bitmap_lo: u32,

    /// Lower 16-bits of the block bitmap checksum
    pub(crate) block_bitmap_csum_lo: u16,

    /// Lower 16-bits of the inode bitmap checksum
    pub(crate) inode_bitmap_csum_lo: u16,

    /// Lower 16-bits of unused inode count
    pub(crate) itable_unused_lo: u16,

    /// Group descriptor checksum
    pub(crate) checksum: u16,

    /// High 32-bits of block bitmap
    pub(crate) block_bitmap_hi: u32,

    /// High 32-bits of inode bitmap
    pub(crate) inode_bitmap_hi: u32,

    /// High 32-bits of inode table
    pub(crate) inode_table_hi: u32,

    /// High 16-bits of free blocks count
    pub(crate) free_blocks_count_hi: u16,

    /// High 16-bits of free inodes count
    pub(crate) free_inodes_count_hi: u16,

    /// High 16-bits of directory used count
    pub(crate) used_dirs_count_hi: u16,

    /// High 16-bits of unused inode count
    pub(crate) itable_unused_hi: u16,

    /// High 32-bits of location of snapshot exclusion bitmap
    pub(crate) exclude_bitmap_hi: u32,

    /// High 16-bits of the block bitmap checksum
    pub(crate) block_bitmap_csum_hi: u16,

    /// High 16-bits of the inode bitmap checksum
    pub(crate) inode_bitmap_csum_hi: u16,

    reserved: u32,
}

const _: () = assert!(core::mem::size_of::<Ext4GroupDescriptor>() == 64);

impl Ext4GroupDescriptor {
    fn split_u64(&self, lo: u32, hi: u32, sb: &Superblock) -> u64 {
        let lo = u64::from(u32::from_le(lo));
        if sb.desc_size() > 32 {
            lo | (u64::from(u32::from_le(hi)) << 32)
        } else {
            lo
        }
    }

    fn split_u32(&self, lo: u16, hi: u16, sb: &Superblock) -> u32 {
        let lo = u32::from(u16::from_le(lo));
        if sb.desc_size() > 32 {
            lo | (u32::from(u16::from_le(hi)) << 16)
        } else {
            lo
        }
    }

    /// Block address of the block bitmap of this group.
    pub(crate) fn block_bitmap(&self, sb: &Superblock) -> u64 {
        self.split_u64(self.block_bitmap_lo, self.block_bitmap_hi, sb)
    }

    /// Block address of the inode bitmap of this group.
    pub(crate) fn inode_bitmap(&self, sb: &Superblock) -> u64 {
        self.split_u64(self.inode_bitmap_lo, self.inode_bitmap_hi, sb)
    }

    /// First block of the inode table of this group.
    pub(crate) fn inode_table(&self, sb: &Superblock) -> u64 {
        self.split_u64(self.inode_table_lo, self.inode_table_hi, sb)
    }

    pub(crate) fn free_blocks_count(&self, sb: &Superblock) -> u32 {
        self.split_u32(self.free_blocks_count_lo, self.free_blocks_count_hi, sb)
    }

    pub(crate) fn set_free_blocks_count(&mut self, sb: &Superblock, count: u32) {
        self.free_blocks_count_lo = (count as u16).to_le();
        if sb.desc_size() > 32 {
            self.free_blocks_count_hi = ((count >> 16) as u16).to_le();
        }
    }

    pub(crate) fn free_inodes_count(&self, sb: &Superblock) -> u32 {
        self.split_u32(self.free_inodes_count_lo, self.free_inodes_count_hi, sb)
    }

    pub(crate) fn set_free_inodes_count(&mut self, sb: &Superblock, count: u32) {
        self.free_inodes_count_lo = (count as u16).to_le();
        if sb.desc_size() > 32 {
            self.free_inodes_count_hi = ((count >> 16) as u16).to_le();
        }
    }

    pub(crate) fn used_dirs_count(&self, sb: &Superblock) -> u32 {
        self.split_u32(self.used_dirs_count_lo, self.used_dirs_count_hi, sb)
    }

    pub(crate) fn set_used_dirs_count(&mut self, sb: &Superblock, count: u32) {
        self.used_dirs_count_lo = (count as u16).to_le();
        if sb.desc_size() > 32 {
            self.used_dirs_count_hi = ((count >> 16) as u16).to_le();
        }
    }

    pub(crate) fn itable_unused(&self, sb: &Superblock) -> u32 {
        self.split_u32(self.itable_unused_lo, self.itable_unused_hi, sb)
    }

    pub(crate) fn set_itable_unused(&mut self, sb: &Superblock, count: u32) {
        self.itable_unused_lo = (count as u16).to_le();
        if sb.desc_size() > 32 {
            self.itable_unused_hi = ((count >> 16) as u16).to_le();
        }
    }

    pub(crate) fn flags(&self) -> GroupDescriptorFlags {
        GroupDescriptorFlags(u16::from_le(self.flags))
    }

    pub(crate) fn clear_flag(&mut self, flag: GroupDescriptorFlags) {
        self.flags = (u16::from_le(self.flags) & !flag.0).to_le();
    }

    pub(crate) fn block_bitmap_csum(&self, sb: &Superblock) -> u32 {
        self.split_u32(self.block_bitmap_csum_lo, self.block_bitmap_csum_hi, sb)
    }

    pub(crate) fn set_block_bitmap_csum(&mut self, sb: &Superblock, csum: u32) {
        self.block_bitmap_csum_lo = ((csum & 0xFFFF) as u16).to_le();
        if sb.desc_size() > 32 {
            self.block_bitmap_csum_hi = ((csum >> 16) as u16).to_le();
        }
    }

    pub(crate) fn inode_bitmap_csum(&self, sb: &Superblock) -> u32 {
        self.split_u32(self.inode_bitmap_csum_lo, self.inode_bitmap_csum_hi, sb)
    }

    pub(crate) fn set_inode_bitmap_csum(&mut self, sb: &Superblock, csum: u32) {
        self.inode_bitmap_csum_lo = ((csum & 0xFFFF) as u16).to_le();
        if sb.desc_size() > 32 {
            self.inode_bitmap_csum_hi = ((csum >> 16) as u16).to_le();
        }
    }

    /// Recomputes the descriptor checksum over this descriptor.
    pub(crate) fn update_chksum(&mut self, sb: &Superblock, bg: u32) {
        self.checksum = 0;
        let csum = compute_desc_chksum(sb, bg, bytemuck::bytes_of(self));
        self.checksum = csum.to_le();
    }

    /// Compares the descriptor checksum to its stored value.
    pub(crate) fn verify_chksum(&self, sb: &Superblock, bg: u32) -> bool {
        if !sb.has_metadata_csum() && !sb.has_gdt_csum() {
            return true;
        }
        let mut copy = *self;
        copy.checksum = 0;
        compute_desc_chksum(sb, bg, bytemuck::bytes_of(&copy)) == u16::from_le(self.checksum)
    }
}

/// Descriptor checksum, seeded by the filesystem UUID and the block
/// group index.
///
/// Filesystems carrying `METADATA_CSUM` use the low 16 bits of a crc32c;
/// older `GDT_CSUM` filesystems use CRC16.
fn compute_desc_chksum(sb: &Superblock, bg: u32, raw_desc: &[u8]) -> u16 {
    let desc_size = usize::from(sb.desc_size());
    let bg_le = bg.to_le_bytes();

    if sb.has_metadata_csum() {
        let mut crc = crc32c_calc(sb.csum_seed(), &bg_le);
        crc = crc32c_calc(crc, &raw_desc[..DESC_CSUM_OFFSET]);
        // skip the 16-bit checksum field itself
        crc = crc32c_calc(crc, &[0, 0]);
        if desc_size > 32 {
            crc = crc32c_calc(crc, &raw_desc[DESC_CSUM_OFFSET + 2..desc_size]);
        }
        (crc & 0xFFFF) as u16
    } else if sb.has_gdt_csum() {
        let mut crc = crc16_calc(!0, &sb.uuid);
        crc = crc16_calc(crc, &bg_le);
        crc = crc16_calc(crc, &raw_desc[..DESC_CSUM_OFFSET]);
        if desc_size > 32 {
            crc = crc16_calc(crc, &raw_desc[DESC_CSUM_OFFSET + 2..desc_size]);
        }
        crc
    } else {
        0
    }
}

/// Block holding the descriptor of group `bg`, and the byte offset of
/// the descriptor inside it.
///
/// Without `meta_bg` the descriptor table starts right after the
/// superblock; with it, descriptors past `first_meta_bg` live inside
/// their own meta group.
pub(crate) fn desc_block_of(sb: &Superblock, bg: u32) -> (u64, usize) {
    let desc_size = u64::from(sb.desc_size());
    let descs_per_block = u64::from(sb.blk_size()) / desc_size;
    let desc_block_idx = u64::from(bg) / descs_per_block;
    let offset = (u64::from(bg) % descs_per_block * desc_size) as usize;

    let meta_bg = sb
        .feature_incompat()
        .includes(IncompatibleFeatureSet::META_BG);
    let first_meta_bg = u64::from(u32::from_le(sb.first_meta_bg));

    if !meta_bg || desc_block_idx < first_meta_bg {
        let base = u64::from(sb.first_data_block()) + 1;
        (base + desc_block_idx, offset)
    } else {
        // inside the meta group: the descriptor block sits right after
        // the superblock replica, when the group carries one
        let meta_group_first = (desc_block_idx * descs_per_block) as u32;
        let has_super = u64::from(sb.bg_has_super(meta_group_first));
        (sb.bg_first_block(meta_group_first) + has_super, offset)
    }
}

/// A pinned, deserialized group descriptor.
///
/// Obtained through [`crate::fs::ext4::Ext4Fs::get_bg_ref`]; mutations
/// go through the copied descriptor and are written back (checksum
/// refreshed, buffer journaled) by `put_bg_ref` when `dirty` is set.
#[derive(Debug)]
pub(crate) struct BlockGroupRef {
    pub(crate) bg: u32,
    pub(crate) desc: Ext4GroupDescriptor,
    pub(crate) block: Block,
    pub(crate) offset: usize,
    pub(crate) dirty: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ext4::sb::ReadOnlyCompatibleFeatureSet;

    fn sb_with(ro: u32, bsize_log: u32) -> Superblock {
        let mut sb = Superblock::zeroed();
        sb.feature_ro_compat = ro.to_le();
        sb.log_block_size = bsize_log.to_le();
        sb.blocks_per_group = 8192u32.to_le();
        sb.inodes_per_group = 1024u32.to_le();
        sb.blocks_count_lo = 65536u32.to_le();
        sb.first_data_block = 1u32.to_le();
        sb.uuid = *b"frozenfs-test-id";
        sb
    }

    #[test]
    fn split_counters_without_64bit() {
        let sb = sb_with(0, 0);
        let mut desc = Ext4GroupDescriptor::zeroed();
        desc.set_free_blocks_count(&sb, 4242);
        assert_eq!(desc.free_blocks_count(&sb), 4242);
        // high half untouched on 32-byte descriptors
        let free_blocks_count_hi = desc.free_blocks_count_hi;
        assert_eq!(free_blocks_count_hi, 0);
    }

    #[test]
    fn gdt_csum_roundtrip() {
        let sb = sb_with(ReadOnlyCompatibleFeatureSet::GDT_CSUM.0, 0);
        let mut desc = Ext4GroupDescriptor::zeroed();
        desc.set_free_blocks_count(&sb, 100);
        desc.update_chksum(&sb, 3);
        assert!(desc.verify_chksum(&sb, 3));
        assert!(!desc.verify_chksum(&sb, 4));
        desc.set_free_blocks_count(&sb, 99);
        assert!(!desc.verify_chksum(&sb, 3));
    }

    #[test]
    fn descriptor_addressing() {
        let sb = sb_with(0, 0);
        // 1024-byte blocks, 32-byte descriptors: 32 descriptors per block
        assert_eq!(desc_block_of(&sb, 0), (2, 0));
        assert_eq!(desc_block_of(&sb, 1), (2, 32));
        assert_eq!(desc_block_of(&sb, 32), (3, 0));
    }
}
