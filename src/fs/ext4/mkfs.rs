//! Filesystem formatter.
//!
//! Lays a fresh ext4 filesystem onto a device: superblock (with sparse
//! replicas), descriptor table, bitmaps, inode tables, the root and
//! `lost+found` directories, and an optional journal inode. The images
//! it produces use the same feature set the rest of the crate
//! understands: `filetype + extents`, `sparse_super + large_file +
//! extra_isize + metadata_csum`, and a v1-checksummed journal with
//! revoke support.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use bytemuck::{bytes_of, Zeroable};
use log::info;

use crate::blockdev::{BlockDevice, Blockdev};
use crate::errors::{CanFail, Ext4Error};
use crate::fs::ext4::block_grp::Ext4GroupDescriptor;
use crate::fs::ext4::checksum::crc32c_calc;
use crate::fs::ext4::dir::{self, file_type};
use crate::fs::ext4::extent::{self, Ext4Extent};
use crate::fs::ext4::inode::{
    self, set_inode_csum, Ext4Inode, InodeFileMode, InodeFlags,
};
use crate::fs::ext4::journal::{JbdBlockHeader, JbdSb, SUPERBLOCK_V2};
use crate::fs::ext4::sb::{
    CompatibleFeatureSet, Ext4Magic, IncompatibleFeatureSet, ReadOnlyCompatibleFeatureSet,
    Superblock, EXT4_MAGIC, SUPERBLOCK_OFFSET,
};
use crate::fs::ext4::{bitmap, dir_idx};

/// Formatting options.
#[derive(Clone, Copy, Debug)]
pub struct MkfsOptions {
    /// Filesystem block size: 1024, 2048 or 4096.
    pub block_size: u32,

    /// On-disk inode record size; 256 leaves room for the extra area
    /// and inline attributes.
    pub inode_size: u16,

    /// Volume label.
    pub label: [u8; 16],

    /// Volume UUID, seeds every metadata checksum.
    pub uuid: [u8; 16],

    /// Create a journal inode.
    pub journal: bool,

    /// Journal length in blocks; 0 picks a size from the device
    /// capacity.
    pub journal_blocks: u32,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            inode_size: 256,
            label: *b"frozenfs\0\0\0\0\0\0\0\0",
            uuid: *b"\x7Af\x12\x09frozenfs-vol",
            journal: true,
            journal_blocks: 0,
        }
    }
}

/// Per-group layout computed while formatting.
struct GroupLayout {
    first: u64,
    blocks: u32,
    has_super: bool,
    block_bitmap: u64,
    inode_bitmap: u64,
    itable: u64,
    /// First block of the data area.
    data_start: u64,
    /// In-memory block bitmap.
    bmap: Vec<u8>,
}

impl GroupLayout {
    /// Claims the next free block of this group's data area.
    fn alloc(&mut self) -> Option<u64> {
        let start = (self.data_start - self.first) as u32;
        let bit = bitmap::bit_find_clr(&self.bmap, start, self.blocks).ok()?;
        bitmap::bit_set(&mut self.bmap, bit);
        Some(self.first + u64::from(bit))
    }

    /// Claims `count` contiguous blocks, or nothing.
    fn alloc_contiguous(&mut self, count: u32) -> Option<u64> {
        let start = (self.data_start - self.first) as u32;
        let mut run_start = start;
        let mut run = 0u32;

        for bit in start..self.blocks {
            if bitmap::is_bit_clr(&self.bmap, bit) {
                if run == 0 {
                    run_start = bit;
                }
                run += 1;
                if run == count {
                    bitmap::bits_set(&mut self.bmap, run_start, count);
                    return Some(self.first + u64::from(run_start));
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn free_count(&self) -> u32 {
        bitmap::count_clr(&self.bmap, self.blocks)
    }
}

/// Formats `dev` with a fresh filesystem.
pub fn mkfs(dev: Box<dyn BlockDevice>, opts: &MkfsOptions) -> CanFail<Ext4Error> {
    if !matches!(opts.block_size, 1024 | 2048 | 4096) || opts.inode_size < 128 {
        return Err(Ext4Error::InvalidArgument);
    }

    let mut bdev = Blockdev::new(dev, 8)?;
    bdev.set_lg_bsize(opts.block_size);

    let bsize = opts.block_size;
    let blocks_count = bdev.lg_bcnt();
    let first_data_block: u64 = if bsize == 1024 { 1 } else { 0 };
    let blocks_per_group = 8 * bsize;

    if blocks_count < first_data_block + 64 {
        return Err(Ext4Error::NoSpace);
    }

    let bg_count = ((blocks_count - first_data_block + u64::from(blocks_per_group) - 1)
        / u64::from(blocks_per_group)) as u32;

    // one inode per four blocks, rounded to whole bitmap bytes, capped
    // by what one bitmap block can describe
    let inodes_per_group = ((blocks_per_group / 4).clamp(16, 8 * bsize) + 7) & !7;
    let itable_blocks =
        (inodes_per_group * u32::from(opts.inode_size) + bsize - 1) / bsize;
    let desc_size = 32u32;
    let gdt_blocks = (bg_count * desc_size + bsize - 1) / bsize;

    // build the in-memory superblock first: the layout helpers hang off
    // of it
    let mut sb = Superblock::zeroed();
    sb.magic = Ext4Magic(EXT4_MAGIC.to_le());
    sb.blocks_count_lo = (blocks_count as u32).to_le();
    sb.first_data_block = (first_data_block as u32).to_le();
    sb.log_block_size = (bsize.trailing_zeros() - 10).to_le();
    sb.log_cluster_size = sb.log_block_size;
    sb.blocks_per_group = blocks_per_group.to_le();
    sb.clusters_per_group = blocks_per_group.to_le();
    sb.inodes_per_group = inodes_per_group.to_le();
    sb.inodes_count = (inodes_per_group * bg_count).to_le();
    sb.first_ino = inode::GOOD_OLD_FIRST_INO.to_le();
    sb.inode_size = opts.inode_size.to_le();
    sb.rev_level = 1u32.to_le();
    sb.state = 1u16.to_le(); // cleanly unmounted
    sb.errors = 1u16.to_le(); // continue on error
    sb.min_extra_isize = 32u16.to_le();
    sb.want_extra_isize = 32u16.to_le();
    sb.checksum_type = 1;
    sb.volume_name = opts.label;
    sb.uuid = opts.uuid;
    sb.def_hash_version = dir_idx::HASH_HALF_MD4;
    sb.hash_seed = [
        crc32c_calc(!0, &opts.uuid[..4]).to_le(),
        crc32c_calc(!0, &opts.uuid[4..8]).to_le(),
        crc32c_calc(!0, &opts.uuid[8..12]).to_le(),
        crc32c_calc(!0, &opts.uuid[12..]).to_le(),
    ];

    let mut compat = CompatibleFeatureSet::EXT_ATTR.0 | CompatibleFeatureSet::DIR_INDEX.0;
    if opts.journal {
        compat |= CompatibleFeatureSet::HAS_JOURNAL.0;
    }
    sb.feature_compat = compat.to_le();
    sb.feature_incompat =
        (IncompatibleFeatureSet::FILETYPE.0 | IncompatibleFeatureSet::EXTENTS.0).to_le();
    sb.feature_ro_compat = (ReadOnlyCompatibleFeatureSet::SPARSE_SUPER.0
        | ReadOnlyCompatibleFeatureSet::LARGE_FILE.0
        | ReadOnlyCompatibleFeatureSet::EXTRA_ISIZE.0
        | ReadOnlyCompatibleFeatureSet::METADATA_CSUM.0)
        .to_le();

    // lay the groups out
    let mut groups: Vec<GroupLayout> = Vec::with_capacity(bg_count as usize);
    for bg in 0..bg_count {
        let first = sb.bg_first_block(bg);
        let blocks = sb.blocks_in_group(bg);
        let has_super = sb.bg_has_super(bg);
        let meta = if has_super { 1 + u64::from(gdt_blocks) } else { 0 };

        let block_bitmap = first + meta;
        let inode_bitmap = block_bitmap + 1;
        let itable = inode_bitmap + 1;
        let data_start = itable + u64::from(itable_blocks);

        if data_start >= first + u64::from(blocks) {
            return Err(Ext4Error::NoSpace);
        }

        let mut bmap = vec![0u8; (blocks_per_group / 8) as usize];
        bitmap::bits_set(&mut bmap, 0, (data_start - first) as u32);
        // pad the short tail of the last group
        if blocks < blocks_per_group {
            bitmap::bits_set(&mut bmap, blocks, blocks_per_group - blocks);
        }

        groups.push(GroupLayout {
            first,
            blocks,
            has_super,
            block_bitmap,
            inode_bitmap,
            itable,
            data_start,
            bmap,
        });
    }

    // journal area: a contiguous run, taken from the roomiest group
    let journal_blocks = if opts.journal {
        let auto = (blocks_count / 64).clamp(256, 4096) as u32;
        let wanted = if opts.journal_blocks != 0 {
            opts.journal_blocks
        } else {
            auto
        };
        wanted.min(blocks_per_group / 2)
    } else {
        0
    };

    let mut journal_start = 0u64;
    if journal_blocks > 0 {
        let bg = groups
            .iter()
            .enumerate()
            .max_by_key(|(_, g)| g.free_count())
            .map(|(i, _)| i)
            .unwrap();
        journal_start = groups[bg]
            .alloc_contiguous(journal_blocks)
            .ok_or(Ext4Error::NoSpace)?;
    }

    // root and lost+found directory blocks
    let root_block = groups[0].alloc().ok_or(Ext4Error::NoSpace)?;
    let lpf_block = groups[0].alloc().ok_or(Ext4Error::NoSpace)?;

    // counters
    let free_blocks: u64 = groups.iter().map(|g| u64::from(g.free_count())).sum();
    let used_inodes = inode::GOOD_OLD_FIRST_INO; // 1..=11
    sb.set_free_blk_count(free_blocks);
    sb.set_free_inodes_count(inodes_per_group * bg_count - used_inodes);
    sb.lpf_ino = inode::GOOD_OLD_FIRST_INO.to_le();
    if opts.journal {
        sb.journal_inum = inode::JOURNAL_INO.to_le();
    }

    // group descriptors
    let mut descs: Vec<Ext4GroupDescriptor> = Vec::with_capacity(bg_count as usize);
    for (bg, g) in groups.iter().enumerate() {
        let mut d = Ext4GroupDescriptor::zeroed();
        d.block_bitmap_lo = (g.block_bitmap as u32).to_le();
        d.inode_bitmap_lo = (g.inode_bitmap as u32).to_le();
        d.inode_table_lo = (g.itable as u32).to_le();
        d.set_free_blocks_count(&sb, g.free_count());

        let (free_inodes, dirs, unused) = if bg == 0 {
            (inodes_per_group - used_inodes, 2, inodes_per_group - used_inodes)
        } else {
            (inodes_per_group, 0, inodes_per_group)
        };
        d.set_free_inodes_count(&sb, free_inodes);
        d.set_used_dirs_count(&sb, dirs);
        d.set_itable_unused(&sb, unused);

        descs.push(d);
    }

    // inode bitmaps: group 0 reserves inodes 1..=11
    let mut inode_bitmaps: Vec<Vec<u8>> = Vec::with_capacity(bg_count as usize);
    for bg in 0..bg_count {
        let mut bmap = vec![0u8; (bsize / 8).max(inodes_per_group / 8) as usize];
        if bg == 0 {
            bitmap::bits_set(&mut bmap, 0, used_inodes);
        }
        let total_bits = (bmap.len() * 8) as u32;
        bitmap::bits_set(&mut bmap, inodes_per_group, total_bits - inodes_per_group);
        inode_bitmaps.push(bmap);
    }

    // bitmap checksums into the descriptors
    for bg in 0..bg_count as usize {
        let bcsum = crc32c_calc(
            sb.csum_seed(),
            &groups[bg].bmap[..(blocks_per_group as usize + 7) / 8],
        );
        descs[bg].set_block_bitmap_csum(&sb, bcsum & 0xFFFF);
        let icsum = crc32c_calc(
            sb.csum_seed(),
            &inode_bitmaps[bg][..(inodes_per_group as usize + 7) / 8],
        );
        descs[bg].set_inode_bitmap_csum(&sb, icsum & 0xFFFF);
        let bg32 = bg as u32;
        descs[bg].update_chksum(&sb, bg32);
    }

    // ----- write everything out -----
    let bsize_bytes = bsize as usize;
    let zero_block = vec![0u8; bsize_bytes];

    // inode tables (zeroed) and bitmaps
    for (bg, g) in groups.iter().enumerate() {
        for i in 0..itable_blocks {
            bdev.blocks_write_direct(g.itable + u64::from(i), 1, &zero_block)?;
        }

        let mut bmap_block = zero_block.clone();
        bmap_block[..g.bmap.len()].copy_from_slice(&g.bmap);
        bdev.blocks_write_direct(g.block_bitmap, 1, &bmap_block)?;

        let mut imap_block = zero_block.clone();
        let ib = &inode_bitmaps[bg];
        imap_block[..ib.len().min(bsize_bytes)].copy_from_slice(&ib[..ib.len().min(bsize_bytes)]);
        bdev.blocks_write_direct(g.inode_bitmap, 1, &imap_block)?;
    }

    // descriptor table, replicated in every group carrying a superblock
    let mut gdt = vec![0u8; (gdt_blocks * bsize) as usize];
    for (bg, d) in descs.iter().enumerate() {
        let off = bg * desc_size as usize;
        gdt[off..off + desc_size as usize]
            .copy_from_slice(&bytes_of(d)[..desc_size as usize]);
    }
    for g in groups.iter().filter(|g| g.has_super) {
        for i in 0..gdt_blocks {
            let off = (i * bsize) as usize;
            bdev.blocks_write_direct(
                g.first + 1 + u64::from(i),
                1,
                &gdt[off..off + bsize_bytes],
            )?;
        }
    }

    // root directory block
    {
        let mut data = vec![0u8; bsize_bytes];
        let usable = dir::usable_block_len(&sb);
        dir::init_free_block(&mut data, usable);
        let dot_len = dir::required_len(1);
        let dotdot_len = dir::required_len(2);
        dir::write_entry(&mut data, 0, inode::ROOT_INO, dot_len, b".", file_type::DIRECTORY);
        dir::write_entry(
            &mut data,
            dot_len,
            inode::ROOT_INO,
            dotdot_len,
            b"..",
            file_type::DIRECTORY,
        );
        dir::write_entry(
            &mut data,
            dot_len + dotdot_len,
            inode::GOOD_OLD_FIRST_INO,
            usable - dot_len - dotdot_len,
            b"lost+found",
            file_type::DIRECTORY,
        );
        dir::set_dir_block_csum(&sb, inode::ROOT_INO, 1, &mut data);
        bdev.blocks_write_direct(root_block, 1, &data)?;
    }

    // lost+found directory block
    {
        let mut data = vec![0u8; bsize_bytes];
        let usable = dir::usable_block_len(&sb);
        dir::init_free_block(&mut data, usable);
        let dot_len = dir::required_len(1);
        dir::write_entry(
            &mut data,
            0,
            inode::GOOD_OLD_FIRST_INO,
            dot_len,
            b".",
            file_type::DIRECTORY,
        );
        dir::write_entry(
            &mut data,
            dot_len,
            inode::ROOT_INO,
            usable - dot_len,
            b"..",
            file_type::DIRECTORY,
        );
        dir::set_dir_block_csum(&sb, inode::GOOD_OLD_FIRST_INO, 1, &mut data);
        bdev.blocks_write_direct(lpf_block, 1, &data)?;
    }

    // journal superblock
    if journal_blocks > 0 {
        let mut jsb = JbdSb::zeroed();
        jsb.header = JbdBlockHeader::new(SUPERBLOCK_V2, 0);
        jsb.blocksize = bsize.to_be();
        jsb.maxlen = journal_blocks.to_be();
        jsb.first = 1u32.to_be();
        jsb.sequence = 1u32.to_be();
        jsb.start = 0;
        jsb.feature_compat = 0x1u32.to_be(); // v1 checksums
        jsb.feature_incompat = 0x1u32.to_be(); // revoke records
        jsb.uuid = opts.uuid;
        jsb.nr_users = 1u32.to_be();

        let mut data = vec![0u8; bsize_bytes];
        data[..core::mem::size_of::<JbdSb>()].copy_from_slice(bytes_of(&jsb));
        bdev.blocks_write_direct(journal_start, 1, &data)?;
    }

    // inodes: root (2), journal (8), lost+found (11); the rest of the
    // reserved range stays zeroed
    let write_inode = |bdev: &mut Blockdev,
                       sb: &Superblock,
                       groups: &[GroupLayout],
                       ino: u32,
                       image: &Ext4Inode|
     -> CanFail<Ext4Error> {
        let bg = (ino - 1) / inodes_per_group;
        let idx = (ino - 1) % inodes_per_group;
        let byte = u64::from(idx) * u64::from(opts.inode_size);
        let blk = groups[bg as usize].itable + byte / u64::from(bsize);
        let off = (byte % u64::from(bsize)) as usize;

        let mut block = vec![0u8; bsize as usize];
        bdev.blocks_read_direct(blk, 1, &mut block)?;
        let record = &mut block[off..off + usize::from(opts.inode_size)];
        let n = usize::from(opts.inode_size).min(inode::INODE_STRUCT_SIZE);
        record[..n].copy_from_slice(&bytes_of(image)[..n]);
        set_inode_csum(sb, ino, image.generation(), record);
        bdev.blocks_write_direct(blk, 1, &block)
    };

    let dir_inode = |ino_block: u64, links: u16| -> Ext4Inode {
        let mut i = Ext4Inode::zeroed();
        i.set_mode(InodeFileMode(
            InodeFileMode::S_IFDIR.0 | InodeFileMode::DEFAULT_DIR_PERM.0,
        ));
        i.set_links_count(links);
        i.set_size(u64::from(bsize));
        i.set_generation(1);
        i.extra_isize = 32u16.to_le();
        i.set_flags(InodeFlags::EXTENTS_FL);
        i.adjust_blocks_count(&sb, 1);
        extent_root_single(&mut i, 0, ino_block, 1);
        i
    };

    write_inode(&mut bdev, &sb, &groups, inode::ROOT_INO, &dir_inode(root_block, 3))?;
    write_inode(
        &mut bdev,
        &sb,
        &groups,
        inode::GOOD_OLD_FIRST_INO,
        &dir_inode(lpf_block, 2),
    )?;

    if journal_blocks > 0 {
        let mut j = Ext4Inode::zeroed();
        j.set_mode(InodeFileMode(InodeFileMode::S_IFREG.0 | 0o600));
        j.set_links_count(1);
        j.set_size(u64::from(journal_blocks) * u64::from(bsize));
        j.set_generation(1);
        j.extra_isize = 32u16.to_le();
        j.set_flags(InodeFlags::EXTENTS_FL);
        j.adjust_blocks_count(&sb, i64::from(journal_blocks));
        extent_root_runs(&mut j, journal_start, journal_blocks);
        write_inode(&mut bdev, &sb, &groups, inode::JOURNAL_INO, &j)?;
    }

    // primary superblock and its sparse replicas
    sb.update_chksum();
    bdev.write_bytes(SUPERBLOCK_OFFSET, bytes_of(&sb))?;
    for (bg, g) in groups.iter().enumerate().skip(1) {
        if g.has_super {
            let mut copy = sb;
            copy.block_group_nr = (bg as u16).to_le();
            copy.update_chksum();
            bdev.blocks_write_direct(g.first, 1, &zero_block)?;
            bdev.write_bytes(g.first * u64::from(bsize), bytes_of(&copy))?;
        }
    }

    bdev.flush_barrier()?;
    info!(
        target: "ext4",
        "formatted: {} blocks of {} bytes, {} groups, journal = {} blocks",
        blocks_count,
        bsize,
        bg_count,
        journal_blocks
    );
    bdev.close()
}

/// Writes a single-extent tree root into `i_block`.
fn extent_root_single(inode: &mut Ext4Inode, lblk: u32, start: u64, len: u16) {
    let mut root = [0u8; 60];
    root[..2].copy_from_slice(&extent::EXTENT_MAGIC.to_le_bytes());
    root[2..4].copy_from_slice(&1u16.to_le_bytes()); // entries
    root[4..6].copy_from_slice(&4u16.to_le_bytes()); // max
    let ext = Ext4Extent::new(lblk, start, len);
    root[12..24].copy_from_slice(bytes_of(&ext));
    inode.block = root;
}

/// Writes a contiguous run as up to four root extents (32768 blocks
/// each).
fn extent_root_runs(inode: &mut Ext4Inode, start: u64, blocks: u32) {
    let mut root = [0u8; 60];
    root[..2].copy_from_slice(&extent::EXTENT_MAGIC.to_le_bytes());
    root[4..6].copy_from_slice(&4u16.to_le_bytes());

    let mut entries = 0u16;
    let mut done = 0u32;
    while done < blocks && entries < 4 {
        let len = (blocks - done).min(u32::from(extent::EXT_INIT_MAX_LEN)) as u16;
        let ext = Ext4Extent::new(done, start + u64::from(done), len);
        let off = 12 + usize::from(entries) * 12;
        root[off..off + 12].copy_from_slice(bytes_of(&ext));
        entries += 1;
        done += u32::from(len);
    }
    root[2..4].copy_from_slice(&entries.to_le_bytes());
    inode.block = root;
}
