//! ext4 Superblock related structures.
//!
//! The superblock stores various information about the filesystem
//! (supported features, block count, inode count, ...). It lives in the
//! fixed 1024 bytes at byte offset 1024 of the partition.
//!
//! Copies of the `Superblock` structure are kept in each block group,
//! unless the `sparse_super` feature is set in which case it is only kept
//! in block groups whose number is 0, 1 or a power of 3, 5 or 7.

use bytemuck::{bytes_of, from_bytes, Pod, Zeroable};
use log::error;

use crate::blockdev::Blockdev;
use crate::errors::{CanFail, Ext4Error, FsResult};
use crate::fs::ext4::checksum::crc32c_calc;

/// Byte offset of the superblock from the partition start.
pub(crate) const SUPERBLOCK_OFFSET: u64 = 1024;

/// Size of the on-disk superblock structure.
pub(crate) const SUPERBLOCK_SIZE: usize = 1024;

/// `ext4` magic signature.
pub(crate) const EXT4_MAGIC: u16 = 0xEF53;

/// Byte offset of the `checksum` field inside the superblock; the
/// superblock checksum covers everything before it.
const CHECKSUM_OFFSET: usize = 0x3FC;

/// Defines a standard structure for flag-related fields of on-disk
/// structures.
#[macro_export]
macro_rules! ext4_flag_field {
    ($struct_name: tt, $size: ident, $desc: literal) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            bytemuck::Pod,
            bytemuck::Zeroable,
        )]
        #[repr(transparent)]
        #[doc=$desc]
        pub struct $struct_name(pub(crate) $size);

        impl core::ops::BitAnd for $struct_name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self::Output {
                Self(self.0 & rhs.0)
            }
        }

        impl core::ops::BitOr for $struct_name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl core::ops::BitXor for $struct_name {
            type Output = Self;

            fn bitxor(self, rhs: Self) -> Self::Output {
                Self(self.0 ^ rhs.0)
            }
        }

        impl $struct_name {
            /// Checks if this feature set is a subset of (included in)
            /// the feature set passed as argument.
            pub(crate) fn is_subset_of(self, features: Self) -> bool {
                (self | features) ^ features == Self(0)
            }

            /// Extends this feature set with the flags of another set.
            #[allow(dead_code)]
            pub(crate) fn extend_from_set(&mut self, features: Self) {
                self.0 |= features.0;
            }

            /// Checks if this feature set includes the set passed as
            /// argument.
            pub(crate) fn includes(self, features: Self) -> bool {
                features.is_subset_of(self)
            }
        }
    };
}

ext4_flag_field!(
    CompatibleFeatureSet,
    u32,
    "Compatible feature set flags. The system may still read/write to this \
filesystem even if it doesn't implement all flags defined in the \
superblock."
);

impl CompatibleFeatureSet {
    /// Directory preallocation.
    #[allow(dead_code)]
    pub(crate) const DIR_PREALLOC: Self = Self(0x0001);

    /// Create a journal file to ensure file system consistency (even
    /// across dirty shutdowns).
    pub(crate) const HAS_JOURNAL: Self = Self(0x0004);

    /// This feature enables the use of extended attributes.
    pub(crate) const EXT_ATTR: Self = Self(0x0008);

    /// This feature indicates that space has been reserved so that the
    /// block group descriptor table can be extended while resizing a
    /// mounted file system.
    #[allow(dead_code)]
    pub(crate) const RESIZE_INODE: Self = Self(0x0010);

    /// Use hashed B-trees to speed up name lookup in large directories.
    pub(crate) const DIR_INDEX: Self = Self(0x0020);
}

ext4_flag_field!(
    IncompatibleFeatureSet,
    u32,
    "Incompatible feature set flags. The system must not mount the \
filesystem if it does not understand one of the incompatible feature \
flags defined in the superblock."
);

impl IncompatibleFeatureSet {
    /// Enables the storage of file type information in directory entries.
    pub(crate) const FILETYPE: Self = Self(0x0002);

    /// File system needs journal recovery.
    pub(crate) const RECOVER: Self = Self(0x0004);

    /// This feature is set on the superblock found on an external journal
    /// device.
    #[allow(dead_code)]
    pub(crate) const JOURNAL_DEV: Self = Self(0x0008);

    /// Meta block groups: the descriptor table is spread across the
    /// filesystem instead of being packed after the superblock.
    pub(crate) const META_BG: Self = Self(0x0010);

    /// Logical-to-physical block mapping stored as an extent tree
    /// instead of the traditional indirect block scheme of `ext2` and
    /// `ext3`.
    pub(crate) const EXTENTS: Self = Self(0x0040);

    /// This feature allows for a file system size above 2^32 blocks.
    pub(crate) const INCOMPAT_64BIT: Self = Self(0x0080);

    /// Multiple mount protection. Ignored: the core never runs
    /// concurrently with another mount.
    pub(crate) const MMP: Self = Self(0x0100);

    /// Per-flex-group placement of block group metadata.
    pub(crate) const FLEX_BG: Self = Self(0x0200);

    /// Metadata checksum seed stored in the superblock.
    pub(crate) const CSUM_SEED: Self = Self(0x2000);

    /// File data may be stored in the inode and extended attribute area.
    pub(crate) const INLINE_DATA: Self = Self(0x8000);

    /// Every incompatible feature this implementation understands.
    /// Mounts presenting any other bit are refused.
    pub(crate) const SUPPORTED: Self = Self(
        Self::FILETYPE.0
            | Self::RECOVER.0
            | Self::META_BG.0
            | Self::EXTENTS.0
            | Self::INCOMPAT_64BIT.0
            | Self::MMP.0
            | Self::FLEX_BG.0
            | Self::CSUM_SEED.0
            | Self::INLINE_DATA.0,
    );
}

ext4_flag_field!(
    ReadOnlyCompatibleFeatureSet,
    u32,
    "Read-only compatible feature set flags. If the system does not \
understand one of these flags, it may still mount the filesystem \
read-only."
);

impl ReadOnlyCompatibleFeatureSet {
    /// Backup copies of the superblock are present only in a subset of
    /// block groups.
    pub(crate) const SPARSE_SUPER: Self = Self(0x0001);

    /// Set when a file larger than 2 GiB exists.
    pub(crate) const LARGE_FILE: Self = Self(0x0002);

    /// Allows files larger than 2 TiB.
    #[allow(dead_code)]
    pub(crate) const HUGE_FILE: Self = Self(0x0008);

    /// Group descriptors have CRC16 checksums.
    pub(crate) const GDT_CSUM: Self = Self(0x0010);

    /// Lifts the usual 65,000 hard links limit per inode.
    pub(crate) const DIR_NLINK: Self = Self(0x0020);

    /// Reserved space in each inode for extended metadata.
    pub(crate) const EXTRA_ISIZE: Self = Self(0x0040);

    /// Checksums on all of the filesystem metadata.
    pub(crate) const METADATA_CSUM: Self = Self(0x0400);
}

/// Magic signature of the superblock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub(crate) struct Ext4Magic(pub(crate) u16);

impl Ext4Magic {
    pub(crate) fn is_valid(self) -> bool {
        u16::from_le(self.0) == EXT4_MAGIC
    }
}

/// The ext4 `Superblock` holds useful information about the filesystem's
/// characteristics and attributes (block count, sizes, required
/// features, ...).
///
/// Every multi-byte field is little-endian on disk; the accessors below
/// perform the conversion, so the raw fields must never be interpreted
/// directly.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Superblock {
    /// Inodes count
    pub(crate) inodes_count: u32,

    /// Blocks count (low 32-bits)
    pub(crate) blocks_count_lo: u32,

    /// Reserved blocks count
    pub(crate) r_blocks_count_lo: u32,

    /// Free blocks count (low 32-bits)
    pub(crate) free_blocks_count_lo: u32,

    /// Free inodes count
    pub(crate) free_inodes_count: u32,

    /// First data block: block number of the block containing the
    /// superblock
    pub(crate) first_data_block: u32,

    /// Block size, defined as `log_2(block_size) - 10`
    pub(crate) log_block_size: u32,

    /// Allocation cluster size, defined as `log_2(cluster_size) - 10`
    pub(crate) log_cluster_size: u32,

    /// Number of blocks in each group
    pub(crate) blocks_per_group: u32,

    /// Number of clusters in each group
    pub(crate) clusters_per_group: u32,

    /// Number of inodes in each group
    pub(crate) inodes_per_group: u32,

    /// Last mount time
    pub(crate) mtime: u32,

    /// Last write time
    pub(crate) wtime: u32,

    /// Mount count since last consistency check
    pub(crate) mnt_count: u16,

    /// Number of mounts allowed before a consistency check is required
    pub(crate) max_mnt_count: u16,

    /// `ext4` magic signature: `0xEF53`
    pub(crate) magic: Ext4Magic,

    /// File system state
    pub(crate) state: u16,

    /// Behavior on error detection
    pub(crate) errors: u16,

    /// Minor revision level
    pub(crate) minor_rev_level: u16,

    /// Time of last consistency check
    pub(crate) lastcheck: u32,

    /// Max time between successive consistency checks
    pub(crate) checkinterval: u32,

    /// Operating system ID from which the filesystem was created
    pub(crate) creator_os: u32,

    /// Major revision level
    pub(crate) rev_level: u32,

    /// Default user ID for reserved blocks
    pub(crate) def_resuid: u16,

    /// Default group ID for reserved blocks
    pub(crate) def_resgid: u16,

    /// First non-reserved inode in file system
    pub(crate) first_ino: u32,

    /// Size of each inode structure, in bytes
    pub(crate) inode_size: u16,

    /// Block group number of this superblock copy
    pub(crate) block_group_nr: u16,

    /// Compatible feature set
    pub(crate) feature_compat: u32,

    /// Incompatible feature set
    pub(crate) feature_incompat: u32,

    /// Read-only compatible feature set
    pub(crate) feature_ro_compat: u32,

    /// 128-bit UUID for volume
    pub(crate) uuid: [u8; 16],

    /// Volume name
    pub(crate) volume_name: [u8; 16],

    /// Path volume was last mounted to
    pub(crate) last_mounted: [u8; 64],

    /// Compression algorithm used
    pub(crate) algo_bitmap: u32,

    /// Number of blocks to try to preallocate for files
    pub(crate) prealloc_blocks: u8,

    /// Number of blocks to preallocate for directories
    pub(crate) prealloc_dir_blocks: u8,

    /// Blocks reserved for future BGDT expansion
    pub(crate) reserved_gdt_blocks: u16,

    /// UUID of journal superblock
    pub(crate) journal_uuid: [u8; 16],

    /// Inode number of the journal file
    pub(crate) journal_inum: u32,

    /// Device number of the journal file
    pub(crate) journal_dev: u32,

    /// Start of list of inodes to delete (orphan nodes)
    pub(crate) last_orphan: u32,

    /// HTREE hash seed
    pub(crate) hash_seed: [u32; 4],

    /// Default hash version to use
    pub(crate) def_hash_version: u8,

    pub(crate) jnl_backup_type: u8,

    /// Size of a block group descriptor, when the 64-bit feature is set
    pub(crate) desc_size: u16,

    /// Default mount options
    pub(crate) default_mount_opts: u32,

    /// First metablock block group, if enabled
    pub(crate) first_meta_bg: u32,

    /// File system creation time
    pub(crate) mkfs_time: u32,

    /// Backup of the journal inode's `i_block` and size
    pub(crate) jnl_blocks: [u32; 17],

    /// Blocks count (high 32-bits), valid with the 64-bit feature
    pub(crate) blocks_count_hi: u32,

    /// Reserved blocks count (high 32-bits)
    pub(crate) r_blocks_count_hi: u32,

    /// Free blocks count (high 32-bits)
    pub(crate) free_blocks_count_hi: u32,

    /// Every inode has at least this many extra bytes
    pub(crate) min_extra_isize: u16,

    /// New inodes should reserve this many extra bytes
    pub(crate) want_extra_isize: u16,

    /// Miscellaneous flags
    pub(crate) flags: u32,

    /// RAID stride
    pub(crate) raid_stride: u16,

    /// Seconds to wait in multi-mount prevention checking
    pub(crate) mmp_interval: u16,

    /// Block for multi-mount protection
    pub(crate) mmp_block: u64,

    /// RAID stripe width
    pub(crate) raid_stripe_width: u32,

    /// `FLEX_BG` group size, defined as `log_2(groups_per_flex)`
    pub(crate) log_groups_per_flex: u8,

    /// Metadata checksum algorithm used (1 = crc32c)
    pub(crate) checksum_type: u8,

    reserved_pad: u16,

    /// Amount of KiB written over the filesystem's lifetime
    pub(crate) kbytes_written: u64,

    /// Inode number of the active snapshot
    pub(crate) snapshot_inum: u32,

    /// Sequential ID of the active snapshot
    pub(crate) snapshot_id: u32,

    /// Reserved blocks for the active snapshot's future use
    pub(crate) snapshot_r_blocks_count: u64,

    /// Inode number of the head of the on-disk snapshot list
    pub(crate) snapshot_list: u32,

    /// Number of filesystem errors
    pub(crate) error_count: u32,

    /// First time an error occurred
    pub(crate) first_error_time: u32,

    /// Inode involved in the first error
    pub(crate) first_error_ino: u32,

    /// Block involved in the first error
    pub(crate) first_error_block: u64,

    /// Function where the first error occurred
    pub(crate) first_error_func: [u8; 32],

    /// Line number where the first error occurred
    pub(crate) first_error_line: u32,

    /// Last time an error occurred
    pub(crate) last_error_time: u32,

    /// Inode involved in the last error
    pub(crate) last_error_ino: u32,

    /// Line number where the last error occurred
    pub(crate) last_error_line: u32,

    /// Block involved in the last error
    pub(crate) last_error_block: u64,

    /// Function where the last error occurred
    pub(crate) last_error_func: [u8; 32],

    /// Mount options (C string)
    pub(crate) mount_opts: [u8; 64],

    /// Inode number for the user quota file
    pub(crate) usr_quota_inum: u32,

    /// Inode number for the group quota file
    pub(crate) grp_quota_inum: u32,

    /// Overhead blocks/clusters in the file system
    pub(crate) overhead_blocks: u32,

    /// Block groups with backup superblocks, if `sparse_super2` is set
    pub(crate) backup_bgs: [u32; 2],

    /// Encryption algorithms in use
    pub(crate) encrypt_algos: [u8; 4],

    /// Salt used for the `string2key` algorithm
    pub(crate) encrypt_pw_salt: [u8; 16],

    /// Location of the lost+found inode
    pub(crate) lpf_ino: u32,

    /// Inode for tracking project quota
    pub(crate) prj_quota_inum: u32,

    /// `crc32c(~0, uuid)` if the `csum_seed` feature is set
    pub(crate) checksum_seed: u32,

    /// High 8 bits of timestamp fields
    pub(crate) wtime_hi: u8,
    pub(crate) mtime_hi: u8,
    pub(crate) mkfs_time_hi: u8,
    pub(crate) lastcheck_hi: u8,
    pub(crate) first_error_time_hi: u8,
    pub(crate) last_error_time_hi: u8,

    /// Error codes of the first and last errors
    pub(crate) first_error_errcode: u8,
    pub(crate) last_error_errcode: u8,

    /// Filename charset encoding
    pub(crate) encoding: u16,

    /// Filename charset encoding flags
    pub(crate) encoding_flags: u16,

    /// Inode for tracking orphan inodes
    pub(crate) orphan_file_inum: u32,

    reserved: [u32; 94],

    /// Checksum of the superblock: `crc32c(~0, superblock[..0x3FC])`
    pub(crate) checksum: u32,
}

const _: () = assert!(core::mem::size_of::<Superblock>() == SUPERBLOCK_SIZE);

impl Superblock {
    /// Loads the superblock from the 1024 bytes at partition offset 1024
    /// and validates it.
    pub(crate) fn load(bdev: &mut Blockdev) -> FsResult<Self> {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        bdev.read_bytes(SUPERBLOCK_OFFSET, &mut raw)?;

        let sb: Superblock = *from_bytes(&raw);
        sb.validate()?;

        Ok(sb)
    }

    /// Writes the superblock back to its primary location, refreshing
    /// the checksum first.
    pub(crate) fn save(&mut self, bdev: &mut Blockdev) -> CanFail<Ext4Error> {
        self.update_chksum();
        bdev.write_bytes(SUPERBLOCK_OFFSET, bytes_of(self))
    }

    /// Checks the structural invariants of the superblock: magic,
    /// geometry bounds, feature support and (when the feature is set)
    /// the checksum.
    pub(crate) fn validate(&self) -> CanFail<Ext4Error> {
        if !self.magic.is_valid() {
            error!(target: "ext4", "invalid superblock magic");
            return Err(Ext4Error::Corrupted);
        }

        let inode_size = u16::from_le(self.inode_size);
        let first_ino = u32::from_le(self.first_ino);
        let log_block_size = u32::from_le(self.log_block_size);

        if inode_size < 128 || first_ino < 11 || log_block_size > 6 {
            error!(target: "ext4", "invalid superblock geometry");
            return Err(Ext4Error::Corrupted);
        }

        if self.has_64bit() && !(32..=64).contains(&u16::from_le(self.desc_size)) {
            error!(target: "ext4", "invalid group descriptor size");
            return Err(Ext4Error::Unsupported);
        }

        if u32::from_le(self.blocks_per_group) == 0 || u32::from_le(self.inodes_per_group) == 0 {
            return Err(Ext4Error::Corrupted);
        }

        if !self
            .feature_incompat()
            .is_subset_of(IncompatibleFeatureSet::SUPPORTED)
        {
            error!(
                target: "ext4",
                "unsupported incompatible features {:#x}",
                u32::from_le(self.feature_incompat)
            );
            return Err(Ext4Error::Unsupported);
        }

        if self.has_metadata_csum() && !self.verify_chksum() {
            error!(target: "ext4", "invalid superblock checksum");
            return Err(Ext4Error::Corrupted);
        }

        Ok(())
    }

    pub(crate) fn feature_compat(&self) -> CompatibleFeatureSet {
        CompatibleFeatureSet(u32::from_le(self.feature_compat))
    }

    pub(crate) fn feature_incompat(&self) -> IncompatibleFeatureSet {
        IncompatibleFeatureSet(u32::from_le(self.feature_incompat))
    }

    pub(crate) fn feature_ro_compat(&self) -> ReadOnlyCompatibleFeatureSet {
        ReadOnlyCompatibleFeatureSet(u32::from_le(self.feature_ro_compat))
    }

    pub(crate) fn has_metadata_csum(&self) -> bool {
        self.feature_ro_compat()
            .includes(ReadOnlyCompatibleFeatureSet::METADATA_CSUM)
    }

    pub(crate) fn has_gdt_csum(&self) -> bool {
        self.feature_ro_compat()
            .includes(ReadOnlyCompatibleFeatureSet::GDT_CSUM)
    }

    pub(crate) fn has_64bit(&self) -> bool {
        self.feature_incompat()
            .includes(IncompatibleFeatureSet::INCOMPAT_64BIT)
    }

    /// Seed for every metadata checksum of this filesystem.
    pub(crate) fn csum_seed(&self) -> u32 {
        if self
            .feature_incompat()
            .includes(IncompatibleFeatureSet::CSUM_SEED)
        {
            u32::from_le(self.checksum_seed)
        } else {
            crc32c_calc(!0, &self.uuid)
        }
    }

    /// Logical block size, in bytes.
    pub(crate) fn blk_size(&self) -> u32 {
        1024 << u32::from_le(self.log_block_size)
    }

    pub(crate) fn first_data_block(&self) -> u32 {
        u32::from_le(self.first_data_block)
    }

    pub(crate) fn blocks_per_group(&self) -> u32 {
        u32::from_le(self.blocks_per_group)
    }

    pub(crate) fn inodes_per_group(&self) -> u32 {
        u32::from_le(self.inodes_per_group)
    }

    pub(crate) fn inodes_count(&self) -> u32 {
        u32::from_le(self.inodes_count)
    }

    pub(crate) fn inode_size(&self) -> u16 {
        u16::from_le(self.inode_size)
    }

    pub(crate) fn first_ino(&self) -> u32 {
        u32::from_le(self.first_ino)
    }

    /// Size of a single group descriptor, in bytes.
    pub(crate) fn desc_size(&self) -> u16 {
        if self.has_64bit() {
            u16::from_le(self.desc_size)
        } else {
            32
        }
    }

    /// Total number of blocks.
    pub(crate) fn blk_count(&self) -> u64 {
        let lo = u64::from(u32::from_le(self.blocks_count_lo));
        if self.has_64bit() {
            lo | (u64::from(u32::from_le(self.blocks_count_hi)) << 32)
        } else {
            lo
        }
    }

    pub(crate) fn free_blk_count(&self) -> u64 {
        let lo = u64::from(u32::from_le(self.free_blocks_count_lo));
        if self.has_64bit() {
            lo | (u64::from(u32::from_le(self.free_blocks_count_hi)) << 32)
        } else {
            lo
        }
    }

    pub(crate) fn set_free_blk_count(&mut self, count: u64) {
        self.free_blocks_count_lo = (count as u32).to_le();
        if self.has_64bit() {
            self.free_blocks_count_hi = ((count >> 32) as u32).to_le();
        }
    }

    pub(crate) fn free_inodes_count(&self) -> u32 {
        u32::from_le(self.free_inodes_count)
    }

    pub(crate) fn set_free_inodes_count(&mut self, count: u32) {
        self.free_inodes_count = count.to_le();
    }

    /// Number of block groups.
    pub(crate) fn bg_count(&self) -> u32 {
        let blocks = self.blk_count() - u64::from(self.first_data_block());
        let bpg = u64::from(self.blocks_per_group());
        ((blocks + bpg - 1) / bpg) as u32
    }

    /// Number of blocks in block group `bg` (the last group may be
    /// shorter).
    pub(crate) fn blocks_in_group(&self, bg: u32) -> u32 {
        let total = self.blk_count() - u64::from(self.first_data_block());
        let bpg = u64::from(self.blocks_per_group());
        let full = total / bpg;

        if u64::from(bg) < full {
            self.blocks_per_group()
        } else {
            (total % bpg) as u32
        }
    }

    /// First block of block group `bg`.
    pub(crate) fn bg_first_block(&self, bg: u32) -> u64 {
        u64::from(self.first_data_block()) + u64::from(bg) * u64::from(self.blocks_per_group())
    }

    /// Block group containing block `lba`.
    pub(crate) fn bg_of_block(&self, lba: u64) -> u32 {
        ((lba - u64::from(self.first_data_block())) / u64::from(self.blocks_per_group())) as u32
    }

    pub(crate) fn journal_inum(&self) -> u32 {
        u32::from_le(self.journal_inum)
    }

    pub(crate) fn hash_seed(&self) -> [u32; 4] {
        [
            u32::from_le(self.hash_seed[0]),
            u32::from_le(self.hash_seed[1]),
            u32::from_le(self.hash_seed[2]),
            u32::from_le(self.hash_seed[3]),
        ]
    }

    pub(crate) fn def_hash_version(&self) -> u8 {
        self.def_hash_version
    }

    /// Whether the unsigned char string-to-hash packing is in use.
    pub(crate) fn unsigned_hash(&self) -> bool {
        u32::from_le(self.flags) & 0x2 != 0
    }

    /// Whether block group `bg` carries a superblock (and BGDT) replica.
    ///
    /// With `sparse_super`, replicas only live in groups 0, 1 and powers
    /// of 3, 5 and 7.
    pub(crate) fn bg_has_super(&self, bg: u32) -> bool {
        if !self
            .feature_ro_compat()
            .includes(ReadOnlyCompatibleFeatureSet::SPARSE_SUPER)
        {
            return true;
        }

        if bg <= 1 {
            return true;
        }

        fn is_power_of(mut n: u32, base: u32) -> bool {
            while n % base == 0 {
                n /= base;
            }
            n == 1
        }

        is_power_of(bg, 3) || is_power_of(bg, 5) || is_power_of(bg, 7)
    }

    /// Compares the checksum of the superblock to its on-disk value.
    pub(crate) fn verify_chksum(&self) -> bool {
        let raw = bytes_of(self);
        crc32c_calc(!0, &raw[..CHECKSUM_OFFSET]) == u32::from_le(self.checksum)
    }

    /// Recomputes the superblock checksum.
    pub(crate) fn update_chksum(&mut self) {
        if self.checksum_type == 1 || self.has_metadata_csum() {
            let csum = {
                let raw = bytes_of(self);
                crc32c_calc(!0, &raw[..CHECKSUM_OFFSET])
            };
            self.checksum = csum.to_le();
        }
    }
}

impl core::fmt::Debug for Superblock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Superblock")
            .field("blocks", &self.blk_count())
            .field("inodes", &self.inodes_count())
            .field("blk_size", &self.blk_size())
            .field("bg_count", &self.bg_count())
            .field("free_blocks", &self.free_blk_count())
            .field("free_inodes", &self.free_inodes_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_super_replicas() {
        let mut sb = Superblock::zeroed();
        sb.feature_ro_compat = ReadOnlyCompatibleFeatureSet::SPARSE_SUPER.0.to_le();

        let with_super: alloc::vec::Vec<u32> = (0..50).filter(|&bg| sb.bg_has_super(bg)).collect();
        assert_eq!(with_super, alloc::vec![0, 1, 3, 5, 7, 9, 25, 27, 49]);
    }

    #[test]
    fn feature_subset_logic() {
        let supported = IncompatibleFeatureSet::SUPPORTED;
        assert!(IncompatibleFeatureSet::EXTENTS.is_subset_of(supported));
        assert!(!IncompatibleFeatureSet(0x10000).is_subset_of(supported));
        assert!(supported.includes(IncompatibleFeatureSet::FILETYPE));
    }

    #[test]
    fn checksum_roundtrip() {
        let mut sb = Superblock::zeroed();
        sb.magic = Ext4Magic(EXT4_MAGIC.to_le());
        sb.checksum_type = 1;
        sb.update_chksum();
        assert!(sb.verify_chksum());
        sb.inodes_count = 77u32.to_le();
        assert!(!sb.verify_chksum());
    }
}
