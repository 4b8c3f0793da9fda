//! JBD2-compatible journal.
//!
//! The journal is a circular log stored in the data blocks of a
//! reserved inode (usually #8). Each transaction is a run of log
//! blocks: one or more descriptor blocks listing the target physical
//! blocks, the data blocks themselves (escaped when their first four
//! bytes collide with the journal magic), optional revoke blocks, and a
//! commit block carrying the transaction's data checksum.
//!
//! Unlike the rest of the on-disk format, every journal field is
//! **big-endian**, per JBD2 convention.
//!
//! A transaction progresses through RUNNING (accepting buffers),
//! COMMITTING (descriptor + data + commit written to the log),
//! CHECKPOINTING (buffers written to their home locations) and FREE.
//! The commit path issues a device barrier between the data phase and
//! the commit block, and another one after it; only then does the
//! checkpoint pass run.

use alloc::vec;
use alloc::vec::Vec;
use bytemuck::{bytes_of, from_bytes, Pod, Zeroable};
use hashbrown::HashMap;
use log::{error, info, warn};

use crate::bcache::{Block, BufFlags};
use crate::blockdev::Blockdev;
use crate::errors::{CanFail, Ext4Error, FsResult};
use crate::fs::ext4::checksum::{crc32_calc, crc32c_calc};

/// Magic number opening every journal block.
pub(crate) const JBD_MAGIC: u32 = 0xC03B_3998;

/// Journal block types.
pub(crate) const DESCRIPTOR_BLOCK: u32 = 1;
pub(crate) const COMMIT_BLOCK: u32 = 2;
pub(crate) const SUPERBLOCK_V1: u32 = 3;
pub(crate) const SUPERBLOCK_V2: u32 = 4;
pub(crate) const REVOKE_BLOCK: u32 = 5;

/// Tag flags.
const FLAG_ESCAPE: u16 = 1;
const FLAG_SAME_UUID: u16 = 2;
const FLAG_LAST_TAG: u16 = 8;

/// Journal compatible features.
const FEATURE_COMPAT_CHECKSUM: u32 = 0x1;

/// Journal incompatible features.
const FEATURE_INCOMPAT_REVOKE: u32 = 0x1;
const FEATURE_INCOMPAT_64BIT: u32 = 0x2;
const FEATURE_INCOMPAT_ASYNC_COMMIT: u32 = 0x4;
const FEATURE_INCOMPAT_CSUM_V2: u32 = 0x8;
const FEATURE_INCOMPAT_CSUM_V3: u32 = 0x10;

const KNOWN_INCOMPAT: u32 = FEATURE_INCOMPAT_REVOKE
    | FEATURE_INCOMPAT_64BIT
    | FEATURE_INCOMPAT_ASYNC_COMMIT
    | FEATURE_INCOMPAT_CSUM_V2
    | FEATURE_INCOMPAT_CSUM_V3;

const UUID_SIZE: usize = 16;
const BHDR_SIZE: usize = 12;
const REVOKE_HEADER_SIZE: usize = 16;

/// Common header of every journal block.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct JbdBlockHeader {
    /// Magic number (`0xC03B3998`)
    pub(crate) magic: u32,

    /// Block type (descriptor, commit, revoke, superblock)
    pub(crate) blocktype: u32,

    /// Transaction sequence number
    pub(crate) sequence: u32,
}

const _: () = assert!(core::mem::size_of::<JbdBlockHeader>() == BHDR_SIZE);

impl JbdBlockHeader {
    pub(crate) fn new(blocktype: u32, sequence: u32) -> Self {
        Self {
            magic: JBD_MAGIC.to_be(),
            blocktype: blocktype.to_be(),
            sequence: sequence.to_be(),
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        u32::from_be(self.magic) == JBD_MAGIC
    }

    pub(crate) fn blocktype(&self) -> u32 {
        u32::from_be(self.blocktype)
    }

    pub(crate) fn sequence(&self) -> u32 {
        u32::from_be(self.sequence)
    }
}

/// Journal superblock, stored in log block 0.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub(crate) struct JbdSb {
    pub(crate) header: JbdBlockHeader,

    /// Journal device block size
    pub(crate) blocksize: u32,

    /// Total blocks in the journal file
    pub(crate) maxlen: u32,

    /// First block of log information
    pub(crate) first: u32,

    /// First commit ID expected in the log
    pub(crate) sequence: u32,

    /// Block number of the start of the log, 0 when clean
    pub(crate) start: u32,

    /// Error value, as set by journal abort
    pub(crate) error_val: i32,

    pub(crate) feature_compat: u32,
    pub(crate) feature_incompat: u32,
    pub(crate) feature_ro_compat: u32,

    /// 128-bit UUID of the journal
    pub(crate) uuid: [u8; UUID_SIZE],

    /// Number of filesystems sharing the log
    pub(crate) nr_users: u32,

    /// Block number of the dynamic superblock copy
    pub(crate) dynsuper: u32,

    /// Limit of journal blocks per transaction
    pub(crate) max_transaction: u32,

    /// Limit of data blocks per transaction
    pub(crate) max_trandata: u32,

    pub(crate) checksum_type: u8,
    padding2: [u8; 3],
    padding: [u32; 42],
    pub(crate) checksum: u32,

    /// IDs of every filesystem sharing the log
    pub(crate) users: [u8; UUID_SIZE * 48],
}

const _: () = assert!(core::mem::size_of::<JbdSb>() == 1024);

impl JbdSb {
    pub(crate) fn maxlen(&self) -> u32 {
        u32::from_be(self.maxlen)
    }

    pub(crate) fn first(&self) -> u32 {
        u32::from_be(self.first)
    }

    pub(crate) fn sequence(&self) -> u32 {
        u32::from_be(self.sequence)
    }

    pub(crate) fn start(&self) -> u32 {
        u32::from_be(self.start)
    }

    pub(crate) fn blocksize(&self) -> u32 {
        u32::from_be(self.blocksize)
    }

    fn has_incompat(&self, feature: u32) -> bool {
        u32::from_be(self.feature_incompat) & feature != 0
    }

    fn has_compat(&self, feature: u32) -> bool {
        u32::from_be(self.feature_compat) & feature != 0
    }

    fn is_64bit(&self) -> bool {
        self.has_incompat(FEATURE_INCOMPAT_64BIT)
    }

    fn csum_version(&self) -> u8 {
        if self.has_incompat(FEATURE_INCOMPAT_CSUM_V3) {
            3
        } else if self.has_incompat(FEATURE_INCOMPAT_CSUM_V2) {
            2
        } else {
            0
        }
    }

    /// Size of one descriptor tag, UUID excluded.
    fn tag_size(&self) -> usize {
        if self.csum_version() == 3 {
            16
        } else if self.is_64bit() {
            12
        } else {
            8
        }
    }
}

/// The journal area of a mounted filesystem: the mapping from log
/// blocks to their physical location, and the parsed log superblock.
pub(crate) struct JbdFs {
    /// Physical block of each journal block, in log order.
    lbas: Vec<u64>,

    pub(crate) sb: JbdSb,
}

impl JbdFs {
    /// Binds the journal area: `lbas` maps every log block to its
    /// physical address (built from the journal inode's extent tree).
    pub(crate) fn load(bdev: &mut Blockdev, lbas: Vec<u64>) -> FsResult<Self> {
        if lbas.is_empty() {
            return Err(Ext4Error::Corrupted);
        }

        let mut raw = vec![0u8; bdev.lg_bsize() as usize];
        bdev.blocks_read_direct(lbas[0], 1, &mut raw)?;
        let sb: JbdSb = *from_bytes(&raw[..core::mem::size_of::<JbdSb>()]);

        if !sb.header.is_valid()
            || !matches!(sb.header.blocktype(), SUPERBLOCK_V1 | SUPERBLOCK_V2)
        {
            error!(target: "ext4-journal", "invalid journal superblock");
            return Err(Ext4Error::Corrupted);
        }

        if u32::from_be(sb.feature_incompat) & !KNOWN_INCOMPAT != 0 {
            error!(target: "ext4-journal", "unsupported journal features");
            return Err(Ext4Error::Unsupported);
        }

        if sb.blocksize() != bdev.lg_bsize() || u64::from(sb.maxlen()) > lbas.len() as u64 {
            error!(target: "ext4-journal", "journal geometry mismatch");
            return Err(Ext4Error::Corrupted);
        }

        Ok(Self { lbas, sb })
    }

    fn read_log_block(&self, bdev: &mut Blockdev, jblock: u32, buf: &mut [u8]) -> CanFail<Ext4Error> {
        let lba = *self
            .lbas
            .get(jblock as usize)
            .ok_or(Ext4Error::Corrupted)?;
        bdev.blocks_read_direct(lba, 1, buf)
    }

    fn write_log_block(&self, bdev: &mut Blockdev, jblock: u32, buf: &[u8]) -> CanFail<Ext4Error> {
        let lba = *self
            .lbas
            .get(jblock as usize)
            .ok_or(Ext4Error::Corrupted)?;
        bdev.blocks_write_direct(lba, 1, buf)
    }

    /// Writes the (updated) journal superblock back to log block 0.
    fn write_sb(&mut self, bdev: &mut Blockdev) -> CanFail<Ext4Error> {
        let mut raw = vec![0u8; bdev.lg_bsize() as usize];
        raw[..core::mem::size_of::<JbdSb>()].copy_from_slice(bytes_of(&self.sb));
        self.write_log_block(bdev, 0, &raw)
    }
}

/// A buffer owned by a running transaction. Holding the block handle
/// pins the buffer in the cache until the transaction checkpoints.
struct JbdBuf {
    block: Block,
}

/// Transaction states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransState {
    Running,
    Committing,
    Checkpointing,
}

/// An atomic multi-block update.
pub(crate) struct JbdTrans {
    trans_id: u32,
    state: TransState,
    buf_queue: Vec<JbdBuf>,
    revokes: Vec<u64>,
}

impl JbdTrans {
    /// Records that the block's current content must reach the log as
    /// part of this transaction. `pinned` is a handle the caller has
    /// taken an extra cache reference for; the transaction keeps it
    /// until checkpointing.
    ///
    /// Returns the handle when the block was already queued, so the
    /// caller can drop the extra reference.
    pub(crate) fn set_block_dirty(&mut self, pinned: Block) -> Option<Block> {
        pinned.set_dirty();
        if self
            .buf_queue
            .iter()
            .any(|b| b.block.lba() == pinned.lba())
        {
            return Some(pinned);
        }
        self.buf_queue.push(JbdBuf { block: pinned });
        None
    }

    /// Records that this transaction invalidates prior log entries for
    /// `lba` (a freed metadata block that may be reused as data).
    pub(crate) fn revoke_block(&mut self, lba: u64) {
        if !self.revokes.contains(&lba) {
            self.revokes.push(lba);
        }
    }

    /// Revokes `lba` and forgets any buffer this transaction holds for
    /// it: a block dirtied then freed inside one transaction has
    /// nothing worth logging. The caller releases the returned handle.
    pub(crate) fn try_revoke_block(&mut self, lba: u64) -> Option<Block> {
        self.revoke_block(lba);
        self.buf_queue
            .iter()
            .position(|b| b.block.lba() == lba)
            .map(|i| {
                let buf = self.buf_queue.remove(i);
                buf.block.clear_flag(BufFlags::DIRTY);
                buf.block
            })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf_queue.is_empty() && self.revokes.is_empty()
    }
}

/// A started journal bound to its on-disk area.
pub(crate) struct JbdJournal {
    /// First usable log block.
    first: u32,

    /// Log head: where the next transaction is written.
    start: u32,

    /// Log tail: oldest log block still holding live data.
    tail: u32,

    /// Next transaction id to assign.
    trans_id: u32,

    block_size: u32,

    jbd_fs: JbdFs,

    /// Once a commit fails the journal is poisoned; every further
    /// operation reports `IO` until remount.
    failed: bool,
}

impl JbdJournal {
    /// Starts the journal: positions the head past any (already
    /// replayed) log content.
    pub(crate) fn start(jbd_fs: JbdFs) -> FsResult<Self> {
        let sb = jbd_fs.sb;
        let first = sb.first().max(1);
        let start = if sb.start() == 0 { first } else { sb.start() };

        let journal = Self {
            first,
            start,
            tail: start,
            trans_id: sb.sequence().max(1),
            block_size: sb.blocksize(),
            jbd_fs,
            failed: false,
        };

        info!(
            target: "ext4-journal",
            "journal started, {} blocks, sequence {}",
            journal.jbd_fs.sb.maxlen(),
            journal.trans_id
        );
        Ok(journal)
    }

    /// Stops the journal and marks the log clean.
    pub(crate) fn stop(mut self, bdev: &mut Blockdev) -> CanFail<Ext4Error> {
        self.jbd_fs.sb.start = 0u32.to_be();
        self.jbd_fs.sb.sequence = self.trans_id.to_be();
        self.jbd_fs.write_sb(bdev)?;
        bdev.flush_barrier()
    }

    pub(crate) fn new_trans(&mut self) -> JbdTrans {
        JbdTrans {
            trans_id: self.trans_id,
            state: TransState::Running,
            buf_queue: Vec::new(),
            revokes: Vec::new(),
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed
    }

    fn wrap(&self, block: u32) -> u32 {
        let maxlen = self.jbd_fs.sb.maxlen();
        if block >= maxlen {
            block - maxlen + self.first
        } else {
            block
        }
    }

    /// Log blocks available before the head would catch up with the
    /// tail.
    fn free_blocks(&self) -> u32 {
        let area = self.jbd_fs.sb.maxlen() - self.first;
        let used = if self.start >= self.tail {
            self.start - self.tail
        } else {
            area - (self.tail - self.start)
        };
        (area - used).saturating_sub(1)
    }

    fn tags_per_block(&self) -> usize {
        let tag = self.jbd_fs.sb.tag_size();
        let mut space = self.block_size as usize - BHDR_SIZE;
        if self.jbd_fs.sb.csum_version() >= 2 {
            space -= 4;
        }
        // the first tag carries the 16-byte journal UUID
        (space - UUID_SIZE) / tag
    }

    /// Seed for v2/v3 journal block checksums.
    fn csum_seed(&self) -> u32 {
        crc32c_calc(!0, &self.jbd_fs.sb.uuid)
    }

    /// Tail checksum of a descriptor/revoke block (v2/v3 journals).
    fn block_tail_csum(&self, data: &[u8]) -> u32 {
        let mut copy = data.to_vec();
        let len = copy.len();
        copy[len - 4..].fill(0);
        crc32c_calc(self.csum_seed(), &copy)
    }

    fn serialize_tag(
        &self,
        out: &mut [u8],
        target_lba: u64,
        flags: u16,
        seq: u32,
        data: &[u8],
    ) -> usize {
        let sb = &self.jbd_fs.sb;
        let csum32 = if sb.csum_version() >= 2 {
            let crc = crc32c_calc(self.csum_seed(), &seq.to_be_bytes());
            crc32c_calc(crc, data)
        } else {
            0
        };

        match sb.csum_version() {
            3 => {
                out[0..4].copy_from_slice(&(target_lba as u32).to_be_bytes());
                out[4..8].copy_from_slice(&u32::from(flags).to_be_bytes());
                out[8..12].copy_from_slice(&((target_lba >> 32) as u32).to_be_bytes());
                out[12..16].copy_from_slice(&csum32.to_be_bytes());
                16
            }
            _ => {
                out[0..4].copy_from_slice(&(target_lba as u32).to_be_bytes());
                out[4..6].copy_from_slice(&((csum32 & 0xFFFF) as u16).to_be_bytes());
                out[6..8].copy_from_slice(&flags.to_be_bytes());
                if sb.is_64bit() {
                    out[8..12].copy_from_slice(&((target_lba >> 32) as u32).to_be_bytes());
                    12
                } else {
                    8
                }
            }
        }
    }

    fn write_head_block(&mut self, bdev: &mut Blockdev, data: &[u8]) -> CanFail<Ext4Error> {
        if self.free_blocks() == 0 {
            error!(target: "ext4-journal", "journal full");
            return Err(Ext4Error::NoSpace);
        }
        self.jbd_fs.write_log_block(bdev, self.start, data)?;
        self.start = self.wrap(self.start + 1);
        Ok(())
    }

    /// Commits a transaction: descriptor blocks and escaped data,
    /// revoke block, barrier, commit block, barrier, then the
    /// checkpoint pass. After a successful return the transaction is
    /// durable; after an error the log is left in a state recovery
    /// discards.
    pub(crate) fn commit_trans(
        &mut self,
        bdev: &mut Blockdev,
        mut trans: JbdTrans,
    ) -> CanFail<Ext4Error> {
        if self.failed {
            return Err(Ext4Error::IO);
        }
        if trans.is_empty() {
            return Ok(());
        }

        debug_assert_eq!(trans.state, TransState::Running);
        trans.state = TransState::Committing;
        let seq = trans.trans_id;
        let bsize = self.block_size as usize;

        // data blocks + descriptor blocks + revoke blocks + commit block
        let rec_size = if self.jbd_fs.sb.is_64bit() { 8 } else { 4 };
        let rev_capacity = (bsize
            - REVOKE_HEADER_SIZE
            - if self.jbd_fs.sb.csum_version() >= 2 { 4 } else { 0 })
            / rec_size;
        let revoke_blocks = (trans.revokes.len() as u32).div_ceil(rev_capacity.max(1) as u32);
        let needed = (trans.buf_queue.len() as u32)
            + (trans.buf_queue.len() as u32).div_ceil(self.tags_per_block() as u32)
            + revoke_blocks
            + 2;
        if needed > self.free_blocks() {
            // with post-commit checkpointing the log is always clean
            // between transactions, so this transaction simply does not
            // fit the journal
            self.failed = true;
            return Err(Ext4Error::NoSpace);
        }

        let commit_start = self.start;
        let result = self.write_trans_blocks(bdev, &mut trans, seq, bsize);

        if let Err(e) = result {
            // rewind the head: recovery will never see a commit block
            self.start = commit_start;
            self.failed = true;
            error!(target: "ext4-journal", "commit of transaction {seq} failed");
            return Err(e);
        }

        self.trans_id = seq + 1;
        trans.state = TransState::Checkpointing;
        self.checkpoint(bdev, &mut trans)?;
        Ok(())
    }

    fn write_trans_blocks(
        &mut self,
        bdev: &mut Blockdev,
        trans: &mut JbdTrans,
        seq: u32,
        bsize: usize,
    ) -> CanFail<Ext4Error> {
        let tags_per_block = self.tags_per_block();
        let csum_v2plus = self.jbd_fs.sb.csum_version() >= 2;
        let mut data_csum = !0u32;
        let v1_csum = self.jbd_fs.sb.has_compat(FEATURE_COMPAT_CHECKSUM);

        // descriptor blocks, each followed by its data blocks
        for chunk in trans.buf_queue.chunks(tags_per_block) {
            let mut desc = vec![0u8; bsize];
            desc[..BHDR_SIZE].copy_from_slice(bytes_of(&JbdBlockHeader::new(
                DESCRIPTOR_BLOCK,
                seq,
            )));

            let mut escaped: Vec<Vec<u8>> = Vec::with_capacity(chunk.len());
            let mut off = BHDR_SIZE;

            for (i, buf) in chunk.iter().enumerate() {
                let mut data = buf.block.data().to_vec();
                let mut flags = 0u16;

                if u32::from_be_bytes(data[..4].try_into().unwrap()) == JBD_MAGIC {
                    flags |= FLAG_ESCAPE;
                    data[..4].fill(0);
                }
                if i + 1 == chunk.len() {
                    flags |= FLAG_LAST_TAG;
                }
                if i > 0 {
                    flags |= FLAG_SAME_UUID;
                }

                let lba = buf.block.lba();
                off += self.serialize_tag(&mut desc[off..], lba, flags, seq, &data);

                if i == 0 {
                    desc[off..off + UUID_SIZE].copy_from_slice(&self.jbd_fs.sb.uuid);
                    off += UUID_SIZE;
                }

                escaped.push(data);
            }

            if csum_v2plus {
                let csum = self.block_tail_csum(&desc);
                desc[bsize - 4..].copy_from_slice(&csum.to_be_bytes());
            }

            if v1_csum {
                data_csum = crc32_calc(data_csum, &desc);
                for data in &escaped {
                    data_csum = crc32_calc(data_csum, data);
                }
            }

            self.write_head_block(bdev, &desc)?;
            for data in &escaped {
                self.write_head_block(bdev, data)?;
            }
        }

        // revoke records, chunked over as many revoke blocks as needed
        let rec_size = if self.jbd_fs.sb.is_64bit() { 8 } else { 4 };
        let rev_capacity =
            (bsize - REVOKE_HEADER_SIZE - if csum_v2plus { 4 } else { 0 }) / rec_size;
        for revoke_chunk in trans.revokes.chunks(rev_capacity.max(1)) {
            let mut rev = vec![0u8; bsize];
            rev[..BHDR_SIZE]
                .copy_from_slice(bytes_of(&JbdBlockHeader::new(REVOKE_BLOCK, seq)));

            let mut off = REVOKE_HEADER_SIZE;
            for &lba in revoke_chunk {
                if rec_size == 8 {
                    rev[off..off + 8].copy_from_slice(&lba.to_be_bytes());
                } else {
                    rev[off..off + 4].copy_from_slice(&(lba as u32).to_be_bytes());
                }
                off += rec_size;
            }
            rev[BHDR_SIZE..BHDR_SIZE + 4].copy_from_slice(&(off as u32).to_be_bytes());

            if csum_v2plus {
                let csum = self.block_tail_csum(&rev);
                rev[bsize - 4..].copy_from_slice(&csum.to_be_bytes());
            }
            if v1_csum {
                data_csum = crc32_calc(data_csum, &rev);
            }

            self.write_head_block(bdev, &rev)?;
        }

        // the data phase must be durable before the commit block is
        bdev.flush_barrier()?;

        let mut commit = vec![0u8; bsize];
        commit[..BHDR_SIZE].copy_from_slice(bytes_of(&JbdBlockHeader::new(COMMIT_BLOCK, seq)));
        if v1_csum {
            commit[BHDR_SIZE] = 1; // chksum_type: crc32
            commit[BHDR_SIZE + 1] = 4; // chksum_size
            commit[16..20].copy_from_slice(&data_csum.to_be_bytes());
        }
        if csum_v2plus {
            let csum = {
                let mut copy = commit.clone();
                copy[16..20].fill(0);
                crc32c_calc(self.csum_seed(), &copy)
            };
            commit[16..20].copy_from_slice(&csum.to_be_bytes());
        }

        self.write_head_block(bdev, &commit)?;
        bdev.flush_barrier()
    }

    /// Writes every committed buffer to its home location and reclaims
    /// the log space.
    fn checkpoint(&mut self, bdev: &mut Blockdev, trans: &mut JbdTrans) -> CanFail<Ext4Error> {
        for buf in trans.buf_queue.drain(..) {
            let lba = buf.block.lba();
            {
                let data = buf.block.data();
                bdev.blocks_write_direct(lba, 1, &data)?;
            }
            buf.block.clear_flag(BufFlags::DIRTY);
            bdev.bc.remove_dirty_node(lba);
            bdev.block_set(buf.block)?;
        }

        // a checkpoint failure before this point leaves the log long
        // but authoritative; from here on the log space is reclaimed
        self.tail = self.start;
        self.jbd_fs.sb.start = self.start.to_be();
        self.jbd_fs.sb.sequence = self.trans_id.to_be();
        self.jbd_fs.write_sb(bdev)
    }

    /// Releases a transaction without committing it. The buffers it
    /// pinned are invalidated so their poisoned content is re-read
    /// from disk.
    pub(crate) fn free_trans(&mut self, bdev: &mut Blockdev, mut trans: JbdTrans, abort: bool) {
        for buf in trans.buf_queue.drain(..) {
            let lba = buf.block.lba();
            if abort {
                bdev.bc.invalidate_buf(lba);
            }
            let _ = bdev.block_set(buf.block);
        }
    }
}

// ---------------------------------------------------------------------
// recovery
// ---------------------------------------------------------------------

/// Outcome of the scan pass: id and end position of the last complete
/// transaction.
struct ScanResult {
    last_complete_id: Option<u32>,
}

/// Replays the log onto the filesystem. Runs the scan, revoke and
/// replay passes described by the JBD2 format; a transaction with a
/// missing commit block or a mismatched data checksum terminates the
/// replay.
pub(crate) fn jbd_recover(jbd_fs: &mut JbdFs, bdev: &mut Blockdev) -> CanFail<Ext4Error> {
    let sb = jbd_fs.sb;
    if sb.start() == 0 {
        return Ok(());
    }

    bdev.bc.dont_shake = true;
    let r = recover_inner(jbd_fs, bdev);
    bdev.bc.dont_shake = false;
    r
}

fn recover_inner(jbd_fs: &mut JbdFs, bdev: &mut Blockdev) -> CanFail<Ext4Error> {
    let scan = scan_pass(jbd_fs, bdev)?;
    let Some(last_id) = scan.last_complete_id else {
        info!(target: "ext4-journal", "no complete transaction to replay");
        return finish_recovery(jbd_fs, bdev);
    };

    let revokes = revoke_pass(jbd_fs, bdev, last_id)?;
    replay_pass(jbd_fs, bdev, last_id, &revokes)?;
    bdev.flush_barrier()?;

    info!(
        target: "ext4-journal",
        "journal recovery complete, replayed up to transaction {last_id}"
    );
    finish_recovery(jbd_fs, bdev)
}

fn finish_recovery(jbd_fs: &mut JbdFs, bdev: &mut Blockdev) -> CanFail<Ext4Error> {
    let next = jbd_fs.sb.sequence().wrapping_add(1);
    jbd_fs.sb.start = 0u32.to_be();
    jbd_fs.sb.sequence = next.to_be();
    jbd_fs.write_sb(bdev)?;
    bdev.flush_barrier()
}

/// Per-transaction walker shared by the three passes.
struct LogWalker<'j> {
    jbd_fs: &'j JbdFs,
    block: u32,
    sequence: u32,
}

impl<'j> LogWalker<'j> {
    fn new(jbd_fs: &'j JbdFs) -> Self {
        Self {
            jbd_fs,
            block: jbd_fs.sb.start(),
            sequence: jbd_fs.sb.sequence(),
        }
    }

    fn next_block(&mut self) -> u32 {
        let sb = &self.jbd_fs.sb;
        let cur = self.block;
        self.block += 1;
        if self.block >= sb.maxlen() {
            self.block = sb.first();
        }
        cur
    }

    /// Number of log blocks occupied by the data of a descriptor
    /// block.
    fn count_tags(&self, desc: &[u8]) -> usize {
        let sb = &self.jbd_fs.sb;
        let tag_size = sb.tag_size();
        let limit = desc.len() - if sb.csum_version() >= 2 { 4 } else { 0 };

        let mut off = BHDR_SIZE;
        let mut count = 0;
        loop {
            if off + tag_size > limit {
                break;
            }
            let flags_off = if sb.csum_version() == 3 { 4 } else { 6 };
            let flags: u16 = if sb.csum_version() == 3 {
                u32::from_be_bytes(desc[off + 4..off + 8].try_into().unwrap()) as u16
            } else {
                u16::from_be_bytes(desc[off + flags_off..off + flags_off + 2].try_into().unwrap())
            };
            count += 1;
            off += tag_size;
            if flags & FLAG_SAME_UUID == 0 {
                off += UUID_SIZE;
            }
            if flags & FLAG_LAST_TAG != 0 {
                break;
            }
        }
        count
    }

    /// Target physical blocks listed by a descriptor, with their
    /// escape markers.
    fn parse_tags(&self, desc: &[u8]) -> Vec<(u64, bool)> {
        let sb = &self.jbd_fs.sb;
        let tag_size = sb.tag_size();
        let limit = desc.len() - if sb.csum_version() >= 2 { 4 } else { 0 };

        let mut out = Vec::new();
        let mut off = BHDR_SIZE;
        loop {
            if off + tag_size > limit {
                break;
            }

            let blocknr = u32::from_be_bytes(desc[off..off + 4].try_into().unwrap());
            let (flags, blocknr_high) = if sb.csum_version() == 3 {
                (
                    u32::from_be_bytes(desc[off + 4..off + 8].try_into().unwrap()) as u16,
                    u32::from_be_bytes(desc[off + 8..off + 12].try_into().unwrap()),
                )
            } else {
                let flags = u16::from_be_bytes(desc[off + 6..off + 8].try_into().unwrap());
                let high = if sb.is_64bit() {
                    u32::from_be_bytes(desc[off + 8..off + 12].try_into().unwrap())
                } else {
                    0
                };
                (flags, high)
            };

            let lba = u64::from(blocknr) | (u64::from(blocknr_high) << 32);
            out.push((lba, flags & FLAG_ESCAPE != 0));

            off += tag_size;
            if flags & FLAG_SAME_UUID == 0 {
                off += UUID_SIZE;
            }
            if flags & FLAG_LAST_TAG != 0 {
                break;
            }
        }
        out
    }
}

/// Pass 1: follow descriptors and commits to find the last transaction
/// whose commit block made it to the log.
fn scan_pass(jbd_fs: &JbdFs, bdev: &mut Blockdev) -> FsResult<ScanResult> {
    let bsize = jbd_fs.sb.blocksize() as usize;
    let v1_csum = jbd_fs.sb.has_compat(FEATURE_COMPAT_CHECKSUM);
    let mut walker = LogWalker::new(jbd_fs);
    let mut buf = vec![0u8; bsize];
    let mut last_complete = None;
    let mut data_csum = !0u32;

    loop {
        let jblock = walker.next_block();
        if jbd_fs.read_log_block(bdev, jblock, &mut buf).is_err() {
            break;
        }

        let hdr: JbdBlockHeader = *from_bytes(&buf[..BHDR_SIZE]);
        if !hdr.is_valid() || hdr.sequence() != walker.sequence {
            break;
        }

        match hdr.blocktype() {
            DESCRIPTOR_BLOCK => {
                if v1_csum {
                    data_csum = crc32_calc(data_csum, &buf);
                }
                let tags = walker.count_tags(&buf);
                for _ in 0..tags {
                    let data_block = walker.next_block();
                    if v1_csum {
                        let mut data = vec![0u8; bsize];
                        jbd_fs.read_log_block(bdev, data_block, &mut data)?;
                        data_csum = crc32_calc(data_csum, &data);
                    }
                }
            }
            REVOKE_BLOCK => {
                if v1_csum {
                    data_csum = crc32_calc(data_csum, &buf);
                }
            }
            COMMIT_BLOCK => {
                if v1_csum {
                    let stored = u32::from_be_bytes(buf[16..20].try_into().unwrap());
                    if stored != data_csum {
                        warn!(
                            target: "ext4-journal",
                            "transaction {} data checksum mismatch, replay stops here",
                            walker.sequence
                        );
                        break;
                    }
                }
                last_complete = Some(walker.sequence);
                walker.sequence = walker.sequence.wrapping_add(1);
                data_csum = !0;
            }
            _ => break,
        }
    }

    Ok(ScanResult {
        last_complete_id: last_complete,
    })
}

/// Pass 2: collect `(lba, newest revoking transaction)` pairs.
fn revoke_pass(
    jbd_fs: &JbdFs,
    bdev: &mut Blockdev,
    last_id: u32,
) -> FsResult<HashMap<u64, u32>> {
    let bsize = jbd_fs.sb.blocksize() as usize;
    let mut walker = LogWalker::new(jbd_fs);
    let mut buf = vec![0u8; bsize];
    let mut revokes: HashMap<u64, u32> = HashMap::new();

    while walker.sequence <= last_id {
        let jblock = walker.next_block();
        jbd_fs.read_log_block(bdev, jblock, &mut buf)?;

        let hdr: JbdBlockHeader = *from_bytes(&buf[..BHDR_SIZE]);
        if !hdr.is_valid() || hdr.sequence() != walker.sequence {
            break;
        }

        match hdr.blocktype() {
            DESCRIPTOR_BLOCK => {
                for _ in 0..walker.count_tags(&buf) {
                    walker.next_block();
                }
            }
            REVOKE_BLOCK => {
                let count =
                    u32::from_be_bytes(buf[BHDR_SIZE..BHDR_SIZE + 4].try_into().unwrap()) as usize;
                let rec_size = if jbd_fs.sb.is_64bit() { 8 } else { 4 };
                let mut off = REVOKE_HEADER_SIZE;
                while off + rec_size <= count.min(bsize) {
                    let lba = if rec_size == 8 {
                        u64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
                    } else {
                        u64::from(u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()))
                    };
                    let entry = revokes.entry(lba).or_insert(walker.sequence);
                    if *entry < walker.sequence {
                        *entry = walker.sequence;
                    }
                    off += rec_size;
                }
            }
            COMMIT_BLOCK => {
                walker.sequence = walker.sequence.wrapping_add(1);
            }
            _ => break,
        }
    }

    Ok(revokes)
}

/// Pass 3: re-execute every committed transaction, skipping blocks
/// revoked by a strictly newer transaction.
fn replay_pass(
    jbd_fs: &JbdFs,
    bdev: &mut Blockdev,
    last_id: u32,
    revokes: &HashMap<u64, u32>,
) -> CanFail<Ext4Error> {
    let bsize = jbd_fs.sb.blocksize() as usize;
    let mut walker = LogWalker::new(jbd_fs);
    let mut buf = vec![0u8; bsize];
    let mut data = vec![0u8; bsize];
    let mut replayed = 0u32;

    while walker.sequence <= last_id {
        let jblock = walker.next_block();
        jbd_fs.read_log_block(bdev, jblock, &mut buf)?;

        let hdr: JbdBlockHeader = *from_bytes(&buf[..BHDR_SIZE]);
        if !hdr.is_valid() || hdr.sequence() != walker.sequence {
            break;
        }

        match hdr.blocktype() {
            DESCRIPTOR_BLOCK => {
                for (target, escaped) in walker.parse_tags(&buf) {
                    let data_block = walker.next_block();
                    jbd_fs.read_log_block(bdev, data_block, &mut data)?;

                    if let Some(&revoked_by) = revokes.get(&target) {
                        if revoked_by > walker.sequence {
                            continue;
                        }
                    }

                    if escaped {
                        data[..4].copy_from_slice(&JBD_MAGIC.to_be_bytes());
                    }
                    bdev.blocks_write_direct(target, 1, &data)?;
                    // drop any stale cached copy of the replayed block
                    bdev.bc.invalidate_range(target, 1);
                    replayed += 1;
                }
            }
            REVOKE_BLOCK => {}
            COMMIT_BLOCK => {
                walker.sequence = walker.sequence.wrapping_add(1);
            }
            _ => break,
        }
    }

    info!(target: "ext4-journal", "replayed {replayed} blocks");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jbd_sb_layout() {
        assert_eq!(core::mem::size_of::<JbdSb>(), 1024);
        assert_eq!(core::mem::size_of::<JbdBlockHeader>(), 12);
    }

    #[test]
    fn header_endianness() {
        let hdr = JbdBlockHeader::new(DESCRIPTOR_BLOCK, 100);
        assert!(hdr.is_valid());
        assert_eq!(hdr.blocktype(), DESCRIPTOR_BLOCK);
        assert_eq!(hdr.sequence(), 100);
        // stored big-endian
        let raw = bytes_of(&hdr);
        assert_eq!(raw[0], 0xC0);
        assert_eq!(raw[3], 0x98);
    }

    #[test]
    fn tag_sizes_follow_features() {
        let mut sb = JbdSb::zeroed();
        assert_eq!(sb.tag_size(), 8);
        sb.feature_incompat = FEATURE_INCOMPAT_64BIT.to_be();
        assert_eq!(sb.tag_size(), 12);
        sb.feature_incompat = (FEATURE_INCOMPAT_64BIT | FEATURE_INCOMPAT_CSUM_V3).to_be();
        assert_eq!(sb.tag_size(), 16);
    }
}
