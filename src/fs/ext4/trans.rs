//! Transaction-aware buffer operations.
//!
//! Every metadata mutation goes through these wrappers. While a
//! transaction is open, dirtied buffers are handed to the journal
//! (pinned until checkpointing) instead of the cache's dirty list, and
//! freed blocks are revoked so recovery never replays stale metadata
//! over reallocated data.

use crate::bcache::Block;
use crate::errors::{CanFail, Ext4Error, FsResult};
use crate::fs::ext4::Ext4Fs;

impl Ext4Fs {
    /// Pinned, up-to-date buffer for `lba`.
    pub(crate) fn trans_block_get(&mut self, lba: u64) -> FsResult<Block> {
        self.bdev.block_get(lba)
    }

    /// Pinned buffer for `lba` without a device read; the caller fills
    /// it.
    pub(crate) fn trans_block_get_noread(&mut self, lba: u64) -> FsResult<Block> {
        self.bdev.block_get_noread(lba)
    }

    /// Releases a buffer reference.
    pub(crate) fn block_put(&mut self, block: Block) -> CanFail<Ext4Error> {
        self.bdev.block_set(block)
    }

    /// Records the buffer's content in the running transaction, or
    /// simply marks it dirty when no journal is active.
    pub(crate) fn trans_set_dirty(&mut self, block: &Block) -> CanFail<Ext4Error> {
        if let Some(journal) = &self.journal {
            if journal.has_failed() {
                return Err(Ext4Error::IO);
            }
        }

        if let Some(trans) = &mut self.curr_trans {
            self.bdev.bc.inc_ref(block);
            if let Some(duplicate) = trans.set_block_dirty(block.clone()) {
                // already queued: drop the extra reference
                self.bdev.block_set(duplicate)?;
            }
            return Ok(());
        }

        block.set_dirty();
        Ok(())
    }

    /// Revokes prior log entries for a freed block.
    pub(crate) fn trans_try_revoke(&mut self, lba: u64) -> CanFail<Ext4Error> {
        if let Some(trans) = &mut self.curr_trans {
            if let Some(dropped) = trans.try_revoke_block(lba) {
                self.bdev.block_set(dropped)?;
            }
            return Ok(());
        }

        if self.journal.is_some() {
            // no running transaction: make sure the stale content is on
            // disk before the block changes hands
            return self.bdev.block_flush_lba(lba);
        }
        Ok(())
    }

    /// Opens a transaction for a top-level mutating operation.
    pub(crate) fn trans_start(&mut self) -> CanFail<Ext4Error> {
        if self.read_only {
            return Err(Ext4Error::ReadOnly);
        }

        if let Some(journal) = &mut self.journal {
            if journal.has_failed() {
                return Err(Ext4Error::IO);
            }
            debug_assert!(self.curr_trans.is_none());
            self.curr_trans = Some(journal.new_trans());
        }
        Ok(())
    }

    /// Commits the running transaction (including the superblock when
    /// its counters changed).
    pub(crate) fn trans_stop(&mut self) -> CanFail<Ext4Error> {
        if self.sb_dirty {
            self.write_sb_block()?;
        }

        if let Some(trans) = self.curr_trans.take() {
            if let Some(journal) = self.journal.as_mut() {
                journal.commit_trans(&mut self.bdev, trans)?;
            }
        }
        Ok(())
    }

    /// Aborts the running transaction; the buffers it dirtied are
    /// invalidated so their poisoned content is re-read from disk.
    pub(crate) fn trans_abort(&mut self) {
        if let Some(trans) = self.curr_trans.take() {
            if let Some(journal) = self.journal.as_mut() {
                journal.free_trans(&mut self.bdev, trans, true);
            }
        }
    }

    /// Writes the in-memory superblock into its on-disk block, through
    /// the running transaction when there is one.
    fn write_sb_block(&mut self) -> CanFail<Ext4Error> {
        self.sb.update_chksum();

        if self.curr_trans.is_some() {
            let (lblk, offset) = if self.sb.blk_size() == 1024 {
                (1u64, 0usize)
            } else {
                (0u64, 1024usize)
            };

            let block = self.trans_block_get(lblk)?;
            {
                let mut data = block.data_mut();
                data[offset..offset + 1024].copy_from_slice(bytemuck::bytes_of(&self.sb));
            }
            self.trans_set_dirty(&block)?;
            self.block_put(block)?;
        } else {
            self.sb.save(&mut self.bdev)?;
        }

        self.sb_dirty = false;
        Ok(())
    }
}
