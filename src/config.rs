//! Compile-time defaults and per-mount options.

/// Default number of buffers held by the block cache.
///
/// Kept intentionally small: the cache bounds resident memory on hosts
/// with a few kilobytes to spare. Hosts with more memory should raise
/// [`MountOptions::cache_size`].
pub const BLOCK_DEV_CACHE_SIZE: u32 = 8;

/// Maximum amount of file data released by a single transaction.
///
/// Long operations (truncation, recursive removal) are broken into
/// multiple transactions of at most this size, so that a crash
/// mid-operation leaves the filesystem consistent at a partially
/// completed checkpoint.
pub const MAX_TRUNCATE_SIZE: u64 = 16 * 1024 * 1024;

/// Per-mount options supplied by the host.
#[derive(Clone, Copy, Debug)]
pub struct MountOptions {
    /// Number of buffers in the block cache.
    pub cache_size: u32,

    /// Mount read-only. Mutating operations return
    /// [`crate::errors::Ext4Error::ReadOnly`].
    pub read_only: bool,

    /// Use the on-disk journal (when the filesystem carries one) for
    /// metadata updates, and replay it at mount time if the filesystem
    /// needs recovery.
    pub journal: bool,

    /// Write-back caching: dirty buffers are queued and flushed at commit
    /// or eviction time instead of synchronously on release.
    pub cache_write_back: bool,

    /// Host time source, seconds since the epoch. Used to stamp inode
    /// timestamps; `None` leaves timestamps at zero.
    pub clock: Option<fn() -> u32>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cache_size: BLOCK_DEV_CACHE_SIZE,
            read_only: false,
            journal: true,
            cache_write_back: true,
            clock: None,
        }
    }
}
