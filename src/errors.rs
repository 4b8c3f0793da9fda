//! Common error types used across FrozenFS.
//!
//! Every fallible operation in the crate reports one of the kinds defined
//! here. The kinds mirror the classic errno values a POSIX host expects,
//! so embedding the library under a C shim is a straight mapping.

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
///
/// For instance, it is used when flushing caches, or when writing back an
/// on-disk structure after an update.
pub type CanFail<T> = Result<(), T>;

/// Standard result type for filesystem operations.
pub type FsResult<T> = Result<T, Ext4Error>;

/// `Ext4Error` defines the error kinds that filesystem operations may
/// report.
///
/// Errors from the block layer bubble up to the enclosing transaction,
/// which aborts; errors raised during a journal commit mark the journal as
/// failed, and every subsequent operation returns [`Ext4Error::IO`] until
/// the filesystem is remounted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ext4Error {
    /// The underlying device failed. No in-core state is silently
    /// corrupted, the caller may retry.
    IO,

    /// Path or entry missing.
    NotFound,

    /// An entry with that name already exists.
    AlreadyExists,

    /// The target of the operation is a directory.
    IsADirectory,

    /// A path component (or the operation target) is not a directory.
    NotADirectory,

    /// Directory not empty.
    NotEmpty,

    /// No free blocks (or inodes) left on the device.
    NoSpace,

    /// Host allocator reported an out-of-memory condition.
    NoMemory,

    /// File too large for the filesystem geometry.
    TooBig,

    /// Hard link count would overflow.
    TooManyLinks,

    /// Operation not permitted on this filesystem object.
    NotPermitted,

    /// The filesystem is mounted read-only, or a feature lock forbids
    /// writing.
    ReadOnly,

    /// An on-disk invariant check failed (magic mismatch, checksum
    /// mismatch, impossible offsets). The operation is aborted and the
    /// filesystem stays read-only until remounted.
    Corrupted,

    /// A required incompatible feature is present but unimplemented.
    Unsupported,

    /// Requested extended attribute does not exist.
    NoData,

    /// Invalid argument (bad seek origin, malformed path, ...).
    InvalidArgument,
}

impl Ext4Error {
    /// Returns the closest classic errno value for this error kind.
    pub fn as_errno(self) -> i32 {
        match self {
            Ext4Error::IO => 5,
            Ext4Error::NotFound => 2,
            Ext4Error::AlreadyExists => 17,
            Ext4Error::IsADirectory => 21,
            Ext4Error::NotADirectory => 20,
            Ext4Error::NotEmpty => 39,
            Ext4Error::NoSpace => 28,
            Ext4Error::NoMemory => 12,
            Ext4Error::TooBig => 27,
            Ext4Error::TooManyLinks => 31,
            Ext4Error::NotPermitted => 1,
            Ext4Error::ReadOnly => 30,
            Ext4Error::Corrupted => 5,
            Ext4Error::Unsupported => 95,
            Ext4Error::NoData => 61,
            Ext4Error::InvalidArgument => 22,
        }
    }
}
