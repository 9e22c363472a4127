//! Kernel-wide error values.
//!
//! Failures thread from the point of detection up to the system call
//! dispatcher, which reports them on the console and turns them into
//! a -1 return value. Panics are reserved for broken invariants; a
//! `KernelError` always describes a condition user code can cause.

use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KernelError {
    /// every per-CPU freelist is empty.
    OutOfMemory,
    /// no free inode on the disk.
    OutOfInodes,
    /// the data-block bitmap has no zero bit left.
    OutOfBlocks,
    /// a user pointer is not mapped (or not user-accessible).
    BadAddress,
    /// directory entry already present.
    Exists,
    /// path or directory entry does not resolve.
    NotFound,
    /// path component or operand is not a directory.
    NotDirectory,
    /// operation is not valid on a directory.
    IsDirectory,
    /// directory still has entries besides "." and "..".
    NotEmpty,
    /// file descriptor out of range, closed, or of the wrong kind.
    BadDescriptor,
    /// malformed argument (range, sign, or encoding).
    BadArgument,
    /// the process was killed while blocked.
    Interrupted,
    /// write would exceed the maximum file size.
    TooLarge,
    /// the peer end of a pipe is closed.
    BrokenPipe,
    /// the block device reported a failed request.
    DeviceIo,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfMemory => "out of memory",
            KernelError::OutOfInodes => "out of inodes",
            KernelError::OutOfBlocks => "out of blocks",
            KernelError::BadAddress => "bad user address",
            KernelError::Exists => "already exists",
            KernelError::NotFound => "not found",
            KernelError::NotDirectory => "not a directory",
            KernelError::IsDirectory => "is a directory",
            KernelError::NotEmpty => "directory not empty",
            KernelError::BadDescriptor => "bad file descriptor",
            KernelError::BadArgument => "bad argument",
            KernelError::Interrupted => "interrupted",
            KernelError::TooLarge => "file too large",
            KernelError::BrokenPipe => "broken pipe",
            KernelError::DeviceIo => "device i/o error",
        };
        write!(f, "{}", msg)
    }
}
