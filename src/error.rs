//! Error type shared by every hook-engine operation.
//!
//! All internal functions return [`Result`]; the trap path turns errors into
//! a logged, best-effort degradation instead of propagating them further.

use axerrno::LinuxError;

use crate::Pid;

/// Error types for hook-engine operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A breakpoint is already installed at the address.
    AlreadyExists,
    /// Allocation of registry nodes, scratch areas or metadata failed.
    OutOfMemory,
    /// Reading the traced process's memory failed at the given address.
    RemoteReadFailed(u32),
    /// Writing the traced process's memory failed at the given address.
    RemoteWriteFailed(u32),
    /// No traced process with this thread-group id.
    NoSuchProcess(Pid),
    /// No traced thread with this thread id.
    NoSuchThread(Pid),
    /// No breakpoint registered at the address.
    NoSuchBreakpoint(u32),
    /// Symbol could not be resolved in any loaded module.
    SymbolNotFound,
    /// ELF structures of a module are absent or corrupt.
    InvalidModule,
    /// Displaced sequence does not fit into one scratch slot.
    SequenceTooLong,
    /// Module tracking has not been started.
    NotStarted,
    /// Module tracking is already running.
    AlreadyStarted,
}

impl Error {
    /// Duplicate installation is an expected, success-equivalent outcome.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists)
    }

    /// OS-style error code for the ioctl front end.
    pub fn errno(&self) -> i32 {
        LinuxError::from(self.clone()) as i32
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "Breakpoint already exists"),
            Self::OutOfMemory => write!(f, "Out of memory"),
            Self::RemoteReadFailed(addr) => write!(f, "Remote read failed at {:#x}", addr),
            Self::RemoteWriteFailed(addr) => write!(f, "Remote write failed at {:#x}", addr),
            Self::NoSuchProcess(pid) => write!(f, "Process {} is not traced", pid),
            Self::NoSuchThread(tid) => write!(f, "Thread {} is not traced", tid),
            Self::NoSuchBreakpoint(addr) => write!(f, "No breakpoint at {:#x}", addr),
            Self::SymbolNotFound => write!(f, "Symbol not found"),
            Self::InvalidModule => write!(f, "Not a valid ELF module"),
            Self::SequenceTooLong => write!(f, "Displaced sequence does not fit in a slot"),
            Self::NotStarted => write!(f, "Module tracking not started"),
            Self::AlreadyStarted => write!(f, "Module tracking already started"),
        }
    }
}

impl core::error::Error for Error {}

impl From<Error> for LinuxError {
    fn from(err: Error) -> Self {
        match err {
            Error::AlreadyExists => LinuxError::EEXIST,
            Error::OutOfMemory => LinuxError::ENOMEM,
            Error::RemoteReadFailed(_) | Error::RemoteWriteFailed(_) => LinuxError::EFAULT,
            Error::NoSuchProcess(_) | Error::NoSuchThread(_) => LinuxError::ESRCH,
            Error::NoSuchBreakpoint(_) | Error::SymbolNotFound => LinuxError::ENOENT,
            Error::InvalidModule | Error::SequenceTooLong => LinuxError::EINVAL,
            Error::NotStarted | Error::AlreadyStarted => LinuxError::EBUSY,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;
