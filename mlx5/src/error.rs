//! Driver-level error type.

use core::fmt;

use mlx_cmd::CommandError;
use nic_buffers::BufferError;
use nic_dma::DmaError;

/// Reasons a driver operation can fail.
///
/// Recoverable conditions come back through this type; violated driver
/// invariants (out-of-order teardown, mismatched back-references) panic
/// instead, because continuing would leave hardware classification state the
/// driver can no longer account for.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The hardware refused or never received a command.
    Command(CommandError),
    Dma(DmaError),
    Buffer(BufferError),
    /// A flow table or group has no free slot.
    TableExhausted,
    /// Every descriptor in a send ring is in use.
    RingFull,
    /// Removal of a filter or entry that is not installed.
    NotFound,
    /// A queue was asked to do something its lifecycle state forbids.
    BadQueueState(&'static str),
    /// The queried capabilities cannot support even a minimal configuration.
    CapsTooSmall(&'static str),
    /// The hardware kept refusing to return pages; the remaining pages were
    /// surrendered to it.
    PagesSurrendered(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Command(e) => write!(f, "{e}"),
            Error::Dma(e) => write!(f, "{e}"),
            Error::Buffer(e) => write!(f, "{e}"),
            Error::TableExhausted => write!(f, "no free flow table slot"),
            Error::RingFull => write!(f, "send ring has no free descriptor"),
            Error::NotFound => write!(f, "no such entry"),
            Error::BadQueueState(what) => write!(f, "queue in wrong state for {what}"),
            Error::CapsTooSmall(what) => {
                write!(f, "hardware capabilities insufficient: {what}")
            }
            Error::PagesSurrendered(n) => {
                write!(f, "hardware kept {n} pages after reclaim retries were exhausted")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Error {
        Error::Command(e)
    }
}

impl From<DmaError> for Error {
    fn from(e: DmaError) -> Error {
        Error::Dma(e)
    }
}

impl From<BufferError> for Error {
    fn from(e: BufferError) -> Error {
        Error::Buffer(e)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
