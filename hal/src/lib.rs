//! # Helix HAL
//!
//! Hardware-facing pieces of the host/DSP transport.
//!
//! ## Components
//!
//! - **Shared Segment**: a memory region both processors can address, with
//!   atomic index access and bounds-checked byte copies
//! - **Address Map**: translation between local offsets and the peer's
//!   physical coordinate space
//! - **Mailbox**: the out-of-band doorbell used to signal the peer
//!
//! Nothing in this crate knows about messages or channels. It only moves
//! words and bytes and tells the peer to look.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod addr;
pub mod mailbox;
pub mod shmem;

pub use addr::{AddrMap, PeerAddr};
pub use mailbox::{Doorbell, MailboxWord, NullDoorbell};
pub use shmem::SharedSegment;

// ============================================================================
// ERRORS
// ============================================================================

/// HAL error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HalError {
    /// Peer address range falls outside the segment
    OutOfRange {
        /// Peer address
        addr: u32,
        /// Length of the access
        len: usize,
    },
    /// Offset is not aligned for the access width
    Misaligned(usize),
    /// Segment size is zero or too large for the peer address space
    InvalidSize(usize),
    /// Backing memory could not be allocated
    AllocFailed,
}

impl core::fmt::Display for HalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfRange { addr, len } => {
                write!(f, "Peer range 0x{:08x}+{} outside segment", addr, len)
            },
            Self::Misaligned(off) => write!(f, "Misaligned offset 0x{:x}", off),
            Self::InvalidSize(size) => write!(f, "Invalid segment size {}", size),
            Self::AllocFailed => write!(f, "Segment allocation failed"),
        }
    }
}

/// HAL result type
pub type HalResult<T> = Result<T, HalError>;
