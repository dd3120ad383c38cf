//! # IPC Errors
//!
//! One error type for the whole transport. `Busy` and `NoData` are local
//! conditions the caller is expected to retry; `TimedOut` on the message ring
//! is the one error that takes the link down for everyone.

use core::fmt;

use helix_hal::HalError;

/// IPC error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum IpcError {
    // =========================================================================
    // Link / Channel
    // =========================================================================
    /// No link, or the channel was never opened
    NoLink,
    /// Channel id out of range
    InvalidChannel(u16),
    /// Channel is already open
    AlreadyOpen,
    /// Channel is not open (or was closed while waiting)
    NotOpen,
    /// The link went down or was reset while waiting
    LinkDown,

    // =========================================================================
    // Flow
    // =========================================================================
    /// Resource momentarily unavailable (ring full, receiver busy)
    Busy,
    /// Nothing available and the caller asked not to wait
    NoData,
    /// Wait expired
    TimedOut,
    /// A blocked receiver was woken explicitly
    Interrupted,

    // =========================================================================
    // Protocol
    // =========================================================================
    /// Reply did not match the request
    Mismatch {
        /// Expected (channel, command)
        expected: (u16, u16),
        /// Received (channel, command)
        got: (u16, u16),
    },
    /// Descriptor outside its region or contradicting the block state
    InvalidDescriptor,
    /// Payload does not fit the shared buffer
    TooLarge {
        /// Requested length
        len: usize,
        /// Available space
        max: usize,
    },
    /// No such region / pool
    NotFound,
    /// Invalid parameter
    InvalidParameter(&'static str),

    // =========================================================================
    // Hardware
    // =========================================================================
    /// Shared memory / address translation error
    Hal(HalError),
}

impl IpcError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::NoData | Self::TimedOut | Self::Interrupted
        )
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoLink => write!(f, "No link"),
            Self::InvalidChannel(id) => write!(f, "Invalid channel {}", id),
            Self::AlreadyOpen => write!(f, "Channel already open"),
            Self::NotOpen => write!(f, "Channel not open"),
            Self::LinkDown => write!(f, "Link down"),
            Self::Busy => write!(f, "Busy"),
            Self::NoData => write!(f, "No data"),
            Self::TimedOut => write!(f, "Timed out"),
            Self::Interrupted => write!(f, "Interrupted"),
            Self::Mismatch { expected, got } => write!(
                f,
                "Reply mismatch: expected ch {} cmd 0x{:x}, got ch {} cmd 0x{:x}",
                expected.0, expected.1, got.0, got.1
            ),
            Self::InvalidDescriptor => write!(f, "Invalid block descriptor"),
            Self::TooLarge { len, max } => write!(f, "Payload too large: {} > {}", len, max),
            Self::NotFound => write!(f, "Not found"),
            Self::InvalidParameter(what) => write!(f, "Invalid parameter: {}", what),
            Self::Hal(e) => write!(f, "HAL: {}", e),
        }
    }
}

impl From<HalError> for IpcError {
    fn from(e: HalError) -> Self {
        match e {
            HalError::OutOfRange { .. } => Self::InvalidDescriptor,
            other => Self::Hal(other),
        }
    }
}

impl std::error::Error for IpcError {}

/// IPC result type
pub type IpcResult<T> = Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient() {
        assert!(IpcError::Busy.is_transient());
        assert!(IpcError::NoData.is_transient());
        assert!(!IpcError::LinkDown.is_transient());
        assert!(!IpcError::AlreadyOpen.is_transient());
    }

    #[test]
    fn test_out_of_range_is_invalid_descriptor() {
        let e: IpcError = HalError::OutOfRange { addr: 0, len: 4 }.into();
        assert_eq!(e, IpcError::InvalidDescriptor);
        let e: IpcError = HalError::AllocFailed.into();
        assert_eq!(e, IpcError::Hal(HalError::AllocFailed));
    }

    #[test]
    fn test_display() {
        let e = IpcError::Mismatch {
            expected: (0, 7),
            got: (0, 8),
        };
        assert_eq!(
            e.to_string(),
            "Reply mismatch: expected ch 0 cmd 0x7, got ch 0 cmd 0x8"
        );
    }
}
