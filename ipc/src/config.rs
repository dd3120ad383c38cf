//! # Configuration
//!
//! Constructor-time knobs for links, command clients and block pools.

use std::time::Duration;

use crate::message::{channels, codes};

// ============================================================================
// LINK
// ============================================================================

/// Link configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Name used as log prefix
    pub name: &'static str,
    /// Number of channel ids
    pub max_channels: u16,
    /// Channel the peer reports faults on
    pub fault_channel: u16,
    /// Command code of the peer fault report
    pub fault_command: u16,
    /// Start with the peer considered ready (no boot handshake)
    pub assume_ready: bool,
    /// How many times `close` polls the busy counter before leaking
    pub close_poll_limit: u32,
    /// Sleep between busy polls
    pub close_poll_interval: Duration,
    /// Debug-log every message sent and dispatched
    pub trace: bool,
    /// Channels never traced, even with `trace` set
    pub quiet_channels: &'static [u16],
    /// Channels told about a receive timeout with `COMMUNICATION_TIMEOUT`
    pub timeout_channels: &'static [u16],
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            name: "agdsp",
            max_channels: channels::COUNT,
            fault_channel: channels::DSP_ASSERT_CTL,
            fault_command: codes::PEER_ASSERT,
            assume_ready: false,
            close_poll_limit: 100,
            close_poll_interval: Duration::from_millis(10),
            trace: false,
            quiet_channels: &[channels::DSP_PCM, channels::DSP_LOG],
            timeout_channels: &[channels::DSP_BTHAL, channels::DSP_ASSERT_CTL],
        }
    }
}

impl LinkConfig {
    /// Default configuration with a different name
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    /// Whether messages on `channel` are traced
    pub fn traces(&self, channel: u16) -> bool {
        (self.trace || cfg!(feature = "debug")) && !self.quiet_channels.contains(&channel)
    }
}

// ============================================================================
// COMMAND
// ============================================================================

/// Command/response configuration
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Reply wait attempts before giving up
    pub attempts: u32,
    /// Per-attempt reply timeout
    pub reply_timeout: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            reply_timeout: Duration::from_millis(3000),
        }
    }
}

// ============================================================================
// BLOCK POOL
// ============================================================================

/// Block size alignment
pub const BLOCK_ALIGN: u32 = 8;

/// Block pool geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPoolConfig {
    /// Blocks the host sends to the peer
    pub tx_blocks: u32,
    /// Size of each outbound block
    pub tx_block_size: u32,
    /// Blocks the peer sends to the host
    pub rx_blocks: u32,
    /// Size of each inbound block
    pub rx_block_size: u32,
}

impl Default for BlockPoolConfig {
    fn default() -> Self {
        Self {
            tx_blocks: 4,
            tx_block_size: 4096,
            rx_blocks: 4,
            rx_block_size: 4096,
        }
    }
}

impl BlockPoolConfig {
    /// Outbound block size after alignment
    pub fn tx_stride(&self) -> u32 {
        align_up(self.tx_block_size, BLOCK_ALIGN)
    }

    /// Inbound block size after alignment
    pub fn rx_stride(&self) -> u32 {
        align_up(self.rx_block_size, BLOCK_ALIGN)
    }

    /// Segment size needed for this geometry
    ///
    /// Headers, block memory, then four descriptor tables (ring tx/rx and
    /// pool tx/rx).
    pub fn required_size(&self) -> usize {
        let blocks = self.tx_blocks as usize * self.tx_stride() as usize
            + self.rx_blocks as usize * self.rx_stride() as usize;
        let descriptors = 2 * (self.tx_blocks + self.rx_blocks) as usize * 8;
        crate::block::POOL_HEADER_SIZE + blocks + descriptors
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}
