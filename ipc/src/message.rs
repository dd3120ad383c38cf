//! # Wire Message
//!
//! Fixed 20-byte control message exchanged through the message rings.
//!
//! ```text
//!  0        2        4        8        12       16       20
//! ┌────────┬────────┬────────┬────────┬────────┬────────┐
//! │channel │command │   p0   │   p1   │   p2   │   p3   │
//! └────────┴────────┴────────┴────────┴────────┴────────┘
//! ```
//!
//! All fields little endian. Payload semantics belong to the callers; the
//! transport only looks at the ready and fault patterns.

use core::mem::size_of;

use helix_hal::{MailboxWord, SharedSegment};

/// Size of one message slot
pub const MESSAGE_SIZE: usize = 20;

static_assertions::const_assert_eq!(size_of::<Message>(), MESSAGE_SIZE);

/// Channel ids
pub mod channels {
    /// VBC control
    pub const VBC_CTL: u16 = 0;
    /// Compressed playback offload control
    pub const MP3_OFFLOAD: u16 = 1;
    /// Peer fault reports
    pub const DSP_ASSERT_CTL: u16 = 2;
    /// PCM stream events
    pub const DSP_PCM: u16 = 3;
    /// Peer log transport
    pub const DSP_LOG: u16 = 4;
    /// Peer memory requests
    pub const DSP_MEM: u16 = 5;
    /// Offload drain notifications
    pub const MP3_OFFLOAD_DRAIN: u16 = 6;
    /// Parameter fetch without reply
    pub const DSP_GET_PARAM_NOREPLY: u16 = 7;
    /// Effect offload
    pub const EFFECT_OFFLOAD: u16 = 8;
    /// Record processing
    pub const RECORD_PROCESS: u16 = 9;
    /// Frequency scaling
    pub const DVFS: u16 = 10;
    /// Bluetooth HAL
    pub const DSP_BTHAL: u16 = 11;
    /// Number of channels
    pub const COUNT: u16 = 12;
}

/// Command codes and magic values
pub mod codes {
    /// Peer boot-complete magic (channel, command and p0)
    pub const PEER_READY_MAGIC: u16 = 0xBEEE;
    /// Block pool dump request
    pub const BLOCK_DUMP: u16 = 0x20;
    /// Block pool address handshake
    pub const BLOCK_SEND_ADDR: u16 = 0x21;
    /// Block pool address handshake reply
    pub const BLOCK_RESPONSE_ADDR: u16 = 0x22;
    /// Block pool event (p0 = event kind)
    pub const BLOCK_EVENT: u16 = 0x23;
    /// Peer trace log
    pub const TP_LOG: u16 = 0x24;
    /// Peer fault report
    pub const PEER_ASSERT: u16 = 0x25;
    /// Injected into every channel when a reply wait times out
    pub const COMMUNICATION_TIMEOUT: u16 = 0x26;

    /// `BLOCK_EVENT` p0: blocks were sent
    pub const EVENT_SEND: u32 = 0x1;
    /// `BLOCK_EVENT` p0: blocks were released
    pub const EVENT_RELEASE: u32 = 0x2;
    /// `BLOCK_SEND_ADDR` p0: init request
    pub const BLOCK_INIT: u32 = 0x1;
    /// `BLOCK_SEND_ADDR` p0: init done
    pub const BLOCK_INIT_DONE: u32 = 0x2;
}

/// Control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Message {
    /// Channel id
    pub channel: u16,
    /// Command code
    pub command: u16,
    /// Parameter 0
    pub p0: u32,
    /// Parameter 1
    pub p1: u32,
    /// Parameter 2
    pub p2: u32,
    /// Parameter 3
    pub p3: u32,
}

impl Message {
    /// Create a message
    pub const fn new(channel: u16, command: u16, p0: u32, p1: u32, p2: u32, p3: u32) -> Self {
        Self {
            channel,
            command,
            p0,
            p1,
            p2,
            p3,
        }
    }

    /// Message with all parameters zero
    pub const fn command(channel: u16, command: u16) -> Self {
        Self::new(channel, command, 0, 0, 0, 0)
    }

    /// The peer's boot-complete message
    pub const fn peer_ready() -> Self {
        let magic = codes::PEER_READY_MAGIC;
        Self::new(magic, magic, magic as u32, 0, 0, 0)
    }

    /// Copy of the boot-complete message as cached on `channel`
    pub const fn ready_notice(channel: u16) -> Self {
        let magic = codes::PEER_READY_MAGIC;
        Self::new(channel, magic, magic as u32, 0, 0, 0)
    }

    /// Parameters as an array
    pub const fn params(&self) -> [u32; 4] {
        [self.p0, self.p1, self.p2, self.p3]
    }

    /// Whether this is the peer's boot-complete message
    pub fn is_peer_ready(&self) -> bool {
        let magic = codes::PEER_READY_MAGIC;
        self.channel == magic && self.command == magic && self.p0 == magic as u32
    }

    /// Whether this is a boot-complete copy, on whatever channel it sits
    pub fn is_ready_notice(&self) -> bool {
        let magic = codes::PEER_READY_MAGIC;
        self.command == magic && self.p0 == magic as u32
    }

    /// Whether this is a fault report on `fault_channel`
    pub fn is_fault(&self, fault_channel: u16, fault_command: u16) -> bool {
        self.channel == fault_channel && self.command == fault_command
    }

    /// Whether the (channel, command) pair matches
    pub fn matches(&self, channel: u16, command: u16) -> bool {
        self.channel == channel && self.command == command
    }

    /// Mailbox word announcing this message
    pub fn mailbox_word(&self) -> u64 {
        MailboxWord {
            command: self.command,
            channel: self.channel,
            p0: self.p0,
        }
        .pack()
    }

    /// Little-endian wire bytes
    pub fn to_bytes(&self) -> [u8; MESSAGE_SIZE] {
        let mut raw = [0u8; MESSAGE_SIZE];
        raw[0..2].copy_from_slice(&self.channel.to_le_bytes());
        raw[2..4].copy_from_slice(&self.command.to_le_bytes());
        for (i, p) in self.params().iter().enumerate() {
            raw[4 + i * 4..8 + i * 4].copy_from_slice(&p.to_le_bytes());
        }
        raw
    }

    /// Parse wire bytes
    pub fn from_bytes(raw: &[u8; MESSAGE_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            channel: u16::from_le_bytes([raw[0], raw[1]]),
            command: u16::from_le_bytes([raw[2], raw[3]]),
            p0: word(4),
            p1: word(8),
            p2: word(12),
            p3: word(16),
        }
    }

    /// Read a message from a 4-byte aligned slot
    pub(crate) fn load(seg: &SharedSegment, offset: usize) -> Self {
        let head = seg.read_u32(offset);
        Self {
            channel: head as u16,
            command: (head >> 16) as u16,
            p0: seg.read_u32(offset + 4),
            p1: seg.read_u32(offset + 8),
            p2: seg.read_u32(offset + 12),
            p3: seg.read_u32(offset + 16),
        }
    }

    /// Write a message into a 4-byte aligned slot
    pub(crate) fn store(&self, seg: &SharedSegment, offset: usize) {
        seg.write_u32(offset, self.channel as u32 | (self.command as u32) << 16);
        seg.write_u32(offset + 4, self.p0);
        seg.write_u32(offset + 8, self.p1);
        seg.write_u32(offset + 12, self.p2);
        seg.write_u32(offset + 16, self.p3);
    }
}
