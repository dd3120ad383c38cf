//! # Message Ring
//!
//! Single-producer/single-consumer ring of fixed [`Message`] slots in shared
//! memory. Read and write indices are free-running `u32` counters; the slot
//! for index `i` is `i mod count`, and `write - read` (wrapping) is the
//! number of pending messages.
//!
//! ## Link Segment Layout
//!
//! ```text
//! 0x00  ┌───────────────────────────┐
//!       │ tx RingHeader (24 bytes)  │  host -> peer
//! 0x18  ├───────────────────────────┤
//!       │ rx RingHeader (24 bytes)  │  peer -> host
//! 0x30  ├───────────────────────────┤
//!       │ tx slots (count x 20)     │
//!       ├───────────────────────────┤
//!       │ rx slots (count x 20)     │
//!       └───────────────────────────┘
//! ```
//!
//! Callers serialize each side: the producer lock guards `push`, the
//! dispatcher alone calls `advance` on the inbound ring.

use core::mem::size_of;
use std::sync::Arc;

use helix_hal::{PeerAddr, SharedSegment};

use crate::error::{IpcError, IpcResult};
use crate::message::{Message, MESSAGE_SIZE};

// ============================================================================
// RING HEADER
// ============================================================================

/// Ring header words as laid out in shared memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RingHeader {
    /// Peer address of slot (or block) memory
    pub addr: u32,
    /// Number of slots
    pub count: u32,
    /// Slot size in bytes
    pub slot_size: u32,
    /// Peer address of the descriptor table (block rings only)
    pub descriptors: u32,
    /// Consumer index
    pub read_index: u32,
    /// Producer index
    pub write_index: u32,
}

/// Size of one ring header
pub const RING_HEADER_SIZE: usize = 24;

/// Size of a tx/rx header pair
pub const HEADER_PAIR_SIZE: usize = 2 * RING_HEADER_SIZE;

static_assertions::const_assert_eq!(size_of::<RingHeader>(), RING_HEADER_SIZE);

const ADDR: usize = 0;
const COUNT: usize = 4;
const SLOT_SIZE: usize = 8;
const DESCRIPTORS: usize = 12;
const READ_INDEX: usize = 16;
const WRITE_INDEX: usize = 20;

impl RingHeader {
    /// Read a header at `offset`
    pub fn load(seg: &SharedSegment, offset: usize) -> Self {
        Self {
            addr: seg.read_u32(offset + ADDR),
            count: seg.read_u32(offset + COUNT),
            slot_size: seg.read_u32(offset + SLOT_SIZE),
            descriptors: seg.read_u32(offset + DESCRIPTORS),
            read_index: seg.read_u32(offset + READ_INDEX),
            write_index: seg.read_u32(offset + WRITE_INDEX),
        }
    }

    /// Write a header at `offset`
    ///
    /// Indices are written last so the peer never sees them paired with a
    /// stale geometry.
    pub fn store(&self, seg: &SharedSegment, offset: usize) {
        seg.write_u32(offset + ADDR, self.addr);
        seg.write_u32(offset + COUNT, self.count);
        seg.write_u32(offset + SLOT_SIZE, self.slot_size);
        seg.write_u32(offset + DESCRIPTORS, self.descriptors);
        seg.write_u32(offset + READ_INDEX, self.read_index);
        seg.write_u32(offset + WRITE_INDEX, self.write_index);
    }

    /// Pending entries
    pub fn pending(&self) -> u32 {
        self.write_index.wrapping_sub(self.read_index)
    }
}

/// Live index pair of a header in shared memory
#[derive(Debug, Clone, Copy)]
pub(crate) struct Indices {
    header: usize,
}

impl Indices {
    pub(crate) const fn at(header: usize) -> Self {
        Self { header }
    }

    pub(crate) fn read(&self, seg: &SharedSegment) -> u32 {
        seg.read_u32(self.header + READ_INDEX)
    }

    pub(crate) fn write(&self, seg: &SharedSegment) -> u32 {
        seg.read_u32(self.header + WRITE_INDEX)
    }

    pub(crate) fn set_read(&self, seg: &SharedSegment, value: u32) {
        seg.write_u32(self.header + READ_INDEX, value);
    }

    pub(crate) fn set_write(&self, seg: &SharedSegment, value: u32) {
        seg.write_u32(self.header + WRITE_INDEX, value);
    }

    pub(crate) fn pending(&self, seg: &SharedSegment) -> u32 {
        self.write(seg).wrapping_sub(self.read(seg))
    }
}

/// Slot position for a free-running index
#[inline]
pub(crate) fn ring_pos(index: u32, count: u32) -> u32 {
    if count.is_power_of_two() {
        index & (count - 1)
    } else {
        index % count
    }
}

// ============================================================================
// MESSAGE RING
// ============================================================================

/// Message ring over a shared segment
#[derive(Debug)]
pub struct MessageRing {
    seg: Arc<SharedSegment>,
    indices: Indices,
    slots: usize,
    capacity: u32,
}

impl MessageRing {
    /// Initialize a ring header at `header` with `capacity` slots at `slots`
    pub fn format(
        seg: Arc<SharedSegment>,
        header: usize,
        slots: usize,
        capacity: u32,
    ) -> IpcResult<Self> {
        if capacity == 0 {
            return Err(IpcError::InvalidParameter("ring capacity"));
        }
        let span = capacity as usize * MESSAGE_SIZE;
        if header + RING_HEADER_SIZE > seg.size() || slots + span > seg.size() {
            return Err(IpcError::TooLarge {
                len: slots + span,
                max: seg.size(),
            });
        }
        let head = RingHeader {
            addr: seg.to_peer(slots)?.as_u32(),
            count: capacity,
            slot_size: MESSAGE_SIZE as u32,
            descriptors: 0,
            read_index: 0,
            write_index: 0,
        };
        head.store(&seg, header);
        Ok(Self {
            seg,
            indices: Indices::at(header),
            slots,
            capacity,
        })
    }

    /// Attach to a ring the other side formatted
    pub fn attach(seg: Arc<SharedSegment>, header: usize) -> IpcResult<Self> {
        let head = RingHeader::load(&seg, header);
        if head.count == 0 || head.slot_size as usize != MESSAGE_SIZE {
            return Err(IpcError::InvalidParameter("ring header geometry"));
        }
        let slots = seg.to_offset(PeerAddr(head.addr), head.count as usize * MESSAGE_SIZE)?;
        if slots % 4 != 0 {
            return Err(IpcError::InvalidParameter("ring slot alignment"));
        }
        Ok(Self {
            seg,
            indices: Indices::at(header),
            slots,
            capacity: head.count,
        })
    }

    /// Number of slots
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Consumer index
    pub fn read_index(&self) -> u32 {
        self.indices.read(&self.seg)
    }

    /// Producer index
    pub fn write_index(&self) -> u32 {
        self.indices.write(&self.seg)
    }

    /// Pending messages
    pub fn pending(&self) -> u32 {
        self.indices.pending(&self.seg)
    }

    /// Whether no message is pending
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Whether every slot is occupied
    pub fn is_full(&self) -> bool {
        self.pending() >= self.capacity
    }

    /// Whether the indices violate `write - read <= count`
    pub fn is_corrupt(&self) -> bool {
        self.pending() > self.capacity
    }

    /// Header snapshot
    pub fn header(&self) -> RingHeader {
        RingHeader::load(&self.seg, self.indices.header)
    }

    fn slot(&self, index: u32) -> usize {
        self.slots + ring_pos(index, self.capacity) as usize * MESSAGE_SIZE
    }

    /// Append a message
    ///
    /// The slot is written before the write index is published.
    pub fn push(&mut self, msg: &Message) -> IpcResult<()> {
        let write = self.write_index();
        if write.wrapping_sub(self.read_index()) >= self.capacity {
            return Err(IpcError::Busy);
        }
        msg.store(&self.seg, self.slot(write));
        self.indices.set_write(&self.seg, write.wrapping_add(1));
        Ok(())
    }

    /// Read the slot for index `i` without consuming anything
    pub fn take(&self, index: u32) -> Message {
        Message::load(&self.seg, self.slot(index))
    }

    /// Oldest pending message, if any
    pub fn peek(&self) -> Option<Message> {
        let read = self.read_index();
        (read != self.write_index()).then(|| self.take(read))
    }

    /// Consume the oldest message
    pub fn advance(&mut self) {
        let read = self.read_index();
        self.indices.set_read(&self.seg, read.wrapping_add(1));
    }

    /// Consume and return the oldest message
    pub fn pop(&mut self) -> Option<Message> {
        let msg = self.peek()?;
        self.advance();
        Some(msg)
    }

    /// Empty the ring
    pub fn reset(&mut self) {
        self.indices.set_read(&self.seg, 0);
        self.indices.set_write(&self.seg, 0);
    }
}

// ============================================================================
// LINK LAYOUT
// ============================================================================

/// Offsets of the two message rings inside a link segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLayout {
    /// Slots per direction
    pub capacity: u32,
    /// Host -> peer header
    pub tx_header: usize,
    /// Peer -> host header
    pub rx_header: usize,
    /// Host -> peer slots
    pub tx_slots: usize,
    /// Peer -> host slots
    pub rx_slots: usize,
}

impl LinkLayout {
    /// Split a segment of `size` bytes into two equal rings
    ///
    /// Capacity is rounded down to a power of two so slot positions reduce
    /// to a mask.
    pub fn for_size(size: usize) -> IpcResult<Self> {
        let per_dir = size.saturating_sub(HEADER_PAIR_SIZE) / 2 / MESSAGE_SIZE;
        if per_dir == 0 {
            return Err(IpcError::TooLarge {
                len: HEADER_PAIR_SIZE + 2 * MESSAGE_SIZE,
                max: size,
            });
        }
        let capacity = 1u32 << (usize::BITS - 1 - per_dir.leading_zeros());
        let span = capacity as usize * MESSAGE_SIZE;
        Ok(Self {
            capacity,
            tx_header: 0,
            rx_header: RING_HEADER_SIZE,
            tx_slots: HEADER_PAIR_SIZE,
            rx_slots: HEADER_PAIR_SIZE + span,
        })
    }
}
