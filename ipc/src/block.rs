//! # Block Pool
//!
//! Zero-copy bulk transfer over a dedicated shared segment. Each direction
//! owns a set of equally sized blocks that circulate between two descriptor
//! rings: a "ring" of filled blocks travelling to the consumer and a "pool"
//! of free blocks travelling back to the producer.
//!
//! ## Segment Layout
//!
//! ```text
//! 0x00  ring.tx header   host fills, peer consumes
//! 0x18  ring.rx header   peer fills, host consumes
//! 0x30  pool.tx header   free outbound blocks, peer returns, host acquires
//! 0x48  pool.rx header   free inbound blocks, host returns, peer acquires
//! 0x60  tx blocks, rx blocks
//!       descriptor tables: ring.tx, ring.rx, pool.tx, pool.rx
//! ```
//!
//! Every header carries the block region (`addr`, `count`, `slot_size`) and
//! the peer address of its descriptor table. Both free pools start full.
//!
//! ## Ownership
//!
//! A [`Block`] handle is the only claim on a block; it is consumed by
//! [`BlockPool::commit`] or [`BlockPool::release`]. Every descriptor read
//! from shared memory is checked against its region and against the local
//! record of which blocks are held, so a confused peer yields
//! [`IpcError::InvalidDescriptor`] instead of aliasing. Blocks also carry the
//! id of the pool side that handed them out; any other pool refuses them.

use core::fmt;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use helix_hal::{PeerAddr, SharedSegment};

use crate::command;
use crate::config::{BlockPoolConfig, CommandConfig, BLOCK_ALIGN};
use crate::error::{IpcError, IpcResult};
use crate::link::{Link, PoolEvents};
use crate::message::{codes, Message};
use crate::peer::PeerPort;
use crate::ring::{ring_pos, Indices, RingHeader, RING_HEADER_SIZE};
use crate::sync::{SpinLock, Timeout, WaitQueue};

/// Size of the four ring headers at the start of a pool segment
pub const POOL_HEADER_SIZE: usize = 4 * RING_HEADER_SIZE;

/// Size of one descriptor
pub const DESCRIPTOR_SIZE: usize = 8;

const RING_TX: usize = 0;
const RING_RX: usize = RING_HEADER_SIZE;
const POOL_TX: usize = 2 * RING_HEADER_SIZE;
const POOL_RX: usize = 3 * RING_HEADER_SIZE;

static_assertions::const_assert_eq!(size_of::<Descriptor>(), DESCRIPTOR_SIZE);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

fn next_pool_id() -> u64 {
    NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// DESCRIPTORS
// ============================================================================

/// Block descriptor as stored in the descriptor tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Descriptor {
    /// Peer address of the block
    pub addr: u32,
    /// Bytes used
    pub len: u32,
}

impl Descriptor {
    fn load(seg: &SharedSegment, offset: usize) -> Self {
        Self {
            addr: seg.read_u32(offset),
            len: seg.read_u32(offset + 4),
        }
    }

    fn store(&self, seg: &SharedSegment, offset: usize) {
        seg.write_u32(offset, self.addr);
        seg.write_u32(offset + 4, self.len);
    }
}

/// Descriptor ring: indices in a header, entries in a table
#[derive(Debug, Clone, Copy)]
struct DescRing {
    indices: Indices,
    table: usize,
    count: u32,
}

impl DescRing {
    fn attach(seg: &SharedSegment, header: usize) -> IpcResult<Self> {
        let head = RingHeader::load(seg, header);
        if head.count == 0 {
            return Err(IpcError::InvalidParameter("block ring count"));
        }
        let table = seg.to_offset(
            PeerAddr(head.descriptors),
            head.count as usize * DESCRIPTOR_SIZE,
        )?;
        if table % 4 != 0 {
            return Err(IpcError::InvalidParameter("descriptor table alignment"));
        }
        Ok(Self {
            indices: Indices::at(header),
            table,
            count: head.count,
        })
    }

    fn entry(&self, index: u32) -> usize {
        self.table + ring_pos(index, self.count) as usize * DESCRIPTOR_SIZE
    }

    fn pending(&self, seg: &SharedSegment) -> u32 {
        self.indices.pending(seg)
    }

    fn pop(&self, seg: &SharedSegment) -> IpcResult<Option<Descriptor>> {
        let read = self.indices.read(seg);
        let pending = self.indices.write(seg).wrapping_sub(read);
        if pending > self.count {
            return Err(IpcError::InvalidDescriptor);
        }
        if pending == 0 {
            return Ok(None);
        }
        let desc = Descriptor::load(seg, self.entry(read));
        self.indices.set_read(seg, read.wrapping_add(1));
        Ok(Some(desc))
    }

    /// Append at the tail; returns whether the ring was empty
    fn push(&self, seg: &SharedSegment, desc: Descriptor) -> IpcResult<bool> {
        let write = self.indices.write(seg);
        let pending = write.wrapping_sub(self.indices.read(seg));
        if pending >= self.count {
            return Err(IpcError::InvalidDescriptor);
        }
        desc.store(seg, self.entry(write));
        self.indices.set_write(seg, write.wrapping_add(1));
        Ok(pending == 0)
    }

    /// Put back at the head; only the consumer may do this
    fn unpop(&self, seg: &SharedSegment, desc: Descriptor) -> IpcResult<bool> {
        let read = self.indices.read(seg);
        let pending = self.indices.write(seg).wrapping_sub(read);
        if pending >= self.count {
            return Err(IpcError::InvalidDescriptor);
        }
        let read = read.wrapping_sub(1);
        desc.store(seg, self.entry(read));
        self.indices.set_read(seg, read);
        Ok(pending == 0)
    }
}

/// Block memory of one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    offset: usize,
    addr: u32,
    stride: u32,
    count: u32,
}

impl Region {
    fn attach(seg: &SharedSegment, header: usize) -> IpcResult<Self> {
        let head = RingHeader::load(seg, header);
        if head.slot_size == 0 || head.slot_size % BLOCK_ALIGN != 0 {
            return Err(IpcError::InvalidParameter("block size"));
        }
        let offset = seg.to_offset(
            PeerAddr(head.addr),
            head.count as usize * head.slot_size as usize,
        )?;
        Ok(Self {
            offset,
            addr: head.addr,
            stride: head.slot_size,
            count: head.count,
        })
    }

    /// Block index a descriptor refers to
    fn locate(&self, desc: &Descriptor) -> Option<u32> {
        if desc.len > self.stride {
            return None;
        }
        let rel = desc.addr.checked_sub(self.addr)?;
        if rel % self.stride != 0 {
            return None;
        }
        let index = rel / self.stride;
        (index < self.count).then_some(index)
    }

    fn block_offset(&self, index: u32) -> usize {
        self.offset + index as usize * self.stride as usize
    }

    fn block_addr(&self, index: u32) -> u32 {
        self.addr + index * self.stride
    }
}

// ============================================================================
// BLOCK HANDLE
// ============================================================================

/// Which way a block travels, seen from its holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Acquired from the local free pool, to be filled and committed
    Outbound,
    /// Taken from the inbound ring, to be read and released
    Inbound,
}

/// Exclusive claim on one block
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    pool: u64,
    direction: Direction,
    index: u32,
    offset: usize,
    addr: PeerAddr,
    len: u32,
    capacity: u32,
}

impl Block {
    /// Direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Index within its region
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Local offset in the pool segment
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Peer address
    pub fn addr(&self) -> PeerAddr {
        self.addr
    }

    /// Bytes used
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether no bytes are used
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Block size
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Set the number of bytes used
    pub fn set_len(&mut self, len: u32) -> IpcResult<()> {
        if len > self.capacity {
            return Err(IpcError::TooLarge {
                len: len as usize,
                max: self.capacity as usize,
            });
        }
        self.len = len;
        Ok(())
    }
}

// ============================================================================
// LANE
// ============================================================================

/// One direction from one side: filled ring, free pool, region and the
/// record of blocks this side holds
#[derive(Debug)]
struct Lane {
    pool: u64,
    direction: Direction,
    full: DescRing,
    free: DescRing,
    region: Region,
    held: Vec<bool>,
}

impl Lane {
    fn attach(
        seg: &SharedSegment,
        pool: u64,
        direction: Direction,
        full: usize,
        free: usize,
    ) -> IpcResult<Self> {
        let region = Region::attach(seg, full)?;
        if Region::attach(seg, free)? != region {
            return Err(IpcError::InvalidParameter("pool geometry mismatch"));
        }
        Ok(Self {
            pool,
            direction,
            full: DescRing::attach(seg, full)?,
            free: DescRing::attach(seg, free)?,
            region,
            held: vec![false; region.count as usize],
        })
    }

    fn claim(&mut self, desc: Descriptor) -> IpcResult<Block> {
        let index = self
            .region
            .locate(&desc)
            .ok_or(IpcError::InvalidDescriptor)?;
        let held = &mut self.held[index as usize];
        if *held {
            return Err(IpcError::InvalidDescriptor);
        }
        *held = true;
        Ok(Block {
            pool: self.pool,
            direction: self.direction,
            index,
            offset: self.region.block_offset(index),
            addr: PeerAddr(self.region.block_addr(index)),
            len: desc.len,
            capacity: self.region.stride,
        })
    }

    fn check(&self, block: &Block) -> IpcResult<usize> {
        let index = block.index as usize;
        let valid = block.pool == self.pool
            && block.direction == self.direction
            && block.index < self.region.count
            && block.offset == self.region.block_offset(block.index)
            && block.len <= self.region.stride
            && self.held[index];
        if valid {
            Ok(index)
        } else {
            Err(IpcError::InvalidDescriptor)
        }
    }

    /// Free pool -> held
    fn acquire(&mut self, seg: &SharedSegment) -> IpcResult<Block> {
        let desc = self.free.pop(seg)?.ok_or(IpcError::NoData)?;
        let mut block = self.claim(desc)?;
        block.len = block.capacity;
        Ok(block)
    }

    /// Held -> filled ring
    fn commit(&mut self, seg: &SharedSegment, block: &Block) -> IpcResult<bool> {
        let index = self.check(block)?;
        let was_empty = self.full.push(
            seg,
            Descriptor {
                addr: block.addr.as_u32(),
                len: block.len,
            },
        )?;
        self.held[index] = false;
        Ok(was_empty)
    }

    /// Held -> head of the free pool
    fn cancel(&mut self, seg: &SharedSegment, block: &Block) -> IpcResult<bool> {
        let index = self.check(block)?;
        let was_empty = self.free.unpop(
            seg,
            Descriptor {
                addr: block.addr.as_u32(),
                len: self.region.stride,
            },
        )?;
        self.held[index] = false;
        Ok(was_empty)
    }

    /// Filled ring -> held
    fn take(&mut self, seg: &SharedSegment) -> IpcResult<Block> {
        let desc = self.full.pop(seg)?.ok_or(IpcError::NoData)?;
        self.claim(desc)
    }

    /// Held -> tail of the free pool
    fn release(&mut self, seg: &SharedSegment, block: &Block) -> IpcResult<bool> {
        let index = self.check(block)?;
        let was_empty = self.free.push(
            seg,
            Descriptor {
                addr: block.addr.as_u32(),
                len: self.region.stride,
            },
        )?;
        self.held[index] = false;
        Ok(was_empty)
    }
}

fn read_block(seg: &SharedSegment, pool: u64, block: &Block, buf: &mut [u8]) -> IpcResult<usize> {
    if block.pool != pool {
        return Err(IpcError::InvalidDescriptor);
    }
    let n = buf.len().min(block.len as usize);
    seg.read_bytes(block.offset, &mut buf[..n]);
    Ok(n)
}

fn write_block(seg: &SharedSegment, pool: u64, block: &mut Block, data: &[u8]) -> IpcResult<()> {
    if block.pool != pool {
        return Err(IpcError::InvalidDescriptor);
    }
    if block.direction != Direction::Outbound {
        return Err(IpcError::InvalidParameter("write to inbound block"));
    }
    if data.len() > block.capacity as usize {
        return Err(IpcError::TooLarge {
            len: data.len(),
            max: block.capacity as usize,
        });
    }
    seg.write_bytes(block.offset, data);
    block.len = data.len() as u32;
    Ok(())
}

/// Lay out a fresh pool segment
fn format(seg: &SharedSegment, config: &BlockPoolConfig) -> IpcResult<()> {
    if config.tx_blocks == 0
        || config.rx_blocks == 0
        || config.tx_block_size == 0
        || config.rx_block_size == 0
    {
        return Err(IpcError::InvalidParameter("block pool geometry"));
    }
    let need = config.required_size();
    if need > seg.size() {
        return Err(IpcError::TooLarge {
            len: need,
            max: seg.size(),
        });
    }

    let (tx_n, rx_n) = (config.tx_blocks, config.rx_blocks);
    let (tx_stride, rx_stride) = (config.tx_stride(), config.rx_stride());
    let tx_blocks = POOL_HEADER_SIZE;
    let rx_blocks = tx_blocks + tx_n as usize * tx_stride as usize;
    let ring_tx_table = rx_blocks + rx_n as usize * rx_stride as usize;
    let ring_rx_table = ring_tx_table + tx_n as usize * DESCRIPTOR_SIZE;
    let pool_tx_table = ring_rx_table + rx_n as usize * DESCRIPTOR_SIZE;
    let pool_rx_table = pool_tx_table + tx_n as usize * DESCRIPTOR_SIZE;

    seg.fill(0, need, 0);

    let tx_addr = seg.to_peer(tx_blocks)?.as_u32();
    let rx_addr = seg.to_peer(rx_blocks)?.as_u32();
    for i in 0..tx_n {
        let desc = Descriptor {
            addr: tx_addr + i * tx_stride,
            len: tx_stride,
        };
        desc.store(seg, pool_tx_table + i as usize * DESCRIPTOR_SIZE);
    }
    for i in 0..rx_n {
        let desc = Descriptor {
            addr: rx_addr + i * rx_stride,
            len: rx_stride,
        };
        desc.store(seg, pool_rx_table + i as usize * DESCRIPTOR_SIZE);
    }

    let headers = [
        (RING_TX, tx_addr, tx_n, tx_stride, ring_tx_table, 0),
        (RING_RX, rx_addr, rx_n, rx_stride, ring_rx_table, 0),
        (POOL_TX, tx_addr, tx_n, tx_stride, pool_tx_table, tx_n),
        (POOL_RX, rx_addr, rx_n, rx_stride, pool_rx_table, rx_n),
    ];
    for (offset, addr, count, stride, table, write) in headers {
        RingHeader {
            addr,
            count,
            slot_size: stride,
            descriptors: seg.to_peer(table)?.as_u32(),
            read_index: 0,
            write_index: write,
        }
        .store(seg, offset);
    }
    Ok(())
}

// ============================================================================
// EVENTS
// ============================================================================

bitflags! {
    /// Events delivered to a pool notifier
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolEvent: u32 {
        /// Outbound blocks became available
        const GET = 1 << 0;
        /// Inbound blocks arrived
        const RECV = 1 << 1;
        /// The link changed state
        const STATUS = 1 << 2;
        /// The peer acknowledged the pool
        const OPEN = 1 << 3;
        /// The pool was closed
        const CLOSE = 1 << 4;
    }
}

bitflags! {
    /// Non-blocking readiness of a pool
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolReadiness: u32 {
        /// An inbound block can be taken
        const READABLE = 1 << 0;
        /// An outbound block can be acquired
        const WRITABLE = 1 << 1;
    }
}

/// Pool event callback
///
/// May run on the dispatch path with ring locks held: it must not block or
/// call back into the link.
pub trait PoolNotifier: Send + Sync {
    /// Handle `event` on the pool bound to `channel`
    fn notify(&self, channel: u16, event: PoolEvent);
}

impl<F> PoolNotifier for F
where
    F: Fn(u16, PoolEvent) + Send + Sync,
{
    fn notify(&self, channel: u16, event: PoolEvent) {
        self(channel, event)
    }
}

/// When a committed block is announced to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    /// Send the event now
    Immediate,
    /// Batch until [`BlockPool::flush`]
    Deferred,
}

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Debug, Default)]
struct PoolCounters {
    sent: AtomicU64,
    received: AtomicU64,
    tx_errors: AtomicU64,
    rx_errors: AtomicU64,
    notify_failures: AtomicU64,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks committed to the peer
    pub sent: u64,
    /// Blocks taken from the peer
    pub received: u64,
    /// Bad outbound descriptors
    pub tx_errors: u64,
    /// Bad inbound descriptors
    pub rx_errors: u64,
    /// Events that could not be sent
    pub notify_failures: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} received={} tx_errors={} rx_errors={} notify_failures={}",
            self.sent, self.received, self.tx_errors, self.rx_errors, self.notify_failures
        )
    }
}

// ============================================================================
// HOST POOL
// ============================================================================

struct PoolInner {
    id: u64,
    link: Link,
    channel: u16,
    segment: Arc<SharedSegment>,
    closed: AtomicBool,
    outbound: SpinLock<Lane>,
    inbound: SpinLock<Lane>,
    get_waiters: WaitQueue,
    recv_waiters: WaitQueue,
    flush_due: AtomicBool,
    notifier: SpinLock<Option<Arc<dyn PoolNotifier>>>,
    counters: PoolCounters,
}

impl PoolInner {
    fn notify(&self, event: PoolEvent) {
        let notifier = self.notifier.lock().clone();
        if let Some(notifier) = notifier {
            notifier.notify(self.channel, event);
        }
    }

    fn signal(&self, event: u32) -> IpcResult<()> {
        let msg = Message::new(self.channel, codes::BLOCK_EVENT, event, 0, 0, 0);
        self.link.send(&msg).map_err(|e| {
            self.counters.notify_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "{}: pool channel {} event {:#x} not sent: {}",
                self.link.name(),
                self.channel,
                event,
                e
            );
            e
        })
    }

    fn count_error(&self, direction: Direction, err: IpcError) -> IpcError {
        if err == IpcError::InvalidDescriptor {
            let counter = match direction {
                Direction::Outbound => &self.counters.tx_errors,
                Direction::Inbound => &self.counters.rx_errors,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "{}: pool channel {} bad {:?} descriptor",
                self.link.name(),
                self.channel,
                direction
            );
        }
        err
    }
}

impl PoolEvents for PoolInner {
    fn on_event(&self, msg: &Message) {
        match msg.p0 {
            codes::EVENT_SEND => {
                if self.inbound.lock().full.pending(&self.segment) == 0 {
                    return;
                }
                self.recv_waiters.wake_all();
                self.notify(PoolEvent::RECV);
            },
            codes::EVENT_RELEASE => {
                self.get_waiters.wake_all();
                self.notify(PoolEvent::GET);
            },
            other => log::warn!(
                "{}: pool channel {} unknown event {:#x}",
                self.link.name(),
                self.channel,
                other
            ),
        }
    }

    fn on_link_down(&self) {
        self.get_waiters.wake_all();
        self.recv_waiters.wake_all();
        self.notify(PoolEvent::STATUS);
    }
}

/// Host side of a block pool bound to a link channel
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockPool")
            .field("channel", &self.inner.channel)
            .field("closed", &self.is_closed())
            .field("free", &self.free_count())
            .field("arrived", &self.arrived_count())
            .finish()
    }
}

impl BlockPool {
    /// Format `segment`, open `channel` on `link` and start routing its
    /// block events to this pool
    pub fn create(
        link: &Link,
        channel: u16,
        segment: Arc<SharedSegment>,
        config: BlockPoolConfig,
    ) -> IpcResult<Self> {
        format(&segment, &config)?;
        let id = next_pool_id();
        let outbound = Lane::attach(&segment, id, Direction::Outbound, RING_TX, POOL_TX)?;
        let inbound = Lane::attach(&segment, id, Direction::Inbound, RING_RX, POOL_RX)?;
        link.open(channel)?;

        let inner = Arc::new(PoolInner {
            id,
            link: link.clone(),
            channel,
            segment,
            closed: AtomicBool::new(false),
            outbound: SpinLock::new(outbound),
            inbound: SpinLock::new(inbound),
            get_waiters: WaitQueue::new(),
            recv_waiters: WaitQueue::new(),
            flush_due: AtomicBool::new(false),
            notifier: SpinLock::new(None),
            counters: PoolCounters::default(),
        });
        let weak: Weak<PoolInner> = Arc::downgrade(&inner);
        let events: Weak<dyn PoolEvents> = weak;
        if let Err(e) = link.register_pool(channel, events) {
            if let Err(close) = link.close(channel) {
                log::warn!("{}: channel {} close failed: {}", link.name(), channel, close);
            }
            return Err(e);
        }
        log::info!(
            "{}: block pool on channel {}: {} x {} out, {} x {} in",
            link.name(),
            channel,
            config.tx_blocks,
            config.tx_stride(),
            config.rx_blocks,
            config.rx_stride()
        );
        Ok(Self { inner })
    }

    /// Channel the pool is bound to
    pub fn channel(&self) -> u16 {
        self.inner.channel
    }

    /// Pool segment
    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.inner.segment
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> IpcResult<()> {
        if self.is_closed() {
            Err(IpcError::NotOpen)
        } else {
            Ok(())
        }
    }

    fn wait_for(
        &self,
        queue: &WaitQueue,
        timeout: Timeout,
        mut attempt: impl FnMut() -> IpcResult<Block>,
    ) -> IpcResult<Block> {
        let inner = &*self.inner;
        let generation = inner.link.generation();
        queue
            .wait_until(timeout, || {
                if inner.closed.load(Ordering::Acquire) {
                    return Some(Err(IpcError::NotOpen));
                }
                if inner.link.generation() != generation {
                    return Some(Err(IpcError::LinkDown));
                }
                match attempt() {
                    Err(IpcError::NoData) => None,
                    other => Some(other),
                }
            })
            .unwrap_or(if timeout.is_nowait() {
                Err(IpcError::NoData)
            } else {
                Err(IpcError::TimedOut)
            })
    }

    /// Get a free outbound block
    pub fn acquire(&self, timeout: impl Into<Timeout>) -> IpcResult<Block> {
        let inner = &*self.inner;
        self.wait_for(&inner.get_waiters, timeout.into(), || {
            inner
                .outbound
                .lock()
                .acquire(&inner.segment)
                .map_err(|e| inner.count_error(Direction::Outbound, e))
        })
    }

    /// Hand a filled block to the peer
    pub fn commit(&self, block: Block, notify: Notify) -> IpcResult<()> {
        self.check_open()?;
        let inner = &*self.inner;
        inner
            .outbound
            .lock()
            .commit(&inner.segment, &block)
            .map_err(|e| inner.count_error(Direction::Outbound, e))?;
        inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        match notify {
            Notify::Immediate => {
                inner.flush_due.store(false, Ordering::Release);
                if inner.signal(codes::EVENT_SEND).is_err() {
                    // retried by the next flush
                    inner.flush_due.store(true, Ordering::Release);
                }
            },
            Notify::Deferred => inner.flush_due.store(true, Ordering::Release),
        }
        Ok(())
    }

    /// Send the event owed for deferred commits
    pub fn flush(&self) -> IpcResult<()> {
        if !self.inner.flush_due.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.signal(codes::EVENT_SEND).map_err(|e| {
            self.inner.flush_due.store(true, Ordering::Release);
            e
        })
    }

    /// Take the next block the peer sent
    pub fn take(&self, timeout: impl Into<Timeout>) -> IpcResult<Block> {
        let inner = &*self.inner;
        let block = self.wait_for(&inner.recv_waiters, timeout.into(), || {
            inner
                .inbound
                .lock()
                .take(&inner.segment)
                .map_err(|e| inner.count_error(Direction::Inbound, e))
        })?;
        inner.counters.received.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    /// Give a block back to the pool it came from
    ///
    /// Inbound blocks return to the peer's free pool, with a release event
    /// when that pool was empty. Outbound blocks that were never committed
    /// return to the head of the local free pool.
    pub fn release(&self, block: Block) -> IpcResult<()> {
        let inner = &*self.inner;
        match block.direction {
            Direction::Inbound => {
                let was_empty = inner
                    .inbound
                    .lock()
                    .release(&inner.segment, &block)
                    .map_err(|e| inner.count_error(Direction::Inbound, e))?;
                // a lost event is counted; the block is back either way
                if was_empty && inner.signal(codes::EVENT_RELEASE).is_err() {
                    log::debug!("{}: release event dropped", inner.link.name());
                }
            },
            Direction::Outbound => {
                let was_empty = inner
                    .outbound
                    .lock()
                    .cancel(&inner.segment, &block)
                    .map_err(|e| inner.count_error(Direction::Outbound, e))?;
                if was_empty {
                    inner.get_waiters.wake_all();
                }
            },
        }
        Ok(())
    }

    /// Copy out up to `block.len()` bytes; returns how many were copied
    pub fn read(&self, block: &Block, buf: &mut [u8]) -> IpcResult<usize> {
        let inner = &*self.inner;
        read_block(&inner.segment, inner.id, block, buf)
            .map_err(|e| inner.count_error(block.direction, e))
    }

    /// Fill an outbound block and set its length
    pub fn write(&self, block: &mut Block, data: &[u8]) -> IpcResult<()> {
        let inner = &*self.inner;
        let direction = block.direction;
        write_block(&inner.segment, inner.id, block, data)
            .map_err(|e| inner.count_error(direction, e))
    }

    /// Free outbound blocks
    pub fn free_count(&self) -> u32 {
        self.inner.outbound.lock().free.pending(&self.inner.segment)
    }

    /// Inbound blocks waiting to be taken
    pub fn arrived_count(&self) -> u32 {
        self.inner.inbound.lock().full.pending(&self.inner.segment)
    }

    /// Readiness without blocking
    pub fn poll(&self) -> PoolReadiness {
        let mut ready = PoolReadiness::empty();
        if self.arrived_count() > 0 {
            ready |= PoolReadiness::READABLE;
        }
        if self.free_count() > 0 {
            ready |= PoolReadiness::WRITABLE;
        }
        ready
    }

    /// Install the event callback; only one may be registered
    pub fn register_notifier(&self, notifier: impl PoolNotifier + 'static) -> IpcResult<()> {
        let mut slot = self.inner.notifier.lock();
        if slot.is_some() {
            return Err(IpcError::Busy);
        }
        *slot = Some(Arc::new(notifier));
        Ok(())
    }

    /// Tell the peer where the pool lives and wait for its answer
    pub fn announce(&self, config: &CommandConfig) -> IpcResult<Message> {
        self.check_open()?;
        let inner = &*self.inner;
        let request = Message::new(
            inner.channel,
            codes::BLOCK_SEND_ADDR,
            codes::BLOCK_INIT,
            inner.segment.peer_base().as_u32(),
            inner.segment.size() as u32,
            0,
        );
        let reply = command::exchange(
            &inner.link,
            &request,
            config.attempts,
            config.reply_timeout.into(),
        )?;
        log::info!(
            "{}: block pool on channel {} acknowledged",
            inner.link.name(),
            inner.channel
        );
        inner.notify(PoolEvent::OPEN);
        Ok(reply)
    }

    /// Close the pool: wake every waiter and release the channel
    pub fn close(&self) -> IpcResult<()> {
        let inner = &*self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Err(IpcError::NotOpen);
        }
        inner.get_waiters.wake_all();
        inner.recv_waiters.wake_all();
        inner.notify(PoolEvent::CLOSE);
        inner.link.unregister_pool(inner.channel);
        match inner.link.close(inner.channel) {
            Ok(()) | Err(IpcError::NotOpen) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            sent: c.sent.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            tx_errors: c.tx_errors.load(Ordering::Relaxed),
            rx_errors: c.rx_errors.load(Ordering::Relaxed),
            notify_failures: c.notify_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                log::warn!("{}: pool close on drop: {}", self.inner.link.name(), e);
            }
        }
    }
}

// ============================================================================
// PEER POOL
// ============================================================================

/// Peer side of a block pool
///
/// Mirrors the host: fills `ring.rx` from `pool.rx`, drains `ring.tx` into
/// `pool.tx`. Never blocks.
#[derive(Debug)]
pub struct PeerBlockPool {
    id: u64,
    port: PeerPort,
    channel: u16,
    segment: Arc<SharedSegment>,
    outbound: SpinLock<Lane>,
    inbound: SpinLock<Lane>,
}

impl PeerBlockPool {
    /// Attach to a pool segment the host formatted
    pub fn attach(segment: Arc<SharedSegment>, port: PeerPort, channel: u16) -> IpcResult<Self> {
        let id = next_pool_id();
        let outbound = Lane::attach(&segment, id, Direction::Outbound, RING_RX, POOL_RX)?;
        let inbound = Lane::attach(&segment, id, Direction::Inbound, RING_TX, POOL_TX)?;
        Ok(Self {
            id,
            port,
            channel,
            segment,
            outbound: SpinLock::new(outbound),
            inbound: SpinLock::new(inbound),
        })
    }

    /// Next block the host committed
    pub fn take(&self) -> IpcResult<Block> {
        self.inbound.lock().take(&self.segment)
    }

    /// Return a host block and post a release event
    pub fn give_back(&self, block: Block) -> IpcResult<()> {
        self.inbound.lock().release(&self.segment, &block)?;
        self.port.block_event(self.channel, codes::EVENT_RELEASE)
    }

    /// Free block to send to the host
    pub fn acquire(&self) -> IpcResult<Block> {
        self.outbound.lock().acquire(&self.segment)
    }

    /// Send a filled block and post a send event
    pub fn commit(&self, block: Block) -> IpcResult<()> {
        self.outbound.lock().commit(&self.segment, &block)?;
        self.port.block_event(self.channel, codes::EVENT_SEND)
    }

    /// Copy out a block's bytes
    pub fn read(&self, block: &Block, buf: &mut [u8]) -> IpcResult<usize> {
        read_block(&self.segment, self.id, block, buf)
    }

    /// Fill a block and set its length
    pub fn write(&self, block: &mut Block, data: &[u8]) -> IpcResult<()> {
        write_block(&self.segment, self.id, block, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::message::channels;
    use std::thread;
    use std::time::{Duration, Instant};

    const POOL_CHANNEL: u16 = channels::DSP_MEM;

    struct Rig {
        link: Link,
        port: PeerPort,
        pool: Arc<BlockPool>,
        peer: PeerBlockPool,
    }

    fn rig() -> Rig {
        let seg = Arc::new(SharedSegment::allocate(0x800, 0x8000_0000).unwrap());
        let link = Link::new(seg.clone(), |_: u64| {}, LinkConfig::named("pool")).unwrap();
        let port = PeerPort::attach(seg).unwrap();
        port.announce_ready().unwrap();
        link.dispatch();

        let config = BlockPoolConfig::default();
        let pool_seg =
            Arc::new(SharedSegment::allocate(config.required_size(), 0x9000_0000).unwrap());
        let pool = Arc::new(BlockPool::create(&link, POOL_CHANNEL, pool_seg.clone(), config).unwrap());
        let peer = PeerBlockPool::attach(pool_seg, port.clone(), POOL_CHANNEL).unwrap();
        Rig {
            link,
            port,
            pool,
            peer,
        }
    }

    fn wait_for_getter(pool: &BlockPool) {
        while pool.inner.get_waiters.is_empty() {
            thread::yield_now();
        }
    }

    #[test]
    fn test_geometry() {
        let config = BlockPoolConfig::default();
        assert_eq!(config.required_size(), 96 + 8 * 4096 + 16 * 8);
        let seg = Arc::new(SharedSegment::allocate(0x800, 0).unwrap());
        let link = Link::new(seg, |_: u64| {}, LinkConfig::default()).unwrap();
        let small = Arc::new(SharedSegment::allocate(1024, 0x9000_0000).unwrap());
        assert!(matches!(
            BlockPool::create(&link, 5, small, config),
            Err(IpcError::TooLarge { .. })
        ));
        assert_eq!(link.channels().state(5).unwrap(), crate::ChannelState::Closed);
    }

    #[test]
    fn test_blocks_are_exclusive() {
        let r = rig();
        let blocks: Vec<Block> = (0..4).map(|_| r.pool.acquire(0).unwrap()).collect();
        for (i, a) in blocks.iter().enumerate() {
            for b in &blocks[i + 1..] {
                assert_ne!(a.index(), b.index());
                assert_ne!(a.addr(), b.addr());
            }
        }
        assert_eq!(r.pool.free_count(), 0);
        assert!(!r.pool.poll().contains(PoolReadiness::WRITABLE));

        // an uncommitted block goes back to the head of the free pool
        let index = blocks[2].index();
        let mut blocks = blocks;
        r.pool.release(blocks.remove(2)).unwrap();
        assert_eq!(r.pool.acquire(0).unwrap().index(), index);
    }

    #[test]
    fn test_four_block_scenario() {
        let r = rig();
        let mut held: Vec<Block> = (0..4).map(|_| r.pool.acquire(0).unwrap()).collect();
        assert_eq!(r.pool.acquire(0), Err(IpcError::NoData));
        assert_eq!(r.pool.acquire(20), Err(IpcError::TimedOut));

        let mut block = held.pop().unwrap();
        r.pool.write(&mut block, b"pcm frame").unwrap();
        r.pool.commit(block, Notify::Immediate).unwrap();
        let event = r.port.poll().unwrap();
        assert_eq!(
            event,
            Message::new(POOL_CHANNEL, codes::BLOCK_EVENT, codes::EVENT_SEND, 0, 0, 0)
        );

        let got = r.peer.take().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(r.peer.read(&got, &mut buf), Ok(9));
        assert_eq!(&buf[..9], b"pcm frame");
        r.peer.give_back(got).unwrap();
        assert_eq!(r.link.dispatch(), 1);

        assert!(r.pool.acquire(0).is_ok());
        assert_eq!(r.pool.stats().sent, 1);
    }

    #[test]
    fn test_release_wakes_blocked_acquire() {
        let r = rig();
        let mut held: Vec<Block> = (0..4).map(|_| r.pool.acquire(0).unwrap()).collect();
        r.pool
            .commit(held.pop().unwrap(), Notify::Immediate)
            .unwrap();

        let getter = {
            let pool = r.pool.clone();
            thread::spawn(move || pool.acquire(Timeout::Forever).map(|b| b.index()))
        };
        wait_for_getter(&r.pool);

        let got = r.peer.take().unwrap();
        let index = got.index();
        r.peer.give_back(got).unwrap();
        r.link.dispatch();
        assert_eq!(getter.join().unwrap(), Ok(index));
    }

    #[test]
    fn test_inbound_take_release() {
        let r = rig();
        let mut sent = Vec::new();
        for i in 0..4u8 {
            let mut block = r.peer.acquire().unwrap();
            r.peer.write(&mut block, &[i; 32]).unwrap();
            sent.push(block.index());
            r.peer.commit(block).unwrap();
        }
        assert!(r.peer.acquire().is_err());
        r.link.dispatch();
        assert_eq!(r.pool.arrived_count(), 4);
        assert!(r.pool.poll().contains(PoolReadiness::READABLE));

        let block = r.pool.take(0).unwrap();
        assert_eq!(block.direction(), Direction::Inbound);
        assert_eq!(block.index(), sent[0]);
        assert_eq!(block.len(), 32);
        let mut buf = [0u8; 64];
        assert_eq!(r.pool.read(&block, &mut buf), Ok(32));
        assert!(buf[..32].iter().all(|&b| b == 0));

        // the peer's free pool was empty, so it hears about the release
        r.pool.release(block).unwrap();
        let event = r.port.poll().unwrap();
        assert_eq!(event.command, codes::BLOCK_EVENT);
        assert_eq!(event.p0, codes::EVENT_RELEASE);
        assert!(r.peer.acquire().is_ok());
    }

    #[test]
    fn test_take_wakes_on_send_event() {
        let r = rig();
        let taker = {
            let pool = r.pool.clone();
            thread::spawn(move || pool.take(Timeout::Forever).map(|b| b.len()))
        };
        while r.pool.inner.recv_waiters.is_empty() {
            thread::yield_now();
        }
        let mut block = r.peer.acquire().unwrap();
        r.peer.write(&mut block, &[7; 100]).unwrap();
        r.peer.commit(block).unwrap();
        r.link.dispatch();
        assert_eq!(taker.join().unwrap(), Ok(100));
    }

    #[test]
    fn test_invalid_descriptors() {
        let r = rig();
        let seg = r.pool.segment().clone();
        let head = RingHeader::load(&seg, RING_RX);
        let table = seg
            .to_offset(PeerAddr(head.descriptors), DESCRIPTOR_SIZE * 4)
            .unwrap();

        // outside the region, then the same valid block twice
        let bogus = Descriptor {
            addr: 0xdead_0000,
            len: 8,
        };
        let valid = Descriptor {
            addr: head.addr,
            len: 8,
        };
        bogus.store(&seg, table);
        valid.store(&seg, table + DESCRIPTOR_SIZE);
        valid.store(&seg, table + 2 * DESCRIPTOR_SIZE);
        seg.write_u32(RING_RX + 20, 3);

        assert_eq!(r.pool.take(0), Err(IpcError::InvalidDescriptor));
        let block = r.pool.take(0).unwrap();
        assert_eq!(r.pool.take(0), Err(IpcError::InvalidDescriptor));
        assert_eq!(r.pool.stats().rx_errors, 2);
        assert_eq!(block.len(), 8);
    }

    #[test]
    fn test_foreign_blocks_rejected() {
        let r = rig();
        let small_config = BlockPoolConfig {
            tx_blocks: 4,
            tx_block_size: 128,
            rx_blocks: 4,
            rx_block_size: 128,
        };
        let small_seg =
            Arc::new(SharedSegment::allocate(small_config.required_size(), 0xa000_0000).unwrap());
        let small = BlockPool::create(&r.link, channels::DSP_PCM, small_seg, small_config).unwrap();

        let mut big: Vec<Block> = (0..4).map(|_| r.pool.acquire(0).unwrap()).collect();
        let mut last = big.pop().unwrap();
        assert_eq!(last.capacity(), 4096);
        let mut buf = [0u8; 16];
        assert_eq!(small.read(&last, &mut buf), Err(IpcError::InvalidDescriptor));
        assert_eq!(
            small.write(&mut last, &[1; 16]),
            Err(IpcError::InvalidDescriptor)
        );
        assert_eq!(r.peer.read(&last, &mut buf), Err(IpcError::InvalidDescriptor));
        assert_eq!(small.stats().tx_errors, 2);

        // same geometry, same index held: still not its block
        let twin_config = BlockPoolConfig::default();
        let twin_seg =
            Arc::new(SharedSegment::allocate(twin_config.required_size(), 0xb000_0000).unwrap());
        let twin = BlockPool::create(&r.link, channels::DSP_LOG, twin_seg, twin_config).unwrap();
        let _twin_held: Vec<Block> = (0..4).map(|_| twin.acquire(0).unwrap()).collect();
        let other = big.pop().unwrap();
        assert_eq!(
            twin.commit(other, Notify::Deferred),
            Err(IpcError::InvalidDescriptor)
        );
        assert_eq!(twin.release(last), Err(IpcError::InvalidDescriptor));
        assert_eq!(twin.free_count(), 0);
        assert_eq!(twin.stats().sent, 0);

        // the owner still accepts its own blocks
        r.pool.release(big.pop().unwrap()).unwrap();
        assert_eq!(r.pool.free_count(), 1);
    }

    #[test]
    fn test_deferred_commit_and_flush() {
        let r = rig();
        let a = r.pool.acquire(0).unwrap();
        let b = r.pool.acquire(0).unwrap();
        r.pool.commit(a, Notify::Deferred).unwrap();
        r.pool.commit(b, Notify::Deferred).unwrap();
        assert_eq!(r.port.poll(), None);

        r.pool.flush().unwrap();
        assert_eq!(r.port.poll().unwrap().p0, codes::EVENT_SEND);
        r.pool.flush().unwrap();
        assert_eq!(r.port.poll(), None);
        assert!(r.peer.take().is_ok());
        assert!(r.peer.take().is_ok());
    }

    #[test]
    fn test_closed_pool_wakes_bounded_waiter() {
        let r = rig();
        let _held: Vec<Block> = (0..4).map(|_| r.pool.acquire(0).unwrap()).collect();
        let getter = {
            let pool = r.pool.clone();
            thread::spawn(move || {
                let start = Instant::now();
                (pool.acquire(5000), start.elapsed())
            })
        };
        wait_for_getter(&r.pool);
        r.pool.close().unwrap();
        let (result, waited) = getter.join().unwrap();
        assert_eq!(result, Err(IpcError::NotOpen));
        assert!(waited < Duration::from_secs(4));
        assert_eq!(r.pool.close(), Err(IpcError::NotOpen));
        assert_eq!(
            r.link.channels().state(POOL_CHANNEL).unwrap(),
            crate::ChannelState::Closed
        );
    }

    #[test]
    fn test_link_down_fails_pool_waiters() {
        let r = rig();
        r.link.open(channels::VBC_CTL).unwrap();
        let _held: Vec<Block> = (0..4).map(|_| r.pool.acquire(0).unwrap()).collect();
        let getter = {
            let pool = r.pool.clone();
            thread::spawn(move || pool.acquire(Timeout::Forever).map(|b| b.index()))
        };
        wait_for_getter(&r.pool);
        assert_eq!(r.link.receive(channels::VBC_CTL, 20), Err(IpcError::TimedOut));
        assert_eq!(getter.join().unwrap(), Err(IpcError::LinkDown));
    }

    #[test]
    fn test_notifier() {
        let r = rig();
        let seen = Arc::new(SpinLock::new(Vec::new()));
        {
            let seen = seen.clone();
            r.pool
                .register_notifier(move |channel: u16, event: PoolEvent| {
                    assert_eq!(channel, POOL_CHANNEL);
                    seen.lock().push(event);
                })
                .unwrap();
        }
        assert_eq!(
            r.pool.register_notifier(|_: u16, _: PoolEvent| {}),
            Err(IpcError::Busy)
        );

        let block = r.peer.acquire().unwrap();
        r.peer.commit(block).unwrap();
        let block = r.pool.acquire(0).unwrap();
        r.pool.commit(block, Notify::Immediate).unwrap();
        let block = r.peer.take().unwrap();
        r.peer.give_back(block).unwrap();
        r.link.dispatch();
        r.pool.close().unwrap();

        assert_eq!(
            *seen.lock(),
            vec![PoolEvent::RECV, PoolEvent::GET, PoolEvent::CLOSE]
        );
    }

    #[test]
    fn test_announce() {
        let r = rig();
        let responder = {
            let port = r.port.clone();
            let link = r.link.clone();
            thread::spawn(move || loop {
                match port.poll() {
                    Some(msg) if msg.command == codes::BLOCK_SEND_ADDR => {
                        assert_eq!(msg.p0, codes::BLOCK_INIT);
                        assert_eq!(msg.p1, 0x9000_0000);
                        let mut reply = msg;
                        reply.p0 = codes::BLOCK_INIT_DONE;
                        port.post(&reply).unwrap();
                        link.dispatch();
                        return;
                    },
                    _ => thread::yield_now(),
                }
            })
        };
        let reply = r.pool.announce(&CommandConfig::default()).unwrap();
        responder.join().unwrap();
        assert_eq!(reply.p0, codes::BLOCK_INIT_DONE);
        assert_eq!(reply.p2, r.pool.segment().size() as u32);
    }
}
