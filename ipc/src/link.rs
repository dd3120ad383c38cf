//! # Link
//!
//! One host/peer link: the pair of message rings in a shared segment, the
//! channel registry fed from the inbound ring, and the link-wide health
//! state every blocked caller observes.
//!
//! ## Dispatch
//!
//! [`Link::dispatch`] is the single inbound path. It runs from the doorbell
//! interrupt (or a polling thread), never sleeps, and for each pending slot
//! advances the read index before acting on the message:
//!
//! - peer-ready pattern: mark the link ready, put a ready notice addressed
//!   to each open channel into it
//! - peer fault report: take the link down (see below)
//! - anything else while not ready: dropped
//! - block pool events: routed to the pool registered on that channel
//! - everything else: cached on its channel
//!
//! ## Taking the Link Down
//!
//! A peer fault, or a receive timing out, marks the link not ready, bumps the
//! recovery generation, wakes every channel and pool waiter, runs the fault
//! handler and finally resets both ring headers. Waiters compare the
//! generation they started with against the current one and fail with
//! [`IpcError::LinkDown`].
//!
//! Lock order is always inbound ring, then outbound ring.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use helix_hal::{Doorbell, SharedSegment};

use crate::channel::{ChannelRegistry, ChannelState, Delivery};
use crate::config::LinkConfig;
use crate::error::{IpcError, IpcResult};
use crate::message::{codes, Message};
use crate::ring::{LinkLayout, MessageRing, RingHeader};
use crate::sync::{SpinLock, Timeout};

// ============================================================================
// HEALTH
// ============================================================================

/// Link-wide readiness and recovery generation
#[derive(Debug)]
pub struct LinkHealth {
    ready: AtomicBool,
    generation: AtomicU64,
}

impl LinkHealth {
    /// Create with an initial readiness
    pub fn new(ready: bool) -> Self {
        Self {
            ready: AtomicBool::new(ready),
            generation: AtomicU64::new(0),
        }
    }

    /// Whether the peer is up
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Current recovery generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Bump only if nobody else has since `expected`
    fn try_bump(&self, expected: u64) -> bool {
        self.generation
            .compare_exchange(expected, expected + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ============================================================================
// FAULTS
// ============================================================================

/// Why the link was taken down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    /// The peer reported a fault
    PeerAssert {
        /// Parameters of the report
        params: [u32; 4],
    },
    /// A receive on `channel` timed out
    Timeout {
        /// Channel whose receive expired
        channel: u16,
    },
    /// The link is being torn down locally
    Shutdown,
}

impl fmt::Display for LinkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerAssert { params } => write!(
                f,
                "peer assert [{:#x}, {:#x}, {:#x}, {:#x}]",
                params[0], params[1], params[2], params[3]
            ),
            Self::Timeout { channel } => write!(f, "receive timeout on channel {}", channel),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Called once per link fault, before the rings are reset
///
/// Runs with both ring locks held: it may inspect and copy the segment but
/// must not call back into the link.
pub trait FaultHandler: Send + Sync {
    /// Handle a fault
    fn on_fault(&self, fault: &LinkFault, segment: &SharedSegment);
}

impl<F> FaultHandler for F
where
    F: Fn(&LinkFault, &SharedSegment) + Send + Sync,
{
    fn on_fault(&self, fault: &LinkFault, segment: &SharedSegment) {
        self(fault, segment)
    }
}

/// Inbound hooks of a block pool attached to a link channel
pub(crate) trait PoolEvents: Send + Sync {
    /// A block event arrived on the pool's channel
    fn on_event(&self, msg: &Message);
    /// The link was taken down
    fn on_link_down(&self);
}

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    overwritten: AtomicU64,
    faults: AtomicU64,
    recoveries: AtomicU64,
    corrupt: AtomicU64,
}

/// Link statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Messages placed on the outbound ring
    pub sent: u64,
    /// Messages consumed from the inbound ring
    pub dispatched: u64,
    /// Inbound messages discarded (link not ready, channel not open)
    pub dropped: u64,
    /// Cached messages lost to a full channel cache
    pub overwritten: u64,
    /// Peer fault reports
    pub faults: u64,
    /// Recoveries after a receive timeout
    pub recoveries: u64,
    /// Inbound ring resets because of corrupt indices
    pub corrupt: u64,
}

// ============================================================================
// LINK
// ============================================================================

struct LinkShared {
    config: LinkConfig,
    segment: Arc<SharedSegment>,
    tx: SpinLock<MessageRing>,
    rx: SpinLock<MessageRing>,
    health: LinkHealth,
    registry: ChannelRegistry,
    doorbell: Box<dyn Doorbell>,
    fault_handler: SpinLock<Option<Arc<dyn FaultHandler>>>,
    pools: SpinLock<Vec<(u16, Weak<dyn PoolEvents>)>>,
    counters: Counters,
}

/// Host side of a link
#[derive(Clone)]
pub struct Link {
    shared: Arc<LinkShared>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.shared.config.name)
            .field("ready", &self.is_ready())
            .field("generation", &self.generation())
            .finish()
    }
}

impl Link {
    /// Format both rings in `segment` and create the link
    pub fn new(
        segment: Arc<SharedSegment>,
        doorbell: impl Doorbell + 'static,
        config: LinkConfig,
    ) -> IpcResult<Self> {
        let layout = LinkLayout::for_size(segment.size())?;
        let tx = MessageRing::format(
            segment.clone(),
            layout.tx_header,
            layout.tx_slots,
            layout.capacity,
        )?;
        let rx = MessageRing::format(
            segment.clone(),
            layout.rx_header,
            layout.rx_slots,
            layout.capacity,
        )?;
        let registry = ChannelRegistry::new(
            config.name,
            config.max_channels,
            layout.capacity as usize,
            config.close_poll_limit,
            config.close_poll_interval,
        );
        log::info!(
            "{}: link up, {} slots per direction, peer base {}",
            config.name,
            layout.capacity,
            segment.peer_base()
        );
        Ok(Self {
            shared: Arc::new(LinkShared {
                health: LinkHealth::new(config.assume_ready),
                config,
                segment,
                tx: SpinLock::new(tx),
                rx: SpinLock::new(rx),
                registry,
                doorbell: Box::new(doorbell),
                fault_handler: SpinLock::new(None),
                pools: SpinLock::new(Vec::new()),
                counters: Counters::default(),
            }),
        })
    }

    /// Link name
    pub fn name(&self) -> &'static str {
        self.shared.config.name
    }

    /// Shared segment backing the rings
    pub fn segment(&self) -> &Arc<SharedSegment> {
        &self.shared.segment
    }

    /// Slots per direction (also the channel cache depth)
    pub fn capacity(&self) -> u32 {
        self.shared.registry.depth() as u32
    }

    /// Whether the peer is up
    pub fn is_ready(&self) -> bool {
        self.shared.health.is_ready()
    }

    /// Recovery generation, bumped every time the link is taken down
    pub fn generation(&self) -> u64 {
        self.shared.health.generation()
    }

    /// Channel registry
    pub fn channels(&self) -> &ChannelRegistry {
        &self.shared.registry
    }

    /// Install the fault handler, replacing any previous one
    pub fn set_fault_handler(&self, handler: impl FaultHandler + 'static) {
        *self.shared.fault_handler.lock() = Some(Arc::new(handler));
    }

    /// Open a channel
    pub fn open(&self, channel: u16) -> IpcResult<()> {
        self.shared.registry.open(channel)
    }

    /// Close a channel
    pub fn close(&self, channel: u16) -> IpcResult<()> {
        self.shared.registry.close(channel)
    }

    /// Place a message on the outbound ring and ring the doorbell
    ///
    /// Fails with [`IpcError::Busy`] when the ring is full; never blocks.
    pub fn send(&self, msg: &Message) -> IpcResult<()> {
        match self.shared.registry.state(msg.channel)? {
            ChannelState::Open => {},
            _ => return Err(IpcError::NoLink),
        }
        {
            let mut tx = self.shared.tx.lock();
            tx.push(msg)?;
        }
        self.shared.counters.sent.fetch_add(1, Ordering::Relaxed);
        if self.shared.config.traces(msg.channel) {
            log::debug!("{}: send {:?}", self.name(), msg);
        }
        self.shared.doorbell.ring(msg.mailbox_word());
        Ok(())
    }

    /// Receive the next message on a channel
    ///
    /// A bounded wait that expires takes the whole link down: the peer is
    /// presumed hung and every other waiter fails with `LinkDown`.
    pub fn receive(&self, channel: u16, timeout: impl Into<Timeout>) -> IpcResult<Message> {
        let timeout = timeout.into();
        let generation = self.generation();
        let result = self
            .shared
            .registry
            .receive(channel, timeout, &self.shared.health);
        if result == Err(IpcError::TimedOut) {
            log::error!(
                "{}: receive on channel {} timed out, resetting link",
                self.name(),
                channel
            );
            let mut rx = self.shared.rx.lock();
            self.take_down_locked(&mut rx, LinkFault::Timeout { channel }, Some(generation));
        }
        result
    }

    /// Force the blocked receiver of `channel` to return `Interrupted`
    pub fn wake_channel(&self, channel: u16) -> IpcResult<()> {
        self.shared.registry.wake(channel)
    }

    /// Mark the link down and release every waiter
    pub fn shutdown(&self) {
        log::info!("{}: shutdown", self.name());
        let mut rx = self.shared.rx.lock();
        self.take_down_locked(&mut rx, LinkFault::Shutdown, None);
    }

    /// Drain the inbound ring
    ///
    /// Returns how many messages were consumed. Never sleeps.
    pub fn dispatch(&self) -> usize {
        let shared = &*self.shared;
        let mut rx = shared.rx.lock();

        if rx.is_corrupt() {
            log::error!(
                "{}: inbound ring corrupt (rd {} wr {} count {}), resetting",
                self.name(),
                rx.read_index(),
                rx.write_index(),
                rx.capacity()
            );
            shared.counters.corrupt.fetch_add(1, Ordering::Relaxed);
            rx.reset();
            return 0;
        }

        let mut handled = 0;
        while let Some(msg) = rx.peek() {
            rx.advance();
            handled += 1;
            shared.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            if shared.config.traces(msg.channel) {
                log::debug!("{}: dispatch {:?}", self.name(), msg);
            }

            if msg.is_peer_ready() {
                shared.health.set_ready(true);
                let notified = shared.registry.broadcast_with(Message::ready_notice);
                log::info!("{}: peer ready, {} channels notified", self.name(), notified);
                continue;
            }

            if msg.is_fault(shared.config.fault_channel, shared.config.fault_command) {
                shared.counters.faults.fetch_add(1, Ordering::Relaxed);
                let fault = LinkFault::PeerAssert {
                    params: msg.params(),
                };
                log::error!("{}: {}", self.name(), fault);
                self.take_down_locked(&mut rx, fault, None);
                break;
            }

            if !shared.health.is_ready() {
                shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("{}: peer not ready, dropping {:?}", self.name(), msg);
                continue;
            }

            if msg.command == codes::BLOCK_EVENT && self.route_to_pool(&msg) {
                continue;
            }

            match shared.registry.deliver(&msg) {
                Delivery::Cached => {},
                Delivery::Overwrote => {
                    shared.counters.overwritten.fetch_add(1, Ordering::Relaxed);
                    log::warn!("{}: channel {} cache full", self.name(), msg.channel);
                },
                Delivery::Dropped => {
                    shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    if shared.config.traces(msg.channel) {
                        log::warn!("{}: channel {} not open, dropped", self.name(), msg.channel);
                    }
                },
            }
        }
        handled
    }

    fn route_to_pool(&self, msg: &Message) -> bool {
        let pool = self
            .shared
            .pools
            .lock()
            .iter()
            .find(|(channel, _)| *channel == msg.channel)
            .and_then(|(_, pool)| pool.upgrade());
        match pool {
            Some(pool) => {
                pool.on_event(msg);
                true
            },
            None => false,
        }
    }

    /// Take the link down; the caller holds the inbound ring lock
    fn take_down_locked(&self, rx: &mut MessageRing, fault: LinkFault, expected: Option<u64>) {
        let shared = &*self.shared;
        let mut tx = shared.tx.lock();

        match expected {
            Some(generation) => {
                if !shared.health.try_bump(generation) {
                    // someone else already recovered this generation
                    return;
                }
                shared.health.set_ready(false);
            },
            None => {
                shared.health.set_ready(false);
                shared.health.bump();
            },
        }

        shared.registry.wake_all();
        let pools: Vec<_> = shared
            .pools
            .lock()
            .iter()
            .filter_map(|(_, pool)| pool.upgrade())
            .collect();
        for pool in &pools {
            pool.on_link_down();
        }

        let handler = shared.fault_handler.lock().clone();
        if let Some(handler) = handler {
            handler.on_fault(&fault, &shared.segment);
        }

        tx.reset();
        rx.reset();
        drop(tx);

        if let LinkFault::Timeout { .. } = fault {
            shared.counters.recoveries.fetch_add(1, Ordering::Relaxed);
            for &id in shared.config.timeout_channels {
                shared
                    .registry
                    .notify(id, &Message::command(id, codes::COMMUNICATION_TIMEOUT));
            }
        }
        log::warn!(
            "{}: link down ({}), generation {}",
            self.name(),
            fault,
            shared.health.generation()
        );
    }

    pub(crate) fn register_pool(&self, channel: u16, pool: Weak<dyn PoolEvents>) -> IpcResult<()> {
        let mut pools = self.shared.pools.lock();
        pools.retain(|(_, p)| p.strong_count() > 0);
        if pools.iter().any(|(c, _)| *c == channel) {
            return Err(IpcError::Busy);
        }
        pools.push((channel, pool));
        Ok(())
    }

    pub(crate) fn unregister_pool(&self, channel: u16) {
        self.shared.pools.lock().retain(|(c, _)| *c != channel);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> LinkStats {
        let c = &self.shared.counters;
        LinkStats {
            sent: c.sent.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            overwritten: c.overwritten.load(Ordering::Relaxed),
            faults: c.faults.load(Ordering::Relaxed),
            recoveries: c.recoveries.load(Ordering::Relaxed),
            corrupt: c.corrupt.load(Ordering::Relaxed),
        }
    }

    /// Ring indices and channel states, readable without taking ring locks
    pub fn report(&self) -> LinkReport {
        let layout = LinkLayout::for_size(self.shared.segment.size()).ok();
        let (tx, rx) = layout.map_or_else(Default::default, |l| {
            (
                RingHeader::load(&self.shared.segment, l.tx_header),
                RingHeader::load(&self.shared.segment, l.rx_header),
            )
        });
        let registry = &self.shared.registry;
        let channels = (0..registry.count())
            .filter_map(|id| {
                let state = registry.state(id).ok()?;
                (state != ChannelState::Closed).then(|| ChannelReport {
                    id,
                    state,
                    pending: registry.pending(id).unwrap_or(0),
                    dropped: registry.dropped(id).unwrap_or(0),
                })
            })
            .collect();
        LinkReport {
            name: self.name(),
            ready: self.is_ready(),
            generation: self.generation(),
            tx,
            rx,
            channels,
            stats: self.stats(),
        }
    }
}

// ============================================================================
// REPORT
// ============================================================================

/// Per-channel line of a [`LinkReport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelReport {
    /// Channel id
    pub id: u16,
    /// State
    pub state: ChannelState,
    /// Cached messages
    pub pending: u32,
    /// Messages dropped while closed
    pub dropped: u64,
}

/// Snapshot of a link for diagnostics
#[derive(Debug, Clone)]
pub struct LinkReport {
    /// Link name
    pub name: &'static str,
    /// Peer ready
    pub ready: bool,
    /// Recovery generation
    pub generation: u64,
    /// Outbound header
    pub tx: RingHeader,
    /// Inbound header
    pub rx: RingHeader,
    /// Channels not closed
    pub channels: Vec<ChannelReport>,
    /// Counters
    pub stats: LinkStats,
}

impl fmt::Display for LinkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: ready={} generation={}",
            self.name, self.ready, self.generation
        )?;
        for (dir, head) in [("tx", &self.tx), ("rx", &self.rx)] {
            writeln!(
                f,
                "  {}: addr={:#010x} count={} rd={} wr={}",
                dir, head.addr, head.count, head.read_index, head.write_index
            )?;
        }
        for ch in &self.channels {
            writeln!(
                f,
                "  ch{}: {} pending={} dropped={}",
                ch.id, ch.state, ch.pending, ch.dropped
            )?;
        }
        write!(
            f,
            "  sent={} dispatched={} dropped={} faults={} recoveries={}",
            self.stats.sent,
            self.stats.dispatched,
            self.stats.dropped,
            self.stats.faults,
            self.stats.recoveries
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::channels;
    use crate::peer::PeerPort;
    use core::sync::atomic::AtomicUsize;
    use std::thread;

    fn setup() -> (Link, PeerPort, Arc<AtomicUsize>) {
        let seg = Arc::new(SharedSegment::allocate(0x800, 0x8000_0000).unwrap());
        let rings = Arc::new(AtomicUsize::new(0));
        let counter = rings.clone();
        let link = Link::new(
            seg.clone(),
            move |_word: u64| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            LinkConfig::named("test"),
        )
        .unwrap();
        let peer = PeerPort::attach(seg).unwrap();
        (link, peer, rings)
    }

    fn boot(link: &Link, peer: &PeerPort) {
        peer.announce_ready().unwrap();
        link.dispatch();
        assert!(link.is_ready());
    }

    fn wait_for_receiver(link: &Link, channel: u16) {
        while link.channels().waiters(channel).unwrap() == 0 {
            thread::yield_now();
        }
    }

    #[test]
    fn test_send_until_full() {
        let (link, peer, rings) = setup();
        link.open(0).unwrap();
        let capacity = link.capacity();
        assert_eq!(capacity, 32);
        for i in 0..capacity {
            link.send(&Message::new(0, 1, i, 0, 0, 0)).unwrap();
        }
        assert_eq!(link.send(&Message::command(0, 1)), Err(IpcError::Busy));
        assert_eq!(rings.load(Ordering::SeqCst), capacity as usize);
        assert_eq!(peer.pending(), capacity);
        assert_eq!(peer.poll().unwrap().p0, 0);
        link.send(&Message::command(0, 1)).unwrap();
    }

    #[test]
    fn test_send_requires_open_channel() {
        let (link, _peer, _) = setup();
        assert_eq!(link.send(&Message::command(1, 1)), Err(IpcError::NoLink));
        assert_eq!(
            link.send(&Message::command(99, 1)),
            Err(IpcError::InvalidChannel(99))
        );
    }

    #[test]
    fn test_ready_broadcast() {
        let (link, peer, _) = setup();
        link.open(0).unwrap();
        link.open(5).unwrap();
        assert!(!link.is_ready());
        boot(&link, &peer);
        assert_eq!(
            link.receive(0, Timeout::NoWait).unwrap(),
            Message::ready_notice(0)
        );
        assert_eq!(
            link.receive(5, Timeout::NoWait).unwrap(),
            Message::ready_notice(5)
        );
    }

    #[test]
    fn test_dropped_before_ready() {
        let (link, peer, _) = setup();
        link.open(0).unwrap();
        peer.post(&Message::command(0, 3)).unwrap();
        assert_eq!(link.dispatch(), 1);
        assert_eq!(link.stats().dropped, 1);
        assert_eq!(link.receive(0, Timeout::NoWait), Err(IpcError::NoData));
    }

    #[test]
    fn test_message_echo() {
        let (link, peer, _) = setup();
        link.open(channels::VBC_CTL).unwrap();
        boot(&link, &peer);
        link.receive(channels::VBC_CTL, 0).unwrap();

        link.send(&Message::new(channels::VBC_CTL, 7, 1, 2, 3, 4)).unwrap();
        let request = peer.poll().unwrap();
        peer.post(&request).unwrap();
        link.dispatch();
        assert_eq!(
            link.receive(channels::VBC_CTL, 100).unwrap(),
            Message::new(channels::VBC_CTL, 7, 1, 2, 3, 4)
        );
    }

    #[test]
    fn test_fault_during_forever_receive() {
        let (link, peer, _) = setup();
        let faults = Arc::new(AtomicUsize::new(0));
        {
            let faults = faults.clone();
            link.set_fault_handler(move |fault: &LinkFault, _seg: &SharedSegment| {
                assert_eq!(
                    *fault,
                    LinkFault::PeerAssert {
                        params: [0xa, 0xb, 0, 0]
                    }
                );
                faults.fetch_add(1, Ordering::SeqCst);
            });
        }
        link.open(0).unwrap();
        boot(&link, &peer);
        link.receive(0, 0).unwrap();

        let receiver = {
            let link = link.clone();
            thread::spawn(move || link.receive(0, Timeout::Forever))
        };
        wait_for_receiver(&link, 0);
        peer.raise_fault([0xa, 0xb, 0, 0]).unwrap();
        link.dispatch();

        assert_eq!(receiver.join().unwrap(), Err(IpcError::LinkDown));
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert!(!link.is_ready());
        assert_eq!(link.generation(), 1);
        assert_eq!(link.stats().faults, 1);
        assert_eq!(peer.pending(), 0);
    }

    #[test]
    fn test_timeout_cascades_to_other_waiters() {
        let (link, peer, _) = setup();
        let faults = Arc::new(AtomicUsize::new(0));
        {
            let faults = faults.clone();
            link.set_fault_handler(move |fault: &LinkFault, _seg: &SharedSegment| {
                assert_eq!(*fault, LinkFault::Timeout { channel: 0 });
                faults.fetch_add(1, Ordering::SeqCst);
            });
        }
        link.open(0).unwrap();
        link.open(1).unwrap();
        link.open(channels::DSP_BTHAL).unwrap();
        boot(&link, &peer);
        link.receive(0, 0).unwrap();
        link.receive(1, 0).unwrap();
        link.receive(channels::DSP_BTHAL, 0).unwrap();

        let bystander = {
            let link = link.clone();
            thread::spawn(move || link.receive(1, Timeout::Forever))
        };
        wait_for_receiver(&link, 1);

        assert_eq!(link.receive(0, 30), Err(IpcError::TimedOut));
        assert_eq!(bystander.join().unwrap(), Err(IpcError::LinkDown));
        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert_eq!(link.stats().recoveries, 1);
        assert!(!link.is_ready());

        // only the notice channels learn about the timeout
        assert_eq!(
            link.receive(channels::DSP_BTHAL, Timeout::NoWait).unwrap(),
            Message::command(channels::DSP_BTHAL, codes::COMMUNICATION_TIMEOUT)
        );
        assert_eq!(link.receive(1, Timeout::NoWait), Err(IpcError::NoData));
        assert_eq!(link.receive(0, Timeout::NoWait), Err(IpcError::NoData));
        // and waits fail until the peer comes back
        assert_eq!(link.receive(1, Timeout::Forever), Err(IpcError::LinkDown));
        boot(&link, &peer);
        assert_eq!(
            link.receive(1, Timeout::NoWait).unwrap(),
            Message::ready_notice(1)
        );
    }

    #[test]
    fn test_huge_timeout_does_not_overflow() {
        let (link, peer, _) = setup();
        link.open(0).unwrap();
        boot(&link, &peer);
        link.receive(0, 0).unwrap();

        let receiver = {
            let link = link.clone();
            thread::spawn(move || link.receive(0, Timeout::After(std::time::Duration::MAX)))
        };
        wait_for_receiver(&link, 0);
        peer.post(&Message::new(0, 4, 9, 0, 0, 0)).unwrap();
        link.dispatch();
        assert_eq!(receiver.join().unwrap().unwrap().p0, 9);
        assert!(link.is_ready());
    }

    #[test]
    fn test_corrupt_inbound_ring_is_reset() {
        let (link, peer, _) = setup();
        boot(&link, &peer);
        // write index far beyond capacity
        link.segment().write_u32(RING_HEADER_OFFSET_RX_WRITE, 1000);
        assert_eq!(link.dispatch(), 0);
        assert_eq!(link.stats().corrupt, 1);
        peer.post(&Message::command(0, 1)).unwrap();
        assert_eq!(link.dispatch(), 1);
    }

    const RING_HEADER_OFFSET_RX_WRITE: usize = crate::ring::RING_HEADER_SIZE + 20;

    #[test]
    fn test_wake_channel() {
        let (link, peer, _) = setup();
        link.open(3).unwrap();
        boot(&link, &peer);
        link.receive(3, 0).unwrap();
        let receiver = {
            let link = link.clone();
            thread::spawn(move || link.receive(3, -1))
        };
        wait_for_receiver(&link, 3);
        link.wake_channel(3).unwrap();
        assert_eq!(receiver.join().unwrap(), Err(IpcError::Interrupted));
        assert_eq!(link.wake_channel(4), Err(IpcError::NotOpen));
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let (link, peer, _) = setup();
        link.open(0).unwrap();
        boot(&link, &peer);
        link.receive(0, 0).unwrap();
        let receiver = {
            let link = link.clone();
            thread::spawn(move || link.receive(0, Timeout::Forever))
        };
        wait_for_receiver(&link, 0);
        link.shutdown();
        assert_eq!(receiver.join().unwrap(), Err(IpcError::LinkDown));
    }

    #[test]
    fn test_report() {
        let (link, peer, _) = setup();
        link.open(0).unwrap();
        boot(&link, &peer);
        let report = link.report();
        assert!(report.ready);
        assert_eq!(report.tx.count, 32);
        assert_eq!(report.rx.read_index, 1);
        let text = report.to_string();
        assert!(text.contains("ch0: open pending=1"));
    }
}
