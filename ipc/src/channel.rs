//! # Channel Registry
//!
//! Demultiplexes inbound messages by channel id into per-channel caches and
//! hands them to blocked receivers.
//!
//! ## Lifecycle
//!
//! ```text
//! Closed ──open──▶ Opening ──▶ Open ──close──▶ Closing ──drained──▶ Closed
//! ```
//!
//! Every receive and every delivery holds the channel's busy counter for its
//! whole duration. `close` flips the state first (so no new work starts),
//! then wakes waiters and polls the counter down to zero before freeing the
//! channel. If the counter never drains, the channel is parked in an orphan
//! list instead of being freed under a reader. The counter belongs to the
//! channel, not the id, so a reopened id starts clean.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{IpcError, IpcResult};
use crate::link::LinkHealth;
use crate::message::Message;
use crate::sync::{SleepLock, SpinLock, Timeout, WaitQueue};

// ============================================================================
// CHANNEL STATE
// ============================================================================

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Not in use
    Closed = 0,
    /// Being set up
    Opening = 1,
    /// Accepting messages
    Open = 2,
    /// Draining in-flight users
    Closing = 3,
}

impl ChannelState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Opening,
            2 => Self::Open,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Result of handing a message to a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Cached for a receiver
    Cached,
    /// Cached, but the cache was full and the oldest message was lost
    Overwrote,
    /// Channel not open; message discarded
    Dropped,
}

// ============================================================================
// MESSAGE CACHE
// ============================================================================

/// Bounded FIFO with its own free-running indices
#[derive(Debug)]
struct MessageCache {
    slots: Box<[Message]>,
    read: u32,
    write: u32,
}

impl MessageCache {
    fn new(depth: usize) -> Self {
        Self {
            slots: vec![Message::default(); depth].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    fn len(&self) -> u32 {
        self.write.wrapping_sub(self.read)
    }

    /// Push, dropping the oldest entry when full. Returns whether one was lost.
    fn push(&mut self, msg: Message) -> bool {
        let depth = self.slots.len() as u32;
        let overwrote = self.len() >= depth;
        if overwrote {
            self.read = self.read.wrapping_add(1);
        }
        self.slots[(self.write % depth) as usize] = msg;
        self.write = self.write.wrapping_add(1);
        overwrote
    }

    fn peek(&self) -> Option<Message> {
        (self.read != self.write).then(|| self.slots[(self.read % self.slots.len() as u32) as usize])
    }

    fn pop(&mut self) -> Option<Message> {
        let msg = self.peek()?;
        self.read = self.read.wrapping_add(1);
        Some(msg)
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

/// Per-channel receive state
#[derive(Debug)]
pub(crate) struct Channel {
    id: u16,
    cache: SpinLock<MessageCache>,
    rx_lock: SleepLock<()>,
    waiters: WaitQueue,
    wakeup: AtomicBool,
    busy: AtomicU32,
}

impl Channel {
    fn new(id: u16, depth: usize) -> Self {
        Self {
            id,
            cache: SpinLock::new(MessageCache::new(depth)),
            rx_lock: SleepLock::new(()),
            waiters: WaitQueue::new(),
            wakeup: AtomicBool::new(false),
            busy: AtomicU32::new(0),
        }
    }

    fn pop(&self) -> Option<Message> {
        self.cache.lock().pop()
    }
}

#[derive(Debug)]
struct ChannelSlot {
    state: AtomicU8,
    channel: SpinLock<Option<Arc<Channel>>>,
    dropped: AtomicU64,
}

impl ChannelSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Closed as u8),
            channel: SpinLock::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().clone()
    }

    /// Whether `ch` is the channel currently open on this slot
    fn is_open_with(&self, ch: &Arc<Channel>) -> bool {
        self.state() == ChannelState::Open
            && self
                .channel
                .lock()
                .as_ref()
                .map_or(false, |cur| Arc::ptr_eq(cur, ch))
    }
}

/// Busy counter held for the duration of a receive or delivery
struct BusyGuard<'a>(&'a AtomicU32);

impl<'a> BusyGuard<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Clears the wake-up request on every receive exit
struct WakeupReset<'a>(&'a AtomicBool);

impl Drop for WakeupReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Channel registry of one link
#[derive(Debug)]
pub struct ChannelRegistry {
    name: &'static str,
    slots: Box<[ChannelSlot]>,
    depth: usize,
    poll_limit: u32,
    poll_interval: Duration,
    orphans: SpinLock<Vec<Arc<Channel>>>,
}

impl ChannelRegistry {
    /// Create a registry of `count` channels with caches of `depth` messages
    pub fn new(
        name: &'static str,
        count: u16,
        depth: usize,
        poll_limit: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name,
            slots: (0..count).map(|_| ChannelSlot::new()).collect(),
            depth: depth.max(1),
            poll_limit,
            poll_interval,
            orphans: SpinLock::new(Vec::new()),
        }
    }

    fn slot(&self, id: u16) -> IpcResult<&ChannelSlot> {
        self.slots
            .get(id as usize)
            .ok_or(IpcError::InvalidChannel(id))
    }

    /// Number of channel ids
    pub fn count(&self) -> u16 {
        self.slots.len() as u16
    }

    /// Cache depth per channel
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Current state of a channel
    pub fn state(&self, id: u16) -> IpcResult<ChannelState> {
        Ok(self.slot(id)?.state())
    }

    /// Messages discarded because the channel was not open
    pub fn dropped(&self, id: u16) -> IpcResult<u64> {
        Ok(self.slot(id)?.dropped.load(Ordering::Relaxed))
    }

    /// Cached messages waiting on a channel
    pub fn pending(&self, id: u16) -> IpcResult<u32> {
        Ok(self
            .slot(id)?
            .channel()
            .map_or(0, |ch| ch.cache.lock().len()))
    }

    /// Receivers parked on a channel
    pub fn waiters(&self, id: u16) -> IpcResult<usize> {
        Ok(self.slot(id)?.channel().map_or(0, |ch| ch.waiters.len()))
    }

    /// Channels leaked because close could not drain them
    pub fn orphans(&self) -> usize {
        self.orphans.lock().len()
    }

    /// Open a channel
    pub fn open(&self, id: u16) -> IpcResult<()> {
        let slot = self.slot(id)?;
        slot.state
            .compare_exchange(
                ChannelState::Closed as u8,
                ChannelState::Opening as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| IpcError::AlreadyOpen)?;
        *slot.channel.lock() = Some(Arc::new(Channel::new(id, self.depth)));
        slot.set_state(ChannelState::Open);
        log::debug!("{}: channel {} open", self.name, id);
        Ok(())
    }

    /// Close a channel, waiting a bounded time for in-flight users
    ///
    /// The state is `Closed` on return even when the drain gave up; in that
    /// case the channel memory is parked rather than freed.
    pub fn close(&self, id: u16) -> IpcResult<()> {
        let slot = self.slot(id)?;
        if let Err(raw) = slot.state.compare_exchange(
            ChannelState::Open as u8,
            ChannelState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match ChannelState::from_raw(raw) {
                ChannelState::Closed => IpcError::NotOpen,
                _ => IpcError::Busy,
            });
        }

        let channel = slot.channel();
        let mut polls = 0;
        let drained = loop {
            let Some(ch) = &channel else {
                break true;
            };
            if ch.busy.load(Ordering::Acquire) == 0 {
                break true;
            }
            ch.waiters.wake_all();
            if polls >= self.poll_limit {
                break false;
            }
            polls += 1;
            thread::sleep(self.poll_interval);
        };
        drop(channel);

        let taken = slot.channel.lock().take();
        let mut orphans = self.orphans.lock();
        orphans.retain(|ch| Arc::strong_count(ch) > 1 || ch.busy.load(Ordering::Acquire) > 0);
        if let (false, Some(ch)) = (drained, taken) {
            log::error!(
                "{}: channel {} still busy ({}) after {} polls, leaking it",
                self.name,
                id,
                ch.busy.load(Ordering::Acquire),
                polls
            );
            orphans.push(ch);
        }
        drop(orphans);
        slot.set_state(ChannelState::Closed);
        log::debug!("{}: channel {} closed", self.name, id);
        Ok(())
    }

    /// Hand an inbound message to its channel
    ///
    /// Never blocks; called from the dispatch path.
    pub(crate) fn deliver(&self, msg: &Message) -> Delivery {
        self.deliver_to(msg.channel, msg)
    }

    fn deliver_to(&self, id: u16, msg: &Message) -> Delivery {
        let Ok(slot) = self.slot(id) else {
            return Delivery::Dropped;
        };
        let Some(channel) = slot.channel() else {
            slot.dropped.fetch_add(1, Ordering::Relaxed);
            return Delivery::Dropped;
        };
        let _busy = BusyGuard::enter(&channel.busy);
        if !slot.is_open_with(&channel) {
            slot.dropped.fetch_add(1, Ordering::Relaxed);
            return Delivery::Dropped;
        }
        let overwrote = channel.cache.lock().push(*msg);
        channel.waiters.wake_all();
        if overwrote {
            Delivery::Overwrote
        } else {
            Delivery::Cached
        }
    }

    /// Discard stale replies to `command` from the head of a channel's cache
    ///
    /// Ready notices at the head go too. Stops at the first other message,
    /// which stays cached. Returns how many were discarded.
    pub fn discard_stale(&self, id: u16, command: u16) -> IpcResult<u32> {
        let slot = self.slot(id)?;
        let channel = slot.channel().ok_or(IpcError::NoLink)?;
        let _busy = BusyGuard::enter(&channel.busy);
        if !slot.is_open_with(&channel) {
            return Err(IpcError::NoLink);
        }
        let mut cache = channel.cache.lock();
        let mut discarded = 0;
        while let Some(msg) = cache.peek() {
            if !msg.matches(id, command) && !msg.is_ready_notice() {
                break;
            }
            cache.pop();
            discarded += 1;
        }
        Ok(discarded)
    }

    /// Put a message into `id` if it is open; never counts a drop
    pub(crate) fn notify(&self, id: u16, msg: &Message) -> bool {
        match self.slot(id) {
            Ok(slot) if slot.state() == ChannelState::Open => {
                self.deliver_to(id, msg) != Delivery::Dropped
            },
            _ => false,
        }
    }

    /// Put a per-channel message into every open channel
    pub(crate) fn broadcast_with(&self, make: impl Fn(u16) -> Message) -> usize {
        (0..self.count())
            .filter(|&id| self.slots[id as usize].state() == ChannelState::Open)
            .filter(|&id| self.deliver_to(id, &make(id)) != Delivery::Dropped)
            .count()
    }

    /// Receive one message
    pub(crate) fn receive(
        &self,
        id: u16,
        timeout: Timeout,
        health: &LinkHealth,
    ) -> IpcResult<Message> {
        let slot = self.slot(id)?;
        let channel = slot.channel().ok_or(IpcError::NoLink)?;
        let _busy = BusyGuard::enter(&channel.busy);
        if !slot.is_open_with(&channel) {
            return Err(IpcError::NoLink);
        }

        let _rx = if timeout.is_nowait() {
            channel.rx_lock.try_lock().ok_or(IpcError::Busy)?
        } else {
            channel.rx_lock.lock()
        };
        let _reset = WakeupReset(&channel.wakeup);

        if let Some(msg) = channel.pop() {
            return Ok(msg);
        }
        if timeout.is_nowait() {
            return Err(IpcError::NoData);
        }

        let generation = health.generation();
        channel
            .waiters
            .wait_until(timeout, || {
                if !slot.is_open_with(&channel) {
                    return Some(Err(IpcError::NotOpen));
                }
                if health.generation() != generation {
                    return Some(Err(IpcError::LinkDown));
                }
                if let Some(msg) = channel.pop() {
                    return Some(Ok(msg));
                }
                if !health.is_ready() {
                    return Some(Err(IpcError::LinkDown));
                }
                if channel.wakeup.load(Ordering::Acquire) {
                    log::debug!("{}: channel {} receive interrupted", self.name, channel.id);
                    return Some(Err(IpcError::Interrupted));
                }
                None
            })
            .unwrap_or(Err(IpcError::TimedOut))
    }

    /// Force the blocked receiver of a channel to return
    pub fn wake(&self, id: u16) -> IpcResult<()> {
        let slot = self.slot(id)?;
        match (slot.state(), slot.channel()) {
            (ChannelState::Open, Some(ch)) => {
                ch.wakeup.store(true, Ordering::Release);
                ch.waiters.wake_all();
                Ok(())
            },
            _ => Err(IpcError::NotOpen),
        }
    }

    /// Wake every waiter on every channel
    pub(crate) fn wake_all(&self) {
        for slot in self.slots.iter() {
            if let Some(ch) = slot.channel() {
                ch.waiters.wake_all();
            }
        }
    }

    #[cfg(test)]
    fn busy(&self, id: u16) -> u32 {
        self.slots[id as usize]
            .channel()
            .map_or(0, |ch| ch.busy.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new("test", 4, 4, 100, Duration::from_millis(1))
    }

    fn ready() -> LinkHealth {
        let health = LinkHealth::new(false);
        health.set_ready(true);
        health
    }

    #[test]
    fn test_open_twice() {
        let reg = registry();
        reg.open(1).unwrap();
        assert_eq!(reg.open(1), Err(IpcError::AlreadyOpen));
        assert_eq!(reg.state(1).unwrap(), ChannelState::Open);
        assert_eq!(reg.open(9), Err(IpcError::InvalidChannel(9)));
    }

    #[test]
    fn test_close_states() {
        let reg = registry();
        assert_eq!(reg.close(0), Err(IpcError::NotOpen));
        reg.open(0).unwrap();
        reg.close(0).unwrap();
        assert_eq!(reg.state(0).unwrap(), ChannelState::Closed);
        reg.open(0).unwrap();
    }

    #[test]
    fn test_receive_nowait_empty() {
        let reg = registry();
        let health = ready();
        reg.open(2).unwrap();
        assert_eq!(
            reg.receive(2, Timeout::NoWait, &health),
            Err(IpcError::NoData)
        );
        assert_eq!(reg.busy(2), 0);
    }

    #[test]
    fn test_receive_unopened() {
        let reg = registry();
        let health = ready();
        assert_eq!(
            reg.receive(3, Timeout::NoWait, &health),
            Err(IpcError::NoLink)
        );
    }

    #[test]
    fn test_deliver_fifo_and_overwrite() {
        let reg = registry();
        let health = ready();
        reg.open(1).unwrap();
        for i in 0..5 {
            let expect = if i < 4 {
                Delivery::Cached
            } else {
                Delivery::Overwrote
            };
            assert_eq!(reg.deliver(&Message::new(1, 9, i, 0, 0, 0)), expect);
        }
        // depth 4: message 0 was overwritten
        for i in 1..5 {
            assert_eq!(reg.receive(1, Timeout::NoWait, &health).unwrap().p0, i);
        }
    }

    #[test]
    fn test_deliver_to_closed_is_counted() {
        let reg = registry();
        assert_eq!(reg.deliver(&Message::command(0, 1)), Delivery::Dropped);
        assert_eq!(reg.dropped(0).unwrap(), 1);
        assert_eq!(reg.deliver(&Message::command(40, 1)), Delivery::Dropped);
    }

    #[test]
    fn test_receive_nowait_while_other_receiver_waits() {
        let reg = Arc::new(registry());
        let health = Arc::new(ready());
        reg.open(0).unwrap();

        let blocked = {
            let reg = reg.clone();
            let health = health.clone();
            thread::spawn(move || reg.receive(0, Timeout::Forever, &health))
        };
        while reg.slot(0).unwrap().channel().unwrap().waiters.is_empty() {
            thread::yield_now();
        }
        assert_eq!(
            reg.receive(0, Timeout::NoWait, &health),
            Err(IpcError::Busy)
        );
        reg.deliver(&Message::new(0, 3, 42, 0, 0, 0));
        assert_eq!(blocked.join().unwrap().unwrap().p0, 42);
    }

    #[test]
    fn test_timed_receive_expires() {
        let reg = registry();
        let health = ready();
        reg.open(0).unwrap();
        let start = Instant::now();
        assert_eq!(
            reg.receive(0, Timeout::millis(20), &health),
            Err(IpcError::TimedOut)
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wake_interrupts_receiver() {
        let reg = Arc::new(registry());
        let health = Arc::new(ready());
        reg.open(1).unwrap();
        let blocked = {
            let reg = reg.clone();
            let health = health.clone();
            thread::spawn(move || reg.receive(1, Timeout::Forever, &health))
        };
        while reg.slot(1).unwrap().channel().unwrap().waiters.is_empty() {
            thread::yield_now();
        }
        reg.wake(1).unwrap();
        assert_eq!(blocked.join().unwrap(), Err(IpcError::Interrupted));
        // the request does not outlive the receive it interrupted
        reg.deliver(&Message::command(1, 5));
        assert!(reg.receive(1, Timeout::NoWait, &health).is_ok());
    }

    #[test]
    fn test_forever_receive_on_link_not_ready() {
        let reg = registry();
        let health = LinkHealth::new(false);
        reg.open(0).unwrap();
        assert_eq!(
            reg.receive(0, Timeout::Forever, &health),
            Err(IpcError::LinkDown)
        );
    }

    #[test]
    fn test_close_waits_for_receiver() {
        let reg = Arc::new(registry());
        let health = Arc::new(ready());
        reg.open(2).unwrap();

        let receiver = {
            let reg = reg.clone();
            let health = health.clone();
            thread::spawn(move || reg.receive(2, Timeout::Forever, &health))
        };
        while reg.slot(2).unwrap().channel().unwrap().waiters.is_empty() {
            thread::yield_now();
        }
        assert_eq!(reg.busy(2), 1);
        reg.close(2).unwrap();
        assert_eq!(reg.busy(2), 0);
        assert_eq!(reg.state(2).unwrap(), ChannelState::Closed);
        assert_eq!(reg.orphans(), 0);
        assert_eq!(receiver.join().unwrap(), Err(IpcError::NotOpen));
    }

    #[test]
    fn test_close_leaks_when_never_drained() {
        let reg = ChannelRegistry::new("test", 2, 4, 3, Duration::from_millis(1));
        reg.open(1).unwrap();
        let wedged = reg.slots[1].channel().unwrap();
        let stuck = BusyGuard::enter(&wedged.busy);
        reg.close(1).unwrap();
        assert_eq!(reg.state(1).unwrap(), ChannelState::Closed);
        assert_eq!(reg.orphans(), 1);

        // the reopened id does not inherit the stuck reader
        reg.open(1).unwrap();
        assert_eq!(reg.busy(1), 0);
        reg.close(1).unwrap();
        assert_eq!(reg.orphans(), 1);

        // once the reader is gone the orphan is released on the next close
        drop(stuck);
        drop(wedged);
        reg.open(1).unwrap();
        reg.close(1).unwrap();
        assert_eq!(reg.orphans(), 0);
    }

    #[test]
    fn test_discard_stale_stops_at_other_traffic() {
        let reg = registry();
        let health = ready();
        reg.open(1).unwrap();
        reg.deliver(&Message::ready_notice(1));
        reg.deliver(&Message::new(1, 7, 0, 0, 0, 1));
        reg.deliver(&Message::command(1, 0x50));
        reg.deliver(&Message::new(1, 7, 0, 0, 0, 2));

        assert_eq!(reg.discard_stale(1, 7).unwrap(), 2);
        assert_eq!(reg.pending(1).unwrap(), 2);
        assert_eq!(
            reg.receive(1, Timeout::NoWait, &health).unwrap(),
            Message::command(1, 0x50)
        );
        assert_eq!(reg.discard_stale(1, 7).unwrap(), 1);
        assert_eq!(reg.pending(1).unwrap(), 0);
        assert_eq!(reg.discard_stale(2, 7), Err(IpcError::NoLink));
    }

    #[test]
    fn test_notify_skips_closed_channels() {
        let reg = registry();
        reg.open(0).unwrap();
        assert!(reg.notify(0, &Message::command(0, 0x26)));
        assert!(!reg.notify(1, &Message::command(1, 0x26)));
        assert!(!reg.notify(30, &Message::command(30, 0x26)));
        assert_eq!(reg.dropped(1).unwrap(), 0);
        assert_eq!(reg.pending(0).unwrap(), 1);
    }

    #[test]
    fn test_broadcast_reaches_open_channels() {
        let reg = registry();
        let health = ready();
        reg.open(0).unwrap();
        reg.open(3).unwrap();
        assert_eq!(reg.broadcast_with(Message::ready_notice), 2);
        assert_eq!(
            reg.receive(0, Timeout::NoWait, &health).unwrap(),
            Message::ready_notice(0)
        );
        assert_eq!(
            reg.receive(3, Timeout::NoWait, &health).unwrap(),
            Message::ready_notice(3)
        );
    }
}
