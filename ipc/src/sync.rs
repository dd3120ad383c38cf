//! # Synchronization Primitives
//!
//! Two lock classes and one wait queue.
//!
//! - [`SpinLock`]: never sleeps. Safe to take from the dispatch path; used
//!   for ring producers, the dispatcher's consumer side and message caches.
//! - [`SleepLock`]: may put the caller to sleep. Receivers and the command
//!   parameter buffer only; never taken by the dispatcher.
//! - [`WaitQueue`]: cooperative suspension on the parking lot. A waiter
//!   samples the wake epoch before it checks its condition and only parks
//!   while that epoch is current, so a wake between the check and the park
//!   is never lost.

use std::time::{Duration, Instant};

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

/// Non-sleeping lock
pub type SpinLock<T> = spin::Mutex<T>;

/// Guard for [`SpinLock`]
pub type SpinGuard<'a, T> = spin::MutexGuard<'a, T>;

/// Sleeping lock
///
/// Does not poison: a panic while holding it leaves plain data behind.
pub type SleepLock<T> = parking_lot::Mutex<T>;

/// Guard for [`SleepLock`]
pub type SleepGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

// ============================================================================
// TIMEOUT
// ============================================================================

/// How long a blocking operation may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Return immediately
    NoWait,
    /// Wait until the condition holds or the link goes down
    Forever,
    /// Wait at most this long
    After(Duration),
}

impl Timeout {
    /// Timeout in milliseconds
    pub const fn millis(ms: u64) -> Self {
        Self::After(Duration::from_millis(ms))
    }

    /// Whether this is [`Timeout::NoWait`]
    pub fn is_nowait(&self) -> bool {
        match self {
            Self::NoWait => true,
            Self::After(d) => d.is_zero(),
            Self::Forever => false,
        }
    }

    /// Absolute deadline, `None` for no deadline
    ///
    /// A duration too large to represent as an instant waits forever.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Self::After(d) => Instant::now().checked_add(*d),
            _ => None,
        }
    }
}

/// Millisecond convention: `0` no wait, negative forever
impl From<i32> for Timeout {
    fn from(ms: i32) -> Self {
        match ms {
            0 => Self::NoWait,
            ms if ms < 0 => Self::Forever,
            ms => Self::After(Duration::from_millis(ms as u64)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::After(d)
    }
}

// ============================================================================
// WAIT QUEUE
// ============================================================================

/// Queue of parked threads
///
/// Threads park on the queue's address. Every wake bumps an epoch; a waiter
/// only goes to sleep if the epoch it saw before checking its condition is
/// still current, so a wake racing with the check is never lost.
#[derive(Debug, Default)]
pub struct WaitQueue {
    epoch: AtomicU64,
    waiters: AtomicUsize,
}

impl WaitQueue {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            waiters: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Wake every waiter
    ///
    /// Never sleeps; callable from the dispatch path. Returns how many
    /// threads were unparked.
    pub fn wake_all(&self) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        // SAFETY: the key is this queue's address, used only by this queue.
        unsafe { parking_lot_core::unpark_all(self.key(), DEFAULT_UNPARK_TOKEN) }
    }

    /// Number of threads inside [`WaitQueue::wait_until`]
    pub fn len(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Whether nobody is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until `cond` yields a value or `timeout` expires
    ///
    /// `cond` is evaluated without any queue lock held, so it may take other
    /// locks. Returns `None` only on expiry.
    pub fn wait_until<T>(&self, timeout: Timeout, mut cond: impl FnMut() -> Option<T>) -> Option<T> {
        if let Some(value) = cond() {
            return Some(value);
        }
        if timeout.is_nowait() {
            return None;
        }
        let deadline = timeout.deadline();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let result = loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            if let Some(value) = cond() {
                break Some(value);
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                break None;
            }
            // SAFETY: the key is this queue's address; the callbacks neither
            // panic nor call back into the parking lot.
            unsafe {
                parking_lot_core::park(
                    self.key(),
                    || self.epoch.load(Ordering::SeqCst) == epoch,
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    deadline,
                );
            }
        };
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
