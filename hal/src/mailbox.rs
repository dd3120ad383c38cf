//! # Mailbox
//!
//! Out-of-band signal to the peer: a single 64-bit word written to the
//! mailbox hardware after a message has been placed in shared memory.
//!
//! ```text
//!  63        48 47        32 31                     0
//! ┌────────────┬────────────┬────────────────────────┐
//! │  command   │  channel   │          p0            │
//! └────────────┴────────────┴────────────────────────┘
//! ```

/// Packed mailbox word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxWord {
    /// Command code
    pub command: u16,
    /// Channel id
    pub channel: u16,
    /// First parameter
    pub p0: u32,
}

impl MailboxWord {
    /// Pack into the raw 64-bit value
    pub const fn pack(self) -> u64 {
        ((self.command as u64) << 48) | ((self.channel as u64) << 32) | self.p0 as u64
    }

    /// Unpack from a raw value
    pub const fn unpack(raw: u64) -> Self {
        Self {
            command: (raw >> 48) as u16,
            channel: (raw >> 32) as u16,
            p0: raw as u32,
        }
    }
}

/// Doorbell to the peer
///
/// `ring` is called from the send path after the producer lock has been
/// released. It must not block.
pub trait Doorbell: Send + Sync {
    /// Signal the peer with a packed mailbox word
    fn ring(&self, word: u64);
}

impl<F> Doorbell for F
where
    F: Fn(u64) + Send + Sync,
{
    fn ring(&self, word: u64) {
        self(word)
    }
}

/// Doorbell that does nothing (polled peers, loopback)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDoorbell;

impl Doorbell for NullDoorbell {
    fn ring(&self, _word: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_pack_layout() {
        let word = MailboxWord {
            command: 0x25,
            channel: 2,
            p0: 0xabcd_0123,
        };
        assert_eq!(word.pack(), 0x0025_0002_abcd_0123);
        assert_eq!(MailboxWord::unpack(word.pack()), word);
    }

    #[test]
    fn test_closure_doorbell() {
        let last = AtomicU64::new(0);
        let bell = |w: u64| last.store(w, Ordering::SeqCst);
        bell.ring(42);
        assert_eq!(last.load(Ordering::SeqCst), 42);
        NullDoorbell.ring(1);
    }
}
