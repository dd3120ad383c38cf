//! # Peer Port
//!
//! The remote side's view of a link segment: it produces into the host's
//! inbound ring and consumes the host's outbound ring. Used for loopback
//! bring-up and by the test suites to play the co-processor.

use std::sync::Arc;

use helix_hal::SharedSegment;

use crate::error::IpcResult;
use crate::message::{channels, codes, Message};
use crate::ring::{MessageRing, RING_HEADER_SIZE};
use crate::sync::SpinLock;

#[derive(Debug)]
struct PeerInner {
    outbound: SpinLock<MessageRing>,
    inbound: SpinLock<MessageRing>,
}

/// Remote end of a link
#[derive(Debug, Clone)]
pub struct PeerPort {
    inner: Arc<PeerInner>,
}

impl PeerPort {
    /// Attach to a segment the host has already formatted
    pub fn attach(segment: Arc<SharedSegment>) -> IpcResult<Self> {
        let inbound = MessageRing::attach(segment.clone(), 0)?;
        let outbound = MessageRing::attach(segment, RING_HEADER_SIZE)?;
        Ok(Self {
            inner: Arc::new(PeerInner {
                outbound: SpinLock::new(outbound),
                inbound: SpinLock::new(inbound),
            }),
        })
    }

    /// Send a message to the host
    pub fn post(&self, msg: &Message) -> IpcResult<()> {
        self.inner.outbound.lock().push(msg)
    }

    /// Next message from the host, if any
    pub fn poll(&self) -> Option<Message> {
        self.inner.inbound.lock().pop()
    }

    /// Messages from the host not yet consumed
    pub fn pending(&self) -> u32 {
        self.inner.inbound.lock().pending()
    }

    /// Send the boot-complete message
    pub fn announce_ready(&self) -> IpcResult<()> {
        self.post(&Message::peer_ready())
    }

    /// Report a fault on the assert channel
    pub fn raise_fault(&self, params: [u32; 4]) -> IpcResult<()> {
        self.post(&Message::new(
            channels::DSP_ASSERT_CTL,
            codes::PEER_ASSERT,
            params[0],
            params[1],
            params[2],
            params[3],
        ))
    }

    /// Tell the host blocks arrived (`EVENT_SEND`) or were freed
    /// (`EVENT_RELEASE`) on a pool channel
    pub fn block_event(&self, channel: u16, event: u32) -> IpcResult<()> {
        self.post(&Message::new(channel, codes::BLOCK_EVENT, event, 0, 0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::link::Link;
    use crate::sync::Timeout;

    #[test]
    fn test_attach_needs_formatted_segment() {
        let seg = Arc::new(SharedSegment::allocate(0x400, 0).unwrap());
        assert!(PeerPort::attach(seg).is_err());
    }

    #[test]
    fn test_both_directions() {
        let seg = Arc::new(SharedSegment::allocate(0x400, 0x1000).unwrap());
        let link = Link::new(seg.clone(), |_: u64| {}, LinkConfig::default()).unwrap();
        let peer = PeerPort::attach(seg).unwrap();
        link.open(channels::DVFS).unwrap();

        peer.announce_ready().unwrap();
        peer.post(&Message::new(channels::DVFS, 1, 2, 0, 0, 0)).unwrap();
        assert_eq!(link.dispatch(), 2);
        assert_eq!(
            link.receive(channels::DVFS, Timeout::NoWait).unwrap(),
            Message::ready_notice(channels::DVFS)
        );
        assert_eq!(link.receive(channels::DVFS, Timeout::NoWait).unwrap().p0, 2);

        link.send(&Message::command(channels::DVFS, 4)).unwrap();
        assert_eq!(peer.pending(), 1);
        assert_eq!(peer.poll(), Some(Message::command(channels::DVFS, 4)));
        assert_eq!(peer.poll(), None);
    }

    #[test]
    fn test_block_event_shape() {
        let seg = Arc::new(SharedSegment::allocate(0x400, 0).unwrap());
        let link = Link::new(seg.clone(), |_: u64| {}, LinkConfig::default()).unwrap();
        let peer = PeerPort::attach(seg.clone()).unwrap();
        peer.block_event(5, codes::EVENT_RELEASE).unwrap();
        let rx = MessageRing::attach(seg, RING_HEADER_SIZE).unwrap();
        assert_eq!(
            rx.peek(),
            Some(Message::new(5, codes::BLOCK_EVENT, codes::EVENT_RELEASE, 0, 0, 0))
        );
        drop(link);
    }
}
