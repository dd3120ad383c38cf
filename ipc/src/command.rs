//! # Command Protocol
//!
//! Request/response on top of a link. A call serializes on the parameter
//! buffer, copies the request into it, discards stale replies cached on the
//! channel, sends `{id, tag, parameter buffer address, 0}` and waits for a
//! message with the same channel and command. The peer answers in place,
//! so the response is copied back out of the same buffer.
//!
//! A reply wait is an ordinary message receive: when it expires the peer is
//! presumed hung and the link goes down, so the remaining attempts fail fast
//! with `LinkDown`. Mismatched replies are retried up to
//! [`CommandConfig::attempts`] times.
//!
//! Larger payloads go through parameter regions: shared segments registered
//! per kind and described to the peer with a [`RegionDescriptor`].

use core::mem::size_of;
use std::sync::Arc;

use helix_hal::SharedSegment;

use crate::config::CommandConfig;
use crate::error::{IpcError, IpcResult};
use crate::link::Link;
use crate::message::{channels, Message};
use crate::sync::{SleepLock, SpinLock, Timeout};

/// Size of a [`RegionDescriptor`]
pub const REGION_DESCRIPTOR_SIZE: usize = 16;

/// Length of each separator run in a dump
pub const DUMP_PAD_BYTES: usize = 16;

/// Separator after the link segment
pub const DUMP_PAD_LINK: u8 = 0x5a;
/// Separator after the parameter buffer
pub const DUMP_PAD_PARAMS: u8 = 0x5b;
/// Separator after the regions
pub const DUMP_PAD_REGIONS: u8 = 0x5c;

static_assertions::const_assert_eq!(size_of::<RegionDescriptor>(), REGION_DESCRIPTOR_SIZE);

// ============================================================================
// EXCHANGE
// ============================================================================

/// Drop replies to `command` left over from earlier, abandoned calls
fn drain_stale(link: &Link, channel: u16, command: u16) -> IpcResult<u32> {
    let stale = link.channels().discard_stale(channel, command)?;
    if stale > 0 {
        log::debug!(
            "{}: channel {} discarded {} stale replies",
            link.name(),
            channel,
            stale
        );
    }
    Ok(stale)
}

/// Wait for the reply to `(channel, command)`
fn recv_reply(
    link: &Link,
    channel: u16,
    command: u16,
    timeout: Timeout,
) -> IpcResult<Message> {
    let msg = link.receive(channel, timeout)?;
    if msg.matches(channel, command) {
        Ok(msg)
    } else {
        Err(IpcError::Mismatch {
            expected: (channel, command),
            got: (msg.channel, msg.command),
        })
    }
}

/// Send `request` and wait for its reply
///
/// Timeouts and mismatched replies are retried; anything else ends the
/// exchange at once. A timeout takes the link down, so the retry after one
/// reports `LinkDown`.
pub(crate) fn exchange(
    link: &Link,
    request: &Message,
    attempts: u32,
    timeout: Timeout,
) -> IpcResult<Message> {
    let (channel, command) = (request.channel, request.command);
    drain_stale(link, channel, command)?;
    link.send(request)?;

    let mut last = IpcError::TimedOut;
    for attempt in 1..=attempts.max(1) {
        match recv_reply(link, channel, command, timeout) {
            Ok(reply) => return Ok(reply),
            Err(e @ (IpcError::TimedOut | IpcError::Mismatch { .. })) => {
                log::warn!(
                    "{}: channel {} command {:#x} attempt {}: {}",
                    link.name(),
                    channel,
                    command,
                    attempt,
                    e
                );
                last = e;
            },
            Err(e) => return Err(e),
        }
    }
    log::error!(
        "{}: channel {} command {:#x} got no reply: {}",
        link.name(),
        channel,
        command,
        last
    );
    Err(last)
}

// ============================================================================
// REGIONS
// ============================================================================

/// Description of a parameter region, sent through the parameter buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct RegionDescriptor {
    /// Caller id
    pub id: u32,
    /// Region kind
    pub kind: u32,
    /// Peer address of the region
    pub peer_addr: u32,
    /// Bytes of interest
    pub size: u32,
}

impl RegionDescriptor {
    /// Little-endian wire bytes
    pub fn to_bytes(&self) -> [u8; REGION_DESCRIPTOR_SIZE] {
        let mut raw = [0u8; REGION_DESCRIPTOR_SIZE];
        for (i, word) in [self.id, self.kind, self.peer_addr, self.size].iter().enumerate() {
            raw[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        raw
    }

    /// Parse wire bytes
    pub fn from_bytes(raw: &[u8; REGION_DESCRIPTOR_SIZE]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]])
        };
        Self {
            id: word(0),
            kind: word(1),
            peer_addr: word(2),
            size: word(3),
        }
    }
}

#[derive(Debug, Clone)]
struct ParamRegion {
    kind: u32,
    segment: Arc<SharedSegment>,
}

// ============================================================================
// CLIENT
// ============================================================================

/// Command client of one link
#[derive(Debug)]
pub struct CommandClient {
    link: Link,
    config: CommandConfig,
    params: Arc<SharedSegment>,
    call_lock: SleepLock<()>,
    regions: SpinLock<Vec<ParamRegion>>,
    region_lock: SleepLock<()>,
}

impl CommandClient {
    /// Create a client using `params` as the parameter buffer
    pub fn new(link: Link, params: Arc<SharedSegment>, config: CommandConfig) -> Self {
        Self {
            link,
            config,
            params,
            call_lock: SleepLock::new(()),
            regions: SpinLock::new(Vec::new()),
            region_lock: SleepLock::new(()),
        }
    }

    /// Underlying link
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Parameter buffer size
    pub fn param_capacity(&self) -> usize {
        self.params.size()
    }

    /// Call with a parameter buffer payload
    ///
    /// `request` is copied in before sending; `response.len()` bytes are
    /// copied back once the reply arrived. Returns the reply message.
    pub fn call(
        &self,
        channel: u16,
        command: u16,
        id: u32,
        tag: u32,
        request: &[u8],
        response: &mut [u8],
        timeout: impl Into<Timeout>,
    ) -> IpcResult<Message> {
        let max = self.params.size();
        for len in [request.len(), response.len()] {
            if len > max {
                return Err(IpcError::TooLarge { len, max });
            }
        }

        let _guard = self.call_lock.lock();
        self.params.write_bytes(0, request);
        let msg = Message::new(
            channel,
            command,
            id,
            tag,
            self.params.peer_base().as_u32(),
            0,
        );
        let reply = exchange(&self.link, &msg, self.config.attempts, timeout.into())?;
        self.params.read_bytes(0, response);
        Ok(reply)
    }

    /// Call without touching the parameter buffer
    pub fn call_short(&self, request: &Message, timeout: impl Into<Timeout>) -> IpcResult<Message> {
        exchange(&self.link, request, self.config.attempts, timeout.into())
    }

    /// Call with the configured default reply timeout
    pub fn call_default(&self, request: &Message) -> IpcResult<Message> {
        self.call_short(request, self.config.reply_timeout)
    }

    /// Send without waiting for a reply
    pub fn post(&self, msg: &Message) -> IpcResult<()> {
        self.link.send(msg)
    }

    /// Send on the channel the peer never answers on
    pub fn post_noreply(&self, command: u16, params: [u32; 4]) -> IpcResult<()> {
        let [p0, p1, p2, p3] = params;
        self.post(&Message::new(
            channels::DSP_GET_PARAM_NOREPLY,
            command,
            p0,
            p1,
            p2,
            p3,
        ))
    }

    /// Wait for one message on `channel`; it must carry `command`
    pub fn recv_reply(
        &self,
        channel: u16,
        command: u16,
        timeout: impl Into<Timeout>,
    ) -> IpcResult<Message> {
        recv_reply(&self.link, channel, command, timeout.into())
    }

    /// Register the region used for `kind`
    pub fn register_region(&self, kind: u32, segment: Arc<SharedSegment>) -> IpcResult<()> {
        let mut regions = self.regions.lock();
        if regions.iter().any(|r| r.kind == kind) {
            return Err(IpcError::Busy);
        }
        log::debug!(
            "{}: region kind {} at {} ({} bytes)",
            self.link.name(),
            kind,
            segment.peer_base(),
            segment.size()
        );
        regions.push(ParamRegion { kind, segment });
        Ok(())
    }

    fn region(&self, kind: u32) -> IpcResult<ParamRegion> {
        self.regions
            .lock()
            .iter()
            .find(|r| r.kind == kind)
            .cloned()
            .ok_or(IpcError::NotFound)
    }

    /// Copy `data` into the `kind` region and describe it to the peer
    pub fn send_region(
        &self,
        channel: u16,
        command: u16,
        id: u32,
        tag: u32,
        kind: u32,
        data: &[u8],
        timeout: impl Into<Timeout>,
    ) -> IpcResult<Message> {
        let region = self.region(kind)?;
        let max = region.segment.size();
        if data.len() > max {
            return Err(IpcError::TooLarge {
                len: data.len(),
                max,
            });
        }
        let _guard = self.region_lock.lock();
        region.segment.write_bytes(0, data);
        let desc = RegionDescriptor {
            id,
            kind,
            peer_addr: region.segment.peer_base().as_u32(),
            size: data.len() as u32,
        };
        self.call(channel, command, id, tag, &desc.to_bytes(), &mut [], timeout)
    }

    /// Ask the peer to fill the `kind` region and copy it into `buf`
    ///
    /// Returns the number of bytes copied (the region size).
    pub fn fetch_region(
        &self,
        channel: u16,
        command: u16,
        id: u32,
        tag: u32,
        kind: u32,
        buf: &mut [u8],
        timeout: impl Into<Timeout>,
    ) -> IpcResult<usize> {
        let region = self.region(kind)?;
        let size = region.segment.size();
        if size > buf.len() {
            return Err(IpcError::TooLarge {
                len: size,
                max: buf.len(),
            });
        }
        let _guard = self.region_lock.lock();
        let desc = RegionDescriptor {
            id,
            kind,
            peer_addr: region.segment.peer_base().as_u32(),
            size: size as u32,
        };
        self.call(channel, command, id, tag, &desc.to_bytes(), &mut [], timeout)?;
        region.segment.read_bytes(0, &mut buf[..size]);
        Ok(size)
    }

    /// Snapshot shared memory into `buf`
    ///
    /// Link segment, pad run, parameter buffer, pad run, every region that
    /// still fits, and a final pad run if it fits. Returns bytes written.
    pub fn dump(&self, buf: &mut [u8]) -> usize {
        let mut at = copy_segment(self.link.segment(), buf);
        at += pad(&mut buf[at..], DUMP_PAD_LINK);
        at += copy_segment(&self.params, &mut buf[at..]);
        at += pad(&mut buf[at..], DUMP_PAD_PARAMS);

        let regions = self.regions.lock().clone();
        for region in &regions {
            if at + region.segment.size() < buf.len() {
                at += copy_segment(&region.segment, &mut buf[at..]);
            }
        }
        if at + DUMP_PAD_BYTES < buf.len() {
            at += pad(&mut buf[at..], DUMP_PAD_REGIONS);
        }
        at
    }
}

fn copy_segment(seg: &SharedSegment, dst: &mut [u8]) -> usize {
    let n = seg.size().min(dst.len());
    seg.read_bytes(0, &mut dst[..n]);
    n
}

fn pad(dst: &mut [u8], value: u8) -> usize {
    let n = DUMP_PAD_BYTES.min(dst.len());
    dst[..n].fill(value);
    n
}
