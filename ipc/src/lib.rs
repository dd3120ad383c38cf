//! # Helix IPC
//!
//! Shared-memory transport between the host and the audio co-processor.
//!
//! ## Architecture
//!
//! ```text
//!   callers ──► CommandClient ──┐
//!                               ▼
//!   callers ──► Link::send ──► tx MessageRing ──► doorbell ──► peer
//!                                                              │
//!   callers ◄── ChannelRegistry ◄── Link::dispatch ◄── rx MessageRing
//!                                        │
//!   callers ◄── BlockPool ◄── block events (bulk data in its own segment)
//! ```
//!
//! - **Message Ring** ([`ring`]): fixed 20-byte slots, one ring per direction
//! - **Channels** ([`channel`]): per-channel caches and blocking receive
//! - **Link** ([`link`]): dispatch, readiness, fault recovery
//! - **Block Pool** ([`block`]): zero-copy block exchange with free pools
//! - **Commands** ([`command`]): request/response over the parameter buffer
//! - **Peer Port** ([`peer`]): the remote side, for loopback and tests
//!
//! ## Failure Model
//!
//! A peer fault report, or a message receive that times out, takes the link
//! down: every blocked caller returns [`IpcError::LinkDown`], the fault
//! handler sees the segment before it is reset, and the link waits for the
//! peer's ready message again.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod channel;
pub mod command;
pub mod config;
pub mod error;
pub mod link;
pub mod message;
pub mod peer;
pub mod ring;
pub mod sync;

pub use block::{
    Block, BlockPool, Direction, Notify, PeerBlockPool, PoolEvent, PoolNotifier, PoolReadiness,
    PoolStats,
};
pub use channel::{ChannelRegistry, ChannelState};
pub use command::{CommandClient, RegionDescriptor};
pub use config::{BlockPoolConfig, CommandConfig, LinkConfig};
pub use error::{IpcError, IpcResult};
pub use link::{FaultHandler, Link, LinkFault, LinkReport, LinkStats};
pub use message::{channels, codes, Message, MESSAGE_SIZE};
pub use peer::PeerPort;
pub use sync::Timeout;

pub use helix_hal::{Doorbell, PeerAddr, SharedSegment};
