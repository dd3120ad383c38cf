//! # Address Translation
//!
//! The peer sees the shared segment at its own physical base. Every address
//! that crosses the boundary (ring base, descriptor tables, block addresses,
//! parameter buffers) is stored in the peer coordinate space and translated
//! here. Translation back to the local side is always bounds checked.

use core::fmt;

use crate::{HalError, HalResult};

static_assertions::const_assert_eq!(core::mem::size_of::<PeerAddr>(), 4);

// ============================================================================
// PEER ADDRESS
// ============================================================================

/// Address in the peer's coordinate space
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PeerAddr(pub u32);

impl PeerAddr {
    /// Null address
    pub const NULL: Self = Self(0);

    /// Create from raw value
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Raw value
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Address `by` bytes further on, if it does not wrap
    pub fn offset(self, by: u32) -> Option<Self> {
        self.0.checked_add(by).map(Self)
    }
}

impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddr(0x{:08x})", self.0)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<u32> for PeerAddr {
    fn from(addr: u32) -> Self {
        Self(addr)
    }
}

// ============================================================================
// ADDRESS MAP
// ============================================================================

/// Mapping between segment offsets and peer addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrMap {
    peer_base: u32,
    size: usize,
}

impl AddrMap {
    /// Create a map for a segment of `size` bytes the peer sees at `peer_base`
    ///
    /// The one-past-the-end address must itself be representable.
    pub fn new(peer_base: u32, size: usize) -> HalResult<Self> {
        if size == 0 || peer_base as u64 + size as u64 > u32::MAX as u64 {
            return Err(HalError::InvalidSize(size));
        }
        Ok(Self { peer_base, size })
    }

    /// Peer base address
    pub const fn peer_base(&self) -> PeerAddr {
        PeerAddr(self.peer_base)
    }

    /// Segment size
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Translate a segment offset into the peer space
    ///
    /// `offset == size` is allowed so one-past-the-end addresses can be
    /// expressed.
    pub fn to_peer(&self, offset: usize) -> HalResult<PeerAddr> {
        if offset > self.size {
            return Err(HalError::OutOfRange {
                addr: self.peer_base,
                len: offset,
            });
        }
        Ok(PeerAddr(self.peer_base + offset as u32))
    }

    /// Translate a peer range `[addr, addr + len)` into a segment offset
    pub fn to_offset(&self, addr: PeerAddr, len: usize) -> HalResult<usize> {
        let err = HalError::OutOfRange { addr: addr.0, len };
        let start = addr.0.checked_sub(self.peer_base).ok_or(err)? as usize;
        let end = start.checked_add(len).ok_or(err)?;
        if end > self.size {
            return Err(err);
        }
        Ok(start)
    }

    /// Check whether a peer range lies entirely inside the segment
    pub fn contains(&self, addr: PeerAddr, len: usize) -> bool {
        self.to_offset(addr, len).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let map = AddrMap::new(0x8000_0000, 0x1000).unwrap();
        let peer = map.to_peer(0x40).unwrap();
        assert_eq!(peer, PeerAddr(0x8000_0040));
        assert_eq!(map.to_offset(peer, 16).unwrap(), 0x40);
    }

    #[test]
    fn test_out_of_range() {
        let map = AddrMap::new(0x8000_0000, 0x1000).unwrap();
        assert!(map.to_offset(PeerAddr(0x7fff_fff0), 4).is_err());
        assert!(map.to_offset(PeerAddr(0x8000_0ff0), 0x20).is_err());
        assert!(map.to_offset(PeerAddr(0xffff_fff0), 0x20).is_err());
        assert!(map.contains(PeerAddr(0x8000_0ff0), 0x10));
        assert!(map.to_peer(0x1001).is_err());
    }

    #[test]
    fn test_segment_must_fit_peer_space() {
        assert!(AddrMap::new(0xffff_f000, 0xfff).is_ok());
        assert!(AddrMap::new(0xffff_f000, 0x1000).is_err());
        assert!(AddrMap::new(0, 0).is_err());
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", PeerAddr(0x1234)), "PeerAddr(0x00001234)");
    }
}
