//! # Shared Segment
//!
//! A contiguous region both processors address. Index words are accessed
//! through atomic views so a store by one side is observed in order by the
//! other; payload bytes use volatile copies.
//!
//! ```text
//!  local base                                   local base + size
//!  ┌──────────────────────────────────────────────────────┐
//!  │ headers │ slots / blocks │ descriptor tables │ ...   │
//!  └──────────────────────────────────────────────────────┘
//!  peer base                                     peer base + size
//! ```
//!
//! Offsets handed to the accessors are trusted layout offsets computed at
//! setup time. Addresses read out of shared memory must go through
//! [`SharedSegment::to_offset`] first.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::addr::{AddrMap, PeerAddr};
use crate::{HalError, HalResult};

/// Alignment of heap-backed segments
const SEGMENT_ALIGN: usize = 64;

/// Shared memory segment
pub struct SharedSegment {
    base: NonNull<u8>,
    map: AddrMap,
    owned: Option<Layout>,
}

// SAFETY: all access to the region goes through atomics or volatile copies;
// the segment never hands out references into the memory.
unsafe impl Send for SharedSegment {}
// SAFETY: see above, shared access is the point of the type.
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Wrap an existing mapping
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `size` bytes for the
    /// lifetime of the segment, aligned to 4 bytes, and not accessed through
    /// Rust references elsewhere.
    pub unsafe fn from_raw(base: NonNull<u8>, size: usize, peer_base: u32) -> HalResult<Self> {
        if base.as_ptr() as usize % 4 != 0 {
            return Err(HalError::Misaligned(base.as_ptr() as usize));
        }
        Ok(Self {
            base,
            map: AddrMap::new(peer_base, size)?,
            owned: None,
        })
    }

    /// Allocate a zeroed heap-backed segment
    ///
    /// Used for loopback links where both sides live in one address space.
    pub fn allocate(size: usize, peer_base: u32) -> HalResult<Self> {
        let map = AddrMap::new(peer_base, size)?;
        let layout =
            Layout::from_size_align(size, SEGMENT_ALIGN).map_err(|_| HalError::InvalidSize(size))?;
        // SAFETY: layout has non-zero size (checked by AddrMap::new).
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(HalError::AllocFailed)?;
        log::debug!("shmem: allocated {} bytes, peer base {}", size, map.peer_base());
        Ok(Self {
            base,
            map,
            owned: Some(layout),
        })
    }

    /// Segment size in bytes
    pub fn size(&self) -> usize {
        self.map.size()
    }

    /// Address map
    pub fn map(&self) -> &AddrMap {
        &self.map
    }

    /// Peer base address
    pub fn peer_base(&self) -> PeerAddr {
        self.map.peer_base()
    }

    /// Translate an offset to the peer space
    pub fn to_peer(&self, offset: usize) -> HalResult<PeerAddr> {
        self.map.to_peer(offset)
    }

    /// Translate a peer range to an offset, bounds checked
    pub fn to_offset(&self, addr: PeerAddr, len: usize) -> HalResult<usize> {
        self.map.to_offset(addr, len)
    }

    /// Local pointer for an offset
    ///
    /// Exposed for handing buffers to DMA engines or codecs; the segment
    /// itself never dereferences it outside its accessors.
    pub fn local_ptr(&self, offset: usize) -> *mut u8 {
        self.check(offset, 0);
        // SAFETY: offset <= size, so the result stays inside (or one past) the mapping.
        unsafe { self.base.as_ptr().add(offset) }
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.size()),
            "segment access 0x{:x}+{} beyond 0x{:x}",
            offset,
            len,
            self.size()
        );
    }

    #[inline]
    fn word(&self, offset: usize) -> &AtomicU32 {
        self.check(offset, 4);
        assert!(offset % 4 == 0, "unaligned word at 0x{:x}", offset);
        // SAFETY: in bounds, 4-byte aligned (base is at least 4-aligned), and
        // the memory is only ever accessed atomically at word granularity.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU32) }
    }

    /// Load a 32-bit word with acquire ordering
    ///
    /// # Panics
    ///
    /// On an out-of-bounds or unaligned offset.
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le(self.word(offset).load(Ordering::Acquire))
    }

    /// Store a 32-bit word with release ordering
    ///
    /// # Panics
    ///
    /// On an out-of-bounds or unaligned offset.
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.word(offset).store(value.to_le(), Ordering::Release);
    }

    /// Copy bytes out of the segment
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.check(offset, dst.len());
        fence(Ordering::Acquire);
        for (i, byte) in dst.iter_mut().enumerate() {
            // SAFETY: offset + i < size, checked above.
            *byte = unsafe { ptr::read_volatile(self.base.as_ptr().add(offset + i)) };
        }
    }

    /// Copy bytes into the segment
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check(offset, src.len());
        for (i, byte) in src.iter().enumerate() {
            // SAFETY: offset + i < size, checked above.
            unsafe { ptr::write_volatile(self.base.as_ptr().add(offset + i), *byte) };
        }
        fence(Ordering::Release);
    }

    /// Fill a range with one byte value
    pub fn fill(&self, offset: usize, len: usize, value: u8) {
        self.check(offset, len);
        for i in 0..len {
            // SAFETY: offset + i < size, checked above.
            unsafe { ptr::write_volatile(self.base.as_ptr().add(offset + i), value) };
        }
        fence(Ordering::Release);
    }

    /// Zero the whole segment
    pub fn zero(&self) {
        self.fill(0, self.size(), 0);
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Some(layout) = self.owned {
            // SAFETY: allocated in `allocate` with this exact layout.
            unsafe { dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSegment")
            .field("local", &self.base)
            .field("peer", &self.map.peer_base())
            .field("size", &self.size())
            .field("owned", &self.owned.is_some())
            .finish()
    }
}
