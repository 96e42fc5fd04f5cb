//! Host-side buffer allocation collaborators: a bump suballocator for
//! pre-sized per-dispatch arenas, and `StagedRing` — the `StagedBuffer`
//! abstraction from §9 that hides whether a host-mapped ring has a
//! device-local twin behind a uniform "emit zero or two `BufferCopy`
//! regions" interface.
//!
//! Real memory allocation (choosing a Vulkan memory type, binding it to a
//! buffer) is out of scope (§1) — this module only carves pre-allocated
//! extents and describes the copies a staged ring needs at flush time.

use ash::vk;
use smallvec::SmallVec;

/// A simple bump allocator over one fixed-capacity extent. Used to lay out
/// the fixed sub-regions of a per-dispatch device arena (temp scratch,
/// ttrks, rs-internal/indirect) once at builder creation — per the design
/// note, *not* re-suballocated on every flush.
#[derive(Debug, Clone, Copy)]
pub struct Suballocator {
    capacity: u64,
    cursor: u64,
}

impl Suballocator {
    /// A fresh suballocator over `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Suballocator { capacity, cursor: 0 }
    }

    /// Carve out `size` bytes aligned to `align` (must be a power of two),
    /// returning the offset, or `None` if the extent is exhausted.
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        debug_assert!(align.is_power_of_two());
        let mask = align - 1;
        let aligned = (self.cursor + mask) & !mask;
        if aligned.checked_add(size)? > self.capacity {
            return None;
        }
        self.cursor = aligned + size;
        Some(aligned)
    }

    /// Bytes carved so far.
    pub fn used(&self) -> u64 {
        self.cursor
    }

    /// Total capacity of the extent.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// A host-mapped ring buffer with an optional device-local twin. When
/// `staged` is false (no-staging path, or a UMA device that already offers
/// `HOST_COHERENT | DEVICE_LOCAL`), `device` aliases `host` and
/// `copy_regions` always returns empty.
#[derive(Debug, Clone, Copy)]
pub struct StagedRing {
    host: vk::Buffer,
    device: vk::Buffer,
    staged: bool,
}

impl StagedRing {
    /// A ring with no device-local twin — reads and writes go through the
    /// same buffer identifier.
    pub fn unstaged(host: vk::Buffer) -> Self {
        StagedRing {
            host,
            device: host,
            staged: false,
        }
    }

    /// A ring staged to a separate device-local buffer.
    pub fn staged(host: vk::Buffer, device: vk::Buffer) -> Self {
        StagedRing { host, device, staged: true }
    }

    /// The buffer identifier compute shaders should bind — the device twin
    /// when staged, the host buffer otherwise.
    pub fn device_buffer(&self) -> vk::Buffer {
        self.device
    }

    /// The buffer identifier the host writes into.
    pub fn host_buffer(&self) -> vk::Buffer {
        self.host
    }

    /// Whether this ring has a separate device-local twin to copy into.
    pub fn is_staged(&self) -> bool {
        self.staged
    }

    /// Build the `BufferCopy` regions needed to copy `span` elements of
    /// `stride` bytes starting at `head` (mod `ring_size`) from host to
    /// device. Returns zero regions when unstaged or `span == 0`; at most
    /// two when the span wraps.
    pub fn copy_regions(&self, ring_size: u32, head: u32, span: u32, stride: u64) -> SmallVec<[vk::BufferCopy; 2]> {
        let mut regions = SmallVec::new();
        if !self.staged || span == 0 {
            return regions;
        }
        let first = span.min(ring_size - head);
        regions.push(vk::BufferCopy {
            src_offset: head as u64 * stride,
            dst_offset: head as u64 * stride,
            size: first as u64 * stride,
        });
        let remaining = span - first;
        if remaining > 0 {
            regions.push(vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: remaining as u64 * stride,
            });
        }
        regions
    }
}
