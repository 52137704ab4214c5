//! Defines DMA-capable memory regions and the allocator boundary that the NIC
//! driver uses to obtain them.
//!
//! The actual mapping of host memory for device access (IOMMU programming,
//! cache attributes, physically-contiguous allocation) lives below this
//! boundary. The driver only ever sees a [`DmaRegion`]: a chunk of host
//! memory plus the address the device should use to reach it.

use core::fmt;

/// Possible reasons an allocation request can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// The allocator could not satisfy the request.
    OutOfMemory,
    /// The requested alignment was zero or not a power of two.
    BadAlignment,
    /// The requested size was zero.
    ZeroSize,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DmaError::OutOfMemory => write!(f, "DMA allocator is out of memory"),
            DmaError::BadAlignment => write!(f, "alignment must be a nonzero power of two"),
            DmaError::ZeroSize => write!(f, "cannot allocate a zero-sized DMA region"),
        }
    }
}

impl std::error::Error for DmaError {}

/// A region of host memory set up for device access.
///
/// The region is exclusively owned: dropping it releases the memory back to
/// whatever allocator produced it. The device-visible address is fixed for
/// the lifetime of the region.
pub struct DmaRegion {
    bytes: Box<[u8]>,
    device_addr: u64,
}

impl DmaRegion {
    /// Wraps already-mapped memory. Only allocator implementations should
    /// need to call this.
    pub fn new(bytes: Box<[u8]>, device_addr: u64) -> DmaRegion {
        DmaRegion { bytes, device_addr }
    }

    /// The address the device uses to reach this region.
    pub fn device_addr(&self) -> u64 {
        self.device_addr
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Zeroes the whole region.
    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("len", &self.bytes.len())
            .field("device_addr", &format_args!("{:#x}", self.device_addr))
            .finish()
    }
}

/// The allocator the driver uses for every queue ring, doorbell record, and
/// packet buffer. Implementations must hand out regions that remain valid
/// for device access until dropped.
pub trait DmaAllocator: Send + Sync {
    fn allocate(&self, size: usize, align: usize) -> Result<DmaRegion, DmaError>;
}

/// An in-process allocator backed by the ordinary heap.
///
/// Device addresses are synthesized from a monotonic counter, which is enough
/// for tests and for host-side integration where a real IOMMU layer rewrites
/// them later.
pub struct HeapDma {
    next_addr: core::sync::atomic::AtomicU64,
}

impl HeapDma {
    pub fn new() -> HeapDma {
        HeapDma { next_addr: core::sync::atomic::AtomicU64::new(0x1000) }
    }
}

impl Default for HeapDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HeapDma {
    fn allocate(&self, size: usize, align: usize) -> Result<DmaRegion, DmaError> {
        use core::sync::atomic::Ordering;

        if size == 0 {
            return Err(DmaError::ZeroSize);
        }
        if align == 0 || !align.is_power_of_two() {
            return Err(DmaError::BadAlignment);
        }

        let bytes = vec![0u8; size].into_boxed_slice();

        // Reserve an aligned span of fake device address space.
        let mask = (align as u64) - 1;
        let mut addr;
        loop {
            let cur = self.next_addr.load(Ordering::Relaxed);
            addr = (cur + mask) & !mask;
            let next = addr + size as u64;
            if self
                .next_addr
                .compare_exchange(cur, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        Ok(DmaRegion::new(bytes, addr))
    }
}
