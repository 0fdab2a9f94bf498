//! What the driver needs from the kernel underneath it.

use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;

use crate::error::Result;

/// 32-bit register access at byte offsets into one mapped region.
///
/// xHCI registers are little endian; implementations convert to host order.
pub trait Mmio {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

pub trait Hal {
    type Mmio: Mmio;

    /// Map a physical range for register access (`pio_enable` in other kernels).
    fn map_mmio(&mut self, range: MemRange) -> Result<Self::Mmio>;
    fn unmap_mmio(&mut self, mmio: Self::Mmio);

    /// Zeroed, physically contiguous, DMA coherent memory. Must lie below
    /// 4 GiB unless `bits64` is set.
    fn dma_alloc(&mut self, layout: Layout, bits64: bool) -> Result<DmaBuffer>;
    fn dma_free(&mut self, buffer: DmaBuffer);

    fn usleep(&mut self, us: u32);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemRange {
    pub base: u64,
    pub size: usize,
}

/// Hardware resources handed to the driver by its parent bus driver.
#[derive(Clone, Debug, Default)]
pub struct HwResources {
    pub mem_ranges: Vec<MemRange>,
    pub irqs: Vec<u32>,
}

#[derive(Copy, Clone)]
pub struct Volatile<T>(pub *mut T);

impl<T> Volatile<T> {
    pub unsafe fn read(self) -> T {
        unsafe { core::ptr::read_volatile(self.0) }
    }
    pub unsafe fn write(self, value: T) {
        unsafe { core::ptr::write_volatile(self.0, value) }
    }
}

/// A register window reached through a plain pointer.
pub struct MappedMmio {
    base: NonNull<u8>,
    len: usize,
}

unsafe impl Send for MappedMmio {}

impl MappedMmio {
    /// Safety: `base..base + len` must stay mapped (uncached, for real
    /// hardware) for as long as this value exists.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn reg(&self, offset: usize) -> Volatile<u32> {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "register {offset:#x} out of range");
        // Safety: checked against the mapped length above.
        Volatile(unsafe { self.base.as_ptr().add(offset) }.cast::<u32>())
    }
}

impl Mmio for MappedMmio {
    fn read32(&self, offset: usize) -> u32 {
        u32::from_le(unsafe { self.reg(offset).read() })
    }

    fn write32(&self, offset: usize, value: u32) {
        unsafe { self.reg(offset).write(value.to_le()) }
    }
}

/// Physical view of a data buffer handed to a transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DmaRegion {
    pub phys: u64,
    pub len: usize,
}

/// DMA memory owned by the driver.
///
/// There is no `Drop`: the buffer goes back through
/// [`Hal::dma_free`], which takes it by value.
#[must_use]
pub struct DmaBuffer {
    virt: NonNull<u8>,
    phys: u64,
    layout: Layout,
}

unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// Safety: `virt` must point to `layout.size()` bytes of memory that the
    /// device sees at `phys`, and nothing else may own that memory.
    pub unsafe fn from_raw_parts(virt: NonNull<u8>, phys: u64, layout: Layout) -> Self {
        Self { virt, phys, layout }
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    pub fn region(&self) -> DmaRegion {
        DmaRegion {
            phys: self.phys,
            len: self.len(),
        }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len());
        let ptr = unsafe { self.virt.as_ptr().add(offset) }.cast::<u32>();
        u32::from_le(unsafe { Volatile(ptr).read() })
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        assert!(offset % 4 == 0 && offset + 4 <= self.len());
        let ptr = unsafe { self.virt.as_ptr().add(offset) }.cast::<u32>();
        unsafe { Volatile(ptr).write(value.to_le()) }
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.len());
        let ptr = unsafe { self.virt.as_ptr().add(offset) }.cast::<u64>();
        u64::from_le(unsafe { Volatile(ptr).read() })
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        assert!(offset % 8 == 0 && offset + 8 <= self.len());
        let ptr = unsafe { self.virt.as_ptr().add(offset) }.cast::<u64>();
        unsafe { Volatile(ptr).write(value.to_le()) }
    }

    /// Copies a structure that is already in controller byte order.
    pub fn write_pod<T: bytemuck::Pod>(&mut self, offset: usize, value: &T) {
        let bytes = bytemuck::bytes_of(value);
        assert!(offset + bytes.len() <= self.len());
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.virt.as_ptr().add(offset), bytes.len())
        }
    }

    pub fn read_pod<T: bytemuck::Pod>(&self, offset: usize) -> T {
        let mut value = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut value);
        assert!(offset + bytes.len() <= self.len());
        unsafe {
            core::ptr::copy_nonoverlapping(self.virt.as_ptr().add(offset), bytes.as_mut_ptr(), bytes.len())
        }
        value
    }

    pub fn zero(&mut self) {
        unsafe { core::ptr::write_bytes(self.virt.as_ptr(), 0, self.len()) }
    }
}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_mmio_is_little_endian() {
        let mut words = [0u32; 4];
        let base = NonNull::new(words.as_mut_ptr().cast::<u8>()).unwrap();
        let mmio = unsafe { MappedMmio::new(base, 16) };

        mmio.write32(4, 0x1234_5678);
        assert_eq!(mmio.read32(4), 0x1234_5678);
        drop(mmio);

        let bytes: &[u8] = bytemuck::cast_slice(&words);
        assert_eq!(&bytes[4..8], &[0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    #[should_panic]
    fn mapped_mmio_rejects_out_of_range() {
        let mut words = [0u32; 2];
        let base = NonNull::new(words.as_mut_ptr().cast::<u8>()).unwrap();
        let mmio = unsafe { MappedMmio::new(base, 8) };
        mmio.read32(8);
    }
}
