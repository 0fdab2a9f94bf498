//! TRB rings shared with the controller.
//!
//! A [`TrbRing`] is one segment of TRBs closed by a Link TRB pointing back to
//! its start. Ownership of each slot is decided by its cycle bit: the slot
//! belongs to the consumer iff the bit equals the consumer's cycle state.
//! The producer flips its cycle state every time it passes the Link TRB.
//!
//! The [`EventRing`] is produced by the controller, has no Link TRB and is
//! described to the hardware through the Event Ring Segment Table.

use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::{fence, Ordering};

use log::trace;

use crate::error::{Error, Result};
use crate::hal::{DmaBuffer, Hal};
use crate::trb::{Trb, TrbFlags, TrbType, TRB_SIZE};

/// TRBs per ring, not counting the Link TRB: one 4 KiB page in total.
pub const RING_CAPACITY: usize = 255;

/// Event ring geometry: one segment of one page.
pub const EVENT_RING_SEGMENTS: usize = 1;
pub const EVENT_SEGMENT_TRBS: usize = 256;

const ERST_ENTRY_SIZE: usize = 16;

/// Rings must not cross a 64 KiB boundary; aligning to the next power of two
/// of the size guarantees that for anything up to 64 KiB.
fn ring_layout(trbs: usize) -> Result<Layout> {
    let size = trbs * TRB_SIZE;
    if size > 0x10000 {
        return Err(Error::NoMemory);
    }
    Layout::from_size_align(size, size.next_power_of_two().max(64)).map_err(|_| Error::NoMemory)
}

/// Copies a TRB into DMA memory so that the consumer can never see it
/// half written: everything goes in with the cycle bit still pointing at
/// the producer, and the cycle bit is flipped by the final write.
fn write_trb(buffer: &mut DmaBuffer, offset: usize, trb: Trb, cycle: bool) {
    stage_trb(buffer, offset, trb, cycle);
    fence(Ordering::Release);
    buffer.write_u32(offset + 12, trb.with_cycle(cycle).control());
}

fn stage_trb(buffer: &mut DmaBuffer, offset: usize, trb: Trb, cycle: bool) {
    let staged = trb.with_cycle(!cycle);
    buffer.write_u64(offset, staged.parameter());
    buffer.write_u32(offset + 8, staged.status());
    buffer.write_u32(offset + 12, staged.control());
}

/// Reads the slot at `offset` if it belongs to a consumer with cycle state `ccs`.
fn read_trb(buffer: &DmaBuffer, offset: usize, ccs: bool) -> Option<Trb> {
    let control = buffer.read_u32(offset + 12);
    if (control & TrbFlags::CYCLE.bits() != 0) != ccs {
        return None;
    }
    fence(Ordering::Acquire);
    Some(Trb::new(
        buffer.read_u64(offset),
        buffer.read_u32(offset + 8),
        control,
    ))
}

pub struct TrbRing {
    buffer: DmaBuffer,
    /// Usable slots; the Link TRB lives at index `capacity`.
    capacity: usize,
    enqueue: usize,
    pcs: bool,
    dequeue: usize,
    ccs: bool,
}

impl TrbRing {
    pub fn new<H: Hal>(hal: &mut H, capacity: usize, bits64: bool) -> Result<Self> {
        assert!(capacity >= 2, "a ring needs room for at least one TRB in flight");
        let mut buffer = hal.dma_alloc(ring_layout(capacity + 1)?, bits64)?;

        let base = buffer.phys();
        // The Link TRB starts out owned by the producer (cycle 0 != PCS 1).
        stage_trb(&mut buffer, capacity * TRB_SIZE, Trb::link(base, true), true);

        trace!("ring: {} TRBs at {:#x}", capacity, base);
        Ok(TrbRing {
            buffer,
            capacity,
            enqueue: 0,
            pcs: true,
            dequeue: 0,
            ccs: true,
        })
    }

    pub fn release<H: Hal>(self, hal: &mut H) {
        hal.dma_free(self.buffer);
    }

    pub fn base(&self) -> u64 {
        self.buffer.phys()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn producer_cycle(&self) -> bool {
        self.pcs
    }

    pub fn consumer_cycle(&self) -> bool {
        self.ccs
    }

    pub fn phys_at(&self, index: usize) -> u64 {
        self.base() + (index * TRB_SIZE) as u64
    }

    /// Where the consumer starts reading, for CRCR and endpoint contexts.
    pub fn enqueue_ptr(&self) -> u64 {
        self.phys_at(self.enqueue)
    }

    pub fn dequeue_ptr(&self) -> u64 {
        self.phys_at(self.dequeue_pos())
    }

    pub fn contains(&self, phys: u64) -> bool {
        phys >= self.base()
            && phys < self.phys_at(self.capacity)
            && (phys - self.base()) % TRB_SIZE as u64 == 0
    }

    /// Whether `phys` is one of the TRBs from `first` to `last`, which may wrap
    /// past the Link TRB.
    pub fn span_contains(&self, first: u64, last: u64, phys: u64) -> bool {
        if !self.contains(phys) {
            return false;
        }
        if first <= last {
            (first..=last).contains(&phys)
        } else {
            phys >= first || phys <= last
        }
    }

    fn dequeue_pos(&self) -> usize {
        // Sitting on the Link TRB is the same place as the start of the ring.
        if self.dequeue == self.capacity {
            0
        } else {
            self.dequeue
        }
    }

    pub fn outstanding(&self) -> usize {
        (self.enqueue + self.capacity - self.dequeue_pos()) % self.capacity
    }

    /// One slot is always left empty so a full ring can be told from an empty one.
    pub fn free(&self) -> usize {
        self.capacity - 1 - self.outstanding()
    }

    /// Hand one TRB to the consumer. Returns its physical address.
    pub fn enqueue(&mut self, trb: Trb) -> Result<u64> {
        if self.free() == 0 {
            return Err(Error::RingFull);
        }
        let phys = self.enqueue_ptr();
        write_trb(&mut self.buffer, self.enqueue * TRB_SIZE, trb, self.pcs);
        self.advance(trb.flags().contains(TrbFlags::CHAIN));
        Ok(phys)
    }

    /// Hand a whole TD to the consumer at once. The first TRB's cycle bit is
    /// flipped last, so the controller cannot start on a partial TD.
    /// Returns the physical address of the last TRB.
    pub fn enqueue_td(&mut self, trbs: &[Trb]) -> Result<u64> {
        let Some((first, rest)) = trbs.split_first() else {
            return Err(Error::InvalidState);
        };
        if trbs.len() > self.free() {
            return Err(Error::RingFull);
        }

        let first_offset = self.enqueue * TRB_SIZE;
        let first_cycle = self.pcs;
        let mut last = self.enqueue_ptr();
        stage_trb(&mut self.buffer, first_offset, *first, first_cycle);
        self.advance(first.flags().contains(TrbFlags::CHAIN));

        for trb in rest {
            last = self.enqueue_ptr();
            write_trb(&mut self.buffer, self.enqueue * TRB_SIZE, *trb, self.pcs);
            self.advance(trb.flags().contains(TrbFlags::CHAIN));
        }

        fence(Ordering::Release);
        self.buffer
            .write_u32(first_offset + 12, first.with_cycle(first_cycle).control());
        Ok(last)
    }

    fn advance(&mut self, chain: bool) {
        self.enqueue += 1;
        if self.enqueue == self.capacity {
            // Give the Link TRB to the consumer, carrying the chain bit so a
            // TD can span the wrap.
            let mut link = Trb::link(self.base(), true);
            if chain {
                link = link.with_flags(TrbFlags::CHAIN);
            }
            write_trb(&mut self.buffer, self.capacity * TRB_SIZE, link, self.pcs);
            self.enqueue = 0;
            self.pcs = !self.pcs;
        }
    }

    /// Consumer side. `None` means the next slot is still the producer's.
    pub fn dequeue(&mut self) -> Option<Trb> {
        loop {
            let trb = read_trb(&self.buffer, self.dequeue * TRB_SIZE, self.ccs)?;
            if trb.trb_type() == Some(TrbType::Link) {
                self.dequeue = 0;
                if trb.flags().contains(TrbFlags::TOGGLE_CYCLE) {
                    self.ccs = !self.ccs;
                }
                continue;
            }
            self.dequeue += 1;
            return Some(trb);
        }
    }

    /// The controller reported it is done with the TRB at `phys`; everything
    /// up to and including it may be reused.
    pub fn update_dequeue(&mut self, phys: u64) -> bool {
        if !self.contains(phys) {
            return false;
        }
        self.dequeue = ((phys - self.base()) as usize / TRB_SIZE + 1) % self.capacity;
        true
    }

    /// Treat everything enqueued so far as consumed, e.g. after the
    /// controller was reset with TRBs still on the ring.
    pub fn discard_outstanding(&mut self) {
        self.dequeue = self.enqueue;
    }

    #[cfg(test)]
    pub(crate) fn trb_at(&self, index: usize) -> Trb {
        let offset = index * TRB_SIZE;
        Trb::new(
            self.buffer.read_u64(offset),
            self.buffer.read_u32(offset + 8),
            self.buffer.read_u32(offset + 12),
        )
    }
}

pub struct EventRing {
    segments: Vec<DmaBuffer>,
    erst: DmaBuffer,
    segment_trbs: usize,
    segment: usize,
    index: usize,
    ccs: bool,
}

impl EventRing {
    /// Allocates the segments and the segment table. On failure everything
    /// allocated so far is returned to the HAL.
    pub fn new<H: Hal>(hal: &mut H, segments: usize, segment_trbs: usize, bits64: bool) -> Result<Self> {
        assert!(segments > 0 && segment_trbs >= 16 && segment_trbs <= 4096);

        let erst_layout = Layout::from_size_align(segments * ERST_ENTRY_SIZE, 64)
            .map_err(|_| Error::NoMemory)?;
        let mut erst = hal.dma_alloc(erst_layout, bits64)?;

        let mut buffers = Vec::new();
        if buffers.try_reserve_exact(segments).is_err() {
            hal.dma_free(erst);
            return Err(Error::NoMemory);
        }
        for i in 0..segments {
            let buffer = match ring_layout(segment_trbs).and_then(|l| hal.dma_alloc(l, bits64)) {
                Ok(buffer) => buffer,
                Err(err) => {
                    for buffer in buffers {
                        hal.dma_free(buffer);
                    }
                    hal.dma_free(erst);
                    return Err(err);
                }
            };
            erst.write_u64(i * ERST_ENTRY_SIZE, buffer.phys());
            erst.write_u32(i * ERST_ENTRY_SIZE + 8, segment_trbs as u32);
            buffers.push(buffer);
        }

        trace!("event ring: {} x {} TRBs, ERST at {:#x}", segments, segment_trbs, erst.phys());
        Ok(EventRing {
            segments: buffers,
            erst,
            segment_trbs,
            segment: 0,
            index: 0,
            ccs: true,
        })
    }

    pub fn release<H: Hal>(self, hal: &mut H) {
        for buffer in self.segments {
            hal.dma_free(buffer);
        }
        hal.dma_free(self.erst);
    }

    pub fn erst_phys(&self) -> u64 {
        self.erst.phys()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn consumer_cycle(&self) -> bool {
        self.ccs
    }

    /// Value for ERDP: the next TRB we will look at.
    pub fn dequeue_ptr(&self) -> u64 {
        self.segments[self.segment].phys() + (self.index * TRB_SIZE) as u64
    }

    /// Back to the state the controller assumes after a reset.
    pub fn reset(&mut self) {
        for segment in &mut self.segments {
            segment.zero();
        }
        self.segment = 0;
        self.index = 0;
        self.ccs = true;
    }

    pub fn dequeue(&mut self) -> Option<Trb> {
        let trb = read_trb(&self.segments[self.segment], self.index * TRB_SIZE, self.ccs)?;

        self.index += 1;
        if self.index == self.segment_trbs {
            self.index = 0;
            self.segment += 1;
            if self.segment == self.segments.len() {
                self.segment = 0;
                self.ccs = !self.ccs;
            }
        }
        Some(trb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostHal;

    fn noop(n: u32) -> Trb {
        // Tag each TRB through its parameter so order can be checked.
        Trb::new(n as u64, 0, (TrbType::NoOp as u32) << 10)
    }

    #[test]
    fn fifo_across_wraparound() {
        let (mut hal, _sim) = HostHal::new();
        let mut ring = TrbRing::new(&mut hal, 4, true).unwrap();
        let start_cycle = ring.consumer_cycle();

        let mut seen = Vec::new();
        for n in 0..3 {
            ring.enqueue(noop(n)).unwrap();
        }
        while let Some(trb) = ring.dequeue() {
            seen.push(trb.parameter() as u32);
        }
        assert_eq!(ring.consumer_cycle(), start_cycle);

        // N + 2 in total: these cross the Link TRB.
        for n in 3..6 {
            ring.enqueue(noop(n)).unwrap();
        }
        while let Some(trb) = ring.dequeue() {
            seen.push(trb.parameter() as u32);
        }

        assert_eq!(seen, [0, 1, 2, 3, 4, 5]);
        assert_ne!(ring.consumer_cycle(), start_cycle);
        assert_eq!(ring.producer_cycle(), ring.consumer_cycle());
        assert!(ring.dequeue().is_none());

        ring.release(&mut hal);
        assert_eq!(hal.live_allocations(), 0);
    }

    #[test]
    fn td_span_across_the_link_trb() {
        let (mut hal, _sim) = HostHal::new();
        let mut ring = TrbRing::new(&mut hal, 4, true).unwrap();
        let link = ring.phys_at(4);

        // TRBs 2, 3, then 0 after the wrap.
        let (first, last) = (ring.phys_at(2), ring.phys_at(0));
        assert!(ring.span_contains(first, last, ring.phys_at(2)));
        assert!(ring.span_contains(first, last, ring.phys_at(3)));
        assert!(ring.span_contains(first, last, ring.phys_at(0)));
        assert!(!ring.span_contains(first, last, ring.phys_at(1)));
        assert!(!ring.span_contains(first, last, link));

        let (first, last) = (ring.phys_at(1), ring.phys_at(2));
        assert!(ring.span_contains(first, last, ring.phys_at(1)));
        assert!(!ring.span_contains(first, last, ring.phys_at(3)));
        assert!(!ring.span_contains(first, last, ring.phys_at(1) + 4));

        ring.release(&mut hal);
    }

    #[test]
    fn full_ring_is_refused() {
        let (mut hal, _sim) = HostHal::new();
        let mut ring = TrbRing::new(&mut hal, 4, true).unwrap();

        for n in 0..3 {
            ring.enqueue(noop(n)).unwrap();
        }
        assert_eq!(ring.enqueue(noop(3)), Err(Error::RingFull));

        let first = ring.phys_at(0);
        assert!(ring.update_dequeue(first));
        assert_eq!(ring.free(), 1);
        ring.enqueue(noop(3)).unwrap();
        ring.release(&mut hal);
    }

    #[test]
    fn unpublished_slot_is_not_consumed() {
        let (mut hal, _sim) = HostHal::new();
        let mut ring = TrbRing::new(&mut hal, 8, true).unwrap();
        assert!(ring.dequeue().is_none());

        // Fresh slots are zeroed, i.e. cycle 0, and the Link TRB is staged with
        // the producer's bit until the producer reaches it.
        assert!(!ring.trb_at(0).cycle());
        assert!(!ring.trb_at(8).cycle());
        assert_eq!(ring.trb_at(8).parameter(), ring.base());
        ring.release(&mut hal);
    }

    #[test]
    fn td_is_published_first_trb_last() {
        let (mut hal, _sim) = HostHal::new();
        let mut ring = TrbRing::new(&mut hal, 8, true).unwrap();

        let td = [
            noop(1).with_flags(TrbFlags::CHAIN),
            noop(2).with_flags(TrbFlags::CHAIN),
            noop(3),
        ];
        let last = ring.enqueue_td(&td).unwrap();
        assert_eq!(last, ring.phys_at(2));
        for i in 0..3 {
            assert!(ring.trb_at(i).cycle());
        }
        let got: Vec<_> = core::iter::from_fn(|| ring.dequeue()).map(|t| t.parameter()).collect();
        assert_eq!(got, [1, 2, 3]);
        ring.release(&mut hal);
    }

    #[test]
    fn chained_td_carries_chain_bit_over_link() {
        let (mut hal, _sim) = HostHal::new();
        let mut ring = TrbRing::new(&mut hal, 4, true).unwrap();

        ring.enqueue(noop(0)).unwrap();
        ring.enqueue(noop(1)).unwrap();
        ring.update_dequeue(ring.phys_at(1));

        ring.enqueue_td(&[noop(2).with_flags(TrbFlags::CHAIN), noop(3)]).unwrap();
        let link = ring.trb_at(4);
        assert_eq!(link.trb_type(), Some(TrbType::Link));
        assert!(link.flags().contains(TrbFlags::CHAIN));
        assert!(link.cycle());
        ring.release(&mut hal);
    }

    #[test]
    fn event_ring_spans_segments() {
        let (mut hal, _sim) = HostHal::new();
        let mut ring = EventRing::new(&mut hal, 2, 16, true).unwrap();
        assert_eq!(ring.segment_count(), 2);
        assert!(ring.dequeue().is_none());

        // Play controller: fill both segments with cycle 1.
        for segment in 0..2 {
            for i in 0..16 {
                let trb = noop((segment * 16 + i) as u32).with_cycle(true);
                let buffer = &mut ring.segments[segment];
                buffer.write_u64(i * TRB_SIZE, trb.parameter());
                buffer.write_u32(i * TRB_SIZE + 12, trb.control());
            }
        }

        for n in 0..32 {
            assert_eq!(ring.dequeue().map(|t| t.parameter()), Some(n));
        }
        assert!(!ring.consumer_cycle());
        assert_eq!(ring.dequeue_ptr(), ring.segments[0].phys());
        assert!(ring.dequeue().is_none());

        ring.release(&mut hal);
        assert_eq!(hal.live_allocations(), 0);
    }

    #[test]
    fn failed_event_ring_allocation_leaks_nothing() {
        let (mut hal, _sim) = HostHal::new();
        hal.fail_after(2);
        assert_eq!(EventRing::new(&mut hal, 3, 16, true).err(), Some(Error::NoMemory));
        assert_eq!(hal.live_allocations(), 0);
    }
}
