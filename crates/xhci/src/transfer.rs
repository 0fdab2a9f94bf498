//! Transfer descriptors for control and bulk endpoints.

use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use log::{debug, trace, warn};

use crate::context::SlotId;
use crate::error::{Error, Result};
use crate::hal::{DmaRegion, Mmio};
use crate::regs::Registers;
use crate::ring::TrbRing;
use crate::trb::{CompletionCode, SetupTransferType, Trb, TrbFlags, TRB_MAX_TRANSFER};

/// USB address and endpoint number of a transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub address: u8,
    pub endpoint: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Copy, Clone, Debug)]
pub struct TransferBatch {
    pub target: Target,
    pub direction: Direction,
    pub transfer_type: TransferType,
    /// Setup packet, control transfers only.
    pub setup: [u8; 8],
    pub buffer: Option<DmaRegion>,
}

impl TransferBatch {
    pub fn control(target: Target, direction: Direction, setup: [u8; 8], buffer: Option<DmaRegion>) -> Self {
        TransferBatch {
            target,
            direction,
            transfer_type: TransferType::Control,
            setup,
            buffer,
        }
    }

    pub fn bulk(target: Target, direction: Direction, buffer: DmaRegion) -> Self {
        TransferBatch {
            target,
            direction,
            transfer_type: TransferType::Bulk,
            setup: [0; 8],
            buffer: Some(buffer),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.map_or(0, |b| b.len)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransferId(u64);

struct PendingTransfer {
    id: TransferId,
    slot: SlotId,
    dci: u8,
    /// First TRB of the TD. An error may be reported on any TRB from here on.
    first_trb: u64,
    /// The TRB carrying IOC; its event completes the TD.
    last_trb: u64,
    len: usize,
    result: Option<Result<usize>>,
}

/// Splits `region` into Normal TRBs that stay within 64 KiB boundaries.
fn push_normal_trbs(trbs: &mut Vec<Trb>, region: DmaRegion, max_packet: u16) {
    let max_packet = max_packet.max(1) as usize;
    let mut phys = region.phys;
    let mut remaining = region.len;
    loop {
        let boundary = TRB_MAX_TRANSFER - (phys as usize & (TRB_MAX_TRANSFER - 1));
        let chunk = remaining.min(boundary);
        remaining -= chunk;
        let td_size = remaining.div_ceil(max_packet) as u32;
        let trb = Trb::normal(phys, chunk, td_size);
        if remaining == 0 {
            trbs.push(trb.with_flags(TrbFlags::IOC));
            break;
        }
        trbs.push(trb.with_flags(TrbFlags::CHAIN));
        phys += chunk as u64;
    }
}

fn normal_trb_count(region: DmaRegion) -> usize {
    let first = TRB_MAX_TRANSFER - (region.phys as usize & (TRB_MAX_TRANSFER - 1));
    if region.len <= first {
        1
    } else {
        1 + (region.len - first).div_ceil(TRB_MAX_TRANSFER)
    }
}

/// The TRBs of one TD for `batch`. Nothing is touched on error.
pub fn build_td(batch: &TransferBatch, max_packet: u16) -> Result<Vec<Trb>> {
    let mut trbs = Vec::new();
    match batch.transfer_type {
        TransferType::Control => {
            let data = batch.buffer.filter(|b| b.len > 0);
            if data.is_some_and(|b| b.len > TRB_MAX_TRANSFER) {
                return Err(Error::NotSupported);
            }
            trbs.try_reserve_exact(3).map_err(|_| Error::NoMemory)?;

            let dir_in = batch.direction == Direction::In;
            let trt = match (data, dir_in) {
                (None, _) => SetupTransferType::NoData,
                (Some(_), true) => SetupTransferType::In,
                (Some(_), false) => SetupTransferType::Out,
            };
            trbs.push(Trb::setup_stage(batch.setup, trt));
            if let Some(data) = data {
                trbs.push(Trb::data_stage(data.phys, data.len, 0, dir_in));
            }
            // Status goes the other way, and is IN when there is no data.
            trbs.push(Trb::status_stage(data.is_none() || !dir_in));
        }
        TransferType::Bulk => {
            let region = batch.buffer.unwrap_or(DmaRegion { phys: 0, len: 0 });
            trbs.try_reserve_exact(normal_trb_count(region))
                .map_err(|_| Error::NoMemory)?;
            push_normal_trbs(&mut trbs, region, max_packet);
        }
        TransferType::Isochronous | TransferType::Interrupt => return Err(Error::NotSupported),
    }
    Ok(trbs)
}

#[derive(Default)]
pub struct TransferScheduler {
    pending: Vec<PendingTransfer>,
    next_id: u64,
}

impl TransferScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue the TD on `ring` and ring the slot's doorbell for `dci`.
    pub fn schedule<M: Mmio>(
        &mut self,
        ring: &mut TrbRing,
        regs: &Registers<M>,
        slot: SlotId,
        dci: u8,
        batch: &TransferBatch,
        max_packet: u16,
    ) -> Result<TransferId> {
        let trbs = build_td(batch, max_packet)?;
        self.pending.try_reserve(1).map_err(|_| Error::NoMemory)?;
        let first_trb = ring.enqueue_ptr();
        let last_trb = ring.enqueue_td(&trbs)?;

        let id = TransferId(self.next_id);
        self.next_id += 1;
        self.pending.push(PendingTransfer {
            id,
            slot,
            dci,
            first_trb,
            last_trb,
            len: batch.len(),
            result: None,
        });
        trace!(
            "{:?} transfer {:?}: slot {} dci {}, {} TRBs, {} bytes",
            batch.transfer_type,
            id,
            slot,
            dci,
            trbs.len(),
            batch.len()
        );

        fence(Ordering::SeqCst);
        regs.ring_doorbell(slot.get(), dci as u32);
        Ok(id)
    }

    /// Record a Transfer Event for an endpoint of `slot`.
    ///
    /// The controller reports errors on the TRB where they happened, which
    /// need not be the last one of the TD. Such an event finishes the TD.
    pub fn handle_event(&mut self, ring: &mut TrbRing, slot: SlotId, event: &Trb) -> Result<TransferId> {
        let ptr = event.parameter() & !0xF;
        let dci = event.endpoint_id();
        let Some(pending) = self.pending.iter_mut().find(|p| {
            p.slot == slot
                && p.dci == dci
                && p.result.is_none()
                && ring.span_contains(p.first_trb, p.last_trb, ptr)
        }) else {
            warn!("transfer event for unknown TRB {:#x} (slot {} dci {})", ptr, slot, dci);
            return Err(Error::UnmatchedCompletion(ptr));
        };

        let code = event.completion_code();
        let result = match code {
            CompletionCode::Success | CompletionCode::ShortPacket if ptr != pending.last_trb => {
                trace!("transfer {:?}: {:?} at {:#x}, TD continues", pending.id, code, ptr);
                return Ok(pending.id);
            }
            CompletionCode::Success | CompletionCode::ShortPacket => {
                Ok(pending.len.saturating_sub(event.event_residual() as usize))
            }
            code => Err(Error::Transfer(code)),
        };
        debug!("transfer {:?} done: {:?}", pending.id, result);
        pending.result = Some(result);
        // The rest of the TD is not going to be executed either.
        ring.update_dequeue(pending.last_trb);
        Ok(pending.id)
    }

    pub fn is_pending(&self, id: TransferId) -> bool {
        self.pending.iter().any(|p| p.id == id)
    }

    /// Bytes transferred, or the failure, once the transfer has completed.
    pub fn take(&mut self, id: TransferId) -> Option<Result<usize>> {
        let index = self
            .pending
            .iter()
            .position(|p| p.id == id && p.result.is_some())?;
        self.pending.swap_remove(index).result
    }

    pub fn forget(&mut self, id: TransferId) {
        self.pending.retain(|p| p.id != id);
    }

    /// Drop everything in flight on a slot that is going away.
    pub fn forget_slot(&mut self, slot: SlotId) {
        self.pending.retain(|p| p.slot != slot);
    }

    pub fn outstanding(&self) -> usize {
        self.pending.iter().filter(|p| p.result.is_none()).count()
    }

    pub fn clear(&mut self) {
        if self.outstanding() != 0 {
            warn!("dropping {} outstanding transfers", self.outstanding());
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MappedMmio;
    use crate::host::HostHal;
    use crate::regs::Capabilities;
    use crate::trb::TrbType;
    use core::ptr::NonNull;

    const TARGET: Target = Target {
        address: 1,
        endpoint: 0,
    };

    #[test]
    fn control_in_with_data() {
        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let buffer = DmaRegion {
            phys: 0x1000,
            len: 18,
        };
        let batch = TransferBatch::control(TARGET, Direction::In, setup, Some(buffer));
        let trbs = build_td(&batch, 64).unwrap();

        let types: Vec<_> = trbs.iter().map(|t| t.trb_type()).collect();
        assert_eq!(
            types,
            [
                Some(TrbType::SetupStage),
                Some(TrbType::DataStage),
                Some(TrbType::StatusStage)
            ]
        );
        assert_eq!((trbs[0].control() >> 16) & 0x3, SetupTransferType::In as u32);
        assert!(trbs[1].flags().contains(TrbFlags::DIR_IN));
        assert_eq!(trbs[1].parameter(), 0x1000);
        assert_eq!(trbs[1].status() & 0x1_FFFF, 18);
        assert!(!trbs[2].flags().contains(TrbFlags::DIR_IN));
        assert!(trbs[2].flags().contains(TrbFlags::IOC));
        assert!(trbs.iter().all(|t| !t.flags().contains(TrbFlags::CHAIN)));
    }

    #[test]
    fn control_without_data() {
        // SET_CONFIGURATION(1)
        let setup = [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        let batch = TransferBatch::control(TARGET, Direction::Out, setup, None);
        let trbs = build_td(&batch, 64).unwrap();

        assert_eq!(trbs.len(), 2);
        assert_eq!((trbs[0].control() >> 16) & 0x3, SetupTransferType::NoData as u32);
        assert!(trbs[1].flags().contains(TrbFlags::DIR_IN));
    }

    #[test]
    fn bulk_splits_at_64k_boundaries() {
        let target = Target {
            address: 1,
            endpoint: 2,
        };
        let buffer = DmaRegion {
            phys: 0x1_F000,
            len: 0x2_0000,
        };
        let trbs = build_td(&TransferBatch::bulk(target, Direction::Out, buffer), 512).unwrap();

        let chunks: Vec<_> = trbs.iter().map(|t| (t.parameter(), t.status() & 0x1_FFFF)).collect();
        assert_eq!(
            chunks,
            [(0x1_F000, 0x1000), (0x2_0000, 0x1_0000), (0x3_0000, 0xF000)]
        );
        assert_eq!(trbs.len(), normal_trb_count(buffer));

        let (last, rest) = trbs.split_last().unwrap();
        assert!(rest.iter().all(|t| t.flags().contains(TrbFlags::CHAIN)));
        assert!(rest.iter().all(|t| !t.flags().contains(TrbFlags::IOC)));
        assert!(last.flags().contains(TrbFlags::IOC));
        assert!(!last.flags().contains(TrbFlags::CHAIN));

        // TD size counts the packets still to come, saturating at 31.
        assert_eq!(trbs[0].status() >> 17, 31);
        assert_eq!(trbs[1].status() >> 17, 31);
        assert_eq!(last.status() >> 17, 0);
    }

    #[test]
    fn bulk_td_size_near_the_end() {
        let target = Target {
            address: 1,
            endpoint: 1,
        };
        let buffer = DmaRegion {
            phys: 0xF000,
            len: 0x1000 + 1000,
        };
        let trbs = build_td(&TransferBatch::bulk(target, Direction::In, buffer), 512).unwrap();
        assert_eq!(trbs.len(), 2);
        assert_eq!(trbs[0].status() >> 17, 2);
        assert_eq!(trbs[1].status() & 0x1_FFFF, 1000);
    }

    #[test]
    fn periodic_types_are_refused() {
        let buffer = DmaRegion { phys: 0x1000, len: 8 };
        for transfer_type in [TransferType::Interrupt, TransferType::Isochronous] {
            let batch = TransferBatch {
                transfer_type,
                ..TransferBatch::bulk(TARGET, Direction::In, buffer)
            };
            assert_eq!(build_td(&batch, 8), Err(Error::NotSupported));
        }
    }

    fn transfer_event(ptr: u64, code: CompletionCode, residual: u32, slot: SlotId, dci: u8) -> Trb {
        let control = (TrbType::TransferEvent as u32) << 10 | (dci as u32) << 16 | (slot.get() as u32) << 24;
        Trb::new(ptr, (code.raw() as u32) << 24 | residual, control)
    }

    /// Doorbells land in `words`; only the ring contents matter here.
    fn doorbells(words: &mut [u32; 16]) -> Registers<MappedMmio> {
        let base = NonNull::new(words.as_mut_ptr().cast::<u8>()).unwrap();
        let mmio = unsafe { MappedMmio::new(base, 64) };
        Registers::new(mmio, &Capabilities::default())
    }

    #[test]
    fn stall_on_the_data_stage_ends_the_td() {
        let (mut hal, _sim) = HostHal::new();
        let mut words = [0u32; 16];
        let regs = doorbells(&mut words);
        let mut ring = TrbRing::new(&mut hal, 16, true).unwrap();
        let mut scheduler = TransferScheduler::new();
        let slot = SlotId::new(1, 8).unwrap();

        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let buffer = DmaRegion { phys: 0x1000, len: 18 };
        let batch = TransferBatch::control(TARGET, Direction::In, setup, Some(buffer));
        let id = scheduler.schedule(&mut ring, &regs, slot, 1, &batch, 64).unwrap();

        let stall = transfer_event(ring.phys_at(1), CompletionCode::Stall, 18, slot, 1);
        assert_eq!(scheduler.handle_event(&mut ring, slot, &stall), Ok(id));
        assert_eq!(scheduler.take(id), Some(Err(Error::Transfer(CompletionCode::Stall))));
        assert_eq!(scheduler.outstanding(), 0);
        assert_eq!(ring.dequeue_ptr(), ring.phys_at(3));

        // The next TD is matched on its own TRBs only.
        let id = scheduler.schedule(&mut ring, &regs, slot, 1, &batch, 64).unwrap();
        let late = transfer_event(ring.phys_at(2), CompletionCode::Success, 0, slot, 1);
        assert!(scheduler.handle_event(&mut ring, slot, &late).is_err());
        let done = transfer_event(ring.phys_at(5), CompletionCode::Success, 0, slot, 1);
        assert_eq!(scheduler.handle_event(&mut ring, slot, &done), Ok(id));
        assert_eq!(scheduler.take(id), Some(Ok(18)));

        drop(regs);
        ring.release(&mut hal);
    }

    #[test]
    fn error_on_the_first_trb_of_a_wrapped_bulk_td() {
        let (mut hal, _sim) = HostHal::new();
        let mut words = [0u32; 16];
        let regs = doorbells(&mut words);
        let mut ring = TrbRing::new(&mut hal, 4, true).unwrap();
        let mut scheduler = TransferScheduler::new();
        let slot = SlotId::new(2, 8).unwrap();
        let target = Target { address: 2, endpoint: 1 };

        // Move the enqueue pointer so the next TD spans the Link TRB.
        let short = TransferBatch::bulk(target, Direction::In, DmaRegion { phys: 0x1000, len: 8 });
        for n in 0..3 {
            let id = scheduler.schedule(&mut ring, &regs, slot, 3, &short, 512).unwrap();
            let done = transfer_event(ring.phys_at(n), CompletionCode::Success, 0, slot, 3);
            assert_eq!(scheduler.handle_event(&mut ring, slot, &done), Ok(id));
            assert_eq!(scheduler.take(id), Some(Ok(8)));
        }
        assert_eq!(ring.enqueue_ptr(), ring.phys_at(3));

        // Two chained Normal TRBs: index 3, then index 0 after the wrap.
        let chained = DmaRegion { phys: 0xF000, len: 0x2000 };
        let batch = TransferBatch::bulk(target, Direction::In, chained);
        let id = scheduler.schedule(&mut ring, &regs, slot, 3, &batch, 512).unwrap();

        let other_endpoint = transfer_event(ring.phys_at(3), CompletionCode::Babble, 0, slot, 2);
        assert!(scheduler.handle_event(&mut ring, slot, &other_endpoint).is_err());

        let babble = transfer_event(ring.phys_at(3), CompletionCode::Babble, 0x1000, slot, 3);
        assert_eq!(scheduler.handle_event(&mut ring, slot, &babble), Ok(id));
        assert_eq!(scheduler.take(id), Some(Err(Error::Transfer(CompletionCode::Babble))));
        assert_eq!(ring.dequeue_ptr(), ring.phys_at(1));
        assert_eq!(ring.free(), 3);

        drop(regs);
        ring.release(&mut hal);
    }
}
