//! Device Context Base Address Array, scratchpad, and per-slot contexts.
//!
//! DCBAA entry 0 belongs to the scratchpad buffer array. Device slots are
//! numbered from 1, and [`SlotId`] cannot hold 0, so a device context can
//! never land in entry 0.

use alloc::vec::Vec;
use core::alloc::Layout;
use core::num::NonZeroU8;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::hal::{DmaBuffer, Hal};
use crate::ring::{TrbRing, RING_CAPACITY};
use crate::transfer::{Direction, TransferType};

/// Device Context Index of the default control endpoint.
pub const EP0_DCI: u8 = 1;
pub const ENDPOINTS: usize = 31;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(NonZeroU8);

impl SlotId {
    pub fn new(raw: u8, max_slots: u8) -> Result<Self> {
        match NonZeroU8::new(raw) {
            Some(id) if raw <= max_slots => Ok(SlotId(id)),
            _ => Err(Error::InvalidSlot(raw)),
        }
    }

    pub fn get(self) -> u8 {
        self.0.get()
    }

    fn index(self) -> usize {
        self.0.get() as usize
    }
}

impl core::fmt::Display for SlotId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Highest USB endpoint number.
pub const MAX_ENDPOINT: u8 = 15;

/// Device Context Index for an endpoint number and direction.
pub fn dci(endpoint: u8, direction: Direction) -> Result<u8> {
    if endpoint > MAX_ENDPOINT {
        return Err(Error::InvalidEndpoint(endpoint));
    }
    Ok(match (endpoint, direction) {
        (0, _) => EP0_DCI,
        (n, Direction::In) => n * 2 + 1,
        (n, Direction::Out) => n * 2,
    })
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointType {
    IsochOut = 1,
    BulkOut = 2,
    InterruptOut = 3,
    Control = 4,
    IsochIn = 5,
    BulkIn = 6,
    InterruptIn = 7,
}

impl EndpointType {
    pub fn new(transfer_type: TransferType, direction: Direction) -> Self {
        use Direction::*;
        match (transfer_type, direction) {
            (TransferType::Control, _) => EndpointType::Control,
            (TransferType::Isochronous, Out) => EndpointType::IsochOut,
            (TransferType::Isochronous, In) => EndpointType::IsochIn,
            (TransferType::Bulk, Out) => EndpointType::BulkOut,
            (TransferType::Bulk, In) => EndpointType::BulkIn,
            (TransferType::Interrupt, Out) => EndpointType::InterruptOut,
            (TransferType::Interrupt, In) => EndpointType::InterruptIn,
        }
    }
}

// Context structures (6.2). Kept in controller byte order.

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct InputControlContext {
    drop_flags: u32,
    add_flags: u32,
    _reserved: [u32; 6],
}

unsafe impl bytemuck::Zeroable for InputControlContext {}
unsafe impl bytemuck::Pod for InputControlContext {}

impl InputControlContext {
    pub fn new(add_flags: u32, drop_flags: u32) -> Self {
        InputControlContext {
            drop_flags: drop_flags.to_le(),
            add_flags: add_flags.to_le(),
            _reserved: [0; 6],
        }
    }

    pub fn add_flags(&self) -> u32 {
        u32::from_le(self.add_flags)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct SlotContext {
    dwords: [u32; 8],
}

unsafe impl bytemuck::Zeroable for SlotContext {}
unsafe impl bytemuck::Pod for SlotContext {}

impl SlotContext {
    pub fn new(route: u32, speed: u8, context_entries: u8, root_port: u8) -> Self {
        let mut ctx = SlotContext::default();
        ctx.set(0, (route & 0xF_FFFF) | (speed as u32 & 0xF) << 20 | (context_entries as u32 & 0x1F) << 27);
        ctx.set(1, (root_port as u32) << 16);
        ctx
    }

    fn get(&self, i: usize) -> u32 {
        u32::from_le(self.dwords[i])
    }

    fn set(&mut self, i: usize, value: u32) {
        self.dwords[i] = value.to_le();
    }

    pub fn context_entries(&self) -> u8 {
        (self.get(0) >> 27) as u8
    }

    pub fn set_context_entries(&mut self, entries: u8) {
        let dword = self.get(0) & !(0x1F << 27);
        self.set(0, dword | (entries as u32 & 0x1F) << 27);
    }

    pub fn root_port(&self) -> u8 {
        (self.get(1) >> 16) as u8
    }

    pub fn device_address(&self) -> u8 {
        self.get(3) as u8
    }

    pub fn slot_state(&self) -> u8 {
        (self.get(3) >> 27) as u8
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct EndpointContext {
    dwords: [u32; 8],
}

unsafe impl bytemuck::Zeroable for EndpointContext {}
unsafe impl bytemuck::Pod for EndpointContext {}

impl EndpointContext {
    pub fn new(ep_type: EndpointType, max_packet: u16, interval: u8, dequeue: u64, dcs: bool) -> Self {
        // Isochronous endpoints do not retry.
        let cerr = if matches!(ep_type, EndpointType::IsochIn | EndpointType::IsochOut) {
            0
        } else {
            3
        };
        let avg_trb_len = match ep_type {
            EndpointType::Control => 8,
            _ => max_packet as u32,
        };
        let dequeue = (dequeue & !0xF) | dcs as u64;

        let mut ctx = EndpointContext::default();
        ctx.dwords[0] = ((interval as u32) << 16).to_le();
        ctx.dwords[1] = (cerr << 1 | (ep_type as u32) << 3 | (max_packet as u32) << 16).to_le();
        ctx.dwords[2] = (dequeue as u32).to_le();
        ctx.dwords[3] = ((dequeue >> 32) as u32).to_le();
        ctx.dwords[4] = avg_trb_len.to_le();
        ctx
    }

    pub fn ep_type(&self) -> u8 {
        ((u32::from_le(self.dwords[1]) >> 3) & 0x7) as u8
    }

    pub fn max_packet(&self) -> u16 {
        (u32::from_le(self.dwords[1]) >> 16) as u16
    }

    pub fn tr_dequeue(&self) -> u64 {
        u32::from_le(self.dwords[2]) as u64 | (u32::from_le(self.dwords[3]) as u64) << 32
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Enabled,
    Addressed,
    Configured,
}

pub struct Endpoint {
    pub ring: TrbRing,
    pub ep_type: EndpointType,
    pub max_packet: u16,
}

pub struct DeviceSlot {
    pub state: SlotState,
    /// Output device context, owned by the controller while the slot is enabled.
    context: DmaBuffer,
    input: DmaBuffer,
    endpoints: [Option<Endpoint>; ENDPOINTS],
    pub port: u8,
    pub speed: u8,
    pub address: u8,
}

impl DeviceSlot {
    pub fn endpoint(&self, dci: u8) -> Option<&Endpoint> {
        self.endpoints.get((dci as usize).wrapping_sub(1))?.as_ref()
    }

    pub fn endpoint_mut(&mut self, dci: u8) -> Option<&mut Endpoint> {
        self.endpoints.get_mut((dci as usize).wrapping_sub(1))?.as_mut()
    }

    pub fn context_phys(&self) -> u64 {
        self.context.phys()
    }

    fn release<H: Hal>(self, hal: &mut H) {
        for ep in self.endpoints.into_iter().flatten() {
            ep.ring.release(hal);
        }
        hal.dma_free(self.input);
        hal.dma_free(self.context);
    }
}

/// Parameters for the Address Device input context.
#[derive(Copy, Clone, Debug)]
pub struct AddressParams {
    pub port: u8,
    /// Port speed ID (PORTSC speed field).
    pub speed: u8,
    pub route: u32,
    pub max_packet0: u16,
}

#[derive(Copy, Clone, Debug)]
pub struct EndpointDescriptor {
    /// Endpoint number, 1..=15.
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet: u16,
    pub interval: u8,
}

struct Scratchpad {
    array: DmaBuffer,
    pages: Vec<DmaBuffer>,
}

pub struct DeviceContextManager {
    dcbaa: DmaBuffer,
    slots: Vec<Option<DeviceSlot>>,
    scratchpad: Option<Scratchpad>,
    max_slots: u8,
    context_size: usize,
    bits64: bool,
}

impl DeviceContextManager {
    pub fn new<H: Hal>(hal: &mut H, max_slots: u8, context_size: usize, bits64: bool) -> Result<Self> {
        let layout = Layout::from_size_align((max_slots as usize + 1) * 8, 64).map_err(|_| Error::NoMemory)?;
        let dcbaa = hal.dma_alloc(layout, bits64)?;

        let mut slots = Vec::new();
        if slots.try_reserve_exact(max_slots as usize + 1).is_err() {
            hal.dma_free(dcbaa);
            return Err(Error::NoMemory);
        }
        slots.resize_with(max_slots as usize + 1, || None);

        debug!("DCBAA: {} slots at {:#x}", max_slots, dcbaa.phys());
        Ok(DeviceContextManager {
            dcbaa,
            slots,
            scratchpad: None,
            max_slots,
            context_size,
            bits64,
        })
    }

    /// Allocates the buffers the controller asked for in HCSPARAMS2 and
    /// installs the array at DCBAA[0].
    pub fn alloc_scratchpad<H: Hal>(&mut self, hal: &mut H, count: usize, page_size: usize) -> Result<()> {
        assert!(self.scratchpad.is_none());
        if count == 0 {
            self.dcbaa.write_u64(0, 0);
            return Ok(());
        }

        let array_layout = Layout::from_size_align(count * 8, 64).map_err(|_| Error::NoMemory)?;
        let page_layout = Layout::from_size_align(page_size, page_size).map_err(|_| Error::NoMemory)?;

        let mut array = hal.dma_alloc(array_layout, self.bits64)?;
        let mut pages = Vec::new();
        if pages.try_reserve_exact(count).is_err() {
            hal.dma_free(array);
            return Err(Error::NoMemory);
        }
        for i in 0..count {
            match hal.dma_alloc(page_layout, self.bits64) {
                Ok(page) => {
                    array.write_u64(i * 8, page.phys());
                    pages.push(page);
                }
                Err(err) => {
                    for page in pages {
                        hal.dma_free(page);
                    }
                    hal.dma_free(array);
                    return Err(err);
                }
            }
        }

        self.dcbaa.write_u64(0, array.phys());
        trace!("scratchpad: {} pages, array at {:#x}", count, array.phys());
        self.scratchpad = Some(Scratchpad { array, pages });
        Ok(())
    }

    pub fn free_scratchpad<H: Hal>(&mut self, hal: &mut H) {
        if let Some(scratchpad) = self.scratchpad.take() {
            self.dcbaa.write_u64(0, 0);
            for page in scratchpad.pages {
                hal.dma_free(page);
            }
            hal.dma_free(scratchpad.array);
        }
    }

    pub fn dcbaa_phys(&self) -> u64 {
        self.dcbaa.phys()
    }

    pub fn dcbaa_entry(&self, index: usize) -> u64 {
        self.dcbaa.read_u64(index * 8)
    }

    pub fn max_slots(&self) -> u8 {
        self.max_slots
    }

    pub fn slot_id(&self, raw: u8) -> Result<SlotId> {
        SlotId::new(raw, self.max_slots)
    }

    pub fn slot(&self, slot: SlotId) -> Option<&DeviceSlot> {
        self.slots.get(slot.index())?.as_ref()
    }

    pub fn slot_mut(&mut self, slot: SlotId) -> Result<&mut DeviceSlot> {
        self.slots
            .get_mut(slot.index())
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidSlot(slot.get()))
    }

    pub fn enabled_slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .filter_map(|(i, _)| NonZeroU8::new(i as u8).map(SlotId))
    }

    fn context_layout(&self, entries: usize) -> Result<Layout> {
        Layout::from_size_align(entries * self.context_size, 64).map_err(|_| Error::NoMemory)
    }

    /// The controller assigned `slot` through Enable Slot.
    pub fn enable_slot<H: Hal>(&mut self, hal: &mut H, slot: SlotId) -> Result<()> {
        if self.slot(slot).is_some() {
            return Err(Error::SlotInUse(slot.get()));
        }

        let context = hal.dma_alloc(self.context_layout(ENDPOINTS + 1)?, self.bits64)?;
        let input = match self
            .context_layout(ENDPOINTS + 2)
            .and_then(|layout| hal.dma_alloc(layout, self.bits64))
        {
            Ok(input) => input,
            Err(err) => {
                hal.dma_free(context);
                return Err(err);
            }
        };

        self.dcbaa.write_u64(slot.index() * 8, context.phys());
        self.slots[slot.index()] = Some(DeviceSlot {
            state: SlotState::Enabled,
            context,
            input,
            endpoints: core::array::from_fn(|_| None),
            port: 0,
            speed: 0,
            address: 0,
        });
        debug!("slot {} enabled", slot);
        Ok(())
    }

    pub fn disable_slot<H: Hal>(&mut self, hal: &mut H, slot: SlotId) -> Result<()> {
        let device = self.slots[slot.index()].take().ok_or(Error::InvalidSlot(slot.get()))?;
        self.dcbaa.write_u64(slot.index() * 8, 0);
        device.release(hal);
        debug!("slot {} disabled", slot);
        Ok(())
    }

    /// Builds the input context for Address Device and gives the slot its
    /// default control endpoint ring. Returns the input context address.
    pub fn prepare_address<H: Hal>(&mut self, hal: &mut H, slot: SlotId, params: AddressParams) -> Result<u64> {
        let context_size = self.context_size;
        let bits64 = self.bits64;
        let device = self.slot_mut(slot)?;
        if device.state != SlotState::Enabled {
            return Err(Error::InvalidState);
        }

        if device.endpoints[0].is_none() {
            device.endpoints[0] = Some(Endpoint {
                ring: TrbRing::new(hal, RING_CAPACITY, bits64)?,
                ep_type: EndpointType::Control,
                max_packet: params.max_packet0,
            });
        }
        let Some(ep0) = &device.endpoints[0] else {
            return Err(Error::Logic);
        };
        let ep0_ctx = EndpointContext::new(
            EndpointType::Control,
            params.max_packet0,
            0,
            ep0.ring.enqueue_ptr(),
            ep0.ring.producer_cycle(),
        );

        device.input.zero();
        device.input.write_pod(0, &InputControlContext::new(0b11, 0));
        device
            .input
            .write_pod(context_size, &SlotContext::new(params.route, params.speed, 1, params.port));
        device.input.write_pod(2 * context_size, &ep0_ctx);

        device.port = params.port;
        device.speed = params.speed;
        Ok(device.input.phys())
    }

    /// Address Device succeeded: pick up the address the controller chose.
    pub fn complete_address(&mut self, slot: SlotId) -> Result<u8> {
        let device = self.slot_mut(slot)?;
        let output: SlotContext = device.context.read_pod(0);
        device.address = output.device_address();
        device.state = SlotState::Addressed;
        Ok(device.address)
    }

    /// Builds a Configure Endpoint input context adding one endpoint, and
    /// allocates its ring. Returns the input context address and the DCI.
    pub fn prepare_endpoint<H: Hal>(
        &mut self,
        hal: &mut H,
        slot: SlotId,
        desc: EndpointDescriptor,
    ) -> Result<(u64, u8)> {
        let context_size = self.context_size;
        let bits64 = self.bits64;
        let device = self.slot_mut(slot)?;
        if device.state == SlotState::Enabled {
            return Err(Error::InvalidState);
        }
        if desc.number == 0 {
            return Err(Error::InvalidEndpoint(desc.number));
        }
        let dci = dci(desc.number, desc.direction)?;
        if device.endpoint(dci).is_some() {
            return Err(Error::InvalidState);
        }

        let ring = TrbRing::new(hal, RING_CAPACITY, bits64)?;
        let ep_type = EndpointType::new(desc.transfer_type, desc.direction);
        let ep_ctx = EndpointContext::new(
            ep_type,
            desc.max_packet,
            desc.interval,
            ring.enqueue_ptr(),
            ring.producer_cycle(),
        );

        let mut slot_ctx: SlotContext = device.context.read_pod(0);
        if slot_ctx.context_entries() < dci {
            slot_ctx.set_context_entries(dci);
        }

        device.input.zero();
        device.input.write_pod(0, &InputControlContext::new(1 | 1 << dci, 0));
        device.input.write_pod(context_size, &slot_ctx);
        device.input.write_pod((dci as usize + 1) * context_size, &ep_ctx);

        device.endpoints[dci as usize - 1] = Some(Endpoint {
            ring,
            ep_type,
            max_packet: desc.max_packet,
        });
        Ok((device.input.phys(), dci))
    }

    pub fn complete_configure(&mut self, slot: SlotId) -> Result<()> {
        self.slot_mut(slot)?.state = SlotState::Configured;
        Ok(())
    }

    /// Undo [`Self::prepare_endpoint`] after a failed Configure Endpoint.
    pub fn drop_endpoint<H: Hal>(&mut self, hal: &mut H, slot: SlotId, dci: u8) -> Result<()> {
        let device = self.slot_mut(slot)?;
        let ep = device
            .endpoints
            .get_mut((dci as usize).wrapping_sub(1))
            .and_then(Option::take)
            .ok_or(Error::InvalidEndpoint(dci))?;
        ep.ring.release(hal);
        Ok(())
    }

    pub fn endpoint_mut(&mut self, slot: SlotId, dci: u8) -> Result<&mut Endpoint> {
        self.slot_mut(slot)?
            .endpoint_mut(dci)
            .ok_or(Error::InvalidEndpoint(dci))
    }

    /// Frees the scratchpad, every slot and finally the array itself.
    pub fn release<H: Hal>(mut self, hal: &mut H) {
        self.free_scratchpad(hal);
        for (index, slot) in self.slots.iter_mut().enumerate().skip(1) {
            if let Some(device) = slot.take() {
                warn!("slot {} still enabled at teardown", index);
                device.release(hal);
            }
        }
        hal.dma_free(self.dcbaa);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostHal;

    #[test]
    fn slot_zero_does_not_exist() {
        assert_eq!(SlotId::new(0, 8), Err(Error::InvalidSlot(0)));
        assert_eq!(SlotId::new(9, 8), Err(Error::InvalidSlot(9)));
        assert_eq!(SlotId::new(8, 8).map(SlotId::get), Ok(8));
    }

    #[test]
    fn endpoint_indices() {
        assert_eq!(dci(0, Direction::Out), Ok(1));
        assert_eq!(dci(0, Direction::In), Ok(1));
        assert_eq!(dci(1, Direction::Out), Ok(2));
        assert_eq!(dci(1, Direction::In), Ok(3));
        assert_eq!(dci(15, Direction::In), Ok(31));
        assert_eq!(dci(16, Direction::Out), Err(Error::InvalidEndpoint(16)));
        assert_eq!(dci(200, Direction::In), Err(Error::InvalidEndpoint(200)));
    }

    #[test]
    fn enable_disable_touches_only_its_entry() {
        let (mut hal, _sim) = HostHal::new();
        let mut dcm = DeviceContextManager::new(&mut hal, 8, 32, true).unwrap();
        dcm.alloc_scratchpad(&mut hal, 2, 4096).unwrap();

        let one = dcm.slot_id(1).unwrap();
        let three = dcm.slot_id(3).unwrap();
        dcm.enable_slot(&mut hal, one).unwrap();
        let before: Vec<u64> = (0..3).map(|i| dcm.dcbaa_entry(i)).collect();

        dcm.enable_slot(&mut hal, three).unwrap();
        assert_ne!(dcm.dcbaa_entry(3), 0);
        assert_eq!(dcm.enable_slot(&mut hal, three), Err(Error::SlotInUse(3)));

        dcm.disable_slot(&mut hal, three).unwrap();
        assert_eq!(dcm.dcbaa_entry(3), 0);
        let after: Vec<u64> = (0..3).map(|i| dcm.dcbaa_entry(i)).collect();
        assert_eq!(before, after);
        assert_ne!(after[0], 0, "scratchpad array stays installed");
        assert_eq!(dcm.disable_slot(&mut hal, three), Err(Error::InvalidSlot(3)));

        dcm.release(&mut hal);
        assert_eq!(hal.live_allocations(), 0);
    }

    #[test]
    fn no_scratchpad_leaves_entry_zero_clear() {
        let (mut hal, _sim) = HostHal::new();
        let mut dcm = DeviceContextManager::new(&mut hal, 4, 64, false).unwrap();
        dcm.alloc_scratchpad(&mut hal, 0, 4096).unwrap();
        assert_eq!(dcm.dcbaa_entry(0), 0);
        dcm.release(&mut hal);
        assert_eq!(hal.live_allocations(), 0);
    }

    #[test]
    fn address_input_context() {
        let (mut hal, _sim) = HostHal::new();
        let mut dcm = DeviceContextManager::new(&mut hal, 4, 32, true).unwrap();
        let slot = dcm.slot_id(2).unwrap();
        dcm.enable_slot(&mut hal, slot).unwrap();

        let params = AddressParams {
            port: 3,
            speed: 4,
            route: 0,
            max_packet0: 512,
        };
        let input = dcm.prepare_address(&mut hal, slot, params).unwrap();
        let device = dcm.slot(slot).unwrap();
        assert_eq!(input, device.input.phys());

        let icc: InputControlContext = device.input.read_pod(0);
        assert_eq!(icc.add_flags(), 0b11);
        let slot_ctx: SlotContext = device.input.read_pod(32);
        assert_eq!(slot_ctx.context_entries(), 1);
        assert_eq!(slot_ctx.root_port(), 3);
        let ep0: EndpointContext = device.input.read_pod(64);
        assert_eq!(ep0.ep_type(), EndpointType::Control as u8);
        assert_eq!(ep0.max_packet(), 512);
        let ring = &device.endpoint(EP0_DCI).unwrap().ring;
        assert_eq!(ep0.tr_dequeue(), ring.enqueue_ptr() | 1);

        // Endpoints need an addressed device.
        let desc = EndpointDescriptor {
            number: 1,
            direction: Direction::In,
            transfer_type: TransferType::Bulk,
            max_packet: 512,
            interval: 0,
        };
        assert_eq!(dcm.prepare_endpoint(&mut hal, slot, desc).err(), Some(Error::InvalidState));

        dcm.disable_slot(&mut hal, slot).unwrap();
        dcm.release(&mut hal);
        assert_eq!(hal.live_allocations(), 0);
    }

    #[test]
    fn configure_input_context() {
        let (mut hal, _sim) = HostHal::new();
        let mut dcm = DeviceContextManager::new(&mut hal, 4, 64, true).unwrap();
        let slot = dcm.slot_id(1).unwrap();
        dcm.enable_slot(&mut hal, slot).unwrap();
        let params = AddressParams {
            port: 1,
            speed: 3,
            route: 0,
            max_packet0: 64,
        };
        dcm.prepare_address(&mut hal, slot, params).unwrap();
        dcm.complete_address(slot).unwrap();

        let desc = EndpointDescriptor {
            number: 2,
            direction: Direction::In,
            transfer_type: TransferType::Bulk,
            max_packet: 512,
            interval: 0,
        };
        let (_, dci) = dcm.prepare_endpoint(&mut hal, slot, desc).unwrap();
        assert_eq!(dci, 5);

        let device = dcm.slot(slot).unwrap();
        let icc: InputControlContext = device.input.read_pod(0);
        assert_eq!(icc.add_flags(), 1 | 1 << 5);
        let slot_ctx: SlotContext = device.input.read_pod(64);
        assert_eq!(slot_ctx.context_entries(), 5);
        let ep: EndpointContext = device.input.read_pod(6 * 64);
        assert_eq!(ep.ep_type(), EndpointType::BulkIn as u8);

        dcm.drop_endpoint(&mut hal, slot, dci).unwrap();
        assert!(dcm.endpoint_mut(slot, dci).is_err());

        dcm.release(&mut hal);
        assert_eq!(hal.live_allocations(), 0);
    }
}
