//! The host controller: bring-up, interrupt and poll entry points, device
//! slot commands and teardown.

use alloc::vec::Vec;

use log::{debug, error, info, trace, warn};
use tinyvec::ArrayVec;

use crate::bus::Bus;
use crate::command::{CommandCompletion, CommandHandle, CommandProcessor};
use crate::context::{self, AddressParams, DeviceContextManager, EndpointDescriptor, SlotId};
use crate::error::{ConfigError, Error, Handshake, Result};
use crate::event::{self, EventRunReport, EventSink};
use crate::extcap::{self, PortSpeedTable, LEGSUP_BIOS_OWNED, LEGSUP_OS_OWNED};
use crate::hal::{Hal, HwResources, MemRange, Mmio};
use crate::irq::IrqCode;
use crate::regs::{
    cap, op, rt, Capabilities, Iman, Registers, UsbCmd, UsbSts, CRCR_RCS, STATUS_ACK_MASK,
};
use crate::rh::{PortChange, RootHub};
use crate::ring::{EventRing, TrbRing, EVENT_RING_SEGMENTS, EVENT_SEGMENT_TRBS, RING_CAPACITY};
use crate::transfer::{TransferBatch, TransferId, TransferType};
use crate::trb::Trb;

const POLL_INTERVAL_US: u32 = 1000;

// Handshake bounds, in poll intervals (ms).
pub const HALT_TIMEOUT_MS: u32 = 16;
pub const RESET_TIMEOUT_MS: u32 = 1000;
pub const CNR_TIMEOUT_MS: u32 = 1000;
pub const LEGACY_TIMEOUT_MS: u32 = 1000;
pub const COMMAND_TIMEOUT_MS: u32 = 1000;
pub const TRANSFER_TIMEOUT_MS: u32 = 5000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Reset,
    WaitingReady,
    Configured,
    Running,
    Halted,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LegacyHandoff {
    /// No USB Legacy Support capability; the controller was never shared.
    NotPresent,
    Acquired,
    /// The BIOS kept its semaphore. Bring-up may still go on.
    TimedOut,
}

/// Pieces of `init_memory`, in acquisition order.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum Step {
    #[default]
    Dcbaa,
    CommandRing,
    EventRing,
    Scratchpad,
    Commands,
    RootHub,
    Bus,
}

const INIT_ORDER: [Step; 7] = [
    Step::Dcbaa,
    Step::CommandRing,
    Step::EventRing,
    Step::Scratchpad,
    Step::Commands,
    Step::RootHub,
    Step::Bus,
];

/// Teardown order. The scratchpad goes with the DCBAA.
const FINI_ORDER: [Step; 6] = [
    Step::Bus,
    Step::CommandRing,
    Step::EventRing,
    Step::Dcbaa,
    Step::Commands,
    Step::RootHub,
];

#[derive(Default)]
struct Memory {
    dcm: Option<DeviceContextManager>,
    command_ring: Option<TrbRing>,
    event_ring: Option<EventRing>,
    commands: Option<CommandProcessor>,
    rh: Option<RootHub>,
    bus: Option<Bus>,
}

pub struct Controller<H: Hal> {
    hal: H,
    range: Option<MemRange>,
    regs: Option<Registers<H::Mmio>>,
    caps: Capabilities,
    speeds: PortSpeedTable,
    legacy: Option<usize>,
    state: ControllerState,
    mem: Memory,
}

/// Routes events to the parts of the controller that own them.
struct Dispatch<'a, M> {
    regs: &'a Registers<M>,
    speeds: &'a PortSpeedTable,
    commands: &'a mut CommandProcessor,
    command_ring: &'a mut TrbRing,
    rh: &'a mut RootHub,
    dcm: &'a mut DeviceContextManager,
    bus: &'a mut Bus,
}

impl<M: Mmio> EventSink for Dispatch<'_, M> {
    fn command_completion(&mut self, event: &Trb) -> Result<()> {
        self.commands.handle_completion(self.command_ring, event)?;
        Ok(())
    }

    fn port_status_change(&mut self, event: &Trb) -> Result<()> {
        self.rh
            .handle_port_status_change_event(self.regs, self.speeds, event)
    }

    fn transfer_event(&mut self, event: &Trb) -> Result<()> {
        let slot = self.dcm.slot_id(event.slot_id())?;
        let endpoint = self.dcm.endpoint_mut(slot, event.endpoint_id())?;
        self.bus.transfers.handle_event(&mut endpoint.ring, slot, event)?;
        Ok(())
    }
}

/// Max packet size to start EP0 with, by protocol speed ID.
fn default_max_packet0(speed: u8) -> u16 {
    match speed {
        2 => 8,
        1 | 3 => 64,
        _ => 512,
    }
}

impl<H: Hal> Controller<H> {
    pub fn new(hal: H) -> Self {
        Controller {
            hal,
            range: None,
            regs: None,
            caps: Capabilities::default(),
            speeds: PortSpeedTable::default(),
            legacy: None,
            state: ControllerState::Uninitialized,
            mem: Memory::default(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn speeds(&self) -> &PortSpeedTable {
        &self.speeds
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn device_contexts(&self) -> Option<&DeviceContextManager> {
        self.mem.dcm.as_ref()
    }

    pub fn root_hub(&self) -> Option<&RootHub> {
        self.mem.rh.as_ref()
    }

    /// Port connects and disconnects seen since the last call.
    pub fn port_changes(&mut self) -> Vec<PortChange> {
        self.mem.rh.as_mut().map(RootHub::take_changes).unwrap_or_default()
    }

    fn regs(&self) -> Result<&Registers<H::Mmio>> {
        self.regs.as_ref().ok_or(Error::InvalidState)
    }

    /// Map the registers and read what the controller can do.
    pub fn init_mmio(&mut self, hw: &HwResources) -> Result<()> {
        if self.regs.is_some() {
            return Err(Error::InvalidState);
        }
        let [range] = hw.mem_ranges[..] else {
            error!("unexpected MMIO area, bailing out");
            return Err(ConfigError::UnexpectedMmioRanges(hw.mem_ranges.len()).into());
        };
        debug!("MMIO area at {:#x} (size {:#x})", range.base, range.size);
        if range.size < cap::SIZE {
            return Err(ConfigError::RegionTooSmall(range.size).into());
        }

        let mmio = self.hal.map_mmio(range)?;
        let caps = Capabilities::read(&mmio);
        debug!("capabilities: {:?}", caps);

        let mut speeds = PortSpeedTable::default();
        let info = match extcap::parse(&mmio, caps.xecp, range.size, &mut speeds) {
            Ok(info) => info,
            Err(err) => {
                self.hal.unmap_mmio(mmio);
                return Err(err);
            }
        };

        self.range = Some(range);
        self.regs = Some(Registers::new(mmio, &caps));
        self.caps = caps;
        self.speeds = speeds;
        self.legacy = info.legacy;
        info!(
            "xHCI {:x}.{:02x}: {} slots, {} ports, {} scratchpads, {}-byte contexts",
            caps.hci_version >> 8,
            caps.hci_version & 0xFF,
            caps.max_slots,
            caps.max_ports,
            caps.max_scratchpads,
            caps.context_size
        );
        Ok(())
    }

    /// The interrupt pre-filter program and the IRQ it is meant for.
    pub fn irq_code_gen(&self, hw: &HwResources) -> Result<(IrqCode, u32)> {
        let [irq] = hw.irqs[..] else {
            info!("unexpected HW resources to enable interrupts");
            return Err(ConfigError::UnexpectedIrqs(hw.irqs.len()).into());
        };
        let range = self.range.ok_or(Error::InvalidState)?;
        Ok((IrqCode::new(range, self.caps.cap_length, self.caps.rtsoff), irq))
    }

    /// Allocate rings, DCBAA and bookkeeping. On failure everything already
    /// acquired is released again, in reverse.
    pub fn init_memory(&mut self) -> Result<()> {
        if self.regs.is_none() || self.mem.dcm.is_some() {
            return Err(Error::InvalidState);
        }

        let mut acquired: ArrayVec<[Step; 7]> = ArrayVec::new();
        for step in INIT_ORDER {
            if let Err(err) = self.acquire(step) {
                error!("init_memory: {:?} failed: {}", step, err);
                while let Some(step) = acquired.pop() {
                    self.release(step);
                }
                return Err(err);
            }
            acquired.push(step);
        }
        Ok(())
    }

    fn page_size(&self) -> usize {
        let bits = self.regs.as_ref().map_or(1, |r| r.op_read(op::PAGESIZE) & 0xFFFF);
        1 << (12 + bits.trailing_zeros().min(15))
    }

    fn acquire(&mut self, step: Step) -> Result<()> {
        let caps = self.caps;
        let page_size = self.page_size();
        let hal = &mut self.hal;
        let mem = &mut self.mem;
        trace!("acquire {:?}", step);
        match step {
            Step::Dcbaa => {
                mem.dcm = Some(DeviceContextManager::new(
                    hal,
                    caps.max_slots,
                    caps.context_size,
                    caps.ac64,
                )?)
            }
            Step::CommandRing => mem.command_ring = Some(TrbRing::new(hal, RING_CAPACITY, caps.ac64)?),
            Step::EventRing => {
                mem.event_ring = Some(EventRing::new(
                    hal,
                    EVENT_RING_SEGMENTS,
                    EVENT_SEGMENT_TRBS,
                    caps.ac64,
                )?)
            }
            Step::Scratchpad => mem
                .dcm
                .as_mut()
                .ok_or(Error::Logic)?
                .alloc_scratchpad(hal, caps.max_scratchpads, page_size)?,
            Step::Commands => mem.commands = Some(CommandProcessor::new()),
            Step::RootHub => mem.rh = Some(RootHub::new(caps.max_ports)?),
            Step::Bus => mem.bus = Some(Bus::new()?),
        }
        Ok(())
    }

    fn release(&mut self, step: Step) {
        let hal = &mut self.hal;
        let mem = &mut self.mem;
        trace!("release {:?}", step);
        match step {
            Step::Dcbaa => {
                if let Some(dcm) = mem.dcm.take() {
                    dcm.release(hal);
                }
            }
            Step::CommandRing => {
                if let Some(ring) = mem.command_ring.take() {
                    ring.release(hal);
                }
            }
            Step::EventRing => {
                if let Some(ring) = mem.event_ring.take() {
                    ring.release(hal);
                }
            }
            Step::Scratchpad => {
                if let Some(dcm) = mem.dcm.as_mut() {
                    dcm.free_scratchpad(hal);
                }
            }
            Step::Commands => {
                if let Some(mut commands) = mem.commands.take() {
                    commands.clear();
                }
            }
            Step::RootHub => mem.rh = None,
            Step::Bus => {
                if let Some(mut bus) = mem.bus.take() {
                    bus.fini();
                }
            }
        }
    }

    /// Take the controller over from the BIOS (4.22.1).
    pub fn claim(&mut self) -> Result<LegacyHandoff> {
        let regs = self.regs.as_ref().ok_or(Error::InvalidState)?;
        let Some(legsup) = self.legacy else {
            return Ok(LegacyHandoff::NotPresent);
        };
        let mmio = regs.mmio();

        debug!("LEGSUP: {:#010x}", mmio.read32(legsup));
        mmio.write32(legsup, mmio.read32(legsup) | LEGSUP_OS_OWNED);
        for elapsed in 0..=LEGACY_TIMEOUT_MS {
            let value = mmio.read32(legsup);
            if value & LEGSUP_BIOS_OWNED == 0 {
                debug_assert!(value & LEGSUP_OS_OWNED != 0);
                debug!("LEGSUP: BIOS released the controller after {} ms", elapsed);
                return Ok(LegacyHandoff::Acquired);
            }
            self.hal.usleep(POLL_INTERVAL_US);
        }
        error!("BIOS did not release xHCI legacy hold");
        Ok(LegacyHandoff::TimedOut)
    }

    /// Poll `done` every millisecond, at most `bound_ms` times.
    fn handshake(
        &mut self,
        what: Handshake,
        bound_ms: u32,
        done: impl Fn(&Registers<H::Mmio>) -> bool,
    ) -> Result<()> {
        let regs = self.regs.as_ref().ok_or(Error::InvalidState)?;
        for _ in 0..bound_ms {
            if done(regs) {
                return Ok(());
            }
            self.hal.usleep(POLL_INTERVAL_US);
        }
        if done(regs) {
            return Ok(());
        }
        error!("{:?} handshake timed out after {} ms", what, bound_ms);
        Err(Error::Timeout(what))
    }

    fn halt(&mut self) -> Result<()> {
        let regs = self.regs()?;
        regs.set_usbcmd(regs.usbcmd() - UsbCmd::RUN_STOP);
        self.handshake(Handshake::Halt, HALT_TIMEOUT_MS, |r| {
            r.usbsts().contains(UsbSts::HCH)
        })
    }

    /// Halt, then reset the controller (4.2).
    pub fn reset(&mut self) -> Result<()> {
        self.state = ControllerState::Reset;
        let result = self.halt().and_then(|()| {
            let regs = self.regs()?;
            regs.set_usbcmd(regs.usbcmd() | UsbCmd::HCRST);
            self.handshake(Handshake::Reset, RESET_TIMEOUT_MS, |r| {
                !r.usbcmd().contains(UsbCmd::HCRST)
            })
        });
        if result.is_err() {
            self.state = ControllerState::Halted;
        }
        result
    }

    /// Reset, program the controller with our memory and set it running.
    pub fn start(&mut self, irq: bool) -> Result<()> {
        if self.mem.bus.is_none() {
            return Err(Error::InvalidState);
        }
        self.reset()?;

        self.state = ControllerState::WaitingReady;
        if let Err(err) = self.handshake(Handshake::ControllerNotReady, CNR_TIMEOUT_MS, |r| {
            !r.usbsts().contains(UsbSts::CNR)
        }) {
            self.state = ControllerState::Halted;
            return Err(err);
        }

        self.forget_device_state();

        let regs = self.regs.as_ref().ok_or(Error::InvalidState)?;
        let (Some(dcm), Some(command_ring), Some(event_ring), Some(rh)) = (
            self.mem.dcm.as_ref(),
            self.mem.command_ring.as_mut(),
            self.mem.event_ring.as_mut(),
            self.mem.rh.as_mut(),
        ) else {
            return Err(Error::InvalidState);
        };

        regs.write_op64(op::DCBAAP_LO, op::DCBAAP_HI, dcm.dcbaa_phys());
        let config = regs.op_read(op::CONFIG) & !0xFF;
        regs.op_write(op::CONFIG, config | self.caps.max_slots as u32);

        command_ring.discard_outstanding();
        let crcr = command_ring.enqueue_ptr() | if command_ring.producer_cycle() { CRCR_RCS } else { 0 };
        regs.write_op64(op::CRCR_LO, op::CRCR_HI, crcr);

        event_ring.reset();
        regs.intr_write(rt::ERSTSZ, event_ring.segment_count() as u32);
        regs.write_intr64(rt::ERDP_LO, rt::ERDP_HI, event_ring.dequeue_ptr());
        regs.write_intr64(rt::ERSTBA_LO, rt::ERSTBA_HI, event_ring.erst_phys());
        self.state = ControllerState::Configured;

        if irq {
            regs.set_iman(regs.iman() | Iman::IE);
            regs.set_usbcmd(regs.usbcmd() | UsbCmd::INTE);
        }
        regs.set_usbcmd(regs.usbcmd() | UsbCmd::RUN_STOP);
        self.state = ControllerState::Running;

        // A reset changes every port without raising events.
        rh.handle_port_change(regs, &self.speeds);
        info!("controller running ({})", if irq { "interrupts" } else { "polling" });
        Ok(())
    }

    /// Commands, slots and transfers do not survive a controller reset.
    fn forget_device_state(&mut self) {
        let (Some(dcm), Some(commands), Some(bus)) = (
            self.mem.dcm.as_mut(),
            self.mem.commands.as_mut(),
            self.mem.bus.as_mut(),
        ) else {
            return;
        };
        commands.clear();
        bus.fini();
        let stale: Vec<SlotId> = dcm.enabled_slots().collect();
        for slot in stale {
            warn!("slot {} lost in controller reset", slot);
            if let Err(err) = dcm.disable_slot(&mut self.hal, slot) {
                warn!("slot {}: {}", slot, err);
            }
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        self.halt()?;
        self.state = ControllerState::Halted;
        info!("controller halted");
        Ok(())
    }

    /// Status for the poll path: acknowledges what the pre-filter program
    /// would have acknowledged. Empty when interrupter 0 has nothing pending.
    pub fn status(&mut self) -> Result<UsbSts> {
        let regs = self.regs()?;
        let iman = regs.iman();
        if !iman.contains(Iman::IP) {
            return Ok(UsbSts::empty());
        }
        let status = regs.usbsts();
        regs.ack_usbsts(status & STATUS_ACK_MASK);
        regs.set_iman(iman);
        trace!("polled status: {:?}", status);
        Ok(status)
    }

    /// Handle a status word, either from the pre-filter program or [`Self::status`].
    pub fn interrupt(&mut self, status: UsbSts) -> Result<EventRunReport> {
        let mut status = status;
        let mut report = EventRunReport::default();
        let mut host_error = false;

        if status.contains(UsbSts::PCD) {
            trace!("root hub interrupt");
            let regs = self.regs.as_ref().ok_or(Error::InvalidState)?;
            if let Some(rh) = self.mem.rh.as_mut() {
                rh.handle_port_change(regs, &self.speeds);
            }
            status -= UsbSts::PCD;
        }

        if status.contains(UsbSts::HSE) {
            error!("host system error, controller halted");
            self.state = ControllerState::Halted;
            host_error = true;
            status -= UsbSts::HSE;
        }

        if status.contains(UsbSts::EINT) {
            trace!("event interrupt, running the event ring");
            report = self.run_event_ring()?;
            status -= UsbSts::EINT;
        }

        if status.contains(UsbSts::SRE) {
            error!("save/restore error");
            status -= UsbSts::SRE;
        }

        if host_error {
            return Err(Error::HostSystemError);
        }
        if !status.is_empty() {
            error!("non-zero status after interrupt handling ({:#010x})", status.bits());
            return Err(Error::UnhandledStatus(status.bits()));
        }
        Ok(report)
    }

    /// Poll-mode replacement for the interrupt handler.
    pub fn poll(&mut self) -> Result<EventRunReport> {
        let status = self.status()?;
        if status.is_empty() {
            return Ok(EventRunReport::default());
        }
        self.interrupt(status)
    }

    fn run_event_ring(&mut self) -> Result<EventRunReport> {
        let regs = self.regs.as_ref().ok_or(Error::InvalidState)?;
        let mem = &mut self.mem;
        let (Some(event_ring), Some(commands), Some(command_ring), Some(rh), Some(dcm), Some(bus)) = (
            mem.event_ring.as_mut(),
            mem.commands.as_mut(),
            mem.command_ring.as_mut(),
            mem.rh.as_mut(),
            mem.dcm.as_mut(),
            mem.bus.as_mut(),
        ) else {
            return Err(Error::InvalidState);
        };

        let mut sink = Dispatch {
            regs,
            speeds: &self.speeds,
            commands,
            command_ring,
            rh,
            dcm,
            bus,
        };
        Ok(event::run(event_ring, regs, &mut sink))
    }

    /// Drive the controller between waits. Only a halted controller ends the wait early.
    fn poll_for_completion(&mut self) -> Result<()> {
        match self.poll() {
            Err(Error::HostSystemError) => Err(Error::HostSystemError),
            Err(err) => {
                warn!("poll: {}", err);
                Ok(())
            }
            Ok(_) => Ok(()),
        }
    }

    pub fn ring_doorbell(&self, doorbell: u8, target: u32) -> Result<()> {
        self.regs()?.ring_doorbell(doorbell, target);
        Ok(())
    }

    pub fn submit_command(&mut self, trb: Trb) -> Result<CommandHandle> {
        if self.state != ControllerState::Running {
            return Err(Error::InvalidState);
        }
        let regs = self.regs.as_ref().ok_or(Error::InvalidState)?;
        let (Some(commands), Some(ring)) = (self.mem.commands.as_mut(), self.mem.command_ring.as_mut()) else {
            return Err(Error::InvalidState);
        };
        commands.submit(ring, regs, trb)
    }

    /// Wait (polling) for a command to complete, whatever its completion code.
    pub fn wait_command(&mut self, handle: CommandHandle) -> Result<CommandCompletion> {
        let mut waited = 0;
        loop {
            self.poll_for_completion()?;
            let commands = self.mem.commands.as_mut().ok_or(Error::InvalidState)?;
            if let Some(completion) = commands.take(handle) {
                return Ok(completion);
            }
            if !commands.is_pending(handle) {
                return Err(Error::InvalidState);
            }
            if waited >= COMMAND_TIMEOUT_MS {
                commands.forget(handle);
                error!("command at {:#x} timed out", handle.trb_phys());
                return Err(Error::CommandTimeout);
            }
            self.hal.usleep(POLL_INTERVAL_US);
            waited += 1;
        }
    }

    /// Submit, wait, and turn a failure completion code into an error.
    pub fn command(&mut self, trb: Trb) -> Result<CommandCompletion> {
        let handle = self.submit_command(trb)?;
        self.wait_command(handle)?.into_result()
    }

    pub fn enable_slot(&mut self) -> Result<SlotId> {
        let completion = self.command(Trb::enable_slot(0))?;
        let dcm = self.mem.dcm.as_mut().ok_or(Error::InvalidState)?;
        let slot = dcm.slot_id(completion.slot_id)?;
        if let Err(err) = dcm.enable_slot(&mut self.hal, slot) {
            error!("no memory for slot {}: {}", slot, err);
            if let Err(undo) = self.command(Trb::disable_slot(slot.get())) {
                warn!("could not give slot {} back: {}", slot, undo);
            }
            return Err(err);
        }
        Ok(slot)
    }

    /// Address the device on root hub `port`. Returns its USB address.
    pub fn address_device(&mut self, slot: SlotId, port: u8) -> Result<u8> {
        let status = self
            .mem
            .rh
            .as_ref()
            .and_then(|rh| rh.port(port))
            .ok_or(Error::InvalidState)?;
        if !status.connected {
            return Err(Error::InvalidState);
        }

        let params = AddressParams {
            port,
            speed: status.speed,
            route: 0,
            max_packet0: default_max_packet0(status.speed),
        };
        let dcm = self.mem.dcm.as_mut().ok_or(Error::InvalidState)?;
        let input = dcm.prepare_address(&mut self.hal, slot, params)?;

        self.command(Trb::address_device(input, slot.get(), false))?;

        let dcm = self.mem.dcm.as_mut().ok_or(Error::InvalidState)?;
        let address = dcm.complete_address(slot)?;
        self.mem
            .bus
            .as_mut()
            .ok_or(Error::InvalidState)?
            .register(address, slot)?;
        info!("slot {}: device on port {} has address {}", slot, port, address);
        Ok(address)
    }

    /// Add an endpoint to an addressed device. Returns its DCI.
    pub fn configure_endpoint(&mut self, slot: SlotId, desc: EndpointDescriptor) -> Result<u8> {
        let dcm = self.mem.dcm.as_mut().ok_or(Error::InvalidState)?;
        let (input, dci) = dcm.prepare_endpoint(&mut self.hal, slot, desc)?;

        let result = self.command(Trb::configure_endpoint(input, slot.get(), false));
        let dcm = self.mem.dcm.as_mut().ok_or(Error::InvalidState)?;
        match result {
            Ok(_) => {
                dcm.complete_configure(slot)?;
                debug!("slot {}: endpoint {} configured", slot, dci);
                Ok(dci)
            }
            Err(err) => {
                dcm.drop_endpoint(&mut self.hal, slot, dci)?;
                Err(err)
            }
        }
    }

    pub fn disable_slot(&mut self, slot: SlotId) -> Result<()> {
        if self.device_contexts().and_then(|d| d.slot(slot)).is_none() {
            return Err(Error::InvalidSlot(slot.get()));
        }
        self.command(Trb::disable_slot(slot.get()))?;

        if let Some(bus) = self.mem.bus.as_mut() {
            bus.remove_slot(slot);
        }
        self.mem
            .dcm
            .as_mut()
            .ok_or(Error::InvalidState)?
            .disable_slot(&mut self.hal, slot)
    }

    /// Put a transfer on its endpoint ring and ring the doorbell.
    pub fn schedule(&mut self, batch: &TransferBatch) -> Result<TransferId> {
        debug!(
            "EP({}:{}) {:?} transfer of {} bytes",
            batch.target.address,
            batch.target.endpoint,
            batch.transfer_type,
            batch.len()
        );
        if batch.target.address == 0 {
            error!("attempted to schedule transfer to address 0");
            return Err(Error::InvalidTarget);
        }
        if matches!(
            batch.transfer_type,
            TransferType::Isochronous | TransferType::Interrupt
        ) {
            return Err(Error::NotSupported);
        }
        if self.state != ControllerState::Running {
            return Err(Error::InvalidState);
        }

        let regs = self.regs.as_ref().ok_or(Error::InvalidState)?;
        let (Some(dcm), Some(bus)) = (self.mem.dcm.as_mut(), self.mem.bus.as_mut()) else {
            return Err(Error::InvalidState);
        };
        let slot = bus.slot_for(batch.target.address).ok_or(Error::InvalidTarget)?;
        let dci = context::dci(batch.target.endpoint, batch.direction)?;
        let endpoint = dcm.endpoint_mut(slot, dci)?;
        let max_packet = endpoint.max_packet;
        bus.transfers
            .schedule(&mut endpoint.ring, regs, slot, dci, batch, max_packet)
    }

    /// Wait (polling) for a transfer. Returns the number of bytes moved.
    pub fn wait_transfer(&mut self, id: TransferId) -> Result<usize> {
        let mut waited = 0;
        loop {
            self.poll_for_completion()?;
            let transfers = &mut self.mem.bus.as_mut().ok_or(Error::InvalidState)?.transfers;
            if let Some(result) = transfers.take(id) {
                return result;
            }
            if !transfers.is_pending(id) {
                return Err(Error::InvalidState);
            }
            if waited >= TRANSFER_TIMEOUT_MS {
                transfers.forget(id);
                error!("transfer {:?} timed out", id);
                return Err(Error::TransferTimeout);
            }
            self.hal.usleep(POLL_INTERVAL_US);
            waited += 1;
        }
    }

    /// Release everything and unmap the registers. Safe to call at any point
    /// after `new`, including after a failed bring-up.
    pub fn fini(&mut self) {
        if self.state == ControllerState::Running {
            if let Err(err) = self.stop() {
                warn!("fini: {}", err);
            }
        }
        for step in FINI_ORDER {
            self.release(step);
        }
        if let Some(regs) = self.regs.take() {
            self.hal.unmap_mmio(regs.into_mmio());
        }
        self.range = None;
        self.legacy = None;
        self.speeds = PortSpeedTable::default();
        self.state = ControllerState::Uninitialized;
        info!("controller finalized");
    }
}
