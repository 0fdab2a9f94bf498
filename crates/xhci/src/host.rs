//! Host-side stand-ins for the kernel underneath the driver.
//!
//! [`HostHal`] hands out heap memory as DMA memory (physical address ==
//! virtual address) and keeps a ledger of it, so tests can tell leaks and
//! double frees apart. [`SimMmio`] is a register file with just enough of a
//! controller behind it to run the bring-up handshakes, the command ring,
//! the event ring and control/bulk transfer rings.

use std::alloc::{alloc_zeroed, dealloc};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::vec;
use std::vec::Vec;

use core::alloc::Layout;
use core::ptr::NonNull;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::extcap::{CAP_LEGACY_SUPPORT, CAP_SUPPORTED_PROTOCOL, LEGSUP_BIOS_OWNED, LEGSUP_OS_OWNED};
use crate::hal::{DmaBuffer, Hal, HwResources, MemRange, Mmio};
use crate::regs::{cap, op, rt, Iman, PortSc, UsbCmd, UsbSts, ERDP_EHB, STATUS_ACK_MASK};
use crate::trb::{CompletionCode, Trb, TrbFlags, TrbType, TRB_SIZE};

pub const SIM_BASE: u64 = 0xfe00_0000;
pub const SIM_LEN: usize = 0x4000;
pub const SIM_IRQ: u32 = 11;

pub const CAP_LENGTH: usize = 0x20;
pub const RTSOFF: usize = 0x1000;
pub const DBOFF: usize = 0x2000;
pub const XECP: usize = 0x3000;

const OP: usize = CAP_LENGTH;
const IR0: usize = RTSOFF + rt::IR0;

/// Builds an extended capability list, linked in the order given.
#[derive(Clone, Debug, Default)]
pub struct ExtCapBuilder {
    caps: Vec<Vec<u32>>,
}

impl ExtCapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn legacy(mut self, bios_owned: bool) -> Self {
        let sem = if bios_owned { LEGSUP_BIOS_OWNED } else { 0 };
        self.caps.push(vec![CAP_LEGACY_SUPPORT as u32 | sem, 0]);
        self
    }

    pub fn protocol(mut self, major: u8, minor: u8, name: [u8; 4], psi: &[u32]) -> Self {
        let mut dwords = vec![
            CAP_SUPPORTED_PROTOCOL as u32 | (minor as u32) << 16 | (major as u32) << 24,
            u32::from_le_bytes(name),
            (psi.len() as u32) << 28,
            0,
        ];
        dwords.extend_from_slice(psi);
        self.caps.push(dwords);
        self
    }

    /// A capability this driver does not know about.
    pub fn raw(mut self, id: u8) -> Self {
        self.caps.push(vec![id as u32, 0]);
        self
    }

    fn build(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (i, cap) in self.caps.iter().enumerate() {
            let mut cap = cap.clone();
            if i + 1 < self.caps.len() {
                cap[0] |= (cap.len() as u32) << 8;
            }
            out.extend(cap);
        }
        out
    }
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub max_slots: u8,
    pub max_ports: u8,
    pub scratchpads: u16,
    pub context_size: usize,
    pub ac64: bool,
    pub extcaps: ExtCapBuilder,
    /// Time the BIOS takes to drop its semaphore; `None` never does.
    pub bios_release_ms: Option<u32>,
    pub reset_stuck: bool,
    pub cnr_stuck: bool,
    pub cnr_delay_us: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            max_slots: 8,
            max_ports: 4,
            scratchpads: 2,
            context_size: 32,
            ac64: true,
            extcaps: ExtCapBuilder::new()
                .protocol(2, 0, *b"USB ", &[])
                .protocol(3, 0, *b"USB ", &[]),
            bios_release_ms: Some(5),
            reset_stuck: false,
            cnr_stuck: false,
            cnr_delay_us: 3000,
        }
    }
}

#[derive(Default)]
struct Ledger {
    live: BTreeMap<usize, Layout>,
    allocs: usize,
    frees: usize,
    fail_after: Option<usize>,
    mapped: usize,
}

/// Consumer position on a ring the simulated controller reads.
#[derive(Copy, Clone, Debug)]
struct Consumer {
    dequeue: u64,
    cycle: bool,
}

#[derive(Copy, Clone, Debug)]
struct Producer {
    segment: usize,
    index: usize,
    cycle: bool,
}

const FRESH_PRODUCER: Producer = Producer {
    segment: 0,
    index: 0,
    cycle: true,
};

struct SimState {
    cfg: SimConfig,
    regs: Vec<u8>,
    now_us: u64,
    ledger: Ledger,
    legsup: Option<usize>,
    os_sem_at: Option<u64>,
    reset_at: Option<u64>,
    cnr_clear_at: Option<u64>,
    halt_stuck: bool,
    commands: Option<Consumer>,
    events: Producer,
    slots: Vec<bool>,
    endpoints: HashMap<(u8, u8), Consumer>,
    hold_commands: bool,
    held: Vec<(u64, Trb)>,
    transfer_result: (CompletionCode, u32),
    transfer_fault: Option<(usize, CompletionCode)>,
    doorbells: Vec<(u8, u32)>,
}

impl SimState {
    fn new(cfg: SimConfig) -> Self {
        let mut sim = SimState {
            regs: vec![0; SIM_LEN],
            now_us: 0,
            ledger: Ledger::default(),
            legsup: None,
            os_sem_at: None,
            reset_at: None,
            cnr_clear_at: None,
            halt_stuck: false,
            commands: None,
            events: FRESH_PRODUCER,
            slots: vec![false; cfg.max_slots as usize + 1],
            endpoints: HashMap::new(),
            hold_commands: false,
            held: Vec::new(),
            transfer_result: (CompletionCode::Success, 0),
            transfer_fault: None,
            doorbells: Vec::new(),
            cfg,
        };

        let cfg = &sim.cfg;
        let sp = cfg.scratchpads as u32;
        let extcaps = cfg.extcaps.build();
        let xecp = if extcaps.is_empty() { 0 } else { XECP / 4 };
        let caplength = CAP_LENGTH as u32 | 0x0120 << 16;
        let hcs1 = cfg.max_slots as u32 | 1 << 8 | (cfg.max_ports as u32) << 24;
        let hcs2 = ((sp >> 5) & 0x1F) << 21 | (sp & 0x1F) << 27;
        let hcc1 = cfg.ac64 as u32 | ((cfg.context_size == 64) as u32) << 2 | (xecp as u32) << 16;
        let ports = cfg.max_ports;

        sim.set(cap::CAPLENGTH, caplength);
        sim.set(cap::HCSPARAMS1, hcs1);
        sim.set(cap::HCSPARAMS2, hcs2);
        sim.set(cap::HCCPARAMS1, hcc1);
        sim.set(cap::DBOFF, DBOFF as u32);
        sim.set(cap::RTSOFF, RTSOFF as u32);
        sim.set(OP + op::USBSTS, UsbSts::HCH.bits());
        sim.set(OP + op::PAGESIZE, 1);
        for port in 1..=ports {
            sim.set(portsc_offset(port), PortSc::PP.bits());
        }

        let mut offset = XECP;
        for dword in extcaps {
            sim.set(offset, dword);
            offset += 4;
        }
        // First legacy capability, if any.
        let mut next = if xecp == 0 { 0 } else { XECP };
        while next != 0 {
            let header = sim.get(next);
            if header as u8 == CAP_LEGACY_SUPPORT {
                sim.legsup = Some(next);
                break;
            }
            let step = ((header >> 8) & 0xFF) as usize * 4;
            next = if step == 0 { 0 } else { next + step };
        }
        sim
    }

    fn get(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.regs[offset..offset + 4])
    }

    fn set(&mut self, offset: usize, value: u32) {
        LittleEndian::write_u32(&mut self.regs[offset..offset + 4], value)
    }

    fn get64(&self, lo: usize) -> u64 {
        self.get(lo) as u64 | (self.get(lo + 4) as u64) << 32
    }

    fn running(&self) -> bool {
        self.get(OP + op::USBCMD) & UsbCmd::RUN_STOP.bits() != 0
    }

    /// Let time-driven state catch up with `now_us`.
    fn update(&mut self) {
        if let Some(at) = self.reset_at {
            if !self.cfg.reset_stuck && self.now_us >= at + 1000 {
                self.finish_reset();
            }
        }
        if let Some(at) = self.cnr_clear_at {
            if self.now_us >= at {
                let sts = self.get(OP + op::USBSTS) & !UsbSts::CNR.bits();
                self.set(OP + op::USBSTS, sts);
                self.cnr_clear_at = None;
            }
        }
        if let (Some(at), Some(ms), Some(legsup)) = (self.os_sem_at, self.cfg.bios_release_ms, self.legsup) {
            if self.now_us >= at + ms as u64 * 1000 {
                let value = self.get(legsup) & !LEGSUP_BIOS_OWNED;
                self.set(legsup, value);
            }
        }
    }

    fn finish_reset(&mut self) {
        self.reset_at = None;
        self.set(OP + op::USBCMD, 0);
        self.set(OP + op::USBSTS, (UsbSts::HCH | UsbSts::CNR).bits());
        for reg in [op::CRCR_LO, op::CRCR_HI, op::DCBAAP_LO, op::DCBAAP_HI, op::CONFIG] {
            self.set(OP + reg, 0);
        }
        for reg in (0..rt::IR_STRIDE).step_by(4) {
            self.set(IR0 + reg, 0);
        }
        if !self.cfg.cnr_stuck {
            self.cnr_clear_at = Some(self.now_us + self.cfg.cnr_delay_us);
        }
        self.commands = None;
        self.events = FRESH_PRODUCER;
        self.slots.iter_mut().for_each(|s| *s = false);
        self.endpoints.clear();
        self.held.clear();
    }

    fn read32(&mut self, offset: usize) -> u32 {
        self.update();
        self.get(offset)
    }

    fn write32(&mut self, offset: usize, value: u32) {
        self.update();
        let old = self.get(offset);
        match offset {
            o if o == OP + op::USBCMD => {
                self.set(o, value);
                let mut sts = UsbSts::from_bits_retain(self.get(OP + op::USBSTS));
                if value & UsbCmd::HCRST.bits() != 0 {
                    self.reset_at = Some(self.now_us);
                }
                if value & UsbCmd::RUN_STOP.bits() != 0 {
                    sts -= UsbSts::HCH;
                } else if !self.halt_stuck {
                    sts |= UsbSts::HCH;
                }
                self.set(OP + op::USBSTS, sts.bits());
            }
            o if o == OP + op::USBSTS => {
                self.set(o, old & !(value & STATUS_ACK_MASK.bits()));
            }
            o if o == OP + op::CRCR_HI => {
                self.set(o, value);
                let crcr = self.get64(OP + op::CRCR_LO);
                self.commands = Some(Consumer {
                    dequeue: crcr & !0x3F,
                    cycle: crcr & 1 != 0,
                });
            }
            o if o == IR0 + rt::IMAN => {
                let ip = old & Iman::IP.bits() & !(value & Iman::IP.bits());
                self.set(o, (value & Iman::IE.bits()) | ip);
            }
            o if o == IR0 + rt::ERDP_LO => {
                let ehb = old & ERDP_EHB as u32 & !(value & ERDP_EHB as u32);
                self.set(o, (value & !(ERDP_EHB as u32)) | ehb);
            }
            o if o == IR0 + rt::ERSTBA_HI => {
                self.set(o, value);
                self.events = FRESH_PRODUCER;
            }
            o if (portsc_offset(1)..portsc_offset(self.cfg.max_ports + 1)).contains(&o) => {
                self.write_portsc(o, old, value);
            }
            o if (DBOFF..DBOFF + 4 * 256).contains(&o) => {
                let doorbell = ((o - DBOFF) / 4) as u8;
                self.doorbells.push((doorbell, value));
                if self.running() {
                    if doorbell == 0 {
                        self.process_commands();
                    } else {
                        self.process_transfers(doorbell, value as u8);
                    }
                }
            }
            o if Some(o) == self.legsup => {
                self.set(o, value);
                if value & LEGSUP_OS_OWNED != 0 && self.os_sem_at.is_none() {
                    self.os_sem_at = Some(self.now_us);
                }
            }
            o => self.set(o, value),
        }
    }

    fn write_portsc(&mut self, offset: usize, old: u32, value: u32) {
        let old = PortSc::from_bits_retain(old);
        let value = PortSc::from_bits_retain(value);
        let mut new = old - PortSc::PRESERVE;
        new |= value & PortSc::PRESERVE;
        new -= value & PortSc::CHANGE_BITS;
        if value.contains(PortSc::PED) {
            new -= PortSc::PED;
        }
        if value.contains(PortSc::PR) && old.contains(PortSc::CCS) {
            new |= PortSc::PED | PortSc::PRC;
        }
        self.set(offset, new.bits());
    }

    // Guest memory. Physical addresses are host pointers into the ledger.

    fn check(&self, phys: u64, len: usize) -> usize {
        let addr = phys as usize;
        let inside = self
            .ledger
            .live
            .range(..=addr)
            .next_back()
            .is_some_and(|(&base, layout)| addr + len <= base + layout.size());
        assert!(inside, "controller access to {phys:#x} outside DMA memory");
        addr
    }

    fn mem_read_u32(&self, phys: u64) -> u32 {
        let addr = self.check(phys, 4);
        // Safety: inside a live allocation, checked above.
        u32::from_le(unsafe { core::ptr::read_volatile(addr as *const u32) })
    }

    fn mem_write_u32(&mut self, phys: u64, value: u32) {
        let addr = self.check(phys, 4);
        // Safety: as above.
        unsafe { core::ptr::write_volatile(addr as *mut u32, value.to_le()) }
    }

    fn mem_read_u64(&self, phys: u64) -> u64 {
        self.mem_read_u32(phys) as u64 | (self.mem_read_u32(phys + 4) as u64) << 32
    }

    fn mem_copy(&mut self, from: u64, to: u64, len: usize) {
        for i in (0..len).step_by(4) {
            let value = self.mem_read_u32(from + i as u64);
            self.mem_write_u32(to + i as u64, value);
        }
    }

    fn mem_read_trb(&self, phys: u64) -> Trb {
        Trb::new(
            self.mem_read_u64(phys),
            self.mem_read_u32(phys + 8),
            self.mem_read_u32(phys + 12),
        )
    }

    fn mem_write_trb(&mut self, phys: u64, trb: Trb) {
        self.mem_write_u32(phys, trb.parameter() as u32);
        self.mem_write_u32(phys + 4, (trb.parameter() >> 32) as u32);
        self.mem_write_u32(phys + 8, trb.status());
        self.mem_write_u32(phys + 12, trb.control());
    }

    /// Next TRB owned by `consumer`, following Link TRBs.
    fn next_trb(&self, consumer: &mut Consumer) -> Option<(u64, Trb)> {
        loop {
            let trb = self.mem_read_trb(consumer.dequeue);
            if trb.cycle() != consumer.cycle {
                return None;
            }
            if trb.trb_type() == Some(TrbType::Link) {
                consumer.dequeue = trb.parameter() & !0xF;
                if trb.flags().contains(TrbFlags::TOGGLE_CYCLE) {
                    consumer.cycle = !consumer.cycle;
                }
                continue;
            }
            let phys = consumer.dequeue;
            consumer.dequeue += TRB_SIZE as u64;
            return Some((phys, trb));
        }
    }

    fn post_event(&mut self, event: Trb) {
        let size = self.get(IR0 + rt::ERSTSZ) as usize;
        let erst = self.get64(IR0 + rt::ERSTBA_LO);
        assert!(size != 0 && erst != 0, "no event ring configured");

        let entry = erst + 16 * self.events.segment as u64;
        let base = self.mem_read_u64(entry);
        let trbs = self.mem_read_u32(entry + 8) as usize & 0xFFFF;
        self.mem_write_trb(base + (self.events.index * TRB_SIZE) as u64, event.with_cycle(self.events.cycle));

        self.events.index += 1;
        if self.events.index == trbs {
            self.events.index = 0;
            self.events.segment += 1;
            if self.events.segment == size {
                self.events.segment = 0;
                self.events.cycle = !self.events.cycle;
            }
        }
        let iman = self.get(IR0 + rt::IMAN) | Iman::IP.bits();
        self.set(IR0 + rt::IMAN, iman);
        let sts = self.get(OP + op::USBSTS) | UsbSts::EINT.bits();
        self.set(OP + op::USBSTS, sts);
    }

    fn event_ring_ready(&self) -> bool {
        self.get(IR0 + rt::ERSTSZ) != 0 && self.get64(IR0 + rt::ERSTBA_LO) != 0
    }

    fn process_commands(&mut self) {
        let Some(mut consumer) = self.commands else { return };
        while let Some((phys, trb)) = self.next_trb(&mut consumer) {
            if self.hold_commands {
                self.held.push((phys, trb));
            } else {
                let (code, slot) = self.execute_command(&trb);
                self.complete_command(phys, code, slot);
            }
        }
        self.commands = Some(consumer);
    }

    fn complete_command(&mut self, phys: u64, code: CompletionCode, slot: u8) {
        let control = (TrbType::CommandCompletionEvent as u32) << 10 | (slot as u32) << 24;
        self.post_event(Trb::new(phys, (code.raw() as u32) << 24, control));
    }

    fn output_context(&self, slot: u8) -> u64 {
        let dcbaa = self.get64(OP + op::DCBAAP_LO);
        self.mem_read_u64(dcbaa + 8 * slot as u64)
    }

    fn start_endpoint(&mut self, slot: u8, dci: u8, ep_ctx: u64) {
        let dequeue = self.mem_read_u64(ep_ctx + 8);
        self.endpoints.insert(
            (slot, dci),
            Consumer {
                dequeue: dequeue & !0xF,
                cycle: dequeue & 1 != 0,
            },
        );
    }

    fn execute_command(&mut self, trb: &Trb) -> (CompletionCode, u8) {
        let cs = self.cfg.context_size as u64;
        let slot = trb.slot_id();
        let enabled = self.slots.get(slot as usize).copied().unwrap_or(false) && slot != 0;

        match trb.trb_type() {
            Some(TrbType::EnableSlot) => match (1..self.slots.len()).find(|&s| !self.slots[s]) {
                Some(s) => {
                    self.slots[s] = true;
                    (CompletionCode::Success, s as u8)
                }
                None => (CompletionCode::NoSlotsAvailable, 0),
            },
            Some(TrbType::DisableSlot | TrbType::AddressDevice | TrbType::ConfigureEndpoint) if !enabled => {
                (CompletionCode::SlotNotEnabled, slot)
            }
            Some(TrbType::DisableSlot) => {
                self.slots[slot as usize] = false;
                self.endpoints.retain(|&(s, _), _| s != slot);
                (CompletionCode::Success, slot)
            }
            Some(TrbType::AddressDevice) => {
                let input = trb.parameter();
                let output = self.output_context(slot);
                self.mem_copy(input + cs, output, 32);
                // The simulated controller hands out the slot ID as address.
                self.mem_write_u32(output + 12, slot as u32 | 2 << 27);
                self.mem_copy(input + 2 * cs, output + cs, 32);
                self.start_endpoint(slot, 1, output + cs);
                (CompletionCode::Success, slot)
            }
            Some(TrbType::ConfigureEndpoint) => {
                let input = trb.parameter();
                let output = self.output_context(slot);
                let add = self.mem_read_u32(input + 4);
                if add & 1 != 0 {
                    let dword0 = self.mem_read_u32(input + cs);
                    self.mem_write_u32(output, dword0);
                }
                for dci in 2..32u8 {
                    if add & 1 << dci != 0 {
                        let ctx = output + dci as u64 * cs;
                        self.mem_copy(input + (dci as u64 + 1) * cs, ctx, 32);
                        self.start_endpoint(slot, dci, ctx);
                    }
                }
                (CompletionCode::Success, slot)
            }
            _ => (CompletionCode::Success, slot),
        }
    }

    fn process_transfers(&mut self, slot: u8, dci: u8) {
        let Some(mut consumer) = self.endpoints.get(&(slot, dci)).copied() else {
            return;
        };
        // Position inside the current TD, and whether it already failed.
        let mut index = 0;
        let mut failed = false;
        while let Some((phys, trb)) = self.next_trb(&mut consumer) {
            let ioc = trb.flags().contains(TrbFlags::IOC);
            match self.transfer_fault {
                Some((at, code)) if !failed && at == index => {
                    self.transfer_fault = None;
                    failed = true;
                    self.post_transfer_event(slot, dci, phys, code, trb.status() & 0x1_FFFF);
                }
                _ if ioc && !failed => {
                    let (code, residual) = self.transfer_result;
                    self.post_transfer_event(slot, dci, phys, code, residual);
                }
                _ => {}
            }
            index += 1;
            if ioc {
                index = 0;
                failed = false;
            }
        }
        self.endpoints.insert((slot, dci), consumer);
    }

    fn post_transfer_event(&mut self, slot: u8, dci: u8, phys: u64, code: CompletionCode, residual: u32) {
        let control = (TrbType::TransferEvent as u32) << 10 | (dci as u32) << 16 | (slot as u32) << 24;
        self.post_event(Trb::new(phys, (code.raw() as u32) << 24 | residual, control));
    }

    fn port_event(&mut self, port: u8) {
        let sts = self.get(OP + op::USBSTS) | UsbSts::PCD.bits();
        self.set(OP + op::USBSTS, sts);
        if self.event_ring_ready() {
            let control = (TrbType::PortStatusChangeEvent as u32) << 10;
            self.post_event(Trb::new((port as u64) << 24, 1 << 24, control));
        }
    }
}

fn portsc_offset(port: u8) -> usize {
    OP + op::PORTSC_BASE + op::PORT_STRIDE * (port as usize - 1)
}

/// Register window of the simulated controller.
pub struct SimMmio {
    sim: Rc<RefCell<SimState>>,
    len: usize,
}

impl Mmio for SimMmio {
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "register {offset:#x} out of range");
        self.sim.borrow_mut().read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "register {offset:#x} out of range");
        self.sim.borrow_mut().write32(offset, value)
    }
}

/// Test-side handle on the simulated controller.
#[derive(Clone)]
pub struct Sim(Rc<RefCell<SimState>>);

impl Sim {
    pub fn with_extcaps(extcaps: ExtCapBuilder) -> Sim {
        HostHal::with_config(SimConfig {
            extcaps,
            ..SimConfig::default()
        })
        .1
    }

    pub fn mmio(&self) -> SimMmio {
        SimMmio {
            sim: self.0.clone(),
            len: SIM_LEN,
        }
    }

    pub fn mmio_len(&self) -> usize {
        SIM_LEN
    }

    pub fn xecp(&self) -> usize {
        XECP
    }

    pub fn resources(&self) -> HwResources {
        HwResources {
            mem_ranges: vec![MemRange {
                base: SIM_BASE,
                size: SIM_LEN,
            }],
            irqs: vec![SIM_IRQ],
        }
    }

    pub fn now_us(&self) -> u64 {
        self.0.borrow().now_us
    }

    /// Raw register, no side effects.
    pub fn reg(&self, offset: usize) -> u32 {
        self.0.borrow().get(offset)
    }

    pub fn op_reg(&self, reg: usize) -> u32 {
        self.reg(OP + reg)
    }

    pub fn intr_reg(&self, reg: usize) -> u32 {
        self.reg(IR0 + reg)
    }

    pub fn erdp(&self) -> u64 {
        self.0.borrow().get64(IR0 + rt::ERDP_LO)
    }

    pub fn doorbells(&self) -> Vec<(u8, u32)> {
        self.0.borrow().doorbells.clone()
    }

    pub fn attach_event_ring(&self, erst: u64, segments: u32) {
        let mut sim = self.0.borrow_mut();
        sim.set(IR0 + rt::ERSTSZ, segments);
        sim.set(IR0 + rt::ERSTBA_LO, erst as u32);
        sim.set(IR0 + rt::ERSTBA_HI, (erst >> 32) as u32);
        sim.events = FRESH_PRODUCER;
    }

    pub fn post_event(&self, event: Trb) {
        self.0.borrow_mut().post_event(event)
    }

    /// Set status bits as if the controller raised them.
    pub fn raise(&self, status: UsbSts) {
        let mut sim = self.0.borrow_mut();
        let sts = sim.get(OP + op::USBSTS) | status.bits();
        sim.set(OP + op::USBSTS, sts);
        let iman = sim.get(IR0 + rt::IMAN) | Iman::IP.bits();
        sim.set(IR0 + rt::IMAN, iman);
    }

    pub fn connect(&self, port: u8, speed: u8) {
        let mut sim = self.0.borrow_mut();
        let portsc = PortSc::CCS | PortSc::PED | PortSc::PP | PortSc::CSC;
        sim.set(portsc_offset(port), portsc.bits() | (speed as u32 & 0xF) << 10);
        sim.port_event(port);
    }

    pub fn disconnect(&self, port: u8) {
        let mut sim = self.0.borrow_mut();
        sim.set(portsc_offset(port), (PortSc::PP | PortSc::CSC).bits());
        sim.port_event(port);
    }

    pub fn set_halt_stuck(&self, stuck: bool) {
        self.0.borrow_mut().halt_stuck = stuck;
    }

    /// Keep commands on the side instead of completing them at the doorbell.
    pub fn hold_commands(&self, hold: bool) {
        self.0.borrow_mut().hold_commands = hold;
    }

    /// Addresses of the commands fetched but not yet completed.
    pub fn held_commands(&self) -> Vec<u64> {
        self.0.borrow().held.iter().map(|(phys, _)| *phys).collect()
    }

    /// Execute and complete one held command.
    pub fn complete_held(&self, phys: u64) {
        let mut sim = self.0.borrow_mut();
        let index = sim
            .held
            .iter()
            .position(|(p, _)| *p == phys)
            .unwrap_or_else(|| panic!("no held command at {phys:#x}"));
        let (_, trb) = sim.held.remove(index);
        let (code, slot) = sim.execute_command(&trb);
        sim.complete_command(phys, code, slot);
    }

    /// Completion code and residual of every following transfer.
    pub fn set_transfer_result(&self, code: CompletionCode, residual: u32) {
        self.0.borrow_mut().transfer_result = (code, residual);
    }

    /// Fail the TRB at `index` of the next TD with `code`. The rest of that
    /// TD is skipped without further events.
    pub fn fail_transfer_at(&self, index: usize, code: CompletionCode) {
        self.0.borrow_mut().transfer_fault = Some((index, code));
    }

    pub fn legacy_semaphores(&self) -> Option<u32> {
        let sim = self.0.borrow();
        sim.legsup.map(|offset| sim.get(offset))
    }
}

pub struct HostHal {
    sim: Rc<RefCell<SimState>>,
}

impl HostHal {
    pub fn new() -> (HostHal, Sim) {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(cfg: SimConfig) -> (HostHal, Sim) {
        let sim = Rc::new(RefCell::new(SimState::new(cfg)));
        (HostHal { sim: sim.clone() }, Sim(sim))
    }

    pub fn live_allocations(&self) -> usize {
        self.sim.borrow().ledger.live.len()
    }

    pub fn allocations(&self) -> usize {
        self.sim.borrow().ledger.allocs
    }

    pub fn frees(&self) -> usize {
        self.sim.borrow().ledger.frees
    }

    pub fn mapped_windows(&self) -> usize {
        self.sim.borrow().ledger.mapped
    }

    /// Let `n` more allocations succeed, then fail one.
    pub fn fail_after(&mut self, n: usize) {
        self.sim.borrow_mut().ledger.fail_after = Some(n);
    }
}

impl Hal for HostHal {
    type Mmio = SimMmio;

    fn map_mmio(&mut self, range: MemRange) -> Result<SimMmio> {
        assert_eq!(range.base, SIM_BASE, "no device at {:#x}", range.base);
        let len = range.size.min(SIM_LEN);
        self.sim.borrow_mut().ledger.mapped += 1;
        Ok(SimMmio {
            sim: self.sim.clone(),
            len,
        })
    }

    fn unmap_mmio(&mut self, mmio: SimMmio) {
        let mut sim = self.sim.borrow_mut();
        assert!(sim.ledger.mapped > 0, "unmapping a window that was never mapped");
        sim.ledger.mapped -= 1;
        drop(mmio);
    }

    fn dma_alloc(&mut self, layout: Layout, _bits64: bool) -> Result<DmaBuffer> {
        let mut sim = self.sim.borrow_mut();
        let ledger = &mut sim.ledger;
        match ledger.fail_after {
            Some(0) => {
                ledger.fail_after = None;
                return Err(Error::NoMemory);
            }
            Some(n) => ledger.fail_after = Some(n - 1),
            None => {}
        }

        assert!(layout.size() > 0);
        // Safety: non-zero size checked above.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(Error::NoMemory)?;
        ledger.live.insert(ptr.as_ptr() as usize, layout);
        ledger.allocs += 1;
        // Safety: fresh allocation of `layout`, identity mapped.
        Ok(unsafe { DmaBuffer::from_raw_parts(ptr, ptr.as_ptr() as u64, layout) })
    }

    fn dma_free(&mut self, buffer: DmaBuffer) {
        let mut sim = self.sim.borrow_mut();
        let addr = buffer.as_ptr() as usize;
        let layout = sim
            .ledger
            .live
            .remove(&addr)
            .unwrap_or_else(|| panic!("double free of DMA buffer at {addr:#x}"));
        assert_eq!(layout, buffer.layout());
        sim.ledger.frees += 1;
        // Safety: allocated by `dma_alloc` with this layout, removed from the ledger once.
        unsafe { dealloc(buffer.as_ptr(), layout) }
    }

    fn usleep(&mut self, us: u32) {
        self.sim.borrow_mut().now_us += us as u64;
    }
}
