//! xHCI register layout (xHCI 1.2, chapter 5).

use crate::hal::Mmio;

// Capability registers (5.3)
#[rustfmt::skip]
pub mod cap {
    pub const CAPLENGTH: usize = 0x00;  // 7:0 length, 31:16 HCIVERSION
    pub const HCSPARAMS1: usize = 0x04; // 7:0 MaxSlots, 18:8 MaxIntrs, 31:24 MaxPorts
    pub const HCSPARAMS2: usize = 0x08; // 25:21 MaxScratchpad hi, 31:27 MaxScratchpad lo
    pub const HCCPARAMS1: usize = 0x10; // 0 AC64, 2 CSZ, 31:16 xECP
    pub const DBOFF: usize = 0x14;
    pub const RTSOFF: usize = 0x18;

    /// Size of the capability register block.
    pub const SIZE: usize = 0x20;
}

// Operational registers (5.4), relative to CAPLENGTH
#[rustfmt::skip]
pub mod op {
    pub const USBCMD: usize = 0x00;
    pub const USBSTS: usize = 0x04;
    pub const PAGESIZE: usize = 0x08;
    pub const CRCR_LO: usize = 0x18;
    pub const CRCR_HI: usize = 0x1C;
    pub const DCBAAP_LO: usize = 0x30;
    pub const DCBAAP_HI: usize = 0x34;
    pub const CONFIG: usize = 0x38;
    pub const PORTSC_BASE: usize = 0x400;
    pub const PORT_STRIDE: usize = 0x10;
}

// Runtime registers (5.5), relative to RTSOFF
#[rustfmt::skip]
pub mod rt {
    pub const IR0: usize = 0x20;
    pub const IR_STRIDE: usize = 0x20;

    // Interrupter register set
    pub const IMAN: usize = 0x00;
    pub const ERSTSZ: usize = 0x08;
    pub const ERSTBA_LO: usize = 0x10;
    pub const ERSTBA_HI: usize = 0x14;
    pub const ERDP_LO: usize = 0x18;
    pub const ERDP_HI: usize = 0x1C;
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        const RUN_STOP = 1 << 0;
        const HCRST = 1 << 1;
        const INTE = 1 << 2;
        const HSEE = 1 << 3;
        const _ = !0;
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        const HCH = 1 << 0;
        const HSE = 1 << 2;
        const EINT = 1 << 3;
        const PCD = 1 << 4;
        const SSS = 1 << 8;
        const RSS = 1 << 9;
        const SRE = 1 << 10;
        const CNR = 1 << 11;
        const HCE = 1 << 12;
        const _ = !0;
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Iman: u32 {
        const IP = 1 << 0;
        const IE = 1 << 1;
        const _ = !0;
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PortSc: u32 {
        const CCS = 1 << 0;
        const PED = 1 << 1;
        const OCA = 1 << 3;
        const PR = 1 << 4;
        const PP = 1 << 9;
        const LWS = 1 << 16;
        const CSC = 1 << 17;
        const PEC = 1 << 18;
        const WRC = 1 << 19;
        const OCC = 1 << 20;
        const PRC = 1 << 21;
        const PLC = 1 << 22;
        const CEC = 1 << 23;
        const CAS = 1 << 24;
        const WCE = 1 << 25;
        const WDE = 1 << 26;
        const WOE = 1 << 27;
        const WPR = 1 << 31;
        const _ = !0;
    }
}

/// USBSTS bits the interrupt path acknowledges (all RW1C event bits).
pub const STATUS_ACK_MASK: UsbSts = UsbSts::HSE
    .union(UsbSts::EINT)
    .union(UsbSts::PCD)
    .union(UsbSts::SRE);

/// ERDP Event Handler Busy, write 1 to clear.
pub const ERDP_EHB: u64 = 1 << 3;
/// CRCR Ring Cycle State.
pub const CRCR_RCS: u64 = 1 << 0;

impl PortSc {
    pub const CHANGE_BITS: PortSc = PortSc::CSC
        .union(PortSc::PEC)
        .union(PortSc::WRC)
        .union(PortSc::OCC)
        .union(PortSc::PRC)
        .union(PortSc::PLC)
        .union(PortSc::CEC);

    /// Bits that are safe to write back unchanged; everything else is
    /// either RW1C, RW1S or would disable the port (PED).
    pub const PRESERVE: PortSc = PortSc::PP
        .union(PortSc::WCE)
        .union(PortSc::WDE)
        .union(PortSc::WOE);

    pub fn speed(self) -> u8 {
        ((self.bits() >> 10) & 0xF) as u8
    }
}

/// Values read once from the capability registers.
#[derive(Copy, Clone, Debug, Default)]
pub struct Capabilities {
    pub cap_length: usize,
    pub hci_version: u16,
    pub max_slots: u8,
    pub max_intrs: u16,
    pub max_ports: u8,
    pub max_scratchpads: usize,
    pub ac64: bool,
    /// Size of one context entry, 32 or 64 bytes.
    pub context_size: usize,
    /// Byte offset of the first extended capability, 0 if there is none.
    pub xecp: usize,
    pub dboff: usize,
    pub rtsoff: usize,
}

impl Capabilities {
    pub fn read<M: Mmio>(mmio: &M) -> Self {
        let caplength = mmio.read32(cap::CAPLENGTH);
        let hcs1 = mmio.read32(cap::HCSPARAMS1);
        let hcs2 = mmio.read32(cap::HCSPARAMS2);
        let hcc1 = mmio.read32(cap::HCCPARAMS1);

        let scratch_hi = (hcs2 >> 21) & 0x1F;
        let scratch_lo = (hcs2 >> 27) & 0x1F;

        Capabilities {
            cap_length: (caplength & 0xFF) as usize,
            hci_version: (caplength >> 16) as u16,
            max_slots: (hcs1 & 0xFF) as u8,
            max_intrs: ((hcs1 >> 8) & 0x7FF) as u16,
            max_ports: (hcs1 >> 24) as u8,
            max_scratchpads: ((scratch_hi << 5) | scratch_lo) as usize,
            ac64: hcc1 & 1 != 0,
            context_size: if hcc1 & (1 << 2) != 0 { 64 } else { 32 },
            // xECP is in 32-bit words
            xecp: ((hcc1 >> 16) as usize) * 4,
            dboff: (mmio.read32(cap::DBOFF) & !0x3) as usize,
            rtsoff: (mmio.read32(cap::RTSOFF) & !0x1F) as usize,
        }
    }
}

/// The four register windows of one controller, all inside one mapping.
pub struct Registers<M> {
    mmio: M,
    op: usize,
    rt: usize,
    db: usize,
}

impl<M: Mmio> Registers<M> {
    pub fn new(mmio: M, caps: &Capabilities) -> Self {
        Registers {
            mmio,
            op: caps.cap_length,
            rt: caps.rtsoff,
            db: caps.dboff,
        }
    }

    pub fn mmio(&self) -> &M {
        &self.mmio
    }

    pub fn into_mmio(self) -> M {
        self.mmio
    }

    pub fn op_read(&self, reg: usize) -> u32 {
        self.mmio.read32(self.op + reg)
    }

    pub fn op_write(&self, reg: usize, value: u32) {
        self.mmio.write32(self.op + reg, value)
    }

    /// Interrupter 0 only.
    pub fn intr_read(&self, reg: usize) -> u32 {
        self.mmio.read32(self.rt + rt::IR0 + reg)
    }

    pub fn intr_write(&self, reg: usize, value: u32) {
        self.mmio.write32(self.rt + rt::IR0 + reg, value)
    }

    pub fn usbcmd(&self) -> UsbCmd {
        UsbCmd::from_bits_retain(self.op_read(op::USBCMD))
    }

    pub fn set_usbcmd(&self, cmd: UsbCmd) {
        self.op_write(op::USBCMD, cmd.bits())
    }

    pub fn usbsts(&self) -> UsbSts {
        UsbSts::from_bits_retain(self.op_read(op::USBSTS))
    }

    /// USBSTS event bits are RW1C.
    pub fn ack_usbsts(&self, bits: UsbSts) {
        self.op_write(op::USBSTS, bits.bits())
    }

    pub fn iman(&self) -> Iman {
        Iman::from_bits_retain(self.intr_read(rt::IMAN))
    }

    pub fn set_iman(&self, iman: Iman) {
        self.intr_write(rt::IMAN, iman.bits())
    }

    pub fn write_op64(&self, lo: usize, hi: usize, value: u64) {
        self.op_write(lo, value as u32);
        self.op_write(hi, (value >> 32) as u32);
    }

    pub fn write_intr64(&self, lo: usize, hi: usize, value: u64) {
        self.intr_write(lo, value as u32);
        self.intr_write(hi, (value >> 32) as u32);
    }

    pub fn ring_doorbell(&self, doorbell: u8, target: u32) {
        self.mmio.write32(self.db + 4 * doorbell as usize, target & 0xFF)
    }

    pub fn portsc(&self, port: u8) -> PortSc {
        PortSc::from_bits_retain(self.op_read(Self::portsc_offset(port)))
    }

    pub fn write_portsc(&self, port: u8, value: PortSc) {
        self.op_write(Self::portsc_offset(port), value.bits())
    }

    fn portsc_offset(port: u8) -> usize {
        assert_ne!(port, 0, "ports are numbered from 1");
        op::PORTSC_BASE + op::PORT_STRIDE * (port as usize - 1)
    }
}
