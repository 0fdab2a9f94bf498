//! Interrupt pre-filter program.
//!
//! The kernel runs this program in interrupt context before waking the
//! driver: it checks IMAN.IP of interrupter 0, acknowledges USBSTS and IMAN,
//! and accepts the interrupt with the raw status in scratch register 1.
//! Register values are raw, i.e. in controller (little endian) byte order.

use tinyvec::ArrayVec;

use crate::hal::MemRange;
use crate::regs::{cap, op, rt, Iman, UsbSts, STATUS_ACK_MASK};

pub const SCRATCH_REGS: usize = 6;
pub const PROGRAM_LEN: usize = 9;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IrqCommand {
    /// `scratch[dst] = read32(addr)`
    PioRead32 { addr: u64, dst: usize },
    /// `scratch[dst] = scratch[src] & value`
    And { src: usize, value: u32, dst: usize },
    /// Skip the next `skip` commands when `scratch[src]` is zero.
    Predicate { src: usize, skip: usize },
    /// `write32(addr, scratch[src])`
    PioWriteA32 { addr: u64, src: usize },
    Accept,
    #[default]
    Decline,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrqCode {
    /// Register range the program may touch.
    pub range: MemRange,
    pub cmds: ArrayVec<[IrqCommand; PROGRAM_LEN]>,
}

/// Outcome of running the program once.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrqVerdict {
    /// Raw USBSTS as read by the program.
    Accepted(u32),
    Declined,
}

impl IrqCode {
    /// `rtsoff` and `cap_length` locate IMAN of interrupter 0 and USBSTS.
    pub fn new(range: MemRange, cap_length: usize, rtsoff: usize) -> Self {
        let iman = range.base + (rtsoff + rt::IR0 + rt::IMAN) as u64;
        let usbsts = range.base + (cap_length + op::USBSTS) as u64;
        debug_assert!(cap_length >= cap::SIZE);

        let mut cmds = ArrayVec::new();
        cmds.extend([
            IrqCommand::PioRead32 { addr: iman, dst: 3 },
            IrqCommand::And {
                src: 3,
                value: Iman::IP.bits().to_le(),
                dst: 4,
            },
            IrqCommand::Predicate { src: 4, skip: 5 },
            IrqCommand::PioRead32 { addr: usbsts, dst: 1 },
            IrqCommand::And {
                src: 1,
                value: STATUS_ACK_MASK.bits().to_le(),
                dst: 2,
            },
            IrqCommand::PioWriteA32 { addr: usbsts, src: 2 },
            IrqCommand::PioWriteA32 { addr: iman, src: 3 },
            IrqCommand::Accept,
            IrqCommand::Decline,
        ]);
        IrqCode { range, cmds }
    }

    /// Interprets the program the way the kernel would, with raw register
    /// access through `read` and `write`.
    pub fn evaluate(
        &self,
        mut read: impl FnMut(u64) -> u32,
        mut write: impl FnMut(u64, u32),
    ) -> IrqVerdict {
        let mut scratch = [0u32; SCRATCH_REGS];
        let mut pc = 0;
        while let Some(cmd) = self.cmds.get(pc) {
            pc += 1;
            match *cmd {
                IrqCommand::PioRead32 { addr, dst } => scratch[dst] = read(addr),
                IrqCommand::And { src, value, dst } => scratch[dst] = scratch[src] & value,
                IrqCommand::Predicate { src, skip } => {
                    if scratch[src] == 0 {
                        pc += skip;
                    }
                }
                IrqCommand::PioWriteA32 { addr, src } => write(addr, scratch[src]),
                IrqCommand::Accept => return IrqVerdict::Accepted(scratch[1]),
                IrqCommand::Decline => return IrqVerdict::Declined,
            }
        }
        IrqVerdict::Declined
    }
}

impl IrqVerdict {
    /// Status in host order, as expected by `Controller::interrupt`.
    pub fn status(self) -> Option<UsbSts> {
        match self {
            IrqVerdict::Accepted(raw) => Some(UsbSts::from_bits_retain(u32::from_le(raw))),
            IrqVerdict::Declined => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    const RANGE: MemRange = MemRange {
        base: 0xfe00_0000,
        size: 0x10000,
    };

    #[test]
    fn program_layout() {
        let code = IrqCode::new(RANGE, 0x20, 0x1000);
        assert_eq!(code.cmds.len(), PROGRAM_LEN);
        assert_eq!(
            code.cmds[0],
            IrqCommand::PioRead32 {
                addr: 0xfe00_1020,
                dst: 3
            }
        );
        assert_eq!(
            code.cmds[3],
            IrqCommand::PioRead32 {
                addr: 0xfe00_0024,
                dst: 1
            }
        );
        assert_eq!(code.cmds[7], IrqCommand::Accept);
        assert_eq!(code.cmds[8], IrqCommand::Decline);
    }

    #[test]
    fn declines_without_pending_interrupt() {
        let code = IrqCode::new(RANGE, 0x20, 0x1000);
        let mut writes = Vec::new();
        let verdict = code.evaluate(|_| 0, |addr, value| writes.push((addr, value)));
        assert_eq!(verdict, IrqVerdict::Declined);
        assert!(writes.is_empty());
    }

    #[test]
    fn accepts_and_acknowledges() {
        let code = IrqCode::new(RANGE, 0x20, 0x1000);
        let iman = 0xfe00_1020;
        let usbsts = 0xfe00_0024;
        let status = (UsbSts::EINT | UsbSts::PCD | UsbSts::CNR).bits();

        let mut writes = Vec::new();
        let verdict = code.evaluate(
            |addr| match addr {
                a if a == iman => (Iman::IP | Iman::IE).bits().to_le(),
                a if a == usbsts => status.to_le(),
                _ => unreachable!(),
            },
            |addr, value| writes.push((addr, u32::from_le(value))),
        );

        assert_eq!(verdict.status(), Some(UsbSts::from_bits_retain(status)));
        // CNR is not an event bit and must not be written back.
        assert_eq!(
            writes,
            [
                (usbsts, (UsbSts::EINT | UsbSts::PCD).bits()),
                (iman, (Iman::IP | Iman::IE).bits())
            ]
        );
    }
}
