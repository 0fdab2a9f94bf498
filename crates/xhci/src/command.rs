//! Command ring bookkeeping.
//!
//! Completions are matched to commands by the command TRB pointer carried in
//! the Command Completion Event, never by submission order.

use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::hal::Mmio;
use crate::regs::Registers;
use crate::ring::TrbRing;
use crate::trb::{CompletionCode, Trb, TrbType};

/// Identifies a submitted command by the physical address of its TRB.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommandHandle(u64);

impl CommandHandle {
    pub fn trb_phys(self) -> u64 {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommandCompletion {
    pub code: CompletionCode,
    pub slot_id: u8,
    /// Command completion parameter (24 bits).
    pub parameter: u32,
}

impl CommandCompletion {
    pub fn into_result(self) -> Result<Self> {
        match self.code {
            CompletionCode::Success => Ok(self),
            code => Err(Error::Command(code)),
        }
    }
}

struct Pending {
    phys: u64,
    kind: Option<TrbType>,
    completion: Option<CommandCompletion>,
}

#[derive(Default)]
pub struct CommandProcessor {
    pending: Vec<Pending>,
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `trb` on the command ring and ring the host controller doorbell.
    pub fn submit<M: Mmio>(
        &mut self,
        ring: &mut TrbRing,
        regs: &Registers<M>,
        trb: Trb,
    ) -> Result<CommandHandle> {
        self.pending.try_reserve(1).map_err(|_| Error::NoMemory)?;
        let phys = ring.enqueue(trb)?;
        self.pending.push(Pending {
            phys,
            kind: trb.trb_type(),
            completion: None,
        });
        trace!("command {:?} at {:#x}", trb.trb_type(), phys);

        fence(Ordering::SeqCst);
        regs.ring_doorbell(0, 0);
        Ok(CommandHandle(phys))
    }

    /// Record a Command Completion Event.
    pub fn handle_completion(&mut self, ring: &mut TrbRing, event: &Trb) -> Result<CommandHandle> {
        let ptr = event.parameter() & !0xF;
        let Some(pending) = self
            .pending
            .iter_mut()
            .find(|p| p.phys == ptr && p.completion.is_none())
        else {
            warn!("command completion for unknown TRB {:#x}", ptr);
            return Err(Error::UnmatchedCompletion(ptr));
        };

        let completion = CommandCompletion {
            code: event.completion_code(),
            slot_id: event.slot_id(),
            parameter: event.event_residual(),
        };
        debug!("command {:?} at {:#x}: {:?}", pending.kind, ptr, completion);
        pending.completion = Some(completion);
        ring.update_dequeue(ptr);
        Ok(CommandHandle(ptr))
    }

    pub fn is_pending(&self, handle: CommandHandle) -> bool {
        self.pending.iter().any(|p| p.phys == handle.0)
    }

    /// Returns the completion once it has arrived, and forgets the command.
    pub fn take(&mut self, handle: CommandHandle) -> Option<CommandCompletion> {
        let index = self
            .pending
            .iter()
            .position(|p| p.phys == handle.0 && p.completion.is_some())?;
        self.pending.swap_remove(index).completion
    }

    /// Stop waiting for a command. A completion arriving later is unmatched.
    pub fn forget(&mut self, handle: CommandHandle) {
        self.pending.retain(|p| p.phys != handle.0);
    }

    pub fn outstanding(&self) -> usize {
        self.pending.iter().filter(|p| p.completion.is_none()).count()
    }

    pub fn clear(&mut self) {
        if self.outstanding() != 0 {
            warn!("dropping {} outstanding commands", self.outstanding());
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostHal;
    use crate::regs::Capabilities;

    fn completion(ptr: u64, code: CompletionCode, slot: u8) -> Trb {
        Trb::new(
            ptr,
            (code.raw() as u32) << 24,
            (TrbType::CommandCompletionEvent as u32) << 10 | (slot as u32) << 24 | 1,
        )
    }

    #[test]
    fn completions_match_by_pointer() {
        let (mut hal, sim) = HostHal::new();
        let mmio = sim.mmio();
        let caps = Capabilities::read(&mmio);
        let regs = Registers::new(mmio, &caps);
        let mut ring = TrbRing::new(&mut hal, 16, true).unwrap();
        let mut commands = CommandProcessor::new();

        let a = commands.submit(&mut ring, &regs, Trb::enable_slot(0)).unwrap();
        let b = commands.submit(&mut ring, &regs, Trb::no_op_command()).unwrap();
        let c = commands.submit(&mut ring, &regs, Trb::enable_slot(0)).unwrap();
        assert_eq!(sim.doorbells(), [(0, 0), (0, 0), (0, 0)]);

        // The controller answers C, then A, then B.
        commands
            .handle_completion(&mut ring, &completion(c.trb_phys(), CompletionCode::Success, 2))
            .unwrap();
        commands
            .handle_completion(&mut ring, &completion(a.trb_phys(), CompletionCode::Success, 1))
            .unwrap();
        assert_eq!(commands.take(b), None);
        commands
            .handle_completion(&mut ring, &completion(b.trb_phys(), CompletionCode::Trb, 0))
            .unwrap();

        assert_eq!(commands.take(a).map(|c| c.slot_id), Some(1));
        assert_eq!(commands.take(c).map(|c| c.slot_id), Some(2));
        let b = commands.take(b).unwrap();
        assert_eq!(b.into_result(), Err(Error::Command(CompletionCode::Trb)));
        assert_eq!(commands.outstanding(), 0);

        ring.release(&mut hal);
    }

    #[test]
    fn unknown_pointer_is_reported() {
        let (mut hal, sim) = HostHal::new();
        let mmio = sim.mmio();
        let caps = Capabilities::read(&mmio);
        let regs = Registers::new(mmio, &caps);
        let mut ring = TrbRing::new(&mut hal, 16, true).unwrap();
        let mut commands = CommandProcessor::new();

        let a = commands.submit(&mut ring, &regs, Trb::no_op_command()).unwrap();
        let stray = a.trb_phys() + 0x100;
        assert_eq!(
            commands.handle_completion(&mut ring, &completion(stray, CompletionCode::Success, 0)),
            Err(Error::UnmatchedCompletion(stray))
        );
        assert!(commands.is_pending(a));

        // A second completion for the same command is just as unexpected.
        commands
            .handle_completion(&mut ring, &completion(a.trb_phys(), CompletionCode::Success, 0))
            .unwrap();
        assert!(commands
            .handle_completion(&mut ring, &completion(a.trb_phys(), CompletionCode::Success, 0))
            .is_err());

        ring.release(&mut hal);
    }

    #[test]
    fn full_command_ring_rings_no_doorbell() {
        let (mut hal, sim) = HostHal::new();
        let mmio = sim.mmio();
        let caps = Capabilities::read(&mmio);
        let regs = Registers::new(mmio, &caps);
        let mut ring = TrbRing::new(&mut hal, 2, true).unwrap();
        let mut commands = CommandProcessor::new();

        commands.submit(&mut ring, &regs, Trb::no_op_command()).unwrap();
        assert_eq!(
            commands.submit(&mut ring, &regs, Trb::no_op_command()),
            Err(Error::RingFull)
        );
        assert_eq!(sim.doorbells().len(), 1);
        assert_eq!(commands.outstanding(), 1);

        ring.release(&mut hal);
    }
}
