//! Addressed devices and their transfers.

use alloc::vec::Vec;

use log::{debug, warn};

use crate::context::SlotId;
use crate::error::{Error, Result};
use crate::transfer::TransferScheduler;

/// USB addresses are 7 bits; 0 is the default address and never assigned.
const ADDRESSES: usize = 128;

pub struct Bus {
    devices: Vec<Option<SlotId>>,
    pub transfers: TransferScheduler,
}

impl Bus {
    pub fn new() -> Result<Self> {
        let mut devices = Vec::new();
        devices.try_reserve_exact(ADDRESSES).map_err(|_| Error::NoMemory)?;
        devices.resize(ADDRESSES, None);
        Ok(Bus {
            devices,
            transfers: TransferScheduler::new(),
        })
    }

    pub fn register(&mut self, address: u8, slot: SlotId) -> Result<()> {
        let entry = match self.devices.get_mut(address as usize) {
            Some(entry) if address != 0 => entry,
            _ => return Err(Error::InvalidTarget),
        };
        if let Some(other) = entry {
            warn!("address {} already belongs to slot {}", address, other);
            return Err(Error::InvalidState);
        }
        *entry = Some(slot);
        debug!("address {} -> slot {}", address, slot);
        Ok(())
    }

    pub fn slot_for(&self, address: u8) -> Option<SlotId> {
        *self.devices.get(address as usize)?
    }

    /// Forget the device on `slot` together with its transfers.
    pub fn remove_slot(&mut self, slot: SlotId) {
        for entry in self.devices.iter_mut().filter(|e| **e == Some(slot)) {
            *entry = None;
        }
        self.transfers.forget_slot(slot);
    }

    pub fn fini(&mut self) {
        self.transfers.clear();
        self.devices.iter_mut().for_each(|e| *e = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_map() {
        let mut bus = Bus::new().unwrap();
        let slot = SlotId::new(3, 8).unwrap();

        assert_eq!(bus.register(0, slot), Err(Error::InvalidTarget));
        assert_eq!(bus.register(128, slot), Err(Error::InvalidTarget));
        bus.register(5, slot).unwrap();
        assert_eq!(bus.register(5, SlotId::new(4, 8).unwrap()), Err(Error::InvalidState));
        assert_eq!(bus.slot_for(5), Some(slot));

        bus.remove_slot(slot);
        assert_eq!(bus.slot_for(5), None);
        assert_eq!(bus.slot_for(200), None);
    }
}
