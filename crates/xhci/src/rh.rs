//! Root hub ports.

use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::extcap::PortSpeedTable;
use crate::hal::Mmio;
use crate::regs::{PortSc, Registers};
use crate::trb::Trb;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PortStatus {
    pub connected: bool,
    pub enabled: bool,
    /// Protocol Speed ID, meaningful while connected.
    pub speed: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortChange {
    pub port: u8,
    pub status: PortStatus,
}

pub struct RootHub {
    ports: Vec<PortStatus>,
    changes: Vec<PortChange>,
}

impl RootHub {
    pub fn new(max_ports: u8) -> Result<Self> {
        let mut ports = Vec::new();
        ports.try_reserve_exact(max_ports as usize).map_err(|_| Error::NoMemory)?;
        ports.resize(max_ports as usize, PortStatus::default());
        Ok(RootHub {
            ports,
            changes: Vec::new(),
        })
    }

    pub fn max_ports(&self) -> u8 {
        self.ports.len() as u8
    }

    /// Ports are numbered from 1.
    pub fn port(&self, port: u8) -> Option<PortStatus> {
        self.ports.get((port as usize).checked_sub(1)?).copied()
    }

    pub fn handle_port_status_change_event<M: Mmio>(
        &mut self,
        regs: &Registers<M>,
        speeds: &PortSpeedTable,
        event: &Trb,
    ) -> Result<()> {
        let port = event.port_id();
        if self.port(port).is_none() {
            warn!("port status change for nonexistent port {}", port);
            return Err(Error::InvalidState);
        }
        self.handle_port(regs, speeds, port);
        Ok(())
    }

    /// Looks at every port. Used after reset, which changes ports without
    /// raising events, and on USBSTS.PCD.
    pub fn handle_port_change<M: Mmio>(&mut self, regs: &Registers<M>, speeds: &PortSpeedTable) {
        for port in 1..=self.max_ports() {
            self.handle_port(regs, speeds, port);
        }
    }

    fn handle_port<M: Mmio>(&mut self, regs: &Registers<M>, speeds: &PortSpeedTable, port: u8) {
        let portsc = regs.portsc(port);
        let changed = portsc & PortSc::CHANGE_BITS;
        if !changed.is_empty() {
            // Change bits are RW1C; PED must be written as 0.
            regs.write_portsc(port, (portsc & PortSc::PRESERVE) | changed);
            debug!("port {}: acknowledged {:?}", port, changed);
        }

        let status = PortStatus {
            connected: portsc.contains(PortSc::CCS),
            enabled: portsc.contains(PortSc::PED),
            speed: if portsc.contains(PortSc::CCS) { portsc.speed() } else { 0 },
        };
        let slot = &mut self.ports[port as usize - 1];
        if *slot == status {
            return;
        }
        *slot = status;

        match (status.connected, speeds.get(status.speed)) {
            (true, Some(speed)) => info!(
                "port {}: device connected, USB {}.{:x} at {} b/s",
                port, speed.major, speed.minor, speed.rx_bps
            ),
            (true, None) => info!("port {}: device connected, unknown speed {}", port, status.speed),
            (false, _) => info!("port {}: disconnected", port),
        }
        self.changes.push(PortChange { port, status });
    }

    /// Start a port reset; USB2 devices need it before the port is enabled.
    pub fn reset_port<M: Mmio>(&self, regs: &Registers<M>, port: u8) -> Result<()> {
        if self.port(port).is_none() {
            return Err(Error::InvalidState);
        }
        let portsc = regs.portsc(port);
        regs.write_portsc(port, (portsc & PortSc::PRESERVE) | PortSc::PR);
        Ok(())
    }

    /// Changes seen since the last call, oldest first.
    pub fn take_changes(&mut self) -> Vec<PortChange> {
        core::mem::take(&mut self.changes)
    }
}
