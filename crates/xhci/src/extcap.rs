//! Extended capability list (xHCI 1.2, section 7).

use log::{debug, error, trace, warn};

use crate::error::{ConfigError, Error, Result};
use crate::hal::Mmio;

pub const CAP_LEGACY_SUPPORT: u8 = 1;
pub const CAP_SUPPORTED_PROTOCOL: u8 = 2;

/// Protocol name of every Supported Protocol capability we can drive.
pub const USB_NAME: [u8; 4] = *b"USB ";

// USBLEGSUP semaphores
pub const LEGSUP_BIOS_OWNED: u32 = 1 << 16;
pub const LEGSUP_OS_OWNED: u32 = 1 << 24;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortSpeed {
    pub name: [u8; 4],
    pub major: u8,
    pub minor: u8,
    pub rx_bps: u64,
    pub tx_bps: u64,
}

const fn psi_to_bps(psie: u8, psim: u16) -> u64 {
    (psim as u64) << (10 * psie as u32)
}

const fn implied_speed(major: u8, psie: u8, psim: u16) -> PortSpeed {
    PortSpeed {
        name: USB_NAME,
        major,
        minor: 0,
        rx_bps: psi_to_bps(psie, psim),
        tx_bps: psi_to_bps(psie, psim),
    }
}

// Default speed ID mapping (table 7-13)
pub const SPEED_FULL: PortSpeed = implied_speed(2, 2, 12);
pub const SPEED_LOW: PortSpeed = implied_speed(2, 1, 1500);
pub const SPEED_HIGH: PortSpeed = implied_speed(2, 2, 480);
pub const SPEED_SUPER: PortSpeed = implied_speed(3, 3, 5);

/// Speeds by Protocol Speed ID value (PSIV, the PORTSC speed field).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PortSpeedTable([Option<PortSpeed>; 16]);

impl PortSpeedTable {
    pub fn get(&self, psiv: u8) -> Option<&PortSpeed> {
        self.0.get(psiv as usize)?.as_ref()
    }

    fn entry(&mut self, psiv: u8) -> &mut Option<PortSpeed> {
        &mut self.0[psiv as usize & 0xF]
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &PortSpeed)> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, s)| Some((i as u8, s.as_ref()?)))
    }
}

/// Protocol Speed ID dword (7.2.1).
#[derive(Copy, Clone, Debug)]
struct Psi(u32);

impl Psi {
    const PLT_SYMMETRIC: u8 = 0;
    const PLT_RX: u8 = 2;
    const PLT_TX: u8 = 3;

    fn psiv(self) -> u8 {
        (self.0 & 0xF) as u8
    }

    fn psie(self) -> u8 {
        ((self.0 >> 4) & 0x3) as u8
    }

    fn plt(self) -> u8 {
        ((self.0 >> 6) & 0x3) as u8
    }

    fn psim(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExtCap {
    /// Byte offset from the start of the MMIO region.
    pub offset: usize,
    pub id: u8,
}

/// Walks the capability chain starting at `xecp` (a byte offset, 0 for none).
/// Stops early instead of reading past `limit`.
pub struct ExtCapIter<'a, M> {
    mmio: &'a M,
    next: usize,
    limit: usize,
}

impl<'a, M: Mmio> ExtCapIter<'a, M> {
    pub fn new(mmio: &'a M, xecp: usize, limit: usize) -> Self {
        ExtCapIter {
            mmio,
            next: xecp,
            limit,
        }
    }
}

impl<M: Mmio> Iterator for ExtCapIter<'_, M> {
    type Item = ExtCap;

    fn next(&mut self) -> Option<ExtCap> {
        let offset = self.next;
        if offset == 0 {
            return None;
        }
        if offset + 4 > self.limit {
            warn!("extended capability at {:#x} is outside the register window", offset);
            self.next = 0;
            return None;
        }

        let header = self.mmio.read32(offset);
        let next = ((header >> 8) & 0xFF) as usize * 4;
        self.next = if next == 0 { 0 } else { offset + next };
        Some(ExtCap {
            offset,
            id: header as u8,
        })
    }
}

/// Result of walking the capability list.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtCapInfo {
    /// USB Legacy Support capability, if the controller has one.
    pub legacy: Option<usize>,
    pub protocols: usize,
}

pub fn parse<M: Mmio>(mmio: &M, xecp: usize, limit: usize, speeds: &mut PortSpeedTable) -> Result<ExtCapInfo> {
    let mut info = ExtCapInfo::default();
    for cap in ExtCapIter::new(mmio, xecp, limit) {
        trace!("extended capability {} at {:#x}", cap.id, cap.offset);
        match cap.id {
            CAP_LEGACY_SUPPORT => {
                if info.legacy.is_some() {
                    error!("second legacy support capability at {:#x}", cap.offset);
                    return Err(Error::Logic);
                }
                info.legacy = Some(cap.offset);
            }
            CAP_SUPPORTED_PROTOCOL => {
                parse_protocol(mmio, cap.offset, limit, speeds)?;
                info.protocols += 1;
            }
            _ => {}
        }
    }
    Ok(info)
}

fn parse_protocol<M: Mmio>(mmio: &M, offset: usize, limit: usize, speeds: &mut PortSpeedTable) -> Result<()> {
    let dword0 = mmio.read32(offset);
    let minor = (dword0 >> 16) as u8;
    let major = (dword0 >> 24) as u8;
    let name = mmio.read32(offset + 4).to_le_bytes();
    let psic = (mmio.read32(offset + 8) >> 28) as usize;

    if name != USB_NAME {
        error!("unknown protocol {:?}", core::str::from_utf8(&name).unwrap_or("????"));
        return Err(Error::UnsupportedProtocol(name));
    }

    if psic == 0 {
        if minor != 0 {
            warn!("implied speeds with minor revision {:#x}", minor);
        }
        match major {
            2 => {
                *speeds.entry(1) = Some(SPEED_FULL);
                *speeds.entry(2) = Some(SPEED_LOW);
                *speeds.entry(3) = Some(SPEED_HIGH);
            }
            3 => *speeds.entry(4) = Some(SPEED_SUPER),
            _ => return Err(ConfigError::UnsupportedRevision(major).into()),
        }
        debug!("implied speeds of USB {}.0", major);
        return Ok(());
    }

    if offset + 16 + 4 * psic > limit {
        return Err(ConfigError::RegionTooSmall(limit).into());
    }
    for i in 0..psic {
        let psi = Psi(mmio.read32(offset + 16 + 4 * i));
        let bps = psi_to_bps(psi.psie(), psi.psim());
        let speed = speeds.entry(psi.psiv()).get_or_insert(PortSpeed {
            name,
            major,
            minor,
            rx_bps: 0,
            tx_bps: 0,
        });
        speed.name = name;
        speed.major = major;
        speed.minor = minor;

        match psi.plt() {
            Psi::PLT_SYMMETRIC => {
                speed.rx_bps = bps;
                speed.tx_bps = bps;
            }
            Psi::PLT_RX => speed.rx_bps = bps,
            Psi::PLT_TX => speed.tx_bps = bps,
            plt => warn!("reserved PSI link type {} for speed {}", plt, psi.psiv()),
        }
        debug!("speed {}: {:?}", psi.psiv(), speed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ExtCapBuilder, Sim};

    #[test]
    fn default_rates() {
        assert_eq!(SPEED_FULL.rx_bps, 12 << 20);
        assert_eq!(SPEED_LOW.rx_bps, 1500 << 10);
        assert_eq!(SPEED_HIGH.tx_bps, 480 << 20);
        assert_eq!(SPEED_SUPER.rx_bps, 5 << 30);
    }

    #[test]
    fn implied_usb2_speeds_are_idempotent() {
        let sim = Sim::with_extcaps(ExtCapBuilder::new().protocol(2, 0, *b"USB ", &[]));
        let mmio = sim.mmio();
        let xecp = sim.xecp();

        let mut once = PortSpeedTable::default();
        parse(&mmio, xecp, sim.mmio_len(), &mut once).unwrap();
        let mut twice = once;
        parse(&mmio, xecp, sim.mmio_len(), &mut twice).unwrap();

        assert_eq!(once, twice);
        assert_eq!(once.get(1), Some(&SPEED_FULL));
        assert_eq!(once.get(2), Some(&SPEED_LOW));
        assert_eq!(once.get(3), Some(&SPEED_HIGH));
        assert_eq!(once.get(4), None);
        assert_eq!(once.iter().count(), 3);
    }

    #[test]
    fn explicit_psi_entries() {
        // PSIV 5: 10 Gb/s symmetric; PSIV 6: 20 Gb/s rx, 10 Gb/s tx.
        let psi = [
            5 | 3 << 4 | 0 << 6 | 10 << 16,
            6 | 3 << 4 | 2 << 6 | 20 << 16,
            6 | 3 << 4 | 3 << 6 | 10 << 16,
        ];
        let sim = Sim::with_extcaps(ExtCapBuilder::new().protocol(3, 0x10, *b"USB ", &psi));
        let mut speeds = PortSpeedTable::default();
        parse(&sim.mmio(), sim.xecp(), sim.mmio_len(), &mut speeds).unwrap();

        let s5 = speeds.get(5).unwrap();
        assert_eq!((s5.major, s5.minor), (3, 0x10));
        assert_eq!((s5.rx_bps, s5.tx_bps), (10 << 30, 10 << 30));
        let s6 = speeds.get(6).unwrap();
        assert_eq!((s6.rx_bps, s6.tx_bps), (20 << 30, 10 << 30));
    }

    #[test]
    fn foreign_protocol_is_refused() {
        let sim = Sim::with_extcaps(ExtCapBuilder::new().protocol(2, 0, *b"UFS ", &[]));
        let mut speeds = PortSpeedTable::default();
        assert_eq!(
            parse(&sim.mmio(), sim.xecp(), sim.mmio_len(), &mut speeds),
            Err(Error::UnsupportedProtocol(*b"UFS "))
        );
    }

    #[test]
    fn unknown_major_with_implied_speeds() {
        let sim = Sim::with_extcaps(ExtCapBuilder::new().protocol(4, 0, *b"USB ", &[]));
        let mut speeds = PortSpeedTable::default();
        assert_eq!(
            parse(&sim.mmio(), sim.xecp(), sim.mmio_len(), &mut speeds),
            Err(Error::Config(ConfigError::UnsupportedRevision(4)))
        );
    }

    #[test]
    fn legacy_and_unknown_capabilities() {
        let caps = ExtCapBuilder::new()
            .legacy(false)
            .raw(0xC0)
            .protocol(3, 0, *b"USB ", &[]);
        let sim = Sim::with_extcaps(caps);
        let mut speeds = PortSpeedTable::default();
        let info = parse(&sim.mmio(), sim.xecp(), sim.mmio_len(), &mut speeds).unwrap();
        assert_eq!(info.legacy, Some(sim.xecp()));
        assert_eq!(info.protocols, 1);
        assert_eq!(speeds.get(4), Some(&SPEED_SUPER));

        let twice = ExtCapBuilder::new().legacy(false).legacy(false);
        let sim = Sim::with_extcaps(twice);
        assert_eq!(
            parse(&sim.mmio(), sim.xecp(), sim.mmio_len(), &mut speeds),
            Err(Error::Logic)
        );
    }
}
