#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Core of the xHCI (USB 3) host controller driver.
//!
//! The controller is driven through three rings shared with the hardware:
//! the command ring and per-endpoint transfer rings are produced by us and
//! consumed by the controller, the event ring is produced by the controller
//! and consumed by us (from the interrupt handler or a poll).
//!
//! Typical bring-up:
//!
//! ```text
//! let mut hc = Controller::new(hal);
//! hc.init_mmio(&resources)?;
//! let (code, irq) = hc.irq_code_gen(&resources)?;   // hand to the platform
//! hc.init_memory()?;
//! hc.claim()?;
//! hc.start(true)?;
//! ```
//!
//! Everything that touches hardware or memory goes through [`Hal`], so the
//! crate itself makes no assumption about the kernel it runs under.

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;


#[cfg(any(test, feature = "std"))]
pub mod host;

pub mod bus;
pub mod command;
pub mod context;
pub mod error;
pub mod event;
pub mod extcap;
pub mod hal;
pub mod hc;
pub mod irq;
pub mod regs;
pub mod rh;
pub mod ring;
pub mod transfer;
pub mod trb;

pub use context::SlotId;
pub use error::{Error, Result};
pub use hal::{DmaBuffer, DmaRegion, Hal, HwResources, MappedMmio, MemRange, Mmio};
pub use hc::{Controller, ControllerState, LegacyHandoff};
pub use transfer::{Direction, Target, TransferBatch, TransferId, TransferType};
pub use trb::{CompletionCode, Trb, TrbType};
