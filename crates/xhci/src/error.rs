use core::fmt;
use core::result::Result as CoreResult;

use crate::trb::CompletionCode;

/// Resource or hardware description problems found during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The controller must be described by exactly one MMIO range.
    UnexpectedMmioRanges(usize),
    /// Interrupt code generation needs exactly one IRQ.
    UnexpectedIrqs(usize),
    /// The MMIO range cannot even hold the capability registers.
    RegionTooSmall(usize),
    /// Supported Protocol capability with implied speeds and an unknown major revision.
    UnsupportedRevision(u8),
}

/// The bounded hardware handshakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// USBSTS.HCH did not come up after R/S was cleared.
    Halt,
    /// USBCMD.HCRST did not self-clear.
    Reset,
    /// USBSTS.CNR did not clear.
    ControllerNotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Config(ConfigError),
    /// Protocol name of a Supported Protocol capability other than "USB ".
    UnsupportedProtocol([u8; 4]),
    /// DMA or heap allocation failed.
    NoMemory,
    Timeout(Handshake),
    /// A command got no completion event within the bounded wait.
    CommandTimeout,
    /// A transfer got no transfer event within the bounded wait.
    TransferTimeout,
    /// Transfers to the default address (0) are not allowed.
    InvalidTarget,
    /// Transfer type (or operation) not implemented.
    NotSupported,
    InvalidSlot(u8),
    SlotInUse(u8),
    /// Endpoint is not set up on the slot, or is not a USB endpoint number.
    InvalidEndpoint(u8),
    RingFull,
    /// Operation not valid in the current controller or slot state.
    InvalidState,
    /// Command completed with a code other than Success.
    Command(CompletionCode),
    /// Transfer completed with this hardware code.
    Transfer(CompletionCode),
    /// Completion event for a TRB nobody is waiting on.
    UnmatchedCompletion(u64),
    UnknownEvent(u8),
    HostSystemError,
    /// Status bits left set after interrupt handling.
    UnhandledStatus(u32),
    /// Internal invariant violated (e.g. a second legacy support capability).
    Logic,
}

pub type Result<T> = CoreResult<T, Error>;

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnexpectedMmioRanges(n) => write!(f, "expected one MMIO range, got {n}"),
            ConfigError::UnexpectedIrqs(n) => write!(f, "expected one IRQ, got {n}"),
            ConfigError::RegionTooSmall(size) => write!(f, "MMIO range too small ({size} bytes)"),
            ConfigError::UnsupportedRevision(major) => write!(f, "unsupported USB revision {major}"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(err) => write!(f, "configuration error: {err}"),
            Error::UnsupportedProtocol(name) => {
                let name = core::str::from_utf8(name).unwrap_or("????");
                write!(f, "unsupported protocol {name:?}")
            }
            Error::NoMemory => f.write_str("out of memory"),
            Error::Timeout(what) => write!(f, "hardware handshake timed out: {what:?}"),
            Error::CommandTimeout => f.write_str("command did not complete"),
            Error::TransferTimeout => f.write_str("transfer did not complete"),
            Error::InvalidTarget => f.write_str("transfer to address 0"),
            Error::NotSupported => f.write_str("not supported"),
            Error::InvalidSlot(slot) => write!(f, "invalid slot {slot}"),
            Error::SlotInUse(slot) => write!(f, "slot {slot} already enabled"),
            Error::InvalidEndpoint(dci) => write!(f, "endpoint {dci} not configured"),
            Error::RingFull => f.write_str("ring full"),
            Error::InvalidState => f.write_str("invalid state"),
            Error::Command(code) => write!(f, "command failed: {code:?}"),
            Error::Transfer(code) => write!(f, "transfer failed: {code:?}"),
            Error::UnmatchedCompletion(ptr) => write!(f, "no command at {ptr:#x}"),
            Error::UnknownEvent(ty) => write!(f, "unhandled event type {ty}"),
            Error::HostSystemError => f.write_str("host system error"),
            Error::UnhandledStatus(bits) => write!(f, "unhandled status bits {bits:#010x}"),
            Error::Logic => f.write_str("logic error"),
        }
    }
}

impl core::error::Error for Error {}
