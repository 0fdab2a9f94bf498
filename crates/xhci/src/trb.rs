//! Transfer Request Blocks (xHCI 1.2, section 6.4).

use byteorder::{ByteOrder, LittleEndian};

pub const TRB_SIZE: usize = 16;

/// Largest transfer a single Normal/Data TRB can describe.
pub const TRB_MAX_TRANSFER: usize = 0x10000;

/// One TRB as laid out in memory. Fields are kept in controller (little
/// endian) byte order, accessors convert.
#[repr(C, align(16))]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Trb {
    parameter: u64,
    status: u32,
    control: u32,
}

unsafe impl bytemuck::Zeroable for Trb {}
unsafe impl bytemuck::Pod for Trb {}

const _: () = assert!(core::mem::size_of::<Trb>() == TRB_SIZE);

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct TrbFlags: u32 {
        const CYCLE = 1 << 0;
        /// Link TRBs: toggle the consumer cycle state.
        const TOGGLE_CYCLE = 1 << 1;
        const ENT = 1 << 1;
        const ISP = 1 << 2;
        const NO_SNOOP = 1 << 3;
        const CHAIN = 1 << 4;
        const IOC = 1 << 5;
        const IDT = 1 << 6;
        const BEI = 1 << 9;
        /// Address Device: block SET_ADDRESS.
        const BSR = 1 << 9;
        /// Configure Endpoint: deconfigure.
        const DC = 1 << 9;
        /// Data and Status stages: device to host.
        const DIR_IN = 1 << 16;
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrbType {
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Isoch = 5,
    Link = 6,
    EventData = 7,
    NoOp = 8,
    EnableSlot = 9,
    DisableSlot = 10,
    AddressDevice = 11,
    ConfigureEndpoint = 12,
    EvaluateContext = 13,
    ResetEndpoint = 14,
    StopEndpoint = 15,
    SetTrDequeue = 16,
    ResetDevice = 17,
    ForceEvent = 18,
    NegotiateBandwidth = 19,
    SetLatencyTolerance = 20,
    GetPortBandwidth = 21,
    ForceHeader = 22,
    NoOpCommand = 23,
    TransferEvent = 32,
    CommandCompletionEvent = 33,
    PortStatusChangeEvent = 34,
    BandwidthRequestEvent = 35,
    DoorbellEvent = 36,
    HostControllerEvent = 37,
    DeviceNotificationEvent = 38,
    MfindexWrapEvent = 39,
}

impl TrbType {
    pub fn from_raw(raw: u8) -> Option<Self> {
        use TrbType::*;
        Some(match raw {
            1 => Normal,
            2 => SetupStage,
            3 => DataStage,
            4 => StatusStage,
            5 => Isoch,
            6 => Link,
            7 => EventData,
            8 => NoOp,
            9 => EnableSlot,
            10 => DisableSlot,
            11 => AddressDevice,
            12 => ConfigureEndpoint,
            13 => EvaluateContext,
            14 => ResetEndpoint,
            15 => StopEndpoint,
            16 => SetTrDequeue,
            17 => ResetDevice,
            18 => ForceEvent,
            19 => NegotiateBandwidth,
            20 => SetLatencyTolerance,
            21 => GetPortBandwidth,
            22 => ForceHeader,
            23 => NoOpCommand,
            32 => TransferEvent,
            33 => CommandCompletionEvent,
            34 => PortStatusChangeEvent,
            35 => BandwidthRequestEvent,
            36 => DoorbellEvent,
            37 => HostControllerEvent,
            38 => DeviceNotificationEvent,
            39 => MfindexWrapEvent,
            _ => return None,
        })
    }
}

macro_rules! completion_codes {
    ($($name:ident = $value:literal,)*) => {
        /// Completion codes (6.4.5). Codes this driver has no name for are
        /// carried through unmodified in `Other`.
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        pub enum CompletionCode {
            $($name,)*
            Other(u8),
        }

        impl CompletionCode {
            pub fn from_raw(raw: u8) -> Self {
                match raw {
                    $($value => CompletionCode::$name,)*
                    other => CompletionCode::Other(other),
                }
            }

            pub fn raw(self) -> u8 {
                match self {
                    $(CompletionCode::$name => $value,)*
                    CompletionCode::Other(other) => other,
                }
            }
        }
    };
}

completion_codes! {
    Invalid = 0,
    Success = 1,
    DataBuffer = 2,
    Babble = 3,
    UsbTransaction = 4,
    Trb = 5,
    Stall = 6,
    Resource = 7,
    Bandwidth = 8,
    NoSlotsAvailable = 9,
    InvalidStreamType = 10,
    SlotNotEnabled = 11,
    EndpointNotEnabled = 12,
    ShortPacket = 13,
    RingUnderrun = 14,
    RingOverrun = 15,
    VfEventRingFull = 16,
    Parameter = 17,
    BandwidthOverrun = 18,
    ContextState = 19,
    NoPingResponse = 20,
    EventRingFull = 21,
    IncompatibleDevice = 22,
    MissedService = 23,
    CommandRingStopped = 24,
    CommandAborted = 25,
    Stopped = 26,
    StoppedLengthInvalid = 27,
    StoppedShortPacket = 28,
    MaxExitLatencyTooLarge = 29,
    IsochBuffer = 31,
    EventLost = 32,
    Undefined = 33,
    InvalidStreamId = 34,
    SecondaryBandwidth = 35,
    SplitTransaction = 36,
}

/// Setup stage Transfer Type field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetupTransferType {
    NoData = 0,
    Out = 2,
    In = 3,
}

fn type_bits(ty: TrbType) -> u32 {
    (ty as u32) << 10
}

fn slot_bits(slot: u8) -> u32 {
    (slot as u32) << 24
}

impl Trb {
    pub fn new(parameter: u64, status: u32, control: u32) -> Self {
        Trb {
            parameter: parameter.to_le(),
            status: status.to_le(),
            control: control.to_le(),
        }
    }

    pub fn parameter(&self) -> u64 {
        u64::from_le(self.parameter)
    }

    pub fn status(&self) -> u32 {
        u32::from_le(self.status)
    }

    pub fn control(&self) -> u32 {
        u32::from_le(self.control)
    }

    pub fn flags(&self) -> TrbFlags {
        TrbFlags::from_bits_truncate(self.control())
    }

    pub fn raw_type(&self) -> u8 {
        ((self.control() >> 10) & 0x3F) as u8
    }

    pub fn trb_type(&self) -> Option<TrbType> {
        TrbType::from_raw(self.raw_type())
    }

    pub fn cycle(&self) -> bool {
        self.control() & TrbFlags::CYCLE.bits() != 0
    }

    pub fn with_cycle(self, cycle: bool) -> Self {
        let control = if cycle {
            self.control() | TrbFlags::CYCLE.bits()
        } else {
            self.control() & !TrbFlags::CYCLE.bits()
        };
        Trb::new(self.parameter(), self.status(), control)
    }

    pub fn with_flags(self, flags: TrbFlags) -> Self {
        Trb::new(self.parameter(), self.status(), self.control() | flags.bits())
    }

    // Transfer TRBs

    pub fn link(target: u64, toggle_cycle: bool) -> Self {
        let mut control = type_bits(TrbType::Link);
        if toggle_cycle {
            control |= TrbFlags::TOGGLE_CYCLE.bits();
        }
        Trb::new(target & !0xF, 0, control)
    }

    /// `td_size` is the number of packets still to come after this TRB.
    pub fn normal(buffer: u64, len: usize, td_size: u32) -> Self {
        Trb::new(buffer, transfer_status(len, td_size), type_bits(TrbType::Normal))
    }

    pub fn setup_stage(setup: [u8; 8], transfer_type: SetupTransferType) -> Self {
        let control = type_bits(TrbType::SetupStage)
            | TrbFlags::IDT.bits()
            | (transfer_type as u32) << 16;
        Trb::new(LittleEndian::read_u64(&setup), 8, control)
    }

    pub fn data_stage(buffer: u64, len: usize, td_size: u32, dir_in: bool) -> Self {
        let mut control = type_bits(TrbType::DataStage);
        if dir_in {
            control |= TrbFlags::DIR_IN.bits();
        }
        Trb::new(buffer, transfer_status(len, td_size), control)
    }

    pub fn status_stage(dir_in: bool) -> Self {
        let mut control = type_bits(TrbType::StatusStage) | TrbFlags::IOC.bits();
        if dir_in {
            control |= TrbFlags::DIR_IN.bits();
        }
        Trb::new(0, 0, control)
    }

    // Command TRBs

    pub fn no_op_command() -> Self {
        Trb::new(0, 0, type_bits(TrbType::NoOpCommand))
    }

    pub fn enable_slot(slot_type: u8) -> Self {
        Trb::new(0, 0, type_bits(TrbType::EnableSlot) | ((slot_type as u32 & 0x1F) << 16))
    }

    pub fn disable_slot(slot: u8) -> Self {
        Trb::new(0, 0, type_bits(TrbType::DisableSlot) | slot_bits(slot))
    }

    pub fn address_device(input_context: u64, slot: u8, block_set_address: bool) -> Self {
        let mut control = type_bits(TrbType::AddressDevice) | slot_bits(slot);
        if block_set_address {
            control |= TrbFlags::BSR.bits();
        }
        Trb::new(input_context & !0xF, 0, control)
    }

    pub fn configure_endpoint(input_context: u64, slot: u8, deconfigure: bool) -> Self {
        let mut control = type_bits(TrbType::ConfigureEndpoint) | slot_bits(slot);
        if deconfigure {
            control |= TrbFlags::DC.bits();
        }
        Trb::new(input_context & !0xF, 0, control)
    }

    pub fn evaluate_context(input_context: u64, slot: u8) -> Self {
        Trb::new(
            input_context & !0xF,
            0,
            type_bits(TrbType::EvaluateContext) | slot_bits(slot),
        )
    }

    pub fn reset_endpoint(slot: u8, dci: u8, preserve_transfer_state: bool) -> Self {
        let mut control = type_bits(TrbType::ResetEndpoint) | slot_bits(slot) | (dci as u32) << 16;
        if preserve_transfer_state {
            control |= 1 << 9;
        }
        Trb::new(0, 0, control)
    }

    pub fn stop_endpoint(slot: u8, dci: u8) -> Self {
        Trb::new(0, 0, type_bits(TrbType::StopEndpoint) | slot_bits(slot) | (dci as u32) << 16)
    }

    pub fn reset_device(slot: u8) -> Self {
        Trb::new(0, 0, type_bits(TrbType::ResetDevice) | slot_bits(slot))
    }

    // Event TRB fields

    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_raw((self.status() >> 24) as u8)
    }

    /// Transfer events: bytes not transferred. Command completions: the
    /// command completion parameter.
    pub fn event_residual(&self) -> u32 {
        self.status() & 0xFF_FFFF
    }

    pub fn slot_id(&self) -> u8 {
        (self.control() >> 24) as u8
    }

    pub fn endpoint_id(&self) -> u8 {
        ((self.control() >> 16) & 0x1F) as u8
    }

    pub fn port_id(&self) -> u8 {
        ((self.parameter() >> 24) & 0xFF) as u8
    }
}

fn transfer_status(len: usize, td_size: u32) -> u32 {
    debug_assert!(len <= TRB_MAX_TRANSFER);
    (len as u32 & 0x1_FFFF) | (td_size.min(31) << 17)
}

impl core::fmt::Debug for Trb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let ty = self.trb_type();
        f.debug_struct("Trb")
            .field("type", &format_args!("{:?} ({})", ty, self.raw_type()))
            .field("parameter", &format_args!("{:#x}", self.parameter()))
            .field("status", &format_args!("{:#x}", self.status()))
            .field("control", &format_args!("{:#x}", self.control()))
            .finish()
    }
}
