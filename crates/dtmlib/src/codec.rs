//! DTM command encoder and response decoder.
//!
//! Direct Test Mode over a 2-wire UART uses fixed 16-bit words in both
//! directions. This module handles the pure bit packing of commands and the
//! interpretation of the two response event shapes. It performs no I/O.
//!
//! # Command format
//!
//! ```text
//!  15 14 | 13 .. 8 | 7 .. 2 | 1 0
//!  kind  | field1  | field2 | field3
//! ```
//!
//! - `kind`: Setup `00`, Receiver test `01`, Transmitter test `10`, End `11`
//! - for Setup, `field1` is the control, `field2` the parameter and `field3`
//!   the DC bits
//! - for Receiver/Transmitter tests, `field1` is the channel
//!   (`(f - 2402) / 2`), `field2` the payload length and `field3` the packet
//!   type
//!
//! Every field is masked to its width rather than validated, matching the
//! tolerant wire format of the device.
//!
//! # Response format
//!
//! Bit 7 of the first byte selects the event. A status event carries the
//! failure flag in bit 0 of the first byte. A packet report carries a 14-bit
//! packet count in the low 6 bits of the first byte and all of the second.

use dtmlib_core::types::PacketType;
use dtmlib_core::{Error, Result};

/// Mask for the two 2-bit fields.
const MASK_2: u8 = 0x03;
/// Mask for the two 6-bit fields.
const MASK_6: u8 = 0x3F;

/// Event bit in the first response byte.
const EVENT_BIT: u8 = 0x80;
/// Failure flag of a status event.
const STATUS_FAILED_BIT: u8 = 0x01;

/// Reserved length value that turns a vendor transmitter command into
/// "set TX power".
const VENDOR_TX_POWER: u8 = 2;
/// Reserved length value that turns a vendor transmitter command into
/// "select timer".
const VENDOR_SELECT_TIMER: u8 = 3;

/// The 2-bit command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Setup,
    ReceiverTest,
    TransmitterTest,
    End,
}

impl CommandKind {
    pub fn wire_value(&self) -> u8 {
        match self {
            CommandKind::Setup => 0b00,
            CommandKind::ReceiverTest => 0b01,
            CommandKind::TransmitterTest => 0b10,
            CommandKind::End => 0b11,
        }
    }

    fn from_wire(bits: u8) -> Self {
        match bits & MASK_2 {
            0b00 => CommandKind::Setup,
            0b01 => CommandKind::ReceiverTest,
            0b10 => CommandKind::TransmitterTest,
            _ => CommandKind::End,
        }
    }
}

/// Control code carried in `field1` of a Setup command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupControl {
    Reset,
    EnableLength,
    SetPhy,
    SetModulation,
    ReadFeatures,
    ReadSupportedRxTx,
}

impl SetupControl {
    pub fn wire_value(&self) -> u8 {
        match self {
            SetupControl::Reset => 0x00,
            SetupControl::EnableLength => 0x01,
            SetupControl::SetPhy => 0x02,
            SetupControl::SetModulation => 0x03,
            SetupControl::ReadFeatures => 0x04,
            SetupControl::ReadSupportedRxTx => 0x05,
        }
    }
}

/// A 16-bit DTM command word.
///
/// Construct commands with the `encode_*` functions; [`Command::new`] is
/// available for raw field access and masks every field to its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    kind: CommandKind,
    field1: u8,
    field2: u8,
    field3: u8,
}

impl Command {
    /// Build a command from raw field values, masking each to its width.
    pub fn new(kind: CommandKind, field1: u8, field2: u8, field3: u8) -> Self {
        Command {
            kind,
            field1: field1 & MASK_6,
            field2: field2 & MASK_6,
            field3: field3 & MASK_2,
        }
    }

    /// Parse a command from its two wire bytes.
    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        let word = u16::from_be_bytes(bytes);
        Command {
            kind: CommandKind::from_wire((word >> 14) as u8),
            field1: ((word >> 8) as u8) & MASK_6,
            field2: ((word >> 2) as u8) & MASK_6,
            field3: (word as u8) & MASK_2,
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn field1(&self) -> u8 {
        self.field1
    }

    pub fn field2(&self) -> u8 {
        self.field2
    }

    pub fn field3(&self) -> u8 {
        self.field3
    }

    /// The command as a 16-bit word.
    pub fn word(&self) -> u16 {
        (self.kind.wire_value() as u16) << 14
            | (self.field1 as u16) << 8
            | (self.field2 as u16) << 2
            | self.field3 as u16
    }

    /// Serialize to the two wire bytes, high byte first.
    pub fn to_bytes(&self) -> [u8; 2] {
        self.word().to_be_bytes()
    }
}

/// Encode an LE Test Setup command.
pub fn encode_setup(control: SetupControl, parameter: u8, dc: u8) -> Command {
    Command::new(CommandKind::Setup, control.wire_value(), parameter, dc)
}

/// Encode an LE Test End command.
pub fn encode_end() -> Command {
    Command::new(CommandKind::End, 0, 0, 0)
}

/// Encode an LE Transmitter Test command.
///
/// `channel` is the DTM channel index; its 6-bit encoding equals the
/// `(f - 2402) / 2` frequency field.
pub fn encode_transmitter(channel: u8, length: u8, packet_type: PacketType) -> Command {
    Command::new(
        CommandKind::TransmitterTest,
        channel,
        length,
        packet_type.wire_value(),
    )
}

/// Encode an LE Receiver Test command.
pub fn encode_receiver(channel: u8, length: u8, packet_type: PacketType) -> Command {
    Command::new(
        CommandKind::ReceiverTest,
        channel,
        length,
        packet_type.wire_value(),
    )
}

/// Encode the transmitter command used by transmitter tests.
///
/// The length is reduced to its low 6 bits (the upper bits travel in the
/// `EnableLength` setup command). With the vendor packet type the device
/// transmits an unmodulated carrier and the length field must be 0.
pub fn encode_carrier(channel: u8, length: u8, packet_type: PacketType) -> Command {
    let length = match packet_type {
        PacketType::Vendor => 0,
        _ => length & MASK_6,
    };
    encode_transmitter(channel, length, packet_type)
}

/// Encode the vendor "set TX power" command.
///
/// Negative values are truncated to 6 bits in two's complement, so -4 dBm
/// travels as `0b111100`.
pub fn encode_tx_power(dbm: i8) -> Command {
    Command::new(
        CommandKind::TransmitterTest,
        dbm as u8,
        VENDOR_TX_POWER,
        PacketType::Vendor.wire_value(),
    )
}

/// Encode the vendor "select timer" command.
pub fn encode_select_timer(value: u8) -> Command {
    Command::new(
        CommandKind::TransmitterTest,
        value,
        VENDOR_SELECT_TIMER,
        PacketType::Vendor.wire_value(),
    )
}

/// A decoded response event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Report {
    /// LE Test Status event.
    Status { failed: bool },
    /// LE Packet Report event with the 14-bit packet count.
    PacketReport { packets: u16 },
}

impl Report {
    pub fn is_packet_report(&self) -> bool {
        matches!(self, Report::PacketReport { .. })
    }

    /// `true` for a status event with the failure flag set.
    pub fn failed(&self) -> bool {
        matches!(self, Report::Status { failed: true })
    }

    /// Packet count of a packet report, 0 for a status event.
    pub fn received_packets(&self) -> u16 {
        match self {
            Report::PacketReport { packets } => *packets,
            Report::Status { .. } => 0,
        }
    }
}

/// A raw 2-byte response word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response([u8; 2]);

impl Response {
    pub fn new(bytes: [u8; 2]) -> Self {
        Response(bytes)
    }

    /// Build a response from a byte slice that must be exactly 2 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 2] = bytes
            .try_into()
            .map_err(|_| Error::MalformedResponse(bytes.len()))?;
        Ok(Response(bytes))
    }

    pub fn bytes(&self) -> [u8; 2] {
        self.0
    }

    /// Interpret the response.
    pub fn report(&self) -> Report {
        let [msb, lsb] = self.0;
        if msb & EVENT_BIT == 0 {
            Report::Status {
                failed: msb & STATUS_FAILED_BIT != 0,
            }
        } else {
            Report::PacketReport {
                packets: ((msb & MASK_6) as u16) << 8 | lsb as u16,
            }
        }
    }

    /// `true` for a status event without the failure flag.
    pub fn is_success(&self) -> bool {
        self.report() == Report::Status { failed: false }
    }
}

/// Decode a response byte sequence.
///
/// Fails with [`Error::MalformedResponse`] unless `bytes` is exactly two
/// bytes long.
pub fn decode_response(bytes: &[u8]) -> Result<Report> {
    Response::from_slice(bytes).map(|r| r.report())
}
