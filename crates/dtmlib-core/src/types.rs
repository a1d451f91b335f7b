//! Core types used throughout dtmlib.
//!
//! These are the wire-level vocabulary of Direct Test Mode: RF channels,
//! PHY selection, payload bit patterns, modulation index, and the
//! parameters understood by the "read supported maximum" setup command.

use std::fmt;
use std::str::FromStr;

/// Lowest RF frequency of the 2.4 GHz BLE band, in MHz (channel 0).
pub const BASE_FREQUENCY_MHZ: u16 = 2402;

/// Highest valid DTM channel index.
pub const MAX_CHANNEL: u8 = 39;

/// A DTM RF channel index (0..=39).
///
/// Channel `n` maps to the RF frequency `2402 + 2*n` MHz. Note that the DTM
/// numbering is the physical RF channel order, not the BLE link-layer
/// advertising/data channel numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    /// Create a channel from its index, returning `None` above 39.
    pub fn new(index: u8) -> Option<Self> {
        if index <= MAX_CHANNEL {
            Some(Channel(index))
        } else {
            None
        }
    }

    /// Create a channel from an RF frequency in MHz.
    ///
    /// Returns `None` if the frequency is not one of the 40 DTM channel
    /// centres.
    pub fn from_frequency_mhz(freq_mhz: u16) -> Option<Self> {
        if freq_mhz < BASE_FREQUENCY_MHZ || (freq_mhz - BASE_FREQUENCY_MHZ) % 2 != 0 {
            return None;
        }
        let index = (freq_mhz - BASE_FREQUENCY_MHZ) / 2;
        u8::try_from(index).ok().and_then(Channel::new)
    }

    /// Return the raw channel index.
    pub fn index(&self) -> u8 {
        self.0
    }

    /// Return the RF centre frequency of this channel in MHz.
    pub fn frequency_mhz(&self) -> u16 {
        channel_to_frequency(self.0)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} MHz)", self.0, self.frequency_mhz())
    }
}

/// Map a channel index to its RF frequency in MHz.
///
/// No range check is applied; out-of-range indices are masked later by the
/// command codec like any other field.
pub fn channel_to_frequency(channel: u8) -> u16 {
    BASE_FREQUENCY_MHZ + 2 * channel as u16
}

/// Physical layer selected with the `SetPhy` setup command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phy {
    /// LE 1 Mbps uncoded.
    Le1M,
    /// LE 2 Mbps uncoded.
    Le2M,
    /// LE Coded, S=8.
    LeCodedS8,
    /// LE Coded, S=2.
    LeCodedS2,
}

impl Phy {
    /// Parameter value carried in the setup command.
    pub fn wire_value(&self) -> u8 {
        match self {
            Phy::Le1M => 0x01,
            Phy::Le2M => 0x02,
            Phy::LeCodedS8 => 0x03,
            Phy::LeCodedS2 => 0x04,
        }
    }
}

impl fmt::Display for Phy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phy::Le1M => "LE 1Mbps",
            Phy::Le2M => "LE 2Mbps",
            Phy::LeCodedS8 => "LE Coded S8",
            Phy::LeCodedS2 => "LE Coded S2",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Phy {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1m" | "le1m" | "le-1m" => Ok(Phy::Le1M),
            "2m" | "le2m" | "le-2m" => Ok(Phy::Le2M),
            "s8" | "coded-s8" | "le-coded-s8" => Ok(Phy::LeCodedS8),
            "s2" | "coded-s2" | "le-coded-s2" => Ok(Phy::LeCodedS2),
            _ => Err(ParseTypeError::new("PHY", s)),
        }
    }
}

/// Payload bit pattern carried in the 2-bit packet-type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Pseudo-random PRBS9 sequence.
    Prbs9,
    /// Repeated `11110000`.
    Pattern11110000,
    /// Repeated `10101010`.
    Pattern10101010,
    /// Vendor specific. For transmitter tests this requests an unmodulated
    /// constant carrier; combined with reserved length values it selects
    /// TX power and timer configuration.
    Vendor,
}

impl PacketType {
    /// The 2-bit wire value.
    pub fn wire_value(&self) -> u8 {
        match self {
            PacketType::Prbs9 => 0x00,
            PacketType::Pattern11110000 => 0x01,
            PacketType::Pattern10101010 => 0x02,
            PacketType::Vendor => 0x03,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketType::Prbs9 => "PRBS9",
            PacketType::Pattern11110000 => "11110000",
            PacketType::Pattern10101010 => "10101010",
            PacketType::Vendor => "Constant",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PacketType {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prbs9" => Ok(PacketType::Prbs9),
            "11110000" => Ok(PacketType::Pattern11110000),
            "10101010" => Ok(PacketType::Pattern10101010),
            "constant" | "carrier" | "vendor" => Ok(PacketType::Vendor),
            _ => Err(ParseTypeError::new("packet type", s)),
        }
    }
}

/// Modulation index selected with the `SetModulation` setup command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModulationIndex {
    Standard,
    Stable,
}

impl ModulationIndex {
    pub fn wire_value(&self) -> u8 {
        match self {
            ModulationIndex::Standard => 0x00,
            ModulationIndex::Stable => 0x01,
        }
    }
}

impl fmt::Display for ModulationIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModulationIndex::Standard => "Standard",
            ModulationIndex::Stable => "Stable",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ModulationIndex {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(ModulationIndex::Standard),
            "stable" => Ok(ModulationIndex::Stable),
            _ => Err(ParseTypeError::new("modulation index", s)),
        }
    }
}

/// Parameter of the `ReadSupportedRxTx` setup command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupportedParameter {
    MaxTxOctets,
    MaxTxTime,
    MaxRxOctets,
    MaxRxTime,
}

impl SupportedParameter {
    pub fn wire_value(&self) -> u8 {
        match self {
            SupportedParameter::MaxTxOctets => 0x00,
            SupportedParameter::MaxTxTime => 0x01,
            SupportedParameter::MaxRxOctets => 0x02,
            SupportedParameter::MaxRxTime => 0x03,
        }
    }
}

impl FromStr for SupportedParameter {
    type Err = ParseTypeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tx-octets" => Ok(SupportedParameter::MaxTxOctets),
            "tx-time" => Ok(SupportedParameter::MaxTxTime),
            "rx-octets" => Ok(SupportedParameter::MaxRxOctets),
            "rx-time" => Ok(SupportedParameter::MaxRxTime),
            _ => Err(ParseTypeError::new("supported parameter", s)),
        }
    }
}

/// Which side of the link a test exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestKind {
    Transmitter,
    Receiver,
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestKind::Transmitter => write!(f, "transmitter"),
            TestKind::Receiver => write!(f, "receiver"),
        }
    }
}

/// Error returned when a string cannot be parsed into one of the DTM
/// parameter types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTypeError {
    what: &'static str,
    input: String,
}

impl ParseTypeError {
    fn new(what: &'static str, input: &str) -> Self {
        ParseTypeError {
            what,
            input: input.to_string(),
        }
    }
}

impl fmt::Display for ParseTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.what, self.input)
    }
}

impl std::error::Error for ParseTypeError {}
