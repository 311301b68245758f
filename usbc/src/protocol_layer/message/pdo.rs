//! Power data objects (PDOs), the payload of capability messages.

use byteorder::{ByteOrder, LittleEndian};
use heapless::Vec;
use proc_bitfield::bitfield;
use uom::si::electric_current::centiampere;
use uom::si::electric_potential::decivolt;

use crate::units::_50milliamperes_mod::_50milliamperes;
use crate::units::_50millivolts_mod::_50millivolts;
use crate::units::_250milliwatts_mod::_250milliwatts;
use crate::units::{ElectricCurrent, ElectricPotential, Power};

/// The maximum number of data objects in a capabilities message.
pub const MAX_OBJECTS: usize = 7;

/// Kinds of supplies that can be reported within source capabilities.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Kind {
    /// Fixed voltage supply.
    FixedSupply,
    /// Battery supply.
    Battery,
    /// Variable voltage supply.
    VariableSupply,
    /// Programmable power supply.
    Pps,
}

/// One source capability.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerDataObject {
    /// Fixed voltage supply.
    FixedSupply(FixedSupply),
    /// Battery supply.
    Battery(Battery),
    /// Variable voltage supply.
    VariableSupply(VariableSupply),
    /// SPR programmable power supply.
    Pps(Pps),
    /// Unknown kind of power data object, preserved raw.
    Unknown(RawPowerDataObject),
}

impl PowerDataObject {
    /// Decode a raw 32 bit data object.
    pub fn from_raw(raw: u32) -> Self {
        let pdo = RawPowerDataObject(raw);
        match pdo.kind() {
            0b00 => Self::FixedSupply(FixedSupply(raw)),
            0b01 => Self::Battery(Battery(raw)),
            0b10 => Self::VariableSupply(VariableSupply(raw)),
            // Augmented PDO. Only the SPR programmable supply is understood.
            _ => {
                if pdo.augmented_supply() == 0b00 {
                    Self::Pps(Pps(raw))
                } else {
                    warn!("Unknown augmented supply {}", pdo.augmented_supply());
                    Self::Unknown(pdo)
                }
            }
        }
    }

    /// The raw wire representation.
    pub fn raw(&self) -> u32 {
        match self {
            Self::FixedSupply(pdo) => pdo.0,
            Self::Battery(pdo) => pdo.0,
            Self::VariableSupply(pdo) => pdo.0,
            Self::Pps(pdo) => pdo.0,
            Self::Unknown(pdo) => pdo.0,
        }
    }

    /// The kind of supply, if understood.
    pub fn kind(&self) -> Option<Kind> {
        match self {
            Self::FixedSupply(_) => Some(Kind::FixedSupply),
            Self::Battery(_) => Some(Kind::Battery),
            Self::VariableSupply(_) => Some(Kind::VariableSupply),
            Self::Pps(_) => Some(Kind::Pps),
            Self::Unknown(_) => None,
        }
    }
}

bitfield! {
    /// A raw power data object, as a fallback for unknown supply types.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct RawPowerDataObject(pub u32): Debug, FromStorage, IntoStorage {
        /// The kind of power data object.
        pub kind: u8 @ 30..=31,
        /// The augmented supply type, only valid for kind 11b.
        pub augmented_supply: u8 @ 28..=29,
    }
}

bitfield! {
    /// A fixed voltage supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FixedSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Fixed supply
        pub kind: u8 @ 30..=31,
        /// Dual-role power
        pub dual_role_power: bool @ 29,
        /// USB suspend supported
        pub usb_suspend_supported: bool @ 28,
        /// Unconstrained power
        pub unconstrained_power: bool @ 27,
        /// USB communications capable
        pub usb_communications_capable: bool @ 26,
        /// Dual-role data
        pub dual_role_data: bool @ 25,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 24,
        /// Peak current
        pub peak_current: u8 @ 20..=21,
        /// Voltage in 50 mV units
        pub raw_voltage: u16 @ 10..=19,
        /// Maximum current in 10 mA units
        pub raw_max_current: u16 @ 0..=9,
    }
}

#[allow(clippy::derivable_impls)]
impl Default for FixedSupply {
    fn default() -> Self {
        Self(0)
    }
}

impl FixedSupply {
    /// Create a fixed supply PDO for the given voltage and maximum current.
    pub fn new(voltage: ElectricPotential, max_current: ElectricCurrent) -> Self {
        Self(0)
            .with_raw_voltage(voltage.get::<_50millivolts>() as u16)
            .with_raw_max_current(max_current.get::<centiampere>() as u16)
    }

    /// The supply voltage.
    pub fn voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_voltage().into())
    }

    /// The maximum current the supply can provide.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_current().into())
    }
}

bitfield! {
    /// A battery supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// Battery
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50 mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50 mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum Allowable Power in 250 mW units
        pub raw_max_power: u16 @ 0..=9,
    }
}

impl Battery {
    /// The maximum supply voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    /// The minimum supply voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    /// The maximum allowable power.
    pub fn max_power(&self) -> Power {
        Power::new::<_250milliwatts>(self.raw_max_power().into())
    }
}

bitfield! {
    /// A variable (non-battery) supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct VariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Variable supply (non-battery)
        pub kind: u8 @ 30..=31,
        /// Maximum Voltage in 50mV units
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum Voltage in 50mV units
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum current in 10mA units
        pub raw_max_current: u16 @ 0..=9,
    }
}

impl VariableSupply {
    /// The maximum supply voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_max_voltage().into())
    }

    /// The minimum supply voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_min_voltage().into())
    }

    /// The maximum current the supply can provide.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_current().into())
    }
}

bitfield! {
    /// An SPR programmable power supply (PPS) PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Pps(pub u32): Debug, FromStorage, IntoStorage {
        /// Augmented power data object
        pub kind: u8 @ 30..=31,
        /// SPR programmable power supply
        pub supply: u8 @ 28..=29,
        /// Power limited
        pub pps_power_limited: bool @ 27,
        /// Maximum voltage in 100mV increments
        pub raw_max_voltage: u8 @ 17..=24,
        /// Minimum Voltage in 100mV increments
        pub raw_min_voltage: u8 @ 8..=15,
        /// Maximum Current in 50mA increments
        pub raw_max_current: u8 @ 0..=6,
    }
}

impl Default for Pps {
    fn default() -> Self {
        Self(0).with_kind(0b11).with_supply(0b00)
    }
}

impl Pps {
    /// The maximum programmable voltage.
    pub fn max_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_max_voltage().into())
    }

    /// The minimum programmable voltage.
    pub fn min_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<decivolt>(self.raw_min_voltage().into())
    }

    /// The maximum current the supply can provide.
    pub fn max_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_max_current().into())
    }
}

/// The capabilities that a source reports.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourceCapabilities(pub(crate) Vec<PowerDataObject, MAX_OBJECTS>);

impl SourceCapabilities {
    /// Build capabilities from a list of data objects.
    ///
    /// Excess objects beyond [`MAX_OBJECTS`] are ignored.
    pub fn new(pdos: &[PowerDataObject]) -> Self {
        Self(pdos.iter().copied().take(MAX_OBJECTS).collect())
    }

    /// Decode capabilities from the data objects of a received message.
    pub fn from_payload(payload: &[u8], num_objects: usize) -> Self {
        Self(
            payload
                .chunks_exact(4)
                .take(num_objects.min(MAX_OBJECTS))
                .map(|buf| PowerDataObject::from_raw(LittleEndian::read_u32(buf)))
                .collect(),
        )
    }

    /// Serialize the data objects, returning the number of written bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        for (pdo, chunk) in self.0.iter().zip(buf.chunks_exact_mut(4)) {
            LittleEndian::write_u32(chunk, pdo.raw());
        }

        4 * self.0.len()
    }

    /// The vSafe5V supply, which shall be reported first.
    pub fn vsafe_5v(&self) -> Option<&FixedSupply> {
        self.0.first().and_then(|supply| {
            if let PowerDataObject::FixedSupply(supply) = supply {
                Some(supply)
            } else {
                None
            }
        })
    }

    /// Whether the source supports dual-role power.
    pub fn dual_role_power(&self) -> bool {
        self.vsafe_5v().map(FixedSupply::dual_role_power).unwrap_or_default()
    }

    /// Whether the source has unconstrained power.
    pub fn unconstrained_power(&self) -> bool {
        self.vsafe_5v()
            .map(FixedSupply::unconstrained_power)
            .unwrap_or_default()
    }

    /// Whether the source supports dual-role data.
    pub fn dual_role_data(&self) -> bool {
        self.vsafe_5v().map(FixedSupply::dual_role_data).unwrap_or_default()
    }

    /// The source's power data objects.
    pub fn pdos(&self) -> &[PowerDataObject] {
        &self.0
    }

    /// The kind of supply at a one-indexed object position.
    pub fn kind_at_position(&self, position: u8) -> Option<Kind> {
        self.0
            .get(usize::from(position.saturating_sub(1)))
            .and_then(PowerDataObject::kind)
    }
}

bitfield! {
    /// A fixed supply PDO as reported in sink capabilities.
    ///
    /// Shares the voltage/current layout of the source variant but carries
    /// sink-specific capability bits.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SinkFixedSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// Fixed supply
        pub kind: u8 @ 30..=31,
        /// Dual-role power
        pub dual_role_power: bool @ 29,
        /// Higher capability (the sink needs more than vSafe5V)
        pub higher_capability: bool @ 28,
        /// Unconstrained power
        pub unconstrained_power: bool @ 27,
        /// USB communications capable
        pub usb_communications_capable: bool @ 26,
        /// Dual-role data
        pub dual_role_data: bool @ 25,
        /// Fast role swap current requirement
        pub fast_role_swap_current: u8 @ 23..=24,
        /// Voltage in 50 mV units
        pub raw_voltage: u16 @ 10..=19,
        /// Operational current in 10 mA units
        pub raw_operational_current: u16 @ 0..=9,
    }
}

#[allow(clippy::derivable_impls)]
impl Default for SinkFixedSupply {
    fn default() -> Self {
        Self(0)
    }
}

impl SinkFixedSupply {
    /// Create a sink fixed supply PDO for the given voltage and current.
    pub fn new(voltage: ElectricPotential, operational_current: ElectricCurrent) -> Self {
        Self(0)
            .with_raw_voltage(voltage.get::<_50millivolts>() as u16)
            .with_raw_operational_current(operational_current.get::<centiampere>() as u16)
    }

    /// The required supply voltage.
    pub fn voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_50millivolts>(self.raw_voltage().into())
    }

    /// The operational current of the sink.
    pub fn operational_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_operational_current().into())
    }
}

/// The capabilities that a sink reports.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SinkCapabilities(pub(crate) Vec<u32, MAX_OBJECTS>);

impl SinkCapabilities {
    /// Build capabilities whose first object is the given fixed supply.
    pub fn new_fixed(supply: SinkFixedSupply) -> Self {
        let mut pdos = Vec::new();
        let _ = pdos.push(supply.0);
        Self(pdos)
    }

    /// Decode capabilities from the data objects of a received message.
    pub fn from_payload(payload: &[u8], num_objects: usize) -> Self {
        Self(
            payload
                .chunks_exact(4)
                .take(num_objects.min(MAX_OBJECTS))
                .map(LittleEndian::read_u32)
                .collect(),
        )
    }

    /// Serialize the data objects, returning the number of written bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        for (raw, chunk) in self.0.iter().zip(buf.chunks_exact_mut(4)) {
            LittleEndian::write_u32(chunk, *raw);
        }

        4 * self.0.len()
    }

    /// The fixed supply at the first object position, if any.
    pub fn vsafe_5v(&self) -> Option<SinkFixedSupply> {
        self.0.first().and_then(|raw| {
            if RawPowerDataObject(*raw).kind() == 0b00 {
                Some(SinkFixedSupply(*raw))
            } else {
                None
            }
        })
    }

    /// The number of data objects.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the sink reported no data objects.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
