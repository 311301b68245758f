//! Request data objects (RDOs), sent by a sink to request power.

use byteorder::{ByteOrder, LittleEndian};
use proc_bitfield::bitfield;
use uom::si::electric_current::centiampere;

use super::pdo::{self, Kind, SourceCapabilities};
use crate::units::_20millivolts_mod::_20millivolts;
use crate::units::_50milliamperes_mod::_50milliamperes;
use crate::units::{ElectricCurrent, ElectricPotential};

bitfield! {
    /// A raw request data object; only the object position is universal.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct RawRequest(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
    }
}

bitfield! {
    /// A request against a fixed or variable supply PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FixedVariableRequest(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// GiveBack flag
        pub giveback_flag: bool @ 27,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// Operating current in 10 mA units
        pub raw_operating_current: u16 @ 10..=19,
        /// Maximum operating current in 10 mA units
        pub raw_max_operating_current: u16 @ 0..=9,
    }
}

impl FixedVariableRequest {
    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_operating_current().into())
    }

    /// The maximum current the sink may draw.
    pub fn max_operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<centiampere>(self.raw_max_operating_current().into())
    }
}

bitfield! {
    /// A request against a programmable power supply (PPS) PDO.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct PpsRequest(pub u32): Debug, FromStorage, IntoStorage {
        /// Valid range 1..=14
        pub object_position: u8 @ 28..=31,
        /// Capability mismatch
        pub capability_mismatch: bool @ 26,
        /// USB communications capable
        pub usb_communications_capable: bool @ 25,
        /// No USB suspend
        pub no_usb_suspend: bool @ 24,
        /// Unchunked extended messages supported
        pub unchunked_extended_messages_supported: bool @ 23,
        /// Output voltage in 20 mV units
        pub raw_output_voltage: u16 @ 9..=20,
        /// Operating current in 50 mA units
        pub raw_operating_current: u16 @ 0..=6,
    }
}

impl PpsRequest {
    /// The requested output voltage.
    pub fn output_voltage(&self) -> ElectricPotential {
        ElectricPotential::new::<_20millivolts>(self.raw_output_voltage().into())
    }

    /// The requested operating current.
    pub fn operating_current(&self) -> ElectricCurrent {
        ElectricCurrent::new::<_50milliamperes>(self.raw_operating_current().into())
    }
}

/// A power request towards the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerSourceRequest {
    /// Request against a fixed or variable supply.
    FixedVariableSupply(FixedVariableRequest),
    /// Request against a programmable power supply.
    Pps(PpsRequest),
    /// A request whose target PDO kind is not known.
    Unknown(RawRequest),
}

impl PowerSourceRequest {
    /// The one-indexed position of the requested PDO.
    pub fn object_position(&self) -> u8 {
        match self {
            Self::FixedVariableSupply(request) => request.object_position(),
            Self::Pps(request) => request.object_position(),
            Self::Unknown(request) => request.object_position(),
        }
    }

    /// The raw wire representation.
    pub fn raw(&self) -> u32 {
        match self {
            Self::FixedVariableSupply(request) => request.0,
            Self::Pps(request) => request.0,
            Self::Unknown(request) => request.0,
        }
    }

    /// Serialize the request, returning the number of written bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u32(buf, self.raw());
        4
    }

    /// Interpret a raw request against the capabilities it refers to.
    ///
    /// The wire format of a request depends on the kind of PDO it targets,
    /// which only the owner of the capabilities can resolve.
    pub fn classify(raw: u32, source_capabilities: &SourceCapabilities) -> Self {
        let request = RawRequest(raw);

        match source_capabilities.kind_at_position(request.object_position()) {
            Some(Kind::FixedSupply) | Some(Kind::VariableSupply) => {
                Self::FixedVariableSupply(FixedVariableRequest(raw))
            }
            Some(Kind::Pps) => Self::Pps(PpsRequest(raw)),
            _ => Self::Unknown(request),
        }
    }
}

/// Errors that can occur when building a request from capabilities.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// No PDO in the capabilities satisfies the requested voltage.
    VoltageMismatch,
}

/// Requestable voltage levels.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VoltageRequest {
    /// The safe 5 V supply.
    Safe5V,
    /// The highest fixed voltage that the source can supply.
    Highest,
    /// A specific voltage.
    Specific(ElectricPotential),
}

/// Requestable currents.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CurrentRequest {
    /// The highest current that the selected supply can provide.
    Highest,
    /// A specific current.
    Specific(ElectricCurrent),
}

/// Find the highest fixed voltage in the source capabilities.
fn find_highest_fixed_voltage(source_capabilities: &SourceCapabilities) -> Option<(usize, &pdo::FixedSupply)> {
    let mut selected = None;

    for (index, cap) in source_capabilities.pdos().iter().enumerate() {
        if let pdo::PowerDataObject::FixedSupply(fixed_supply) = cap {
            selected = match selected {
                Some((_, best)) if fixed_supply.voltage() <= pdo::FixedSupply::voltage(best) => selected,
                _ => Some((index, fixed_supply)),
            };
        }
    }

    selected
}

/// Find a fixed supply with exactly the given voltage.
fn find_specific_fixed_voltage(
    source_capabilities: &SourceCapabilities,
    voltage: ElectricPotential,
) -> Option<(usize, &pdo::FixedSupply)> {
    source_capabilities
        .pdos()
        .iter()
        .enumerate()
        .find_map(|(index, cap)| match cap {
            pdo::PowerDataObject::FixedSupply(fixed_supply) if fixed_supply.voltage() == voltage => {
                Some((index, fixed_supply))
            }
            _ => None,
        })
}

/// Find a PPS supply whose programmable range contains the given voltage.
fn find_pps_voltage(
    source_capabilities: &SourceCapabilities,
    voltage: ElectricPotential,
) -> Option<(usize, &pdo::Pps)> {
    source_capabilities
        .pdos()
        .iter()
        .enumerate()
        .find_map(|(index, cap)| match cap {
            pdo::PowerDataObject::Pps(pps) if pps.min_voltage() <= voltage && pps.max_voltage() >= voltage => {
                Some((index, pps))
            }
            _ => None,
        })
}

/// Clamp a raw current field into its valid 10 bit range.
fn clamp_raw_current(raw_current: u32) -> u16 {
    if raw_current > 0x3ff {
        error!("Clamping invalid request current field {}", raw_current);
        0x3ff
    } else {
        raw_current as u16
    }
}

impl PowerSourceRequest {
    /// Build a request for a fixed supply.
    ///
    /// Finds a suitable PDO by evaluating the voltage request against the
    /// source capabilities. Requesting more current than the supply offers
    /// sets the capability-mismatch flag.
    pub fn new_fixed(
        current_request: CurrentRequest,
        voltage_request: VoltageRequest,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let (index, supply) = match voltage_request {
            VoltageRequest::Safe5V => source_capabilities.vsafe_5v().map(|supply| (0, supply)),
            VoltageRequest::Highest => find_highest_fixed_voltage(source_capabilities),
            VoltageRequest::Specific(voltage) => find_specific_fixed_voltage(source_capabilities, voltage),
        }
        .ok_or(Error::VoltageMismatch)?;

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (supply.max_current(), false),
            CurrentRequest::Specific(current) => (current, current > supply.max_current()),
        };

        let raw_current = clamp_raw_current(current.get::<centiampere>());

        Ok(Self::FixedVariableSupply(
            FixedVariableRequest(0)
                .with_raw_operating_current(raw_current)
                .with_raw_max_operating_current(raw_current)
                .with_object_position(index as u8 + 1)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        ))
    }

    /// Build a request for a programmable power supply (PPS).
    ///
    /// Finds a PDO whose programmable range contains the requested voltage.
    pub fn new_pps(
        current_request: CurrentRequest,
        voltage: ElectricPotential,
        source_capabilities: &SourceCapabilities,
    ) -> Result<Self, Error> {
        let (index, supply) = find_pps_voltage(source_capabilities, voltage).ok_or(Error::VoltageMismatch)?;

        let (current, mismatch) = match current_request {
            CurrentRequest::Highest => (supply.max_current(), false),
            CurrentRequest::Specific(current) => (current, current > supply.max_current()),
        };

        let raw_current = clamp_raw_current(current.get::<_50milliamperes>());
        let raw_voltage = voltage.get::<_20millivolts>() as u16;

        Ok(Self::Pps(
            PpsRequest(0)
                .with_raw_output_voltage(raw_voltage)
                .with_raw_operating_current(raw_current)
                .with_object_position(index as u8 + 1)
                .with_capability_mismatch(mismatch)
                .with_no_usb_suspend(true)
                .with_usb_communications_capable(true),
        ))
    }
}

#[cfg(test)]
mod tests {
    use uom::si::electric_current::milliampere;
    use uom::si::electric_potential::volt;

    use super::*;
    use crate::protocol_layer::message::pdo::{FixedSupply, PowerDataObject, Pps};

    fn capabilities() -> SourceCapabilities {
        SourceCapabilities::new(&[
            PowerDataObject::FixedSupply(FixedSupply::new(
                ElectricPotential::new::<volt>(5),
                ElectricCurrent::new::<milliampere>(3000),
            )),
            PowerDataObject::FixedSupply(FixedSupply::new(
                ElectricPotential::new::<volt>(9),
                ElectricCurrent::new::<milliampere>(2000),
            )),
            PowerDataObject::Pps(
                Pps::default()
                    .with_raw_min_voltage(33)
                    .with_raw_max_voltage(110)
                    .with_raw_max_current(40),
            ),
        ])
    }

    #[test]
    fn highest_fixed_voltage_is_selected() {
        let request =
            PowerSourceRequest::new_fixed(CurrentRequest::Highest, VoltageRequest::Highest, &capabilities()).unwrap();

        let PowerSourceRequest::FixedVariableSupply(request) = request else {
            panic!("expected a fixed supply request");
        };

        assert_eq!(request.object_position(), 2);
        assert_eq!(request.operating_current(), ElectricCurrent::new::<milliampere>(2000));
        assert!(!request.capability_mismatch());
    }

    #[test]
    fn excessive_current_flags_mismatch() {
        let request = PowerSourceRequest::new_fixed(
            CurrentRequest::Specific(ElectricCurrent::new::<milliampere>(5000)),
            VoltageRequest::Safe5V,
            &capabilities(),
        )
        .unwrap();

        let PowerSourceRequest::FixedVariableSupply(request) = request else {
            panic!("expected a fixed supply request");
        };

        assert_eq!(request.object_position(), 1);
        assert!(request.capability_mismatch());
    }

    #[test]
    fn missing_voltage_is_an_error() {
        assert_eq!(
            PowerSourceRequest::new_fixed(
                CurrentRequest::Highest,
                VoltageRequest::Specific(ElectricPotential::new::<volt>(15)),
                &capabilities(),
            ),
            Err(Error::VoltageMismatch)
        );
    }

    #[test]
    fn pps_request_encodes_voltage_and_position() {
        let request = PowerSourceRequest::new_pps(
            CurrentRequest::Highest,
            ElectricPotential::new::<volt>(9),
            &capabilities(),
        )
        .unwrap();

        let PowerSourceRequest::Pps(request) = request else {
            panic!("expected a PPS request");
        };

        assert_eq!(request.object_position(), 3);
        assert_eq!(request.output_voltage(), ElectricPotential::new::<volt>(9));
        assert_eq!(request.operating_current(), ElectricCurrent::new::<milliampere>(2000));
    }

    #[test]
    fn classification_follows_the_target_pdo() {
        let caps = capabilities();

        let fixed = RawRequest(0).with_object_position(2).0;
        assert!(matches!(
            PowerSourceRequest::classify(fixed, &caps),
            PowerSourceRequest::FixedVariableSupply(_)
        ));

        let pps = RawRequest(0).with_object_position(3).0;
        assert!(matches!(PowerSourceRequest::classify(pps, &caps), PowerSourceRequest::Pps(_)));

        let out_of_range = RawRequest(0).with_object_position(7).0;
        assert!(matches!(
            PowerSourceRequest::classify(out_of_range, &caps),
            PowerSourceRequest::Unknown(_)
        ));
    }
}
