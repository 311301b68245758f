//! The device policy manager (DPM) lets a device steer the policy engine and
//! be informed about status changes.
//!
//! Through the DPM, a device supplies its capabilities, decides which power
//! level to request from a source, and accepts or rejects requests made by a
//! port partner.

use uom::si::electric_current::milliampere;
use uom::si::electric_potential::volt;
use usbc_traits::RpValue;

use crate::protocol_layer::message::pdo::{
    FixedSupply, PowerDataObject, SinkCapabilities, SinkFixedSupply, SourceCapabilities,
};
use crate::protocol_layer::message::rdo::{CurrentRequest, PowerSourceRequest, RawRequest, VoltageRequest};
use crate::units::{ElectricCurrent, ElectricPotential};
use crate::DataRole;

/// Status changes that the policy engine reports to the device.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// A partner attached, but no PD contract is in place.
    NotPdConnected,
    /// A PD contract was negotiated.
    PdConnected,
    /// The partner's source capabilities were received.
    SourceCapabilitiesReceived(SourceCapabilities),
    /// The source accepted a request; the supply is about to change.
    TransitionPowerSupply(PowerSourceRequest),
    /// The port's data role is now UFP.
    DataRoleIsUfp,
    /// The port's data role is now DFP.
    DataRoleIsDfp,
    /// An outgoing message was discarded by incoming traffic.
    MessageDiscarded,
    /// The partner rejected a request.
    MessageRejected,
    /// The partner answered with Not_Supported.
    MessageNotSupported,
    /// The partner stopped responding and the hard reset budget is spent.
    PartnerNotResponsive,
    /// The implicit power budget changed with the partner's Rp advertisement.
    /// `None` when no advertisement is sensed anymore (0 A).
    PowerLevelChanged(Option<RpValue>),
    /// A hard reset sequence completed.
    HardResetComplete,
}

/// Requests whose acceptance is device policy.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Policy {
    /// A partner requests the given power level.
    PowerRequest(PowerSourceRequest),
    /// A partner requests to swap data roles; the new role is given.
    DataRoleSwap(DataRole),
}

/// Trait for the device policy manager.
///
/// All methods have defaults, so a minimal device only implements what it
/// cares about. The policy engine calls these from its scheduling context;
/// implementations shall not block.
pub trait DevicePolicyManager {
    /// Choose a power level to request, given the partner's capabilities.
    ///
    /// Defaults to 5 V at the highest available current.
    fn request_data_object(&mut self, source_capabilities: &SourceCapabilities) -> PowerSourceRequest {
        match PowerSourceRequest::new_fixed(CurrentRequest::Highest, VoltageRequest::Safe5V, source_capabilities) {
            Ok(request) => request,
            // A compliant source always reports vSafe5V first.
            Err(_) => PowerSourceRequest::Unknown(RawRequest(0).with_object_position(1)),
        }
    }

    /// The capabilities this device offers when sourcing power.
    ///
    /// Defaults to 5 V at 900 mA.
    fn source_capabilities(&mut self) -> SourceCapabilities {
        SourceCapabilities::new(&[PowerDataObject::FixedSupply(FixedSupply::new(
            ElectricPotential::new::<volt>(5),
            ElectricCurrent::new::<milliampere>(900),
        ))])
    }

    /// The capabilities this device reports when sinking power.
    ///
    /// Defaults to 5 V at 900 mA.
    fn sink_capabilities(&mut self) -> SinkCapabilities {
        SinkCapabilities::new_fixed(SinkFixedSupply::new(
            ElectricPotential::new::<volt>(5),
            ElectricCurrent::new::<milliampere>(900),
        ))
    }

    /// Evaluate a partner's request against device policy.
    ///
    /// Defaults to accepting everything.
    fn check(&mut self, _policy: Policy) -> bool {
        true
    }

    /// Whether the device's power sink has settled at default operation.
    ///
    /// Polled after a hard reset before the stack restarts negotiation.
    fn is_sink_at_default(&mut self) -> bool {
        true
    }

    /// Whether the device's supply has settled at an accepted power level.
    ///
    /// Polled after a request was accepted, before Power_Supply_Ready is
    /// announced to the sink.
    fn is_supply_ready(&mut self) -> bool {
        true
    }

    /// Transition the device's supply or load to an accepted power level.
    fn transition_power(&mut self, _accepted: &PowerSourceRequest) {}

    /// Receive a status notification.
    fn notify(&mut self, _event: Event) {}
}
