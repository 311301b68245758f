//! The policy engine (PE) negotiates and maintains the power contract.
//!
//! Two variants exist: a sink engine and a source engine. A port runs the
//! variant matching its configured role; a dual-role device composes both
//! behind the runtime role flag.

pub mod sink;
pub mod source;

#[cfg(test)]
mod tests;

use usbc_traits::{PortController, SopTarget, VbusSensor};

use crate::counters::{Counter, CounterType};
use crate::device_policy_manager::DevicePolicyManager;
use crate::flags::Flags;
use crate::port::Port;
use crate::protocol_layer::message::header::{ControlMessageType, DataMessageType, MessageType, SpecificationRevision};
use crate::protocol_layer::message::rdo::PowerSourceRequest;
use crate::protocol_layer::message::pdo::SourceCapabilities;
use crate::protocol_layer::message::{Message, Payload};
use crate::protocol_layer::{self, TxRequest};
use crate::timers::{Clock, Timer};
use crate::{DataRole, PowerRole};

/// Flags routed to the policy engine.
pub(crate) mod flag {
    /// The protocol layer delivered the last queued message.
    pub const TX_COMPLETE: u16 = 1 << 0;
    /// The last queued message was discarded by incoming traffic.
    pub const MSG_DISCARDED: u16 = 1 << 1;
    /// The last queued message could not be delivered.
    pub const PROTOCOL_ERROR: u16 = 1 << 2;
    /// A message was received and can be taken from the protocol layer.
    pub const MSG_RECEIVED: u16 = 1 << 3;
    /// The partner sent Soft_Reset.
    pub const SOFT_RESET_RECEIVED: u16 = 1 << 4;
    /// The partner signaled a hard reset.
    pub const HARD_RESET_RECEIVED: u16 = 1 << 5;
    /// The protocol layer finished the PHY part of a hard reset.
    pub const PRL_HARD_RESET_COMPLETE: u16 = 1 << 6;
    /// The device asked for the partner's source capabilities.
    pub const GET_SOURCE_CAPABILITIES: u16 = 1 << 7;
    /// The device queued a new power request.
    pub const NEW_POWER_REQUEST: u16 = 1 << 8;
    /// The device asked for a data role swap.
    pub const DATA_ROLE_SWAP: u16 = 1 << 9;
}

/// The engine state, per role variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Sink-role state.
    Sink(sink::SinkState),
    /// Source-role state.
    Source(source::SourceState),
}

/// Policy engine state for one port.
#[derive(Debug)]
pub struct PolicyEngine {
    pub(crate) state: State,
    pub(crate) entered: bool,
    pub(crate) running: bool,
    pub(crate) flags: Flags,
    pub(crate) explicit_contract: bool,
    /// Set when the capability wait timer ran out at least once.
    pub(crate) wait_cap_timeout: bool,
    pub(crate) hard_reset_counter: Counter,
    pub(crate) caps_counter: Counter,
    pub(crate) source_capabilities: Option<SourceCapabilities>,
    /// The request the partner (or this sink) last accepted.
    pub(crate) accepted_request: Option<PowerSourceRequest>,
    /// A power request queued by the device, consumed on the next AMS.
    pub(crate) pending_request: Option<PowerSourceRequest>,
    /// Bounded wait for the partner's answer in the current state.
    pub(crate) response_timer: Timer,
    /// Delayed re-request after the partner answered Wait.
    pub(crate) request_timer: Timer,
}

impl PolicyEngine {
    /// Create an engine for the given power role, not yet running.
    pub fn new(power_role: PowerRole) -> Self {
        Self {
            state: Self::startup_state(power_role),
            entered: false,
            running: false,
            flags: Flags::new(),
            explicit_contract: false,
            wait_cap_timeout: false,
            hard_reset_counter: Counter::new(CounterType::HardReset),
            caps_counter: Counter::new(CounterType::Caps),
            source_capabilities: None,
            accepted_request: None,
            pending_request: None,
            response_timer: Timer::new(),
            request_timer: Timer::new(),
        }
    }

    fn startup_state(power_role: PowerRole) -> State {
        match power_role {
            PowerRole::Sink => State::Sink(sink::SinkState::Startup),
            PowerRole::Source => State::Source(source::SourceState::Startup),
        }
    }

    /// Start negotiation after attach.
    pub(crate) fn start(&mut self, power_role: PowerRole) {
        self.state = Self::startup_state(power_role);
        self.entered = false;
        self.running = true;
        self.flags.clear_all();
        self.explicit_contract = false;
        self.wait_cap_timeout = false;
        self.hard_reset_counter = Counter::new(CounterType::HardReset);
        self.caps_counter = Counter::new(CounterType::Caps);
        self.source_capabilities = None;
        self.accepted_request = None;
        self.response_timer.stop();
        self.request_timer.stop();
    }

    /// Stop the engine on detach or suspend.
    pub(crate) fn stop(&mut self) {
        self.running = false;
        self.flags.clear_all();
        self.explicit_contract = false;
        self.response_timer.stop();
        self.request_timer.stop();
    }

    /// Whether the engine is negotiating or maintaining a contract.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether an explicit contract is in place.
    pub fn explicit_contract(&self) -> bool {
        self.explicit_contract
    }

    /// The current engine state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The partner's source capabilities, if received.
    pub fn source_capabilities(&self) -> Option<&SourceCapabilities> {
        self.source_capabilities.as_ref()
    }

    /// Queue a power request from the device.
    pub(crate) fn queue_power_request(&mut self, request: PowerSourceRequest) {
        self.pending_request = Some(request);
        self.flags.set(flag::NEW_POWER_REQUEST);
    }

    pub(crate) fn transition(&mut self, state: State) {
        debug!("PE transition {:?} -> {:?}", self.state, state);
        self.state = state;
        self.entered = false;
    }

    /// The control message type of a message, if it is a control message.
    fn control_type(message: &Message) -> Option<ControlMessageType> {
        match message.header.message_type() {
            MessageType::Control(control) if !message.header.extended() => Some(control),
            _ => None,
        }
    }
}

impl<DRV, VBUS, DPM, CLK> Port<'_, DRV, VBUS, DPM, CLK>
where
    DRV: PortController,
    VBUS: VbusSensor,
    DPM: DevicePolicyManager,
    CLK: Clock,
{
    /// Step the policy engine by one cycle.
    pub(crate) fn pe_run(&mut self) {
        if !self.pe.running {
            return;
        }

        // Hard and soft resets preempt whatever state holds control.
        if self.pe.flags.test_and_clear(flag::HARD_RESET_RECEIVED) {
            match self.power_role {
                PowerRole::Sink => self.pe.transition(State::Sink(sink::SinkState::TransitionToDefault)),
                PowerRole::Source => self.pe.transition(State::Source(source::SourceState::TransitionToDefault)),
            }
        } else if self.pe.flags.test_and_clear(flag::SOFT_RESET_RECEIVED) {
            match self.power_role {
                PowerRole::Sink => self.pe.transition(State::Sink(sink::SinkState::SoftReset)),
                PowerRole::Source => self.pe.transition(State::Source(source::SourceState::SoftReset)),
            }
        }

        let message = if self.pe.flags.test_and_clear(flag::MSG_RECEIVED) {
            self.prl.take_rx_message()
        } else {
            None
        };

        // Traffic on SOP' / SOP'' is cable plug communication, which this
        // stack does not take part in.
        let message = message.filter(|message| message.sop == SopTarget::Sop);

        match self.pe.state {
            State::Sink(_) => self.pe_sink_run(message),
            State::Source(_) => self.pe_source_run(message),
        }
    }

    /// Queue a control message on SOP.
    pub(crate) fn pe_send_control(&mut self, message_type: ControlMessageType, ams_first: bool) {
        self.prl.queue_transmit(
            TxRequest {
                sop: SopTarget::Sop,
                message_type: MessageType::Control(message_type),
                payload: None,
            },
            ams_first,
        );
    }

    /// Queue a data message on SOP.
    pub(crate) fn pe_send_data(&mut self, message_type: DataMessageType, payload: Payload, ams_first: bool) {
        self.prl.queue_transmit(
            TxRequest {
                sop: SopTarget::Sop,
                message_type: MessageType::Data(message_type),
                payload: Some(payload),
            },
            ams_first,
        );
    }

    /// The response to an unsupported message, per negotiated revision.
    ///
    /// Not_Supported only exists since revision 3.0; against a 2.0 partner
    /// the stack answers Reject instead.
    pub(crate) fn pe_not_supported_type(&self) -> ControlMessageType {
        match self.prl.revision() {
            SpecificationRevision::R3_X => ControlMessageType::NotSupported,
            _ => ControlMessageType::Reject,
        }
    }

    /// Enter the hard reset state, honoring the retry budget.
    ///
    /// When the capability wait has timed out repeatedly and the budget is
    /// spent, the partner is assumed to not speak PD: the engine parks
    /// itself instead of resetting forever.
    pub(crate) fn pe_hard_reset_entry(&mut self) -> bool {
        match self.pe.hard_reset_counter.increment() {
            Ok(()) => {}
            Err(_) if self.pe.wait_cap_timeout => {
                warn!("Hard reset budget spent, partner is not responsive");
                self.dpm.notify(crate::device_policy_manager::Event::PartnerNotResponsive);

                match self.power_role {
                    PowerRole::Sink => self.pe.transition(State::Sink(sink::SinkState::Suspended)),
                    PowerRole::Source => self.pe.transition(State::Source(source::SourceState::Suspended)),
                }
                return false;
            }
            Err(_) => {}
        }

        self.prl.flags.set(protocol_layer::flag::HARD_RESET_REQUEST);
        true
    }

    /// Apply a completed data role swap.
    pub(crate) fn pe_apply_data_role_swap(&mut self) {
        self.data_role = self.data_role.flipped();
        self.prl.set_roles(self.power_role, self.data_role);

        if let Err(error) = self.driver.set_roles(self.power_role, self.data_role) {
            warn!("Failed to apply data role: {:?}", error);
        }

        self.dpm.notify(match self.data_role {
            DataRole::Ufp => crate::device_policy_manager::Event::DataRoleIsUfp,
            DataRole::Dfp => crate::device_policy_manager::Event::DataRoleIsDfp,
        });
    }
}
