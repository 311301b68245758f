//! Policy engine for the source role.

use usbc_traits::{PortController, RpValue, VbusSensor};

use super::{flag, PolicyEngine, State};
use crate::device_policy_manager::{DevicePolicyManager, Event, Policy};
use crate::port::Port;
use crate::protocol_layer::message::header::{ControlMessageType, DataMessageType};
use crate::protocol_layer::message::rdo::PowerSourceRequest;
use crate::protocol_layer::message::{Message, Payload};
use crate::timers::{Clock, TimerType};
use crate::DataRole;

/// Source engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SourceState {
    /// Reset protocol state after attach or a completed hard reset.
    Startup,
    /// Advertise capabilities, honoring the advertisement budget.
    SendCapabilities,
    /// Evaluate a request received from the sink.
    NegotiateCapability(PowerSourceRequest),
    /// Reject a request that device policy declined.
    CapabilityResponse,
    /// Accept a request; the supply transition follows.
    TransitionSupply(PowerSourceRequest),
    /// Announce the settled supply with PS_RDY.
    SendPsRdy,
    /// Steady state with an explicit contract.
    Ready,
    /// Answer a Get_Sink_Cap from the partner.
    GiveSinkCap,
    /// Initiate a soft reset after a recoverable error.
    SendSoftReset,
    /// Acknowledge a soft reset initiated by the partner.
    SoftReset,
    /// Answer an unsupported message.
    SendNotSupported,
    /// An extended (chunked) message arrived; answer after the chunking wait.
    ChunkReceived,
    /// The partner asked for a data role swap; the decision is carried along.
    DrsEvaluateSwap(bool),
    /// The device asked for a data role swap.
    DrsSendSwap,
    /// Issue a hard reset, honoring the retry budget.
    HardReset,
    /// Return the supply to vSafe5V after a hard reset.
    TransitionToDefault,
    /// Parked: the partner is assumed to not speak PD.
    Suspended,
}

impl<DRV, VBUS, DPM, CLK> Port<'_, DRV, VBUS, DPM, CLK>
where
    DRV: PortController,
    VBUS: VbusSensor,
    DPM: DevicePolicyManager,
    CLK: Clock,
{
    /// Step the source engine: cascade through entry actions, then run.
    pub(crate) fn pe_source_run(&mut self, message: Option<Message>) {
        loop {
            let State::Source(state) = self.pe.state else { return };
            if self.pe.entered {
                break;
            }

            self.pe.entered = true;
            self.pe_source_enter(state);

            if self.pe.state == State::Source(state) && self.pe.entered {
                break;
            }
        }

        let State::Source(state) = self.pe.state else { return };
        self.pe_source_run_state(state, message);
    }

    fn pe_source_enter(&mut self, state: SourceState) {
        match state {
            SourceState::Startup => {
                self.prl.reset();
                self.pe.explicit_contract = false;
                self.pe.accepted_request = None;

                if let Err(error) = self.driver.set_roles(self.power_role, self.data_role) {
                    warn!("Failed to set roles: {:?}", error);
                }

                self.dpm.notify(Event::NotPdConnected);
                self.pe.transition(State::Source(SourceState::SendCapabilities));
            }
            SourceState::SendCapabilities => {
                if self.pe.caps_counter.increment().is_err() {
                    // The sink never acknowledged any advertisement.
                    warn!("Capability advertisement budget spent");
                    self.dpm.notify(Event::PartnerNotResponsive);
                    self.pe.transition(State::Source(SourceState::Suspended));
                    return;
                }

                let capabilities = self.dpm.source_capabilities();
                self.pe.source_capabilities = Some(capabilities.clone());
                self.pe_send_data(
                    DataMessageType::SourceCapabilities,
                    Payload::SourceCapabilities(capabilities),
                    false,
                );
            }
            SourceState::NegotiateCapability(request) => {
                if self.dpm.check(Policy::PowerRequest(request)) {
                    self.pe.transition(State::Source(SourceState::TransitionSupply(request)));
                } else {
                    self.pe.transition(State::Source(SourceState::CapabilityResponse));
                }
            }
            SourceState::CapabilityResponse => {
                self.pe_send_control(ControlMessageType::Reject, false);
            }
            SourceState::TransitionSupply(request) => {
                self.pe.accepted_request = None;
                self.dpm.notify(Event::TransitionPowerSupply(request));
                self.pe_send_control(ControlMessageType::Accept, false);
            }
            SourceState::SendPsRdy => {
                self.pe_send_control(ControlMessageType::PsRdy, false);
            }
            SourceState::Ready => {
                self.pe.response_timer.stop();

                // SinkTxOk: the sink may start its own sequences.
                if let Err(error) = self.driver.select_rp_value(RpValue::Rp3A0) {
                    warn!("Failed to advertise SinkTxOk: {:?}", error);
                }
            }
            SourceState::GiveSinkCap => {
                let capabilities = self.dpm.sink_capabilities();
                self.pe_send_data(
                    DataMessageType::SinkCapabilities,
                    Payload::SinkCapabilities(capabilities),
                    false,
                );
            }
            SourceState::SendSoftReset => {
                self.pe_send_control(ControlMessageType::SoftReset, false);
            }
            SourceState::SoftReset => {
                self.pe_send_control(ControlMessageType::Accept, false);
            }
            SourceState::SendNotSupported => {
                let message_type = self.pe_not_supported_type();
                self.pe_send_control(message_type, false);
            }
            SourceState::ChunkReceived => {
                self.pe.response_timer.start::<CLK>(TimerType::ChunkingNotSupported);
            }
            SourceState::DrsEvaluateSwap(accept) => {
                let response = if accept {
                    ControlMessageType::Accept
                } else {
                    ControlMessageType::Reject
                };
                self.pe_send_control(response, false);
            }
            SourceState::DrsSendSwap => {
                self.pe_send_control(ControlMessageType::DrSwap, true);
            }
            SourceState::HardReset => {
                self.pe_hard_reset_entry();
            }
            SourceState::TransitionToDefault => {
                self.pe.flags.clear_all();
                self.pe.explicit_contract = false;
                self.pe.accepted_request = None;
                self.pe.response_timer.stop();
                self.pe.request_timer.stop();

                // A hard reset returns the port to its default data role.
                if self.data_role != DataRole::Dfp {
                    self.data_role = DataRole::Dfp;
                    self.prl.set_roles(self.power_role, self.data_role);

                    if let Err(error) = self.driver.set_roles(self.power_role, self.data_role) {
                        warn!("Failed to restore default data role: {:?}", error);
                    }
                }
            }
            SourceState::Suspended => {
                self.pe.response_timer.stop();
                self.pe.request_timer.stop();
            }
        }
    }

    fn pe_source_run_state(&mut self, state: SourceState, message: Option<Message>) {
        match state {
            SourceState::Startup | SourceState::NegotiateCapability(_) | SourceState::Suspended => {}
            SourceState::SendCapabilities => self.pe_source_send_capabilities(message),
            SourceState::CapabilityResponse => {
                if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
                    if self.pe.explicit_contract {
                        self.pe.transition(State::Source(SourceState::Ready));
                    } else {
                        // No fallback contract exists to return to.
                        self.pe.transition(State::Source(SourceState::HardReset));
                    }
                } else if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR)
                    || self.pe.flags.test_and_clear(flag::MSG_DISCARDED)
                {
                    self.pe.transition(State::Source(SourceState::SendSoftReset));
                }
            }
            SourceState::TransitionSupply(request) => {
                if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
                    self.dpm.transition_power(&request);
                    self.pe.accepted_request = Some(request);
                }

                if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR)
                    || self.pe.flags.test_and_clear(flag::MSG_DISCARDED)
                {
                    // The sink is left unsure about the supply state.
                    self.pe.transition(State::Source(SourceState::HardReset));
                    return;
                }

                // PS_RDY is announced only once the supply has settled.
                if self.pe.accepted_request.is_some() && self.dpm.is_supply_ready() {
                    self.pe.transition(State::Source(SourceState::SendPsRdy));
                }
            }
            SourceState::SendPsRdy => {
                if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
                    let newly_connected = !self.pe.explicit_contract;
                    self.pe.explicit_contract = true;

                    if newly_connected {
                        self.dpm.notify(Event::PdConnected);
                    }

                    self.pe.transition(State::Source(SourceState::Ready));
                } else if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR)
                    || self.pe.flags.test_and_clear(flag::MSG_DISCARDED)
                {
                    self.pe.transition(State::Source(SourceState::HardReset));
                }
            }
            SourceState::Ready => self.pe_source_ready(message),
            SourceState::GiveSinkCap => {
                if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
                    self.pe.transition(State::Source(SourceState::Ready));
                } else if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
                    self.dpm.notify(Event::MessageDiscarded);
                    self.pe.transition(State::Source(SourceState::Ready));
                } else if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) {
                    self.pe.transition(State::Source(SourceState::SendSoftReset));
                }
            }
            SourceState::SendSoftReset => {
                if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
                    // Discarded by inbound traffic; queue it again.
                    self.dpm.notify(Event::MessageDiscarded);
                    self.pe.transition(State::Source(SourceState::SendSoftReset));
                    return;
                }

                if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
                    self.pe.response_timer.start::<CLK>(TimerType::SenderResponse);
                }

                let accepted = message
                    .as_ref()
                    .and_then(PolicyEngine::control_type)
                    == Some(ControlMessageType::Accept);

                if accepted {
                    self.pe.response_timer.stop();
                    self.pe.transition(State::Source(SourceState::SendCapabilities));
                } else if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR)
                    || self.pe.response_timer.is_expired::<CLK>()
                {
                    self.pe.response_timer.stop();
                    self.pe.transition(State::Source(SourceState::HardReset));
                }
            }
            SourceState::SoftReset => {
                if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
                    self.dpm.notify(Event::MessageDiscarded);
                    self.pe.transition(State::Source(SourceState::SoftReset));
                } else if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
                    self.pe.transition(State::Source(SourceState::SendCapabilities));
                } else if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) {
                    self.pe.transition(State::Source(SourceState::HardReset));
                }
            }
            SourceState::SendNotSupported => {
                if self.pe.flags.test_and_clear(flag::TX_COMPLETE)
                    || self.pe.flags.test_and_clear(flag::MSG_DISCARDED)
                    || self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR)
                {
                    self.pe.transition(State::Source(SourceState::Ready));
                }
            }
            SourceState::ChunkReceived => {
                if self.pe.response_timer.is_expired::<CLK>() {
                    self.pe.response_timer.stop();
                    self.pe.transition(State::Source(SourceState::SendNotSupported));
                }
            }
            SourceState::DrsEvaluateSwap(accept) => {
                if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
                    if accept {
                        self.pe_apply_data_role_swap();
                    }
                    self.pe.transition(State::Source(SourceState::Ready));
                } else if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) {
                    self.pe.transition(State::Source(SourceState::SendSoftReset));
                }
            }
            SourceState::DrsSendSwap => self.pe_source_drs_send_swap(message),
            SourceState::HardReset => {
                if self.pe.flags.test_and_clear(flag::PRL_HARD_RESET_COMPLETE) {
                    self.pe.transition(State::Source(SourceState::TransitionToDefault));
                }
            }
            SourceState::TransitionToDefault => {
                if self.prl.awaits_pe_hard_reset() {
                    self.prl
                        .flags
                        .set(crate::protocol_layer::flag::PE_HARD_RESET_COMPLETE);
                    self.dpm.notify(Event::HardResetComplete);
                    self.pe.transition(State::Source(SourceState::Startup));
                }
            }
        }
    }

    fn pe_source_send_capabilities(&mut self, message: Option<Message>) {
        if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
            // The sink acknowledged an advertisement; resets from here on
            // have a fresh budget.
            self.pe.hard_reset_counter.reset();
            self.pe.caps_counter.reset();
            self.pe.response_timer.start::<CLK>(TimerType::SenderResponse);
        }

        if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
            self.dpm.notify(Event::MessageDiscarded);
            self.pe.transition(State::Source(SourceState::SendCapabilities));
            return;
        }

        if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) {
            // No GoodCRC. Space out the next advertisement.
            self.pe.request_timer.start::<CLK>(TimerType::SourceCapability);
            return;
        }

        if let Some(message) = message {
            if let Some(request) = self.pe_source_classify_request(&message) {
                self.pe.response_timer.stop();
                self.pe.request_timer.stop();
                self.pe.transition(State::Source(SourceState::NegotiateCapability(request)));
            } else {
                self.pe.response_timer.stop();
                self.pe.transition(State::Source(SourceState::SendSoftReset));
            }
            return;
        }

        if self.pe.request_timer.is_expired::<CLK>() {
            self.pe.request_timer.stop();
            self.pe.transition(State::Source(SourceState::SendCapabilities));
            return;
        }

        if self.pe.response_timer.is_expired::<CLK>() {
            self.pe.response_timer.stop();
            self.pe.transition(State::Source(SourceState::HardReset));
        }
    }

    fn pe_source_ready(&mut self, message: Option<Message>) {
        if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
            self.dpm.notify(Event::MessageDiscarded);
        }

        if let Some(message) = message {
            self.pe_source_ready_dispatch(message);
            return;
        }

        if self.pe.flags.test_and_clear(flag::DATA_ROLE_SWAP) {
            self.pe.transition(State::Source(SourceState::DrsSendSwap));
        }
    }

    fn pe_source_ready_dispatch(&mut self, message: Message) {
        if message.header.extended() {
            self.pe.transition(State::Source(SourceState::ChunkReceived));
            return;
        }

        if let Some(request) = self.pe_source_classify_request(&message) {
            self.pe.transition(State::Source(SourceState::NegotiateCapability(request)));
            return;
        }

        match PolicyEngine::control_type(&message) {
            Some(ControlMessageType::Ping) => {}
            Some(ControlMessageType::GetSourceCap) => {
                self.pe.transition(State::Source(SourceState::SendCapabilities));
            }
            Some(ControlMessageType::GetSinkCap) => {
                self.pe.transition(State::Source(SourceState::GiveSinkCap));
            }
            Some(ControlMessageType::DrSwap) => {
                let new_role = self.data_role.flipped();
                let accept = self.dpm.check(Policy::DataRoleSwap(new_role));
                self.pe.transition(State::Source(SourceState::DrsEvaluateSwap(accept)));
            }
            Some(ControlMessageType::NotSupported) => {
                self.dpm.notify(Event::MessageNotSupported);
            }
            Some(ControlMessageType::Reject) => {
                self.dpm.notify(Event::MessageRejected);
            }
            Some(
                ControlMessageType::Accept | ControlMessageType::PsRdy | ControlMessageType::Wait,
            ) => {
                // Out of sequence: these only make sense as answers.
                self.pe.transition(State::Source(SourceState::SendSoftReset));
            }
            _ => {
                self.pe.transition(State::Source(SourceState::SendNotSupported));
            }
        }
    }

    /// Resolve a received Request against the advertised capabilities.
    fn pe_source_classify_request(&mut self, message: &Message) -> Option<PowerSourceRequest> {
        let Some(Payload::Request(request)) = &message.payload else {
            return None;
        };

        let capabilities = self.pe.source_capabilities.as_ref()?;
        Some(PowerSourceRequest::classify(request.raw(), capabilities))
    }

    fn pe_source_drs_send_swap(&mut self, message: Option<Message>) {
        if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
            self.pe.response_timer.start::<CLK>(TimerType::SenderResponse);
        }

        if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
            self.dpm.notify(Event::MessageDiscarded);
            self.pe.transition(State::Source(SourceState::Ready));
            return;
        }

        if let Some(message) = message {
            match PolicyEngine::control_type(&message) {
                Some(ControlMessageType::Accept) => {
                    self.pe_apply_data_role_swap();
                }
                Some(
                    ControlMessageType::Reject | ControlMessageType::Wait | ControlMessageType::NotSupported,
                ) => {
                    self.dpm.notify(Event::MessageRejected);
                }
                _ => {
                    self.pe.response_timer.stop();
                    self.pe.transition(State::Source(SourceState::SendSoftReset));
                    return;
                }
            }

            self.pe.response_timer.stop();
            self.pe.transition(State::Source(SourceState::Ready));
            return;
        }

        if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) || self.pe.response_timer.is_expired::<CLK>() {
            self.pe.response_timer.stop();
            self.pe.transition(State::Source(SourceState::Ready));
        }
    }
}
