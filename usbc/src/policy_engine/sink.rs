//! Policy engine for the sink role.

use usbc_traits::{PortController, VbusSensor};

use super::{flag, PolicyEngine, State};
use crate::device_policy_manager::{DevicePolicyManager, Event, Policy};
use crate::port::Port;
use crate::protocol_layer::message::header::{ControlMessageType, DataMessageType};
use crate::protocol_layer::message::{Message, Payload};
use crate::timers::{Clock, TimerType};
use crate::DataRole;

/// Sink engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SinkState {
    /// Reset protocol state after attach or a completed hard reset.
    Startup,
    /// Configure roles and report the non-PD attach to the device.
    Discovery,
    /// Wait for the source to send its capabilities.
    WaitForCapabilities,
    /// Ask the device which power level to request.
    EvaluateCapability,
    /// Send the request and wait for the source's verdict.
    SelectCapability(crate::protocol_layer::message::rdo::PowerSourceRequest),
    /// Wait for the source's supply to settle at the new level.
    TransitionSink,
    /// Steady state with or without an explicit contract.
    Ready,
    /// Ask the source to resend its capabilities.
    GetSourceCap,
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
    /// Return the sink to default power after a hard reset.
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
    /// Step the sink engine: cascade through entry actions, then run.
    pub(crate) fn pe_sink_run(&mut self, message: Option<Message>) {
        loop {
            let State::Sink(state) = self.pe.state else { return };
            if self.pe.entered {
                break;
            }

            self.pe.entered = true;
            self.pe_sink_enter(state);

            if self.pe.state == State::Sink(state) && self.pe.entered {
                break;
            }
        }

        let State::Sink(state) = self.pe.state else { return };
        self.pe_sink_run_state(state, message);
    }

    fn pe_sink_enter(&mut self, state: SinkState) {
        match state {
            SinkState::Startup => {
                self.prl.reset();
                self.pe.explicit_contract = false;
                self.pe.accepted_request = None;
                self.pe.transition(State::Sink(SinkState::Discovery));
            }
            SinkState::Discovery => {
                if let Err(error) = self.driver.set_roles(self.power_role, self.data_role) {
                    warn!("Failed to set roles: {:?}", error);
                }

                self.dpm.notify(Event::NotPdConnected);
                self.pe.transition(State::Sink(SinkState::WaitForCapabilities));
            }
            SinkState::WaitForCapabilities => {
                self.pe.response_timer.start::<CLK>(TimerType::SinkWaitCap);
            }
            SinkState::EvaluateCapability => {
                let Some(capabilities) = self.pe.source_capabilities.clone() else {
                    self.pe.transition(State::Sink(SinkState::WaitForCapabilities));
                    return;
                };

                let request = match self.pe.pending_request.take() {
                    Some(request) => request,
                    None => self.dpm.request_data_object(&capabilities),
                };

                self.pe.transition(State::Sink(SinkState::SelectCapability(request)));
            }
            SinkState::SelectCapability(request) => {
                // With a contract in place this is a sink-initiated sequence
                // and must honor the source's SinkTxOk advertisement.
                let ams_first = self.pe.explicit_contract;
                self.pe_send_data(DataMessageType::Request, Payload::Request(request), ams_first);
            }
            SinkState::TransitionSink => {
                self.pe.response_timer.start::<CLK>(TimerType::PsTransition);
            }
            SinkState::Ready => {
                self.pe.response_timer.stop();
            }
            SinkState::GetSourceCap => {
                self.pe_send_control(ControlMessageType::GetSourceCap, true);
            }
            SinkState::GiveSinkCap => {
                let capabilities = self.dpm.sink_capabilities();
                self.pe_send_data(
                    DataMessageType::SinkCapabilities,
                    Payload::SinkCapabilities(capabilities),
                    false,
                );
            }
            SinkState::SendSoftReset => {
                self.pe_send_control(ControlMessageType::SoftReset, false);
            }
            SinkState::SoftReset => {
                self.pe_send_control(ControlMessageType::Accept, false);
            }
            SinkState::SendNotSupported => {
                let message_type = self.pe_not_supported_type();
                self.pe_send_control(message_type, false);
            }
            SinkState::ChunkReceived => {
                self.pe.response_timer.start::<CLK>(TimerType::ChunkingNotSupported);
            }
            SinkState::DrsEvaluateSwap(accept) => {
                let response = if accept {
                    ControlMessageType::Accept
                } else {
                    ControlMessageType::Reject
                };
                self.pe_send_control(response, false);
            }
            SinkState::DrsSendSwap => {
                self.pe_send_control(ControlMessageType::DrSwap, true);
            }
            SinkState::HardReset => {
                self.pe_hard_reset_entry();
            }
            SinkState::TransitionToDefault => {
                self.pe.flags.clear_all();
                self.pe.explicit_contract = false;
                self.pe.accepted_request = None;
                self.pe.source_capabilities = None;
                self.pe.response_timer.stop();
                self.pe.request_timer.stop();

                // A hard reset returns the port to its default data role.
                if self.data_role != DataRole::Ufp {
                    self.data_role = DataRole::Ufp;
                    self.prl.set_roles(self.power_role, self.data_role);

                    if let Err(error) = self.driver.set_roles(self.power_role, self.data_role) {
                        warn!("Failed to restore default data role: {:?}", error);
                    }
                }
            }
            SinkState::Suspended => {
                self.pe.response_timer.stop();
                self.pe.request_timer.stop();
            }
        }
    }

    fn pe_sink_run_state(&mut self, state: SinkState, message: Option<Message>) {
        match state {
            SinkState::Startup
            | SinkState::Discovery
            | SinkState::EvaluateCapability
            | SinkState::Suspended => {}
            SinkState::WaitForCapabilities => self.pe_sink_wait_for_capabilities(message),
            SinkState::SelectCapability(request) => self.pe_sink_select_capability(request, message),
            SinkState::TransitionSink => self.pe_sink_transition_sink(message),
            SinkState::Ready => self.pe_sink_ready(message),
            SinkState::GetSourceCap => self.pe_sink_get_source_cap(message),
            SinkState::GiveSinkCap => {
                if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
                    self.pe.transition(State::Sink(SinkState::Ready));
                } else if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
                    self.dpm.notify(Event::MessageDiscarded);
                    self.pe.transition(State::Sink(SinkState::Ready));
                } else if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) {
                    self.pe.transition(State::Sink(SinkState::SendSoftReset));
                }
            }
            SinkState::SendSoftReset => {
                if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
                    // Discarded by inbound traffic; queue it again.
                    self.dpm.notify(Event::MessageDiscarded);
                    self.pe.transition(State::Sink(SinkState::SendSoftReset));
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
                    self.pe.transition(State::Sink(SinkState::WaitForCapabilities));
                } else if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR)
                    || self.pe.response_timer.is_expired::<CLK>()
                {
                    // A failed soft reset escalates.
                    self.pe.response_timer.stop();
                    self.pe.transition(State::Sink(SinkState::HardReset));
                }
            }
            SinkState::SoftReset => {
                if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
                    self.dpm.notify(Event::MessageDiscarded);
                    self.pe.transition(State::Sink(SinkState::SoftReset));
                } else if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
                    self.pe.transition(State::Sink(SinkState::WaitForCapabilities));
                } else if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) {
                    self.pe.transition(State::Sink(SinkState::HardReset));
                }
            }
            SinkState::SendNotSupported => {
                if self.pe.flags.test_and_clear(flag::TX_COMPLETE)
                    || self.pe.flags.test_and_clear(flag::MSG_DISCARDED)
                    || self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR)
                {
                    self.pe.transition(State::Sink(SinkState::Ready));
                }
            }
            SinkState::ChunkReceived => {
                if self.pe.response_timer.is_expired::<CLK>() {
                    self.pe.response_timer.stop();
                    self.pe.transition(State::Sink(SinkState::SendNotSupported));
                }
            }
            SinkState::DrsEvaluateSwap(accept) => {
                if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
                    if accept {
                        self.pe_apply_data_role_swap();
                    }
                    self.pe.transition(State::Sink(SinkState::Ready));
                } else if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) {
                    self.pe.transition(State::Sink(SinkState::SendSoftReset));
                }
            }
            SinkState::DrsSendSwap => self.pe_sink_drs_send_swap(message),
            SinkState::HardReset => {
                if self.pe.flags.test_and_clear(flag::PRL_HARD_RESET_COMPLETE) {
                    self.pe.transition(State::Sink(SinkState::TransitionToDefault));
                }
            }
            SinkState::TransitionToDefault => {
                if self.prl.awaits_pe_hard_reset() && self.dpm.is_sink_at_default() {
                    self.prl
                        .flags
                        .set(crate::protocol_layer::flag::PE_HARD_RESET_COMPLETE);
                    self.dpm.notify(Event::HardResetComplete);
                    self.pe.transition(State::Sink(SinkState::Startup));
                }
            }
        }
    }

    fn pe_sink_wait_for_capabilities(&mut self, message: Option<Message>) {
        if let Some(message) = message {
            if let Some(Payload::SourceCapabilities(capabilities)) = message.payload {
                self.pe_sink_accept_capabilities(capabilities);
                return;
            }
            // Everything else is dropped until capabilities arrive.
        }

        if self.pe.response_timer.is_expired::<CLK>() {
            self.pe.response_timer.stop();
            self.pe.wait_cap_timeout = true;
            self.pe.transition(State::Sink(SinkState::HardReset));
        }
    }

    fn pe_sink_accept_capabilities(&mut self, capabilities: crate::protocol_layer::message::pdo::SourceCapabilities) {
        self.pe.response_timer.stop();
        self.dpm.notify(Event::SourceCapabilitiesReceived(capabilities.clone()));
        self.pe.source_capabilities = Some(capabilities);
        self.pe.transition(State::Sink(SinkState::EvaluateCapability));
    }

    fn pe_sink_select_capability(
        &mut self,
        request: crate::protocol_layer::message::rdo::PowerSourceRequest,
        message: Option<Message>,
    ) {
        if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) {
            // The request never made it out; assume the link is in a bad
            // state and recover hard.
            self.pe.transition(State::Sink(SinkState::HardReset));
            return;
        }

        if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
            self.dpm.notify(Event::MessageDiscarded);

            let next = if self.pe.explicit_contract {
                SinkState::Ready
            } else {
                SinkState::SendSoftReset
            };
            self.pe.transition(State::Sink(next));
            return;
        }

        if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
            self.pe.response_timer.start::<CLK>(TimerType::SenderResponse);
        }

        if let Some(message) = message {
            match PolicyEngine::control_type(&message) {
                Some(ControlMessageType::Accept) => {
                    self.pe.response_timer.stop();

                    // A completed capabilities/request exchange restores the
                    // reset budget.
                    self.pe.hard_reset_counter.reset();
                    self.pe.wait_cap_timeout = false;

                    self.pe.explicit_contract = true;
                    self.pe.accepted_request = Some(request);
                    self.dpm.notify(Event::TransitionPowerSupply(request));
                    self.pe.transition(State::Sink(SinkState::TransitionSink));
                }
                Some(ControlMessageType::Reject) => {
                    self.pe.response_timer.stop();
                    self.dpm.notify(Event::MessageRejected);

                    let next = if self.pe.explicit_contract {
                        SinkState::Ready
                    } else {
                        SinkState::WaitForCapabilities
                    };
                    self.pe.transition(State::Sink(next));
                }
                Some(ControlMessageType::Wait) => {
                    self.pe.response_timer.stop();
                    self.dpm.notify(Event::MessageRejected);

                    if self.pe.explicit_contract {
                        // Retry the same request after the wait interval.
                        self.pe.pending_request = Some(request);
                        self.pe.request_timer.start::<CLK>(TimerType::SinkRequest);
                        self.pe.transition(State::Sink(SinkState::Ready));
                    } else {
                        self.pe.transition(State::Sink(SinkState::WaitForCapabilities));
                    }
                }
                _ => {
                    self.pe.response_timer.stop();
                    self.pe.transition(State::Sink(SinkState::SendSoftReset));
                }
            }
            return;
        }

        if self.pe.response_timer.is_expired::<CLK>() {
            self.pe.response_timer.stop();
            self.pe.transition(State::Sink(SinkState::HardReset));
        }
    }

    fn pe_sink_transition_sink(&mut self, message: Option<Message>) {
        if let Some(message) = message {
            if PolicyEngine::control_type(&message) == Some(ControlMessageType::PsRdy) {
                self.pe.response_timer.stop();

                if let Some(accepted) = self.pe.accepted_request {
                    self.dpm.transition_power(&accepted);
                }

                self.dpm.notify(Event::PdConnected);
                self.pe.transition(State::Sink(SinkState::Ready));
            } else {
                // Anything else during the supply transition is fatal.
                self.pe.transition(State::Sink(SinkState::HardReset));
            }
            return;
        }

        if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) || self.pe.response_timer.is_expired::<CLK>() {
            self.pe.response_timer.stop();
            self.pe.transition(State::Sink(SinkState::HardReset));
        }
    }

    fn pe_sink_ready(&mut self, message: Option<Message>) {
        if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
            self.dpm.notify(Event::MessageDiscarded);
        }

        if let Some(message) = message {
            self.pe_sink_ready_dispatch(message);
            return;
        }

        if self.pe.flags.test_and_clear(flag::GET_SOURCE_CAPABILITIES) {
            self.pe.transition(State::Sink(SinkState::GetSourceCap));
            return;
        }

        if self.pe.flags.test_and_clear(flag::NEW_POWER_REQUEST) {
            if let Some(request) = self.pe.pending_request.take() {
                self.pe.request_timer.stop();
                self.pe.transition(State::Sink(SinkState::SelectCapability(request)));
            }
            return;
        }

        if self.pe.flags.test_and_clear(flag::DATA_ROLE_SWAP) {
            self.pe.transition(State::Sink(SinkState::DrsSendSwap));
            return;
        }

        if self.pe.request_timer.is_expired::<CLK>() {
            self.pe.request_timer.stop();

            if let Some(request) = self.pe.pending_request.take().or(self.pe.accepted_request) {
                self.pe.transition(State::Sink(SinkState::SelectCapability(request)));
            }
        }
    }

    fn pe_sink_ready_dispatch(&mut self, message: Message) {
        if message.header.extended() {
            self.pe.transition(State::Sink(SinkState::ChunkReceived));
            return;
        }

        if let Some(Payload::SourceCapabilities(capabilities)) = &message.payload {
            let capabilities = capabilities.clone();
            self.pe_sink_accept_capabilities(capabilities);
            return;
        }

        match PolicyEngine::control_type(&message) {
            Some(ControlMessageType::Ping) => {}
            Some(ControlMessageType::GetSinkCap) => {
                self.pe.transition(State::Sink(SinkState::GiveSinkCap));
            }
            Some(ControlMessageType::DrSwap) => {
                let new_role = self.data_role.flipped();
                let accept = self.dpm.check(Policy::DataRoleSwap(new_role));
                self.pe.transition(State::Sink(SinkState::DrsEvaluateSwap(accept)));
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
                self.pe.transition(State::Sink(SinkState::SendSoftReset));
            }
            _ => {
                self.pe.transition(State::Sink(SinkState::SendNotSupported));
            }
        }
    }

    fn pe_sink_get_source_cap(&mut self, message: Option<Message>) {
        if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
            self.pe.response_timer.start::<CLK>(TimerType::SenderResponse);
        }

        if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
            self.dpm.notify(Event::MessageDiscarded);
            self.pe.transition(State::Sink(SinkState::Ready));
            return;
        }

        if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) {
            self.pe.transition(State::Sink(SinkState::SendSoftReset));
            return;
        }

        if let Some(message) = message {
            if let Some(Payload::SourceCapabilities(capabilities)) = message.payload {
                self.pe_sink_accept_capabilities(capabilities);
            } else {
                self.dpm.notify(Event::MessageNotSupported);
                self.pe.response_timer.stop();
                self.pe.transition(State::Sink(SinkState::Ready));
            }
            return;
        }

        // A silent partner here is not fatal; fall back to the contract.
        if self.pe.response_timer.is_expired::<CLK>() {
            self.pe.response_timer.stop();
            self.pe.transition(State::Sink(SinkState::Ready));
        }
    }

    fn pe_sink_drs_send_swap(&mut self, message: Option<Message>) {
        if self.pe.flags.test_and_clear(flag::TX_COMPLETE) {
            self.pe.response_timer.start::<CLK>(TimerType::SenderResponse);
        }

        if self.pe.flags.test_and_clear(flag::MSG_DISCARDED) {
            self.dpm.notify(Event::MessageDiscarded);
            self.pe.transition(State::Sink(SinkState::Ready));
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
                    self.pe.transition(State::Sink(SinkState::SendSoftReset));
                    return;
                }
            }

            self.pe.response_timer.stop();
            self.pe.transition(State::Sink(SinkState::Ready));
            return;
        }

        if self.pe.flags.test_and_clear(flag::PROTOCOL_ERROR) || self.pe.response_timer.is_expired::<CLK>() {
            self.pe.response_timer.stop();
            self.pe.transition(State::Sink(SinkState::Ready));
        }
    }
}
