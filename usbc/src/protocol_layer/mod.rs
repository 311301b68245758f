//! The protocol layer (PRL) sits between the policy engine and the PHY.
//!
//! Handles
//! - construction of outgoing messages from the role/revision template,
//! - message ID counting and duplicate detection, per SOP type,
//! - discarding of outgoing traffic that collides with incoming messages,
//! - the hard reset sequence towards the PHY.
//!
//! GoodCRC generation and retries live in the PHY; the protocol layer only
//! learns the outcome of a transmission through the driver's alerts.
//! Extended messages are not originated and received ones are passed through
//! uninterpreted.

pub mod message;

use message::header::{ControlMessageType, Header, MessageType, SpecificationRevision};
use message::{Message, Payload, MAX_MESSAGE_SIZE};
use usbc_traits::{Alert, CcVoltageState, PortController, SopTarget, VbusSensor};

use crate::counters::{Counter, CounterType};
use crate::device_policy_manager::DevicePolicyManager;
use crate::flags::Flags;
use crate::policy_engine;
use crate::port::Port;
use crate::timers::{Clock, Timer, TimerType};
use crate::PowerRole;

/// Flags routed to the protocol layer.
pub(crate) mod flag {
    /// The policy engine requests a hard reset.
    pub const HARD_RESET_REQUEST: u16 = 1 << 0;
    /// The PHY signaled an incoming hard reset.
    pub const HARD_RESET_RECEIVED: u16 = 1 << 1;
    /// The policy engine finished its part of a hard reset.
    pub const PE_HARD_RESET_COMPLETE: u16 = 1 << 2;
    /// The PHY acknowledged the last transmission (GoodCRC received).
    pub const TX_SUCCEEDED: u16 = 1 << 3;
    /// The PHY gave up on the last transmission.
    pub const TX_FAILED: u16 = 1 << 4;
    /// The PHY discarded the last transmission due to incoming traffic.
    pub const TX_DISCARDED: u16 = 1 << 5;
    /// The queued message is the first in an atomic message sequence.
    pub const AMS_FIRST_MESSAGE: u16 = 1 << 6;
}

/// States of the transmission state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum TxState {
    /// Drop any in-flight transmission and start over.
    PhyReset,
    /// Idle, waiting for the policy engine to queue a message.
    WaitForMessageRequest,
    /// Reset counters for the SOP type of an outgoing Soft_Reset.
    LayerResetForTransmit,
    /// A sink waits for SinkTxOk before starting an atomic sequence.
    SnkPending,
    /// A source claims the wire with SinkTxNG before starting a sequence.
    SrcPending,
    /// The message is at the PHY; wait for an alert or timeout.
    WaitForPhyResponse,
    /// Transmission is halted until a hard reset completes or the port
    /// restarts.
    Suspend,
}

/// States of the hard reset state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum HardResetState {
    /// Idle, waiting for a request or signal.
    WaitForRequest,
    /// Reset protocol layer state and stop reception.
    ResetLayer,
    /// Wait for the PHY to finish driving the hard reset signaling.
    WaitForPhyHardResetComplete,
    /// Wait for the policy engine to finish its reset handling.
    WaitForPeHardResetComplete,
    /// Parked while PD communication is stopped.
    Suspend,
}

/// A queued transmission: the header is built at transmit time.
#[derive(Debug, Clone)]
pub(crate) struct TxRequest {
    pub sop: SopTarget,
    pub message_type: MessageType,
    pub payload: Option<Payload>,
}

/// Protocol layer state for one port.
#[derive(Debug)]
pub struct ProtocolLayer {
    tx_state: TxState,
    hard_reset_state: HardResetState,
    header_template: Header,
    /// The revision this port offers before negotiation settles.
    default_revision: SpecificationRevision,
    tx_message_counters: [Counter; SopTarget::COUNT],
    stored_message_ids: [Option<u8>; SopTarget::COUNT],
    tx_request: Option<TxRequest>,
    rx_message: Option<Message>,
    tx_timer: Timer,
    sink_tx_timer: Timer,
    hard_reset_timer: Timer,
    pub(crate) flags: Flags,
}

impl ProtocolLayer {
    /// Create a protocol layer with the given header template.
    pub fn new(header_template: Header) -> Self {
        let revision = header_template
            .spec_revision()
            .unwrap_or(SpecificationRevision::R3_X);

        Self {
            tx_state: TxState::WaitForMessageRequest,
            hard_reset_state: HardResetState::WaitForRequest,
            header_template,
            default_revision: revision,
            tx_message_counters: [Counter::new(CounterType::MessageId); SopTarget::COUNT],
            stored_message_ids: [None; SopTarget::COUNT],
            tx_request: None,
            rx_message: None,
            tx_timer: Timer::new(),
            sink_tx_timer: Timer::new(),
            hard_reset_timer: Timer::new(),
            flags: Flags::new(),
        }
    }

    /// Queue a message for transmission.
    ///
    /// Only one message can be in flight; a second request overwrites the
    /// first, which must not happen while the policy engine waits for the
    /// outcome of the first one.
    pub(crate) fn queue_transmit(&mut self, request: TxRequest, ams_first: bool) {
        self.tx_request = Some(request);

        if ams_first {
            self.flags.set(flag::AMS_FIRST_MESSAGE);
        }
    }

    /// Whether a transmission is queued or in flight.
    pub(crate) fn is_transmitting(&self) -> bool {
        self.tx_request.is_some() || self.tx_state == TxState::WaitForPhyResponse
    }

    /// Whether the hard reset sequence only waits for the policy engine.
    ///
    /// The policy engine must not restart until this holds, since its startup
    /// resets the layer and would lose the completion handshake.
    pub(crate) fn awaits_pe_hard_reset(&self) -> bool {
        self.hard_reset_state == HardResetState::WaitForPeHardResetComplete
    }

    /// Take the message received in this cycle, if any.
    pub(crate) fn take_rx_message(&mut self) -> Option<Message> {
        self.rx_message.take()
    }

    /// The header template in use.
    pub(crate) fn header_template(&self) -> Header {
        self.header_template
    }

    /// Update the roles carried in the header template.
    pub(crate) fn set_roles(&mut self, power_role: crate::PowerRole, data_role: crate::DataRole) {
        self.header_template = self
            .header_template
            .with_port_power_role(power_role)
            .with_port_data_role(data_role);
    }

    /// The negotiated specification revision.
    pub(crate) fn revision(&self) -> SpecificationRevision {
        self.header_template
            .spec_revision()
            .unwrap_or(self.default_revision)
    }

    /// Reset message counters and stored IDs for one SOP type.
    fn layer_reset_for_sop(&mut self, sop: SopTarget) {
        self.tx_message_counters[sop.index()] = Counter::new(CounterType::MessageId);
        self.stored_message_ids[sop.index()] = None;
    }

    /// Reset the whole layer, as on hard reset or detach.
    pub(crate) fn reset(&mut self) {
        self.tx_message_counters = [Counter::new(CounterType::MessageId); SopTarget::COUNT];
        self.stored_message_ids = [None; SopTarget::COUNT];
        self.tx_request = None;
        self.rx_message = None;
        self.tx_state = TxState::WaitForMessageRequest;
        self.hard_reset_state = HardResetState::WaitForRequest;
        self.tx_timer.stop();
        self.sink_tx_timer.stop();
        self.hard_reset_timer.stop();
        self.flags.clear_all();
        self.header_template = self.header_template.with_spec_revision(self.default_revision);
    }

    /// Reset the layer and park its state machines, as on detach or an
    /// explicit suspend. [`ProtocolLayer::reset`] leaves the parked state.
    pub(crate) fn suspend(&mut self) {
        self.reset();
        self.tx_state = TxState::Suspend;
        self.hard_reset_state = HardResetState::Suspend;
    }

    /// Track the partner's revision: both sides settle on the lower one.
    fn negotiate_revision(&mut self, partner: SpecificationRevision) {
        let ours = self.revision();

        let negotiated = match (ours, partner) {
            (SpecificationRevision::R3_X, SpecificationRevision::R3_X) => SpecificationRevision::R3_X,
            (SpecificationRevision::R1_0, _) | (_, SpecificationRevision::R1_0) => SpecificationRevision::R1_0,
            _ => SpecificationRevision::R2_0,
        };

        self.header_template = self.header_template.with_spec_revision(negotiated);
    }
}

impl<DRV, VBUS, DPM, CLK> Port<'_, DRV, VBUS, DPM, CLK>
where
    DRV: PortController,
    VBUS: VbusSensor,
    DPM: DevicePolicyManager,
    CLK: Clock,
{
    /// Map drained driver alerts onto protocol layer flags.
    pub(crate) fn prl_route_alerts(&mut self, alerts: u32) {
        if alerts & Alert::HardResetReceived.mask() != 0 {
            self.prl.flags.set(flag::HARD_RESET_RECEIVED);
        }
        if alerts & Alert::TransmitSucceeded.mask() != 0 {
            self.prl.flags.set(flag::TX_SUCCEEDED);
        }
        if alerts & Alert::TransmitFailed.mask() != 0 {
            self.prl.flags.set(flag::TX_FAILED);
        }
        if alerts & Alert::TransmitDiscarded.mask() != 0 {
            self.prl.flags.set(flag::TX_DISCARDED);
        }
    }

    /// Receive and filter one message, routing it to the policy engine.
    pub(crate) fn prl_rx_run(&mut self) {
        if self.prl.hard_reset_state != HardResetState::WaitForRequest {
            // Reception is disabled while a hard reset is in progress.
            return;
        }

        let mut buffer = [0; MAX_MESSAGE_SIZE];
        let (sop, length) = match self.driver.receive(&mut buffer) {
            Ok(Some(received)) => received,
            Ok(None) => return,
            Err(error) => {
                warn!("Receive failed: {:?}", error);
                return;
            }
        };

        let message = match Message::from_bytes(sop, &buffer[..length]) {
            Ok(message) => message,
            Err(error) => {
                warn!("Dropping unparseable message: {:?}", error);
                return;
            }
        };

        if let Ok(partner_revision) = message.header.spec_revision() {
            self.prl.negotiate_revision(partner_revision);
        }

        let message_type = message.header.message_type();

        // Soft_Reset bypasses duplicate detection: the partner has already
        // reset its counters.
        if message_type == MessageType::Control(ControlMessageType::SoftReset) {
            self.prl.layer_reset_for_sop(sop);
            self.prl.stored_message_ids[sop.index()] = Some(message.header.message_id());
            self.prl.tx_request = None;
            self.prl.tx_state = TxState::WaitForMessageRequest;
            self.pe.flags.set(policy_engine::flag::SOFT_RESET_RECEIVED);
            return;
        }

        if self.prl.stored_message_ids[sop.index()] == Some(message.header.message_id()) {
            debug!("Dropping duplicate message with ID {}", message.header.message_id());
            return;
        }
        self.prl.stored_message_ids[sop.index()] = Some(message.header.message_id());

        // Any incoming message other than Ping discards a pending
        // transmission, in favor of handling the partner's sequence.
        let is_ping = message_type == MessageType::Control(ControlMessageType::Ping);
        if !is_ping && self.prl.is_transmitting() {
            debug!("Incoming message discards pending transmission");
            self.prl.tx_request = None;
            self.prl.tx_timer.stop();
            self.prl.tx_state = TxState::PhyReset;
            self.pe.flags.set(policy_engine::flag::MSG_DISCARDED);
        }

        self.prl.rx_message = Some(message);
        self.pe.flags.set(policy_engine::flag::MSG_RECEIVED);
    }

    /// Step the transmission state machine.
    pub(crate) fn prl_tx_run(&mut self) {
        match self.prl.tx_state {
            TxState::PhyReset => {
                self.prl.tx_timer.stop();
                self.prl.sink_tx_timer.stop();
                self.prl.tx_state = TxState::WaitForMessageRequest;
            }
            TxState::WaitForMessageRequest => {
                let Some(request) = self.prl.tx_request.as_ref() else {
                    return;
                };

                if request.message_type == MessageType::Control(ControlMessageType::SoftReset) {
                    self.prl.tx_state = TxState::LayerResetForTransmit;
                } else if self.prl.flags.test_and_clear(flag::AMS_FIRST_MESSAGE) {
                    match self.power_role {
                        PowerRole::Sink => self.prl.tx_state = TxState::SnkPending,
                        PowerRole::Source => {
                            // Claim the wire before the sequence starts.
                            if let Err(error) = self.driver.select_rp_value(usbc_traits::RpValue::Rp1A5) {
                                warn!("Failed to set SinkTxNG: {:?}", error);
                            }
                            self.prl.sink_tx_timer.start::<CLK>(TimerType::SinkTx);
                            self.prl.tx_state = TxState::SrcPending;
                        }
                    }
                } else {
                    self.prl_construct_and_transmit();
                }
            }
            TxState::LayerResetForTransmit => {
                if let Some(sop) = self.prl.tx_request.as_ref().map(|request| request.sop) {
                    self.prl.layer_reset_for_sop(sop);
                }
                self.prl_construct_and_transmit();
            }
            TxState::SnkPending => {
                // Wait until the source advertises SinkTxOk.
                if self.tc.active_cc() == CcVoltageState::Snk3_0 {
                    self.prl_construct_and_transmit();
                }
            }
            TxState::SrcPending => {
                // Sinks must see SinkTxNG for tSinkTx before we may send.
                if self.prl.sink_tx_timer.is_expired::<CLK>() {
                    self.prl.sink_tx_timer.stop();
                    self.prl_construct_and_transmit();
                }
            }
            TxState::WaitForPhyResponse => self.prl_check_phy_response(),
            TxState::Suspend => {}
        }
    }

    /// Build the header from the template and hand the message to the PHY.
    fn prl_construct_and_transmit(&mut self) {
        let Some(request) = self.prl.tx_request.take() else {
            self.prl.tx_state = TxState::WaitForMessageRequest;
            return;
        };

        let num_objects = request.payload.as_ref().map(Payload::num_objects).unwrap_or(0);
        let header = Header::new(
            self.prl.header_template,
            self.prl.tx_message_counters[request.sop.index()],
            request.message_type,
            num_objects,
        );

        let message = Message {
            sop: request.sop,
            header,
            payload: request.payload,
        };

        let mut buffer = [0; MAX_MESSAGE_SIZE];
        let length = message.to_bytes(&mut buffer);

        trace!("Transmit {:?} on {:?}", message.header.message_type(), message.sop);

        match self.driver.transmit(message.sop, &buffer[..length]) {
            Ok(()) => {
                // Remember the SOP type for counter bookkeeping.
                self.prl.tx_request = Some(TxRequest {
                    sop: message.sop,
                    message_type: request.message_type,
                    payload: None,
                });
                self.prl.tx_timer.start::<CLK>(TimerType::TxTimeout);
                self.prl.tx_state = TxState::WaitForPhyResponse;
            }
            Err(error) => {
                warn!("Transmit failed at the driver: {:?}", error);
                self.pe.flags.set(policy_engine::flag::PROTOCOL_ERROR);
                self.prl.tx_state = TxState::WaitForMessageRequest;
            }
        }
    }

    /// Evaluate the PHY's response to an in-flight transmission.
    fn prl_check_phy_response(&mut self) {
        if self.prl.flags.test_and_clear(flag::TX_SUCCEEDED) {
            if let Some(request) = self.prl.tx_request.take() {
                let _ = self.prl.tx_message_counters[request.sop.index()].increment();
            }

            self.prl.tx_timer.stop();
            self.pe.flags.set(policy_engine::flag::TX_COMPLETE);
            self.prl.tx_state = TxState::WaitForMessageRequest;
        } else if self.prl.flags.test_and_clear(flag::TX_DISCARDED) {
            self.prl.tx_request = None;
            self.prl.tx_timer.stop();
            self.pe.flags.set(policy_engine::flag::MSG_DISCARDED);
            self.prl.tx_state = TxState::PhyReset;
        } else if self.prl.flags.test_and_clear(flag::TX_FAILED) || self.prl.tx_timer.is_expired::<CLK>() {
            self.prl.tx_request = None;
            self.prl.tx_timer.stop();
            self.pe.flags.set(policy_engine::flag::PROTOCOL_ERROR);
            self.prl.tx_state = TxState::WaitForMessageRequest;
        }
    }

    /// Step the hard reset state machine.
    ///
    /// The request and reset states complete within a single cycle, so that
    /// the layer is already quiet when the policy engine reacts.
    pub(crate) fn prl_hr_run(&mut self) {
        loop {
            match self.prl.hard_reset_state {
                HardResetState::WaitForRequest => {
                    let requested = self.prl.flags.test_and_clear(flag::HARD_RESET_REQUEST);
                    let received = self.prl.flags.test_and_clear(flag::HARD_RESET_RECEIVED);

                    if !requested && !received {
                        return;
                    }

                    if requested {
                        if let Err(error) = self.driver.transmit_hard_reset() {
                            warn!("Failed to signal hard reset: {:?}", error);
                        }
                    }

                    if received {
                        self.pe.flags.set(policy_engine::flag::HARD_RESET_RECEIVED);
                    }

                    self.prl.hard_reset_state = HardResetState::ResetLayer;
                }
                HardResetState::ResetLayer => {
                    if let Err(error) = self.driver.set_rx_enable(false) {
                        warn!("Failed to disable reception: {:?}", error);
                    }

                    self.prl.reset();
                    self.prl.tx_state = TxState::Suspend;
                    self.prl.hard_reset_timer.start::<CLK>(TimerType::HardResetComplete);
                    self.prl.hard_reset_state = HardResetState::WaitForPhyHardResetComplete;
                }
                _ => break,
            }
        }

        match self.prl.hard_reset_state {
            HardResetState::WaitForRequest | HardResetState::ResetLayer | HardResetState::Suspend => {}
            HardResetState::WaitForPhyHardResetComplete => {
                if self.prl.hard_reset_timer.is_expired::<CLK>() {
                    self.prl.hard_reset_timer.stop();
                    self.pe.flags.set(policy_engine::flag::PRL_HARD_RESET_COMPLETE);
                    self.prl.hard_reset_state = HardResetState::WaitForPeHardResetComplete;
                }
            }
            HardResetState::WaitForPeHardResetComplete => {
                if self.prl.flags.test_and_clear(flag::PE_HARD_RESET_COMPLETE) {
                    if let Err(error) = self.driver.set_rx_enable(true) {
                        warn!("Failed to re-enable reception: {:?}", error);
                    }

                    self.prl.tx_state = TxState::WaitForMessageRequest;
                    self.prl.hard_reset_state = HardResetState::WaitForRequest;
                }
            }
        }
    }
}
