//! End-to-end negotiation tests, driving a whole port against a scripted
//! driver.

use uom::si::electric_current::milliampere;
use uom::si::electric_potential::volt;
use usbc_traits::{Alert, CcPull, CcVoltageState, RpValue, SopTarget};

use super::sink::SinkState;
use super::source::SourceState;
use super::State;
use crate::counters::{Counter, CounterType};
use crate::device_policy_manager::Event;
use crate::dummy::{FakeClock, FakeDpm, FakeDriver, FakeVbus};
use crate::port::{Config, Port, PortControl, PortRole, Request, CYCLE_MILLIS};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::pdo::{FixedSupply, PowerDataObject, SourceCapabilities};
use crate::protocol_layer::message::rdo::{PowerSourceRequest, RawRequest};
use crate::protocol_layer::message::{Message, Payload, MAX_MESSAGE_SIZE};
use crate::type_c;
use crate::units::{ElectricCurrent, ElectricPotential};
use crate::{DataRole, PowerRole};

/// The attached partner: builds wire messages with its own message IDs.
struct Partner {
    template: Header,
    counter: Counter,
}

impl Partner {
    fn source() -> Self {
        Self {
            template: Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X),
            counter: Counter::new(CounterType::MessageId),
        }
    }

    fn sink() -> Self {
        Self {
            template: Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X),
            counter: Counter::new(CounterType::MessageId),
        }
    }

    fn serialize(&mut self, header: Header, payload: Option<Payload>) -> Vec<u8> {
        let message = Message {
            sop: SopTarget::Sop,
            header,
            payload,
        };

        let mut buf = [0; MAX_MESSAGE_SIZE];
        let length = message.to_bytes(&mut buf);
        let _ = self.counter.increment();
        buf[..length].to_vec()
    }

    fn control(&mut self, message_type: ControlMessageType) -> Vec<u8> {
        let header = Header::new_control(self.template, self.counter, message_type);
        self.serialize(header, None)
    }

    fn source_capabilities(&mut self, capabilities: &SourceCapabilities) -> Vec<u8> {
        let header = Header::new_data(
            self.template,
            self.counter,
            DataMessageType::SourceCapabilities,
            capabilities.pdos().len() as u8,
        );
        self.serialize(header, Some(Payload::SourceCapabilities(capabilities.clone())))
    }

    fn request(&mut self, object_position: u8) -> Vec<u8> {
        let header = Header::new_data(self.template, self.counter, DataMessageType::Request, 1);
        let raw = RawRequest(0).with_object_position(object_position);
        self.serialize(
            header,
            Some(Payload::Request(
                crate::protocol_layer::message::rdo::PowerSourceRequest::Unknown(raw),
            )),
        )
    }

    fn extended(&mut self) -> Vec<u8> {
        let header = Header::new(self.template, self.counter, MessageType::Data(DataMessageType::Reserved), 1)
            .with_extended(true);
        let mut objects = heapless::Vec::new();
        objects.push(0xdead_beef).unwrap();
        self.serialize(header, Some(Payload::Raw(objects)))
    }
}

fn capabilities_5v_3a() -> SourceCapabilities {
    SourceCapabilities::new(&[PowerDataObject::FixedSupply(FixedSupply::new(
        ElectricPotential::new::<volt>(5),
        ElectricCurrent::new::<milliampere>(3000),
    ))])
}

struct Fixture<'a, const SLOT: usize> {
    port: Port<'a, FakeDriver, FakeVbus, FakeDpm, FakeClock<SLOT>>,
    driver: FakeDriver,
    vbus: FakeVbus,
    dpm: FakeDpm,
    control: &'a PortControl,
}

impl<'a, const SLOT: usize> Fixture<'a, SLOT> {
    fn new(control: &'a PortControl, role: PortRole) -> Self {
        FakeClock::<SLOT>::reset();

        let driver = FakeDriver::default();
        let vbus = FakeVbus::new(false);
        let dpm = FakeDpm::default();
        let port = Port::new(
            driver.clone(),
            vbus.clone(),
            dpm.clone(),
            control,
            Config {
                role,
                rp_value: RpValue::Rp1A5,
            },
        );

        Self {
            port,
            driver,
            vbus,
            dpm,
            control,
        }
    }

    fn step(&mut self, cycles: usize) {
        for _ in 0..cycles {
            FakeClock::<SLOT>::advance(CYCLE_MILLIS);
            self.port.run_step();
        }
    }

    fn step_until(&mut self, max_cycles: usize, done: impl Fn(&Self) -> bool) {
        for _ in 0..max_cycles {
            self.step(1);
            if done(self) {
                return;
            }
        }

        panic!("condition not reached within {max_cycles} cycles");
    }

    fn sink_state(&self) -> SinkState {
        match self.port.pe.state() {
            State::Sink(state) => state,
            other => panic!("not a sink state: {other:?}"),
        }
    }

    fn source_state(&self) -> SourceState {
        match self.port.pe.state() {
            State::Source(state) => state,
            other => panic!("not a source state: {other:?}"),
        }
    }

    /// Attach a source partner: Rp on CC1, then VBUS.
    fn attach_source_partner(&mut self) {
        self.control.start();
        self.step(1);

        self.driver.set_cc_state(CcVoltageState::Snk3_0, CcVoltageState::Open);
        self.vbus.set_present(true);

        self.step_until(64, |f| f.port.is_attached());
        // Let the policy engine settle into waiting for capabilities.
        self.step(3);
        assert_eq!(self.sink_state(), SinkState::WaitForCapabilities);
    }

    /// Attach a sink partner: Rd on CC1.
    fn attach_sink_partner(&mut self) {
        self.control.start();
        self.step(1);

        self.driver.set_cc_state(CcVoltageState::Rd, CcVoltageState::Open);
        self.step_until(64, |f| f.port.is_attached());
    }

    /// Acknowledge the last transmission, as the PHY would on GoodCRC.
    fn ack_transmission(&mut self) {
        self.control.alerts.raise(Alert::TransmitSucceeded);
        self.step(1);
    }

    fn transmitted_types(&self) -> Vec<MessageType> {
        self.driver
            .transmitted()
            .iter()
            .map(|(_, data)| Header::from_bytes(data).unwrap().message_type())
            .collect()
    }

    /// Drive the sink negotiation up to an explicit contract.
    fn negotiate_contract(&mut self, partner: &mut Partner) {
        self.driver.inject(SopTarget::Sop, &partner.source_capabilities(&capabilities_5v_3a()));
        self.step_until(8, |f| !f.driver.transmitted().is_empty());
        assert!(matches!(
            self.transmitted_types()[0],
            MessageType::Data(DataMessageType::Request)
        ));

        self.ack_transmission();
        self.driver.inject(SopTarget::Sop, &partner.control(ControlMessageType::Accept));
        self.step_until(8, |f| f.sink_state() == SinkState::TransitionSink);

        self.driver.inject(SopTarget::Sop, &partner.control(ControlMessageType::PsRdy));
        self.step_until(8, |f| f.sink_state() == SinkState::Ready);
    }
}

#[test]
fn sink_attaches_after_debounced_rp_and_vbus() {
    let control = PortControl::new();
    let mut f = Fixture::<1>::new(&control, PortRole::Sink);

    f.attach_source_partner();

    assert_eq!(f.port.state(), type_c::State::AttachedSnk);
    assert!(f.port.pe.is_running());

    let state = f.driver.0.borrow();
    assert!(state.rx_enabled);
    assert_eq!(state.polarity, Some(usbc_traits::CcPolarity::Cc1));
}

#[test]
fn sink_negotiates_an_explicit_contract() {
    let control = PortControl::new();
    let mut f = Fixture::<2>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();
    f.negotiate_contract(&mut partner);

    assert!(f.port.explicit_contract());
    assert_eq!(f.dpm.count_events(|e| matches!(e, Event::PdConnected)), 1);
    assert_eq!(
        f.dpm.count_events(|e| matches!(e, Event::SourceCapabilitiesReceived(_))),
        1
    );
    assert_eq!(f.dpm.0.borrow().transitions.len(), 1);
}

#[test]
fn transmission_failure_during_request_escalates_to_hard_reset() {
    let control = PortControl::new();
    let mut f = Fixture::<3>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();
    f.driver.inject(SopTarget::Sop, &partner.source_capabilities(&capabilities_5v_3a()));
    f.step_until(8, |f| !f.driver.transmitted().is_empty());

    // The PHY gives up on the request.
    f.control.alerts.raise(Alert::TransmitFailed);
    f.step_until(8, |f| f.driver.hard_resets_sent() == 1);

    assert_eq!(f.port.pe.hard_reset_counter.value(), 1);
    assert!(!f.port.explicit_contract());

    // The stack recovers into waiting for fresh capabilities.
    f.step_until(16, |f| f.sink_state() == SinkState::WaitForCapabilities);
    assert_eq!(f.dpm.count_events(|e| matches!(e, Event::HardResetComplete)), 1);
}

#[test]
fn rejected_request_without_contract_returns_to_capability_wait() {
    let control = PortControl::new();
    let mut f = Fixture::<4>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();
    f.driver.inject(SopTarget::Sop, &partner.source_capabilities(&capabilities_5v_3a()));
    f.step_until(8, |f| !f.driver.transmitted().is_empty());
    f.ack_transmission();

    f.driver.inject(SopTarget::Sop, &partner.control(ControlMessageType::Reject));
    f.step_until(8, |f| f.sink_state() == SinkState::WaitForCapabilities);

    assert!(!f.port.explicit_contract());
    assert_eq!(f.dpm.count_events(|e| matches!(e, Event::MessageRejected)), 1);
    assert_eq!(f.driver.hard_resets_sent(), 0);
}

#[test]
fn silent_partner_exhausts_hard_resets_and_suspends() {
    let control = PortControl::new();
    let mut f = Fixture::<5>::new(&control, PortRole::Sink);

    f.attach_source_partner();

    // No capabilities ever arrive. Each capability wait times out and costs
    // one hard reset, until the budget is spent.
    f.step_until(800, |f| f.sink_state() == SinkState::Suspended);

    assert_eq!(f.driver.hard_resets_sent(), 2);
    assert_eq!(f.dpm.count_events(|e| matches!(e, Event::PartnerNotResponsive)), 1);

    // Parked for good: time passing changes nothing.
    f.step(200);
    assert_eq!(f.sink_state(), SinkState::Suspended);
    assert_eq!(f.driver.hard_resets_sent(), 2);
}

#[test]
fn duplicate_message_ids_are_delivered_once() {
    let control = PortControl::new();
    let mut f = Fixture::<6>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();

    let capabilities = partner.source_capabilities(&capabilities_5v_3a());
    f.driver.inject(SopTarget::Sop, &capabilities);
    // The same wire message again, as after a lost GoodCRC.
    f.driver.inject(SopTarget::Sop, &capabilities);

    f.step(8);
    assert_eq!(
        f.dpm.count_events(|e| matches!(e, Event::SourceCapabilitiesReceived(_))),
        1
    );
}

#[test]
fn transmitted_message_ids_increment_per_acknowledged_message() {
    let control = PortControl::new();
    let mut f = Fixture::<7>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();
    f.negotiate_contract(&mut partner);

    // A sink-initiated sequence from Ready: SinkTxOk (Rp 3.0 A) is already
    // present on CC1, so the message goes out right away.
    assert!(control.request(Request::GetSourceCapabilities).is_ok());
    f.step_until(8, |f| f.driver.transmitted().len() == 2);

    let ids: Vec<u8> = f
        .driver
        .transmitted()
        .iter()
        .map(|(_, data)| Header::from_bytes(data).unwrap().message_id())
        .collect();
    assert_eq!(ids, vec![0, 1]);
}

#[test]
fn soft_reset_is_acknowledged_and_restarts_negotiation() {
    let control = PortControl::new();
    let mut f = Fixture::<8>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();
    f.negotiate_contract(&mut partner);

    // The partner resets its counters along with the soft reset.
    let mut partner = Partner::source();
    f.driver.inject(SopTarget::Sop, &partner.control(ControlMessageType::SoftReset));
    f.step_until(8, |f| {
        matches!(
            f.transmitted_types().last(),
            Some(MessageType::Control(ControlMessageType::Accept))
        )
    });

    f.ack_transmission();
    f.step_until(8, |f| f.sink_state() == SinkState::WaitForCapabilities);
}

#[test]
fn extended_messages_are_answered_with_not_supported_after_the_chunking_wait() {
    let control = PortControl::new();
    let mut f = Fixture::<9>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();
    f.negotiate_contract(&mut partner);

    let transmitted_before = f.driver.transmitted().len();
    f.driver.inject(SopTarget::Sop, &partner.extended());
    f.step_until(4, |f| f.sink_state() == SinkState::ChunkReceived);

    // tChunkingNotSupported passes before the answer.
    f.step_until(16, |f| f.driver.transmitted().len() > transmitted_before);
    assert!(matches!(
        f.transmitted_types().last(),
        Some(MessageType::Control(ControlMessageType::NotSupported))
    ));
}

#[test]
fn accepted_data_role_swap_flips_the_data_role() {
    let control = PortControl::new();
    let mut f = Fixture::<10>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();
    f.negotiate_contract(&mut partner);
    assert_eq!(f.port.data_role(), DataRole::Ufp);

    f.driver.inject(SopTarget::Sop, &partner.control(ControlMessageType::DrSwap));
    f.step_until(8, |f| {
        matches!(
            f.transmitted_types().last(),
            Some(MessageType::Control(ControlMessageType::Accept))
        )
    });

    f.ack_transmission();
    f.step_until(8, |f| f.port.data_role() == DataRole::Dfp);
    assert_eq!(f.dpm.count_events(|e| matches!(e, Event::DataRoleIsDfp)), 1);
    assert_eq!(f.sink_state(), SinkState::Ready);
}

#[test]
fn source_advertises_and_grants_a_contract() {
    let control = PortControl::new();
    let mut f = Fixture::<11>::new(&control, PortRole::Source);
    let mut partner = Partner::sink();

    f.attach_sink_partner();
    f.step_until(8, |f| !f.driver.transmitted().is_empty());
    assert!(matches!(
        f.transmitted_types()[0],
        MessageType::Data(DataMessageType::SourceCapabilities)
    ));

    f.ack_transmission();
    f.driver.inject(SopTarget::Sop, &partner.request(1));
    f.step_until(8, |f| {
        matches!(
            f.transmitted_types().last(),
            Some(MessageType::Control(ControlMessageType::Accept))
        )
    });

    f.ack_transmission();
    f.step_until(8, |f| {
        matches!(
            f.transmitted_types().last(),
            Some(MessageType::Control(ControlMessageType::PsRdy))
        )
    });

    f.ack_transmission();
    f.step_until(8, |f| f.source_state() == SourceState::Ready);
    // Let Ready's deferred entry action run.
    f.step(1);

    assert!(f.port.explicit_contract());
    assert_eq!(f.dpm.count_events(|e| matches!(e, Event::PdConnected)), 1);
    assert_eq!(f.dpm.0.borrow().transitions.len(), 1);
    // Collision avoidance: Ready advertises SinkTxOk.
    assert_eq!(f.driver.0.borrow().rp_value, Some(RpValue::Rp3A0));
}

#[test]
fn source_retries_capability_advertisement_after_transmit_failure() {
    let control = PortControl::new();
    let mut f = Fixture::<12>::new(&control, PortRole::Source);

    f.attach_sink_partner();
    f.step_until(8, |f| f.driver.transmitted().len() == 1);

    f.control.alerts.raise(Alert::TransmitFailed);
    // tTypeCSendSourceCap between attempts.
    f.step_until(64, |f| f.driver.transmitted().len() == 2);

    assert!(matches!(
        f.transmitted_types()[1],
        MessageType::Data(DataMessageType::SourceCapabilities)
    ));
}

#[test]
fn detach_stops_pd_and_returns_to_unattached() {
    let control = PortControl::new();
    let mut f = Fixture::<13>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();
    f.negotiate_contract(&mut partner);

    f.vbus.set_present(false);
    f.driver.set_cc_state(CcVoltageState::Open, CcVoltageState::Open);
    f.step_until(8, |f| f.port.state() == type_c::State::UnattachedSnk);

    assert!(!f.port.pe.is_running());
    assert!(!f.port.explicit_contract());
    assert!(!f.driver.0.borrow().rx_enabled);

    // The protocol layer is parked: stray hard reset signaling is ignored.
    f.control.alerts.raise(Alert::HardResetReceived);
    f.step(4);
    assert_eq!(f.driver.hard_resets_sent(), 0);
    assert!(!f.driver.0.borrow().rx_enabled);
}

#[test]
fn contract_success_restores_the_hard_reset_budget() {
    let control = PortControl::new();
    let mut f = Fixture::<14>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();

    // Two capability waits time out, costing one hard reset each.
    f.step_until(400, |f| f.driver.hard_resets_sent() == 2);
    f.step_until(16, |f| f.sink_state() == SinkState::WaitForCapabilities);

    f.negotiate_contract(&mut partner);
    assert_eq!(f.port.pe.hard_reset_counter.value(), 0);

    // A later recoverable failure may spend a reset again instead of
    // parking the engine.
    let request = PowerSourceRequest::Unknown(RawRequest(0).with_object_position(1));
    assert!(control.request(Request::RequestPower(request)).is_ok());

    let transmitted = f.driver.transmitted().len();
    f.step_until(8, |f| f.driver.transmitted().len() > transmitted);
    f.control.alerts.raise(Alert::TransmitFailed);
    f.step_until(8, |f| f.driver.hard_resets_sent() == 3);

    f.step_until(16, |f| f.sink_state() == SinkState::WaitForCapabilities);
    assert_eq!(f.dpm.count_events(|e| matches!(e, Event::PartnerNotResponsive)), 0);
}

#[test]
fn discarded_soft_reset_is_sent_again() {
    let control = PortControl::new();
    let mut f = Fixture::<15>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();
    f.negotiate_contract(&mut partner);

    // An out-of-sequence answer triggers a soft reset.
    f.driver.inject(SopTarget::Sop, &partner.control(ControlMessageType::Accept));
    f.step_until(8, |f| {
        matches!(
            f.transmitted_types().last(),
            Some(MessageType::Control(ControlMessageType::SoftReset))
        )
    });

    // Before the PHY answers, inbound capabilities discard the soft reset.
    f.driver.inject(SopTarget::Sop, &partner.source_capabilities(&capabilities_5v_3a()));
    f.step_until(8, |f| {
        f.transmitted_types()
            .iter()
            .filter(|t| matches!(t, MessageType::Control(ControlMessageType::SoftReset)))
            .count()
            == 2
    });

    f.ack_transmission();
    f.driver.inject(SopTarget::Sop, &partner.control(ControlMessageType::Accept));
    f.step_until(8, |f| f.sink_state() == SinkState::WaitForCapabilities);
    assert_eq!(f.dpm.count_events(|e| matches!(e, Event::MessageDiscarded)), 1);
}

#[test]
fn error_recovery_cycles_cc_and_reattaches() {
    let control = PortControl::new();
    let mut f = Fixture::<16>::new(&control, PortRole::Sink);

    f.attach_source_partner();

    assert!(control.request(Request::ErrorRecovery).is_ok());
    f.step(2);

    assert_eq!(f.port.state(), type_c::State::ErrorRecovery);
    assert!(!f.port.pe.is_running());
    assert_eq!(f.driver.0.borrow().pull, Some(CcPull::Open));
    assert!(!f.driver.0.borrow().rx_enabled);

    // tErrorRecovery passes; the partner is still present and reattaches.
    f.step_until(128, |f| f.port.state() == type_c::State::AttachedSnk);
    // Let AttachedSnk's deferred entry action run.
    f.step(1);
    assert!(f.port.pe.is_running());
}

#[test]
fn source_defers_ps_rdy_until_the_supply_settles() {
    let control = PortControl::new();
    let mut f = Fixture::<17>::new(&control, PortRole::Source);
    let mut partner = Partner::sink();

    f.dpm.0.borrow_mut().supply_ready = false;

    f.attach_sink_partner();
    f.step_until(8, |f| !f.driver.transmitted().is_empty());
    f.ack_transmission();

    f.driver.inject(SopTarget::Sop, &partner.request(1));
    f.step_until(8, |f| {
        matches!(
            f.transmitted_types().last(),
            Some(MessageType::Control(ControlMessageType::Accept))
        )
    });
    f.ack_transmission();

    // The supply has not settled yet; PS_RDY is held back.
    f.step(20);
    assert!(matches!(f.source_state(), SourceState::TransitionSupply(_)));
    assert!(!f
        .transmitted_types()
        .iter()
        .any(|t| matches!(t, MessageType::Control(ControlMessageType::PsRdy))));

    f.dpm.0.borrow_mut().supply_ready = true;
    f.step_until(8, |f| {
        matches!(
            f.transmitted_types().last(),
            Some(MessageType::Control(ControlMessageType::PsRdy))
        )
    });

    f.ack_transmission();
    f.step_until(8, |f| f.source_state() == SourceState::Ready);
    assert!(f.port.explicit_contract());
    assert_eq!(f.dpm.0.borrow().transitions.len(), 1);
}

#[test]
fn rp_advertisement_removal_reports_a_zero_budget() {
    let control = PortControl::new();
    let mut f = Fixture::<18>::new(&control, PortRole::Sink);

    f.attach_source_partner();
    f.step_until(8, |f| {
        f.dpm
            .count_events(|e| matches!(e, Event::PowerLevelChanged(Some(RpValue::Rp3A0))))
            == 1
    });

    // The source stops advertising while VBUS stays up.
    f.driver.set_cc_state(CcVoltageState::Open, CcVoltageState::Open);
    f.step_until(16, |f| {
        f.dpm.count_events(|e| matches!(e, Event::PowerLevelChanged(None))) == 1
    });
    assert_eq!(f.port.state(), type_c::State::AttachedSnk);
}

#[test]
fn message_id_replay_across_a_soft_reset_is_delivered() {
    let control = PortControl::new();
    let mut f = Fixture::<19>::new(&control, PortRole::Sink);
    let mut partner = Partner::source();

    f.attach_source_partner();

    // Capabilities arrive with message ID 0.
    f.driver.inject(SopTarget::Sop, &partner.source_capabilities(&capabilities_5v_3a()));
    f.step_until(8, |f| !f.driver.transmitted().is_empty());
    f.ack_transmission();

    // The partner soft-resets instead of answering the request.
    f.driver.inject(SopTarget::Sop, &partner.control(ControlMessageType::SoftReset));
    f.step_until(8, |f| {
        matches!(
            f.transmitted_types().last(),
            Some(MessageType::Control(ControlMessageType::Accept))
        )
    });
    f.ack_transmission();
    f.step_until(8, |f| f.sink_state() == SinkState::WaitForCapabilities);

    // The partner's counters restart: the same wire ID must be delivered
    // again, not dropped as a duplicate.
    let mut partner = Partner::source();
    f.driver.inject(SopTarget::Sop, &partner.source_capabilities(&capabilities_5v_3a()));
    f.step_until(8, |f| {
        f.dpm.count_events(|e| matches!(e, Event::SourceCapabilitiesReceived(_))) == 2
    });
}
