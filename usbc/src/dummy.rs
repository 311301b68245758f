//! Shared test doubles: a settable clock, a scripted port controller, a VBUS
//! switch and a recording device policy manager.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use usbc_traits::{
    CcPolarity, CcPull, CcVoltageState, DataRole, DriverError, PortController, PowerRole, RpValue, SopTarget,
    VbusLevel, VbusSensor,
};

use crate::device_policy_manager::{DevicePolicyManager, Event, Policy};
use crate::protocol_layer::message::rdo::PowerSourceRequest;
use crate::timers::Clock;

const CLOCK_SLOTS: usize = 32;

static CLOCKS: [AtomicU64; CLOCK_SLOTS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU64 = AtomicU64::new(0);
    [ZERO; CLOCK_SLOTS]
};

/// A test clock backed by a global slot, so that parallel tests do not share
/// time. Every test uses its own `SLOT`.
pub(crate) struct FakeClock<const SLOT: usize>;

impl<const SLOT: usize> FakeClock<SLOT> {
    pub fn reset() {
        CLOCKS[SLOT].store(0, Ordering::SeqCst);
    }

    pub fn advance(milliseconds: u64) {
        CLOCKS[SLOT].fetch_add(milliseconds, Ordering::SeqCst);
    }
}

impl<const SLOT: usize> Clock for FakeClock<SLOT> {
    fn now_millis() -> u64 {
        CLOCKS[SLOT].load(Ordering::SeqCst)
    }

    fn after_millis(milliseconds: u64) -> impl core::future::Future<Output = ()> {
        Self::advance(milliseconds);
        core::future::ready(())
    }
}

/// Observable state of a [`FakeDriver`].
pub(crate) struct DriverState {
    pub cc: (CcVoltageState, CcVoltageState),
    pub rx_queue: VecDeque<(SopTarget, Vec<u8>)>,
    pub transmitted: Vec<(SopTarget, Vec<u8>)>,
    pub hard_resets_sent: usize,
    pub rx_enabled: bool,
    pub pull: Option<CcPull>,
    pub rp_value: Option<RpValue>,
    pub polarity: Option<CcPolarity>,
    pub vconn: Option<bool>,
    pub roles: Option<(PowerRole, DataRole)>,
}

impl Default for DriverState {
    fn default() -> Self {
        Self {
            cc: (CcVoltageState::Open, CcVoltageState::Open),
            rx_queue: VecDeque::new(),
            transmitted: Vec::new(),
            hard_resets_sent: 0,
            rx_enabled: false,
            pull: None,
            rp_value: None,
            polarity: None,
            vconn: None,
            roles: None,
        }
    }
}

/// A port controller whose CC lines and receive queue are scripted by the
/// test. Cloning yields another handle onto the same state.
#[derive(Clone, Default)]
pub(crate) struct FakeDriver(pub Rc<RefCell<DriverState>>);

impl FakeDriver {
    pub fn set_cc_state(&self, cc1: CcVoltageState, cc2: CcVoltageState) {
        self.0.borrow_mut().cc = (cc1, cc2);
    }

    pub fn inject(&self, sop: SopTarget, data: &[u8]) {
        self.0.borrow_mut().rx_queue.push_back((sop, data.to_vec()));
    }

    pub fn transmitted(&self) -> Vec<(SopTarget, Vec<u8>)> {
        self.0.borrow().transmitted.clone()
    }

    pub fn last_transmitted(&self) -> Option<(SopTarget, Vec<u8>)> {
        self.0.borrow().transmitted.last().cloned()
    }

    pub fn hard_resets_sent(&self) -> usize {
        self.0.borrow().hard_resets_sent
    }
}

impl PortController for FakeDriver {
    fn get_cc(&mut self) -> Result<(CcVoltageState, CcVoltageState), DriverError> {
        Ok(self.0.borrow().cc)
    }

    fn set_cc(&mut self, pull: CcPull) -> Result<(), DriverError> {
        self.0.borrow_mut().pull = Some(pull);
        Ok(())
    }

    fn select_rp_value(&mut self, rp: RpValue) -> Result<(), DriverError> {
        self.0.borrow_mut().rp_value = Some(rp);
        Ok(())
    }

    fn set_cc_polarity(&mut self, polarity: CcPolarity) -> Result<(), DriverError> {
        self.0.borrow_mut().polarity = Some(polarity);
        Ok(())
    }

    fn set_vconn(&mut self, enable: bool) -> Result<(), DriverError> {
        self.0.borrow_mut().vconn = Some(enable);
        Ok(())
    }

    fn vconn_discharge(&mut self, _enable: bool) -> Result<(), DriverError> {
        Ok(())
    }

    fn set_rx_enable(&mut self, enable: bool) -> Result<(), DriverError> {
        self.0.borrow_mut().rx_enabled = enable;
        Ok(())
    }

    fn transmit(&mut self, target: SopTarget, data: &[u8]) -> Result<(), DriverError> {
        self.0.borrow_mut().transmitted.push((target, data.to_vec()));
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<Option<(SopTarget, usize)>, DriverError> {
        let mut state = self.0.borrow_mut();

        if !state.rx_enabled {
            return Ok(None);
        }

        let Some((sop, data)) = state.rx_queue.pop_front() else {
            return Ok(None);
        };

        buffer[..data.len()].copy_from_slice(&data);
        Ok(Some((sop, data.len())))
    }

    fn set_roles(&mut self, power_role: PowerRole, data_role: DataRole) -> Result<(), DriverError> {
        self.0.borrow_mut().roles = Some((power_role, data_role));
        Ok(())
    }

    fn transmit_hard_reset(&mut self) -> Result<(), DriverError> {
        self.0.borrow_mut().hard_resets_sent += 1;
        Ok(())
    }
}

/// A VBUS sensor that reports whatever the test set last.
#[derive(Clone)]
pub(crate) struct FakeVbus(pub Rc<Cell<bool>>);

impl FakeVbus {
    pub fn new(present: bool) -> Self {
        Self(Rc::new(Cell::new(present)))
    }

    pub fn set_present(&self, present: bool) {
        self.0.set(present);
    }
}

impl VbusSensor for FakeVbus {
    fn check_level(&mut self, level: VbusLevel) -> bool {
        match level {
            VbusLevel::Present => self.0.get(),
            VbusLevel::Safe0V => !self.0.get(),
        }
    }
}

/// Observable state of a [`FakeDpm`].
pub(crate) struct DpmState {
    pub events: Vec<Event>,
    pub transitions: Vec<PowerSourceRequest>,
    pub accept_requests: bool,
    pub sink_at_default: bool,
    pub supply_ready: bool,
}

impl Default for DpmState {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            transitions: Vec::new(),
            accept_requests: true,
            sink_at_default: true,
            supply_ready: true,
        }
    }
}

/// A device policy manager that records what the stack reports and answers
/// policy checks from a switch. Cloning yields another handle onto the same
/// state.
#[derive(Clone, Default)]
pub(crate) struct FakeDpm(pub Rc<RefCell<DpmState>>);

impl FakeDpm {
    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().events.clone()
    }

    pub fn count_events(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.0.borrow().events.iter().filter(|event| predicate(event)).count()
    }
}

impl DevicePolicyManager for FakeDpm {
    fn check(&mut self, _policy: Policy) -> bool {
        self.0.borrow().accept_requests
    }

    fn is_sink_at_default(&mut self) -> bool {
        self.0.borrow().sink_at_default
    }

    fn is_supply_ready(&mut self) -> bool {
        self.0.borrow().supply_ready
    }

    fn transition_power(&mut self, accepted: &PowerSourceRequest) {
        self.0.borrow_mut().transitions.push(*accepted);
    }

    fn notify(&mut self, event: Event) {
        self.0.borrow_mut().events.push(event);
    }
}
