//! A port ties the connection manager, the protocol layer and the policy
//! engine together and steps them from one cooperative loop.
//!
//! The loop owns the driver exclusively. Driver interrupts communicate through
//! the [`AlertSink`] in the shared [`PortControl`]; device requests arrive
//! through its queue. Either [`Port::run`] drives the loop, or the application
//! calls [`Port::run_step`] itself on a fixed cadence.

use core::marker::PhantomData;

use heapless::mpmc::Q4;
use usbc_traits::{AlertSink, PortController, RpValue, VbusSensor};

use crate::device_policy_manager::DevicePolicyManager;
use crate::policy_engine::{self, PolicyEngine};
use crate::protocol_layer::message::header::{Header, SpecificationRevision};
use crate::protocol_layer::message::rdo::PowerSourceRequest;
use crate::protocol_layer::ProtocolLayer;
use crate::timers::Clock;
use crate::type_c::{self, TypeC};
use crate::{DataRole, PowerRole};

/// Interval between state machine steps, in milliseconds.
pub const CYCLE_MILLIS: u64 = 5;

/// The role a port takes on the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortRole {
    /// Consume power (UFP by default).
    Sink,
    /// Provide power (DFP by default).
    Source,
}

/// Static configuration of a port.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// The role this port takes.
    pub role: PortRole,
    /// The current advertisement applied with the Rp termination.
    pub rp_value: RpValue,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: PortRole::Sink,
            rp_value: RpValue::UsbDefault,
        }
    }
}

/// Requests a device can make towards a running port.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    /// Leave `Disabled` and start connection detection.
    Start,
    /// Tear down any connection and disable the port.
    Suspend,
    /// Open the CC lines for a fixed interval, then restart detection.
    ErrorRecovery,
    /// Ask the partner for its source capabilities.
    GetSourceCapabilities,
    /// Negotiate a new power level.
    RequestPower(PowerSourceRequest),
    /// Swap the data role with the partner.
    DataRoleSwap,
}

/// Shared mailbox between a port's loop and the outside world.
///
/// Lives in a `static` (or any place outliving the port), so that a driver's
/// interrupt handler can raise alerts and device code can queue requests
/// without touching the port itself.
pub struct PortControl {
    /// Driver alerts, set from interrupt context.
    pub alerts: AlertSink,
    requests: Q4<Request>,
}

impl Default for PortControl {
    fn default() -> Self {
        Self::new()
    }
}

impl PortControl {
    /// Create an empty mailbox.
    pub const fn new() -> Self {
        Self {
            alerts: AlertSink::new(),
            requests: Q4::new(),
        }
    }

    /// Queue a request. Fails with the rejected request when the queue is full.
    pub fn request(&self, request: Request) -> Result<(), Request> {
        self.requests.enqueue(request)
    }

    /// Queue a start request.
    pub fn start(&self) {
        let _ = self.request(Request::Start);
    }

    /// Queue a suspend request.
    pub fn suspend(&self) {
        let _ = self.request(Request::Suspend);
    }
}

/// One Type-C/PD port.
pub struct Port<'a, DRV, VBUS, DPM, CLK> {
    pub(crate) driver: DRV,
    pub(crate) vbus: VBUS,
    pub(crate) dpm: DPM,
    pub(crate) control: &'a PortControl,
    pub(crate) config: Config,
    pub(crate) tc: TypeC,
    pub(crate) prl: ProtocolLayer,
    pub(crate) pe: PolicyEngine,
    pub(crate) power_role: PowerRole,
    pub(crate) data_role: DataRole,
    clock: PhantomData<CLK>,
}

impl<'a, DRV, VBUS, DPM, CLK> Port<'a, DRV, VBUS, DPM, CLK>
where
    DRV: PortController,
    VBUS: VbusSensor,
    DPM: DevicePolicyManager,
    CLK: Clock,
{
    /// Create a port in the `Disabled` state.
    pub fn new(driver: DRV, vbus: VBUS, dpm: DPM, control: &'a PortControl, config: Config) -> Self {
        let (power_role, data_role) = Self::default_roles(config.role);
        let template = Header::new_template(data_role, power_role, SpecificationRevision::R3_X);

        Self {
            driver,
            vbus,
            dpm,
            control,
            config,
            tc: TypeC::new(),
            prl: ProtocolLayer::new(template),
            pe: PolicyEngine::new(power_role),
            power_role,
            data_role,
            clock: PhantomData,
        }
    }

    fn default_roles(role: PortRole) -> (PowerRole, DataRole) {
        match role {
            PortRole::Sink => (PowerRole::Sink, DataRole::Ufp),
            PortRole::Source => (PowerRole::Source, DataRole::Dfp),
        }
    }

    /// The connection state of the port.
    pub fn state(&self) -> type_c::State {
        self.tc.state()
    }

    /// Whether a partner is attached.
    pub fn is_attached(&self) -> bool {
        self.tc.is_attached()
    }

    /// Whether the port has been started and is detecting or serving a
    /// connection.
    pub fn is_running(&self) -> bool {
        self.tc.state() != type_c::State::Disabled
    }

    /// Whether an explicit PD contract is in place.
    pub fn explicit_contract(&self) -> bool {
        self.pe.explicit_contract()
    }

    /// The current power role.
    pub fn power_role(&self) -> PowerRole {
        self.power_role
    }

    /// The current data role.
    pub fn data_role(&self) -> DataRole {
        self.data_role
    }

    /// Run the port forever, stepping every [`CYCLE_MILLIS`] unless a step
    /// asks for an immediate follow-up.
    pub async fn run(&mut self) -> ! {
        loop {
            if !self.run_step() {
                CLK::after_millis(CYCLE_MILLIS).await;
            }
        }
    }

    /// Step all state machines by one cycle.
    ///
    /// Alerts and requests are consumed first, so that a response to the PHY
    /// outcome is produced in the same cycle. The policy engine runs before
    /// the transmitter, making its reaction to a received message observable
    /// by the protocol layer within the cycle as well.
    ///
    /// Returns `true` when the next step should follow without the cycle
    /// delay.
    pub fn run_step(&mut self) -> bool {
        let alerts = self.control.alerts.drain();
        if alerts != 0 {
            self.prl_route_alerts(alerts);
        }

        if let Some(request) = self.control.requests.dequeue() {
            self.handle_request(request);
        }

        self.prl_rx_run();
        self.pe_run();
        self.prl_tx_run();
        self.prl_hr_run();
        self.tc_run();

        // A fresh connection state has entry actions pending.
        self.tc.entry_pending()
    }

    fn handle_request(&mut self, request: Request) {
        debug!("Port request: {:?}", request);

        match request {
            Request::Start => {
                if self.tc.state() == type_c::State::Disabled {
                    let next = self.tc_unattached_state();
                    self.tc.transition(next);
                }
            }
            Request::Suspend => {
                if self.tc.state() != type_c::State::Disabled {
                    self.pd_stop();
                    self.tc.transition(type_c::State::Disabled);
                }
            }
            Request::ErrorRecovery => {
                if self.tc.state() != type_c::State::Disabled {
                    self.pd_stop();
                    self.tc.transition(type_c::State::ErrorRecovery);
                }
            }
            Request::GetSourceCapabilities => {
                self.pe.flags.set(policy_engine::flag::GET_SOURCE_CAPABILITIES);
            }
            Request::RequestPower(request) => {
                self.pe.queue_power_request(request);
            }
            Request::DataRoleSwap => {
                self.pe.flags.set(policy_engine::flag::DATA_ROLE_SWAP);
            }
        }
    }

    /// Bring up PD communication after attach.
    pub(crate) fn pd_start(&mut self) {
        let (power_role, data_role) = Self::default_roles(self.config.role);
        self.power_role = power_role;
        self.data_role = data_role;

        self.prl.reset();
        self.prl.set_roles(power_role, data_role);

        let result = self
            .driver
            .set_roles(power_role, data_role)
            .and_then(|()| self.driver.set_rx_enable(true));
        if let Err(error) = result {
            warn!("Failed to enable PD communication: {:?}", error);
        }

        self.pe.start(power_role);
    }

    /// Tear down PD communication on detach or suspend.
    pub(crate) fn pd_stop(&mut self) {
        self.pe.stop();
        self.prl.suspend();

        if let Err(error) = self.driver.set_rx_enable(false) {
            warn!("Failed to disable PD communication: {:?}", error);
        }
    }
}
