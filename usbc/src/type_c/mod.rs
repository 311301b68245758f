//! The Type-C connection manager (TC) detects attach and detach and controls
//! the CC terminations.
//!
//! States are described by a constant table: each leaf state optionally
//! belongs to a super-state that applies the electrical termination on entry
//! and samples the CC lines while active.

use usbc_traits::{CcPolarity, CcPull, CcVoltageState, PortController, RpValue, VbusLevel, VbusSensor};

use crate::device_policy_manager::{DevicePolicyManager, Event};
use crate::port::{Port, PortRole};
use crate::timers::{Clock, Timer, TimerType};

/// Connection states of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Terminal until the device requests a start.
    Disabled,
    /// CC lines opened for a fixed interval after an internal failure.
    ErrorRecovery,
    /// Sink waiting for a source to present Rp.
    UnattachedSnk,
    /// Sink debouncing a sensed Rp.
    AttachWaitSnk,
    /// Sink attached; PD is running.
    AttachedSnk,
    /// Source waiting for a sink to present Rd.
    UnattachedSrc,
    /// Source debouncing a sensed Rd.
    AttachWaitSrc,
    /// Source attached; PD is running.
    AttachedSrc,
}

/// Super-states that own the CC termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum SuperState {
    /// No termination; the port is electrically invisible.
    CcOpen,
    /// Sink termination.
    CcRd,
    /// Source termination with the configured current advertisement.
    CcRp,
}

struct Descriptor {
    parent: Option<SuperState>,
}

/// One entry per [`State`], in declaration order.
const DESCRIPTORS: [Descriptor; 8] = [
    // Disabled
    Descriptor {
        parent: Some(SuperState::CcOpen),
    },
    // ErrorRecovery
    Descriptor {
        parent: Some(SuperState::CcOpen),
    },
    // UnattachedSnk
    Descriptor {
        parent: Some(SuperState::CcRd),
    },
    // AttachWaitSnk
    Descriptor {
        parent: Some(SuperState::CcRd),
    },
    // AttachedSnk
    Descriptor {
        parent: Some(SuperState::CcRd),
    },
    // UnattachedSrc
    Descriptor {
        parent: Some(SuperState::CcRp),
    },
    // AttachWaitSrc
    Descriptor {
        parent: Some(SuperState::CcRp),
    },
    // AttachedSrc
    Descriptor {
        parent: Some(SuperState::CcRp),
    },
];

impl State {
    fn parent(&self) -> Option<SuperState> {
        DESCRIPTORS[*self as usize].parent
    }
}

/// Type-C connection manager state for one port.
#[derive(Debug)]
pub struct TypeC {
    state: State,
    entered: bool,
    cc1: CcVoltageState,
    cc2: CcVoltageState,
    /// CC pair at the start of the running debounce interval.
    debounce_snapshot: (CcVoltageState, CcVoltageState),
    polarity: CcPolarity,
    debounce_timer: Timer,
    pd_debounce_timer: Timer,
    error_recovery_timer: Timer,
    /// Debounced Rp advertisement while sinking without a contract.
    sink_power: Option<RpValue>,
    sink_power_candidate: Option<RpValue>,
}

impl Default for TypeC {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeC {
    /// Create a manager in the `Disabled` state.
    pub fn new() -> Self {
        Self {
            state: State::Disabled,
            entered: false,
            cc1: CcVoltageState::Open,
            cc2: CcVoltageState::Open,
            debounce_snapshot: (CcVoltageState::Open, CcVoltageState::Open),
            polarity: CcPolarity::Cc1,
            debounce_timer: Timer::new(),
            pd_debounce_timer: Timer::new(),
            error_recovery_timer: Timer::new(),
            sink_power: None,
            sink_power_candidate: None,
        }
    }

    /// The current connection state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether a partner is attached.
    pub fn is_attached(&self) -> bool {
        matches!(self.state, State::AttachedSnk | State::AttachedSrc)
    }

    /// The connector orientation determined at attach.
    pub fn polarity(&self) -> CcPolarity {
        self.polarity
    }

    /// The last sampled CC state of the oriented (active) line.
    pub(crate) fn active_cc(&self) -> CcVoltageState {
        match self.polarity {
            CcPolarity::Cc1 => self.cc1,
            CcPolarity::Cc2 => self.cc2,
        }
    }

    /// Whether the current state still awaits its entry actions.
    pub(crate) fn entry_pending(&self) -> bool {
        !self.entered
    }

    pub(crate) fn transition(&mut self, state: State) {
        debug!("TC transition {:?} -> {:?}", self.state, state);
        self.state = state;
        self.entered = false;
    }

    fn cc_pair(&self) -> (CcVoltageState, CcVoltageState) {
        (self.cc1, self.cc2)
    }

    /// Classify the partner's Rp advertisement on the active line.
    fn classify_rp(&self) -> Option<RpValue> {
        match self.active_cc() {
            CcVoltageState::SnkDefault => Some(RpValue::UsbDefault),
            CcVoltageState::Snk1_5 => Some(RpValue::Rp1A5),
            CcVoltageState::Snk3_0 => Some(RpValue::Rp3A0),
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
    /// The unattached state matching the configured port role.
    pub(crate) fn tc_unattached_state(&self) -> State {
        match self.config.role {
            PortRole::Sink => State::UnattachedSnk,
            PortRole::Source => State::UnattachedSrc,
        }
    }

    /// Step the connection manager by one cycle.
    pub(crate) fn tc_run(&mut self) {
        if !self.tc.entered {
            self.tc_enter();
        }

        // Super-states with a termination sample the CC lines every cycle.
        if self.tc.state.parent() != Some(SuperState::CcOpen) {
            match self.driver.get_cc() {
                Ok((cc1, cc2)) => {
                    self.tc.cc1 = cc1;
                    self.tc.cc2 = cc2;
                }
                Err(error) => {
                    warn!("CC sampling failed: {:?}", error);
                    return;
                }
            }
        }

        match self.tc.state {
            State::Disabled => {}
            State::ErrorRecovery => {
                if self.tc.error_recovery_timer.is_expired::<CLK>() {
                    self.tc.error_recovery_timer.stop();
                    let next = self.tc_unattached_state();
                    self.tc.transition(next);
                }
            }
            State::UnattachedSnk => {
                if self.tc.cc1.is_rp() || self.tc.cc2.is_rp() {
                    self.tc.transition(State::AttachWaitSnk);
                }
            }
            State::AttachWaitSnk => self.tc_attach_wait_snk_run(),
            State::AttachedSnk => self.tc_attached_snk_run(),
            State::UnattachedSrc => {
                if self.tc.cc1.is_rd() || self.tc.cc2.is_rd() {
                    self.tc.transition(State::AttachWaitSrc);
                }
            }
            State::AttachWaitSrc => self.tc_attach_wait_src_run(),
            State::AttachedSrc => self.tc_attached_src_run(),
        }
    }

    /// Apply entry actions for the current state.
    fn tc_enter(&mut self) {
        let result = match self.tc.state.parent() {
            Some(SuperState::CcOpen) => self.driver.set_cc(CcPull::Open),
            Some(SuperState::CcRd) => self.driver.set_cc(CcPull::Rd),
            Some(SuperState::CcRp) => self
                .driver
                .select_rp_value(self.config.rp_value)
                .and_then(|()| self.driver.set_cc(CcPull::Rp)),
            None => Ok(()),
        };

        if let Err(error) = result {
            warn!("Failed to apply CC termination: {:?}", error);
        }

        match self.tc.state {
            State::Disabled => {
                self.tc.debounce_timer.stop();
                self.tc.pd_debounce_timer.stop();
            }
            State::ErrorRecovery => {
                self.tc.error_recovery_timer.start::<CLK>(TimerType::ErrorRecovery);
            }
            State::UnattachedSnk | State::UnattachedSrc => {
                self.tc.sink_power = None;
                self.tc.sink_power_candidate = None;
            }
            State::AttachWaitSnk | State::AttachWaitSrc => {
                self.tc.debounce_snapshot = self.tc.cc_pair();
                self.tc.debounce_timer.start::<CLK>(TimerType::CcDebounce);
            }
            State::AttachedSnk => self.tc_attached_snk_entry(),
            State::AttachedSrc => self.tc_attached_src_entry(),
        }

        self.tc.entered = true;
    }

    fn tc_attach_wait_snk_run(&mut self) {
        if !self.tc.cc1.is_rp() && !self.tc.cc2.is_rp() {
            self.tc.transition(State::UnattachedSnk);
            return;
        }

        // The same CC state must persist for the whole debounce interval.
        if self.tc.cc_pair() != self.tc.debounce_snapshot {
            self.tc.debounce_snapshot = self.tc.cc_pair();
            self.tc.debounce_timer.start::<CLK>(TimerType::CcDebounce);
            return;
        }

        if self.tc.debounce_timer.is_expired::<CLK>() && self.vbus.check_level(VbusLevel::Present) {
            self.tc.debounce_timer.stop();
            self.tc.transition(State::AttachedSnk);
        }
    }

    fn tc_attached_snk_entry(&mut self) {
        self.tc.polarity = if self.tc.cc1.is_rp() { CcPolarity::Cc1 } else { CcPolarity::Cc2 };
        info!("Attached as sink, polarity {:?}", self.tc.polarity);

        if let Err(error) = self.driver.set_cc_polarity(self.tc.polarity) {
            warn!("Failed to set CC polarity: {:?}", error);
        }

        self.pd_start();
    }

    fn tc_attached_snk_run(&mut self) {
        if !self.vbus.check_level(VbusLevel::Present) {
            info!("Sink detached, VBUS removed");
            self.pd_stop();
            self.tc.transition(State::UnattachedSnk);
            return;
        }

        // Without an explicit contract the power budget is whatever the
        // partner's Rp advertises; track it with its own debounce.
        if !self.pe.explicit_contract() {
            self.tc_sink_power_run();
        }
    }

    /// The sink-power sub-state machine.
    fn tc_sink_power_run(&mut self) {
        let candidate = self.tc.classify_rp();

        if candidate != self.tc.sink_power_candidate {
            self.tc.sink_power_candidate = candidate;
            self.tc.pd_debounce_timer.start::<CLK>(TimerType::PdDebounce);
            return;
        }

        if self.tc.pd_debounce_timer.is_running()
            && self.tc.pd_debounce_timer.is_expired::<CLK>()
            && candidate != self.tc.sink_power
        {
            self.tc.pd_debounce_timer.stop();
            self.tc.sink_power = candidate;

            // `None` reports the advertisement's disappearance (0 A).
            debug!("Implicit power budget changed: {:?}", candidate);
            self.dpm.notify(Event::PowerLevelChanged(candidate));
        }
    }

    fn tc_attach_wait_src_run(&mut self) {
        if !self.tc.cc1.is_rd() && !self.tc.cc2.is_rd() {
            self.tc.transition(State::UnattachedSrc);
            return;
        }

        if self.tc.cc_pair() != self.tc.debounce_snapshot {
            self.tc.debounce_snapshot = self.tc.cc_pair();
            self.tc.debounce_timer.start::<CLK>(TimerType::CcDebounce);
            return;
        }

        if self.tc.debounce_timer.is_expired::<CLK>() {
            self.tc.debounce_timer.stop();
            self.tc.transition(State::AttachedSrc);
        }
    }

    fn tc_attached_src_entry(&mut self) {
        self.tc.polarity = if self.tc.cc1.is_rd() { CcPolarity::Cc1 } else { CcPolarity::Cc2 };
        info!("Attached as source, polarity {:?}", self.tc.polarity);

        let result = self
            .driver
            .set_cc_polarity(self.tc.polarity)
            .and_then(|()| self.driver.vconn_discharge(false))
            .and_then(|()| self.driver.set_vconn(true));

        if let Err(error) = result {
            warn!("Failed to configure attach: {:?}", error);
        }

        self.pd_start();
    }

    fn tc_attached_src_run(&mut self) {
        if self.tc.active_cc().is_rd() {
            self.tc.pd_debounce_timer.stop();
            return;
        }

        // Rd removal needs the PD debounce before it counts as a detach.
        if !self.tc.pd_debounce_timer.is_running() {
            self.tc.pd_debounce_timer.start::<CLK>(TimerType::PdDebounce);
        } else if self.tc.pd_debounce_timer.is_expired::<CLK>() {
            self.tc.pd_debounce_timer.stop();
            info!("Source detached, Rd removed");

            let result = self
                .driver
                .set_vconn(false)
                .and_then(|()| self.driver.vconn_discharge(true));
            if let Err(error) = result {
                warn!("Failed to release VCONN: {:?}", error);
            }

            self.pd_stop();
            self.tc.transition(State::UnattachedSrc);
        }
    }
}
