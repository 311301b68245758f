//! The timer service: named one-shot countdowns over a user-supplied clock.

use core::future::Future;

/// The time source to implement by the user application.
pub trait Clock {
    /// Milliseconds since an arbitrary epoch.
    fn now_millis() -> u64;

    /// Sleep for the specified number of milliseconds.
    ///
    /// Only used by the port's convenience scheduling loop
    /// ([`crate::port::Port::run`]); stepping the port manually never awaits.
    fn after_millis(milliseconds: u64) -> impl Future<Output = ()>;
}

/// Named deadlines with durations given by the PD and Type-C specifications.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerType {
    CcDebounce,
    ChunkingNotSupported,
    ErrorRecovery,
    HardResetComplete,
    PdDebounce,
    PsTransition,
    SenderResponse,
    SinkRequest,
    SinkTx,
    SinkWaitCap,
    SourceCapability,
    TxTimeout,
}

impl TimerType {
    /// The timeout duration in milliseconds.
    pub fn duration_millis(&self) -> u64 {
        match self {
            TimerType::CcDebounce => 150,
            TimerType::ChunkingNotSupported => 45,
            TimerType::ErrorRecovery => 240,
            TimerType::HardResetComplete => 5,
            TimerType::PdDebounce => 15,
            TimerType::PsTransition => 500,
            TimerType::SenderResponse => 30,
            TimerType::SinkRequest => 100,
            TimerType::SinkTx => 18,
            TimerType::SinkWaitCap => 465,
            TimerType::SourceCapability => 150,
            TimerType::TxTimeout => 100,
        }
    }
}

/// A one-shot countdown timer.
///
/// Expiry is level-triggered: once the deadline passes, [`Timer::is_expired`]
/// keeps reporting `true` until the timer is stopped or restarted.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timer {
    deadline: Option<u64>,
}

impl Timer {
    /// Create a stopped timer.
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    /// Start (or restart) the countdown for the given deadline type.
    pub fn start<C: Clock>(&mut self, timer_type: TimerType) {
        self.deadline = Some(C::now_millis() + timer_type.duration_millis());
    }

    /// Stop the timer, consuming a pending expiry.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// Whether the timer has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whether the deadline has passed.
    pub fn is_expired<C: Clock>(&self) -> bool {
        matches!(self.deadline, Some(deadline) if C::now_millis() >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::FakeClock;

    type TestClock = FakeClock<0>;

    #[test]
    fn expiry_is_level_triggered_until_stopped() {
        TestClock::reset();
        let mut timer = Timer::new();

        assert!(!timer.is_running());
        assert!(!timer.is_expired::<TestClock>());

        timer.start::<TestClock>(TimerType::PdDebounce);
        assert!(timer.is_running());
        assert!(!timer.is_expired::<TestClock>());

        TestClock::advance(TimerType::PdDebounce.duration_millis());
        assert!(timer.is_expired::<TestClock>());
        assert!(timer.is_expired::<TestClock>());

        timer.stop();
        assert!(!timer.is_running());
        assert!(!timer.is_expired::<TestClock>());
    }

    #[test]
    fn restart_moves_the_deadline() {
        TestClock::reset();
        let mut timer = Timer::new();

        timer.start::<TestClock>(TimerType::CcDebounce);
        TestClock::advance(100);
        timer.start::<TestClock>(TimerType::CcDebounce);
        TestClock::advance(100);

        assert!(!timer.is_expired::<TestClock>());
        TestClock::advance(50);
        assert!(timer.is_expired::<TestClock>());
    }
}
