//! Bounded counters for message IDs and reset/retry budgets.

/// Errors that a counter can report.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The counter wrapped past its maximum value.
    Overrun,
}

/// Counter kinds with their specified maximum values.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterType {
    /// Source capability transmission attempts (nCapsCount).
    Caps,
    /// Hard reset attempts (nHardResetCount).
    HardReset,
    /// Rolling message ID, modulo 8.
    MessageId,
}

/// A saturating-free, wrapping counter with a fixed maximum.
///
/// [`Counter::increment`] wraps modulo `max + 1` and reports the wrap, which
/// doubles as the budget-exhausted signal for retry counters.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Counter {
    value: u8,
    max_value: u8,
}

impl Counter {
    /// Create a zeroed counter of the given type.
    pub fn new(counter_type: CounterType) -> Self {
        let max_value = match counter_type {
            CounterType::Caps => 50,
            CounterType::HardReset => 2,
            CounterType::MessageId => 7,
        };

        Self { value: 0, max_value }
    }

    /// Create a counter that starts from an arbitrary value.
    pub fn new_from_value(counter_type: CounterType, value: u8) -> Self {
        let mut counter = Self::new(counter_type);
        counter.set(value);
        counter
    }

    /// Set the counter, wrapping into the valid range.
    pub fn set(&mut self, value: u8) {
        self.value = value % (self.max_value + 1);
    }

    /// The current value.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Increment the counter, reporting a wrap as [`Error::Overrun`].
    pub fn increment(&mut self) -> Result<(), Error> {
        self.set(self.value + 1);

        if self.value == 0 { Err(Error::Overrun) } else { Ok(()) }
    }

    /// Reset the counter to zero.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}
