//! Per-state-machine event flags.
//!
//! Each state machine object owns one small bitset. Bits are set when an
//! event is routed to the machine and read with test-and-clear semantics
//! from the scheduling loop. Cross-context traffic never touches these
//! directly; asynchronous driver events arrive through the
//! [`usbc_traits::AlertSink`] and are drained into these bitsets once per
//! cycle, so no atomics are needed here.

/// A fixed-size bitset of event flags.
#[derive(Debug, Default, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Flags(u16);

impl Flags {
    /// Create an empty bitset.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Set a flag.
    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    /// Clear a flag without reading it.
    pub fn clear(&mut self, flag: u16) {
        self.0 &= !flag;
    }

    /// Whether a flag is set, without clearing it.
    pub fn test(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    /// Consume a flag: report whether it was set, then clear it.
    pub fn test_and_clear(&mut self, flag: u16) -> bool {
        let was_set = self.test(flag);
        self.clear(flag);
        was_set
    }

    /// Clear the whole bitset.
    pub fn clear_all(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::Flags;

    const FLAG_A: u16 = 1 << 0;
    const FLAG_B: u16 = 1 << 5;

    #[test]
    fn test_and_clear_consumes() {
        let mut flags = Flags::new();

        flags.set(FLAG_A);
        flags.set(FLAG_B);

        assert!(flags.test(FLAG_A));
        assert!(flags.test_and_clear(FLAG_A));
        assert!(!flags.test_and_clear(FLAG_A));
        assert!(flags.test(FLAG_B));

        flags.clear_all();
        assert!(!flags.test(FLAG_B));
    }
}
