//! Electrical quantities and the PD-specific units they are encoded in.

/// Electric current with `u32` storage.
pub type ElectricCurrent = uom::si::u32::ElectricCurrent;
/// Electric potential with `u32` storage.
pub type ElectricPotential = uom::si::u32::ElectricPotential;
/// Power with `u32` storage.
pub type Power = uom::si::u32::Power;

/// Multiples of 50 mV, as used by fixed supply PDOs.
pub mod _50millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_50millivolts: 0.05; "50 mV", "multiple of 50 millivolts", "multiples of 50 millivolts";
    }
}

/// Multiples of 20 mV, as used by programmable supply requests.
pub mod _20millivolts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_potential;

        @_20millivolts: 0.02; "20 mV", "multiple of 20 millivolts", "multiples of 20 millivolts";
    }
}

/// Multiples of 50 mA, as used by programmable supply PDOs.
pub mod _50milliamperes_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::electric_current;

        @_50milliamperes: 0.05; "50 mA", "multiple of 50 milliamperes", "multiples of 50 milliamperes";
    }
}

/// Multiples of 250 mW, as used by battery PDOs.
pub mod _250milliwatts_mod {
    unit! {
        system: uom::si;
        quantity: uom::si::power;

        @_250milliwatts: 0.25; "250 mW", "multiple of 250 milliwatts", "multiples of 250 milliwatts";
    }
}
