//! Driver-facing traits for the usbc Type-C / USB PD port stack.
//!
//! A port-controller (TCPC/PHY) driver implements [`PortController`] and a
//! VBUS measurement source implements [`VbusSensor`]. Transmit completion and
//! partner-initiated hard resets are signalled asynchronously through an
//! [`AlertSink`] that is shared between the driver's interrupt context and
//! the port's scheduling loop.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

use core::sync::atomic::{AtomicU32, Ordering};

/// The power role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerRole {
    /// Provides power.
    Source,
    /// Consumes power.
    Sink,
}

impl From<bool> for PowerRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Sink,
            true => Self::Source,
        }
    }
}

impl From<PowerRole> for bool {
    fn from(role: PowerRole) -> bool {
        matches!(role, PowerRole::Source)
    }
}

/// The data role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataRole {
    /// Upstream-facing port.
    Ufp,
    /// Downstream-facing port.
    Dfp,
}

impl DataRole {
    /// The opposite data role.
    pub fn flipped(&self) -> Self {
        match self {
            Self::Ufp => Self::Dfp,
            Self::Dfp => Self::Ufp,
        }
    }
}

impl From<bool> for DataRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Ufp,
            true => Self::Dfp,
        }
    }
}

impl From<DataRole> for bool {
    fn from(role: DataRole) -> bool {
        matches!(role, DataRole::Dfp)
    }
}

/// Orientation of the connector, i.e. which CC line carries the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcPolarity {
    /// CC1 is the active line.
    Cc1,
    /// CC2 is the active line.
    Cc2,
}

/// Termination that the port applies to its CC lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcPull {
    /// No termination.
    Open,
    /// Pull-down (sink).
    Rd,
    /// Pull-up (source).
    Rp,
}

/// Current advertisement selected for the Rp pull-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RpValue {
    /// Default USB current.
    UsbDefault,
    /// 1.5 A advertisement. Doubles as SinkTxNG during collision avoidance.
    Rp1A5,
    /// 3.0 A advertisement. Doubles as SinkTxOk during collision avoidance.
    Rp3A0,
}

/// Voltage state sampled on a CC line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcVoltageState {
    /// No termination detected.
    Open,
    /// Ra detected (powered cable).
    Ra,
    /// Rd detected (attached sink).
    Rd,
    /// Partner Rp at default USB current.
    SnkDefault,
    /// Partner Rp at 1.5 A.
    Snk1_5,
    /// Partner Rp at 3.0 A.
    Snk3_0,
}

impl CcVoltageState {
    /// Whether the line shows a source's Rp advertisement.
    pub fn is_rp(&self) -> bool {
        matches!(self, Self::SnkDefault | Self::Snk1_5 | Self::Snk3_0)
    }

    /// Whether the line shows an attached sink's Rd.
    pub fn is_rd(&self) -> bool {
        matches!(self, Self::Rd)
    }
}

/// VBUS levels that can be queried from a [`VbusSensor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VbusLevel {
    /// VBUS is at a valid operating voltage.
    Present,
    /// VBUS has discharged to vSafe0V.
    Safe0V,
}

/// Start-of-packet addressing of a PD message.
///
/// Each variant carries its own message-ID counter and stored received ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SopTarget {
    /// Port partner.
    Sop,
    /// Cable plug nearest to the port.
    SopPrime,
    /// Cable plug farthest from the port.
    SopDoublePrime,
    /// Debug accessory, near end.
    SopDebugPrime,
    /// Debug accessory, far end.
    SopDebugDoublePrime,
}

impl SopTarget {
    /// Number of distinct packet types.
    pub const COUNT: usize = 5;

    /// Stable index for per-type counter storage.
    pub fn index(&self) -> usize {
        match self {
            Self::Sop => 0,
            Self::SopPrime => 1,
            Self::SopDoublePrime => 2,
            Self::SopDebugPrime => 3,
            Self::SopDebugDoublePrime => 4,
        }
    }
}

/// Errors reported synchronously by a port-controller driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverError {
    /// The controller is busy with a previous operation.
    Busy,
    /// Communication with the controller failed.
    Io,
}

/// Asynchronous events a driver delivers to the port's scheduling loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Alert {
    /// The port partner transmitted hard-reset signalling.
    HardResetReceived,
    /// The last queued transmission was acknowledged by the partner.
    TransmitSucceeded,
    /// The last queued transmission failed after PHY-level retries.
    TransmitFailed,
    /// The last queued transmission was superseded by incoming traffic.
    TransmitDiscarded,
}

impl Alert {
    /// The bit this alert occupies in the mailbox word.
    pub fn mask(self) -> u32 {
        1 << (self as u32)
    }
}

/// Lock-free single-writer mailbox for driver alerts.
///
/// The driver side only ever sets bits ([`AlertSink::raise`], usable from an
/// ISR); the port's loop test-and-clears them once per cycle. No other access
/// pattern is supported.
#[derive(Debug, Default)]
pub struct AlertSink {
    bits: AtomicU32,
}

impl AlertSink {
    /// Create an empty mailbox.
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Signal an alert. Callable from interrupt context.
    pub fn raise(&self, alert: Alert) {
        self.bits.fetch_or(alert.mask(), Ordering::Release);
    }

    /// Test and clear a single alert.
    pub fn take(&self, alert: Alert) -> bool {
        self.bits.fetch_and(!alert.mask(), Ordering::AcqRel) & alert.mask() != 0
    }

    /// Take all pending alerts at once, as a word of [`Alert::mask`] bits.
    pub fn drain(&self) -> u32 {
        self.bits.swap(0, Ordering::AcqRel)
    }

    /// Discard all pending alerts.
    pub fn clear(&self) {
        self.bits.store(0, Ordering::Release);
    }
}

/// Interface of a Type-C port controller (TCPC/PHY).
///
/// All methods are non-blocking. [`PortController::transmit`] only starts a
/// transmission; its outcome arrives later through the [`AlertSink`]. The
/// controller owns CRC handling and PHY-level retries.
pub trait PortController {
    /// Sample the voltage state of both CC lines, in (CC1, CC2) order.
    fn get_cc(&mut self) -> Result<(CcVoltageState, CcVoltageState), DriverError>;

    /// Apply a termination to the CC lines.
    fn set_cc(&mut self, pull: CcPull) -> Result<(), DriverError>;

    /// Select the current advertisement used when Rp is applied.
    fn select_rp_value(&mut self, rp: RpValue) -> Result<(), DriverError>;

    /// Inform the controller of the connector orientation.
    fn set_cc_polarity(&mut self, polarity: CcPolarity) -> Result<(), DriverError>;

    /// Enable or disable the VCONN supply.
    fn set_vconn(&mut self, enable: bool) -> Result<(), DriverError>;

    /// Enable or disable the VCONN discharge path.
    fn vconn_discharge(&mut self, enable: bool) -> Result<(), DriverError>;

    /// Enable or disable PD message reception.
    fn set_rx_enable(&mut self, enable: bool) -> Result<(), DriverError>;

    /// Start transmission of a raw PD packet to the given target.
    fn transmit(&mut self, target: SopTarget, data: &[u8]) -> Result<(), DriverError>;

    /// Fetch a pending received packet, if any.
    ///
    /// Writes the raw packet into `buffer` and reports its addressing and
    /// length.
    fn receive(&mut self, buffer: &mut [u8]) -> Result<Option<(SopTarget, usize)>, DriverError>;

    /// Inform the controller of the header roles to use for GoodCRC replies.
    fn set_roles(&mut self, power_role: PowerRole, data_role: DataRole) -> Result<(), DriverError>;

    /// Transmit hard-reset signalling.
    fn transmit_hard_reset(&mut self) -> Result<(), DriverError>;
}

/// Interface of a VBUS presence/level sensor.
pub trait VbusSensor {
    /// Check whether VBUS is at the queried level.
    fn check_level(&mut self, level: VbusLevel) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_sink_test_and_clear() {
        let sink = AlertSink::new();
        assert!(!sink.take(Alert::TransmitSucceeded));

        sink.raise(Alert::TransmitSucceeded);
        sink.raise(Alert::HardResetReceived);

        assert!(sink.take(Alert::TransmitSucceeded));
        assert!(!sink.take(Alert::TransmitSucceeded));
        assert!(sink.take(Alert::HardResetReceived));
    }

    #[test]
    fn sop_indices_are_distinct() {
        let targets = [
            SopTarget::Sop,
            SopTarget::SopPrime,
            SopTarget::SopDoublePrime,
            SopTarget::SopDebugPrime,
            SopTarget::SopDebugDoublePrime,
        ];

        for (n, target) in targets.iter().enumerate() {
            assert_eq!(target.index(), n);
        }
    }
}
