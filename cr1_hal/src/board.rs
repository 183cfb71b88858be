//! The board capability.
//!
//! One trait gathers every pin the core touches. Bit positions in the step,
//! direction, and limit bytes follow the axis indexing of `cr1_common::axis`
//! (bit 0 = X, bit 1 = Y, bit 2 = Z); polarity inversion is applied by the
//! caller from the stored settings, so implementations report raw levels.

/// Pin-level access to the machine electronics.
pub trait Board {
    /// Drive the direction port, then emit one step pulse on each set bit.
    ///
    /// Direction bit set means travel toward negative machine space. Called
    /// from the step-timer tick at up to the maximum step rate; keep it
    /// cheap.
    fn step_pulse(&mut self, step_bits: u8, dir_bits: u8);

    /// Energize or release the stepper drivers.
    fn set_stepper_enable(&mut self, enable: bool);

    /// Raw limit port levels, one bit per axis, true = pin high.
    fn limit_pins(&self) -> u8;

    /// Raw level of the auxiliary X1 gantry switch. The CR1 X axis carries
    /// two independent switches; this is the one outside the interrupt port.
    fn limit_x1_pin(&self) -> bool;

    /// Whether the dual-switch X gantry hardware is fitted. Targets without
    /// it no-op the squaring routines.
    fn gantry_switch_fitted(&self) -> bool {
        false
    }

    /// Raw probe pin level.
    fn probe_pin(&self) -> bool;

    /// Spindle PWM duty register, 0 disables the PWM output entirely.
    fn set_spindle_pwm(&mut self, duty: u8);

    /// Spindle rotation direction, true = counter-clockwise.
    fn set_spindle_direction(&mut self, ccw: bool);

    /// Latch the hall-sensor disable that keeps PWM noise from creeping the
    /// stopped spindle.
    fn set_spindle_hall_disable(&mut self, disable: bool);

    /// Stepper power level output, `b'0'..=b'9'`.
    fn set_power_level(&mut self, level: u8);

    /// Block for the given number of milliseconds.
    fn delay_ms(&mut self, ms: u16);
}
