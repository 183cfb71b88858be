//! Spindle control: RPM to PWM mapping, on/off/direction, and the sync point
//! with the planner.
//!
//! The drive electronics expect a direction-pin edge before every state
//! change, a PWM duty proportional to RPM inside the configured band, and
//! the hall-disable latch held while stopped so PWM noise cannot creep the
//! spindle at low duty values.

use std::io::Write;

use cr1_common::consts::{
    SPINDLE_PWM_MAX_VALUE, SPINDLE_PWM_MIN_VALUE, SPINDLE_PWM_OFF_VALUE,
};
use cr1_common::settings::Settings;
use cr1_common::state::MachineState;
use cr1_hal::{Board, NvStorage};

use crate::machine::Machine;
use crate::planner::Condition;

/// Commanded spindle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpindleState {
    #[default]
    Disable,
    Cw,
    Ccw,
}

impl SpindleState {
    /// Condition flags for a plan block carrying this state.
    pub fn condition(self) -> Condition {
        match self {
            Self::Disable => Condition::empty(),
            Self::Cw => Condition::SPINDLE_CW,
            Self::Ccw => Condition::SPINDLE_CCW,
        }
    }

    pub fn from_condition(condition: Condition) -> Self {
        if condition.contains(Condition::SPINDLE_CW) {
            Self::Cw
        } else if condition.contains(Condition::SPINDLE_CCW) {
            Self::Ccw
        } else {
            Self::Disable
        }
    }
}

/// Last state written to the drive, for reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpindleShadow {
    pub state: SpindleState,
}

/// Map RPM to a PWM duty under the speed override, clamped to the
/// configured band. Returns the duty and the RPM actually obtained.
pub fn compute_pwm_value(settings: &Settings, rpm: f32, speed_ovr: u8) -> (u8, f32) {
    let rpm = rpm * (0.01 * speed_ovr as f32);
    if settings.rpm_min >= settings.rpm_max || rpm >= settings.rpm_max {
        // No usable band: run flat out.
        (SPINDLE_PWM_MAX_VALUE, settings.rpm_max)
    } else if rpm <= settings.rpm_min {
        if rpm == 0.0 {
            (SPINDLE_PWM_OFF_VALUE, 0.0)
        } else {
            (SPINDLE_PWM_MIN_VALUE, settings.rpm_min)
        }
    } else {
        let gradient = (SPINDLE_PWM_MAX_VALUE - SPINDLE_PWM_MIN_VALUE) as f32
            / (settings.rpm_max - settings.rpm_min);
        let pwm = ((rpm - settings.rpm_min) * gradient).floor() as u8 + SPINDLE_PWM_MIN_VALUE;
        (pwm, rpm)
    }
}

impl<B: Board, N: NvStorage, W: Write> Machine<B, N, W> {
    /// De-energize the spindle and latch the hall disable.
    pub fn spindle_stop(&mut self) {
        // Direction-pin edge signals the drive before the state change.
        self.board.set_spindle_direction(true);
        self.board.set_spindle_direction(false);
        self.board.set_spindle_pwm(SPINDLE_PWM_OFF_VALUE);
        self.board.set_spindle_hall_disable(true);
        self.spindle.state = SpindleState::Disable;
    }

    /// Write a PWM duty, releasing the hall latch.
    pub fn spindle_set_speed(&mut self, pwm: u8) {
        self.board.set_spindle_hall_disable(false);
        self.board.set_spindle_pwm(pwm);
    }

    /// Immediately set spindle running state, direction, and speed.
    pub fn spindle_set_state(&mut self, state: SpindleState, rpm: f32) {
        if self.sys.abort {
            return;
        }
        self.board.set_spindle_direction(true);
        self.board.set_spindle_direction(false);

        match state {
            SpindleState::Disable => {
                self.sys.spindle_speed = 0.0;
                self.spindle_stop();
            }
            SpindleState::Cw | SpindleState::Ccw => {
                self.board.set_spindle_direction(state == SpindleState::Ccw);
                let (pwm, actual) =
                    compute_pwm_value(&self.settings, rpm, self.sys.spindle_speed_ovr);
                self.sys.spindle_speed = actual;
                self.spindle_set_speed(pwm);
                self.spindle.state = state;
            }
        }
        // Report the change on the next status poll.
        self.sys.report_ovr_counter = 0;
    }

    /// Planner-synchronized state change: the programmed spindle state takes
    /// effect exactly between motions.
    pub fn spindle_sync(&mut self, state: SpindleState, rpm: f32) {
        if self.sys.state == MachineState::CheckMode {
            return;
        }
        self.buffer_synchronize();
        self.spindle_set_state(state, rpm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwm_off_at_zero_rpm() {
        let s = Settings::default();
        assert_eq!(compute_pwm_value(&s, 0.0, 100), (SPINDLE_PWM_OFF_VALUE, 0.0));
    }

    #[test]
    fn pwm_clamps_to_band() {
        let s = Settings::default();
        let (pwm, rpm) = compute_pwm_value(&s, 100_000.0, 100);
        assert_eq!(pwm, SPINDLE_PWM_MAX_VALUE);
        assert_eq!(rpm, s.rpm_max);
        let (pwm, rpm) = compute_pwm_value(&s, 1.0, 100);
        assert_eq!(pwm, SPINDLE_PWM_MIN_VALUE);
        assert_eq!(rpm, s.rpm_min);
    }

    #[test]
    fn pwm_scales_linearly_inside_band() {
        let s = Settings::default();
        let mid = 0.5 * (s.rpm_min + s.rpm_max);
        let (pwm, rpm) = compute_pwm_value(&s, mid, 100);
        assert_eq!(rpm, mid);
        let expected = ((mid - s.rpm_min)
            * ((SPINDLE_PWM_MAX_VALUE - SPINDLE_PWM_MIN_VALUE) as f32
                / (s.rpm_max - s.rpm_min)))
            .floor() as u8
            + SPINDLE_PWM_MIN_VALUE;
        assert_eq!(pwm, expected);
    }

    #[test]
    fn override_scales_rpm() {
        let s = Settings::default();
        let rpm = 4000.0;
        let (_, at_100) = compute_pwm_value(&s, rpm, 100);
        let (_, at_150) = compute_pwm_value(&s, rpm, 150);
        assert_eq!(at_100, 4000.0);
        assert_eq!(at_150, 6000.0);
    }
}
