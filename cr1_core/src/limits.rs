//! Limit switches and the homing cycle.
//!
//! Homing runs uncontrolled motion toward the switches: a staged
//! system-motion block per pass, with the per-axis lock mask cutting step
//! output the instant each switch trips. The multi-pass protocol is one
//! coarse approach, then alternating pull-off/locate passes at the fine
//! rate, ending pulled off the switches with machine zero re-established.
//!
//! The CR1 X gantry carries two independent switches (X1 outside the
//! interrupt port); `find_x_trip_delta` measures the signed step distance
//! between their trip points for the squaring routines.

use std::io::Write;

use cr1_common::axis::{axis_bit, N_AXIS, X_AXIS};
use cr1_common::codes::Alarm;
use cr1_common::consts::{
    DISTANCE_FIRST_PULLAWAY, HOMING_AXIS_LOCATE_SCALAR, HOMING_AXIS_SEARCH_SCALAR,
    N_HOMING_LOCATE_CYCLE,
};
use cr1_common::rt::RtEvent;
use cr1_common::settings::SettingsFlags;
use cr1_common::state::{MachineState, StepControl};
use cr1_hal::{Board, NvStorage};
use tracing::{debug, info};

use crate::machine::Machine;
use crate::planner::{Condition, PlanLineData};

/// First homing pass: Z alone, clearing the workspace.
pub const HOMING_CYCLE_0: u8 = 1 << 2;
/// Second homing pass: X and Y together.
pub const HOMING_CYCLE_1: u8 = (1 << 0) | (1 << 1);

impl<B: Board, N: NvStorage, W: Write> Machine<B, N, W> {
    /// Limit state as axis bits, invert mask applied. Bit set = tripped.
    pub fn limit_state(&self) -> u8 {
        let mut pins = self.board.limit_pins();
        if !self
            .settings
            .flags
            .contains(SettingsFlags::INVERT_LIMIT_PINS)
        {
            pins ^= cr1_common::axis::ALL_AXES_MASK;
        }
        pins
    }

    /// X1 gantry switch state, invert mask applied.
    pub fn limit_x1_state(&self) -> bool {
        let raw = self.board.limit_x1_pin();
        if self
            .settings
            .flags
            .contains(SettingsFlags::INVERT_LIMIT_PINS)
        {
            raw
        } else {
            !raw
        }
    }

    /// Poll for a hard-limit trip. Stands in for the pin-change interrupt:
    /// called from the executor tick whenever hard limits are armed.
    pub fn check_hard_limits(&mut self) {
        if !self.hard_limits_armed() {
            return;
        }
        if self.sys.state == MachineState::Alarm || self.rt.alarm().is_some() {
            return;
        }
        if self.limit_state() != 0 {
            info!("hard limit trip");
            self.mc_reset();
            self.rt.set_alarm(Alarm::HardLimit);
        }
    }

    /// Hard limits react only when enabled and not homing (homing drives
    /// into the switches on purpose).
    pub fn hard_limits_armed(&self) -> bool {
        self.settings
            .flags
            .contains(SettingsFlags::HARD_LIMIT_ENABLE)
            && self.sys.state != MachineState::Homing
    }

    /// Soft-limit check against the machine envelope. Called pre-buffer on
    /// every normal motion: on violation, force a controlled stop (position
    /// is not lost), then alarm.
    pub fn soft_limit_check(&mut self, target_mm: &[f32; N_AXIS]) {
        if !check_travel_limits(&self.settings.max_travel, target_mm) {
            return;
        }
        self.sys.soft_limit = true;
        if self.sys.state == MachineState::Cycle {
            self.rt.set_state(RtEvent::FEED_HOLD);
            loop {
                self.execute_realtime();
                if self.sys.abort {
                    return;
                }
                if self.sys.state == MachineState::Idle {
                    break;
                }
                self.run_stepper_ticks(64);
            }
        }
        self.mc_reset();
        self.rt.set_alarm(Alarm::SoftLimit);
        self.execute_realtime();
    }

    /// Home the axes in `cycle_mask`: coarse approach, debounced pull-off,
    /// then the locate passes, finishing with machine zero set so the whole
    /// work envelope is negative.
    pub fn home_axes(&mut self, cycle_mask: u8) {
        if self.sys.abort {
            return;
        }
        info!(mask = cycle_mask, "homing cycle");

        let mut pl_data = PlanLineData {
            condition: Condition::SYSTEM_MOTION | Condition::NO_FEED_OVERRIDE,
            ..PlanLineData::default()
        };

        // Search far enough that the switch must engage.
        let mut n_cycle = 2 * N_HOMING_LOCATE_CYCLE + 1;
        let mut max_travel: f32 = 0.0;
        for idx in 0..N_AXIS {
            if cycle_mask & axis_bit(idx) != 0 {
                max_travel =
                    max_travel.max(-HOMING_AXIS_SEARCH_SCALAR * self.settings.max_travel[idx]);
            }
        }

        let mut approach = true;
        let mut homing_rate = self.settings.homing_seek_rate;

        loop {
            // Plan the pass from wherever the last one ended.
            let mut target = self.settings.steps_to_mpos(&self.sys.position);
            let mut axislock: u8 = 0;
            let mut n_active_axis = 0u32;
            for idx in 0..N_AXIS {
                if cycle_mask & axis_bit(idx) != 0 {
                    n_active_axis += 1;
                    self.sys.position[idx] = 0;
                    let toward_switch = self.settings.homing_dir_mask & axis_bit(idx) != 0;
                    target[idx] = match (toward_switch, approach) {
                        (true, true) => -max_travel,
                        (true, false) => max_travel,
                        (false, true) => max_travel,
                        (false, false) => -max_travel,
                    };
                    axislock |= axis_bit(idx);
                }
            }
            // Scale so each axis individually moves at the homing rate.
            let pass_rate = homing_rate * (n_active_axis as f32).sqrt();
            self.sys.homing_axis_lock = axislock;

            pl_data.feed_rate = pass_rate;
            let position = self.sys.position;
            self.planner.buffer_line(
                &target,
                &pl_data,
                &self.settings,
                self.sys.overrides(),
                &mut self.stepper,
                &position,
            );

            self.sys.step_control = StepControl::EXECUTE_SYS_MOTION;
            self.stepper
                .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
            self.stepper.wake_up(&mut self.board);

            loop {
                if approach {
                    // Lock each axis the instant its switch trips.
                    let limit_state = self.limit_state();
                    for idx in 0..N_AXIS {
                        if axislock & axis_bit(idx) != 0 && limit_state & axis_bit(idx) != 0 {
                            axislock &= !axis_bit(idx);
                        }
                    }
                    self.sys.homing_axis_lock = axislock;
                }

                self.stepper
                    .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
                // One timer fire per poll keeps trip latching step-accurate.
                self.run_stepper_ticks(1);

                let rt_state = self.rt.state();
                if rt_state.intersects(RtEvent::RESET | RtEvent::CYCLE_STOP) {
                    if rt_state.contains(RtEvent::RESET) {
                        self.rt.set_alarm(Alarm::HomingFailReset);
                    }
                    if !approach && self.limit_state() & cycle_mask != 0 {
                        self.rt.set_alarm(Alarm::HomingFailPulloff);
                    }
                    if approach && rt_state.contains(RtEvent::CYCLE_STOP) {
                        self.rt.set_alarm(Alarm::HomingFailApproach);
                    }
                    if self.rt.alarm().is_some() {
                        self.mc_reset();
                        self.execute_realtime();
                        return;
                    }
                    // Pass complete.
                    self.rt.clear_state(RtEvent::CYCLE_STOP);
                    break;
                }

                if approach && axislock == 0 {
                    // Every active axis is parked on its switch.
                    break;
                }
            }

            // Kill the remainder of the staged motion and let transients
            // settle before reversing.
            self.stepper_reset();
            self.board.delay_ms(self.settings.homing_debounce_delay);

            approach = !approach;
            if approach {
                if n_cycle == 2 * N_HOMING_LOCATE_CYCLE {
                    // Second approach makes up the first pull-away.
                    max_travel = self.settings.homing_pulloff * HOMING_AXIS_LOCATE_SCALAR
                        + DISTANCE_FIRST_PULLAWAY;
                    homing_rate = self.settings.homing_seek_rate;
                } else {
                    // Locate approaches.
                    max_travel = self.settings.homing_pulloff * HOMING_AXIS_LOCATE_SCALAR;
                    homing_rate = self.settings.homing_feed_rate;
                }
            } else if n_cycle == 2 * N_HOMING_LOCATE_CYCLE + 1 {
                // First pull-away must fully clear the switches.
                max_travel = DISTANCE_FIRST_PULLAWAY;
                homing_rate = self.settings.homing_seek_rate;
            } else {
                max_travel = self.settings.homing_pulloff;
                homing_rate = self.settings.homing_seek_rate;
            }

            if n_cycle == 0 {
                break;
            }
            n_cycle -= 1;
        }

        // Pin machine zero: switches sit at max_travel (dir-mask axes) or
        // zero (the rest), pulled off by the stored distance.
        for idx in 0..N_AXIS {
            if cycle_mask & axis_bit(idx) != 0 {
                let set_position = if self.settings.homing_dir_mask & axis_bit(idx) != 0 {
                    (self.settings.max_travel[idx] + self.settings.homing_pulloff)
                        * self.settings.steps_per_mm[idx]
                } else {
                    -self.settings.homing_pulloff * self.settings.steps_per_mm[idx]
                };
                self.sys.position[idx] = set_position.round() as i32;
            }
        }
        self.sys.step_control = StepControl::empty();
        debug!(position = ?self.sys.position, "homing pass complete");
    }

    /// Measure the signed step delta between the X1 and X2 trip points by
    /// driving the gantry off, onto, and back off the switches.
    pub fn find_x_trip_delta(&mut self) -> i32 {
        if self.sys.abort {
            return 0;
        }

        let mut pl_data = PlanLineData {
            condition: Condition::SYSTEM_MOTION | Condition::NO_FEED_OVERRIDE,
            ..PlanLineData::default()
        };
        let toward_switch = self.settings.homing_dir_mask & axis_bit(X_AXIS) != 0;

        // Phase 1: pull away until both switches are clear.
        self.sys.position[X_AXIS] = 0;
        let mut target = self.settings.steps_to_mpos(&self.sys.position);
        target[X_AXIS] = if toward_switch {
            DISTANCE_FIRST_PULLAWAY
        } else {
            -DISTANCE_FIRST_PULLAWAY
        };
        self.sys.homing_axis_lock = axis_bit(X_AXIS);
        pl_data.feed_rate = self.settings.homing_seek_rate;
        if !self.run_gantry_phase(&target, &pl_data, |m| {
            !m.limit_x1_state() && m.limit_state() & axis_bit(X_AXIS) == 0
        }) {
            return 0;
        }

        // Phase 2: drive toward the switches, latching each trip position.
        self.sys.position[X_AXIS] = 0;
        let mut target = self.settings.steps_to_mpos(&self.sys.position);
        let search = -HOMING_AXIS_SEARCH_SCALAR * self.settings.max_travel[X_AXIS];
        target[X_AXIS] = if toward_switch { -search } else { search };
        self.sys.homing_axis_lock = axis_bit(X_AXIS);
        pl_data.feed_rate = self.settings.homing_feed_rate;

        let mut trip_position_x1: Option<i32> = None;
        let mut trip_position_x2: Option<i32> = None;
        let both_tripped = {
            let position = self.sys.position;
            self.planner.buffer_line(
                &target,
                &pl_data,
                &self.settings,
                self.sys.overrides(),
                &mut self.stepper,
                &position,
            );
            self.sys.step_control = StepControl::EXECUTE_SYS_MOTION;
            self.stepper
                .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
            self.stepper.wake_up(&mut self.board);
            loop {
                if trip_position_x1.is_none() && self.limit_x1_state() {
                    trip_position_x1 = Some(self.sys.position[X_AXIS]);
                }
                if trip_position_x2.is_none() && self.limit_state() & axis_bit(X_AXIS) != 0 {
                    trip_position_x2 = Some(self.sys.position[X_AXIS]);
                }
                if trip_position_x1.is_some() && trip_position_x2.is_some() {
                    break true;
                }
                self.stepper
                    .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
                self.run_stepper_ticks(1);
                if self
                    .rt
                    .state()
                    .intersects(RtEvent::RESET | RtEvent::CYCLE_STOP)
                {
                    // Travel exhausted before both switches engaged.
                    break false;
                }
            }
        };
        self.stepper_reset();
        self.board.delay_ms(self.settings.homing_debounce_delay);
        if !both_tripped {
            self.rt.set_alarm(Alarm::HomingFailApproach);
            self.mc_reset();
            self.execute_realtime();
            return 0;
        }

        // Phase 3: pull away again so the squaring move cannot re-trip.
        self.sys.position[X_AXIS] = 0;
        let mut target = self.settings.steps_to_mpos(&self.sys.position);
        target[X_AXIS] = if toward_switch {
            DISTANCE_FIRST_PULLAWAY
        } else {
            -DISTANCE_FIRST_PULLAWAY
        };
        pl_data.feed_rate = self.settings.homing_seek_rate;
        self.run_gantry_phase(&target, &pl_data, |_| false);

        self.sys.step_control = StepControl::empty();
        let delta =
            trip_position_x1.unwrap_or_default() - trip_position_x2.unwrap_or_default();
        info!(delta, "gantry trip delta measured");
        delta
    }

    /// Execute one staged X-gantry motion until `done` holds or the motion
    /// runs out. Returns false when the pass was aborted by reset, or the
    /// motion completed with `done` still false while a stop condition was
    /// required.
    fn run_gantry_phase(
        &mut self,
        target: &[f32; N_AXIS],
        pl_data: &PlanLineData,
        done: impl Fn(&Self) -> bool,
    ) -> bool {
        let position = self.sys.position;
        self.planner.buffer_line(
            target,
            pl_data,
            &self.settings,
            self.sys.overrides(),
            &mut self.stepper,
            &position,
        );
        self.sys.step_control = StepControl::EXECUTE_SYS_MOTION;
        self.stepper
            .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
        self.stepper.wake_up(&mut self.board);

        let mut satisfied = false;
        loop {
            if done(self) {
                satisfied = true;
                break;
            }
            self.stepper
                .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
            self.run_stepper_ticks(1);
            let rt_state = self.rt.state();
            if rt_state.contains(RtEvent::RESET) {
                break;
            }
            if rt_state.contains(RtEvent::CYCLE_STOP) {
                self.rt.clear_state(RtEvent::CYCLE_STOP);
                // Motion exhausted; condition may legitimately hold now.
                satisfied = done(self);
                break;
            }
        }
        self.stepper_reset();
        self.board.delay_ms(self.settings.homing_debounce_delay);
        satisfied
    }
}

/// True when any target coordinate leaves the all-negative work envelope.
pub fn check_travel_limits(max_travel: &[f32; N_AXIS], target_mm: &[f32; N_AXIS]) -> bool {
    for idx in 0..N_AXIS {
        if target_mm[idx] > 0.0 || target_mm[idx] < max_travel[idx] {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn travel_limits_reject_positive_and_beyond() {
        let max_travel = [-86.5f32, -241.5, -78.5];
        assert!(!check_travel_limits(&max_travel, &[-10.0, -10.0, -10.0]));
        assert!(check_travel_limits(&max_travel, &[0.1, -10.0, -10.0]));
        assert!(check_travel_limits(&max_travel, &[-90.0, -10.0, -10.0]));
        assert!(check_travel_limits(&max_travel, &[-10.0, -10.0, -80.0]));
        // The envelope boundary itself is legal.
        assert!(!check_travel_limits(&max_travel, &[0.0, 0.0, 0.0]));
        assert!(!check_travel_limits(&max_travel, &[-86.5, -241.5, -78.5]));
    }

    #[test]
    fn homing_schedule_covers_all_axes() {
        assert_eq!(HOMING_CYCLE_0 | HOMING_CYCLE_1, 0b111);
        assert_eq!(HOMING_CYCLE_0 & HOMING_CYCLE_1, 0);
    }
}
