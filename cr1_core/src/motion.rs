//! Motion control policy layer.
//!
//! Thin coordination between the parser-facing operations and the
//! planner/stepper pipeline: soft-limit gating, arc linearization, dwells,
//! homing entry, the gantry squaring routines, and the universal reset.

use std::f32::consts::PI;
use std::io::Write;

use cr1_common::axis::{axis_bit, N_AXIS, X_AXIS, Z_AXIS};
use cr1_common::codes::Alarm;
use cr1_common::consts::{ARC_ANGULAR_TRAVEL_EPSILON, DWELL_TIME_STEP_MS, N_ARC_CORRECTION};
use cr1_common::rt::RtEvent;
use cr1_common::settings::SettingsFlags;
use cr1_common::state::{MachineState, StepControl};
use cr1_hal::{Board, NvStorage};
use tracing::info;

use crate::limits::{HOMING_CYCLE_0, HOMING_CYCLE_1};
use crate::machine::Machine;
use crate::planner::{Condition, PlanLineData};

/// Gantry squaring stops iterating below this residual [steps].
const SQUARING_TOLERANCE_STEPS: i32 = 2;

impl<B: Board, N: NvStorage, W: Write> Machine<B, N, W> {
    /// Buffer a straight motion to `target` (machine mm), blocking while the
    /// planner ring is full. The soft-limit check runs first; jog motions
    /// pre-validate their own targets.
    pub fn mc_line(&mut self, target: &[f32; N_AXIS], pl_data: &PlanLineData) {
        if self
            .settings
            .flags
            .contains(SettingsFlags::SOFT_LIMIT_ENABLE)
            && self.sys.state != MachineState::Jog
        {
            self.soft_limit_check(target);
        }

        if self.sys.state == MachineState::CheckMode {
            return;
        }

        // Block until a slot frees. Auto-start keeps the queue draining, and
        // the tick pump stands in for the hardware step interrupt.
        loop {
            self.execute_realtime();
            if self.sys.abort {
                return;
            }
            if self.planner.is_full() {
                self.auto_cycle_start();
                self.run_stepper_ticks(256);
            } else {
                break;
            }
        }

        let position = self.sys.position;
        self.planner.buffer_line(
            target,
            pl_data,
            &self.settings,
            self.sys.overrides(),
            &mut self.stepper,
            &position,
        );
    }

    /// Linearize an XY-plane arc into line segments within the configured
    /// chordal tolerance. `position` is the current motion position and is
    /// updated in place; `offset` is the IJ center offset.
    #[allow(clippy::too_many_arguments)]
    pub fn mc_arc(
        &mut self,
        target: &[f32; N_AXIS],
        pl_data: &mut PlanLineData,
        position: &mut [f32; N_AXIS],
        offset: &[f32; 2],
        radius: f32,
        is_clockwise: bool,
    ) {
        let center_0 = position[0] + offset[0];
        let center_1 = position[1] + offset[1];
        let mut r_axis0 = -offset[0];
        let mut r_axis1 = -offset[1];
        let rt_axis0 = target[0] - center_0;
        let rt_axis1 = target[1] - center_1;

        // CCW angle between position and target from the circle center.
        let mut angular_travel =
            (r_axis0 * rt_axis1 - r_axis1 * rt_axis0).atan2(r_axis0 * rt_axis0 + r_axis1 * rt_axis1);
        if is_clockwise {
            if angular_travel >= -ARC_ANGULAR_TRAVEL_EPSILON {
                angular_travel -= 2.0 * PI;
            }
        } else if angular_travel <= ARC_ANGULAR_TRAVEL_EPSILON {
            angular_travel += 2.0 * PI;
        }

        let segments = ((0.5 * angular_travel.abs() * radius)
            / (self.settings.arc_tolerance * (2.0 * radius - self.settings.arc_tolerance)).sqrt())
        .floor() as u32;

        if segments > 0 {
            // Inverse-time feed covers the whole arc; spread it over the
            // generated segments.
            if pl_data.condition.contains(Condition::INVERSE_TIME) {
                pl_data.feed_rate *= segments as f32;
                pl_data.condition.remove(Condition::INVERSE_TIME);
            }

            let theta_per_segment = angular_travel / segments as f32;
            let linear_per_segment = (target[Z_AXIS] - position[Z_AXIS]) / segments as f32;

            // Small-angle rotation, with an exact correction every
            // N_ARC_CORRECTION increments to cancel drift.
            let mut cos_t = 2.0 - theta_per_segment * theta_per_segment;
            let sin_t = theta_per_segment * (1.0 / 6.0) * (cos_t + 4.0);
            cos_t *= 0.5;

            let mut count: u8 = 0;
            for i in 1..segments {
                if count < N_ARC_CORRECTION {
                    let r_axisi = r_axis0 * sin_t + r_axis1 * cos_t;
                    r_axis0 = r_axis0 * cos_t - r_axis1 * sin_t;
                    r_axis1 = r_axisi;
                    count += 1;
                } else {
                    let angle = i as f32 * theta_per_segment;
                    let (sin_ti, cos_ti) = angle.sin_cos();
                    r_axis0 = -offset[0] * cos_ti + offset[1] * sin_ti;
                    r_axis1 = -offset[0] * sin_ti - offset[1] * cos_ti;
                    count = 0;
                }

                position[0] = center_0 + r_axis0;
                position[1] = center_1 + r_axis1;
                position[Z_AXIS] += linear_per_segment;
                let waypoint = *position;
                self.mc_line(&waypoint, pl_data);
                if self.sys.abort {
                    return;
                }
            }
        }
        // Land exactly on the programmed target.
        self.mc_line(target, pl_data);
    }

    /// Planner-synchronized pause.
    pub fn mc_dwell(&mut self, seconds: f32) {
        if self.sys.state == MachineState::CheckMode {
            return;
        }
        self.buffer_synchronize();
        let mut remaining_ms = (seconds * 1000.0).ceil() as u32;
        while remaining_ms > 0 {
            self.execute_realtime();
            if self.sys.abort {
                return;
            }
            let step = remaining_ms.min(DWELL_TIME_STEP_MS as u32) as u16;
            self.board.delay_ms(step);
            remaining_ms -= step as u32;
        }
    }

    /// Run the homing schedule: the named axes, or the full Z-then-XY
    /// sequence when `cycle_mask` is zero. Syncs the parser and planner to
    /// the re-established machine position on success.
    pub fn mc_homing_cycle(&mut self, cycle_mask: u8) {
        if cycle_mask != 0 {
            self.home_axes(cycle_mask);
        } else {
            self.home_axes(HOMING_CYCLE_0);
            self.home_axes(HOMING_CYCLE_1);
        }

        self.execute_realtime();
        if self.sys.abort {
            return;
        }

        self.gc.sync_position(&self.settings, &self.sys.position);
        self.planner.sync_position(&self.sys.position);
    }

    /// Measure the gantry rack and store it as the squareness datum.
    pub fn mc_x_is_level(&mut self) {
        if !self.board.gantry_switch_fitted() {
            self.report.feedback("squaring hardware not fitted");
            return;
        }
        let delta = self.find_x_trip_delta();
        if self.sys.abort {
            return;
        }
        self.store_x_level_datum(delta as i16);
        self.report.feedback_fmt(format_args!("level datum {delta} steps"));
    }

    /// One squaring iteration: measure the rack against the stored datum and
    /// push the gantry toward the stops to take the error out. `$L` runs
    /// this to convergence.
    pub fn mc_autolevel_x(&mut self) {
        if !self.board.gantry_switch_fitted() {
            self.report.feedback("squaring hardware not fitted");
            return;
        }
        let datum = self.read_x_level_datum() as i32;
        let measured = self.find_x_trip_delta();
        if self.sys.abort {
            return;
        }
        let error_steps = measured - datum;
        info!(measured, datum, error_steps, "gantry squareness");
        if error_steps.abs() <= SQUARING_TOLERANCE_STEPS {
            return;
        }

        // Differential move: drive into the switch direction far enough that
        // the leading side stalls on its stop while the lagging side makes
        // up the error, then pull clear.
        let toward_switch = self.settings.homing_dir_mask & axis_bit(X_AXIS) != 0;
        let push_mm = error_steps.unsigned_abs() as f32 / self.settings.steps_per_mm[X_AXIS];
        let pl_data = PlanLineData {
            condition: Condition::SYSTEM_MOTION | Condition::NO_FEED_OVERRIDE,
            feed_rate: self.settings.homing_feed_rate,
            ..PlanLineData::default()
        };

        self.sys.position[X_AXIS] = 0;
        let mut target = self.settings.steps_to_mpos(&self.sys.position);
        target[X_AXIS] = if toward_switch { -push_mm } else { push_mm };
        self.sys.homing_axis_lock = axis_bit(X_AXIS);
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
            self.stepper
                .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
            self.run_stepper_ticks(64);
            let rt_state = self.rt.state();
            if rt_state.contains(RtEvent::RESET) {
                return;
            }
            if rt_state.contains(RtEvent::CYCLE_STOP) {
                self.rt.clear_state(RtEvent::CYCLE_STOP);
                break;
            }
        }
        self.stepper_reset();
        self.board.delay_ms(self.settings.homing_debounce_delay);
        self.sys.step_control = StepControl::empty();
    }

    /// The universal cancellation primitive: request reset, de-energize the
    /// spindle, and force-kill the steppers, alarming if motion was live
    /// (position can no longer be trusted).
    pub fn mc_reset(&mut self) {
        if self.rt.state().contains(RtEvent::RESET) {
            return;
        }
        self.rt.set_state(RtEvent::RESET);
        self.spindle_stop();

        if self.sys.state.is_motion()
            || self
                .sys
                .step_control
                .intersects(StepControl::EXECUTE_HOLD | StepControl::EXECUTE_SYS_MOTION)
        {
            if self.sys.state == MachineState::Homing {
                if self.rt.alarm().is_none() {
                    self.rt.set_alarm(Alarm::HomingFailReset);
                }
            } else {
                self.rt.set_alarm(Alarm::AbortCycle);
            }
            let state = self.sys.state;
            self.stepper.go_idle(&mut self.board, &self.settings, state, true);
        }
    }
}
