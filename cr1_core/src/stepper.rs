//! Step-segment engine.
//!
//! Converts planned trapezoids into a ring of fixed-duration segments, each a
//! constant step rate, and executes them one timer tick at a time with a
//! Bresenham distribution across the three axes.
//!
//! Two halves share the ring:
//!
//! - `prep_buffer` (main context) slices the active region of the head plan
//!   block's velocity profile into 10 ms segments, tracking partial-step time
//!   so the executed profile matches the planned one exactly.
//! - `tick` (the step-timer interrupt body) consumes segments and emits step
//!   pulses through the board. One call is one timer fire; the owning loop
//!   paces calls by `cycles_per_tick`.
//!
//! Adaptive multi-axis step smoothing: below the cutoff step frequencies the
//! timer grid is multiplied by 2^L (L up to 3) and Bresenham counts are
//! scaled to match, so slow multi-axis moves step smoothly instead of in
//! bursts. Bresenham data is pre-scaled by the maximum level once per block;
//! each segment selects its own level.

use cr1_common::axis::{axis_bit, N_AXIS};
use cr1_common::consts::{
    ACCELERATION_TICKS_PER_SECOND, AMASS_LEVEL1_HZ, AMASS_LEVEL2_HZ, AMASS_LEVEL3_HZ,
    MAX_AMASS_LEVEL, SEGMENT_BUFFER_SIZE, SPINDLE_PWM_OFF_VALUE, STEP_TIMER_HZ,
};
use cr1_common::rt::{RtEvent, RtFlags};
use cr1_common::settings::Settings;
use cr1_common::state::{MachineState, StepControl};
use cr1_hal::Board;

use crate::machine::SysState;
use crate::planner::{Condition, PlanBlock, Planner};
use crate::spindle;

/// Segment slice time [min].
const DT_SEGMENT: f32 = 1.0 / (ACCELERATION_TICKS_PER_SECOND * 60.0);

/// Distance that guarantees at least one step in a segment, scaled up for
/// rounding headroom.
const REQ_MM_INCREMENT_SCALAR: f32 = 1.25;

/// Timer ticks per step above which each smoothing level engages.
const AMASS_LEVEL1_TICKS: u32 = STEP_TIMER_HZ / AMASS_LEVEL1_HZ;
const AMASS_LEVEL2_TICKS: u32 = STEP_TIMER_HZ / AMASS_LEVEL2_HZ;
const AMASS_LEVEL3_TICKS: u32 = STEP_TIMER_HZ / AMASS_LEVEL3_HZ;

/// Velocity ramp the prep is currently slicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Ramp {
    #[default]
    Accel,
    Cruise,
    Decel,
    /// Entry speed exceeds the replanned profile; decelerate into it.
    DecelOverride,
}

/// Stepper-local copy of a block's Bresenham data, pre-scaled by the maximum
/// smoothing level. Outlives the planner block, which is discarded as soon
/// as its segments are fully prepped.
#[derive(Debug, Clone, Copy, Default)]
struct StBlock {
    steps: [u32; N_AXIS],
    step_event_count: u32,
    direction_bits: u8,
}

/// One prepped execution slice.
#[derive(Debug, Clone, Copy, Default)]
struct Segment {
    /// Timer ticks to execute (steps on the smoothing grid).
    n_step: u16,
    /// Timer reload [ticks].
    cycles_per_tick: u32,
    /// Index into the stepper block copies.
    st_block_index: usize,
    amass_level: u8,
    spindle_pwm: u8,
}

/// Segment-prep working state across calls.
#[derive(Debug, Clone, Copy, Default)]
struct PrepState {
    /// Latched onto a plan block.
    has_block: bool,
    /// Reload the same block but recompute its profile only.
    recalculate: bool,
    /// Next block starts above its profile; enter in deceleration.
    decel_override: bool,

    st_block_index: usize,
    steps_remaining: f32,
    step_per_mm: f32,
    req_mm_increment: f32,
    dt_remainder: f32,
    /// Distance from block end where this motion must stop [mm]. Nonzero
    /// only during a feed hold that ends inside the block.
    mm_complete: f32,
    current_speed: f32,
    maximum_speed: f32,
    exit_speed: f32,
    accelerate_until: f32,
    decelerate_after: f32,
    ramp_type: Ramp,
    spindle_pwm: u8,
}

/// The stepper engine: segment ring plus the timer-interrupt execution state.
#[derive(Debug)]
pub struct Stepper {
    segments: [Segment; SEGMENT_BUFFER_SIZE],
    segment_head: usize,
    segment_next_head: usize,
    segment_tail: usize,

    st_blocks: [StBlock; SEGMENT_BUFFER_SIZE],
    prep: PrepState,

    // ── Timer-interrupt state ──
    running: bool,
    exec_valid: bool,
    exec_block_loaded: bool,
    exec_block_index: usize,
    counter: [u32; N_AXIS],
    exec_steps: [u32; N_AXIS],
    exec_step_event_count: u32,
    exec_dir_bits: u8,
    step_count: u16,
    cycles_per_tick: u32,
    last_pwm: u8,
}

impl Default for Stepper {
    fn default() -> Self {
        Self::new()
    }
}

impl Stepper {
    pub fn new() -> Self {
        Self {
            segments: [Segment::default(); SEGMENT_BUFFER_SIZE],
            segment_head: 0,
            segment_next_head: 1,
            segment_tail: 0,
            st_blocks: [StBlock::default(); SEGMENT_BUFFER_SIZE],
            prep: PrepState::default(),
            running: false,
            exec_valid: false,
            exec_block_loaded: false,
            exec_block_index: 0,
            counter: [0; N_AXIS],
            exec_steps: [0; N_AXIS],
            exec_step_event_count: 0,
            exec_dir_bits: 0,
            step_count: 0,
            cycles_per_tick: STEP_TIMER_HZ / 1000,
            last_pwm: SPINDLE_PWM_OFF_VALUE,
        }
    }

    /// Enable the drivers and start the step timer. Idempotent.
    pub fn wake_up(&mut self, board: &mut impl Board) {
        board.set_stepper_enable(true);
        self.running = true;
    }

    /// Stop the step timer. The drivers dwell for the idle lock time and
    /// de-energize, unless locked forever (255) without an alarm, or homing,
    /// which manages its own enable state.
    pub fn go_idle(
        &mut self,
        board: &mut impl Board,
        settings: &Settings,
        state: MachineState,
        alarmed: bool,
    ) {
        self.running = false;
        self.exec_valid = false;
        // The block latch survives: a resume continues the same Bresenham
        // counters, so no sub-axis step is lost across a hold.
        let lock = settings.stepper_idle_lock_time;
        if (lock != 255 || alarmed || state == MachineState::Sleep) && state != MachineState::Homing
        {
            // Dwell so residual inertia cannot drift the axes, then release.
            if lock != 255 {
                board.delay_ms(lock as u16);
            }
            board.set_stepper_enable(false);
        }
    }

    /// Force-kill the timer and flush the segment ring. Machine position is
    /// retained by the caller.
    pub fn reset(
        &mut self,
        board: &mut impl Board,
        settings: &Settings,
        state: MachineState,
        alarmed: bool,
    ) {
        self.go_idle(board, settings, state, alarmed);
        self.segment_head = 0;
        self.segment_next_head = 1;
        self.segment_tail = 0;
        self.prep = PrepState::default();
        self.exec_valid = false;
        self.exec_block_loaded = false;
        self.step_count = 0;
        self.last_pwm = SPINDLE_PWM_OFF_VALUE;
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current timer reload [ticks], for the pacing loop.
    #[inline]
    pub fn current_cycles_per_tick(&self) -> u32 {
        self.cycles_per_tick
    }

    /// Current execution speed [mm/min], for reporting.
    pub fn realtime_rate(&self, state: MachineState) -> f32 {
        if state.is_motion() || state == MachineState::Hold {
            self.prep.current_speed
        } else {
            0.0
        }
    }

    /// Pass the stepper power level through to the board.
    pub fn set_power_level(&mut self, board: &mut impl Board, level: u8) {
        board.set_power_level(level);
    }

    /// The head plan block's profile changed (hold, override) while possibly
    /// mid-execution. Returns the in-flight speed squared for the planner to
    /// adopt as the block's new entry speed, and forces a profile reload.
    pub fn plan_block_parameters_changed(&mut self) -> Option<f32> {
        if self.prep.has_block {
            self.prep.recalculate = true;
            self.prep.has_block = false;
            Some(self.prep.current_speed * self.prep.current_speed)
        } else {
            None
        }
    }

    #[inline]
    fn segment_ring_full(&self) -> bool {
        self.segment_next_head == self.segment_tail
    }

    /// One step-timer fire: load a segment if needed, emit the Bresenham step
    /// pulses, retire the segment when its tick count is exhausted. Raises
    /// `CYCLE_STOP` when the ring runs dry.
    pub fn tick(
        &mut self,
        board: &mut impl Board,
        sys: &mut SysState,
        settings: &Settings,
        rt: &RtFlags,
    ) {
        if !self.running {
            return;
        }

        if !self.exec_valid {
            if self.segment_head == self.segment_tail {
                // Ring drained: motion complete or prep starved to a stop.
                self.go_idle(board, settings, sys.state, rt.alarm().is_some());
                rt.set_state(RtEvent::CYCLE_STOP);
                return;
            }
            let segment = self.segments[self.segment_tail];
            self.cycles_per_tick = segment.cycles_per_tick;
            if !self.exec_block_loaded || self.exec_block_index != segment.st_block_index {
                self.exec_block_index = segment.st_block_index;
                self.exec_block_loaded = true;
                let block = &self.st_blocks[segment.st_block_index];
                // Bresenham counters start at half the scaled event count.
                self.counter = [block.step_event_count >> 1; N_AXIS];
            }
            let block = &self.st_blocks[segment.st_block_index];
            self.exec_dir_bits = block.direction_bits;
            self.exec_step_event_count = block.step_event_count;
            for idx in 0..N_AXIS {
                self.exec_steps[idx] = block.steps[idx] >> segment.amass_level;
            }
            if segment.spindle_pwm != self.last_pwm {
                board.set_spindle_pwm(segment.spindle_pwm);
                self.last_pwm = segment.spindle_pwm;
            }
            self.step_count = segment.n_step;
            self.exec_valid = true;
        }

        let mut out_bits: u8 = 0;
        for idx in 0..N_AXIS {
            self.counter[idx] += self.exec_steps[idx];
            if self.counter[idx] > self.exec_step_event_count {
                out_bits |= axis_bit(idx);
                self.counter[idx] -= self.exec_step_event_count;
                if self.exec_dir_bits & axis_bit(idx) != 0 {
                    sys.position[idx] -= 1;
                } else {
                    sys.position[idx] += 1;
                }
            }
        }

        // Homing locks individual axes the instant their switch trips, while
        // the planner keeps scheduling them.
        if sys.state == MachineState::Homing {
            out_bits &= sys.homing_axis_lock;
        }

        if out_bits != 0 {
            board.step_pulse(out_bits, self.exec_dir_bits);
        }

        // Probe monitor: capture the contact position in step time.
        if sys.probe_active && board.probe_pin() != sys.probe_invert {
            sys.probe_active = false;
            sys.probe_position = sys.position;
            rt.set_state(RtEvent::MOTION_CANCEL);
        }

        self.step_count -= 1;
        if self.step_count == 0 {
            self.exec_valid = false;
            self.segment_tail = (self.segment_tail + 1) % SEGMENT_BUFFER_SIZE;
        }
    }

    /// Refill the segment ring from the head plan block (or the staged
    /// system-motion block). Must be called at least once per segment period
    /// while motion runs, or the tick starves.
    pub fn prep_buffer(&mut self, planner: &mut Planner, settings: &Settings, sys: &mut SysState) {
        if sys.step_control.contains(StepControl::END_MOTION) {
            return;
        }

        while !self.segment_ring_full() {
            if !self.prep.has_block && !self.load_next_block(planner, settings, sys) {
                return;
            }
            if !self.prep_one_segment(planner, settings, sys) {
                return;
            }
        }
    }

    /// Latch onto the next block to execute and compute its velocity
    /// profile. Returns false when there is nothing to do.
    fn load_next_block(
        &mut self,
        planner: &mut Planner,
        settings: &Settings,
        sys: &mut SysState,
    ) -> bool {
        let sys_motion = sys.step_control.contains(StepControl::EXECUTE_SYS_MOTION);
        let exists = if sys_motion {
            true
        } else {
            planner.current_block().is_some()
        };
        if !exists {
            return false;
        }

        let recalculate = self.prep.recalculate;
        let hold = sys.step_control.contains(StepControl::EXECUTE_HOLD);

        if recalculate {
            // Same block: keep step bookkeeping, refresh only the profile.
            self.prep.recalculate = false;
        } else {
            // Fresh block: copy Bresenham data scaled to the smoothing grid.
            self.prep.st_block_index = (self.prep.st_block_index + 1) % SEGMENT_BUFFER_SIZE;
            let block = active_block(planner, sys);
            let st_block = &mut self.st_blocks[self.prep.st_block_index];
            st_block.direction_bits = block.direction_bits;
            for idx in 0..N_AXIS {
                st_block.steps[idx] = block.steps[idx] << MAX_AMASS_LEVEL;
            }
            st_block.step_event_count = block.step_event_count << MAX_AMASS_LEVEL;

            self.prep.steps_remaining = block.step_event_count as f32;
            self.prep.step_per_mm = self.prep.steps_remaining / block.millimeters;
            self.prep.req_mm_increment = REQ_MM_INCREMENT_SCALAR / self.prep.step_per_mm;
            self.prep.dt_remainder = 0.0;

            if hold || self.prep.decel_override {
                // Mid-hold or deceleration-override entry: the true speed is
                // the previous block's exit, not the planned entry.
                self.prep.current_speed = self.prep.exit_speed;
                let block = active_block_mut(planner, sys);
                block.entry_speed_sqr = self.prep.exit_speed * self.prep.exit_speed;
                self.prep.decel_override = false;
            } else {
                self.prep.current_speed = block.entry_speed_sqr.sqrt();
            }
        }

        // Spindle output for the segments of this block.
        self.refresh_spindle_pwm(planner, settings, sys);

        // ── Velocity profile ──
        {
            let hold = sys.step_control.contains(StepControl::EXECUTE_HOLD);
            let sys_motion = sys.step_control.contains(StepControl::EXECUTE_SYS_MOTION);
            let ov = sys.overrides();
            let block = *active_block(planner, sys);
            let inv_2_accel = 0.5 / block.acceleration;
            self.prep.mm_complete = 0.0;

            if hold {
                // Forced deceleration to zero.
                self.prep.ramp_type = Ramp::Decel;
                let decel_dist =
                    block.millimeters - inv_2_accel * block.entry_speed_sqr;
                if decel_dist < 0.0 {
                    // Hold does not end inside this block.
                    self.prep.exit_speed = (block.entry_speed_sqr
                        - 2.0 * block.acceleration * block.millimeters)
                        .max(0.0)
                        .sqrt();
                } else {
                    self.prep.mm_complete = decel_dist;
                    self.prep.exit_speed = 0.0;
                }
            } else {
                self.prep.ramp_type = Ramp::Accel;
                self.prep.accelerate_until = block.millimeters;

                let exit_speed_sqr = if sys_motion {
                    0.0
                } else {
                    planner.exec_block_exit_speed_sqr()
                };
                self.prep.exit_speed = exit_speed_sqr.sqrt();

                let nominal_speed = block.nominal_speed(ov);
                let nominal_speed_sqr = nominal_speed * nominal_speed;
                let intersect_distance = 0.5
                    * (block.millimeters
                        + inv_2_accel * (block.entry_speed_sqr - exit_speed_sqr));

                if block.entry_speed_sqr > nominal_speed_sqr {
                    // Only during an override reduction.
                    self.prep.accelerate_until = block.millimeters
                        - inv_2_accel * (block.entry_speed_sqr - nominal_speed_sqr);
                    if self.prep.accelerate_until <= 0.0 {
                        // Deceleration-only through the whole block.
                        self.prep.ramp_type = Ramp::Decel;
                        self.prep.exit_speed = (block.entry_speed_sqr
                            - 2.0 * block.acceleration * block.millimeters)
                            .max(0.0)
                            .sqrt();
                        self.prep.decel_override = true;
                    } else {
                        self.prep.decelerate_after =
                            inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                        self.prep.maximum_speed = nominal_speed;
                        self.prep.ramp_type = Ramp::DecelOverride;
                    }
                } else if intersect_distance > 0.0 {
                    if intersect_distance < block.millimeters {
                        // Trapezoid or triangle.
                        self.prep.decelerate_after =
                            inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
                        if self.prep.decelerate_after < intersect_distance {
                            // Trapezoid.
                            self.prep.maximum_speed = nominal_speed;
                            if block.entry_speed_sqr == nominal_speed_sqr {
                                self.prep.ramp_type = Ramp::Cruise;
                            } else {
                                self.prep.accelerate_until -= inv_2_accel
                                    * (nominal_speed_sqr - block.entry_speed_sqr);
                            }
                        } else {
                            // Triangle.
                            self.prep.accelerate_until = intersect_distance;
                            self.prep.decelerate_after = intersect_distance;
                            self.prep.maximum_speed = (2.0
                                * block.acceleration
                                * intersect_distance
                                + exit_speed_sqr)
                                .sqrt();
                        }
                    } else {
                        // Deceleration-only.
                        self.prep.ramp_type = Ramp::Decel;
                    }
                } else {
                    // Acceleration-only.
                    self.prep.accelerate_until = 0.0;
                    self.prep.maximum_speed = self.prep.exit_speed;
                }
            }
        }

        self.prep.has_block = true;
        true
    }

    /// Compute the PWM the next segments carry, honoring the update flag.
    fn refresh_spindle_pwm(
        &mut self,
        planner: &mut Planner,
        settings: &Settings,
        sys: &mut SysState,
    ) {
        let block = active_block(planner, sys);
        let pwm = if block
            .condition
            .intersects(Condition::SPINDLE_CW | Condition::SPINDLE_CCW)
        {
            let (pwm, actual_rpm) =
                spindle::compute_pwm_value(settings, block.spindle_speed, sys.spindle_speed_ovr);
            sys.spindle_speed = actual_rpm;
            pwm
        } else {
            SPINDLE_PWM_OFF_VALUE
        };
        self.prep.spindle_pwm = pwm;
        sys.step_control.remove(StepControl::UPDATE_SPINDLE_PWM);
    }

    /// Slice one segment from the active profile. Returns false when prep
    /// must stop (hold boundary reached with no step to issue).
    fn prep_one_segment(
        &mut self,
        planner: &mut Planner,
        settings: &Settings,
        sys: &mut SysState,
    ) -> bool {
        if sys.step_control.contains(StepControl::UPDATE_SPINDLE_PWM) {
            self.refresh_spindle_pwm(planner, settings, sys);
        }

        let (block_acceleration, block_millimeters) = {
            let block = active_block(planner, sys);
            (block.acceleration, block.millimeters)
        };

        let mut segment = Segment {
            st_block_index: self.prep.st_block_index,
            spindle_pwm: self.prep.spindle_pwm,
            ..Segment::default()
        };

        // ── Integrate the velocity profile over one segment time ──
        let mut dt_max = DT_SEGMENT;
        let mut dt = 0.0f32;
        let mut time_var = dt_max;
        let mut mm_var: f32;
        let mut speed_var: f32;
        let mut mm_remaining = block_millimeters;
        let minimum_mm = (mm_remaining - self.prep.req_mm_increment).max(0.0);

        loop {
            match self.prep.ramp_type {
                Ramp::DecelOverride => {
                    speed_var = block_acceleration * time_var;
                    mm_var = time_var * (self.prep.current_speed - 0.5 * speed_var);
                    mm_remaining -= mm_var;
                    if mm_remaining < self.prep.accelerate_until || mm_var <= 0.0 {
                        // Deceleration-override ramp ends: cruise from here.
                        mm_remaining = self.prep.accelerate_until;
                        time_var = 2.0 * (block_millimeters - mm_remaining)
                            / (self.prep.current_speed + self.prep.maximum_speed);
                        self.prep.ramp_type = Ramp::Cruise;
                        self.prep.current_speed = self.prep.maximum_speed;
                    } else {
                        self.prep.current_speed -= speed_var;
                    }
                }
                Ramp::Accel => {
                    speed_var = block_acceleration * time_var;
                    mm_remaining -= time_var * (self.prep.current_speed + 0.5 * speed_var);
                    if mm_remaining < self.prep.accelerate_until {
                        // Ramp junction or end of block.
                        mm_remaining = self.prep.accelerate_until;
                        time_var = 2.0 * (block_millimeters - mm_remaining)
                            / (self.prep.current_speed + self.prep.maximum_speed);
                        self.prep.ramp_type = if mm_remaining == self.prep.decelerate_after {
                            Ramp::Decel
                        } else {
                            Ramp::Cruise
                        };
                        self.prep.current_speed = self.prep.maximum_speed;
                    } else {
                        self.prep.current_speed += speed_var;
                    }
                }
                Ramp::Cruise => {
                    mm_var = mm_remaining - self.prep.maximum_speed * time_var;
                    if mm_var < self.prep.decelerate_after {
                        // End of cruise.
                        time_var = (mm_remaining - self.prep.decelerate_after)
                            / self.prep.maximum_speed;
                        mm_remaining = self.prep.decelerate_after;
                        self.prep.ramp_type = Ramp::Decel;
                    } else {
                        mm_remaining = mm_var;
                    }
                }
                Ramp::Decel => {
                    speed_var = block_acceleration * time_var;
                    let mut still_decelerating = false;
                    if self.prep.current_speed > speed_var {
                        mm_var =
                            mm_remaining - time_var * (self.prep.current_speed - 0.5 * speed_var);
                        if mm_var > self.prep.mm_complete {
                            // Still decelerating inside the block.
                            mm_remaining = mm_var;
                            self.prep.current_speed -= speed_var;
                            still_decelerating = true;
                        }
                    }
                    if !still_decelerating {
                        // End of block or end of forced deceleration.
                        time_var = 2.0 * (mm_remaining - self.prep.mm_complete)
                            / (self.prep.current_speed + self.prep.exit_speed);
                        mm_remaining = self.prep.mm_complete;
                        self.prep.current_speed = self.prep.exit_speed;
                    }
                }
            }

            dt += time_var;
            if dt < dt_max {
                time_var = dt_max - dt;
            } else if mm_remaining > minimum_mm {
                // Very slow segment: widen until it holds at least one step.
                dt_max += DT_SEGMENT;
                time_var = dt_max - dt;
            } else {
                // Segment time maxed out.
                break;
            }
            if mm_remaining <= self.prep.mm_complete {
                // Profile sliced to its end point.
                break;
            }
        }

        // ── Steps and step rate for this segment ──
        let step_dist_remaining = self.prep.step_per_mm * mm_remaining;
        let n_steps_remaining = step_dist_remaining.ceil();
        let last_n_steps_remaining = self.prep.steps_remaining.ceil();
        segment.n_step = (last_n_steps_remaining - n_steps_remaining) as u16;

        if segment.n_step == 0 {
            if sys.step_control.contains(StepControl::EXECUTE_HOLD) {
                // Less than one step left to decelerate: the hold is complete.
                sys.step_control.insert(StepControl::END_MOTION);
                return false;
            }
            // Degenerate tail shorter than one whole step: close out the
            // block without committing an empty segment.
            {
                let block = active_block_mut(planner, sys);
                block.millimeters = mm_remaining;
            }
            self.prep.steps_remaining = n_steps_remaining;
            if sys.step_control.contains(StepControl::EXECUTE_SYS_MOTION) {
                sys.step_control.insert(StepControl::END_MOTION);
                return false;
            }
            self.prep.has_block = false;
            planner.discard_current_block();
            return true;
        }

        dt += self.prep.dt_remainder;
        let inv_rate = dt / (last_n_steps_remaining - step_dist_remaining);

        // Timer ticks per step on the unsmoothed grid.
        let mut ticks = ((STEP_TIMER_HZ as f32 * 60.0) * inv_rate).ceil() as u32;
        if ticks < AMASS_LEVEL1_TICKS {
            segment.amass_level = 0;
        } else {
            segment.amass_level = if ticks < AMASS_LEVEL2_TICKS {
                1
            } else if ticks < AMASS_LEVEL3_TICKS {
                2
            } else {
                3
            };
            ticks >>= segment.amass_level;
            segment.n_step <<= segment.amass_level;
        }
        segment.cycles_per_tick = ticks.max(1);

        // Commit the segment.
        self.segments[self.segment_head] = segment;
        self.segment_head = self.segment_next_head;
        self.segment_next_head = (self.segment_next_head + 1) % SEGMENT_BUFFER_SIZE;

        // Update block consumption bookkeeping.
        {
            let block = active_block_mut(planner, sys);
            block.millimeters = mm_remaining;
        }
        self.prep.steps_remaining = n_steps_remaining;
        self.prep.dt_remainder = (n_steps_remaining - step_dist_remaining) * inv_rate;

        if mm_remaining <= self.prep.mm_complete {
            if mm_remaining > 0.0 {
                // Feed hold end point reached mid-block.
                sys.step_control.insert(StepControl::END_MOTION);
                return false;
            }
            // Block fully converted to segments.
            if sys.step_control.contains(StepControl::EXECUTE_SYS_MOTION) {
                sys.step_control.insert(StepControl::END_MOTION);
                return false;
            }
            self.prep.has_block = false;
            planner.discard_current_block();
        }
        true
    }
}

fn active_block<'a>(planner: &'a mut Planner, sys: &SysState) -> &'a PlanBlock {
    if sys.step_control.contains(StepControl::EXECUTE_SYS_MOTION) {
        planner.system_block_mut()
    } else {
        planner
            .current_block_mut()
            .expect("prep latched onto an empty queue")
    }
}

fn active_block_mut<'a>(planner: &'a mut Planner, sys: &SysState) -> &'a mut PlanBlock {
    if sys.step_control.contains(StepControl::EXECUTE_SYS_MOTION) {
        planner.system_block_mut()
    } else {
        planner
            .current_block_mut()
            .expect("prep latched onto an empty queue")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::SysState;
    use crate::planner::{Overrides, PlanLineData};
    use cr1_hal::SimBoard;

    struct Rig {
        stepper: Stepper,
        planner: Planner,
        sys: SysState,
        board: SimBoard,
        settings: Settings,
        rt: RtFlags,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                stepper: Stepper::new(),
                planner: Planner::new(),
                sys: SysState::new(),
                board: SimBoard::new(),
                settings: Settings::default(),
                rt: RtFlags::new(),
            }
        }

        fn buffer(&mut self, target: [f32; 3], feed: f32) {
            let data = PlanLineData {
                feed_rate: feed,
                ..PlanLineData::default()
            };
            let position = self.sys.position;
            assert!(self.planner.buffer_line(
                &target,
                &data,
                &self.settings,
                Overrides::default(),
                &mut self.stepper,
                &position,
            ));
        }

        fn start_cycle(&mut self) {
            self.sys.state = MachineState::Cycle;
            self.stepper
                .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
            self.stepper.wake_up(&mut self.board);
        }

        /// Run prep+tick until the engine stops. Returns the peak rate seen
        /// and the rate samples at segment-ish granularity.
        fn run_to_stop(&mut self) -> Vec<f32> {
            let mut rates = Vec::new();
            let mut guard = 0u32;
            while self.stepper.is_running() {
                self.stepper
                    .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
                rates.push(self.stepper.realtime_rate(self.sys.state));
                for _ in 0..64 {
                    if !self.stepper.is_running() {
                        break;
                    }
                    self.stepper
                        .tick(&mut self.board, &mut self.sys, &self.settings, &self.rt);
                }
                guard += 1;
                assert!(guard < 2_000_000, "stepper failed to finish");
            }
            rates
        }
    }

    #[test]
    fn executes_exact_step_total() {
        let mut rig = Rig::new();
        rig.buffer([-10.0, 0.0, 0.0], 600.0);
        rig.start_cycle();
        rig.run_to_stop();
        assert_eq!(rig.sys.position, [-4000, 0, 0]);
        assert_eq!(rig.board.position[0], -4000);
        assert!(rig.rt.state().contains(RtEvent::CYCLE_STOP));
        assert!(rig.planner.is_empty());
    }

    #[test]
    fn multi_axis_bresenham_lands_on_target() {
        let mut rig = Rig::new();
        rig.buffer([-7.5, -2.5, -1.0], 900.0);
        rig.start_cycle();
        rig.run_to_stop();
        assert_eq!(rig.sys.position, [-3000, -1000, -400]);
        assert_eq!(rig.board.position, [-3000, -1000, -400]);
    }

    #[test]
    fn trapezoid_rate_rises_then_falls() {
        let mut rig = Rig::new();
        // Long enough to reach cruise at this feed.
        rig.buffer([-60.0, 0.0, 0.0], 1500.0);
        rig.start_cycle();
        let rates = rig.run_to_stop();

        let peak = rates.iter().cloned().fold(0.0f32, f32::max);
        assert!(
            (peak - 1500.0).abs() < 30.0,
            "peak {peak} should reach nominal"
        );
        let peak_at = rates
            .iter()
            .position(|&r| (r - peak).abs() < 1.0)
            .unwrap();
        // Monotonic rise to the plateau, monotonic fall after it.
        for pair in rates[..peak_at].windows(2) {
            assert!(pair[1] >= pair[0] - 1.0, "accel not monotonic: {pair:?}");
        }
        let after_peak: Vec<f32> = rates[peak_at..]
            .iter()
            .cloned()
            .filter(|&r| r < peak - 1.0)
            .collect();
        for pair in after_peak.windows(2) {
            assert!(pair[1] <= pair[0] + 1.0, "decel not monotonic: {pair:?}");
        }
    }

    #[test]
    fn slow_feed_uses_smoothing_and_still_lands_exact() {
        let mut rig = Rig::new();
        // 2 mm/min * 400 steps/mm = ~13 steps/s: deep in smoothing range.
        rig.buffer([-0.25, 0.0, 0.0], 2.0);
        rig.start_cycle();
        rig.run_to_stop();
        assert_eq!(rig.sys.position[0], -100);
        assert_eq!(rig.board.position[0], -100);
    }

    #[test]
    fn hold_decelerates_and_resumes_without_losing_steps() {
        let mut rig = Rig::new();
        rig.buffer([-50.0, 0.0, 0.0], 1200.0);
        rig.start_cycle();

        // Let it get up to speed.
        for _ in 0..40 {
            rig.stepper
                .prep_buffer(&mut rig.planner, &rig.settings, &mut rig.sys);
            for _ in 0..256 {
                rig.stepper
                    .tick(&mut rig.board, &mut rig.sys, &rig.settings, &rig.rt);
            }
        }
        assert!(rig.stepper.realtime_rate(MachineState::Cycle) > 100.0);

        // Feed hold: capture in-flight speed, decelerate to zero.
        if let Some(speed_sqr) = rig.stepper.plan_block_parameters_changed() {
            rig.planner.current_block_mut().unwrap().entry_speed_sqr = speed_sqr;
        }
        rig.sys.step_control = StepControl::EXECUTE_HOLD;
        rig.run_to_stop();
        assert!(rig.sys.step_control.contains(StepControl::END_MOTION));
        let held_at = rig.sys.position[0];
        assert!(held_at > -20_000 && held_at < -1_000, "held at {held_at}");

        // Resume: re-plan from zero and finish the block.
        rig.sys.step_control = StepControl::empty();
        rig.planner.cycle_reinitialize(&mut rig.stepper);
        rig.rt.clear_state(RtEvent::CYCLE_STOP);
        rig.start_cycle();
        rig.run_to_stop();
        assert_eq!(rig.sys.position[0], -20_000);
        assert_eq!(rig.board.position[0], -20_000);
    }

    #[test]
    fn homing_axis_lock_masks_pulses_but_not_position() {
        let mut rig = Rig::new();
        rig.sys.state = MachineState::Homing;
        rig.sys.homing_axis_lock = 0b010; // only Y may pulse
        let data = PlanLineData {
            feed_rate: 600.0,
            condition: Condition::SYSTEM_MOTION | Condition::NO_FEED_OVERRIDE,
            ..PlanLineData::default()
        };
        let position = rig.sys.position;
        rig.planner.buffer_line(
            &[-5.0, -5.0, 0.0],
            &data,
            &rig.settings,
            Overrides::default(),
            &mut rig.stepper,
            &position,
        );
        rig.sys.step_control = StepControl::EXECUTE_SYS_MOTION;
        rig.stepper
            .prep_buffer(&mut rig.planner, &rig.settings, &mut rig.sys);
        rig.stepper.wake_up(&mut rig.board);
        let mut guard = 0;
        while rig.stepper.is_running() && guard < 3_000_000 {
            rig.stepper
                .prep_buffer(&mut rig.planner, &rig.settings, &mut rig.sys);
            rig.stepper
                .tick(&mut rig.board, &mut rig.sys, &rig.settings, &rig.rt);
            guard += 1;
        }
        // The locked X axis emitted no pulses; the scheduler still counted.
        assert_eq!(rig.board.position[0], 0);
        assert_eq!(rig.board.position[1], -2000);
        assert_eq!(rig.sys.position[0], -2000);
    }
}
