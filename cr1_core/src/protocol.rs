//! The realtime executor and the primary serial loop.
//!
//! The executor is a cooperative reactor: every long-running call point
//! polls `execute_realtime`, which consumes the realtime flag words, drives
//! the global state machine, applies overrides, and keeps the stepper's
//! segment ring fed. Nothing here blocks on I/O; the suspend handler is an
//! explicit loop re-entered from the same tick.

use std::io::Write;

use cr1_common::codes::Status;
use cr1_common::consts::{
    DEFAULT_FEED_OVERRIDE, DEFAULT_RAPID_OVERRIDE, DEFAULT_SPINDLE_SPEED_OVERRIDE,
    FEED_OVERRIDE_COARSE_INCREMENT, FEED_OVERRIDE_FINE_INCREMENT, LINE_BUFFER_LEN,
    MAX_FEED_RATE_OVERRIDE, MAX_SPINDLE_SPEED_OVERRIDE, MIN_FEED_RATE_OVERRIDE,
    MIN_SPINDLE_SPEED_OVERRIDE, RAPID_OVERRIDE_LOW, RAPID_OVERRIDE_MEDIUM,
    SPINDLE_OVERRIDE_COARSE_INCREMENT, SPINDLE_OVERRIDE_FINE_INCREMENT,
};
use cr1_common::rt::{AccessoryOverride, MotionOverride, RtEvent};
use cr1_common::state::{MachineState, SpindleStop, StepControl, Suspend};
use cr1_hal::{Board, NvStorage};
use heapless::Vec as FixedVec;
use tracing::{debug, info};

use crate::machine::Machine;
use crate::serial::SerialRx;
use crate::spindle::SpindleState;

/// Step-timer fires pumped per idle pass of a cooperative wait loop.
pub const TICK_PUMP_BATCH: u32 = 256;

/// Line-assembly state carried between received bytes.
#[derive(Default)]
struct LineAssembly {
    buffer: FixedVec<u8, LINE_BUFFER_LEN>,
    overflow: bool,
    in_paren_comment: bool,
    in_semi_comment: bool,
}

impl LineAssembly {
    fn reset(&mut self) {
        self.buffer.clear();
        self.overflow = false;
        self.in_paren_comment = false;
        self.in_semi_comment = false;
    }

    /// Filter one byte into the line: strips whitespace and comments,
    /// upcases, latches overflow.
    fn push(&mut self, c: u8) {
        if self.in_paren_comment {
            if c == b')' {
                self.in_paren_comment = false;
            }
            return;
        }
        if self.in_semi_comment {
            return;
        }
        match c {
            0..=b' ' => {}
            b'/' => {} // block delete unsupported; strip
            b'(' => self.in_paren_comment = true,
            b';' => self.in_semi_comment = true,
            _ => {
                let upper = c.to_ascii_uppercase();
                if self.buffer.push(upper).is_err() {
                    self.overflow = true;
                }
            }
        }
    }
}

impl<B: Board, N: NvStorage, W: Write> Machine<B, N, W> {
    /// The primary loop: assemble lines, dispatch them, auto-start queued
    /// motion, and service realtime events. Returns on system abort; the
    /// caller re-initializes and calls again.
    pub fn main_loop(&mut self, rx: &mut impl SerialRx) {
        // After reset, an alarm or sleep state means position is untrusted.
        if matches!(self.sys.state, MachineState::Alarm | MachineState::Sleep) {
            self.report.feedback("'$H'|'$X' to unlock");
            self.sys.state = MachineState::Alarm;
        } else {
            self.sys.state = MachineState::Idle;
            self.execute_startup_lines();
        }

        let mut line = LineAssembly::default();
        loop {
            self.serial_rx_available = rx.available_space();
            while let Some(c) = rx.read_byte() {
                if c == b'\n' || c == b'\r' {
                    self.execute_realtime();
                    if self.sys.abort {
                        return;
                    }
                    self.dispatch_line(&line);
                    line.reset();
                } else {
                    line.push(c);
                }
            }

            // Stream idle: start anything queued and service the machine.
            self.auto_cycle_start();
            self.execute_realtime();
            if self.sys.abort {
                return;
            }
            self.run_stepper_ticks(TICK_PUMP_BATCH);
        }
    }

    fn dispatch_line(&mut self, line: &LineAssembly) {
        let text = std::str::from_utf8(&line.buffer).unwrap_or("");
        let status = if line.overflow {
            self.report.echo_line(text);
            Status::Overflow
        } else if line.buffer.is_empty() {
            Status::Ok
        } else if line.buffer[0] == b'$' {
            let status = self.execute_console_line(text);
            if status != Status::Ok {
                self.report.echo_line(text);
            }
            status
        } else if matches!(self.sys.state, MachineState::Alarm | MachineState::Jog) {
            self.report.echo_line(text);
            Status::SystemGcLock
        } else {
            let status = self.execute_gcode_line(text);
            if status != Status::Ok {
                self.report.echo_line(text);
            }
            status
        };
        self.report.status(status);
    }

    /// Run the stored startup lines through the g-code executor.
    pub fn execute_startup_lines(&mut self) {
        for n in 0..2 {
            match self.read_startup_line(n) {
                Ok(Some(stored)) => {
                    if !stored.is_empty() {
                        let status = self.execute_gcode_line(&stored);
                        self.report.startup_result(&stored, status);
                    }
                }
                Ok(None) => {}
                Err(_) => self.report.status(Status::SettingReadFail),
            }
        }
    }

    /// Block until every buffered motion has executed and the cycle wound
    /// down. The spindle-sync and coordinate-write paths depend on this.
    pub fn buffer_synchronize(&mut self) {
        self.auto_cycle_start();
        loop {
            self.execute_realtime();
            if self.sys.abort {
                return;
            }
            if self.planner.current_block().is_none() && self.sys.state != MachineState::Cycle {
                return;
            }
            self.run_stepper_ticks(TICK_PUMP_BATCH);
        }
    }

    /// Start the cycle whenever queued motion is waiting. Called when the
    /// stream goes idle, on buffer sync, and while blocking on a full ring.
    pub fn auto_cycle_start(&mut self) {
        if self.planner.current_block().is_some() {
            self.rt.set_state(RtEvent::CYCLE_START);
        }
    }

    /// The realtime service point: run the executor, then the suspend
    /// handler while any suspend sub-state is active.
    pub fn execute_realtime(&mut self) {
        self.check_hard_limits();
        self.exec_rt_system();
        if !self.sys.suspend.is_empty() {
            self.exec_rt_suspend();
        }
    }

    /// The state-machine core: consume the flag words and react.
    fn exec_rt_system(&mut self) {
        // A latched alarm halts everything. Only a status report and reset
        // are serviced until the operator acknowledges.
        if let Some(alarm) = self.rt.alarm() {
            self.sys.state = MachineState::Alarm;
            info!(code = alarm.code(), "alarm");
            self.report.alarm(alarm);
            self.report.feedback("reset to continue");
            self.rt.clear_state(RtEvent::RESET);
            loop {
                let rt_state = self.rt.state();
                if rt_state.contains(RtEvent::STATUS_REPORT) {
                    self.report.feedback("reset to continue");
                    self.rt.clear_state(RtEvent::STATUS_REPORT);
                }
                if rt_state.contains(RtEvent::RESET) {
                    break;
                }
                // Parked until the operator acknowledges.
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            self.rt.clear_alarm();
        }

        let rt_exec = self.rt.state();
        if !rt_exec.is_empty() {
            if rt_exec.contains(RtEvent::RESET) {
                // The only place abort latches.
                self.sys.abort = true;
                return;
            }

            if rt_exec.contains(RtEvent::STATUS_REPORT) {
                self.report_realtime_status();
                self.rt.clear_state(RtEvent::STATUS_REPORT);
            }

            if rt_exec.intersects(RtEvent::MOTION_CANCEL | RtEvent::FEED_HOLD | RtEvent::SLEEP) {
                self.handle_hold_events(rt_exec);
            }

            if rt_exec.contains(RtEvent::CYCLE_START) {
                self.handle_cycle_start(rt_exec);
            }

            if rt_exec.contains(RtEvent::CYCLE_STOP) {
                self.handle_cycle_stop();
            }
        }

        self.apply_motion_overrides();
        self.apply_accessory_overrides();

        // Keep the stepper fed in every stepping-capable state.
        if matches!(
            self.sys.state,
            MachineState::Cycle
                | MachineState::Hold
                | MachineState::Homing
                | MachineState::Sleep
                | MachineState::Jog
        ) {
            self.stepper
                .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
        }
    }

    fn handle_hold_events(&mut self, rt_exec: RtEvent) {
        if self.sys.state.accepts_hold() {
            // Motion states decelerate through the stepper hold path.
            if matches!(self.sys.state, MachineState::Cycle | MachineState::Jog)
                && !self
                    .sys
                    .suspend
                    .intersects(Suspend::MOTION_CANCEL | Suspend::JOG_CANCEL)
            {
                self.stepper_capture_hold_entry();
                self.sys.step_control = StepControl::EXECUTE_HOLD;
                if self.sys.state == MachineState::Jog && !rt_exec.contains(RtEvent::SLEEP) {
                    self.sys.suspend |= Suspend::JOG_CANCEL;
                }
            }
            // Nothing is moving: the hold is trivially complete.
            if self.sys.state == MachineState::Idle {
                self.sys.suspend = Suspend::HOLD_COMPLETE;
            }

            if rt_exec.contains(RtEvent::MOTION_CANCEL)
                && self.sys.state != MachineState::Jog
            {
                self.sys.suspend |= Suspend::MOTION_CANCEL;
            }

            if rt_exec.contains(RtEvent::FEED_HOLD)
                && !matches!(self.sys.state, MachineState::Jog | MachineState::Sleep)
            {
                self.sys.state = MachineState::Hold;
            }
        }

        if rt_exec.contains(RtEvent::SLEEP) {
            if self.sys.state == MachineState::Alarm {
                self.sys.suspend |= Suspend::RETRACT_COMPLETE | Suspend::HOLD_COMPLETE;
            }
            self.sys.state = MachineState::Sleep;
        }

        self.rt
            .clear_state(RtEvent::MOTION_CANCEL | RtEvent::FEED_HOLD | RtEvent::SLEEP);
    }

    fn handle_cycle_start(&mut self, rt_exec: RtEvent) {
        // A cycle start racing a hold must not auto-resume it.
        if !rt_exec.intersects(RtEvent::FEED_HOLD | RtEvent::MOTION_CANCEL) {
            let resumable = self.sys.state == MachineState::Idle
                || (self.sys.state == MachineState::Hold
                    && self.sys.suspend.contains(Suspend::HOLD_COMPLETE));
            if resumable {
                if self.sys.state == MachineState::Hold && !self.sys.spindle_stop_ovr.is_empty() {
                    // Restore the spindle first; the suspend handler issues
                    // the actual cycle start afterward.
                    self.sys.spindle_stop_ovr |= SpindleStop::RESTORE_CYCLE;
                } else {
                    self.sys.step_control = StepControl::empty();
                    if self.planner.current_block().is_some()
                        && !self.sys.suspend.contains(Suspend::MOTION_CANCEL)
                    {
                        self.sys.suspend = Suspend::empty();
                        self.sys.state = MachineState::Cycle;
                        self.stepper
                            .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
                        self.stepper.wake_up(&mut self.board);
                    } else {
                        self.sys.suspend = Suspend::empty();
                        self.sys.state = MachineState::Idle;
                    }
                }
            }
        }
        self.rt.clear_state(RtEvent::CYCLE_START);
    }

    fn handle_cycle_stop(&mut self) {
        let holding = matches!(self.sys.state, MachineState::Hold | MachineState::Sleep)
            && !self.sys.soft_limit
            && !self.sys.suspend.contains(Suspend::JOG_CANCEL);
        if holding {
            // Controlled stop finished; stay suspended, ready to resume.
            self.planner.cycle_reinitialize(&mut self.stepper);
            if self.sys.step_control.contains(StepControl::EXECUTE_HOLD) {
                self.sys.suspend |= Suspend::HOLD_COMPLETE;
            }
            self.sys
                .step_control
                .remove(StepControl::EXECUTE_HOLD | StepControl::EXECUTE_SYS_MOTION);
        } else {
            // Motion ran out: cycle end, jog cancel, or cancel event.
            if self.sys.suspend.contains(Suspend::JOG_CANCEL) {
                // Flush what the jog left behind and resync.
                self.sys.step_control = StepControl::empty();
                self.stepper_reset();
                self.planner.reset();
                self.planner.sync_position(&self.sys.position);
                self.gc.sync_position(&self.settings, &self.sys.position);
            }
            self.sys.suspend = Suspend::empty();
            self.sys.state = MachineState::Idle;
        }
        self.rt.clear_state(RtEvent::CYCLE_STOP);
    }

    fn apply_motion_overrides(&mut self) {
        let rt_exec = self.rt.take_motion_override();
        if rt_exec.is_empty() {
            return;
        }

        let mut new_f = self.sys.f_override as i16;
        if rt_exec.contains(MotionOverride::FEED_RESET) {
            new_f = DEFAULT_FEED_OVERRIDE as i16;
        }
        if rt_exec.contains(MotionOverride::FEED_COARSE_PLUS) {
            new_f += FEED_OVERRIDE_COARSE_INCREMENT as i16;
        }
        if rt_exec.contains(MotionOverride::FEED_COARSE_MINUS) {
            new_f -= FEED_OVERRIDE_COARSE_INCREMENT as i16;
        }
        if rt_exec.contains(MotionOverride::FEED_FINE_PLUS) {
            new_f += FEED_OVERRIDE_FINE_INCREMENT as i16;
        }
        if rt_exec.contains(MotionOverride::FEED_FINE_MINUS) {
            new_f -= FEED_OVERRIDE_FINE_INCREMENT as i16;
        }
        let new_f = new_f
            .clamp(MIN_FEED_RATE_OVERRIDE as i16, MAX_FEED_RATE_OVERRIDE as i16)
            as u8;

        let mut new_r = self.sys.r_override;
        if rt_exec.contains(MotionOverride::RAPID_RESET) {
            new_r = DEFAULT_RAPID_OVERRIDE;
        }
        if rt_exec.contains(MotionOverride::RAPID_MEDIUM) {
            new_r = RAPID_OVERRIDE_MEDIUM;
        }
        if rt_exec.contains(MotionOverride::RAPID_LOW) {
            new_r = RAPID_OVERRIDE_LOW;
        }

        if new_f != self.sys.f_override || new_r != self.sys.r_override {
            debug!(feed = new_f, rapid = new_r, "motion override");
            self.sys.f_override = new_f;
            self.sys.r_override = new_r;
            self.sys.report_ovr_counter = 0;
            let ov = self.sys.overrides();
            self.planner.update_velocity_profile_parameters(ov);
            self.planner.cycle_reinitialize(&mut self.stepper);
        }
    }

    fn apply_accessory_overrides(&mut self) {
        let rt_exec = self.rt.take_accessory_override();
        if rt_exec.is_empty() {
            return;
        }

        let mut new_s = self.sys.spindle_speed_ovr as i16;
        if rt_exec.contains(AccessoryOverride::SPINDLE_RESET) {
            new_s = DEFAULT_SPINDLE_SPEED_OVERRIDE as i16;
        }
        if rt_exec.contains(AccessoryOverride::SPINDLE_COARSE_PLUS) {
            new_s += SPINDLE_OVERRIDE_COARSE_INCREMENT as i16;
        }
        if rt_exec.contains(AccessoryOverride::SPINDLE_COARSE_MINUS) {
            new_s -= SPINDLE_OVERRIDE_COARSE_INCREMENT as i16;
        }
        if rt_exec.contains(AccessoryOverride::SPINDLE_FINE_PLUS) {
            new_s += SPINDLE_OVERRIDE_FINE_INCREMENT as i16;
        }
        if rt_exec.contains(AccessoryOverride::SPINDLE_FINE_MINUS) {
            new_s -= SPINDLE_OVERRIDE_FINE_INCREMENT as i16;
        }
        let new_s = new_s
            .clamp(
                MIN_SPINDLE_SPEED_OVERRIDE as i16,
                MAX_SPINDLE_SPEED_OVERRIDE as i16,
            ) as u8;

        if new_s != self.sys.spindle_speed_ovr {
            self.sys.spindle_speed_ovr = new_s;
            if self.sys.state == MachineState::Idle {
                let (state, rpm) = (self.gc.modal.spindle, self.gc.spindle_speed);
                self.spindle_set_state(state, rpm);
            } else {
                // The stepper folds the new PWM into its next segment.
                self.sys.step_control |= StepControl::UPDATE_SPINDLE_PWM;
            }
            self.sys.report_ovr_counter = 0;
        }

        if rt_exec.contains(AccessoryOverride::SPINDLE_STOP)
            && self.sys.state == MachineState::Hold
        {
            if self.sys.spindle_stop_ovr.is_empty() {
                self.sys.spindle_stop_ovr = SpindleStop::INITIATE;
            } else if self.sys.spindle_stop_ovr.contains(SpindleStop::ENABLED) {
                self.sys.spindle_stop_ovr |= SpindleStop::RESTORE;
            }
        }
    }

    /// Suspend handler: runs while any suspend sub-state is active, managing
    /// the spindle-stop override cascade, sleep shutdown, and resume
    /// restore. Exits when the suspend word clears or on abort.
    fn exec_rt_suspend(&mut self) {
        // Accessory state to restore on resume comes from the interrupted
        // block when there is one, else the parser's modal state.
        let (restore_state, restore_rpm) = match self.planner.current_block() {
            Some(block) => (
                SpindleState::from_condition(block.condition),
                block.spindle_speed,
            ),
            None => (self.gc.modal.spindle, self.gc.spindle_speed),
        };

        while !self.sys.suspend.is_empty() {
            if self.sys.abort {
                return;
            }

            if self.sys.suspend.contains(Suspend::HOLD_COMPLETE) {
                if self.sys.state == MachineState::Sleep {
                    if !self.sys.suspend.contains(Suspend::RETRACT_COMPLETE) {
                        // De-energize accessories before parking.
                        self.sys.spindle_stop_ovr = SpindleStop::empty();
                        self.spindle_set_state(SpindleState::Disable, 0.0);
                        self.sys.suspend.remove(Suspend::RESTART_RETRACT);
                        self.sys.suspend |= Suspend::RETRACT_COMPLETE;
                    } else {
                        self.report.feedback("sleeping");
                        self.spindle_set_state(SpindleState::Disable, 0.0);
                        let state = self.sys.state;
                        self.stepper
                            .go_idle(&mut self.board, &self.settings, state, false);
                        self.stepper.set_power_level(&mut self.board, b'0');
                        while !self.sys.abort {
                            self.exec_rt_system();
                            std::thread::sleep(std::time::Duration::from_millis(1));
                        }
                        return;
                    }
                } else if !self.sys.spindle_stop_ovr.is_empty() {
                    // Spindle-stop override cascade during a feed hold.
                    if self.sys.spindle_stop_ovr.contains(SpindleStop::INITIATE) {
                        if self.gc.modal.spindle != SpindleState::Disable {
                            self.spindle_set_state(SpindleState::Disable, 0.0);
                            self.sys.spindle_stop_ovr = SpindleStop::ENABLED;
                        } else {
                            self.sys.spindle_stop_ovr = SpindleStop::empty();
                        }
                    } else if self
                        .sys
                        .spindle_stop_ovr
                        .intersects(SpindleStop::RESTORE | SpindleStop::RESTORE_CYCLE)
                    {
                        if self.gc.modal.spindle != SpindleState::Disable {
                            self.report.feedback("restoring spindle");
                            self.spindle_set_state(restore_state, restore_rpm);
                        }
                        if self
                            .sys
                            .spindle_stop_ovr
                            .contains(SpindleStop::RESTORE_CYCLE)
                        {
                            self.rt.set_state(RtEvent::CYCLE_START);
                        }
                        self.sys.spindle_stop_ovr = SpindleStop::empty();
                    }
                } else if self.sys.step_control.contains(StepControl::UPDATE_SPINDLE_PWM) {
                    // Speed override changed during the hold: apply directly.
                    self.spindle_set_state(restore_state, restore_rpm);
                    self.sys.step_control.remove(StepControl::UPDATE_SPINDLE_PWM);
                }
            }

            self.exec_rt_system();
            // Let the deceleration finish while suspended; once parked,
            // yield instead of spinning.
            self.run_stepper_ticks(TICK_PUMP_BATCH);
            if !self.stepper.is_running() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
    }
}
