//! `$J=` jogging.
//!
//! Jog lines run through the g-code word machinery with a restricted
//! vocabulary and never touch the parser's modal state beyond position.
//! The target is validated against the machine envelope before buffering (a
//! jog must never alarm), the motion runs in the JOG state, and the
//! jog-cancel realtime command flushes it wholesale.

use std::io::Write;

use cr1_common::codes::Status;
use cr1_common::state::MachineState;
use cr1_hal::{Board, NvStorage};

use crate::machine::Machine;

impl<B: Board, N: NvStorage, W: Write> Machine<B, N, W> {
    /// Execute the body of a `$J=` line (everything after the `=`).
    pub fn execute_jog(&mut self, body: &str) -> Status {
        if body.is_empty() {
            return Status::InvalidJogCommand;
        }

        // Jogs may override units/distance for the one line, but the g-code
        // modal state they run through must come out untouched.
        let saved_modal = self.gc.modal;
        let saved_feed = self.gc.feed_rate;
        let saved_line = self.gc.line_number;
        let position_before = self.gc.position;

        let status = self.execute_gcode_internal(body, true);

        self.gc.modal = saved_modal;
        self.gc.feed_rate = saved_feed;
        self.gc.line_number = saved_line;
        if status != Status::Ok {
            self.gc.position = position_before;
            return status;
        }

        if self.sys.state == MachineState::Idle && self.planner.current_block().is_some() {
            self.sys.state = MachineState::Jog;
            self.stepper
                .prep_buffer(&mut self.planner, &self.settings, &mut self.sys);
            self.stepper.wake_up(&mut self.board);
        }
        Status::Ok
    }
}
