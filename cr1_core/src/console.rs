//! `$` console commands.
//!
//! One pre-filtered `$`-line in, a status code out. Commands that touch
//! storage or start machine-level routines require the machine idle (or in
//! alarm, for the recovery commands); the report-only commands run anywhere
//! it is safe to spend the time.

use std::io::Write;

use cr1_common::axis::{X_AXIS, Y_AXIS, Z_AXIS};
use cr1_common::codes::Status;
use cr1_common::consts::LINE_BUFFER_LEN;
use cr1_common::rt::RtEvent;
use cr1_common::settings::{RestoreMask, SettingsFlags};
use cr1_common::state::MachineState;
use cr1_hal::{Board, NvStorage};
use tracing::info;

use crate::gcode::read_float;
use crate::machine::Machine;

impl<B: Board, N: NvStorage, W: Write> Machine<B, N, W> {
    /// Execute one `$` line.
    pub fn execute_console_line(&mut self, line: &str) -> Status {
        let bytes = line.as_bytes();
        debug_assert_eq!(bytes.first(), Some(&b'$'));

        match bytes.get(1) {
            // Bare `$`: help.
            None => {
                self.report.help();
                Status::Ok
            }

            Some(b'J') => {
                if !matches!(self.sys.state, MachineState::Idle | MachineState::Jog) {
                    return Status::IdleError;
                }
                if bytes.get(2) != Some(&b'=') {
                    return Status::InvalidStatement;
                }
                self.execute_jog(&line[3..])
            }

            Some(&(c @ (b'$' | b'G' | b'C' | b'X'))) => {
                if bytes.len() != 2 {
                    return Status::InvalidStatement;
                }
                match c {
                    b'$' => {
                        // Printing mid-cycle would stall the stream.
                        if matches!(self.sys.state, MachineState::Cycle | MachineState::Hold) {
                            return Status::IdleError;
                        }
                        self.report_settings();
                        Status::Ok
                    }
                    b'G' => {
                        self.report_gcode_modes();
                        Status::Ok
                    }
                    b'C' => self.toggle_check_mode(),
                    _ => {
                        // `$X`: clear the alarm lock without homing.
                        if self.sys.state == MachineState::Alarm {
                            self.report.feedback("unlocked");
                            self.sys.state = MachineState::Idle;
                        }
                        Status::Ok
                    }
                }
            }

            // Everything else requires the machine parked.
            Some(_) => {
                if !matches!(self.sys.state, MachineState::Idle | MachineState::Alarm) {
                    return Status::IdleError;
                }
                self.execute_parked_command(line)
            }
        }
    }

    fn toggle_check_mode(&mut self) -> Status {
        if self.sys.state == MachineState::CheckMode {
            // Leaving check mode resets, so stale parser state cannot leak.
            self.mc_reset();
            self.report.feedback("check mode off");
        } else {
            if self.sys.state != MachineState::Idle {
                return Status::IdleError;
            }
            self.sys.state = MachineState::CheckMode;
            self.report.feedback("check mode on");
        }
        Status::Ok
    }

    fn execute_parked_command(&mut self, line: &str) -> Status {
        let bytes = line.as_bytes();
        match bytes[1] {
            b'#' => {
                if bytes.len() != 2 {
                    return Status::InvalidStatement;
                }
                self.report_ngc_parameters();
                Status::Ok
            }

            b'H' => self.execute_home_command(bytes),

            b'E' => {
                if bytes.len() != 2 {
                    return Status::InvalidStatement;
                }
                self.report_nvs_dump();
                Status::Ok
            }

            b'L' => self.execute_level_command(bytes),

            b'S' => {
                // `$SLP`
                if bytes.len() != 4 || bytes[1..4] != *b"SLP" {
                    return Status::InvalidStatement;
                }
                self.rt.set_state(RtEvent::SLEEP);
                Status::Ok
            }

            b'B' => {
                if bytes.len() == 2 {
                    match self.read_manf_notes() {
                        Some(notes) => self.report.manf_notes(&notes),
                        None => return Status::SettingReadFail,
                    }
                    Status::Ok
                } else if bytes[2] == b'=' {
                    self.store_manf_notes(&line[3..]);
                    Status::Ok
                } else {
                    Status::InvalidStatement
                }
            }

            b'I' => {
                if bytes.len() == 2 {
                    self.report_build_info();
                    Status::Ok
                } else if bytes[2] == b'=' {
                    self.store_build_info_line(&line[3..]);
                    Status::Ok
                } else {
                    Status::InvalidStatement
                }
            }

            b'R' => {
                // `$RST=<target>`
                if bytes.len() != 6 || bytes[1..5] != *b"RST=" {
                    return Status::InvalidStatement;
                }
                let mask = match bytes[5] {
                    b'$' => RestoreMask::DEFAULTS,
                    b'#' => RestoreMask::PARAMETERS,
                    b'*' => RestoreMask::ALL,
                    _ => return Status::InvalidStatement,
                };
                info!(?mask, "restoring storage");
                self.settings_restore(mask);
                self.report.feedback("restoring defaults");
                self.mc_reset();
                Status::Ok
            }

            b'N' => {
                if bytes.len() == 2 {
                    for n in 0..2u8 {
                        match self.read_startup_line(n) {
                            Ok(stored) => self
                                .report
                                .startup_line(n, stored.as_deref().unwrap_or("")),
                            Err(()) => return Status::SettingReadFail,
                        }
                    }
                    Status::Ok
                } else {
                    self.execute_startup_line_store(line)
                }
            }

            _ => self.execute_numbered_setting(line),
        }
    }

    fn execute_home_command(&mut self, bytes: &[u8]) -> Status {
        if !self.settings.flags.contains(SettingsFlags::HOMING_ENABLE) {
            return Status::SettingDisabled;
        }
        let full_cycle = bytes.len() == 2;
        let mask = if full_cycle {
            0
        } else if bytes.len() == 3 {
            match bytes[2] {
                b'X' => 1 << X_AXIS,
                b'Y' => 1 << Y_AXIS,
                b'Z' => 1 << Z_AXIS,
                _ => return Status::InvalidStatement,
            }
        } else {
            return Status::InvalidStatement;
        };

        self.sys.state = MachineState::Homing;
        self.mc_homing_cycle(mask);
        if !self.sys.abort {
            self.sys.state = MachineState::Idle;
            let state = self.sys.state;
            self.stepper
                .go_idle(&mut self.board, &self.settings, state, false);
            if full_cycle {
                self.execute_startup_lines();
            }
        }
        Status::Ok
    }

    fn execute_level_command(&mut self, bytes: &[u8]) -> Status {
        self.sys.state = MachineState::Homing;
        let status = if bytes.len() == 2 {
            // `$L`: clear Z, then iterate the squaring routine until the
            // gantry converges.
            self.mc_homing_cycle(1 << Z_AXIS);
            for _ in 0..3 {
                if self.sys.abort {
                    break;
                }
                self.mc_autolevel_x();
            }
            Status::Ok
        } else if bytes.len() == 3 && bytes[2] == b'S' {
            // `$LS`: store the current rack as the squareness datum.
            self.mc_x_is_level();
            Status::Ok
        } else {
            self.sys.state = MachineState::Idle;
            return Status::InvalidStatement;
        };

        if !self.sys.abort {
            self.sys.state = MachineState::Idle;
            let state = self.sys.state;
            self.stepper
                .go_idle(&mut self.board, &self.settings, state, false);
        }
        status
    }

    /// `$N<n>=<line>`: validate the block by executing it, then store it.
    fn execute_startup_line_store(&mut self, line: &str) -> Status {
        // Storing is blocked in alarm: a stored motion must never run blind.
        if self.sys.state != MachineState::Idle {
            return Status::IdleError;
        }
        let bytes = line.as_bytes();
        let mut idx = 2;
        let Some(n) = read_float(bytes, &mut idx) else {
            return Status::InvalidStatement;
        };
        if n.fract() != 0.0 || !(0.0..2.0).contains(&n) {
            return Status::InvalidStatement;
        }
        if bytes.get(idx) != Some(&b'=') {
            return Status::InvalidStatement;
        }
        let block = &line[idx + 1..];
        if block.len() >= LINE_BUFFER_LEN - 2 {
            return Status::Overflow;
        }
        let status = self.execute_gcode_line(block);
        if status != Status::Ok {
            return status;
        }
        self.store_startup_line(n as u8, block);
        Status::Ok
    }

    /// `$<n>=<v>`: store one numbered setting.
    fn execute_numbered_setting(&mut self, line: &str) -> Status {
        let bytes = line.as_bytes();
        let mut idx = 1;
        let Some(parameter) = read_float(bytes, &mut idx) else {
            return Status::InvalidStatement;
        };
        if bytes.get(idx) != Some(&b'=') {
            return Status::InvalidStatement;
        }
        idx += 1;
        let Some(value) = read_float(bytes, &mut idx) else {
            return Status::InvalidStatement;
        };
        if idx != bytes.len() || parameter < 0.0 || parameter > 255.0 {
            return Status::InvalidStatement;
        }
        self.store_global_setting(parameter as u8, value)
    }
}
