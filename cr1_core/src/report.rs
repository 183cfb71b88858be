//! Serial reporting: line responses, alarms, feedback messages, and the
//! realtime `?` status frame.
//!
//! Formats are part of the wire protocol consumed by sender GUIs; field
//! prefixes and numeric precision must stay stable. Write failures degrade
//! reporting only, never control, so they are logged and swallowed here.

use std::fmt;
use std::io::Write;

use cr1_common::axis::{axis_bit, axis_letter, N_AXIS};
use cr1_common::codes::{Alarm, Status};
use cr1_common::consts::{
    REPORT_OVR_REFRESH_BUSY_COUNT, REPORT_OVR_REFRESH_IDLE_COUNT, REPORT_WCO_REFRESH_BUSY_COUNT,
    REPORT_WCO_REFRESH_IDLE_COUNT,
};
use cr1_common::settings::{SettingValue, SettingsFlags, StatusReportMask, DUMP_ORDER};
use cr1_common::state::{MachineState, Suspend};
use cr1_hal::{Board, NvStorage};
use tracing::warn;

use crate::gcode::{DistanceMode, FeedRateMode, MotionMode, UnitsMode, N_COORD_RECORDS};
use crate::machine::Machine;
use crate::spindle::SpindleState;

/// Firmware identity in the welcome banner and `$I`.
pub const FIRMWARE_VERSION: &str = "1.1f";
pub const FIRMWARE_BUILD: &str = "20170801";

/// Serial output side with swallow-and-log error policy.
pub struct Reporter<W: Write> {
    out: W,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Access the underlying writer (host wiring and test capture).
    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.out
    }

    fn emit(&mut self, args: fmt::Arguments) {
        if let Err(e) = self.out.write_fmt(args) {
            warn!(error = %e, "serial write failed");
        }
        let _ = self.out.flush();
    }

    /// Boot banner.
    pub fn welcome(&mut self) {
        self.emit(format_args!("\r\nGrbl {FIRMWARE_VERSION} [help:'$']\r\n"));
    }

    /// Per-line response: `ok` or `[MSG:…]` + `error:<n>`.
    pub fn status(&mut self, status: Status) {
        if status == Status::Ok {
            self.emit(format_args!("ok\r\n"));
        } else {
            self.emit(format_args!("[MSG:{}]\r\n", status.message()));
            self.emit(format_args!("error:{}\r\n", status.code()));
        }
    }

    /// Alarm annunciation: `[MSG:…]` + `ALARM:<n>`.
    pub fn alarm(&mut self, alarm: Alarm) {
        self.emit(format_args!("[MSG:{}]\r\n", alarm.message()));
        self.emit(format_args!("ALARM:{}\r\n", alarm.code()));
    }

    /// Non-error operator feedback.
    pub fn feedback(&mut self, message: &str) {
        self.emit(format_args!("[MSG:{message}]\r\n"));
    }

    pub fn feedback_fmt(&mut self, args: fmt::Arguments) {
        self.emit(format_args!("[MSG:"));
        self.emit(args);
        self.emit(format_args!("]\r\n"));
    }

    /// Echo of an offending line.
    pub fn echo_line(&mut self, line: &str) {
        self.emit(format_args!("[echo: {line}]\r\n"));
    }

    /// Startup-line execution result: `><line>:` then the status response.
    pub fn startup_result(&mut self, line: &str, status: Status) {
        self.emit(format_args!(">{line}:"));
        self.status(status);
    }

    /// A stored startup line for `$N`.
    pub fn startup_line(&mut self, n: u8, line: &str) {
        self.emit(format_args!("$N{n}={line}\r\n"));
    }

    /// The console help summary.
    pub fn help(&mut self) {
        for entry in [
            "[ ? status]",
            "[$H home]",
            "[$X unlock]",
            "[$G state]",
            "[$I version]",
            "[$L levelX]",
            "[$C check]",
            "[$# offsets]",
            "[$$ settings]",
            "[$_=_ set]",
        ] {
            self.emit(format_args!("{entry}\r\n"));
        }
    }

    /// One `$$` line. Axis settings carry their axis letter and unit.
    pub fn setting(&mut self, index: u8, value: SettingValue, annotation: &str) {
        match value {
            SettingValue::Int(v) => self.emit(format_args!("${index}={v} ({annotation})\r\n")),
            SettingValue::Bool(v) => {
                self.emit(format_args!("${index}={} ({annotation})\r\n", v as u8))
            }
            SettingValue::Float(v) => {
                self.emit(format_args!("${index}={v:.3} ({annotation})\r\n"))
            }
        }
    }

    fn axis_values(&mut self, values: &[f32; N_AXIS]) {
        self.emit(format_args!(
            "{:.3},{:.3},{:.3}",
            values[0], values[1], values[2]
        ));
    }

    /// One `[G5x:…]`-style coordinate record.
    pub fn coord_record(&mut self, label: &str, values: &[f32; N_AXIS]) {
        self.emit(format_args!("[{label}:"));
        self.axis_values(values);
        self.emit(format_args!("]\r\n"));
    }

    /// Probe record with the success flag.
    pub fn probe_record(&mut self, values: &[f32; N_AXIS], succeeded: bool) {
        self.emit(format_args!("[PRB:"));
        self.axis_values(values);
        self.emit(format_args!(":{}]\r\n", succeeded as u8));
    }

    /// Build info: firmware identity plus the stored extension line.
    pub fn build_info(&mut self, machine_rev: &str, pcb_rev: &str, stored: &str) {
        self.emit(format_args!(
            "[grbl:{FIRMWARE_VERSION} CR:{machine_rev} PCB:{pcb_rev} YMD:{FIRMWARE_BUILD}]\r\n"
        ));
        if !stored.is_empty() {
            self.emit(format_args!("[{stored}]\r\n"));
        }
    }

    /// Manufacturing notes for `$B`.
    pub fn manf_notes(&mut self, notes: &str) {
        self.emit(format_args!("[B:{notes}]\r\n"));
    }

    /// One 16-byte row of the storage dump.
    pub fn nvs_row(&mut self, address: usize, bytes: &[u8]) {
        self.emit(format_args!("x{address}"));
        for b in bytes {
            self.emit(format_args!("\t{b}"));
        }
        self.emit(format_args!("\r\n"));
    }
}

/// Annotation text for the `$$` dump.
fn setting_annotation(index: u8) -> &'static str {
    match index {
        0 => "stepPulse",
        1 => "idleDelay",
        2 => "stepMask",
        3 => "dirMask",
        4 => "stepEn",
        5 => "limLVL",
        6 => "prbLVL",
        10 => "statMask",
        11 => "jncDev",
        12 => "arcTol",
        13 => "Inch",
        20 => "softLim",
        21 => "hardLim",
        22 => "homeEn",
        23 => "homeDirMask",
        24 => "homeFine",
        25 => "homeSeek",
        26 => "homeDelay",
        27 => "homePulloff",
        100 => "X:stp/mm",
        101 => "Y:stp/mm",
        102 => "Z:stp/mm",
        110 => "X:mm/min",
        111 => "Y:mm/min",
        112 => "Z:mm/min",
        120 => "X:mm/s^2",
        121 => "Y:mm/s^2",
        122 => "Z:mm/s^2",
        130 => "X:mm",
        131 => "Y:mm",
        132 => "Z:mm",
        30 => "rpmMax",
        31 => "rpmMin",
        _ => "",
    }
}

impl<B: Board, N: NvStorage, W: Write> Machine<B, N, W> {
    /// The `$$` settings dump.
    pub fn report_settings(&mut self) {
        for index in DUMP_ORDER {
            if let Some(value) = self.settings.get(index) {
                self.report.setting(index, value, setting_annotation(index));
            }
        }
    }

    /// The `$#` coordinate-offset dump.
    pub fn report_ngc_parameters(&mut self) {
        for select in 0..N_COORD_RECORDS {
            let values = self.gc.coord_data[select];
            let label = match select {
                6 => "G28".to_string(),
                7 => "G30".to_string(),
                n => format!("G{}", 54 + n),
            };
            self.report.coord_record(&label, &values);
        }
        let g92 = self.gc.coord_offset;
        self.report.coord_record("G92", &g92);
        self.report.coord_record("TLO", &[0.0; N_AXIS]);
        let probe = self.settings.steps_to_mpos(&self.sys.probe_position);
        self.report.probe_record(&probe, self.sys.probe_succeeded);
    }

    /// The `$G` parser-state line.
    pub fn report_gcode_modes(&mut self) {
        let motion = match self.gc.modal.motion {
            MotionMode::Seek => "G0",
            MotionMode::Linear => "G1",
            MotionMode::CwArc => "G2",
            MotionMode::CcwArc => "G3",
            MotionMode::Probe => "G38.2",
            MotionMode::None => "G80",
        };
        let coord = 54 + self.gc.modal.coord_select.index() as u8;
        let units = match self.gc.modal.units {
            UnitsMode::Mm => "G21",
            UnitsMode::Inches => "G20",
        };
        let distance = match self.gc.modal.distance {
            DistanceMode::Absolute => "G90",
            DistanceMode::Incremental => "G91",
        };
        let feed = match self.gc.modal.feed_rate {
            FeedRateMode::UnitsPerMin => "G94",
            FeedRateMode::InverseTime => "G93",
        };
        let spindle = match self.gc.modal.spindle {
            SpindleState::Disable => "M5",
            SpindleState::Cw => "M3",
            SpindleState::Ccw => "M4",
        };
        let feed_rate = self.gc.feed_rate;
        let rpm = self.gc.spindle_speed;
        self.report.emit(format_args!(
            "[GC:{motion} G{coord} G17 {units} {distance} {feed} {spindle} T0 F{feed_rate:.0} S{rpm:.0}]\r\n"
        ));
    }

    /// Build-info record for `$I`.
    pub fn report_build_info(&mut self) {
        let machine_rev = self.read_machine_revision();
        let pcb_rev = self.read_pcb_revision();
        let stored = self.read_build_info_line().unwrap_or_default();
        self.report.build_info(&machine_rev, &pcb_rev, &stored);
    }

    /// The whole storage image for `$E`.
    pub fn report_nvs_dump(&mut self) {
        let len = self.nvs.len();
        let mut address = 0;
        while address < len {
            let row_len = 16.min(len - address);
            let mut row = [0u8; 16];
            for (i, slot) in row.iter_mut().enumerate().take(row_len) {
                *slot = self.nvs.read_byte(address + i);
            }
            self.report.nvs_row(address, &row[..row_len]);
            address += row_len;
        }
    }

    /// The realtime `?` status frame.
    pub fn report_realtime_status(&mut self) {
        // Snapshot position first; the tick mutates it concurrently with
        // respect to the protocol's view of time.
        let position = self.sys.position;
        let mut print_position = self.settings.steps_to_mpos(&position);

        let state_label: String = match self.sys.state {
            MachineState::Idle => "Idle".into(),
            MachineState::Cycle => "Run".into(),
            MachineState::Hold if !self.sys.suspend.contains(Suspend::JOG_CANCEL) => {
                if self.sys.suspend.contains(Suspend::HOLD_COMPLETE) {
                    "Hold:0".into()
                } else {
                    "Hold:1".into()
                }
            }
            MachineState::Hold | MachineState::Jog => "Jog".into(),
            MachineState::Homing => "Home".into(),
            MachineState::Alarm => "Alarm".into(),
            MachineState::CheckMode => "Check".into(),
            MachineState::Sleep => "Sleep".into(),
        };

        // Work coordinate offset, used by both the position field and the
        // slow-refresh WCO field.
        let mut wco = [0.0f32; N_AXIS];
        for idx in 0..N_AXIS {
            wco[idx] = self.gc.coord_system[idx] + self.gc.coord_offset[idx];
        }

        let machine_position = self
            .settings
            .status_report_mask
            .contains(StatusReportMask::POSITION_TYPE);
        if !machine_position {
            for idx in 0..N_AXIS {
                print_position[idx] -= wco[idx];
            }
        }

        // Inch reporting scales every linear field on the way out.
        let unit_scale = if self.settings.flags.contains(SettingsFlags::REPORT_INCHES) {
            1.0 / 25.4
        } else {
            1.0
        };
        for idx in 0..N_AXIS {
            print_position[idx] *= unit_scale;
            wco[idx] *= unit_scale;
        }

        self.report.emit(format_args!("<{state_label}"));
        if machine_position {
            self.report.emit(format_args!("|M:"));
        } else {
            self.report.emit(format_args!("|W:"));
        }
        self.report.axis_values(&print_position);

        if self
            .settings
            .status_report_mask
            .contains(StatusReportMask::BUFFER_STATE)
        {
            self.report.emit(format_args!(
                "|B:{},{}",
                self.planner.block_buffer_available(),
                self.serial_rx_available
            ));
        }

        let line_number = self
            .planner
            .current_block()
            .and_then(|block| block.line_number)
            .unwrap_or(0);
        self.report.emit(format_args!("|L:{line_number}"));

        let rate = self.stepper.realtime_rate(self.sys.state) * unit_scale;
        self.report
            .emit(format_args!("|FS:{rate:.0},{:.0}", self.sys.spindle_speed));

        // Pin states: probe then one slot per axis limit.
        let probe = self.probe_triggered();
        let limits = self.limit_state();
        self.report
            .emit(format_args!("|{}", if probe { 'P' } else { '0' }));
        for idx in 0..N_AXIS {
            if limits & axis_bit(idx) != 0 {
                self.report.emit(format_args!("{}", axis_letter(idx)));
            } else {
                self.report.emit(format_args!("0"));
            }
        }

        let busy = matches!(
            self.sys.state,
            MachineState::Homing | MachineState::Cycle | MachineState::Hold | MachineState::Jog
        );

        if self.sys.report_wco_counter > 0 {
            self.sys.report_wco_counter -= 1;
        } else {
            self.sys.report_wco_counter = if busy {
                REPORT_WCO_REFRESH_BUSY_COUNT - 1
            } else {
                REPORT_WCO_REFRESH_IDLE_COUNT - 1
            };
            if self.sys.report_ovr_counter == 0 {
                // Stagger so both fields never crowd one report.
                self.sys.report_ovr_counter = 1;
            }
            self.report.emit(format_args!("|W:"));
            self.report.axis_values(&wco);
        }

        if self.sys.report_ovr_counter > 0 {
            self.sys.report_ovr_counter -= 1;
        } else {
            self.sys.report_ovr_counter = if busy {
                REPORT_OVR_REFRESH_BUSY_COUNT - 1
            } else {
                REPORT_OVR_REFRESH_IDLE_COUNT - 1
            };
            self.report.emit(format_args!(
                "|Ov:{},{},{}",
                self.sys.f_override, self.sys.r_override, self.sys.spindle_speed_ovr
            ));
            match self.spindle.state {
                SpindleState::Cw => self.report.emit(format_args!("|A:S")),
                SpindleState::Ccw => self.report.emit(format_args!("|A:C")),
                SpindleState::Disable => {}
            }
        }

        self.report.emit(format_args!(">\r\n"));
    }
}
