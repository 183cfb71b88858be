//! Modal G-code executor.
//!
//! One newline's worth of pre-filtered, upcased text in; a status code out.
//! Words are collected, checked against the modal rules, then executed in
//! canonical order: feed mode, feed, spindle speed, spindle state, dwell,
//! units, coordinate select, distance mode, offsets, motion, program flow.
//!
//! All internal positions are machine millimeters; inch input converts at
//! the word boundary. Work coordinates differ from machine coordinates by
//! the active system offset plus the G92 offset.

use std::io::Write;

use cr1_common::axis::{N_AXIS, X_AXIS, Y_AXIS, Z_AXIS};
use cr1_common::codes::Status;
use cr1_common::rt::RtEvent;
use cr1_common::settings::Settings;
use cr1_hal::{Board, NvStorage};

use crate::machine::Machine;
use crate::planner::{Condition, PlanLineData};
use crate::spindle::SpindleState;

/// Inches to millimeters.
const MM_PER_INCH: f32 = 25.4;

/// Coordinate records: G54..G59 then the G28 and G30 stored positions.
pub const N_COORD_RECORDS: usize = 8;
pub const COORD_G28: usize = 6;
pub const COORD_G30: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionMode {
    #[default]
    Seek,
    Linear,
    CwArc,
    CcwArc,
    Probe,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitsMode {
    #[default]
    Mm,
    Inches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMode {
    #[default]
    Absolute,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedRateMode {
    #[default]
    UnitsPerMin,
    InverseTime,
}

/// Active work coordinate system, G54..G59.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordSelect(usize);

impl CoordSelect {
    pub fn from_g_value(g: u16) -> Option<Self> {
        if (54..=59).contains(&g) {
            Some(Self(g as usize - 54))
        } else {
            None
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The persistent modal groups.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModalState {
    pub motion: MotionMode,
    pub feed_rate: FeedRateMode,
    pub units: UnitsMode,
    pub distance: DistanceMode,
    pub coord_select: CoordSelect,
    pub spindle: SpindleState,
}

/// Full parser state.
#[derive(Debug, Clone)]
pub struct GcState {
    pub modal: ModalState,
    /// Programmed feed [mm/min].
    pub feed_rate: f32,
    /// Programmed spindle speed [RPM].
    pub spindle_speed: f32,
    /// Parser position [machine mm].
    pub position: [f32; N_AXIS],
    /// Active coordinate system offset [machine mm].
    pub coord_system: [f32; N_AXIS],
    /// G92 offset [mm].
    pub coord_offset: [f32; N_AXIS],
    /// All stored coordinate records, mirrored from non-volatile memory.
    pub coord_data: [[f32; N_AXIS]; N_COORD_RECORDS],
    pub line_number: u32,
}

impl GcState {
    pub fn new() -> Self {
        Self {
            modal: ModalState::default(),
            feed_rate: 0.0,
            spindle_speed: 0.0,
            position: [0.0; N_AXIS],
            coord_system: [0.0; N_AXIS],
            coord_offset: [0.0; N_AXIS],
            coord_data: [[0.0; N_AXIS]; N_COORD_RECORDS],
            line_number: 0,
        }
    }

    /// Snap the parser position to the machine position.
    pub fn sync_position(&mut self, settings: &Settings, sys_position: &[i32; N_AXIS]) {
        self.position = settings.steps_to_mpos(sys_position);
    }

    /// Refresh the active system offset after a select or data write.
    pub fn load_coord_system(&mut self) {
        self.coord_system = self.coord_data[self.modal.coord_select.index()];
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Word collection ────────────────────────────────────────────────

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct WordFlags: u16 {
        const X = 1 << 0;
        const Y = 1 << 1;
        const Z = 1 << 2;
        const I = 1 << 3;
        const J = 1 << 4;
        const R = 1 << 5;
        const F = 1 << 6;
        const S = 1 << 7;
        const P = 1 << 8;
        const L = 1 << 9;
        const N = 1 << 10;
    }
}

#[derive(Debug, Default)]
struct Words {
    flags: WordFlags,
    xyz: [f32; N_AXIS],
    ijk: [f32; 2],
    r: f32,
    f: f32,
    s: f32,
    p: f32,
    l: u8,
    n: u32,
}

impl Words {
    fn axis_words(&self) -> bool {
        self.flags
            .intersects(WordFlags::X | WordFlags::Y | WordFlags::Z)
    }
}

#[derive(Debug, Default)]
struct Commands {
    motion: Option<MotionMode>,
    // Non-modal position commands are mutually exclusive on a line.
    dwell: bool,
    set_coord_data: bool,
    go_home: Option<usize>,
    set_home: Option<usize>,
    set_offset: bool,
    clear_offset: bool,
    feed_mode: Option<FeedRateMode>,
    units: Option<UnitsMode>,
    distance: Option<DistanceMode>,
    coord_select: Option<CoordSelect>,
    spindle: Option<SpindleState>,
    program_pause: bool,
    program_end: bool,
}

/// Parse a number starting at `idx`; advances past it.
pub(crate) fn read_float(bytes: &[u8], idx: &mut usize) -> Option<f32> {
    let start = *idx;
    let mut end = start;
    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }
    let mut seen_digit = false;
    while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
        seen_digit |= bytes[end].is_ascii_digit();
        end += 1;
    }
    if !seen_digit {
        return None;
    }
    let text = std::str::from_utf8(&bytes[start..end]).ok()?;
    let value = text.parse::<f32>().ok()?;
    *idx = end;
    Some(value)
}

/// Split a G/M number into integer and first decimal digit (38.2 → (38, 2)).
fn split_command(value: f32) -> (u16, u8) {
    let int = value as u16;
    let frac = ((value - int as f32) * 10.0).round() as u8;
    (int, frac)
}

impl<B: Board, N: NvStorage, W: Write> Machine<B, N, W> {
    /// Execute one pre-filtered g-code line.
    pub fn execute_gcode_line(&mut self, line: &str) -> Status {
        self.execute_gcode_internal(line, false)
    }

    pub(crate) fn execute_gcode_internal(&mut self, line: &str, is_jog: bool) -> Status {
        let bytes = line.as_bytes();
        let mut words = Words::default();
        let mut commands = Commands::default();

        // ── Collect words ──
        let mut idx = 0;
        while idx < bytes.len() {
            let letter = bytes[idx];
            idx += 1;
            if !letter.is_ascii_uppercase() {
                return Status::ExpectedCommandLetter;
            }
            let Some(value) = read_float(bytes, &mut idx) else {
                return Status::BadNumberFormat;
            };

            match letter {
                b'G' => {
                    let (int, frac) = split_command(value);
                    if let Err(status) = collect_g(&mut commands, int, frac, is_jog) {
                        return status;
                    }
                }
                b'M' => {
                    if is_jog {
                        return Status::InvalidJogCommand;
                    }
                    let (int, frac) = split_command(value);
                    if frac != 0 {
                        return Status::CommandValueNotInteger;
                    }
                    if let Err(status) = collect_m(&mut commands, int) {
                        return status;
                    }
                }
                _ => {
                    let flag = match letter {
                        b'X' => WordFlags::X,
                        b'Y' => WordFlags::Y,
                        b'Z' => WordFlags::Z,
                        b'I' => WordFlags::I,
                        b'J' => WordFlags::J,
                        b'R' => WordFlags::R,
                        b'F' => WordFlags::F,
                        b'S' => WordFlags::S,
                        b'P' => WordFlags::P,
                        b'L' => WordFlags::L,
                        b'N' => WordFlags::N,
                        _ => return Status::UnsupportedCommand,
                    };
                    if words.flags.contains(flag) {
                        return Status::WordRepeated;
                    }
                    if is_jog
                        && !matches!(letter, b'X' | b'Y' | b'Z' | b'F' | b'N')
                    {
                        return Status::InvalidJogCommand;
                    }
                    words.flags |= flag;
                    match letter {
                        b'X' => words.xyz[X_AXIS] = value,
                        b'Y' => words.xyz[Y_AXIS] = value,
                        b'Z' => words.xyz[Z_AXIS] = value,
                        b'I' => words.ijk[0] = value,
                        b'J' => words.ijk[1] = value,
                        b'R' => words.r = value,
                        b'F' => words.f = value,
                        b'S' => {
                            if value < 0.0 {
                                return Status::NegativeValue;
                            }
                            words.s = value;
                        }
                        b'P' => words.p = value,
                        b'L' => {
                            if value.fract() != 0.0 {
                                return Status::CommandValueNotInteger;
                            }
                            words.l = value as u8;
                        }
                        b'N' => {
                            if value < 0.0 || value > 9_999_999.0 {
                                return Status::InvalidLineNumber;
                            }
                            words.n = value as u32;
                        }
                        _ => unreachable!("letter filtered above"),
                    }
                }
            }
        }

        self.execute_collected(words, commands, is_jog)
    }

    fn execute_collected(
        &mut self,
        words: Words,
        commands: Commands,
        is_jog: bool,
    ) -> Status {
        // ── Modal settings first ──
        if let Some(mode) = commands.feed_mode {
            self.gc.modal.feed_rate = mode;
        }
        if let Some(units) = commands.units {
            self.gc.modal.units = units;
        }

        let unit_scale = match self.gc.modal.units {
            UnitsMode::Mm => 1.0,
            UnitsMode::Inches => MM_PER_INCH,
        };

        if words.flags.contains(WordFlags::F) {
            match self.gc.modal.feed_rate {
                FeedRateMode::UnitsPerMin => self.gc.feed_rate = words.f * unit_scale,
                // Inverse time is per-line; keep the raw 1/min value.
                FeedRateMode::InverseTime => self.gc.feed_rate = words.f,
            }
        } else if self.gc.modal.feed_rate == FeedRateMode::InverseTime
            && commands.motion.is_some_and(|m| m != MotionMode::Seek)
        {
            return Status::UndefinedFeedRate;
        }

        if words.flags.contains(WordFlags::N) {
            self.gc.line_number = words.n;
        }
        if words.flags.contains(WordFlags::S) {
            self.gc.spindle_speed = words.s;
        }

        if is_jog {
            // Jog lines reduce to one straight feed motion.
            if !words.axis_words() {
                return Status::InvalidJogCommand;
            }
            if let Some(mode) = commands.distance {
                self.gc.modal.distance = mode;
            }
            return match self.execute_motion(MotionMode::Linear, &words, unit_scale, true) {
                Some(status) => status,
                None => Status::Ok,
            };
        }

        // ── Spindle state (synchronized with motion) ──
        if let Some(state) = commands.spindle {
            let rpm = self.gc.spindle_speed;
            self.spindle_sync(state, rpm);
            self.gc.modal.spindle = state;
        } else if words.flags.contains(WordFlags::S)
            && self.gc.modal.spindle != SpindleState::Disable
            && commands.motion.is_none()
        {
            // Speed change on a running spindle with no motion on the line.
            let (state, rpm) = (self.gc.modal.spindle, self.gc.spindle_speed);
            self.spindle_sync(state, rpm);
        }

        // ── Dwell ──
        if commands.dwell {
            if !words.flags.contains(WordFlags::P) {
                return Status::ValueWordMissing;
            }
            if words.p < 0.0 {
                return Status::NegativeValue;
            }
            self.mc_dwell(words.p);
        }

        // ── Coordinate system select ──
        if let Some(select) = commands.coord_select {
            self.gc.modal.coord_select = select;
            self.gc.load_coord_system();
            self.flag_wco_change();
        }

        if let Some(mode) = commands.distance {
            self.gc.modal.distance = mode;
        }

        // ── Non-modal offset commands ──
        if commands.set_coord_data {
            if let Some(status) = self.execute_g10(&words, unit_scale) {
                return status;
            }
        }
        if let Some(slot) = commands.set_home {
            let position = self.gc.position;
            self.gc.coord_data[slot] = position;
            self.write_coord_record(slot, &position);
        }
        if commands.set_offset {
            if !words.axis_words() {
                return Status::NoAxisWords;
            }
            for axis in 0..N_AXIS {
                if words.flags.contains(axis_word_flag(axis)) {
                    self.gc.coord_offset[axis] = self.gc.position[axis]
                        - self.gc.coord_system[axis]
                        - words.xyz[axis] * unit_scale;
                }
            }
            self.flag_wco_change();
        }
        if commands.clear_offset {
            self.gc.coord_offset = [0.0; N_AXIS];
            self.flag_wco_change();
        }

        // ── Motion ──
        if let Some(slot) = commands.go_home {
            self.execute_stored_position_move(&words, unit_scale, slot);
            if self.sys.abort {
                return Status::Ok;
            }
        } else if let Some(motion) = commands.motion {
            if let Some(status) = self.execute_motion(motion, &words, unit_scale, is_jog) {
                return status;
            }
            // Probing is one-shot; the motion group reverts to feed motion.
            self.gc.modal.motion = if motion == MotionMode::Probe {
                MotionMode::Linear
            } else {
                motion
            };
        } else if words.axis_words()
            && !commands.set_coord_data
            && !commands.set_offset
            && commands.set_home.is_none()
        {
            // Bare axis words continue the modal motion.
            let motion = self.gc.modal.motion;
            if motion == MotionMode::None {
                return Status::UnusedWords;
            }
            if let Some(status) = self.execute_motion(motion, &words, unit_scale, is_jog) {
                return status;
            }
        }

        // ── Program flow ──
        if commands.program_pause {
            self.buffer_synchronize();
            self.rt.set_state(RtEvent::FEED_HOLD);
        }
        if commands.program_end {
            self.buffer_synchronize();
            self.spindle_sync(SpindleState::Disable, 0.0);
            self.gc.modal = ModalState {
                motion: MotionMode::Linear,
                ..ModalState::default()
            };
            self.gc.load_coord_system();
            self.report.feedback("program end");
        }

        Status::Ok
    }

    /// Work-coordinate target for the axis words under the distance mode.
    fn compute_target(&self, words: &Words, unit_scale: f32) -> [f32; N_AXIS] {
        let mut target = self.gc.position;
        for axis in 0..N_AXIS {
            if words.flags.contains(axis_word_flag(axis)) {
                let value = words.xyz[axis] * unit_scale;
                target[axis] = match self.gc.modal.distance {
                    DistanceMode::Absolute => {
                        value + self.gc.coord_system[axis] + self.gc.coord_offset[axis]
                    }
                    DistanceMode::Incremental => self.gc.position[axis] + value,
                };
            }
        }
        target
    }

    fn execute_motion(
        &mut self,
        motion: MotionMode,
        words: &Words,
        unit_scale: f32,
        is_jog: bool,
    ) -> Option<Status> {
        if !words.axis_words() {
            return Some(Status::NoAxisWords);
        }

        let target = self.compute_target(words, unit_scale);
        if is_jog && crate::limits::check_travel_limits(&self.settings.max_travel, &target) {
            return Some(Status::TravelExceeded);
        }
        let mut pl_data = PlanLineData {
            spindle_speed: self.gc.spindle_speed,
            condition: self.gc.modal.spindle.condition(),
            line_number: Some(self.gc.line_number),
            ..PlanLineData::default()
        };

        match motion {
            MotionMode::Seek => {
                pl_data.condition |= Condition::RAPID_MOTION;
            }
            MotionMode::Linear | MotionMode::CwArc | MotionMode::CcwArc | MotionMode::Probe => {
                if self.gc.feed_rate == 0.0 {
                    return Some(Status::UndefinedFeedRate);
                }
                pl_data.feed_rate = self.gc.feed_rate;
                if self.gc.modal.feed_rate == FeedRateMode::InverseTime {
                    pl_data.condition |= Condition::INVERSE_TIME;
                    // One over the line duration becomes a rate over the
                    // programmed distance.
                    let mut distance = 0.0f32;
                    for axis in 0..N_AXIS {
                        let delta = target[axis] - self.gc.position[axis];
                        distance += delta * delta;
                    }
                    pl_data.feed_rate = self.gc.feed_rate * distance.sqrt();
                }
            }
            MotionMode::None => return Some(Status::UnusedWords),
        }
        if is_jog {
            pl_data.condition |= Condition::NO_FEED_OVERRIDE;
        }

        match motion {
            MotionMode::Seek | MotionMode::Linear => {
                self.mc_line(&target, &pl_data);
            }
            MotionMode::CwArc | MotionMode::CcwArc => {
                let status = self.execute_arc(
                    &target,
                    &mut pl_data,
                    words,
                    unit_scale,
                    motion == MotionMode::CwArc,
                );
                if status != Status::Ok {
                    return Some(status);
                }
            }
            MotionMode::Probe => {
                let status = self.mc_probe_cycle(&target, &pl_data);
                if status != Status::Ok {
                    return Some(status);
                }
            }
            MotionMode::None => {}
        }

        self.gc.position = target;
        None
    }

    fn execute_arc(
        &mut self,
        target: &[f32; N_AXIS],
        pl_data: &mut PlanLineData,
        words: &Words,
        unit_scale: f32,
        is_clockwise: bool,
    ) -> Status {
        let mut position = self.gc.position;

        let offset: [f32; 2] = if words.flags.intersects(WordFlags::I | WordFlags::J) {
            [words.ijk[0] * unit_scale, words.ijk[1] * unit_scale]
        } else if words.flags.contains(WordFlags::R) {
            // Convert the radius form: the center sits on the perpendicular
            // bisector of the chord, picked by radius sign and direction.
            let radius = words.r * unit_scale;
            let x = target[X_AXIS] - position[X_AXIS];
            let y = target[Y_AXIS] - position[Y_AXIS];
            if x == 0.0 && y == 0.0 {
                return Status::InvalidTarget;
            }
            let mut h_x2_div_d = 4.0 * radius * radius - x * x - y * y;
            if h_x2_div_d < 0.0 {
                return Status::ArcRadiusError;
            }
            h_x2_div_d = -h_x2_div_d.sqrt() / (x * x + y * y).sqrt();
            if !is_clockwise {
                h_x2_div_d = -h_x2_div_d;
            }
            if radius < 0.0 {
                h_x2_div_d = -h_x2_div_d;
            }
            [
                0.5 * (x - (y * h_x2_div_d)),
                0.5 * (y + (x * h_x2_div_d)),
            ]
        } else {
            return Status::NoOffsetsInPlane;
        };

        let radius = (offset[0] * offset[0] + offset[1] * offset[1]).sqrt();
        self.mc_arc(target, pl_data, &mut position, &offset, radius, is_clockwise);
        Status::Ok
    }

    /// G28/G30: optional motion through the axis words, then a rapid to the
    /// stored position.
    fn execute_stored_position_move(
        &mut self,
        words: &Words,
        unit_scale: f32,
        slot: usize,
    ) {
        let mut pl_data = PlanLineData {
            condition: Condition::RAPID_MOTION | self.gc.modal.spindle.condition(),
            spindle_speed: self.gc.spindle_speed,
            line_number: Some(self.gc.line_number),
            ..PlanLineData::default()
        };
        if words.axis_words() {
            let intermediate = self.compute_target(words, unit_scale);
            self.mc_line(&intermediate, &pl_data);
            if self.sys.abort {
                return;
            }
            self.gc.position = intermediate;
        }
        let stored = self.gc.coord_data[slot];
        pl_data.line_number = Some(self.gc.line_number);
        self.mc_line(&stored, &pl_data);
        self.gc.position = stored;
    }

    /// G10 L2/L20: write a coordinate system record.
    fn execute_g10(&mut self, words: &Words, unit_scale: f32) -> Option<Status> {
        if !words.flags.contains(WordFlags::P) {
            return Some(Status::ValueWordMissing);
        }
        let p = words.p as usize;
        if words.p.fract() != 0.0 {
            return Some(Status::CommandValueNotInteger);
        }
        // P0 means the active system.
        let slot = if p == 0 {
            self.gc.modal.coord_select.index()
        } else if (1..=6).contains(&p) {
            p - 1
        } else {
            return Some(Status::UnsupportedCoordSys);
        };

        let mut record = self.gc.coord_data[slot];
        for axis in 0..N_AXIS {
            if words.flags.contains(axis_word_flag(axis)) {
                let value = words.xyz[axis] * unit_scale;
                record[axis] = match words.l {
                    2 => value,
                    // L20: make the current position read as `value`.
                    20 => self.gc.position[axis] - self.gc.coord_offset[axis] - value,
                    _ => return Some(Status::ValueWordMissing),
                };
            }
        }
        self.gc.coord_data[slot] = record;
        if slot == self.gc.modal.coord_select.index() {
            self.gc.load_coord_system();
        }
        self.write_coord_record(slot, &record);
        self.flag_wco_change();
        None
    }

    /// A work-coordinate offset changed: drain motion that was planned
    /// against the old offsets, and re-report WCO promptly.
    fn flag_wco_change(&mut self) {
        self.buffer_synchronize();
        self.sys.report_wco_counter = 0;
    }
}

fn axis_word_flag(axis: usize) -> WordFlags {
    match axis {
        X_AXIS => WordFlags::X,
        Y_AXIS => WordFlags::Y,
        _ => WordFlags::Z,
    }
}

fn collect_g(
    commands: &mut Commands,
    int: u16,
    frac: u8,
    is_jog: bool,
) -> Result<(), Status> {
    let set_motion = |commands: &mut Commands, mode| {
        if commands.motion.is_some() {
            Err(Status::ModalGroupViolation)
        } else {
            commands.motion = Some(mode);
            Ok(())
        }
    };

    if is_jog {
        // Jog lines accept only units and distance overrides.
        return match (int, frac) {
            (20, 0) => {
                commands.units = Some(UnitsMode::Inches);
                Ok(())
            }
            (21, 0) => {
                commands.units = Some(UnitsMode::Mm);
                Ok(())
            }
            (90, 0) => {
                commands.distance = Some(DistanceMode::Absolute);
                Ok(())
            }
            (91, 0) => {
                commands.distance = Some(DistanceMode::Incremental);
                Ok(())
            }
            _ => Err(Status::InvalidJogCommand),
        };
    }

    match (int, frac) {
        (0, 0) => set_motion(commands, MotionMode::Seek),
        (1, 0) => set_motion(commands, MotionMode::Linear),
        (2, 0) => set_motion(commands, MotionMode::CwArc),
        (3, 0) => set_motion(commands, MotionMode::CcwArc),
        (38, 2) => set_motion(commands, MotionMode::Probe),
        (80, 0) => set_motion(commands, MotionMode::None),
        (4, 0) => {
            commands.dwell = true;
            Ok(())
        }
        (10, 0) => {
            commands.set_coord_data = true;
            Ok(())
        }
        (17, 0) => Ok(()), // XY plane is the only supported plane.
        (20, 0) => {
            commands.units = Some(UnitsMode::Inches);
            Ok(())
        }
        (21, 0) => {
            commands.units = Some(UnitsMode::Mm);
            Ok(())
        }
        (28, 0) => {
            commands.go_home = Some(COORD_G28);
            Ok(())
        }
        (28, 1) => {
            commands.set_home = Some(COORD_G28);
            Ok(())
        }
        (30, 0) => {
            commands.go_home = Some(COORD_G30);
            Ok(())
        }
        (30, 1) => {
            commands.set_home = Some(COORD_G30);
            Ok(())
        }
        (54..=59, 0) => {
            commands.coord_select = CoordSelect::from_g_value(int);
            Ok(())
        }
        (90, 0) => {
            commands.distance = Some(DistanceMode::Absolute);
            Ok(())
        }
        (91, 0) => {
            commands.distance = Some(DistanceMode::Incremental);
            Ok(())
        }
        (92, 0) => {
            commands.set_offset = true;
            Ok(())
        }
        (92, 1) => {
            commands.clear_offset = true;
            Ok(())
        }
        (93, 0) => {
            commands.feed_mode = Some(FeedRateMode::InverseTime);
            Ok(())
        }
        (94, 0) => {
            commands.feed_mode = Some(FeedRateMode::UnitsPerMin);
            Ok(())
        }
        _ => Err(Status::UnsupportedCommand),
    }
}

fn collect_m(commands: &mut Commands, int: u16) -> Result<(), Status> {
    match int {
        0 => {
            commands.program_pause = true;
            Ok(())
        }
        2 | 30 => {
            commands.program_end = true;
            Ok(())
        }
        3 => {
            commands.spindle = Some(SpindleState::Cw);
            Ok(())
        }
        4 => {
            commands.spindle = Some(SpindleState::Ccw);
            Ok(())
        }
        5 => {
            commands.spindle = Some(SpindleState::Disable);
            Ok(())
        }
        _ => Err(Status::UnsupportedCommand),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_float_parses_signed_decimals() {
        let bytes = b"-12.5X";
        let mut idx = 0;
        assert_eq!(read_float(bytes, &mut idx), Some(-12.5));
        assert_eq!(idx, 5);
        let mut idx = 0;
        assert_eq!(read_float(b"X", &mut idx), None);
    }

    #[test]
    fn split_command_separates_mantissa() {
        assert_eq!(split_command(38.2), (38, 2));
        assert_eq!(split_command(92.1), (92, 1));
        assert_eq!(split_command(0.0), (0, 0));
        assert_eq!(split_command(30.0), (30, 0));
    }

    #[test]
    fn coord_select_range() {
        assert_eq!(CoordSelect::from_g_value(54).unwrap().index(), 0);
        assert_eq!(CoordSelect::from_g_value(59).unwrap().index(), 5);
        assert!(CoordSelect::from_g_value(60).is_none());
    }

    #[test]
    fn collect_rejects_double_motion() {
        let mut commands = Commands::default();
        assert!(collect_g(&mut commands, 0, 0, false).is_ok());
        assert_eq!(
            collect_g(&mut commands, 1, 0, false),
            Err(Status::ModalGroupViolation)
        );
    }

    #[test]
    fn jog_words_restricted() {
        let mut commands = Commands::default();
        assert_eq!(
            collect_g(&mut commands, 0, 0, true),
            Err(Status::InvalidJogCommand)
        );
        assert!(collect_g(&mut commands, 91, 0, true).is_ok());
    }
}
