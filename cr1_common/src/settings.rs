//! Persisted machine settings.
//!
//! The settings record mirrors the numbered `$<n>=<v>` protocol: every field
//! is reachable by its setting index, and the dump order of `$$` is fixed.
//! Axis-indexed settings start at 100 and step by 10 per group.
//!
//! Internal units: rates are mm/min, acceleration is stored mm/min² (entered
//! and displayed as mm/s²), max travel is stored negative (entered and
//! displayed positive). The machine envelope is all-negative space below
//! machine zero.

use bitflags::bitflags;

use crate::axis::N_AXIS;
use crate::codes::Status;

/// Version tag stored at byte 0 of non-volatile memory. A mismatch wipes and
/// restores everything.
pub const SETTINGS_VERSION: u8 = 11;

/// First axis-settings index; groups step by 10.
pub const AXIS_SETTINGS_START: u8 = 100;
pub const AXIS_SETTINGS_INCREMENT: u8 = 10;

bitflags! {
    /// Boolean settings packed into one byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SettingsFlags: u8 {
        const REPORT_INCHES     = 1 << 0;
        const INVERT_ST_ENABLE  = 1 << 2;
        const HARD_LIMIT_ENABLE = 1 << 3;
        const HOMING_ENABLE     = 1 << 4;
        const SOFT_LIMIT_ENABLE = 1 << 5;
        const INVERT_LIMIT_PINS = 1 << 6;
        const INVERT_PROBE_PIN  = 1 << 7;
    }
}

bitflags! {
    /// Status-report field selection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusReportMask: u8 {
        /// Report machine position instead of work position.
        const POSITION_TYPE = 1 << 0;
        /// Report planner/serial buffer availability.
        const BUFFER_STATE  = 1 << 1;
    }
}

bitflags! {
    /// Which regions a restore operation wipes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RestoreMask: u8 {
        const DEFAULTS      = 1 << 0;
        const PARAMETERS    = 1 << 1;
        const STARTUP_LINES = 1 << 2;
        const BUILD_INFO    = 1 << 3;
    }
}

impl RestoreMask {
    pub const ALL: Self = Self::all();
}

/// The global settings record.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    // Axis settings
    pub steps_per_mm: [f32; N_AXIS],
    /// [mm/min]
    pub max_rate: [f32; N_AXIS],
    /// [mm/min²]
    pub acceleration: [f32; N_AXIS],
    /// Stored negative [mm].
    pub max_travel: [f32; N_AXIS],

    pub pulse_microseconds: u8,
    pub step_invert_mask: u8,
    pub dir_invert_mask: u8,
    /// [ms]; 255 keeps drivers energized forever.
    pub stepper_idle_lock_time: u8,
    pub status_report_mask: StatusReportMask,
    /// [mm]
    pub junction_deviation: f32,
    /// [mm]
    pub arc_tolerance: f32,

    pub rpm_max: f32,
    pub rpm_min: f32,

    pub flags: SettingsFlags,

    pub homing_dir_mask: u8,
    /// Locate-pass rate [mm/min].
    pub homing_feed_rate: f32,
    /// Search-pass rate [mm/min].
    pub homing_seek_rate: f32,
    /// [ms]
    pub homing_debounce_delay: u16,
    /// [mm]
    pub homing_pulloff: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            steps_per_mm: [400.0, 400.0, 400.0],
            max_rate: [2540.0, 3100.0, 3100.0],
            // 500 mm/s², stored mm/min².
            acceleration: [500.0 * 3600.0, 500.0 * 3600.0, 500.0 * 3600.0],
            max_travel: [-86.5, -241.5, -78.5],
            pulse_microseconds: 10,
            step_invert_mask: 0,
            dir_invert_mask: 0,
            stepper_idle_lock_time: 100,
            status_report_mask: StatusReportMask::from_bits_truncate(127),
            junction_deviation: 0.02,
            arc_tolerance: 0.002,
            rpm_max: 8500.0,
            rpm_min: 1360.0,
            flags: SettingsFlags::HARD_LIMIT_ENABLE
                | SettingsFlags::HOMING_ENABLE
                | SettingsFlags::SOFT_LIMIT_ENABLE
                | SettingsFlags::INVERT_LIMIT_PINS,
            homing_dir_mask: 0x01,
            homing_feed_rate: 30.0,
            homing_seek_rate: 2000.0,
            homing_debounce_delay: 1,
            homing_pulloff: 0.5,
        }
    }
}

/// One value as exposed through the numbered protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingValue {
    Int(u32),
    Float(f32),
    Bool(bool),
}

/// Dump order for `$$`.
pub const DUMP_ORDER: [u8; 33] = [
    0, 1, 2, 3, 4, 5, 6, 10, 11, 12, 13, 20, 21, 22, 23, 24, 25, 26, 27, 30, 31, 100, 101, 102,
    110, 111, 112, 120, 121, 122, 130, 131, 132,
];

impl Settings {
    /// Store one numbered setting, validating like the console does.
    pub fn set(&mut self, index: u8, value: f32) -> Result<(), Status> {
        if index >= AXIS_SETTINGS_START {
            if value < 0.0 {
                return Err(Status::NegativeValue);
            }
            let group = (index - AXIS_SETTINGS_START) / AXIS_SETTINGS_INCREMENT;
            let axis = ((index - AXIS_SETTINGS_START) % AXIS_SETTINGS_INCREMENT) as usize;
            if axis >= N_AXIS {
                return Err(Status::InvalidStatement);
            }
            match group {
                0 => self.steps_per_mm[axis] = value,
                1 => self.max_rate[axis] = value,
                // Entered mm/s², stored mm/min².
                2 => self.acceleration[axis] = value * 3600.0,
                // Entered positive, stored negative.
                3 => self.max_travel[axis] = -value,
                _ => return Err(Status::InvalidStatement),
            }
            return Ok(());
        }

        match index {
            0 => {
                if value < 3.0 {
                    return Err(Status::SettingStepPulseMin);
                }
                self.pulse_microseconds = value as u8;
            }
            1 => self.stepper_idle_lock_time = clamp_u8(value)?,
            2 => self.step_invert_mask = clamp_u8(value)?,
            3 => self.dir_invert_mask = clamp_u8(value)?,
            4 => self.flags.set(SettingsFlags::INVERT_ST_ENABLE, value != 0.0),
            5 => self.flags.set(SettingsFlags::INVERT_LIMIT_PINS, value != 0.0),
            6 => self.flags.set(SettingsFlags::INVERT_PROBE_PIN, value != 0.0),
            10 => {
                self.status_report_mask = StatusReportMask::from_bits_truncate(clamp_u8(value)?)
            }
            11 => self.junction_deviation = non_negative(value)?,
            12 => self.arc_tolerance = non_negative(value)?,
            13 => self.flags.set(SettingsFlags::REPORT_INCHES, value != 0.0),
            20 => {
                if value != 0.0 && !self.flags.contains(SettingsFlags::HOMING_ENABLE) {
                    return Err(Status::SoftLimitError);
                }
                self.flags.set(SettingsFlags::SOFT_LIMIT_ENABLE, value != 0.0);
            }
            21 => self.flags.set(SettingsFlags::HARD_LIMIT_ENABLE, value != 0.0),
            22 => {
                self.flags.set(SettingsFlags::HOMING_ENABLE, value != 0.0);
                if value == 0.0 {
                    // Soft limits cannot outlive homing.
                    self.flags.remove(SettingsFlags::SOFT_LIMIT_ENABLE);
                }
            }
            23 => self.homing_dir_mask = clamp_u8(value)?,
            24 => self.homing_feed_rate = non_negative(value)?,
            25 => self.homing_seek_rate = non_negative(value)?,
            26 => self.homing_debounce_delay = non_negative(value)? as u16,
            27 => self.homing_pulloff = non_negative(value)?,
            30 => self.rpm_max = non_negative(value)?,
            31 => self.rpm_min = non_negative(value)?,
            _ => return Err(Status::InvalidStatement),
        }
        Ok(())
    }

    /// Read one numbered setting in its display units.
    pub fn get(&self, index: u8) -> Option<SettingValue> {
        use SettingValue::*;
        if index >= AXIS_SETTINGS_START {
            let group = (index - AXIS_SETTINGS_START) / AXIS_SETTINGS_INCREMENT;
            let axis = ((index - AXIS_SETTINGS_START) % AXIS_SETTINGS_INCREMENT) as usize;
            if axis >= N_AXIS {
                return None;
            }
            return match group {
                0 => Some(Float(self.steps_per_mm[axis])),
                1 => Some(Float(self.max_rate[axis])),
                2 => Some(Float(self.acceleration[axis] / 3600.0)),
                3 => Some(Float(-self.max_travel[axis])),
                _ => None,
            };
        }
        match index {
            0 => Some(Int(self.pulse_microseconds as u32)),
            1 => Some(Int(self.stepper_idle_lock_time as u32)),
            2 => Some(Int(self.step_invert_mask as u32)),
            3 => Some(Int(self.dir_invert_mask as u32)),
            4 => Some(Bool(self.flags.contains(SettingsFlags::INVERT_ST_ENABLE))),
            5 => Some(Bool(self.flags.contains(SettingsFlags::INVERT_LIMIT_PINS))),
            6 => Some(Bool(self.flags.contains(SettingsFlags::INVERT_PROBE_PIN))),
            10 => Some(Int(self.status_report_mask.bits() as u32)),
            11 => Some(Float(self.junction_deviation)),
            12 => Some(Float(self.arc_tolerance)),
            13 => Some(Bool(self.flags.contains(SettingsFlags::REPORT_INCHES))),
            20 => Some(Bool(self.flags.contains(SettingsFlags::SOFT_LIMIT_ENABLE))),
            21 => Some(Bool(self.flags.contains(SettingsFlags::HARD_LIMIT_ENABLE))),
            22 => Some(Bool(self.flags.contains(SettingsFlags::HOMING_ENABLE))),
            23 => Some(Int(self.homing_dir_mask as u32)),
            24 => Some(Float(self.homing_feed_rate)),
            25 => Some(Float(self.homing_seek_rate)),
            26 => Some(Int(self.homing_debounce_delay as u32)),
            27 => Some(Float(self.homing_pulloff)),
            30 => Some(Float(self.rpm_max)),
            31 => Some(Float(self.rpm_min)),
            _ => None,
        }
    }

    /// Convert a step count on one axis to machine millimeters.
    #[inline]
    pub fn steps_to_mm(&self, steps: i32, axis: usize) -> f32 {
        steps as f32 / self.steps_per_mm[axis]
    }

    /// Convert a machine-step position array to millimeters.
    pub fn steps_to_mpos(&self, steps: &[i32; N_AXIS]) -> [f32; N_AXIS] {
        let mut pos = [0.0; N_AXIS];
        for (idx, p) in pos.iter_mut().enumerate() {
            *p = self.steps_to_mm(steps[idx], idx);
        }
        pos
    }
}

fn clamp_u8(value: f32) -> Result<u8, Status> {
    if value < 0.0 {
        return Err(Status::NegativeValue);
    }
    if value > 255.0 {
        return Err(Status::InvalidStatement);
    }
    Ok(value as u8)
}

fn non_negative(value: f32) -> Result<f32, Status> {
    if value < 0.0 {
        Err(Status::NegativeValue)
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_machine_profile() {
        let s = Settings::default();
        assert_eq!(s.steps_per_mm, [400.0; 3]);
        assert_eq!(s.max_travel, [-86.5, -241.5, -78.5]);
        assert_eq!(s.acceleration[0], 500.0 * 3600.0);
        assert!(s.flags.contains(SettingsFlags::HOMING_ENABLE));
        assert!(s.flags.contains(SettingsFlags::INVERT_LIMIT_PINS));
        assert_eq!(s.homing_dir_mask, 0x01);
    }

    #[test]
    fn axis_settings_numbering() {
        let mut s = Settings::default();
        s.set(101, 80.0).unwrap();
        assert_eq!(s.steps_per_mm[1], 80.0);
        s.set(112, 1500.0).unwrap();
        assert_eq!(s.max_rate[2], 1500.0);
        s.set(120, 250.0).unwrap();
        assert_eq!(s.acceleration[0], 250.0 * 3600.0);
        s.set(130, 100.0).unwrap();
        assert_eq!(s.max_travel[0], -100.0);
        assert!(s.set(103, 1.0).is_err());
    }

    #[test]
    fn step_pulse_minimum_enforced() {
        let mut s = Settings::default();
        assert_eq!(s.set(0, 2.0), Err(Status::SettingStepPulseMin));
        s.set(0, 5.0).unwrap();
        assert_eq!(s.pulse_microseconds, 5);
    }

    #[test]
    fn soft_limit_requires_homing() {
        let mut s = Settings::default();
        s.set(22, 0.0).unwrap();
        assert!(!s.flags.contains(SettingsFlags::SOFT_LIMIT_ENABLE));
        assert_eq!(s.set(20, 1.0), Err(Status::SoftLimitError));
        s.set(22, 1.0).unwrap();
        s.set(20, 1.0).unwrap();
        assert!(s.flags.contains(SettingsFlags::SOFT_LIMIT_ENABLE));
    }

    #[test]
    fn negative_rejected() {
        let mut s = Settings::default();
        assert_eq!(s.set(24, -1.0), Err(Status::NegativeValue));
        assert_eq!(s.set(100, -10.0), Err(Status::NegativeValue));
    }

    #[test]
    fn dump_roundtrip_via_set() {
        // Every dumped value fed back through `set` reproduces the record.
        let s = Settings::default();
        let mut copy = Settings::default();
        copy.steps_per_mm = [1.0; 3];
        copy.junction_deviation = 9.9;
        copy.flags = SettingsFlags::HOMING_ENABLE;
        for idx in DUMP_ORDER {
            let value = match s.get(idx).unwrap() {
                SettingValue::Int(v) => v as f32,
                SettingValue::Float(v) => v,
                SettingValue::Bool(v) => v as u8 as f32,
            };
            copy.set(idx, value).unwrap();
        }
        assert_eq!(s, copy);
    }

    #[test]
    fn steps_to_mm_roundtrip_within_one_step() {
        let s = Settings::default();
        let steps = [-4321, 1234, 0];
        let mpos = s.steps_to_mpos(&steps);
        for idx in 0..3 {
            let back = (mpos[idx] * s.steps_per_mm[idx]).round() as i32;
            assert!((back - steps[idx]).abs() <= 1);
        }
    }
}
