//! Persistent-storage layout and record access.
//!
//! The image layout is address-stable: senders and service tooling depend
//! on it. Byte 0 carries the settings version tag; a mismatch wipes and
//! restores everything. All records are checksummed; string records are
//! fixed-width, zero-terminated.
//!
//! | Address | Record |
//! |---|---|
//! | 0 | version tag |
//! | 1 | global settings |
//! | 512 | coordinate records, G54..G59 + G28 + G30 |
//! | 656 | manufacturing / RMA dates |
//! | 664 | machine + PCB revision |
//! | 672 | calibration words (X1/X2 squaring delta first) |
//! | 688, 768 | startup lines |
//! | 848 | manufacturing notes |
//! | 942 | build-info extension |

use std::io::Write;

use cr1_common::axis::N_AXIS;
use cr1_common::codes::Status;
use cr1_common::consts::LINE_BUFFER_LEN;
use cr1_common::settings::{
    RestoreMask, Settings, SettingsFlags, StatusReportMask, SETTINGS_VERSION,
};
use cr1_hal::{Board, NvStorage};
use tracing::{info, warn};

use crate::gcode::N_COORD_RECORDS;
use crate::machine::Machine;

pub const ADDR_VERSION: usize = 0;
pub const ADDR_GLOBAL: usize = 1;
pub const ADDR_PARAMETERS: usize = 512;
pub const ADDR_DATES: usize = 656;
pub const ADDR_REVISION: usize = 664;
pub const ADDR_CAL_DATA: usize = 672;
pub const ADDR_STARTUP_BLOCK: [usize; 2] = [688, 768];
pub const ADDR_MANF_NOTES: usize = 848;
pub const ADDR_BUILD_INFO: usize = 942;

/// Coordinate record stride: three floats plus the checksum byte.
const COORD_RECORD_LEN: usize = N_AXIS * 4;

/// Serialized global settings record length.
const GLOBAL_RECORD_LEN: usize = 85;

/// Maximum stored string payload (line minus terminator and checksum).
const STRING_RECORD_LEN: usize = LINE_BUFFER_LEN - 2;

fn put_f32(buf: &mut [u8], at: &mut usize, value: f32) {
    buf[*at..*at + 4].copy_from_slice(&value.to_le_bytes());
    *at += 4;
}

fn get_f32(buf: &[u8], at: &mut usize) -> f32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[*at..*at + 4]);
    *at += 4;
    f32::from_le_bytes(bytes)
}

fn encode_settings(settings: &Settings) -> [u8; GLOBAL_RECORD_LEN] {
    let mut buf = [0u8; GLOBAL_RECORD_LEN];
    let mut at = 0;
    for group in [
        &settings.steps_per_mm,
        &settings.max_rate,
        &settings.acceleration,
        &settings.max_travel,
    ] {
        for &value in group.iter() {
            put_f32(&mut buf, &mut at, value);
        }
    }
    buf[at] = settings.pulse_microseconds;
    buf[at + 1] = settings.step_invert_mask;
    buf[at + 2] = settings.dir_invert_mask;
    buf[at + 3] = settings.stepper_idle_lock_time;
    buf[at + 4] = settings.status_report_mask.bits();
    at += 5;
    put_f32(&mut buf, &mut at, settings.junction_deviation);
    put_f32(&mut buf, &mut at, settings.arc_tolerance);
    put_f32(&mut buf, &mut at, settings.rpm_max);
    put_f32(&mut buf, &mut at, settings.rpm_min);
    buf[at] = settings.flags.bits();
    buf[at + 1] = settings.homing_dir_mask;
    at += 2;
    put_f32(&mut buf, &mut at, settings.homing_feed_rate);
    put_f32(&mut buf, &mut at, settings.homing_seek_rate);
    buf[at..at + 2].copy_from_slice(&settings.homing_debounce_delay.to_le_bytes());
    at += 2;
    put_f32(&mut buf, &mut at, settings.homing_pulloff);
    debug_assert_eq!(at, GLOBAL_RECORD_LEN);
    buf
}

fn decode_settings(buf: &[u8; GLOBAL_RECORD_LEN]) -> Settings {
    let mut settings = Settings::default();
    let mut at = 0;
    for group in [
        &mut settings.steps_per_mm,
        &mut settings.max_rate,
        &mut settings.acceleration,
        &mut settings.max_travel,
    ] {
        for value in group.iter_mut() {
            *value = get_f32(buf, &mut at);
        }
    }
    settings.pulse_microseconds = buf[at];
    settings.step_invert_mask = buf[at + 1];
    settings.dir_invert_mask = buf[at + 2];
    settings.stepper_idle_lock_time = buf[at + 3];
    settings.status_report_mask = StatusReportMask::from_bits_truncate(buf[at + 4]);
    at += 5;
    settings.junction_deviation = get_f32(buf, &mut at);
    settings.arc_tolerance = get_f32(buf, &mut at);
    settings.rpm_max = get_f32(buf, &mut at);
    settings.rpm_min = get_f32(buf, &mut at);
    settings.flags = SettingsFlags::from_bits_truncate(buf[at]);
    settings.homing_dir_mask = buf[at + 1];
    at += 2;
    settings.homing_feed_rate = get_f32(buf, &mut at);
    settings.homing_seek_rate = get_f32(buf, &mut at);
    settings.homing_debounce_delay = u16::from_le_bytes([buf[at], buf[at + 1]]);
    at += 2;
    settings.homing_pulloff = get_f32(buf, &mut at);
    settings
}

impl<B: Board, N: NvStorage, W: Write> Machine<B, N, W> {
    /// Load settings and coordinate data at boot. Returns false when the
    /// version tag or a checksum failed and defaults were restored.
    pub fn load_persistent_state(&mut self) -> bool {
        let mut intact = true;

        if self.nvs.read_byte(ADDR_VERSION) != SETTINGS_VERSION {
            info!("storage version mismatch, restoring defaults");
            self.settings_restore(RestoreMask::ALL);
            intact = false;
        } else {
            let mut record = [0u8; GLOBAL_RECORD_LEN];
            if self.nvs.read_record(ADDR_GLOBAL, &mut record) {
                self.settings = decode_settings(&record);
            } else {
                warn!("settings record corrupt, restoring defaults");
                self.settings_restore(RestoreMask::DEFAULTS);
                intact = false;
            }
        }

        for slot in 0..N_COORD_RECORDS {
            match self.read_coord_record(slot) {
                Some(values) => self.gc.coord_data[slot] = values,
                None => {
                    self.gc.coord_data[slot] = [0.0; N_AXIS];
                    self.write_coord_record(slot, &[0.0; N_AXIS]);
                    intact = false;
                }
            }
        }
        self.gc.load_coord_system();
        intact
    }

    /// Persist the in-memory settings record.
    pub fn write_settings(&mut self) {
        let record = encode_settings(&self.settings);
        self.nvs.write_byte(ADDR_VERSION, SETTINGS_VERSION);
        self.nvs.write_record(ADDR_GLOBAL, &record);
    }

    /// Apply one numbered setting and persist on success.
    pub fn store_global_setting(&mut self, index: u8, value: f32) -> Status {
        match self.settings.set(index, value) {
            Ok(()) => {
                self.write_settings();
                Status::Ok
            }
            Err(status) => status,
        }
    }

    /// Wipe and restore the selected storage regions.
    pub fn settings_restore(&mut self, mask: RestoreMask) {
        if mask.contains(RestoreMask::DEFAULTS) {
            self.settings = Settings::default();
            self.write_settings();
        }
        if mask.contains(RestoreMask::PARAMETERS) {
            for slot in 0..N_COORD_RECORDS {
                self.gc.coord_data[slot] = [0.0; N_AXIS];
                self.write_coord_record(slot, &[0.0; N_AXIS]);
            }
            self.gc.load_coord_system();
        }
        if mask.contains(RestoreMask::STARTUP_LINES) {
            for n in 0..ADDR_STARTUP_BLOCK.len() {
                self.store_startup_line(n as u8, "");
            }
        }
        if mask.contains(RestoreMask::BUILD_INFO) {
            self.store_build_info_line("");
        }
    }

    // ─── Coordinate records ─────────────────────────────────────────

    fn coord_record_addr(slot: usize) -> usize {
        ADDR_PARAMETERS + slot * (COORD_RECORD_LEN + 1)
    }

    pub fn read_coord_record(&self, slot: usize) -> Option<[f32; N_AXIS]> {
        let mut record = [0u8; COORD_RECORD_LEN];
        if !self.nvs.read_record(Self::coord_record_addr(slot), &mut record) {
            return None;
        }
        let mut at = 0;
        let mut values = [0.0f32; N_AXIS];
        for value in values.iter_mut() {
            *value = get_f32(&record, &mut at);
        }
        Some(values)
    }

    /// Write one coordinate record. Callers synchronize the planner first;
    /// storage writes and step generation must not overlap.
    pub fn write_coord_record(&mut self, slot: usize, values: &[f32; N_AXIS]) {
        let mut record = [0u8; COORD_RECORD_LEN];
        let mut at = 0;
        for &value in values.iter() {
            put_f32(&mut record, &mut at, value);
        }
        self.nvs
            .write_record(Self::coord_record_addr(slot), &record);
    }

    // ─── String records ─────────────────────────────────────────────

    fn write_string_record(&mut self, addr: usize, text: &str) {
        let mut record = [0u8; STRING_RECORD_LEN];
        let bytes = text.as_bytes();
        let len = bytes.len().min(STRING_RECORD_LEN - 1);
        record[..len].copy_from_slice(&bytes[..len]);
        self.nvs.write_record(addr, &record);
    }

    fn read_string_record(&self, addr: usize) -> Option<String> {
        let mut record = [0u8; STRING_RECORD_LEN];
        if !self.nvs.read_record(addr, &mut record) {
            return None;
        }
        let end = record.iter().position(|&b| b == 0).unwrap_or(record.len());
        Some(String::from_utf8_lossy(&record[..end]).into_owned())
    }

    /// Stored startup line `n`, `Err` on checksum failure.
    pub fn read_startup_line(&self, n: u8) -> Result<Option<String>, ()> {
        let addr = ADDR_STARTUP_BLOCK[n as usize];
        match self.read_string_record(addr) {
            Some(line) if line.is_empty() => Ok(None),
            Some(line) => Ok(Some(line)),
            None => Err(()),
        }
    }

    pub fn store_startup_line(&mut self, n: u8, line: &str) {
        self.write_string_record(ADDR_STARTUP_BLOCK[n as usize], line);
    }

    pub fn read_manf_notes(&self) -> Option<String> {
        self.read_string_record(ADDR_MANF_NOTES)
    }

    pub fn store_manf_notes(&mut self, notes: &str) {
        self.write_string_record(ADDR_MANF_NOTES, notes);
    }

    pub fn read_build_info_line(&self) -> Option<String> {
        self.read_string_record(ADDR_BUILD_INFO)
    }

    pub fn store_build_info_line(&mut self, line: &str) {
        self.write_string_record(ADDR_BUILD_INFO, line);
    }

    // ─── Revision & calibration words ───────────────────────────────

    fn read_revision_pair(&self, offset: usize) -> String {
        let mut text = String::new();
        for i in 0..2 {
            let byte = self.nvs.read_byte(ADDR_REVISION + offset + i);
            if byte.is_ascii_graphic() {
                text.push(byte as char);
            }
        }
        if text.is_empty() {
            text.push('0');
        }
        text
    }

    /// Machine revision shown in `$I`, e.g. `3B`.
    pub fn read_machine_revision(&self) -> String {
        self.read_revision_pair(0)
    }

    /// PCB revision shown in `$I`.
    pub fn read_pcb_revision(&self) -> String {
        self.read_revision_pair(2)
    }

    /// The stored X1/X2 squaring datum [steps].
    pub fn read_x_level_datum(&self) -> i16 {
        i16::from_le_bytes([
            self.nvs.read_byte(ADDR_CAL_DATA),
            self.nvs.read_byte(ADDR_CAL_DATA + 1),
        ])
    }

    pub fn store_x_level_datum(&mut self, delta: i16) {
        let bytes = delta.to_le_bytes();
        self.nvs.write_byte(ADDR_CAL_DATA, bytes[0]);
        self.nvs.write_byte(ADDR_CAL_DATA + 1, bytes[1]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_record_roundtrip() {
        let mut settings = Settings::default();
        settings.steps_per_mm = [250.0, 251.0, 252.0];
        settings.homing_debounce_delay = 250;
        settings.flags = SettingsFlags::HOMING_ENABLE | SettingsFlags::INVERT_PROBE_PIN;
        let encoded = encode_settings(&settings);
        let decoded = decode_settings(&encoded);
        assert_eq!(decoded, settings);
    }

    #[test]
    fn layout_regions_do_not_overlap() {
        // Global record plus checksum fits below the parameter area.
        assert!(ADDR_GLOBAL + GLOBAL_RECORD_LEN + 1 <= ADDR_PARAMETERS);
        // All coordinate records fit below the dates area.
        assert!(
            ADDR_PARAMETERS + N_COORD_RECORDS * (COORD_RECORD_LEN + 1) <= ADDR_DATES
        );
        // Startup lines fit their blocks.
        assert!(ADDR_STARTUP_BLOCK[0] + STRING_RECORD_LEN + 1 <= ADDR_STARTUP_BLOCK[1]);
        assert!(ADDR_STARTUP_BLOCK[1] + STRING_RECORD_LEN + 1 <= ADDR_MANF_NOTES);
        assert!(ADDR_MANF_NOTES + STRING_RECORD_LEN + 1 <= ADDR_BUILD_INFO);
        assert!(ADDR_BUILD_INFO + STRING_RECORD_LEN + 1 <= 1024);
    }
}
