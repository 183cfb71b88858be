//! Console commands, line protocol responses, persistence, and the status
//! report format.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{drain_output, machine, ScriptRx};
use cr1_common::codes::Status;
use cr1_common::rt::{RtEvent, RtFlags};
use cr1_common::state::MachineState;
use cr1_core::Machine;
use cr1_hal::{MemStorage, NvStorage, SimBoard};

#[test]
fn main_loop_answers_ok_and_errors() {
    let mut m = machine();
    let mut rx = ScriptRx::new(&m);
    rx.push_line("");
    rx.push_line("G4 P0.01");
    rx.push_line("G99");
    rx.push_line("( comment only )");
    m.main_loop(&mut rx);

    let out = drain_output(&mut m);
    // Empty line, dwell, and comment-only line answer ok; G99 errors with
    // its message and echo.
    assert_eq!(out.matches("ok\r\n").count(), 3, "output was: {out}");
    assert!(out.contains("error:20"), "output was: {out}");
    assert!(out.contains("[echo: G99]"), "output was: {out}");
}

#[test]
fn realtime_bytes_never_corrupt_the_line() {
    let mut m = machine();
    let mut rx = ScriptRx::new(&m);
    // A status request arrives mid-word; the line must still parse.
    rx.push_bytes(b"G4 P0.?01\n");
    m.main_loop(&mut rx);
    let out = drain_output(&mut m);
    assert!(out.contains("ok\r\n"), "output was: {out}");
    assert!(out.contains('<'), "status frame expected: {out}");
    assert!(!out.contains("error:"), "output was: {out}");
}

#[test]
fn alarm_state_locks_out_gcode_but_not_unlock() {
    let mut m = machine();
    m.sys.state = MachineState::Alarm;
    let mut rx = ScriptRx::new(&m);
    rx.push_line("G1X-5F100");
    rx.push_line("$X");
    rx.push_line("G4P0.01");
    m.main_loop(&mut rx);
    let out = drain_output(&mut m);
    assert!(out.contains("error:9"), "output was: {out}");
    assert!(out.contains("[MSG:unlocked]"), "output was: {out}");
    // After the unlock, g-code flows again.
    assert!(out.contains("ok\r\n"), "output was: {out}");
}

#[test]
fn settings_dump_roundtrips_through_set_commands() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$100=201.5"), Status::Ok);
    assert_eq!(m.execute_console_line("$24=55"), Status::Ok);
    assert_eq!(m.execute_console_line("$13=1"), Status::Ok);
    m.report_settings();
    let dump = drain_output(&mut m);

    // Feed every dumped `$n=v` back into a fresh machine; records converge.
    let mut fresh = machine();
    for line in dump.lines() {
        if let Some(rest) = line.strip_prefix('$') {
            let assignment = rest.split_whitespace().next().unwrap();
            assert_eq!(
                fresh.execute_console_line(&format!("${assignment}")),
                Status::Ok,
                "rejected: {assignment}"
            );
        }
    }
    assert_eq!(fresh.settings, m.settings);
}

#[test]
fn settings_persist_across_power_cycles() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$110=999"), Status::Ok);
    let image = m.nvs.clone();

    let rt = Arc::new(RtFlags::new());
    let mut rebooted: Machine<SimBoard, MemStorage, Vec<u8>> =
        Machine::new(SimBoard::new(), image, Vec::new(), rt);
    assert!(!rebooted.settings_restored_at_boot);
    assert_eq!(rebooted.settings.max_rate[0], 999.0);
}

#[test]
fn version_mismatch_wipes_to_defaults() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$110=999"), Status::Ok);
    let mut image = m.nvs.clone();
    image.write_byte(0, 0xEE);

    let rt = Arc::new(RtFlags::new());
    let rebooted: Machine<SimBoard, MemStorage, Vec<u8>> =
        Machine::new(SimBoard::new(), image, Vec::new(), rt);
    assert!(rebooted.settings_restored_at_boot);
    assert_eq!(rebooted.settings.max_rate[0], 2540.0);
}

#[test]
fn restore_command_resets_settings() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$120=123"), Status::Ok);
    assert_eq!(m.execute_console_line("$RST=$"), Status::Ok);
    assert_eq!(m.settings.acceleration[0], 500.0 * 3600.0);
    // A restore forces a reset so nothing stale survives.
    assert!(m.rt.state().contains(RtEvent::RESET));
}

#[test]
fn startup_lines_store_and_run_on_boot() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$N0=G54G21"), Status::Ok);
    assert_eq!(m.execute_console_line("$N0"), Status::InvalidStatement);
    drain_output(&mut m);
    assert_eq!(m.execute_console_line("$N"), Status::Ok);
    let out = drain_output(&mut m);
    assert!(out.contains("$N0=G54G21"), "output was: {out}");
    assert!(out.contains("$N1="), "output was: {out}");

    // Boot executes the stored line and reports its result.
    m.execute_startup_lines();
    let out = drain_output(&mut m);
    assert!(out.contains(">G54G21:ok"), "output was: {out}");
}

#[test]
fn invalid_setting_values_are_rejected() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$0=1"), Status::SettingStepPulseMin);
    assert_eq!(m.execute_console_line("$24=-5"), Status::NegativeValue);
    assert_eq!(m.execute_console_line("$999=1"), Status::InvalidStatement);
    assert_eq!(m.execute_console_line("$7"), Status::InvalidStatement);
}

#[test]
fn status_report_carries_all_default_fields() {
    let mut m = machine();
    drain_output(&mut m);
    m.rt.set_state(RtEvent::STATUS_REPORT);
    m.execute_realtime();
    let out = drain_output(&mut m);
    // Default mask 127: machine position, buffer counts, line, feed/speed,
    // pins, then the first report also carries WCO and overrides.
    assert!(out.starts_with("<Idle|M:0.000,0.000,0.000"), "was: {out}");
    assert!(out.contains("|B:15,"), "was: {out}");
    assert!(out.contains("|L:0"), "was: {out}");
    assert!(out.contains("|FS:0,0"), "was: {out}");
    assert!(out.contains("|0000"), "was: {out}");
    assert!(out.contains("|W:0.000,0.000,0.000"), "was: {out}");
    assert!(out.ends_with(">\r\n"), "was: {out}");

    // The very next report elides the slow-refresh fields.
    m.rt.set_state(RtEvent::STATUS_REPORT);
    m.execute_realtime();
    let out = drain_output(&mut m);
    assert!(!out.contains("|W:"), "was: {out}");
    assert!(out.contains("|Ov:100,100,100"), "was: {out}");
}

#[test]
fn check_mode_consumes_gcode_without_motion() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$C"), Status::Ok);
    assert_eq!(m.sys.state, MachineState::CheckMode);
    assert_eq!(m.execute_gcode_line("G1X-20F500"), Status::Ok);
    assert_eq!(m.sys.position, [0, 0, 0]);
    assert_eq!(m.board.pulses, [0, 0, 0]);
    // Toggling off resets the machine.
    assert_eq!(m.execute_console_line("$C"), Status::Ok);
    assert!(m.rt.state().contains(RtEvent::RESET));
}

#[test]
fn sleep_deenergizes_until_reset() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$SLP"), Status::Ok);
    common::send_event_after(&m, RtEvent::RESET, Duration::from_millis(40));
    m.execute_realtime();
    assert!(m.sys.abort);
    assert!(!m.board.stepper_enabled);
    assert_eq!(m.board.spindle_pwm, 0);
    assert_eq!(m.board.power_level, b'0');
    let out = drain_output(&mut m);
    assert!(out.contains("[MSG:sleeping]"), "output was: {out}");
}

#[test]
fn coordinate_offsets_persist_and_report() {
    let mut m = machine();
    assert_eq!(m.execute_gcode_line("G10L2P2X-10Y-20Z-5"), Status::Ok);
    drain_output(&mut m);
    m.report_ngc_parameters();
    let out = drain_output(&mut m);
    assert!(out.contains("[G55:-10.000,-20.000,-5.000]"), "was: {out}");

    // Survives a power cycle through the storage image.
    let image = m.nvs.clone();
    let rt = Arc::new(RtFlags::new());
    let mut rebooted: Machine<SimBoard, MemStorage, Vec<u8>> =
        Machine::new(SimBoard::new(), image, Vec::new(), rt);
    rebooted.report_ngc_parameters();
    let out = String::from_utf8(std::mem::take(rebooted.report.writer_mut())).unwrap();
    assert!(out.contains("[G55:-10.000,-20.000,-5.000]"), "was: {out}");
}

#[test]
fn work_coordinates_shift_gcode_targets() {
    let mut m = machine();
    // G55 zero at machine -40,-40,0; then a move to work X-2 lands at -42.
    assert_eq!(m.execute_gcode_line("G10L2P2X-40Y-40Z0"), Status::Ok);
    assert_eq!(m.execute_gcode_line("G55"), Status::Ok);
    assert_eq!(m.execute_gcode_line("G1X-2Y0F1000"), Status::Ok);
    common::run_until_idle(&mut m);
    assert_eq!(m.sys.position[0], -16_800);
    assert_eq!(m.sys.position[1], -16_000);
}

#[test]
fn manufacturing_notes_roundtrip() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$B=RMA.2024.BENT.GANTRY"), Status::Ok);
    drain_output(&mut m);
    assert_eq!(m.execute_console_line("$B"), Status::Ok);
    let out = drain_output(&mut m);
    assert!(out.contains("[B:RMA.2024.BENT.GANTRY]"), "was: {out}");
}

#[test]
fn build_info_stores_extension_line() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$I=OEM.UNIT.0042"), Status::Ok);
    drain_output(&mut m);
    assert_eq!(m.execute_console_line("$I"), Status::Ok);
    let out = drain_output(&mut m);
    assert!(out.contains("[grbl:1.1f CR:"), "was: {out}");
    assert!(out.contains("[OEM.UNIT.0042]"), "was: {out}");
}

#[test]
fn nvs_dump_covers_whole_image() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$E"), Status::Ok);
    let out = drain_output(&mut m);
    assert!(out.contains("x0\t"), "was: {out}");
    assert!(out.contains("x1008"), "was: {out}");
}

#[test]
fn console_commands_blocked_mid_cycle() {
    let mut m = machine();
    assert_eq!(m.execute_gcode_line("G1X-40F100"), Status::Ok);
    m.auto_cycle_start();
    m.execute_realtime();
    assert_eq!(m.sys.state, MachineState::Cycle);
    assert_eq!(m.execute_console_line("$$"), Status::IdleError);
    assert_eq!(m.execute_console_line("$H"), Status::IdleError);
    assert_eq!(m.execute_console_line("$RST=$"), Status::IdleError);
    // Reports stay available.
    assert_eq!(m.execute_console_line("$G"), Status::Ok);
}
