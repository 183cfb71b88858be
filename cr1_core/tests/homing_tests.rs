//! Homing, limit, probe, and gantry-squaring scenarios against the
//! simulated frame.

mod common;

use common::{drain_output, machine, machine_with_board, X_SWITCH};
use cr1_common::codes::Status;
use cr1_common::state::MachineState;
use cr1_hal::SimBoard;

#[test]
fn full_homing_cycle_pins_machine_zero() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$H"), Status::Ok);
    assert_eq!(m.sys.state, MachineState::Idle);
    assert!(!m.sys.abort);

    // X homes toward its negative-end switch: zero lands at
    // max_travel + pulloff. Y and Z home toward machine zero: -pulloff.
    let expected_x = ((-86.5 + 0.5) * 400.0f32).round() as i32;
    let expected_yz = (-0.5 * 400.0f32).round() as i32;
    assert_eq!(m.sys.position, [expected_x, expected_yz, expected_yz]);

    // Every switch must be clear after the final pull-off.
    assert_eq!(m.limit_state(), 0);

    // Parser and planner agree with the new frame.
    assert_eq!(m.gc.position[0], m.settings.steps_to_mm(expected_x, 0));
    assert_eq!(m.planner.position(), m.sys.position);
}

#[test]
fn single_axis_homing_touches_only_that_axis() {
    let mut m = machine();
    let y_before = m.sys.position[1];
    assert_eq!(m.execute_console_line("$HZ"), Status::Ok);
    let expected_z = (-0.5 * 400.0f32).round() as i32;
    assert_eq!(m.sys.position[2], expected_z);
    assert_eq!(m.sys.position[1], y_before);
}

#[test]
fn homing_without_switch_alarms_approach_failure() {
    // No Y switch wired: the X+Y pass exhausts its travel.
    let mut board = SimBoard::with_switches(X_SWITCH, 2_000, 2_000);
    board.switches[1].trip_above = None;
    let mut m = machine_with_board(board);
    common::reset_when_alarmed(&m);
    assert_eq!(m.execute_console_line("$H"), Status::Ok);
    assert!(m.sys.abort);
    assert_eq!(m.sys.state, MachineState::Alarm);
    let out = drain_output(&mut m);
    assert!(out.contains("ALARM:8"), "output was: {out}");
}

#[test]
fn homing_disabled_by_setting() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$22=0"), Status::Ok);
    assert_eq!(m.execute_console_line("$H"), Status::SettingDisabled);
}

#[test]
fn hard_limit_trip_halts_into_alarm() {
    let mut m = machine();
    assert_eq!(m.execute_gcode_line("G1X-40F2000"), Status::Ok);
    m.auto_cycle_start();
    m.execute_realtime();
    m.run_stepper_ticks(2048);
    assert_eq!(m.sys.state, MachineState::Cycle);

    // Wire fault: force the Z pin active mid-cycle. The executor's next
    // pass stands in for the pin-change interrupt. The alarm handler spins
    // until the operator resets.
    m.board.forced_limit_pins = 0b100;
    common::reset_when_alarmed(&m);
    m.execute_realtime();

    assert_eq!(m.sys.state, MachineState::Alarm);
    assert!(m.sys.abort);
    assert!(!m.stepper.is_running());
    let out = drain_output(&mut m);
    assert!(out.contains("ALARM:1"), "output was: {out}");
}

#[test]
fn squaring_datum_measures_gantry_skew() {
    let mut board = SimBoard::with_switches(X_SWITCH, 2_000, 2_000);
    board.x1_skew_steps = 7;
    let mut m = machine_with_board(board);

    m.sys.state = MachineState::Homing;
    m.mc_x_is_level();
    assert!(!m.sys.abort);
    // The X1 switch tripped 7 steps before X2; the datum records it.
    assert_eq!(m.read_x_level_datum(), 7);
    let out = drain_output(&mut m);
    assert!(out.contains("level datum 7 steps"), "output was: {out}");
}

#[test]
fn autolevel_is_noop_without_gantry_hardware() {
    let mut board = SimBoard::with_switches(X_SWITCH, 2_000, 2_000);
    board.x1_trip_below = None;
    let mut m = machine_with_board(board);
    m.sys.state = MachineState::Homing;
    m.mc_autolevel_x();
    assert!(!m.sys.abort);
    let out = drain_output(&mut m);
    assert!(out.contains("squaring hardware not fitted"), "output was: {out}");
}

#[test]
fn probe_contact_captures_position() {
    let mut m = machine();
    m.board.probe_trip_below_z = Some(-1_000);
    assert_eq!(m.execute_gcode_line("G38.2Z-20F200"), Status::Ok);
    assert!(m.sys.probe_succeeded);
    // Contact latched within a step of the modeled surface.
    assert!((m.sys.probe_position[2] + 1_000).abs() <= 1);
    // The remaining probe motion was flushed; the machine rests at or just
    // past contact, resynced.
    assert_eq!(m.planner.position(), m.sys.position);
    let out = drain_output(&mut m);
    assert!(out.contains("[PRB:"), "output was: {out}");
    assert!(out.contains(":1]"), "output was: {out}");
}

#[test]
fn probe_without_contact_alarms() {
    let mut m = machine();
    common::reset_when_alarmed(&m);
    assert_eq!(m.execute_gcode_line("G38.2Z-5F500"), Status::Ok);
    assert!(!m.sys.probe_succeeded);
    assert!(m.sys.abort);
    let out = drain_output(&mut m);
    assert!(out.contains("ALARM:5"), "output was: {out}");
}
