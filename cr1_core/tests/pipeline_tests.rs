//! Motion pipeline scenarios: streamed g-code through the planner and
//! stepper, feed hold and resume, overrides, and motion cancellation.

mod common;

use std::time::Duration;

use common::{drain_output, machine, run_until_idle};
use cr1_common::codes::Status;
use cr1_common::rt::{MotionOverride, RtEvent};
use cr1_common::state::{MachineState, Suspend};

#[test]
fn single_feed_motion_executes_exact_steps() {
    let mut m = machine();
    assert_eq!(m.execute_gcode_line("G1X-50F1000"), Status::Ok);
    run_until_idle(&mut m);
    assert_eq!(m.sys.state, MachineState::Idle);
    assert_eq!(m.sys.position, [-20_000, 0, 0]);
    assert_eq!(m.board.position[0], -20_000);
}

#[test]
fn rapid_and_feed_chain_lands_on_target() {
    let mut m = machine();
    assert_eq!(m.execute_gcode_line("G0X-10Y-10"), Status::Ok);
    assert_eq!(m.execute_gcode_line("G1X-20Y-30Z-5F2000"), Status::Ok);
    run_until_idle(&mut m);
    assert_eq!(m.sys.position, [-8_000, -12_000, -2_000]);
    assert_eq!(m.board.position, [-8_000, -12_000, -2_000]);
}

#[test]
fn arc_returns_to_start_of_circle() {
    let mut m = machine();
    assert_eq!(m.execute_gcode_line("G0X-30Y-30"), Status::Ok);
    // Full circle around a center 5 mm in +X.
    assert_eq!(m.execute_gcode_line("G2X-30Y-30I5F1500"), Status::Ok);
    run_until_idle(&mut m);
    // Back at the start within a step per axis.
    assert!((m.sys.position[0] + 12_000).abs() <= 1);
    assert!((m.sys.position[1] + 12_000).abs() <= 1);
}

#[test]
fn incremental_blocks_accumulate() {
    let mut m = machine();
    assert_eq!(m.execute_gcode_line("G91"), Status::Ok);
    for _ in 0..10 {
        assert_eq!(m.execute_gcode_line("G1X-5F1500"), Status::Ok);
    }
    run_until_idle(&mut m);
    assert_eq!(m.sys.position[0], -20_000);
}

#[test]
fn feed_hold_then_resume_loses_no_steps() {
    let mut m = machine();
    assert_eq!(m.execute_gcode_line("G91"), Status::Ok);
    for _ in 0..10 {
        assert_eq!(m.execute_gcode_line("G1X-5F1500"), Status::Ok);
    }

    // Start the cycle and let it get moving.
    m.auto_cycle_start();
    m.execute_realtime();
    assert_eq!(m.sys.state, MachineState::Cycle);
    m.run_stepper_ticks(4096);
    m.execute_realtime();
    let moving_at = m.sys.position[0];
    assert!(moving_at < 0, "motion should have started");

    // Hold: decelerate to a stop. The resume arrives while the machine is
    // parked in the suspend loop, as it would from the serial thread.
    m.rt.set_state(RtEvent::FEED_HOLD);
    m.execute_realtime();
    assert_eq!(m.sys.state, MachineState::Hold);
    common::send_event_after(&m, RtEvent::CYCLE_START, Duration::from_millis(30));
    loop {
        m.execute_realtime();
        if m.sys.state == MachineState::Cycle || m.sys.state == MachineState::Idle {
            break;
        }
        m.run_stepper_ticks(1024);
    }

    run_until_idle(&mut m);
    assert_eq!(m.sys.state, MachineState::Idle);
    assert_eq!(m.sys.position[0], -20_000);
    assert_eq!(m.board.position[0], -20_000);
}

#[test]
fn feed_override_replans_and_reports() {
    let mut m = machine();
    assert_eq!(m.execute_gcode_line("G1X-80F600"), Status::Ok);
    m.auto_cycle_start();
    m.execute_realtime();
    m.run_stepper_ticks(2048);

    m.rt.set_motion_override(MotionOverride::FEED_COARSE_PLUS);
    m.execute_realtime();
    assert_eq!(m.sys.f_override, 110);
    // The override field surfaces within the next two reports (the first
    // may be taken by the staggered WCO field).
    drain_output(&mut m);
    m.rt.set_state(RtEvent::STATUS_REPORT);
    m.execute_realtime();
    m.rt.set_state(RtEvent::STATUS_REPORT);
    m.execute_realtime();
    let out = drain_output(&mut m);
    assert!(out.contains("|Ov:110,100,100"), "status was: {out}");

    run_until_idle(&mut m);
    // Step total is untouched by the override.
    assert_eq!(m.sys.position[0], -32_000);
}

#[test]
fn rapid_override_low_limits_traverse() {
    let mut m = machine();
    m.rt.set_motion_override(MotionOverride::RAPID_LOW);
    m.execute_realtime();
    assert_eq!(m.sys.r_override, 25);
    assert_eq!(m.execute_gcode_line("G0X-40"), Status::Ok);
    run_until_idle(&mut m);
    assert_eq!(m.sys.position[0], -16_000);
}

#[test]
fn soft_limit_violation_holds_then_alarms() {
    let mut m = machine();
    common::reset_when_alarmed(&m);
    // Target beyond -86.5 mm X travel. The check runs pre-buffer, raises
    // the alarm, and aborts.
    let status = m.execute_gcode_line("G1X-100F600");
    assert_eq!(status, Status::Ok);
    assert!(m.sys.abort);
    assert_eq!(m.sys.state, MachineState::Alarm);
    let out = drain_output(&mut m);
    assert!(out.contains("ALARM:2"), "output was: {out}");
}

#[test]
fn jog_runs_and_cancel_flushes() {
    let mut m = machine();
    assert_eq!(m.execute_console_line("$J=G91X-30F2000"), Status::Ok);
    assert_eq!(m.sys.state, MachineState::Jog);
    m.run_stepper_ticks(4096);
    m.execute_realtime();

    // Jog cancel maps onto the motion-cancel event.
    m.rt.set_state(RtEvent::MOTION_CANCEL);
    m.execute_realtime();
    // The cancel decelerates, flushes, and returns to idle on its own.
    let mut guard = 0;
    while m.sys.state != MachineState::Idle {
        m.execute_realtime();
        m.run_stepper_ticks(1024);
        guard += 1;
        assert!(guard < 10_000, "jog cancel did not settle");
    }
    assert!(m.planner.is_empty());
    assert_eq!(m.sys.suspend, Suspend::empty());
    // Somewhere short of the full -30 mm.
    assert!(m.sys.position[0] > -12_000);
    assert!(m.sys.position[0] < 0);
    // Parser position resynced to where the machine actually stopped.
    let gc_x = m.gc.position[0];
    let machine_x = m.sys.position[0] as f32 / m.settings.steps_per_mm[0];
    assert!((gc_x - machine_x).abs() < 1e-3);
}
