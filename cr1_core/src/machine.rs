//! The controller aggregate: global state plus every subsystem.
//!
//! `Machine` owns the planner, stepper, settings, modal g-code state, the
//! board and storage capabilities, and the serial reporter. The subsystem
//! modules (`motion`, `limits`, `protocol`, `console`, …) implement their
//! operations as `Machine` methods, so the cooperative control flow of the
//! firmware reads in one place per concern.
//!
//! `SysState` is the always-in-RAM state word set: machine position in
//! steps, the lifecycle state, suspend and step-control words, override
//! percentages, and the per-boot latches.

use std::io::Write;
use std::sync::Arc;

use cr1_common::axis::N_AXIS;
use cr1_common::consts::{
    DEFAULT_FEED_OVERRIDE, DEFAULT_RAPID_OVERRIDE, DEFAULT_SPINDLE_SPEED_OVERRIDE,
};
use cr1_common::rt::RtFlags;
use cr1_common::settings::Settings;
use cr1_common::state::{MachineState, SpindleStop, StepControl, Suspend};
use cr1_hal::{Board, NvStorage};
use tracing::info;

use crate::gcode::GcState;
use crate::planner::{Overrides, Planner};
use crate::report::Reporter;
use crate::spindle::SpindleShadow;
use crate::stepper::Stepper;

/// Global realtime state words. Position is retained across soft resets;
/// everything else re-arms per boot.
#[derive(Debug)]
pub struct SysState {
    pub state: MachineState,
    pub suspend: Suspend,
    pub step_control: StepControl,
    /// Feed override [%].
    pub f_override: u8,
    /// Rapid override [%].
    pub r_override: u8,
    /// Spindle speed override [%].
    pub spindle_speed_ovr: u8,
    pub spindle_stop_ovr: SpindleStop,
    /// Status reports until the override field is re-emitted; 0 = now.
    pub report_ovr_counter: u8,
    /// Status reports until the WCO field is re-emitted; 0 = now.
    pub report_wco_counter: u8,
    /// Axis bits still allowed to emit step pulses during homing.
    pub homing_axis_lock: u8,
    /// One-shot latch: unwind to the boot loop.
    pub abort: bool,
    /// A soft-limit violation is being processed.
    pub soft_limit: bool,
    /// A probe cycle is monitoring the probe pin.
    pub probe_active: bool,
    /// Level the probe pin rests at, folding the invert setting and the
    /// probe-away direction together.
    pub probe_invert: bool,
    pub probe_succeeded: bool,
    /// Current spindle speed for reporting [RPM].
    pub spindle_speed: f32,
    /// Machine position [steps]. Written by the stepper tick and by homing.
    pub position: [i32; N_AXIS],
    /// Machine position captured at the last probe contact [steps].
    pub probe_position: [i32; N_AXIS],
}

impl SysState {
    pub fn new() -> Self {
        Self {
            state: MachineState::Idle,
            suspend: Suspend::empty(),
            step_control: StepControl::empty(),
            f_override: DEFAULT_FEED_OVERRIDE,
            r_override: DEFAULT_RAPID_OVERRIDE,
            spindle_speed_ovr: DEFAULT_SPINDLE_SPEED_OVERRIDE,
            spindle_stop_ovr: SpindleStop::empty(),
            report_ovr_counter: 0,
            report_wco_counter: 0,
            homing_axis_lock: 0,
            abort: false,
            soft_limit: false,
            probe_active: false,
            probe_invert: false,
            probe_succeeded: false,
            spindle_speed: 0.0,
            position: [0; N_AXIS],
            probe_position: [0; N_AXIS],
        }
    }

    /// Current feed/rapid override pair for the planner.
    #[inline]
    pub fn overrides(&self) -> Overrides {
        Overrides {
            feed: self.f_override,
            rapid: self.r_override,
        }
    }

    /// Re-arm for a boot pass. Machine position survives; overrides reset.
    pub fn reset_for_boot(&mut self) {
        let position = self.position;
        *self = Self::new();
        self.position = position;
    }
}

impl Default for SysState {
    fn default() -> Self {
        Self::new()
    }
}

/// The whole controller.
pub struct Machine<B: Board, N: NvStorage, W: Write> {
    pub settings: Settings,
    pub sys: SysState,
    pub planner: Planner,
    pub stepper: Stepper,
    pub spindle: SpindleShadow,
    pub gc: GcState,
    pub rt: Arc<RtFlags>,
    pub board: B,
    pub nvs: N,
    pub report: Reporter<W>,
    /// Settings record failed its checksum at boot and was restored.
    pub settings_restored_at_boot: bool,
    /// Receive-buffer space last observed by the serial loop, for reports.
    pub serial_rx_available: usize,
}

impl<B: Board, N: NvStorage, W: Write> Machine<B, N, W> {
    /// Bring up the controller: load (or restore) the persisted settings and
    /// coordinate data, and leave every subsystem in its reset state.
    pub fn new(board: B, nvs: N, out: W, rt: Arc<RtFlags>) -> Self {
        let mut machine = Self {
            settings: Settings::default(),
            sys: SysState::new(),
            planner: Planner::new(),
            stepper: Stepper::new(),
            spindle: SpindleShadow::default(),
            gc: GcState::new(),
            rt,
            board,
            nvs,
            report: Reporter::new(out),
            settings_restored_at_boot: false,
            serial_rx_available: 128,
        };
        machine.settings_restored_at_boot = !machine.load_persistent_state();
        machine
    }

    /// Per-boot (and per-soft-reset) re-initialization. Mirrors the outer
    /// loop of the firmware: everything except machine position and the
    /// stored settings starts over.
    pub fn boot_init(&mut self) {
        let was_alarm_or_sleep = matches!(
            self.sys.state,
            MachineState::Alarm | MachineState::Sleep
        ) || self.rt.alarm().is_some();

        self.rt.clear_all();
        self.sys.reset_for_boot();
        self.planner.reset();
        self.planner.sync_position(&self.sys.position);
        self.stepper.reset(
            &mut self.board,
            &self.settings,
            self.sys.state,
            false,
        );
        self.gc.sync_position(&self.settings, &self.sys.position);
        self.spindle_stop();

        if was_alarm_or_sleep {
            // Position cannot be trusted until homed or unlocked.
            self.sys.state = MachineState::Alarm;
        }
        info!(state = ?self.sys.state, "controller initialized");
    }

    /// Run up to `budget` step-timer ticks. Used by the cooperative wait
    /// loops (homing, dwell, synchronize) and by the host pacing loop; each
    /// tick is one timer fire.
    pub fn run_stepper_ticks(&mut self, budget: u32) {
        for _ in 0..budget {
            if !self.stepper.is_running() {
                return;
            }
            self.stepper
                .tick(&mut self.board, &mut self.sys, &self.settings, &self.rt);
        }
    }

    /// Force-kill the stepper and return step control to normal operation.
    pub fn stepper_reset(&mut self) {
        let state = self.sys.state;
        let alarmed = self.rt.alarm().is_some();
        self.stepper
            .reset(&mut self.board, &self.settings, state, alarmed);
        self.sys.step_control = StepControl::empty();
    }

    /// The head block's profile is about to change for a hold: capture the
    /// stepper's in-flight speed as the block's new entry speed.
    pub fn stepper_capture_hold_entry(&mut self) {
        if let Some(speed_sqr) = self.stepper.plan_block_parameters_changed() {
            if let Some(block) = self.planner.current_block_mut() {
                block.entry_speed_sqr = speed_sqr;
            }
        }
    }
}
