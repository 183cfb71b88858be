//! Straight-probe cycle.
//!
//! The stepper tick owns the fast pin monitor; this module owns the cycle
//! policy: drain the queue, verify the initial pin state, run the motion
//! with the monitor armed, and resolve success or the two failure alarms.
//! Contact cancels the remaining motion through the motion-cancel event, so
//! the machine stops on the captured position without losing steps.

use std::io::Write;

use cr1_common::codes::{Alarm, Status};
use cr1_common::rt::RtEvent;
use cr1_common::settings::SettingsFlags;
use cr1_common::state::MachineState;
use cr1_hal::{Board, NvStorage};
use tracing::debug;

use crate::machine::Machine;
use crate::planner::PlanLineData;
use crate::protocol::TICK_PUMP_BATCH;

impl<B: Board, N: NvStorage, W: Write> Machine<B, N, W> {
    /// Probe pin state with the invert setting applied.
    pub fn probe_triggered(&self) -> bool {
        self.board.probe_pin()
            != self
                .settings
                .flags
                .contains(SettingsFlags::INVERT_PROBE_PIN)
    }

    /// Arm the pin monitor for a toward-workpiece probe.
    fn probe_configure(&mut self) {
        self.sys.probe_invert = self
            .settings
            .flags
            .contains(SettingsFlags::INVERT_PROBE_PIN);
    }

    /// Execute a G38.2 probe toward `target`. On contact the machine stops
    /// and the contact position is latched; without contact the cycle
    /// alarms.
    pub fn mc_probe_cycle(&mut self, target: &[f32; 3], pl_data: &PlanLineData) -> Status {
        if self.sys.state == MachineState::CheckMode {
            return Status::Ok;
        }

        // Probe against a settled machine only.
        self.buffer_synchronize();
        if self.sys.abort {
            return Status::Ok;
        }

        self.sys.probe_succeeded = false;
        self.probe_configure();

        if self.probe_triggered() {
            self.rt.set_alarm(Alarm::ProbeFailInitial);
            self.execute_realtime();
            return Status::Ok;
        }

        self.mc_line(target, pl_data);
        self.sys.probe_active = true;
        self.rt.set_state(RtEvent::CYCLE_START);
        loop {
            self.execute_realtime();
            if self.sys.abort {
                return Status::Ok;
            }
            if self.sys.state == MachineState::Idle {
                break;
            }
            self.run_stepper_ticks(TICK_PUMP_BATCH);
        }

        if self.sys.probe_active {
            // Motion ran out without contact.
            self.sys.probe_active = false;
            self.rt.set_alarm(Alarm::ProbeFailContact);
        } else {
            self.sys.probe_succeeded = true;
            debug!(position = ?self.sys.probe_position, "probe contact");
        }

        self.execute_realtime();
        if self.sys.abort {
            return Status::Ok;
        }

        // Drop the unexecuted remainder of the probe motion and resync.
        self.stepper_reset();
        self.planner.reset();
        self.planner.sync_position(&self.sys.position);
        self.gc.sync_position(&self.settings, &self.sys.position);

        let probe_mm = self.settings.steps_to_mpos(&self.sys.probe_position);
        let succeeded = self.sys.probe_succeeded;
        self.report.probe_record(&probe_mm, succeeded);
        Status::Ok
    }
}
