//! # CR1 Controller Core
//!
//! Firmware core of the CR1 three-axis mill: a streamed G-code front end over
//! a serial line, a look-ahead velocity planner, a time-sliced step-segment
//! engine, and the realtime executor that coordinates resets, holds,
//! overrides, homing, and alarms across them.
//!
//! ## Pipeline
//!
//! 1. **G-code / console** (`gcode`, `console`): one line in, status code out.
//! 2. **Motion control** (`motion`): policy layer for soft limits, arcs,
//!    dwells, homing entry, probe cycles.
//! 3. **Planner** (`planner`): ring of line segments with look-ahead
//!    junction and trapezoid planning.
//! 4. **Stepper** (`stepper`): slices planned blocks into constant-rate step
//!    segments and emits Bresenham-distributed pulses on a timer tick.
//!
//! The realtime executor (`protocol`) reacts to flag words produced by the
//! serial peeler, the stepper tick, and the limit check, and owns the global
//! state machine.
//!
//! Hardware access goes exclusively through the `cr1_hal` capabilities, so
//! the whole core runs host-side against the simulated board.

pub mod console;
pub mod gcode;
pub mod jog;
pub mod limits;
pub mod machine;
pub mod motion;
pub mod planner;
pub mod probe;
pub mod protocol;
pub mod report;
pub mod serial;
pub mod settings_store;
pub mod spindle;
pub mod stepper;

pub use machine::{Machine, SysState};
