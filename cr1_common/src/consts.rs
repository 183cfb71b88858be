//! Fixed machine constants.
//!
//! Values the controller treats as build-time configuration rather than
//! stored settings. Grouped here so the pipeline crates share one source.

use static_assertions::const_assert;

/// Serial line length, excluding the terminator.
pub const LINE_BUFFER_LEN: usize = 80;

// ─── Planner ────────────────────────────────────────────────────────

/// Plan block ring capacity. One slot is always kept free as the ring gap,
/// and the slot past the head doubles as the system-motion staging slot.
pub const BLOCK_BUFFER_SIZE: usize = 16;

/// Slowest feed the planner will schedule [mm/min]. Guards the step timer
/// against unrepresentably slow rates.
pub const MINIMUM_FEED_RATE: f32 = 1.0;

/// Junction speed floor [mm/min].
pub const MINIMUM_JUNCTION_SPEED: f32 = 0.0;

// ─── Stepper ────────────────────────────────────────────────────────

/// Step segment ring capacity.
pub const SEGMENT_BUFFER_SIZE: usize = 6;

/// Virtual step-timer frequency [ticks/s]. Segment reload values are
/// expressed in these ticks.
pub const STEP_TIMER_HZ: u32 = 1_000_000;

/// Segment generation rate [segments/s]; each segment spans 10 ms.
pub const ACCELERATION_TICKS_PER_SECOND: f32 = 100.0;

/// Hard ceiling on the step frequency [Hz].
pub const MAX_STEP_RATE_HZ: u32 = 30_000;

/// Highest adaptive smoothing level. Level L multiplies the timer grid and
/// Bresenham counts by 2^L.
pub const MAX_AMASS_LEVEL: u8 = 3;

/// Step frequencies [Hz] below which smoothing levels 1..=3 engage.
pub const AMASS_LEVEL1_HZ: u32 = 8_000;
pub const AMASS_LEVEL2_HZ: u32 = 4_000;
pub const AMASS_LEVEL3_HZ: u32 = 2_000;

/// Dwell execution quantum [ms].
pub const DWELL_TIME_STEP_MS: u16 = 50;

// Single-producer/single-consumer ring advancement relies on these.
const_assert!(BLOCK_BUFFER_SIZE.is_power_of_two());
const_assert!(SEGMENT_BUFFER_SIZE >= 2);
const_assert!((MAX_STEP_RATE_HZ as u64) < STEP_TIMER_HZ as u64);

// ─── Homing ─────────────────────────────────────────────────────────

/// Search distance = this scalar times max travel. Must exceed 1.0 so the
/// switch is guaranteed to be engaged.
pub const HOMING_AXIS_SEARCH_SCALAR: f32 = 1.5;

/// Locate distance = this scalar times the pull-off. Must exceed 1.0 so the
/// switch is guaranteed to clear.
pub const HOMING_AXIS_LOCATE_SCALAR: f32 = 5.0;

/// Locate passes after the initial approach.
pub const N_HOMING_LOCATE_CYCLE: u8 = 2;

/// First pull-away distance [mm], before the stored pull-off takes over.
pub const DISTANCE_FIRST_PULLAWAY: f32 = 5.0;

// ─── Overrides ──────────────────────────────────────────────────────

pub const DEFAULT_FEED_OVERRIDE: u8 = 100;
pub const MAX_FEED_RATE_OVERRIDE: u8 = 200;
pub const MIN_FEED_RATE_OVERRIDE: u8 = 10;
pub const FEED_OVERRIDE_COARSE_INCREMENT: u8 = 10;
pub const FEED_OVERRIDE_FINE_INCREMENT: u8 = 1;

pub const DEFAULT_RAPID_OVERRIDE: u8 = 100;
pub const RAPID_OVERRIDE_MEDIUM: u8 = 50;
pub const RAPID_OVERRIDE_LOW: u8 = 25;

pub const DEFAULT_SPINDLE_SPEED_OVERRIDE: u8 = 100;
pub const MAX_SPINDLE_SPEED_OVERRIDE: u8 = 200;
pub const MIN_SPINDLE_SPEED_OVERRIDE: u8 = 10;
pub const SPINDLE_OVERRIDE_COARSE_INCREMENT: u8 = 10;
pub const SPINDLE_OVERRIDE_FINE_INCREMENT: u8 = 1;

// ─── Spindle PWM ────────────────────────────────────────────────────

pub const SPINDLE_PWM_MAX_VALUE: u8 = 255;
pub const SPINDLE_PWM_MIN_VALUE: u8 = 1;
pub const SPINDLE_PWM_OFF_VALUE: u8 = 0;

// ─── Arcs ───────────────────────────────────────────────────────────

/// Small-angle arc segments between exact trig corrections.
pub const N_ARC_CORRECTION: u8 = 12;

/// Below this angular travel [rad] an arc is treated as a full circle.
pub const ARC_ANGULAR_TRAVEL_EPSILON: f32 = 5e-7;

// ─── Reporting ──────────────────────────────────────────────────────

/// Status reports between refreshed override fields.
pub const REPORT_OVR_REFRESH_IDLE_COUNT: u8 = 10;
pub const REPORT_OVR_REFRESH_BUSY_COUNT: u8 = 20;

/// Status reports between refreshed work-coordinate-offset fields.
pub const REPORT_WCO_REFRESH_IDLE_COUNT: u8 = 10;
pub const REPORT_WCO_REFRESH_BUSY_COUNT: u8 = 30;
