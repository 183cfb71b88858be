//! Machine state and the sub-state flag words.
//!
//! `MachineState` is the single global lifecycle state owned by the realtime
//! executor. `Suspend` and `StepControl` are the two auxiliary flag words the
//! executor and the stepper share while a hold, cancel, sleep, or system
//! motion is in progress. `SpindleStop` tracks the spindle-stop override
//! cascade during a feed hold.

use bitflags::bitflags;

/// Global machine lifecycle state.
///
/// Only the realtime executor mutates this, always from the main context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MachineState {
    /// Ready, no motion queued or running.
    #[default]
    Idle = 0,
    /// Executing buffered motion.
    Cycle = 1,
    /// Feed hold in progress or complete, waiting for resume.
    Hold = 2,
    /// Executing a jog motion.
    Jog = 3,
    /// Homing cycle in progress.
    Homing = 4,
    /// Locked out after a critical event. Only reset and status reports accepted.
    Alarm = 5,
    /// G-code check mode: parse and consume lines without motion.
    CheckMode = 6,
    /// Low-power state. Spindle and steppers de-energized until reset.
    Sleep = 7,
}

impl MachineState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Cycle),
            2 => Some(Self::Hold),
            3 => Some(Self::Jog),
            4 => Some(Self::Homing),
            5 => Some(Self::Alarm),
            6 => Some(Self::CheckMode),
            7 => Some(Self::Sleep),
            _ => None,
        }
    }

    /// States in which a hold request is accepted.
    #[inline]
    pub const fn accepts_hold(&self) -> bool {
        !matches!(self, Self::Alarm | Self::CheckMode)
    }

    /// States in which motion is actively being stepped.
    #[inline]
    pub const fn is_motion(&self) -> bool {
        matches!(self, Self::Cycle | Self::Jog | Self::Homing)
    }
}

bitflags! {
    /// Suspend sub-states maintained while a hold, sleep, or cancel runs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Suspend: u8 {
        /// Deceleration finished; machine is stopped and ready to resume.
        const HOLD_COMPLETE    = 1 << 0;
        /// Sleep retract actions (spindle off) have completed.
        const RETRACT_COMPLETE = 1 << 1;
        /// Restore actions must restart from the retracted state.
        const RESTART_RETRACT  = 1 << 2;
        /// Resume requested; restore accessory state before cycling.
        const INITIATE_RESTORE = 1 << 3;
        /// Accessory state restored; cycle start may proceed.
        const RESTORE_COMPLETE = 1 << 4;
        /// An active jog is being cancelled and flushed.
        const JOG_CANCEL       = 1 << 5;
        /// The in-flight motion is being cancelled (probe/abort path).
        const MOTION_CANCEL    = 1 << 6;
    }
}

bitflags! {
    /// Stepper-executor coordination flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StepControl: u8 {
        /// Decelerate the active block to zero and stop.
        const EXECUTE_HOLD       = 1 << 0;
        /// Executing a system motion (homing/squaring) outside the queue.
        const EXECUTE_SYS_MOTION = 1 << 1;
        /// Carry a recomputed spindle PWM out with the next segment.
        const UPDATE_SPINDLE_PWM = 1 << 2;
        /// Prep finished the current motion; generate no further segments
        /// until the executor acknowledges the stop.
        const END_MOTION         = 1 << 3;
    }
}

bitflags! {
    /// Spindle-stop override cascade, active only during feed hold.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SpindleStop: u8 {
        /// Stop requested; spindle not yet de-energized.
        const INITIATE      = 1 << 0;
        /// Spindle is stopped by override.
        const ENABLED       = 1 << 1;
        /// Restore the spindle, stay held.
        const RESTORE       = 1 << 2;
        /// Restore the spindle, then resume the cycle.
        const RESTORE_CYCLE = 1 << 3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_state_roundtrip() {
        for v in 0..=7u8 {
            let state = MachineState::from_u8(v).unwrap();
            assert_eq!(state as u8, v);
        }
        assert!(MachineState::from_u8(8).is_none());
        assert!(MachineState::from_u8(255).is_none());
    }

    #[test]
    fn hold_acceptance() {
        assert!(MachineState::Idle.accepts_hold());
        assert!(MachineState::Cycle.accepts_hold());
        assert!(MachineState::Jog.accepts_hold());
        assert!(!MachineState::Alarm.accepts_hold());
        assert!(!MachineState::CheckMode.accepts_hold());
    }

    #[test]
    fn motion_states() {
        assert!(MachineState::Cycle.is_motion());
        assert!(MachineState::Homing.is_motion());
        assert!(MachineState::Jog.is_motion());
        assert!(!MachineState::Idle.is_motion());
        assert!(!MachineState::Hold.is_motion());
    }

    #[test]
    fn suspend_flags_compose() {
        let mut s = Suspend::default();
        assert!(s.is_empty());
        s |= Suspend::HOLD_COMPLETE;
        s |= Suspend::JOG_CANCEL;
        assert!(s.contains(Suspend::HOLD_COMPLETE));
        s.remove(Suspend::HOLD_COMPLETE);
        assert_eq!(s, Suspend::JOG_CANCEL);
    }
}
