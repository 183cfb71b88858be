//! Realtime flag words shared between producers and the executor.
//!
//! Four small bitset words coordinate the serial RX thread, the stepper tick,
//! the limit check, and the main loop with the realtime executor. Producers
//! OR bits in; only the executor consumes them, by snapshotting the word and
//! clearing the bits it handled. The words are atomics so a producer on the
//! serial thread never tears a read on the executor side.

use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

use crate::codes::Alarm;

bitflags! {
    /// Realtime execution events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RtEvent: u8 {
        /// Soft reset: unwind everything back to the boot loop.
        const RESET         = 1 << 0;
        /// Emit a realtime status report.
        const STATUS_REPORT = 1 << 1;
        /// Start or resume executing queued motion.
        const CYCLE_START   = 1 << 2;
        /// Stepper reports the segment ring drained to a stop.
        const CYCLE_STOP    = 1 << 3;
        /// Decelerate to a controlled stop and suspend.
        const FEED_HOLD     = 1 << 4;
        /// Cancel the in-flight motion (single block).
        const MOTION_CANCEL = 1 << 5;
        /// Enter sleep mode.
        const SLEEP         = 1 << 6;
    }
}

bitflags! {
    /// Feed and rapid override commands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MotionOverride: u8 {
        const FEED_RESET        = 1 << 0;
        const FEED_COARSE_PLUS  = 1 << 1;
        const FEED_COARSE_MINUS = 1 << 2;
        const FEED_FINE_PLUS    = 1 << 3;
        const FEED_FINE_MINUS   = 1 << 4;
        const RAPID_RESET       = 1 << 5;
        const RAPID_MEDIUM      = 1 << 6;
        const RAPID_LOW         = 1 << 7;
    }
}

bitflags! {
    /// Spindle override commands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessoryOverride: u8 {
        const SPINDLE_RESET        = 1 << 0;
        const SPINDLE_COARSE_PLUS  = 1 << 1;
        const SPINDLE_COARSE_MINUS = 1 << 2;
        const SPINDLE_FINE_PLUS    = 1 << 3;
        const SPINDLE_FINE_MINUS   = 1 << 4;
        const SPINDLE_STOP         = 1 << 5;
    }
}

/// The four realtime words.
///
/// Shared by handle between the serial RX thread and the machine core. All
/// accesses are single-word atomics; there is no compound invariant across
/// words, so no lock is needed.
#[derive(Debug, Default)]
pub struct RtFlags {
    state: AtomicU8,
    alarm: AtomicU8,
    motion_override: AtomicU8,
    accessory_override: AtomicU8,
}

impl RtFlags {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
            alarm: AtomicU8::new(0),
            motion_override: AtomicU8::new(0),
            accessory_override: AtomicU8::new(0),
        }
    }

    /// OR event bits in. Producer side.
    #[inline]
    pub fn set_state(&self, ev: RtEvent) {
        self.state.fetch_or(ev.bits(), Ordering::AcqRel);
    }

    /// Clear event bits. Consumer side.
    #[inline]
    pub fn clear_state(&self, ev: RtEvent) {
        self.state.fetch_and(!ev.bits(), Ordering::AcqRel);
    }

    /// Snapshot the event word without clearing.
    #[inline]
    pub fn state(&self) -> RtEvent {
        RtEvent::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// Latch an alarm code. The last writer wins, matching the single-byte
    /// alarm word of the original controller.
    #[inline]
    pub fn set_alarm(&self, alarm: Alarm) {
        self.alarm.store(alarm as u8, Ordering::Release);
    }

    #[inline]
    pub fn clear_alarm(&self) {
        self.alarm.store(0, Ordering::Release);
    }

    /// Pending alarm, if any.
    #[inline]
    pub fn alarm(&self) -> Option<Alarm> {
        Alarm::from_u8(self.alarm.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_motion_override(&self, ov: MotionOverride) {
        self.motion_override.fetch_or(ov.bits(), Ordering::AcqRel);
    }

    /// Snapshot and clear the motion override word in one exchange.
    #[inline]
    pub fn take_motion_override(&self) -> MotionOverride {
        MotionOverride::from_bits_truncate(self.motion_override.swap(0, Ordering::AcqRel))
    }

    #[inline]
    pub fn set_accessory_override(&self, ov: AccessoryOverride) {
        self.accessory_override.fetch_or(ov.bits(), Ordering::AcqRel);
    }

    /// Snapshot and clear the accessory override word in one exchange.
    #[inline]
    pub fn take_accessory_override(&self) -> AccessoryOverride {
        AccessoryOverride::from_bits_truncate(self.accessory_override.swap(0, Ordering::AcqRel))
    }

    /// Clear every word. Used on soft reset.
    pub fn clear_all(&self) {
        self.state.store(0, Ordering::Release);
        self.alarm.store(0, Ordering::Release);
        self.motion_override.store(0, Ordering::Release);
        self.accessory_override.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_set_snapshot_clear() {
        let rt = RtFlags::new();
        rt.set_state(RtEvent::CYCLE_START);
        rt.set_state(RtEvent::STATUS_REPORT);
        let snap = rt.state();
        assert!(snap.contains(RtEvent::CYCLE_START | RtEvent::STATUS_REPORT));
        rt.clear_state(RtEvent::CYCLE_START);
        assert_eq!(rt.state(), RtEvent::STATUS_REPORT);
    }

    #[test]
    fn alarm_latch() {
        let rt = RtFlags::new();
        assert!(rt.alarm().is_none());
        rt.set_alarm(Alarm::HardLimit);
        assert_eq!(rt.alarm(), Some(Alarm::HardLimit));
        rt.clear_alarm();
        assert!(rt.alarm().is_none());
    }

    #[test]
    fn override_take_clears() {
        let rt = RtFlags::new();
        rt.set_motion_override(MotionOverride::FEED_COARSE_PLUS);
        let taken = rt.take_motion_override();
        assert_eq!(taken, MotionOverride::FEED_COARSE_PLUS);
        assert!(rt.take_motion_override().is_empty());
    }

    #[test]
    fn producers_on_other_threads() {
        use std::sync::Arc;
        let rt = Arc::new(RtFlags::new());
        let producer = Arc::clone(&rt);
        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                producer.set_state(RtEvent::STATUS_REPORT);
            }
        });
        handle.join().unwrap();
        assert!(rt.state().contains(RtEvent::STATUS_REPORT));
    }
}
