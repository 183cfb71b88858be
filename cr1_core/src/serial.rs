//! Serial byte classification and the receive-side interface.
//!
//! The RX path peels realtime command bytes out of the stream before line
//! assembly ever sees them: they act on the flag words immediately, from the
//! receive context, which is what makes `!` or `?` work mid-cycle. Every
//! other byte is ordinary line data.

use cr1_common::rt::{AccessoryOverride, MotionOverride, RtEvent, RtFlags};

/// How a received byte is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialByte {
    /// Realtime command; already applied, never enters the line buffer.
    Realtime,
    /// Ordinary data for line assembly.
    Data(u8),
}

/// Classify one byte, applying realtime commands to the flag words.
///
/// Called from the receive context (the RX thread on the host). `0x85` jog
/// cancel maps onto the motion-cancel event; the executor narrows it to jog
/// state itself.
pub fn peel(byte: u8, rt: &RtFlags) -> SerialByte {
    match byte {
        0x18 | b'|' => rt.set_state(RtEvent::RESET),
        b'?' => rt.set_state(RtEvent::STATUS_REPORT),
        b'~' => rt.set_state(RtEvent::CYCLE_START),
        b'!' => rt.set_state(RtEvent::FEED_HOLD),
        0x85 => rt.set_state(RtEvent::MOTION_CANCEL),
        0x90 => rt.set_motion_override(MotionOverride::FEED_RESET),
        0x91 => rt.set_motion_override(MotionOverride::FEED_COARSE_PLUS),
        0x92 => rt.set_motion_override(MotionOverride::FEED_COARSE_MINUS),
        0x93 => rt.set_motion_override(MotionOverride::FEED_FINE_PLUS),
        0x94 => rt.set_motion_override(MotionOverride::FEED_FINE_MINUS),
        0x95 => rt.set_motion_override(MotionOverride::RAPID_RESET),
        0x96 => rt.set_motion_override(MotionOverride::RAPID_MEDIUM),
        0x97 => rt.set_motion_override(MotionOverride::RAPID_LOW),
        0x99 => rt.set_accessory_override(AccessoryOverride::SPINDLE_RESET),
        0x9A => rt.set_accessory_override(AccessoryOverride::SPINDLE_COARSE_PLUS),
        0x9B => rt.set_accessory_override(AccessoryOverride::SPINDLE_COARSE_MINUS),
        0x9C => rt.set_accessory_override(AccessoryOverride::SPINDLE_FINE_PLUS),
        0x9D => rt.set_accessory_override(AccessoryOverride::SPINDLE_FINE_MINUS),
        0x9E => rt.set_accessory_override(AccessoryOverride::SPINDLE_STOP),
        _ => return SerialByte::Data(byte),
    }
    SerialByte::Realtime
}

/// Receive side of the serial link as seen by the protocol loop.
///
/// Implementations deliver data bytes only; realtime bytes must have been
/// peeled in the receive context via [`peel`].
pub trait SerialRx {
    /// Next pending data byte, or `None` when the pipe is momentarily empty.
    fn read_byte(&mut self) -> Option<u8>;

    /// Free receive-buffer space, for the status report.
    fn available_space(&self) -> usize {
        128
    }
}

/// In-memory serial source for tests: bytes are peeled on push, exactly as
/// the receive interrupt would.
#[derive(Debug, Default)]
pub struct BufferRx {
    queue: std::collections::VecDeque<u8>,
}

impl BufferRx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue raw bytes, peeling realtime commands into `rt`.
    pub fn push_bytes(&mut self, bytes: &[u8], rt: &RtFlags) {
        for &b in bytes {
            if let SerialByte::Data(data) = peel(b, rt) {
                self.queue.push_back(data);
            }
        }
    }

    /// Queue one newline-terminated line.
    pub fn push_line(&mut self, line: &str, rt: &RtFlags) {
        self.push_bytes(line.as_bytes(), rt);
        self.queue.push_back(b'\n');
    }

    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }
}

impl SerialRx for BufferRx {
    fn read_byte(&mut self) -> Option<u8> {
        self.queue.pop_front()
    }

    fn available_space(&self) -> usize {
        128usize.saturating_sub(self.queue.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_bytes_never_reach_line_data() {
        let rt = RtFlags::new();
        let mut rx = BufferRx::new();
        rx.push_bytes(b"G1 X1?0\x18", &rt);
        let mut data = Vec::new();
        while let Some(b) = rx.read_byte() {
            data.push(b);
        }
        assert_eq!(&data, b"G1 X10");
        assert!(rt.state().contains(RtEvent::STATUS_REPORT));
        assert!(rt.state().contains(RtEvent::RESET));
    }

    #[test]
    fn pipe_alias_resets() {
        let rt = RtFlags::new();
        assert_eq!(peel(b'|', &rt), SerialByte::Realtime);
        assert!(rt.state().contains(RtEvent::RESET));
    }

    #[test]
    fn override_bytes_map_to_flag_words() {
        let rt = RtFlags::new();
        peel(0x91, &rt);
        peel(0x97, &rt);
        peel(0x9E, &rt);
        assert_eq!(
            rt.take_motion_override(),
            MotionOverride::FEED_COARSE_PLUS | MotionOverride::RAPID_LOW
        );
        assert_eq!(
            rt.take_accessory_override(),
            AccessoryOverride::SPINDLE_STOP
        );
    }

    #[test]
    fn jog_cancel_is_motion_cancel_event() {
        let rt = RtFlags::new();
        peel(0x85, &rt);
        assert!(rt.state().contains(RtEvent::MOTION_CANCEL));
    }
}
