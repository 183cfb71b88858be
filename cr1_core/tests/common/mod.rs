#![allow(dead_code)]
//! Shared harness for the controller integration tests.
//!
//! Builds a full machine over the simulated CR1 frame with in-memory
//! storage, captures serial output in a `Vec<u8>`, and provides the
//! scripted serial source that ends the protocol loop with a soft reset
//! once its bytes run out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use cr1_common::rt::{RtEvent, RtFlags};
use cr1_core::serial::{peel, SerialByte, SerialRx};
use cr1_core::Machine;
use cr1_hal::{MemStorage, SimBoard};

pub type TestMachine = Machine<SimBoard, MemStorage, Vec<u8>>;

/// Step positions of the simulated switches. The X switch sits at -100 mm
/// from the boot position, outside the soft-limit envelope but within the
/// homing search; Y and Z switches sit +5 mm above their start.
pub const X_SWITCH: i64 = -40_000;
pub const Y_SWITCH: i64 = 2_000;
pub const Z_SWITCH: i64 = 2_000;

pub fn machine() -> TestMachine {
    machine_with_board(SimBoard::with_switches(X_SWITCH, Y_SWITCH, Z_SWITCH))
}

pub fn machine_with_board(board: SimBoard) -> TestMachine {
    let rt = Arc::new(RtFlags::new());
    let mut machine = Machine::new(board, MemStorage::new(), Vec::new(), rt);
    machine.boot_init();
    machine
}

/// Take everything written to the serial output so far.
pub fn drain_output(machine: &mut TestMachine) -> String {
    String::from_utf8(std::mem::take(machine.report.writer_mut())).expect("utf8 output")
}

/// Queue a realtime event after a delay, from the producer side. Stands in
/// for the operator pressing a key while the machine is parked in a wait
/// loop.
pub fn send_event_after(machine: &TestMachine, event: RtEvent, delay: Duration) {
    let rt = Arc::clone(&machine.rt);
    std::thread::spawn(move || {
        std::thread::sleep(delay);
        rt.set_state(event);
    });
}

/// Acknowledge the next alarm with a reset, operator-style: wait for the
/// alarm to latch, give the executor time to enter its lockout loop, then
/// send the reset.
pub fn reset_when_alarmed(machine: &TestMachine) {
    let rt = Arc::clone(&machine.rt);
    std::thread::spawn(move || {
        for _ in 0..10_000 {
            if rt.alarm().is_some() {
                std::thread::sleep(Duration::from_millis(20));
                rt.set_state(RtEvent::RESET);
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    });
}

/// Run the executor and the tick pump until the machine is idle with an
/// empty queue.
pub fn run_until_idle(machine: &mut TestMachine) {
    machine.auto_cycle_start();
    machine.buffer_synchronize();
}

/// Scripted serial source: delivers its bytes, peeling realtime commands in
/// order, then issues a soft reset so `main_loop` returns.
pub struct ScriptRx {
    queue: VecDeque<u8>,
    rt: Arc<RtFlags>,
    reset_sent: bool,
}

impl ScriptRx {
    pub fn new(machine: &TestMachine) -> Self {
        Self {
            queue: VecDeque::new(),
            rt: Arc::clone(&machine.rt),
            reset_sent: false,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.queue.extend(line.as_bytes());
        self.queue.push_back(b'\n');
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.queue.extend(bytes);
    }
}

impl SerialRx for ScriptRx {
    fn read_byte(&mut self) -> Option<u8> {
        while let Some(byte) = self.queue.pop_front() {
            match peel(byte, &self.rt) {
                SerialByte::Data(data) => return Some(data),
                SerialByte::Realtime => continue,
            }
        }
        if !self.reset_sent {
            self.reset_sent = true;
            self.rt.set_state(RtEvent::RESET);
        }
        None
    }
}
