//! # CR1 Hardware Capability Layer
//!
//! The motion core never names a concrete pin or register. Everything it
//! needs from the electronics is expressed by two capabilities:
//!
//! - [`board::Board`]: step/direction ports, driver enable, limit and probe
//!   pin reads, spindle PWM and direction, the power-level output, and a
//!   millisecond delay.
//! - [`nvs::NvStorage`]: byte-addressed non-volatile memory with
//!   checksummed record access.
//!
//! [`sim::SimBoard`] implements `Board` against a kinematic model of the CR1
//! frame (switch positions on the travel line, step counting), which is what
//! the host binary and the test suites drive.

pub mod board;
pub mod nvs;
pub mod sim;

pub use board::Board;
pub use nvs::{FileStorage, MemStorage, NvStorage, NVS_SIZE};
pub use sim::SimBoard;
