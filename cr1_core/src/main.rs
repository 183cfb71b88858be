//! # CR1 controller host binary
//!
//! Runs the controller core against the simulated board: stdin is the
//! serial RX (realtime bytes peeled on the reader thread, exactly like the
//! receive interrupt), stdout is the serial TX, and the non-volatile image
//! persists to a file between runs. Logging goes to stderr so the wire
//! protocol stays clean.

use std::io::Read;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use cr1_common::rt::RtFlags;
use cr1_core::serial::{peel, SerialByte, SerialRx};
use cr1_core::Machine;
use cr1_hal::{FileStorage, SimBoard};

#[derive(Parser)]
#[command(name = "cr1", about = "CR1 motion controller core (simulated board)")]
struct Cli {
    /// Non-volatile storage image path.
    #[arg(long, default_value = "cr1-nvs.bin")]
    nvs: PathBuf,

    /// Optional TOML board profile (switch positions, gantry skew).
    #[arg(long)]
    profile: Option<PathBuf>,
}

/// Simulated-frame geometry, in steps.
#[derive(Debug, Default, Deserialize)]
struct BoardProfile {
    x_switch_steps: Option<i64>,
    y_switch_steps: Option<i64>,
    z_switch_steps: Option<i64>,
    #[serde(default)]
    x1_skew_steps: i64,
}

fn build_board(profile: Option<&BoardProfile>) -> SimBoard {
    // Default frame: switches 1.2 travels out, matching a machine parked
    // mid-envelope at power-on.
    let mut board = SimBoard::with_switches(-34_600, 48_300, 15_700);
    if let Some(p) = profile {
        if let Some(x) = p.x_switch_steps {
            board.switches[0].trip_below = Some(x);
            board.x1_trip_below = Some(x);
        }
        if let Some(y) = p.y_switch_steps {
            board.switches[1].trip_above = Some(y);
        }
        if let Some(z) = p.z_switch_steps {
            board.switches[2].trip_above = Some(z);
        }
        board.x1_skew_steps = p.x1_skew_steps;
    }
    board
}

/// Receive side of the stdin reader thread.
struct ChannelRx {
    rx: mpsc::Receiver<u8>,
}

impl SerialRx for ChannelRx {
    fn read_byte(&mut self) -> Option<u8> {
        // A short blocking window keeps the idle loop from spinning while
        // staying responsive to the stepper pump.
        self.rx
            .recv_timeout(std::time::Duration::from_micros(200))
            .ok()
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let profile = cli.profile.as_ref().and_then(|path| {
        match std::fs::read_to_string(path).map_err(|e| e.to_string()).and_then(|text| {
            toml::from_str::<BoardProfile>(&text).map_err(|e| e.to_string())
        }) {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "board profile ignored");
                None
            }
        }
    });

    let board = build_board(profile.as_ref());
    let nvs = match FileStorage::open(&cli.nvs) {
        Ok(nvs) => nvs,
        Err(e) => {
            eprintln!("cannot open nvs image {}: {e}", cli.nvs.display());
            std::process::exit(1);
        }
    };

    let rt = Arc::new(RtFlags::new());

    // The reader thread is the receive-interrupt analog: it peels realtime
    // bytes straight into the flag words and queues the rest.
    let (tx, rx) = mpsc::sync_channel::<u8>(1024);
    {
        let rt = Arc::clone(&rt);
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for byte in stdin.lock().bytes() {
                let Ok(byte) = byte else { break };
                if let SerialByte::Data(data) = peel(byte, &rt) {
                    if tx.send(data).is_err() {
                        break;
                    }
                }
            }
        });
    }
    let mut serial = ChannelRx { rx };

    let mut machine = Machine::new(board, nvs, std::io::stdout(), rt);
    info!(nvs = %cli.nvs.display(), "cr1 core starting");

    // Boot loop: a soft reset unwinds the protocol loop back to here.
    loop {
        machine.boot_init();
        machine.report.welcome();
        if machine.settings_restored_at_boot {
            machine.report.status(cr1_common::codes::Status::SettingReadFail);
            machine.settings_restored_at_boot = false;
        }
        machine.main_loop(&mut serial);
    }
}
