// src/main.rs

//! Main entry point for the qmiproxyd daemon.
//!
//! # Architecture Overview
//!
//! The daemon sits on the control channel between the application processor
//! (the "host", reached over a USB gadget device) and the baseband DSP. Every
//! QMI frame passes through it:
//!
//! ```ascii
//!  +-----------+   rmnet_ctrl   +---------------------------+   smdcntl8   +-----------+
//!  |   Host    | <============> |         qmiproxyd         | <==========> | Baseband  |
//!  +-----------+                |                           |              +-----------+
//!                               |  proxy loop (owns I/O)    |
//!                               |   +- client tracker       |
//!                               |   +- call engine          |
//!                               |   +- sms engine           |
//!                               |        ^                  |
//!                               |        | Job (mpsc)       |
//!                               |  scheduler thread (1 Hz)  |
//!                               +---------------------------+
//! ```
//!
//! ## Key Behaviours:
//!
//! 1.  **Relay:** Frames are forwarded unchanged unless an engine claims them.
//! 2.  **Storm Recovery:** When the host keeps allocating clients without
//!     releasing them, every possible client is released and the host link is
//!     bounced.
//! 3.  **Reserved Number:** Calls and messages to the reserved number never
//!     reach the network; the daemon answers them itself.
//! 4.  **Tasks:** Reminders and call-backs are kept in a persisted table and
//!     fired by the scheduler thread.
//!
//! This binary has multiple modes of operation based on its command-line arguments:
//! - No arguments: Starts the proxy daemon.
//! - `version`: Prints the daemon version.
//! - `tasks`: Prints the pending tasks in the persisted task table.

mod call;
mod commands;
mod config;
mod constants;
mod error;
mod pdu;
mod peripherals;
mod proxy;
mod qmi;
mod scheduler;
mod sms;
mod tracker;
mod transport;
mod utils;

use crate::commands::ChatCommands;
use crate::config::Settings;
use crate::constants::{PROXY_VERSION, REOPEN_BACKOFF};
use crate::error::{ProxyError, Side};
use crate::peripherals::{LoggingAudio, LoggingWaker};
use crate::proxy::{Collaborators, Proxy};
use crate::scheduler::TaskTable;
use crate::transport::Endpoint;
use log::{error, info, warn};
use std::path::Path;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

/// Initializes the Android logger with a specific tag.
fn init_android_logger(tag: &str) {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(constants::MAX_LOG_LEVEL)
            .with_tag(tag),
    );
}

/// Parses command-line arguments and dispatches to the correct logic.
fn start() {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("version") => {
            println!("qmiproxyd {}", PROXY_VERSION);
        }
        Some("tasks") => {
            let settings = Settings::load();
            let table = TaskTable::load(&settings.task_file);
            let mut empty = true;
            for (id, task) in table.pending() {
                empty = false;
                println!("{:>3} {:?} {:?} at {} {}", id, task.kind, task.status, task.exec_time, task.arg);
            }
            if empty {
                println!("No pending tasks in {}", settings.task_file.display());
            }
        }
        _ => {
            // Default to starting the proxy daemon.
            if let Err(e) = main_daemon_entry() {
                error!("qmiproxyd failed: {:?}", e);
            }
        }
    }
}

/// Opens a transport device, retrying until it appears.
fn open_endpoint(path: &Path, side: Side) -> Endpoint {
    loop {
        match Endpoint::open(path, side) {
            Ok(endpoint) => {
                info!("Opened {} transport {}", side, path.display());
                return endpoint;
            }
            Err(e) => {
                warn!("Cannot open {} ({}): {}; retrying", path.display(), side, e);
                thread::sleep(REOPEN_BACKOFF);
            }
        }
    }
}

/// The main entry point for the proxy daemon.
/// It loads settings, starts the scheduler and runs the proxy loop forever.
fn main_daemon_entry() -> anyhow::Result<()> {
    let settings = Settings::load();
    info!("Starting qmiproxyd {} with {:?}", PROXY_VERSION, settings);

    let tasks = Arc::new(Mutex::new(TaskTable::load(&settings.task_file)));
    let (jobs_tx, jobs_rx) = mpsc::channel();
    scheduler::spawn(tasks.clone(), jobs_tx)?;

    let host = open_endpoint(&settings.host_device, Side::Host);
    let dsp = open_endpoint(&settings.dsp_device, Side::Dsp);
    let collaborators = Collaborators {
        interpreter: Box::new(ChatCommands::new(tasks.clone())),
        audio: Box::<LoggingAudio>::default(),
        waker: Box::new(LoggingWaker),
    };
    let mut proxy = Proxy::new(host, dsp, settings.clone(), jobs_rx, tasks, collaborators);

    loop {
        match proxy.run() {
            Err(ProxyError::TransportClosed(side)) => {
                warn!("The {} transport closed; reopening", side);
                let path = match side {
                    Side::Host => &settings.host_device,
                    Side::Dsp => &settings.dsp_device,
                };
                thread::sleep(REOPEN_BACKOFF);
                proxy.replace_endpoint(open_endpoint(path, side));
            }
            Err(e) => {
                error!("Proxy loop stopped: {}", e);
                thread::sleep(REOPEN_BACKOFF);
            }
            Ok(never) => match never {},
        }
    }
}

fn main() {
    // Use the binary name as the log tag.
    let arg0 = std::env::args().next().unwrap_or_default();
    let process_name = arg0.split('/').next_back().unwrap_or("qmiproxyd");
    init_android_logger(process_name);

    start();
}
