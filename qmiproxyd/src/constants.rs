// src/constants.rs

//! Defines global constants, enums, and bitflags used throughout the project.

use bitflags::bitflags;
use log::LevelFilter;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::time::Duration;

// --- Versioning Constants ---

/// The version of the proxy daemon itself.
pub const PROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

// --- Configuration Constants ---

/// The maximum log level for the daemon. Set to `Trace` for debug builds and `Info` for release builds.
#[cfg(debug_assertions)]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Trace;
#[cfg(not(debug_assertions))]
pub const MAX_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// USB-backed control channel facing the application processor.
pub const DEFAULT_HOST_DEVICE: &str = "/dev/rmnet_ctrl";
/// Shared-memory channel facing the baseband.
pub const DEFAULT_DSP_DEVICE: &str = "/dev/smdcntl8";
/// Flat record file holding the scheduler's task table.
pub const DEFAULT_TASK_FILE: &str = "/persist/qmiproxyd/tasks.bin";
/// The pseudo-number the daemon answers on for simulated calls and chat SMS.
pub const DEFAULT_RESERVED_NUMBER: &str = "+223344556677";

/// Live instances of one service above which a new registration is treated as a stuck host.
pub const DEFAULT_RESET_THRESHOLD: usize = 3;
/// Per-step wait for the host during an SMS injection handshake.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);
/// Gap between the frames of a synthesized call sequence.
pub const DEFAULT_CALL_PACING: Duration = Duration::from_millis(200);

// --- Proxy Loop Constants ---

/// How long the proxy loop blocks in `poll` before servicing commands and line state.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Upper bound on waiting for a descriptor to accept a write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Delay between attempts to reopen a vanished transport.
pub const REOPEN_BACKOFF: Duration = Duration::from_secs(2);

// --- Client Tracker Constants ---

/// Capacity of the registration table.
pub const MAX_CLIENTS: usize = 32;
/// Highest instance id covered by the release sweep.
pub const SWEEP_MAX_INSTANCE: u8 = 5;
/// Total time the release sweep and its drain may take.
pub const RESET_BUDGET: Duration = Duration::from_secs(5);
/// The drain stops once the baseband has been quiet this long.
pub const DRAIN_QUIET: Duration = Duration::from_millis(200);

// --- Scheduler Constants ---

/// Number of slots in the task table.
pub const MAX_TASKS: usize = 255;
/// Maximum length of a task's argument string, in bytes.
pub const MAX_TASK_ARG: usize = 160;
/// Done and Failed slots are reclaimed every this many ticks.
pub const SWEEP_EVERY_TICKS: u32 = 10;

// --- SMS Constants ---

/// Septets that fit in a single SMS-DELIVER.
pub const MAX_SMS_SEPTETS: usize = 160;

// --- QMI Service Identifiers ---

/// QMI services the proxy inspects. Anything else is relayed as opaque bytes.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum Service {
    Control = 0x00,
    Wds = 0x01,
    Dms = 0x02,
    Nas = 0x03,
    Wms = 0x05,
    Voice = 0x09,
    Uim = 0x0B,
}

/// Control-service message ids tracked by the client tracker.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u16)]
pub enum ControlMessage {
    GetClientId = 0x0022,
    ReleaseClientId = 0x0023,
}

/// Voice-service message ids handled by the call engine.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u16)]
pub enum VoiceMessage {
    DialCall = 0x0020,
    EndCall = 0x0021,
    AnswerCall = 0x0022,
    AllCallStatusInd = 0x002E,
}

/// Wireless messaging service ids handled by the SMS engine.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u16)]
pub enum WmsMessage {
    EventReport = 0x0001,
    RawSend = 0x0020,
    RawRead = 0x0022,
    ModifyTag = 0x0023,
    Delete = 0x0024,
}

/// Call states carried in voice status indications.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum CallStatus {
    Origination = 0x01,
    Incoming = 0x02,
    Conversation = 0x03,
    CcInProgress = 0x04,
    Alerting = 0x05,
    Hold = 0x06,
    Waiting = 0x07,
    Disconnecting = 0x08,
    End = 0x09,
    Setup = 0x0A,
}

/// Radio technology a call runs on, as reported in status indications.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum CallMode {
    NoService = 0x00,
    Cdma = 0x01,
    Gsm = 0x02,
    Umts = 0x03,
    Lte = 0x04,
    TdScdma = 0x05,
    Unknown = 0x06,
}

bitflags! {
    /// Control flags byte of the QMUX header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct QmuxFlags: u8 {
        /// The frame was sent by a service (baseband side) rather than a control point.
        const SERVICE = 1 << 7;
    }
}
