// src/error.rs

//! The error taxonomy shared by the proxy loop and its engines.

use std::fmt;
use thiserror::Error;

use crate::qmi::FrameError;

/// Identifies one of the two transports the proxy owns.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Side {
    /// The application processor, reached over the USB control channel.
    Host,
    /// The baseband, reached over the shared-memory channel.
    Dsp,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Host => Side::Dsp,
            Side::Dsp => Side::Host,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Host => f.write_str("host"),
            Side::Dsp => f.write_str("baseband"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    /// A frame could not be parsed, or a synthesized one did not fit.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),
    /// The peer did not answer a handshake step in time; the sequence is abandoned.
    #[error("timed out waiting for {0}")]
    HandshakeTimeout(&'static str),
    #[error("a simulated call is already in progress")]
    CallInProgress,
    #[error("the task table is full")]
    TableFull,
    #[error("the client table is full ({0} entries)")]
    TrackerOverflow(usize),
    /// The only condition that escapes the proxy loop: the device must be reopened.
    #[error("{0} transport closed")]
    TransportClosed(Side),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
