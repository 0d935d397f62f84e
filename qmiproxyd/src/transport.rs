// src/transport.rs

//! The two character-device endpoints the proxy owns.
//!
//! Each read returns exactly one frame: both the USB control channel and the
//! shared-memory channel preserve message boundaries.

use log::{trace, warn};
use std::fs::OpenOptions;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::WRITE_TIMEOUT;
use crate::error::{ProxyError, Result, Side};
use crate::qmi::MAX_FRAME_LEN;
use crate::utils;

/// `FRMNET_CTRL_GET_LINE_STATE`: non-zero while the host holds the line open.
const FRMNET_CTRL_GET_LINE_STATE: u32 = utils::ior_int(0xFE, 2);
/// `FRMNET_CTRL_MODEM_OFFLINE`: tells the host the modem went away.
const FRMNET_CTRL_MODEM_OFFLINE: u32 = utils::io(0xFE, 4);
/// `FRMNET_CTRL_MODEM_ONLINE`: tells the host the modem is back.
const FRMNET_CTRL_MODEM_ONLINE: u32 = utils::io(0xFE, 5);

/// An open transport, facing either the host or the baseband.
#[derive(Debug)]
pub struct Endpoint {
    fd: OwnedFd,
    side: Side,
    path: Option<PathBuf>,
}

impl Endpoint {
    /// Opens a character device for reading and writing.
    pub fn open(path: &Path, side: Side) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            fd: file.into(),
            side,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Reads one frame. A zero-length read means the device vanished.
    pub fn read_frame(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let len = rustix::io::read(&self.fd, &mut buf[..]).map_err(std::io::Error::from)?;
        if len == 0 {
            return Err(ProxyError::TransportClosed(self.side));
        }
        buf.truncate(len);
        trace!("{} -> {} bytes", self.side, len);
        Ok(buf)
    }

    /// Waits up to `timeout` for a frame. `None` means nothing arrived.
    pub fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if !utils::wait_readable(self.fd.as_fd(), timeout)? {
            return Ok(None);
        }
        self.read_frame().map(Some)
    }

    /// Writes one frame, waiting a bounded time for the device to accept it.
    pub fn send(&self, frame: &[u8]) -> Result<()> {
        if !utils::wait_writable(self.fd.as_fd(), WRITE_TIMEOUT)? {
            return Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into());
        }
        let written = rustix::io::write(&self.fd, frame).map_err(std::io::Error::from)?;
        if written != frame.len() {
            warn!("Short write to {}: {} of {} bytes", self.side, written, frame.len());
        }
        trace!("{} <- {} bytes", self.side, written);
        Ok(())
    }

    /// Queries whether the host currently holds the control line open.
    pub fn line_state(&self) -> std::io::Result<bool> {
        utils::ioctl_read_int(self.fd.as_fd(), FRMNET_CTRL_GET_LINE_STATE).map(|state| state != 0)
    }

    /// Reports the modem as offline or online to the host.
    pub fn set_modem_online(&self, online: bool) -> std::io::Result<()> {
        let request = if online {
            FRMNET_CTRL_MODEM_ONLINE
        } else {
            FRMNET_CTRL_MODEM_OFFLINE
        };
        utils::ioctl_none(self.fd.as_fd(), request)
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Connected endpoint pairs for exercising the proxy without devices.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use rustix::net::{AddressFamily, SocketFlags, SocketType, socketpair};

    /// Returns `(endpoint, peer)`: the proxy owns the first, the test plays the device on the second.
    pub fn link(side: Side) -> (Endpoint, Endpoint) {
        let (a, b) = socketpair(
            AddressFamily::UNIX,
            SocketType::SEQPACKET,
            SocketFlags::CLOEXEC,
            None,
        )
        .unwrap();
        (wrap(a, side), wrap(b, side))
    }

    fn wrap(fd: OwnedFd, side: Side) -> Endpoint {
        Endpoint { fd, side, path: None }
    }

    /// Collects every frame the peer has pending, waiting `quiet` for stragglers.
    pub fn drain(peer: &Endpoint, quiet: Duration) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = peer.recv(quiet).unwrap() {
            frames.push(frame);
        }
        frames
    }
}
