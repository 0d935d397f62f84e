// src/utils.rs

//! A collection of utility functions for platform-specific operations.
//!
//! This module provides helpers for:
//! - Reading Android system properties (environment variables off-device).
//! - Waiting on descriptors with `poll`.
//! - Issuing character-device ioctls.

use anyhow::Result;
use std::io::Error;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::Duration;

// --- Android Property Utilities ---

/// Retrieves an Android system property value. Empty when unset.
#[cfg(target_os = "android")]
pub fn get_property(name: &str) -> Result<String> {
    use std::ffi::{CString, c_char};

    let name = CString::new(name)?;
    let mut buf = vec![0u8; 92]; // PROP_VALUE_MAX
    let len = unsafe { __system_property_get(name.as_ptr(), buf.as_mut_ptr() as *mut c_char) };
    if len > 0 {
        Ok(String::from_utf8_lossy(&buf[..len as usize]).to_string())
    } else {
        Ok(String::new())
    }
}

/// Off-device builds map `persist.qmiproxyd.reserved_number` to `QMIPROXYD_RESERVED_NUMBER`.
#[cfg(not(target_os = "android"))]
pub fn get_property(name: &str) -> Result<String> {
    let key = name
        .rsplit_once("qmiproxyd.")
        .map_or(name, |(_, key)| key)
        .replace('.', "_")
        .to_uppercase();
    Ok(std::env::var(format!("QMIPROXYD_{}", key)).unwrap_or_default())
}

// --- Descriptor Utilities ---

fn timeout_ms(timeout: Duration) -> libc::c_int {
    timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

/// Waits until any of `fds` has `events` pending and reports which ones do.
///
/// An interrupted wait reports nothing ready. Hang-ups and errors count as
/// ready so the following read observes them.
pub fn poll_fds(fds: &[BorrowedFd<'_>], events: libc::c_short, timeout: Duration) -> std::io::Result<Vec<bool>> {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|fd| libc::pollfd {
            fd: fd.as_raw_fd(),
            events,
            revents: 0,
        })
        .collect();
    let ret = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms(timeout)) };
    if ret < 0 {
        let err = Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }
    Ok(pfds.iter().map(|p| p.revents != 0).collect())
}

/// Waits for a single descriptor to become readable.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> std::io::Result<bool> {
    Ok(poll_fds(&[fd], libc::POLLIN, timeout)?[0])
}

/// Waits for a single descriptor to accept a write.
pub fn wait_writable(fd: BorrowedFd<'_>, timeout: Duration) -> std::io::Result<bool> {
    Ok(poll_fds(&[fd], libc::POLLOUT, timeout)?[0])
}

// --- ioctl Request Encoding ---

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;
const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;
const IOC_NONE: u32 = 0;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u32, nr: u32, size: u32) -> u32 {
    (dir << IOC_DIRSHIFT) | (ty << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT) | (size << IOC_SIZESHIFT)
}

/// Equivalent of the kernel's `_IO(ty, nr)`.
pub const fn io(ty: u32, nr: u32) -> u32 {
    ioc(IOC_NONE, ty, nr, 0)
}

/// Equivalent of the kernel's `_IOR(ty, nr, int)`.
pub const fn ior_int(ty: u32, nr: u32) -> u32 {
    ioc(IOC_READ, ty, nr, std::mem::size_of::<libc::c_int>() as u32)
}

/// Issues an argument-less ioctl.
pub fn ioctl_none(fd: BorrowedFd<'_>, request: u32) -> std::io::Result<()> {
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Issues an ioctl that fills in an `int`.
pub fn ioctl_read_int(fd: BorrowedFd<'_>, request: u32) -> std::io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, &mut value as *mut libc::c_int) };
    if ret < 0 {
        return Err(Error::last_os_error());
    }
    Ok(value)
}

// --- FFI for Android System APIs ---
#[cfg(target_os = "android")]
unsafe extern "C" {
    fn __system_property_get(name: *const std::ffi::c_char, value: *mut std::ffi::c_char) -> u32;
}
