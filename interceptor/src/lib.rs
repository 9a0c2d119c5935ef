// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod capture;
pub mod config;
pub mod packet;
pub mod radar;
pub mod rst;
pub mod ruleset;

mod sock;

use log::*;

use std::fmt;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long a `stop()` call waits for its worker thread to wind down.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The possible errors that can arise from running the interceptor.
///
/// Everything here belongs to the control plane and is fatal at startup.
/// Data-plane failures (a dropped frame, a send that would block, a record
/// that does not parse) are logged where they happen and never become an
/// `Error`.
#[derive(Debug)]
pub enum Error {
    /// A configuration file was not found.
    ConfigMissing(PathBuf),

    /// A configuration file did not parse, or a field failed validation.
    ConfigMalformed(String),

    /// Creating, binding, or configuring a raw packet socket failed.
    Socket(String),

    /// Errors returned by I/O failures.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ConfigMissing(path) => {
                write!(f, "configuration file not found: {}", path.display())
            }
            Self::ConfigMalformed(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Socket(msg) => write!(f, "raw socket error: {msg}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Wait up to [`JOIN_TIMEOUT`] for a worker thread to finish, then join it.
/// A thread that fails to finish in time is detached with a warning rather
/// than blocking shutdown.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, what: &str) {
    let deadline = Instant::now() + JOIN_TIMEOUT;

    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    if handle.is_finished() {
        let _ = handle.join();
    } else {
        warn!("{what} thread did not stop within {JOIN_TIMEOUT:?}; detaching it");
    }
}
