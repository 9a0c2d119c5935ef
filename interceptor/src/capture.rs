// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::*;
use nix::sys::socket::SockFlag;

use packet_ring::RingBuffer;

use crate::packet::{parse_frame, PacketRecord};
use crate::sock;
use crate::Error;

/// Largest frame expected from one recv.
const RECV_BUFFER_LEN: usize = 65535;

/// How long one recv may block before the stop flag is rechecked.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// The sole producer for the packet buffer. Owns the sniff interface's raw
/// socket (in promiscuous mode) and one thread that parses each captured
/// frame and writes the record to the shared buffer.
pub struct PacketCapture {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PacketCapture {
    /// Open the sniff socket and start capturing. Opening the socket is the
    /// only fallible step and fails fast at startup.
    pub fn start(ifname: &str, buffer: Arc<RingBuffer<PacketRecord>>) -> Result<Self, Error> {
        let fd = sock::open_bound(ifname, SockFlag::empty())?;
        sock::enable_promiscuous(&fd, ifname)?;
        sock::set_receive_timeout(&fd, POLL_TIMEOUT)?;

        info!("capturing on {ifname}");

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || capture_loop(fd, &buffer, &stop))
        };

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            crate::join_with_timeout(thread, "capture");
        }
    }
}

fn capture_loop(fd: OwnedFd, buffer: &RingBuffer<PacketRecord>, stop: &AtomicBool) {
    let mut frame = vec![0u8; RECV_BUFFER_LEN];

    while !stop.load(Ordering::Relaxed) {
        // SAFETY: the pointer and length describe a live, writable slice.
        let rc = unsafe {
            libc::recv(
                fd.as_raw_fd(),
                frame.as_mut_ptr() as *mut libc::c_void,
                frame.len(),
                0,
            )
        };

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            match err.kind() {
                // The receive timeout elapsed; go recheck the stop flag.
                std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted => {}
                _ => {
                    error!("capture recv: {err}");
                    thread::sleep(Duration::from_millis(1));
                }
            }
            continue;
        }

        // Parse before write, so the buffer lock is never held while the
        // frame is being interpreted.
        let record = parse_frame(&frame[..rc as usize]);
        buffer.write(record);
    }

    info!("capture stopped");
}
