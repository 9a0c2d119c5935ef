// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::*;

use interceptor::capture::PacketCapture;
use interceptor::config::Config;
use interceptor::radar::{RadarConfig, TcpRadar};
use interceptor::rst::{KillSink, RstSender};
use interceptor::ruleset::RuleSet;
use packet_ring::RingBuffer;

/// Slots in the shared packet buffer. Detectors that fall further behind
/// than this lose packets, which is acceptable for a detector.
const PACKET_BUFFER_CAPACITY: usize = 1024;

#[derive(Parser)]
struct Cli {
    /// Interface configuration, resolved relative to the working directory.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Flow-matching rules, resolved relative to the working directory.
    #[arg(long, default_value = "ruleset.json")]
    ruleset: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Cli::parse();
    let config = Config::load(&args.config)?;
    let ruleset = RuleSet::load(&args.ruleset)?;

    let buffer = Arc::new(RingBuffer::new(PACKET_BUFFER_CAPACITY)?);
    let capture = PacketCapture::start(&config.sniff_ifname, Arc::clone(&buffer))?;

    // One sender shared by every radar, so all rules pointed at the same
    // egress interface share one raw socket.
    let sender: Arc<dyn KillSink> = Arc::new(RstSender::new());

    let mut radars = Vec::new();
    for rule in ruleset.rules {
        let radar_config = RadarConfig {
            rule,
            egress: config.egress.clone(),
        };
        radars.push(TcpRadar::spawn(
            Arc::clone(&buffer),
            radar_config,
            Arc::clone(&sender),
        ));
    }

    if radars.is_empty() {
        warn!("ruleset contains no tcp rules; capturing without detectors");
    }

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;

    while !term.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs(1));
    }

    info!("terminating");
    for radar in radars {
        radar.stop();
    }
    capture.stop();

    let status = buffer.buffer_status();
    info!(
        "processed {} packets ({} overwritten before all detectors saw them)",
        status.stats.writes, status.stats.overwrites
    );

    Ok(())
}
