// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use interceptor::capture::PacketCapture;
use interceptor::packet::PacketRecord;
use packet_ring::RingBuffer;

/// Capture on an interface and print one line per parsed frame. Useful for
/// checking what a detector would see before writing rules.
#[derive(Parser)]
struct Cli {
    /// Interface to sniff.
    #[arg(long)]
    iface: String,

    #[arg(long, default_value_t = 1024)]
    capacity: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Cli::parse();

    let buffer = Arc::new(RingBuffer::new(args.capacity)?);
    let reader = buffer.register(Some("sniffdump"));
    let capture = PacketCapture::start(&args.iface, Arc::clone(&buffer))?;

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;

    while !term.load(Ordering::Relaxed) {
        let items = buffer.read_with_metadata(reader, 64)?;
        if items.is_empty() {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }
        for item in items {
            println!("[{}] {}", item.version, summarize(&item.data));
        }
    }

    capture.stop();

    Ok(())
}

fn summarize(record: &PacketRecord) -> String {
    match record {
        PacketRecord::Ipv4 {
            src,
            dst,
            tcp: Some(tcp),
        } => format!(
            "IPv4 TCP {src}:{} -> {dst}:{} seq={} ack={} flags={:#04x}",
            tcp.sport, tcp.dport, tcp.seq, tcp.ack, tcp.flags
        ),
        PacketRecord::Ipv4 { src, dst, tcp: None } => format!("IPv4 {src} -> {dst}"),
        PacketRecord::Ipv6 {
            src,
            dst,
            tcp: Some(tcp),
        } => format!("IPv6 TCP {src}:{} -> {dst}:{}", tcp.sport, tcp.dport),
        PacketRecord::Ipv6 { src, dst, tcp: None } => format!("IPv6 {src} -> {dst}"),
        PacketRecord::Other => "non-IP frame".to_string(),
    }
}
