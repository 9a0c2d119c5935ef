// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cidr::Cidr;
use log::*;

use packet_ring::{ReaderId, RingBuffer};

use crate::config::EgressConfig;
use crate::packet::PacketRecord;
use crate::rst::{KillRequest, KillSink};
use crate::ruleset::Rule;

/// A killed flow is left alone for this long; afterwards it is forgotten
/// and becomes killable again.
pub const KILL_WINDOW: Duration = Duration::from_secs(300);

/// Loop iterations between expiry sweeps of the flow table.
const CLEANUP_INTERVAL: u64 = 1000;

/// Sleep when the buffer is drained, and after a failed iteration.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// One direction of one TCP connection. (A, pA, B, pB) and (B, pB, A, pA)
/// are distinct flows: a rule matches only the direction it observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub sport: u16,
    pub dst: IpAddr,
    pub dport: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src, self.sport, self.dst, self.dport
        )
    }
}

/// The flows this radar has already killed, each with the instant of its
/// kill. Time is always passed in so expiry is decided by the caller's
/// clock.
pub struct FlowTable {
    killed: HashMap<FlowKey, Instant>,
    window: Duration,
}

impl FlowTable {
    pub fn new(window: Duration) -> Self {
        Self {
            killed: HashMap::new(),
            window,
        }
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.killed.contains_key(key)
    }

    pub fn insert(&mut self, key: FlowKey, now: Instant) {
        self.killed.insert(key, now);
    }

    /// Forget every flow whose kill is older than the window. Returns how
    /// many were forgotten.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.killed.len();
        self.killed
            .retain(|_, killed_at| now.duration_since(*killed_at) <= self.window);
        before - self.killed.len()
    }

    pub fn len(&self) -> usize {
        self.killed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.killed.is_empty()
    }
}

pub struct RadarConfig {
    pub rule: Rule,
    pub egress: EgressConfig,
}

/// One detector bound to one rule. It owns a reader registration on the
/// shared buffer and a thread that runs the detection loop until stopped.
pub struct TcpRadar {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TcpRadar {
    pub fn spawn(
        buffer: Arc<RingBuffer<PacketRecord>>,
        config: RadarConfig,
        sink: Arc<dyn KillSink>,
    ) -> Self {
        let reader = buffer.register(Some(&format!("radar {}", config.rule)));
        let stop = Arc::new(AtomicBool::new(false));

        info!("radar started for rule {}", config.rule);

        let thread = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || detection_loop(&buffer, reader, &config, sink.as_ref(), &stop))
        };

        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            crate::join_with_timeout(thread, "radar");
        }
    }
}

fn detection_loop(
    buffer: &RingBuffer<PacketRecord>,
    reader: ReaderId,
    config: &RadarConfig,
    sink: &dyn KillSink,
    stop: &AtomicBool,
) {
    let mut flows = FlowTable::new(KILL_WINDOW);
    let mut iterations: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        iterations += 1;
        if iterations % CLEANUP_INTERVAL == 0 {
            let evicted = flows.evict_expired(Instant::now());
            if evicted > 0 {
                debug!("rule {}: forgot {evicted} expired flows", config.rule);
            }
        }

        let records = match buffer.read(reader, 1) {
            Ok(records) => records,
            Err(e) => {
                // Losing the reader registration means there is nothing
                // left for this thread to watch.
                error!("rule {}: {e}; detector exiting", config.rule);
                return;
            }
        };

        let Some(record) = records.into_iter().next() else {
            thread::sleep(IDLE_SLEEP);
            continue;
        };

        if let Some((key, request)) = match_record(&record, &config.rule, &flows) {
            info!("rule {}: killing flow {key}", config.rule);
            sink.kill(&config.egress, &request);
            // Marked regardless of send success, so a broken socket cannot
            // turn into one kill attempt per packet of the flow.
            flows.insert(key, Instant::now());
        }
    }

    buffer.unregister(reader);
    info!("radar stopped for rule {}", config.rule);
}

/// Apply the detection filters to one record, in order: it must be TCP, it
/// must not be part of a handshake (SYN or SYN-ACK), its flow must not
/// already be killed, and both endpoints must fall inside the rule's
/// prefixes. Returns the flow to mark and the kill to issue.
fn match_record(
    record: &PacketRecord,
    rule: &Rule,
    flows: &FlowTable,
) -> Option<(FlowKey, KillRequest)> {
    let tcp = record.tcp()?;

    if tcp.has_syn() {
        // The handshake has not finished; killing now would tear down
        // half-open connections and trip on bare SYN scans.
        return None;
    }

    let (src, dst) = record.addrs()?;
    let key = FlowKey {
        src,
        sport: tcp.sport,
        dst,
        dport: tcp.dport,
    };

    if flows.contains(&key) {
        return None;
    }

    if !rule.src.contains(&src) || !rule.dst.contains(&dst) {
        return None;
    }

    let PacketRecord::Ipv4 { src, dst, .. } = record else {
        // Only IPv4 flows are injected; forging an IPv4 RST for an IPv6
        // flow would put a malformed frame on the wire.
        debug!("skipping IPv6 match {key}");
        return None;
    };

    let request = KillRequest {
        src_addr: *src,
        dst_addr: *dst,
        sport: tcp.sport,
        dport: tcp.dport,
        seq: tcp.seq,
        ack: tcp.ack,
    };

    Some((key, request))
}
