// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::Duration;

use log::*;
use nix::sys::socket::SockFlag;
use pnet_base::MacAddr;
use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::{self, MutableIpv4Packet};
use pnet_packet::tcp::{self, MutableTcpPacket, TcpFlags};

use crate::config::EgressConfig;
use crate::sock;

const ETHERNET_LEN: usize = 14;
const IPV4_LEN: usize = 20;
const TCP_LEN: usize = 20;

/// Both RSTs are bare headers, no payload.
const FRAME_LEN: usize = ETHERNET_LEN + IPV4_LEN + TCP_LEN;

const SEND_RETRIES: u32 = 3;
const RETRY_SLEEP: Duration = Duration::from_millis(1);

/// Everything needed to tear down one observed flow: the endpoints as seen
/// on the wire (before any NAT), and the sequence numbers of the segment
/// that triggered the kill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillRequest {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
}

/// Where kill requests go. The detectors hold a shared handle rather than a
/// process-global sender, and tests substitute a recorder.
pub trait KillSink: Send + Sync {
    fn kill(&self, egress: &EgressConfig, request: &KillRequest);
}

/// Build the pair of forged RST frames for one kill.
///
/// The first frame replays the observed direction (src to dst) with the
/// observed seq/ack, which the destination accepts as in-window. The second
/// swaps the roles: its seq is the observed ack (the next byte the source
/// expects) and its ack is the observed seq plus one. The plus-one assumes
/// the triggering segment carried no payload; for a data segment it can fall
/// outside the window, which is accepted as best effort.
///
/// Both frames carry the configured next-hop MAC because the host is
/// off-path for L3 routing.
pub fn build_rst_pair(
    request: &KillRequest,
    src_mac: MacAddr,
    dst_mac: MacAddr,
) -> [Vec<u8>; 2] {
    let client_rst = build_rst(
        src_mac,
        dst_mac,
        request.src_addr,
        request.dst_addr,
        request.sport,
        request.dport,
        request.seq,
        request.ack,
    );

    let server_rst = build_rst(
        src_mac,
        dst_mac,
        request.dst_addr,
        request.src_addr,
        request.dport,
        request.sport,
        request.ack,
        request.seq.wrapping_add(1),
    );

    [client_rst, server_rst]
}

#[allow(clippy::too_many_arguments)]
fn build_rst(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    seq: u32,
    ack: u32,
) -> Vec<u8> {
    let mut frame = vec![0u8; FRAME_LEN];

    {
        let mut eth = MutableEthernetPacket::new(&mut frame)
            .expect("frame buffer shorter than an Ethernet header");
        eth.set_destination(dst_mac);
        eth.set_source(src_mac);
        eth.set_ethertype(EtherTypes::Ipv4);
    }

    {
        let mut ip = MutableIpv4Packet::new(&mut frame[ETHERNET_LEN..])
            .expect("frame buffer shorter than an IPv4 header");
        ip.set_version(4);
        ip.set_header_length((IPV4_LEN / 4) as u8);
        ip.set_total_length((IPV4_LEN + TCP_LEN) as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip.set_source(src);
        ip.set_destination(dst);
        ip.set_checksum(ipv4::checksum(&ip.to_immutable()));
    }

    {
        let mut tcp = MutableTcpPacket::new(&mut frame[ETHERNET_LEN + IPV4_LEN..])
            .expect("frame buffer shorter than a TCP header");
        tcp.set_source(sport);
        tcp.set_destination(dport);
        tcp.set_sequence(seq);
        tcp.set_acknowledgement(ack);
        tcp.set_data_offset((TCP_LEN / 4) as u8);
        tcp.set_flags(TcpFlags::RST);
        tcp.set_window(8192);
        tcp.set_checksum(tcp::ipv4_checksum(&tcp.to_immutable(), &src, &dst));
    }

    frame
}

struct EgressSocket {
    fd: OwnedFd,
    src_mac: MacAddr,
}

impl EgressSocket {
    fn open(ifname: &str) -> Result<Self, crate::Error> {
        let fd = sock::open_bound(ifname, SockFlag::SOCK_NONBLOCK)?;
        let src_mac = sock::interface_mac(ifname)?;
        debug!("opened egress socket on {ifname} (source MAC {src_mac})");
        Ok(Self { fd, src_mac })
    }
}

/// Sends forged RSTs through one raw socket per egress interface. Sockets
/// are opened on first use and held until the process exits.
pub struct RstSender {
    sockets: Mutex<HashMap<String, EgressSocket>>,
}

impl RstSender {
    pub fn new() -> Self {
        Self {
            sockets: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for RstSender {
    fn default() -> Self {
        Self::new()
    }
}

impl KillSink for RstSender {
    /// Best-effort injection. Every failure here is logged and swallowed:
    /// the caller marks the flow killed either way, so a broken socket
    /// cannot turn the detector into a tight retry loop.
    fn kill(&self, egress: &EgressConfig, request: &KillRequest) {
        let mut sockets = self.sockets.lock().unwrap();

        let socket = match sockets.entry(egress.ifname.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match EgressSocket::open(&egress.ifname) {
                Ok(socket) => entry.insert(socket),
                Err(e) => {
                    error!("cannot inject on {}: {e}", egress.ifname);
                    return;
                }
            },
        };

        for frame in build_rst_pair(request, socket.src_mac, egress.dst_mac) {
            send_frame(&socket.fd, &frame);
        }
    }
}

/// A would-block send is retried a few times; anything else drops the frame
/// with a warning.
fn send_frame(fd: &OwnedFd, frame: &[u8]) {
    for attempt in 1..=SEND_RETRIES {
        // SAFETY: the pointer and length describe a live, initialized slice.
        let rc = unsafe {
            libc::send(
                fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };
        if rc >= 0 {
            return;
        }

        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::WouldBlock {
            warn!("dropping RST frame: send: {err}");
            return;
        }

        if attempt < SEND_RETRIES {
            std::thread::sleep(RETRY_SLEEP);
        }
    }

    warn!("dropping RST frame after {SEND_RETRIES} send attempts");
}

#[cfg(test)]
mod tests {
    use super::*;

    use pnet_packet::ethernet::EthernetPacket;
    use pnet_packet::ipv4::Ipv4Packet;
    use pnet_packet::tcp::TcpPacket;
    use pnet_packet::Packet;

    fn example_request() -> KillRequest {
        KillRequest {
            src_addr: Ipv4Addr::new(10, 0, 0, 5),
            dst_addr: Ipv4Addr::new(93, 184, 216, 34),
            sport: 55555,
            dport: 443,
            seq: 1000,
            ack: 2000,
        }
    }

    #[test]
    fn client_directed_rst_replays_observed_numbers() {
        let src_mac = MacAddr::new(0x02, 0, 0, 0, 0, 1);
        let dst_mac = MacAddr::new(0x02, 0, 0, 0, 0, 2);
        let [client, _] = build_rst_pair(&example_request(), src_mac, dst_mac);

        assert_eq!(client.len(), FRAME_LEN);

        let eth = EthernetPacket::new(&client).unwrap();
        assert_eq!(eth.get_destination(), dst_mac);
        assert_eq!(eth.get_source(), src_mac);
        assert_eq!(eth.get_ethertype(), EtherTypes::Ipv4);

        let ip = Ipv4Packet::new(eth.payload()).unwrap();
        assert_eq!(ip.get_version(), 4);
        assert_eq!(ip.get_ttl(), 64);
        assert_eq!(ip.get_total_length(), 40);
        assert_eq!(ip.get_next_level_protocol(), IpNextHeaderProtocols::Tcp);
        assert_eq!(ip.get_source(), Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(ip.get_destination(), Ipv4Addr::new(93, 184, 216, 34));
        assert_ne!(ip.get_checksum(), 0);

        let tcp = TcpPacket::new(ip.payload()).unwrap();
        assert_eq!(tcp.get_source(), 55555);
        assert_eq!(tcp.get_destination(), 443);
        assert_eq!(tcp.get_sequence(), 1000);
        assert_eq!(tcp.get_acknowledgement(), 2000);
        assert_eq!(tcp.get_flags(), TcpFlags::RST);
        assert_eq!(tcp.get_window(), 8192);
        assert_ne!(tcp.get_checksum(), 0);
    }

    #[test]
    fn server_directed_rst_swaps_roles() {
        let src_mac = MacAddr::new(0x02, 0, 0, 0, 0, 1);
        let dst_mac = MacAddr::new(0x02, 0, 0, 0, 0, 2);
        let [_, server] = build_rst_pair(&example_request(), src_mac, dst_mac);

        let eth = EthernetPacket::new(&server).unwrap();
        // Both frames go to the same L2 next hop:
        assert_eq!(eth.get_destination(), dst_mac);

        let ip = Ipv4Packet::new(eth.payload()).unwrap();
        assert_eq!(ip.get_source(), Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(ip.get_destination(), Ipv4Addr::new(10, 0, 0, 5));

        let tcp = TcpPacket::new(ip.payload()).unwrap();
        assert_eq!(tcp.get_source(), 443);
        assert_eq!(tcp.get_destination(), 55555);
        assert_eq!(tcp.get_sequence(), 2000);
        assert_eq!(tcp.get_acknowledgement(), 1001);
        assert_eq!(tcp.get_flags(), TcpFlags::RST);
    }

    #[test]
    fn sequence_ack_wraps() {
        let mut request = example_request();
        request.seq = u32::MAX;
        let [_, server] = build_rst_pair(
            &request,
            MacAddr::new(0x02, 0, 0, 0, 0, 1),
            MacAddr::new(0x02, 0, 0, 0, 0, 2),
        );

        let eth = EthernetPacket::new(&server).unwrap();
        let ip = Ipv4Packet::new(eth.payload()).unwrap();
        let tcp = TcpPacket::new(ip.payload()).unwrap();
        assert_eq!(tcp.get_acknowledgement(), 0);
    }

    #[test]
    fn ipv4_checksum_is_valid() {
        let [client, server] = build_rst_pair(
            &example_request(),
            MacAddr::new(0x02, 0, 0, 0, 0, 1),
            MacAddr::new(0x02, 0, 0, 0, 0, 2),
        );

        for frame in [client, server] {
            let eth = EthernetPacket::new(&frame).unwrap();
            let ip = Ipv4Packet::new(eth.payload()).unwrap();
            assert_eq!(ip.get_checksum(), ipv4::checksum(&ip));

            let tcp = TcpPacket::new(ip.payload()).unwrap();
            assert_eq!(
                tcp.get_checksum(),
                tcp::ipv4_checksum(&tcp, &ip.get_source(), &ip.get_destination())
            );
        }
    }
}
