// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::{TcpFlags, TcpPacket};
use pnet_packet::Packet;

/// The transport-layer fields a detector needs from one TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFields {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
}

impl TcpFields {
    /// True for any segment in the handshake, SYN-ACK included.
    pub fn has_syn(&self) -> bool {
        self.flags & TcpFlags::SYN as u8 != 0
    }

    fn from_packet(tcp: &TcpPacket) -> Self {
        Self {
            sport: tcp.get_source(),
            dport: tcp.get_destination(),
            seq: tcp.get_sequence(),
            ack: tcp.get_acknowledgement(),
            flags: tcp.get_flags() as u8,
            window: tcp.get_window(),
        }
    }
}

/// One captured frame, reduced to what the detectors dispatch on.
///
/// Frames that are not IP, or that are too short to parse, still become
/// records (`Other`) so the buffer reflects everything that arrived; the
/// detectors discard them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketRecord {
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        tcp: Option<TcpFields>,
    },
    Ipv6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        tcp: Option<TcpFields>,
    },
    Other,
}

impl PacketRecord {
    pub fn addrs(&self) -> Option<(IpAddr, IpAddr)> {
        match self {
            Self::Ipv4 { src, dst, .. } => Some((IpAddr::V4(*src), IpAddr::V4(*dst))),
            Self::Ipv6 { src, dst, .. } => Some((IpAddr::V6(*src), IpAddr::V6(*dst))),
            Self::Other => None,
        }
    }

    pub fn tcp(&self) -> Option<&TcpFields> {
        match self {
            Self::Ipv4 { tcp, .. } | Self::Ipv6 { tcp, .. } => tcp.as_ref(),
            Self::Other => None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.tcp().is_some()
    }
}

/// Reduce a raw Ethernet frame to a [`PacketRecord`]. Total: anything that
/// cannot be interpreted comes back as `Other` rather than an error, since
/// the capture path must survive arbitrary bytes off the wire.
pub fn parse_frame(frame: &[u8]) -> PacketRecord {
    let Some(eth) = EthernetPacket::new(frame) else {
        return PacketRecord::Other;
    };

    match eth.get_ethertype() {
        EtherTypes::Ipv4 => parse_ipv4(eth.payload()),
        EtherTypes::Ipv6 => parse_ipv6(eth.payload()),
        _ => PacketRecord::Other,
    }
}

fn parse_ipv4(data: &[u8]) -> PacketRecord {
    let Some(ip) = Ipv4Packet::new(data) else {
        return PacketRecord::Other;
    };

    let tcp = if ip.get_next_level_protocol() == IpNextHeaderProtocols::Tcp {
        TcpPacket::new(ip.payload()).map(|tcp| TcpFields::from_packet(&tcp))
    } else {
        None
    };

    PacketRecord::Ipv4 {
        src: ip.get_source(),
        dst: ip.get_destination(),
        tcp,
    }
}

fn parse_ipv6(data: &[u8]) -> PacketRecord {
    let Some(ip) = Ipv6Packet::new(data) else {
        return PacketRecord::Other;
    };

    // Extension header chains are not walked; a segment behind one is
    // recorded as non-TCP.
    let tcp = if ip.get_next_header() == IpNextHeaderProtocols::Tcp {
        TcpPacket::new(ip.payload()).map(|tcp| TcpFields::from_packet(&tcp))
    } else {
        None
    };

    PacketRecord::Ipv6 {
        src: ip.get_source(),
        dst: ip.get_destination(),
        tcp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pnet_base::MacAddr;
    use pnet_packet::ethernet::MutableEthernetPacket;
    use pnet_packet::ipv4::MutableIpv4Packet;
    use pnet_packet::tcp::MutableTcpPacket;

    fn tcp_frame(flags: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 54];

        {
            let mut eth = MutableEthernetPacket::new(&mut frame).unwrap();
            eth.set_destination(MacAddr::new(0x02, 0, 0, 0, 0, 1));
            eth.set_source(MacAddr::new(0x02, 0, 0, 0, 0, 2));
            eth.set_ethertype(EtherTypes::Ipv4);
        }
        {
            let mut ip = MutableIpv4Packet::new(&mut frame[14..]).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(40);
            ip.set_ttl(64);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
            ip.set_source(Ipv4Addr::new(10, 0, 0, 5));
            ip.set_destination(Ipv4Addr::new(93, 184, 216, 34));
        }
        {
            let mut tcp = MutableTcpPacket::new(&mut frame[34..]).unwrap();
            tcp.set_source(55555);
            tcp.set_destination(443);
            tcp.set_sequence(1000);
            tcp.set_acknowledgement(2000);
            tcp.set_data_offset(5);
            tcp.set_flags(flags.into());
            tcp.set_window(8192);
        }

        frame
    }

    #[test]
    fn parses_tcp_over_ipv4() {
        let flags = TcpFlags::ACK as u8 | TcpFlags::PSH as u8;
        let record = parse_frame(&tcp_frame(flags));

        let PacketRecord::Ipv4 { src, dst, tcp } = record else {
            panic!("expected an IPv4 record, got {record:?}");
        };
        assert_eq!(src, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(dst, Ipv4Addr::new(93, 184, 216, 34));

        let tcp = tcp.expect("expected TCP fields");
        assert_eq!(tcp.sport, 55555);
        assert_eq!(tcp.dport, 443);
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.ack, 2000);
        assert_eq!(tcp.flags, flags);
        assert!(!tcp.has_syn());
    }

    #[test]
    fn syn_is_detected() {
        let record = parse_frame(&tcp_frame(TcpFlags::SYN as u8));
        assert!(record.tcp().unwrap().has_syn());

        let synack = TcpFlags::SYN as u8 | TcpFlags::ACK as u8;
        let record = parse_frame(&tcp_frame(synack));
        assert!(record.tcp().unwrap().has_syn());
    }

    #[test]
    fn non_ip_frames_become_other() {
        let mut frame = tcp_frame(TcpFlags::ACK as u8);
        {
            let mut eth = MutableEthernetPacket::new(&mut frame).unwrap();
            eth.set_ethertype(EtherTypes::Arp);
        }
        assert_eq!(parse_frame(&frame), PacketRecord::Other);
    }

    #[test]
    fn garbage_never_panics() {
        assert_eq!(parse_frame(&[]), PacketRecord::Other);
        assert_eq!(parse_frame(&[0x08, 0x00]), PacketRecord::Other);

        // A valid Ethernet header with a truncated IP payload:
        let frame = tcp_frame(TcpFlags::ACK as u8);
        assert_eq!(parse_frame(&frame[..20]), PacketRecord::Other);
    }

    #[test]
    fn non_tcp_ip_is_recorded_without_transport() {
        let mut frame = tcp_frame(TcpFlags::ACK as u8);
        {
            let mut ip = MutableIpv4Packet::new(&mut frame[14..]).unwrap();
            ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        }

        let record = parse_frame(&frame);
        assert!(!record.is_tcp());
        assert!(record.addrs().is_some());
    }
}
