// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use nix::net::if_::if_nametoindex;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};
use pnet_base::MacAddr;

use crate::Error;

/// Open an `AF_PACKET`/`SOCK_RAW` socket with protocol `ETH_P_ALL` and bind
/// it to the named interface. Requires `CAP_NET_RAW`.
pub(crate) fn open_bound(ifname: &str, flags: SockFlag) -> Result<OwnedFd, Error> {
    let fd = socket(
        AddressFamily::Packet,
        SockType::Raw,
        flags,
        SockProtocol::EthAll,
    )
    .map_err(|e| Error::Socket(format!("opening packet socket for {ifname}: {e}")))?;

    bind_to_interface(&fd, ifname)?;

    Ok(fd)
}

fn bind_to_interface(fd: &OwnedFd, ifname: &str) -> Result<(), Error> {
    let index = interface_index(ifname)?;

    // SAFETY: sockaddr_ll is plain data; the all-zero value is valid.
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
    addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    addr.sll_ifindex = index as libc::c_int;

    // SAFETY: addr is a fully initialized sockaddr_ll and the length matches.
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::Socket(format!(
            "binding to {ifname}: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

pub(crate) fn interface_index(ifname: &str) -> Result<libc::c_uint, Error> {
    if_nametoindex(ifname).map_err(|e| Error::Socket(format!("no such interface {ifname}: {e}")))
}

/// Join the `PACKET_MR_PROMISC` membership so the sniff interface delivers
/// frames addressed to other hosts.
pub(crate) fn enable_promiscuous(fd: &OwnedFd, ifname: &str) -> Result<(), Error> {
    let index = interface_index(ifname)?;

    // SAFETY: packet_mreq is plain data; the all-zero value is valid.
    let mut mreq: libc::packet_mreq = unsafe { std::mem::zeroed() };
    mreq.mr_ifindex = index as libc::c_int;
    mreq.mr_type = libc::PACKET_MR_PROMISC as libc::c_ushort;

    // SAFETY: mreq is a fully initialized packet_mreq and the length matches.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            &mreq as *const libc::packet_mreq as *const libc::c_void,
            std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::Socket(format!(
            "enabling promiscuous mode on {ifname}: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Bound how long a recv on this socket can block, so the owning thread can
/// poll its stop flag between frames.
pub(crate) fn set_receive_timeout(fd: &OwnedFd, timeout: Duration) -> Result<(), Error> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };

    // SAFETY: tv is a fully initialized timeval and the length matches.
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::Socket(format!(
            "setting receive timeout: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// The hardware address of a local interface, used as the Ethernet source of
/// forged frames.
pub(crate) fn interface_mac(ifname: &str) -> Result<MacAddr, Error> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::Socket(format!("listing interfaces: {e}")))?;

    for ifaddr in addrs {
        if ifaddr.interface_name != ifname {
            continue;
        }
        let Some(storage) = ifaddr.address else {
            continue;
        };
        let Some(link) = storage.as_link_addr() else {
            continue;
        };
        if let Some(octets) = link.addr() {
            return Ok(MacAddr::new(
                octets[0], octets[1], octets[2], octets[3], octets[4], octets[5],
            ));
        }
    }

    Err(Error::Socket(format!(
        "interface {ifname} has no hardware address"
    )))
}
