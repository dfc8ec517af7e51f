//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::SocketAddr;
use std::os::raw::c_int;
use std::os::unix::io::AsRawFd;

// Normal build: re-export the standard async UDP socket.
#[cfg(not(feature = "testing"))]
pub use tokio::net::UdpSocket;

// Test build: export a mock socket that performs no real I/O.
#[cfg(feature = "testing")]
pub use crate::socket::mock::UdpSocket;

pub const TTL_MAX: u8 = 255;

type Result<T> = std::io::Result<T>;

// Address family, used to pick the right socket option family without
// pulling in a general-purpose networking crate for a single enum.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(addr: std::net::IpAddr) -> AddressFamily {
        match addr {
            std::net::IpAddr::V4(_) => AddressFamily::Ipv4,
            std::net::IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    pub fn unspecified(self) -> std::net::IpAddr {
        match self {
            AddressFamily::Ipv4 => std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        }
    }
}

// Socket option helpers used by the BFD Rx/Tx sockets (§4.D, §9).
pub trait SocketExt: Sized + AsRawFd {
    fn set_ipv4_tos(&self, tos: u8) -> Result<()> {
        let optval = tos as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_TOS,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    fn set_ipv4_ttl(&self, ttl: u8) -> Result<()> {
        let optval = ttl as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_TTL,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    // RFC 5082 (GTSM): reject incoming packets whose TTL dropped below this
    // floor, i.e. that transited more than one additional hop.
    fn set_ipv4_minttl(&self, ttl: u8) -> Result<()> {
        let optval = ttl as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_MINTTL,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    fn set_ipv6_tclass(&self, dscp: u8) -> Result<()> {
        let optval = dscp as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_TCLASS,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    fn set_ipv6_unicast_hops(&self, hops: u8) -> Result<()> {
        let optval = hops as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_UNICAST_HOPS,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    fn set_ipv6_min_hopcount(&self, hopcount: u8) -> Result<()> {
        let optval = hopcount as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_MINHOPCOUNT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    fn set_ipv4_pktinfo(&self, value: bool) -> Result<()> {
        let optval = value as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }

    fn set_ipv6_pktinfo(&self, value: bool) -> Result<()> {
        let optval = value as c_int;
        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVPKTINFO,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    }
}

pub trait UdpSocketExt: SocketExt {
    // Same as `UdpSocket::bind`, except `SO_REUSEADDR` is set first so a
    // session can be deleted and immediately recreated on the same port.
    fn bind_reuseaddr(addr: SocketAddr) -> Result<UdpSocket>;
}

#[cfg(not(feature = "testing"))]
impl SocketExt for UdpSocket {}

#[cfg(not(feature = "testing"))]
impl UdpSocketExt for UdpSocket {
    fn bind_reuseaddr(addr: SocketAddr) -> Result<UdpSocket> {
        use socket2::{Domain, Socket, Type};

        let domain = match AddressFamily::of(addr.ip()) {
            AddressFamily::Ipv4 => Domain::IPV4,
            AddressFamily::Ipv6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    }
}

fn setsockopt<F: AsRawFd>(
    sock: &F,
    level: c_int,
    optname: c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(sock.as_raw_fd(), level, optname, optval, optlen)
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

// ===== mock socket for unit testing =====

pub mod mock {
    #[derive(Debug, Default)]
    pub struct UdpSocket();

    impl super::SocketExt for UdpSocket {}

    impl std::os::unix::io::AsRawFd for UdpSocket {
        fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
            -1
        }
    }

    impl super::UdpSocketExt for UdpSocket {
        fn bind_reuseaddr(
            _addr: std::net::SocketAddr,
        ) -> std::io::Result<UdpSocket> {
            Ok(UdpSocket())
        }
    }
}
