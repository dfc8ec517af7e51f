//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::io::IoSliceMut;
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6,
};
use std::ops::Deref;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::SendError;

use crate::error::{Error, IoError};
use crate::packet::Packet;
use crate::session::SessionKey;
use crate::socket::{AddressFamily, SocketExt, TTL_MAX, UdpSocket, UdpSocketExt};
use crate::tasks::messages::input::UdpRxPacketMsg;

pub const PORT_DST_SINGLE_HOP: u16 = 3784;
pub const PORT_DST_ECHO: u16 = 3785;
pub const PORT_DST_MULTIHOP: u16 = 4784;
pub const PORT_SRC_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;

// Whether a session follows the single-hop (RFC 5881) or multihop (RFC
// 5883) path. Single-hop and multihop sessions listen on distinct
// well-known ports and are subject to different ingress rules (single-hop
// TTL is enforced by the kernel via IP(V6)_MINTTL; multihop TTL must be
// checked in userspace since peers may use different TTLs).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathType {
    IpSingleHop,
    IpMultihop,
}

impl SessionKey {
    pub fn path_type(&self) -> PathType {
        match self {
            SessionKey::SingleHop { .. } => PathType::IpSingleHop,
            SessionKey::MultiHop { .. } => PathType::IpMultihop,
        }
    }
}

// Ancillary data about a received packet, carried alongside the decoded
// `Packet`/`EchoPacket` so the FSM can demultiplex it to a session.
#[derive(Debug)]
#[derive(Deserialize, Serialize)]
pub enum PacketInfo {
    IpSingleHop { src: SocketAddr, ifname: Option<String> },
    IpMultihop { src: IpAddr, dst: IpAddr, ttl: u8 },
}

impl PacketInfo {
    pub fn src_addr(&self) -> IpAddr {
        match self {
            PacketInfo::IpSingleHop { src, .. } => src.ip(),
            PacketInfo::IpMultihop { src, .. } => *src,
        }
    }
}

pub(crate) fn socket_rx(
    path_type: PathType,
    af: AddressFamily,
) -> Result<UdpSocket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        let port = match path_type {
            PathType::IpSingleHop => PORT_DST_SINGLE_HOP,
            PathType::IpMultihop => PORT_DST_MULTIHOP,
        };
        let addr = af.unspecified();
        let sockaddr = SocketAddr::from((addr, port));
        let socket = UdpSocket::bind_reuseaddr(sockaddr)?;

        match path_type {
            PathType::IpSingleHop => match af {
                AddressFamily::Ipv4 => {
                    socket.set_ipv4_pktinfo(true)?;
                    socket.set_ipv4_minttl(TTL_MAX)?;
                }
                AddressFamily::Ipv6 => {
                    socket.set_ipv6_pktinfo(true)?;
                    socket.set_ipv6_min_hopcount(TTL_MAX)?;
                }
            },
            PathType::IpMultihop => {
                // The same Rx socket is shared by every multihop session, so
                // TTL (GTSM) checking must happen in userspace: different
                // peers may be configured with different minimum TTLs.
                match af {
                    AddressFamily::Ipv4 => socket.set_ipv4_pktinfo(true)?,
                    AddressFamily::Ipv6 => socket.set_ipv6_pktinfo(true)?,
                }
            }
        }

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        let _ = (path_type, af);
        Ok(UdpSocket::default())
    }
}

pub(crate) fn socket_echo(af: AddressFamily) -> Result<UdpSocket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        let sockaddr = SocketAddr::from((af.unspecified(), PORT_DST_ECHO));
        UdpSocket::bind_reuseaddr(sockaddr)
    }
    #[cfg(feature = "testing")]
    {
        let _ = af;
        Ok(UdpSocket::default())
    }
}

pub(crate) fn socket_tx(
    ifname: Option<&str>,
    af: AddressFamily,
    addr: IpAddr,
    ttl: u8,
) -> Result<UdpSocket, std::io::Error> {
    #[cfg(not(feature = "testing"))]
    {
        // RFC 5881: "The source port MUST be in the range 49152 through
        // 65535 [...] The source port number SHOULD be unique among all BFD
        // sessions on the system". We don't bother with uniqueness: the
        // peer demultiplexes incoming packets by discriminator, not source
        // port, and a dedicated Tx socket per session is required anyway
        // since each may bind to a different local address.
        let port = *PORT_SRC_RANGE.start();
        let sockaddr = SocketAddr::from((addr, port));
        let socket = UdpSocket::bind_reuseaddr(sockaddr)?;

        if let Some(ifname) = ifname {
            bind_device(&socket, ifname)?;
        }

        match af {
            AddressFamily::Ipv4 => {
                socket.set_ipv4_tos(libc::IPTOS_PREC_INTERNETCONTROL)?;
                socket.set_ipv4_ttl(ttl)?;
            }
            AddressFamily::Ipv6 => {
                socket.set_ipv6_tclass(libc::IPTOS_PREC_INTERNETCONTROL)?;
                socket.set_ipv6_unicast_hops(ttl)?;
            }
        }

        Ok(socket)
    }
    #[cfg(feature = "testing")]
    {
        let _ = (ifname, af, addr, ttl);
        Ok(UdpSocket::default())
    }
}

#[cfg(not(feature = "testing"))]
fn bind_device(socket: &UdpSocket, ifname: &str) -> std::io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            ifname.as_ptr() as *const libc::c_void,
            ifname.len() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn send_packet(
    socket: Arc<UdpSocket>,
    sockaddr: SocketAddr,
    packet: Packet,
    tx_packet_count: Arc<AtomicU64>,
    tx_error_count: Arc<AtomicU64>,
) {
    let buf = packet.encode();

    match socket.send_to(&buf, sockaddr).await {
        Ok(_) => {
            tx_packet_count.fetch_add(1, atomic::Ordering::Relaxed);
        }
        Err(error) => {
            IoError::UdpSendError(error).log();
            tx_error_count.fetch_add(1, atomic::Ordering::Relaxed);
        }
    }
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn send_echo(
    socket: Arc<UdpSocket>,
    sockaddr: SocketAddr,
    buf: bytes::BytesMut,
    tx_packet_count: Arc<AtomicU64>,
    tx_error_count: Arc<AtomicU64>,
) {
    match socket.send_to(&buf, sockaddr).await {
        Ok(_) => {
            tx_packet_count.fetch_add(1, atomic::Ordering::Relaxed);
        }
        Err(error) => {
            IoError::UdpSendError(error).log();
            tx_error_count.fetch_add(1, atomic::Ordering::Relaxed);
        }
    }
}

#[cfg(not(feature = "testing"))]
fn get_packet_src(
    sa: Option<&nix::sys::socket::SockaddrStorage>,
) -> Option<SocketAddr> {
    sa.and_then(|sa| {
        sa.as_sockaddr_in()
            .map(|sa| SocketAddrV4::from(*sa).into())
            .or_else(|| sa.as_sockaddr_in6().map(|sa| SocketAddrV6::from(*sa).into()))
    })
}

#[cfg(not(feature = "testing"))]
fn get_packet_dst(
    cmsgs: nix::sys::socket::CmsgIterator<'_>,
) -> Option<IpAddr> {
    use nix::sys::socket::ControlMessageOwned;

    for cmsg in cmsgs {
        match cmsg {
            ControlMessageOwned::Ipv4PacketInfo(pktinfo) => {
                return Some(
                    Ipv4Addr::from(pktinfo.ipi_spec_dst.s_addr.to_be()).into(),
                );
            }
            ControlMessageOwned::Ipv6PacketInfo(pktinfo) => {
                return Some(Ipv6Addr::from(pktinfo.ipi6_addr.s6_addr).into());
            }
            _ => {}
        }
    }
    None
}

#[cfg(not(feature = "testing"))]
pub(crate) async fn read_loop(
    socket: Arc<UdpSocket>,
    path_type: PathType,
    udp_packet_rxp: Sender<UdpRxPacketMsg>,
) -> Result<(), SendError<UdpRxPacketMsg>> {
    use nix::sys::socket;

    let mut buf = [0; 1024];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsgspace = nix::cmsg_space!(libc::in6_pktinfo);

    loop {
        match socket
            .async_io(tokio::io::Interest::READABLE, || {
                match socket::recvmsg::<socket::SockaddrStorage>(
                    socket.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsgspace),
                    socket::MsgFlags::empty(),
                ) {
                    Ok(msg) => {
                        let src = get_packet_src(msg.address.as_ref());
                        let dst = get_packet_dst(msg.cmsgs().unwrap());
                        Ok((src, dst, msg.bytes))
                    }
                    Err(errno) => Err(errno.into()),
                }
            })
            .await
        {
            Ok((src, dst, bytes)) => {
                let src = match src {
                    Some(addr) => addr,
                    None => {
                        IoError::UdpRecvMissingSourceAddr.log();
                        continue;
                    }
                };
                let dst = match dst {
                    Some(addr) => addr,
                    None => {
                        IoError::UdpRecvMissingAncillaryData.log();
                        continue;
                    }
                };

                let packet = match Packet::decode(&iov[0].deref()[0..bytes]) {
                    Ok(packet) => packet,
                    Err(error) => {
                        Error::UdpPacketDecodeError(error).log();
                        continue;
                    }
                };

                let packet_info = match path_type {
                    PathType::IpSingleHop => {
                        PacketInfo::IpSingleHop { src, ifname: None }
                    }
                    PathType::IpMultihop => {
                        let src = src.ip();
                        // TODO: retrieve the packet's actual TTL via
                        // IP_RECVTTL/IPV6_HOPLIMIT ancillary data instead of
                        // assuming the maximum.
                        let ttl = TTL_MAX;
                        PacketInfo::IpMultihop { src, dst, ttl }
                    }
                };
                let msg = UdpRxPacketMsg {
                    packet_info,
                    packet,
                };
                udp_packet_rxp.send(msg).await?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {
                continue;
            }
            Err(error) => {
                IoError::UdpRecvError(error).log();
            }
        }
    }
}
