//! Raw ICMPv6 sockets scoped to one interface's link-local address.

use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::time::Duration;

use async_trait::async_trait;
use nix::ifaddrs::getifaddrs;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tapra_networking::is_link_local;
use tapra_networking::ndp::{Message, ALL_ROUTERS, ICMPV6_ROUTER_SOLICITATION};
use tokio::io::unix::AsyncFd;
use tracing::debug;

use crate::link::InterfaceHandle;

/// NDP messages must be sent and received with the maximum hop limit.
const NDP_HOP_LIMIT: u32 = 255;

/// `ICMP6_FILTER` socket option at level `IPPROTO_ICMPV6`.
const ICMP6_FILTER: libc::c_int = 1;

const RECV_BUF_LEN: usize = 1500;

/// Opens per-interface NDP sockets.
#[async_trait]
pub trait NdpTransport: Send + Sync {
    /// Bind a socket to the link-local address of `interface`, returning the
    /// socket and the address it is bound to.
    ///
    /// Fails while the interface has no usable link-local address yet; callers
    /// are expected to retry.
    async fn bind(&self, interface: &InterfaceHandle)
        -> io::Result<(Box<dyn NdpSocket>, Ipv6Addr)>;
}

/// A bound NDP socket. Closed on drop.
#[async_trait]
pub trait NdpSocket: Send + Sync {
    /// Only deliver Router Solicitations to this socket.
    fn accept_only_router_solicitations(&self) -> io::Result<()>;

    /// Join the all-routers link-local multicast group.
    fn join_all_routers(&self) -> io::Result<()>;

    async fn send_to(&self, message: &Message, destination: Ipv6Addr) -> io::Result<()>;

    /// Wait up to `timeout` for one message. `Ok(None)` means the deadline
    /// passed without a message.
    async fn recv_timeout(&self, timeout: Duration) -> io::Result<Option<(Message, Ipv6Addr)>>;
}

/// Kernel-backed transport using raw ICMPv6 sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct Icmpv6Transport;

impl Icmpv6Transport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NdpTransport for Icmpv6Transport {
    async fn bind(
        &self,
        interface: &InterfaceHandle,
    ) -> io::Result<(Box<dyn NdpSocket>, Ipv6Addr)> {
        let address = link_local_address(&interface.name)?;

        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;
        socket.set_nonblocking(true)?;
        socket.set_only_v6(true)?;
        socket.bind_device(Some(interface.name.as_bytes()))?;
        socket.set_multicast_if_v6(interface.index)?;
        socket.set_multicast_hops_v6(NDP_HOP_LIMIT)?;
        socket.set_unicast_hops_v6(NDP_HOP_LIMIT)?;
        socket.set_multicast_loop_v6(false)?;
        socket.bind(&SockAddr::from(SocketAddrV6::new(
            address,
            0,
            0,
            interface.index,
        )))?;

        debug!(interface = %interface.name, %address, "bound NDP socket");

        let socket = Icmpv6Socket {
            fd: AsyncFd::new(socket)?,
            scope_id: interface.index,
        };
        Ok((Box::new(socket), address))
    }
}

fn link_local_address(interface: &str) -> io::Result<Ipv6Addr> {
    let addrs = getifaddrs().map_err(io::Error::from)?;

    addrs
        .filter(|ifa| ifa.interface_name == interface)
        .filter_map(|ifa| ifa.address.and_then(|a| a.as_sockaddr_in6().map(|s| s.ip())))
        .find(|ip| is_link_local(*ip))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no link-local address on {interface}"),
            )
        })
}

struct Icmpv6Socket {
    fd: AsyncFd<Socket>,
    scope_id: u32,
}

impl Icmpv6Socket {
    async fn recv(&self) -> io::Result<(Message, Ipv6Addr)> {
        let mut buf = [0u8; RECV_BUF_LEN];

        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: the buffer is fully initialised; socket2 only wants
                // the MaybeUninit view so it can accept uninitialised memory.
                let uninit = unsafe {
                    &mut *(&mut buf[..] as *mut [u8] as *mut [std::mem::MaybeUninit<u8>])
                };
                inner.get_ref().recv_from(uninit)
            });

            let (n, from) = match result {
                Ok(received) => received?,
                Err(_would_block) => continue,
            };

            let source = from
                .as_socket_ipv6()
                .map(|a| *a.ip())
                .unwrap_or(Ipv6Addr::UNSPECIFIED);

            match Message::decode(&buf[..n]) {
                Ok(message) => return Ok((message, source)),
                Err(e) => debug!(%source, error = %e, "dropping malformed ICMPv6 message"),
            }
        }
    }
}

#[async_trait]
impl NdpSocket for Icmpv6Socket {
    fn accept_only_router_solicitations(&self) -> io::Result<()> {
        // Linux semantics: a set bit blocks the type.
        let mut filter = [u32::MAX; 8];
        let rs = u32::from(ICMPV6_ROUTER_SOLICITATION);
        filter[(rs >> 5) as usize] &= !(1 << (rs & 31));

        // SAFETY: `filter` has the layout of struct icmp6_filter and the
        // length passed matches it.
        let ret = unsafe {
            libc::setsockopt(
                std::os::fd::AsRawFd::as_raw_fd(self.fd.get_ref()),
                libc::IPPROTO_ICMPV6,
                ICMP6_FILTER,
                filter.as_ptr() as *const libc::c_void,
                std::mem::size_of_val(&filter) as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn join_all_routers(&self) -> io::Result<()> {
        self.fd.get_ref().join_multicast_v6(&ALL_ROUTERS, self.scope_id)
    }

    async fn send_to(&self, message: &Message, destination: Ipv6Addr) -> io::Result<()> {
        let bytes = message.encode();
        let addr = SockAddr::from(SocketAddrV6::new(destination, 0, 0, self.scope_id));

        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(&bytes, &addr)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv_timeout(&self, timeout: Duration) -> io::Result<Option<(Message, Ipv6Addr)>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(received) => received.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}
