//! Minimal rtnetlink client.
//!
//! Covers what the responder needs from the kernel:
//! - `RTM_GETLINK` (dump and single lookup) for link attributes
//! - `RTM_GETROUTE` IPv6 dump, filtered to one output interface
//! - `RTMGRP_LINK` subscription for link change notifications
//!
//! Requests open a short-lived socket each; the subscription owns a dedicated
//! socket read by a background thread that feeds a tokio channel.

use std::io;
use std::mem;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use tapra_networking::ndp::MacAddr;
use tapra_networking::Route;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::link::{LinkAttributes, LinkEvent, OperState};
use crate::routes::InterfaceSource;

// Message types
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_GETLINK: u16 = 18;
const RTM_NEWROUTE: u16 = 24;
const RTM_GETROUTE: u16 = 26;

// Header flags
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_DUMP: u16 = 0x300;

// Multicast groups
const RTMGRP_LINK: u32 = 1;

// Link attributes
const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;
const IFLA_STATS: u16 = 7;
const IFLA_OPERSTATE: u16 = 16;
const IFLA_STATS64: u16 = 23;

// Route attributes
const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_TABLE: u16 = 15;

const RT_TABLE_MAIN: u32 = 254;
const RTN_UNICAST: u8 = 1;
const IFF_UP: u32 = 0x1;

const NLMSG_HDRLEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;
const RTMSG_LEN: usize = 12;
const RTA_HDRLEN: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

const RECV_BUF_LEN: usize = 32 * 1024;

/// Receive timeout for the subscription socket, so the reader thread can
/// notice a stop request.
const SUBSCRIPTION_POLL: Duration = Duration::from_secs(1);

/// Netlink errors.
#[derive(Debug, Error)]
pub enum NetlinkError {
    /// The kernel has no interface with this index.
    #[error("no such interface: index {0}")]
    NoSuchInterface(u32),

    /// Socket-level failure.
    #[error("netlink I/O error: {0}")]
    Io(#[from] io::Error),

    /// The kernel answered the request with an error code.
    #[error("netlink request failed: {0}")]
    Kernel(#[source] io::Error),

    /// A reply could not be parsed.
    #[error("malformed netlink message: {0}")]
    Malformed(&'static str),
}

// =============================================================================
// Socket
// =============================================================================

static SEQUENCE: AtomicU32 = AtomicU32::new(1);

struct NetlinkSocket {
    fd: OwnedFd,
}

impl NetlinkSocket {
    fn open(groups: u32) -> io::Result<Self> {
        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = groups;

        // SAFETY: `addr` is a properly initialised sockaddr_nl and the length
        // passed matches its size.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd })
    }

    fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        // SAFETY: `tv` is a valid timeval and the length matches.
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        // SAFETY: the pointer/length pair describes `bytes`.
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: the kernel writes at most `buf.len()` bytes into `buf`.
        let ret = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    /// Send one request and collect the payloads of every reply message of
    /// type `reply_type` until the kernel signals completion.
    fn request(
        &self,
        msg_type: u16,
        flags: u16,
        payload: &[u8],
        reply_type: u16,
    ) -> Result<Vec<Vec<u8>>, NetlinkError> {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let dump = flags & NLM_F_DUMP == NLM_F_DUMP;

        let mut req = Vec::with_capacity(NLMSG_HDRLEN + payload.len());
        req.extend_from_slice(&((NLMSG_HDRLEN + payload.len()) as u32).to_ne_bytes());
        req.extend_from_slice(&msg_type.to_ne_bytes());
        req.extend_from_slice(&(flags | NLM_F_REQUEST).to_ne_bytes());
        req.extend_from_slice(&seq.to_ne_bytes());
        req.extend_from_slice(&0u32.to_ne_bytes());
        req.extend_from_slice(payload);
        self.send(&req)?;

        let mut replies = Vec::new();
        let mut buf = vec![0u8; RECV_BUF_LEN];

        loop {
            let n = match self.recv(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            for msg in messages(&buf[..n]) {
                if msg.seq != seq {
                    continue;
                }
                match msg.kind {
                    NLMSG_DONE => return Ok(replies),
                    NLMSG_ERROR => {
                        let errno = msg
                            .payload
                            .get(..4)
                            .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                            .ok_or(NetlinkError::Malformed("short error message"))?;
                        if errno == 0 {
                            return Ok(replies);
                        }
                        return Err(NetlinkError::Kernel(io::Error::from_raw_os_error(-errno)));
                    }
                    kind if kind == reply_type => {
                        replies.push(msg.payload.to_vec());
                        if !dump {
                            return Ok(replies);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

// =============================================================================
// Parsing
// =============================================================================

struct NlMsg<'a> {
    kind: u16,
    seq: u32,
    payload: &'a [u8],
}

fn messages(data: &[u8]) -> Vec<NlMsg<'_>> {
    let mut out = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= data.len() {
        let len = ne_u32(&data[offset..offset + 4]) as usize;
        if len < NLMSG_HDRLEN || offset + len > data.len() {
            break;
        }
        out.push(NlMsg {
            kind: ne_u16(&data[offset + 4..offset + 6]),
            seq: ne_u32(&data[offset + 8..offset + 12]),
            payload: &data[offset + NLMSG_HDRLEN..offset + len],
        });
        offset += align4(len);
    }

    out
}

fn attributes(mut data: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();

    while data.len() >= RTA_HDRLEN {
        let len = ne_u16(&data[0..2]) as usize;
        if len < RTA_HDRLEN || len > data.len() {
            break;
        }
        out.push((ne_u16(&data[2..4]) & NLA_TYPE_MASK, &data[RTA_HDRLEN..len]));
        data = &data[align4(len).min(data.len())..];
    }

    out
}

fn parse_link(payload: &[u8]) -> Option<LinkAttributes> {
    if payload.len() < IFINFOMSG_LEN {
        return None;
    }

    let mut link = LinkAttributes {
        index: ne_u32(&payload[4..8]),
        admin_up: ne_u32(&payload[8..12]) & IFF_UP != 0,
        ..LinkAttributes::default()
    };
    let mut tx32 = None;
    let mut tx64 = None;

    for (kind, value) in attributes(&payload[IFINFOMSG_LEN..]) {
        match kind {
            IFLA_IFNAME => {
                let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
                link.name = String::from_utf8_lossy(&value[..end]).into_owned();
            }
            IFLA_MTU if value.len() >= 4 => link.mtu = ne_u32(value),
            IFLA_ADDRESS => link.hardware_addr = MacAddr::from_slice(value),
            IFLA_OPERSTATE if !value.is_empty() => link.oper_state = OperState::from(value[0]),
            // struct rtnl_link_stats64: rx_packets, tx_packets, ...
            IFLA_STATS64 if value.len() >= 16 => tx64 = Some(ne_u64(&value[8..16])),
            // struct rtnl_link_stats: rx_packets, tx_packets, ...
            IFLA_STATS if value.len() >= 8 => tx32 = Some(u64::from(ne_u32(&value[4..8]))),
            _ => {}
        }
    }
    link.tx_packets = tx64.or(tx32).unwrap_or(0);

    Some(link)
}

/// Parse an `RTM_NEWROUTE` payload. Only unicast routes of the main table
/// with an explicit IPv6 destination are returned, with their output
/// interface.
fn parse_route(payload: &[u8]) -> Option<(u32, Route)> {
    if payload.len() < RTMSG_LEN {
        return None;
    }
    if i32::from(payload[0]) != libc::AF_INET6 || payload[7] != RTN_UNICAST {
        return None;
    }

    let prefix_len = payload[1];
    let mut table = u32::from(payload[4]);
    let mut dst = None;
    let mut oif = None;

    for (kind, value) in attributes(&payload[RTMSG_LEN..]) {
        match kind {
            RTA_DST if value.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(value);
                dst = Some(Ipv6Addr::from(octets));
            }
            RTA_OIF if value.len() >= 4 => oif = Some(ne_u32(value)),
            RTA_TABLE if value.len() >= 4 => table = ne_u32(value),
            _ => {}
        }
    }

    if table != RT_TABLE_MAIN {
        return None;
    }

    Some((oif?, Route::new(dst?, prefix_len)))
}

fn ifinfomsg(index: u32) -> [u8; IFINFOMSG_LEN] {
    let mut msg = [0u8; IFINFOMSG_LEN];
    msg[0] = libc::AF_UNSPEC as u8;
    msg[4..8].copy_from_slice(&index.to_ne_bytes());
    msg
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn ne_u16(b: &[u8]) -> u16 {
    u16::from_ne_bytes([b[0], b[1]])
}

fn ne_u32(b: &[u8]) -> u32 {
    u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
}

fn ne_u64(b: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&b[..8]);
    u64::from_ne_bytes(bytes)
}

// =============================================================================
// Queries
// =============================================================================

/// rtnetlink query handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Netlink;

impl Netlink {
    pub fn new() -> Self {
        Self
    }

    /// List every link on the host.
    pub fn links(&self) -> Result<Vec<LinkAttributes>, NetlinkError> {
        let socket = NetlinkSocket::open(0)?;
        let replies = socket.request(RTM_GETLINK, NLM_F_DUMP, &ifinfomsg(0), RTM_NEWLINK)?;
        Ok(replies.iter().filter_map(|p| parse_link(p)).collect())
    }

    /// Look up a single link by index.
    pub fn link(&self, index: u32) -> Result<LinkAttributes, NetlinkError> {
        let socket = NetlinkSocket::open(0)?;
        let replies = socket
            .request(RTM_GETLINK, 0, &ifinfomsg(index), RTM_NEWLINK)
            .map_err(|e| match e {
                NetlinkError::Kernel(err) if err.raw_os_error() == Some(libc::ENODEV) => {
                    NetlinkError::NoSuchInterface(index)
                }
                other => other,
            })?;

        replies
            .first()
            .and_then(|p| parse_link(p))
            .ok_or(NetlinkError::NoSuchInterface(index))
    }

    /// List the IPv6 main-table routes whose output interface is `index`,
    /// in kernel order.
    pub fn ipv6_routes(&self, index: u32) -> Result<Vec<Route>, NetlinkError> {
        let socket = NetlinkSocket::open(0)?;
        let mut rtmsg = [0u8; RTMSG_LEN];
        rtmsg[0] = libc::AF_INET6 as u8;
        let replies = socket.request(RTM_GETROUTE, NLM_F_DUMP, &rtmsg, RTM_NEWROUTE)?;

        Ok(replies
            .iter()
            .filter_map(|p| parse_route(p))
            .filter(|(oif, _)| *oif == index)
            .map(|(_, route)| route)
            .collect())
    }
}

#[async_trait]
impl InterfaceSource for Netlink {
    async fn link(&self, index: u32) -> Result<LinkAttributes, NetlinkError> {
        let netlink = *self;
        tokio::task::spawn_blocking(move || netlink.link(index))
            .await
            .map_err(|e| NetlinkError::Io(io::Error::other(e)))?
    }

    async fn ipv6_routes(&self, index: u32) -> Result<Vec<Route>, NetlinkError> {
        let netlink = *self;
        tokio::task::spawn_blocking(move || netlink.ipv6_routes(index))
            .await
            .map_err(|e| NetlinkError::Io(io::Error::other(e)))?
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Background reader of link change notifications.
///
/// Events are delivered on the channel passed to [`LinkSubscription::start`].
/// The channel closes when the reader stops, whether on request or because
/// the socket failed.
pub struct LinkSubscription {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl LinkSubscription {
    /// Subscribe to `RTMGRP_LINK` and start the reader thread.
    pub fn start(tx: mpsc::Sender<LinkEvent>) -> Result<Self, NetlinkError> {
        let socket = NetlinkSocket::open(RTMGRP_LINK)?;
        socket.set_recv_timeout(SUBSCRIPTION_POLL)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("tapra-netlink".to_string())
            .spawn({
                let stop = Arc::clone(&stop);
                move || subscription_loop(socket, stop, tx)
            })?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop the reader thread and wait for it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LinkSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

fn subscription_loop(socket: NetlinkSocket, stop: Arc<AtomicBool>, tx: mpsc::Sender<LinkEvent>) {
    let mut buf = vec![0u8; RECV_BUF_LEN];

    while !stop.load(Ordering::SeqCst) {
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!("netlink receive buffer overrun, link events were lost");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "netlink subscription failed");
                break;
            }
        };

        for msg in messages(&buf[..n]) {
            let event = match msg.kind {
                RTM_NEWLINK => parse_link(msg.payload).map(LinkEvent::Changed),
                RTM_DELLINK => parse_link(msg.payload).map(LinkEvent::Removed),
                _ => None,
            };
            let Some(event) = event else {
                continue;
            };

            trace!(?event, "link event");
            if tx.blocking_send(event).is_err() {
                debug!("link event receiver dropped, stopping subscription");
                return;
            }
        }
    }
}
