//! In-memory collaborators for tests and local runs without privileges.

use std::collections::HashMap;
use std::io;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tapra_networking::ndp::{MacAddr, Message, RouterSolicitation};
use tapra_networking::Route;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::link::{InterfaceHandle, LinkAttributes, OperState};
use crate::netlink::NetlinkError;
use crate::routes::InterfaceSource;
use crate::socket::{NdpSocket, NdpTransport};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A ready tap link with a locally administered MAC derived from the index.
pub fn tap_link(index: u32, name: &str) -> LinkAttributes {
    let [a, b, c, d] = index.to_be_bytes();
    LinkAttributes {
        index,
        name: name.to_string(),
        admin_up: true,
        oper_state: OperState::Up,
        mtu: 1500,
        hardware_addr: Some(MacAddr([0xfe, 0x54, a, b, c, d])),
        tx_packets: 1,
    }
}

/// Interface and route source backed by maps.
#[derive(Default)]
pub struct MockInterfaceSource {
    links: Mutex<HashMap<u32, LinkAttributes>>,
    routes: Mutex<HashMap<u32, Vec<Route>>>,
    delay: Mutex<Duration>,
}

impl MockInterfaceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_link(&self, link: LinkAttributes) {
        lock(&self.links).insert(link.index, link);
    }

    pub fn set_routes(&self, index: u32, routes: Vec<Route>) {
        lock(&self.routes).insert(index, routes);
    }

    /// Register a ready tap with the given routes.
    pub fn add_tap(&self, index: u32, name: &str, routes: Vec<Route>) {
        self.set_link(tap_link(index, name));
        self.set_routes(index, routes);
    }

    /// Forget a link, as if it had been deleted.
    pub fn remove(&self, index: u32) {
        lock(&self.links).remove(&index);
        lock(&self.routes).remove(&index);
    }

    /// Delay every lookup, to widen construction races.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    async fn wait(&self) {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl InterfaceSource for MockInterfaceSource {
    async fn link(&self, index: u32) -> Result<LinkAttributes, NetlinkError> {
        self.wait().await;
        lock(&self.links)
            .get(&index)
            .cloned()
            .ok_or(NetlinkError::NoSuchInterface(index))
    }

    async fn ipv6_routes(&self, index: u32) -> Result<Vec<Route>, NetlinkError> {
        self.wait().await;
        lock(&self.routes)
            .get(&index)
            .cloned()
            .ok_or(NetlinkError::NoSuchInterface(index))
    }
}

/// A message captured by a [`MockSocket`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: Message,
    pub destination: Ipv6Addr,
    pub at: Instant,
}

/// Simulated link for one interface index.
pub struct MockLink {
    sent: Mutex<Vec<SentMessage>>,
    sent_count: watch::Sender<usize>,
    inbound_tx: mpsc::UnboundedSender<(Message, Ipv6Addr)>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Message, Ipv6Addr)>>,
    bind_failures: AtomicU32,
    bind_attempts: AtomicU32,
    join_failures: AtomicU32,
    fail_filter: AtomicBool,
    open_sockets: AtomicUsize,
    filter_installed: AtomicBool,
    joined_all_routers: AtomicBool,
    fail_send: AtomicBool,
    fail_recv: AtomicBool,
}

impl MockLink {
    fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_count, _) = watch::channel(0);
        Self {
            sent: Mutex::new(Vec::new()),
            sent_count,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            bind_failures: AtomicU32::new(0),
            bind_attempts: AtomicU32::new(0),
            join_failures: AtomicU32::new(0),
            fail_filter: AtomicBool::new(false),
            open_sockets: AtomicUsize::new(0),
            filter_installed: AtomicBool::new(false),
            joined_all_routers: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            fail_recv: AtomicBool::new(false),
        }
    }

    /// Deliver a message to whichever socket is bound to this link.
    pub fn inject(&self, message: Message, source: Ipv6Addr) {
        let _ = self.inbound_tx.send((message, source));
    }

    /// Deliver a Router Solicitation from a guest link-local address.
    pub fn inject_solicitation(&self) {
        self.inject(
            Message::RouterSolicitation(RouterSolicitation::default()),
            Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2),
        );
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_count(&self) -> usize {
        *self.sent_count.borrow()
    }

    /// Wait until at least `count` messages have been sent.
    pub async fn wait_for_sent(&self, count: usize) {
        let mut rx = self.sent_count.subscribe();
        let _ = rx.wait_for(|sent| *sent >= count).await;
    }

    /// Make the next `count` bind attempts fail.
    pub fn fail_binds(&self, count: u32) {
        self.bind_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` all-routers joins fail.
    pub fn fail_joins(&self, count: u32) {
        self.join_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_filter(&self, fail: bool) {
        self.fail_filter.store(fail, Ordering::SeqCst);
    }

    pub fn bind_attempts(&self) -> u32 {
        self.bind_attempts.load(Ordering::SeqCst)
    }

    /// Sockets bound and not yet dropped.
    pub fn open_sockets(&self) -> usize {
        self.open_sockets.load(Ordering::SeqCst)
    }

    pub fn filter_installed(&self) -> bool {
        self.filter_installed.load(Ordering::SeqCst)
    }

    pub fn joined_all_routers(&self) -> bool {
        self.joined_all_routers.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn fail_receives(&self, fail: bool) {
        self.fail_recv.store(fail, Ordering::SeqCst);
    }
}

/// Transport handing out [`MockSocket`]s, one simulated link per index.
#[derive(Default)]
pub struct MockTransport {
    links: Mutex<HashMap<u32, Arc<MockLink>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The simulated link for `index`, created on first use.
    pub fn link(&self, index: u32) -> Arc<MockLink> {
        Arc::clone(
            lock(&self.links)
                .entry(index)
                .or_insert_with(|| Arc::new(MockLink::new())),
        )
    }
}

#[async_trait]
impl NdpTransport for MockTransport {
    async fn bind(
        &self,
        interface: &InterfaceHandle,
    ) -> io::Result<(Box<dyn NdpSocket>, Ipv6Addr)> {
        let link = self.link(interface.index);
        link.bind_attempts.fetch_add(1, Ordering::SeqCst);

        let pending = link.bind_failures.load(Ordering::SeqCst);
        if pending > 0 {
            link.bind_failures.store(pending - 1, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "link-local address not ready",
            ));
        }

        debug!(interface = %interface.name, "[MOCK] bound socket");
        link.open_sockets.fetch_add(1, Ordering::SeqCst);
        let address = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);
        Ok((Box::new(MockSocket { link }), address))
    }
}

/// Socket writing into and reading from a [`MockLink`].
pub struct MockSocket {
    link: Arc<MockLink>,
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        self.link.open_sockets.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NdpSocket for MockSocket {
    fn accept_only_router_solicitations(&self) -> io::Result<()> {
        if self.link.fail_filter.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected filter failure"));
        }
        self.link.filter_installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn join_all_routers(&self) -> io::Result<()> {
        let pending = self.link.join_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.link.join_failures.store(pending - 1, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "multicast join rejected",
            ));
        }
        self.link.joined_all_routers.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_to(&self, message: &Message, destination: Ipv6Addr) -> io::Result<()> {
        if self.link.fail_send.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected send failure"));
        }

        lock(&self.link.sent).push(SentMessage {
            message: message.clone(),
            destination,
            at: Instant::now(),
        });
        self.link.sent_count.send_modify(|count| *count += 1);
        Ok(())
    }

    async fn recv_timeout(&self, timeout: Duration) -> io::Result<Option<(Message, Ipv6Addr)>> {
        if self.link.fail_recv.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected receive failure"));
        }

        let mut inbound = self.link.inbound_rx.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(received) => Ok(received),
            Err(_elapsed) => Ok(None),
        }
    }
}
