//! Router Advertisement send loop and Router Solicitation receive loop.
//!
//! The two loops share one socket and are coupled by a single-slot trigger
//! channel: each solicitation received wakes the send loop for one extra
//! advertisement. While a trigger is pending the receive loop blocks, so
//! later solicitations wait in the socket buffer instead of a queue.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tapra_networking::ndp::{
    Message, NdpOption, PrefixInformation, RouterAdvertisement, RouterPreference, ALL_NODES,
};
use tapra_networking::SLAAC_PREFIX_LEN;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::error::SessionError;
use crate::link::InterfaceHandle;
use crate::socket::NdpSocket;

/// Upper bound on one blocking read, and so on how long the receive loop can
/// go without noticing cancellation.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Hop limit advertised to hosts.
pub const ADVERTISED_HOP_LIMIT: u8 = 64;

/// Prefix valid lifetime as a multiple of the router lifetime.
const VALID_LIFETIME_FACTOR: u32 = 3;

/// Advertisement timing, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertConfig {
    /// Router lifetime carried in every advertisement; also the preferred
    /// lifetime of the advertised prefix.
    pub router_lifetime: Duration,
    /// Delay between unsolicited advertisements.
    pub interval: Duration,
}

impl Default for AdvertConfig {
    fn default() -> Self {
        Self {
            router_lifetime: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Build the advertisement a session sends for its whole lifetime.
///
/// The prefix information option is present only when a prefix was
/// selected; it is always a /64 with autonomous configuration enabled, a
/// valid lifetime of three router lifetimes and a preferred lifetime of one.
pub fn build_advertisement(
    interface: &InterfaceHandle,
    prefix: Option<Ipv6Addr>,
    router_lifetime: Duration,
) -> Message {
    let mut options = vec![
        NdpOption::SourceLinkLayerAddress(interface.hardware_addr),
        NdpOption::Mtu(interface.mtu),
    ];

    if let Some(prefix) = prefix {
        options.push(NdpOption::PrefixInformation(PrefixInformation {
            prefix_len: SLAAC_PREFIX_LEN,
            on_link: false,
            autonomous: true,
            valid_lifetime: router_lifetime.saturating_mul(VALID_LIFETIME_FACTOR),
            preferred_lifetime: router_lifetime,
            prefix,
        }));
    }

    Message::RouterAdvertisement(RouterAdvertisement {
        current_hop_limit: ADVERTISED_HOP_LIMIT,
        managed: false,
        other: false,
        preference: RouterPreference::Medium,
        router_lifetime,
        reachable_time: Duration::ZERO,
        retransmit_timer: Duration::ZERO,
        options,
    })
}

/// Message counters for one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    sent: AtomicU64,
    received: AtomicU64,
}

impl SessionStats {
    /// Advertisements transmitted.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Solicitations received.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// Run both loops until one of them exits, then drop the other.
///
/// Cancellation on either side resolves to `Ok(())`; the first fatal error
/// is returned as is.
pub async fn run(
    socket: &dyn NdpSocket,
    advertisement: &Message,
    interval: Duration,
    cancel: &CancelToken,
    stats: &SessionStats,
) -> Result<(), SessionError> {
    let (trigger_tx, mut trigger_rx) = mpsc::channel(1);
    let mut send_cancel = cancel.clone();
    let mut recv_cancel = cancel.clone();

    tokio::select! {
        result = send_loop(socket, advertisement, interval, &mut trigger_rx, &mut send_cancel, stats) => result,
        result = receive_loop(socket, &trigger_tx, &mut recv_cancel, stats) => result,
    }
}

/// Transmit `advertisement` to all nodes, then wait for the interval, a
/// solicitation trigger or cancellation, and repeat.
pub async fn send_loop(
    socket: &dyn NdpSocket,
    advertisement: &Message,
    interval: Duration,
    trigger: &mut mpsc::Receiver<()>,
    cancel: &mut CancelToken,
    stats: &SessionStats,
) -> Result<(), SessionError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        socket
            .send_to(advertisement, ALL_NODES)
            .await
            .map_err(SessionError::Send)?;
        stats.sent.fetch_add(1, Ordering::Relaxed);
        trace!("sent router advertisement");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            signal = trigger.recv() => {
                // Sender gone means the receive loop has already exited.
                if signal.is_none() {
                    return Ok(());
                }
                debug!("solicited advertisement");
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Read with a bounded timeout and hand every Router Solicitation to the
/// send loop.
pub async fn receive_loop(
    socket: &dyn NdpSocket,
    trigger: &mpsc::Sender<()>,
    cancel: &mut CancelToken,
    stats: &SessionStats,
) -> Result<(), SessionError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let received = socket
            .recv_timeout(RECEIVE_TIMEOUT)
            .await
            .map_err(SessionError::Receive)?;

        let Some((message, source)) = received else {
            continue;
        };
        if !message.is_router_solicitation() {
            trace!(%source, icmp_type = message.icmp_type(), "ignoring message");
            continue;
        }

        stats.received.fetch_add(1, Ordering::Relaxed);
        debug!(%source, "received router solicitation");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            sent = trigger.send(()) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
