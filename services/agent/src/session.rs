//! One tap interface's advertisement lifecycle.
//!
//! ```text
//! Binding ──bound──▶ Active ──loop exit──▶ Closed
//!    │                                       ▲
//!    └────────────── cancelled ──────────────┘
//! ```

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use tapra_networking::ndp::Message;
use tapra_networking::ExclusionList;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::SessionError;
use crate::link::InterfaceHandle;
use crate::protocol::{self, AdvertConfig, SessionStats};
use crate::routes::{select_routes, InterfaceSource};
use crate::socket::{NdpSocket, NdpTransport};

/// Delay between bind attempts while the interface is still settling.
pub const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Trying to open and configure the link-local socket.
    #[default]
    Binding,
    /// Send and receive loops are running.
    Active,
    /// Terminal. The socket has been released.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Binding => write!(f, "binding"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// A managed tap interface.
///
/// Interface attributes and the prefix are captured at construction and never
/// refreshed; a changed interface needs a new session.
#[derive(Debug)]
pub struct TapSession {
    interface: InterfaceHandle,
    prefix: Option<Ipv6Addr>,
    config: AdvertConfig,
    stats: SessionStats,
    state: watch::Sender<SessionState>,
}

impl TapSession {
    /// Resolve the interface and its routes and derive the SLAAC prefix.
    ///
    /// No socket is opened here.
    pub async fn new(
        index: u32,
        source: &dyn InterfaceSource,
        exclusions: &ExclusionList,
        config: AdvertConfig,
    ) -> Result<Self, SessionError> {
        let link = source
            .link(index)
            .await
            .map_err(|source| SessionError::InterfaceLookup { index, source })?;

        let interface =
            InterfaceHandle::from_attributes(&link).ok_or_else(|| SessionError::NoHardwareAddress {
                interface: link.name.clone(),
            })?;

        let routes = select_routes(source, index, &interface.name, exclusions).await?;
        let prefix = routes.prefix();

        if routes.host_routes.is_empty() {
            warn!(
                interface = %interface.name,
                subnet_routes = routes.subnet_routes.len(),
                "no host routes, advertising without a prefix"
            );
        }

        info!(
            interface = %interface.name,
            index,
            prefix = ?prefix,
            host_routes = routes.host_routes.len(),
            subnet_routes = routes.subnet_routes.len(),
            "created tap session"
        );

        let (state, _) = watch::channel(SessionState::Binding);

        Ok(Self {
            interface,
            prefix,
            config,
            stats: SessionStats::default(),
            state,
        })
    }

    pub fn index(&self) -> u32 {
        self.interface.index
    }

    pub fn name(&self) -> &str {
        &self.interface.name
    }

    pub fn interface(&self) -> &InterfaceHandle {
        &self.interface
    }

    /// The advertised /64, if the interface has a host route.
    pub fn prefix(&self) -> Option<Ipv6Addr> {
        self.prefix
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The advertisement this session sends.
    pub fn advertisement(&self) -> Message {
        protocol::build_advertisement(&self.interface, self.prefix, self.config.router_lifetime)
    }

    /// Bind, then advertise until cancelled or a socket operation fails.
    ///
    /// Cancellation in any state resolves to `Ok(())`.
    pub async fn run(
        self: Arc<Self>,
        transport: &dyn NdpTransport,
        mut cancel: CancelToken,
    ) -> Result<(), SessionError> {
        let result = self.run_inner(transport, &mut cancel).await;
        self.state.send_replace(SessionState::Closed);
        result
    }

    async fn run_inner(
        &self,
        transport: &dyn NdpTransport,
        cancel: &mut CancelToken,
    ) -> Result<(), SessionError> {
        let Some(socket) = self.bind(transport, cancel).await? else {
            debug!(interface = %self.interface.name, "cancelled while binding");
            return Ok(());
        };

        self.state.send_replace(SessionState::Active);
        info!(interface = %self.interface.name, "advertising");

        let advertisement = self.advertisement();
        protocol::run(
            &*socket,
            &advertisement,
            self.config.interval,
            cancel,
            &self.stats,
        )
        .await
    }

    /// Retry binding every [`BIND_RETRY_DELAY`] until it succeeds or the
    /// session is cancelled. `Ok(None)` means cancelled.
    async fn bind(
        &self,
        transport: &dyn NdpTransport,
        cancel: &mut CancelToken,
    ) -> Result<Option<Box<dyn NdpSocket>>, SessionError> {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            attempt += 1;

            match transport.bind(&self.interface).await {
                Ok((socket, address)) => {
                    socket
                        .accept_only_router_solicitations()
                        .map_err(SessionError::Filter)?;

                    match socket.join_all_routers() {
                        Ok(()) => {
                            debug!(
                                interface = %self.interface.name,
                                %address,
                                attempt,
                                "bound link-local socket"
                            );
                            return Ok(Some(socket));
                        }
                        Err(e) => warn!(
                            interface = %self.interface.name,
                            attempt,
                            error = %e,
                            "joining all-routers failed, retrying"
                        ),
                    }
                }
                Err(e) => warn!(
                    interface = %self.interface.name,
                    attempt,
                    error = %e,
                    "bind failed, retrying"
                ),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(BIND_RETRY_DELAY) => {}
            }
        }
    }
}
