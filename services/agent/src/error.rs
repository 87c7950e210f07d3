//! Session error taxonomy.

use std::io;

use thiserror::Error;

use crate::netlink::NetlinkError;

/// Errors that end a tap session, either at construction or while active.
///
/// Bind and multicast join failures are not represented: they are retried
/// until the session is cancelled.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The interface vanished before the session could be built.
    #[error("unable to get interface {index}: {source}")]
    InterfaceLookup {
        index: u32,
        #[source]
        source: NetlinkError,
    },

    /// The interface has no Ethernet hardware address.
    #[error("interface {interface} has no hardware address")]
    NoHardwareAddress { interface: String },

    /// Listing the kernel routes for the interface failed.
    #[error("failed getting routes for {interface}: {source}")]
    RouteQuery {
        interface: String,
        #[source]
        source: NetlinkError,
    },

    /// Neither host nor subnet routes point at the interface.
    #[error("neither host nor subnet routes to {interface}, this may be a private vlan interface")]
    NoRoutes { interface: String },

    /// Installing the ICMPv6 type filter failed.
    #[error("failed to apply ICMP type filter: {0}")]
    Filter(#[source] io::Error),

    /// Transmitting an advertisement failed.
    #[error("failed to send router advertisement: {0}")]
    Send(#[source] io::Error),

    /// Reading from the socket failed for a reason other than the deadline.
    #[error("failed to read message: {0}")]
    Receive(#[source] io::Error),
}

impl SessionError {
    /// Whether the error happened while building the session, before any
    /// socket was touched.
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            SessionError::InterfaceLookup { .. }
                | SessionError::NoHardwareAddress { .. }
                | SessionError::RouteQuery { .. }
                | SessionError::NoRoutes { .. }
        )
    }

    /// Short machine-readable reason used as a log field.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::InterfaceLookup { .. } => "interface_lookup",
            SessionError::NoHardwareAddress { .. } => "no_hardware_address",
            SessionError::RouteQuery { .. } => "route_query",
            SessionError::NoRoutes { .. } => "no_routes",
            SessionError::Filter(_) => "icmp_filter",
            SessionError::Send(_) => "send",
            SessionError::Receive(_) => "receive",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_errors() {
        let err = SessionError::NoRoutes {
            interface: "tap1_0".to_string(),
        };
        assert!(err.is_construction());
        assert_eq!(err.reason_code(), "no_routes");
        assert!(err.to_string().contains("tap1_0"));

        let err = SessionError::Send(io::Error::other("boom"));
        assert!(!err.is_construction());
        assert_eq!(
            err.to_string(),
            "failed to send router advertisement: boom"
        );
    }
}
