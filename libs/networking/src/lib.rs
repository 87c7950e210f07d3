//! Networking utilities for the RA responder.
//!
//! This library provides helpers for:
//! - IPv6 prefix parsing, masking and containment
//! - Route classification and SLAAC prefix selection
//! - The NDP Router Advertisement / Router Solicitation codec

use std::net::Ipv6Addr;
use std::str::FromStr;

use thiserror::Error;

pub mod ndp;
pub mod routes;

pub use routes::{select_prefix, ExclusionList, Route, RouteSet};

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),
}

// ============================================================================
// Prefixes
// ============================================================================

/// Prefix length advertised for SLAAC.
pub const SLAAC_PREFIX_LEN: u8 = 64;

/// The link-local unicast block (fe80::/10).
pub const LINK_LOCAL: Ipv6Prefix = Ipv6Prefix {
    address: Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0),
    prefix_len: 10,
};

/// An IPv6 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Prefix {
    /// Base address of the prefix.
    pub address: Ipv6Addr,

    /// Prefix length (e.g., 64 for /64).
    pub prefix_len: u8,
}

impl Ipv6Prefix {
    /// Create a new prefix. Host bits of `address` are cleared.
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 128 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv6(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "2001:db8::/32").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.trim().split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv6Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        mask_ipv6(addr, self.prefix_len) == self.address
    }
}

impl FromStr for Ipv6Prefix {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl std::fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv6 address to a prefix length.
pub fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

/// Whether an address is link-local unicast (fe80::/10).
pub fn is_link_local(addr: Ipv6Addr) -> bool {
    LINK_LOCAL.contains(addr)
}
