//! NDP Router Advertisement / Router Solicitation codec (RFC 4861 §4.1, §4.2,
//! §4.6).
//!
//! Messages are encoded as raw ICMPv6 payloads with a zero checksum; the
//! kernel fills the checksum in for raw ICMPv6 sockets and verifies it on
//! receive, so decoding does not re-check it.

use std::net::Ipv6Addr;
use std::time::Duration;

use thiserror::Error;

/// ICMPv6 type of a Router Solicitation.
pub const ICMPV6_ROUTER_SOLICITATION: u8 = 133;

/// ICMPv6 type of a Router Advertisement.
pub const ICMPV6_ROUTER_ADVERTISEMENT: u8 = 134;

/// All-nodes link-local multicast group (ff02::1).
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// All-routers link-local multicast group (ff02::2).
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

const OPT_SOURCE_LLA: u8 = 1;
const OPT_TARGET_LLA: u8 = 2;
const OPT_PREFIX_INFORMATION: u8 = 3;
const OPT_MTU: u8 = 5;

const RA_HEADER_LEN: usize = 16;
const RS_HEADER_LEN: usize = 8;
const PREFIX_INFORMATION_LEN: usize = 32;

/// Codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer ends before the structure it should contain.
    #[error("truncated {what}: need {needed} bytes, got {got}")]
    Truncated {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    /// An option carries a length of zero or one inconsistent with its type.
    #[error("invalid length {length} for NDP option type {kind}")]
    InvalidOptionLength { kind: u8, length: u8 },
}

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Build from a kernel-reported hardware address. Returns `None` unless
    /// exactly six bytes are given.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(MacAddr)
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Default router preference (RFC 4191 §2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouterPreference {
    Low,
    #[default]
    Medium,
    High,
}

impl RouterPreference {
    fn bits(self) -> u8 {
        match self {
            RouterPreference::High => 0b01,
            RouterPreference::Medium => 0b00,
            RouterPreference::Low => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b01 => RouterPreference::High,
            0b11 => RouterPreference::Low,
            // 0b10 is reserved and treated as medium.
            _ => RouterPreference::Medium,
        }
    }
}

/// Prefix Information option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixInformation {
    pub prefix_len: u8,
    pub on_link: bool,
    pub autonomous: bool,
    pub valid_lifetime: Duration,
    pub preferred_lifetime: Duration,
    pub prefix: Ipv6Addr,
}

/// NDP options understood by this codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NdpOption {
    SourceLinkLayerAddress(MacAddr),
    TargetLinkLayerAddress(MacAddr),
    Mtu(u32),
    PrefixInformation(PrefixInformation),
}

impl NdpOption {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            NdpOption::SourceLinkLayerAddress(mac) => {
                buf.extend_from_slice(&[OPT_SOURCE_LLA, 1]);
                buf.extend_from_slice(&mac.0);
            }
            NdpOption::TargetLinkLayerAddress(mac) => {
                buf.extend_from_slice(&[OPT_TARGET_LLA, 1]);
                buf.extend_from_slice(&mac.0);
            }
            NdpOption::Mtu(mtu) => {
                buf.extend_from_slice(&[OPT_MTU, 1, 0, 0]);
                buf.extend_from_slice(&mtu.to_be_bytes());
            }
            NdpOption::PrefixInformation(pi) => {
                let mut flags = 0u8;
                if pi.on_link {
                    flags |= 0x80;
                }
                if pi.autonomous {
                    flags |= 0x40;
                }
                buf.extend_from_slice(&[OPT_PREFIX_INFORMATION, 4, pi.prefix_len, flags]);
                buf.extend_from_slice(&lifetime_u32(pi.valid_lifetime).to_be_bytes());
                buf.extend_from_slice(&lifetime_u32(pi.preferred_lifetime).to_be_bytes());
                buf.extend_from_slice(&[0; 4]);
                buf.extend_from_slice(&pi.prefix.octets());
            }
        }
    }
}

/// Router Advertisement message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAdvertisement {
    pub current_hop_limit: u8,
    pub managed: bool,
    pub other: bool,
    pub preference: RouterPreference,
    pub router_lifetime: Duration,
    pub reachable_time: Duration,
    pub retransmit_timer: Duration,
    pub options: Vec<NdpOption>,
}

impl RouterAdvertisement {
    /// The prefix information options carried by this advertisement.
    pub fn prefixes(&self) -> impl Iterator<Item = &PrefixInformation> {
        self.options.iter().filter_map(|opt| match opt {
            NdpOption::PrefixInformation(pi) => Some(pi),
            _ => None,
        })
    }

    /// The advertised link MTU, if present.
    pub fn mtu(&self) -> Option<u32> {
        self.options.iter().find_map(|opt| match opt {
            NdpOption::Mtu(mtu) => Some(*mtu),
            _ => None,
        })
    }
}

/// Router Solicitation message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouterSolicitation {
    pub options: Vec<NdpOption>,
}

/// A decoded ICMPv6 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RouterAdvertisement(RouterAdvertisement),
    RouterSolicitation(RouterSolicitation),
    /// Any other ICMPv6 type; the body is not interpreted.
    Other { icmp_type: u8 },
}

impl Message {
    /// ICMPv6 type byte for this message.
    pub fn icmp_type(&self) -> u8 {
        match self {
            Message::RouterAdvertisement(_) => ICMPV6_ROUTER_ADVERTISEMENT,
            Message::RouterSolicitation(_) => ICMPV6_ROUTER_SOLICITATION,
            Message::Other { icmp_type } => *icmp_type,
        }
    }

    pub fn is_router_solicitation(&self) -> bool {
        matches!(self, Message::RouterSolicitation(_))
    }

    /// Encode as an ICMPv6 payload (checksum left zero).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96);

        match self {
            Message::RouterAdvertisement(ra) => {
                buf.extend_from_slice(&[ICMPV6_ROUTER_ADVERTISEMENT, 0, 0, 0]);
                buf.push(ra.current_hop_limit);

                let mut flags = ra.preference.bits() << 3;
                if ra.managed {
                    flags |= 0x80;
                }
                if ra.other {
                    flags |= 0x40;
                }
                buf.push(flags);

                let lifetime = u16::try_from(ra.router_lifetime.as_secs()).unwrap_or(u16::MAX);
                buf.extend_from_slice(&lifetime.to_be_bytes());
                buf.extend_from_slice(&millis_u32(ra.reachable_time).to_be_bytes());
                buf.extend_from_slice(&millis_u32(ra.retransmit_timer).to_be_bytes());

                for opt in &ra.options {
                    opt.encode(&mut buf);
                }
            }
            Message::RouterSolicitation(rs) => {
                buf.extend_from_slice(&[ICMPV6_ROUTER_SOLICITATION, 0, 0, 0, 0, 0, 0, 0]);
                for opt in &rs.options {
                    opt.encode(&mut buf);
                }
            }
            Message::Other { icmp_type } => {
                buf.extend_from_slice(&[*icmp_type, 0, 0, 0]);
            }
        }

        buf
    }

    /// Decode an ICMPv6 payload.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        ensure_len("ICMPv6 header", buf, 4)?;

        match buf[0] {
            ICMPV6_ROUTER_ADVERTISEMENT => {
                ensure_len("router advertisement", buf, RA_HEADER_LEN)?;
                let flags = buf[5];
                Ok(Message::RouterAdvertisement(RouterAdvertisement {
                    current_hop_limit: buf[4],
                    managed: flags & 0x80 != 0,
                    other: flags & 0x40 != 0,
                    preference: RouterPreference::from_bits(flags >> 3),
                    router_lifetime: Duration::from_secs(u16::from_be_bytes([buf[6], buf[7]]).into()),
                    reachable_time: Duration::from_millis(be_u32(&buf[8..12]).into()),
                    retransmit_timer: Duration::from_millis(be_u32(&buf[12..16]).into()),
                    options: decode_options(&buf[RA_HEADER_LEN..])?,
                }))
            }
            ICMPV6_ROUTER_SOLICITATION => {
                ensure_len("router solicitation", buf, RS_HEADER_LEN)?;
                Ok(Message::RouterSolicitation(RouterSolicitation {
                    options: decode_options(&buf[RS_HEADER_LEN..])?,
                }))
            }
            icmp_type => Ok(Message::Other { icmp_type }),
        }
    }
}

fn decode_options(mut buf: &[u8]) -> Result<Vec<NdpOption>, CodecError> {
    let mut options = Vec::new();

    while !buf.is_empty() {
        ensure_len("NDP option header", buf, 2)?;
        let (kind, length) = (buf[0], buf[1]);
        if length == 0 {
            return Err(CodecError::InvalidOptionLength { kind, length });
        }
        let total = usize::from(length) * 8;
        ensure_len("NDP option", buf, total)?;
        let body = &buf[2..total];

        match kind {
            OPT_SOURCE_LLA | OPT_TARGET_LLA => {
                // Ethernet addresses only; other link types are skipped.
                if let Some(mac) = body.get(..6).and_then(MacAddr::from_slice) {
                    options.push(if kind == OPT_SOURCE_LLA {
                        NdpOption::SourceLinkLayerAddress(mac)
                    } else {
                        NdpOption::TargetLinkLayerAddress(mac)
                    });
                }
            }
            OPT_MTU => {
                if length != 1 {
                    return Err(CodecError::InvalidOptionLength { kind, length });
                }
                options.push(NdpOption::Mtu(be_u32(&body[2..6])));
            }
            OPT_PREFIX_INFORMATION => {
                if total != PREFIX_INFORMATION_LEN {
                    return Err(CodecError::InvalidOptionLength { kind, length });
                }
                let mut prefix = [0u8; 16];
                prefix.copy_from_slice(&body[14..30]);
                options.push(NdpOption::PrefixInformation(PrefixInformation {
                    prefix_len: body[0],
                    on_link: body[1] & 0x80 != 0,
                    autonomous: body[1] & 0x40 != 0,
                    valid_lifetime: Duration::from_secs(be_u32(&body[2..6]).into()),
                    preferred_lifetime: Duration::from_secs(be_u32(&body[6..10]).into()),
                    prefix: Ipv6Addr::from(prefix),
                }));
            }
            _ => {}
        }

        buf = &buf[total..];
    }

    Ok(options)
}

fn ensure_len(what: &'static str, buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            what,
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Seconds as a 32-bit lifetime field; saturates to infinity (0xffffffff).
fn lifetime_u32(d: Duration) -> u32 {
    u32::try_from(d.as_secs()).unwrap_or(u32::MAX)
}

fn millis_u32(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}
