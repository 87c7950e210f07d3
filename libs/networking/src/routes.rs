//! Route classification and SLAAC prefix selection.
//!
//! The kernel routes pointing out of a tap interface tell us which addresses
//! the guest behind it owns. A /128 host route yields the /64 we advertise for
//! SLAAC; shorter subnet routes only qualify the interface for management.

use std::net::Ipv6Addr;

use crate::{is_link_local, mask_ipv6, Ipv6Prefix, NetworkError, SLAAC_PREFIX_LEN};

/// A single route destination as listed by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Destination address (host bits may be set).
    pub destination: Ipv6Addr,

    /// Destination prefix length.
    pub prefix_len: u8,
}

impl Route {
    pub fn new(destination: Ipv6Addr, prefix_len: u8) -> Self {
        Self {
            destination,
            prefix_len,
        }
    }

    /// True for a /128 destination.
    pub fn is_host(&self) -> bool {
        self.prefix_len == 128
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.destination, self.prefix_len)
    }
}

/// IPv6 blocks that are never advertised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionList(Vec<Ipv6Prefix>);

impl ExclusionList {
    pub fn new(blocks: Vec<Ipv6Prefix>) -> Self {
        Self(blocks)
    }

    /// Parse a list of CIDR strings.
    pub fn parse<S: AsRef<str>>(blocks: &[S]) -> Result<Self, NetworkError> {
        blocks
            .iter()
            .map(|s| Ipv6Prefix::from_cidr(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Whether `addr` falls inside any excluded block.
    pub fn excludes(&self, addr: Ipv6Addr) -> bool {
        self.0.iter().any(|block| block.contains(addr))
    }

    pub fn blocks(&self) -> &[Ipv6Prefix] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Routes qualifying an interface for advertisement, in listing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet {
    pub host_routes: Vec<Route>,
    pub subnet_routes: Vec<Route>,
}

impl RouteSet {
    /// Filter out excluded destinations and split the rest into host and
    /// subnet routes. Link-local and multicast destinations are neither.
    pub fn classify<I>(routes: I, exclusions: &ExclusionList) -> Self
    where
        I: IntoIterator<Item = Route>,
    {
        let mut set = RouteSet::default();

        for route in routes {
            if exclusions.excludes(route.destination) {
                continue;
            }
            if is_link_local(route.destination) || route.destination.is_multicast() {
                continue;
            }
            if route.is_host() {
                set.host_routes.push(route);
            } else {
                set.subnet_routes.push(route);
            }
        }

        set
    }

    pub fn is_empty(&self) -> bool {
        self.host_routes.is_empty() && self.subnet_routes.is_empty()
    }

    /// The SLAAC prefix derived from the host routes, if any.
    pub fn prefix(&self) -> Option<Ipv6Addr> {
        select_prefix(&self.host_routes)
    }
}

/// Pick the first host route in listing order and mask it to /64.
///
/// There is no tie-break between several host routes: the kernel listing
/// order decides.
pub fn select_prefix(host_routes: &[Route]) -> Option<Ipv6Addr> {
    host_routes
        .first()
        .map(|route| mask_ipv6(route.destination, SLAAC_PREFIX_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(s: &str) -> Route {
        let (addr, len) = s.split_once('/').unwrap();
        Route::new(addr.parse().unwrap(), len.parse().unwrap())
    }

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_select_prefix_takes_first_route() {
        let routes = vec![route("2001:db8:1::1/128"), route("2001:db8:2::1/128")];
        assert_eq!(select_prefix(&routes), Some(addr("2001:db8:1::")));
    }

    #[test]
    fn test_select_prefix_empty() {
        assert_eq!(select_prefix(&[]), None);
    }

    #[test]
    fn test_exclusion_drops_route_before_selection() {
        let exclusions = ExclusionList::parse(&["2001:db8:1::/48"]).unwrap();
        let set = RouteSet::classify(
            vec![route("2001:db8:1::1/128"), route("2001:db8:2::1/128")],
            &exclusions,
        );

        assert_eq!(set.host_routes, vec![route("2001:db8:2::1/128")]);
        assert_eq!(set.prefix(), Some(addr("2001:db8:2::")));
    }

    #[test]
    fn test_exclusion_order_is_irrelevant() {
        let routes = vec![
            route("2001:db8:1::1/128"),
            route("2001:db8:2::1/128"),
            route("2001:db8:3::/64"),
        ];
        let a = ExclusionList::parse(&["2001:db8:1::/48", "2001:db8:3::/48"]).unwrap();
        let b = ExclusionList::parse(&["2001:db8:3::/48", "2001:db8:1::/48"]).unwrap();

        assert_eq!(
            RouteSet::classify(routes.clone(), &a),
            RouteSet::classify(routes, &b)
        );
    }

    #[test]
    fn test_classify_splits_host_and_subnet() {
        let set = RouteSet::classify(
            vec![
                route("fe80::/64"),
                route("2001:db8:5::/64"),
                route("2001:db8:5::10/128"),
                route("fe80::1/128"),
            ],
            &ExclusionList::default(),
        );

        assert_eq!(set.host_routes, vec![route("2001:db8:5::10/128")]);
        assert_eq!(set.subnet_routes, vec![route("2001:db8:5::/64")]);
    }

    #[test]
    fn test_subnet_only_has_no_prefix() {
        let set = RouteSet::classify(vec![route("2001:db8:9::/56")], &ExclusionList::default());
        assert!(!set.is_empty());
        assert_eq!(set.prefix(), None);
    }

    #[test]
    fn test_link_local_only_is_empty() {
        let set = RouteSet::classify(vec![route("fe80::/64")], &ExclusionList::default());
        assert!(set.is_empty());
    }

    #[test]
    fn test_exclusion_list_rejects_bad_cidr() {
        assert!(ExclusionList::parse(&["2001:db8::/48", "garbage"]).is_err());
    }
}
