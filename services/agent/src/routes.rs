//! Kernel-facing route selection for a tap interface.

use async_trait::async_trait;
use tapra_networking::{ExclusionList, Route, RouteSet};
use tracing::debug;

use crate::error::SessionError;
use crate::link::LinkAttributes;
use crate::netlink::NetlinkError;

/// Source of interface attributes and routes.
///
/// Implemented by [`crate::netlink::Netlink`] against the kernel, and by
/// [`crate::testing::MockInterfaceSource`] in tests.
#[async_trait]
pub trait InterfaceSource: Send + Sync {
    /// Current attributes of the link with this index.
    async fn link(&self, index: u32) -> Result<LinkAttributes, NetlinkError>;

    /// IPv6 routes whose output interface is `index`, in listing order.
    async fn ipv6_routes(&self, index: u32) -> Result<Vec<Route>, NetlinkError>;
}

/// List the routes for `interface`, drop excluded destinations and split the
/// remainder into host and subnet routes.
///
/// Fails when the listing itself fails or when nothing usable is left.
pub async fn select_routes(
    source: &dyn InterfaceSource,
    index: u32,
    interface: &str,
    exclusions: &ExclusionList,
) -> Result<RouteSet, SessionError> {
    let routes = source
        .ipv6_routes(index)
        .await
        .map_err(|source| SessionError::RouteQuery {
            interface: interface.to_string(),
            source,
        })?;

    debug!(interface, count = routes.len(), "listed IPv6 routes");

    let set = RouteSet::classify(routes, exclusions);
    if set.is_empty() {
        return Err(SessionError::NoRoutes {
            interface: interface.to_string(),
        });
    }

    Ok(set)
}
