//! tapra agent library
//!
//! Answers IPv6 stateless autoconfiguration for guests behind hypervisor tap
//! interfaces. Every tap whose name matches the configured pattern gets a
//! session that advertises the /64 derived from the host route pointing at
//! it, periodically and whenever the guest solicits.
//!
//! ## Architecture
//!
//! ```text
//! rtnetlink ──LinkEvent──▶ Driver ──add/close──▶ Engine
//!                                                 └── TapSession(index)
//!                                                      ├── send loop
//!                                                      └── receive loop
//! ```
//!
//! ## Modules
//!
//! - `engine`: registry of sessions keyed by interface index
//! - `session`: per-interface lifecycle (bind with retry, then advertise)
//! - `protocol`: advertisement template and the send/receive loops
//! - `driver`: link events to engine calls
//! - `netlink`, `socket`: kernel collaborators
//! - `testing`: in-memory collaborators

pub mod cancel;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod link;
pub mod netlink;
pub mod protocol;
pub mod routes;
pub mod session;
pub mod socket;
pub mod testing;

pub use config::Config;
pub use driver::{Driver, DriverExit, LinkAction};
pub use engine::Engine;
pub use error::SessionError;
pub use link::{is_ready, InterfaceHandle, LinkAttributes, LinkEvent, OperState};
pub use protocol::AdvertConfig;
pub use session::{SessionState, TapSession};
