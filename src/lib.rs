//! Veilport daemon core
//!
//! The tunnel engine of the Veilport desktop VPN client daemon. This crate
//! owns the privileged, order-sensitive part of the product:
//!
//! - `vpn`: WireGuard tunnel lifecycle (interface allocation, peer
//!   configuration, handshake wait, routing and DNS side effects,
//!   pause/resume, teardown with rollback)
//! - `dns`: resolver configuration on the VPN and non-VPN interfaces
//! - `conntest`: connectivity tester that drives a throw-away tunnel
//!   through candidate (server, host, port) combinations
//! - `platform`: narrow shim over the OS tools (route/ifconfig/wg and the
//!   DNS script); everything above it is testable against a recording
//!   executor
//! - `service`: the API surface exposed to the rest of the daemon
//!
//! The crate does not implement the WireGuard protocol itself; it drives an
//! existing kernel or userspace implementation through its control tools.
//! Nothing here persists state: preferences live in the surrounding daemon.

pub mod conntest;
pub mod dns;
pub mod geo;
pub mod platform;
pub mod servers;
pub mod service;
pub mod vpn;

pub use conntest::{
    ConnectivityTester, CurrentSelection, GoodConnectionInfo, ProbePolicy, StatusEvent,
};
pub use dns::{DnsEncryption, DnsManager, DnsSettings};
pub use platform::{DefaultRoute, Platform, Shim};
pub use servers::ServersCatalogue;
pub use service::{ConnTestEvents, VpnService};
pub use vpn::lifecycle::Tunnel;
pub use vpn::params::ConnectionParameters;
pub use vpn::{State, StateInfo, VpnError, VpnResult};
