//! shunt: a TCP load-balancing proxy.
//!
//! Accepts client connections on one port and bridges each to one of a set
//! of replica upstreams, forwarding bytes in both directions until either
//! side closes. Upstreams are typically the local ends of ssh tunnels to a
//! single logical backend, which shunt can also own and supervise.

pub mod api;
pub mod balancer;
pub mod cli;
pub mod config;
pub mod counter;
pub mod jumphost;
pub mod proxy;
pub mod server;
pub mod tunnel;

pub use config::{BalancerKind, HostPort, JumpHost, ProxyConfiguration};
pub use counter::RateCounter;
pub use proxy::TcpProxy;
pub use server::Server;

/// Version string baked in from the package metadata; "unknown" when built
/// without it.
pub const VERSION: &str = match option_env!("CARGO_PKG_VERSION") {
    Some(version) => version,
    None => "unknown",
};
