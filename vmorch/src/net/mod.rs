//! Host network bring-up: tap devices, addresses and NAT rules.

mod coordinator;
mod host;
mod pool;

pub use coordinator::{LeaseStats, NetworkCoordinator, NetworkOptions, TapLease};
pub use host::{HostNetwork, IpCommandHost};
pub use pool::{AddressPool, TapAddress, parse_cidr};
