//! gwd-nft - nftables reconciliation for a gateway daemon
//!
//! Programs one private `inet` table over netlink and keeps it converged:
//! a flow-offload flowtable on auto-selected devices, an IPv4 interval set of
//! LAN CIDRs, interface bypass sets, and three base chains with a fixed rule
//! program.
//!
//! # Architecture
//!
//! - [`core`] - Device selection, set reconciliation, rule compilation and orchestration
//! - [`netlink`] - nf_tables netlink transport and the production backend
//! - [`config`] - Declarative configuration with defaults
//! - [`validators`] - Input validation for names, interfaces and CIDRs
//! - [`utils`] - Sysfs listing and name-list helpers
//!
//! # Guarantees
//!
//! - Idempotent: a second `ensure` with unchanged inputs commits nothing
//! - Atomic chain programs: all three chains change in one transaction
//! - Scoped: only objects with the configured names are read or written

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod netlink;
pub mod utils;
pub mod validators;

pub use config::Config;
pub use core::devices::SysHost;
pub use core::error::{Error, ErrorKind, Result};
pub use core::firewall::{TableStatus, ensure, ensure_with, inspect, inspect_with, remove, remove_with};
pub use netlink::NetlinkBackend;

/// Fully populated default configuration.
pub fn default_config() -> Config {
    Config::default()
}
