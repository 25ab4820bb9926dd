//! Reconciliation engine
//!
//! - [`interval`]: CIDR intervals, interface-name keys, element diffs
//! - [`devices`]: offload/bypass device partition and LAN CIDR detection
//! - [`sets`]: generic set reconciler with LAN and bypass callers
//! - [`expr`] / [`rules`]: nftables expressions and the fixed chain programs
//! - [`backend`]: the kernel operations the engine consumes
//! - [`firewall`]: `ensure`, `remove` and `inspect`
//! - [`error`]: error types for all of the above

pub mod backend;
pub mod devices;
pub mod error;
pub mod expr;
pub mod firewall;
pub mod interval;
pub mod rules;
pub mod sets;

#[cfg(test)]
pub mod test_helpers;
