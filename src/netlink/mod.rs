//! Minimal nf_tables netlink transport
//!
//! - [`consts`]: ABI numbers from the kernel UAPI headers
//! - [`attr`]: attribute and message framing
//! - [`socket`]: `NETLINK_NETFILTER` socket with batch commit
//! - [`backend`]: [`NetlinkBackend`], the production [`crate::core::backend::Backend`]

pub mod attr;
pub mod backend;
pub mod consts;
pub mod socket;

pub use backend::NetlinkBackend;
