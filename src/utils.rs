//! Small helpers for host inspection and name lists
//!
//! # Example
//!
//! ```
//! use gwd_nft::utils::{union, unique_sorted};
//!
//! let names = vec!["eth1".to_string(), "eth0".to_string(), "eth1".to_string()];
//! assert_eq!(unique_sorted(&names), ["eth0", "eth1"]);
//! assert_eq!(union(&names, &["wg0".to_string()]), ["eth0", "eth1", "wg0"]);
//! ```

use std::collections::BTreeSet;
use std::path::Path;

/// Default sysfs directory holding one entry per network device.
pub const SYSFS_NET: &str = "/sys/class/net";

/// Lists the entries of a sysfs-style network device directory, sorted.
///
/// Nothing is filtered here; callers decide which names are candidates.
pub fn list_interfaces(root: &Path) -> std::io::Result<Vec<String>> {
    let mut interfaces = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if let Ok(name) = entry.file_name().into_string() {
            interfaces.push(name);
        }
    }
    interfaces.sort();
    Ok(interfaces)
}

/// Drops blanks and duplicates, returning the remaining names sorted.
pub fn unique_sorted<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    names
        .iter()
        .map(|n| n.as_ref().trim())
        .filter(|n| !n.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Sorted, deduplicated union of two name lists.
pub fn union<A: AsRef<str>, B: AsRef<str>>(a: &[A], b: &[B]) -> Vec<String> {
    let mut all: Vec<&str> = a.iter().map(AsRef::as_ref).collect();
    all.extend(b.iter().map(AsRef::as_ref));
    unique_sorted(&all)
}
