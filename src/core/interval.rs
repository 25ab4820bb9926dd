//! Set element primitives
//!
//! - CIDR to half-open interval expansion (`[network, broadcast + 1)`)
//! - Fixed-width interface name keys
//! - Element ordering and add/delete deltas
//!
//! Everything here is pure byte arithmetic; nothing touches the kernel.

use std::collections::BTreeMap;
use std::fmt;

use ipnetwork::IpNetwork;

use crate::core::error::{Error, Result};

/// Width of an interface-name set key (`IFNAMSIZ`).
pub const IFNAME_KEY_LEN: usize = 16;

/// One element of an nftables set as it travels over netlink.
///
/// Ordering is by raw key bytes, with an interval start sorting before the
/// interval end that shares its key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetElement {
    pub key: Vec<u8>,
    pub interval_end: bool,
}

impl SetElement {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            interval_end: false,
        }
    }

    pub fn interval_end(key: Vec<u8>) -> Self {
        Self {
            key,
            interval_end: true,
        }
    }
}

impl fmt::Display for SetElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.key {
            write!(f, "{b:02x}")?;
        }
        if self.interval_end {
            write!(f, " (end)")?;
        }
        Ok(())
    }
}

/// Adds one to a big-endian address, returning `None` on overflow.
pub fn increment(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut out = bytes.to_vec();
    for byte in out.iter_mut().rev() {
        let (sum, carry) = byte.overflowing_add(1);
        *byte = sum;
        if !carry {
            return Some(out);
        }
    }
    None
}

/// Network address and exclusive upper bound of a CIDR, as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Interval {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl Interval {
    pub fn elements(&self) -> [SetElement; 2] {
        [
            SetElement::new(self.start.clone()),
            SetElement::interval_end(self.end.clone()),
        ]
    }
}

fn addr_bytes(net: &IpNetwork) -> (Vec<u8>, Vec<u8>) {
    match net {
        IpNetwork::V4(n) => (n.ip().octets().to_vec(), n.mask().octets().to_vec()),
        IpNetwork::V6(n) => (n.ip().octets().to_vec(), n.mask().octets().to_vec()),
    }
}

/// Expands one CIDR string into its half-open interval.
///
/// Host bits in the address are ignored (`10.0.0.5/8` covers `10.0.0.0/8`).
///
/// # Errors
///
/// Returns a validation error if the string is not a CIDR, or if
/// `broadcast + 1` does not fit the address width (`0.0.0.0/0`, `::/0`).
pub fn cidr_interval(cidr: &str) -> Result<Interval> {
    let net: IpNetwork = cidr.parse().map_err(|e| Error::Validation {
        field: "lan_cidrs".to_string(),
        message: format!("invalid CIDR {cidr:?}: {e}"),
    })?;

    let (ip, mask) = addr_bytes(&net);
    let start: Vec<u8> = ip.iter().zip(&mask).map(|(a, m)| a & m).collect();
    let last: Vec<u8> = start.iter().zip(&mask).map(|(s, m)| s | !m).collect();
    let end = increment(&last).ok_or_else(|| Error::Validation {
        field: "lan_cidrs".to_string(),
        message: format!("CIDR overflowed maximum address: {cidr}"),
    })?;

    Ok(Interval { start, end })
}

/// Sorts intervals and merges any that overlap.
///
/// The kernel refuses overlapping interval elements, so `10.0.0.0/8` next to
/// `10.1.0.0/16` collapses into the `/8`. Adjacent intervals stay separate.
pub fn normalize_intervals(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort();
    let mut out: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals {
        if let Some(prev) = out.last_mut()
            && prev.start.len() == iv.start.len()
            && iv.start < prev.end
        {
            if iv.end > prev.end {
                prev.end = iv.end;
            }
            continue;
        }
        out.push(iv);
    }
    out
}

/// Builds the IPv4 interval elements for the LAN set.
///
/// Strings that are empty after trimming are skipped.
///
/// # Errors
///
/// Fails on the first malformed or overflowing CIDR, and on IPv6 CIDRs since
/// the LAN set is keyed by IPv4 addresses.
pub fn lan_elements<S: AsRef<str>>(cidrs: &[S]) -> Result<Vec<SetElement>> {
    let mut intervals = Vec::with_capacity(cidrs.len());
    for raw in cidrs {
        let cidr = raw.as_ref().trim();
        if cidr.is_empty() {
            continue;
        }
        let iv = cidr_interval(cidr)?;
        if iv.start.len() != 4 {
            return Err(Error::Validation {
                field: "lan_cidrs".to_string(),
                message: format!("unsupported address family for IPv4 set: {cidr}"),
            });
        }
        intervals.push(iv);
    }

    Ok(normalize_intervals(intervals)
        .iter()
        .flat_map(Interval::elements)
        .collect())
}

/// Encodes an interface name as a zero-padded 16-byte key.
///
/// # Errors
///
/// Names longer than 15 bytes do not fit `IFNAMSIZ` with its terminator.
pub fn ifname_key(name: &str) -> Result<Vec<u8>> {
    let bytes = name.as_bytes();
    if bytes.len() >= IFNAME_KEY_LEN {
        return Err(Error::Validation {
            field: "interface".to_string(),
            message: format!("interface name too long (max 15 bytes): {name}"),
        });
    }
    let mut key = vec![0u8; IFNAME_KEY_LEN];
    key[..bytes.len()].copy_from_slice(bytes);
    Ok(key)
}

/// Builds interface-set elements from already deduplicated, sorted names.
pub fn ifname_elements(names: &[String]) -> Result<Vec<SetElement>> {
    names
        .iter()
        .map(|n| ifname_key(n).map(SetElement::new))
        .collect()
}

/// Add/delete delta between the kernel's elements and the desired ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementDelta {
    pub to_add: Vec<SetElement>,
    pub to_del: Vec<SetElement>,
}

impl ElementDelta {
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_del.is_empty()
    }
}

/// Multiset difference keyed by `(key, interval_end)`.
///
/// `to_add = desired \ current`, `to_del = current \ desired`; both come out
/// sorted.
pub fn diff_elements(current: &[SetElement], desired: &[SetElement]) -> ElementDelta {
    let mut counts: BTreeMap<&SetElement, isize> = BTreeMap::new();
    for e in desired {
        *counts.entry(e).or_default() += 1;
    }
    for e in current {
        *counts.entry(e).or_default() -= 1;
    }

    let mut delta = ElementDelta::default();
    for (elem, n) in counts {
        if n > 0 {
            delta
                .to_add
                .extend(std::iter::repeat_n(elem.clone(), n.unsigned_abs()));
        } else if n < 0 {
            delta
                .to_del
                .extend(std::iter::repeat_n(elem.clone(), n.unsigned_abs()));
        }
    }
    delta
}
