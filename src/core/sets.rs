//! Set reconciliation
//!
//! One routine converges any named set to a desired element list; the LAN
//! interval set and the two interface bypass sets are thin callers.
//! Creation, deletions and additions each commit as their own transaction, and
//! a set already holding the desired elements costs no transaction at all.

use std::io;

use tracing::{debug, info, warn};

use crate::core::backend::{Backend, KeyType, SetInfo, SetSpec};
use crate::core::error::{Entity, Error, Result};
use crate::core::interval::{SetElement, diff_elements, ifname_elements, lan_elements};
use crate::utils::unique_sorted;

/// Creates `spec` in `table` if needed, then applies the element delta
/// between the kernel and `build()`.
///
/// Returns the set as the kernel reports it, including its handle.
pub fn ensure_set<F>(
    backend: &mut dyn Backend,
    table: &str,
    spec: &SetSpec,
    build: F,
) -> Result<SetInfo>
where
    F: FnOnce() -> Result<Vec<SetElement>>,
{
    let entity = || Entity::Set(spec.name.clone());

    let set = match backend
        .get_set(table, &spec.name)
        .map_err(|e| Error::firewall("get set", entity(), e))?
    {
        Some(set) => set,
        None => {
            info!(
                "Creating set {} ({}, interval={})",
                spec.name, spec.key_type, spec.interval
            );
            backend.add_set(table, spec);
            backend
                .flush()
                .map_err(|e| Error::firewall("add set", entity(), e))?;
            backend
                .get_set(table, &spec.name)
                .map_err(|e| Error::firewall("get set", entity(), e))?
                .ok_or_else(|| {
                    Error::firewall(
                        "add set",
                        entity(),
                        io::Error::new(io::ErrorKind::NotFound, "set missing after creation"),
                    )
                })?
        }
    };

    if set.key_type != spec.key_type.type_id() || set.key_len != spec.key_type.key_len() {
        warn!(
            "Set {} has key type {}/{} bytes, expected {} ({} bytes)",
            spec.name,
            set.key_type,
            set.key_len,
            spec.key_type,
            spec.key_type.key_len()
        );
    }
    if set.is_interval() != spec.interval {
        warn!(
            "Set {} has interval={}, expected {}; keeping it",
            spec.name,
            set.is_interval(),
            spec.interval
        );
    }

    let mut desired = build()?;
    desired.sort();
    let mut current = backend
        .get_set_elements(table, &spec.name)
        .map_err(|e| Error::firewall("get set elements", entity(), e))?;
    current.sort();

    let delta = diff_elements(&current, &desired);
    if delta.is_noop() {
        debug!("Set {} up to date ({} elements)", spec.name, current.len());
        return Ok(set);
    }

    if !delta.to_del.is_empty() {
        debug!("Set {}: deleting {} elements", spec.name, delta.to_del.len());
        backend.del_set_elements(table, &spec.name, &delta.to_del);
        backend
            .flush()
            .map_err(|e| Error::firewall("delete set elements", entity(), e))?;
    }
    if !delta.to_add.is_empty() {
        debug!("Set {}: adding {} elements", spec.name, delta.to_add.len());
        backend.add_set_elements(table, &spec.name, &delta.to_add);
        backend
            .flush()
            .map_err(|e| Error::firewall("add set elements", entity(), e))?;
    }
    info!(
        "Set {} reconciled (+{} -{})",
        spec.name,
        delta.to_add.len(),
        delta.to_del.len()
    );
    Ok(set)
}

/// IPv4 interval set holding the LAN CIDRs.
pub fn ensure_lan_set(
    backend: &mut dyn Backend,
    table: &str,
    name: &str,
    cidrs: &[String],
) -> Result<SetInfo> {
    let spec = SetSpec {
        name: name.to_string(),
        key_type: KeyType::Ipv4Addr,
        interval: true,
    };
    ensure_set(backend, table, &spec, || lan_elements(cidrs))
}

/// Interface-name set consulted by a chain's bypass rule.
pub fn ensure_bypass_set(
    backend: &mut dyn Backend,
    table: &str,
    name: &str,
    ifaces: &[String],
) -> Result<SetInfo> {
    let spec = SetSpec {
        name: name.to_string(),
        key_type: KeyType::IfName,
        interval: false,
    };
    ensure_set(backend, table, &spec, || {
        ifname_elements(&unique_sorted(ifaces))
    })
}
