//! Reconciliation of the managed nftables table
//!
//! [`ensure_with`] converges one `inet` table to the state declared by a
//! [`Config`]:
//!
//! - the table itself
//! - a flowtable hooked on the selected offload devices
//! - an IPv4 interval set of LAN CIDRs
//! - two interface-name sets of bypass devices
//! - three base chains (`input`, `forward`, `output`) holding a fixed program
//!
//! Each step commits its own transaction; the chain programs change in one
//! final transaction. A second run against unchanged inputs commits nothing.
//! [`remove_with`] deletes the table, which cascades to everything in it.
//!
//! Objects are only ever addressed by the configured names.
//!
//! # Example
//!
//! ```no_run
//! use gwd_nft::{Config, ensure, remove};
//!
//! let cfg = Config {
//!     flowtable_device_exclude_prefixes: vec!["veth".into(), "docker".into()],
//!     ..Config::default()
//! };
//! ensure(&cfg)?;
//! remove(&cfg)?;
//! # Ok::<(), gwd_nft::Error>(())
//! ```

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::backend::{Backend, ChainHook, ChainSpec, FlowtableSpec, RuleInfo};
use crate::core::devices::{
    HostInventory, SysHost, detect_devices, flow_devices, resolve_lan_cidrs,
};
use crate::core::error::{Entity, Error, Result};
use crate::core::rules::{CompiledRule, OffloadTarget, compile_programs, userdata_fingerprint};
use crate::core::sets::{ensure_bypass_set, ensure_lan_set};
use crate::netlink::NetlinkBackend;
use crate::utils::union;

/// Reconciles the kernel against `cfg` over netlink, reading the running
/// host's interfaces.
pub fn ensure(cfg: &Config) -> Result<()> {
    ensure_with(&mut NetlinkBackend::new(), &SysHost::new(), cfg)
}

/// Deletes the managed table over netlink. An absent table is success.
pub fn remove(cfg: &Config) -> Result<()> {
    remove_with(&mut NetlinkBackend::new(), cfg)
}

/// Reports what currently exists under the configured names.
pub fn inspect(cfg: &Config) -> Result<TableStatus> {
    inspect_with(&mut NetlinkBackend::new(), cfg)
}

fn chain_specs(cfg: &Config) -> [ChainSpec; 3] {
    let priority = cfg.filter_priority();
    [
        ChainSpec {
            name: cfg.input_chain_name.clone(),
            hook: ChainHook::Input,
            priority,
        },
        ChainSpec {
            name: cfg.forward_chain_name.clone(),
            hook: ChainHook::Forward,
            priority,
        },
        ChainSpec {
            name: cfg.output_chain_name.clone(),
            hook: ChainHook::Output,
            priority,
        },
    ]
}

/// Whether the installed rules are exactly `program`, in order.
fn program_installed(installed: &[RuleInfo], program: &[CompiledRule]) -> bool {
    installed.len() == program.len()
        && installed.iter().zip(program).all(|(rule, compiled)| {
            rule.userdata
                .as_deref()
                .and_then(userdata_fingerprint)
                .is_some_and(|fp| fp == compiled.fingerprint())
        })
}

fn ensure_table(backend: &mut dyn Backend, table: &str) -> Result<()> {
    let entity = || Entity::Table(table.to_string());
    if backend
        .get_table(table)
        .map_err(|e| Error::firewall("get table", entity(), e))?
        .is_some()
    {
        debug!("Table inet {table} present");
        return Ok(());
    }
    info!("Creating table inet {table}");
    backend.add_table(table);
    backend
        .flush()
        .map_err(|e| Error::firewall("add table", entity(), e))
}

/// Creates the flowtable, or replaces it when its hook tuple drifted.
///
/// Offload rules in the forward chain pin the flowtable, so a replacement
/// flushes that chain in the same transaction as the delete.
fn ensure_flowtable(backend: &mut dyn Backend, cfg: &Config, devices: Vec<String>) -> Result<()> {
    let table = cfg.table_name.as_str();
    let entity = || Entity::Flowtable(cfg.flowtable_name.clone());
    let desired = FlowtableSpec {
        name: cfg.flowtable_name.clone(),
        hooknum: cfg.flowtable_hook().hooknum(),
        priority: cfg.flowtable_priority(),
        devices,
    };

    match backend
        .get_flowtable(table, &desired.name)
        .map_err(|e| Error::firewall("get flowtable", entity(), e))?
    {
        Some(current) if current.same_hook(&desired) => {
            debug!("Flowtable {} up to date", desired.name);
            return Ok(());
        }
        Some(current) => {
            info!(
                "Flowtable {} drifted (hook {} prio {} devices {:?}), recreating with devices {:?}",
                desired.name, current.hooknum, current.priority, current.devices, desired.devices
            );
            let forward = cfg.forward_chain_name.as_str();
            if backend
                .get_chain(table, forward)
                .map_err(|e| Error::firewall("get chain", Entity::Chain(forward.to_string()), e))?
                .is_some()
            {
                backend.flush_chain(table, forward);
            }
            backend.del_flowtable(table, &desired.name);
            backend
                .flush()
                .map_err(|e| Error::firewall("delete flowtable", entity(), e))?;
        }
        None => {
            info!(
                "Creating flowtable {} on devices {:?}",
                desired.name, desired.devices
            );
        }
    }

    backend.add_flowtable(table, &desired);
    backend
        .flush()
        .map_err(|e| Error::firewall("add flowtable", entity(), e))
}

/// Creates missing base chains in one transaction. Existing chains are kept
/// even when their hook or priority differs.
fn ensure_chains(backend: &mut dyn Backend, cfg: &Config) -> Result<()> {
    let table = cfg.table_name.as_str();
    let mut created = Vec::new();
    for spec in chain_specs(cfg) {
        match backend
            .get_chain(table, &spec.name)
            .map_err(|e| Error::firewall("get chain", Entity::Chain(spec.name.clone()), e))?
        {
            Some(info) if info.hook != Some(spec.hook) => {
                warn!(
                    "Chain {} is hooked on {:?}, expected {}; leaving it in place",
                    spec.name, info.hook, spec.hook
                );
            }
            Some(info) if info.priority != Some(spec.priority) => {
                warn!(
                    "Chain {} has priority {:?}, expected {}; leaving it in place",
                    spec.name, info.priority, spec.priority
                );
            }
            Some(_) => {}
            None => {
                info!(
                    "Creating chain {} (hook {} priority {})",
                    spec.name, spec.hook, spec.priority
                );
                backend.add_chain(table, &spec);
                created.push(spec.name);
            }
        }
    }

    if created.is_empty() {
        return Ok(());
    }
    backend
        .flush()
        .map_err(|e| Error::firewall("add chain", Entity::Chain(created.join(",")), e))
}

/// Reconciles the kernel against `cfg` through `backend`, reading interfaces
/// from `host`.
///
/// The first failure aborts; transactions already committed stay in place
/// and a later run converges from there.
pub fn ensure_with(
    backend: &mut dyn Backend,
    host: &dyn HostInventory,
    cfg: &Config,
) -> Result<()> {
    let cfg = cfg.clone().with_defaults();
    cfg.validate()?;
    let table = cfg.table_name.as_str();

    ensure_table(backend, table)?;

    let live = host.list_devices()?;
    let selection = detect_devices(&cfg, &live);
    let devices = flow_devices(&cfg, &selection);
    let input_bypass = union(&selection.auto_bypass, &cfg.input_bypass_ifaces);
    let forward_bypass = union(&selection.auto_bypass, &cfg.forward_bypass_ifaces);
    let lan_cidrs = resolve_lan_cidrs(&cfg, host)?;
    debug!("Flow devices {devices:?}, LAN CIDRs {lan_cidrs:?}");

    let offload_possible = !devices.is_empty();
    ensure_flowtable(backend, &cfg, devices)?;

    let lan_set = ensure_lan_set(backend, table, &cfg.lan_set_name, &lan_cidrs)?;

    ensure_chains(backend, &cfg)?;

    ensure_bypass_set(backend, table, &cfg.input_bypass_set_name, &input_bypass)?;
    ensure_bypass_set(backend, table, &cfg.forward_bypass_set_name, &forward_bypass)?;

    let offload = (offload_possible && lan_set.handle != 0).then(|| OffloadTarget {
        lan_set: &cfg.lan_set_name,
        flowtable: &cfg.flowtable_name,
    });
    let programs = compile_programs(
        &cfg.input_bypass_set_name,
        &cfg.forward_bypass_set_name,
        offload,
    );

    let mut changed = Vec::new();
    for (chain, program) in [
        (&cfg.input_chain_name, &programs.input),
        (&cfg.forward_chain_name, &programs.forward),
        (&cfg.output_chain_name, &programs.output),
    ] {
        let installed = backend
            .list_rules(table, chain)
            .map_err(|e| Error::firewall("list rules", Entity::Chain(chain.clone()), e))?;
        if program_installed(&installed, program) {
            debug!("Chain {chain} already holds its {} rules", program.len());
            continue;
        }
        backend.flush_chain(table, chain);
        for rule in program {
            backend.add_rule(table, chain, rule);
        }
        changed.push(chain.as_str());
    }

    if changed.is_empty() {
        info!("nftables table {table} already converged");
        return Ok(());
    }
    info!("Programming chains {changed:?}");
    backend
        .flush()
        .map_err(|e| Error::firewall("program chains", Entity::Chain(changed.join(",")), e))?;
    info!("nftables table {table} converged");
    Ok(())
}

/// Deletes the managed table through `backend`. Idempotent.
pub fn remove_with(backend: &mut dyn Backend, cfg: &Config) -> Result<()> {
    let cfg = cfg.clone().with_defaults();
    let table = cfg.table_name.as_str();
    let entity = || Entity::Table(table.to_string());

    if backend
        .get_table(table)
        .map_err(|e| Error::firewall("get table", entity(), e))?
        .is_none()
    {
        debug!("Table inet {table} absent, nothing to remove");
        return Ok(());
    }
    info!("Deleting table inet {table}");
    backend.del_table(table);
    backend
        .flush()
        .map_err(|e| Error::firewall("delete table", entity(), e))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowtableStatus {
    pub name: String,
    pub hooknum: u32,
    pub priority: i32,
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetStatus {
    pub name: String,
    pub present: bool,
    pub elements: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStatus {
    pub name: String,
    pub present: bool,
    pub hook: Option<String>,
    pub priority: Option<i32>,
    pub rules: usize,
    /// Installed rules are exactly the program `ensure` would install.
    pub in_sync: bool,
    /// Handles of installed rules that carry no program fingerprint.
    pub foreign_rules: Vec<u64>,
}

/// Read-only snapshot of the managed objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStatus {
    pub table: String,
    pub present: bool,
    pub handle: Option<u64>,
    pub flowtable: Option<FlowtableStatus>,
    pub sets: Vec<SetStatus>,
    pub chains: Vec<ChainStatus>,
}

fn set_status(backend: &mut dyn Backend, table: &str, name: &str) -> Result<SetStatus> {
    let entity = || Entity::Set(name.to_string());
    let present = backend
        .get_set(table, name)
        .map_err(|e| Error::firewall("get set", entity(), e))?
        .is_some();
    let elements = if present {
        backend
            .get_set_elements(table, name)
            .map_err(|e| Error::firewall("get set elements", entity(), e))?
            .len()
    } else {
        0
    };
    Ok(SetStatus {
        name: name.to_string(),
        present,
        elements,
    })
}

/// Reports what exists under the configured names through `backend`.
///
/// Never queues a mutation. A chain is `in_sync` when its rules carry the
/// fingerprints of the program `ensure` would install given the flowtable and
/// LAN set found alongside it.
pub fn inspect_with(backend: &mut dyn Backend, cfg: &Config) -> Result<TableStatus> {
    let cfg = cfg.clone().with_defaults();
    let table = cfg.table_name.as_str();
    let mut status = TableStatus {
        table: table.to_string(),
        present: false,
        handle: None,
        flowtable: None,
        sets: Vec::new(),
        chains: Vec::new(),
    };

    let Some(info) = backend
        .get_table(table)
        .map_err(|e| Error::firewall("get table", Entity::Table(table.to_string()), e))?
    else {
        return Ok(status);
    };
    status.present = true;
    status.handle = Some(info.handle);

    let flowtable_entity = || Entity::Flowtable(cfg.flowtable_name.clone());
    status.flowtable = backend
        .get_flowtable(table, &cfg.flowtable_name)
        .map_err(|e| Error::firewall("get flowtable", flowtable_entity(), e))?
        .map(|ft| FlowtableStatus {
            name: ft.name,
            hooknum: ft.hooknum,
            priority: ft.priority,
            devices: ft.devices,
        });

    for name in [
        &cfg.lan_set_name,
        &cfg.input_bypass_set_name,
        &cfg.forward_bypass_set_name,
    ] {
        status.sets.push(set_status(backend, table, name)?);
    }

    let lan_present = status.sets.first().is_some_and(|s| s.present);
    let offload = (lan_present
        && status.flowtable.as_ref().is_some_and(|ft| !ft.devices.is_empty()))
    .then(|| OffloadTarget {
        lan_set: &cfg.lan_set_name,
        flowtable: &cfg.flowtable_name,
    });
    let programs = compile_programs(
        &cfg.input_bypass_set_name,
        &cfg.forward_bypass_set_name,
        offload,
    );

    for (spec, program) in chain_specs(&cfg)
        .into_iter()
        .zip([&programs.input, &programs.forward, &programs.output])
    {
        let entity = || Entity::Chain(spec.name.clone());
        let info = backend
            .get_chain(table, &spec.name)
            .map_err(|e| Error::firewall("get chain", entity(), e))?;
        let installed = if info.is_some() {
            backend
                .list_rules(table, &spec.name)
                .map_err(|e| Error::firewall("list rules", entity(), e))?
        } else {
            Vec::new()
        };
        let foreign_rules = installed
            .iter()
            .filter(|r| r.userdata.as_deref().and_then(userdata_fingerprint).is_none())
            .map(|r| r.handle)
            .collect();
        status.chains.push(ChainStatus {
            present: info.is_some(),
            hook: info.as_ref().and_then(|i| i.hook).map(|h| h.to_string()),
            priority: info.and_then(|i| i.priority),
            rules: installed.len(),
            in_sync: program_installed(&installed, program),
            foreign_rules,
            name: spec.name,
        });
    }

    Ok(status)
}
