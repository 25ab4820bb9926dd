//! Shared test utilities for core module tests
//!
//! [`FakeKernel`] is an in-memory nf_tables that applies queued mutations
//! atomically on flush and records every committed transaction, so tests can
//! assert both the resulting state and how many transactions it took.
//! [`FakeHost`] stands in for sysfs and `getifaddrs`.
//!
//! This module is only compiled in test mode.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::Ipv4Addr;

use nix::errno::Errno;

use crate::config::Config;
use crate::core::backend::{
    Backend, ChainHook, ChainInfo, ChainSpec, FlowtableSpec, RuleInfo, SetInfo, SetSpec,
    TableInfo,
};
use crate::core::devices::{HostInventory, InterfaceAddr};
use crate::core::error::Result;
use crate::core::expr::Expr;
use crate::core::interval::SetElement;
use crate::core::rules::CompiledRule;
use crate::netlink::consts::NFT_SET_INTERVAL;

/// One queued mutation, as recorded in [`FakeKernel::transactions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddTable(String),
    DelTable(String),
    AddChain(String),
    FlushChain(String),
    AddRule { chain: String, label: &'static str },
    AddFlowtable(FlowtableSpec),
    DelFlowtable(String),
    AddSet(String),
    AddElements { set: String, elements: Vec<SetElement> },
    DelElements { set: String, elements: Vec<SetElement> },
}

impl Op {
    pub fn touches_set(&self) -> bool {
        matches!(
            self,
            Op::AddSet(_) | Op::AddElements { .. } | Op::DelElements { .. }
        )
    }

    pub fn touches_rules(&self) -> bool {
        matches!(self, Op::FlushChain(_) | Op::AddRule { .. })
    }
}

#[derive(Debug, Clone)]
enum Pending {
    AddTable(String),
    DelTable(String),
    AddChain(String, ChainSpec),
    FlushChain(String, String),
    AddRule(String, String, CompiledRule),
    AddFlowtable(String, FlowtableSpec),
    DelFlowtable(String, String),
    AddSet(String, SetSpec),
    AddElements(String, String, Vec<SetElement>),
    DelElements(String, String, Vec<SetElement>),
}

#[derive(Debug, Clone)]
pub struct FakeRule {
    pub handle: u64,
    pub rule: CompiledRule,
    /// `None` for rules installed by someone else.
    pub userdata: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct FakeChain {
    pub spec: ChainSpec,
    pub handle: u64,
    pub rules: Vec<FakeRule>,
}

#[derive(Debug, Clone)]
pub struct FakeSet {
    pub info: SetInfo,
    pub elements: Vec<SetElement>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeTable {
    pub handle: u64,
    pub chains: BTreeMap<String, FakeChain>,
    pub sets: BTreeMap<String, FakeSet>,
    pub flowtables: BTreeMap<String, FlowtableSpec>,
}

fn enoent() -> io::Error {
    io::Error::from_raw_os_error(Errno::ENOENT as i32)
}

/// In-memory nf_tables with transaction recording.
#[derive(Debug, Default)]
pub struct FakeKernel {
    pub tables: BTreeMap<String, FakeTable>,
    /// Every committed transaction, oldest first.
    pub transactions: Vec<Vec<Op>>,
    /// Every object name passed to any backend call.
    pub names_seen: BTreeSet<String>,
    /// Errno returned by the next non-empty flush, which then commits nothing.
    pub fail_next_flush: Option<i32>,
    queue: Vec<Pending>,
    next_handle: u64,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn seen(&mut self, names: &[&str]) {
        for n in names {
            self.names_seen.insert((*n).to_string());
        }
    }

    pub fn table(&self, name: &str) -> Option<&FakeTable> {
        self.tables.get(name)
    }

    pub fn chain(&self, table: &str, chain: &str) -> Option<&FakeChain> {
        self.tables.get(table)?.chains.get(chain)
    }

    /// Labels of the rules in `chain`, in order.
    pub fn rule_labels(&self, table: &str, chain: &str) -> Vec<&'static str> {
        self.chain(table, chain)
            .map(|c| c.rules.iter().map(|r| r.rule.label).collect())
            .unwrap_or_default()
    }

    pub fn set_elements(&self, table: &str, set: &str) -> Vec<SetElement> {
        let mut elems = self
            .tables
            .get(table)
            .and_then(|t| t.sets.get(set))
            .map(|s| s.elements.clone())
            .unwrap_or_default();
        elems.sort();
        elems
    }

    pub fn flowtable(&self, table: &str, name: &str) -> Option<&FlowtableSpec> {
        self.tables.get(table)?.flowtables.get(name)
    }

    /// Replaces a flowtable's device list behind the engine's back.
    pub fn set_flowtable_devices(&mut self, table: &str, name: &str, devices: &[&str]) {
        if let Some(ft) = self
            .tables
            .get_mut(table)
            .and_then(|t| t.flowtables.get_mut(name))
        {
            ft.devices = devices.iter().map(|d| (*d).to_string()).collect();
        }
    }

    /// Installs an object the engine does not own, e.g. another daemon's table.
    pub fn add_foreign_table(&mut self, name: &str) {
        let handle = self.handle();
        self.tables.insert(
            name.to_string(),
            FakeTable {
                handle,
                ..FakeTable::default()
            },
        );
    }

    /// Appends a rule without our userdata to an existing chain and returns
    /// its handle.
    pub fn append_foreign_rule(&mut self, table: &str, chain: &str) -> u64 {
        let handle = self.handle();
        if let Some(c) = self
            .tables
            .get_mut(table)
            .and_then(|t| t.chains.get_mut(chain))
        {
            c.rules.push(FakeRule {
                handle,
                rule: CompiledRule {
                    label: "foreign",
                    expressions: Vec::new(),
                },
                userdata: None,
            });
        }
        handle
    }

    pub fn mutation_count(&self) -> usize {
        self.transactions.iter().map(Vec::len).sum()
    }

    fn apply(&mut self, tables: &mut BTreeMap<String, FakeTable>, op: Pending) -> io::Result<Op> {
        match op {
            Pending::AddTable(name) => {
                if !tables.contains_key(&name) {
                    let handle = self.handle();
                    tables.insert(
                        name.clone(),
                        FakeTable {
                            handle,
                            ..FakeTable::default()
                        },
                    );
                }
                Ok(Op::AddTable(name))
            }
            Pending::DelTable(name) => {
                tables.remove(&name).ok_or_else(enoent)?;
                Ok(Op::DelTable(name))
            }
            Pending::AddChain(table, spec) => {
                let handle = self.handle();
                let t = tables.get_mut(&table).ok_or_else(enoent)?;
                t.chains.entry(spec.name.clone()).or_insert(FakeChain {
                    spec: spec.clone(),
                    handle,
                    rules: Vec::new(),
                });
                Ok(Op::AddChain(spec.name))
            }
            Pending::FlushChain(table, chain) => {
                let t = tables.get_mut(&table).ok_or_else(enoent)?;
                t.chains.get_mut(&chain).ok_or_else(enoent)?.rules.clear();
                Ok(Op::FlushChain(chain))
            }
            Pending::AddRule(table, chain, rule) => {
                let handle = self.handle();
                let t = tables.get_mut(&table).ok_or_else(enoent)?;
                for expr in &rule.expressions {
                    match expr {
                        Expr::Lookup { set, .. } if !t.sets.contains_key(set) => {
                            return Err(enoent());
                        }
                        Expr::FlowOffload { flowtable } if !t.flowtables.contains_key(flowtable) => {
                            return Err(enoent());
                        }
                        _ => {}
                    }
                }
                let userdata = Some(rule.userdata());
                let label = rule.label;
                t.chains.get_mut(&chain).ok_or_else(enoent)?.rules.push(FakeRule {
                    handle,
                    rule,
                    userdata,
                });
                Ok(Op::AddRule { chain, label })
            }
            Pending::AddFlowtable(table, spec) => {
                let t = tables.get_mut(&table).ok_or_else(enoent)?;
                t.flowtables.insert(spec.name.clone(), spec.clone());
                Ok(Op::AddFlowtable(spec))
            }
            Pending::DelFlowtable(table, name) => {
                let t = tables.get_mut(&table).ok_or_else(enoent)?;
                let pinned = t.chains.values().flat_map(|c| &c.rules).any(|r| {
                    r.rule.expressions.iter().any(
                        |e| matches!(e, Expr::FlowOffload { flowtable } if *flowtable == name),
                    )
                });
                if pinned {
                    return Err(io::Error::from_raw_os_error(Errno::EBUSY as i32));
                }
                t.flowtables.remove(&name).ok_or_else(enoent)?;
                Ok(Op::DelFlowtable(name))
            }
            Pending::AddSet(table, spec) => {
                let handle = self.handle();
                let t = tables.get_mut(&table).ok_or_else(enoent)?;
                t.sets.entry(spec.name.clone()).or_insert(FakeSet {
                    info: SetInfo {
                        name: spec.name.clone(),
                        handle,
                        key_type: spec.key_type.type_id(),
                        key_len: spec.key_type.key_len(),
                        flags: if spec.interval { NFT_SET_INTERVAL } else { 0 },
                    },
                    elements: Vec::new(),
                });
                Ok(Op::AddSet(spec.name))
            }
            Pending::AddElements(table, set, elements) => {
                let t = tables.get_mut(&table).ok_or_else(enoent)?;
                let s = t.sets.get_mut(&set).ok_or_else(enoent)?;
                for e in &elements {
                    if !s.elements.contains(e) {
                        s.elements.push(e.clone());
                    }
                }
                Ok(Op::AddElements { set, elements })
            }
            Pending::DelElements(table, set, elements) => {
                let t = tables.get_mut(&table).ok_or_else(enoent)?;
                let s = t.sets.get_mut(&set).ok_or_else(enoent)?;
                for e in &elements {
                    let pos = s.elements.iter().position(|x| x == e).ok_or_else(enoent)?;
                    s.elements.remove(pos);
                }
                Ok(Op::DelElements { set, elements })
            }
        }
    }
}

impl Backend for FakeKernel {
    fn get_table(&mut self, table: &str) -> io::Result<Option<TableInfo>> {
        self.seen(&[table]);
        Ok(self.tables.get(table).map(|t| TableInfo {
            name: table.to_string(),
            handle: t.handle,
        }))
    }

    fn add_table(&mut self, table: &str) {
        self.seen(&[table]);
        self.queue.push(Pending::AddTable(table.to_string()));
    }

    fn del_table(&mut self, table: &str) {
        self.seen(&[table]);
        self.queue.push(Pending::DelTable(table.to_string()));
    }

    fn get_chain(&mut self, table: &str, chain: &str) -> io::Result<Option<ChainInfo>> {
        self.seen(&[table, chain]);
        Ok(self.chain(table, chain).map(|c| ChainInfo {
            name: chain.to_string(),
            handle: c.handle,
            hook: Some(c.spec.hook),
            priority: Some(c.spec.priority),
        }))
    }

    fn add_chain(&mut self, table: &str, spec: &ChainSpec) {
        self.seen(&[table, &spec.name]);
        self.queue
            .push(Pending::AddChain(table.to_string(), spec.clone()));
    }

    fn flush_chain(&mut self, table: &str, chain: &str) {
        self.seen(&[table, chain]);
        self.queue
            .push(Pending::FlushChain(table.to_string(), chain.to_string()));
    }

    fn add_rule(&mut self, table: &str, chain: &str, rule: &CompiledRule) {
        self.seen(&[table, chain]);
        self.queue.push(Pending::AddRule(
            table.to_string(),
            chain.to_string(),
            rule.clone(),
        ));
    }

    fn list_rules(&mut self, table: &str, chain: &str) -> io::Result<Vec<RuleInfo>> {
        self.seen(&[table, chain]);
        Ok(self
            .chain(table, chain)
            .map(|c| {
                c.rules
                    .iter()
                    .map(|r| RuleInfo {
                        handle: r.handle,
                        userdata: r.userdata.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_flowtable(&mut self, table: &str, name: &str) -> io::Result<Option<FlowtableSpec>> {
        self.seen(&[table, name]);
        Ok(self.flowtable(table, name).cloned())
    }

    fn add_flowtable(&mut self, table: &str, spec: &FlowtableSpec) {
        self.seen(&[table, &spec.name]);
        self.queue
            .push(Pending::AddFlowtable(table.to_string(), spec.clone()));
    }

    fn del_flowtable(&mut self, table: &str, name: &str) {
        self.seen(&[table, name]);
        self.queue
            .push(Pending::DelFlowtable(table.to_string(), name.to_string()));
    }

    fn get_set(&mut self, table: &str, name: &str) -> io::Result<Option<SetInfo>> {
        self.seen(&[table, name]);
        Ok(self
            .tables
            .get(table)
            .and_then(|t| t.sets.get(name))
            .map(|s| s.info.clone()))
    }

    fn add_set(&mut self, table: &str, spec: &SetSpec) {
        self.seen(&[table, &spec.name]);
        self.queue
            .push(Pending::AddSet(table.to_string(), spec.clone()));
    }

    fn add_set_elements(&mut self, table: &str, set: &str, elements: &[SetElement]) {
        self.seen(&[table, set]);
        self.queue.push(Pending::AddElements(
            table.to_string(),
            set.to_string(),
            elements.to_vec(),
        ));
    }

    fn del_set_elements(&mut self, table: &str, set: &str, elements: &[SetElement]) {
        self.seen(&[table, set]);
        self.queue.push(Pending::DelElements(
            table.to_string(),
            set.to_string(),
            elements.to_vec(),
        ));
    }

    /// Returns elements in reverse insertion order, like an unsorted dump.
    fn get_set_elements(&mut self, table: &str, set: &str) -> io::Result<Vec<SetElement>> {
        self.seen(&[table, set]);
        let s = self
            .tables
            .get(table)
            .and_then(|t| t.sets.get(set))
            .ok_or_else(enoent)?;
        Ok(s.elements.iter().rev().cloned().collect())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let queue = std::mem::take(&mut self.queue);
        if let Some(errno) = self.fail_next_flush.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let mut tables = self.tables.clone();
        let mut ops = Vec::with_capacity(queue.len());
        for pending in queue {
            ops.push(self.apply(&mut tables, pending)?);
        }
        self.tables = tables;
        self.transactions.push(ops);
        Ok(())
    }
}

/// Host with a fixed device listing and address table.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    pub devices: Vec<String>,
    pub addrs: Vec<InterfaceAddr>,
}

impl FakeHost {
    pub fn new(devices: &[&str]) -> Self {
        let mut devices: Vec<String> = devices.iter().map(|d| (*d).to_string()).collect();
        devices.push("lo".to_string());
        Self {
            devices,
            addrs: vec![InterfaceAddr {
                name: "lo".to_string(),
                addr: Ipv4Addr::LOCALHOST,
                prefix: 8,
                up: true,
                loopback: true,
            }],
        }
    }

    pub fn with_addr(mut self, name: &str, addr: [u8; 4], prefix: u8) -> Self {
        self.addrs.push(InterfaceAddr {
            name: name.to_string(),
            addr: Ipv4Addr::from(addr),
            prefix,
            up: true,
            loopback: false,
        });
        self
    }
}

impl HostInventory for FakeHost {
    fn list_devices(&self) -> Result<Vec<String>> {
        Ok(self.devices.clone())
    }

    fn ipv4_addrs(&self) -> Result<Vec<InterfaceAddr>> {
        Ok(self.addrs.clone())
    }
}

/// `eth0` on 192.168.1.10/24 and `eth1` on 10.0.0.5/8, both up.
pub fn two_nic_host() -> FakeHost {
    FakeHost::new(&["eth0", "eth1"])
        .with_addr("eth0", [192, 168, 1, 10], 24)
        .with_addr("eth1", [10, 0, 0, 5], 8)
}

/// Every object name `cfg` allows the engine to touch.
pub fn owned_names(cfg: &Config) -> BTreeSet<String> {
    [
        &cfg.table_name,
        &cfg.flowtable_name,
        &cfg.lan_set_name,
        &cfg.input_chain_name,
        &cfg.forward_chain_name,
        &cfg.output_chain_name,
        &cfg.input_bypass_set_name,
        &cfg.forward_bypass_set_name,
    ]
    .into_iter()
    .cloned()
    .collect()
}

/// Chain hook as recorded by the fake, for assertions.
pub fn chain_hook(kernel: &FakeKernel, table: &str, chain: &str) -> Option<ChainHook> {
    kernel.chain(table, chain).map(|c| c.spec.hook)
}
