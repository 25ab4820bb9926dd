//! Kernel-facing seam of the reconciliation engine
//!
//! [`Backend`] lists the nf_tables operations the engine consumes. Queries go
//! to the kernel immediately; mutations are queued and applied atomically by
//! [`Backend::flush`]. Every call addresses one object by name so the engine
//! never observes objects it does not own.

use std::io;

use strum::{AsRefStr, Display};

use crate::core::interval::{IFNAME_KEY_LEN, SetElement};
use crate::core::rules::CompiledRule;
use crate::netlink::consts::NFT_SET_INTERVAL;

/// Netfilter hooks the three base chains attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ChainHook {
    Input,
    Forward,
    Output,
}

impl ChainHook {
    pub fn hooknum(self) -> u32 {
        match self {
            ChainHook::Input => 1,
            ChainHook::Forward => 2,
            ChainHook::Output => 3,
        }
    }

    pub fn from_hooknum(num: u32) -> Option<Self> {
        match num {
            1 => Some(ChainHook::Input),
            2 => Some(ChainHook::Forward),
            3 => Some(ChainHook::Output),
            _ => None,
        }
    }
}

/// Base chain to create: filter type, accept policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    pub name: String,
    pub hook: ChainHook,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainInfo {
    pub name: String,
    pub handle: u64,
    /// `None` for regular (non-base) chains.
    pub hook: Option<ChainHook>,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub handle: u64,
}

/// One installed rule as read back from the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInfo {
    pub handle: u64,
    pub userdata: Option<Vec<u8>>,
}

/// Desired or observed flowtable hook tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowtableSpec {
    pub name: String,
    pub hooknum: u32,
    pub priority: i32,
    pub devices: Vec<String>,
}

impl FlowtableSpec {
    /// Compares `(hooknum, priority, devices)` ignoring device order.
    pub fn same_hook(&self, other: &FlowtableSpec) -> bool {
        let mut a = self.devices.clone();
        let mut b = other.devices.clone();
        a.sort();
        b.sort();
        self.hooknum == other.hooknum && self.priority == other.priority && a == b
    }
}

/// Set key datatypes as numbered by the nft userspace (`nft_datatypes`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum KeyType {
    #[strum(serialize = "ipv4_addr")]
    Ipv4Addr,
    #[strum(serialize = "ifname")]
    IfName,
}

impl KeyType {
    pub fn type_id(self) -> u32 {
        match self {
            KeyType::Ipv4Addr => 7,
            KeyType::IfName => 41,
        }
    }

    pub fn key_len(self) -> u32 {
        match self {
            KeyType::Ipv4Addr => 4,
            KeyType::IfName => IFNAME_KEY_LEN as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetSpec {
    pub name: String,
    pub key_type: KeyType,
    pub interval: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetInfo {
    pub name: String,
    pub handle: u64,
    pub key_type: u32,
    pub key_len: u32,
    pub flags: u32,
}

impl SetInfo {
    pub fn is_interval(&self) -> bool {
        self.flags & NFT_SET_INTERVAL != 0
    }
}

/// nf_tables operations against one `inet` table.
///
/// Lookups return `Ok(None)` when the kernel reports the object missing.
/// Mutating methods only queue work; nothing reaches the kernel until
/// [`Backend::flush`] commits the queue as one batch. `flush` with an empty
/// queue is a no-op.
pub trait Backend {
    fn get_table(&mut self, table: &str) -> io::Result<Option<TableInfo>>;
    fn add_table(&mut self, table: &str);
    fn del_table(&mut self, table: &str);

    fn get_chain(&mut self, table: &str, chain: &str) -> io::Result<Option<ChainInfo>>;
    fn add_chain(&mut self, table: &str, spec: &ChainSpec);
    fn flush_chain(&mut self, table: &str, chain: &str);
    fn add_rule(&mut self, table: &str, chain: &str, rule: &CompiledRule);
    fn list_rules(&mut self, table: &str, chain: &str) -> io::Result<Vec<RuleInfo>>;

    fn get_flowtable(&mut self, table: &str, name: &str) -> io::Result<Option<FlowtableSpec>>;
    fn add_flowtable(&mut self, table: &str, spec: &FlowtableSpec);
    fn del_flowtable(&mut self, table: &str, name: &str);

    fn get_set(&mut self, table: &str, name: &str) -> io::Result<Option<SetInfo>>;
    fn add_set(&mut self, table: &str, spec: &SetSpec);
    fn add_set_elements(&mut self, table: &str, set: &str, elements: &[SetElement]);
    fn del_set_elements(&mut self, table: &str, set: &str, elements: &[SetElement]);
    fn get_set_elements(&mut self, table: &str, set: &str) -> io::Result<Vec<SetElement>>;

    /// Commits every queued mutation in one transaction.
    fn flush(&mut self) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_hook_numbers() {
        for hook in [ChainHook::Input, ChainHook::Forward, ChainHook::Output] {
            assert_eq!(ChainHook::from_hooknum(hook.hooknum()), Some(hook));
        }
        assert_eq!(ChainHook::from_hooknum(0), None);
        assert_eq!(ChainHook::Forward.to_string(), "forward");
    }

    #[test]
    fn test_key_types() {
        assert_eq!(KeyType::Ipv4Addr.type_id(), 7);
        assert_eq!(KeyType::Ipv4Addr.key_len(), 4);
        assert_eq!(KeyType::IfName.type_id(), 41);
        assert_eq!(KeyType::IfName.key_len(), 16);
        assert_eq!(KeyType::IfName.as_ref(), "ifname");
        assert_eq!(KeyType::Ipv4Addr.as_ref(), "ipv4_addr");
    }

    #[test]
    fn test_set_interval_flag() {
        let mut set = SetInfo {
            name: "gwd_lan_cidrs".into(),
            handle: 3,
            key_type: KeyType::Ipv4Addr.type_id(),
            key_len: 4,
            flags: NFT_SET_INTERVAL,
        };
        assert!(set.is_interval());
        set.flags = 0x8;
        assert!(!set.is_interval());
    }

    #[test]
    fn test_flowtable_comparison_ignores_device_order() {
        let a = FlowtableSpec {
            name: "gwd_ft".into(),
            hooknum: 0,
            priority: -300,
            devices: vec!["eth1".into(), "eth0".into()],
        };
        let mut b = a.clone();
        b.devices.reverse();
        assert!(a.same_hook(&b));

        b.priority = 0;
        assert!(!a.same_hook(&b));
    }
}
