//! [`Backend`] over a real `NETLINK_NETFILTER` socket
//!
//! Every object lives in the `inet` family. Lookups are single-object GET
//! requests; rule and element listings are dumps filtered by table and chain
//! or set, so nothing outside the configured names is ever read.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use tracing::{debug, trace};

use super::attr::{
    Attr, NetlinkMessage, push_attr_be32, push_attr_bytes, push_attr_nested, push_attr_str,
};
use super::consts::{
    NF_ACCEPT, NFPROTO_INET, NFT_MSG_DELFLOWTABLE, NFT_MSG_DELRULE, NFT_MSG_DELSETELEM,
    NFT_MSG_DELTABLE, NFT_MSG_GETCHAIN, NFT_MSG_GETFLOWTABLE, NFT_MSG_GETRULE, NFT_MSG_GETSET,
    NFT_MSG_GETSETELEM, NFT_MSG_GETTABLE, NFT_MSG_NEWCHAIN, NFT_MSG_NEWFLOWTABLE,
    NFT_MSG_NEWRULE, NFT_MSG_NEWSET, NFT_MSG_NEWSETELEM, NFT_MSG_NEWTABLE, NFT_SET_ELEM_INTERVAL_END,
    NFT_SET_INTERVAL, NFTA_CHAIN_HANDLE, NFTA_CHAIN_HOOK, NFTA_CHAIN_NAME, NFTA_CHAIN_POLICY,
    NFTA_CHAIN_TABLE, NFTA_CHAIN_TYPE, NFTA_DATA_VALUE, NFTA_DEVICE_NAME, NFTA_FLOWTABLE_HOOK,
    NFTA_FLOWTABLE_HOOK_DEVS, NFTA_FLOWTABLE_HOOK_NUM, NFTA_FLOWTABLE_HOOK_PRIORITY,
    NFTA_FLOWTABLE_NAME, NFTA_FLOWTABLE_TABLE, NFTA_HOOK_HOOKNUM, NFTA_HOOK_PRIORITY,
    NFTA_LIST_ELEM, NFTA_RULE_CHAIN, NFTA_RULE_EXPRESSIONS, NFTA_RULE_HANDLE, NFTA_RULE_TABLE,
    NFTA_RULE_USERDATA, NFTA_SET_ELEM_FLAGS, NFTA_SET_ELEM_KEY, NFTA_SET_ELEM_LIST_ELEMENTS,
    NFTA_SET_ELEM_LIST_SET, NFTA_SET_ELEM_LIST_TABLE, NFTA_SET_FLAGS, NFTA_SET_HANDLE,
    NFTA_SET_ID, NFTA_SET_KEY_LEN, NFTA_SET_KEY_TYPE, NFTA_SET_NAME, NFTA_SET_TABLE,
    NFTA_TABLE_HANDLE, NFTA_TABLE_NAME, NLM_F_APPEND, NLM_F_CREATE,
};
use super::socket::{BatchMessage, NetfilterSocket};
use crate::core::backend::{
    Backend, ChainHook, ChainInfo, ChainSpec, FlowtableSpec, RuleInfo, SetInfo, SetSpec,
    TableInfo,
};
use crate::core::interval::SetElement;
use crate::core::rules::CompiledRule;

static SET_ID: AtomicU32 = AtomicU32::new(1);

fn find<'a>(attrs: &'a [Attr], attr_type: u16) -> Option<&'a Attr> {
    attrs.iter().find(|a| a.attr_type == attr_type)
}

fn table_attrs(table_attr: u16, table: &str, name_attr: u16, name: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    push_attr_str(&mut buf, table_attr, table);
    push_attr_str(&mut buf, name_attr, name);
    buf
}

fn encode_elements(buf: &mut Vec<u8>, table: &str, set: &str, elements: &[SetElement]) {
    push_attr_str(buf, NFTA_SET_ELEM_LIST_TABLE, table);
    push_attr_str(buf, NFTA_SET_ELEM_LIST_SET, set);
    push_attr_nested(buf, NFTA_SET_ELEM_LIST_ELEMENTS, |list| {
        for elem in elements {
            push_attr_nested(list, NFTA_LIST_ELEM, |e| {
                push_attr_nested(e, NFTA_SET_ELEM_KEY, |key| {
                    push_attr_bytes(key, NFTA_DATA_VALUE, &elem.key);
                });
                if elem.interval_end {
                    push_attr_be32(e, NFTA_SET_ELEM_FLAGS, NFT_SET_ELEM_INTERVAL_END);
                }
            });
        }
    });
}

fn decode_elements(msg: &NetlinkMessage) -> Vec<SetElement> {
    let attrs = msg.nft_attrs();
    let Some(list) = find(&attrs, NFTA_SET_ELEM_LIST_ELEMENTS) else {
        return Vec::new();
    };
    list.nested()
        .iter()
        .filter(|a| a.attr_type == NFTA_LIST_ELEM)
        .filter_map(|elem| {
            let fields = elem.nested();
            let key = find(&fields, NFTA_SET_ELEM_KEY)?.nested();
            let value = find(&key, NFTA_DATA_VALUE)?.payload.clone();
            let flags = find(&fields, NFTA_SET_ELEM_FLAGS)
                .and_then(Attr::as_be32)
                .unwrap_or(0);
            Some(SetElement {
                key: value,
                interval_end: flags & NFT_SET_ELEM_INTERVAL_END != 0,
            })
        })
        .collect()
}

fn decode_flowtable(name: &str, msg: &NetlinkMessage) -> FlowtableSpec {
    let attrs = msg.nft_attrs();
    let hook = find(&attrs, NFTA_FLOWTABLE_HOOK)
        .map(Attr::nested)
        .unwrap_or_default();
    let devices = find(&hook, NFTA_FLOWTABLE_HOOK_DEVS)
        .map(|devs| {
            devs.nested()
                .iter()
                .filter(|d| d.attr_type == NFTA_DEVICE_NAME)
                .map(Attr::as_string)
                .collect()
        })
        .unwrap_or_default();
    FlowtableSpec {
        name: name.to_string(),
        hooknum: find(&hook, NFTA_FLOWTABLE_HOOK_NUM)
            .and_then(Attr::as_be32)
            .unwrap_or(0),
        priority: find(&hook, NFTA_FLOWTABLE_HOOK_PRIORITY)
            .and_then(Attr::as_be32)
            .map_or(0, |p| p as i32),
        devices,
    }
}

/// Production backend. Queries run immediately; mutations accumulate until
/// [`Backend::flush`] sends them as one nfnetlink batch.
#[derive(Debug, Default)]
pub struct NetlinkBackend {
    queue: Vec<BatchMessage>,
}

impl NetlinkBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, msg_type: u16, flags: u16, attrs: Vec<u8>) {
        self.queue.push(BatchMessage {
            msg_type,
            flags,
            family: NFPROTO_INET,
            attrs,
        });
    }

    /// Single-object GET. `ENOENT` means the object does not exist.
    fn get_one(msg_type: u16, attrs: &[u8]) -> io::Result<Option<NetlinkMessage>> {
        let sock = NetfilterSocket::open()?;
        match sock.request(msg_type, NFPROTO_INET, false, attrs) {
            Ok(msgs) => Ok(msgs.into_iter().next()),
            Err(e) if e.raw_os_error() == Some(Errno::ENOENT as i32) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn dump(msg_type: u16, attrs: &[u8]) -> io::Result<Vec<NetlinkMessage>> {
        let sock = NetfilterSocket::open()?;
        match sock.request(msg_type, NFPROTO_INET, true, attrs) {
            Err(e) if e.raw_os_error() == Some(Errno::ENOENT as i32) => Ok(Vec::new()),
            other => other,
        }
    }
}

impl Backend for NetlinkBackend {
    fn get_table(&mut self, table: &str) -> io::Result<Option<TableInfo>> {
        let mut attrs = Vec::new();
        push_attr_str(&mut attrs, NFTA_TABLE_NAME, table);
        Ok(Self::get_one(NFT_MSG_GETTABLE, &attrs)?.map(|msg| {
            let attrs = msg.nft_attrs();
            TableInfo {
                name: table.to_string(),
                handle: find(&attrs, NFTA_TABLE_HANDLE)
                    .and_then(Attr::as_be64)
                    .unwrap_or(0),
            }
        }))
    }

    fn add_table(&mut self, table: &str) {
        let mut attrs = Vec::new();
        push_attr_str(&mut attrs, NFTA_TABLE_NAME, table);
        self.push(NFT_MSG_NEWTABLE, NLM_F_CREATE, attrs);
    }

    fn del_table(&mut self, table: &str) {
        let mut attrs = Vec::new();
        push_attr_str(&mut attrs, NFTA_TABLE_NAME, table);
        self.push(NFT_MSG_DELTABLE, 0, attrs);
    }

    fn get_chain(&mut self, table: &str, chain: &str) -> io::Result<Option<ChainInfo>> {
        let req = table_attrs(NFTA_CHAIN_TABLE, table, NFTA_CHAIN_NAME, chain);
        Ok(Self::get_one(NFT_MSG_GETCHAIN, &req)?.map(|msg| {
            let attrs = msg.nft_attrs();
            let hook = find(&attrs, NFTA_CHAIN_HOOK).map(Attr::nested);
            ChainInfo {
                name: chain.to_string(),
                handle: find(&attrs, NFTA_CHAIN_HANDLE)
                    .and_then(Attr::as_be64)
                    .unwrap_or(0),
                hook: hook
                    .as_deref()
                    .and_then(|h| find(h, NFTA_HOOK_HOOKNUM))
                    .and_then(Attr::as_be32)
                    .and_then(ChainHook::from_hooknum),
                priority: hook
                    .as_deref()
                    .and_then(|h| find(h, NFTA_HOOK_PRIORITY))
                    .and_then(Attr::as_be32)
                    .map(|p| p as i32),
            }
        }))
    }

    fn add_chain(&mut self, table: &str, spec: &ChainSpec) {
        let mut attrs = table_attrs(NFTA_CHAIN_TABLE, table, NFTA_CHAIN_NAME, &spec.name);
        push_attr_nested(&mut attrs, NFTA_CHAIN_HOOK, |hook| {
            push_attr_be32(hook, NFTA_HOOK_HOOKNUM, spec.hook.hooknum());
            push_attr_be32(hook, NFTA_HOOK_PRIORITY, spec.priority as u32);
        });
        push_attr_be32(&mut attrs, NFTA_CHAIN_POLICY, NF_ACCEPT);
        push_attr_str(&mut attrs, NFTA_CHAIN_TYPE, "filter");
        self.push(NFT_MSG_NEWCHAIN, NLM_F_CREATE, attrs);
    }

    fn flush_chain(&mut self, table: &str, chain: &str) {
        // DELRULE without a handle removes every rule of the chain.
        let attrs = table_attrs(NFTA_RULE_TABLE, table, NFTA_RULE_CHAIN, chain);
        self.push(NFT_MSG_DELRULE, 0, attrs);
    }

    fn add_rule(&mut self, table: &str, chain: &str, rule: &CompiledRule) {
        let mut attrs = table_attrs(NFTA_RULE_TABLE, table, NFTA_RULE_CHAIN, chain);
        let exprs = rule.encode();
        push_attr_nested(&mut attrs, NFTA_RULE_EXPRESSIONS, |buf| {
            buf.extend_from_slice(&exprs);
        });
        push_attr_bytes(&mut attrs, NFTA_RULE_USERDATA, &rule.userdata());
        self.push(NFT_MSG_NEWRULE, NLM_F_CREATE | NLM_F_APPEND, attrs);
    }

    fn list_rules(&mut self, table: &str, chain: &str) -> io::Result<Vec<RuleInfo>> {
        let req = table_attrs(NFTA_RULE_TABLE, table, NFTA_RULE_CHAIN, chain);
        let rules = Self::dump(NFT_MSG_GETRULE, &req)?
            .iter()
            .map(|msg| {
                let attrs = msg.nft_attrs();
                RuleInfo {
                    handle: find(&attrs, NFTA_RULE_HANDLE)
                        .and_then(Attr::as_be64)
                        .unwrap_or(0),
                    userdata: find(&attrs, NFTA_RULE_USERDATA).map(|a| a.payload.clone()),
                }
            })
            .collect();
        Ok(rules)
    }

    fn get_flowtable(&mut self, table: &str, name: &str) -> io::Result<Option<FlowtableSpec>> {
        let req = table_attrs(NFTA_FLOWTABLE_TABLE, table, NFTA_FLOWTABLE_NAME, name);
        Ok(Self::get_one(NFT_MSG_GETFLOWTABLE, &req)?
            .map(|msg| decode_flowtable(name, &msg)))
    }

    fn add_flowtable(&mut self, table: &str, spec: &FlowtableSpec) {
        let mut attrs = table_attrs(NFTA_FLOWTABLE_TABLE, table, NFTA_FLOWTABLE_NAME, &spec.name);
        push_attr_nested(&mut attrs, NFTA_FLOWTABLE_HOOK, |hook| {
            push_attr_be32(hook, NFTA_FLOWTABLE_HOOK_NUM, spec.hooknum);
            push_attr_be32(hook, NFTA_FLOWTABLE_HOOK_PRIORITY, spec.priority as u32);
            // The kernel rejects an empty device list; omit it instead.
            if !spec.devices.is_empty() {
                push_attr_nested(hook, NFTA_FLOWTABLE_HOOK_DEVS, |devs| {
                    for dev in &spec.devices {
                        push_attr_str(devs, NFTA_DEVICE_NAME, dev);
                    }
                });
            }
        });
        self.push(NFT_MSG_NEWFLOWTABLE, NLM_F_CREATE, attrs);
    }

    fn del_flowtable(&mut self, table: &str, name: &str) {
        let attrs = table_attrs(NFTA_FLOWTABLE_TABLE, table, NFTA_FLOWTABLE_NAME, name);
        self.push(NFT_MSG_DELFLOWTABLE, 0, attrs);
    }

    fn get_set(&mut self, table: &str, name: &str) -> io::Result<Option<SetInfo>> {
        let req = table_attrs(NFTA_SET_TABLE, table, NFTA_SET_NAME, name);
        Ok(Self::get_one(NFT_MSG_GETSET, &req)?.map(|msg| {
            let attrs = msg.nft_attrs();
            let be32 = |t| find(&attrs, t).and_then(Attr::as_be32).unwrap_or(0);
            SetInfo {
                name: name.to_string(),
                handle: find(&attrs, NFTA_SET_HANDLE)
                    .and_then(Attr::as_be64)
                    .unwrap_or(0),
                key_type: be32(NFTA_SET_KEY_TYPE),
                key_len: be32(NFTA_SET_KEY_LEN),
                flags: be32(NFTA_SET_FLAGS),
            }
        }))
    }

    fn add_set(&mut self, table: &str, spec: &SetSpec) {
        let mut attrs = table_attrs(NFTA_SET_TABLE, table, NFTA_SET_NAME, &spec.name);
        let flags = if spec.interval { NFT_SET_INTERVAL } else { 0 };
        push_attr_be32(&mut attrs, NFTA_SET_FLAGS, flags);
        push_attr_be32(&mut attrs, NFTA_SET_KEY_TYPE, spec.key_type.type_id());
        push_attr_be32(&mut attrs, NFTA_SET_KEY_LEN, spec.key_type.key_len());
        push_attr_be32(&mut attrs, NFTA_SET_ID, SET_ID.fetch_add(1, Ordering::Relaxed));
        self.push(NFT_MSG_NEWSET, NLM_F_CREATE, attrs);
    }

    fn add_set_elements(&mut self, table: &str, set: &str, elements: &[SetElement]) {
        let mut attrs = Vec::new();
        encode_elements(&mut attrs, table, set, elements);
        self.push(NFT_MSG_NEWSETELEM, NLM_F_CREATE, attrs);
    }

    fn del_set_elements(&mut self, table: &str, set: &str, elements: &[SetElement]) {
        let mut attrs = Vec::new();
        encode_elements(&mut attrs, table, set, elements);
        self.push(NFT_MSG_DELSETELEM, 0, attrs);
    }

    fn get_set_elements(&mut self, table: &str, set: &str) -> io::Result<Vec<SetElement>> {
        let req = table_attrs(NFTA_SET_ELEM_LIST_TABLE, table, NFTA_SET_ELEM_LIST_SET, set);
        Ok(Self::dump(NFT_MSG_GETSETELEM, &req)?
            .iter()
            .flat_map(decode_elements)
            .collect())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.queue.is_empty() {
            trace!("nothing queued, skipping commit");
            return Ok(());
        }
        let batch = std::mem::take(&mut self.queue);
        debug!("Committing nftables batch with {} messages", batch.len());
        NetfilterSocket::open()?.commit(&batch)
    }
}
