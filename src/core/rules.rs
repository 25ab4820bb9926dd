//! Rule program compiler
//!
//! Produces the fixed program installed in the three base chains:
//!
//! - `input`: bypass rule, six sanity drops
//! - `forward`: bypass rule, six sanity drops, two flow-offload rules when
//!   offloading is possible
//! - `output`: empty
//!
//! Only register 1 is used. Conntrack masks are 4-byte native-endian since the
//! VM compares registers in host order; packet bytes are compared as they
//! appear on the wire.

use sha2::{Digest, Sha256};

use crate::core::expr::{CmpOp, CtKey, Expr, MetaKey, PayloadBase, Register, Verdict};
use crate::netlink::consts::{NFPROTO_IPV4, NFTNL_UDATA_RULE_COMMENT};

/// Conntrack state bits (`NF_CT_STATE_*_BIT`).
pub const CT_STATE_INVALID: u32 = 1;
pub const CT_STATE_NEW: u32 = 1 << 3;

pub const IPPROTO_TCP: u8 = 6;

/// Offset of the flags byte in the TCP header.
const TCP_FLAGS_OFFSET: u32 = 13;
const IPV4_SADDR_OFFSET: u32 = 12;
const IPV4_DADDR_OFFSET: u32 = 16;

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_PSH: u8 = 0x08;
const TCP_ACK: u8 = 0x10;
const TCP_URG: u8 = 0x20;

/// Prefix of the userdata comment that marks a rule as ours.
pub const FINGERPRINT_PREFIX: &str = "gwd:";

/// A rule ready to be appended to a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub label: &'static str,
    pub expressions: Vec<Expr>,
}

impl CompiledRule {
    fn new(label: &'static str, expressions: Vec<Expr>) -> Self {
        Self { label, expressions }
    }

    /// Payload of `NFTA_RULE_EXPRESSIONS`.
    pub fn encode(&self) -> Vec<u8> {
        crate::core::expr::encode_expressions(&self.expressions)
    }

    /// `gwd:` followed by the first 128 bits of SHA-256 over the encoded
    /// expressions, in hex.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.encode());
        let digest = format!("{:x}", hasher.finalize());
        format!("{FINGERPRINT_PREFIX}{}", &digest[..32])
    }

    /// `NFTA_RULE_USERDATA` blob: one libnftnl comment TLV.
    pub fn userdata(&self) -> Vec<u8> {
        let comment = self.fingerprint();
        let mut out = Vec::with_capacity(comment.len() + 3);
        out.push(NFTNL_UDATA_RULE_COMMENT);
        out.push((comment.len() + 1) as u8);
        out.extend_from_slice(comment.as_bytes());
        out.push(0);
        out
    }
}

/// Extracts our fingerprint from a rule's userdata, if it carries one.
pub fn userdata_fingerprint(userdata: &[u8]) -> Option<String> {
    let mut rest = userdata;
    while rest.len() >= 2 {
        let (kind, len) = (rest[0], usize::from(rest[1]));
        let value = rest.get(2..2 + len)?;
        if kind == NFTNL_UDATA_RULE_COMMENT {
            let end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
            let comment = std::str::from_utf8(&value[..end]).ok()?;
            return comment
                .starts_with(FINGERPRINT_PREFIX)
                .then(|| comment.to_string());
        }
        rest = &rest[2 + len..];
    }
    None
}

fn ct_state_masked(mask: u32) -> [Expr; 2] {
    [
        Expr::Ct {
            key: CtKey::State,
            dreg: Register::R1,
        },
        Expr::Bitwise {
            sreg: Register::R1,
            dreg: Register::R1,
            mask: mask.to_ne_bytes().to_vec(),
            xor: 0u32.to_ne_bytes().to_vec(),
        },
    ]
}

fn l4proto_is(proto: u8) -> [Expr; 2] {
    [
        Expr::Meta {
            key: MetaKey::L4Proto,
            dreg: Register::R1,
        },
        Expr::Cmp {
            sreg: Register::R1,
            op: CmpOp::Eq,
            data: vec![proto],
        },
    ]
}

fn tcp_flags_masked(mask: u8) -> [Expr; 2] {
    [
        Expr::Payload {
            base: PayloadBase::Transport,
            offset: TCP_FLAGS_OFFSET,
            len: 1,
            dreg: Register::R1,
        },
        Expr::Bitwise {
            sreg: Register::R1,
            dreg: Register::R1,
            mask: vec![mask],
            xor: vec![0],
        },
    ]
}

fn cmp(op: CmpOp, data: Vec<u8>) -> Expr {
    Expr::Cmp {
        sreg: Register::R1,
        op,
        data,
    }
}

/// Accepts packets arriving on an interface listed in `bypass_set`.
pub fn bypass_rule(bypass_set: &str) -> CompiledRule {
    CompiledRule::new(
        "bypass",
        vec![
            Expr::Meta {
                key: MetaKey::IifName,
                dreg: Register::R1,
            },
            Expr::Lookup {
                set: bypass_set.to_string(),
                sreg: Register::R1,
            },
            Expr::Immediate(Verdict::Accept),
        ],
    )
}

fn tcp_flag_drop(label: &'static str, mask: u8, value: u8) -> CompiledRule {
    let mut exprs = Vec::with_capacity(6);
    exprs.extend(l4proto_is(IPPROTO_TCP));
    exprs.extend(tcp_flags_masked(mask));
    exprs.push(cmp(CmpOp::Eq, vec![value]));
    exprs.push(Expr::Immediate(Verdict::Drop));
    CompiledRule::new(label, exprs)
}

/// The six drops shared by the input and forward chains, in order.
pub fn sanity_drop_rules() -> Vec<CompiledRule> {
    let mut invalid = Vec::with_capacity(4);
    invalid.extend(ct_state_masked(CT_STATE_INVALID));
    invalid.push(cmp(CmpOp::Neq, 0u32.to_ne_bytes().to_vec()));
    invalid.push(Expr::Immediate(Verdict::Drop));

    let mut new_without_syn = Vec::with_capacity(9);
    new_without_syn.extend(l4proto_is(IPPROTO_TCP));
    new_without_syn.extend(ct_state_masked(CT_STATE_NEW));
    new_without_syn.push(cmp(CmpOp::Neq, 0u32.to_ne_bytes().to_vec()));
    new_without_syn.extend(tcp_flags_masked(TCP_SYN));
    new_without_syn.push(cmp(CmpOp::Neq, vec![TCP_SYN]));
    new_without_syn.push(Expr::Immediate(Verdict::Drop));

    vec![
        CompiledRule::new("drop ct invalid", invalid),
        CompiledRule::new("drop new without syn", new_without_syn),
        tcp_flag_drop("drop fin+syn", TCP_FIN | TCP_SYN, TCP_FIN | TCP_SYN),
        tcp_flag_drop("drop syn+rst", TCP_SYN | TCP_RST, TCP_SYN | TCP_RST),
        tcp_flag_drop(
            "drop null scan",
            TCP_FIN | TCP_SYN | TCP_RST | TCP_PSH | TCP_ACK | TCP_URG,
            0,
        ),
        tcp_flag_drop(
            "drop xmas scan",
            TCP_FIN | TCP_PSH | TCP_URG,
            TCP_FIN | TCP_PSH | TCP_URG,
        ),
    ]
}

/// Offloads IPv4 flows whose source, then destination, is in `lan_set`.
pub fn flow_offload_rules(lan_set: &str, flowtable: &str) -> Vec<CompiledRule> {
    [
        ("offload lan source", IPV4_SADDR_OFFSET),
        ("offload lan destination", IPV4_DADDR_OFFSET),
    ]
    .into_iter()
    .map(|(label, offset)| {
        CompiledRule::new(
            label,
            vec![
                Expr::Meta {
                    key: MetaKey::NfProto,
                    dreg: Register::R1,
                },
                cmp(CmpOp::Eq, vec![NFPROTO_IPV4]),
                Expr::Payload {
                    base: PayloadBase::Network,
                    offset,
                    len: 4,
                    dreg: Register::R1,
                },
                Expr::Lookup {
                    set: lan_set.to_string(),
                    sreg: Register::R1,
                },
                Expr::FlowOffload {
                    flowtable: flowtable.to_string(),
                },
            ],
        )
    })
    .collect()
}

/// Where forwarded LAN traffic is offloaded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffloadTarget<'a> {
    pub lan_set: &'a str,
    pub flowtable: &'a str,
}

/// Rules for the three base chains, in installation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPrograms {
    pub input: Vec<CompiledRule>,
    pub forward: Vec<CompiledRule>,
    pub output: Vec<CompiledRule>,
}

/// Compiles the whole program. `offload` is `None` when there are no flow
/// devices or the LAN set has no kernel handle yet.
pub fn compile_programs(
    input_bypass_set: &str,
    forward_bypass_set: &str,
    offload: Option<OffloadTarget<'_>>,
) -> ChainPrograms {
    let mut input = vec![bypass_rule(input_bypass_set)];
    input.extend(sanity_drop_rules());

    let mut forward = vec![bypass_rule(forward_bypass_set)];
    forward.extend(sanity_drop_rules());
    if let Some(target) = offload {
        forward.extend(flow_offload_rules(target.lan_set, target.flowtable));
    }

    ChainPrograms {
        input,
        forward,
        output: Vec::new(),
    }
}
