//! nftables VM expressions and their netlink encoding
//!
//! Each [`Expr`] encodes to one `NFTA_LIST_ELEM` holding the expression name
//! and its `NFTA_EXPR_DATA` attributes, exactly as `libnftnl` would emit them.

use crate::netlink::attr::{push_attr_be32, push_attr_bytes, push_attr_nested, push_attr_str};
use crate::netlink::consts::{
    NF_ACCEPT, NF_DROP, NFTA_BITWISE_DREG, NFTA_BITWISE_LEN, NFTA_BITWISE_MASK,
    NFTA_BITWISE_SREG, NFTA_BITWISE_XOR, NFTA_CMP_DATA, NFTA_CMP_OP, NFTA_CMP_SREG, NFTA_CT_DREG,
    NFTA_CT_KEY, NFTA_DATA_VALUE, NFTA_DATA_VERDICT, NFTA_EXPR_DATA, NFTA_EXPR_NAME,
    NFTA_FLOW_TABLE_NAME, NFTA_IMMEDIATE_DATA, NFTA_IMMEDIATE_DREG, NFTA_LIST_ELEM,
    NFTA_LOOKUP_SET, NFTA_LOOKUP_SREG, NFTA_META_DREG, NFTA_META_KEY, NFTA_PAYLOAD_BASE,
    NFTA_PAYLOAD_DREG, NFTA_PAYLOAD_LEN, NFTA_PAYLOAD_OFFSET, NFTA_VERDICT_CODE,
};

/// VM registers. Only the verdict register and register 1 are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Verdict = 0,
    R1 = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKey {
    IifName = 6,
    NfProto = 15,
    L4Proto = 16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtKey {
    State = 0,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadBase {
    Network = 1,
    Transport = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq = 0,
    Neq = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    fn code(self) -> u32 {
        match self {
            Verdict::Accept => NF_ACCEPT,
            Verdict::Drop => NF_DROP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Meta {
        key: MetaKey,
        dreg: Register,
    },
    Ct {
        key: CtKey,
        dreg: Register,
    },
    Payload {
        base: PayloadBase,
        offset: u32,
        len: u32,
        dreg: Register,
    },
    /// `dreg = (sreg & mask) ^ xor`
    Bitwise {
        sreg: Register,
        dreg: Register,
        mask: Vec<u8>,
        xor: Vec<u8>,
    },
    Cmp {
        sreg: Register,
        op: CmpOp,
        data: Vec<u8>,
    },
    Lookup {
        set: String,
        sreg: Register,
    },
    Immediate(Verdict),
    FlowOffload {
        flowtable: String,
    },
}

impl Expr {
    pub fn name(&self) -> &'static str {
        match self {
            Expr::Meta { .. } => "meta",
            Expr::Ct { .. } => "ct",
            Expr::Payload { .. } => "payload",
            Expr::Bitwise { .. } => "bitwise",
            Expr::Cmp { .. } => "cmp",
            Expr::Lookup { .. } => "lookup",
            Expr::Immediate(_) => "immediate",
            Expr::FlowOffload { .. } => "flow_offload",
        }
    }

    /// Appends this expression as an `NFTA_LIST_ELEM`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        push_attr_nested(buf, NFTA_LIST_ELEM, |elem| {
            push_attr_str(elem, NFTA_EXPR_NAME, self.name());
            push_attr_nested(elem, NFTA_EXPR_DATA, |data| self.encode_data(data));
        });
    }

    fn encode_data(&self, buf: &mut Vec<u8>) {
        match self {
            Expr::Meta { key, dreg } => {
                push_attr_be32(buf, NFTA_META_DREG, *dreg as u32);
                push_attr_be32(buf, NFTA_META_KEY, *key as u32);
            }
            Expr::Ct { key, dreg } => {
                push_attr_be32(buf, NFTA_CT_DREG, *dreg as u32);
                push_attr_be32(buf, NFTA_CT_KEY, *key as u32);
            }
            Expr::Payload {
                base,
                offset,
                len,
                dreg,
            } => {
                push_attr_be32(buf, NFTA_PAYLOAD_DREG, *dreg as u32);
                push_attr_be32(buf, NFTA_PAYLOAD_BASE, *base as u32);
                push_attr_be32(buf, NFTA_PAYLOAD_OFFSET, *offset);
                push_attr_be32(buf, NFTA_PAYLOAD_LEN, *len);
            }
            Expr::Bitwise {
                sreg,
                dreg,
                mask,
                xor,
            } => {
                push_attr_be32(buf, NFTA_BITWISE_SREG, *sreg as u32);
                push_attr_be32(buf, NFTA_BITWISE_DREG, *dreg as u32);
                push_attr_be32(buf, NFTA_BITWISE_LEN, mask.len() as u32);
                push_data_value(buf, NFTA_BITWISE_MASK, mask);
                push_data_value(buf, NFTA_BITWISE_XOR, xor);
            }
            Expr::Cmp { sreg, op, data } => {
                push_attr_be32(buf, NFTA_CMP_SREG, *sreg as u32);
                push_attr_be32(buf, NFTA_CMP_OP, *op as u32);
                push_data_value(buf, NFTA_CMP_DATA, data);
            }
            Expr::Lookup { set, sreg } => {
                push_attr_str(buf, NFTA_LOOKUP_SET, set);
                push_attr_be32(buf, NFTA_LOOKUP_SREG, *sreg as u32);
            }
            Expr::Immediate(verdict) => {
                push_attr_be32(buf, NFTA_IMMEDIATE_DREG, Register::Verdict as u32);
                push_attr_nested(buf, NFTA_IMMEDIATE_DATA, |imm| {
                    push_attr_nested(imm, NFTA_DATA_VERDICT, |v| {
                        push_attr_be32(v, NFTA_VERDICT_CODE, verdict.code());
                    });
                });
            }
            Expr::FlowOffload { flowtable } => {
                push_attr_str(buf, NFTA_FLOW_TABLE_NAME, flowtable);
            }
        }
    }
}

fn push_data_value(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    push_attr_nested(buf, attr_type, |data| {
        push_attr_bytes(data, NFTA_DATA_VALUE, value);
    });
}

/// Encodes a rule's expressions as the payload of `NFTA_RULE_EXPRESSIONS`.
pub fn encode_expressions(exprs: &[Expr]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(exprs.len() * 48);
    for expr in exprs {
        expr.encode_into(&mut buf);
    }
    buf
}
