//! Netlink message and attribute encoding
//!
//! Attribute integers are written big-endian: nf_tables reads every scalar
//! attribute with `nla_get_be32`/`nla_get_be64`. Raw data blobs (set keys,
//! compare operands, masks) are copied verbatim.

use super::consts::{
    NFGENMSG_LEN, NFNETLINK_V0, NLA_ALIGNTO, NLA_F_NESTED, NLA_F_NET_BYTEORDER, NLA_HDRLEN,
    NLMSG_HDRLEN,
};

pub fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

pub fn push_attr_bytes(buf: &mut Vec<u8>, attr_type: u16, data: &[u8]) {
    let len = NLA_HDRLEN + data.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(data);
    pad(buf, len);
}

/// Appends a NUL-terminated string attribute.
pub fn push_attr_str(buf: &mut Vec<u8>, attr_type: u16, value: &str) {
    let len = NLA_HDRLEN + value.len() + 1;
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    pad(buf, len);
}

pub fn push_attr_be32(buf: &mut Vec<u8>, attr_type: u16, value: u32) {
    push_attr_bytes(buf, attr_type, &value.to_be_bytes());
}

pub fn push_attr_nested(buf: &mut Vec<u8>, attr_type: u16, build: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; NLA_HDRLEN]);
    build(buf);
    let len = buf.len() - start;
    buf[start..start + 2].copy_from_slice(&(len as u16).to_ne_bytes());
    buf[start + 2..start + 4].copy_from_slice(&(attr_type | NLA_F_NESTED).to_ne_bytes());
    pad(buf, len);
}

fn pad(buf: &mut Vec<u8>, len: usize) {
    let aligned = nla_align(len);
    if aligned > len {
        buf.resize(buf.len() + (aligned - len), 0);
    }
}

/// Builds one complete netlink message: header, `nfgenmsg`, attributes.
///
/// `res_id` is carried big-endian as the kernel expects.
pub fn build_nlmsg(
    msg_type: u16,
    flags: u16,
    seq: u32,
    family: u8,
    res_id: u16,
    attrs: &[u8],
) -> Vec<u8> {
    let len = NLMSG_HDRLEN + NFGENMSG_LEN + attrs.len();
    let mut buf = Vec::with_capacity(nla_align(len));
    buf.extend_from_slice(&(len as u32).to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.push(family);
    buf.push(NFNETLINK_V0);
    buf.extend_from_slice(&res_id.to_be_bytes());
    buf.extend_from_slice(attrs);
    pad(&mut buf, len);
    buf
}

#[derive(Debug, Clone)]
pub struct NlHeader {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
}

#[derive(Debug, Clone)]
pub struct NetlinkMessage {
    pub header: NlHeader,
    pub payload: Vec<u8>,
}

impl NetlinkMessage {
    /// Attributes following the 4-byte `nfgenmsg`.
    pub fn nft_attrs(&self) -> Vec<Attr> {
        if self.payload.len() < NFGENMSG_LEN {
            return Vec::new();
        }
        parse_attrs(&self.payload[NFGENMSG_LEN..])
    }
}

pub fn parse_nlmsgs(buf: &[u8]) -> Vec<NetlinkMessage> {
    let mut msgs = Vec::new();
    let mut offset = 0usize;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let b = &buf[offset..];
        let header = NlHeader {
            len: u32::from_ne_bytes([b[0], b[1], b[2], b[3]]),
            msg_type: u16::from_ne_bytes([b[4], b[5]]),
            flags: u16::from_ne_bytes([b[6], b[7]]),
            seq: u32::from_ne_bytes([b[8], b[9], b[10], b[11]]),
        };
        let msg_len = header.len as usize;
        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }
        let payload = buf[offset + NLMSG_HDRLEN..offset + msg_len].to_vec();
        msgs.push(NetlinkMessage { header, payload });
        offset += nla_align(msg_len);
    }
    msgs
}

/// Decodes the errno carried by an `NLMSG_ERROR` payload (0 means ACK).
pub fn parse_nlmsg_error(payload: &[u8]) -> Option<i32> {
    if payload.len() < 4 {
        return None;
    }
    Some(i32::from_ne_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

#[derive(Debug, Clone)]
pub struct Attr {
    pub attr_type: u16,
    pub payload: Vec<u8>,
}

impl Attr {
    pub fn as_string(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }

    pub fn as_be32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn as_be64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.payload.get(..8)?.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    pub fn nested(&self) -> Vec<Attr> {
        parse_attrs(&self.payload)
    }
}

pub fn parse_attrs(buf: &[u8]) -> Vec<Attr> {
    let mut attrs = Vec::new();
    let mut offset = 0usize;
    while offset + NLA_HDRLEN <= buf.len() {
        let len = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as usize;
        let attr_type = u16::from_ne_bytes([buf[offset + 2], buf[offset + 3]])
            & !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);
        if len < NLA_HDRLEN || offset + len > buf.len() {
            break;
        }
        attrs.push(Attr {
            attr_type,
            payload: buf[offset + NLA_HDRLEN..offset + len].to_vec(),
        });
        offset += nla_align(len);
    }
    attrs
}
