//! Netfilter netlink socket
//!
//! Each request or transaction opens its own socket; the descriptor is owned
//! by [`NetfilterSocket`] and closed when it drops.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, bind, recv, send,
    socket,
};
use tracing::trace;

use super::attr::{NetlinkMessage, build_nlmsg, parse_nlmsg_error, parse_nlmsgs};
use super::consts::{
    NFNL_MSG_BATCH_BEGIN, NFNL_MSG_BATCH_END, NFNL_SUBSYS_NFTABLES, NFPROTO_UNSPEC, NLM_F_ACK,
    NLM_F_DUMP, NLM_F_REQUEST, NLMSG_DONE, NLMSG_ERROR,
};

const RECV_BUF_SIZE: usize = 64 * 1024;

static SEQ: AtomicU32 = AtomicU32::new(1);

pub fn next_seq() -> u32 {
    SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Errno carried by an `NLMSG_ERROR` payload, as an `io::Error`.
///
/// `Ok(None)` is an ACK.
fn nlmsg_status(payload: &[u8]) -> io::Result<Option<io::Error>> {
    match parse_nlmsg_error(payload) {
        Some(0) => Ok(None),
        Some(err) => Ok(Some(Errno::from_raw(-err).into())),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "short netlink error message",
        )),
    }
}

/// Folds one received datagram into the replies for request `seq`.
///
/// Returns `true` once the request is finished: an ACK for plain requests,
/// `NLMSG_DONE` for dumps. Messages for other sequence numbers are ignored.
fn absorb_reply(seq: u32, buf: &[u8], out: &mut Vec<NetlinkMessage>) -> io::Result<bool> {
    for msg in parse_nlmsgs(buf) {
        if msg.header.seq != seq {
            continue;
        }
        match msg.header.msg_type {
            NLMSG_ERROR => {
                return match nlmsg_status(&msg.payload)? {
                    None => Ok(true),
                    Some(err) => Err(err),
                };
            }
            NLMSG_DONE => return Ok(true),
            _ => out.push(msg),
        }
    }
    Ok(false)
}

/// Folds one received datagram into the outstanding batch ACKs.
///
/// Each ACK removes its sequence number from `pending`; the first non-zero
/// errno fails the whole batch.
fn absorb_acks(buf: &[u8], pending: &mut Vec<u32>) -> io::Result<()> {
    for msg in parse_nlmsgs(buf) {
        if msg.header.msg_type != NLMSG_ERROR {
            continue;
        }
        if let Some(err) = nlmsg_status(&msg.payload)? {
            return Err(err);
        }
        pending.retain(|seq| *seq != msg.header.seq);
    }
    Ok(())
}

/// One nf_tables message waiting to be committed inside a batch.
#[derive(Debug, Clone)]
pub struct BatchMessage {
    pub msg_type: u16,
    pub flags: u16,
    pub family: u8,
    pub attrs: Vec<u8>,
}

pub struct NetfilterSocket {
    fd: OwnedFd,
}

impl NetfilterSocket {
    pub fn open() -> io::Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkNetFilter,
        )?;
        // Port id 0 lets the kernel pick a unique one per socket.
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0))?;
        Ok(Self { fd })
    }

    fn send(&self, buf: &[u8]) -> io::Result<()> {
        send(self.fd.as_raw_fd(), buf, MsgFlags::empty())?;
        Ok(())
    }

    fn recv(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.resize(RECV_BUF_SIZE, 0);
        let len = recv(self.fd.as_raw_fd(), buf, MsgFlags::empty())?;
        buf.truncate(len);
        Ok(())
    }

    /// Sends a single GET request and collects the replies.
    ///
    /// Non-dump requests finish on the trailing ACK, dumps on `NLMSG_DONE`.
    pub fn request(
        &self,
        msg_type: u16,
        family: u8,
        dump: bool,
        attrs: &[u8],
    ) -> io::Result<Vec<NetlinkMessage>> {
        let seq = next_seq();
        let flags = if dump {
            NLM_F_REQUEST | NLM_F_DUMP
        } else {
            NLM_F_REQUEST | NLM_F_ACK
        };
        self.send(&build_nlmsg(msg_type, flags, seq, family, 0, attrs))?;

        let mut out = Vec::new();
        let mut buf = Vec::with_capacity(RECV_BUF_SIZE);
        loop {
            self.recv(&mut buf)?;
            if absorb_reply(seq, &buf, &mut out)? {
                return Ok(out);
            }
        }
    }

    /// Commits `messages` as one nfnetlink batch.
    ///
    /// The kernel applies the whole batch or none of it; the first error
    /// reported for any member message is returned.
    pub fn commit(&self, messages: &[BatchMessage]) -> io::Result<()> {
        let mut buf = build_nlmsg(
            NFNL_MSG_BATCH_BEGIN,
            NLM_F_REQUEST,
            next_seq(),
            NFPROTO_UNSPEC,
            NFNL_SUBSYS_NFTABLES,
            &[],
        );
        let mut pending = Vec::with_capacity(messages.len());
        for msg in messages {
            let seq = next_seq();
            pending.push(seq);
            buf.extend_from_slice(&build_nlmsg(
                msg.msg_type,
                msg.flags | NLM_F_REQUEST | NLM_F_ACK,
                seq,
                msg.family,
                0,
                &msg.attrs,
            ));
        }
        buf.extend_from_slice(&build_nlmsg(
            NFNL_MSG_BATCH_END,
            NLM_F_REQUEST,
            next_seq(),
            NFPROTO_UNSPEC,
            NFNL_SUBSYS_NFTABLES,
            &[],
        ));

        trace!("sending batch of {} messages ({} bytes)", messages.len(), buf.len());
        self.send(&buf)?;

        while !pending.is_empty() {
            self.recv(&mut buf)?;
            absorb_acks(&buf, &mut pending)?;
        }
        Ok(())
    }
}
