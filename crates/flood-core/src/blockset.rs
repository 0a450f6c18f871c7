//! Kernel block-set driver.
//!
//! Drives a named, TTL-capable `hash:ip` kernel address set over the
//! nfnetlink ipset protocol — no shell-out, one netlink request-reply cycle
//! at a time under an internal mutex so mutations can never interleave with
//! a flush. The set is created if absent at init and deliberately left
//! behind at shutdown so blocks survive a daemon restart.

use anyhow::{anyhow, bail, Context, Result};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use tracing::info;

use crate::netlink::{
    messages, MsgBuilder, NetlinkSocket, NLMSG_DONE, NLMSG_ERROR, NLM_F_ACK, NLM_F_DUMP,
    NLM_F_REQUEST,
};

const NETLINK_NETFILTER: i32 = 12;
const NFNL_SUBSYS_IPSET: u16 = 6;
const NFPROTO_IPV4: u8 = 2;

/// Userspace-kernel ipset protocol version.
const IPSET_PROTOCOL: u8 = 7;

// Commands (message type = subsystem << 8 | command).
const IPSET_CMD_CREATE: u16 = 2;
const IPSET_CMD_FLUSH: u16 = 4;
const IPSET_CMD_LIST: u16 = 7;
const IPSET_CMD_ADD: u16 = 9;
const IPSET_CMD_DEL: u16 = 10;
const IPSET_CMD_TEST: u16 = 11;

// Command-level attributes.
const IPSET_ATTR_PROTOCOL: u16 = 1;
const IPSET_ATTR_SETNAME: u16 = 2;
const IPSET_ATTR_TYPENAME: u16 = 3;
const IPSET_ATTR_REVISION: u16 = 4;
const IPSET_ATTR_FAMILY: u16 = 5;
const IPSET_ATTR_DATA: u16 = 7;
const IPSET_ATTR_ADT: u16 = 8;

// Create/data attributes.
const IPSET_ATTR_IP: u16 = 1;
const IPSET_ATTR_TIMEOUT: u16 = 6;
const IPSET_ATTR_MAXELEM: u16 = 19;
const IPSET_ATTR_ELEMENTS: u16 = 24;

// Inside IPSET_ATTR_IP.
const IPSET_ATTR_IPADDR_IPV4: u16 = 1;

/// hash:ip revision requested at create time; in the supported range of
/// every kernel this daemon targets.
const HASH_IP_REVISION: u8 = 1;

// Kernel ipset error space (returned negated in nlmsgerr).
const IPSET_ERR_EXIST_SETNAME2: i32 = 4101;
const IPSET_ERR_EXIST: i32 = 4103;

/// The kernel-resident address set the pipeline blocks into and the sweeper
/// releases from. Implementations serialize internally; errors are non-fatal
/// at call sites.
pub trait BlockSet: Send + Sync {
    /// Add `addr` with the given TTL. Idempotent: re-adding refreshes the TTL.
    fn add(&self, addr: Ipv4Addr, ttl_s: u32) -> Result<()>;
    /// Remove `addr`. Removing an absent element is a no-op.
    fn remove(&self, addr: Ipv4Addr) -> Result<()>;
    fn test(&self, addr: Ipv4Addr) -> Result<bool>;
    fn flush(&self) -> Result<()>;
    fn count(&self) -> Result<u32>;
    /// Release driver resources. MUST NOT destroy the set: blocks outlive
    /// the daemon by design.
    fn shutdown(&self);
}

struct Inner {
    sock: Option<NetlinkSocket>,
    seq: u32,
}

pub struct IpsetDriver {
    set_name: String,
    inner: Mutex<Inner>,
}

impl IpsetDriver {
    /// Open the netlink channel and create the set if it does not exist.
    /// Re-running against an existing set is fine.
    pub fn init(set_name: &str, default_ttl_s: u32, max_elements: u32) -> Result<Self> {
        let sock = NetlinkSocket::connect(NETLINK_NETFILTER)
            .context("failed to open netfilter netlink socket")?;
        sock.set_recv_timeout(2)?;

        let driver = Self {
            set_name: set_name.to_string(),
            inner: Mutex::new(Inner {
                sock: Some(sock),
                seq: 1,
            }),
        };

        driver
            .create_set(default_ttl_s, max_elements)
            .with_context(|| format!("failed to create address set {set_name:?}"))?;
        info!(set = set_name, "address set ready");
        Ok(driver)
    }

    fn create_set(&self, default_ttl_s: u32, max_elements: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut msg = self.request(&mut inner, IPSET_CMD_CREATE, NLM_F_REQUEST | NLM_F_ACK);
        msg.attr_str(IPSET_ATTR_TYPENAME, "hash:ip");
        msg.attr_u8(IPSET_ATTR_REVISION, HASH_IP_REVISION);
        msg.attr_u8(IPSET_ATTR_FAMILY, NFPROTO_IPV4);
        let data = msg.begin_nested(IPSET_ATTR_DATA);
        msg.attr_u32_be(IPSET_ATTR_TIMEOUT, default_ttl_s);
        msg.attr_u32_be(IPSET_ATTR_MAXELEM, max_elements);
        msg.end_nested(data);

        match Self::transact(&mut inner, msg)? {
            0 => Ok(()),
            code if code == -IPSET_ERR_EXIST_SETNAME2 || code == -libc::EEXIST => Ok(()),
            code => bail!("ipset create failed: {}", set_error(code)),
        }
    }

    /// Start a request for this driver's set; every ipset message leads with
    /// the protocol version and the set name.
    fn request(&self, inner: &mut Inner, cmd: u16, flags: u16) -> MsgBuilder {
        inner.seq = inner.seq.wrapping_add(1);
        let msg_type = (NFNL_SUBSYS_IPSET << 8) | cmd;
        let mut msg = MsgBuilder::new(msg_type, flags, inner.seq, NFPROTO_IPV4, 0);
        msg.attr_u8(IPSET_ATTR_PROTOCOL, IPSET_PROTOCOL);
        msg.attr_str(IPSET_ATTR_SETNAME, &self.set_name);
        msg
    }

    /// Send one ACK-flagged request and return the kernel's error code
    /// (0 for success, negated errno/ipset error otherwise).
    fn transact(inner: &mut Inner, msg: MsgBuilder) -> Result<i32> {
        let sock = inner
            .sock
            .as_ref()
            .ok_or_else(|| anyhow!("block-set driver is shut down"))?;
        sock.send(&msg.finish())?;

        let mut buf = vec![0u8; 8192];
        let n = sock.recv(&mut buf)?;
        for reply in messages(&buf[..n]) {
            if reply.msg_type == NLMSG_ERROR {
                return reply
                    .error_code()
                    .ok_or_else(|| anyhow!("truncated netlink ack"));
            }
        }
        bail!("no netlink ack received");
    }

    /// One `IPSET_ATTR_DATA { IP { IPADDR_IPV4 } [, TIMEOUT] }` element.
    fn element(msg: &mut MsgBuilder, addr: Ipv4Addr, ttl_s: Option<u32>) {
        let data = msg.begin_nested(IPSET_ATTR_DATA);
        let ip = msg.begin_nested(IPSET_ATTR_IP);
        msg.attr_u32_be(IPSET_ATTR_IPADDR_IPV4, u32::from(addr));
        msg.end_nested(ip);
        if let Some(ttl) = ttl_s {
            msg.attr_u32_be(IPSET_ATTR_TIMEOUT, ttl);
        }
        msg.end_nested(data);
    }
}

impl BlockSet for IpsetDriver {
    fn add(&self, addr: Ipv4Addr, ttl_s: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut msg = self.request(&mut inner, IPSET_CMD_ADD, NLM_F_REQUEST | NLM_F_ACK);
        Self::element(&mut msg, addr, Some(ttl_s));
        match Self::transact(&mut inner, msg)? {
            0 => Ok(()),
            // Without NLM_F_EXCL a re-add refreshes the timeout, but older
            // kernels still answer EXIST; presence is what we asked for.
            code if code == -IPSET_ERR_EXIST => Ok(()),
            code => bail!("ipset add {} failed: {}", addr, set_error(code)),
        }
    }

    fn remove(&self, addr: Ipv4Addr) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut msg = self.request(&mut inner, IPSET_CMD_DEL, NLM_F_REQUEST | NLM_F_ACK);
        Self::element(&mut msg, addr, None);
        match Self::transact(&mut inner, msg)? {
            0 => Ok(()),
            // Absent already — the TTL may have beaten the sweeper to it.
            code if code == -IPSET_ERR_EXIST => Ok(()),
            code => bail!("ipset del {} failed: {}", addr, set_error(code)),
        }
    }

    fn test(&self, addr: Ipv4Addr) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let mut msg = self.request(&mut inner, IPSET_CMD_TEST, NLM_F_REQUEST | NLM_F_ACK);
        Self::element(&mut msg, addr, None);
        match Self::transact(&mut inner, msg)? {
            0 => Ok(true),
            code if code == -IPSET_ERR_EXIST => Ok(false),
            code => bail!("ipset test {} failed: {}", addr, set_error(code)),
        }
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let msg = self.request(&mut inner, IPSET_CMD_FLUSH, NLM_F_REQUEST | NLM_F_ACK);
        match Self::transact(&mut inner, msg)? {
            0 => Ok(()),
            code => bail!("ipset flush failed: {}", set_error(code)),
        }
    }

    fn count(&self) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        let msg = self.request(&mut inner, IPSET_CMD_LIST, NLM_F_REQUEST | NLM_F_DUMP);
        let sock = inner
            .sock
            .as_ref()
            .ok_or_else(|| anyhow!("block-set driver is shut down"))?;
        sock.send(&msg.finish())?;

        let list_type = (NFNL_SUBSYS_IPSET << 8) | IPSET_CMD_LIST;
        let mut total = 0u32;
        let mut buf = vec![0u8; 65536];
        'dump: loop {
            let n = sock.recv(&mut buf)?;
            if n == 0 {
                break;
            }
            for reply in messages(&buf[..n]) {
                match reply.msg_type {
                    NLMSG_DONE => break 'dump,
                    NLMSG_ERROR => {
                        let code = reply.error_code().unwrap_or(-libc::EIO);
                        bail!("ipset list failed: {}", set_error(code));
                    }
                    t if t == list_type => total += count_in_list(&reply),
                    _ => {}
                }
                if reply.flags & crate::netlink::NLM_F_MULTI == 0 {
                    break 'dump;
                }
            }
        }
        Ok(total)
    }

    fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sock = None;
        info!(set = %self.set_name, "block-set driver stopped; kernel set left in place");
    }
}

/// Pull an element count out of one LIST reply: prefer the header's element
/// counter, fall back to counting dumped members.
fn count_in_list(reply: &crate::netlink::NlMsg<'_>) -> u32 {
    let mut members = 0u32;
    // Skip the 4-byte nfgenmsg.
    for attr in reply.attrs(4) {
        match attr.kind() {
            IPSET_ATTR_DATA => {
                for inner in attr.nested() {
                    if inner.kind() == IPSET_ATTR_ELEMENTS {
                        if let Some(n) = inner.as_u32_be() {
                            return n;
                        }
                    }
                }
            }
            IPSET_ATTR_ADT => {
                members += attr
                    .nested()
                    .filter(|a| a.kind() == IPSET_ATTR_DATA)
                    .count() as u32;
            }
            _ => {}
        }
    }
    members
}

fn set_error(code: i32) -> String {
    match -code {
        IPSET_ERR_EXIST => "element exists".into(),
        IPSET_ERR_EXIST_SETNAME2 => "set name exists".into(),
        e if e >= 4096 => format!("ipset error {e}"),
        e => std::io::Error::from_raw_os_error(e).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::NFNETLINK_V0;

    #[test]
    fn test_element_wire_shape() {
        let mut msg = MsgBuilder::new(
            (NFNL_SUBSYS_IPSET << 8) | IPSET_CMD_ADD,
            NLM_F_REQUEST | NLM_F_ACK,
            1,
            NFPROTO_IPV4,
            0,
        );
        msg.attr_u8(IPSET_ATTR_PROTOCOL, IPSET_PROTOCOL);
        msg.attr_str(IPSET_ATTR_SETNAME, "blk");
        IpsetDriver::element(&mut msg, Ipv4Addr::new(203, 0, 113, 100), Some(300));
        let wire = msg.finish();

        let msgs: Vec<_> = messages(&wire).collect();
        assert_eq!(msgs.len(), 1);
        let attrs: Vec<_> = msgs[0].attrs(4).collect();
        assert_eq!(attrs.len(), 3);

        assert_eq!(attrs[0].kind(), IPSET_ATTR_PROTOCOL);
        assert_eq!(attrs[0].payload[0], IPSET_PROTOCOL);
        assert_eq!(attrs[1].kind(), IPSET_ATTR_SETNAME);

        let data = &attrs[2];
        assert_eq!(data.kind(), IPSET_ATTR_DATA);
        assert!(data.is_nested());
        let inner: Vec<_> = data.nested().collect();
        assert_eq!(inner.len(), 2);
        assert_eq!(inner[0].kind(), IPSET_ATTR_IP);
        let ip: Vec<_> = inner[0].nested().collect();
        assert_eq!(
            ip[0].as_u32_be(),
            Some(u32::from(Ipv4Addr::new(203, 0, 113, 100)))
        );
        assert_eq!(inner[1].kind(), IPSET_ATTR_TIMEOUT);
        assert_eq!(inner[1].as_u32_be(), Some(300));
    }

    #[test]
    fn test_nfgenmsg_version_constant() {
        // The protocol pin the whole module is built on.
        assert_eq!(NFNETLINK_V0, 0);
        assert_eq!((NFNL_SUBSYS_IPSET << 8) | IPSET_CMD_ADD, 0x0609);
    }

    #[test]
    fn test_count_in_list_prefers_header_elements() {
        let mut msg = MsgBuilder::new((NFNL_SUBSYS_IPSET << 8) | IPSET_CMD_LIST, 0, 1, 2, 0);
        let data = msg.begin_nested(IPSET_ATTR_DATA);
        msg.attr_u32_be(IPSET_ATTR_ELEMENTS, 42);
        msg.end_nested(data);
        let wire = msg.finish();
        let reply = messages(&wire).next().unwrap();
        assert_eq!(count_in_list(&reply), 42);
    }

    #[test]
    fn test_count_in_list_falls_back_to_members() {
        let mut msg = MsgBuilder::new((NFNL_SUBSYS_IPSET << 8) | IPSET_CMD_LIST, 0, 1, 2, 0);
        let adt = msg.begin_nested(IPSET_ATTR_ADT);
        for last in [1u8, 2, 3] {
            let data = msg.begin_nested(IPSET_ATTR_DATA);
            let ip = msg.begin_nested(IPSET_ATTR_IP);
            msg.attr_u32_be(IPSET_ATTR_IPADDR_IPV4, u32::from(Ipv4Addr::new(10, 0, 0, last)));
            msg.end_nested(ip);
            msg.end_nested(data);
        }
        msg.end_nested(adt);
        let wire = msg.finish();
        let reply = messages(&wire).next().unwrap();
        assert_eq!(count_in_list(&reply), 3);
    }

    #[test]
    fn test_set_error_strings() {
        assert_eq!(set_error(-IPSET_ERR_EXIST), "element exists");
        assert!(set_error(-libc::EPERM).to_lowercase().contains("permitted"));
    }
}
