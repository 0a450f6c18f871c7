//! Minimal netlink plumbing shared by the block-set driver and the packet
//! queue source.
//!
//! Message layout is the kernel's: a 16-byte `nlmsghdr`, the netfilter
//! `nfgenmsg` (family, version, resource id in network order), then a run of
//! 4-byte-aligned attributes, possibly nested. Building uses a byte-vector
//! builder with a length patch at finish; parsing walks the buffer with
//! unaligned reads.

use std::io;
use std::os::unix::io::RawFd;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
/// NLM_F_ROOT | NLM_F_MATCH — dump request.
pub const NLM_F_DUMP: u16 = 0x300;

pub const NLA_F_NESTED: u16 = 0x8000;
pub const NLA_F_NET_BYTEORDER: u16 = 0x4000;
const NLA_TYPE_MASK: u16 = 0x3fff;

/// nfnetlink protocol version carried in every `nfgenmsg`.
pub const NFNETLINK_V0: u8 = 0;

const NLMSG_HDRLEN: usize = 16;
const NLATTR_HDRLEN: usize = 4;

#[inline]
pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

// ───────────────────────────────────────────────────────────────────────────
// Socket
// ───────────────────────────────────────────────────────────────────────────

/// A raw `AF_NETLINK` socket bound with an autoassigned port id.
pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    pub fn connect(protocol: i32) -> io::Result<Self> {
        // SAFETY: plain socket(2) call; the fd is owned by the returned
        // struct and closed exactly once in Drop.
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, protocol) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: sockaddr_nl is a C-layout struct of integer fields; the
        // all-zero bit pattern is a valid value (nl_pad is private padding).
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: fd is a valid netlink socket and addr is a properly
        // initialized sockaddr_nl on the stack.
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd needs cleanup on the bind failure path.
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(Self { fd })
    }

    /// Bound receive so reads wake up periodically for stop checks.
    pub fn set_recv_timeout(&self, secs: i64) -> io::Result<()> {
        let timeout = libc::timeval {
            tv_sec: secs,
            tv_usec: 0,
        };
        // SAFETY: fd is valid and timeout is a stack-local timeval.
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn send(&self, msg: &[u8]) -> io::Result<()> {
        // SAFETY: msg points at len valid bytes for the duration of the call.
        let n = unsafe { libc::send(self.fd, msg.as_ptr() as *const libc::c_void, msg.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is a valid mutable slice; recv writes at most len bytes.
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Unblock any thread sitting in `recv`; used by stop handles.
    pub fn interrupt(&self) {
        // SAFETY: shutdown is safe on any valid socket fd.
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this struct and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Message builder
// ───────────────────────────────────────────────────────────────────────────

pub struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    /// Start a message: nlmsghdr with a length placeholder, then the
    /// netfilter `nfgenmsg` with `res_id` in network order.
    pub fn new(msg_type: u16, flags: u16, seq: u32, family: u8, res_id: u16) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len, patched in finish
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid

        buf.push(family);
        buf.push(NFNETLINK_V0);
        buf.extend_from_slice(&res_id.to_be_bytes());

        Self { buf }
    }

    pub fn attr(&mut self, attr_type: u16, payload: &[u8]) {
        let len = NLATTR_HDRLEN + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.pad();
    }

    pub fn attr_u8(&mut self, attr_type: u16, value: u8) {
        self.attr(attr_type, &[value]);
    }

    /// u32 attribute in network byte order, flagged as such.
    pub fn attr_u32_be(&mut self, attr_type: u16, value: u32) {
        self.attr(attr_type | NLA_F_NET_BYTEORDER, &value.to_be_bytes());
    }

    /// NUL-terminated string attribute (set and type names).
    pub fn attr_str(&mut self, attr_type: u16, value: &str) {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.attr(attr_type, &payload);
    }

    /// Open a nested attribute; returns the offset to hand to `end_nested`.
    pub fn begin_nested(&mut self, attr_type: u16) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes()); // length patch slot
        self.buf
            .extend_from_slice(&(attr_type | NLA_F_NESTED).to_ne_bytes());
        start
    }

    pub fn end_nested(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }

    fn pad(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Parsing
// ───────────────────────────────────────────────────────────────────────────

/// One message pulled out of a receive buffer. `payload` starts after the
/// nlmsghdr (for netfilter messages it begins with the nfgenmsg).
#[derive(Debug, Clone, Copy)]
pub struct NlMsg<'a> {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub payload: &'a [u8],
}

impl<'a> NlMsg<'a> {
    /// For `NLMSG_ERROR` messages: the (negated) errno, 0 meaning ACK.
    pub fn error_code(&self) -> Option<i32> {
        if self.msg_type != NLMSG_ERROR || self.payload.len() < 4 {
            return None;
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.payload[..4]);
        Some(i32::from_ne_bytes(raw))
    }

    /// Attribute run after `skip` payload bytes (e.g. the nfgenmsg).
    pub fn attrs(&self, skip: usize) -> AttrIter<'a> {
        AttrIter {
            data: self.payload.get(skip..).unwrap_or(&[]),
        }
    }
}

/// Iterate the netlink messages packed into one receive buffer.
pub fn messages(buf: &[u8]) -> MsgIter<'_> {
    MsgIter { data: buf }
}

pub struct MsgIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for MsgIter<'a> {
    type Item = NlMsg<'a>;

    fn next(&mut self) -> Option<NlMsg<'a>> {
        if self.data.len() < NLMSG_HDRLEN {
            return None;
        }
        let len = u32::from_ne_bytes(self.data[0..4].try_into().ok()?) as usize;
        if len < NLMSG_HDRLEN || len > self.data.len() {
            return None;
        }
        let msg = NlMsg {
            msg_type: u16::from_ne_bytes(self.data[4..6].try_into().ok()?),
            flags: u16::from_ne_bytes(self.data[6..8].try_into().ok()?),
            seq: u32::from_ne_bytes(self.data[8..12].try_into().ok()?),
            payload: &self.data[NLMSG_HDRLEN..len],
        };
        self.data = &self.data[align4(len).min(self.data.len())..];
        Some(msg)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Attr<'a> {
    raw_type: u16,
    pub payload: &'a [u8],
}

impl<'a> Attr<'a> {
    /// Attribute type with the nested/byte-order flags masked off.
    pub fn kind(&self) -> u16 {
        self.raw_type & NLA_TYPE_MASK
    }

    pub fn is_nested(&self) -> bool {
        self.raw_type & NLA_F_NESTED != 0
    }

    pub fn nested(&self) -> AttrIter<'a> {
        AttrIter { data: self.payload }
    }

    pub fn as_u32_be(&self) -> Option<u32> {
        self.payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_be_bytes)
    }
}

pub struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Attr<'a>;

    fn next(&mut self) -> Option<Attr<'a>> {
        if self.data.len() < NLATTR_HDRLEN {
            return None;
        }
        let len = u16::from_ne_bytes(self.data[0..2].try_into().ok()?) as usize;
        if len < NLATTR_HDRLEN || len > self.data.len() {
            return None;
        }
        let attr = Attr {
            raw_type: u16::from_ne_bytes(self.data[2..4].try_into().ok()?),
            payload: &self.data[NLATTR_HDRLEN..len],
        };
        self.data = &self.data[align4(len).min(self.data.len())..];
        Some(attr)
    }
}
