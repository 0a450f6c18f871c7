//! Fallback packet source: filtered raw packet socket.
//!
//! An `AF_PACKET`/`SOCK_DGRAM` socket for IPv4 with a classic BPF program
//! attached in the kernel, so only TCP segments with SYN set and ACK clear
//! ever cross into userspace. There is no verdict channel on this path —
//! dropping is entirely the address set's job.

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock;
use crate::counters::Counters;
use crate::source::{
    classify_frame, FrameVerdict, LoopControl, StopHandle, SynSource, SERVICE_INTERVAL,
};

const PKT_CAP: usize = 2048;

const fn op(code: u16, jt: u8, jf: u8, k: u32) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Classic BPF over the IP packet (SOCK_DGRAM delivery starts at the IP
/// header): pass iff protocol == TCP, SYN set, ACK clear.
const SYN_FILTER: [libc::sock_filter; 8] = [
    op(0x30, 0, 0, 9),      // ldb [9]         ; IP protocol
    op(0x15, 0, 5, 6),      // jne #TCP, drop
    op(0xb1, 0, 0, 0),      // ldx 4*([0]&0xf) ; IP header length
    op(0x50, 0, 0, 13),     // ldb [x+13]      ; TCP flags
    op(0x54, 0, 0, 0x12),   // and #(SYN|ACK)
    op(0x15, 0, 1, 0x02),   // jne #SYN, drop
    op(0x06, 0, 0, 0xffff), // accept
    op(0x06, 0, 0, 0),      // drop
];

pub struct RawSockSource {
    sock: Arc<Socket>,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl RawSockSource {
    /// Open, filter, and optionally bind the socket to one interface
    /// (`interface = ""` listens on all). Needs CAP_NET_RAW.
    pub fn new(interface: &str, counters: Arc<Counters>) -> Result<Self> {
        let proto = (libc::ETH_P_IP as u16).to_be() as i32;
        let sock = Socket::new(Domain::PACKET, Type::DGRAM, Some(Protocol::from(proto)))
            .context("failed to open packet socket (CAP_NET_RAW required)")?;
        let fd = sock.as_raw_fd();

        attach_filter(fd).context("failed to attach SYN filter")?;

        if !interface.is_empty() {
            bind_to_interface(fd, interface)
                .with_context(|| format!("failed to bind packet socket to {interface:?}"))?;
        }

        // Bounded read so stop requests and signal intents are serviced
        // within a second even on an idle link.
        sock.set_read_timeout(Some(Duration::from_secs(1)))?;

        info!(
            interface = if interface.is_empty() { "all" } else { interface },
            "raw packet source attached"
        );

        Ok(Self {
            sock: Arc::new(sock),
            stop: Arc::new(AtomicBool::new(false)),
            counters,
        })
    }
}

impl SynSource for RawSockSource {
    fn name(&self) -> &'static str {
        "rawsock"
    }

    fn run(
        &mut self,
        on_syn: &mut dyn FnMut(Ipv4Addr, u64),
        control: &mut dyn LoopControl,
    ) -> Result<()> {
        let fd = self.sock.as_raw_fd();
        let mut buf = vec![0u8; PKT_CAP];
        let mut since_service = 0u64;

        while !self.stop.load(Relaxed) {
            // SAFETY: buf is a valid mutable slice; recv writes at most
            // buf.len() bytes.
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted => {
                        if !control.service() {
                            break;
                        }
                        continue;
                    }
                    _ => {
                        if self.stop.load(Relaxed) {
                            break;
                        }
                        return Err(err).context("packet socket read failed");
                    }
                }
            }
            if n == 0 {
                if !control.service() {
                    break;
                }
                continue;
            }

            self.counters.total_packets.fetch_add(1, Relaxed);
            match classify_frame(&buf[..n as usize]) {
                FrameVerdict::Syn(addr) => on_syn(addr, clock::now_ns()),
                FrameVerdict::Skip => {}
                FrameVerdict::Malformed => {
                    self.counters.malformed_packets.fetch_add(1, Relaxed);
                }
            }

            since_service += 1;
            if since_service >= SERVICE_INTERVAL {
                since_service = 0;
                if !control.service() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.stop.clone(), self.sock.clone())
    }
}

fn attach_filter(fd: libc::c_int) -> Result<()> {
    let mut prog = SYN_FILTER;
    let fprog = libc::sock_fprog {
        len: prog.len() as libc::c_ushort,
        filter: prog.as_mut_ptr(),
    };
    // SAFETY: fprog points at a stack-local program that outlives the call;
    // the kernel copies it during setsockopt.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &fprog as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        bail!("SO_ATTACH_FILTER: {}", io::Error::last_os_error());
    }
    Ok(())
}

fn bind_to_interface(fd: libc::c_int, interface: &str) -> Result<()> {
    let name = std::ffi::CString::new(interface)?;
    // SAFETY: name is a valid NUL-terminated string.
    let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if ifindex == 0 {
        bail!("interface not found");
    }

    // SAFETY: zeroed sockaddr_ll is a valid all-defaults template.
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
    addr.sll_protocol = (libc::ETH_P_IP as u16).to_be();
    addr.sll_ifindex = ifindex as libc::c_int;

    // SAFETY: fd is a valid packet socket and addr a properly initialized
    // sockaddr_ll on the stack.
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        bail!("bind: {}", io::Error::last_os_error());
    }
    Ok(())
}
