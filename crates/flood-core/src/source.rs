//! Pluggable SYN packet source abstraction.
//!
//! Two interchangeable implementations produce the `(source address,
//! arrival time)` stream the pipeline consumes: the netfilter queue
//! ([`crate::nfqueue::NfqueueSource`], primary) and a filtered raw packet
//! socket ([`crate::rawsock::RawSockSource`], fallback). Selection happens
//! once at startup from configuration.

use anyhow::Result;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How often the read loop hands control back to the supervisor, in packets.
pub const SERVICE_INTERVAL: u64 = 1000;

/// Supervisor hook driven from inside the packet loop.
pub trait LoopControl: Send {
    /// Service pending signal intents. Called every [`SERVICE_INTERVAL`]
    /// packets and whenever the read wakes up empty. Returns false when the
    /// loop should exit.
    fn service(&mut self) -> bool;
}

/// A blocking SYN event source.
pub trait SynSource: Send {
    fn name(&self) -> &'static str;

    /// Read packets until stopped, invoking `on_syn` for every SYN segment
    /// observed. The loop owns its thread; it returns only after
    /// [`StopHandle::stop`] fires or `control.service()` says to exit.
    fn run(
        &mut self,
        on_syn: &mut dyn FnMut(Ipv4Addr, u64),
        control: &mut dyn LoopControl,
    ) -> Result<()>;

    /// Handle another thread can use to unblock the read and stop the loop.
    fn stop_handle(&self) -> StopHandle;
}

/// Wakes a blocked read so a stop request takes effect promptly.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

impl Interrupt for socket2::Socket {
    fn interrupt(&self) {
        use std::os::unix::io::AsRawFd;
        // SAFETY: shutdown is safe on any valid socket fd.
        unsafe {
            libc::shutdown(self.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

impl Interrupt for crate::netlink::NetlinkSocket {
    fn interrupt(&self) {
        crate::netlink::NetlinkSocket::interrupt(self);
    }
}

#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<dyn Interrupt>,
}

impl StopHandle {
    pub fn new(stop: Arc<AtomicBool>, waker: Arc<dyn Interrupt>) -> Self {
        Self { stop, waker }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.waker.interrupt();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// What one delivered frame turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    /// IPv4 TCP segment with SYN set and ACK clear; carries the source.
    Syn(Ipv4Addr),
    /// Well-formed but not our traffic: IPv6, non-TCP, or a non-SYN segment
    /// that leaked through a loose filter.
    Skip,
    /// Too short or structurally broken to classify.
    Malformed,
}

/// Classify a network-layer frame (starting at the IP header).
pub fn classify_frame(frame: &[u8]) -> FrameVerdict {
    if frame.len() < 20 {
        return FrameVerdict::Malformed;
    }
    let version = frame[0] >> 4;
    if version == 6 {
        return FrameVerdict::Skip;
    }
    if version != 4 {
        return FrameVerdict::Malformed;
    }
    let ihl = ((frame[0] & 0x0f) as usize) * 4;
    if ihl < 20 || frame.len() < ihl {
        return FrameVerdict::Malformed;
    }
    if frame[9] != libc::IPPROTO_TCP as u8 {
        return FrameVerdict::Skip;
    }
    // Need the TCP header at least through the flags byte.
    if frame.len() < ihl + 14 {
        return FrameVerdict::Malformed;
    }
    let flags = frame[ihl + 13];
    // SYN set, ACK clear — the first packet of a handshake and nothing else.
    if flags & 0x12 != 0x02 {
        return FrameVerdict::Skip;
    }
    FrameVerdict::Syn(Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal IPv4+TCP frame with the given source address and TCP flags.
    fn tcp_frame(src: Ipv4Addr, flags: u8) -> Vec<u8> {
        let mut f = vec![0u8; 40];
        f[0] = 0x45; // v4, ihl=5
        f[9] = 6; // TCP
        f[12..16].copy_from_slice(&src.octets());
        f[16..20].copy_from_slice(&[10, 0, 0, 1]);
        f[33] = flags; // 20 + 13
        f
    }

    #[test]
    fn test_syn_frame_classified() {
        let src = Ipv4Addr::new(203, 0, 113, 100);
        assert_eq!(
            classify_frame(&tcp_frame(src, 0x02)),
            FrameVerdict::Syn(src)
        );
    }

    #[test]
    fn test_syn_ack_and_ack_skipped() {
        let src = Ipv4Addr::new(203, 0, 113, 100);
        assert_eq!(classify_frame(&tcp_frame(src, 0x12)), FrameVerdict::Skip);
        assert_eq!(classify_frame(&tcp_frame(src, 0x10)), FrameVerdict::Skip);
        // RST, FIN — not handshake openers either.
        assert_eq!(classify_frame(&tcp_frame(src, 0x04)), FrameVerdict::Skip);
        assert_eq!(classify_frame(&tcp_frame(src, 0x01)), FrameVerdict::Skip);
    }

    #[test]
    fn test_syn_with_other_bits_still_counts() {
        // SYN+ECE+CWR is a normal ECN-setup SYN.
        let src = Ipv4Addr::new(198, 51, 100, 7);
        assert_eq!(
            classify_frame(&tcp_frame(src, 0xC2)),
            FrameVerdict::Syn(src)
        );
    }

    #[test]
    fn test_non_tcp_skipped() {
        let mut f = tcp_frame(Ipv4Addr::new(10, 0, 0, 2), 0x02);
        f[9] = 17; // UDP
        assert_eq!(classify_frame(&f), FrameVerdict::Skip);
    }

    #[test]
    fn test_ipv6_skipped() {
        let mut f = vec![0u8; 60];
        f[0] = 0x60;
        assert_eq!(classify_frame(&f), FrameVerdict::Skip);
    }

    #[test]
    fn test_short_and_broken_frames_malformed() {
        assert_eq!(classify_frame(&[]), FrameVerdict::Malformed);
        assert_eq!(classify_frame(&[0x45; 10]), FrameVerdict::Malformed);
        // Bad version nibble.
        let mut f = tcp_frame(Ipv4Addr::new(10, 0, 0, 2), 0x02);
        f[0] = 0x15;
        assert_eq!(classify_frame(&f), FrameVerdict::Malformed);
        // IHL shorter than the minimum header.
        let mut f = tcp_frame(Ipv4Addr::new(10, 0, 0, 2), 0x02);
        f[0] = 0x44;
        assert_eq!(classify_frame(&f), FrameVerdict::Malformed);
        // Truncated before the TCP flags byte.
        let f = tcp_frame(Ipv4Addr::new(10, 0, 0, 2), 0x02);
        assert_eq!(classify_frame(&f[..24]), FrameVerdict::Malformed);
    }

    #[test]
    fn test_ihl_with_options_respected() {
        // ihl=6 (24-byte IP header): flags move 4 bytes further out.
        let src = Ipv4Addr::new(192, 0, 2, 33);
        let mut f = vec![0u8; 44];
        f[0] = 0x46;
        f[9] = 6;
        f[12..16].copy_from_slice(&src.octets());
        f[24 + 13] = 0x02;
        assert_eq!(classify_frame(&f), FrameVerdict::Syn(src));
    }

    #[test]
    fn test_stop_handle() {
        struct NoopWaker;
        impl Interrupt for NoopWaker {
            fn interrupt(&self) {}
        }
        let handle = StopHandle::new(Arc::new(AtomicBool::new(false)), Arc::new(NoopWaker));
        assert!(!handle.is_stopped());
        handle.clone().stop();
        assert!(handle.is_stopped());
    }
}
