//! Primary packet source: netfilter queue.
//!
//! The operator redirects inbound SYNs into a numbered queue; we bind that
//! queue over nfnetlink, receive each packet with its kernel id, extract the
//! IPv4 source address, and return an ACCEPT verdict once the pipeline has
//! seen the packet — blocking itself is the address set's job, so the
//! verdict is always ACCEPT.

use anyhow::{bail, Context, Result};
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use tracing::info;

use crate::clock;
use crate::counters::Counters;
use crate::events::LogLimiter;
use crate::netlink::{messages, MsgBuilder, NetlinkSocket, NlMsg, NLMSG_ERROR, NLM_F_ACK, NLM_F_REQUEST};
use crate::source::{
    classify_frame, FrameVerdict, LoopControl, StopHandle, SynSource, SERVICE_INTERVAL,
};

const NETLINK_NETFILTER: i32 = 12;
const NFNL_SUBSYS_QUEUE: u16 = 3;

const NFQNL_MSG_PACKET: u16 = 0;
const NFQNL_MSG_VERDICT: u16 = 1;
const NFQNL_MSG_CONFIG: u16 = 2;

const NFQA_PACKET_HDR: u16 = 1;
const NFQA_VERDICT_HDR: u16 = 2;
const NFQA_PAYLOAD: u16 = 10;

const NFQA_CFG_CMD: u16 = 1;
const NFQA_CFG_PARAMS: u16 = 2;

const NFQNL_CFG_CMD_BIND: u8 = 1;
const NFQNL_CFG_CMD_PF_BIND: u8 = 3;
const NFQNL_CFG_CMD_PF_UNBIND: u8 = 4;

const NFQNL_COPY_PACKET: u8 = 2;
const COPY_RANGE: u32 = 0xffff;

const NF_ACCEPT: u32 = 1;

const RECV_CAP: usize = 65536;

pub struct NfqueueSource {
    sock: Arc<NetlinkSocket>,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    queue_num: u16,
    seq: u32,
    limiter: LogLimiter,
}

impl NfqueueSource {
    /// Attach to the numbered queue: bind the protocol family and the queue,
    /// then request full-packet copies. Fatal if the queue cannot be bound.
    pub fn new(queue_num: u16, counters: Arc<Counters>) -> Result<Self> {
        let sock = NetlinkSocket::connect(NETLINK_NETFILTER)
            .context("failed to open netfilter netlink socket")?;
        sock.set_recv_timeout(1)?;

        let mut src = Self {
            sock: Arc::new(sock),
            stop: Arc::new(AtomicBool::new(false)),
            counters,
            queue_num,
            seq: 0,
            limiter: LogLimiter::new(),
        };

        // Historical rebind dance; a no-op on current kernels but harmless,
        // and required on the old ones.
        let _ = src.config_cmd(NFQNL_CFG_CMD_PF_UNBIND, libc::AF_INET as u16, 0);
        src.config_cmd(NFQNL_CFG_CMD_PF_BIND, libc::AF_INET as u16, 0)
            .context("failed to bind AF_INET to nfqueue")?;
        src.config_cmd(NFQNL_CFG_CMD_BIND, 0, queue_num)
            .with_context(|| format!("failed to bind nfqueue {queue_num}"))?;
        src.config_params(queue_num)
            .context("failed to set nfqueue copy mode")?;

        info!(queue = queue_num, "netfilter queue source attached");
        Ok(src)
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn config_cmd(&mut self, command: u8, pf: u16, queue: u16) -> Result<()> {
        let seq = self.next_seq();
        let family = if pf == 0 { libc::AF_UNSPEC } else { libc::AF_INET } as u8;
        let mut msg = MsgBuilder::new(
            (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_CONFIG,
            NLM_F_REQUEST | NLM_F_ACK,
            seq,
            family,
            queue,
        );
        // struct nfqnl_msg_config_cmd { u8 command; u8 pad; __be16 pf; }
        let mut payload = [0u8; 4];
        payload[0] = command;
        payload[2..4].copy_from_slice(&pf.to_be_bytes());
        msg.attr(NFQA_CFG_CMD, &payload);
        self.ack(msg)
    }

    fn config_params(&mut self, queue: u16) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = MsgBuilder::new(
            (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_CONFIG,
            NLM_F_REQUEST | NLM_F_ACK,
            seq,
            libc::AF_UNSPEC as u8,
            queue,
        );
        // struct nfqnl_msg_config_params { __be32 copy_range; u8 copy_mode; }
        // — packed, five bytes on the wire.
        let mut payload = [0u8; 5];
        payload[0..4].copy_from_slice(&COPY_RANGE.to_be_bytes());
        payload[4] = NFQNL_COPY_PACKET;
        msg.attr(NFQA_CFG_PARAMS, &payload);
        self.ack(msg)
    }

    fn ack(&self, msg: MsgBuilder) -> Result<()> {
        self.sock.send(&msg.finish())?;
        let mut buf = vec![0u8; 8192];
        let n = self.sock.recv(&mut buf)?;
        for reply in messages(&buf[..n]) {
            if reply.msg_type == NLMSG_ERROR {
                return match reply.error_code() {
                    Some(0) => Ok(()),
                    Some(code) => {
                        bail!("{}", io::Error::from_raw_os_error(-code))
                    }
                    None => bail!("truncated netlink ack"),
                };
            }
        }
        bail!("no netlink ack received")
    }

    /// ACCEPT the packet with the given kernel id.
    fn send_verdict(&mut self, packet_id: u32) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = MsgBuilder::new(
            (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_VERDICT,
            NLM_F_REQUEST,
            seq,
            libc::AF_UNSPEC as u8,
            self.queue_num,
        );
        // struct nfqnl_msg_verdict_hdr { __be32 verdict; __be32 id; }
        let mut payload = [0u8; 8];
        payload[0..4].copy_from_slice(&NF_ACCEPT.to_be_bytes());
        payload[4..8].copy_from_slice(&packet_id.to_be_bytes());
        msg.attr(NFQA_VERDICT_HDR, &payload);
        self.sock.send(&msg.finish())?;
        Ok(())
    }
}

impl SynSource for NfqueueSource {
    fn name(&self) -> &'static str {
        "nfqueue"
    }

    fn run(
        &mut self,
        on_syn: &mut dyn FnMut(Ipv4Addr, u64),
        control: &mut dyn LoopControl,
    ) -> Result<()> {
        let packet_type = (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET;
        let mut buf = vec![0u8; RECV_CAP];
        let mut since_service = 0u64;

        while !self.stop.load(Relaxed) {
            let n = match self.sock.recv(&mut buf) {
                Ok(0) => {
                    if !control.service() {
                        break;
                    }
                    continue;
                }
                Ok(n) => n,
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted => {
                        if !control.service() {
                            break;
                        }
                        continue;
                    }
                    // ENOBUFS: the queue overran our socket buffer; packets
                    // were dropped kernel-side but the stream continues.
                    _ if err.raw_os_error() == Some(libc::ENOBUFS) => {
                        self.limiter
                            .warn(clock::now_ns(), "nfqueue socket overrun, packets dropped");
                        continue;
                    }
                    _ => {
                        if self.stop.load(Relaxed) {
                            break;
                        }
                        return Err(err).context("nfqueue read failed");
                    }
                },
            };

            // One recv may carry several queued packets. Collect ids first;
            // each verdict goes back only after the pipeline has run.
            let mut pending: Vec<u32> = Vec::new();
            for msg in messages(&buf[..n]) {
                if msg.msg_type != packet_type {
                    continue;
                }
                let Some((packet_id, payload)) = parse_packet(&msg) else {
                    self.counters.malformed_packets.fetch_add(1, Relaxed);
                    continue;
                };
                self.counters.total_packets.fetch_add(1, Relaxed);
                match classify_frame(payload) {
                    FrameVerdict::Syn(addr) => on_syn(addr, clock::now_ns()),
                    FrameVerdict::Skip => {}
                    FrameVerdict::Malformed => {
                        self.counters.malformed_packets.fetch_add(1, Relaxed);
                    }
                }
                pending.push(packet_id);
                since_service += 1;
            }

            for id in pending {
                if let Err(e) = self.send_verdict(id) {
                    self.limiter
                        .warn(clock::now_ns(), &format!("verdict for packet {id} failed: {e}"));
                }
            }

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

/// Pull `(packet id, network-layer payload)` out of one queue message.
fn parse_packet<'a>(msg: &NlMsg<'a>) -> Option<(u32, &'a [u8])> {
    let mut packet_id = None;
    let mut payload = None;
    // Skip the 4-byte nfgenmsg.
    for attr in msg.attrs(4) {
        match attr.kind() {
            NFQA_PACKET_HDR => {
                // struct nfqnl_msg_packet_hdr { __be32 packet_id; __be16
                // hw_protocol; u8 hook; }
                let raw = attr.payload.get(..4)?;
                packet_id = Some(u32::from_be_bytes(raw.try_into().ok()?));
            }
            NFQA_PAYLOAD => payload = Some(attr.payload),
            _ => {}
        }
    }
    Some((packet_id?, payload?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_msg(packet_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut msg = MsgBuilder::new(
            (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET,
            0,
            1,
            libc::AF_UNSPEC as u8,
            0,
        );
        let mut hdr = [0u8; 7];
        hdr[0..4].copy_from_slice(&packet_id.to_be_bytes());
        hdr[4..6].copy_from_slice(&0x0800u16.to_be_bytes());
        hdr[6] = 1; // hook
        msg.attr(NFQA_PACKET_HDR, &hdr);
        msg.attr(NFQA_PAYLOAD, payload);
        msg.finish()
    }

    #[test]
    fn test_parse_packet_extracts_id_and_payload() {
        let wire = packet_msg(0xDEAD_BEEF, &[0x45, 0x00, 0x01]);
        let msg = messages(&wire).next().unwrap();
        let (id, payload) = parse_packet(&msg).unwrap();
        assert_eq!(id, 0xDEAD_BEEF);
        assert_eq!(payload, &[0x45, 0x00, 0x01]);
    }

    #[test]
    fn test_parse_packet_requires_both_attrs() {
        let mut msg = MsgBuilder::new(
            (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET,
            0,
            1,
            libc::AF_UNSPEC as u8,
            0,
        );
        let mut hdr = [0u8; 7];
        hdr[0..4].copy_from_slice(&7u32.to_be_bytes());
        msg.attr(NFQA_PACKET_HDR, &hdr);
        let wire = msg.finish();
        let msg = messages(&wire).next().unwrap();
        assert!(parse_packet(&msg).is_none());
    }

    #[test]
    fn test_verdict_wire_shape() {
        // The verdict header is two big-endian words: verdict then id.
        let mut payload = [0u8; 8];
        payload[0..4].copy_from_slice(&NF_ACCEPT.to_be_bytes());
        payload[4..8].copy_from_slice(&42u32.to_be_bytes());
        assert_eq!(u32::from_be_bytes(payload[0..4].try_into().unwrap()), 1);
        assert_eq!(u32::from_be_bytes(payload[4..8].try_into().unwrap()), 42);
    }

    #[test]
    fn test_config_params_payload_is_packed() {
        let mut payload = [0u8; 5];
        payload[0..4].copy_from_slice(&COPY_RANGE.to_be_bytes());
        payload[4] = NFQNL_COPY_PACKET;
        assert_eq!(payload, [0x00, 0x00, 0xff, 0xff, 0x02]);
    }

    #[test]
    fn test_queue_message_type_constant() {
        assert_eq!((NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET, 0x0300);
        assert_eq!((NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_VERDICT, 0x0301);
    }
}
