//! Canonical identity of a flow, decoded from the frames a switch hands to the
//! controller.
//!
//! Keys are directional: a key describes the client → service direction as it
//! enters the switch. Return traffic is recognized by the controller through
//! [`FlowKey::reversed`], never by folding both directions into one key.

use std::fmt;
use std::net::Ipv4Addr;

use crate::bits::{combine, mix64};
use crate::error::LbError;
use crate::openflow0x01::Pattern;
use crate::packet::{eth_typ, ip_proto, Nw, Packet, Tp};

/// The transport 5-tuple of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(proto: u8, src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> FlowKey {
        FlowKey {
            proto,
            src,
            dst,
            src_port,
            dst_port,
        }
    }

    /// Decode the key of a raw ethernet frame.
    pub fn from_frame(raw: &[u8]) -> Result<FlowKey, LbError> {
        let pkt = Packet::parse(raw)?;
        FlowKey::from_packet(&pkt)
    }

    /// Extract the key of an already parsed packet.
    ///
    /// ICMP has no ports; both are zero in its key.
    pub fn from_packet(pkt: &Packet) -> Result<FlowKey, LbError> {
        let ip = match pkt.nw {
            Nw::Ip(ref ip) => ip,
            _ => {
                return Err(LbError::MalformedHeader(format!(
                    "unsupported ethertype {:#06x}",
                    pkt.dl_typ
                )))
            }
        };
        let (src_port, dst_port) = match ip.tp {
            Tp::Tcp(ref tcp) => (tcp.src, tcp.dst),
            Tp::Udp(ref udp) => (udp.src, udp.dst),
            Tp::Icmp(_) => (0, 0),
            Tp::Unparsable(proto) => {
                return Err(LbError::MalformedHeader(format!(
                    "unsupported IP protocol {}",
                    proto
                )))
            }
        };
        Ok(FlowKey {
            proto: ip.proto,
            src: Ipv4Addr::from(ip.src),
            dst: Ipv4Addr::from(ip.dst),
            src_port,
            dst_port,
        })
    }

    /// The key of the opposite direction.
    pub fn reversed(&self) -> FlowKey {
        FlowKey {
            proto: self.proto,
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }

    fn has_ports(&self) -> bool {
        self.proto == ip_proto::TCP || self.proto == ip_proto::UDP
    }

    /// The exact-match OpenFlow pattern for this key.
    ///
    /// ICMP keys leave the transport fields wildcarded, since OpenFlow 1.0
    /// reuses them for ICMP type and code.
    pub fn to_pattern(&self) -> Pattern {
        let ports = self.has_ports();
        Pattern {
            dl_typ: Some(eth_typ::IP),
            nw_proto: Some(self.proto),
            nw_src: Some(u32::from(self.src)),
            nw_dst: Some(u32::from(self.dst)),
            tp_src: if ports { Some(self.src_port) } else { None },
            tp_dst: if ports { Some(self.dst_port) } else { None },
            ..Pattern::match_all()
        }
    }

    /// Recover a key from a pattern previously built with [`FlowKey::to_pattern`].
    ///
    /// Returns `None` for patterns that do not pin down a whole flow.
    pub fn from_pattern(p: &Pattern) -> Option<FlowKey> {
        if p.dl_typ != Some(eth_typ::IP) {
            return None;
        }
        let proto = p.nw_proto?;
        let src = Ipv4Addr::from(p.nw_src?);
        let dst = Ipv4Addr::from(p.nw_dst?);
        let key = if proto == ip_proto::TCP || proto == ip_proto::UDP {
            FlowKey::new(proto, src, p.tp_src?, dst, p.tp_dst?)
        } else {
            FlowKey::new(proto, src, 0, dst, 0)
        };
        Some(key)
    }

    /// A hash of the key that is stable across processes.
    pub fn stable_hash(&self) -> u64 {
        let addrs = ((u32::from(self.src) as u64) << 32) | u32::from(self.dst) as u64;
        let rest = ((self.proto as u64) << 32)
            | ((self.src_port as u64) << 16)
            | self.dst_port as u64;
        combine(mix64(addrs), rest)
    }

    /// Index in `0..n` of the worker responsible for this key. Both
    /// directions of a flow land on the same worker.
    pub fn shard(&self, n: usize) -> usize {
        let canonical = (*self).min(self.reversed());
        (canonical.stable_hash() % n.max(1) as u64) as usize
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let proto = match self.proto {
            ip_proto::TCP => "tcp",
            ip_proto::UDP => "udp",
            ip_proto::ICMP => "icmp",
            _ => "ip",
        };
        write!(
            f,
            "{} {}:{} -> {}:{}",
            proto, self.src, self.src_port, self.dst, self.dst_port
        )
    }
}
