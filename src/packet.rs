use std::io::{BufRead, Cursor, Read};
use std::mem::size_of;

use byteorder::{BigEndian, ReadBytesExt};

use crate::bits::test_bit;
use crate::error::OfpError;

/// Network-order bytes of a MAC address stored in the low 48 bits of `addr`.
pub fn bytes_of_mac(addr: u64) -> [u8; 6] {
    let mut arr = [0; 6];
    for (i, b) in arr.iter_mut().enumerate() {
        *b = ((addr >> (8 * (5 - i))) & 0xff) as u8;
    }
    arr
}

pub fn mac_of_bytes(addr: [u8; 6]) -> u64 {
    addr.iter().fold(0, |acc, &b| (acc << 8) | b as u64)
}

/// TCP Header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlags {
    /// ECN-nonce concealment protection.
    pub ns: bool,
    /// Congestion window reduced.
    pub cwr: bool,
    /// ECN-Echo.
    pub ece: bool,
    /// Indicates the Urgent pointer field is significant.
    pub urg: bool,
    /// Indicates that the Acknowledgment field is significant.
    pub ack: bool,
    /// Asks to push the buffered data to the receiving application.
    pub psh: bool,
    /// Reset the connection.
    pub rst: bool,
    /// Synchronize sequence numbers.
    pub syn: bool,
    /// No more data from sender.
    pub fin: bool,
}

impl TcpFlags {
    fn of_int(d: u16) -> TcpFlags {
        let d = d as u64;
        TcpFlags {
            ns: test_bit(8, d),
            cwr: test_bit(7, d),
            ece: test_bit(6, d),
            urg: test_bit(5, d),
            ack: test_bit(4, d),
            psh: test_bit(3, d),
            rst: test_bit(2, d),
            syn: test_bit(1, d),
            fin: test_bit(0, d),
        }
    }
}

/// TCP segment header. Options and payload are not retained.
#[derive(Debug, Clone)]
pub struct Tcp {
    pub src: u16,
    pub dst: u16,
    pub seq: u32,
    pub ack: u32,
    pub offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
}

#[repr(C, packed)]
struct TcpNet(u16, u16, u32, u32, u16, u16, u16, u16);

impl Tcp {
    fn parse(bytes: &mut Cursor<&[u8]>) -> Result<Tcp, OfpError> {
        if remaining(bytes) < size_of::<TcpNet>() {
            return Err(OfpError::Truncated("TCP header"));
        }
        let src = bytes.read_u16::<BigEndian>()?;
        let dst = bytes.read_u16::<BigEndian>()?;
        let seq = bytes.read_u32::<BigEndian>()?;
        let ack = bytes.read_u32::<BigEndian>()?;
        let offset_and_flags = bytes.read_u16::<BigEndian>()?;
        let window = bytes.read_u16::<BigEndian>()?;
        Ok(Tcp {
            src,
            dst,
            seq,
            ack,
            offset: (offset_and_flags >> 12) as u8,
            flags: TcpFlags::of_int(offset_and_flags & 0x01ff),
            window,
        })
    }
}

/// UDP datagram header.
#[derive(Debug, Clone)]
pub struct Udp {
    pub src: u16,
    pub dst: u16,
    pub chksum: u16,
}

impl Udp {
    fn size_of() -> usize {
        8
    }

    fn parse(bytes: &mut Cursor<&[u8]>) -> Result<Udp, OfpError> {
        if remaining(bytes) < Self::size_of() {
            return Err(OfpError::Truncated("UDP header"));
        }
        let src = bytes.read_u16::<BigEndian>()?;
        let dst = bytes.read_u16::<BigEndian>()?;
        bytes.consume(2);
        let chksum = bytes.read_u16::<BigEndian>()?;
        Ok(Udp { src, dst, chksum })
    }
}

/// ICMP message header.
#[derive(Debug, Clone)]
pub struct Icmp {
    pub typ: u8,
    pub code: u8,
    pub chksum: u16,
}

impl Icmp {
    fn size_of() -> usize {
        4
    }

    fn parse(bytes: &mut Cursor<&[u8]>) -> Result<Icmp, OfpError> {
        if remaining(bytes) < Self::size_of() {
            return Err(OfpError::Truncated("ICMP header"));
        }
        Ok(Icmp {
            typ: bytes.read_u8()?,
            code: bytes.read_u8()?,
            chksum: bytes.read_u16::<BigEndian>()?,
        })
    }
}

/// Represents packets at the transport protocol level, which are encapsulated
/// within the IPv4 payload. At present, we only support TCP, UDP, and ICMP
/// explicitly; otherwise, the IPv4 protocol number is provided.
#[derive(Debug, Clone)]
pub enum Tp {
    Tcp(Tcp),
    Udp(Udp),
    Icmp(Icmp),
    Unparsable(u8),
}

/// The type of IPv4 flags.
#[derive(Debug, Clone, Copy)]
pub struct Flags {
    pub dont_fragment: bool,
    pub more_fragments: bool,
}

impl Flags {
    fn of_int(flags: u16) -> Flags {
        Flags {
            dont_fragment: test_bit(1, flags as u64),
            more_fragments: test_bit(0, flags as u64),
        }
    }
}

/// IPv4 frame of a packet.
#[derive(Debug, Clone)]
pub struct Ip {
    pub tos: u8,
    pub ident: u16,
    pub flags: Flags,
    pub frag: u16,
    pub ttl: u8,
    pub proto: u8,
    pub chksum: u16,
    pub src: u32,
    pub dst: u32,
    pub tp: Tp,
}

/// IPv4 protocol numbers with a dedicated transport parser.
pub mod ip_proto {
    pub const ICMP: u8 = 0x01;
    pub const TCP: u8 = 0x06;
    pub const UDP: u8 = 0x11;
}

#[repr(C, packed)]
struct IpNet(u8, u8, u16, u16, u16, u8, u8, u16, u32, u32);

impl Ip {
    fn parse(bytes: &mut Cursor<&[u8]>) -> Result<Ip, OfpError> {
        if remaining(bytes) < size_of::<IpNet>() {
            return Err(OfpError::Truncated("IPv4 header"));
        }
        let vhl = bytes.read_u8()?;
        if (vhl >> 4) != 4 {
            return Err(OfpError::InvalidField {
                field: "IP version",
                value: (vhl >> 4) as u64,
            });
        }
        let header_len = (vhl & 0x0f) as usize * 4;
        if header_len < size_of::<IpNet>() {
            return Err(OfpError::InvalidField {
                field: "IPv4 header length",
                value: header_len as u64,
            });
        }
        let tos = bytes.read_u8()?;
        bytes.consume(2);
        let ident = bytes.read_u16::<BigEndian>()?;
        let frag = bytes.read_u16::<BigEndian>()?;
        let ttl = bytes.read_u8()?;
        let proto = bytes.read_u8()?;
        let chksum = bytes.read_u16::<BigEndian>()?;
        let src = bytes.read_u32::<BigEndian>()?;
        let dst = bytes.read_u32::<BigEndian>()?;
        let options_len = header_len - size_of::<IpNet>();
        if remaining(bytes) < options_len {
            return Err(OfpError::Truncated("IPv4 options"));
        }
        bytes.consume(options_len);
        let tp = match proto {
            ip_proto::ICMP => Tp::Icmp(Icmp::parse(bytes)?),
            ip_proto::TCP => Tp::Tcp(Tcp::parse(bytes)?),
            ip_proto::UDP => Tp::Udp(Udp::parse(bytes)?),
            _ => Tp::Unparsable(proto),
        };
        Ok(Ip {
            tos,
            ident,
            flags: Flags::of_int(frag >> 13),
            frag: frag & 0x1fff,
            ttl,
            proto,
            chksum,
            src,
            dst,
            tp,
        })
    }
}

/// Address resolution protocol (ARP) packet payload.
#[derive(Debug, Clone)]
pub enum Arp {
    Query(u64, u32, u32),
    Reply(u64, u32, u64, u32),
}

#[repr(C, packed)]
struct ArpNet(u16, u16, u8, u8, u16, [u8; 6], u32, [u8; 6], u32);

impl Arp {
    fn parse(bytes: &mut Cursor<&[u8]>) -> Result<Arp, OfpError> {
        if remaining(bytes) < size_of::<ArpNet>() {
            return Err(OfpError::Truncated("ARP packet"));
        }
        bytes.consume(6);
        let oper = bytes.read_u16::<BigEndian>()?;
        let mut sha = [0u8; 6];
        bytes.read_exact(&mut sha)?;
        let spa = bytes.read_u32::<BigEndian>()?;
        let mut tha = [0u8; 6];
        bytes.read_exact(&mut tha)?;
        let tpa = bytes.read_u32::<BigEndian>()?;
        match oper {
            0x0001 => Ok(Arp::Query(mac_of_bytes(sha), spa, tpa)),
            0x0002 => Ok(Arp::Reply(mac_of_bytes(sha), spa, mac_of_bytes(tha), tpa)),
            op => Err(OfpError::InvalidField {
                field: "ARP operation",
                value: op as u64,
            }),
        }
    }
}

/// Represents a packet at the network protocol level.
#[derive(Debug, Clone)]
pub enum Nw {
    Ip(Ip),
    Arp(Arp),
    Unparsable(u16),
}

/// Represents a packet at the ethernet protocol level.
#[derive(Debug, Clone)]
pub struct Packet {
    pub dl_src: u64,
    pub dl_dst: u64,
    pub dl_vlan: Option<u16>,
    pub dl_vlan_dei: bool,
    pub dl_vlan_pcp: u8,
    pub dl_typ: u16,
    pub nw: Nw,
}

/// EtherType values the parser understands.
pub mod eth_typ {
    pub const IP: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const VLAN: u16 = 0x8100;
}

fn remaining(bytes: &Cursor<&[u8]>) -> usize {
    bytes.get_ref().len().saturating_sub(bytes.position() as usize)
}

impl Packet {
    /// Parse an ethernet frame down to its transport header.
    ///
    /// Fails with `Truncated` when a header the frame declares does not fit.
    /// Unknown EtherTypes and IP protocols are kept as `Unparsable`.
    pub fn parse(buf: &[u8]) -> Result<Packet, OfpError> {
        let mut bytes = Cursor::new(buf);
        if buf.len() < 14 {
            return Err(OfpError::Truncated("ethernet header"));
        }
        let mut dst = [0u8; 6];
        bytes.read_exact(&mut dst)?;
        let mut src = [0u8; 6];
        bytes.read_exact(&mut src)?;
        let typ = bytes.read_u16::<BigEndian>()?;
        let (tag, dei, pcp, typ) = match typ {
            eth_typ::VLAN => {
                let tag_and_pcp = bytes.read_u16::<BigEndian>()?;
                let tag = tag_and_pcp & 0xfff;
                let dei = (tag_and_pcp & 0x1000) > 0;
                let pcp = tag_and_pcp >> 13;
                let typ = bytes.read_u16::<BigEndian>()?;
                (Some(tag), dei, pcp as u8, typ)
            }
            _ => (None, false, 0x0, typ),
        };
        let nw = match typ {
            eth_typ::IP => Nw::Ip(Ip::parse(&mut bytes)?),
            eth_typ::ARP => Nw::Arp(Arp::parse(&mut bytes)?),
            _ => Nw::Unparsable(typ),
        };
        Ok(Packet {
            dl_src: mac_of_bytes(src),
            dl_dst: mac_of_bytes(dst),
            dl_vlan: tag,
            dl_vlan_dei: dei,
            dl_vlan_pcp: pcp,
            dl_typ: typ,
            nw,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an untagged ethernet + IPv4 frame with the given transport bytes.
    pub(crate) fn ipv4_frame(proto: u8, src: u32, dst: u32, transport: &[u8]) -> Vec<u8> {
        let mut f = vec![];
        f.extend_from_slice(&bytes_of_mac(0x0000_0000_00bb));
        f.extend_from_slice(&bytes_of_mac(0x0000_0000_00aa));
        f.extend_from_slice(&eth_typ::IP.to_be_bytes());
        f.push(0x45);
        f.push(0);
        f.extend_from_slice(&((20 + transport.len()) as u16).to_be_bytes());
        f.extend_from_slice(&[0, 1, 0x40, 0, 64, proto, 0, 0]);
        f.extend_from_slice(&src.to_be_bytes());
        f.extend_from_slice(&dst.to_be_bytes());
        f.extend_from_slice(transport);
        f
    }

    pub(crate) fn tcp_segment(sport: u16, dport: u16) -> Vec<u8> {
        let mut t = vec![];
        t.extend_from_slice(&sport.to_be_bytes());
        t.extend_from_slice(&dport.to_be_bytes());
        t.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0]);
        // data offset 5, SYN
        t.extend_from_slice(&[0x50, 0x02, 0xff, 0xff, 0, 0, 0, 0]);
        t
    }

    #[test]
    fn mac_bytes_roundtrip() {
        let mac = 0x0011_2233_4455;
        assert_eq!(bytes_of_mac(mac), [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(mac_of_bytes(bytes_of_mac(mac)), mac);
    }

    #[test]
    fn parses_tcp_syn() {
        let frame = ipv4_frame(ip_proto::TCP, 0x0a00_0001, 0x0a01_0101, &tcp_segment(5555, 80));
        let pkt = Packet::parse(&frame).unwrap();
        assert_eq!(pkt.dl_src, 0xaa);
        match pkt.nw {
            Nw::Ip(ref ip) => {
                assert_eq!(ip.src, 0x0a00_0001);
                assert!(ip.flags.dont_fragment);
                match ip.tp {
                    Tp::Tcp(ref tcp) => {
                        assert_eq!((tcp.src, tcp.dst), (5555, 80));
                        assert!(tcp.flags.syn);
                        assert!(!tcp.flags.ack);
                        assert_eq!(tcp.offset, 5);
                    }
                    ref other => panic!("expected TCP, got {:?}", other),
                }
            }
            ref other => panic!("expected IPv4, got {:?}", other),
        }
    }

    #[test]
    fn truncated_transport_is_an_error() {
        let frame = ipv4_frame(ip_proto::TCP, 1, 2, &[0, 80, 0]);
        assert!(matches!(Packet::parse(&frame), Err(OfpError::Truncated(_))));
    }

    #[test]
    fn short_frame_is_an_error() {
        assert!(Packet::parse(&[0; 10]).is_err());
    }
}
