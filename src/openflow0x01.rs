use std::io::{BufRead, Cursor, Read};
use std::mem::size_of;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::bits::{bit, test_bit};
use crate::error::OfpError;
use crate::packet::{bytes_of_mac, mac_of_bytes};

/// OpenFlow 1.0 message type codes, used by headers to identify meaning of the rest of a message.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MsgCode {
    Hello,
    Error,
    EchoReq,
    EchoResp,
    Vendor,
    FeaturesReq,
    FeaturesResp,
    GetConfigReq,
    GetConfigResp,
    SetConfig,
    PacketIn,
    FlowRemoved,
    PortStatus,
    PacketOut,
    FlowMod,
    PortMod,
    StatsReq,
    StatsResp,
    BarrierReq,
    BarrierResp,
    QueueGetConfigReq,
    QueueGetConfigResp,
}

impl TryFrom<u8> for MsgCode {
    type Error = OfpError;

    fn try_from(code: u8) -> Result<MsgCode, OfpError> {
        const CODES: [MsgCode; 22] = [
            MsgCode::Hello,
            MsgCode::Error,
            MsgCode::EchoReq,
            MsgCode::EchoResp,
            MsgCode::Vendor,
            MsgCode::FeaturesReq,
            MsgCode::FeaturesResp,
            MsgCode::GetConfigReq,
            MsgCode::GetConfigResp,
            MsgCode::SetConfig,
            MsgCode::PacketIn,
            MsgCode::FlowRemoved,
            MsgCode::PortStatus,
            MsgCode::PacketOut,
            MsgCode::FlowMod,
            MsgCode::PortMod,
            MsgCode::StatsReq,
            MsgCode::StatsResp,
            MsgCode::BarrierReq,
            MsgCode::BarrierResp,
            MsgCode::QueueGetConfigReq,
            MsgCode::QueueGetConfigResp,
        ];
        CODES
            .get(code as usize)
            .copied()
            .ok_or(OfpError::UnknownMsgCode(code))
    }
}

/// Common API for message types implementing OpenFlow Message Codes (see `MsgCode` enum).
pub trait MessageType: Sized {
    /// Return the byte-size of a message.
    fn size_of(msg: &Self) -> usize;
    /// Parse a buffer into a message.
    fn parse(buf: &[u8]) -> Result<Self, OfpError>;
    /// Marshal a message into a `u8` buffer.
    fn marshal(msg: Self, bytes: &mut Vec<u8>);
}

#[repr(C, packed)]
struct OfpMatch(u32, u16, [u8; 6], [u8; 6], u16, u8, u8, u16, u8, u8, u16, u32, u32, u16, u16);

/// Wildcard bits of `ofp_match`.
mod wildcard {
    pub const IN_PORT: u64 = 0;
    pub const DL_VLAN: u64 = 1;
    pub const DL_SRC: u64 = 2;
    pub const DL_DST: u64 = 3;
    pub const DL_TYPE: u64 = 4;
    pub const NW_PROTO: u64 = 5;
    pub const TP_SRC: u64 = 6;
    pub const TP_DST: u64 = 7;
    pub const NW_SRC_SHIFT: u32 = 8;
    pub const NW_DST_SHIFT: u32 = 14;
    pub const DL_VLAN_PCP: u64 = 20;
    pub const NW_TOS: u64 = 21;
}

/// Fields to match against flows.
///
/// `None` wildcards a field. Network addresses are either exact or fully
/// wildcarded; partial prefixes reported by a switch parse as wildcards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pattern {
    pub dl_src: Option<u64>,
    pub dl_dst: Option<u64>,
    pub dl_typ: Option<u16>,
    pub dl_vlan: Option<u16>,
    pub dl_vlan_pcp: Option<u8>,
    pub nw_src: Option<u32>,
    pub nw_dst: Option<u32>,
    pub nw_proto: Option<u8>,
    pub nw_tos: Option<u8>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
    pub in_port: Option<u16>,
}

impl Pattern {
    /// A pattern wildcarding every field.
    pub fn match_all() -> Pattern {
        Pattern::default()
    }

    fn wildcards_of(p: &Pattern) -> u32 {
        let mut w: u64 = 0;
        w = bit(wildcard::IN_PORT, w, p.in_port.is_none());
        w = bit(wildcard::DL_VLAN, w, p.dl_vlan.is_none());
        w = bit(wildcard::DL_SRC, w, p.dl_src.is_none());
        w = bit(wildcard::DL_DST, w, p.dl_dst.is_none());
        w = bit(wildcard::DL_TYPE, w, p.dl_typ.is_none());
        w = bit(wildcard::NW_PROTO, w, p.nw_proto.is_none());
        w = bit(wildcard::TP_SRC, w, p.tp_src.is_none());
        w = bit(wildcard::TP_DST, w, p.tp_dst.is_none());
        w = bit(wildcard::DL_VLAN_PCP, w, p.dl_vlan_pcp.is_none());
        w = bit(wildcard::NW_TOS, w, p.nw_tos.is_none());
        let mut w = w as u32;
        if p.nw_src.is_none() {
            w |= 32 << wildcard::NW_SRC_SHIFT;
        }
        if p.nw_dst.is_none() {
            w |= 32 << wildcard::NW_DST_SHIFT;
        }
        w
    }

    pub fn marshal(p: Pattern, bytes: &mut Vec<u8>) {
        let _ = bytes.write_u32::<BigEndian>(Pattern::wildcards_of(&p));
        let _ = bytes.write_u16::<BigEndian>(p.in_port.unwrap_or(0));
        bytes.extend_from_slice(&bytes_of_mac(p.dl_src.unwrap_or(0)));
        bytes.extend_from_slice(&bytes_of_mac(p.dl_dst.unwrap_or(0)));
        let _ = bytes.write_u16::<BigEndian>(p.dl_vlan.unwrap_or(0xffff));
        let _ = bytes.write_u8(p.dl_vlan_pcp.unwrap_or(0));
        let _ = bytes.write_u8(0);
        let _ = bytes.write_u16::<BigEndian>(p.dl_typ.unwrap_or(0));
        let _ = bytes.write_u8(p.nw_tos.unwrap_or(0));
        let _ = bytes.write_u8(p.nw_proto.unwrap_or(0));
        bytes.extend_from_slice(&[0; 2]);
        let _ = bytes.write_u32::<BigEndian>(p.nw_src.unwrap_or(0));
        let _ = bytes.write_u32::<BigEndian>(p.nw_dst.unwrap_or(0));
        let _ = bytes.write_u16::<BigEndian>(p.tp_src.unwrap_or(0));
        let _ = bytes.write_u16::<BigEndian>(p.tp_dst.unwrap_or(0));
    }

    pub fn parse(bytes: &mut Cursor<&[u8]>) -> Result<Pattern, OfpError> {
        let w = bytes.read_u32::<BigEndian>()?;
        let wild = |b: u64| test_bit(b, w as u64);
        let in_port = bytes.read_u16::<BigEndian>()?;
        let mut dl_src = [0u8; 6];
        bytes.read_exact(&mut dl_src)?;
        let mut dl_dst = [0u8; 6];
        bytes.read_exact(&mut dl_dst)?;
        let dl_vlan = bytes.read_u16::<BigEndian>()?;
        let dl_vlan_pcp = bytes.read_u8()?;
        bytes.consume(1);
        let dl_typ = bytes.read_u16::<BigEndian>()?;
        let nw_tos = bytes.read_u8()?;
        let nw_proto = bytes.read_u8()?;
        bytes.consume(2);
        let nw_src = bytes.read_u32::<BigEndian>()?;
        let nw_dst = bytes.read_u32::<BigEndian>()?;
        let tp_src = bytes.read_u16::<BigEndian>()?;
        let tp_dst = bytes.read_u16::<BigEndian>()?;
        let exact_addr = |shift: u32| (w >> shift) & 0x3f == 0;
        Ok(Pattern {
            dl_src: if wild(wildcard::DL_SRC) { None } else { Some(mac_of_bytes(dl_src)) },
            dl_dst: if wild(wildcard::DL_DST) { None } else { Some(mac_of_bytes(dl_dst)) },
            dl_typ: if wild(wildcard::DL_TYPE) { None } else { Some(dl_typ) },
            dl_vlan: if wild(wildcard::DL_VLAN) { None } else { Some(dl_vlan) },
            dl_vlan_pcp: if wild(wildcard::DL_VLAN_PCP) { None } else { Some(dl_vlan_pcp) },
            nw_src: if exact_addr(wildcard::NW_SRC_SHIFT) { Some(nw_src) } else { None },
            nw_dst: if exact_addr(wildcard::NW_DST_SHIFT) { Some(nw_dst) } else { None },
            nw_proto: if wild(wildcard::NW_PROTO) { None } else { Some(nw_proto) },
            nw_tos: if wild(wildcard::NW_TOS) { None } else { Some(nw_tos) },
            tp_src: if wild(wildcard::TP_SRC) { None } else { Some(tp_src) },
            tp_dst: if wild(wildcard::TP_DST) { None } else { Some(tp_dst) },
            in_port: if wild(wildcard::IN_PORT) { None } else { Some(in_port) },
        })
    }
}

/// Port behavior.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PseudoPort {
    PhysicalPort(u16),
    InPort,
    Table,
    Normal,
    Flood,
    AllPorts,
    Controller(u64),
    Local,
}

#[repr(u16)]
enum OfpPort {
    OFPPMax = 0xff00,
    OFPPInPort = 0xfff8,
    OFPPTable = 0xfff9,
    OFPPNormal = 0xfffa,
    OFPPFlood = 0xfffb,
    OFPPAll = 0xfffc,
    OFPPController = 0xfffd,
    OFPPLocal = 0xfffe,
    OFPPNone = 0xffff,
}

impl PseudoPort {
    fn of_int(p: u16) -> Result<Option<PseudoPort>, OfpError> {
        if (OfpPort::OFPPNone as u16) == p {
            Ok(None)
        } else {
            PseudoPort::make(p, 0).map(Some)
        }
    }

    fn make(p: u16, len: u64) -> Result<PseudoPort, OfpError> {
        let pp = match p {
            p if p == (OfpPort::OFPPInPort as u16) => PseudoPort::InPort,
            p if p == (OfpPort::OFPPTable as u16) => PseudoPort::Table,
            p if p == (OfpPort::OFPPNormal as u16) => PseudoPort::Normal,
            p if p == (OfpPort::OFPPFlood as u16) => PseudoPort::Flood,
            p if p == (OfpPort::OFPPAll as u16) => PseudoPort::AllPorts,
            p if p == (OfpPort::OFPPController as u16) => PseudoPort::Controller(len),
            p if p == (OfpPort::OFPPLocal as u16) => PseudoPort::Local,
            p if p <= (OfpPort::OFPPMax as u16) => PseudoPort::PhysicalPort(p),
            p => {
                return Err(OfpError::InvalidField {
                    field: "port",
                    value: p as u64,
                })
            }
        };
        Ok(pp)
    }

    fn to_int(pp: PseudoPort) -> u16 {
        match pp {
            PseudoPort::PhysicalPort(p) => p,
            PseudoPort::InPort => OfpPort::OFPPInPort as u16,
            PseudoPort::Table => OfpPort::OFPPTable as u16,
            PseudoPort::Normal => OfpPort::OFPPNormal as u16,
            PseudoPort::Flood => OfpPort::OFPPFlood as u16,
            PseudoPort::AllPorts => OfpPort::OFPPAll as u16,
            PseudoPort::Controller(_) => OfpPort::OFPPController as u16,
            PseudoPort::Local => OfpPort::OFPPLocal as u16,
        }
    }

    fn marshal(pp: PseudoPort, bytes: &mut Vec<u8>) {
        let _ = bytes.write_u16::<BigEndian>(PseudoPort::to_int(pp));
    }
}

/// Actions associated with flows and packets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Output(PseudoPort),
}

#[repr(C, packed)]
struct OfpActionHeader(u16, u16, [u8; 4]);

#[repr(u16)]
enum OfpActionType {
    OFPATOutput,
}

impl Action {
    fn type_code(a: &Action) -> OfpActionType {
        match *a {
            Action::Output(_) => OfpActionType::OFPATOutput,
        }
    }

    fn size_of(_: &Action) -> usize {
        size_of::<OfpActionHeader>()
    }

    fn size_of_sequence(actions: &[Action]) -> usize {
        actions.iter().map(Action::size_of).sum()
    }

    fn parse_sequence(bytes: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<Action>, OfpError> {
        let end = bytes.position() as usize + len;
        if end > bytes.get_ref().len() {
            return Err(OfpError::Truncated("action list"));
        }
        let mut actions = vec![];
        while (bytes.position() as usize) < end {
            let action_code = bytes.read_u16::<BigEndian>()?;
            let action_len = bytes.read_u16::<BigEndian>()? as usize;
            if action_len < size_of::<OfpActionHeader>() {
                return Err(OfpError::InvalidField {
                    field: "action length",
                    value: action_len as u64,
                });
            }
            if bytes.position() as usize - 4 + action_len > end {
                return Err(OfpError::Truncated("action"));
            }
            if action_code == OfpActionType::OFPATOutput as u16 {
                let port_code = bytes.read_u16::<BigEndian>()?;
                let max_len = bytes.read_u16::<BigEndian>()?;
                actions.push(Action::Output(PseudoPort::make(port_code, max_len as u64)?));
                bytes.consume(action_len - size_of::<OfpActionHeader>());
            } else {
                // Actions this controller never installs are skipped.
                bytes.consume(action_len - 4);
            }
        }
        Ok(actions)
    }

    fn move_controller_last(acts: Vec<Action>) -> Vec<Action> {
        let (mut to_ctrl, mut not_to_ctrl): (Vec<Action>, Vec<Action>) = acts
            .into_iter()
            .partition(|act| matches!(*act, Action::Output(PseudoPort::Controller(_))));
        not_to_ctrl.append(&mut to_ctrl);
        not_to_ctrl
    }

    fn marshal(act: Action, bytes: &mut Vec<u8>) {
        let _ = bytes.write_u16::<BigEndian>(Action::type_code(&act) as u16);
        let _ = bytes.write_u16::<BigEndian>(Action::size_of(&act) as u16);
        match act {
            Action::Output(pp) => {
                PseudoPort::marshal(pp, bytes);
                let _ = bytes.write_u16::<BigEndian>(match pp {
                    PseudoPort::Controller(w) => w as u16,
                    _ => 0,
                });
            }
        }
    }
}

/// How long before a flow entry expires.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timeout {
    Permanent,
    ExpiresAfter(u16),
}

impl Timeout {
    fn of_int(tm: u16) -> Timeout {
        match tm {
            0 => Timeout::Permanent,
            d => Timeout::ExpiresAfter(d),
        }
    }

    fn to_int(tm: Timeout) -> u16 {
        match tm {
            Timeout::Permanent => 0,
            Timeout::ExpiresAfter(d) => d,
        }
    }
}

/// Capabilities supported by the datapath.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub flow_stats: bool,
    pub table_stats: bool,
    pub port_stats: bool,
    pub stp: bool,
    pub ip_reasm: bool,
    pub queue_stats: bool,
    pub arp_match_ip: bool,
}

/// Switch features.
#[derive(Debug, Clone)]
pub struct SwitchFeatures {
    pub datapath_id: u64,
    pub num_buffers: u32,
    pub num_tables: u8,
    pub supported_capabilities: Capabilities,
    pub ports: Vec<PortDesc>,
}

#[repr(C, packed)]
struct OfpSwitchFeatures(u64, u32, u8, [u8; 3], u32, u32);

impl MessageType for SwitchFeatures {
    fn size_of(sf: &SwitchFeatures) -> usize {
        size_of::<OfpSwitchFeatures>() + sf.ports.len() * size_of::<OfpPhyPort>()
    }

    fn parse(buf: &[u8]) -> Result<SwitchFeatures, OfpError> {
        let mut bytes = Cursor::new(buf);
        let datapath_id = bytes.read_u64::<BigEndian>()?;
        let num_buffers = bytes.read_u32::<BigEndian>()?;
        let num_tables = bytes.read_u8()?;
        bytes.consume(3);
        let supported_capabilities = {
            let d = bytes.read_u32::<BigEndian>()? as u64;
            Capabilities {
                flow_stats: test_bit(0, d),
                table_stats: test_bit(1, d),
                port_stats: test_bit(2, d),
                stp: test_bit(3, d),
                ip_reasm: test_bit(5, d),
                queue_stats: test_bit(6, d),
                arp_match_ip: test_bit(7, d),
            }
        };
        // Supported actions bitmap.
        bytes.consume(4);
        let num_ports =
            buf.len().saturating_sub(bytes.position() as usize) / size_of::<OfpPhyPort>();
        let mut ports = Vec::with_capacity(num_ports);
        for _ in 0..num_ports {
            ports.push(PortDesc::parse(&mut bytes)?);
        }
        Ok(SwitchFeatures {
            datapath_id,
            num_buffers,
            num_tables,
            supported_capabilities,
            ports,
        })
    }

    fn marshal(sf: SwitchFeatures, bytes: &mut Vec<u8>) {
        let _ = bytes.write_u64::<BigEndian>(sf.datapath_id);
        let _ = bytes.write_u32::<BigEndian>(sf.num_buffers);
        let _ = bytes.write_u8(sf.num_tables);
        bytes.extend_from_slice(&[0; 3]);
        let caps = &sf.supported_capabilities;
        let mut d = 0;
        d = bit(0, d, caps.flow_stats);
        d = bit(1, d, caps.table_stats);
        d = bit(2, d, caps.port_stats);
        d = bit(3, d, caps.stp);
        d = bit(5, d, caps.ip_reasm);
        d = bit(6, d, caps.queue_stats);
        d = bit(7, d, caps.arp_match_ip);
        let _ = bytes.write_u32::<BigEndian>(d as u32);
        // Only the output action is supported.
        let _ = bytes.write_u32::<BigEndian>(1);
        for port in sf.ports {
            PortDesc::marshal(port, bytes);
        }
    }
}

/// Type of modification to perform on a flow table.
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlowModCmd {
    AddFlow,
    ModFlow,
    ModStrictFlow,
    DeleteFlow,
    DeleteStrictFlow,
}

/// Represents modifications to a flow table from the controller.
#[derive(Debug, Clone)]
pub struct FlowMod {
    pub command: FlowModCmd,
    pub pattern: Pattern,
    pub priority: u16,
    pub actions: Vec<Action>,
    pub cookie: u64,
    pub idle_timeout: Timeout,
    pub hard_timeout: Timeout,
    pub notify_when_removed: bool,
    pub apply_to_packet: Option<u32>,
    pub out_port: Option<PseudoPort>,
    pub check_overlap: bool,
}

#[repr(C, packed)]
struct OfpFlowMod(u64, u16, u16, u16, u16, u32, u16, u16);

impl FlowMod {
    fn flags_to_int(check_overlap: bool, notify_when_removed: bool) -> u16 {
        (if check_overlap { 1 << 1 } else { 0 }) | (if notify_when_removed { 1 << 0 } else { 0 })
    }
}

impl MessageType for FlowMod {
    fn size_of(msg: &FlowMod) -> usize {
        size_of::<OfpMatch>() + size_of::<OfpFlowMod>() + Action::size_of_sequence(&msg.actions)
    }

    fn parse(buf: &[u8]) -> Result<FlowMod, OfpError> {
        let mut bytes = Cursor::new(buf);
        let pattern = Pattern::parse(&mut bytes)?;
        let cookie = bytes.read_u64::<BigEndian>()?;
        let command = match bytes.read_u16::<BigEndian>()? {
            0 => FlowModCmd::AddFlow,
            1 => FlowModCmd::ModFlow,
            2 => FlowModCmd::ModStrictFlow,
            3 => FlowModCmd::DeleteFlow,
            4 => FlowModCmd::DeleteStrictFlow,
            c => {
                return Err(OfpError::InvalidField {
                    field: "flow_mod command",
                    value: c as u64,
                })
            }
        };
        let idle_timeout = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        let hard_timeout = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        let priority = bytes.read_u16::<BigEndian>()?;
        let apply_to_packet = match bytes.read_u32::<BigEndian>()? {
            u32::MAX => None,
            n => Some(n),
        };
        let out_port = PseudoPort::of_int(bytes.read_u16::<BigEndian>()?)?;
        let flags = bytes.read_u16::<BigEndian>()?;
        let remaining = buf.len() - bytes.position() as usize;
        let actions = Action::parse_sequence(&mut bytes, remaining)?;
        Ok(FlowMod {
            command,
            pattern,
            priority,
            actions,
            cookie,
            idle_timeout,
            hard_timeout,
            notify_when_removed: flags & 1 != 0,
            apply_to_packet,
            out_port,
            check_overlap: flags & 2 != 0,
        })
    }

    fn marshal(fm: FlowMod, bytes: &mut Vec<u8>) {
        Pattern::marshal(fm.pattern, bytes);
        let _ = bytes.write_u64::<BigEndian>(fm.cookie);
        let _ = bytes.write_u16::<BigEndian>(fm.command as u16);
        let _ = bytes.write_u16::<BigEndian>(Timeout::to_int(fm.idle_timeout));
        let _ = bytes.write_u16::<BigEndian>(Timeout::to_int(fm.hard_timeout));
        let _ = bytes.write_u16::<BigEndian>(fm.priority);
        let _ = bytes.write_u32::<BigEndian>(fm.apply_to_packet.unwrap_or(u32::MAX));
        match fm.out_port {
            None => {
                let _ = bytes.write_u16::<BigEndian>(OfpPort::OFPPNone as u16);
            }
            Some(x) => PseudoPort::marshal(x, bytes),
        }
        let _ = bytes.write_u16::<BigEndian>(FlowMod::flags_to_int(
            fm.check_overlap,
            fm.notify_when_removed,
        ));
        for act in Action::move_controller_last(fm.actions) {
            // OFPP_TABLE is only meaningful in packet-outs.
            if act == Action::Output(PseudoPort::Table) {
                continue;
            }
            Action::marshal(act, bytes)
        }
    }
}

/// The data associated with a packet received by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Buffered(u32, Vec<u8>),
    NotBuffered(Vec<u8>),
}

impl Payload {
    pub fn size_of(payload: &Payload) -> usize {
        match *payload {
            Payload::Buffered(_, ref buf) | Payload::NotBuffered(ref buf) => buf.len(),
        }
    }

    /// The raw frame bytes, whether or not the switch buffered the packet.
    pub fn bytes(&self) -> &[u8] {
        match *self {
            Payload::Buffered(_, ref buf) | Payload::NotBuffered(ref buf) => buf,
        }
    }

    pub fn buffer_id(&self) -> Option<u32> {
        match *self {
            Payload::Buffered(id, _) => Some(id),
            Payload::NotBuffered(_) => None,
        }
    }
}

/// The reason a packet arrives at the controller.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketInReason {
    NoMatch,
    ExplicitSend,
}

/// Represents packets received by the datapath and sent to the controller.
#[derive(Debug, Clone)]
pub struct PacketIn {
    pub input_payload: Payload,
    pub total_len: u16,
    pub port: u16,
    pub reason: PacketInReason,
}

#[repr(C, packed)]
struct OfpPacketIn(i32, u16, u16, u8, u8);

impl MessageType for PacketIn {
    fn size_of(pi: &PacketIn) -> usize {
        size_of::<OfpPacketIn>() + Payload::size_of(&pi.input_payload)
    }

    fn parse(buf: &[u8]) -> Result<PacketIn, OfpError> {
        if buf.len() < size_of::<OfpPacketIn>() {
            return Err(OfpError::Truncated("packet_in"));
        }
        let mut bytes = Cursor::new(buf);
        let buf_id = match bytes.read_u32::<BigEndian>()? {
            u32::MAX => None,
            n => Some(n),
        };
        let total_len = bytes.read_u16::<BigEndian>()?;
        let port = bytes.read_u16::<BigEndian>()?;
        let reason = match bytes.read_u8()? {
            0 => PacketInReason::NoMatch,
            _ => PacketInReason::ExplicitSend,
        };
        bytes.consume(1);
        let data = buf[bytes.position() as usize..].to_vec();
        let payload = match buf_id {
            None => Payload::NotBuffered(data),
            Some(n) => Payload::Buffered(n, data),
        };
        Ok(PacketIn {
            input_payload: payload,
            total_len,
            port,
            reason,
        })
    }

    fn marshal(pi: PacketIn, bytes: &mut Vec<u8>) {
        let _ = bytes.write_u32::<BigEndian>(pi.input_payload.buffer_id().unwrap_or(u32::MAX));
        let _ = bytes.write_u16::<BigEndian>(pi.total_len);
        let _ = bytes.write_u16::<BigEndian>(pi.port);
        let _ = bytes.write_u8(pi.reason as u8);
        let _ = bytes.write_u8(0);
        bytes.extend_from_slice(pi.input_payload.bytes());
    }
}

/// Represents packets sent from the controller.
#[derive(Debug, Clone)]
pub struct PacketOut {
    pub output_payload: Payload,
    pub port_id: Option<u16>,
    pub apply_actions: Vec<Action>,
}

#[repr(C, packed)]
struct OfpPacketOut(u32, u16, u16);

impl MessageType for PacketOut {
    fn size_of(po: &PacketOut) -> usize {
        let data = match po.output_payload {
            Payload::Buffered(..) => 0,
            Payload::NotBuffered(ref buf) => buf.len(),
        };
        size_of::<OfpPacketOut>() + Action::size_of_sequence(&po.apply_actions) + data
    }

    fn parse(buf: &[u8]) -> Result<PacketOut, OfpError> {
        let mut bytes = Cursor::new(buf);
        let buf_id = bytes.read_u32::<BigEndian>()?;
        let port_id = match PseudoPort::of_int(bytes.read_u16::<BigEndian>()?)? {
            Some(PseudoPort::PhysicalPort(p)) => Some(p),
            _ => None,
        };
        let actions_len = bytes.read_u16::<BigEndian>()? as usize;
        let apply_actions = Action::parse_sequence(&mut bytes, actions_len)?;
        let data = buf[bytes.position() as usize..].to_vec();
        let output_payload = match buf_id {
            u32::MAX => Payload::NotBuffered(data),
            n => Payload::Buffered(n, data),
        };
        Ok(PacketOut {
            output_payload,
            port_id,
            apply_actions,
        })
    }

    fn marshal(po: PacketOut, bytes: &mut Vec<u8>) {
        let _ = bytes.write_u32::<BigEndian>(po.output_payload.buffer_id().unwrap_or(u32::MAX));
        let _ = bytes.write_u16::<BigEndian>(po.port_id.unwrap_or(OfpPort::OFPPNone as u16));
        let _ = bytes.write_u16::<BigEndian>(Action::size_of_sequence(&po.apply_actions) as u16);
        for act in Action::move_controller_last(po.apply_actions) {
            Action::marshal(act, bytes);
        }
        if let Payload::NotBuffered(data) = po.output_payload {
            bytes.extend_from_slice(&data);
        }
    }
}

/// Why a flow entry left the switch's flow table.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlowRemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
}

/// Flow removed (datapath -> controller). Only sent for flows installed with
/// `notify_when_removed`.
#[derive(Debug, Clone)]
pub struct FlowRemoved {
    pub pattern: Pattern,
    pub cookie: u64,
    pub priority: u16,
    pub reason: FlowRemovedReason,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: Timeout,
    pub packet_count: u64,
    pub byte_count: u64,
}

#[repr(C, packed)]
struct OfpFlowRemoved(u64, u16, u8, u8, u32, u32, u16, [u8; 2], u64, u64);

impl MessageType for FlowRemoved {
    fn size_of(_: &FlowRemoved) -> usize {
        size_of::<OfpMatch>() + size_of::<OfpFlowRemoved>()
    }

    fn parse(buf: &[u8]) -> Result<FlowRemoved, OfpError> {
        let mut bytes = Cursor::new(buf);
        let pattern = Pattern::parse(&mut bytes)?;
        let cookie = bytes.read_u64::<BigEndian>()?;
        let priority = bytes.read_u16::<BigEndian>()?;
        let reason = match bytes.read_u8()? {
            0 => FlowRemovedReason::IdleTimeout,
            1 => FlowRemovedReason::HardTimeout,
            2 => FlowRemovedReason::Delete,
            r => {
                return Err(OfpError::InvalidField {
                    field: "flow_removed reason",
                    value: r as u64,
                })
            }
        };
        bytes.consume(1);
        let duration_sec = bytes.read_u32::<BigEndian>()?;
        let duration_nsec = bytes.read_u32::<BigEndian>()?;
        let idle_timeout = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        bytes.consume(2);
        let packet_count = bytes.read_u64::<BigEndian>()?;
        let byte_count = bytes.read_u64::<BigEndian>()?;
        Ok(FlowRemoved {
            pattern,
            cookie,
            priority,
            reason,
            duration_sec,
            duration_nsec,
            idle_timeout,
            packet_count,
            byte_count,
        })
    }

    fn marshal(fr: FlowRemoved, bytes: &mut Vec<u8>) {
        Pattern::marshal(fr.pattern, bytes);
        let _ = bytes.write_u64::<BigEndian>(fr.cookie);
        let _ = bytes.write_u16::<BigEndian>(fr.priority);
        let _ = bytes.write_u8(fr.reason as u8);
        let _ = bytes.write_u8(0);
        let _ = bytes.write_u32::<BigEndian>(fr.duration_sec);
        let _ = bytes.write_u32::<BigEndian>(fr.duration_nsec);
        let _ = bytes.write_u16::<BigEndian>(Timeout::to_int(fr.idle_timeout));
        bytes.extend_from_slice(&[0; 2]);
        let _ = bytes.write_u64::<BigEndian>(fr.packet_count);
        let _ = bytes.write_u64::<BigEndian>(fr.byte_count);
    }
}

/// STP state of a port.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StpState {
    Listen,
    Learn,
    Forward,
    Block,
}

/// Current state of a physical port. Not configurable by the controller.
#[derive(Debug, Clone)]
pub struct PortState {
    pub down: bool,
    pub stp_state: StpState,
}

/// Flags to indicate behavior of the physical port.
///
/// These flags are used both to describe the current configuration of a physical port,
/// and to configure a port's behavior.
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub down: bool,
    pub no_stp: bool,
    pub no_recv: bool,
    pub no_recv_stp: bool,
    pub no_flood: bool,
    pub no_fwd: bool,
    pub no_packet_in: bool,
}

/// Description of a physical port.
#[derive(Debug, Clone)]
pub struct PortDesc {
    pub port_no: u16,
    pub hw_addr: u64,
    pub name: String,
    pub config: PortConfig,
    pub state: PortState,
}

impl PortDesc {
    /// A port carries traffic only when it is neither administratively nor physically down.
    pub fn is_up(&self) -> bool {
        !self.config.down && !self.state.down
    }

    fn parse(bytes: &mut Cursor<&[u8]>) -> Result<PortDesc, OfpError> {
        let port_no = bytes.read_u16::<BigEndian>()?;
        let mut hw_addr = [0u8; 6];
        bytes.read_exact(&mut hw_addr)?;
        let mut name = [0u8; 16];
        bytes.read_exact(&mut name)?;
        let name_len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let config = {
            let d = bytes.read_u32::<BigEndian>()? as u64;
            PortConfig {
                down: test_bit(0, d),
                no_stp: test_bit(1, d),
                no_recv: test_bit(2, d),
                no_recv_stp: test_bit(3, d),
                no_flood: test_bit(4, d),
                no_fwd: test_bit(5, d),
                no_packet_in: test_bit(6, d),
            }
        };
        let state = {
            let d = bytes.read_u32::<BigEndian>()?;
            PortState {
                down: test_bit(0, d as u64),
                stp_state: match (d >> 8) & 3 {
                    0 => StpState::Listen,
                    1 => StpState::Learn,
                    2 => StpState::Forward,
                    _ => StpState::Block,
                },
            }
        };
        // curr, advertised, supported and peer feature bitmaps.
        bytes.consume(16);
        Ok(PortDesc {
            port_no,
            hw_addr: mac_of_bytes(hw_addr),
            name: String::from_utf8_lossy(&name[..name_len]).into_owned(),
            config,
            state,
        })
    }

    fn marshal(pd: PortDesc, bytes: &mut Vec<u8>) {
        let _ = bytes.write_u16::<BigEndian>(pd.port_no);
        bytes.extend_from_slice(&bytes_of_mac(pd.hw_addr));
        let mut name = [0u8; 16];
        let len = pd.name.len().min(15);
        name[..len].copy_from_slice(&pd.name.as_bytes()[..len]);
        bytes.extend_from_slice(&name);
        let c = &pd.config;
        let mut config = 0;
        config = bit(0, config, c.down);
        config = bit(1, config, c.no_stp);
        config = bit(2, config, c.no_recv);
        config = bit(3, config, c.no_recv_stp);
        config = bit(4, config, c.no_flood);
        config = bit(5, config, c.no_fwd);
        config = bit(6, config, c.no_packet_in);
        let _ = bytes.write_u32::<BigEndian>(config as u32);
        let stp = match pd.state.stp_state {
            StpState::Listen => 0,
            StpState::Learn => 1,
            StpState::Forward => 2,
            StpState::Block => 3,
        };
        let state = (stp << 8) | pd.state.down as u32;
        let _ = bytes.write_u32::<BigEndian>(state);
        bytes.extend_from_slice(&[0; 16]);
    }
}

#[repr(C, packed)]
struct OfpPhyPort(u16, [u8; 6], [u8; 16], u32, u32, u32, u32, u32, u32);

/// What changed about a physical port.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortReason {
    PortAdd,
    PortDelete,
    PortModify,
}

/// A physical port has changed in the datapath.
#[derive(Debug, Clone)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PortDesc,
}

impl MessageType for PortStatus {
    fn size_of(_: &PortStatus) -> usize {
        8 + size_of::<OfpPhyPort>()
    }

    fn parse(buf: &[u8]) -> Result<PortStatus, OfpError> {
        let mut bytes = Cursor::new(buf);
        let reason = match bytes.read_u8()? {
            0 => PortReason::PortAdd,
            1 => PortReason::PortDelete,
            2 => PortReason::PortModify,
            r => {
                return Err(OfpError::InvalidField {
                    field: "port_status reason",
                    value: r as u64,
                })
            }
        };
        bytes.consume(7);
        let desc = PortDesc::parse(&mut bytes)?;
        Ok(PortStatus { reason, desc })
    }

    fn marshal(ps: PortStatus, bytes: &mut Vec<u8>) {
        let _ = bytes.write_u8(ps.reason as u8);
        bytes.extend_from_slice(&[0; 7]);
        PortDesc::marshal(ps.desc, bytes);
    }
}

/// Error message (datapath -> controller). The `xid` of the enclosing header
/// names the request that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    pub typ: u16,
    pub code: u16,
    pub data: Vec<u8>,
}

impl MessageType for ErrorMsg {
    fn size_of(err: &ErrorMsg) -> usize {
        4 + err.data.len()
    }

    fn parse(buf: &[u8]) -> Result<ErrorMsg, OfpError> {
        let mut bytes = Cursor::new(buf);
        let typ = bytes.read_u16::<BigEndian>()?;
        let code = bytes.read_u16::<BigEndian>()?;
        Ok(ErrorMsg {
            typ,
            code,
            data: buf[4..].to_vec(),
        })
    }

    fn marshal(err: ErrorMsg, bytes: &mut Vec<u8>) {
        let _ = bytes.write_u16::<BigEndian>(err.typ);
        let _ = bytes.write_u16::<BigEndian>(err.code);
        bytes.extend_from_slice(&err.data);
    }
}

const OFPST_FLOW: u16 = 1;

/// Individual flow statistics request, restricted to flows matching `pattern`.
#[derive(Debug, Clone)]
pub struct FlowStatsReq {
    pub pattern: Pattern,
    pub table_id: u8,
    pub out_port: Option<PseudoPort>,
}

impl MessageType for FlowStatsReq {
    fn size_of(_: &FlowStatsReq) -> usize {
        4 + size_of::<OfpMatch>() + 4
    }

    fn parse(buf: &[u8]) -> Result<FlowStatsReq, OfpError> {
        let mut bytes = Cursor::new(buf);
        bytes.consume(4);
        let pattern = Pattern::parse(&mut bytes)?;
        let table_id = bytes.read_u8()?;
        bytes.consume(1);
        let out_port = PseudoPort::of_int(bytes.read_u16::<BigEndian>()?)?;
        Ok(FlowStatsReq {
            pattern,
            table_id,
            out_port,
        })
    }

    fn marshal(req: FlowStatsReq, bytes: &mut Vec<u8>) {
        let _ = bytes.write_u16::<BigEndian>(OFPST_FLOW);
        let _ = bytes.write_u16::<BigEndian>(0);
        Pattern::marshal(req.pattern, bytes);
        let _ = bytes.write_u8(req.table_id);
        let _ = bytes.write_u8(0);
        match req.out_port {
            None => {
                let _ = bytes.write_u16::<BigEndian>(OfpPort::OFPPNone as u16);
            }
            Some(p) => PseudoPort::marshal(p, bytes),
        }
    }
}

/// Statistics of a single flow entry.
#[derive(Debug, Clone)]
pub struct FlowStats {
    pub table_id: u8,
    pub pattern: Pattern,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub priority: u16,
    pub idle_timeout: Timeout,
    pub hard_timeout: Timeout,
    pub cookie: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub actions: Vec<Action>,
}

#[repr(C, packed)]
struct OfpFlowStats(u16, u8, u8, [u8; 40], u32, u32, u16, u16, u16, [u8; 6], u64, u64, u64);

impl FlowStats {
    fn parse(bytes: &mut Cursor<&[u8]>) -> Result<FlowStats, OfpError> {
        let length = bytes.read_u16::<BigEndian>()? as usize;
        if length < size_of::<OfpFlowStats>() {
            return Err(OfpError::InvalidField {
                field: "flow_stats length",
                value: length as u64,
            });
        }
        let table_id = bytes.read_u8()?;
        bytes.consume(1);
        let pattern = Pattern::parse(bytes)?;
        let duration_sec = bytes.read_u32::<BigEndian>()?;
        let duration_nsec = bytes.read_u32::<BigEndian>()?;
        let priority = bytes.read_u16::<BigEndian>()?;
        let idle_timeout = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        let hard_timeout = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        bytes.consume(6);
        let cookie = bytes.read_u64::<BigEndian>()?;
        let packet_count = bytes.read_u64::<BigEndian>()?;
        let byte_count = bytes.read_u64::<BigEndian>()?;
        let actions = Action::parse_sequence(bytes, length - size_of::<OfpFlowStats>())?;
        Ok(FlowStats {
            table_id,
            pattern,
            duration_sec,
            duration_nsec,
            priority,
            idle_timeout,
            hard_timeout,
            cookie,
            packet_count,
            byte_count,
            actions,
        })
    }
}

/// Body of a statistics reply. Only individual flow statistics are decoded.
#[derive(Debug, Clone)]
pub enum StatsReply {
    Flow { more: bool, flows: Vec<FlowStats> },
    Other(u16),
}

impl MessageType for StatsReply {
    fn size_of(reply: &StatsReply) -> usize {
        match *reply {
            StatsReply::Flow { ref flows, .. } => {
                4 + flows
                    .iter()
                    .map(|f| size_of::<OfpFlowStats>() + Action::size_of_sequence(&f.actions))
                    .sum::<usize>()
            }
            StatsReply::Other(_) => 4,
        }
    }

    fn parse(buf: &[u8]) -> Result<StatsReply, OfpError> {
        let mut bytes = Cursor::new(buf);
        let typ = bytes.read_u16::<BigEndian>()?;
        let flags = bytes.read_u16::<BigEndian>()?;
        if typ != OFPST_FLOW {
            return Ok(StatsReply::Other(typ));
        }
        let mut flows = vec![];
        while (bytes.position() as usize) < buf.len() {
            flows.push(FlowStats::parse(&mut bytes)?);
        }
        Ok(StatsReply::Flow {
            more: flags & 1 != 0,
            flows,
        })
    }

    fn marshal(_: StatsReply, _: &mut Vec<u8>) {}
}

/// Encapsulates handling of messages implementing `MessageType` trait.
pub mod message {
    use super::*;
    use crate::ofp_header::OfpHeader;
    use crate::ofp_message::OfpMessage;
    use crate::packet::Packet;

    /// OpenFlow protocol version implemented by this module.
    pub const OFP_VERSION: u8 = 0x01;

    /// Abstractions of OpenFlow messages mapping to message codes.
    #[derive(Debug, Clone)]
    pub enum Message {
        Hello,
        Error(ErrorMsg),
        EchoRequest(Vec<u8>),
        EchoReply(Vec<u8>),
        FeaturesReq,
        FeaturesReply(SwitchFeatures),
        FlowMod(FlowMod),
        PacketIn(PacketIn),
        FlowRemoved(FlowRemoved),
        PortStatus(PortStatus),
        PacketOut(PacketOut),
        BarrierRequest,
        BarrierReply,
        StatsRequest(FlowStatsReq),
        StatsReply(StatsReply),
        /// A well-formed message this controller does not act on.
        Unhandled(MsgCode),
    }

    impl Message {
        /// Map `Message` to associated OpenFlow message type code `MsgCode`.
        fn msg_code_of_message(msg: &Message) -> MsgCode {
            match *msg {
                Message::Hello => MsgCode::Hello,
                Message::Error(_) => MsgCode::Error,
                Message::EchoRequest(_) => MsgCode::EchoReq,
                Message::EchoReply(_) => MsgCode::EchoResp,
                Message::FeaturesReq => MsgCode::FeaturesReq,
                Message::FeaturesReply(_) => MsgCode::FeaturesResp,
                Message::FlowMod(_) => MsgCode::FlowMod,
                Message::PacketIn(_) => MsgCode::PacketIn,
                Message::FlowRemoved(_) => MsgCode::FlowRemoved,
                Message::PortStatus(_) => MsgCode::PortStatus,
                Message::PacketOut(_) => MsgCode::PacketOut,
                Message::BarrierRequest => MsgCode::BarrierReq,
                Message::BarrierReply => MsgCode::BarrierResp,
                Message::StatsRequest(_) => MsgCode::StatsReq,
                Message::StatsReply(_) => MsgCode::StatsResp,
                Message::Unhandled(code) => code,
            }
        }

        /// Marshal the OpenFlow message `msg`.
        fn marshal_body(msg: Message, bytes: &mut Vec<u8>) {
            match msg {
                Message::Hello
                | Message::FeaturesReq
                | Message::BarrierRequest
                | Message::BarrierReply
                | Message::Unhandled(_) => (),
                Message::Error(err) => ErrorMsg::marshal(err, bytes),
                Message::EchoReply(buf) | Message::EchoRequest(buf) => {
                    bytes.extend_from_slice(&buf)
                }
                Message::FeaturesReply(sf) => SwitchFeatures::marshal(sf, bytes),
                Message::FlowMod(flow_mod) => FlowMod::marshal(flow_mod, bytes),
                Message::PacketIn(packet_in) => PacketIn::marshal(packet_in, bytes),
                Message::FlowRemoved(fr) => FlowRemoved::marshal(fr, bytes),
                Message::PortStatus(sts) => PortStatus::marshal(sts, bytes),
                Message::PacketOut(po) => PacketOut::marshal(po, bytes),
                Message::StatsRequest(req) => FlowStatsReq::marshal(req, bytes),
                Message::StatsReply(rep) => StatsReply::marshal(rep, bytes),
            }
        }
    }

    impl OfpMessage for Message {
        /// Return the byte-size of a `Message`.
        fn size_of(msg: &Message) -> usize {
            let body = match *msg {
                Message::Hello
                | Message::FeaturesReq
                | Message::BarrierRequest
                | Message::BarrierReply
                | Message::Unhandled(_) => 0,
                Message::Error(ref err) => ErrorMsg::size_of(err),
                Message::EchoRequest(ref buf) | Message::EchoReply(ref buf) => buf.len(),
                Message::FeaturesReply(ref sf) => SwitchFeatures::size_of(sf),
                Message::FlowMod(ref flow_mod) => FlowMod::size_of(flow_mod),
                Message::PacketIn(ref packet_in) => PacketIn::size_of(packet_in),
                Message::FlowRemoved(ref fr) => FlowRemoved::size_of(fr),
                Message::PortStatus(ref ps) => PortStatus::size_of(ps),
                Message::PacketOut(ref po) => PacketOut::size_of(po),
                Message::StatsRequest(ref req) => FlowStatsReq::size_of(req),
                Message::StatsReply(ref rep) => StatsReply::size_of(rep),
            };
            OfpHeader::size() + body
        }

        /// Create an `OfpHeader` for the given `xid` and `msg`.
        fn header_of(xid: u32, msg: &Message) -> OfpHeader {
            let sizeof_buf = Self::size_of(msg);
            OfpHeader::new(
                OFP_VERSION,
                Self::msg_code_of_message(msg) as u8,
                sizeof_buf as u16,
                xid,
            )
        }

        /// Returns a `u8` buffer containing a marshaled OpenFlow header and the message `msg`.
        fn marshal(xid: u32, msg: Message) -> Vec<u8> {
            let hdr = Self::header_of(xid, &msg);
            let mut bytes = Vec::with_capacity(hdr.length());
            OfpHeader::marshal(&mut bytes, hdr);
            Message::marshal_body(msg, &mut bytes);
            bytes
        }

        /// Returns a pair `(u32, Message)` of the transaction id and OpenFlow message parsed from
        /// the given OpenFlow header `header`, and buffer `buf`.
        fn parse(header: &OfpHeader, buf: &[u8]) -> Result<(u32, Message), OfpError> {
            let typ = header.type_code()?;
            // Hello is the one message a newer switch may send before version negotiation.
            if typ != MsgCode::Hello && header.version() != OFP_VERSION {
                return Err(OfpError::UnsupportedVersion(header.version()));
            }
            let msg = match typ {
                MsgCode::Hello => Message::Hello,
                MsgCode::Error => Message::Error(ErrorMsg::parse(buf)?),
                MsgCode::EchoReq => Message::EchoRequest(buf.to_vec()),
                MsgCode::EchoResp => Message::EchoReply(buf.to_vec()),
                MsgCode::FeaturesReq => Message::FeaturesReq,
                MsgCode::FeaturesResp => Message::FeaturesReply(SwitchFeatures::parse(buf)?),
                MsgCode::FlowMod => Message::FlowMod(FlowMod::parse(buf)?),
                MsgCode::PacketIn => Message::PacketIn(PacketIn::parse(buf)?),
                MsgCode::FlowRemoved => Message::FlowRemoved(FlowRemoved::parse(buf)?),
                MsgCode::PortStatus => Message::PortStatus(PortStatus::parse(buf)?),
                MsgCode::PacketOut => Message::PacketOut(PacketOut::parse(buf)?),
                MsgCode::BarrierReq => Message::BarrierRequest,
                MsgCode::BarrierResp => Message::BarrierReply,
                MsgCode::StatsReq => Message::StatsRequest(FlowStatsReq::parse(buf)?),
                MsgCode::StatsResp => Message::StatsReply(StatsReply::parse(buf)?),
                t => Message::Unhandled(t),
            };
            Ok((header.xid(), msg))
        }
    }

    /// Return a `FlowMod` adding a flow parameterized by the given `priority`, `pattern`,
    /// and `actions`.
    pub fn add_flow(prio: u16, pattern: Pattern, actions: Vec<Action>) -> FlowMod {
        FlowMod {
            command: FlowModCmd::AddFlow,
            pattern,
            priority: prio,
            actions,
            cookie: 0,
            idle_timeout: Timeout::Permanent,
            hard_timeout: Timeout::Permanent,
            notify_when_removed: false,
            out_port: None,
            apply_to_packet: None,
            check_overlap: false,
        }
    }

    /// Return a `FlowMod` removing exactly the flow installed with `pattern` at `prio`.
    pub fn delete_flow_strict(prio: u16, pattern: Pattern) -> FlowMod {
        FlowMod {
            command: FlowModCmd::DeleteStrictFlow,
            ..add_flow(prio, pattern, vec![])
        }
    }

    /// Parse the frame carried by a packet-in.
    pub fn parse_payload(p: &Payload) -> Result<Packet, OfpError> {
        Packet::parse(p.bytes())
    }
}
