use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::OfpError;
use crate::ofp_header::OfpHeader;
use crate::ofp_message::OfpMessage;
use crate::switch::EventSink;

/// OpenFlow Controller
///
/// Version-agnostic API for implementing an OpenFlow controller.
pub trait OfpController {
    /// OpenFlow message type supporting the same protocol version as the controller.
    type Message: OfpMessage;

    /// Send a message to the node associated with the given writer.
    fn send_message<W: Write>(xid: u32, message: Self::Message, writer: &mut W) -> Result<(), OfpError> {
        writer.write_all(&<Self::Message as OfpMessage>::marshal(xid, message))?;
        Ok(())
    }

    /// Read the header and body of the next message off `reader`.
    fn read_frame<R: Read>(reader: &mut R) -> Result<(OfpHeader, Vec<u8>), OfpError> {
        let header = OfpHeader::read_from(reader)?;
        let body_len = header
            .length()
            .checked_sub(OfpHeader::size())
            .ok_or(OfpError::Truncated("OpenFlow header"))?;
        let mut body = vec![0; body_len];
        reader.read_exact(&mut body)?;
        Ok((header, body))
    }

    /// Perform handshake and begin loop reading incoming messages from client stream.
    ///
    /// Returns when the switch disconnects.
    fn handle_client_connected(&self, stream: TcpStream, sink: &dyn EventSink) -> Result<(), OfpError>;
}

pub mod openflow0x01 {
    use std::collections::HashMap;
    use std::io::{self, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use parking_lot::{Mutex, RwLock};
    use tracing::{debug, info, warn};

    use super::OfpController;
    use crate::error::OfpError;
    use crate::flow_key::FlowKey;
    use crate::flow_table::RuleHandle;
    use crate::ofp_message::OfpMessage;
    use crate::openflow0x01::message::{add_flow, delete_flow_strict, Message};
    use crate::openflow0x01::{
        Action, FlowMod, FlowStats, FlowStatsReq, PacketIn, PacketOut, Pattern, Payload,
        PortReason, PortStatus, PseudoPort, StatsReply, SwitchFeatures, Timeout,
    };
    use crate::switch::{
        AckSender, CommandAck, EventSink, ForwardPacket, OutPort, Submission, SwitchAdapter,
        SwitchCommand, SwitchEvent,
    };

    /// Match every table in a statistics request.
    const ALL_TABLES: u8 = 0xff;

    fn timeout_of(d: Option<Duration>) -> Timeout {
        match d {
            None => Timeout::Permanent,
            Some(d) => Timeout::ExpiresAfter(d.as_secs().clamp(1, u16::MAX as u64) as u16),
        }
    }

    /// The OpenFlow messages carrying out `command`. A trailing barrier is
    /// added by the caller for acknowledged commands.
    pub fn messages_for(command: &SwitchCommand) -> Vec<Message> {
        match *command {
            SwitchCommand::InstallRule(ref c) => {
                let idle = timeout_of(Some(c.idle_timeout));
                let hard = timeout_of(c.hard_timeout);
                let forward = FlowMod {
                    cookie: c.rule.0,
                    idle_timeout: idle,
                    hard_timeout: hard,
                    notify_when_removed: true,
                    apply_to_packet: c.buffer_id,
                    ..add_flow(
                        c.priority,
                        c.key.to_pattern(),
                        vec![Action::Output(PseudoPort::PhysicalPort(c.out_port))],
                    )
                };
                let reverse = FlowMod {
                    cookie: c.rule.0,
                    idle_timeout: idle,
                    hard_timeout: hard,
                    ..add_flow(
                        c.priority,
                        c.key.reversed().to_pattern(),
                        vec![Action::Output(PseudoPort::PhysicalPort(c.client_port))],
                    )
                };
                vec![Message::FlowMod(forward), Message::FlowMod(reverse)]
            }
            SwitchCommand::DeleteRule(ref c) => vec![
                Message::FlowMod(delete_flow_strict(c.priority, c.key.to_pattern())),
                Message::FlowMod(delete_flow_strict(c.priority, c.key.reversed().to_pattern())),
            ],
            SwitchCommand::ForwardPacket(ref c) => vec![Message::PacketOut(packet_out(c))],
        }
    }

    fn packet_out(c: &ForwardPacket) -> PacketOut {
        let port = match c.out_port {
            OutPort::Port(p) => PseudoPort::PhysicalPort(p),
            OutPort::Flood => PseudoPort::Flood,
        };
        PacketOut {
            output_payload: match c.buffer_id {
                Some(id) => Payload::Buffered(id, c.payload.clone()),
                None => Payload::NotBuffered(c.payload.clone()),
            },
            port_id: Some(c.in_port),
            apply_actions: vec![Action::Output(port)],
        }
    }

    /// Submissions waiting for their barrier reply.
    ///
    /// Every message of a submission is indexed by its xid, so an error
    /// answering any of them fails the whole submission.
    #[derive(Default)]
    pub struct Inflight {
        by_xid: HashMap<u32, u32>,
        waiting: HashMap<u32, (Submission, Vec<u32>)>,
    }

    impl Inflight {
        pub fn track(&mut self, barrier: u32, xids: Vec<u32>, submission: Submission) {
            for &x in &xids {
                self.by_xid.insert(x, barrier);
            }
            self.by_xid.insert(barrier, barrier);
            self.waiting.insert(barrier, (submission, xids));
        }

        fn take(&mut self, barrier: u32) -> Option<Submission> {
            let (submission, xids) = self.waiting.remove(&barrier)?;
            for x in xids {
                self.by_xid.remove(&x);
            }
            self.by_xid.remove(&barrier);
            Some(submission)
        }

        /// The barrier `xid` was answered.
        pub fn complete(&mut self, xid: u32) -> Option<Submission> {
            self.take(xid)
        }

        /// The switch rejected message `xid`.
        pub fn fail(&mut self, xid: u32) -> Option<Submission> {
            let barrier = *self.by_xid.get(&xid)?;
            self.take(barrier)
        }

        pub fn drain(&mut self) -> Vec<Submission> {
            self.by_xid.clear();
            self.waiting.drain().map(|(_, (s, _))| s).collect()
        }

        pub fn len(&self) -> usize {
            self.waiting.len()
        }

        pub fn is_empty(&self) -> bool {
            self.waiting.is_empty()
        }
    }

    /// The switch a connection has registered, and which registration.
    #[derive(Debug, Clone, Copy)]
    struct Attached {
        switch_id: u64,
        conn: u64,
    }

    struct SwitchHandle {
        conn: u64,
        outbox: mpsc::Sender<Vec<u8>>,
        inflight: Arc<Mutex<Inflight>>,
        connected: Arc<AtomicBool>,
    }

    /// OpenFlow 1.0 switch adapter.
    ///
    /// Each connected switch gets a writer thread fed through a channel, so
    /// `submit` never blocks on a socket.
    pub struct OF0x01Controller {
        switches: RwLock<HashMap<u64, SwitchHandle>>,
        acks: Mutex<AckSender>,
        next_xid: AtomicU32,
        next_conn: AtomicU64,
        stats_interval: Option<Duration>,
    }

    impl OF0x01Controller {
        pub fn new(acks: AckSender, stats_interval: Option<Duration>) -> OF0x01Controller {
            OF0x01Controller {
                switches: RwLock::new(HashMap::new()),
                acks: Mutex::new(acks),
                next_xid: AtomicU32::new(1),
                next_conn: AtomicU64::new(1),
                stats_interval,
            }
        }

        fn xid(&self) -> u32 {
            self.next_xid.fetch_add(1, Ordering::Relaxed)
        }

        fn ack(&self, ack: CommandAck) {
            if self.acks.lock().send(ack).is_err() {
                debug!("acknowledgment channel closed");
            }
        }

        /// Switches currently connected.
        pub fn connected(&self) -> Vec<u64> {
            self.switches.read().keys().copied().collect()
        }

        /// Register this connection as switch `sw`, replacing an earlier
        /// connection of the same switch.
        fn switch_connected(&self, sw: u64, stream: &TcpStream) -> Result<Attached, OfpError> {
            let (outbox, rx) = mpsc::channel::<Vec<u8>>();
            let mut writer = stream.try_clone()?;
            thread::Builder::new()
                .name(format!("ofp-writer-{:x}", sw))
                .spawn(move || {
                    for buf in rx {
                        if let Err(e) = writer.write_all(&buf) {
                            warn!(switch_id = sw, error = %e, "write to switch failed");
                            break;
                        }
                    }
                })?;

            let connected = Arc::new(AtomicBool::new(true));
            if let Some(interval) = self.stats_interval {
                let outbox = outbox.clone();
                let connected = connected.clone();
                let first_xid = self.xid();
                thread::Builder::new()
                    .name(format!("ofp-stats-{:x}", sw))
                    .spawn(move || poll_flow_stats(outbox, connected, interval, first_xid))?;
            }

            let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
            let previous = self.switches.write().insert(
                sw,
                SwitchHandle {
                    conn,
                    outbox,
                    inflight: Arc::new(Mutex::new(Inflight::default())),
                    connected,
                },
            );
            if let Some(old) = previous {
                debug!(switch_id = sw, conn = old.conn, "replacing earlier connection");
                self.retire(sw, old);
            }
            info!(switch_id = sw, conn, "switch connected");
            Ok(Attached { switch_id: sw, conn })
        }

        /// Unregister `attached`, unless the switch has since reconnected.
        fn switch_disconnected(&self, attached: Attached) {
            let sw = attached.switch_id;
            let handle = {
                let mut switches = self.switches.write();
                let current = switches.get(&sw).map_or(false, |h| h.conn == attached.conn);
                if current {
                    switches.remove(&sw)
                } else {
                    None
                }
            };
            match handle {
                Some(handle) => {
                    self.retire(sw, handle);
                    info!(switch_id = sw, conn = attached.conn, "switch disconnected");
                }
                None => debug!(switch_id = sw, conn = attached.conn, "superseded connection closed"),
            }
        }

        fn retire(&self, sw: u64, handle: SwitchHandle) {
            handle.connected.store(false, Ordering::SeqCst);
            let stranded = handle.inflight.lock().drain();
            for s in stranded {
                self.ack(CommandAck::failed(s, format!("switch {:x} disconnected", sw)));
            }
        }

        fn inflight_of(&self, sw: u64) -> Option<Arc<Mutex<Inflight>>> {
            self.switches.read().get(&sw).map(|h| h.inflight.clone())
        }

        fn packet_in(&self, sw: u64, pkt: PacketIn, sink: &dyn EventSink) {
            let (buffer_id, raw) = match pkt.input_payload {
                Payload::Buffered(id, raw) => (Some(id), raw),
                Payload::NotBuffered(raw) => (None, raw),
            };
            sink.dispatch(SwitchEvent::NewFlow {
                switch_id: sw,
                in_port: pkt.port,
                buffer_id,
                raw,
            });
        }

        fn port_status(&self, sw: u64, ps: PortStatus, sink: &dyn EventSink) {
            let up = ps.reason != PortReason::PortDelete && ps.desc.is_up();
            debug!(switch_id = sw, port = ps.desc.port_no, up, "port status");
            sink.dispatch(SwitchEvent::PortStatus {
                switch_id: sw,
                port: ps.desc.port_no,
                up,
            });
        }

        fn flow_stats(&self, sw: u64, flows: Vec<FlowStats>, sink: &dyn EventSink) {
            // Only rules this controller installed carry a cookie.
            for f in flows.into_iter().filter(|f| f.cookie != 0) {
                if let Some(key) = FlowKey::from_pattern(&f.pattern) {
                    sink.dispatch(SwitchEvent::FlowActivity {
                        switch_id: sw,
                        key,
                        byte_count: f.byte_count,
                    });
                }
            }
        }

        fn features(&self, feats: &SwitchFeatures, sink: &dyn EventSink) {
            for port in &feats.ports {
                sink.dispatch(SwitchEvent::PortStatus {
                    switch_id: feats.datapath_id,
                    port: port.port_no,
                    up: port.is_up(),
                });
            }
        }

        fn message_loop(
            &self,
            stream: &mut TcpStream,
            sink: &dyn EventSink,
            attached: &mut Option<Attached>,
        ) -> Result<(), OfpError> {
            loop {
                let (header, body) = match Self::read_frame(stream) {
                    Ok(frame) => frame,
                    // end of stream
                    Err(OfpError::Truncated(_)) => return Ok(()),
                    Err(OfpError::Io(ref e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                        return Ok(())
                    }
                    Err(e) => return Err(e),
                };
                let (xid, msg) = match Message::parse(&header, &body) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(switch = ?attached, error = %e, "skipping undecodable message");
                        continue;
                    }
                };
                match msg {
                    Message::Hello => (),
                    Message::EchoRequest(bytes) => {
                        let sw = attached.map(|a| a.switch_id);
                        self.reply(sw, xid, Message::EchoReply(bytes), stream)?
                    }
                    Message::FeaturesReply(feats) => {
                        *attached = Some(self.switch_connected(feats.datapath_id, stream)?);
                        self.features(&feats, sink);
                    }
                    msg => {
                        let id = match *attached {
                            Some(a) => a.switch_id,
                            None => {
                                debug!(?msg, "message before features reply");
                                continue;
                            }
                        };
                        self.switch_message(id, xid, msg, sink);
                    }
                }
            }
        }

        /// Answer on the switch's writer thread once it has one, so replies
        /// never interleave with queued commands.
        fn reply(
            &self,
            sw: Option<u64>,
            xid: u32,
            msg: Message,
            stream: &mut TcpStream,
        ) -> Result<(), OfpError> {
            let outbox = sw.and_then(|id| self.switches.read().get(&id).map(|h| h.outbox.clone()));
            match outbox {
                Some(outbox) => {
                    let _ = outbox.send(Message::marshal(xid, msg));
                    Ok(())
                }
                None => Self::send_message(xid, msg, stream),
            }
        }

        fn switch_message(&self, sw: u64, xid: u32, msg: Message, sink: &dyn EventSink) {
            match msg {
                Message::PacketIn(pkt) => self.packet_in(sw, pkt, sink),
                Message::FlowRemoved(fr) => match FlowKey::from_pattern(&fr.pattern) {
                    Some(key) => sink.dispatch(SwitchEvent::FlowRemoved {
                        switch_id: sw,
                        key,
                        rule: RuleHandle(fr.cookie),
                        duration: Duration::new(fr.duration_sec as u64, fr.duration_nsec),
                        byte_count: fr.byte_count,
                        reason: fr.reason,
                    }),
                    None => debug!(switch_id = sw, "removal of a rule with a partial match"),
                },
                Message::PortStatus(ps) => self.port_status(sw, ps, sink),
                Message::StatsReply(StatsReply::Flow { flows, .. }) => self.flow_stats(sw, flows, sink),
                Message::BarrierReply => {
                    let done = self.inflight_of(sw).and_then(|i| i.lock().complete(xid));
                    if let Some(s) = done {
                        self.ack(CommandAck::ok(s));
                    }
                }
                Message::Error(err) => {
                    let failed = self.inflight_of(sw).and_then(|i| i.lock().fail(xid));
                    let reason = format!("error type {} code {}", err.typ, err.code);
                    match failed {
                        Some(s) => self.ack(CommandAck::failed(s, reason)),
                        None => warn!(switch_id = sw, xid, %reason, "switch error"),
                    }
                }
                other => debug!(switch_id = sw, msg = ?other, "ignoring message"),
            }
        }
    }

    fn poll_flow_stats(
        outbox: mpsc::Sender<Vec<u8>>,
        connected: Arc<AtomicBool>,
        interval: Duration,
        xid: u32,
    ) {
        loop {
            thread::sleep(interval);
            if !connected.load(Ordering::SeqCst) {
                break;
            }
            let req = Message::StatsRequest(FlowStatsReq {
                pattern: Pattern::match_all(),
                table_id: ALL_TABLES,
                out_port: None,
            });
            if outbox.send(Message::marshal(xid, req)).is_err() {
                break;
            }
        }
    }

    impl OfpController for OF0x01Controller {
        type Message = Message;

        fn handle_client_connected(
            &self,
            mut stream: TcpStream,
            sink: &dyn EventSink,
        ) -> Result<(), OfpError> {
            Self::send_message(self.xid(), Message::Hello, &mut stream)?;
            Self::send_message(self.xid(), Message::FeaturesReq, &mut stream)?;
            let mut attached = None;
            let result = self.message_loop(&mut stream, sink, &mut attached);
            if let Some(a) = attached {
                self.switch_disconnected(a);
            }
            result
        }
    }

    impl SwitchAdapter for OF0x01Controller {
        fn submit(&self, submission: Submission) {
            let sw = submission.command.switch_id();
            let acknowledged = !matches!(submission.command, SwitchCommand::ForwardPacket(_));
            let (outbox, inflight) = match self.switches.read().get(&sw) {
                Some(h) => (h.outbox.clone(), h.inflight.clone()),
                None => {
                    warn!(switch_id = sw, "command for an unknown switch");
                    self.ack(CommandAck::failed(submission, format!("switch {:x} not connected", sw)));
                    return;
                }
            };

            let mut bytes = Vec::new();
            let mut xids = Vec::new();
            for msg in messages_for(&submission.command) {
                let xid = self.xid();
                xids.push(xid);
                bytes.extend_from_slice(&Message::marshal(xid, msg));
            }
            if !acknowledged {
                if outbox.send(bytes).is_err() {
                    self.ack(CommandAck::failed(submission, "switch writer gone"));
                }
                return;
            }

            let barrier = self.xid();
            bytes.extend_from_slice(&Message::marshal(barrier, Message::BarrierRequest));
            inflight.lock().track(barrier, xids, submission);
            if outbox.send(bytes).is_err() {
                let lost = inflight.lock().complete(barrier);
                if let Some(s) = lost {
                    self.ack(CommandAck::failed(s, "switch writer gone"));
                }
            }
        }
    }

}
