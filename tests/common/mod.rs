#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ofp_lb::runtime::EventLoop;
use ofp_lb::switch::{
    AckSender, CommandAck, DeleteRule, InstallRule, Submission, SwitchAdapter, SwitchCommand,
    SwitchEvent,
};
use ofp_lb::{LbConfig, LoadBalancer};

pub const VIP: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 100);
pub const CLIENT_PORT: u16 = 10;

/// Records every submission and acknowledges rule changes right away.
pub struct RecordingSwitch {
    sent: Mutex<Vec<Submission>>,
    acks: Mutex<AckSender>,
    reject_installs: AtomicBool,
}

impl RecordingSwitch {
    pub fn new(acks: AckSender) -> RecordingSwitch {
        RecordingSwitch {
            sent: Mutex::new(Vec::new()),
            acks: Mutex::new(acks),
            reject_installs: AtomicBool::new(false),
        }
    }

    pub fn reject_installs(&self, reject: bool) {
        self.reject_installs.store(reject, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Submission> {
        self.sent.lock().clone()
    }

    pub fn installs(&self) -> Vec<InstallRule> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s.command {
                SwitchCommand::InstallRule(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<DeleteRule> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s.command {
                SwitchCommand::DeleteRule(c) => Some(c),
                _ => None,
            })
            .collect()
    }
}

impl SwitchAdapter for RecordingSwitch {
    fn submit(&self, submission: Submission) {
        self.sent.lock().push(submission.clone());
        let ack = match submission.command {
            SwitchCommand::ForwardPacket(_) => return,
            SwitchCommand::InstallRule(_) if self.reject_installs.load(Ordering::SeqCst) => {
                CommandAck::failed(submission, "table full")
            }
            _ => CommandAck::ok(submission),
        };
        let _ = self.acks.lock().send(ack);
    }
}

pub struct Harness {
    pub lb: Arc<LoadBalancer>,
    pub switch: Arc<RecordingSwitch>,
    pub event_loop: EventLoop,
}

impl Harness {
    pub fn start(config: LbConfig) -> Harness {
        let (tx, rx) = mpsc::channel();
        let switch = Arc::new(RecordingSwitch::new(tx));
        let lb = Arc::new(LoadBalancer::new(config, switch.clone()).unwrap());
        let event_loop = EventLoop::start(lb.clone(), rx).unwrap();
        Harness {
            lb,
            switch,
            event_loop,
        }
    }
}

/// Poll `cond` until it holds or a few seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn client(i: u32) -> Ipv4Addr {
    Ipv4Addr::from(0x0a00_0000 + i)
}

/// Untagged ethernet / IPv4 / TCP SYN frame.
pub fn tcp_frame(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Vec<u8> {
    let mut f = vec![0, 0, 0, 0, 0, 0xbb, 0, 0, 0, 0, 0, 0xaa, 0x08, 0x00];
    f.extend_from_slice(&[0x45, 0, 0, 40, 0, 1, 0x40, 0, 64, 6, 0, 0]);
    f.extend_from_slice(&src.octets());
    f.extend_from_slice(&dst.octets());
    f.extend_from_slice(&sport.to_be_bytes());
    f.extend_from_slice(&dport.to_be_bytes());
    f.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x02, 0xff, 0xff, 0, 0, 0, 0]);
    f
}

pub fn new_flow(client: Ipv4Addr, sport: u16) -> SwitchEvent {
    SwitchEvent::NewFlow {
        switch_id: 1,
        in_port: CLIENT_PORT,
        buffer_id: Some(sport as u32),
        raw: tcp_frame(client, sport, VIP, 80),
    }
}
