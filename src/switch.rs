//! The seam between the controller and the switches it drives.
//!
//! Switches report [`SwitchEvent`]s to an [`EventSink`]. The controller
//! answers with [`SwitchCommand`]s handed to a [`SwitchAdapter`], which
//! delivers them asynchronously and reports each outcome as a
//! [`CommandAck`] on the acknowledgment channel it was built with.

use std::sync::mpsc;
use std::time::Duration;

use crate::error::LbError;
use crate::flow_key::FlowKey;
use crate::flow_table::RuleHandle;
use crate::openflow0x01::FlowRemovedReason;

/// Switch → controller notifications.
#[derive(Debug, Clone)]
pub enum SwitchEvent {
    /// A packet matched no rule.
    NewFlow {
        switch_id: u64,
        in_port: u16,
        /// Set when the switch kept the packet and only sent a copy.
        buffer_id: Option<u32>,
        raw: Vec<u8>,
    },
    /// The switch dropped a rule it was asked to report.
    FlowRemoved {
        switch_id: u64,
        key: FlowKey,
        rule: RuleHandle,
        duration: Duration,
        byte_count: u64,
        reason: FlowRemovedReason,
    },
    PortStatus {
        switch_id: u64,
        port: u16,
        up: bool,
    },
    /// Latest counters of a forward rule, from flow statistics.
    FlowActivity {
        switch_id: u64,
        key: FlowKey,
        byte_count: u64,
    },
}

impl SwitchEvent {
    /// The flow this event concerns, if it is known without decoding a frame.
    pub fn flow_key(&self) -> Option<FlowKey> {
        match *self {
            SwitchEvent::FlowRemoved { key, .. } | SwitchEvent::FlowActivity { key, .. } => {
                Some(key)
            }
            SwitchEvent::NewFlow { ref raw, .. } => FlowKey::from_frame(raw).ok(),
            SwitchEvent::PortStatus { .. } => None,
        }
    }
}

/// Install the rules pinning `key` to a server.
///
/// The switch gets two rules under the same cookie: `key` out of `out_port`,
/// and the reversed key back out of `client_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRule {
    pub switch_id: u64,
    pub key: FlowKey,
    pub rule: RuleHandle,
    pub out_port: u16,
    pub client_port: u16,
    pub idle_timeout: Duration,
    pub hard_timeout: Option<Duration>,
    pub priority: u16,
    /// Buffered packet to release through the new rule.
    pub buffer_id: Option<u32>,
}

/// Remove both rules of a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRule {
    pub switch_id: u64,
    pub key: FlowKey,
    pub rule: RuleHandle,
    pub priority: u16,
}

/// Where a forwarded packet goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutPort {
    Port(u16),
    Flood,
}

/// Send one packet without installing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPacket {
    pub switch_id: u64,
    pub in_port: u16,
    pub out_port: OutPort,
    pub buffer_id: Option<u32>,
    pub payload: Vec<u8>,
}

/// Controller → switch commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchCommand {
    InstallRule(InstallRule),
    DeleteRule(DeleteRule),
    ForwardPacket(ForwardPacket),
}

impl SwitchCommand {
    pub fn switch_id(&self) -> u64 {
        match *self {
            SwitchCommand::InstallRule(ref c) => c.switch_id,
            SwitchCommand::DeleteRule(ref c) => c.switch_id,
            SwitchCommand::ForwardPacket(ref c) => c.switch_id,
        }
    }

    /// The flow whose rules this command changes.
    pub fn flow_key(&self) -> Option<FlowKey> {
        match *self {
            SwitchCommand::InstallRule(ref c) => Some(c.key),
            SwitchCommand::DeleteRule(ref c) => Some(c.key),
            SwitchCommand::ForwardPacket(_) => None,
        }
    }
}

/// A command plus the attempt number it was sent as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub command: SwitchCommand,
    /// 1 for the first send of a command.
    pub attempt: u32,
}

impl Submission {
    pub fn first(command: SwitchCommand) -> Submission {
        Submission {
            command,
            attempt: 1,
        }
    }
}

/// The outcome of a submission. Rule installs and deletions are always
/// acknowledged; packet forwards only when they fail.
#[derive(Debug)]
pub struct CommandAck {
    pub submission: Submission,
    pub result: Result<(), LbError>,
}

impl CommandAck {
    pub fn ok(submission: Submission) -> CommandAck {
        CommandAck {
            submission,
            result: Ok(()),
        }
    }

    pub fn failed(submission: Submission, reason: impl Into<String>) -> CommandAck {
        CommandAck {
            submission,
            result: Err(LbError::SwitchCommandFailed(reason.into())),
        }
    }
}

pub type AckSender = mpsc::Sender<CommandAck>;
pub type AckReceiver = mpsc::Receiver<CommandAck>;

/// Delivers commands to switches.
pub trait SwitchAdapter: Send + Sync {
    /// Queue `submission` for its switch and return without waiting.
    fn submit(&self, submission: Submission);
}

/// Receives switch events.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: SwitchEvent);
}
