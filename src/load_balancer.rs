//! The controller core: turns switch events into bindings and switch commands.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::LbConfig;
use crate::error::LbError;
use crate::flow_key::FlowKey;
use crate::flow_table::{FlowBinding, FlowTable, InstallState, RuleHandle};
use crate::packet::{Nw, Packet};
use crate::policy::{build_policy, PolicyKind, SelectionPolicy};
use crate::server_pool::{ServerId, ServerPool};
use crate::switch::{
    CommandAck, DeleteRule, ForwardPacket, InstallRule, OutPort, Submission, SwitchAdapter,
    SwitchCommand, SwitchEvent,
};

/// What the controller did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// A new binding was made and its rules sent to the switch.
    Installed(ServerId),
    /// The packet belonged to a bound flow and was sent to its server.
    Forwarded(ServerId),
    /// Server → client traffic of a bound flow, sent back to the client.
    Returned { client_port: u16 },
    Unbound,
    MarkedDown(ServerId),
    MarkedUp(ServerId),
    Refreshed,
    Flooded,
    /// Server-originated traffic with no binding.
    Dropped,
    Ignored,
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub retried: usize,
    pub abandoned: usize,
}

#[derive(Default)]
struct Counters {
    installs: AtomicU64,
    forwards: AtomicU64,
    returns: AtomicU64,
    return_misses: AtomicU64,
    floods: AtomicU64,
    malformed: AtomicU64,
    no_servers: AtomicU64,
    install_failures: AtomicU64,
    retries: AtomicU64,
    abandoned: AtomicU64,
    expired: AtomicU64,
    removed_by_switch: AtomicU64,
    command_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time view of the controller's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LbStats {
    pub active_flows: usize,
    pub live_servers: usize,
    pub installs: u64,
    pub forwards: u64,
    pub returns: u64,
    pub return_misses: u64,
    pub floods: u64,
    pub malformed: u64,
    pub no_servers: u64,
    pub install_failures: u64,
    pub retries: u64,
    pub abandoned: u64,
    pub expired: u64,
    pub removed_by_switch: u64,
    pub command_failures: u64,
}

pub struct LoadBalancer {
    config: LbConfig,
    pool: ServerPool,
    policy: Box<dyn SelectionPolicy>,
    table: FlowTable,
    adapter: Arc<dyn SwitchAdapter>,
    counters: Counters,
}

impl LoadBalancer {
    /// Validate `config` and build a controller sending its commands to `adapter`.
    pub fn new(config: LbConfig, adapter: Arc<dyn SwitchAdapter>) -> Result<LoadBalancer, LbError> {
        config.validate()?;
        let policy = build_policy(config.policy, config.seed, config.hash_input);
        Ok(LoadBalancer {
            pool: ServerPool::new(config.servers.iter().copied()),
            policy,
            table: FlowTable::new(),
            adapter,
            counters: Counters::default(),
            config,
        })
    }

    pub fn config(&self) -> &LbConfig {
        &self.config
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.policy.kind()
    }

    pub fn binding(&self, key: &FlowKey) -> Option<FlowBinding> {
        self.table.lookup(key)
    }

    pub fn servers(&self) -> Vec<(ServerId, bool)> {
        self.pool.all()
    }

    /// Process one switch event.
    ///
    /// Per-flow failures are logged and counted here; the returned error is
    /// informational and the controller stays usable.
    pub fn handle_event(&self, event: SwitchEvent, now: Instant) -> Result<Handled, LbError> {
        match event {
            SwitchEvent::NewFlow {
                switch_id,
                in_port,
                buffer_id,
                raw,
            } => self.new_flow(switch_id, in_port, buffer_id, raw, now),
            SwitchEvent::FlowRemoved {
                key,
                rule,
                duration,
                byte_count,
                reason,
                ..
            } => match self.table.unbind_rule(&key, rule) {
                Some(b) => {
                    bump(&self.counters.removed_by_switch);
                    info!(
                        flow = %key,
                        server = %b.server,
                        ?reason,
                        secs = duration.as_secs(),
                        bytes = byte_count,
                        "switch removed flow"
                    );
                    Ok(Handled::Unbound)
                }
                None => {
                    debug!(flow = %key, %rule, "removal of an unknown rule");
                    Ok(Handled::Ignored)
                }
            },
            SwitchEvent::PortStatus { port, up, .. } => {
                let server = match self.pool.by_port(port) {
                    Some(s) => s,
                    None => {
                        debug!(port, up, "status change of a non-server port");
                        return Ok(Handled::Ignored);
                    }
                };
                if up {
                    Ok(if self.mark_up(server.addr) {
                        Handled::MarkedUp(server)
                    } else {
                        Handled::Ignored
                    })
                } else {
                    Ok(if self.mark_down(server.addr) {
                        Handled::MarkedDown(server)
                    } else {
                        Handled::Ignored
                    })
                }
            }
            SwitchEvent::FlowActivity {
                key, byte_count, ..
            } => Ok(if self.table.record_bytes(&key, byte_count, now) {
                Handled::Refreshed
            } else {
                Handled::Ignored
            }),
        }
    }

    fn new_flow(
        &self,
        switch_id: u64,
        in_port: u16,
        buffer_id: Option<u32>,
        raw: Vec<u8>,
        now: Instant,
    ) -> Result<Handled, LbError> {
        let key = match Packet::parse(&raw)
            .map_err(LbError::from)
            .and_then(|pkt| match pkt.nw {
                Nw::Arp(_) => Ok(None),
                _ => FlowKey::from_packet(&pkt).map(Some),
            }) {
            Ok(Some(key)) => key,
            Ok(None) => {
                bump(&self.counters.floods);
                self.forward(switch_id, in_port, OutPort::Flood, buffer_id, raw);
                return Ok(Handled::Flooded);
            }
            Err(e) => {
                bump(&self.counters.malformed);
                warn!(switch_id, in_port, error = %e, "dropping undecodable packet");
                return Err(e);
            }
        };

        if let Some(b) = self.table.lookup(&key) {
            self.table.touch(&key, now);
            bump(&self.counters.forwards);
            debug!(flow = %key, server = %b.server, "packet of a bound flow");
            self.forward(switch_id, in_port, OutPort::Port(b.server.port), buffer_id, raw);
            return Ok(Handled::Forwarded(b.server));
        }

        let reverse = key.reversed();
        if let Some(b) = self.table.lookup(&reverse) {
            self.table.touch(&reverse, now);
            bump(&self.counters.returns);
            debug!(flow = %reverse, "return traffic of a bound flow");
            self.forward(switch_id, in_port, OutPort::Port(b.client_port), buffer_id, raw);
            return Ok(Handled::Returned {
                client_port: b.client_port,
            });
        }

        // Servers answer, they never open flows through the balancer.
        if self.pool.by_port(in_port).is_some() || self.pool.contains(key.src) {
            bump(&self.counters.return_misses);
            debug!(flow = %key, in_port, "dropping server traffic with no binding");
            return Ok(Handled::Dropped);
        }

        let server = match self.policy.select(&key, &self.pool.members()) {
            Ok(s) => s,
            Err(e) => {
                bump(&self.counters.no_servers);
                warn!(flow = %key, "no live server for new flow");
                return Err(e);
            }
        };
        let binding = match self.table.bind(key, server, switch_id, in_port, now) {
            Ok(b) => b,
            Err(LbError::DuplicateBinding(_)) => {
                // Lost a race with another decision for this key; follow it.
                return match self.table.lookup(&key) {
                    Some(b) => {
                        self.forward(switch_id, in_port, OutPort::Port(b.server.port), buffer_id, raw);
                        Ok(Handled::Forwarded(b.server))
                    }
                    None => Ok(Handled::Ignored),
                };
            }
            Err(e) => return Err(e),
        };

        bump(&self.counters.installs);
        info!(
            flow = %key,
            server = %server,
            rule = %binding.rule,
            policy = %self.policy.kind(),
            "bound new flow"
        );
        self.adapter.submit(Submission::first(SwitchCommand::InstallRule(
            self.install_command(&binding, buffer_id),
        )));
        // A buffered packet is released by the rule itself.
        if buffer_id.is_none() {
            self.forward(switch_id, in_port, OutPort::Port(server.port), None, raw);
        }
        Ok(Handled::Installed(server))
    }

    fn forward(
        &self,
        switch_id: u64,
        in_port: u16,
        out_port: OutPort,
        buffer_id: Option<u32>,
        payload: Vec<u8>,
    ) {
        self.adapter
            .submit(Submission::first(SwitchCommand::ForwardPacket(ForwardPacket {
                switch_id,
                in_port,
                out_port,
                buffer_id,
                payload,
            })));
    }

    fn install_command(&self, b: &FlowBinding, buffer_id: Option<u32>) -> InstallRule {
        InstallRule {
            switch_id: b.switch_id,
            key: b.key,
            rule: b.rule,
            out_port: b.server.port,
            client_port: b.client_port,
            idle_timeout: self.config.idle_timeout,
            hard_timeout: self.config.hard_timeout,
            priority: self.config.rule_priority,
            buffer_id,
        }
    }

    fn delete_command(&self, b: &FlowBinding) -> SwitchCommand {
        SwitchCommand::DeleteRule(DeleteRule {
            switch_id: b.switch_id,
            key: b.key,
            rule: b.rule,
            priority: self.config.rule_priority,
        })
    }

    /// Process the outcome of an earlier command.
    pub fn handle_ack(&self, ack: CommandAck, now: Instant) {
        let CommandAck { submission, result } = ack;
        match (submission.command, result) {
            (SwitchCommand::InstallRule(cmd), Ok(())) => {
                if self.table.mark_installed(&cmd.key, cmd.rule) {
                    debug!(flow = %cmd.key, rule = %cmd.rule, "rule installed");
                }
            }
            (SwitchCommand::InstallRule(cmd), Err(e)) => {
                bump(&self.counters.install_failures);
                warn!(flow = %cmd.key, attempt = submission.attempt, error = %e, "install failed");
                self.install_failed(&cmd.key, cmd.rule, submission.attempt, now);
            }
            (SwitchCommand::DeleteRule(_), Ok(())) => (),
            (cmd, Err(e)) => {
                bump(&self.counters.command_failures);
                warn!(switch_id = cmd.switch_id(), error = %e, "switch command failed");
            }
            (SwitchCommand::ForwardPacket(_), Ok(())) => (),
        }
    }

    /// Retry the install of `key` or give up on the flow. `Some(true)` means
    /// abandoned, `None` means the failure was already handled.
    fn install_failed(
        &self,
        key: &FlowKey,
        rule: RuleHandle,
        attempt: u32,
        now: Instant,
    ) -> Option<bool> {
        if attempt > self.config.max_install_retries {
            let b = self.table.unbind_rule(key, rule)?;
            bump(&self.counters.abandoned);
            error!(
                flow = %key,
                server = %b.server,
                attempts = attempt,
                "abandoning flow after repeated install failures"
            );
            self.adapter.submit(Submission::first(self.delete_command(&b)));
            return Some(true);
        }
        let next = self.table.record_install_attempt(key, rule, attempt, now)?;
        let b = self.table.lookup(key)?;
        bump(&self.counters.retries);
        debug!(flow = %key, attempt = next, "reinstalling rule");
        self.adapter.submit(Submission {
            command: SwitchCommand::InstallRule(self.install_command(&b, None)),
            attempt: next,
        });
        Some(false)
    }

    /// Expire idle bindings and time out unacknowledged installs.
    ///
    /// Each expired binding yields exactly one `DeleteRule`.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        self.sweep_where(now, |_| true)
    }

    /// Like [`sweep`](Self::sweep), restricted to the flows worker `shard` of
    /// `shards` owns. Run on that worker, expiry is ordered with the worker's
    /// other events for the same key.
    pub fn sweep_shard(&self, now: Instant, shard: usize, shards: usize) -> SweepReport {
        self.sweep_where(now, |key| key.shard(shards) == shard)
    }

    fn sweep_where<F>(&self, now: Instant, owned: F) -> SweepReport
    where
        F: Fn(&FlowKey) -> bool,
    {
        // Without flow statistics an installed rule shows no traffic here; the
        // switch expires it on its own idle timeout and reports the removal.
        let polled = self.config.stats_interval.is_some();
        let expirable =
            |b: &FlowBinding| owned(&b.key) && (polled || b.state != InstallState::Installed);

        let mut report = SweepReport::default();
        for b in self
            .table
            .sweep_idle(now, self.config.idle_timeout, expirable)
        {
            bump(&self.counters.expired);
            debug!(flow = %b.key, server = %b.server, "expired idle flow");
            self.adapter.submit(Submission::first(self.delete_command(&b)));
            report.expired += 1;
        }
        for b in self
            .table
            .overdue_installs(now, self.config.ack_timeout, |b| owned(&b.key))
        {
            let attempt = match b.state {
                InstallState::Pending { attempts, .. } => attempts,
                InstallState::Installed => continue,
            };
            bump(&self.counters.install_failures);
            warn!(flow = %b.key, attempt, "install not acknowledged in time");
            match self.install_failed(&b.key, b.rule, attempt, now) {
                Some(true) => report.abandoned += 1,
                Some(false) => report.retried += 1,
                None => (),
            }
        }
        if report != SweepReport::default() {
            debug!(
                expired = report.expired,
                retried = report.retried,
                abandoned = report.abandoned,
                active = self.table.len(),
                "sweep"
            );
        }
        report
    }

    /// Drop every binding and delete its rules. Returns how many were dropped.
    pub fn flush(&self) -> usize {
        let removed = self.table.flush();
        for b in &removed {
            self.adapter.submit(Submission::first(self.delete_command(b)));
        }
        info!(flows = removed.len(), "flushed flow table");
        removed.len()
    }

    /// Take a server out of selection. Its existing flows stay bound.
    pub fn mark_down(&self, addr: Ipv4Addr) -> bool {
        let changed = self.pool.mark_down(addr);
        if changed {
            info!(server = %addr, "server down");
        }
        changed
    }

    pub fn mark_up(&self, addr: Ipv4Addr) -> bool {
        let changed = self.pool.mark_up(addr);
        if changed {
            info!(server = %addr, "server up");
        }
        changed
    }

    /// Add a live server. Returns false if its address is already in the pool.
    pub fn add_server(&self, server: ServerId) -> bool {
        let added = self.pool.insert(server);
        if added {
            info!(%server, "server added");
        }
        added
    }

    /// Remove a server from the pool. Flows already bound to it keep their rules.
    pub fn remove_server(&self, addr: Ipv4Addr) -> Option<ServerId> {
        let removed = self.pool.remove(addr);
        if let Some(server) = removed {
            info!(%server, "server removed");
        }
        removed
    }

    pub fn stats(&self) -> LbStats {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        LbStats {
            active_flows: self.table.len(),
            live_servers: self.pool.members().len(),
            installs: get(&c.installs),
            forwards: get(&c.forwards),
            returns: get(&c.returns),
            return_misses: get(&c.return_misses),
            floods: get(&c.floods),
            malformed: get(&c.malformed),
            no_servers: get(&c.no_servers),
            install_failures: get(&c.install_failures),
            retries: get(&c.retries),
            abandoned: get(&c.abandoned),
            expired: get(&c.expired),
            removed_by_switch: get(&c.removed_by_switch),
            command_failures: get(&c.command_failures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openflow0x01::FlowRemovedReason;
    use crate::packet::ip_proto;
    use crate::packet::tests::{ipv4_frame, tcp_segment};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Submission>>,
    }

    impl SwitchAdapter for Recorder {
        fn submit(&self, submission: Submission) {
            self.sent.lock().push(submission);
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<Submission> {
            std::mem::take(&mut *self.sent.lock())
        }

        fn installs(subs: &[Submission]) -> Vec<InstallRule> {
            subs.iter()
                .filter_map(|s| match s.command {
                    SwitchCommand::InstallRule(ref c) => Some(c.clone()),
                    _ => None,
                })
                .collect()
        }

        fn deletes(subs: &[Submission]) -> Vec<DeleteRule> {
            subs.iter()
                .filter_map(|s| match s.command {
                    SwitchCommand::DeleteRule(ref c) => Some(c.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    const VIP: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 100);
    const CLIENT_PORT: u16 = 10;

    fn setup(config: LbConfig) -> (LoadBalancer, Arc<Recorder>) {
        let rec = Arc::new(Recorder::default());
        let lb = LoadBalancer::new(config, rec.clone()).unwrap();
        (lb, rec)
    }

    fn config(policy: PolicyKind, servers: u8) -> LbConfig {
        LbConfig {
            policy,
            servers: LbConfig::numbered_servers(servers),
            ..LbConfig::default()
        }
    }

    fn tcp_from(client: Ipv4Addr, sport: u16) -> SwitchEvent {
        SwitchEvent::NewFlow {
            switch_id: 1,
            in_port: CLIENT_PORT,
            buffer_id: Some(7),
            raw: ipv4_frame(ip_proto::TCP, u32::from(client), u32::from(VIP), &tcp_segment(sport, 80)),
        }
    }

    fn key_of(client: Ipv4Addr, sport: u16) -> FlowKey {
        FlowKey::new(ip_proto::TCP, client, sport, VIP, 80)
    }

    fn client(i: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, i)
    }

    #[test]
    fn rejects_invalid_config() {
        let rec = Arc::new(Recorder::default());
        let mut config = LbConfig::default();
        config.servers.clear();
        assert!(matches!(
            LoadBalancer::new(config, rec),
            Err(LbError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn round_robin_scenario() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 3));
        let now = Instant::now();
        let servers = LbConfig::numbered_servers(3);
        let picks: Vec<_> = (1..=4)
            .map(|i| match lb.handle_event(tcp_from(client(i), 1000), now).unwrap() {
                Handled::Installed(s) => s,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(picks, vec![servers[0], servers[1], servers[2], servers[0]]);
        let installs = Recorder::installs(&rec.take());
        assert_eq!(installs.len(), 4);
        assert_eq!(installs[0].out_port, 1);
        assert_eq!(installs[0].client_port, CLIENT_PORT);
        assert_eq!(installs[0].buffer_id, Some(7));
    }

    #[test]
    fn bound_flow_is_forwarded_without_reselection() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 3));
        let now = Instant::now();
        let first = lb.handle_event(tcp_from(client(1), 1000), now).unwrap();
        let server = match first {
            Handled::Installed(s) => s,
            other => panic!("unexpected {:?}", other),
        };
        rec.take();
        assert_eq!(
            lb.handle_event(tcp_from(client(1), 1000), now).unwrap(),
            Handled::Forwarded(server)
        );
        let sent = rec.take();
        assert!(Recorder::installs(&sent).is_empty());
        assert!(matches!(
            sent[0].command,
            SwitchCommand::ForwardPacket(ForwardPacket { out_port: OutPort::Port(p), .. }) if p == server.port
        ));
        // the next new flow continues the rotation where it left off
        assert_eq!(
            lb.handle_event(tcp_from(client(2), 1000), now).unwrap(),
            Handled::Installed(LbConfig::numbered_servers(3)[1])
        );
    }

    #[test]
    fn unbuffered_packet_is_forwarded_with_the_install() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 2));
        let event = match tcp_from(client(1), 1000) {
            SwitchEvent::NewFlow { switch_id, in_port, raw, .. } => SwitchEvent::NewFlow {
                switch_id,
                in_port,
                buffer_id: None,
                raw,
            },
            _ => unreachable!(),
        };
        lb.handle_event(event, Instant::now()).unwrap();
        let sent = rec.take();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[1].command, SwitchCommand::ForwardPacket(_)));
    }

    #[test]
    fn ip_hashing_keeps_clients_together() {
        let (lb, _rec) = setup(config(PolicyKind::IpHashing, 4));
        let now = Instant::now();
        let first = lb.handle_event(tcp_from(client(9), 1000), now).unwrap();
        for sport in 1001..1010 {
            assert_eq!(lb.handle_event(tcp_from(client(9), sport), now).unwrap(), first);
        }
    }

    #[test]
    fn down_server_is_skipped_but_keeps_flows() {
        let (lb, _rec) = setup(config(PolicyKind::RoundRobin, 2));
        let servers = LbConfig::numbered_servers(2);
        let now = Instant::now();
        lb.handle_event(tcp_from(client(1), 1000), now).unwrap();
        assert_eq!(
            lb.handle_event(
                SwitchEvent::PortStatus { switch_id: 1, port: servers[0].port, up: false },
                now
            )
            .unwrap(),
            Handled::MarkedDown(servers[0])
        );
        for i in 2..6 {
            assert_eq!(
                lb.handle_event(tcp_from(client(i), 1000), now).unwrap(),
                Handled::Installed(servers[1])
            );
        }
        assert_eq!(lb.binding(&key_of(client(1), 1000)).unwrap().server, servers[0]);

        assert_eq!(
            lb.handle_event(
                SwitchEvent::PortStatus { switch_id: 1, port: servers[0].port, up: true },
                now
            )
            .unwrap(),
            Handled::MarkedUp(servers[0])
        );
        assert_eq!(lb.stats().live_servers, 2);
    }

    #[test]
    #[traced_test]
    fn empty_pool_drops_and_counts() {
        let (lb, rec) = setup(config(PolicyKind::Random, 1));
        let only = LbConfig::numbered_servers(1)[0];
        lb.mark_down(only.addr);
        assert!(matches!(
            lb.handle_event(tcp_from(client(1), 1000), Instant::now()),
            Err(LbError::NoServersAvailable)
        ));
        assert!(rec.take().is_empty());
        assert!(lb.binding(&key_of(client(1), 1000)).is_none());
        assert_eq!(lb.stats().no_servers, 1);
        assert!(logs_contain("no live server for new flow"));
    }

    #[test]
    fn malformed_frames_are_counted() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 2));
        let event = SwitchEvent::NewFlow {
            switch_id: 1,
            in_port: 1,
            buffer_id: None,
            raw: vec![0; 10],
        };
        assert!(matches!(
            lb.handle_event(event, Instant::now()),
            Err(LbError::MalformedHeader(_))
        ));
        assert!(rec.take().is_empty());
        assert_eq!(lb.stats().malformed, 1);
    }

    #[test]
    fn arp_is_flooded() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 2));
        let mut raw = vec![0xff; 6];
        raw.extend_from_slice(&[0, 0, 0, 0, 0, 1]);
        raw.extend_from_slice(&[0x08, 0x06]);
        raw.extend_from_slice(&[0, 1, 0x08, 0, 6, 4, 0, 1]);
        raw.extend_from_slice(&[0, 0, 0, 0, 0, 1, 10, 0, 0, 1]);
        raw.extend_from_slice(&[0, 0, 0, 0, 0, 0, 10, 1, 1, 100]);
        let event = SwitchEvent::NewFlow {
            switch_id: 1,
            in_port: CLIENT_PORT,
            buffer_id: None,
            raw,
        };
        assert_eq!(lb.handle_event(event, Instant::now()).unwrap(), Handled::Flooded);
        assert!(matches!(
            rec.take()[0].command,
            SwitchCommand::ForwardPacket(ForwardPacket { out_port: OutPort::Flood, .. })
        ));
        assert_eq!(lb.stats().active_flows, 0);
    }

    fn reply_to(client: Ipv4Addr, sport: u16, in_port: u16) -> SwitchEvent {
        SwitchEvent::NewFlow {
            switch_id: 1,
            in_port,
            buffer_id: None,
            raw: ipv4_frame(ip_proto::TCP, u32::from(VIP), u32::from(client), &tcp_segment(80, sport)),
        }
    }

    #[test]
    fn return_traffic_goes_back_to_the_client() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 2));
        let now = Instant::now();
        let server = match lb.handle_event(tcp_from(client(1), 1000), now).unwrap() {
            Handled::Installed(s) => s,
            other => panic!("unexpected {:?}", other),
        };
        let install = Recorder::installs(&rec.take()).remove(0);
        assert_eq!(install.client_port, CLIENT_PORT);

        assert_eq!(
            lb.handle_event(reply_to(client(1), 1000, server.port), now).unwrap(),
            Handled::Returned { client_port: CLIENT_PORT }
        );
        assert!(matches!(
            rec.take()[0].command,
            SwitchCommand::ForwardPacket(ForwardPacket { out_port: OutPort::Port(CLIENT_PORT), .. })
        ));
        assert_eq!(lb.stats().returns, 1);
    }

    #[test]
    fn unbound_server_traffic_is_dropped() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 2));
        let server_port = LbConfig::numbered_servers(2)[1].port;
        assert_eq!(
            lb.handle_event(reply_to(client(5), 5000, server_port), Instant::now()).unwrap(),
            Handled::Dropped
        );
        assert!(rec.take().is_empty());
        let stats = lb.stats();
        assert_eq!((stats.return_misses, stats.installs), (1, 0));
    }

    #[test]
    fn flow_removed_unbinds_without_delete() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 2));
        let now = Instant::now();
        lb.handle_event(tcp_from(client(1), 1000), now).unwrap();
        let key = key_of(client(1), 1000);
        let rule = lb.binding(&key).unwrap().rule;
        rec.take();
        let removed = |rule| SwitchEvent::FlowRemoved {
            switch_id: 1,
            key,
            rule,
            duration: Duration::from_secs(30),
            byte_count: 1500,
            reason: FlowRemovedReason::IdleTimeout,
        };
        assert_eq!(lb.handle_event(removed(RuleHandle(0)), now).unwrap(), Handled::Ignored);
        assert_eq!(lb.handle_event(removed(rule), now).unwrap(), Handled::Unbound);
        assert_eq!(lb.handle_event(removed(rule), now).unwrap(), Handled::Ignored);
        assert!(rec.take().is_empty());
        assert_eq!(lb.stats().active_flows, 0);
    }

    #[test]
    fn sweep_emits_one_delete_per_expired_flow() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 2));
        let t0 = Instant::now();
        let idle = lb.config().idle_timeout;
        lb.handle_event(tcp_from(client(1), 1000), t0).unwrap();
        lb.handle_event(tcp_from(client(2), 1000), t0).unwrap();
        for s in rec.take() {
            lb.handle_ack(CommandAck::ok(s), t0);
        }
        // activity reported by flow statistics keeps client 2 alive
        let later = t0 + idle / 2;
        assert_eq!(
            lb.handle_event(
                SwitchEvent::FlowActivity { switch_id: 1, key: key_of(client(2), 1000), byte_count: 64 },
                later
            )
            .unwrap(),
            Handled::Refreshed
        );

        let report = lb.sweep(t0 + idle + Duration::from_secs(1));
        assert_eq!(report.expired, 1);
        let deletes = Recorder::deletes(&rec.take());
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].key, key_of(client(1), 1000));
        assert!(lb.binding(&key_of(client(2), 1000)).is_some());

        assert_eq!(lb.sweep(t0 + idle + Duration::from_secs(1)).expired, 0);
        assert!(rec.take().is_empty());
    }

    #[test]
    fn without_stats_installed_flows_are_left_to_the_switch() {
        let mut cfg = config(PolicyKind::RoundRobin, 2);
        cfg.stats_interval = None;
        let (lb, rec) = setup(cfg);
        let t0 = Instant::now();
        lb.handle_event(tcp_from(client(1), 1000), t0).unwrap();
        lb.handle_event(tcp_from(client(2), 1000), t0).unwrap();
        let sent = rec.take();
        lb.handle_ack(CommandAck::ok(sent[0].clone()), t0);

        // only the never-acknowledged flow expires here
        let report = lb.sweep(t0 + lb.config().idle_timeout + Duration::from_millis(1));
        assert_eq!(report.expired, 1);
        let deletes = Recorder::deletes(&rec.take());
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].key, key_of(client(2), 1000));

        let installed = lb.binding(&key_of(client(1), 1000)).unwrap();
        assert_eq!(installed.state, InstallState::Installed);
        assert_eq!(
            lb.handle_event(
                SwitchEvent::FlowRemoved {
                    switch_id: 1,
                    key: installed.key,
                    rule: installed.rule,
                    duration: Duration::from_secs(31),
                    byte_count: 0,
                    reason: FlowRemovedReason::IdleTimeout,
                },
                t0
            )
            .unwrap(),
            Handled::Unbound
        );
    }

    #[test]
    fn shard_sweep_only_expires_owned_flows() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 2));
        let t0 = Instant::now();
        for i in 1..=8 {
            lb.handle_event(tcp_from(client(i), 1000), t0).unwrap();
        }
        for s in rec.take() {
            lb.handle_ack(CommandAck::ok(s), t0);
        }
        let later = t0 + lb.config().idle_timeout + Duration::from_secs(1);

        let first = lb.sweep_shard(later, 0, 2);
        let deletes = Recorder::deletes(&rec.take());
        assert_eq!(deletes.len(), first.expired);
        assert!(deletes.iter().all(|d| d.key.shard(2) == 0));
        assert_eq!(lb.stats().active_flows, 8 - first.expired);

        let second = lb.sweep_shard(later, 1, 2);
        assert!(Recorder::deletes(&rec.take()).iter().all(|d| d.key.shard(2) == 1));
        assert_eq!(first.expired + second.expired, 8);
        assert_eq!(lb.stats().active_flows, 0);
    }

    #[test]
    fn failed_installs_are_retried_then_abandoned() {
        let mut cfg = config(PolicyKind::RoundRobin, 2);
        cfg.max_install_retries = 2;
        let (lb, rec) = setup(cfg);
        let now = Instant::now();
        lb.handle_event(tcp_from(client(1), 1000), now).unwrap();
        let key = key_of(client(1), 1000);

        for expected in 2..=3 {
            let install = rec
                .take()
                .into_iter()
                .find(|s| matches!(s.command, SwitchCommand::InstallRule(_)))
                .unwrap();
            lb.handle_ack(CommandAck::failed(install, "table full"), now);
            let retry = rec.sent.lock()[0].clone();
            assert_eq!(retry.attempt, expected);
            assert_eq!(Recorder::installs(&[retry.clone()])[0].buffer_id, None);
        }
        let last = rec.take().remove(0);
        lb.handle_ack(CommandAck::failed(last, "table full"), now);
        assert!(lb.binding(&key).is_none());
        assert_eq!(Recorder::deletes(&rec.take()).len(), 1);
        let stats = lb.stats();
        assert_eq!((stats.install_failures, stats.retries, stats.abandoned), (3, 2, 1));
    }

    #[test]
    fn duplicate_failure_reports_retry_once() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 2));
        let now = Instant::now();
        lb.handle_event(tcp_from(client(1), 1000), now).unwrap();
        let install = rec.take().remove(0);
        lb.handle_ack(CommandAck::failed(install.clone(), "x"), now);
        lb.handle_ack(CommandAck::failed(install, "x"), now);
        assert_eq!(Recorder::installs(&rec.take()).len(), 1);
    }

    #[test]
    fn unacknowledged_install_times_out() {
        let (lb, rec) = setup(config(PolicyKind::RoundRobin, 2));
        let t0 = Instant::now();
        lb.handle_event(tcp_from(client(1), 1000), t0).unwrap();
        rec.take();
        let ack_timeout = lb.config().ack_timeout;
        assert_eq!(lb.sweep(t0 + ack_timeout / 2), SweepReport::default());
        let report = lb.sweep(t0 + ack_timeout + Duration::from_millis(1));
        assert_eq!(report.retried, 1);
        let sent = rec.take();
        assert_eq!(sent[0].attempt, 2);

        lb.handle_ack(CommandAck::ok(sent[0].clone()), t0 + ack_timeout * 2);
        assert!(matches!(
            lb.binding(&key_of(client(1), 1000)).unwrap().state,
            InstallState::Installed
        ));
    }

    #[test]
    fn flush_deletes_every_binding() {
        let (lb, rec) = setup(config(PolicyKind::Random, 3));
        let now = Instant::now();
        for i in 1..=5 {
            lb.handle_event(tcp_from(client(i), 1000), now).unwrap();
        }
        rec.take();
        assert_eq!(lb.flush(), 5);
        assert_eq!(Recorder::deletes(&rec.take()).len(), 5);
        assert_eq!(lb.stats().active_flows, 0);
    }

    #[test]
    fn pool_can_grow_and_shrink() {
        let (lb, _rec) = setup(config(PolicyKind::RoundRobin, 1));
        let extra = ServerId::new(Ipv4Addr::new(10, 1, 1, 50), 50);
        assert!(lb.add_server(extra));
        assert!(!lb.add_server(extra));
        let now = Instant::now();
        lb.handle_event(tcp_from(client(1), 1000), now).unwrap();
        assert_eq!(
            lb.handle_event(tcp_from(client(2), 1000), now).unwrap(),
            Handled::Installed(extra)
        );
        assert_eq!(lb.remove_server(extra.addr), Some(extra));
        // the flow bound to the removed server is untouched
        assert_eq!(lb.binding(&key_of(client(2), 1000)).unwrap().server, extra);
        assert_eq!(lb.servers().len(), 1);
    }
}
