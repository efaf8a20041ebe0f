//! Controller configuration. Built once at startup and never mutated.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::LbError;
use crate::policy::{HashInput, PolicyKind};
use crate::server_pool::ServerId;

/// The OpenFlow controller port.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:6633";

/// First backend address generated by [`LbConfig::numbered_servers`].
pub const SERVER_BASE: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);

#[derive(Debug, Clone)]
pub struct LbConfig {
    pub policy: PolicyKind,
    pub servers: Vec<ServerId>,
    /// A binding with no traffic for this long is removed.
    pub idle_timeout: Duration,
    /// Lifetime cap of an installed rule. `None` leaves rules permanent.
    pub hard_timeout: Option<Duration>,
    /// Seed of the random policy.
    pub seed: u64,
    pub workers: usize,
    pub sweep_interval: Duration,
    /// How long an install may go unacknowledged before it counts as failed.
    pub ack_timeout: Duration,
    /// Reinstalls attempted after the first failed install before the flow is
    /// abandoned.
    pub max_install_retries: u32,
    /// Period of flow statistics polling. Must be shorter than `idle_timeout`.
    /// `None` disables polling, and installed rules then expire on the switch.
    pub stats_interval: Option<Duration>,
    pub hash_input: HashInput,
    pub rule_priority: u16,
    pub listen: SocketAddr,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::RoundRobin,
            servers: LbConfig::numbered_servers(4),
            idle_timeout: Duration::from_secs(30),
            hard_timeout: None,
            seed: 0,
            workers: 4,
            sweep_interval: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(2),
            max_install_retries: 3,
            stats_interval: Some(Duration::from_secs(5)),
            hash_input: HashInput::ClientAddr,
            rule_priority: 100,
            listen: SocketAddr::from(([0, 0, 0, 0], 6633)),
        }
    }
}

impl LbConfig {
    /// `n` servers `10.1.1.1 ..= 10.1.1.n`, the i-th attached to switch port i.
    pub fn numbered_servers(n: u8) -> Vec<ServerId> {
        let base = u32::from(SERVER_BASE);
        (0..n)
            .map(|i| ServerId::new(Ipv4Addr::from(base + i as u32), i as u16 + 1))
            .collect()
    }

    /// Check the invariants the controller relies on.
    pub fn validate(&self) -> Result<(), LbError> {
        let invalid = |msg: String| Err(LbError::ConfigurationInvalid(msg));

        if self.servers.is_empty() {
            return invalid("at least one server is required".to_string());
        }
        let mut seen = HashSet::new();
        for s in &self.servers {
            if !seen.insert(s.addr) {
                return invalid(format!("duplicate server address {}", s.addr));
            }
        }
        if self.idle_timeout.is_zero() {
            return invalid("idle timeout must be positive".to_string());
        }
        // OpenFlow 1.0 carries rule timeouts as 16-bit seconds.
        if self.idle_timeout.as_secs() > u16::MAX as u64 {
            return invalid(format!(
                "idle timeout of {}s does not fit an OpenFlow rule",
                self.idle_timeout.as_secs()
            ));
        }
        match self.hard_timeout {
            Some(t) if t.is_zero() => return invalid("hard timeout must be positive".to_string()),
            Some(t) if t.as_secs() > u16::MAX as u64 => {
                return invalid(format!(
                    "hard timeout of {}s does not fit an OpenFlow rule",
                    t.as_secs()
                ))
            }
            _ => (),
        }
        if self.ack_timeout.is_zero() {
            return invalid("ack timeout must be positive".to_string());
        }
        if self.sweep_interval.is_zero() {
            return invalid("sweep interval must be positive".to_string());
        }
        match self.stats_interval {
            Some(t) if t.is_zero() => return invalid("stats interval must be positive".to_string()),
            // Statistics are the only sign of traffic on an installed rule.
            Some(t) if t >= self.idle_timeout => {
                return invalid(format!(
                    "stats interval of {:?} must be shorter than the idle timeout of {:?}",
                    t, self.idle_timeout
                ))
            }
            _ => (),
        }
        if self.workers == 0 {
            return invalid("at least one worker is required".to_string());
        }
        Ok(())
    }
}
