//! The controller's record of which flows are bound to which server.
//!
//! Bindings live in a sharded concurrent map: lookups on different shards
//! never contend, and every write to a key happens under that key's shard
//! lock, so the state of one key always moves Absent → Bound → Absent
//! atomically.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::LbError;
use crate::flow_key::FlowKey;
use crate::server_pool::ServerId;

/// Identifies the switch rules enforcing one binding. Carried to the switch
/// as the OpenFlow cookie of those rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleHandle(pub u64);

impl fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rule#{}", self.0)
    }
}

/// Whether the switch has confirmed the rule of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    /// Install sent `attempts` times, the latest at `since`, not yet acknowledged.
    Pending { attempts: u32, since: Instant },
    Installed,
}

/// One active flow and the server it is pinned to.
#[derive(Debug, Clone)]
pub struct FlowBinding {
    pub key: FlowKey,
    pub server: ServerId,
    pub switch_id: u64,
    /// Switch port the client's traffic arrived on; return traffic goes out here.
    pub client_port: u16,
    pub rule: RuleHandle,
    pub installed_at: Instant,
    pub last_activity: Instant,
    /// Byte counter last reported by the switch for the forward rule.
    pub byte_count: u64,
    pub state: InstallState,
}

/// Concurrent map from flow key to binding.
pub struct FlowTable {
    bindings: DashMap<FlowKey, FlowBinding>,
    next_rule: AtomicU64,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    pub fn new() -> FlowTable {
        FlowTable {
            bindings: DashMap::new(),
            next_rule: AtomicU64::new(1),
        }
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<FlowBinding> {
        self.bindings.get(key).map(|b| b.value().clone())
    }

    /// Record a new binding for `key`.
    ///
    /// Fails with `DuplicateBinding` if `key` is already bound; callers are
    /// expected to `lookup` first.
    pub fn bind(
        &self,
        key: FlowKey,
        server: ServerId,
        switch_id: u64,
        client_port: u16,
        now: Instant,
    ) -> Result<FlowBinding, LbError> {
        match self.bindings.entry(key) {
            Entry::Occupied(_) => Err(LbError::DuplicateBinding(key)),
            Entry::Vacant(slot) => {
                let binding = FlowBinding {
                    key,
                    server,
                    switch_id,
                    client_port,
                    rule: RuleHandle(self.next_rule.fetch_add(1, Ordering::Relaxed)),
                    installed_at: now,
                    last_activity: now,
                    byte_count: 0,
                    state: InstallState::Pending {
                        attempts: 1,
                        since: now,
                    },
                };
                slot.insert(binding.clone());
                Ok(binding)
            }
        }
    }

    /// Remove the binding of `key`. Unbinding an absent key is a no-op.
    pub fn unbind(&self, key: &FlowKey) -> Option<FlowBinding> {
        self.bindings.remove(key).map(|(_, b)| b)
    }

    /// Remove the binding of `key` only if it is still enforced by `rule`.
    ///
    /// A notification about an older rule for the same key must not tear
    /// down a newer binding.
    pub fn unbind_rule(&self, key: &FlowKey, rule: RuleHandle) -> Option<FlowBinding> {
        self.bindings
            .remove_if(key, |_, b| b.rule == rule)
            .map(|(_, b)| b)
    }

    /// Refresh the activity timestamp of `key`. Returns false if unbound.
    pub fn touch(&self, key: &FlowKey, now: Instant) -> bool {
        match self.bindings.get_mut(key) {
            Some(mut b) => {
                if now > b.last_activity {
                    b.last_activity = now;
                }
                true
            }
            None => false,
        }
    }

    /// Record a byte counter reported by the switch, refreshing activity if
    /// the counter moved. Returns true when the flow was active.
    pub fn record_bytes(&self, key: &FlowKey, byte_count: u64, now: Instant) -> bool {
        match self.bindings.get_mut(key) {
            Some(mut b) if byte_count != b.byte_count => {
                b.byte_count = byte_count;
                if now > b.last_activity {
                    b.last_activity = now;
                }
                true
            }
            _ => false,
        }
    }

    /// The switch confirmed `rule`. Returns false if the binding is gone or
    /// has been replaced.
    pub fn mark_installed(&self, key: &FlowKey, rule: RuleHandle) -> bool {
        match self.bindings.get_mut(key) {
            Some(mut b) if b.rule == rule => {
                b.state = InstallState::Installed;
                true
            }
            _ => false,
        }
    }

    /// Count one more install attempt for `rule`, returning the new total.
    ///
    /// Only succeeds while the binding is still pending at `seen` attempts, so
    /// two reports of the same failed attempt trigger one retry.
    pub fn record_install_attempt(
        &self,
        key: &FlowKey,
        rule: RuleHandle,
        seen: u32,
        now: Instant,
    ) -> Option<u32> {
        let mut b = self.bindings.get_mut(key)?;
        let (current, state) = (b.rule, b.state);
        match state {
            InstallState::Pending { attempts, .. } if current == rule && attempts == seen => {
                b.state = InstallState::Pending {
                    attempts: attempts + 1,
                    since: now,
                };
                Some(attempts + 1)
            }
            _ => None,
        }
    }

    /// Remove and return every binding accepted by `select` that has been
    /// idle for longer than `idle`.
    ///
    /// Removal re-checks the timestamp under the shard lock, so a flow touched
    /// while the sweep runs survives.
    pub fn sweep_idle<F>(&self, now: Instant, idle: Duration, select: F) -> Vec<FlowBinding>
    where
        F: Fn(&FlowBinding) -> bool,
    {
        let is_idle =
            |b: &FlowBinding| select(b) && now.saturating_duration_since(b.last_activity) > idle;
        let candidates: Vec<FlowKey> = self
            .bindings
            .iter()
            .filter(|e| is_idle(e.value()))
            .map(|e| *e.key())
            .collect();
        candidates
            .into_iter()
            .filter_map(|k| self.bindings.remove_if(&k, |_, b| is_idle(b)))
            .map(|(_, b)| b)
            .collect()
    }

    /// Bindings accepted by `select` whose latest install attempt has gone
    /// unanswered for longer than `timeout`.
    pub fn overdue_installs<F>(&self, now: Instant, timeout: Duration, select: F) -> Vec<FlowBinding>
    where
        F: Fn(&FlowBinding) -> bool,
    {
        self.bindings
            .iter()
            .filter(|e| select(e.value()))
            .filter(|e| match e.value().state {
                InstallState::Pending { since, .. } => now.saturating_duration_since(since) > timeout,
                InstallState::Installed => false,
            })
            .map(|e| e.value().clone())
            .collect()
    }

    /// Remove every binding.
    pub fn flush(&self) -> Vec<FlowBinding> {
        let keys: Vec<FlowKey> = self.bindings.iter().map(|e| *e.key()).collect();
        keys.iter()
            .filter_map(|k| self.bindings.remove(k))
            .map(|(_, b)| b)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ip_proto;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::thread;

    fn key(sport: u16) -> FlowKey {
        FlowKey::new(
            ip_proto::TCP,
            Ipv4Addr::new(10, 0, 0, 1),
            sport,
            Ipv4Addr::new(10, 1, 1, 100),
            80,
        )
    }

    fn server() -> ServerId {
        ServerId::new(Ipv4Addr::new(10, 1, 1, 2), 2)
    }

    #[test]
    fn bind_then_lookup() {
        let table = FlowTable::new();
        let now = Instant::now();
        assert!(table.lookup(&key(1)).is_none());
        let b = table.bind(key(1), server(), 1, 7, now).unwrap();
        assert_eq!(b.server, server());
        assert_eq!(b.client_port, 7);
        assert_eq!(b.installed_at, now);
        assert!(matches!(b.state, InstallState::Pending { attempts: 1, .. }));
        assert_eq!(table.lookup(&key(1)).unwrap().rule, b.rule);
    }

    #[test]
    fn second_bind_is_a_duplicate() {
        let table = FlowTable::new();
        let now = Instant::now();
        table.bind(key(1), server(), 1, 7, now).unwrap();
        assert!(matches!(
            table.bind(key(1), server(), 1, 7, now),
            Err(LbError::DuplicateBinding(k)) if k == key(1)
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rule_handles_are_unique() {
        let table = FlowTable::new();
        let now = Instant::now();
        let a = table.bind(key(1), server(), 1, 7, now).unwrap();
        let b = table.bind(key(2), server(), 1, 7, now).unwrap();
        assert_ne!(a.rule, b.rule);
    }

    #[test]
    fn unbind_is_idempotent() {
        let table = FlowTable::new();
        let now = Instant::now();
        table.bind(key(1), server(), 1, 7, now).unwrap();
        table.bind(key(2), server(), 1, 7, now).unwrap();
        assert!(table.unbind(&key(1)).is_some());
        let after_first: Vec<_> = {
            let mut v: Vec<_> = table.bindings.iter().map(|e| *e.key()).collect();
            v.sort();
            v
        };
        assert!(table.unbind(&key(1)).is_none());
        let mut after_second: Vec<_> = table.bindings.iter().map(|e| *e.key()).collect();
        after_second.sort();
        assert_eq!(after_first, after_second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_rule_does_not_unbind() {
        let table = FlowTable::new();
        let now = Instant::now();
        let old = table.bind(key(1), server(), 1, 7, now).unwrap();
        table.unbind(&key(1));
        let new = table.bind(key(1), server(), 1, 7, now).unwrap();
        assert!(table.unbind_rule(&key(1), old.rule).is_none());
        assert!(table.unbind_rule(&key(1), new.rule).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn sweep_removes_only_idle_bindings() {
        let table = FlowTable::new();
        let t0 = Instant::now();
        let idle = Duration::from_secs(10);
        table.bind(key(1), server(), 1, 7, t0).unwrap();
        table.bind(key(2), server(), 1, 7, t0).unwrap();
        assert!(table.touch(&key(2), t0 + Duration::from_secs(8)));

        let expired = table.sweep_idle(t0 + Duration::from_secs(11), idle, |_| true);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, key(1));
        assert!(table.lookup(&key(2)).is_some());

        // nothing left to expire at the same instant
        assert!(table.sweep_idle(t0 + Duration::from_secs(11), idle, |_| true).is_empty());
    }

    #[test]
    fn sweep_leaves_unselected_bindings() {
        let table = FlowTable::new();
        let t0 = Instant::now();
        table.bind(key(1), server(), 1, 7, t0).unwrap();
        table.bind(key(2), server(), 1, 7, t0).unwrap();
        let later = t0 + Duration::from_secs(60);
        let expired = table.sweep_idle(later, Duration::from_secs(10), |b| b.key == key(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, key(2));
        assert!(table.lookup(&key(1)).is_some());
    }

    #[test]
    fn byte_counter_refreshes_activity_only_when_it_moves() {
        let table = FlowTable::new();
        let t0 = Instant::now();
        table.bind(key(1), server(), 1, 7, t0).unwrap();
        let t1 = t0 + Duration::from_secs(5);
        assert!(table.record_bytes(&key(1), 100, t1));
        assert!(!table.record_bytes(&key(1), 100, t1 + Duration::from_secs(5)));
        assert_eq!(table.lookup(&key(1)).unwrap().last_activity, t1);
        assert!(!table.record_bytes(&key(9), 100, t1));
    }

    #[test]
    fn install_attempts_are_counted() {
        let table = FlowTable::new();
        let t0 = Instant::now();
        let b = table.bind(key(1), server(), 1, 7, t0).unwrap();
        assert_eq!(table.record_install_attempt(&key(1), b.rule, 1, t0), Some(2));
        // the same attempt reported twice only counts once
        assert_eq!(table.record_install_attempt(&key(1), b.rule, 1, t0), None);
        assert_eq!(table.record_install_attempt(&key(1), RuleHandle(999), 2, t0), None);
        let overdue =
            table.overdue_installs(t0 + Duration::from_secs(2), Duration::from_secs(1), |_| true);
        assert_eq!(overdue.len(), 1);
        assert!(table.mark_installed(&key(1), b.rule));
        assert!(table
            .overdue_installs(t0 + Duration::from_secs(2), Duration::from_secs(1), |_| true)
            .is_empty());
    }

    #[test]
    fn flush_empties_the_table() {
        let table = FlowTable::new();
        let now = Instant::now();
        for p in 0..10 {
            table.bind(key(p), server(), 1, 7, now).unwrap();
        }
        assert_eq!(table.flush().len(), 10);
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_binds_of_one_key_yield_one_winner() {
        let table = Arc::new(FlowTable::new());
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || table.bind(key(1), server(), 1, 7, now).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }
}
