//! Backend selection strategies.
//!
//! A policy picks one server for a flow that has no binding yet. Policies are
//! consulted only on a flow table miss; once a flow is bound its server is
//! never re-selected.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::bits::combine;
use crate::error::LbError;
use crate::flow_key::FlowKey;
use crate::server_pool::ServerId;

/// Common contract of all selection policies.
pub trait SelectionPolicy: Send + Sync {
    /// Choose a server among `members` for `key`.
    ///
    /// Fails with `NoServersAvailable` when `members` is empty.
    fn select(&self, key: &FlowKey, members: &[ServerId]) -> Result<ServerId, LbError>;

    fn kind(&self) -> PolicyKind;
}

/// The policies the controller can be started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Random,
    RoundRobin,
    IpHashing,
}

impl FromStr for PolicyKind {
    type Err = LbError;

    fn from_str(s: &str) -> Result<PolicyKind, LbError> {
        match s {
            "random" => Ok(PolicyKind::Random),
            "round-robin" => Ok(PolicyKind::RoundRobin),
            "ip-hashing" => Ok(PolicyKind::IpHashing),
            other => Err(LbError::ConfigurationInvalid(format!(
                "unknown load balancer type `{}` (expected random, round-robin or ip-hashing)",
                other
            ))),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            PolicyKind::Random => "random",
            PolicyKind::RoundRobin => "round-robin",
            PolicyKind::IpHashing => "ip-hashing",
        })
    }
}

/// Uniform (or weight-proportional) random choice.
///
/// The generator is seeded once at construction so a given seed always
/// produces the same sequence of choices for the same sequence of pools.
pub struct RandomPolicy {
    rng: Mutex<StdRng>,
}

impl RandomPolicy {
    pub fn new(seed: u64) -> RandomPolicy {
        RandomPolicy {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl SelectionPolicy for RandomPolicy {
    fn select(&self, _: &FlowKey, members: &[ServerId]) -> Result<ServerId, LbError> {
        if members.is_empty() {
            return Err(LbError::NoServersAvailable);
        }
        // All-zero weights fall back to a uniform choice.
        let dist = WeightedIndex::new(members.iter().map(|m| m.weight))
            .or_else(|_| WeightedIndex::new(members.iter().map(|_| 1u32)))
            .map_err(|_| LbError::NoServersAvailable)?;
        let idx = dist.sample(&mut *self.rng.lock());
        Ok(members[idx])
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::Random
    }
}

/// Rotation over the live members.
///
/// The cursor advances once per decision and is reduced modulo the pool size
/// at call time. Rotation is only exactly fair over a stable pool: when the
/// pool grows or shrinks a server may be skipped or picked twice in a row.
#[derive(Default)]
pub struct RoundRobinPolicy {
    cursor: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> RoundRobinPolicy {
        RoundRobinPolicy::default()
    }

    /// Current cursor value. Starts at 0.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }
}

impl SelectionPolicy for RoundRobinPolicy {
    fn select(&self, _: &FlowKey, members: &[ServerId]) -> Result<ServerId, LbError> {
        if members.is_empty() {
            return Err(LbError::NoServersAvailable);
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(members[n % members.len()])
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::RoundRobin
    }
}

/// What part of the flow key feeds the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashInput {
    /// Client address only: every flow of a client lands on the same server.
    ClientAddr,
    /// The whole 5-tuple: flows of one client spread over the pool.
    FiveTuple,
}

/// Rendezvous (highest random weight) hashing.
///
/// Every member gets a score `hash(input, member address)` and the highest
/// score wins. For a fixed pool the same input always maps to the same server.
/// Taking k servers out of n only moves the inputs whose winner was one of
/// those k, about k/n of them; adding k servers moves about k/(n+k).
pub struct IpHashPolicy {
    input: HashInput,
}

impl IpHashPolicy {
    pub fn new(input: HashInput) -> IpHashPolicy {
        IpHashPolicy { input }
    }

    fn input_hash(&self, key: &FlowKey) -> u64 {
        match self.input {
            HashInput::ClientAddr => u32::from(key.src) as u64,
            HashInput::FiveTuple => key.stable_hash(),
        }
    }

    fn score(input: u64, server: &ServerId) -> u64 {
        combine(input, u32::from(server.addr) as u64)
    }
}

impl SelectionPolicy for IpHashPolicy {
    fn select(&self, key: &FlowKey, members: &[ServerId]) -> Result<ServerId, LbError> {
        let input = self.input_hash(key);
        members
            .iter()
            .max_by_key(|m| (IpHashPolicy::score(input, m), u32::from(m.addr)))
            .copied()
            .ok_or(LbError::NoServersAvailable)
    }

    fn kind(&self) -> PolicyKind {
        PolicyKind::IpHashing
    }
}

/// Build the policy named by `kind`.
pub fn build_policy(kind: PolicyKind, seed: u64, input: HashInput) -> Box<dyn SelectionPolicy> {
    match kind {
        PolicyKind::Random => Box::new(RandomPolicy::new(seed)),
        PolicyKind::RoundRobin => Box::new(RoundRobinPolicy::new()),
        PolicyKind::IpHashing => Box::new(IpHashPolicy::new(input)),
    }
}
