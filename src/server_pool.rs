//! The backends traffic can be assigned to.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use parking_lot::RwLock;

use crate::error::LbError;

/// Identity of a backend server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId {
    pub addr: Ipv4Addr,
    /// Switch port the server is attached to.
    pub port: u16,
    /// Relative share of traffic under the random policy.
    pub weight: u32,
}

impl ServerId {
    pub fn new(addr: Ipv4Addr, port: u16) -> ServerId {
        ServerId {
            addr,
            port,
            weight: 1,
        }
    }

    pub fn with_weight(self, weight: u32) -> ServerId {
        ServerId { weight, ..self }
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.addr, self.port)
    }
}

/// Parses `ADDR@PORT` or `ADDR@PORT/WEIGHT`.
impl FromStr for ServerId {
    type Err = LbError;

    fn from_str(s: &str) -> Result<ServerId, LbError> {
        let invalid = || {
            LbError::ConfigurationInvalid(format!(
                "bad server `{}` (expected ADDR@PORT or ADDR@PORT/WEIGHT)",
                s
            ))
        };
        let (addr, rest) = s.split_once('@').ok_or_else(invalid)?;
        let (port, weight) = match rest.split_once('/') {
            Some((port, weight)) => (port, Some(weight)),
            None => (rest, None),
        };
        let id = ServerId::new(
            addr.parse().map_err(|_| invalid())?,
            port.parse().map_err(|_| invalid())?,
        );
        match weight {
            Some(w) => Ok(id.with_weight(w.parse().map_err(|_| invalid())?)),
            None => Ok(id),
        }
    }
}

#[derive(Debug, Clone)]
struct Member {
    id: ServerId,
    up: bool,
}

/// Ordered set of servers, unique by address.
///
/// Insertion order is the round-robin rotation order. Liveness is flipped in
/// place so a server that comes back keeps its position.
#[derive(Debug, Default)]
pub struct ServerPool {
    members: RwLock<Vec<Member>>,
}

impl ServerPool {
    pub fn new(servers: impl IntoIterator<Item = ServerId>) -> ServerPool {
        let pool = ServerPool::default();
        for s in servers {
            pool.insert(s);
        }
        pool
    }

    /// Live servers, in insertion order.
    pub fn members(&self) -> Vec<ServerId> {
        self.members
            .read()
            .iter()
            .filter(|m| m.up)
            .map(|m| m.id)
            .collect()
    }

    /// Every configured server, with its liveness.
    pub fn all(&self) -> Vec<(ServerId, bool)> {
        self.members.read().iter().map(|m| (m.id, m.up)).collect()
    }

    /// Add a live server. Returns false when the address is already present.
    pub fn insert(&self, id: ServerId) -> bool {
        let mut members = self.members.write();
        if members.iter().any(|m| m.id.addr == id.addr) {
            return false;
        }
        members.push(Member { id, up: true });
        true
    }

    /// Drop a server from the pool entirely.
    pub fn remove(&self, addr: Ipv4Addr) -> Option<ServerId> {
        let mut members = self.members.write();
        let idx = members.iter().position(|m| m.id.addr == addr)?;
        Some(members.remove(idx).id)
    }

    /// Returns true when the server was up before the call.
    pub fn mark_down(&self, addr: Ipv4Addr) -> bool {
        self.set_up(addr, false)
    }

    /// Returns true when the server was down before the call.
    pub fn mark_up(&self, addr: Ipv4Addr) -> bool {
        self.set_up(addr, true)
    }

    fn set_up(&self, addr: Ipv4Addr, up: bool) -> bool {
        let mut members = self.members.write();
        match members.iter_mut().find(|m| m.id.addr == addr) {
            Some(m) if m.up != up => {
                m.up = up;
                true
            }
            _ => false,
        }
    }

    /// The server attached to switch port `port`, live or not.
    pub fn by_port(&self, port: u16) -> Option<ServerId> {
        self.members
            .read()
            .iter()
            .find(|m| m.id.port == port)
            .map(|m| m.id)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.members.read().iter().any(|m| m.id.addr == addr)
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn s(last: u8) -> ServerId {
        ServerId::new(Ipv4Addr::new(10, 1, 1, last), last as u16)
    }

    #[test]
    fn parses_server_specs() {
        assert_eq!("10.1.1.1@1".parse::<ServerId>().unwrap(), s(1));
        let weighted: ServerId = "10.1.1.2@2/5".parse().unwrap();
        assert_eq!(weighted, s(2).with_weight(5));
        for bad in ["10.1.1.1", "10.1.1.1@", "host@1", "10.1.1.1@1/x", "10.1.1.1@70000"] {
            assert!(bad.parse::<ServerId>().is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn members_keep_insertion_order() {
        let pool = ServerPool::new(vec![s(3), s(1), s(2)]);
        let addrs: Vec<u8> = pool.members().iter().map(|m| m.addr.octets()[3]).collect();
        assert_eq!(addrs, vec![3, 1, 2]);
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let pool = ServerPool::new(vec![s(1)]);
        assert!(!pool.insert(ServerId::new(Ipv4Addr::new(10, 1, 1, 1), 9)));
        assert_eq!(pool.all().len(), 1);
    }

    #[test]
    fn down_servers_are_not_members() {
        let pool = ServerPool::new(vec![s(1), s(2), s(3)]);
        assert!(pool.mark_down(s(2).addr));
        assert!(!pool.mark_down(s(2).addr));
        assert_eq!(pool.members(), vec![s(1), s(3)]);
        assert!(pool.contains(s(2).addr));

        assert!(pool.mark_up(s(2).addr));
        assert_eq!(pool.members(), vec![s(1), s(2), s(3)]);
    }

    #[test]
    fn unknown_address_is_ignored() {
        let pool = ServerPool::new(vec![s(1)]);
        assert!(!pool.mark_down(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(pool.members().len(), 1);
    }

    #[test]
    fn resolves_ports_and_removes() {
        let pool = ServerPool::new(vec![s(1), s(2)]);
        assert_eq!(pool.by_port(2), Some(s(2)));
        assert_eq!(pool.by_port(7), None);
        assert_eq!(pool.remove(s(1).addr), Some(s(1)));
        assert_eq!(pool.members(), vec![s(2)]);
        assert_eq!(pool.remove(s(1).addr), None);
    }

    #[test]
    fn liveness_changes_race_with_readers() {
        let pool = Arc::new(ServerPool::new((1..=8).map(s)));
        let writer = {
            let pool = pool.clone();
            thread::spawn(move || {
                for round in 0..200 {
                    let addr = s((round % 8 + 1) as u8).addr;
                    pool.mark_down(addr);
                    pool.mark_up(addr);
                }
            })
        };
        for _ in 0..200 {
            let members = pool.members();
            assert!(members.len() >= 7);
        }
        writer.join().unwrap();
        assert_eq!(pool.members().len(), 8);
    }
}
