// SHOAL — ARP RESOLVER CONTRACT
// The IP engine depends only on this interface: an eventually-resolving
// link-layer lookup plus learning from the RX path. Retry and timeout policy
// is the resolver's own business; the wire protocol lives outside the core.

use std::collections::HashMap;

use crate::net::{EthernetAddress, Ipv4Address};

/// Continuation invoked once the link-layer address is known. Runs on the
/// core that issued the lookup.
pub type LookupCallback = Box<dyn FnOnce(EthernetAddress)>;

pub trait ArpResolver {
    /// Resolve `addr`, now or later. The continuation fires exactly once.
    fn lookup(&mut self, addr: Ipv4Address, done: LookupCallback);

    /// Insert a pairing observed on the RX path.
    fn learn(&mut self, mac: EthernetAddress, addr: Ipv4Address);

    /// Identify the host; learning never overwrites the host's own entry.
    fn set_self(&mut self, addr: Ipv4Address);
}

// ============================================================================
// NEIGHBOR CACHE — learning resolver
// ============================================================================

/// Per-core resolver backed by a learned (and optionally pre-seeded) table.
/// Unresolved lookups park their continuations until `learn` supplies the
/// pairing.
pub struct NeighborCache {
    entries: HashMap<Ipv4Address, EthernetAddress>,
    pending: HashMap<Ipv4Address, Vec<LookupCallback>>,
    self_addr: Option<Ipv4Address>,
}

impl NeighborCache {
    pub fn new() -> NeighborCache {
        NeighborCache { entries: HashMap::new(), pending: HashMap::new(), self_addr: None }
    }

    /// Static seeding for gateways known at boot.
    pub fn insert(&mut self, addr: Ipv4Address, mac: EthernetAddress) {
        self.entries.insert(addr, mac);
    }

    pub fn get(&self, addr: Ipv4Address) -> Option<EthernetAddress> {
        self.entries.get(&addr).copied()
    }

    pub fn pending_lookups(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}

impl Default for NeighborCache {
    fn default() -> Self {
        NeighborCache::new()
    }
}

impl ArpResolver for NeighborCache {
    fn lookup(&mut self, addr: Ipv4Address, done: LookupCallback) {
        match self.entries.get(&addr) {
            Some(mac) => done(*mac),
            None => {
                tracing::debug!(%addr, "link address unknown, parking lookup");
                self.pending.entry(addr).or_default().push(done);
            }
        }
    }

    fn learn(&mut self, mac: EthernetAddress, addr: Ipv4Address) {
        if self.self_addr == Some(addr) {
            return;
        }
        self.entries.insert(addr, mac);
        if let Some(waiters) = self.pending.remove(&addr) {
            for done in waiters {
                done(mac);
            }
        }
    }

    fn set_self(&mut self, addr: Ipv4Address) {
        self.self_addr = Some(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn mac(last: u8) -> EthernetAddress {
        EthernetAddress([2, 0, 0, 0, 0, last])
    }

    #[test]
    fn test_ready_lookup_fires_inline() {
        let mut cache = NeighborCache::new();
        cache.insert(Ipv4Address::new(10, 0, 0, 2), mac(2));
        let got = Rc::new(RefCell::new(None));
        let g = got.clone();
        cache.lookup(Ipv4Address::new(10, 0, 0, 2), Box::new(move |m| *g.borrow_mut() = Some(m)));
        assert_eq!(*got.borrow(), Some(mac(2)));
    }

    #[test]
    fn test_pending_lookup_completes_on_learn() {
        let mut cache = NeighborCache::new();
        let got = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let g = got.clone();
            cache.lookup(Ipv4Address::new(10, 0, 0, 9), Box::new(move |m| g.borrow_mut().push(m)));
        }
        assert_eq!(cache.pending_lookups(), 2);
        assert!(got.borrow().is_empty());
        cache.learn(mac(9), Ipv4Address::new(10, 0, 0, 9));
        assert_eq!(*got.borrow(), vec![mac(9), mac(9)]);
        assert_eq!(cache.pending_lookups(), 0);
    }

    #[test]
    fn test_learn_never_overwrites_self() {
        let mut cache = NeighborCache::new();
        let host = Ipv4Address::new(10, 0, 0, 1);
        cache.set_self(host);
        cache.insert(host, mac(1));
        cache.learn(mac(66), host);
        assert_eq!(cache.get(host), Some(mac(1)));
    }
}
