// TERN STACK — NET: ROUTE MODULE
// The distributed routing plane. Adjacencies come from hello exchanges,
// topology from flooded link-state packets, and the forwarding table from a
// Dijkstra recompute after every aging pass. The table is replaced
// atomically; lookups hold the table mutex for the duration of one linear
// scan.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::link::manager::DeviceManager;
use crate::link::{DeviceId, ETHTYPE_IPV4};
use crate::net::packet::{
    build_ipv4_header, HelloPacket, LinkStatePacket, ADDR_BROADCAST, PROTO_HELLO, PROTO_LINKSTATE,
};
use crate::runtime::{ip_str, SockErr};

// ============================================================================
// AGING CONSTANTS
// ============================================================================

/// Initial remaining age carried by hello packets, in ticks.
pub const HELLO_AGE: u16 = 60;
/// Initial remaining age of a link-state record.
pub const LINKSTATE_AGE: u32 = 60;
/// Subtracted from every record each periodic cycle.
pub const AGE_STEP: u32 = 10;
/// Cost of a directly heard adjacency.
const ADJACENCY_COST: u32 = 1;

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    /// Pre-masked network prefix.
    pub prefix: u32,
    /// Contiguous high-bits mask.
    pub mask: u32,
    pub device: DeviceId,
}

#[derive(Debug, Clone, Copy)]
struct Adjacency {
    addr: u32,
    age: u32,
    /// The endpoint this neighbor was heard on; the first hop toward
    /// anything routed through it.
    device: DeviceId,
}

#[derive(Debug, Clone)]
struct LinkStateRecord {
    seq: u32,
    age: u32,
    prefixes: Vec<(u32, u32)>,
    neighbors: Vec<(u32, u32)>,
}

// ============================================================================
// ROUTING TABLE
// ============================================================================

pub struct RoutingTable {
    devices: Arc<DeviceManager>,
    table: Mutex<Vec<RouteEntry>>,
    neighbors: Mutex<Vec<Adjacency>>,
    /// Keyed by originator address (the first address a record announces).
    lsdb: Mutex<HashMap<u32, LinkStateRecord>>,
    seq: AtomicU32,
}

impl RoutingTable {
    pub fn new(devices: Arc<DeviceManager>) -> RoutingTable {
        RoutingTable {
            devices,
            table: Mutex::new(Vec::new()),
            neighbors: Mutex::new(Vec::new()),
            lsdb: Mutex::new(HashMap::new()),
            seq: AtomicU32::new(0),
        }
    }

    /// Install the directly-attached prefixes. Called once the endpoints
    /// have addresses, and again by every recompute.
    pub fn seed_local(&self) {
        let mut table = self.table.lock().unwrap();
        for dev in self.devices.list() {
            if let Some((addr, mask)) = dev.addr() {
                let entry = RouteEntry { prefix: addr & mask, mask, device: dev.id };
                if !table.iter().any(|e| e.prefix == entry.prefix && e.mask == entry.mask) {
                    table.push(entry);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Longest-prefix match. Returns the endpoint to emit on.
    pub fn lookup(&self, addr: u32) -> Option<DeviceId> {
        let table = self.table.lock().unwrap();
        let mut best: Option<&RouteEntry> = None;
        for entry in table.iter() {
            if (addr & entry.mask) == entry.prefix {
                match best {
                    Some(b) if b.mask >= entry.mask => {}
                    _ => best = Some(entry),
                }
            }
        }
        best.map(|e| e.device)
    }

    pub fn is_local(&self, addr: u32) -> bool {
        self.devices.is_local_addr(addr)
    }

    /// The host's primary address; wildcard binds resolve to it.
    pub fn primary_addr(&self) -> Option<u32> {
        self.devices.primary_addr()
    }

    /// Install a route by hand. Useful when talking to hosts that don't
    /// speak our hello/link-state protocols. Non-contiguous masks are
    /// refused; a matching (prefix, mask) entry is replaced.
    pub fn install_route(&self, prefix: u32, mask: u32, device: DeviceId) -> Result<(), SockErr> {
        // A contiguous mask inverts to 2^k - 1.
        let inverted = !mask;
        if inverted & inverted.wrapping_add(1) != 0 {
            eprintln!("[TERN-ROUTE] mask {:#010x} is not contiguous", mask);
            return Err(SockErr::BadArg);
        }
        let entry = RouteEntry { prefix: prefix & mask, mask, device };
        let mut table = self.table.lock().unwrap();
        table.retain(|e| !(e.prefix == entry.prefix && e.mask == entry.mask));
        table.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> Vec<RouteEntry> {
        self.table.lock().unwrap().clone()
    }

    // ------------------------------------------------------------------
    // Hello
    // ------------------------------------------------------------------

    /// A hello arrived on `dev`. Requests are echoed with our address on
    /// the same endpoint; either way the sender's adjacency is refreshed
    /// with the packet's age.
    pub fn hello_input(&self, dev: DeviceId, payload: &[u8]) {
        let hello = match HelloPacket::decode(payload) {
            Some(h) => h,
            None => {
                eprintln!("[TERN-ROUTE] short hello on device {}", dev);
                return;
            }
        };
        if hello.is_request {
            if let Some(device) = self.devices.get(dev) {
                if let Some((our_addr, _)) = device.addr() {
                    let reply = HelloPacket { router_id: our_addr, age: HELLO_AGE, is_request: false };
                    let mut datagram =
                        build_ipv4_header(our_addr, hello.router_id, PROTO_HELLO, reply.encode().len())
                            .to_vec();
                    datagram.extend_from_slice(&reply.encode());
                    let _ = device.send_frame(&datagram, ETHTYPE_IPV4, &crate::link::BROADCAST_MAC);
                }
            }
        }
        self.refresh_adjacency(hello.router_id, hello.age as u32, dev);
    }

    fn refresh_adjacency(&self, addr: u32, age: u32, dev: DeviceId) {
        let mut neighbors = self.neighbors.lock().unwrap();
        for adj in neighbors.iter_mut() {
            if adj.addr == addr {
                adj.age = age;
                adj.device = dev;
                return;
            }
        }
        neighbors.push(Adjacency { addr, age, device: dev });
    }

    // ------------------------------------------------------------------
    // Link state
    // ------------------------------------------------------------------

    /// A link-state packet arrived on `dev`. `raw_datagram` is the full IP
    /// datagram it rode in (TTL already decremented, checksum refreshed) so
    /// the flood re-emits it unchanged.
    pub fn link_state_input(&self, dev: DeviceId, payload: &[u8], raw_datagram: &[u8]) {
        let pkt = match LinkStatePacket::decode(payload) {
            Some(p) => p,
            None => {
                eprintln!("[TERN-ROUTE] undecodable link-state on device {}", dev);
                return;
            }
        };
        let originator = match pkt.originator() {
            Some(o) => o,
            None => return, // announces nothing
        };
        if self.is_local(originator) {
            return; // our own flood came back
        }

        let fresh = {
            let mut lsdb = self.lsdb.lock().unwrap();
            match lsdb.get(&originator) {
                Some(stored) if pkt.seq < stored.seq => false,
                _ => {
                    lsdb.insert(
                        originator,
                        LinkStateRecord {
                            seq: pkt.seq,
                            age: pkt.age,
                            prefixes: pkt.prefixes.clone(),
                            neighbors: pkt.neighbors.clone(),
                        },
                    );
                    true
                }
            }
        };

        if fresh {
            // Flood on every endpoint except the one it arrived on.
            for device in self.devices.list() {
                if device.id == dev {
                    continue;
                }
                let _ = device.send_frame(raw_datagram, ETHTYPE_IPV4, &crate::link::BROADCAST_MAC);
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic cycle
    // ------------------------------------------------------------------

    /// One cycle of the periodic timer: ARP solicitation on all endpoints,
    /// hello broadcast, link-state broadcast, then age-and-recompute.
    pub fn periodic_cycle(&self) {
        let devices = self.devices.list();

        for dev in &devices {
            if let Err(e) = dev.arp_solicit() {
                eprintln!("[TERN-ARP] solicit on {} failed: {}", dev.name, e);
            }
        }

        // Hello: one request per configured endpoint, from its own address.
        for dev in &devices {
            let Some((addr, _)) = dev.addr() else { continue };
            let hello = HelloPacket { router_id: addr, age: HELLO_AGE, is_request: true };
            let body = hello.encode();
            let mut datagram =
                build_ipv4_header(addr, ADDR_BROADCAST, PROTO_HELLO, body.len()).to_vec();
            datagram.extend_from_slice(&body);
            let _ = dev.send_frame(&datagram, ETHTYPE_IPV4, &crate::link::BROADCAST_MAC);
        }

        // Link state: everything we own plus everyone we currently hear.
        let prefixes: Vec<(u32, u32)> =
            devices.iter().filter_map(|d| d.addr()).collect();
        if let Some(&(src, _)) = prefixes.first() {
            let neighbors: Vec<(u32, u32)> = self
                .neighbors
                .lock()
                .unwrap()
                .iter()
                .map(|a| (a.addr, ADJACENCY_COST))
                .collect();
            let pkt = LinkStatePacket {
                seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
                age: LINKSTATE_AGE,
                prefixes,
                neighbors,
            };
            let body = pkt.encode();
            let mut datagram =
                build_ipv4_header(src, ADDR_BROADCAST, PROTO_LINKSTATE, body.len()).to_vec();
            datagram.extend_from_slice(&body);
            for dev in &devices {
                let _ = dev.send_frame(&datagram, ETHTYPE_IPV4, &crate::link::BROADCAST_MAC);
            }
        }

        self.age_and_recompute();
    }

    /// Subtract one aging step everywhere, drop what expired, rebuild the
    /// forwarding table.
    pub fn age_and_recompute(&self) {
        {
            let mut neighbors = self.neighbors.lock().unwrap();
            for adj in neighbors.iter_mut() {
                adj.age = adj.age.saturating_sub(AGE_STEP);
            }
            neighbors.retain(|a| {
                if a.age == 0 {
                    eprintln!("[TERN-ROUTE] adjacency {} aged out", ip_str(a.addr));
                }
                a.age > 0
            });
        }
        {
            let mut lsdb = self.lsdb.lock().unwrap();
            for rec in lsdb.values_mut() {
                rec.age = rec.age.saturating_sub(AGE_STEP);
            }
            lsdb.retain(|origin, rec| {
                if rec.age == 0 {
                    eprintln!("[TERN-ROUTE] link state of {} aged out", ip_str(*origin));
                }
                rec.age > 0
            });
        }
        self.recompute();
    }

    // ------------------------------------------------------------------
    // Shortest paths
    // ------------------------------------------------------------------

    /// Dijkstra over the node set {self} ∪ link-state originators. Edges:
    /// self→neighbor from the adjacency table, originator→neighbor from each
    /// record's neighbor list. The first hop toward a destination is the
    /// predecessor-chain ancestor whose predecessor is self; its adjacency
    /// names the outgoing endpoint.
    pub fn recompute(&self) {
        let devices = self.devices.list();
        let own_addrs: Vec<u32> = devices.iter().filter_map(|d| d.addr().map(|(a, _)| a)).collect();
        let adjacencies: Vec<Adjacency> = self.neighbors.lock().unwrap().clone();
        let records: Vec<(u32, LinkStateRecord)> = self
            .lsdb
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        // Node 0 is self; node i+1 is records[i].
        let n = records.len() + 1;
        let node_of = |addr: u32| -> Option<usize> {
            if own_addrs.contains(&addr) {
                return Some(0);
            }
            records
                .iter()
                .position(|(_, rec)| rec.prefixes.iter().any(|&(a, _)| a == addr))
                .map(|i| i + 1)
        };

        const INF: u64 = u64::MAX;
        let mut dist = vec![INF; n];
        let mut pred = vec![usize::MAX; n];
        let mut done = vec![false; n];
        dist[0] = 0;

        // Edge list built once: (from, to, cost).
        let mut edges: Vec<(usize, usize, u64)> = Vec::new();
        for adj in &adjacencies {
            if let Some(to) = node_of(adj.addr) {
                if to != 0 {
                    edges.push((0, to, ADJACENCY_COST as u64));
                }
            }
        }
        for (i, (_, rec)) in records.iter().enumerate() {
            for &(addr, cost) in &rec.neighbors {
                if let Some(to) = node_of(addr) {
                    if to != i + 1 {
                        edges.push((i + 1, to, cost.max(1) as u64));
                    }
                }
            }
        }

        for _ in 0..n {
            let u = match (0..n).filter(|&i| !done[i] && dist[i] != INF).min_by_key(|&i| dist[i]) {
                Some(u) => u,
                None => break,
            };
            done[u] = true;
            for &(from, to, cost) in &edges {
                if from == u && dist[u] + cost < dist[to] {
                    dist[to] = dist[u] + cost;
                    pred[to] = u;
                }
            }
        }

        // New table: own prefixes first, then one entry per announced prefix
        // of each reachable originator. Duplicates are dropped.
        let mut fresh: Vec<RouteEntry> = Vec::new();
        let mut push_unique = |entry: RouteEntry, fresh: &mut Vec<RouteEntry>| {
            if !fresh.iter().any(|e| e.prefix == entry.prefix && e.mask == entry.mask) {
                fresh.push(entry);
            }
        };
        for dev in &devices {
            if let Some((addr, mask)) = dev.addr() {
                push_unique(RouteEntry { prefix: addr & mask, mask, device: dev.id }, &mut fresh);
            }
        }
        for (k, (_, rec)) in records.iter().enumerate() {
            let node = k + 1;
            if dist[node] == INF {
                continue;
            }
            // Walk predecessors to the ancestor directly under self.
            let mut hop = node;
            while pred[hop] != 0 {
                hop = pred[hop];
                if hop == usize::MAX {
                    break;
                }
            }
            if hop == usize::MAX {
                continue;
            }
            let device = adjacencies
                .iter()
                .find(|a| node_of(a.addr) == Some(hop))
                .map(|a| a.device);
            let Some(device) = device else { continue };
            for &(addr, mask) in &rec.prefixes {
                push_unique(RouteEntry { prefix: addr & mask, mask, device }, &mut fresh);
            }
        }

        *self.table.lock().unwrap() = fresh;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::pump::EventPump;
    use crate::runtime::parse_ip;

    fn table_with_one_wire() -> (Arc<DeviceManager>, RoutingTable, DeviceId) {
        let manager = Arc::new(DeviceManager::new(Arc::new(EventPump::new())));
        let (a, _b) = manager
            .add_wire("ra0", [2, 0, 0, 0, 0, 1], "rb0", [2, 0, 0, 0, 0, 2])
            .unwrap();
        manager
            .get(a)
            .unwrap()
            .set_addr(parse_ip("10.100.1.1").unwrap(), 0xffff0000);
        let rt = RoutingTable::new(manager.clone());
        rt.seed_local();
        (manager, rt, a)
    }

    #[test]
    fn longest_prefix_wins() {
        let (_m, rt, dev) = table_with_one_wire();
        {
            let mut t = rt.table.lock().unwrap();
            t.push(RouteEntry { prefix: 0x0a000000, mask: 0xff000000, device: dev });
            t.push(RouteEntry { prefix: 0x0a640000, mask: 0xffff0000, device: dev + 7 });
        }
        // Both cover 10.100.9.9; the /16 must win over the /8.
        // (A buggy comparison that binds `addr & (mask == prefix)` would
        // never match either.)
        assert_eq!(rt.lookup(parse_ip("10.100.9.9").unwrap()), Some(dev + 7));
        assert_eq!(rt.lookup(parse_ip("10.2.0.1").unwrap()), Some(dev));
        assert_eq!(rt.lookup(parse_ip("192.168.0.1").unwrap()), None);
    }

    #[test]
    fn dijkstra_routes_through_heard_neighbor() {
        let (_m, rt, dev) = table_with_one_wire();
        let peer = parse_ip("10.100.2.3").unwrap();
        let far_prefix = parse_ip("10.200.0.0").unwrap();
        rt.refresh_adjacency(peer, 60, dev);
        rt.lsdb.lock().unwrap().insert(
            peer,
            LinkStateRecord {
                seq: 1,
                age: 60,
                prefixes: vec![(peer, 0xffff0000), (parse_ip("10.200.0.1").unwrap(), 0xffffff00)],
                neighbors: vec![(parse_ip("10.100.1.1").unwrap(), 1)],
            },
        );
        rt.recompute();
        // The neighbor's second prefix is now reachable via our wire.
        assert_eq!(rt.lookup(parse_ip("10.200.0.77").unwrap()), Some(dev));
        assert!(rt
            .entries()
            .iter()
            .any(|e| e.prefix == far_prefix && e.mask == 0xffffff00));
    }

    #[test]
    fn two_hop_first_hop_is_the_adjacency() {
        let (_m, rt, dev) = table_with_one_wire();
        let near = parse_ip("10.100.2.3").unwrap();
        let far = parse_ip("10.44.0.1").unwrap();
        rt.refresh_adjacency(near, 60, dev);
        let mut lsdb = rt.lsdb.lock().unwrap();
        lsdb.insert(
            near,
            LinkStateRecord {
                seq: 3,
                age: 60,
                prefixes: vec![(near, 0xffff0000)],
                neighbors: vec![(parse_ip("10.100.1.1").unwrap(), 1), (far, 1)],
            },
        );
        lsdb.insert(
            far,
            LinkStateRecord {
                seq: 9,
                age: 60,
                prefixes: vec![(far, 0xffffff00), (parse_ip("172.16.5.1").unwrap(), 0xffffff00)],
                neighbors: vec![(near, 1)],
            },
        );
        drop(lsdb);
        rt.recompute();
        // 172.16.5.x sits two hops out; first hop is still our one wire.
        assert_eq!(rt.lookup(parse_ip("172.16.5.200").unwrap()), Some(dev));
    }

    #[test]
    fn aging_drops_expired_state() {
        let (_m, rt, dev) = table_with_one_wire();
        let peer = parse_ip("10.100.2.3").unwrap();
        rt.refresh_adjacency(peer, 20, dev);
        rt.lsdb.lock().unwrap().insert(
            peer,
            LinkStateRecord {
                seq: 1,
                age: 20,
                prefixes: vec![(peer, 0xffff0000), (parse_ip("10.200.0.1").unwrap(), 0xffffff00)],
                neighbors: vec![(parse_ip("10.100.1.1").unwrap(), 1)],
            },
        );
        rt.age_and_recompute(); // 20 -> 10, still alive
        assert_eq!(rt.lookup(parse_ip("10.200.0.9").unwrap()), Some(dev));
        rt.age_and_recompute(); // 10 -> 0, gone
        assert_eq!(rt.lookup(parse_ip("10.200.0.9").unwrap()), None);
        // Directly attached prefixes survive every recompute.
        assert_eq!(rt.lookup(parse_ip("10.100.9.9").unwrap()), Some(dev));
    }

    #[test]
    fn manual_routes_keep_masks_contiguous() {
        let (_m, rt, dev) = table_with_one_wire();
        assert_eq!(
            rt.install_route(parse_ip("10.9.0.0").unwrap(), 0xff00ff00, dev),
            Err(crate::runtime::SockErr::BadArg)
        );
        rt.install_route(parse_ip("10.9.1.7").unwrap(), 0xffffff00, dev).unwrap();
        assert_eq!(rt.lookup(parse_ip("10.9.1.200").unwrap()), Some(dev));
        // Every live entry satisfies the contiguity invariant.
        for e in rt.entries() {
            let inv = !e.mask;
            assert_eq!(inv & inv.wrapping_add(1), 0, "mask {:#x}", e.mask);
        }
        // Replacement, not duplication.
        rt.install_route(parse_ip("10.9.1.0").unwrap(), 0xffffff00, dev + 1).unwrap();
        assert_eq!(rt.lookup(parse_ip("10.9.1.200").unwrap()), Some(dev + 1));
        let same: Vec<_> = rt
            .entries()
            .into_iter()
            .filter(|e| e.prefix == parse_ip("10.9.1.0").unwrap())
            .collect();
        assert_eq!(same.len(), 1);
    }

    #[test]
    fn newer_sequence_replaces_older() {
        let (_m, rt, dev) = table_with_one_wire();
        let peer = parse_ip("10.100.2.3").unwrap();
        rt.refresh_adjacency(peer, 60, dev);

        let old = LinkStatePacket {
            seq: 5,
            age: 60,
            prefixes: vec![(peer, 0xffff0000), (parse_ip("10.200.0.1").unwrap(), 0xffffff00)],
            neighbors: vec![(parse_ip("10.100.1.1").unwrap(), 1)],
        };
        rt.link_state_input(dev, &old.encode(), &[]);
        let newer = LinkStatePacket {
            seq: 6,
            age: 60,
            prefixes: vec![(peer, 0xffff0000), (parse_ip("10.201.0.1").unwrap(), 0xffffff00)],
            neighbors: vec![(parse_ip("10.100.1.1").unwrap(), 1)],
        };
        rt.link_state_input(dev, &newer.encode(), &[]);
        let stale = LinkStatePacket { seq: 2, ..old.clone() };
        rt.link_state_input(dev, &stale.encode(), &[]);

        rt.recompute();
        assert_eq!(rt.lookup(parse_ip("10.201.0.9").unwrap()), Some(dev));
        assert_eq!(rt.lookup(parse_ip("10.200.0.9").unwrap()), None);
    }
}
