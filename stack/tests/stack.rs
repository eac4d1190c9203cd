// TERN STACK — INTEGRATION TESTS
// End-to-end scenarios over socketpair virtual wires: frame loopback, ARP
// pairing, the three-way handshake, stream echo, graceful close, and
// multi-hop forwarding. No capture privileges are needed; every "Ethernet"
// here is an AF_UNIX datagram pair.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tern_stack::link::device::Device;
use tern_stack::link::{DatagramSink, DeviceId, ETHTYPE_IPV4};
use tern_stack::runtime::parse_ip;
use tern_stack::stack::{Stack, StackConfig};
use tern_stack::transport::tcb::ConnState;

const ZEN: &str = "Beautiful is better than ugly.\n\
Explicit is better than implicit.\n\
Simple is better than complex.\n\
Complex is better than complicated.\n\
Flat is better than nested.\n\
Sparse is better than dense.\n\
Readability counts.\n\
Special cases aren't special enough to break the rules.\n\
Although practicality beats purity.\n\
Errors should never pass silently.\n\
Unless explicitly silenced.\n\
In the face of ambiguity, refuse the temptation to guess.\n\
There should be one-- and preferably only one --obvious way to do it.\n\
Although that way may not be obvious at first unless you're Dutch.\n\
Now is better than never.\n\
Although never is often better than *right* now.\n";

/// The canonical 824-byte stream payload.
fn zen_payload() -> Vec<u8> {
    ZEN.bytes().cycle().take(824).collect()
}

fn deadline_wait(what: &str, mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !ready() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Join two stacks with a fresh socketpair wire and address the ends.
fn wire_stacks(
    a: &Arc<Stack>,
    name_a: &str,
    mac_a: [u8; 6],
    ip_a: &str,
    mask_a: u32,
    b: &Arc<Stack>,
    name_b: &str,
    mac_b: [u8; 6],
    ip_b: &str,
    mask_b: u32,
) -> (DeviceId, DeviceId) {
    let mut fds = [0; 2];
    // SAFETY: socketpair(2) with a valid out array of two descriptors.
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair failed");
    let name_a = name_a.to_string();
    let name_b = name_b.to_string();
    let id_a = a
        .devices
        .adopt(move |id| Device::from_wire(id, &name_a, mac_a, fds[0]))
        .unwrap();
    let id_b = b
        .devices
        .adopt(move |id| Device::from_wire(id, &name_b, mac_b, fds[1]))
        .unwrap();
    a.devices.get(id_a).unwrap().set_addr(parse_ip(ip_a).unwrap(), mask_a);
    b.devices.get(id_b).unwrap().set_addr(parse_ip(ip_b).unwrap(), mask_b);
    a.router.seed_local();
    b.router.seed_local();
    (id_a, id_b)
}

/// The canonical two-host topology: 10.100.1.1/16 <-> 10.100.2.3/16.
fn two_hosts() -> (Arc<Stack>, Arc<Stack>) {
    let a = Stack::new(StackConfig { cycle_ms: 50, ..Default::default() });
    let b = Stack::new(StackConfig { cycle_ms: 50, ..Default::default() });
    wire_stacks(
        &a,
        "wa0",
        [0xf6, 0x05, 0xd4, 0x2b, 0xdb, 0x5f],
        "10.100.1.1",
        0xffff0000,
        &b,
        "wb0",
        [0x4a, 0x5b, 0x71, 0x31, 0x4e, 0x2d],
        "10.100.2.3",
        0xffff0000,
    );
    a.start();
    b.start();
    deadline_wait("ARP pairing", || a.peers_resolved() && b.peers_resolved());
    (a, b)
}

// ============================================================================
// LINK LAYER SCENARIOS
// ============================================================================

struct FrameLog {
    frames: Mutex<Vec<(DeviceId, Vec<u8>)>>,
}

impl DatagramSink for FrameLog {
    fn datagram_input(&self, dev: DeviceId, packet: &[u8]) {
        self.frames.lock().unwrap().push((dev, packet.to_vec()));
    }
}

#[test]
fn frame_loopback_carries_the_zen_text() {
    let (a, b) = Device::pair(
        0,
        "fa0",
        [0xf6, 0x05, 0xd4, 0x2b, 0xdb, 0x5f],
        1,
        "fb0",
        [0x4a, 0x5b, 0x71, 0x31, 0x4e, 0x2d],
    )
    .unwrap();
    let log = FrameLog { frames: Mutex::new(Vec::new()) };
    let payload = zen_payload();
    assert_eq!(payload.len(), 824);
    a.send_frame(&payload, ETHTYPE_IPV4, &b.mac).unwrap();
    b.drain(&log);

    let frames = log.frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, 1);
    assert_eq!(&frames[0].1[..824], &payload[..]);
    assert!(frames[0].1.starts_with(b"Beautiful is better than ugly.\n"));
}

#[test]
fn arp_pairs_both_ends_within_a_cycle() {
    let (a, b) = two_hosts();
    let mac_a = a.devices.get(0).unwrap().mac;
    let mac_b = b.devices.get(0).unwrap().mac;
    assert_eq!(a.devices.get(0).unwrap().peer(), Some(mac_b));
    assert_eq!(b.devices.get(0).unwrap().peer(), Some(mac_a));
    a.shutdown();
    b.shutdown();
}

// ============================================================================
// TRANSPORT SCENARIOS
// ============================================================================

#[test]
fn handshake_echo_and_graceful_close() {
    let (a, b) = two_hosts();
    let server_addr = parse_ip("10.100.2.3").unwrap();

    // Server side: one accept, then echo until EOF.
    let listener = b.tcp.socket().unwrap();
    b.tcp.bind(listener, server_addr, 2345).unwrap();
    b.tcp.listen(listener, 5).unwrap();

    let server_conn_state = Arc::new(Mutex::new(None::<ConnState>));
    let write_after_peer_close = Arc::new(Mutex::new(None));
    let echoed = Arc::new(AtomicUsize::new(0));
    let server = {
        let b = b.clone();
        let server_conn_state = server_conn_state.clone();
        let write_after_peer_close = write_after_peer_close.clone();
        let echoed = echoed.clone();
        std::thread::spawn(move || {
            let (conn, peer) = b.tcp.accept(listener).unwrap();
            assert_eq!(peer.0, parse_ip("10.100.1.1").unwrap());
            *server_conn_state.lock().unwrap() = b.tcp.conn_state(conn).ok();
            let mut buf = [0u8; 256];
            loop {
                let n = b.tcp.read(conn, &mut buf).unwrap();
                if n == 0 {
                    break; // peer half-closed
                }
                b.tcp.write(conn, &buf[..n]).unwrap();
                echoed.fetch_add(n, Ordering::Relaxed);
            }
            // The peer closed; a write against the half-closed stream
            // transmits nothing.
            *write_after_peer_close.lock().unwrap() = Some(b.tcp.write(conn, b"late"));
            b.tcp.close(conn).unwrap();
        })
    };

    // Client side: connect, stream the Zen text, read it back.
    let client = a.tcp.socket().unwrap();
    a.tcp.connect(client, server_addr, 2345).unwrap();
    assert_eq!(a.tcp.conn_state(client).unwrap(), ConnState::Established);

    let payload = zen_payload();
    assert_eq!(a.tcp.write(client, &payload).unwrap(), payload.len());

    let mut back = vec![0u8; payload.len()];
    let mut got = 0;
    while got < back.len() {
        let n = a.tcp.read(client, &mut back[got..]).unwrap();
        assert!(n > 0, "echo stream ended early at {}", got);
        got += n;
    }
    assert_eq!(back, payload, "echoed bytes differ");
    deadline_wait("server echoed everything", || {
        echoed.load(Ordering::Relaxed) == payload.len()
    });
    assert_eq!(*server_conn_state.lock().unwrap(), Some(ConnState::Established));

    // Initiator close: FIN goes out, writes now surface broken-pipe.
    a.tcp.close(client).unwrap();
    assert_eq!(
        a.tcp.write(client, b"after close"),
        Err(tern_stack::runtime::SockErr::BrokenPipe)
    );
    match a.tcp.conn_state(client) {
        Ok(ConnState::FinWait1) | Ok(ConnState::FinWait2) | Ok(ConnState::TimedWait) => {}
        Ok(other) => panic!("initiator in {:?} after close", other),
        Err(_) => {} // already reaped
    }

    server.join().unwrap();
    assert_eq!(*write_after_peer_close.lock().unwrap(), Some(Ok(0)));

    // Both CBs drain away: the initiator after TIMED_WAIT (2xRTT), the
    // responder through LAST_ACK.
    deadline_wait("initiator CB reaped", || a.tcp.live_connections() == 0);
    deadline_wait("responder CB reaped", || b.tcp.live_connections() == 1); // listener stays
    b.tcp.close(listener).unwrap();
    deadline_wait("listener reaped", || b.tcp.live_connections() == 0);

    a.shutdown();
    b.shutdown();
}

#[test]
fn close_aborts_a_blocked_connect() {
    let (a, b) = two_hosts();
    // Nobody listens on 9999: the SYN is dropped on the far side and the
    // caller blocks until close() aborts it.
    let fd = a.tcp.socket().unwrap();
    let closer = {
        let a = a.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            a.tcp.close(fd).unwrap();
        })
    };
    let err = a.tcp.connect(fd, parse_ip("10.100.2.3").unwrap(), 9999);
    assert_eq!(err, Err(tern_stack::runtime::SockErr::Refused));
    closer.join().unwrap();
    a.shutdown();
    b.shutdown();
}

#[test]
fn listener_close_wakes_accept_waiters() {
    let (a, b) = two_hosts();
    let listener = b.tcp.socket().unwrap();
    b.tcp.bind(listener, parse_ip("10.100.2.3").unwrap(), 4000).unwrap();
    b.tcp.listen(listener, 1).unwrap();

    let waiter = {
        let b = b.clone();
        std::thread::spawn(move || b.tcp.accept(listener))
    };
    std::thread::sleep(Duration::from_millis(100));
    b.tcp.close(listener).unwrap();
    assert!(waiter.join().unwrap().is_err());
    deadline_wait("listener reaped by last waiter", || b.tcp.live_connections() == 0);
    a.shutdown();
    b.shutdown();
}

#[test]
fn connect_before_listen_is_refused_by_silence() {
    let (a, b) = two_hosts();
    // A SYN toward a bound-but-not-listening port is a logged drop, not a
    // reset; close() is the only way out for the caller.
    let fd = a.tcp.socket().unwrap();
    let t = {
        let a = a.clone();
        std::thread::spawn(move || a.tcp.connect(fd, parse_ip("10.100.2.3").unwrap(), 4321))
    };
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(a.tcp.conn_state(fd).unwrap(), ConnState::SynSent);
    a.tcp.close(fd).unwrap();
    assert!(t.join().unwrap().is_err());
    a.shutdown();
    b.shutdown();
}

#[test]
fn duplicate_bind_is_address_in_use() {
    let (a, b) = two_hosts();
    let addr = parse_ip("10.100.2.3").unwrap();
    let one = b.tcp.socket().unwrap();
    let two = b.tcp.socket().unwrap();
    b.tcp.bind(one, addr, 5555).unwrap();
    assert_eq!(
        b.tcp.bind(two, addr, 5555),
        Err(tern_stack::runtime::SockErr::AddrInUse)
    );
    // Not one of our addresses at all:
    assert_eq!(
        b.tcp.bind(two, parse_ip("192.168.7.7").unwrap(), 5556),
        Err(tern_stack::runtime::SockErr::AddrUnavailable)
    );
    a.shutdown();
    b.shutdown();
}

// ============================================================================
// FORWARDING SCENARIO
// ============================================================================

#[test]
fn stream_crosses_a_forwarding_hop() {
    // A (10.100.1.1/16) -- B (10.100.2.3/16 | 10.200.0.1/24) -- C (10.200.0.9/24)
    let a = Stack::new(StackConfig { cycle_ms: 50, ..Default::default() });
    let b = Stack::new(StackConfig { cycle_ms: 50, ..Default::default() });
    let c = Stack::new(StackConfig { cycle_ms: 50, ..Default::default() });
    wire_stacks(
        &a, "ha0", [2, 0, 0, 0, 1, 1], "10.100.1.1", 0xffff0000,
        &b, "hb0", [2, 0, 0, 0, 2, 1], "10.100.2.3", 0xffff0000,
    );
    wire_stacks(
        &b, "hb1", [2, 0, 0, 0, 2, 2], "10.200.0.1", 0xffffff00,
        &c, "hc0", [2, 0, 0, 0, 3, 1], "10.200.0.9", 0xffffff00,
    );
    a.start();
    b.start();
    c.start();

    let c_addr = parse_ip("10.200.0.9").unwrap();
    let a_addr = parse_ip("10.100.1.1").unwrap();
    // Link-state flooding has to converge far enough that the edge hosts
    // can route to each other's prefixes.
    deadline_wait("route A->C", || a.router.lookup(c_addr).is_some());
    deadline_wait("route C->A", || c.router.lookup(a_addr).is_some());

    let listener = c.tcp.socket().unwrap();
    c.tcp.bind(listener, c_addr, 7777).unwrap();
    c.tcp.listen(listener, 1).unwrap();
    let server = {
        let c = c.clone();
        std::thread::spawn(move || {
            let (conn, _) = c.tcp.accept(listener).unwrap();
            let mut buf = [0u8; 1024];
            loop {
                let n = c.tcp.read(conn, &mut buf).unwrap();
                if n == 0 {
                    break;
                }
                c.tcp.write(conn, &buf[..n]).unwrap();
            }
            c.tcp.close(conn).unwrap();
        })
    };

    let fd = a.tcp.socket().unwrap();
    a.tcp.connect(fd, c_addr, 7777).unwrap();
    let message = b"routed end to end through the middle hop";
    assert_eq!(a.tcp.write(fd, message).unwrap(), message.len());
    let mut back = vec![0u8; message.len()];
    let mut got = 0;
    while got < back.len() {
        let n = a.tcp.read(fd, &mut back[got..]).unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(&back[..], &message[..]);

    a.tcp.close(fd).unwrap();
    server.join().unwrap();
    c.tcp.close(listener).unwrap();
    a.shutdown();
    b.shutdown();
    c.shutdown();
}
