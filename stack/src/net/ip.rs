// TERN STACK — NET: IP MODULE
// Datagram emit and receive. Outbound: header construction, checksum,
// broadcast-or-route. Inbound: validation, TTL policing, then local
// delivery upward or forwarding back out. Every fault here is a logged
// drop; nothing propagates to user code.

use std::sync::Arc;

use crate::link::manager::DeviceManager;
use crate::link::{DeviceId, ETHTYPE_IPV4};
use crate::net::packet::{
    build_ipv4_header, fold_checksum, verify_sum, Ipv4Header, DEFAULT_IHL, IPV4_VERSION,
    PROTO_HELLO, PROTO_LINKSTATE, PROTO_TCP, SIZE_IPV4,
};
use crate::net::route::RoutingTable;
use crate::runtime::{count, ip_str, telem, SockErr};

/// Transport delivery seam. The network engine pushes TCP segments through
/// it without holding a reference to the transport engine's internals.
pub trait SegmentSink: Send + Sync {
    fn segment_input(&self, segment: &[u8], src: u32, dst: u32);
}

pub struct Ipv4Layer {
    devices: Arc<DeviceManager>,
    router: Arc<RoutingTable>,
}

impl Ipv4Layer {
    pub fn new(devices: Arc<DeviceManager>, router: Arc<RoutingTable>) -> Ipv4Layer {
        Ipv4Layer { devices, router }
    }

    pub fn router(&self) -> &RoutingTable {
        &self.router
    }

    // ------------------------------------------------------------------
    // Emit
    // ------------------------------------------------------------------

    /// Wrap a payload in a fresh IPv4 header and send it. Hello and
    /// link-state ride a broadcast on every endpoint; everything else is
    /// routed by longest-prefix match.
    pub fn send_datagram(
        &self,
        src: u32,
        dst: u32,
        protocol: u8,
        payload: &[u8],
    ) -> Result<(), SockErr> {
        if protocol != PROTO_TCP && protocol != PROTO_HELLO && protocol != PROTO_LINKSTATE {
            eprintln!("[TERN-IP] protocol {} not supported", protocol);
            return Err(SockErr::BadArg);
        }
        let mut datagram = build_ipv4_header(src, dst, protocol, payload.len()).to_vec();
        datagram.extend_from_slice(payload);

        if protocol == PROTO_HELLO || protocol == PROTO_LINKSTATE {
            self.devices.broadcast_frame(&datagram, ETHTYPE_IPV4);
            return Ok(());
        }

        match self.router.lookup(dst) {
            Some(dev) => self.devices.send_frame_via(dev, &datagram, ETHTYPE_IPV4, dst),
            None => {
                eprintln!("[TERN-IP] no route to {}", ip_str(dst));
                Err(SockErr::AddrUnavailable)
            }
        }
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    /// One payload handed up from an endpoint. The frame may be zero-padded
    /// past the datagram, so the header's total length is trusted over the
    /// captured length.
    pub fn input(&self, dev: DeviceId, packet: &[u8], tcp: &dyn SegmentSink) {
        if let Err(reason) = self.validate(packet) {
            if let Some(reason) = reason {
                eprintln!("[TERN-IP] {}", reason);
                count(&telem().datagrams_dropped);
            }
            return;
        }
        let hdr: Ipv4Header = *bytemuck::from_bytes(&packet[..SIZE_IPV4]);
        let header_len = hdr.header_len();
        let total_len = hdr.total_len();

        // Work on the datagram alone, TTL decremented, checksum refreshed.
        let mut datagram = packet[..total_len].to_vec();
        datagram[8] = hdr.ttl - 1;
        datagram[10] = 0;
        datagram[11] = 0;
        let sum = fold_checksum(&datagram[..header_len]);
        datagram[10..12].copy_from_slice(&sum.to_be_bytes());

        let src = hdr.src_addr();
        let dst = hdr.dst_addr();
        match hdr.protocol {
            PROTO_TCP => {
                if self.router.is_local(dst) {
                    tcp.segment_input(&datagram[header_len..], src, dst);
                } else {
                    self.forward(&datagram, src, dst);
                }
            }
            PROTO_HELLO => self.router.hello_input(dev, &datagram[header_len..]),
            PROTO_LINKSTATE => {
                self.router
                    .link_state_input(dev, &datagram[header_len..], &datagram)
            }
            other => {
                eprintln!("[TERN-IP] protocol {} not implemented, dropping", other);
                count(&telem().datagrams_dropped);
            }
        }
    }

    /// The receive-path checks that precede any dispatch. `Err(None)` is
    /// the one silent case (TTL already zero); everything else names its
    /// reason.
    fn validate(&self, packet: &[u8]) -> Result<(), Option<String>> {
        if packet.len() < SIZE_IPV4 {
            return Err(Some(format!("runt datagram ({} bytes)", packet.len())));
        }
        let hdr: Ipv4Header = *bytemuck::from_bytes(&packet[..SIZE_IPV4]);
        if hdr.version() != IPV4_VERSION {
            return Err(Some(format!("version {} is not IPv4", hdr.version())));
        }
        let header_len = hdr.header_len();
        if header_len < DEFAULT_IHL as usize * 4 {
            return Err(Some(format!("IHL {} below minimum", header_len / 4)));
        }
        let total_len = hdr.total_len();
        if total_len < header_len || total_len > packet.len() {
            return Err(Some(format!(
                "total length {} inconsistent with {} captured",
                total_len,
                packet.len()
            )));
        }
        if hdr.reserved_flag() {
            return Err(Some("reserved flag set".to_string()));
        }
        if !verify_sum(&packet[..header_len]) {
            return Err(Some("header checksum mismatch".to_string()));
        }
        if hdr.ttl == 0 {
            return Err(None); // the datagram simply timed out
        }
        Ok(())
    }

    fn forward(&self, datagram: &[u8], src: u32, dst: u32) {
        if datagram[8] == 0 {
            eprintln!("[TERN-IP] TTL expired forwarding {} -> {}", ip_str(src), ip_str(dst));
            count(&telem().datagrams_dropped);
            return;
        }
        match self.router.lookup(dst) {
            Some(dev) => match self.devices.send_frame_via(dev, datagram, ETHTYPE_IPV4, dst) {
                Ok(()) => count(&telem().datagrams_forwarded),
                Err(e) => {
                    eprintln!("[TERN-IP] forward emit failed: {}", e);
                    count(&telem().datagrams_dropped);
                }
            },
            None => {
                eprintln!("[TERN-IP] can't route {} -> {}", ip_str(src), ip_str(dst));
                count(&telem().datagrams_dropped);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::pump::EventPump;
    use crate::net::packet::ADDR_BROADCAST;
    use crate::runtime::parse_ip;
    use std::sync::Mutex;

    struct Capture {
        got: Mutex<Vec<(u32, u32, Vec<u8>)>>,
    }

    impl SegmentSink for Capture {
        fn segment_input(&self, segment: &[u8], src: u32, dst: u32) {
            self.got.lock().unwrap().push((src, dst, segment.to_vec()));
        }
    }

    fn layer() -> (Arc<DeviceManager>, Arc<RoutingTable>, Ipv4Layer, DeviceId) {
        let manager = Arc::new(DeviceManager::new(Arc::new(EventPump::new())));
        let (a, _b) = manager
            .add_wire("ia0", [2, 0, 0, 0, 0, 1], "ib0", [2, 0, 0, 0, 0, 2])
            .unwrap();
        manager
            .get(a)
            .unwrap()
            .set_addr(parse_ip("10.100.1.1").unwrap(), 0xffff0000);
        let router = Arc::new(RoutingTable::new(manager.clone()));
        router.seed_local();
        let ip = Ipv4Layer::new(manager.clone(), router.clone());
        (manager, router, ip, a)
    }

    fn datagram_to(dst: u32, protocol: u8, payload: &[u8]) -> Vec<u8> {
        let mut d = build_ipv4_header(parse_ip("10.100.2.3").unwrap(), dst, protocol, payload.len())
            .to_vec();
        d.extend_from_slice(payload);
        d
    }

    #[test]
    fn local_tcp_reaches_the_sink() {
        let (_m, _r, ip, dev) = layer();
        let sink = Capture { got: Mutex::new(Vec::new()) };
        let local = parse_ip("10.100.1.1").unwrap();
        ip.input(dev, &datagram_to(local, PROTO_TCP, b"segment"), &sink);
        let got = sink.got.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, parse_ip("10.100.2.3").unwrap());
        assert_eq!(got[0].1, local);
        assert_eq!(&got[0].2, b"segment");
    }

    #[test]
    fn padding_past_total_length_is_ignored() {
        let (_m, _r, ip, dev) = layer();
        let sink = Capture { got: Mutex::new(Vec::new()) };
        let local = parse_ip("10.100.1.1").unwrap();
        let mut padded = datagram_to(local, PROTO_TCP, b"abc");
        padded.extend_from_slice(&[0u8; 23]); // the Ethernet floor pads frames
        ip.input(dev, &padded, &sink);
        assert_eq!(&sink.got.lock().unwrap()[0].2, b"abc");
    }

    #[test]
    fn bad_checksum_is_dropped() {
        let (_m, _r, ip, dev) = layer();
        let sink = Capture { got: Mutex::new(Vec::new()) };
        let local = parse_ip("10.100.1.1").unwrap();
        let mut d = datagram_to(local, PROTO_TCP, b"abc");
        d[10] ^= 0xff;
        ip.input(dev, &d, &sink);
        assert!(sink.got.lock().unwrap().is_empty());
    }

    #[test]
    fn ttl_zero_is_silently_dropped() {
        let (_m, _r, ip, dev) = layer();
        let sink = Capture { got: Mutex::new(Vec::new()) };
        let local = parse_ip("10.100.1.1").unwrap();
        let mut d = datagram_to(local, PROTO_TCP, b"abc");
        d[8] = 0;
        d[10] = 0;
        d[11] = 0;
        let sum = fold_checksum(&d[..SIZE_IPV4]);
        d[10..12].copy_from_slice(&sum.to_be_bytes());
        ip.input(dev, &d, &sink);
        assert!(sink.got.lock().unwrap().is_empty());
    }

    #[test]
    fn wrong_version_is_dropped() {
        let (_m, _r, ip, dev) = layer();
        let sink = Capture { got: Mutex::new(Vec::new()) };
        let mut d = datagram_to(parse_ip("10.100.1.1").unwrap(), PROTO_TCP, b"abc");
        d[0] = 0x65; // version 6
        ip.input(dev, &d, &sink);
        assert!(sink.got.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_protocol_is_rejected_at_emit() {
        let (_m, _r, ip, _dev) = layer();
        let err = ip.send_datagram(1, 2, 17, b"udp never happened");
        assert_eq!(err, Err(SockErr::BadArg));
    }

    #[test]
    fn hello_broadcast_needs_no_route() {
        let (_m, _r, ip, _dev) = layer();
        // Would fail route lookup as TCP; as hello it broadcasts fine.
        ip.send_datagram(parse_ip("10.100.1.1").unwrap(), ADDR_BROADCAST, PROTO_HELLO, &[0u8; 8])
            .unwrap();
    }
}
