// TERN STACK — LINK: DEVICE MODULE
// One capture endpoint. Owns a non-blocking packet socket (AF_PACKET bound
// to a host interface, or one end of an AF_UNIX datagram wire), its MAC,
// an optional IPv4 address, and the remembered ARP peer.
//
// Discovery policy: the endpoint models a point-to-point virtual Ethernet
// with at most one peer. Every ARP receipt silently replaces the slot.

use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::link::{
    ArpPacket, DatagramSink, DeviceId, EthernetHeader, ARP_HARDWARE_ETHERNET, ARP_OP_REPLY,
    ARP_OP_REQUEST, BROADCAST_MAC, ETHER_ADDR_LEN, ETHTYPE_ARP, ETHTYPE_IPV4, ETH_MAX_PAYLOAD,
    ETH_MIN_PAYLOAD, SIZE_ARP, SIZE_ETHERNET,
};
use crate::runtime::{count, hexdump_tx, ip_str, mac_str, telem, SockErr};

/// Largest frame we ever pull off the wire. Anything the kernel reports as
/// longer arrived truncated and is dropped.
const CAPTURE_BUF: usize = 2048;

pub struct Device {
    pub id: DeviceId,
    pub name: String,
    fd: RawFd,
    pub mac: [u8; 6],
    /// (address, netmask), host byte order. Unset until configured.
    addr: Mutex<Option<(u32, u32)>>,
    /// The remembered peer. A mutex serializes ARP accesses on this endpoint.
    peer: Mutex<Option<[u8; 6]>>,
}

impl Device {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Open a raw capture session on a named host interface.
    /// Binds an AF_PACKET socket to the interface, reads its MAC through
    /// SIOCGIFHWADDR, and switches the descriptor to non-blocking mode.
    pub fn open(id: DeviceId, name: &str) -> Result<Device, SockErr> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(SockErr::BadArg);
        }

        // SAFETY: plain socket(2) call; the fd is checked before use.
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if fd < 0 {
            eprintln!("[TERN-LINK] capture socket failed for {}", name);
            return Err(SockErr::last_os());
        }

        // SAFETY: ifreq is repr(C); all-zeroes is a valid bit pattern. The
        // name fits IFNAMSIZ (checked above) and stays NUL-terminated.
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (i, b) in name.bytes().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }

        // Interface index, for the bind below.
        // SAFETY: FFI ioctl with a valid fd and ifreq pointer.
        if unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut ifr) } < 0 {
            // SAFETY: fd is open and owned here.
            unsafe { libc::close(fd) };
            eprintln!("[TERN-LINK] ioctl(SIOCGIFINDEX) failed for {}", name);
            return Err(SockErr::AddrUnavailable);
        }
        // SAFETY: ifr_ifru is a union; SIOCGIFINDEX filled the ifindex arm.
        let ifindex = unsafe { ifr.ifr_ifru.ifru_ifindex };

        // SAFETY: sockaddr_ll is repr(C); all-zeroes is valid before filling.
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        sll.sll_ifindex = ifindex;
        // SAFETY: bind(2) with a correctly sized sockaddr_ll.
        let rc = unsafe {
            libc::bind(
                fd,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            // SAFETY: fd is open and owned here.
            unsafe { libc::close(fd) };
            eprintln!("[TERN-LINK] bind to {} failed", name);
            return Err(SockErr::last_os());
        }

        // Hardware address.
        // SAFETY: FFI ioctl with a valid fd and ifreq pointer.
        if unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut ifr) } < 0 {
            // SAFETY: fd is open and owned here.
            unsafe { libc::close(fd) };
            eprintln!("[TERN-LINK] ioctl(SIOCGIFHWADDR) failed for {}", name);
            return Err(SockErr::last_os());
        }
        let mut mac = [0u8; 6];
        // SAFETY: SIOCGIFHWADDR filled the ifru_hwaddr arm of the union.
        let hw = unsafe { ifr.ifr_ifru.ifru_hwaddr };
        for i in 0..ETHER_ADDR_LEN {
            mac[i] = hw.sa_data[i] as u8;
        }

        set_nonblocking(fd)?;
        Ok(Device {
            id,
            name: name.to_string(),
            fd,
            mac,
            addr: Mutex::new(None),
            peer: Mutex::new(None),
        })
    }

    /// Build an endpoint over an already-connected datagram descriptor.
    /// This is how virtual wires come up: `socketpair(AF_UNIX, SOCK_DGRAM)`
    /// preserves frame boundaries and needs no privilege.
    pub fn from_wire(id: DeviceId, name: &str, mac: [u8; 6], fd: RawFd) -> Result<Device, SockErr> {
        set_nonblocking(fd)?;
        Ok(Device {
            id,
            name: name.to_string(),
            fd,
            mac,
            addr: Mutex::new(None),
            peer: Mutex::new(None),
        })
    }

    /// Two endpoints joined back-to-back by a datagram socketpair. A frame
    /// sent on either end is captured whole on the other.
    pub fn pair(
        id_a: DeviceId,
        name_a: &str,
        mac_a: [u8; 6],
        id_b: DeviceId,
        name_b: &str,
        mac_b: [u8; 6],
    ) -> Result<(Device, Device), SockErr> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: socketpair(2) with a valid out array of two fds.
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr())
        };
        if rc < 0 {
            return Err(SockErr::last_os());
        }
        let a = Device::from_wire(id_a, name_a, mac_a, fds[0])?;
        let b = Device::from_wire(id_b, name_b, mac_b, fds[1])?;
        Ok((a, b))
    }

    // ------------------------------------------------------------------
    // Addressing
    // ------------------------------------------------------------------

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_addr(&self, addr: u32, mask: u32) {
        *self.addr.lock().unwrap() = Some((addr, mask));
    }

    pub fn addr(&self) -> Option<(u32, u32)> {
        *self.addr.lock().unwrap()
    }

    pub fn peer(&self) -> Option<[u8; 6]> {
        *self.peer.lock().unwrap()
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Encapsulate a payload into an Ethernet II frame and send it.
    /// Short payloads are zero-padded to the 46-byte floor; payloads over
    /// 1500 bytes are refused.
    pub fn send_frame(&self, payload: &[u8], ethertype: u16, dst_mac: &[u8; 6]) -> Result<(), SockErr> {
        if payload.len() > ETH_MAX_PAYLOAD {
            eprintln!(
                "[TERN-LINK] {}: refusing {}-byte payload (max {})",
                self.name,
                payload.len(),
                ETH_MAX_PAYLOAD
            );
            return Err(SockErr::BadArg);
        }
        let data_len = payload.len().max(ETH_MIN_PAYLOAD);
        let mut frame = vec![0u8; SIZE_ETHERNET + data_len];
        let hdr = EthernetHeader {
            dst: *dst_mac,
            src: self.mac,
            ethertype: ethertype.to_be(),
        };
        frame[..SIZE_ETHERNET].copy_from_slice(bytemuck::bytes_of(&hdr));
        frame[SIZE_ETHERNET..SIZE_ETHERNET + payload.len()].copy_from_slice(payload);

        hexdump_tx("[TERN-TX]", &frame);
        // SAFETY: send(2) on our owned fd with a live buffer.
        let rc = unsafe { libc::send(self.fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0) };
        if rc < 0 {
            eprintln!("[TERN-LINK] {}: send failed", self.name);
            return Err(SockErr::last_os());
        }
        count(&telem().frames_tx);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------

    /// Drain every frame currently queued on the descriptor. Called by the
    /// pump when the fd polls readable; the fd is non-blocking so the loop
    /// ends at EWOULDBLOCK.
    pub fn drain(&self, sink: &dyn DatagramSink) {
        let mut buf = [0u8; CAPTURE_BUF];
        loop {
            // SAFETY: recv(2) on our owned fd into a live buffer. MSG_TRUNC
            // makes the kernel report the real frame length even when it
            // exceeds the buffer, which is how truncation is detected.
            let rc = unsafe {
                libc::recv(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_TRUNC | libc::MSG_DONTWAIT,
                )
            };
            if rc < 0 {
                // SAFETY: __errno_location always returns a valid pointer.
                let err = unsafe { *libc::__errno_location() };
                if err != libc::EAGAIN && err != libc::EWOULDBLOCK && err != libc::EINTR {
                    eprintln!("[TERN-LINK] {}: recv error {}", self.name, err);
                }
                return;
            }
            let reported = rc as usize;
            if reported == 0 {
                return;
            }
            if reported > buf.len() {
                // Captured length shorter than the frame on the wire.
                eprintln!("[TERN-LINK] {}: dropped truncated {}-byte frame", self.name, reported);
                count(&telem().frames_dropped);
                continue;
            }
            count(&telem().frames_rx);
            self.frame_input(&buf[..reported], sink);
        }
    }

    fn frame_input(&self, frame: &[u8], sink: &dyn DatagramSink) {
        if frame.len() < SIZE_ETHERNET {
            eprintln!("[TERN-LINK] {}: runt frame ({} bytes)", self.name, frame.len());
            return;
        }
        let hdr: EthernetHeader = *bytemuck::from_bytes(&frame[..SIZE_ETHERNET]);
        let dst = hdr.dst;
        match u16::from_be(hdr.ethertype) {
            ETHTYPE_ARP => self.arp_input(&frame[SIZE_ETHERNET..]),
            ETHTYPE_IPV4 => {
                if dst == self.mac || dst == BROADCAST_MAC {
                    sink.datagram_input(self.id, &frame[SIZE_ETHERNET..]);
                }
            }
            _ => {} // not ours
        }
    }

    // ------------------------------------------------------------------
    // ARP
    // ------------------------------------------------------------------

    fn arp_input(&self, payload: &[u8]) {
        if payload.len() < SIZE_ARP {
            return;
        }
        let pkt: ArpPacket = *bytemuck::from_bytes(&payload[..SIZE_ARP]);
        if u16::from_be(pkt.hardware_type) != ARP_HARDWARE_ETHERNET
            || u16::from_be(pkt.protocol_type) != ETHTYPE_IPV4
            || pkt.hardware_size as usize != ETHER_ADDR_LEN
            || pkt.protocol_size != 4
        {
            return;
        }
        // Copy packed fields out before touching them by reference.
        let sender_mac = pkt.sender_mac;
        let sender_ip = pkt.sender_ip;
        let target_mac = pkt.target_mac;
        match u16::from_be(pkt.opcode) {
            ARP_OP_REQUEST => {
                *self.peer.lock().unwrap() = Some(sender_mac);
                match self.arp_reply(&sender_mac, sender_ip) {
                    Ok(()) => count(&telem().arp_replies),
                    Err(e) => eprintln!("[TERN-ARP] {}: reply failed: {}", self.name, e),
                }
            }
            ARP_OP_REPLY => {
                if target_mac == self.mac {
                    *self.peer.lock().unwrap() = Some(sender_mac);
                }
            }
            _ => {}
        }
    }

    /// Broadcast a solicitation: target MAC all-ones, target address
    /// 255.255.255.255. Whoever hears it replies with its own pair.
    pub fn arp_solicit(&self) -> Result<(), SockErr> {
        let our_ip = self.addr().map(|(a, _)| a).unwrap_or(0);
        let pkt = ArpPacket {
            hardware_type: ARP_HARDWARE_ETHERNET.to_be(),
            protocol_type: ETHTYPE_IPV4.to_be(),
            hardware_size: ETHER_ADDR_LEN as u8,
            protocol_size: 4,
            opcode: ARP_OP_REQUEST.to_be(),
            sender_mac: self.mac,
            sender_ip: our_ip.to_be_bytes(),
            target_mac: BROADCAST_MAC,
            target_ip: [0xff; 4],
        };
        self.send_frame(bytemuck::bytes_of(&pkt), ETHTYPE_ARP, &BROADCAST_MAC)
    }

    fn arp_reply(&self, dst_mac: &[u8; 6], dst_ip: [u8; 4]) -> Result<(), SockErr> {
        let our_ip = self.addr().map(|(a, _)| a).unwrap_or(0);
        let pkt = ArpPacket {
            hardware_type: ARP_HARDWARE_ETHERNET.to_be(),
            protocol_type: ETHTYPE_IPV4.to_be(),
            hardware_size: ETHER_ADDR_LEN as u8,
            protocol_size: 4,
            opcode: ARP_OP_REPLY.to_be(),
            sender_mac: self.mac,
            sender_ip: our_ip.to_be_bytes(),
            target_mac: *dst_mac,
            target_ip: dst_ip,
        };
        self.send_frame(bytemuck::bytes_of(&pkt), ETHTYPE_ARP, dst_mac)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // SAFETY: the fd is owned by this endpoint and closed exactly once.
        unsafe { libc::close(self.fd) };
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Device({}, {}, {}", self.id, self.name, mac_str(&self.mac))?;
        if let Some((a, m)) = self.addr() {
            write!(f, ", {}/{}", ip_str(a), m.count_ones())?;
        }
        write!(f, ")")
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), SockErr> {
    // SAFETY: fcntl(2) on a valid descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(SockErr::last_os());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(SockErr::last_os());
        }
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Collector {
        got: StdMutex<Vec<(DeviceId, Vec<u8>)>>,
    }

    impl DatagramSink for Collector {
        fn datagram_input(&self, dev: DeviceId, packet: &[u8]) {
            self.got.lock().unwrap().push((dev, packet.to_vec()));
        }
    }

    fn wire() -> (Device, Device) {
        Device::pair(
            0,
            "wa0",
            [0x02, 0, 0, 0, 0, 0xaa],
            1,
            "wb0",
            [0x02, 0, 0, 0, 0, 0xbb],
        )
        .unwrap()
    }

    #[test]
    fn frame_crosses_the_wire() {
        let (a, b) = wire();
        let sink = Collector { got: StdMutex::new(Vec::new()) };
        let payload: Vec<u8> = (0..200u16).map(|i| i as u8).collect();
        a.send_frame(&payload, ETHTYPE_IPV4, &b.mac).unwrap();
        b.drain(&sink);
        let got = sink.got.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 1);
        // Padding past the payload is delivered; the leading bytes match.
        assert_eq!(&got[0].1[..payload.len()], &payload[..]);
    }

    #[test]
    fn short_payload_is_padded_to_floor() {
        let (a, b) = wire();
        let sink = Collector { got: StdMutex::new(Vec::new()) };
        a.send_frame(b"hi", ETHTYPE_IPV4, &BROADCAST_MAC).unwrap();
        b.drain(&sink);
        let got = sink.got.lock().unwrap();
        assert_eq!(got[0].1.len(), ETH_MIN_PAYLOAD);
        assert_eq!(&got[0].1[..2], b"hi");
    }

    #[test]
    fn oversize_payload_is_refused() {
        let (a, _b) = wire();
        let payload = vec![0u8; ETH_MAX_PAYLOAD + 1];
        assert_eq!(
            a.send_frame(&payload, ETHTYPE_IPV4, &BROADCAST_MAC),
            Err(SockErr::BadArg)
        );
    }

    #[test]
    fn frame_to_other_mac_is_dropped() {
        let (a, b) = wire();
        let sink = Collector { got: StdMutex::new(Vec::new()) };
        a.send_frame(&[1, 2, 3], ETHTYPE_IPV4, &[0x02, 9, 9, 9, 9, 9]).unwrap();
        b.drain(&sink);
        assert!(sink.got.lock().unwrap().is_empty());
    }

    #[test]
    fn arp_pairing_remembers_both_peers() {
        let (a, b) = wire();
        a.set_addr(u32::from(std::net::Ipv4Addr::new(10, 100, 1, 1)), 0xffff0000);
        b.set_addr(u32::from(std::net::Ipv4Addr::new(10, 100, 2, 3)), 0xffff0000);
        let sink = Collector { got: StdMutex::new(Vec::new()) };

        a.arp_solicit().unwrap();
        b.drain(&sink); // request: B remembers A and replies
        a.drain(&sink); // reply: A remembers B
        assert_eq!(b.peer(), Some(a.mac));
        assert_eq!(a.peer(), Some(b.mac));
        assert!(sink.got.lock().unwrap().is_empty()); // ARP never goes upward
    }

    #[test]
    fn arp_receipt_replaces_the_peer_silently() {
        let (a, b) = wire();
        let sink = Collector { got: StdMutex::new(Vec::new()) };
        a.arp_solicit().unwrap();
        b.drain(&sink);
        assert_eq!(b.peer(), Some(a.mac));

        // A second solicitation from a different source MAC wins the slot.
        let other = ArpPacket {
            hardware_type: ARP_HARDWARE_ETHERNET.to_be(),
            protocol_type: ETHTYPE_IPV4.to_be(),
            hardware_size: 6,
            protocol_size: 4,
            opcode: ARP_OP_REQUEST.to_be(),
            sender_mac: [0x02, 1, 2, 3, 4, 5],
            sender_ip: [10, 0, 0, 9],
            target_mac: BROADCAST_MAC,
            target_ip: [0xff; 4],
        };
        a.send_frame(bytemuck::bytes_of(&other), ETHTYPE_ARP, &BROADCAST_MAC).unwrap();
        b.drain(&sink);
        assert_eq!(b.peer(), Some([0x02, 1, 2, 3, 4, 5]));
    }
}
