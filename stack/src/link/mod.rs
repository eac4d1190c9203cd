// TERN STACK — LINK MODULE
// Everything at the frame level:
//   device.rs  — one capture endpoint: raw socket, MAC, ARP peer slot, drain
//   manager.rs — endpoint registry, broadcast, ARP-resolved unicast
//   pump.rs    — epoll readiness loop feeding per-endpoint drains

pub mod device;
pub mod manager;
pub mod pump;

use std::mem;

use bytemuck::{Pod, Zeroable};

/// Handle assigned to an endpoint on registration. Monotonic, never reused.
pub type DeviceId = usize;

// ============================================================================
// WIRE CONSTANTS
// ============================================================================

pub const ETHER_ADDR_LEN: usize = 6;
/// dst(6) + src(6) + ethertype(2)
pub const SIZE_ETHERNET: usize = 14;
/// Ethernet II payload bounds. Short payloads are zero-padded up to the
/// minimum; anything over the maximum is refused at the send boundary.
pub const ETH_MIN_PAYLOAD: usize = 46;
pub const ETH_MAX_PAYLOAD: usize = 1500;

pub const ETHTYPE_IPV4: u16 = 0x0800;
pub const ETHTYPE_ARP: u16 = 0x0806;

pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

// ============================================================================
// WIRE HEADERS
// ============================================================================

/// Ethernet II header. 14 bytes on wire. The ethertype field holds wire
/// (big-endian) byte order; convert explicitly on access.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct EthernetHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: u16,
}
const _: () = assert!(mem::size_of::<EthernetHeader>() == SIZE_ETHERNET);

/// ARP packet for (Ethernet, IPv4). 28 bytes on wire, all multi-octet
/// integers big-endian.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct ArpPacket {
    pub hardware_type: u16, // 1 = Ethernet
    pub protocol_type: u16, // 0x0800 = IPv4
    pub hardware_size: u8,  // 6
    pub protocol_size: u8,  // 4
    pub opcode: u16,        // 1 = request, 2 = reply
    pub sender_mac: [u8; 6],
    pub sender_ip: [u8; 4],
    pub target_mac: [u8; 6],
    pub target_ip: [u8; 4],
}
pub const SIZE_ARP: usize = 28;
const _: () = assert!(mem::size_of::<ArpPacket>() == SIZE_ARP);

pub const ARP_HARDWARE_ETHERNET: u16 = 1;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

// ============================================================================
// UPWARD DISPATCH
// ============================================================================

/// Capability handed to the readiness pump: IPv4 payloads flow out of a
/// device's drain through exactly this seam. Endpoints keep no back-reference
/// to the layers above them.
pub trait DatagramSink: Send + Sync {
    fn datagram_input(&self, dev: DeviceId, packet: &[u8]);
}
