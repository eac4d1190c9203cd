// TERN STACK — LINK: MANAGER MODULE
// Registry of frame endpoints. Hands out monotonically increasing handles,
// wires descriptors into the readiness pump, and offers the two link-level
// send shapes the layers above need: broadcast-everywhere and
// ARP-resolved unicast through one endpoint.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Arc, Mutex};

use crate::link::device::Device;
use crate::link::pump::EventPump;
use crate::link::{DeviceId, BROADCAST_MAC};
use crate::runtime::{ip_str, SockErr};

pub struct DeviceManager {
    pump: Arc<EventPump>,
    /// Index in this vector == the endpoint's handle.
    devices: Mutex<Vec<Arc<Device>>>,
    name2id: Mutex<HashMap<String, DeviceId>>,
}

impl DeviceManager {
    pub fn new(pump: Arc<EventPump>) -> DeviceManager {
        DeviceManager {
            pump,
            devices: Mutex::new(Vec::new()),
            name2id: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Open a capture session on a named host interface and register it.
    /// Fails if the host doesn't know the name or it is already registered.
    pub fn add_device(&self, name: &str) -> Result<DeviceId, SockErr> {
        if !host_has_interface(name) {
            eprintln!("[TERN-LINK] {} is not a host interface", name);
            return Err(SockErr::AddrUnavailable);
        }
        if self.name2id.lock().unwrap().contains_key(name) {
            eprintln!("[TERN-LINK] {} is already registered", name);
            return Err(SockErr::AddrInUse);
        }
        let id = self.devices.lock().unwrap().len();
        let dev = Arc::new(Device::open(id, name)?);
        self.install(dev)
    }

    /// Register every AF_INET-capable non-loopback interface of the host,
    /// carrying its address and netmask over. Returns how many came up.
    pub fn add_all_devices(&self) -> usize {
        let mut added = 0;
        for (name, addr, mask) in host_inet_interfaces() {
            if self.name2id.lock().unwrap().contains_key(&name) {
                // A second address on a registered interface just updates it.
                if let Some(dev) = self.find(&name) {
                    if dev.addr().is_none() {
                        dev.set_addr(addr, mask);
                    }
                }
                continue;
            }
            match self.add_device(&name) {
                Ok(id) => {
                    let dev = self.get(id).unwrap();
                    dev.set_addr(addr, mask);
                    eprintln!(
                        "[TERN-LINK] up: {} ({}) {}/{}",
                        name,
                        id,
                        ip_str(addr),
                        mask.count_ones()
                    );
                    added += 1;
                }
                Err(e) => eprintln!("[TERN-LINK] skipping {}: {}", name, e),
            }
        }
        added
    }

    /// Register both ends of a virtual wire (a datagram socketpair) as two
    /// endpoints of THIS manager. Loopback topologies and the tests use it.
    pub fn add_wire(
        &self,
        name_a: &str,
        mac_a: [u8; 6],
        name_b: &str,
        mac_b: [u8; 6],
    ) -> Result<(DeviceId, DeviceId), SockErr> {
        let base = self.devices.lock().unwrap().len();
        let (a, b) = Device::pair(base, name_a, mac_a, base + 1, name_b, mac_b)?;
        let id_a = self.install(Arc::new(a))?;
        let id_b = self.install(Arc::new(b))?;
        Ok((id_a, id_b))
    }

    /// Register one pre-built endpoint (the other end of its wire typically
    /// lives in a different manager).
    pub fn adopt(&self, build: impl FnOnce(DeviceId) -> Result<Device, SockErr>) -> Result<DeviceId, SockErr> {
        let id = self.devices.lock().unwrap().len();
        let dev = Arc::new(build(id)?);
        self.install(dev)
    }

    fn install(&self, dev: Arc<Device>) -> Result<DeviceId, SockErr> {
        self.pump.register(&dev)?;
        let id = dev.id;
        self.name2id.lock().unwrap().insert(dev.name.clone(), id);
        self.devices.lock().unwrap().push(dev);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn get(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(id).cloned()
    }

    pub fn find(&self, name: &str) -> Option<Arc<Device>> {
        let id = *self.name2id.lock().unwrap().get(name)?;
        self.get(id)
    }

    pub fn list(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().clone()
    }

    /// The primary address: the first configured endpoint's. Wildcard binds
    /// resolve to this.
    pub fn primary_addr(&self) -> Option<u32> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find_map(|d| d.addr().map(|(a, _)| a))
    }

    pub fn is_local_addr(&self, addr: u32) -> bool {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .any(|d| d.addr().map(|(a, _)| a) == Some(addr))
    }

    pub fn set_addr(&self, name: &str, addr: u32, mask: u32) -> Result<(), SockErr> {
        let dev = self.find(name).ok_or(SockErr::AddrUnavailable)?;
        dev.set_addr(addr, mask);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Emit one payload on every endpoint, destination MAC all-ones.
    pub fn broadcast_frame(&self, payload: &[u8], ethertype: u16) {
        for dev in self.list() {
            if let Err(e) = dev.send_frame(payload, ethertype, &BROADCAST_MAC) {
                eprintln!("[TERN-LINK] broadcast on {} failed: {}", dev.name, e);
            }
        }
    }

    /// Emit on one endpoint toward its remembered peer. Fails if ARP has
    /// not discovered one yet.
    pub fn send_frame_via(
        &self,
        id: DeviceId,
        payload: &[u8],
        ethertype: u16,
        peer_addr: u32,
    ) -> Result<(), SockErr> {
        let dev = self.get(id).ok_or(SockErr::BadArg)?;
        match dev.peer() {
            Some(mac) => dev.send_frame(payload, ethertype, &mac),
            None => {
                eprintln!(
                    "[TERN-ARP] {}: no peer yet for {}, dropping",
                    dev.name,
                    ip_str(peer_addr)
                );
                Err(SockErr::AddrUnavailable)
            }
        }
    }
}

// ============================================================================
// HOST INTERFACE DISCOVERY
// ============================================================================

fn host_has_interface(name: &str) -> bool {
    let c_name = match CString::new(name) {
        Ok(c) => c,
        Err(_) => return false,
    };
    // SAFETY: if_nametoindex on a NUL-terminated name; 0 means unknown.
    unsafe { libc::if_nametoindex(c_name.as_ptr()) != 0 }
}

/// Walk getifaddrs for (name, address, netmask) of every AF_INET interface
/// except loopback. Addresses come back in host byte order.
fn host_inet_interfaces() -> Vec<(String, u32, u32)> {
    let mut out = Vec::new();
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs allocates a list we free below; failure leaves ifap null.
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        eprintln!("[TERN-LINK] getifaddrs failed");
        return out;
    }
    let mut cur = ifap;
    while !cur.is_null() {
        // SAFETY: cur walks the kernel-built list; each node is valid until
        // freeifaddrs below.
        unsafe {
            let ifa = &*cur;
            cur = ifa.ifa_next;
            if ifa.ifa_addr.is_null() || (*ifa.ifa_addr).sa_family as i32 != libc::AF_INET {
                continue;
            }
            let name = std::ffi::CStr::from_ptr(ifa.ifa_name).to_string_lossy().into_owned();
            if name == "lo" {
                continue;
            }
            let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
            let addr = u32::from_be(sin.sin_addr.s_addr);
            let mask = if ifa.ifa_netmask.is_null() {
                0xffff_ff00
            } else {
                let m = &*(ifa.ifa_netmask as *const libc::sockaddr_in);
                u32::from_be(m.sin_addr.s_addr)
            };
            out.push((name, addr, mask));
        }
    }
    // SAFETY: ifap came from a successful getifaddrs.
    unsafe { libc::freeifaddrs(ifap) };
    out
}

// ============================================================================
// TESTS
// ============================================================================
