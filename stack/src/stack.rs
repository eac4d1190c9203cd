// TERN STACK — STACK MODULE
// The assembled engine. One Stack owns the device multiplexor, the routing
// plane, and the transport engine, plus the three service threads that
// drive them: the readiness pump, the periodic router tick, and the
// retransmit sweeper. The ownership runs strictly downward — the
// multiplexor owns endpoints, the upper layers borrow the multiplexor —
// and the pump dispatches upward through the Stack itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::link::manager::DeviceManager;
use crate::link::pump::EventPump;
use crate::link::{DatagramSink, DeviceId};
use crate::net::ip::Ipv4Layer;
use crate::net::route::RoutingTable;
use crate::runtime::{enable_hexdump, fatal, E_NO_DEVICE};
use crate::transport::tcp::TransportLayer;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Capture interfaces to bring up. Empty plus `auto_discover` means
    /// every AF_INET-capable interface of the host.
    pub ifaces: Vec<String>,
    pub auto_discover: bool,
    /// Interval of the periodic routing cycle.
    pub cycle_ms: u64,
    pub hexdump: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            ifaces: Vec::new(),
            auto_discover: false,
            cycle_ms: 2500,
            hexdump: false,
        }
    }
}

impl StackConfig {
    /// TERN_IFACES (comma-separated), TERN_CYCLE_MS, TERN_HEXDUMP.
    pub fn from_env() -> StackConfig {
        let ifaces: Vec<String> = std::env::var("TERN_IFACES")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let cycle_ms = std::env::var("TERN_CYCLE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2500);
        StackConfig {
            auto_discover: ifaces.is_empty(),
            ifaces,
            cycle_ms,
            hexdump: std::env::var("TERN_HEXDUMP").is_ok(),
        }
    }
}

// ============================================================================
// STACK
// ============================================================================

pub struct Stack {
    pub devices: Arc<DeviceManager>,
    pub router: Arc<RoutingTable>,
    pub ip: Arc<Ipv4Layer>,
    pub tcp: Arc<TransportLayer>,
    pump: Arc<EventPump>,
    cfg: StackConfig,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Stack {
    /// Assemble the layers. Endpoints named in the config come up here;
    /// the service threads don't run until `start`.
    pub fn new(cfg: StackConfig) -> Arc<Stack> {
        if cfg.hexdump {
            enable_hexdump();
        }
        let pump = Arc::new(EventPump::new());
        let devices = Arc::new(DeviceManager::new(pump.clone()));

        for name in &cfg.ifaces {
            match devices.add_device(name) {
                Ok(id) => eprintln!("[TERN-BOOT] capture up on {} ({})", name, id),
                Err(e) => eprintln!("[TERN-BOOT] {} failed: {}", name, e),
            }
        }
        if cfg.auto_discover {
            devices.add_all_devices();
        }

        let router = Arc::new(RoutingTable::new(devices.clone()));
        router.seed_local();
        let ip = Arc::new(Ipv4Layer::new(devices.clone(), router.clone()));
        let tcp = TransportLayer::new(ip.clone());

        Arc::new(Stack {
            devices,
            router,
            ip,
            tcp,
            pump,
            cfg,
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the pump, the periodic router tick, and the retransmit
    /// sweeper. Refuses to start with no endpoint to drive.
    pub fn start(self: &Arc<Stack>) {
        if self.devices.list().is_empty() {
            fatal(E_NO_DEVICE, "no capture endpoint came up");
        }

        let mut threads = self.threads.lock().unwrap();

        let pump_stack = self.clone();
        threads.push(
            std::thread::Builder::new()
                .name("tern-pump".into())
                .spawn(move || pump_stack.pump.run(&*pump_stack))
                .expect("spawn pump"),
        );

        let tick_stack = self.clone();
        threads.push(
            std::thread::Builder::new()
                .name("tern-tick".into())
                .spawn(move || tick_stack.run_ticker())
                .expect("spawn ticker"),
        );

        let sweep_stack = self.clone();
        threads.push(
            std::thread::Builder::new()
                .name("tern-retrans".into())
                .spawn(move || {
                    let shutdown = sweep_stack.shutdown.clone();
                    sweep_stack.tcp.run_retransmit(&shutdown)
                })
                .expect("spawn sweeper"),
        );
    }

    /// Periodic cycle: ARP solicitation, hello, link-state flood, aging and
    /// recompute. Sleeps in short slices so shutdown lands within ~50 ms.
    fn run_ticker(&self) {
        let interval = Duration::from_millis(self.cfg.cycle_ms.max(50));
        while !self.shutdown.load(Ordering::Relaxed) {
            self.router.periodic_cycle();
            let mut slept = Duration::ZERO;
            while slept < interval && !self.shutdown.load(Ordering::Relaxed) {
                let slice = Duration::from_millis(50).min(interval - slept);
                std::thread::sleep(slice);
                slept += slice;
            }
        }
    }

    /// Stop all three service threads and join them.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.pump.stop();
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        eprintln!("[TERN-BOOT] stack stopped");
    }

    /// True once every endpoint has a remembered ARP peer; topologies come
    /// up after one periodic cycle.
    pub fn peers_resolved(&self) -> bool {
        let devices = self.devices.list();
        !devices.is_empty() && devices.iter().all(|d| d.peer().is_some())
    }
}

impl DatagramSink for Stack {
    fn datagram_input(&self, dev: DeviceId, packet: &[u8]) {
        self.ip.input(dev, packet, &*self.tcp);
    }
}

// ============================================================================
// PROCESS-GLOBAL ENGINE
// ============================================================================

static GLOBAL: OnceLock<Arc<Stack>> = OnceLock::new();

/// The engine behind the socket façade, built lazily from the environment
/// on first use. Its destruction is end-of-process.
pub fn global_stack() -> &'static Stack {
    let stack = GLOBAL.get_or_init(|| {
        let stack = Stack::new(StackConfig::from_env());
        stack.start();
        stack
    });
    &**stack
}

/// Install a pre-built stack as the process engine. Returns false if one
/// is already installed.
pub fn install_global(stack: Arc<Stack>) -> bool {
    GLOBAL.set(stack).is_ok()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::parse_ip;

    #[test]
    fn config_defaults_are_quiet() {
        let cfg = StackConfig::default();
        assert!(cfg.ifaces.is_empty());
        assert!(!cfg.auto_discover);
        assert_eq!(cfg.cycle_ms, 2500);
    }

    #[test]
    fn stack_assembles_without_interfaces() {
        let stack = Stack::new(StackConfig::default());
        assert!(stack.devices.list().is_empty());
        assert!(!stack.peers_resolved());
    }

    #[test]
    fn wired_stacks_exchange_arp_on_one_cycle() {
        let a = Stack::new(StackConfig { cycle_ms: 50, ..Default::default() });
        let b = Stack::new(StackConfig { cycle_ms: 50, ..Default::default() });
        wire(&a, &b, "va0", "vb0");
        a.router.seed_local();
        b.router.seed_local();
        a.start();
        b.start();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !(a.peers_resolved() && b.peers_resolved()) {
            assert!(std::time::Instant::now() < deadline, "ARP never paired");
            std::thread::sleep(Duration::from_millis(20));
        }
        a.shutdown();
        b.shutdown();
    }

    /// Join two stacks with a socketpair wire: 10.100.1.1/16 on `a`,
    /// 10.100.2.3/16 on `b`.
    pub(crate) fn wire(a: &Arc<Stack>, b: &Arc<Stack>, name_a: &str, name_b: &str) {
        use crate::link::device::Device;
        let mut fds = [0; 2];
        // SAFETY: socketpair(2) with a valid out array.
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let mac_a = [0xf6, 0x05, 0xd4, 0x2b, 0xdb, 0x5f];
        let mac_b = [0x4a, 0x5b, 0x71, 0x31, 0x4e, 0x2d];
        let id_a = a
            .devices
            .adopt(|id| Device::from_wire(id, name_a, mac_a, fds[0]))
            .unwrap();
        let id_b = b
            .devices
            .adopt(|id| Device::from_wire(id, name_b, mac_b, fds[1]))
            .unwrap();
        a.devices.get(id_a).unwrap().set_addr(parse_ip("10.100.1.1").unwrap(), 0xffff0000);
        b.devices.get(id_b).unwrap().set_addr(parse_ip("10.100.2.3").unwrap(), 0xffff0000);
    }
}
