// TERN STACK — Orchestrator
// Brings the stack up on the requested capture interfaces, runs the
// service threads, and optionally exercises the socket surface with a
// stream echo server or a one-shot client. Ctrl-C tears everything down.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tern_stack::runtime::{fatal, ip_str, telem, Telemetry, E_NO_DEVICE, SHM_NAME_PREFIX};
use tern_stack::stack::{install_global, Stack, StackConfig};
use tern_stack::transport::socket;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
extern "C" fn signal_handler(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    // SAFETY: signal_handler is a valid extern "C" fn with a stable address.
    // It performs one Relaxed atomic store, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("[TERN-BOOT] PANIC: {}", info);
        std::process::exit(1);
    }));

    let mut cfg = StackConfig::from_env();
    let mut echo_port: Option<u16> = None;
    let mut connect_to: Option<SocketAddrV4> = None;
    let mut loopback_wire = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--monitor" => {
                run_monitor();
                return;
            }
            "-i" | "--iface" => {
                i += 1;
                if i < args.len() {
                    cfg.ifaces.push(args[i].clone());
                    cfg.auto_discover = false;
                }
            }
            "--cycle-ms" => {
                i += 1;
                if i < args.len() {
                    cfg.cycle_ms = match args[i].parse() {
                        Ok(v) => v,
                        Err(_) => fatal(E_NO_DEVICE, "invalid --cycle-ms value"),
                    };
                }
            }
            "--hexdump" => cfg.hexdump = true,
            "--wire" => loopback_wire = true,
            "--echo" => {
                i += 1;
                if i < args.len() {
                    echo_port = args[i].parse().ok();
                }
            }
            "--connect" => {
                i += 1;
                if i < args.len() {
                    connect_to = args[i].parse().ok();
                }
            }
            other => {
                if !other.starts_with("--") {
                    cfg.ifaces.push(other.to_string());
                    cfg.auto_discover = false;
                }
            }
        }
        i += 1;
    }
    if cfg.ifaces.is_empty() && !loopback_wire {
        cfg.auto_discover = true;
    }

    let stack = Stack::new(cfg);
    if loopback_wire {
        // A self-contained two-endpoint wire; handy without privileges.
        match stack.devices.add_wire(
            "tern0",
            [0x02, 0x54, 0x45, 0x52, 0x4e, 0x00],
            "tern1",
            [0x02, 0x54, 0x45, 0x52, 0x4e, 0x01],
        ) {
            Ok((a, b)) => {
                stack.devices.get(a).unwrap().set_addr(0x0a640101, 0xffff0000);
                stack.devices.get(b).unwrap().set_addr(0x0a640203, 0xffff0000);
                stack.router.seed_local();
            }
            Err(e) => fatal(E_NO_DEVICE, &format!("loopback wire failed: {}", e)),
        }
    }
    stack.start();
    if !install_global(stack.clone()) {
        eprintln!("[TERN-BOOT] global engine already installed");
    }

    for dev in stack.devices.list() {
        eprintln!("[TERN-BOOT] {:?}", dev);
    }

    if let Some(port) = echo_port {
        run_echo_server(port);
    } else if let Some(addr) = connect_to {
        run_client(addr);
    } else {
        // Idle: report the routing table whenever it changes, and the
        // counters once a second.
        let mut last = String::new();
        let mut ticks = 0u32;
        while !SHUTDOWN.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(200));
            let mut lines: Vec<String> = stack
                .router
                .entries()
                .iter()
                .map(|e| format!("{}/{} -> dev {}", ip_str(e.prefix), e.mask.count_ones(), e.device))
                .collect();
            lines.sort();
            let table = lines.join(", ");
            if table != last {
                eprintln!("[TERN-ROUTE] table: [{}]", table);
                last = table;
            }
            ticks += 1;
            if ticks % 5 == 0 {
                eprint!("\r{}   ", telemetry_line(telem()));
            }
        }
        eprintln!();
    }

    stack.shutdown();
}

fn telemetry_line(t: &Telemetry) -> String {
    format!(
        "[TELEM] F:{}/{} D:{} ARP:{} FWD:{}/{} SEG:{}/{} RETX:{}",
        t.frames_tx.value.load(Ordering::Relaxed),
        t.frames_rx.value.load(Ordering::Relaxed),
        t.frames_dropped.value.load(Ordering::Relaxed),
        t.arp_replies.value.load(Ordering::Relaxed),
        t.datagrams_forwarded.value.load(Ordering::Relaxed),
        t.datagrams_dropped.value.load(Ordering::Relaxed),
        t.segments_tx.value.load(Ordering::Relaxed),
        t.segments_rx.value.load(Ordering::Relaxed),
        t.retransmits.value.load(Ordering::Relaxed),
    )
}

/// Attach to every stack process publishing counters under /dev/shm and
/// print one combined line a second.
fn run_monitor() {
    eprintln!("[TERN-MONITOR] scanning for stack processes...");
    let prefix = SHM_NAME_PREFIX.trim_start_matches('/');
    let mut attached = Vec::new();
    while attached.is_empty() {
        if let Ok(entries) = std::fs::read_dir("/dev/shm") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(pid) = name.strip_prefix(prefix) {
                    if let Some(t) = Telemetry::map_named(&format!("/{}", name), false) {
                        attached.push((pid.to_string(), t));
                    }
                }
            }
        }
        if attached.is_empty() {
            std::thread::sleep(Duration::from_millis(500));
            if SHUTDOWN.load(Ordering::Relaxed) {
                return;
            }
        }
    }
    eprintln!("[TERN-MONITOR] attached to {} stack(s)", attached.len());
    while !SHUTDOWN.load(Ordering::Relaxed) {
        for (pid, t) in &attached {
            eprint!("\r[{}] {}   ", pid, telemetry_line(t));
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    eprintln!();
}

/// Accept loop: echo every byte a client sends until it closes.
fn run_echo_server(port: u16) {
    let fd = match socket::socket(libc::AF_INET, libc::SOCK_STREAM, 0) {
        Ok(fd) => fd,
        Err(e) => fatal(E_NO_DEVICE, &format!("socket failed: {}", e)),
    };
    let bind_addr = SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port);
    if let Err(e) = socket::bind(fd, bind_addr) {
        fatal(E_NO_DEVICE, &format!("bind failed: {}", e));
    }
    if let Err(e) = socket::listen(fd, 5) {
        fatal(E_NO_DEVICE, &format!("listen failed: {}", e));
    }
    eprintln!("[TERN-SOCK] echo server on port {}", port);

    while !SHUTDOWN.load(Ordering::Relaxed) {
        let (conn, peer) = match socket::accept(fd) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("[TERN-SOCK] accept ended: {}", e);
                break;
            }
        };
        eprintln!("[TERN-SOCK] connection from {}", peer);
        std::thread::spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match socket::read(conn, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if socket::write(conn, &buf[..n]).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = socket::close(conn);
            eprintln!("[TERN-SOCK] {} done", peer);
        });
    }
    let _ = socket::close(fd);
}

/// One-shot client: send a line, read the echo, compare.
fn run_client(addr: SocketAddrV4) {
    let fd = match socket::socket(libc::AF_INET, libc::SOCK_STREAM, 0) {
        Ok(fd) => fd,
        Err(e) => fatal(E_NO_DEVICE, &format!("socket failed: {}", e)),
    };
    eprintln!("[TERN-SOCK] connecting to {}", addr);
    if let Err(e) = socket::connect(fd, addr) {
        fatal(E_NO_DEVICE, &format!("connect failed: {}", e));
    }
    let message = b"The quick brown fox jumps over the lazy dog.\n";
    match socket::write(fd, message) {
        Ok(n) => eprintln!("[TERN-SOCK] wrote {} bytes", n),
        Err(e) => fatal(E_NO_DEVICE, &format!("write failed: {}", e)),
    }
    let mut back = vec![0u8; message.len()];
    match socket::read(fd, &mut back) {
        Ok(n) if &back[..n] == &message[..n] => {
            eprintln!("[TERN-SOCK] echo verified ({} bytes)", n)
        }
        Ok(n) => eprintln!("[TERN-SOCK] echo MISMATCH ({} bytes)", n),
        Err(e) => eprintln!("[TERN-SOCK] read failed: {}", e),
    }
    let _ = socket::close(fd);
}
