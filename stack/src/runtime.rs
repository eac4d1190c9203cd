// TERN STACK — RUNTIME MODULE
// Infrastructure that supports the stack but isn't a protocol: fatal exit
// diagnostics, monotonic clocks, rate-limited hexdump, SHM-mapped telemetry
// counters, and the POSIX error vocabulary surfaced to socket callers.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

// ============================================================================
// FATAL EXIT + DIAGNOSTIC ERROR CODES
// ============================================================================

// Convention: 0x10-0x1F = Boot, 0x20-0x2F = Link, 0x30-0x3F = Net, 0x40-0x4F = Transport

// Boot failures (the stack refuses to start)
pub const E_NO_DEVICE: i32 = 0x10;
pub const E_EPOLL_CREATE: i32 = 0x11;
pub const E_SINK_OPEN: i32 = 0x12;
pub const E_CAPTURE_OPEN: i32 = 0x13;

/// Structured fatal exit. No heap allocation, no unwinding, no formatting.
/// Writes one fixed-format line to stderr via raw writev, then exits.
/// Output: "[TERN FATAL 0xHH] msg\n"
#[inline(never)]
pub fn fatal(code: i32, msg: &str) -> ! {
    let prefix = b"[TERN FATAL 0x";
    let hex = [
        b"0123456789ABCDEF"[((code >> 4) & 0xF) as usize],
        b"0123456789ABCDEF"[(code & 0xF) as usize],
    ];
    let suffix = b"] ";
    let newline = b"\n";
    let iov = [
        libc::iovec { iov_base: prefix.as_ptr() as *mut _, iov_len: prefix.len() },
        libc::iovec { iov_base: hex.as_ptr() as *mut _, iov_len: 2 },
        libc::iovec { iov_base: suffix.as_ptr() as *mut _, iov_len: suffix.len() },
        libc::iovec { iov_base: msg.as_ptr() as *mut _, iov_len: msg.len() },
        libc::iovec { iov_base: newline.as_ptr() as *mut _, iov_len: 1 },
    ];
    // SAFETY: writev(2, iov, 5) writes to stderr (fd 2, always open). All iov
    // entries point to live byte slices with correct lengths.
    unsafe { libc::writev(2, iov.as_ptr(), 5); }
    std::process::exit(code);
}

// ============================================================================
// CLOCKS
// ============================================================================

#[inline(always)]
pub fn clock_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: FFI call with a valid mutable reference to a timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Monotonic microseconds. Initial TCP sequence numbers derive from this.
#[inline(always)]
pub fn clock_us() -> u64 {
    clock_ns() / 1_000
}

// ============================================================================
// HEXDUMP (rate-limited wire inspection)
// ============================================================================

const HEXDUMP_INTERVAL_NS: u64 = 100_000_000; // 100ms = 10/sec max

static HEXDUMP_ENABLED: AtomicBool = AtomicBool::new(false);
static HEXDUMP_LAST_NS: AtomicU64 = AtomicU64::new(0);

pub fn enable_hexdump() {
    HEXDUMP_ENABLED.store(true, Ordering::Relaxed);
}

/// Dump the head of an outbound frame, at most ten times a second across the
/// whole process. Ethernet offsets are annotated; the rest is raw hex.
pub fn hexdump_tx(label: &str, frame: &[u8]) {
    if !HEXDUMP_ENABLED.load(Ordering::Relaxed) {
        return;
    }
    let now = clock_ns();
    let last = HEXDUMP_LAST_NS.load(Ordering::Relaxed);
    if now.saturating_sub(last) < HEXDUMP_INTERVAL_NS {
        return;
    }
    HEXDUMP_LAST_NS.store(now, Ordering::Relaxed);

    let cap = frame.len().min(80);
    let dst = if cap >= 6 { mac_str(&frame[0..6]) } else { "?".into() };
    let src = if cap >= 12 { mac_str(&frame[6..12]) } else { "?".into() };
    let ethertype = if cap >= 14 {
        u16::from_be_bytes([frame[12], frame[13]])
    } else {
        0
    };
    eprintln!("{} len={} dst={} src={} type=0x{:04X}", label, frame.len(), dst, src, ethertype);
    let mut off = 0;
    while off < cap {
        let end = (off + 16).min(cap);
        let hex: Vec<String> = frame[off..end].iter().map(|b| format!("{:02x}", b)).collect();
        eprintln!("  [{:02}..{:02}] {}", off, end, hex.join(" "));
        off = end;
    }
}

pub fn mac_str(mac: &[u8]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

// ============================================================================
// TELEMETRY — SHM-mapped per-process counters
// ============================================================================

pub const SHM_NAME_PREFIX: &str = "/tern_telem_";

#[repr(align(128))]
pub struct CachePadded<T> {
    pub value: T,
}

/// Process-wide stack counters. Memory-mapped via /dev/shm so an external
/// monitor can read them without touching the engine. All fields are
/// atomics with Relaxed ordering (diagnostic, not synchronization).
#[repr(C)]
pub struct Telemetry {
    pub frames_tx: CachePadded<AtomicU64>,
    pub frames_rx: CachePadded<AtomicU64>,
    pub frames_dropped: CachePadded<AtomicU64>,
    pub arp_replies: CachePadded<AtomicU64>,
    pub datagrams_forwarded: CachePadded<AtomicU64>,
    pub datagrams_dropped: CachePadded<AtomicU64>,
    pub segments_rx: CachePadded<AtomicU64>,
    pub segments_tx: CachePadded<AtomicU64>,
    pub retransmits: CachePadded<AtomicU64>,
    pub pid: CachePadded<AtomicU32>,
}

/// Raw pointer wrapper for shared-memory telemetry. Does NOT carry &mut
/// semantics, so several processes mapping the same region stay sound: one
/// writer plus N readers is valid because every field is atomic.
pub struct TelemetryPtr(*mut Telemetry);
// SAFETY: the pointed-to region is all atomics; see TelemetryPtr docs.
unsafe impl Send for TelemetryPtr {}
// SAFETY: same reasoning; shared reads go through atomics only.
unsafe impl Sync for TelemetryPtr {}
impl std::ops::Deref for TelemetryPtr {
    type Target = Telemetry;
    // SAFETY: self.0 came from mmap on an shm_open fd sized to Telemetry
    // (or from Box::leak in the fallback); the mapping lives for the whole
    // process.
    fn deref(&self) -> &Telemetry {
        unsafe { &*self.0 }
    }
}

impl Telemetry {
    /// Map a named telemetry region. The owner creates and zeroes it;
    /// readers just attach.
    pub fn map_named(name: &str, is_owner: bool) -> Option<TelemetryPtr> {
        // SAFETY: shm_open/ftruncate/mmap sequence on a fresh or existing
        // POSIX shared memory object; the pointer is valid for the process
        // lifetime (munmap is never called).
        unsafe {
            let c_name = CString::new(name).ok()?;
            let mut fd = libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0);
            if is_owner {
                if fd < 0 {
                    fd = libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_CREAT | libc::O_RDWR,
                        (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
                    );
                }
                if fd < 0 {
                    return None;
                }
                if libc::ftruncate(fd, std::mem::size_of::<Telemetry>() as libc::off_t) != 0 {
                    libc::close(fd);
                    return None;
                }
            } else if fd < 0 {
                return None;
            }
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                std::mem::size_of::<Telemetry>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                return None;
            }
            if is_owner {
                std::ptr::write_bytes(ptr as *mut u8, 0, std::mem::size_of::<Telemetry>());
            }
            Some(TelemetryPtr(ptr as *mut Telemetry))
        }
    }
}

static TELEM: OnceLock<TelemetryPtr> = OnceLock::new();

/// The process's own counters. Mapped once under "/tern_telem_<pid>"; if
/// /dev/shm is unavailable the counters fall back to a leaked heap block
/// and only the monitor loses visibility.
pub fn telem() -> &'static Telemetry {
    TELEM.get_or_init(|| {
        // SAFETY: getpid never fails.
        let pid = unsafe { libc::getpid() } as u32;
        let name = format!("{}{}", SHM_NAME_PREFIX, pid);
        let ptr = Telemetry::map_named(&name, true).unwrap_or_else(|| {
            eprintln!("[TERN-BOOT] telemetry shm map failed, counters stay private");
            // SAFETY: a leaked zeroed allocation is a valid Telemetry: every
            // field is an atomic whose zero bit pattern is a valid value.
            unsafe {
                let layout = std::alloc::Layout::new::<Telemetry>();
                TelemetryPtr(std::alloc::alloc_zeroed(layout) as *mut Telemetry)
            }
        });
        ptr.pid.value.store(pid, Ordering::Relaxed);
        ptr
    })
}

#[inline]
pub fn count(counter: &CachePadded<AtomicU64>) {
    counter.value.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// POSIX ERROR VOCABULARY
// ============================================================================

/// Errors surfaced to socket callers. Each maps onto one POSIX errno; `Os`
/// carries whatever errno a passthrough syscall produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockErr {
    BadArg,          // EINVAL
    NoDescriptor,    // EBADF
    NotConnected,    // ENOTCONN
    AlreadyConnected,// EISCONN
    BrokenPipe,      // EPIPE
    AddrUnavailable, // EADDRNOTAVAIL
    AddrInUse,       // EADDRINUSE
    Refused,         // ECONNREFUSED
    Os(i32),
}

impl SockErr {
    pub fn errno(&self) -> i32 {
        match self {
            SockErr::BadArg => libc::EINVAL,
            SockErr::NoDescriptor => libc::EBADF,
            SockErr::NotConnected => libc::ENOTCONN,
            SockErr::AlreadyConnected => libc::EISCONN,
            SockErr::BrokenPipe => libc::EPIPE,
            SockErr::AddrUnavailable => libc::EADDRNOTAVAIL,
            SockErr::AddrInUse => libc::EADDRINUSE,
            SockErr::Refused => libc::ECONNREFUSED,
            SockErr::Os(e) => *e,
        }
    }

    /// Capture the calling thread's errno after a failed libc call.
    pub fn last_os() -> SockErr {
        // SAFETY: __errno_location always returns a valid thread-local pointer.
        SockErr::Os(unsafe { *libc::__errno_location() })
    }
}

impl std::fmt::Display for SockErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SockErr::BadArg => write!(f, "invalid argument"),
            SockErr::NoDescriptor => write!(f, "bad file descriptor"),
            SockErr::NotConnected => write!(f, "not connected"),
            SockErr::AlreadyConnected => write!(f, "already connected"),
            SockErr::BrokenPipe => write!(f, "broken pipe"),
            SockErr::AddrUnavailable => write!(f, "address not available"),
            SockErr::AddrInUse => write!(f, "address in use"),
            SockErr::Refused => write!(f, "connection refused"),
            SockErr::Os(e) => write!(f, "os error {}", e),
        }
    }
}

// ============================================================================
// ADDRESS HELPERS
// ============================================================================

/// IPv4 addresses travel the stack as host-order u32; conversion to wire
/// byte order happens exactly once, at the codec boundary.
pub fn ip_str(addr: u32) -> String {
    std::net::Ipv4Addr::from(addr).to_string()
}

pub fn parse_ip(s: &str) -> Option<u32> {
    s.parse::<std::net::Ipv4Addr>().ok().map(u32::from)
}

// ============================================================================
// TESTS
// ============================================================================
