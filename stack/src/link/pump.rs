// TERN STACK — LINK: PUMP MODULE
// The single readiness loop. Every endpoint's descriptor is registered with
// one epoll instance; the pump thread blocks with a bounded timeout and
// fires the owning endpoint's drain exactly once per ready descriptor.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::link::device::Device;
use crate::link::DatagramSink;
use crate::runtime::{fatal, SockErr, E_EPOLL_CREATE};

const MAX_EVENTS: usize = 256;
/// Bounded wait so the shutdown flag is observed promptly.
const TIMEOUT_MS: i32 = 100;

pub struct EventPump {
    epfd: RawFd,
    registry: Mutex<HashMap<RawFd, Arc<Device>>>,
    shutdown: AtomicBool,
}

impl EventPump {
    /// Fatal if the readiness object cannot be created: the stack refuses
    /// to start without one.
    pub fn new() -> EventPump {
        // SAFETY: plain epoll_create1 call; the fd is checked before use.
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            fatal(E_EPOLL_CREATE, "epoll_create1 failed");
        }
        EventPump {
            epfd,
            registry: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn register(&self, dev: &Arc<Device>) -> Result<(), SockErr> {
        let fd = dev.raw_fd();
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        // SAFETY: epoll_ctl with our epoll fd, a live target fd, and a valid
        // event struct.
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event) } < 0 {
            eprintln!("[TERN-PUMP] epoll_ctl add failed for fd {}", fd);
            return Err(SockErr::last_os());
        }
        let mut reg = self.registry.lock().unwrap();
        if reg.insert(fd, dev.clone()).is_some() {
            eprintln!("[TERN-PUMP] fd {} registered twice", fd);
        }
        Ok(())
    }

    /// The loop body of the pump thread. Returns when `stop` is called.
    pub fn run(&self, sink: &dyn DatagramSink) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        while !self.shutdown.load(Ordering::Relaxed) {
            // SAFETY: epoll_wait into a live event array of MAX_EVENTS slots.
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, TIMEOUT_MS)
            };
            if n < 0 {
                // SAFETY: __errno_location always returns a valid pointer.
                let err = unsafe { *libc::__errno_location() };
                if err == libc::EINTR {
                    continue;
                }
                eprintln!("[TERN-PUMP] epoll_wait error {}", err);
                return;
            }
            for ev in &events[..n as usize] {
                let fd = ev.u64 as RawFd;
                let dev = self.registry.lock().unwrap().get(&fd).cloned();
                match dev {
                    Some(dev) => dev.drain(sink),
                    None => eprintln!("[TERN-PUMP] ready fd {} has no owner", fd),
                }
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        // SAFETY: the epoll fd is owned here and closed exactly once.
        unsafe { libc::close(self.epfd) };
    }
}

// ============================================================================
// TESTS
// ============================================================================
