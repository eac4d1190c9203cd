// TERN STACK — CRATE ROOT (LIBRARY)
// A user-space Ethernet/IPv4/TCP stack driven entirely from raw packet I/O.
//
// Module hierarchy:
//   runtime    — fatal exit diagnostics, monotonic clocks, hexdump, POSIX
//                error vocabulary
//   link/      — frame endpoints (capture sockets + ARP), device multiplexor,
//                epoll readiness pump
//   net/       — IPv4 emit/parse/forward, hello + link-state routing plane,
//                shortest-path routing table
//   transport/ — TCP segments, connection control blocks, retransmission,
//                byte-stream windows, port allocator, POSIX socket façade
//   stack      — the assembled engine: one object owning devices, router,
//                transport, and the three service threads

pub mod runtime;
pub mod link;
pub mod net;
pub mod transport;
pub mod stack;

pub use stack::{Stack, StackConfig};
