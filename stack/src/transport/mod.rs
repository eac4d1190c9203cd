// TERN STACK — TRANSPORT MODULE
// The reliable byte-stream engine:
//   segment.rs — TCP header codec, pseudo-header checksum, MSS option
//   window.rs  — bounded circular receive buffer with a push flag
//   bitmap.rs  — packed-bit port allocator with extra-reference counts
//   tcb.rs     — connection control block: phases, FSM, counters, queues
//   tcp.rs     — the engine: socket table, demux, retransmission, timed wait
//   socket.rs  — POSIX-shaped façade with host-kernel passthrough

pub mod bitmap;
pub mod segment;
pub mod socket;
pub mod tcb;
pub mod tcp;
pub mod window;
