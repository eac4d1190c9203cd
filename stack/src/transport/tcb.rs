// TERN STACK — TRANSPORT: TCB MODULE
// The connection control block. One state mutex guards everything that
// changes together (phase, FSM, counters, windows, queues); one condvar
// wakes every blocked caller; the retransmit list sits behind its own leaf
// mutex so the 5 ms sweeper never contends with a blocked user call.
//
// Lock order, never inverted: socket table -> state -> retransmit.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::transport::window::StreamWindow;

/// What the socket has been through, independent of the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPhase {
    /// Fresh from socket(); nothing assigned.
    Unspecified,
    /// bind() succeeded.
    Bound,
    /// Transmitting or connecting.
    Active,
    /// Listening.
    Passive,
}

/// RFC 793 connection states, minus simultaneous open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimedWait,
}

pub struct TcbState {
    pub phase: SocketPhase,
    pub conn: ConnState,
    /// (address, port), host byte order. Zero until assigned.
    pub local: (u32, u16),
    pub remote: (u32, u16),

    // Send side
    pub seq_init: bool,
    pub snd_nxt: u32,
    pub snd_una: u32,
    /// The peer's advertised window, consumed as writes go out.
    pub peer_wnd: u16,
    pub peer_mss: Option<u16>,

    // Receive side
    pub rcv_nxt: u32,
    pub window: StreamWindow,

    // Listener side
    pub backlog: usize,
    pub pending: VecDeque<Arc<Tcb>>,
    pub half_accepted: Vec<Arc<Tcb>>,
    pub accept_waiters: usize,

    // Close coordination
    pub inflight_io: usize,
    pub close_requested: bool,
    /// Latched when the connection dies under a waiter (RST, retransmit
    /// budget, aborted connect).
    pub refused: bool,
    /// The port is given back exactly once, whichever path gets there first.
    pub port_released: bool,
}

impl TcbState {
    fn new() -> TcbState {
        TcbState {
            phase: SocketPhase::Unspecified,
            conn: ConnState::Closed,
            local: (0, 0),
            remote: (0, 0),
            seq_init: false,
            snd_nxt: 0,
            snd_una: 0,
            peer_wnd: 0,
            peer_mss: None,
            rcv_nxt: 0,
            window: StreamWindow::new(),
            backlog: 0,
            pending: VecDeque::new(),
            half_accepted: Vec::new(),
            accept_waiters: 0,
            inflight_io: 0,
            close_requested: false,
            refused: false,
            port_released: false,
        }
    }

    pub fn matches(&self, local: (u32, u16), remote: (u32, u16)) -> bool {
        self.local == local && self.remote == remote
    }

    /// Data may still arrive in these states.
    pub fn receiving_data(&self) -> bool {
        matches!(
            self.conn,
            ConnState::Established | ConnState::FinWait1 | ConnState::FinWait2
        )
    }
}

pub struct Tcb {
    pub state: Mutex<TcbState>,
    pub wakeup: Condvar,
    pub retrans: Mutex<Vec<RetransSlot>>,
}

impl Tcb {
    pub fn new() -> Arc<Tcb> {
        Arc::new(Tcb {
            state: Mutex::new(TcbState::new()),
            wakeup: Condvar::new(),
            retrans: Mutex::new(Vec::new()),
        })
    }

    /// A half-open CB born from an inbound SYN on a listener.
    pub fn new_half_open(local: (u32, u16), remote: (u32, u16)) -> Arc<Tcb> {
        let tcb = Tcb::new();
        {
            let mut st = tcb.state.lock().unwrap();
            st.phase = SocketPhase::Active;
            st.conn = ConnState::SynRcvd;
            st.local = local;
            st.remote = remote;
        }
        tcb
    }
}

/// One element of the retransmit list: the serialized segment, its starting
/// sequence, how much sequence space it consumes, and its timer state.
pub struct RetransSlot {
    pub seq: u32,
    /// Sequence space consumed (payload length, or 1 for SYN/FIN).
    pub consumed: u32,
    pub segment: Vec<u8>,
    pub ticks: u32,
    pub resends: u32,
}

/// Wrapping sequence comparison: a < b in sequence space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_lt(1, 2));
        assert!(!seq_lt(2, 1));
        assert!(seq_lt(0xffff_fff0, 5)); // across the wrap point
        assert!(!seq_lt(5, 0xffff_fff0));
        assert!(seq_le(7, 7));
    }

    #[test]
    fn half_open_starts_in_syn_rcvd() {
        let tcb = Tcb::new_half_open((0x0a640203, 2345), (0x0a640101, 50000));
        let st = tcb.state.lock().unwrap();
        assert_eq!(st.conn, ConnState::SynRcvd);
        assert_eq!(st.phase, SocketPhase::Active);
        assert!(st.matches((0x0a640203, 2345), (0x0a640101, 50000)));
        assert!(!st.matches((0x0a640203, 2345), (0x0a640101, 50001)));
    }
}
