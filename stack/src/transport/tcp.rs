// TERN STACK — TRANSPORT: TCP MODULE
// The engine behind the socket façade: descriptor table, connection
// registry, segment demux, emission with retransmission, the periodic
// sweep, and the timed-wait reaper.
//
// Thread picture: the pump thread calls segment_input, the sweeper thread
// calls run_retransmit's body every 5 ms, timed-wait reapers come and go,
// and application threads block inside connect/accept/read/write/close.
// Every blocking call parks on its CB's condvar; no lock is held across a
// wait, and no two CB locks are ever held at once.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::net::ip::{Ipv4Layer, SegmentSink};
use crate::net::packet::PROTO_TCP;
use crate::runtime::{clock_us, count, fatal, ip_str, telem, SockErr, E_SINK_OPEN};
use crate::transport::bitmap::PortMap;
use crate::transport::segment::{
    build_segment, parse_segment, verify_segment, SegmentView, CTL_ACK, CTL_FIN, CTL_PSH, CTL_RST,
    CTL_SYN, DEFAULT_MSS,
};
use crate::transport::tcb::{seq_le, seq_lt, ConnState, RetransSlot, SocketPhase, Tcb, TcbState};

// ============================================================================
// TIMING CONSTANTS
// ============================================================================

/// Sweeper period.
pub const SWEEP_INTERVAL_MS: u64 = 5;
/// Sweeper ticks before a segment is re-sent (20 s).
pub const RETRANS_TICKS: u32 = 4000;
/// Re-sends of one element before the connection is torn down.
pub const RETRANS_BUDGET: u32 = 16;
/// Twice the smoothed round-trip estimate.
pub const TIMED_WAIT_MS: u64 = 200;
/// Backlog clamp, after the Linux default.
const SOMAXCONN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Syn,
    SynAck,
    Ack,
    FinAck,
}

/// Work against a second CB, performed only after the first CB's lock is
/// released.
enum After {
    Nothing,
    /// Handshake complete: move the child from its listener's half-accepted
    /// set into the pending queue and post the listener once.
    Promote(Arc<Tcb>),
    /// RST against a half-open child: drop it from its listener's set.
    Evict(Arc<Tcb>),
    /// The CB finished dying; give back its port and registry slot.
    Dispose(Arc<Tcb>),
    /// Park the CB for 2xRTT, then dispose of it.
    TimedWait(Arc<Tcb>),
}

pub struct TransportLayer {
    ip: Arc<Ipv4Layer>,
    /// Descriptors are dup(2)s of this sink, so they behave like real fds
    /// everywhere we don't intercept them.
    sink_fd: RawFd,
    table: Mutex<HashMap<RawFd, Arc<Tcb>>>,
    /// Every live CB: listeners, connections, half-accepted children.
    conns: Mutex<Vec<Arc<Tcb>>>,
    ports: Mutex<PortMap>,
    /// Handle back to ourselves for the detached timed-wait reapers.
    weak_self: Weak<TransportLayer>,
}

impl TransportLayer {
    pub fn new(ip: Arc<Ipv4Layer>) -> Arc<TransportLayer> {
        // SAFETY: open(2) with a static NUL-terminated path.
        let sink_fd = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR) };
        if sink_fd < 0 {
            fatal(E_SINK_OPEN, "open /dev/null failed");
        }
        Arc::new_cyclic(|weak| TransportLayer {
            ip,
            sink_fd,
            table: Mutex::new(HashMap::new()),
            conns: Mutex::new(Vec::new()),
            ports: Mutex::new(PortMap::new()),
            weak_self: weak.clone(),
        })
    }

    pub fn owns(&self, fd: RawFd) -> bool {
        self.table.lock().unwrap().contains_key(&fd)
    }

    fn get(&self, fd: RawFd) -> Result<Arc<Tcb>, SockErr> {
        self.table.lock().unwrap().get(&fd).cloned().ok_or(SockErr::NoDescriptor)
    }

    fn alloc_fd(&self) -> Result<RawFd, SockErr> {
        // SAFETY: dup(2) of our owned sink descriptor.
        let fd = unsafe { libc::dup(self.sink_fd) };
        if fd < 0 {
            return Err(SockErr::last_os());
        }
        Ok(fd)
    }

    fn primary_addr(&self) -> Result<u32, SockErr> {
        self.ip.router().primary_addr().ok_or(SockErr::AddrUnavailable)
    }

    // ==================================================================
    // SOCKET OPERATIONS
    // ==================================================================

    pub fn socket(&self) -> Result<RawFd, SockErr> {
        let fd = self.alloc_fd()?;
        let tcb = Tcb::new();
        self.table.lock().unwrap().insert(fd, tcb.clone());
        self.conns.lock().unwrap().push(tcb);
        Ok(fd)
    }

    pub fn bind(&self, fd: RawFd, addr: u32, port: u16) -> Result<(), SockErr> {
        let tcb = self.get(fd)?;
        let mut st = tcb.state.lock().unwrap();
        if st.phase != SocketPhase::Unspecified {
            return Err(SockErr::BadArg);
        }
        let local_addr = if addr == 0 {
            // Wildcard binds to the primary address.
            self.primary_addr()?
        } else if self.ip.router().is_local(addr) {
            addr
        } else {
            return Err(SockErr::AddrUnavailable);
        };
        if !self.ports.lock().unwrap().mark(port) {
            return Err(SockErr::AddrInUse);
        }
        st.local = (local_addr, port);
        st.phase = SocketPhase::Bound;
        Ok(())
    }

    pub fn listen(&self, fd: RawFd, backlog: i32) -> Result<(), SockErr> {
        let tcb = self.get(fd)?;
        let mut st = tcb.state.lock().unwrap();
        match st.phase {
            SocketPhase::Passive => return Ok(()), // repeated listen is a noop
            SocketPhase::Active => return Err(SockErr::BadArg),
            SocketPhase::Unspecified => {
                let addr = self.primary_addr()?;
                let port = self
                    .ports
                    .lock()
                    .unwrap()
                    .scan_and_flip()
                    .ok_or(SockErr::AddrUnavailable)?;
                st.local = (addr, port);
            }
            SocketPhase::Bound => {}
        }
        st.backlog = (backlog.max(1) as usize).min(SOMAXCONN);
        st.phase = SocketPhase::Passive;
        st.conn = ConnState::Listen;
        Ok(())
    }

    pub fn connect(&self, fd: RawFd, addr: u32, port: u16) -> Result<(), SockErr> {
        let tcb = self.get(fd)?;
        let mut st = tcb.state.lock().unwrap();
        if st.phase == SocketPhase::Active || st.phase == SocketPhase::Passive {
            return Err(SockErr::AlreadyConnected);
        }
        if st.phase == SocketPhase::Unspecified {
            let local_addr = self.primary_addr()?;
            let local_port = self
                .ports
                .lock()
                .unwrap()
                .scan_and_flip()
                .ok_or(SockErr::AddrUnavailable)?;
            st.local = (local_addr, local_port);
        }
        st.remote = (addr, port);
        st.phase = SocketPhase::Active;
        self.send_segment(&tcb, &mut st, SegmentKind::Syn, &[], false);
        st.conn = ConnState::SynSent;

        while st.conn == ConnState::SynSent {
            st = tcb.wakeup.wait(st).unwrap();
        }
        if st.conn == ConnState::Established {
            Ok(())
        } else {
            Err(SockErr::Refused)
        }
    }

    pub fn accept(&self, fd: RawFd) -> Result<(RawFd, (u32, u16)), SockErr> {
        let tcb = self.get(fd)?;
        let mut st = tcb.state.lock().unwrap();
        if st.phase != SocketPhase::Passive {
            return Err(SockErr::BadArg);
        }
        st.accept_waiters += 1;
        let child = loop {
            if st.conn == ConnState::Closed {
                st.accept_waiters -= 1;
                let last = st.accept_waiters == 0;
                drop(st);
                if last {
                    // The last waiter out releases the listener.
                    self.dispose(&tcb);
                }
                return Err(SockErr::BadArg);
            }
            if let Some(child) = st.pending.pop_front() {
                st.accept_waiters -= 1;
                break child;
            }
            st = tcb.wakeup.wait(st).unwrap();
        };
        drop(st);

        let remote = child.state.lock().unwrap().remote;
        let child_fd = self.alloc_fd()?;
        self.table.lock().unwrap().insert(child_fd, child);
        Ok((child_fd, remote))
    }

    /// Blocks until the requested length is read, the pushed bytes drain,
    /// or the peer half-closes. Returns 0 only at end of stream.
    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize, SockErr> {
        let tcb = self.get(fd)?;
        let mut st = tcb.state.lock().unwrap();
        if st.close_requested {
            return Err(SockErr::NoDescriptor);
        }
        if st.conn != ConnState::Established && st.conn != ConnState::CloseWait {
            return Err(SockErr::NotConnected);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        st.inflight_io += 1;
        let mut total = 0;
        loop {
            let (n, pushed) = st.window.read(&mut buf[total..]);
            total += n;
            if total == buf.len() {
                break;
            }
            if pushed && total > 0 {
                break;
            }
            if !st.window.is_empty() {
                continue;
            }
            // Empty buffer: either more is coming or the stream ended.
            if st.conn != ConnState::Established || st.close_requested {
                break;
            }
            st = tcb.wakeup.wait(st).unwrap();
        }
        if total > 0 {
            // Window update so the peer sees the freed space.
            self.send_segment(&tcb, &mut st, SegmentKind::Ack, &[], false);
        }
        st.inflight_io -= 1;
        self.finish_deferred_close(&tcb, &mut st);
        Ok(total)
    }

    /// Chunks the buffer by the peer's advertised window and our segment
    /// size, blocking while the window is shut.
    pub fn write(&self, fd: RawFd, buf: &[u8]) -> Result<usize, SockErr> {
        let tcb = self.get(fd)?;
        let mut st = tcb.state.lock().unwrap();
        if st.phase != SocketPhase::Active || st.close_requested {
            return Err(SockErr::BrokenPipe);
        }
        match st.conn {
            ConnState::Established => {}
            // The peer half-closed; nothing will be read on the far side.
            ConnState::CloseWait => return Ok(0),
            _ => return Err(SockErr::BrokenPipe),
        }
        if buf.is_empty() {
            // Legal; the segment is headers only.
            self.send_segment(&tcb, &mut st, SegmentKind::Ack, &[], false);
            return Ok(0);
        }
        st.inflight_io += 1;
        let mss = st.peer_mss.unwrap_or(DEFAULT_MSS) as usize;
        let mut total = 0;
        while total < buf.len() {
            if st.conn != ConnState::Established || st.close_requested {
                break;
            }
            let wnd = st.peer_wnd as usize;
            if wnd == 0 {
                st = tcb.wakeup.wait(st).unwrap();
                continue;
            }
            let chunk = (buf.len() - total).min(wnd).min(mss);
            let last = total + chunk == buf.len();
            self.send_segment(&tcb, &mut st, SegmentKind::Ack, &buf[total..total + chunk], last);
            st.peer_wnd -= chunk as u16;
            total += chunk;
        }
        st.inflight_io -= 1;
        self.finish_deferred_close(&tcb, &mut st);
        if total == 0 && !buf.is_empty() {
            return Err(SockErr::BrokenPipe);
        }
        Ok(total)
    }

    pub fn close(&self, fd: RawFd) -> Result<(), SockErr> {
        let tcb = self.get(fd)?;
        let mut st = tcb.state.lock().unwrap();
        match st.phase {
            SocketPhase::Unspecified | SocketPhase::Bound => {
                drop(st);
                self.drop_fd(fd);
                self.dispose(&tcb);
            }
            SocketPhase::Passive => {
                st.conn = ConnState::Closed;
                let inner = &mut *st;
                let orphans: Vec<Arc<Tcb>> = inner
                    .pending
                    .drain(..)
                    .chain(inner.half_accepted.drain(..))
                    .collect();
                let waiters = st.accept_waiters;
                // One post per waiter; each wakes with failure.
                tcb.wakeup.notify_all();
                drop(st);
                self.drop_fd(fd);
                for orphan in orphans {
                    orphan.state.lock().unwrap().conn = ConnState::Closed;
                    self.dispose(&orphan);
                }
                if waiters == 0 {
                    self.dispose(&tcb);
                }
            }
            SocketPhase::Active => match st.conn {
                ConnState::SynSent => {
                    // Abort the connect in flight.
                    st.conn = ConnState::Closed;
                    st.refused = true;
                    tcb.wakeup.notify_all();
                    drop(st);
                    self.drop_fd(fd);
                    self.dispose(&tcb);
                }
                ConnState::Established | ConnState::CloseWait => {
                    if st.close_requested {
                        return Ok(()); // second close is a noop
                    }
                    st.close_requested = true;
                    if st.inflight_io == 0 {
                        self.emit_fin(&tcb, &mut st);
                    }
                    // Else the FIN rides out with the last reader or writer.
                    tcb.wakeup.notify_all();
                    // The descriptor stays mapped until the FSM reaches
                    // CLOSED; writes in between surface broken-pipe.
                }
                ConnState::Closed => {
                    drop(st);
                    self.drop_fd(fd);
                    self.dispose(&tcb);
                }
                // Already closing on the wire; the FSM finishes by itself.
                _ => {}
            },
        }
        Ok(())
    }

    /// Unmap a descriptor and close the underlying dup.
    fn drop_fd(&self, fd: RawFd) {
        if self.table.lock().unwrap().remove(&fd).is_some() {
            // SAFETY: the fd came from our dup and was mapped until now.
            unsafe { libc::close(fd) };
        }
    }

    fn emit_fin(&self, tcb: &Arc<Tcb>, st: &mut MutexGuard<'_, TcbState>) {
        self.send_segment(tcb, st, SegmentKind::FinAck, &[], false);
        st.conn = match st.conn {
            ConnState::CloseWait => ConnState::LastAck,
            _ => ConnState::FinWait1,
        };
    }

    fn finish_deferred_close(&self, tcb: &Arc<Tcb>, st: &mut MutexGuard<'_, TcbState>) {
        if st.close_requested
            && st.inflight_io == 0
            && matches!(st.conn, ConnState::Established | ConnState::CloseWait)
        {
            self.emit_fin(tcb, st);
        }
    }

    // ==================================================================
    // EMISSION
    // ==================================================================

    /// Serialize and send one segment on a CB, under its state lock. SYN
    /// and FIN consume one sequence number, data consumes its length; every
    /// outbound segment joins the retransmit list.
    fn send_segment(
        &self,
        tcb: &Tcb,
        st: &mut TcbState,
        kind: SegmentKind,
        payload: &[u8],
        push: bool,
    ) {
        if !st.seq_init {
            // Microsecond clock shifted right twice, as old as 4.2BSD.
            let isn = (clock_us() >> 2) as u32;
            st.snd_nxt = isn;
            st.snd_una = isn;
            st.seq_init = true;
        }
        let (ctl, consumed, mss) = match kind {
            SegmentKind::Syn => (CTL_SYN, 1u32, Some(DEFAULT_MSS)),
            SegmentKind::SynAck => (CTL_SYN | CTL_ACK, 1, Some(DEFAULT_MSS)),
            SegmentKind::Ack => {
                let ctl = if push { CTL_ACK | CTL_PSH } else { CTL_ACK };
                (ctl, payload.len() as u32, None)
            }
            SegmentKind::FinAck => (CTL_FIN | CTL_ACK, 1, None),
        };
        let seq = st.snd_nxt;
        let ack = if kind == SegmentKind::Syn { 0 } else { st.rcv_nxt };
        let window = st.window.advertised();
        let segment = build_segment(st.local, st.remote, seq, ack, ctl, window, mss, payload);
        st.snd_nxt = st.snd_nxt.wrapping_add(consumed);

        tcb.retrans.lock().unwrap().push(RetransSlot {
            seq,
            consumed,
            segment: segment.clone(),
            ticks: 0,
            resends: 0,
        });
        count(&telem().segments_tx);
        if let Err(e) = self.ip.send_datagram(st.local.0, st.remote.0, PROTO_TCP, &segment) {
            eprintln!(
                "[TERN-TCP] emit to {}:{} failed: {} (retransmission covers it)",
                ip_str(st.remote.0),
                st.remote.1,
                e
            );
        }
    }

    // ==================================================================
    // DEMUX
    // ==================================================================

    fn handle_segment(&self, tcb: &Arc<Tcb>, view: &SegmentView<'_>) -> After {
        let mut st = tcb.state.lock().unwrap();

        if view.has(CTL_RST) {
            let was_half_open = st.conn == ConnState::SynRcvd;
            st.conn = ConnState::Closed;
            st.refused = true;
            tcb.wakeup.notify_all();
            drop(st);
            return if was_half_open {
                After::Evict(tcb.clone())
            } else {
                After::Dispose(tcb.clone())
            };
        }

        // Every inbound segment refreshes the peer's advertised window.
        let window_opened = st.peer_wnd == 0 && view.window > 0;
        st.peer_wnd = view.window;
        if let Some(mss) = view.mss {
            st.peer_mss = Some(mss);
        }
        if window_opened {
            tcb.wakeup.notify_all();
        }

        let acked_our_fin =
            view.has(CTL_ACK) && st.snd_una != st.snd_nxt && view.ack == st.snd_nxt;
        if view.has(CTL_ACK) && seq_lt(st.snd_una, view.ack) && seq_le(view.ack, st.snd_nxt) {
            st.snd_una = view.ack;
            // Writers blocked on the window see both the ack and the
            // refreshed advertisement.
            tcb.wakeup.notify_all();
        }

        match st.conn {
            ConnState::SynSent if view.has(CTL_SYN) && view.has(CTL_ACK) => {
                st.rcv_nxt = view.seq.wrapping_add(1);
                st.conn = ConnState::Established;
                self.send_segment(tcb, &mut st, SegmentKind::Ack, &[], false);
                tcb.wakeup.notify_all();
                return After::Nothing;
            }
            ConnState::SynRcvd if view.has(CTL_ACK) && !view.has(CTL_SYN) => {
                st.conn = ConnState::Established;
                drop(st);
                return After::Promote(tcb.clone());
            }
            _ => {}
        }

        // In-order data. Anything else is silently dropped; retransmission
        // fills the gap.
        if !view.payload.is_empty() && st.receiving_data() {
            if view.seq == st.rcv_nxt {
                let taken = st.window.write(view.payload);
                st.rcv_nxt = st.rcv_nxt.wrapping_add(taken as u32);
                if view.has(CTL_PSH) {
                    st.window.set_push();
                }
                self.send_segment(tcb, &mut st, SegmentKind::Ack, &[], false);
                tcb.wakeup.notify_all();
            } else {
                eprintln!(
                    "[TERN-TCP] out-of-order seq {} (expected {}), dropped",
                    view.seq, st.rcv_nxt
                );
                return After::Nothing;
            }
        }

        if view.has(CTL_FIN) {
            let fin_seq = view.seq.wrapping_add(view.payload.len() as u32);
            if fin_seq != st.rcv_nxt {
                eprintln!("[TERN-TCP] out-of-order FIN dropped");
                return After::Nothing;
            }
            st.rcv_nxt = st.rcv_nxt.wrapping_add(1);
            self.send_segment(tcb, &mut st, SegmentKind::Ack, &[], false);
            match st.conn {
                ConnState::Established => {
                    st.conn = ConnState::CloseWait;
                    tcb.wakeup.notify_all(); // readers return EOF
                    return After::Nothing;
                }
                ConnState::FinWait1 => {
                    if acked_our_fin || st.snd_una == st.snd_nxt {
                        st.conn = ConnState::TimedWait;
                        return After::TimedWait(tcb.clone());
                    }
                    st.conn = ConnState::Closing;
                    return After::Nothing;
                }
                ConnState::FinWait2 => {
                    st.conn = ConnState::TimedWait;
                    return After::TimedWait(tcb.clone());
                }
                _ => return After::Nothing,
            }
        }

        // Bare ACK progress against our own FIN.
        if acked_our_fin {
            match st.conn {
                ConnState::FinWait1 => st.conn = ConnState::FinWait2,
                ConnState::Closing => {
                    st.conn = ConnState::TimedWait;
                    return After::TimedWait(tcb.clone());
                }
                ConnState::LastAck => {
                    st.conn = ConnState::Closed;
                    st.phase = SocketPhase::Unspecified;
                    tcb.wakeup.notify_all();
                    return After::Dispose(tcb.clone());
                }
                _ => {}
            }
        }
        After::Nothing
    }

    fn handle_listener_syn(&self, view: &SegmentView<'_>, src: u32, dst: u32) {
        let listener = self.find_listener(dst, view.dst_port);
        let Some(listener) = listener else {
            eprintln!(
                "[TERN-TCP] no socket for {}:{} <- {}:{}, dropped",
                ip_str(dst),
                view.dst_port,
                ip_str(src),
                view.src_port
            );
            return;
        };

        {
            let st = listener.state.lock().unwrap();
            if st.pending.len() + st.half_accepted.len() >= st.backlog {
                eprintln!("[TERN-TCP] backlog full on port {}, SYN dropped", view.dst_port);
                return;
            }
        }

        let child = Tcb::new_half_open((dst, view.dst_port), (src, view.src_port));
        {
            let mut cst = child.state.lock().unwrap();
            cst.rcv_nxt = view.seq.wrapping_add(1);
            cst.peer_wnd = view.window;
            cst.peer_mss = view.mss;
        }
        // The child shares the listener's port until one of them dies.
        self.ports.lock().unwrap().add_ref(view.dst_port);
        self.conns.lock().unwrap().push(child.clone());
        listener.state.lock().unwrap().half_accepted.push(child.clone());

        let mut cst = child.state.lock().unwrap();
        self.send_segment(&child, &mut cst, SegmentKind::SynAck, &[], false);
    }

    fn find_listener(&self, addr: u32, port: u16) -> Option<Arc<Tcb>> {
        let conns = self.conns.lock().unwrap();
        conns
            .iter()
            .find(|t| {
                let st = t.state.lock().unwrap();
                st.phase == SocketPhase::Passive
                    && st.conn == ConnState::Listen
                    && st.local == (addr, port)
            })
            .cloned()
    }

    fn run_after(&self, action: After) {
        match action {
            After::Nothing => {}
            After::Promote(child) => {
                let (local, _remote) = {
                    let st = child.state.lock().unwrap();
                    (st.local, st.remote)
                };
                if let Some(listener) = self.find_listener(local.0, local.1) {
                    let mut st = listener.state.lock().unwrap();
                    st.half_accepted.retain(|t| !Arc::ptr_eq(t, &child));
                    st.pending.push_back(child);
                    listener.wakeup.notify_one();
                } else {
                    // Listener vanished between handshake steps.
                    child.state.lock().unwrap().conn = ConnState::Closed;
                    self.dispose(&child);
                }
            }
            After::Evict(child) => {
                let local = child.state.lock().unwrap().local;
                if let Some(listener) = self.find_listener(local.0, local.1) {
                    let mut st = listener.state.lock().unwrap();
                    st.half_accepted.retain(|t| !Arc::ptr_eq(t, &child));
                }
                self.dispose(&child);
            }
            After::Dispose(tcb) => self.dispose(&tcb),
            After::TimedWait(tcb) => self.spawn_timed_wait(tcb),
        }
    }

    /// A CB is done for good: give back its port, its registry slot, and
    /// any descriptors still mapped to it. Idempotent.
    fn dispose(&self, tcb: &Arc<Tcb>) {
        let port = {
            let mut st = tcb.state.lock().unwrap();
            if st.port_released || st.local.1 == 0 {
                None
            } else {
                st.port_released = true;
                Some(st.local.1)
            }
        };
        if let Some(port) = port {
            self.ports.lock().unwrap().release(port);
        }
        self.conns.lock().unwrap().retain(|t| !Arc::ptr_eq(t, tcb));
        tcb.retrans.lock().unwrap().clear();

        let stale: Vec<RawFd> = {
            let table = self.table.lock().unwrap();
            table
                .iter()
                .filter(|(_, t)| Arc::ptr_eq(t, tcb))
                .map(|(fd, _)| *fd)
                .collect()
        };
        for fd in stale {
            self.drop_fd(fd);
        }
    }

    // ==================================================================
    // DIAGNOSTICS
    // ==================================================================

    /// The wire state of a descriptor's connection.
    pub fn conn_state(&self, fd: RawFd) -> Result<ConnState, SockErr> {
        let tcb = self.get(fd)?;
        let st = tcb.state.lock().unwrap();
        Ok(st.conn)
    }

    /// Live CBs of every kind: listeners, connections, half-accepted.
    pub fn live_connections(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    fn spawn_timed_wait(&self, tcb: Arc<Tcb>) {
        let Some(this) = self.weak_self.upgrade() else { return };
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(TIMED_WAIT_MS));
            {
                let mut st = tcb.state.lock().unwrap();
                if st.conn != ConnState::TimedWait {
                    return;
                }
                st.conn = ConnState::Closed;
                st.phase = SocketPhase::Unspecified;
                tcb.wakeup.notify_all();
            }
            this.dispose(&tcb);
        });
    }

    // ==================================================================
    // RETRANSMISSION SWEEP
    // ==================================================================

    /// The sweeper thread body: every 5 ms visit every CB, retire what has
    /// been acknowledged, re-send what timed out, and tear down whatever
    /// exhausted its budget.
    pub fn run_retransmit(&self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(SWEEP_INTERVAL_MS));
            let snapshot: Vec<Arc<Tcb>> = self.conns.lock().unwrap().clone();
            for tcb in snapshot {
                let (una, local, remote, active) = {
                    let st = tcb.state.lock().unwrap();
                    (
                        st.snd_una,
                        st.local,
                        st.remote,
                        !matches!(st.conn, ConnState::Closed | ConnState::Listen),
                    )
                };
                if !active {
                    continue;
                }
                let mut resend: Vec<Vec<u8>> = Vec::new();
                let mut exhausted = false;
                {
                    let mut slots = tcb.retrans.lock().unwrap();
                    slots.retain(|s| !seq_lt(s.seq, una));
                    slots.retain_mut(|s| {
                        s.ticks += 1;
                        if s.ticks < RETRANS_TICKS {
                            return true;
                        }
                        s.ticks = 0;
                        s.resends += 1;
                        if s.resends > RETRANS_BUDGET {
                            // A consuming segment the peer never acknowledged
                            // kills the connection; a bare ACK just stops.
                            if s.consumed > 0 {
                                exhausted = true;
                            }
                            return false;
                        }
                        resend.push(s.segment.clone());
                        true
                    });
                }
                for segment in resend {
                    count(&telem().retransmits);
                    let _ = self.ip.send_datagram(local.0, remote.0, PROTO_TCP, &segment);
                }
                if exhausted {
                    eprintln!(
                        "[TERN-TCP] retransmit budget exhausted toward {}:{}, closing",
                        ip_str(remote.0),
                        remote.1
                    );
                    let was_half_open = {
                        let mut st = tcb.state.lock().unwrap();
                        let half = st.conn == ConnState::SynRcvd;
                        st.conn = ConnState::Closed;
                        st.refused = true;
                        tcb.wakeup.notify_all();
                        half
                    };
                    if was_half_open {
                        self.run_after(After::Evict(tcb));
                    } else {
                        self.dispose(&tcb);
                    }
                }
            }
        }
    }
}

impl SegmentSink for TransportLayer {
    /// A TCP segment addressed to this host: verify, parse, and demux to
    /// the owning CB, or to a listener when it opens a connection.
    fn segment_input(&self, segment: &[u8], src: u32, dst: u32) {
        count(&telem().segments_rx);
        if !verify_segment(src, dst, segment) {
            eprintln!("[TERN-TCP] segment checksum mismatch, dropped");
            return;
        }
        let Some(view) = parse_segment(segment) else {
            eprintln!("[TERN-TCP] undecodable segment, dropped");
            return;
        };
        let local = (dst, view.dst_port);
        let remote = (src, view.src_port);

        let owner = {
            let conns = self.conns.lock().unwrap();
            conns
                .iter()
                .find(|t| t.state.lock().unwrap().matches(local, remote))
                .cloned()
        };
        match owner {
            Some(tcb) => {
                let action = self.handle_segment(&tcb, &view);
                self.run_after(action);
            }
            None if view.has(CTL_SYN) && !view.has(CTL_ACK) => {
                self.handle_listener_syn(&view, src, dst);
            }
            None if view.has(CTL_RST) => {} // nothing left to reset
            None => {
                eprintln!(
                    "[TERN-TCP] segment for unknown connection {}:{} <- {}:{}, dropped",
                    ip_str(dst),
                    view.dst_port,
                    ip_str(src),
                    view.src_port
                );
            }
        }
    }
}

impl Drop for TransportLayer {
    fn drop(&mut self) {
        // SAFETY: the sink fd is owned here and closed exactly once.
        unsafe { libc::close(self.sink_fd) };
    }
}

// ============================================================================
// TESTS
// ============================================================================
