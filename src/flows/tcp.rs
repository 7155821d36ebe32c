//! TCP virtual-connection engine.
//!
//! From the app's side this is a full peer: it answers SYN with SYN+ACK,
//! acknowledges data, sends FIN, and may send RST. From the remote side it is
//! an ordinary stream client over a protected kernel socket. Sequence numbers
//! toward the app are derived from two monotone byte counters rather than
//! per-packet bookkeeping; there is no retransmission and no window tracking,
//! because the app-to-tun hop is lossless and the kernel stack covers the
//! real network.

use super::builder::{self, TcpFrameSpec};
use super::{FlowKey, InitPool, Protocol};
use crate::device::{TcpFlagBits, TcpSegment, TunSink};
use crate::dns::DomainCache;
use crate::host::{SocketFactory, CONNECT_TIMEOUT};
use crate::policy::{Decision, PolicyEngine};
use crate::stats::{self, FlowCounters};
use crossbeam_channel::{bounded, Receiver};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use rustc_hash::FxBuildHasher;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const DOWNLINK_BUFFER_SIZE: usize = 16 * 1024;

/// Caps on uplink data buffered between handshake completion and the
/// upstream connect landing; a flow that overruns them is reset.
const MAX_PENDING_PAYLOADS: usize = 8;
const MAX_PENDING_BYTES: usize = 64 * 1024;

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    /// SYN observed, SYN+ACK emitted, waiting for the completing ACK.
    SynSeen,
    Established,
    /// App closed first; upstream write side is shut, downlink still drains.
    FinWaitServer,
    /// Server EOFed first; FIN+ACK emitted, waiting for the app to finish.
    FinWaitApp,
    Closed,
    Reset,
}

struct ConnState {
    phase: Phase,
    client_seq: u32,
    server_seq: u32,
    client_bytes_seen: u64,
    server_bytes_sent: u64,
    upstream: Option<TcpStream>,
    /// Uplink payloads accepted before the upstream socket exists.
    pending_uplink: VecDeque<Vec<u8>>,
    pending_bytes: usize,
    /// App sent FIN while the connect was still in flight.
    client_shutdown: bool,
}

pub(crate) struct TcpConn {
    key: FlowKey,
    state: Mutex<ConnState>,
    closed_once: AtomicBool,
    worker_done: Mutex<Option<Receiver<()>>>,
}

impl TcpConn {
    fn new(key: FlowKey, client_seq: u32, server_seq: u32) -> Self {
        Self {
            key,
            state: Mutex::new(ConnState {
                phase: Phase::SynSeen,
                client_seq,
                server_seq,
                client_bytes_seen: 0,
                server_bytes_sent: 0,
                upstream: None,
                pending_uplink: VecDeque::new(),
                pending_bytes: 0,
                client_shutdown: false,
            }),
            closed_once: AtomicBool::new(false),
            worker_done: Mutex::new(None),
        }
    }
}

pub(crate) struct TcpEngine {
    flows: DashMap<FlowKey, Arc<TcpConn>, FxBuildHasher>,
    sockets: Arc<dyn SocketFactory>,
    policy: Arc<PolicyEngine>,
    cache: Arc<DomainCache>,
    tun: Arc<TunSink>,
    init_pool: Arc<InitPool>,
    running: Arc<AtomicBool>,
    pub(crate) counters: Arc<FlowCounters>,
    max_mss: u16,
    weak_self: Weak<TcpEngine>,
}

impl TcpEngine {
    pub(crate) fn new(
        sockets: Arc<dyn SocketFactory>,
        policy: Arc<PolicyEngine>,
        cache: Arc<DomainCache>,
        tun: Arc<TunSink>,
        init_pool: Arc<InitPool>,
        running: Arc<AtomicBool>,
        counters: Arc<FlowCounters>,
        max_mss: u16,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            flows: DashMap::with_hasher(FxBuildHasher),
            sockets,
            policy,
            cache,
            tun,
            init_pool,
            running,
            counters,
            max_mss,
            weak_self: weak.clone(),
        })
    }

    pub(crate) fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Per-packet dispatch from the tun reader thread.
    pub(crate) fn process_packet(&self, segment: &TcpSegment<'_>) {
        let key = FlowKey::from_tcp(segment);
        let flags = segment.flags;

        let Some(conn) = self.flows.get(&key).map(|entry| Arc::clone(entry.value())) else {
            // No connection yet: only a pure SYN opens one, everything else
            // is dropped.
            if flags.contains(TcpFlagBits::SYN) && !flags.contains(TcpFlagBits::ACK) {
                self.begin_handshake(key, segment);
            }
            return;
        };

        if flags.contains(TcpFlagBits::RST) {
            debug!("tcp {key}: reset observed, evicting");
            self.evict(&conn, false);
            return;
        }
        if flags.contains(TcpFlagBits::SYN) {
            // duplicate SYN on a live connection
            return;
        }

        let phase = conn.state.lock().phase;
        match phase {
            Phase::SynSeen => self.maybe_complete_handshake(&conn, segment),
            Phase::Established => {
                if !segment.payload.is_empty() && flags.contains(TcpFlagBits::ACK) {
                    self.forward_uplink(&conn, segment.payload);
                }
                if flags.contains(TcpFlagBits::FIN) {
                    self.half_close_from_app(&conn);
                }
            }
            Phase::FinWaitApp => {
                // a FIN, or the bare ACK of our FIN, finishes the flow;
                // stray data is ignored
                if flags.contains(TcpFlagBits::FIN)
                    || (flags.contains(TcpFlagBits::ACK) && segment.payload.is_empty())
                {
                    self.evict(&conn, false);
                }
            }
            Phase::FinWaitServer | Phase::Closed | Phase::Reset => {}
        }
    }

    fn begin_handshake(&self, key: FlowKey, segment: &TcpSegment<'_>) {
        let domain = self.cache.get(&key.dst.into());
        let decision = self.policy.evaluate(&key.tuple(Protocol::Tcp), domain.as_deref());
        if decision == Decision::Block {
            stats::bump(&self.counters.flows_blocked);
            debug!(
                "tcp {key}: blocked by policy (domain={})",
                domain.as_deref().unwrap_or("-")
            );
            let _ = self.tun.write_frame(&builder::reset_for_segment(segment));
            return;
        }

        let server_seq = rand::thread_rng().gen_range(100_000..1_000_000);
        let conn = Arc::new(TcpConn::new(key, segment.seq_number, server_seq));
        match self.flows.entry(key) {
            Entry::Occupied(_) => return, // first writer won
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&conn));
            }
        }
        stats::bump(&self.counters.flows_created);
        debug!("tcp {key}: SYN seen, answering with seq={server_seq}");

        let syn_ack = builder::build_tcp_frame(
            &TcpFrameSpec {
                src: key.dst,
                dst: key.src,
                src_port: key.dst_port,
                dst_port: key.src_port,
                flags: TcpFlagBits::SYN | TcpFlagBits::ACK,
                seq: server_seq,
                ack: segment.seq_number.wrapping_add(1),
                options: &builder::mss_option(self.max_mss),
                payload: &[],
            },
            self.max_mss,
        );
        let _ = self.tun.write_frame(&syn_ack);
    }

    fn maybe_complete_handshake(&self, conn: &Arc<TcpConn>, segment: &TcpSegment<'_>) {
        if !segment.flags.contains(TcpFlagBits::ACK)
            || segment.flags.contains(TcpFlagBits::FIN)
            || !segment.payload.is_empty()
        {
            return;
        }
        {
            let mut state = conn.state.lock();
            if state.phase != Phase::SynSeen
                || segment.ack_number != state.server_seq.wrapping_add(1)
            {
                return;
            }
            state.phase = Phase::Established;
        }
        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        let job_conn = Arc::clone(conn);
        if !self.init_pool.submit(move || engine.establish_upstream(&job_conn)) {
            warn!("tcp {}: init pool saturated, resetting", conn.key);
            self.reset_and_evict(conn, false);
        }
    }

    /// Runs on the init pool: connect, attach the socket, start the downlink
    /// worker, flush anything the app sent in the meantime.
    fn establish_upstream(&self, conn: &Arc<TcpConn>) {
        if conn.closed_once.load(Ordering::Acquire) || !self.running.load(Ordering::Acquire) {
            return;
        }
        let stream = match self
            .sockets
            .tcp_connect(conn.key.upstream_addr(), CONNECT_TIMEOUT)
        {
            Ok(stream) => stream,
            Err(error) => {
                warn!("tcp {}: upstream connect failed ({error})", conn.key);
                self.reset_and_evict(conn, false);
                return;
            }
        };
        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(error) => {
                warn!("tcp {}: socket clone failed ({error})", conn.key);
                self.reset_and_evict(conn, false);
                return;
            }
        };

        {
            let mut state = conn.state.lock();
            if state.phase != Phase::Established && state.phase != Phase::FinWaitServer {
                return;
            }
            while let Some(payload) = state.pending_uplink.pop_front() {
                state.pending_bytes -= payload.len();
                if let Err(error) = (&stream).write_all(&payload) {
                    drop(state);
                    warn!("tcp {}: buffered uplink write failed ({error})", conn.key);
                    self.reset_and_evict(conn, false);
                    return;
                }
                stats::add(&self.counters.bytes_up, payload.len() as u64);
            }
            if state.client_shutdown {
                let _ = stream.shutdown(Shutdown::Write);
            }
            state.upstream = Some(stream);
        }

        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        let (done_tx, done_rx) = bounded::<()>(0);
        *conn.worker_done.lock() = Some(done_rx);
        let worker_conn = Arc::clone(conn);
        let spawned = thread::Builder::new()
            .name(format!("tcp-downlink-{}", conn.key.dst_port))
            .spawn(move || {
                engine.downlink_loop(&worker_conn, reader);
                drop(done_tx);
            });
        if spawned.is_err() {
            warn!("tcp {}: downlink worker spawn failed", conn.key);
            self.reset_and_evict(conn, false);
        }
    }

    /// Uplink data from the app. Written verbatim when the upstream socket is
    /// attached; buffered (bounded) while the connect is still in flight.
    fn forward_uplink(&self, conn: &Arc<TcpConn>, payload: &[u8]) {
        let mut state = conn.state.lock();
        if let Some(mut stream) = state.upstream.as_ref() {
            if let Err(error) = stream.write_all(payload) {
                drop(state);
                warn!("tcp {}: uplink write failed ({error})", conn.key);
                self.reset_and_evict(conn, false);
                return;
            }
            state.client_bytes_seen += payload.len() as u64;
            stats::add(&self.counters.bytes_up, payload.len() as u64);
            return;
        }
        // connect still pending
        if state.pending_uplink.len() >= MAX_PENDING_PAYLOADS
            || state.pending_bytes + payload.len() > MAX_PENDING_BYTES
        {
            drop(state);
            warn!("tcp {}: pre-connect buffer overrun, resetting", conn.key);
            self.reset_and_evict(conn, false);
            return;
        }
        state.pending_uplink.push_back(payload.to_vec());
        state.pending_bytes += payload.len();
        state.client_bytes_seen += payload.len() as u64;
    }

    /// App FIN in ESTABLISHED: shut the upstream write side only and keep
    /// draining the downlink until the server EOFs.
    fn half_close_from_app(&self, conn: &Arc<TcpConn>) {
        let mut state = conn.state.lock();
        if state.phase != Phase::Established {
            return;
        }
        state.phase = Phase::FinWaitServer;
        match state.upstream.as_ref() {
            Some(stream) => {
                let _ = stream.shutdown(Shutdown::Write);
            }
            None => state.client_shutdown = true,
        }
        debug!("tcp {}: app closed, half-closing upstream", conn.key);
    }

    /// Downlink worker: blocking reads from the upstream socket, one
    /// synthesised PSH+ACK per read, strictly sequence-monotone because
    /// `server_bytes_sent` advances only after the tun write.
    fn downlink_loop(&self, conn: &Arc<TcpConn>, mut upstream: TcpStream) {
        let mut buf = vec![0u8; DOWNLINK_BUFFER_SIZE];
        loop {
            match upstream.read(&mut buf) {
                Ok(0) => {
                    self.handle_server_eof(conn);
                    break;
                }
                Ok(read) => {
                    let mut state = conn.state.lock();
                    if !matches!(state.phase, Phase::Established | Phase::FinWaitServer) {
                        break;
                    }
                    let frame = self.downlink_frame(
                        &conn,
                        &state,
                        TcpFlagBits::PSH | TcpFlagBits::ACK,
                        &buf[..read],
                    );
                    if self.tun.write_frame(&frame).is_ok() {
                        state.server_bytes_sent += read as u64;
                        stats::add(&self.counters.bytes_down, read as u64);
                    }
                }
                Err(error) => {
                    if !conn.closed_once.load(Ordering::Acquire) {
                        warn!("tcp {}: upstream read failed ({error})", conn.key);
                        self.reset_and_evict(conn, true);
                    }
                    break;
                }
            }
        }
    }

    /// Server-side EOF: emit FIN+ACK and either wait for the app (server
    /// closed first) or finish the teardown (app had already closed).
    fn handle_server_eof(&self, conn: &Arc<TcpConn>) {
        if conn.closed_once.load(Ordering::Acquire) {
            return;
        }
        let mut state = conn.state.lock();
        match state.phase {
            Phase::Established => {
                let frame = self.downlink_frame(conn, &state, TcpFlagBits::FIN | TcpFlagBits::ACK, &[]);
                let _ = self.tun.write_frame(&frame);
                state.server_bytes_sent += 1; // the FIN consumes one sequence number
                state.phase = Phase::FinWaitApp;
                debug!("tcp {}: server closed, FIN sent to app", conn.key);
            }
            Phase::FinWaitServer => {
                let frame = self.downlink_frame(conn, &state, TcpFlagBits::FIN | TcpFlagBits::ACK, &[]);
                let _ = self.tun.write_frame(&frame);
                state.server_bytes_sent += 1;
                state.phase = Phase::Closed;
                drop(state);
                self.evict(conn, true);
            }
            _ => {}
        }
    }

    fn downlink_frame(
        &self,
        conn: &TcpConn,
        state: &MutexGuard<'_, ConnState>,
        flags: TcpFlagBits,
        payload: &[u8],
    ) -> Vec<u8> {
        builder::build_tcp_frame(
            &TcpFrameSpec {
                src: conn.key.dst,
                dst: conn.key.src,
                src_port: conn.key.dst_port,
                dst_port: conn.key.src_port,
                flags,
                seq: state
                    .server_seq
                    .wrapping_add(1)
                    .wrapping_add(state.server_bytes_sent as u32),
                ack: state
                    .client_seq
                    .wrapping_add(1)
                    .wrapping_add(state.client_bytes_seen as u32),
                options: &[],
                payload,
            },
            self.max_mss,
        )
    }

    /// Synthesise RST+ACK toward the app, then tear the connection down.
    fn reset_and_evict(&self, conn: &Arc<TcpConn>, from_worker: bool) {
        if !conn.closed_once.load(Ordering::Acquire) {
            let frame = {
                let mut state = conn.state.lock();
                state.phase = Phase::Reset;
                self.downlink_frame(conn, &state, TcpFlagBits::RST | TcpFlagBits::ACK, &[])
            };
            let _ = self.tun.write_frame(&frame);
        }
        self.evict(conn, from_worker);
    }

    /// Idempotent teardown: stops the downlink worker, closes the upstream
    /// socket exactly once, removes the flow. Safe to call from any thread.
    pub(crate) fn evict(&self, conn: &Arc<TcpConn>, from_worker: bool) {
        if conn.closed_once.swap(true, Ordering::AcqRel) {
            return;
        }
        let upstream = {
            let mut state = conn.state.lock();
            if state.phase != Phase::Reset {
                state.phase = Phase::Closed;
            }
            state.pending_uplink.clear();
            state.pending_bytes = 0;
            state.upstream.take()
        };
        if let Some(stream) = upstream {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if !from_worker {
            if let Some(done) = conn.worker_done.lock().take() {
                let _ = done.recv_timeout(WORKER_JOIN_TIMEOUT);
            }
        }
        self.flows.remove(&conn.key);
        stats::bump(&self.counters.flows_closed);
        debug!("tcp {}: evicted", conn.key);
    }

    /// Shutdown path: evict every live connection.
    pub(crate) fn evict_all(&self) {
        let conns: Vec<Arc<TcpConn>> = self
            .flows
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in conns {
            self.evict(&conn, false);
        }
    }
}
