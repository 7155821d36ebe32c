//! UDP pseudo-flow forwarder with passive DNS observation.

use super::{builder, FlowKey, Protocol};
use crate::device::{TunSink, UdpDatagram, READ_BUFFER_SIZE};
use crate::dns::{self, DomainCache};
use crate::host::{SocketFactory, UDP_RECV_TIMEOUT};
use crate::policy::{Decision, PolicyEngine};
use crate::stats::{self, FlowCounters};
use crossbeam_channel::{bounded, Receiver};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A pseudo-flow is torn down after this much silence in either direction.
pub(crate) const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_millis(250);
const DNS_PORT: u16 = 53;

struct UdpFlow {
    key: FlowKey,
    socket: Arc<UdpSocket>,
    last_activity: Mutex<Instant>,
    active: AtomicBool,
    worker_done: Mutex<Option<Receiver<()>>>,
}

impl UdpFlow {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }
}

pub(crate) struct UdpForwarder {
    flows: DashMap<FlowKey, Arc<UdpFlow>, FxBuildHasher>,
    sockets: Arc<dyn SocketFactory>,
    policy: Arc<PolicyEngine>,
    cache: Arc<DomainCache>,
    tun: Arc<TunSink>,
    running: Arc<AtomicBool>,
    pub(crate) counters: Arc<FlowCounters>,
    weak_self: Weak<UdpForwarder>,
}

impl UdpForwarder {
    pub(crate) fn new(
        sockets: Arc<dyn SocketFactory>,
        policy: Arc<PolicyEngine>,
        cache: Arc<DomainCache>,
        tun: Arc<TunSink>,
        running: Arc<AtomicBool>,
        counters: Arc<FlowCounters>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            flows: DashMap::with_hasher(FxBuildHasher),
            sockets,
            policy,
            cache,
            tun,
            running,
            counters,
            weak_self: weak.clone(),
        })
    }

    pub(crate) fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Per-datagram dispatch from the tun reader thread.
    pub(crate) fn process_packet(&self, datagram: &UdpDatagram<'_>) {
        self.observe_dns(datagram);

        let key = FlowKey::from_udp(datagram);
        let flow = match self.flows.get(&key).map(|entry| Arc::clone(entry.value())) {
            Some(flow) => flow,
            None => match self.admit_flow(key) {
                Some(flow) => flow,
                None => return, // blocked, or socket setup failed
            },
        };

        if datagram.payload.is_empty() {
            flow.touch();
            return;
        }
        match flow.socket.send_to(datagram.payload, key.upstream_addr()) {
            Ok(sent) => {
                flow.touch();
                stats::add(&self.counters.bytes_up, sent as u64);
            }
            Err(error) => {
                warn!("udp {key}: upstream send failed ({error})");
                self.close_flow(&flow, false);
            }
        }
    }

    /// Passive DNS inspection; never alters forwarding.
    fn observe_dns(&self, datagram: &UdpDatagram<'_>) {
        if datagram.dst_port == DNS_PORT && dns::parse_query(datagram.payload).is_some() {
            self.cache.record_query();
        }
        if datagram.src_port == DNS_PORT {
            self.record_response(datagram.payload);
        }
    }

    fn record_response(&self, payload: &[u8]) {
        let Some(response) = dns::parse_response(payload) else {
            return;
        };
        self.cache.record_response();
        for answer in &response.answers {
            if let Some(address) = answer.address {
                debug!("dns: {} -> {} (ttl={})", answer.name, address, answer.ttl);
                self.cache.put(address, &answer.name, answer.ttl);
            }
        }
    }

    /// One policy decision, then a protected socket and its receive worker.
    /// Returns `None` when the flow is blocked or cannot be set up.
    fn admit_flow(&self, key: FlowKey) -> Option<Arc<UdpFlow>> {
        let domain = self.cache.get(&key.dst.into());
        let decision = self.policy.evaluate(&key.tuple(Protocol::Udp), domain.as_deref());
        if decision == Decision::Block {
            stats::bump(&self.counters.flows_blocked);
            debug!(
                "udp {key}: blocked by policy (domain={})",
                domain.as_deref().unwrap_or("-")
            );
            return None;
        }

        let socket = match self.open_socket() {
            Ok(socket) => Arc::new(socket),
            Err(error) => {
                warn!("udp {key}: socket setup failed ({error})");
                return None;
            }
        };
        let flow = Arc::new(UdpFlow {
            key,
            socket,
            last_activity: Mutex::new(Instant::now()),
            active: AtomicBool::new(true),
            worker_done: Mutex::new(None),
        });

        match self.flows.entry(key) {
            // first writer wins; our socket is released on drop
            Entry::Occupied(existing) => return Some(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&flow));
            }
        }
        stats::bump(&self.counters.flows_created);
        debug!("udp {key}: flow admitted");

        let Some(forwarder) = self.weak_self.upgrade() else {
            self.close_flow(&flow, false);
            return None;
        };
        let (done_tx, done_rx) = bounded::<()>(0);
        *flow.worker_done.lock() = Some(done_rx);
        let worker_flow = Arc::clone(&flow);
        let spawned = thread::Builder::new()
            .name(format!("udp-recv-{}", key.dst_port))
            .spawn(move || {
                forwarder.receive_loop(&worker_flow);
                drop(done_tx);
            });
        if spawned.is_err() {
            warn!("udp {key}: receive worker spawn failed");
            self.close_flow(&flow, false);
            return None;
        }
        Some(flow)
    }

    fn open_socket(&self) -> io::Result<UdpSocket> {
        let socket = self.sockets.udp_socket()?;
        socket.set_read_timeout(Some(UDP_RECV_TIMEOUT))?;
        Ok(socket)
    }

    /// Per-flow receive worker: every upstream datagram becomes a synthesised
    /// packet with swapped endpoints, written under the tun lock.
    fn receive_loop(&self, flow: &Arc<UdpFlow>) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        while self.running.load(Ordering::Acquire) && flow.active.load(Ordering::Acquire) {
            let received = match flow.socket.recv_from(&mut buf) {
                Ok((received, _peer)) => received,
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(error) => {
                    if flow.active.load(Ordering::Acquire) {
                        warn!("udp {}: upstream receive failed ({error})", flow.key);
                        self.close_flow(flow, true);
                    }
                    break;
                }
            };
            if flow.key.dst_port == DNS_PORT {
                self.record_response(&buf[..received]);
            }
            let frame = builder::build_udp_frame(
                flow.key.dst,
                flow.key.src,
                flow.key.dst_port,
                flow.key.src_port,
                &buf[..received],
            );
            if self.tun.write_frame(&frame).is_ok() {
                stats::add(&self.counters.bytes_down, received as u64);
            }
            flow.touch();
        }
    }

    /// Close flows idle for [`UDP_IDLE_TIMEOUT`] or longer. Called from the
    /// periodic sweeper thread.
    pub(crate) fn sweep_idle(&self, now: Instant) {
        let idle: Vec<Arc<UdpFlow>> = self
            .flows
            .iter()
            .filter(|entry| entry.value().idle_for(now) >= UDP_IDLE_TIMEOUT)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for flow in idle {
            debug!("udp {}: idle timeout", flow.key);
            self.close_flow(&flow, false);
        }
    }

    /// Idempotent closure: mark inactive, drop from the table, wait briefly
    /// for the worker. The socket closes when its last owner exits.
    fn close_flow(&self, flow: &Arc<UdpFlow>, from_worker: bool) {
        if !flow.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.flows.remove(&flow.key);
        if !from_worker {
            if let Some(done) = flow.worker_done.lock().take() {
                let _ = done.recv_timeout(WORKER_JOIN_TIMEOUT);
            }
        }
        stats::bump(&self.counters.flows_closed);
        debug!("udp {}: closed", flow.key);
    }

    /// Shutdown path: close every live pseudo-flow.
    pub(crate) fn close_all(&self) {
        let flows: Vec<Arc<UdpFlow>> = self
            .flows
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for flow in flows {
            self.close_flow(&flow, false);
        }
    }
}
