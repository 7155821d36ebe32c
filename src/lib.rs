//! User-space packet interception core for TUN-based traffic control.
//!
//! The engine consumes whole IP datagrams from a virtual point-to-point
//! interface, terminates each TCP flow against a protected kernel socket,
//! forwards UDP as pseudo-flows with an idle expiry, passively inspects DNS
//! to enrich policy with domain names, and applies one ALLOW/BLOCK decision
//! per flow. Privilege acquisition, interface allocation, socket protection,
//! and process-identity lookup stay on the host side, behind the traits in
//! [`host`].

mod config;
mod device;
pub mod dns;
mod error;
pub mod flows;
pub mod host;
pub mod policy;
mod stats;

pub use config::{TunConfig, DEFAULT_MTU};
pub use error::EngineError;
pub use flows::{FlowKey, FlowTuple, Protocol};
pub use host::{IdentityResolver, SocketFactory, TunReader, TunWriter};
pub use policy::{Decision, PolicyEngine};
pub use stats::{FlowSnapshot, StatsSnapshot};

use crate::device::TunSink;
use crate::dns::DomainCache;
use crate::flows::tcp::TcpEngine;
use crate::flows::udp::UdpForwarder;
use crate::flows::InitPool;
use crate::stats::{FlowCounters, TunCounters};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifecycle controller: owns the tun descriptor and wires the pipeline.
pub struct Engine {
    config: TunConfig,
    sockets: Arc<dyn SocketFactory>,
    policy: Arc<PolicyEngine>,
    cache: Arc<DomainCache>,
    running: Arc<AtomicBool>,
    tun_counters: Arc<TunCounters>,
    tcp_counters: Arc<FlowCounters>,
    udp_counters: Arc<FlowCounters>,
    pipeline: Mutex<Option<Pipeline>>,
}

/// Live data-plane state between `start` and `stop`.
struct Pipeline {
    tcp: Arc<TcpEngine>,
    udp: Arc<UdpForwarder>,
    init_pool: Arc<InitPool>,
    reader_done: Receiver<()>,
    reader_thread: JoinHandle<()>,
    sweeper_stop: Sender<()>,
    sweeper_thread: JoinHandle<()>,
}

impl Engine {
    pub fn new(
        config: TunConfig,
        sockets: Arc<dyn SocketFactory>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            config,
            sockets,
            policy: Arc::new(PolicyEngine::new(resolver)),
            cache: Arc::new(DomainCache::new()),
            running: Arc::new(AtomicBool::new(false)),
            tun_counters: Arc::new(TunCounters::default()),
            tcp_counters: Arc::new(FlowCounters::default()),
            udp_counters: Arc::new(FlowCounters::default()),
            pipeline: Mutex::new(None),
        }
    }

    /// Start the pipeline over an opened tun descriptor.
    pub fn start(
        &self,
        reader: Box<dyn TunReader>,
        writer: Box<dyn TunWriter>,
    ) -> anyhow::Result<()> {
        let mut slot = self.pipeline.lock();
        if slot.is_some() {
            return Err(EngineError::AlreadyRunning.into());
        }
        self.running.store(true, Ordering::Release);

        let tun = Arc::new(TunSink::new(writer, Arc::clone(&self.tun_counters)));
        let init_pool = Arc::new(InitPool::new());
        let tcp = TcpEngine::new(
            Arc::clone(&self.sockets),
            Arc::clone(&self.policy),
            Arc::clone(&self.cache),
            Arc::clone(&tun),
            Arc::clone(&init_pool),
            Arc::clone(&self.running),
            Arc::clone(&self.tcp_counters),
            self.config.effective_mss(),
        );
        let udp = UdpForwarder::new(
            Arc::clone(&self.sockets),
            Arc::clone(&self.policy),
            Arc::clone(&self.cache),
            Arc::clone(&tun),
            Arc::clone(&self.running),
            Arc::clone(&self.udp_counters),
        );

        let (reader_done_tx, reader_done) = bounded::<()>(0);
        let reader_thread = thread::Builder::new()
            .name("tun-reader".to_string())
            .spawn({
                let running = Arc::clone(&self.running);
                let tcp = Arc::clone(&tcp);
                let udp = Arc::clone(&udp);
                let counters = Arc::clone(&self.tun_counters);
                move || device::run_reader_loop(reader, running, tcp, udp, counters, reader_done_tx)
            })
            .map_err(EngineError::Tun)?;

        let (sweeper_stop, sweeper_stop_rx) = bounded::<()>(1);
        let sweeper = thread::Builder::new()
            .name("udp-sweeper".to_string())
            .spawn({
                let udp = Arc::clone(&udp);
                let cache = Arc::clone(&self.cache);
                move || loop {
                    match sweeper_stop_rx.recv_timeout(SWEEP_INTERVAL) {
                        Err(RecvTimeoutError::Timeout) => {
                            udp.sweep_idle(Instant::now());
                            cache.cleanup();
                        }
                        _ => break,
                    }
                }
            });
        let sweeper_thread = match sweeper {
            Ok(handle) => handle,
            Err(error) => {
                // tear down the half-started pipeline before surfacing
                self.running.store(false, Ordering::Release);
                let _ = reader_done.recv_timeout(READER_JOIN_TIMEOUT);
                return Err(EngineError::Tun(error).into());
            }
        };

        info!(
            "engine started (mtu={}, dns_servers={})",
            self.config.effective_mtu(),
            self.config.dns_servers.len()
        );
        *slot = Some(Pipeline {
            tcp,
            udp,
            init_pool,
            reader_done,
            reader_thread,
            sweeper_stop,
            sweeper_thread,
        });
        Ok(())
    }

    /// Stop the pipeline: evict every flow, then wind down the workers.
    /// Idempotent; a second call is a no-op.
    pub fn stop(&self) {
        let Some(pipeline) = self.pipeline.lock().take() else {
            return;
        };
        debug!("engine stop requested");
        self.running.store(false, Ordering::Release);

        pipeline.tcp.evict_all();
        pipeline.udp.close_all();
        pipeline.init_pool.shutdown();

        let _ = pipeline.sweeper_stop.send(());
        if pipeline.sweeper_thread.join().is_err() {
            warn!("sweeper thread exited with a panic");
        }

        // The reader may be parked in a blocking read; wait a bounded
        // interval and detach if the host has not closed the descriptor yet.
        match pipeline.reader_done.recv_timeout(READER_JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if pipeline.reader_thread.join().is_err() {
                    warn!("tun reader thread exited with a panic");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("tun reader did not exit within {READER_JOIN_TIMEOUT:?}, detaching");
            }
        }
        info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &TunConfig {
        &self.config
    }

    /// Operator-facing policy handle; rule mutations apply to new flows only.
    pub fn policy(&self) -> Arc<PolicyEngine> {
        Arc::clone(&self.policy)
    }

    /// The passive DNS cache (exposed for inspection and diagnostics).
    pub fn domain_cache(&self) -> Arc<DomainCache> {
        Arc::clone(&self.cache)
    }

    /// Point-in-time statistics; never blocks the data plane.
    pub fn statistics(&self) -> StatsSnapshot {
        let (tcp_active, udp_active) = match self.pipeline.lock().as_ref() {
            Some(pipeline) => (
                pipeline.tcp.active_flows() as u64,
                pipeline.udp.active_flows() as u64,
            ),
            None => (0, 0),
        };
        StatsSnapshot {
            packets: stats::get(&self.tun_counters.packets),
            bytes: stats::get(&self.tun_counters.bytes),
            dropped: stats::get(&self.tun_counters.dropped),
            malformed: stats::get(&self.tun_counters.malformed),
            read_errors: stats::get(&self.tun_counters.read_errors),
            write_failures: stats::get(&self.tun_counters.write_failures),
            tcp: self.tcp_counters.snapshot(tcp_active),
            udp: self.udp_counters.snapshot(udp_active),
            dns_queries: self.cache.queries_seen(),
            dns_responses: self.cache.responses_seen(),
            cache_size: self.cache.len() as u64,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}
