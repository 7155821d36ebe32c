//! Flow identity types and the shared flow-initialisation pool.

pub(crate) mod builder;
pub(crate) mod checksum;
pub(crate) mod tcp;
pub(crate) mod udp;

use crate::device::{TcpSegment, UdpDatagram};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Threads servicing upstream connects so the tun reader never blocks on one.
const INIT_POOL_THREADS: usize = 4;
/// Queued initialisation jobs beyond which admission fails closed.
const INIT_POOL_DEPTH: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Application-side 4-tuple identifying a flow. Immutable for the flow's
/// lifetime; equality and hashing use all four fields.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FlowKey {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowKey {
    pub(crate) fn from_tcp(segment: &TcpSegment<'_>) -> Self {
        Self {
            src: segment.src,
            src_port: segment.src_port,
            dst: segment.dst,
            dst_port: segment.dst_port,
        }
    }

    pub(crate) fn from_udp(datagram: &UdpDatagram<'_>) -> Self {
        Self {
            src: datagram.src,
            src_port: datagram.src_port,
            dst: datagram.dst,
            dst_port: datagram.dst_port,
        }
    }

    pub fn tuple(&self, protocol: Protocol) -> FlowTuple {
        FlowTuple {
            protocol,
            key: *self,
        }
    }

    pub(crate) fn upstream_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.dst, self.dst_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

/// The 5-tuple handed to the identity resolver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FlowTuple {
    pub protocol: Protocol,
    pub key: FlowKey,
}

type Job = Box<dyn FnOnce() + Send>;

/// Bounded pool running flow-initialisation work (upstream connect plus
/// whatever follows it) off the packet path.
pub(crate) struct InitPool {
    jobs: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InitPool {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = bounded::<Job>(INIT_POOL_DEPTH);
        let mut workers = Vec::with_capacity(INIT_POOL_THREADS);
        for index in 0..INIT_POOL_THREADS {
            let receiver: Receiver<Job> = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("flow-init-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(error) => warn!("flow init worker {index} failed to spawn ({error})"),
            }
        }
        Self {
            jobs: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job; `false` means the pool is saturated or shut down and the
    /// caller must fail the flow instead.
    pub(crate) fn submit<F: FnOnce() + Send + 'static>(&self, job: F) -> bool {
        let guard = self.jobs.lock();
        match guard.as_ref() {
            Some(sender) => sender.try_send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Stop accepting jobs, drain the queue, and join the workers.
    pub(crate) fn shutdown(&self) {
        let sender = self.jobs.lock().take();
        drop(sender);
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                debug!("flow init worker exited with a panic");
            }
        }
    }
}

impl Drop for InitPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
