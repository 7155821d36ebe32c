//! External collaborator interfaces.
//!
//! The engine never acquires VPN privileges, allocates the virtual interface,
//! or protects sockets itself; the embedding host supplies those behaviours
//! through the traits below. Sockets returned by the factory must bypass the
//! tun (the host's "protect" mechanism), otherwise forwarded traffic loops
//! back into the reader.

use crate::flows::FlowTuple;
use std::io::{self, Read, Write};
use std::net::{SocketAddrV4, TcpStream, UdpSocket};
use std::time::Duration;

/// Opens protected kernel sockets on behalf of the engine.
pub trait SocketFactory: Send + Sync {
    /// Open a stream socket connected to `dest`, blocking up to `timeout`.
    fn tcp_connect(&self, dest: SocketAddrV4, timeout: Duration) -> io::Result<TcpStream>;

    /// Open an unconnected datagram socket.
    fn udp_socket(&self) -> io::Result<UdpSocket>;
}

/// Maps a 5-tuple to the local process identity that owns it.
///
/// Best-effort: `None` means unknown and is expected to be frequent. The
/// lookup must not block the data plane beyond a bounded budget.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, tuple: &FlowTuple) -> Option<u32>;
}

/// Blocking source of whole IP datagrams read from the virtual interface.
///
/// A return of `Ok(0)` means the interface was closed.
pub trait TunReader: Send {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Blocking sink of whole IP datagrams written back to the virtual interface.
pub trait TunWriter: Send {
    fn write_packet(&mut self, frame: &[u8]) -> io::Result<()>;
}

impl<R: Read + Send> TunReader for R {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

impl<W: Write + Send> TunWriter for W {
    fn write_packet(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_all(frame)?;
        self.flush()
    }
}

/// Default upstream connect budget.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive timeout on forwarded UDP sockets so workers can observe shutdown.
pub const UDP_RECV_TIMEOUT: Duration = Duration::from_secs(5);
