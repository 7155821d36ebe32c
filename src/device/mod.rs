//! Frame parsing, classification, and the shared tun write path.
//!
//! The reader loop runs on its own blocking thread and hands parsed frames to
//! the TCP engine or UDP forwarder synchronously; everything written back to
//! the app goes through [`TunSink`], which serialises whole frames under a
//! single lock.

use crate::flows::tcp::TcpEngine;
use crate::flows::udp::UdpForwarder;
use crate::host::{TunReader, TunWriter};
use crate::stats::{self, TunCounters};
use bitflags::bitflags;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Whole-datagram read buffer; the tun never hands us partial frames.
pub(crate) const READ_BUFFER_SIZE: usize = 2048;

const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Detailed reasons a frame failed to parse. Callers drop the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty packet")]
    EmptyPacket,
    #[error("unsupported IP version {0}")]
    UnsupportedIpVersion(u8),
    #[error("malformed IPv4 header")]
    MalformedIpv4Header,
    #[error("malformed TCP segment")]
    MalformedTcpSegment,
    #[error("malformed UDP datagram")]
    MalformedUdpDatagram,
}

bitflags! {
    /// The low five TCP flag bits carried in header byte 13.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TcpFlagBits: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPacket<'a> {
    Tcp(TcpSegment<'a>),
    Udp(UdpDatagram<'a>),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlagBits,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Parse an IPv4 frame into its TCP or UDP view.
///
/// IPv6 frames classify as `Other` (tolerated, never forwarded). Any
/// out-of-bounds condition is a hard parse failure.
pub fn parse_packet(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.is_empty() {
        return Err(ParseError::EmptyPacket);
    }
    let version = packet[0] >> 4;
    match version {
        4 => parse_ipv4(packet),
        6 => Ok(ParsedPacket::Other),
        _ => Err(ParseError::UnsupportedIpVersion(version)),
    }
}

fn parse_ipv4(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.len() < 20 {
        return Err(ParseError::MalformedIpv4Header);
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < 20 || header_len > packet.len() {
        return Err(ParseError::MalformedIpv4Header);
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len < header_len || total_len > packet.len() {
        return Err(ParseError::MalformedIpv4Header);
    }
    let protocol = packet[9];
    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let l4 = &packet[header_len..total_len];
    match protocol {
        6 => parse_tcp(src, dst, l4),
        17 => parse_udp(src, dst, l4),
        _ => Ok(ParsedPacket::Other),
    }
}

fn parse_tcp<'a>(src: Ipv4Addr, dst: Ipv4Addr, l4: &'a [u8]) -> Result<ParsedPacket<'a>, ParseError> {
    if l4.len() < 20 {
        return Err(ParseError::MalformedTcpSegment);
    }
    let src_port = u16::from_be_bytes([l4[0], l4[1]]);
    let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
    let seq_number = u32::from_be_bytes([l4[4], l4[5], l4[6], l4[7]]);
    let ack_number = u32::from_be_bytes([l4[8], l4[9], l4[10], l4[11]]);
    let data_offset = usize::from(l4[12] >> 4) * 4;
    if data_offset < 20 || data_offset > l4.len() {
        return Err(ParseError::MalformedTcpSegment);
    }
    let flags = TcpFlagBits::from_bits_truncate(l4[13]);
    Ok(ParsedPacket::Tcp(TcpSegment {
        src,
        dst,
        src_port,
        dst_port,
        seq_number,
        ack_number,
        flags,
        payload: &l4[data_offset..],
    }))
}

fn parse_udp<'a>(src: Ipv4Addr, dst: Ipv4Addr, l4: &'a [u8]) -> Result<ParsedPacket<'a>, ParseError> {
    if l4.len() < 8 {
        return Err(ParseError::MalformedUdpDatagram);
    }
    let src_port = u16::from_be_bytes([l4[0], l4[1]]);
    let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
    let length = u16::from_be_bytes([l4[4], l4[5]]) as usize;
    if length < 8 || length > l4.len() {
        return Err(ParseError::MalformedUdpDatagram);
    }
    Ok(ParsedPacket::Udp(UdpDatagram {
        src,
        dst,
        src_port,
        dst_port,
        payload: &l4[8..length],
    }))
}

/// Serialised writer over the tun descriptor.
///
/// Every worker that synthesises a frame goes through here; holders write
/// exactly one whole frame per lock acquisition, so parallel connections
/// never interleave within a frame.
pub(crate) struct TunSink {
    writer: Mutex<Box<dyn TunWriter>>,
    counters: Arc<TunCounters>,
}

impl TunSink {
    pub(crate) fn new(writer: Box<dyn TunWriter>, counters: Arc<TunCounters>) -> Self {
        Self {
            writer: Mutex::new(writer),
            counters,
        }
    }

    pub(crate) fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock();
        match guard.write_packet(frame) {
            Ok(()) => Ok(()),
            Err(error) => {
                stats::bump(&self.counters.write_failures);
                warn!("TunSink: write failed ({error})");
                Err(error)
            }
        }
    }
}

/// Blocking read loop over the tun descriptor.
///
/// Exits when the running flag clears, the interface reports closure, or ten
/// consecutive read errors accumulate. `done` is dropped on exit so the
/// controller can bound its join.
pub(crate) fn run_reader_loop(
    mut reader: Box<dyn TunReader>,
    running: Arc<AtomicBool>,
    tcp: Arc<TcpEngine>,
    udp: Arc<UdpForwarder>,
    counters: Arc<TunCounters>,
    done: Sender<()>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut consecutive_errors = 0u32;
    while running.load(Ordering::Acquire) {
        let read = match reader.read_packet(&mut buf) {
            Ok(0) => {
                debug!("tun reader: interface closed");
                break;
            }
            Ok(read) => {
                consecutive_errors = 0;
                read
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                stats::bump(&counters.read_errors);
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    warn!("tun reader: aborting after {consecutive_errors} consecutive errors ({error})");
                    break;
                }
                thread::sleep(READ_ERROR_BACKOFF);
                continue;
            }
        };

        stats::bump(&counters.packets);
        stats::add(&counters.bytes, read as u64);

        match parse_packet(&buf[..read]) {
            Ok(ParsedPacket::Tcp(segment)) => tcp.process_packet(&segment),
            Ok(ParsedPacket::Udp(datagram)) => udp.process_packet(&datagram),
            Ok(ParsedPacket::Other) => stats::bump(&counters.dropped),
            Err(error) => {
                stats::bump(&counters.malformed);
                debug!("tun reader: dropped frame (len={read}, {error})");
            }
        }
    }
    drop(done);
}

#[cfg(test)]
mod tests;
