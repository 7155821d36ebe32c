//! Synthesis of IPv4+TCP and IPv4+UDP frames written back to the app.

use super::checksum;
use crate::device::{TcpFlagBits, TcpSegment};
use std::net::Ipv4Addr;

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Static receive window advertised on every synthesised segment. The engine
/// never shrinks it; loss and pacing are the kernel stack's problem on the
/// real network side.
const RECEIVE_WINDOW: u16 = 8192;

const IP_FLAG_DF: u16 = 0x4000;

pub(crate) struct TcpFrameSpec<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: TcpFlagBits,
    pub seq: u32,
    pub ack: u32,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

/// The MSS option for a SYN+ACK: kind 2, length 4, 16-bit value.
pub(crate) fn mss_option(mss: u16) -> [u8; 4] {
    let value = mss.to_be_bytes();
    [2, 4, value[0], value[1]]
}

/// Build a checksummed IPv4+TCP frame.
///
/// When SYN is set, any MSS option in `spec.options` is rewritten so its
/// value never exceeds `max_mss`. Options are padded to a 4-byte multiple.
pub(crate) fn build_tcp_frame(spec: &TcpFrameSpec<'_>, max_mss: u16) -> Vec<u8> {
    let mut options = spec.options.to_vec();
    if spec.flags.contains(TcpFlagBits::SYN) {
        clamp_mss_option(&mut options, max_mss);
    }
    while options.len() % 4 != 0 {
        options.push(0);
    }

    let tcp_len = TCP_HEADER_LEN + options.len() + spec.payload.len();
    let total_len = IPV4_HEADER_LEN + tcp_len;
    let mut buffer = vec![0u8; total_len];

    write_ipv4_header(&mut buffer, spec.src, spec.dst, 6, total_len);

    let offset = IPV4_HEADER_LEN;
    buffer[offset..offset + 2].copy_from_slice(&spec.src_port.to_be_bytes());
    buffer[offset + 2..offset + 4].copy_from_slice(&spec.dst_port.to_be_bytes());
    buffer[offset + 4..offset + 8].copy_from_slice(&spec.seq.to_be_bytes());
    buffer[offset + 8..offset + 12].copy_from_slice(&spec.ack.to_be_bytes());
    let data_offset_words = ((TCP_HEADER_LEN + options.len()) / 4) as u8;
    buffer[offset + 12] = data_offset_words << 4;
    buffer[offset + 13] = spec.flags.bits();
    buffer[offset + 14..offset + 16].copy_from_slice(&RECEIVE_WINDOW.to_be_bytes());
    // checksum placeholder at offset+16, urgent pointer stays zero
    buffer[offset + 20..offset + 20 + options.len()].copy_from_slice(&options);
    buffer[offset + 20 + options.len()..].copy_from_slice(spec.payload);

    let tcp_checksum = checksum::tcp_ipv4(spec.src, spec.dst, &buffer[offset..]);
    buffer[offset + 16..offset + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
    buffer
}

/// Build a checksummed IPv4+UDP frame.
pub(crate) fn build_udp_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];

    write_ipv4_header(&mut buffer, src, dst, 17, total_len);

    let offset = IPV4_HEADER_LEN;
    buffer[offset..offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[offset + 2..offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[offset + 4..offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[offset + UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_checksum = checksum::udp_ipv4(src, dst, &buffer[offset..]);
    buffer[offset + 6..offset + 8].copy_from_slice(&udp_checksum.to_be_bytes());
    buffer
}

/// Derive a RST+ACK answering an offending segment that never had (or no
/// longer has) a connection: seq echoes the peer's ack when present, and the
/// ack covers the segment's sequence space including SYN/FIN.
pub(crate) fn reset_for_segment(segment: &TcpSegment<'_>) -> Vec<u8> {
    let seq = if segment.flags.contains(TcpFlagBits::ACK) {
        segment.ack_number
    } else {
        0
    };
    let ack = (segment.payload.len() as u32)
        .wrapping_add(segment.seq_number)
        .wrapping_add(u32::from(segment.flags.contains(TcpFlagBits::SYN)))
        .wrapping_add(u32::from(segment.flags.contains(TcpFlagBits::FIN)));
    build_tcp_frame(
        &TcpFrameSpec {
            src: segment.dst,
            dst: segment.src,
            src_port: segment.dst_port,
            dst_port: segment.src_port,
            flags: TcpFlagBits::RST | TcpFlagBits::ACK,
            seq,
            ack,
            options: &[],
            payload: &[],
        },
        u16::MAX,
    )
}

fn write_ipv4_header(buffer: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, total_len: usize) {
    buffer[0] = 0x45; // version 4, IHL 5
    buffer[1] = 0;
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    buffer[6..8].copy_from_slice(&IP_FLAG_DF.to_be_bytes());
    buffer[8] = 64; // TTL
    buffer[9] = protocol;
    buffer[12..16].copy_from_slice(&src.octets());
    buffer[16..20].copy_from_slice(&dst.octets());
    let ip_cksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
}

fn clamp_mss_option(options: &mut [u8], max_mss: u16) {
    let mut index = 0;
    while index < options.len() {
        match options[index] {
            0 => break,    // end of option list
            1 => index += 1, // no-op
            kind => {
                if index + 1 >= options.len() {
                    break;
                }
                let len = options[index + 1] as usize;
                if len < 2 || index + len > options.len() {
                    break;
                }
                if kind == 2 && len == 4 {
                    let value = u16::from_be_bytes([options[index + 2], options[index + 3]]);
                    if value > max_mss {
                        options[index + 2..index + 4].copy_from_slice(&max_mss.to_be_bytes());
                    }
                }
                index += len;
            }
        }
    }
}
