use super::*;
use crate::stats::TunCounters;
use std::io::{self, Write};

fn ipv4_frame(protocol: u8, l4: &[u8]) -> Vec<u8> {
    let total_len = 20 + l4.len();
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2] = (total_len >> 8) as u8;
    packet[3] = (total_len & 0xFF) as u8;
    packet[8] = 64;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&[10, 0, 0, 2]);
    packet[16..20].copy_from_slice(&[93, 184, 216, 34]);
    packet[20..].copy_from_slice(l4);
    packet
}

fn tcp_l4(flags: u8, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    let mut l4 = vec![0u8; 20 + payload.len()];
    l4[0..2].copy_from_slice(&44321u16.to_be_bytes());
    l4[2..4].copy_from_slice(&443u16.to_be_bytes());
    l4[4..8].copy_from_slice(&seq.to_be_bytes());
    l4[8..12].copy_from_slice(&ack.to_be_bytes());
    l4[12] = 5 << 4;
    l4[13] = flags;
    l4[14..16].copy_from_slice(&8192u16.to_be_bytes());
    l4[20..].copy_from_slice(payload);
    l4
}

fn udp_l4(payload: &[u8]) -> Vec<u8> {
    let mut l4 = vec![0u8; 8 + payload.len()];
    l4[0..2].copy_from_slice(&5353u16.to_be_bytes());
    l4[2..4].copy_from_slice(&53u16.to_be_bytes());
    l4[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    l4[8..].copy_from_slice(payload);
    l4
}

#[test]
fn tcp_segment_fields_are_extracted() {
    let payload = b"GET / HTTP/1.0\r\n\r\n";
    let frame = ipv4_frame(6, &tcp_l4(0x18, 1000, 2000, payload));
    let parsed = parse_packet(&frame).expect("frame should parse");
    let ParsedPacket::Tcp(segment) = parsed else {
        panic!("expected a TCP segment");
    };
    assert_eq!(segment.src, Ipv4Addr::new(10, 0, 0, 2));
    assert_eq!(segment.dst, Ipv4Addr::new(93, 184, 216, 34));
    assert_eq!(segment.src_port, 44321);
    assert_eq!(segment.dst_port, 443);
    assert_eq!(segment.seq_number, 1000);
    assert_eq!(segment.ack_number, 2000);
    assert_eq!(segment.flags, TcpFlagBits::PSH | TcpFlagBits::ACK);
    assert_eq!(segment.payload, payload);
}

#[test]
fn tcp_options_are_skipped_via_data_offset() {
    let mut l4 = tcp_l4(0x02, 7, 0, &[]);
    // grow the header by one option word (MSS 1460)
    l4.splice(20..20, [2u8, 4, 0x05, 0xB4]);
    l4[12] = 6 << 4;
    l4.extend_from_slice(b"xyz");
    let frame = ipv4_frame(6, &l4);
    let ParsedPacket::Tcp(segment) = parse_packet(&frame).unwrap() else {
        panic!("expected a TCP segment");
    };
    assert_eq!(segment.payload, b"xyz");
}

#[test]
fn udp_datagram_fields_are_extracted() {
    let frame = ipv4_frame(17, &udp_l4(b"hello"));
    let ParsedPacket::Udp(datagram) = parse_packet(&frame).unwrap() else {
        panic!("expected a UDP datagram");
    };
    assert_eq!(datagram.src_port, 5353);
    assert_eq!(datagram.dst_port, 53);
    assert_eq!(datagram.payload, b"hello");
}

#[test]
fn udp_length_field_bounds_the_payload() {
    // UDP length shorter than the carried bytes: trailing bytes are ignored.
    let mut l4 = udp_l4(b"hello");
    l4[4..6].copy_from_slice(&11u16.to_be_bytes());
    let frame = ipv4_frame(17, &l4);
    let ParsedPacket::Udp(datagram) = parse_packet(&frame).unwrap() else {
        panic!("expected a UDP datagram");
    };
    assert_eq!(datagram.payload, b"hel");
}

#[test]
fn malformed_frames_are_rejected() {
    assert_eq!(parse_packet(&[]), Err(ParseError::EmptyPacket));
    assert_eq!(
        parse_packet(&[0x25; 20]),
        Err(ParseError::UnsupportedIpVersion(2))
    );
    assert_eq!(
        parse_packet(&[0x45; 12]),
        Err(ParseError::MalformedIpv4Header)
    );

    // IHL larger than the frame
    let mut frame = ipv4_frame(6, &tcp_l4(0x02, 1, 0, &[]));
    frame[0] = 0x4F;
    assert_eq!(parse_packet(&frame), Err(ParseError::MalformedIpv4Header));

    // TCP data offset past the segment end
    let mut l4 = tcp_l4(0x02, 1, 0, &[]);
    l4[12] = 0xF0;
    let frame = ipv4_frame(6, &l4);
    assert_eq!(parse_packet(&frame), Err(ParseError::MalformedTcpSegment));

    // UDP length larger than the datagram
    let mut l4 = udp_l4(b"x");
    l4[4..6].copy_from_slice(&64u16.to_be_bytes());
    let frame = ipv4_frame(17, &l4);
    assert_eq!(parse_packet(&frame), Err(ParseError::MalformedUdpDatagram));
}

#[test]
fn ipv6_frames_classify_as_other() {
    let mut frame = vec![0u8; 48];
    frame[0] = 0x60;
    assert!(matches!(parse_packet(&frame), Ok(ParsedPacket::Other)));
}

#[test]
fn unknown_l4_protocols_classify_as_other() {
    let frame = ipv4_frame(1, &[0u8; 8]); // ICMP
    assert!(matches!(parse_packet(&frame), Ok(ParsedPacket::Other)));
}

struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun gone"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn tun_sink_counts_write_failures() {
    let counters = Arc::new(TunCounters::default());
    let sink = TunSink::new(Box::new(FailingWriter), Arc::clone(&counters));
    assert!(sink.write_frame(&[0x45, 0, 0, 0]).is_err());
    assert!(sink.write_frame(&[0x45, 0, 0, 0]).is_err());
    assert_eq!(crate::stats::get(&counters.write_failures), 2);
}
