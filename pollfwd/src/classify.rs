//! # Packet Classification
//!
//! Decides whether a received frame is forwarded or consumed. IPv4/UDP frames are consumed:
//! their payload is NUL-terminated in place and reported. The only IPv4/UDP frames that
//! pass through are those whose UDP length points outside the received bytes or the
//! buffer room. Everything else is forwarded untouched.
//!
//! All header access goes through `etherparse` slices, which refuse to read past the end
//! of the frame. The UDP length field comes from the wire and is checked against both the
//! received length and the buffer room before anything is written.

use etherparse::{EtherType, Ethernet2HeaderSlice, IpNumber, Ipv4HeaderSlice, UdpHeaderSlice};
use std::borrow::Cow;
use std::net::SocketAddrV4;
use std::ops::Range;

const UDP_HEADER_LEN: usize = 8;

/// A UDP datagram consumed by the forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    /// Payload bytes up to the first NUL, relative to the start of the frame.
    pub payload: Range<usize>,
}

impl UdpDatagram {
    /// Payload as text, invalid UTF-8 replaced.
    pub fn text<'a>(&self, frame: &'a [u8]) -> Cow<'a, str> {
        String::from_utf8_lossy(frame.get(self.payload.clone()).unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    Consume(UdpDatagram),
}

/// Classifies the frame occupying the first `data_len` bytes of `room`.
///
/// `room` runs from the start of the frame to the end of the buffer. A consumed frame gets
/// a 0 written right after the UDP datagram.
pub fn classify(room: &mut [u8], data_len: usize) -> Verdict {
    let data_len = data_len.min(room.len());
    match inspect(&room[..data_len], room.len()) {
        Some((datagram, terminator)) => {
            room[terminator] = 0;
            let end = room[datagram.payload.clone()]
                .iter()
                .position(|b| *b == 0)
                .map_or(datagram.payload.end, |nul| datagram.payload.start + nul);
            Verdict::Consume(UdpDatagram {
                payload: datagram.payload.start..end,
                ..datagram
            })
        }
        None => Verdict::Forward,
    }
}

fn inspect(frame: &[u8], room_len: usize) -> Option<(UdpDatagram, usize)> {
    let eth = Ethernet2HeaderSlice::from_slice(frame).ok()?;
    if eth.ether_type() != EtherType::IPV4 {
        return None;
    }
    let ip_start = eth.slice().len();
    let ip = Ipv4HeaderSlice::from_slice(&frame[ip_start..]).ok()?;
    if ip.protocol() != IpNumber::UDP {
        return None;
    }
    // Non-first fragments are read the same way: the first 8 bytes after the IP header
    // stand in for the UDP header.
    let udp_start = ip_start + ip.slice().len();
    let udp = UdpHeaderSlice::from_slice(&frame[udp_start..]).ok()?;
    let terminator = udp_start + udp.length() as usize;
    if terminator > frame.len() || terminator >= room_len {
        return None;
    }
    // a length below the header size leaves no payload
    let payload_start = (udp_start + UDP_HEADER_LEN).min(terminator);
    Some((
        UdpDatagram {
            src: SocketAddrV4::new(ip.source_addr(), udp.source_port()),
            dst: SocketAddrV4::new(ip.destination_addr(), udp.destination_port()),
            payload: payload_start..terminator,
        },
        terminator,
    ))
}

//
// ================================================================================================
//   UNITTESTS
// ================================================================================================
//
#[cfg(test)]
mod tests {
    use super::{Verdict, classify};
    use etherparse::{EtherType, Ethernet2Header, PacketBuilder};
    use std::net::{Ipv4Addr, SocketAddrV4};

    const SRC_MAC: [u8; 6] = [0xaa, 0x79, 0xea, 0x34, 0x4b, 0xb8];
    const DST_MAC: [u8; 6] = [0xfa, 0x95, 0x2c, 0xe3, 0x0e, 0xa5];

    fn udp_frame(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(4321, 9999);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    fn room_for(frame: &[u8], extra: usize) -> Vec<u8> {
        let mut room = frame.to_vec();
        room.resize(frame.len() + extra, 0xee);
        room
    }

    #[test]
    fn test_udp_is_consumed() {
        let frame = udp_frame(b"ping");
        let mut room = room_for(&frame, 64);
        let Verdict::Consume(datagram) = classify(&mut room, frame.len()) else {
            panic!("udp frame must be consumed");
        };
        assert_eq!(datagram.src, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4321));
        assert_eq!(datagram.dst, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 9999));
        assert_eq!(datagram.text(&room), "ping");
        assert_eq!(room[frame.len()], 0);
    }

    #[test]
    fn test_payload_stops_at_nul_and_tolerates_bad_utf8() {
        let frame = udp_frame(b"p\xffng\0tail");
        let mut room = room_for(&frame, 8);
        let Verdict::Consume(datagram) = classify(&mut room, frame.len()) else {
            panic!("udp frame must be consumed");
        };
        assert_eq!(datagram.text(&room), "p\u{fffd}ng");
    }

    #[test]
    fn test_non_ipv4_forwarded_untouched() {
        let mut frame = Ethernet2Header {
            source: SRC_MAC,
            destination: DST_MAC,
            ether_type: EtherType::ARP,
        }
        .to_bytes()
        .to_vec();
        frame.extend_from_slice(&[0u8; 28]);
        let mut room = room_for(&frame, 16);
        let before = room.clone();
        assert_eq!(classify(&mut room, frame.len()), Verdict::Forward);
        assert_eq!(room, before);
    }

    #[test]
    fn test_runt_frame_forwarded() {
        let mut room = vec![0u8; 64];
        assert_eq!(classify(&mut room, 10), Verdict::Forward);
        assert_eq!(classify(&mut room, 0), Verdict::Forward);
    }

    #[test]
    fn test_tcp_forwarded() {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(1000, 2000, 1, 64_000);
        let mut frame = Vec::new();
        builder.write(&mut frame, b"data").unwrap();
        let mut room = room_for(&frame, 16);
        assert_eq!(classify(&mut room, frame.len()), Verdict::Forward);
    }

    #[test]
    fn test_udp_length_past_frame_forwarded() {
        let mut frame = udp_frame(b"ping");
        let udp_len_at = 14 + 20 + 4;
        frame[udp_len_at..udp_len_at + 2].copy_from_slice(&4000u16.to_be_bytes());
        let mut room = room_for(&frame, 16);
        let before = room.clone();
        assert_eq!(classify(&mut room, frame.len()), Verdict::Forward);
        assert_eq!(room, before);
    }

    #[test]
    fn test_udp_length_below_header_consumed_with_empty_payload() {
        let mut frame = udp_frame(b"ping");
        let udp_start = 14 + 20;
        frame[udp_start + 4..udp_start + 6].copy_from_slice(&3u16.to_be_bytes());
        let mut room = room_for(&frame, 16);
        let Verdict::Consume(datagram) = classify(&mut room, frame.len()) else {
            panic!("udp frame must be consumed");
        };
        assert_eq!(datagram.dst.port(), 9999);
        assert!(datagram.payload.is_empty());
        assert_eq!(datagram.text(&room), "");
        assert_eq!(room[udp_start + 3], 0);
    }

    #[test]
    fn test_terminator_outside_room_forwarded() {
        let frame = udp_frame(b"ping");
        let mut room = frame.clone();
        assert_eq!(classify(&mut room, frame.len()), Verdict::Forward);
        assert_eq!(room, frame);
    }

    #[test]
    fn test_later_fragment_consumed() {
        let mut frame = udp_frame(b"ping");
        // fragment offset 1 (8 bytes)
        frame[14 + 6..14 + 8].copy_from_slice(&1u16.to_be_bytes());
        let mut room = room_for(&frame, 16);
        let Verdict::Consume(datagram) = classify(&mut room, frame.len()) else {
            panic!("udp fragment must be consumed");
        };
        assert_eq!(datagram.text(&room), "ping");
        assert_eq!(room[frame.len()], 0);
    }
}
