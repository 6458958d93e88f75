use crate::scanning::error::ScanResult;
use crate::scanning::probe::ProbeKey;
use crate::scanning::types::{Port, Sequence, TraceId};
use crate::scanning::util::Required;
use pnet::packet::icmp::destination_unreachable::DestinationUnreachablePacket;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{self, EchoRequestPacket, MutableEchoRequestPacket};
use pnet::packet::icmp::time_exceeded::TimeExceededPacket;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::Packet;
use pnet::util;
use std::net::Ipv4Addr;

/// The maximum size of the IP packet we allow.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Build an ICMP `EchoRequest` into `buf` and return its length.
pub fn build_echo_request(
    buf: &mut [u8],
    identifier: TraceId,
    sequence: Sequence,
    payload: &[u8],
) -> ScanResult<usize> {
    let size = MutableEchoRequestPacket::minimum_packet_size() + payload.len();
    let mut req = MutableEchoRequestPacket::new(&mut buf[..size]).req()?;
    req.set_icmp_type(IcmpTypes::EchoRequest);
    req.set_icmp_code(echo_request::IcmpCodes::NoCode);
    req.set_identifier(identifier.0);
    req.set_sequence_number(sequence.0);
    req.set_payload(payload);
    req.set_checksum(util::checksum(req.packet(), 1));
    Ok(size)
}

/// Build a UDP datagram into `buf` and return its length.
pub fn build_udp_probe(
    buf: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: Port,
    dest_port: Port,
    payload: &[u8],
) -> ScanResult<usize> {
    let size = MutableUdpPacket::minimum_packet_size() + payload.len();
    let mut probe = MutableUdpPacket::new(&mut buf[..size]).req()?;
    probe.set_source(src_port.0);
    probe.set_destination(dest_port.0);
    probe.set_length(size as u16);
    probe.set_payload(payload);
    probe.set_checksum(udp::ipv4_checksum(&probe.to_immutable(), &src, &dst));
    Ok(size)
}

/// Build a TCP `SYN` into `buf` and return its length.
pub fn build_tcp_syn(
    buf: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: Port,
    dest_port: Port,
) -> ScanResult<usize> {
    let size = MutableTcpPacket::minimum_packet_size();
    let mut probe = MutableTcpPacket::new(&mut buf[..size]).req()?;
    probe.set_source(src_port.0);
    probe.set_destination(dest_port.0);
    probe.set_sequence(0);
    probe.set_data_offset(5);
    probe.set_flags(TcpFlags::SYN);
    probe.set_window(1024);
    probe.set_checksum(tcp::ipv4_checksum(&probe.to_immutable(), &src, &dst));
    Ok(size)
}

/// The outgoing IP + transport header quoted inside an ICMP error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotedProbe {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub icmp: Option<(u16, u16)>,
    pub udp: Option<(u16, u16)>,
    pub tcp: Option<(u16, u16)>,
}

/// A received ICMP message reduced to what reply correlation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedReply {
    EchoReply { identifier: u16, sequence: u16 },
    TimeExceeded { quoted: QuotedProbe },
    Unreachable { code: u8, quoted: QuotedProbe },
}

/// Reduce an incoming ICMP message; unknown types and unparseable payloads
/// yield `None` so the caller keeps waiting.
#[must_use]
pub fn parse_reply(icmp: &IcmpPacket<'_>) -> Option<ParsedReply> {
    match icmp.get_icmp_type() {
        IcmpTypes::EchoReply => {
            let echo = EchoReplyPacket::new(icmp.packet())?;
            Some(ParsedReply::EchoReply {
                identifier: echo.get_identifier(),
                sequence: echo.get_sequence_number(),
            })
        }
        IcmpTypes::TimeExceeded => {
            let packet = TimeExceededPacket::new(icmp.packet())?;
            Some(ParsedReply::TimeExceeded {
                quoted: parse_quoted(packet.payload())?,
            })
        }
        IcmpTypes::DestinationUnreachable => {
            let packet = DestinationUnreachablePacket::new(icmp.packet())?;
            Some(ParsedReply::Unreachable {
                code: packet.get_icmp_code().0,
                quoted: parse_quoted(packet.payload())?,
            })
        }
        _ => None,
    }
}

/// Extract the quoted probe identifiers from the payload of an ICMP error.
///
/// The quote is only guaranteed to carry the IP header plus eight bytes of
/// the original datagram, so the TCP ports are read directly rather than
/// through a full header view.
fn parse_quoted(payload: &[u8]) -> Option<QuotedProbe> {
    let ip4 = Ipv4Packet::new(payload)?;
    let header_len = usize::from(ip4.get_header_length()) * 4;
    if header_len < Ipv4Packet::minimum_packet_size() || header_len > payload.len() {
        return None;
    }
    let inner = &payload[header_len..];
    let mut quoted = QuotedProbe {
        src: ip4.get_source(),
        dst: ip4.get_destination(),
        icmp: None,
        udp: None,
        tcp: None,
    };
    match ip4.get_next_level_protocol() {
        IpNextHeaderProtocols::Icmp => {
            let echo = EchoRequestPacket::new(inner)?;
            quoted.icmp = Some((echo.get_identifier(), echo.get_sequence_number()));
        }
        IpNextHeaderProtocols::Udp => {
            let probe = UdpPacket::new(inner)?;
            quoted.udp = Some((probe.get_source(), probe.get_destination()));
        }
        IpNextHeaderProtocols::Tcp => {
            if inner.len() < 4 {
                return None;
            }
            let src_port = u16::from_be_bytes([inner[0], inner[1]]);
            let dest_port = u16::from_be_bytes([inner[2], inner[3]]);
            quoted.tcp = Some((src_port, dest_port));
        }
        _ => return None,
    }
    Some(quoted)
}

/// The reply correlation rule.
///
/// A message is accepted iff it is an Echo Reply carrying the outgoing ICMP
/// id/seq, or it quotes an outer IP header whose source and destination
/// match this prober's local address and the probe's destination and whose
/// inner identifiers match the tuple sent.
#[must_use]
pub fn matches_probe(reply: &ParsedReply, key: &ProbeKey, local: Ipv4Addr, dst: Ipv4Addr) -> bool {
    match reply {
        ParsedReply::EchoReply {
            identifier,
            sequence,
        } => matches!(
            key,
            ProbeKey::Icmp {
                identifier: id,
                sequence: seq,
            } if id.0 == *identifier && seq.0 == *sequence
        ),
        ParsedReply::TimeExceeded { quoted } | ParsedReply::Unreachable { quoted, .. } => {
            quoted.src == local
                && quoted.dst == dst
                && match key {
                    ProbeKey::Icmp {
                        identifier,
                        sequence,
                    } => quoted.icmp == Some((identifier.0, sequence.0)),
                    ProbeKey::Udp {
                        src_port,
                        dest_port,
                    } => quoted.udp == Some((src_port.0, dest_port.0)),
                    ProbeKey::Tcp {
                        src_port,
                        dest_port,
                    } => quoted.tcp == Some((src_port.0, dest_port.0)),
                }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ipv4::MutableIpv4Packet;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const TARGET: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

    /// Craft an ICMP error reply quoting an outgoing probe.
    fn make_error_reply(icmp_type: u8, icmp_code: u8, quoted_transport: &[u8], proto: u8) -> Vec<u8> {
        let quoted_len = 20 + quoted_transport.len();
        let mut buf = vec![0_u8; 8 + quoted_len];
        buf[0] = icmp_type;
        buf[1] = icmp_code;
        {
            let mut ip4 = MutableIpv4Packet::new(&mut buf[8..]).expect("ipv4");
            ip4.set_version(4);
            ip4.set_header_length(5);
            ip4.set_total_length(quoted_len as u16);
            ip4.set_source(LOCAL);
            ip4.set_destination(TARGET);
            ip4.set_next_level_protocol(pnet::packet::ip::IpNextHeaderProtocol(proto));
        }
        buf[28..].copy_from_slice(quoted_transport);
        buf
    }

    #[test]
    fn test_echo_request_roundtrip() {
        let mut buf = [0_u8; MAX_PACKET_SIZE];
        let size =
            build_echo_request(&mut buf, TraceId(0x1234), Sequence(99), b"hello").expect("build");
        assert_eq!(8 + 5, size);
        let req = EchoRequestPacket::new(&buf[..size]).expect("parse");
        assert_eq!(0x1234, req.get_identifier());
        assert_eq!(99, req.get_sequence_number());
        assert_eq!(b"hello", req.payload());
        assert_ne!(0, req.get_checksum());
    }

    #[test]
    fn test_udp_probe_roundtrip() {
        let mut buf = [0_u8; MAX_PACKET_SIZE];
        let size = build_udp_probe(&mut buf, LOCAL, TARGET, Port(39152), Port(33434), b"probe")
            .expect("build");
        let probe = UdpPacket::new(&buf[..size]).expect("parse");
        assert_eq!(39152, probe.get_source());
        assert_eq!(33434, probe.get_destination());
        assert_eq!(size as u16, probe.get_length());
    }

    #[test]
    fn test_tcp_syn_has_syn_flag() {
        let mut buf = [0_u8; MAX_PACKET_SIZE];
        let size = build_tcp_syn(&mut buf, LOCAL, TARGET, Port(39152), Port(80)).expect("build");
        assert_eq!(20, size);
        let probe = pnet::packet::tcp::TcpPacket::new(&buf[..size]).expect("parse");
        assert_eq!(TcpFlags::SYN, probe.get_flags());
    }

    #[test]
    fn test_parse_echo_reply() {
        let mut buf = [0_u8; 64];
        let size = build_echo_request(&mut buf, TraceId(7), Sequence(3), b"x").expect("build");
        // An Echo Reply has the same layout with type 0.
        buf[0] = 0;
        let icmp = IcmpPacket::new(&buf[..size]).expect("icmp");
        let reply = parse_reply(&icmp).expect("parsed");
        assert_eq!(
            ParsedReply::EchoReply {
                identifier: 7,
                sequence: 3
            },
            reply
        );
        let key = ProbeKey::Icmp {
            identifier: TraceId(7),
            sequence: Sequence(3),
        };
        assert!(matches_probe(&reply, &key, LOCAL, TARGET));
        let other = ProbeKey::Icmp {
            identifier: TraceId(7),
            sequence: Sequence(4),
        };
        assert!(!matches_probe(&reply, &other, LOCAL, TARGET));
    }

    #[test]
    fn test_parse_time_exceeded_quoting_udp() {
        let mut quoted = [0_u8; 8];
        let size = build_udp_probe(&mut quoted, LOCAL, TARGET, Port(40000), Port(33434), b"")
            .expect("build");
        let buf = make_error_reply(11, 0, &quoted[..size], 17);
        let icmp = IcmpPacket::new(&buf).expect("icmp");
        let reply = parse_reply(&icmp).expect("parsed");
        let ParsedReply::TimeExceeded { quoted } = reply else {
            panic!("expected time exceeded");
        };
        assert_eq!(LOCAL, quoted.src);
        assert_eq!(TARGET, quoted.dst);
        assert_eq!(Some((40000, 33434)), quoted.udp);
        let key = ProbeKey::Udp {
            src_port: Port(40000),
            dest_port: Port(33434),
        };
        assert!(matches_probe(&reply, &key, LOCAL, TARGET));
        // A probe from another worker must not correlate.
        let foreign = ProbeKey::Udp {
            src_port: Port(40001),
            dest_port: Port(33434),
        };
        assert!(!matches_probe(&reply, &foreign, LOCAL, TARGET));
    }

    #[test]
    fn test_parse_port_unreachable_quoting_icmp() {
        let mut quoted = [0_u8; 16];
        let size = build_echo_request(&mut quoted, TraceId(21), Sequence(42), b"").expect("build");
        let buf = make_error_reply(3, 3, &quoted[..size], 1);
        let icmp = IcmpPacket::new(&buf).expect("icmp");
        let reply = parse_reply(&icmp).expect("parsed");
        let ParsedReply::Unreachable { code, quoted } = reply else {
            panic!("expected unreachable");
        };
        assert_eq!(3, code);
        assert_eq!(Some((21, 42)), quoted.icmp);
        let key = ProbeKey::Icmp {
            identifier: TraceId(21),
            sequence: Sequence(42),
        };
        assert!(matches_probe(&reply, &key, LOCAL, TARGET));
        // Quoted destination differing from the probed target is foreign.
        assert!(!matches_probe(&reply, &key, LOCAL, Ipv4Addr::new(203, 0, 113, 9)));
    }

    #[test]
    fn test_truncated_quote_is_ignored() {
        let buf = make_error_reply(11, 0, &[0x12, 0x34], 6);
        let icmp = IcmpPacket::new(&buf).expect("icmp");
        assert_eq!(None, parse_reply(&icmp));
    }

    #[test]
    fn test_unknown_icmp_type_is_ignored() {
        let buf = vec![13_u8, 0, 0, 0, 0, 0, 0, 0];
        let icmp = IcmpPacket::new(&buf).expect("icmp");
        assert_eq!(None, parse_reply(&icmp));
    }
}
