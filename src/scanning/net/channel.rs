use crate::scanning::env::ProbingProtocol;
use crate::scanning::error::{ScanError, ScanResult};
use crate::scanning::net::ipv4::{self, ParsedReply, MAX_PACKET_SIZE};
use crate::scanning::probe::{
    IcmpPacketCode, IcmpPacketType, ProbeKey, ProbeOutcome, ProbeRecord, ProbeStats,
};
use crate::scanning::types::{Port, Sequence, TimeToLive, TraceId};
use crate::scanning::util::Required;
use crate::scanning::{IdRange, Prober, SeqRange};
use arrayvec::ArrayVec;
use pnet::packet::icmp::echo_request::EchoRequestPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::transport::{
    icmp_packet_iter, transport_channel, TransportChannelType, TransportProtocol,
    TransportReceiver, TransportSender,
};
use std::fmt::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// The number of source ports cycled through by UDP and TCP probes so that
/// distinct probes do not hash onto the same load-balanced path.  Reduced
/// to one under fixed-flow.
pub const DEFAULT_TCP_UDP_ROUND_ROBIN: usize = 8;

/// The first source port of the round-robin pool.
const BASE_SRC_PORT: u16 = 39152;

/// The unusual high destination port aimed at by the alias side-probe.
const HIGH_DEST_PORT: Port = Port(64999);

/// The longest attention message carried as probe payload.
const MAX_ATTENTION_LEN: usize = 128;

/// The kernel buffer size of the transport channels.
const CHANNEL_BUFFER_SIZE: usize = 4096;

/// Configuration of a [`ProbeChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub protocol: ProbingProtocol,
    pub local_addr: Ipv4Addr,
    pub attention_message: String,
    pub round_robin_ports: usize,
    pub timeout: Duration,
    pub probe_regulating_period: Duration,
    pub id_range: IdRange,
    pub seq_range: SeqRange,
    pub dest_port: Port,
    pub verbose: bool,
}

/// The probing primitive over raw sockets.
///
/// Owns one send channel for the configured protocol and one raw ICMP
/// receive channel.  Creating a channel requires the `CAP_NET_RAW`
/// capability on Linux.
pub struct ProbeChannel {
    protocol: ProbingProtocol,
    local_addr: Ipv4Addr,
    dest_port: Port,
    attention: Vec<u8>,
    timeout: Duration,
    probe_regulating_period: Duration,
    id_range: IdRange,
    seq_range: SeqRange,
    next_id: TraceId,
    next_seq: Sequence,
    src_ports: ArrayVec<Port, DEFAULT_TCP_UDP_ROUND_ROBIN>,
    next_port_index: usize,
    tx: TransportSender,
    rx: TransportReceiver,
    last_dispatch: Option<Instant>,
    verbose: bool,
    log: String,
    stats: ProbeStats,
}

impl ProbeChannel {
    pub fn new(config: ChannelConfig) -> ScanResult<Self> {
        if config.id_range.0 > config.id_range.1 || config.seq_range.0 > config.seq_range.1 {
            return Err(ScanError::InvalidProbeBounds);
        }
        let (tx, rx) = make_sockets(config.protocol)?;
        let mut src_ports = ArrayVec::new();
        let pool_size = config
            .round_robin_ports
            .clamp(1, DEFAULT_TCP_UDP_ROUND_ROBIN);
        for offset in 0..pool_size {
            src_ports.push(Port(BASE_SRC_PORT + offset as u16));
        }
        let mut attention = config.attention_message.into_bytes();
        attention.truncate(MAX_ATTENTION_LEN);
        Ok(Self {
            protocol: config.protocol,
            local_addr: config.local_addr,
            dest_port: config.dest_port,
            attention,
            timeout: config.timeout,
            probe_regulating_period: config.probe_regulating_period,
            id_range: config.id_range,
            seq_range: config.seq_range,
            next_id: config.id_range.0,
            next_seq: config.seq_range.0,
            src_ports,
            next_port_index: 0,
            tx,
            rx,
            last_dispatch: None,
            verbose: config.verbose,
            log: String::new(),
            stats: ProbeStats::default(),
        })
    }

    /// Switch the UDP destination to the unusual high port used by the
    /// alias side-probe.
    pub fn use_high_port_number(&mut self) {
        self.dest_port = HIGH_DEST_PORT;
    }

    /// Honor the pause between consecutive probes of this channel.
    fn regulate(&self) {
        if let Some(last) = self.last_dispatch {
            let elapsed = last.elapsed();
            if elapsed < self.probe_regulating_period {
                thread::sleep(self.probe_regulating_period - elapsed);
            }
        }
    }

    /// Pick the identifiers for the next probe from the bounded pools.
    fn next_key(&mut self, fixed_flow: bool) -> ProbeKey {
        match self.protocol {
            ProbingProtocol::Icmp => {
                let key = ProbeKey::Icmp {
                    identifier: self.next_id,
                    sequence: self.next_seq,
                };
                if self.next_seq == self.seq_range.1 {
                    self.next_seq = self.seq_range.0;
                    self.next_id = if self.next_id == self.id_range.1 {
                        self.id_range.0
                    } else {
                        TraceId(self.next_id.0 + 1)
                    };
                } else {
                    self.next_seq += Sequence(1);
                }
                key
            }
            ProbingProtocol::Udp => ProbeKey::Udp {
                src_port: self.next_src_port(fixed_flow),
                dest_port: self.dest_port,
            },
            ProbingProtocol::Tcp => ProbeKey::Tcp {
                src_port: self.next_src_port(fixed_flow),
                dest_port: self.dest_port,
            },
        }
    }

    fn next_src_port(&mut self, fixed_flow: bool) -> Port {
        if fixed_flow || self.src_ports.len() == 1 {
            return self.src_ports[0];
        }
        let port = self.src_ports[self.next_port_index % self.src_ports.len()];
        self.next_port_index += 1;
        port
    }

    fn dispatch(&mut self, dst: Ipv4Addr, ttl: TimeToLive, key: ProbeKey) -> ScanResult<()> {
        let mut buf = [0_u8; MAX_PACKET_SIZE];
        self.tx.set_ttl(ttl.0)?;
        match key {
            ProbeKey::Icmp {
                identifier,
                sequence,
            } => {
                let size =
                    ipv4::build_echo_request(&mut buf, identifier, sequence, &self.attention)?;
                let packet = EchoRequestPacket::new(&buf[..size]).req()?;
                self.tx.send_to(packet, IpAddr::V4(dst))?;
            }
            ProbeKey::Udp {
                src_port,
                dest_port,
            } => {
                let size = ipv4::build_udp_probe(
                    &mut buf,
                    self.local_addr,
                    dst,
                    src_port,
                    dest_port,
                    &self.attention,
                )?;
                let packet = UdpPacket::new(&buf[..size]).req()?;
                self.tx.send_to(packet, IpAddr::V4(dst))?;
            }
            ProbeKey::Tcp {
                src_port,
                dest_port,
            } => {
                let size =
                    ipv4::build_tcp_syn(&mut buf, self.local_addr, dst, src_port, dest_port)?;
                let packet = TcpPacket::new(&buf[..size]).req()?;
                self.tx.send_to(packet, IpAddr::V4(dst))?;
            }
        }
        Ok(())
    }

    /// Wait for the reply matching `key`, discarding foreign traffic, until
    /// the configured timeout elapses.
    fn await_reply(
        &mut self,
        dst: Ipv4Addr,
        ttl: TimeToLive,
        key: ProbeKey,
        sent_at: Instant,
    ) -> ScanResult<ProbeOutcome> {
        let deadline = sent_at + self.timeout;
        let local_addr = self.local_addr;
        let mut replies = icmp_packet_iter(&mut self.rx);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ProbeOutcome::Timeout);
            }
            match replies.next_with_timeout(remaining)? {
                Some((icmp, IpAddr::V4(from))) => {
                    let Some(reply) = ipv4::parse_reply(&icmp) else {
                        continue;
                    };
                    if !ipv4::matches_probe(&reply, &key, local_addr, dst) {
                        continue;
                    }
                    let kind = match reply {
                        ParsedReply::EchoReply { .. } => IcmpPacketType::EchoReply,
                        ParsedReply::TimeExceeded { .. } => IcmpPacketType::TimeExceeded,
                        ParsedReply::Unreachable { code, .. } => {
                            IcmpPacketType::Unreachable(IcmpPacketCode(code))
                        }
                    };
                    return Ok(ProbeOutcome::Reply(ProbeRecord {
                        reply_addr: from,
                        kind,
                        rtt: sent_at.elapsed(),
                        dest_addr: dst,
                        probe_ttl: ttl,
                        key,
                    }));
                }
                Some(_) => {}
                None => return Ok(ProbeOutcome::Timeout),
            }
        }
    }

    fn log_probe(&mut self, dst: Ipv4Addr, ttl: TimeToLive, key: ProbeKey, outcome: &ProbeOutcome) {
        let proto = match self.protocol {
            ProbingProtocol::Icmp => "icmp",
            ProbingProtocol::Udp => "udp",
            ProbingProtocol::Tcp => "tcp",
        };
        let key_repr = match key {
            ProbeKey::Icmp {
                identifier,
                sequence,
            } => format!("id={} seq={}", identifier.0, sequence.0),
            ProbeKey::Udp {
                src_port,
                dest_port,
            }
            | ProbeKey::Tcp {
                src_port,
                dest_port,
            } => format!("sport={} dport={}", src_port.0, dest_port.0),
        };
        let line = match outcome {
            ProbeOutcome::Reply(record) => format!(
                "[{proto}] {} -> {dst} ttl={ttl} {key_repr}: {:?} from {} rtt={}ms\n",
                self.local_addr,
                record.kind,
                record.reply_addr,
                record.rtt.as_millis(),
            ),
            ProbeOutcome::Timeout => format!(
                "[{proto}] {} -> {dst} ttl={ttl} {key_repr}: timeout (type 255, 0.0.0.0)\n",
                self.local_addr,
            ),
        };
        let _ = write!(self.log, "{line}");
    }
}

impl Prober for ProbeChannel {
    fn single_probe(
        &mut self,
        dst: Ipv4Addr,
        ttl: TimeToLive,
        fixed_flow: bool,
    ) -> ScanResult<ProbeOutcome> {
        self.regulate();
        let key = self.next_key(fixed_flow);
        debug!(%dst, ttl = ttl.0, ?key, "dispatching probe");
        let sent_at = Instant::now();
        self.dispatch(dst, ttl, key)?;
        self.stats.sent += 1;
        self.last_dispatch = Some(sent_at);
        let outcome = self.await_reply(dst, ttl, key, sent_at)?;
        if !outcome.is_timeout() {
            self.stats.matched += 1;
        }
        if self.verbose {
            self.log_probe(dst, ttl, key, &outcome);
        }
        Ok(outcome)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn take_log(&mut self) -> String {
        std::mem::take(&mut self.log)
    }

    fn stats(&self) -> ProbeStats {
        self.stats
    }
}

/// Open the send channel for `protocol` and the raw ICMP receive channel.
fn make_sockets(protocol: ProbingProtocol) -> ScanResult<(TransportSender, TransportReceiver)> {
    let icmp_channel = || {
        transport_channel(
            CHANNEL_BUFFER_SIZE,
            TransportChannelType::Layer4(TransportProtocol::Ipv4(IpNextHeaderProtocols::Icmp)),
        )
    };
    Ok(match protocol {
        ProbingProtocol::Icmp => icmp_channel()?,
        ProbingProtocol::Udp => {
            let (tx, _) = transport_channel(
                CHANNEL_BUFFER_SIZE,
                TransportChannelType::Layer4(TransportProtocol::Ipv4(IpNextHeaderProtocols::Udp)),
            )?;
            let (_, rx) = icmp_channel()?;
            (tx, rx)
        }
        ProbingProtocol::Tcp => {
            let (tx, _) = transport_channel(
                CHANNEL_BUFFER_SIZE,
                TransportChannelType::Layer4(TransportProtocol::Ipv4(IpNextHeaderProtocols::Tcp)),
            )?;
            let (_, rx) = icmp_channel()?;
            (tx, rx)
        }
    })
}
