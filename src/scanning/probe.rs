use crate::scanning::types::{Port, Sequence, TimeToLive, TraceId};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::ops::AddAssign;
use std::time::Duration;

/// ICMP code of a `Destination Unreachable` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IcmpPacketCode(pub u8);

/// The `Port Unreachable` code of `Destination Unreachable`.
pub const PORT_UNREACHABLE: IcmpPacketCode = IcmpPacketCode(3);

/// The type of ICMP reply received for a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IcmpPacketType {
    /// `TimeExceeded` packet (type 11).
    TimeExceeded,
    /// `EchoReply` packet (type 0).
    EchoReply,
    /// `DestinationUnreachable` packet (type 3) with its code.
    Unreachable(IcmpPacketCode),
}

/// The identifiers a probe was sent with, per protocol.
///
/// Reply correlation matches these against either the echoed ICMP id/seq or
/// the identifiers recovered from the quoted IP + transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKey {
    Icmp { identifier: TraceId, sequence: Sequence },
    Udp { src_port: Port, dest_port: Port },
    Tcp { src_port: Port, dest_port: Port },
}

/// The outcome of one dispatched probe which received a matching reply.
#[derive(Debug, Clone, Copy)]
pub struct ProbeRecord {
    /// The source address of the reply.
    pub reply_addr: Ipv4Addr,
    /// The ICMP type (and code) of the reply.
    pub kind: IcmpPacketType,
    /// Round-trip time between dispatch and reply.
    pub rtt: Duration,
    /// The destination the probe was aimed at.
    pub dest_addr: Ipv4Addr,
    /// The time-to-live the probe was sent with.
    pub probe_ttl: TimeToLive,
    /// The identifiers the probe was sent with.
    pub key: ProbeKey,
}

/// The outcome of one dispatched probe.
///
/// `Timeout` replaces the wire-level "type 255, address 0" sentinel at the
/// boundary between the probing layer and the workers; the sentinel wording
/// survives only in the wire-adjacent debug log.
#[derive(Debug, Clone, Copy)]
pub enum ProbeOutcome {
    Reply(ProbeRecord),
    Timeout,
}

impl ProbeOutcome {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// The reply record, if any.
    #[must_use]
    pub const fn reply(&self) -> Option<&ProbeRecord> {
        match self {
            Self::Reply(record) => Some(record),
            Self::Timeout => None,
        }
    }

    /// Whether the reply is an Echo Reply from `addr` itself.
    #[must_use]
    pub fn is_echo_reply(&self) -> bool {
        matches!(
            self,
            Self::Reply(ProbeRecord {
                kind: IcmpPacketType::EchoReply,
                ..
            })
        )
    }

    /// Whether the reply is a Time Exceeded from an intermediate router.
    #[must_use]
    pub fn is_time_exceeded(&self) -> bool {
        matches!(
            self,
            Self::Reply(ProbeRecord {
                kind: IcmpPacketType::TimeExceeded,
                ..
            })
        )
    }
}

/// Counters of probes sent and replies matched by one prober.
///
/// Merged into the environment totals when a worker retires its prober.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeStats {
    pub sent: u64,
    pub matched: u64,
}

impl AddAssign for ProbeStats {
    fn add_assign(&mut self, other: Self) {
        self.sent += other.sent;
        self.matched += other.matched;
    }
}
