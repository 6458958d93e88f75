//! A scripted prober driving the worker state machines in tests.

use crate::scanning::error::{ScanError, ScanResult};
use crate::scanning::probe::{
    IcmpPacketCode, IcmpPacketType, ProbeKey, ProbeOutcome, ProbeRecord, ProbeStats,
};
use crate::scanning::types::{Port, TimeToLive};
use crate::scanning::{IdRange, Prober, ProberFactory, SeqRange};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// One scripted reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimReply {
    /// Echo Reply from the destination itself.
    Echo,
    /// Time Exceeded from the given router.
    TimeExceeded(Ipv4Addr),
    /// Destination Unreachable with the given code from the given source.
    Unreachable(Ipv4Addr, u8),
    /// No reply within the timeout.
    Timeout,
    /// Kernel-level socket failure.
    SocketError,
}

/// One line of the probe journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeLogEntry {
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub fixed_flow: bool,
    pub timeout: Duration,
}

type ReplyTable = HashMap<(Ipv4Addr, u8), Vec<SimReply>>;
type Journal = Arc<Mutex<Vec<ProbeLogEntry>>>;

/// A prober whose replies are scripted per `(destination, ttl)`.
///
/// Unscripted probes time out.  A scripted sequence is consumed in order
/// and its last element repeats.  Every probe is appended to a journal
/// shared with the test.
pub struct SimulatedProber {
    replies: Arc<Mutex<ReplyTable>>,
    journal: Journal,
    timeout: Duration,
    stats: ProbeStats,
}

impl SimulatedProber {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(HashMap::new())),
            journal: Arc::new(Mutex::new(Vec::new())),
            timeout: Duration::from_secs(2),
            stats: ProbeStats::default(),
        }
    }

    /// Script a fixed reply for every probe of `(dst, ttl)`.
    pub fn on(&self, dst: Ipv4Addr, ttl: u8, reply: SimReply) {
        self.on_seq(dst, ttl, vec![reply]);
    }

    /// Script a sequence of replies for `(dst, ttl)`; the last one repeats.
    pub fn on_seq(&self, dst: Ipv4Addr, ttl: u8, replies: Vec<SimReply>) {
        self.replies.lock().insert((dst, ttl), replies);
    }

    /// The journal of probes dispatched so far.
    pub fn journal(&self) -> Journal {
        Arc::clone(&self.journal)
    }

    /// A clone sharing the reply table and journal, for multi-worker tests.
    pub fn share(&self) -> Self {
        Self {
            replies: Arc::clone(&self.replies),
            journal: Arc::clone(&self.journal),
            timeout: self.timeout,
            stats: ProbeStats::default(),
        }
    }

    fn next_reply(&self, dst: Ipv4Addr, ttl: u8) -> SimReply {
        let mut replies = self.replies.lock();
        let Some(queue) = replies.get_mut(&(dst, ttl)) else {
            return SimReply::Timeout;
        };
        if queue.len() > 1 {
            queue.remove(0)
        } else {
            queue.first().copied().unwrap_or(SimReply::Timeout)
        }
    }
}

impl Prober for SimulatedProber {
    fn single_probe(
        &mut self,
        dst: Ipv4Addr,
        ttl: TimeToLive,
        fixed_flow: bool,
    ) -> ScanResult<ProbeOutcome> {
        self.journal.lock().push(ProbeLogEntry {
            dst,
            ttl: ttl.0,
            fixed_flow,
            timeout: self.timeout,
        });
        self.stats.sent += 1;
        let reply = self.next_reply(dst, ttl.0);
        let key = ProbeKey::Udp {
            src_port: Port(39152),
            dest_port: Port(33434),
        };
        let record = |reply_addr, kind| {
            ProbeOutcome::Reply(ProbeRecord {
                reply_addr,
                kind,
                rtt: Duration::from_millis(5),
                dest_addr: dst,
                probe_ttl: ttl,
                key,
            })
        };
        let outcome = match reply {
            SimReply::Echo => record(dst, IcmpPacketType::EchoReply),
            SimReply::TimeExceeded(from) => record(from, IcmpPacketType::TimeExceeded),
            SimReply::Unreachable(from, code) => {
                record(from, IcmpPacketType::Unreachable(IcmpPacketCode(code)))
            }
            SimReply::Timeout => ProbeOutcome::Timeout,
            SimReply::SocketError => {
                return Err(ScanError::Socket(io::Error::new(
                    io::ErrorKind::Other,
                    "simulated socket failure",
                )))
            }
        };
        if !outcome.is_timeout() {
            self.stats.matched += 1;
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
        String::new()
    }

    fn stats(&self) -> ProbeStats {
        self.stats
    }
}

/// A factory handing out probers which share one reply table and journal.
pub struct SimulatedFactory {
    template: SimulatedProber,
    /// Identifier ranges requested through the factory, for disjointness
    /// assertions.
    pub id_slices: Mutex<Vec<(IdRange, SeqRange)>>,
}

impl SimulatedFactory {
    pub fn new() -> Self {
        Self {
            template: SimulatedProber::new(),
            id_slices: Mutex::new(Vec::new()),
        }
    }

    pub fn on(&self, dst: Ipv4Addr, ttl: u8, reply: SimReply) {
        self.template.on(dst, ttl, reply);
    }

    pub fn on_seq(&self, dst: Ipv4Addr, ttl: u8, replies: Vec<SimReply>) {
        self.template.on_seq(dst, ttl, replies);
    }

    pub fn journal(&self) -> Journal {
        self.template.journal()
    }
}

impl ProberFactory for SimulatedFactory {
    type Prober = SimulatedProber;

    fn make_prober(&self, ids: IdRange, seqs: SeqRange) -> ScanResult<SimulatedProber> {
        self.id_slices.lock().push((ids, seqs));
        Ok(self.template.share())
    }

    fn make_alias_prober(&self, ids: IdRange, seqs: SeqRange) -> ScanResult<SimulatedProber> {
        self.make_prober(ids, seqs)
    }
}
