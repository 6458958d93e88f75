use crate::scanning::probe::ProbeStats;
use crate::scanning::types::{Port, Sequence, TimeToLive, TraceId};
use parking_lot::Mutex;
use std::io::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

/// The protocol carrying the outgoing probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbingProtocol {
    Icmp,
    Udp,
    Tcp,
}

/// How much of the probing detail is printed to the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DisplayMode {
    Silent,
    SlightlyVerbose,
    Debug,
}

/// Configuration for a whole scan, shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub protocol: ProbingProtocol,
    pub local_addr: Ipv4Addr,
    /// Probe payload text allowing operators to identify the tool.
    pub attention_message: String,
    pub timeout: Duration,
    /// Pause between consecutive sends of a single prober.
    pub probe_regulating_period: Duration,
    pub retry_delay: Duration,
    /// Total attempts per probe, timeouts included.
    pub max_retries: u16,
    /// Pause between consecutive targets of a single worker.
    pub probing_thread_delay: Duration,
    pub start_ttl: TimeToLive,
    pub fixed_flow: bool,
    pub display_mode: DisplayMode,
    pub thread_count: usize,
    /// Inclusive ICMP identifier bounds, partitioned across workers.
    pub icmp_id_range: (TraceId, TraceId),
    /// Inclusive ICMP sequence bounds.
    pub icmp_seq_range: (Sequence, Sequence),
    pub udp_dest_port: Port,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            protocol: ProbingProtocol::Icmp,
            local_addr: Ipv4Addr::UNSPECIFIED,
            attention_message: String::from("NOT AN ATTACK (network measurement research)"),
            timeout: Duration::from_secs(2),
            probe_regulating_period: Duration::from_millis(50),
            retry_delay: Duration::from_millis(500),
            max_retries: 1,
            probing_thread_delay: Duration::from_millis(100),
            start_ttl: TimeToLive(1),
            fixed_flow: false,
            display_mode: DisplayMode::Silent,
            thread_count: 8,
            icmp_id_range: (TraceId(0x4000), TraceId(0x7FFF)),
            icmp_seq_range: (Sequence(1), Sequence(0x7FFF)),
            udp_dest_port: Port(33434),
        }
    }
}

/// Process-wide state shared by the scheduler and every worker: the scan
/// configuration, the emergency-stop flag, the console stream and the probe
/// totals, the last three each behind their own lock.
#[derive(Debug)]
pub struct Environment {
    config: ScanConfig,
    stopped: Mutex<bool>,
    console: Mutex<()>,
    probe_totals: Mutex<ProbeStats>,
}

impl Environment {
    #[must_use]
    pub fn new(config: ScanConfig) -> Self {
        Self {
            config,
            stopped: Mutex::new(false),
            console: Mutex::new(()),
            probe_totals: Mutex::new(ProbeStats::default()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Raise the emergency stop.  The flag is raise-only within a run.
    pub fn trigger_stop(&self) {
        *self.stopped.lock() = true;
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Print a message atomically with respect to other workers.
    pub fn console_print(&self, message: &str) {
        let _guard = self.console.lock();
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(message.as_bytes());
        let _ = stdout.flush();
    }

    /// Merge the counters of a retiring prober into the run totals.
    pub fn record_probe_stats(&self, stats: ProbeStats) {
        *self.probe_totals.lock() += stats;
    }

    #[must_use]
    pub fn probe_totals(&self) -> ProbeStats {
        *self.probe_totals.lock()
    }
}
