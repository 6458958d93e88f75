use anyhow::{anyhow, ensure, Context};
use clap::{Parser, ValueEnum};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use trailscan::scanning::locate::MAX_TTL_ALLOWED;
use trailscan::scanning::{DisplayMode, IpEntry, ProbingProtocol};

/// The maximum number of concurrent probing workers we allow.
const MAX_THREADS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    Icmp,
    Udp,
    Tcp,
}

impl From<Protocol> for ProbingProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Icmp => Self::Icmp,
            Protocol::Udp => Self::Udp,
            Protocol::Tcp => Self::Tcp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Display {
    Silent,
    Verbose,
    Debug,
}

impl From<Display> for DisplayMode {
    fn from(display: Display) -> Self {
        match display {
            Display::Silent => Self::Silent,
            Display::Verbose => Self::SlightlyVerbose,
            Display::Debug => Self::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Table,
    Json,
    Stream,
}

#[derive(Parser, Debug)]
#[command(name = "tscan", about = "Scan targets for TTL distances, routes and trails", version)]
pub struct Args {
    /// File with one target IPv4 address per line, optionally followed by a
    /// preferred timeout (e.g. `198.51.100.7 4s`).
    pub targets_file: PathBuf,

    /// The protocol carrying the probes.
    #[arg(long, value_enum, default_value_t = Protocol::Icmp)]
    pub protocol: Protocol,

    /// The source address; discovered from the routing table when omitted.
    #[arg(long)]
    pub local_ip: Option<Ipv4Addr>,

    /// Probe payload identifying the tool to remote operators.
    #[arg(long, default_value = "NOT AN ATTACK (network measurement research)")]
    pub attention_message: String,

    /// The base reply timeout of a probe.
    #[arg(long, default_value = "2s")]
    pub timeout: String,

    /// The pause between consecutive probes of one worker.
    #[arg(long, default_value = "50ms")]
    pub probe_regulating_period: String,

    /// The pause before re-probing after a timeout.
    #[arg(long, default_value = "500ms")]
    pub retry_delay: String,

    /// Total attempts per probe, timeouts included.
    #[arg(long, default_value_t = 1)]
    pub max_retries: u16,

    /// The pause between consecutive targets of one worker.
    #[arg(long, default_value = "100ms")]
    pub probing_thread_delay: String,

    /// The TTL of the first probe when no neighbouring TTL is known.
    #[arg(long, default_value_t = 1)]
    pub start_ttl: u8,

    /// The number of concurrent probing workers.
    #[arg(long, default_value_t = 8)]
    pub threads: usize,

    /// Keep the flow identifiers of probes fixed (Paris-style) everywhere.
    #[arg(long)]
    pub fixed_flow: bool,

    /// How much probing detail is printed while scanning.
    #[arg(long, value_enum, default_value_t = Display::Silent)]
    pub display: Display,

    /// Destination port of UDP and TCP probes.
    #[arg(long, default_value_t = 33434)]
    pub udp_dest_port: u16,

    /// Inclusive ICMP identifier bounds, as `lo:hi`.
    #[arg(long, default_value = "16384:32767")]
    pub icmp_id_range: String,

    /// Inclusive ICMP sequence bounds, as `lo:hi`.
    #[arg(long, default_value = "1:32767")]
    pub icmp_seq_range: String,

    /// Output format of the final report.
    #[arg(long, value_enum, default_value_t = Mode::Table)]
    pub mode: Mode,
}

pub fn validate_start_ttl(start_ttl: u8) {
    if start_ttl < 1 || start_ttl > MAX_TTL_ALLOWED {
        eprintln!("start-ttl must be in the range 1..{MAX_TTL_ALLOWED}");
        std::process::exit(1);
    }
}

pub fn validate_thread_count(threads: usize) {
    if threads < 1 || threads > MAX_THREADS {
        eprintln!("threads must be in the range 1..{MAX_THREADS}");
        std::process::exit(1);
    }
}

pub fn validate_max_retries(max_retries: u16) {
    if max_retries < 1 {
        eprintln!("max-retries must be at least 1");
        std::process::exit(1);
    }
}

/// Parse an inclusive `lo:hi` bounds argument.
pub fn parse_range(range: &str) -> anyhow::Result<(u16, u16)> {
    let (lo, hi) = range
        .split_once(':')
        .ok_or_else(|| anyhow!("expected bounds as lo:hi, got {range}"))?;
    let lo: u16 = lo.trim().parse().context("invalid lower bound")?;
    let hi: u16 = hi.trim().parse().context("invalid upper bound")?;
    ensure!(lo <= hi, "bounds are inverted: {lo} > {hi}");
    Ok((lo, hi))
}

/// Read the target entries from a file.
pub fn load_targets(path: &Path) -> anyhow::Result<Vec<IpEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read targets from {}", path.display()))?;
    let entries = parse_targets(&content)?;
    ensure!(!entries.is_empty(), "no targets in {}", path.display());
    Ok(entries)
}

fn parse_targets(content: &str) -> anyhow::Result<Vec<IpEntry>> {
    let mut entries = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let addr: Ipv4Addr = fields
            .next()
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("invalid target address on line {}", number + 1))?;
        let mut entry = IpEntry::new(addr);
        if let Some(timeout) = fields.next() {
            let timeout = humantime::parse_duration(timeout)
                .with_context(|| format!("invalid preferred timeout on line {}", number + 1))?;
            entry = entry.with_preferred_timeout(timeout);
        }
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_range() {
        assert_eq!((100, 200), parse_range("100:200").unwrap());
        assert_eq!((7, 7), parse_range("7:7").unwrap());
        assert!(parse_range("200:100").is_err());
        assert!(parse_range("100").is_err());
        assert!(parse_range("a:b").is_err());
    }

    #[test]
    fn test_parse_targets() {
        let content = "\
# probe these
198.51.100.7
198.51.100.8 4s

203.0.113.1 250ms
";
        let entries = parse_targets(content).unwrap();
        assert_eq!(3, entries.len());
        assert_eq!(None, entries[0].preferred_timeout());
        assert_eq!(Some(Duration::from_secs(4)), entries[1].preferred_timeout());
        assert_eq!(
            Some(Duration::from_millis(250)),
            entries[2].preferred_timeout()
        );
    }

    #[test]
    fn test_parse_targets_rejects_bad_address() {
        assert!(parse_targets("not-an-address\n").is_err());
    }
}
