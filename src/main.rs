#![warn(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::option_if_let_else,
    clippy::missing_const_for_fn,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::redundant_pub_crate
)]
#![forbid(unsafe_code)]

use crate::config::{
    load_targets, parse_range, validate_max_retries, validate_start_ttl, validate_thread_count,
    Args, Mode,
};
use anyhow::Context;
use clap::Parser;
use trailscan::scanning::net::{discover_local_addr, ChannelFactory};
use trailscan::scanning::types::{Port, Sequence, TimeToLive, TraceId};
use trailscan::scanning::{Environment, ScanConfig, TargetScanner};

mod config;
mod report;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    ensure_net_raw()?;
    validate_start_ttl(args.start_ttl);
    validate_thread_count(args.threads);
    validate_max_retries(args.max_retries);
    let timeout = humantime::parse_duration(&args.timeout)?;
    let probe_regulating_period = humantime::parse_duration(&args.probe_regulating_period)?;
    let retry_delay = humantime::parse_duration(&args.retry_delay)?;
    let probing_thread_delay = humantime::parse_duration(&args.probing_thread_delay)?;
    let (id_lo, id_hi) = parse_range(&args.icmp_id_range)?;
    let (seq_lo, seq_hi) = parse_range(&args.icmp_seq_range)?;
    let targets = load_targets(&args.targets_file)?;
    let local_addr = match args.local_ip {
        Some(addr) => addr,
        None => discover_local_addr(targets[0].addr())
            .context("cannot discover the local address")?,
    };
    let scan_config = ScanConfig {
        protocol: args.protocol.into(),
        local_addr,
        attention_message: args.attention_message.clone(),
        timeout,
        probe_regulating_period,
        retry_delay,
        max_retries: args.max_retries,
        probing_thread_delay,
        start_ttl: TimeToLive(args.start_ttl),
        fixed_flow: args.fixed_flow,
        display_mode: args.display.into(),
        thread_count: args.threads,
        icmp_id_range: (TraceId(id_lo), TraceId(id_hi)),
        icmp_seq_range: (Sequence(seq_lo), Sequence(seq_hi)),
        udp_dest_port: Port(args.udp_dest_port),
    };
    let env = Environment::new(scan_config);
    let factory = ChannelFactory::new(&env);
    let mut scanner = TargetScanner::new(&env, factory, targets);
    scanner.scan().context("scan failed")?;
    scanner.probe_alias_ports().context("alias probing failed")?;
    scanner.finalize();
    let totals = env.probe_totals();
    match args.mode {
        Mode::Table => report::run_report_table(scanner.targets(), scanner.alias_groups(), totals),
        Mode::Json => report::run_report_json(scanner.targets(), scanner.alias_groups(), totals)?,
        Mode::Stream => {
            report::run_report_stream(scanner.targets(), scanner.alias_groups(), totals);
        }
    }
    anyhow::ensure!(!env.is_stopped(), "scan aborted by emergency stop");
    Ok(())
}

#[cfg(target_os = "linux")]
fn ensure_net_raw() -> anyhow::Result<()> {
    use caps::{CapSet, Capability};
    let permitted = caps::has_cap(None, CapSet::Effective, Capability::CAP_NET_RAW)
        .context("cannot inspect the process capabilities")?;
    anyhow::ensure!(
        permitted,
        "raw sockets require the CAP_NET_RAW capability (or root)"
    );
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn ensure_net_raw() -> anyhow::Result<()> {
    Ok(())
}
