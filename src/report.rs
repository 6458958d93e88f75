use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use serde::Serialize;
use std::net::Ipv4Addr;
use trailscan::scanning::{IpEntry, ProbeStats, RouteHop};

/// Print the scan results as a table, followed by the candidate alias
/// groups and the probe totals.
pub fn run_report_table(entries: &[IpEntry], groups: &[Vec<Ipv4Addr>], totals: ProbeStats) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Target",
            "TTL",
            "Trail",
            "Anomalies",
            "Route",
            "Port-unreachable src",
        ]);
    for entry in entries {
        table.add_row(vec![
            entry.addr().to_string(),
            entry
                .ttl()
                .map_or_else(|| String::from("-"), |ttl| ttl.to_string()),
            entry
                .trail()
                .map_or_else(|| String::from("-"), |trail| trail.addr().to_string()),
            entry
                .trail()
                .map_or_else(|| String::from("-"), |trail| trail.nb_anomalies().to_string()),
            format_route(entry.route()),
            entry
                .alias_hints()
                .port_unreachable_src()
                .map_or_else(|| String::from("-"), |addr| addr.to_string()),
        ]);
    }
    println!("{table}");
    if groups.is_empty() {
        println!("No flickering trail addresses.");
    } else {
        println!("Candidate aliases from flickering trails:");
        for group in groups {
            let rendered: Vec<String> = group.iter().map(Ipv4Addr::to_string).collect();
            println!("  {{ {} }}", rendered.join(", "));
        }
    }
    println!("{} probes sent, {} replies matched.", totals.sent, totals.matched);
}

/// Print one line per target, cheap to grep and diff.
pub fn run_report_stream(entries: &[IpEntry], groups: &[Vec<Ipv4Addr>], totals: ProbeStats) {
    for entry in entries {
        let ttl = entry
            .ttl()
            .map_or_else(|| String::from("-"), |ttl| ttl.to_string());
        let trail = entry
            .trail()
            .map_or_else(|| String::from("-"), |trail| trail.addr().to_string());
        let anomalies = entry
            .trail()
            .map_or_else(|| String::from("-"), |trail| trail.nb_anomalies().to_string());
        let hint = entry
            .alias_hints()
            .port_unreachable_src()
            .map_or_else(|| String::from("-"), |addr| addr.to_string());
        println!(
            "{} ttl={ttl} trail={trail} anomalies={anomalies} hint={hint}",
            entry.addr(),
        );
    }
    for group in groups {
        let rendered: Vec<String> = group.iter().map(Ipv4Addr::to_string).collect();
        println!("alias {{ {} }}", rendered.join(", "));
    }
    println!("probes sent={} matched={}", totals.sent, totals.matched);
}

#[derive(Serialize)]
struct JsonReport<'a> {
    targets: &'a [IpEntry],
    alias_groups: &'a [Vec<Ipv4Addr>],
    probes: ProbeStats,
}

/// Print the scan results as a JSON document.
pub fn run_report_json(
    entries: &[IpEntry],
    groups: &[Vec<Ipv4Addr>],
    totals: ProbeStats,
) -> anyhow::Result<()> {
    let report = JsonReport {
        targets: entries,
        alias_groups: groups,
        probes: totals,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn format_route(route: &[RouteHop]) -> String {
    if route.is_empty() {
        return String::from("(direct)");
    }
    let hops: Vec<String> = route
        .iter()
        .map(|hop| match hop {
            RouteHop::Unset => String::from("?"),
            RouteHop::Anonymous => String::from("*"),
            RouteHop::Resolved { addr, .. } => addr.to_string(),
        })
        .collect();
    hops.join(" > ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use trailscan::scanning::IcmpPacketType;

    #[test]
    fn test_format_route() {
        assert_eq!("(direct)", format_route(&[]));
        let route = [
            RouteHop::Resolved {
                addr: Ipv4Addr::new(10, 0, 0, 1),
                kind: IcmpPacketType::TimeExceeded,
                rtt: Duration::from_millis(3),
            },
            RouteHop::Anonymous,
            RouteHop::Unset,
        ];
        assert_eq!("10.0.0.1 > * > ?", format_route(&route));
    }
}
