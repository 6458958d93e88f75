use crate::scanning::probe::{IcmpPacketType, ProbeOutcome};
use crate::scanning::types::TimeToLive;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;

/// One hop of a route, at a given time-to-live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RouteHop {
    /// No probe was dispatched for this hop yet.
    #[default]
    Unset,
    /// The probe for this hop timed out.
    Anonymous,
    /// A router replied for this hop.
    Resolved {
        addr: Ipv4Addr,
        kind: IcmpPacketType,
        rtt: Duration,
    },
}

impl RouteHop {
    /// Project a probe outcome onto a hop.
    #[must_use]
    pub fn from_outcome(outcome: &ProbeOutcome) -> Self {
        match outcome {
            ProbeOutcome::Timeout => Self::Anonymous,
            ProbeOutcome::Reply(record) => Self::Resolved {
                addr: record.reply_addr,
                kind: record.kind,
                rtt: record.rtt,
            },
        }
    }

    /// The replying address, if the hop is resolved.
    #[must_use]
    pub const fn addr(&self) -> Option<Ipv4Addr> {
        match self {
            Self::Resolved { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }
}

/// The last non-anonymous, non-cycle router hop before a target, together
/// with the number of anomalous hops skipped to reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Trail {
    addr: Ipv4Addr,
    nb_anomalies: u16,
}

impl Trail {
    #[must_use]
    pub const fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    #[must_use]
    pub const fn nb_anomalies(&self) -> u16 {
        self.nb_anomalies
    }
}

/// Auxiliary hints used downstream by alias resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AliasHints {
    port_unreachable_src: Option<Ipv4Addr>,
}

impl AliasHints {
    /// The source of the ICMP Port Unreachable reply to the alias
    /// side-probe, when one was received.
    #[must_use]
    pub const fn port_unreachable_src(&self) -> Option<Ipv4Addr> {
        self.port_unreachable_src
    }

    pub fn set_port_unreachable_src(&mut self, addr: Ipv4Addr) {
        self.port_unreachable_src = Some(addr);
    }
}

/// One target of the scan.
///
/// Created by the pre-scanner with the address and an optional preferred
/// timeout, mutated in place by the scanning workers, then read-only for
/// downstream alias inference.
#[derive(Debug, Clone, Serialize)]
pub struct IpEntry {
    addr: Ipv4Addr,
    preferred_timeout: Option<Duration>,
    ttl: Option<TimeToLive>,
    route: Vec<RouteHop>,
    trail: Option<Trail>,
    alias_hints: AliasHints,
}

impl IpEntry {
    #[must_use]
    pub fn new(addr: Ipv4Addr) -> Self {
        Self {
            addr,
            preferred_timeout: None,
            ttl: None,
            route: Vec::new(),
            trail: None,
            alias_hints: AliasHints::default(),
        }
    }

    /// Attach the per-target timeout suggested by the pre-scanner.
    #[must_use]
    pub fn with_preferred_timeout(mut self, timeout: Duration) -> Self {
        self.preferred_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    #[must_use]
    pub const fn preferred_timeout(&self) -> Option<Duration> {
        self.preferred_timeout
    }

    /// The minimum TTL at which the target replied with an Echo Reply, if
    /// it was located.
    #[must_use]
    pub const fn ttl(&self) -> Option<TimeToLive> {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: TimeToLive) {
        self.ttl = Some(ttl);
    }

    /// Reset the route to `ttl - 1` unset hops, clearing any previous one.
    pub fn init_route(&mut self) {
        let len = self.ttl.map_or(0, TimeToLive::route_len);
        self.route.clear();
        self.route.resize(len, RouteHop::Unset);
    }

    /// Shrink the route after the TTL was lowered, keeping the length
    /// invariant `route.len() == ttl - 1`.
    pub fn truncate_route(&mut self) {
        let len = self.ttl.map_or(0, TimeToLive::route_len);
        self.route.truncate(len);
    }

    #[must_use]
    pub fn route(&self) -> &[RouteHop] {
        &self.route
    }

    /// Record a hop at `index` (TTL `index + 1`); out-of-range writes are
    /// ignored.
    pub fn set_hop(&mut self, index: usize, hop: RouteHop) {
        if let Some(slot) = self.route.get_mut(index) {
            *slot = hop;
        }
    }

    #[must_use]
    pub const fn trail(&self) -> Option<&Trail> {
        self.trail.as_ref()
    }

    /// The anomaly count driving trail correction: the trail's own count,
    /// or the whole route length when no trail could be computed at all.
    #[must_use]
    pub fn nb_anomalies(&self) -> u16 {
        self.trail.map_or_else(
            || self.route.len() as u16,
            |trail| trail.nb_anomalies(),
        )
    }

    /// Recompute the trail from the current TTL and route.
    ///
    /// For a target one hop away the trail is the target itself.  Otherwise
    /// the route is walked backward from the hop just before the target
    /// until a resolved hop is found which differs from the hop preceding
    /// it (a resolved hop equal to its predecessor is a cycle and is
    /// skipped).  Every skipped hop counts as an anomaly.  Returns false
    /// when no such hop exists within the current route.
    pub fn set_trail(&mut self) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        if ttl.0 == 1 {
            self.trail = Some(Trail {
                addr: self.addr,
                nb_anomalies: 0,
            });
            return true;
        }
        let last = ttl.route_len().min(self.route.len());
        let mut nb_anomalies = 0;
        for index in (0..last).rev() {
            if let RouteHop::Resolved { addr, .. } = self.route[index] {
                let cycle = index > 0 && self.route[index - 1].addr() == Some(addr);
                if !cycle {
                    self.trail = Some(Trail { addr, nb_anomalies });
                    return true;
                }
            }
            nb_anomalies += 1;
        }
        false
    }

    /// Whether the hop just before the target is anonymous or still unset,
    /// which makes the end of the route problematic for trail computation.
    #[must_use]
    pub fn anonymous_end_of_route(&self) -> bool {
        self.route.last().is_some_and(|hop| !hop.is_resolved())
    }

    /// Whether every hop of the route is resolved.
    #[must_use]
    pub fn has_complete_route(&self) -> bool {
        self.route.iter().all(RouteHop::is_resolved)
    }

    /// Whether the entry must be re-probed during the trail-correction
    /// phase: it was located but its trail is missing, anomalous, or built
    /// over an incomplete route.
    #[must_use]
    pub fn needs_trail_correction(&self) -> bool {
        self.ttl.is_some()
            && (self.trail.is_none() || self.nb_anomalies() > 0 || !self.has_complete_route())
    }

    #[must_use]
    pub const fn alias_hints(&self) -> &AliasHints {
        &self.alias_hints
    }

    pub fn alias_hints_mut(&mut self) -> &mut AliasHints {
        &mut self.alias_hints
    }

    /// Render the route for the verbose log, one hop per line.
    #[must_use]
    pub fn route_to_string(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (index, hop) in self.route.iter().enumerate() {
            match hop {
                RouteHop::Unset => {
                    let _ = writeln!(out, "{}: (not probed)", index + 1);
                }
                RouteHop::Anonymous => {
                    let _ = writeln!(out, "{}: *", index + 1);
                }
                RouteHop::Resolved { addr, .. } => {
                    let _ = writeln!(out, "{}: {addr}", index + 1);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanning::probe::PORT_UNREACHABLE;
    use std::time::Duration;

    fn resolved(last: u8) -> RouteHop {
        RouteHop::Resolved {
            addr: Ipv4Addr::new(10, 0, 0, last),
            kind: IcmpPacketType::TimeExceeded,
            rtt: Duration::from_millis(10),
        }
    }

    fn entry_with_route(ttl: u8, route: Vec<RouteHop>) -> IpEntry {
        let mut entry = IpEntry::new(Ipv4Addr::new(198, 51, 100, 7));
        entry.set_ttl(TimeToLive(ttl));
        entry.init_route();
        for (index, hop) in route.into_iter().enumerate() {
            entry.set_hop(index, hop);
        }
        entry
    }

    #[test]
    fn test_route_length_tracks_ttl() {
        let mut entry = IpEntry::new(Ipv4Addr::new(198, 51, 100, 7));
        entry.set_ttl(TimeToLive(5));
        entry.init_route();
        assert_eq!(4, entry.route().len());
        entry.set_ttl(TimeToLive(3));
        entry.truncate_route();
        assert_eq!(2, entry.route().len());
        entry.set_ttl(TimeToLive(1));
        entry.init_route();
        assert!(entry.route().is_empty());
    }

    #[test]
    fn test_trail_of_one_hop_target_is_itself() {
        let mut entry = IpEntry::new(Ipv4Addr::new(198, 51, 100, 7));
        entry.set_ttl(TimeToLive(1));
        entry.init_route();
        assert!(entry.set_trail());
        let trail = entry.trail().expect("trail");
        assert_eq!(Ipv4Addr::new(198, 51, 100, 7), trail.addr());
        assert_eq!(0, trail.nb_anomalies());
    }

    #[test]
    fn test_trail_on_clean_route() {
        let mut entry = entry_with_route(5, vec![resolved(1), resolved(2), resolved(3), resolved(4)]);
        assert!(entry.set_trail());
        let trail = entry.trail().expect("trail");
        assert_eq!(Ipv4Addr::new(10, 0, 0, 4), trail.addr());
        assert_eq!(0, trail.nb_anomalies());
    }

    #[test]
    fn test_trail_skips_anonymous_hops() {
        let mut entry = entry_with_route(
            5,
            vec![resolved(1), resolved(2), RouteHop::Anonymous, RouteHop::Anonymous],
        );
        assert!(entry.set_trail());
        let trail = entry.trail().expect("trail");
        assert_eq!(Ipv4Addr::new(10, 0, 0, 2), trail.addr());
        assert_eq!(2, trail.nb_anomalies());
    }

    #[test]
    fn test_trail_skips_cycles() {
        // The last hop repeats its predecessor and is skipped as a cycle.
        let mut entry = entry_with_route(4, vec![resolved(1), resolved(3), resolved(3)]);
        assert!(entry.set_trail());
        let trail = entry.trail().expect("trail");
        assert_eq!(Ipv4Addr::new(10, 0, 0, 3), trail.addr());
        assert_eq!(1, trail.nb_anomalies());
    }

    #[test]
    fn test_trail_counts_unset_as_anomalies() {
        let mut entry = entry_with_route(4, vec![resolved(1), RouteHop::Unset, RouteHop::Unset]);
        assert!(entry.set_trail());
        let trail = entry.trail().expect("trail");
        assert_eq!(Ipv4Addr::new(10, 0, 0, 1), trail.addr());
        assert_eq!(2, trail.nb_anomalies());
    }

    #[test]
    fn test_trail_unsettable_on_all_anonymous_route() {
        let mut entry = entry_with_route(4, vec![RouteHop::Anonymous; 3]);
        assert!(!entry.set_trail());
        assert!(entry.trail().is_none());
        assert_eq!(3, entry.nb_anomalies());
    }

    #[test]
    fn test_first_hop_resolved_is_a_valid_trail() {
        let mut entry = entry_with_route(3, vec![resolved(9), RouteHop::Anonymous]);
        assert!(entry.set_trail());
        assert_eq!(
            Ipv4Addr::new(10, 0, 0, 9),
            entry.trail().expect("trail").addr()
        );
    }

    #[test]
    fn test_anonymous_end_of_route() {
        let clean = entry_with_route(3, vec![resolved(1), resolved(2)]);
        assert!(!clean.anonymous_end_of_route());
        let anonymous = entry_with_route(3, vec![resolved(1), RouteHop::Anonymous]);
        assert!(anonymous.anonymous_end_of_route());
        let mut one_hop = IpEntry::new(Ipv4Addr::new(198, 51, 100, 7));
        one_hop.set_ttl(TimeToLive(1));
        one_hop.init_route();
        assert!(!one_hop.anonymous_end_of_route());
    }

    #[test]
    fn test_needs_trail_correction() {
        let mut unprobed = IpEntry::new(Ipv4Addr::new(198, 51, 100, 7));
        assert!(!unprobed.needs_trail_correction());
        unprobed.set_ttl(TimeToLive(4));
        unprobed.init_route();
        assert!(unprobed.needs_trail_correction());

        let mut clean = entry_with_route(3, vec![resolved(1), resolved(2)]);
        assert!(clean.set_trail());
        assert!(!clean.needs_trail_correction());

        let mut anomalous = entry_with_route(3, vec![resolved(1), RouteHop::Anonymous]);
        assert!(anomalous.set_trail());
        assert!(anomalous.needs_trail_correction());
    }

    #[test]
    fn test_alias_hints() {
        let mut entry = IpEntry::new(Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(None, entry.alias_hints().port_unreachable_src());
        entry
            .alias_hints_mut()
            .set_port_unreachable_src(Ipv4Addr::new(5, 6, 7, 8));
        assert_eq!(
            Some(Ipv4Addr::new(5, 6, 7, 8)),
            entry.alias_hints().port_unreachable_src()
        );
    }

    #[test]
    fn test_hop_projection() {
        let anonymous = RouteHop::from_outcome(&ProbeOutcome::Timeout);
        assert_eq!(RouteHop::Anonymous, anonymous);
        assert_eq!(None, anonymous.addr());

        let record = crate::scanning::probe::ProbeRecord {
            reply_addr: Ipv4Addr::new(10, 0, 0, 8),
            kind: IcmpPacketType::Unreachable(PORT_UNREACHABLE),
            rtt: Duration::from_millis(3),
            dest_addr: Ipv4Addr::new(198, 51, 100, 7),
            probe_ttl: TimeToLive(8),
            key: crate::scanning::probe::ProbeKey::Icmp {
                identifier: crate::scanning::types::TraceId(1),
                sequence: crate::scanning::types::Sequence(1),
            },
        };
        let resolved = RouteHop::from_outcome(&ProbeOutcome::Reply(record));
        assert_eq!(Some(Ipv4Addr::new(10, 0, 0, 8)), resolved.addr());
    }
}
