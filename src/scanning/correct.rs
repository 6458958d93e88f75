use crate::scanning::entry::{IpEntry, RouteHop};
use crate::scanning::env::{DisplayMode, Environment};
use crate::scanning::error::ScanResult;
use crate::scanning::probe::{IcmpPacketType, ProbeOutcome};
use crate::scanning::retry::RetryingProber;
use crate::scanning::types::TimeToLive;
use crate::scanning::Prober;
use std::fmt::Write;
use std::thread;
use tracing::debug;

/// Re-probes targets whose trail contains anomalies at decreasing TTLs,
/// replacing anonymous or cycled hops with resolved ones and lowering the
/// TTL when it turns out to have been overestimated.
///
/// Re-probing only needs to cover as many TTLs back as there are
/// outstanding anomalies, so the loop guard shrinks as the walk descends
/// and the pass terminates even when some hops stay anonymous.
pub struct TrailCorrectionWorker<'e, P: Prober> {
    env: &'e Environment,
    prober: RetryingProber<P>,
    show_details: bool,
    debug_mode: bool,
    log: String,
}

impl<'e, P: Prober> TrailCorrectionWorker<'e, P> {
    pub fn new(env: &'e Environment, prober: P) -> Self {
        let config = env.config();
        Self {
            env,
            prober: RetryingProber::new(prober, config.max_retries, config.retry_delay),
            show_details: config.display_mode >= DisplayMode::SlightlyVerbose,
            debug_mode: config.display_mode >= DisplayMode::Debug,
            log: String::new(),
        }
    }

    pub fn run<'t>(&mut self, targets: impl IntoIterator<Item = &'t mut IpEntry>) {
        for target in targets {
            if self.env.is_stopped() {
                break;
            }
            let initial_timeout = self.prober.timeout();
            let timeout_changed = match target.preferred_timeout() {
                Some(preferred) if preferred > initial_timeout => {
                    self.prober.set_timeout(preferred);
                    true
                }
                _ => false,
            };
            if self.show_details {
                let _ = writeln!(self.log, "Trying to fix the trail of {}...", target.addr());
            }
            match self.correct(target) {
                Ok(()) => {}
                Err(err) => {
                    self.env.trigger_stop();
                    self.env
                        .console_print(&format!("Probing failed ({err}); emergency stop.\n"));
                    return;
                }
            }
            if timeout_changed {
                self.prober.set_timeout(initial_timeout);
            }
            thread::sleep(self.env.config().probing_thread_delay);
        }
        self.flush_log();
    }

    fn correct(&mut self, target: &mut IpEntry) -> ScanResult<()> {
        let Some(init_ttl) = target.ttl() else {
            return Ok(());
        };
        let nb_anomalies = target.nb_anomalies() as i16;
        let mut probe_ttl = i16::from(init_ttl.0) - 1;
        let mut changed_ttl = false;
        while probe_ttl >= 1 && nb_anomalies >= i16::from(init_ttl.0) - probe_ttl {
            let outcome = self.probe(target, TimeToLive(probe_ttl as u8))?;
            match outcome {
                ProbeOutcome::Reply(record) if record.kind == IcmpPacketType::EchoReply => {
                    // The target replied below its registered distance: the
                    // TTL was overestimated.
                    target.set_ttl(TimeToLive(probe_ttl as u8));
                    target.truncate_route();
                    changed_ttl = true;
                    if self.show_details {
                        let _ = writeln!(
                            self.log,
                            "Got an echo reply at TTL = {probe_ttl}, meaning the TTL distance \
                             was overestimated.",
                        );
                    }
                }
                ProbeOutcome::Reply(record) if record.kind == IcmpPacketType::TimeExceeded => {
                    target.set_hop(
                        probe_ttl as usize - 1,
                        RouteHop::from_outcome(&outcome),
                    );
                    if self.show_details {
                        let _ = writeln!(
                            self.log,
                            "Found a non-anonymous interface at TTL = {probe_ttl}: {}.",
                            record.reply_addr,
                        );
                    }
                }
                _ => {} // timeout or unreachable: leave the hop as is
            }
            probe_ttl -= 1;
        }
        let settled = target.set_trail();
        debug!(target = %target.addr(), settled, "trail recomputed");
        if self.show_details {
            if changed_ttl {
                let _ = writeln!(
                    self.log,
                    "New TTL for {} is {}.",
                    target.addr(),
                    target.ttl().unwrap_or(TimeToLive(0)),
                );
            }
            if let Some(trail) = target.trail() {
                let _ = writeln!(self.log, "New trail for {} is {}.", target.addr(), trail.addr());
            }
        }
        Ok(())
    }

    fn probe(&mut self, target: &IpEntry, ttl: TimeToLive) -> ScanResult<ProbeOutcome> {
        let outcome = self.prober.probe(target.addr(), ttl)?;
        if self.debug_mode {
            self.log.push_str(&self.prober.take_log());
        }
        Ok(outcome)
    }

    fn flush_log(&mut self) {
        if self.show_details {
            let log = std::mem::take(&mut self.log);
            self.env.console_print(&log);
        }
    }
}

impl<P: Prober> Drop for TrailCorrectionWorker<'_, P> {
    fn drop(&mut self) {
        self.env.record_probe_stats(self.prober.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanning::env::ScanConfig;
    use crate::scanning::sim::{SimReply, SimulatedProber};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const TARGET: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

    fn router(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn test_env() -> Environment {
        Environment::new(ScanConfig {
            retry_delay: Duration::ZERO,
            probing_thread_delay: Duration::ZERO,
            max_retries: 1,
            ..ScanConfig::default()
        })
    }

    fn resolved(last: u8) -> RouteHop {
        RouteHop::Resolved {
            addr: router(last),
            kind: IcmpPacketType::TimeExceeded,
            rtt: Duration::from_millis(10),
        }
    }

    /// Target at TTL 10 with two anomalies: TTL 9 stays anonymous, TTL 8
    /// resolves, and the shrinking guard ends the loop at TTL 7.
    #[test]
    fn test_correction_replaces_anomalous_hops() {
        let env = test_env();
        let mut target = IpEntry::new(TARGET);
        target.set_ttl(TimeToLive(10));
        target.init_route();
        for index in 0..7 {
            target.set_hop(index, resolved(index as u8 + 1));
        }
        // Hops at TTL 8 and 9 are anonymous.
        target.set_hop(7, RouteHop::Anonymous);
        target.set_hop(8, RouteHop::Anonymous);
        assert!(target.set_trail());
        assert_eq!(2, target.nb_anomalies());

        let sim = SimulatedProber::new();
        // TTL 9 unscripted (stays anonymous), TTL 8 resolves.
        sim.on(TARGET, 8, SimReply::TimeExceeded(router(88)));
        let journal = sim.journal();
        let mut worker = TrailCorrectionWorker::new(&env, sim);
        worker.run(std::iter::once(&mut target));

        // Probes went to TTL 9 and 8 only: at TTL 7 the guard 2 >= 3 fails.
        let probed: Vec<u8> = journal.lock().iter().map(|e| e.ttl).collect();
        assert_eq!(vec![9, 8], probed);
        assert_eq!(Some(router(88)), target.route()[7].addr());
        let trail = target.trail().expect("trail");
        assert_eq!(router(88), trail.addr());
        assert_eq!(1, trail.nb_anomalies());
        assert_eq!(Some(TimeToLive(10)), target.ttl());
    }

    /// An Echo Reply during correction lowers the TTL and the route length
    /// with it.
    #[test]
    fn test_correction_lowers_overestimated_ttl() {
        let env = test_env();
        let mut target = IpEntry::new(TARGET);
        target.set_ttl(TimeToLive(5));
        target.init_route();
        target.set_hop(0, resolved(1));
        target.set_hop(1, resolved(2));
        target.set_hop(2, RouteHop::Anonymous);
        target.set_hop(3, RouteHop::Anonymous);
        assert!(target.set_trail());
        assert_eq!(2, target.nb_anomalies());

        let sim = SimulatedProber::new();
        sim.on(TARGET, 4, SimReply::Echo);
        sim.on(TARGET, 3, SimReply::TimeExceeded(router(3)));
        let mut worker = TrailCorrectionWorker::new(&env, sim);
        worker.run(std::iter::once(&mut target));

        assert_eq!(Some(TimeToLive(4)), target.ttl());
        assert_eq!(3, target.route().len());
        let trail = target.trail().expect("trail");
        assert_eq!(router(3), trail.addr());
        assert_eq!(0, trail.nb_anomalies());
    }

    /// Correction never increases the TTL and never increases the anomaly
    /// count.
    #[test]
    fn test_correction_monotonicity() {
        let env = test_env();
        let mut target = IpEntry::new(TARGET);
        target.set_ttl(TimeToLive(6));
        target.init_route();
        target.set_hop(0, resolved(1));
        for index in 1..5 {
            target.set_hop(index, RouteHop::Anonymous);
        }
        assert!(target.set_trail());
        let anomalies_before = target.nb_anomalies();

        // Nothing is scripted: every correction probe times out.
        let sim = SimulatedProber::new();
        let mut worker = TrailCorrectionWorker::new(&env, sim);
        worker.run(std::iter::once(&mut target));

        assert_eq!(Some(TimeToLive(6)), target.ttl());
        assert!(target.nb_anomalies() <= anomalies_before);
        assert!(target.trail().is_some());
    }

    /// An entry located but left without any trail is rebuilt whole.
    #[test]
    fn test_correction_rebuilds_missing_trail() {
        let env = test_env();
        let mut target = IpEntry::new(TARGET);
        target.set_ttl(TimeToLive(4));
        target.init_route();
        for index in 0..3 {
            target.set_hop(index, RouteHop::Anonymous);
        }
        assert!(!target.set_trail());

        let sim = SimulatedProber::new();
        sim.on(TARGET, 2, SimReply::TimeExceeded(router(2)));
        let mut worker = TrailCorrectionWorker::new(&env, sim);
        worker.run(std::iter::once(&mut target));

        let trail = target.trail().expect("trail");
        assert_eq!(router(2), trail.addr());
        assert_eq!(1, trail.nb_anomalies());
    }

    /// A socket failure raises the emergency stop.
    #[test]
    fn test_socket_error_raises_emergency_stop() {
        let env = test_env();
        let mut target = IpEntry::new(TARGET);
        target.set_ttl(TimeToLive(3));
        target.init_route();
        target.set_hop(0, resolved(1));
        target.set_hop(1, RouteHop::Anonymous);
        assert!(target.set_trail());

        let sim = SimulatedProber::new();
        sim.on(TARGET, 2, SimReply::SocketError);
        let mut worker = TrailCorrectionWorker::new(&env, sim);
        worker.run(std::iter::once(&mut target));

        assert!(env.is_stopped());
    }
}
