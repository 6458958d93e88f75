use crate::scanning::entry::{IpEntry, RouteHop};
use crate::scanning::env::{DisplayMode, Environment};
use crate::scanning::error::ScanResult;
use crate::scanning::probe::ProbeOutcome;
use crate::scanning::retry::RetryingProber;
use crate::scanning::types::TimeToLive;
use crate::scanning::Prober;
use std::fmt::Write;
use std::thread;
use tracing::debug;

/// Forward probing gives up after this many consecutive anonymous replies.
pub const MAX_CONSECUTIVE_ANONYMOUS_HOPS: u8 = 4;

/// Forward probing never exceeds this TTL.
pub const MAX_TTL_ALLOWED: u8 = 48;

/// Resolves the minimum TTL, the route and the trail of each target of an
/// ordered sub-list.
///
/// Consecutive targets of a sub-list are close address-wise and therefore
/// likely to sit at a similar distance, so the first probe of a target is
/// sent at the TTL discovered for the previous one rather than restarting a
/// full traceroute-like sweep.
pub struct LocationWorker<'e, P: Prober> {
    env: &'e Environment,
    prober: RetryingProber<P>,
    show_details: bool,
    debug_mode: bool,
    log: String,
}

impl<'e, P: Prober> LocationWorker<'e, P> {
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

    /// Process the sub-list in order, carrying each discovered TTL over to
    /// the next target.
    pub fn run<'t>(&mut self, targets: impl IntoIterator<Item = &'t mut IpEntry>) {
        let mut prev_ttl = TimeToLive(0);
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
                let _ = writeln!(self.log, "Locating {}...", target.addr());
            }
            let start_ttl = if prev_ttl.0 == 0 {
                if self.show_details {
                    let _ = writeln!(
                        self.log,
                        "Will conduct full forward probing (first TTL = {}).",
                        self.env.config().start_ttl,
                    );
                }
                self.env.config().start_ttl
            } else {
                if self.show_details {
                    let _ = writeln!(
                        self.log,
                        "Will first probe the target at the TTL of the previous target (TTL = {prev_ttl}).",
                    );
                }
                prev_ttl
            };
            match self.locate(target, start_ttl) {
                Ok(true) => {
                    if self.show_details {
                        let partial = if target.has_complete_route() {
                            ""
                        } else {
                            " (partial)"
                        };
                        let _ = writeln!(
                            self.log,
                            "\nDiscovered route{partial}:\n{}",
                            target.route_to_string(),
                        );
                    }
                    prev_ttl = target.ttl().unwrap_or(TimeToLive(0));
                }
                Ok(false) => {
                    if self.show_details {
                        let _ = writeln!(
                            self.log,
                            "Reached the maximum TTL ({MAX_TTL_ALLOWED}) or too many consecutive \
                             anonymous hops ({MAX_CONSECUTIVE_ANONYMOUS_HOPS}). Skipping this target.\n",
                        );
                    }
                }
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

    /// Locate a single target: forward probing, conditional backward
    /// probing, then trail assembly.  False means the target was skipped.
    fn locate(&mut self, target: &mut IpEntry, start_ttl: TimeToLive) -> ScanResult<bool> {
        if !self.forward_probing(target, start_ttl)? {
            return Ok(false);
        }
        let found_ttl = target.ttl().unwrap_or(TimeToLive(0));
        if self.show_details {
            let _ = writeln!(
                self.log,
                "{} first replied at TTL = {found_ttl}.",
                target.addr(),
            );
        }
        let reply_at_start_ttl = found_ttl == start_ttl && found_ttl.0 > 1;
        let problematic_ending = target.anonymous_end_of_route();
        if reply_at_start_ttl || problematic_ending {
            if self.show_details {
                let reason = if reply_at_start_ttl {
                    "the discovered TTL equals the initial probing TTL"
                } else {
                    "the last hop of the discovered route is anonymous"
                };
                let _ = writeln!(self.log, "Will probe backwards: {reason}.");
            }
            let adjusted = self.backward_probing(target)?;
            if self.show_details {
                if adjusted {
                    let new_ttl = target.ttl().unwrap_or(TimeToLive(0));
                    if new_ttl == found_ttl {
                        let _ = writeln!(self.log, "Minimum TTL was correct from the start.");
                    } else {
                        let _ = writeln!(self.log, "Corrected TTL is {new_ttl}.");
                    }
                } else {
                    let _ = writeln!(
                        self.log,
                        "Couldn't probe backwards because of a timeout.",
                    );
                }
            }
        }
        self.assemble_trail(target)?;
        Ok(true)
    }

    /// Probe at increasing TTL until the target itself replies, collecting
    /// the intermediate routers into the route.
    ///
    /// Gives up after [`MAX_CONSECUTIVE_ANONYMOUS_HOPS`] timeouts in a row
    /// or past [`MAX_TTL_ALLOWED`].
    fn forward_probing(&mut self, target: &mut IpEntry, init_ttl: TimeToLive) -> ScanResult<bool> {
        let mut probe_ttl = i16::from(init_ttl.0);
        let mut consecutive_anonymous: u8 = 0;
        let mut collected: Vec<RouteHop> = Vec::new();
        let found_ttl = loop {
            if probe_ttl > i16::from(MAX_TTL_ALLOWED) {
                return Ok(false);
            }
            let outcome = self.probe(target, TimeToLive(probe_ttl as u8))?;
            if outcome.is_timeout() {
                consecutive_anonymous += 1;
                if consecutive_anonymous >= MAX_CONSECUTIVE_ANONYMOUS_HOPS {
                    return Ok(false);
                }
            } else {
                consecutive_anonymous = 0;
            }
            if outcome.is_echo_reply() {
                break TimeToLive(probe_ttl as u8);
            }
            collected.push(RouteHop::from_outcome(&outcome));
            probe_ttl += 1;
        };
        debug!(target = %target.addr(), ttl = found_ttl.0, "target located");
        target.set_ttl(found_ttl);
        if found_ttl.0 == 1 {
            return Ok(true);
        }
        target.init_route();
        let route_len = target.route().len();
        let mut hops = collected.into_iter();
        for index in (usize::from(init_ttl.0) - 1)..route_len {
            // A restarted sweep can leave the tail short; missing hops stay
            // unset and count as anomalies downstream.
            let hop = hops.next().unwrap_or(RouteHop::Unset);
            target.set_hop(index, hop);
        }
        Ok(true)
    }

    /// Probe at decreasing TTL while the target keeps replying, to find the
    /// true minimum.  False means a timeout interrupted the walk and the
    /// state is left as is.
    fn backward_probing(&mut self, target: &mut IpEntry) -> ScanResult<bool> {
        let Some(init_ttl) = target.ttl() else {
            return Ok(false);
        };
        let mut probe_ttl = i16::from(init_ttl.0) - 1;
        while probe_ttl > 0 {
            let outcome = self.probe(target, TimeToLive(probe_ttl as u8))?;
            if outcome.is_timeout() {
                return Ok(false);
            }
            if outcome.is_time_exceeded() {
                break;
            }
            probe_ttl -= 1;
        }
        probe_ttl += 1; // minimum TTL to reach the target
        let corrected = TimeToLive(probe_ttl as u8);
        if corrected == init_ttl {
            return Ok(true);
        }
        target.set_ttl(corrected);
        target.init_route();
        Ok(true)
    }

    /// Compute the trail, filling the route backwards one hop at a time
    /// when the hops needed for the computation are still unset.
    fn assemble_trail(&mut self, target: &mut IpEntry) -> ScanResult<()> {
        if target.route().is_empty() {
            target.set_trail();
            return Ok(());
        }
        let route = target.route();
        let mut first_measured = 0;
        while first_measured < route.len() && route[first_measured].is_unset() {
            first_measured += 1;
        }
        if first_measured == 0 {
            target.set_trail();
            return Ok(());
        }
        let mut index = first_measured as isize - 1;
        while !target.set_trail() && index >= 0 {
            let probe_ttl = TimeToLive((index + 1) as u8);
            let outcome = self.probe(target, probe_ttl)?;
            target.set_hop(index as usize, RouteHop::from_outcome(&outcome));
            index -= 1;
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

impl<P: Prober> Drop for LocationWorker<'_, P> {
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

    fn test_env(start_ttl: u8) -> Environment {
        Environment::new(ScanConfig {
            start_ttl: TimeToLive(start_ttl),
            retry_delay: Duration::ZERO,
            probing_thread_delay: Duration::ZERO,
            max_retries: 1,
            ..ScanConfig::default()
        })
    }

    /// Forward probing alone discovers a target five hops away.
    #[test]
    fn test_full_forward_probing() {
        let env = test_env(1);
        let sim = SimulatedProber::new();
        for ttl in 1..=4 {
            sim.on(TARGET, ttl, SimReply::TimeExceeded(router(ttl)));
        }
        sim.on(TARGET, 5, SimReply::Echo);
        let journal = sim.journal();
        let mut target = IpEntry::new(TARGET);
        let mut worker = LocationWorker::new(&env, sim);
        worker.run(std::iter::once(&mut target));

        assert_eq!(Some(TimeToLive(5)), target.ttl());
        assert_eq!(4, target.route().len());
        assert_eq!(Some(router(4)), target.route()[3].addr());
        let trail = target.trail().expect("trail");
        assert_eq!(router(4), trail.addr());
        assert_eq!(0, trail.nb_anomalies());
        // No backward probing and no extra trail probes were needed.
        assert_eq!(5, journal.lock().len());
    }

    /// An Echo Reply on the very first probe triggers backward probing
    /// which confirms the minimum.
    #[test]
    fn test_backward_probing_confirms_minimum() {
        let env = test_env(3);
        let sim = SimulatedProber::new();
        sim.on(TARGET, 3, SimReply::Echo);
        sim.on(TARGET, 2, SimReply::TimeExceeded(router(2)));
        let mut target = IpEntry::new(TARGET);
        let mut worker = LocationWorker::new(&env, sim);
        worker.run(std::iter::once(&mut target));

        assert_eq!(Some(TimeToLive(3)), target.ttl());
        assert_eq!(2, target.route().len());
        // Trail assembly re-probed TTL 2 to fill the route.
        let trail = target.trail().expect("trail");
        assert_eq!(router(2), trail.addr());
    }

    /// An Echo Reply at an overestimated starting TTL walks back down to
    /// the true minimum.
    #[test]
    fn test_backward_probing_lowers_ttl() {
        let env = test_env(5);
        let sim = SimulatedProber::new();
        for ttl in 3..=5 {
            sim.on(TARGET, ttl, SimReply::Echo);
        }
        sim.on(TARGET, 2, SimReply::TimeExceeded(router(2)));
        sim.on(TARGET, 1, SimReply::TimeExceeded(router(1)));
        let mut target = IpEntry::new(TARGET);
        let mut worker = LocationWorker::new(&env, sim);
        worker.run(std::iter::once(&mut target));

        assert_eq!(Some(TimeToLive(3)), target.ttl());
        assert_eq!(2, target.route().len());
        let trail = target.trail().expect("trail");
        assert_eq!(router(2), trail.addr());
    }

    /// The TTL of a located target seeds the probing of the next one.
    #[test]
    fn test_ttl_carries_over_to_next_target() {
        let second = Ipv4Addr::new(198, 51, 100, 8);
        let env = test_env(1);
        let sim = SimulatedProber::new();
        for ttl in 1..=6 {
            sim.on(TARGET, ttl, SimReply::TimeExceeded(router(ttl)));
        }
        sim.on(TARGET, 7, SimReply::Echo);
        sim.on(second, 7, SimReply::Echo);
        sim.on(second, 6, SimReply::TimeExceeded(router(66)));
        let journal = sim.journal();
        let mut targets = vec![IpEntry::new(TARGET), IpEntry::new(second)];
        let mut worker = LocationWorker::new(&env, sim);
        worker.run(targets.iter_mut());

        assert_eq!(Some(TimeToLive(7)), targets[0].ttl());
        assert_eq!(Some(TimeToLive(7)), targets[1].ttl());
        assert_eq!(router(66), targets[1].trail().expect("trail").addr());
        // The first probe aimed at the second target reused TTL 7.
        let first_for_second = journal
            .lock()
            .iter()
            .find(|entry| entry.dst == second)
            .copied()
            .expect("second target probed");
        assert_eq!(7, first_for_second.ttl);
    }

    /// Four consecutive anonymous hops abort the target.
    #[test]
    fn test_consecutive_anonymous_hops_abort() {
        let env = test_env(1);
        let sim = SimulatedProber::new();
        let journal = sim.journal();
        let mut target = IpEntry::new(TARGET);
        let mut worker = LocationWorker::new(&env, sim);
        worker.run(std::iter::once(&mut target));

        assert_eq!(None, target.ttl());
        assert!(target.route().is_empty());
        assert!(target.trail().is_none());
        assert_eq!(
            usize::from(MAX_CONSECUTIVE_ANONYMOUS_HOPS),
            journal.lock().len()
        );
    }

    /// A timeout during the backward walk leaves the state as discovered.
    #[test]
    fn test_backward_timeout_keeps_state() {
        let env = test_env(4);
        let sim = SimulatedProber::new();
        sim.on(TARGET, 4, SimReply::Echo);
        // TTL 3 is unscripted and therefore times out.
        sim.on(TARGET, 2, SimReply::TimeExceeded(router(2)));
        sim.on(TARGET, 1, SimReply::TimeExceeded(router(1)));
        let mut target = IpEntry::new(TARGET);
        let mut worker = LocationWorker::new(&env, sim);
        worker.run(std::iter::once(&mut target));

        assert_eq!(Some(TimeToLive(4)), target.ttl());
        // Trail assembly still fills hops backwards until a trail settles.
        let trail = target.trail().expect("trail");
        assert_eq!(router(2), trail.addr());
        assert_eq!(1, trail.nb_anomalies());
    }

    /// A target one hop away has an empty route and itself as trail.
    #[test]
    fn test_one_hop_target() {
        let env = test_env(1);
        let sim = SimulatedProber::new();
        sim.on(TARGET, 1, SimReply::Echo);
        let mut target = IpEntry::new(TARGET);
        let mut worker = LocationWorker::new(&env, sim);
        worker.run(std::iter::once(&mut target));

        assert_eq!(Some(TimeToLive(1)), target.ttl());
        assert!(target.route().is_empty());
        let trail = target.trail().expect("trail");
        assert_eq!(TARGET, trail.addr());
        assert_eq!(0, trail.nb_anomalies());
    }

    /// The preferred timeout of a target raises the prober timeout for its
    /// probes only.
    #[test]
    fn test_preferred_timeout_is_scoped_to_the_target() {
        let second = Ipv4Addr::new(198, 51, 100, 8);
        let env = test_env(1);
        let sim = SimulatedProber::new();
        sim.on(TARGET, 1, SimReply::Echo);
        sim.on(second, 1, SimReply::Echo);
        let journal = sim.journal();
        let mut targets = vec![
            IpEntry::new(TARGET).with_preferred_timeout(Duration::from_secs(5)),
            IpEntry::new(second),
        ];
        let mut worker = LocationWorker::new(&env, sim);
        worker.run(targets.iter_mut());

        let journal = journal.lock();
        let slow = journal.iter().find(|e| e.dst == TARGET).expect("first");
        let fast = journal.iter().find(|e| e.dst == second).expect("second");
        assert_eq!(Duration::from_secs(5), slow.timeout);
        assert_eq!(Duration::from_secs(2), fast.timeout);
    }

    /// A socket failure raises the emergency stop and ends the worker.
    #[test]
    fn test_socket_error_raises_emergency_stop() {
        let second = Ipv4Addr::new(198, 51, 100, 8);
        let env = test_env(1);
        let sim = SimulatedProber::new();
        sim.on(TARGET, 1, SimReply::SocketError);
        sim.on(second, 1, SimReply::Echo);
        let mut targets = vec![IpEntry::new(TARGET), IpEntry::new(second)];
        let mut worker = LocationWorker::new(&env, sim);
        worker.run(targets.iter_mut());

        assert!(env.is_stopped());
        assert_eq!(None, targets[1].ttl());
    }
}
