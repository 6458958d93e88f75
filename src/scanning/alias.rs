use crate::scanning::entry::IpEntry;
use crate::scanning::env::Environment;
use crate::scanning::probe::{IcmpPacketType, ProbeOutcome, PORT_UNREACHABLE};
use crate::scanning::types::TimeToLive;
use crate::scanning::Prober;
use tracing::debug;

/// The TTL of the alias side-probe, high enough to reach any target.
pub const ALIAS_PROBE_TTL: TimeToLive = TimeToLive(64);

/// Sends one UDP probe per target to an unusual high port.
///
/// A router answering on behalf of the target with ICMP Port Unreachable
/// may do so from another of its interfaces; that source address is a
/// strong alias hint and is recorded on the target entry.  No retries are
/// performed.
pub struct AliasPortWorker<'e, P: Prober> {
    env: &'e Environment,
    prober: P,
}

impl<'e, P: Prober> AliasPortWorker<'e, P> {
    pub fn new(env: &'e Environment, prober: P) -> Self {
        Self { env, prober }
    }

    /// Probe one target and record the Port Unreachable source, if any.
    pub fn run(&mut self, target: &mut IpEntry) {
        let initial_timeout = self.prober.timeout();
        let timeout_changed = match target.preferred_timeout() {
            Some(preferred) if preferred > initial_timeout => {
                self.prober.set_timeout(preferred);
                true
            }
            _ => false,
        };
        let fixed_flow = self.env.config().fixed_flow;
        match self.prober.single_probe(target.addr(), ALIAS_PROBE_TTL, fixed_flow) {
            Ok(ProbeOutcome::Reply(record))
                if record.kind == IcmpPacketType::Unreachable(PORT_UNREACHABLE) =>
            {
                debug!(target = %target.addr(), src = %record.reply_addr, "port unreachable hint");
                target
                    .alias_hints_mut()
                    .set_port_unreachable_src(record.reply_addr);
            }
            Ok(_) => {}
            Err(err) => {
                self.env.trigger_stop();
                self.env
                    .console_print(&format!("Probing failed ({err}); emergency stop.\n"));
            }
        }
        if timeout_changed {
            self.prober.set_timeout(initial_timeout);
        }
    }
}

impl<P: Prober> Drop for AliasPortWorker<'_, P> {
    fn drop(&mut self) {
        self.env.record_probe_stats(self.prober.stats());
    }
}
