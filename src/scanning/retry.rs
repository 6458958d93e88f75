use crate::scanning::error::ScanResult;
use crate::scanning::probe::{ProbeOutcome, ProbeStats};
use crate::scanning::types::TimeToLive;
use crate::scanning::Prober;
use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

/// Wraps a prober with a bounded retry loop for timeouts.
///
/// Shared by the location and trail-correction workers.  Fixed flow is
/// always used here (Paris-style) to keep the probed path stable; socket
/// errors are re-thrown without retry.
pub struct RetryingProber<P> {
    prober: P,
    max_retries: u16,
    retry_delay: Duration,
}

impl<P: Prober> RetryingProber<P> {
    pub fn new(prober: P, max_retries: u16, retry_delay: Duration) -> Self {
        Self {
            prober,
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    /// Probe `dst` at `ttl`, retrying timeouts up to the configured number
    /// of attempts.
    pub fn probe(&mut self, dst: Ipv4Addr, ttl: TimeToLive) -> ScanResult<ProbeOutcome> {
        let mut outcome = ProbeOutcome::Timeout;
        for attempt in 0..self.max_retries {
            outcome = self.prober.single_probe(dst, ttl, true)?;
            if !outcome.is_timeout() {
                break;
            }
            if attempt + 1 < self.max_retries {
                thread::sleep(self.retry_delay);
            }
        }
        Ok(outcome)
    }

    pub fn timeout(&self) -> Duration {
        self.prober.timeout()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.prober.set_timeout(timeout);
    }

    pub fn take_log(&mut self) -> String {
        self.prober.take_log()
    }

    pub fn stats(&self) -> ProbeStats {
        self.prober.stats()
    }
}
