use crate::scanning::alias::AliasPortWorker;
use crate::scanning::correct::TrailCorrectionWorker;
use crate::scanning::entry::IpEntry;
use crate::scanning::env::{DisplayMode, Environment};
use crate::scanning::error::ScanResult;
use crate::scanning::locate::LocationWorker;
use crate::scanning::types::{TimeToLive, TraceId};
use crate::scanning::{IdRange, ProberFactory, SeqRange};
use crossbeam::channel;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::thread;
use tracing::debug;

/// Splitting a re-probe list never produces a sub-list shorter than this.
pub const MIN_TARGETS_PER_LIST: usize = 4;

/// Owns the full target set and drives the scan: location workers over
/// balanced contiguous sub-lists, then trail-correction workers over the
/// entries whose trail came out anomalous, then the alias side-probe, and
/// finally the grouping of flickering trail addresses into candidate
/// aliases.
pub struct TargetScanner<'e, F: ProberFactory> {
    env: &'e Environment,
    factory: F,
    targets: Vec<IpEntry>,
    alias_groups: Vec<Vec<Ipv4Addr>>,
}

impl<'e, F: ProberFactory> TargetScanner<'e, F> {
    pub fn new(env: &'e Environment, factory: F, targets: Vec<IpEntry>) -> Self {
        Self {
            env,
            factory,
            targets,
            alias_groups: Vec::new(),
        }
    }

    #[must_use]
    pub fn targets(&self) -> &[IpEntry] {
        &self.targets
    }

    #[must_use]
    pub fn alias_groups(&self) -> &[Vec<Ipv4Addr>] {
        &self.alias_groups
    }

    /// Release the entries and alias groups for downstream alias inference.
    #[must_use]
    pub fn into_parts(self) -> (Vec<IpEntry>, Vec<Vec<Ipv4Addr>>) {
        (self.targets, self.alias_groups)
    }

    /// Run the two scanning phases: initial location, then trail
    /// correction.  The second phase is skipped when the emergency stop was
    /// raised during the first.
    pub fn scan(&mut self) -> ScanResult<()> {
        self.locate_targets()?;
        if self.env.is_stopped() {
            return Ok(());
        }
        if self.env.config().display_mode >= DisplayMode::SlightlyVerbose {
            self.env.console_print(&format!(
                "{}/{} targets located; {} trails to correct.\n",
                self.count_located(),
                self.targets.len(),
                self.count_bad_entries(),
            ));
        }
        self.correct_trails()
    }

    /// Phase 1: partition the unresolved targets into contiguous balanced
    /// sub-lists and run one location worker per sub-list, each with a
    /// disjoint slice of the ICMP identifier space.
    fn locate_targets(&mut self) -> ScanResult<()> {
        let config = self.env.config();
        let thread_count = config.thread_count;
        let seqs = config.icmp_seq_range;
        let id_range = config.icmp_id_range;
        let unresolved_count = self
            .targets
            .iter()
            .filter(|entry| entry.ttl().is_none())
            .count();
        if unresolved_count == 0 {
            return Ok(());
        }
        let workers_needed = effective_thread_count(thread_count, unresolved_count);
        let id_slices = split_id_range(id_range, workers_needed);
        debug!(workers = workers_needed, "starting location phase");
        let mut workers = Vec::with_capacity(workers_needed);
        for ids in id_slices {
            let prober = self.make_prober(ids, seqs)?;
            workers.push(LocationWorker::new(self.env, prober));
        }
        let unresolved: Vec<&mut IpEntry> = self
            .targets
            .iter_mut()
            .filter(|entry| entry.ttl().is_none())
            .collect();
        let sublists = partition(unresolved, workers_needed);
        thread::scope(|scope| {
            for (mut worker, sublist) in workers.into_iter().zip(sublists) {
                scope.spawn(move || worker.run(sublist));
            }
        });
        Ok(())
    }

    /// Phase 2: re-probe the entries with anomalous or missing trails.
    ///
    /// Sub-lists are fed to a bounded pool through a channel, shortest
    /// first, so that a finishing slot immediately picks up the next list.
    fn correct_trails(&mut self) -> ScanResult<()> {
        let config = self.env.config();
        let seqs = config.icmp_seq_range;
        let id_range = config.icmp_id_range;
        let thread_count = config.thread_count;
        let sublists = reschedule(&mut self.targets);
        if sublists.is_empty() {
            return Ok(());
        }
        let slots = effective_thread_count(thread_count, sublists.len());
        let id_slices = split_id_range(id_range, slots);
        debug!(lists = sublists.len(), slots, "starting trail correction phase");
        let (sender, receiver) = channel::unbounded();
        for sublist in sublists {
            let _ = sender.send(sublist);
        }
        drop(sender);
        let env = self.env;
        let factory = &self.factory;
        thread::scope(|scope| {
            for ids in id_slices {
                let receiver = receiver.clone();
                scope.spawn(move || {
                    while let Ok(sublist) = receiver.recv() {
                        if env.is_stopped() {
                            break;
                        }
                        match factory.make_prober(ids, seqs) {
                            Ok(prober) => {
                                let mut worker = TrailCorrectionWorker::new(env, prober);
                                worker.run(sublist);
                            }
                            Err(_) => {
                                env.console_print(
                                    "Caught an exception because no new socket could be opened.\n",
                                );
                                env.trigger_stop();
                                break;
                            }
                        }
                    }
                });
            }
        });
        Ok(())
    }

    /// Send the alias side-probe to every located target.
    pub fn probe_alias_ports(&mut self) -> ScanResult<()> {
        if self.env.is_stopped() {
            return Ok(());
        }
        let config = self.env.config();
        let seqs = config.icmp_seq_range;
        let id_range = config.icmp_id_range;
        let thread_count = config.thread_count;
        let located: Vec<&mut IpEntry> = self
            .targets
            .iter_mut()
            .filter(|entry| entry.ttl().is_some())
            .collect();
        if located.is_empty() {
            return Ok(());
        }
        let slots = effective_thread_count(thread_count, located.len());
        let id_slices = split_id_range(id_range, slots);
        let (sender, receiver) = channel::unbounded();
        for entry in located {
            let _ = sender.send(entry);
        }
        drop(sender);
        let env = self.env;
        let factory = &self.factory;
        thread::scope(|scope| {
            for ids in id_slices {
                let receiver = receiver.clone();
                scope.spawn(move || match factory.make_alias_prober(ids, seqs) {
                    Ok(prober) => {
                        let mut worker = AliasPortWorker::new(env, prober);
                        while let Ok(entry) = receiver.recv() {
                            if env.is_stopped() {
                                break;
                            }
                            worker.run(entry);
                        }
                    }
                    Err(_) => {
                        env.console_print(
                            "Caught an exception because no new socket could be opened.\n",
                        );
                        env.trigger_stop();
                    }
                });
            }
        });
        Ok(())
    }

    /// Group flickering trail addresses into candidate aliases.
    ///
    /// A trail address is flickering when, among the entries sharing a TTL
    /// taken in address order, it recurs with a different trail appearing
    /// between its occurrences; the interleaved trails are its peers.  Each
    /// alias group is the transitive closure of the peer relation.
    pub fn finalize(&mut self) -> &[Vec<Ipv4Addr>] {
        let peers = flickering_peers(&self.targets);
        let mut visited = BTreeSet::new();
        let mut groups = Vec::new();
        for &seed in peers.keys() {
            if visited.contains(&seed) {
                continue;
            }
            let mut alias = Vec::new();
            add_flickering_peers(seed, &peers, &mut visited, &mut alias);
            if alias.len() > 1 {
                groups.push(alias);
            }
        }
        debug!(groups = groups.len(), "flickering peers grouped");
        self.alias_groups = groups;
        &self.alias_groups
    }

    /// The number of entries with an anomalous or missing trail.
    #[must_use]
    pub fn count_bad_entries(&self) -> usize {
        self.targets
            .iter()
            .filter(|entry| entry.needs_trail_correction())
            .count()
    }

    /// The number of entries located TTL-wise.
    #[must_use]
    pub fn count_located(&self) -> usize {
        self.targets
            .iter()
            .filter(|entry| entry.ttl().is_some())
            .count()
    }

    fn make_prober(&self, ids: IdRange, seqs: SeqRange) -> ScanResult<F::Prober> {
        self.factory.make_prober(ids, seqs).map_err(|err| {
            self.env
                .console_print("Caught an exception because no new socket could be opened.\n");
            self.env.trigger_stop();
            err
        })
    }
}

/// Cap the worker count by the configuration and the amount of work.
fn effective_thread_count(configured: usize, work_items: usize) -> usize {
    configured.max(1).min(work_items)
}

/// Split `items` into `parts` contiguous lists with sizes differing by at
/// most one, preserving order.
fn partition<T>(mut items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    let base = items.len() / parts;
    let extra = items.len() % parts;
    let mut out = Vec::with_capacity(parts);
    for index in 0..parts {
        let take = (base + usize::from(index < extra)).min(items.len());
        let rest = items.split_off(take);
        out.push(std::mem::replace(&mut items, rest));
    }
    out.retain(|list| !list.is_empty());
    out
}

/// Slice the inclusive identifier range into `parts` disjoint sub-ranges.
fn split_id_range(range: IdRange, parts: usize) -> Vec<IdRange> {
    let total = usize::from(range.1 .0 - range.0 .0) + 1;
    let parts = parts.clamp(1, total);
    let chunk = total / parts;
    let mut out = Vec::with_capacity(parts);
    for index in 0..parts {
        let lo = range.0 .0 + (index * chunk) as u16;
        let hi = if index + 1 == parts {
            range.1 .0
        } else {
            lo + chunk as u16 - 1
        };
        out.push((TraceId(lo), TraceId(hi)));
    }
    out
}

/// Filter the entries needing trail correction, sort them by `(ttl, addr)`
/// and split them into TTL-coherent sub-lists, shortest first.  Empty when
/// there is nothing to re-probe.
fn reschedule(targets: &mut [IpEntry]) -> Vec<Vec<&mut IpEntry>> {
    let mut to_fix: Vec<&mut IpEntry> = targets
        .iter_mut()
        .filter(|entry| entry.needs_trail_correction())
        .collect();
    if to_fix.is_empty() {
        return Vec::new();
    }
    to_fix.sort_by_key(|entry| (entry.ttl().unwrap_or(TimeToLive(0)), entry.addr()));
    let mut sublists = split_list(to_fix);
    sublists.sort_by_key(Vec::len);
    sublists
}

/// Recursively split a sorted list at the largest TTL discontinuity.
fn split_list(list: Vec<&mut IpEntry>) -> Vec<Vec<&mut IpEntry>> {
    let ttls: Vec<u8> = list
        .iter()
        .map(|entry| entry.ttl().unwrap_or(TimeToLive(0)).0)
        .collect();
    let split = estimate_split(&ttls);
    if split == 0 {
        return vec![list];
    }
    let mut head = list;
    let tail = head.split_off(split);
    let mut out = split_list(head);
    out.extend(split_list(tail));
    out
}

/// Pick the split point of a list sorted by TTL: the boundary with the
/// largest TTL gap, ties broken towards the midpoint so the halves stay
/// balanced.  Zero when the list is too short to split or TTL-coherent
/// already.
pub(crate) fn estimate_split(ttls: &[u8]) -> usize {
    if ttls.len() < 2 * MIN_TARGETS_PER_LIST {
        return 0;
    }
    let midpoint = ttls.len() / 2;
    let mut best = 0;
    let mut best_gap = 0;
    let mut best_distance = usize::MAX;
    for (index, (prev, cur)) in ttls.iter().tuple_windows().enumerate() {
        let split = index + 1;
        if split < MIN_TARGETS_PER_LIST || ttls.len() - split < MIN_TARGETS_PER_LIST {
            continue;
        }
        let gap = cur.saturating_sub(*prev);
        if gap == 0 {
            continue;
        }
        let distance = midpoint.abs_diff(split);
        if gap > best_gap || (gap == best_gap && distance < best_distance) {
            best = split;
            best_gap = gap;
            best_distance = distance;
        }
    }
    best
}

/// Collect the flickering-peer relation over the trail addresses.
fn flickering_peers(targets: &[IpEntry]) -> BTreeMap<Ipv4Addr, BTreeSet<Ipv4Addr>> {
    let mut with_trail: Vec<(TimeToLive, Ipv4Addr, Ipv4Addr)> = targets
        .iter()
        .filter_map(|entry| {
            entry
                .ttl()
                .zip(entry.trail())
                .map(|(ttl, trail)| (ttl, entry.addr(), trail.addr()))
        })
        .collect();
    with_trail.sort_by_key(|&(ttl, addr, _)| (ttl, addr));
    let mut peers: BTreeMap<Ipv4Addr, BTreeSet<Ipv4Addr>> = BTreeMap::new();
    for (_, group) in &with_trail.iter().group_by(|&&(ttl, _, _)| ttl) {
        let trails: Vec<Ipv4Addr> = group.map(|&(_, _, trail)| trail).collect();
        let mut last_pos: BTreeMap<Ipv4Addr, usize> = BTreeMap::new();
        for (pos, &trail) in trails.iter().enumerate() {
            if let Some(&prev) = last_pos.get(&trail) {
                for &between in &trails[prev + 1..pos] {
                    peers.entry(trail).or_default().insert(between);
                    peers.entry(between).or_default().insert(trail);
                }
            }
            last_pos.insert(trail, pos);
        }
    }
    peers
}

/// Attach `ip` and every peer transitively reachable from it to `alias`.
fn add_flickering_peers(
    ip: Ipv4Addr,
    peers: &BTreeMap<Ipv4Addr, BTreeSet<Ipv4Addr>>,
    visited: &mut BTreeSet<Ipv4Addr>,
    alias: &mut Vec<Ipv4Addr>,
) {
    if !visited.insert(ip) {
        return;
    }
    alias.push(ip);
    if let Some(neighbours) = peers.get(&ip) {
        for &peer in neighbours {
            add_flickering_peers(peer, peers, visited, alias);
        }
    }
}
