//! Choice of the relay to connect to.
//!
//! The election narrows the known relays with a series of soft filters
//! (configured locally, same group, same generation, holding our newest
//! change, close to us) and balances the remaining ones by weight. A filter
//! that would reject every candidate is skipped. All load arithmetic is done
//! on exact fractions so every replica reaches the same decision from the
//! same topology.

use crate::clock::LogicalClock;
use crate::protocol::{ServerStatus, NO_GENERATION_ID};
use crate::state::ServerState;
use crate::topology::{split_url, ReplicationServerInfo};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Add, Mul, Neg, Sub};
use tracing::debug;

/// Exact fraction, always reduced with a positive denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    num: i128,
    den: i128,
}

fn gcd(mut a: i128, mut b: i128) -> i128 {
    a = a.abs();
    b = b.abs();
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl Ratio {
    /// `num / den`; a zero denominator yields zero.
    pub fn new(num: i128, den: i128) -> Self {
        if den == 0 || num == 0 {
            return Self::ZERO;
        }
        let sign = if den < 0 { -1 } else { 1 };
        let g = gcd(num, den);
        Self {
            num: sign * num / g,
            den: sign * den / g,
        }
    }

    /// Zero.
    pub const ZERO: Ratio = Ratio { num: 0, den: 1 };

    /// Whole number.
    pub fn integer(n: i128) -> Self {
        Self { num: n, den: 1 }
    }

    /// Numerator.
    pub fn numer(&self) -> i128 {
        self.num
    }

    /// Denominator.
    pub fn denom(&self) -> i128 {
        self.den
    }

    /// True if zero.
    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    /// Largest integer not above the value.
    pub fn floor(&self) -> i128 {
        self.num.div_euclid(self.den)
    }

    /// Nearest integer, halves rounded up.
    pub fn round_half_up(&self) -> i128 {
        (*self + Ratio::new(1, 2)).floor()
    }

    /// Keep `digits` significant decimal digits, truncating toward zero.
    pub fn truncate_significant(&self, digits: u32) -> Self {
        if self.is_zero() {
            return Self::ZERO;
        }
        let low = Ratio::integer(10i128.pow(digits.saturating_sub(1)));
        let high = Ratio::integer(10i128.pow(digits));
        let ten = Ratio::integer(10);
        let tenth = Ratio::new(1, 10);

        let mut scaled = Ratio::new(self.num.abs(), self.den);
        let mut exp: i32 = 0;
        while scaled < low && exp < 36 {
            scaled = scaled * ten;
            exp += 1;
        }
        while scaled >= high && exp > -36 {
            scaled = scaled * tenth;
            exp -= 1;
        }
        let kept = scaled.floor() * self.num.signum();
        if exp >= 0 {
            Ratio::new(kept, 10i128.pow(exp.unsigned_abs()))
        } else {
            Ratio::integer(kept * 10i128.pow(exp.unsigned_abs()))
        }
    }
}

impl Add for Ratio {
    type Output = Ratio;
    fn add(self, o: Ratio) -> Ratio {
        Ratio::new(self.num * o.den + o.num * self.den, self.den * o.den)
    }
}

impl Sub for Ratio {
    type Output = Ratio;
    fn sub(self, o: Ratio) -> Ratio {
        self + (-o)
    }
}

impl Mul for Ratio {
    type Output = Ratio;
    fn mul(self, o: Ratio) -> Ratio {
        Ratio::new(self.num * o.num, self.den * o.den)
    }
}

impl Neg for Ratio {
    type Output = Ratio;
    fn neg(self) -> Ratio {
        Ratio {
            num: -self.num,
            den: self.den,
        }
    }
}

impl PartialOrd for Ratio {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ratio {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.num * other.den).cmp(&(other.num * self.den))
    }
}

/// Where a relay runs relative to this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Locality {
    /// Same process.
    SameProcess,
    /// Same machine, another process.
    SameHost,
    /// Elsewhere.
    Remote,
}

/// Which relay URLs point at this machine or this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLocality {
    local_hosts: BTreeSet<String>,
    in_process_ports: BTreeSet<u16>,
}

impl Default for HostLocality {
    fn default() -> Self {
        Self::new(Vec::<String>::new(), [])
    }
}

impl HostLocality {
    /// Loopback names plus `extra_hosts` count as local; relays on a local
    /// host listening on one of `in_process_ports` run in this process.
    pub fn new(
        extra_hosts: impl IntoIterator<Item = impl Into<String>>,
        in_process_ports: impl IntoIterator<Item = u16>,
    ) -> Self {
        let mut local_hosts: BTreeSet<String> = ["localhost", "127.0.0.1", "::1"]
            .into_iter()
            .map(str::to_string)
            .collect();
        local_hosts.extend(extra_hosts.into_iter().map(|h| h.into().to_ascii_lowercase()));
        Self {
            local_hosts,
            in_process_ports: in_process_ports.into_iter().collect(),
        }
    }

    /// Classify a `host:port` URL.
    pub fn classify(&self, url: &str) -> Locality {
        let (host, port) = split_url(url);
        if !self.local_hosts.contains(&host.to_ascii_lowercase()) {
            return Locality::Remote;
        }
        match port {
            Some(p) if self.in_process_ports.contains(&p) => Locality::SameProcess,
            _ => Locality::SameHost,
        }
    }
}

/// What the election needs to know about this replica.
#[derive(Debug, Clone, Copy)]
pub struct LocalReplica<'a> {
    /// Replica id.
    pub server_id: u32,
    /// Group id.
    pub group_id: u8,
    /// Generation id of the local data.
    pub generation_id: i64,
    /// Local server state.
    pub state: &'a ServerState,
    /// Host and process classification.
    pub locality: &'a HostLocality,
}

type Candidates<'a> = Vec<&'a ReplicationServerInfo>;

// Replace the candidates with the filtered set unless it is empty.
fn keep_best<'a>(candidates: &mut Candidates<'a>, filtered: Candidates<'a>) -> bool {
    if filtered.is_empty() {
        false
    } else {
        *candidates = filtered;
        true
    }
}

fn local_clock(state: &ServerState, server_id: u32) -> LogicalClock {
    state
        .max_clock(server_id)
        .unwrap_or(LogicalClock::zero(server_id))
}

fn filter_same_generation<'a>(candidates: &mut Candidates<'a>, generation_id: i64) -> bool {
    let matching: Candidates<'a> = candidates
        .iter()
        .copied()
        .filter(|r| r.generation_id == generation_id)
        .collect();
    let all_empty = matching.iter().all(|r| r.server_state.is_empty());
    let filtered = if all_empty {
        candidates
            .iter()
            .copied()
            .filter(|r| r.generation_id == generation_id || r.generation_id == NO_GENERATION_ID)
            .collect()
    } else {
        matching
    };
    keep_best(candidates, filtered)
}

fn filter_all_local_changes(candidates: &mut Candidates<'_>, local: &LocalReplica<'_>) {
    let mine = local_clock(local.state, local.server_id);
    let mut up_to_date = Vec::new();
    let mut newest: Option<LogicalClock> = None;
    let mut more_up_to_date = Vec::new();
    for &relay in candidates.iter() {
        let theirs = local_clock(&relay.server_state, local.server_id);
        match theirs.cmp(&mine) {
            Ordering::Less => {}
            Ordering::Equal => up_to_date.push(relay),
            Ordering::Greater => match newest.map(|n| theirs.cmp(&n)) {
                None | Some(Ordering::Greater) => {
                    newest = Some(theirs);
                    more_up_to_date = vec![relay];
                }
                Some(Ordering::Equal) => more_up_to_date.push(relay),
                Some(Ordering::Less) => {}
            },
        }
    }
    let filtered = if more_up_to_date.is_empty() {
        up_to_date
    } else {
        more_up_to_date
    };
    keep_best(candidates, filtered);
}

fn filter_same_host(candidates: &mut Candidates<'_>, locality: &HostLocality) {
    let best = candidates
        .iter()
        .map(|r| locality.classify(&r.server_url))
        .min();
    if let Some(best) = best.filter(|l| *l != Locality::Remote) {
        let filtered = candidates
            .iter()
            .copied()
            .filter(|r| locality.classify(&r.server_url) == best)
            .collect();
        keep_best(candidates, filtered);
    }
}

/// Pick the relay this replica should use.
///
/// `current_relay` is the relay in use when `first_connection` is false.
/// Returns `None` when the replica should disconnect from its current relay
/// to rebalance the load, or when no relay is known.
pub fn compute_best_replication_server<'a>(
    first_connection: bool,
    current_relay: Option<u32>,
    local: &LocalReplica<'_>,
    relays: &'a BTreeMap<u32, ReplicationServerInfo>,
) -> Option<&'a ReplicationServerInfo> {
    let mut candidates: Candidates<'a> = relays.values().collect();
    if candidates.len() <= 1 {
        return candidates.pop();
    }

    let configured = candidates.iter().copied().filter(|r| r.locally_configured).collect();
    keep_best(&mut candidates, configured);

    let same_group = candidates
        .iter()
        .copied()
        .filter(|r| r.group_id == local.group_id)
        .collect();
    keep_best(&mut candidates, same_group);

    if filter_same_generation(&mut candidates, local.generation_id) {
        filter_all_local_changes(&mut candidates, local);
    }
    filter_same_host(&mut candidates, local.locality);

    if candidates.len() == 1 {
        return candidates.pop();
    }
    let current = if first_connection { None } else { current_relay };
    compute_best_server_for_weight(&candidates, current, local.server_id)
}

/// Weighted choice among the remaining candidates.
///
/// Without a current relay the candidate furthest below its share of
/// replicas wins. With one, the replica stays unless its relay carries too
/// many replicas and its id is among the lowest connected ones, in which case
/// the result is `None`.
pub fn compute_best_server_for_weight<'a>(
    candidates: &[&'a ReplicationServerInfo],
    current_relay: Option<u32>,
    local_id: u32,
) -> Option<&'a ReplicationServerInfo> {
    let sum_weights: i128 = candidates.iter().map(|r| i128::from(r.weight)).sum();
    let sum_connected: i128 = candidates.iter().map(|r| r.connected_ds_count() as i128).sum();

    let goal = |r: &ReplicationServerInfo| Ratio::new(i128::from(r.weight), sum_weights);
    let load = |connected: i128| Ratio::new(connected, sum_connected);
    let distances: Vec<Ratio> = candidates
        .iter()
        .map(|r| goal(r) - load(r.connected_ds_count() as i128))
        .collect();

    let current = current_relay.and_then(|id| candidates.iter().position(|r| r.relay_id == id));
    let Some(cur) = current else {
        return best_when_not_connected(candidates, &distances);
    };

    let cur_info = candidates[cur];
    if distances[cur] >= Ratio::ZERO {
        return Some(cur_info);
    }
    let others = distances
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != cur)
        .fold(Ratio::ZERO, |acc, (_, d)| acc + *d);
    if others <= Ratio::ZERO {
        return Some(cur_info);
    }

    let overload = (others * Ratio::integer(sum_connected)).round_half_up();
    if overload == 1 {
        let connected = cur_info.connected_ds_count() as i128;
        let new_cur = goal(cur_info) - load(connected - 1);
        let new_others = others - Ratio::new(1, sum_connected);
        let new_cur = new_cur.truncate_significant(6);
        let new_others = new_others.truncate_significant(6);
        if !new_cur.is_zero() && new_cur == -new_others {
            debug!(relay = cur_info.relay_id, "staying on relay, moving would oscillate");
            return Some(cur_info);
        }
    }

    // connected_dss is ordered, so the lowest ids leave first.
    let leaving = cur_info
        .connected_dss
        .iter()
        .position(|id| *id == local_id)
        .is_some_and(|idx| (idx as i128) < overload);
    if leaving {
        debug!(relay = cur_info.relay_id, overload, "relay overloaded, leaving");
        None
    } else {
        Some(cur_info)
    }
}

fn best_when_not_connected<'a>(
    candidates: &[&'a ReplicationServerInfo],
    distances: &[Ratio],
) -> Option<&'a ReplicationServerInfo> {
    if distances.iter().all(Ratio::is_zero) {
        let mut best: Option<&'a ReplicationServerInfo> = None;
        for &r in candidates {
            if best.map_or(true, |b| r.weight > b.weight) {
                best = Some(r);
            }
        }
        return best;
    }
    let mut best: Option<(usize, Ratio)> = None;
    for (i, d) in distances.iter().enumerate() {
        if best.map_or(true, |(_, bd)| *d > bd) {
            best = Some((i, *d));
        }
    }
    best.map(|(i, _)| candidates[i])
}

/// Status this replica starts its session with.
pub fn compute_initial_server_status(
    relay_generation_id: i64,
    relay_state: &ServerState,
    degraded_threshold: u32,
    local_generation_id: i64,
    local_state: &ServerState,
) -> ServerStatus {
    if relay_generation_id == NO_GENERATION_ID {
        ServerStatus::Normal
    } else if relay_generation_id != local_generation_id {
        ServerStatus::BadGenerationId
    } else if degraded_threshold > 0
        && relay_state.diff_changes(local_state) >= u64::from(degraded_threshold)
    {
        ServerStatus::Degraded
    } else {
        ServerStatus::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(id: u32, weight: u32, connected: &[u32]) -> ReplicationServerInfo {
        ReplicationServerInfo {
            relay_id: id,
            server_url: format!("relay{id}.example.com:8989"),
            protocol_version: 4,
            generation_id: 1,
            group_id: 1,
            window_size: 100,
            server_state: ServerState::new(),
            weight,
            connected_dss: connected.iter().copied().collect(),
            locally_configured: true,
        }
    }

    fn relays(list: Vec<ReplicationServerInfo>) -> BTreeMap<u32, ReplicationServerInfo> {
        list.into_iter().map(|r| (r.relay_id, r)).collect()
    }

    fn local<'a>(id: u32, state: &'a ServerState, locality: &'a HostLocality) -> LocalReplica<'a> {
        LocalReplica {
            server_id: id,
            group_id: 1,
            generation_id: 1,
            state,
            locality,
        }
    }

    #[test]
    fn test_ratio_arithmetic() {
        let a = Ratio::new(1, 2) - Ratio::new(2, 3);
        assert_eq!(a, Ratio::new(-1, 6));
        assert_eq!(Ratio::new(2, -4), Ratio::new(-1, 2));
        assert_eq!(Ratio::new(1, 2).round_half_up(), 1);
        assert_eq!(Ratio::new(-1, 2).round_half_up(), 0);
        assert_eq!(Ratio::new(7, 5).round_half_up(), 1);
        assert_eq!(Ratio::new(-7, 3).floor(), -3);
    }

    #[test]
    fn test_truncate_significant() {
        assert_eq!(Ratio::new(1, 3).truncate_significant(6), Ratio::new(333_333, 1_000_000));
        assert_eq!(Ratio::new(-2, 3).truncate_significant(6), Ratio::new(-666_666, 1_000_000));
        assert_eq!(
            Ratio::new(1_234_567_891, 1).truncate_significant(6),
            Ratio::integer(1_234_560_000)
        );
        assert_eq!(Ratio::new(1, 4).truncate_significant(6), Ratio::new(1, 4));
    }

    #[test]
    fn test_weight_example_distances() {
        // Equal weights, two replicas on the first relay and one on the second.
        let r1 = relay(1, 1, &[10, 11]);
        let r2 = relay(2, 1, &[12]);
        let best = compute_best_server_for_weight(&[&r1, &r2], None, 99).unwrap();
        assert_eq!(best.relay_id, 2);
    }

    #[test]
    fn test_anti_oscillation_keeps_current() {
        let r1 = relay(1, 1, &[10, 11]);
        let r2 = relay(2, 1, &[12]);
        let best = compute_best_server_for_weight(&[&r1, &r2], Some(1), 10).unwrap();
        assert_eq!(best.relay_id, 1);
    }

    #[test]
    fn test_overloaded_relay_sheds_lowest_id() {
        let r1 = relay(1, 1, &[10, 11, 12]);
        let r2 = relay(2, 1, &[13]);
        assert!(compute_best_server_for_weight(&[&r1, &r2], Some(1), 10).is_none());
        let stay = compute_best_server_for_weight(&[&r1, &r2], Some(1), 11).unwrap();
        assert_eq!(stay.relay_id, 1);
    }

    #[test]
    fn test_balanced_picks_highest_weight() {
        let r1 = relay(1, 1, &[]);
        let r2 = relay(2, 3, &[]);
        let r3 = relay(3, 3, &[]);
        // No replicas anywhere: distances are the goals, the largest wins.
        let best = compute_best_server_for_weight(&[&r1, &r2, &r3], None, 5).unwrap();
        assert_eq!(best.relay_id, 2);

        let r1 = relay(1, 1, &[1]);
        let r2 = relay(2, 3, &[2, 3, 4]);
        let best = compute_best_server_for_weight(&[&r1, &r2], None, 5).unwrap();
        assert_eq!(best.relay_id, 2);
    }

    #[test]
    fn test_filters_prefer_group_and_generation() {
        let state = ServerState::new();
        let locality = HostLocality::default();
        let mut other_group = relay(1, 10, &[]);
        other_group.group_id = 2;
        let mut bad_gen = relay(2, 10, &[]);
        bad_gen.generation_id = 42;
        let good = relay(3, 1, &[1, 2, 3]);
        let map = relays(vec![other_group, bad_gen, good]);
        let best = compute_best_replication_server(true, None, &local(9, &state, &locality), &map);
        assert_eq!(best.unwrap().relay_id, 3);
    }

    #[test]
    fn test_prefers_relay_holding_newest_local_change() {
        let mut mine = ServerState::new();
        mine.update(LogicalClock::new(100, 0, 9));
        let locality = HostLocality::default();

        let mut behind = relay(1, 10, &[]);
        behind.server_state.update(LogicalClock::new(50, 0, 9));
        let mut equal = relay(2, 10, &[]);
        equal.server_state.update(LogicalClock::new(100, 0, 9));
        let mut ahead = relay(3, 1, &[1, 2]);
        ahead.server_state.update(LogicalClock::new(120, 0, 9));
        let map = relays(vec![behind, equal, ahead]);
        let best = compute_best_replication_server(true, None, &local(9, &mine, &locality), &map);
        assert_eq!(best.unwrap().relay_id, 3);
    }

    #[test]
    fn test_prefers_same_process_then_same_host() {
        let state = ServerState::new();
        let locality = HostLocality::new(["db1"], [4444]);
        let mut remote = relay(1, 10, &[]);
        remote.server_url = "far:4444".into();
        let mut same_host = relay(2, 1, &[1]);
        same_host.server_url = "db1:5555".into();
        let mut same_process = relay(3, 1, &[1, 2]);
        same_process.server_url = "localhost:4444".into();

        let map = relays(vec![remote.clone(), same_host.clone(), same_process]);
        let best = compute_best_replication_server(true, None, &local(9, &state, &locality), &map);
        assert_eq!(best.unwrap().relay_id, 3);

        let map = relays(vec![remote, same_host]);
        let best = compute_best_replication_server(true, None, &local(9, &state, &locality), &map);
        assert_eq!(best.unwrap().relay_id, 2);
    }

    #[test]
    fn test_election_deterministic_and_idempotent() {
        let state = ServerState::new();
        let locality = HostLocality::default();
        let map = relays(vec![
            relay(1, 2, &[1, 2]),
            relay(2, 1, &[3]),
            relay(3, 1, &[]),
        ]);
        let first = compute_best_replication_server(true, None, &local(9, &state, &locality), &map)
            .map(|r| r.relay_id);
        for _ in 0..10 {
            let again = compute_best_replication_server(true, None, &local(9, &state, &locality), &map)
                .map(|r| r.relay_id);
            assert_eq!(first, again);
        }
        let chosen = first.unwrap();
        let stays = compute_best_replication_server(false, Some(chosen), &local(9, &state, &locality), &map)
            .map(|r| r.relay_id);
        assert_eq!(stays, Some(chosen));
    }

    #[test]
    fn test_missing_current_relay_evaluated_as_first_connection() {
        let state = ServerState::new();
        let locality = HostLocality::default();
        let map = relays(vec![relay(1, 1, &[1, 2]), relay(2, 1, &[3])]);
        let best = compute_best_replication_server(false, Some(7), &local(9, &state, &locality), &map);
        assert_eq!(best.unwrap().relay_id, 2);
    }

    #[test]
    fn test_single_and_empty_input() {
        let state = ServerState::new();
        let locality = HostLocality::default();
        let mut only = relay(1, 1, &[]);
        only.group_id = 5;
        only.generation_id = 77;
        let map = relays(vec![only]);
        let best = compute_best_replication_server(false, Some(1), &local(9, &state, &locality), &map);
        assert_eq!(best.unwrap().relay_id, 1);
        assert!(compute_best_replication_server(true, None, &local(9, &state, &locality), &BTreeMap::new()).is_none());
    }

    #[test]
    fn test_initial_status() {
        let mut relay_state = ServerState::new();
        relay_state.update(LogicalClock::new(1, 20, 3));
        let local_state = ServerState::new();
        assert_eq!(
            compute_initial_server_status(NO_GENERATION_ID, &relay_state, 1, 5, &local_state),
            ServerStatus::Normal
        );
        assert_eq!(
            compute_initial_server_status(6, &relay_state, 1, 5, &local_state),
            ServerStatus::BadGenerationId
        );
        assert_eq!(
            compute_initial_server_status(5, &relay_state, 10, 5, &local_state),
            ServerStatus::Degraded
        );
        assert_eq!(
            compute_initial_server_status(5, &relay_state, 0, 5, &local_state),
            ServerStatus::Normal
        );
        assert_eq!(
            compute_initial_server_status(5, &relay_state, 100, 5, &local_state),
            ServerStatus::Normal
        );
    }
}
