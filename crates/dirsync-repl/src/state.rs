//! Per-replica server state: the newest clock seen from every replica.

use crate::clock::{ClockParseError, LogicalClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Maps replica id to the newest [`LogicalClock`] observed from it.
///
/// Entries only ever move forward. The broker keeps one for the local
/// replica, and every known relay carries its own copy; the two are
/// separate values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    clocks: BTreeMap<u32, LogicalClock>,
}

impl ServerState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `clock`. Returns true if it replaced an older clock (or was
    /// the first one seen from its replica).
    pub fn update(&mut self, clock: LogicalClock) -> bool {
        match self.clocks.get(&clock.replica_id()) {
            Some(current) if *current >= clock => false,
            _ => {
                self.clocks.insert(clock.replica_id(), clock);
                true
            }
        }
    }

    /// Merge every clock of `other`. Returns true if anything moved.
    pub fn update_from(&mut self, other: &ServerState) -> bool {
        let mut changed = false;
        for clock in other.clocks() {
            changed |= self.update(*clock);
        }
        changed
    }

    /// Newest clock from `replica_id`.
    pub fn max_clock(&self, replica_id: u32) -> Option<LogicalClock> {
        self.clocks.get(&replica_id).copied()
    }

    /// True if `clock` is older than or equal to what was seen from its replica.
    pub fn cover(&self, clock: &LogicalClock) -> bool {
        self.clocks
            .get(&clock.replica_id())
            .is_some_and(|max| max >= clock)
    }

    /// Number of changes this state has that `other` has not seen yet.
    pub fn diff_changes(&self, other: &ServerState) -> u64 {
        self.clocks
            .iter()
            .map(|(id, clock)| u64::from(clock.seq_distance(other.clocks.get(id))))
            .sum()
    }

    /// Clocks in replica-id order.
    pub fn clocks(&self) -> impl Iterator<Item = &LogicalClock> {
        self.clocks.values()
    }

    /// Replica ids present.
    pub fn replica_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.clocks.keys().copied()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Number of replicas present.
    pub fn len(&self) -> usize {
        self.clocks.len()
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for clock in self.clocks.values() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}", clock)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ServerState {
    type Err = ClockParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut state = ServerState::new();
        for token in s.split_whitespace() {
            state.update(token.parse()?);
        }
        Ok(state)
    }
}

impl FromIterator<LogicalClock> for ServerState {
    fn from_iter<I: IntoIterator<Item = LogicalClock>>(iter: I) -> Self {
        let mut state = ServerState::new();
        for clock in iter {
            state.update(clock);
        }
        state
    }
}
