//! Property-based tests for dirsync-repl using proptest.
//!
//! Replicas replay the same changes in different orders; these tests check
//! that clock order, server state and conflict resolution make them agree.

use dirsync_repl::clock::CLOCK_STRING_LEN;
use dirsync_repl::{
    AttrDescription, Entry, EntryHistory, LogicalClock, Modification, ModificationType, ServerState,
};
use proptest::prelude::*;
use std::collections::BTreeSet;
use uuid::Uuid;

fn any_clock() -> impl Strategy<Value = LogicalClock> {
    (any::<u64>(), any::<u16>(), any::<u32>())
        .prop_map(|(time_ms, seq, replica_id)| LogicalClock::new(time_ms, seq, replica_id))
}

/// Value sets for one attribute, never empty.
fn any_values() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::btree_set("[a-e]{1,2}", 1..4).prop_map(|set| set.into_iter().collect())
}

/// Changes with distinct clocks plus an arbitrary replay order.
fn changes_in_any_order() -> impl Strategy<Value = (Vec<(LogicalClock, Vec<String>)>, Vec<usize>)> {
    proptest::collection::vec(any_values(), 1..7).prop_flat_map(|values| {
        let n = values.len();
        let changes: Vec<(LogicalClock, Vec<String>)> = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (LogicalClock::new(100 + 10 * i as u64, 0, (i % 3) as u32 + 1), v))
            .collect();
        (Just(changes), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
    })
}

fn description() -> AttrDescription {
    AttrDescription::new("description")
}

/// One modify of `description`: value add, value delete, attribute delete
/// or replace.
fn any_modification() -> impl Strategy<Value = Modification> {
    let values = || {
        proptest::collection::btree_set("[a-d]", 1..3).prop_map(|set| set.into_iter().collect::<Vec<_>>())
    };
    prop_oneof![
        values().prop_map(|v| Modification::new(ModificationType::Add, description(), v)),
        values().prop_map(|v| Modification::new(ModificationType::Delete, description(), v)),
        Just(Modification::new(ModificationType::Delete, description(), Vec::new())),
        proptest::collection::btree_set("[a-d]", 0..3).prop_map(|set| {
            Modification::new(ModificationType::Replace, description(), set.into_iter().collect())
        }),
    ]
}

/// Modifies with distinct clocks and two independent replay orders.
fn mixed_changes() -> impl Strategy<Value = (Vec<(LogicalClock, Modification)>, Vec<usize>, Vec<usize>)> {
    proptest::collection::vec(any_modification(), 1..8).prop_flat_map(|mods| {
        let n = mods.len();
        let changes: Vec<(LogicalClock, Modification)> = mods
            .into_iter()
            .enumerate()
            .map(|(i, m)| (LogicalClock::new(100 + 10 * i as u64, 0, (i % 3) as u32 + 1), m))
            .collect();
        let order = || Just((0..n).collect::<Vec<_>>()).prop_shuffle();
        (Just(changes), order(), order())
    })
}

fn replay_mixed(changes: &[(LogicalClock, Modification)], order: &[usize]) -> Entry {
    let mut entry = Entry::new("cn=target,dc=example,dc=com", Uuid::nil());
    for &i in order {
        let (clock, m) = &changes[i];
        replay(&mut entry, vec![m.clone()], *clock);
    }
    entry
}

// A value is present when the newest change that names it, or clears the
// whole attribute, puts it there.
fn expected_values(changes: &[(LogicalClock, Modification)]) -> BTreeSet<String> {
    ["a", "b", "c", "d"]
        .into_iter()
        .filter(|value| {
            changes
                .iter()
                .filter_map(|(clock, m)| {
                    let named = m.values.iter().any(|v| v == value);
                    let present = match m.kind {
                        ModificationType::Add if named => Some(true),
                        ModificationType::Delete if named || m.values.is_empty() => Some(false),
                        ModificationType::Replace => Some(named),
                        _ => None,
                    };
                    present.map(|p| (*clock, p))
                })
                .max_by_key(|(clock, _)| *clock)
                .is_some_and(|(_, present)| present)
        })
        .map(str::to_string)
        .collect()
}

// What a replica does with one received modify.
fn replay(entry: &mut Entry, mods: Vec<Modification>, clock: LogicalClock) {
    let mut history = EntryHistory::from_entry(entry);
    let mut mods = mods;
    history.replay_modify(entry, &mut mods, clock).unwrap();
    entry.apply_modifications(&mods).unwrap();
    history.write_to(entry);
}

fn replay_all(
    changes: &[(LogicalClock, Vec<String>)],
    order: impl IntoIterator<Item = usize>,
    kind: ModificationType,
) -> BTreeSet<String> {
    let mut entry = Entry::new("cn=target,dc=example,dc=com", Uuid::nil());
    for i in order {
        let (clock, values) = &changes[i];
        let m = Modification::new(kind, description(), values.clone());
        replay(&mut entry, vec![m], *clock);
    }
    entry.values(&description()).cloned().unwrap_or_default()
}

proptest! {
    /// The text form parses back and sorts like the clock itself.
    #[test]
    fn test_clock_text_round_trip_and_order(a in any_clock(), b in any_clock()) {
        let text_a = a.to_string();
        let text_b = b.to_string();
        prop_assert_eq!(text_a.len(), CLOCK_STRING_LEN);
        prop_assert_eq!(text_a.parse::<LogicalClock>().unwrap(), a);
        prop_assert_eq!(text_a.cmp(&text_b), a.cmp(&b));
    }

    /// A server state holds the newest clock per replica and covers every
    /// clock it was given.
    #[test]
    fn test_server_state_keeps_newest(clocks in proptest::collection::vec(
        (0u64..1_000, any::<u16>(), 1u32..5).prop_map(|(t, s, r)| LogicalClock::new(t, s, r)),
        0..40,
    )) {
        let state: ServerState = clocks.iter().copied().collect();
        for clock in &clocks {
            prop_assert!(state.cover(clock));
            let newest = clocks
                .iter()
                .filter(|c| c.replica_id() == clock.replica_id())
                .max()
                .copied();
            prop_assert_eq!(state.max_clock(clock.replica_id()), newest);
        }
        let reparsed: ServerState = state.to_string().parse().unwrap();
        prop_assert_eq!(reparsed, state);
    }

    /// Replaces converge on the values of the newest one whatever the
    /// replay order.
    #[test]
    fn test_replace_is_last_writer_wins((changes, order) in changes_in_any_order()) {
        let in_order = replay_all(&changes, 0..changes.len(), ModificationType::Replace);
        let shuffled = replay_all(&changes, order, ModificationType::Replace);
        let newest: BTreeSet<String> = changes
            .iter()
            .max_by_key(|(clock, _)| *clock)
            .map(|(_, values)| values.iter().cloned().collect())
            .unwrap_or_default();
        prop_assert_eq!(&shuffled, &in_order);
        prop_assert_eq!(shuffled, newest);
    }

    /// Value adds converge on their union whatever the replay order.
    #[test]
    fn test_adds_converge_on_union((changes, order) in changes_in_any_order()) {
        let shuffled = replay_all(&changes, order, ModificationType::Add);
        let union: BTreeSet<String> = changes
            .iter()
            .flat_map(|(_, values)| values.iter().cloned())
            .collect();
        prop_assert_eq!(shuffled, union);
    }

    /// Any mix of value adds, value deletes, attribute deletes and replaces
    /// ends in the same entry and the same stored history whatever the
    /// replay order.
    #[test]
    fn test_mixed_modifies_converge((changes, first, second) in mixed_changes()) {
        let in_order: Vec<usize> = (0..changes.len()).collect();
        let reference = replay_mixed(&changes, &in_order);
        let left = replay_mixed(&changes, &first);
        let right = replay_mixed(&changes, &second);
        prop_assert_eq!(left.history(), right.history());
        prop_assert_eq!(&left, &right);
        prop_assert_eq!(&left, &reference);
        let values = left.values(&description()).cloned().unwrap_or_default();
        prop_assert_eq!(values, expected_values(&changes));
    }

    /// Stored history reloads to the same history.
    #[test]
    fn test_history_reload((changes, order) in changes_in_any_order()) {
        let mut entry = Entry::new("cn=target,dc=example,dc=com", Uuid::nil());
        for i in order {
            let (clock, values) = &changes[i];
            let kind = if i % 2 == 0 { ModificationType::Add } else { ModificationType::Replace };
            replay(&mut entry, vec![Modification::new(kind, description(), values.clone())], *clock);
        }
        let history = EntryHistory::from_entry(&entry);
        prop_assert_eq!(EntryHistory::load(&history.encode()), history.clone());
        let newest = changes.iter().map(|(clock, _)| *clock).max();
        prop_assert_eq!(history.most_recent(), newest);
    }
}
