//! History of one attribute: value-level add/delete facts and the
//! whole-attribute delete watermark.

use super::record::{HistoricalRecord, RecordKind};
use crate::clock::LogicalClock;
use crate::entry::{AttrDescription, Entry, Modification, ModificationType};
use crate::error::ReplError;

/// The last recorded fact about one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueState {
    /// Value added at this clock.
    Added(LogicalClock),
    /// Value deleted at this clock.
    Deleted(LogicalClock),
}

impl ValueState {
    /// When the fact was recorded.
    pub fn clock(&self) -> LogicalClock {
        match self {
            ValueState::Added(c) | ValueState::Deleted(c) => *c,
        }
    }
}

/// History of one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueHistory {
    value: String,
    state: ValueState,
}

impl ValueHistory {
    /// The value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Its last fact.
    pub fn state(&self) -> ValueState {
        self.state
    }

    /// Add time, if the last fact is an add.
    pub fn add_time(&self) -> Option<LogicalClock> {
        match self.state {
            ValueState::Added(c) => Some(c),
            ValueState::Deleted(_) => None,
        }
    }

    /// Delete time, if the last fact is a delete.
    pub fn delete_time(&self) -> Option<LogicalClock> {
        match self.state {
            ValueState::Deleted(c) => Some(c),
            ValueState::Added(_) => None,
        }
    }

    /// True if the last fact is an add.
    pub fn is_added(&self) -> bool {
        matches!(self.state, ValueState::Added(_))
    }
}

// An absent clock sorts before every clock.
fn newer(clock: &LogicalClock, than: Option<LogicalClock>) -> bool {
    than.map_or(true, |t| *clock > t)
}

fn older(clock: &LogicalClock, than: Option<LogicalClock>) -> bool {
    than.is_some_and(|t| *clock < t)
}

fn newer_or_equal(clock: &LogicalClock, than: Option<LogicalClock>) -> bool {
    than.map_or(true, |t| *clock >= t)
}

/// History of one attribute description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrHistory {
    delete_time: Option<LogicalClock>,
    last_update_time: Option<LogicalClock>,
    values: Vec<ValueHistory>,
}

impl AttrHistory {
    /// When the whole attribute was last deleted or replaced.
    pub fn delete_time(&self) -> Option<LogicalClock> {
        self.delete_time
    }

    /// Newest clock that touched the attribute.
    pub fn last_update_time(&self) -> Option<LogicalClock> {
        self.last_update_time
    }

    /// Value facts in recorded order.
    pub fn values(&self) -> &[ValueHistory] {
        &self.values
    }

    /// History of `value`, if any.
    pub fn value(&self, value: &str) -> Option<&ValueHistory> {
        self.values.iter().find(|v| v.value == value)
    }

    /// True if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.delete_time.is_none() && self.values.is_empty()
    }

    fn touch(&mut self, clock: LogicalClock) {
        if newer(&clock, self.last_update_time) {
            self.last_update_time = Some(clock);
        }
    }

    fn raise_delete_time(&mut self, clock: LogicalClock) {
        if newer(&clock, self.delete_time) {
            self.delete_time = Some(clock);
        }
    }

    // Replaces the value's previous fact and moves it to the end.
    fn set_value(&mut self, value: String, state: ValueState) {
        if let Some(i) = self.values.iter().position(|v| v.value == value) {
            self.values.remove(i);
        }
        self.values.push(ValueHistory { value, state });
    }

    fn delete_all(&mut self, clock: LogicalClock) {
        self.values.retain(|v| v.state.clock() > clock);
        self.raise_delete_time(clock);
        self.touch(clock);
    }

    /// Record a modification known not to conflict.
    pub(crate) fn record(&mut self, m: &Modification, clock: LogicalClock) {
        match m.kind {
            ModificationType::Delete if m.values.is_empty() => self.delete_all(clock),
            ModificationType::Delete => {
                for v in &m.values {
                    self.set_value(v.clone(), ValueState::Deleted(clock));
                }
                self.touch(clock);
            }
            ModificationType::Add => {
                for v in &m.values {
                    self.set_value(v.clone(), ValueState::Added(clock));
                }
                self.touch(clock);
            }
            ModificationType::Replace => {
                self.delete_all(clock);
                for v in &m.values {
                    self.set_value(v.clone(), ValueState::Added(clock));
                }
            }
            ModificationType::Increment => {}
        }
    }

    /// Rewrite a conflicting modification against this history.
    ///
    /// Returns the modification to apply, or `None` when it has no effect
    /// left. The history is updated either way.
    pub(crate) fn resolve_conflict(
        &mut self,
        m: Modification,
        clock: LogicalClock,
        entry: &Entry,
    ) -> Result<Option<Modification>, ReplError> {
        let Modification {
            kind,
            attribute,
            values,
        } = m;
        match kind {
            ModificationType::Increment => Err(ReplError::UnsupportedIncrement {
                attribute: attribute.to_string(),
            }),
            ModificationType::Delete => {
                if older(&clock, self.delete_time) {
                    return Ok(None);
                }
                if values.is_empty() {
                    let kept = self.conflict_delete_all(clock);
                    return Ok(Some(Modification::new(
                        ModificationType::Replace,
                        attribute,
                        kept,
                    )));
                }
                let remaining = self.conflict_delete_values(&attribute, values, clock, entry);
                Ok((!remaining.is_empty())
                    .then(|| Modification::new(ModificationType::Delete, attribute, remaining)))
            }
            ModificationType::Add => {
                if older(&clock, self.delete_time) {
                    return Ok(None);
                }
                let accepted = self.conflict_add(values, clock);
                Ok((!accepted.is_empty())
                    .then(|| Modification::new(ModificationType::Add, attribute, accepted)))
            }
            ModificationType::Replace => {
                if older(&clock, self.delete_time) {
                    return Ok(None);
                }
                let mut result = self.conflict_delete_all(clock);
                for v in self.conflict_add(values, clock) {
                    if !result.contains(&v) {
                        result.push(v);
                    }
                }
                Ok(Some(Modification::new(
                    ModificationType::Replace,
                    attribute,
                    result,
                )))
            }
        }
    }

    // Whole-attribute delete at an old clock: values added after it survive.
    fn conflict_delete_all(&mut self, clock: LogicalClock) -> Vec<String> {
        let mut kept = Vec::new();
        self.values.retain(|v| match v.state {
            ValueState::Added(t) if clock < t => {
                kept.push(v.value.clone());
                true
            }
            state => state.clock() > clock,
        });
        self.raise_delete_time(clock);
        self.touch(clock);
        kept
    }

    fn conflict_delete_values(
        &mut self,
        attribute: &AttrDescription,
        values: Vec<String>,
        clock: LogicalClock,
        entry: &Entry,
    ) -> Vec<String> {
        let mut remaining = Vec::with_capacity(values.len());
        for value in values {
            let mut delete_it = true;
            let mut added_by_this_op = false;
            match self.value(&value).cloned() {
                Some(old) => {
                    if old.add_time() == Some(clock) {
                        added_by_this_op = true;
                    }
                    if newer_or_equal(&clock, old.delete_time())
                        && newer_or_equal(&clock, old.add_time())
                    {
                        self.set_value(value.clone(), ValueState::Deleted(clock));
                    } else if old.is_added() {
                        delete_it = false;
                    }
                }
                None => self.set_value(value.clone(), ValueState::Deleted(clock)),
            }
            if delete_it && (added_by_this_op || entry.has_value(attribute, &value)) {
                remaining.push(value);
            }
        }
        self.touch(clock);
        remaining
    }

    fn conflict_add(&mut self, values: Vec<String>, clock: LogicalClock) -> Vec<String> {
        let mut accepted = Vec::with_capacity(values.len());
        for value in values {
            match self.value(&value).map(|v| v.state) {
                None => {
                    self.set_value(value.clone(), ValueState::Added(clock));
                    accepted.push(value);
                }
                Some(ValueState::Added(t)) => {
                    // Already present: keep the newer add time only.
                    if clock > t {
                        self.set_value(value, ValueState::Added(clock));
                    }
                }
                Some(ValueState::Deleted(t)) => {
                    if clock >= t {
                        self.set_value(value.clone(), ValueState::Added(clock));
                        accepted.push(value);
                    }
                }
            }
        }
        self.touch(clock);
        accepted
    }

    /// Rebuild one fact from its stored record.
    pub(crate) fn load(&mut self, kind: RecordKind, clock: LogicalClock, value: Option<String>) {
        match (kind, value) {
            (RecordKind::Add, Some(v)) => self.set_value(v, ValueState::Added(clock)),
            (RecordKind::Del, Some(v)) => self.set_value(v, ValueState::Deleted(clock)),
            (RecordKind::Repl, Some(v)) => {
                self.raise_delete_time(clock);
                self.set_value(v, ValueState::Added(clock));
            }
            (RecordKind::AttrDel, _) => self.raise_delete_time(clock),
            _ => return,
        }
        self.touch(clock);
    }

    /// Append the stored records of this attribute to `out`.
    ///
    /// Value facts are written oldest first, ties by value, so replicas that
    /// saw the same changes in a different order store the same records.
    pub(crate) fn encode(&self, attribute: &AttrDescription, out: &mut Vec<HistoricalRecord>) {
        let mut values: Vec<&ValueHistory> = self.values.iter().collect();
        values.sort_by(|a, b| (a.state.clock(), &a.value).cmp(&(b.state.clock(), &b.value)));
        let mut delete_time_written = false;
        for v in values {
            let (clock, kind) = match v.state {
                ValueState::Deleted(t) => (t, RecordKind::Del),
                ValueState::Added(t) if Some(t) == self.delete_time => {
                    delete_time_written = true;
                    (t, RecordKind::Repl)
                }
                ValueState::Added(t) => (t, RecordKind::Add),
            };
            out.push(HistoricalRecord::attribute(attribute, clock, kind, Some(&v.value)));
        }
        if let Some(dt) = self.delete_time {
            if !delete_time_written {
                out.push(HistoricalRecord::attribute(attribute, dt, RecordKind::AttrDel, None));
            }
        }
    }

    /// Forget facts older than `before`.
    pub(crate) fn purge(&mut self, before: LogicalClock) {
        self.values.retain(|v| v.state.clock() >= before);
        if self.delete_time.is_some_and(|t| t < before) {
            self.delete_time = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn c(t: u64) -> LogicalClock {
        LogicalClock::new(t, 0, 1)
    }

    fn entry_with(values: &[&str]) -> Entry {
        let mut e = Entry::new("cn=test", Uuid::nil());
        e.put(
            AttrDescription::new("description"),
            values.iter().map(|v| v.to_string()),
        );
        e
    }

    #[test]
    fn test_record_add_then_delete_value() {
        let mut h = AttrHistory::default();
        h.record(&Modification::add("description", &["x"]), c(1));
        h.record(&Modification::delete("description", &["x"]), c(2));
        assert_eq!(h.values().len(), 1);
        assert_eq!(h.value("x").unwrap().delete_time(), Some(c(2)));
        assert_eq!(h.value("x").unwrap().add_time(), None);
        assert_eq!(h.last_update_time(), Some(c(2)));
    }

    #[test]
    fn test_record_replace_drops_older_values() {
        let mut h = AttrHistory::default();
        h.record(&Modification::add("description", &["old"]), c(1));
        h.record(&Modification::replace("description", &["new"]), c(2));
        assert!(h.value("old").is_none());
        assert_eq!(h.value("new").unwrap().add_time(), Some(c(2)));
        assert_eq!(h.delete_time(), Some(c(2)));
    }

    #[test]
    fn test_conflict_delete_value_suppressed_by_newer_add() {
        let mut h = AttrHistory::default();
        h.record(&Modification::add("description", &["y"]), c(5));
        let out = h
            .resolve_conflict(
                Modification::delete("description", &["y"]),
                c(3),
                &entry_with(&["y"]),
            )
            .unwrap();
        assert!(out.is_none());
        assert_eq!(h.value("y").unwrap().add_time(), Some(c(5)));
    }

    #[test]
    fn test_conflict_delete_attribute_keeps_newer_values() {
        let mut h = AttrHistory::default();
        h.record(&Modification::add("description", &["a"]), c(1));
        h.record(&Modification::add("description", &["b"]), c(5));
        let out = h
            .resolve_conflict(
                Modification::delete("description", &[]),
                c(3),
                &entry_with(&["a", "b"]),
            )
            .unwrap()
            .unwrap();
        assert_eq!(out.kind, ModificationType::Replace);
        assert_eq!(out.values, vec!["b".to_string()]);
        assert!(h.value("a").is_none());
        assert_eq!(h.delete_time(), Some(c(3)));
    }

    #[test]
    fn test_conflict_add_older_than_delete_dropped() {
        let mut h = AttrHistory::default();
        h.record(&Modification::delete("description", &[]), c(5));
        let out = h
            .resolve_conflict(Modification::add("description", &["z"]), c(4), &entry_with(&[]))
            .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn test_conflict_add_redundant_keeps_newer_time() {
        let mut h = AttrHistory::default();
        h.record(&Modification::add("description", &["v"]), c(3));
        h.record(&Modification::add("description", &["w"]), c(6));
        let out = h
            .resolve_conflict(
                Modification::add("description", &["v", "n"]),
                c(5),
                &entry_with(&["v", "w"]),
            )
            .unwrap()
            .unwrap();
        assert_eq!(out.values, vec!["n".to_string()]);
        assert_eq!(h.value("v").unwrap().add_time(), Some(c(5)));
    }

    #[test]
    fn test_conflict_add_against_deleted_value() {
        let mut h = AttrHistory::default();
        h.record(&Modification::delete("description", &["v"]), c(5));
        h.record(&Modification::add("description", &["q"]), c(8));
        let older = h
            .resolve_conflict(Modification::add("description", &["v"]), c(4), &entry_with(&["q"]))
            .unwrap();
        assert!(older.is_none());
        let newer = h
            .resolve_conflict(Modification::add("description", &["v"]), c(6), &entry_with(&["q"]))
            .unwrap()
            .unwrap();
        assert_eq!(newer.values, vec!["v".to_string()]);
        assert!(h.value("v").unwrap().is_added());
    }

    #[test]
    fn test_conflict_delete_missing_value_dropped() {
        let mut h = AttrHistory::default();
        h.record(&Modification::add("description", &["a"]), c(9));
        let out = h
            .resolve_conflict(
                Modification::delete("description", &["absent"]),
                c(4),
                &entry_with(&["a"]),
            )
            .unwrap();
        assert!(out.is_none());
        assert_eq!(h.value("absent").unwrap().delete_time(), Some(c(4)));
    }

    #[test]
    fn test_conflict_replace_merges_kept_and_added() {
        let mut h = AttrHistory::default();
        h.record(&Modification::add("description", &["early"]), c(1));
        h.record(&Modification::add("description", &["late"]), c(9));
        let out = h
            .resolve_conflict(
                Modification::replace("description", &["fresh"]),
                c(5),
                &entry_with(&["early", "late"]),
            )
            .unwrap()
            .unwrap();
        assert_eq!(out.kind, ModificationType::Replace);
        assert_eq!(out.values, vec!["late".to_string(), "fresh".to_string()]);
    }

    #[test]
    fn test_conflict_increment_unsupported() {
        let mut h = AttrHistory::default();
        h.record(&Modification::add("counter", &["1"]), c(9));
        let err = h
            .resolve_conflict(Modification::increment("counter", 1), c(2), &entry_with(&[]))
            .unwrap_err();
        assert!(matches!(err, ReplError::UnsupportedIncrement { .. }));
    }

    #[test]
    fn test_encode_repl_and_attr_del() {
        let attr = AttrDescription::new("description");
        let mut h = AttrHistory::default();
        h.record(&Modification::replace("description", &["init value"]), c(10));
        h.record(&Modification::add("description", &["new value"]), c(11));
        let mut out = Vec::new();
        h.encode(&attr, &mut out);
        let kinds: Vec<RecordKind> = out.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RecordKind::Repl, RecordKind::Add]);

        let mut h = AttrHistory::default();
        h.record(&Modification::delete("description", &[]), c(10));
        h.record(&Modification::add("description", &["new value"]), c(11));
        let mut out = Vec::new();
        h.encode(&attr, &mut out);
        let kinds: Vec<RecordKind> = out.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RecordKind::Add, RecordKind::AttrDel]);
    }

    #[test]
    fn test_encode_independent_of_arrival_order() {
        let attr = AttrDescription::new("description");
        let mut first = AttrHistory::default();
        first.record(&Modification::add("description", &["b"]), c(2));
        first.record(&Modification::add("description", &["a"]), c(4));
        let mut second = AttrHistory::default();
        second.record(&Modification::add("description", &["a"]), c(4));
        second
            .resolve_conflict(Modification::add("description", &["b"]), c(2), &entry_with(&["a"]))
            .unwrap();
        let (mut left, mut right) = (Vec::new(), Vec::new());
        first.encode(&attr, &mut left);
        second.encode(&attr, &mut right);
        assert_eq!(left, right);
        assert_eq!(left[0].value.as_deref(), Some("b"));
    }

    #[test]
    fn test_purge() {
        let mut h = AttrHistory::default();
        h.record(&Modification::delete("description", &[]), c(2));
        h.record(&Modification::add("description", &["a"]), c(3));
        h.record(&Modification::add("description", &["b"]), c(8));
        h.purge(c(5));
        assert!(h.value("a").is_none());
        assert!(h.value("b").is_some());
        assert_eq!(h.delete_time(), None);
    }
}
