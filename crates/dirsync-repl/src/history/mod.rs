//! Per-entry change history used for conflict resolution.
//!
//! Every entry carries the facts "value v was added at clock T" and "value v
//! (or the whole attribute) was deleted at clock T", stored as text records
//! in the `ds-sync-hist` attribute. A replayed modify is checked against this
//! history: if a newer change already touched the same attribute, the
//! modify is rewritten so that every replica converges to the same values
//! regardless of arrival order.
//!
//! The history also regenerates the operations that produced it
//! ([`EntryHistory::generate_fake_operations`]), which is how changes a
//! relay missed are replayed to it.

mod attr;
mod fake;
mod record;

pub use attr::{AttrHistory, ValueHistory, ValueState};
pub use fake::FakeOperation;
pub use record::{HistoricalRecord, RecordKind, RecordParseError};

use crate::clock::LogicalClock;
use crate::entry::{AttrDescription, Entry, Modification};
use crate::error::ReplError;
use std::collections::BTreeMap;
use tracing::warn;

/// History of one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryHistory {
    most_recent: Option<LogicalClock>,
    attributes: BTreeMap<AttrDescription, AttrHistory>,
    added: Option<LogicalClock>,
    renamed: Option<LogicalClock>,
}

impl EntryHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from stored records, in stored order.
    ///
    /// Records that cannot be parsed are skipped; the entry keeps whatever
    /// the remaining records say.
    pub fn load<S: AsRef<str>>(records: &[S]) -> Self {
        let mut history = Self::new();
        let mut skipped = 0usize;
        let mut first_error = None;
        for text in records {
            match text.as_ref().parse::<HistoricalRecord>() {
                Ok(record) => history.load_record(record),
                Err(e) => {
                    skipped += 1;
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            warn!(skipped, error = %e, "ignoring malformed history records");
        }
        history
    }

    /// History stored on `entry`.
    pub fn from_entry(entry: &Entry) -> Self {
        Self::load(entry.history())
    }

    fn load_record(&mut self, record: HistoricalRecord) {
        let clock = record.clock;
        match (record.kind, record.attribute) {
            (RecordKind::EntryAdd, _) => self.added = max_clock(self.added, clock),
            (RecordKind::EntryModDn, _) => self.renamed = max_clock(self.renamed, clock),
            (kind, Some(attribute)) => {
                self.attributes
                    .entry(attribute)
                    .or_default()
                    .load(kind, clock, record.value);
            }
            (_, None) => return,
        }
        self.bump(clock);
    }

    /// Stored records: entry-level records first, then attributes in
    /// description order.
    pub fn records(&self) -> Vec<HistoricalRecord> {
        let mut out = Vec::new();
        if let Some(clock) = self.added {
            out.push(HistoricalRecord::entry(clock, RecordKind::EntryAdd));
        }
        if let Some(clock) = self.renamed {
            out.push(HistoricalRecord::entry(clock, RecordKind::EntryModDn));
        }
        for (attribute, history) in &self.attributes {
            history.encode(attribute, &mut out);
        }
        out
    }

    /// Stored text form.
    pub fn encode(&self) -> Vec<String> {
        self.records().iter().map(ToString::to_string).collect()
    }

    /// Store this history on `entry`.
    pub fn write_to(&self, entry: &mut Entry) {
        entry.set_history(self.encode());
    }

    /// Newest clock recorded anywhere in the entry.
    pub fn most_recent(&self) -> Option<LogicalClock> {
        self.most_recent
    }

    /// History of one attribute.
    pub fn attribute(&self, attribute: &AttrDescription) -> Option<&AttrHistory> {
        self.attributes.get(attribute)
    }

    /// When the entry was created, if recorded.
    pub fn entry_added(&self) -> Option<LogicalClock> {
        self.added
    }

    /// When the entry was last renamed, if recorded.
    pub fn entry_renamed(&self) -> Option<LogicalClock> {
        self.renamed
    }

    fn bump(&mut self, clock: LogicalClock) {
        self.most_recent = max_clock(self.most_recent, clock);
    }

    /// Whether a change to `attribute` at `clock` may conflict with history.
    ///
    /// A clock newer than everything seen on the entry never conflicts,
    /// which settles the common case without looking at the attribute.
    pub fn has_conflict(&self, attribute: &AttrDescription, clock: &LogicalClock) -> bool {
        match self.most_recent {
            Some(most_recent) if *clock <= most_recent => {}
            _ => return false,
        }
        self.attributes
            .get(attribute)
            .and_then(AttrHistory::last_update_time)
            .is_some_and(|last| *clock <= last)
    }

    /// Resolve a replayed modify against the history.
    ///
    /// `mods` is rewritten in place: conflicting modifications are adjusted
    /// or dropped, modifications of the history attribute are removed.
    /// Returns true if any conflict was found.
    pub fn replay_modify(
        &mut self,
        entry: &Entry,
        mods: &mut Vec<Modification>,
        clock: LogicalClock,
    ) -> Result<bool, ReplError> {
        let mut conflict = false;
        let mut resolved = Vec::with_capacity(mods.len());
        for m in mods.drain(..) {
            if m.attribute.is_historical() {
                continue;
            }
            let conflicting = self.has_conflict(&m.attribute, &clock);
            let history = self.attributes.entry(m.attribute.clone()).or_default();
            if conflicting {
                conflict = true;
                if let Some(m) = history.resolve_conflict(m, clock, entry)? {
                    resolved.push(m);
                }
            } else {
                history.record(&m, clock);
                resolved.push(m);
            }
        }
        *mods = resolved;
        self.prune_empty();
        self.bump(clock);
        Ok(conflict)
    }

    /// Record a locally originated modify.
    pub fn process_local(&mut self, mods: &[Modification], clock: LogicalClock) {
        for m in mods.iter().filter(|m| !m.attribute.is_historical()) {
            self.attributes
                .entry(m.attribute.clone())
                .or_default()
                .record(m, clock);
        }
        self.prune_empty();
        self.bump(clock);
    }

    /// Record the creation of the entry.
    pub fn record_add(&mut self, clock: LogicalClock) {
        self.added = max_clock(self.added, clock);
        self.bump(clock);
    }

    /// Record a rename of the entry.
    pub fn record_rename(&mut self, clock: LogicalClock) {
        self.renamed = max_clock(self.renamed, clock);
        self.bump(clock);
    }

    /// Forget facts older than `before`.
    ///
    /// The watermark is kept, so a purged entry still short-circuits newer
    /// changes.
    pub fn purge(&mut self, before: LogicalClock) {
        for history in self.attributes.values_mut() {
            history.purge(before);
        }
        self.prune_empty();
        if self.added.is_some_and(|c| c < before) {
            self.added = None;
        }
        if self.renamed.is_some_and(|c| c < before) {
            self.renamed = None;
        }
    }

    fn prune_empty(&mut self) {
        self.attributes.retain(|_, h| !h.is_empty());
    }

    /// Operations that reproduce this history, one per clock, oldest first.
    pub fn generate_fake_operations(&self, entry: &Entry) -> Vec<FakeOperation> {
        fake::generate(self, entry)
    }
}

fn max_clock(current: Option<LogicalClock>, clock: LogicalClock) -> Option<LogicalClock> {
    Some(current.map_or(clock, |c| c.max(clock)))
}
