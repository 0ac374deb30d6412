//! Storage collaborator of a replicated domain.

use crate::clock::LogicalClock;
use crate::entry::Entry;
use crate::error::ReplError;
use crate::history::EntryHistory;
use crate::protocol::NO_GENERATION_ID;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// A conflict-resolved change ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayedOperation {
    /// Create or overwrite the entry, history included.
    Store {
        /// Clock of the replayed change.
        clock: LogicalClock,
        /// The entry as it must be stored.
        entry: Entry,
    },
    /// Remove the entry.
    Remove {
        /// Clock of the replayed change.
        clock: LogicalClock,
        /// Entry unique id.
        uuid: Uuid,
    },
}

impl ReplayedOperation {
    /// Clock of the replayed change.
    pub fn clock(&self) -> LogicalClock {
        match self {
            ReplayedOperation::Store { clock, .. } | ReplayedOperation::Remove { clock, .. } => *clock,
        }
    }
}

/// Entry storage seen by replication.
///
/// Implementations must be safe to call from the listener task and from
/// local writers at the same time.
pub trait ReplicaBackend: Send + Sync {
    /// Generation id of the stored data, `-1` when unknown.
    fn generation_id(&self) -> i64;

    /// Entry with unique id `uuid`, if present.
    fn fetch_entry(&self, uuid: Uuid) -> Result<Option<Entry>, ReplError>;

    /// Entries whose history holds a change newer than `clock`.
    fn entries_changed_since(&self, clock: &LogicalClock) -> Result<Vec<Entry>, ReplError>;

    /// Store the outcome of a replayed change.
    fn apply_replayed_operation(&self, op: ReplayedOperation) -> Result<(), ReplError>;
}

/// In-memory backend keyed by entry unique id.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    entries: Arc<RwLock<BTreeMap<Uuid, Entry>>>,
    generation_id: Arc<AtomicI64>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(NO_GENERATION_ID)
    }
}

fn lock_error<T>(_: T) -> ReplError {
    ReplError::Backend {
        msg: "lock poisoned".to_string(),
    }
}

impl MemoryBackend {
    /// Empty backend with the given generation id.
    pub fn new(generation_id: i64) -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            generation_id: Arc::new(AtomicI64::new(generation_id)),
        }
    }

    /// Store `entry` as a local write would.
    pub fn put(&self, entry: Entry) -> Result<(), ReplError> {
        self.entries
            .write()
            .map_err(lock_error)?
            .insert(entry.uuid(), entry);
        Ok(())
    }

    /// Remove the entry with unique id `uuid`.
    pub fn remove(&self, uuid: Uuid) -> Result<Option<Entry>, ReplError> {
        Ok(self.entries.write().map_err(lock_error)?.remove(&uuid))
    }

    /// Entry whose DN matches `dn`, ignoring case.
    pub fn find_by_dn(&self, dn: &str) -> Result<Option<Entry>, ReplError> {
        Ok(self
            .entries
            .read()
            .map_err(lock_error)?
            .values()
            .find(|e| e.dn().eq_ignore_ascii_case(dn))
            .cloned())
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change the generation id, as a re-initialization would.
    pub fn set_generation_id(&self, generation_id: i64) {
        self.generation_id.store(generation_id, Ordering::SeqCst);
    }
}

impl ReplicaBackend for MemoryBackend {
    fn generation_id(&self) -> i64 {
        self.generation_id.load(Ordering::SeqCst)
    }

    fn fetch_entry(&self, uuid: Uuid) -> Result<Option<Entry>, ReplError> {
        Ok(self.entries.read().map_err(lock_error)?.get(&uuid).cloned())
    }

    fn entries_changed_since(&self, clock: &LogicalClock) -> Result<Vec<Entry>, ReplError> {
        Ok(self
            .entries
            .read()
            .map_err(lock_error)?
            .values()
            .filter(|e| {
                EntryHistory::from_entry(e)
                    .most_recent()
                    .is_some_and(|recent| recent > *clock)
            })
            .cloned()
            .collect())
    }

    fn apply_replayed_operation(&self, op: ReplayedOperation) -> Result<(), ReplError> {
        match op {
            ReplayedOperation::Store { entry, .. } => self.put(entry),
            ReplayedOperation::Remove { uuid, .. } => self.remove(uuid).map(|_| ()),
        }
    }
}
