//! Operations regenerated from history, for replay to a relay that missed
//! them.

use super::record::RecordKind;
use super::EntryHistory;
use crate::clock::LogicalClock;
use crate::entry::{AttrDescription, Entry, Modification, ModificationType};
use crate::protocol::{UpdateMsg, UpdatePayload};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One synthetic operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOperation {
    /// Entry creation with its current attributes.
    Add {
        /// Creation clock.
        clock: LogicalClock,
        /// Current DN.
        dn: String,
        /// Entry unique id.
        uuid: Uuid,
        /// Current attributes, history excluded.
        attributes: Vec<(AttrDescription, Vec<String>)>,
    },
    /// Modifications sharing one clock.
    Modify {
        /// Operation clock.
        clock: LogicalClock,
        /// Current DN.
        dn: String,
        /// Entry unique id.
        uuid: Uuid,
        /// Merged modifications.
        mods: Vec<Modification>,
    },
    /// Rename to the current DN.
    ModifyDn {
        /// Rename clock.
        clock: LogicalClock,
        /// Current DN.
        dn: String,
        /// Entry unique id.
        uuid: Uuid,
    },
}

impl FakeOperation {
    /// Clock of the operation.
    pub fn clock(&self) -> LogicalClock {
        match self {
            FakeOperation::Add { clock, .. }
            | FakeOperation::Modify { clock, .. }
            | FakeOperation::ModifyDn { clock, .. } => *clock,
        }
    }

    /// The update that replays this operation.
    pub fn to_update_msg(&self) -> UpdateMsg {
        match self {
            FakeOperation::Add {
                clock,
                dn,
                uuid,
                attributes,
            } => UpdateMsg::new(
                *clock,
                dn,
                *uuid,
                UpdatePayload::Add {
                    parent_uuid: None,
                    attributes: attributes.clone(),
                },
            ),
            FakeOperation::Modify {
                clock,
                dn,
                uuid,
                mods,
            } => UpdateMsg::new(*clock, dn, *uuid, UpdatePayload::Modify { mods: mods.clone() }),
            FakeOperation::ModifyDn { clock, dn, uuid } => {
                let (rdn, parent) = match dn.split_once(',') {
                    Some((rdn, parent)) => (rdn, Some(parent.to_string())),
                    None => (dn.as_str(), None),
                };
                UpdateMsg::new(
                    *clock,
                    dn,
                    *uuid,
                    UpdatePayload::ModifyDn {
                        new_rdn: rdn.to_string(),
                        delete_old_rdn: false,
                        new_superior: parent,
                    },
                )
            }
        }
    }
}

#[derive(Default)]
struct Pending {
    added: bool,
    renamed: bool,
    mods: Vec<Modification>,
}

impl Pending {
    fn push(&mut self, attribute: AttrDescription, kind: ModificationType, value: Option<String>) {
        let whole = value.is_none();
        let existing = self
            .mods
            .iter_mut()
            .find(|m| m.kind == kind && m.attribute == attribute && m.values.is_empty() == whole);
        match (existing, value) {
            (Some(m), Some(v)) => m.values.push(v),
            (Some(_), None) => {}
            (None, value) => self
                .mods
                .push(Modification::new(kind, attribute, value.into_iter().collect())),
        }
    }
}

pub(super) fn generate(history: &EntryHistory, entry: &Entry) -> Vec<FakeOperation> {
    let mut by_clock: BTreeMap<LogicalClock, Pending> = BTreeMap::new();
    for record in history.records() {
        let pending = by_clock.entry(record.clock).or_default();
        let kind = match record.kind {
            RecordKind::EntryAdd => {
                pending.added = true;
                continue;
            }
            RecordKind::EntryModDn => {
                pending.renamed = true;
                continue;
            }
            RecordKind::Add => ModificationType::Add,
            RecordKind::Del | RecordKind::AttrDel => ModificationType::Delete,
            RecordKind::Repl => ModificationType::Replace,
        };
        if let Some(attribute) = record.attribute {
            pending.push(attribute, kind, record.value);
        }
    }

    let dn = entry.dn().to_string();
    let uuid = entry.uuid();
    by_clock
        .into_iter()
        .filter_map(|(clock, pending)| {
            if pending.added {
                let attributes = entry
                    .attributes()
                    .filter(|(attr, _)| !attr.is_historical())
                    .map(|(attr, values)| (attr.clone(), values.iter().cloned().collect()))
                    .collect();
                Some(FakeOperation::Add {
                    clock,
                    dn: dn.clone(),
                    uuid,
                    attributes,
                })
            } else if pending.renamed {
                Some(FakeOperation::ModifyDn {
                    clock,
                    dn: dn.clone(),
                    uuid,
                })
            } else if !pending.mods.is_empty() {
                Some(FakeOperation::Modify {
                    clock,
                    dn: dn.clone(),
                    uuid,
                    mods: pending.mods,
                })
            } else {
                None
            }
        })
        .collect()
}
