//! Directory entries and the modifications applied to them.
//!
//! This is the minimal entry model the replication core needs: a DN, a
//! stable unique id, multi-valued attributes and the stored change history.
//! Schema and matching rules belong to the directory server; values compare
//! as exact strings here.

use crate::error::ReplError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Name of the attribute holding an entry's change history.
pub const HISTORICAL_ATTRIBUTE: &str = "ds-sync-hist";

/// Attribute type plus options, e.g. `description;lang-fr`.
///
/// The type and options are lower-cased and the options sorted, so two
/// spellings of the same description compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttrDescription {
    name: String,
    options: Vec<String>,
}

impl AttrDescription {
    /// Description without options.
    pub fn new(name: &str) -> Self {
        Self::with_options(name, std::iter::empty::<&str>())
    }

    /// Description with options.
    pub fn with_options<'a>(name: &str, options: impl IntoIterator<Item = &'a str>) -> Self {
        let mut options: Vec<String> = options
            .into_iter()
            .filter(|o| !o.is_empty())
            .map(|o| o.to_ascii_lowercase())
            .collect();
        options.sort();
        options.dedup();
        Self {
            name: name.to_ascii_lowercase(),
            options,
        }
    }

    /// Parse `type[;option...]`.
    pub fn parse(text: &str) -> Self {
        let mut parts = text.split(';');
        let name = parts.next().unwrap_or_default();
        Self::with_options(name, parts)
    }

    /// Attribute type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attribute options.
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// True for the history attribute itself.
    pub fn is_historical(&self) -> bool {
        self.name == HISTORICAL_ATTRIBUTE
    }
}

impl fmt::Display for AttrDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for option in &self.options {
            write!(f, ";{}", option)?;
        }
        Ok(())
    }
}

/// Kind of a single attribute modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationType {
    /// Add values.
    Add,
    /// Delete listed values, or the whole attribute when none are listed.
    Delete,
    /// Replace all values.
    Replace,
    /// Add an integer to the single value.
    Increment,
}

/// One attribute modification of a modify operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// What to do.
    pub kind: ModificationType,
    /// Target attribute.
    pub attribute: AttrDescription,
    /// Values involved. Empty for a whole-attribute delete.
    pub values: Vec<String>,
}

impl Modification {
    /// Build a modification.
    pub fn new(kind: ModificationType, attribute: AttrDescription, values: Vec<String>) -> Self {
        Self {
            kind,
            attribute,
            values,
        }
    }

    /// ADD of `values` to `attr`.
    pub fn add(attr: &str, values: &[&str]) -> Self {
        Self::new(ModificationType::Add, AttrDescription::parse(attr), to_strings(values))
    }

    /// DELETE of `values` (all values when empty).
    pub fn delete(attr: &str, values: &[&str]) -> Self {
        Self::new(ModificationType::Delete, AttrDescription::parse(attr), to_strings(values))
    }

    /// REPLACE with `values`.
    pub fn replace(attr: &str, values: &[&str]) -> Self {
        Self::new(ModificationType::Replace, AttrDescription::parse(attr), to_strings(values))
    }

    /// INCREMENT by `amount`.
    pub fn increment(attr: &str, amount: i64) -> Self {
        Self::new(
            ModificationType::Increment,
            AttrDescription::parse(attr),
            vec![amount.to_string()],
        )
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    dn: String,
    uuid: Uuid,
    attributes: BTreeMap<AttrDescription, BTreeSet<String>>,
    history: Vec<String>,
}

impl Entry {
    /// Empty entry.
    pub fn new(dn: &str, uuid: Uuid) -> Self {
        Self {
            dn: dn.to_string(),
            uuid,
            attributes: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Distinguished name.
    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// Rename the entry.
    pub fn set_dn(&mut self, dn: &str) {
        self.dn = dn.to_string();
    }

    /// Stable unique id, unchanged by renames.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Values of `attr`, if present.
    pub fn values(&self, attr: &AttrDescription) -> Option<&BTreeSet<String>> {
        self.attributes.get(attr)
    }

    /// True if `attr` holds `value`.
    pub fn has_value(&self, attr: &AttrDescription, value: &str) -> bool {
        self.attributes
            .get(attr)
            .is_some_and(|values| values.contains(value))
    }

    /// Set `attr` to exactly `values`; an empty list removes it.
    pub fn put(&mut self, attr: AttrDescription, values: impl IntoIterator<Item = String>) {
        let values: BTreeSet<String> = values.into_iter().collect();
        if values.is_empty() {
            self.attributes.remove(&attr);
        } else {
            self.attributes.insert(attr, values);
        }
    }

    /// All user attributes.
    pub fn attributes(&self) -> impl Iterator<Item = (&AttrDescription, &BTreeSet<String>)> {
        self.attributes.iter()
    }

    /// Stored history records, in stored order.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Replace the stored history records.
    pub fn set_history(&mut self, records: Vec<String>) {
        self.history = records;
    }

    /// Apply `mods` in order.
    ///
    /// Adding a present value or deleting a missing one is not an error:
    /// replayed operations are already conflict-resolved and must apply.
    pub fn apply_modifications(&mut self, mods: &[Modification]) -> Result<(), ReplError> {
        for m in mods {
            if m.attribute.is_historical() {
                continue;
            }
            match m.kind {
                ModificationType::Add => {
                    if !m.values.is_empty() {
                        self.attributes
                            .entry(m.attribute.clone())
                            .or_default()
                            .extend(m.values.iter().cloned());
                    }
                }
                ModificationType::Delete => {
                    if m.values.is_empty() {
                        self.attributes.remove(&m.attribute);
                    } else if let Some(values) = self.attributes.get_mut(&m.attribute) {
                        for v in &m.values {
                            values.remove(v);
                        }
                        if values.is_empty() {
                            self.attributes.remove(&m.attribute);
                        }
                    }
                }
                ModificationType::Replace => {
                    self.put(m.attribute.clone(), m.values.iter().cloned());
                }
                ModificationType::Increment => self.increment(m)?,
            }
        }
        Ok(())
    }

    fn increment(&mut self, m: &Modification) -> Result<(), ReplError> {
        let invalid = |reason: &str| ReplError::InvalidModification {
            attribute: m.attribute.to_string(),
            reason: reason.to_string(),
        };
        let amount: i64 = match m.values.as_slice() {
            [one] => one.parse().map_err(|_| invalid("increment is not an integer"))?,
            _ => return Err(invalid("increment needs exactly one value")),
        };
        let current = self
            .attributes
            .get(&m.attribute)
            .ok_or_else(|| invalid("attribute not present"))?;
        let mut next = BTreeSet::new();
        for value in current {
            let n: i64 = value
                .parse()
                .map_err(|_| invalid("current value is not an integer"))?;
            next.insert(n.wrapping_add(amount).to_string());
        }
        self.attributes.insert(m.attribute.clone(), next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Entry {
        Entry::new("uid=alice,dc=example,dc=com", Uuid::nil())
    }

    #[test]
    fn test_attr_description_normalized() {
        let a = AttrDescription::parse("Description;Lang-FR;binary");
        let b = AttrDescription::with_options("description", ["binary", "lang-fr"]);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "description;binary;lang-fr");
        assert_ne!(a, AttrDescription::new("description"));
    }

    #[test]
    fn test_apply_add_delete_replace() {
        let mut e = entry();
        e.apply_modifications(&[Modification::add("mail", &["a@x", "b@x"])])
            .unwrap();
        assert!(e.has_value(&AttrDescription::new("mail"), "a@x"));

        e.apply_modifications(&[Modification::delete("mail", &["a@x", "missing"])])
            .unwrap();
        assert!(!e.has_value(&AttrDescription::new("mail"), "a@x"));
        assert!(e.has_value(&AttrDescription::new("mail"), "b@x"));

        e.apply_modifications(&[Modification::replace("mail", &["c@x"])])
            .unwrap();
        assert_eq!(e.values(&AttrDescription::new("mail")).unwrap().len(), 1);

        e.apply_modifications(&[Modification::delete("mail", &[])]).unwrap();
        assert!(e.values(&AttrDescription::new("mail")).is_none());
    }

    #[test]
    fn test_increment() {
        let mut e = entry();
        e.apply_modifications(&[Modification::replace("counter", &["41"])])
            .unwrap();
        e.apply_modifications(&[Modification::increment("counter", 1)])
            .unwrap();
        assert!(e.has_value(&AttrDescription::new("counter"), "42"));

        e.apply_modifications(&[Modification::replace("counter", &["abc"])])
            .unwrap();
        assert!(e
            .apply_modifications(&[Modification::increment("counter", 1)])
            .is_err());
    }

    #[test]
    fn test_history_attribute_not_touched_by_mods() {
        let mut e = entry();
        e.set_history(vec!["x".into()]);
        e.apply_modifications(&[Modification::delete(HISTORICAL_ATTRIBUTE, &[])])
            .unwrap();
        assert_eq!(e.history(), ["x".to_string()]);
    }
}
