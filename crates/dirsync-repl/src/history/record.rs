//! Text form of one history record: `attr[;options]:clock:kind[:value]`.

use crate::clock::LogicalClock;
use crate::entry::AttrDescription;
use std::fmt;
use std::str::FromStr;

/// Attribute name used for entry-level records.
pub const ENTRY_RECORD_NAME: &str = "dn";

/// What a record says happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Value added.
    Add,
    /// Value deleted.
    Del,
    /// Value written by a replace; the clock is also the delete time.
    Repl,
    /// Whole attribute deleted.
    AttrDel,
    /// Entry created.
    EntryAdd,
    /// Entry renamed.
    EntryModDn,
}

impl RecordKind {
    fn keyword(&self) -> &'static str {
        match self {
            RecordKind::Add | RecordKind::EntryAdd => "add",
            RecordKind::Del => "del",
            RecordKind::Repl => "repl",
            RecordKind::AttrDel => "attrDel",
            RecordKind::EntryModDn => "moddn",
        }
    }
}

/// One parsed history record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalRecord {
    /// Attribute, `None` for entry-level records.
    pub attribute: Option<AttrDescription>,
    /// When it happened.
    pub clock: LogicalClock,
    /// What happened.
    pub kind: RecordKind,
    /// Value for value-level records.
    pub value: Option<String>,
}

impl HistoricalRecord {
    /// Value-level or attribute-level record.
    pub fn attribute(
        attribute: &AttrDescription,
        clock: LogicalClock,
        kind: RecordKind,
        value: Option<&str>,
    ) -> Self {
        Self {
            attribute: Some(attribute.clone()),
            clock,
            kind,
            value: value.map(str::to_string),
        }
    }

    /// Entry-level record.
    pub fn entry(clock: LogicalClock, kind: RecordKind) -> Self {
        Self {
            attribute: None,
            clock,
            kind,
            value: None,
        }
    }
}

impl fmt::Display for HistoricalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attr) => write!(f, "{}", attr)?,
            None => f.write_str(ENTRY_RECORD_NAME)?,
        }
        write!(f, ":{}:{}", self.clock, self.kind.keyword())?;
        if let Some(value) = &self.value {
            write!(f, ":{}", value)?;
        }
        Ok(())
    }
}

/// A record that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed history record {record:?}: {reason}")]
pub struct RecordParseError {
    /// The rejected text.
    pub record: String,
    /// Why.
    pub reason: &'static str,
}

impl FromStr for HistoricalRecord {
    type Err = RecordParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| RecordParseError {
            record: s.to_string(),
            reason,
        };
        let mut parts = s.splitn(4, ':');
        let attr = parts.next().filter(|a| !a.is_empty()).ok_or_else(|| err("missing attribute"))?;
        let clock: LogicalClock = parts
            .next()
            .ok_or_else(|| err("missing clock"))?
            .parse()
            .map_err(|_| err("bad clock"))?;
        let keyword = parts.next().ok_or_else(|| err("missing kind"))?;
        let value = parts.next();

        if attr.eq_ignore_ascii_case(ENTRY_RECORD_NAME) {
            let kind = match keyword {
                "add" => RecordKind::EntryAdd,
                "moddn" => RecordKind::EntryModDn,
                _ => return Err(err("unknown entry record kind")),
            };
            return Ok(Self::entry(clock, kind));
        }

        let kind = match keyword {
            "add" => RecordKind::Add,
            "del" => RecordKind::Del,
            "repl" => RecordKind::Repl,
            "attrDel" => RecordKind::AttrDel,
            _ => return Err(err("unknown kind")),
        };
        match (kind, value) {
            (RecordKind::AttrDel, _) => Ok(Self::attribute(&AttrDescription::parse(attr), clock, kind, None)),
            (_, Some(value)) => Ok(Self::attribute(
                &AttrDescription::parse(attr),
                clock,
                kind,
                Some(value),
            )),
            (_, None) => Err(err("missing value")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_with_colons() {
        let rec: HistoricalRecord = "description:000000000000000a000000000000:add:a:b:c"
            .parse()
            .unwrap();
        assert_eq!(rec.kind, RecordKind::Add);
        assert_eq!(rec.value.as_deref(), Some("a:b:c"));
        assert_eq!(rec.clock, LogicalClock::new(10, 0, 0));
    }

    #[test]
    fn test_attr_del_has_no_value() {
        let rec: HistoricalRecord = "description:000000000000000a000000000000:attrDel"
            .parse()
            .unwrap();
        assert_eq!(rec.kind, RecordKind::AttrDel);
        assert_eq!(rec.value, None);
        assert_eq!(
            rec.to_string(),
            "description:000000000000000a000000000000:attrDel"
        );
    }

    #[test]
    fn test_entry_records() {
        let rec: HistoricalRecord = "dn:000000000000000a000000000000:moddn".parse().unwrap();
        assert_eq!(rec.kind, RecordKind::EntryModDn);
        assert!(rec.attribute.is_none());
        assert_eq!(rec.to_string(), "dn:000000000000000a000000000000:moddn");
    }

    #[test]
    fn test_options_preserved() {
        let rec: HistoricalRecord = "cn;lang-fr:000000000000000a000000000000:del:x"
            .parse()
            .unwrap();
        assert_eq!(rec.attribute.unwrap().options(), ["lang-fr".to_string()]);
    }

    #[test]
    fn test_malformed() {
        for bad in [
            "",
            "description",
            "description:nothex:add:x",
            "description:000000000000000a000000000000",
            "description:000000000000000a000000000000:bogus:x",
            "description:000000000000000a000000000000:add",
            "dn:000000000000000a000000000000:del",
        ] {
            assert!(bad.parse::<HistoricalRecord>().is_err(), "{bad}");
        }
    }
}
