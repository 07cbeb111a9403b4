//! Merged report built from the input records and the reconciled store state.

use crate::model::{ReconciledRecord, Record};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Group for records the store returned without an owner.
pub const UNASSIGNED_GROUP: &str = "unassigned";

/// One input record paired with its reconciliation result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub record: Record,
    pub matched: bool,
    pub quality: bool,
    pub group: String,
}

/// Matched / unmatched / quality counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportCounts {
    pub total: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub quality: usize,
}

impl ReportCounts {
    fn add(&mut self, entry: &ReportEntry) {
        self.total += 1;
        if entry.matched {
            self.matched += 1;
        } else {
            self.unmatched += 1;
        }
        if entry.quality {
            self.quality += 1;
        }
    }
}

impl fmt::Display for ReportCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records: {} matched, {} unmatched, {} quality",
            self.total, self.matched, self.unmatched, self.quality
        )
    }
}

/// Entries owned by one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupReport {
    pub group: String,
    pub entries: Vec<ReportEntry>,
    pub counts: ReportCounts,
}

/// Final output of a completed run. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedReport {
    /// Groups keyed by name, in name order
    pub groups: BTreeMap<String, GroupReport>,
    pub totals: ReportCounts,
}

impl MergedReport {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Pair every record with its reconciled state.
    ///
    /// Results are matched by key, not position. A record the store did not
    /// return is unmatched. Its group falls back to the record's own
    /// `group_field` value, then to [`UNASSIGNED_GROUP`].
    pub fn build(
        records: &[Record],
        reconciled: Vec<ReconciledRecord>,
        group_field: Option<&str>,
    ) -> Self {
        let mut by_key: HashMap<String, ReconciledRecord> = reconciled
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();

        let mut report = MergedReport::empty();

        for record in records {
            let result = by_key.remove(&record.key);
            let fallback_group = group_field
                .and_then(|field| record.fields.get(field))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty());

            let (matched, quality, group) = match result {
                Some(r) => (
                    r.matched,
                    r.quality,
                    r.group
                        .filter(|g| !g.is_empty())
                        .or_else(|| fallback_group.map(str::to_string)),
                ),
                None => (false, false, fallback_group.map(str::to_string)),
            };
            let group = group.unwrap_or_else(|| UNASSIGNED_GROUP.to_string());

            let entry = ReportEntry {
                record: record.clone(),
                matched,
                quality,
                group: group.clone(),
            };

            report.totals.add(&entry);
            let group_report = report.groups.entry(group.clone()).or_insert_with(|| GroupReport {
                group,
                ..Default::default()
            });
            group_report.counts.add(&entry);
            group_report.entries.push(entry);
        }

        if !by_key.is_empty() {
            tracing::debug!("{} reconciled records had no matching input", by_key.len());
        }

        report
    }

    pub fn total_records(&self) -> usize {
        self.totals.total
    }

    pub fn group(&self, name: &str) -> Option<&GroupReport> {
        self.groups.get(name)
    }

    /// All entries, group by group.
    pub fn entries(&self) -> impl Iterator<Item = &ReportEntry> {
        self.groups.values().flat_map(|g| g.entries.iter())
    }
}

impl fmt::Display for MergedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} groups, {}", self.groups.len(), self.totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciled(
        key: &str,
        matched: bool,
        quality: bool,
        group: Option<&str>,
    ) -> ReconciledRecord {
        ReconciledRecord {
            key: key.to_string(),
            matched,
            quality,
            group: group.map(str::to_string),
            attributes: Default::default(),
        }
    }

    #[test]
    fn test_groups_and_counts() {
        let records: Vec<Record> = ["a", "b", "c", "d"].iter().map(|k| Record::new(*k)).collect();
        // Reverse order: merge is keyed, not positional
        let results = vec![
            reconciled("c", false, false, Some("north")),
            reconciled("b", true, false, Some("south")),
            reconciled("a", true, true, Some("north")),
        ];

        let report = MergedReport::build(&records, results, None);

        assert_eq!(report.total_records(), 4);
        assert_eq!(report.totals.matched + report.totals.unmatched, 4);
        assert_eq!(report.totals.quality, 1);

        let north = report.group("north").unwrap();
        assert_eq!(north.counts.total, 2);
        assert_eq!(north.counts.matched, 1);
        assert_eq!(north.entries[0].record.key, "a");

        let missing = report.group(UNASSIGNED_GROUP).unwrap();
        assert_eq!(missing.entries[0].record.key, "d");
        assert!(!missing.entries[0].matched);
    }

    #[test]
    fn test_group_field_fallback() {
        let records = vec![
            Record::new("a").with_field("agent", "agent-7"),
            Record::new("b").with_field("agent", "agent-7"),
        ];
        let results = vec![reconciled("a", true, false, None)];

        let report = MergedReport::build(&records, results, Some("agent"));

        let group = report.group("agent-7").unwrap();
        assert_eq!(group.counts.total, 2);
        assert_eq!(group.counts.matched, 1);
        assert!(report.group(UNASSIGNED_GROUP).is_none());
    }

    #[test]
    fn test_empty_report() {
        let report = MergedReport::build(&[], Vec::new(), None);
        assert_eq!(report, MergedReport::empty());
        assert_eq!(report.entries().count(), 0);
        assert_eq!(report.to_string(), "0 groups, 0 records: 0 matched, 0 unmatched, 0 quality");
    }
}
