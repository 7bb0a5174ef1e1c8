//! Result Ledger: search results in arrival order, ready for export
//!
//! Unprocessable replies stay in the ledger as explicit skipped entries so a
//! report never silently loses an identifier the archive refused.

use std::collections::HashSet;

use dimse::types::SkippedReply;
use dimse::{FindEntry, FindOutcome, MatchRecord, RetrievalTarget};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEntry {
    Matched(MatchRecord),
    Skipped(SkippedReply),
}

#[derive(Debug, Clone, Default)]
pub struct ResultLedger {
    entries: Vec<LedgerEntry>,
    seen: HashSet<String>,
}

impl ResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a match. Returns false if a record with the same identity is
    /// already present.
    pub fn record(&mut self, record: MatchRecord) -> bool {
        if !self.seen.insert(record.identity()) {
            debug!("Duplicate match {} ignored", record.identity());
            return false;
        }
        self.entries.push(LedgerEntry::Matched(record));
        true
    }

    pub fn record_skipped(&mut self, skipped: SkippedReply) {
        self.entries.push(LedgerEntry::Skipped(skipped));
    }

    /// Fold a whole search into the ledger in reply order; returns the number
    /// of new matches
    pub fn record_outcome(&mut self, outcome: FindOutcome) -> usize {
        let mut added = 0;
        for entry in outcome.entries {
            match entry {
                FindEntry::Matched(record) => {
                    if self.record(record) {
                        added += 1;
                    }
                }
                FindEntry::Skipped(skipped) => self.record_skipped(skipped),
            }
        }
        added
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn matches(&self) -> impl Iterator<Item = &MatchRecord> {
        self.entries.iter().filter_map(|entry| match entry {
            LedgerEntry::Matched(record) => Some(record),
            LedgerEntry::Skipped(_) => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = &SkippedReply> {
        self.entries.iter().filter_map(|entry| match entry {
            LedgerEntry::Skipped(skipped) => Some(skipped),
            LedgerEntry::Matched(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Matches whose patient id or study/series UID is in `allow`, in order
    pub fn filter(&self, allow: &HashSet<String>) -> Vec<MatchRecord> {
        self.matches()
            .filter(|record| record.matches_any(allow))
            .cloned()
            .collect()
    }

    /// Retrieval targets for the (optionally filtered) matches.
    ///
    /// Matches that lack the UIDs a move needs are logged and left out.
    pub fn targets(&self, allow: Option<&HashSet<String>>) -> Vec<RetrievalTarget> {
        let records: Vec<MatchRecord> = match allow {
            Some(allow) => self.filter(allow),
            None => self.matches().cloned().collect(),
        };
        records
            .iter()
            .filter_map(|record| match RetrievalTarget::try_from(record) {
                Ok(target) => Some(target),
                Err(e) => {
                    warn!("Not retrievable: {}", e);
                    None
                }
            })
            .collect()
    }

    pub fn export(&self) -> LedgerTable {
        let rows = self
            .entries
            .iter()
            .map(|entry| match entry {
                LedgerEntry::Matched(record) => vec![
                    record.patient_id.clone(),
                    record.description.clone().unwrap_or_default(),
                    record.date.clone().unwrap_or_default(),
                    record.time.clone().unwrap_or_default(),
                    record.referring_physician.clone().unwrap_or_default(),
                    record.accession_number.clone().unwrap_or_default(),
                    record.study_instance_uid.clone().unwrap_or_default(),
                    record.series_instance_uid.clone().unwrap_or_default(),
                    "matched".to_string(),
                ],
                LedgerEntry::Skipped(skipped) => {
                    let mut row = vec![String::new(); LEDGER_COLUMNS.len()];
                    row[0] = skipped.identifier.clone().unwrap_or_default();
                    row[LEDGER_COLUMNS.len() - 1] =
                        format!("skipped 0x{:04X}: {}", skipped.status, skipped.reason);
                    row
                }
            })
            .collect();

        LedgerTable {
            headers: LEDGER_COLUMNS.iter().map(|h| h.to_string()).collect(),
            rows,
        }
    }
}

const LEDGER_COLUMNS: [&str; 9] = [
    "PatientID",
    "Description",
    "Date",
    "Time",
    "RefPhys",
    "AccessNum",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "Status",
];

/// Header plus rows, handed to whoever persists the report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl LedgerTable {
    /// RFC 4180 CSV: CRLF line breaks, fields quoted when needed
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for line in std::iter::once(&self.headers).chain(self.rows.iter()) {
            let fields: Vec<String> = line.iter().map(|field| csv_field(field)).collect();
            out.push_str(&fields.join(","));
            out.push_str("\r\n");
        }
        out
    }
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
