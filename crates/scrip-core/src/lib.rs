//! Core domain model for scrip: work items, extraction records, run counters,
//! plus the pure normalization helpers shared by every stage.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "scrip-core";

/// Placeholder written into value columns that could not be extracted.
pub const SENTINEL: &str = "N/A";

pub const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%d";

/// Accepted reference date layouts, tried in order; first match wins.
pub const ACCEPTED_DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%d/%m/%Y"];

/// One unit of scrape work bound to a stable source-row index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub index: usize,
    pub subject_key: String,
    pub target: String,
    pub aux_date: Option<String>,
}

/// What the retrieval port handed back for a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    Values(Vec<String>),
    Image(Vec<u8>),
}

impl RawPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RawPayload::Values(_) => "values",
            RawPayload::Image(_) => "image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Retrieval succeeded; values came from the page.
    Complete,
    /// Retrieval failed; values are all sentinel so the sink row stays addressable.
    Degraded,
}

/// Fixed-width record produced once per dispatched work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub index: usize,
    pub subject_key: String,
    pub category: String,
    pub as_of_date: String,
    pub values: Vec<String>,
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
    pub status: RecordStatus,
}

impl ExtractionRecord {
    pub fn from_payload(
        item: &WorkItem,
        category: &str,
        as_of_date: &str,
        payload: RawPayload,
        width: usize,
    ) -> Self {
        let (values, image) = match payload {
            RawPayload::Values(raw) => (normalize_values(Some(&raw), width), None),
            RawPayload::Image(bytes) => (normalize_values(None, width), Some(bytes)),
        };
        Self {
            index: item.index,
            subject_key: item.subject_key.clone(),
            category: category.to_string(),
            as_of_date: as_of_date.to_string(),
            values,
            image,
            status: RecordStatus::Complete,
        }
    }

    pub fn degraded(item: &WorkItem, category: &str, as_of_date: &str, width: usize) -> Self {
        Self {
            index: item.index,
            subject_key: item.subject_key.clone(),
            category: category.to_string(),
            as_of_date: as_of_date.to_string(),
            values: normalize_values(None, width),
            image: None,
            status: RecordStatus::Degraded,
        }
    }

    /// Natural key used for upserts.
    pub fn natural_key(&self) -> (&str, &str) {
        (&self.subject_key, &self.category)
    }
}

/// Per-run tallies. Only ever read for the final summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub processed: u64,
    pub succeeded: u64,
    pub failed_retrieval: u64,
    pub failed_sink: u64,
    pub skipped_no_reference: u64,
    pub skipped_malformed: u64,
}

impl fmt::Display for RunCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} succeeded={} failed_retrieval={} failed_sink={} skipped_no_reference={} skipped_malformed={}",
            self.processed,
            self.succeeded,
            self.failed_retrieval,
            self.failed_sink,
            self.skipped_no_reference,
            self.skipped_malformed
        )
    }
}

/// Replace rendering artifacts with ASCII equivalents and trim.
pub fn clean_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\u{2212}' => out.push('-'),
            '\u{2205}' => out.push_str("None"),
            '\u{00A0}' | '\u{202F}' => out.push(' '),
            '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' => {}
            _ => out.push(ch),
        }
    }
    out.trim().to_string()
}

/// Clean, then truncate or sentinel-pad to exactly `width` values.
pub fn normalize_values(raw: Option<&[String]>, width: usize) -> Vec<String> {
    let mut out: Vec<String> = raw
        .unwrap_or_default()
        .iter()
        .take(width)
        .map(|v| {
            let cleaned = clean_value(v);
            if cleaned.is_empty() {
                SENTINEL.to_string()
            } else {
                cleaned
            }
        })
        .collect();
    out.resize(width, SENTINEL.to_string());
    out
}

/// Parse heterogeneous date text. Unparseable input yields `None`, never a guess.
pub fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let token = raw.split_whitespace().next()?;
    let cleaned: String = token
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-' || *c == '/')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    ACCEPTED_DATE_FORMATS
        .iter()
        .filter(|fmt| has_full_year(&cleaned, fmt))
        .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
}

/// chrono's `%Y` takes one to four digits; only a four-digit year field counts.
fn has_full_year(cleaned: &str, fmt: &str) -> bool {
    let separator = if fmt.contains('/') { '/' } else { '-' };
    let fields = cleaned.split(separator).collect::<Vec<_>>();
    let year = if fmt.starts_with("%Y") {
        fields.first()
    } else {
        fields.last()
    };
    fields.len() == 3 && year.is_some_and(|y| y.len() == 4)
}

pub fn normalize_date(raw: &str) -> Option<String> {
    parse_date_text(raw).map(|d| d.format(CANONICAL_DATE_FORMAT).to_string())
}
