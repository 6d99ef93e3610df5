use std::collections::HashMap;

use scrip_core::normalize_date;
use tracing::info;

/// Case-normalized subject key.
pub fn normalize_subject(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// `subject -> canonical date`, built once before partitioning and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceMap {
    dates: HashMap<String, String>,
}

impl ReferenceMap {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rows shorter than either column, or with an unparseable date, are
    /// dropped. A repeated subject keeps its last date.
    pub fn from_rows(rows: &[Vec<String>], subject_column: usize, date_column: usize) -> Self {
        let needed = subject_column.max(date_column);
        let mut dates = HashMap::new();
        let mut unparsed = 0usize;
        for row in rows.iter().filter(|r| r.len() > needed) {
            let key = normalize_subject(&row[subject_column]);
            if key.is_empty() {
                continue;
            }
            match normalize_date(&row[date_column]) {
                Some(date) => {
                    dates.insert(key, date);
                }
                None => unparsed += 1,
            }
        }

        let map = Self { dates };
        let mut sample = map.dates.iter().collect::<Vec<_>>();
        sample.sort();
        let sample = sample
            .into_iter()
            .take(5)
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        info!(size = map.len(), unparsed, sample = %sample, "reference map built");
        map
    }

    pub fn lookup(&self, subject: &str) -> Option<&str> {
        self.dates.get(&normalize_subject(subject)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}
