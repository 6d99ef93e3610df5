use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info_span, Instrument};

use crate::http::{FetchError, HttpFetcher};

/// Where an ordered row table lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableLocation {
    CsvFile { path: PathBuf },
    /// A published CSV export (e.g. a spreadsheet tab) fetched over HTTP.
    CsvUrl { url: String },
}

impl TableLocation {
    pub fn describe(&self) -> String {
        match self {
            TableLocation::CsvFile { path } => path.display().to_string(),
            TableLocation::CsvUrl { url } => url.clone(),
        }
    }
}

/// How a column is addressed in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRef {
    /// Header name, matched trimmed and case-insensitively.
    Header(String),
    /// Spreadsheet letter: `A` is 0, `Z` is 25, `AA` is 26.
    Letter(String),
    Index(usize),
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("reading {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
    #[error("fetching {location}: {source}")]
    Fetch {
        location: String,
        #[source]
        source: FetchError,
    },
    #[error("parsing csv from {location}: {source}")]
    Csv {
        location: String,
        #[source]
        source: csv::Error,
    },
    #[error("table {location} has no header row but column `{column}` is addressed by name")]
    MissingHeader { location: String, column: String },
    #[error("column `{column}` not found in header of {location}")]
    UnknownColumn { location: String, column: String },
    #[error("`{0}` is not a valid column letter")]
    BadLetter(String),
    #[error("remote table {0} requested but no HTTP client is available")]
    NoHttpClient(String),
}

/// An ordered table. `rows` never include the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub location: String,
    pub header: Option<Vec<String>>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn resolve_column(&self, column: &ColumnRef) -> Result<usize, TableError> {
        match column {
            ColumnRef::Index(i) => Ok(*i),
            ColumnRef::Letter(letter) => column_letter_to_index(letter),
            ColumnRef::Header(name) => {
                let header = self.header.as_ref().ok_or_else(|| TableError::MissingHeader {
                    location: self.location.clone(),
                    column: name.clone(),
                })?;
                let wanted = name.trim().to_lowercase();
                header
                    .iter()
                    .position(|h| h.trim().to_lowercase() == wanted)
                    .ok_or_else(|| TableError::UnknownColumn {
                        location: self.location.clone(),
                        column: name.clone(),
                    })
            }
        }
    }
}

pub fn column_letter_to_index(letter: &str) -> Result<usize, TableError> {
    let trimmed = letter.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(TableError::BadLetter(letter.to_string()));
    }
    let n = trimmed
        .to_ascii_uppercase()
        .bytes()
        .try_fold(0usize, |acc, b| acc.checked_mul(26)?.checked_add(usize::from(b - b'A' + 1)))
        .ok_or_else(|| TableError::BadLetter(letter.to_string()))?;
    Ok(n - 1)
}

pub fn parse_csv_table(location: &str, bytes: &[u8], has_header: bool) -> Result<Table, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| TableError::Csv {
            location: location.to_string(),
            source,
        })?;
        rows.push(record.iter().map(ToString::to_string).collect::<Vec<_>>());
    }

    let header = if has_header && !rows.is_empty() {
        Some(rows.remove(0))
    } else {
        None
    };
    Ok(Table {
        location: location.to_string(),
        header,
        rows,
    })
}

/// Read a whole table up front. Any failure here is fatal for the run.
pub async fn read_table(
    location: &TableLocation,
    has_header: bool,
    http: Option<&HttpFetcher>,
) -> Result<Table, TableError> {
    let described = location.describe();
    let span = info_span!("read_table", location = %described);

    async move {
        let bytes = match location {
            TableLocation::CsvFile { path } => {
                tokio::fs::read(path).await.map_err(|source| TableError::Io {
                    location: described.clone(),
                    source,
                })?
            }
            TableLocation::CsvUrl { url } => {
                let http = http.ok_or_else(|| TableError::NoHttpClient(described.clone()))?;
                http.get(url)
                    .await
                    .map_err(|source| TableError::Fetch {
                        location: described.clone(),
                        source,
                    })?
                    .bytes
            }
        };
        parse_csv_table(&described, &bytes, has_header)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn column_letters_map_to_zero_based_indices() {
        assert_eq!(column_letter_to_index("A").unwrap(), 0);
        assert_eq!(column_letter_to_index("z").unwrap(), 25);
        assert_eq!(column_letter_to_index("AA").unwrap(), 26);
        assert_eq!(column_letter_to_index(" E ").unwrap(), 4);
        assert!(column_letter_to_index("").is_err());
        assert!(column_letter_to_index("A1").is_err());
    }

    #[test]
    fn oversized_letters_are_rejected() {
        let long = "Z".repeat(40);
        assert!(matches!(
            column_letter_to_index(&long),
            Err(TableError::BadLetter(letter)) if letter == long
        ));
    }

    #[test]
    fn header_is_stripped_and_lookup_is_case_insensitive() {
        let table = parse_csv_table(
            "inline",
            b"Symbol ,Day,symbol\nAAPL,https://x/AAPL,dup\nMSFT,https://x/MSFT\n",
            true,
        )
        .unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1], vec!["MSFT", "https://x/MSFT"]);
        assert_eq!(table.resolve_column(&ColumnRef::Header("symbol".into())).unwrap(), 0);
        assert_eq!(table.resolve_column(&ColumnRef::Header("DAY".into())).unwrap(), 1);
        assert!(matches!(
            table.resolve_column(&ColumnRef::Header("url".into())),
            Err(TableError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn headerless_table_rejects_named_columns() {
        let table = parse_csv_table("inline", b"AAA,2024/03/05\n", false).unwrap();
        assert_eq!(table.rows.len(), 1);
        assert!(matches!(
            table.resolve_column(&ColumnRef::Header("symbol".into())),
            Err(TableError::MissingHeader { .. })
        ));
        assert_eq!(table.resolve_column(&ColumnRef::Letter("B".into())).unwrap(), 1);
    }

    #[tokio::test]
    async fn unreadable_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let location = TableLocation::CsvFile {
            path: dir.path().join("missing.csv"),
        };
        assert!(matches!(
            read_table(&location, true, None).await,
            Err(TableError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn remote_table_without_client_is_an_error() {
        let location = TableLocation::CsvUrl {
            url: "https://example.com/export.csv".into(),
        };
        assert!(matches!(
            read_table(&location, true, None).await,
            Err(TableError::NoHttpClient(_))
        ));
    }
}
