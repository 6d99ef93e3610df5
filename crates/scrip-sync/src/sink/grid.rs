use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use scrip_core::ExtractionRecord;
use scrip_storage::write_atomically;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Sink, SinkError, WriteReceipt};

type Grid = Vec<Vec<String>>;

/// A CSV file treated as a spreadsheet range: record `i` lands on row
/// `header_rows + i`, starting at `start_column`.
pub struct CsvGridSink {
    path: PathBuf,
    header_rows: usize,
    start_column: usize,
    lock: Mutex<()>,
}

impl CsvGridSink {
    pub fn new(path: impl Into<PathBuf>, header_rows: usize, start_column: usize) -> Self {
        Self {
            path: path.into(),
            header_rows,
            start_column,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Option<Grid>, SinkError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(SinkError::Grid(format!("reading {}: {err}", self.path.display()))),
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());
        let mut grid = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|e| SinkError::Grid(format!("parsing {}: {e}", self.path.display())))?;
            grid.push(row.iter().map(ToString::to_string).collect());
        }
        Ok(Some(grid))
    }

    async fn store(&self, grid: &Grid) -> Result<(), SinkError> {
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(Vec::new());
        for row in grid {
            writer
                .write_record(row)
                .map_err(|e| SinkError::Grid(format!("encoding row: {e}")))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| SinkError::Grid(format!("flushing csv: {e}")))?;
        write_atomically(&self.path, &bytes)
            .await
            .map_err(|e| SinkError::Grid(format!("{e:#}")))
    }
}

fn header_block(width: usize) -> Vec<String> {
    let mut header = vec!["subject".to_string(), "as_of_date".to_string()];
    header.extend((1..=width).map(|i| format!("value_{i}")));
    header.push("updated_at".to_string());
    header
}

fn record_cells(record: &ExtractionRecord, updated_at: &str) -> Vec<String> {
    let mut cells = Vec::with_capacity(record.values.len() + 3);
    cells.push(record.subject_key.clone());
    cells.push(record.as_of_date.clone());
    cells.extend(record.values.iter().cloned());
    cells.push(updated_at.to_string());
    cells
}

/// Split records (sorted by index) into runs of consecutive indices.
pub fn contiguous_blocks(records: &[ExtractionRecord]) -> Vec<Vec<&ExtractionRecord>> {
    let mut sorted = records.iter().collect::<Vec<_>>();
    sorted.sort_by_key(|r| r.index);
    sorted.dedup_by_key(|r| r.index);

    let mut blocks: Vec<Vec<&ExtractionRecord>> = Vec::new();
    for record in sorted {
        match blocks.last_mut() {
            Some(block) if block.last().map(|r| r.index + 1) == Some(record.index) => block.push(record),
            _ => blocks.push(vec![record]),
        }
    }
    blocks
}

/// Overwrite the rectangle at (`row`, `column`) with `cells`, growing the
/// grid as needed and leaving every other cell alone.
pub fn apply_block(grid: &mut Grid, row: usize, column: usize, cells: &[Vec<String>]) {
    for (offset, values) in cells.iter().enumerate() {
        let r = row + offset;
        if grid.len() <= r {
            grid.resize_with(r + 1, Vec::new);
        }
        let target = &mut grid[r];
        if target.len() < column + values.len() {
            target.resize(column + values.len(), String::new());
        }
        for (c, value) in values.iter().enumerate() {
            target[column + c] = value.clone();
        }
    }
}

#[async_trait]
impl Sink for CsvGridSink {
    fn describe(&self) -> String {
        format!("grid:{}", self.path.display())
    }

    async fn probe(&self) -> Result<(), SinkError> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SinkError::Unavailable(format!("creating {}: {e}", parent.display())))?;
        }
        self.load().await.map(|_| ())
    }

    async fn upsert_batch(&self, records: &[ExtractionRecord]) -> Result<WriteReceipt, SinkError> {
        if records.is_empty() {
            return Ok(WriteReceipt { rows_written: 0 });
        }
        let _guard = self.lock.lock().await;
        let updated_at = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

        let mut grid = match self.load().await? {
            Some(grid) => grid,
            None => {
                let mut grid = Grid::new();
                if self.header_rows > 0 {
                    let width = records.iter().map(|r| r.values.len()).max().unwrap_or_default();
                    apply_block(&mut grid, 0, self.start_column, &[header_block(width)]);
                }
                grid
            }
        };

        let blocks = contiguous_blocks(records);
        let mut written = 0usize;
        for block in &blocks {
            let Some(first) = block.first() else { continue };
            let cells = block
                .iter()
                .map(|r| record_cells(r, &updated_at))
                .collect::<Vec<_>>();
            apply_block(&mut grid, self.header_rows + first.index, self.start_column, &cells);
            written += cells.len();
        }
        self.store(&grid).await?;
        debug!(path = %self.path.display(), blocks = blocks.len(), rows = written, "grid ranges written");
        Ok(WriteReceipt { rows_written: written })
    }
}
