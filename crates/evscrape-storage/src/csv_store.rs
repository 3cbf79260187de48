use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use evscrape_core::{Collection, CollectionRow, Event, FlagMarker};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::collection::{descending_positions, CollectionStore, StoreError};

pub const DEFAULT_MARKER_COLUMN: &str = "highlight";

const MARKER_SET_VALUE: &str = "x";

fn is_truthy_marker(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "x" | "yes" | "y" | "true" | "1" | "\u{2713}"
    )
}

type Records = Vec<Vec<String>>;

fn parse_records(bytes: &[u8]) -> Result<Records, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    reader
        .records()
        .map(|record| record.map(|r| r.iter().map(str::to_string).collect()))
        .collect()
}

fn encode_records(records: &[Vec<String>]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    for record in records {
        writer.write_record(record)?;
    }
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

/// Writes `bytes` to `path` through a temp file + rename so readers never
/// observe a half-written collection.
async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

/// The flag marker is stored in its own column (default `highlight`); any
/// truthy value there marks the row as reviewed.
#[derive(Debug, Clone)]
pub struct CsvCollectionStore {
    name: String,
    path: PathBuf,
    marker_column: String,
}

impl CsvCollectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            name,
            path,
            marker_column: DEFAULT_MARKER_COLUMN.to_string(),
        }
    }

    pub fn with_marker_column(mut self, column: impl Into<String>) -> Self {
        self.marker_column = column.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, err: impl std::fmt::Display) -> StoreError {
        StoreError::BackendUnavailable(format!("{}: {err}", self.path.display()))
    }

    async fn load(&self) -> Result<Records, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.unavailable(err)),
        };
        parse_records(&bytes)
            .map_err(|err| StoreError::Malformed(format!("{}: {err}", self.path.display())))
    }

    async fn save(&self, records: &[Vec<String>]) -> Result<(), StoreError> {
        let bytes = encode_records(records).map_err(|err| self.unavailable(err))?;
        write_atomically(&self.path, &bytes)
            .await
            .map_err(|err| self.unavailable(err))?;
        debug!(path = %self.path.display(), rows = records.len().saturating_sub(1), "collection written");
        Ok(())
    }

    async fn load_with_header(&self) -> Result<Records, StoreError> {
        let records = self.load().await?;
        if records.is_empty() {
            return Err(StoreError::Malformed(format!(
                "{}: collection has no header row",
                self.path.display()
            )));
        }
        Ok(records)
    }
}

#[async_trait]
impl CollectionStore for CsvCollectionStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_all(&self) -> Result<Collection, StoreError> {
        let mut records = self.load().await?.into_iter();
        let Some(header) = records.next() else {
            return Ok(Collection::default());
        };
        let marker_idx = header.iter().position(|h| h == &self.marker_column);
        let rows = records
            .map(|cells| {
                let flagged = marker_idx
                    .and_then(|idx| cells.get(idx))
                    .is_some_and(|v| is_truthy_marker(v));
                CollectionRow {
                    cells,
                    marker: if flagged { FlagMarker::Set } else { FlagMarker::Unset },
                }
            })
            .collect();
        Ok(Collection::new(header, rows))
    }

    async fn write_header(&self, header: &[String]) -> Result<(), StoreError> {
        let mut records = self.load().await?;
        match records.first_mut() {
            Some(existing) => *existing = header.to_vec(),
            None => records.push(header.to_vec()),
        }
        self.save(&records).await
    }

    async fn initialize(&self, header: &[String], rows: &[Vec<String>]) -> Result<(), StoreError> {
        let mut records = self.load().await?;
        match records.first_mut() {
            Some(existing) => *existing = header.to_vec(),
            None => records.push(header.to_vec()),
        }
        records.splice(1..1, rows.iter().cloned());
        self.save(&records).await
    }

    async fn insert_rows_at_top(&self, rows: &[Vec<String>]) -> Result<(), StoreError> {
        let mut records = self.load_with_header().await?;
        records.splice(1..1, rows.iter().cloned());
        self.save(&records).await
    }

    async fn delete_rows(&self, positions: &[usize]) -> Result<(), StoreError> {
        let mut records = self.load_with_header().await?;
        // Record 0 is the header, so data row `p` sits at index `p`.
        for position in descending_positions(positions, records.len() - 1)? {
            records.remove(position);
        }
        self.save(&records).await
    }

    async fn set_flagged(&self, positions: &[usize]) -> Result<(), StoreError> {
        let mut records = self.load_with_header().await?;
        let positions = descending_positions(positions, records.len() - 1)?;
        let marker_idx = match records[0].iter().position(|h| h == &self.marker_column) {
            Some(idx) => idx,
            None => {
                records[0].push(self.marker_column.clone());
                records[0].len() - 1
            }
        };
        for position in positions {
            let row = &mut records[position];
            if row.len() <= marker_idx {
                row.resize(marker_idx + 1, String::new());
            }
            row[marker_idx] = MARKER_SET_VALUE.to_string();
        }
        self.save(&records).await
    }
}

pub async fn export_events_csv(path: impl AsRef<Path>, events: &[Event]) -> anyhow::Result<usize> {
    let path = path.as_ref();
    let mut records = Vec::with_capacity(events.len() + 1);
    records.push(Event::field_names().iter().map(|n| n.to_string()).collect());
    records.extend(
        events
            .iter()
            .map(|e| e.serialize().into_iter().map(|(_, v)| v).collect::<Vec<_>>()),
    );
    let bytes = encode_records(&records).context("encoding events csv")?;
    write_atomically(path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(events.len())
}

pub async fn read_column_values(path: impl AsRef<Path>, column: &str) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut records = parse_records(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?
        .into_iter();
    let header = records
        .next()
        .with_context(|| format!("{} has no header row", path.display()))?;
    let idx = header
        .iter()
        .position(|h| h.trim() == column)
        .with_context(|| format!("column `{column}` not found in {}", path.display()))?;
    Ok(records
        .filter_map(|r| r.get(idx).map(|v| v.trim().to_string()))
        .filter(|v| !v.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_survives_a_round_trip() {
        let records = vec![
            vec!["title".to_string(), "description".to_string()],
            vec!["Ladies' Night, Doha".to_string(), "line one\nline \"two\"".to_string()],
        ];
        let bytes = encode_records(&records).unwrap();
        assert_eq!(parse_records(&bytes).unwrap(), records);
    }

    #[test]
    fn marker_values_are_lenient() {
        for value in ["x", "X", " yes ", "TRUE", "1", "\u{2713}"] {
            assert!(is_truthy_marker(value), "{value:?}");
        }
        for value in ["", "no", "0", "maybe"] {
            assert!(!is_truthy_marker(value), "{value:?}");
        }
    }
}
