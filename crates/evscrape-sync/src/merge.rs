//! Reconciles scraped batches against a stored collection.
//!
//! The engine only computes instructions (rows to insert, positions to
//! delete); applying them is the caller's job through a `CollectionStore`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use evscrape_core::{compute_key, Collection, CollectionRow, Event};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_FLAG_COLUMN: &str = "flag";

pub const KEY_COLUMNS: [&str; 4] = ["title", "start_date", "location", "source"];

/// A stored header that lacks some identity key columns. Those components
/// key as empty text; the merge still proceeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaMismatch {
    pub missing_columns: Vec<String>,
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "collection header is missing key column(s): {}",
            self.missing_columns.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurvivorRule {
    Flagged,
    FlagContent,
    EarliestPosition,
}

#[derive(Debug, Clone, Deserialize)]
struct SurvivorRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<SurvivorRule>,
}

/// Ordered preferences for choosing which duplicate row to keep.
///
/// Earliest position is always applied last, so every group resolves to
/// exactly one survivor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurvivorPolicy {
    rules: Vec<SurvivorRule>,
}

impl Default for SurvivorPolicy {
    fn default() -> Self {
        Self::new(vec![
            SurvivorRule::Flagged,
            SurvivorRule::FlagContent,
            SurvivorRule::EarliestPosition,
        ])
    }
}

impl SurvivorPolicy {
    pub fn new(rules: Vec<SurvivorRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[SurvivorRule] {
        &self.rules
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: SurvivorRulesFile = serde_yaml::from_str(text).context("parsing survivor rules")?;
        Ok(Self::new(file.rules))
    }

    /// Loads `rules/survivor.yaml` under `workspace_root`, or the default
    /// policy when the file does not exist.
    pub fn load_or_default(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("rules").join("survivor.yaml");
        if !path.exists() {
            debug!(path = %path.display(), "no survivor rules file; using default policy");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        self.rules
            .iter()
            .map(|rule| match rule {
                SurvivorRule::Flagged => b.flagged.cmp(&a.flagged),
                SurvivorRule::FlagContent => b.has_flag_content.cmp(&a.has_flag_content),
                SurvivorRule::EarliestPosition => a.position.cmp(&b.position),
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| a.position.cmp(&b.position))
    }
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub flag_column: String,
    pub survivor: SurvivorPolicy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            flag_column: DEFAULT_FLAG_COLUMN.to_string(),
            survivor: SurvivorPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
    /// Header the rows are aligned to: the stored one, or the event field
    /// order when the collection has never been written.
    pub header: Vec<String>,
    pub initialize_header: bool,
    pub rows_to_insert: Vec<Vec<String>>,
    pub new_events: Vec<Event>,
    pub already_present: usize,
    pub repeated_in_batch: usize,
    pub schema_warnings: Vec<SchemaMismatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub key: String,
    pub survivor: usize,
    pub removed: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupePlan {
    /// 1-based data-row positions, highest first.
    pub rows_to_delete: Vec<usize>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    pub schema_warnings: Vec<SchemaMismatch>,
}

impl DedupePlan {
    pub fn is_empty(&self) -> bool {
        self.rows_to_delete.is_empty()
    }
}

#[derive(Debug)]
struct Candidate {
    position: usize,
    flagged: bool,
    has_flag_content: bool,
}

struct RowKeyer {
    indices: [Option<usize>; 4],
}

impl RowKeyer {
    fn for_collection(collection: &Collection) -> (Self, Option<SchemaMismatch>) {
        let indices = KEY_COLUMNS.map(|column| collection.column_index(column));
        let missing_columns = KEY_COLUMNS
            .iter()
            .zip(indices.iter())
            .filter(|(_, idx)| idx.is_none())
            .map(|(column, _)| column.to_string())
            .collect::<Vec<_>>();
        let mismatch = (!missing_columns.is_empty()).then_some(SchemaMismatch { missing_columns });
        (Self { indices }, mismatch)
    }

    fn key(&self, row: &CollectionRow) -> String {
        let part = |slot: usize| self.indices[slot].map(|idx| row.cell(idx)).unwrap_or_default();
        compute_key(part(0), part(1), part(2), part(3))
    }
}

fn event_key(event: &Event) -> String {
    event.identity_key().as_str().to_string()
}

/// Aligns an event to `header` by column name. Unknown columns are left
/// empty; event fields the header lacks are dropped.
pub fn align_to_header(header: &[String], event: &Event) -> Vec<String> {
    header
        .iter()
        .map(|column| event.value_of(column).unwrap_or_default())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn diff(&self, existing: &Collection, batch: &[Event]) -> DiffOutcome {
        let mut outcome = DiffOutcome::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut inserted_keys: HashSet<String> = HashSet::new();

        if existing.has_header() {
            outcome.header = existing.header.clone();
            let (keyer, mismatch) = RowKeyer::for_collection(existing);
            if let Some(mismatch) = mismatch {
                warn!(%mismatch, "keying existing rows with empty components");
                outcome.schema_warnings.push(mismatch);
            }
            seen.extend(existing.rows.iter().map(|row| keyer.key(row)));
        } else {
            outcome.header = Event::field_names().iter().map(|name| name.to_string()).collect();
            outcome.initialize_header = true;
        }
        let existing_keys = seen.len();

        for event in batch {
            let key = event_key(event);
            if seen.contains(&key) {
                if inserted_keys.contains(&key) {
                    outcome.repeated_in_batch += 1;
                } else {
                    outcome.already_present += 1;
                }
                continue;
            }
            outcome.rows_to_insert.push(align_to_header(&outcome.header, event));
            outcome.new_events.push(event.clone());
            seen.insert(key.clone());
            inserted_keys.insert(key);
        }

        debug!(
            existing_keys,
            batch = batch.len(),
            new = outcome.rows_to_insert.len(),
            already_present = outcome.already_present,
            repeated_in_batch = outcome.repeated_in_batch,
            "diff computed"
        );
        outcome
    }

    pub fn deduplicate_in_place(&self, collection: &Collection) -> DedupePlan {
        let mut plan = DedupePlan::default();
        if !collection.has_header() {
            return plan;
        }

        let (keyer, mismatch) = RowKeyer::for_collection(collection);
        if let Some(mismatch) = mismatch {
            warn!(%mismatch, "deduplicating with empty key components");
            plan.schema_warnings.push(mismatch);
        }
        let flag_idx = collection.column_index(&self.config.flag_column);

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<Candidate>> = HashMap::new();
        for (position, row) in collection.positioned_rows() {
            let key = keyer.key(row);
            let candidate = Candidate {
                position,
                flagged: row.marker.is_set(),
                has_flag_content: flag_idx.is_some_and(|idx| !row.cell(idx).trim().is_empty()),
            };
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(candidate);
        }

        for key in order {
            let Some(mut members) = groups.remove(&key) else {
                continue;
            };
            if members.len() < 2 {
                continue;
            }
            members.sort_by(|a, b| self.config.survivor.compare(a, b));
            let survivor = members[0].position;
            let mut removed = members[1..].iter().map(|c| c.position).collect::<Vec<_>>();
            removed.sort_unstable();
            plan.rows_to_delete.extend(removed.iter().copied());
            plan.duplicate_groups.push(DuplicateGroup {
                key,
                survivor,
                removed,
            });
        }

        plan.rows_to_delete.sort_unstable_by(|a, b| b.cmp(a));
        plan
    }
}
