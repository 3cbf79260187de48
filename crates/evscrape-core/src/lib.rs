//! Canonical event record, identity key and collection model for evscrape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "evscrape-core";

pub const NO_TITLE: &str = "No title";
pub const NO_DATE: &str = "No date";

/// Persisted column order. `raw_data` is deliberately absent.
const FIELD_NAMES: [&str; 18] = [
    "title",
    "start_date",
    "source",
    "end_date",
    "time",
    "start_time",
    "end_time",
    "description",
    "location",
    "link",
    "directions",
    "category",
    "price",
    "tickets",
    "image_url",
    "age_restriction",
    "organizer",
    "tags",
];

/// Characters dropped (not space-substituted) from identity key components.
const KEY_STRIPPED_CHARS: [char; 4] = ['\'', '\u{2019}', '\u{2018}', '`'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("event is missing required field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFields {
    pub title: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub time: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub link: Option<String>,
    pub directions: Option<String>,
    pub category: Option<String>,
    pub price: Option<String>,
    pub tickets: Option<String>,
    pub image_url: Option<String>,
    pub age_restriction: Option<String>,
    pub organizer: Option<String>,
    pub tags: Vec<String>,
    pub source: Option<String>,
    pub raw_data: Option<Map<String, JsonValue>>,
}

/// One event, from one source, normalized. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    title: String,
    start_date: String,
    source: String,
    end_date: String,
    time: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    description: Option<String>,
    location: Option<String>,
    link: Option<String>,
    directions: Option<String>,
    category: Option<String>,
    price: Option<String>,
    tickets: Option<String>,
    image_url: Option<String>,
    age_restriction: Option<String>,
    organizer: Option<String>,
    tags: Vec<String>,
    #[serde(skip)]
    raw_data: Option<Map<String, JsonValue>>,
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField(name)),
    }
}

impl Event {
    /// Validates required fields and fills `end_date` from `start_date` when absent.
    pub fn new(fields: EventFields) -> Result<Self, ValidationError> {
        let title = required(fields.title, "title")?;
        let start_date = required(fields.start_date, "start_date")?;
        let source = required(fields.source, "source")?;
        let end_date = fields
            .end_date
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| start_date.clone());

        Ok(Self {
            title,
            start_date,
            source,
            end_date,
            time: fields.time,
            start_time: fields.start_time,
            end_time: fields.end_time,
            description: fields.description,
            location: fields.location,
            link: fields.link,
            directions: fields.directions,
            category: fields.category,
            price: fields.price,
            tickets: fields.tickets,
            image_url: fields.image_url,
            age_restriction: fields.age_restriction,
            organizer: fields.organizer,
            tags: fields.tags,
            raw_data: fields.raw_data,
        })
    }

    pub fn field_names() -> &'static [&'static str] {
        &FIELD_NAMES
    }

    pub fn serialize(&self) -> Vec<(&'static str, String)> {
        FIELD_NAMES
            .iter()
            .map(|name| (*name, self.value_of(name).unwrap_or_default()))
            .collect()
    }

    /// Text value of a persisted column, or `None` if `name` is not a record field.
    pub fn value_of(&self, name: &str) -> Option<String> {
        let optional = |v: &Option<String>| Some(v.clone().unwrap_or_default());
        match name {
            "title" => Some(self.title.clone()),
            "start_date" => Some(self.start_date.clone()),
            "source" => Some(self.source.clone()),
            "end_date" => Some(self.end_date.clone()),
            "time" => optional(&self.time),
            "start_time" => optional(&self.start_time),
            "end_time" => optional(&self.end_time),
            "description" => optional(&self.description),
            "location" => optional(&self.location),
            "link" => optional(&self.link),
            "directions" => optional(&self.directions),
            "category" => optional(&self.category),
            "price" => optional(&self.price),
            "tickets" => optional(&self.tickets),
            "image_url" => optional(&self.image_url),
            "age_restriction" => optional(&self.age_restriction),
            "organizer" => optional(&self.organizer),
            "tags" => Some(self.tags.join(", ")),
            _ => None,
        }
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::compute(
            &self.title,
            &self.start_date,
            self.location.as_deref().unwrap_or_default(),
            &self.source,
        )
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn start_date(&self) -> &str {
        &self.start_date
    }

    pub fn end_date(&self) -> &str {
        &self.end_date
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn time(&self) -> Option<&str> {
        self.time.as_deref()
    }

    pub fn start_time(&self) -> Option<&str> {
        self.start_time.as_deref()
    }

    pub fn end_time(&self) -> Option<&str> {
        self.end_time.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn directions(&self) -> Option<&str> {
        self.directions.as_deref()
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn price(&self) -> Option<&str> {
        self.price.as_deref()
    }

    pub fn tickets(&self) -> Option<&str> {
        self.tickets.as_deref()
    }

    pub fn image_url(&self) -> Option<&str> {
        self.image_url.as_deref()
    }

    pub fn age_restriction(&self) -> Option<&str> {
        self.age_restriction.as_deref()
    }

    pub fn organizer(&self) -> Option<&str> {
        self.organizer.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn raw_data(&self) -> Option<&Map<String, JsonValue>> {
        self.raw_data.as_ref()
    }
}

/// Normalizes one identity key component: trim, lowercase, drop quote marks.
///
/// Unlike a single leading trim, the result is trimmed again after quote
/// removal, so `"Rock '"` and `"Rock"` share a key and normalizing an
/// already-normalized value is a no-op.
pub fn normalize_key_component(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !KEY_STRIPPED_CHARS.contains(c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Changing the normalization rules changes every key and must be treated as
/// a breaking change to stored collections.
pub fn compute_key(title: &str, start_date: &str, location: &str, source: &str) -> String {
    [title, start_date, location, source]
        .iter()
        .map(|part| normalize_key_component(part))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn compute(title: &str, start_date: &str, location: &str, source: &str) -> Self {
        Self(compute_key(title, start_date, location, source))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlagMarker {
    #[default]
    Unset,
    Set,
}

impl FlagMarker {
    pub fn is_set(self) -> bool {
        matches!(self, FlagMarker::Set)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectionRow {
    pub cells: Vec<String>,
    pub marker: FlagMarker,
}

impl CollectionRow {
    pub fn new(cells: Vec<String>) -> Self {
        Self {
            cells,
            marker: FlagMarker::Unset,
        }
    }

    pub fn flagged(mut self) -> Self {
        self.marker = FlagMarker::Set;
        self
    }

    pub fn cell(&self, index: usize) -> &str {
        self.cells.get(index).map(String::as_str).unwrap_or_default()
    }
}

/// An empty header means the collection has never been written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Collection {
    pub header: Vec<String>,
    pub rows: Vec<CollectionRow>,
}

impl Collection {
    pub fn new(header: Vec<String>, rows: Vec<CollectionRow>) -> Self {
        Self { header, rows }
    }

    pub fn has_header(&self) -> bool {
        !self.header.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    pub fn positioned_rows(&self) -> impl Iterator<Item = (usize, &CollectionRow)> {
        self.rows.iter().enumerate().map(|(idx, row)| (idx + 1, row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(title: &str, start_date: &str, source: &str) -> EventFields {
        EventFields {
            title: Some(title.to_string()),
            start_date: Some(start_date.to_string()),
            source: Some(source.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn end_date_defaults_to_start_date() {
        let event = Event::new(fields("Desert Safari", "25 Dec 2023", "iloveqatar")).unwrap();
        assert_eq!(event.end_date(), "25 Dec 2023");

        let mut explicit = fields("Desert Safari", "25 Dec 2023", "iloveqatar");
        explicit.end_date = Some("27 Dec 2023".into());
        let event = Event::new(explicit).unwrap();
        assert_eq!(event.end_date(), "27 Dec 2023");
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let mut f = fields("Desert Safari", "25 Dec", "x");
        f.title = None;
        assert_eq!(Event::new(f), Err(ValidationError::MissingField("title")));

        let f = fields("Desert Safari", "   ", "x");
        assert_eq!(Event::new(f), Err(ValidationError::MissingField("start_date")));

        let mut f = fields("Desert Safari", "25 Dec", "x");
        f.source = None;
        assert_eq!(Event::new(f), Err(ValidationError::MissingField("source")));
    }

    #[test]
    fn serialize_follows_field_names_and_omits_raw_data() {
        let mut f = fields("Beach Party", "26 Dec", "x");
        f.location = Some("Doha".into());
        f.tags = vec!["music".into(), "outdoor".into()];
        let mut raw = Map::new();
        raw.insert("html".into(), JsonValue::String("<div/>".into()));
        f.raw_data = Some(raw);
        let event = Event::new(f).unwrap();

        let flat = event.serialize();
        let names = flat.iter().map(|(k, _)| *k).collect::<Vec<_>>();
        assert_eq!(names, Event::field_names());
        assert!(!names.contains(&"raw_data"));
        assert_eq!(event.value_of("tags").as_deref(), Some("music, outdoor"));
        assert_eq!(event.value_of("price").as_deref(), Some(""));
        assert_eq!(event.value_of("raw_data"), None);
        assert!(event.raw_data().is_some());

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("raw_data").is_none());
    }

    #[test]
    fn key_ignores_case_and_surrounding_whitespace() {
        assert_eq!(
            compute_key("Desert Safari", "25 Dec 2023", "Doha", "X"),
            compute_key(" desert safari ", "25 Dec 2023", "doha", "x"),
        );
    }

    #[test]
    fn key_drops_quote_variants_without_spacing() {
        let plain = compute_key("Ladies Night", "1 Jan", "Doha", "x");
        for title in ["Ladies' Night", "Ladies\u{2019} Night", "Ladies\u{2018} Night", "Ladies` Night"] {
            assert_eq!(compute_key(title, "1 Jan", "Doha", "x"), plain);
        }
        assert_eq!(plain, "ladies night1 jandohax");
    }

    #[test]
    fn key_normalization_is_idempotent() {
        let inputs = ["  Ladies' Night ", "' Quoted'", "MIXED `Case`", "", "Café Ünïcode"];
        for input in inputs {
            let once = compute_key(input, "", "", "");
            assert_eq!(compute_key(&once, "", "", ""), once);
        }
        let key = compute_key("Desert Safari", "25 Dec", "Doha", "X");
        assert_eq!(compute_key(&key, "", "", ""), key);
    }

    #[test]
    fn event_key_treats_missing_location_as_empty() {
        let event = Event::new(fields("Desert Safari", "25 Dec", "X")).unwrap();
        assert_eq!(event.identity_key().as_str(), compute_key("Desert Safari", "25 Dec", "", "X"));
    }

    #[test]
    fn collection_rows_are_positioned_from_one() {
        let collection = Collection::new(
            vec!["title".into()],
            vec![CollectionRow::new(vec!["a".into()]), CollectionRow::new(vec![])],
        );
        let positions = collection.positioned_rows().map(|(p, _)| p).collect::<Vec<_>>();
        assert_eq!(positions, vec![1, 2]);
        assert_eq!(collection.rows[1].cell(0), "");
        assert_eq!(collection.column_index("title"), Some(0));
        assert!(collection.has_header());
        assert!(!Collection::default().has_header());
    }
}
