use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime};
use ulid::Ulid;

/// Named slot holding the serialized entry collection.
pub const ENTRIES_SLOT: &str = "microdosing_journal_entries_v1";
/// Named slot holding the serialized questionnaire schema.
pub const QUESTIONS_SLOT: &str = "microdosing_journal_questions_v1";

pub const DEFAULT_SERIES_WINDOW: usize = 30;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum JournalError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Process-wide named persisted slots. One logical writer, synchronous
/// writes observable immediately after `set` returns.
pub trait SlotStorage {
    /// # Errors
    /// Returns [`JournalError::Storage`] when the backing store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, JournalError>;

    /// # Errors
    /// Returns [`JournalError::Storage`] when the write does not complete.
    fn set(&mut self, key: &str, value: &str) -> Result<(), JournalError>;
}

/// In-memory slot storage for tests and ephemeral journals.
#[derive(Debug, Clone, Default)]
pub struct MemorySlots {
    slots: BTreeMap<String, String>,
}

impl MemorySlots {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SlotStorage for MemorySlots {
    fn get(&self, key: &str) -> Result<Option<String>, JournalError> {
        Ok(self.slots.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), JournalError> {
        self.slots.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Closed set of questionnaire input kinds. Constraint fields ride on the
/// variant that uses them, so a rendered form is a total match over this type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionKind {
    Text,
    Textarea,
    Date,
    Time,
    Select {
        #[serde(default)]
        options: Vec<String>,
    },
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<f64>,
    },
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<f64>,
    },
}

impl QuestionKind {
    /// Draft value a freshly opened form shows for this kind: mid-scale for
    /// ranges, the current date for date inputs, empty text otherwise.
    #[must_use]
    pub fn default_draft(&self, today: Date) -> Value {
        match self {
            Self::Range { min, max, .. } => {
                let mid = (min.unwrap_or(0.0) + max.unwrap_or(10.0)) / 2.0;
                serde_json::Number::from_f64(mid)
                    .map_or_else(|| Value::String(String::new()), Value::Number)
            }
            Self::Date => Value::String(today.to_string()),
            _ => Value::String(String::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionDef {
    pub key: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: QuestionKind,
}

fn range_question(key: &str, label: &str) -> QuestionDef {
    QuestionDef {
        key: key.to_string(),
        label: label.to_string(),
        kind: QuestionKind::Range { min: Some(0.0), max: Some(10.0), step: Some(1.0) },
    }
}

/// Built-in questionnaire used whenever no saved schema exists or the saved
/// schema fails to parse.
#[must_use]
pub fn default_questions() -> Vec<QuestionDef> {
    vec![
        QuestionDef {
            key: "substance".to_string(),
            label: "Substance".to_string(),
            kind: QuestionKind::Text,
        },
        QuestionDef {
            key: "dose".to_string(),
            label: "Dose (g)".to_string(),
            kind: QuestionKind::Number { min: Some(0.0), max: None, step: Some(0.05) },
        },
        QuestionDef {
            key: "date".to_string(),
            label: "Date".to_string(),
            kind: QuestionKind::Date,
        },
        QuestionDef {
            key: "time".to_string(),
            label: "Time".to_string(),
            kind: QuestionKind::Time,
        },
        range_question("mood", "Mood"),
        range_question("anxiety", "Anxiety"),
        range_question("focus", "Focus"),
        range_question("energy", "Energy"),
        QuestionDef {
            key: "notes".to_string(),
            label: "Notes".to_string(),
            kind: QuestionKind::Textarea,
        },
    ]
}

/// Opaque entry identifier. Generated ids are ULIDs (timestamp plus random
/// component); imported ids of any shape are preserved verbatim and never
/// parsed again.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EntryId(pub String);

impl EntryId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Insertion-ordered field map. Values are raw JSON scalars so entries whose
/// keys no longer match the active schema still load, render, and round-trip.
pub type FieldMap = serde_json::Map<String, Value>;

/// One journal submission. Immutable once built; schema edits never rewrite
/// stored entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    #[serde(rename = "createdAt", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub fields: FieldMap,
}

/// Ephemeral draft state for one form: question key to current draft value.
/// Never persisted; rebuilt from the schema after every save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormSession {
    values: FieldMap,
}

impl FormSession {
    #[must_use]
    pub fn from_schema(schema: &[QuestionDef]) -> Self {
        Self::from_schema_at(schema, OffsetDateTime::now_utc().date())
    }

    #[must_use]
    pub fn from_schema_at(schema: &[QuestionDef], today: Date) -> Self {
        let mut values = FieldMap::new();
        for question in schema {
            values.insert(question.key.clone(), question.kind.default_draft(today));
        }
        Self { values }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    #[must_use]
    pub fn values(&self) -> &FieldMap {
        &self.values
    }
}

/// Commit a form session into an immutable entry stamped with a fresh id and
/// the current instant. Pure construction: drafts are copied verbatim, empty
/// values included, and nothing is validated or coerced.
#[must_use]
pub fn build_entry(session: &FormSession, schema: &[QuestionDef]) -> Entry {
    build_entry_at(session, schema, OffsetDateTime::now_utc())
}

#[must_use]
pub fn build_entry_at(
    session: &FormSession,
    schema: &[QuestionDef],
    created_at: OffsetDateTime,
) -> Entry {
    let mut fields = FieldMap::new();
    for question in schema {
        if let Some(value) = session.get(&question.key) {
            fields.insert(question.key.clone(), value.clone());
        }
    }
    // Draft keys the schema no longer names survive a concurrent schema edit.
    for (key, value) in session.values() {
        if !fields.contains_key(key) {
            fields.insert(key.clone(), value.clone());
        }
    }

    Entry { id: EntryId::generate(), created_at, fields }
}

/// Persisted questionnaire schema, one named slot.
#[derive(Debug)]
pub struct SchemaStore<S> {
    storage: S,
}

impl<S: SlotStorage> SchemaStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Load the active schema, falling back to the built-in defaults when the
    /// slot is empty or its content fails to parse.
    ///
    /// # Errors
    /// Returns [`JournalError::Storage`] when the slot cannot be read.
    pub fn load(&self) -> Result<Vec<QuestionDef>, JournalError> {
        let Some(raw) = self.storage.get(QUESTIONS_SLOT)? else {
            return Ok(default_questions());
        };
        Ok(serde_json::from_str(&raw).unwrap_or_else(|_| default_questions()))
    }

    /// # Errors
    /// Returns [`JournalError::Storage`] when the slot cannot be written.
    pub fn save(&mut self, defs: &[QuestionDef]) -> Result<(), JournalError> {
        let raw = serde_json::to_string(defs)
            .map_err(|err| JournalError::Storage(format!("failed to serialize schema: {err}")))?;
        self.storage.set(QUESTIONS_SLOT, &raw)
    }

    /// Parse caller-supplied JSON into a question sequence and persist it.
    /// Malformed input fails synchronously and leaves the stored schema
    /// untouched. Duplicate keys are not rejected here; key uniqueness is a
    /// caller responsibility.
    ///
    /// # Errors
    /// Returns [`JournalError::Parse`] when `raw` is not a well-formed
    /// question sequence, or [`JournalError::Storage`] when the write fails.
    pub fn save_raw(&mut self, raw: &str) -> Result<Vec<QuestionDef>, JournalError> {
        let defs: Vec<QuestionDef> = serde_json::from_str(raw)
            .map_err(|err| JournalError::Parse(format!("invalid question schema: {err}")))?;
        self.save(&defs)?;
        Ok(defs)
    }
}

/// Persisted entry collection, newest first, one named slot. Every mutation
/// re-serializes the whole collection synchronously.
#[derive(Debug)]
pub struct EntryStore<S> {
    storage: S,
}

impl<S: SlotStorage> EntryStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Load all entries, newest first. An empty or unparseable slot yields an
    /// empty collection.
    ///
    /// # Errors
    /// Returns [`JournalError::Storage`] when the slot cannot be read.
    pub fn load_all(&self) -> Result<Vec<Entry>, JournalError> {
        let Some(raw) = self.storage.get(ENTRIES_SLOT)? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }

    /// Insert one entry at the front of the collection.
    ///
    /// # Errors
    /// Returns [`JournalError::Storage`] when persistence fails.
    pub fn append(&mut self, entry: Entry) -> Result<(), JournalError> {
        let mut entries = self.load_all()?;
        entries.insert(0, entry);
        self.persist(&entries)
    }

    /// Remove the entry with the given id. Absent ids are a no-op, so the
    /// call is idempotent. Returns whether an entry was removed.
    ///
    /// # Errors
    /// Returns [`JournalError::Storage`] when persistence fails.
    pub fn remove(&mut self, id: &str) -> Result<bool, JournalError> {
        let mut entries = self.load_all()?;
        let before = entries.len();
        entries.retain(|entry| entry.id.as_str() != id);
        if entries.len() == before {
            return Ok(false);
        }
        self.persist(&entries)?;
        Ok(true)
    }

    /// Replace the whole collection (the import path), preserving the order
    /// given by the caller.
    ///
    /// # Errors
    /// Returns [`JournalError::Storage`] when persistence fails.
    pub fn replace_all(&mut self, entries: &[Entry]) -> Result<(), JournalError> {
        self.persist(entries)
    }

    fn persist(&mut self, entries: &[Entry]) -> Result<(), JournalError> {
        let raw = serde_json::to_string(entries)
            .map_err(|err| JournalError::Storage(format!("failed to serialize entries: {err}")))?;
        self.storage.set(ENTRIES_SLOT, &raw)
    }
}

/// One charted metric: the entry field it reads and the series label it emits.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Metric {
    pub field: String,
    pub label: String,
}

impl Metric {
    #[must_use]
    pub fn new(field: &str, label: &str) -> Self {
        Self { field: field.to_string(), label: label.to_string() }
    }
}

#[must_use]
pub fn default_metrics() -> Vec<Metric> {
    vec![
        Metric::new("mood", "Mood"),
        Metric::new("anxiety", "Anxiety"),
        Metric::new("focus", "Focus"),
        Metric::new("energy", "Energy"),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPoint {
    pub date: String,
    pub metrics: BTreeMap<String, f64>,
}

/// Numeric coercion for charting: numbers pass through, numeric strings
/// parse, everything else (missing, null, non-numeric) becomes 0.
#[must_use]
pub fn metric_value(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Project entries into a chart-ready series using the default metric set.
#[must_use]
pub fn project(entries: &[Entry], window: usize) -> Vec<DataPoint> {
    project_metrics(entries, window, &default_metrics())
}

/// Project the trailing `window` entries, oldest first, one point per entry.
/// Output order is insertion order: entries appended out of calendar order
/// chart in the order they were written, never re-sorted by date string.
#[must_use]
pub fn project_metrics(entries: &[Entry], window: usize, metrics: &[Metric]) -> Vec<DataPoint> {
    let oldest_first: Vec<&Entry> = entries.iter().rev().collect();
    let start = oldest_first.len().saturating_sub(window);
    oldest_first[start..]
        .iter()
        .map(|entry| {
            let date = match entry.fields.get("date") {
                Some(Value::String(text)) if !text.is_empty() => text.clone(),
                _ => entry.created_at.date().to_string(),
            };
            let point_metrics = metrics
                .iter()
                .map(|metric| {
                    (metric.label.clone(), metric_value(entry.fields.get(&metric.field)))
                })
                .collect();
            DataPoint { date, metrics: point_metrics }
        })
        .collect()
}

/// Serialize the entry collection for export. Round-trips exactly through
/// [`from_json`].
///
/// # Errors
/// Returns [`JournalError::Storage`] when serialization fails.
pub fn to_json(entries: &[Entry]) -> Result<String, JournalError> {
    serde_json::to_string_pretty(entries)
        .map_err(|err| JournalError::Storage(format!("failed to serialize entries: {err}")))
}

/// Parse an exported entry sequence. Field maps are taken as-is with no
/// per-field validation; this trusts the format [`to_json`] produces.
///
/// # Errors
/// Returns [`JournalError::Parse`] when `raw` is not valid JSON or not a
/// sequence of entry-shaped records.
pub fn from_json(raw: &str) -> Result<Vec<Entry>, JournalError> {
    serde_json::from_str(raw).map_err(|err| JournalError::Parse(format!("invalid entry JSON: {err}")))
}

fn csv_escape(cell: &str) -> String {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') || cell.contains('\r') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn rfc3339_string(instant: OffsetDateTime) -> String {
    instant.format(&Rfc3339).unwrap_or_default()
}

/// Render the collection as CSV. The header is `id`, `createdAt`, then the
/// field keys of the first entry in its own order; every later row uses that
/// same header, padding missing values with empty cells and dropping keys the
/// first entry does not define. Cells containing commas, quotes, or newlines
/// are quoted with inner quotes doubled.
#[must_use]
pub fn to_csv(entries: &[Entry]) -> String {
    let Some(first) = entries.first() else {
        return String::new();
    };

    let mut columns = vec!["id".to_string(), "createdAt".to_string()];
    columns.extend(first.fields.keys().cloned());

    let mut out = String::new();
    let header = columns.iter().map(|name| csv_escape(name)).collect::<Vec<_>>();
    out.push_str(&header.join(","));
    out.push('\n');

    for entry in entries {
        let mut cells = vec![csv_escape(entry.id.as_str()), csv_escape(&rfc3339_string(entry.created_at))];
        for key in columns.iter().skip(2) {
            cells.push(csv_escape(&csv_cell(entry.fields.get(key))));
        }
        out.push_str(&cells.join(","));
        out.push('\n');
    }

    out
}
