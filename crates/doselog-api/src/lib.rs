use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use doselog_core::{
    build_entry, default_questions, from_json, project, to_csv, to_json, DataPoint, Entry,
    EntryStore, FormSession, JournalError, MemorySlots, QuestionDef, SchemaStore, SlotStorage,
};
use doselog_store_sqlite::SqliteSlots;

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Environment variable naming the remote mirror collector endpoint.
pub const MIRROR_URL_ENV: &str = "DOSELOG_MIRROR_URL";

const MIRROR_TIMEOUT_MS: u64 = 5_000;

/// Best-effort notification of newly created entries. Implementations must
/// never fail, never retry, and never block the save path.
pub trait MirrorSink: Send + Sync {
    fn mirror(&self, entry: &Entry);
}

/// Default sink: mirroring disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMirror;

impl MirrorSink for NoopMirror {
    fn mirror(&self, _entry: &Entry) {}
}

/// Fire-and-forget HTTP mirror. Each entry is POSTed as JSON from a detached
/// thread; the response is ignored and transport failures end as one stderr
/// line. The process may exit before delivery completes.
#[derive(Debug, Clone)]
pub struct HttpMirror {
    endpoint: String,
}

impl HttpMirror {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into() }
    }

    #[must_use]
    pub fn from_env() -> Option<Self> {
        mirror_endpoint_from_env().map(Self::new)
    }
}

impl MirrorSink for HttpMirror {
    fn mirror(&self, entry: &Entry) {
        let Ok(body) = serde_json::to_string(entry) else {
            return;
        };
        let endpoint = self.endpoint.clone();

        std::thread::spawn(move || {
            let agent = ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_millis(MIRROR_TIMEOUT_MS))
                .timeout_read(Duration::from_millis(MIRROR_TIMEOUT_MS))
                .timeout_write(Duration::from_millis(MIRROR_TIMEOUT_MS))
                .build();
            if let Err(err) = agent
                .post(&endpoint)
                .set("content-type", "application/json")
                .send_string(&body)
            {
                eprintln!("[mirror] post to {endpoint} failed: {err}");
            }
        });
    }
}

#[must_use]
pub fn mirror_endpoint_from_env() -> Option<String> {
    std::env::var(MIRROR_URL_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Resolve the mirror sink for this process, warning once when mirroring is
/// disabled.
#[must_use]
pub fn mirror_from_env() -> Box<dyn MirrorSink> {
    match HttpMirror::from_env() {
        Some(mirror) => Box::new(mirror),
        None => {
            eprintln!("[mirror] {MIRROR_URL_ENV} is not set; remote mirroring disabled");
            Box::new(NoopMirror)
        }
    }
}

/// Application facade over the two persisted stores and the mirror sink.
/// Collections are re-read from storage on every operation; nothing is cached
/// or shared by reference.
pub struct Journal<S> {
    schema: SchemaStore<S>,
    entries: EntryStore<S>,
    mirror: Box<dyn MirrorSink>,
}

impl Journal<SqliteSlots> {
    /// Open a journal persisted in the SQLite database at `db_path`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn open(db_path: &Path) -> Result<Self> {
        let schema_slots = SqliteSlots::open(db_path)?;
        let entry_slots = SqliteSlots::open(db_path)?;
        Ok(Self::new(schema_slots, entry_slots))
    }
}

impl Journal<MemorySlots> {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemorySlots::new(), MemorySlots::new())
    }
}

impl<S: SlotStorage> Journal<S> {
    pub fn new(schema_slots: S, entry_slots: S) -> Self {
        Self {
            schema: SchemaStore::new(schema_slots),
            entries: EntryStore::new(entry_slots),
            mirror: Box::new(NoopMirror),
        }
    }

    #[must_use]
    pub fn with_mirror(mut self, mirror: Box<dyn MirrorSink>) -> Self {
        self.mirror = mirror;
        self
    }

    /// # Errors
    /// Returns [`JournalError::Storage`] when the schema slot cannot be read.
    pub fn schema(&self) -> Result<Vec<QuestionDef>, JournalError> {
        self.schema.load()
    }

    /// # Errors
    /// Returns [`JournalError::Parse`] for malformed schema JSON (the stored
    /// schema is left unchanged) or [`JournalError::Storage`] on write failure.
    pub fn save_schema_raw(&mut self, raw: &str) -> Result<Vec<QuestionDef>, JournalError> {
        self.schema.save_raw(raw)
    }

    /// # Errors
    /// Returns [`JournalError::Storage`] when the write fails.
    pub fn reset_schema(&mut self) -> Result<Vec<QuestionDef>, JournalError> {
        let defaults = default_questions();
        self.schema.save(&defaults)?;
        Ok(defaults)
    }

    /// Fresh form session initialized to the active schema's defaults.
    ///
    /// # Errors
    /// Returns [`JournalError::Storage`] when the schema slot cannot be read.
    pub fn new_session(&self) -> Result<FormSession, JournalError> {
        Ok(FormSession::from_schema(&self.schema.load()?))
    }

    /// Commit a form session: build the entry, persist it at the front of the
    /// collection, hand it to the mirror sink, and return it together with a
    /// fresh session reset to schema defaults. The mirror call cannot fail and
    /// does not delay the synchronous save.
    ///
    /// # Errors
    /// Returns [`JournalError::Storage`] when persistence fails; the mirror is
    /// not invoked in that case.
    pub fn submit(&mut self, session: &FormSession) -> Result<(Entry, FormSession), JournalError> {
        let schema = self.schema.load()?;
        let entry = build_entry(session, &schema);
        self.entries.append(entry.clone())?;
        self.mirror.mirror(&entry);
        Ok((entry, FormSession::from_schema(&schema)))
    }

    /// # Errors
    /// Returns [`JournalError::Storage`] when the entry slot cannot be read.
    pub fn entries(&self) -> Result<Vec<Entry>, JournalError> {
        self.entries.load_all()
    }

    /// Delete one entry by id; absent ids are a no-op. Confirmation belongs
    /// to the calling surface.
    ///
    /// # Errors
    /// Returns [`JournalError::Storage`] when persistence fails.
    pub fn delete(&mut self, id: &str) -> Result<bool, JournalError> {
        self.entries.remove(id)
    }

    /// # Errors
    /// Returns [`JournalError::Storage`] when the entry slot cannot be read.
    pub fn series(&self, window: usize) -> Result<Vec<DataPoint>, JournalError> {
        Ok(project(&self.entries.load_all()?, window))
    }

    /// # Errors
    /// Returns [`JournalError::Storage`] when the entry slot cannot be read.
    pub fn export_csv(&self) -> Result<String, JournalError> {
        Ok(to_csv(&self.entries.load_all()?))
    }

    /// # Errors
    /// Returns [`JournalError::Storage`] when the entry slot cannot be read
    /// or the collection cannot be serialized.
    pub fn export_json(&self) -> Result<String, JournalError> {
        to_json(&self.entries.load_all()?)
    }

    /// Replace the collection with an imported entry sequence, preserving the
    /// order given. Returns the number of imported entries.
    ///
    /// # Errors
    /// Returns [`JournalError::Parse`] when `raw` is not a valid entry
    /// sequence (the stored collection is left unchanged), or
    /// [`JournalError::Storage`] when persistence fails.
    pub fn import_json(&mut self, raw: &str) -> Result<usize, JournalError> {
        let imported = from_json(raw)?;
        self.entries.replace_all(&imported)?;
        Ok(imported.len())
    }
}
