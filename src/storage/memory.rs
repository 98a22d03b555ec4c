//! In-process backend used by the test suites and `--backend memory` dry runs.
//!
//! Expiry follows `tokio::time`, so paused-clock tests can fast-forward the
//! retention window.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

use super::{Backend, BackendError, IndexOutcome, IndexSpec, WriteBatch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub key: String,
    pub value: String,
    pub id: String,
}

#[derive(Debug)]
struct StoredDocument {
    json: String,
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: HashMap<String, StoredDocument>,
    streams: HashMap<String, Vec<StreamEntry>>,
    pages: HashMap<String, String>,
    indexes: BTreeSet<String>,
    pending_write_failure: Option<String>,
    pending_stream_failure: Option<String>,
    latency: Option<Duration>,
}

#[derive(Debug)]
pub struct MemoryBackend {
    available: AtomicBool,
    state: Mutex<MemoryState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// While unavailable every command fails as if the connection were refused.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Makes the next batch fail with `message` after applying nothing.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.lock().pending_write_failure = Some(message.into());
    }

    /// Makes the next batch store its document and expiry, then fail the
    /// stream append with `message`, the way an `EXEC` reply can.
    pub fn fail_next_stream_append(&self, message: impl Into<String>) {
        self.lock().pending_stream_failure = Some(message.into());
    }

    pub fn put_page(&self, endpoint: impl Into<String>, raw: impl Into<String>) {
        self.lock().pages.insert(endpoint.into(), raw.into());
    }

    pub fn stream_entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.lock().streams.get(stream).cloned().unwrap_or_default()
    }

    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.lock()
            .documents
            .get(key)
            .filter(|document| document.expires_at > Instant::now())
            .map(|document| document.ttl)
    }

    pub fn document_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock()
            .documents
            .iter()
            .filter(|(_, document)| document.expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self) -> Result<(), BackendError> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("connection refused".to_owned()))
        }
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        self.enter().await
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexOutcome, BackendError> {
        self.enter().await?;
        if self.lock().indexes.insert(spec.name.to_owned()) {
            Ok(IndexOutcome::Created)
        } else {
            Ok(IndexOutcome::AlreadyExists)
        }
    }

    async fn write_batch(&self, batch: &WriteBatch) -> Result<(), BackendError> {
        self.enter().await?;
        let mut state = self.lock();
        if let Some(message) = state.pending_write_failure.take() {
            return Err(BackendError::Rejected(message));
        }

        state.documents.insert(
            batch.key.clone(),
            StoredDocument {
                json: batch.document.clone(),
                ttl: batch.ttl,
                expires_at: Instant::now() + batch.ttl,
            },
        );
        if let Some(message) = state.pending_stream_failure.take() {
            return Err(BackendError::Rejected(format!(
                "batch for `{}` partially applied: {message}",
                batch.key
            )));
        }
        state
            .streams
            .entry(batch.stream.to_owned())
            .or_default()
            .push(StreamEntry {
                key: batch.key.clone(),
                value: batch.document.clone(),
                id: batch.stream_id.clone(),
            });
        Ok(())
    }

    async fn get_document(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.enter().await?;
        let mut state = self.lock();
        let now = Instant::now();
        if state
            .documents
            .get(key)
            .is_some_and(|document| document.expires_at <= now)
        {
            state.documents.remove(key);
        }
        Ok(state.documents.get(key).map(|document| document.json.clone()))
    }

    async fn get_page(&self, endpoint: &str) -> Result<Option<String>, BackendError> {
        self.enter().await?;
        Ok(self.lock().pages.get(endpoint).cloned())
    }
}
