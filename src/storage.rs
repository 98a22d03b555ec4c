//! Durable persistence of captured records.
//!
//! [`Store`] owns the write/read contract and the per-operation deadline; the
//! wire-level work is delegated to a [`Backend`]. A write issues the keyed
//! JSON document, its retention expiry and the stream append as one batched
//! round-trip. The batch reaches the backend all-or-none, but the backend may
//! apply a prefix of it before failing: callers must treat a write error as
//! "possibly partially applied" and reconcile by key if that matters to them.

pub mod memory;
pub mod redis;

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::record::Record;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

pub const RECORD_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const STREAM_KEY: &str = "data_stream";
pub const PAGE_HASH_KEY: &str = "page_data";
pub const INDEX_NAME: &str = "idx:complete_requests";
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend rejected command: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record `{key}` not found")]
    NotFound { key: String },
    #[error("{operation} exceeded deadline of {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("{operation} failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("encode record: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode stored value `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFieldKind {
    Text,
    Numeric,
    /// Stored for retrieval, not searchable.
    TextNoIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexField {
    pub path: &'static str,
    pub alias: &'static str,
    pub kind: IndexFieldKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub fields: Vec<IndexField>,
}

impl IndexSpec {
    /// Search schema over stored record documents.
    pub fn complete_requests() -> Self {
        use IndexFieldKind::{Numeric, Text, TextNoIndex};

        let field = |path, alias, kind| IndexField { path, alias, kind };
        Self {
            name: INDEX_NAME,
            fields: vec![
                field("$.address", "address", Text),
                field("$.port", "port", Text),
                field("$.useragent", "useragent", Text),
                field("$.method", "method", Text),
                field("$.path", "path", Text),
                field("$.protocol", "protocol", Text),
                field("$.contentlength", "content_length", Numeric),
                field("$.timestamp", "timestamp", Text),
                field("$.body", "body_text", TextNoIndex),
            ],
        }
    }

    /// Arguments following `FT.CREATE`.
    pub fn create_args(&self) -> Vec<String> {
        let mut args = vec![
            self.name.to_owned(),
            "ON".to_owned(),
            "JSON".to_owned(),
            "SCHEMA".to_owned(),
        ];
        for field in &self.fields {
            args.push(field.path.to_owned());
            args.push("AS".to_owned());
            args.push(field.alias.to_owned());
            match field.kind {
                IndexFieldKind::Text => args.push("TEXT".to_owned()),
                IndexFieldKind::Numeric => args.push("NUMERIC".to_owned()),
                IndexFieldKind::TextNoIndex => {
                    args.push("TEXT".to_owned());
                    args.push("NOINDEX".to_owned());
                }
            }
        }
        args
    }
}

/// One record write: document, expiry and stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    pub key: String,
    pub document: String,
    pub ttl: Duration,
    pub stream: &'static str,
    pub stream_id: String,
}

#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), BackendError>;

    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexOutcome, BackendError>;

    /// Sends all operations of `batch` in a single round-trip.
    async fn write_batch(&self, batch: &WriteBatch) -> Result<(), BackendError>;

    async fn get_document(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn get_page(&self, endpoint: &str) -> Result<Option<String>, BackendError>;
}

/// Response stored by analyst tooling under `page_data`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoredPage {
    #[serde(default)]
    pub body: String,
    #[serde(rename = "statusCode", default = "default_page_status")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_page_status() -> u16 {
    200
}

/// Hands out record keys: Unix milliseconds, strictly increasing per process.
#[derive(Debug, Default)]
pub struct KeyClock {
    last_millis: AtomicU64,
}

impl KeyClock {
    /// A capture landing in an already-issued millisecond takes the next free one.
    pub fn next_key(&self, captured_at: DateTime<Utc>) -> String {
        let millis = u64::try_from(captured_at.timestamp_millis()).unwrap_or(0);
        let mut last = self.last_millis.load(Ordering::Acquire);
        loop {
            let candidate = millis.max(last.saturating_add(1));
            match self.last_millis.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate.to_string(),
                Err(actual) => last = actual,
            }
        }
    }
}

#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    operation_timeout: Duration,
    keys: Arc<KeyClock>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            keys: Arc::new(KeyClock::default()),
        }
    }

    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn next_key(&self, captured_at: DateTime<Utc>) -> String {
        self.keys.next_key(captured_at)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.bounded("ping", self.backend.ping()).await
    }

    /// Creates the search index; an existing index counts as success.
    pub async fn ensure_index(&self) -> Result<IndexOutcome, StoreError> {
        let spec = IndexSpec::complete_requests();
        self.bounded("create index", self.backend.create_index(&spec))
            .await
    }

    pub async fn write(&self, key: &str, record: &Record) -> Result<(), StoreError> {
        let document = record.to_json().map_err(StoreError::Encode)?;
        let batch = WriteBatch {
            key: key.to_owned(),
            document,
            ttl: RECORD_TTL,
            stream: STREAM_KEY,
            stream_id: Utc::now().timestamp_millis().to_string(),
        };
        self.bounded("write record", self.backend.write_batch(&batch))
            .await
    }

    pub async fn read(&self, key: &str) -> Result<Record, StoreError> {
        let document = self
            .bounded("read record", self.backend.get_document(key))
            .await?
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_owned(),
            })?;
        Record::from_json(&document).map_err(|source| StoreError::Decode {
            key: key.to_owned(),
            source,
        })
    }

    pub async fn page(&self, endpoint: &str) -> Result<Option<StoredPage>, StoreError> {
        let Some(raw) = self
            .bounded("read page", self.backend.get_page(endpoint))
            .await?
        else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Decode {
                key: format!("{PAGE_HASH_KEY}/{endpoint}"),
                source,
            })
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        future: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.operation_timeout, future).await {
            Ok(result) => result.map_err(|source| StoreError::Backend { operation, source }),
            Err(_) => Err(StoreError::Timeout {
                operation,
                timeout: self.operation_timeout,
            }),
        }
    }
}
