//! Redis Stack backend (RedisJSON + RediSearch).

use redis::{
    Value,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use url::Url;

use super::{Backend, BackendError, IndexOutcome, IndexSpec, PAGE_HASH_KEY, WriteBatch};
use crate::config::BackendConfig;

const INDEX_EXISTS_MARKER: &str = "Index already exists";

/// Shared multiplexed connection; clones are cheap and safe to use concurrently.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

impl RedisBackend {
    pub async fn connect(config: &BackendConfig) -> Result<Self, BackendError> {
        let url = connection_url(config)?;
        let client = redis::Client::open(url.as_str())?;
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(config.operation_timeout())
            .set_response_timeout(config.operation_timeout());
        let connection = ConnectionManager::new_with_config(client, manager_config).await?;
        tracing::debug!(
            host = %config.host,
            port = config.port,
            db = config.db,
            "redis connection established"
        );
        Ok(Self { connection })
    }
}

/// `redis://[:password@]host:port/db`, with IPv6 hosts bracketed and the password escaped.
pub fn connection_url(config: &BackendConfig) -> Result<Url, BackendError> {
    let invalid = |reason: &str| {
        BackendError::Rejected(format!(
            "invalid backend address {}:{}: {reason}",
            config.host, config.port
        ))
    };

    let host = if config.host.contains(':') && !config.host.starts_with('[') {
        format!("[{}]", config.host)
    } else {
        config.host.clone()
    };

    let mut url = Url::parse("redis://localhost").map_err(|err| invalid(&err.to_string()))?;
    url.set_host(Some(&host))
        .map_err(|err| invalid(&err.to_string()))?;
    url.set_port(Some(config.port))
        .map_err(|()| invalid("port not accepted"))?;
    if let Some(password) = config.password.as_deref() {
        url.set_password(Some(password))
            .map_err(|()| invalid("password not accepted"))?;
    }
    url.set_path(&format!("/{}", config.db));
    Ok(url)
}

/// EXEC can carry per-command failures inline; a clean batch answers OK, 1, stream id.
fn check_batch_replies(key: &str, replies: &[Value]) -> Result<(), BackendError> {
    if matches!(replies, [Value::Okay, Value::Int(1), _]) {
        return Ok(());
    }
    Err(BackendError::Rejected(format!(
        "batch for `{key}` partially applied: {replies:?}"
    )))
}

#[async_trait::async_trait]
impl Backend for RedisBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        let mut connection = self.connection.clone();
        let _: () = redis::cmd("PING").query_async(&mut connection).await?;
        Ok(())
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexOutcome, BackendError> {
        let mut connection = self.connection.clone();
        let created: Result<(), redis::RedisError> = redis::cmd("FT.CREATE")
            .arg(spec.create_args())
            .query_async(&mut connection)
            .await;
        match created {
            Ok(()) => Ok(IndexOutcome::Created),
            Err(err) if err.to_string().contains(INDEX_EXISTS_MARKER) => {
                Ok(IndexOutcome::AlreadyExists)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write_batch(&self, batch: &WriteBatch) -> Result<(), BackendError> {
        let mut connection = self.connection.clone();
        let replies: Vec<Value> = redis::pipe()
            .atomic()
            .cmd("JSON.SET")
            .arg(&batch.key)
            .arg("$")
            .arg(&batch.document)
            .cmd("EXPIRE")
            .arg(&batch.key)
            .arg(batch.ttl.as_secs())
            .cmd("XADD")
            .arg(batch.stream)
            .arg("*")
            .arg("key")
            .arg(&batch.key)
            .arg("value")
            .arg(&batch.document)
            .arg("id")
            .arg(&batch.stream_id)
            .query_async(&mut connection)
            .await?;
        check_batch_replies(&batch.key, &replies)
    }

    async fn get_document(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut connection = self.connection.clone();
        let document: Option<String> = redis::cmd("JSON.GET")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        Ok(document)
    }

    async fn get_page(&self, endpoint: &str) -> Result<Option<String>, BackendError> {
        let mut connection = self.connection.clone();
        let page: Option<String> = redis::cmd("HGET")
            .arg(PAGE_HASH_KEY)
            .arg(endpoint)
            .query_async(&mut connection)
            .await?;
        Ok(page)
    }
}
