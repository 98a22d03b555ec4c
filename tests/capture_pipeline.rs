use std::{
    io::{Read as _, Seek as _, SeekFrom},
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use hookcatch::{
    config::ServerConfig,
    logging,
    rate_limit::{ClientRateLimiter, RateLimitSettings},
    record::{MAX_BODY_BYTES, Record},
    server::{self, ACKNOWLEDGEMENT, COLLECTOR_SCRIPT, ServerHandle},
    storage::{MemoryBackend, STREAM_KEY, Store},
};
use http_body_util::{BodyExt as _, Full};
use hyper::{HeaderMap, Method, Request, StatusCode, Uri, header};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use serde_json::Value;
use tracing_subscriber::filter::LevelFilter;

struct Harness {
    server: ServerHandle,
    backend: Arc<MemoryBackend>,
    store: Store,
    client: Client<HttpConnector, Full<Bytes>>,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

fn generous_limits() -> RateLimitSettings {
    RateLimitSettings {
        requests_per_second: 1_000.0,
        burst: 1_000,
        idle_ttl: Duration::from_secs(600),
    }
}

async fn start(settings: RateLimitSettings) -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    let store = Store::new(backend.clone());
    let limiter = Arc::new(ClientRateLimiter::new(settings));
    let config = ServerConfig {
        addr: "127.0.0.1".to_owned(),
        port: 0,
        ..ServerConfig::default()
    };
    let server = server::serve(&config, limiter, store.clone())
        .await
        .expect("server should start");

    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    let client = Client::builder(TokioExecutor::new()).build(connector);

    Harness {
        server,
        backend,
        store,
        client,
    }
}

impl Harness {
    async fn send(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) -> Reply {
        send_to(
            &self.client,
            self.server.listen_addr,
            method,
            path_and_query,
            headers,
            body.into(),
        )
        .await
    }

    async fn stored_records(&self) -> Vec<(String, Record)> {
        let mut records = Vec::new();
        for key in self.backend.document_keys() {
            let record = self.store.read(&key).await.expect("stored record should read");
            records.push((key, record));
        }
        records
    }
}

async fn send_to(
    client: &Client<HttpConnector, Full<Bytes>>,
    listen_addr: SocketAddr,
    method: Method,
    path_and_query: &str,
    headers: &[(&str, &str)],
    body: Bytes,
) -> Reply {
    let uri: Uri = format!("http://{listen_addr}{path_and_query}")
        .parse()
        .unwrap();
    let mut request_builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        request_builder = request_builder.header(*name, *value);
    }
    let request = request_builder.body(Full::new(body)).unwrap();
    let response = client.request(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    Reply {
        status,
        headers,
        body,
    }
}

fn assert_cors(headers: &HeaderMap) {
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "*");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "*");
    assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "86400");
    assert_eq!(headers[header::VARY], "Origin");
}

#[tokio::test]
async fn options_preflight_is_answered_without_capture() {
    let harness = start(generous_limits()).await;

    let reply = harness.send(Method::OPTIONS, "/", &[], Bytes::new()).await;

    assert_eq!(reply.status, StatusCode::NO_CONTENT);
    assert!(reply.body.is_empty());
    assert_cors(&reply.headers);
    assert!(harness.backend.document_keys().is_empty());
    harness.server.shutdown().await;
}

#[tokio::test]
async fn capture_stores_record_and_acknowledges() {
    let harness = start(generous_limits()).await;

    let reply = harness
        .send(
            Method::POST,
            "/?q=1&q=2",
            &[
                ("user-agent", "integration-test/1.0"),
                ("cookie", "sid=abc"),
                ("x-custom", "kept"),
            ],
            "hello world",
        )
        .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&reply.body[..], ACKNOWLEDGEMENT.as_bytes());
    assert_cors(&reply.headers);

    let records = harness.stored_records().await;
    assert_eq!(records.len(), 1);
    let (key, record) = &records[0];
    assert_eq!(record.address, "127.0.0.1");
    assert!(!record.port.is_empty());
    assert_eq!(record.method, "POST");
    assert_eq!(record.path, "/");
    assert_eq!(record.protocol, "HTTP/1.1");
    assert_eq!(record.user_agent, "integration-test/1.0");
    assert_eq!(record.body, b"hello world");
    assert_eq!(record.content_length, 11);
    assert_eq!(record.form.get("q"), Some(&vec!["1".to_owned(), "2".to_owned()]));
    assert_eq!(record.headers.get("X-Custom"), Some(&vec!["kept".to_owned()]));
    assert_eq!(record.cookies.len(), 1);
    assert_eq!(record.cookies[0].name, "sid");
    assert!(record.report.is_none());
    assert_eq!(key, &record.timestamp.timestamp_millis().to_string());

    let stream = harness.backend.stream_entries(STREAM_KEY);
    assert_eq!(stream.len(), 1);
    assert_eq!(&stream[0].key, key);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn rate_limit_denies_after_burst_and_stores_nothing_for_denials() {
    let harness = start(RateLimitSettings {
        requests_per_second: 0.01,
        burst: 10,
        idle_ttl: Duration::from_secs(600),
    })
    .await;

    for attempt in 0..10 {
        let reply = harness.send(Method::POST, "/", &[], "x").await;
        assert_eq!(reply.status, StatusCode::OK, "attempt {attempt}");
    }
    let denied = harness.send(Method::POST, "/", &[], "x").await;
    assert_eq!(denied.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(&denied.body[..], b"Too many requests");
    assert_cors(&denied.headers);

    assert_eq!(harness.backend.document_keys().len(), 10);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn report_payload_is_attached_field_for_field() {
    let harness = start(generous_limits()).await;
    let payload = serde_json::json!({
        "uri": "https://victim.test/inbox",
        "cookies": "session=s3cr3t",
        "referrer": "https://victim.test/",
        "user_agent": "Mozilla/5.0 (Victim)",
        "origin": "https://victim.test",
        "lang": "it-IT",
        "gpu": "ANGLE (Intel)",
        "localstorage": {"jwt": "eyJ"},
        "sessionstorage": {"tab": "2"},
        "dom": "<html><body>inbox</body></html>",
        "screenshot": "iVBORw0KGgo="
    });

    let reply = harness
        .send(
            Method::POST,
            "/",
            &[("x-report", "1"), ("content-type", "application/json")],
            payload.to_string(),
        )
        .await;
    assert_eq!(reply.status, StatusCode::OK);

    let records = harness.stored_records().await;
    let report = records[0].1.report.clone().expect("report should be attached");
    assert_eq!(report.uri, "https://victim.test/inbox");
    assert_eq!(report.cookies, "session=s3cr3t");
    assert_eq!(report.referrer, "https://victim.test/");
    assert_eq!(report.user_agent, "Mozilla/5.0 (Victim)");
    assert_eq!(report.origin, "https://victim.test");
    assert_eq!(report.lang, "it-IT");
    assert_eq!(report.gpu, "ANGLE (Intel)");
    assert_eq!(report.local_storage.get("jwt").map(String::as_str), Some("eyJ"));
    assert_eq!(report.session_storage.get("tab").map(String::as_str), Some("2"));
    assert_eq!(report.dom, "<html><body>inbox</body></html>");
    assert_eq!(report.screenshot, "iVBORw0KGgo=");
    harness.server.shutdown().await;
}

#[tokio::test]
async fn malformed_report_degrades_to_plain_capture() {
    let harness = start(generous_limits()).await;

    let reply = harness
        .send(Method::POST, "/", &[("x-report", "1")], "{\"uri\": ")
        .await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(&reply.body[..], ACKNOWLEDGEMENT.as_bytes());
    let records = harness.stored_records().await;
    assert_eq!(records.len(), 1);
    assert!(records[0].1.report.is_none());
    assert_eq!(records[0].1.body, b"{\"uri\": ");

    let stored_json = harness.backend.stream_entries(STREAM_KEY)[0].value.clone();
    let value: serde_json::Value = serde_json::from_str(&stored_json).unwrap();
    assert!(value.get("report").is_none(), "stored document: {value}");
    harness.server.shutdown().await;
}

#[tokio::test]
async fn oversized_body_is_stored_truncated_to_cap() {
    let harness = start(generous_limits()).await;
    let oversized = Bytes::from(vec![b'z'; MAX_BODY_BYTES + 4096]);

    // The server answers before consuming the tail, so the client may see
    // the connection close early; only the stored record matters here.
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{}/", harness.server.listen_addr))
        .body(Full::new(oversized))
        .unwrap();
    let _ = harness.client.request(request).await;

    let mut keys = Vec::new();
    for _ in 0..50 {
        keys = harness.backend.document_keys();
        if !keys.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(keys.len(), 1, "expected exactly one stored record");
    let record = harness.store.read(&keys[0]).await.unwrap();
    assert_eq!(record.body.len(), MAX_BODY_BYTES);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn store_failure_maps_to_server_error() {
    let harness = start(generous_limits()).await;
    harness.backend.fail_next_write("READONLY replica");

    let reply = harness.send(Method::PUT, "/upload", &[], "data").await;

    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(&reply.body[..], b"Error storing request");
    assert_cors(&reply.headers);
    harness.server.shutdown().await;
}

#[tokio::test]
async fn collector_script_is_served_with_script_headers() {
    let harness = start(generous_limits()).await;

    let reply = harness.send(Method::GET, "/_", &[], Bytes::new()).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers[header::CONTENT_TYPE], "application/javascript");
    assert_eq!(reply.headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert_eq!(&reply.body[..], COLLECTOR_SCRIPT);
    assert_cors(&reply.headers);
    assert!(harness.backend.document_keys().is_empty());
    harness.server.shutdown().await;
}

#[tokio::test]
async fn stored_pages_replay_and_missing_pages_are_not_found() {
    let harness = start(generous_limits()).await;
    harness.backend.put_page(
        "landing",
        r#"{"body":"<h1>owned</h1>","statusCode":202,"headers":{"Content-Type":"text/html","X-Page":"1"}}"#,
    );

    let replayed = harness.send(Method::GET, "/landing", &[], Bytes::new()).await;
    assert_eq!(replayed.status, StatusCode::ACCEPTED);
    assert_eq!(replayed.headers[header::CONTENT_TYPE], "text/html");
    assert_eq!(replayed.headers["x-page"], "1");
    assert_eq!(&replayed.body[..], b"<h1>owned</h1>");
    assert_cors(&replayed.headers);

    let missing = harness.send(Method::GET, "/nowhere", &[], Bytes::new()).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(&missing.body[..], b"Page not found");

    assert!(
        harness.backend.document_keys().is_empty(),
        "page lookups are not captures"
    );

    let posted = harness.send(Method::POST, "/landing", &[], "beacon").await;
    assert_eq!(posted.status, StatusCode::OK);
    let records = harness.stored_records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].1.path, "/landing");
    harness.server.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_accepting_connections() {
    let harness = start(generous_limits()).await;
    let listen_addr = harness.server.listen_addr;
    let reply = harness.send(Method::GET, "/a/b", &[], Bytes::new()).await;
    assert_eq!(reply.status, StatusCode::OK);

    tokio::time::timeout(Duration::from_secs(10), harness.server.shutdown())
        .await
        .expect("shutdown should finish within the grace period");

    assert!(tokio::net::TcpStream::connect(listen_addr).await.is_err());
}

fn log_lines(log_file: &mut std::fs::File) -> Vec<Value> {
    let mut output = String::new();
    log_file
        .seek(SeekFrom::Start(0))
        .expect("rewind log file");
    log_file
        .read_to_string(&mut output)
        .expect("log output should be UTF-8");
    output
        .lines()
        .map(|line| serde_json::from_str(line).expect("log line should be valid JSON"))
        .collect()
}

fn find_event<'a>(lines: &'a [Value], message: &str) -> &'a Value {
    lines
        .iter()
        .find(|line| line.pointer("/fields/message").and_then(Value::as_str) == Some(message))
        .unwrap_or_else(|| panic!("no `{message}` event in {lines:?}"))
}

#[tokio::test]
async fn capture_and_denial_emit_structured_json_events() {
    let log_file = tempfile::tempfile().expect("create log file");
    let mut reader = log_file.try_clone().expect("clone log file handle");
    let _subscriber = tracing::subscriber::set_default(logging::json_subscriber(
        LevelFilter::INFO,
        Mutex::new(log_file),
    ));

    let harness = start(RateLimitSettings {
        requests_per_second: 0.01,
        burst: 1,
        idle_ttl: Duration::from_secs(600),
    })
    .await;

    let admitted = harness
        .send(Method::POST, "/hook?source=ci", &[], "payload")
        .await;
    assert_eq!(admitted.status, StatusCode::OK);
    let denied = harness.send(Method::POST, "/hook", &[], "again").await;
    assert_eq!(denied.status, StatusCode::TOO_MANY_REQUESTS);
    harness.server.shutdown().await;

    let lines = log_lines(&mut reader);
    let key = harness.backend.document_keys().pop().expect("one stored record");

    let completed = find_event(&lines, "capture request completed");
    assert_eq!(completed["level"], "INFO");
    assert_eq!(completed["target"], "hookcatch::server");
    assert_eq!(completed.pointer("/fields/method").and_then(Value::as_str), Some("POST"));
    assert_eq!(completed.pointer("/fields/path").and_then(Value::as_str), Some("/hook"));
    assert_eq!(
        completed.pointer("/fields/client").and_then(Value::as_str),
        Some("127.0.0.1")
    );
    assert_eq!(completed.pointer("/fields/status").and_then(Value::as_u64), Some(200));
    assert_eq!(
        completed.pointer("/fields/key").and_then(Value::as_str),
        Some(key.as_str())
    );
    assert_eq!(completed.pointer("/fields/body_bytes").and_then(Value::as_u64), Some(7));

    let limited = find_event(&lines, "rate limit exceeded");
    assert_eq!(limited["level"], "WARN");
    assert_eq!(
        limited.pointer("/fields/client").and_then(Value::as_str),
        Some("127.0.0.1")
    );
}
