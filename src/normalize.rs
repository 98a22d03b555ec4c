//! Converts an inbound HTTP exchange into a [`Record`].

use std::{error::Error as StdError, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use http_body_util::BodyExt as _;
use hyper::{
    HeaderMap, Method, Request, Version,
    body::Body,
    header::{self, HeaderValue},
};
use thiserror::Error;

use crate::record::{
    CapturedCookie, MAX_BODY_BYTES, MultiValueMap, REPORT_TRIGGER_HEADER, Record, Report,
};

const BODY_LOG_PREVIEW_CHARS: usize = 1000;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("read request body: {0}")]
    BodyRead(#[source] Box<dyn StdError + Send + Sync>),
    #[error("request body not received within {0:?}")]
    BodyReadTimeout(Duration),
    #[error("malformed remote endpoint `{0}`: expected host:port")]
    MalformedRemote(String),
}

#[derive(Debug, Clone)]
pub struct RequestNormalizer {
    max_body_bytes: usize,
    body_read_timeout: Duration,
}

impl Default for RequestNormalizer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl RequestNormalizer {
    pub fn new(body_read_timeout: Duration) -> Self {
        Self {
            max_body_bytes: MAX_BODY_BYTES,
            body_read_timeout,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Builds exactly one record for the exchange. Body read failures and a
    /// remote endpoint without a port are errors; a malformed report payload
    /// is not and only leaves `report` empty.
    pub async fn normalize<B>(
        &self,
        req: Request<B>,
        remote_endpoint: &str,
    ) -> Result<Record, NormalizeError>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (address, port) = split_host_port(remote_endpoint)
            .ok_or_else(|| NormalizeError::MalformedRemote(remote_endpoint.to_owned()))?;
        let (parts, body) = req.into_parts();

        let body = tokio::time::timeout(
            self.body_read_timeout,
            read_body_capped(body, self.max_body_bytes),
        )
        .await
        .map_err(|_| NormalizeError::BodyReadTimeout(self.body_read_timeout))?
        .map_err(NormalizeError::BodyRead)?;
        let timestamp = Utc::now();

        let trimmed = body.trim_ascii();
        if tracing::enabled!(tracing::Level::DEBUG) {
            let preview: String = String::from_utf8_lossy(trimmed)
                .chars()
                .take(BODY_LOG_PREVIEW_CHARS)
                .collect();
            tracing::debug!(client = %address, body = %preview, "captured request body");
        }

        let report = if parts.headers.contains_key(REPORT_TRIGGER_HEADER) && !trimmed.is_empty() {
            match Report::from_slice(&body) {
                Ok(report) => {
                    tracing::debug!(client = %address, uri = %report.uri, "report payload attached");
                    Some(report)
                }
                Err(err) => {
                    tracing::warn!(
                        client = %address,
                        error = %err,
                        "report payload is not valid JSON; storing request without report"
                    );
                    None
                }
            }
        } else {
            None
        };

        let post_form = if accepts_post_form(&parts.method, &parts.headers) {
            parse_form(&body)
        } else {
            MultiValueMap::new()
        };
        let mut form = post_form.clone();
        if let Some(query) = parts.uri.query() {
            for (name, values) in parse_form(query.as_bytes()) {
                form.entry(name).or_default().extend(values);
            }
        }

        Ok(Record {
            address,
            port,
            user_agent: first_header_lossy(&parts.headers, header::USER_AGENT),
            method: parts.method.as_str().to_owned(),
            path: parts.uri.path().to_owned(),
            headers: canonical_headers(&parts.headers),
            body: body.to_vec(),
            cookies: parse_cookies(&parts.headers),
            content_length: declared_content_length(&parts.headers),
            protocol: protocol_label(parts.version),
            form,
            post_form,
            report,
            timestamp,
        })
    }
}

/// Reads at most `max_body_bytes`; anything past the cap is left unread on the wire.
pub async fn read_body_capped<B>(
    mut body: B,
    max_body_bytes: usize,
) -> Result<Bytes, Box<dyn StdError + Send + Sync>>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let mut buffered = Vec::new();
    let mut buffered_len = 0usize;
    while buffered_len < max_body_bytes {
        let Some(frame_result) = body.frame().await else {
            break;
        };
        let frame = match frame_result {
            Ok(frame) => frame,
            Err(err) => return Err(err.into()),
        };
        let Ok(mut data) = frame.into_data() else {
            continue;
        };
        let remaining = max_body_bytes - buffered_len;
        if data.len() > remaining {
            data.truncate(remaining);
        }
        buffered_len += data.len();
        buffered.push(data);
    }

    if buffered_len >= max_body_bytes && !body.is_end_stream() {
        tracing::debug!(limit_bytes = max_body_bytes, "request body truncated at cap");
    }

    Ok(flatten_chunks(buffered, buffered_len))
}

fn flatten_chunks(mut buffered: Vec<Bytes>, buffered_len: usize) -> Bytes {
    if buffered.len() <= 1 {
        return buffered.pop().unwrap_or_default();
    }

    let mut flattened = Vec::with_capacity(buffered_len);
    for chunk in buffered {
        flattened.extend_from_slice(&chunk);
    }
    Bytes::from(flattened)
}

/// Splits `host:port` / `[v6]:port`. Bare hosts and empty ports yield `None`.
pub fn split_host_port(endpoint: &str) -> Option<(String, String)> {
    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        (host, after.strip_prefix(':')?)
    } else {
        let (host, port) = endpoint.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };

    if port.is_empty() || !port.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    Some((host.to_owned(), port.to_owned()))
}

/// `x-forwarded-for` -> `X-Forwarded-For`.
pub fn canonical_header_name(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len());
    let mut upper_next = true;
    for ch in name.chars() {
        if upper_next {
            canonical.push(ch.to_ascii_uppercase());
        } else {
            canonical.push(ch.to_ascii_lowercase());
        }
        upper_next = ch == '-';
    }
    canonical
}

fn canonical_headers(headers: &HeaderMap) -> MultiValueMap {
    let mut canonical = MultiValueMap::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .map(header_value_lossy)
            .collect::<Vec<_>>();
        canonical
            .entry(canonical_header_name(name.as_str()))
            .or_default()
            .extend(values);
    }
    canonical
}

fn header_value_lossy(value: &HeaderValue) -> String {
    String::from_utf8_lossy(value.as_bytes()).into_owned()
}

fn first_header_lossy(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .map(header_value_lossy)
        .unwrap_or_default()
}

fn parse_cookies(headers: &HeaderMap) -> Vec<CapturedCookie> {
    let mut cookies = Vec::new();
    for value in headers.get_all(header::COOKIE) {
        let raw = header_value_lossy(value);
        for pair in raw.split(';') {
            let Some((name, value)) = pair.trim().split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let value = value.trim();
            let (value, quoted) = match value
                .strip_prefix('"')
                .and_then(|inner| inner.strip_suffix('"'))
            {
                Some(inner) => (inner, true),
                None => (value, false),
            };
            cookies.push(CapturedCookie {
                name: name.to_owned(),
                value: value.to_owned(),
                quoted,
            });
        }
    }
    cookies
}

fn accepts_post_form(method: &Method, headers: &HeaderMap) -> bool {
    if !matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
        return false;
    }
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| {
            mime.trim()
                .eq_ignore_ascii_case("application/x-www-form-urlencoded")
        })
}

fn parse_form(input: &[u8]) -> MultiValueMap {
    let mut form = MultiValueMap::new();
    for (name, value) in url::form_urlencoded::parse(input) {
        form.entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    form
}

fn declared_content_length(headers: &HeaderMap) -> i64 {
    if let Some(value) = headers.get(header::CONTENT_LENGTH) {
        return value
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|length| *length >= 0)
            .unwrap_or(-1);
    }
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return -1;
    }
    0
}

fn protocol_label(version: Version) -> String {
    match version {
        Version::HTTP_09 => "HTTP/0.9".to_owned(),
        Version::HTTP_10 => "HTTP/1.0".to_owned(),
        Version::HTTP_11 => "HTTP/1.1".to_owned(),
        Version::HTTP_2 => "HTTP/2.0".to_owned(),
        Version::HTTP_3 => "HTTP/3.0".to_owned(),
        other => format!("{other:?}"),
    }
}
