//! Captured exchange data model and its JSON document encoding.
//!
//! The field names are the stored wire format shared with downstream analyst
//! tooling and must stay stable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Hard cap on captured body bytes.
pub const MAX_BODY_BYTES: usize = 10 << 20;

/// Header whose presence marks the body as a browser report.
pub const REPORT_TRIGGER_HEADER: &str = "x-report";

pub type MultiValueMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub address: String,
    pub port: String,
    #[serde(rename = "useragent")]
    pub user_agent: String,
    pub method: String,
    pub path: String,
    pub headers: MultiValueMap,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    pub cookies: Vec<CapturedCookie>,
    #[serde(rename = "contentlength")]
    pub content_length: i64,
    pub protocol: String,
    pub form: MultiValueMap,
    #[serde(rename = "postform")]
    pub post_form: MultiValueMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
    #[serde(with = "timestamp_rfc3339")]
    pub timestamp: DateTime<Utc>,
}

impl Record {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(document: &str) -> serde_json::Result<Self> {
        serde_json::from_str(document)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub quoted: bool,
}

/// Browser-side snapshot posted by the collector script.
///
/// Decoding is lenient the way browser payloads need: `null` reads as empty
/// and field names match without regard to ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Report {
    #[serde(deserialize_with = "null_as_default")]
    pub uri: String,
    #[serde(deserialize_with = "null_as_default")]
    pub cookies: String,
    #[serde(deserialize_with = "null_as_default")]
    pub referrer: String,
    #[serde(alias = "user-agent", deserialize_with = "null_as_default")]
    pub user_agent: String,
    #[serde(deserialize_with = "null_as_default")]
    pub origin: String,
    #[serde(deserialize_with = "null_as_default")]
    pub lang: String,
    #[serde(deserialize_with = "null_as_default")]
    pub gpu: String,
    #[serde(rename = "localstorage", deserialize_with = "null_as_default")]
    pub local_storage: BTreeMap<String, String>,
    #[serde(rename = "sessionstorage", deserialize_with = "null_as_default")]
    pub session_storage: BTreeMap<String, String>,
    #[serde(deserialize_with = "null_as_default")]
    pub dom: String,
    #[serde(deserialize_with = "null_as_default")]
    pub screenshot: String,
}

impl Report {
    /// Decodes a collector payload. Keys are folded to lowercase first, so
    /// `URI` and `Referrer` land on their fields; when two keys fold to the
    /// same name the later one in key order wins.
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        let payload: serde_json::Value = serde_json::from_slice(body)?;
        let serde_json::Value::Object(fields) = payload else {
            return serde_json::from_value(payload);
        };
        let folded: serde_json::Map<String, serde_json::Value> = fields
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        serde_json::from_value(serde_json::Value::Object(folded))
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// RFC 3339 in UTC with at least millisecond digits, finer when the instant carries them.
mod timestamp_rfc3339 {
    use chrono::{DateTime, SecondsFormat, Timelike as _, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        let format = match at.nanosecond() % 1_000_000_000 {
            nanos if nanos % 1_000_000 == 0 => SecondsFormat::Millis,
            nanos if nanos % 1_000 == 0 => SecondsFormat::Micros,
            _ => SecondsFormat::Nanos,
        };
        serializer.serialize_str(&at.to_rfc3339_opts(format, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}

mod body_base64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}
