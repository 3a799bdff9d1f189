//! `Response`: the immutable outcome of a successfully-completed HTTP
//! transaction (including non-2xx statuses, unless `raise_error_responses`
//! routed it through `ErrorValue::Http` instead).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::headers::HeaderMultiMap;
use crate::request::Method;

/// Opaque JSON-native callback arguments, stringified at the producer
/// boundary so keys are always plain strings regardless of what the
/// caller passed in.
pub type CallbackArgs = std::collections::BTreeMap<String, serde_json::Value>;

/// The encoded representation of a response body as it crosses the
/// dispatcher boundary, produced by `crate::payload::encode_body`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodedBody {
    pub encoding: BodyEncoding,
    pub value: String,
    pub charset: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    Text,
    Gzipped,
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMultiMap,
    pub body: Option<EncodedBody>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub request_id: String,
    pub url: String,
    pub http_method: Method,
    pub callback_args: CallbackArgs,
    pub redirects: Vec<String>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        value.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
