//! `ErrorValue`: the immutable sum type delivered to `TaskHandler::OnError`
//! when a task terminates without a (raised) `Response`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::request::Method;
use crate::response::{CallbackArgs, Response};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Timeout,
    Connection,
    Ssl,
    ResponseTooLarge,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RedirectKind {
    Recursive,
    TooMany,
}

/// Fields common to every `ErrorValue` variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub url: String,
    pub http_method: Method,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub request_id: String,
    pub callback_args: CallbackArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ErrorValue {
    Transport {
        kind: TransportKind,
        class_name: String,
        message: String,
        backtrace: Option<String>,
        #[serde(flatten)]
        context: ErrorContext,
    },
    Http {
        response: Response,
    },
    Redirect {
        kind: RedirectKind,
        #[serde(rename = "redirects")]
        visited: Vec<String>,
        #[serde(flatten)]
        context: ErrorContext,
    },
}

impl ErrorValue {
    pub fn transport(
        kind: TransportKind,
        class_name: impl Into<String>,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        ErrorValue::Transport {
            kind,
            class_name: class_name.into(),
            message: message.into(),
            backtrace: None,
            context,
        }
    }

    pub fn redirect(kind: RedirectKind, visited: Vec<String>, context: ErrorContext) -> Self {
        ErrorValue::Redirect {
            kind,
            visited,
            context,
        }
    }

    /// Classify a `reqwest::Error` into a `Transport` variant per distilled
    /// spec §4.7. HTTP status errors never reach this path; reqwest only
    /// surfaces a status-based `Error` when `.error_for_status()` was called,
    /// which the reactor does not use (it inspects `Response::status`
    /// directly instead).
    pub fn classify_reqwest_error(error: &reqwest::Error, context: ErrorContext) -> Self {
        let kind = if error.is_timeout() {
            TransportKind::Timeout
        } else if error.is_connect() {
            TransportKind::Connection
        } else if error_mentions_tls(error) {
            TransportKind::Ssl
        } else {
            TransportKind::Unknown
        };

        ErrorValue::transport(kind, "reqwest::Error", error.to_string(), context)
    }
}

fn error_mentions_tls(error: &reqwest::Error) -> bool {
    let mut source = error.source();
    while let Some(err) = source {
        let msg = err.to_string().to_ascii_lowercase();
        if msg.contains("tls") || msg.contains("ssl") || msg.contains("certificate") {
            return true;
        }
        source = err.source();
    }
    false
}

use std::error::Error as _;

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
