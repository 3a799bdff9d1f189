//! `Request`: the immutable description of an HTTP transaction to perform.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{de::Visitor, Deserialize, Serialize};

use crate::headers::HeaderMultiMap;

/// Supported HTTP methods. Unlike `http::Method`, this is a closed set —
/// only the methods the dispatcher is specified to support.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// GET and DELETE requests must not carry a body; rejected at
    /// construction rather than forwarded verbatim.
    pub fn allows_body(self) -> bool {
        !matches!(self, Method::Get | Method::Delete)
    }
}

impl FromStr for Method {
    type Err = ParseMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(ParseMethodError(other.to_owned())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("{0} is not a supported HTTP method")]
pub struct ParseMethodError(pub String);

struct MethodVisitor;

impl<'de> Visitor<'de> for MethodVisitor {
    type Value = Method;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "one of GET, POST, PUT, PATCH, DELETE")
    }

    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Method::from_str(s).map_err(|_| serde::de::Error::invalid_value(serde::de::Unexpected::Str(s), &self))
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(MethodVisitor)
    }
}

impl Serialize for Method {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<Method> for http::Method {
    fn from(value: Method) -> Self {
        match value {
            Method::Get => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Patch => http::Method::PATCH,
            Method::Delete => http::Method::DELETE,
        }
    }
}

/// Errors constructing a `Request`.
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("{0} requests cannot carry a body")]
    BodyNotAllowed(Method),
    #[error("body and json are mutually exclusive")]
    BodyAndJsonBothSet,
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// An immutable description of a single HTTP request to issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMultiMap,
    pub body: Option<Vec<u8>>,
    #[serde(with = "duration_millis_opt", default)]
    pub timeout: Option<Duration>,
    pub max_redirects: Option<u32>,
}

impl Request {
    /// Construct a `Request`, enforcing the method/url/body invariants.
    ///
    /// `body` and `json` are mutually exclusive; passing `json` serializes it
    /// and sets `content-type: application/json; encoding=utf-8` if unset.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: Method,
        url: &str,
        headers: HeaderMultiMap,
        body: Option<Vec<u8>>,
        json: Option<serde_json::Value>,
        timeout: Option<Duration>,
        max_redirects: Option<u32>,
    ) -> Result<Self, RequestError> {
        if body.is_some() && json.is_some() {
            return Err(RequestError::BodyAndJsonBothSet);
        }

        let mut headers = headers;
        let body = if let Some(value) = json {
            if !headers.contains("content-type") {
                headers.set("content-type", "application/json; encoding=utf-8");
            }
            Some(serde_json::to_vec(&value).expect("Value always serializes"))
        } else {
            body
        };

        if body.is_some() && !method.allows_body() {
            return Err(RequestError::BodyNotAllowed(method));
        }

        // Validate the URL is at least parseable; resolution against a base
        // happens in `RequestTemplate`, this just rejects garbage early.
        url::Url::parse(url)?;

        Ok(Self {
            method,
            url: url.to_owned(),
            headers,
            body,
            timeout,
            max_redirects,
        })
    }
}

mod duration_millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let ms: Option<u64> = Option::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_with_body_is_rejected() {
        let err = Request::new(Method::Get, "http://x.test/", HeaderMultiMap::new(), Some(vec![1]), None, None, None)
            .unwrap_err();
        assert!(matches!(err, RequestError::BodyNotAllowed(Method::Get)));
    }

    #[test]
    fn delete_with_body_is_rejected() {
        let err = Request::new(Method::Delete, "http://x.test/", HeaderMultiMap::new(), Some(vec![1]), None, None, None)
            .unwrap_err();
        assert!(matches!(err, RequestError::BodyNotAllowed(Method::Delete)));
    }

    #[test]
    fn body_and_json_are_mutually_exclusive() {
        let err = Request::new(
            Method::Post,
            "http://x.test/",
            HeaderMultiMap::new(),
            Some(vec![1]),
            Some(serde_json::json!({"a": 1})),
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::BodyAndJsonBothSet));
    }

    #[test]
    fn json_sets_content_type_if_absent() {
        let req = Request::new(
            Method::Post,
            "http://x.test/",
            HeaderMultiMap::new(),
            None,
            Some(serde_json::json!({"a": 1})),
            None,
            None,
        )
        .unwrap();
        assert_eq!(req.headers.get("content-type"), Some("application/json; encoding=utf-8"));
        assert_eq!(req.body.unwrap(), serde_json::to_vec(&serde_json::json!({"a": 1})).unwrap());
    }

    #[test]
    fn invalid_url_is_rejected() {
        let err = Request::new(Method::Get, "not a url", HeaderMultiMap::new(), None, None, None, None).unwrap_err();
        assert!(matches!(err, RequestError::InvalidUrl(_)));
    }
}
