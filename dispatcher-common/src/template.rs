//! `RequestTemplate`: a pure construction helper for building `Request`s
//! against a fixed base URL.

use std::collections::BTreeMap;
use std::time::Duration;

use url::Url;

use crate::headers::HeaderMultiMap;
use crate::request::{Method, Request, RequestError};

#[derive(thiserror::Error, Debug)]
pub enum TemplateError {
    #[error("failed to resolve url: {0}")]
    UrlResolution(#[from] url::ParseError),
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Options accepted by `RequestTemplate::request`. `body` and `json` are
/// mutually exclusive, enforced downstream by `Request::new`.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub body: Option<Vec<u8>>,
    pub json: Option<serde_json::Value>,
    pub headers: HeaderMultiMap,
    pub params: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub max_redirects: Option<u32>,
}

pub struct RequestTemplate {
    base_url: Url,
}

impl RequestTemplate {
    pub fn new(base_url: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
        })
    }

    /// Build a `Request` by resolving `uri` against `base_url` (absolute-URL
    /// join rules) and appending `params` as standard form-encoded query
    /// parameters, preserving any existing query string.
    pub fn request(&self, method: Method, uri: &str, options: RequestOptions) -> Result<Request, TemplateError> {
        let mut url = self.base_url.join(uri)?;
        if !options.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &options.params {
                pairs.append_pair(k, v);
            }
        }

        Request::new(
            method,
            url.as_str(),
            options.headers,
            options.body,
            options.json,
            options.timeout,
            options.max_redirects,
        )
        .map_err(TemplateError::from)
    }

    pub fn get(&self, uri: &str) -> Result<Request, TemplateError> {
        self.request(Method::Get, uri, RequestOptions::default())
    }

    pub fn post_json(&self, uri: &str, value: serde_json::Value) -> Result<Request, TemplateError> {
        self.request(
            Method::Post,
            uri,
            RequestOptions {
                json: Some(value),
                ..Default::default()
            },
        )
    }
}
