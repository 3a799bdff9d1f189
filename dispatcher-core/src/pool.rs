//! `HTTPClientPool`: a bounded pool of `reqwest::Client`s keyed by
//! scheme+authority, guarded by a single mutex; clients themselves are safe
//! for concurrent use by reactor fibers. Bounded with an LRU so a dispatcher
//! fielding requests against many distinct hosts doesn't grow the pool
//! unboundedly.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use url::Url;

use crate::error::PoolError;

fn authority_key(url: &Url) -> String {
    format!(
        "{}://{}",
        url.scheme(),
        url.host_str().unwrap_or_default()
    )
}

pub struct HttpClientPool {
    clients: Mutex<LruCache<String, reqwest::Client>>,
    connection_timeout: Option<Duration>,
    proxy_url: Option<String>,
    user_agent: Option<String>,
}

impl HttpClientPool {
    pub fn new(
        capacity: usize,
        connection_timeout: Option<Duration>,
        proxy_url: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).expect("1 is nonzero"));
        Self {
            clients: Mutex::new(LruCache::new(capacity)),
            connection_timeout,
            proxy_url,
            user_agent,
        }
    }

    /// Acquire (building if absent) the client for `url`'s scheme+authority.
    pub fn client_for(&self, url: &Url) -> Result<reqwest::Client, PoolError> {
        let key = authority_key(url);
        let mut clients = self.clients.lock().expect("poisoned mutex");
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.connection_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(proxy) = &self.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        if let Some(ua) = &self.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        // Per-request timeouts are applied at request build time, not here,
        // since `Request::timeout` can override `config.request_timeout`.
        let client = builder.build()?;
        clients.put(key, client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().expect("poisoned mutex").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
