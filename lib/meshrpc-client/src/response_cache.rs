//! Bounded cache of successful responses keyed by request fingerprint

use crate::error::{ClientError, Result};
use crate::request::{Request, Response};
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default number of cached responses
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub response: Response,
    pub expires_at: Instant,
}

#[derive(Serialize)]
struct ListedResponse<'a> {
    fingerprint: &'a str,
    expires_in_ms: u128,
    content_type: Option<&'a str>,
    size: usize,
}

/// Deterministic key for a request: SHA-256 over the length-prefixed
/// service, endpoint and body
pub fn fingerprint(request: &Request) -> String {
    let mut hasher = Sha256::new();
    for part in [
        request.service.as_bytes(),
        request.endpoint.as_bytes(),
        request.body.as_slice(),
    ] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

pub struct ResponseCache {
    entries: Mutex<LruCache<String, CachedResponse>>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CachedResponse>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached response for `request`, if one has not expired
    pub fn get(&self, request: &Request) -> Option<Response> {
        let key = fingerprint(request);
        let mut entries = self.lock();
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                debug!(service = %request.service, endpoint = %request.endpoint, "Response cache hit");
                Some(entry.response.clone())
            }
            Some(_) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, request: &Request, response: Response, ttl: Duration) {
        let entry = CachedResponse {
            response,
            expires_at: Instant::now() + ttl,
        };
        self.lock().put(fingerprint(request), entry);
    }

    /// Live entries rendered as JSON, most recently used first
    pub fn list(&self) -> Result<String> {
        let now = Instant::now();
        let entries = self.lock();
        let listed: Vec<ListedResponse<'_>> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(key, entry)| ListedResponse {
                fingerprint: key,
                expires_in_ms: (entry.expires_at - now).as_millis(),
                content_type: entry.response.content_type(),
                size: entry.response.body.len(),
            })
            .collect();
        serde_json::to_string(&listed).map_err(|e| ClientError::Codec(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: &str) -> Request {
        Request::new("greeter", "Greeter.Hello", body.as_bytes().to_vec())
    }

    fn response(body: &str) -> Response {
        Response {
            body: body.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_is_deterministic_and_field_aware() {
        assert_eq!(fingerprint(&request("{}")), fingerprint(&request("{}")));
        assert_ne!(fingerprint(&request("{}")), fingerprint(&request("[]")));

        // Shifting bytes between fields must change the key
        let a = Request::new("ab", "c", Vec::new());
        let b = Request::new("a", "bc", Vec::new());
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = ResponseCache::default();
        cache.set(&request("{}"), response("hi"), Duration::from_secs(5));
        assert_eq!(cache.get(&request("{}")).unwrap().body, b"hi");
        assert!(cache.get(&request("[]")).is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&request("{}")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let cache = ResponseCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.set(&request("1"), response("one"), ttl);
        cache.set(&request("2"), response("two"), ttl);
        cache.get(&request("1"));
        cache.set(&request("3"), response("three"), ttl);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&request("2")).is_none());
        assert!(cache.get(&request("1")).is_some());
    }

    #[tokio::test]
    async fn test_list() {
        let cache = ResponseCache::default();
        cache.set(&request("{}"), response("hi"), Duration::from_secs(60));

        let listed: serde_json::Value = serde_json::from_str(&cache.list().unwrap()).unwrap();
        assert_eq!(listed[0]["fingerprint"], fingerprint(&request("{}")));
        assert_eq!(listed[0]["size"], 2);
    }
}
