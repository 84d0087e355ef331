use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::models::provider::{AnalysisRequest, AnalysisResponse, Capability, ProviderTarget};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_entries: 1000,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: AnalysisResponse,
    inserted_at: Instant,
    // matches the generation stored in the insertion queue
    generation: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    // insertion order; stale generations are skipped on eviction
    order: VecDeque<(String, u64)>,
    next_generation: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Content-addressed response cache with a TTL and a size cap.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.config.max_entries > 0
    }

    pub fn get(&self, fingerprint: &str) -> Option<AnalysisResponse> {
        if !self.is_enabled() {
            return None;
        }

        let mut inner = self.inner.lock();
        let ttl = self.config.ttl;
        let lookup = inner
            .entries
            .get(fingerprint)
            .map(|entry| (entry.inserted_at.elapsed() >= ttl, entry.response.clone()));

        match lookup {
            None => {
                inner.misses += 1;
                None
            }
            Some((true, _)) => {
                inner.entries.remove(fingerprint);
                inner.evictions += 1;
                inner.misses += 1;
                debug!("Evicted expired cache entry {}", short(fingerprint));
                None
            }
            Some((false, response)) => {
                inner.hits += 1;
                Some(response)
            }
        }
    }

    pub fn put(&self, fingerprint: String, response: AnalysisResponse) {
        if !self.is_enabled() {
            return;
        }

        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation += 1;

        inner.order.push_back((fingerprint.clone(), generation));
        inner.entries.insert(
            fingerprint,
            CacheEntry {
                response,
                inserted_at: Instant::now(),
                generation,
            },
        );

        while inner.entries.len() > self.config.max_entries {
            let Some((key, generation)) = inner.order.pop_front() else {
                break;
            };
            let current = inner.entries.get(&key).map(|e| e.generation);
            if current == Some(generation) {
                inner.entries.remove(&key);
                inner.evictions += 1;
                debug!("Evicted oldest cache entry {}", short(&key));
            }
        }

        // drop queue slots whose entries were overwritten or expired
        if inner.order.len() > self.config.max_entries.saturating_mul(2) {
            let CacheInner { entries, order, .. } = &mut *inner;
            order.retain(|(key, generation)| {
                entries.get(key).map(|e| e.generation) == Some(*generation)
            });
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

/// Cache key over request content: prompt, SHA-256 of the image bytes,
/// capability and the routing target. File paths never enter the key.
pub fn fingerprint(
    prompt: &str,
    image: Option<&[u8]>,
    capability: Capability,
    target: Option<&ProviderTarget>,
) -> String {
    let image_hash = image
        .map(|bytes| format!("{:x}", Sha256::digest(bytes)))
        .unwrap_or_default();
    let target = target
        .map(|t| format!("{}:{}", t.provider, t.model.as_deref().unwrap_or("")))
        .unwrap_or_else(|| "any".to_string());

    let mut hasher = Sha256::new();
    for part in [prompt, image_hash.as_str(), capability.as_str(), target.as_str()] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

pub fn request_fingerprint(request: &AnalysisRequest) -> String {
    fingerprint(
        &request.prompt,
        request.image_bytes(),
        request.capability,
        request.target.as_ref(),
    )
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(text: &str) -> AnalysisResponse {
        AnalysisResponse::success("req", "gemini", "gemini-1.5-flash", text)
    }

    fn cache(ttl: Duration, max_entries: usize) -> ResponseCache {
        ResponseCache::new(CacheConfig {
            enabled: true,
            ttl,
            max_entries,
        })
    }

    #[test]
    fn test_fingerprint_uses_content() {
        let a = fingerprint("clean?", Some(b"same-bytes"), Capability::ImageAnalysis, None);
        let b = fingerprint("clean?", Some(b"same-bytes"), Capability::ImageAnalysis, None);
        let c = fingerprint("clean?", Some(b"other-bytes"), Capability::ImageAnalysis, None);
        let d = fingerprint("tidy?", Some(b"same-bytes"), Capability::ImageAnalysis, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let target = ProviderTarget::parse("gemini:gemini-1.5-pro").unwrap();
        let e = fingerprint("clean?", Some(b"same-bytes"), Capability::ImageAnalysis, Some(&target));
        assert_ne!(a, e);
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        let a = fingerprint("ab", None, Capability::TextGeneration, None);
        let b = fingerprint("a", Some(b"b"), Capability::TextGeneration, None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_get_put() {
        let cache = cache(Duration::from_secs(60), 10);
        assert!(cache.get("k").is_none());

        cache.put("k".to_string(), response("hello"));
        assert_eq!(cache.get("k").unwrap().text, "hello");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = cache(Duration::from_millis(30), 10);
        cache.put("k".to_string(), response("hello"));
        assert!(cache.get("k").is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_evicts_oldest_first() {
        let cache = cache(Duration::from_secs(60), 2);
        cache.put("a".to_string(), response("a"));
        cache.put("b".to_string(), response("b"));
        cache.put("c".to_string(), response("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_overwrite_refreshes_position() {
        let cache = cache(Duration::from_secs(60), 2);
        cache.put("a".to_string(), response("a1"));
        cache.put("b".to_string(), response("b"));
        cache.put("a".to_string(), response("a2"));
        cache.put("c".to_string(), response("c"));

        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").unwrap().text, "a2");
    }

    #[test]
    fn test_disabled_cache() {
        let cache = ResponseCache::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        cache.put("k".to_string(), response("x"));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }
}
