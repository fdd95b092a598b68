//! Content-addressed object cache
//!
//! Remote generation backends hand back URLs on their own CDNs, which
//! expire. The cache copies each artifact into our S3-compatible bucket
//! under a key derived from the source URL's SHA-256, so repeated caching
//! of the same URL is a head-check, not a transfer.
//!
//! Caching is best-effort by design: any failure (download, upload, missing
//! configuration) degrades to `None` and the caller keeps serving the
//! source URL.

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection settings for the S3-compatible bucket
#[derive(Debug, Clone)]
pub struct ObjectCacheConfig {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    /// Public base URL the bucket is served from, e.g. `https://cdn.example.com`
    pub public_base_url: String,
}

/// A successfully cached artifact
#[derive(Debug, Clone)]
pub struct CachedObject {
    /// Public URL of the cached copy
    pub url: String,
    /// Full SHA-256 of the source URL (the content address)
    pub content_hash: String,
    /// Object key inside the bucket
    pub key: String,
}

/// Derive the object key for a source URL: `<prefix>/<hash16><ext>`
pub fn key_for(source_url: &str, prefix: &str) -> (String, String) {
    let digest = Sha256::digest(source_url.as_bytes());
    let full_hash = format!("{:x}", digest);
    let short = &full_hash[..16];

    let lower = source_url.to_lowercase();
    let ext = if lower.contains(".png") {
        ".png"
    } else if lower.contains(".webp") {
        ".webp"
    } else if lower.contains(".mp4") {
        ".mp4"
    } else if lower.contains(".gif") {
        ".gif"
    } else {
        ".jpg"
    };

    (format!("{}/{}{}", prefix, short, ext), full_hash)
}

/// S3-compatible cache for generation artifacts
pub struct ObjectCache {
    store: Arc<dyn ObjectStore>,
    public_base_url: String,
    client: reqwest::Client,
}

impl ObjectCache {
    pub fn new(config: &ObjectCacheConfig) -> anyhow::Result<Self> {
        let store = AmazonS3Builder::new()
            .with_endpoint(&config.endpoint)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key)
            .with_bucket_name(&config.bucket)
            .with_region("auto")
            .build()?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            store: Arc::new(store),
            public_base_url: config.public_base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    /// Copy one external URL into the bucket. Returns `None` on any failure.
    pub async fn cache_url(&self, source_url: &str, prefix: &str) -> Option<CachedObject> {
        let (key, content_hash) = key_for(source_url, prefix);
        let location = ObjectPath::from(key.as_str());

        // Already cached?
        if self.store.head(&location).await.is_ok() {
            debug!(key = %key, "object already cached");
            return Some(CachedObject {
                url: self.public_url(&key),
                content_hash,
                key,
            });
        }

        // Download from the source
        let response = match self.client.get(source_url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(url = %truncate(source_url), status = r.status().as_u16(), "failed to download for caching");
                return None;
            }
            Err(e) => {
                warn!(url = %truncate(source_url), error = %e, "failed to download for caching");
                return None;
            }
        };

        let body: Bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(url = %truncate(source_url), error = %e, "failed to read body for caching");
                return None;
            }
        };

        // Upload into the bucket
        let size_kb = body.len() / 1024;
        if let Err(e) = self.store.put(&location, body.into()).await {
            warn!(key = %key, error = %e, "failed to upload to object cache");
            return None;
        }

        info!(key = %key, size_kb, "cached object");
        Some(CachedObject {
            url: self.public_url(&key),
            content_hash,
            key,
        })
    }

    /// Cache several URLs concurrently, preserving order
    pub async fn cache_many(&self, urls: &[String], prefix: &str) -> Vec<Option<CachedObject>> {
        let futures = urls.iter().map(|url| self.cache_url(url, prefix));
        futures::future::join_all(futures).await
    }

    /// Public URL of the cached copy, if the object is already present
    pub async fn lookup(&self, source_url: &str, prefix: &str) -> Option<String> {
        let (key, _) = key_for(source_url, prefix);
        let location = ObjectPath::from(key.as_str());
        match self.store.head(&location).await {
            Ok(_) => Some(self.public_url(&key)),
            Err(_) => None,
        }
    }
}

fn truncate(url: &str) -> &str {
    &url[..url.len().min(60)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let (key_a, hash_a) = key_for("https://cdn.example.com/out.mp4", "videos");
        let (key_b, hash_b) = key_for("https://cdn.example.com/out.mp4", "videos");
        assert_eq!(key_a, key_b);
        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.len(), 64);
    }

    #[test]
    fn test_key_prefix_and_extension() {
        let (key, _) = key_for("https://cdn.example.com/out.mp4", "videos");
        assert!(key.starts_with("videos/"));
        assert!(key.ends_with(".mp4"));

        let (key, _) = key_for("https://cdn.example.com/face.PNG?sig=1", "images");
        assert!(key.ends_with(".png"));

        // Unknown extension defaults to .jpg
        let (key, _) = key_for("https://cdn.example.com/artifact", "images");
        assert!(key.ends_with(".jpg"));
    }

    #[test]
    fn test_different_urls_different_keys() {
        let (key_a, _) = key_for("https://cdn.example.com/a.mp4", "videos");
        let (key_b, _) = key_for("https://cdn.example.com/b.mp4", "videos");
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn test_key_short_hash_len() {
        let (key, _) = key_for("https://cdn.example.com/a.mp4", "videos");
        // "videos/" + 16 hex chars + ".mp4"
        assert_eq!(key.len(), "videos/".len() + 16 + ".mp4".len());
    }
}
