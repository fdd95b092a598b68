//! Process configuration from environment variables
//!
//! Everything operational lives in the environment: database location,
//! state directory, concurrency override, backend endpoints and keys, and
//! the object-storage credentials. Absent backends simply aren't
//! registered; absent storage disables the object cache.

use lumen_dispatch::cache::ObjectCacheConfig;
use std::env;
use std::path::PathBuf;

/// Resolved process settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub state_dir: PathBuf,
    pub max_concurrency: usize,
    pub relay_base_url: Option<String>,
    pub relay_api_key: Option<String>,
    pub tunnel_base_url: Option<String>,
    pub object_cache: Option<ObjectCacheConfig>,
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Settings {
    /// Read settings from the environment, applying defaults
    pub fn from_env() -> Self {
        let state_dir = env_opt("LUMEN_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let max_concurrency = env_opt("LUMEN_MAX_CONCURRENCY")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let object_cache = match (
            env_opt("LUMEN_S3_ENDPOINT"),
            env_opt("LUMEN_S3_ACCESS_KEY_ID"),
            env_opt("LUMEN_S3_SECRET_ACCESS_KEY"),
            env_opt("LUMEN_S3_BUCKET"),
            env_opt("LUMEN_S3_PUBLIC_URL"),
        ) {
            (Some(endpoint), Some(access_key_id), Some(secret_access_key), Some(bucket), Some(public_base_url)) => {
                Some(ObjectCacheConfig {
                    endpoint,
                    access_key_id,
                    secret_access_key,
                    bucket,
                    public_base_url,
                })
            }
            _ => None,
        };

        Self {
            database_url: env_opt("LUMEN_DATABASE_URL").unwrap_or_else(|| "lumen.db".to_string()),
            state_dir,
            max_concurrency,
            relay_base_url: env_opt("LUMEN_RELAY_BASE_URL"),
            relay_api_key: env_opt("LUMEN_RELAY_API_KEY"),
            tunnel_base_url: env_opt("LUMEN_TUNNEL_URL"),
            object_cache,
        }
    }
}
