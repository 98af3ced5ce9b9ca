use std::{env, fs, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub cache_dir: PathBuf,
    pub download_dir: PathBuf,
    pub max_cache_bytes: i64,
    pub cache_retention: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub fetch_timeout: Duration,
    pub poll_interval: Duration,
    pub monitor_timeout: Duration,
    pub reap_grace: Duration,
    pub tombstone_ttl: Duration,
    pub ytdlp_path: Option<PathBuf>,
    pub proxy_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("MEDIAFETCH_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_addr = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) = resolve_api_key();

        let cache_dir = PathBuf::from(
            env::var("MEDIAFETCH_CACHE_DIR").unwrap_or_else(|_| "/data/cache".to_string()),
        );
        let download_dir = PathBuf::from(
            env::var("MEDIAFETCH_DOWNLOAD_DIR").unwrap_or_else(|_| "/data/downloads".to_string()),
        );

        let max_cache_gb = parse_env("MEDIAFETCH_MAX_CACHE_GB", 20u64);
        let retention_days = parse_env("MEDIAFETCH_CACHE_RETENTION_DAYS", 30u64);

        let ytdlp_path = env::var("MEDIAFETCH_YTDLP_PATH")
            .ok()
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty());
        let proxy_url = env::var("MEDIAFETCH_PROXY_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            cache_dir,
            download_dir,
            max_cache_bytes: (max_cache_gb as i64) * 1024 * 1024 * 1024,
            cache_retention: Duration::from_secs(retention_days * 24 * 60 * 60),
            workers: parse_env("MEDIAFETCH_WORKERS", 3usize).max(1),
            queue_capacity: parse_env("MEDIAFETCH_QUEUE_CAPACITY", 100usize).max(1),
            fetch_timeout: Duration::from_secs(parse_env("MEDIAFETCH_FETCH_TIMEOUT_SECS", 600u64)),
            poll_interval: Duration::from_millis(parse_env("MEDIAFETCH_POLL_INTERVAL_MS", 2000u64)),
            monitor_timeout: Duration::from_secs(parse_env(
                "MEDIAFETCH_MONITOR_TIMEOUT_SECS",
                600u64,
            )),
            reap_grace: Duration::from_secs(parse_env("MEDIAFETCH_REAP_GRACE_SECS", 5u64)),
            tombstone_ttl: Duration::from_secs(parse_env("MEDIAFETCH_TOMBSTONE_TTL_SECS", 60u64)),
            ytdlp_path,
            proxy_url,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn resolve_api_key() -> (String, bool) {
    if let Ok(value) = env::var("MEDIAFETCH_API_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }

    if let Ok(key_file) = env::var("MEDIAFETCH_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                eprintln!(
                    "[mediafetch-api] MEDIAFETCH_API_KEY_FILE is empty: {}. Falling back to generated key.",
                    key_file
                );
            }
            Err(err) => {
                eprintln!(
                    "[mediafetch-api] Failed reading MEDIAFETCH_API_KEY_FILE at {}: {}. Falling back to generated key.",
                    key_file, err
                );
            }
        }
    } else {
        eprintln!("[mediafetch-api] MEDIAFETCH_API_KEY not set. Falling back to generated key.");
    }

    let generated = format!("fallback-{}", Uuid::new_v4());
    (generated, true)
}
