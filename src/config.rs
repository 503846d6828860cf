//! Environment-driven configuration. See spec §4.10 / §6.

use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CACHE_ROOT: &str = "./cache";
const DEFAULT_ASSET_DIR: &str = "./assets";
const DEFAULT_MAX_SIZE_BYTES: u64 = 4 * 1024 * 1024;
const DEFAULT_RESIZE_POOL_SIZE: usize = 4;
const DEFAULT_RESIZE_RECYCLE_COUNT: u32 = 250;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub cache_root: PathBuf,
    pub asset_dir: PathBuf,
    pub max_size_bytes: u64,
    pub referer_allow: Vec<Regex>,
    pub uncache_hosts: Vec<String>,
    pub resize_pool_size: usize,
    pub resize_recycle_count: u32,
    pub upstream_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_port: env_u16("IMAGEPROXY_LISTEN_PORT", DEFAULT_PORT),
            cache_root: env_path("IMAGEPROXY_CACHE_ROOT", DEFAULT_CACHE_ROOT),
            asset_dir: env_path("IMAGEPROXY_ASSET_DIR", DEFAULT_ASSET_DIR),
            max_size_bytes: env_u64("IMAGEPROXY_MAX_SIZE_BYTES", DEFAULT_MAX_SIZE_BYTES),
            referer_allow: env_regex_list("IMAGEPROXY_REFERER_ALLOW"),
            uncache_hosts: env_string_list("IMAGEPROXY_UNCACHE_HOSTS"),
            resize_pool_size: env_usize("IMAGEPROXY_RESIZE_POOL_SIZE", DEFAULT_RESIZE_POOL_SIZE),
            resize_recycle_count: env_u32(
                "IMAGEPROXY_RESIZE_RECYCLE_COUNT",
                DEFAULT_RESIZE_RECYCLE_COUNT,
            ),
            upstream_timeout: Duration::from_secs(env_u64(
                "IMAGEPROXY_UPSTREAM_TIMEOUT_SECS",
                DEFAULT_UPSTREAM_TIMEOUT_SECS,
            )),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            asset_dir: PathBuf::from(DEFAULT_ASSET_DIR),
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            referer_allow: Vec::new(),
            uncache_hosts: Vec::new(),
            resize_pool_size: DEFAULT_RESIZE_POOL_SIZE,
            resize_recycle_count: DEFAULT_RESIZE_RECYCLE_COUNT,
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
        }
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

fn env_string_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn env_regex_list(key: &str) -> Vec<Regex> {
    std::env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .filter_map(|s| Regex::new(s).ok())
                .collect()
        })
        .unwrap_or_default()
}
