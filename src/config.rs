use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::media::{AVATARS_BUCKET, POST_IMAGES_BUCKET};
use crate::model::{COMMENT_MAX_CHARS, DEFAULT_PAGE_SIZE};

const DEFAULT_ENV_PREFIX: &str = "PARKFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub buckets: BucketConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub anon_key: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            timeout: default_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty() && !self.anon_key.trim().is_empty()
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_comment_max_chars")]
    pub comment_max_chars: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            comment_max_chars: default_comment_max_chars(),
        }
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_comment_max_chars() -> usize {
    COMMENT_MAX_CHARS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketConfig {
    #[serde(default = "default_post_images")]
    pub post_images: String,
    #[serde(default = "default_avatars")]
    pub avatars: String,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            post_images: default_post_images(),
            avatars: default_avatars(),
        }
    }
}

fn default_post_images() -> String {
    POST_IMAGES_BUCKET.into()
}

fn default_avatars() -> String {
    AVATARS_BUCKET.into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "warn".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    let path = options.config_file.clone().or_else(default_config_path);
    if let Some(path) = path {
        if path.exists() {
            let from_file = read_config_file(&path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("config: read {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("config: parse {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.backend.url.is_empty() {
        base.backend.url = other.backend.url;
    }
    if !other.backend.anon_key.is_empty() {
        base.backend.anon_key = other.backend.anon_key;
    }
    if !other.backend.timeout.is_zero() {
        base.backend.timeout = other.backend.timeout;
    }

    if other.feed.page_size != 0 {
        base.feed.page_size = other.feed.page_size;
    }
    if other.feed.comment_max_chars != 0 {
        base.feed.comment_max_chars = other.feed.comment_max_chars;
    }

    if !other.buckets.post_images.is_empty() {
        base.buckets.post_images = other.buckets.post_images;
    }
    if !other.buckets.avatars.is_empty() {
        base.buckets.avatars = other.buckets.avatars;
    }

    if !other.log.filter.is_empty() {
        base.log.filter = other.log.filter;
    }

    base
}

/// Applies `<PREFIX>_<SECTION>__<KEY>` variables on top of `cfg`.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "backend.url" => cfg.backend.url = value,
        "backend.anon_key" => cfg.backend.anon_key = value,
        "backend.timeout" => match humantime::parse_duration(&value) {
            Ok(duration) if !duration.is_zero() => cfg.backend.timeout = duration,
            _ => log::warn!("config: ignoring backend.timeout {:?}", value),
        },
        "feed.page_size" => match value.parse::<usize>() {
            Ok(parsed) if parsed > 0 => cfg.feed.page_size = parsed,
            _ => log::warn!("config: ignoring feed.page_size {:?}", value),
        },
        "feed.comment_max_chars" => match value.parse::<usize>() {
            Ok(parsed) if parsed > 0 => cfg.feed.comment_max_chars = parsed,
            _ => log::warn!("config: ignoring feed.comment_max_chars {:?}", value),
        },
        "buckets.post_images" => cfg.buckets.post_images = value,
        "buckets.avatars" => cfg.buckets.avatars = value,
        "log.filter" => cfg.log.filter = value,
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("parkfeed").join("config.yaml"))
}

/// Writes the backend section into the config file at `path` (or the
/// default location), keeping every other setting already there.
pub fn save_backend(path: Option<PathBuf>, url: &str, anon_key: &str) -> Result<PathBuf> {
    let url = url.trim();
    let anon_key = anon_key.trim();

    anyhow::ensure!(!url.is_empty(), "config: backend.url is required");
    anyhow::ensure!(!anon_key.is_empty(), "config: backend.anon_key is required");

    let path = match path {
        Some(path) => path,
        None => default_config_path().context("config: unable to determine default config path")?,
    };

    let mut cfg = if path.exists() {
        read_config_file(&path)?
    } else {
        Config::default()
    };

    cfg.backend.url = url.to_string();
    cfg.backend.anon_key = anon_key.to_string();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: create directory {}", parent.display()))?;
    }

    let contents = serde_yaml::to_string(&cfg).context("config: serialize")?;
    fs::write(&path, contents).with_context(|| format!("config: write {}", path.display()))?;

    Ok(path)
}
