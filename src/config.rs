use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use thiserror::Error;

use crate::constants::{
    DEFAULT_ARXIV_REQUEST_INTERVAL_MS, DEFAULT_FETCH_INTERVAL_HOURS, DEFAULT_MAX_RESULTS_CAP,
    DEFAULT_MAX_TAGS, DEFAULT_QUERY_MAX_RESULTS, DEFAULT_SESSION_TIMEOUT_SECS,
    DEFAULT_STALE_CLAIM_MINUTES,
};
use crate::store::operations::subscribers::SearchQuery;

#[derive(Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub http_enabled: bool,
    pub admin_token: String,
    pub log_level: String,
    pub enable_file_logs: bool,
    pub log_dir: String,
    pub sled_path: String,
    pub arxiv: ArxivConfig,
    pub llm: LLMConfig,
    pub telegram: TelegramConfig,
    pub matrix: MatrixConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone)]
pub struct ArxivConfig {
    pub api_url: String,
    pub max_results: u32,
    pub request_interval_ms: u64,
    pub timeout_secs: u64,
    pub default_categories: Vec<String>,
}

#[derive(Clone)]
pub struct LLMConfig {
    pub enabled: bool,
    pub mock: bool,
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tags: usize,
    pub concurrency: usize,
}

#[derive(Clone)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub token: String,
    pub api_url: String,
    pub poll_timeout_secs: u64,
}

#[derive(Clone)]
pub struct MatrixConfig {
    pub enabled: bool,
    pub homeserver: String,
    pub access_token: String,
    pub room_id: String,
    pub queries: Vec<SearchQuery>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub is_leader: bool,
    pub fetch_interval_hours: u32,
    pub poll_cron: String,
    pub session_timeout_secs: u64,
    pub stale_claim_minutes: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("http_enabled", &self.http_enabled)
            .field("admin_token", &"***REDACTED***")
            .field("log_level", &self.log_level)
            .field("enable_file_logs", &self.enable_file_logs)
            .field("log_dir", &self.log_dir)
            .field("sled_path", &self.sled_path)
            .field("arxiv", &self.arxiv)
            .field("llm", &self.llm)
            .field("telegram", &self.telegram)
            .field("matrix", &self.matrix)
            .field("worker", &self.worker)
            .finish()
    }
}

impl fmt::Debug for LLMConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LLMConfig")
            .field("enabled", &self.enabled)
            .field("mock", &self.mock)
            .field("api_url", &self.api_url)
            .field("api_key", &"***REDACTED***")
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_tags", &self.max_tags)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("enabled", &self.enabled)
            .field("token", &"***REDACTED***")
            .field("api_url", &self.api_url)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

impl fmt::Debug for MatrixConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixConfig")
            .field("enabled", &self.enabled)
            .field("homeserver", &self.homeserver)
            .field("access_token", &"***REDACTED***")
            .field("room_id", &self.room_id)
            .field("queries", &self.queries)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: env_or_parse("HOST", IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))),
            port: env_or_parse("PORT", 3000_u16),
            http_enabled: env_or_bool("HTTP_ENABLED", true),
            admin_token: env_or("ADMIN_TOKEN", ""),
            log_level: env_or("RUST_LOG", "info"),
            enable_file_logs: env_or_bool("ENABLE_FILE_LOGS", false),
            log_dir: env_or("LOG_DIR", "./logs"),
            sled_path: env_or("SLED_PATH", "./data/arxiv-notifier.sled"),
            arxiv: ArxivConfig {
                api_url: env_or("ARXIV_API_URL", "https://export.arxiv.org/api/query"),
                max_results: env_or_parse("ARXIV_MAX_RESULTS", DEFAULT_MAX_RESULTS_CAP),
                request_interval_ms: env_or_parse(
                    "ARXIV_REQUEST_INTERVAL_MS",
                    DEFAULT_ARXIV_REQUEST_INTERVAL_MS,
                ),
                timeout_secs: env_or_parse("ARXIV_TIMEOUT_SECS", 30_u64),
                default_categories: env_or_list("ARXIV_DEFAULT_CATEGORIES"),
            },
            llm: LLMConfig {
                enabled: env_or_bool("LLM_ENABLED", false),
                mock: env_or_bool("LLM_MOCK", true),
                api_url: env_or("LLM_API_URL", ""),
                api_key: env_or("LLM_API_KEY", ""),
                model: env_or("LLM_MODEL", "gpt-4o-mini"),
                timeout_secs: env_or_parse("LLM_TIMEOUT_SECS", 30_u64),
                max_tags: env_or_parse("LLM_MAX_TAGS", DEFAULT_MAX_TAGS),
                concurrency: env_or_parse("LLM_CONCURRENCY", 4_usize),
            },
            telegram: TelegramConfig {
                enabled: env_or_bool("TELEGRAM_ENABLED", false),
                token: env_or("TELEGRAM_TOKEN", ""),
                api_url: env_or("TELEGRAM_API_URL", "https://api.telegram.org"),
                poll_timeout_secs: env_or_parse("TELEGRAM_POLL_TIMEOUT_SECS", 30_u64),
            },
            matrix: MatrixConfig {
                enabled: env_or_bool("MATRIX_ENABLED", false),
                homeserver: env_or("MATRIX_HOMESERVER", ""),
                access_token: env_or("MATRIX_ACCESS_TOKEN", ""),
                room_id: env_or("MATRIX_ROOM_ID", ""),
                queries: parse_query_list(&env_or("MATRIX_QUERIES", "")),
            },
            worker: WorkerConfig {
                is_leader: env_or_bool("WORKER_LEADER", true),
                fetch_interval_hours: env_or_parse(
                    "FETCH_INTERVAL_HOURS",
                    DEFAULT_FETCH_INTERVAL_HOURS,
                ),
                poll_cron: env_or("POLL_CRON", "0 * * * * *"),
                session_timeout_secs: env_or_parse(
                    "SESSION_TIMEOUT_SECS",
                    DEFAULT_SESSION_TIMEOUT_SECS,
                ),
                stale_claim_minutes: env_or_parse(
                    "STALE_CLAIM_MINUTES",
                    DEFAULT_STALE_CLAIM_MINUTES,
                ),
            },
        }
    }

    /// Reject combinations that would only fail later at the first network call.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram.enabled && self.telegram.token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "TELEGRAM_ENABLED=true requires TELEGRAM_TOKEN".to_string(),
            ));
        }
        if self.matrix.enabled
            && (self.matrix.homeserver.trim().is_empty()
                || self.matrix.access_token.trim().is_empty()
                || self.matrix.room_id.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "MATRIX_ENABLED=true requires MATRIX_HOMESERVER, MATRIX_ACCESS_TOKEN and MATRIX_ROOM_ID"
                    .to_string(),
            ));
        }
        if self.llm.enabled && !self.llm.mock && self.llm.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "LLM_ENABLED=true with LLM_MOCK=false requires LLM_API_URL".to_string(),
            ));
        }
        if self.arxiv.max_results == 0 {
            return Err(ConfigError::Invalid(
                "ARXIV_MAX_RESULTS must be at least 1".to_string(),
            ));
        }
        if self.worker.fetch_interval_hours == 0 {
            return Err(ConfigError::Invalid(
                "FETCH_INTERVAL_HOURS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_or_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(
                    key,
                    value = %raw,
                    "Failed to parse env var, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

pub fn env_or_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Comma separated list, blanks dropped.
pub fn env_or_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parses `query|max;query|max`. A missing or invalid max falls back to the default.
pub fn parse_query_list(raw: &str) -> Vec<SearchQuery> {
    raw.split(';')
        .filter_map(|item| {
            let item = item.trim();
            if item.is_empty() {
                return None;
            }
            let (query, max) = match item.rsplit_once('|') {
                Some((q, m)) => match m.trim().parse::<u32>() {
                    Ok(n) if n > 0 => (q.trim(), n),
                    _ => {
                        tracing::warn!(item, "Invalid max_results in query list, using default");
                        (q.trim(), DEFAULT_QUERY_MAX_RESULTS)
                    }
                },
                None => (item, DEFAULT_QUERY_MAX_RESULTS),
            };
            if query.is_empty() {
                return None;
            }
            Some(SearchQuery {
                query: query.to_string(),
                max_results: max,
            })
        })
        .collect()
}
