// src/config/gateway.rs
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf};

pub const DEFAULT_GATEWAY_CONFIG_PATH: &str = "config/gateway.toml";
pub const ENV_GATEWAY_CONFIG_PATH: &str = "GATEWAY_CONFIG_PATH";

const DEFAULT_WINDOW_MS: u64 = 15 * 60 * 1000;
const DEFAULT_MAX_REQUESTS: usize = 100;
const DEFAULT_MAX_CLIENTS: usize = 10_000;
const DEFAULT_INTERVENTION_TTL_SECS: u64 = 600;
const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 30;

/// Origins allowed when `CORS_ORIGINS` is not set.
pub const DEFAULT_CORS_ORIGINS: &[&str] = &[
    "https://nudge.app",
    "https://www.nudge.app",
    "https://*.vercel.app",
    "https://*.netlify.app",
    "https://*.shuttle.app",
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_ms: u64,
    pub max_requests: usize,
    /// Upper bound on tracked client windows; least recently seen are evicted.
    pub max_clients: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            max_requests: DEFAULT_MAX_REQUESTS,
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

/// Base URLs of the external collaborators. `None` selects the built-in implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEndpoints {
    pub scoring_url: Option<String>,
    pub enhancement_url: Option<String>,
    pub learning_url: Option<String>,
    /// Transport-level timeout for collaborator calls.
    pub timeout_secs: u64,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            scoring_url: None,
            enhancement_url: None,
            learning_url: None,
            timeout_secs: DEFAULT_SERVICE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub environment: Environment,
    pub cors_origins: Vec<String>,
    pub rate_limit: RateLimitSettings,
    /// Reverse proxies in front of the service that append to `X-Forwarded-For`.
    /// Zero means forwarding headers are ignored and the socket peer identifies the client.
    pub trusted_proxy_hops: usize,
    /// Hex or base64 key, or a passphrase; see `security::crypto::key_from_secret`.
    pub encryption_key: Option<String>,
    pub csrf_enforce: bool,
    pub services: ServiceEndpoints,
    pub webhook_base_url: Option<String>,
    pub intervention_ttl_secs: u64,
    pub debug_routes: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            cors_origins: DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
            rate_limit: RateLimitSettings::default(),
            trusted_proxy_hops: 0,
            encryption_key: None,
            csrf_enforce: false,
            services: ServiceEndpoints::default(),
            webhook_base_url: None,
            intervention_ttl_secs: DEFAULT_INTERVENTION_TTL_SECS,
            debug_routes: false,
        }
    }
}

impl GatewayConfig {
    /// Load `GATEWAY_CONFIG_PATH` (or `config/gateway.toml`) if present, then apply env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var(ENV_GATEWAY_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_GATEWAY_CONFIG_PATH));

        let mut cfg = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            Self::default()
        };
        cfg.apply_env();
        cfg.normalize();
        Ok(cfg)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read gateway config at {}: {}", path.display(), e)
        })?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let mut cfg: GatewayConfig = toml::from_str(s)?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Environment variables override anything read from the file.
    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("APP_ENV") {
            self.environment = Environment::parse(&v);
        }
        if let Ok(v) = env::var("CORS_ORIGINS") {
            let list = split_list(&v);
            if !list.is_empty() {
                self.cors_origins = list;
            }
        }
        if let Some(v) = parse_env::<u64>("RATE_LIMIT_WINDOW_MS") {
            self.rate_limit.window_ms = v;
        }
        if let Some(v) = parse_env::<usize>("RATE_LIMIT_MAX") {
            self.rate_limit.max_requests = v;
        }
        if let Some(v) = parse_env::<usize>("RATE_LIMIT_MAX_CLIENTS") {
            self.rate_limit.max_clients = v;
        }
        if let Some(v) = parse_env::<usize>("TRUSTED_PROXY_HOPS") {
            self.trusted_proxy_hops = v;
        }
        if let Some(v) = non_empty_env("ENCRYPTION_KEY") {
            self.encryption_key = Some(v);
        }
        if let Ok(v) = env::var("CSRF_ENFORCE") {
            self.csrf_enforce = parse_flag(&v);
        }
        if let Some(v) = non_empty_env("SCORING_SERVICE_URL") {
            self.services.scoring_url = Some(v);
        }
        if let Some(v) = non_empty_env("ENHANCEMENT_SERVICE_URL") {
            self.services.enhancement_url = Some(v);
        }
        if let Some(v) = non_empty_env("LEARNING_SERVICE_URL") {
            self.services.learning_url = Some(v);
        }
        if let Some(v) = parse_env::<u64>("SERVICE_TIMEOUT_SECS") {
            self.services.timeout_secs = v;
        }
        if let Some(v) = non_empty_env("WEBHOOK_BASE_URL") {
            self.webhook_base_url = Some(v);
        }
        if let Some(v) = parse_env::<u64>("INTERVENTION_TTL_SECS") {
            self.intervention_ttl_secs = v;
        }
        if let Ok(v) = env::var("DEBUG_ROUTES") {
            self.debug_routes = parse_flag(&v);
        }
    }

    /// Replace zero or nonsensical values with defaults.
    fn normalize(&mut self) {
        if self.rate_limit.window_ms == 0 {
            self.rate_limit.window_ms = DEFAULT_WINDOW_MS;
        }
        if self.rate_limit.max_requests == 0 {
            self.rate_limit.max_requests = DEFAULT_MAX_REQUESTS;
        }
        if self.rate_limit.max_clients == 0 {
            self.rate_limit.max_clients = DEFAULT_MAX_CLIENTS;
        }
        if self.intervention_ttl_secs == 0 {
            self.intervention_ttl_secs = DEFAULT_INTERVENTION_TTL_SECS;
        }
        if self.services.timeout_secs == 0 {
            self.services.timeout_secs = DEFAULT_SERVICE_TIMEOUT_SECS;
        }
        self.cors_origins.retain(|o| !o.trim().is_empty());
        if self.cors_origins.is_empty() {
            self.cors_origins = DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect();
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.is_production()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults_and_zeroes_are_normalized() {
        let cfg = GatewayConfig::from_toml_str(
            r#"
environment = "production"
cors_origins = ["https://a.example.com", " "]
intervention_ttl_secs = 0

[rate_limit]
window_ms = 60000
max_requests = 0
"#,
        )
        .unwrap();
        assert!(cfg.is_production());
        assert_eq!(cfg.cors_origins, vec!["https://a.example.com".to_string()]);
        assert_eq!(cfg.rate_limit.window_ms, 60_000);
        assert_eq!(cfg.rate_limit.max_requests, DEFAULT_MAX_REQUESTS);
        assert_eq!(cfg.intervention_ttl_secs, DEFAULT_INTERVENTION_TTL_SECS);
    }

    #[test]
    fn environment_parse_is_lenient() {
        assert_eq!(Environment::parse(" PROD "), Environment::Production);
        assert_eq!(Environment::parse("staging"), Environment::Development);
    }

    #[serial_test::serial]
    #[test]
    fn load_reads_the_file_named_by_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"debug_routes = true\nwebhook_base_url = \"http://automation.local\"\n\n[services]\nscoring_url = \"http://scoring.local/score\"\n",
        )
        .unwrap();
        env::set_var(ENV_GATEWAY_CONFIG_PATH, file.path());

        let cfg = GatewayConfig::load().unwrap();
        assert!(cfg.debug_routes);
        assert_eq!(cfg.webhook_base_url.as_deref(), Some("http://automation.local"));
        assert_eq!(
            cfg.services.scoring_url.as_deref(),
            Some("http://scoring.local/score")
        );
        assert_eq!(cfg.services.timeout_secs, DEFAULT_SERVICE_TIMEOUT_SECS);

        env::set_var(ENV_GATEWAY_CONFIG_PATH, "/definitely/missing.toml");
        let cfg = GatewayConfig::load().unwrap();
        assert!(!cfg.debug_routes);

        env::remove_var(ENV_GATEWAY_CONFIG_PATH);
    }

    #[serial_test::serial]
    #[test]
    fn env_vars_win_over_file_values() {
        env::set_var("RATE_LIMIT_MAX", "7");
        env::set_var("CORS_ORIGINS", "https://x.example.com, https://*.example.org");
        env::set_var("CSRF_ENFORCE", "yes");
        env::set_var("TRUSTED_PROXY_HOPS", "1");

        let mut cfg = GatewayConfig::default();
        assert_eq!(cfg.trusted_proxy_hops, 0);
        cfg.apply_env();
        assert_eq!(cfg.rate_limit.max_requests, 7);
        assert_eq!(cfg.cors_origins.len(), 2);
        assert!(cfg.csrf_enforce);
        assert_eq!(cfg.trusted_proxy_hops, 1);

        env::remove_var("RATE_LIMIT_MAX");
        env::remove_var("CORS_ORIGINS");
        env::remove_var("CSRF_ENFORCE");
        env::remove_var("TRUSTED_PROXY_HOPS");
    }
}
