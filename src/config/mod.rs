//! Gateway configuration, read from the environment.
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `PORT` | `8080` | listen port |
//! | `HOST` | `0.0.0.0` | listen address |
//! | `API_TARGET_URL` (or `API_URL`) | required | internal API base URL |
//! | `API_AUDIENCE_URL` | required | identity-token audience |
//! | `API_PREFIX` | `/api` | path prefix forwarded to the API |
//! | `STATIC_DIR` | `dist` | built dashboard assets |
//! | `UPSTREAM_TIMEOUT_SECS` | `30` | upstream request timeout |
//! | `ID_TOKEN_SOURCE` | `metadata` | `metadata` or `static` |
//! | `ID_TOKEN` | | token used by the `static` source |
//! | `GCE_METADATA_HOST` | `metadata.google.internal` | metadata server host[:port] |
//! | `DNS_OVERRIDES` | | `host=ip[,host=ip...]` |
//! | `EXPOSE_ERROR_DETAILS` | `true` | include error text in auth-failure and invalid-body responses |
//!
//! Blank values are treated as unset.

mod env;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::dns::DnsStrategy;

pub use env::{MapEnv, ReadEnv, SystemEnv};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PREFIX: &str = "/api";
const DEFAULT_STATIC_DIR: &str = "dist";
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} environment variable is not set")]
    Missing { var: &'static str },

    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl fmt::Display) -> Self {
        Self::Invalid {
            var,
            value: value.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Where bearer tokens for the upstream come from.
#[derive(Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// The GCE/Cloud Run metadata server at `host` (`host[:port]`).
    Metadata { host: String },
    /// A fixed token, for running outside Google Cloud.
    Static { token: String },
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::Metadata {
            host: DEFAULT_METADATA_HOST.to_owned(),
        }
    }
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata { host } => f.debug_struct("Metadata").field("host", host).finish(),
            Self::Static { .. } => f
                .debug_struct("Static")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Everything the gateway needs to start.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    host: String,
    port: u16,
    target_base_url: String,
    token_audience: String,
    prefix: String,
    static_dir: PathBuf,
    upstream_timeout: Duration,
    token_source: TokenSource,
    dns: DnsStrategy,
    expose_error_details: bool,
}

impl GatewayConfig {
    /// Creates a config with defaults for everything but the two required URLs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `target_base_url` is not an
    /// absolute http(s) URL and [`ConfigError::Missing`] when `token_audience`
    /// is blank.
    pub fn new(
        target_base_url: impl AsRef<str>,
        token_audience: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let token_audience = token_audience.into();
        if token_audience.trim().is_empty() {
            return Err(ConfigError::Missing {
                var: "API_AUDIENCE_URL",
            });
        }
        let target_base_url = parse_target("API_TARGET_URL", target_base_url.as_ref())?;
        Ok(Self::with_defaults(target_base_url, token_audience))
    }

    fn with_defaults(target_base_url: String, token_audience: String) -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            target_base_url,
            token_audience,
            prefix: DEFAULT_PREFIX.to_owned(),
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            token_source: TokenSource::default(),
            dns: DnsStrategy::System,
            expose_error_details: true,
        }
    }

    /// Reads the configuration from `env`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when the target URL or audience is
    /// unset, and [`ConfigError::Invalid`] for any value that does not parse.
    pub fn from_env(env: &impl ReadEnv) -> Result<Self, ConfigError> {
        let (target_var, target) = match read(env, "API_TARGET_URL") {
            Some(v) => ("API_TARGET_URL", v),
            None => match read(env, "API_URL") {
                Some(v) => ("API_URL", v),
                None => {
                    return Err(ConfigError::Missing {
                        var: "API_TARGET_URL",
                    });
                }
            },
        };
        let audience = read(env, "API_AUDIENCE_URL").ok_or(ConfigError::Missing {
            var: "API_AUDIENCE_URL",
        })?;

        let mut config = Self::with_defaults(parse_target(target_var, &target)?, audience);

        if let Some(port) = read(env, "PORT") {
            config.port = port
                .parse()
                .map_err(|e| ConfigError::invalid("PORT", &port, e))?;
        }
        if let Some(host) = read(env, "HOST") {
            config.host = host;
        }
        if let Some(prefix) = read(env, "API_PREFIX") {
            config.prefix = normalize_prefix(&prefix).ok_or_else(|| {
                ConfigError::invalid("API_PREFIX", &prefix, "must start with '/' and name a path")
            })?;
        }
        if let Some(dir) = read(env, "STATIC_DIR") {
            config.static_dir = PathBuf::from(dir);
        }
        if let Some(secs) = read(env, "UPSTREAM_TIMEOUT_SECS") {
            let parsed: u64 = secs
                .parse()
                .map_err(|e| ConfigError::invalid("UPSTREAM_TIMEOUT_SECS", &secs, e))?;
            if parsed == 0 {
                return Err(ConfigError::invalid(
                    "UPSTREAM_TIMEOUT_SECS",
                    &secs,
                    "must be at least 1",
                ));
            }
            config.upstream_timeout = Duration::from_secs(parsed);
        }
        config.token_source = token_source_from_env(env)?;
        if let Some(overrides) = read(env, "DNS_OVERRIDES") {
            config.dns = DnsStrategy::parse(&overrides)
                .map_err(|e| ConfigError::invalid("DNS_OVERRIDES", &overrides, e))?;
        }
        if let Some(flag) = read(env, "EXPOSE_ERROR_DETAILS") {
            config.expose_error_details = parse_bool(&flag).ok_or_else(|| {
                ConfigError::invalid("EXPOSE_ERROR_DETAILS", &flag, "expected true or false")
            })?;
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Overrides the forwarded prefix. Values that do not normalize are ignored.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        if let Some(prefix) = normalize_prefix(prefix) {
            self.prefix = prefix;
        }
        self
    }

    #[must_use]
    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_token_source(mut self, source: TokenSource) -> Self {
        self.token_source = source;
        self
    }

    #[must_use]
    pub fn with_dns(mut self, dns: DnsStrategy) -> Self {
        self.dns = dns;
        self
    }

    #[must_use]
    pub fn with_error_details(mut self, expose: bool) -> Self {
        self.expose_error_details = expose;
        self
    }

    /// `host:port` to bind.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Internal API root, without a trailing slash.
    pub fn target_base_url(&self) -> &str {
        &self.target_base_url
    }

    pub fn token_audience(&self) -> &str {
        &self.token_audience
    }

    /// Forwarded prefix: leading slash, no trailing slash.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn static_dir(&self) -> &Path {
        &self.static_dir
    }

    pub fn upstream_timeout(&self) -> Duration {
        self.upstream_timeout
    }

    pub fn token_source(&self) -> &TokenSource {
        &self.token_source
    }

    pub fn dns(&self) -> &DnsStrategy {
        &self.dns
    }

    pub fn expose_error_details(&self) -> bool {
        self.expose_error_details
    }
}

// Blank counts as unset.
fn read(env: &impl ReadEnv, key: &str) -> Option<String> {
    env.var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn parse_target(var: &'static str, raw: &str) -> Result<String, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::invalid(var, raw, e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::invalid(var, raw, "scheme must be http or https"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(ConfigError::invalid(var, raw, "must not carry a query or fragment"));
    }
    Ok(raw.trim_end_matches('/').to_owned())
}

fn normalize_prefix(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    (trimmed.starts_with('/') && !trimmed.contains(['?', '#', '*'])).then(|| trimmed.to_owned())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn token_source_from_env(env: &impl ReadEnv) -> Result<TokenSource, ConfigError> {
    let kind = read(env, "ID_TOKEN_SOURCE").unwrap_or_else(|| "metadata".to_owned());
    match kind.to_ascii_lowercase().as_str() {
        "metadata" => Ok(TokenSource::Metadata {
            host: read(env, "GCE_METADATA_HOST")
                .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_owned()),
        }),
        "static" => {
            let token = read(env, "ID_TOKEN").ok_or(ConfigError::Missing { var: "ID_TOKEN" })?;
            Ok(TokenSource::Static { token })
        }
        _ => Err(ConfigError::invalid(
            "ID_TOKEN_SOURCE",
            &kind,
            "expected metadata or static",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> MapEnv {
        MapEnv::from([
            ("API_TARGET_URL", "https://api-internal.example.run.app/"),
            ("API_AUDIENCE_URL", "https://api.example.run.app"),
        ])
    }

    #[test]
    fn defaults() {
        let cfg = GatewayConfig::from_env(&required()).unwrap();
        assert_eq!(cfg.port(), DEFAULT_PORT);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.target_base_url(), "https://api-internal.example.run.app");
        assert_eq!(cfg.token_audience(), "https://api.example.run.app");
        assert_eq!(cfg.prefix(), "/api");
        assert_eq!(cfg.static_dir(), Path::new("dist"));
        assert_eq!(cfg.upstream_timeout(), DEFAULT_UPSTREAM_TIMEOUT);
        assert_eq!(cfg.token_source(), &TokenSource::default());
        assert_eq!(cfg.dns(), &DnsStrategy::System);
        assert!(cfg.expose_error_details());
    }

    #[test]
    fn missing_target_is_fatal() {
        let env = MapEnv::from([("API_AUDIENCE_URL", "https://api.example.run.app")]);
        assert_eq!(
            GatewayConfig::from_env(&env).unwrap_err(),
            ConfigError::Missing {
                var: "API_TARGET_URL"
            }
        );
    }

    #[test]
    fn missing_audience_is_fatal() {
        let env = MapEnv::from([("API_TARGET_URL", "https://api.example.run.app")]);
        assert_eq!(
            GatewayConfig::from_env(&env).unwrap_err(),
            ConfigError::Missing {
                var: "API_AUDIENCE_URL"
            }
        );
    }

    #[test]
    fn blank_counts_as_missing() {
        let env = required().with("API_AUDIENCE_URL", "   ");
        assert!(matches!(
            GatewayConfig::from_env(&env),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn api_url_alias() {
        let env = MapEnv::from([
            ("API_URL", "http://localhost:5000"),
            ("API_AUDIENCE_URL", "http://localhost:5000"),
        ]);
        let cfg = GatewayConfig::from_env(&env).unwrap();
        assert_eq!(cfg.target_base_url(), "http://localhost:5000");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (var, value) in [
            ("PORT", "eighty"),
            ("API_TARGET_URL", "ftp://files.example.com"),
            ("API_TARGET_URL", "not a url"),
            ("API_PREFIX", "api"),
            ("UPSTREAM_TIMEOUT_SECS", "0"),
            ("ID_TOKEN_SOURCE", "vault"),
            ("DNS_OVERRIDES", "metadata.google.internal"),
            ("EXPOSE_ERROR_DETAILS", "maybe"),
        ] {
            let env = required().with(var, value);
            assert!(
                matches!(GatewayConfig::from_env(&env), Err(ConfigError::Invalid { .. })),
                "{var}={value} should be invalid"
            );
        }
    }

    #[test]
    fn overrides() {
        let env = required()
            .with("PORT", "9090")
            .with("HOST", "127.0.0.1")
            .with("API_PREFIX", "/backend/")
            .with("STATIC_DIR", "/srv/dashboard")
            .with("UPSTREAM_TIMEOUT_SECS", "5")
            .with("GCE_METADATA_HOST", "127.0.0.1:8999")
            .with("DNS_OVERRIDES", "metadata.google.internal=169.254.169.254")
            .with("EXPOSE_ERROR_DETAILS", "false");
        let cfg = GatewayConfig::from_env(&env).unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:9090");
        assert_eq!(cfg.prefix(), "/backend");
        assert_eq!(cfg.static_dir(), Path::new("/srv/dashboard"));
        assert_eq!(cfg.upstream_timeout(), Duration::from_secs(5));
        assert_eq!(
            cfg.token_source(),
            &TokenSource::Metadata {
                host: "127.0.0.1:8999".to_owned()
            }
        );
        assert_eq!(cfg.dns().overrides().len(), 1);
        assert!(!cfg.expose_error_details());
    }

    #[test]
    fn static_token_source_requires_token() {
        let env = required().with("ID_TOKEN_SOURCE", "static");
        assert_eq!(
            GatewayConfig::from_env(&env).unwrap_err(),
            ConfigError::Missing { var: "ID_TOKEN" }
        );

        let cfg = GatewayConfig::from_env(&env.with("ID_TOKEN", "dev-token")).unwrap();
        assert_eq!(
            cfg.token_source(),
            &TokenSource::Static {
                token: "dev-token".to_owned()
            }
        );
        assert!(!format!("{cfg:?}").contains("dev-token"));
    }

    #[test]
    fn ipv6_listen_addr() {
        let cfg = GatewayConfig::new("http://localhost:5000", "aud")
            .unwrap()
            .with_host("::")
            .with_port(8081);
        assert_eq!(cfg.listen_addr(), "[::]:8081");
    }
}
