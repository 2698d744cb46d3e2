//! Configuration management for Gatekeeper.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{LimiterBuilder, SlidingWindowBuilder};

/// Environment variable prefix; nested keys are separated by `__`,
/// e.g. `GATEKEEPER__LIMITS__STRICT__MAX=3`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-policy limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// How often expired counters are swept, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080)
}

fn default_cleanup_interval() -> u64 {
    60
}

impl ServerConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Limits for each policy the service wires up.
///
/// Any field left out of a policy section falls back to that policy's own
/// default, so `GATEKEEPER__LIMITS__STRICT__MAX=3` keeps the strict window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "LimitsOverrides")]
pub struct LimitsConfig {
    /// Per caller address
    pub caller: LimitSettings,

    /// Per authenticated identity
    pub identity: LimitSettings,

    /// Per endpoint
    pub endpoint: LimitSettings,

    /// Sensitive operations
    pub strict: LimitSettings,

    /// Sliding-window log limiter
    pub sliding: LimitSettings,
}

/// The `limits` section as written, before policy defaults are filled in.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LimitsOverrides {
    caller: SettingsOverride,
    identity: SettingsOverride,
    endpoint: SettingsOverride,
    strict: SettingsOverride,
    sliding: SettingsOverride,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsOverride {
    max: Option<u64>,
    window_ms: Option<u64>,
    standard_headers: Option<bool>,
    legacy_headers: Option<bool>,
}

impl SettingsOverride {
    fn over(self, base: LimitSettings) -> LimitSettings {
        LimitSettings {
            max: self.max.unwrap_or(base.max),
            window_ms: self.window_ms.unwrap_or(base.window_ms),
            standard_headers: self.standard_headers.unwrap_or(base.standard_headers),
            legacy_headers: self.legacy_headers.unwrap_or(base.legacy_headers),
        }
    }
}

impl From<LimitsOverrides> for LimitsConfig {
    fn from(overrides: LimitsOverrides) -> Self {
        Self {
            caller: overrides.caller.over(default_caller()),
            identity: overrides.identity.over(default_identity()),
            endpoint: overrides.endpoint.over(default_endpoint()),
            strict: overrides.strict.over(default_strict()),
            sliding: overrides.sliding.over(default_sliding()),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            caller: default_caller(),
            identity: default_identity(),
            endpoint: default_endpoint(),
            strict: default_strict(),
            sliding: default_sliding(),
        }
    }
}

const FIFTEEN_MINUTES_MS: u64 = 15 * 60 * 1000;
const ONE_MINUTE_MS: u64 = 60 * 1000;

fn default_caller() -> LimitSettings {
    LimitSettings::new(100, FIFTEEN_MINUTES_MS)
}

fn default_identity() -> LimitSettings {
    LimitSettings::new(1000, FIFTEEN_MINUTES_MS)
}

fn default_endpoint() -> LimitSettings {
    LimitSettings::new(60, ONE_MINUTE_MS)
}

fn default_strict() -> LimitSettings {
    LimitSettings::new(5, FIFTEEN_MINUTES_MS)
}

fn default_sliding() -> LimitSettings {
    LimitSettings::new(30, ONE_MINUTE_MS)
}

/// Limit and header options for one limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Requests admitted per key per window
    pub max: u64,

    /// Window length in milliseconds
    pub window_ms: u64,

    /// Emit `RateLimit-*` headers
    #[serde(default = "default_true")]
    pub standard_headers: bool,

    /// Emit `X-RateLimit-*` headers
    #[serde(default)]
    pub legacy_headers: bool,
}

fn default_true() -> bool {
    true
}

impl LimitSettings {
    pub fn new(max: u64, window_ms: u64) -> Self {
        Self {
            max,
            window_ms,
            standard_headers: true,
            legacy_headers: false,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// A fixed-window builder carrying these settings.
    pub fn builder(&self) -> LimiterBuilder {
        LimiterBuilder::new()
            .max(self.max)
            .window(self.window())
            .standard_headers(self.standard_headers)
            .legacy_headers(self.legacy_headers)
    }

    /// A sliding-window builder carrying these settings.
    pub fn sliding_builder(&self) -> SlidingWindowBuilder {
        SlidingWindowBuilder::new()
            .max(self.max)
            .window(self.window())
            .standard_headers(self.standard_headers)
            .legacy_headers(self.legacy_headers)
    }

    fn validate(&self, policy: &str) -> Result<()> {
        if self.max == 0 {
            return Err(GatekeeperError::Config(format!(
                "limits.{}.max must be greater than 0",
                policy
            )));
        }
        if self.window_ms == 0 {
            return Err(GatekeeperError::Config(format!(
                "limits.{}.window_ms must be greater than 0",
                policy
            )));
        }
        Ok(())
    }
}

impl GatekeeperConfig {
    /// Load configuration from an optional file, with environment overrides.
    ///
    /// The file format is picked from its extension (YAML, TOML, JSON).
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_env(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: Option<&str>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration file");
            builder = builder.add_source(File::with_name(path));
        }

        let config: GatekeeperConfig = builder
            .add_source(env.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would fail at limiter construction.
    pub fn validate(&self) -> Result<()> {
        if self.server.cleanup_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "server.cleanup_interval_secs must be greater than 0".to_string(),
            ));
        }

        self.limits.caller.validate("caller")?;
        self.limits.identity.validate("identity")?;
        self.limits.endpoint.validate("endpoint")?;
        self.limits.strict.validate("strict")?;
        self.limits.sliding.validate("sliding")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatekeeperConfig::default();

        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.server.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.limits.strict.max, 5);
        assert_eq!(config.limits.caller.window(), Duration::from_secs(900));
        assert!(config.limits.caller.standard_headers);
        assert!(!config.limits.caller.legacy_headers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_empty_yaml_uses_defaults() {
        let config = GatekeeperConfig::from_yaml("{}").unwrap();
        assert_eq!(config, GatekeeperConfig::default());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
limits:
  strict:
    max: 3
    window_ms: 60000
    legacy_headers: true
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.server.cleanup_interval_secs, 60);
        assert_eq!(config.limits.strict, LimitSettings {
            max: 3,
            window_ms: 60000,
            standard_headers: true,
            legacy_headers: true,
        });
        assert_eq!(config.limits.caller, default_caller());
    }

    #[test]
    fn test_zero_max_rejected() {
        let yaml = r#"
limits:
  caller:
    max: 0
    window_ms: 1000
"#;
        let err = GatekeeperConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("limits.caller.max"));
    }

    #[test]
    fn test_zero_window_rejected() {
        let yaml = r#"
limits:
  sliding:
    max: 10
    window_ms: 0
"#;
        let err = GatekeeperConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("limits.sliding.window_ms"));
    }

    #[test]
    fn test_zero_cleanup_interval_rejected() {
        let yaml = r#"
server:
  cleanup_interval_secs: 0
"#;
        assert!(matches!(
            GatekeeperConfig::from_yaml(yaml),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            GatekeeperConfig::from_yaml("limits: [1, 2"),
            Err(GatekeeperError::Config(_))
        ));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = GatekeeperConfig::load(None).unwrap();
        assert_eq!(config.limits, LimitsConfig::default());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = GatekeeperConfig::load(Some("/nonexistent/gatekeeper.yaml"));
        assert!(matches!(result, Err(GatekeeperError::Settings(_))));
    }

    #[test]
    fn test_partial_section_keeps_policy_defaults() {
        let yaml = r#"
limits:
  strict:
    max: 3
  caller:
    window_ms: 1000
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limits.strict.max, 3);
        assert_eq!(config.limits.strict.window_ms, default_strict().window_ms);
        assert!(config.limits.strict.standard_headers);
        assert_eq!(config.limits.caller.max, default_caller().max);
        assert_eq!(config.limits.caller.window_ms, 1000);
    }

    #[test]
    fn test_env_overrides_single_field() {
        let vars: config::Map<String, String> = [
            ("GATEKEEPER__LIMITS__STRICT__MAX", "3"),
            ("GATEKEEPER__LIMITS__SLIDING__LEGACY_HEADERS", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let env = Environment::with_prefix(ENV_PREFIX).source(Some(vars));

        let config = GatekeeperConfig::load_with_env(None, env).unwrap();

        assert_eq!(config.limits.strict.max, 3);
        assert_eq!(config.limits.strict.window_ms, default_strict().window_ms);
        assert!(config.limits.sliding.legacy_headers);
        assert_eq!(config.limits.sliding.max, default_sliding().max);
        assert_eq!(config.limits.caller, default_caller());
    }

    #[test]
    fn test_settings_builder_produces_limiter() {
        let settings = LimitSettings::new(7, 1000);
        let limiter = settings.builder().build().unwrap();
        assert_eq!(limiter.max(), 7);
        assert_eq!(limiter.window(), Duration::from_secs(1));

        let sliding = settings.sliding_builder().build().unwrap();
        assert_eq!(sliding.log().max(), 7);
    }
}
