//! # Configuration Management
//!
//! This module loads the application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between section and key)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (HOST, PORT, AZURE_OPENAI_*)
//! 2. Environment variables (APP_SERVER__HOST, APP_BRIDGE__RESPONSE_TIMEOUT_SECS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The configuration is loaded once in `main`, validated, and is read-only
//! from then on.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Placeholder shown instead of the API key wherever the config is exposed.
pub const REDACTED: &str = "***";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub realtime: RealtimeSettings,
    pub bridge: BridgeConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection settings for the hosted realtime service.
///
/// ## Fields:
/// - `endpoint`: resource URL, e.g. `https://my-resource.openai.azure.com`
/// - `deployment`: name of the realtime model deployment
/// - `api_key`: sent as the `api-key` header, never logged or exposed
/// - `api_version`: `api-version` query parameter
/// - `voice` / `instructions`: optional session settings passed through to the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeSettings {
    pub endpoint: String,
    pub deployment: String,
    pub api_key: String,
    pub api_version: String,
    pub voice: Option<String>,
    pub instructions: Option<String>,
}

/// Per-session bridge behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Audio sample rate agreed with the browser page (Hz)
    pub sample_rate: u32,
    /// Longest wait for the next upstream event while a response streams
    pub response_timeout_secs: u64,
    /// Longest a whole response cycle may take, from `stop` to `done`
    pub response_deadline_secs: u64,
    /// Ping interval on the browser WebSocket
    pub heartbeat_interval_secs: u64,
    /// Browser connections silent for longer than this are dropped
    pub client_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            realtime: RealtimeSettings {
                endpoint: String::new(),
                deployment: String::new(),
                api_key: String::new(),
                api_version: "2025-04-01-preview".to_string(),
                voice: None,
                instructions: None,
            },
            bridge: BridgeConfig {
                sample_rate: 24000,
                response_timeout_secs: 30,
                response_deadline_secs: 300,
                heartbeat_interval_secs: 5,
                client_timeout_secs: 30,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl BridgeConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn response_deadline(&self) -> Duration {
        Duration::from_secs(self.response_deadline_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_BRIDGE__RESPONSE_TIMEOUT_SECS=60`: Override the stall timeout
    /// - `AZURE_OPENAI_ENDPOINT=https://...`: Realtime service endpoint
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Variables used by deployment platforms and the Azure tooling
        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("AZURE_OPENAI_API_KEY", "realtime.api_key"),
            ("AZURE_OPENAI_ENDPOINT", "realtime.endpoint"),
            ("AZURE_OPENAI_DEPLOYMENT", "realtime.deployment"),
            ("AZURE_OPENAI_API_VERSION", "realtime.api_version"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.realtime.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "Realtime endpoint is not set (AZURE_OPENAI_ENDPOINT)"
            ));
        }

        if self.realtime.deployment.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "Realtime deployment is not set (AZURE_OPENAI_DEPLOYMENT)"
            ));
        }

        if self.bridge.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        let timeouts = [
            ("response_timeout_secs", self.bridge.response_timeout_secs),
            ("response_deadline_secs", self.bridge.response_deadline_secs),
            ("heartbeat_interval_secs", self.bridge.heartbeat_interval_secs),
            ("client_timeout_secs", self.bridge.client_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(anyhow::anyhow!("bridge.{} must be greater than 0", name));
            }
        }

        Ok(())
    }

    /// Copy safe to hand out over the API.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.realtime.api_key.is_empty() {
            config.realtime.api_key = REDACTED.to_string();
        }
        config
    }
}
