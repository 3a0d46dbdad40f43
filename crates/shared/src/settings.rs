use std::env;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub providers: ProviderSettings,
    pub tracking: TrackingSettings,
    pub backend: BackendSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Directory holding one YAML file per provider.
    pub config_dir: String,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            config_dir: "config/providers".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    /// When false, runs are never mirrored to the tracking service.
    pub enabled: bool,
    pub base_url: String,
    pub experiment_name: String,
    pub artifact_location: Option<String>,
    pub request_timeout_secs: u64,
    pub retry: RetrySettings,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:5000".into(),
            experiment_name: "evalhub".into(),
            artifact_location: None,
            request_timeout_secs: 30,
            retry: RetrySettings::default(),
        }
    }
}

/// Exponential backoff for transient tracking-service failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts per request, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub docker_binary: String,
    /// Host directory under which each job gets an output directory.
    pub work_dir: String,
    pub network: Option<String>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            docker_binary: "docker".into(),
            work_dir: "runs".into(),
            network: None,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false));

        if let Ok(env_name) = env::var("APP_ENV") {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", env_name)).required(false),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("EVALHUB")
                .try_parsing(true)
                .separator("__"),
        );

        builder.build()?.try_deserialize()
    }
}
