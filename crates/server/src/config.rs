use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use ocrd::{PipelineConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum upload size in MB; bounds multipart bodies.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,

    /// Whether the overlay output format is allowed.
    #[serde(default = "default_true")]
    pub overlay_enabled: bool,

    /// Default overlay bounding-box color, `RRGGBB`.
    #[serde(default)]
    pub overlay_box_color: Option<String>,

    /// Default overlay polygon color, `RRGGBB`.
    #[serde(default)]
    pub overlay_polygon_color: Option<String>,

    /// Directory holding model files.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Default recognition language.
    #[serde(default = "default_language")]
    pub language: String,

    /// Default character dictionaries.
    #[serde(default)]
    pub dictionary_paths: Vec<PathBuf>,

    /// Intra-op inference threads; 0 = runtime default.
    #[serde(default)]
    pub num_threads: usize,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Log filter, e.g. `info` or `server=debug`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            timeout_secs: default_timeout_secs(),
            max_upload_mb: default_max_upload_mb(),
            overlay_enabled: default_true(),
            overlay_box_color: None,
            overlay_polygon_color: None,
            models_dir: default_models_dir(),
            language: default_language(),
            dictionary_paths: Vec::new(),
            num_threads: 0,
            rate_limit: RateLimitConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load from an optional `server` config file overridden by
    /// `OCRD_SERVER__*` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let builder = config::Config::builder()
            .add_source(config::File::with_name("server").required(false))
            .add_source(config::Environment::with_prefix("OCRD_SERVER").separator("__"));
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.bind_addr, self.port).parse()?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Upload cap in bytes.
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }

    /// The pipeline the server builds at startup and falls back to for
    /// requests without overrides.
    pub fn base_pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            models_dir: self.models_dir.clone(),
            language: self.language.clone(),
            dictionary_paths: self.dictionary_paths.clone(),
            num_threads: self.num_threads,
            ..PipelineConfig::default()
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_upload_mb() -> usize {
    50
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}
