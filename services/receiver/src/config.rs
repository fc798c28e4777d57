use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration for the receiver service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Storage roots
    #[serde(default)]
    pub storage: StorageConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Inference payload decoder selection
    #[serde(default)]
    pub decoder: DecoderConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Prometheus exporter port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Tokio worker threads
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Console format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for the daily log file
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

/// Filesystem roots for received data
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the image tree
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    /// Root of the metadata tree
    #[serde(default = "default_meta_dir")]
    pub meta_dir: PathBuf,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Maximum accepted request body in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Answer failed uploads with transport status 200, carrying the real
    /// code only inside the JSON body
    #[serde(default)]
    pub legacy_always_ok: bool,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Which built-in decoder handles the `O` field of an inference
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    /// Base64 wrapping a UTF-8 JSON document
    Base64Json,
    /// Base64 of arbitrary bytes, reported as size + canonical base64
    Base64Bytes,
    /// Skip decoding; records are stored as received
    None,
}

/// Decoder configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_decoder_kind")]
    pub kind: DecoderKind,
}

// Default value functions
fn default_service_name() -> String {
    "edge-receiver".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_worker_threads() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("./image")
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("./meta")
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_decoder_kind() -> DecoderKind {
    DecoderKind::Base64Json
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/receiver").required(false))
            .add_source(config::File::with_name("/etc/edge-receiver/receiver").required(false))
            // Override with environment variables
            // RECEIVER__STORAGE__IMAGE_DIR -> storage.image_dir
            .add_source(
                config::Environment::with_prefix("RECEIVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage.image_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.image_dir".to_string(),
            ));
        }
        if self.storage.meta_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.meta_dir".to_string(),
            ));
        }
        if self.storage.image_dir == self.storage.meta_dir {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.meta_dir".to_string(),
                message: "Image and metadata roots must differ".to_string(),
            });
        }
        if self.api.port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.port".to_string(),
                message: "Port must be greater than 0".to_string(),
            });
        }
        if self.api.max_body_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "api.max_body_bytes".to_string(),
                message: "Body limit must be greater than 0".to_string(),
            });
        }
        if self.service.worker_threads == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "service.worker_threads".to_string(),
                message: "At least one worker thread is required".to_string(),
            });
        }

        Ok(())
    }

    /// Listen address for the HTTP API
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
            decoder: DecoderConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: default_metrics_port(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: default_log_dir(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            image_dir: default_image_dir(),
            meta_dir: default_meta_dir(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            max_body_bytes: default_max_body_bytes(),
            legacy_always_ok: false,
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            kind: default_decoder_kind(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
