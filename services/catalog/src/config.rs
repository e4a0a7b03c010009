use crate::catalog::CatalogSettings;
use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::time::Duration;

/// Longest lifetime S3 accepts for a presigned URL (7 days)
pub const MAX_SIGNED_URL_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Main configuration for the catalog service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration (inference dispatch and results)
    pub kafka: Option<KafkaConfig>,
    /// S3 configuration
    pub s3: Option<S3Config>,
    /// Database configuration
    pub database: Option<DatabaseConfig>,
    /// Catalog core tunables
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Bearer token verification
    pub auth: AuthConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which collaborators back the catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// PostgreSQL, S3 and Kafka
    #[default]
    Cloud,
    /// In-process stores, nothing leaves the process
    Memory,
}

/// Kafka configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// Consumer group ID for the results consumer
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic new images are announced on
    #[serde(default = "default_dispatch_topic")]
    pub dispatch_topic: String,
    /// Topic inference results arrive on
    #[serde(default = "default_results_topic")]
    pub results_topic: String,
    /// Publish inference requests on upload
    #[serde(default = "default_true")]
    pub dispatch_enabled: bool,
    /// Consume inference results
    #[serde(default = "default_true")]
    pub results_consumer_enabled: bool,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Producer message timeout in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u32,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding uploaded images
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Catalog core configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub backend: Backend,
    /// Prefix of image object keys
    #[serde(default = "default_object_prefix")]
    pub object_prefix: String,
    /// Lifetime of signed image links in seconds (7 days default)
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    /// Deadline for each store, blob, signer and dispatch call
    #[serde(default = "default_collaborator_timeout_ms")]
    pub collaborator_timeout_ms: u64,
    /// Largest accepted image in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
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
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Bearer token verification
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 shared secret
    pub jwt_secret: String,
    /// Claim carrying the caller identity
    #[serde(default = "default_identity_claim")]
    pub identity_claim: String,
}

// Default value functions
fn default_service_name() -> String {
    "catalog-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_consumer_group() -> String {
    "catalog-service".to_string()
}

fn default_dispatch_topic() -> String {
    "catalog.images.pending".to_string()
}

fn default_results_topic() -> String {
    "catalog.images.results".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_message_timeout_ms() -> u32 {
    5000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_object_prefix() -> String {
    "images".to_string()
}

fn default_signed_url_ttl_secs() -> u64 {
    MAX_SIGNED_URL_TTL_SECS
}

fn default_page_size() -> usize {
    20
}

fn default_max_page_size() -> usize {
    100
}

fn default_collaborator_timeout_ms() -> u64 {
    10_000
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024 // 20MB
}

fn default_identity_claim() -> String {
    "email".to_string()
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "catalog-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(
                config::File::with_name("config/catalog")
                    .required(false)
            )
            .add_source(
                config::File::with_name("/etc/catalog/catalog")
                    .required(false)
            )
            // Override with environment variables
            // CATALOG__AUTH__JWT_SECRET -> auth.jwt_secret
            .add_source(
                config::Environment::with_prefix("CATALOG")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the selected backend has everything it needs
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.jwt_secret must not be empty");
        }
        if self.catalog.default_page_size == 0 || self.catalog.max_page_size == 0 {
            anyhow::bail!("catalog page sizes must be positive");
        }
        if self.catalog.backend == Backend::Cloud {
            if self.catalog.signed_url_ttl_secs > MAX_SIGNED_URL_TTL_SECS {
                anyhow::bail!(
                    "catalog.signed_url_ttl_secs must not exceed {} for the cloud backend",
                    MAX_SIGNED_URL_TTL_SECS
                );
            }
            if self.s3.is_none() {
                anyhow::bail!("s3 section is required for the cloud backend");
            }
            if self.database.is_none() {
                anyhow::bail!("database section is required for the cloud backend");
            }
        }
        Ok(())
    }

    /// Get the collaborator deadline as Duration
    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.catalog.collaborator_timeout_ms)
    }

    /// Get signed URL lifetime as Duration
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog.signed_url_ttl_secs)
    }
}

impl KafkaConfig {
    /// Connection settings shared by the producer and the consumer
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &self.bootstrap_servers);

        // Configure SSL if enabled
        if self.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = self.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        // Configure SASL if credentials provided
        if let (Some(ref username), Some(ref password)) = (&self.sasl_username, &self.sasl_password) {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        client_config
    }
}

impl From<&Config> for CatalogSettings {
    fn from(config: &Config) -> Self {
        Self {
            object_prefix: config.catalog.object_prefix.clone(),
            signed_url_ttl: config.signed_url_ttl(),
            default_page_size: config.catalog.default_page_size,
            max_page_size: config.catalog.max_page_size,
            call_timeout: config.collaborator_timeout(),
            max_upload_bytes: config.catalog.max_upload_bytes,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            object_prefix: default_object_prefix(),
            signed_url_ttl_secs: default_signed_url_ttl_secs(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            collaborator_timeout_ms: default_collaborator_timeout_ms(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
