//! Configuration management

use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/sdas";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

// ============================================================================
// Archive Workflow Constants
// ============================================================================

/// Default bucket receiving archived table data.
pub const DEFAULT_DATA_BUCKET: &str = "sdas-archive-data";

/// Default scratch location for ETL jobs.
pub const DEFAULT_TEMP_DIR: &str = "s3://sdas-archive-temp/temp/";

/// Default prefix of the per-engine ETL templates.
pub const DEFAULT_SCRIPT_LOCATION: &str = "s3://sdas-archive-scripts/scripts";

/// Default ETL job timeout in minutes (48 hours).
pub const DEFAULT_JOB_TIMEOUT_MINUTES: u32 = 2880;

/// Default ETL worker class.
pub const DEFAULT_WORKER_TYPE: &str = "Standard";

/// Default ETL worker count.
pub const DEFAULT_WORKER_COUNT: u32 = 2;

/// Default upper bound on ETL workers a user may request.
pub const DEFAULT_MAX_WORKER_COUNT: u32 = 100;

// ============================================================================
// Gateway / Query Constants
// ============================================================================

/// Default control-plane gateway URL.
pub const DEFAULT_GATEWAY_URL: &str = "http://localhost:9000";

/// Default gateway request timeout in seconds.
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 30;

/// Default interactive-query workgroup.
pub const DEFAULT_QUERY_WORKGROUP: &str = "sdas";

/// Default interval between query state polls in milliseconds.
pub const DEFAULT_QUERY_POLL_INTERVAL_MS: u64 = 500;

/// Default upper bound on waiting for an interactive query in seconds.
pub const DEFAULT_QUERY_MAX_WAIT_SECS: u64 = 60;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cors: CorsConfig,
    pub archive: ArchiveConfig,
    pub gateway: GatewayConfig,
    pub query: QueryConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

/// Archive workflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub data_bucket: String,
    pub temp_dir: String,
    pub script_location: String,
    pub job_timeout_minutes: u32,
    pub default_worker_type: String,
    pub default_worker_count: u32,
    pub max_worker_count: u32,
}

/// Control-plane gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub url: String,
    pub timeout_secs: u64,
}

/// Interactive query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub workgroup: String,
    pub output_location: Option<String>,
    pub poll_interval_ms: u64,
    pub max_wait_secs: u64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env();
        config.validate()?;

        Ok(config)
    }

    /// Read every setting from the process environment
    pub fn from_env() -> Self {
        Config {
            server: ServerConfig {
                host: env_string("SDAS_HOST", DEFAULT_SERVER_HOST),
                port: env_or("SDAS_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or(
                    "SDAS_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            cors: CorsConfig {
                allowed_origins: env_string("CORS_ALLOWED_ORIGINS", DEFAULT_CORS_ALLOWED_ORIGIN)
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                allow_credentials: env_or("CORS_ALLOW_CREDENTIALS", true),
            },
            archive: ArchiveConfig {
                data_bucket: env_string("ARCHIVE_DATA_BUCKET", DEFAULT_DATA_BUCKET),
                temp_dir: env_string("ARCHIVE_TEMP_DIR", DEFAULT_TEMP_DIR),
                script_location: env_string("ARCHIVE_SCRIPT_LOCATION", DEFAULT_SCRIPT_LOCATION),
                job_timeout_minutes: env_or(
                    "ARCHIVE_JOB_TIMEOUT_MINUTES",
                    DEFAULT_JOB_TIMEOUT_MINUTES,
                ),
                default_worker_type: env_string("ARCHIVE_DEFAULT_WORKER_TYPE", DEFAULT_WORKER_TYPE),
                default_worker_count: env_or("ARCHIVE_DEFAULT_WORKER_COUNT", DEFAULT_WORKER_COUNT),
                max_worker_count: env_or("ARCHIVE_MAX_WORKER_COUNT", DEFAULT_MAX_WORKER_COUNT),
            },
            gateway: GatewayConfig {
                url: env_string("GATEWAY_URL", DEFAULT_GATEWAY_URL),
                timeout_secs: env_or("GATEWAY_TIMEOUT_SECS", DEFAULT_GATEWAY_TIMEOUT_SECS),
            },
            query: QueryConfig {
                workgroup: env_string("QUERY_WORKGROUP", DEFAULT_QUERY_WORKGROUP),
                output_location: std::env::var("QUERY_OUTPUT_LOCATION")
                    .ok()
                    .filter(|s| !s.is_empty()),
                poll_interval_ms: env_or("QUERY_POLL_INTERVAL_MS", DEFAULT_QUERY_POLL_INTERVAL_MS),
                max_wait_secs: env_or("QUERY_MAX_WAIT_SECS", DEFAULT_QUERY_MAX_WAIT_SECS),
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.archive.default_worker_count == 0 {
            anyhow::bail!("Archive default worker count must be greater than 0");
        }

        if self.archive.default_worker_count > self.archive.max_worker_count {
            anyhow::bail!(
                "Archive default worker count ({}) cannot exceed the maximum ({})",
                self.archive.default_worker_count,
                self.archive.max_worker_count
            );
        }

        if self.archive.data_bucket.is_empty() {
            anyhow::bail!("Archive data bucket cannot be empty");
        }

        if self.gateway.url.is_empty() {
            anyhow::bail!("Gateway URL cannot be empty");
        }

        if self.cors.allowed_origins.is_empty() {
            tracing::warn!("No CORS origins configured - all origins will be allowed");
        }

        Ok(())
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            data_bucket: DEFAULT_DATA_BUCKET.to_string(),
            temp_dir: DEFAULT_TEMP_DIR.to_string(),
            script_location: DEFAULT_SCRIPT_LOCATION.to_string(),
            job_timeout_minutes: DEFAULT_JOB_TIMEOUT_MINUTES,
            default_worker_type: DEFAULT_WORKER_TYPE.to_string(),
            default_worker_count: DEFAULT_WORKER_COUNT,
            max_worker_count: DEFAULT_MAX_WORKER_COUNT,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            workgroup: DEFAULT_QUERY_WORKGROUP.to_string(),
            output_location: None,
            poll_interval_ms: DEFAULT_QUERY_POLL_INTERVAL_MS,
            max_wait_secs: DEFAULT_QUERY_MAX_WAIT_SECS,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: true,
            },
            archive: ArchiveConfig::default(),
            gateway: GatewayConfig {
                url: DEFAULT_GATEWAY_URL.to_string(),
                timeout_secs: DEFAULT_GATEWAY_TIMEOUT_SECS,
            },
            query: QueryConfig::default(),
        }
    }
}
