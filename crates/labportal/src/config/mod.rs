use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::portal::{PortalPolicy, MAX_ACCESS_CODE_TTL_HOURS};

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub portal: PortalConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let access_code_ttl_hours = env::var("LAB_ACCESS_CODE_TTL_HOURS")
            .unwrap_or_else(|_| "72".to_string())
            .parse::<i64>()
            .ok()
            .filter(|hours| (1..=MAX_ACCESS_CODE_TTL_HOURS).contains(hours))
            .ok_or(ConfigError::InvalidAccessCodeTtl)?;
        let max_accesses = env::var("LAB_ACCESS_CODE_MAX_VIEWS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u32>()
            .ok()
            .filter(|views| *views > 0)
            .ok_or(ConfigError::InvalidAccessLimit)?;
        let catalog_csv = env::var("LAB_CATALOG_CSV")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        let admin_staff_id = env::var("LAB_ADMIN_STAFF_ID")
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| "admin".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig {
                log_level,
                ansi: environment == AppEnvironment::Development,
            },
            portal: PortalConfig {
                access_code_ttl_hours,
                max_accesses,
                catalog_csv,
                admin_staff_id,
            },
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Colored output, only wanted on a developer terminal.
    pub ansi: bool,
}

/// Access-code rules, catalog source, and the bootstrap admin account.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub access_code_ttl_hours: i64,
    pub max_accesses: u32,
    pub catalog_csv: Option<PathBuf>,
    pub admin_staff_id: String,
}

impl PortalConfig {
    pub fn policy(&self) -> PortalPolicy {
        PortalPolicy::new(self.access_code_ttl_hours, self.max_accesses)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidAccessCodeTtl,
    InvalidAccessLimit,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidAccessCodeTtl => {
                write!(
                    f,
                    "LAB_ACCESS_CODE_TTL_HOURS must be between 1 and {MAX_ACCESS_CODE_TTL_HOURS} hours"
                )
            }
            ConfigError::InvalidAccessLimit => {
                write!(f, "LAB_ACCESS_CODE_MAX_VIEWS must be a positive integer")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::InvalidAccessCodeTtl
            | ConfigError::InvalidAccessLimit => None,
        }
    }
}
