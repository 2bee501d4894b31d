use config::{ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// URL scheme that selects the in-memory stores
pub const MEMORY_DATABASE_URL: &str = "memory://";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    /// Take the client IP from `Forwarded`/`X-Forwarded-For`; only behind a proxy that sets them
    pub trust_forwarded_headers: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with(MEMORY_DATABASE_URL)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub clock_skew_grace_seconds: i64,
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayMode {
    Simulated,
    JsonRpc,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewayConfig {
    pub mode: GatewayMode,
    pub rpc_url: String,
    pub contract_address: String,
    /// Unlocked node account used as `from`; the first `eth_accounts` entry when empty
    pub from_account: Option<String>,
    pub latency_ms: u64,
    pub success_rate: f64,
    pub initial_balance: String,
    pub settlement_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl GatewayConfig {
    pub fn initial_balance(&self) -> Result<Decimal, String> {
        Decimal::from_str(&self.initial_balance)
            .map_err(|e| format!("Invalid gateway.initial_balance: {}", e))
    }
}

/// Initial admin account created at startup when all fields are set
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct BootstrapConfig {
    pub admin_username: Option<String>,
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
}

impl BootstrapConfig {
    pub fn admin(&self) -> Option<(&str, &str, &str)> {
        match (&self.admin_username, &self.admin_email, &self.admin_password) {
            (Some(username), Some(email), Some(password)) => {
                Some((username.as_str(), email.as_str(), password.as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 5000)?
            .set_default("server.workers", 4)?
            .set_default("server.trust_forwarded_headers", false)?
            .set_default("database.url", MEMORY_DATABASE_URL)?
            .set_default("database.max_connections", 10)?
            .set_default("database.acquire_timeout_seconds", 5)?
            .set_default("auth.jwt_secret", "")?
            .set_default("auth.token_ttl_seconds", 86400)?
            .set_default("auth.clock_skew_grace_seconds", 30)?
            .set_default("auth.argon2_memory_kib", 19456)?
            .set_default("auth.argon2_iterations", 2)?
            .set_default("auth.argon2_parallelism", 1)?
            .set_default("gateway.mode", "simulated")?
            .set_default("gateway.rpc_url", "http://127.0.0.1:7545")?
            .set_default(
                "gateway.contract_address",
                "0x9b64DE133BAb117b4F37cf7fE239BF5e4C062aeD",
            )?
            .set_default("gateway.latency_ms", 200)?
            .set_default("gateway.success_rate", 1.0)?
            .set_default("gateway.initial_balance", "100")?
            .set_default("gateway.settlement_timeout_seconds", 30)?
            .set_default("gateway.request_timeout_seconds", 10)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(Environment::with_prefix("DISBURSEMENT").separator("__"));

        // Special handling for common env vars
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(secret) = env::var("JWT_SECRET_KEY") {
            builder = builder.set_override("auth.jwt_secret", secret)?;
        }

        if let Ok(ttl) = env::var("JWT_ACCESS_TOKEN_EXPIRES") {
            builder = builder.set_override("auth.token_ttl_seconds", ttl)?;
        }

        if let Ok(url) = env::var("GANACHE_URL") {
            builder = builder.set_override("gateway.rpc_url", url)?;
        }

        if let Ok(address) = env::var("CONTRACT_ADDRESS") {
            builder = builder.set_override("gateway.contract_address", address)?;
        }

        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.auth.jwt_secret.len() < 16 {
            return Err("JWT secret must be at least 16 characters".to_string());
        }

        if self.auth.token_ttl_seconds <= 0 {
            return Err("Token TTL must be positive".to_string());
        }

        if self.auth.clock_skew_grace_seconds < 0 {
            return Err("Clock skew grace cannot be negative".to_string());
        }

        if !(0.0..=1.0).contains(&self.gateway.success_rate) {
            return Err("Gateway success rate must be within [0, 1]".to_string());
        }

        if self.gateway.settlement_timeout_seconds == 0 {
            return Err("Settlement timeout must be positive".to_string());
        }

        if self.gateway.initial_balance()? < Decimal::ZERO {
            return Err("Gateway initial balance cannot be negative".to_string());
        }

        if self.gateway.mode == GatewayMode::JsonRpc && self.gateway.rpc_url.is_empty() {
            return Err("Gateway RPC URL is required in json_rpc mode".to_string());
        }

        if self.bootstrap.admin_password.is_some() && self.bootstrap.admin().is_none() {
            return Err("Bootstrap admin needs username, email and password".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
                workers: 1,
                trust_forwarded_headers: false,
            },
            database: DatabaseConfig {
                url: MEMORY_DATABASE_URL.to_string(),
                max_connections: 5,
                acquire_timeout_seconds: 5,
            },
            auth: AuthConfig {
                jwt_secret: "a-sufficiently-long-secret".to_string(),
                token_ttl_seconds: 3600,
                clock_skew_grace_seconds: 30,
                argon2_memory_kib: 19456,
                argon2_iterations: 2,
                argon2_parallelism: 1,
            },
            gateway: GatewayConfig {
                mode: GatewayMode::Simulated,
                rpc_url: "http://127.0.0.1:7545".to_string(),
                contract_address: "0x9b64DE133BAb117b4F37cf7fE239BF5e4C062aeD".to_string(),
                from_account: None,
                latency_ms: 0,
                success_rate: 1.0,
                initial_balance: "100".to_string(),
                settlement_timeout_seconds: 30,
                request_timeout_seconds: 10,
            },
            bootstrap: BootstrapConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }

    #[test]
    fn test_valid_config() {
        let config = sample();
        assert!(config.validate().is_ok());
        assert!(config.database.is_memory());
    }

    #[test]
    fn test_rejects_short_secret() {
        let mut config = sample();
        config.auth.jwt_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_success_rate() {
        let mut config = sample();
        config.gateway.success_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_bootstrap_rejected() {
        let mut config = sample();
        config.bootstrap.admin_password = Some("admin123".to_string());
        assert!(config.validate().is_err());

        config.bootstrap.admin_username = Some("admin".to_string());
        config.bootstrap.admin_email = Some("admin@transparex.com".to_string());
        assert!(config.validate().is_ok());
    }
}
