use crate::error::{Result, SwivelError};
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiServerConfig,
    /// History persistence configuration
    pub history: HistoryConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port for the API server (default: 8080)
    pub port: u16,
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Allowed CORS origins (comma-separated, empty = localhost only)
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Path of the HTTP test history CSV
    pub http_test_file: String,
    /// Path of the Cloudflare scan history CSV
    pub cf_scan_file: String,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            api: ApiServerConfig {
                port: get_env_or("SWIVEL_API_PORT", "8080").parse().map_err(|_| {
                    SwivelError::InvalidConfig("SWIVEL_API_PORT must be a valid port number".into())
                })?,
                host: get_env_or("SWIVEL_API_HOST", "127.0.0.1"),
                cors_origins: get_env_or("SWIVEL_CORS_ORIGINS", "")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            history: HistoryConfig {
                http_test_file: get_env_or("SWIVEL_HTTP_HISTORY_FILE", "http_test_history.csv"),
                cf_scan_file: get_env_or("SWIVEL_CF_HISTORY_FILE", "cf_scan_history.csv"),
            },
            log: LogConfig {
                level: get_env_or("SWIVEL_LOG_LEVEL", "info"),
            },
        })
    }

    /// Get the API server bind address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "SWIVEL_API_PORT",
        "SWIVEL_API_HOST",
        "SWIVEL_CORS_ORIGINS",
        "SWIVEL_HTTP_HISTORY_FILE",
        "SWIVEL_CF_HISTORY_FILE",
        "SWIVEL_LOG_LEVEL",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.api.port, 8080);
        assert_eq!(config.api.host, "127.0.0.1");
        assert!(config.api.cors_origins.is_empty());
        assert_eq!(config.history.http_test_file, "http_test_history.csv");
        assert_eq!(config.history.cf_scan_file, "cf_scan_history.csv");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("SWIVEL_API_PORT", "9090");
        env::set_var("SWIVEL_API_HOST", "0.0.0.0");
        env::set_var("SWIVEL_CORS_ORIGINS", "https://a.example, https://b.example");
        env::set_var("SWIVEL_HTTP_HISTORY_FILE", "/tmp/http.csv");

        let config = Config::from_env().unwrap();

        assert_eq!(config.api.port, 9090);
        assert_eq!(config.api.host, "0.0.0.0");
        assert_eq!(
            config.api.cors_origins,
            vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ]
        );
        assert_eq!(config.history.http_test_file, "/tmp/http.csv");
        assert_eq!(config.api_addr(), "0.0.0.0:9090");
    }

    #[test]
    fn test_config_from_env_invalid_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("SWIVEL_API_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, SwivelError::InvalidConfig(_)));
    }
}
