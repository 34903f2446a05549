//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The credential file path can be overridden with SESSION_CREDENTIALS_PATH so
//! the same config works across hosts that mount secrets in different places.

use serde::Deserialize;
use session_auth::{DEFAULT_LOGIN_ROUTE, DEFAULT_REFRESH_PATH, DEFAULT_STORAGE_KEY};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub session: SessionConfig,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Session and token refresh settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    pub credentials_path: PathBuf,
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    /// Absolute URL, or a path resolved against `proxy.upstream_url`
    #[serde(default = "default_refresh_endpoint")]
    pub refresh_endpoint: String,
    #[serde(default = "default_login_route")]
    pub login_route: String,
    /// Unset means a refresh may take as long as the endpoint takes
    #[serde(default)]
    pub refresh_timeout_secs: Option<u64>,
}

impl SessionConfig {
    /// Absolute refresh URL for the given upstream base.
    pub fn refresh_url(&self, upstream_url: &str) -> String {
        if is_http_url(&self.refresh_endpoint) {
            return self.refresh_endpoint.clone();
        }
        format!(
            "{}/{}",
            upstream_url.trim_end_matches('/'),
            self.refresh_endpoint.trim_start_matches('/')
        )
    }

    pub fn refresh_timeout(&self) -> Option<Duration> {
        self.refresh_timeout_secs.map(Duration::from_secs)
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.into()
}

fn default_refresh_endpoint() -> String {
    DEFAULT_REFRESH_PATH.into()
}

fn default_login_route() -> String {
    DEFAULT_LOGIN_ROUTE.into()
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(credentials_path) = std::env::var("SESSION_CREDENTIALS_PATH") {
            config.session.credentials_path = PathBuf::from(credentials_path);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !is_http_url(&self.proxy.upstream_url) {
            return Err(common::Error::invalid(
                "proxy.upstream_url",
                format!(
                    "must start with http:// or https://, got: {}",
                    self.proxy.upstream_url
                ),
            ));
        }
        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::invalid(
                "proxy.timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.proxy.max_connections == 0 {
            return Err(common::Error::invalid(
                "proxy.max_connections",
                "must be greater than 0",
            ));
        }
        if self.session.storage_key.trim().is_empty() {
            return Err(common::Error::invalid(
                "session.storage_key",
                "must not be empty",
            ));
        }
        if self.session.refresh_endpoint.trim().is_empty() {
            return Err(common::Error::invalid(
                "session.refresh_endpoint",
                "must not be empty",
            ));
        }
        if !self.session.login_route.starts_with('/') {
            return Err(common::Error::invalid(
                "session.login_route",
                format!("must start with '/', got: {}", self.session.login_route),
            ));
        }
        if self.session.refresh_timeout_secs == Some(0) {
            return Err(common::Error::invalid(
                "session.refresh_timeout_secs",
                "must be greater than 0 when set",
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-proxy.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.example.test"

[session]
credentials_path = "/var/lib/session-proxy/credentials.json"
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("SESSION_CREDENTIALS_PATH") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.upstream_url, "https://api.example.test");
        assert_eq!(config.proxy.timeout_secs, 60);
        assert_eq!(config.proxy.max_connections, 1000);
        assert_eq!(
            config.session.credentials_path,
            PathBuf::from("/var/lib/session-proxy/credentials.json")
        );
        assert_eq!(config.session.storage_key, "session");
        assert_eq!(config.session.refresh_endpoint, "/api/auth/refresh-token");
        assert_eq!(config.session.login_route, "/login");
        assert_eq!(config.session.refresh_timeout(), None);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_missing_session_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.example.test"
"#,
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_rejects_non_http_upstream() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &valid_toml().replace("https://api.example.test", "ftp://api.example.test"),
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("proxy.upstream_url"), "got: {err}");
    }

    #[test]
    fn test_rejects_zero_refresh_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!("{}refresh_timeout_secs = 0\n", valid_toml()),
        );
        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains("session.refresh_timeout_secs"),
            "got: {err}"
        );
    }

    #[test]
    fn test_rejects_relative_login_route() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, &format!("{}login_route = \"login\"\n", valid_toml()));
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_credentials_path_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe { set_env("SESSION_CREDENTIALS_PATH", "/run/secrets/session.json") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("SESSION_CREDENTIALS_PATH") };

        assert_eq!(
            config.session.credentials_path,
            PathBuf::from("/run/secrets/session.json")
        );
    }

    #[test]
    fn test_refresh_url_resolution() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());
        let mut config = Config::load(&path).unwrap();

        assert_eq!(
            config.session.refresh_url("https://api.example.test/"),
            "https://api.example.test/api/auth/refresh-token"
        );

        config.session.refresh_endpoint = "https://auth.example.test/refresh".into();
        assert_eq!(
            config.session.refresh_url("https://api.example.test"),
            "https://auth.example.test/refresh"
        );
    }

    #[test]
    fn test_resolve_path_prefers_cli() {
        assert_eq!(
            Config::resolve_path(Some("/etc/session-proxy.toml")),
            PathBuf::from("/etc/session-proxy.toml")
        );
    }
}
