use std::{env, time::Duration};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::{json_paths::DEFAULT_MAX_DEPTH, live_channel::DEFAULT_RECONNECT_DELAY, paginate::DEFAULT_PAGE_SIZE};

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    match get_env(key) {
        None => default,
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
    }
}

fn get_env_u64(key: &str, default: u64) -> Result<u64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<u64>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_usize(key: &str, default: usize) -> Result<usize> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<usize>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Server
    pub dashboard_host: String,
    pub dashboard_port: u16,
    pub dashboard_open_browser: bool,

    // Storage
    pub sqlite_path: String,
    pub state_key: String,

    // Upstreams
    pub ws_url: String,
    /// Explicit proxy endpoint; `None` means this server's own `/api/proxy`.
    pub proxy_url: Option<String>,
    pub fetch_timeout_secs: u64,
    pub ws_reconnect_ms: u64,

    // Widgets
    pub sample_max_depth: usize,
    pub live_series_cap: usize,
    pub default_page_size: usize,
    pub polling_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dashboard_host: "127.0.0.1".into(),
            dashboard_port: 3000,
            dashboard_open_browser: false,
            sqlite_path: "./data/finboard.sqlite".into(),
            state_key: "finboard-storage".into(),
            ws_url: "ws://localhost:4001".into(),
            proxy_url: None,
            fetch_timeout_secs: 15,
            ws_reconnect_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            sample_max_depth: DEFAULT_MAX_DEPTH,
            live_series_cap: 200,
            default_page_size: DEFAULT_PAGE_SIZE,
            polling_enabled: true,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let d = Self::default();
        let port = get_env_u64("DASHBOARD_PORT", d.dashboard_port as u64)?;
        let dashboard_port =
            u16::try_from(port).map_err(|_| anyhow!("DASHBOARD_PORT out of range (got {port})"))?;

        let s = Self {
            dashboard_host: get_env_string("DASHBOARD_HOST", &d.dashboard_host),
            dashboard_port,
            dashboard_open_browser: get_env_bool("DASHBOARD_OPEN_BROWSER", d.dashboard_open_browser),
            sqlite_path: get_env_string("SQLITE_PATH", &d.sqlite_path),
            state_key: get_env_string("STATE_KEY", &d.state_key),
            ws_url: get_env_string("WS_URL", &d.ws_url),
            proxy_url: get_env("PROXY_URL"),
            fetch_timeout_secs: get_env_u64("FETCH_TIMEOUT_SECS", d.fetch_timeout_secs)?,
            ws_reconnect_ms: get_env_u64("WS_RECONNECT_MS", d.ws_reconnect_ms)?,
            sample_max_depth: get_env_usize("SAMPLE_MAX_DEPTH", d.sample_max_depth)?,
            live_series_cap: get_env_usize("LIVE_SERIES_CAP", d.live_series_cap)?,
            default_page_size: get_env_usize("DEFAULT_PAGE_SIZE", d.default_page_size)?,
            polling_enabled: get_env_bool("POLLING_ENABLED", d.polling_enabled),
        };

        s.validate()?;
        Ok(s)
    }

    /// Proxy used when a direct fetch fails.
    pub fn effective_proxy_url(&self) -> String {
        match &self.proxy_url {
            Some(url) => url.clone(),
            None => {
                let host = match self.dashboard_host.as_str() {
                    "0.0.0.0" | "::" => "127.0.0.1",
                    h => h,
                };
                format!("http://{}:{}/api/proxy", host, self.dashboard_port)
            }
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn ws_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.ws_reconnect_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dashboard_port == 0 {
            return Err(anyhow!("DASHBOARD_PORT must be >= 1"));
        }
        if self.sqlite_path.trim().is_empty() {
            return Err(anyhow!("SQLITE_PATH must not be empty"));
        }
        if self.state_key.trim().is_empty() {
            return Err(anyhow!("STATE_KEY must not be empty"));
        }
        if !(self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://")) {
            return Err(anyhow!("WS_URL must be ws:// or wss:// (got {})", self.ws_url));
        }
        if let Some(p) = &self.proxy_url {
            if !(p.starts_with("http://") || p.starts_with("https://")) {
                return Err(anyhow!("PROXY_URL must be http(s) (got {p})"));
            }
        }
        if self.fetch_timeout_secs < 1 {
            return Err(anyhow!(
                "FETCH_TIMEOUT_SECS must be >= 1 (got {})",
                self.fetch_timeout_secs
            ));
        }
        if self.ws_reconnect_ms < 1 {
            return Err(anyhow!("WS_RECONNECT_MS must be >= 1 (got {})", self.ws_reconnect_ms));
        }
        if self.live_series_cap < 1 {
            return Err(anyhow!("LIVE_SERIES_CAP must be >= 1 (got {})", self.live_series_cap));
        }
        if self.default_page_size < 1 {
            return Err(anyhow!(
                "DEFAULT_PAGE_SIZE must be >= 1 (got {})",
                self.default_page_size
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let s = Settings::default();
        assert!(s.validate().is_ok());
        assert_eq!(s.effective_proxy_url(), "http://127.0.0.1:3000/api/proxy");
        assert_eq!(s.ws_reconnect_delay(), Duration::from_millis(1500));
    }

    #[test]
    fn test_wildcard_host_proxies_via_loopback() {
        let s = Settings {
            dashboard_host: "0.0.0.0".into(),
            dashboard_port: 8080,
            ..Default::default()
        };
        assert_eq!(s.effective_proxy_url(), "http://127.0.0.1:8080/api/proxy");

        let s = Settings {
            proxy_url: Some("https://proxy.test/api/proxy".into()),
            ..Default::default()
        };
        assert_eq!(s.effective_proxy_url(), "https://proxy.test/api/proxy");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            Settings { ws_url: "http://x".into(), ..Default::default() },
            Settings { proxy_url: Some("ftp://x".into()), ..Default::default() },
            Settings { default_page_size: 0, ..Default::default() },
            Settings { live_series_cap: 0, ..Default::default() },
            Settings { fetch_timeout_secs: 0, ..Default::default() },
            Settings { state_key: " ".into(), ..Default::default() },
        ];
        for s in bad {
            assert!(s.validate().is_err(), "{s:?}");
        }
    }
}
