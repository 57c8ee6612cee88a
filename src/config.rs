use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and forwarding settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Event watch resilience settings
    #[serde(default)]
    pub watch: WatchConfig,

    /// Docker daemon connection
    #[serde(default)]
    pub docker: DockerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Seconds to wait for in-flight requests on shutdown (default: 10)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}:{}': {}", self.bind, self.port, e))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            drain_timeout_secs: default_drain_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Seconds between full resyncs against the container list (default: 10)
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,

    /// Reconnect attempts after the event stream fails (default: 3)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay before the first reconnect in milliseconds, doubled per attempt (default: 1000)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

/// Upper bound for the reconnect backoff
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

impl WatchConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Backoff before reconnect attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay()
            .checked_mul(factor)
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DockerConfig {
    /// Docker host, e.g. "unix:///var/run/docker.sock" or "tcp://host:2375"
    /// (default: DOCKER_HOST, then common socket paths)
    pub host: Option<String>,
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_update_interval() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.watch.update_interval_secs == 0 {
            errors.push("watch.update_interval_secs must be greater than 0".to_string());
        }
        if let Err(e) = self.server.bind_addr() {
            errors.push(e.to_string());
        }
        if let Some(host) = &self.docker.host {
            if !(host.starts_with("unix://") || host.starts_with("tcp://") || host.starts_with("http://")) {
                errors.push(format!(
                    "docker.host '{}' must start with unix://, tcp:// or http://",
                    host
                ));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
