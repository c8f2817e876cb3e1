//! ==============================================================================
//! config.rs - Hub Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `hub.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: where the snapshot api listens.
//!     - LoggingConfig: default log filter.
//!     - HistoryConfig: sparkline window length.
//!     - StreamsConfig: backoff floor/ceiling and read/connect timeouts.
//!     - pi-pulse / sen66 tables: the static device list, one entry per Pi.
//!
//! ==============================================================================

use crate::backoff::BackoffPolicy;
use crate::consumer::ConsumerSettings;
use crate::domain::{EndpointDescriptor, EndpointKind};
use crate::history::DEFAULT_CAPACITY;
use crate::sse::MAX_EVENT_BYTES;
use crate::supervisor::SupervisorSettings;

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "PULSE_HUB_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
    #[serde(rename = "pi-pulse", default)]
    pub pi_pulse: BTreeMap<String, PulseEntry>,
    #[serde(default)]
    pub sen66: BTreeMap<String, Sen66Entry>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8009".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: DEFAULT_CAPACITY }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamsConfig {
    pub initial_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    pub connect_timeout_seconds: u64,
    /// 0 disables the idle-read watchdog
    pub read_timeout_seconds: u64,
    /// largest accepted sse event; bigger ones drop the connection
    pub max_event_bytes: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            initial_backoff_seconds: 1,
            max_backoff_seconds: 30,
            connect_timeout_seconds: 10,
            read_timeout_seconds: 60,
            max_event_bytes: MAX_EVENT_BYTES,
            shutdown_grace_ms: 2000,
        }
    }
}

/// `[pi-pulse.<id>]`
#[derive(Debug, Deserialize, Clone)]
pub struct PulseEntry {
    pub stream: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// `[sen66.<id>]`
#[derive(Debug, Deserialize, Clone)]
pub struct Sen66Entry {
    pub stream: String,
    #[serde(rename = "nc-stream")]
    pub nc_stream: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl HubConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        Self::parse(&content)
    }

    /// Parse and validate a config document
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: HubConfig = toml::from_str(content).map_err(|e| anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.history.capacity == 0 {
            bail!("history.capacity must be greater than zero");
        }
        if self.streams.initial_backoff_seconds == 0 {
            bail!("streams.initial_backoff_seconds must be greater than zero");
        }
        if self.streams.max_backoff_seconds < self.streams.initial_backoff_seconds {
            bail!("streams.max_backoff_seconds must not be below initial_backoff_seconds");
        }
        if self.streams.max_event_bytes == 0 {
            bail!("streams.max_event_bytes must be greater than zero");
        }
        for d in self.descriptors() {
            reqwest::Url::parse(&d.url).with_context(|| format!("Invalid stream url for {}: {}", d.tag(), d.url))?;
        }
        Ok(())
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let mut paths = Vec::new();
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(path));
        }
        paths.push(PathBuf::from("config").join("hub.toml"));
        paths.push(PathBuf::from("..").join("config").join("hub.toml"));

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        tracing::info!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("[CONFIG] Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        tracing::warn!("[CONFIG] No config file found - using defaults");
        Self::default()
    }

    /// The static endpoint list, ordered by device then stream kind
    pub fn descriptors(&self) -> Vec<EndpointDescriptor> {
        let mut out = Vec::new();
        for (id, entry) in &self.pi_pulse {
            let label = entry.label.clone().unwrap_or_else(|| default_label(id, &entry.stream));
            out.push(EndpointDescriptor {
                device_id: id.clone(),
                label,
                kind: EndpointKind::SystemMetrics,
                url: entry.stream.clone(),
            });
        }
        for (id, entry) in &self.sen66 {
            // a pulse entry for the same device already named it
            let label = entry
                .label
                .clone()
                .or_else(|| self.pi_pulse.get(id).and_then(|p| p.label.clone()))
                .unwrap_or_else(|| default_label(id, &entry.stream));
            for (kind, url) in [
                (EndpointKind::SensorMain, &entry.stream),
                (EndpointKind::SensorNumberConcentration, &entry.nc_stream),
            ] {
                out.push(EndpointDescriptor {
                    device_id: id.clone(),
                    label: label.clone(),
                    kind,
                    url: url.clone(),
                });
            }
        }
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id).then(a.kind.cmp(&b.kind)));
        out
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let streams = &self.streams;
        SupervisorSettings {
            consumer: ConsumerSettings {
                backoff: BackoffPolicy {
                    initial: Duration::from_secs(streams.initial_backoff_seconds),
                    max: Duration::from_secs(streams.max_backoff_seconds),
                },
                read_timeout: match streams.read_timeout_seconds {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                max_event_bytes: streams.max_event_bytes,
            },
            shutdown_grace: Duration::from_millis(streams.shutdown_grace_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.streams.connect_timeout_seconds)
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!("┌─────────────────────────────────────────┐");
        tracing::info!("│            HUB CONFIGURATION            │");
        tracing::info!("├─────────────────────────────────────────┤");
        tracing::info!("│ Bind: {}", self.server.bind);
        tracing::info!("│ History: {} samples", self.history.capacity);
        tracing::info!(
            "│ Backoff: {}s .. {}s",
            self.streams.initial_backoff_seconds,
            self.streams.max_backoff_seconds
        );
        for d in self.descriptors() {
            tracing::info!("│ {:<12} {}", d.tag(), d.url);
        }
        tracing::info!("└─────────────────────────────────────────┘");
    }
}

/// "11 (192.168.121.11)" style label from the stream host
fn default_label(id: &str, url: &str) -> String {
    match reqwest::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) {
        Some(host) => format!("{} ({})", id, host),
        None => id.to_string(),
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        let pulse = |id: &str| PulseEntry {
            stream: format!("http://192.168.121.{}:8001/stream", id),
            label: None,
        };
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            history: HistoryConfig::default(),
            streams: StreamsConfig::default(),
            pi_pulse: BTreeMap::from([("10".to_string(), pulse("10")), ("11".to_string(), pulse("11"))]),
            sen66: BTreeMap::from([(
                "11".to_string(),
                Sen66Entry {
                    stream: "http://192.168.121.11:8002/stream".to_string(),
                    nc_stream: "http://192.168.121.11:8002/nc-stream".to_string(),
                    label: None,
                },
            )]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[server]
bind = "127.0.0.1:9000"

[streams]
max_backoff_seconds = 20
read_timeout_seconds = 0
max_event_bytes = 4096

[pi-pulse."12"]
stream = "http://example/pulse"

[sen66."12"]
stream = "http://example/sen66"
nc-stream = "http://example/sen66/nc"
label = "Lab Pi"
"#;

    #[test]
    fn loads_an_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = HubConfig::load(file.path()).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.pi_pulse["12"].stream, "http://example/pulse");
        assert_eq!(config.sen66["12"].nc_stream, "http://example/sen66/nc");
        assert_eq!(config.history.capacity, 60);
    }

    #[test]
    fn flattens_devices_into_descriptors() {
        let config = HubConfig::parse(SAMPLE).unwrap();
        let descriptors = config.descriptors();

        let kinds: Vec<EndpointKind> = descriptors.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EndpointKind::SystemMetrics,
                EndpointKind::SensorMain,
                EndpointKind::SensorNumberConcentration
            ]
        );
        assert!(descriptors.iter().all(|d| d.device_id == "12"));
        assert_eq!(descriptors[0].label, "12 (example)");
        assert_eq!(descriptors[2].label, "Lab Pi");
        assert_eq!(descriptors[2].url, "http://example/sen66/nc");
    }

    #[test]
    fn stream_settings_map_to_supervisor_settings() {
        let settings = HubConfig::parse(SAMPLE).unwrap().supervisor_settings();
        assert_eq!(settings.consumer.backoff.initial, Duration::from_secs(1));
        assert_eq!(settings.consumer.backoff.max, Duration::from_secs(20));
        assert_eq!(settings.consumer.read_timeout, None);
        assert_eq!(settings.consumer.max_event_bytes, 4096);
        assert_eq!(settings.shutdown_grace, Duration::from_millis(2000));
    }

    #[test]
    fn defaults_match_the_lab_deployment() {
        let config = HubConfig::default();
        let tags: Vec<String> = config.descriptors().iter().map(|d| d.tag()).collect();
        assert_eq!(tags, vec!["pulse-10", "pulse-11", "sen66-11", "sen66-nc-11"]);
        assert_eq!(config.descriptors()[1].label, "11 (192.168.121.11)");
    }

    #[test]
    fn rejects_zero_capacity_and_bad_urls() {
        assert!(HubConfig::parse("[history]\ncapacity = 0\n").is_err());
        assert!(HubConfig::parse("[pi-pulse.\"1\"]\nstream = \"not a url\"\n").is_err());
        assert!(HubConfig::parse("[streams]\ninitial_backoff_seconds = 5\nmax_backoff_seconds = 2\n").is_err());
        assert!(HubConfig::parse("[streams]\nmax_event_bytes = 0\n").is_err());
    }

    #[test]
    fn empty_document_is_valid() {
        let config = HubConfig::parse("").unwrap();
        assert!(config.descriptors().is_empty());
        assert_eq!(config.server.bind, "0.0.0.0:8009");
    }
}
