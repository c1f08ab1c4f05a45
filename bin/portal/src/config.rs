//! Portal configuration: `config.yaml`, then `VEILNET_*` environment and
//! command-line overrides on top of built-in defaults.

use crate::cli::Cli;
use portal_observability::{FileLoggingConfig, LogFormat, LogLevel, LoggingConfig};
use portal_relay::{
    AnchorParams, ForwardingPolicy, PortalSettings, StartParams, DEFAULT_BYPASS_HOSTS,
    DEFAULT_INTERFACE_NAME, DEFAULT_MTU, DEFAULT_PEER_HISTORY,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory
pub(crate) const DEFAULT_CONFIG_FILE: &str = "config.yaml";

const DEFAULT_GUARDIAN_URL: &str = "https://guardian.veilnet.org";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct PortalConfig {
    pub(crate) guardian_url: String,
    pub(crate) anchor_token: String,
    pub(crate) anchor_name: String,
    pub(crate) domain_name: String,
    pub(crate) region: String,
    pub(crate) public: bool,

    /// Overlay address handed out by the in-process anchor
    pub(crate) anchor_cidr: String,
    /// Outbound frames the in-process anchor keeps in memory; 0 keeps none
    pub(crate) anchor_history: usize,

    pub(crate) host_interface: String,
    pub(crate) interface_name: String,
    pub(crate) mtu: usize,
    pub(crate) status_bind: SocketAddr,
    pub(crate) shutdown_timeout_secs: u64,
    pub(crate) bypass_hosts: Vec<String>,
    pub(crate) forwarding: ForwardingSection,
    pub(crate) logging: LoggingSection,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            guardian_url: DEFAULT_GUARDIAN_URL.to_string(),
            anchor_token: String::new(),
            anchor_name: String::new(),
            domain_name: String::new(),
            region: String::new(),
            public: true,
            anchor_cidr: "10.128.0.1/16".to_string(),
            anchor_history: DEFAULT_PEER_HISTORY,
            host_interface: "eth0".to_string(),
            interface_name: DEFAULT_INTERFACE_NAME.to_string(),
            mtu: DEFAULT_MTU,
            status_bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
            shutdown_timeout_secs: 10,
            bypass_hosts: DEFAULT_BYPASS_HOSTS.iter().map(|h| h.to_string()).collect(),
            forwarding: ForwardingSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

/// Forwarding retry policy, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ForwardingSection {
    pub(crate) max_consecutive_failures: u32,
    pub(crate) initial_backoff_ms: u64,
    pub(crate) max_backoff_ms: u64,
}

impl Default for ForwardingSection {
    fn default() -> Self {
        let policy = ForwardingPolicy::default();
        Self {
            max_consecutive_failures: policy.max_consecutive_failures,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

/// Logging options; unset fields fall back to CLI verbosity and terminal detection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct LoggingSection {
    pub(crate) level: Option<LogLevel>,
    pub(crate) format: Option<LogFormat>,
    pub(crate) filter_directives: Option<String>,
    pub(crate) file: Option<FileLoggingConfig>,
}

/// Where the configuration came from
#[derive(Debug)]
pub(crate) enum ConfigSource {
    File(PathBuf),
    NotFound(PathBuf),
    /// The file exists but could not be read or parsed; defaults were used
    Invalid(PathBuf, String),
}

/// Read the config file at `path`, or `config.yaml` in the working directory.
///
/// A missing or malformed file yields the defaults; the returned source says
/// which case applied so it can be logged once logging is up.
pub(crate) fn load(path: Option<&Path>) -> (PortalConfig, ConfigSource) {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return (PortalConfig::default(), ConfigSource::NotFound(path));
        }
        Err(e) => {
            let reason = e.to_string();
            return (PortalConfig::default(), ConfigSource::Invalid(path, reason));
        }
    };

    match parse(&contents) {
        Ok(config) => (config, ConfigSource::File(path)),
        Err(e) => (PortalConfig::default(), ConfigSource::Invalid(path, e.to_string())),
    }
}

pub(crate) fn parse(yaml: &str) -> Result<PortalConfig, serde_yaml::Error> {
    if yaml.trim().is_empty() {
        return Ok(PortalConfig::default());
    }
    serde_yaml::from_str(yaml)
}

impl PortalConfig {
    /// Apply command-line and `VEILNET_*` environment overrides
    pub(crate) fn apply_overrides(&mut self, cli: &Cli) {
        let strings = [
            (&cli.guardian_url, &mut self.guardian_url),
            (&cli.anchor_token, &mut self.anchor_token),
            (&cli.anchor_name, &mut self.anchor_name),
            (&cli.domain_name, &mut self.domain_name),
            (&cli.region, &mut self.region),
            (&cli.host_interface, &mut self.host_interface),
        ];
        for (value, target) in strings {
            if let Some(value) = value {
                *target = value.clone();
            }
        }

        if let Some(public) = cli.public {
            self.public = public;
        }
        if let Some(bind) = cli.status_bind {
            self.status_bind = bind;
        }
    }

    pub(crate) fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub(crate) fn logging_config(&self, verbosity: u8) -> LoggingConfig {
        let level = if verbosity > 0 {
            LogLevel::from_verbosity(verbosity)
        } else {
            self.logging.level.unwrap_or_default()
        };

        LoggingConfig {
            level,
            format: self.logging.format.unwrap_or_else(LogFormat::detect),
            filter_directives: self.logging.filter_directives.clone(),
            file: self.logging.file.clone(),
            ..Default::default()
        }
    }

    pub(crate) fn settings(&self, template_dir: Option<PathBuf>) -> PortalSettings {
        PortalSettings {
            interface_name: self.interface_name.clone(),
            mtu: self.mtu,
            status_bind: self.status_bind,
            bypass_hosts: self.bypass_hosts.clone(),
            forwarding: ForwardingPolicy {
                max_consecutive_failures: self.forwarding.max_consecutive_failures.max(1),
                initial_backoff: Duration::from_millis(self.forwarding.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.forwarding.max_backoff_ms),
            },
            template_dir,
        }
    }

    pub(crate) fn start_params(&self) -> StartParams {
        StartParams {
            anchor: AnchorParams {
                endpoint: self.guardian_url.clone(),
                token: self.anchor_token.clone(),
                name: self.anchor_name.clone(),
                domain: self.domain_name.clone(),
                region: self.region.clone(),
            },
            host_interface: self.host_interface.clone(),
            public: self.public,
        }
    }
}
