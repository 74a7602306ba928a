//! Configuration for the VRN agent.
//!
//! A TOML file and `VRN_`-prefixed environment variables merged over
//! built-in defaults, validated, then translated into the
//! `vrn_core::AgentConfig` the core runs with. The core never reads
//! files itself.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vrn_core::{AgentConfig, EntityId, MAX_TIMER, StoreSettings, SwitchSettings};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub switch: SwitchSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSection {
    /// Identity of this physical host. Required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<EntityId>,

    /// Seconds a lost store session may stay unresolved.
    pub disconnected_grace_secs: u64,

    pub enable_dynamic_routing: bool,

    /// Port-status external id carrying the virtual port id.
    pub external_id_key: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            host_id: None,
            disconnected_grace_secs: 30,
            enable_dynamic_routing: true,
            external_id_key: "vrn-port-id".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSection {
    /// Comma-separated `host:port` list.
    pub hosts: String,
    pub session_timeout_ms: u64,
    pub root_path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            hosts: "127.0.0.1:2181".into(),
            session_timeout_ms: 30_000,
            root_path: "/vrn".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SwitchSection {
    pub listen_addr: SocketAddr,
    pub flow_idle_timeout_secs: u64,
    pub mac_idle_timeout_secs: u64,
    pub arp_timeout_ms: u64,
    pub arp_entry_ttl_secs: u64,
    pub max_pending_per_target: usize,
}

impl Default for SwitchSection {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 6633)),
            flow_idle_timeout_secs: 60,
            mac_idle_timeout_secs: 60,
            arp_timeout_ms: 5000,
            arp_entry_ttl_secs: 300,
            max_pending_per_target: 32,
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "vrn", "vrn-agent").map_or_else(
        || PathBuf::from("/etc/vrn/agent.toml"),
        |dirs| dirs.config_dir().join("agent.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Defaults, then the TOML file at `path`, then `VRN_SECTION__KEY`
/// environment variables. A missing file contributes nothing.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("VRN_").split("__"))
}

/// Load and validate the configuration. `path` overrides the default
/// location.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let config: Config = figment(&path).extract()?;
    config.validate()?;
    Ok(config)
}

// ── Validation and translation ──────────────────────────────────────

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.host_id.is_none() {
            return Err(invalid("agent.host_id", "must be set to this host's UUID"));
        }
        if self.agent.external_id_key.is_empty() {
            return Err(invalid("agent.external_id_key", "must not be empty"));
        }
        if !self.store.root_path.starts_with('/') {
            return Err(invalid(
                "store.root_path",
                format!("expected an absolute path, got '{}'", self.store.root_path),
            ));
        }
        if self.store.hosts.trim().is_empty() {
            return Err(invalid("store.hosts", "must list at least one server"));
        }

        let secs: fn(u64) -> Duration = Duration::from_secs;
        let millis: fn(u64) -> Duration = Duration::from_millis;
        for (field, value, duration) in [
            ("agent.disconnected_grace_secs", self.agent.disconnected_grace_secs, secs),
            ("store.session_timeout_ms", self.store.session_timeout_ms, millis),
            ("switch.flow_idle_timeout_secs", self.switch.flow_idle_timeout_secs, secs),
            ("switch.mac_idle_timeout_secs", self.switch.mac_idle_timeout_secs, secs),
            ("switch.arp_timeout_ms", self.switch.arp_timeout_ms, millis),
            ("switch.arp_entry_ttl_secs", self.switch.arp_entry_ttl_secs, secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
            if duration(value) > MAX_TIMER {
                return Err(invalid(
                    field,
                    format!("at most {}", humantime::format_duration(MAX_TIMER)),
                ));
            }
        }
        if self.switch.flow_idle_timeout_secs > u64::from(u16::MAX) {
            return Err(invalid(
                "switch.flow_idle_timeout_secs",
                format!("at most {} seconds", u16::MAX),
            ));
        }
        if self.switch.max_pending_per_target == 0 {
            return Err(invalid("switch.max_pending_per_target", "must be at least 1"));
        }
        Ok(())
    }

    /// Validate and build the runtime configuration.
    pub fn into_agent_config(self) -> Result<AgentConfig, ConfigError> {
        self.validate()?;
        let host_id = self
            .agent
            .host_id
            .ok_or_else(|| invalid("agent.host_id", "must be set to this host's UUID"))?;

        Ok(AgentConfig {
            host_id,
            disconnected_grace: Duration::from_secs(self.agent.disconnected_grace_secs),
            enable_dynamic_routing: self.agent.enable_dynamic_routing,
            external_id_key: self.agent.external_id_key,
            store: StoreSettings {
                hosts: self.store.hosts,
                session_timeout: Duration::from_millis(self.store.session_timeout_ms),
                root_path: self.store.root_path,
            },
            switch: SwitchSettings {
                listen_addr: self.switch.listen_addr,
                flow_idle_timeout: Duration::from_secs(self.switch.flow_idle_timeout_secs),
                mac_idle_timeout: Duration::from_secs(self.switch.mac_idle_timeout_secs),
                arp_timeout: Duration::from_millis(self.switch.arp_timeout_ms),
                arp_entry_ttl: Duration::from_secs(self.switch.arp_entry_ttl_secs),
                max_pending_per_target: self.switch.max_pending_per_target,
            },
        })
    }

    /// The configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    const HOST: &str = "6f1c2b3a-0000-4000-8000-000000000001";

    fn write(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    fn with_host() -> Config {
        let mut config = Config::default();
        config.agent.host_id = Some(HOST.parse().unwrap());
        config
    }

    #[test]
    fn test_file_overrides_defaults() {
        let file = write(&format!(
            "[agent]\nhost_id = \"{HOST}\"\ndisconnected_grace_secs = 5\n\n\
             [switch]\nlisten_addr = \"127.0.0.1:7000\"\narp_timeout_ms = 250\n"
        ));

        let config = load_config(Some(file.path())).unwrap();

        assert_eq!(config.agent.disconnected_grace_secs, 5);
        assert_eq!(config.switch.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.switch.arp_timeout_ms, 250);
        // Untouched keys keep their defaults.
        assert_eq!(config.store, StoreSection::default());
        assert_eq!(config.switch.max_pending_per_target, 32);
    }

    #[test]
    fn test_missing_host_id_is_rejected() {
        let file = write("[store]\nroot_path = \"/vrn\"\n");
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "agent.host_id"));
    }

    #[test]
    fn test_malformed_host_id_is_a_load_error() {
        let file = write("[agent]\nhost_id = \"host-one\"\n");
        assert!(matches!(
            load_config(Some(file.path())),
            Err(ConfigError::Figment(_))
        ));
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let mut config = with_host();
        config.switch.arp_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "switch.arp_timeout_ms"));

        let mut config = with_host();
        config.agent.disconnected_grace_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_are_rejected() {
        let cases: [(&str, fn(&mut Config)); 5] = [
            ("switch.arp_entry_ttl_secs", |c| c.switch.arp_entry_ttl_secs = u64::MAX),
            ("switch.arp_timeout_ms", |c| c.switch.arp_timeout_ms = u64::MAX),
            ("switch.mac_idle_timeout_secs", |c| c.switch.mac_idle_timeout_secs = u64::MAX),
            ("agent.disconnected_grace_secs", |c| c.agent.disconnected_grace_secs = u64::MAX),
            ("store.session_timeout_ms", |c| c.store.session_timeout_ms = u64::MAX),
        ];
        for (field, set) in cases {
            let mut config = with_host();
            set(&mut config);
            let err = config.validate().unwrap_err();
            assert!(
                matches!(err, ConfigError::Validation { field: ref f, .. } if f == field),
                "{field}: {err}"
            );
        }
    }

    #[test]
    fn test_two_year_timer_is_accepted() {
        let mut config = with_host();
        config.switch.arp_entry_ttl_secs = MAX_TIMER.as_secs();
        config.switch.arp_timeout_ms = u64::try_from(MAX_TIMER.as_millis()).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relative_root_path_is_rejected() {
        let mut config = with_host();
        config.store.root_path = "vrn".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_agent_config_carries_every_setting() {
        let mut config = with_host();
        config.agent.enable_dynamic_routing = false;
        config.switch.arp_timeout_ms = 1500;

        let agent = config.into_agent_config().unwrap();

        assert_eq!(agent.host_id, HOST.parse().unwrap());
        assert_eq!(agent.disconnected_grace, Duration::from_secs(30));
        assert!(!agent.enable_dynamic_routing);
        assert_eq!(agent.store.session_timeout, Duration::from_secs(30));
        assert_eq!(agent.switch.arp_timeout, Duration::from_millis(1500));
        assert_eq!(agent.switch, SwitchSettings {
            arp_timeout: Duration::from_millis(1500),
            ..SwitchSettings::default()
        });
    }

    #[test]
    fn test_rendered_toml_loads_back() {
        let config = with_host();
        let file = write(&config.to_toml().unwrap());
        assert_eq!(load_config(Some(file.path())).unwrap(), config);
    }
}
