//! YAML-backed global configuration: the set of agents this instance
//! knows about, and their lifecycle policies.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    900
}

fn default_wake_timeout_secs() -> u64 {
    30
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_health_interval_secs() -> u64 {
    10
}

fn default_max_failures() -> u32 {
    3
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_max_ready() -> usize {
    0
}

fn default_true() -> bool {
    true
}

/// Lifecycle policy kind for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    OnDemand,
    AlwaysOn,
    Unmanaged,
}

impl Default for PolicyKind {
    fn default() -> Self {
        PolicyKind::OnDemand
    }
}

/// Static configuration for one backend agent, as loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub hostname: String,
    pub target: String,

    #[serde(default)]
    pub policy: PolicyKind,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_wake_timeout_secs")]
    pub wake_timeout_secs: u64,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,

    /// Container/service name the container driver acts on. Required for
    /// OnDemand and AlwaysOn; ignored for Unmanaged.
    #[serde(default)]
    pub container: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    /// 0 means unlimited; LRU eviction is disabled at that value.
    #[serde(default = "default_max_ready")]
    pub max_ready_on_demand: usize,

    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
            max_ready_on_demand: default_max_ready(),
            agents: Vec::new(),
        }
    }
}

impl GlobalConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: GlobalConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks beyond what serde enforces: unique names, unique
    /// hostnames, and a container name present wherever the policy needs one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut hostnames = HashSet::new();
        for agent in &self.agents {
            if !names.insert(agent.name.clone()) {
                return Err(ConfigError::Structural(format!(
                    "duplicate agent name: {}",
                    agent.name
                )));
            }
            if !hostnames.insert(agent.hostname.to_ascii_lowercase()) {
                return Err(ConfigError::Structural(format!(
                    "duplicate hostname: {}",
                    agent.hostname
                )));
            }
            if agent.policy != PolicyKind::Unmanaged && agent.container.is_none() {
                return Err(ConfigError::Structural(format!(
                    "agent {} uses a managed policy but has no container name",
                    agent.name
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentConfig> {
        self.agents.iter().filter(|a| a.enabled)
    }

    pub fn find(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.name == name)
    }
}

/// Watches a config file path for reload, re-parsing and re-validating on
/// demand (driven by SIGHUP in the `wakehostd` binary).
pub struct ConfigSource {
    path: PathBuf,
}

impl ConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<GlobalConfig, ConfigError> {
        GlobalConfig::load_from_file(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
listen_addr: "0.0.0.0:8080"
admin_addr: "127.0.0.1:9090"
max_ready_on_demand: 2
agents:
  - name: notebook
    hostname: notebook.example.com
    target: "127.0.0.1:9001"
    policy: on_demand
    container: notebook-ctr
  - name: dashboard
    hostname: dashboard.example.com
    target: "127.0.0.1:9002"
    policy: unmanaged
"#
    }

    #[test]
    fn parses_minimal_document() {
        let config: GlobalConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].policy, PolicyKind::OnDemand);
        assert_eq!(config.agents[0].idle_timeout_secs, 900);
        assert_eq!(config.agents[1].policy, PolicyKind::Unmanaged);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_hostnames() {
        let mut config: GlobalConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        config.agents[1].hostname = config.agents[0].hostname.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_managed_policy_without_container() {
        let mut config: GlobalConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        config.agents[0].container = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn enabled_agents_filters_disabled() {
        let mut config: GlobalConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        config.agents[1].enabled = false;
        let names: Vec<_> = config.enabled_agents().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["notebook"]);
    }
}
