//! Agent configuration

use anyhow::{Context, Result};
use pinning_lib::cpumanager::CpuPolicyKind;
use pinning_lib::topologymanager::{PolicyKind, Scope};
use pinning_lib::NodeResourceConfig;
use serde::Deserialize;
use std::path::PathBuf;

/// Names an optional config file layered below the environment.
const CONFIG_FILE_ENV: &str = "AGENT_CONFIG_FILE";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port for the admission, health and metrics API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_cpu_policy")]
    pub cpu_policy: CpuPolicyKind,

    /// CPUs kept out of exclusive assignment
    #[serde(default = "default_reserved_cpus")]
    pub reserved_cpus: usize,

    #[serde(default = "default_topology_policy")]
    pub topology_policy: PolicyKind,

    #[serde(default = "default_topology_scope")]
    pub topology_scope: Scope,

    /// Directory holding the checkpoints
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_cpu_policy() -> CpuPolicyKind {
    CpuPolicyKind::Static
}

fn default_reserved_cpus() -> usize {
    1
}

fn default_topology_policy() -> PolicyKind {
    PolicyKind::BestEffort
}

fn default_topology_scope() -> Scope {
    Scope::Container
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/pinning-agent")
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

impl AgentConfig {
    /// Load configuration from the optional config file and the environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("AGENT").try_parsing(true))
            .build()
            .context("Failed to read agent configuration")?;

        Self::from_config(config)
    }

    fn from_config(config: config::Config) -> Result<Self> {
        config
            .try_deserialize()
            .context("Invalid agent configuration")
    }

    pub fn node_resources(&self) -> NodeResourceConfig {
        NodeResourceConfig {
            node_name: self.node_name.clone(),
            cpu_policy: self.cpu_policy,
            reserved_cpus: self.reserved_cpus,
            topology_policy: self.topology_policy,
            scope: self.topology_scope,
        }
    }
}
