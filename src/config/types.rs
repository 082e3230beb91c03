use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::sandbox::mounts::MountSpec;
use crate::sandbox::ports::PortRequest;
use crate::sandbox::{SandboxConfig, DEFAULT_DOCKER_BINARY};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxenvConfig {
    pub sandbox: SandboxDefaults,
    pub runtime: RuntimeConfig,
    pub transfer: TransferConfig,
}

/// Defaults for sandboxes spawned by `boxenv exec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxDefaults {
    /// Container image
    pub image: String,
    /// Working directory inside the sandbox
    pub working_directory: String,
    /// Command timeout in seconds
    pub timeout_seconds: u64,
    /// Prefix of generated sandbox names
    pub name_prefix: String,
    /// Environment variables set at creation
    pub environment: BTreeMap<String, String>,
    /// Ports to publish
    pub ports: Vec<PortRequest>,
    /// Bind, volume and tmpfs mounts
    pub mounts: Vec<MountSpec>,
}

impl Default for SandboxDefaults {
    fn default() -> Self {
        Self {
            image: "python:3.13".to_string(),
            working_directory: "/tmp".to_string(),
            timeout_seconds: 120,
            name_prefix: "boxenv".to_string(),
            environment: BTreeMap::new(),
            ports: Vec::new(),
            mounts: Vec::new(),
        }
    }
}

/// Per-invocation additions on top of [`SandboxDefaults`].
#[derive(Debug, Clone, Default)]
pub struct SandboxOverrides {
    pub image: Option<String>,
    pub working_directory: Option<String>,
    pub env_vars: Vec<(String, String)>,
    pub ports: Vec<PortRequest>,
    pub mounts: Vec<MountSpec>,
}

impl SandboxDefaults {
    /// Build a validated sandbox config, applying `overrides` on top of the defaults.
    pub fn to_sandbox_config(&self, overrides: SandboxOverrides) -> Result<SandboxConfig> {
        SandboxConfig::builder(overrides.image.unwrap_or_else(|| self.image.clone()))
            .working_directory(
                overrides
                    .working_directory
                    .unwrap_or_else(|| self.working_directory.clone()),
            )
            .timeout_seconds(self.timeout_seconds)
            .envs(self.environment.clone())
            .envs(overrides.env_vars)
            .ports(self.ports.iter().cloned().chain(overrides.ports))
            .mounts(self.mounts.iter().cloned().chain(overrides.mounts))
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker CLI binary (name on PATH or absolute path)
    pub docker_binary: String,
    /// Seconds the daemon waits before killing a stopping sandbox
    pub stop_grace_seconds: u64,
    /// Shell used to run commands
    pub shell: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_binary: DEFAULT_DOCKER_BINARY.to_string(),
            stop_grace_seconds: 10,
            shell: "bash".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Sandbox directory where uploads are staged before being renamed
    pub staging_dir: String,
    /// Sandbox file that recorded commands are appended to
    pub history_file: String,
    /// Local directory for `boxenv download`
    pub download_dir: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            staging_dir: "/tmp".to_string(),
            history_file: "/home/.bash_history".to_string(),
            download_dir: "data".to_string(),
        }
    }
}
