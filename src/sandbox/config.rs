use std::collections::BTreeMap;

use crate::error::{BoxenvError, Result};
use crate::sandbox::mounts::{MountDescriptor, MountSpec};
use crate::sandbox::ports::{translate_port_requests, PortMap, PortRequest};

/// Immutable description of how a sandbox should be created.
///
/// Only obtainable through [`SandboxConfigBuilder::build`], which validates
/// every field up front.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    image: String,
    working_directory: String,
    timeout_seconds: u64,
    environment: BTreeMap<String, String>,
    port_requests: Vec<PortRequest>,
    mount_requests: Vec<MountSpec>,
}

impl SandboxConfig {
    pub fn builder(image: impl Into<String>) -> SandboxConfigBuilder {
        SandboxConfigBuilder {
            image: image.into(),
            working_directory: "/tmp".to_string(),
            timeout_seconds: 120,
            environment: BTreeMap::new(),
            port_requests: Vec::new(),
            mount_requests: Vec::new(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn working_directory(&self) -> &str {
        &self.working_directory
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn port_requests(&self) -> &[PortRequest] {
        &self.port_requests
    }

    pub fn mount_requests(&self) -> &[MountSpec] {
        &self.mount_requests
    }

    /// Port requests translated into the runtime's port map.
    pub fn ports(&self) -> PortMap {
        translate_port_requests(&self.port_requests)
    }

    pub fn mounts(&self) -> Vec<MountDescriptor> {
        self.mount_requests.iter().map(MountSpec::to_descriptor).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfigBuilder {
    image: String,
    working_directory: String,
    timeout_seconds: u64,
    environment: BTreeMap<String, String>,
    port_requests: Vec<PortRequest>,
    mount_requests: Vec<MountSpec>,
}

impl SandboxConfigBuilder {
    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = dir.into();
        self
    }

    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn port(mut self, request: PortRequest) -> Self {
        self.port_requests.push(request);
        self
    }

    pub fn ports(mut self, requests: impl IntoIterator<Item = PortRequest>) -> Self {
        self.port_requests.extend(requests);
        self
    }

    pub fn mount(mut self, spec: MountSpec) -> Self {
        self.mount_requests.push(spec);
        self
    }

    pub fn mounts(mut self, specs: impl IntoIterator<Item = MountSpec>) -> Self {
        self.mount_requests.extend(specs);
        self
    }

    pub fn build(self) -> Result<SandboxConfig> {
        if self.image.trim().is_empty() {
            return Err(BoxenvError::InvalidConfig(
                "image reference must not be empty".to_string(),
            ));
        }
        if self.working_directory.trim().is_empty() {
            return Err(BoxenvError::InvalidConfig(
                "working directory must not be empty".to_string(),
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(BoxenvError::InvalidConfig(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(key) = self.environment.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(BoxenvError::InvalidConfig(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        for mount in &self.mount_requests {
            mount.validate()?;
        }

        Ok(SandboxConfig {
            image: self.image,
            working_directory: self.working_directory,
            timeout_seconds: self.timeout_seconds,
            environment: self.environment,
            port_requests: self.port_requests,
            mount_requests: self.mount_requests,
        })
    }
}
