pub mod archive;
mod backends;
pub mod config;
pub mod environment;
mod factory;
pub mod mounts;
pub mod ports;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

use serde::Serialize;

pub use backends::{DockerCli, DEFAULT_DOCKER_BINARY};
pub use config::{SandboxConfig, SandboxConfigBuilder};
pub use environment::{EnvState, EnvironmentSettings, ExecutionEnvironment, Ownership};
pub use factory::create_runtime;
pub use traits::{
    ContainerDetails, ContainerSummary, CreateRequest, ExecOutput, ExecRequest, MountPoint,
    PublishedPort, RuntimeClient, SandboxIdentity,
};

/// Result of executing a command in the sandbox.
///
/// `output` holds stdout and stderr interleaved as the process wrote them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub output: String,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<ExecOutput> for ExecutionResult {
    fn from(output: ExecOutput) -> Self {
        Self {
            exit_code: output.exit_code,
            output: String::from_utf8_lossy(&output.output).into_owned(),
        }
    }
}
