use std::sync::Arc;

use tracing::{debug, info};

use crate::config::types::RuntimeConfig;
use crate::error::{BoxenvError, Result};
use crate::sandbox::backends::DockerCli;
use crate::sandbox::traits::RuntimeClient;

/// Create the runtime client described by the configuration.
///
/// The daemon is pinged once so that an unreachable daemon is reported as
/// `Connectivity` before any sandbox work starts.
pub async fn create_runtime(config: &RuntimeConfig) -> Result<Arc<dyn RuntimeClient>> {
    if config.docker_binary.trim().is_empty() {
        return Err(BoxenvError::InvalidConfig(
            "runtime.docker_binary must not be empty".to_string(),
        ));
    }

    let runtime = DockerCli::new(&config.docker_binary);
    debug!(binary = %config.docker_binary, "Checking runtime connectivity");
    runtime.ping().await?;

    info!(runtime = runtime.name(), binary = %config.docker_binary, "Runtime ready");
    Ok(Arc::new(runtime))
}
