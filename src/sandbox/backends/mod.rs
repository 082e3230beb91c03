mod docker;

pub use docker::{DockerCli, DEFAULT_DOCKER_BINARY};
