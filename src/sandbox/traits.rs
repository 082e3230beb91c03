use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::sandbox::archive::{ArchiveStat, ArchiveStream};
use crate::sandbox::mounts::MountDescriptor;
use crate::sandbox::ports::PortMap;

/// Length of the abbreviated identity shown by container tooling.
const SHORT_ID_LEN: usize = 12;

/// Opaque identifier assigned by the runtime when a sandbox is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SandboxIdentity(String);

impl SandboxIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The abbreviated form accepted by container tooling.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(SHORT_ID_LEN) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for SandboxIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SandboxIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SandboxIdentity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for SandboxIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Everything the runtime needs to create a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub ports: PortMap,
    pub mounts: Vec<MountDescriptor>,
    pub working_dir: String,
    pub detach: bool,
    pub tty: bool,
    /// Remove the sandbox once it stops.
    pub auto_remove: bool,
}

/// A process to run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }
}

/// Exit code and interleaved stdout+stderr of an exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedPort {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPoint {
    pub kind: String,
    pub name: Option<String>,
    pub source: String,
    pub destination: String,
    pub mode: String,
    pub read_write: bool,
}

/// Live state of a sandbox as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerDetails {
    pub id: SandboxIdentity,
    pub name: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub image: String,
    pub working_dir: String,
    pub env: Vec<String>,
    /// Container port to the host bindings actually materialized.
    pub ports: BTreeMap<String, Vec<PublishedPort>>,
    pub mounts: Vec<MountPoint>,
}

impl ContainerDetails {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub id: SandboxIdentity,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Seam to the container runtime daemon.
///
/// Every call is a blocking round trip from the caller's point of view.
/// Implementations map daemon failures onto the crate's error taxonomy:
/// unreachable daemon is `Connectivity`, unknown sandbox is `SandboxNotFound`,
/// a missing path in `get_archive`/`put_archive` is `PathNotFound`.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Returns the runtime name (e.g., "docker")
    fn name(&self) -> &str;

    /// Check that the daemon is reachable.
    async fn ping(&self) -> Result<()>;

    async fn create(&self, request: &CreateRequest) -> Result<SandboxIdentity>;

    async fn start(&self, id: &SandboxIdentity) -> Result<()>;

    /// Stop, waiting up to `grace` before the runtime forces termination.
    async fn stop(&self, id: &SandboxIdentity, grace: Duration) -> Result<()>;

    async fn restart(&self, id: &SandboxIdentity, grace: Duration) -> Result<()>;

    async fn remove(&self, id: &SandboxIdentity, force: bool) -> Result<()>;

    async fn inspect(&self, id: &SandboxIdentity) -> Result<ContainerDetails>;

    async fn exec(&self, id: &SandboxIdentity, request: &ExecRequest) -> Result<ExecOutput>;

    /// Fetch `path` as an archive whose root entry is the path itself.
    async fn get_archive(
        &self,
        id: &SandboxIdentity,
        path: &str,
    ) -> Result<(ArchiveStream, ArchiveStat)>;

    /// Extract `archive` into the existing directory `target_dir`.
    async fn put_archive(
        &self,
        id: &SandboxIdentity,
        target_dir: &str,
        archive: Vec<u8>,
    ) -> Result<bool>;

    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>>;
}
