//! Execution environment over a single sandbox.
//!
//! An environment is obtained in one of two ways:
//! - [`ExecutionEnvironment::spawn`] creates and starts a fresh sandbox and owns it.
//!   Releasing an owning environment stops the sandbox.
//! - [`ExecutionEnvironment::attach`] binds to a sandbox that is already running.
//!   It never creates, starts or stops anything.
//!
//! Everything else (exec, file transfer) behaves the same for both.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::types::BoxenvConfig;
use crate::error::{BoxenvError, Result};
use crate::sandbox::archive::{self, ArchiveStat, ArchiveStream};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::traits::{
    ContainerDetails, CreateRequest, ExecRequest, PublishedPort, RuntimeClient, SandboxIdentity,
};
use crate::sandbox::ExecutionResult;

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_STAGING_DIR: &str = "/tmp";
pub const DEFAULT_HISTORY_FILE: &str = "/home/.bash_history";
pub const DEFAULT_SHELL: &str = "bash";
pub const DEFAULT_NAME_PREFIX: &str = "boxenv";

/// Knobs that are not part of the sandbox itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSettings {
    /// How long the runtime waits before forcing termination on stop
    pub stop_grace: Duration,
    /// Directory inside the sandbox where uploads are staged before the rename
    pub staging_dir: String,
    /// History file that `record_command` appends to
    pub history_file: String,
    /// Shell used as `<shell> -lc <command>`
    pub shell: String,
    /// Prefix of generated sandbox names
    pub name_prefix: String,
    /// Per-command limit; `spawn` sets it from the sandbox config
    pub exec_timeout: Option<Duration>,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            stop_grace: DEFAULT_STOP_GRACE,
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
            history_file: DEFAULT_HISTORY_FILE.to_string(),
            shell: DEFAULT_SHELL.to_string(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            exec_timeout: None,
        }
    }
}

impl From<&BoxenvConfig> for EnvironmentSettings {
    fn from(config: &BoxenvConfig) -> Self {
        Self {
            stop_grace: Duration::from_secs(config.runtime.stop_grace_seconds),
            staging_dir: config.transfer.staging_dir.clone(),
            history_file: config.transfer.history_file.clone(),
            shell: config.runtime.shell.clone(),
            name_prefix: config.sandbox.name_prefix.clone(),
            exec_timeout: Some(Duration::from_secs(config.sandbox.timeout_seconds)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Spawned the sandbox and is responsible for stopping it
    Owner,
    /// Bound to a sandbox created elsewhere
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvState {
    Created,
    Running,
    Released,
}

pub struct ExecutionEnvironment {
    runtime: Arc<dyn RuntimeClient>,
    identity: SandboxIdentity,
    name: String,
    ownership: Ownership,
    state: EnvState,
    details: Option<ContainerDetails>,
    settings: EnvironmentSettings,
    /// Variables passed to every exec after `update_environment`
    env_overlay: BTreeMap<String, String>,
}

impl ExecutionEnvironment {
    /// Create and start a fresh sandbox owned by the returned environment.
    pub async fn spawn(
        runtime: Arc<dyn RuntimeClient>,
        config: &SandboxConfig,
        mut settings: EnvironmentSettings,
    ) -> Result<Self> {
        let name = generate_sandbox_name(&settings.name_prefix);
        settings.exec_timeout = Some(Duration::from_secs(config.timeout_seconds()));

        let request = CreateRequest {
            name: name.clone(),
            image: config.image().to_string(),
            env: config.environment().clone(),
            ports: config.ports(),
            mounts: config.mounts(),
            working_dir: config.working_directory().to_string(),
            detach: true,
            tty: true,
            auto_remove: true,
        };

        info!(
            name = %name,
            image = %request.image,
            runtime = runtime.name(),
            "Spawning sandbox"
        );

        let identity = runtime.create(&request).await.map_err(provisioning)?;

        let mut env = Self {
            runtime,
            identity,
            name,
            ownership: Ownership::Owner,
            state: EnvState::Created,
            details: None,
            settings,
            env_overlay: BTreeMap::new(),
        };

        if let Err(e) = env.runtime.start(&env.identity).await {
            env.release().await;
            return Err(provisioning(e));
        }
        env.state = EnvState::Running;

        // Host port bindings only exist once the sandbox has started
        match env.runtime.inspect(&env.identity).await {
            Ok(details) => env.details = Some(details),
            Err(e) => {
                env.release().await;
                return Err(provisioning(e));
            }
        }

        info!(id = %env.identity.short(), name = %env.name, "Sandbox running");
        Ok(env)
    }

    /// Bind to an already-running sandbox without taking ownership.
    pub async fn attach(
        runtime: Arc<dyn RuntimeClient>,
        identity: impl Into<SandboxIdentity>,
        settings: EnvironmentSettings,
    ) -> Result<Self> {
        let requested = identity.into();
        let details = runtime.inspect(&requested).await?;

        if !details.is_running() {
            return Err(BoxenvError::NotRunning {
                id: requested.to_string(),
                status: details.status,
            });
        }

        info!(id = %details.id.short(), name = %details.name, "Attached to existing sandbox");

        Ok(Self {
            runtime,
            identity: details.id.clone(),
            name: details.name.clone(),
            ownership: Ownership::Attached,
            state: EnvState::Running,
            details: Some(details),
            settings,
            env_overlay: BTreeMap::new(),
        })
    }

    pub fn identity(&self) -> &SandboxIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_owner(&self) -> bool {
        self.ownership == Ownership::Owner
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    pub fn settings(&self) -> &EnvironmentSettings {
        &self.settings
    }

    pub fn details(&self) -> Option<&ContainerDetails> {
        self.details.as_ref()
    }

    /// Host bindings resolved by the runtime, keyed by container port.
    pub fn port_bindings(&self) -> BTreeMap<String, Vec<PublishedPort>> {
        self.details
            .as_ref()
            .map(|d| d.ports.clone())
            .unwrap_or_default()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state {
            EnvState::Running => Ok(()),
            _ => Err(BoxenvError::EnvironmentReleased {
                id: self.identity.to_string(),
            }),
        }
    }

    /// Run `command` through a login shell and capture combined output.
    pub async fn execute(&self, command: &str) -> Result<ExecutionResult> {
        self.ensure_running()?;
        debug!(id = %self.identity.short(), command = %command, "Executing command in sandbox");

        let mut request = ExecRequest::new([self.settings.shell.as_str(), "-lc", command]);
        request.env = self.env_overlay.clone();

        let exec = self.runtime.exec(&self.identity, &request);
        let output = match self.settings.exec_timeout {
            Some(limit) => tokio::time::timeout(limit, exec)
                .await
                .map_err(|_| BoxenvError::Timeout {
                    seconds: limit.as_secs(),
                })??,
            None => exec.await?,
        };

        Ok(ExecutionResult::from(output))
    }

    /// Set variables for every later `execute` call on this environment.
    pub async fn update_environment<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.ensure_running()?;

        for (key, value) in vars {
            let key = key.into();
            if key.is_empty() || key.contains('=') {
                return Err(BoxenvError::InvalidConfig(format!(
                    "invalid environment variable name '{}'",
                    key
                )));
            }
            self.env_overlay.insert(key, value.into());
        }

        debug!(id = %self.identity.short(), count = self.env_overlay.len(), "Updated environment overlay");
        Ok(())
    }

    /// Append the literal command text to the sandbox's history file.
    pub async fn record_command(&self, command: &str) -> Result<()> {
        let history = &self.settings.history_file;
        let script = format!(
            "printf '%s\\n' {} >> {}",
            shell_quote(command),
            shell_quote(history)
        );

        let result = self
            .execute(&script)
            .await
            .map_err(|e| transfer_error(e, |reason| write_error(history, reason)))?;

        if !result.success() {
            return Err(write_error(history, result.output.trim()));
        }
        Ok(())
    }

    /// Write `content` to `path` inside the sandbox.
    ///
    /// The archive put can only target a directory, so the content is staged
    /// under a unique name in the staging directory and then renamed.
    pub async fn write_file(&self, path: &str, content: impl AsRef<[u8]>) -> Result<()> {
        self.ensure_running()?;

        let staged_name = format!(".{}-{}.tmp", self.settings.name_prefix, unique_suffix());
        let staging_dir = self.settings.staging_dir.trim_end_matches('/');
        let staged_path = format!("{}/{}", staging_dir, staged_name);

        let archive = archive::encode_file(&staged_name, content.as_ref())
            .map_err(|e| write_error(path, e))?;

        let accepted = self
            .runtime
            .put_archive(&self.identity, &self.settings.staging_dir, archive)
            .await
            .map_err(|e| transfer_error(e, |reason| write_error(path, reason)))?;
        if !accepted {
            return Err(write_error(path, "runtime rejected the archive"));
        }

        let result = self
            .execute(&format!(
                "mv -f -- {} {}",
                shell_quote(&staged_path),
                shell_quote(path)
            ))
            .await
            .map_err(|e| transfer_error(e, |reason| write_error(path, reason)))?;

        if !result.success() {
            if let Err(e) = self
                .execute(&format!("rm -f -- {}", shell_quote(&staged_path)))
                .await
            {
                warn!(staged = %staged_path, error = %e, "Failed to remove staged file");
            }
            return Err(write_error(path, result.output.trim()));
        }

        debug!(id = %self.identity.short(), path = %path, "File written");
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let result = self
            .execute(&format!("cat -- {}", shell_quote(path)))
            .await
            .map_err(|e| transfer_error(e, |reason| read_error(path, reason)))?;

        if !result.success() {
            return Err(read_error(path, result.output.trim()));
        }
        Ok(result.output)
    }

    /// Raw `ls -la` output for `path`.
    pub async fn list_directory(&self, path: &str) -> Result<String> {
        let result = self
            .execute(&format!("ls -la -- {}", shell_quote(path)))
            .await
            .map_err(|e| transfer_error(e, |reason| read_error(path, reason)))?;

        if !result.success() {
            return Err(read_error(path, result.output.trim()));
        }
        Ok(result.output)
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let result = self
            .execute(&format!("test -e {}", shell_quote(path)))
            .await?;
        Ok(result.success())
    }

    pub async fn is_directory(&self, path: &str) -> Result<bool> {
        let result = self
            .execute(&format!("test -d {}", shell_quote(path)))
            .await?;
        Ok(result.success())
    }

    /// Fetch `source_path` as an archive, without touching local storage.
    pub async fn download_tree(&self, source_path: &str) -> Result<(ArchiveStream, ArchiveStat)> {
        self.ensure_running()?;
        debug!(id = %self.identity.short(), source = %source_path, "Downloading tree");
        self.runtime
            .get_archive(&self.identity, source_path)
            .await
            .map_err(|e| match e {
                BoxenvError::PathNotFound { .. } => e,
                other => transfer_error(other, |reason| read_error(source_path, reason)),
            })
    }

    /// Fetch the shell's current working directory as an archive.
    pub async fn download_working_directory(&self) -> Result<(String, ArchiveStream, ArchiveStat)> {
        let result = self.execute("pwd").await?;
        let cwd = result.output.trim().to_string();
        if !result.success() || cwd.is_empty() {
            return Err(read_error(".", result.output.trim()));
        }

        let (stream, stat) = self.download_tree(&cwd).await?;
        Ok((cwd, stream, stat))
    }

    /// Persist a downloaded archive as `<dir>/<short-id>_<slug>.tar`.
    pub async fn save_archive(
        &self,
        stream: &ArchiveStream,
        source_path: &str,
        dir: &Path,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let target = dir.join(archive_file_name(&self.identity, source_path));
        stream.save_to(&target).await?;
        info!(path = %target.display(), size = stream.len(), "Archive saved");
        Ok(target)
    }

    /// Put a local tar (optionally gzip-compressed) archive into `destination_dir`.
    pub async fn upload_tree(&self, local_archive: &Path, destination_dir: &str) -> Result<()> {
        self.ensure_running()?;

        let bytes = tokio::fs::read(local_archive)
            .await
            .map_err(|e| write_error(destination_dir, format!("{}: {}", local_archive.display(), e)))?;
        let bytes = archive::decompress(bytes).map_err(|e| write_error(destination_dir, e))?;

        self.put_tree(bytes, destination_dir).await?;
        info!(
            id = %self.identity.short(),
            archive = %local_archive.display(),
            destination = %destination_dir,
            "Archive uploaded"
        );
        Ok(())
    }

    /// Pack a local file or directory and put it into `destination_dir` under its own name.
    pub async fn upload_path(&self, local: &Path, destination_dir: &str) -> Result<()> {
        self.ensure_running()?;

        let bytes = archive::pack_path(local)
            .map_err(|e| write_error(destination_dir, format!("{}: {}", local.display(), e)))?;

        self.put_tree(bytes, destination_dir).await?;
        info!(
            id = %self.identity.short(),
            local = %local.display(),
            destination = %destination_dir,
            "Path uploaded"
        );
        Ok(())
    }

    async fn put_tree(&self, bytes: Vec<u8>, destination_dir: &str) -> Result<()> {
        let accepted = self
            .runtime
            .put_archive(&self.identity, destination_dir, bytes)
            .await
            .map_err(|e| transfer_error(e, |reason| write_error(destination_dir, reason)))?;
        if !accepted {
            return Err(write_error(destination_dir, "runtime rejected the archive"));
        }
        Ok(())
    }

    /// Restart an owned sandbox and refresh its port bindings.
    pub async fn restart(&mut self) -> Result<()> {
        self.ensure_running()?;
        if !self.is_owner() {
            return Err(BoxenvError::NotOwner {
                id: self.identity.to_string(),
                action: "restart".to_string(),
            });
        }

        info!(id = %self.identity.short(), "Restarting sandbox");
        self.runtime
            .restart(&self.identity, self.settings.stop_grace)
            .await?;
        self.details = Some(self.runtime.inspect(&self.identity).await?);
        Ok(())
    }

    /// Release the environment. Safe to call more than once.
    ///
    /// An owner stops its sandbox; stop failures are logged, not returned.
    /// An attached environment only marks itself released.
    pub async fn release(&mut self) {
        if self.state == EnvState::Released {
            debug!(id = %self.identity.short(), "Environment already released");
            return;
        }
        let previous = std::mem::replace(&mut self.state, EnvState::Released);

        match self.ownership {
            Ownership::Attached => {
                info!(id = %self.identity.short(), "Detached from sandbox");
            }
            Ownership::Owner => {
                let outcome = if previous == EnvState::Created {
                    self.runtime.remove(&self.identity, true).await
                } else {
                    self.runtime
                        .stop(&self.identity, self.settings.stop_grace)
                        .await
                };

                match outcome {
                    Ok(()) => info!(id = %self.identity.short(), "Sandbox stopped"),
                    Err(e) => {
                        warn!(id = %self.identity.short(), error = %e, "Failed to stop sandbox")
                    }
                }
            }
        }
    }
}

impl Drop for ExecutionEnvironment {
    fn drop(&mut self) {
        if self.ownership != Ownership::Owner || self.state == EnvState::Released {
            return;
        }

        let created_only = self.state == EnvState::Created;
        self.state = EnvState::Released;

        let runtime = Arc::clone(&self.runtime);
        let identity = self.identity.clone();
        let grace = self.settings.stop_grace;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(id = %identity.short(), "Environment dropped without release, stopping sandbox");
                handle.spawn(async move {
                    let outcome = if created_only {
                        runtime.remove(&identity, true).await
                    } else {
                        runtime.stop(&identity, grace).await
                    };
                    if let Err(e) = outcome {
                        warn!(id = %identity.short(), error = %e, "Failed to stop sandbox");
                    }
                });
            }
            Err(_) => {
                warn!(id = %identity.short(), "Environment dropped outside a runtime, sandbox left running");
            }
        }
    }
}

/// Keep connectivity and lifecycle errors as they are, wrap everything else.
fn transfer_error(err: BoxenvError, wrap: impl FnOnce(String) -> BoxenvError) -> BoxenvError {
    match err {
        BoxenvError::Connectivity(_)
        | BoxenvError::EnvironmentReleased { .. }
        | BoxenvError::SandboxNotFound { .. }
        | BoxenvError::NotRunning { .. }
        | BoxenvError::Timeout { .. } => err,
        other => wrap(other.to_string()),
    }
}

fn provisioning(err: BoxenvError) -> BoxenvError {
    match err {
        BoxenvError::Connectivity(_) | BoxenvError::Provisioning(_) => err,
        other => BoxenvError::Provisioning(other.to_string()),
    }
}

fn write_error(path: &str, reason: impl ToString) -> BoxenvError {
    BoxenvError::Write {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn read_error(path: &str, reason: impl ToString) -> BoxenvError {
    BoxenvError::Read {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Quote `s` as a single shell word.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// `<short-id>_<source with '/' replaced by '::'>.tar`
pub fn archive_file_name(identity: &SandboxIdentity, source_path: &str) -> String {
    format!("{}_{}.tar", identity.short(), source_path.replace('/', "::"))
}

/// Generate a unique, human-readable sandbox name
pub fn generate_sandbox_name(prefix: &str) -> String {
    format!("{}-{}", prefix, unique_suffix())
}

fn unique_suffix() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

    // Timestamp + counter keeps names unique within a process, the pid across processes
    let combined = (timestamp & 0xFF_FFFF_FFFF) << 8 | (counter as u64 & 0xFF);
    format!(
        "{}-{}",
        format_base36(combined),
        format_base36(std::process::id() as u64)
    )
}

fn format_base36(mut n: u64) -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut result = Vec::new();
    while n > 0 {
        result.push(CHARS[(n % 36) as usize]);
        n /= 36;
    }
    result.reverse();
    String::from_utf8(result).unwrap_or_default()
}
