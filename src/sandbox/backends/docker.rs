use std::collections::BTreeMap;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{BoxenvError, Result};
use crate::sandbox::archive::{ArchiveStat, ArchiveStream};
use crate::sandbox::mounts::{MountDescriptor, MountKind};
use crate::sandbox::ports::{HostPort, PortMap};
use crate::sandbox::traits::{
    ContainerDetails, ContainerSummary, CreateRequest, ExecOutput, ExecRequest, MountPoint,
    PublishedPort, RuntimeClient, SandboxIdentity,
};

/// Default Docker CLI binary
pub const DEFAULT_DOCKER_BINARY: &str = "docker";

const READ_BUF_SIZE: usize = 8192;

/// Docker runtime client.
///
/// Drives the `docker` CLI as a subprocess for every operation. Archive
/// transfers go through `docker cp` with `-` as one side, which streams a tar
/// archive over stdin/stdout.
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run the CLI to completion, optionally feeding `stdin`.
    async fn run(&self, args: &[String], stdin: Option<Vec<u8>>) -> Result<Output> {
        debug!(binary = %self.binary, args = ?args, "Running docker command");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BoxenvError::Connectivity(format!("Failed to run '{}': {}", self.binary, e))
        })?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // Written concurrently so a chatty child cannot deadlock on full pipes
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&data).await {
                    warn!(error = %e, "Failed to write to docker stdin");
                }
                drop(pipe);
            });
        }

        Ok(child.wait_with_output().await?)
    }

    async fn run_checked(
        &self,
        args: &[String],
        stdin: Option<Vec<u8>>,
        id: Option<&SandboxIdentity>,
        path: Option<&str>,
    ) -> Result<Output> {
        let output = self.run(args, stdin).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, id, path));
        }
        Ok(output)
    }
}

#[async_trait]
impl RuntimeClient for DockerCli {
    fn name(&self) -> &str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        let args = strings(["version", "--format", "{{.Server.Version}}"]);
        let output = self.run(&args, None).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BoxenvError::Connectivity(stderr.trim().to_string()));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        debug!(version = %version.trim(), "Docker daemon reachable");
        Ok(())
    }

    async fn create(&self, request: &CreateRequest) -> Result<SandboxIdentity> {
        let args = create_args(request);
        let output = self.run(&args, None).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(match classify_failure(&stderr, None, None) {
                err @ BoxenvError::Connectivity(_) => err,
                _ => BoxenvError::Provisioning(format!(
                    "Failed to create sandbox '{}': {}",
                    request.name,
                    stderr.trim()
                )),
            });
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(id = %id, name = %request.name, image = %request.image, "Docker container created");
        Ok(SandboxIdentity::new(id))
    }

    async fn start(&self, id: &SandboxIdentity) -> Result<()> {
        let args = vec!["start".to_string(), id.to_string()];
        self.run_checked(&args, None, Some(id), None).await?;
        Ok(())
    }

    async fn stop(&self, id: &SandboxIdentity, grace: Duration) -> Result<()> {
        info!(id = %id.short(), grace_secs = grace.as_secs(), "Stopping Docker container...");
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            grace.as_secs().to_string(),
            id.to_string(),
        ];
        self.run_checked(&args, None, Some(id), None).await?;
        Ok(())
    }

    async fn restart(&self, id: &SandboxIdentity, grace: Duration) -> Result<()> {
        let args = vec![
            "restart".to_string(),
            "-t".to_string(),
            grace.as_secs().to_string(),
            id.to_string(),
        ];
        self.run_checked(&args, None, Some(id), None).await?;
        Ok(())
    }

    async fn remove(&self, id: &SandboxIdentity, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(id.to_string());
        self.run_checked(&args, None, Some(id), None).await?;
        Ok(())
    }

    async fn inspect(&self, id: &SandboxIdentity) -> Result<ContainerDetails> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            id.to_string(),
        ];
        let output = self.run_checked(&args, None, Some(id), None).await?;
        parse_inspect(&output.stdout, id)
    }

    async fn exec(&self, id: &SandboxIdentity, request: &ExecRequest) -> Result<ExecOutput> {
        let args = exec_args(id, request);
        debug!(id = %id.short(), argv = ?request.argv, "Executing via docker exec");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BoxenvError::Connectivity(format!("Failed to run '{}': {}", self.binary, e))
        })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BoxenvError::Runtime("docker exec stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| BoxenvError::Runtime("docker exec stderr not captured".to_string()))?;

        // Drain both pipes as data arrives so the output keeps its interleaving
        let mut combined = Vec::new();
        let mut stderr_only = Vec::new();
        let mut out_buf = [0u8; READ_BUF_SIZE];
        let mut err_buf = [0u8; READ_BUF_SIZE];
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => match read? {
                    0 => out_open = false,
                    n => combined.extend_from_slice(&out_buf[..n]),
                },
                read = stderr.read(&mut err_buf), if err_open => match read? {
                    0 => err_open = false,
                    n => {
                        combined.extend_from_slice(&err_buf[..n]);
                        stderr_only.extend_from_slice(&err_buf[..n]);
                    }
                },
            }
        }

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(1);

        if exit_code != 0 {
            let stderr = String::from_utf8_lossy(&stderr_only);
            if is_daemon_failure(&stderr) {
                return Err(classify_failure(&stderr, Some(id), None));
            }
        }

        debug!(
            exit_code = exit_code,
            output_len = combined.len(),
            "Command completed"
        );

        Ok(ExecOutput {
            exit_code,
            output: combined,
        })
    }

    async fn get_archive(
        &self,
        id: &SandboxIdentity,
        path: &str,
    ) -> Result<(ArchiveStream, ArchiveStat)> {
        let args = vec!["cp".to_string(), format!("{}:{}", id, path), "-".to_string()];
        let output = self.run_checked(&args, None, Some(id), Some(path)).await?;

        let stream = ArchiveStream::new(output.stdout);
        let stat = stream.stat()?;
        debug!(id = %id.short(), path = %path, size = stream.len(), "Fetched archive");
        Ok((stream, stat))
    }

    async fn put_archive(
        &self,
        id: &SandboxIdentity,
        target_dir: &str,
        archive: Vec<u8>,
    ) -> Result<bool> {
        let size = archive.len();
        let args = vec![
            "cp".to_string(),
            "-".to_string(),
            format!("{}:{}", id, target_dir),
        ];
        self.run_checked(&args, Some(archive), Some(id), Some(target_dir))
            .await?;

        debug!(id = %id.short(), target = %target_dir, size = size, "Archive extracted");
        Ok(true)
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let mut args = strings(["ps", "--no-trunc", "--format", "{{json .}}"]);
        if all {
            args.insert(1, "-a".to_string());
        }
        let output = self.run_checked(&args, None, None, None).await?;

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_ps_line)
            .collect()
    }
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// True when stderr comes from the docker client or daemon rather than the exec'd process.
fn is_daemon_failure(stderr: &str) -> bool {
    let stderr = stderr.trim_start();
    stderr.starts_with("Error response from daemon")
        || stderr.starts_with("Error: No such container")
        || stderr.contains("Cannot connect to the Docker daemon")
        || stderr.starts_with("error during connect")
}

/// Map a failed docker invocation onto the error taxonomy.
fn classify_failure(stderr: &str, id: Option<&SandboxIdentity>, path: Option<&str>) -> BoxenvError {
    let message = stderr.trim().to_string();
    let id_str = id.map(|i| i.to_string()).unwrap_or_default();

    if message.contains("Cannot connect to the Docker daemon")
        || message.contains("error during connect")
        || message.contains("permission denied while trying to connect")
    {
        return BoxenvError::Connectivity(message);
    }

    if let Some(path) = path {
        if message.contains("No such container:path")
            || message.contains("Could not find the file")
            || message.contains("No such file or directory")
        {
            return BoxenvError::PathNotFound {
                id: id_str,
                path: path.to_string(),
            };
        }
    }

    if message.contains("No such container") || message.contains("No such object") {
        return BoxenvError::SandboxNotFound { id: id_str };
    }

    if message.contains("is not running") {
        return BoxenvError::NotRunning {
            id: id_str,
            status: "not running".to_string(),
        };
    }

    BoxenvError::Runtime(message)
}

fn create_args(request: &CreateRequest) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), request.name.clone()];

    if request.auto_remove {
        args.push("--rm".to_string());
    }
    if request.detach {
        // Keep stdin open so the image's default process stays alive when detached
        args.push("-i".to_string());
    }
    if request.tty {
        args.push("-t".to_string());
    }

    args.push("-w".to_string());
    args.push(request.working_dir.clone());

    for (key, value) in &request.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.extend(port_args(&request.ports));

    for mount in &request.mounts {
        args.push("--mount".to_string());
        args.push(mount_arg(mount));
    }

    args.push(request.image.clone());
    args
}

fn port_args(ports: &PortMap) -> Vec<String> {
    let mut args = Vec::new();

    for (container_port, binding) in ports {
        for host in binding.hosts() {
            args.push("-p".to_string());
            args.push(match host {
                HostPort::Auto => container_port.clone(),
                HostPort::Port(port) => format!("{}:{}", port, container_port),
                HostPort::Address { ip, port } => format!("{}:{}:{}", ip, port, container_port),
            });
        }
    }

    args
}

/// Render a descriptor as a `--mount` value (comma separated, CSV quoted).
fn mount_arg(mount: &MountDescriptor) -> String {
    let mut fields = vec![format!("type={}", mount.kind.as_str())];

    if let Some(source) = &mount.source {
        fields.push(format!("source={}", source));
    }
    fields.push(format!("target={}", mount.target));

    if mount.read_only {
        fields.push("readonly".to_string());
    }
    if let Some(consistency) = &mount.consistency {
        fields.push(format!("consistency={}", consistency));
    }

    match mount.kind {
        MountKind::Bind => {
            if let Some(propagation) = mount.propagation {
                fields.push(format!("bind-propagation={}", propagation));
            }
        }
        MountKind::Volume => {
            if mount.no_copy == Some(true) {
                fields.push("volume-nocopy".to_string());
            }
            for (key, value) in mount.labels.iter().flatten() {
                fields.push(format!("volume-label={}={}", key, value));
            }
        }
        MountKind::Tmpfs => {
            if let Some(size) = mount.tmpfs_size {
                fields.push(format!("tmpfs-size={}", size));
            }
        }
    }

    fields
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",")
}

fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn exec_args(id: &SandboxIdentity, request: &ExecRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];

    if let Some(dir) = &request.working_dir {
        args.push("-w".to_string());
        args.push(dir.clone());
    }
    for (key, value) in &request.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(id.to_string());
    args.extend(request.argv.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInspect {
    id: String,
    name: String,
    #[serde(default)]
    created: String,
    state: RawState,
    config: RawConfig,
    #[serde(default)]
    network_settings: RawNetworkSettings,
    #[serde(default)]
    mounts: Vec<RawMount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    working_dir: String,
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNetworkSettings {
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<RawPortBinding>>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawPortBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawMount {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
    #[serde(default)]
    mode: String,
    #[serde(rename = "RW", default)]
    rw: bool,
}

fn parse_inspect(stdout: &[u8], id: &SandboxIdentity) -> Result<ContainerDetails> {
    let raw: Vec<RawInspect> = serde_json::from_slice(stdout)?;
    let raw = raw
        .into_iter()
        .next()
        .ok_or_else(|| BoxenvError::SandboxNotFound { id: id.to_string() })?;

    let ports = raw
        .network_settings
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|(port, bindings)| {
            let published = bindings
                .unwrap_or_default()
                .into_iter()
                .map(|b| PublishedPort {
                    host_ip: b.host_ip,
                    host_port: b.host_port,
                })
                .collect();
            (port, published)
        })
        .collect();

    let mounts = raw
        .mounts
        .into_iter()
        .map(|m| MountPoint {
            kind: m.kind,
            name: m.name,
            source: m.source,
            destination: m.destination,
            mode: m.mode,
            read_write: m.rw,
        })
        .collect();

    Ok(ContainerDetails {
        id: SandboxIdentity::new(raw.id),
        name: raw.name.trim_start_matches('/').to_string(),
        status: raw.state.status,
        created_at: DateTime::parse_from_rfc3339(&raw.created)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        image: raw.config.image,
        working_dir: raw.config.working_dir,
        env: raw.config.env.unwrap_or_default(),
        ports,
        mounts,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawSummary {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    names: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    created_at: String,
}

fn parse_ps_line(line: &str) -> Result<ContainerSummary> {
    let raw: RawSummary = serde_json::from_str(line)?;

    Ok(ContainerSummary {
        id: SandboxIdentity::new(raw.id),
        name: raw.names.split(',').next().unwrap_or_default().to_string(),
        image: raw.image,
        state: raw.state,
        status: raw.status,
        created_at: parse_ps_timestamp(&raw.created_at),
    })
}

/// `docker ps` prints e.g. `2024-05-01 10:00:00 +0000 UTC`; the zone name is redundant.
fn parse_ps_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let head: Vec<&str> = value.split_whitespace().take(3).collect();
    if head.len() != 3 {
        return None;
    }
    DateTime::parse_from_str(&head.join(" "), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
