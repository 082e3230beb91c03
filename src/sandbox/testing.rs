//! In-memory runtime that records every call, for unit tests.
//!
//! Sandboxes hold a tiny filesystem (a set of directories plus file
//! contents). Exec understands only the handful of commands the environment
//! issues, parsed from the `<shell> -lc <script>` argv.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BoxenvError, Result};
use crate::sandbox::archive::{self, ArchiveStat, ArchiveStream};
use crate::sandbox::ports::{HostPort, PortMap};
use crate::sandbox::traits::{
    ContainerDetails, ContainerSummary, CreateRequest, ExecOutput, ExecRequest, PublishedPort,
    RuntimeClient, SandboxIdentity,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ping,
    Create(String),
    Start(String),
    Stop(String),
    Restart(String),
    Remove(String),
    Inspect(String),
    Exec(String, Vec<String>),
    GetArchive(String, String),
    PutArchive(String, String),
    List(bool),
}

#[derive(Debug, Default)]
struct FakeSandbox {
    name: String,
    status: String,
    image: String,
    working_dir: String,
    auto_remove: bool,
    requested_ports: PortMap,
    ports: BTreeMap<String, Vec<PublishedPort>>,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

impl FakeSandbox {
    fn new(name: &str, status: &str) -> Self {
        Self {
            name: name.to_string(),
            status: status.to_string(),
            image: "fake:latest".to_string(),
            working_dir: "/tmp".to_string(),
            dirs: ["/", "/tmp", "/home"].iter().map(|d| d.to_string()).collect(),
            ..Self::default()
        }
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rsplit_once('/') {
            Some(("", _)) => true,
            Some((parent, _)) => self.dirs.contains(parent),
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    sandboxes: BTreeMap<String, FakeSandbox>,
    calls: Vec<Call>,
    next_id: u64,
    next_host_port: u16,
    fail_next_start: bool,
    fail_next_stop: bool,
    fail_next_inspect: bool,
    fail_next_get: bool,
    fail_next_put: bool,
    last_exec_env: BTreeMap<String, String>,
}

pub struct RecordingRuntime {
    state: Mutex<FakeState>,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_host_port: 49153,
                ..FakeState::default()
            }),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| pred(*c)).count()
    }

    pub fn exec_scripts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Exec(_, argv) => argv.get(2).cloned(),
                _ => None,
            })
            .collect()
    }

    pub fn last_argv(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .rev()
            .find_map(|c| match c {
                Call::Exec(_, argv) => Some(argv),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn last_exec_env(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().last_exec_env.clone()
    }

    pub fn fail_next_start(&self) {
        self.state.lock().unwrap().fail_next_start = true;
    }

    pub fn fail_next_stop(&self) {
        self.state.lock().unwrap().fail_next_stop = true;
    }

    pub fn fail_next_inspect(&self) {
        self.state.lock().unwrap().fail_next_inspect = true;
    }

    /// Make the next archive read fail with a daemon error.
    pub fn fail_next_get(&self) {
        self.state.lock().unwrap().fail_next_get = true;
    }

    /// Make the next archive write fail with a daemon error.
    pub fn fail_next_put(&self) {
        self.state.lock().unwrap().fail_next_put = true;
    }

    /// Register a sandbox created outside any environment.
    pub fn insert_sandbox(&self, name: &str, status: &str) -> SandboxIdentity {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{:0>64}", format!("ext{}", state.next_id));
        state.sandboxes.insert(id.clone(), FakeSandbox::new(name, status));
        SandboxIdentity::new(id)
    }

    pub fn status(&self, id: &SandboxIdentity) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.sandboxes.get(id.as_str()).map(|s| s.status.clone())
    }

    pub fn file(&self, id: &SandboxIdentity, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.sandboxes.get(id.as_str())?.files.get(path).cloned()
    }

    pub fn add_file(&self, id: &SandboxIdentity, path: &str, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if let Some(sandbox) = state.sandboxes.get_mut(id.as_str()) {
            sandbox.files.insert(path.to_string(), content.to_vec());
        }
    }

    pub fn add_dir(&self, id: &SandboxIdentity, path: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(sandbox) = state.sandboxes.get_mut(id.as_str()) {
            sandbox.dirs.insert(path.to_string());
        }
    }

    /// True if any staged upload is still sitting in `/tmp`.
    pub fn has_staged_files(&self, id: &SandboxIdentity) -> bool {
        let state = self.state.lock().unwrap();
        state
            .sandboxes
            .get(id.as_str())
            .map(|s| s.files.keys().any(|p| p.starts_with("/tmp/.boxenv-")))
            .unwrap_or(false)
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn resolve(state: &FakeState, id: &SandboxIdentity) -> Result<String> {
        if state.sandboxes.contains_key(id.as_str()) {
            return Ok(id.to_string());
        }
        state
            .sandboxes
            .iter()
            .find(|(full, s)| full.starts_with(id.as_str()) || s.name == id.as_str())
            .map(|(full, _)| full.clone())
            .ok_or_else(|| BoxenvError::SandboxNotFound { id: id.to_string() })
    }
}

impl Default for RecordingRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn join(dir: &str, rel: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), rel.trim_start_matches('/'))
}

fn exited(code: i32, output: impl Into<Vec<u8>>) -> ExecOutput {
    ExecOutput {
        exit_code: code,
        output: output.into(),
    }
}

/// Split a script into words, honouring single quotes and backslash escapes.
fn tokenize(script: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = script.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_token = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

fn run_script(sandbox: &mut FakeSandbox, script: &str, env: &BTreeMap<String, String>) -> ExecOutput {
    let tokens = tokenize(script);
    let words: Vec<&str> = tokens.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["echo", rest @ ..] => exited(0, format!("{}\n", rest.join(" "))),
        ["exit", code] => exited(code.parse().unwrap_or(1), Vec::new()),
        ["pwd"] => exited(0, format!("{}\n", sandbox.working_dir)),
        ["env"] => {
            let lines: String = env.iter().map(|(k, v)| format!("{}={}\n", k, v)).collect();
            exited(0, lines)
        }
        ["cat", "--", path] => match sandbox.files.get(*path) {
            Some(content) => exited(0, content.clone()),
            None => exited(1, format!("cat: {}: No such file or directory\n", path)),
        },
        ["ls", "-la", "--", path] => {
            if !sandbox.dirs.contains(*path) {
                return exited(
                    2,
                    format!("ls: cannot access '{}': No such file or directory\n", path),
                );
            }
            let prefix = join(path, "");
            let listing: String = sandbox
                .files
                .iter()
                .filter(|(p, _)| p.starts_with(&prefix) && !p[prefix.len()..].contains('/'))
                .map(|(p, c)| format!("-rw-r--r-- 1 root root {} {}\n", c.len(), &p[prefix.len()..]))
                .collect();
            exited(0, format!("total 0\n{}", listing))
        }
        ["test", "-e", path] => {
            let found = sandbox.files.contains_key(*path) || sandbox.dirs.contains(*path);
            exited(if found { 0 } else { 1 }, Vec::new())
        }
        ["test", "-d", path] => exited(if sandbox.dirs.contains(*path) { 0 } else { 1 }, Vec::new()),
        ["mv", "-f", "--", from, to] => {
            if !sandbox.parent_exists(to) {
                return exited(1, format!("mv: cannot move '{}' to '{}': No such file or directory\n", from, to));
            }
            match sandbox.files.remove(*from) {
                Some(content) => {
                    sandbox.files.insert(to.to_string(), content);
                    exited(0, Vec::new())
                }
                None => exited(1, format!("mv: cannot stat '{}'\n", from)),
            }
        }
        ["rm", "-f", "--", path] => {
            sandbox.files.remove(*path);
            exited(0, Vec::new())
        }
        ["printf", _, text, ">>", file] => {
            if !sandbox.parent_exists(file) {
                return exited(1, format!("{}: No such file or directory\n", file));
            }
            let entry = sandbox.files.entry(file.to_string()).or_default();
            entry.extend_from_slice(text.as_bytes());
            entry.push(b'\n');
            exited(0, Vec::new())
        }
        _ => exited(127, format!("{}: command not found\n", words.first().unwrap_or(&""))),
    }
}

fn tree_archive(sandbox: &FakeSandbox, path: &str) -> Vec<u8> {
    let root = path.trim_end_matches('/').rsplit('/').next().unwrap_or("root");
    let mut builder = tar::Builder::new(Vec::new());

    let mut dir_header = tar::Header::new_gnu();
    dir_header.set_entry_type(tar::EntryType::Directory);
    dir_header.set_size(0);
    dir_header.set_mode(0o755);
    builder
        .append_data(&mut dir_header, root, std::io::empty())
        .unwrap();

    let prefix = join(path, "");
    for (file, content) in sandbox.files.iter().filter(|(p, _)| p.starts_with(&prefix)) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, join(root, &file[prefix.len()..]), content.as_slice())
            .unwrap();
    }

    builder.into_inner().unwrap()
}

#[async_trait]
impl RuntimeClient for RecordingRuntime {
    fn name(&self) -> &str {
        "recording"
    }

    async fn ping(&self) -> Result<()> {
        self.record(Call::Ping);
        Ok(())
    }

    async fn create(&self, request: &CreateRequest) -> Result<SandboxIdentity> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create(request.name.clone()));
        state.next_id += 1;
        let id = format!("{:0>64}", format!("{:x}", state.next_id));

        let mut sandbox = FakeSandbox::new(&request.name, "created");
        sandbox.image = request.image.clone();
        sandbox.working_dir = request.working_dir.clone();
        sandbox.auto_remove = request.auto_remove;
        sandbox.requested_ports = request.ports.clone();
        state.sandboxes.insert(id.clone(), sandbox);

        Ok(SandboxIdentity::new(id))
    }

    async fn start(&self, id: &SandboxIdentity) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Start(id.to_string()));

        if std::mem::take(&mut state.fail_next_start) {
            return Err(BoxenvError::Runtime("image entrypoint failed".to_string()));
        }

        let key = Self::resolve(&state, id)?;
        let mut next_port = state.next_host_port;
        let sandbox = state.sandboxes.get_mut(&key).unwrap();
        sandbox.status = "running".to_string();

        // Bindings materialize only now, auto ports get the next free host port
        let mut ports = BTreeMap::new();
        for (container_port, binding) in &sandbox.requested_ports {
            let published = binding
                .hosts()
                .into_iter()
                .map(|host| match host {
                    HostPort::Auto => {
                        next_port += 1;
                        PublishedPort {
                            host_ip: "0.0.0.0".to_string(),
                            host_port: next_port.to_string(),
                        }
                    }
                    HostPort::Port(port) => PublishedPort {
                        host_ip: "0.0.0.0".to_string(),
                        host_port: port.to_string(),
                    },
                    HostPort::Address { ip, port } => PublishedPort {
                        host_ip: ip.clone(),
                        host_port: port.to_string(),
                    },
                })
                .collect();
            ports.insert(container_port.clone(), published);
        }
        sandbox.ports = ports;
        state.next_host_port = next_port;
        Ok(())
    }

    async fn stop(&self, id: &SandboxIdentity, _grace: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Stop(id.to_string()));

        if std::mem::take(&mut state.fail_next_stop) {
            return Err(BoxenvError::Runtime("Error response from daemon: cannot stop container".to_string()));
        }

        let key = Self::resolve(&state, id)?;
        let auto_remove = state.sandboxes.get(&key).map(|s| s.auto_remove).unwrap_or(false);
        if auto_remove {
            state.sandboxes.remove(&key);
        } else if let Some(sandbox) = state.sandboxes.get_mut(&key) {
            sandbox.status = "exited".to_string();
        }
        Ok(())
    }

    async fn restart(&self, id: &SandboxIdentity, _grace: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Restart(id.to_string()));
        let key = Self::resolve(&state, id)?;
        if let Some(sandbox) = state.sandboxes.get_mut(&key) {
            sandbox.status = "running".to_string();
        }
        Ok(())
    }

    async fn remove(&self, id: &SandboxIdentity, _force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Remove(id.to_string()));
        let key = Self::resolve(&state, id)?;
        state.sandboxes.remove(&key);
        Ok(())
    }

    async fn inspect(&self, id: &SandboxIdentity) -> Result<ContainerDetails> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Inspect(id.to_string()));

        if std::mem::take(&mut state.fail_next_inspect) {
            return Err(BoxenvError::Runtime("Error response from daemon: inspect failed".to_string()));
        }
        let key = Self::resolve(&state, id)?;
        let sandbox = &state.sandboxes[&key];

        Ok(ContainerDetails {
            id: SandboxIdentity::new(key.clone()),
            name: sandbox.name.clone(),
            status: sandbox.status.clone(),
            created_at: None,
            image: sandbox.image.clone(),
            working_dir: sandbox.working_dir.clone(),
            env: Vec::new(),
            ports: sandbox.ports.clone(),
            mounts: Vec::new(),
        })
    }

    async fn exec(&self, id: &SandboxIdentity, request: &ExecRequest) -> Result<ExecOutput> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state
                .calls
                .push(Call::Exec(id.to_string(), request.argv.clone()));
            state.last_exec_env = request.env.clone();

            let key = Self::resolve(&state, id)?;
            if state.sandboxes[&key].status != "running" {
                return Err(BoxenvError::NotRunning {
                    id: id.to_string(),
                    status: state.sandboxes[&key].status.clone(),
                });
            }
            request.argv.get(2).cloned().unwrap_or_default()
        };

        // Sleeps run without the lock so a caller-side timeout can fire
        let words = tokenize(&script);
        if words.len() == 2 && words[0] == "sleep" {
            let secs = words[1].parse().unwrap_or(1);
            tokio::time::sleep(Duration::from_secs(secs)).await;
            return Ok(exited(0, Vec::new()));
        }

        let mut state = self.state.lock().unwrap();
        let key = Self::resolve(&state, id)?;
        let sandbox = state.sandboxes.get_mut(&key).unwrap();
        Ok(run_script(sandbox, &script, &request.env))
    }

    async fn get_archive(
        &self,
        id: &SandboxIdentity,
        path: &str,
    ) -> Result<(ArchiveStream, ArchiveStat)> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(Call::GetArchive(id.to_string(), path.to_string()));

        if std::mem::take(&mut state.fail_next_get) {
            return Err(BoxenvError::Runtime("Error response from daemon: archive read failed".to_string()));
        }
        let key = Self::resolve(&state, id)?;
        let sandbox = &state.sandboxes[&key];

        let bytes = if let Some(content) = sandbox.files.get(path) {
            let name = path.rsplit('/').next().unwrap_or(path);
            archive::encode_file(name, content)?
        } else if sandbox.dirs.contains(path) {
            tree_archive(sandbox, path)
        } else {
            return Err(BoxenvError::PathNotFound {
                id: id.to_string(),
                path: path.to_string(),
            });
        };

        let stream = ArchiveStream::new(bytes);
        let stat = stream.stat()?;
        Ok((stream, stat))
    }

    async fn put_archive(
        &self,
        id: &SandboxIdentity,
        target_dir: &str,
        archive_bytes: Vec<u8>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(Call::PutArchive(id.to_string(), target_dir.to_string()));

        if std::mem::take(&mut state.fail_next_put) {
            return Err(BoxenvError::Runtime("Error response from daemon: archive write failed".to_string()));
        }
        let key = Self::resolve(&state, id)?;
        let sandbox = state.sandboxes.get_mut(&key).unwrap();

        if !sandbox.dirs.contains(target_dir) {
            return Err(BoxenvError::PathNotFound {
                id: id.to_string(),
                path: target_dir.to_string(),
            });
        }

        for entry in archive::decode(&archive_bytes)? {
            let path = join(target_dir, &entry.relative_path);
            if entry.is_directory {
                sandbox.dirs.insert(path);
            } else {
                sandbox.files.insert(path, entry.content);
            }
        }
        Ok(true)
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::List(all));

        Ok(state
            .sandboxes
            .iter()
            .filter(|(_, s)| all || s.status == "running")
            .map(|(id, s)| ContainerSummary {
                id: SandboxIdentity::new(id.clone()),
                name: s.name.clone(),
                image: s.image.clone(),
                state: s.status.clone(),
                status: s.status.clone(),
                created_at: None,
            })
            .collect())
    }
}
