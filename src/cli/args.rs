use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::sandbox::mounts::{parse_mount_flag, MountSpec};
use crate::sandbox::ports::{parse_port_flag, PortRequest};

#[derive(Parser, Debug)]
#[clap(name = "boxenv")]
#[clap(version, about = "Container-backed execution environments")]
#[clap(propagate_version = true)]
#[clap(arg_required_else_help = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    /// List running sandboxes (same as `boxenv list`)
    #[clap(long = "list", short = 'l')]
    pub list: bool,

    #[clap(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "BOXENV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a path from a running sandbox
    Download(DownloadArgs),

    /// Upload a local file or directory into a running sandbox
    Upload(UploadArgs),

    /// List sandboxes
    List(ListArgs),

    /// Execute a one-shot command (spawn, run, release in one step)
    Exec(ExecArgs),

    /// Execute a command in an existing sandbox
    Run(RunArgs),

    /// Initialize a new boxenv configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Transfer Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Sandbox ID (full or short) or name
    pub identity: String,

    /// Absolute path inside the sandbox
    pub source: String,

    /// Local directory; files land under <output>/<sandbox name>/
    #[clap(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Sandbox ID (full or short) or name
    pub identity: String,

    /// Local file or directory
    pub local: PathBuf,

    /// Existing directory inside the sandbox
    pub dest: String,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Include stopped sandboxes
    #[clap(long, short)]
    pub all: bool,
}

// ============================================================================
// Execution Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Command to execute
    pub command: String,

    /// Container image (defaults to the configured image)
    #[clap(long)]
    pub image: Option<String>,

    /// Working directory inside sandbox
    #[clap(long)]
    pub workdir: Option<String>,

    /// Environment variables to set in sandbox (KEY=VALUE)
    #[clap(long = "env", short = 'e', value_parser = parse_env_var)]
    pub env_vars: Vec<(String, String)>,

    /// Publish a container port (container[:host] or container:ip:host)
    #[clap(long = "publish", short = 'p', value_parser = parse_port_flag)]
    pub ports: Vec<PortRequest>,

    /// Mount into the sandbox (src:dst[:ro], volume:name:dst[:ro], tmpfs:dst)
    #[clap(long = "mount", short = 'm', value_parser = parse_mount_flag)]
    pub mounts: Vec<MountSpec>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Sandbox ID (full or short) or name
    pub identity: String,

    /// Command to execute
    pub command: String,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, _)) if k.is_empty() => Err("Environment variable name must not be empty".to_string()),
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err("Environment variable format: KEY=VALUE".to_string()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
