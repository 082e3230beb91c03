use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::args::{
    ConfigAction, ConfigArgs, DownloadArgs, ExecArgs, InitArgs, ListArgs, OutputFormat, RunArgs,
    UploadArgs,
};
use crate::config::loader::{get_config_path, write_default_config};
use crate::config::types::{BoxenvConfig, SandboxOverrides};
use crate::error::{BoxenvError, Result};
use crate::sandbox::{
    create_runtime, ContainerSummary, EnvironmentSettings, ExecutionEnvironment, ExecutionResult,
    RuntimeClient,
};

// ============================================================================
// Transfer Commands
// ============================================================================

/// What a download put on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadSummary {
    pub sandbox: String,
    pub source: String,
    pub destination: PathBuf,
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// Download a path from a running sandbox into `<output>/<sandbox name>/`
pub async fn download(args: DownloadArgs, config: BoxenvConfig, format: OutputFormat) -> Result<()> {
    info!(sandbox = %args.identity, source = %args.source, "Downloading from sandbox");

    let runtime = create_runtime(&config.runtime).await?;
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(&config.transfer.download_dir));

    let summary = download_into(
        runtime,
        &args.identity,
        &args.source,
        &output,
        EnvironmentSettings::from(&config),
    )
    .await?;

    match format {
        OutputFormat::Text => {
            println!(
                "Downloaded {} from {} to {}",
                summary.source,
                summary.sandbox,
                summary.destination.display()
            );
            println!(
                "  {} files, {} directories, {} bytes",
                summary.files, summary.directories, summary.bytes
            );
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

pub(crate) async fn download_into(
    runtime: Arc<dyn RuntimeClient>,
    identity: &str,
    source: &str,
    output: &Path,
    settings: EnvironmentSettings,
) -> Result<DownloadSummary> {
    let mut env = ExecutionEnvironment::attach(runtime, identity, settings).await?;
    let outcome = extract_tree(&env, source, output).await;
    env.release().await;
    outcome
}

async fn extract_tree(
    env: &ExecutionEnvironment,
    source: &str,
    output: &Path,
) -> Result<DownloadSummary> {
    // Fetch before touching the local filesystem so a bad path leaves nothing behind
    let (stream, stat) = env.download_tree(source).await?;
    let entries = stream.entries()?;

    let destination = output.join(env.name());
    let fresh = !destination.exists();
    tokio::fs::create_dir_all(&destination).await?;

    if let Err(e) = stream.unpack_into(&destination) {
        if fresh {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&destination).await {
                warn!(path = %destination.display(), error = %cleanup, "Failed to remove partial download");
            }
        }
        return Err(e);
    }

    let directories = entries.iter().filter(|e| e.is_directory).count();
    let bytes = entries.iter().map(|e| e.content.len() as u64).sum();

    info!(
        source = %source,
        root = %stat.name,
        destination = %destination.display(),
        "Download extracted"
    );

    Ok(DownloadSummary {
        sandbox: env.name().to_string(),
        source: source.to_string(),
        destination,
        files: entries.len() - directories,
        directories,
        bytes,
    })
}

/// Upload a local file or directory into a running sandbox
pub async fn upload(args: UploadArgs, config: BoxenvConfig, format: OutputFormat) -> Result<()> {
    info!(sandbox = %args.identity, local = %args.local.display(), dest = %args.dest, "Uploading to sandbox");

    let runtime = create_runtime(&config.runtime).await?;
    let name = upload_from(
        runtime,
        &args.identity,
        &args.local,
        &args.dest,
        EnvironmentSettings::from(&config),
    )
    .await?;

    match format {
        OutputFormat::Text => {
            println!(
                "Uploaded {} to {}:{}",
                args.local.display(),
                name,
                args.dest
            );
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "sandbox": name,
                    "local": args.local,
                    "destination": args.dest,
                })
            );
        }
    }

    Ok(())
}

pub(crate) async fn upload_from(
    runtime: Arc<dyn RuntimeClient>,
    identity: &str,
    local: &Path,
    dest: &str,
    settings: EnvironmentSettings,
) -> Result<String> {
    if !local.exists() {
        return Err(BoxenvError::Config(format!(
            "Local path not found: {}",
            local.display()
        )));
    }

    let mut env = ExecutionEnvironment::attach(runtime, identity, settings).await?;
    let outcome = env.upload_path(local, dest).await;
    env.release().await;
    outcome.map(|()| env.name().to_string())
}

/// List sandboxes
pub async fn list(args: ListArgs, config: BoxenvConfig, format: OutputFormat) -> Result<()> {
    let runtime = create_runtime(&config.runtime).await?;
    let sandboxes = runtime.list(args.all).await?;

    match format {
        OutputFormat::Text => print!("{}", render_table(&sandboxes)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&sandboxes)?),
    }

    Ok(())
}

fn render_table(sandboxes: &[ContainerSummary]) -> String {
    if sandboxes.is_empty() {
        return "No sandboxes\n".to_string();
    }

    let mut out = format!(
        "{:<14} {:<24} {:<20} {:<18} STATUS\n",
        "ID", "NAME", "IMAGE", "CREATED"
    );
    out.push_str(&"-".repeat(90));
    out.push('\n');

    for sandbox in sandboxes {
        let created = sandbox
            .created_at
            .map(format_timestamp)
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<14} {:<24} {:<20} {:<18} {}\n",
            sandbox.id.short(),
            sandbox.name,
            sandbox.image,
            created,
            sandbox.status
        ));
    }
    out
}

// ============================================================================
// Execution Commands
// ============================================================================

/// Execute a one-shot command (spawn, run, release)
pub async fn exec(args: ExecArgs, config: BoxenvConfig, format: OutputFormat) -> Result<()> {
    info!(command = %args.command, "Executing one-shot command");

    let sandbox_config = config.sandbox.to_sandbox_config(SandboxOverrides {
        image: args.image,
        working_directory: args.workdir,
        env_vars: args.env_vars,
        ports: args.ports,
        mounts: args.mounts,
    })?;

    let runtime = create_runtime(&config.runtime).await?;
    let mut env =
        ExecutionEnvironment::spawn(runtime, &sandbox_config, EnvironmentSettings::from(&config))
            .await?;

    let result = env.execute(&args.command).await;
    env.release().await;

    output_command_result(&result?, format);
    Ok(())
}

/// Execute a command in an existing sandbox
pub async fn run(args: RunArgs, config: BoxenvConfig, format: OutputFormat) -> Result<()> {
    info!(sandbox = %args.identity, command = %args.command, "Running command in sandbox");

    let runtime = create_runtime(&config.runtime).await?;
    let result = run_in(
        runtime,
        &args.identity,
        &args.command,
        EnvironmentSettings::from(&config),
    )
    .await?;

    output_command_result(&result, format);
    Ok(())
}

pub(crate) async fn run_in(
    runtime: Arc<dyn RuntimeClient>,
    identity: &str,
    command: &str,
    settings: EnvironmentSettings,
) -> Result<ExecutionResult> {
    let mut env = ExecutionEnvironment::attach(runtime, identity, settings).await?;

    let result = env.execute(command).await;
    if result.is_ok() {
        if let Err(e) = env.record_command(command).await {
            warn!(error = %e, "Failed to record command history");
        }
    }

    env.release().await;
    result
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs, config_path: Option<&Path>) -> Result<()> {
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(get_config_path);

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    write_default_config(&config_path)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Run a one-shot command in a fresh sandbox");
    println!("  boxenv exec --image python:3.13 \"python -V\"");
    println!();
    println!("  # Run a command in a sandbox that is already running");
    println!("  boxenv run <id> \"ls -la\"");
    println!();
    println!("  # Copy files in and out");
    println!("  boxenv upload <id> ./inputs /tmp");
    println!("  boxenv download <id> /tmp/results -o data");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: BoxenvConfig, config_path: Option<&Path>) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str =
                toml::to_string_pretty(&config).map_err(|e| BoxenvError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            let path = config_path
                .map(Path::to_path_buf)
                .unwrap_or_else(get_config_path);
            println!("{}", path.display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn output_command_result(result: &ExecutionResult, format: OutputFormat) {
    match format {
        OutputFormat::Text => {
            if !result.output.is_empty() {
                print!("{}", result.output);
            }
            // Exit with the command's exit code
            if result.exit_code != 0 {
                std::process::exit(result.exit_code);
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "output": result.output,
                    "exit_code": result.exit_code,
                })
            );
        }
    }
}

fn format_timestamp(datetime: DateTime<Utc>) -> String {
    let local: DateTime<Local> = datetime.into();
    local.format("%Y-%m-%d %H:%M").to_string()
}
