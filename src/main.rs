use std::process::ExitCode;

use clap::Parser;

use boxenv::cli::args::{Cli, Commands, ListArgs};
use boxenv::cli::commands;
use boxenv::config::loader::load_config;
use boxenv::error::{BoxenvError, Result};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Help and version go to stdout and are not failures
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // Initialize logging based on verbosity
    init_logging(cli.global_opts.verbose);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config_path = cli.global_opts.config.as_deref();
    let format = cli.global_opts.format.clone();

    // `init` must work even when the config file is missing or broken
    let command = match cli.command {
        Some(Commands::Init(args)) => return commands::init(args, config_path).await,
        Some(command) => command,
        None if cli.list => Commands::List(ListArgs { all: false }),
        None => {
            return Err(BoxenvError::Config(
                "No command given (see --help)".to_string(),
            ))
        }
    };

    // Load configuration (file + CLI overrides)
    let config = load_config(config_path)?;

    match command {
        Commands::Download(args) => commands::download(args, config, format).await,
        Commands::Upload(args) => commands::upload(args, config, format).await,
        Commands::List(args) => commands::list(args, config, format).await,
        Commands::Exec(args) => commands::exec(args, config, format).await,
        Commands::Run(args) => commands::run(args, config, format).await,
        Commands::Config(args) => commands::config(args, config, config_path).await,
        Commands::Init(args) => commands::init(args, config_path).await,
    }
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
