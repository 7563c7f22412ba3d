use batchsubmit::{
    backends::{BackendError, Backends},
    config::BatchConfig,
};
use clap::Parser;
use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

/// Submit a batch of shell commands and wait for them to finish
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Batch configuration (YAML)
    #[arg(short, long)]
    config: PathBuf,
    /// File with one command per line, `-` reads from stdin
    commands: PathBuf,
    /// Override the configured workarea
    #[arg(short, long)]
    workarea: Option<PathBuf>,
    /// Reuse an existing workarea
    #[arg(long)]
    overwrite: bool,
    /// Return right after submission
    #[arg(long)]
    no_wait: bool,
    /// Print the scheduler output of every job once the batch finished
    #[arg(long)]
    print_results: bool,
}

fn read_commands(path: &Path) -> io::Result<Vec<String>> {
    let content = if path.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(path)?
    };

    // blank lines and comments are not jobs
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

fn run(cli: &Cli, config: &BatchConfig, commands: Vec<String>) -> Result<bool, BackendError> {
    let mut backend = Backends::load(config)?;
    info!("Using workarea: {}", backend.workarea().display());

    if let Some(job_id) = backend.submit(commands, &config.submit)? {
        info!("Submitted job {job_id}");
    }

    if cli.no_wait {
        return Ok(true);
    }

    backend.wait(&config.wait)?;

    match backend {
        Backends::Sge(backend) => {
            if cli.print_results {
                for line in backend.result_lines()? {
                    println!("{}", line?);
                }
            }

            Ok(true)
        }
        Backends::WorkQueue(backend) => {
            if cli.print_results {
                warn!("Result collection is only available for the SGE backend");
            }

            Ok(backend.succeeded())
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("batchsubmit=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = BatchConfig::load(&cli.config).unwrap_or_log();
    if cli.workarea.is_some() {
        config.workarea = cli.workarea.clone();
    }
    config.overwrite |= cli.overwrite;

    let commands = read_commands(&cli.commands).unwrap_or_log();
    if commands.is_empty() {
        error!("No commands found in {}", cli.commands.display());
        return ExitCode::FAILURE;
    }

    match run(&cli, &config, commands) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            error!("At least one job failed");
            ExitCode::FAILURE
        }
        Err(error) => {
            error!(error = ?error, "{error}");
            ExitCode::FAILURE
        }
    }
}
