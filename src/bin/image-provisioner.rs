use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use image_provisioner::pipeline::config::DEFAULT_RECIPE;
use image_provisioner::pipeline::BackendKind;
use image_provisioner::ProvisionError;
use tracing_subscriber::EnvFilter;

mod workflows;

const DEFAULT_OUTPUT: &str = "out";

/// Layered, reproducible provisioning of runtime images
#[derive(Parser)]
#[command(name = "image-provisioner")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image and publish it as a new run
    Build {
        #[arg(long, default_value = DEFAULT_RECIPE)]
        recipe: PathBuf,

        /// Directory holding published runs
        #[arg(long, default_value = DEFAULT_OUTPUT)]
        output: PathBuf,

        #[command(flatten)]
        dev: DevArgs,

        #[arg(long, value_enum, default_value_t = Backend::Ledger)]
        backend: Backend,

        /// Per-stage wall-clock budget in seconds
        #[arg(long, value_name = "SECS")]
        stage_timeout: Option<u64>,
    },

    /// Resolve and validate a recipe, print the stages and layer keys
    Plan {
        #[arg(long, default_value = DEFAULT_RECIPE)]
        recipe: PathBuf,

        #[command(flatten)]
        dev: DevArgs,
    },

    /// Audit an existing rootfs against a recipe
    Verify {
        rootfs: PathBuf,

        #[arg(long, default_value = DEFAULT_RECIPE)]
        recipe: PathBuf,

        #[command(flatten)]
        dev: DevArgs,
    },

    /// List published runs, newest first
    Runs {
        #[arg(long, default_value = DEFAULT_OUTPUT)]
        output: PathBuf,
    },

    /// Drop to the image identity and run an entrypoint
    Exec {
        #[arg(long, default_value = "image-config.json")]
        config: PathBuf,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Args)]
struct DevArgs {
    /// Install development-only packages
    #[arg(long, conflicts_with = "no_dev")]
    dev: bool,

    /// Never install development-only packages
    #[arg(long)]
    no_dev: bool,
}

impl DevArgs {
    fn value(&self) -> Option<bool> {
        match (self.dev, self.no_dev) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Ledger,
    System,
}

impl From<Backend> for BackendKind {
    fn from(value: Backend) -> Self {
        match value {
            Backend::Ledger => BackendKind::Ledger,
            Backend::System => BackendKind::System,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Build {
            recipe,
            output,
            dev,
            backend,
            stage_timeout,
        } => workflows::build(recipe, output, dev.value(), backend.into(), stage_timeout),
        Commands::Plan { recipe, dev } => workflows::plan(&recipe, dev.value()),
        Commands::Verify {
            rootfs,
            recipe,
            dev,
        } => workflows::verify(&rootfs, &recipe, dev.value()),
        Commands::Runs { output } => workflows::list_runs(&output),
        Commands::Exec { config, command } => workflows::exec(&config, &command),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn exit_code(err: &anyhow::Error) -> u8 {
    let code = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<ProvisionError>())
        .map_or(1, ProvisionError::exit_code);
    u8::try_from(code).unwrap_or(1)
}
