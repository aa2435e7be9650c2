//! sw: build system and package manager for native software.
//!
//! Subcommands:
//! - `sw build [ref|path ...]` - resolve, install, and build
//! - `sw install <ref ...>` - resolve and install only
//! - `sw remove <ref>` - uninstall a package
//! - `sw list` - show installed packages
//! - `sw uri sw:<verb> [args ...]` - handle a `sw:` protocol invocation

mod cmd;
mod output;

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use sw_lib::build::BuildError;
use sw_lib::resolver::ResolveError;

/// Exit codes: 0 ok, 1 fatal, 2 cancelled, 3 unresolved.
const EXIT_FATAL: u8 = 1;
const EXIT_CANCELLED: u8 = 2;
const EXIT_UNRESOLVED: u8 = 3;

#[derive(Parser)]
#[command(name = "sw")]
#[command(author, version, about = "Build system and package manager for native software")]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Registry base URL
  #[arg(long, global = true)]
  registry: Option<String>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Resolve, install, and build package references and local paths
  Build {
    /// Package references (`org.demo.app@>=1.0`) or local source paths
    #[arg(value_name = "TARGET")]
    targets: Vec<String>,
  },

  /// Resolve and install packages without building
  Install {
    #[arg(value_name = "REF", required = true)]
    packages: Vec<String>,
  },

  /// Uninstall a package (`path@version`)
  Remove {
    #[arg(value_name = "REF")]
    package: String,
  },

  /// List installed packages
  List,

  /// Handle a `sw:` URI invocation (verbs: sdir, install, remove, build)
  Uri {
    #[arg(value_name = "ARG", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(cli.verbose);

  match run(cli) {
    Ok(code) => code,
    Err(err) => {
      // One line plus the cause chain.
      eprintln!("error: {err:#}");
      ExitCode::from(classify(&err))
    }
  }
}

fn run(cli: Cli) -> Result<ExitCode> {
  let registry = cli.registry.clone();
  match cli.command {
    Commands::Build { targets } => cmd::build::run(&targets, registry.as_deref()),
    Commands::Install { packages } => cmd::install::run(&packages, registry.as_deref()),
    Commands::Remove { package } => cmd::remove::run(&package, registry.as_deref()),
    Commands::List => cmd::list::run(registry.as_deref()),
    Commands::Uri { args } => cmd::uri::run(&args, registry.as_deref()),
  }
}

fn classify(err: &anyhow::Error) -> u8 {
  if let Some(build_err) = err.downcast_ref::<BuildError>() {
    return match build_err {
      BuildError::Interrupted => EXIT_CANCELLED,
      BuildError::Resolve(ResolveError::Unresolvable(_)) => EXIT_UNRESOLVED,
      _ => EXIT_FATAL,
    };
  }
  if let Some(ResolveError::Unresolvable(_)) = err.downcast_ref::<ResolveError>() {
    return EXIT_UNRESOLVED;
  }
  EXIT_FATAL
}

fn init_logging(verbose: bool) {
  let level = if std::env::var("SW_TRACE").is_ok_and(|v| !v.is_empty()) {
    Level::TRACE
  } else if verbose || std::env::var("SW_VERBOSE").is_ok_and(|v| !v.is_empty()) {
    Level::DEBUG
  } else {
    Level::INFO
  };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .with_writer(std::io::stderr)
    .init();
}
