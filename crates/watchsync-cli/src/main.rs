use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use commands::{clear, config, sync, users};
use std::path::PathBuf;
use watchsync_config::{PathManager, Role};

mod commands;
mod logging;
mod output;

#[derive(Parser)]
#[command(name = "watchsync")]
#[command(about = "Carry per-user watch state from one media server to another")]
#[command(version)]
struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[arg(long, global = true, default_value = "human", value_enum)]
    output: output::OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Selection flags shared by every run command; they replace the `[sync]` values from the config.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Only process this user (repeatable, case-insensitive)
    #[arg(long, value_name = "NAME")]
    pub user: Vec<String>,

    /// Only process this section, by key or title (repeatable)
    #[arg(long, value_name = "SECTION")]
    pub section: Vec<String>,

    /// Users processed concurrently
    #[arg(long)]
    pub workers: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(long_about = "Read every selected user's watch state from the source server and write it to the snapshot file.")]
    Export {
        /// Snapshot file to write (default: sync.snapshot from the config)
        #[arg(long)]
        snapshot: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },
    #[command(long_about = "Apply a snapshot file to the destination server. Items are matched by identifier first, then by normalized title and year.")]
    Import {
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Plan the changes without sending them
        #[arg(long, action = ArgAction::SetTrue)]
        dry_run: bool,

        #[command(flatten)]
        run: RunArgs,
    },
    #[command(long_about = "Export from the source, then import into the destination, through the snapshot file.")]
    Sync {
        #[arg(long)]
        snapshot: Option<PathBuf>,

        #[arg(long, action = ArgAction::SetTrue)]
        dry_run: bool,

        #[command(flatten)]
        run: RunArgs,
    },
    #[command(long_about = "List the sections and users of one server and which of them the configured filters select.")]
    Users {
        #[arg(long, value_enum, default_value = "source")]
        role: ServerRole,
    },
    #[command(long_about = "Show or create the configuration file.")]
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
    #[command(long_about = "Clear cached data or stored credentials. Use --cache for the identity and listing cache, --credentials for stored tokens, or --all for both.")]
    Clear {
        #[arg(long, action = ArgAction::SetTrue)]
        all: bool,

        #[arg(long, action = ArgAction::SetTrue)]
        cache: bool,

        #[arg(long, action = ArgAction::SetTrue)]
        credentials: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    #[command(long_about = "Display the current configuration. Tokens are masked unless --full is given.")]
    Show {
        #[arg(long, action = ArgAction::SetTrue)]
        full: bool,
    },
    /// Write a commented config template
    Init {
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Print where config, data, cache and logs live
    Path,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ServerRole {
    Source,
    Destination,
}

impl From<ServerRole> for Role {
    fn from(role: ServerRole) -> Self {
        match role {
            ServerRole::Source => Role::Source,
            ServerRole::Destination => Role::Destination,
        }
    }
}

impl Commands {
    /// Role whose configured log file this command writes to.
    fn log_role(&self) -> Option<Role> {
        match self {
            Commands::Export { .. } | Commands::Sync { .. } => Some(Role::Source),
            Commands::Import { .. } => Some(Role::Destination),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // A broken config is reported by the command itself; logging just falls back to defaults.
    let paths = PathManager::default();
    let settings = config::load_config(&paths).unwrap_or_default();
    let log_file = cli
        .command
        .log_role()
        .and_then(|role| settings.log_file(role))
        .map(|path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                paths.log_dir().join(path)
            }
        });
    logging::init_logging(cli.verbose, cli.quiet, settings.logging.debug, log_file.as_deref())
        .map_err(|e| color_eyre::eyre::eyre!("{}", e))?;

    let output = output::Output::new(cli.output, cli.quiet);

    let exit_code = match cli.command {
        Commands::Export { snapshot, run } => sync::run_export(run, snapshot, &output).await?,
        Commands::Import { snapshot, dry_run, run } => sync::run_import(run, snapshot, dry_run, &output).await?,
        Commands::Sync { snapshot, dry_run, run } => sync::run_sync(run, snapshot, dry_run, &output).await?,
        Commands::Users { role } => {
            users::run_users(role.into(), &output).await?;
            0
        }
        Commands::Config { cmd } => {
            config::run_config(cmd, &output).await?;
            0
        }
        Commands::Clear { all, cache, credentials } => {
            clear::run_clear(all, cache, credentials, &output).await?;
            0
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
