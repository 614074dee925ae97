//! Portcullis CLI - run and administer the Portcullis access gateway.

mod commands;
mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use portcullis_core::config::LogFormat;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use commands::config::ConfigAction;
use commands::serve::ServeArgs;
use commands::users::UsersAction;

#[derive(Parser)]
#[command(name = "portcullis")]
#[command(about = "Portcullis - self-hosted access gateway")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.portcullis/portcullis.json)
    #[arg(short, long, global = true, env = "PORTCULLIS_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Issue cookies without the Secure flag
        #[arg(long)]
        debug: bool,
    },

    /// Local account management
    Users {
        #[command(subcommand)]
        action: UsersCommands,
    },

    /// Configuration inspection and editing
    Config {
        #[command(subcommand)]
        action: Option<ConfigCommands>,
    },

    /// Token key management
    Key {
        #[command(subcommand)]
        action: KeyCommands,
    },

    /// Check whether a host name is served by this gateway
    CheckHost {
        /// Host name, optionally with a port
        host: String,
    },
}

#[derive(Subcommand)]
enum UsersCommands {
    /// Create or update an account
    Add {
        /// Login name
        login: String,

        /// Password (prompted for when omitted)
        #[arg(long)]
        password: Option<String>,

        /// Generate a random password
        #[arg(long, conflicts_with = "password")]
        generate_password: bool,

        /// Role to grant; repeat for several
        #[arg(short, long = "role")]
        roles: Vec<String>,
    },

    /// List accounts
    List,

    /// Remove an account
    Remove {
        /// Account id
        id: i64,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Validate the configuration file
    Validate,

    /// Print the configuration file location
    Path,

    /// Get a configuration value
    Get {
        /// Configuration key (e.g., gateway.port)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., gateway.port)
        key: String,

        /// Value to set
        value: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate the token key
    Generate {
        /// Replace an existing key, invalidating all tokens
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_file = cli.config.as_deref();

    // A broken config is reported by the command itself.
    let log_format = commands::load_config(config_file)
        .map(|c| c.settings.log_format)
        .unwrap_or_default();
    init_tracing(cli.verbose, log_format);

    match cli.command {
        Commands::Serve { port, bind, debug } => {
            commands::run_serve(config_file, ServeArgs { port, bind, debug }).await?;
        }

        Commands::Users { action } => {
            let action = match action {
                UsersCommands::Add {
                    login,
                    password,
                    generate_password,
                    roles,
                } => UsersAction::Add {
                    login,
                    password,
                    generate_password,
                    roles,
                },
                UsersCommands::List => UsersAction::List,
                UsersCommands::Remove { id, yes } => UsersAction::Remove { id, yes },
            };
            commands::run_users(config_file, action)?;
        }

        Commands::Config { action } => {
            let action = match action {
                None | Some(ConfigCommands::Show) => ConfigAction::Show,
                Some(ConfigCommands::Validate) => ConfigAction::Validate,
                Some(ConfigCommands::Path) => ConfigAction::Path,
                Some(ConfigCommands::Get { key }) => ConfigAction::Get(key),
                Some(ConfigCommands::Set { key, value }) => ConfigAction::Set(key, value),
            };
            commands::run_config(config_file, action)?;
        }

        Commands::Key { action } => match action {
            KeyCommands::Generate { force } => {
                if force && !ui::prompts::confirm("Replace the token key and sign everyone out?")? {
                    ui::info("Cancelled");
                    return Ok(());
                }
                commands::run_key(config_file, force)?;
            }
        },

        Commands::CheckHost { host } => {
            commands::run_check_host(config_file, &host).await?;
        }
    }

    Ok(())
}
