pub mod commands;
pub mod logging;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use despacho_core::config::{AppConfig, LoadOptions};

#[derive(Debug, Parser)]
#[command(
    name = "despacho",
    about = "Despacho operator CLI",
    long_about = "Inspect configuration, apply migrations, check readiness, and manage pending actions of the conversation dispatch engine.",
    after_help = "Examples:\n  despacho doctor --json\n  despacho config\n  despacho pending list --session whatsapp:+5511999990000"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, model settings, DB connectivity and schema state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Inspect or clear actions awaiting user confirmation")]
    Pending {
        #[command(subcommand)]
        command: PendingCommand,
    },
}

#[derive(Debug, Subcommand)]
enum PendingCommand {
    #[command(about = "List pending actions of a session in confirmation priority order")]
    List {
        #[arg(long, help = "Session identifier")]
        session: String,
    },
    #[command(about = "Delete every pending action of a session without executing it")]
    Clear {
        #[arg(long, help = "Session identifier")]
        session: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    // Commands report config failures themselves; logging is best effort.
    if let Ok(config) = AppConfig::load(LoadOptions::default()) {
        if let Err(error) = logging::init_logging(&config) {
            eprintln!("{error:#}");
        }
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Pending { command: PendingCommand::List { session } } => {
            commands::pending::list(&session)
        }
        Command::Pending { command: PendingCommand::Clear { session } } => {
            commands::pending::clear(&session)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
