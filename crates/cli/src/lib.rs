pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "skipper",
    about = "Skipper operator CLI",
    long_about = "Operate Skipper migrations, config inspection, readiness checks, and \
                  manual autopilot triggers.",
    after_help = "Examples:\n  skipper doctor --json\n  skipper config\n  skipper enqueue --user-id user-1 --key demo"
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
    #[command(about = "Validate config, model provider settings, and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Enqueue an outbox event that triggers an autopilot run")]
    Enqueue {
        #[arg(long, help = "User the autopilot run acts on behalf of")]
        user_id: String,
        #[arg(long, help = "Identifier of the triggering entity; part of the dedup key")]
        key: String,
        #[arg(long, default_value = "manual", help = "Outbox event type")]
        event_type: String,
        #[arg(long, help = "Extra JSON object merged into the event payload")]
        payload: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Enqueue { user_id, key, event_type, payload } => {
            commands::enqueue::run(&user_id, &key, &event_type, payload.as_deref())
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
