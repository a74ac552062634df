pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "leavegate",
    about = "Leavegate operator CLI",
    long_about = "Operate the leave admission engine: migrations, roster seeding, event replay, ledger compaction, and dead-letter review.",
    after_help = "Examples:\n  leavegate seed --employees 25 --allowance 20\n  leavegate replay --file events.jsonl\n  leavegate doctor --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Onboard a deterministic roster of employees with equal entitlements")]
    Seed {
        #[arg(long, default_value_t = 25, help = "Number of employees to onboard")]
        employees: u32,
        #[arg(long, default_value_t = 20, help = "Annual allowance in days per employee")]
        allowance: u32,
    },
    #[command(about = "Run the admission consumer over a newline-delimited JSON event file")]
    Replay {
        #[arg(long, help = "Path to the replay file")]
        file: PathBuf,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, publisher wiring, DB connectivity and schema state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Purge completed idempotency entries past their retention window")]
    CompactLedger,
    #[command(about = "List unresolved dead-lettered events, oldest first")]
    DeadLetters {
        #[arg(long, default_value_t = commands::dead_letters::DEFAULT_LIMIT)]
        limit: u32,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed { employees, allowance } => commands::seed::run(employees, allowance),
        Command::Replay { file } => commands::replay::run(&file),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::CompactLedger => commands::compact_ledger::run(),
        Command::DeadLetters { limit } => commands::dead_letters::run(limit),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
