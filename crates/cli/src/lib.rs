pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "reimburse",
    about = "Reimburse operator CLI",
    long_about = "Manage the expense ledger database, inspect configuration, and query approval queues.",
    after_help = "Examples:\n  reimburse doctor --json\n  reimburse seed\n  reimburse pending --approver user-2"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo company, users, rule and expenses (idempotent)")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, currency provider settings, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "List expenses awaiting a decision from one approver")]
    Pending {
        #[arg(long, help = "Approver user id")]
        approver: String,
    },
    #[command(about = "List a company's expenses that have no approver assigned")]
    Unrouted {
        #[arg(long, help = "Company id")]
        company: String,
    },
    #[command(about = "Summarize a company's ledger by status and category")]
    Summary {
        #[arg(long, help = "Company id")]
        company: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Pending { approver } => commands::views::pending(&approver),
        Command::Unrouted { company } => commands::views::unrouted(&company),
        Command::Summary { company } => commands::views::summary(&company),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
