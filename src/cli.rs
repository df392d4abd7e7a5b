//! CLI argument parsing for the policy-ingest-worker binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "policy-ingest-worker", about = "Insurance policy spreadsheet ingestion worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker server (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Import one spreadsheet in-process and print the final job record
    Import {
        /// Path to an .xlsx, .xls or .csv file
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_migrate_command_parses() {
        let cli = Cli::parse_from(["policy-ingest-worker", "migrate"]);
        assert!(matches!(cli.command, Some(Command::Migrate)));
    }

    #[test]
    fn test_cli_no_command_defaults_to_none() {
        let cli = Cli::parse_from(["policy-ingest-worker"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_import_takes_file() {
        let cli = Cli::parse_from(["policy-ingest-worker", "import", "policies.xlsx"]);
        match cli.command {
            Some(Command::Import { file }) => assert_eq!(file, PathBuf::from("policies.xlsx")),
            _ => panic!("expected import command"),
        }
    }

    #[test]
    fn test_cli_import_requires_file() {
        assert!(Cli::try_parse_from(["policy-ingest-worker", "import"]).is_err());
    }
}
