//! CLI command definitions and parsing
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "askflow",
    version,
    about = "Question answering over technical documents and business activity data",
    long_about = "Askflow routes each question to technical documents, business activity records or personal \
                  documents, retrieves evidence with hybrid search, picks a model tier and caches the answer. \
                  Business questions are turned into validated query plans and answered with insights."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/askflow/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Configuration profile to apply (e.g. "offline")
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask a question
    Ask {
        /// Question to ask
        question: String,

        /// Conversation session id (defaults to a fresh session)
        #[arg(short, long)]
        session: Option<String>,

        /// Caller user id, enables the personal scope
        #[arg(long)]
        user: Option<String>,

        /// Caller department, enables the department scope
        #[arg(long)]
        department: Option<String>,

        /// Skip classification and answer from this domain
        #[arg(long, value_parser = ["technical", "business", "personal", "mixed"])]
        domain: Option<String>,

        /// Force a model tier
        #[arg(long, value_parser = ["simple", "complex", "business"])]
        tier: Option<String>,

        /// Print the full answer as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a business analysis question directly
    Business {
        /// Business question
        question: String,

        /// Print the full analysis as JSON
        #[arg(long)]
        json: bool,
    },

    /// Describe the business dataset schema
    Schema {
        #[arg(long)]
        json: bool,
    },

    /// Show dataset, index and cache counters
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Reload data sources and invalidate the response cache
    Reload {
        #[arg(value_enum, default_value = "all")]
        target: ReloadTarget,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTarget {
    Index,
    Business,
    All,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show only a specific section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration and lexicon
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Print the configuration file path
    Path,
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
