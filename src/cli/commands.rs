//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - serve: run the HTTP endpoint
//! - generate: run one request locally and print its frames
//! - check-pack: load and self-validate a rule pack
//! - validate: check a markdown file against a rule pack

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Draftwright - streams rule-validated, self-healing document drafts
#[derive(Parser, Debug)]
#[command(name = "draftwright")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    pub log_stderr: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the generate endpoint over HTTP
    Serve {
        /// Address to bind, overriding the config
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate a document from a specification file
    Generate {
        /// Specification text file
        #[arg(short, long)]
        spec: PathBuf,

        /// Attempt budget (clamped to 1..=5)
        #[arg(short = 'n', long)]
        max_attempts: Option<u32>,

        /// Print raw NDJSON frames instead of a readable transcript
        #[arg(long)]
        ndjson: bool,
    },

    /// Load a rule pack and report its identity
    CheckPack {
        /// Rule pack JSON; the configured or bundled pack when omitted
        #[arg(short, long)]
        pack: Option<PathBuf>,
    },

    /// Validate a markdown document against a rule pack
    Validate {
        /// Document to check
        file: PathBuf,

        /// Rule pack JSON; the configured or bundled pack when omitted
        #[arg(short, long)]
        pack: Option<PathBuf>,
    },
}
