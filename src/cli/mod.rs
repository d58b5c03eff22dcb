//! CLI module for draftwright - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for serving the endpoint,
//! one-off generation, and rule pack checks.

pub mod commands;

pub use commands::Cli;
