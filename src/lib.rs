//! `cwl-oscar`: a command line harness around the `oscar-backend` execution
//! library.
//!
//! The library crate (`oscar-backend`) does the actual cluster dispatch;
//! this binary crate only owns the CLI surface, configuration loading, and
//! logging setup, plus a `local-runner` utility that can stage a workflow
//! onto an already-deployed service without any CWL engine involved at all.

pub mod cli;
pub mod commands;
pub mod config;
pub mod fs_collector;
pub mod logging;

pub use cli::Cli;
pub use cli::Command;
