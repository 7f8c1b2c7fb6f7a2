//! Subcommand implementations.

pub mod local_runner;
pub mod run;

pub use local_runner::LocalRunnerCommand;
pub use run::RunCommand;
