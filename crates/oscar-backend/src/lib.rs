//! The OSCAR execution backend: dispatches CWL `CommandLineTool` steps to a
//! fleet of OSCAR remote function-execution clusters.
//!
//! The workflow engine itself — CWL parsing, graph traversal, input
//! binding, expression evaluation, and output-schema-aware collection — is
//! an external collaborator. This crate covers only what happens once the
//! host has a prepared command and tool specification for a single step:
//! materializing a matching remote service, transporting the command,
//! waiting for completion, and recovering the exit status and outputs.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod identity;
pub mod orchestrator;
pub mod path;
pub mod registry;
pub mod script;
pub mod service;

pub use error::Error;
pub use orchestrator::TaskOrchestrator;
pub use registry::ClusterRegistry;
