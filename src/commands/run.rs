//! The `run` subcommand: dispatches a single, already-prepared CWL step.
//!
//! This binary does not embed a CWL engine (graph traversal, input binding,
//! and expression evaluation are explicitly an external host's job — see
//! `oscar_backend::host`); `run` is a thin harness that reads a tool
//! specification and a prepared job description from disk, drives the
//! backend for that one step, and prints the collected outputs to stdout as
//! JSON, the way a host's `output_callback` would receive them.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use anyhow::bail;
use clap::Args;
use indexmap::IndexMap;
use oscar_backend::TaskOrchestrator;
use oscar_backend::host::CompletionCallback;
use oscar_backend::host::PreparedJob;
use oscar_backend::host::RuntimeContext;
use oscar_backend::host::StepStatus;
use oscar_backend::host::WorkflowEvalLock;
use oscar_backend::identity::ToolSpec;
use oscar_backend::registry::ClusterRegistry;
use serde::Deserialize;
use serde_json::Value;

use crate::cli::ClusterArgs;
use crate::fs_collector::WalkingOutputCollector;

/// Dispatches a single prepared CWL step to an OSCAR cluster.
#[derive(Args)]
pub struct RunCommand {
    /// The single-cluster connection arguments; ignored when `--config` is
    /// given.
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// A TOML configuration file describing one or more clusters and the
    /// dispatch tunables; when given, overrides the single-cluster flags.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// The shared mount path visible identically to every cluster.
    #[clap(long, default_value = "/mnt/cwl-oscar/mount", value_parser = crate::cli::expand_path)]
    pub mount_path: PathBuf,

    /// The host's base directory for this step's local scratch area.
    #[clap(long, value_parser = crate::cli::expand_path)]
    pub basedir: Option<PathBuf>,

    /// The output directory to report to the host context.
    #[clap(long, default_value = ".", value_parser = crate::cli::expand_path)]
    pub outdir: PathBuf,

    /// Path to a JSON file holding the CWL tool specification (`class`,
    /// `baseCommand`, `requirements`, `hints`).
    #[clap(long)]
    pub tool_spec: PathBuf,

    /// Path to a JSON file holding the prepared job (`step_name`, `command`,
    /// `env`, `stdout_redirect`).
    #[clap(long)]
    pub job: PathBuf,
}

/// The on-disk shape of a prepared job, as a host would otherwise construct
/// in-process.
#[derive(Deserialize)]
struct JobFile {
    /// The step's name.
    step_name: String,
    /// The fully-resolved command line.
    command: Vec<String>,
    /// Environment variables the host's own job preparation computed.
    #[serde(default)]
    env: IndexMap<String, String>,
    /// An optional stdout redirect path, relative to the job's working
    /// directory.
    #[serde(default)]
    stdout_redirect: Option<String>,
}

/// Collects a single step's outcome so `exec` can act on it once
/// [`TaskOrchestrator::run_step`] returns.
struct RecordingCallback {
    /// The reported outcome, `None` until `report` is called.
    result: Mutex<Option<(Value, StepStatus)>>,
}

impl CompletionCallback for RecordingCallback {
    fn report(&self, outputs: Value, status: StepStatus) {
        *self.result.lock().expect("recording callback mutex poisoned") = Some((outputs, status));
    }
}

impl RunCommand {
    /// Executes the `run` subcommand.
    pub async fn exec(self) -> anyhow::Result<()> {
        let (registry, create_settings, poll_settings, shared_minio) = match self.config {
            Some(path) => {
                let config = crate::config::load(&path)?;
                (
                    config.build_registry()?,
                    config.create_settings(),
                    config.poll_settings(),
                    config.mount_settings().shared_minio,
                )
            }
            None => {
                let registry = ClusterRegistry::new();
                registry.add(self.cluster.into_descriptor()?);
                (registry, Default::default(), Default::default(), None)
            }
        };

        let tool_spec_value: Value = read_json(&self.tool_spec)?;
        let tool_spec = ToolSpec::from_value(&tool_spec_value);

        let job: JobFile = read_json(&self.job)?;
        let prepared_job = PreparedJob {
            step_name: job.step_name.clone(),
            command: job.command,
            env: job.env,
            tool_spec,
            stdout_redirect: job.stdout_redirect,
        };

        let basedir = match self.basedir {
            Some(basedir) => basedir,
            None => std::env::current_dir().context("resolving current directory as basedir")?,
        };
        let ctx = RuntimeContext {
            mount_path: self.mount_path,
            basedir,
            outdir: self.outdir,
            workflow_eval_lock: WorkflowEvalLock::new(),
        };

        let callback = Arc::new(RecordingCallback { result: Mutex::new(None) });
        let mut orchestrator = TaskOrchestrator::with_settings(
            Arc::new(registry),
            Arc::new(WalkingOutputCollector),
            callback.clone(),
            create_settings,
            poll_settings,
        );
        if let Some(shared_minio) = shared_minio {
            orchestrator = orchestrator.with_shared_minio(shared_minio);
        }

        orchestrator.run_step(&job.step_name, prepared_job, &ctx).await;

        let (outputs, status) = callback
            .result
            .lock()
            .expect("recording callback mutex poisoned")
            .take()
            .expect("orchestrator always reports exactly once");

        println!("{}", serde_json::to_string_pretty(&outputs)?);

        if status == StepStatus::PermanentFail {
            bail!("step `{}` failed", job.step_name);
        }

        Ok(())
    }
}

/// Reads and parses a JSON file, wrapping I/O and parse errors with the
/// path for context.
fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading `{}`", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing `{}` as JSON", path.display()))
}
