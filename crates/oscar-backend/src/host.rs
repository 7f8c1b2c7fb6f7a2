//! The seam between this crate and the external CWL runtime host.
//!
//! The host owns workflow graph traversal, input binding, expression
//! evaluation, and output-schema-aware collection; this crate only needs a
//! small number of hooks into it to run one step. Everything here is a trait
//! or plain data type the host is expected to implement or supply, mirroring
//! how the teacher crate keeps its own execution engine behind a
//! `TaskExecutionBackend` trait rather than depending on a specific runtime.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use indexmap::IndexMap;
use serde_json::Value;

use crate::identity::ToolSpec;

/// The verdict reported back to the host for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// The step's command exited `0` and its outputs were collected.
    Success,
    /// The step failed for any reason recognized by this crate: no cluster
    /// available, a non-zero exit code, or output collection failure.
    PermanentFail,
}

impl StepStatus {
    /// The string the host-facing callback protocol expects.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PermanentFail => "permanentFail",
        }
    }
}

/// A prepared job object, as the host hands it to this crate for one step
/// invocation. Carries everything needed to dispatch without this crate
/// understanding CWL's input-binding or expression-evaluation semantics.
#[derive(Debug, Clone)]
pub struct PreparedJob {
    /// The step's name, used to derive the job id and `CWL_JOB_NAME`.
    pub step_name: String,
    /// The fully-resolved command line to execute remotely.
    pub command: Vec<String>,
    /// Environment variables the host's job preparation already computed
    /// (distinct from the tool's own `EnvVarRequirement`/hints, which this
    /// crate derives itself from `tool_spec`).
    pub env: IndexMap<String, String>,
    /// The tool specification driving service identity and requirements.
    pub tool_spec: ToolSpec,
    /// An optional path, relative to the job's working directory, to
    /// redirect the command's stdout to.
    pub stdout_redirect: Option<String>,
}

/// The host's output-collection hook: given the directory a completed job's
/// outputs were copied to, produces the CWL output object for the step.
///
/// The host owns the output schema (`CommandOutputParameter` bindings,
/// glob/secondary-file resolution); this crate only supplies the directory.
pub trait OutputCollector: Send + Sync {
    /// Collects outputs from `job_output_dir`, returning the CWL output
    /// mapping for the step.
    fn collect(&self, job_output_dir: &Path) -> Result<Value, anyhow::Error>;
}

/// The host's completion callback, invoked once per step with the collected
/// outputs (empty on failure) and the step's verdict.
///
/// Mirrors `output_callback(outputs, status)` from the host's job callback
/// protocol; invoked while [`WorkflowEvalLock`] is held, per spec.
pub trait CompletionCallback: Send + Sync {
    /// Reports a step's outcome to the host.
    fn report(&self, outputs: Value, status: StepStatus);
}

/// A foreign lock owned by the host, serializing the host's workflow state
/// transitions across concurrently-running steps.
///
/// This crate treats it as an opaque mutex with unknown internal scope: it
/// acquires the lock only around the completion callback and performs no
/// I/O while holding it.
#[derive(Debug, Clone, Default)]
pub struct WorkflowEvalLock {
    /// The underlying mutex. The unit payload reflects that this crate does
    /// not interpret whatever state the host associates with the lock.
    inner: Arc<Mutex<()>>,
}

impl WorkflowEvalLock {
    /// Constructs a new, independent lock. Production hosts construct one
    /// lock per workflow run and share it across every concurrently-running
    /// step.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with the lock held.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.inner.lock().expect("workflow eval lock poisoned");
        f()
    }
}

/// The runtime context the host supplies for a workflow run: the shared
/// mount root, the step's local scratch/output directory, and the
/// eval lock.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    /// The shared mount root visible identically to every cluster.
    pub mount_path: PathBuf,
    /// The host's base directory for this step's local scratch area. Not
    /// used to stage files already under `mount_path` (see
    /// [`crate::path`]).
    pub basedir: PathBuf,
    /// The host's designated output directory for this step.
    pub outdir: PathBuf,
    /// The host's workflow evaluation lock.
    pub workflow_eval_lock: WorkflowEvalLock,
}

impl RuntimeContext {
    /// The directory a completed job's outputs are expected to live in:
    /// `<mount_path>/<job_id>/`.
    pub fn job_output_dir(&self, job_id: &str) -> PathBuf {
        self.mount_path.join(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_output_dir_is_mount_relative() {
        let ctx = RuntimeContext {
            mount_path: PathBuf::from("/mnt/cwl-oscar/mount"),
            basedir: PathBuf::from("/home/user/work"),
            outdir: PathBuf::from("/home/user/work/out"),
            workflow_eval_lock: WorkflowEvalLock::new(),
        };
        assert_eq!(
            ctx.job_output_dir("step-1_1700000000"),
            PathBuf::from("/mnt/cwl-oscar/mount/step-1_1700000000")
        );
    }

    #[test]
    fn status_strings_match_host_protocol() {
        assert_eq!(StepStatus::Success.as_str(), "success");
        assert_eq!(StepStatus::PermanentFail.as_str(), "permanentFail");
    }

    #[test]
    fn eval_lock_serializes_callers() {
        let lock = WorkflowEvalLock::new();
        let value = lock.with_lock(|| 1 + 1);
        assert_eq!(value, 2);
    }
}
