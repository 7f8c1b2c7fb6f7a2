//! The task orchestrator: bridges the host's job callback protocol to the
//! registry, service manager, and job dispatcher.

use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde_json::Value;
use tracing::error;
use tracing::info;

use crate::client::ClusterClient;
use crate::dispatcher;
use crate::dispatcher::JobInvocation;
use crate::dispatcher::PollSettings;
use crate::error::Error;
use crate::host::CompletionCallback;
use crate::host::OutputCollector;
use crate::host::RuntimeContext;
use crate::host::StepStatus;
use crate::identity;
use crate::identity::ToolSpec;
use crate::registry::ClusterRegistry;
use crate::service::CreateSettings;
use crate::service::MountSettings;
use crate::service::ServiceManager;

/// The environment variable the orchestrator always injects naming the
/// step.
const ENV_JOB_NAME: &str = "CWL_JOB_NAME";

/// The environment variable the orchestrator always injects naming the
/// shared mount root.
const ENV_MOUNT_PATH: &str = "CWL_MOUNT_PATH";

/// Runs one CWL step: selects a cluster, ensures a matching service exists,
/// dispatches the job, collects outputs, and reports the verdict to the
/// host under its evaluation lock.
///
/// One [`ServiceManager`] is constructed implicitly per call via the shared
/// `registry`'s per-cluster manager set (see [`ClusterRegistry`]); the
/// per-step construction of a fresh [`ClusterClient`] localizes HTTP
/// connection state to the invoking call, matching the source's practice of
/// instantiating a client per step.
pub struct TaskOrchestrator {
    /// The shared cluster registry.
    registry: Arc<ClusterRegistry>,
    /// The host's output collector.
    collector: Arc<dyn OutputCollector>,
    /// The host's completion callback.
    callback: Arc<dyn CompletionCallback>,
    /// Per-cluster service managers, indexed by cluster name so that each
    /// cluster's creation cache is independent and long-lived across steps.
    managers: manager_registry::ManagerMap,
    /// Service-creation retry/backoff tunables.
    create_settings: CreateSettings,
    /// Upload/poll/download tunables.
    poll_settings: PollSettings,
    /// An alternate MinIO backing the shared mount, if configured; `None`
    /// means the mount is served by the same provider as input/output
    /// buckets (spec.md §9 open question 2).
    shared_minio: Option<crate::service::SharedMinioCreds>,
}

impl TaskOrchestrator {
    /// Constructs a new orchestrator bound to a shared registry and the
    /// host's output/callback hooks, using default tunables (spec.md §6).
    pub fn new(
        registry: Arc<ClusterRegistry>,
        collector: Arc<dyn OutputCollector>,
        callback: Arc<dyn CompletionCallback>,
    ) -> Self {
        Self::with_settings(registry, collector, callback, CreateSettings::default(), PollSettings::default())
    }

    /// Constructs a new orchestrator with explicit service-creation and
    /// polling tunables, e.g. as loaded from [`crate::config::Config`].
    pub fn with_settings(
        registry: Arc<ClusterRegistry>,
        collector: Arc<dyn OutputCollector>,
        callback: Arc<dyn CompletionCallback>,
        create_settings: CreateSettings,
        poll_settings: PollSettings,
    ) -> Self {
        Self {
            registry,
            collector,
            callback,
            managers: manager_registry::ManagerMap::new(),
            create_settings,
            poll_settings,
            shared_minio: None,
        }
    }

    /// Configures a distinct MinIO backing the shared mount; every service
    /// this orchestrator creates from then on carries a
    /// `storage_providers.minio.shared` override pointing at it instead of
    /// the cluster's default provider.
    pub fn with_shared_minio(mut self, shared_minio: crate::service::SharedMinioCreds) -> Self {
        self.shared_minio = Some(shared_minio);
        self
    }

    /// Runs a single step to completion, reporting the verdict to the host.
    pub async fn run_step(&self, step_name: &str, job: crate::host::PreparedJob, ctx: &RuntimeContext) {
        let (outputs, status) = self.run_step_inner(step_name, job, ctx).await;
        ctx.workflow_eval_lock.with_lock(|| {
            self.callback.report(outputs, status);
        });
    }

    /// The fallible body of [`Self::run_step`], factored out so the
    /// host callback is invoked exactly once regardless of outcome.
    async fn run_step_inner(
        &self,
        step_name: &str,
        job: crate::host::PreparedJob,
        ctx: &RuntimeContext,
    ) -> (Value, StepStatus) {
        let job_id = dispatcher::job_id(step_name, unix_now());
        info!(job_id, step_name, "starting step");

        let cluster = match self.registry.next() {
            Some(cluster) => cluster,
            None => {
                error!(job_id, "no OSCAR clusters configured");
                return (Value::Object(Default::default()), StepStatus::PermanentFail);
            }
        };

        let client = match ClusterClient::new(&cluster) {
            Ok(client) => client,
            Err(err) => {
                error!(job_id, cluster = cluster.name(), error = %err, "failed to build cluster client");
                return (Value::Object(Default::default()), StepStatus::PermanentFail);
            }
        };

        let requirements = identity::derive_requirements(&job.tool_spec);
        let service_identity = identity::service_identity(&job.tool_spec, Some(step_name), &requirements);

        let mount = MountSettings {
            mount_path: ctx.mount_path.clone(),
            shared_minio: self.shared_minio.clone(),
        };

        let manager = self.managers.get_or_insert(cluster.name());
        if let Err(err) = manager
            .ensure_service(&client, &cluster, &service_identity, &requirements, &mount, &self.create_settings)
            .await
        {
            error!(job_id, cluster = cluster.name(), error = %err, "service manager failed");
            return (Value::Object(Default::default()), StepStatus::PermanentFail);
        }

        let mut env = indexmap::IndexMap::new();
        env.insert(ENV_JOB_NAME.to_string(), step_name.to_string());
        env.insert(ENV_MOUNT_PATH.to_string(), ctx.mount_path.display().to_string());
        for (k, v) in &requirements.env_vars {
            env.insert(k.clone(), v.clone());
        }
        for (k, v) in &job.env {
            env.insert(k.clone(), v.clone());
        }

        let invocation = JobInvocation {
            job_id: &job_id,
            command: &job.command,
            env: &env,
            stdout_redirect: job.stdout_redirect.as_deref(),
        };

        let exit_code = dispatcher::execute(&client, &service_identity, invocation, &self.poll_settings).await;
        if exit_code != 0 {
            error!(job_id, exit_code, "step command failed");
            return (Value::Object(Default::default()), StepStatus::PermanentFail);
        }

        self.collect_outputs(&job_id, ctx)
    }

    /// Collects outputs from the shared mount for a completed job, treating
    /// a missing directory or a collection error as `permanentFail`, never
    /// partial output.
    fn collect_outputs(&self, job_id: &str, ctx: &RuntimeContext) -> (Value, StepStatus) {
        let output_dir = ctx.job_output_dir(job_id);
        if !output_dir.is_dir() {
            error!(
                job_id,
                path = %output_dir.display(),
                error = %Error::OutputDirMissing { job_id: job_id.to_string() },
                "output directory missing from shared mount"
            );
            return (Value::Object(Default::default()), StepStatus::PermanentFail);
        }

        match self.collector.collect(&output_dir) {
            Ok(outputs) => (outputs, StepStatus::Success),
            Err(err) => {
                error!(job_id, error = %err, "output collection failed");
                (Value::Object(Default::default()), StepStatus::PermanentFail)
            }
        }
    }
}

/// The current Unix time in whole seconds.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs()
}

/// A minimal per-cluster service manager registry.
///
/// Kept as its own small module rather than folded into [`TaskOrchestrator`]
/// so its locking is easy to audit in isolation: one [`ServiceManager`] is
/// created lazily per distinct cluster name and reused for the orchestrator's
/// lifetime, giving every cluster its own long-lived creation cache per
/// design note §9 ("a systems-language implementation may introduce a single
/// long-lived Service Manager per cluster").
mod manager_registry {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex;

    use crate::service::ServiceManager;

    /// A mutex-guarded map from cluster name to its service manager.
    #[derive(Default)]
    pub struct ManagerMap {
        /// The underlying map.
        inner: Mutex<HashMap<String, Arc<ServiceManager>>>,
    }

    impl ManagerMap {
        /// Constructs an empty map.
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns the manager for `cluster_name`, creating it if absent.
        pub fn get_or_insert(&self, cluster_name: &str) -> Arc<ServiceManager> {
            let mut inner = self.inner.lock().expect("manager map mutex poisoned");
            inner
                .entry(cluster_name.to_string())
                .or_insert_with(|| Arc::new(ServiceManager::new()))
                .clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;
    use crate::registry::ClusterRegistry;

    struct RecordingCallback {
        calls: Mutex<Vec<StepStatus>>,
    }

    impl CompletionCallback for RecordingCallback {
        fn report(&self, _outputs: Value, status: StepStatus) {
            self.calls.lock().unwrap().push(status);
        }
    }

    struct NullCollector;
    impl OutputCollector for NullCollector {
        fn collect(&self, _job_output_dir: &Path) -> Result<Value, anyhow::Error> {
            Ok(Value::Object(Default::default()))
        }
    }

    #[tokio::test]
    async fn empty_registry_yields_permanent_fail() {
        let registry = Arc::new(ClusterRegistry::new());
        let callback = Arc::new(RecordingCallback { calls: Mutex::new(Vec::new()) });
        let orchestrator = TaskOrchestrator::new(registry, Arc::new(NullCollector), callback.clone());

        let job = crate::host::PreparedJob {
            step_name: "step-1".to_string(),
            command: vec!["echo".to_string(), "hi".to_string()],
            env: indexmap::IndexMap::new(),
            tool_spec: ToolSpec {
                class: "CommandLineTool".to_string(),
                base_command: vec!["echo".to_string()],
                requirements: vec![],
                hints: vec![],
            },
            stdout_redirect: None,
        };
        let ctx = RuntimeContext {
            mount_path: PathBuf::from("/mnt/cwl-oscar/mount"),
            basedir: PathBuf::from("/tmp"),
            outdir: PathBuf::from("/tmp/out"),
            workflow_eval_lock: crate::host::WorkflowEvalLock::new(),
        };

        orchestrator.run_step("step-1", job, &ctx).await;
        assert_eq!(callback.calls.lock().unwrap().as_slice(), [StepStatus::PermanentFail]);
    }
}
