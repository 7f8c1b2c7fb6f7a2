//! The `local-runner` subcommand: upload a local CWL workflow and its
//! inputs, submit them to an existing `cwl-oscar` service, wait for
//! completion, and download the results.
//!
//! A faithful translation of the original `local_runner.py`'s
//! `OSCARLocalRunner`: that tool exists because a user may want to run a
//! local workflow against a deployed `cwl-oscar` service without installing
//! the full `cwltool` stack locally. It does not interpret CWL either; it
//! only stages files onto the shared mount and drives the remote service's
//! upload/poll/download protocol.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::bail;
use clap::Args;
use oscar_backend::client::ClusterClient;
use oscar_backend::script;
use tokio::fs;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cli::ClusterArgs;

/// The storage provider every upload and listing in this command targets,
/// matching the cluster-side mount's configured provider.
const MOUNT_STORAGE_PROVIDER: &str = "minio.default";

/// How often to poll the output bucket while waiting for completion.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Uploads a workflow and its inputs, submits them to a `cwl-oscar` service,
/// and downloads the results once the run completes.
#[derive(Args)]
pub struct LocalRunnerCommand {
    /// The single-cluster connection arguments.
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Path to the CWL workflow file to run.
    pub workflow: PathBuf,

    /// Path to the input YAML or JSON file.
    pub input: PathBuf,

    /// The shared mount path the `cwl-oscar` service was deployed with.
    #[clap(long, default_value = "/mnt/cwl-oscar4/mount", value_parser = crate::cli::expand_path)]
    pub mount_path: PathBuf,

    /// The name of the `cwl-oscar` service to submit to.
    #[clap(long, default_value = "cwl-oscar4")]
    pub service_name: String,

    /// Where to write downloaded results.
    #[clap(long, default_value = "./results", value_parser = crate::cli::expand_path)]
    pub output_dir: PathBuf,

    /// The maximum time, in seconds, to wait for the run to complete.
    #[clap(long, default_value_t = 600)]
    pub timeout: u64,

    /// Additional local files to upload alongside the workflow and input.
    #[clap(long, num_args = 0..)]
    pub additional_files: Vec<PathBuf>,
}

impl LocalRunnerCommand {
    /// Executes the `local-runner` subcommand.
    pub async fn exec(self) -> anyhow::Result<()> {
        let descriptor = self.cluster.clone().into_descriptor()?;
        let client = ClusterClient::new(&descriptor)?;

        let storage_path = mount_relative_storage_path(&self.mount_path);

        info!(workflow = %self.workflow.display(), "uploading workflow files");
        let workflow_remote = upload_file_to_mount(&client, &self.workflow, &storage_path).await?;
        let input_remote = upload_file_to_mount(&client, &self.input, &storage_path).await?;
        for extra in &self.additional_files {
            upload_file_to_mount(&client, extra, &storage_path).await?;
        }

        let service = client
            .find_service(&self.service_name)
            .await?
            .with_context(|| format!("service `{}` not found", self.service_name))?;
        let input_binding =
            service.input.first().with_context(|| format!("service `{}` has no input binding", self.service_name))?;
        let output_binding =
            service.output.first().with_context(|| format!("service `{}` has no output binding", self.service_name))?;

        let script_body = build_run_script(&descriptor, &self, &workflow_remote, &input_remote);
        let script_name = format!("cwl_oscar_run_{}.sh", std::process::id());
        let expected_artifact = script::exit_code_artifact_name(&script_name);

        clean_stale_artifact(&client, &output_binding.storage_provider, &output_binding.path, &expected_artifact)
            .await;

        info!(service = %self.service_name, artifact = %expected_artifact, "submitting run script");
        client
            .upload(
                &input_binding.storage_provider,
                &format!("{}/{}", input_binding.path, script_name),
                script_body.into_bytes(),
            )
            .await
            .context("uploading run script")?;

        let exit_code = wait_for_completion(
            &client,
            &output_binding.storage_provider,
            &output_binding.path,
            &expected_artifact,
            Duration::from_secs(self.timeout),
        )
        .await?;

        info!(exit_code, "run finished, downloading results");
        download_results(&client, &output_binding.storage_provider, &output_binding.path, &self.output_dir).await?;

        if exit_code != 0 {
            bail!("workflow failed with exit code {exit_code}");
        }

        Ok(())
    }
}

/// Derives the storage-relative path for `mount_path`, stripping a leading
/// `/mnt` segment: the mount is bind-mounted from the bucket root, so
/// uploads must target the bucket path, not the container-local mount path.
fn mount_relative_storage_path(mount_path: &Path) -> String {
    let mut parts: Vec<&str> = mount_path.to_string_lossy().trim_matches('/').split('/').collect();
    if parts.first() == Some(&"mnt") {
        parts.remove(0);
    }
    parts.join("/")
}

/// Uploads a single local file to the mount's storage path, returning its
/// mount-relative remote path.
async fn upload_file_to_mount(client: &ClusterClient, local_path: &Path, storage_path: &str) -> anyhow::Result<String> {
    if !local_path.exists() {
        bail!("local file not found: {}", local_path.display());
    }

    let basename = local_path
        .file_name()
        .with_context(|| format!("`{}` has no file name", local_path.display()))?
        .to_string_lossy()
        .to_string();

    let bytes = fs::read(local_path).await.with_context(|| format!("reading `{}`", local_path.display()))?;

    debug!(local = %local_path.display(), storage_path, basename, "uploading file");
    client
        .upload(MOUNT_STORAGE_PROVIDER, &format!("{storage_path}/{basename}"), bytes)
        .await
        .with_context(|| format!("uploading `{}`", local_path.display()))?;

    Ok(basename)
}

/// Builds the run script submitted to the `cwl-oscar` service: a faithful
/// translation of `create_run_script`, invoking the service's own installed
/// `cwl-oscar` binary against the now-uploaded workflow and input.
fn build_run_script(
    descriptor: &oscar_backend::registry::ClusterDescriptor,
    cmd: &LocalRunnerCommand,
    workflow_remote: &str,
    input_remote: &str,
) -> String {
    let mut script = String::from("#!/bin/bash\n\n/usr/local/bin/cwl-oscar run \\\n");
    script.push_str(&format!("  --oscar-endpoint {} \\\n", descriptor.endpoint()));

    match descriptor.auth() {
        oscar_backend::registry::ClusterAuth::Token(_) => {
            script.push_str("  --oscar-token \"$CWL_OSCAR_TOKEN\" \\\n");
        }
        oscar_backend::registry::ClusterAuth::Basic { username, .. } => {
            script.push_str(&format!("  --oscar-username {username} \\\n"));
            script.push_str("  --oscar-password \"$CWL_OSCAR_PASSWORD\" \\\n");
        }
    }

    script.push_str(&format!("  --mount-path {} \\\n", cmd.mount_path.display()));
    script.push_str("  --quiet \\\n");
    script.push_str(&format!("  {workflow_remote} \\\n"));
    script.push_str(&format!("  {input_remote}\n"));
    script
}

/// Removes a stale exit-code artifact from a previous run, if present;
/// errors are logged and otherwise ignored, matching the original's
/// best-effort cleanup.
async fn clean_stale_artifact(client: &ClusterClient, provider: &str, out_path: &str, artifact: &str) {
    let listing = match client.list(provider, &format!("{out_path}/")).await {
        Ok(listing) => listing,
        Err(err) => {
            debug!(error = %err, "could not check for stale exit code artifact");
            return;
        }
    };

    for object in listing.iter().filter(|o| o.key.ends_with(artifact)) {
        info!(key = %object.key, "removing stale exit code artifact");
        if let Err(err) = client.delete(provider, &object.key).await {
            warn!(error = %err, key = %object.key, "failed to remove stale artifact");
        }
    }
}

/// Polls the output bucket until the exit-code artifact appears or
/// `timeout` elapses, then downloads and parses it.
async fn wait_for_completion(
    client: &ClusterClient,
    provider: &str,
    out_path: &str,
    artifact: &str,
    timeout: Duration,
) -> anyhow::Result<i32> {
    let deadline = Instant::now() + timeout;
    info!(timeout_secs = timeout.as_secs(), "waiting for workflow completion");

    loop {
        match client.list(provider, &format!("{out_path}/")).await {
            Ok(listing) => {
                if let Some(found) = listing.iter().find(|o| o.key.ends_with(artifact)) {
                    info!(key = %found.key, "found completion artifact");
                    return download_and_parse_exit_code(client, provider, out_path, &found.key).await;
                }
            }
            Err(err) => debug!(error = %err, "error checking for completion"),
        }

        if Instant::now() >= deadline {
            bail!("workflow timed out after {} seconds", timeout.as_secs());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Downloads the exit-code artifact and parses its contents, reconstructing
/// the full remote path the way the original strips a leading `out/` prefix
/// from the listed key before combining it with the service's configured
/// output path.
async fn download_and_parse_exit_code(
    client: &ClusterClient,
    provider: &str,
    out_path: &str,
    listed_key: &str,
) -> anyhow::Result<i32> {
    let file_only = listed_key.strip_prefix("out/").unwrap_or(listed_key);
    let full_path = format!("{out_path}/{file_only}");

    let bytes = client
        .download(provider, &full_path)
        .await
        .context("downloading exit code artifact")?
        .with_context(|| format!("exit code artifact `{full_path}` listed but not downloadable"))?;

    let text = String::from_utf8_lossy(&bytes);
    let trimmed = text.trim();
    info!(content = trimmed, "exit code artifact content");

    trimmed.parse::<i32>().with_context(|| format!("invalid exit code content: `{trimmed}`"))
}

/// Downloads every object under the output path (other than the exit-code
/// artifact) into `output_dir`, preserving the relative structure below
/// `out_path`.
async fn download_results(client: &ClusterClient, provider: &str, out_path: &str, output_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(output_dir).await.with_context(|| format!("creating `{}`", output_dir.display()))?;

    let listing = client.list(provider, &format!("{out_path}/")).await.context("listing results")?;
    for object in listing.iter().filter(|o| !o.key.ends_with(".exit_code")) {
        let file_only = object.key.strip_prefix("out/").unwrap_or(&object.key);
        let remote_path = format!("{out_path}/{file_only}");

        let bytes = match client.download(provider, &remote_path).await.context("downloading result file")? {
            Some(bytes) => bytes,
            None => {
                warn!(key = %object.key, "listed result object not downloadable, skipping");
                continue;
            }
        };

        let basename = Path::new(file_only).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| file_only.to_string());
        let local_path = output_dir.join(&basename);
        info!(key = %object.key, local = %local_path.display(), "downloading result file");
        fs::write(&local_path, bytes).await.with_context(|| format!("writing `{}`", local_path.display()))?;
    }

    Ok(())
}
