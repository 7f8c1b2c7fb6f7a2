//! The job dispatcher: packages a command as a shell script, uploads it,
//! waits for completion, and recovers the exit code.

use std::time::Duration;
use std::time::Instant;

use indexmap::IndexMap;
use tempfile::TempDir;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::ClusterClient;
use crate::error::Error;
use crate::identity::ToolSpec;
use crate::script;
use crate::service;

/// The wall-clock deadline for the exit-code artifact to appear in the
/// output bucket.
pub const POLL_DEADLINE: Duration = Duration::from_secs(300);

/// How often the dispatcher checks the output bucket for the exit-code
/// artifact.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The exit code returned for any dispatcher-level failure (upload timeout,
/// missing artifact, and so on), distinguished from the command's own exit
/// status only by the accompanying error log.
pub const DISPATCH_FAILURE_EXIT_CODE: i32 = 1;

/// The tunables governing the upload/poll/download protocol, overridable from
/// [`crate::config::Config`]; defaults match spec.md §6's constant table.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// The wall-clock deadline for the exit-code artifact to appear.
    pub deadline: Duration,
    /// How often to check the output bucket for the artifact.
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            deadline: POLL_DEADLINE,
            interval: POLL_INTERVAL,
        }
    }
}

/// A prepared job invocation, as assembled by the orchestrator from the
/// host's job object.
pub struct JobInvocation<'a> {
    /// The job's identifier, `<step-name>_<unix-seconds>`.
    pub job_id: &'a str,
    /// The command to run, as argv.
    pub command: &'a [String],
    /// Environment variables to export before running the command.
    pub env: &'a IndexMap<String, String>,
    /// An optional path (relative to the job's working directory) to
    /// redirect the command's stdout and stderr to.
    pub stdout_redirect: Option<&'a str>,
}

/// Dispatches one job invocation against the service matching `tool_spec`'s
/// identity, returning the command's exit code.
///
/// A dispatcher-level failure (upload, polling, download, or artifact
/// parsing beyond tolerance) is logged and reported as exit code
/// [`DISPATCH_FAILURE_EXIT_CODE`]; only the artifact's own numeric content,
/// when present and well-formed, is returned otherwise.
pub async fn execute(client: &ClusterClient, identity: &str, job: JobInvocation<'_>, settings: &PollSettings) -> i32 {
    match try_execute(client, identity, &job, settings).await {
        Ok(exit_code) => exit_code,
        Err(err) => {
            warn!(job_id = job.job_id, error = %err, "dispatch failed");
            DISPATCH_FAILURE_EXIT_CODE
        }
    }
}

/// The fallible core of [`execute`], factored out so the temp directory
/// cleanup in [`execute`]'s caller is unconditional regardless of where this
/// returns.
async fn try_execute(
    client: &ClusterClient,
    identity: &str,
    job: &JobInvocation<'_>,
    settings: &PollSettings,
) -> Result<i32, Error> {
    let _scratch = TempDir::new().map_err(|e| Error::Upload {
        job_id: job.job_id.to_string(),
        source: e.into(),
    })?;

    let (in_provider, in_path) = service::input_path(identity);
    let (out_provider, out_path) = service::output_path(identity);

    let script_basename = format!("{job_id}.sh", job_id = job.job_id);
    let script_body = script::build_script(job.job_id, job.env, job.command, job.stdout_redirect);

    info!(job_id = job.job_id, identity, "uploading job script");
    client
        .upload(in_provider, &format!("{in_path}/{script_basename}"), script_body.into_bytes())
        .await
        .map_err(|source| Error::Upload {
            job_id: job.job_id.to_string(),
            source,
        })?;

    let artifact = script::exit_code_artifact_name(&script_basename);
    let found = poll_for_artifact(client, out_provider, &out_path, &artifact, job.job_id, settings).await?;
    if !found {
        return Err(Error::PollTimeout {
            job_id: job.job_id.to_string(),
            artifact: artifact.clone(),
            elapsed_secs: settings.deadline.as_secs(),
        });
    }

    let contents = download_artifact(client, out_provider, &out_path, &artifact, job.job_id).await?;
    Ok(parse_exit_code(&contents, job.job_id))
}

/// Polls the output bucket for `artifact`, checking both `<prefix>/` and the
/// bucket root (some launchers strip the `out/` prefix when harvesting
/// files), at `settings.interval` until `settings.deadline` elapses.
async fn poll_for_artifact(
    client: &ClusterClient,
    provider: &str,
    out_path: &str,
    artifact: &str,
    job_id: &str,
    settings: &PollSettings,
) -> Result<bool, Error> {
    let deadline = Instant::now() + settings.deadline;

    loop {
        match client.list(provider, &format!("{out_path}/")).await {
            Ok(listing) => {
                if listing.iter().any(|o| o.key.ends_with(artifact)) {
                    return Ok(true);
                }
            }
            Err(source) => {
                debug!(job_id, error = %source, "poll listing failed, retrying");
            }
        }

        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(settings.interval).await;
    }
}

/// Downloads the exit-code artifact, probing both `<out_path>/<artifact>`
/// and the bare `<artifact>` key, since extraction may land at either
/// location depending on the launcher revision.
async fn download_artifact(
    client: &ClusterClient,
    provider: &str,
    out_path: &str,
    artifact: &str,
    job_id: &str,
) -> Result<Vec<u8>, Error> {
    let primary = format!("{out_path}/{artifact}");
    if let Some(bytes) = client.download(provider, &primary).await.map_err(|source| Error::Download {
        job_id: job_id.to_string(),
        artifact: artifact.to_string(),
        source,
    })? {
        return Ok(bytes);
    }

    client
        .download(provider, artifact)
        .await
        .map_err(|source| Error::Download {
            job_id: job_id.to_string(),
            artifact: artifact.to_string(),
            source,
        })?
        .ok_or_else(|| Error::Download {
            job_id: job_id.to_string(),
            artifact: artifact.to_string(),
            source: anyhow::anyhow!("artifact listed but not downloadable at either probed location"),
        })
}

/// Parses the exit-code artifact's contents: if, after trimming whitespace,
/// the content is entirely ASCII digits, parses it as the exit code.
/// Otherwise logs a warning and coerces to `0`, per the dispatcher's
/// deliberate tolerance for noisy launchers.
fn parse_exit_code(contents: &[u8], job_id: &str) -> i32 {
    let text = String::from_utf8_lossy(contents);
    let trimmed = text.trim();

    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        match trimmed.parse::<i32>() {
            Ok(code) => return code,
            Err(_) => {
                warn!(job_id, content = trimmed, "exit code artifact overflowed i32, coercing to 0");
                return 0;
            }
        }
    }

    warn!(job_id, content = trimmed, "non-numeric exit code artifact, coercing to 0");
    0
}

/// Derives the `<step-name>_<unix-seconds>` job identifier for a step
/// invocation.
pub fn job_id(step_name: &str, now_unix_secs: u64) -> String {
    format!("{step_name}_{now_unix_secs}")
}

/// Used by the orchestrator to validate the tool spec's recognized shape
/// before dispatch; dispatch itself does not interpret `toolSpec` beyond
/// what [`crate::identity`] already extracted.
pub fn validate_tool_spec(spec: &ToolSpec) -> Result<(), Error> {
    if spec.base_command.is_empty() {
        return Err(Error::InvalidClusterConfig(
            "tool specification has an empty baseCommand".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_clean_numeric_exit_code() {
        assert_eq!(parse_exit_code(b"0\n", "job-1"), 0);
        assert_eq!(parse_exit_code(b"  137  ", "job-1"), 137);
    }

    #[test]
    fn coerces_non_numeric_content_to_zero() {
        assert_eq!(parse_exit_code(b"", "job-1"), 0);
        assert_eq!(parse_exit_code(b"abc", "job-1"), 0);
        assert_eq!(parse_exit_code(b"1\nfoo", "job-1"), 0);
    }

    #[test]
    fn job_id_combines_step_name_and_timestamp() {
        assert_eq!(job_id("my-step", 1_700_000_000), "my-step_1700000000");
    }

    #[test]
    fn rejects_tool_spec_with_empty_base_command() {
        let spec = ToolSpec {
            class: "CommandLineTool".to_string(),
            base_command: vec![],
            requirements: vec![],
            hints: vec![],
        };
        assert!(validate_tool_spec(&spec).is_err());
    }
}
