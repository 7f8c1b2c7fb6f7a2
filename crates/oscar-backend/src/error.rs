//! The error taxonomy for the OSCAR execution backend.

use thiserror::Error;

/// Errors raised by the OSCAR execution backend.
///
/// Each variant corresponds to one row of the error taxonomy: most are
/// surfaced to the caller, some are only ever logged and coerced to a
/// tolerated default. See the `dispositions` module docs in this crate for
/// which is which.
#[derive(Debug, Error)]
pub enum Error {
    /// A cluster descriptor failed validation when added to the registry.
    ///
    /// Disposition: surfaced; the registry refuses the registration.
    #[error("invalid cluster configuration: {0}")]
    InvalidClusterConfig(String),

    /// The registry had no clusters to hand out.
    ///
    /// Disposition: surfaced to the host; the step fails `permanentFail`.
    #[error("no OSCAR clusters are configured")]
    NoCluster,

    /// Listing remote services failed.
    ///
    /// Disposition: logged; treated as "service not found", so service
    /// creation proceeds.
    #[error("failed to list services on cluster `{cluster}`: {source}")]
    ServiceList {
        /// The cluster the listing was attempted against.
        cluster: String,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// A `createService` call failed in a way judged transient (non-2xx,
    /// network error, or post-grace verification miss).
    ///
    /// Disposition: retried with exponential backoff up to the attempt cap.
    #[error("transient failure creating service `{identity}` on cluster `{cluster}`: {source}")]
    ServiceCreateTransient {
        /// The service identity being created.
        identity: String,
        /// The cluster the creation was attempted against.
        cluster: String,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// Service creation failed after the retry budget was exhausted.
    ///
    /// Disposition: raised; the step fails.
    #[error(
        "failed to create service `{identity}` on cluster `{cluster}` after {attempts} attempts: \
         {source}"
    )]
    ServiceCreation {
        /// The service identity that could not be created.
        identity: String,
        /// The cluster the creation was attempted against.
        cluster: String,
        /// The number of attempts made.
        attempts: u32,
        /// The last underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// Uploading the per-job script to the cluster's input bucket failed.
    ///
    /// Disposition: logged; the dispatcher returns exit code `1`.
    #[error("failed to upload script for job `{job_id}`: {source}")]
    Upload {
        /// The job the upload was for.
        job_id: String,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// The exit-code artifact did not appear before the poll deadline.
    ///
    /// Disposition: logged; the dispatcher returns exit code `1`.
    #[error("timed out after {elapsed_secs}s waiting for `{artifact}` for job `{job_id}`")]
    PollTimeout {
        /// The job that timed out.
        job_id: String,
        /// The artifact name that never appeared.
        artifact: String,
        /// How long the dispatcher waited, in seconds.
        elapsed_secs: u64,
    },

    /// Downloading the exit-code artifact failed.
    ///
    /// Disposition: logged; the dispatcher returns exit code `1`.
    #[error("failed to download `{artifact}` for job `{job_id}`: {source}")]
    Download {
        /// The job the download was for.
        job_id: String,
        /// The artifact name.
        artifact: String,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// The output directory for a completed job was missing on the shared
    /// mount.
    ///
    /// Disposition: the step fails `permanentFail`.
    #[error("output directory for job `{job_id}` is missing from the shared mount")]
    OutputDirMissing {
        /// The job whose output directory was missing.
        job_id: String,
    },

    /// Output collection failed for a completed job.
    ///
    /// Disposition: the step fails `permanentFail`.
    #[error("failed to collect outputs for job `{job_id}`: {source}")]
    OutputCollection {
        /// The job outputs could not be collected for.
        job_id: String,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },
}
