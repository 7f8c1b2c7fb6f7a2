//! The service manager: create-or-reuse of per-tool OSCAR services, with
//! caching, post-create verification, and retry with backoff.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use secrecy::ExposeSecret;
use secrecy::SecretString;
use tokio::sync::OnceCell;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_retry2::strategy::ExponentialBackoff;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::ClusterClient;
use crate::client::Environment;
use crate::client::MinioProviderConfig;
use crate::client::MinioProviders;
use crate::client::ServiceDefinition;
use crate::client::StorageProviderPath;
use crate::client::StorageProviders;
use crate::error::Error;
use crate::identity::ServiceRequirements;
use crate::registry::ClusterDescriptor;

/// The number of attempts made to create a service before giving up, per
/// spec: create, retry, retry again (3 attempts total).
pub const MAX_CREATE_ATTEMPTS: usize = 3;

/// The base delay for the exponential backoff between creation attempts.
const RETRY_BASE_DELAY_MILLIS: u64 = 2_000;

/// The ceiling on a single backoff delay between creation attempts, so a
/// misconfigured base delay (or a raised attempt cap) can't stall a dispatch
/// for an unreasonable amount of time.
const MAX_RETRY_DELAY_MILLIS: u64 = 30_000;

/// How long to wait after a successful `createService` call before
/// re-listing to verify the service actually exists.
const POST_CREATE_GRACE: Duration = Duration::from_secs(3);

/// The default container entrypoint script installed on every service this
/// crate creates. The service's actual job script is uploaded separately per
/// invocation and invoked by this wrapper (see `script.rs`).
const SERVICE_SCRIPT: &str = "#!/bin/bash\n/bin/bash \"$INPUT_FILE_PATH\"\n";

/// The default input storage provider and path prefix used for services this
/// crate creates.
const DEFAULT_INPUT_PROVIDER: &str = "minio.default";

/// The storage provider identifier used for the shared mount when a distinct
/// MinIO backend is configured for it.
const SHARED_MOUNT_PROVIDER: &str = "minio.shared";

/// Credentials for a MinIO instance distinct from the cluster's default,
/// backing the shared mount. Mirrors spec.md §6's `storage_providers.minio.shared`
/// override, present only when the deployment's mount is not served by the
/// same MinIO as the default input/output buckets.
#[derive(Debug, Clone)]
pub struct SharedMinioCreds {
    /// The MinIO endpoint URL.
    pub endpoint: String,
    /// Whether to verify TLS certificates for this endpoint.
    pub verify: bool,
    /// The access key.
    pub access_key: String,
    /// The secret key.
    pub secret_key: SecretString,
    /// The region; defaults to `us-east-1` when unspecified.
    pub region: String,
}

/// Settings describing the shared mount a created service is wired to: its
/// filesystem root and, optionally, an alternate MinIO backing it.
#[derive(Debug, Clone)]
pub struct MountSettings {
    /// The shared mount root visible identically to every cluster.
    pub mount_path: PathBuf,
    /// An alternate MinIO backing the mount, if the deployment's mount is
    /// not served by the cluster's default storage provider.
    pub shared_minio: Option<SharedMinioCreds>,
}

impl MountSettings {
    /// Constructs settings for a mount with no distinct MinIO backing it;
    /// the mount uses the same default provider as input/output buckets.
    pub fn new(mount_path: PathBuf) -> Self {
        Self { mount_path, shared_minio: None }
    }
}

/// Derives the mount-relative storage path for a service definition's
/// `mount.path` field from an absolute mount root, stripping a leading
/// `/mnt` segment the way the shared mount is bind-mounted from a bucket
/// root (see `local_runner`'s equivalent derivation for the CLI side).
fn mount_storage_path(mount_path: &Path) -> String {
    let trimmed = mount_path.to_string_lossy();
    let trimmed = trimmed.trim_start_matches('/');
    let relative = trimmed.strip_prefix("mnt/").unwrap_or(trimmed);
    format!("/{relative}")
}

/// The tunables governing service creation, overridable from
/// [`crate::config::Config`]; defaults match spec.md §6's constant table.
#[derive(Debug, Clone)]
pub struct CreateSettings {
    /// The maximum number of creation attempts before giving up.
    pub max_attempts: usize,
    /// The base delay for the exponential backoff between attempts.
    pub retry_base_delay: Duration,
    /// How long to wait after `createService` before re-listing to verify.
    pub post_create_grace: Duration,
}

impl Default for CreateSettings {
    fn default() -> Self {
        Self {
            max_attempts: MAX_CREATE_ATTEMPTS,
            retry_base_delay: Duration::from_millis(RETRY_BASE_DELAY_MILLIS),
            post_create_grace: POST_CREATE_GRACE,
        }
    }
}

/// Caches and creates per-cluster, per-identity OSCAR services.
///
/// Each `(cluster name, service identity)` pair is only ever created once per
/// process: concurrent callers asking for the same service on the same
/// cluster share a single in-flight creation via a cached [`OnceCell`].
#[derive(Debug, Default)]
pub struct ServiceManager {
    /// The creation futures cache, keyed by `(cluster name, identity)`.
    cache: Mutex<HashMap<(String, String), std::sync::Arc<OnceCell<()>>>>,
}

impl ServiceManager {
    /// Constructs an empty service manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a service with the given identity and requirements exists on
    /// the cluster, creating it if necessary, per [`CreateSettings`].
    ///
    /// Returns once the service is confirmed to exist; does not return the
    /// service definition, since callers already know the identity and the
    /// input/output paths are a deterministic function of it.
    pub async fn ensure_service(
        &self,
        client: &ClusterClient,
        cluster: &ClusterDescriptor,
        identity: &str,
        requirements: &ServiceRequirements,
        mount: &MountSettings,
        settings: &CreateSettings,
    ) -> Result<(), Error> {
        let once = {
            let mut cache = self.cache.lock().expect("service manager mutex poisoned");
            cache
                .entry((cluster.name().to_string(), identity.to_string()))
                .or_insert_with(|| std::sync::Arc::new(OnceCell::new()))
                .clone()
        };

        once.get_or_try_init(|| create_or_reuse(client, cluster, identity, requirements, mount, settings))
            .await?;
        Ok(())
    }

    /// Forgets a cached service, e.g. so a subsequent call re-verifies
    /// against the cluster. Primarily useful in tests.
    pub fn forget(&self, cluster_name: &str, identity: &str) {
        let mut cache = self.cache.lock().expect("service manager mutex poisoned");
        cache.remove(&(cluster_name.to_string(), identity.to_string()));
    }
}

/// Runs the create-or-reuse algorithm for a single `(cluster, identity)` pair:
/// check the cache (by the caller, via [`OnceCell`]), list services, and
/// create with a post-create grace period and re-verification, retried with
/// exponential backoff up to [`MAX_CREATE_ATTEMPTS`].
async fn create_or_reuse(
    client: &ClusterClient,
    cluster: &ClusterDescriptor,
    identity: &str,
    requirements: &ServiceRequirements,
    mount: &MountSettings,
    settings: &CreateSettings,
) -> Result<(), Error> {
    if client
        .find_service(identity)
        .await
        .map_err(|source| Error::ServiceList {
            cluster: cluster.name().to_string(),
            source,
        })?
        .is_some()
    {
        debug!(cluster = cluster.name(), identity, "service already exists, reusing");
        return Ok(());
    }

    info!(cluster = cluster.name(), identity, "creating service");
    let definition = service_definition(identity, requirements, mount);

    // `ExponentialBackoff::from_millis(2).factor(half_base)` yields a delay
    // series of `base, 2*base, 4*base, ...` (doubling per spec.md §6's
    // "retry multiplier 2"), rather than `base` itself being the
    // exponentiation base, which would blow up to hours within a handful of
    // attempts.
    let half_base_delay_millis = (settings.retry_base_delay.as_millis() as u64 / 2).max(1);
    let retry_result = Retry::spawn_notify(
        ExponentialBackoff::from_millis(2)
            .factor(half_base_delay_millis)
            .max_delay_millis(MAX_RETRY_DELAY_MILLIS)
            .take(settings.max_attempts.saturating_sub(1)),
        || attempt_create(client, identity, &definition, settings.post_create_grace),
        |e, _| {
            warn!(cluster = cluster.name(), identity, error = %e, "service creation attempt failed, retrying");
        },
    )
    .await;

    retry_result.map_err(|source| Error::ServiceCreation {
        identity: identity.to_string(),
        cluster: cluster.name().to_string(),
        attempts: settings.max_attempts as u32,
        source,
    })
}

/// A single creation attempt: `createService`, then *always* a grace sleep
/// and a re-verification listing, regardless of whether `createService`
/// itself returned an error. The remote API is not reliably idempotent in
/// its status code (a 500 may still have created the service), so listing
/// after the grace period is the only authoritative check; skipping it on a
/// non-2xx response would spuriously retry (and eventually fail) a creation
/// that actually succeeded.
async fn attempt_create(
    client: &ClusterClient,
    identity: &str,
    definition: &ServiceDefinition,
    post_create_grace: Duration,
) -> Result<(), RetryError<anyhow::Error>> {
    let create_err = client.create_service(definition).await.err();
    if let Some(err) = &create_err {
        warn!(identity, error = %err, "createService returned an error, verifying by listing before giving up");
    }

    tokio::time::sleep(post_create_grace).await;

    match client.find_service(identity).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(RetryError::transient(anyhow::anyhow!(
            "service `{identity}` not found after creation and grace period{}",
            create_err.map(|e| format!(" (createService also failed: {e})")).unwrap_or_default()
        ))),
        Err(source) => Err(RetryError::transient(source)),
    }
}

/// Builds the [`ServiceDefinition`] this crate requests for a given identity,
/// resource requirements, and shared mount settings.
///
/// The service's input and output providers and paths are derived from its
/// identity so that the dispatcher can compute them again without a round
/// trip: `<identity>/in` and `<identity>/out`. The mount provider is
/// `minio.default` unless `mount.shared_minio` is set, in which case it is
/// `minio.shared` and a matching `storage_providers.minio.shared` block is
/// emitted (spec.md §6, §9 open question 2).
fn service_definition(identity: &str, requirements: &ServiceRequirements, mount: &MountSettings) -> ServiceDefinition {
    let (mount_provider, storage_providers) = match &mount.shared_minio {
        Some(creds) => (
            SHARED_MOUNT_PROVIDER,
            Some(StorageProviders {
                minio: MinioProviders {
                    shared: MinioProviderConfig {
                        endpoint: creds.endpoint.clone(),
                        verify: creds.verify,
                        access_key: creds.access_key.clone(),
                        secret_key: creds.secret_key.expose_secret().to_string(),
                        region: creds.region.clone(),
                    },
                },
            }),
        ),
        None => (DEFAULT_INPUT_PROVIDER, None),
    };

    ServiceDefinition {
        name: identity.to_string(),
        image: requirements.image.clone(),
        memory: Some(format!("{}Mi", requirements.memory_mib)),
        cpu: Some(requirements.cores.to_string()),
        script: SERVICE_SCRIPT.to_string(),
        environment: Environment {
            variables: requirements
                .env_vars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        },
        input: vec![StorageProviderPath {
            storage_provider: DEFAULT_INPUT_PROVIDER.to_string(),
            path: format!("{identity}/in"),
        }],
        output: vec![StorageProviderPath {
            storage_provider: DEFAULT_INPUT_PROVIDER.to_string(),
            path: format!("{identity}/out"),
        }],
        mount: StorageProviderPath {
            storage_provider: mount_provider.to_string(),
            path: mount_storage_path(&mount.mount_path),
        },
        storage_providers,
    }
}

/// Derives the input storage provider and path for a service identity, per
/// spec.md §3: `<identity>/in`.
pub fn input_path(identity: &str) -> (&'static str, String) {
    (DEFAULT_INPUT_PROVIDER, format!("{identity}/in"))
}

/// Derives the output storage provider and path for a service identity, per
/// spec.md §3: `<identity>/out`.
pub fn output_path(identity: &str) -> (&'static str, String) {
    (DEFAULT_INPUT_PROVIDER, format!("{identity}/out"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_definition_derives_paths_from_identity() {
        let reqs = ServiceRequirements::default();
        let mount = MountSettings::new(PathBuf::from("/mnt/cwl-oscar/mount"));
        let def = service_definition("cwl-oscar-tool-abcd1234", &reqs, &mount);
        assert_eq!(def.input[0].path, "cwl-oscar-tool-abcd1234/in");
        assert_eq!(def.output[0].path, "cwl-oscar-tool-abcd1234/out");
    }

    #[test]
    fn input_and_output_paths_match_service_definition() {
        let identity = "cwl-oscar-tool-abcd1234";
        assert_eq!(input_path(identity).1, "cwl-oscar-tool-abcd1234/in");
        assert_eq!(output_path(identity).1, "cwl-oscar-tool-abcd1234/out");
    }

    #[test]
    fn mount_defaults_to_minio_default_provider() {
        let reqs = ServiceRequirements::default();
        let mount = MountSettings::new(PathBuf::from("/mnt/cwl-oscar/mount"));
        let def = service_definition("cwl-oscar-tool-abcd1234", &reqs, &mount);
        assert_eq!(def.mount.storage_provider, "minio.default");
        assert_eq!(def.mount.path, "/cwl-oscar/mount");
        assert!(def.storage_providers.is_none());
    }

    #[test]
    fn mount_uses_shared_minio_provider_when_configured() {
        let reqs = ServiceRequirements::default();
        let mount = MountSettings {
            mount_path: PathBuf::from("/mnt/cwl-oscar/mount"),
            shared_minio: Some(SharedMinioCreds {
                endpoint: "https://minio.shared.example.com".to_string(),
                verify: true,
                access_key: "key".to_string(),
                secret_key: SecretString::from("secret"),
                region: "us-east-1".to_string(),
            }),
        };
        let def = service_definition("cwl-oscar-tool-abcd1234", &reqs, &mount);
        assert_eq!(def.mount.storage_provider, "minio.shared");
        let providers = def.storage_providers.expect("shared minio providers present");
        assert_eq!(providers.minio.shared.endpoint, "https://minio.shared.example.com");
        assert_eq!(providers.minio.shared.access_key, "key");
    }
}
