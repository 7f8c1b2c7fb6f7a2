//! Library-level configuration: cluster definitions and the tunables
//! governing dispatch, loaded from TOML (or any `config`-crate-supported
//! source) by the binary crate and handed to this crate as a plain struct.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use serde::Serialize;
use url::Url;

use crate::client::DEFAULT_REGION;
use crate::dispatcher;
use crate::dispatcher::PollSettings;
use crate::error::Error;
use crate::registry::ClusterAuthInput;
use crate::registry::ClusterDescriptor;
use crate::registry::ClusterRegistry;
use crate::service;
use crate::service::CreateSettings;
use crate::service::MountSettings;
use crate::service::SharedMinioCreds;

/// The string substituted for a secret field when [`Config`] is serialized
/// without first calling [`Config::unredact`].
const REDACTED: &str = "<REDACTED>";

/// One cluster's configuration, as loaded from a config file or CLI flags.
///
/// Deliberately permissive about credentials at the deserialization layer —
/// [`ClusterConfig::validate`] (via [`ClusterAuthInput`]) is what enforces
/// "exactly one of token or username+password."
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ClusterConfig {
    /// The cluster's HTTP endpoint.
    pub endpoint: Url,
    /// A bearer (OIDC) token, if this cluster uses token authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<RedactableSecret>,
    /// A basic-auth username, if this cluster uses username/password
    /// authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// A basic-auth password, if this cluster uses username/password
    /// authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<RedactableSecret>,
    /// Whether to verify TLS certificates for this cluster; default `true`.
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
    /// An optional human-readable name; defaults to `cluster-<host>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The default for [`ClusterConfig::tls_verify`].
fn default_tls_verify() -> bool {
    true
}

impl ClusterConfig {
    /// Validates this cluster's credential configuration and produces a
    /// registry-ready [`ClusterDescriptor`].
    pub fn validate(self) -> Result<ClusterDescriptor, Error> {
        let auth = ClusterAuthInput {
            token: self.token.map(|s| s.0),
            username: self.username,
            password: self.password.map(|s| s.0),
        };
        ClusterDescriptor::new(self.endpoint, auth, self.tls_verify, self.name)
    }
}

/// A secret value that redacts to `<REDACTED>` on serialization unless
/// [`Config::unredact`] has been called on the enclosing configuration.
#[derive(Debug, Clone)]
pub struct RedactableSecret(SecretString);

impl RedactableSecret {
    /// Exposes the inner secret.
    pub fn expose(&self) -> &SecretString {
        &self.0
    }
}

impl From<&str> for RedactableSecret {
    fn from(s: &str) -> Self {
        Self(SecretString::from(s))
    }
}

impl Serialize for RedactableSecret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for RedactableSecret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self(SecretString::from(s)))
    }
}

/// Configuration for the OSCAR execution backend: the clusters to dispatch
/// to and the tunables governing service creation and job polling.
///
/// <div class="warning">
///
/// Serialization redacts cluster credentials by default; the `config` crate
/// only needs [`Deserialize`] to load this type, but [`Serialize`] is
/// provided for diagnostic dumps (e.g. `--print-config`).
///
/// </div>
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// The clusters to dispatch to, in registration order.
    pub clusters: Vec<ClusterConfig>,
    /// The shared mount root visible identically to every cluster.
    pub mount_path: PathBuf,
    /// The maximum number of attempts made to create a service before
    /// failing. Default 3.
    #[serde(default = "default_max_create_attempts")]
    pub max_create_attempts: usize,
    /// How long, in seconds, to wait for the exit-code artifact to appear
    /// before failing the dispatch. Default 300.
    #[serde(default = "default_poll_deadline_secs")]
    pub poll_deadline_secs: u64,
    /// How often, in seconds, to poll the output bucket for the exit-code
    /// artifact. Default 5.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// An alternate MinIO backing the shared mount, if the deployment's
    /// mount is not served by the same provider as the default input/output
    /// buckets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_minio: Option<SharedMinioConfig>,
}

/// Configuration for a distinct MinIO instance backing the shared mount.
///
/// Mirrors [`ClusterConfig`]'s credential-redaction approach for its secret
/// key; present in a config file only when the deployment's mount genuinely
/// uses a different MinIO than the cluster's default storage provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SharedMinioConfig {
    /// The MinIO endpoint URL.
    pub endpoint: Url,
    /// Whether to verify TLS certificates for this endpoint. Default `true`.
    #[serde(default = "default_tls_verify")]
    pub verify: bool,
    /// The access key.
    pub access_key: String,
    /// The secret key.
    pub secret_key: RedactableSecret,
    /// The region. Default `us-east-1`.
    #[serde(default = "default_region")]
    pub region: String,
}

/// The default for [`SharedMinioConfig::region`].
fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

/// The default for [`Config::max_create_attempts`].
fn default_max_create_attempts() -> usize {
    service::MAX_CREATE_ATTEMPTS
}

/// The default for [`Config::poll_deadline_secs`].
fn default_poll_deadline_secs() -> u64 {
    dispatcher::POLL_DEADLINE.as_secs()
}

/// The default for [`Config::poll_interval_secs`].
fn default_poll_interval_secs() -> u64 {
    dispatcher::POLL_INTERVAL.as_secs()
}

impl Config {
    /// Validates every cluster and builds a [`ClusterRegistry`] from them.
    ///
    /// Fails on the first invalid cluster; a config with zero clusters is
    /// not itself an error here (the orchestrator surfaces `NoCluster` at
    /// dispatch time), matching the registry's own `next()` semantics.
    pub fn build_registry(&self) -> Result<ClusterRegistry, Error> {
        let registry = ClusterRegistry::new();
        for cluster in &self.clusters {
            registry.add(cluster.clone().validate()?);
        }
        Ok(registry)
    }

    /// The service-creation retry/backoff tunables this config selects.
    pub fn create_settings(&self) -> CreateSettings {
        CreateSettings {
            max_attempts: self.max_create_attempts,
            ..CreateSettings::default()
        }
    }

    /// The upload/poll/download tunables this config selects.
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            deadline: Duration::from_secs(self.poll_deadline_secs),
            interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    /// The shared mount settings this config selects: its root path, plus
    /// the alternate MinIO backing it, if any.
    pub fn mount_settings(&self) -> MountSettings {
        MountSettings {
            mount_path: self.mount_path.clone(),
            shared_minio: self.shared_minio.as_ref().map(|m| SharedMinioCreds {
                endpoint: m.endpoint.to_string(),
                verify: m.verify,
                access_key: m.access_key.clone(),
                secret_key: m.secret_key.expose().clone(),
                region: m.region.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn redacted_secret_serializes_to_placeholder() {
        let secret = RedactableSecret::from("super-secret-token");
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"<REDACTED>\"");
    }

    fn bare_cluster(endpoint: &str) -> ClusterConfig {
        ClusterConfig {
            endpoint: Url::parse(endpoint).unwrap(),
            token: None,
            username: None,
            password: None,
            tls_verify: true,
            name: None,
        }
    }

    #[test]
    fn build_registry_rejects_invalid_cluster() {
        let config = Config {
            clusters: vec![bare_cluster("https://oscar.example.com")],
            mount_path: PathBuf::from("/mnt/cwl-oscar/mount"),
            max_create_attempts: 3,
            poll_deadline_secs: 300,
            poll_interval_secs: 5,
            shared_minio: None,
        };
        assert!(config.build_registry().is_err());
    }

    #[test]
    fn build_registry_accepts_token_cluster() {
        let mut cluster = bare_cluster("https://oscar.example.com");
        cluster.token = Some(RedactableSecret::from("tok"));
        let config = Config {
            clusters: vec![cluster],
            mount_path: PathBuf::from("/mnt/cwl-oscar/mount"),
            max_create_attempts: 3,
            poll_deadline_secs: 300,
            poll_interval_secs: 5,
            shared_minio: None,
        };
        let registry = config.build_registry().unwrap();
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn empty_cluster_list_builds_empty_registry() {
        let config = Config {
            clusters: vec![],
            mount_path: PathBuf::from("/mnt/cwl-oscar/mount"),
            max_create_attempts: 3,
            poll_deadline_secs: 300,
            poll_interval_secs: 5,
            shared_minio: None,
        };
        let registry = config.build_registry().unwrap();
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn settings_derive_from_config_values() {
        let config = Config {
            clusters: vec![],
            mount_path: PathBuf::from("/mnt/cwl-oscar/mount"),
            max_create_attempts: 5,
            poll_deadline_secs: 120,
            poll_interval_secs: 2,
            shared_minio: None,
        };
        assert_eq!(config.create_settings().max_attempts, 5);
        assert_eq!(config.poll_settings().deadline, Duration::from_secs(120));
        assert_eq!(config.poll_settings().interval, Duration::from_secs(2));
    }

    #[test]
    fn mount_settings_default_to_no_shared_minio() {
        let config = Config {
            clusters: vec![],
            mount_path: PathBuf::from("/mnt/cwl-oscar/mount"),
            max_create_attempts: 3,
            poll_deadline_secs: 300,
            poll_interval_secs: 5,
            shared_minio: None,
        };
        let mount = config.mount_settings();
        assert_eq!(mount.mount_path, PathBuf::from("/mnt/cwl-oscar/mount"));
        assert!(mount.shared_minio.is_none());
    }

    #[test]
    fn mount_settings_carry_shared_minio_credentials() {
        let config = Config {
            clusters: vec![],
            mount_path: PathBuf::from("/mnt/cwl-oscar/mount"),
            max_create_attempts: 3,
            poll_deadline_secs: 300,
            poll_interval_secs: 5,
            shared_minio: Some(SharedMinioConfig {
                endpoint: Url::parse("https://minio.shared.example.com").unwrap(),
                verify: false,
                access_key: "key".to_string(),
                secret_key: RedactableSecret::from("secret"),
                region: default_region(),
            }),
        };
        let mount = config.mount_settings();
        let creds = mount.shared_minio.expect("shared minio credentials present");
        assert_eq!(creds.endpoint, "https://minio.shared.example.com/");
        assert!(!creds.verify);
        assert_eq!(creds.region, "us-east-1");
    }
}
