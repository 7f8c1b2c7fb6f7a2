//! A thin HTTP client over a single OSCAR cluster's REST API: service
//! listing/creation and the cluster's input/output bucket sub-API.

use std::time::Duration;

use anyhow::Context as _;
use anyhow::anyhow;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::registry::ClusterAuth;
use crate::registry::ClusterDescriptor;

/// The default request timeout applied to every call made through a
/// [`ClusterClient`].
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The default region used for a MinIO storage provider when unspecified.
pub const DEFAULT_REGION: &str = "us-east-1";

/// A single OSCAR service's definition, as returned by `GET /system/services`
/// and sent to `PUT /system/services/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// The service's name.
    pub name: String,
    /// The container image the service runs.
    pub image: String,
    /// The container's memory allocation, e.g. `"1Gi"`.
    #[serde(default)]
    pub memory: Option<String>,
    /// The container's CPU allocation, e.g. `"1.0"`.
    #[serde(default)]
    pub cpu: Option<String>,
    /// The container's entrypoint script.
    pub script: String,
    /// Environment variables injected into invocations, under the `Variables`
    /// sub-key per the OSCAR service spec.
    #[serde(default)]
    pub environment: Environment,
    /// The service's configured input (trigger) storage providers.
    #[serde(default)]
    pub input: Vec<StorageProviderPath>,
    /// The service's configured output storage providers.
    #[serde(default)]
    pub output: Vec<StorageProviderPath>,
    /// The shared filesystem mount every invocation of this service sees.
    pub mount: StorageProviderPath,
    /// Alternate storage-provider credentials, present only when a distinct
    /// MinIO backs the shared mount rather than the cluster's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_providers: Option<StorageProviders>,
}

/// Alternate storage-provider definitions a service definition may carry
/// alongside its cluster-default providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageProviders {
    /// MinIO-backed providers.
    pub minio: MinioProviders,
}

/// The MinIO provider slots a service definition may configure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinioProviders {
    /// The distinct MinIO backing the shared mount.
    pub shared: MinioProviderConfig,
}

/// Connection details for a MinIO storage provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinioProviderConfig {
    /// The MinIO endpoint URL.
    pub endpoint: String,
    /// Whether to verify TLS certificates when contacting this endpoint.
    pub verify: bool,
    /// The access key.
    pub access_key: String,
    /// The secret key.
    pub secret_key: String,
    /// The region, defaulting to `us-east-1` when unspecified by the caller.
    pub region: String,
}

/// A service's environment variable block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    /// The environment variables themselves.
    #[serde(rename = "Variables", default)]
    pub variables: indexmap::IndexMap<String, String>,
}

/// A single storage provider/path pair, as used in a service's `input` and
/// `output` lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageProviderPath {
    /// The storage provider identifier, e.g. `"minio.default"`.
    pub storage_provider: String,
    /// The path within that provider.
    pub path: String,
}

/// An entry in a bucket listing, normalized from either the S3-style
/// `{Contents: [...]}` shape or a flat list shape that a cluster's storage API
/// may return.
#[derive(Debug, Clone)]
pub struct ListedObject {
    /// The object's full key within the bucket.
    pub key: String,
}

/// An HTTP client scoped to a single OSCAR cluster.
///
/// Holds the cluster's endpoint and credentials and applies them to every
/// request; callers obtain one per dispatch rather than sharing a single
/// client across clusters, mirroring how the original Python client is
/// constructed per-cluster.
pub struct ClusterClient {
    /// The cluster this client talks to.
    endpoint: Url,
    /// The cluster's credentials.
    auth: ClusterAuth,
    /// The underlying HTTP client.
    http: reqwest::Client,
}

impl ClusterClient {
    /// Builds a client for the given cluster descriptor.
    pub fn new(cluster: &ClusterDescriptor) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!cluster.tls_verify())
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            endpoint: cluster.endpoint().clone(),
            auth: cluster.auth().clone(),
            http,
        })
    }

    /// Applies this cluster's authentication to a request builder.
    fn authenticate(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            ClusterAuth::Token(token) => builder.bearer_auth(token.expose_secret()),
            ClusterAuth::Basic { username, password } => {
                builder.basic_auth(username, Some(password.expose_secret()))
            }
        }
    }

    /// Joins a path onto this cluster's endpoint.
    fn url(&self, path: &str) -> Result<Url, anyhow::Error> {
        self.endpoint
            .join(path)
            .with_context(|| format!("joining `{path}` onto cluster endpoint `{}`", self.endpoint))
    }

    /// Lists every service defined on the cluster.
    pub async fn list_services(&self) -> Result<Vec<ServiceDefinition>, anyhow::Error> {
        let url = self.url("system/services")?;
        let response = self
            .authenticate(self.http.get(url))
            .send()
            .await
            .context("sending list-services request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("list-services returned {status}: {body}"));
        }

        response
            .json::<Vec<ServiceDefinition>>()
            .await
            .context("parsing list-services response")
    }

    /// Looks up a single service by name among the cluster's services.
    pub async fn find_service(&self, name: &str) -> Result<Option<ServiceDefinition>, anyhow::Error> {
        let services = self.list_services().await?;
        Ok(services.into_iter().find(|s| s.name == name))
    }

    /// Creates (or replaces) a service definition on the cluster.
    ///
    /// Returns an error for any non-2xx response; callers are responsible for
    /// deciding whether the failure is transient.
    pub async fn create_service(&self, definition: &ServiceDefinition) -> Result<(), anyhow::Error> {
        let url = self.url(&format!("system/services/{}", definition.name))?;
        let response = self
            .authenticate(self.http.put(url))
            .json(definition)
            .send()
            .await
            .context("sending create-service request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("create-service returned {status}: {body}"));
        }

        Ok(())
    }

    /// Uploads a file's bytes to a storage provider path.
    pub async fn upload(&self, provider: &str, path: &str, bytes: Vec<u8>) -> Result<(), anyhow::Error> {
        let url = self.url(&format!("system/storage/{provider}/{}", path.trim_start_matches('/')))?;
        let response = self
            .authenticate(self.http.put(url))
            .body(bytes)
            .send()
            .await
            .context("sending upload request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("upload returned {status}: {body}"));
        }

        Ok(())
    }

    /// Downloads a file's bytes from a storage provider path.
    ///
    /// Returns `Ok(None)` if the object does not exist (HTTP 404), so callers
    /// can distinguish "not yet produced" from a genuine transport failure.
    pub async fn download(&self, provider: &str, path: &str) -> Result<Option<Vec<u8>>, anyhow::Error> {
        let url = self.url(&format!("system/storage/{provider}/{}", path.trim_start_matches('/')))?;
        let response = self
            .authenticate(self.http.get(url))
            .send()
            .await
            .context("sending download request")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("download returned {status}: {body}"));
        }

        Ok(Some(response.bytes().await.context("reading download body")?.to_vec()))
    }

    /// Deletes an object from a storage provider path. Missing objects are
    /// not an error.
    pub async fn delete(&self, provider: &str, path: &str) -> Result<(), anyhow::Error> {
        let url = self.url(&format!("system/storage/{provider}/{}", path.trim_start_matches('/')))?;
        let response = self
            .authenticate(self.http.delete(url))
            .send()
            .await
            .context("sending delete request")?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("delete returned {status}: {body}"));
        }

        Ok(())
    }

    /// Lists objects under a prefix in a storage provider, normalizing both
    /// the S3-style `{Contents: [...]}` response shape and the flat list
    /// shape a cluster's storage API may return instead.
    pub async fn list(&self, provider: &str, prefix: &str) -> Result<Vec<ListedObject>, anyhow::Error> {
        let url = self.url(&format!(
            "system/storage/{provider}/{}",
            prefix.trim_start_matches('/')
        ))?;
        let response = self
            .authenticate(self.http.get(url))
            .send()
            .await
            .context("sending list request")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("list returned {status}: {body}"));
        }

        let body: Value = response.json().await.context("parsing list response")?;
        Ok(normalize_listing(&body))
    }
}

/// Normalizes a storage-listing JSON body into a flat [`ListedObject`] list.
///
/// A cluster's storage backend may answer with an S3-style
/// `{"Contents": [{"Key": "..."}]}` object, or with a flat JSON array whose
/// elements are either bare key strings or `{"Key": "..."}` objects. Anything
/// else normalizes to an empty listing rather than failing the poll loop.
fn normalize_listing(body: &Value) -> Vec<ListedObject> {
    let entries = if let Some(contents) = body.get("Contents").and_then(Value::as_array) {
        contents
    } else if let Some(items) = body.as_array() {
        items
    } else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(key) => Some(ListedObject { key: key.clone() }),
            Value::Object(_) => entry
                .get("Key")
                .and_then(Value::as_str)
                .map(|key| ListedObject { key: key.to_string() }),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalizes_s3_style_contents() {
        let body = serde_json::json!({
            "Contents": [{"Key": "out/job-1.exit_code"}, {"Key": "out/job-2.exit_code"}]
        });
        let listed = normalize_listing(&body);
        assert_eq!(listed.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(), vec![
            "out/job-1.exit_code",
            "out/job-2.exit_code"
        ]);
    }

    #[test]
    fn normalizes_flat_object_list() {
        let body = serde_json::json!([{"Key": "out/job-1.exit_code"}]);
        let listed = normalize_listing(&body);
        assert_eq!(listed[0].key, "out/job-1.exit_code");
    }

    #[test]
    fn normalizes_flat_string_list() {
        let body = serde_json::json!(["out/job-1.exit_code"]);
        let listed = normalize_listing(&body);
        assert_eq!(listed[0].key, "out/job-1.exit_code");
    }

    #[test]
    fn normalizes_unknown_shape_to_empty() {
        let body = serde_json::json!({"unexpected": true});
        assert!(normalize_listing(&body).is_empty());
    }
}
