//! The cluster registry: validated endpoints and fair cluster selection.

use std::sync::Mutex;

use secrecy::SecretString;
use url::Url;

use crate::error::Error;

/// Authentication credentials for a cluster.
///
/// Exactly one of the two forms is ever held by a [`ClusterDescriptor`];
/// holding neither is rejected at construction time (spec: a cluster lacking
/// both credential forms fails validation).
#[derive(Clone)]
pub enum ClusterAuth {
    /// Bearer (OIDC) token authentication.
    Token(SecretString),
    /// HTTP basic authentication.
    Basic {
        /// The basic-auth username.
        username: String,
        /// The basic-auth password.
        password: SecretString,
    },
}

impl std::fmt::Debug for ClusterAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token(_) => f.debug_tuple("Token").field(&"<redacted>").finish(),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

impl ClusterAuth {
    /// The authentication kind, for display purposes that must not leak
    /// secrets (`listInfo` in spec terms).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Basic { .. } => "basic",
        }
    }
}

/// Raw, unvalidated credential inputs, as they arrive from a configuration
/// file or CLI flags: a token, a username, and/or a password, any of which
/// may be absent.
///
/// [`ClusterDescriptor::new`] validates this into a [`ClusterAuth`] and
/// rejects the inputs that don't amount to exactly one complete credential
/// form.
#[derive(Debug, Clone, Default)]
pub struct ClusterAuthInput {
    /// A bearer (OIDC) token, if provided.
    pub token: Option<SecretString>,
    /// A basic-auth username, if provided.
    pub username: Option<String>,
    /// A basic-auth password, if provided.
    pub password: Option<SecretString>,
}

impl ClusterAuthInput {
    /// Validates the raw inputs into a [`ClusterAuth`].
    fn validate(self) -> Result<ClusterAuth, Error> {
        match (self.token, self.username, self.password) {
            (Some(token), None, None) => Ok(ClusterAuth::Token(token)),
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(Error::InvalidClusterConfig(
                "a token and a username/password cannot both be provided".to_string(),
            )),
            (None, Some(username), Some(password)) => Ok(ClusterAuth::Basic { username, password }),
            (None, Some(_), None) => Err(Error::InvalidClusterConfig(
                "password is required when username is provided".to_string(),
            )),
            (None, None, _) => Err(Error::InvalidClusterConfig(
                "either a token or a username/password pair must be provided".to_string(),
            )),
        }
    }
}

/// An immutable, validated cluster endpoint.
#[derive(Debug, Clone)]
pub struct ClusterDescriptor {
    /// The cluster's HTTP endpoint.
    endpoint: Url,
    /// The cluster's credentials.
    auth: ClusterAuth,
    /// Whether to verify TLS certificates when contacting the cluster.
    tls_verify: bool,
    /// A human-readable name for the cluster.
    name: String,
}

impl ClusterDescriptor {
    /// Constructs a new cluster descriptor from raw credential inputs,
    /// validating per spec: a cluster lacking both credential forms, or a
    /// username without a password, fails validation.
    pub fn new(
        endpoint: Url,
        auth: ClusterAuthInput,
        tls_verify: bool,
        name: Option<String>,
    ) -> Result<Self, Error> {
        let auth = auth.validate()?;
        let name = name.unwrap_or_else(|| format!("cluster-{host}", host = default_host(&endpoint)));

        Ok(Self {
            endpoint,
            auth,
            tls_verify,
            name,
        })
    }

    /// The cluster's endpoint URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// The cluster's credentials.
    pub fn auth(&self) -> &ClusterAuth {
        &self.auth
    }

    /// Whether TLS verification is enabled for this cluster.
    pub fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    /// The cluster's human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Derives the default human name for a cluster from its endpoint: the host
/// (and, if present, port), matching the original `cluster-<host>` scheme.
fn default_host(endpoint: &Url) -> String {
    match endpoint.host_str() {
        Some(host) => match endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        },
        None => endpoint.as_str().to_string(),
    }
}

/// A read-only projection of a cluster descriptor that omits secrets.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    /// The cluster's index within the registry at the time of listing.
    pub index: usize,
    /// The cluster's human-readable name.
    pub name: String,
    /// The cluster's endpoint.
    pub endpoint: Url,
    /// The authentication kind: `"token"` or `"basic"`.
    pub auth_kind: &'static str,
    /// Whether TLS verification is enabled.
    pub tls_verify: bool,
}

/// Holds validated cluster endpoints and hands out the next cluster under a
/// fair, round-robin policy.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    /// The mutable sequence and rotation cursor, guarded by a single mutex.
    state: Mutex<State>,
}

/// The registry's mutable state: the cluster sequence and the rotation
/// cursor. Encapsulated so the cursor never leaks outside `next()`.
#[derive(Debug, Default)]
struct State {
    /// The ordered sequence of cluster descriptors.
    clusters: Vec<ClusterDescriptor>,
    /// The index of the next cluster to hand out.
    cursor: usize,
}

impl ClusterRegistry {
    /// Constructs an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a validated cluster descriptor to the registry.
    pub fn add(&self, descriptor: ClusterDescriptor) {
        tracing::info!(cluster = descriptor.name(), "adding cluster");
        let mut state = self.state.lock().expect("registry mutex poisoned");
        state.clusters.push(descriptor);
    }

    /// Returns the next cluster under strict round-robin rotation, or `None`
    /// if the registry is empty.
    ///
    /// This is an atomic read-then-advance: the cursor is never observed
    /// twice for the same value by two concurrent callers.
    pub fn next(&self) -> Option<ClusterDescriptor> {
        let mut state = self.state.lock().expect("registry mutex poisoned");
        if state.clusters.is_empty() {
            return None;
        }

        let index = state.cursor;
        state.cursor = (state.cursor + 1) % state.clusters.len();
        let descriptor = state.clusters[index].clone();
        tracing::debug!(cluster = descriptor.name(), index, "selected cluster");
        Some(descriptor)
    }

    /// Looks up a cluster by its human-readable name.
    pub fn find_by_name(&self, name: &str) -> Option<ClusterDescriptor> {
        let state = self.state.lock().expect("registry mutex poisoned");
        state.clusters.iter().find(|c| c.name() == name).cloned()
    }

    /// The number of clusters currently registered.
    pub fn count(&self) -> usize {
        self.state.lock().expect("registry mutex poisoned").clusters.len()
    }

    /// A secret-free projection of every registered cluster, in order.
    pub fn list_info(&self) -> Vec<ClusterInfo> {
        let state = self.state.lock().expect("registry mutex poisoned");
        state
            .clusters
            .iter()
            .enumerate()
            .map(|(index, c)| ClusterInfo {
                index,
                name: c.name().to_string(),
                endpoint: c.endpoint().clone(),
                auth_kind: c.auth().kind(),
                tls_verify: c.tls_verify(),
            })
            .collect()
    }

    /// Resets the registry to empty, atomically.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("registry mutex poisoned");
        state.clusters.clear();
        state.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_descriptor(host: &str) -> ClusterDescriptor {
        ClusterDescriptor::new(
            Url::parse(&format!("https://{host}")).unwrap(),
            ClusterAuthInput {
                token: Some(SecretString::from("tok")),
                ..Default::default()
            },
            true,
            None,
        )
        .unwrap()
    }

    #[test]
    fn rejects_cluster_without_credentials() {
        let err = ClusterDescriptor::new(
            Url::parse("https://oscar.example.com").unwrap(),
            ClusterAuthInput::default(),
            true,
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_username_without_password() {
        let err = ClusterDescriptor::new(
            Url::parse("https://oscar.example.com").unwrap(),
            ClusterAuthInput {
                username: Some("alice".to_string()),
                ..Default::default()
            },
            true,
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_token_and_basic_auth_together() {
        let err = ClusterDescriptor::new(
            Url::parse("https://oscar.example.com").unwrap(),
            ClusterAuthInput {
                token: Some(SecretString::from("tok")),
                username: Some("alice".to_string()),
                password: Some(SecretString::from("secret")),
            },
            true,
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn accepts_basic_auth() {
        let d = ClusterDescriptor::new(
            Url::parse("https://oscar.example.com").unwrap(),
            ClusterAuthInput {
                username: Some("alice".to_string()),
                password: Some(SecretString::from("secret")),
                ..Default::default()
            },
            true,
            None,
        )
        .unwrap();
        assert_eq!(d.auth().kind(), "basic");
    }

    #[test]
    fn default_name_uses_endpoint_host() {
        let d = token_descriptor("oscar.example.com");
        assert_eq!(d.name(), "cluster-oscar.example.com");
    }

    #[test]
    fn round_robin_visits_each_cluster_once() {
        let registry = ClusterRegistry::new();
        registry.add(token_descriptor("c1.example.com"));
        registry.add(token_descriptor("c2.example.com"));
        registry.add(token_descriptor("c3.example.com"));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(registry.next().unwrap().name().to_string());
        }
        seen.sort();
        assert_eq!(
            seen,
            vec!["cluster-c1.example.com", "cluster-c2.example.com", "cluster-c3.example.com"]
        );

        // A second full rotation visits the same three clusters in the same order.
        let mut second = Vec::new();
        for _ in 0..3 {
            second.push(registry.next().unwrap().name().to_string());
        }
        let mut first = Vec::new();
        for _ in 0..3 {
            first.push(registry.next().unwrap().name().to_string());
        }
        assert_eq!(second, first);
    }

    #[test]
    fn empty_registry_returns_none() {
        let registry = ClusterRegistry::new();
        assert!(registry.next().is_none());
    }

    #[test]
    fn clear_resets_cursor() {
        let registry = ClusterRegistry::new();
        registry.add(token_descriptor("c1.example.com"));
        registry.add(token_descriptor("c2.example.com"));
        registry.next();
        registry.clear();
        assert_eq!(registry.count(), 0);
        assert!(registry.next().is_none());
    }
}
