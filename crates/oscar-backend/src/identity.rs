//! Derivation of service requirements and the stable service identity from a
//! CWL tool specification.

use std::collections::BTreeMap;

use md5::Digest;
use md5::Md5;
use serde::Serialize;
use serde_json::Value;

/// The fixed prefix used in every generated service identity.
pub const SERVICE_NAME_PREFIX: &str = "cwl-oscar";

/// The default container image used when a tool specifies no
/// `DockerRequirement`.
pub const DEFAULT_IMAGE: &str = "ghcr.io/grycap/oscar-cwl-runner:latest";

/// The default memory allocation, in MiB, for a service.
pub const DEFAULT_MEMORY_MIB: u64 = 1024;

/// The default fractional core allocation for a service.
pub const DEFAULT_CORES: f64 = 1.0;

/// The number of hex characters retained from the MD5 digest when building a
/// service identity.
pub const HASH_LEN: usize = 8;

/// A normalized, defaulted view of a tool's resource requirements.
///
/// Derived from a tool spec's `requirements`/`hints` lists per spec.md §3/§4.2:
/// `requirements` entries are processed before `hints`, hints only fill in a
/// field the spec left unset, and later entries in the same list win ties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRequirements {
    /// The container image to run the job in.
    pub image: String,
    /// The memory allocation, in MiB.
    pub memory_mib: u64,
    /// The fractional core allocation.
    pub cores: f64,
    /// Environment variables to inject into the job, in a stable (sorted)
    /// order so that identity hashing is deterministic.
    pub env_vars: BTreeMap<String, String>,
}

impl Default for ServiceRequirements {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            memory_mib: DEFAULT_MEMORY_MIB,
            cores: DEFAULT_CORES,
            env_vars: BTreeMap::new(),
        }
    }
}

/// The subset of a tool specification's fields this crate derives
/// requirements and identity from.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolSpec {
    /// The CWL `class` of the tool (expected to be `CommandLineTool`).
    pub class: String,
    /// The base command, as a list of argv elements.
    pub base_command: Vec<String>,
    /// The `requirements` list, each entry an arbitrary JSON object tagged by
    /// `class`.
    pub requirements: Vec<Value>,
    /// The `hints` list, in the same shape as `requirements`.
    pub hints: Vec<Value>,
}

impl ToolSpec {
    /// Parses the fields this crate cares about out of an opaque CWL tool
    /// mapping, ignoring everything else (argument binding, expression
    /// evaluation, and so on are the host CWL runtime's responsibility).
    pub fn from_value(spec: &Value) -> Self {
        let class = spec
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let base_command = match spec.get("baseCommand") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        };

        let requirements = spec
            .get("requirements")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let hints = spec
            .get("hints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Self {
            class,
            base_command,
            requirements,
            hints,
        }
    }
}

/// Derives [`ServiceRequirements`] from a tool spec's `requirements` and
/// `hints` lists.
///
/// `requirements` entries are applied first (later entries in the list
/// override earlier ones for the same field), then `hints` entries only fill
/// in fields `requirements` left at their default. Environment variables are
/// merged from every source, last-seen wins on key collision.
pub fn derive_requirements(spec: &ToolSpec) -> ServiceRequirements {
    let mut reqs = ServiceRequirements::default();
    let mut image_set = false;
    let mut memory_set = false;
    let mut cores_set = false;

    apply_entries(&spec.requirements, &mut reqs, &mut image_set, &mut memory_set, &mut cores_set);

    // Hints only override a field the spec left unset.
    let mut hint_reqs = ServiceRequirements::default();
    let mut hint_image_set = false;
    let mut hint_memory_set = false;
    let mut hint_cores_set = false;
    apply_entries(
        &spec.hints,
        &mut hint_reqs,
        &mut hint_image_set,
        &mut hint_memory_set,
        &mut hint_cores_set,
    );

    if !image_set && hint_image_set {
        reqs.image = hint_reqs.image;
    }
    if !memory_set && hint_memory_set {
        reqs.memory_mib = hint_reqs.memory_mib;
    }
    if !cores_set && hint_cores_set {
        reqs.cores = hint_reqs.cores;
    }
    // Env vars merge unconditionally from both sources; hints are applied
    // after requirements, so a hint overwrites a requirement's value on key
    // collision (last-seen wins).
    for (k, v) in hint_reqs.env_vars {
        reqs.env_vars.insert(k, v);
    }

    reqs
}

/// Applies a `requirements`- or `hints`-shaped list of typed entries onto a
/// [`ServiceRequirements`], tracking which fields were explicitly set.
fn apply_entries(
    entries: &[Value],
    reqs: &mut ServiceRequirements,
    image_set: &mut bool,
    memory_set: &mut bool,
    cores_set: &mut bool,
) {
    for entry in entries {
        let Some(class) = entry.get("class").and_then(Value::as_str) else {
            continue;
        };

        match class {
            "DockerRequirement" => {
                if let Some(pull) = entry.get("dockerPull").and_then(Value::as_str) {
                    reqs.image = pull.to_string();
                    *image_set = true;
                }
            }
            "ResourceRequirement" => {
                if let Some(ram) = entry.get("ramMin").and_then(Value::as_f64) {
                    reqs.memory_mib = ram as u64;
                    *memory_set = true;
                }
                if let Some(cores) = entry.get("coresMin").and_then(Value::as_f64) {
                    reqs.cores = cores;
                    *cores_set = true;
                }
            }
            "EnvVarRequirement" => {
                if let Some(env_def) = entry.get("envDef").and_then(Value::as_object) {
                    for (k, v) in env_def {
                        if let Some(v) = v.as_str() {
                            reqs.env_vars.insert(k.clone(), v.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

/// Sanitizes a raw job/tool name into the `[a-z0-9-]` slug used in a service
/// identity: lowercased, underscores become hyphens, anything else not in
/// `[a-z0-9-]` is stripped, and leading/trailing hyphens are trimmed. An
/// empty result falls back to `"tool"`.
pub fn sanitize_name(name: &str) -> String {
    let lowered = name.to_lowercase().replace('_', "-");
    let filtered: String = lowered
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();
    let trimmed = filtered.trim_matches('-');
    if trimmed.is_empty() {
        "tool".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Computes the stable service identity for a tool spec and job name:
/// `<prefix>-<sanitized-name>-<hash8>`, where `hash8` is the first 8 hex
/// characters of the MD5 digest of the canonical JSON
/// `{baseCommand, class, requirements}`.
///
/// The same tool and requirements always produce the same identity, across
/// clusters and across runs; `sanitize(identity(n, r)) == identity(n, r)`,
/// i.e. the identity is itself already a valid sanitized slug.
pub fn service_identity(spec: &ToolSpec, job_name: Option<&str>, requirements: &ServiceRequirements) -> String {
    let name = sanitize_name(job_name.unwrap_or("tool"));

    #[derive(Serialize)]
    struct Canonical<'a> {
        #[serde(rename = "baseCommand")]
        base_command: &'a [String],
        class: &'a str,
        requirements: &'a ServiceRequirements,
    }

    let canonical = Canonical {
        base_command: &spec.base_command,
        class: &spec.class,
        requirements,
    };
    // `serde_json` with the `preserve_order` feature serializes struct fields
    // in declaration order, giving a stable canonical form across runs.
    let json = serde_json::to_string(&canonical).expect("requirements are always serializable");

    let mut hasher = Md5::new();
    hasher.update(json.as_bytes());
    let digest = hasher.finalize();
    let hex = hex::encode(digest);

    format!("{SERVICE_NAME_PREFIX}-{name}-{hash}", hash = &hex[..HASH_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(base_command: &[&str], requirements: Vec<Value>, hints: Vec<Value>) -> ToolSpec {
        ToolSpec {
            class: "CommandLineTool".to_string(),
            base_command: base_command.iter().map(|s| s.to_string()).collect(),
            requirements,
            hints,
        }
    }

    #[test]
    fn defaults_when_no_requirements() {
        let reqs = derive_requirements(&spec(&["echo"], vec![], vec![]));
        assert_eq!(reqs.image, DEFAULT_IMAGE);
        assert_eq!(reqs.memory_mib, DEFAULT_MEMORY_MIB);
        assert_eq!(reqs.cores, DEFAULT_CORES);
        assert!(reqs.env_vars.is_empty());
    }

    #[test]
    fn docker_requirement_overrides_image() {
        let reqs = derive_requirements(&spec(
            &["echo"],
            vec![serde_json::json!({"class": "DockerRequirement", "dockerPull": "alpine:3.19"})],
            vec![],
        ));
        assert_eq!(reqs.image, "alpine:3.19");
    }

    #[test]
    fn hints_only_fill_unset_fields() {
        let reqs = derive_requirements(&spec(
            &["echo"],
            vec![serde_json::json!({"class": "ResourceRequirement", "ramMin": 2048})],
            vec![serde_json::json!({
                "class": "ResourceRequirement", "ramMin": 99999, "coresMin": 2.0
            })],
        ));
        // requirements already set ram, so the hint's ram is ignored.
        assert_eq!(reqs.memory_mib, 2048);
        // requirements left cores unset, so the hint's cores apply.
        assert_eq!(reqs.cores, 2.0);
    }

    #[test]
    fn later_entries_in_same_list_win() {
        let reqs = derive_requirements(&spec(
            &["echo"],
            vec![
                serde_json::json!({"class": "DockerRequirement", "dockerPull": "first:1"}),
                serde_json::json!({"class": "DockerRequirement", "dockerPull": "second:2"}),
            ],
            vec![],
        ));
        assert_eq!(reqs.image, "second:2");
    }

    #[test]
    fn env_vars_merge_last_seen_wins() {
        let reqs = derive_requirements(&spec(
            &["echo"],
            vec![serde_json::json!({
                "class": "EnvVarRequirement",
                "envDef": {"FOO": "1"}
            })],
            vec![serde_json::json!({
                "class": "EnvVarRequirement",
                "envDef": {"FOO": "2", "BAR": "3"}
            })],
        ));
        // Requirements are processed first, but hints are last-seen, so a
        // hint's value for a colliding key overwrites the requirement's.
        assert_eq!(reqs.env_vars.get("FOO").unwrap(), "2");
        assert_eq!(reqs.env_vars.get("BAR").unwrap(), "3");
    }

    #[test]
    fn sanitize_name_rules() {
        assert_eq!(sanitize_name("My_Tool Name!"), "my-toolname");
        assert_eq!(sanitize_name(""), "tool");
        assert_eq!(sanitize_name("___"), "tool");
        assert_eq!(sanitize_name("-leading-trailing-"), "leading-trailing");
    }

    #[test]
    fn identity_is_stable_across_calls() {
        let spec = spec(&["echo", "hi"], vec![], vec![]);
        let reqs = derive_requirements(&spec);
        let a = service_identity(&spec, Some("my_job"), &reqs);
        let b = service_identity(&spec, Some("my_job"), &reqs);
        assert_eq!(a, b);
        assert!(a.starts_with("cwl-oscar-my-job-"));
    }

    #[test]
    fn identity_ignores_requirement_ordering_for_distinct_fields() {
        let spec_a = spec(
            &["echo"],
            vec![
                serde_json::json!({"class": "DockerRequirement", "dockerPull": "alpine:3.19"}),
                serde_json::json!({"class": "ResourceRequirement", "ramMin": 2048}),
            ],
            vec![],
        );
        let spec_b = spec(
            &["echo"],
            vec![
                serde_json::json!({"class": "ResourceRequirement", "ramMin": 2048}),
                serde_json::json!({"class": "DockerRequirement", "dockerPull": "alpine:3.19"}),
            ],
            vec![],
        );
        let reqs_a = derive_requirements(&spec_a);
        let reqs_b = derive_requirements(&spec_b);
        assert_eq!(reqs_a, reqs_b);
        assert_eq!(
            service_identity(&spec_a, Some("tool"), &reqs_a),
            service_identity(&spec_b, Some("tool"), &reqs_b)
        );
    }

    #[test]
    fn identity_round_trips_through_sanitize() {
        let spec = spec(&["echo"], vec![], vec![]);
        let reqs = derive_requirements(&spec);
        let identity = service_identity(&spec, Some("tool-X_Y"), &reqs);
        assert_eq!(sanitize_name(&identity), identity);
    }

    #[test]
    fn default_job_name_is_tool() {
        let spec = spec(&["echo"], vec![], vec![]);
        let reqs = derive_requirements(&spec);
        let identity = service_identity(&spec, None, &reqs);
        assert!(identity.starts_with("cwl-oscar-tool-"));
    }
}
