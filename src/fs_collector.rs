//! A generic, schema-unaware [`OutputCollector`] used by the `run` harness.
//!
//! A production host owns the CWL output schema (globs, secondary files,
//! `CommandOutputBinding`) and supplies its own collector; this one simply
//! walks the job's output directory and reports every regular file found,
//! useful for smoke-testing a cluster without a full CWL runtime attached.

use std::path::Path;

use oscar_backend::host::OutputCollector;
use serde_json::Map;
use serde_json::Value;
use walkdir::WalkDir;

/// Walks a job's output directory and reports each file under it as a CWL
/// `File` object, keyed by its path relative to the directory.
pub struct WalkingOutputCollector;

impl OutputCollector for WalkingOutputCollector {
    fn collect(&self, job_output_dir: &Path) -> Result<Value, anyhow::Error> {
        let mut outputs = Map::new();

        for entry in WalkDir::new(job_output_dir).into_iter() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(job_output_dir).unwrap_or(path);
            let key = relative.to_string_lossy().replace('\\', "/");

            outputs.insert(
                key,
                serde_json::json!({
                    "class": "File",
                    "path": path.to_string_lossy(),
                    "basename": path.file_name().map(|n| n.to_string_lossy().to_string()),
                }),
            );
        }

        Ok(Value::Object(outputs))
    }
}
