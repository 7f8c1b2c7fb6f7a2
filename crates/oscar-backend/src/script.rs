//! POSIX shell script synthesis for a single job invocation.

use std::fmt::Write as _;

use indexmap::IndexMap;

/// The exit-code artifact name for a job, relative to the output bucket:
/// `<script basename>.exit_code`.
pub fn exit_code_artifact_name(script_basename: &str) -> String {
    format!("{script_basename}.exit_code")
}

/// Builds the POSIX shell script uploaded to a service's input bucket for one
/// job invocation.
///
/// Follows the per-job script contract: the script itself does not write the
/// exit-code artifact (the embedded launcher does, see [`crate::service`]'s
/// service script); it only runs the command, captures its exit status, and
/// best-effort copies its working tree onto the shared mount before exiting
/// with that status.
pub fn build_script(
    job_id: &str,
    env: &IndexMap<String, String>,
    command: &[String],
    stdout_redirect: Option<&str>,
) -> String {
    let mut script = String::new();
    writeln!(script, "#!/bin/bash").unwrap();
    writeln!(script, "export CWL_JOB_ID={}", double_quote(job_id)).unwrap();

    for (key, value) in env {
        writeln!(script, "export {key}={}", double_quote(value)).unwrap();
    }

    writeln!(script, "cd \"$TMP_OUTPUT_DIR\"").unwrap();

    let command_line = command.iter().map(|arg| shell_quote(arg)).collect::<Vec<_>>().join(" ");
    match stdout_redirect {
        Some(path) => writeln!(script, "{command_line} > {} 2>&1", shell_quote(path)).unwrap(),
        None => writeln!(script, "{command_line}").unwrap(),
    }

    writeln!(script, "exit_code=$?").unwrap();
    writeln!(script, "mkdir -p \"$CWL_MOUNT_PATH/$CWL_JOB_ID\"").unwrap();
    writeln!(
        script,
        "cp -r \"$TMP_OUTPUT_DIR\"/* \"$CWL_MOUNT_PATH/$CWL_JOB_ID\" 2>/dev/null || true"
    )
    .unwrap();
    writeln!(script, "exit $exit_code").unwrap();

    script
}

/// Double-quotes a value for use in a shell `export NAME=<value>` statement,
/// escaping `"` and `$` so the runtime value matches `value` byte-for-byte.
pub fn double_quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"").replace('$', "\\$");
    format!("\"{escaped}\"")
}

/// Single-quotes a value for safe inclusion as a POSIX shell word, escaping
/// any embedded single quote as `'\''`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn double_quote_escapes_dollar_and_quote() {
        assert_eq!(double_quote(r#"a"b$c"#), r#""a\"b\$c""#);
    }

    #[test]
    fn single_quote_escapes_embedded_quote() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn script_exports_job_id_and_env_vars() {
        let mut env = IndexMap::new();
        env.insert("FOO".to_string(), "bar $baz".to_string());
        let script = build_script("job-1_1700000000", &env, &["true".to_string()], None);
        assert!(script.contains("export CWL_JOB_ID=\"job-1_1700000000\""));
        assert!(script.contains("export FOO=\"bar \\$baz\""));
    }

    #[test]
    fn script_redirects_stdout_and_stderr_when_given() {
        let script = build_script(
            "job-1",
            &IndexMap::new(),
            &["echo".to_string(), "hi".to_string()],
            Some("stdout.log"),
        );
        assert!(script.contains("'echo' 'hi' > 'stdout.log' 2>&1"));
    }

    #[test]
    fn script_copies_working_tree_to_mount_and_preserves_exit_code() {
        let script = build_script("job-1", &IndexMap::new(), &["false".to_string()], None);
        assert!(script.contains("exit_code=$?"));
        assert!(script.contains("cp -r \"$TMP_OUTPUT_DIR\"/* \"$CWL_MOUNT_PATH/$CWL_JOB_ID\""));
        assert!(script.contains("exit $exit_code"));
    }

    #[test]
    fn exit_code_artifact_name_is_basename_suffixed() {
        assert_eq!(exit_code_artifact_name("run_job-1"), "run_job-1.exit_code");
    }
}
