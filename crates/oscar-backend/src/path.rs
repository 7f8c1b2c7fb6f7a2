//! The path resolver: recognizes files already on the shared mount so the
//! host's generic path mapping does not stage a redundant copy of them.

use std::path::Path;
use std::path::PathBuf;

/// A single entry in the host's generic path mapping, as handed to this
/// crate for possible rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    /// The resolved source path on the host.
    pub resolved: PathBuf,
    /// The path the host intends the file to appear at inside the container.
    pub target: PathBuf,
    /// Whether the host's generic mapper intends to stage (copy) this file.
    pub staged: bool,
}

/// Rewrites a single path mapping entry in place: if `resolved` already lives
/// under the shared mount root, staging is unnecessary because every cluster
/// sees the same mount, so the entry becomes `{resolved, target: resolved,
/// staged: false}`.
///
/// Mirrors the host's mapping for any file not under the mount root.
pub fn resolve(mapping: PathMapping, mount_root: &Path) -> PathMapping {
    if is_under_mount(&mapping.resolved, mount_root) {
        PathMapping {
            target: mapping.resolved.clone(),
            staged: false,
            ..mapping
        }
    } else {
        mapping
    }
}

/// Rewrites every entry of a host path mapping.
pub fn resolve_all(mappings: Vec<PathMapping>, mount_root: &Path) -> Vec<PathMapping> {
    mappings.into_iter().map(|m| resolve(m, mount_root)).collect()
}

/// Determines whether `path` lives under `mount_root`, by component prefix
/// comparison rather than string prefix (so `/mnt/cwl2` is not mistakenly
/// considered under `/mnt/cwl`).
fn is_under_mount(path: &Path, mount_root: &Path) -> bool {
    path.starts_with(mount_root)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn mapping(resolved: &str, target: &str, staged: bool) -> PathMapping {
        PathMapping {
            resolved: PathBuf::from(resolved),
            target: PathBuf::from(target),
            staged,
        }
    }

    #[test]
    fn bypasses_staging_for_files_already_under_mount() {
        let mount_root = Path::new("/mnt/cwl-oscar/mount");
        let input = mapping("/mnt/cwl-oscar/mount/inputs/a.txt", "/work/a.txt", true);
        let output = resolve(input, mount_root);
        assert_eq!(output.resolved, PathBuf::from("/mnt/cwl-oscar/mount/inputs/a.txt"));
        assert_eq!(output.target, PathBuf::from("/mnt/cwl-oscar/mount/inputs/a.txt"));
        assert!(!output.staged);
    }

    #[test]
    fn leaves_files_outside_mount_untouched() {
        let mount_root = Path::new("/mnt/cwl-oscar/mount");
        let input = mapping("/home/user/workflow/a.txt", "/work/a.txt", true);
        let output = resolve(input.clone(), mount_root);
        assert_eq!(output, input);
    }

    #[test]
    fn does_not_match_sibling_directory_with_shared_prefix() {
        let mount_root = Path::new("/mnt/cwl-oscar");
        let input = mapping("/mnt/cwl-oscar-backup/a.txt", "/work/a.txt", true);
        let output = resolve(input.clone(), mount_root);
        assert_eq!(output, input, "a path string-prefixed but not component-prefixed must not match");
    }

    #[test]
    fn resolve_all_rewrites_every_entry() {
        let mount_root = Path::new("/mnt/cwl-oscar/mount");
        let mappings = vec![
            mapping("/mnt/cwl-oscar/mount/a.txt", "/work/a.txt", true),
            mapping("/home/user/b.txt", "/work/b.txt", true),
        ];
        let resolved = resolve_all(mappings, mount_root);
        assert!(!resolved[0].staged);
        assert!(resolved[1].staged);
    }
}
