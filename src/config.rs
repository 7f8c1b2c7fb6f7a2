//! Binary-level configuration loading: a TOML file (via the `config` crate)
//! deserialized directly into [`oscar_backend::config::Config`].

use std::path::Path;

use anyhow::Context;
use oscar_backend::config::Config;

/// Loads a [`Config`] from a TOML file at `path`.
///
/// Environment variables prefixed `CWL_OSCAR_` override individual fields
/// (e.g. `CWL_OSCAR_MOUNT_PATH`), following the `config` crate's usual
/// layering of a file source under an environment source.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("CWL_OSCAR").separator("_"))
        .build()
        .with_context(|| format!("loading configuration from `{}`", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| format!("parsing configuration from `{}`", path.display()))
}
