//! The command line surface, grounded in the original `cwl-oscar` and
//! `local_runner.py` argument parsers.

use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use url::Url;

use crate::commands::LocalRunnerCommand;
use crate::commands::RunCommand;
use crate::logging::Verbosity;

/// `cwl-oscar`: an OSCAR execution backend for Common Workflow Language
/// tools.
#[derive(Parser)]
#[clap(name = "cwl-oscar", version, propagate_version = true, arg_required_else_help = true)]
pub struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,

    /// Suppresses informational logging, leaving only warnings and errors.
    #[clap(long, global = true, conflicts_with = "debug")]
    pub quiet: bool,

    /// Enables debug-level logging.
    #[clap(long, global = true)]
    pub debug: bool,
}

impl Cli {
    /// The verbosity selected by `--quiet`/`--debug`.
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else if self.debug {
            Verbosity::Debug
        } else {
            Verbosity::Normal
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Dispatches a single prepared CWL step to an OSCAR cluster.
    Run(RunCommand),

    /// Uploads a workflow and its inputs, submits it to a cwl-oscar service,
    /// and downloads the results once it completes.
    LocalRunner(LocalRunnerCommand),
}

/// The connection arguments shared by every subcommand that talks to a
/// single OSCAR cluster directly from the command line.
///
/// A multi-cluster deployment should use `--config` instead (see
/// [`crate::config`]); these flags exist for parity with the original
/// single-endpoint CLI.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// The OSCAR cluster's endpoint URL. Required unless `--config` supplies
    /// the cluster list instead.
    #[clap(long)]
    pub oscar_endpoint: Option<Url>,

    /// An OIDC bearer token, mutually exclusive with `--oscar-username`.
    #[clap(long, conflicts_with = "oscar_username")]
    pub oscar_token: Option<String>,

    /// A basic-auth username, mutually exclusive with `--oscar-token`.
    #[clap(long, conflicts_with = "oscar_token")]
    pub oscar_username: Option<String>,

    /// A basic-auth password, required when `--oscar-username` is given.
    #[clap(long, requires = "oscar_username")]
    pub oscar_password: Option<String>,

    /// Disables TLS certificate verification for this cluster.
    #[clap(long)]
    pub disable_ssl: bool,
}

impl ClusterArgs {
    /// Validates and builds a registry-ready cluster descriptor.
    ///
    /// Fails if `--oscar-endpoint` was not given; callers that accept a
    /// `--config` alternative should only reach this when no config file
    /// was supplied.
    pub fn into_descriptor(self) -> anyhow::Result<oscar_backend::registry::ClusterDescriptor> {
        use oscar_backend::registry::ClusterAuthInput;
        use oscar_backend::registry::ClusterDescriptor;
        use secrecy::SecretString;

        let endpoint = self
            .oscar_endpoint
            .ok_or_else(|| anyhow::anyhow!("--oscar-endpoint is required"))?;

        let auth = ClusterAuthInput {
            token: self.oscar_token.map(SecretString::from),
            username: self.oscar_username,
            password: self.oscar_password.map(SecretString::from),
        };

        Ok(ClusterDescriptor::new(endpoint, auth, !self.disable_ssl, None)?)
    }
}

/// Expands a leading `~` in a path-valued CLI argument, so mount paths and
/// output directories can be given relative to the invoking user's home.
pub fn expand_path(s: &str) -> Result<PathBuf, std::convert::Infallible> {
    Ok(PathBuf::from(shellexpand::tilde(s).into_owned()))
}
