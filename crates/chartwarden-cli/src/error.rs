//! CLI error types

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// Flags that cannot be turned into a working operator
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(chartwarden::cli::config))]
    Config {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// The cluster could not be reached or configured
    #[error("Kubernetes client error: {message}")]
    #[diagnostic(code(chartwarden::cli::kube))]
    Kube { message: String },
}

impl CliError {
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    pub fn kube(err: impl std::fmt::Display) -> Self {
        Self::Kube {
            message: err.to_string(),
        }
    }
}
