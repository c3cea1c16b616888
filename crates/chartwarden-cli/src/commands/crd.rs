//! Crd command - print the HelmRelease CustomResourceDefinition

use chartwarden_core::HelmRelease;
use kube::CustomResourceExt;
use miette::{IntoDiagnostic, Result};

/// CRD manifest as YAML
pub fn render() -> Result<String> {
    serde_yaml::to_string(&HelmRelease::crd()).into_diagnostic()
}

pub fn run() -> Result<()> {
    print!("{}", render()?);
    Ok(())
}
