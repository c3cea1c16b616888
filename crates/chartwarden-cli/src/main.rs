//! Chartwarden - reconciles HelmRelease resources into Helm releases

use clap::{Parser, Subcommand};
use miette::Result;

mod commands;
mod error;
mod logging;

use commands::run::RunArgs;
use logging::LogFormat;

#[derive(Parser)]
#[command(name = "chartwarden")]
#[command(author = "Chartwarden Contributors")]
#[command(version)]
#[command(about = "GitOps operator for Helm releases", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(long, global = true, env = "CHARTWARDEN_DEBUG")]
    debug: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Fmt, env = "CHARTWARDEN_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch HelmRelease resources and reconcile their releases
    Run(Box<RunArgs>),

    /// Print the HelmRelease CustomResourceDefinition
    Crd,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup miette for nice error display
    miette::set_panic_hook();

    let cli = Cli::parse();
    logging::init(cli.debug, cli.log_format)?;

    match cli.command {
        Commands::Run(args) => commands::run::run(*args).await,
        Commands::Crd => commands::crd::run(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["chartwarden", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.workers, 1);
        assert_eq!(args.charts_sync_interval, Duration::from_secs(180));
        assert_eq!(args.status_update_interval, Duration::from_secs(30));
        assert_eq!(args.git_timeout, Duration::from_secs(20));
        assert_eq!(args.git_poll_interval, Duration::from_secs(300));
        assert_eq!(args.git_default_ref, "master");
        assert_eq!(args.enabled_helm_versions, vec!["v3"]);
        assert!(args.update_chart_deps);
        assert!(!args.log_release_diffs);
        assert!(args.allow_namespace.is_none());
        assert_eq!(cli.log_format, LogFormat::Fmt);
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "chartwarden",
            "run",
            "--allow-namespace",
            "flux",
            "--workers",
            "4",
            "--charts-sync-interval",
            "10m",
            "--update-chart-deps=false",
            "--enabled-helm-versions",
            "v3,v2",
            "--log-format",
            "json",
            "--debug",
        ])
        .unwrap();
        assert!(cli.debug);
        assert_eq!(cli.log_format, LogFormat::Json);

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.allow_namespace.as_deref(), Some("flux"));
        assert_eq!(args.workers, 4);
        assert_eq!(args.charts_sync_interval, Duration::from_secs(600));
        assert!(!args.update_chart_deps);
        assert_eq!(args.enabled_helm_versions, vec!["v3", "v2"]);
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        assert!(Cli::try_parse_from(["chartwarden", "run", "--git-timeout", "soon"]).is_err());
    }
}
