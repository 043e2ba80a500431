use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autocode_mcp::{AutocodeServices, ToolSettings};
use autocode_store::{CompatibilityLinter, JsonFunctionStore, LinterConfig};
use autocode_worker::{JuliaDialect, ShellDialect, SingleFlightRunner, WorkerConfig, WorkerDialect};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli_args::{Cli, CliWorkerDialect};

/// Stdout carries protocol frames, so diagnostics go to stderr.
pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

pub(crate) fn build_runner(cli: &Cli) -> Arc<SingleFlightRunner> {
    let dialect: Arc<dyn WorkerDialect> = match cli.worker_dialect {
        CliWorkerDialect::Julia => Arc::new(JuliaDialect::new(&cli.julia)),
        CliWorkerDialect::Shell => Arc::new(ShellDialect::new(&cli.shell)),
    };
    let config = WorkerConfig {
        stop_grace: Duration::from_millis(cli.stop_grace_ms),
        ..WorkerConfig::default()
    };
    Arc::new(SingleFlightRunner::new(dialect, config))
}

pub(crate) fn linter_config(cli: &Cli) -> LinterConfig {
    LinterConfig {
        block_unsafe: cli.block_unsafe_code,
        allow_warnings: cli.allow_lint_warnings,
        ..LinterConfig::default()
    }
}

pub(crate) fn build_services(
    cli: &Cli,
    runner: Arc<SingleFlightRunner>,
) -> Result<AutocodeServices> {
    let store = JsonFunctionStore::open(&cli.db_path)
        .with_context(|| format!("failed to open function store {}", cli.db_path.display()))?;
    Ok(AutocodeServices {
        executor: runner,
        store: Arc::new(store),
        linter: Arc::new(CompatibilityLinter::new(linter_config(cli))),
        generator: None,
        settings: ToolSettings {
            eval_timeout: Duration::from_millis(cli.default_timeout_ms),
            test_timeout: Duration::from_millis(cli.test_timeout_ms),
            property_timeout: Duration::from_millis(cli.test_timeout_ms),
            ..ToolSettings::default()
        },
    })
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tempfile::tempdir;

    use super::{build_runner, build_services, linter_config};
    use crate::cli_args::Cli;

    #[test]
    fn unit_linter_config_follows_policy_flags() {
        let cli = Cli::try_parse_from(["autocode", "--block-unsafe-code=false"]).expect("parse");
        let config = linter_config(&cli);
        assert!(!config.block_unsafe);
        assert!(config.allow_warnings);
    }

    #[test]
    fn functional_services_open_store_at_db_path() {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("db.json");
        let cli = Cli::try_parse_from([
            "autocode",
            "--worker-dialect",
            "shell",
            "--db-path",
            db_path.to_str().expect("utf8 path"),
            "--test-timeout-ms",
            "1500",
        ])
        .expect("parse");
        let runner = build_runner(&cli);
        let services = build_services(&cli, runner.clone()).expect("services");
        assert_eq!(services.settings.test_timeout.as_millis(), 1500);
        assert_eq!(runner.dialect_name(), "sh");
        assert!(services.generator.is_none());
    }
}
