use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliWorkerDialect {
    /// Persistent Julia interpreter.
    Julia,
    /// POSIX shell speaking the same protocol; used for smoke tests.
    Shell,
}

#[derive(Debug, Parser)]
#[command(
    name = "autocode",
    about = "Function store and persistent Julia worker exposed as a line-delimited JSON-RPC tool server",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "AUTOCODE_JULIA",
        default_value = "julia",
        help = "Julia executable used for the persistent worker"
    )]
    pub julia: PathBuf,

    #[arg(
        long = "worker-dialect",
        env = "AUTOCODE_WORKER_DIALECT",
        value_enum,
        default_value_t = CliWorkerDialect::Julia,
        help = "Interpreter protocol spoken by the worker process"
    )]
    pub worker_dialect: CliWorkerDialect,

    #[arg(
        long,
        env = "AUTOCODE_SHELL",
        default_value = "/bin/sh",
        help = "Shell executable used when --worker-dialect=shell"
    )]
    pub shell: PathBuf,

    #[arg(
        long = "db-path",
        env = "AUTOCODE_DB_PATH",
        default_value = "autocode_db.json",
        help = "Function store document"
    )]
    pub db_path: PathBuf,

    #[arg(
        long = "log-path",
        env = "MCP_AUTOCODE_LOG",
        default_value = "autocode_mcp.log",
        help = "NDJSON audit log written by the server"
    )]
    pub log_path: PathBuf,

    #[arg(
        long = "default-timeout-ms",
        env = "AUTOCODE_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Timeout for eval calls that do not pass timeout_ms"
    )]
    pub default_timeout_ms: u64,

    #[arg(
        long = "test-timeout-ms",
        env = "AUTOCODE_TEST_TIMEOUT_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64,
        help = "Timeout for each unit test and property-test run"
    )]
    pub test_timeout_ms: u64,

    #[arg(
        long = "stop-grace-ms",
        env = "AUTOCODE_STOP_GRACE_MS",
        default_value_t = 2_000,
        help = "Grace period between closing worker stdin and killing it"
    )]
    pub stop_grace_ms: u64,

    #[arg(
        long = "block-unsafe-code",
        env = "AUTOCODE_BLOCK_UNSAFE_CODE",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Reject code with lint errors"
    )]
    pub block_unsafe_code: bool,

    #[arg(
        long = "allow-lint-warnings",
        env = "AUTOCODE_ALLOW_LINT_WARNINGS",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Accept code whose only lint findings are warnings"
    )]
    pub allow_lint_warnings: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum CliCommand {
    /// Serve JSON-RPC requests on stdin/stdout (the default).
    Serve,
    /// Evaluate one expression in a fresh worker and print the outcome.
    Eval {
        expression: String,
        #[arg(long = "timeout-ms", value_parser = parse_positive_u64)]
        timeout_ms: Option<u64>,
    },
}
