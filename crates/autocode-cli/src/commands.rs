use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use autocode_core::LogRotationPolicy;
use autocode_mcp::{
    autocode_registry, AuditLog, McpServer, OutboundWriter, ServeReport, ServerConfig,
};
use serde_json::json;

use crate::bootstrap::{build_runner, build_services};
use crate::cli_args::{Cli, CliCommand};

pub(crate) fn run(cli: Cli) -> Result<()> {
    match cli.command.clone().unwrap_or(CliCommand::Serve) {
        CliCommand::Serve => {
            let stdin = io::stdin();
            let report = serve(&cli, stdin.lock(), OutboundWriter::stdout())?;
            tracing::info!(
                processed_lines = report.processed_lines,
                error_count = report.error_count,
                abandoned_streams = report.abandoned_streams,
                "autocode server stopped"
            );
            Ok(())
        }
        CliCommand::Eval {
            expression,
            timeout_ms,
        } => {
            let timeout = Duration::from_millis(timeout_ms.unwrap_or(cli.default_timeout_ms));
            let stdout = io::stdout();
            eval(&cli, &expression, timeout, &mut stdout.lock())
        }
    }
}

/// Runs the tool server over `reader`, stopping the worker once input ends.
pub(crate) fn serve<R: BufRead>(
    cli: &Cli,
    reader: R,
    writer: OutboundWriter,
) -> Result<ServeReport> {
    let runner = build_runner(cli);
    let services = build_services(cli, runner.clone())?;
    let registry = autocode_registry(services).context("failed to build tool registry")?;
    let audit = AuditLog::open(&cli.log_path, LogRotationPolicy::from_env());
    let server = McpServer::new(ServerConfig::default(), registry, writer, audit);
    let report = server.serve(reader);
    runner.stop();
    report
}

pub(crate) fn eval(
    cli: &Cli,
    expression: &str,
    timeout: Duration,
    out: &mut dyn Write,
) -> Result<()> {
    let runner = build_runner(cli);
    let outcome = runner.eval(expression, timeout);
    runner.stop();
    let report = json!({
        "success": outcome.success,
        "output": outcome.payload,
        "failure": outcome.failure.map(|kind| kind.as_str()),
    });
    writeln!(out, "{report}").context("failed to write eval result")?;
    if !outcome.success {
        bail!("evaluation failed");
    }
    Ok(())
}
