use std::time::Duration;

use autocode_worker::RunFailureKind;
use serde_json::json;

use super::{failure, optional_u64, required_non_blank_str, success, AutocodeServices};
use crate::registry::{object_schema, Tool};

pub(super) fn tools(services: &AutocodeServices) -> Vec<Tool> {
    let executor = services.executor.clone();
    let default_timeout = services.settings.eval_timeout;
    vec![Tool::new(
        "eval_julia",
        "Evaluate one Julia expression in the persistent worker.",
        object_schema(
            json!({
                "expression": {"type": "string"},
                "timeout_ms": {"type": ["integer", "null"], "minimum": 1},
            }),
            &["expression"],
        ),
        move |arguments| {
            let expression = required_non_blank_str(arguments, "expression")?;
            let timeout = optional_u64(arguments, "timeout_ms")?
                .filter(|millis| *millis > 0)
                .map(Duration::from_millis)
                .unwrap_or(default_timeout);
            let outcome = executor.execute(expression, timeout);
            if outcome.success {
                return Ok(success(json!({ "success": true, "output": outcome.payload })));
            }
            let (error_type, suggested_action) = match outcome.failure {
                Some(RunFailureKind::Timeout) => (
                    "ExecutionTimedOut",
                    "Simplify the expression or raise timeout_ms.",
                ),
                Some(_) => (
                    "InterpreterCrashed",
                    "The worker was restarted; retry the expression.",
                ),
                None => ("EvaluationFailed", "Fix the error reported by the interpreter."),
            };
            Ok(failure(
                error_type,
                format!("Evaluation failed: {}", first_line(&outcome.payload)),
                Some(suggested_action),
                Some(json!({ "output": outcome.payload })),
            ))
        },
    )]
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
