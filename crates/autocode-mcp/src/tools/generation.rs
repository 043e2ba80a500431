use std::thread;

use anyhow::Result;
use autocode_store::{GeneratedFunction, LintSeverity, NewFunction};
use serde_json::{json, Value};

use super::catalog::{issues_with_severity, lint_rejection};
use super::{failure, optional_str, required_str, store_failure, success_with, AutocodeServices};
use crate::registry::{object_schema, Tool, ToolArguments};
use crate::session::{StreamContext, StreamOutcome};

const NOT_AVAILABLE_MESSAGE: &str = "No function generator is configured";
const NOT_AVAILABLE_ACTION: &str = "Configure a generator or add the function with add_function.";

pub(super) fn tools(services: &AutocodeServices) -> Vec<Tool> {
    let sync_services = services.clone();
    let stream_services = services.clone();
    vec![Tool::new(
        "generate_function",
        "Generate a function from a description, lint it and store it with its tests.",
        object_schema(
            json!({
                "description": {"type": "string"},
                "module": {"type": ["string", "null"]},
            }),
            &["description"],
        ),
        move |arguments| generate_function(&sync_services, arguments),
    )
    .with_stream_handler(move |context, arguments| {
        stream_generate_function(&stream_services, context, arguments)
    })]
}

/// Generated code after linting, ready to store.
struct Candidate {
    generated: GeneratedFunction,
    code: String,
    warnings: Vec<Value>,
}

fn generate_and_lint(
    services: &AutocodeServices,
    description: &str,
    module: Option<&str>,
) -> Result<std::result::Result<Candidate, Value>> {
    let Some(generator) = services.generator.as_ref() else {
        return Ok(Err(failure(
            "NotAvailable",
            NOT_AVAILABLE_MESSAGE,
            Some(NOT_AVAILABLE_ACTION),
            None,
        )));
    };
    let generated = generator.generate(description, module)?;
    let report = services.linter.lint(&generated.code, true);
    if !report.success {
        return Ok(Err(lint_rejection(
            "Generated code contains compatibility errors",
            &report.issues,
        )));
    }
    let code = report
        .fixed_code
        .clone()
        .unwrap_or_else(|| generated.code.clone());
    Ok(Ok(Candidate {
        warnings: issues_with_severity(&report.issues, LintSeverity::Warning),
        generated,
        code,
    }))
}

fn generation_failed(error: &anyhow::Error) -> Value {
    failure(
        "GenerationFailed",
        format!("{error:#}"),
        Some("Retry with a more specific description."),
        None,
    )
}

/// Stores the function and its generated tests; returns the result payload or
/// a failure envelope.
fn store_candidate(
    services: &AutocodeServices,
    candidate: &Candidate,
    module: Option<&str>,
) -> std::result::Result<Value, Value> {
    let modules = module.map(str::to_string).into_iter().collect::<Vec<_>>();
    let record = services
        .store
        .add_function(NewFunction {
            name: candidate.generated.name.clone(),
            description: candidate.generated.description.clone(),
            code: candidate.code.clone(),
            modules: modules.clone(),
            tags: Vec::new(),
        })
        .map_err(|error| store_failure(&error))?;

    let mut tests = Vec::new();
    for test in &candidate.generated.tests {
        match services
            .store
            .add_test(&record.id, &test.name, &test.description, &test.code)
        {
            Ok(stored) => tests.push(json!({ "test_id": stored.id, "name": stored.name })),
            Err(error) => {
                tracing::warn!(
                    function_id = %record.id,
                    test = %test.name,
                    error = %error,
                    "failed to store generated test"
                );
            }
        }
    }
    tracing::info!(
        function_id = %record.id,
        name = %record.name,
        tests = tests.len(),
        "stored generated function"
    );
    Ok(json!({
        "function_id": record.id,
        "name": record.name,
        "description": record.description,
        "code": record.code,
        "modules": modules,
        "tests": tests,
        "lint_warnings": candidate.warnings,
    }))
}

fn generate_function(services: &AutocodeServices, arguments: &ToolArguments) -> Result<Value> {
    let description = required_str(arguments, "description")?;
    let module = optional_str(arguments, "module")?;
    let candidate = match generate_and_lint(services, description, module) {
        Ok(Ok(candidate)) => candidate,
        Ok(Err(envelope)) => return Ok(envelope),
        Err(error) => return Ok(generation_failed(&error)),
    };
    Ok(match store_candidate(services, &candidate, module) {
        Ok(result) => {
            let function_id = result["function_id"].clone();
            success_with(result, json!({ "function_id": function_id }))
        }
        Err(envelope) => envelope,
    })
}

fn stream_generate_function(
    services: &AutocodeServices,
    context: &StreamContext,
    arguments: &ToolArguments,
) -> Result<StreamOutcome> {
    let description = required_str(arguments, "description")?;
    let module = optional_str(arguments, "module")?;
    context.chunk(json!({ "progress": 0.05, "message": "generating function" }));
    let candidate = match generate_and_lint(services, description, module) {
        Ok(Ok(candidate)) => candidate,
        Ok(Err(envelope)) => return Ok(StreamOutcome::Failed(envelope["error"].clone())),
        Err(error) => {
            tracing::warn!(error = %format!("{error:#}"), "function generation failed");
            return Ok(StreamOutcome::Failed(generation_failed(&error)["error"].clone()));
        }
    };

    let lines = candidate.code.lines().collect::<Vec<_>>();
    let total = lines.len();
    for (index, line) in lines.iter().enumerate() {
        if context.is_cancelled() {
            return Ok(StreamOutcome::Cancelled(
                json!({ "at": index + 1, "total_lines": total }),
            ));
        }
        context.chunk(json!({
            "type": "code_line",
            "line_no": index + 1,
            "line": line,
            "progress": 0.1 + 0.6 * ((index + 1) as f64 / total as f64),
        }));
        if !services.settings.stream_line_delay.is_zero() {
            thread::sleep(services.settings.stream_line_delay);
        }
    }

    let result = match store_candidate(services, &candidate, module) {
        Ok(result) => result,
        Err(envelope) => return Ok(StreamOutcome::Failed(envelope["error"].clone())),
    };
    context.chunk(json!({
        "progress": 0.9,
        "message": "function stored",
        "function_id": result["function_id"],
    }));
    Ok(StreamOutcome::Complete(result))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::anyhow;
    use autocode_store::{FunctionStore, GeneratedFunction, GeneratedTest};
    use autocode_worker::RunOutcome;
    use serde_json::json;

    use crate::session::StreamOutcome;
    use crate::tools::test_support::{fixture, Fixture, QueuedGenerator, ScriptedExecutor};

    fn generated(code: &str) -> GeneratedFunction {
        GeneratedFunction {
            name: "clamp01".to_string(),
            description: "clamps to [0, 1]".to_string(),
            code: code.to_string(),
            tests: vec![GeneratedTest {
                name: "bounds".to_string(),
                description: "upper bound".to_string(),
                code: "@assert clamp01(2) == 1".to_string(),
            }],
        }
    }

    fn with_generator(responses: Vec<anyhow::Result<GeneratedFunction>>) -> Fixture {
        fixture(
            ScriptedExecutor::new(|_| RunOutcome::succeeded("")),
            Some(Arc::new(QueuedGenerator::new(responses))),
        )
    }

    const CLAMP: &str = "function clamp01(x)\n    max(0, min(1, x))\nend";

    #[test]
    fn functional_generate_without_generator_is_not_available() {
        let fixture = fixture(ScriptedExecutor::new(|_| RunOutcome::succeeded("")), None);
        let result = fixture.call("generate_function", json!({"description": "anything"}));
        assert_eq!(result["error"]["type"], "NotAvailable");
        let run = fixture.stream("generate_function", json!({"description": "anything"}), false);
        match run.outcome {
            StreamOutcome::Failed(error) => assert_eq!(error["type"], "NotAvailable"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn functional_generate_stores_function_module_and_tests() {
        let fixture = with_generator(vec![Ok(generated(CLAMP))]);
        let result = fixture.call(
            "generate_function",
            json!({"description": "clamp", "module": "numeric"}),
        );
        assert_eq!(result["ok"], true);
        let id = result["function_id"].as_str().expect("id");
        let record = fixture.store.get_function(id).expect("stored");
        assert_eq!(record.modules, vec!["numeric".to_string()]);
        assert_eq!(record.tests.len(), 1);
        assert_eq!(result["result"]["tests"][0]["name"], "bounds");
    }

    #[test]
    fn functional_generate_applies_lint_fixes_before_storing() {
        let fixture = with_generator(vec![Ok(generated(
            "function clamp01(max)\n    min(1, max)\nend",
        ))]);
        let result = fixture.call("generate_function", json!({"description": "clamp"}));
        let code = result["result"]["code"].as_str().expect("code");
        assert!(code.contains("clamp01(max_)"));
        assert!(!result["result"]["lint_warnings"]
            .as_array()
            .expect("warnings")
            .is_empty());
    }

    #[test]
    fn functional_generate_rejects_lint_errors_and_generator_failures() {
        let fixture = with_generator(vec![
            Ok(generated("clamp01(s) = match(/x+/y, s)")),
            Err(anyhow!("model unavailable")),
        ]);
        let rejected = fixture.call("generate_function", json!({"description": "clamp"}));
        assert_eq!(rejected["error"]["type"], "LintingFailed");
        let failed = fixture.call("generate_function", json!({"description": "clamp"}));
        assert_eq!(failed["error"]["type"], "GenerationFailed");
        assert!(failed["error"]["message"]
            .as_str()
            .expect("message")
            .contains("model unavailable"));
        assert!(fixture.store.list_functions(None, None).is_empty());
    }

    #[test]
    fn functional_stream_emits_code_lines_then_stores() {
        let fixture = with_generator(vec![Ok(generated(CLAMP))]);
        let run = fixture.stream("generate_function", json!({"description": "clamp"}), false);
        let code_lines = run
            .chunks
            .iter()
            .filter(|chunk| chunk["type"] == "code_line")
            .collect::<Vec<_>>();
        assert_eq!(code_lines.len(), 3);
        assert_eq!(code_lines[0]["line_no"], 1);
        assert_eq!(code_lines[2]["line"], "end");
        assert_eq!(run.chunks.last().expect("stored chunk")["message"], "function stored");
        match run.outcome {
            StreamOutcome::Complete(result) => assert_eq!(result["name"], "clamp01"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(fixture.store.list_functions(None, None).len(), 1);
    }

    #[test]
    fn regression_cancelled_generation_stores_nothing() {
        let fixture = with_generator(vec![Ok(generated(CLAMP))]);
        let run = fixture.stream("generate_function", json!({"description": "clamp"}), true);
        assert_eq!(
            run.outcome,
            StreamOutcome::Cancelled(json!({"at": 1, "total_lines": 3}))
        );
        assert!(fixture.store.list_functions(None, None).is_empty());
    }

    #[test]
    fn regression_streamed_generator_failure_matches_sync_error_shape() {
        let fixture = with_generator(vec![
            Err(anyhow!("model unavailable")),
            Err(anyhow!("model unavailable")),
        ]);
        let sync = fixture.call("generate_function", json!({"description": "clamp"}));
        let run = fixture.stream("generate_function", json!({"description": "clamp"}), false);
        let StreamOutcome::Failed(error) = run.outcome else {
            panic!("generator failure must end the stream with an error");
        };
        assert_eq!(error, sync["error"]);
        assert_eq!(error["type"], "GenerationFailed");
        assert!(error["suggested_action"].is_string());
        assert!(run.chunks.iter().all(|chunk| chunk["type"] != "code_line"));
        assert!(fixture.store.list_functions(None, None).is_empty());
    }
}
