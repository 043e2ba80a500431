use anyhow::Result;
use autocode_core::current_utc_rfc3339;
use autocode_store::{FunctionRecord, FunctionStore, TestResultRecord, TestStatus, UnitTestRecord};
use serde_json::{json, Value};

use super::{failure, optional_str, store_failure, success_with, AutocodeServices};
use crate::registry::{object_schema, Tool, ToolArguments};
use crate::session::{StreamContext, StreamOutcome};

pub(super) fn tools(services: &AutocodeServices) -> Vec<Tool> {
    let sync_services = services.clone();
    let stream_services = services.clone();
    vec![Tool::new(
        "run_tests",
        "Run unit tests for a function, a module, or every stored function.",
        object_schema(
            json!({
                "function_id": {"type": ["string", "null"]},
                "module": {"type": ["string", "null"]},
            }),
            &[],
        ),
        move |arguments| run_tests(&sync_services, arguments),
    )
    .with_stream_handler(move |context, arguments| {
        stream_tests(&stream_services, context, arguments)
    })]
}

/// Functions a `run_tests` call covers, or the envelope explaining why none do.
enum Targets {
    Functions(Vec<FunctionRecord>),
    Rejected(Value),
    Empty(String),
}

fn resolve_targets(store: &dyn FunctionStore, arguments: &ToolArguments) -> Result<Targets> {
    if let Some(function_id) = optional_str(arguments, "function_id")? {
        return Ok(match store.get_function(function_id) {
            Ok(record) => Targets::Functions(vec![record]),
            Err(error) => Targets::Rejected(store_failure(&error)),
        });
    }
    let module = optional_str(arguments, "module")?;
    let mut records = Vec::new();
    for summary in store.list_functions(module, None) {
        match store.get_function(&summary.id) {
            Ok(record) => records.push(record),
            Err(error) => return Ok(Targets::Rejected(store_failure(&error))),
        }
    }
    if records.is_empty() {
        let message = match module {
            Some(module) => format!("No functions found in module '{module}'"),
            None => "No functions stored".to_string(),
        };
        return Ok(Targets::Empty(message));
    }
    Ok(Targets::Functions(records))
}

fn scheduled_tests(records: &[FunctionRecord]) -> Vec<(&FunctionRecord, &UnitTestRecord)> {
    records
        .iter()
        .flat_map(|record| record.tests.iter().map(move |test| (record, test)))
        .collect()
}

/// Runs one test, stores its result and returns the result row.
fn execute_test(
    services: &AutocodeServices,
    record: &FunctionRecord,
    test: &UnitTestRecord,
) -> Value {
    let script = format!("{}\n\n{}", record.code, test.code);
    let outcome = services
        .executor
        .execute(&script, services.settings.test_timeout);
    let status = if outcome.success {
        TestStatus::Passed
    } else {
        TestStatus::Failed
    };
    let result = TestResultRecord {
        test_id: test.id.clone(),
        function_id: record.id.clone(),
        status,
        output: outcome.payload,
        recorded_at: current_utc_rfc3339(),
    };
    if let Err(error) = services.store.record_test_result(result.clone()) {
        tracing::warn!(test_id = %test.id, error = %error, "failed to persist test result");
    }
    json!({
        "function_id": record.id,
        "function_name": record.name,
        "test_id": test.id,
        "test_name": test.name,
        "status": result.status,
        "output": result.output,
    })
}

fn reset_results(store: &dyn FunctionStore, records: &[FunctionRecord]) {
    let ids = records.iter().map(|record| record.id.clone()).collect::<Vec<_>>();
    if let Err(error) = store.clear_test_results(&ids) {
        tracing::warn!(error = %error, "failed to clear previous test results");
    }
}

fn tally(results: &[Value]) -> (usize, usize) {
    let passed = results
        .iter()
        .filter(|result| result["status"] == "passed")
        .count();
    (passed, results.len() - passed)
}

fn run_tests(services: &AutocodeServices, arguments: &ToolArguments) -> Result<Value> {
    let records = match resolve_targets(services.store.as_ref(), arguments)? {
        Targets::Functions(records) => records,
        Targets::Rejected(envelope) => return Ok(envelope),
        Targets::Empty(message) => {
            return Ok(failure(
                "NoFunctionsFound",
                message,
                Some("Add functions first or check the module name."),
                None,
            ))
        }
    };
    reset_results(services.store.as_ref(), &records);
    let results = scheduled_tests(&records)
        .into_iter()
        .map(|(record, test)| execute_test(services, record, test))
        .collect::<Vec<_>>();
    let (passed, failed) = tally(&results);
    let total = results.len();
    Ok(success_with(
        json!(results),
        json!({ "total": total, "passed": passed, "failed": failed }),
    ))
}

fn stream_tests(
    services: &AutocodeServices,
    context: &StreamContext,
    arguments: &ToolArguments,
) -> Result<StreamOutcome> {
    let records = match resolve_targets(services.store.as_ref(), arguments)? {
        Targets::Functions(records) => records,
        Targets::Rejected(envelope) => return Ok(StreamOutcome::Failed(envelope["error"].clone())),
        Targets::Empty(message) => {
            return Ok(StreamOutcome::Complete(
                json!({ "results": [], "total": 0, "message": message }),
            ))
        }
    };
    let scheduled = scheduled_tests(&records);
    let total = scheduled.len();
    if total == 0 {
        return Ok(StreamOutcome::Complete(
            json!({ "results": [], "total": 0, "message": "no tests" }),
        ));
    }
    reset_results(services.store.as_ref(), &records);

    let mut results = Vec::with_capacity(total);
    for (index, (record, test)) in scheduled.into_iter().enumerate() {
        if context.is_cancelled() {
            return Ok(StreamOutcome::Cancelled(
                json!({ "completed": index, "total": total }),
            ));
        }
        let result = execute_test(services, record, test);
        context.chunk(json!({
            "index": index,
            "total": total,
            "result": result,
            "progress": (index + 1) as f64 / total as f64,
        }));
        results.push(result);
    }
    let (passed, failed) = tally(&results);
    Ok(StreamOutcome::Complete(json!({
        "results": results,
        "total": total,
        "passed": passed,
        "failed": failed,
    })))
}
