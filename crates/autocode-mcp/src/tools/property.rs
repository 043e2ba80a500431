//! Seeded property testing: a Julia harness that calls the stored function with
//! random arguments and reports one `PROPERTY_TEST_PASS`/`PROPERTY_TEST_FAIL`
//! line per trial.
//!
//! The harness is split into a prelude (seed, function code, trial function)
//! and per-trial calls. One-shot runs send both as one script; streaming runs
//! send the prelude once and then one trial at a time to the same worker, so
//! the random sequence is identical either way.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use anyhow::Result;
use autocode_store::{parse_signature, FunctionParameter, FunctionRecord};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use super::{
    failure, optional_i64, optional_u64, required_str, store_failure, success_with,
    AutocodeServices,
};
use crate::registry::{object_schema, Tool, ToolArguments};
use crate::session::{StreamContext, StreamOutcome};

const DEFAULT_NUM_TESTS: u64 = 50;
const DEFAULT_SEED: i64 = 42;
const FAILURE_TAIL_CHARS: usize = 2000;
const PASS_PREFIX: &str = "PROPERTY_TEST_PASS";
const FAIL_PREFIX: &str = "PROPERTY_TEST_FAIL";
const TRIAL_FUNCTION: &str = "_property_test_trial";

static MACRO_USE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(\w+)").expect("hardcoded macro regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyCase {
    pub status: PropertyStatus,
    pub info: String,
}

/// Heuristic reading of a failed harness run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyFailure {
    pub error_type: &'static str,
    pub message: String,
    pub suggested_action: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyHarness {
    prelude: String,
}

impl PropertyHarness {
    /// Builds the harness for `record`, calling the first declared function in
    /// its code (falling back to the record name).
    pub fn for_function(record: &FunctionRecord, seed: i64) -> Self {
        let signature = parse_signature(&record.code);
        let call_name = signature
            .as_ref()
            .map(|signature| signature.name.clone())
            .unwrap_or_else(|| record.name.clone());
        let parameters = signature
            .map(|signature| signature.parameters)
            .unwrap_or_default();
        Self::new(&record.code, &call_name, &parameters, seed)
    }

    pub fn new(code: &str, call_name: &str, parameters: &[FunctionParameter], seed: i64) -> Self {
        let arguments = TrialArguments::from_parameters(parameters);
        let prelude = format!(
            "using Random\nRandom.seed!({seed})\n\n{code}\n\n\
             function {TRIAL_FUNCTION}(i)\n    \
             {predeclare}\n    \
             try\n        \
             {assign}\n        \
             result = {call_name}({call})\n        \
             @assert !isnothing(result)\n        \
             println(\"{PASS_PREFIX} i=\", i{print})\n    \
             catch err\n        \
             println(\"{FAIL_PREFIX} i=\", i{print}, \" error=\", err)\n    \
             end\n\
             end\n",
            predeclare = arguments.predeclare.join("\n    "),
            assign = arguments.assign.join("\n        "),
            call = arguments.call.join(", "),
            print = arguments.print,
        );
        Self { prelude }
    }

    pub fn prelude(&self) -> &str {
        &self.prelude
    }

    /// Script running one trial; only valid after the prelude has been evaluated.
    pub fn trial(&self, index: u64) -> String {
        format!("{TRIAL_FUNCTION}({index})")
    }

    /// Prelude plus all trials, for a single round trip.
    pub fn script(&self, num_tests: u64) -> String {
        format!(
            "{}\nfor i in 1:{num_tests}\n    {TRIAL_FUNCTION}(i)\nend\n",
            self.prelude
        )
    }
}

struct TrialArguments {
    predeclare: Vec<String>,
    assign: Vec<String>,
    call: Vec<String>,
    print: String,
}

impl TrialArguments {
    fn from_parameters(parameters: &[FunctionParameter]) -> Self {
        if parameters.is_empty() {
            return Self {
                predeclare: vec!["arg = nothing".to_string()],
                assign: vec![format!("arg = {}", generator_for(None))],
                call: vec!["arg".to_string()],
                print: ", \", arg=\", arg".to_string(),
            };
        }
        let mut arguments = Self {
            predeclare: Vec::new(),
            assign: Vec::new(),
            call: Vec::new(),
            print: String::new(),
        };
        for (index, parameter) in parameters.iter().enumerate() {
            let variable = format!("arg{}", index + 1);
            arguments.predeclare.push(format!("{variable} = nothing"));
            arguments.assign.push(format!(
                "{variable} = {}",
                generator_for(parameter.type_annotation.as_deref())
            ));
            arguments
                .print
                .push_str(&format!(", \", {}=\", {variable}", parameter.name));
            arguments.call.push(variable);
        }
        arguments
    }
}

/// Random value expression for a declared parameter type; untyped and unknown
/// types get integers.
fn generator_for(type_annotation: Option<&str>) -> &'static str {
    let Some(annotation) = type_annotation.map(str::to_lowercase) else {
        return "rand(-1000:1000)";
    };
    if annotation.starts_with("int") {
        "rand(-1000:1000)"
    } else if annotation.contains("matrix") {
        "rand(-10.0:0.1:10.0, 3, 3)"
    } else if annotation.contains("vector") {
        "rand(-10.0:0.1:10.0, 5)"
    } else if annotation.contains("float") {
        "rand() * 2000 - 1000"
    } else {
        "rand(-1000:1000)"
    }
}

pub fn parse_property_results(output: &str) -> Vec<PropertyCase> {
    output
        .lines()
        .filter_map(|line| {
            let status = if line.starts_with(PASS_PREFIX) {
                PropertyStatus::Pass
            } else if line.starts_with(FAIL_PREFIX) {
                PropertyStatus::Fail
            } else {
                return None;
            };
            Some(PropertyCase {
                status,
                info: line.to_string(),
            })
        })
        .collect()
}

pub fn classify_property_failure(output: &str) -> PropertyFailure {
    let tail = char_tail(output, FAILURE_TAIL_CHARS);
    let (error_type, suggested_action) = if tail.contains("AssertionError") {
        (
            "assertion_failure",
            "Check the property test assertions and expected outputs.",
        )
    } else if tail.contains("syntax error") || tail.contains("ParseError") {
        ("syntax_error", "Check the function code for syntax errors.")
    } else if tail.contains("UndefVarError") || tail.contains("not defined") {
        (
            "undefined_variable",
            "Check for typos or missing definitions in the function or test.",
        )
    } else if tail.contains("LoadError") {
        ("load_error", "Check included files and their paths.")
    } else {
        (
            "julia_error",
            "Check the function code and property test logic for errors.",
        )
    };
    let message = if tail.trim().is_empty() {
        "Property-based test failed with unknown error.".to_string()
    } else {
        tail.to_string()
    };
    PropertyFailure {
        error_type,
        message,
        suggested_action,
    }
}

fn char_tail(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    text.char_indices()
        .rev()
        .nth(max_chars - 1)
        .map_or(text, |(start, _)| &text[start..])
}

fn failure_envelope(output: &str) -> Value {
    let classified = classify_property_failure(output);
    failure(
        classified.error_type,
        classified.message,
        Some(classified.suggested_action),
        None,
    )
}

fn failure_data(output: &str) -> Value {
    let classified = classify_property_failure(output);
    json!({
        "type": classified.error_type,
        "message": classified.message,
        "suggested_action": classified.suggested_action,
    })
}

fn count(cases: &[PropertyCase], status: PropertyStatus) -> usize {
    cases.iter().filter(|case| case.status == status).count()
}

struct PropertyRequest {
    record: FunctionRecord,
    num_tests: u64,
    harness: PropertyHarness,
}

fn prepare(
    services: &AutocodeServices,
    arguments: &ToolArguments,
) -> Result<std::result::Result<PropertyRequest, Value>> {
    let function_id = required_str(arguments, "function_id")?;
    let num_tests = optional_u64(arguments, "num_tests")?.unwrap_or(DEFAULT_NUM_TESTS);
    let seed = optional_i64(arguments, "seed")?.unwrap_or(DEFAULT_SEED);
    let record = match services.store.get_function(function_id) {
        Ok(record) => record,
        Err(error) => return Ok(Err(store_failure(&error))),
    };
    let macros = MACRO_USE
        .captures_iter(&record.code)
        .map(|captures| format!("@{}", &captures[1]))
        .collect::<BTreeSet<_>>();
    if !macros.is_empty() {
        tracing::warn!(
            function_id = %record.id,
            macros = %macros.into_iter().collect::<Vec<_>>().join(", "),
            "function uses macros; property tests fail if their packages are not loaded"
        );
    }
    let harness = PropertyHarness::for_function(&record, seed);
    Ok(Ok(PropertyRequest {
        record,
        num_tests,
        harness,
    }))
}

pub(super) fn tools(services: &AutocodeServices) -> Vec<Tool> {
    let sync_services = services.clone();
    let stream_services = services.clone();
    vec![Tool::new(
        "property_test",
        "Run seeded property-based tests calling the function with random arguments.",
        object_schema(
            json!({
                "function_id": {"type": "string"},
                "num_tests": {"type": "integer", "default": DEFAULT_NUM_TESTS},
                "seed": {"type": "integer", "default": DEFAULT_SEED},
            }),
            &["function_id"],
        ),
        move |arguments| property_test(&sync_services, arguments),
    )
    .with_stream_handler(move |context, arguments| {
        stream_property_test(&stream_services, context, arguments)
    })]
}

fn property_test(services: &AutocodeServices, arguments: &ToolArguments) -> Result<Value> {
    let request = match prepare(services, arguments)? {
        Ok(request) => request,
        Err(envelope) => return Ok(envelope),
    };
    let outcome = services.executor.execute(
        &request.harness.script(request.num_tests),
        services.settings.property_timeout,
    );
    if !outcome.success {
        return Ok(failure_envelope(&outcome.payload));
    }
    let cases = parse_property_results(&outcome.payload);
    let passes = count(&cases, PropertyStatus::Pass);
    let fails = count(&cases, PropertyStatus::Fail);
    Ok(success_with(
        json!({ "results": cases }),
        json!({
            "function_id": request.record.id,
            "total": cases.len(),
            "passes": passes,
            "fails": fails,
        }),
    ))
}

fn stream_property_test(
    services: &AutocodeServices,
    context: &StreamContext,
    arguments: &ToolArguments,
) -> Result<StreamOutcome> {
    let request = match prepare(services, arguments)? {
        Ok(request) => request,
        Err(envelope) => return Ok(StreamOutcome::Failed(envelope["error"].clone())),
    };
    let timeout = services.settings.property_timeout;
    let prelude = services.executor.execute(request.harness.prelude(), timeout);
    if !prelude.success {
        return Ok(StreamOutcome::Failed(failure_data(&prelude.payload)));
    }

    let total = request.num_tests;
    let mut cases = Vec::new();
    for index in 1..=total {
        if context.is_cancelled() {
            return Ok(StreamOutcome::Cancelled(json!({
                "completed": index - 1,
                "total": total,
                "passes": count(&cases, PropertyStatus::Pass),
                "fails": count(&cases, PropertyStatus::Fail),
            })));
        }
        let outcome = services
            .executor
            .execute(&request.harness.trial(index), timeout);
        if !outcome.success {
            return Ok(StreamOutcome::Failed(failure_data(&outcome.payload)));
        }
        for case in parse_property_results(&outcome.payload) {
            context.chunk(json!({
                "index": index,
                "total": total,
                "status": case.status,
                "info": case.info,
                "progress": index as f64 / total as f64,
            }));
            cases.push(case);
        }
    }
    Ok(StreamOutcome::Complete(json!({
        "function_id": request.record.id,
        "total": cases.len(),
        "passes": count(&cases, PropertyStatus::Pass),
        "fails": count(&cases, PropertyStatus::Fail),
    })))
}
