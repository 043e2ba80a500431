//! The autocode tool table: store, dependency, lint, test and evaluation tools
//! backed by the function store and the single-flight worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use autocode_store::{CodeLinter, FunctionGenerator, FunctionStore, StoreError};
use autocode_worker::ScriptExecutor;
use serde_json::{json, Map, Value};

use crate::registry::{InvalidArgument, ToolArguments, ToolRegistry};

mod catalog;
mod eval;
mod generation;
mod property;
mod testing;

pub use property::{
    classify_property_failure, parse_property_results, PropertyCase, PropertyFailure,
    PropertyHarness, PropertyStatus,
};

const DEFAULT_EVAL_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_TEST_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_PROPERTY_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_STREAM_LINE_DELAY_MS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolSettings {
    pub eval_timeout: Duration,
    pub test_timeout: Duration,
    pub property_timeout: Duration,
    /// Pause between streamed `code_line` chunks.
    pub stream_line_delay: Duration,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            eval_timeout: Duration::from_millis(DEFAULT_EVAL_TIMEOUT_MS),
            test_timeout: Duration::from_millis(DEFAULT_TEST_TIMEOUT_MS),
            property_timeout: Duration::from_millis(DEFAULT_PROPERTY_TIMEOUT_MS),
            stream_line_delay: Duration::from_millis(DEFAULT_STREAM_LINE_DELAY_MS),
        }
    }
}

/// Collaborators shared by every autocode tool handler.
#[derive(Clone)]
pub struct AutocodeServices {
    pub executor: Arc<dyn ScriptExecutor>,
    pub store: Arc<dyn FunctionStore>,
    pub linter: Arc<dyn CodeLinter>,
    pub generator: Option<Arc<dyn FunctionGenerator>>,
    pub settings: ToolSettings,
}

impl std::fmt::Debug for AutocodeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutocodeServices")
            .field("generator", &self.generator.is_some())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

pub fn autocode_registry(services: AutocodeServices) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    let tools = catalog::tools(&services)
        .into_iter()
        .chain(testing::tools(&services))
        .chain(property::tools(&services))
        .chain(generation::tools(&services))
        .chain(eval::tools(&services));
    for tool in tools {
        registry.register(tool)?;
    }
    Ok(registry)
}

pub(crate) fn success(result: Value) -> Value {
    json!({ "ok": true, "result": result })
}

/// `success` plus top-level metadata fields.
pub(crate) fn success_with(result: Value, metadata: Value) -> Value {
    let mut envelope = Map::new();
    envelope.insert("ok".to_string(), Value::Bool(true));
    envelope.insert("result".to_string(), result);
    if let Value::Object(metadata) = metadata {
        envelope.extend(metadata);
    }
    Value::Object(envelope)
}

pub(crate) fn failure(
    error_type: &str,
    message: impl Into<String>,
    suggested_action: Option<&str>,
    details: Option<Value>,
) -> Value {
    let mut error = Map::new();
    error.insert("type".to_string(), Value::String(error_type.to_string()));
    error.insert("message".to_string(), Value::String(message.into()));
    if let Some(action) = suggested_action {
        error.insert(
            "suggested_action".to_string(),
            Value::String(action.to_string()),
        );
    }
    if let Some(details) = details {
        error.insert("details".to_string(), details);
    }
    json!({ "ok": false, "error": error })
}

pub(crate) fn store_failure(error: &StoreError) -> Value {
    failure(
        error.error_type(),
        error.to_string(),
        Some(error.suggested_action()),
        None,
    )
}

fn invalid_argument(message: String) -> anyhow::Error {
    InvalidArgument(message).into()
}

pub(crate) fn required_str<'a>(arguments: &'a ToolArguments, key: &str) -> Result<&'a str> {
    match arguments.get(key) {
        Some(Value::String(value)) => Ok(value),
        _ => Err(invalid_argument(format!("argument '{key}' must be a string"))),
    }
}

pub(crate) fn required_non_blank_str<'a>(
    arguments: &'a ToolArguments,
    key: &str,
) -> Result<&'a str> {
    let value = required_str(arguments, key)?;
    if value.trim().is_empty() {
        return Err(invalid_argument(format!("argument '{key}' must not be blank")));
    }
    Ok(value)
}

/// Absent, `null` and blank strings all read as `None`.
pub(crate) fn optional_str<'a>(arguments: &'a ToolArguments, key: &str) -> Result<Option<&'a str>> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) if value.trim().is_empty() => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.trim())),
        Some(_) => Err(invalid_argument(format!("argument '{key}' must be a string"))),
    }
}

pub(crate) fn optional_u64(arguments: &ToolArguments, key: &str) -> Result<Option<u64>> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            invalid_argument(format!("argument '{key}' must be a non-negative integer"))
        }),
    }
}

pub(crate) fn optional_i64(arguments: &ToolArguments, key: &str) -> Result<Option<i64>> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| invalid_argument(format!("argument '{key}' must be an integer"))),
    }
}

pub(crate) fn optional_bool(arguments: &ToolArguments, key: &str) -> Result<Option<bool>> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(_) => Err(invalid_argument(format!("argument '{key}' must be a boolean"))),
    }
}

pub(crate) fn optional_string_list(arguments: &ToolArguments, key: &str) -> Result<Vec<String>> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    invalid_argument(format!("argument '{key}' must be a list of strings"))
                })
            })
            .collect(),
        Some(_) => {
            Err(invalid_argument(format!("argument '{key}' must be a list of strings")))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use autocode_store::{
        CompatibilityLinter, FunctionGenerator, FunctionStore, GeneratedFunction,
        JsonFunctionStore,
    };
    use autocode_worker::{RunOutcome, ScriptExecutor};
    use serde_json::{Map, Value};

    use super::{AutocodeServices, ToolSettings};
    use crate::registry::{ToolArguments, ToolRegistry};
    use crate::session::{StreamContext, StreamOutcome};
    use crate::writer::{OutboundWriter, SharedBuffer};

    type Responder = Box<dyn Fn(&str) -> RunOutcome + Send + Sync>;

    /// Executor double that records every script and answers from a closure.
    pub(crate) struct ScriptedExecutor {
        respond: Responder,
        pub(crate) scripts: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        pub(crate) fn new(respond: impl Fn(&str) -> RunOutcome + Send + Sync + 'static) -> Self {
            Self {
                respond: Box::new(respond),
                scripts: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn scripts(&self) -> Vec<String> {
            self.scripts.lock().map(|scripts| scripts.clone()).unwrap_or_default()
        }
    }

    impl ScriptExecutor for ScriptedExecutor {
        fn execute(&self, script: &str, _timeout: Duration) -> RunOutcome {
            if let Ok(mut scripts) = self.scripts.lock() {
                scripts.push(script.to_string());
            }
            (self.respond)(script)
        }
    }

    pub(crate) struct QueuedGenerator {
        pub(crate) responses: Mutex<VecDeque<Result<GeneratedFunction>>>,
    }

    impl QueuedGenerator {
        pub(crate) fn new(responses: Vec<Result<GeneratedFunction>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    impl FunctionGenerator for QueuedGenerator {
        fn generate(&self, _description: &str, _module: Option<&str>) -> Result<GeneratedFunction> {
            self.responses
                .lock()
                .map_err(|_| anyhow!("generator queue poisoned"))?
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("no generated function queued")))
        }
    }

    pub(crate) struct Fixture {
        pub(crate) executor: Arc<ScriptedExecutor>,
        pub(crate) store: Arc<JsonFunctionStore>,
        pub(crate) registry: ToolRegistry,
    }

    pub(crate) fn fixture(
        executor: ScriptedExecutor,
        generator: Option<Arc<dyn FunctionGenerator>>,
    ) -> Fixture {
        let executor = Arc::new(executor);
        let store = Arc::new(JsonFunctionStore::in_memory());
        let services = AutocodeServices {
            executor: executor.clone(),
            store: store.clone() as Arc<dyn FunctionStore>,
            linter: Arc::new(CompatibilityLinter::default()),
            generator,
            settings: ToolSettings {
                stream_line_delay: Duration::ZERO,
                ..ToolSettings::default()
            },
        };
        let registry = super::autocode_registry(services).expect("registry");
        Fixture {
            executor,
            store,
            registry,
        }
    }

    pub(crate) fn arguments(value: Value) -> ToolArguments {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// What a stream handler produced: its outcome and the chunk payloads it emitted.
    pub(crate) struct StreamRun {
        pub(crate) outcome: StreamOutcome,
        pub(crate) chunks: Vec<Value>,
    }

    impl Fixture {
        pub(crate) fn call(&self, tool: &str, value: Value) -> Value {
            self.registry
                .get(tool)
                .unwrap_or_else(|| panic!("tool {tool} registered"))
                .call(&arguments(value))
                .expect("handler result")
        }

        /// Runs the stream handler inline. With `cancelled` the flag is raised
        /// before the handler starts.
        pub(crate) fn stream(&self, tool: &str, value: Value, cancelled: bool) -> StreamRun {
            let buffer = SharedBuffer::new();
            let (context, cancel) = StreamContext::detached(OutboundWriter::new(buffer.clone()));
            cancel.store(cancelled, Ordering::SeqCst);
            let handler = self
                .registry
                .get(tool)
                .and_then(|tool| tool.stream_handler().cloned())
                .unwrap_or_else(|| panic!("tool {tool} streams"));
            let outcome = handler(&context, &arguments(value)).expect("stream outcome");
            let chunks = buffer
                .frames()
                .expect("frames")
                .into_iter()
                .map(|frame| frame["params"]["data"].clone())
                .collect();
            StreamRun { outcome, chunks }
        }
    }
}
