use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::session::{StreamContext, StreamOutcome};

/// Raised by handlers for arguments of the wrong shape; the dispatcher answers
/// with an invalid-params error instead of a handler fault.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct InvalidArgument(pub String);

pub type ToolArguments = Map<String, Value>;
pub type ToolHandler = Arc<dyn Fn(&ToolArguments) -> Result<Value> + Send + Sync>;
pub type StreamToolHandler =
    Arc<dyn Fn(&StreamContext, &ToolArguments) -> Result<StreamOutcome> + Send + Sync>;

/// A named operation with its declared input shape.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    input_schema: Value,
    handler: ToolHandler,
    stream_handler: Option<StreamToolHandler>,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("streaming", &self.stream_handler.is_some())
            .finish()
    }
}

impl Tool {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(&ToolArguments) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(handler),
            stream_handler: None,
        }
    }

    pub fn with_stream_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&StreamContext, &ToolArguments) -> Result<StreamOutcome> + Send + Sync + 'static,
    {
        self.stream_handler = Some(Arc::new(handler));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Runs the synchronous handler.
    pub fn call(&self, arguments: &ToolArguments) -> Result<Value> {
        (self.handler)(arguments)
    }

    pub fn stream_handler(&self) -> Option<&StreamToolHandler> {
        self.stream_handler.as_ref()
    }

    pub fn streaming_capable(&self) -> bool {
        self.stream_handler.is_some()
    }

    pub fn required_arguments(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|required| required.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// First required argument that is absent or `null`.
    pub fn missing_required<'a>(&'a self, arguments: &ToolArguments) -> Option<&'a str> {
        self.required_arguments()
            .into_iter()
            .find(|name| arguments.get(*name).map_or(true, Value::is_null))
    }

    pub fn descriptor(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

/// Read-only after startup; tools are listed in name order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Tool) -> Result<()> {
        if self.tools.contains_key(tool.name()) {
            bail!("tool '{}' is already registered", tool.name());
        }
        self.tools.insert(tool.name().to_string(), tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn descriptors(&self) -> Vec<Value> {
        self.tools.values().map(Tool::descriptor).collect()
    }
}

/// `{"type":"object","properties":…,"required":[…]}`
pub fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}
