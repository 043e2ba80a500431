use std::io::BufRead;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

use crate::audit::{AuditEvent, AuditLog};
use crate::jsonrpc::{
    error_frame, is_error_frame, parse_line, parse_request, result_frame, DispatchError,
    InboundLine, JsonRpcRequest, ERROR_HANDLER_FAULT, ERROR_INVALID_PARAMS,
    ERROR_INVALID_REQUEST, ERROR_METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use crate::panic_message;
use crate::registry::{InvalidArgument, Tool, ToolArguments, ToolRegistry};
use crate::session::{spawn_stream, StreamSessions};
use crate::writer::OutboundWriter;

const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;
const TOOL_CONTENT_TYPE_JSON: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub server_name: String,
    pub server_version: String,
    /// How long `serve` waits for running streams after the input ends.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "autocode-mcp".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            drain_timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServeReport {
    pub processed_lines: usize,
    pub error_count: usize,
    /// Streams still running when the drain wait gave up.
    pub abandoned_streams: usize,
}

pub struct McpServer {
    config: ServerConfig,
    registry: ToolRegistry,
    sessions: StreamSessions,
    writer: OutboundWriter,
    audit: Arc<AuditLog>,
    shutdown_requested: AtomicBool,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("config", &self.config)
            .field("tools", &self.registry.len())
            .field("active_streams", &self.sessions.active_count())
            .finish()
    }
}

impl McpServer {
    pub fn new(
        config: ServerConfig,
        registry: ToolRegistry,
        writer: OutboundWriter,
        audit: AuditLog,
    ) -> Self {
        Self {
            config,
            registry,
            sessions: StreamSessions::new(),
            writer,
            audit: Arc::new(audit),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn sessions(&self) -> &StreamSessions {
        &self.sessions
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Serves requests until end of input or a `shutdown` request, then waits
    /// up to the drain timeout for running streams to finish.
    pub fn serve<R>(&self, mut reader: R) -> Result<ServeReport>
    where
        R: BufRead,
    {
        self.audit.record(
            AuditEvent::ServerStart,
            json!({
                "pid": std::process::id(),
                "log_path": self.audit.path().map(|path| path.display().to_string()),
                "tools": self.registry.len(),
            }),
        );
        tracing::info!(tools = self.registry.len(), "autocode mcp server started");

        let mut line = String::new();
        let mut report = ServeReport::default();
        loop {
            line.clear();
            let bytes_read = reader
                .read_line(&mut line)
                .context("failed to read request line")?;
            if bytes_read == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            report.processed_lines = report.processed_lines.saturating_add(1);

            if let Some(frame) = self.handle_line(trimmed) {
                report.error_count = report.error_count.saturating_add(count_error_frames(&frame));
                self.writer.write_frame(&frame)?;
            }
            if self.shutdown_requested() {
                break;
            }
        }

        if !self.sessions.wait_until_idle(self.config.drain_timeout) {
            report.abandoned_streams = self.sessions.active_count();
            tracing::warn!(
                abandoned = report.abandoned_streams,
                "streams still running at shutdown"
            );
        }
        self.audit.record(
            AuditEvent::ServerShutdown,
            json!({
                "processed_lines": report.processed_lines,
                "error_count": report.error_count,
                "abandoned_streams": report.abandoned_streams,
                "shutdown_requested": self.shutdown_requested(),
            }),
        );
        Ok(report)
    }

    /// The frame to write for one input line, if any. Batches answer with one
    /// array; notifications are never answered.
    pub fn handle_line(&self, line: &str) -> Option<Value> {
        match parse_line(line) {
            Err(error) => {
                self.audit
                    .record(AuditEvent::ParseError, json!({ "line": line }));
                Some(error.into_frame())
            }
            Ok(InboundLine::Single(value)) => self.handle_value(&value),
            Ok(InboundLine::Batch(items)) => {
                self.audit
                    .record(AuditEvent::Batch, json!({ "size": items.len() }));
                if items.is_empty() {
                    return Some(error_frame(
                        Value::Null,
                        ERROR_INVALID_REQUEST,
                        "batch must contain at least one request",
                    ));
                }
                let responses = items
                    .iter()
                    .filter_map(|item| self.handle_value(item))
                    .collect::<Vec<_>>();
                (!responses.is_empty()).then_some(Value::Array(responses))
            }
        }
    }

    fn handle_value(&self, value: &Value) -> Option<Value> {
        let request = match parse_request(value) {
            Ok(request) => request,
            Err(error) => {
                self.audit.record(
                    AuditEvent::Error,
                    json!({ "code": error.code, "message": error.message, "raw": value }),
                );
                return Some(error.into_frame());
            }
        };
        self.audit.record(
            AuditEvent::Request,
            json!({ "id": request.id, "method": request.method, "raw": value }),
        );

        let frame = match self.dispatch(&request) {
            Ok(result) => result_frame(request.response_id(), result),
            Err(error) => error.into_frame(),
        };
        request.id.is_some().then_some(frame)
    }

    fn dispatch(&self, request: &JsonRpcRequest) -> Result<Value, DispatchError> {
        match request.method.as_str() {
            "initialize" => Ok(self.handle_initialize()),
            "shutdown" => {
                self.shutdown_requested.store(true, Ordering::SeqCst);
                Ok(json!({}))
            }
            "ping" => Ok(json!({ "pong": true })),
            "tools/list" => Ok(json!({ "tools": self.registry.descriptors() })),
            "tools/call" => self.handle_tools_call(request),
            "tools/cancel" => self.handle_tools_cancel(request),
            other => Err(DispatchError::new(
                request.response_id(),
                ERROR_METHOD_NOT_FOUND,
                format!("Unknown method '{other}'"),
            )),
        }
    }

    fn handle_initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": self.config.server_name,
                "version": self.config.server_version,
            },
            "capabilities": {
                "tools": { "listChanged": false },
                "experimental": { "streaming": true, "cancellation": true },
            }
        })
    }

    fn handle_tools_call(&self, request: &JsonRpcRequest) -> Result<Value, DispatchError> {
        let id = request.response_id();
        let invalid =
            |message: String| DispatchError::new(id.clone(), ERROR_INVALID_PARAMS, message);

        let name = request
            .params
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| invalid("tools/call requires non-empty field 'name'".to_string()))?;
        let arguments = match request.params.get("arguments") {
            Some(Value::Object(arguments)) => arguments.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(invalid(
                    "tools/call field 'arguments' must be an object when provided".to_string(),
                ))
            }
        };
        let stream = request
            .params
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let tool = self.registry.get(name).ok_or_else(|| {
            DispatchError::new(
                id.clone(),
                ERROR_METHOD_NOT_FOUND,
                format!("Unknown tool '{name}'"),
            )
        })?;
        if let Some(missing) = tool.missing_required(&arguments) {
            return Err(invalid(format!("Missing required argument '{missing}'")));
        }

        if stream {
            self.start_stream(request, tool, arguments)
        } else {
            self.invoke_tool(id, tool, &arguments)
        }
    }

    fn start_stream(
        &self,
        request: &JsonRpcRequest,
        tool: &Tool,
        arguments: ToolArguments,
    ) -> Result<Value, DispatchError> {
        let id = request.response_id();
        let Some(handler) = tool.stream_handler() else {
            return Err(DispatchError::new(
                id,
                ERROR_INVALID_PARAMS,
                format!("Tool '{}' does not support streaming", tool.name()),
            ));
        };
        let Some(call_id) = request.id.clone() else {
            return Err(DispatchError::new(
                id,
                ERROR_INVALID_REQUEST,
                "streaming calls require a request id",
            ));
        };
        let Some(guard) = self.sessions.begin(&call_id, tool.name()) else {
            return Err(DispatchError::new(
                id,
                ERROR_INVALID_PARAMS,
                format!("call id {call_id} is already streaming"),
            ));
        };

        self.audit.record(
            AuditEvent::StreamStart,
            json!({ "callId": call_id, "tool": tool.name(), "arguments": arguments }),
        );
        spawn_stream(
            guard,
            call_id.clone(),
            tool.name().to_string(),
            Arc::clone(handler),
            arguments,
            self.writer.clone(),
            Arc::clone(&self.audit),
        )
        .map_err(|error| {
            DispatchError::new(id, ERROR_HANDLER_FAULT, format!("{error:#}"))
        })?;
        Ok(json!({ "streaming": true, "callId": call_id }))
    }

    fn invoke_tool(
        &self,
        id: Value,
        tool: &Tool,
        arguments: &ToolArguments,
    ) -> Result<Value, DispatchError> {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| tool.call(arguments)));
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(result)) => {
                let summary_keys = result
                    .as_object()
                    .map(|object| object.keys().cloned().collect::<Vec<_>>());
                self.audit.record(
                    AuditEvent::ToolCall,
                    json!({
                        "id": id,
                        "tool": tool.name(),
                        "arguments": arguments,
                        "result_summary_keys": summary_keys,
                        "elapsed_ms": elapsed_ms,
                    }),
                );
                Ok(json!({
                    "content": [{ "type": TOOL_CONTENT_TYPE_JSON, "json": result }]
                }))
            }
            Ok(Err(error)) => {
                if let Some(invalid) = error.downcast_ref::<InvalidArgument>() {
                    return Err(DispatchError::new(
                        id,
                        ERROR_INVALID_PARAMS,
                        invalid.to_string(),
                    ));
                }
                let message = format!("{error:#}");
                self.record_tool_fault(&id, tool.name(), &message);
                Err(DispatchError::new(id, ERROR_HANDLER_FAULT, format!("Exception: {message}"))
                    .with_data(json!({ "tool": tool.name() })))
            }
            Err(payload) => {
                let message = format!("tool handler panicked: {}", panic_message(payload.as_ref()));
                self.record_tool_fault(&id, tool.name(), &message);
                Err(DispatchError::new(id, ERROR_HANDLER_FAULT, message)
                    .with_data(json!({ "tool": tool.name() })))
            }
        }
    }

    fn record_tool_fault(&self, id: &Value, tool: &str, message: &str) {
        tracing::warn!(%id, tool, message, "tool handler failed");
        self.audit.record(
            AuditEvent::Error,
            json!({ "id": id, "method": "tools/call", "tool": tool, "error": message }),
        );
    }

    fn handle_tools_cancel(&self, request: &JsonRpcRequest) -> Result<Value, DispatchError> {
        let call_id = request
            .params
            .get("callId")
            .filter(|value| !value.is_null())
            .cloned()
            .ok_or_else(|| {
                DispatchError::new(
                    request.response_id(),
                    ERROR_INVALID_PARAMS,
                    "tools/cancel requires field 'callId'",
                )
            })?;
        if self.sessions.cancel(&call_id) {
            self.audit
                .record(AuditEvent::StreamCancel, json!({ "callId": call_id }));
            return Ok(json!({ "cancelled": true, "callId": call_id }));
        }
        Ok(json!({ "cancelled": false, "reason": "not_found", "callId": call_id }))
    }
}

fn count_error_frames(frame: &Value) -> usize {
    match frame {
        Value::Array(frames) => frames.iter().filter(|frame| is_error_frame(frame)).count(),
        other => usize::from(is_error_frame(other)),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use anyhow::bail;
    use serde::Deserialize;
    use serde_json::{json, Value};

    use super::{McpServer, ServeReport, ServerConfig};
    use crate::audit::AuditLog;
    use crate::jsonrpc::{
        ERROR_HANDLER_FAULT, ERROR_INVALID_PARAMS, ERROR_METHOD_NOT_FOUND, ERROR_PARSE,
    };
    use crate::registry::{object_schema, InvalidArgument, Tool, ToolRegistry};
    use crate::session::StreamOutcome;
    use crate::writer::{OutboundWriter, SharedBuffer};
    use autocode_core::LogRotationPolicy;

    struct Harness {
        server: McpServer,
        output: SharedBuffer,
        side_effects: Arc<AtomicUsize>,
    }

    fn harness_with_audit(audit: AuditLog) -> Harness {
        let side_effects = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        let counter = Arc::clone(&side_effects);
        registry
            .register(Tool::new(
                "record",
                "increments a counter",
                object_schema(json!({"label": {"type": "string"}}), &["label"]),
                move |arguments| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"ok": true, "result": arguments["label"]}))
                },
            ))
            .expect("record");
        registry
            .register(Tool::new(
                "fault",
                "always fails",
                object_schema(json!({}), &[]),
                |_arguments| bail!("store exploded"),
            ))
            .expect("fault");
        registry
            .register(Tool::new(
                "panics",
                "always panics",
                object_schema(json!({}), &[]),
                |_arguments| panic!("handler bug"),
            ))
            .expect("panics");
        registry
            .register(Tool::new(
                "typed",
                "rejects wrong shapes",
                object_schema(json!({}), &[]),
                |_arguments| {
                    Err(InvalidArgument("argument 'n' must be an integer".to_string()).into())
                },
            ))
            .expect("typed");
        registry
            .register(
                Tool::new(
                    "count",
                    "counts slowly",
                    object_schema(json!({"steps": {"type": "integer"}}), &["steps"]),
                    |arguments| Ok(json!({"ok": true, "result": arguments["steps"]})),
                )
                .with_stream_handler(|context, arguments| {
                    let steps = arguments["steps"].as_u64().unwrap_or(0);
                    for step in 0..steps {
                        if context.is_cancelled() {
                            return Ok(StreamOutcome::Cancelled(json!({"completed": step})));
                        }
                        context.chunk(json!({"owner": context.call_id(), "step": step}));
                        thread::sleep(Duration::from_millis(2));
                    }
                    Ok(StreamOutcome::Complete(json!({"steps": steps})))
                }),
            )
            .expect("count");

        let output = SharedBuffer::new();
        let server = McpServer::new(
            ServerConfig::default(),
            registry,
            OutboundWriter::new(output.clone()),
            audit,
        );
        Harness {
            server,
            output,
            side_effects,
        }
    }

    fn harness() -> Harness {
        harness_with_audit(AuditLog::disabled())
    }

    fn serve_lines(harness: &Harness, lines: &[Value]) -> ServeReport {
        let raw = lines
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        harness
            .server
            .serve(Cursor::new(raw.into_bytes()))
            .expect("serve")
    }

    fn responses(frames: &[Value]) -> Vec<Value> {
        frames
            .iter()
            .filter(|frame| frame.get("method").is_none())
            .cloned()
            .collect()
    }

    fn stream_events(frames: &[Value], call_id: &Value) -> Vec<String> {
        frames
            .iter()
            .filter(|frame| {
                frame["method"] == "tools/stream" && &frame["params"]["callId"] == call_id
            })
            .map(|frame| frame["params"]["event"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[derive(Debug, Deserialize)]
    struct ProtocolFixture {
        schema_version: u32,
        name: String,
        requests: Vec<Value>,
        expected_response_ids: Vec<Value>,
        expected_methods: Vec<String>,
    }

    fn load_protocol_fixture(name: &str) -> ProtocolFixture {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("testdata")
            .join("mcp-protocol")
            .join(name);
        let raw = std::fs::read_to_string(&path)
            .unwrap_or_else(|error| panic!("failed to read {}: {error}", path.display()));
        serde_json::from_str::<ProtocolFixture>(&raw)
            .unwrap_or_else(|error| panic!("invalid fixture {}: {error}", path.display()))
    }

    #[test]
    fn functional_initialize_ping_and_tools_list() {
        let harness = harness();
        let report = serve_lines(
            &harness,
            &[
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
                json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
                json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}),
            ],
        );
        assert_eq!(report.processed_lines, 3);
        assert_eq!(report.error_count, 0);

        let frames = harness.output.frames().expect("frames");
        assert_eq!(frames[0]["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(frames[0]["result"]["serverInfo"]["name"], "autocode-mcp");
        assert_eq!(
            frames[0]["result"]["capabilities"]["experimental"]["streaming"],
            true
        );
        assert_eq!(frames[1]["result"], json!({"pong": true}));
        let names = frames[2]["result"]["tools"]
            .as_array()
            .expect("tools")
            .iter()
            .map(|tool| tool["name"].as_str().expect("name").to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["count", "fault", "panics", "record", "typed"]);
    }

    #[test]
    fn functional_missing_required_argument_has_no_side_effects() {
        let harness = harness();
        serve_lines(
            &harness,
            &[
                json!({"id": 1, "method": "tools/call", "params": {"name": "record", "arguments": {}}}),
                json!({"id": 2, "method": "tools/call", "params": {"name": "record", "arguments": {"label": null}}}),
            ],
        );
        let frames = harness.output.frames().expect("frames");
        for frame in &frames {
            assert_eq!(frame["error"]["code"], ERROR_INVALID_PARAMS);
            assert!(frame["error"]["message"]
                .as_str()
                .expect("message")
                .contains("label"));
        }
        assert_eq!(harness.side_effects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn functional_unknown_method_and_tool_are_method_not_found() {
        let harness = harness();
        let report = serve_lines(
            &harness,
            &[
                json!({"id": 1, "method": "resources/list"}),
                json!({"id": 2, "method": "tools/call", "params": {"name": "nope", "arguments": {"label": "x"}}}),
            ],
        );
        assert_eq!(report.error_count, 2);
        let frames = harness.output.frames().expect("frames");
        assert_eq!(frames[0]["error"]["code"], ERROR_METHOD_NOT_FOUND);
        assert_eq!(frames[1]["error"]["code"], ERROR_METHOD_NOT_FOUND);
        assert_eq!(harness.side_effects.load(Ordering::SeqCst), 0);
        assert_eq!(harness.server.sessions().active_count(), 0);
    }

    #[test]
    fn functional_sync_call_wraps_result_in_json_content() {
        let harness = harness();
        serve_lines(
            &harness,
            &[json!({"id": "r", "method": "tools/call", "params": {"name": "record", "arguments": {"label": "x"}}})],
        );
        let frames = harness.output.frames().expect("frames");
        assert_eq!(frames[0]["id"], "r");
        assert_eq!(frames[0]["result"]["content"][0]["type"], "json");
        assert_eq!(frames[0]["result"]["content"][0]["json"]["result"], "x");
        assert_eq!(harness.side_effects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn regression_handler_errors_and_panics_do_not_stop_the_loop() {
        let harness = harness();
        let report = serve_lines(
            &harness,
            &[
                json!({"id": 1, "method": "tools/call", "params": {"name": "fault"}}),
                json!({"id": 2, "method": "tools/call", "params": {"name": "panics"}}),
                json!({"id": 3, "method": "tools/call", "params": {"name": "typed"}}),
                json!({"id": 4, "method": "ping"}),
            ],
        );
        assert_eq!(report.processed_lines, 4);
        assert_eq!(report.error_count, 3);
        let frames = harness.output.frames().expect("frames");
        assert_eq!(frames[0]["error"]["code"], ERROR_HANDLER_FAULT);
        assert!(frames[0]["error"]["message"]
            .as_str()
            .expect("message")
            .contains("store exploded"));
        assert_eq!(frames[1]["error"]["code"], ERROR_HANDLER_FAULT);
        assert!(frames[1]["error"]["message"]
            .as_str()
            .expect("message")
            .contains("handler bug"));
        assert_eq!(frames[2]["error"]["code"], ERROR_INVALID_PARAMS);
        assert_eq!(frames[3]["result"]["pong"], true);
    }

    #[test]
    fn functional_parse_errors_blank_lines_and_notifications() {
        let harness = harness();
        let raw = "\n{not json\n   \n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n{\"id\":5,\"method\":\"ping\"}\n";
        let report = harness
            .server
            .serve(Cursor::new(raw.as_bytes().to_vec()))
            .expect("serve");
        assert_eq!(report.processed_lines, 3);
        let frames = harness.output.frames().expect("frames");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["id"], Value::Null);
        assert_eq!(frames[0]["error"]["code"], ERROR_PARSE);
        assert_eq!(frames[1]["id"], 5);
    }

    #[test]
    fn functional_batch_answers_with_one_array_in_order() {
        let harness = harness();
        let batch = json!([
            {"id": 1, "method": "ping"},
            {"id": 2, "method": "missing"},
            {"method": "ping"},
            {"id": 3, "method": "tools/call", "params": {"name": "record", "arguments": {"label": "b"}}}
        ]);
        let report = serve_lines(&harness, &[batch]);
        assert_eq!(report.processed_lines, 1);
        assert_eq!(report.error_count, 1);

        let raw = harness.output.contents();
        assert_eq!(raw.lines().count(), 1);
        let frames = harness.output.frames().expect("frames");
        let array = frames[0].as_array().expect("array");
        let ids = array.iter().map(|frame| frame["id"].clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn functional_shutdown_stops_reading_after_its_response() {
        let harness = harness();
        let report = serve_lines(
            &harness,
            &[
                json!({"id": 1, "method": "ping"}),
                json!({"id": 2, "method": "shutdown"}),
                json!({"id": 3, "method": "ping"}),
            ],
        );
        assert_eq!(report.processed_lines, 2);
        assert!(harness.server.shutdown_requested());
        let frames = harness.output.frames().expect("frames");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["result"], json!({}));
    }

    #[test]
    fn functional_stream_requires_streaming_tool() {
        let harness = harness();
        serve_lines(
            &harness,
            &[json!({"id": 1, "method": "tools/call", "params": {"name": "record", "arguments": {"label": "x"}, "stream": true}})],
        );
        let frames = harness.output.frames().expect("frames");
        assert_eq!(frames[0]["error"]["code"], ERROR_INVALID_PARAMS);
        assert_eq!(harness.side_effects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn integration_cancel_yields_single_cancelled_event_and_releases_session() {
        let harness = harness();
        let report = serve_lines(
            &harness,
            &[
                json!({"id": 11, "method": "tools/call", "params": {"name": "count", "arguments": {"steps": 5000}, "stream": true}}),
                json!({"id": 12, "method": "tools/cancel", "params": {"callId": 11}}),
                json!({"id": 13, "method": "tools/cancel", "params": {"callId": 999}}),
            ],
        );
        assert_eq!(report.abandoned_streams, 0);
        let frames = harness.output.frames().expect("frames");
        let responses = responses(&frames);
        assert_eq!(responses[0]["result"], json!({"streaming": true, "callId": 11}));
        assert_eq!(responses[1]["result"]["cancelled"], true);
        assert_eq!(
            responses[2]["result"],
            json!({"cancelled": false, "reason": "not_found", "callId": 999})
        );

        let events = stream_events(&frames, &json!(11));
        assert_eq!(events.iter().filter(|event| *event == "cancelled").count(), 1);
        assert!(!events.iter().any(|event| event == "complete"));
        assert_eq!(events.last().map(String::as_str), Some("cancelled"));
        assert!(!harness.server.sessions().is_active(&json!(11)));
    }

    #[test]
    fn integration_concurrent_streams_keep_lines_whole_and_attributable() {
        let harness = harness();
        serve_lines(
            &harness,
            &[
                json!({"id": "a", "method": "tools/call", "params": {"name": "count", "arguments": {"steps": 40}, "stream": true}}),
                json!({"id": "b", "method": "tools/call", "params": {"name": "count", "arguments": {"steps": 40}, "stream": true}}),
                json!({"id": "p", "method": "ping"}),
            ],
        );
        let frames = harness.output.frames().expect("every line is valid json");
        for frame in frames.iter().filter(|frame| frame["method"] == "tools/stream") {
            let call_id = &frame["params"]["callId"];
            assert!(call_id == "a" || call_id == "b");
            if frame["params"]["event"] == "chunk" {
                assert_eq!(&frame["params"]["data"]["owner"], call_id);
            }
        }
        for call_id in [json!("a"), json!("b")] {
            let events = stream_events(&frames, &call_id);
            assert_eq!(events.len(), 41);
            assert_eq!(events.last().map(String::as_str), Some("complete"));
        }
        assert_eq!(harness.server.sessions().active_count(), 0);
    }

    #[test]
    fn regression_duplicate_active_call_id_is_rejected() {
        let harness = harness();
        serve_lines(
            &harness,
            &[
                json!({"id": 1, "method": "tools/call", "params": {"name": "count", "arguments": {"steps": 5000}, "stream": true}}),
                json!({"id": 1, "method": "tools/call", "params": {"name": "count", "arguments": {"steps": 1}, "stream": true}}),
                json!({"id": 2, "method": "tools/cancel", "params": {"callId": 1}}),
            ],
        );
        let frames = harness.output.frames().expect("frames");
        let responses = responses(&frames);
        assert_eq!(responses[0]["result"]["streaming"], true);
        assert_eq!(responses[1]["error"]["code"], ERROR_INVALID_PARAMS);
        assert_eq!(stream_events(&frames, &json!(1)).last().map(String::as_str), Some("cancelled"));
    }

    #[test]
    fn integration_audit_log_covers_requests_and_stream_events() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("audit.log");
        let harness = harness_with_audit(AuditLog::open(&path, LogRotationPolicy::disabled()));
        let requests = vec![
            json!({"id": 1, "method": "initialize"}),
            json!({"id": 2, "method": "tools/call", "params": {"name": "count", "arguments": {"steps": 3}, "stream": true}}),
            json!({"id": 3, "method": "tools/call", "params": {"name": "record", "arguments": {"label": "z"}}}),
            json!({"id": 4, "method": "unknown"}),
        ];
        serve_lines(&harness, &requests);

        let frames = harness.output.frames().expect("frames");
        let stream_event_count = frames
            .iter()
            .filter(|frame| frame["method"] == "tools/stream")
            .count();
        assert_eq!(stream_event_count, 4);

        let records = std::fs::read_to_string(&path)
            .expect("audit")
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).expect("record"))
            .collect::<Vec<_>>();
        assert!(records.len() >= requests.len() + stream_event_count);
        let count = |event: &str| records.iter().filter(|record| record["event"] == event).count();
        assert_eq!(count("request"), requests.len());
        assert_eq!(count("stream_event"), stream_event_count);
        assert_eq!(count("server_start"), 1);
        assert_eq!(count("server_shutdown"), 1);
        assert_eq!(count("stream_end"), 1);
    }

    #[test]
    fn integration_protocol_fixture_initialize_tools_list_roundtrip() {
        let fixture = load_protocol_fixture("initialize-tools-list.json");
        assert_eq!(fixture.schema_version, 1);
        assert_eq!(fixture.name, "initialize-tools-list");
        let methods = fixture
            .requests
            .iter()
            .map(|request| request["method"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(methods, fixture.expected_methods);

        let harness = harness();
        let report = serve_lines(&harness, &fixture.requests);
        assert_eq!(report.processed_lines, fixture.requests.len());
        assert_eq!(report.error_count, 0);
        let ids = harness
            .output
            .frames()
            .expect("frames")
            .into_iter()
            .map(|frame| frame["id"].clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, fixture.expected_response_ids);
    }
}
