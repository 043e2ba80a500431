use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use autocode_core::LogRotationPolicy;
use autocode_mcp::{
    autocode_registry, AuditLog, AutocodeServices, McpServer, OutboundWriter, ServeReport,
    ServerConfig, SharedBuffer, ToolSettings,
};
use autocode_store::{CompatibilityLinter, FunctionStore, JsonFunctionStore, TestStatus};
use autocode_worker::{ShellDialect, SingleFlightRunner, WorkerConfig};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

const INC_FUNCTION: &str = "inc() { echo $(( $1 + 1 )); }";

struct Stack {
    dir: TempDir,
}

impl Stack {
    fn new() -> Self {
        Self {
            dir: tempdir().expect("tempdir"),
        }
    }

    fn db_path(&self) -> PathBuf {
        self.dir.path().join("autocode_db.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.path().join("autocode_mcp.log")
    }

    /// One server session over `requests`, with a fresh worker and the store
    /// reopened from disk.
    fn serve(&self, requests: &[Value]) -> (ServeReport, Vec<Value>) {
        let runner = Arc::new(SingleFlightRunner::new(
            Arc::new(ShellDialect::default()),
            WorkerConfig::default(),
        ));
        let services = AutocodeServices {
            executor: runner.clone(),
            store: Arc::new(JsonFunctionStore::open(self.db_path()).expect("open store")),
            linter: Arc::new(CompatibilityLinter::default()),
            generator: None,
            settings: ToolSettings {
                stream_line_delay: Duration::ZERO,
                test_timeout: Duration::from_secs(10),
                ..ToolSettings::default()
            },
        };
        let buffer = SharedBuffer::new();
        let server = McpServer::new(
            ServerConfig::default(),
            autocode_registry(services).expect("registry"),
            OutboundWriter::new(buffer.clone()),
            AuditLog::open(self.log_path(), LogRotationPolicy::disabled()),
        );
        let input = requests
            .iter()
            .map(|request| format!("{request}\n"))
            .collect::<String>();
        let report = server.serve(Cursor::new(input)).expect("serve");
        runner.stop();
        (report, buffer.frames().expect("frames"))
    }
}

fn call(id: u64, tool: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": tool, "arguments": arguments},
    })
}

fn stream_call(id: u64, tool: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": tool, "arguments": arguments, "stream": true},
    })
}

fn response(frames: &[Value], id: u64) -> &Value {
    frames
        .iter()
        .find(|frame| frame["id"] == id && frame.get("method").is_none())
        .unwrap_or_else(|| panic!("no response for id {id}"))
}

fn tool_result(frames: &[Value], id: u64) -> &Value {
    &response(frames, id)["result"]["content"][0]["json"]
}

fn stream_events(frames: &[Value], call_id: u64) -> Vec<&Value> {
    frames
        .iter()
        .filter(|frame| frame["method"] == "tools/stream" && frame["params"]["callId"] == call_id)
        .map(|frame| &frame["params"])
        .collect()
}

fn audit_events(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .expect("audit log")
        .lines()
        .map(|line| {
            serde_json::from_str::<Value>(line).expect("audit json")["event"]
                .as_str()
                .expect("event")
                .to_string()
        })
        .collect()
}

/// Stores `inc` with one passing and one failing test; returns the function id.
fn seed_inc(stack: &Stack) -> String {
    let (_, frames) = stack.serve(&[call(
        1,
        "add_function",
        json!({"name": "inc", "description": "adds one", "code": INC_FUNCTION, "modules": ["math"]}),
    )]);
    let function_id = tool_result(&frames, 1)["function_id"]
        .as_str()
        .expect("function id")
        .to_string();
    let (_, frames) = stack.serve(&[
        call(
            2,
            "add_test",
            json!({"function_id": function_id, "name": "one", "description": "1+1", "test_code": "[ \"$(inc 1)\" = 2 ]"}),
        ),
        call(
            3,
            "add_test",
            json!({"function_id": function_id, "name": "wrong", "description": "bad", "test_code": "[ \"$(inc 1)\" = 3 ]"}),
        ),
    ]);
    assert_eq!(tool_result(&frames, 2)["ok"], true);
    assert_eq!(tool_result(&frames, 3)["ok"], true);
    function_id
}

#[test]
fn integration_run_tests_executes_through_worker_and_persists_results() {
    let stack = Stack::new();
    let function_id = seed_inc(&stack);

    let (report, frames) = stack.serve(&[call(4, "run_tests", json!({"function_id": function_id}))]);
    assert_eq!(report.error_count, 0);
    let result = tool_result(&frames, 4);
    assert_eq!(result["total"], 2);
    assert_eq!(result["passed"], 1);
    assert_eq!(result["failed"], 1);

    let reopened = JsonFunctionStore::open(stack.db_path()).expect("reopen");
    let stored = reopened.test_results(Some(&function_id));
    assert_eq!(stored.len(), 2);
    assert_eq!(
        stored
            .iter()
            .filter(|result| result.status == TestStatus::Passed)
            .count(),
        1
    );
    let coverage = reopened.coverage_report();
    assert_eq!(coverage[0].num_tests, 2);
    assert_eq!(coverage[0].passed, 1);
}

#[test]
fn integration_streamed_run_tests_emits_chunks_and_single_terminal_event() {
    let stack = Stack::new();
    let function_id = seed_inc(&stack);

    let (report, frames) = stack.serve(&[stream_call(
        7,
        "run_tests",
        json!({"module": "math"}),
    )]);
    assert_eq!(report.abandoned_streams, 0);
    assert_eq!(
        response(&frames, 7)["result"],
        json!({"streaming": true, "callId": 7})
    );
    let events = stream_events(&frames, 7);
    let chunks = events.iter().filter(|event| event["event"] == "chunk").count();
    let terminal = events
        .iter()
        .filter(|event| event["event"] != "chunk")
        .collect::<Vec<_>>();
    assert_eq!(chunks, 2);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0]["event"], "complete");
    assert_eq!(terminal[0]["data"]["passed"], 1);
    assert_eq!(events.last().expect("last")["event"], "complete");

    let reopened = JsonFunctionStore::open(stack.db_path()).expect("reopen");
    assert_eq!(reopened.test_results(Some(&function_id)).len(), 2);

    let events = audit_events(&stack.log_path());
    assert!(events.contains(&"stream_start".to_string()));
    assert!(events.contains(&"stream_end".to_string()));
}

#[test]
fn integration_worker_recovers_after_timeout_without_stale_replies() {
    let stack = Stack::new();
    let (report, frames) = stack.serve(&[
        call(1, "eval_julia", json!({"expression": "sleep 1; echo late", "timeout_ms": 100})),
        call(2, "eval_julia", json!({"expression": "echo fresh"})),
        call(3, "eval_julia", json!({"expression": "kill -9 $$"})),
        call(4, "eval_julia", json!({"expression": "echo restarted"})),
    ]);
    assert_eq!(report.processed_lines, 4);
    assert_eq!(tool_result(&frames, 1)["error"]["type"], "ExecutionTimedOut");
    assert_eq!(
        tool_result(&frames, 2)["result"],
        json!({"success": true, "output": "fresh"})
    );
    assert_eq!(tool_result(&frames, 3)["error"]["type"], "InterpreterCrashed");
    assert_eq!(tool_result(&frames, 4)["result"]["output"], "restarted");
}

#[test]
fn regression_blank_expression_is_invalid_params_and_worker_keeps_answering() {
    let stack = Stack::new();
    let (report, frames) = stack.serve(&[
        call(1, "eval_julia", json!({"expression": ""})),
        call(2, "eval_julia", json!({"expression": "echo one"})),
        call(3, "eval_julia", json!({"expression": "   "})),
        call(4, "eval_julia", json!({"expression": "echo two"})),
    ]);
    assert_eq!(report.error_count, 2);
    for id in [1, 3] {
        assert_eq!(response(&frames, id)["error"]["code"], -32602);
    }
    assert_eq!(tool_result(&frames, 2)["result"]["output"], "one");
    assert_eq!(tool_result(&frames, 4)["result"]["output"], "two");
}

#[test]
fn integration_store_survives_server_restart() {
    let stack = Stack::new();
    let function_id = seed_inc(&stack);
    let (_, frames) = stack.serve(&[
        call(1, "get_function", json!({"id": function_id})),
        call(2, "list_modules", json!({})),
        call(
            3,
            "modify_function",
            json!({"id": function_id, "modifier": "ops", "description": "clarify", "code": INC_FUNCTION}),
        ),
    ]);
    assert_eq!(tool_result(&frames, 1)["result"]["tests"].as_array().map(Vec::len), Some(2));
    assert_eq!(tool_result(&frames, 2)["result"], json!(["math"]));

    let (_, frames) = stack.serve(&[call(4, "function_history", json!({"function_id": function_id}))]);
    assert_eq!(tool_result(&frames, 4)["modification_count"], 1);
}
