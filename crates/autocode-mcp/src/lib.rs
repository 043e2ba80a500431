//! Line-delimited JSON-RPC tool server for the autocode function store.
//!
//! [`McpServer`] reads one request per line, routes `tools/call` through the
//! [`ToolRegistry`], runs streaming calls on background threads tracked by
//! [`StreamSessions`], and funnels every outbound line through one
//! [`OutboundWriter`]. [`AuditLog`] keeps a best-effort NDJSON record of all of it.

use std::any::Any;
use std::sync::{Mutex, MutexGuard};

pub mod audit;
pub mod jsonrpc;
pub mod registry;
pub mod server;
pub mod session;
pub mod tools;
pub mod writer;

pub use audit::{AuditEvent, AuditLog};
pub use jsonrpc::{
    DispatchError, InboundLine, JsonRpcRequest, ERROR_HANDLER_FAULT, ERROR_INVALID_PARAMS,
    ERROR_INVALID_REQUEST, ERROR_METHOD_NOT_FOUND, ERROR_PARSE, PROTOCOL_VERSION,
};
pub use registry::{object_schema, InvalidArgument, Tool, ToolArguments, ToolRegistry};
pub use server::{McpServer, ServeReport, ServerConfig};
pub use session::{StreamContext, StreamEvent, StreamOutcome, StreamSessionInfo, StreamSessions};
pub use tools::{autocode_registry, AutocodeServices, ToolSettings};
pub use writer::{OutboundWriter, SharedBuffer};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}
