//! Wire types for the cc-executor WebSocket protocol.
//!
//! Every frame is a JSON-RPC 2.0 shaped [`Envelope`]. Requests flow from the
//! client (`execute`, `control`), notifications flow mostly from the server
//! (`connected`, `ping`, `process.*`) and the client answers pings with `pong`.

use schemars::schema_for;
use serde_json::Value;

pub mod envelope;
pub mod messages;

pub use cc_executor_error::{ErrorObject, ErrorType, ExecutorError};
pub use envelope::{
    Envelope, FrameError, Notification, Request, RequestId, Response, ResponseOutcome,
    JSONRPC_VERSION,
};
pub use messages::{
    methods, ClientNotification, ClientRequest, ConnectionInfo, ControlKind, ControlParams,
    ControlResult, ExecuteParams, ExecuteResult, OutputParams, PingParams, PongParams,
    ProcessErrorParams, ProcessStatus, ServerNotification, StatusUpdate, StreamType,
};

pub const PROTOCOL_VERSION: &str = "1.0.0";

pub const CAPABILITIES: [&str; 4] = ["execute", "control", "stream", "reconnect"];

/// JSON schema of every message kind, keyed by direction.
pub fn protocol_schema() -> Result<Value, serde_json::Error> {
    Ok(serde_json::json!({
        "version": PROTOCOL_VERSION,
        "client_requests": serde_json::to_value(schema_for!(ClientRequest))?,
        "client_notifications": serde_json::to_value(schema_for!(ClientNotification))?,
        "server_notifications": serde_json::to_value(schema_for!(ServerNotification))?,
        "results": {
            "execute": serde_json::to_value(schema_for!(ExecuteResult))?,
            "control": serde_json::to_value(schema_for!(ControlResult))?,
        },
        "error": serde_json::to_value(schema_for!(ErrorObject))?,
    }))
}
