use cc_executor_error::ExecutorError;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{Notification, Request};

pub mod methods {
    pub const EXECUTE: &str = "execute";
    pub const CONTROL: &str = "control";
    pub const PONG: &str = "pong";

    pub const CONNECTED: &str = "connected";
    pub const PING: &str = "ping";
    pub const PROCESS_STARTED: &str = "process.started";
    pub const PROCESS_OUTPUT: &str = "process.output";
    pub const PROCESS_PAUSED: &str = "process.paused";
    pub const PROCESS_RESUMED: &str = "process.resumed";
    pub const PROCESS_CANCELLED: &str = "process.cancelled";
    pub const PROCESS_COMPLETED: &str = "process.completed";
    pub const PROCESS_ERROR: &str = "process.error";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    pub command: String,
    /// Stall threshold override in seconds for this execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlKind {
    Pause,
    Resume,
    Cancel,
}

impl ControlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ControlParams {
    #[serde(rename = "type")]
    pub kind: ControlKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "method", content = "params")]
pub enum ClientRequest {
    #[serde(rename = "execute")]
    Execute(ExecuteParams),
    #[serde(rename = "control")]
    Control(ControlParams),
}

impl ClientRequest {
    /// Resolves a request envelope into a typed call. Unknown methods and
    /// params that do not match the method's shape are distinct errors.
    pub fn from_request(request: &Request) -> Result<Self, ExecutorError> {
        match request.method.as_str() {
            methods::EXECUTE => Ok(Self::Execute(parse_params(&request.params)?)),
            methods::CONTROL => Ok(Self::Control(parse_params(&request.params)?)),
            other => Err(ExecutorError::MethodNotFound {
                method: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PongParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "method", content = "params")]
pub enum ClientNotification {
    #[serde(rename = "pong")]
    Pong(PongParams),
}

impl ClientNotification {
    /// Returns `Ok(None)` for notifications the server does not act on.
    pub fn from_notification(notification: &Notification) -> Result<Option<Self>, ExecutorError> {
        match notification.method.as_str() {
            methods::PONG => {
                let params = match &notification.params {
                    None => PongParams::default(),
                    Some(_) => parse_params(&notification.params)?,
                };
                Ok(Some(Self::Pong(params)))
            }
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Started,
    Paused,
    Resumed,
    Cancelled,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteResult {
    pub status: ProcessStatus,
    pub pid: u32,
    pub pgid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ControlResult {
    pub status: ProcessStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StatusUpdate {
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Stdout,
    Stderr,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputParams {
    #[serde(rename = "type")]
    pub stream: StreamType,
    pub data: String,
    pub truncated: bool,
    /// Position of this fragment within an oversized line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProcessErrorParams {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgid: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionInfo {
    pub session_id: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub reconnect_token: String,
    pub resumed: bool,
    /// Queued messages that follow this greeting on a resumed connection.
    pub replayed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PingParams {
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "method", content = "params")]
pub enum ServerNotification {
    #[serde(rename = "connected")]
    Connected(ConnectionInfo),
    #[serde(rename = "ping")]
    Ping(PingParams),
    #[serde(rename = "process.started")]
    ProcessStarted(StatusUpdate),
    #[serde(rename = "process.output")]
    ProcessOutput(OutputParams),
    #[serde(rename = "process.paused")]
    ProcessPaused(StatusUpdate),
    #[serde(rename = "process.resumed")]
    ProcessResumed(StatusUpdate),
    #[serde(rename = "process.cancelled")]
    ProcessCancelled(StatusUpdate),
    #[serde(rename = "process.completed")]
    ProcessCompleted(StatusUpdate),
    #[serde(rename = "process.error")]
    ProcessError(ProcessErrorParams),
}

impl ServerNotification {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Connected(_) => methods::CONNECTED,
            Self::Ping(_) => methods::PING,
            Self::ProcessStarted(_) => methods::PROCESS_STARTED,
            Self::ProcessOutput(_) => methods::PROCESS_OUTPUT,
            Self::ProcessPaused(_) => methods::PROCESS_PAUSED,
            Self::ProcessResumed(_) => methods::PROCESS_RESUMED,
            Self::ProcessCancelled(_) => methods::PROCESS_CANCELLED,
            Self::ProcessCompleted(_) => methods::PROCESS_COMPLETED,
            Self::ProcessError(_) => methods::PROCESS_ERROR,
        }
    }

    pub fn to_notification(&self) -> Result<Notification, serde_json::Error> {
        let params = match self {
            Self::Connected(params) => serde_json::to_value(params)?,
            Self::Ping(params) => serde_json::to_value(params)?,
            Self::ProcessOutput(params) => serde_json::to_value(params)?,
            Self::ProcessError(params) => serde_json::to_value(params)?,
            Self::ProcessStarted(params)
            | Self::ProcessPaused(params)
            | Self::ProcessResumed(params)
            | Self::ProcessCancelled(params)
            | Self::ProcessCompleted(params) => serde_json::to_value(params)?,
        };
        Ok(Notification::new(self.method(), Some(params)))
    }

    pub fn from_notification(notification: &Notification) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "method": notification.method,
            "params": notification.params,
        }))
    }
}

fn parse_params<T: DeserializeOwned>(params: &Option<Value>) -> Result<T, ExecutorError> {
    let value = params.clone().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|err| ExecutorError::InvalidParams {
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RequestId;
    use cc_executor_error::ErrorType;
    use serde_json::json;

    fn request(method: &str, params: Value) -> Request {
        Request {
            id: RequestId::Number(1),
            method: method.to_string(),
            params: Some(params),
        }
    }

    #[test]
    fn resolves_typed_requests() {
        let execute = ClientRequest::from_request(&request(
            "execute",
            json!({ "command": "echo hi", "timeout": 30 }),
        ))
        .expect("execute");
        assert_eq!(
            execute,
            ClientRequest::Execute(ExecuteParams {
                command: "echo hi".to_string(),
                timeout: Some(30),
            })
        );

        let control = ClientRequest::from_request(&request("control", json!({ "type": "PAUSE" })))
            .expect("control");
        assert_eq!(
            control,
            ClientRequest::Control(ControlParams {
                kind: ControlKind::Pause
            })
        );
    }

    #[test]
    fn distinguishes_unknown_methods_from_bad_params() {
        let err = ClientRequest::from_request(&request("launch", json!({}))).expect_err("unknown");
        assert_eq!(err.error_type(), ErrorType::MethodNotFound);

        let err = ClientRequest::from_request(&request("control", json!({ "type": "STOP" })))
            .expect_err("bad control type");
        assert_eq!(err.error_type(), ErrorType::InvalidParams);

        let err = ClientRequest::from_request(&Request {
            id: RequestId::Number(2),
            method: "execute".to_string(),
            params: None,
        })
        .expect_err("missing params");
        assert_eq!(err.error_type(), ErrorType::InvalidParams);
    }

    #[test]
    fn pong_params_are_optional() {
        let pong = ClientNotification::from_notification(&Notification::new("pong", None))
            .expect("pong");
        assert_eq!(pong, Some(ClientNotification::Pong(PongParams::default())));

        let other = ClientNotification::from_notification(&Notification::new("hello", None))
            .expect("ignored");
        assert_eq!(other, None);
    }

    #[test]
    fn server_notifications_use_dotted_methods() {
        let output = ServerNotification::ProcessOutput(OutputParams {
            stream: StreamType::Stderr,
            data: "boom\n".to_string(),
            truncated: false,
            chunk_index: None,
        });
        let notification = output.to_notification().expect("notification");
        assert_eq!(notification.method, "process.output");
        assert_eq!(
            notification.params,
            Some(json!({ "type": "stderr", "data": "boom\n", "truncated": false }))
        );
        assert_eq!(
            ServerNotification::from_notification(&notification).expect("round trip"),
            output
        );

        let completed = ServerNotification::ProcessCompleted(StatusUpdate {
            status: ProcessStatus::Cancelled,
            pid: Some(10),
            pgid: Some(10),
            exit_code: Some(-15),
            error: None,
        });
        assert_eq!(
            completed.to_notification().expect("notification").params,
            Some(json!({ "status": "cancelled", "pid": 10, "pgid": 10, "exit_code": -15 }))
        );
    }
}
