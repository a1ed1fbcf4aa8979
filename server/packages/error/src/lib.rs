use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    SessionLimitExceeded,
    CommandNotAllowed,
    ProcessNotFound,
    StreamTimeout,
    ProcessAlreadyRunning,
    InvalidState,
    SessionNotFound,
}

impl ErrorType {
    pub const ALL: [ErrorType; 12] = [
        Self::ParseError,
        Self::InvalidRequest,
        Self::MethodNotFound,
        Self::InvalidParams,
        Self::InternalError,
        Self::SessionLimitExceeded,
        Self::CommandNotAllowed,
        Self::ProcessNotFound,
        Self::StreamTimeout,
        Self::ProcessAlreadyRunning,
        Self::InvalidState,
        Self::SessionNotFound,
    ];

    /// Numeric code carried in the `error.code` field of a response.
    pub fn code(&self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::SessionLimitExceeded => -32001,
            Self::CommandNotAllowed => -32002,
            Self::ProcessNotFound => -32003,
            Self::StreamTimeout => -32004,
            Self::ProcessAlreadyRunning => -32005,
            Self::InvalidState => -32006,
            Self::SessionNotFound => -32007,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|error_type| error_type.code() == code)
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::ParseError => "Parse Error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method Not Found",
            Self::InvalidParams => "Invalid Params",
            Self::InternalError => "Internal Error",
            Self::SessionLimitExceeded => "Session Limit Exceeded",
            Self::CommandNotAllowed => "Command Not Allowed",
            Self::ProcessNotFound => "Process Not Found",
            Self::StreamTimeout => "Stream Timeout",
            Self::ProcessAlreadyRunning => "Process Already Running",
            Self::InvalidState => "Invalid State",
            Self::SessionNotFound => "Session Not Found",
        }
    }
}

/// The `error` member of a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            code: error_type.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn error_type(&self) -> Option<ErrorType> {
        ErrorType::from_code(self.code)
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("parse error: {message}")]
    Parse { message: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("method not found: {method}")]
    MethodNotFound { method: String },
    #[error("invalid params: {message}")]
    InvalidParams { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
    #[error("failed to spawn `{command}`: {message}")]
    SpawnFailed { command: String, message: String },
    #[error("session limit exceeded ({active}/{max})")]
    SessionLimitExceeded { active: usize, max: usize },
    #[error("command not allowed: {reason}")]
    CommandNotAllowed { command: String, reason: String },
    #[error("process not found: {message}")]
    ProcessNotFound { message: String },
    #[error("no output for {elapsed_ms}ms")]
    StreamTimeout { elapsed_ms: u64 },
    #[error("a process is already running (pid {pid})")]
    ProcessAlreadyRunning { pid: u32 },
    #[error("cannot {command} a process that is {state}")]
    InvalidState { command: String, state: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
}

impl ExecutorError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Parse { .. } => ErrorType::ParseError,
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::MethodNotFound { .. } => ErrorType::MethodNotFound,
            Self::InvalidParams { .. } => ErrorType::InvalidParams,
            Self::Internal { .. } | Self::SpawnFailed { .. } => ErrorType::InternalError,
            Self::SessionLimitExceeded { .. } => ErrorType::SessionLimitExceeded,
            Self::CommandNotAllowed { .. } => ErrorType::CommandNotAllowed,
            Self::ProcessNotFound { .. } => ErrorType::ProcessNotFound,
            Self::StreamTimeout { .. } => ErrorType::StreamTimeout,
            Self::ProcessAlreadyRunning { .. } => ErrorType::ProcessAlreadyRunning,
            Self::InvalidState { .. } => ErrorType::InvalidState,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
        }
    }

    pub fn code(&self) -> i64 {
        self.error_type().code()
    }

    pub fn to_error_object(&self) -> ErrorObject {
        let mut data = Map::new();
        match self {
            Self::MethodNotFound { method } => {
                data.insert("method".to_string(), Value::String(method.clone()));
            }
            Self::SpawnFailed { command, .. } => {
                data.insert("command".to_string(), Value::String(command.clone()));
            }
            Self::SessionLimitExceeded { active, max } => {
                data.insert("active_sessions".to_string(), Value::from(*active as u64));
                data.insert("max_sessions".to_string(), Value::from(*max as u64));
            }
            Self::CommandNotAllowed { command, .. } => {
                data.insert("command".to_string(), Value::String(command.clone()));
            }
            Self::StreamTimeout { elapsed_ms } => {
                data.insert("elapsed_ms".to_string(), Value::from(*elapsed_ms));
            }
            Self::ProcessAlreadyRunning { pid } => {
                data.insert("pid".to_string(), Value::from(*pid));
            }
            Self::InvalidState { command, state } => {
                data.insert("command".to_string(), Value::String(command.clone()));
                data.insert("state".to_string(), Value::String(state.clone()));
            }
            Self::SessionNotFound { session_id } => {
                data.insert("session_id".to_string(), Value::String(session_id.clone()));
            }
            Self::Parse { .. }
            | Self::InvalidRequest { .. }
            | Self::InvalidParams { .. }
            | Self::Internal { .. }
            | Self::ProcessNotFound { .. } => {}
        }

        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data: if data.is_empty() {
                None
            } else {
                Some(Value::Object(data))
            },
        }
    }
}

impl From<ExecutorError> for ErrorObject {
    fn from(value: ExecutorError) -> Self {
        value.to_error_object()
    }
}

impl From<&ExecutorError> for ErrorObject {
    fn from(value: &ExecutorError) -> Self {
        value.to_error_object()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_unique() {
        assert_eq!(ErrorType::ParseError.code(), -32700);
        assert_eq!(ErrorType::SessionLimitExceeded.code(), -32001);
        assert_eq!(ErrorType::StreamTimeout.code(), -32004);

        let mut codes: Vec<i64> = ErrorType::ALL.iter().map(ErrorType::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), ErrorType::ALL.len());

        for error_type in ErrorType::ALL {
            assert_eq!(ErrorType::from_code(error_type.code()), Some(error_type));
        }
        assert_eq!(ErrorType::from_code(42), None);
    }

    #[test]
    fn spawn_failures_report_as_internal_errors() {
        let err = ExecutorError::SpawnFailed {
            command: "missing-binary".to_string(),
            message: "No such file or directory".to_string(),
        };
        let object = err.to_error_object();
        assert_eq!(object.code, -32603);
        assert_eq!(object.error_type(), Some(ErrorType::InternalError));
        assert_eq!(
            object.data,
            Some(serde_json::json!({ "command": "missing-binary" }))
        );
    }

    #[test]
    fn error_object_omits_empty_data() {
        let object = ExecutorError::ProcessNotFound {
            message: "no process is running".to_string(),
        }
        .to_error_object();
        let value = serde_json::to_value(&object).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "code": -32003,
                "message": "process not found: no process is running",
            })
        );
    }
}
