use std::fmt;

use cc_executor_error::{ErrorObject, ExecutorError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    fn from_value(value: Value) -> Result<Self, ExecutorError> {
        match value {
            Value::Number(number) => number
                .as_i64()
                .map(Self::Number)
                .ok_or_else(|| invalid("id must be an integer or a string")),
            Value::String(id) => Ok(Self::String(id)),
            _ => Err(invalid("id must be an integer or a string")),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(id) => Value::from(*id),
            Self::String(id) => Value::String(id.clone()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::String(id) => f.write_str(id),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(ErrorObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// `None` only when the failing frame carried no recoverable id.
    pub id: Option<RequestId>,
    pub outcome: ResponseOutcome,
}

impl Response {
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            outcome: ResponseOutcome::Result(result),
        }
    }

    pub fn error(id: Option<RequestId>, error: impl Into<ErrorObject>) -> Self {
        Self {
            id,
            outcome: ResponseOutcome::Error(error.into()),
        }
    }
}

/// A single protocol frame. Anything that does not fit one of the three
/// shapes is rejected at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// A rejected inbound frame. `id` is set whenever the frame got far enough
/// for its request id to be read, so the error response can still be matched.
#[derive(Debug)]
pub struct FrameError {
    pub id: Option<RequestId>,
    pub error: ExecutorError,
}

impl FrameError {
    fn new(id: Option<RequestId>, error: ExecutorError) -> Self {
        Self { id, error }
    }

    pub fn into_response(self) -> Response {
        Response::error(self.id, self.error)
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for FrameError {}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text).map_err(|err| {
            FrameError::new(
                None,
                ExecutorError::Parse {
                    message: err.to_string(),
                },
            )
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Object(mut object) = value else {
            return Err(FrameError::new(None, invalid("envelope must be a JSON object")));
        };

        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(id) => Some(RequestId::from_value(id).map_err(|err| FrameError::new(None, err))?),
        };
        let reject = |error: ExecutorError| FrameError::new(id.clone(), error);

        match object.remove("jsonrpc") {
            None => {}
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            Some(other) => {
                return Err(reject(invalid(format!("unsupported jsonrpc version {other}"))));
            }
        }

        let method = match object.remove("method") {
            None => None,
            Some(Value::String(method)) => Some(method),
            Some(_) => return Err(reject(invalid("method must be a string"))),
        };
        let params = match object.remove("params") {
            None | Some(Value::Null) => None,
            Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
            Some(_) => return Err(reject(invalid("params must be an object or an array"))),
        };
        let result = object.remove("result");
        let error = object.remove("error");

        match (method, id.clone(), result, error) {
            (Some(method), Some(id), None, None) => {
                Ok(Self::Request(Request { id, method, params }))
            }
            (Some(method), None, None, None) => {
                Ok(Self::Notification(Notification { method, params }))
            }
            (None, id, Some(result), None) if params.is_none() => Ok(Self::Response(Response {
                id,
                outcome: ResponseOutcome::Result(result),
            })),
            (None, response_id, None, Some(error)) if params.is_none() => {
                let error: ErrorObject = serde_json::from_value(error)
                    .map_err(|err| reject(invalid(format!("malformed error object: {err}"))))?;
                Ok(Self::Response(Response {
                    id: response_id,
                    outcome: ResponseOutcome::Error(error),
                }))
            }
            (None, _, None, None) => Err(reject(invalid("envelope has neither method nor result"))),
            _ => Err(reject(invalid("envelope mixes request and response members"))),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert(
            "jsonrpc".to_string(),
            Value::String(JSONRPC_VERSION.to_string()),
        );
        match self {
            Self::Request(request) => {
                object.insert("id".to_string(), request.id.to_value());
                object.insert("method".to_string(), Value::String(request.method.clone()));
                if let Some(params) = &request.params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Self::Notification(notification) => {
                object.insert(
                    "method".to_string(),
                    Value::String(notification.method.clone()),
                );
                if let Some(params) = &notification.params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Self::Response(response) => {
                object.insert(
                    "id".to_string(),
                    response
                        .id
                        .as_ref()
                        .map(RequestId::to_value)
                        .unwrap_or(Value::Null),
                );
                match &response.outcome {
                    ResponseOutcome::Result(result) => {
                        object.insert("result".to_string(), result.clone());
                    }
                    ResponseOutcome::Error(error) => {
                        let error = serde_json::to_value(error).unwrap_or_else(|_| {
                            serde_json::json!({ "code": error.code, "message": error.message })
                        });
                        object.insert("error".to_string(), error);
                    }
                }
            }
        }
        Value::Object(object)
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl From<Request> for Envelope {
    fn from(value: Request) -> Self {
        Self::Request(value)
    }
}

impl From<Notification> for Envelope {
    fn from(value: Notification) -> Self {
        Self::Notification(value)
    }
}

impl From<Response> for Envelope {
    fn from(value: Response) -> Self {
        Self::Response(value)
    }
}

fn invalid(message: impl Into<String>) -> ExecutorError {
    ExecutorError::InvalidRequest {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cc_executor_error::ErrorType;
    use serde_json::json;

    fn error_type(result: Result<Envelope, FrameError>) -> ErrorType {
        result.expect_err("envelope should be rejected").error.error_type()
    }

    #[test]
    fn classifies_requests_notifications_and_responses() {
        let request = Envelope::parse(
            r#"{"jsonrpc":"2.0","id":7,"method":"execute","params":{"command":"echo hi"}}"#,
        )
        .expect("request");
        assert_eq!(
            request,
            Envelope::Request(Request {
                id: RequestId::Number(7),
                method: "execute".to_string(),
                params: Some(json!({ "command": "echo hi" })),
            })
        );

        let notification = Envelope::parse(r#"{"method":"pong"}"#).expect("notification");
        assert_eq!(
            notification,
            Envelope::Notification(Notification::new("pong", None))
        );

        let response = Envelope::parse(r#"{"jsonrpc":"2.0","id":"a","result":{"ok":true}}"#)
            .expect("response");
        assert_eq!(
            response,
            Envelope::Response(Response::result(RequestId::from("a"), json!({ "ok": true })))
        );

        let error = Envelope::parse(
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"bad"}}"#,
        )
        .expect("error response");
        assert_eq!(
            error,
            Envelope::Response(Response::error(
                None,
                ErrorObject::new(ErrorType::ParseError, "bad")
            ))
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(error_type(Envelope::parse("{not json")), ErrorType::ParseError);
        assert_eq!(error_type(Envelope::parse("[1,2]")), ErrorType::InvalidRequest);
        assert_eq!(
            error_type(Envelope::parse(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#)),
            ErrorType::InvalidRequest
        );
        assert_eq!(
            error_type(Envelope::parse(r#"{"id":1,"method":5}"#)),
            ErrorType::InvalidRequest
        );
        assert_eq!(
            error_type(Envelope::parse(r#"{"id":1.5,"method":"x"}"#)),
            ErrorType::InvalidRequest
        );
        assert_eq!(
            error_type(Envelope::parse(r#"{"id":1,"method":"x","params":"nope"}"#)),
            ErrorType::InvalidRequest
        );
        assert_eq!(
            error_type(Envelope::parse(r#"{"id":1,"method":"x","result":1}"#)),
            ErrorType::InvalidRequest
        );
        assert_eq!(
            error_type(Envelope::parse(r#"{"id":1}"#)),
            ErrorType::InvalidRequest
        );
    }

    #[test]
    fn rejected_frames_keep_a_readable_id() {
        let version = Envelope::parse(r#"{"jsonrpc":"1.0","id":7,"method":"execute"}"#)
            .expect_err("old version");
        assert_eq!(version.id, Some(RequestId::Number(7)));
        assert_eq!(version.error.error_type(), ErrorType::InvalidRequest);

        let params = Envelope::parse(r#"{"id":"b","method":"execute","params":"x"}"#)
            .expect_err("scalar params");
        assert_eq!(params.id, Some(RequestId::from("b")));

        let response = params.into_response();
        assert_eq!(Envelope::from(response).to_value()["id"], json!("b"));

        let unreadable = Envelope::parse(r#"{"id":[1],"method":"execute"}"#).expect_err("bad id");
        assert_eq!(unreadable.id, None);
        assert_eq!(Envelope::parse("{oops").expect_err("not json").id, None);
    }

    #[test]
    fn outbound_frames_carry_version_and_null_ids() {
        let envelope = Envelope::from(Response::error(
            None,
            ExecutorError::Parse {
                message: "eof".to_string(),
            },
        ));
        assert_eq!(
            envelope.to_value(),
            json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32700, "message": "parse error: eof" },
            })
        );

        let notification = Envelope::from(Notification::new("ping", None));
        assert_eq!(
            serde_json::to_value(&notification).expect("serialize"),
            json!({ "jsonrpc": "2.0", "method": "ping" })
        );
    }
}
