use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const TERMINATE_JOB_METHOD: &str = "terminateJob";

pub const OUTBOUND_REQUEST_METHOD: &str = "OutboundRequest";
pub const OUTBOUND_RESPONSE_METHOD: &str = "OutboundResponse";
pub const UNHANDLED_ERROR_METHOD: &str = "UnhandledError";

pub const OK_RESULT: &str = "OK";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandMethod {
    Ping,
    ExecuteSnap,
    Terminate,
    SnapRpc,
}

impl CommandMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::ExecuteSnap => "executeSnap",
            Self::Terminate => "terminate",
            Self::SnapRpc => "snapRpc",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        input.parse().ok()
    }
}

impl std::str::FromStr for CommandMethod {
    type Err = ();

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "ping" => Ok(Self::Ping),
            "executeSnap" => Ok(Self::ExecuteSnap),
            "terminate" => Ok(Self::Terminate),
            "snapRpc" => Ok(Self::SnapRpc),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for CommandMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, detail)
    }

    pub fn to_value(&self) -> Value {
        let mut error = Map::new();
        error.insert("code".to_string(), json!(self.code));
        error.insert("message".to_string(), json!(self.message));
        if let Some(data) = &self.data {
            error.insert("data".to_string(), data.clone());
        }
        Value::Object(error)
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

#[derive(Clone, Debug, PartialEq)]
pub struct JsonRpcRequest {
    pub id: Value,
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn into_value(self) -> Value {
        let mut frame = envelope();
        frame.insert("id".to_string(), self.id);
        frame.insert("method".to_string(), Value::String(self.method));
        if let Some(params) = self.params {
            frame.insert("params".to_string(), params);
        }
        Value::Object(frame)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn into_value(self) -> Value {
        let mut frame = envelope();
        frame.insert("method".to_string(), Value::String(self.method));
        if let Some(params) = self.params {
            frame.insert("params".to_string(), params);
        }
        Value::Object(frame)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JsonRpcResponse {
    pub id: Value,
    pub outcome: Result<Value, JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn into_value(self) -> Value {
        let mut frame = envelope();
        frame.insert("id".to_string(), self.id);
        match self.outcome {
            Ok(result) => {
                frame.insert("result".to_string(), result);
            }
            Err(error) => {
                frame.insert("error".to_string(), error.to_value());
            }
        }
        Value::Object(frame)
    }
}

fn envelope() -> Map<String, Value> {
    let mut frame = Map::new();
    frame.insert("jsonrpc".to_string(), Value::String(JSONRPC_VERSION.to_string()));
    frame
}

pub fn request_id_key(id: &Value) -> String {
    match id {
        Value::String(id) => id.clone(),
        other => other.to_string(),
    }
}

/// A command-channel frame sorted by shape. Presence of `id` decides between
/// the request/response path and the notification path.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandFrame {
    Response {
        id: Value,
        outcome: Result<Value, JsonRpcError>,
    },
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Invalid {
        reason: String,
    },
}

impl CommandFrame {
    pub fn classify(frame: Value) -> Self {
        let Value::Object(mut map) = frame else {
            return Self::invalid("frame is not an object");
        };

        let id = map.remove("id").filter(|id| !id.is_null());
        let method = map.remove("method");
        let params = map.remove("params");

        match (id, method) {
            (Some(id), Some(Value::String(method))) => Self::Request { id, method, params },
            (None, Some(Value::String(method))) => Self::Notification { method, params },
            (_, Some(_)) => Self::invalid("method is not a string"),
            (Some(id), None) => {
                if let Some(error) = map.remove("error") {
                    let error = serde_json::from_value::<JsonRpcError>(error).unwrap_or_else(|err| {
                        JsonRpcError::internal(format!("malformed error response: {err}"))
                    });
                    Self::Response {
                        id,
                        outcome: Err(error),
                    }
                } else if let Some(result) = map.remove("result") {
                    Self::Response {
                        id,
                        outcome: Ok(result),
                    }
                } else {
                    Self::invalid("response carries neither result nor error")
                }
            }
            (None, None) => Self::invalid("frame has neither id nor method"),
        }
    }

    fn invalid(reason: &str) -> Self {
        Self::Invalid {
            reason: reason.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteSnapParams {
    pub snap_id: String,
    pub source_code: String,
    #[serde(default)]
    pub endowments: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapRpcParams {
    pub snap_id: String,
    pub origin: String,
    pub handler: String,
    pub request: Value,
}

impl ExecuteSnapParams {
    pub fn to_value(&self) -> Value {
        json!({
            "snapId": self.snap_id,
            "sourceCode": self.source_code,
            "endowments": self.endowments,
        })
    }
}

impl SnapRpcParams {
    pub fn to_value(&self) -> Value {
        json!({
            "snapId": self.snap_id,
            "origin": self.origin,
            "handler": self.handler,
            "request": self.request,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WorkerNotification {
    OutboundRequest { source: Option<String> },
    OutboundResponse { source: Option<String> },
    UnhandledError { error: JsonRpcError },
    Malformed { method: String, reason: String },
    Unknown { method: String },
}

impl WorkerNotification {
    pub fn from_parts(method: &str, params: Option<Value>) -> Self {
        match method {
            OUTBOUND_REQUEST_METHOD => Self::OutboundRequest {
                source: source_param(params.as_ref()),
            },
            OUTBOUND_RESPONSE_METHOD => Self::OutboundResponse {
                source: source_param(params.as_ref()),
            },
            UNHANDLED_ERROR_METHOD => {
                let error = params.and_then(|params| match params {
                    Value::Object(mut params) => params.remove("error"),
                    _ => None,
                });
                let Some(error) = error else {
                    return Self::Malformed {
                        method: method.to_string(),
                        reason: "params.error is missing".to_string(),
                    };
                };
                match serde_json::from_value::<JsonRpcError>(error) {
                    Ok(error) => Self::UnhandledError { error },
                    Err(err) => Self::Malformed {
                        method: method.to_string(),
                        reason: format!("params.error is not a structured error: {err}"),
                    },
                }
            }
            other => Self::Unknown {
                method: other.to_string(),
            },
        }
    }

    pub fn method(&self) -> &str {
        match self {
            Self::OutboundRequest { .. } => OUTBOUND_REQUEST_METHOD,
            Self::OutboundResponse { .. } => OUTBOUND_RESPONSE_METHOD,
            Self::UnhandledError { .. } => UNHANDLED_ERROR_METHOD,
            Self::Malformed { method, .. } | Self::Unknown { method } => method.as_str(),
        }
    }

    /// The frame a worker sends for this notification. Malformed and unknown
    /// variants only exist on the receiving side.
    pub fn to_notification(&self) -> Option<JsonRpcNotification> {
        match self {
            Self::OutboundRequest { source } | Self::OutboundResponse { source } => {
                let params = source.as_ref().map(|source| json!({ "source": source }));
                Some(JsonRpcNotification::new(self.method(), params))
            }
            Self::UnhandledError { error } => Some(JsonRpcNotification::new(
                UNHANDLED_ERROR_METHOD,
                Some(json!({ "error": error.to_value() })),
            )),
            Self::Malformed { .. } | Self::Unknown { .. } => None,
        }
    }
}

fn source_param(params: Option<&Value>) -> Option<String> {
    params
        .and_then(|params| params.get("source"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape_matches_jsonrpc() {
        let frame = JsonRpcRequest::new(
            "executeSnap:npm:demo:1",
            CommandMethod::ExecuteSnap.as_str(),
            Some(
                ExecuteSnapParams {
                    snap_id: "npm:demo".to_string(),
                    source_code: "module.exports = {}".to_string(),
                    endowments: vec!["console".to_string()],
                }
                .to_value(),
            ),
        )
        .into_value();

        assert_eq!(
            frame,
            json!({
                "jsonrpc": "2.0",
                "id": "executeSnap:npm:demo:1",
                "method": "executeSnap",
                "params": {
                    "snapId": "npm:demo",
                    "sourceCode": "module.exports = {}",
                    "endowments": ["console"],
                },
            })
        );
    }

    #[test]
    fn request_without_params_omits_the_field() {
        let frame = JsonRpcRequest::new("ping:a:1", "ping", None).into_value();
        assert_eq!(frame, json!({"jsonrpc": "2.0", "id": "ping:a:1", "method": "ping"}));
    }

    #[test]
    fn error_response_wire_shape_keeps_code_message_data() {
        let frame = JsonRpcResponse::failure(
            json!(4),
            JsonRpcError::new(-31001, "boom").with_data(json!({"detail": 1})),
        )
        .into_value();
        assert_eq!(
            frame,
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "error": {"code": -31001, "message": "boom", "data": {"detail": 1}},
            })
        );
    }

    #[test]
    fn success_response_with_null_result_keeps_result_key() {
        let frame = JsonRpcResponse::success(json!("a"), Value::Null).into_value();
        assert_eq!(frame, json!({"jsonrpc": "2.0", "id": "a", "result": null}));
        assert_eq!(
            CommandFrame::classify(frame),
            CommandFrame::Response {
                id: json!("a"),
                outcome: Ok(Value::Null),
            }
        );
    }

    #[test]
    fn classify_separates_requests_responses_and_notifications() {
        assert!(matches!(
            CommandFrame::classify(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})),
            CommandFrame::Request { ref method, .. } if method == "ping"
        ));
        assert!(matches!(
            CommandFrame::classify(json!({"jsonrpc": "2.0", "method": "OutboundRequest"})),
            CommandFrame::Notification { ref method, params: None } if method == "OutboundRequest"
        ));
        assert!(matches!(
            CommandFrame::classify(json!({"jsonrpc": "2.0", "id": "x", "result": "OK"})),
            CommandFrame::Response { outcome: Ok(ref v), .. } if v == "OK"
        ));
        assert!(matches!(
            CommandFrame::classify(json!({"jsonrpc": "2.0", "id": "x", "error": {"code": -1, "message": "no"}})),
            CommandFrame::Response { outcome: Err(ref e), .. } if e.code == -1 && e.message == "no"
        ));
    }

    #[test]
    fn classify_rejects_shapeless_frames() {
        assert!(matches!(
            CommandFrame::classify(json!("text")),
            CommandFrame::Invalid { .. }
        ));
        assert!(matches!(
            CommandFrame::classify(json!({"jsonrpc": "2.0"})),
            CommandFrame::Invalid { .. }
        ));
        assert!(matches!(
            CommandFrame::classify(json!({"jsonrpc": "2.0", "id": 3})),
            CommandFrame::Invalid { .. }
        ));
        assert!(matches!(
            CommandFrame::classify(json!({"jsonrpc": "2.0", "method": 5})),
            CommandFrame::Invalid { .. }
        ));
    }

    #[test]
    fn null_id_is_treated_as_absent() {
        assert!(matches!(
            CommandFrame::classify(json!({"jsonrpc": "2.0", "id": null, "method": "OutboundResponse"})),
            CommandFrame::Notification { .. }
        ));
    }

    #[test]
    fn request_id_key_normalizes_numbers_and_strings() {
        assert_eq!(request_id_key(&json!("ping:a:1")), "ping:a:1");
        assert_eq!(request_id_key(&json!(42)), "42");
    }

    #[test]
    fn unhandled_error_notification_parses_structured_error() {
        let notification = WorkerNotification::from_parts(
            UNHANDLED_ERROR_METHOD,
            Some(json!({"error": {"code": -32603, "message": "kaboom", "data": {"stack": "s"}}})),
        );
        assert_eq!(
            notification,
            WorkerNotification::UnhandledError {
                error: JsonRpcError::new(-32603, "kaboom").with_data(json!({"stack": "s"})),
            }
        );
    }

    #[test]
    fn unhandled_error_without_structured_error_is_malformed() {
        let missing = WorkerNotification::from_parts(UNHANDLED_ERROR_METHOD, None);
        assert!(matches!(missing, WorkerNotification::Malformed { .. }));

        let wrong_shape = WorkerNotification::from_parts(
            UNHANDLED_ERROR_METHOD,
            Some(json!({"error": "just text"})),
        );
        assert!(matches!(
            wrong_shape,
            WorkerNotification::Malformed { ref reason, .. } if reason.contains("structured error")
        ));
    }

    #[test]
    fn unrecognized_notification_falls_back_to_unknown() {
        let notification = WorkerNotification::from_parts("Telemetry", None);
        assert_eq!(
            notification,
            WorkerNotification::Unknown {
                method: "Telemetry".to_string()
            }
        );
        assert!(notification.to_notification().is_none());
    }

    #[test]
    fn outbound_notification_carries_source() {
        let frame = WorkerNotification::OutboundRequest {
            source: Some("fetch".to_string()),
        }
        .to_notification()
        .expect("outbound request is sendable")
        .into_value();
        assert_eq!(
            frame,
            json!({"jsonrpc": "2.0", "method": "OutboundRequest", "params": {"source": "fetch"}})
        );
    }

    #[test]
    fn command_method_parses_wire_names() {
        assert_eq!(CommandMethod::parse("snapRpc"), Some(CommandMethod::SnapRpc));
        assert_eq!(CommandMethod::parse("executeSnap"), Some(CommandMethod::ExecuteSnap));
        assert_eq!(CommandMethod::parse("terminateJob"), None);
        assert_eq!(CommandMethod::Terminate.to_string(), "terminate");
    }
}
