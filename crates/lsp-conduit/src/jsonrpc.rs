//! JSON-RPC 2.0 envelopes and the structural classification of inbound
//! payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The protocol version tag carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Identifier correlating a request with its response.
///
/// Identifiers issued locally are always numeric; identifiers on requests
/// initiated by the peer are opaque and echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    /// Integer identifier.
    Number(i64),
    /// String identifier.
    String(String),
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(formatter, "{value}"),
            Self::String(value) => write!(formatter, "\"{value}\""),
        }
    }
}

/// Reserved JSON-RPC and LSP error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received.
    ParseError,
    /// The JSON sent is not a valid request object.
    InvalidRequest,
    /// The method does not exist or is not handled.
    MethodNotFound,
    /// Invalid method parameters.
    InvalidParams,
    /// Internal JSON-RPC error.
    InternalError,
    /// Start of the implementation-defined server error range.
    ServerErrorStart,
    /// End of the implementation-defined server error range.
    ServerErrorEnd,
    /// A request arrived before the server was initialized.
    ServerNotInitialized,
    /// Unknown error.
    UnknownErrorCode,
    /// The client cancelled the request.
    RequestCancelled,
    /// The document changed while the request was running.
    ContentModified,
    /// The server cancelled the request.
    ServerCancelled,
    /// A syntactically valid request failed.
    RequestFailed,
    /// Any code without a reserved meaning.
    Other(i64),
}

impl ErrorCode {
    /// Returns the numeric wire value.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerErrorStart => -32099,
            Self::ServerErrorEnd => -32000,
            Self::ServerNotInitialized => -32002,
            Self::UnknownErrorCode => -32001,
            Self::RequestCancelled => -32800,
            Self::ContentModified => -32801,
            Self::ServerCancelled => -32802,
            Self::RequestFailed => -32803,
            Self::Other(code) => code,
        }
    }

    /// Returns true when the code lies in the implementation-defined server
    /// error range.
    #[must_use]
    pub const fn is_server_error_range(self) -> bool {
        let code = self.code();
        code >= -32099 && code <= -32000
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32099 => Self::ServerErrorStart,
            -32000 => Self::ServerErrorEnd,
            -32002 => Self::ServerNotInitialized,
            -32001 => Self::UnknownErrorCode,
            -32800 => Self::RequestCancelled,
            -32801 => Self::ContentModified,
            -32802 => Self::ServerCancelled,
            -32803 => Self::RequestFailed,
            other => Self::Other(other),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    /// Creates an error object without data.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Attaches structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The reply synthesized for a peer request nobody handles.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("method not handled: {method}"),
        )
    }

    /// Returns the error code as an [`ErrorCode`].
    #[must_use]
    pub fn kind(&self) -> ErrorCode {
        ErrorCode::from(self.code)
    }
}

/// A JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Request identifier.
    pub id: MessageId,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a new request with the given identifier.
    #[must_use]
    pub fn new(id: MessageId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (no response expected, no `id` field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response message.
///
/// Exactly one of `result` and `error` is present on the wire. A `null`
/// result deserializes as `None`; [`JsonRpcResponse::into_result`] restores
/// it as [`Value::Null`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version.
    pub jsonrpc: String,
    /// Request identifier this response corresponds to.
    pub id: MessageId,
    /// The result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl JsonRpcResponse {
    /// Creates a success response. A `null` result is kept on the wire.
    #[must_use]
    pub fn success(id: MessageId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn failure(id: MessageId, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Splits the response into its outcome.
    ///
    /// # Errors
    ///
    /// Returns the peer's error object when the response carries one.
    pub fn into_result(self) -> Result<Value, ResponseError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Why an inbound payload could not be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnrecognizedReason {
    /// The payload is not valid JSON.
    InvalidJson(String),
    /// The payload is JSON but not an object.
    NotAnObject,
    /// The field set matches none of the envelope shapes.
    UnknownShape,
    /// The field set matched a shape but the fields had the wrong types.
    InvalidEnvelope(String),
}

impl fmt::Display for UnrecognizedReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson(message) => write!(formatter, "invalid JSON: {message}"),
            Self::NotAnObject => formatter.write_str("payload is not a JSON object"),
            Self::UnknownShape => formatter.write_str("payload matches no envelope shape"),
            Self::InvalidEnvelope(message) => write!(formatter, "invalid envelope: {message}"),
        }
    }
}

/// An inbound payload classified once at the parse boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// A response to a request issued by this side.
    Response(JsonRpcResponse),
    /// A notification from the peer.
    Notification(JsonRpcNotification),
    /// A request from the peer that must be answered.
    Request(JsonRpcRequest),
    /// Nothing routable.
    Unrecognized(UnrecognizedReason),
}

impl IncomingMessage {
    /// Classifies a payload by the presence of `id`, `method`, `result` and
    /// `error`.
    ///
    /// Priority is response, then notification, then request. A response
    /// must carry exactly one of `result` and `error` and no `method`. A
    /// notification has no `id` key at all; `"id": null` alongside a method
    /// is unrecognized.
    #[must_use]
    pub fn classify(payload: &[u8]) -> Self {
        let parsed: Value = match serde_json::from_slice(payload) {
            Ok(parsed) => parsed,
            Err(error) => {
                return Self::Unrecognized(UnrecognizedReason::InvalidJson(error.to_string()));
            }
        };
        let Value::Object(object) = parsed else {
            return Self::Unrecognized(UnrecognizedReason::NotAnObject);
        };

        let shape = Shape::of(&object);
        let envelope = Value::Object(object);

        if shape.is_response() {
            return decode(envelope, Self::Response);
        }
        if shape.is_notification() {
            return decode(envelope, Self::Notification);
        }
        if shape.is_request() {
            return decode(envelope, Self::Request);
        }
        Self::Unrecognized(UnrecognizedReason::UnknownShape)
    }
}

fn decode<T, F>(value: Value, wrap: F) -> IncomingMessage
where
    T: serde::de::DeserializeOwned,
    F: FnOnce(T) -> IncomingMessage,
{
    match serde_json::from_value(value) {
        Ok(message) => wrap(message),
        Err(error) => {
            IncomingMessage::Unrecognized(UnrecognizedReason::InvalidEnvelope(error.to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Shape {
    has_id_key: bool,
    has_id: bool,
    has_method: bool,
    has_result: bool,
    has_error: bool,
}

impl Shape {
    fn of(object: &Map<String, Value>) -> Self {
        let id = object.get("id");
        Self {
            has_id_key: id.is_some(),
            has_id: id.is_some_and(|id| !id.is_null()),
            has_method: object.contains_key("method"),
            has_result: object.contains_key("result"),
            has_error: object.contains_key("error"),
        }
    }

    const fn is_response(self) -> bool {
        self.has_id && !self.has_method && (self.has_result != self.has_error)
    }

    const fn is_notification(self) -> bool {
        self.has_method && !self.has_id_key
    }

    const fn is_request(self) -> bool {
        self.has_method && self.has_id
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn serialises_request_with_params() {
        let request = JsonRpcRequest::new(
            MessageId::Number(1),
            "mymethod",
            Some(json!({"uri": "hello"})),
        );
        let json = serde_json::to_string(&request).expect("serialization failed");

        assert_eq!(
            json,
            r#"{"jsonrpc":"2.0","id":1,"method":"mymethod","params":{"uri":"hello"}}"#
        );
    }

    #[rstest]
    fn serialises_request_without_params() {
        let request = JsonRpcRequest::new(MessageId::Number(42), "shutdown", None);
        let json = serde_json::to_string(&request).expect("serialization failed");

        assert_eq!(json, r#"{"jsonrpc":"2.0","id":42,"method":"shutdown"}"#);
    }

    #[rstest]
    fn serialises_notification_without_id_field() {
        let notification = JsonRpcNotification::new("initialized", Some(json!({})));
        let json = serde_json::to_string(&notification).expect("serialization failed");

        assert_eq!(json, r#"{"jsonrpc":"2.0","method":"initialized","params":{}}"#);
    }

    #[rstest]
    fn serialises_null_result_explicitly() {
        let response = JsonRpcResponse::success(MessageId::from("abc"), Value::Null);
        let json = serde_json::to_string(&response).expect("serialization failed");

        assert_eq!(json, r#"{"jsonrpc":"2.0","id":"abc","result":null}"#);
    }

    #[rstest]
    fn serialises_error_response() {
        let response = JsonRpcResponse::failure(
            MessageId::Number(7),
            ResponseError::method_not_found("workspace/configuration"),
        );
        let json = serde_json::to_string(&response).expect("serialization failed");

        assert_eq!(
            json,
            r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"method not handled: workspace/configuration"}}"#
        );
    }

    #[rstest]
    #[case(r#"1"#, MessageId::Number(1))]
    #[case(r#""req-9""#, MessageId::String(String::from("req-9")))]
    fn deserialises_both_identifier_kinds(#[case] raw: &str, #[case] expected: MessageId) {
        let id: MessageId = serde_json::from_str(raw).expect("parse failed");

        assert_eq!(id, expected);
    }

    #[rstest]
    fn classifies_success_response() {
        let payload = br#"{"jsonrpc":"2.0","id":1,"result":{"uri":"goodbye"}}"#;

        let IncomingMessage::Response(response) = IncomingMessage::classify(payload) else {
            panic!("expected a response");
        };

        assert_eq!(response.id, MessageId::Number(1));
        assert_eq!(response.into_result(), Ok(json!({"uri": "goodbye"})));
    }

    #[rstest]
    fn classifies_null_result_as_response() {
        let payload = br#"{"jsonrpc":"2.0","id":3,"result":null}"#;

        let IncomingMessage::Response(response) = IncomingMessage::classify(payload) else {
            panic!("expected a response");
        };

        assert_eq!(response.into_result(), Ok(Value::Null));
    }

    #[rstest]
    fn classifies_error_response() {
        let payload =
            br#"{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid request"}}"#;

        let IncomingMessage::Response(response) = IncomingMessage::classify(payload) else {
            panic!("expected a response");
        };
        let error = response.into_result().expect_err("expected an error");

        assert_eq!(error.kind(), ErrorCode::InvalidRequest);
        assert_eq!(error.message, "Invalid request");
    }

    #[rstest]
    fn classifies_notification() {
        let payload = br#"{"jsonrpc":"2.0","method":"iamnotification","params":"iamstring"}"#;

        let IncomingMessage::Notification(notification) = IncomingMessage::classify(payload)
        else {
            panic!("expected a notification");
        };

        assert_eq!(notification.method, "iamnotification");
        assert_eq!(notification.params, Some(json!("iamstring")));
    }

    #[rstest]
    fn classifies_server_request() {
        let payload = br#"{"jsonrpc":"2.0","id":"srv-1","method":"workspace/configuration","params":{"items":[]}}"#;

        let IncomingMessage::Request(request) = IncomingMessage::classify(payload) else {
            panic!("expected a request");
        };

        assert_eq!(request.id, MessageId::from("srv-1"));
        assert_eq!(request.method, "workspace/configuration");
    }

    #[rstest]
    #[case::invalid_json(&b"{not json"[..])]
    #[case::array(&br#"[1,2,3]"#[..])]
    #[case::both_result_and_error(&br#"{"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}"#[..])]
    #[case::id_without_outcome(&br#"{"jsonrpc":"2.0","id":1}"#[..])]
    #[case::null_id_with_method(&br#"{"jsonrpc":"2.0","id":null,"method":"x"}"#[..])]
    #[case::malformed_error(&br#"{"jsonrpc":"2.0","id":1,"error":"boom"}"#[..])]
    fn rejects_unroutable_payloads(#[case] payload: &[u8]) {
        assert!(matches!(
            IncomingMessage::classify(payload),
            IncomingMessage::Unrecognized(_)
        ));
    }

    #[rstest]
    #[case(-32700, ErrorCode::ParseError)]
    #[case(-32601, ErrorCode::MethodNotFound)]
    #[case(-32002, ErrorCode::ServerNotInitialized)]
    #[case(-32800, ErrorCode::RequestCancelled)]
    #[case(-32050, ErrorCode::Other(-32050))]
    fn maps_reserved_error_codes(#[case] code: i64, #[case] expected: ErrorCode) {
        let kind = ErrorCode::from(code);

        assert_eq!(kind, expected);
        assert_eq!(kind.code(), code);
    }

    #[rstest]
    fn recognises_server_error_range() {
        assert!(ErrorCode::Other(-32050).is_server_error_range());
        assert!(ErrorCode::ServerNotInitialized.is_server_error_range());
        assert!(!ErrorCode::MethodNotFound.is_server_error_range());
    }
}
