use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, ErrorKind, Result};

const JSONRPC_VERSION: &str = "2.0";

/// Correlation id of a request. Peers may use numbers or strings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map_or_else(|_| RequestId::String(value.to_string()), RequestId::Number)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

/// Positional or keyed parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    #[default]
    None,
    Array(Vec<Value>),
    Object(Map<String, Value>),
}

impl Params {
    fn from_value(value: Option<Value>) -> Result<Self> {
        match value {
            None | Some(Value::Null) => Ok(Params::None),
            Some(Value::Array(values)) => Ok(Params::Array(values)),
            Some(Value::Object(map)) => Ok(Params::Object(map)),
            Some(other) => Err(Error::new(
                ErrorKind::ProtocolError,
                format!("params must be an array, an object or null, got {other}"),
            )),
        }
    }

    fn into_value(self) -> Option<Value> {
        match self {
            Params::None => None,
            Params::Array(values) => Some(Value::Array(values)),
            Params::Object(map) => Some(Value::Object(map)),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Params::None => true,
            Params::Array(values) => values.is_empty(),
            Params::Object(map) => map.is_empty(),
        }
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Array(values)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Params::Object(map)
    }
}

/// Error object carried by a [`Response`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&Error> for RpcError {
    fn from(error: &Error) -> Self {
        let message = if error.msg.is_empty() {
            format!("{:?}", error.kind)
        } else {
            error.msg.clone()
        };
        Self {
            code: error.kind.code(),
            message,
            data: None,
        }
    }
}

impl From<Error> for RpcError {
    fn from(error: Error) -> Self {
        Self::from(&error)
    }
}

impl From<RpcError> for Error {
    fn from(error: RpcError) -> Self {
        Error::new(ErrorKind::from_code(error.code), error.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    /// `namespace.method`
    pub method: String,
    pub params: Params,
    /// Identity (node uuid) the request should be executed on.
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Params,
    pub target: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub payload: std::result::Result<Value, RpcError>,
}

impl Response {
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            payload: Ok(result),
        }
    }

    #[must_use]
    pub fn failure(id: RequestId, error: impl Into<RpcError>) -> Self {
        Self {
            id,
            payload: Err(error.into()),
        }
    }

    /// Converts the response into the handler-facing result.
    ///
    /// # Errors
    ///
    /// Returns the remote error translated back into an [`Error`].
    pub fn into_result(self) -> Result<Value> {
        self.payload.map_err(Error::from)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// The flat wire representation shared by all three envelope kinds.
#[derive(Serialize, Deserialize, Default)]
struct RawEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl Envelope {
    /// Decodes one envelope from a frame payload.
    ///
    /// # Errors
    ///
    /// Fails with a protocol error on invalid JSON or an envelope that is
    /// neither a request, a response nor a notification.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| Error::new(ErrorKind::ProtocolError, e.to_string()))?;

        if let Some(version) = &raw.jsonrpc
            && version != JSONRPC_VERSION
        {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!("unsupported jsonrpc version: {version}"),
            ));
        }

        match (raw.method, raw.id) {
            (Some(method), Some(id)) => Ok(Envelope::Request(Request {
                id,
                method,
                params: Params::from_value(raw.params)?,
                target: raw.target,
            })),
            (Some(method), None) => Ok(Envelope::Notification(Notification {
                method,
                params: Params::from_value(raw.params)?,
                target: raw.target,
            })),
            (None, Some(id)) => {
                let payload = match raw.error {
                    Some(error) => Err(error),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Envelope::Response(Response { id, payload }))
            }
            (None, None) => Err(Error::new(
                ErrorKind::ProtocolError,
                "envelope has neither method nor id",
            )),
        }
    }

    /// # Errors
    ///
    /// Fails only if a contained value cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut raw = RawEnvelope {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            ..RawEnvelope::default()
        };
        match self.clone() {
            Envelope::Request(request) => {
                raw.id = Some(request.id);
                raw.method = Some(request.method);
                raw.params = Some(request.params.into_value().unwrap_or(Value::Null));
                raw.target = request.target;
            }
            Envelope::Notification(notification) => {
                raw.method = Some(notification.method);
                raw.params = Some(notification.params.into_value().unwrap_or(Value::Null));
                raw.target = notification.target;
            }
            Envelope::Response(response) => {
                raw.id = Some(response.id);
                match response.payload {
                    Ok(result) => raw.result = Some(result),
                    Err(error) => raw.error = Some(error),
                }
            }
        }
        Ok(serde_json::to_vec(&raw)?)
    }

    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request(request) => Some(&request.method),
            Envelope::Notification(notification) => Some(&notification.method),
            Envelope::Response(_) => None,
        }
    }
}

/// Splits `namespace.method` at the first separator.
#[must_use]
pub fn split_method(method: &str) -> Option<(&str, &str)> {
    method.split_once('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_kinds() {
        let request = Envelope::decode(
            br#"{"jsonrpc":"2.0","id":7,"method":"node.connect","params":["192.0.2.10:5661",true],"target":"a"}"#,
        )
        .unwrap();
        let Envelope::Request(request) = request else {
            panic!("expected a request");
        };
        assert_eq!(request.id, RequestId::Number(7));
        assert_eq!(request.method, "node.connect");
        assert_eq!(
            request.params,
            Params::Array(vec![json!("192.0.2.10:5661"), json!(true)])
        );
        assert_eq!(request.target.as_deref(), Some("a"));

        let notification =
            Envelope::decode(br#"{"method":"log.write","params":{"line":"x"}}"#).unwrap();
        assert!(matches!(notification, Envelope::Notification(n) if n.method == "log.write"));

        let response = Envelope::decode(br#"{"id":"abc","result":null}"#).unwrap();
        assert_eq!(
            response,
            Envelope::Response(Response::success(
                RequestId::String("abc".into()),
                Value::Null
            ))
        );

        let failed =
            Envelope::decode(br#"{"id":1,"error":{"code":-32601,"message":"nope"}}"#).unwrap();
        let Envelope::Response(failed) = failed else {
            panic!("expected a response");
        };
        assert_eq!(failed.into_result().unwrap_err().kind, ErrorKind::MethodNotFound);
    }

    #[test]
    fn test_decode_errors() {
        for raw in [
            &b"{"[..],
            br#"{"jsonrpc":"1.0","id":1,"method":"a.b"}"#,
            br#"{"params":[]}"#,
            br#"{"id":1,"method":"a.b","params":3}"#,
        ] {
            assert_eq!(
                Envelope::decode(raw).unwrap_err().kind,
                ErrorKind::ProtocolError
            );
        }
    }

    #[test]
    fn test_encode_response_keeps_null_result() {
        let bytes = Envelope::Response(Response::success(RequestId::Number(3), Value::Null))
            .encode()
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 3, "result": null}));

        let error = Error::new(ErrorKind::NoSuchTarget, "I am not x");
        let bytes = Envelope::Response(Response::failure(RequestId::Number(4), &error))
            .encode()
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], json!(-32004));
        assert_eq!(value["error"]["message"], json!("I am not x"));
    }

    #[test]
    fn test_split_method() {
        assert_eq!(split_method("node.getUuid"), Some(("node", "getUuid")));
        assert_eq!(split_method("plain"), None);
    }
}
