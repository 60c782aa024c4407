//! JSON-RPC request and response messages.
//!
//! Params, ids and results are heterogeneous on the wire (strings, numbers,
//! nested arrays, null), so they are kept as [`serde_json::Value`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::StratumError;
use crate::error::Result;

/// A request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub id: Value,

    pub method: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub params: Vec<Value>,

    /// Worker name as sent separately by some ETHProxy miners.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
}

impl JsonRpcRequest {
    pub fn new(id: Value, method: &str, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.to_string(),
            params,
            worker: None,
            jsonrpc: None,
        }
    }

    /// Decode one line (the trailing newline is optional).
    pub fn parse(line: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(line)?)
    }

    /// Encode as a newline-terminated line.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// The string param at `index`, if present and a string.
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.params.get(index).and_then(Value::as_str)
    }

    /// The worker field, treating an empty string as absent.
    pub fn worker_field(&self) -> Option<&str> {
        self.worker.as_deref().filter(|w| !w.is_empty())
    }
}

/// A response to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    #[serde(default)]
    pub id: Value,

    #[serde(default)]
    pub result: Value,

    #[serde(default)]
    pub error: Value,
}

impl JsonRpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: None,
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn error(id: Value, error: &StratumError, server_id: u8) -> Self {
        Self {
            jsonrpc: None,
            id,
            result: Value::Null,
            error: error.to_json(server_id),
        }
    }

    /// A reply to `request`, echoing its JSON-RPC version marker.
    pub fn reply_to(request: &JsonRpcRequest, result: Value) -> Self {
        Self::result(request.id.clone(), result).with_jsonrpc(&request.jsonrpc)
    }

    pub fn error_to(
        request: &JsonRpcRequest,
        error: &StratumError,
        server_id: u8,
    ) -> Self {
        Self::error(request.id.clone(), error, server_id)
            .with_jsonrpc(&request.jsonrpc)
    }

    pub fn with_jsonrpc(mut self, version: &Option<String>) -> Self {
        self.jsonrpc = version.clone();
        self
    }

    pub fn parse(line: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(line)?)
    }

    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Whether the result is literally `true`.
    pub fn is_true(&self) -> bool {
        self.result == Value::Bool(true)
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<Value>, D::Error> {
    Ok(Option::<Vec<Value>>::deserialize(d)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let req = JsonRpcRequest::parse(
            br#"{"id":1,"method":"mining.subscribe","params":["cgminer/4.9.2"]}"#,
        )
        .unwrap();
        assert_eq!(req.id, json!(1));
        assert_eq!(req.method, "mining.subscribe");
        assert_eq!(req.param_str(0), Some("cgminer/4.9.2"));
        assert_eq!(req.param_str(1), None);
        assert_eq!(req.worker, None);
    }

    #[test]
    fn test_parse_request_null_params() {
        let req =
            JsonRpcRequest::parse(br#"{"id":"a","method":"x","params":null}"#).unwrap();
        assert!(req.params.is_empty());
    }

    #[test]
    fn test_parse_request_rejects_garbage() {
        assert!(JsonRpcRequest::parse(b"not json\n").is_err());
        assert!(JsonRpcRequest::parse(br#"{"id":1}"#).is_err());
    }

    #[test]
    fn test_request_line_omits_absent_fields() {
        let req = JsonRpcRequest::new(json!(2), "mining.authorize", vec![json!("a.b")]);
        assert_eq!(
            req.to_line().unwrap(),
            b"{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"a.b\"]}\n"
        );
    }

    #[test]
    fn test_worker_field() {
        let req = JsonRpcRequest::parse(
            br#"{"id":1,"method":"eth_submitLogin","params":["0x00"],"worker":""}"#,
        )
        .unwrap();
        assert_eq!(req.worker_field(), None);
    }

    #[test]
    fn test_response_line() {
        let resp = JsonRpcResponse::result(json!(1), json!(true));
        assert_eq!(
            resp.to_line().unwrap(),
            b"{\"id\":1,\"result\":true,\"error\":null}\n"
        );
    }

    #[test]
    fn test_reply_echoes_jsonrpc_version() {
        let req = JsonRpcRequest::parse(
            br#"{"jsonrpc":"2.0","id":5,"method":"mining.subscribe","params":[]}"#,
        )
        .unwrap();
        let resp = JsonRpcResponse::error_to(&req, &StratumError::NEED_SUBSCRIBED, 3);
        assert_eq!(
            String::from_utf8(resp.to_line().unwrap()).unwrap(),
            "{\"jsonrpc\":\"2.0\",\"id\":5,\"result\":null,\
             \"error\":[101,\"Need Subscribed (switcher 3)\",null]}\n"
        );
    }

    #[test]
    fn test_parse_response() {
        let resp = JsonRpcResponse::parse(br#"{"id":2,"result":true,"error":null}"#).unwrap();
        assert!(resp.is_true());

        let resp = JsonRpcResponse::parse(br#"{"id":2,"result":false}"#).unwrap();
        assert!(!resp.is_true());
        assert_eq!(resp.error, Value::Null);
    }
}
