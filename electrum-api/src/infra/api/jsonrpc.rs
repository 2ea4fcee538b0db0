// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC 2.0 wire types with auto-detection of single and batched
//! requests, parameter binding for positional and named arguments, and the
//! shared parameter validators.

use crate::domain::{hex_to_hash, scripthash_to_hashx};
use indexer_common::domain::{H160, HashX, TxHash};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;

pub const BAD_REQUEST: i64 = 1;
pub const DAEMON_ERROR: i64 = 2;
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;

/// A JSON-RPC error object. These are responses, not faults: the session
/// continues unless wrapped in [`HandlerError::Disconnect`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn daemon_error(message: impl Display) -> Self {
        Self {
            code: DAEMON_ERROR,
            message: format!("daemon error: {message}"),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("unknown method: {method}"),
        }
    }
}

impl From<crate::domain::storage::DbError> for RpcError {
    fn from(error: crate::domain::storage::DbError) -> Self {
        RpcError::bad_request(format!("db error: {error}"))
    }
}

impl From<crate::domain::daemon::DaemonError> for RpcError {
    fn from(error: crate::domain::daemon::DaemonError) -> Self {
        RpcError::daemon_error(error)
    }
}

/// A handler outcome that is an error response, optionally followed by
/// closing the connection (protocol-level refusal).
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("{0}, disconnecting")]
    Disconnect(RpcError),
}

impl HandlerError {
    pub fn rpc_error(&self) -> &RpcError {
        match self {
            HandlerError::Rpc(error) => error,
            HandlerError::Disconnect(error) => error,
        }
    }
}

impl From<crate::domain::storage::DbError> for HandlerError {
    fn from(error: crate::domain::storage::DbError) -> Self {
        HandlerError::Rpc(error.into())
    }
}

impl From<crate::domain::daemon::DaemonError> for HandlerError {
    fn from(error: crate::domain::daemon::DaemonError) -> Self {
        HandlerError::Rpc(error.into())
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// One incoming JSON-RPC payload: a single call or a batch.
#[derive(Debug)]
pub enum Incoming {
    Single(Value),
    Batch(Vec<Value>),
}

impl Incoming {
    /// Auto-detect a single call versus a batch.
    pub fn parse(payload: &str) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_str(payload).map_err(|_| RpcError {
            code: PARSE_ERROR,
            message: "invalid JSON".to_string(),
        })?;

        match value {
            Value::Array(calls) if calls.is_empty() => Err(RpcError {
                code: INVALID_REQUEST,
                message: "batch is empty".to_string(),
            }),
            Value::Array(calls) => Ok(Incoming::Batch(calls)),
            value => Ok(Incoming::Single(value)),
        }
    }
}

/// A parsed call. Without an `id` this is a client notification, which the
/// server discards.
#[derive(Debug)]
pub struct RpcCall {
    pub id: Option<Value>,
    pub method: String,
    pub params: Params,
}

impl RpcCall {
    pub fn parse(value: Value) -> Result<Self, RpcError> {
        let Value::Object(mut call) = value else {
            return Err(RpcError {
                code: INVALID_REQUEST,
                message: "request must be an object".to_string(),
            });
        };

        let method = match call.remove("method") {
            Some(Value::String(method)) => method,
            _ => {
                return Err(RpcError {
                    code: INVALID_REQUEST,
                    message: "request must have a string method".to_string(),
                });
            }
        };

        let id = call.remove("id").filter(|id| !id.is_null());
        let params = Params::parse(call.remove("params"))?;

        Ok(Self { id, method, params })
    }
}

/// Build a success response.
pub fn result_response(id: &Value, result: &Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response.
pub fn error_response(id: &Value, error: &RpcError) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

/// Build a server-to-client notification.
pub fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

/// Call parameters, positional or named.
#[derive(Debug, Clone)]
pub enum Params {
    None,
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Params {
    pub fn parse(value: Option<Value>) -> Result<Self, RpcError> {
        match value {
            None | Some(Value::Null) => Ok(Params::None),
            Some(Value::Array(values)) => Ok(Params::Positional(values)),
            Some(Value::Object(values)) => Ok(Params::Named(values)),
            Some(_) => Err(RpcError::bad_request("params must be an array or object")),
        }
    }

    pub fn reader(self) -> ParamsReader {
        ParamsReader {
            params: self,
            index: 0,
        }
    }
}

/// Sequential parameter binding: positional parameters are consumed in
/// declaration order, named parameters are looked up by name.
#[derive(Debug)]
pub struct ParamsReader {
    params: Params,
    index: usize,
}

impl ParamsReader {
    pub fn required(&mut self, name: &str) -> Result<Value, RpcError> {
        self.optional(name)
            .ok_or_else(|| RpcError::bad_request(format!("missing required argument: {name}")))
    }

    pub fn optional(&mut self, name: &str) -> Option<Value> {
        match &mut self.params {
            Params::None => None,
            Params::Positional(values) => {
                let value = values.get(self.index).cloned();
                self.index += 1;
                value
            }
            Params::Named(values) => values.remove(name),
        }
    }

    /// Fail on excess positional arguments.
    pub fn finish(self) -> Result<(), RpcError> {
        match &self.params {
            Params::Positional(values) if values.len() > self.index => Err(
                RpcError::bad_request(format!("too many arguments: {}", values.len())),
            ),
            _ => Ok(()),
        }
    }
}

// --- Validators

pub fn non_negative_integer(value: &Value) -> Result<u64, RpcError> {
    let parsed = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };

    parsed.ok_or_else(|| RpcError::bad_request(format!("{value} should be a non-negative integer")))
}

pub fn assert_boolean(value: &Value) -> Result<bool, RpcError> {
    value
        .as_bool()
        .ok_or_else(|| RpcError::bad_request(format!("{value} should be a boolean value")))
}

pub fn assert_string(value: &Value) -> Result<String, RpcError> {
    value
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| RpcError::bad_request(format!("{value} should be a string")))
}

/// A display-hex transaction hash, returned in internal byte order.
pub fn assert_tx_hash(value: &Value) -> Result<TxHash, RpcError> {
    value
        .as_str()
        .and_then(|s| hex_to_hash(s).ok())
        .ok_or_else(|| RpcError::bad_request(format!("{value} should be a transaction hash")))
}

pub fn assert_raw_bytes(value: &Value) -> Result<Vec<u8>, RpcError> {
    value
        .as_str()
        .and_then(|s| const_hex::decode(s).ok())
        .ok_or_else(|| RpcError::bad_request("argument should be hex-encoded bytes"))
}

pub fn assert_scripthash(value: &Value) -> Result<HashX, RpcError> {
    value
        .as_str()
        .and_then(scripthash_to_hashx)
        .ok_or_else(|| RpcError::bad_request(format!("{value} is not a valid script hash")))
}

pub fn check_asset(name: &Value) -> Result<String, RpcError> {
    let Some(name) = name.as_str() else {
        return Err(RpcError::bad_request(format!(
            "the asset name must be a string ({name})"
        )));
    };
    check_asset_str(name)?;
    Ok(name.to_owned())
}

pub fn check_asset_str(name: &str) -> Result<(), RpcError> {
    if name.is_empty() {
        return Err(RpcError::bad_request("asset name is empty!"));
    }
    if name.len() > 32 {
        return Err(RpcError::bad_request(
            "asset name greater than 32 characters",
        ));
    }
    Ok(())
}

pub fn check_h160(value: &Value) -> Result<H160, RpcError> {
    let h160 = value
        .as_str()
        .ok_or_else(|| RpcError::bad_request("the h160 must be a string"))?;
    if h160.len() != 40 {
        return Err(RpcError::bad_request("h160 not 20 bytes"));
    }
    h160.parse()
        .map_err(|_| RpcError::bad_request("h160 not 20 bytes"))
}

// --- Protocol versions

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion(pub u32, pub u32);

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s.split_once('.').ok_or(())?;
        Ok(Self(
            major.parse().map_err(|_| ())?,
            minor.parse().map_err(|_| ())?,
        ))
    }
}

/// Find the highest protocol version in the intersection of the server range
/// and the client's requested version or range. Also returns the client
/// minimum, used for diagnostics when there is no overlap.
pub fn negotiate_protocol(
    client_request: Option<&Value>,
    server_min: ProtocolVersion,
    server_max: ProtocolVersion,
) -> (Option<ProtocolVersion>, Option<ProtocolVersion>) {
    fn parse(value: &Value) -> Option<ProtocolVersion> {
        match value {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => format!("{n}").parse().or_else(|_| format!("{n}.0").parse()).ok(),
            _ => None,
        }
    }

    let (client_min, client_max) = match client_request {
        None => (server_min, server_min),
        Some(Value::Array(range)) if range.len() == 2 => {
            match (parse(&range[0]), parse(&range[1])) {
                (Some(min), Some(max)) => (min, max),
                _ => return (None, None),
            }
        }
        Some(value) => match parse(value) {
            Some(version) => (version, version),
            None => return (None, None),
        },
    };

    let result = client_max.min(server_max);
    if result < client_min.max(server_min) {
        (None, Some(client_min))
    } else {
        (Some(result), Some(client_min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_incoming_autodetect() {
        assert_matches!(Incoming::parse(r#"{"id":1,"method":"server.ping"}"#), Ok(Incoming::Single(_)));
        assert_matches!(Incoming::parse(r#"[{"id":1,"method":"server.ping"}]"#), Ok(Incoming::Batch(calls)) if calls.len() == 1);
        assert_matches!(Incoming::parse("[]"), Err(RpcError { code: INVALID_REQUEST, .. }));
        assert_matches!(Incoming::parse("not json"), Err(RpcError { code: PARSE_ERROR, .. }));
    }

    #[test]
    fn test_rpc_call_parse() {
        let call = RpcCall::parse(serde_json::json!({
            "id": 7,
            "method": "blockchain.block.header",
            "params": [123]
        }))
        .unwrap();
        assert_eq!(call.id, Some(serde_json::json!(7)));
        assert_eq!(call.method, "blockchain.block.header");

        // A call without an id is a notification.
        let call = RpcCall::parse(serde_json::json!({ "method": "server.ping" })).unwrap();
        assert_eq!(call.id, None);

        assert_matches!(
            RpcCall::parse(serde_json::json!({ "id": 1 })),
            Err(RpcError { code: INVALID_REQUEST, .. })
        );
    }

    #[test]
    fn test_params_positional_binding() {
        let params = Params::parse(Some(serde_json::json!([123, true]))).unwrap();
        let mut reader = params.reader();
        assert_eq!(reader.required("height").unwrap(), serde_json::json!(123));
        assert_eq!(reader.optional("verbose"), Some(serde_json::json!(true)));
        assert_eq!(reader.optional("missing"), None);
        reader.finish().unwrap();
    }

    #[test]
    fn test_params_named_binding() {
        let params = Params::parse(Some(serde_json::json!({ "height": 5 }))).unwrap();
        let mut reader = params.reader();
        assert_eq!(reader.required("height").unwrap(), serde_json::json!(5));
        assert_matches!(reader.required("tx_hash"), Err(_));
    }

    #[test]
    fn test_params_excess_positional() {
        let params = Params::parse(Some(serde_json::json!([1, 2, 3]))).unwrap();
        let mut reader = params.reader();
        reader.required("only").unwrap();
        assert_matches!(reader.finish(), Err(_));
    }

    #[test]
    fn test_non_negative_integer() {
        assert_eq!(non_negative_integer(&serde_json::json!(5)).unwrap(), 5);
        assert_eq!(non_negative_integer(&serde_json::json!("5")).unwrap(), 5);
        assert_matches!(non_negative_integer(&serde_json::json!(-1)), Err(_));
        assert_matches!(non_negative_integer(&serde_json::json!(1.5)), Err(_));
    }

    #[test]
    fn test_check_asset() {
        assert_matches!(check_asset(&serde_json::json!("GOOD_ASSET")), Ok(_));
        assert_matches!(check_asset(&serde_json::json!("")), Err(_));
        assert_matches!(check_asset(&serde_json::json!("X".repeat(33))), Err(_));
        assert_matches!(check_asset(&serde_json::json!(17)), Err(_));
    }

    #[test]
    fn test_check_h160() {
        let h160 = "00".repeat(20);
        assert_matches!(check_h160(&serde_json::json!(h160)), Ok(_));
        assert_matches!(check_h160(&serde_json::json!("abcd")), Err(_));
    }

    #[test]
    fn test_negotiate_protocol() {
        let min = ProtocolVersion(1, 4);
        let max = ProtocolVersion(1, 11);

        // A single version within range.
        let (result, _) = negotiate_protocol(Some(&serde_json::json!("1.10")), min, max);
        assert_eq!(result, Some(ProtocolVersion(1, 10)));

        // A range caps at the server maximum.
        let (result, _) = negotiate_protocol(Some(&serde_json::json!(["1.4", "2.0"])), min, max);
        assert_eq!(result, Some(ProtocolVersion(1, 11)));

        // No overlap.
        let (result, client_min) = negotiate_protocol(Some(&serde_json::json!("2.0")), min, max);
        assert_eq!(result, None);
        assert_eq!(client_min, Some(ProtocolVersion(2, 0)));

        // Omitted: the server minimum.
        let (result, _) = negotiate_protocol(None, min, max);
        assert_eq!(result, Some(ProtocolVersion(1, 4)));
    }
}
