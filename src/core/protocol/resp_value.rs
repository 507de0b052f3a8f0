// src/core/protocol/resp_value.rs

//! A simplified value type produced by the admin command layer.

use bytes::Bytes;

/// `RespValue` is what command handlers return. It is a slightly smaller
/// surface than `RespFrame` and is converted into a frame right before it is
/// written to the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    BulkString(Bytes),
    Integer(i64),
    Array(Vec<RespValue>),
    Null,
    NullArray,
    Error(String),
}

impl RespValue {
    /// Convenience constructor for the ubiquitous bulk-string-from-text case.
    pub fn text(s: impl Into<String>) -> Self {
        RespValue::BulkString(Bytes::from(s.into()))
    }
}

impl From<RespValue> for super::RespFrame {
    fn from(val: RespValue) -> Self {
        match val {
            RespValue::SimpleString(s) => super::RespFrame::SimpleString(s),
            RespValue::BulkString(b) => super::RespFrame::BulkString(b),
            RespValue::Integer(i) => super::RespFrame::Integer(i),
            RespValue::Array(items) => {
                super::RespFrame::Array(items.into_iter().map(Into::into).collect())
            }
            RespValue::Null => super::RespFrame::Null,
            RespValue::NullArray => super::RespFrame::NullArray,
            RespValue::Error(s) => super::RespFrame::Error(s),
        }
    }
}
