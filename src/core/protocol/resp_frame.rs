// src/core/protocol/resp_frame.rs

//! The RESP (REdis Serialization Protocol) frame structure and the matching
//! `Encoder`/`Decoder` pair used for every network conversation the watcher
//! has: with monitored instances, with peer watchers, and on its own admin
//! listener.

use crate::core::VigilError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits. Monitored nodes and peers are not required to speak
// a compatible dialect, so the decoder must survive arbitrary input.
const MAX_ARRAY_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
const MAX_DEPTH: usize = 64;

/// A single frame of the RESP wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds the usual `["CMD", arg, arg...]` request array out of string-ish parts.
    pub fn command<I, S>(parts: I) -> RespFrame
    where
        I: IntoIterator<Item = S>,
        S: Into<Bytes>,
    {
        RespFrame::Array(
            parts
                .into_iter()
                .map(|p| RespFrame::BulkString(p.into()))
                .collect(),
        )
    }
}

/// `tokio_util::codec` implementation for `RespFrame`.
#[derive(Debug, Default)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = VigilError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
            RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
            RespFrame::Array(items) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(items.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in items {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = VigilError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = &src[..];
        match parse_frame(&mut cursor, 0) {
            Ok(frame) => {
                let consumed = src.len() - cursor.len();
                src.advance(consumed);
                Ok(Some(frame))
            }
            // Incomplete input is not an error, just a request for more bytes.
            Err(VigilError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Recursive frame parser over an advancing byte cursor.
fn parse_frame(cursor: &mut &[u8], depth: usize) -> Result<RespFrame, VigilError> {
    if depth > MAX_DEPTH {
        return Err(VigilError::InvalidRequest(
            "RESP nesting depth limit exceeded".to_string(),
        ));
    }

    let Some((&kind, rest)) = cursor.split_first() else {
        return Err(VigilError::IncompleteData);
    };
    *cursor = rest;

    match kind {
        b'+' => Ok(RespFrame::SimpleString(take_line_utf8(cursor)?)),
        b'-' => Ok(RespFrame::Error(take_line_utf8(cursor)?)),
        b':' => Ok(RespFrame::Integer(take_decimal(cursor)?)),
        b'$' => parse_bulk(cursor),
        b'*' => parse_array(cursor, depth),
        _ => Err(VigilError::SyntaxError),
    }
}

fn take_line<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], VigilError> {
    let pos = cursor
        .windows(CRLF_LEN)
        .position(|w| w == CRLF)
        .ok_or(VigilError::IncompleteData)?;
    let line = &cursor[..pos];
    *cursor = &cursor[pos + CRLF_LEN..];
    Ok(line)
}

fn take_line_utf8(cursor: &mut &[u8]) -> Result<String, VigilError> {
    Ok(String::from_utf8_lossy(take_line(cursor)?).into_owned())
}

fn take_decimal(cursor: &mut &[u8]) -> Result<i64, VigilError> {
    let line = take_line(cursor)?;
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(VigilError::SyntaxError)
}

fn parse_bulk(cursor: &mut &[u8]) -> Result<RespFrame, VigilError> {
    let len = take_decimal(cursor)?;
    if len == -1 {
        return Ok(RespFrame::Null);
    }
    let len = usize::try_from(len).map_err(|_| VigilError::SyntaxError)?;
    if len > MAX_BULK_LEN {
        return Err(VigilError::SyntaxError);
    }
    if cursor.len() < len + CRLF_LEN {
        return Err(VigilError::IncompleteData);
    }
    if &cursor[len..len + CRLF_LEN] != CRLF {
        return Err(VigilError::SyntaxError);
    }
    let data = Bytes::copy_from_slice(&cursor[..len]);
    *cursor = &cursor[len + CRLF_LEN..];
    Ok(RespFrame::BulkString(data))
}

fn parse_array(cursor: &mut &[u8], depth: usize) -> Result<RespFrame, VigilError> {
    let len = take_decimal(cursor)?;
    if len == -1 {
        return Ok(RespFrame::NullArray);
    }
    let len = usize::try_from(len).map_err(|_| VigilError::SyntaxError)?;
    if len > MAX_ARRAY_ELEMENTS {
        return Err(VigilError::SyntaxError);
    }
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
        items.push(parse_frame(cursor, depth + 1)?);
    }
    Ok(RespFrame::Array(items))
}
