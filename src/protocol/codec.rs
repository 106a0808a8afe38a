//! Newline-delimited JSON framing for control messages
//!
//! One envelope per line. Validation runs on both paths: outbound envelopes
//! that fail validation are never written, and inbound lines that fail to
//! parse or validate are surfaced as malformed so the server can answer with
//! a coded error instead of dropping the connection.

use crate::protocol::{Envelope, ErrorCode};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("refusing to send invalid message: {0}")]
    InvalidOutbound(String),
}

/// An inbound line that could not be turned into a valid envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedMessage {
    pub code: ErrorCode,
    pub original_message_id: Option<String>,
    pub sender_id: Option<String>,
    pub detail: String,
}

/// Result of reading one protocol line.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Connection closed cleanly.
    Closed,
    Envelope(Envelope),
    Malformed(MalformedMessage),
}

/// Serialize and write one envelope, newline-terminated.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = envelope.validate() {
        return Err(CodecError::InvalidOutbound(e.to_string()));
    }
    let mut line = serde_json::to_string(envelope)
        .map_err(|e| CodecError::InvalidOutbound(e.to_string()))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one line and decode it. Unknown `type` tags classify as
/// UNKNOWN_COMMAND; anything else unparseable or invalid is INVALID_MESSAGE.
pub async fn read_envelope<R>(reader: &mut R) -> Result<ReadOutcome, CodecError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(ReadOutcome::Closed);
    }
    Ok(decode_line(line.trim_end()))
}

pub fn decode_line(line: &str) -> ReadOutcome {
    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => match envelope.validate() {
            Ok(()) => ReadOutcome::Envelope(envelope),
            Err(e) => ReadOutcome::Malformed(MalformedMessage {
                code: ErrorCode::InvalidMessage,
                original_message_id: Some(envelope.message_id.clone()),
                sender_id: Some(envelope.sender_id.clone()),
                detail: e.to_string(),
            }),
        },
        Err(parse_err) => classify_undecodable(line, parse_err),
    }
}

fn classify_undecodable(line: &str, parse_err: serde_json::Error) -> ReadOutcome {
    // A well-formed JSON object with an unrecognized tag is an unknown
    // command; garbage is an invalid message.
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) => {
            let original_message_id =
                value.get("message_id").and_then(|v| v.as_str()).map(str::to_string);
            let sender_id = value.get("sender_id").and_then(|v| v.as_str()).map(str::to_string);
            let code = match value.get("type").and_then(|v| v.as_str()) {
                Some(tag) if !known_tag(tag) => ErrorCode::UnknownCommand,
                _ => ErrorCode::InvalidMessage,
            };
            ReadOutcome::Malformed(MalformedMessage {
                code,
                original_message_id,
                sender_id,
                detail: parse_err.to_string(),
            })
        }
        Err(_) => ReadOutcome::Malformed(MalformedMessage {
            code: ErrorCode::InvalidMessage,
            original_message_id: None,
            sender_id: None,
            detail: parse_err.to_string(),
        }),
    }
}

fn known_tag(tag: &str) -> bool {
    const TAGS: &[&str] = &[
        "register_request",
        "register_response",
        "deregister_request",
        "deregister_response",
        "discover_request",
        "discover_response",
        "is_alive_request",
        "is_alive_response",
        "register_file_request",
        "register_file_response",
        "unregister_file_request",
        "unregister_file_response",
        "get_peers_with_file_request",
        "get_peers_with_file_response",
        "search_files_request",
        "search_files_response",
        "file_request",
        "file_response",
        "file_transfer_start",
        "file_transfer_complete",
        "file_transfer_error",
        "ping",
        "pong",
        "heartbeat",
        "error",
    ];
    TAGS.contains(&tag)
}
