//! Security protocol negotiation.
//!
//! Wire-compatible with multistream-select 1.0.0. Every message is a
//! length-prefixed line:
//!
//! ```text
//! uvarint(len) || utf8 text || '\n'      (len counts the newline)
//! ```
//!
//! ```text
//! initiator -> /multistream/1.0.0, /tether/noise-xx/1.0.0
//! responder -> /multistream/1.0.0
//! responder -> /tether/noise-xx/1.0.0      (or "na")
//! ```
//!
//! Messages are read exactly, never past the final newline, so the bytes
//! that follow negotiation stay in the stream for the handshake.

use crate::error::NegotiationError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Negotiation header both sides send first
pub const MULTISTREAM_PROTOCOL: &str = "/multistream/1.0.0";

/// Rejection reply
pub const NOT_AVAILABLE: &str = "na";

/// Request for the responder's supported protocols
pub const LIST_PROTOCOLS: &str = "ls";

/// Largest accepted message, including the newline
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Proposals a responder answers before giving up
pub const MAX_PROPOSALS: usize = 8;

/// Longest varint that can describe a length up to `MAX_MESSAGE_SIZE`,
/// plus slack for non-minimal encodings.
const MAX_VARINT_LEN: usize = 4;

fn encode_uvarint(mut value: usize, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Encode one negotiation message.
///
/// # Errors
///
/// Returns [`NegotiationError::MessageTooLarge`] if the encoded text would
/// exceed [`MAX_MESSAGE_SIZE`].
pub fn encode_message(text: &str) -> Result<Vec<u8>, NegotiationError> {
    frame_bytes(text.as_bytes())
}

fn frame_bytes(body: &[u8]) -> Result<Vec<u8>, NegotiationError> {
    let len = body.len() + 1;
    if len > MAX_MESSAGE_SIZE {
        return Err(NegotiationError::MessageTooLarge(len));
    }
    let mut out = Vec::with_capacity(len + 2);
    encode_uvarint(len, &mut out);
    out.extend_from_slice(body);
    out.push(b'\n');
    Ok(out)
}

/// Decode one negotiation message from the start of `buf`.
///
/// Returns `Ok(None)` if `buf` holds only part of a message, otherwise the
/// message text and the number of bytes consumed.
///
/// # Errors
///
/// Returns a [`NegotiationError`] for a malformed prefix, an oversize or
/// empty length, a missing newline, or non-UTF-8 text.
pub fn decode_message(buf: &[u8]) -> Result<Option<(String, usize)>, NegotiationError> {
    let mut len = 0usize;
    let mut prefix = 0usize;
    loop {
        let Some(&byte) = buf.get(prefix) else {
            return Ok(None);
        };
        len = push_varint_byte(len, prefix, byte)?;
        prefix += 1;
        if byte & 0x80 == 0 {
            break;
        }
    }
    check_length(len)?;

    let Some(body) = buf.get(prefix..prefix + len) else {
        return Ok(None);
    };
    let text = parse_body(body)?;
    Ok(Some((text, prefix + len)))
}

fn push_varint_byte(acc: usize, index: usize, byte: u8) -> Result<usize, NegotiationError> {
    if index >= MAX_VARINT_LEN {
        return Err(NegotiationError::InvalidVarint);
    }
    Ok(acc | (usize::from(byte & 0x7f) << (7 * index)))
}

fn check_length(len: usize) -> Result<(), NegotiationError> {
    if len == 0 {
        return Err(NegotiationError::MissingNewline);
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(NegotiationError::MessageTooLarge(len));
    }
    Ok(())
}

fn parse_body(body: &[u8]) -> Result<String, NegotiationError> {
    let Some((b'\n', text)) = body.split_last() else {
        return Err(NegotiationError::MissingNewline);
    };
    String::from_utf8(text.to_vec()).map_err(|_| NegotiationError::InvalidUtf8)
}

/// Read one raw message body (newline included) without over-reading.
async fn read_frame<S>(conn: &mut S) -> Result<Vec<u8>, NegotiationError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut len = 0usize;
    let mut index = 0usize;
    loop {
        let byte = conn.read_u8().await?;
        len = push_varint_byte(len, index, byte)?;
        index += 1;
        if byte & 0x80 == 0 {
            break;
        }
    }
    check_length(len)?;

    let mut body = vec![0u8; len];
    conn.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_message<S>(conn: &mut S) -> Result<String, NegotiationError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let body = read_frame(conn).await?;
    parse_body(&body)
}

async fn expect_header<S>(conn: &mut S) -> Result<(), NegotiationError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let header = read_message(conn).await?;
    if header == MULTISTREAM_PROTOCOL {
        Ok(())
    } else {
        Err(NegotiationError::UnexpectedHeader(header))
    }
}

/// Propose `protocol` and wait for the responder to accept it.
///
/// # Errors
///
/// Returns [`NegotiationError::Rejected`] if the responder answers `na`, and
/// other [`NegotiationError`]s for malformed replies or I/O failures.
pub async fn select_as_initiator<S>(conn: &mut S, protocol: &str) -> Result<(), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut out = encode_message(MULTISTREAM_PROTOCOL)?;
    out.extend_from_slice(&encode_message(protocol)?);
    conn.write_all(&out).await?;
    conn.flush().await?;

    expect_header(conn).await?;
    let response = read_message(conn).await?;
    if response == protocol {
        debug!("Negotiated {}", protocol);
        Ok(())
    } else if response == NOT_AVAILABLE {
        Err(NegotiationError::Rejected(protocol.to_string()))
    } else {
        Err(NegotiationError::UnexpectedMessage(response))
    }
}

/// Answer proposals until one of `supported` is chosen.
///
/// Returns the selected protocol tag.
///
/// # Errors
///
/// Returns [`NegotiationError::TooManyProposals`] after
/// [`MAX_PROPOSALS`] unsupported proposals, and other
/// [`NegotiationError`]s for malformed messages or I/O failures.
pub async fn select_as_responder<S>(
    conn: &mut S,
    supported: &[String],
) -> Result<String, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    conn.write_all(&encode_message(MULTISTREAM_PROTOCOL)?)
        .await?;
    conn.flush().await?;
    expect_header(conn).await?;

    for _ in 0..MAX_PROPOSALS {
        let proposal = read_message(conn).await?;

        if let Some(protocol) = supported.iter().find(|p| **p == proposal) {
            conn.write_all(&encode_message(protocol)?).await?;
            conn.flush().await?;
            return Ok(protocol.clone());
        }

        if proposal == LIST_PROTOCOLS {
            conn.write_all(&encode_protocol_list(supported)?).await?;
        } else {
            debug!("Peer proposed unsupported protocol {:?}", proposal);
            conn.write_all(&encode_message(NOT_AVAILABLE)?).await?;
        }
        conn.flush().await?;
    }

    Err(NegotiationError::TooManyProposals)
}

fn encode_protocol_list(supported: &[String]) -> Result<Vec<u8>, NegotiationError> {
    let mut body = Vec::new();
    for protocol in supported {
        body.extend_from_slice(&encode_message(protocol)?);
    }
    frame_bytes(&body)
}

/// Ask the responder which protocols it supports.
///
/// Leaves the negotiation open; a proposal may follow on the same stream.
///
/// # Errors
///
/// Returns a [`NegotiationError`] for malformed replies or I/O failures.
pub async fn list_protocols<S>(conn: &mut S) -> Result<Vec<String>, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut out = encode_message(MULTISTREAM_PROTOCOL)?;
    out.extend_from_slice(&encode_message(LIST_PROTOCOLS)?);
    conn.write_all(&out).await?;
    conn.flush().await?;

    expect_header(conn).await?;
    let body = read_frame(conn).await?;
    let Some((b'\n', mut rest)) = body.split_last() else {
        return Err(NegotiationError::MissingNewline);
    };

    let mut protocols = Vec::new();
    while !rest.is_empty() {
        match decode_message(rest)? {
            Some((protocol, used)) => {
                protocols.push(protocol);
                rest = &rest[used..];
            }
            None => return Err(NegotiationError::MissingNewline),
        }
    }
    Ok(protocols)
}

/// Propose `protocol` on a stream where the header was already exchanged
/// by [`list_protocols`].
///
/// # Errors
///
/// See [`select_as_initiator`].
pub async fn propose<S>(conn: &mut S, protocol: &str) -> Result<(), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    conn.write_all(&encode_message(protocol)?).await?;
    conn.flush().await?;
    let response = read_message(conn).await?;
    if response == protocol {
        Ok(())
    } else if response == NOT_AVAILABLE {
        Err(NegotiationError::Rejected(protocol.to_string()))
    } else {
        Err(NegotiationError::UnexpectedMessage(response))
    }
}
