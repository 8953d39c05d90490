//! Wire framing protocol.
//!
//! Every frame on the wire, in both directions, has the layout
//! `code(2B ASCII) | length(4B ASCII hex) | payload(length bytes)`.
//! The one exception is the client's opening magic string, which is 22 raw
//! bytes with no code/length wrapper.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Client handshake magic string, sent once before any framed traffic.
pub const MAGIC: &[u8; 22] = b"WHISPER_STREAMING_V1.0";

pub const CODE_USERNAME: [u8; 2] = *b"%u";
pub const CODE_STATUS_QUERY: [u8; 2] = *b"%c";
pub const CODE_BEGIN: [u8; 2] = *b"%b";
pub const CODE_SPEECH: [u8; 2] = *b"%s";
pub const CODE_FINISH: [u8; 2] = *b"%f";
pub const CODE_WELCOME: [u8; 2] = *b"%L";
pub const CODE_ENGINE_STATUS: [u8; 2] = *b"%C";
pub const CODE_RESULT: [u8; 2] = *b"%R";
pub const CODE_ERROR: [u8; 2] = *b"%E";
pub const CODE_FINAL: [u8; 2] = *b"%F";

/// Maximum payload length a single frame can carry (4 hex digits).
pub const MAX_PAYLOAD_LEN: usize = 0xFFFF;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed before a full frame was read")]
    Truncated,
    #[error("invalid hex length field {0:?}")]
    InvalidLength(String),
    #[error("payload length {0} exceeds the 4-hex-digit maximum")]
    PayloadTooLarge(usize),
    #[error("client sent an invalid magic string")]
    InvalidMagic,
    #[error("payload was not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Map a raw I/O error from a partial read into `Truncated`. Any other
    /// I/O error (e.g. connection reset) passes through.
    fn from_read_err(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    }
}

/// Read exactly 22 bytes and check them against [`MAGIC`].
pub async fn read_magic<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), ProtocolError> {
    let mut buf = [0u8; 22];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(ProtocolError::from_read_err)?;
    if &buf == MAGIC {
        Ok(())
    } else {
        Err(ProtocolError::InvalidMagic)
    }
}

/// Read one `code | length | payload` frame. Loops internally (via
/// `read_exact`) until every byte count is satisfied; EOF mid-frame is
/// reported as [`ProtocolError::Truncated`], never a partial buffer.
pub async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<([u8; 2], Vec<u8>), ProtocolError> {
    let mut code = [0u8; 2];
    stream
        .read_exact(&mut code)
        .await
        .map_err(ProtocolError::from_read_err)?;

    let mut len_hex = [0u8; 4];
    stream
        .read_exact(&mut len_hex)
        .await
        .map_err(ProtocolError::from_read_err)?;
    let len_str = std::str::from_utf8(&len_hex)
        .map_err(|_| ProtocolError::InvalidLength(format!("{:?}", len_hex)))?;
    let len = u16::from_str_radix(len_str, 16)
        .map_err(|_| ProtocolError::InvalidLength(len_str.to_string()))? as usize;

    let payload = if len > 0 {
        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(ProtocolError::from_read_err)?;
        buf
    } else {
        Vec::new()
    };

    Ok((code, payload))
}

/// Write one `code | length | payload` frame as a single contiguous buffer
/// (one `write_all` call worth of bytes).
pub async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    code: [u8; 2],
    payload: &[u8],
) -> Result<(), ProtocolError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(6 + payload.len());
    buf.extend_from_slice(&code);
    buf.extend_from_slice(format!("{:04x}", payload.len()).as_bytes());
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.map_err(ProtocolError::Io)
}

/// Convenience: write a terminal `%F` frame, optionally carrying a reason.
pub async fn write_final<S: AsyncWrite + Unpin>(
    stream: &mut S,
    reason: Option<&str>,
) -> Result<(), ProtocolError> {
    write_frame(stream, CODE_FINAL, reason.unwrap_or("").as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let codes = [
            CODE_USERNAME,
            CODE_STATUS_QUERY,
            CODE_BEGIN,
            CODE_SPEECH,
            CODE_FINISH,
            CODE_WELCOME,
            CODE_ENGINE_STATUS,
            CODE_RESULT,
            CODE_ERROR,
            CODE_FINAL,
        ];
        let payloads: [&[u8]; 4] = [b"", b"hello", &[0u8; 300], &[7u8; 0xFFFF]];

        for code in codes {
            for payload in payloads {
                let (mut client, mut server) = tokio::io::duplex(70_000);
                write_frame(&mut client, code, payload).await.unwrap();
                drop(client);
                let (got_code, got_payload) = read_frame(&mut server).await.unwrap();
                assert_eq!(got_code, code);
                assert_eq!(got_payload, payload);
            }
        }
    }

    #[tokio::test]
    async fn length_hex_case_tolerance() {
        for hex in ["0000", "FFFF", "ffFF", "00a1"] {
            let mut buf = Vec::new();
            buf.extend_from_slice(b"%s");
            buf.extend_from_slice(hex.as_bytes());
            let len = u16::from_str_radix(hex, 16).unwrap() as usize;
            buf.extend(std::iter::repeat(b'x').take(len));

            let (mut client, mut server) = tokio::io::duplex(buf.len() + 16);
            client.write_all(&buf).await.unwrap();
            drop(client);
            let (code, payload) = read_frame(&mut server).await.unwrap();
            assert_eq!(code, CODE_SPEECH);
            assert_eq!(payload.len(), len);
        }
    }

    #[tokio::test]
    async fn non_hex_length_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"%sZZZZ").await.unwrap();
        drop(client);
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLength(_)));
    }

    #[tokio::test]
    async fn short_read_is_truncated_not_garbage() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"%s000").await.unwrap(); // one hex digit short
        drop(client);
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
    }

    #[tokio::test]
    async fn magic_string_accepted_and_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(MAGIC).await.unwrap();
        drop(client);
        assert!(read_magic(&mut server).await.is_ok());

        let (mut client2, mut server2) = tokio::io::duplex(64);
        client2.write_all(b"WHISPER_STREAMING_V9.9").await.unwrap();
        drop(client2);
        assert!(matches!(
            read_magic(&mut server2).await,
            Err(ProtocolError::InvalidMagic)
        ));
    }
}
