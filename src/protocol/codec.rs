//! Frame encoding and decoding.
//!
//! A frame is a single control byte (command nibble + flag nibble), a
//! variable-length remaining-length field (1-4 bytes, 7 data bits per byte
//! with a continuation bit), and exactly that many body bytes. The body is
//! the command's variable header followed by its payload; when a session
//! cipher is established the payload portion is encrypted *before* the
//! remaining length is computed, so the length always describes the bytes
//! actually on the wire.
//!
//! Decoding never inspects encryption state. Callers decrypt the payload
//! once the owning session's cipher is known; the key-exchange frame is by
//! construction never encrypted.

use crate::net::crypto::SessionCipher;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

/// Largest value the 4-byte remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame body of {0} bytes exceeds the remaining-length maximum")]
    LengthExceeded(usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("timed out before the declared frame length was satisfied")]
    Timeout,
}

/// A frame as read off the wire: the raw first byte and the undecrypted body.
///
/// The first byte is kept raw rather than pre-split so that the 0xFF
/// key-exchange discriminator and file-transfer command bytes survive intact;
/// splitting into nibble + flags is the dispatcher's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub first: u8,
    pub body: Vec<u8>,
}

impl RawFrame {
    pub fn control_nibble(&self) -> u8 {
        self.first >> 4
    }

    pub fn flags(&self) -> u8 {
        self.first & 0x0F
    }

    pub fn is_key_exchange(&self) -> bool {
        self.first == super::KEY_EXCHANGE_BYTE
    }
}

/// Encode the remaining-length field (1-4 bytes, continuation bit high).
pub fn encode_remaining_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(2);
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out
}

/// Encode a complete frame. If a cipher is supplied the payload is encrypted
/// before the remaining length is computed. Fails only when the combined body
/// exceeds [`MAX_REMAINING_LENGTH`].
pub fn encode_frame(
    first_byte: u8,
    variable_header: &[u8],
    payload: &[u8],
    cipher: Option<&SessionCipher>,
) -> Result<Vec<u8>, CodecError> {
    let sealed;
    let payload = match cipher {
        Some(cipher) if !payload.is_empty() => {
            sealed = cipher.encrypt(payload);
            sealed.as_slice()
        }
        _ => payload,
    };
    let body_len = variable_header.len() + payload.len();
    if body_len > MAX_REMAINING_LENGTH {
        return Err(CodecError::LengthExceeded(body_len));
    }
    let mut frame = Vec::with_capacity(1 + 4 + body_len);
    frame.push(first_byte);
    frame.extend(encode_remaining_length(body_len));
    frame.extend_from_slice(variable_header);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Convenience for nibble-packed commands.
pub fn encode_command_frame(
    code: super::ControlCode,
    flags: u8,
    variable_header: &[u8],
    payload: &[u8],
    cipher: Option<&SessionCipher>,
) -> Result<Vec<u8>, CodecError> {
    encode_frame(
        (code.nibble() << 4) | (flags & 0x0F),
        variable_header,
        payload,
        cipher,
    )
}

/// Read one frame, enforcing `deadline` across the whole read.
///
/// Fails with [`CodecError::Malformed`] when the first byte cannot be
/// produced (peer closed or reset the stream), and with
/// [`CodecError::Timeout`] when the deadline elapses before the declared
/// length is satisfied.
pub async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
    deadline: Duration,
) -> Result<RawFrame, CodecError> {
    let deadline = Instant::now() + deadline;

    let mut first = [0u8; 1];
    match timeout_at(deadline, stream.read_exact(&mut first)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            return Err(CodecError::Malformed(format!(
                "stream ended before frame start: {err}"
            )))
        }
        Err(_) => return Err(CodecError::Timeout),
    }

    let remaining = read_remaining_length(stream, deadline).await?;
    let mut body = vec![0u8; remaining];
    match timeout_at(deadline, stream.read_exact(&mut body)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            return Err(CodecError::Malformed(format!(
                "stream ended {remaining}-byte body short: {err}"
            )))
        }
        Err(_) => return Err(CodecError::Timeout),
    }

    Ok(RawFrame {
        first: first[0],
        body,
    })
}

/// Write a pre-encoded frame and flush it.
pub async fn write_frame<S: AsyncWriteExt + Unpin>(
    stream: &mut S,
    frame: &[u8],
) -> std::io::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await
}

async fn read_remaining_length<S: AsyncRead + Unpin>(
    stream: &mut S,
    deadline: Instant,
) -> Result<usize, CodecError> {
    let mut multiplier: usize = 1;
    let mut value: usize = 0;
    for index in 0.. {
        let mut buf = [0u8; 1];
        match timeout_at(deadline, stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                return Err(CodecError::Malformed(format!(
                    "stream ended inside length field: {err}"
                )))
            }
            Err(_) => return Err(CodecError::Timeout),
        }
        let byte = buf[0];
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        if index == 3 {
            return Err(CodecError::Malformed(
                "length field continues past 4 bytes".into(),
            ));
        }
        multiplier *= 128;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlCode;
    use std::io::Cursor;

    fn decode_len(bytes: &[u8]) -> usize {
        let mut value = 0usize;
        let mut multiplier = 1usize;
        for byte in bytes {
            value += (byte & 0x7F) as usize * multiplier;
            if byte & 0x80 == 0 {
                break;
            }
            multiplier *= 128;
        }
        value
    }

    #[test]
    fn remaining_length_round_trips_at_boundaries() {
        for len in [
            0usize, 1, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, 268_435_455,
        ] {
            let encoded = encode_remaining_length(len);
            assert!(encoded.len() <= 4, "len {len} used {} bytes", encoded.len());
            assert_eq!(decode_len(&encoded), len);
        }
        assert_eq!(encode_remaining_length(0), vec![0]);
        assert_eq!(encode_remaining_length(128), vec![0x80, 0x01]);
    }

    #[test]
    fn oversized_body_fails_to_encode() {
        // One past the 4-byte maximum must be rejected before the frame is
        // assembled.
        let header = vec![0u8; MAX_REMAINING_LENGTH + 1];
        let err = encode_frame(0x30, &header, &[], None).unwrap_err();
        assert!(matches!(err, CodecError::LengthExceeded(len) if len == MAX_REMAINING_LENGTH + 1));
    }

    #[tokio::test]
    async fn frame_round_trips_through_reader() {
        let frame =
            encode_command_frame(ControlCode::Publish, 0b0011, b"header", b"payload", None)
                .unwrap();
        let mut cursor = Cursor::new(frame);
        let raw = read_frame(&mut cursor, Duration::from_secs(1)).await.unwrap();
        assert_eq!(raw.control_nibble(), ControlCode::Publish.nibble());
        assert_eq!(raw.flags(), 0b0011);
        assert_eq!(raw.body, b"headerpayload");
    }

    #[tokio::test]
    async fn truncated_stream_is_malformed() {
        // Declares 10 body bytes but provides 3; the cursor hits EOF, which is
        // a malformed frame rather than a timeout.
        let mut cursor = Cursor::new(vec![0x30, 10, 1, 2, 3]);
        let err = read_frame(&mut cursor, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[tokio::test]
    async fn empty_stream_is_malformed() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = read_frame(&mut cursor, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[tokio::test]
    async fn stalled_stream_times_out() {
        // A duplex pipe that never completes the declared body.
        let (mut rx, mut tx) = tokio::io::duplex(64);
        tx.write_all(&[0x30, 10, 1, 2]).await.unwrap();
        let err = read_frame(&mut rx, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::Timeout));
    }

    #[tokio::test]
    async fn runaway_length_field_is_malformed() {
        let mut cursor = Cursor::new(vec![0x30, 0x80, 0x80, 0x80, 0x80, 0x01]);
        let err = read_frame(&mut cursor, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn encrypted_payload_is_counted_after_encryption() {
        let cipher = SessionCipher::new([7u8; 32]);
        let frame = encode_command_frame(ControlCode::Publish, 0, b"hh", b"secret", Some(&cipher))
            .unwrap();
        // Body length must match the sealed payload, not the plaintext.
        let declared = decode_len(&frame[1..]);
        assert!(declared > 2 + "secret".len());
        let sealed = &frame[frame.len() - (declared - 2)..];
        assert_eq!(cipher.decrypt(sealed).unwrap(), b"secret");
    }
}
