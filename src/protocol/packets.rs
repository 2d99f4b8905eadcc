//! Per-command packet formats.
//!
//! Cursor-based parsing over the decoded (and, where applicable, decrypted)
//! frame body, plus the matching encoders. Variable headers travel in the
//! clear; payload bytes are what the session cipher seals.

use super::{ApplicationMessage, ConnectRefusal, ProtocolKind, Qos, PROTOCOL_LEVEL};
use anyhow::{anyhow, bail, Context, Result};

pub const FLAG_USERNAME: u8 = 0x80;
pub const FLAG_PASSWORD: u8 = 0x40;
pub const FLAG_CLEAN_SESSION: u8 = 0x02;

/// Decoded connect frame.
#[derive(Debug, Clone)]
pub struct ConnectPacket {
    pub kind: ProtocolKind,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub keep_alive: u16,
    pub clean_session: bool,
}

impl ConnectPacket {
    /// Encode into (variable header, payload). The payload half is what gets
    /// encrypted once a session cipher is established.
    pub fn encode(&self) -> (Vec<u8>, Vec<u8>) {
        let token = self.kind.token();
        let mut header = Vec::with_capacity(2 + token.len() + 4);
        header.extend_from_slice(&(token.len() as u16).to_be_bytes());
        header.extend_from_slice(token.as_bytes());
        header.push(PROTOCOL_LEVEL);
        let mut flags = 0u8;
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        header.push(flags);
        header.extend_from_slice(&self.keep_alive.to_be_bytes());

        let mut payload = Vec::new();
        write_string(&mut payload, &self.client_id);
        if let Some(user) = &self.username {
            write_string(&mut payload, user);
        }
        if let Some(pass) = &self.password {
            write_binary(&mut payload, pass);
        }
        (header, payload)
    }

    /// Parse the clear variable header, returning the connect flags and the
    /// offset where the (possibly encrypted) payload begins.
    pub fn parse_header(body: &[u8]) -> Result<(ProtocolKind, u8, u16, usize)> {
        let mut cursor = 0usize;
        let token = read_string(body, &mut cursor)?;
        let kind = ProtocolKind::from_token(&token)
            .ok_or_else(|| anyhow!("unknown protocol token {token:?}"))?;
        let level = read_u8(body, &mut cursor)?;
        if level != PROTOCOL_LEVEL {
            bail!("unsupported protocol level {level}");
        }
        let flags = read_u8(body, &mut cursor)?;
        let keep_alive = read_u16(body, &mut cursor)?;
        Ok((kind, flags, keep_alive, cursor))
    }

    /// Parse the payload half given the already-parsed header fields.
    pub fn parse_payload(
        kind: ProtocolKind,
        flags: u8,
        keep_alive: u16,
        payload: &[u8],
    ) -> Result<Self> {
        let mut cursor = 0usize;
        let client_id = read_string(payload, &mut cursor)?;
        let username = if flags & FLAG_USERNAME != 0 {
            Some(read_string(payload, &mut cursor)?)
        } else {
            None
        };
        let password = if flags & FLAG_PASSWORD != 0 {
            Some(read_binary(payload, &mut cursor)?)
        } else {
            None
        };
        Ok(Self {
            kind,
            client_id,
            username,
            password,
            keep_alive,
            clean_session: flags & FLAG_CLEAN_SESSION != 0,
        })
    }
}

/// Connack outcome: accepted (optionally carrying the wrapped session key) or
/// refused with a fixed-table code.
#[derive(Debug, Clone)]
pub enum ConnAck {
    Accepted { wrapped_key: Option<Vec<u8>> },
    Refused(ConnectRefusal),
}

impl ConnAck {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            // When encryption was negotiated the payload carries the
            // RSA-wrapped session key instead of the reserved/result pair.
            Self::Accepted {
                wrapped_key: Some(key),
            } => key.clone(),
            Self::Accepted { wrapped_key: None } => vec![0, 0],
            Self::Refused(refusal) => vec![0, refusal.code()],
        }
    }

    pub fn parse(body: &[u8], encrypted: bool) -> Result<Self> {
        if encrypted && body.len() != 2 {
            return Ok(Self::Accepted {
                wrapped_key: Some(body.to_vec()),
            });
        }
        if body.len() < 2 {
            bail!("connack body too short");
        }
        match body[1] {
            0 => Ok(Self::Accepted { wrapped_key: None }),
            code => ConnectRefusal::from_code(code)
                .map(Self::Refused)
                .ok_or_else(|| anyhow!("unknown connack result code {code}")),
        }
    }
}

/// Encode a publish into (flags, variable header, payload).
pub fn encode_publish(msg: &ApplicationMessage) -> Result<(u8, Vec<u8>, Vec<u8>)> {
    let mut flags = msg.qos.bits() << 1;
    if msg.retain {
        flags |= 0x01;
    }
    let mut header = Vec::with_capacity(2 + msg.topic.len() + 2);
    write_string(&mut header, &msg.topic);
    if msg.qos.needs_message_id() {
        if msg.message_id == 0 {
            bail!("message id required for qos {:?}", msg.qos);
        }
        header.extend_from_slice(&msg.message_id.to_be_bytes());
    }
    Ok((flags, header, msg.payload.clone()))
}

/// Parse a publish body (already decrypted) using the frame flag nibble.
pub fn parse_publish(flags: u8, body: &[u8]) -> Result<ApplicationMessage> {
    let retain = flags & 0x01 != 0;
    let qos = Qos::from_bits((flags >> 1) & 0x03)
        .ok_or_else(|| anyhow!("invalid qos bits in publish flags {flags:#04x}"))?;
    let mut cursor = 0usize;
    let topic = read_string(body, &mut cursor)?;
    let message_id = if qos.needs_message_id() {
        read_u16(body, &mut cursor)?
    } else {
        0
    };
    Ok(ApplicationMessage {
        topic,
        payload: body[cursor..].to_vec(),
        qos,
        retain,
        message_id,
    })
}

/// Publish flags nibble split helper: the payload of a publish frame starts
/// after the topic (and message id for qos > 0) in the clear header.
pub fn publish_payload_offset(flags: u8, body: &[u8]) -> Result<usize> {
    let qos = Qos::from_bits((flags >> 1) & 0x03)
        .ok_or_else(|| anyhow!("invalid qos bits in publish flags {flags:#04x}"))?;
    let mut cursor = 0usize;
    let _ = read_string(body, &mut cursor)?;
    if qos.needs_message_id() {
        let _ = read_u16(body, &mut cursor)?;
    }
    Ok(cursor)
}

/// Encode a subscribe/unsubscribe body: message id header, filter payload.
pub fn encode_topic_list(message_id: u16, filters: &[String]) -> (Vec<u8>, Vec<u8>) {
    let header = message_id.to_be_bytes().to_vec();
    let mut payload = Vec::new();
    for filter in filters {
        write_string(&mut payload, filter);
    }
    (header, payload)
}

/// Parse a subscribe/unsubscribe filter payload.
pub fn parse_topic_list(payload: &[u8]) -> Result<Vec<String>> {
    let mut cursor = 0usize;
    let mut filters = Vec::new();
    while cursor < payload.len() {
        filters.push(read_string(payload, &mut cursor)?);
    }
    if filters.is_empty() {
        bail!("empty topic filter list");
    }
    Ok(filters)
}

/// Encode a suback: message id followed by one grant byte per filter.
pub fn encode_suback(message_id: u16, grants: &[u8]) -> Vec<u8> {
    let mut body = message_id.to_be_bytes().to_vec();
    body.extend_from_slice(grants);
    body
}

/// Parse the two-byte message id carried by the ack family.
pub fn parse_message_id(body: &[u8]) -> Result<u16> {
    let mut cursor = 0usize;
    read_u16(body, &mut cursor)
}

pub fn encode_message_id(message_id: u16) -> Vec<u8> {
    message_id.to_be_bytes().to_vec()
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn write_binary(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
}

fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8> {
    if *cursor >= buf.len() {
        bail!("unexpected end of buffer");
    }
    let v = buf[*cursor];
    *cursor += 1;
    Ok(v)
}

fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16> {
    if *cursor + 1 >= buf.len() {
        bail!("unexpected end of buffer");
    }
    let v = u16::from_be_bytes([buf[*cursor], buf[*cursor + 1]]);
    *cursor += 2;
    Ok(v)
}

fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String> {
    let len = read_u16(buf, cursor)? as usize;
    if *cursor + len > buf.len() {
        bail!("unexpected end of buffer");
    }
    let s = std::str::from_utf8(&buf[*cursor..*cursor + len])
        .context("invalid utf8 in protocol string")?
        .to_string();
    *cursor += len;
    Ok(s)
}

fn read_binary(buf: &[u8], cursor: &mut usize) -> Result<Vec<u8>> {
    let len = read_u16(buf, cursor)? as usize;
    if *cursor + len > buf.len() {
        bail!("unexpected end of buffer");
    }
    let bytes = buf[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_round_trips_with_credentials() {
        let packet = ConnectPacket {
            kind: ProtocolKind::PubSub,
            client_id: "sensor-7".into(),
            username: Some("ops".into()),
            password: Some(b"hunter2".to_vec()),
            keep_alive: 30,
            clean_session: true,
        };
        let (header, payload) = packet.encode();
        let mut body = header.clone();
        body.extend_from_slice(&payload);
        let (kind, flags, keep_alive, offset) = ConnectPacket::parse_header(&body).unwrap();
        assert_eq!(kind, ProtocolKind::PubSub);
        assert_eq!(keep_alive, 30);
        assert_eq!(offset, header.len());
        let parsed = ConnectPacket::parse_payload(kind, flags, keep_alive, &body[offset..]).unwrap();
        assert_eq!(parsed.client_id, "sensor-7");
        assert_eq!(parsed.username.as_deref(), Some("ops"));
        assert_eq!(parsed.password.as_deref(), Some(b"hunter2".as_slice()));
        assert!(parsed.clean_session);
    }

    #[test]
    fn connect_rejects_wrong_level() {
        let packet = ConnectPacket {
            kind: ProtocolKind::SyncRpc,
            client_id: "c".into(),
            username: None,
            password: None,
            keep_alive: 0,
            clean_session: false,
        };
        let (mut header, _) = packet.encode();
        let level_at = 2 + ProtocolKind::SyncRpc.token().len();
        header[level_at] = PROTOCOL_LEVEL + 1;
        assert!(ConnectPacket::parse_header(&header).is_err());
    }

    #[test]
    fn publish_round_trips_at_each_qos() {
        for (qos, mid) in [
            (Qos::AtMostOnce, 0u16),
            (Qos::AtLeastOnce, 7),
            (Qos::ExactlyOnce, 8),
            (Qos::TransferOnly, 9),
        ] {
            let msg = ApplicationMessage {
                topic: "a/b".into(),
                payload: b"x".to_vec(),
                qos,
                retain: qos == Qos::AtLeastOnce,
                message_id: mid,
            };
            let (flags, header, payload) = encode_publish(&msg).unwrap();
            let mut body = header;
            body.extend_from_slice(&payload);
            let parsed = parse_publish(flags, &body).unwrap();
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn publish_requires_id_above_qos0() {
        let msg = ApplicationMessage::new("a", b"x".to_vec()).with_qos(Qos::AtLeastOnce);
        assert!(encode_publish(&msg).is_err());
    }

    #[test]
    fn topic_list_round_trips() {
        let filters = vec!["a/+".to_string(), "b/#".to_string()];
        let (header, payload) = encode_topic_list(3, &filters);
        assert_eq!(parse_message_id(&header).unwrap(), 3);
        assert_eq!(parse_topic_list(&payload).unwrap(), filters);
        assert!(parse_topic_list(&[]).is_err());
    }

    #[test]
    fn connack_refusal_round_trips() {
        let ack = ConnAck::Refused(ConnectRefusal::BadCredentials);
        let parsed = ConnAck::parse(&ack.encode(), false).unwrap();
        assert!(matches!(
            parsed,
            ConnAck::Refused(ConnectRefusal::BadCredentials)
        ));
    }

    #[test]
    fn encrypted_connack_carries_key_blob() {
        let blob = vec![9u8; 256];
        let ack = ConnAck::Accepted {
            wrapped_key: Some(blob.clone()),
        };
        match ConnAck::parse(&ack.encode(), true).unwrap() {
            ConnAck::Accepted { wrapped_key } => assert_eq!(wrapped_key.unwrap(), blob),
            ConnAck::Refused(_) => panic!("expected accept"),
        }
    }
}
