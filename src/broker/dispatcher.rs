//! Frame dispatch for accepted connections.
//!
//! The accept path reads the optional key-exchange frame, then the connect
//! frame, admits the session, and hands the connection to a per-session
//! read loop. Acks always precede fan-out so a publisher is never blocked
//! on downstream delivery; fan-out iterates a snapshot of the session table
//! and performs all I/O outside the table lock.

use super::session_table::{Session, SessionSeed, OUTBOUND_QUEUE_DEPTH};
use super::BrokerCore;
use crate::extensions::rpc::report_result;
use crate::extensions::transfer::is_transfer_code;
use crate::net::crypto::BrokerKeyExchange;
use crate::protocol::codec::{encode_command_frame, encode_frame, read_frame, write_frame};
use crate::protocol::packets::{self, ConnAck, ConnectPacket};
use crate::protocol::{ApplicationMessage, ControlCode, ProtocolKind, Qos, KEY_EXCHANGE_BYTE};
use anyhow::{anyhow, bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Read deadline for idle established sessions that negotiated no
/// keep-alive.
const IDLE_READ_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

/// Drive one inbound connection from accept to teardown.
pub(crate) async fn serve_connection(core: Arc<BrokerCore>, stream: TcpStream, peer: SocketAddr) {
    let (mut reader, writer) = stream.into_split();
    let connect_deadline = Duration::from_secs(core.config.connect_deadline_secs);

    let session = match admit(&core, &mut reader, writer, peer, connect_deadline).await {
        Ok(session) => session,
        Err(err) => {
            debug!("rejected connection from {peer}: {err:#}");
            return;
        }
    };

    run_session(&core, &session, &mut reader).await;

    // Teardown exactly once; the racing sweep may have won, in which case
    // removal reports not-found and the hook stays silent.
    if let Some(removed) = core.table.remove(session.id()) {
        removed.request_close();
        if removed.kind == ProtocolKind::PubSub {
            core.hooks.client_disconnected(&removed);
        }
        info!(
            "session {} ({}) from {peer} closed",
            removed.id(),
            removed.client_id
        );
    }
}

/// Run the handshake-then-connect accept sequence and admit a session.
async fn admit(
    core: &Arc<BrokerCore>,
    reader: &mut OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    peer: SocketAddr,
    deadline: Duration,
) -> Result<Arc<Session>> {
    let mut frame = read_frame(reader, deadline)
        .await
        .context("first frame")?;

    // Optional key exchange precedes connect. A failed decrypt aborts here,
    // before any application frame is processed.
    let mut exchange = None;
    if frame.is_key_exchange() {
        let (broker_exchange, reply) =
            BrokerKeyExchange::accept(&frame.body).context("key exchange")?;
        let reply_frame = encode_frame(KEY_EXCHANGE_BYTE, &[], &reply, None)?;
        write_frame(&mut writer, &reply_frame)
            .await
            .context("key exchange reply")?;
        exchange = Some(broker_exchange);
        frame = read_frame(reader, deadline)
            .await
            .context("connect after key exchange")?;
    }

    if ControlCode::from_nibble(frame.control_nibble()) != Some(ControlCode::Connect) {
        bail!("expected connect frame, got {:#04x}", frame.first);
    }
    let (kind, flags, keep_alive, payload_at) = ConnectPacket::parse_header(&frame.body)?;
    let payload = match &exchange {
        Some(ex) if frame.body.len() > payload_at => ex
            .cipher()
            .decrypt(&frame.body[payload_at..])
            .map_err(|err| anyhow!("connect payload: {err}"))?,
        _ => frame.body[payload_at..].to_vec(),
    };
    let connect = ConnectPacket::parse_payload(kind, flags, keep_alive, &payload)?;

    // Optional verification callback: a non-zero code refuses the session.
    if let Some(guard) = &core.guard {
        if let Some(refusal) = guard(&connect) {
            let body = ConnAck::Refused(refusal).encode();
            let frame = encode_command_frame(ControlCode::ConnAck, 0, &body, &[], None)?;
            let _ = write_frame(&mut writer, &frame).await;
            bail!("connect refused: {refusal}");
        }
    }

    // The connack for an encrypted session repeats the RSA-wrapped key so
    // both sides converge on one secret. Built before the exchange is
    // consumed for its cipher.
    let wrapped_key = exchange
        .as_ref()
        .map(BrokerKeyExchange::wrapped_session_key)
        .transpose()
        .map_err(|err| anyhow!("wrap session key: {err}"))?;
    let cipher = exchange.map(BrokerKeyExchange::into_cipher);

    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    spawn_writer(writer, outbound_rx);

    let session = core.table.insert(SessionSeed {
        client_id: connect.client_id.clone(),
        username: connect.username.clone(),
        kind,
        peer,
        keep_alive: connect.keep_alive,
        cipher,
        outbound,
    });

    let ack_body = ConnAck::Accepted { wrapped_key }.encode();
    let ack = encode_command_frame(ControlCode::ConnAck, 0, &ack_body, &[], None)?;
    if let Err(err) = session.send(ack) {
        core.table.remove(session.id());
        bail!("connack send: {err}");
    }

    if kind == ProtocolKind::PubSub {
        core.hooks.client_connected(&session);
    }
    info!(
        "session {} accepted: client={} kind={kind:?} peer={peer} encrypted={}",
        session.id(),
        connect.client_id,
        session.cipher().is_some()
    );
    Ok(session)
}

/// Serialized writer: one send in flight per connection. An empty frame is
/// the close sentinel.
fn spawn_writer(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if frame.is_empty() {
                break;
            }
            if let Err(err) = writer.write_all(&frame).await {
                debug!("session write failed: {err}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
}

/// Per-session read loop. Any read failure or protocol violation ends the
/// loop; the caller performs the idempotent teardown.
async fn run_session(core: &Arc<BrokerCore>, session: &Arc<Session>, reader: &mut OwnedReadHalf) {
    let deadline = if session.keep_alive() > 0 {
        // Mirror of the client-side watchdog: three missed intervals.
        Duration::from_secs(u64::from(session.keep_alive()) * 3)
    } else {
        IDLE_READ_DEADLINE
    };

    loop {
        let frame = match read_frame(reader, deadline).await {
            Ok(frame) => frame,
            Err(err) => {
                debug!("session {} read ended: {err}", session.id());
                return;
            }
        };
        session.touch();

        // Transfer sessions own the raw command space; their frames bypass
        // the control-code dispatch entirely.
        if session.kind == ProtocolKind::FileTransfer && is_transfer_code(frame.first) {
            match &core.transfer {
                Some(handler) => handler.handle_frame(session, frame.first, &frame.body),
                None => debug!(
                    "transfer frame {:#04x} dropped: no transfer collaborator installed",
                    frame.first
                ),
            }
            continue;
        }

        let Some(code) = ControlCode::from_nibble(frame.control_nibble()) else {
            warn!(
                "session {} sent unknown control byte {:#04x}; closing",
                session.id(),
                frame.first
            );
            return;
        };

        let handled = match code {
            ControlCode::Publish => handle_publish(core, session, frame.flags(), &frame.body),
            ControlCode::PubRel => handle_release(core, session, &frame.body),
            ControlCode::Subscribe => handle_subscribe(core, session, &frame.body),
            ControlCode::Unsubscribe => handle_unsubscribe(session, &frame.body),
            ControlCode::Ping => send_empty(session, ControlCode::Pong),
            // Subscriber-side QoS2 delivery: complete the handshake.
            ControlCode::PubRec => packets::parse_message_id(&frame.body)
                .and_then(|mid| send_ack(session, ControlCode::PubRel, mid)),
            // Delivery confirmations the broker keeps no bookkeeping for.
            ControlCode::PubAck | ControlCode::PubComp | ControlCode::Pong => Ok(()),
            ControlCode::Progress => Ok(()),
            ControlCode::Disconnect => {
                debug!("session {} disconnected cleanly", session.id());
                return;
            }
            ControlCode::Connect
            | ControlCode::ConnAck
            | ControlCode::SubAck
            | ControlCode::UnsubAck => Err(anyhow!("unexpected {code:?} frame on live session")),
        };

        if let Err(err) = handled {
            warn!(
                "session {} protocol violation ({code:?}): {err:#}; closing",
                session.id()
            );
            return;
        }
    }
}

fn handle_publish(
    core: &Arc<BrokerCore>,
    session: &Arc<Session>,
    flags: u8,
    body: &[u8],
) -> Result<()> {
    let msg = decode_publish(session, flags, body)?;
    match msg.qos {
        Qos::AtMostOnce => deliver(core, session, msg),
        Qos::AtLeastOnce => {
            // Exactly one ack, sent before fan-out is attempted.
            send_ack(session, ControlCode::PubAck, msg.message_id)?;
            deliver(core, session, msg)
        }
        Qos::ExactlyOnce => {
            // Receipt ack now; the publish is parked until the release
            // frame arrives.
            send_ack(session, ControlCode::PubRec, msg.message_id)?;
            session.park_release(msg);
            Ok(())
        }
        Qos::TransferOnly => {
            // Deliver to the owning collaborator, never re-publish.
            match session.kind {
                ProtocolKind::SyncRpc => dispatch_rpc(core, session, &msg),
                _ => {
                    debug!(
                        "transfer-only publish on {:?} session {} dropped",
                        session.kind,
                        session.id()
                    );
                }
            }
            Ok(())
        }
    }
}

fn handle_release(core: &Arc<BrokerCore>, session: &Arc<Session>, body: &[u8]) -> Result<()> {
    let mid = packets::parse_message_id(body)?;
    // Completion ack precedes fan-out, like the receipt ack did.
    send_ack(session, ControlCode::PubComp, mid)?;
    if let Some(msg) = session.take_release(mid) {
        deliver(core, session, msg)?;
    }
    Ok(())
}

/// Route an accepted publish: SyncRpc sessions dispatch through the call
/// registry; PubSub publishes fan out and then update retention.
fn deliver(core: &Arc<BrokerCore>, session: &Arc<Session>, msg: ApplicationMessage) -> Result<()> {
    if session.kind == ProtocolKind::SyncRpc {
        dispatch_rpc(core, session, &msg);
        return Ok(());
    }
    fan_out(core, session, &msg);
    if msg.retain {
        // Fan-out used the pre-publish snapshot; future subscribers replay
        // the new value.
        core.retained.store(&msg);
    }
    Ok(())
}

fn dispatch_rpc(core: &Arc<BrokerCore>, session: &Arc<Session>, msg: &ApplicationMessage) {
    let outcome = match core.rpc.dispatch(session, msg) {
        Ok(reply) => String::from_utf8_lossy(&reply).into_owned(),
        Err(err) => {
            // Application-level failure: report it, keep the session open.
            debug!(
                "rpc dispatch failed for {} on {:?}: {err}",
                session.client_id, msg.topic
            );
            format!("error: {err}")
        }
    };
    if let Err(err) = report_result(session, &outcome) {
        warn!("rpc reply to session {} failed: {err}", session.id());
    }
}

/// Fan a publish out to every matching PubSub session. The table lock is
/// held only for the snapshot; each destination gets its own encoding under
/// its own cipher, and one failed send never aborts delivery to the rest.
fn fan_out(core: &Arc<BrokerCore>, publisher: &Arc<Session>, msg: &ApplicationMessage) {
    let snapshot = core.table.snapshot();
    let wildcards = core.config.wildcard_subscriptions;
    debug!(
        "fan-out {:?} from session {} across {} sessions",
        msg.topic,
        publisher.id(),
        snapshot.len()
    );
    for dest in snapshot {
        if dest.kind != ProtocolKind::PubSub {
            continue;
        }
        if !dest.subscribed_to(&msg.topic, wildcards) {
            continue;
        }
        match encode_publish_for(msg, &dest) {
            Ok(frame) => {
                if let Err(err) = dest.send(frame) {
                    warn!(
                        "fan-out to {} ({}) failed: {err}",
                        dest.id(),
                        dest.client_id
                    );
                }
            }
            Err(err) => warn!("fan-out encode for {} failed: {err}", dest.id()),
        }
    }
}

fn handle_subscribe(core: &Arc<BrokerCore>, session: &Arc<Session>, body: &[u8]) -> Result<()> {
    let mid = packets::parse_message_id(body)?;
    let filters = decode_topic_list(session, body)?;

    let mut grants = Vec::with_capacity(filters.len());
    let mut granted = Vec::new();
    for filter in &filters {
        if super::topics::valid_filter(filter) {
            grants.push(0x00);
            granted.push(filter.clone());
        } else {
            grants.push(0x80);
        }
    }
    session.add_filters(&granted);

    let header = packets::encode_message_id(mid);
    let frame = encode_command_frame(ControlCode::SubAck, 0, &header, &grants, session.cipher())?;
    session
        .send(frame)
        .map_err(|err| anyhow!("suback send: {err}"))?;

    // Retained replay happens after the grant so a subscriber always sees
    // its suback before the first replayed message.
    if core.config.retained_replay && !granted.is_empty() {
        let replay = core
            .retained
            .matching(&granted, core.config.wildcard_subscriptions);
        for msg in replay {
            match encode_publish_for(&msg, session) {
                Ok(frame) => {
                    if let Err(err) = session.send(frame) {
                        warn!("retained replay to {} failed: {err}", session.id());
                        break;
                    }
                }
                Err(err) => warn!("retained replay encode failed: {err}"),
            }
        }
    }
    Ok(())
}

fn handle_unsubscribe(session: &Arc<Session>, body: &[u8]) -> Result<()> {
    let mid = packets::parse_message_id(body)?;
    let filters = decode_topic_list(session, body)?;
    session.remove_filters(&filters);
    let header = packets::encode_message_id(mid);
    let frame = encode_command_frame(ControlCode::UnsubAck, 0, &header, &[], None)?;
    session
        .send(frame)
        .map_err(|err| anyhow!("unsuback send: {err}"))
}

/// Decrypt (when the session negotiated a cipher) and parse a publish body.
fn decode_publish(session: &Session, flags: u8, body: &[u8]) -> Result<ApplicationMessage> {
    match session.cipher() {
        Some(cipher) => {
            let payload_at = packets::publish_payload_offset(flags, body)?;
            if body.len() <= payload_at {
                return packets::parse_publish(flags, body);
            }
            let plain = cipher
                .decrypt(&body[payload_at..])
                .map_err(|err| anyhow!("publish payload: {err}"))?;
            let mut full = body[..payload_at].to_vec();
            full.extend(plain);
            packets::parse_publish(flags, &full)
        }
        None => packets::parse_publish(flags, body),
    }
}

/// Decrypt and parse the filter list of a subscribe/unsubscribe body (the
/// two-byte message id travels in the clear).
fn decode_topic_list(session: &Session, body: &[u8]) -> Result<Vec<String>> {
    if body.len() < 2 {
        bail!("topic list body too short");
    }
    let payload = &body[2..];
    match session.cipher() {
        Some(cipher) if !payload.is_empty() => {
            let plain = cipher
                .decrypt(payload)
                .map_err(|err| anyhow!("topic list payload: {err}"))?;
            packets::parse_topic_list(&plain)
        }
        _ => packets::parse_topic_list(payload),
    }
}

fn send_ack(session: &Session, code: ControlCode, mid: u16) -> Result<()> {
    let frame = encode_command_frame(code, 0, &packets::encode_message_id(mid), &[], None)?;
    session
        .send(frame)
        .map_err(|err| anyhow!("{code:?} send: {err}"))
}

fn send_empty(session: &Session, code: ControlCode) -> Result<()> {
    let frame = encode_command_frame(code, 0, &[], &[], None)?;
    session
        .send(frame)
        .map_err(|err| anyhow!("{code:?} send: {err}"))
}

/// Encode a publish for one destination under that destination's cipher.
fn encode_publish_for(msg: &ApplicationMessage, dest: &Session) -> Result<Vec<u8>> {
    let (flags, header, payload) = packets::encode_publish(msg)?;
    Ok(encode_command_frame(
        ControlCode::Publish,
        flags,
        &header,
        &payload,
        dest.cipher(),
    )?)
}
