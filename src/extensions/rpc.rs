//! Request/response dispatch seam for SyncRpc sessions.
//!
//! The dispatcher consults a registry mapping topics to handlers; how the
//! registry is populated (explicit registration, code generation) is the
//! collaborator's business. Result and progress sinks are restricted to
//! SyncRpc sessions so fan-out traffic can never be confused with call
//! replies.

use crate::broker::session_table::Session;
use crate::protocol::codec::encode_command_frame;
use crate::protocol::{packets, ApplicationMessage, ControlCode, ProtocolKind, Qos};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Reserved topic carrying call replies back to the requester.
pub const RESULT_TOPIC: &str = "$call/result";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no handler registered for topic {0:?}")]
    UnknownTopic(String),
    #[error("caller is not authorized for topic {0:?}")]
    Unauthorized(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("session is not a request/response session")]
    NotSyncRpc,
    #[error("reply could not be delivered")]
    Delivery,
}

/// A registered call handler: decoded request payload in, reply bytes out.
pub type RpcHandler =
    Arc<dyn Fn(&Session, &ApplicationMessage) -> Result<Vec<u8>, RpcError> + Send + Sync>;

/// Topic → handler registry consulted by the dispatcher for SyncRpc
/// sessions.
#[derive(Default)]
pub struct RpcRegistry {
    handlers: RwLock<HashMap<String, RpcHandler>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, topic: impl Into<String>, handler: RpcHandler) {
        self.handlers.write().insert(topic.into(), handler);
    }

    pub fn unregister(&self, topic: &str) -> bool {
        self.handlers.write().remove(topic).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Dispatch a decoded request to its handler.
    pub fn dispatch(
        &self,
        session: &Session,
        request: &ApplicationMessage,
    ) -> Result<Vec<u8>, RpcError> {
        let handler = self
            .handlers
            .read()
            .get(&request.topic)
            .cloned()
            .ok_or_else(|| RpcError::UnknownTopic(request.topic.clone()))?;
        handler(session, request)
    }
}

/// Send a call result back to a SyncRpc session.
pub fn report_result(session: &Session, text: &str) -> Result<(), RpcError> {
    if session.kind != ProtocolKind::SyncRpc {
        return Err(RpcError::NotSyncRpc);
    }
    let msg = ApplicationMessage {
        topic: RESULT_TOPIC.into(),
        payload: text.as_bytes().to_vec(),
        qos: Qos::AtMostOnce,
        retain: false,
        message_id: 0,
    };
    let (flags, header, payload) =
        packets::encode_publish(&msg).map_err(|err| RpcError::Handler(err.to_string()))?;
    let frame = encode_command_frame(ControlCode::Publish, flags, &header, &payload, session.cipher())
        .map_err(|err| RpcError::Handler(err.to_string()))?;
    session.send(frame).map_err(|_| RpcError::Delivery)
}

/// Push an intermediate progress report to a SyncRpc session.
pub fn report_progress(session: &Session, key: &str, text: &str) -> Result<(), RpcError> {
    if session.kind != ProtocolKind::SyncRpc {
        return Err(RpcError::NotSyncRpc);
    }
    let mut header = Vec::with_capacity(2 + key.len());
    header.extend_from_slice(&(key.len() as u16).to_be_bytes());
    header.extend_from_slice(key.as_bytes());
    let frame = encode_command_frame(
        ControlCode::Progress,
        0,
        &header,
        text.as_bytes(),
        session.cipher(),
    )
    .map_err(|err| RpcError::Handler(err.to_string()))?;
    session.send(frame).map_err(|_| RpcError::Delivery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::session_table::{SessionSeed, SessionTable, OUTBOUND_QUEUE_DEPTH};
    use tokio::sync::mpsc;

    fn session(kind: ProtocolKind) -> (Arc<Session>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let table = SessionTable::new();
        let session = table.insert(SessionSeed {
            client_id: "caller".into(),
            username: Some("ops".into()),
            kind,
            peer: "127.0.0.1:9".parse().unwrap(),
            keep_alive: 0,
            cipher: None,
            outbound: tx,
        });
        (session, rx)
    }

    #[test]
    fn dispatch_reaches_registered_handler() {
        let registry = RpcRegistry::new();
        registry.register(
            "calc/add",
            Arc::new(|session, request| {
                assert_eq!(session.client_id, "caller");
                Ok([request.payload.as_slice(), b"!"].concat())
            }),
        );
        let (session, _rx) = session(ProtocolKind::SyncRpc);
        let request = ApplicationMessage::new("calc/add", b"1+2".to_vec());
        let reply = registry.dispatch(&session, &request).unwrap();
        assert_eq!(reply, b"1+2!");
    }

    #[test]
    fn unknown_topic_is_a_structured_failure() {
        let registry = RpcRegistry::new();
        let (session, _rx) = session(ProtocolKind::SyncRpc);
        let request = ApplicationMessage::new("nope", b"".to_vec());
        assert!(matches!(
            registry.dispatch(&session, &request),
            Err(RpcError::UnknownTopic(_))
        ));
    }

    #[test]
    fn result_sink_rejects_non_rpc_sessions() {
        let (session, _rx) = session(ProtocolKind::PubSub);
        assert!(matches!(
            report_result(&session, "done"),
            Err(RpcError::NotSyncRpc)
        ));
    }

    #[test]
    fn progress_frames_reach_the_outbound_queue() {
        let (session, mut rx) = session(ProtocolKind::SyncRpc);
        report_progress(&session, "copy", "42%").unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame[0] >> 4, ControlCode::Progress.nibble());
    }
}
