//! Client session state machine.
//!
//! One [`ClientSession`] owns one logical connection: it connects (running
//! the key exchange when enabled), authenticates, keeps the connection
//! alive, detects faults, and recovers. The fault path is single-flight: a
//! transport error from the read loop and a watchdog trip racing each other
//! start exactly one recovery, and an explicit close always wins over an
//! in-flight reconnect.

use crate::net::crypto::{ClientKeyExchange, HandshakeError, SessionCipher};
use crate::protocol::codec::{
    encode_command_frame, encode_frame, read_frame, write_frame, CodecError,
};
use crate::protocol::packets::{self, ConnAck, ConnectPacket};
use crate::protocol::{
    ApplicationMessage, ConnectRefusal, ControlCode, ProtocolKind, Qos, KEY_EXCHANGE_BYTE,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How many keep-alive intervals may pass without inbound traffic before
/// the watchdog declares a fault.
const WATCHDOG_MULTIPLIER: u32 = 3;

/// Granularity at which long sleeps poll the closed flag.
const CLOSE_POLL_STEP: Duration = Duration::from_secs(1);

/// Connection parameters. Owned by one session, immutable after connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    /// Keep-alive interval in seconds; 0 disables pings and the watchdog.
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    /// Run the key exchange and encrypt payloads for the whole session.
    pub encryption: bool,
    /// Recover automatically on faults via the built-in reconnect loop.
    pub auto_reconnect: bool,
    /// Pause between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Deadline for each connect step (dial, handshake reply, connack).
    pub connect_timeout: Duration,
    /// Session variant announced in the connect frame.
    pub kind: ProtocolKind,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("photon-{}", uuid::Uuid::new_v4().simple()),
            username: None,
            password: None,
            keep_alive_secs: 30,
            clean_session: true,
            encryption: false,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            kind: ProtocolKind::PubSub,
        }
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn keep_alive_secs(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn encryption(mut self, enabled: bool) -> Self {
        self.encryption = enabled;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn kind(mut self, kind: ProtocolKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
    Closed,
}

/// Events handed off to the owner over the session's channel.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Message(ApplicationMessage),
    Progress { key: String, text: String },
    ConnectionLost { reason: String },
    Reconnected,
    Closed,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("broker refused connection: {0}")]
    Refused(ConnectRefusal),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("not connected")]
    NotConnected,
    #[error("session closed")]
    Closed,
    #[error("timed out during {0}")]
    Timeout(&'static str),
}

/// Custom fault handler; when installed it replaces the built-in reconnect
/// loop and is fully responsible for recovery.
pub type FaultHandler = Arc<dyn Fn(ClientSession, String) + Send + Sync>;

/// Handle to a client session. Cheap to clone.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    opts: ConnectOptions,
    state: Mutex<ClientState>,
    /// Write half of the live connection; the async lock serializes sends so
    /// keep-alive pings and application publishes never interleave frames.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    cipher: Mutex<Option<Arc<SessionCipher>>>,
    next_mid: AtomicU16,
    pending: Mutex<HashMap<u16, ApplicationMessage>>,
    /// Inbound QoS2 publishes parked between pubrec and pubrel.
    inbound_release: Mutex<HashMap<u16, ApplicationMessage>>,
    /// Local bookkeeping of granted filters, used for resubscription.
    subscriptions: Mutex<BTreeSet<String>>,
    last_active: Mutex<Instant>,
    /// Single-flight guard: 0 = idle, 1 = a fault handler is running.
    fault_flight: AtomicU32,
    closed: AtomicBool,
    /// Shared lock making explicit close and fault handling mutually
    /// exclusive; close always takes precedence once observed.
    lifecycle: Mutex<()>,
    /// Connection generation; stale tasks from a previous connection bail
    /// out instead of faulting the new one.
    epoch: AtomicU64,
    events: mpsc::UnboundedSender<ClientEvent>,
    fault_handler: Mutex<Option<FaultHandler>>,
    recovery_loops: AtomicU64,
}

impl ClientSession {
    /// Create a session and the event channel it reports on.
    pub fn new(opts: ConnectOptions) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            opts,
            state: Mutex::new(ClientState::Disconnected),
            writer: tokio::sync::Mutex::new(None),
            cipher: Mutex::new(None),
            next_mid: AtomicU16::new(1),
            pending: Mutex::new(HashMap::new()),
            inbound_release: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(BTreeSet::new()),
            last_active: Mutex::new(Instant::now()),
            fault_flight: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            epoch: AtomicU64::new(0),
            events,
            fault_handler: Mutex::new(None),
            recovery_loops: AtomicU64::new(0),
        });
        (Self { inner }, events_rx)
    }

    /// Install a custom fault handler. It is invoked instead of the built-in
    /// reconnect loop and owns recovery entirely.
    pub fn set_fault_handler(&self, handler: FaultHandler) {
        *self.inner.fault_handler.lock() = Some(handler);
    }

    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    pub fn pending_publishes(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Number of recovery loops ever started; the single-flight invariant
    /// makes this observable.
    pub fn recovery_loops_started(&self) -> u64 {
        self.inner.recovery_loops.load(Ordering::SeqCst)
    }

    /// Open the transport, run the key exchange when enabled, authenticate,
    /// and start the keep-alive machinery.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        *self.inner.state.lock() = ClientState::Connecting;
        match ClientInner::connect_transport(&self.inner).await {
            Ok(()) => {
                *self.inner.state.lock() = ClientState::Connected;
                Ok(())
            }
            Err(err) => {
                *self.inner.state.lock() = ClientState::Disconnected;
                Err(err)
            }
        }
    }

    /// Publish a message. QoS above at-most-once assigns a fresh message id
    /// and records the publish until the matching ack arrives.
    pub async fn publish(&self, mut msg: ApplicationMessage) -> Result<(), ClientError> {
        self.ensure_connected()?;
        if msg.qos.needs_message_id() {
            msg.message_id = self.inner.next_message_id();
            self.inner.pending.lock().insert(msg.message_id, msg.clone());
        }
        let (flags, header, payload) =
            packets::encode_publish(&msg).map_err(|err| ClientError::Protocol(err.to_string()))?;
        let cipher = self.inner.cipher.lock().clone();
        let frame =
            encode_command_frame(ControlCode::Publish, flags, &header, &payload, cipher.as_deref())?;
        ClientInner::send_frame(&self.inner, &frame).await
    }

    /// Subscribe to topic filters. The local filter set is updated only
    /// after a successful send; filtering itself is broker-side.
    pub async fn subscribe(&self, filters: &[String]) -> Result<(), ClientError> {
        self.ensure_connected()?;
        ClientInner::send_topic_list(&self.inner, ControlCode::Subscribe, filters).await?;
        let mut set = self.inner.subscriptions.lock();
        for filter in filters {
            set.insert(filter.clone());
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, filters: &[String]) -> Result<(), ClientError> {
        self.ensure_connected()?;
        ClientInner::send_topic_list(&self.inner, ControlCode::Unsubscribe, filters).await?;
        let mut set = self.inner.subscriptions.lock();
        for filter in filters {
            set.remove(filter);
        }
        Ok(())
    }

    /// Force the fault path, as a transport error would. Useful for embedding
    /// health checks and for exercising the recovery machinery.
    pub fn force_fault(&self, reason: &str) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let inner = self.inner.clone();
        let reason = reason.to_string();
        tokio::spawn(async move {
            ClientInner::fault(&inner, epoch, reason).await;
        });
    }

    /// Close the session for good. Sets the closed flag under the lifecycle
    /// lock first, so a reconnect in progress observes closure and exits.
    pub async fn close(&self) {
        {
            let _guard = self.inner.lifecycle.lock();
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            *self.inner.state.lock() = ClientState::Closed;
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        // Best-effort goodbye; the broker removes the session on either the
        // disconnect frame or the socket close.
        let goodbye = encode_command_frame(ControlCode::Disconnect, 0, &[], &[], None).ok();
        let mut writer = self.inner.writer.lock().await;
        if let Some(mut half) = writer.take() {
            if let Some(frame) = goodbye {
                let _ = half.write_all(&frame).await;
            }
            let _ = half.shutdown().await;
        }
        drop(writer);
        let _ = self.inner.events.send(ClientEvent::Closed);
        info!("client {} closed", self.inner.opts.client_id);
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if *self.inner.state.lock() != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }
}

impl ClientInner {
    /// Message ids wrap from 65535 back to 1; id 0 is reserved for "no id".
    fn next_message_id(&self) -> u16 {
        self.next_mid
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(if current == u16::MAX { 1 } else { current + 1 })
            })
            .unwrap_or(1)
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    async fn send_frame(inner: &Arc<Self>, frame: &[u8]) -> Result<(), ClientError> {
        let epoch = inner.epoch.load(Ordering::SeqCst);
        let mut writer = inner.writer.lock().await;
        let Some(half) = writer.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        if let Err(err) = half.write_all(frame).await {
            drop(writer);
            let faulted = inner.clone();
            let reason = format!("write failed: {err}");
            tokio::spawn(async move {
                ClientInner::fault(&faulted, epoch, reason).await;
            });
            return Err(ClientError::Io(err));
        }
        Ok(())
    }

    async fn send_topic_list(
        inner: &Arc<Self>,
        code: ControlCode,
        filters: &[String],
    ) -> Result<(), ClientError> {
        if filters.is_empty() {
            return Err(ClientError::Protocol("empty filter list".into()));
        }
        let mid = inner.next_message_id();
        let (header, payload) = packets::encode_topic_list(mid, filters);
        let cipher = inner.cipher.lock().clone();
        let frame = encode_command_frame(code, 0, &header, &payload, cipher.as_deref())?;
        ClientInner::send_frame(inner, &frame).await
    }

    /// Dial, handshake, authenticate, install the connection and spawn its
    /// reader/keep-alive/watchdog tasks.
    async fn connect_transport(inner: &Arc<Self>) -> Result<(), ClientError> {
        let opts = &inner.opts;
        let addr = (opts.host.as_str(), opts.port);
        let mut stream =
            match tokio::time::timeout(opts.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => return Err(ClientError::Io(err)),
                Err(_) => return Err(ClientError::Timeout("dial")),
            };
        let _ = stream.set_nodelay(true);

        // Key exchange strictly precedes the connect frame; a failure at any
        // decrypt step aborts before application frames.
        let mut exchange = None;
        let mut cipher = None;
        if opts.encryption {
            let (kx, hello) = ClientKeyExchange::begin()?;
            let frame = encode_frame(KEY_EXCHANGE_BYTE, &[], &hello, None)?;
            write_frame(&mut stream, &frame).await?;
            let reply = read_frame(&mut stream, opts.connect_timeout).await?;
            if !reply.is_key_exchange() {
                return Err(ClientError::Protocol(format!(
                    "expected key exchange reply, got {:#04x}",
                    reply.first
                )));
            }
            let session_cipher = kx.finish(&reply.body)?;
            exchange = Some(kx);
            cipher = Some(Arc::new(session_cipher));
        }

        let connect = ConnectPacket {
            kind: opts.kind,
            client_id: opts.client_id.clone(),
            username: opts.username.clone(),
            password: opts.password.clone(),
            keep_alive: opts.keep_alive_secs,
            clean_session: opts.clean_session,
        };
        let (header, payload) = connect.encode();
        let frame = encode_command_frame(
            ControlCode::Connect,
            0,
            &header,
            &payload,
            cipher.as_deref(),
        )?;
        write_frame(&mut stream, &frame).await?;

        let ack = read_frame(&mut stream, opts.connect_timeout).await?;
        if ControlCode::from_nibble(ack.control_nibble()) != Some(ControlCode::ConnAck) {
            return Err(ClientError::Protocol(format!(
                "expected connack, got {:#04x}",
                ack.first
            )));
        }
        match ConnAck::parse(&ack.body, opts.encryption)
            .map_err(|err| ClientError::Protocol(err.to_string()))?
        {
            ConnAck::Refused(refusal) => return Err(ClientError::Refused(refusal)),
            ConnAck::Accepted { wrapped_key } => {
                if let (Some(kx), Some(cipher)) = (&exchange, &cipher) {
                    // Both sides must converge on one secret: the connack
                    // repeats the wrapped key and it has to match.
                    let wrapped = wrapped_key.ok_or_else(|| {
                        ClientError::Protocol("connack missing session key confirmation".into())
                    })?;
                    kx.confirm(cipher, &wrapped)?;
                }
            }
        }

        // Connection accepted: install state and start the machinery.
        let (reader, writer) = stream.into_split();
        let generation = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *inner.writer.lock().await = Some(writer);
        *inner.cipher.lock() = cipher;
        inner.next_mid.store(1, Ordering::SeqCst);
        inner.pending.lock().clear();
        inner.inbound_release.lock().clear();
        inner.touch();

        tokio::spawn(ClientInner::read_loop(inner.clone(), reader, generation));
        if opts.keep_alive_secs > 0 {
            tokio::spawn(ClientInner::keep_alive_loop(inner.clone(), generation));
            tokio::spawn(ClientInner::watchdog_loop(inner.clone(), generation));
        }
        debug!(
            "client {} connected to {}:{} encrypted={}",
            opts.client_id,
            opts.host,
            opts.port,
            opts.encryption
        );
        Ok(())
    }

    fn stale(&self, generation: u64) -> bool {
        self.closed.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != generation
    }

    async fn read_loop(inner: Arc<Self>, mut reader: OwnedReadHalf, generation: u64) {
        let deadline = if inner.opts.keep_alive_secs > 0 {
            Duration::from_secs(u64::from(inner.opts.keep_alive_secs) * 3 + 1)
        } else {
            Duration::from_secs(60 * 60)
        };
        loop {
            if inner.stale(generation) {
                return;
            }
            let frame = match read_frame(&mut reader, deadline).await {
                Ok(frame) => frame,
                // An idle deadline is the watchdog's call, not a fault.
                Err(CodecError::Timeout) => continue,
                Err(err) => {
                    ClientInner::fault(&inner, generation, format!("read failed: {err}")).await;
                    return;
                }
            };
            inner.touch();
            if let Err(reason) = ClientInner::handle_frame(&inner, &frame).await {
                ClientInner::fault(&inner, generation, reason).await;
                return;
            }
        }
    }

    /// Handle one inbound frame. Returns an error string when the connection
    /// must be faulted.
    async fn handle_frame(
        inner: &Arc<Self>,
        frame: &crate::protocol::RawFrame,
    ) -> Result<(), String> {
        let Some(code) = ControlCode::from_nibble(frame.control_nibble()) else {
            return Err(format!("unknown control byte {:#04x}", frame.first));
        };
        match code {
            ControlCode::Publish => {
                let msg = inner
                    .decode_publish(frame.flags(), &frame.body)
                    .map_err(|err| format!("publish decode: {err}"))?;
                match msg.qos {
                    Qos::AtMostOnce | Qos::TransferOnly => {
                        let _ = inner.events.send(ClientEvent::Message(msg));
                    }
                    Qos::AtLeastOnce => {
                        let mid = msg.message_id;
                        let _ = inner.events.send(ClientEvent::Message(msg));
                        ClientInner::send_ack(inner, ControlCode::PubAck, mid).await;
                    }
                    Qos::ExactlyOnce => {
                        let mid = msg.message_id;
                        inner.inbound_release.lock().insert(mid, msg);
                        ClientInner::send_ack(inner, ControlCode::PubRec, mid).await;
                    }
                }
            }
            ControlCode::PubRel => {
                let mid = packets::parse_message_id(&frame.body)
                    .map_err(|err| format!("pubrel decode: {err}"))?;
                if let Some(msg) = inner.inbound_release.lock().remove(&mid) {
                    let _ = inner.events.send(ClientEvent::Message(msg));
                }
                ClientInner::send_ack(inner, ControlCode::PubComp, mid).await;
            }
            ControlCode::PubAck | ControlCode::PubComp => {
                let mid = packets::parse_message_id(&frame.body)
                    .map_err(|err| format!("ack decode: {err}"))?;
                inner.pending.lock().remove(&mid);
            }
            ControlCode::PubRec => {
                let mid = packets::parse_message_id(&frame.body)
                    .map_err(|err| format!("pubrec decode: {err}"))?;
                ClientInner::send_ack(inner, ControlCode::PubRel, mid).await;
            }
            ControlCode::Ping => {
                let _ = ClientInner::send_simple(inner, ControlCode::Pong).await;
            }
            ControlCode::Pong => {}
            ControlCode::SubAck | ControlCode::UnsubAck => {
                // Grants are not individually tracked; the local filter set
                // was already updated on send.
            }
            ControlCode::Progress => match inner.decode_progress(&frame.body) {
                Ok((key, text)) => {
                    let _ = inner.events.send(ClientEvent::Progress { key, text });
                }
                Err(err) => debug!("progress frame dropped: {err}"),
            },
            ControlCode::Disconnect => {
                return Err("broker closed the session".into());
            }
            ControlCode::Connect | ControlCode::ConnAck | ControlCode::Subscribe
            | ControlCode::Unsubscribe => {
                return Err(format!("unexpected {code:?} frame from broker"));
            }
        }
        Ok(())
    }

    /// Split and decode a progress frame: clear length-prefixed key in the
    /// variable header, text payload sealed under the session cipher.
    fn decode_progress(&self, body: &[u8]) -> anyhow::Result<(String, String)> {
        if body.len() < 2 {
            anyhow::bail!("progress body too short");
        }
        let key_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        if body.len() < 2 + key_len {
            anyhow::bail!("progress key truncated");
        }
        let key = std::str::from_utf8(&body[2..2 + key_len])?.to_string();
        let sealed = &body[2 + key_len..];
        let cipher = self.cipher.lock().clone();
        let text = match cipher {
            Some(cipher) if !sealed.is_empty() => {
                let plain = cipher
                    .decrypt(sealed)
                    .map_err(|err| anyhow::anyhow!("progress payload: {err}"))?;
                String::from_utf8_lossy(&plain).into_owned()
            }
            _ => String::from_utf8_lossy(sealed).into_owned(),
        };
        Ok((key, text))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> anyhow::Result<ApplicationMessage> {
        let cipher = self.cipher.lock().clone();
        match cipher {
            Some(cipher) => {
                let payload_at = packets::publish_payload_offset(flags, body)?;
                if body.len() <= payload_at {
                    return packets::parse_publish(flags, body);
                }
                let plain = cipher
                    .decrypt(&body[payload_at..])
                    .map_err(|err| anyhow::anyhow!("publish payload: {err}"))?;
                let mut full = body[..payload_at].to_vec();
                full.extend(plain);
                packets::parse_publish(flags, &full)
            }
            None => packets::parse_publish(flags, body),
        }
    }

    async fn send_ack(inner: &Arc<Self>, code: ControlCode, mid: u16) {
        let frame = match encode_command_frame(code, 0, &packets::encode_message_id(mid), &[], None)
        {
            Ok(frame) => frame,
            Err(err) => {
                warn!("{code:?} encode failed: {err}");
                return;
            }
        };
        if let Err(err) = ClientInner::send_frame(inner, &frame).await {
            debug!("{code:?} send failed: {err}");
        }
    }

    async fn send_simple(inner: &Arc<Self>, code: ControlCode) -> Result<(), ClientError> {
        let frame = encode_command_frame(code, 0, &[], &[], None)?;
        ClientInner::send_frame(inner, &frame).await
    }

    async fn keep_alive_loop(inner: Arc<Self>, generation: u64) {
        let interval = Duration::from_secs(u64::from(inner.opts.keep_alive_secs));
        loop {
            tokio::time::sleep(interval).await;
            if inner.stale(generation) {
                return;
            }
            if let Err(err) = ClientInner::send_simple(&inner, ControlCode::Ping).await {
                debug!("keep-alive ping failed: {err}");
                return;
            }
        }
    }

    /// Watchdog independent from the ping timer: faults when inbound traffic
    /// stops for three keep-alive intervals.
    async fn watchdog_loop(inner: Arc<Self>, generation: u64) {
        let limit =
            Duration::from_secs(u64::from(inner.opts.keep_alive_secs) * u64::from(WATCHDOG_MULTIPLIER));
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if inner.stale(generation) {
                return;
            }
            let idle = inner.last_active.lock().elapsed();
            if idle > limit {
                ClientInner::fault(
                    &inner,
                    generation,
                    format!("keep-alive watchdog: {idle:?} without traffic"),
                )
                .await;
                return;
            }
        }
    }

    /// The single fault handler. Guarded by a compare-and-swap so concurrent
    /// triggers from the read path and the watchdog start exactly one
    /// recovery; stale-generation triggers are ignored outright.
    fn fault<'a>(
        inner: &'a Arc<Self>,
        generation: u64,
        reason: String,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        if inner.stale(generation) {
            return;
        }
        if inner
            .fault_flight
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        {
            let _guard = inner.lifecycle.lock();
            if inner.closed.load(Ordering::SeqCst) {
                inner.fault_flight.store(0, Ordering::SeqCst);
                return;
            }
            *inner.state.lock() = ClientState::Faulted;
            // Invalidate the rest of this connection's tasks.
            inner.epoch.fetch_add(1, Ordering::SeqCst);
        }
        warn!("client {} faulted: {reason}", inner.opts.client_id);
        let _ = inner.events.send(ClientEvent::ConnectionLost {
            reason: reason.clone(),
        });

        // Tear down the dead writer so sends fail fast during recovery.
        *inner.writer.lock().await = None;

        let handler = inner.fault_handler.lock().clone();
        if let Some(handler) = handler {
            handler(
                ClientSession {
                    inner: inner.clone(),
                },
                reason,
            );
            inner.fault_flight.store(0, Ordering::SeqCst);
            return;
        }

        if !inner.opts.auto_reconnect {
            *inner.state.lock() = ClientState::Disconnected;
            inner.fault_flight.store(0, Ordering::SeqCst);
            return;
        }

        inner.recovery_loops.fetch_add(1, Ordering::SeqCst);
        let inner = inner.clone();
        tokio::spawn(async move {
            ClientInner::reconnect_loop(&inner).await;
            inner.fault_flight.store(0, Ordering::SeqCst);
        });
        })
    }

    /// Built-in recovery: wait the configured delay (polling the closed flag
    /// every second so close interrupts promptly), then retry until
    /// connected or closed.
    async fn reconnect_loop(inner: &Arc<Self>) {
        loop {
            let mut waited = Duration::ZERO;
            while waited < inner.opts.reconnect_delay {
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                let step = CLOSE_POLL_STEP.min(inner.opts.reconnect_delay - waited);
                tokio::time::sleep(step).await;
                waited += step;
            }
            {
                let _guard = inner.lifecycle.lock();
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                *inner.state.lock() = ClientState::Connecting;
            }
            match ClientInner::connect_transport(inner).await {
                Ok(()) => {
                    *inner.state.lock() = ClientState::Connected;
                    if let Err(err) = ClientInner::resubscribe(inner).await {
                        debug!("resubscribe after reconnect failed: {err}");
                    }
                    let _ = inner.events.send(ClientEvent::Reconnected);
                    info!("client {} reconnected", inner.opts.client_id);
                    return;
                }
                Err(err) => {
                    debug!("reconnect attempt failed: {err}");
                    *inner.state.lock() = ClientState::Faulted;
                }
            }
        }
    }

    /// Replay the locally recorded filter set after a reconnect.
    async fn resubscribe(inner: &Arc<Self>) -> Result<(), ClientError> {
        let filters: Vec<String> = inner.subscriptions.lock().iter().cloned().collect();
        if filters.is_empty() {
            return Ok(());
        }
        ClientInner::send_topic_list(inner, ControlCode::Subscribe, &filters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner_for_test() -> Arc<ClientInner> {
        let (session, _rx) = ClientSession::new(ConnectOptions::new("127.0.0.1", 1));
        session.inner
    }

    #[test]
    fn message_ids_wrap_to_one_not_zero() {
        let inner = inner_for_test();
        assert_eq!(inner.next_message_id(), 1);
        assert_eq!(inner.next_message_id(), 2);

        inner.next_mid.store(u16::MAX, Ordering::SeqCst);
        assert_eq!(inner.next_message_id(), u16::MAX);
        // Wraps past zero straight to one.
        assert_eq!(inner.next_message_id(), 1);
    }

    #[test]
    fn options_builder_defaults() {
        let opts = ConnectOptions::new("broker.local", 6171)
            .client_id("c1")
            .credentials("ops", b"secret".to_vec())
            .keep_alive_secs(5)
            .encryption(true)
            .auto_reconnect(false);
        assert_eq!(opts.host, "broker.local");
        assert_eq!(opts.client_id, "c1");
        assert_eq!(opts.username.as_deref(), Some("ops"));
        assert!(opts.encryption);
        assert!(!opts.auto_reconnect);
        assert_eq!(opts.kind, ProtocolKind::PubSub);
        assert_eq!(opts.reconnect_delay, Duration::from_secs(10));
    }

    #[test]
    fn generated_client_ids_are_unique() {
        let a = ConnectOptions::new("h", 1);
        let b = ConnectOptions::new("h", 1);
        assert_ne!(a.client_id, b.client_id);
    }

    #[test]
    fn progress_decode_round_trip() {
        let inner = inner_for_test();
        let mut body = Vec::new();
        body.extend_from_slice(&(4u16).to_be_bytes());
        body.extend_from_slice(b"copy");
        body.extend_from_slice(b"42%");
        let (key, text) = inner.decode_progress(&body).unwrap();
        assert_eq!(key, "copy");
        assert_eq!(text, "42%");
        assert!(inner.decode_progress(&[0]).is_err());
    }

    #[test]
    fn progress_decode_unseals_with_session_cipher() {
        let inner = inner_for_test();
        let cipher = Arc::new(SessionCipher::generate());
        *inner.cipher.lock() = Some(cipher.clone());
        let mut body = Vec::new();
        body.extend_from_slice(&(4u16).to_be_bytes());
        body.extend_from_slice(b"copy");
        body.extend(cipher.encrypt(b"97%"));
        let (key, text) = inner.decode_progress(&body).unwrap();
        assert_eq!(key, "copy");
        assert_eq!(text, "97%");
    }

    #[tokio::test]
    async fn operations_fail_cleanly_when_disconnected() {
        let (session, _rx) = ClientSession::new(ConnectOptions::new("127.0.0.1", 1));
        let err = session
            .publish(ApplicationMessage::new("t", b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));

        session.close().await;
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Closed));
    }
}
