//! `photon publish` / `photon subscribe` - command-line client tools.

use crate::cli::args::{ConnArgs, OutputFormat, PublishArgs, SubscribeArgs};
use crate::client::{ClientEvent, ClientSession, ConnectOptions};
use crate::protocol::ApplicationMessage;
use anyhow::{bail, Context, Result};
use base64::Engine;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;

fn options(conn: &ConnArgs) -> ConnectOptions {
    let mut opts = ConnectOptions::new(conn.host.clone(), conn.port)
        .keep_alive_secs(conn.keep_alive)
        .encryption(conn.encrypt)
        // One-shot tools surface connection loss instead of retrying.
        .auto_reconnect(false);
    if let Some(id) = &conn.client_id {
        opts = opts.client_id(id.clone());
    }
    if let (Some(user), Some(pass)) = (&conn.username, &conn.password) {
        opts = opts.credentials(user.clone(), pass.as_bytes().to_vec());
    }
    opts
}

pub async fn run_publish(args: PublishArgs) -> Result<()> {
    let payload = if args.binary {
        base64::engine::general_purpose::STANDARD
            .decode(args.message.as_bytes())
            .context("decode base64 payload")?
    } else {
        args.message.into_bytes()
    };

    let (session, _events) = ClientSession::new(options(&args.conn));
    session.connect().await.context("connect")?;

    let mut msg = ApplicationMessage::new(args.topic.clone(), payload).with_qos(args.qos.to_qos());
    if args.retain {
        msg = msg.retained();
    }
    session.publish(msg).await.context("publish")?;

    // Wait for the ack handshake to drain before closing.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while session.pending_publishes() > 0 {
        if tokio::time::Instant::now() >= deadline {
            session.close().await;
            bail!("publish was not acknowledged within 10s");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    session.close().await;

    println!(
        "{}",
        serde_json::json!({ "published": args.topic, "retain": args.retain })
    );
    Ok(())
}

pub async fn run_subscribe(args: SubscribeArgs) -> Result<()> {
    let (session, events) = ClientSession::new(options(&args.conn));
    session.connect().await.context("connect")?;
    session.subscribe(&args.topic).await.context("subscribe")?;

    tokio::select! {
        result = stream_events(events, args.format) => result,
        _ = tokio::signal::ctrl_c() => {
            session.close().await;
            Ok(())
        }
    }
}

async fn stream_events(
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    format: OutputFormat,
) -> Result<()> {
    let stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Message(msg) => {
                let mut out = stdout.lock();
                match format {
                    OutputFormat::Json => {
                        let line = serde_json::json!({
                            "topic": msg.topic,
                            "qos": msg.qos.bits(),
                            "retain": msg.retain,
                            "payload": String::from_utf8_lossy(&msg.payload),
                        });
                        writeln!(out, "{line}")?;
                    }
                    OutputFormat::Raw => {
                        out.write_all(&msg.payload)?;
                        writeln!(out)?;
                    }
                }
                out.flush()?;
            }
            ClientEvent::ConnectionLost { reason } => {
                bail!("connection lost: {reason}");
            }
            ClientEvent::Closed => return Ok(()),
            ClientEvent::Progress { .. } | ClientEvent::Reconnected => {}
        }
    }
    Ok(())
}
