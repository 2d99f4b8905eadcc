//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Photon - lightweight encrypted pub/sub broker and client tools.
#[derive(Parser)]
#[command(name = "photon")]
#[command(version)]
#[command(about = "Photon pub/sub broker and client tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker
    Start(StartArgs),

    /// Subscribe to topics and stream messages to stdout
    Subscribe(SubscribeArgs),

    /// Publish a message from the command line
    Publish(PublishArgs),
}

// -----------------------------------------------------------------------------
// Start command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct StartArgs {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bind address override (defaults to the config value)
    #[arg(long)]
    pub bind: Option<String>,
}

// -----------------------------------------------------------------------------
// Subscribe/Publish commands
// -----------------------------------------------------------------------------

/// Connection arguments shared by subscribe/publish.
#[derive(Args, Clone)]
pub struct ConnArgs {
    /// Broker hostname or IP
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Broker port
    #[arg(long, default_value_t = 6171)]
    pub port: u16,

    /// Client identifier (auto-generated if not specified)
    #[arg(long)]
    pub client_id: Option<String>,

    /// User name
    #[arg(long)]
    pub username: Option<String>,

    /// Password (requires --username)
    #[arg(long, requires = "username")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[arg(long, default_value_t = 30)]
    pub keep_alive: u16,

    /// Run the encrypted handshake
    #[arg(long)]
    pub encrypt: bool,
}

/// Output format for subscribe.
#[derive(clap::ValueEnum, Clone, Default)]
pub enum OutputFormat {
    /// JSON objects, one per line
    #[default]
    Json,
    /// Raw payload only (no metadata)
    Raw,
}

/// QoS level for publishes and subscriptions.
#[derive(clap::ValueEnum, Clone, Default)]
pub enum QosLevel {
    /// At most once (fire and forget)
    Qos0,
    /// At least once (acknowledged delivery)
    #[default]
    Qos1,
    /// Exactly once (assured delivery)
    Qos2,
}

impl QosLevel {
    pub fn to_qos(&self) -> crate::protocol::Qos {
        match self {
            Self::Qos0 => crate::protocol::Qos::AtMostOnce,
            Self::Qos1 => crate::protocol::Qos::AtLeastOnce,
            Self::Qos2 => crate::protocol::Qos::ExactlyOnce,
        }
    }
}

#[derive(Args)]
pub struct SubscribeArgs {
    #[command(flatten)]
    pub conn: ConnArgs,

    /// Comma-separated list of topic filters
    #[arg(long, value_delimiter = ',', required = true)]
    pub topic: Vec<String>,

    /// Output format
    #[arg(long, value_enum, default_value = "json")]
    pub format: OutputFormat,
}

#[derive(Args)]
pub struct PublishArgs {
    #[command(flatten)]
    pub conn: ConnArgs,

    /// Topic to publish to
    #[arg(long)]
    pub topic: String,

    /// Message payload
    #[arg(long)]
    pub message: String,

    /// QoS level
    #[arg(long, value_enum, default_value = "qos1")]
    pub qos: QosLevel,

    /// Set the retain flag
    #[arg(long)]
    pub retain: bool,

    /// Decode the payload as base64 (for binary data)
    #[arg(long)]
    pub binary: bool,
}
