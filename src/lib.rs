#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]

//! Photon - lightweight encrypted pub/sub messaging stack.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//!
//! ## Protocol
//! - `protocol::codec` - Frame encoding/decoding
//! - `protocol::packets` - Per-command packet formats
//!
//! ## Networking
//! - `net::crypto` - Session cipher and key-exchange handshake
//!
//! ## Client
//! - `client::session` - Connect/keep-alive/reconnect state machine
//!
//! ## Broker
//! - `broker::session_table` - Live connection registry
//! - `broker::topics` - Wildcard filter matching
//! - `broker::retained` - Retained message storage
//!
//! ## Extensions
//! - `extensions::rpc` - Request/response dispatch seam
//! - `extensions::transfer` - File-transfer seam
//!
//! ## CLI
//! - `cli` - `photon start|publish|subscribe`

// Core infrastructure
pub mod core;

// Wire protocol
pub mod protocol;

// Networking
pub mod net;

// Client
pub mod client;

// Broker
pub mod broker;

// Collaborator seams
pub mod extensions;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::config::BrokerConfig;
pub use broker::{Broker, BrokerHandle};
pub use client::{ClientEvent, ClientSession, ClientState, ConnectOptions};
pub use protocol::{ApplicationMessage, ProtocolKind, Qos};
