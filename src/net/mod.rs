//! Networking layer.
//!
//! This module provides the connection-level security infrastructure:
//! - `crypto` - session cipher and key-exchange handshake

pub mod crypto;

pub use crypto::*;
