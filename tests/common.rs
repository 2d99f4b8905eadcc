//! Common test harness utilities for integration tests.
//!
//! Helpers for starting a loopback broker on an ephemeral port and building
//! client options against it.

// Not all test files use all helpers; silence dead_code warnings for unused
// exports.
#![allow(dead_code)]

use photon::broker::{Broker, BrokerHandle};
use photon::core::config::BrokerConfig;
use photon::client::ConnectOptions;
use std::time::Duration;

/// Broker config bound to an ephemeral loopback port with a fast sweep.
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        bind: "127.0.0.1:0".into(),
        sweep_interval_secs: 1,
        connect_deadline_secs: 5,
        ..Default::default()
    }
}

/// Start a broker with the default test config.
pub async fn start_broker() -> BrokerHandle {
    Broker::new(test_config()).start().await.expect("start broker")
}

/// Start a broker with a caller-tweaked config.
pub async fn start_broker_with(config: BrokerConfig) -> BrokerHandle {
    Broker::new(config).start().await.expect("start broker")
}

/// Client options pointed at a running test broker.
pub fn client_options(handle: &BrokerHandle, client_id: &str) -> ConnectOptions {
    let addr = handle.local_addr();
    ConnectOptions::new(addr.ip().to_string(), addr.port())
        .client_id(client_id)
        .keep_alive_secs(5)
        .reconnect_delay(Duration::from_millis(200))
}

/// Give in-flight frames a moment to land.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
