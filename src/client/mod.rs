//! Client side of the stack.
//!
//! - `session` - connect/keep-alive/reconnect state machine

pub mod session;

pub use session::{
    ClientError, ClientEvent, ClientSession, ClientState, ConnectOptions, FaultHandler,
};
