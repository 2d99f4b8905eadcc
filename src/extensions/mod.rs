//! Collaborator seams.
//!
//! The RPC-dispatch and file-transfer subsystems are external to the
//! protocol engine; these modules define the interfaces they plug into.

pub mod rpc;
pub mod transfer;

pub use rpc::{report_progress, report_result, RpcError, RpcHandler, RpcRegistry};
pub use transfer::{is_transfer_code, send_transfer_frame, TransferHandler};
