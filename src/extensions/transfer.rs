//! File-transfer seam.
//!
//! Transfer sessions run their own sub-protocol over the shared transport
//! and handshake: for a session whose variant is FileTransfer, the whole
//! first frame byte is a transfer command in the 100..=109 range rather
//! than a nibble-packed control code. The engine only provides raw frame
//! primitives and access to the session cipher; chunking, storage and
//! integrity are the collaborator's concern.

use crate::broker::session_table::{Session, SessionSendError};
use crate::protocol::codec::encode_frame;
use crate::protocol::CodecError;
use std::sync::Arc;

/// Inclusive bounds of the transfer command space.
pub const TRANSFER_CODE_MIN: u8 = 100;
pub const TRANSFER_CODE_MAX: u8 = 109;

pub const CMD_UPLOAD_BEGIN: u8 = 100;
pub const CMD_UPLOAD_CHUNK: u8 = 101;
pub const CMD_UPLOAD_END: u8 = 102;
pub const CMD_DOWNLOAD_REQUEST: u8 = 103;
pub const CMD_DOWNLOAD_CHUNK: u8 = 104;
pub const CMD_DOWNLOAD_END: u8 = 105;
pub const CMD_DELETE: u8 = 106;
pub const CMD_LIST: u8 = 107;
pub const CMD_ACK: u8 = 108;
pub const CMD_ERROR: u8 = 109;

/// Whether a raw first frame byte falls in the transfer command space.
pub fn is_transfer_code(first: u8) -> bool {
    (TRANSFER_CODE_MIN..=TRANSFER_CODE_MAX).contains(&first)
}

/// Handler invoked by the dispatcher for every frame read from a
/// FileTransfer session. The body is handed over undecrypted together with
/// the session (which exposes its cipher state).
pub trait TransferHandler: Send + Sync {
    fn handle_frame(&self, session: &Arc<Session>, command: u8, body: &[u8]);
}

#[derive(Debug, thiserror::Error)]
pub enum TransferSendError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Session(#[from] SessionSendError),
}

/// Encode and enqueue a transfer frame on a session, sealing the body under
/// the session's cipher when one is established.
pub fn send_transfer_frame(
    session: &Session,
    command: u8,
    body: &[u8],
) -> Result<(), TransferSendError> {
    let frame = encode_frame(command, &[], body, session.cipher())?;
    session.send(frame)?;
    Ok(())
}
