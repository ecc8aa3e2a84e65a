//! Wire protocol for tessera.
//!
//! Two concerns live here, none of which touch the inspector:
//!
//! - [`jsonrpc`]: JSON-RPC 2.0 request/response/notification shapes and the
//!   protocol error codes.
//! - [`codec`]: byte-stream framing shared by the stdio and raw socket
//!   transports. Each connection is either `Content-Length` framed or NDJSON;
//!   the mode is detected from the first frame.

pub mod codec;
pub mod jsonrpc;

pub use codec::{DEFAULT_MAX_FRAME_BYTES, FrameDecoder, FrameError, FrameMode, encode_frame};
pub use jsonrpc::{
    ErrorObject, Incoming, JSONRPC_VERSION, Notification, Rejected, Request, RequestId, Response,
    RpcError, parse_incoming, parse_request,
};

/// Method name of the push notification carrying a [`tessera_types::WireEnvelope`].
pub const EVENT_NOTIFICATION: &str = "notifications/event";

pub fn event_notification(
    envelope: &tessera_types::WireEnvelope,
) -> Result<Notification, serde_json::Error> {
    Ok(Notification::new(
        EVENT_NOTIFICATION,
        serde_json::to_value(envelope)?,
    ))
}
