//! Error types for the RPC layer.

use courier_types::{CodecError, WireError};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Operation attempted on a transport that was never opened.
    #[error("not connected")]
    NotConnected,

    /// Connection closed (cleanly or not).
    #[error("connection closed")]
    Closed,

    /// Frame could not be written.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Frame could not be read.
    #[error("receive failed: {0}")]
    RecvFailed(String),

    /// Frame failed to encode or decode, or exceeded the size limit.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors surfaced to RPC callers.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The caller supplied a malformed argument (e.g. empty method name).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The call's context was cancelled before a response arrived.
    #[error("call {method} cancelled")]
    Cancelled {
        /// The method whose call was abandoned.
        method: String,
    },

    /// The connection failed beneath the call.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Argument or result failed to encode/decode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The remote side returned an error and no unwrapper translated it.
    #[error("server error: {0}")]
    Server(WireError),

    /// The remote error, translated by the pluggable unwrapper.
    #[error(transparent)]
    App(Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TransportError>();
        assert_send_sync::<RpcError>();
    }

    #[test]
    fn cancelled_display_names_method() {
        let err = RpcError::Cancelled {
            method: "chat.queue".into(),
        };
        assert_eq!(err.to_string(), "call chat.queue cancelled");
    }
}
