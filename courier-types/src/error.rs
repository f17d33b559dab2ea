//! Error types for courier wire formats.

use thiserror::Error;

/// Errors from encoding or decoding wire/persisted structures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// MessagePack serialization failed
    #[error("encode failed: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("decode failed: {0}")]
    Decode(#[source] rmp_serde::decode::Error),

    /// Frame exceeded the size limit
    #[error("frame too large: {len} > {max}")]
    FrameTooLarge {
        /// Declared or encoded length.
        len: usize,
        /// The enforced maximum.
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_too_large_display() {
        let err = CodecError::FrameTooLarge { len: 20, max: 10 };
        assert_eq!(err.to_string(), "frame too large: 20 > 10");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CodecError>();
    }
}
