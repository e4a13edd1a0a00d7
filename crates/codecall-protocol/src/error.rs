use thiserror::Error;

/// Errors produced while encoding or decoding protocol messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Call type string is not one of the known types
    #[error("unknown call type: {0}")]
    UnknownCallType(String),

    /// A line on the named channel was not valid JSON for its message type
    #[error("malformed {channel} message: {source}")]
    Malformed {
        channel: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Request could not be serialized
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(channel: &'static str, source: serde_json::Error) -> Self {
        ProtocolError::Malformed { channel, source }
    }
}
