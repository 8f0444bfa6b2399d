//! Protocol-level errors. Any of these terminates the engine; handler
//! failures do not appear here, they become per-record `Err` responses.

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A request header line exceeded the line buffer.
    #[error("unexpected oversized request line")]
    OversizedHeader,

    #[error("failed to decode incoming request: {0}")]
    Decode(#[from] serde_json::Error),

    /// A put body violated the quoted-base64 framing.
    #[error("malformed put body: {0}")]
    BadBody(String),

    /// The response sink failed; nothing further can be delivered.
    #[error("failed to write response: {0}")]
    WriteSink(std::io::Error),
}
