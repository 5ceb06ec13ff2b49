use thiserror::Error;

/// Failures callers need to tell apart. Everything else travels as plain
/// `anyhow` context.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every service failed transiently for at least one requested key.
    /// Only surfaced when the client was built in strict mode.
    #[error("failed reading data from services {services:?}")]
    TransientFailure { services: Vec<String> },

    /// A server handed back a bucket it has not finalized. The protocol
    /// forbids this, so the call fails in both strict and non-strict mode.
    #[error("protocol violation: server returned a non-finalized bucket")]
    ProtocolViolation,

    /// The read registry is empty and no fallback service could be built.
    #[error("no read services available")]
    NoReadServices,
}
