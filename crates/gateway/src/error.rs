//! Gateway error types.

use thiserror::Error;

/// Authentication failures (token layer).
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("missing token")]
    MissingToken,

    /// The token failed signature or structural validation.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The token is past its expiry.
    #[error("token expired")]
    Expired,

    /// The token is not yet valid.
    #[error("token not yet valid")]
    NotYetValid,

    /// The token was issued by an unexpected issuer.
    #[error("invalid issuer")]
    InvalidIssuer,

    /// The claim set has no user id.
    #[error("token missing user id")]
    MissingUserId,
}

/// Admission rejections from the rate limiter tree.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// Per-IP connection rate exceeded.
    #[error("ip connection quota exceeded")]
    IpQuota,

    /// Per-user concurrent-session cap reached.
    #[error("user connection quota exceeded")]
    UserQuota,

    /// Global connection ceiling reached.
    #[error("global connection ceiling reached")]
    GlobalQuota,
}

/// Violations of the application framing protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame larger than the configured maximum.
    #[error("message exceeds size limit")]
    Oversize,

    /// The frame is not valid JSON or has the wrong shape.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// The `type` discriminator is not a known message type.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A non-auth message arrived before authentication.
    #[error("authentication required")]
    AuthRequired,
}

/// Flow-control refusals; the connection stays open.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    /// The session's outbound queue is full.
    #[error("client outbound queue full")]
    ClientSlow,

    /// The per-client message bucket refused a token.
    #[error("message rate limit exceeded")]
    RateLimited,

    /// The session is closing; no further writes accepted.
    #[error("session closing")]
    SessionClosed,
}

/// Top-level gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Bus(#[from] pubsub::BusError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Unrecoverable startup failure; terminates the process.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
