use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Request kinds used for per-kind awaiter deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Config,
    ModuleConfig,
    ChannelInfo,
    AdminResponse,
    SessionKey,
    Traceroute,
    NodeInfo,
    Position,
    DeviceMetadata,
    Ack,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Connect/read/write failures and framing desync. Recovered locally by
    /// reconnect; surfaced to users only through connection status.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// An awaiter deadline elapsed. State is not rolled back; a late reply
    /// still applies.
    #[error("request timed out: {0:?}")]
    Timeout(RequestKind),

    /// Malformed typed packet or unknown variant. Logged and dropped.
    #[error("protocol error: {0}")]
    Protocol(#[from] prost::DecodeError),

    /// Caller-supplied value out of range. Surfaced synchronously, never
    /// persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Referenced entity is missing. Logged, discarded.
    #[error("unknown entity: {0}")]
    State(String),

    /// Remote refused admin without a passkey or with an expired one.
    /// The session refreshes the passkey and retries once before this
    /// reaches a caller.
    #[error("admin denied by remote node {0:#010x}")]
    AdminDenied(u32),

    /// Remote firmware pre-dates the requested feature. Reported as a
    /// skipped outcome, never as an operation failure.
    #[error("firmware on {node:#010x} does not support {feature}")]
    FirmwareNotSupported { node: u32, feature: &'static str },

    /// The awaiter was abandoned by a user-initiated disconnect.
    #[error("cancelled")]
    Cancelled,

    /// Unrecoverable invariant violation: log, drop the transport,
    /// reconnect.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    #[inline]
    pub fn validation<S: Into<String>>(message: S) -> Error {
        Error::Validation(message.into())
    }

    /// Errors the session absorbs internally (§ propagation policy);
    /// everything else surfaces to the caller.
    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout(_) | Error::Protocol(_) | Error::State(_)
        )
    }
}
