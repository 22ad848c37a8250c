//! Error types for the transport and RPC layers.

use core::fmt;
use std::time::Duration;

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The channel was closed (locally or by the peer).
    Closed,
    Io(std::io::Error),
    Codec(CodecError),
    Sasl(SaslError),
    /// TCP connect did not complete within the configured timeout.
    ConnectTimeout(Duration),
    /// The SASL exchange did not complete within the configured timeout.
    HandshakeTimeout(Duration),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "channel closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::Sasl(e) => write!(f, "SASL error: {e}"),
            Self::ConnectTimeout(d) => {
                write!(f, "timed out connecting to remote driver after {d:?}")
            }
            Self::HandshakeTimeout(d) => {
                write!(f, "timed out waiting for SASL handshake after {d:?}")
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Codec(e) => Some(e),
            Self::Sasl(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        // A clean EOF means the peer went away; callers treat that as closed.
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Closed
        } else {
            Self::Io(e)
        }
    }
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<SaslError> for TransportError {
    fn from(e: SaslError) -> Self {
        Self::Sasl(e)
    }
}

/// Message encode/decode errors.
#[derive(Debug)]
pub enum CodecError {
    /// Frame length exceeds the configured maximum.
    FrameTooLarge { len: usize, max: usize },
    /// The frame's tag names a message class that was never registered.
    UnknownTag(String),
    /// The frame was shorter than its own framing claims.
    Truncated,
    Encode(String),
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds maximum of {max}")
            }
            Self::UnknownTag(tag) => write!(f, "unregistered message tag {tag:?}"),
            Self::Truncated => write!(f, "truncated frame"),
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
            Self::Decode(msg) => write!(f, "decode failed: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// SASL negotiation and security-layer errors.
#[derive(Debug)]
pub enum SaslError {
    /// The peer asked for a mechanism this client does not implement.
    UnsupportedMechanism(String),
    /// No mutually acceptable quality-of-protection.
    QopMismatch(String),
    /// A challenge or response was structurally invalid.
    Malformed(String),
    /// The peer's credentials (or response digest) did not verify.
    AuthenticationFailed,
    /// A wrapped frame failed its integrity check.
    IntegrityViolation,
    /// A SASL message arrived outside the handshake exchange.
    UnexpectedMessage,
}

impl fmt::Display for SaslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedMechanism(m) => write!(f, "unsupported SASL mechanism {m:?}"),
            Self::QopMismatch(offered) => {
                write!(f, "no acceptable quality of protection in {offered:?}")
            }
            Self::Malformed(msg) => write!(f, "malformed SASL exchange: {msg}"),
            Self::AuthenticationFailed => write!(f, "SASL authentication failed"),
            Self::IntegrityViolation => write!(f, "message integrity check failed"),
            Self::UnexpectedMessage => write!(f, "unexpected SASL message"),
        }
    }
}

impl std::error::Error for SaslError {}

/// High-level RPC errors surfaced to callers of `Rpc::call`.
#[derive(Debug)]
pub enum RpcError {
    Transport(TransportError),
    /// The remote answered with an ERROR frame.
    Remote(String),
    /// The remote replied with a different message class than the call expected.
    UnexpectedReply {
        expected: &'static str,
        got: String,
    },
    /// The channel closed before the reply arrived.
    Closed(String),
}

impl RpcError {
    /// True when the error means the connection itself is gone, as opposed to
    /// the remote reporting a failure over a healthy channel.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Closed(_))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Remote(msg) => write!(f, "remote error: {msg}"),
            Self::UnexpectedReply { expected, got } => {
                write!(f, "expected reply {expected:?}, got {got:?}")
            }
            Self::Closed(cause) => write!(f, "channel closed: {cause}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}
