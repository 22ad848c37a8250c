//! replink-core: wire protocol and RPC channel for remote interpreter
//! drivers.
//!
//! This crate defines:
//! - The message classes and tag registry ([`Message`], [`MessageRegistry`])
//! - Length-prefixed framing with an optional SASL integrity layer
//!   ([`codec`], [`sasl`])
//! - The RPC channel: connect, authenticate, correlate calls and replies
//!   ([`Rpc`], [`RpcConfig`])
//! - The accept side hosted by drivers and test harnesses ([`RpcServer`])
//! - Reply routing and peer-initiated call dispatch ([`Dispatcher`])
//! - Shareable three-outcome completion slots ([`completion`])

pub mod codec;
pub mod completion;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod rpc;
pub mod sasl;
pub mod server;

pub use completion::{Completer, Completion, Outcome};
pub use dispatcher::Dispatcher;
pub use error::{CodecError, RpcError, SaslError, TransportError};
pub use message::{
    InterpreterState, JobState, Message, MessageHeader, MessageRegistry, MessageType,
    RemoteError, ReplOutcome, SaslMessage, StatementResult,
};
pub use rpc::{Rpc, RpcConfig};
pub use sasl::{SaslQop, MECH_DIGEST_MD5, SASL_PROTOCOL, SASL_REALM};
pub use server::{OnChannel, RpcServer, SecretStore};
