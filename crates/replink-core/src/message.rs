//! Wire message classes and the tag registry.
//!
//! Every frame body carries a message-class tag followed by the
//! postcard-encoded body. The three system classes (`MessageHeader`,
//! `NullMessage`, `SaslMessage`) are always registered; the interactive
//! protocol classes are registered on top by [`MessageRegistry::interactive`].
//!
//! Messages form a closed sum ([`Message`]); decoding dispatches by tag
//! through the registry, O(1) per frame.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Whether a header opens a call, a reply, or an error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Call = 0,
    Reply = 1,
    Error = 2,
}

/// First frame of every logical message pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: i64,
    pub kind: MessageType,
}

/// Payload carried during the SASL exchange. `client_id` is only set on the
/// very first message from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslMessage {
    pub client_id: Option<String>,
    pub payload: Vec<u8>,
}

/// Payload of an ERROR-typed message pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
}

/// Terminal status of one executed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReplOutcome {
    Ok = 0,
    Error = 1,
}

/// Result of one statement, as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementResult {
    pub status: ReplOutcome,
    pub output: String,
}

/// Global interpreter state reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum InterpreterState {
    Starting = 0,
    Idle = 1,
    Busy = 2,
    /// The interpreter is wedged; the session must be discarded.
    Error = 3,
}

/// State of one opaque job on the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobState {
    Queued = 0,
    Started = 1,
    Succeeded = 2,
    Failed = 3,
    Cancelled = 4,
}

/// The closed sum of every message that can cross the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Header(MessageHeader),
    Null,
    Sasl(SaslMessage),
    Error(RemoteError),

    // Client-initiated calls.
    Ping,
    ReplCode { code: String },
    ReplJobResult { id: u64 },
    ReplState,
    Bypass { payload: Vec<u8>, sync: bool },
    BypassJobStatus { handle: u64 },
    CancelBypass { handle: u64 },
    AddFile { uri: String },
    AddJar { uri: String },
    EndSession,

    // Replies.
    ReplId { id: u64 },
    ReplResult { result: Option<StatementResult> },
    ReplStateReply { state: InterpreterState },
    JobHandle { handle: u64 },
    JobStatusReply {
        state: JobState,
        result: Option<Vec<u8>>,
        error: Option<String>,
    },
}

// Per-variant bodies. The enum above is the in-memory shape; these are the
// wire shapes keyed by tag, so adding a class never perturbs another class's
// encoding.
#[derive(Serialize, Deserialize)]
struct ReplCodeBody {
    code: String,
}
#[derive(Serialize, Deserialize)]
struct IdBody {
    id: u64,
}
#[derive(Serialize, Deserialize)]
struct HandleBody {
    handle: u64,
}
#[derive(Serialize, Deserialize)]
struct BypassBody {
    payload: Vec<u8>,
    sync: bool,
}
#[derive(Serialize, Deserialize)]
struct UriBody {
    uri: String,
}
#[derive(Serialize, Deserialize)]
struct ReplResultBody {
    result: Option<StatementResult>,
}
#[derive(Serialize, Deserialize)]
struct ReplStateBody {
    state: InterpreterState,
}
#[derive(Serialize, Deserialize)]
struct JobStatusBody {
    state: JobState,
    result: Option<Vec<u8>>,
    error: Option<String>,
}
#[derive(Serialize, Deserialize)]
struct UnitBody {}

pub mod tags {
    pub const MESSAGE_HEADER: &str = "MessageHeader";
    pub const NULL_MESSAGE: &str = "NullMessage";
    pub const SASL_MESSAGE: &str = "SaslMessage";
    pub const REMOTE_ERROR: &str = "RemoteError";
    pub const PING: &str = "Ping";
    pub const REPL_CODE: &str = "ReplCode";
    pub const REPL_JOB_RESULT: &str = "ReplJobResult";
    pub const REPL_STATE: &str = "ReplState";
    pub const BYPASS: &str = "Bypass";
    pub const BYPASS_JOB_STATUS: &str = "BypassJobStatus";
    pub const CANCEL_BYPASS: &str = "CancelBypass";
    pub const ADD_FILE: &str = "AddFile";
    pub const ADD_JAR: &str = "AddJar";
    pub const END_SESSION: &str = "EndSession";
    pub const REPL_ID: &str = "ReplId";
    pub const REPL_RESULT: &str = "ReplResult";
    pub const REPL_STATE_REPLY: &str = "ReplStateReply";
    pub const JOB_HANDLE: &str = "JobHandle";
    pub const JOB_STATUS_REPLY: &str = "JobStatusReply";
}

impl Message {
    /// The message-class tag written on the wire.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Header(_) => tags::MESSAGE_HEADER,
            Message::Null => tags::NULL_MESSAGE,
            Message::Sasl(_) => tags::SASL_MESSAGE,
            Message::Error(_) => tags::REMOTE_ERROR,
            Message::Ping => tags::PING,
            Message::ReplCode { .. } => tags::REPL_CODE,
            Message::ReplJobResult { .. } => tags::REPL_JOB_RESULT,
            Message::ReplState => tags::REPL_STATE,
            Message::Bypass { .. } => tags::BYPASS,
            Message::BypassJobStatus { .. } => tags::BYPASS_JOB_STATUS,
            Message::CancelBypass { .. } => tags::CANCEL_BYPASS,
            Message::AddFile { .. } => tags::ADD_FILE,
            Message::AddJar { .. } => tags::ADD_JAR,
            Message::EndSession => tags::END_SESSION,
            Message::ReplId { .. } => tags::REPL_ID,
            Message::ReplResult { .. } => tags::REPL_RESULT,
            Message::ReplStateReply { .. } => tags::REPL_STATE_REPLY,
            Message::JobHandle { .. } => tags::JOB_HANDLE,
            Message::JobStatusReply { .. } => tags::JOB_STATUS_REPLY,
        }
    }

    /// Encode the message body (tag not included).
    pub fn encode_body(&self) -> Result<Vec<u8>, CodecError> {
        fn enc<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
            postcard::to_allocvec(v).map_err(|e| CodecError::Encode(e.to_string()))
        }
        match self {
            Message::Header(h) => enc(h),
            Message::Null => enc(&UnitBody {}),
            Message::Sasl(s) => enc(s),
            Message::Error(e) => enc(e),
            Message::Ping => enc(&UnitBody {}),
            Message::ReplCode { code } => enc(&ReplCodeBody { code: code.clone() }),
            Message::ReplJobResult { id } => enc(&IdBody { id: *id }),
            Message::ReplState => enc(&UnitBody {}),
            Message::Bypass { payload, sync } => enc(&BypassBody {
                payload: payload.clone(),
                sync: *sync,
            }),
            Message::BypassJobStatus { handle } => enc(&HandleBody { handle: *handle }),
            Message::CancelBypass { handle } => enc(&HandleBody { handle: *handle }),
            Message::AddFile { uri } => enc(&UriBody { uri: uri.clone() }),
            Message::AddJar { uri } => enc(&UriBody { uri: uri.clone() }),
            Message::EndSession => enc(&UnitBody {}),
            Message::ReplId { id } => enc(&IdBody { id: *id }),
            Message::ReplResult { result } => enc(&ReplResultBody {
                result: result.clone(),
            }),
            Message::ReplStateReply { state } => enc(&ReplStateBody { state: *state }),
            Message::JobHandle { handle } => enc(&HandleBody { handle: *handle }),
            Message::JobStatusReply {
                state,
                result,
                error,
            } => enc(&JobStatusBody {
                state: *state,
                result: result.clone(),
                error: error.clone(),
            }),
        }
    }
}

type DecodeFn = fn(&[u8]) -> Result<Message, CodecError>;

fn dec<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(body).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Tag-to-decoder map. Cheap to clone (function pointers only); one per
/// channel so connections can register different application classes.
#[derive(Clone)]
pub struct MessageRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl MessageRegistry {
    /// Registry holding only the system classes every channel needs.
    pub fn system() -> Self {
        let mut r = Self {
            decoders: HashMap::new(),
        };
        r.register(tags::MESSAGE_HEADER, |b| {
            Ok(Message::Header(dec::<MessageHeader>(b)?))
        });
        r.register(tags::NULL_MESSAGE, |b| {
            dec::<UnitBody>(b)?;
            Ok(Message::Null)
        });
        r.register(tags::SASL_MESSAGE, |b| {
            Ok(Message::Sasl(dec::<SaslMessage>(b)?))
        });
        r.register(tags::REMOTE_ERROR, |b| {
            Ok(Message::Error(dec::<RemoteError>(b)?))
        });
        r
    }

    /// System classes plus the interactive-session protocol.
    pub fn interactive() -> Self {
        let mut r = Self::system();
        r.register(tags::PING, |b| {
            dec::<UnitBody>(b)?;
            Ok(Message::Ping)
        });
        r.register(tags::REPL_CODE, |b| {
            let body = dec::<ReplCodeBody>(b)?;
            Ok(Message::ReplCode { code: body.code })
        });
        r.register(tags::REPL_JOB_RESULT, |b| {
            let body = dec::<IdBody>(b)?;
            Ok(Message::ReplJobResult { id: body.id })
        });
        r.register(tags::REPL_STATE, |b| {
            dec::<UnitBody>(b)?;
            Ok(Message::ReplState)
        });
        r.register(tags::BYPASS, |b| {
            let body = dec::<BypassBody>(b)?;
            Ok(Message::Bypass {
                payload: body.payload,
                sync: body.sync,
            })
        });
        r.register(tags::BYPASS_JOB_STATUS, |b| {
            let body = dec::<HandleBody>(b)?;
            Ok(Message::BypassJobStatus {
                handle: body.handle,
            })
        });
        r.register(tags::CANCEL_BYPASS, |b| {
            let body = dec::<HandleBody>(b)?;
            Ok(Message::CancelBypass {
                handle: body.handle,
            })
        });
        r.register(tags::ADD_FILE, |b| {
            let body = dec::<UriBody>(b)?;
            Ok(Message::AddFile { uri: body.uri })
        });
        r.register(tags::ADD_JAR, |b| {
            let body = dec::<UriBody>(b)?;
            Ok(Message::AddJar { uri: body.uri })
        });
        r.register(tags::END_SESSION, |b| {
            dec::<UnitBody>(b)?;
            Ok(Message::EndSession)
        });
        r.register(tags::REPL_ID, |b| {
            let body = dec::<IdBody>(b)?;
            Ok(Message::ReplId { id: body.id })
        });
        r.register(tags::REPL_RESULT, |b| {
            let body = dec::<ReplResultBody>(b)?;
            Ok(Message::ReplResult {
                result: body.result,
            })
        });
        r.register(tags::REPL_STATE_REPLY, |b| {
            let body = dec::<ReplStateBody>(b)?;
            Ok(Message::ReplStateReply { state: body.state })
        });
        r.register(tags::JOB_HANDLE, |b| {
            let body = dec::<HandleBody>(b)?;
            Ok(Message::JobHandle {
                handle: body.handle,
            })
        });
        r.register(tags::JOB_STATUS_REPLY, |b| {
            let body = dec::<JobStatusBody>(b)?;
            Ok(Message::JobStatusReply {
                state: body.state,
                result: body.result,
                error: body.error,
            })
        });
        r
    }

    fn register(&mut self, tag: &'static str, f: DecodeFn) {
        self.decoders.insert(tag, f);
    }

    /// Decode a message body by tag.
    pub fn decode(&self, tag: &str, body: &[u8]) -> Result<Message, CodecError> {
        match self.decoders.get(tag) {
            Some(f) => f(body),
            None => Err(CodecError::UnknownTag(tag.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let registry = MessageRegistry::interactive();
        let body = msg.encode_body().unwrap();
        let back = registry.decode(msg.tag(), &body).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn system_classes_roundtrip() {
        roundtrip(Message::Header(MessageHeader {
            id: 42,
            kind: MessageType::Call,
        }));
        roundtrip(Message::Null);
        roundtrip(Message::Sasl(SaslMessage {
            client_id: Some("client-1".into()),
            payload: vec![1, 2, 3],
        }));
        roundtrip(Message::Error(RemoteError {
            message: "boom".into(),
        }));
    }

    #[test]
    fn protocol_classes_roundtrip() {
        roundtrip(Message::ReplCode {
            code: "1 + 2".into(),
        });
        roundtrip(Message::ReplResult {
            result: Some(StatementResult {
                status: ReplOutcome::Ok,
                output: "3".into(),
            }),
        });
        roundtrip(Message::ReplResult { result: None });
        roundtrip(Message::Bypass {
            payload: vec![0xde, 0xad],
            sync: true,
        });
        roundtrip(Message::JobStatusReply {
            state: JobState::Succeeded,
            result: Some(vec![9]),
            error: None,
        });
        roundtrip(Message::ReplStateReply {
            state: InterpreterState::Error,
        });
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let registry = MessageRegistry::system();
        let err = registry.decode("Bogus", &[]).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(t) if t == "Bogus"));
    }

    #[test]
    fn repl_classes_need_interactive_registry() {
        let registry = MessageRegistry::system();
        let body = Message::Ping.encode_body().unwrap();
        assert!(registry.decode(tags::PING, &body).is_err());
    }
}
