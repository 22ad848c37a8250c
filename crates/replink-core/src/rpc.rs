//! The RPC channel: one durable, ordered, authenticated message stream to
//! one remote peer.
//!
//! # Construction
//!
//! The channel is built in two phases. [`Rpc::connect`] opens the socket and
//! runs the SASL exchange on the raw codec path; only once the handshake
//! completes is the dispatcher installed and the demux task spawned. The
//! dispatcher slot is one-shot and refuses re-assignment.
//!
//! # Invariants
//!
//! - Only the demux task reads from the socket.
//! - Header and payload of a logical message pair are written under one
//!   acquisition of the write lock, so concurrent calls never interleave.
//! - `close` is idempotent; the first invocation fails every outstanding
//!   completion and wakes the closed-watch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::Level;

use crate::codec::{FrameReader, FrameWriter};
use crate::dispatcher::Dispatcher;
use crate::error::{RpcError, SaslError, TransportError};
use crate::message::{Message, MessageHeader, MessageRegistry, MessageType, RemoteError, SaslMessage};
use crate::sasl::{DigestClient, SaslQop, SecurityPair, MECH_DIGEST_MD5};

pub(crate) type Writer = FrameWriter<WriteHalf<TcpStream>>;
pub(crate) type Reader = FrameReader<ReadHalf<TcpStream>>;

/// Channel configuration. Key names and defaults are contracts with the
/// embedding frontend.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_message_size: usize,
    /// Level for per-frame channel logging.
    pub channel_log_level: Level,
    /// SASL mechanism to negotiate.
    pub mechanism: String,
    /// Preferred quality of protection.
    pub qop: SaslQop,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(90),
            max_message_size: 50 * 1024 * 1024,
            channel_log_level: Level::TRACE,
            mechanism: MECH_DIGEST_MD5.to_string(),
            qop: SaslQop::Auth,
        }
    }
}

pub(crate) struct RpcInner {
    writer: tokio::sync::Mutex<Writer>,
    dispatcher: std::sync::OnceLock<Arc<Dispatcher>>,
    next_id: AtomicI64,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    demux: Mutex<Option<JoinHandle<()>>>,
}

impl RpcInner {
    async fn close(&self, cause: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(cause, "closing RPC channel");
        if let Some(dispatcher) = self.dispatcher.get() {
            dispatcher.discard_all(cause);
        }
        self.closed_tx.send_replace(true);
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        // Last: when close runs on the demux task itself, nothing after the
        // abort would execute.
        if let Some(handle) = self.demux.lock().take() {
            handle.abort();
        }
    }
}

/// Handle to one RPC channel. Cheap to clone.
#[derive(Clone)]
pub struct Rpc {
    inner: Arc<RpcInner>,
}

impl Rpc {
    /// Connect to a remote peer and authenticate.
    ///
    /// The TCP connect runs under `connect_timeout`; the SASL exchange under
    /// the separate `handshake_timeout`. Either failure closes the socket
    /// and surfaces the cause.
    pub async fn connect(
        config: &RpcConfig,
        host: &str,
        port: u16,
        client_id: &str,
        secret: &str,
        registry: MessageRegistry,
    ) -> Result<Rpc, TransportError> {
        let stream = match timeout(config.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TransportError::ConnectTimeout(config.connect_timeout)),
        };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(
            read_half,
            registry,
            config.max_message_size,
            config.channel_log_level,
        );
        let mut writer = FrameWriter::new(
            write_half,
            config.max_message_size,
            config.channel_log_level,
        );

        let handshake = timeout(
            config.handshake_timeout,
            client_handshake(&mut reader, &mut writer, config, client_id, secret),
        )
        .await;
        let security = match handshake {
            Ok(Ok(security)) => security,
            Ok(Err(e)) => {
                let _ = writer.shutdown().await;
                return Err(e);
            }
            Err(_) => {
                let _ = writer.shutdown().await;
                return Err(TransportError::HandshakeTimeout(config.handshake_timeout));
            }
        };
        if let Some(pair) = security {
            writer.install_security(pair.send);
            reader.install_security(pair.recv);
        }
        tracing::debug!(client_id, "RPC handshake complete");

        let rpc = Rpc::assemble(writer);
        rpc.set_dispatcher(Arc::new(Dispatcher::new()));
        rpc.spawn_demux(reader);
        Ok(rpc)
    }

    /// Build a channel around an authenticated write half. The dispatcher is
    /// installed separately and the demux task spawned last, so handlers can
    /// be registered before the first inbound frame is routed.
    pub(crate) fn assemble(writer: Writer) -> Rpc {
        let (closed_tx, _) = watch::channel(false);
        Rpc {
            inner: Arc::new(RpcInner {
                writer: tokio::sync::Mutex::new(writer),
                dispatcher: std::sync::OnceLock::new(),
                next_id: AtomicI64::new(0),
                closed: AtomicBool::new(false),
                closed_tx,
                demux: Mutex::new(None),
            }),
        }
    }

    /// Install the dispatcher. One-shot; a second call is a programming
    /// error.
    pub(crate) fn set_dispatcher(&self, dispatcher: Arc<Dispatcher>) {
        assert!(
            self.inner.dispatcher.set(dispatcher).is_ok(),
            "dispatcher already installed"
        );
    }

    pub(crate) fn spawn_demux(&self, reader: Reader) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(demux(inner, reader));
        *self.inner.demux.lock() = Some(handle);
    }

    fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.inner
            .dispatcher
            .get()
            .expect("dispatcher installed before channel use")
    }

    /// The channel's dispatcher, for registering handlers for
    /// peer-initiated calls.
    pub fn handlers(&self) -> &Dispatcher {
        self.dispatcher()
    }

    /// Send a call and await its reply.
    ///
    /// The completion resolves with exactly one of: the matching REPLY, the
    /// matching ERROR, or channel close.
    pub async fn call(
        &self,
        msg: Message,
        expected_reply: &'static str,
    ) -> Result<Message, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed("channel closed".into()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        // Register before writing so a fast reply cannot miss the slot.
        let rx = self.dispatcher().register_rpc(id, expected_reply);

        let header = Message::Header(MessageHeader {
            id,
            kind: MessageType::Call,
        });
        let write_result: Result<(), TransportError> = {
            let mut writer = self.inner.writer.lock().await;
            async {
                writer.write_message(&header).await?;
                writer.write_message(&msg).await?;
                writer.flush().await
            }
            .await
        };
        if let Err(e) = write_result {
            tracing::warn!(id, error = %e, "failed to send RPC call, closing channel");
            self.dispatcher().discard_rpc(id);
            self.close("send failed").await;
            return Err(e.into());
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Closed("channel closed".into())),
        }
    }

    /// Issue a call on a detached task, ignoring the outcome. Used for
    /// fire-and-forget signals such as job cancellation.
    pub fn call_detached(&self, msg: Message, expected_reply: &'static str) {
        let rpc = self.clone();
        tokio::spawn(async move {
            if let Err(e) = rpc.call(msg, expected_reply).await {
                tracing::debug!(error = %e, "detached call failed");
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Watch that flips to `true` when the channel closes, however it
    /// closes.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    /// Close the channel. Idempotent; fails all outstanding completions.
    pub async fn close(&self, cause: &str) {
        self.inner.close(cause).await;
    }
}

async fn client_handshake(
    reader: &mut Reader,
    writer: &mut Writer,
    config: &RpcConfig,
    client_id: &str,
    secret: &str,
) -> Result<Option<SecurityPair>, TransportError> {
    let mut client = DigestClient::new(&config.mechanism, client_id, secret, config.qop)?;
    writer
        .write_message(&Message::Sasl(SaslMessage {
            client_id: Some(client_id.to_string()),
            payload: client.initial_response(),
        }))
        .await?;
    writer.flush().await?;

    loop {
        let sasl = match reader.read_message().await? {
            Message::Sasl(sasl) => sasl,
            // An error frame here means the server rejected the hello.
            Message::Error(e) => return Err(SaslError::Malformed(e.message).into()),
            _ => return Err(SaslError::UnexpectedMessage.into()),
        };
        if let Some(response) = client.evaluate(&sasl.payload)? {
            writer
                .write_message(&Message::Sasl(SaslMessage {
                    client_id: None,
                    payload: response,
                }))
                .await?;
            writer.flush().await?;
        }
        if client.is_complete() {
            return Ok(client.take_security());
        }
    }
}

/// Receive loop. The single reader of the channel; routes replies and errors
/// to the dispatcher's pending table and answers peer-initiated calls.
async fn demux(inner: Arc<RpcInner>, mut reader: Reader) {
    let cause = loop {
        let msg = match reader.read_message().await {
            Ok(msg) => msg,
            Err(TransportError::Closed) => break "connection closed by remote".to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "channel read failed");
                break e.to_string();
            }
        };
        let header = match msg {
            Message::Header(header) => header,
            other => {
                tracing::warn!(tag = other.tag(), "expected message header");
                break "protocol violation: missing message header".to_string();
            }
        };
        let payload = match reader.read_message().await {
            Ok(msg) => msg,
            Err(e) => break e.to_string(),
        };
        let dispatcher = inner
            .dispatcher
            .get()
            .expect("dispatcher installed before demux start");

        match header.kind {
            MessageType::Reply => dispatcher.complete_reply(header.id, payload),
            MessageType::Error => {
                let text = match payload {
                    Message::Error(e) => e.message,
                    other => format!("remote error carried {:?} payload", other.tag()),
                };
                dispatcher.complete_error(header.id, text);
            }
            MessageType::Call => {
                let tag = payload.tag();
                let (kind, reply) = match dispatcher.dispatch_call(payload) {
                    Some(Ok(reply)) => (MessageType::Reply, reply),
                    Some(Err(err)) => {
                        tracing::debug!(id = header.id, tag, error = %err, "call handler failed");
                        (MessageType::Error, Message::Error(RemoteError { message: err }))
                    }
                    None => {
                        tracing::warn!(id = header.id, tag, "no handler for inbound call");
                        (
                            MessageType::Error,
                            Message::Error(RemoteError {
                                message: format!("no handler for {tag}"),
                            }),
                        )
                    }
                };
                let write_result: Result<(), TransportError> = {
                    let mut writer = inner.writer.lock().await;
                    async {
                        writer
                            .write_message(&Message::Header(MessageHeader {
                                id: header.id,
                                kind,
                            }))
                            .await?;
                        writer.write_message(&reply).await?;
                        writer.flush().await
                    }
                    .await
                };
                if let Err(e) = write_result {
                    break e.to_string();
                }
            }
        }
    };
    inner.close(&cause).await;
}

