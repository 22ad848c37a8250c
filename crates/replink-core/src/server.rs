//! Accept side of the RPC protocol.
//!
//! The remote driver hosts one of these; the test suites host a scripted
//! one. Each accepted connection runs the SASL *server* handshake (the
//! client's hello identifies it, the secret store supplies its secret),
//! then gets its own channel with handlers registered before the demux
//! task starts reading.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::codec::{FrameReader, FrameWriter};
use crate::dispatcher::Dispatcher;
use crate::error::{SaslError, TransportError};
use crate::message::{Message, MessageRegistry, RemoteError, SaslMessage};
use crate::rpc::{Reader, Rpc, RpcConfig, Writer};
use crate::sasl::{DigestServer, SaslQop, SecurityPair};

/// Looks up the shared secret for a client id. `None` rejects the client.
pub type SecretStore = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Invoked for each authenticated channel, before its demux task starts;
/// register call handlers here. Receives the channel and the client id.
pub type OnChannel = Arc<dyn Fn(&Rpc, &str) + Send + Sync>;

/// Listening endpoint accepting authenticated RPC channels.
pub struct RpcServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    channels: Arc<Mutex<Vec<Rpc>>>,
}

impl RpcServer {
    /// Bind a listener and start accepting. `addr` is typically
    /// `"127.0.0.1:0"` in tests.
    pub async fn bind(
        addr: &str,
        config: RpcConfig,
        registry: MessageRegistry,
        secrets: SecretStore,
        on_channel: OnChannel,
    ) -> std::io::Result<RpcServer> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let channels: Arc<Mutex<Vec<Rpc>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_channels = channels.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                tracing::debug!(%peer, "accepted connection");
                let config = config.clone();
                let registry = registry.clone();
                let secrets = secrets.clone();
                let on_channel = on_channel.clone();
                let channels = accept_channels.clone();
                tokio::spawn(async move {
                    match serve_connection(stream, &config, registry, secrets, on_channel).await {
                        Ok(rpc) => channels.lock().push(rpc),
                        Err(e) => tracing::debug!(%peer, error = %e, "connection rejected"),
                    }
                });
            }
        });

        Ok(RpcServer {
            local_addr,
            accept_task,
            channels,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every live channel.
    pub async fn shutdown(&self) {
        self.accept_task.abort();
        let channels: Vec<Rpc> = std::mem::take(&mut *self.channels.lock());
        for rpc in channels {
            rpc.close("server shutdown").await;
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    config: &RpcConfig,
    registry: MessageRegistry,
    secrets: SecretStore,
    on_channel: OnChannel,
) -> Result<Rpc, TransportError> {
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
        server_handshake(&mut reader, &mut writer, config, &secrets),
    )
    .await;
    let (client_id, security) = match handshake {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            let _ = writer
                .write_message(&Message::Error(RemoteError {
                    message: e.to_string(),
                }))
                .await;
            let _ = writer.flush().await;
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
    tracing::debug!(client_id, "server handshake complete");

    let rpc = Rpc::assemble(writer);
    rpc.set_dispatcher(Arc::new(Dispatcher::new()));
    (on_channel.as_ref())(&rpc, &client_id);
    rpc.spawn_demux(reader);
    Ok(rpc)
}

async fn server_handshake(
    reader: &mut Reader,
    writer: &mut Writer,
    config: &RpcConfig,
    secrets: &SecretStore,
) -> Result<(String, Option<SecurityPair>), TransportError> {
    // The hello names the client; everything else is anonymous exchange.
    let hello = match reader.read_message().await? {
        Message::Sasl(sasl) => sasl,
        _ => return Err(SaslError::UnexpectedMessage.into()),
    };
    let client_id = hello
        .client_id
        .ok_or_else(|| SaslError::Malformed("hello carries no client id".into()))?;
    let secret = (secrets.as_ref())(&client_id).ok_or(SaslError::AuthenticationFailed)?;

    let offered: &[SaslQop] = match config.qop {
        SaslQop::Auth => &[SaslQop::Auth],
        SaslQop::AuthInt => &[SaslQop::Auth, SaslQop::AuthInt],
    };
    let mut server = DigestServer::new(&client_id, &secret, offered);

    writer
        .write_message(&Message::Sasl(SaslMessage {
            client_id: None,
            payload: server.initial_challenge(),
        }))
        .await?;
    writer.flush().await?;

    loop {
        let response = match reader.read_message().await? {
            Message::Sasl(sasl) => sasl,
            _ => return Err(SaslError::UnexpectedMessage.into()),
        };
        let out = server.evaluate(&response.payload)?;
        writer
            .write_message(&Message::Sasl(SaslMessage {
                client_id: None,
                payload: out,
            }))
            .await?;
        writer.flush().await?;
        if server.is_complete() {
            return Ok((client_id, server.take_security()));
        }
    }
}
