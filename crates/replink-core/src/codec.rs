//! Length-prefixed message framing.
//!
//! Each frame is sent as:
//! - `u32 LE`: body length
//! - `u16 LE`: tag length, then the ASCII message-class tag
//! - postcard-encoded message body
//!
//! After the handshake negotiates integrity, the whole body (tag included)
//! is sealed by the SASL security layer before the length prefix is written,
//! and unsealed after the length prefix is read.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::Level;

use crate::error::{CodecError, TransportError};
use crate::message::{Message, MessageRegistry};
use crate::sasl::{SecurityRecv, SecuritySend};

/// Log a frame event at the channel's configured level. `tracing` levels are
/// static per call site, so the dynamic level fans out here.
pub(crate) fn log_frame(level: Level, direction: &str, tag: &str, len: usize) {
    if level == Level::ERROR {
        tracing::error!(direction, tag, len, "frame");
    } else if level == Level::WARN {
        tracing::warn!(direction, tag, len, "frame");
    } else if level == Level::INFO {
        tracing::info!(direction, tag, len, "frame");
    } else if level == Level::DEBUG {
        tracing::debug!(direction, tag, len, "frame");
    } else {
        tracing::trace!(direction, tag, len, "frame");
    }
}

fn encode_plain(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let tag = msg.tag();
    let body = msg.encode_body()?;
    let mut out = Vec::with_capacity(2 + tag.len() + body.len());
    out.extend_from_slice(&(tag.len() as u16).to_le_bytes());
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_plain(registry: &MessageRegistry, frame: &[u8]) -> Result<Message, CodecError> {
    if frame.len() < 2 {
        return Err(CodecError::Truncated);
    }
    let tag_len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
    if frame.len() < 2 + tag_len {
        return Err(CodecError::Truncated);
    }
    let tag = std::str::from_utf8(&frame[2..2 + tag_len])
        .map_err(|_| CodecError::Decode("tag is not UTF-8".into()))?;
    registry.decode(tag, &frame[2 + tag_len..])
}

/// Write side of one channel. Owned by the channel's write lock; never
/// shared, so the security sequence counter needs no synchronization.
pub struct FrameWriter<W> {
    io: W,
    max_message_size: usize,
    log_level: Level,
    seal: Option<SecuritySend>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, max_message_size: usize, log_level: Level) -> Self {
        Self {
            io,
            max_message_size,
            log_level,
            seal: None,
        }
    }

    /// Install the integrity interposer. All frames written afterwards are
    /// sealed.
    pub fn install_security(&mut self, seal: SecuritySend) {
        self.seal = Some(seal);
    }

    /// Encode and write one frame. Callers flush explicitly so a
    /// header+payload pair costs a single flush.
    pub async fn write_message(&mut self, msg: &Message) -> Result<(), TransportError> {
        let mut frame = encode_plain(msg)?;
        if frame.len() > self.max_message_size {
            return Err(CodecError::FrameTooLarge {
                len: frame.len(),
                max: self.max_message_size,
            }
            .into());
        }
        if let Some(seal) = &mut self.seal {
            frame = seal.wrap(&frame);
        }
        log_frame(self.log_level, "send", msg.tag(), frame.len());
        self.io.write_all(&(frame.len() as u32).to_le_bytes()).await?;
        self.io.write_all(&frame).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), TransportError> {
        self.io.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// Read side of one channel. Owned exclusively by the demux task.
pub struct FrameReader<R> {
    io: R,
    registry: MessageRegistry,
    max_message_size: usize,
    log_level: Level,
    open: Option<SecurityRecv>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, registry: MessageRegistry, max_message_size: usize, log_level: Level) -> Self {
        Self {
            io,
            registry,
            max_message_size,
            log_level,
            open: None,
        }
    }

    /// Install the integrity interposer. All frames read afterwards are
    /// unsealed first.
    pub fn install_security(&mut self, open: SecurityRecv) {
        self.open = Some(open);
    }

    /// Read and decode the next frame. EOF surfaces as
    /// [`TransportError::Closed`].
    pub async fn read_message(&mut self) -> Result<Message, TransportError> {
        let mut len_buf = [0u8; 4];
        self.io.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > self.max_message_size {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_message_size,
            }
            .into());
        }
        let mut frame = vec![0u8; len];
        self.io.read_exact(&mut frame).await?;
        let frame = match &mut self.open {
            Some(open) => open.unwrap(&frame)?,
            None => frame,
        };
        let msg = decode_plain(&self.registry, &frame)?;
        log_frame(self.log_level, "recv", msg.tag(), len);
        Ok(msg)
    }
}
