//! Transports. stdio and the raw socket share [`serve_stream`]; HTTP, SSE and
//! WebSocket live in [`http`].

pub mod http;
pub mod stdio;
pub mod tcp;

use std::sync::Arc;

use tessera_types::WireEnvelope;
use tessera_wire::{FrameDecoder, FrameError, FrameMode, Response, RpcError, encode_frame, event_notification};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::hub::Hub;
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub max_frame_bytes: usize,
    /// Logs every frame in and out at `info`.
    pub protocol_trace: bool,
}

/// Serves one framed JSON-RPC connection until EOF or a framing error.
/// Pushed events share the writer with responses.
pub async fn serve_stream<R, W>(
    mut reader: R,
    mut writer: W,
    hub: Arc<Hub>,
    options: StreamOptions,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = Session::new(hub.clone());
    let mut events = hub.attach(session.owner());
    let mut decoder = FrameDecoder::new(options.max_frame_bytes);
    let mut buf = vec![0u8; 64 * 1024];

    let result = loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(e.into()),
                };
                decoder.push(&buf[..n]);
                if let Err(e) = drain_frames(&mut decoder, &mut session, &mut writer, options).await {
                    break Err(e);
                }
            }
            Some(envelope) = events.recv() => {
                let mode = decoder.mode().unwrap_or(FrameMode::ContentLength);
                if let Err(e) = write_event(&mut writer, mode, &envelope, options).await {
                    break Err(e);
                }
            }
        }
    };

    session.close();
    result
}

async fn drain_frames<W: AsyncWrite + Unpin>(
    decoder: &mut FrameDecoder,
    session: &mut Session,
    writer: &mut W,
    options: StreamOptions,
) -> Result<(), TransportError> {
    loop {
        let frame = match decoder.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                // The stream is out of sync; say why before hanging up.
                let mode = decoder.mode().unwrap_or(FrameMode::ContentLength);
                let response = Response::failure(None, &RpcError::InvalidRequest(e.to_string()));
                if let Ok(body) = serde_json::to_vec(&response) {
                    let _ = writer.write_all(&encode_frame(mode, &body)).await;
                    let _ = writer.flush().await;
                }
                return Err(e.into());
            }
        };
        if options.protocol_trace {
            info!(direction = "in", frame = %String::from_utf8_lossy(&frame), "protocol");
        }
        let Some(reply) = session.handle_frame(&frame).await else {
            continue;
        };
        if options.protocol_trace {
            info!(direction = "out", frame = %reply, "protocol");
        }
        let mode = decoder.mode().unwrap_or(FrameMode::ContentLength);
        writer.write_all(&encode_frame(mode, reply.as_bytes())).await?;
        writer.flush().await?;
    }
}

async fn write_event<W: AsyncWrite + Unpin>(
    writer: &mut W,
    mode: FrameMode,
    envelope: &WireEnvelope,
    options: StreamOptions,
) -> Result<(), TransportError> {
    let body = match event_notification(envelope).and_then(|n| serde_json::to_string(&n)) {
        Ok(body) => body,
        Err(e) => {
            warn!(%e, "failed to encode event notification");
            return Ok(());
        }
    };
    if options.protocol_trace {
        info!(direction = "out", frame = %body, "protocol");
    }
    writer.write_all(&encode_frame(mode, body.as_bytes())).await?;
    writer.flush().await?;
    Ok(())
}
