use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use super::{StreamOptions, serve_stream};
use crate::hub::Hub;

/// Accepts raw socket connections and serves each on its own task.
pub async fn run_tcp_acceptor(listener: TcpListener, hub: Arc<Hub>, options: StreamOptions) {
    info!(max_frame_bytes = options.max_frame_bytes, "raw socket transport accepting");
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "socket connection accepted");
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(%addr, %e, "failed to set TCP_NODELAY");
                }
                let hub = hub.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    match serve_stream(reader, writer, hub, options).await {
                        Ok(()) => info!(%addr, "socket connection closed"),
                        Err(e) => warn!(%addr, %e, "socket connection closed with error"),
                    }
                });
            }
            Err(e) => {
                warn!(%e, "socket accept failed");
            }
        }
    }
}
