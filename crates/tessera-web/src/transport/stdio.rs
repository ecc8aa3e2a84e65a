use std::sync::Arc;

use tracing::info;

use super::{StreamOptions, TransportError, serve_stream};
use crate::hub::Hub;

/// Serves a single session on stdin/stdout. Logs go to stderr, so stdout
/// carries nothing but frames.
pub async fn run_stdio(hub: Arc<Hub>, options: StreamOptions) -> Result<(), TransportError> {
    info!("serving JSON-RPC on stdio");
    let result = serve_stream(tokio::io::stdin(), tokio::io::stdout(), hub, options).await;
    info!("stdin closed");
    result
}
