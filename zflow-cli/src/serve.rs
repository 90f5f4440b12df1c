//! `zflow serve`: an echo peer for the exercisers.

use anyhow::{Context, Result};
use zflow::transport::TcpServer;
use zflow::{Config, Handler, IncomingRequest, Reply};

/// Answers requests with their own body and echoes stream data back.
struct Echo;

impl Handler for Echo {
    async fn respond(&self, request: IncomingRequest) -> Reply {
        tracing::info!(method = %request.method, uri = %request.uri, len = request.body.len(), "request");
        let content_type = request
            .header("Content-Type")
            .unwrap_or("application/octet-stream")
            .to_owned();
        Reply::new(200, "OK")
            .header("Content-Type", content_type)
            .header("X-Echo-Method", request.method)
            .body(request.body)
    }

    fn on_stream_data(&self, uri: &str, data: &[u8]) -> Option<Vec<u8>> {
        tracing::debug!(uri, len = data.len(), "stream data");
        Some(data.to_vec())
    }
}

pub async fn run(listen: &str, config: Config) -> Result<()> {
    let transport = TcpServer::bind(listen)
        .await
        .with_context(|| format!("cannot listen on {listen}"))?;
    eprintln!("listening on {}", transport.local_addr());
    tokio::select! {
        served = zflow::serve(transport, config, Echo) => served?,
        _ = tokio::signal::ctrl_c() => eprintln!("interrupted"),
    }
    Ok(())
}
