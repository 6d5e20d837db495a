//! TCP front end for the bastion.
//!
//! Connections carry exactly one request: read a bounded JSON line,
//! dispatch it, write the response line, close. Malformed lines get a
//! structured `invalid` response rather than a dropped connection.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bastion::protocol::{BastionRequest, BastionResponse};
use crate::bastion::service::BastionService;
use crate::constants::{BASTION_OP_TIMEOUT, MAX_LINE_LEN};
use crate::error::{Error, Result};

/// Serves the bastion RPC until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    service: Arc<BastionService>,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    info!(address = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "bastion listening");

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, service).await {
                        debug!(peer = %peer, error = %e, "connection ended with error");
                    }
                });
            }
            () = &mut shutdown => {
                info!("bastion listener stopping");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, service: Arc<BastionService>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).take(MAX_LINE_LEN as u64);

    let mut line = String::new();
    let read = timeout(BASTION_OP_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| Error::timeout("request read", BASTION_OP_TIMEOUT))??;

    if read == 0 {
        return Ok(());
    }
    if read >= MAX_LINE_LEN {
        let resp = BastionResponse::invalid("request line too long");
        writer.write_all(resp.to_json_line().as_bytes()).await?;
        return Ok(());
    }

    let response = match serde_json::from_str::<BastionRequest>(line.trim()) {
        Ok(request) => {
            match timeout(BASTION_OP_TIMEOUT, service.handle(request)).await {
                Ok(resp) => resp,
                Err(_) => BastionResponse::invalid(format!(
                    "operation timed out after {BASTION_OP_TIMEOUT:?}"
                )),
            }
        }
        Err(e) => BastionResponse::invalid(format!("malformed request: {e}")),
    };

    writer.write_all(response.to_json_line().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
