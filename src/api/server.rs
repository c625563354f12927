//! Line-delimited JSON over TCP.
//!
//! Each line a client sends is one [`Request`](super::Request); each line the
//! server writes back is the matching [`Response`]. One task per connection;
//! requests on a connection are answered in order.
//!
//! A line longer than the configured cap is answered with `bad_request` and
//! the connection is closed, since the rest of that line cannot be framed.

use super::{BAD_REQUEST, Response, SandboxService, dispatch_json};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tracing::{debug, info, warn};

/// Accept connections until the listener fails; request lines are capped at
/// `max_request_bytes`.
pub async fn serve(
    listener: TcpListener,
    service: SandboxService,
    max_request_bytes: usize,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening for requests on {}", addr);
    }

    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, &service, max_request_bytes).await {
                warn!("Connection from {} failed: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: &SandboxService,
    max_request_bytes: usize,
) -> std::io::Result<()> {
    debug!("Accepted connection from {}", peer);
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let limit = u64::try_from(max_request_bytes).unwrap_or(u64::MAX).saturating_add(1);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if (&mut reader).take(limit).read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let terminated = buf.last() == Some(&b'\n');
        if !terminated && buf.len() > max_request_bytes {
            warn!(
                "Request from {} exceeds {} bytes, closing connection",
                peer, max_request_bytes
            );
            let message = format!("request line exceeds {max_request_bytes} bytes");
            respond(&mut writer, &Response::error(BAD_REQUEST, message)).await?;
            break;
        }

        let response = match std::str::from_utf8(&buf) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => dispatch_json(service, line.trim_end_matches(['\r', '\n'])).await,
            Err(e) => Response::error(BAD_REQUEST, format!("request is not UTF-8: {e}")),
        };
        respond(&mut writer, &response).await?;
    }

    debug!("Connection from {} closed", peer);
    Ok(())
}

async fn respond(writer: &mut OwnedWriteHalf, response: &Response) -> std::io::Result<()> {
    let mut encoded = encode(response);
    encoded.push('\n');
    writer.write_all(encoded.as_bytes()).await
}

fn encode(response: &Response) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        format!(r#"{{"error":{{"code":"internal","message":"{}"}}}}"#, e.to_string().escape_default())
    })
}
