//! TCP links
//!
//! Direct TCP carries framed bytes both ways with no handshake. A relay hub
//! connection first sends one login line and waits for the hub's verdict:
//!
//! ```text
//! -> VESCTOOL:<device_id>:<password>\n
//! <- OK\n               login accepted, stream is now the device
//! <- FAIL <reason>\n    login rejected
//! ```
//!
//! Bytes the hub sends after the verdict line belong to the device and are
//! delivered as the first [`LinkEvent::Bytes`](super::LinkEvent::Bytes).

use super::{LinkReceiver, StreamLink};
use crate::config::NetworkConfig;
use crate::error::TransportError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Longest verdict line accepted from a hub
const MAX_LOGIN_REPLY: usize = 256;

async fn connect_stream(
    host: &str,
    port: u16,
    config: &NetworkConfig,
) -> Result<TcpStream, TransportError> {
    if host.is_empty() || port == 0 {
        return Err(TransportError::InvalidEndpoint(format!("{}:{}", host, port)));
    }

    let endpoint = format!("{}:{}", host, port);
    let stream = timeout(config.connect_timeout(), TcpStream::connect((host, port)))
        .await
        .map_err(|_| TransportError::Open {
            endpoint: endpoint.clone(),
            reason: format!("no answer within {:?}", config.connect_timeout()),
        })?
        .map_err(|e| TransportError::Open {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY on {}: {}", endpoint, e);
    }
    Ok(stream)
}

/// Connect directly to a controller or bridge
pub async fn open(
    host: &str,
    port: u16,
    config: &NetworkConfig,
) -> Result<(StreamLink, LinkReceiver), TransportError> {
    let stream = connect_stream(host, port, config).await?;
    tracing::info!("TCP connected to {}:{}", host, port);
    Ok(StreamLink::spawn(stream, Vec::new()))
}

/// Connect through a relay hub and log in as a client of `device_id`
pub async fn open_hub(
    server: &str,
    port: u16,
    device_id: &str,
    password: &str,
    config: &NetworkConfig,
) -> Result<(StreamLink, LinkReceiver), TransportError> {
    if device_id.is_empty() || device_id.contains(':') || device_id.contains('\n') {
        return Err(TransportError::InvalidEndpoint(format!(
            "Invalid hub device id: {:?}",
            device_id
        )));
    }

    let mut stream = connect_stream(server, port, config).await?;
    let leftover = timeout(
        config.hub_login_timeout(),
        login(&mut stream, device_id, password),
    )
    .await
    .map_err(|_| TransportError::HubAuthRejected("no login reply".to_string()))??;

    tracing::info!("Logged in to hub {}:{} as {}", server, port, device_id);
    Ok(StreamLink::spawn(stream, leftover))
}

/// Run the login exchange, returning bytes received after the verdict line
async fn login<S>(stream: &mut S, device_id: &str, password: &str) -> Result<Vec<u8>, TransportError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let line = format!("VESCTOOL:{}:{}\n", device_id, password);
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;

    let mut received = Vec::new();
    let mut chunk = [0u8; 64];
    let newline = loop {
        if let Some(pos) = received.iter().position(|&b| b == b'\n') {
            break pos;
        }
        if received.len() > MAX_LOGIN_REPLY {
            return Err(TransportError::HubAuthRejected(
                "login reply too long".to_string(),
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::HubAuthRejected(
                "hub closed the connection".to_string(),
            ));
        }
        received.extend_from_slice(&chunk[..n]);
    };

    let verdict = String::from_utf8_lossy(&received[..newline]);
    let verdict = verdict.trim_end_matches('\r');
    if verdict == "OK" {
        Ok(received[newline + 1..].to_vec())
    } else if let Some(reason) = verdict.strip_prefix("FAIL") {
        let reason = reason.trim();
        Err(TransportError::HubAuthRejected(if reason.is_empty() {
            "login refused".to_string()
        } else {
            reason.to_string()
        }))
    } else {
        Err(TransportError::HubAuthRejected(format!(
            "unexpected reply {:?}",
            verdict
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LinkEvent;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    async fn hub_replying(reply: &'static [u8]) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(socket);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(reply).await.unwrap();
            // keep the socket open long enough for the client to read
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            line
        });
        (port, task)
    }

    #[tokio::test]
    async fn test_hub_login_accepts_and_forwards_leftover() {
        let (port, hub) = hub_replying(b"OK\n\x02\x01").await;
        let (_link, mut rx) = open_hub(
            "127.0.0.1",
            port,
            "board1",
            "pw",
            &NetworkConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(hub.await.unwrap(), "VESCTOOL:board1:pw\n");
        assert_eq!(rx.recv().await, Some(LinkEvent::Bytes(vec![0x02, 0x01])));
    }

    #[tokio::test]
    async fn test_hub_login_rejected() {
        let (port, _hub) = hub_replying(b"FAIL bad password\n").await;
        let err = open_hub("127.0.0.1", port, "board1", "wrong", &NetworkConfig::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::HubAuthRejected("bad password".to_string())
        );
    }

    #[tokio::test]
    async fn test_hub_rejects_bad_device_id() {
        let err = open_hub("127.0.0.1", 1, "a:b", "", &NetworkConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidEndpoint(_)));
    }

    #[tokio::test]
    async fn test_direct_tcp_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = open("127.0.0.1", port, &NetworkConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Open { .. }));
    }
}
