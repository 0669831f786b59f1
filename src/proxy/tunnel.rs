//! CONNECT tunnel implementation for HTTPS proxying
//!
//! Handles bidirectional data transfer between client and target server.

use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::proxy::transport::EgressDialer;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Handles CONNECT tunnel requests
pub struct TunnelHandler;

impl TunnelHandler {
    /// Dial the CONNECT target from the egress address
    pub async fn connect(dialer: &EgressDialer, host: &str, port: u16) -> Result<TcpStream> {
        debug!("Establishing tunnel to {}:{}", host, port);
        dialer.connect(host, port).await
    }

    /// Wait for the client connection to be handed over, then relay until
    /// either side closes
    #[instrument(skip(on_upgrade, server))]
    pub async fn serve(on_upgrade: OnUpgrade, server: TcpStream, target: String) {
        match on_upgrade.await {
            Ok(upgraded) => {
                let client = TokioIo::new(upgraded);
                let (sent, received) = Self::relay(client, server).await;
                debug!(
                    bytes_sent = sent,
                    bytes_received = received,
                    "Tunnel closed"
                );
            }
            Err(e) => {
                debug!("CONNECT upgrade failed: {}", e);
            }
        }
    }

    /// Copy data bidirectionally between two streams
    ///
    /// Each direction runs in its own task. Whichever finishes first cancels
    /// the other, and both streams are closed once both tasks have stopped.
    /// Returns `(client_to_server, server_to_client)` byte counts.
    pub async fn relay<C, S>(client: C, server: S) -> (u64, u64)
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let cancel = CancellationToken::new();

        let client_to_server = tokio::spawn(copy_until_cancelled(
            client_read,
            server_write,
            cancel.clone(),
        ));
        let server_to_client = tokio::spawn(copy_until_cancelled(
            server_read,
            client_write,
            cancel.clone(),
        ));

        let (sent, received) = tokio::join!(client_to_server, server_to_client);

        (sent.unwrap_or_default(), received.unwrap_or_default())
    }
}

async fn copy_until_cancelled<R, W>(mut reader: R, mut writer: W, cancel: CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Cancels the sibling direction on every exit path
    let _guard = cancel.clone().drop_guard();

    let mut copied = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    let pump = async {
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Tunnel read ended: {}", e);
                    break;
                }
            };
            if let Err(e) = writer.write_all(&buf[..n]).await {
                debug!("Tunnel write ended: {}", e);
                break;
            }
            copied += n as u64;
        }
    };

    tokio::select! {
        _ = pump => {}
        _ = cancel.cancelled() => {}
    }

    let _ = writer.shutdown().await;
    copied
}
