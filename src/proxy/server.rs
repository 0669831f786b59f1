//! Proxy server implementation using hyper
//!
//! Accepts client connections and routes each request either to the proxy
//! handler or to the proxy's own endpoints.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ProxyServerConfig;
use crate::error::Result;
use crate::proxy::handler::ProxyHandler;

/// How long in-flight connections get to finish after shutdown
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    handler: Arc<ProxyHandler>,
    router: Router,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyServerConfig, handler: Arc<ProxyHandler>, router: Router) -> Self {
        Self {
            config,
            handler,
            router,
        }
    }

    /// Bind the configured address and run until shutdown
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("Proxy server listening on {}", self.config.listen_addr);

        self.serve(listener, shutdown).await
    }

    /// Run the accept loop on an already bound listener
    ///
    /// Stops accepting once `shutdown` flips to true, asks open connections
    /// to close gracefully, and waits up to [`DRAIN_TIMEOUT`] for them.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let tracker = TaskTracker::new();
        let builder = self.connection_builder();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            let router = self.router.clone();
                            let builder = builder.clone();
                            let shutdown = shutdown.clone();

                            tracker.spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    client_addr,
                                    handler,
                                    router,
                                    builder,
                                    shutdown,
                                ).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                open_connections = tracker.len(),
                "Drain timeout elapsed, abandoning open connections"
            );
        }

        Ok(())
    }

    /// HTTP/1.1 settings shared by every client connection
    ///
    /// No automatic `Date` header, so a CONNECT success is exactly the
    /// status line and a blank line.
    fn connection_builder(&self) -> http1::Builder {
        let mut builder = http1::Builder::new();
        builder
            .preserve_header_case(true)
            .title_case_headers(true)
            .auto_date_header(false)
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.header_read_timeout());
        builder
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
        router: Router,
        builder: http1::Builder,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let router = router.clone();

            async move {
                if ProxyHandler::is_proxy_request(&req) {
                    debug!(client = %client_addr, "Proxy request");
                    Ok::<_, Infallible>(handler.handle(req).await)
                } else {
                    router.oneshot(req).await
                }
            }
        });

        let conn = builder.serve_connection(io, service).with_upgrades();
        tokio::pin!(conn);

        // The watch guard must not outlive this future
        let stop_requested = async {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };

        let served = tokio::select! {
            res = conn.as_mut() => res,
            _ = stop_requested => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        served?;

        Ok(())
    }
}
