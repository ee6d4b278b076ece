//! HTTP server loop: accept connections, serve them over HTTP/1.1, and
//! drain in-flight requests on shutdown.

use crate::access_log::AccessLog;
use crate::extensions::{RequestExt, SocketInfo};
use crate::handler::Handler;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Bind `listen` and serve `handler` until SIGINT or SIGTERM arrives,
/// then wait up to `graceful_timeout` for in-flight connections.
///
/// Each connection gets a [`SocketInfo`] extension on its requests and an
/// access-log line per completed response. Connection-level errors are
/// logged and never tear the process down.
pub async fn run<H>(
    handler: Arc<H>,
    access_log: Arc<AccessLog>,
    listen: SocketAddr,
    graceful_timeout: Duration,
) -> std::io::Result<()>
where
    H: Handler<Incoming, Error = Infallible> + 'static,
{
    let listener = TcpListener::bind(listen).await?;
    info!(listen = %listener.local_addr()?, "listening");

    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let local = stream.local_addr().ok();
                let io = TokioIo::new(stream);
                let handler = Arc::clone(&handler);
                let access_log = Arc::clone(&access_log);

                let service = service_fn(move |mut request: http::Request<Incoming>| {
                    let handler = Arc::clone(&handler);
                    let access_log = Arc::clone(&access_log);
                    async move {
                        request.set_socket_info(SocketInfo::new(local, Some(remote)));
                        let method = request.method().clone();
                        let uri = request.uri().clone();
                        let response = handler.handle(request).await?;
                        access_log.record(remote, &method, &uri, response.status());
                        Ok::<_, Infallible>(response)
                    }
                });

                let connection = http1::Builder::new().serve_connection(io, service);
                let connection = graceful.watch(connection);
                // A panicking handler only resets its own connection.
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        debug!(error = %err, "connection error");
                    }
                });
            }
            () = &mut shutdown => break,
        }
    }

    info!("shutting down, draining in-flight requests");
    tokio::select! {
        () = graceful.shutdown() => info!("all connections drained"),
        () = tokio::time::sleep(graceful_timeout) => {
            warn!("graceful timeout expired, aborting remaining connections");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
