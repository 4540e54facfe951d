//! Health and metrics listener

use emitter_core::PrometheusMetrics;
use http_body_util::Full;
use hyper::{body::Bytes, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn respond(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_request<B>(
    req: Request<B>,
    metrics: Arc<PrometheusMetrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => respond(StatusCode::OK, "text/plain", "OK\n".to_string()),
        (&Method::GET, "/metrics") => match metrics.gather() {
            Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
            Err(e) => {
                warn!(error = %e, "Failed to gather metrics");
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    "Failed to gather metrics\n".to_string(),
                )
            }
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found\n".to_string()),
    };
    Ok(response)
}

/// Serve `/healthz` and `/metrics` until cancelled
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<PrometheusMetrics>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!(address = %listener.local_addr()?, "Health listener started");

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Error accepting health connection");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, metrics.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving health connection from {}: {}", peer_addr, e);
            }
        });
    }

    Ok(())
}
