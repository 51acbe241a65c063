//! HTTP state endpoint
//!
//! Serves a read-only JSON snapshot of the router's bonds and session table
//! at `GET /state`. No mutation routes exist.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use braid_router::Router;

/// Bind and serve the state endpoint; returns the bound address and the
/// accept task handle.
pub async fn serve_state(
    addr: SocketAddr,
    router: Router,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(%local, "state endpoint listening");

    let handle = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("state endpoint accept failed: {}", e);
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let router = router.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let router = router.clone();
                    async move { handle_request(req, router) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("state endpoint connection error: {}", e);
                }
            });
        }
    });
    Ok((local, handle))
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    router: Router,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/state") => {
            let state = router.state();
            match serde_json::to_vec_pretty(&state) {
                Ok(body) => Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap(),
                Err(e) => Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from(format!("{}", e))))
                    .unwrap(),
            }
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap(),
    };
    Ok(response)
}
