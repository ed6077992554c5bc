//! The listening socket: forward proxy plus admin mux on one port.
//!
//! Per-request dispatch:
//!
//! - `CONNECT` goes to the [`ConnectHandler`] seam. TLS interception is an
//!   external collaborator; the built-in [`PassthroughTunnel`] relays bytes
//!   blind so HTTPS clients keep working without it.
//! - Absolute-form requests (`GET http://host/path`) enter the pipeline.
//! - Origin-form requests are served by the admin router.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tower::ServiceExt;
use tracing::{debug, info, warn};
use url::Url;

use architeuthis_core::types::ProxiedRequest;
use architeuthis_core::{PipelineError, ProxyBody};

use crate::app::App;

/// Seam for the CONNECT path. The production deployment plugs a TLS MITM
/// implementation in here so policy sees the inner HTTPS requests.
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    async fn handle_connect(&self, request: Request<Incoming>) -> Response<Body>;
}

/// Relays CONNECT bytes without interception.
pub struct PassthroughTunnel;

#[async_trait]
impl ConnectHandler for PassthroughTunnel {
    async fn handle_connect(&self, request: Request<Incoming>) -> Response<Body> {
        let Some(authority) = request.uri().authority().map(ToString::to_string) else {
            return plain_response(StatusCode::BAD_REQUEST, "CONNECT requires an authority");
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(request).await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    match TcpStream::connect(&authority).await {
                        Ok(mut origin) => {
                            if let Err(e) =
                                tokio::io::copy_bidirectional(&mut client, &mut origin).await
                            {
                                debug!(authority, error = %e, "tunnel closed");
                            }
                        }
                        Err(e) => warn!(authority, error = %e, "tunnel connect failed"),
                    }
                }
                Err(e) => warn!(error = %e, "connect upgrade failed"),
            }
        });

        Response::new(Body::empty())
    }
}

/// One listener serving the proxy and the admin mux.
pub struct ProxyServer {
    app: Arc<App>,
    admin: Router,
    connect: Arc<dyn ConnectHandler>,
}

impl ProxyServer {
    #[must_use]
    pub fn new(app: Arc<App>, admin: Router, connect: Arc<dyn ConnectHandler>) -> Self {
        Self { app, admin, connect }
    }

    /// Accept loop; returns when the shutdown channel fires.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot bind.
    pub async fn run(
        self: Arc<Self>,
        addr: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "started web proxy");

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
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |request| {
                            let server = Arc::clone(&server);
                            async move { Ok::<_, Infallible>(server.dispatch(request).await) }
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            debug!(%peer, error = %e, "connection ended");
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch(&self, request: Request<Incoming>) -> Response<Body> {
        if request.method() == Method::CONNECT {
            return self.connect.handle_connect(request).await;
        }

        // A scheme in the request target means absolute form: the client is
        // using us as its forward proxy.
        if request.uri().scheme().is_some() {
            return self.forward(request).await;
        }

        match self.admin.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    async fn forward(&self, request: Request<Incoming>) -> Response<Body> {
        let (parts, body) = request.into_parts();

        let url = match Url::parse(&parts.uri.to_string()) {
            Ok(url) => url,
            Err(e) => {
                return plain_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid request target: {e}"),
                )
            }
        };

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return plain_response(
                    StatusCode::BAD_REQUEST,
                    &format!("failed to read request body: {e}"),
                )
            }
        };

        let proxied = ProxiedRequest::new(parts.method, url, parts.headers, body);
        match self.app.pipeline().handle(proxied).await {
            Ok(response) => {
                let mut builder = Response::builder().status(response.status);
                if let Some(headers) = builder.headers_mut() {
                    *headers = response.headers;
                }
                let body = match response.body {
                    ProxyBody::Buffered(bytes) => Body::from(bytes),
                    ProxyBody::Streaming(upstream) => Body::from_stream(upstream.bytes_stream()),
                };
                builder.body(body).unwrap_or_else(|e| {
                    plain_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("response assembly failed: {e}"),
                    )
                })
            }
            Err(error) => pipeline_error_response(&error),
        }
    }
}

fn pipeline_error_response(error: &PipelineError) -> Response<Body> {
    plain_response(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string())
}

fn plain_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(Bytes::from(message.to_string())))
        .expect("static response must build")
}
