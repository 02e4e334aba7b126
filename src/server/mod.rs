//! HTTP server for the tus protocol
//!
//! Built on `hyper` and `tokio`: each accepted connection is served by an
//! HTTP/1.1 connection task; requests are routed by [`TusRequestParser`] and
//! answered by the shared [`ProtocolHandler`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tus_server::protocol::ProtocolHandler;
//! use tus_server::registry::UploadRegistry;
//! use tus_server::server::TusServer;
//! use tus_server::storage::FileStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = FileStore::open("/tmp/tus-uploads").await?;
//! let handler = ProtocolHandler::new(
//!     Arc::new(UploadRegistry::new()),
//!     Arc::new(store),
//!     "/files",
//!     1 << 30,
//! );
//! let server = TusServer::new("127.0.0.1:0", handler).await?;
//! println!("Listening on {}", server.local_addr());
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::protocol::headers::TUS_RESUMABLE;
use crate::protocol::{ProtocolError, ProtocolHandler, TusResponse, TUS_RESUMABLE_VERSION};
use crate::router::{RouterError, TusRequestParser, TusRoute};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    RuntimeError(String),
}

/// tus upload server
pub struct TusServer {
    handler: Arc<ProtocolHandler>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TusServer {
    /// Bind to `address` immediately; port 0 lets the OS pick a port
    pub async fn new(address: &str, handler: ProtocolHandler) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address '{}': {}", address, e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        info!("Server bound to {}", local_addr);

        Ok(Self {
            handler: Arc::new(handler),
            listener,
            local_addr,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the task is dropped.
    ///
    /// Connection errors are logged and never stop the accept loop.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            base_path = self.handler.base_path(),
            max_size = self.handler.max_size(),
            "Starting tus server on {}",
            self.local_addr
        );

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let handler = Arc::clone(&self.handler);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move { Ok::<_, Infallible>(handle_request(req, &handler).await) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving connection from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Route a request and dispatch it to the protocol handler
#[tracing::instrument(
    name = "http.request",
    skip_all,
    fields(http.method = %req.method(), http.path = %req.uri().path(), http.status = tracing::field::Empty)
)]
async fn handle_request(req: Request<Incoming>, handler: &ProtocolHandler) -> TusResponse {
    let (parts, body) = req.into_parts();

    let route = TusRequestParser::parse(&parts.method, parts.uri.path(), &parts.headers, handler.base_path());

    let response = match route {
        Err(e) => route_error(e),
        Ok(TusRoute::Health) => plain(StatusCode::OK, "ok"),
        Ok(route) => match read_body(body, &parts.headers, handler.max_size()).await {
            Ok(body) => dispatch(handler, route, &parts.headers, body).await,
            Err(e) => e.into_response(),
        },
    };

    tracing::Span::current().record("http.status", response.status().as_u16());
    info!(status = response.status().as_u16(), "Handled {} {}", parts.method, parts.uri.path());
    response
}

/// Read the whole request body, refusing anything above `max_size`.
///
/// A declared `Content-Length` over the limit is refused before any byte is
/// read; bodies without one are cut off once they pass the limit.
async fn read_body<B>(body: B, headers: &hyper::HeaderMap, max_size: u64) -> Result<Bytes, ProtocolError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.is_some_and(|len| len > max_size) {
        return Err(ProtocolError::SizeExceeded { max: max_size });
    }

    let limit = usize::try_from(max_size).unwrap_or(usize::MAX);
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(ProtocolError::SizeExceeded { max: max_size })
        }
        Err(e) => Err(ProtocolError::MalformedRequest(format!("Failed to read body: {}", e))),
    }
}

async fn dispatch(
    handler: &ProtocolHandler,
    route: TusRoute,
    headers: &hyper::HeaderMap,
    body: Bytes,
) -> TusResponse {
    match route {
        TusRoute::Create => handler.create(headers).await,
        TusRoute::Options => handler.options(),
        TusRoute::Head { id } => handler.head(&id, headers).await,
        TusRoute::Patch { id } => handler.patch(&id, headers, body).await,
        TusRoute::Get { id } => handler.get(&id).await,
        TusRoute::Health => plain(StatusCode::OK, "ok"),
    }
}

fn route_error(e: RouterError) -> TusResponse {
    let mut response = plain(e.status(), &e.to_string());
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(TUS_RESUMABLE),
        HeaderValue::from_static(TUS_RESUMABLE_VERSION),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn plain(status: StatusCode, body: &str) -> TusResponse {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
