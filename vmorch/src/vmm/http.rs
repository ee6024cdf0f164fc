//! HTTP/1.1 control surface over a unix socket or TCP.
//!
//! One connection per call.

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use vmorch_shared::errors::StepFailure;
use vmorch_shared::transport::Transport;

use super::client::{ControlResponse, ControlSurface};

#[derive(Debug, Clone)]
pub struct HttpControlSurface {
    transport: Transport,
}

impl HttpControlSurface {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    fn build_request(
        &self,
        method: Method,
        resource: &str,
        payload: Option<&Value>,
    ) -> Result<Request<Full<Bytes>>, StepFailure> {
        let authority = self.transport.authority();
        let builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", authority, resource))
            .header("Host", authority)
            .header("Accept", "application/json");

        let request = match payload {
            Some(payload) => {
                let body = serde_json::to_vec(payload)
                    .map_err(|e| StepFailure::MalformedBody(e.to_string()))?;
                builder
                    .header("Content-Type", "application/json")
                    .header("Content-Length", body.len())
                    .body(Full::new(Bytes::from(body)))
            }
            None => builder.body(Full::new(Bytes::new())),
        };

        request.map_err(|e| StepFailure::Connect(format!("failed to build request: {}", e)))
    }
}

#[async_trait]
impl ControlSurface for HttpControlSurface {
    async fn request(
        &self,
        method: Method,
        resource: &str,
        payload: Option<&Value>,
    ) -> Result<ControlResponse, StepFailure> {
        let request = self.build_request(method, resource, payload)?;

        match &self.transport {
            #[cfg(unix)]
            Transport::Unix { socket_path } => {
                let stream = tokio::net::UnixStream::connect(socket_path)
                    .await
                    .map_err(|e| {
                        StepFailure::Connect(format!("{}: {}", socket_path.display(), e))
                    })?;
                exchange(stream, request).await
            }
            #[cfg(not(unix))]
            Transport::Unix { socket_path } => Err(StepFailure::Connect(format!(
                "{}: unix sockets are not supported on this platform",
                socket_path.display()
            ))),
            Transport::Tcp { addr } => {
                let stream = TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|e| StepFailure::Connect(format!("{}: {}", addr, e)))?;
                exchange(stream, request).await
            }
        }
    }
}

async fn exchange<S>(stream: S, request: Request<Full<Bytes>>) -> Result<ControlResponse, StepFailure>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| StepFailure::Connect(format!("HTTP handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("Control connection closed: {}", e);
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| StepFailure::Connect(format!("request failed: {}", e)))?;

    let status = response.status().as_u16();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| StepFailure::Connect(format!("failed to read response: {}", e)))?
        .to_bytes();

    Ok(ControlResponse::new(status, body.to_vec()))
}
