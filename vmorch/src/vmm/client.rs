//! Control-surface client.
//!
//! `ControlSurface` is the raw request/response seam: one HTTP exchange with
//! the VMM. `ControlClient` layers the per-call timeout and the status/body
//! interpretation on top of it, so every caller sees failures as a
//! `StepFailure`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use vmorch_shared::errors::StepFailure;

use super::api::Fault;

/// Raw response of one control call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ControlResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn no_content() -> Self {
        Self::new(204, Vec::new())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `fault_message` of an error body, or the raw text if it is not a
    /// fault document.
    pub fn fault_message(&self) -> Option<String> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match serde_json::from_slice::<Fault>(&self.body) {
            Ok(fault) => Some(fault.fault_message),
            Err(_) => Some(String::from_utf8_lossy(&self.body).trim().to_string()),
        }
    }

    /// Parse the body as JSON. An empty body is `Value::Null`.
    pub fn json(&self) -> Result<Value, StepFailure> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.body).map_err(|e| StepFailure::MalformedBody(e.to_string()))
    }
}

/// One request/response exchange with the VMM control endpoint.
///
/// Implementations only report transport-level failures; status codes are
/// interpreted by [`ControlClient`].
#[async_trait]
pub trait ControlSurface: Send + Sync {
    async fn request(
        &self,
        method: Method,
        resource: &str,
        payload: Option<&Value>,
    ) -> Result<ControlResponse, StepFailure>;
}

#[derive(Clone)]
pub struct ControlClient {
    surface: Arc<dyn ControlSurface>,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(surface: Arc<dyn ControlSurface>, timeout: Duration) -> Self {
        Self { surface, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one call and return its response if it succeeded.
    ///
    /// A 2xx response with a non-JSON body is treated as malformed.
    pub async fn send(
        &self,
        method: Method,
        resource: &str,
        payload: Option<&Value>,
    ) -> Result<ControlResponse, StepFailure> {
        let response = tokio::time::timeout(
            self.timeout,
            self.surface.request(method.clone(), resource, payload),
        )
        .await
        .map_err(|_| StepFailure::Timeout(self.timeout))??;

        tracing::trace!(%method, resource, status = response.status, "Control call completed");

        if !response.is_success() {
            return Err(StepFailure::Status {
                status: response.status,
                fault: response.fault_message(),
            });
        }

        response.json()?;
        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, resource: &str) -> Result<T, StepFailure> {
        let response = self.send(Method::GET, resource, None).await?;
        serde_json::from_slice(&response.body)
            .map_err(|e| StepFailure::MalformedBody(e.to_string()))
    }
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
