//! Transport to the VMM control surface.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Where the VMM control endpoint listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Transport {
    /// Local unix domain socket (the usual `--api-sock`).
    Unix { socket_path: PathBuf },
    /// Plain TCP, `host:port`.
    Tcp { addr: String },
}

impl Transport {
    pub fn unix(socket_path: impl Into<PathBuf>) -> Self {
        Self::Unix {
            socket_path: socket_path.into(),
        }
    }

    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::Tcp { addr: addr.into() }
    }

    /// Socket path for unix transports.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Transport::Unix { socket_path } => Some(socket_path),
            Transport::Tcp { .. } => None,
        }
    }

    /// Value of the HTTP `Host` header for requests on this transport.
    pub fn authority(&self) -> &str {
        match self {
            Transport::Unix { .. } => "localhost",
            Transport::Tcp { addr } => addr,
        }
    }

    pub fn to_uri(&self) -> String {
        match self {
            Transport::Unix { socket_path } => format!("unix://{}", socket_path.display()),
            Transport::Tcp { addr } => format!("tcp://{}", addr),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}
