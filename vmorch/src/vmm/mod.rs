//! VMM control surface: wire models, clients and the optional owned process.

pub mod api;
mod client;
mod http;
mod process;

pub use client::{ControlClient, ControlResponse, ControlSurface};
pub use http::HttpControlSurface;
pub use process::{VmmLaunch, VmmProcess};
