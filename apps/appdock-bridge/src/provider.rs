//! Seams to the container runtime.
//!
//! The relay and bridge only ever see these traits; [`crate::docker`] holds
//! the production implementation and tests plug in in-memory fakes.

use std::{io, pin::Pin};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::TerminalSize;

/// Raw log output; ends when the producing container stops.
pub type LogStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("container {0} not found")]
    NotFound(String),
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ProviderError::NotFound(_) => "not_found",
            ProviderError::Unavailable(_) => "unavailable",
        }
    }
}

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Opens a following log stream for `container_id`.
    async fn open(&self, container_id: &str) -> Result<LogStream, ProviderError>;
}

/// An exec instance created inside a container but not yet attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecHandle {
    pub id: String,
    pub container_id: String,
}

/// Both halves of an attached shell. Dropping it (or shutting `input` down)
/// releases the attachment.
pub struct ShellAttachment {
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: Pin<Box<dyn AsyncRead + Send>>,
}

#[async_trait]
pub trait ShellProvider: Send + Sync {
    async fn create(&self, container_id: &str) -> Result<ExecHandle, ProviderError>;

    async fn attach(&self, handle: &ExecHandle) -> Result<ShellAttachment, ProviderError>;

    async fn resize(&self, handle: &ExecHandle, size: TerminalSize) -> Result<(), ProviderError>;
}
