//! Request/reply channels to a remote endpoint.
//!
//! A [`Connector`] knows one endpoint address and opens fresh [`Channel`]s to
//! it. A channel carries encoded codec frames, one request and one reply at a
//! time. After a poll times out the channel is stale: it must be discarded and
//! replaced, never reused, so a late reply cannot be paired with a later
//! request.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::framing::{FrameBuffer, FramingConfig, FramingError, write_frame};
use crate::socket::{SocketOptions, configure_stream, set_discard_on_close};

/// Result of waiting for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A complete reply is buffered; [`Channel::receive`] returns it at once.
    Ready,
    /// Nothing arrived within the timeout.
    TimedOut,
}

/// Errors raised by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Opening a channel failed.
    #[error("connect to {address} failed: {source}")]
    Connect {
        /// Endpoint address as configured.
        address: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Reading or writing a frame failed.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// The channel timed out earlier and may still receive a late reply.
    #[error("channel is stale after a timeout and must be discarded")]
    Stale,
}

/// One open request/reply channel.
#[async_trait]
pub trait Channel: Send + 'static {
    /// Send one encoded frame.
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for a reply to become available.
    async fn poll_reply(&mut self, timeout: Duration) -> Result<PollOutcome, TransportError>;

    /// Take the next reply frame.
    async fn receive(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Close the channel, dropping unsent data and ignoring late replies.
    fn discard(self)
    where
        Self: Sized;
}

/// Opens channels to one endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Channel type produced by [`Connector::connect`].
    type Channel: Channel;

    /// Endpoint address, for logs and errors.
    fn address(&self) -> &str;

    /// Open a fresh channel.
    async fn connect(&self) -> Result<Self::Channel, TransportError>;
}

/// Connector for `host:port` TCP endpoints.
///
/// Accepts an optional `tcp://` scheme prefix on the address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    framing: FramingConfig,
    options: SocketOptions,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Default bound on establishing a TCP connection. A
    /// [`ReliableClient`](crate::ReliableClient) also cuts a connect off at
    /// its attempt deadline, whichever comes first.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2500);

    /// Connector with default framing and socket options.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            framing: FramingConfig::default(),
            options: SocketOptions::default(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Replace the framing limits.
    pub fn with_framing(mut self, framing: FramingConfig) -> Self {
        self.framing = framing;
        self
    }

    /// Replace the bound on establishing a connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn target(&self) -> &str {
        self.address
            .strip_prefix("tcp://")
            .unwrap_or(&self.address)
    }

    fn connect_error(&self, source: std::io::Error) -> TransportError {
        TransportError::Connect {
            address: self.address.clone(),
            source,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Channel = TcpChannel;

    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<TcpChannel, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.target()))
            .await
            .map_err(|_| {
                self.connect_error(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })?
            .map_err(|e| self.connect_error(e))?;
        configure_stream(&stream, &self.options).map_err(|e| self.connect_error(e))?;

        tracing::debug!(address = %self.address, "channel opened");
        Ok(TcpChannel::new(stream, &self.framing))
    }
}

/// TCP implementation of [`Channel`].
#[derive(Debug)]
pub struct TcpChannel {
    stream: TcpStream,
    buffer: FrameBuffer,
    framing: FramingConfig,
    pending: Option<Vec<u8>>,
    stale: bool,
}

impl TcpChannel {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream, framing: &FramingConfig) -> Self {
        Self {
            stream,
            buffer: FrameBuffer::new(framing),
            framing: *framing,
            pending: None,
            stale: false,
        }
    }

    /// Whether a poll on this channel has timed out.
    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.stale {
            return Err(TransportError::Stale);
        }
        write_frame(&mut self.stream, frame, &self.framing).await?;
        Ok(())
    }

    async fn poll_reply(&mut self, timeout: Duration) -> Result<PollOutcome, TransportError> {
        if self.pending.is_some() {
            return Ok(PollOutcome::Ready);
        }
        if self.stale {
            return Err(TransportError::Stale);
        }

        match tokio::time::timeout(timeout, self.buffer.read_frame(&mut self.stream)).await {
            Ok(Ok(frame)) => {
                self.pending = Some(frame);
                Ok(PollOutcome::Ready)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                self.stale = true;
                Ok(PollOutcome::TimedOut)
            }
        }
    }

    async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        if self.stale {
            return Err(TransportError::Stale);
        }
        Ok(self.buffer.read_frame(&mut self.stream).await?)
    }

    fn discard(self) {
        if let Err(e) = set_discard_on_close(&self.stream) {
            tracing::debug!(error = %e, "could not clear linger before discard");
        }
    }
}
