//! Lock-step server loop serving a [`Model`] to one client at a time.
//!
//! The loop binds once, then repeatedly waits (bounded) for a request on the
//! current connection, dispatches it by type, and writes exactly one reply.
//! A new connection may arrive at any point; it replaces the current one,
//! since a client that stalled reconnects on a fresh channel.
//!
//! Every failure to serve a request (model error, malformed frame, wrong
//! payload shape) is still answered, with a text reply prefixed
//! `"error: "`, so request and reply stay paired.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::codec::{
    self, ERROR_PREFIX, LengthOverflow, Message, MessageType, Payload, SHUTTING_DOWN,
};
use crate::framing::{FrameBuffer, FramingConfig, FramingError, write_frame};
use crate::reliable::{DEFAULT_POLL_TIMEOUT, DEFAULT_RETRY_BUDGET};
use crate::socket::{SocketOptions, configure_stream, create_listener, set_discard_on_close};

/// Failure reported by a [`Model`]. Sent back to the client as an error reply.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// Wrong number of parameters.
    #[error("expected {expected} parameters, got {actual}")]
    ParameterCount {
        /// Required count.
        expected: usize,
        /// Supplied count.
        actual: usize,
    },

    /// A parameter is out of range.
    #[error("invalid parameter {name}: {value}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Rejected value.
        value: f64,
    },

    /// Wrong number of step inputs.
    #[error("expected {expected} inputs, got {actual}")]
    InputWidth {
        /// Required width.
        expected: usize,
        /// Supplied width.
        actual: usize,
    },

    /// No function with this name.
    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    /// Wrong number of function arguments.
    #[error("{name} takes {expected} arguments, got {actual}")]
    ArgumentCount {
        /// Function name.
        name: String,
        /// Required count.
        expected: usize,
        /// Supplied count.
        actual: usize,
    },
}

/// A computation served by [`ServerLoop`].
pub trait Model: Send {
    /// Store model parameters.
    fn set_parameters(&mut self, params: &[f64]) -> Result<(), ModelError>;

    /// Reset the state for a new run.
    fn initialize(&mut self);

    /// Outputs for the current step's inputs.
    fn compute_output(&mut self, inputs: &[f64]) -> Result<Vec<f64>, ModelError>;

    /// Advance the state with the current step's inputs.
    fn update_state(&mut self, inputs: &[f64]) -> Result<(), ModelError>;

    /// Final `(u, y)` snapshot.
    fn terminate(&mut self) -> (Vec<f64>, Vec<f64>);

    /// Names accepted by [`Model::call`].
    fn functions(&self) -> Vec<String>;

    /// Stateless function call.
    fn call(&mut self, name: &str, args: &[f64]) -> Result<Vec<f64>, ModelError>;
}

/// Server loop settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Bound on one wait for a request, and on writing one reply.
    pub poll_timeout: Duration,
    /// Consecutive timed-out waits tolerated before giving up. Waits before
    /// the first client connects are not counted: a fresh server waits for
    /// its first client indefinitely.
    pub retry_budget: u32,
    /// Frame size limit.
    pub framing: FramingConfig,
    /// Socket options for the listener and accepted streams.
    pub socket: SocketOptions,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
            framing: FramingConfig::default(),
            socket: SocketOptions::default(),
        }
    }
}

/// Errors that stop the server loop.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Accepting a connection failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No request arrived within the retry budget.
    #[error("no request after {attempts} waits, client seems to be gone")]
    ConnectionLost {
        /// Waits that timed out.
        attempts: u32,
    },

    /// A reply could not be encoded.
    #[error("cannot encode reply: {0}")]
    Encode(#[from] LengthOverflow),
}

/// What one [`ServerLoop::serve_step`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum ServeEvent {
    /// A request of this type was answered.
    Handled(MessageType),
    /// An input array was received and acknowledged.
    Input(Vec<f64>),
    /// A shutdown request was acknowledged. The loop should stop.
    Shutdown,
}

#[derive(Debug)]
struct Connection {
    stream: TcpStream,
    buffer: FrameBuffer,
    peer: SocketAddr,
}

enum Wake {
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Frame(Result<Vec<u8>, FramingError>),
    TimedOut,
}

/// Bound listener plus the model it serves.
pub struct ServerLoop<M: Model> {
    listener: TcpListener,
    settings: ServerSettings,
    model: M,
    conn: Option<Connection>,
    inputs: Vec<f64>,
    bootstrap: Option<String>,
    attempts_left: u32,
    seen_client: bool,
}

impl<M: Model> ServerLoop<M> {
    /// Bind `addr` and wrap `model`. Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, settings: ServerSettings, model: M) -> Result<Self, ServerError> {
        let listener = create_listener(addr, &settings.socket)
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self::from_listener(listener, settings, model))
    }

    /// Serve on an already bound listener.
    pub fn from_listener(listener: TcpListener, settings: ServerSettings, model: M) -> Self {
        let attempts_left = settings.retry_budget;
        Self {
            listener,
            settings,
            model,
            conn: None,
            inputs: Vec::new(),
            bootstrap: None,
            attempts_left,
            seen_client: false,
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The served model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Inputs from the most recent `InputData` request.
    pub fn inputs(&self) -> &[f64] {
        &self.inputs
    }

    /// Text sent with the most recent handshake, if any.
    pub fn bootstrap(&self) -> Option<&str> {
        self.bootstrap.as_deref()
    }

    /// Serve until a shutdown request, then return the model.
    pub async fn run(mut self) -> Result<M, ServerError> {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(%addr, "server listening");
        }
        loop {
            if self.serve_step().await? == ServeEvent::Shutdown {
                tracing::info!("shutdown requested, server loop exiting");
                return Ok(self.model);
            }
        }
    }

    /// Wait for one request, answer it, and report what happened.
    ///
    /// Connections accepted and connections closed by the peer along the way
    /// do not end the step.
    pub async fn serve_step(&mut self) -> Result<ServeEvent, ServerError> {
        loop {
            let wake = self.wait().await;
            match wake {
                Wake::Accepted(accepted) => {
                    let (stream, peer) = accepted?;
                    if let Err(e) = configure_stream(&stream, &self.settings.socket) {
                        tracing::debug!(error = %e, "socket options not applied");
                    }
                    self.seen_client = true;
                    if let Some(old) = self.conn.take() {
                        tracing::info!(old = %old.peer, new = %peer, "replacing client connection");
                    } else {
                        tracing::info!(%peer, "client connected");
                    }
                    self.conn = Some(Connection {
                        stream,
                        buffer: FrameBuffer::new(&self.settings.framing),
                        peer,
                    });
                }
                Wake::Frame(Ok(frame)) => {
                    self.attempts_left = self.settings.retry_budget;
                    return self.dispatch(&frame).await;
                }
                Wake::Frame(Err(FramingError::ConnectionClosed)) => {
                    if let Some(old) = self.conn.take() {
                        tracing::info!(peer = %old.peer, "client disconnected");
                    }
                }
                Wake::Frame(Err(e)) => {
                    if let Some(old) = self.conn.take() {
                        tracing::warn!(peer = %old.peer, error = %e, "dropping client connection");
                    }
                }
                Wake::TimedOut if !self.seen_client => {
                    tracing::debug!("waiting for a first client");
                }
                Wake::TimedOut => {
                    self.attempts_left = self.attempts_left.saturating_sub(1);
                    let attempt = self.settings.retry_budget - self.attempts_left;
                    tracing::warn!(
                        attempt,
                        budget = self.settings.retry_budget,
                        "no request within {:?}",
                        self.settings.poll_timeout
                    );
                    if self.attempts_left == 0 {
                        return Err(ServerError::ConnectionLost {
                            attempts: self.settings.retry_budget,
                        });
                    }
                }
            }
        }
    }

    async fn wait(&mut self) -> Wake {
        let timeout = tokio::time::sleep(self.settings.poll_timeout);
        tokio::pin!(timeout);

        let Self { listener, conn, .. } = self;
        match conn {
            Some(Connection { stream, buffer, .. }) => tokio::select! {
                accepted = listener.accept() => Wake::Accepted(accepted),
                frame = buffer.read_frame(stream) => Wake::Frame(frame),
                () = &mut timeout => Wake::TimedOut,
            },
            None => tokio::select! {
                accepted = listener.accept() => Wake::Accepted(accepted),
                () = &mut timeout => Wake::TimedOut,
            },
        }
    }

    async fn dispatch(&mut self, frame: &[u8]) -> Result<ServeEvent, ServerError> {
        let (reply, event) = match codec::decode(frame) {
            Ok(request) if request.is_shutdown() => (
                Message::text(MessageType::Shutdown, SHUTTING_DOWN),
                ServeEvent::Shutdown,
            ),
            Ok(request) => {
                let kind = request.kind;
                match self.handle(request) {
                    Ok(answered) => answered,
                    Err(reason) => {
                        tracing::warn!(?kind, %reason, "request failed");
                        (error_reply(kind, &reason), ServeEvent::Handled(kind))
                    }
                }
            }
            Err(e) => {
                let kind = peek_type(frame);
                tracing::warn!(error = %e, "malformed request");
                (
                    error_reply(kind, &format!("malformed frame: {e}")),
                    ServeEvent::Handled(kind),
                )
            }
        };

        self.send(&reply).await?;
        Ok(event)
    }

    fn handle(&mut self, request: Message) -> Result<(Message, ServeEvent), String> {
        use MessageType as T;

        let kind = request.kind;
        let handled = |reply: Message| (reply, ServeEvent::Handled(kind));

        match (kind, request.payload) {
            (T::Connect, Payload::Empty) => {
                self.bootstrap = None;
                Ok(handled(Message::empty(T::Connect)))
            }
            (T::Connect, Payload::Text(text)) => {
                tracing::info!(bootstrap = %text, "handshake");
                self.bootstrap = Some(text);
                Ok(handled(Message::empty(T::Connect)))
            }
            (T::ParameterData, Payload::Numeric(params)) => {
                self.model.set_parameters(&params).map_err(|e| e.to_string())?;
                Ok(handled(Message::empty(T::ParameterData)))
            }
            (T::Initialize, Payload::Empty) => {
                self.model.initialize();
                self.inputs.clear();
                Ok(handled(Message::empty(T::Initialize)))
            }
            (T::InputData, Payload::Numeric(values)) => {
                self.inputs.clone_from(&values);
                Ok((Message::empty(T::InputData), ServeEvent::Input(values)))
            }
            (T::ComputeOutput, Payload::Empty) => {
                let outputs = self
                    .model
                    .compute_output(&self.inputs)
                    .map_err(|e| e.to_string())?;
                Ok(handled(Message::numeric(T::ComputeOutput, outputs)))
            }
            (T::UpdateState, Payload::Empty) => {
                self.model
                    .update_state(&self.inputs)
                    .map_err(|e| e.to_string())?;
                Ok(handled(Message::empty(T::UpdateState)))
            }
            (T::Terminate, Payload::Empty) => {
                let (u, y) = self.model.terminate();
                Ok(handled(Message::dual(T::Terminate, u, y)))
            }
            (T::FunctionQuery, Payload::Empty) => {
                let names = self.model.functions().join(",");
                Ok(handled(Message::text(T::FunctionReply, names)))
            }
            (T::FunctionCall, Payload::Call { name, args }) => {
                let result = self.model.call(&name, &args).map_err(|e| e.to_string())?;
                Ok(handled(Message::numeric(T::FunctionReply, result)))
            }
            (kind, payload) => Err(format!(
                "{:?} payload is not valid for {kind:?}",
                payload.shape()
            )),
        }
    }

    async fn send(&mut self, reply: &Message) -> Result<(), ServerError> {
        let frame = codec::encode(reply)?;
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        let write = write_frame(&mut conn.stream, &frame, &self.settings.framing);
        let failure = match tokio::time::timeout(self.settings.poll_timeout, write).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "client not reading".to_string(),
        };
        tracing::warn!(peer = %conn.peer, error = %failure, "reply not delivered, dropping connection");
        if let Err(e) = set_discard_on_close(&conn.stream) {
            tracing::debug!(error = %e, "linger not cleared");
        }
        self.conn = None;
        Ok(())
    }
}

fn error_reply(kind: MessageType, reason: &str) -> Message {
    Message::text(kind, format!("{ERROR_PREFIX}{reason}"))
}

/// Type tag of a frame that failed to decode, when the tag itself is readable.
fn peek_type(frame: &[u8]) -> MessageType {
    frame
        .get(..4)
        .and_then(|word| word.try_into().ok())
        .map(i32::from_le_bytes)
        .and_then(MessageType::from_code)
        .unwrap_or(MessageType::Connect)
}
