//! Session protocols sequencing the calls a host issues over one run.
//!
//! [`ComputeSession`] drives a remote model through
//! `Idle → Connected → Initialized → Stepping → Terminated → Closed`.
//! [`RelaySession`] streams fixed-width input arrays:
//! `Idle → Connected → Streaming → Shutdown`.
//!
//! Out-of-order calls fail with [`UsageError`] before any network I/O.

use crate::codec::{Message, MessageType, Payload, SHUTTING_DOWN, Shape};
use crate::reliable::{CallError, ReliableClient, RetryPolicy};
use crate::server::ServerError;
use crate::transport::Connector;

/// State of a [`ComputeSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeState {
    /// No handshake yet.
    Idle,
    /// Handshake acknowledged.
    Connected,
    /// Remote model initialized; no step taken yet.
    Initialized,
    /// At least one step call made.
    Stepping,
    /// Final snapshot received.
    Terminated,
    /// Shutdown acknowledged or attempted. Terminal.
    Closed,
}

impl ComputeState {
    fn name(self) -> &'static str {
        match self {
            ComputeState::Idle => "idle",
            ComputeState::Connected => "connected",
            ComputeState::Initialized => "initialized",
            ComputeState::Stepping => "stepping",
            ComputeState::Terminated => "terminated",
            ComputeState::Closed => "closed",
        }
    }
}

/// State of a [`RelaySession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No handshake yet.
    Idle,
    /// Handshake acknowledged.
    Connected,
    /// At least one array transmitted.
    Streaming,
    /// Shutdown sent. Terminal.
    Shutdown,
}

impl RelayState {
    fn name(self) -> &'static str {
        match self {
            RelayState::Idle => "idle",
            RelayState::Connected => "connected",
            RelayState::Streaming => "streaming",
            RelayState::Shutdown => "shutdown",
        }
    }
}

/// A call made out of protocol order or with bad arguments. No I/O happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    /// The operation is not valid in the current state.
    #[error("{operation} is not allowed in state {state}")]
    InvalidState {
        /// Rejected operation.
        operation: &'static str,
        /// State at the time of the call.
        state: &'static str,
    },

    /// An input array does not have the configured width.
    #[error("{operation} expects {expected} values, got {actual}")]
    WidthMismatch {
        /// Rejected operation.
        operation: &'static str,
        /// Configured width.
        expected: usize,
        /// Supplied width.
        actual: usize,
    },

    /// No open session has this handle.
    #[error("unknown or closed session handle {0}")]
    UnknownHandle(u64),

    /// The handle belongs to a different kind of session.
    #[error("{operation} needs a {expected} handle, got a {actual} handle")]
    WrongHandleKind {
        /// Rejected operation.
        operation: &'static str,
        /// Kind the operation works on.
        expected: &'static str,
        /// Kind behind the handle.
        actual: &'static str,
    },
}

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Out-of-order call.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// Transport gave up or the reply was malformed.
    #[error(transparent)]
    Call(#[from] CallError),

    /// The server answered with an error text.
    #[error("{operation} failed on the server: {reason}")]
    Remote {
        /// Operation that was answered with an error.
        operation: &'static str,
        /// Server-supplied reason.
        reason: String,
    },

    /// The reply does not pair with the request.
    #[error("{operation} got an unexpected {kind:?}/{shape:?} reply")]
    UnexpectedReply {
        /// Operation awaiting the reply.
        operation: &'static str,
        /// Reply type tag.
        kind: MessageType,
        /// Reply payload shape.
        shape: Shape,
    },

    /// The receive side failed to bind or its sender went silent.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// A sender pushed an array of the wrong width.
    #[error("received {actual} values, expected {expected}")]
    PeerWidth {
        /// Configured width.
        expected: usize,
        /// Received width.
        actual: usize,
    },

    /// A sender issued a request a receive side does not serve.
    #[error("expected input data, got a {0:?} request")]
    UnexpectedRequest(MessageType),
}

impl SessionError {
    /// Whether the retry budget has been spent, on either side.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            SessionError::Call(CallError::ConnectionLost { .. })
                | SessionError::Server(ServerError::ConnectionLost { .. })
        )
    }
}

/// Send `request` and return the reply payload if it pairs with the request.
async fn exchange<C: Connector>(
    client: &mut ReliableClient<C>,
    operation: &'static str,
    request: Message,
) -> Result<Payload, SessionError> {
    let expected = request.kind.reply_type();
    let reply = client.call(&request).await?;

    if let Some(reason) = reply.remote_error() {
        return Err(SessionError::Remote {
            operation,
            reason: reason.to_string(),
        });
    }
    if reply.kind != expected {
        return Err(unexpected(operation, &reply.payload, reply.kind));
    }
    Ok(reply.payload)
}

fn unexpected(operation: &'static str, payload: &Payload, kind: MessageType) -> SessionError {
    SessionError::UnexpectedReply {
        operation,
        kind,
        shape: payload.shape(),
    }
}

fn expect_empty(
    operation: &'static str,
    kind: MessageType,
    payload: Payload,
) -> Result<(), SessionError> {
    match payload {
        Payload::Empty => Ok(()),
        other => Err(unexpected(operation, &other, kind)),
    }
}

fn expect_numeric(
    operation: &'static str,
    kind: MessageType,
    payload: Payload,
) -> Result<Vec<f64>, SessionError> {
    match payload {
        Payload::Numeric(values) => Ok(values),
        other => Err(unexpected(operation, &other, kind)),
    }
}

/// Split a function list on spaces and commas.
fn parse_function_names(text: &str) -> Vec<String> {
    text.split([' ', ','])
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Compute session
// ---------------------------------------------------------------------------

/// Lock-step session with a remote model.
pub struct ComputeSession<C: Connector> {
    client: ReliableClient<C>,
    state: ComputeState,
}

impl<C: Connector> ComputeSession<C> {
    /// New idle session. Nothing is sent until the first operation.
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            client: ReliableClient::new(connector, policy),
            state: ComputeState::Idle,
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> ComputeState {
        self.state
    }

    /// Underlying client, for diagnostics.
    pub fn client(&self) -> &ReliableClient<C> {
        &self.client
    }

    fn reject(&self, operation: &'static str) -> SessionError {
        UsageError::InvalidState {
            operation,
            state: self.state.name(),
        }
        .into()
    }

    /// Send the handshake, optionally naming what the remote side should load.
    pub async fn handshake(&mut self, bootstrap: Option<&str>) -> Result<(), SessionError> {
        const OP: &str = "handshake";
        if self.state != ComputeState::Idle {
            return Err(self.reject(OP));
        }

        let request = match bootstrap {
            Some(text) => Message::text(MessageType::Connect, text),
            None => Message::empty(MessageType::Connect),
        };
        let payload = exchange(&mut self.client, OP, request).await?;
        expect_empty(OP, MessageType::Connect, payload)?;

        tracing::info!(address = %self.client.address(), "session connected");
        self.state = ComputeState::Connected;
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<(), SessionError> {
        if self.state == ComputeState::Idle {
            self.handshake(None).await?;
        }
        Ok(())
    }

    /// Push model parameters. Valid before or after initialization.
    pub async fn push_parameters(&mut self, values: &[f64]) -> Result<(), SessionError> {
        const OP: &str = "push_parameters";
        self.ensure_connected().await?;
        if !matches!(
            self.state,
            ComputeState::Connected | ComputeState::Initialized
        ) {
            return Err(self.reject(OP));
        }

        let payload = exchange(
            &mut self.client,
            OP,
            Message::numeric(MessageType::ParameterData, values),
        )
        .await?;
        expect_empty(OP, MessageType::ParameterData, payload)
    }

    /// Reset the remote model state.
    pub async fn initialize(&mut self) -> Result<(), SessionError> {
        const OP: &str = "initialize";
        self.ensure_connected().await?;
        if self.state != ComputeState::Connected {
            return Err(self.reject(OP));
        }

        let payload = exchange(
            &mut self.client,
            OP,
            Message::empty(MessageType::Initialize),
        )
        .await?;
        expect_empty(OP, MessageType::Initialize, payload)?;
        self.state = ComputeState::Initialized;
        Ok(())
    }

    fn check_stepping(&self, operation: &'static str) -> Result<(), SessionError> {
        match self.state {
            ComputeState::Initialized | ComputeState::Stepping => Ok(()),
            _ => Err(self.reject(operation)),
        }
    }

    /// Send this step's inputs.
    pub async fn push_input(&mut self, inputs: &[f64]) -> Result<(), SessionError> {
        const OP: &str = "push_input";
        self.check_stepping(OP)?;

        let payload = exchange(
            &mut self.client,
            OP,
            Message::numeric(MessageType::InputData, inputs),
        )
        .await?;
        expect_empty(OP, MessageType::InputData, payload)?;
        self.state = ComputeState::Stepping;
        Ok(())
    }

    /// Fetch this step's outputs.
    pub async fn compute_output(&mut self) -> Result<Vec<f64>, SessionError> {
        const OP: &str = "compute_output";
        self.check_stepping(OP)?;

        let payload = exchange(
            &mut self.client,
            OP,
            Message::empty(MessageType::ComputeOutput),
        )
        .await?;
        let outputs = expect_numeric(OP, MessageType::ComputeOutput, payload)?;
        self.state = ComputeState::Stepping;
        Ok(outputs)
    }

    /// Advance the remote state by one step.
    pub async fn update_state(&mut self) -> Result<(), SessionError> {
        const OP: &str = "update_state";
        self.check_stepping(OP)?;

        let payload = exchange(
            &mut self.client,
            OP,
            Message::empty(MessageType::UpdateState),
        )
        .await?;
        expect_empty(OP, MessageType::UpdateState, payload)?;
        self.state = ComputeState::Stepping;
        Ok(())
    }

    /// One full step: push inputs, read outputs, advance state.
    pub async fn step(&mut self, inputs: &[f64]) -> Result<Vec<f64>, SessionError> {
        self.push_input(inputs).await?;
        let outputs = self.compute_output().await?;
        self.update_state().await?;
        Ok(outputs)
    }

    /// End the run and return the last `(u, y)` snapshot.
    pub async fn terminate(&mut self) -> Result<(Vec<f64>, Vec<f64>), SessionError> {
        const OP: &str = "terminate";
        self.ensure_connected().await?;
        if !matches!(
            self.state,
            ComputeState::Connected | ComputeState::Initialized | ComputeState::Stepping
        ) {
            return Err(self.reject(OP));
        }

        let payload = exchange(&mut self.client, OP, Message::empty(MessageType::Terminate)).await?;
        match payload {
            Payload::Dual { u, y } => {
                self.state = ComputeState::Terminated;
                Ok((u, y))
            }
            other => Err(unexpected(OP, &other, MessageType::Terminate)),
        }
    }

    /// List the functions the remote side offers.
    pub async fn query_functions(&mut self) -> Result<Vec<String>, SessionError> {
        const OP: &str = "query_functions";
        self.ensure_connected().await?;
        self.check_open_for_calls(OP)?;

        let payload = exchange(
            &mut self.client,
            OP,
            Message::empty(MessageType::FunctionQuery),
        )
        .await?;
        match payload {
            Payload::Text(text) => Ok(parse_function_names(&text)),
            Payload::Empty => Ok(Vec::new()),
            other => Err(unexpected(OP, &other, MessageType::FunctionReply)),
        }
    }

    /// Invoke a named remote function.
    pub async fn call_function(
        &mut self,
        name: &str,
        args: &[f64],
    ) -> Result<Vec<f64>, SessionError> {
        const OP: &str = "call_function";
        self.ensure_connected().await?;
        self.check_open_for_calls(OP)?;

        let payload = exchange(&mut self.client, OP, Message::call(name, args)).await?;
        expect_numeric(OP, MessageType::FunctionReply, payload)
    }

    fn check_open_for_calls(&self, operation: &'static str) -> Result<(), SessionError> {
        match self.state {
            ComputeState::Connected | ComputeState::Initialized | ComputeState::Stepping => Ok(()),
            _ => Err(self.reject(operation)),
        }
    }

    /// Ask the server to shut down and drop the channel.
    ///
    /// The session is closed afterwards even when the exchange fails.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        const OP: &str = "close";
        if self.state == ComputeState::Closed {
            return Err(self.reject(OP));
        }
        self.state = ComputeState::Closed;

        let result = exchange(&mut self.client, OP, Message::empty(MessageType::Shutdown)).await;
        self.client.disconnect();
        check_shutdown_ack(OP, result?)?;
        tracing::info!(address = %self.client.address(), "session closed");
        Ok(())
    }
}

fn check_shutdown_ack(operation: &'static str, payload: Payload) -> Result<(), SessionError> {
    match payload {
        Payload::Text(text) if text == SHUTTING_DOWN => Ok(()),
        Payload::Empty => Ok(()),
        other => Err(unexpected(operation, &other, MessageType::Shutdown)),
    }
}

// ---------------------------------------------------------------------------
// Streaming relay session
// ---------------------------------------------------------------------------

/// Session that streams fixed-width arrays to a receiver.
pub struct RelaySession<C: Connector> {
    client: ReliableClient<C>,
    state: RelayState,
    width: usize,
}

impl<C: Connector> RelaySession<C> {
    /// New idle relay for arrays of `width` values.
    pub fn new(connector: C, policy: RetryPolicy, width: usize) -> Self {
        Self {
            client: ReliableClient::new(connector, policy),
            state: RelayState::Idle,
            width,
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Configured array width.
    pub fn width(&self) -> usize {
        self.width
    }

    fn reject(&self, operation: &'static str) -> SessionError {
        UsageError::InvalidState {
            operation,
            state: self.state.name(),
        }
        .into()
    }

    /// Send the handshake.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        const OP: &str = "connect";
        if self.state != RelayState::Idle {
            return Err(self.reject(OP));
        }
        let payload = exchange(&mut self.client, OP, Message::empty(MessageType::Connect)).await?;
        expect_empty(OP, MessageType::Connect, payload)?;
        self.state = RelayState::Connected;
        Ok(())
    }

    /// Send one array and wait for its acknowledgement.
    pub async fn transmit(&mut self, values: &[f64]) -> Result<(), SessionError> {
        const OP: &str = "transmit";
        if self.state == RelayState::Shutdown {
            return Err(self.reject(OP));
        }
        if values.len() != self.width {
            return Err(UsageError::WidthMismatch {
                operation: OP,
                expected: self.width,
                actual: values.len(),
            }
            .into());
        }
        if self.state == RelayState::Idle {
            self.connect().await?;
        }

        let payload = exchange(
            &mut self.client,
            OP,
            Message::numeric(MessageType::InputData, values),
        )
        .await?;
        expect_empty(OP, MessageType::InputData, payload)?;
        self.state = RelayState::Streaming;
        Ok(())
    }

    /// Ask the receiver to shut down.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        const OP: &str = "close";
        if self.state == RelayState::Shutdown {
            return Err(self.reject(OP));
        }
        self.state = RelayState::Shutdown;

        let result = exchange(&mut self.client, OP, Message::empty(MessageType::Shutdown)).await;
        self.client.disconnect();
        check_shutdown_ack(OP, result?)
    }
}
