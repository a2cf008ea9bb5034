//! Blocking, handle-based access to sessions.
//!
//! A host simulation engine keeps one [`SessionHandle`] per block instance
//! and threads it back into every call. Three kinds of block are served:
//! compute blocks ([`ComputeSession`]), transmit blocks ([`RelaySession`])
//! and receive blocks, which bind a listener and take one input array per
//! step. The registry owns all of them plus a current-thread tokio runtime,
//! so every call here is a plain blocking function. Do not call it from
//! inside another tokio runtime.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::codec::MessageType;
use crate::framing::FramingConfig;
use crate::reliable::RetryPolicy;
use crate::server::{Model, ModelError, ServeEvent, ServerError, ServerLoop, ServerSettings};
use crate::session::{
    ComputeSession, ComputeState, RelaySession, RelayState, SessionError, UsageError,
};
use crate::transport::TcpConnector;

/// Opaque reference to a session in a [`SessionRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    /// Raw identifier, for logging.
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Per-session settings supplied when a client session is opened.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Poll timeout and retry budget.
    pub policy: RetryPolicy,
    /// Frame size limit.
    pub framing: FramingConfig,
}

/// What one [`SessionRegistry::receive`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// One input array of the configured width.
    Values(Vec<f64>),
    /// The sender asked the receive side to stop.
    Shutdown,
}

/// Model behind a receive block: it only takes input arrays, which the
/// server loop handles itself.
struct InputSink;

impl Model for InputSink {
    fn set_parameters(&mut self, params: &[f64]) -> Result<(), ModelError> {
        Err(ModelError::ParameterCount {
            expected: 0,
            actual: params.len(),
        })
    }

    fn initialize(&mut self) {}

    fn compute_output(&mut self, _inputs: &[f64]) -> Result<Vec<f64>, ModelError> {
        Ok(Vec::new())
    }

    fn update_state(&mut self, _inputs: &[f64]) -> Result<(), ModelError> {
        Ok(())
    }

    fn terminate(&mut self) -> (Vec<f64>, Vec<f64>) {
        (Vec::new(), Vec::new())
    }

    fn functions(&self) -> Vec<String> {
        Vec::new()
    }

    fn call(&mut self, name: &str, _args: &[f64]) -> Result<Vec<f64>, ModelError> {
        Err(ModelError::UnknownFunction(name.to_string()))
    }
}

struct Receiver {
    server: ServerLoop<InputSink>,
    width: usize,
}

impl Receiver {
    async fn next(&mut self) -> Result<Received, SessionError> {
        loop {
            match self.server.serve_step().await? {
                ServeEvent::Input(values) if values.len() == self.width => {
                    return Ok(Received::Values(values));
                }
                ServeEvent::Input(values) => {
                    return Err(SessionError::PeerWidth {
                        expected: self.width,
                        actual: values.len(),
                    });
                }
                ServeEvent::Shutdown => return Ok(Received::Shutdown),
                ServeEvent::Handled(MessageType::Connect) => {}
                ServeEvent::Handled(kind) => return Err(SessionError::UnexpectedRequest(kind)),
            }
        }
    }
}

enum Entry {
    Compute(ComputeSession<TcpConnector>),
    Relay(RelaySession<TcpConnector>),
    Receiver(Receiver),
}

impl Entry {
    fn kind(&self) -> &'static str {
        match self {
            Entry::Compute(_) => "compute",
            Entry::Relay(_) => "relay",
            Entry::Receiver(_) => "receiver",
        }
    }
}

fn wrong_kind(operation: &'static str, expected: &'static str, entry: &Entry) -> SessionError {
    UsageError::WrongHandleKind {
        operation,
        expected,
        actual: entry.kind(),
    }
    .into()
}

/// Owner of all open sessions.
pub struct SessionRegistry {
    runtime: tokio::runtime::Runtime,
    entries: HashMap<SessionHandle, Entry>,
    next_id: u64,
}

impl SessionRegistry {
    /// Create an empty registry with its own runtime.
    pub fn new() -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            entries: HashMap::new(),
            next_id: 1,
        })
    }

    fn insert(&mut self, entry: Entry) -> SessionHandle {
        let handle = SessionHandle(self.next_id);
        self.next_id += 1;
        self.entries.insert(handle, entry);
        handle
    }

    /// Register a compute session bound to `address`. Nothing is sent yet.
    pub fn open(&mut self, address: &str, options: SessionOptions) -> SessionHandle {
        let connector = TcpConnector::new(address).with_framing(options.framing);
        let handle = self.insert(Entry::Compute(ComputeSession::new(connector, options.policy)));
        tracing::debug!(%handle, address, "compute session opened");
        handle
    }

    /// Register a relay session streaming arrays of `width` values to
    /// `address`. Nothing is sent yet.
    pub fn open_relay(
        &mut self,
        address: &str,
        width: usize,
        options: SessionOptions,
    ) -> SessionHandle {
        let connector = TcpConnector::new(address).with_framing(options.framing);
        let relay = RelaySession::new(connector, options.policy, width);
        let handle = self.insert(Entry::Relay(relay));
        tracing::debug!(%handle, address, width, "relay session opened");
        handle
    }

    /// Bind a receive side on `addr` taking arrays of `width` values.
    pub fn bind_receiver(
        &mut self,
        addr: SocketAddr,
        width: usize,
        settings: ServerSettings,
    ) -> Result<SessionHandle, SessionError> {
        let server = {
            let _runtime = self.runtime.enter();
            ServerLoop::bind(addr, settings, InputSink)?
        };
        let handle = self.insert(Entry::Receiver(Receiver { server, width }));
        tracing::debug!(%handle, %addr, width, "receiver bound");
        Ok(handle)
    }

    /// Number of open sessions of any kind.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no session is open.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, handle: SessionHandle) -> Result<&Entry, SessionError> {
        self.entries
            .get(&handle)
            .ok_or_else(|| UsageError::UnknownHandle(handle.0).into())
    }

    /// Protocol state of a compute session.
    pub fn state(&self, handle: SessionHandle) -> Result<ComputeState, SessionError> {
        match self.entry(handle)? {
            Entry::Compute(session) => Ok(session.state()),
            other => Err(wrong_kind("state", "compute", other)),
        }
    }

    /// Protocol state of a relay session.
    pub fn relay_state(&self, handle: SessionHandle) -> Result<RelayState, SessionError> {
        match self.entry(handle)? {
            Entry::Relay(relay) => Ok(relay.state()),
            other => Err(wrong_kind("relay_state", "relay", other)),
        }
    }

    /// Address a receive side is listening on.
    pub fn receiver_addr(&self, handle: SessionHandle) -> Result<SocketAddr, SessionError> {
        match self.entry(handle)? {
            Entry::Receiver(receiver) => receiver
                .server
                .local_addr()
                .map_err(|e| SessionError::Server(ServerError::Io(e))),
            other => Err(wrong_kind("receiver_addr", "receiver", other)),
        }
    }

    fn parts(
        &mut self,
        handle: SessionHandle,
    ) -> Result<(&tokio::runtime::Runtime, &mut Entry), SessionError> {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(UsageError::UnknownHandle(handle.0))?;
        Ok((&self.runtime, entry))
    }

    fn compute(
        &mut self,
        handle: SessionHandle,
        operation: &'static str,
    ) -> Result<(&tokio::runtime::Runtime, &mut ComputeSession<TcpConnector>), SessionError> {
        match self.parts(handle)? {
            (rt, Entry::Compute(session)) => Ok((rt, session)),
            (_, other) => Err(wrong_kind(operation, "compute", other)),
        }
    }

    /// Explicit handshake with an optional bootstrap text.
    pub fn handshake(
        &mut self,
        handle: SessionHandle,
        bootstrap: Option<&str>,
    ) -> Result<(), SessionError> {
        let (rt, session) = self.compute(handle, "handshake")?;
        rt.block_on(session.handshake(bootstrap))
    }

    /// See [`ComputeSession::push_parameters`].
    pub fn push_parameters(
        &mut self,
        handle: SessionHandle,
        values: &[f64],
    ) -> Result<(), SessionError> {
        let (rt, session) = self.compute(handle, "push_parameters")?;
        rt.block_on(session.push_parameters(values))
    }

    /// See [`ComputeSession::initialize`].
    pub fn initialize(&mut self, handle: SessionHandle) -> Result<(), SessionError> {
        let (rt, session) = self.compute(handle, "initialize")?;
        rt.block_on(session.initialize())
    }

    /// See [`ComputeSession::step`].
    pub fn step(&mut self, handle: SessionHandle, inputs: &[f64]) -> Result<Vec<f64>, SessionError> {
        let (rt, session) = self.compute(handle, "step")?;
        rt.block_on(session.step(inputs))
    }

    /// See [`ComputeSession::terminate`].
    pub fn terminate(
        &mut self,
        handle: SessionHandle,
    ) -> Result<(Vec<f64>, Vec<f64>), SessionError> {
        let (rt, session) = self.compute(handle, "terminate")?;
        rt.block_on(session.terminate())
    }

    /// See [`ComputeSession::call_function`].
    pub fn call_function(
        &mut self,
        handle: SessionHandle,
        name: &str,
        args: &[f64],
    ) -> Result<Vec<f64>, SessionError> {
        let (rt, session) = self.compute(handle, "call_function")?;
        rt.block_on(session.call_function(name, args))
    }

    /// See [`RelaySession::transmit`].
    pub fn transmit(&mut self, handle: SessionHandle, values: &[f64]) -> Result<(), SessionError> {
        match self.parts(handle)? {
            (rt, Entry::Relay(relay)) => rt.block_on(relay.transmit(values)),
            (_, other) => Err(wrong_kind("transmit", "relay", other)),
        }
    }

    /// Wait for the next input array on a receive side.
    ///
    /// Handshakes are answered and skipped. Blocks at most poll timeout
    /// times retry budget once a sender has connected.
    pub fn receive(&mut self, handle: SessionHandle) -> Result<Received, SessionError> {
        match self.parts(handle)? {
            (rt, Entry::Receiver(receiver)) => rt.block_on(receiver.next()),
            (_, other) => Err(wrong_kind("receive", "receiver", other)),
        }
    }

    /// Close any kind of session and release its handle, even if the
    /// shutdown exchange fails. A receive side just stops listening.
    pub fn close(&mut self, handle: SessionHandle) -> Result<(), SessionError> {
        let entry = self
            .entries
            .remove(&handle)
            .ok_or(UsageError::UnknownHandle(handle.0))?;
        let kind = entry.kind();
        let result = match entry {
            Entry::Compute(mut session) => self.runtime.block_on(session.close()),
            Entry::Relay(mut relay) => self.runtime.block_on(relay.close()),
            Entry::Receiver(receiver) => {
                let _runtime = self.runtime.enter();
                drop(receiver);
                Ok(())
            }
        };
        tracing::debug!(%handle, kind, ok = result.is_ok(), "session released");
        result
    }
}
