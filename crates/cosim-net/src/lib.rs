//! Lock-step request/reply messaging between a stepped simulation host and a
//! remote computation: frame codec, stream framing, reliable client, session
//! protocols, handle registry, and the server loop.

pub mod codec;
pub mod framing;
pub mod registry;
pub mod reliable;
pub mod server;
pub mod session;
pub mod socket;
pub mod transport;

pub use codec::{
    LengthOverflow, MalformedFrame, Message, MessageType, Payload, SHUTTING_DOWN, Shape,
    TERMINATE_TOKEN, decode, encode,
};
pub use framing::{FrameBuffer, FramingConfig, FramingError, read_frame, write_frame};
pub use registry::{Received, SessionHandle, SessionOptions, SessionRegistry};
pub use reliable::{CallError, LinkState, PolicyError, ReliableClient, RetryPolicy};
pub use server::{Model, ModelError, ServeEvent, ServerError, ServerLoop, ServerSettings};
pub use session::{
    ComputeSession, ComputeState, RelaySession, RelayState, SessionError, UsageError,
};
pub use socket::SocketOptions;
pub use transport::{Channel, Connector, PollOutcome, TcpChannel, TcpConnector, TransportError};
