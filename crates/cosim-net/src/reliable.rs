//! Lock-step request/reply with bounded polling and channel recreation.
//!
//! A logical call sends one request and waits for exactly one reply. When the
//! peer stalls past the poll timeout, the channel is discarded, a fresh one is
//! opened, and the same request is sent again. Each call gets a fixed retry
//! budget; once it is spent the client is poisoned and every later call fails
//! with [`CallError::ConnectionLost`] without touching the network.
//!
//! Every attempt (connect, send, poll and receive) shares one deadline of one
//! poll timeout, so a call blocks at most poll timeout times retry budget. A
//! connect or send still pending at the deadline counts as failed.
//!
//! The retry rules live in [`transition`], a pure function over
//! ([`LinkState`], attempts left, [`LinkEvent`]). [`ReliableClient`] only
//! executes the [`LinkAction`] it returns and feeds the outcome back.
//!
//! ```text
//! Disconnected --Connect--> Sending --Send--> WaitingReply --Receive--> Connected
//!      ^                                          |
//!      +------ timeout / I/O error, budget left --+
//!                                                 |
//!                       budget spent ---------> Fatal
//! ```

use std::time::Duration;

use tokio::time::{Instant, timeout_at};

use crate::codec::{self, LengthOverflow, MalformedFrame, Message};
use crate::transport::{Channel, Connector, PollOutcome};

/// Default bound on a single poll for a reply.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(2500);

/// Default number of attempts per logical call.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// A poll timeout must be strictly longer than this.
pub const MIN_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll timeout and retry budget for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    poll_timeout: Duration,
    retry_budget: u32,
}

/// Rejected [`RetryPolicy`] values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Timeout at or below [`MIN_POLL_TIMEOUT`].
    #[error("poll timeout {0:?} must exceed {MIN_POLL_TIMEOUT:?}")]
    TimeoutTooShort(Duration),

    /// A budget of zero would never send anything.
    #[error("retry budget must be at least 1")]
    ZeroBudget,
}

impl RetryPolicy {
    /// Validate and build a policy.
    pub fn new(poll_timeout: Duration, retry_budget: u32) -> Result<Self, PolicyError> {
        if poll_timeout <= MIN_POLL_TIMEOUT {
            return Err(PolicyError::TimeoutTooShort(poll_timeout));
        }
        if retry_budget == 0 {
            return Err(PolicyError::ZeroBudget);
        }
        Ok(Self {
            poll_timeout,
            retry_budget,
        })
    }

    /// Bound on one poll.
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Attempts per logical call.
    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

// ---------------------------------------------------------------------------
// Transition function
// ---------------------------------------------------------------------------

/// Link state of a [`ReliableClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No channel open.
    Disconnected,
    /// A channel is open and idle.
    Connected,
    /// The request is being written.
    Sending,
    /// The request was written; polling for the reply.
    WaitingReply,
    /// The retry budget ran out. Terminal.
    Fatal,
}

/// Outcome of the last executed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A new logical call starts.
    Begin,
    /// A channel was opened.
    Connected,
    /// Opening a channel failed.
    ConnectFailed,
    /// The request was written.
    Sent,
    /// Writing the request failed.
    SendFailed,
    /// A reply is available.
    ReplyReady,
    /// The poll timed out.
    PollTimedOut,
    /// Polling failed with an I/O error.
    PollFailed,
    /// The reply was read.
    Received,
    /// Reading the reply failed.
    ReceiveFailed,
}

/// What the executor must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Discard any open channel and open a fresh one.
    Connect,
    /// Write the request on the open channel.
    Send,
    /// Wait for the reply, bounded by the poll timeout.
    Poll,
    /// Read the available reply.
    Receive,
    /// Hand the reply to the caller.
    Deliver,
    /// Stop with [`CallError::ConnectionLost`].
    GiveUp,
}

/// Result of one [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Next state.
    pub state: LinkState,
    /// Attempts left for the current call.
    pub attempts_left: u32,
    /// Action to execute.
    pub action: LinkAction,
}

impl Transition {
    fn to(state: LinkState, attempts_left: u32, action: LinkAction) -> Self {
        Self {
            state,
            attempts_left,
            action,
        }
    }
}

/// Compute the next state, remaining attempts, and action.
///
/// A failed attempt (timeout, connect, send or receive error) costs one
/// attempt. With attempts left the link goes back to `Disconnected` and
/// reconnects; otherwise it becomes `Fatal`. Events that cannot occur in the
/// current state also end in `Fatal`.
pub fn transition(state: LinkState, attempts_left: u32, event: LinkEvent) -> Transition {
    use LinkAction as A;
    use LinkEvent as E;
    use LinkState as S;

    match (state, event) {
        (S::Fatal, _) => Transition::to(S::Fatal, attempts_left, A::GiveUp),
        (_, _) if attempts_left == 0 => Transition::to(S::Fatal, 0, A::GiveUp),

        (S::Disconnected, E::Begin) => Transition::to(S::Disconnected, attempts_left, A::Connect),
        (S::Connected, E::Begin) => Transition::to(S::Sending, attempts_left, A::Send),
        (S::Disconnected, E::Connected) => Transition::to(S::Sending, attempts_left, A::Send),
        (S::Sending, E::Sent) => Transition::to(S::WaitingReply, attempts_left, A::Poll),
        (S::WaitingReply, E::ReplyReady) => {
            Transition::to(S::WaitingReply, attempts_left, A::Receive)
        }
        (S::WaitingReply, E::Received) => Transition::to(S::Connected, attempts_left, A::Deliver),

        (S::Disconnected, E::ConnectFailed)
        | (S::Sending, E::SendFailed)
        | (S::WaitingReply, E::PollTimedOut | E::PollFailed | E::ReceiveFailed) => {
            let left = attempts_left - 1;
            if left == 0 {
                Transition::to(S::Fatal, 0, A::GiveUp)
            } else {
                Transition::to(S::Disconnected, left, A::Connect)
            }
        }

        _ => Transition::to(S::Fatal, attempts_left, A::GiveUp),
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Errors surfaced by [`ReliableClient::call`].
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The retry budget was spent, now or on an earlier call.
    #[error("connection to {address} lost after {attempts} attempts")]
    ConnectionLost {
        /// Endpoint address.
        address: String,
        /// Attempts per call.
        attempts: u32,
    },

    /// The reply could not be decoded.
    #[error("malformed reply: {0}")]
    Malformed(#[from] MalformedFrame),

    /// The request could not be encoded.
    #[error("cannot encode request: {0}")]
    Encode(#[from] LengthOverflow),
}

/// Lock-step client over a [`Connector`].
pub struct ReliableClient<C: Connector> {
    connector: C,
    policy: RetryPolicy,
    channel: Option<C::Channel>,
    state: LinkState,
    connects: u64,
}

impl<C: Connector> ReliableClient<C> {
    /// Client that opens its first channel on the first call.
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self {
            connector,
            policy,
            channel: None,
            state: LinkState::Disconnected,
            connects: 0,
        }
    }

    /// Endpoint address.
    pub fn address(&self) -> &str {
        self.connector.address()
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Whether the retry budget has been spent.
    pub fn is_poisoned(&self) -> bool {
        self.state == LinkState::Fatal
    }

    /// Channels opened so far.
    pub fn connects(&self) -> u64 {
        self.connects
    }

    /// The retry policy in use.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send `request` and wait for its reply, reconnecting on stalls.
    ///
    /// Blocks at most poll timeout times retry budget.
    pub async fn call(&mut self, request: &Message) -> Result<Message, CallError> {
        if self.is_poisoned() {
            return Err(self.lost());
        }

        let frame = codec::encode(request)?;
        let budget = self.policy.retry_budget;
        let mut attempts = budget;
        let mut event = LinkEvent::Begin;
        let mut reply = None;
        let mut deadline = Instant::now() + self.policy.poll_timeout;

        loop {
            let attempt = budget - attempts + 1;
            let next = transition(self.state, attempts, event);
            if next.action == LinkAction::Connect && next.attempts_left < attempts {
                tracing::warn!(
                    address = %self.connector.address(),
                    attempt,
                    budget,
                    ?event,
                    "no reply, retrying on a fresh channel"
                );
            }
            self.state = next.state;
            attempts = next.attempts_left;

            event = match next.action {
                LinkAction::Connect => {
                    deadline = Instant::now() + self.policy.poll_timeout;
                    self.open_channel(deadline).await
                }
                LinkAction::Send => self.send(&frame, deadline).await,
                LinkAction::Poll => self.poll(deadline).await,
                LinkAction::Receive => match self.receive(deadline).await {
                    Some(bytes) => {
                        reply = Some(bytes);
                        LinkEvent::Received
                    }
                    None => LinkEvent::ReceiveFailed,
                },
                LinkAction::Deliver => {
                    let bytes = reply.take().unwrap_or_default();
                    return Ok(codec::decode(&bytes)?);
                }
                LinkAction::GiveUp => {
                    self.drop_channel();
                    tracing::error!(
                        address = %self.connector.address(),
                        budget,
                        "retry budget exhausted"
                    );
                    return Err(self.lost());
                }
            };
        }
    }

    /// Discard the open channel. The next call reconnects.
    pub fn disconnect(&mut self) {
        self.drop_channel();
        if self.state != LinkState::Fatal {
            self.state = LinkState::Disconnected;
        }
    }

    fn lost(&self) -> CallError {
        CallError::ConnectionLost {
            address: self.connector.address().to_string(),
            attempts: self.policy.retry_budget,
        }
    }

    fn drop_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.discard();
        }
    }

    async fn open_channel(&mut self, deadline: Instant) -> LinkEvent {
        self.drop_channel();
        match timeout_at(deadline, self.connector.connect()).await {
            Ok(Ok(channel)) => {
                self.connects += 1;
                self.channel = Some(channel);
                LinkEvent::Connected
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "connect failed");
                LinkEvent::ConnectFailed
            }
            Err(_) => {
                tracing::debug!("connect still pending at the attempt deadline");
                LinkEvent::ConnectFailed
            }
        }
    }

    async fn send(&mut self, frame: &[u8], deadline: Instant) -> LinkEvent {
        let Some(channel) = self.channel.as_mut() else {
            return LinkEvent::SendFailed;
        };
        match timeout_at(deadline, channel.send(frame)).await {
            Ok(Ok(())) => LinkEvent::Sent,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "send failed");
                LinkEvent::SendFailed
            }
            Err(_) => {
                tracing::debug!("peer not reading, send abandoned");
                LinkEvent::SendFailed
            }
        }
    }

    async fn poll(&mut self, deadline: Instant) -> LinkEvent {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return LinkEvent::PollTimedOut;
        }
        let Some(channel) = self.channel.as_mut() else {
            return LinkEvent::PollFailed;
        };
        match channel.poll_reply(remaining).await {
            Ok(PollOutcome::Ready) => LinkEvent::ReplyReady,
            Ok(PollOutcome::TimedOut) => LinkEvent::PollTimedOut,
            Err(e) => {
                tracing::debug!(error = %e, "poll failed");
                LinkEvent::PollFailed
            }
        }
    }

    async fn receive(&mut self, deadline: Instant) -> Option<Vec<u8>> {
        let channel = self.channel.as_mut()?;
        match timeout_at(deadline, channel.receive()).await {
            Ok(Ok(bytes)) => Some(bytes),
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "receive failed");
                None
            }
            Err(_) => {
                tracing::debug!("reply still incomplete at the attempt deadline");
                None
            }
        }
    }
}

impl<C: Connector> Drop for ReliableClient<C> {
    fn drop(&mut self) {
        self.drop_channel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::MessageType;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// How a fake channel answers the one request sent on it.
    #[derive(Debug, Clone)]
    pub(crate) enum Behavior {
        /// Never reply.
        Silent,
        /// Reply with these bytes.
        Reply(Vec<u8>),
        /// Fail the send.
        SendFails,
        /// Never finish the send, like a peer that stopped reading.
        SendHangs,
    }

    #[derive(Debug, Default)]
    pub(crate) struct Script {
        pub connect_failures: u32,
        pub connect_delay: Duration,
        pub behaviors: VecDeque<Behavior>,
        pub connects: u32,
        pub sends: Vec<(u32, Vec<u8>)>,
        pub discarded: Vec<u32>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeConnector {
        pub script: Arc<Mutex<Script>>,
    }

    impl FakeConnector {
        pub fn with(behaviors: Vec<Behavior>) -> Self {
            let connector = Self::default();
            connector.script.lock().unwrap().behaviors = behaviors.into();
            connector
        }

        pub fn sends(&self) -> Vec<(u32, Vec<u8>)> {
            self.script.lock().unwrap().sends.clone()
        }

        pub fn connects(&self) -> u32 {
            self.script.lock().unwrap().connects
        }
    }

    pub(crate) struct FakeChannel {
        id: u32,
        script: Arc<Mutex<Script>>,
        pending: Option<Vec<u8>>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Channel = FakeChannel;

        fn address(&self) -> &str {
            "fake:0"
        }

        async fn connect(&self) -> Result<FakeChannel, TransportError> {
            let delay = self.script.lock().unwrap().connect_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut script = self.script.lock().unwrap();
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                return Err(TransportError::Connect {
                    address: "fake:0".into(),
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                });
            }
            script.connects += 1;
            Ok(FakeChannel {
                id: script.connects,
                script: Arc::clone(&self.script),
                pending: None,
            })
        }
    }

    #[async_trait]
    impl Channel for FakeChannel {
        async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            let behavior = {
                let mut script = self.script.lock().unwrap();
                let behavior = script.behaviors.pop_front().unwrap_or(Behavior::Silent);
                if !matches!(behavior, Behavior::SendFails) {
                    script.sends.push((self.id, frame.to_vec()));
                }
                behavior
            };
            match behavior {
                Behavior::SendFails => Err(TransportError::Framing(
                    crate::framing::FramingError::ConnectionClosed,
                )),
                Behavior::SendHangs => std::future::pending().await,
                Behavior::Silent => Ok(()),
                Behavior::Reply(bytes) => {
                    self.pending = Some(bytes);
                    Ok(())
                }
            }
        }

        async fn poll_reply(&mut self, _timeout: Duration) -> Result<PollOutcome, TransportError> {
            Ok(if self.pending.is_some() {
                PollOutcome::Ready
            } else {
                PollOutcome::TimedOut
            })
        }

        async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
            self.pending.take().ok_or(TransportError::Stale)
        }

        fn discard(self) {
            self.script.lock().unwrap().discarded.push(self.id);
        }
    }

    fn reply_bytes(msg: &Message) -> Behavior {
        Behavior::Reply(codec::encode(msg).unwrap())
    }

    fn request() -> Message {
        Message::numeric(MessageType::InputData, vec![1.0, 2.0])
    }

    // -- transition ---------------------------------------------------------

    #[test]
    fn test_success_path_transitions() {
        let t = transition(LinkState::Disconnected, 3, LinkEvent::Begin);
        assert_eq!(t.action, LinkAction::Connect);
        let t = transition(t.state, t.attempts_left, LinkEvent::Connected);
        assert_eq!((t.state, t.action), (LinkState::Sending, LinkAction::Send));
        let t = transition(t.state, t.attempts_left, LinkEvent::Sent);
        assert_eq!((t.state, t.action), (LinkState::WaitingReply, LinkAction::Poll));
        let t = transition(t.state, t.attempts_left, LinkEvent::ReplyReady);
        assert_eq!(t.action, LinkAction::Receive);
        let t = transition(t.state, t.attempts_left, LinkEvent::Received);
        assert_eq!(t, Transition::to(LinkState::Connected, 3, LinkAction::Deliver));
    }

    #[test]
    fn test_connected_link_sends_without_reconnect() {
        let t = transition(LinkState::Connected, 3, LinkEvent::Begin);
        assert_eq!(t, Transition::to(LinkState::Sending, 3, LinkAction::Send));
    }

    #[test]
    fn test_timeout_costs_one_attempt_and_reconnects() {
        let t = transition(LinkState::WaitingReply, 3, LinkEvent::PollTimedOut);
        assert_eq!(t, Transition::to(LinkState::Disconnected, 2, LinkAction::Connect));
    }

    #[test]
    fn test_last_failure_is_fatal() {
        for event in [
            LinkEvent::PollTimedOut,
            LinkEvent::PollFailed,
            LinkEvent::ReceiveFailed,
        ] {
            let t = transition(LinkState::WaitingReply, 1, event);
            assert_eq!(t, Transition::to(LinkState::Fatal, 0, LinkAction::GiveUp));
        }
        let t = transition(LinkState::Disconnected, 1, LinkEvent::ConnectFailed);
        assert_eq!(t.state, LinkState::Fatal);
        let t = transition(LinkState::Sending, 1, LinkEvent::SendFailed);
        assert_eq!(t.state, LinkState::Fatal);
    }

    #[test]
    fn test_fatal_is_terminal() {
        let t = transition(LinkState::Fatal, 3, LinkEvent::Begin);
        assert_eq!(t, Transition::to(LinkState::Fatal, 3, LinkAction::GiveUp));
    }

    #[test]
    fn test_impossible_event_is_fatal() {
        let t = transition(LinkState::Connected, 3, LinkEvent::Received);
        assert_eq!(t.action, LinkAction::GiveUp);
    }

    // -- policy -------------------------------------------------------------

    #[test]
    fn test_policy_rejects_short_timeout() {
        assert_eq!(
            RetryPolicy::new(Duration::from_secs(1), 3),
            Err(PolicyError::TimeoutTooShort(Duration::from_secs(1)))
        );
        assert!(RetryPolicy::new(Duration::from_millis(1001), 3).is_ok());
    }

    #[test]
    fn test_policy_rejects_zero_budget() {
        assert_eq!(
            RetryPolicy::new(DEFAULT_POLL_TIMEOUT, 0),
            Err(PolicyError::ZeroBudget)
        );
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.poll_timeout(), Duration::from_millis(2500));
        assert_eq!(policy.retry_budget(), 3);
    }

    // -- executor -----------------------------------------------------------

    #[tokio::test]
    async fn test_first_attempt_reply_is_delivered() {
        let ack = Message::empty(MessageType::InputData);
        let connector = FakeConnector::with(vec![reply_bytes(&ack)]);
        let mut client = ReliableClient::new(connector.clone(), RetryPolicy::default());

        let reply = client.call(&request()).await.unwrap();
        assert_eq!(reply, ack);
        assert_eq!(client.state(), LinkState::Connected);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_channel_reused_across_calls() {
        let ack = Message::empty(MessageType::InputData);
        let connector = FakeConnector::with(vec![reply_bytes(&ack), reply_bytes(&ack)]);
        let mut client = ReliableClient::new(connector.clone(), RetryPolicy::default());

        client.call(&request()).await.unwrap();
        client.call(&request()).await.unwrap();
        assert_eq!(connector.connects(), 1);
        assert_eq!(client.connects(), 1);
    }

    #[tokio::test]
    async fn test_silent_peer_gets_exactly_budget_sends() {
        let connector = FakeConnector::default();
        let mut client = ReliableClient::new(connector.clone(), RetryPolicy::default());

        let result = client.call(&request()).await;
        assert!(matches!(
            result,
            Err(CallError::ConnectionLost { attempts: 3, .. })
        ));
        let sends = connector.sends();
        assert_eq!(sends.len(), 3);
        let expected = codec::encode(&request()).unwrap();
        assert!(sends.iter().all(|(_, frame)| *frame == expected));
    }

    #[tokio::test]
    async fn test_reply_on_attempt_k_wins() {
        let good = Message::numeric(MessageType::ComputeOutput, vec![7.0]);
        for k in 1..=3 {
            let mut behaviors = vec![Behavior::Silent; k - 1];
            behaviors.push(reply_bytes(&good));
            let connector = FakeConnector::with(behaviors);
            let mut client = ReliableClient::new(connector.clone(), RetryPolicy::default());

            let reply = client.call(&request()).await.unwrap();
            assert_eq!(reply, good);
            assert_eq!(connector.sends().len(), k);
        }
    }

    #[tokio::test]
    async fn test_every_retry_uses_a_fresh_channel() {
        let ack = Message::empty(MessageType::InputData);
        let connector =
            FakeConnector::with(vec![Behavior::Silent, Behavior::Silent, reply_bytes(&ack)]);
        let mut client = ReliableClient::new(connector.clone(), RetryPolicy::default());

        client.call(&request()).await.unwrap();
        let ids: Vec<u32> = connector.sends().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(connector.script.lock().unwrap().discarded, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_connect_failure_consumes_an_attempt() {
        let ack = Message::empty(MessageType::Connect);
        let connector = FakeConnector::with(vec![reply_bytes(&ack)]);
        connector.script.lock().unwrap().connect_failures = 2;
        let mut client = ReliableClient::new(connector.clone(), RetryPolicy::default());

        assert_eq!(client.call(&request()).await.unwrap(), ack);

        let connector = FakeConnector::default();
        connector.script.lock().unwrap().connect_failures = 3;
        let mut client = ReliableClient::new(connector.clone(), RetryPolicy::default());
        assert!(matches!(
            client.call(&request()).await,
            Err(CallError::ConnectionLost { .. })
        ));
        assert!(connector.sends().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_consumes_an_attempt() {
        let ack = Message::empty(MessageType::InputData);
        let connector = FakeConnector::with(vec![Behavior::SendFails, reply_bytes(&ack)]);
        let mut client = ReliableClient::new(connector.clone(), RetryPolicy::default());

        assert_eq!(client.call(&request()).await.unwrap(), ack);
        assert_eq!(connector.connects(), 2);
    }

    fn short_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1100), 2).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connect_counts_against_the_attempt() {
        let connector = FakeConnector::default();
        connector.script.lock().unwrap().connect_delay = Duration::from_millis(2400);
        let mut client = ReliableClient::new(connector.clone(), short_policy());

        let started = Instant::now();
        let result = client.call(&request()).await;
        assert!(matches!(
            result,
            Err(CallError::ConnectionLost { attempts: 2, .. })
        ));
        assert!(started.elapsed() <= Duration::from_millis(2200));
        assert!(connector.sends().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_send_counts_against_the_attempt() {
        let ack = Message::empty(MessageType::InputData);
        let connector = FakeConnector::with(vec![Behavior::SendHangs, reply_bytes(&ack)]);
        let mut client = ReliableClient::new(connector.clone(), short_policy());

        let started = Instant::now();
        assert_eq!(client.call(&request()).await.unwrap(), ack);
        assert!(started.elapsed() <= Duration::from_millis(1100));
        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.script.lock().unwrap().discarded, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_inside_the_deadline_still_sends() {
        let connector = FakeConnector::default();
        connector.script.lock().unwrap().connect_delay = Duration::from_millis(800);
        let mut client = ReliableClient::new(connector.clone(), short_policy());

        let started = Instant::now();
        assert!(client.call(&request()).await.is_err());
        assert!(started.elapsed() <= Duration::from_millis(2200));
        assert_eq!(connector.sends().len(), 2);
    }

    #[tokio::test]
    async fn test_peer_that_never_reads_cannot_block_a_call() {
        use crate::framing::FramingConfig;
        use crate::transport::TcpConnector;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                held.push(stream);
            }
        });

        let connector = TcpConnector::new(addr.to_string()).with_framing(FramingConfig {
            max_frame_len: 64 << 20,
        });
        let mut client = ReliableClient::new(connector, short_policy());
        // Far larger than the socket buffers on both ends.
        let big = Message::numeric(MessageType::InputData, vec![0.5; 6 << 20]);

        let started = std::time::Instant::now();
        let result = client.call(&big).await;
        assert!(matches!(result, Err(CallError::ConnectionLost { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
        peer.abort();
    }

    #[tokio::test]
    async fn test_poisoned_client_fails_without_io() {
        let connector = FakeConnector::default();
        let mut client = ReliableClient::new(connector.clone(), RetryPolicy::default());
        assert!(client.call(&request()).await.is_err());
        assert!(client.is_poisoned());

        let connects = connector.connects();
        let result = client.call(&request()).await;
        assert!(matches!(result, Err(CallError::ConnectionLost { .. })));
        assert_eq!(connector.connects(), connects);
        assert_eq!(connector.sends().len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_reply_surfaces() {
        let connector = FakeConnector::with(vec![Behavior::Reply(vec![1, 2, 3])]);
        let mut client = ReliableClient::new(connector, RetryPolicy::default());

        let result = client.call(&request()).await;
        assert!(matches!(
            result,
            Err(CallError::Malformed(MalformedFrame::TooShort { len: 3 }))
        ));
        assert!(!client.is_poisoned());
    }

    #[tokio::test]
    async fn test_disconnect_forces_new_channel() {
        let ack = Message::empty(MessageType::InputData);
        let connector = FakeConnector::with(vec![reply_bytes(&ack), reply_bytes(&ack)]);
        let mut client = ReliableClient::new(connector.clone(), RetryPolicy::default());

        client.call(&request()).await.unwrap();
        client.disconnect();
        assert_eq!(client.state(), LinkState::Disconnected);
        client.call(&request()).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }
}
