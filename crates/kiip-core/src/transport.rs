//! Self-healing socket wrapper.
//!
//! Wraps an unreliable text socket supplied by a [`SocketFactory`], reconnects
//! it after every unplanned close, and translates frames to typed messages
//! through a [`Codec`].
//!
//! # Connectivity
//!
//! ```text
//!                 connect()            Open
//! ┌──────────────┐ ───────> ┌────────────┐ ───────> ┌───────────┐
//! │ Disconnected │          │ Connecting │          │ Connected │
//! └──────────────┘ <─────── └────────────┘          └───────────┘
//!        ^  │       Close/Error                            │
//!        │  └── reconnect timer ──> connect()              │
//!        └─────────────────────── Close/Error ─────────────┘
//! ```
//!
//! A user [`ResilientTransport::close`] stops the reconnect loop until the
//! next explicit [`ResilientTransport::connect`].

use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    rc::{Rc, Weak},
    time::Duration,
};

use kiip_proto::{Codec, Envelope, KiipCodec};

use crate::{
    env::{Environment, TimerId},
    subscription::{Subscribers, Subscription},
};

/// Delay between an unplanned close and the next connection attempt.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Raw event produced by a [`Socket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The connection is established.
    Open,
    /// A text frame arrived.
    Message(String),
    /// The connection closed, from either side.
    Close,
    /// The connection failed.
    Error(String),
}

/// Sink for the events of one socket.
pub type SocketEvents = Rc<dyn Fn(SocketEvent)>;

/// Bidirectional text socket.
pub trait Socket {
    /// Write a text frame. Frames written before `Open` may be lost.
    fn send(&self, frame: &str);

    /// Close the socket. Closing twice is a no-op.
    fn close(&self);
}

/// Opens sockets for the transport.
pub trait SocketFactory {
    /// Start connecting to `url`.
    ///
    /// Events for the new socket are delivered to `events`, never
    /// synchronously from inside `open`.
    fn open(&self, url: &str, events: SocketEvents) -> Box<dyn Socket>;
}

/// Connectivity of a [`ResilientTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// No socket. A reconnect may be pending.
    Disconnected,
    /// A socket is opening.
    Connecting,
    /// The socket is open.
    Connected,
}

/// Lifecycle notification of a [`ResilientTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection attempt started.
    Connecting,
    /// A socket opened.
    Connected,
    /// The socket closed, by the peer, an error, or the user.
    Closed,
    /// The socket reported an error.
    Error(String),
}

/// How long to wait before each reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Always wait the configured interval.
    #[default]
    Fixed,
    /// Double the interval after each failed attempt, up to `max`.
    Backoff {
        /// Upper bound on the delay.
        max: Duration,
    },
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based, reset by a
    /// successful open).
    pub fn delay(&self, interval: Duration, attempt: u32) -> Duration {
        match self {
            Self::Fixed => interval,
            Self::Backoff { max } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                interval.saturating_mul(factor).min(*max)
            },
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base delay before reconnecting
    pub reconnect_interval: Duration,
    /// Treat socket errors as a close and reconnect
    pub reconnect_on_error: bool,
    /// Connect from the constructor
    pub auto_connect: bool,
    /// Delay schedule for consecutive failures
    pub reconnect_policy: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            reconnect_on_error: true,
            auto_connect: true,
            reconnect_policy: ReconnectPolicy::Fixed,
        }
    }
}

/// Inbound handlers keyed by envelope discriminator.
///
/// Only the handler registered for a message's kind runs.
pub struct MessageHandlers<M: Envelope> {
    handlers: HashMap<M::Kind, Box<dyn Fn(&M)>>,
}

impl<M: Envelope> MessageHandlers<M> {
    /// No handlers.
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// Handle messages of `kind`, replacing a previous handler.
    pub fn on(mut self, kind: M::Kind, handler: impl Fn(&M) + 'static) -> Self {
        self.handlers.insert(kind, Box::new(handler));
        self
    }

    /// Run the handler matching `message`. Returns whether one ran.
    pub fn dispatch(&self, message: &M) -> bool {
        match self.handlers.get(&message.kind()) {
            Some(handler) => {
                handler(message);
                true
            },
            None => false,
        }
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<M: Envelope> Default for MessageHandlers<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Envelope> fmt::Debug for MessageHandlers<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandlers").field("kinds", &self.handlers.keys().collect::<Vec<_>>()).finish()
    }
}

struct Conn {
    socket: Option<Rc<dyn Socket>>,
    state: ConnectivityState,
    /// Bumped whenever a socket is opened or detached. Events carrying an
    /// older value come from a detached socket.
    generation: u64,
    reconnect_timer: Option<TimerId>,
    user_closed: bool,
    /// Consecutive reconnects since the last successful open.
    attempts: u32,
}

struct Inner<C: Codec, E: Environment> {
    url: String,
    codec: C,
    factory: Box<dyn SocketFactory>,
    env: E,
    config: TransportConfig,
    conn: RefCell<Conn>,
    states: Subscribers<ConnectivityState>,
    messages: Subscribers<C::Down>,
    events: Subscribers<TransportEvent>,
}

impl<C: Codec, E: Environment> Inner<C, E> {
    fn connect(self: &Rc<Self>) {
        let (generation, pending) = {
            let mut conn = self.conn.borrow_mut();
            if conn.socket.is_some() {
                tracing::trace!(url = %self.url, "Connect ignored, socket already open");
                return;
            }
            conn.user_closed = false;
            conn.generation += 1;
            (conn.generation, conn.reconnect_timer.take())
        };
        if let Some(timer) = pending {
            self.env.cancel_timer(timer);
        }

        tracing::info!(url = %self.url, "Connecting");
        let weak: Weak<Self> = Rc::downgrade(self);
        let events: SocketEvents = Rc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_socket_event(generation, event);
            }
        });
        let socket: Rc<dyn Socket> = Rc::from(self.factory.open(&self.url, events));
        self.conn.borrow_mut().socket = Some(socket);

        self.set_state(ConnectivityState::Connecting);
        self.events.emit(&TransportEvent::Connecting);
    }

    fn handle_socket_event(self: &Rc<Self>, generation: u64, event: SocketEvent) {
        if self.conn.borrow().generation != generation {
            tracing::trace!(url = %self.url, ?event, "Ignoring event from detached socket");
            return;
        }

        match event {
            SocketEvent::Open => {
                self.conn.borrow_mut().attempts = 0;
                tracing::info!(url = %self.url, "Connected");
                self.set_state(ConnectivityState::Connected);
                self.events.emit(&TransportEvent::Connected);
            },
            SocketEvent::Message(frame) => match self.codec.decode(&frame) {
                Ok(message) => self.messages.emit(&message),
                Err(e) => tracing::debug!(url = %self.url, error = %e, "Dropping malformed frame"),
            },
            SocketEvent::Close => {
                tracing::info!(url = %self.url, "Socket closed");
                self.detach_and_retry();
            },
            SocketEvent::Error(reason) => {
                tracing::warn!(url = %self.url, %reason, "Socket error");
                self.events.emit(&TransportEvent::Error(reason));
                if self.config.reconnect_on_error {
                    self.detach_and_retry();
                }
            },
        }
    }

    /// Drop the current socket after an unplanned close and arm a reconnect.
    fn detach_and_retry(self: &Rc<Self>) {
        let (socket, attempt) = {
            let mut conn = self.conn.borrow_mut();
            conn.generation += 1;
            (conn.socket.take(), conn.attempts)
        };
        if let Some(socket) = socket {
            socket.close();
        }

        self.set_state(ConnectivityState::Disconnected);
        self.events.emit(&TransportEvent::Closed);

        // A listener may have reconnected or closed in the meantime.
        {
            let conn = self.conn.borrow();
            if conn.user_closed || conn.socket.is_some() || conn.reconnect_timer.is_some() {
                return;
            }
        }

        let delay = self.config.reconnect_policy.delay(self.config.reconnect_interval, attempt);
        tracing::debug!(url = %self.url, attempt, ?delay, "Scheduling reconnect");

        let weak = Rc::downgrade(self);
        let timer = self.env.set_timer(
            delay,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else { return };
                {
                    let mut conn = inner.conn.borrow_mut();
                    conn.reconnect_timer = None;
                    if conn.user_closed {
                        return;
                    }
                    conn.attempts = conn.attempts.saturating_add(1);
                }
                inner.connect();
            }),
        );
        self.conn.borrow_mut().reconnect_timer = Some(timer);
    }

    fn close(&self) {
        let (socket, pending) = {
            let mut conn = self.conn.borrow_mut();
            conn.user_closed = true;
            conn.generation += 1;
            (conn.socket.take(), conn.reconnect_timer.take())
        };
        if let Some(timer) = pending {
            self.env.cancel_timer(timer);
        }

        if let Some(socket) = socket {
            tracing::info!(url = %self.url, "Closing");
            socket.close();
            self.set_state(ConnectivityState::Disconnected);
            self.events.emit(&TransportEvent::Closed);
        }
    }

    fn set_state(&self, state: ConnectivityState) {
        let changed = {
            let mut conn = self.conn.borrow_mut();
            let changed = conn.state != state;
            conn.state = state;
            changed
        };
        if changed {
            self.states.emit(&state);
        }
    }
}

impl<C: Codec, E: Environment> Drop for Inner<C, E> {
    fn drop(&mut self) {
        let conn = self.conn.get_mut();
        if let Some(timer) = conn.reconnect_timer.take() {
            self.env.cancel_timer(timer);
        }
        if let Some(socket) = conn.socket.take() {
            socket.close();
        }
    }
}

/// Reconnecting socket with typed framing.
///
/// Cheap to clone; clones share the same connection. The socket is closed
/// when the last clone is dropped.
pub struct ResilientTransport<C: Codec, E: Environment> {
    inner: Rc<Inner<C, E>>,
}

/// Transport speaking the Kiip client protocol.
pub type KiipTransport<E> = ResilientTransport<KiipCodec, E>;

impl<C: Codec, E: Environment> ResilientTransport<C, E> {
    /// Create a transport for `url`. Connects immediately when
    /// [`TransportConfig::auto_connect`] is set.
    pub fn new(
        url: impl Into<String>,
        codec: C,
        factory: impl SocketFactory + 'static,
        env: E,
        config: TransportConfig,
    ) -> Self {
        let auto_connect = config.auto_connect;
        let inner = Rc::new(Inner {
            url: url.into(),
            codec,
            factory: Box::new(factory),
            env,
            config,
            conn: RefCell::new(Conn {
                socket: None,
                state: ConnectivityState::Disconnected,
                generation: 0,
                reconnect_timer: None,
                user_closed: false,
                attempts: 0,
            }),
            states: Subscribers::new(),
            messages: Subscribers::new(),
            events: Subscribers::new(),
        });

        let transport = Self { inner };
        if auto_connect {
            transport.connect();
        }
        transport
    }

    /// Open a socket unless one is already opening or open.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Close the socket and stop reconnecting until the next
    /// [`ResilientTransport::connect`].
    pub fn close(&self) {
        self.inner.close();
    }

    /// Encode and write `message`.
    ///
    /// Dropped when the socket is not open or the codec rejects the message.
    /// There is no outbound queue: callers match answers by correlation id.
    pub fn send(&self, message: &C::Up) {
        let socket = {
            let conn = self.inner.conn.borrow();
            match conn.state {
                ConnectivityState::Connected => conn.socket.clone(),
                _ => None,
            }
        };
        let Some(socket) = socket else {
            tracing::debug!(url = %self.inner.url, "Dropping outbound message, not connected");
            return;
        };

        match self.inner.codec.encode(message) {
            Ok(frame) => socket.send(&frame),
            Err(e) => tracing::debug!(url = %self.inner.url, error = %e, "Dropping unencodable message"),
        }
    }

    /// Current connectivity.
    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        self.inner.conn.borrow().state
    }

    /// Server URL.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Observe connectivity changes. Repeated states are not reported.
    pub fn on_state(&self, listener: impl Fn(&ConnectivityState) + 'static) -> Subscription {
        self.inner.states.subscribe(listener)
    }

    /// Observe every decoded inbound message.
    pub fn on_any_message(&self, listener: impl Fn(&C::Down) + 'static) -> Subscription {
        self.inner.messages.subscribe(listener)
    }

    /// Observe lifecycle events.
    pub fn on_event(&self, listener: impl Fn(&TransportEvent) + 'static) -> Subscription {
        self.inner.events.subscribe(listener)
    }
}

impl<C, E> ResilientTransport<C, E>
where
    C: Codec,
    C::Down: Envelope,
    E: Environment,
{
    /// Route inbound messages to `handlers` by kind.
    pub fn on_message(&self, handlers: MessageHandlers<C::Down>) -> Subscription {
        self.inner.messages.subscribe(move |message| {
            handlers.dispatch(message);
        })
    }
}

impl<C: Codec, E: Environment> Clone for ResilientTransport<C, E> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<C: Codec, E: Environment> fmt::Debug for ResilientTransport<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientTransport")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use kiip_proto::{DownKind, DownMessage, RequestId};

    use super::*;

    #[test]
    fn fixed_policy_ignores_attempts() {
        let policy = ReconnectPolicy::Fixed;
        assert_eq!(policy.delay(Duration::from_secs(1), 0), Duration::from_secs(1));
        assert_eq!(policy.delay(Duration::from_secs(1), 40), Duration::from_secs(1));
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let policy = ReconnectPolicy::Backoff { max: Duration::from_secs(10) };
        let interval = Duration::from_millis(500);

        assert_eq!(policy.delay(interval, 0), Duration::from_millis(500));
        assert_eq!(policy.delay(interval, 1), Duration::from_secs(1));
        assert_eq!(policy.delay(interval, 3), Duration::from_secs(4));
        assert_eq!(policy.delay(interval, 5), Duration::from_secs(10));
        assert_eq!(policy.delay(interval, 64), Duration::from_secs(10));
    }

    #[test]
    fn default_config_reconnects_forever() {
        let config = TransportConfig::default();
        assert_eq!(config.reconnect_interval, DEFAULT_RECONNECT_INTERVAL);
        assert!(config.reconnect_on_error);
        assert!(config.auto_connect);
        assert_eq!(config.reconnect_policy, ReconnectPolicy::Fixed);
    }

    #[test]
    fn handlers_dispatch_by_kind_only() {
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let handlers = MessageHandlers::<DownMessage>::new().on(DownKind::InvalidToken, move |_| h.set(h.get() + 1));

        assert!(handlers.dispatch(&DownMessage::InvalidToken { request_id: RequestId::new("r1") }));
        assert!(!handlers.dispatch(&DownMessage::InvalidLoginCode { request_id: RequestId::new("r1") }));
        assert_eq!(hits.get(), 1);
    }
}
