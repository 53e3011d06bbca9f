//! Scripted sockets.
//!
//! [`SimSocketFactory`] hands out sockets whose fate is decided by the test:
//! accepted or refused after a virtual latency, or left pending until the
//! test opens them. The server side of the current socket can push frames,
//! fail, or hang up, and an optional responder answers every client frame.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
    time::Duration,
};

use kiip_core::{Environment, Socket, SocketEvent, SocketEvents, SocketFactory};

use crate::SimEnv;

/// What happens to newly opened sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptMode {
    /// Open after the configured latency.
    Accept,
    /// Fail after the configured latency.
    Refuse,
    /// Stay pending until [`SimSocketFactory::open_pending`].
    Manual,
}

/// Answers a client frame with zero or more server frames.
pub type Responder = Rc<dyn Fn(&str) -> Vec<String>>;

struct SocketState {
    url: String,
    events: SocketEvents,
    open: Cell<bool>,
    closed: Cell<bool>,
    sent: RefCell<Vec<String>>,
}

impl SocketState {
    fn is_live(&self) -> bool {
        self.open.get() && !self.closed.get()
    }
}

struct Inner {
    env: SimEnv,
    mode: Cell<AcceptMode>,
    latency: Cell<Duration>,
    responder: RefCell<Option<Responder>>,
    sockets: RefCell<Vec<Rc<SocketState>>>,
}

/// Socket factory driven by the test.
#[derive(Clone)]
pub struct SimSocketFactory {
    inner: Rc<Inner>,
}

impl SimSocketFactory {
    /// Factory accepting every socket after 10 ms of virtual time.
    pub fn new(env: &SimEnv) -> Self {
        Self {
            inner: Rc::new(Inner {
                env: env.clone(),
                mode: Cell::new(AcceptMode::Accept),
                latency: Cell::new(Duration::from_millis(10)),
                responder: RefCell::new(None),
                sockets: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Decide the fate of sockets opened from now on.
    pub fn set_mode(&self, mode: AcceptMode) {
        self.inner.mode.set(mode);
    }

    /// Delay of accept, refuse and responder frames.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.latency.set(latency);
    }

    /// Answer every client frame with `responder`.
    pub fn set_responder(&self, responder: impl Fn(&str) -> Vec<String> + 'static) {
        *self.inner.responder.borrow_mut() = Some(Rc::new(responder));
    }

    /// Number of sockets opened so far.
    pub fn sockets_opened(&self) -> usize {
        self.inner.sockets.borrow().len()
    }

    /// Number of sockets currently open.
    pub fn live_sockets(&self) -> usize {
        self.inner.sockets.borrow().iter().filter(|s| s.is_live()).count()
    }

    /// URL the last socket was opened with.
    pub fn last_url(&self) -> Option<String> {
        self.inner.sockets.borrow().last().map(|s| s.url.clone())
    }

    /// Open the most recent pending socket.
    pub fn open_pending(&self) -> bool {
        let Some(socket) = self.latest() else { return false };
        if socket.open.get() || socket.closed.get() {
            return false;
        }
        socket.open.set(true);
        (socket.events)(SocketEvent::Open);
        true
    }

    /// Deliver `frame` from the server on the live socket.
    pub fn push(&self, frame: &str) -> bool {
        let Some(socket) = self.live() else { return false };
        (socket.events)(SocketEvent::Message(frame.to_string()));
        true
    }

    /// Server hangs up the live socket.
    pub fn disconnect(&self) -> bool {
        let Some(socket) = self.live() else { return false };
        socket.open.set(false);
        socket.closed.set(true);
        (socket.events)(SocketEvent::Close);
        true
    }

    /// Live socket reports an error, followed by a close.
    pub fn fail(&self, reason: &str) -> bool {
        let Some(socket) = self.live() else { return false };
        socket.open.set(false);
        socket.closed.set(true);
        (socket.events)(SocketEvent::Error(reason.to_string()));
        (socket.events)(SocketEvent::Close);
        true
    }

    /// Every frame written by the client, oldest first, across sockets.
    pub fn sent_frames(&self) -> Vec<String> {
        self.inner.sockets.borrow().iter().flat_map(|s| s.sent.borrow().clone()).collect()
    }

    /// Last frame written by the client.
    pub fn last_sent(&self) -> Option<String> {
        self.sent_frames().pop()
    }

    /// `requestId` of the last frame written by the client.
    pub fn last_request_id(&self) -> Option<String> {
        let frame = self.last_sent()?;
        let value: serde_json::Value = serde_json::from_str(&frame).ok()?;
        value.get("requestId")?.as_str().map(str::to_string)
    }

    fn latest(&self) -> Option<Rc<SocketState>> {
        self.inner.sockets.borrow().last().cloned()
    }

    fn live(&self) -> Option<Rc<SocketState>> {
        self.latest().filter(|s| s.is_live())
    }
}

impl SocketFactory for SimSocketFactory {
    fn open(&self, url: &str, events: SocketEvents) -> Box<dyn Socket> {
        let state = Rc::new(SocketState {
            url: url.to_string(),
            events,
            open: Cell::new(false),
            closed: Cell::new(false),
            sent: RefCell::new(Vec::new()),
        });
        self.inner.sockets.borrow_mut().push(Rc::clone(&state));

        let mode = self.inner.mode.get();
        tracing::trace!(url, ?mode, "Sim socket opened");
        if mode != AcceptMode::Manual {
            let pending = Rc::clone(&state);
            self.inner.env.set_timer(
                self.inner.latency.get(),
                Box::new(move || {
                    if pending.closed.get() {
                        return;
                    }
                    match mode {
                        AcceptMode::Accept => {
                            pending.open.set(true);
                            (pending.events)(SocketEvent::Open);
                        },
                        _ => {
                            pending.closed.set(true);
                            (pending.events)(SocketEvent::Error("connection refused".to_string()));
                            (pending.events)(SocketEvent::Close);
                        },
                    }
                }),
            );
        }

        Box::new(SimSocket { state, factory: Rc::downgrade(&self.inner) })
    }
}

impl fmt::Debug for SimSocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimSocketFactory")
            .field("mode", &self.inner.mode.get())
            .field("sockets_opened", &self.sockets_opened())
            .finish()
    }
}

/// Client end of a simulated socket.
struct SimSocket {
    state: Rc<SocketState>,
    factory: Weak<Inner>,
}

impl Socket for SimSocket {
    fn send(&self, frame: &str) {
        if !self.state.is_live() {
            return;
        }
        self.state.sent.borrow_mut().push(frame.to_string());

        let Some(factory) = self.factory.upgrade() else { return };
        let responder = factory.responder.borrow().clone();
        let Some(responder) = responder else { return };

        for reply in responder(frame) {
            let socket = Rc::clone(&self.state);
            factory.env.set_timer(
                factory.latency.get(),
                Box::new(move || {
                    if socket.is_live() {
                        (socket.events)(SocketEvent::Message(reply));
                    }
                }),
            );
        }
    }

    fn close(&self) {
        if self.state.closed.replace(true) {
            return;
        }
        self.state.open.set(false);

        // The peer confirms the close later, like a real socket.
        if let Some(factory) = self.factory.upgrade() {
            let socket = Rc::clone(&self.state);
            factory.env.set_timer(Duration::ZERO, Box::new(move || (socket.events)(SocketEvent::Close)));
        }
    }
}
