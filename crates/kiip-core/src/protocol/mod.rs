//! Connection and authentication protocol.
//!
//! [`ConnectionProtocol`] ties a [`KiipTransport`] to the connection machine:
//! connectivity changes drive the outer machine, and each established
//! connection runs its own authentication machine.

pub mod auth;
pub mod connection;

use std::{cell::RefCell, fmt, rc::Rc};

pub use auth::{
    AuthEvent, AuthEventKind, AuthMachine, AuthState, AuthStateKind, INVALID_CODE_ERROR, TOKEN_STORAGE_KEY,
    create_auth_machine,
};
pub use connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionMachine, ConnectionState, ConnectionStateKind,
    create_connection_machine,
};

use crate::{
    env::Environment,
    store::SessionStore,
    subscription::{Subscribers, Subscription},
    transport::KiipTransport,
};

/// Client side of the Kiip protocol over one transport.
///
/// Dropping the protocol destroys its machines; the transport is left as is.
pub struct ConnectionProtocol<E: Environment> {
    machine: ConnectionMachine,
    transport: KiipTransport<E>,
    listeners: RefCell<Vec<Subscription>>,
    auth_watch: Rc<RefCell<Option<Subscription>>>,
    auth_subscribers: Rc<Subscribers<AuthState>>,
}

impl<E: Environment> ConnectionProtocol<E> {
    /// Wire `transport` into a new connection machine.
    ///
    /// The machine is fed the transport's current connectivity at once, so a
    /// protocol created on a connected transport starts authenticating
    /// immediately.
    pub fn new(transport: KiipTransport<E>, session: SessionStore, env: E) -> Self {
        let machine = create_connection_machine(transport.clone(), session, env);
        let auth_watch: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let auth_subscribers = Rc::new(Subscribers::new());

        // Follow whichever authentication machine is current.
        let follow = {
            let auth_watch = Rc::clone(&auth_watch);
            let auth_subscribers = Rc::clone(&auth_subscribers);
            machine.subscribe(move |state: &ConnectionState| {
                let previous = auth_watch.borrow_mut().take();
                if let Some(previous) = previous {
                    previous.unsubscribe();
                }
                if let Some(auth) = state.auth() {
                    let forward = Rc::clone(&auth_subscribers);
                    let watch = auth.subscribe(move |auth_state| forward.emit(auth_state));
                    *auth_watch.borrow_mut() = Some(watch);
                }
            })
        };

        let connectivity = {
            let machine = machine.clone();
            transport.on_state(move |state| machine.emit((*state).into()))
        };

        let broadcasts = transport.on_any_message(|message| {
            if connection::is_broadcast_error(message) {
                tracing::warn!(?message, "Server error");
            }
        });

        machine.emit(transport.state().into());

        Self {
            machine,
            transport,
            listeners: RefCell::new(vec![follow, connectivity, broadcasts]),
            auth_watch,
            auth_subscribers,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    /// Current authentication state, when connected.
    pub fn auth_state(&self) -> Option<AuthState> {
        self.machine.state().auth().map(AuthMachine::state)
    }

    /// Observe connection states, starting with the current one.
    pub fn subscribe(&self, listener: impl Fn(&ConnectionState) + 'static) -> Subscription {
        self.machine.subscribe(listener)
    }

    /// Observe authentication states of every connection, starting with the
    /// current one when connected.
    pub fn subscribe_auth(&self, listener: impl Fn(&AuthState) + 'static) -> Subscription {
        if let Some(current) = self.auth_state() {
            listener(&current);
        }
        self.auth_subscribers.subscribe(listener)
    }

    /// Ask for a login code mailed to `email`.
    pub fn login(&self, email: impl Into<String>) {
        self.machine.emit(ConnectionEvent::Auth(AuthEvent::RequestLoginMail { email: email.into() }));
    }

    /// Submit the mailed login code.
    pub fn send_login_code(&self, code: impl Into<String>) {
        self.machine.emit(ConnectionEvent::Auth(AuthEvent::SendLoginCode { code: code.into() }));
    }

    /// Transport this protocol runs on.
    pub fn transport(&self) -> &KiipTransport<E> {
        &self.transport
    }

    /// Detach from the transport and destroy every machine. Idempotent.
    pub fn destroy(&self) {
        let listeners: Vec<_> = self.listeners.borrow_mut().drain(..).collect();
        for listener in listeners {
            listener.unsubscribe();
        }
        let watch = self.auth_watch.borrow_mut().take();
        if let Some(watch) = watch {
            watch.unsubscribe();
        }
        self.auth_subscribers.clear();
        self.machine.destroy();
    }
}

impl<E: Environment> Drop for ConnectionProtocol<E> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<E: Environment> fmt::Debug for ConnectionProtocol<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProtocol").field("state", &self.machine.state()).finish()
    }
}
