//! Connection lifecycle machine.
//!
//! Mirrors transport connectivity and owns one [`AuthMachine`] per
//! established connection. A fresh authentication machine is created on every
//! (re)connect and destroyed when the connection is lost.

use kiip_proto::DownMessage;

use super::auth::{AuthEvent, AuthMachine, create_auth_machine};
use crate::{
    env::Environment,
    machine::{MachineConfig, StateConfig, StateMachine, Tagged},
    store::SessionStore,
    subscription::Cleanup,
    transport::{ConnectivityState, KiipTransport},
};

/// Connection state.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No socket.
    Void,
    /// Socket opening.
    Connecting,
    /// Socket open; authentication runs in `auth`.
    Connected {
        /// Authentication machine of this connection.
        auth: AuthMachine,
    },
}

impl ConnectionState {
    /// Authentication machine, when connected.
    pub fn auth(&self) -> Option<&AuthMachine> {
        match self {
            Self::Connected { auth } => Some(auth),
            _ => None,
        }
    }
}

/// Fieldless discriminator of [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStateKind {
    /// [`ConnectionState::Void`]
    Void,
    /// [`ConnectionState::Connecting`]
    Connecting,
    /// [`ConnectionState::Connected`]
    Connected,
}

impl Tagged for ConnectionState {
    type Tag = ConnectionStateKind;

    fn tag(&self) -> ConnectionStateKind {
        match self {
            Self::Void => ConnectionStateKind::Void,
            Self::Connecting => ConnectionStateKind::Connecting,
            Self::Connected { .. } => ConnectionStateKind::Connected,
        }
    }
}

/// Input of the connection machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Transport lost its socket.
    Disconnected,
    /// Transport started connecting.
    Connecting,
    /// Transport socket opened.
    Connected,
    /// User intent for the authentication machine.
    Auth(AuthEvent),
}

/// Fieldless discriminator of [`ConnectionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    /// [`ConnectionEvent::Disconnected`]
    Disconnected,
    /// [`ConnectionEvent::Connecting`]
    Connecting,
    /// [`ConnectionEvent::Connected`]
    Connected,
    /// [`ConnectionEvent::Auth`]
    Auth,
}

impl Tagged for ConnectionEvent {
    type Tag = ConnectionEventKind;

    fn tag(&self) -> ConnectionEventKind {
        match self {
            Self::Disconnected => ConnectionEventKind::Disconnected,
            Self::Connecting => ConnectionEventKind::Connecting,
            Self::Connected => ConnectionEventKind::Connected,
            Self::Auth(_) => ConnectionEventKind::Auth,
        }
    }
}

impl From<ConnectivityState> for ConnectionEvent {
    fn from(state: ConnectivityState) -> Self {
        match state {
            ConnectivityState::Disconnected => Self::Disconnected,
            ConnectivityState::Connecting => Self::Connecting,
            ConnectivityState::Connected => Self::Connected,
        }
    }
}

/// Connection machine driving one [`AuthMachine`] per connection.
pub type ConnectionMachine = StateMachine<ConnectionState, ConnectionEvent>;

type ConnectionStateConfig = StateConfig<ConnectionState, ConnectionEvent>;

/// Build the connection machine. It starts in [`ConnectionState::Void`]; feed
/// it the transport's connectivity.
pub fn create_connection_machine<E: Environment>(
    transport: KiipTransport<E>,
    session: SessionStore,
    env: E,
) -> ConnectionMachine {
    let connect = move |_: ConnectionEvent, _: &ConnectionState| {
        let auth = create_auth_machine(transport.clone(), session.clone(), env.clone());
        Some(ConnectionState::Connected { auth })
    };

    let void = ConnectionStateConfig::new()
        .on(ConnectionEventKind::Connecting, |_, _| Some(ConnectionState::Connecting))
        .on(ConnectionEventKind::Connected, connect.clone());

    let connecting = ConnectionStateConfig::new()
        .on(ConnectionEventKind::Disconnected, |_, _| Some(ConnectionState::Void))
        .on(ConnectionEventKind::Connected, connect.clone());

    let connected = ConnectionStateConfig::new()
        .on(ConnectionEventKind::Disconnected, |_, _| Some(ConnectionState::Void))
        .on(ConnectionEventKind::Connected, connect)
        .on(ConnectionEventKind::Auth, |event, state| {
            if let (ConnectionEvent::Auth(event), ConnectionState::Connected { auth }) = (event, state) {
                auth.emit(event);
            }
            None
        })
        .effect(|state, _| {
            let auth = state.auth()?.clone();
            Some(Cleanup::new(move || auth.destroy()))
        });

    let config = MachineConfig::new("connection")
        .state(ConnectionStateKind::Void, void)
        .state(ConnectionStateKind::Connecting, connecting)
        .state(ConnectionStateKind::Connected, connected);

    StateMachine::new(ConnectionState::Void, config)
}

/// Whether `message` is an unsolicited server error.
pub(crate) fn is_broadcast_error(message: &DownMessage) -> bool {
    matches!(message, DownMessage::Error { request_id: None, .. })
}
