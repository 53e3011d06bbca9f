//! Client runtime.
//!
//! Wires the core to production seams: [`SystemEnv`] timers, a [`FileStore`]
//! shared with the other instances using the same directory, and
//! tungstenite sockets. Only the elected leader keeps the server connection
//! open; the others close it and wait for leadership.

use std::{cell::RefCell, path::PathBuf, rc::Rc, time::Duration};

use kiip_core::{
    ActivityRank, AuthState, ConnectionProtocol, ConnectivityState, ElectionConfig, KiipTransport,
    LeaderElection, ResilientTransport, SessionStore, Subscription, Tagged, TransportConfig,
    protocol::{AuthStateKind, ConnectionStateKind},
};
use kiip_proto::KiipCodec;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};

use crate::{
    command::{Command, HELP},
    error::ClientError,
    file_store::{DEFAULT_POLL_INTERVAL, FileStore},
    system_env::SystemEnv,
    ws::WsSocketFactory,
};

/// Default server endpoint.
pub const DEFAULT_URL: &str = "ws://localhost:3020";

/// Default store directory.
pub const DEFAULT_STORE_DIR: &str = ".kiip";

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server WebSocket URL
    pub url: String,
    /// Directory shared with the other instances
    pub store_dir: PathBuf,
    /// Reconnect behavior; `auto_connect` is ignored, leadership decides
    pub transport: TransportConfig,
    /// Election timing
    pub election: ElectionConfig,
    /// Store scan interval
    pub poll_interval: Duration,
    /// Activity rank at startup
    pub rank: ActivityRank,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_owned(),
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            transport: TransportConfig::default(),
            election: ElectionConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            rank: ActivityRank::Focused,
        }
    }
}

/// Leader election type used by the client.
pub type ClientElection = LeaderElection<SystemEnv, FileStore>;

/// A running client instance.
///
/// Must be created and used inside a `LocalSet`.
pub struct Client {
    store: FileStore,
    election: ClientElection,
    transport: KiipTransport<SystemEnv>,
    protocol: ConnectionProtocol<SystemEnv>,
    listeners: RefCell<Vec<Subscription>>,
    poller: JoinHandle<()>,
}

impl Client {
    /// Open the store, join the election, and connect once elected.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Store`] if the store directory is unusable.
    pub fn start(config: ClientConfig) -> Result<Self, ClientError> {
        let env = SystemEnv::new();
        let store = FileStore::open(&config.store_dir)?;
        let poller = store.spawn_poller(config.poll_interval);

        let transport_config = TransportConfig { auto_connect: false, ..config.transport };
        let transport =
            ResilientTransport::new(config.url, KiipCodec::new(), WsSocketFactory, env.clone(), transport_config);

        let session: SessionStore = Rc::new(store.clone());
        let protocol = ConnectionProtocol::new(transport.clone(), session, env.clone());
        let connection = protocol.subscribe(|state| tracing::info!(state = ?state.tag(), "Connection state"));
        let auth = protocol.subscribe_auth(log_auth_state);

        let election = LeaderElection::new(env, store.clone(), config.election, config.rank);
        let follow = transport.clone();
        let leadership = election.subscribe(move |leader| {
            if *leader {
                tracing::info!(url = %follow.url(), "Elected; connecting");
                follow.connect();
            } else {
                tracing::info!("Lost leadership; disconnecting");
                follow.close();
            }
        });

        let listeners = RefCell::new(vec![connection, auth, leadership]);
        Ok(Self { store, election, transport, protocol, listeners, poller })
    }

    /// Whether this instance currently leads.
    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    /// Connectivity of the server transport.
    pub fn connectivity(&self) -> ConnectivityState {
        self.transport.state()
    }

    /// Authentication state, when connected.
    pub fn auth_state(&self) -> Option<AuthState> {
        self.protocol.auth_state()
    }

    /// Election participant of this instance.
    pub fn election(&self) -> &ClientElection {
        &self.election
    }

    /// Shared store of this instance.
    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Apply a console command and describe the outcome.
    pub fn handle(&self, command: &Command) -> String {
        match command {
            Command::Login(email) => {
                if self.protocol.state().tag() != ConnectionStateKind::Connected {
                    return self.not_connected();
                }
                self.protocol.login(email.as_str());
                format!("requesting a login code for {email}")
            },
            Command::Code(code) => match self.auth_state().as_ref().map(Tagged::tag) {
                Some(AuthStateKind::WaitingForLoginCode) => {
                    self.protocol.send_login_code(code.as_str());
                    "checking code".to_owned()
                },
                Some(_) => "no login code expected; use `login <email>` first".to_owned(),
                None => self.not_connected(),
            },
            Command::Activity(rank) => {
                self.election.set_activity(*rank);
                format!("activity {rank}, bid {}", self.election.bid())
            },
            Command::State => self.status(),
            Command::Help => HELP.to_owned(),
            Command::Quit => "bye".to_owned(),
        }
    }

    /// One-line summary of connectivity, authentication and leadership.
    pub fn status(&self) -> String {
        let auth = match self.auth_state() {
            Some(AuthState::LoggedIn { documents, .. }) => format!("logged in, {} document(s)", documents.len()),
            Some(AuthState::WaitingForLoginCode { email, error: Some(error), .. }) => {
                format!("waiting for the code sent to {email} ({error})")
            },
            Some(AuthState::WaitingForLoginCode { email, .. }) => format!("waiting for the code sent to {email}"),
            Some(AuthState::Error { error }) => format!("login failed: {error}"),
            Some(state) => format!("{:?}", state.tag()),
            None => "-".to_owned(),
        };
        format!(
            "connection: {:?} | auth: {auth} | leader: {} | bid: {}",
            self.connectivity(),
            if self.is_leader() { "yes" } else { "no" },
            self.election.bid(),
        )
    }

    fn not_connected(&self) -> String {
        if self.is_leader() {
            format!("not connected yet ({:?})", self.connectivity())
        } else {
            "not connected; another instance holds the connection".to_owned()
        }
    }

    /// Leave the election, detach the protocol and close the socket.
    pub fn shutdown(&self) {
        let listeners: Vec<_> = self.listeners.borrow_mut().drain(..).collect();
        for listener in listeners {
            listener.unsubscribe();
        }
        self.election.destroy();
        self.protocol.destroy();
        self.transport.close();
        self.poller.abort();
        tracing::info!("Client stopped");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

fn log_auth_state(state: &AuthState) {
    match state {
        AuthState::WaitingForLoginCode { email, error: Some(error), .. } => {
            tracing::warn!(%email, %error, "Login code rejected");
        },
        AuthState::LoggedIn { documents, .. } => {
            tracing::info!(documents = documents.len(), "Logged in");
        },
        AuthState::Error { error } => tracing::warn!(%error, "Login failed"),
        other => tracing::info!(state = ?other.tag(), "Auth state"),
    }
}

/// Read commands from `input` until `quit` or end of input, writing one
/// reply per command to `output`.
///
/// # Errors
///
/// Returns [`ClientError::Console`] if reading or writing fails.
pub async fn run_console<R, W>(client: &Client, input: R, mut output: W) -> Result<(), ClientError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match line.parse::<Command>() {
            Ok(command) => {
                let reply = client.handle(&command);
                if command == Command::Quit {
                    write_line(&mut output, &reply).await?;
                    break;
                }
                reply
            },
            Err(e) => e.to_string(),
        };
        write_line(&mut output, &reply).await?;
    }
    Ok(())
}

/// Resolves on Ctrl+C, SIGTERM or SIGHUP.
///
/// # Errors
///
/// Returns [`ClientError::Console`] if a signal handler cannot be installed.
pub async fn shutdown_signal() -> Result<(), ClientError> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
            _ = hangup.recv() => tracing::info!("Received SIGHUP"),
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> Result<(), ClientError> {
    output.write_all(text.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
