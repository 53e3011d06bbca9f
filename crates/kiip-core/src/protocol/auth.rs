//! Authentication handshake.
//!
//! Runs once per established connection. Resumes a stored session token when
//! there is one, otherwise walks the mail-code login:
//!
//! ```text
//! ┌──────┐ token ┌─────────────────┐  LoggedIn   ┌──────────┐
//! │ Void │──────>│ ValidatingToken │────────────>│ LoggedIn │
//! └──────┘       └─────────────────┘             └──────────┘
//!    │ RequestLoginMail                                ^
//!    v                                                 │ LoggedIn
//! ┌──────────────────┐ LoginEmailSend ┌─────────────────────┐ SendLoginCode ┌─────────────────────┐
//! │ SendingLoginMail │───────────────>│ WaitingForLoginCode │──────────────>│ ValidatingLoginCode │
//! └──────────────────┘                └─────────────────────┘<──────────────└─────────────────────┘
//!                                                            InvalidLoginCode
//! ```
//!
//! Every request carries a fresh correlation id; answers whose id does not
//! match the state's outstanding request are ignored.

use kiip_proto::{DocumentSummary, DownKind, DownMessage, RequestId, UpMessage};

use crate::{
    env::Environment,
    machine::{MachineConfig, MachineHandle, StateConfig, StateMachine, Tagged},
    store::SessionStore,
    subscription::Cleanup,
    transport::{KiipTransport, MessageHandlers},
};

/// Store key of the persisted session token.
pub const TOKEN_STORAGE_KEY: &str = "KIIP_TOKEN_V1";

/// Error shown after the server rejects a login code.
pub const INVALID_CODE_ERROR: &str = "Invalid code";

/// Error recorded after too many login attempts.
pub const TOO_MANY_ATTEMPTS_ERROR: &str = "TooManyLoginAttempts";

/// Error recorded when the address may not log in.
pub const UNAUTHORIZED_EMAIL_ERROR: &str = "UnauthorizedEmail";

/// Hex digits in a request correlation id.
pub const REQUEST_ID_LEN: usize = 16;

/// Authentication state of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Not logged in, nothing pending.
    Void,
    /// Resuming a stored session.
    ValidatingToken {
        /// Stored session token.
        token: String,
        /// Outstanding `ValidateToken` request.
        request_id: RequestId,
    },
    /// Asking the server to mail a login code.
    SendingLoginMail {
        /// Address the code goes to.
        email: String,
        /// Outstanding `RequestLoginMail` request.
        request_id: RequestId,
    },
    /// Mail sent; waiting for the user to type the code.
    WaitingForLoginCode {
        /// Address the code went to.
        email: String,
        /// Login attempt id from the server.
        login_id: String,
        /// Why the previous code was rejected.
        error: Option<String>,
    },
    /// Checking a code with the server.
    ValidatingLoginCode {
        /// Address the code went to.
        email: String,
        /// Login attempt id from the server.
        login_id: String,
        /// Code typed by the user.
        code: String,
        /// Outstanding `LoginCode` request.
        request_id: RequestId,
    },
    /// Authenticated.
    LoggedIn {
        /// Session token, persisted on entry.
        token: String,
        /// Documents visible to the session.
        documents: Vec<DocumentSummary>,
    },
    /// Login failed; a new mail can be requested.
    Error {
        /// Failure description.
        error: String,
    },
}

/// Fieldless discriminator of [`AuthState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthStateKind {
    /// [`AuthState::Void`]
    Void,
    /// [`AuthState::ValidatingToken`]
    ValidatingToken,
    /// [`AuthState::SendingLoginMail`]
    SendingLoginMail,
    /// [`AuthState::WaitingForLoginCode`]
    WaitingForLoginCode,
    /// [`AuthState::ValidatingLoginCode`]
    ValidatingLoginCode,
    /// [`AuthState::LoggedIn`]
    LoggedIn,
    /// [`AuthState::Error`]
    Error,
}

impl Tagged for AuthState {
    type Tag = AuthStateKind;

    fn tag(&self) -> AuthStateKind {
        match self {
            Self::Void => AuthStateKind::Void,
            Self::ValidatingToken { .. } => AuthStateKind::ValidatingToken,
            Self::SendingLoginMail { .. } => AuthStateKind::SendingLoginMail,
            Self::WaitingForLoginCode { .. } => AuthStateKind::WaitingForLoginCode,
            Self::ValidatingLoginCode { .. } => AuthStateKind::ValidatingLoginCode,
            Self::LoggedIn { .. } => AuthStateKind::LoggedIn,
            Self::Error { .. } => AuthStateKind::Error,
        }
    }
}

/// User intent fed into the authentication machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Ask for a login code mailed to `email`.
    RequestLoginMail {
        /// Address to log in with.
        email: String,
    },
    /// Submit the mailed code.
    SendLoginCode {
        /// Code typed by the user.
        code: String,
    },
}

/// Fieldless discriminator of [`AuthEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthEventKind {
    /// [`AuthEvent::RequestLoginMail`]
    RequestLoginMail,
    /// [`AuthEvent::SendLoginCode`]
    SendLoginCode,
}

impl Tagged for AuthEvent {
    type Tag = AuthEventKind;

    fn tag(&self) -> AuthEventKind {
        match self {
            Self::RequestLoginMail { .. } => AuthEventKind::RequestLoginMail,
            Self::SendLoginCode { .. } => AuthEventKind::SendLoginCode,
        }
    }
}

/// Authentication machine of one connection.
pub type AuthMachine = StateMachine<AuthState, AuthEvent>;

type AuthHandle = MachineHandle<AuthState, AuthEvent>;
type AuthStateConfig = StateConfig<AuthState, AuthEvent>;

/// Answers to one outstanding request, routed to the next state.
struct Awaiting {
    request_id: RequestId,
    handle: AuthHandle,
    handlers: MessageHandlers<DownMessage>,
}

impl Awaiting {
    fn new(request_id: &RequestId, handle: &AuthHandle) -> Self {
        Self { request_id: request_id.clone(), handle: handle.clone(), handlers: MessageHandlers::new() }
    }

    /// Move to the state `route` picks when a matching `kind` answer arrives.
    fn on(mut self, kind: DownKind, route: impl Fn(&DownMessage) -> Option<AuthState> + 'static) -> Self {
        let request_id = self.request_id.clone();
        let handle = self.handle.clone();
        self.handlers = self.handlers.on(kind, move |message| {
            if !message.answers(&request_id) {
                tracing::debug!(
                    %request_id,
                    answer = ?message.request_id(),
                    ?kind,
                    "Ignoring answer to another request"
                );
                return;
            }
            let Some(next) = route(message) else { return };
            if let Err(e) = handle.shortcut(next) {
                if e.is_late() {
                    tracing::debug!(%request_id, error = %e, "Late answer ignored");
                } else {
                    tracing::warn!(%request_id, error = %e, "Answer could not be applied");
                }
            }
        });
        self
    }

    /// Any `Error` answer ends the handshake.
    fn or_error(self) -> Self {
        self.on(DownKind::Error, |message| match message {
            DownMessage::Error { message, .. } => Some(AuthState::Error { error: message.clone() }),
            _ => None,
        })
    }

    fn listen<E: Environment>(self, transport: &KiipTransport<E>) -> Cleanup {
        transport.on_message(self.handlers).into()
    }
}

fn logged_in(message: &DownMessage) -> Option<AuthState> {
    match message {
        DownMessage::LoggedIn { token, documents, .. } => {
            Some(AuthState::LoggedIn { token: token.clone(), documents: documents.clone() })
        },
        _ => None,
    }
}

/// Build the authentication machine for a fresh connection.
///
/// The machine starts in [`AuthState::Void`] and immediately moves to
/// [`AuthState::ValidatingToken`] when `session` holds a token.
pub fn create_auth_machine<E: Environment>(
    transport: KiipTransport<E>,
    session: SessionStore,
    env: E,
) -> AuthMachine {
    let new_request_id = move || RequestId::new(env.random_hex(REQUEST_ID_LEN));

    // Every state except LoggedIn restarts the login with a new address.
    let request_mail = {
        let new_request_id = new_request_id.clone();
        move |event: AuthEvent, state: &AuthState| {
            let AuthEvent::RequestLoginMail { email } = event else { return None };
            let pending = match state {
                AuthState::SendingLoginMail { email, .. } | AuthState::WaitingForLoginCode { email, .. } => {
                    Some(email.as_str())
                },
                _ => None,
            };
            if pending == Some(email.as_str()) {
                return None;
            }
            Some(AuthState::SendingLoginMail { email, request_id: new_request_id() })
        }
    };

    let send_code = {
        let new_request_id = new_request_id.clone();
        move |event: AuthEvent, state: &AuthState| {
            let AuthEvent::SendLoginCode { code } = event else { return None };
            let (AuthState::WaitingForLoginCode { email, login_id, .. }
            | AuthState::ValidatingLoginCode { email, login_id, .. }) = state
            else {
                return None;
            };
            Some(AuthState::ValidatingLoginCode {
                email: email.clone(),
                login_id: login_id.clone(),
                code,
                request_id: new_request_id(),
            })
        }
    };

    let void = {
        let session = session.clone();
        AuthStateConfig::new()
            .on(AuthEventKind::RequestLoginMail, request_mail.clone())
            .shortcuts([AuthStateKind::ValidatingToken])
            .effect(move |_, handle| {
                let token = session.get(TOKEN_STORAGE_KEY)?;
                tracing::debug!("Resuming stored session");
                if let Err(e) = handle.shortcut(AuthState::ValidatingToken { token, request_id: new_request_id() }) {
                    tracing::warn!(error = %e, "Stored session not resumed");
                }
                None
            })
    };

    let validating_token = {
        let transport = transport.clone();
        let session = session.clone();
        AuthStateConfig::new()
            .on(AuthEventKind::RequestLoginMail, request_mail.clone())
            .shortcuts([AuthStateKind::LoggedIn, AuthStateKind::Void, AuthStateKind::Error])
            .effect(move |state, handle| {
                let AuthState::ValidatingToken { token, request_id } = state else { return None };
                let session = session.clone();
                let cleanup = Awaiting::new(request_id, handle)
                    .on(DownKind::LoggedIn, logged_in)
                    .on(DownKind::InvalidToken, move |_| {
                        tracing::info!("Stored session rejected");
                        session.remove(TOKEN_STORAGE_KEY);
                        Some(AuthState::Void)
                    })
                    .or_error()
                    .listen(&transport);
                transport.send(&UpMessage::ValidateToken { token: token.clone(), request_id: request_id.clone() });
                Some(cleanup)
            })
    };

    let sending_login_mail = {
        let transport = transport.clone();
        AuthStateConfig::new()
            .on(AuthEventKind::RequestLoginMail, request_mail.clone())
            .shortcuts([AuthStateKind::WaitingForLoginCode, AuthStateKind::Error])
            .effect(move |state, handle| {
                let AuthState::SendingLoginMail { email, request_id } = state else { return None };
                let address = email.clone();
                let cleanup = Awaiting::new(request_id, handle)
                    .on(DownKind::LoginEmailSend, move |message| match message {
                        DownMessage::LoginEmailSend { login_id, .. } => Some(AuthState::WaitingForLoginCode {
                            email: address.clone(),
                            login_id: login_id.clone(),
                            error: None,
                        }),
                        _ => None,
                    })
                    .on(DownKind::TooManyLoginAttempts, |_| {
                        Some(AuthState::Error { error: TOO_MANY_ATTEMPTS_ERROR.to_string() })
                    })
                    .on(DownKind::UnauthorizedEmail, |_| {
                        Some(AuthState::Error { error: UNAUTHORIZED_EMAIL_ERROR.to_string() })
                    })
                    .or_error()
                    .listen(&transport);
                transport.send(&UpMessage::RequestLoginMail { email: email.clone(), request_id: request_id.clone() });
                Some(cleanup)
            })
    };

    let waiting_for_login_code = AuthStateConfig::new()
        .on(AuthEventKind::RequestLoginMail, request_mail.clone())
        .on(AuthEventKind::SendLoginCode, send_code.clone());

    let validating_login_code = {
        let transport = transport.clone();
        AuthStateConfig::new()
            .on(AuthEventKind::RequestLoginMail, request_mail.clone())
            .on(AuthEventKind::SendLoginCode, send_code)
            .shortcuts([AuthStateKind::LoggedIn, AuthStateKind::WaitingForLoginCode, AuthStateKind::Error])
            .effect(move |state, handle| {
                let AuthState::ValidatingLoginCode { email, login_id, code, request_id } = state else {
                    return None;
                };
                let (retry_email, retry_login_id) = (email.clone(), login_id.clone());
                let cleanup = Awaiting::new(request_id, handle)
                    .on(DownKind::LoggedIn, logged_in)
                    .on(DownKind::InvalidLoginCode, move |_| {
                        Some(AuthState::WaitingForLoginCode {
                            email: retry_email.clone(),
                            login_id: retry_login_id.clone(),
                            error: Some(INVALID_CODE_ERROR.to_string()),
                        })
                    })
                    .on(DownKind::TooManyLoginAttempts, |_| {
                        Some(AuthState::Error { error: TOO_MANY_ATTEMPTS_ERROR.to_string() })
                    })
                    .or_error()
                    .listen(&transport);
                transport.send(&UpMessage::LoginCode {
                    login_id: login_id.clone(),
                    code: code.clone(),
                    request_id: request_id.clone(),
                });
                Some(cleanup)
            })
    };

    let logged_in_state = AuthStateConfig::new().effect(move |state, _| {
        if let AuthState::LoggedIn { token, .. } = state {
            tracing::info!("Logged in");
            session.set(TOKEN_STORAGE_KEY, token);
        }
        None
    });

    let error = AuthStateConfig::new().on(AuthEventKind::RequestLoginMail, request_mail);

    let config = MachineConfig::new("auth")
        .state(AuthStateKind::Void, void)
        .state(AuthStateKind::ValidatingToken, validating_token)
        .state(AuthStateKind::SendingLoginMail, sending_login_mail)
        .state(AuthStateKind::WaitingForLoginCode, waiting_for_login_code)
        .state(AuthStateKind::ValidatingLoginCode, validating_login_code)
        .state(AuthStateKind::LoggedIn, logged_in_state)
        .state(AuthStateKind::Error, error);

    StateMachine::new(AuthState::Void, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_mirror_variants() {
        let state = AuthState::WaitingForLoginCode { email: "a@b.com".into(), login_id: "L1".into(), error: None };
        assert_eq!(state.tag(), AuthStateKind::WaitingForLoginCode);
        assert_eq!(AuthEvent::SendLoginCode { code: "1".into() }.tag(), AuthEventKind::SendLoginCode);
    }

    #[test]
    fn logged_in_keeps_documents() {
        let message = DownMessage::LoggedIn {
            token: "T1".into(),
            request_id: RequestId::new("r1"),
            documents: vec![DocumentSummary { id: "d1".into() }],
        };
        assert_eq!(
            logged_in(&message),
            Some(AuthState::LoggedIn { token: "T1".into(), documents: vec![DocumentSummary { id: "d1".into() }] })
        );
        assert_eq!(logged_in(&DownMessage::InvalidToken { request_id: RequestId::new("r1") }), None);
    }
}
