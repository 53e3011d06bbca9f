//! Connection and login handshake against the scripted server.

use std::{cell::RefCell, rc::Rc, time::Duration};

use kiip_core::{
    AuthState, ConnectionProtocol, KiipTransport, ResilientTransport, SessionStore, Tagged, TransportConfig,
    protocol::{
        AuthStateKind, ConnectionStateKind, INVALID_CODE_ERROR, TOKEN_STORAGE_KEY,
        auth::{TOO_MANY_ATTEMPTS_ERROR, UNAUTHORIZED_EMAIL_ERROR},
    },
};
use kiip_harness::{SimEnv, SimServer, SimSocketFactory, SimStore};
use kiip_proto::{DocumentSummary, DownMessage, KiipCodec, RequestId, UpMessage};

const EMAIL: &str = "ada@example.com";
const CODE: &str = "123456";
const LATENCY: Duration = Duration::from_millis(10);

struct World {
    env: SimEnv,
    factory: SimSocketFactory,
    store: SimStore,
    transport: KiipTransport<SimEnv>,
    protocol: ConnectionProtocol<SimEnv>,
    auth_log: Rc<RefCell<Vec<AuthState>>>,
}

impl World {
    /// Client wired to `server`, or to a silent server when `None`.
    fn new(seed: u64, server: Option<&SimServer>, token: Option<&str>) -> Self {
        let env = SimEnv::with_seed(seed);
        let factory = SimSocketFactory::new(&env);
        if let Some(server) = server {
            factory.set_responder(server.responder());
        }

        let store = SimStore::new(&env);
        store.inject(TOKEN_STORAGE_KEY, token);
        let session: SessionStore = Rc::new(store.handle());

        let transport = ResilientTransport::new(
            "ws://kiip.test",
            KiipCodec::new(),
            factory.clone(),
            env.clone(),
            TransportConfig::default(),
        );
        let protocol = ConnectionProtocol::new(transport.clone(), session, env.clone());

        let auth_log = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&auth_log);
        let _ = protocol.subscribe_auth(move |state| log.borrow_mut().push(state.clone()));

        Self { env, factory, store, transport, protocol, auth_log }
    }

    fn connection(&self) -> ConnectionStateKind {
        self.protocol.state().tag()
    }

    fn auth(&self) -> Option<AuthStateKind> {
        self.protocol.auth_state().map(|s| s.tag())
    }

    fn auth_tags(&self) -> Vec<AuthStateKind> {
        self.auth_log.borrow().iter().map(Tagged::tag).collect()
    }

    fn push(&self, message: &DownMessage) {
        let frame = serde_json::to_string(message).unwrap();
        assert!(self.factory.push(&frame), "no live socket");
    }

    fn last_request_id(&self) -> RequestId {
        RequestId::new(self.factory.last_request_id().unwrap())
    }
}

fn server() -> SimServer {
    SimServer::new().with_account(EMAIL, CODE).with_documents(&["doc-1"])
}

#[test]
fn login_end_to_end() {
    let server = server();
    let world = World::new(1, Some(&server), None);
    assert_eq!(world.connection(), ConnectionStateKind::Connecting);
    assert_eq!(world.auth(), None);

    world.env.advance(LATENCY);
    assert_eq!(world.connection(), ConnectionStateKind::Connected);
    assert_eq!(world.protocol.auth_state(), Some(AuthState::Void));

    world.protocol.login(EMAIL);
    assert_eq!(world.auth(), Some(AuthStateKind::SendingLoginMail));

    world.env.advance(LATENCY);
    assert_eq!(
        world.protocol.auth_state(),
        Some(AuthState::WaitingForLoginCode { email: EMAIL.into(), login_id: "L1".into(), error: None })
    );

    world.protocol.send_login_code(CODE);
    assert_eq!(world.auth(), Some(AuthStateKind::ValidatingLoginCode));

    world.env.advance(LATENCY);
    assert_eq!(
        world.protocol.auth_state(),
        Some(AuthState::LoggedIn { token: "T1".into(), documents: vec![DocumentSummary { id: "doc-1".into() }] })
    );
    assert_eq!(world.store.peek(TOKEN_STORAGE_KEY).as_deref(), Some("T1"));

    assert_eq!(world.auth_tags(), vec![
        AuthStateKind::Void,
        AuthStateKind::SendingLoginMail,
        AuthStateKind::WaitingForLoginCode,
        AuthStateKind::ValidatingLoginCode,
        AuthStateKind::LoggedIn,
    ]);

    let requests = server.received();
    assert!(matches!(requests[0], UpMessage::RequestLoginMail { ref email, .. } if email == EMAIL));
    assert!(matches!(
        requests[1],
        UpMessage::LoginCode { ref login_id, ref code, .. } if login_id == "L1" && code == CODE
    ));
    assert_eq!(requests.len(), 2);
}

#[test]
fn stored_token_resumes_the_session() {
    let server = server().with_token("T0", EMAIL);
    let world = World::new(2, Some(&server), Some("T0"));
    world.env.advance(LATENCY);
    assert_eq!(world.auth(), Some(AuthStateKind::ValidatingToken));

    world.env.advance(LATENCY);
    assert!(matches!(world.protocol.auth_state(), Some(AuthState::LoggedIn { ref token, .. }) if token == "T0"));
    assert_eq!(world.auth_tags(), vec![AuthStateKind::ValidatingToken, AuthStateKind::LoggedIn]);
    assert!(matches!(server.received()[0], UpMessage::ValidateToken { ref token, .. } if token == "T0"));
}

#[test]
fn rejected_token_is_forgotten() {
    let server = server();
    let world = World::new(3, Some(&server), Some("expired"));
    world.env.advance(LATENCY * 2);

    assert_eq!(world.protocol.auth_state(), Some(AuthState::Void));
    assert_eq!(world.store.peek(TOKEN_STORAGE_KEY), None);

    world.protocol.login(EMAIL);
    world.env.advance(LATENCY);
    assert_eq!(world.auth(), Some(AuthStateKind::WaitingForLoginCode));
}

#[test]
fn wrong_code_can_be_retried() {
    let server = server();
    let world = World::new(4, Some(&server), None);
    world.env.advance(LATENCY);
    world.protocol.login(EMAIL);
    world.env.advance(LATENCY);

    world.protocol.send_login_code("000000");
    world.env.advance(LATENCY);
    assert_eq!(
        world.protocol.auth_state(),
        Some(AuthState::WaitingForLoginCode {
            email: EMAIL.into(),
            login_id: "L1".into(),
            error: Some(INVALID_CODE_ERROR.into()),
        })
    );
    assert_eq!(world.store.peek(TOKEN_STORAGE_KEY), None);

    world.protocol.send_login_code(CODE);
    world.env.advance(LATENCY);
    assert_eq!(world.auth(), Some(AuthStateKind::LoggedIn));

    let trace: Vec<String> = world
        .auth_log
        .borrow()
        .iter()
        .map(|state| match state {
            AuthState::WaitingForLoginCode { error, .. } => format!("WaitingForLoginCode error={error:?}"),
            other => format!("{:?}", other.tag()),
        })
        .collect();
    insta::assert_snapshot!(trace.join("\n"), @r#"
    Void
    SendingLoginMail
    WaitingForLoginCode error=None
    ValidatingLoginCode
    WaitingForLoginCode error=Some("Invalid code")
    ValidatingLoginCode
    LoggedIn
    "#);
}

#[test]
fn unknown_address_ends_in_error_and_can_restart() {
    let server = server();
    let world = World::new(5, Some(&server), None);
    world.env.advance(LATENCY);

    world.protocol.login("mallory@example.com");
    world.env.advance(LATENCY);
    assert_eq!(world.protocol.auth_state(), Some(AuthState::Error { error: UNAUTHORIZED_EMAIL_ERROR.into() }));

    world.protocol.send_login_code(CODE);
    assert_eq!(world.auth(), Some(AuthStateKind::Error));

    world.protocol.login(EMAIL);
    world.env.advance(LATENCY);
    assert_eq!(world.auth(), Some(AuthStateKind::WaitingForLoginCode));
}

#[test]
fn too_many_attempts_ends_in_error() {
    let server = server().block(EMAIL);
    let world = World::new(6, Some(&server), None);
    world.env.advance(LATENCY);

    world.protocol.login(EMAIL);
    world.env.advance(LATENCY);
    assert_eq!(world.protocol.auth_state(), Some(AuthState::Error { error: TOO_MANY_ATTEMPTS_ERROR.into() }));
}

#[test]
fn answers_to_superseded_requests_are_ignored() {
    let world = World::new(7, None, None);
    world.env.advance(LATENCY);

    world.protocol.login(EMAIL);
    let first = world.last_request_id();
    world.protocol.login("grace@example.com");
    let second = world.last_request_id();
    assert_ne!(first, second);

    world.push(&DownMessage::LoginEmailSend { login_id: "L-old".into(), request_id: first });
    assert!(matches!(
        world.protocol.auth_state(),
        Some(AuthState::SendingLoginMail { ref email, .. }) if email == "grace@example.com"
    ));

    world.push(&DownMessage::LoginEmailSend { login_id: "L-new".into(), request_id: second });
    assert_eq!(
        world.protocol.auth_state(),
        Some(AuthState::WaitingForLoginCode {
            email: "grace@example.com".into(),
            login_id: "L-new".into(),
            error: None,
        })
    );
}

#[test]
fn resubmitted_code_ignores_the_earlier_answer() {
    let world = World::new(8, None, None);
    world.env.advance(LATENCY);
    world.protocol.login(EMAIL);
    world.push(&DownMessage::LoginEmailSend { login_id: "L1".into(), request_id: world.last_request_id() });

    world.protocol.send_login_code("111111");
    let first = world.last_request_id();
    world.protocol.send_login_code("222222");
    let second = world.last_request_id();

    world.push(&DownMessage::LoggedIn { token: "T-stale".into(), request_id: first, documents: vec![] });
    assert!(matches!(
        world.protocol.auth_state(),
        Some(AuthState::ValidatingLoginCode { ref code, .. }) if code == "222222"
    ));
    assert_eq!(world.store.peek(TOKEN_STORAGE_KEY), None);

    world.push(&DownMessage::InvalidLoginCode { request_id: second });
    assert_eq!(world.auth(), Some(AuthStateKind::WaitingForLoginCode));
}

#[test]
fn repeated_request_for_the_same_address_is_ignored() {
    let world = World::new(9, None, None);
    world.env.advance(LATENCY);

    world.protocol.login(EMAIL);
    world.protocol.login(EMAIL);
    assert_eq!(world.factory.sent_frames().len(), 1);

    world.push(&DownMessage::LoginEmailSend { login_id: "L1".into(), request_id: world.last_request_id() });
    world.protocol.login(EMAIL);
    assert_eq!(world.factory.sent_frames().len(), 1);
    assert_eq!(world.auth(), Some(AuthStateKind::WaitingForLoginCode));
}

#[test]
fn server_errors() {
    let world = World::new(10, None, None);
    world.env.advance(LATENCY);
    world.protocol.login(EMAIL);

    // Unsolicited errors are only logged.
    world.push(&DownMessage::Error { message: "maintenance soon".into(), request_id: None });
    assert_eq!(world.auth(), Some(AuthStateKind::SendingLoginMail));

    world.push(&DownMessage::Error { message: "mailer down".into(), request_id: Some(world.last_request_id()) });
    assert_eq!(world.protocol.auth_state(), Some(AuthState::Error { error: "mailer down".into() }));
}

#[test]
fn garbage_frames_do_not_disturb_the_handshake() {
    let world = World::new(11, None, None);
    world.env.advance(LATENCY);
    world.protocol.login(EMAIL);

    assert!(world.factory.push("{\"type\":"));
    assert!(world.factory.push(r#"{"type":"LoginEmailSend"}"#));
    assert_eq!(world.auth(), Some(AuthStateKind::SendingLoginMail));
    assert_eq!(world.connection(), ConnectionStateKind::Connected);
}

#[test]
fn reconnect_starts_a_fresh_authentication() {
    let server = server();
    let world = World::new(12, Some(&server), None);
    world.env.advance(LATENCY);
    world.protocol.login(EMAIL);
    world.env.advance(LATENCY);
    world.protocol.send_login_code(CODE);
    world.env.advance(LATENCY);
    assert_eq!(world.auth(), Some(AuthStateKind::LoggedIn));

    let previous = world.protocol.state().auth().cloned();
    assert!(world.factory.disconnect());
    assert_eq!(world.connection(), ConnectionStateKind::Void);
    assert_eq!(world.auth(), None);
    assert!(previous.is_some_and(|auth| auth.is_destroyed()));

    // One interval to reconnect, then the stored token is validated.
    world.env.advance(Duration::from_secs(1) + LATENCY * 2);
    assert_eq!(world.connection(), ConnectionStateKind::Connected);
    assert!(matches!(world.protocol.auth_state(), Some(AuthState::LoggedIn { ref token, .. }) if token == "T1"));
}

#[test]
fn login_before_connecting_is_ignored() {
    let server = server();
    let world = World::new(13, Some(&server), None);

    world.protocol.login(EMAIL);
    world.env.advance(LATENCY * 3);

    assert_eq!(world.protocol.auth_state(), Some(AuthState::Void));
    assert!(server.received().is_empty());
}

#[test]
fn protocol_on_a_connected_transport_starts_at_once() {
    let env = SimEnv::with_seed(14);
    let factory = SimSocketFactory::new(&env);
    let store = SimStore::new(&env);
    let transport: KiipTransport<SimEnv> =
        ResilientTransport::new("ws://kiip.test", KiipCodec::new(), factory, env.clone(), TransportConfig::default());
    env.advance(LATENCY);

    let session: SessionStore = Rc::new(store.handle());
    let protocol = ConnectionProtocol::new(transport, session, env.clone());
    assert_eq!(protocol.state().tag(), ConnectionStateKind::Connected);
    assert_eq!(protocol.auth_state(), Some(AuthState::Void));
}

#[test]
fn destroy_detaches_from_the_transport() {
    let server = server();
    let world = World::new(15, Some(&server), None);
    world.env.advance(LATENCY);
    let auth = world.protocol.state().auth().cloned();

    world.protocol.destroy();
    world.protocol.destroy();
    assert!(auth.is_some_and(|auth| auth.is_destroyed()));

    world.factory.disconnect();
    world.env.advance(Duration::from_secs(2));
    assert_eq!(world.connection(), ConnectionStateKind::Connected);
    assert_eq!(world.transport.state(), kiip_core::ConnectivityState::Connected);
    assert!(server.received().is_empty());
}
