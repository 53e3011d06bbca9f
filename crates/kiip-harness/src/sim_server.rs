//! Scripted Kiip server.
//!
//! Answers the login handshake the way the real server does, with a fixed set
//! of accounts. Plug it into a [`crate::SimSocketFactory`] with
//! [`SimServer::responder`].

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
};

use kiip_proto::{DocumentSummary, DownMessage, UpMessage};

#[derive(Default)]
struct Accounts {
    /// email -> expected code
    codes: HashMap<String, String>,
    /// login id -> email
    logins: HashMap<String, String>,
    /// token -> email
    tokens: HashMap<String, String>,
    blocked: HashSet<String>,
    documents: Vec<DocumentSummary>,
    next_login: u32,
    next_token: u32,
    received: Vec<UpMessage>,
}

/// In-memory login server.
#[derive(Clone, Default)]
pub struct SimServer {
    accounts: Rc<RefCell<Accounts>>,
}

impl SimServer {
    /// Server without accounts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `email` to log in with `code`.
    pub fn with_account(self, email: &str, code: &str) -> Self {
        self.accounts.borrow_mut().codes.insert(email.to_string(), code.to_string());
        self
    }

    /// Accept `token` as an existing session of `email`.
    pub fn with_token(self, token: &str, email: &str) -> Self {
        self.accounts.borrow_mut().tokens.insert(token.to_string(), email.to_string());
        self
    }

    /// Answer login mail requests for `email` with `TooManyLoginAttempts`.
    pub fn block(self, email: &str) -> Self {
        self.accounts.borrow_mut().blocked.insert(email.to_string());
        self
    }

    /// Documents listed in every `LoggedIn` answer.
    pub fn with_documents(self, ids: &[&str]) -> Self {
        self.accounts.borrow_mut().documents =
            ids.iter().map(|id| DocumentSummary { id: (*id).to_string() }).collect();
        self
    }

    /// Every request received, in order.
    pub fn received(&self) -> Vec<UpMessage> {
        self.accounts.borrow().received.clone()
    }

    /// Responder for [`crate::SimSocketFactory::set_responder`].
    pub fn responder(&self) -> impl Fn(&str) -> Vec<String> + 'static {
        let server = self.clone();
        move |frame| server.answer(frame).into_iter().filter_map(|m| serde_json::to_string(&m).ok()).collect()
    }

    /// Answers to one client frame. Undecodable frames get no answer.
    pub fn answer(&self, frame: &str) -> Vec<DownMessage> {
        let Ok(request) = serde_json::from_str::<UpMessage>(frame) else {
            tracing::debug!(frame, "Sim server ignoring frame");
            return Vec::new();
        };

        let mut accounts = self.accounts.borrow_mut();
        accounts.received.push(request.clone());

        let reply = match request {
            UpMessage::RequestLoginMail { email, request_id } => {
                if accounts.blocked.contains(&email) {
                    DownMessage::TooManyLoginAttempts { request_id }
                } else if !accounts.codes.contains_key(&email) {
                    DownMessage::UnauthorizedEmail { request_id }
                } else {
                    accounts.next_login += 1;
                    let login_id = format!("L{}", accounts.next_login);
                    accounts.logins.insert(login_id.clone(), email);
                    DownMessage::LoginEmailSend { login_id, request_id }
                }
            },
            UpMessage::LoginCode { login_id, code, request_id } => {
                let email = accounts.logins.get(&login_id).cloned();
                let valid = email.as_ref().and_then(|e| accounts.codes.get(e)).is_some_and(|expected| *expected == code);
                match email {
                    Some(email) if valid => {
                        accounts.next_token += 1;
                        let token = format!("T{}", accounts.next_token);
                        accounts.tokens.insert(token.clone(), email);
                        DownMessage::LoggedIn { token, request_id, documents: accounts.documents.clone() }
                    },
                    _ => DownMessage::InvalidLoginCode { request_id },
                }
            },
            UpMessage::ValidateToken { token, request_id } => {
                if accounts.tokens.contains_key(&token) {
                    DownMessage::LoggedIn { token, request_id, documents: accounts.documents.clone() }
                } else {
                    DownMessage::InvalidToken { request_id }
                }
            },
        };
        vec![reply]
    }
}

#[cfg(test)]
mod tests {
    use kiip_proto::RequestId;

    use super::*;

    fn frame(message: &UpMessage) -> String {
        serde_json::to_string(message).unwrap()
    }

    #[test]
    fn full_login() {
        let server = SimServer::new().with_account("a@b.com", "123456");

        let mail = server.answer(&frame(&UpMessage::RequestLoginMail {
            email: "a@b.com".into(),
            request_id: RequestId::new("r1"),
        }));
        assert_eq!(mail, vec![DownMessage::LoginEmailSend { login_id: "L1".into(), request_id: RequestId::new("r1") }]);

        let wrong = server.answer(&frame(&UpMessage::LoginCode {
            login_id: "L1".into(),
            code: "000000".into(),
            request_id: RequestId::new("r2"),
        }));
        assert_eq!(wrong, vec![DownMessage::InvalidLoginCode { request_id: RequestId::new("r2") }]);

        let right = server.answer(&frame(&UpMessage::LoginCode {
            login_id: "L1".into(),
            code: "123456".into(),
            request_id: RequestId::new("r3"),
        }));
        assert_eq!(right, vec![DownMessage::LoggedIn {
            token: "T1".into(),
            request_id: RequestId::new("r3"),
            documents: vec![],
        }]);

        let resumed =
            server.answer(&frame(&UpMessage::ValidateToken { token: "T1".into(), request_id: RequestId::new("r4") }));
        assert!(matches!(resumed.as_slice(), [DownMessage::LoggedIn { .. }]));
        assert_eq!(server.received().len(), 4);
    }

    #[test]
    fn unknown_and_blocked_addresses() {
        let server = SimServer::new().with_account("a@b.com", "1").block("a@b.com");

        let blocked = server.answer(&frame(&UpMessage::RequestLoginMail {
            email: "a@b.com".into(),
            request_id: RequestId::new("r1"),
        }));
        assert_eq!(blocked, vec![DownMessage::TooManyLoginAttempts { request_id: RequestId::new("r1") }]);

        let unknown = server.answer(&frame(&UpMessage::RequestLoginMail {
            email: "x@y.com".into(),
            request_id: RequestId::new("r2"),
        }));
        assert_eq!(unknown, vec![DownMessage::UnauthorizedEmail { request_id: RequestId::new("r2") }]);
    }

    #[test]
    fn garbage_gets_no_answer() {
        assert!(SimServer::new().answer("{not json").is_empty());
    }
}
