//! Message envelopes exchanged with the server.
//!
//! Both directions are internally tagged unions: the variant name is written
//! to the `type` field and the remaining fields use camelCase names.
//!
//! # Invariants
//!
//! - Every request that expects an answer carries a [`RequestId`], and every
//!   answer to it echoes the same id. Clients match on the id, never on
//!   arrival order.
//! - Envelopes are immutable values; handlers receive them by reference.

use std::{fmt, hash::Hash};

use serde::{Deserialize, Serialize};

/// Opaque correlation token generated by the sender of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an existing token.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Token as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Discriminated envelope: exposes the `type` tag without matching on fields.
pub trait Envelope {
    /// Fieldless mirror of the envelope's variants.
    type Kind: Copy + Eq + Hash + fmt::Debug + 'static;

    /// Discriminator of this envelope.
    fn kind(&self) -> Self::Kind;
}

/// Document entry returned alongside a successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSummary {
    /// Server-assigned document id.
    pub id: String,
}

/// Messages sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum UpMessage {
    /// Ask the server to mail a one-time login code.
    RequestLoginMail {
        /// Address the code is mailed to.
        email: String,
        /// Correlation id echoed by the answer.
        request_id: RequestId,
    },

    /// Submit the code received by mail.
    LoginCode {
        /// Login attempt id from `LoginEmailSend`.
        login_id: String,
        /// Code typed by the user.
        code: String,
        /// Correlation id echoed by the answer.
        request_id: RequestId,
    },

    /// Resume a previous session with a persisted token.
    ValidateToken {
        /// Session token stored after the last login.
        token: String,
        /// Correlation id echoed by the answer.
        request_id: RequestId,
    },
}

/// Fieldless discriminator of [`UpMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpKind {
    /// [`UpMessage::RequestLoginMail`]
    RequestLoginMail,
    /// [`UpMessage::LoginCode`]
    LoginCode,
    /// [`UpMessage::ValidateToken`]
    ValidateToken,
}

impl UpMessage {
    /// Correlation id carried by this request.
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::RequestLoginMail { request_id, .. }
            | Self::LoginCode { request_id, .. }
            | Self::ValidateToken { request_id, .. } => request_id,
        }
    }
}

impl Envelope for UpMessage {
    type Kind = UpKind;

    fn kind(&self) -> UpKind {
        match self {
            Self::RequestLoginMail { .. } => UpKind::RequestLoginMail,
            Self::LoginCode { .. } => UpKind::LoginCode,
            Self::ValidateToken { .. } => UpKind::ValidateToken,
        }
    }
}

/// Messages sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum DownMessage {
    /// Login mail was sent; the code must be submitted with `login_id`.
    LoginEmailSend {
        /// Login attempt id.
        login_id: String,
        /// Echo of the request's correlation id.
        request_id: RequestId,
    },

    /// The address asked for too many codes.
    TooManyLoginAttempts {
        /// Echo of the request's correlation id.
        request_id: RequestId,
    },

    /// The address is not allowed to log in.
    UnauthorizedEmail {
        /// Echo of the request's correlation id.
        request_id: RequestId,
    },

    /// Login code or token accepted.
    LoggedIn {
        /// Session token to persist.
        token: String,
        /// Echo of the request's correlation id.
        request_id: RequestId,
        /// Documents visible to the session.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        documents: Vec<DocumentSummary>,
    },

    /// Login code rejected.
    InvalidLoginCode {
        /// Echo of the request's correlation id.
        request_id: RequestId,
    },

    /// Persisted token rejected.
    InvalidToken {
        /// Echo of the request's correlation id.
        request_id: RequestId,
    },

    /// Generic server-side failure.
    Error {
        /// Human-readable description.
        message: String,
        /// Echo of the request's correlation id, if the error answers one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
}

/// Fieldless discriminator of [`DownMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownKind {
    /// [`DownMessage::LoginEmailSend`]
    LoginEmailSend,
    /// [`DownMessage::TooManyLoginAttempts`]
    TooManyLoginAttempts,
    /// [`DownMessage::UnauthorizedEmail`]
    UnauthorizedEmail,
    /// [`DownMessage::LoggedIn`]
    LoggedIn,
    /// [`DownMessage::InvalidLoginCode`]
    InvalidLoginCode,
    /// [`DownMessage::InvalidToken`]
    InvalidToken,
    /// [`DownMessage::Error`]
    Error,
}

impl DownMessage {
    /// Correlation id echoed by this answer. `None` for unsolicited errors.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::LoginEmailSend { request_id, .. }
            | Self::TooManyLoginAttempts { request_id }
            | Self::UnauthorizedEmail { request_id }
            | Self::LoggedIn { request_id, .. }
            | Self::InvalidLoginCode { request_id }
            | Self::InvalidToken { request_id } => Some(request_id),
            Self::Error { request_id, .. } => request_id.as_ref(),
        }
    }

    /// Whether this message answers the request identified by `id`.
    pub fn answers(&self, id: &RequestId) -> bool {
        self.request_id() == Some(id)
    }
}

impl Envelope for DownMessage {
    type Kind = DownKind;

    fn kind(&self) -> DownKind {
        match self {
            Self::LoginEmailSend { .. } => DownKind::LoginEmailSend,
            Self::TooManyLoginAttempts { .. } => DownKind::TooManyLoginAttempts,
            Self::UnauthorizedEmail { .. } => DownKind::UnauthorizedEmail,
            Self::LoggedIn { .. } => DownKind::LoggedIn,
            Self::InvalidLoginCode { .. } => DownKind::InvalidLoginCode,
            Self::InvalidToken { .. } => DownKind::InvalidToken,
            Self::Error { .. } => DownKind::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_login_mail_wire_shape() {
        let msg = UpMessage::RequestLoginMail {
            email: "a@b.com".to_string(),
            request_id: RequestId::new("r1"),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "RequestLoginMail", "email": "a@b.com", "requestId": "r1" })
        );
    }

    #[test]
    fn up_messages_on_the_wire() {
        let frames: Vec<String> = [
            UpMessage::RequestLoginMail { email: "a@b.com".to_string(), request_id: RequestId::new("r1") },
            UpMessage::LoginCode {
                login_id: "L1".to_string(),
                code: "123456".to_string(),
                request_id: RequestId::new("r2"),
            },
            UpMessage::ValidateToken { token: "T1".to_string(), request_id: RequestId::new("r3") },
        ]
        .iter()
        .map(|msg| serde_json::to_string(msg).unwrap())
        .collect();

        insta::assert_snapshot!(frames.join("\n"), @r#"
        {"type":"RequestLoginMail","email":"a@b.com","requestId":"r1"}
        {"type":"LoginCode","loginId":"L1","code":"123456","requestId":"r2"}
        {"type":"ValidateToken","token":"T1","requestId":"r3"}
        "#);
    }

    #[test]
    fn optional_down_fields_are_omitted() {
        let frames: Vec<String> = [
            DownMessage::LoggedIn { token: "T1".to_string(), request_id: RequestId::new("r1"), documents: vec![] },
            DownMessage::LoggedIn {
                token: "T2".to_string(),
                request_id: RequestId::new("r2"),
                documents: vec![DocumentSummary { id: "doc-1".to_string() }],
            },
            DownMessage::Error { message: "boom".to_string(), request_id: None },
        ]
        .iter()
        .map(|msg| serde_json::to_string(msg).unwrap())
        .collect();

        insta::assert_snapshot!(frames.join("\n"), @r#"
        {"type":"LoggedIn","token":"T1","requestId":"r1"}
        {"type":"LoggedIn","token":"T2","requestId":"r2","documents":[{"id":"doc-1"}]}
        {"type":"Error","message":"boom"}
        "#);
    }

    #[test]
    fn logged_in_without_documents_decodes() {
        let msg: DownMessage =
            serde_json::from_str(r#"{"type":"LoggedIn","token":"T1","requestId":"r2"}"#).unwrap();
        assert_eq!(msg, DownMessage::LoggedIn {
            token: "T1".to_string(),
            request_id: RequestId::new("r2"),
            documents: vec![],
        });
        assert_eq!(msg.kind(), DownKind::LoggedIn);
    }

    #[test]
    fn answers_matches_only_the_echoed_id() {
        let msg = DownMessage::LoginEmailSend {
            login_id: "L1".to_string(),
            request_id: RequestId::new("r1"),
        };
        assert!(msg.answers(&RequestId::new("r1")));
        assert!(!msg.answers(&RequestId::new("r0")));
    }

    #[test]
    fn unsolicited_error_answers_nothing() {
        let msg = DownMessage::Error { message: "down for maintenance".to_string(), request_id: None };
        assert_eq!(msg.request_id(), None);
        assert!(!msg.answers(&RequestId::new("r1")));
    }
}
