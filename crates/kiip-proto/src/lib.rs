//! Wire format for the Kiip client protocol.
//!
//! Every frame exchanged with the server is a JSON object carrying a `type`
//! discriminator plus variant-specific fields. Requests that expect an answer
//! carry a caller-generated `requestId` which the server echoes verbatim, so
//! a client can pair responses with the request that is still outstanding and
//! drop the rest.
//!
//! The [`Codec`] trait decouples the transport from the encoding: the
//! transport only moves text frames, while [`JsonCodec`] turns them into typed
//! envelopes and [`TextCodec`] passes them through untouched.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
pub mod errors;
pub mod messages;

pub use codec::{Codec, JsonCodec, KiipCodec, TextCodec};
pub use errors::{ProtocolError, Result};
pub use messages::{DocumentSummary, DownKind, DownMessage, Envelope, RequestId, UpKind, UpMessage};
