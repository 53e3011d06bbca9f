//! Frame codecs.
//!
//! A codec converts typed outbound messages to text frames and inbound text
//! frames to typed messages. Decoding never panics: every malformed input is
//! reported as a [`ProtocolError`] which the transport logs and drops.

use std::{fmt, marker::PhantomData};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    DownMessage, UpMessage,
    errors::{ProtocolError, Result},
};

/// Converts between typed messages and text frames.
pub trait Codec: 'static {
    /// Outbound message type.
    type Up: 'static;

    /// Inbound message type.
    type Down: 'static;

    /// Serialize an outbound message into a text frame.
    fn encode(&self, message: &Self::Up) -> Result<String>;

    /// Parse an inbound text frame.
    fn decode(&self, frame: &str) -> Result<Self::Down>;
}

/// JSON codec for `type`-tagged envelopes.
pub struct JsonCodec<Up, Down> {
    _marker: PhantomData<fn(Up) -> Down>,
}

/// Codec for the Kiip client protocol.
pub type KiipCodec = JsonCodec<UpMessage, DownMessage>;

impl<Up, Down> JsonCodec<Up, Down> {
    /// Create a new JSON codec.
    pub const fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<Up, Down> Default for JsonCodec<Up, Down> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Up, Down> Clone for JsonCodec<Up, Down> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<Up, Down> fmt::Debug for JsonCodec<Up, Down> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<Up, Down> Codec for JsonCodec<Up, Down>
where
    Up: Serialize + 'static,
    Down: DeserializeOwned + 'static,
{
    type Up = Up;
    type Down = Down;

    fn encode(&self, message: &Up) -> Result<String> {
        serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parses in two steps so a well-formed frame with an unknown tag can be
    /// told apart from garbage.
    fn decode(&self, frame: &str) -> Result<Down> {
        let value: serde_json::Value =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Decode(e.to_string()))?;

        let Some(tag) = value.get("type").and_then(serde_json::Value::as_str) else {
            return Err(ProtocolError::MissingType);
        };
        let tag = tag.to_owned();

        serde_json::from_value(value).map_err(|e| {
            if e.to_string().starts_with("unknown variant") {
                ProtocolError::UnknownType(tag)
            } else {
                ProtocolError::Decode(e.to_string())
            }
        })
    }
}

/// Passthrough codec: frames are delivered and sent as raw text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl Codec for TextCodec {
    type Up = String;
    type Down = String;

    fn encode(&self, message: &String) -> Result<String> {
        Ok(message.clone())
    }

    fn decode(&self, frame: &str) -> Result<String> {
        Ok(frame.to_owned())
    }
}
