//! Fuzz target for inbound frame decoding
//!
//! Feeds arbitrary text to the client codec. Decoding must never panic, and
//! every frame it accepts must survive a re-encode unchanged.

#![no_main]

use kiip_proto::{Codec, DownMessage, KiipCodec};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|frame: &str| {
    let codec = KiipCodec::new();
    let Ok(message) = codec.decode(frame) else {
        return;
    };

    let encoded = serde_json::to_string(&message).expect("decoded message re-encodes");
    let decoded: DownMessage = codec.decode(&encoded).expect("re-encoded message decodes");
    assert_eq!(decoded, message);
    if let Some(id) = message.request_id() {
        assert!(message.answers(id));
    }
});
