//! Fuzz target for CoAP message decoding
//!
//! # Invariants
//!
//! - NEVER panic on arbitrary input
//! - A decoded message re-encodes, and the re-encoding decodes to the same
//!   message
//! - Option accessors never panic on a decoded message

#![no_main]

use libfuzzer_sys::fuzz_target;
use mote_proto::Message;

fuzz_target!(|data: &[u8]| {
    let Ok(message) = Message::decode(data) else {
        return;
    };

    let _ = message.block1();
    let _ = message.block2();
    let _ = message.observe();
    let _ = message.resource_path();
    let _ = message.uri_query();
    let _ = message.location_path();

    let encoded = message.encode().expect("decoded message must re-encode");
    let again = Message::decode(&encoded).expect("re-encoded message must decode");
    assert_eq!(again, message);
});
