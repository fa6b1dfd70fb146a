//! Fuzz target for message parsing.
//!
//! Anything that parses must re-encode, and admission frames must either
//! yield a request or a clean error.

#![no_main]

use cloudhub::message::Message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(msg) = Message::from_slice(data) else {
        return;
    };

    let bytes = msg.to_bytes().expect("parsed message must re-encode");
    let again = Message::from_slice(&bytes).expect("re-encoded message must parse");
    assert_eq!(again.version, msg.version);
    assert_eq!(again.resource, msg.resource);

    let _ = msg.admit_request();
    let _ = msg.ack();
});
