//! Fuzz target for single-frame decoding.
//!
//! Decoding must never panic, and any frame that decodes must survive an
//! encode/decode cycle unchanged.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use table_replication::protocol::{peek_header, Frame};

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = Frame::decode(data) else {
        return;
    };
    let declared = peek_header(data)
        .expect("decoded frame has a valid header")
        .map(|(_, len)| len)
        .expect("decoded frame has a full header");
    assert!(declared <= data.len());

    let mut buf = BytesMut::new();
    frame.encode(&mut buf).expect("decoded frame re-encodes");
    assert_eq!(buf.len(), frame.encoded_len());
    assert_eq!(Frame::decode(&buf).expect("re-encoded frame decodes"), frame);
});
