//! Fuzz target for the buffered frame reader.
//!
//! Feeds arbitrary bytes in arbitrary chunk sizes through a small reader.
//! It must never panic, never hold more than its capacity, and stop at the
//! first error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use table_replication::protocol::{FrameReader, ReadOutcome};

const CAPACITY: usize = 256;

fuzz_target!(|input: (Vec<u8>, Vec<u8>)| {
    let (data, chunks) = input;
    let mut reader = FrameReader::new(CAPACITY);
    let mut offset = 0;
    let mut sizes = chunks.iter().map(|c| *c as usize + 1).cycle();

    while offset < data.len() {
        let size = sizes.next().unwrap_or(data.len());
        let end = (offset + size).min(data.len());
        let chunk = &data[offset..end];
        let outcome = reader
            .fill(|buf, max| {
                let n = chunk.len().min(max);
                buf.extend_from_slice(&chunk[..n]);
                Ok(n)
            })
            .expect("in-memory fill cannot fail");
        match outcome {
            ReadOutcome::Data(n) => offset += n,
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::WouldBlock => unreachable!(),
        }
        assert!(reader.buffered_len() <= CAPACITY);

        loop {
            match reader.next_frame() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => return,
            }
        }
        if reader.buffered_len() == CAPACITY {
            // A full buffer with no complete frame cannot make progress.
            return;
        }
    }
});
