#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

use dime_core::config::FrameLimits;
use dime_proto::codec::FrameDecoder;
use dime_proto::RecvBuffer;

// The decoder must never panic, and chunking must not change what it
// decodes: feeding the stream whole and feeding it byte-by-byte have to
// agree on every frame up to the first error.
fuzz_target!(|data: &[u8]| {
    let limits = FrameLimits::default().with_max_frame(1 << 20);

    let whole = run_decoder(data, data.len().max(1), &limits);
    let dribble = run_decoder(data, 1, &limits);

    assert_eq!(whole, dribble);
});

/// Returns (decoded frame count, hit an error) for the given chunk size.
fn run_decoder(data: &[u8], chunk: usize, limits: &FrameLimits) -> (usize, bool) {
    let mut buf = RecvBuffer::new();
    let mut decoder = FrameDecoder::new(limits.clone());
    let mut frames = 0usize;

    for piece in data.chunks(chunk) {
        buf.push(Bytes::copy_from_slice(piece));
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(_)) => frames += 1,
                Ok(None) => break,
                Err(_) => return (frames, true),
            }
        }
    }

    (frames, false)
}
