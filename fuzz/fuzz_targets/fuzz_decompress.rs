#![no_main]

use libfuzzer_sys::fuzz_target;
use map_router::core::codec::BitCodec;
use map_router::core::tables::{CompressionTables, TableBuilder};
use std::sync::OnceLock;

fn codec() -> &'static BitCodec {
    static CODEC: OnceLock<BitCodec> = OnceLock::new();
    CODEC.get_or_init(|| BitCodec::new(TableBuilder::new().build().expect("tables")))
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let (count, stream) = data.split_at(4);
    let bits = u32::from_le_bytes([count[0], count[1], count[2], count[3]]) % (8 * 4096);

    // Arbitrary streams must fail cleanly, never panic or overrun the output
    let mut out = [0u8; 4096];
    if let Ok(n) = codec().decompress(stream, bits, &mut out) {
        assert!(n <= out.len());
    }

    // Compression of anything that fits must round trip
    if let Ok((bits, packed)) = codec().compress_to_vec(stream) {
        let mut back = vec![0u8; stream.len()];
        let n = codec().decompress(&packed, bits, &mut back).expect("roundtrip");
        assert_eq!(&back[..n], stream);
    }

    // Resource files straight from the fuzzer must never panic the loader
    let (encode, decode) = data.split_at(data.len() / 2);
    let _ = CompressionTables::from_bytes(encode, decode);
});
