#![no_main]

use libfuzzer_sys::fuzz_target;
use map_router::core::blowfish::CipherKey;
use map_router::core::codec::BitCodec;
use map_router::core::tables::TableBuilder;
use map_router::protocol::{InboundPipeline, LoginRequest, Session};
use std::sync::OnceLock;

fn pipeline() -> &'static InboundPipeline {
    static PIPELINE: OnceLock<InboundPipeline> = OnceLock::new();
    PIPELINE.get_or_init(|| {
        InboundPipeline::new(BitCodec::new(TableBuilder::new().build().expect("tables")))
    })
}

fuzz_target!(|data: &[u8]| {
    let mut session = Session::new(
        "127.0.0.1:1".parse().expect("addr"),
        1,
        CipherKey::from_str_key("fuzz"),
    );

    // Plaintext path: login recognition
    if let Ok(Some(login)) = LoginRequest::parse(data) {
        let _ = pipeline().process_login(&mut session, data, &login);
    }

    // Encrypted path: anything that survives decryption is demultiplexed
    let mut datagram = data.to_vec();
    let before = session.last_client_sequence();
    if pipeline().process(&mut session, &mut datagram).is_ok() {
        assert!(session.last_client_sequence() >= before);
    }
});
