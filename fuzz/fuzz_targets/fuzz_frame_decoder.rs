#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use portal_mux::core::codec::{FrameCodec, FrameInput};
use portal_mux::protocol::dispatcher::command_for;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut codec = FrameCodec::server(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(item)) = codec.decode(&mut buf) {
        if let FrameInput::Frame(frame) = item {
            let _ = command_for(&frame);
        }
    }
});
