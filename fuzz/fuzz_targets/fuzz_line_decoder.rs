#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use portal_mux::core::codec::{LineCodec, TextInput};
use portal_mux::protocol::command::Command;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Every decoded line goes through the command parser as well
    let mut codec = LineCodec::new(512);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(item)) = codec.decode(&mut buf) {
        if let TextInput::Line(line) = item {
            let _ = Command::parse(&line);
        }
    }
});
