#![no_main]

use libfuzzer_sys::fuzz_target;
use portal_mux::core::envelope::{open, SharedSecret};

fuzz_target!(|data: &[u8]| {
    let _ = open(&SharedSecret::from("foobar"), data);
});
