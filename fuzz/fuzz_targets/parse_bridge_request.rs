#![no_main]

use libfuzzer_sys::fuzz_target;
use lockstep_core::protocol::Request;

fuzz_target!(|data: &[u8]| {
    let Ok(req) = Request::parse(data) else {
        return;
    };

    // Accepted requests re-encode to the exact datagram.
    assert_eq!(req.encode(), data);
});
