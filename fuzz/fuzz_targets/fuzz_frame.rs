#![no_main]

use libfuzzer_sys::fuzz_target;

use bytes::BytesMut;
use ipvs_common::frame::{REQUEST_HEADER_LEN, RequestHeader, ResponseHeader};

// Fuzz the control-channel frame headers.
//
// A decoded header must survive re-encoding (padding is not preserved), and
// the ceiling check must never panic whatever the declared lengths.
fuzz_target!(|data: &[u8]| {
    if let Ok(header) = RequestHeader::decode(&mut &data[..]) {
        let _ = header.command();
        let _ = header.check_ceilings();

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), REQUEST_HEADER_LEN);
        assert_eq!(RequestHeader::decode(&mut &buf[..]).ok(), Some(header));
    }

    let _ = ResponseHeader::decode(&mut &data[..]);
});
