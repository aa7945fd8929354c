#![no_main]

extern crate proto;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use proto::{Framer, FramerVisitor, PacketHeader, Side, DEFAULT_SUPPORTED_VERSIONS};

#[derive(Arbitrary, Debug)]
struct PacketParams {
    server: bool,
    buf: Vec<u8>,
}

/// Accepts everything the framer offers
struct Accept;

impl FramerVisitor for Accept {
    fn on_packet_header(&mut self, _: &PacketHeader) -> bool {
        true
    }
}

fuzz_target!(|data: PacketParams| {
    let side = if data.server { Side::Server } else { Side::Client };
    let mut framer = Framer::new(DEFAULT_SUPPORTED_VERSIONS, side);
    framer.process_packet(&mut Accept, &data.buf);
    if let Some(guid) = Framer::read_guid_from_packet(&data.buf) {
        assert_eq!(data.buf[1..9], guid.0.to_le_bytes());
    }
});
