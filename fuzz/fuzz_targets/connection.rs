#![no_main]

extern crate proto;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use libfuzzer_sys::fuzz_target;
use proto::{Connection, Guid, PacketWriter, Side, SystemClock, TransportConfig, WriteResult};

struct Discard;

impl PacketWriter for Discard {
    fn write_packet(&mut self, buf: &[u8], _: IpAddr, _: SocketAddr) -> WriteResult {
        WriteResult::Ok {
            bytes_written: buf.len(),
        }
    }

    fn is_write_blocked_data_buffered(&self) -> bool {
        false
    }
}

fuzz_target!(|datagrams: Vec<Vec<u8>>| {
    let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4433);
    let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7890);
    let mut conn = Connection::new(
        Guid(1),
        Side::Server,
        local,
        remote,
        Arc::new(TransportConfig::default()),
        Box::new(SystemClock),
        Box::new(Discard),
    );
    for datagram in &datagrams {
        conn.process_udp_packet(local, remote, datagram);
        while conn.poll().is_some() {}
    }
});
