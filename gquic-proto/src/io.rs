//! Interfaces to the host: a clock and somewhere to write datagrams

use std::{
    cell::RefCell,
    io,
    net::{IpAddr, SocketAddr, UdpSocket},
    rc::Rc,
};

use tracing::trace;

use crate::Instant;

/// Source of the current time
pub trait Clock {
    /// The current time
    fn now(&self) -> Instant;
}

impl<C: Clock + ?Sized> Clock for Rc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// [`Clock`] backed by [`Instant::now`]
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Outcome of handing a datagram to a [`PacketWriter`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriteResult {
    /// The datagram was written
    Ok {
        /// Bytes accepted by the writer
        bytes_written: usize,
    },
    /// The writer cannot accept data right now; retry once it signals writability
    Blocked,
    /// Writing failed with an OS error code
    Error(i32),
}

/// Sends datagrams on behalf of connections and the time-wait list
pub trait PacketWriter {
    /// Send `buf` from `self_address` to `peer_address`
    fn write_packet(
        &mut self,
        buf: &[u8],
        self_address: IpAddr,
        peer_address: SocketAddr,
    ) -> WriteResult;

    /// Whether a write that reported [`WriteResult::Blocked`] was nevertheless buffered and will
    /// go out without being written again
    fn is_write_blocked_data_buffered(&self) -> bool {
        false
    }
}

impl PacketWriter for UdpSocket {
    fn write_packet(
        &mut self,
        buf: &[u8],
        _self_address: IpAddr,
        peer_address: SocketAddr,
    ) -> WriteResult {
        match self.send_to(buf, peer_address) {
            Ok(bytes_written) => WriteResult::Ok { bytes_written },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => WriteResult::Blocked,
            Err(e) => {
                trace!(%peer_address, "send failed: {e}");
                WriteResult::Error(e.raw_os_error().unwrap_or(-1))
            }
        }
    }
}

/// Lets several owners share one writer
impl<W: PacketWriter + ?Sized> PacketWriter for Rc<RefCell<W>> {
    fn write_packet(
        &mut self,
        buf: &[u8],
        self_address: IpAddr,
        peer_address: SocketAddr,
    ) -> WriteResult {
        self.borrow_mut()
            .write_packet(buf, self_address, peer_address)
    }

    fn is_write_blocked_data_buffered(&self) -> bool {
        self.borrow().is_write_blocked_data_buffered()
    }
}
