use std::{cell::RefCell, collections::VecDeque, fmt, mem, net::SocketAddr, rc::Rc, sync::Arc};

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{
    config::TransportConfig,
    connection::{Connection, Event},
    framer::Framer,
    io::{Clock, PacketWriter},
    time_wait::TimeWaitListManager,
    ErrorCode, Guid, Instant, Side,
};

/// Server-side owner of every connection on one socket
///
/// Datagrams are routed by guid: to a live connection, to the time-wait list if the connection
/// closed recently, or to a new connection otherwise. All of them write through the same
/// [`PacketWriter`].
pub struct Dispatcher {
    config: Arc<TransportConfig>,
    writer: Rc<RefCell<dyn PacketWriter>>,
    clock: Rc<dyn Clock>,
    connections: FxHashMap<Guid, Connection>,
    time_wait: TimeWaitListManager,
    /// Connections waiting for the writer, in the order they blocked
    write_blocked: VecDeque<Guid>,
    events: VecDeque<DispatcherEvent>,
}

impl Dispatcher {
    /// Create a dispatcher writing through `writer`
    pub fn new(
        config: Arc<TransportConfig>,
        writer: impl PacketWriter + 'static,
        clock: impl Clock + 'static,
    ) -> Self {
        let writer: Rc<RefCell<dyn PacketWriter>> = Rc::new(RefCell::new(writer));
        let clock: Rc<dyn Clock> = Rc::new(clock);
        let time_wait = TimeWaitListManager::new(
            &config.supported_versions,
            Box::new(writer.clone()),
            Box::new(clock.clone()),
        );
        Self {
            config,
            writer,
            clock,
            connections: FxHashMap::default(),
            time_wait,
            write_blocked: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Route a datagram received on `server_address` from `client_address`
    pub fn process_packet(
        &mut self,
        server_address: SocketAddr,
        client_address: SocketAddr,
        packet: &[u8],
    ) {
        let Some(guid) = Framer::read_guid_from_packet(packet) else {
            debug!(%client_address, "dropping packet without a full guid");
            return;
        };
        if self.time_wait.is_guid_in_time_wait(guid) {
            self.time_wait
                .process_packet(server_address.ip(), client_address, guid, packet);
            return;
        }
        if !self.connections.contains_key(&guid) {
            debug!(%guid, %client_address, "new connection");
            let connection = Connection::new(
                guid,
                Side::Server,
                server_address,
                client_address,
                self.config.clone(),
                Box::new(self.clock.clone()),
                Box::new(self.writer.clone()),
            );
            self.connections.insert(guid, connection);
        }
        self.with_connection(guid, |conn| {
            conn.process_udp_packet(server_address, client_address, packet)
        });
    }

    /// Run `f` on a live connection, then collect its events
    ///
    /// Returns `None` if no live connection has this guid.
    pub fn with_connection<R>(
        &mut self,
        guid: Guid,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        let result = f(self.connections.get_mut(&guid)?);
        self.after_connection_io(guid);
        Some(result)
    }

    /// A live connection
    pub fn connection(&self, guid: Guid) -> Option<&Connection> {
        self.connections.get(&guid)
    }

    /// Number of live connections
    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    /// Guids of recently closed connections
    pub fn time_wait(&self) -> &TimeWaitListManager {
        &self.time_wait
    }

    /// The writer may accept packets again
    ///
    /// Time-wait responses go first, then each blocked connection gets one chance to flush.
    /// Returns `false` if anything is still blocked.
    pub fn on_can_write(&mut self) -> bool {
        if self.time_wait.is_write_blocked() && !self.time_wait.on_can_write() {
            return false;
        }
        for guid in mem::take(&mut self.write_blocked) {
            self.with_connection(guid, |conn| conn.on_can_write());
        }
        self.write_blocked.is_empty()
    }

    /// Returns the next time at which `handle_timeout` should be called
    pub fn poll_timeout(&self) -> Instant {
        self.connections
            .values()
            .filter_map(|conn| conn.poll_timeout())
            .fold(self.time_wait.poll_timeout(), Instant::min)
    }

    /// Process timer expirations up to the current time
    pub fn handle_timeout(&mut self) {
        let now = self.clock.now();
        let due = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.poll_timeout().is_some_and(|x| x <= now))
            .map(|(&guid, _)| guid)
            .collect::<Vec<_>>();
        for guid in due {
            self.with_connection(guid, |conn| conn.handle_timeout());
        }
        self.time_wait.handle_timeout();
    }

    /// Returns events from every connection, tagged with the guid
    pub fn poll(&mut self) -> Option<DispatcherEvent> {
        self.events.pop_front()
    }

    /// Close every connection, telling peers that the server is going away
    pub fn shutdown(&mut self) {
        let guids = self.connections.keys().copied().collect::<Vec<_>>();
        for guid in guids {
            self.with_connection(guid, |conn| {
                conn.send_connection_close(ErrorCode::PeerGoingAway)
            });
        }
    }

    /// Surface the connection's events and retire it if it closed
    fn after_connection_io(&mut self, guid: Guid) {
        let Some(conn) = self.connections.get_mut(&guid) else {
            return;
        };
        while let Some(event) = conn.poll() {
            self.events.push_back(DispatcherEvent { guid, event });
        }
        if !conn.is_connected() {
            let close_packet = conn.take_close_packet();
            let version = conn.version();
            self.connections.remove(&guid);
            self.write_blocked.retain(|&x| x != guid);
            trace!(%guid, "retiring closed connection");
            self.time_wait
                .add_guid_to_time_wait(guid, version, close_packet);
            return;
        }
        if conn.is_write_blocked() && !self.write_blocked.contains(&guid) {
            self.write_blocked.push_back(guid);
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("connections", &self.connections.len())
            .field("time_wait", &self.time_wait)
            .field("write_blocked", &self.write_blocked)
            .finish()
    }
}

/// An [`Event`] of the connection identified by `guid`
#[derive(Debug)]
pub struct DispatcherEvent {
    /// Connection the event came from
    pub guid: Guid,
    /// What happened
    pub event: Event,
}
