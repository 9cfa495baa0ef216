//! MQTT listener - accepts connections and runs one handler thread each.
//!
//! Connections share nothing but the broker collaborator. The server keeps a
//! registry of live sockets only so that [`ShutdownHandle::shutdown`] can
//! unblock their reads.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ahash::AHashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use mqgate_core::Connection;

use crate::broker::BrokerCore;
use crate::config::Config;
use crate::connection::ConnectionHandler;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) doesn't spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(5);

/// Live connections, keyed by connection id.
type Registry = Mutex<AHashMap<u64, TcpStream>>;

/// MQTT broker front end.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    broker: Arc<dyn BrokerCore>,
    max_packet_size: usize,
    max_connections: usize,
    shutdown: ShutdownHandle,
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    stopping: AtomicBool,
    local_addr: SocketAddr,
    connections: Registry,
}

impl ShutdownHandle {
    /// Stop accepting and shut down every live connection. Blocked reads on
    /// those connections return, so their handler threads exit.
    pub fn shutdown(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down listener on {}", self.inner.local_addr);

        // Wake the accept loop.
        let _ = TcpStream::connect(wake_addr(self.inner.local_addr));

        let mut connections = self.inner.connections.lock();
        for (_, mut stream) in connections.drain() {
            stream.close();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.inner.connections.lock().len()
    }
}

impl Server {
    /// Bind the listener described by `config`.
    pub fn new(config: &Config, broker: Arc<dyn BrokerCore>) -> io::Result<Self> {
        Self::bind(config.server.bind, config, broker)
    }

    /// Bind to `addr`, taking limits from `config`.
    pub fn bind(
        addr: SocketAddr,
        config: &Config,
        broker: Arc<dyn BrokerCore>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        info!("mqgate listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            broker,
            max_packet_size: config.limits.max_packet_size,
            max_connections: config.limits.max_connections,
            shutdown: ShutdownHandle {
                inner: Arc::new(ShutdownInner {
                    stopping: AtomicBool::new(false),
                    local_addr,
                    connections: Mutex::new(AHashMap::new()),
                }),
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept connections until shut down.
    ///
    /// A failed accept is logged and the loop continues; only shutdown ends it.
    pub fn run(&self) -> io::Result<()> {
        let next_id = AtomicU64::new(1);

        for incoming in self.listener.incoming() {
            if self.shutdown.is_stopping() {
                break;
            }

            let stream = match incoming {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    thread::sleep(ACCEPT_ERROR_BACKOFF);
                    continue;
                }
            };

            let id = next_id.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.spawn_connection(id, stream) {
                warn!("Failed to start connection {}: {}", id, e);
            }
        }

        info!("Listener on {} stopped", self.local_addr);
        Ok(())
    }

    fn spawn_connection(&self, id: u64, mut stream: TcpStream) -> io::Result<()> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format!("conn-{}", id));

        {
            let mut connections = self.shutdown.inner.connections.lock();
            // Checked under the lock: shutdown sets the flag before draining.
            if self.shutdown.is_stopping() {
                debug!("[{}] Listener stopping, closing new connection", peer);
                stream.close();
                return Ok(());
            }
            if self.max_connections > 0 && connections.len() >= self.max_connections {
                warn!(
                    "Connection limit {} reached, rejecting {}",
                    self.max_connections, peer
                );
                stream.close();
                return Ok(());
            }
            // Registered before the thread starts so shutdown never misses it.
            connections.insert(id, stream.try_clone()?);
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{}] set_nodelay failed: {}", peer, e);
        }
        debug!("[{}] Accepted connection {}", peer, id);

        let broker = Arc::clone(&self.broker);
        let max_packet_size = self.max_packet_size;
        let shutdown = self.shutdown.clone();
        let spawned = thread::Builder::new()
            .name(format!("mqgate-conn-{}", id))
            .spawn(move || {
                let _registration = Registration { shutdown, id };
                let handler = ConnectionHandler::new(stream, broker, max_packet_size, peer);
                // The handler logs its own close reason.
                let _ = handler.run();
            });

        if let Err(e) = spawned {
            error!("Failed to spawn handler thread: {}", e);
            if let Some(mut stream) = self.shutdown.inner.connections.lock().remove(&id) {
                stream.close();
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Releases a connection's registry slot when its handler thread ends,
/// including by panic.
struct Registration {
    shutdown: ShutdownHandle,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shutdown.inner.connections.lock().remove(&self.id);
    }
}

/// Address to connect to in order to wake a listener bound to `addr`.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    let mut wake = addr;
    if wake.ip().is_unspecified() {
        match wake {
            SocketAddr::V4(_) => wake.set_ip([127, 0, 0, 1].into()),
            SocketAddr::V6(_) => wake.set_ip(std::net::Ipv6Addr::LOCALHOST.into()),
        }
    }
    wake
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::thread::JoinHandle;
    use std::time::Instant;

    use mqgate_core::packet::{
        decode_packet, encode_packet, Connack, ConnackCode, Connect, Packet, QoS, Suback,
        SubackReturnCode, Subscribe,
    };
    use mqgate_core::FrameReader;

    use super::*;
    use crate::broker::GrantAll;

    /// Broker whose policy blows up on the first CONNECT.
    struct Panicking;

    impl BrokerCore for Panicking {
        fn connect(&self, _connect: &Connect) -> ConnackCode {
            panic!("broker policy failure");
        }

        fn subscribe(&self, _client_id: &str, _topics: &[(String, QoS)]) -> Vec<SubackReturnCode> {
            Vec::new()
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn start(config: Config) -> (SocketAddr, ShutdownHandle, JoinHandle<()>) {
        start_with(config, Arc::new(GrantAll::default()))
    }

    fn start_with(
        config: Config,
        broker: Arc<dyn BrokerCore>,
    ) -> (SocketAddr, ShutdownHandle, JoinHandle<()>) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Server::bind(addr, &config, broker).unwrap();
        let local = server.local_addr();
        let handle = server.shutdown_handle();
        let join = thread::spawn(move || server.run().unwrap());
        (local, handle, join)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        stream
    }

    fn send(stream: &mut TcpStream, packet: &Packet) {
        let mut buf = Vec::new();
        encode_packet(packet, &mut buf).unwrap();
        Write::write_all(stream, &buf).unwrap();
    }

    fn recv(stream: &mut TcpStream) -> Packet {
        let frame = FrameReader::default().read_frame(stream).unwrap();
        decode_packet(&frame).unwrap()
    }

    fn connect_packet(client_id: &str) -> Packet {
        Packet::Connect(Connect {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        })
    }

    fn subscribe_packet(packet_id: u16, filters: &[&str]) -> Packet {
        Packet::Subscribe(Subscribe {
            packet_id,
            topics: filters
                .iter()
                .map(|f| (f.to_string(), QoS::AtMostOnce))
                .collect(),
        })
    }

    fn assert_closed_without_reply(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0, "unexpected reply {:?}", &buf[..n]),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + TIMEOUT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_handshake_scenario() {
        let (addr, shutdown, join) = start(Config::default());
        let mut client = connect(addr);

        send(&mut client, &connect_packet("test"));
        assert_eq!(
            recv(&mut client),
            Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::Accepted,
            })
        );

        shutdown.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_subscribe_scenario() {
        let (addr, shutdown, join) = start(Config::default());
        let mut client = connect(addr);

        send(&mut client, &connect_packet("test"));
        assert!(matches!(recv(&mut client), Packet::Connack(_)));

        send(&mut client, &subscribe_packet(7, &["a/b", "c/+"]));
        assert_eq!(
            recv(&mut client),
            Packet::Suback(Suback {
                packet_id: 7,
                return_codes: vec![
                    SubackReturnCode::Granted(QoS::AtMostOnce),
                    SubackReturnCode::Granted(QoS::AtMostOnce),
                ],
            })
        );

        shutdown.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_fragmented_writes_over_tcp() {
        let (addr, shutdown, join) = start(Config::default());
        let mut client = connect(addr);
        client.set_nodelay(true).unwrap();

        let mut bytes = Vec::new();
        encode_packet(&connect_packet("slow"), &mut bytes).unwrap();
        encode_packet(&subscribe_packet(3, &["x/y"]), &mut bytes).unwrap();
        for b in &bytes {
            Write::write_all(&mut client, std::slice::from_ref(b)).unwrap();
        }

        assert!(matches!(recv(&mut client), Packet::Connack(_)));
        assert!(matches!(recv(&mut client), Packet::Suback(s) if s.packet_id == 3));

        shutdown.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_protocol_violation_scenario() {
        let (addr, shutdown, join) = start(Config::default());
        let mut client = connect(addr);

        send(&mut client, &subscribe_packet(1, &["a/b"]));
        assert_closed_without_reply(&mut client);

        shutdown.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_concurrent_clients_scenario() {
        let (addr, shutdown, join) = start(Config::default());

        let clients: Vec<_> = (0..2u16)
            .map(|i| {
                thread::spawn(move || {
                    let mut client = connect(addr);
                    let client_id = format!("client-{}", i);
                    send(&mut client, &connect_packet(&client_id));
                    assert!(matches!(
                        recv(&mut client),
                        Packet::Connack(Connack {
                            code: ConnackCode::Accepted,
                            ..
                        })
                    ));

                    let packet_id = 100 + i;
                    let filters: Vec<String> =
                        (0..=i).map(|n| format!("{}/topic/{}", client_id, n)).collect();
                    let refs: Vec<&str> = filters.iter().map(String::as_str).collect();
                    for _ in 0..20 {
                        send(&mut client, &subscribe_packet(packet_id, &refs));
                        match recv(&mut client) {
                            Packet::Suback(suback) => {
                                assert_eq!(suback.packet_id, packet_id);
                                assert_eq!(suback.return_codes.len(), filters.len());
                            }
                            other => panic!("expected SUBACK, got {:?}", other),
                        }
                    }
                })
            })
            .collect();

        for client in clients {
            client.join().unwrap();
        }

        shutdown.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_shutdown_unblocks_idle_connections() {
        let (addr, shutdown, join) = start(Config::default());
        let mut client = connect(addr);
        send(&mut client, &connect_packet("idle"));
        assert!(matches!(recv(&mut client), Packet::Connack(_)));
        wait_for(|| shutdown.active_connections() == 1);

        shutdown.shutdown();
        join.join().unwrap();

        assert_closed_without_reply(&mut client);
        assert_eq!(shutdown.active_connections(), 0);
    }

    #[test]
    fn test_connection_slot_is_released() {
        let (addr, shutdown, join) = start(Config::default());
        {
            let mut client = connect(addr);
            send(&mut client, &connect_packet("short"));
            assert!(matches!(recv(&mut client), Packet::Connack(_)));
            wait_for(|| shutdown.active_connections() == 1);
        }
        wait_for(|| shutdown.active_connections() == 0);

        shutdown.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let (addr, shutdown, join) = start(config);

        let mut first = connect(addr);
        send(&mut first, &connect_packet("first"));
        assert!(matches!(recv(&mut first), Packet::Connack(_)));

        let mut second = connect(addr);
        assert_closed_without_reply(&mut second);

        // The first client is unaffected.
        send(&mut first, &subscribe_packet(5, &["a"]));
        assert!(matches!(recv(&mut first), Packet::Suback(_)));

        shutdown.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_connection_after_shutdown_is_not_registered() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Server::bind(addr, &Config::default(), Arc::new(GrantAll::default())).unwrap();
        let shutdown = server.shutdown_handle();

        // A connection accepted just before shutdown drained the registry.
        let side = TcpListener::bind(addr).unwrap();
        let mut client = connect(side.local_addr().unwrap());
        let (accepted, _) = side.accept().unwrap();

        shutdown.shutdown();
        server.spawn_connection(1, accepted).unwrap();

        assert_eq!(shutdown.active_connections(), 0);
        assert_closed_without_reply(&mut client);
    }

    #[test]
    fn test_panicking_broker_releases_slot() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let (addr, shutdown, join) = start_with(config, Arc::new(Panicking));

        for _ in 0..2 {
            let mut client = connect(addr);
            send(&mut client, &connect_packet("doomed"));
            assert_closed_without_reply(&mut client);
            wait_for(|| shutdown.active_connections() == 0);
        }

        shutdown.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_bind_failure_is_io_error() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let err = Server::bind(addr, &Config::default(), Arc::new(GrantAll::default()))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_wake_addr() {
        let any: SocketAddr = "0.0.0.0:1883".parse().unwrap();
        assert_eq!(wake_addr(any), "127.0.0.1:1883".parse().unwrap());
        let any6: SocketAddr = "[::]:1883".parse().unwrap();
        assert_eq!(wake_addr(any6), "[::1]:1883".parse().unwrap());
        let fixed: SocketAddr = "10.0.0.1:1883".parse().unwrap();
        assert_eq!(wake_addr(fixed), fixed);
    }
}
