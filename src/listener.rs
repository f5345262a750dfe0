//! Ingress listeners: UDP, TCP, and Unix datagram sockets feeding event
//! batches into the worker's channel.
//!
//! Listeners run on their own threads and are best-effort by protocol: a
//! datagram that fails to parse produces counters and debug logs, nothing
//! else. A closed socket or a disconnected worker channel ends the listener
//! silently.

use std::io::{BufRead, BufReader, Read};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use tracing::{debug, error};

use crate::event::Events;
use crate::parser::LineParser;
use crate::telemetry::{ErrorReason, Telemetry};

const MAX_PACKET_SIZE: usize = 65535;
const MAX_LINE_LENGTH: u64 = 65536;

fn packet_to_events(parser: &LineParser, telemetry: &Telemetry, packet: &[u8]) -> Events {
    let mut batch = Events::new();
    for line in packet.split(|byte| *byte == b'\n') {
        telemetry.lines_received.add(1.0);
        match std::str::from_utf8(line) {
            Ok(line) => batch.extend(parser.parse(line)),
            Err(_) => {
                telemetry.inc_sample_error(ErrorReason::MalformedLine);
                debug!("non-UTF-8 line in packet");
            }
        }
    }
    batch
}

/// A StatsD UDP listener.
pub struct UdpListener {
    socket: UdpSocket,
    parser: LineParser,
    telemetry: Arc<Telemetry>,
}

impl UdpListener {
    /// Creates a listener reading datagrams from an already-bound socket.
    pub fn new(socket: UdpSocket, parser: LineParser, telemetry: Arc<Telemetry>) -> UdpListener {
        UdpListener { socket, parser, telemetry }
    }

    /// Reads datagrams until the socket errors or the worker channel
    /// disconnects, publishing one event batch per packet.
    pub fn listen(self, events: Sender<Events>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let read = match self.socket.recv(&mut buf) {
                Ok(read) => read,
                Err(err) => {
                    error!(%err, "error reading from UDP socket");
                    return;
                }
            };

            self.telemetry.udp_packets.add(1.0);
            let batch = packet_to_events(&self.parser, &self.telemetry, &buf[..read]);
            if events.send(batch).is_err() {
                return;
            }
        }
    }
}

/// A StatsD TCP listener. Each accepted connection is served on its own
/// thread, one event batch per line.
pub struct TcpStreamListener {
    listener: TcpListener,
    parser: LineParser,
    telemetry: Arc<Telemetry>,
}

impl TcpStreamListener {
    /// Creates a listener accepting connections from an already-bound
    /// TCP listener.
    pub fn new(
        listener: TcpListener,
        parser: LineParser,
        telemetry: Arc<Telemetry>,
    ) -> TcpStreamListener {
        TcpStreamListener { listener, parser, telemetry }
    }

    /// Accepts connections until the listener errors.
    pub fn listen(self, events: Sender<Events>) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    self.telemetry.tcp_connections.add(1.0);
                    let parser = self.parser.clone();
                    let telemetry = self.telemetry.clone();
                    let events = events.clone();
                    thread::spawn(move || handle_connection(stream, parser, telemetry, events));
                }
                Err(err) => {
                    error!(%err, "error accepting TCP connection");
                    return;
                }
            }
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    parser: LineParser,
    telemetry: Arc<Telemetry>,
    events: Sender<Events>,
) {
    let peer = stream.peer_addr().ok();
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = match (&mut reader).take(MAX_LINE_LENGTH + 1).read_until(b'\n', &mut line) {
            Ok(read) => read,
            Err(err) => {
                telemetry.tcp_errors.add(1.0);
                debug!(?peer, %err, "error reading from TCP connection");
                return;
            }
        };
        if read == 0 {
            return;
        }

        if line.last() == Some(&b'\n') {
            line.pop();
        } else if read as u64 > MAX_LINE_LENGTH {
            telemetry.tcp_too_long_lines.add(1.0);
            debug!(?peer, "line too long");
            return;
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        telemetry.lines_received.add(1.0);
        let batch = match std::str::from_utf8(&line) {
            Ok(text) => parser.parse(text),
            Err(_) => {
                telemetry.inc_sample_error(ErrorReason::MalformedLine);
                debug!(?peer, "non-UTF-8 line on TCP connection");
                continue;
            }
        };
        if events.send(batch).is_err() {
            return;
        }
    }
}

/// A StatsD Unix datagram listener.
#[cfg(unix)]
pub struct UnixgramListener {
    socket: std::os::unix::net::UnixDatagram,
    parser: LineParser,
    telemetry: Arc<Telemetry>,
}

#[cfg(unix)]
impl UnixgramListener {
    /// Creates a listener reading datagrams from an already-bound socket.
    pub fn new(
        socket: std::os::unix::net::UnixDatagram,
        parser: LineParser,
        telemetry: Arc<Telemetry>,
    ) -> UnixgramListener {
        UnixgramListener { socket, parser, telemetry }
    }

    /// Reads datagrams until the socket errors or the worker channel
    /// disconnects, publishing one event batch per packet.
    pub fn listen(self, events: Sender<Events>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let read = match self.socket.recv(&mut buf) {
                Ok(read) => read,
                Err(err) => {
                    error!(%err, "error reading from Unix datagram socket");
                    return;
                }
            };

            self.telemetry.unixgram_packets.add(1.0);
            let batch = packet_to_events(&self.parser, &self.telemetry, &buf[..read]);
            if events.send(batch).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{TcpListener, TcpStream, UdpSocket};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{TcpStreamListener, UdpListener};
    use crate::event::Event;
    use crate::parser::LineParser;
    use crate::registry::Registry;
    use crate::telemetry::Telemetry;

    fn fixtures() -> (LineParser, Arc<Telemetry>) {
        let registry = Registry::new();
        let telemetry = Arc::new(Telemetry::register(&registry).unwrap());
        (LineParser::new(telemetry.clone()), telemetry)
    }

    #[test]
    fn test_udp_listener_delivers_one_batch_per_packet() {
        let (parser, telemetry) = fixtures();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let listener = UdpListener::new(socket, parser, telemetry);
        thread::spawn(move || listener.listen(tx));

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"foo:1|c\nbar:2|g", addr).unwrap();

        let batch = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(matches!(batch[0], Event::Counter { .. }));
        assert!(matches!(batch[1], Event::Gauge { .. }));
    }

    #[test]
    fn test_tcp_listener_delivers_one_batch_per_line() {
        let (parser, telemetry) = fixtures();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();

        let listener = TcpStreamListener::new(listener, parser, telemetry);
        thread::spawn(move || listener.listen(tx));

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"foo:1|c\nbar:320|ms\n").unwrap();
        drop(stream);

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0], Event::Counter { .. }));

        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(second.len(), 1);
        assert!(matches!(second[0], Event::Timer { .. }));
    }
}
