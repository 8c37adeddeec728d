//! Redis pub/sub over RESP2.
//!
//! [`RedisBus`] uses two connections, as Redis requires: a request/reply
//! connection for `PUBLISH`, and a subscriber connection read by a listener
//! thread. The listener reconnects on failure and subscribes every channel
//! that still has handlers.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::bus::{BusHandler, EventBus};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::util::guarded;

/// Delay before the listener reconnects.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
/// Largest bulk string accepted (the Redis limit).
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Deepest array nesting accepted. Redis replies nest a few levels at most.
const MAX_DEPTH: usize = 32;
const READ_CHUNK: usize = 4096;

/// A RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string.
    Bulk(Option<Bytes>),
    /// `None` is the null array.
    Array(Option<Vec<Frame>>),
}

impl Frame {
    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Bulk(Some(data)) => Some(&data[..]),
            Frame::Simple(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// Append a command (an array of bulk strings) to `buf`.
pub fn encode_command(args: &[&[u8]], buf: &mut BytesMut) {
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
}

/// Find the line starting at `start`. Returns it and the offset past CRLF.
fn read_line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], start + end + 2))
}

fn parse_int(line: &[u8]) -> Result<i64, BusError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BusError::Protocol(format!("invalid integer {:?}", line)))
}

/// Length prefix of a bulk string or array; `None` for -1.
fn parse_len(line: &[u8]) -> Result<Option<usize>, BusError> {
    match parse_int(line)? {
        -1 => Ok(None),
        n if n < 0 => Err(BusError::Protocol(format!("invalid length {}", n))),
        n if n as usize > MAX_BULK_LEN => {
            Err(BusError::Protocol(format!("length {} too large", n)))
        }
        n => Ok(Some(n as usize)),
    }
}

/// Outcome of parsing from a buffer that may hold a partial frame.
#[derive(Debug, PartialEq, Eq)]
enum Parsed {
    /// A frame and the offset just past it.
    Done(Frame, usize),
    /// Incomplete; the buffer must grow to at least this many bytes
    /// before another attempt can get further.
    Need(usize),
}

fn parse_frame(buf: &[u8], start: usize, depth: usize) -> Result<Parsed, BusError> {
    let Some(&prefix) = buf.get(start) else {
        return Ok(Parsed::Need(start + 1));
    };
    let Some((line, next)) = read_line(buf, start + 1) else {
        return Ok(Parsed::Need(buf.len() + 1));
    };
    let text = || String::from_utf8_lossy(line).into_owned();

    let parsed = match prefix {
        b'+' => Parsed::Done(Frame::Simple(text()), next),
        b'-' => Parsed::Done(Frame::Error(text()), next),
        b':' => Parsed::Done(Frame::Integer(parse_int(line)?), next),
        b'$' => match parse_len(line)? {
            None => Parsed::Done(Frame::Bulk(None), next),
            Some(len) => {
                let end = next + len;
                if buf.len() < end + 2 {
                    return Ok(Parsed::Need(end + 2));
                }
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(BusError::Protocol("bulk string not terminated".into()));
                }
                let data = Bytes::copy_from_slice(&buf[next..end]);
                Parsed::Done(Frame::Bulk(Some(data)), end + 2)
            }
        },
        b'*' => {
            if depth >= MAX_DEPTH {
                return Err(BusError::Protocol(format!(
                    "arrays nested deeper than {}",
                    MAX_DEPTH
                )));
            }
            match parse_len(line)? {
                None => Parsed::Done(Frame::Array(None), next),
                Some(count) => {
                    let mut items = Vec::with_capacity(count.min(64));
                    let mut pos = next;
                    for _ in 0..count {
                        match parse_frame(buf, pos, depth + 1)? {
                            Parsed::Done(item, after) => {
                                items.push(item);
                                pos = after;
                            }
                            need => return Ok(need),
                        }
                    }
                    Parsed::Done(Frame::Array(Some(items)), pos)
                }
            }
        }
        other => {
            return Err(BusError::Protocol(format!(
                "unexpected type byte 0x{:02x}",
                other
            )))
        }
    };
    Ok(parsed)
}

/// Decode one frame from the front of `buf`.
///
/// Returns the frame and the bytes consumed, or `None` if `buf` does not
/// yet hold a complete frame.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, BusError> {
    match parse_frame(buf, 0, 0)? {
        Parsed::Done(frame, consumed) => Ok(Some((frame, consumed))),
        Parsed::Need(_) => Ok(None),
    }
}

/// One blocking RESP connection.
struct RespConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl RespConnection {
    fn open(config: &BusConfig) -> Result<Self, BusError> {
        let address = config.address();
        let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
            BusError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Could not resolve {}", address),
            ))
        })?;

        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(config.connect_timeout))?;
        stream.set_nodelay(true)?;
        let io_timeout = config.io_timeout();
        stream.set_read_timeout(io_timeout)?;
        stream.set_write_timeout(io_timeout)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
        };

        if let Some(ref password) = config.password {
            match conn.request(&[b"AUTH", password.as_bytes()])? {
                Frame::Simple(_) => {}
                other => {
                    return Err(BusError::Protocol(format!(
                        "unexpected AUTH reply {:?}",
                        other
                    )))
                }
            }
        }

        debug!("Connected to bus at {}", address);
        Ok(conn)
    }

    fn send(&mut self, args: &[&[u8]]) -> Result<(), BusError> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        self.stream.write_all(&self.write_buf)?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, BusError> {
        // Skip re-parsing until the buffer can hold what the last attempt
        // was missing, so a large bulk string is parsed once.
        let mut needed = 0;
        loop {
            if self.read_buf.len() >= needed {
                match parse_frame(&self.read_buf, 0, 0)? {
                    Parsed::Done(frame, consumed) => {
                        self.read_buf.advance(consumed);
                        return Ok(frame);
                    }
                    Parsed::Need(n) => needed = n,
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(BusError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection closed by server",
                )));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Send a command and read its reply. Error replies become errors.
    fn request(&mut self, args: &[&[u8]]) -> Result<Frame, BusError> {
        self.send(args)?;
        match self.read_frame()? {
            Frame::Error(message) => Err(BusError::Server(message)),
            frame => Ok(frame),
        }
    }
}

/// Subscriber-side state shared with the listener thread.
struct Subscriber {
    config: BusConfig,
    handlers: RwLock<HashMap<String, Vec<BusHandler>>>,
    /// Write half of the live subscriber connection.
    control: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl Subscriber {
    fn send_control(&self, command: &[u8], channel: &str) {
        let mut control = self.control.lock();
        if let Some(stream) = control.as_mut() {
            let mut buf = BytesMut::new();
            encode_command(&[command, channel.as_bytes()], &mut buf);
            if let Err(e) = stream.write_all(&buf) {
                warn!("Failed to send subscription change for {}: {}", channel, e);
            }
        }
    }

    fn run(&self, stop: Receiver<()>) {
        while !self.closed.load(Ordering::SeqCst) {
            match self.session() {
                Ok(()) => {}
                Err(e) if self.closed.load(Ordering::SeqCst) => {
                    trace!("Bus listener stopped: {}", e);
                }
                Err(e) => warn!("Bus subscriber connection lost: {}", e),
            }
            *self.control.lock() = None;

            match stop.recv_timeout(RECONNECT_BACKOFF) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
        }
        debug!("Bus listener exiting");
    }

    /// Connect, subscribe and deliver messages until the connection fails.
    fn session(&self) -> Result<(), BusError> {
        let mut conn = RespConnection::open(&self.config)?;
        // Pushes arrive whenever they arrive; only writes stay bounded.
        conn.stream.set_read_timeout(None)?;

        {
            let mut control = self.control.lock();
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            *control = Some(conn.stream.try_clone()?);

            let channels: Vec<String> = self.handlers.read().keys().cloned().collect();
            if !channels.is_empty() {
                let mut args: Vec<&[u8]> = vec![&b"SUBSCRIBE"[..]];
                args.extend(channels.iter().map(|c| c.as_bytes()));
                conn.send(&args)?;
                info!("Subscribed to {} bus channel(s)", channels.len());
            }
        }

        loop {
            match conn.read_frame()? {
                Frame::Array(Some(items)) => self.on_push(&items),
                Frame::Error(message) => error!("Bus subscriber error: {}", message),
                other => trace!("Ignoring bus frame {:?}", other),
            }
        }
    }

    fn on_push(&self, items: &[Frame]) {
        let kind = items.first().and_then(Frame::as_bytes);
        match (kind, items.get(1).and_then(Frame::as_bytes), items.get(2)) {
            (Some(b"message"), Some(channel), Some(payload)) => {
                let channel = String::from_utf8_lossy(channel);
                let Some(payload) = payload.as_bytes() else {
                    return;
                };
                let payload = String::from_utf8_lossy(payload);

                let handlers = self
                    .handlers
                    .read()
                    .get(channel.as_ref())
                    .cloned()
                    .unwrap_or_default();
                for handler in handlers {
                    guarded("Bus handler", || handler(&payload));
                }
            }
            (Some(kind), Some(channel), _) => trace!(
                "{} {}",
                String::from_utf8_lossy(kind),
                String::from_utf8_lossy(channel)
            ),
            _ => trace!("Ignoring bus push {:?}", items),
        }
    }
}

/// [`EventBus`] backed by a Redis server.
pub struct RedisBus {
    config: BusConfig,
    publisher: Mutex<Option<RespConnection>>,
    subscriber: Arc<Subscriber>,
    listener: Mutex<Option<(JoinHandle<()>, Sender<()>)>>,
}

impl RedisBus {
    /// Create the bus. Connections are opened on first use.
    pub fn new(config: BusConfig) -> Self {
        Self {
            subscriber: Arc::new(Subscriber {
                config: config.clone(),
                handlers: RwLock::new(HashMap::new()),
                control: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
            config,
            publisher: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Check the server is reachable by sending `PING`.
    pub fn ping(&self) -> Result<(), BusError> {
        self.with_publisher(|conn| conn.request(&[b"PING"]).map(|_| ()))
    }

    fn check_open(&self) -> Result<(), BusError> {
        if self.subscriber.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    /// Run `f` on the publisher connection, reconnecting first if needed.
    /// The connection is dropped after any error.
    fn with_publisher<T>(
        &self,
        f: impl FnOnce(&mut RespConnection) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        self.check_open()?;
        let mut publisher = self.publisher.lock();
        let mut conn = match publisher.take() {
            Some(conn) => conn,
            None => RespConnection::open(&self.config)?,
        };

        let result = f(&mut conn);
        if result.is_ok() {
            *publisher = Some(conn);
        }
        result
    }

    fn ensure_listener(&self) -> Result<(), BusError> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded(1);
        let subscriber = Arc::clone(&self.subscriber);
        let handle = thread::Builder::new()
            .name("mqdash-bus-listener".to_string())
            .spawn(move || subscriber.run(stop_rx))?;
        *listener = Some((handle, stop_tx));
        Ok(())
    }
}

impl EventBus for RedisBus {
    fn publish(&self, channel: &str, payload: &str) -> Result<usize, BusError> {
        let reply =
            self.with_publisher(|conn| conn.request(&[b"PUBLISH", channel.as_bytes(), payload.as_bytes()]))?;
        match reply {
            Frame::Integer(n) => Ok(n.max(0) as usize),
            other => Err(BusError::Protocol(format!(
                "unexpected PUBLISH reply {:?}",
                other
            ))),
        }
    }

    fn subscribe(&self, channel: &str, handler: BusHandler) -> Result<(), BusError> {
        self.check_open()?;
        let first = {
            let mut handlers = self.subscriber.handlers.write();
            let entry = handlers.entry(channel.to_string()).or_default();
            entry.push(handler);
            entry.len() == 1
        };

        if first {
            self.subscriber.send_control(b"SUBSCRIBE", channel);
        }
        self.ensure_listener()?;
        debug!("Subscribed to bus channel {}", channel);
        Ok(())
    }

    fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        self.check_open()?;
        if self.subscriber.handlers.write().remove(channel).is_some() {
            self.subscriber.send_control(b"UNSUBSCRIBE", channel);
            debug!("Unsubscribed from bus channel {}", channel);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), BusError> {
        if self.subscriber.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(stream) = self.subscriber.control.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let listener = self.listener.lock().take();
        if let Some((handle, stop)) = listener {
            let _ = stop.try_send(());
            drop(stop);
            if handle.join().is_err() {
                error!("Bus listener thread panicked");
            }
        }

        if let Some(conn) = self.publisher.lock().take() {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }

        info!("Bus connection closed");
        Ok(())
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::test_support::wait_until;

    fn bulk(s: &str) -> Frame {
        Frame::Bulk(Some(Bytes::copy_from_slice(s.as_bytes())))
    }

    #[test]
    fn test_encode_command() {
        let mut buf = BytesMut::new();
        encode_command(&[b"PUBLISH", b"chan", b"hi"], &mut buf);
        assert_eq!(&buf[..], b"*3\r\n$7\r\nPUBLISH\r\n$4\r\nchan\r\n$2\r\nhi\r\n");
    }

    #[test]
    fn test_decode_simple_types() {
        assert_eq!(
            decode_frame(b"+OK\r\n").unwrap(),
            Some((Frame::Simple("OK".into()), 5))
        );
        assert_eq!(
            decode_frame(b"-ERR wrong\r\n").unwrap(),
            Some((Frame::Error("ERR wrong".into()), 12))
        );
        assert_eq!(
            decode_frame(b":42\r\n").unwrap(),
            Some((Frame::Integer(42), 5))
        );
        assert_eq!(
            decode_frame(b"$-1\r\n").unwrap(),
            Some((Frame::Bulk(None), 5))
        );
        assert_eq!(
            decode_frame(b"$3\r\nfoo\r\n").unwrap(),
            Some((bulk("foo"), 9))
        );
    }

    #[test]
    fn test_decode_push_message() {
        let wire = b"*3\r\n$7\r\nmessage\r\n$4\r\nchan\r\n$5\r\nhello\r\n:1\r\n";
        let (frame, used) = decode_frame(wire).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Array(Some(vec![bulk("message"), bulk("chan"), bulk("hello")]))
        );
        // Trailing frame left in place
        assert_eq!(&wire[used..], b":1\r\n");
    }

    #[test]
    fn test_decode_incomplete() {
        for partial in [
            &b""[..],
            b"+OK",
            b"$5\r\nhel",
            b"$5\r\nhello",
            b"*2\r\n$1\r\na\r\n",
        ] {
            assert_eq!(decode_frame(partial).unwrap(), None, "{:?}", partial);
        }
    }

    #[test]
    fn test_decode_invalid() {
        assert!(decode_frame(b"?what\r\n").is_err());
        assert!(decode_frame(b":abc\r\n").is_err());
        assert!(decode_frame(b"$-5\r\n").is_err());
        assert!(decode_frame(b"$3\r\nfooXX").is_err());
    }

    /// Read one command from a test server connection.
    fn read_command(stream: &mut TcpStream, buf: &mut BytesMut) -> Vec<String> {
        loop {
            if let Some((frame, used)) = decode_frame(buf).unwrap() {
                buf.advance(used);
                let Frame::Array(Some(items)) = frame else {
                    panic!("expected array, got {:?}", frame);
                };
                return items
                    .iter()
                    .map(|f| String::from_utf8_lossy(f.as_bytes().unwrap()).into_owned())
                    .collect();
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "client closed connection");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn test_config(port: u16, password: Option<&str>) -> BusConfig {
        BusConfig {
            host: "127.0.0.1".into(),
            port,
            password: password.map(str::to_string),
            connect_timeout: 2,
            io_timeout: 2,
        }
    }

    #[test]
    fn test_publish_with_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = BytesMut::new();
            let auth = read_command(&mut stream, &mut buf);
            stream.write_all(b"+OK\r\n").unwrap();
            let publish = read_command(&mut stream, &mut buf);
            stream.write_all(b":2\r\n").unwrap();
            (auth, publish)
        });

        let bus = RedisBus::new(test_config(port, Some("hunter2")));
        assert_eq!(bus.publish("mqtt:broker:stats", "{}").unwrap(), 2);

        let (auth, publish) = server.join().unwrap();
        assert_eq!(auth, vec!["AUTH", "hunter2"]);
        assert_eq!(publish, vec!["PUBLISH", "mqtt:broker:stats", "{}"]);
        bus.close().unwrap();
    }

    #[test]
    fn test_publish_server_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = BytesMut::new();
            read_command(&mut stream, &mut buf);
            stream.write_all(b"-NOAUTH Authentication required.\r\n").unwrap();
        });

        let bus = RedisBus::new(test_config(port, None));
        assert!(matches!(bus.publish("c", "x"), Err(BusError::Server(_))));
        server.join().unwrap();
    }

    #[test]
    fn test_publish_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let bus = RedisBus::new(test_config(port, None));
        assert!(matches!(bus.publish("c", "x"), Err(BusError::Io(_))));
    }

    #[test]
    fn test_subscribe_delivers_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = BytesMut::new();
            let command = read_command(&mut stream, &mut buf);
            stream
                .write_all(b"*3\r\n$9\r\nsubscribe\r\n$12\r\nmqtt:command\r\n:1\r\n")
                .unwrap();
            stream
                .write_all(b"*3\r\n$7\r\nmessage\r\n$12\r\nmqtt:command\r\n$7\r\n{\"a\":1}\r\n")
                .unwrap();
            // Hold the connection open until the client closes it.
            let mut rest = [0u8; 64];
            let _ = stream.read(&mut rest);
            command
        });

        let bus = RedisBus::new(test_config(port, None));
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        bus.subscribe(
            "mqtt:command",
            Arc::new(move |payload: &str| sink.lock().push(payload.to_string())),
        )
        .unwrap();

        assert!(wait_until(|| !received.lock().is_empty()));
        assert_eq!(*received.lock(), vec![r#"{"a":1}"#]);

        bus.close().unwrap();
        assert_eq!(server.join().unwrap(), vec!["SUBSCRIBE", "mqtt:command"]);
        assert!(matches!(bus.publish("c", "x"), Err(BusError::Closed)));
    }

    #[test]
    fn test_decode_reports_needed_length() {
        assert_eq!(parse_frame(b"$100\r\nab", 0, 0).unwrap(), Parsed::Need(108));
        assert_eq!(
            parse_frame(b"*2\r\n$1\r\na\r\n$10\r\nxy", 0, 0).unwrap(),
            Parsed::Need(28)
        );
        assert_eq!(parse_frame(b"+OK", 0, 0).unwrap(), Parsed::Need(4));
    }

    #[test]
    fn test_decode_nesting_limit() {
        let nested = |depth: usize| {
            let mut wire = b"*1\r\n".repeat(depth);
            wire.extend_from_slice(b":1\r\n");
            wire
        };
        assert!(decode_frame(&nested(MAX_DEPTH)).unwrap().is_some());
        assert!(matches!(
            decode_frame(&nested(MAX_DEPTH + 1)),
            Err(BusError::Protocol(_))
        ));
        assert!(decode_frame(&nested(100_000)).is_err());
    }

    #[test]
    fn test_publish_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (done_tx, done_rx) = bounded::<()>(1);
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = BytesMut::new();
            read_command(&mut stream, &mut buf);
            // Never reply.
            let _ = done_rx.recv_timeout(Duration::from_secs(10));
        });

        let config = BusConfig {
            io_timeout: 1,
            ..test_config(port, None)
        };
        let bus = RedisBus::new(config);
        let started = std::time::Instant::now();
        assert!(matches!(bus.publish("c", "x"), Err(BusError::Io(_))));
        assert!(started.elapsed() < Duration::from_secs(5));

        let _ = done_tx.send(());
        server.join().unwrap();
    }

    #[test]
    fn test_subscribe_delivers_large_message_in_pieces() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let payload = "x".repeat(200_000);
        let expected = payload.clone();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = BytesMut::new();
            read_command(&mut stream, &mut buf);
            let mut wire = BytesMut::new();
            wire.extend_from_slice(b"*3\r\n$7\r\nmessage\r\n$4\r\nchan\r\n");
            wire.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());
            wire.extend_from_slice(payload.as_bytes());
            wire.extend_from_slice(b"\r\n");
            for piece in wire.chunks(1000) {
                stream.write_all(piece).unwrap();
            }
            let mut rest = [0u8; 64];
            let _ = stream.read(&mut rest);
        });

        let bus = RedisBus::new(test_config(port, None));
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        bus.subscribe(
            "chan",
            Arc::new(move |payload: &str| sink.lock().push(payload.len())),
        )
        .unwrap();

        assert!(wait_until(|| !received.lock().is_empty()));
        assert_eq!(*received.lock(), vec![expected.len()]);
        bus.close().unwrap();
        server.join().unwrap();
    }
}
