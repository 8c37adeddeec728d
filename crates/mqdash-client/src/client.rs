//! MQTT client implementation.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use rustls::{ClientConnection, StreamOwned};

use mqdash_core::packet::{
    decode_packet, encode_ack, encode_connect, encode_disconnect, encode_pingreq, encode_publish,
    encode_subscribe, encode_unsubscribe, Connack, ConnackCode, Connect, Packet, PacketType,
    Publish, QoS, Subscribe, Unsubscribe,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, ConnectionState};
use crate::tls;

const CLIENT: Token = Token(0);
const DEFAULT_BUFFER_SIZE: usize = 8192;
/// Unanswered PINGREQs tolerated before the connection is declared dead.
const MAX_PENDING_PINGS: u8 = 2;

/// Socket, optionally wrapped in TLS.
enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn socket(&mut self) -> &mut TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::Tls(s) => s.get_mut(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

/// MQTT client.
pub struct Client {
    config: ClientConfig,
    state: ConnectionState,
    poll: Poll,
    stream: Option<Stream>,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    events: VecDeque<ClientEvent>,
    next_packet_id: u16,
    connect_started: Instant,
    last_packet_time: Instant,
    pending_pings: u8,
}

impl Client {
    /// Create a new MQTT client with the given configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let poll = Poll::new()?;

        Ok(Self {
            config,
            state: ConnectionState::Disconnected,
            poll,
            stream: None,
            read_buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            write_buf: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
            events: VecDeque::new(),
            next_packet_id: 1,
            connect_started: Instant::now(),
            last_packet_time: Instant::now(),
            pending_pings: 0,
        })
    }

    /// Open the socket and queue CONNECT.
    ///
    /// Returns once the TCP (and TLS) connection is up; the
    /// `ClientEvent::Connected` event follows from `poll` when the broker
    /// accepts the session.
    pub fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(ClientError::InvalidState(
                "Already connected or connecting".to_string(),
            ));
        }

        // Events from a previous session are stale now
        self.events.clear();

        let addr = self
            .config
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                ClientError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "Could not resolve address",
                ))
            })?;

        let mut std_stream = StdTcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
        std_stream.set_nodelay(true)?;

        // The TLS handshake runs blocking, before the socket joins the poll.
        let tls_conn = match &self.config.tls {
            Some(tls_config) => {
                std_stream.set_read_timeout(Some(self.config.connect_timeout))?;
                std_stream.set_write_timeout(Some(self.config.connect_timeout))?;
                let mut conn = tls::connect(tls_config, self.config.host())?;
                while conn.is_handshaking() {
                    conn.complete_io(&mut std_stream)
                        .map_err(|e| ClientError::Tls(format!("Handshake failed: {}", e)))?;
                }
                std_stream.set_read_timeout(None)?;
                std_stream.set_write_timeout(None)?;
                Some(conn)
            }
            None => None,
        };

        std_stream.set_nonblocking(true)?;
        let mut socket = TcpStream::from_std(std_stream);

        self.poll
            .registry()
            .register(&mut socket, CLIENT, Interest::READABLE | Interest::WRITABLE)?;

        self.stream = Some(match tls_conn {
            Some(conn) => Stream::Tls(Box::new(StreamOwned::new(conn, socket))),
            None => Stream::Plain(socket),
        });
        self.state = ConnectionState::Connecting;
        self.connect_started = Instant::now();

        let connect = Connect {
            client_id: self.config.client_id.clone(),
            keep_alive: self.config.keep_alive,
            clean_session: self.config.clean_session,
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        };

        encode_connect(&connect, &mut self.write_buf);
        self.last_packet_time = Instant::now();
        debug!("Connecting to {} as '{}'", self.config.address, connect.client_id);

        self.send()
    }

    /// Disconnect from the broker.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.stream.is_none() {
            return Ok(());
        }

        encode_disconnect(&mut self.write_buf);
        let _ = self.flush_write_buffer();

        self.cleanup();
        self.events.push_back(ClientEvent::Disconnected { reason: None });

        Ok(())
    }

    /// Subscribe to topics.
    pub fn subscribe(&mut self, topics: &[(&str, QoS)]) -> Result<u16> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let packet_id = self.next_packet_id();
        let subscribe = Subscribe {
            packet_id,
            topics: topics
                .iter()
                .map(|(topic, qos)| (topic.to_string(), *qos))
                .collect(),
        };

        encode_subscribe(&subscribe, &mut self.write_buf);
        self.last_packet_time = Instant::now();
        self.send()?;

        Ok(packet_id)
    }

    /// Unsubscribe from topics.
    pub fn unsubscribe(&mut self, topics: &[&str]) -> Result<u16> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let packet_id = self.next_packet_id();
        let unsubscribe = Unsubscribe {
            packet_id,
            topics: topics.iter().map(|t| t.to_string()).collect(),
        };

        encode_unsubscribe(&unsubscribe, &mut self.write_buf);
        self.last_packet_time = Instant::now();
        self.send()?;

        Ok(packet_id)
    }

    /// Publish a message.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let packet_id = if qos != QoS::AtMostOnce {
            Some(self.next_packet_id())
        } else {
            None
        };

        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        };

        encode_publish(&publish, &mut self.write_buf);
        self.last_packet_time = Instant::now();
        self.send()?;

        Ok(packet_id)
    }

    /// Poll for I/O with timeout.
    ///
    /// Connection failures are reported as `ClientEvent::Disconnected`, not as
    /// errors. Returns true if there are events to process.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if let Err(e) = self.flush_write_buffer() {
            self.connection_lost(format!("Write failed: {}", e));
            return Ok(true);
        }

        if self.state == ConnectionState::Connecting
            && self.connect_started.elapsed() >= self.config.connect_timeout
        {
            self.connection_lost("Timed out waiting for CONNACK".to_string());
            return Ok(true);
        }

        if self.state == ConnectionState::Connected && self.config.keep_alive > 0 {
            let keep_alive = Duration::from_secs(self.config.keep_alive as u64);

            if self.last_packet_time.elapsed() >= keep_alive {
                if self.pending_pings >= MAX_PENDING_PINGS {
                    self.connection_lost("Keep-alive timeout".to_string());
                    return Ok(true);
                }

                encode_pingreq(&mut self.write_buf);
                self.pending_pings += 1;
                self.last_packet_time = Instant::now();
                trace!("PINGREQ ({} pending)", self.pending_pings);
            }
        }

        let mut events = Events::with_capacity(16);
        if let Err(e) = self.poll.poll(&mut events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(ClientError::Io(e));
            }
        }

        for event in events.iter() {
            if event.token() != CLIENT {
                continue;
            }
            if event.is_readable() {
                if let Err(e) = self.handle_read() {
                    self.connection_lost(e.to_string());
                    break;
                }
            }
            if event.is_writable() {
                if let Err(e) = self.flush_write_buffer() {
                    self.connection_lost(format!("Write failed: {}", e));
                    break;
                }
            }
        }

        Ok(!self.events.is_empty())
    }

    /// Get the next event, if any.
    pub fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Check whether a socket is open (connected or awaiting CONNACK).
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    // === Internal methods ===

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }

    /// Push queued bytes now; a write failure closes the connection.
    fn send(&mut self) -> Result<()> {
        if let Err(e) = self.flush_write_buffer() {
            let reason = format!("Write failed: {}", e);
            self.connection_lost(reason);
            return Err(e);
        }
        Ok(())
    }

    fn handle_read(&mut self) -> Result<()> {
        let stream = match &mut self.stream {
            Some(s) => s,
            None => return Ok(()),
        };

        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.connection_lost("Connection closed by peer".to_string());
                    return Ok(());
                }
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ClientError::Io(e)),
            }
        }

        self.parse_packets()
    }

    fn parse_packets(&mut self) -> Result<()> {
        while !self.read_buf.is_empty() && self.stream.is_some() {
            match decode_packet(&self.read_buf, self.config.max_packet_size)? {
                Some((packet, consumed)) => {
                    let _ = self.read_buf.split_to(consumed);
                    self.handle_packet(packet);
                }
                None => break, // Need more data
            }
        }
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet) {
        self.last_packet_time = Instant::now();

        match packet {
            Packet::Connack(connack) => self.handle_connack(connack),
            Packet::Publish(publish) => self.handle_publish(publish),
            Packet::Puback { packet_id } => {
                self.events.push_back(ClientEvent::PubAck { packet_id });
            }
            Packet::Pubrec { packet_id } => {
                encode_ack(PacketType::Pubrel, packet_id, &mut self.write_buf);
            }
            Packet::Pubrel { packet_id } => {
                encode_ack(PacketType::Pubcomp, packet_id, &mut self.write_buf);
            }
            Packet::Pubcomp { packet_id } => {
                self.events.push_back(ClientEvent::PubComp { packet_id });
            }
            Packet::Suback(suback) => {
                self.events.push_back(ClientEvent::SubAck {
                    packet_id: suback.packet_id,
                    return_codes: suback.return_codes,
                });
            }
            Packet::Unsuback { packet_id } => {
                self.events.push_back(ClientEvent::UnsubAck { packet_id });
            }
            Packet::Pingresp => {
                self.pending_pings = 0;
            }
        }
    }

    fn handle_connack(&mut self, connack: Connack) {
        if self.state != ConnectionState::Connecting {
            warn!("Ignoring CONNACK in state {:?}", self.state);
            return;
        }

        if connack.code != ConnackCode::Accepted {
            self.connection_lost(format!("Connection refused: {:?}", connack.code));
            return;
        }

        self.state = ConnectionState::Connected;
        self.pending_pings = 0;
        self.events.push_back(ClientEvent::Connected {
            session_present: connack.session_present,
        });
    }

    fn handle_publish(&mut self, publish: Publish) {
        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                encode_ack(PacketType::Puback, packet_id, &mut self.write_buf);
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                encode_ack(PacketType::Pubrec, packet_id, &mut self.write_buf);
            }
            _ => {}
        }

        self.events.push_back(ClientEvent::Message {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retain: publish.retain,
        });
    }

    fn flush_write_buffer(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }

        let stream = match &mut self.stream {
            Some(s) => s,
            None => return Ok(()),
        };

        let mut written = 0;
        while written < self.write_buf.len() {
            match stream.write(&self.write_buf[written..]) {
                Ok(0) => return Err(ClientError::ConnectionClosed),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ClientError::Io(e)),
            }
        }

        if written > 0 {
            self.write_buf.drain(..written);
        }
        Ok(())
    }

    fn connection_lost(&mut self, reason: String) {
        debug!("Connection to {} lost: {}", self.config.address, reason);
        self.cleanup();
        self.events.push_back(ClientEvent::Disconnected {
            reason: Some(reason),
        });
    }

    fn cleanup(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.poll.registry().deregister(stream.socket());
        }
        self.state = ConnectionState::Disconnected;
        self.read_buf.clear();
        self.write_buf.clear();
        self.pending_pings = 0;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
