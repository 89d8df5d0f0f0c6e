//! OSC control-plane adapter
//!
//! Translates inbound OSC messages into engine commands and carries
//! replies and per-frame blob messages back out. The wire codec is
//! `rosc`; the transport is selectable between UDP datagrams and
//! length-prefixed TCP streams.

use crate::engine::FlowEngine;
use crate::error::ServerError;
use crate::flow::ClientAddr;
use crate::publish::{paths, Publisher};
use blobserver_core::{Transport, Value, REPLY_PORT};
use parking_lot::Mutex;
use rosc::{decoder, encoder, OscMessage, OscPacket, OscType};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

const RECV_BUFFER_LEN: usize = 65536;
const RECV_POLL: Duration = Duration::from_millis(500);

fn value_from_osc(arg: &OscType) -> Option<Value> {
    match arg {
        OscType::Int(v) => Some(Value::Int(*v)),
        OscType::Long(v) => Some(Value::Int(*v as i32)),
        OscType::Float(v) => Some(Value::Float(*v)),
        OscType::Double(v) => Some(Value::Float(*v as f32)),
        OscType::String(v) => Some(Value::Str(v.clone())),
        OscType::Bool(v) => Some(Value::Bool(*v)),
        _ => None,
    }
}

fn value_to_osc(value: Value) -> OscType {
    match value {
        Value::Int(v) => OscType::Int(v),
        Value::Float(v) => OscType::Float(v),
        Value::Str(v) => OscType::String(v),
        Value::Bool(v) => OscType::Bool(v),
    }
}

/// Outbound OSC sender. One instance serves every subscriber; TCP
/// streams are cached per endpoint and reopened on write failure.
pub struct OscPublisher {
    transport: Transport,
    socket: UdpSocket,
    streams: Mutex<HashMap<ClientAddr, TcpStream>>,
}

impl OscPublisher {
    pub fn new(transport: Transport) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| ServerError::Transport(format!("Cannot open send socket: {}", e)))?;
        Ok(Self {
            transport,
            socket,
            streams: Mutex::new(HashMap::new()),
        })
    }

    fn send_tcp(&self, to: &ClientAddr, data: &[u8]) {
        let mut framed = Vec::with_capacity(data.len() + 4);
        framed.extend_from_slice(&(data.len() as u32).to_be_bytes());
        framed.extend_from_slice(data);

        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get_mut(to) {
            if stream.write_all(&framed).is_ok() {
                return;
            }
            streams.remove(to);
        }
        match TcpStream::connect((to.host.as_str(), to.port)) {
            Ok(mut stream) => {
                if stream.write_all(&framed).is_ok() {
                    streams.insert(to.clone(), stream);
                } else {
                    debug!(to = %to, "Stream write failed, dropping message");
                }
            }
            Err(e) => debug!(to = %to, "No stream to subscriber: {}", e),
        }
    }
}

impl Publisher for OscPublisher {
    fn send(&self, to: &ClientAddr, path: &str, args: Vec<Value>) {
        let packet = OscPacket::Message(OscMessage {
            addr: path.to_string(),
            args: args.into_iter().map(value_to_osc).collect(),
        });
        let data = match encoder::encode(&packet) {
            Ok(data) => data,
            Err(e) => {
                warn!(path, "Message encoding failed: {:?}", e);
                return;
            }
        };
        match self.transport {
            Transport::Udp => {
                if let Err(e) = self.socket.send_to(&data, (to.host.as_str(), to.port)) {
                    debug!(to = %to, "Datagram send failed: {}", e);
                }
            }
            Transport::Tcp => self.send_tcp(to, &data),
        }
    }
}

enum Listener {
    Udp(UdpSocket),
    Tcp(TcpListener),
}

/// The control-plane receiver. Owns the server endpoint and a handle
/// to the engine; every inbound message becomes one engine command.
pub struct ControlPlane {
    engine: Arc<FlowEngine>,
    publisher: Arc<dyn Publisher>,
    listener: Listener,
}

impl ControlPlane {
    /// Bind the server endpoint. Failure here is fatal to the process.
    pub fn bind(
        engine: Arc<FlowEngine>,
        publisher: Arc<dyn Publisher>,
        transport: Transport,
        port: u16,
    ) -> Result<Self, ServerError> {
        let listener = match transport {
            Transport::Udp => {
                let socket = UdpSocket::bind(("0.0.0.0", port))
                    .map_err(|e| ServerError::Bind(format!("UDP port {}: {}", port, e)))?;
                socket
                    .set_read_timeout(Some(RECV_POLL))
                    .map_err(|e| ServerError::Bind(e.to_string()))?;
                Listener::Udp(socket)
            }
            Transport::Tcp => {
                let listener = TcpListener::bind(("0.0.0.0", port))
                    .map_err(|e| ServerError::Bind(format!("TCP port {}: {}", port, e)))?;
                listener
                    .set_nonblocking(true)
                    .map_err(|e| ServerError::Bind(e.to_string()))?;
                Listener::Tcp(listener)
            }
        };
        Ok(Self {
            engine,
            publisher,
            listener,
        })
    }

    /// Run the receive loop on its own thread until the engine shuts
    /// down.
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("control".to_string())
            .spawn(move || self.run())
    }

    fn run(&self) {
        match &self.listener {
            Listener::Udp(socket) => self.run_udp(socket),
            Listener::Tcp(listener) => self.run_tcp(listener),
        }
    }

    fn run_udp(&self, socket: &UdpSocket) {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        while self.engine.is_running() {
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => match decoder::decode_udp(&buf[..len]) {
                    Ok((_, packet)) => self.handle_packet(packet),
                    Err(e) => error!("Protocol error: dropping datagram: {:?}", e),
                },
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Receive failed: {}", e);
                    return;
                }
            }
        }
    }

    fn run_tcp(&self, listener: &TcpListener) {
        while self.engine.is_running() {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "Control stream accepted");
                    self.read_stream(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(RECV_POLL);
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn read_stream(&self, mut stream: TcpStream) {
        let mut pending = Vec::new();
        let mut buf = [0u8; RECV_BUFFER_LEN];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return,
                Ok(len) => {
                    pending.extend_from_slice(&buf[..len]);
                    loop {
                        match decoder::decode_tcp(&pending) {
                            Ok((rest, Some(packet))) => {
                                let rest = rest.to_vec();
                                self.handle_packet(packet);
                                pending = rest;
                            }
                            Ok((_, None)) => break,
                            Err(e) => {
                                error!("Protocol error: dropping stream data: {:?}", e);
                                pending.clear();
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("Control stream closed: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_packet(&self, packet: OscPacket) {
        match packet {
            OscPacket::Message(msg) => self.handle_message(&msg),
            OscPacket::Bundle(bundle) => {
                for packet in bundle.content {
                    self.handle_packet(packet);
                }
            }
        }
    }

    /// Dispatch one inbound message. Malformed arguments are dropped
    /// with a log line; command failures become reply strings.
    pub fn handle_message(&self, msg: &OscMessage) {
        let mut args = Vec::with_capacity(msg.args.len());
        for arg in &msg.args {
            match value_from_osc(arg) {
                Some(value) => args.push(value),
                None => {
                    error!(path = %msg.addr, "Protocol error: unsupported argument type");
                    return;
                }
            }
        }

        match msg.addr.as_str() {
            paths::CONNECT => self.handle_connect(&args),
            paths::DISCONNECT => self.handle_disconnect(&args),
            paths::SET_PARAMETER => self.handle_set_parameter(&args),
            paths::GET_PARAMETER => self.handle_get_parameter(&args),
            paths::DETECTORS => self.handle_detectors(&args),
            paths::SOURCES => self.handle_sources(&args),
            other => debug!(path = other, "Unhandled message received"),
        }
    }

    fn reply_addr(args: &[Value]) -> Option<ClientAddr> {
        let host = args.first()?.as_str()?;
        Some(ClientAddr::new(host, REPLY_PORT))
    }

    fn reply_error(&self, to: &ClientAddr, path: &str, message: impl Into<String>) {
        self.publisher
            .send(to, path, vec![Value::Str(message.into())]);
    }

    fn handle_connect(&self, args: &[Value]) {
        let Some(reply) = Self::reply_addr(args) else {
            error!("Protocol error: connect without client host");
            return;
        };
        if args.len() < 5 {
            self.reply_error(&reply, paths::CONNECT, "Too few arguments");
            return;
        }
        let Some(port) = args[1].as_i32() else {
            self.reply_error(&reply, paths::CONNECT, "Expected a port number");
            return;
        };
        let Some(detector) = args[2].as_str() else {
            self.reply_error(&reply, paths::CONNECT, "Expected a detector type at position 2");
            return;
        };

        let mut specs = Vec::new();
        for chunk in args[3..].chunks(2) {
            if chunk.len() < 2 {
                self.reply_error(&reply, paths::CONNECT, "Missing sub-source number");
                return;
            }
            let Some(kind) = chunk[0].as_str() else {
                self.reply_error(&reply, paths::CONNECT, "Expected a source type");
                return;
            };
            let Some(subsource) = chunk[1].as_i32() else {
                self.reply_error(&reply, paths::CONNECT, "Expected integer as a sub-source number");
                return;
            };
            specs.push((kind.to_string(), subsource));
        }

        let client = ClientAddr::new(reply.host.clone(), port as u16);
        match self.engine.connect(client, detector, &specs) {
            Ok(id) => self.publisher.send(
                &reply,
                paths::CONNECT,
                vec![Value::Str("Connected".to_string()), Value::Int(id as i32)],
            ),
            Err(e) => self.reply_error(&reply, paths::CONNECT, e.to_string()),
        }
    }

    fn handle_disconnect(&self, args: &[Value]) {
        let Some(reply) = Self::reply_addr(args) else {
            error!("Protocol error: disconnect without client host");
            return;
        };
        if args.len() > 2 {
            self.reply_error(&reply, paths::DISCONNECT, "Wrong number of arguments");
            return;
        }
        let flow_id = match args.get(1) {
            Some(value) => match value.as_i32() {
                Some(id) => Some(id as u32),
                None => {
                    self.reply_error(&reply, paths::DISCONNECT, "Expected a flow id");
                    return;
                }
            },
            None => None,
        };
        // Removed flows are notified by the engine; removing nothing
        // is a no-op.
        self.engine.disconnect(&reply.host, flow_id);
    }

    fn handle_set_parameter(&self, args: &[Value]) {
        let Some(reply) = Self::reply_addr(args) else {
            error!("Protocol error: setParameter without client host");
            return;
        };
        if args.len() < 3 {
            self.reply_error(&reply, paths::SET_PARAMETER, "Wrong number of arguments");
            return;
        }
        let (Some(flow_id), Some(target)) = (args[1].as_i32(), args[2].as_str()) else {
            self.reply_error(&reply, paths::SET_PARAMETER, "Wrong number of arguments");
            return;
        };
        if let Err(e) = self
            .engine
            .set_parameter(flow_id as u32, target, &args[3..])
        {
            self.reply_error(&reply, paths::SET_PARAMETER, e.to_string());
        }
    }

    fn handle_get_parameter(&self, args: &[Value]) {
        let Some(reply) = Self::reply_addr(args) else {
            error!("Protocol error: getParameter without client host");
            return;
        };
        if args.len() < 4 {
            self.reply_error(&reply, paths::GET_PARAMETER, "Wrong number of arguments");
            return;
        }
        let (Some(flow_id), Some(target), Some(name)) =
            (args[1].as_i32(), args[2].as_str(), args[3].as_str())
        else {
            self.reply_error(&reply, paths::GET_PARAMETER, "Wrong number of arguments");
            return;
        };
        let source_index = args.get(4).and_then(Value::as_i32);
        match self
            .engine
            .get_parameter(flow_id as u32, target, name, source_index)
        {
            Ok(value) => self.publisher.send(
                &reply,
                paths::GET_PARAMETER,
                vec![Value::Str(name.to_string()), value],
            ),
            Err(e) => self.reply_error(&reply, paths::GET_PARAMETER, e.to_string()),
        }
    }

    fn handle_detectors(&self, args: &[Value]) {
        let Some(reply) = Self::reply_addr(args) else {
            error!("Protocol error: detectors without client host");
            return;
        };
        let kinds = self
            .engine
            .list_detectors()
            .into_iter()
            .map(Value::Str)
            .collect();
        self.publisher.send(&reply, paths::DETECTORS, kinds);
    }

    fn handle_sources(&self, args: &[Value]) {
        let Some(reply) = Self::reply_addr(args) else {
            error!("Protocol error: sources without client host");
            return;
        };
        match args.get(1) {
            // With a kind: its subsource indices.
            Some(kind) => {
                let Some(kind) = kind.as_str() else {
                    self.reply_error(&reply, paths::SOURCES, "Expected a source type");
                    return;
                };
                match self.engine.list_subsources(kind) {
                    Ok(indices) => self.publisher.send(
                        &reply,
                        paths::SOURCES,
                        indices.into_iter().map(Value::Int).collect(),
                    ),
                    Err(e) => self.reply_error(&reply, paths::SOURCES, e.to_string()),
                }
            }
            None => {
                let kinds = self
                    .engine
                    .list_sources()
                    .into_iter()
                    .map(Value::Str)
                    .collect();
                self.publisher.send(&reply, paths::SOURCES, kinds);
            }
        }
    }
}
