//! Framed message transport over one TCP connection
//!
//! Writes go through a mutex so the frames of one logical message (or batch)
//! are never interleaved with another sender's. A dedicated receive thread
//! reassembles frames and deposits complete messages on the inbound queue;
//! batches land there under a single lock.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::framing::{self, Assembled, Reassembler};
use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::protocol::{MessageKind, PeerId, WireMessage};
use crate::queue::SharedQueue;

/// Invoked once when the connection terminates, from whichever thread noticed
pub type DisconnectCallback = Box<dyn Fn(PeerId) + Send + Sync>;

/// Bind a listening socket for incoming peers
pub fn listen(addr: SocketAddr) -> Result<TcpListener, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket.set_reuse_address(true).map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
    socket.listen(1).map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    Ok(socket.into())
}

#[derive(Debug, Default)]
struct TransportCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_received: u64,
    pub inbound_queued: usize,
}

/// Connection liveness plus the one-shot disconnect notification
struct Link {
    peer: PeerId,
    connected: AtomicBool,
    /// Set once the callbacks have run; guarded by the same lock as the list
    /// so a late registration cannot miss the notification
    callbacks: Mutex<(bool, Vec<DisconnectCallback>)>,
}

impl Link {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn register(&self, callback: DisconnectCallback) {
        let mut guard = self.callbacks.lock();
        if guard.0 {
            callback(self.peer);
        } else {
            guard.1.push(callback);
        }
    }

    fn terminate(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut guard = self.callbacks.lock();
        if guard.0 {
            return;
        }
        guard.0 = true;
        for callback in guard.1.drain(..) {
            callback(self.peer);
        }
    }
}

/// One framed connection to a peer
pub struct PacketTransport {
    link: Arc<Link>,
    remote_addr: Option<SocketAddr>,
    max_packet_size: usize,
    writer: Mutex<TcpStream>,
    /// Handle used to close the socket without waiting on a blocked writer
    closer: TcpStream,
    inbound: Arc<SharedQueue<WireMessage>>,
    counters: Arc<TransportCounters>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl PacketTransport {
    /// Connect to a listening peer
    pub fn connect(
        addr: SocketAddr,
        config: &NetworkConfig,
        on_disconnect: Option<DisconnectCallback>,
    ) -> Result<Self, NetworkError> {
        let stream =
            TcpStream::connect(addr).map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        tracing::info!(%addr, "connected");
        Self::from_stream(stream, config, on_disconnect)
    }

    /// Accept one peer from `listener`
    pub fn accept(
        listener: &TcpListener,
        config: &NetworkConfig,
        on_disconnect: Option<DisconnectCallback>,
    ) -> Result<Self, NetworkError> {
        let (stream, addr) = listener.accept().map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        tracing::info!(%addr, "accepted peer");
        Self::from_stream(stream, config, on_disconnect)
    }

    /// Wrap an already-connected socket and start its receive thread
    pub fn from_stream(
        stream: TcpStream,
        config: &NetworkConfig,
        on_disconnect: Option<DisconnectCallback>,
    ) -> Result<Self, NetworkError> {
        configure_socket(&stream, config)?;
        let read_half = stream.try_clone().map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        let closer = stream.try_clone().map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        let link = Arc::new(Link {
            peer: PeerId::new(),
            connected: AtomicBool::new(true),
            callbacks: Mutex::new((false, on_disconnect.into_iter().collect())),
        });
        let inbound = Arc::new(SharedQueue::unbounded());
        let counters = Arc::new(TransportCounters::default());

        let receiver = Receiver {
            stream: read_half,
            link: Arc::clone(&link),
            inbound: Arc::clone(&inbound),
            counters: Arc::clone(&counters),
            max_frame_size: config.max_frame_size,
        };
        let handle = thread::Builder::new()
            .name("transport-recv".into())
            .spawn(move || receiver.run())
            .map_err(|e| NetworkError::ConnectionFailed(format!("spawn receive thread: {}", e)))?;

        Ok(Self {
            remote_addr: stream.peer_addr().ok(),
            link,
            max_packet_size: config.max_packet_size,
            writer: Mutex::new(stream),
            closer,
            inbound,
            counters,
            reader: Mutex::new(Some(handle)),
        })
    }

    pub fn peer(&self) -> PeerId {
        self.link.peer
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Register another disconnect callback. Runs immediately if the
    /// connection has already terminated.
    pub fn on_disconnect(&self, callback: DisconnectCallback) {
        self.link.register(callback);
    }

    /// Send one logical message, split if it does not fit in one frame.
    /// Returns `false` if the connection is gone, the write failed, or `kind`
    /// is a custom tag that collides with a reserved one.
    pub fn send(&self, payload: &[u8], kind: MessageKind) -> bool {
        if !kind.is_sendable() {
            tracing::warn!(peer = %self.link.peer, tag = kind.tag(), "refusing to send reserved tag");
            return false;
        }
        let mut buffer = BytesMut::new();
        let frames = framing::encode_message(kind.tag(), payload, self.max_packet_size, &mut buffer);
        self.write_frames(&buffer, frames)
    }

    /// Send several messages as one atomic batch. Nothing is written if any
    /// message carries a reserved custom tag.
    pub fn send_batch(&self, messages: &[(MessageKind, Bytes)]) -> bool {
        if let Some((kind, _)) = messages.iter().find(|(kind, _)| !kind.is_sendable()) {
            tracing::warn!(peer = %self.link.peer, tag = kind.tag(), "refusing to send batch with reserved tag");
            return false;
        }
        let mut buffer = BytesMut::new();
        let frames = framing::encode_batch(
            messages.iter().map(|(kind, payload)| (kind.tag(), &payload[..])),
            self.max_packet_size,
            &mut buffer,
        );
        self.write_frames(&buffer, frames)
    }

    fn write_frames(&self, buffer: &[u8], frames: usize) -> bool {
        if !self.is_connected() {
            return false;
        }
        let result = {
            let mut writer = self.writer.lock();
            writer.write_all(buffer).and_then(|_| writer.flush())
        };
        match result {
            Ok(()) => {
                self.counters.frames_sent.fetch_add(frames as u64, Ordering::Relaxed);
                self.counters.bytes_sent.fetch_add(buffer.len() as u64, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(peer = %self.link.peer, "send failed: {}", e);
                self.close_socket();
                self.link.terminate();
                false
            }
        }
    }

    pub fn try_recv(&self) -> Option<WireMessage> {
        self.inbound.pop()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<WireMessage> {
        self.inbound.pop_timeout(timeout)
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    /// Close the connection and join the receive thread
    pub fn shutdown(&self) {
        self.link.connected.store(false, Ordering::SeqCst);
        self.close_socket();

        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("transport receive thread panicked");
            }
        }
        self.link.terminate();
    }

    fn close_socket(&self) {
        // already-closed sockets report NotConnected
        let _ = self.closer.shutdown(Shutdown::Both);
        self.inbound.wake_all();
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            inbound_queued: self.inbound.len(),
        }
    }
}

impl Drop for PacketTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn configure_socket(stream: &TcpStream, config: &NetworkConfig) -> Result<(), NetworkError> {
    let socket = SockRef::from(stream);
    socket
        .set_nodelay(config.nodelay)
        .map_err(|e| NetworkError::ConnectionFailed(format!("TCP_NODELAY: {}", e)))?;
    if config.keepalive_secs > 0 {
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(config.keepalive_secs));
        socket
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| NetworkError::ConnectionFailed(format!("keepalive: {}", e)))?;
    }
    Ok(())
}

/// Receive loop state, owned by the receive thread
struct Receiver {
    stream: TcpStream,
    link: Arc<Link>,
    inbound: Arc<SharedQueue<WireMessage>>,
    counters: Arc<TransportCounters>,
    max_frame_size: usize,
}

impl Receiver {
    fn run(mut self) {
        let peer = self.link.peer;
        let mut reassembler = Reassembler::new();
        tracing::debug!(%peer, "receive thread running");

        loop {
            let frame = match framing::read_frame(&mut self.stream, self.max_frame_size) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!(%peer, "peer closed the connection");
                    break;
                }
                Err(e) => {
                    if self.link.is_connected() {
                        tracing::warn!(%peer, "receive failed: {}", e);
                    }
                    break;
                }
            };
            self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_received
                .fetch_add((frame.payload.len() + crate::constants::FRAME_HEADER_LEN) as u64, Ordering::Relaxed);

            match reassembler.push(frame) {
                Ok(None) => {}
                Ok(Some(Assembled::Message { tag, payload })) => {
                    self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
                    self.inbound.force_push(WireMessage::new(MessageKind::from_tag(tag), payload, peer));
                }
                Ok(Some(Assembled::Batch(messages))) => {
                    self.counters.messages_received.fetch_add(messages.len() as u64, Ordering::Relaxed);
                    self.inbound.push_batch(
                        messages
                            .into_iter()
                            .map(|(tag, payload)| WireMessage::new(MessageKind::from_tag(tag), payload, peer)),
                    );
                }
                Err(e) => {
                    tracing::warn!(%peer, "dropping connection: {}", e);
                    break;
                }
            }
        }

        // already-closed sockets report NotConnected
        let _ = self.stream.shutdown(Shutdown::Both);
        self.link.terminate();
        self.inbound.wake_all();
        tracing::debug!(%peer, "receive thread exiting");
    }
}
