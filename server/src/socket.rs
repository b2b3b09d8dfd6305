//! Per-connection wrapper and the WebSocket pump behind it.
//!
//! The pump task owns the actual WebSocket. It decodes inbound frames onto the
//! registry queue and writes whatever the registry pushes through the
//! connection's [`Transport`]. The registry never touches the WebSocket
//! directly, so tests can drive it with [`Transport::channel`].

use crate::network::NetworkHandle;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, warn};
use shared::{
    read_packet, write_packet, CodecError, ConnectParams, ConnectionId, EntityId, Packet, UserId,
};
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What the registry asks a pump to do with its connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Arc<Vec<u8>>),
    Ping,
    Close(Option<u16>),
}

/// Entries of the registry's inbound queue, in arrival order.
#[derive(Debug)]
pub enum Inbound {
    Connect {
        transport: Transport,
        params: ConnectParams,
    },
    Packet {
        connection: ConnectionId,
        packet: Packet,
    },
    Closed {
        connection: ConnectionId,
        code: Option<u16>,
    },
}

/// Write half of one connection plus its liveness flag.
#[derive(Debug, Clone)]
pub struct Transport {
    pub id: ConnectionId,
    outbound: mpsc::UnboundedSender<Outbound>,
    alive: Arc<AtomicBool>,
}

impl Transport {
    pub fn channel(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let transport = Self {
            id,
            outbound,
            alive: Arc::new(AtomicBool::new(true)),
        };
        (transport, rx)
    }

    /// Queues an already encoded frame. Returns false once the pump is gone.
    pub fn send_raw(&self, frame: Arc<Vec<u8>>) -> bool {
        self.outbound.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn send(&self, packet: &Packet) -> Result<(), CodecError> {
        let frame = write_packet(packet)?;
        self.send_raw(Arc::new(frame));
        Ok(())
    }

    /// Clears the liveness flag and asks the peer for a pong.
    pub fn ping(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Ping);
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn close(&self, code: Option<u16>) {
        let _ = self.outbound.send(Outbound::Close(code));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Active,
    /// The transport reported a close that has not been processed yet.
    Closing,
    Closed,
}

/// A registered connection, keyed by its user id.
#[derive(Debug)]
pub struct Socket {
    pub id: UserId,
    pub player: EntityId,
    transport: Transport,
    closed: bool,
    disconnected: bool,
}

impl Socket {
    pub fn new(id: UserId, transport: Transport) -> Self {
        Self {
            player: EntityId::from(&id),
            id,
            transport,
            closed: false,
            disconnected: false,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.transport.id
    }

    pub fn send(&self, packet: &Packet) {
        if self.disconnected {
            return;
        }
        if let Err(e) = self.transport.send(packet) {
            error!("Failed to send {} to {}: {}", packet.name(), self.id, e);
        }
    }

    /// Sends a frame encoded once for a whole broadcast.
    pub fn send_raw(&self, frame: &Arc<Vec<u8>>) {
        if !self.disconnected {
            self.transport.send_raw(Arc::clone(frame));
        }
    }

    pub fn ping(&self) {
        self.transport.ping();
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Records that the peer's side of the connection is already gone.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn state(&self) -> SocketState {
        if self.disconnected {
            SocketState::Closed
        } else if self.closed {
            SocketState::Closing
        } else {
            SocketState::Active
        }
    }

    /// Closes the transport unless the peer already did. Returns false when
    /// the socket had been disconnected before, so teardown runs once.
    pub fn disconnect(&mut self, code: Option<u16>) -> bool {
        if self.disconnected {
            return false;
        }
        self.disconnected = true;
        if !self.closed {
            self.closed = true;
            self.transport.close(code);
        }
        true
    }
}

/// How long a peer gets to answer a close the registry sent.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs one accepted WebSocket until either side closes it.
pub async fn serve(ws: WebSocket, params: ConnectParams, network: NetworkHandle) {
    let (sink, stream) = ws.split();
    pump(sink, stream, params, network, CLOSE_TIMEOUT).await;
}

/// Registers the connection and shuttles frames both ways. Once the registry
/// closes the connection, the peer has `close_timeout` to answer before the
/// socket is dropped, so a half-open peer cannot keep it alive.
pub async fn pump<Si, St>(
    sink: Si,
    mut stream: St,
    params: ConnectParams,
    network: NetworkHandle,
    close_timeout: Duration,
) where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: fmt::Display + Send,
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (transport, outbound) = network.open();
    let connection = transport.id;
    let liveness = transport.clone();
    if !network.enqueue(Inbound::Connect { transport, params }) {
        warn!("Network loop is gone, dropping connection {}", connection);
        return;
    }
    debug!("Connection {} opened", connection);

    let mut writer = tokio::spawn(write_frames(sink, outbound, connection));
    let reader = read_frames(&mut stream, &network, &liveness, connection);
    tokio::pin!(reader);

    let code = tokio::select! {
        code = &mut reader => code,
        _ = &mut writer => match tokio::time::timeout(close_timeout, &mut reader).await {
            Ok(code) => code,
            Err(_) => {
                debug!("Connection {} never answered the close", connection);
                None
            }
        },
    };

    network.enqueue(Inbound::Closed { connection, code });
    writer.abort();
    debug!("Connection {} closed", connection);
}

/// Writes whatever the registry queues until it asks for a close.
async fn write_frames<Si>(
    mut sink: Si,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    connection: ConnectionId,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: fmt::Display,
{
    while let Some(message) = outbound.recv().await {
        let result = match message {
            Outbound::Frame(frame) => sink.send(Message::Binary(frame.as_ref().clone())).await,
            Outbound::Ping => sink.send(Message::Ping(Vec::new())).await,
            Outbound::Close(code) => {
                let frame = code.map(|code| CloseFrame {
                    code,
                    reason: Cow::Borrowed(""),
                });
                let _ = sink.send(Message::Close(frame)).await;
                break;
            }
        };
        if let Err(e) = result {
            debug!("Write to connection {} failed: {}", connection, e);
            break;
        }
    }
}

/// Decodes inbound frames onto the registry queue. Returns the peer's close
/// code, if it sent one.
async fn read_frames<St>(
    stream: &mut St,
    network: &NetworkHandle,
    liveness: &Transport,
    connection: ConnectionId,
) -> Option<u16>
where
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => match read_packet(&data) {
                Ok(packet) => {
                    network.enqueue(Inbound::Packet { connection, packet });
                }
                Err(e) => warn!("Dropping malformed frame from {}: {}", connection, e),
            },
            Ok(Message::Pong(_)) => liveness.mark_alive(),
            Ok(Message::Close(frame)) => return frame.map(|frame| frame.code),
            Ok(_) => {}
            Err(e) => {
                debug!("Read from connection {} failed: {}", connection, e);
                return None;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::network::ServerNetwork;
    use crate::storage::MemoryStorage;

    fn socket() -> (Socket, mpsc::UnboundedReceiver<Outbound>) {
        let (transport, rx) = Transport::channel(ConnectionId(1));
        (Socket::new(UserId::from("u1"), transport), rx)
    }

    #[test]
    fn test_player_entity_shares_user_id() {
        let (socket, _rx) = socket();
        assert_eq!(socket.player.as_str(), "u1");
        assert_eq!(socket.connection(), ConnectionId(1));
    }

    #[test]
    fn test_send_encodes_packet() {
        let (socket, mut rx) = socket();
        socket.send(&Packet::Pong(7));
        match rx.try_recv().unwrap() {
            Outbound::Frame(frame) => assert_eq!(read_packet(&frame).unwrap(), Packet::Pong(7)),
            other => panic!("Expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_ping_clears_liveness_until_pong() {
        let (socket, mut rx) = socket();
        assert!(socket.is_alive());
        socket.ping();
        assert!(!socket.is_alive());
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);

        socket.transport.mark_alive();
        assert!(socket.is_alive());
    }

    #[test]
    fn test_disconnect_runs_once() {
        let (mut socket, mut rx) = socket();
        assert_eq!(socket.state(), SocketState::Active);
        assert!(socket.disconnect(Some(4000)));
        assert!(!socket.disconnect(Some(4000)));
        assert_eq!(socket.state(), SocketState::Closed);

        assert_eq!(rx.try_recv().unwrap(), Outbound::Close(Some(4000)));
        assert!(rx.try_recv().is_err());

        socket.send(&Packet::Pong(1));
        assert!(rx.try_recv().is_err());
    }

    async fn pumped(
        network: &mut ServerNetwork,
        stream: impl Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
    ) -> (
        tokio::task::JoinHandle<()>,
        futures::channel::mpsc::UnboundedReceiver<Message>,
        UserId,
    ) {
        let (sink, mut sent) = futures::channel::mpsc::unbounded::<Message>();
        let task = tokio::spawn(pump(
            sink,
            stream,
            ConnectParams::default(),
            network.handle(),
            Duration::from_millis(50),
        ));
        loop {
            network.flush().await;
            if network.socket_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let user = match sent.next().await {
            Some(Message::Binary(frame)) => match read_packet(&frame).unwrap() {
                Packet::Snapshot(snapshot) => snapshot.id,
                other => panic!("Expected snapshot, got {:?}", other),
            },
            other => panic!("Expected snapshot frame, got {:?}", other),
        };
        (task, sent, user)
    }

    #[tokio::test]
    async fn test_unanswered_close_drops_the_socket() {
        let mut network = ServerNetwork::new(ServerConfig::default(), Arc::new(MemoryStorage::new()));
        let (task, mut sent, user) = pumped(&mut network, futures::stream::pending()).await;

        network.on_disconnect(&user, None);
        assert_eq!(network.socket_count(), 0);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("pump should end without the peer's close reply")
            .unwrap();
        assert_eq!(sent.next().await, Some(Message::Close(None)));
    }

    #[tokio::test]
    async fn test_peer_close_ends_the_pump() {
        let mut network = ServerNetwork::new(ServerConfig::default(), Arc::new(MemoryStorage::new()));
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Message, axum::Error>>();
        let (task, _sent, user) = pumped(&mut network, rx).await;

        tx.unbounded_send(Ok(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: Cow::Borrowed("bye"),
        }))))
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        network.flush().await;
        assert!(network.socket(&user).is_none());
    }

    #[test]
    fn test_peer_close_is_not_echoed() {
        let (mut socket, mut rx) = socket();
        socket.mark_closed();
        assert_eq!(socket.state(), SocketState::Closing);
        assert!(socket.disconnect(None));
        assert!(rx.try_recv().is_err());
    }
}
