use crate::error::NetworkError;
use crate::message::{deserialize_message, serialize_message, Message, MessageHeader};
use bitcoin::p2p::Magic;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Peers are identified by their socket address
pub type PeerId = SocketAddr;

/// Outbound half of a peer connection
#[derive(Debug, Clone)]
pub struct Requester {
    peer: PeerId,
    tx: mpsc::UnboundedSender<Message>,
}

impl Requester {
    pub fn new(peer: PeerId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { peer, tx }
    }

    pub fn send(&self, msg: Message) {
        let command = msg.command();
        if self.tx.send(msg).is_err() {
            debug!("Dropping {} for {}: connection closed", command, self.peer);
        }
    }
}

/// Events produced by a connection's socket task
#[derive(Debug)]
pub enum ConnectionEvent {
    Established(PeerId),
    /// `message` is `None` for commands the engine ignores
    Received {
        peer: PeerId,
        message: Option<Message>,
    },
    Closed {
        peer: PeerId,
        error: Option<NetworkError>,
    },
}

/// Owns the socket task; dropping it closes the connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Dial `peer` and pump messages until either side closes.
pub fn spawn_connection(
    peer: PeerId,
    magic: Magic,
    connect_timeout: Duration,
    outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> ConnectionHandle {
    let task = tokio::spawn(async move {
        let error = run_connection(peer, magic, connect_timeout, outbound, &events)
            .await
            .err();
        let _ = events.send(ConnectionEvent::Closed { peer, error });
    });
    ConnectionHandle { task }
}

/// Opens transport connections for the peer group
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        peer: PeerId,
        outbound: mpsc::UnboundedReceiver<Message>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> ConnectionHandle;
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    magic: Magic,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(magic: Magic, connect_timeout: Duration) -> Self {
        Self {
            magic,
            connect_timeout,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        peer: PeerId,
        outbound: mpsc::UnboundedReceiver<Message>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> ConnectionHandle {
        spawn_connection(peer, self.magic, self.connect_timeout, outbound, events)
    }
}

async fn run_connection(
    peer: PeerId,
    magic: Magic,
    connect_timeout: Duration,
    outbound: mpsc::UnboundedReceiver<Message>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<(), NetworkError> {
    debug!("Connecting to {}", peer);
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(peer)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(NetworkError::Connect(e.to_string())),
        Err(_) => return Err(NetworkError::Connect("timed out".to_string())),
    };
    stream
        .set_nodelay(true)
        .map_err(|e| NetworkError::Io(e.to_string()))?;

    info!("Connected to {}", peer);
    if events.send(ConnectionEvent::Established(peer)).is_err() {
        return Ok(());
    }

    let (reader, writer) = stream.into_split();
    tokio::select! {
        result = read_loop(reader, peer, magic, events) => result,
        result = write_loop(writer, magic, outbound) => result,
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    peer: PeerId,
    magic: Magic,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<(), NetworkError> {
    let mut header_bytes = [0u8; MessageHeader::SIZE];
    loop {
        if let Err(e) = reader.read_exact(&mut header_bytes).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                info!("Connection closed by {}", peer);
                return Ok(());
            }
            return Err(NetworkError::Io(e.to_string()));
        }

        let header = MessageHeader::from_bytes(&header_bytes)
            .and_then(|h| h.validate(magic).map(|_| h))
            .map_err(|e| NetworkError::Decode(e.to_string()))?;

        let mut frame = Vec::with_capacity(MessageHeader::SIZE + header.length as usize);
        frame.extend_from_slice(&header_bytes);
        frame.resize(MessageHeader::SIZE + header.length as usize, 0);
        reader
            .read_exact(&mut frame[MessageHeader::SIZE..])
            .await
            .map_err(|e| NetworkError::Io(e.to_string()))?;

        let (message, _) =
            deserialize_message(&frame).map_err(|e| NetworkError::Decode(format!("{:#}", e)))?;
        if message.is_none() {
            debug!("Ignoring {} from {}", header.command_string(), peer);
        }

        if events
            .send(ConnectionEvent::Received { peer, message })
            .is_err()
        {
            return Ok(());
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    magic: Magic,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) -> Result<(), NetworkError> {
    while let Some(msg) = outbound.recv().await {
        let bytes = serialize_message(&msg, magic);
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| NetworkError::Io(e.to_string()))?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connection_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let magic = Network::Regtest.magic();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let _handle = spawn_connection(addr, magic, Duration::from_secs(5), out_rx, event_tx);

        let (mut socket, _) = listener.accept().await.unwrap();
        assert!(matches!(
            event_rx.recv().await,
            Some(ConnectionEvent::Established(peer)) if peer == addr
        ));

        out_tx.send(Message::Ping(7)).unwrap();
        let expected = serialize_message(&Message::Ping(7), magic);
        let mut buf = vec![0u8; expected.len()];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);

        socket
            .write_all(&serialize_message(&Message::Pong(7), magic))
            .await
            .unwrap();
        match event_rx.recv().await {
            Some(ConnectionEvent::Received {
                message: Some(Message::Pong(7)),
                ..
            }) => {}
            other => panic!("unexpected event {:?}", other),
        }

        drop(socket);
        assert!(matches!(
            event_rx.recv().await,
            Some(ConnectionEvent::Closed { error: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_magic_closes_with_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let _handle = spawn_connection(
            addr,
            Network::Regtest.magic(),
            Duration::from_secs(5),
            out_rx,
            event_tx,
        );

        let (mut socket, _) = listener.accept().await.unwrap();
        socket
            .write_all(&serialize_message(&Message::Verack, Network::Bitcoin.magic()))
            .await
            .unwrap();

        assert!(matches!(event_rx.recv().await, Some(ConnectionEvent::Established(_))));
        assert!(matches!(
            event_rx.recv().await,
            Some(ConnectionEvent::Closed {
                error: Some(NetworkError::Decode(_)),
                ..
            })
        ));
    }
}
