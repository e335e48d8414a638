//! Socket side of a peer
//!
//! One task per connection: it dials the peer, frames traffic with
//! `MessageCodec` and forwards everything to the peer group as `PeerEvent`s.
//! Protocol decisions happen in the group; this loop only moves bytes.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::network::codec::MessageCodec;
use crate::network::peer::{PeerCommand, PeerError, PeerEvent, PeerId};

/// How long a TCP connect may take
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial a peer
pub async fn connect_to_peer(host: &str, port: u16) -> Result<TcpStream, PeerError> {
    let connect = TcpStream::connect((host, port));
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| PeerError::ConnectionFailed(format!("{}:{} timed out", host, port)))?
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Run a peer connection until either side closes it
///
/// Always finishes by reporting `PeerEvent::Disconnected` for `id`.
pub async fn run_connection(
    id: PeerId,
    host: String,
    port: u16,
    magic: [u8; 4],
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    events: mpsc::Sender<PeerEvent>,
) {
    let error = match connect_to_peer(&host, port).await {
        Ok(stream) => handle_connection(id, stream, magic, &mut commands, &events).await,
        Err(e) => Some(e),
    };

    match &error {
        Some(e) => log::debug!("Peer {} disconnected: {}", host, e),
        None => log::debug!("Peer {} closed the connection", host),
    }
    let _ = events.send(PeerEvent::Disconnected { id, error }).await;
}

/// Pump messages both ways; returns the reason the connection ended
async fn handle_connection(
    id: PeerId,
    stream: TcpStream,
    magic: [u8; 4],
    commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
    events: &mpsc::Sender<PeerEvent>,
) -> Option<PeerError> {
    let addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => return Some(PeerError::ConnectionFailed(e.to_string())),
    };

    let framed = Framed::new(stream, MessageCodec::new(magic));
    let (mut writer, mut reader) = framed.split();

    if events.send(PeerEvent::SocketConnected { id, addr }).await.is_err() {
        return Some(PeerError::Stopped);
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Send(message)) => {
                    if let Err(e) = writer.send(message).await {
                        return Some(PeerError::Message(e));
                    }
                }
                Some(PeerCommand::Disconnect(e)) => return Some(e),
                None => return Some(PeerError::Stopped),
            },
            message = reader.next() => match message {
                Some(Ok(message)) => {
                    log::trace!("Received {} from {}", message, addr);
                    if events.send(PeerEvent::Message { id, message }).await.is_err() {
                        return Some(PeerError::Stopped);
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", addr, e);
                    return Some(PeerError::Message(e));
                }
                None => return None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Message;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::{Decoder, Encoder};

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[tokio::test]
    async fn test_connection_relays_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        tokio::spawn(run_connection(7, "127.0.0.1".to_string(), port, MAGIC, command_rx, event_tx));

        let (mut socket, _) = listener.accept().await.unwrap();
        assert!(matches!(
            event_rx.recv().await,
            Some(PeerEvent::SocketConnected { id: 7, .. })
        ));

        // remote -> kit
        let mut codec = MessageCodec::new(MAGIC);
        let mut frame = BytesMut::new();
        codec.encode(Message::Ping(42), &mut frame).unwrap();
        socket.write_all(&frame).await.unwrap();
        assert!(matches!(
            event_rx.recv().await,
            Some(PeerEvent::Message { id: 7, message: Message::Ping(42) })
        ));

        // kit -> remote
        command_tx.send(PeerCommand::Send(Message::Pong(42))).unwrap();
        let mut received = BytesMut::new();
        let message = loop {
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
            if let Some(message) = codec.decode(&mut received).unwrap() {
                break message;
            }
        };
        assert!(matches!(message, Message::Pong(42)));

        drop(socket);
        assert!(matches!(
            event_rx.recv().await,
            Some(PeerEvent::Disconnected { id: 7, error: None })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        tokio::spawn(run_connection(1, "127.0.0.1".to_string(), port, MAGIC, command_rx, event_tx));

        let (_socket, _) = listener.accept().await.unwrap();
        assert!(matches!(event_rx.recv().await, Some(PeerEvent::SocketConnected { .. })));

        command_tx
            .send(PeerCommand::Disconnect(PeerError::Timeout("test".to_string())))
            .unwrap();
        match event_rx.recv().await {
            Some(PeerEvent::Disconnected { id: 1, error: Some(e) }) => assert!(e.is_timeout()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::channel(16);
        run_connection(3, "127.0.0.1".to_string(), port, MAGIC, command_rx, event_tx).await;

        assert!(matches!(
            event_rx.recv().await,
            Some(PeerEvent::Disconnected {
                id: 3,
                error: Some(PeerError::ConnectionFailed(_))
            })
        ));
    }
}
