//! Byte transports attached to a stream session.
//!
//! The registry pumps between two [`StreamTransport`]s and never knows what
//! sits behind them. [`ChannelTransport`] is the one concrete type: a pair of
//! mpsc channels. [`websocket_transport`] bridges an axum WebSocket onto it
//! with background reader/writer tasks, and the writer also sends keep-alive
//! pings.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::StreamError;

/// One side of a stream.
#[async_trait]
pub trait StreamTransport: Send {
    /// Next chunk from the peer; `None` once the peer is gone.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    /// Deliver a chunk to the peer.
    async fn send(&mut self, data: Vec<u8>) -> Result<(), StreamError>;

    /// Stop sending. Idempotent.
    async fn close(&mut self);
}

/// Transport over a pair of mpsc channels.
pub struct ChannelTransport {
    rx: mpsc::Receiver<Vec<u8>>,
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl ChannelTransport {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { rx, tx: Some(tx) }
    }

    /// Two transports wired to each other.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (Self::new(a_rx, b_tx), Self::new(b_rx, a_tx))
    }
}

#[async_trait]
impl StreamTransport for ChannelTransport {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    async fn send(&mut self, data: Vec<u8>) -> Result<(), StreamError> {
        let tx = self.tx.as_ref().ok_or(StreamError::TransportClosed)?;
        tx.send(data).await.map_err(|_| StreamError::TransportClosed)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

/// Bridge a WebSocket into a [`ChannelTransport`].
///
/// Text and binary frames both arrive as bytes; outbound data is sent as
/// binary frames. With `ping_interval` set the writer pings on that period,
/// and a failed ping write closes the transport.
pub fn websocket_transport(socket: WebSocket, ping_interval: Option<Duration>) -> ChannelTransport {
    let (mut sink, mut stream) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(64);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
    let done = CancellationToken::new();

    let reader_done = done.clone();
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                () = reader_done.cancelled() => break,
                msg = stream.next() => msg,
            };
            let data = match msg {
                Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => continue,
            };
            if in_tx.send(data).await.is_err() {
                break;
            }
        }
        reader_done.cancel();
    });

    let writer_done = done;
    tokio::spawn(async move {
        let mut ping = ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        loop {
            tokio::select! {
                () = writer_done.cancelled() => break,
                out = out_rx.recv() => match out {
                    Some(data) => {
                        if sink.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                () = tick(&mut ping) => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        debug!("Stream ping failed, closing side");
                        break;
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        writer_done.cancel();
    });

    ChannelTransport::new(in_rx, out_tx)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_both_ways() {
        let (mut a, mut b) = ChannelTransport::pair(4);
        a.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"ping");
        b.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn close_ends_peer_and_rejects_sends() {
        let (mut a, mut b) = ChannelTransport::pair(4);
        a.close().await;
        a.close().await;
        assert!(b.recv().await.is_none());
        assert!(matches!(
            a.send(b"x".to_vec()).await,
            Err(StreamError::TransportClosed)
        ));
    }

    /// Serve one WebSocket on loopback and hand its transport back.
    async fn serve_one(ping: Duration) -> (String, mpsc::Receiver<ChannelTransport>) {
        use axum::extract::ws::WebSocketUpgrade;
        use axum::{routing::get, Router};

        let (tx, rx) = mpsc::channel(1);
        let app = Router::new().route(
            "/ws",
            get(move |ws: WebSocketUpgrade| {
                let tx = tx.clone();
                async move {
                    ws.on_upgrade(move |socket| async move {
                        let _ = tx.send(websocket_transport(socket, Some(ping))).await;
                    })
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("ws://{addr}/ws"), rx)
    }

    #[tokio::test]
    async fn websocket_side_pings_and_ends_when_client_leaves() {
        use tokio_tungstenite::tungstenite::Message as ClientMessage;

        let (url, mut accepted) = serve_one(Duration::from_millis(50)).await;
        let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let mut transport = accepted.recv().await.unwrap();

        client.send(ClientMessage::Binary(b"ls".to_vec().into())).await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), b"ls");

        let saw_ping = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(Ok(msg)) = client.next().await {
                if matches!(msg, ClientMessage::Ping(_)) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(saw_ping);

        drop(client);
        let end = tokio::time::timeout(Duration::from_secs(2), transport.recv())
            .await
            .unwrap();
        assert!(end.is_none());

        // the writer stops too once a write to the gone client fails
        let send_failed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if transport.send(b"x".to_vec()).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(send_failed.is_ok());
    }
}
