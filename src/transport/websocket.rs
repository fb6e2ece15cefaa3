//! WebSocket transport over `tokio-tungstenite`.
//!
//! `connect` returns only after the handshake completes, so a caller that
//! awaits it can subscribe and fire mutations without guessing at delays.
//! A pump task then owns the socket:
//!
//! - outbound frames from the [`Connection`] are written as text messages;
//! - inbound text messages are forwarded in arrival order;
//! - a heartbeat `ping` frame keeps idle connections from being reaped
//!   (a zero period turns it off);
//! - cancelling the shutdown token flushes queued outbound frames, sends a
//!   close frame and ends the task.
//!
//! There is no reconnect: when the socket drops the token is cancelled and the
//! owner discards the connection.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bus::frame;
use crate::transport::{Connection, FRAME_BUFFER, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket client settings. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
    heartbeat: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration, heartbeat: Duration) -> Self {
        Self { connect_timeout, heartbeat }
    }

    pub(crate) async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            url: redact(url),
            reason,
        };

        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| connect_err(format!("no handshake within {:?}", self.connect_timeout)))?
            .map_err(|e| connect_err(e.to_string()))?;

        info!(url = %redact(url), "websocket connected");

        let (outbound, out_rx) = mpsc::channel(FRAME_BUFFER);
        let (in_tx, inbound) = mpsc::channel(FRAME_BUFFER);
        let shutdown = CancellationToken::new();

        tokio::spawn(pump(ws, out_rx, in_tx, shutdown.clone(), self.heartbeat));

        Ok(Connection { outbound, inbound, shutdown })
    }
}

async fn pump(
    ws: WsStream,
    mut out_rx: mpsc::Receiver<String>,
    in_tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
    heartbeat: Duration,
) {
    let (mut sink, mut stream) = ws.split();
    let mut ticker = (!heartbeat.is_zero()).then(|| {
        let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                while let Ok(text) = out_rx.try_recv() {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                debug!("websocket closed locally");
                break;
            }

            out = out_rx.recv() => {
                let Some(text) = out else { break };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "websocket send failed");
                    break;
                }
            }

            _ = next_beat(&mut ticker) => {
                trace!("websocket heartbeat");
                if let Err(e) = sink.send(Message::Text(frame::ping().into())).await {
                    warn!(error = %e, "websocket heartbeat failed");
                    break;
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(reason))) => {
                        debug!(?reason, "websocket closed by remote");
                        break;
                    }
                    // Pings are answered by tungstenite; binary frames are not part of the protocol.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read failed");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    shutdown.cancel();
}

/// Next heartbeat tick; never resolves when the heartbeat is off.
async fn next_beat(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Strip the query string (it carries the auth token) before logging a URL.
fn redact(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?…"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::accept_async;

    type ServerStream = WebSocketStream<TcpStream>;

    const LONG: Duration = Duration::from_secs(60);
    const WAIT: Duration = Duration::from_secs(5);

    /// Loopback server accepting one WebSocket client.
    async fn listen() -> (String, JoinHandle<ServerStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/api/ws/w1", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            accept_async(tcp).await.unwrap()
        });
        (url, server)
    }

    async fn open(heartbeat: Duration) -> (Connection, ServerStream) {
        let (url, server) = listen().await;
        let conn = WebSocketTransport::new(WAIT, heartbeat)
            .connect(&url)
            .await
            .unwrap();
        (conn, server.await.unwrap())
    }

    /// Next text frame the client wrote, skipping control messages.
    async fn next_text(server: &mut ServerStream) -> Option<String> {
        loop {
            match tokio::time::timeout(WAIT, server.next()).await.ok()?? {
                Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    #[tokio::test]
    async fn inbound_frames_arrive_in_order() {
        let (conn, mut server) = open(LONG).await;
        let (_outbound, mut inbound, _shutdown) = conn.into_parts();

        for text in ["one", "two", "three"] {
            server.send(Message::Text(text.to_string().into())).await.unwrap();
        }
        for expected in ["one", "two", "three"] {
            let got = tokio::time::timeout(WAIT, inbound.recv()).await.unwrap();
            assert_eq!(got.as_deref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn outbound_frames_are_written() {
        let (conn, mut server) = open(LONG).await;
        let (outbound, _inbound, _shutdown) = conn.into_parts();

        outbound.send(frame::subscribe("workspace:w1")).await.unwrap();
        let sent = next_text(&mut server).await.unwrap();
        assert_eq!(frame::subscribed_channel(&sent).as_deref(), Some("workspace:w1"));
    }

    #[tokio::test]
    async fn heartbeat_sends_ping_frames() {
        let (conn, mut server) = open(Duration::from_millis(50)).await;

        let sent = next_text(&mut server).await.unwrap();
        assert_eq!(frame::control(&sent), Some(frame::Control::Ping));
        let sent = next_text(&mut server).await.unwrap();
        assert_eq!(frame::control(&sent), Some(frame::Control::Ping));
        drop(conn);
    }

    #[tokio::test]
    async fn zero_heartbeat_turns_ping_off() {
        let (conn, mut server) = open(Duration::ZERO).await;
        let (outbound, mut inbound, shutdown) = conn.into_parts();

        outbound.send("hello".into()).await.unwrap();
        assert_eq!(next_text(&mut server).await.as_deref(), Some("hello"));
        server.send(Message::Text("back".to_string().into())).await.unwrap();
        assert_eq!(
            tokio::time::timeout(WAIT, inbound.recv()).await.unwrap().as_deref(),
            Some("back")
        );
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn local_close_flushes_then_sends_close_frame() {
        let (conn, mut server) = open(LONG).await;
        let (outbound, mut inbound, shutdown) = conn.into_parts();

        outbound.send(frame::unsubscribe("workspace:w1")).await.unwrap();
        shutdown.cancel();

        let mut texts = Vec::new();
        let mut saw_close = false;
        while let Ok(Some(msg)) = tokio::time::timeout(WAIT, server.next()).await {
            match msg {
                Ok(Message::Text(text)) => texts.push(text.as_str().to_owned()),
                Ok(Message::Close(_)) => {
                    saw_close = true;
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert!(saw_close);
        assert_eq!(texts.len(), 1);
        assert_eq!(frame::control(&texts[0]), Some(frame::Control::Unsubscribe("workspace:w1".into())));

        // The pump is gone: nothing more is delivered.
        let _ = server.send(Message::Text("late".to_string().into())).await;
        assert_eq!(tokio::time::timeout(WAIT, inbound.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn remote_close_cancels_token() {
        let (conn, mut server) = open(LONG).await;
        let (_outbound, _inbound, shutdown) = conn.into_parts();

        server.close(None).await.unwrap();
        tokio::time::timeout(WAIT, shutdown.cancelled()).await.unwrap();
    }

    #[test]
    fn redact_hides_token() {
        assert_eq!(
            redact("ws://localhost:8080/api/ws/w1?token=secret"),
            "ws://localhost:8080/api/ws/w1?…"
        );
        assert_eq!(redact("ws://localhost/api/ws/w1"), "ws://localhost/api/ws/w1");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let t = WebSocketTransport::new(Duration::from_secs(2), Duration::from_secs(50));
        let err = t
            .connect(&format!("ws://127.0.0.1:{port}/api/ws/w1?token=t"))
            .await
            .unwrap_err();
        match err {
            TransportError::Connect { url, .. } => assert!(!url.contains("token=t")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
