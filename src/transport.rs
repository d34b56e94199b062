use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::debug;

use crate::protocol::Heartbeat;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl From<ConnectionState> for u8 {
    fn from(value: ConnectionState) -> Self {
        match value {
            ConnectionState::Connecting => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Reconnecting => 2,
            ConnectionState::Disconnected => 3,
        }
    }
}

/// Handle on a self-healing WebSocket link.
pub struct WsConnection {
    outbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: mpsc::UnboundedReceiver<Message>,
    state: Arc<AtomicU8>,
}

impl WsConnection {
    pub fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.outbound_tx.clone()
    }

    pub fn receiver(&mut self) -> &mut mpsc::UnboundedReceiver<Message> {
        &mut self.inbound_rx
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load(Ordering::SeqCst).into()
    }
}

async fn handle_connection(
    url: &str,
    outbound_rx: &mut mpsc::UnboundedReceiver<Message>,
    inbound_tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<AtomicU8>,
    connected_once: &mut bool,
) -> Result<(), TransportError> {
    let (ws_stream, _) = connect_async(url).await?;
    state.store(ConnectionState::Connected.into(), Ordering::SeqCst);
    *connected_once = true;
    debug!(target: "transport", url, "connected");

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            Some(msg) = outbound_rx.recv() => {
                if let Err(err) = write.send(msg).await {
                    state.store(ConnectionState::Reconnecting.into(), Ordering::SeqCst);
                    return Err(TransportError::WebSocket(err));
                }
            }
            maybe_msg = read.next() => {
                match maybe_msg {
                    Some(Ok(msg)) => {
                        if inbound_tx.send(msg).is_err() {
                            // receiver dropped; treat as graceful shutdown
                            state.store(ConnectionState::Disconnected.into(), Ordering::SeqCst);
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => {
                        state.store(ConnectionState::Reconnecting.into(), Ordering::SeqCst);
                        return Err(TransportError::WebSocket(err));
                    }
                    None => {
                        state.store(ConnectionState::Reconnecting.into(), Ordering::SeqCst);
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Connect to a WebSocket endpoint and keep the link alive.
///
/// This spawns a background task that maintains the connection and, when it
/// drops, reconnects with the shared doubling backoff (2 s first retry,
/// capped at 32 s, reset after a successful connect). The returned
/// [`WsConnection`] exposes a sender for outbound frames, a receiver for
/// inbound frames and a connection state indicator.
pub fn connect_with_retries(url: impl Into<String>) -> WsConnection {
    let url = url.into();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let state = Arc::new(AtomicU8::new(ConnectionState::Connecting.into()));

    let state_clone = Arc::clone(&state);
    tokio::spawn(async move {
        let mut retry = Heartbeat::RETRY_INTERVAL;
        loop {
            state_clone.store(ConnectionState::Connecting.into(), Ordering::SeqCst);

            let mut connected_once = false;
            let result = handle_connection(
                &url,
                &mut outbound_rx,
                &inbound_tx,
                &state_clone,
                &mut connected_once,
            )
            .await;
            if connected_once {
                retry = Heartbeat::RETRY_INTERVAL;
            }

            match result {
                Ok(()) => {
                    if state_clone.load(Ordering::SeqCst)
                        == u8::from(ConnectionState::Disconnected)
                    {
                        break;
                    }
                    // Server closed the stream; fall through to reconnect.
                }
                Err(_) => {}
            }

            tokio::time::sleep(Duration::from_secs(retry)).await;
            retry = (retry * 2).min(Heartbeat::MAX_RETRY_INTERVAL);
            state_clone.store(ConnectionState::Reconnecting.into(), Ordering::SeqCst);
        }
    });

    WsConnection {
        outbound_tx,
        inbound_rx,
        state,
    }
}
