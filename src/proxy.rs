use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Envelope exchanged between the proxy and the OMS worker. Frames from a
/// strategy client are wrapped with the connection's identity; replies are
/// routed back by the same identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFrame {
    pub src: String,
    pub payload: serde_json::Value,
}

type ClientMap = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>;
type BackendSlot = Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>;

/// Connects many strategy-client sockets to the single OMS worker socket.
pub struct Proxy {
    frontend: TcpListener,
    backend: TcpListener,
}

impl Proxy {
    pub async fn bind(frontend_addr: &str, backend_addr: &str) -> anyhow::Result<Self> {
        let frontend = TcpListener::bind(frontend_addr).await?;
        let backend = TcpListener::bind(backend_addr).await?;
        Ok(Self { frontend, backend })
    }

    pub fn frontend_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.frontend.local_addr()?)
    }

    pub fn backend_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.backend.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));
        let backend_slot: BackendSlot = Arc::new(Mutex::new(None));

        info!(
            target: "proxy",
            frontend = %self.frontend.local_addr()?,
            backend = %self.backend.local_addr()?,
            "proxy listening"
        );

        let frontend_loop = accept_clients(self.frontend, clients.clone(), backend_slot.clone());
        let backend_loop = accept_workers(self.backend, clients, backend_slot);
        tokio::try_join!(frontend_loop, backend_loop)?;
        Ok(())
    }
}

async fn accept_clients(
    listener: TcpListener,
    clients: ClientMap,
    backend_slot: BackendSlot,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let clients = clients.clone();
        let backend_slot = backend_slot.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_client(stream, clients, backend_slot).await {
                debug!(target: "proxy", %peer, error = %err, "client connection ended");
            }
        });
    }
}

async fn serve_client(
    stream: TcpStream,
    clients: ClientMap,
    backend_slot: BackendSlot,
) -> anyhow::Result<()> {
    let ws = accept_async(stream).await?;
    let identity = Uuid::new_v4().to_string();
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    clients.lock().await.insert(identity.clone(), tx);
    debug!(target: "proxy", src = %identity, "client connected");

    let writer_identity = identity.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
        debug!(target: "proxy", src = %writer_identity, "client writer stopped");
    });

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let payload: serde_json::Value = match serde_json::from_str(&msg) {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "proxy", src = %identity, error = %err, "dropping non-JSON frame");
                continue;
            }
        };
        let frame = TransportFrame {
            src: identity.clone(),
            payload,
        };
        let raw = serde_json::to_string(&frame)?;
        match backend_slot.lock().await.as_ref() {
            Some(backend) => {
                let _ = backend.send(Message::Text(raw));
            }
            None => {
                warn!(target: "proxy", src = %identity, "no worker attached, dropping frame");
            }
        }
    }

    clients.lock().await.remove(&identity);
    writer.abort();
    debug!(target: "proxy", src = %identity, "client disconnected");
    Ok(())
}

async fn accept_workers(
    listener: TcpListener,
    clients: ClientMap,
    backend_slot: BackendSlot,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let clients = clients.clone();
        let backend_slot = backend_slot.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_worker(stream, clients, backend_slot).await {
                debug!(target: "proxy", %peer, error = %err, "worker connection ended");
            }
        });
    }
}

async fn serve_worker(
    stream: TcpStream,
    clients: ClientMap,
    backend_slot: BackendSlot,
) -> anyhow::Result<()> {
    let ws = accept_async(stream).await?;
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Latest worker wins; there is only ever one OMS process.
    *backend_slot.lock().await = Some(tx);
    info!(target: "proxy", "worker attached");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let frame: TransportFrame = match serde_json::from_str(&msg) {
            Ok(f) => f,
            Err(err) => {
                warn!(target: "proxy", error = %err, "dropping malformed worker frame");
                continue;
            }
        };
        match clients.lock().await.get(&frame.src) {
            Some(client) => {
                let _ = client.send(Message::Text(frame.payload.to_string()));
            }
            None => {
                debug!(target: "proxy", src = %frame.src, "client gone, dropping reply");
            }
        }
    }

    *backend_slot.lock().await = None;
    writer.abort();
    info!(target: "proxy", "worker detached");
    Ok(())
}
