use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use futures_oms::proxy::{Proxy, TransportFrame};

#[tokio::test]
async fn frames_are_routed_by_identity() {
    let proxy = Proxy::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let frontend = proxy.frontend_addr().unwrap();
    let backend = proxy.backend_addr().unwrap();
    tokio::spawn(proxy.run());

    let (mut worker, _) = connect_async(format!("ws://{backend}")).await.unwrap();
    // give the proxy a beat to register the worker before clients talk
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut alice, _) = connect_async(format!("ws://{frontend}")).await.unwrap();
    let (mut bob, _) = connect_async(format!("ws://{frontend}")).await.unwrap();

    alice
        .send(Message::Text(json!({"who": "alice"}).to_string()))
        .await
        .unwrap();
    bob.send(Message::Text(json!({"who": "bob"}).to_string()))
        .await
        .unwrap();

    // The worker sees both frames, each wrapped with its own identity.
    let mut identities: HashMap<String, String> = HashMap::new();
    for _ in 0..2 {
        let msg = tokio::time::timeout(Duration::from_secs(5), worker.next())
            .await
            .expect("worker should receive a frame")
            .unwrap()
            .unwrap();
        let frame: TransportFrame = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        let who = frame.payload["who"].as_str().unwrap().to_string();
        identities.insert(who, frame.src);
    }
    assert_eq!(identities.len(), 2);
    assert_ne!(identities["alice"], identities["bob"]);

    // A reply addressed to bob reaches bob only.
    let reply = TransportFrame {
        src: identities["bob"].clone(),
        payload: json!({"ok": true}),
    };
    worker
        .send(Message::Text(serde_json::to_string(&reply).unwrap()))
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), bob.next())
        .await
        .expect("bob should receive the reply")
        .unwrap()
        .unwrap();
    let payload: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(payload, json!({"ok": true}));

    assert!(
        tokio::time::timeout(Duration::from_millis(200), alice.next())
            .await
            .is_err(),
        "alice must not see bob's reply"
    );
}

#[tokio::test]
async fn client_frames_without_worker_are_dropped() {
    let proxy = Proxy::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let frontend = proxy.frontend_addr().unwrap();
    let backend = proxy.backend_addr().unwrap();
    tokio::spawn(proxy.run());

    let (mut client, _) = connect_async(format!("ws://{frontend}")).await.unwrap();
    client
        .send(Message::Text(json!({"n": 1}).to_string()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A worker that attaches later starts with a clean slate.
    let (mut worker, _) = connect_async(format!("ws://{backend}")).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), worker.next())
            .await
            .is_err(),
        "frames sent with no worker attached are not replayed"
    );
}
