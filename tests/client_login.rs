use std::collections::BTreeMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

use futures_oms::client::OmsClient;
use futures_oms::domain::{Action, Comment, OrderType};
use futures_oms::protocol::{self, OmsMessage};
use futures_oms::proxy::{Proxy, TransportFrame};

type Worker = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_frame(worker: &mut Worker) -> TransportFrame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), worker.next())
            .await
            .expect("worker should receive a frame")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn reply(worker: &mut Worker, src: &str, msg: &OmsMessage) {
    let frame = TransportFrame {
        src: src.to_string(),
        payload: protocol::encode_value(msg).unwrap(),
    };
    worker
        .send(Message::Text(serde_json::to_string(&frame).unwrap()))
        .await
        .unwrap();
}

#[tokio::test]
async fn login_handshake_assigns_request_ids() {
    let proxy = Proxy::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let frontend = proxy.frontend_addr().unwrap();
    let backend = proxy.backend_addr().unwrap();
    tokio::spawn(proxy.run());

    let (mut worker, _) = connect_async(format!("ws://{backend}")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let strategies: BTreeMap<String, String> = [("S1".to_string(), "main".to_string())].into();
    let client = OmsClient::connect(format!("ws://{frontend}"), "S1", "ACC", strategies);

    // The client leads with INIT.
    let frame = next_frame(&mut worker).await;
    let src = frame.src.clone();
    match protocol::decode_value(frame.payload).unwrap() {
        OmsMessage::Init {
            session_id,
            account_id,
            strategies,
        } => {
            assert_eq!(session_id, "S1");
            assert_eq!(account_id, "ACC");
            assert_eq!(strategies.get("S1").map(String::as_str), Some("main"));
        }
        other => panic!("expected init, got {other:?}"),
    }

    // Login reply carries the persisted next request id.
    reply(&mut worker, &src, &OmsMessage::NextRequestId { next_request_id: 7 }).await;
    tokio::time::timeout(Duration::from_secs(5), client.wait_till_ready())
        .await
        .expect("client should log in");
    assert!(client.is_connected());

    // Orders consume the sequence from there.
    let comment: Comment = serde_json::from_value(json!({"stop_loss_offset": -10})).unwrap();
    let request_id = client
        .place_order(
            "CME",
            "NQ",
            OrderType::Mkt,
            true,
            1,
            0.0,
            "main",
            Action::Entry,
            "S1",
            None,
            comment,
        )
        .expect("logged-in client can place orders");
    assert_eq!(request_id, 7);

    let frame = next_frame(&mut worker).await;
    match protocol::decode_value(frame.payload).unwrap() {
        OmsMessage::NewOrder {
            request_id,
            symbol,
            order_type,
            is_buy,
            quantity,
            action,
            ..
        } => {
            assert_eq!(request_id, 7);
            assert_eq!(symbol, "NQ");
            assert_eq!(order_type, OrderType::Mkt);
            assert!(is_buy);
            assert_eq!(quantity, 1);
            assert_eq!(action, Action::Entry);
        }
        other => panic!("expected new_order, got {other:?}"),
    }

    assert_eq!(client.request_position(), Some(8));
    let frame = next_frame(&mut worker).await;
    match protocol::decode_value(frame.payload).unwrap() {
        OmsMessage::Position { request_id, .. } => assert_eq!(request_id, Some(8)),
        other => panic!("expected position request, got {other:?}"),
    }
}

#[tokio::test]
async fn orders_before_login_are_refused_locally() {
    let proxy = Proxy::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let frontend = proxy.frontend_addr().unwrap();
    tokio::spawn(proxy.run());

    let strategies: BTreeMap<String, String> = [("S1".to_string(), "main".to_string())].into();
    let client = OmsClient::connect(format!("ws://{frontend}"), "S1", "ACC", strategies);

    // No next_request_id was assigned yet, so there is nothing to spend.
    assert!(client
        .place_order(
            "CME",
            "NQ",
            OrderType::Mkt,
            true,
            1,
            0.0,
            "main",
            Action::Entry,
            "S1",
            None,
            Comment::new(),
        )
        .is_none());
    assert!(client.request_position().is_none());
}
