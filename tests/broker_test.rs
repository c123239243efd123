//! Integration tests for the broker: real UDP in, real WebSocket out.

use bpm_broker::server::{run, BrokerHandle, ServerError};
use bpm_broker::{Config, ListenerConfig, SourceId};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> Config {
    let mut config = Config::default();
    config.ingest = ListenerConfig::new("127.0.0.1", 0);
    config.subscriber = ListenerConfig::new("127.0.0.1", 0);
    config
}

async fn start() -> BrokerHandle {
    run(test_config()).await.expect("Failed to start broker")
}

async fn connect(broker: &BrokerHandle) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/", broker.subscriber_addr))
        .await
        .expect("Failed to connect");
    ws
}

/// Next text frame as JSON.
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("Message is JSON");
        }
    }
}

async fn command(ws: &mut Ws, body: Value) -> Value {
    ws.send(Message::Text(body.to_string()))
        .await
        .expect("Failed to send command");
    next_json(ws).await
}

async fn send_datagram(broker: &BrokerHandle, payload: Value) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(payload.to_string().as_bytes(), broker.ingest_addr)
        .await
        .expect("Failed to send datagram");
}

async fn wait_for_latest(broker: &BrokerHandle, source: i64) {
    for _ in 0..100 {
        if broker.state().registry.latest(SourceId(source)).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Source {source} never recorded a reading");
}

#[tokio::test]
async fn test_health_endpoint() {
    let broker = start().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/health", broker.subscriber_addr))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());

    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert!(body["version"].as_str().is_some());
    assert_eq!(body["sources"], 0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_cors_headers() {
    let broker = start().await;

    let client = reqwest::Client::new();
    let response = client
        .request(
            reqwest::Method::OPTIONS,
            format!("http://{}/health", broker.subscriber_addr),
        )
        .header("Origin", "http://localhost")
        .header("Access-Control-Request-Method", "GET")
        .send()
        .await
        .expect("Failed to send request");

    assert!(
        response.status().is_success(),
        "CORS preflight failed: {}",
        response.status()
    );

    broker.shutdown().await;
}

#[tokio::test]
async fn test_connect_sends_status() {
    let broker = start().await;
    let mut ws = connect(&broker).await;

    let status = next_json(&mut ws).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["message"], "Connected to BPM Broker");
    assert_eq!(status["active_devices"], json!([]));
    assert!(status["timestamp"].as_f64().is_some());

    broker.shutdown().await;
}

#[tokio::test]
async fn test_connect_replays_latest_before_status() {
    let broker = start().await;
    send_datagram(&broker, json!({"user": 1, "bpm": 72, "device_id": "ESP32_01"})).await;
    wait_for_latest(&broker, 1).await;

    let mut ws = connect(&broker).await;

    let replay = next_json(&mut ws).await;
    assert_eq!(replay["user"], 1);
    assert_eq!(replay["bpm"], 72.0);
    assert_eq!(replay["device_id"], "ESP32_01");
    assert_eq!(replay["source_ip"], "127.0.0.1");

    let status = next_json(&mut ws).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["active_devices"], json!([1]));

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replay_covers_more_sources_than_queue_capacity() {
    let mut config = test_config();
    config.subscriber_queue_capacity = 8;
    let broker = run(config).await.expect("Failed to start broker");

    let sender = "127.0.0.1:5000".parse().unwrap();
    for source in 0..40 {
        let payload = json!({"user": source, "bpm": 60 + source});
        broker
            .state()
            .pipeline
            .handle(payload.to_string().as_bytes(), sender)
            .expect("valid datagram");
    }

    let mut ws = connect(&broker).await;
    let mut replayed = Vec::new();
    let status = loop {
        let message = next_json(&mut ws).await;
        if message["type"] == "status" {
            break message;
        }
        replayed.push(message["user"].as_i64().expect("reading has a user"));
    };

    assert_eq!(replayed, (0..40).collect::<Vec<i64>>());
    assert_eq!(status["active_devices"].as_array().unwrap().len(), 40);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_reading_broadcast_to_every_subscriber() {
    let broker = start().await;
    let mut first = connect(&broker).await;
    let mut second = connect(&broker).await;
    next_json(&mut first).await;
    next_json(&mut second).await;

    send_datagram(&broker, json!({"user": 7, "bpm": 65})).await;

    for ws in [&mut first, &mut second] {
        let reading = next_json(ws).await;
        assert_eq!(reading["user"], 7);
        assert_eq!(reading["bpm"], 65.0);
        assert_eq!(reading["bpm_smoothed"], true);
        assert_eq!(reading["no_heart_rate"], false);
    }

    broker.shutdown().await;
}

#[tokio::test]
async fn test_disconnected_subscriber_does_not_block_others() {
    let broker = start().await;
    let mut stays = connect(&broker).await;
    let mut leaves = connect(&broker).await;
    next_json(&mut stays).await;
    next_json(&mut leaves).await;

    leaves.close(None).await.expect("Failed to close");
    drop(leaves);

    for _ in 0..100 {
        if broker.state().broadcaster.subscriber_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(broker.state().broadcaster.subscriber_count(), 1);

    send_datagram(&broker, json!({"user": 3, "bpm": 90})).await;
    let reading = next_json(&mut stays).await;
    assert_eq!(reading["user"], 3);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_finger_loss_sequence_in_order() {
    let broker = start().await;
    let mut ws = connect(&broker).await;
    next_json(&mut ws).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..4 {
        let payload = json!({"user": 2, "bpm": 80, "finger_detected": false});
        socket
            .send_to(payload.to_string().as_bytes(), broker.ingest_addr)
            .await
            .unwrap();
    }

    let readings = [
        next_json(&mut ws).await,
        next_json(&mut ws).await,
        next_json(&mut ws).await,
        next_json(&mut ws).await,
    ];

    for reading in &readings[..2] {
        assert_eq!(reading["bpm"], 80.0);
        assert_eq!(reading["finger_detected"], false);
        assert_eq!(reading["no_heart_rate"], false);
    }
    for reading in &readings[2..] {
        assert_eq!(reading["bpm"], "--");
        assert_eq!(reading["no_heart_rate"], true);
        assert_eq!(reading["bpm_smoothed"], false);
        assert_eq!(reading["bpm_raw"], 80.0);
    }

    broker.shutdown().await;
}

#[tokio::test]
async fn test_zero_bpm_reports_no_heart_rate() {
    let broker = start().await;
    let mut ws = connect(&broker).await;
    next_json(&mut ws).await;

    send_datagram(&broker, json!({"user": 4, "bpm": 0})).await;
    let reading = next_json(&mut ws).await;
    assert_eq!(reading["bpm"], "--");
    assert_eq!(reading["no_heart_rate"], true);
    assert_eq!(reading["finger_detected"], true);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_malformed_datagram_is_dropped() {
    let broker = start().await;
    let mut ws = connect(&broker).await;
    next_json(&mut ws).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"not json", broker.ingest_addr).await.unwrap();
    socket
        .send_to(json!({"bpm": 70}).to_string().as_bytes(), broker.ingest_addr)
        .await
        .unwrap();
    socket
        .send_to(json!({"user": 9, "bpm": 70}).to_string().as_bytes(), broker.ingest_addr)
        .await
        .unwrap();

    // Only the valid datagram reaches subscribers
    let reading = next_json(&mut ws).await;
    assert_eq!(reading["user"], 9);

    let counters = broker.state().counters.snapshot();
    assert_eq!(counters.datagrams_received, 3);
    assert_eq!(counters.datagrams_rejected, 2);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_commands() {
    let broker = start().await;
    send_datagram(&broker, json!({"user": 5, "bpm": 70})).await;
    wait_for_latest(&broker, 5).await;

    let mut ws = connect(&broker).await;
    next_json(&mut ws).await; // replay
    next_json(&mut ws).await; // status

    let status = command(&mut ws, json!({"type": "get_status"})).await;
    assert_eq!(status["type"], "status_response");
    assert_eq!(status["active_devices"], json!([5]));
    assert_eq!(status["connected_clients"], 1);
    assert_eq!(status["latest_data"]["5"]["bpm"], 70.0);
    assert_eq!(status["smoothing_enabled"], true);

    let latest = command(&mut ws, json!({"type": "get_latest", "source_id": 5})).await;
    assert_eq!(latest["user"], 5);
    assert_eq!(latest["bpm"], 70.0);

    let missing = command(&mut ws, json!({"type": "get_latest", "source_id": 99})).await;
    assert_eq!(missing["type"], "error");
    assert_eq!(missing["error"], "Source not found");

    let history = command(&mut ws, json!({"type": "get_signal_history", "user_id": 5})).await;
    assert_eq!(history["type"], "signal_history_response");
    assert_eq!(history["history"], json!([70.0]));
    assert_eq!(history["statistics"]["mean"], 70.0);

    let stats = command(&mut ws, json!({"type": "get_all_statistics"})).await;
    assert_eq!(stats["type"], "all_statistics_response");
    assert_eq!(stats["user_statistics"]["5"]["last"], 70.0);

    broker.shutdown().await;
}

#[tokio::test]
async fn test_invalid_command_keeps_connection_open() {
    let broker = start().await;
    let mut ws = connect(&broker).await;
    next_json(&mut ws).await;

    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");

    let unknown = command(&mut ws, json!({"type": "reboot"})).await;
    assert_eq!(unknown["type"], "error");
    assert!(unknown["error"].as_str().unwrap().contains("reboot"));

    // Whitespace frames are ignored
    ws.send(Message::Text("   ".to_string())).await.unwrap();

    let status = command(&mut ws, json!({"type": "get_status"})).await;
    assert_eq!(status["type"], "status_response");

    broker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_subscribers() {
    let broker = start().await;
    let mut ws = connect(&broker).await;
    next_json(&mut ws).await;

    broker.shutdown().await;

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "Subscriber was not closed on shutdown");
}

#[tokio::test]
async fn test_port_in_use_is_fatal() {
    let broker = start().await;

    let mut config = test_config();
    config.subscriber.port = broker.subscriber_addr.port();
    let result = run(config).await;
    assert!(matches!(result, Err(ServerError::Bind { .. })));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = test_config();
    config.smoothing.alpha = 0.0;
    assert!(matches!(run(config).await, Err(ServerError::Config(_))));
}
