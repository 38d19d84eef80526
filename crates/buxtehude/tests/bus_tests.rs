//! End-to-end bus tests
//!
//! Full client/server scenarios across all three transports.

use std::path::PathBuf;
use std::time::Duration;

use buxtehude::{
    Client, ClientPreferences, Message, MessageFormat, Server, MSG_DISCONNECT, MSG_YOU,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn unix_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("bux-test-{tag}-{}.sock", std::process::id()))
}

fn client(teamname: &str, format: MessageFormat) -> Client {
    Client::new(ClientPreferences {
        teamname: teamname.to_string(),
        format,
    })
}

async fn recv_one<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

async fn assert_silent<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(value)) = timeout(Duration::from_millis(300), rx.recv()).await {
        panic!("unexpected delivery: {value:?}");
    }
}

/// One message crosses all three transports: a TCP client pings an internal
/// client, which relays to a UNIX client, whose pong travels back the same
/// way.
#[tokio::test]
async fn test_three_transport_ping_pong() {
    buxtehude::init();

    let server = Server::new();
    let path = unix_path("pingpong");
    let _ = std::fs::remove_file(&path);
    server.unix_listen(&path).unwrap();
    let addr = server.ip_listen(0).await.unwrap();
    server.internal_enable();

    let (ping_src_tx, mut ping_src_rx) = mpsc::unbounded_channel::<String>();
    let (pong_src_tx, mut pong_src_rx) = mpsc::unbounded_channel::<String>();

    let client_internal = client("internal-client", MessageFormat::Msgpack);
    client_internal.add_handler("ping", move |c, m| {
        let _ = ping_src_tx.send(m.src.clone());
        let target = m.content["target"].as_str().unwrap_or_default();
        let _ = c.write(&Message {
            msg_type: "ping".to_string(),
            dest: target.to_string(),
            ..Default::default()
        });
    });
    client_internal.add_handler("pong", move |c, m| {
        let target = m.content["target"].as_str().unwrap_or_default();
        let _ = c.write(&Message {
            msg_type: "pong".to_string(),
            dest: target.to_string(),
            ..Default::default()
        });
    });
    client_internal.internal_connect(&server).unwrap();

    let client_unix = client("unix-client", MessageFormat::Json);
    client_unix.add_handler("ping", move |c, _| {
        let _ = c.write(&Message {
            msg_type: "pong".to_string(),
            dest: "internal-client".to_string(),
            content: json!({ "target": "ip-client" }),
            ..Default::default()
        });
    });
    client_unix
        .unix_connect(path.to_str().unwrap())
        .await
        .unwrap();

    let client_ip = client("ip-client", MessageFormat::Msgpack);
    client_ip.add_handler("pong", move |_, m| {
        let _ = pong_src_tx.send(m.src.clone());
    });
    client_ip.ip_connect("127.0.0.1", addr.port()).await.unwrap();

    sleep(Duration::from_millis(150)).await;

    client_ip
        .write(&Message {
            msg_type: "ping".to_string(),
            dest: "internal-client".to_string(),
            content: json!({ "target": "unix-client" }),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(recv_one(&mut ping_src_rx).await, "ip-client");
    assert_eq!(recv_one(&mut pong_src_rx).await, "internal-client");

    server.close().await;
    let _ = std::fs::remove_file(&path);
}

/// A JSON peer and a MessagePack peer exchange a structurally rich value and
/// both see the same content.
#[tokio::test]
async fn test_mixed_encoding_exchange() {
    let server = Server::new();
    let addr = server.ip_listen(0).await.unwrap();

    let content = json!({
        "title": "Toccata in F, BuxWV 157",
        "place": "Lübeck — Marienkirche 🎶",
        "offset": -42,
        "scale": 0.125,
        "rows": [[1, 2, 3], ["四", "五"]],
        "meta": { "verified": true, "none": null }
    });

    let (to_beta_tx, mut to_beta_rx) = mpsc::unbounded_channel::<serde_json::Value>();
    let (to_alpha_tx, mut to_alpha_rx) = mpsc::unbounded_channel::<serde_json::Value>();

    let beta = client("beta", MessageFormat::Msgpack);
    beta.add_handler("data", move |c, m| {
        let _ = to_beta_tx.send(m.content.clone());
        let _ = c.write(&Message {
            msg_type: "data-back".to_string(),
            dest: m.src.clone(),
            content: m.content.clone(),
            ..Default::default()
        });
    });
    beta.ip_connect("127.0.0.1", addr.port()).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let alpha = client("alpha", MessageFormat::Json);
    alpha.add_handler("data-back", move |_, m| {
        let _ = to_alpha_tx.send(m.content.clone());
    });
    alpha.ip_connect("127.0.0.1", addr.port()).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    alpha
        .write(&Message {
            msg_type: "data".to_string(),
            dest: "beta".to_string(),
            content: content.clone(),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(recv_one(&mut to_beta_rx).await, content);
    assert_eq!(recv_one(&mut to_alpha_rx).await, content);

    server.close().await;
}

/// When a peer hangs up, every remaining peer hears about it exactly once.
#[tokio::test]
async fn test_disconnect_broadcast() {
    let server = Server::new();
    let addr = server.ip_listen(0).await.unwrap();

    let mut watchers = Vec::new();
    let mut clients = Vec::new();
    for team in ["a", "b", "c"] {
        let cl = client(team, MessageFormat::Json);
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        cl.add_handler(MSG_DISCONNECT, move |_, m| {
            let _ = tx.send(m.content["who"].as_str().unwrap_or_default().to_string());
        });
        cl.ip_connect("127.0.0.1", addr.port()).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        watchers.push(rx);
        clients.push(cl);
    }

    clients[1].disconnect();

    let mut rx_c = watchers.pop().unwrap();
    let mut rx_b = watchers.pop().unwrap();
    let mut rx_a = watchers.pop().unwrap();

    assert_eq!(recv_one(&mut rx_a).await, "b");
    assert_eq!(recv_one(&mut rx_c).await, "b");

    // Exactly once each, and nothing for the departed peer itself.
    assert_silent(&mut rx_a).await;
    assert_silent(&mut rx_b).await;
    assert_silent(&mut rx_c).await;

    server.close().await;
}

/// Closing the server notifies peers with a reasoned `$$disconnect` and
/// fires their disconnect handlers; close and disconnect stay idempotent.
#[tokio::test]
async fn test_server_close_notifies_peers() {
    let server = Server::new();
    let addr = server.ip_listen(0).await.unwrap();

    let cl = client("watcher", MessageFormat::Json);
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel::<(String, String)>();
    cl.add_handler(MSG_DISCONNECT, move |_, m| {
        let _ = notice_tx.send((
            m.content["who"].as_str().unwrap_or_default().to_string(),
            m.content["reason"].as_str().unwrap_or_default().to_string(),
        ));
    });

    let (down_tx, mut down_rx) = mpsc::unbounded_channel::<()>();
    cl.set_disconnect_handler(move |_| {
        let _ = down_tx.send(());
    });

    cl.ip_connect("127.0.0.1", addr.port()).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    server.close().await;

    let (who, reason) = recv_one(&mut notice_rx).await;
    assert_eq!(who, MSG_YOU);
    assert_eq!(reason, "Shutting down server");

    recv_one(&mut down_rx).await;
    assert!(!cl.connected());

    // Idempotence, from any order.
    server.close().await;
    cl.disconnect();
    cl.disconnect();
    assert!(cl.write(&Message::default()).is_err());
}

/// Two in-process clients exchange messages through the server's inbox.
#[tokio::test]
async fn test_internal_to_internal_routing() {
    let server = Server::new();
    server.internal_enable();

    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();

    let receiver = client("listeners", MessageFormat::Msgpack);
    receiver.add_handler("hi", move |_, m| {
        let _ = tx.send((m.src.clone(), m.content.as_str().unwrap_or_default().to_string()));
    });
    receiver.internal_connect(&server).unwrap();

    let sender = client("talkers", MessageFormat::Msgpack);
    sender.internal_connect(&server).unwrap();
    sleep(Duration::from_millis(100)).await;

    sender
        .write(&Message {
            msg_type: "hi".to_string(),
            dest: "listeners".to_string(),
            content: json!("hello there"),
            ..Default::default()
        })
        .unwrap();

    let (src, text) = recv_one(&mut rx).await;
    assert_eq!(src, "talkers");
    assert_eq!(text, "hello there");

    server.close().await;
    assert!(!sender.connected());
    assert!(!receiver.connected());
}

/// Connecting twice fails, as does writing while unconnected.
#[tokio::test]
async fn test_connect_lifecycle_errors() {
    let server = Server::new();
    let addr = server.ip_listen(0).await.unwrap();

    let cl = client("solo", MessageFormat::Json);
    assert!(cl.write(&Message::default()).is_err());

    cl.ip_connect("127.0.0.1", addr.port()).await.unwrap();
    assert!(matches!(
        cl.ip_connect("127.0.0.1", addr.port()).await,
        Err(buxtehude::ConnectError::AlreadyConnected)
    ));

    let unconnected = client("nobody", MessageFormat::Json);
    assert!(unconnected.ip_connect("127.0.0.1", 1).await.is_err());

    server.close().await;
}
